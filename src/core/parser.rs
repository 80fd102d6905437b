//! TW-003: worker.yaml parsing and validation.
//!
//! Parses worker.yaml (after templating) and validates structural constraints:
//! - Version must be "1.0"
//! - Definition names are identifiers (they become directory names)
//! - Provider subsets name configured providers
//! - Backend types carry their required fields

use super::env::EnvProvider;
use super::error::WorkerError;
use super::reference::is_identifier;
use super::template::resolve_template;
use super::types::*;
use indexmap::IndexMap;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Read, template, and parse a worker.yaml from disk.
pub fn parse_config_file(
    path: &Path,
    vars: &IndexMap<String, String>,
    env: &dyn EnvProvider,
) -> Result<WorkerConfig, WorkerError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        WorkerError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    let content = resolve_template(&raw, vars, env)
        .map_err(|e| WorkerError::Config(format!("{}: {}", path.display(), e)))?;
    parse_config(&content)
}

/// Parse a worker.yaml from a string. Definition names come from map keys.
pub fn parse_config(yaml: &str) -> Result<WorkerConfig, WorkerError> {
    let mut config: WorkerConfig = serde_yaml_ng::from_str(yaml)
        .map_err(|e| WorkerError::Config(format!("YAML parse error: {}", e)))?;
    for (name, def) in config.definitions.iter_mut() {
        def.name = name.clone();
    }
    Ok(config)
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &WorkerConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut push = |message: String| errors.push(ValidationError { message });

    if config.version != "1.0" {
        push(format!(
            "version must be \"1.0\", got \"{}\"",
            config.version
        ));
    }

    if config.definitions.is_empty() {
        push("no definitions configured".to_string());
    }

    match config.backend.backend_type {
        BackendType::S3 => {
            if config.backend.bucket.is_none() {
                push("backend 's3' requires 'bucket'".to_string());
            }
            if config.backend.region.is_none() {
                push("backend 's3' requires 'region'".to_string());
            }
        }
        BackendType::Gcs => {
            if config.backend.bucket.is_none() {
                push("backend 'gcs' requires 'bucket'".to_string());
            }
        }
        BackendType::Local => {}
    }
    if config.backend.prefix.trim_matches('/').is_empty() {
        push("backend prefix must not be empty".to_string());
    }

    for (name, provider) in &config.providers {
        if provider.requirements.version.trim().is_empty() {
            push(format!("provider '{}' has an empty version", name));
        }
    }

    for (name, def) in &config.definitions {
        if name.trim().is_empty() {
            push("definition name must not be empty".to_string());
        } else if name.contains(',') {
            push(format!("definition name '{}' must not contain ','", name));
        } else if !is_identifier(name) {
            push(format!(
                "definition name '{}' must start with a letter or '_' and use only letters, digits, '_' or '-'",
                name
            ));
        }
        if def.path.trim().is_empty() {
            push(format!("definition '{}' has no path", name));
        }
        if let Some(ref subset) = def.providers {
            for p in subset {
                if !config.providers.contains_key(p) {
                    push(format!(
                        "definition '{}' uses unknown provider '{}'",
                        name, p
                    ));
                }
            }
        }
        if let Some(ref prefix) = def.backend_prefix {
            if prefix.trim_matches('/').is_empty() {
                push(format!("definition '{}' has an empty backend_prefix", name));
            }
        }
        for key in def.terraform_vars.keys().chain(def.remote_vars.keys()) {
            if key.trim().is_empty() {
                push(format!("definition '{}' has an empty variable name", name));
            }
        }
        for key in def.remote_vars.keys() {
            if def.terraform_vars.contains_key(key) {
                push(format!(
                    "definition '{}' declares '{}' as both terraform and remote var",
                    name, key
                ));
            }
        }
    }

    errors
}

/// Collapse validation errors into one configuration error.
pub fn ensure_valid(config: &WorkerConfig) -> Result<(), WorkerError> {
    let errors = validate_config(config);
    if errors.is_empty() {
        return Ok(());
    }
    let joined: Vec<String> = errors.iter().map(|e| e.message.clone()).collect();
    Err(WorkerError::Config(joined.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::env::StaticEnv;

    const VALID: &str = r#"
version: "1.0"
backend:
  type: s3
  bucket: tf-state
  region: us-west-2
providers:
  aws:
    requirements:
      version: "5.40.0"
definitions:
  tags:
    path: definitions/tags
  network:
    path: definitions/network
    providers: [aws]
    remote_vars:
      tag_map: tags.outputs.tag_map
"#;

    #[test]
    fn test_tw003_parse_valid() {
        let config = parse_config(VALID).unwrap();
        assert_eq!(config.definitions["network"].name, "network");
        let errors = validate_config(&config);
        assert!(
            errors.is_empty(),
            "unexpected errors: {:?}",
            errors.iter().map(|e| &e.message).collect::<Vec<_>>()
        );
        assert!(ensure_valid(&config).is_ok());
    }

    #[test]
    fn test_tw003_bad_version() {
        let yaml = VALID.replace("\"1.0\"", "\"2.0\"");
        let config = parse_config(&yaml).unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("version")));
    }

    #[test]
    fn test_tw003_unknown_provider_subset() {
        let yaml = VALID.replace("providers: [aws]", "providers: [gcp]");
        let config = parse_config(&yaml).unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("unknown provider 'gcp'")));
    }

    #[test]
    fn test_tw003_s3_requires_region() {
        let yaml = VALID.replace("  region: us-west-2\n", "");
        let config = parse_config(&yaml).unwrap();
        let err = ensure_valid(&config).unwrap_err();
        assert!(err.to_string().contains("requires 'region'"));
    }

    #[test]
    fn test_tw003_comma_in_name() {
        let yaml = VALID.replace("  tags:\n", "  \"a,b\":\n");
        let config = parse_config(&yaml).unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("','")));
    }

    #[test]
    fn test_tw003_name_must_be_identifier() {
        for bad in ["..", "../escape", "a/b", "9lives", "-x"] {
            let yaml = VALID.replace("  tags:\n", &format!("  \"{}\":\n", bad));
            let config = parse_config(&yaml).unwrap();
            let errors = validate_config(&config);
            assert!(
                errors.iter().any(|e| e.message.contains("must start with a letter")),
                "{} accepted",
                bad
            );
        }
    }

    #[test]
    fn test_tw003_malformed_reference_is_parse_error() {
        let yaml = VALID.replace("tags.outputs.tag_map", "tags.tag_map");
        let err = parse_config(&yaml).unwrap_err();
        assert!(err.is_graph_error());
        assert!(err.to_string().contains("invalid remote reference"));
    }

    #[test]
    fn test_tw003_var_declared_twice() {
        let yaml = VALID.replace(
            "    remote_vars:\n",
            "    terraform_vars:\n      tag_map: x\n    remote_vars:\n",
        );
        let config = parse_config(&yaml).unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("both terraform and remote")));
    }

    #[test]
    fn test_tw003_no_definitions() {
        let yaml = r#"
version: "1.0"
backend:
  type: local
definitions: {}
"#;
        let config = parse_config(yaml).unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("no definitions")));
    }

    #[test]
    fn test_tw003_parse_file_with_templates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.yaml");
        let yaml = VALID
            .replace("tf-state", "{{ env.STATE_BUCKET }}")
            .replace("us-west-2", "{{ var.region }}");
        std::fs::write(&path, yaml).unwrap();

        let env = StaticEnv::new().with("STATE_BUCKET", "from-env");
        let mut vars = IndexMap::new();
        vars.insert("region".to_string(), "eu-west-1".to_string());
        let config = parse_config_file(&path, &vars, &env).unwrap();
        assert_eq!(config.backend.bucket.as_deref(), Some("from-env"));
        assert_eq!(config.backend.region.as_deref(), Some("eu-west-1"));
    }

    #[test]
    fn test_tw003_parse_file_missing() {
        let err = parse_config_file(
            Path::new("/nonexistent/worker.yaml"),
            &IndexMap::new(),
            &StaticEnv::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
