//! TW-006: Backend keys and backend/remote-state HCL.
//!
//! Every definition's state lives at `{prefix}/{deployment}/{name}`. The key
//! table is filled once per run and never rewritten, so every remote-state
//! block addresses exactly the key its source definition writes to.

use super::codegen::quote;
use super::error::WorkerError;
use super::types::{BackendConfig, BackendType};
use indexmap::IndexMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Compute a definition's backend key.
pub fn key_for(deployment: &str, prefix: &str, definition: &str) -> String {
    let prefix = prefix.trim_matches('/');
    format!("{}/{}/{}", prefix, deployment, definition)
}

/// Run-scoped, append-only map of definition name → backend key.
#[derive(Debug, Clone, Default)]
pub struct BackendKeyTable {
    keys: IndexMap<String, String>,
}

impl BackendKeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `name`'s key. Re-inserting the same key is a no-op; a
    /// different key for a known name is rejected.
    pub fn insert(&mut self, name: &str, key: String) -> Result<(), WorkerError> {
        match self.keys.get(name) {
            Some(existing) if *existing == key => Ok(()),
            Some(existing) => Err(WorkerError::Config(format!(
                "backend key for '{}' already set to '{}', refusing '{}'",
                name, existing, key
            ))),
            None => {
                self.keys.insert(name.to_string(), key);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.keys.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Everything needed to address state for one deployment.
#[derive(Debug, Clone)]
pub struct BackendSettings<'a> {
    pub config: &'a BackendConfig,
    pub deployment: &'a str,
    /// Root directory for the local backend
    pub state_root: PathBuf,
}

impl<'a> BackendSettings<'a> {
    /// Resolve the local state root against the repository path.
    pub fn new(config: &'a BackendConfig, deployment: &'a str, repository: &Path) -> Self {
        let state_root = match config.path.as_deref() {
            Some(p) if Path::new(p).is_absolute() => PathBuf::from(p),
            Some(p) => repository.join(p),
            None => repository.join("terraform-state"),
        };
        Self {
            config,
            deployment,
            state_root,
        }
    }

    /// Key for `definition`, honoring a per-definition prefix override.
    pub fn key(&self, definition: &str, prefix_override: Option<&str>) -> String {
        let prefix = prefix_override.unwrap_or(&self.config.prefix);
        key_for(self.deployment, prefix, definition)
    }

    fn local_path(&self, key: &str) -> String {
        self.state_root
            .join(key)
            .join("terraform.tfstate")
            .to_string_lossy()
            .into_owned()
    }

    /// Attributes shared by the backend block and remote-state config.
    fn attributes(&self, key: &str, for_backend: bool) -> Vec<(&'static str, String)> {
        let cfg = self.config;
        let mut attrs = Vec::new();
        match cfg.backend_type {
            BackendType::S3 => {
                attrs.push(("bucket", quote(cfg.bucket.as_deref().unwrap_or_default())));
                attrs.push(("region", quote(cfg.region.as_deref().unwrap_or_default())));
                attrs.push(("key", quote(&format!("{}/terraform.tfstate", key))));
                if for_backend {
                    attrs.push((
                        "dynamodb_table",
                        quote(&format!("terraform-{}", self.deployment)),
                    ));
                    attrs.push(("encrypt", "true".to_string()));
                }
            }
            BackendType::Gcs => {
                attrs.push(("bucket", quote(cfg.bucket.as_deref().unwrap_or_default())));
                attrs.push(("prefix", quote(key)));
                if let Some(ref creds) = cfg.credentials {
                    attrs.push(("credentials", quote(creds)));
                }
            }
            BackendType::Local => {
                attrs.push(("path", quote(&self.local_path(key))));
            }
        }
        attrs
    }

    /// `worker-backend.tf` for the definition stored under `key`.
    pub fn render_backend(&self, key: &str) -> String {
        let mut out = String::from("terraform {\n");
        let _ = writeln!(out, "  backend {} {{", quote(&self.config.backend_type.to_string()));
        for (name, value) in self.attributes(key, true) {
            let _ = writeln!(out, "    {} = {}", name, value);
        }
        out.push_str("  }\n}\n");
        out
    }

    /// `data "terraform_remote_state"` block reading `source`'s state.
    pub fn render_remote_state(&self, source: &str, key: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "data \"terraform_remote_state\" {} {{", quote(source));
        let _ = writeln!(out, "  backend = {}", quote(&self.config.backend_type.to_string()));
        out.push_str("  config = {\n");
        for (name, value) in self.attributes(key, false) {
            let _ = writeln!(out, "    {} = {}", name, value);
        }
        out.push_str("  }\n}\n");
        out
    }
}
