//! TW-015: Definition rendering.
//!
//! A rendered workspace is the copied module source plus four generated
//! files. Generation is a pure function of the definition, the merged
//! variables, and the key table; only the copy touches the outside world.

use super::backend::{BackendKeyTable, BackendSettings};
use super::codegen;
use super::copier::{self, Copier};
use super::env::EnvProvider;
use super::error::WorkerError;
use super::hasher;
use super::reference::RemoteReference;
use super::types::{Definition, WorkerConfig};
use indexmap::IndexMap;
use serde_json::Value;
use std::path::{Path, PathBuf};

pub const PROVIDERS_FILE: &str = "worker-providers.tf";
pub const BACKEND_FILE: &str = "worker-backend.tf";
pub const TFVARS_FILE: &str = "worker.auto.tfvars";
pub const LOCALS_FILE: &str = "worker-locals.tf";

/// Variables visible to one definition.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    /// Globals (filtered) overridden by definition vars
    pub vars: IndexMap<String, Value>,
    /// Local name → remote output reference
    pub remote_vars: IndexMap<String, RemoteReference>,
}

impl RenderContext {
    /// Merge global and definition variables for `def`.
    pub fn build(config: &WorkerConfig, def: &Definition) -> Self {
        let mut vars: IndexMap<String, Value> = config
            .terraform_vars
            .iter()
            .filter(|(k, _)| {
                def.use_global_terraform_vars.is_empty()
                    || def.use_global_terraform_vars.contains(*k)
            })
            .filter(|(k, _)| !def.ignored_global_terraform_vars.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in &def.terraform_vars {
            vars.insert(k.clone(), v.clone());
        }
        Self {
            vars,
            remote_vars: def.remote_vars.clone(),
        }
    }
}

/// Inputs shared by every render in a run.
pub struct RenderSettings<'a> {
    pub config: &'a WorkerConfig,
    pub backend: &'a BackendSettings<'a>,
    pub repository: &'a Path,
    pub env: &'a dyn EnvProvider,
}

/// A workspace on disk and the digests of what was generated into it.
#[derive(Debug, Clone)]
pub struct RenderedWorkspace {
    pub path: PathBuf,
    /// File name → BLAKE3 digest; `source` covers the copied module
    pub artifacts: IndexMap<String, String>,
}

fn render_err(def: &Definition, cause: impl Into<String>) -> WorkerError {
    WorkerError::Render {
        definition: def.name.clone(),
        cause: cause.into(),
    }
}

/// Generate artifact contents without touching the filesystem.
pub fn render_artifacts(
    def: &Definition,
    ctx: &RenderContext,
    keys: &BackendKeyTable,
    settings: &RenderSettings<'_>,
) -> Result<Vec<(&'static str, String)>, WorkerError> {
    let key = keys
        .get(&def.name)
        .ok_or_else(|| render_err(def, "no backend key assigned"))?;

    let mut files = vec![
        (
            PROVIDERS_FILE,
            codegen::render_providers(&settings.config.providers, def.providers.as_deref()),
        ),
        (BACKEND_FILE, settings.backend.render_backend(key)),
        (TFVARS_FILE, codegen::render_tfvars(&ctx.vars)),
    ];

    if !ctx.remote_vars.is_empty() {
        let mut locals = String::new();
        let mut seen: Vec<&str> = Vec::new();
        for reference in ctx.remote_vars.values() {
            if seen.contains(&reference.source.as_str()) {
                continue;
            }
            seen.push(&reference.source);
            let source_key = keys.get(&reference.source).ok_or_else(|| {
                render_err(
                    def,
                    format!("no backend key for upstream '{}'", reference.source),
                )
            })?;
            locals.push_str(&settings.backend.render_remote_state(&reference.source, source_key));
            locals.push('\n');
        }
        locals.push_str(&codegen::render_locals(&ctx.remote_vars));
        files.push((LOCALS_FILE, locals));
    }

    Ok(files)
}

/// Render `def` into `dest`, replacing any stale directory.
pub fn render(
    def: &Definition,
    ctx: &RenderContext,
    keys: &BackendKeyTable,
    settings: &RenderSettings<'_>,
    dest: &Path,
) -> Result<RenderedWorkspace, WorkerError> {
    let files = render_artifacts(def, ctx, keys, settings)?;

    if dest.exists() {
        std::fs::remove_dir_all(dest)
            .map_err(|e| render_err(def, format!("cannot remove stale {}: {}", dest.display(), e)))?;
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| render_err(def, format!("cannot create {}: {}", parent.display(), e)))?;
    }

    let source: Box<dyn Copier> =
        copier::copier_for(def, settings.repository, settings.env).map_err(|e| render_err(def, e))?;
    tracing::debug!(definition = %def.name, source = %source.describe(), "copying module");
    source.copy_to(dest).map_err(|e| render_err(def, e))?;

    let mut artifacts = IndexMap::new();
    artifacts.insert(
        "source".to_string(),
        hasher::hash_directory(dest).map_err(|e| render_err(def, e))?,
    );
    for (name, content) in &files {
        let path = dest.join(name);
        std::fs::write(&path, content)
            .map_err(|e| render_err(def, format!("cannot write {}: {}", path.display(), e)))?;
        artifacts.insert(name.to_string(), hasher::hash_string(content));
    }

    Ok(RenderedWorkspace {
        path: dest.to_path_buf(),
        artifacts,
    })
}

/// Copy the shared module directory into the run root once.
///
/// An explicitly configured directory must exist; the implicit
/// `<repository>/terraform-modules` is optional.
pub fn prepare_modules(
    configured: Option<&Path>,
    repository: &Path,
    dest: &Path,
) -> Result<Option<PathBuf>, WorkerError> {
    let module_err = |cause: String| WorkerError::Render {
        definition: "terraform-modules".to_string(),
        cause,
    };
    let source = match configured {
        Some(dir) => {
            let dir = if dir.is_absolute() {
                dir.to_path_buf()
            } else {
                repository.join(dir)
            };
            if !dir.is_dir() {
                return Err(module_err(format!(
                    "modules directory {} does not exist",
                    dir.display()
                )));
            }
            dir
        }
        None => {
            let default = repository.join("terraform-modules");
            if !default.is_dir() {
                return Ok(None);
            }
            default
        }
    };

    let _ = std::fs::remove_dir_all(dest);
    let ignore = copier::ignore_patterns(&copier::MODULES_IGNORE).map_err(module_err)?;
    copier::copy_tree(&source, dest, &ignore).map_err(module_err)?;
    tracing::info!(from = %source.display(), "copied shared terraform modules");
    Ok(Some(dest.to_path_buf()))
}
