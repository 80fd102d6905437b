//! TW-017: Lifecycle hook discovery and execution.
//!
//! A hook is an executable in `<workspace>/hooks` whose file stem names the
//! event (`pre_plan.sh`, `post_apply`). It runs in the workspace with
//! `<phase> <action>` as arguments and the definition's variables exported.

use super::backend::{BackendKeyTable, BackendSettings};
use super::error::WorkerError;
use super::renderer::{RenderContext, BACKEND_FILE};
use super::terraform::{self, Terraform};
use super::types::{HookEvent, HookRecord};
use crate::transport::{local::exec_command, CancelToken, CommandSpec, ExecError};
use base64::Engine as _;
use indexmap::IndexMap;
use serde_json::Value;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

const HOOKS_DIR: &str = "hooks";

/// Scratch directories for reading upstream state live under this prefix.
pub const STATE_CHECKOUT_PREFIX: &str = ".remote-state-";

/// Per-run hook options.
pub struct HookSettings<'a> {
    pub terraform: &'a Terraform,
    pub b64_encode: bool,
    pub show_output: bool,
    pub cancel: &'a CancelToken,
    /// Fallback for upstreams that have no workspace in this run
    pub state: Option<&'a StateReader<'a>>,
}

/// Locates other definitions' workspaces for remote value lookups.
pub trait WorkspaceLookup {
    fn workspace_of(&self, definition: &str) -> Option<PathBuf>;
}

impl<F> WorkspaceLookup for F
where
    F: Fn(&str) -> Option<PathBuf>,
{
    fn workspace_of(&self, definition: &str) -> Option<PathBuf> {
        self(definition)
    }
}

/// Result of looking for a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    Found(PathBuf),
    NotExecutable(PathBuf),
    Missing,
}

/// Find the script for `event` in `workspace/hooks`.
pub fn discover(workspace: &Path, event: HookEvent) -> Discovery {
    let dir = workspace.join(HOOKS_DIR);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Discovery::Missing;
    };
    let mut matches: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| p.file_stem().is_some_and(|s| s == event.as_str()))
        .collect();
    matches.sort();
    let Some(path) = matches.into_iter().next() else {
        return Discovery::Missing;
    };
    let executable = std::fs::metadata(&path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    if executable {
        Discovery::Found(path)
    } else {
        Discovery::NotExecutable(path)
    }
}

/// Environment-safe variable name: spaces and quotes removed, `-` and `.`
/// become `_`, upper-cased.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, ' ' | '"' | '\''))
        .map(|c| match c {
            '-' | '.' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

/// Render a value for the environment. Scalars are plain; lists and maps
/// are compact JSON, base64-encoded when `b64` is set.
pub fn env_value(v: &Value, b64: bool) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => {
            let json = v.to_string();
            if b64 {
                base64::engine::general_purpose::STANDARD.encode(json)
            } else {
                json
            }
        }
    }
}

/// Walk `segments` into a JSON value.
fn walk<'v, 's>(
    mut value: &'v Value,
    segments: impl Iterator<Item = &'s str>,
) -> Result<&'v Value, String> {
    for seg in segments {
        value = value
            .get(seg)
            .ok_or_else(|| format!("no attribute '{}'", seg))?;
    }
    Ok(value)
}

/// Reads an upstream's outputs straight from its backend when the upstream
/// has no workspace in this run.
pub struct StateReader<'a> {
    pub backend: &'a BackendSettings<'a>,
    pub keys: &'a BackendKeyTable,
}

impl StateReader<'_> {
    /// Initialize a scratch directory under `workspace` whose only
    /// configuration is `source`'s backend, so `terraform output` reads its state.
    pub fn checkout(
        &self,
        workspace: &Path,
        source: &str,
        settings: &HookSettings<'_>,
    ) -> Result<PathBuf, String> {
        let key = self
            .keys
            .get(source)
            .ok_or_else(|| format!("no backend key for '{}'", source))?;
        let dir = workspace.join(format!("{}{}", STATE_CHECKOUT_PREFIX, source));
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| format!("cannot remove {}: {}", dir.display(), e))?;
        }
        std::fs::create_dir_all(&dir)
            .map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;
        let backend_file = dir.join(BACKEND_FILE);
        std::fs::write(&backend_file, self.backend.render_backend(key))
            .map_err(|e| format!("cannot write {}: {}", backend_file.display(), e))?;

        tracing::debug!(source, key, "initializing state checkout");
        let out = settings
            .terraform
            .run(&dir, terraform::init_args(), settings.cancel)
            .map_err(|e| e.to_string())?;
        if !out.success() {
            return Err(format!(
                "terraform init exited with {}: {}",
                out.exit_code,
                terraform::last_lines(&out.stderr, 3)
            ));
        }
        Ok(dir)
    }
}

/// Where an upstream's outputs are read from.
enum OutputSource {
    /// The upstream's own workspace from this run
    Workspace(PathBuf),
    /// A state checkout; failures here are warnings
    State(PathBuf),
    Unavailable(String),
}

/// Read every remote var by running `terraform output` in its source's
/// workspace. Sources not run here are read from their backend state through
/// `settings.state`; when that is unavailable they are skipped with a warning.
pub fn resolve_remote_values(
    definition: &str,
    workspace: &Path,
    ctx: &RenderContext,
    lookup: &dyn WorkspaceLookup,
    settings: &HookSettings<'_>,
) -> Result<(IndexMap<String, Value>, Vec<String>), WorkerError> {
    let mut values = IndexMap::new();
    let mut warnings = Vec::new();
    let mut sources: IndexMap<String, OutputSource> = IndexMap::new();
    let mut outputs: IndexMap<(String, String), Value> = IndexMap::new();

    for (local, reference) in &ctx.remote_vars {
        let source = sources.entry(reference.source.clone()).or_insert_with(|| {
            if let Some(ws) = lookup.workspace_of(&reference.source) {
                return OutputSource::Workspace(ws);
            }
            let Some(reader) = settings.state else {
                return OutputSource::Unavailable(format!("'{}' was not run", reference.source));
            };
            match reader.checkout(workspace, &reference.source, settings) {
                Ok(dir) => OutputSource::State(dir),
                Err(cause) => OutputSource::Unavailable(format!(
                    "cannot read state of '{}': {}",
                    reference.source, cause
                )),
            }
        });
        let omit = |reason: &str, warnings: &mut Vec<String>| {
            let msg = format!(
                "remote value '{}' for '{}' omitted from hook environment: {}",
                local, definition, reason
            );
            tracing::warn!("{}", msg);
            warnings.push(msg);
        };
        let (dir, from_state) = match source {
            OutputSource::Workspace(dir) => (dir.clone(), false),
            OutputSource::State(dir) => (dir.clone(), true),
            OutputSource::Unavailable(reason) => {
                omit(reason, &mut warnings);
                continue;
            }
        };

        let cache_key = (reference.source.clone(), reference.output_name().to_string());
        if !outputs.contains_key(&cache_key) {
            match settings
                .terraform
                .output(&dir, reference.output_name(), settings.cancel)
            {
                Ok(v) => {
                    outputs.insert(cache_key.clone(), v);
                }
                Err(cause) if from_state => {
                    omit(&cause, &mut warnings);
                    continue;
                }
                Err(cause) => {
                    return Err(WorkerError::RemoteState {
                        definition: definition.to_string(),
                        reference: reference.to_string(),
                        cause,
                    })
                }
            }
        }
        let Some(root) = outputs.get(&cache_key) else {
            continue;
        };
        let value = walk(root, reference.nested_segments()).map_err(|cause| {
            WorkerError::RemoteState {
                definition: definition.to_string(),
                reference: reference.to_string(),
                cause,
            }
        })?;
        values.insert(local.clone(), value.clone());
    }

    Ok((values, warnings))
}

/// Build the hook's environment on top of the terraform environment.
pub fn hook_env(
    ctx: &RenderContext,
    remote: &IndexMap<String, Value>,
    settings: &HookSettings<'_>,
) -> Vec<(String, String)> {
    let mut env = settings.terraform.env.clone();
    let mut set = |k: String, v: String| match env.iter_mut().find(|(ek, _)| *ek == k) {
        Some(slot) => slot.1 = v,
        None => env.push((k, v)),
    };
    set("TF_PATH".into(), settings.terraform.bin.display().to_string());
    for (name, value) in &ctx.vars {
        set(
            format!("TF_VAR_{}", sanitize_name(name)),
            env_value(value, settings.b64_encode),
        );
    }
    for (name, value) in remote {
        set(
            format!("TF_REMOTE_{}", sanitize_name(name)),
            env_value(value, settings.b64_encode),
        );
    }
    env
}

/// Run the hook for `event` if one exists and append its record to
/// `history`. Returns warnings; a non-zero exit is fatal.
pub fn run_hook(
    definition: &str,
    workspace: &Path,
    event: HookEvent,
    ctx: &RenderContext,
    lookup: &dyn WorkspaceLookup,
    settings: &HookSettings<'_>,
    history: &mut Vec<HookRecord>,
) -> Result<Vec<String>, WorkerError> {
    let script = match discover(workspace, event) {
        Discovery::Missing => return Ok(Vec::new()),
        Discovery::NotExecutable(path) => {
            let msg = format!(
                "hook {} for '{}' is not executable, skipping",
                path.display(),
                definition
            );
            tracing::warn!("{}", msg);
            return Ok(vec![msg]);
        }
        Discovery::Found(path) => path,
    };

    let (remote, warnings) = resolve_remote_values(definition, workspace, ctx, lookup, settings)?;
    let spec = CommandSpec::new(&script, workspace)
        .args([event.phase(), event.step().to_string().as_str()])
        .envs(hook_env(ctx, &remote, settings))
        .echo(settings.show_output);

    tracing::info!(definition, hook = %event, "running hook");
    let started = Instant::now();
    let exit_code = match exec_command(&spec, settings.cancel) {
        Ok(out) => out.exit_code,
        Err(ExecError::Cancelled { .. }) => {
            return Err(WorkerError::Cancelled {
                definition: definition.to_string(),
                step: event.step(),
            })
        }
        Err(e) => {
            tracing::warn!(definition, hook = %event, "hook could not run: {}", e);
            -1
        }
    };
    history.push(HookRecord {
        event,
        script: script.clone(),
        exit_code,
        duration: started.elapsed(),
    });
    if exit_code != 0 {
        return Err(WorkerError::Hook {
            definition: definition.to_string(),
            event,
            script,
            exit_code,
        });
    }
    Ok(warnings)
}
