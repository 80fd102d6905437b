//! TW-016: Terraform invocation: arguments, environment, exit codes.

use super::env::EnvProvider;
use super::error::WorkerError;
use super::types::{PlanOutcome, Step};
use crate::transport::{local::exec_command, CancelToken, CommandSpec, ExecError, ExecOutput};
use regex::Regex;
use std::path::{Path, PathBuf};

/// stderr fragments that indicate a retryable backend problem.
const TRANSIENT_PATTERN: &str = concat!(
    r"(?i)(error acquiring the state lock",
    r"|connection reset by peer|connection refused|i/o timeout|tls handshake timeout",
    r"|context deadline exceeded|request timeout|requesttimeout",
    r"|throttling|rate exceeded|too many requests|requestlimitexceeded|slowdown",
    r"|(status ?code|api error|http(/\d(\.\d)?)?)[: ]+5\d\d",
    r"|\b50[0234] (internal server error|bad gateway|service unavailable|gateway time-?out)",
    r"|service unavailable)",
);

pub fn init_args() -> Vec<String> {
    vec!["init".into(), "-input=false".into(), "-no-color".into()]
}

pub fn plan_args(plan_file: &Path, destroy: bool) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "plan".into(),
        "-input=false".into(),
        "-no-color".into(),
        "-detailed-exitcode".into(),
        format!("-out={}", plan_file.display()),
    ];
    if destroy {
        args.push("-destroy".into());
    }
    args
}

pub fn apply_args(plan_file: &Path) -> Vec<String> {
    vec![
        "apply".into(),
        "-input=false".into(),
        "-no-color".into(),
        "-auto-approve".into(),
        plan_file.display().to_string(),
    ]
}

pub fn destroy_args() -> Vec<String> {
    vec![
        "destroy".into(),
        "-input=false".into(),
        "-no-color".into(),
        "-auto-approve".into(),
    ]
}

pub fn output_args(name: &str) -> Vec<String> {
    vec!["output".into(), "-json".into(), name.to_string()]
}

/// Recognizes transient backend failures in stderr.
#[derive(Debug, Clone)]
pub struct TransientMatcher {
    pattern: Regex,
}

impl TransientMatcher {
    pub fn new() -> Result<Self, WorkerError> {
        let pattern = Regex::new(TRANSIENT_PATTERN)
            .map_err(|e| WorkerError::Config(format!("bad transient pattern: {}", e)))?;
        Ok(Self { pattern })
    }

    pub fn is_transient(&self, stderr: &str) -> bool {
        self.pattern.is_match(stderr)
    }
}

/// Interpret a `plan -detailed-exitcode` result.
pub fn classify_plan(definition: &str, out: &ExecOutput) -> Result<PlanOutcome, WorkerError> {
    PlanOutcome::from_exit_code(out.exit_code).ok_or_else(|| WorkerError::Execution {
        definition: definition.to_string(),
        step: Step::Plan,
        exit_code: Some(out.exit_code),
        detail: last_lines(&out.stderr, 5),
    })
}

/// The tail of captured output, for error messages.
pub fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Runs the terraform binary with a fixed environment.
#[derive(Debug, Clone)]
pub struct Terraform {
    pub bin: PathBuf,
    pub env: Vec<(String, String)>,
    pub echo: bool,
}

impl Terraform {
    /// Ambient env plus automation markers.
    pub fn new(
        bin: &Path,
        env: &dyn EnvProvider,
        plugin_cache_dir: Option<&Path>,
        echo: bool,
    ) -> Self {
        let mut vars = env.vars();
        vars.retain(|(k, _)| k != "TF_IN_AUTOMATION" && k != "TF_PLUGIN_CACHE_DIR");
        vars.push(("TF_IN_AUTOMATION".into(), "1".into()));
        if let Some(dir) = plugin_cache_dir {
            vars.push(("TF_PLUGIN_CACHE_DIR".into(), dir.display().to_string()));
        }
        Self {
            bin: bin.to_path_buf(),
            env: vars,
            echo,
        }
    }

    pub fn command(&self, cwd: &Path, args: Vec<String>) -> CommandSpec {
        CommandSpec::new(&self.bin, cwd)
            .args(args)
            .envs(self.env.clone())
            .echo(self.echo)
    }

    pub fn run(
        &self,
        cwd: &Path,
        args: Vec<String>,
        cancel: &CancelToken,
    ) -> Result<ExecOutput, ExecError> {
        exec_command(&self.command(cwd, args), cancel)
    }

    /// `terraform output -json <name>` in `cwd`, parsed.
    pub fn output(
        &self,
        cwd: &Path,
        name: &str,
        cancel: &CancelToken,
    ) -> Result<serde_json::Value, String> {
        let spec = self.command(cwd, output_args(name)).echo(false);
        let out = exec_command(&spec, cancel).map_err(|e| e.to_string())?;
        if !out.success() {
            return Err(format!(
                "terraform output exited with {}: {}",
                out.exit_code,
                last_lines(&out.stderr, 3)
            ));
        }
        serde_json::from_str(out.stdout.trim())
            .map_err(|e| format!("output '{}' is not valid JSON: {}", name, e))
    }
}

/// Resolve `--terraform-bin`: explicit paths must exist, bare names are
/// looked up on PATH.
pub fn locate_binary(bin: &Path, env: &dyn EnvProvider) -> Result<PathBuf, WorkerError> {
    if bin.components().count() > 1 || bin.is_absolute() {
        return if bin.is_file() {
            Ok(bin.to_path_buf())
        } else {
            Err(WorkerError::Config(format!(
                "terraform binary {} not found",
                bin.display()
            )))
        };
    }
    let path = env.var("PATH").unwrap_or_default();
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    which::which_in(bin, Some(path), cwd).map_err(|e| {
        WorkerError::Config(format!("terraform binary '{}' not found on PATH: {}", bin.display(), e))
    })
}
