//! TW-018: Executor: orchestration loop for a deployment.
//!
//! graph → limit projection → key table → run root → for each definition:
//! render → init → plan → apply/destroy/skip, with hooks around every step.
//! The first failure stops the run; cleanup runs on every exit path.

use super::backend::{BackendKeyTable, BackendSettings};
use super::env::EnvProvider;
use super::error::WorkerError;
use super::hooks::{self, HookSettings, StateReader};
use super::parser;
use super::renderer::{self, RenderContext, RenderSettings};
use super::resolver::{self, Projection};
use super::retry::RetryPolicy;
use super::terraform::{self, Terraform, TransientMatcher};
use super::types::*;
use super::workspace::{RunRoot, Workspace};
use crate::transport::{CancelToken, ExecError, ExecOutput};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Configuration for one run.
pub struct RunConfig<'a> {
    pub config: &'a WorkerConfig,
    pub options: &'a RunOptions,
    pub env: &'a dyn EnvProvider,
    pub cancel: &'a CancelToken,
}

/// Check options that do not depend on the graph.
fn check_options(options: &RunOptions) -> Result<(), WorkerError> {
    if options.apply && options.destroy {
        return Err(WorkerError::Config(
            "--apply and --destroy are mutually exclusive".to_string(),
        ));
    }
    let d = &options.deployment;
    if d.is_empty() || d.contains('/') || d.chars().any(char::is_whitespace) {
        return Err(WorkerError::Config(format!(
            "deployment name '{}' must be non-empty without '/' or whitespace",
            d
        )));
    }
    Ok(())
}

/// Validate, order, and project. Nothing touches the filesystem.
pub fn resolve_order(
    config: &WorkerConfig,
    limit: &[String],
) -> Result<(Vec<String>, Projection), WorkerError> {
    parser::ensure_valid(config)?;
    let order = resolver::build_execution_order(&config.definitions)?;
    let projection = resolver::project_limit(&order, &config.definitions, limit)?;
    Ok((order, projection))
}

/// Assign keys to every selected definition and every excluded upstream.
fn build_key_table(
    config: &WorkerConfig,
    backend: &BackendSettings<'_>,
    projection: &Projection,
) -> Result<BackendKeyTable, WorkerError> {
    let mut keys = BackendKeyTable::new();
    let names = projection
        .selected
        .iter()
        .chain(projection.excluded_upstream.iter().map(|(_, up)| up));
    for name in names {
        let prefix = config
            .definition(name)
            .and_then(|d| d.backend_prefix.as_deref());
        keys.insert(name, backend.key(name, prefix))?;
    }
    Ok(keys)
}

/// One terraform subcommand and how to judge it.
struct Invocation {
    step: Step,
    args: Vec<String>,
    policy: RetryPolicy,
    /// Exit codes counted as success
    accept: fn(i32) -> bool,
}

impl Invocation {
    fn once(step: Step, args: Vec<String>) -> Self {
        Self {
            step,
            args,
            policy: RetryPolicy::none(),
            accept: |code| code == 0,
        }
    }
}

/// Why a terraform step did not succeed.
enum StepFailure {
    Exit(ExecOutput),
    Exec(ExecError),
}

/// Per-run state shared by every definition.
struct Orchestrator<'a> {
    cfg: &'a RunConfig<'a>,
    keys: &'a BackendKeyTable,
    state: &'a StateReader<'a>,
    render: RenderSettings<'a>,
    terraform: &'a Terraform,
    transient: &'a TransientMatcher,
    root: &'a RunRoot,
}

type StepResult<T> = Result<T, (Step, WorkerError)>;

impl Orchestrator<'_> {
    fn check_cancel(&self, name: &str, step: Step) -> StepResult<()> {
        if self.cfg.cancel.is_cancelled() {
            return Err((
                step,
                WorkerError::Cancelled {
                    definition: name.to_string(),
                    step,
                },
            ));
        }
        Ok(())
    }

    fn hook_settings(&self) -> HookSettings<'_> {
        HookSettings {
            terraform: self.terraform,
            b64_encode: self.cfg.options.b64_encode_hook_values,
            show_output: self.cfg.options.show_output,
            cancel: self.cfg.cancel,
            state: Some(self.state),
        }
    }

    fn hook(
        &self,
        name: &str,
        event: HookEvent,
        ctx: &RenderContext,
        workspaces: &IndexMap<String, Workspace>,
        record: &mut ExecutionRecord,
        warnings: &mut Vec<String>,
    ) -> StepResult<()> {
        let Some(ws) = workspaces.get(name) else {
            return Ok(());
        };
        let lookup = |n: &str| workspaces.get(n).map(|w| w.path().to_path_buf());
        let settings = self.hook_settings();
        let hook_warnings = hooks::run_hook(
            name,
            ws.path(),
            event,
            ctx,
            &lookup,
            &settings,
            &mut record.hooks,
        )
        .map_err(|e| (event.step(), e))?;
        warnings.extend(hook_warnings);
        Ok(())
    }

    /// Run one terraform subcommand, retrying transient failures when the
    /// invocation's policy allows.
    fn step(
        &self,
        name: &str,
        cwd: &Path,
        invocation: Invocation,
        record: &mut ExecutionRecord,
    ) -> StepResult<ExecOutput> {
        let Invocation {
            step,
            args,
            policy,
            accept,
        } = invocation;
        self.check_cancel(name, step)?;
        tracing::info!(definition = name, %step, "terraform {}", step);
        let started = Instant::now();
        let cancel = self.cfg.cancel;

        let (result, attempts) = policy.run(
            cancel,
            |attempt| {
                if attempt > 1 {
                    tracing::info!(definition = name, %step, attempt, "retrying");
                }
                match self.terraform.run(cwd, args.clone(), cancel) {
                    Ok(out) if accept(out.exit_code) => Ok(out),
                    Ok(out) => Err(StepFailure::Exit(out)),
                    Err(e) => Err(StepFailure::Exec(e)),
                }
            },
            |f: &StepFailure| {
                matches!(f, StepFailure::Exit(out) if self.transient.is_transient(&out.stderr))
            },
        );

        let captured = match &result {
            Ok(out) | Err(StepFailure::Exit(out)) => Some(out),
            Err(StepFailure::Exec(_)) => None,
        };
        record.steps.push(StepRecord {
            step,
            exit_code: captured.map(|o| o.exit_code),
            stdout: captured.map(ExecOutput::stdout_lines).unwrap_or_default(),
            stderr: captured.map(ExecOutput::stderr_lines).unwrap_or_default(),
            attempts,
            duration: started.elapsed(),
        });

        let definition = name.to_string();
        result.map_err(|failure| {
            let err = match failure {
                StepFailure::Exec(ExecError::Cancelled { .. }) => {
                    WorkerError::Cancelled { definition, step }
                }
                StepFailure::Exec(e) => WorkerError::Execution {
                    definition,
                    step,
                    exit_code: None,
                    detail: e.to_string(),
                },
                StepFailure::Exit(out)
                    if policy.max_attempts > 1 && self.transient.is_transient(&out.stderr) =>
                {
                    WorkerError::Backend {
                        definition,
                        step,
                        attempts,
                        detail: terraform::last_lines(&out.stderr, 5),
                    }
                }
                StepFailure::Exit(out) => WorkerError::Execution {
                    definition,
                    step,
                    exit_code: Some(out.exit_code),
                    detail: terraform::last_lines(&out.stderr, 5),
                },
            };
            (step, err)
        })
    }

    /// Drive one definition from Pending to its outcome.
    fn execute(
        &self,
        def: &Definition,
        record: &mut ExecutionRecord,
        workspaces: &mut IndexMap<String, Workspace>,
        warnings: &mut Vec<String>,
    ) -> StepResult<()> {
        let name = def.name.as_str();
        let options = self.cfg.options;
        let advance = |record: &mut ExecutionRecord, step: Step, next: LifecycleStatus| {
            record.transition(next).map_err(|e| (step, e))
        };

        // render
        self.check_cancel(name, Step::Render)?;
        tracing::info!(definition = name, "rendering");
        let ctx = RenderContext::build(self.cfg.config, def);
        let dest = self.root.definition_dir(name);
        let rendered = renderer::render(def, &ctx, self.keys, &self.render, &dest)
            .map_err(|e| (Step::Render, e))?;
        record.backend_key = self.keys.get(name).map(str::to_string);
        record.workspace = Some(rendered.path.clone());
        record.artifacts = rendered.artifacts;
        let ws = Workspace::adopt(rendered.path, !options.clean);
        let cwd = ws.path().to_path_buf();
        let plan_file = ws.plan_file();
        workspaces.insert(name.to_string(), ws);
        advance(record, Step::Render, LifecycleStatus::Rendered)?;

        // init
        self.hook(name, HookEvent::PreInit, &ctx, workspaces, record, warnings)?;
        let init = Invocation {
            policy: options.retry,
            ..Invocation::once(Step::Init, terraform::init_args())
        };
        self.step(name, &cwd, init, record)?;
        self.hook(name, HookEvent::PostInit, &ctx, workspaces, record, warnings)?;
        advance(record, Step::Init, LifecycleStatus::Initialized)?;

        // plan
        let mode = options.mode();
        self.hook(name, HookEvent::PrePlan, &ctx, workspaces, record, warnings)?;
        let plan = Invocation {
            accept: |code| PlanOutcome::from_exit_code(code).is_some(),
            ..Invocation::once(
                Step::Plan,
                terraform::plan_args(&plan_file, mode == RunMode::Destroy),
            )
        };
        let out = self.step(name, &cwd, plan, record)?;
        let outcome = terraform::classify_plan(name, &out).map_err(|e| (Step::Plan, e))?;
        record.plan = Some(outcome);
        self.hook(name, HookEvent::PostPlan, &ctx, workspaces, record, warnings)?;
        advance(record, Step::Plan, LifecycleStatus::Planned)?;
        tracing::info!(
            definition = name,
            changes = outcome == PlanOutcome::Changes,
            "plan complete"
        );

        // apply / destroy / skip
        let changes = outcome == PlanOutcome::Changes;
        match mode {
            RunMode::Apply if changes || options.force || def.always_apply => {
                self.hook(name, HookEvent::PreApply, &ctx, workspaces, record, warnings)?;
                let apply = Invocation::once(Step::Apply, terraform::apply_args(&plan_file));
                self.step(name, &cwd, apply, record)?;
                self.hook(name, HookEvent::PostApply, &ctx, workspaces, record, warnings)?;
                advance(record, Step::Apply, LifecycleStatus::Applied)
            }
            RunMode::Destroy if changes || options.force => {
                self.hook(name, HookEvent::PreDestroy, &ctx, workspaces, record, warnings)?;
                let destroy = Invocation::once(Step::Destroy, terraform::destroy_args());
                self.step(name, &cwd, destroy, record)?;
                self.hook(name, HookEvent::PostDestroy, &ctx, workspaces, record, warnings)?;
                advance(record, Step::Destroy, LifecycleStatus::Destroyed)
            }
            _ => {
                tracing::info!(definition = name, "skipping apply");
                advance(record, Step::Plan, LifecycleStatus::Skipped)
            }
        }
    }
}

/// Remove workspaces and the run root; failures become warnings.
fn cleanup(
    root: RunRoot,
    workspaces: IndexMap<String, Workspace>,
    records: &mut IndexMap<String, ExecutionRecord>,
    warnings: &mut Vec<String>,
) -> Option<PathBuf> {
    if root.retained() {
        let path = root.path().to_path_buf();
        tracing::info!(root = %path.display(), "workspaces retained");
        return Some(path);
    }
    for (name, ws) in workspaces {
        match ws.close() {
            Ok(()) => {
                if let Some(record) = records.get_mut(&name) {
                    if let Err(e) = record.transition(LifecycleStatus::Cleaned) {
                        tracing::warn!("{}", e);
                    }
                }
            }
            Err(e) => {
                let msg = format!("cleanup of '{}' failed: {}", name, e);
                tracing::warn!("{}", msg);
                warnings.push(msg);
            }
        }
    }
    if let Err(e) = root.close() {
        let msg = format!("cleanup of run root failed: {}", e);
        tracing::warn!("{}", msg);
        warnings.push(msg);
    }
    None
}

/// Execute a deployment. Graph and configuration errors return `Err`;
/// per-definition failures are reported in the `RunReport`.
pub fn run(cfg: &RunConfig<'_>) -> Result<RunReport, WorkerError> {
    let start = Instant::now();
    let options = cfg.options;
    check_options(options)?;

    let (order, projection) = resolve_order(cfg.config, &options.limit)?;
    for w in &projection.warnings {
        tracing::warn!("{}", w);
    }

    let backend = BackendSettings::new(
        &cfg.config.backend,
        &options.deployment,
        &options.repository_path,
    );
    let keys = build_key_table(cfg.config, &backend, &projection)?;
    let transient = TransientMatcher::new()?;
    let bin = terraform::locate_binary(&options.terraform_bin, cfg.env)?;
    if let Some(ref dir) = options.plugin_cache_dir {
        std::fs::create_dir_all(dir).map_err(|e| WorkerError::workspace(dir, e))?;
    }
    let tf = Terraform::new(
        &bin,
        cfg.env,
        options.plugin_cache_dir.as_deref(),
        options.show_output,
    );

    let root = RunRoot::create(options.working_dir.as_deref(), !options.clean)?;
    renderer::prepare_modules(
        options.terraform_modules_dir.as_deref(),
        &options.repository_path,
        &root.modules_dir(),
    )?;

    // Dependents are destroyed before the definitions they read from.
    let mut selected = projection.selected.clone();
    if options.mode() == RunMode::Destroy {
        selected.reverse();
    }
    let mut records: IndexMap<String, ExecutionRecord> = selected
        .iter()
        .map(|n| (n.clone(), ExecutionRecord::new(n)))
        .collect();
    let mut warnings = projection.warnings.clone();
    let mut workspaces: IndexMap<String, Workspace> = IndexMap::new();
    let mut status = RunStatus::Succeeded;

    {
        let state = StateReader {
            backend: &backend,
            keys: &keys,
        };
        let orchestrator = Orchestrator {
            cfg,
            keys: &keys,
            state: &state,
            render: RenderSettings {
                config: cfg.config,
                backend: &backend,
                repository: &options.repository_path,
                env: cfg.env,
            },
            terraform: &tf,
            transient: &transient,
            root: &root,
        };

        for name in &selected {
            let (Some(def), Some(record)) = (cfg.config.definition(name), records.get_mut(name))
            else {
                continue;
            };
            let Err((step, err)) =
                orchestrator.execute(def, record, &mut workspaces, &mut warnings)
            else {
                continue;
            };

            let cancelled =
                matches!(err, WorkerError::Cancelled { .. }) || cfg.cancel.is_cancelled();
            if record.status != LifecycleStatus::Pending || !cancelled {
                if let Err(e) = record.fail(step, err.to_string()) {
                    tracing::warn!("{}", e);
                }
            }
            tracing::error!(definition = %name, %step, "{}", err);
            status = if cancelled {
                RunStatus::Aborted {
                    definition: name.clone(),
                    step,
                }
            } else {
                RunStatus::Failed {
                    definition: name.clone(),
                    step,
                    error: err.to_string(),
                }
            };
            break;
        }
    }

    let retained_root = cleanup(root, workspaces, &mut records, &mut warnings);

    Ok(RunReport {
        deployment: options.deployment.clone(),
        order,
        selected,
        records,
        warnings,
        status,
        retained_root,
        duration: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::env::StaticEnv;
    use crate::core::parser::parse_config;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    /// Fake terraform: logs `<workspace> <args>` and reacts to marker files
    /// shipped with the module source.
    const FAKE_TERRAFORM: &str = r#"#!/bin/sh
echo "$(basename "$PWD") $*" >> "$TW_LOG"
case "$1" in
  init)
    if [ -f fail_init ]; then echo "Error: Unsupported argument" >&2; exit 1; fi
    if [ -f lock_init ]; then
      read n < lock_init
      if [ "$n" -gt 0 ]; then
        echo $((n - 1)) > lock_init
        echo "Error: Error acquiring the state lock" >&2
        exit 1
      fi
    fi
    exit 0 ;;
  plan)
    if [ -f plan_exit ]; then read code < plan_exit; exit "$code"; fi
    exit 2 ;;
  apply|destroy) exit 0 ;;
  output) echo '{"id":"from-state"}'; exit 0 ;;
esac
exit 0
"#;

    const CONFIG: &str = r#"
version: "1.0"
backend:
  type: local
  prefix: state
terraform_vars:
  environment: test
definitions:
  tags:
    path: definitions/tags
  network:
    path: definitions/network
    remote_vars:
      tag_map: tags.outputs.tag_map
  database:
    path: definitions/database
    remote_vars:
      subnet: network.outputs.subnet.id
"#;

    struct Fixture {
        repo: tempfile::TempDir,
        work: tempfile::TempDir,
        log: PathBuf,
        env: StaticEnv,
        bin: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let repo = tempfile::tempdir().unwrap();
            let work = tempfile::tempdir().unwrap();
            for name in ["tags", "network", "database"] {
                let dir = repo.path().join("definitions").join(name);
                fs::create_dir_all(&dir).unwrap();
                fs::write(dir.join("main.tf"), format!("# {}\n", name)).unwrap();
            }
            let bin = repo.path().join("bin/terraform");
            fs::create_dir_all(bin.parent().unwrap()).unwrap();
            fs::write(&bin, FAKE_TERRAFORM).unwrap();
            fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
            let log = work.path().join("terraform.log");
            let env = StaticEnv::new()
                .with_process_path()
                .with("TW_LOG", log.display().to_string());
            Self {
                repo,
                work,
                log,
                env,
                bin,
            }
        }

        fn marker(&self, definition: &str, file: &str, content: &str) {
            let path = self.repo.path().join("definitions").join(definition).join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        fn hook(&self, definition: &str, event: &str, body: &str) {
            self.marker(definition, &format!("hooks/{}", event), &format!("#!/bin/sh\n{}\n", body));
            let path = self
                .repo
                .path()
                .join("definitions")
                .join(definition)
                .join("hooks")
                .join(event);
            fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
        }

        fn options(&self) -> RunOptions {
            RunOptions {
                deployment: "test".into(),
                terraform_bin: self.bin.clone(),
                repository_path: self.repo.path().to_path_buf(),
                working_dir: Some(self.work.path().join("run")),
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay_ms: 1,
                    max_delay_ms: 2,
                },
                ..RunOptions::default()
            }
        }

        fn run(&self, config: &WorkerConfig, options: &RunOptions) -> Result<RunReport, WorkerError> {
            let cancel = CancelToken::new();
            self.run_with(config, options, &cancel)
        }

        fn run_with(
            &self,
            config: &WorkerConfig,
            options: &RunOptions,
            cancel: &CancelToken,
        ) -> Result<RunReport, WorkerError> {
            run(&RunConfig {
                config,
                options,
                env: &self.env,
                cancel,
            })
        }

        fn log(&self) -> Vec<String> {
            fs::read_to_string(&self.log)
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[test]
    fn test_tw018_plan_only_runs_in_order_and_skips() {
        let fx = Fixture::new();
        let config = parse_config(CONFIG).unwrap();
        let report = fx.run(&config, &fx.options()).unwrap();

        assert!(report.succeeded(), "{}", report.status);
        assert_eq!(report.order, vec!["tags", "network", "database"]);
        assert_eq!(report.count(LifecycleStatus::Skipped), 3);
        let log = fx.log();
        let commands: Vec<&str> = log
            .iter()
            .map(|l| l.split(" -").next().unwrap_or(""))
            .collect();
        assert_eq!(
            commands,
            vec![
                "tags init",
                "tags plan",
                "network init",
                "network plan",
                "database init",
                "database plan"
            ]
        );
        for record in report.records.values() {
            assert_eq!(record.status, LifecycleStatus::Cleaned);
            assert_eq!(record.plan, Some(PlanOutcome::Changes));
            assert!(record.artifacts.len() >= 4);
        }
        assert!(!fx.work.path().join("run/definitions").exists());
    }

    #[test]
    fn test_tw018_apply_only_with_changes() {
        let fx = Fixture::new();
        fx.marker("network", "plan_exit", "0");
        let mut config = parse_config(CONFIG).unwrap();
        config.definitions["database"].always_apply = true;
        fx.marker("database", "plan_exit", "0");
        let mut options = fx.options();
        options.apply = true;
        let report = fx.run(&config, &options).unwrap();

        assert!(report.succeeded());
        assert_eq!(report.records["tags"].outcome(), LifecycleStatus::Applied);
        assert_eq!(report.records["network"].outcome(), LifecycleStatus::Skipped);
        assert_eq!(report.records["database"].outcome(), LifecycleStatus::Applied);
        let applies: Vec<String> = fx.log().into_iter().filter(|l| l.contains(" apply ")).collect();
        assert_eq!(applies.len(), 2);
        assert!(applies[0].ends_with("worker.tfplan"));
    }

    #[test]
    fn test_tw018_force_applies_without_changes() {
        let fx = Fixture::new();
        for d in ["tags", "network", "database"] {
            fx.marker(d, "plan_exit", "0");
        }
        let config = parse_config(CONFIG).unwrap();
        let mut options = fx.options();
        options.apply = true;
        options.force = true;
        let report = fx.run(&config, &options).unwrap();
        assert_eq!(report.count(LifecycleStatus::Applied), 3);
    }

    #[test]
    fn test_tw018_destroy_mode() {
        let fx = Fixture::new();
        let config = parse_config(CONFIG).unwrap();
        let mut options = fx.options();
        options.destroy = true;
        let report = fx.run(&config, &options).unwrap();
        assert_eq!(report.count(LifecycleStatus::Destroyed), 3);
        let log = fx.log();
        assert!(log.iter().filter(|l| l.contains(" plan ")).all(|l| l.ends_with("-destroy")));
        let destroyed: Vec<&str> = log
            .iter()
            .filter(|l| l.contains(" destroy "))
            .filter_map(|l| l.split(' ').next())
            .collect();
        assert_eq!(destroyed, vec!["database", "network", "tags"]);
        assert_eq!(report.selected, vec!["database", "network", "tags"]);
        assert_eq!(report.order, vec!["tags", "network", "database"]);
    }

    #[test]
    fn test_tw018_apply_and_destroy_conflict() {
        let fx = Fixture::new();
        let config = parse_config(CONFIG).unwrap();
        let mut options = fx.options();
        options.apply = true;
        options.destroy = true;
        let err = fx.run(&config, &options).unwrap_err();
        assert!(matches!(err, WorkerError::Config(_)));
    }

    #[test]
    fn test_tw018_plan_error_fails_fast() {
        let fx = Fixture::new();
        fx.marker("network", "plan_exit", "1");
        let config = parse_config(CONFIG).unwrap();
        let mut options = fx.options();
        options.apply = true;
        let report = fx.run(&config, &options).unwrap();

        match &report.status {
            RunStatus::Failed {
                definition, step, ..
            } => {
                assert_eq!(definition, "network");
                assert_eq!(*step, Step::Plan);
            }
            other => panic!("unexpected status: {other}"),
        }
        assert_eq!(report.records["tags"].outcome(), LifecycleStatus::Applied);
        assert_eq!(report.records["network"].outcome(), LifecycleStatus::Failed);
        assert_eq!(report.records["database"].status, LifecycleStatus::Pending);
        assert!(!fx.log().iter().any(|l| l.starts_with("network apply")));
        assert!(!fx.log().iter().any(|l| l.starts_with("database")));
    }

    #[test]
    fn test_tw018_cycle_creates_no_workspace() {
        let fx = Fixture::new();
        let yaml = CONFIG.replace("tags.outputs.tag_map", "database.outputs.id");
        let config = parse_config(&yaml).unwrap();
        match fx.run(&config, &fx.options()).unwrap_err() {
            WorkerError::Cycle { path } => assert_eq!(path, vec!["network", "database", "network"]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!fx.work.path().join("run").exists());
        assert!(fx.log().is_empty());
    }

    #[test]
    fn test_tw018_traversal_name_rejected() {
        let fx = Fixture::new();
        let yaml = CONFIG.replace("  database:\n", "  \"..\":\n");
        let config = parse_config(&yaml).unwrap();
        let err = fx.run(&config, &fx.options()).unwrap_err();
        assert!(matches!(err, WorkerError::Config(ref m) if m.contains("'..'")));
        assert!(!fx.work.path().join("run").exists());
        assert!(fx.log().is_empty());
    }

    #[test]
    fn test_tw018_unknown_reference_before_render() {
        let fx = Fixture::new();
        let yaml = CONFIG.replace("tags.outputs.tag_map", "ghost.outputs.tag_map");
        let config = parse_config(&yaml).unwrap();
        let err = fx.run(&config, &fx.options()).unwrap_err();
        assert!(matches!(err, WorkerError::UnknownReference { .. }));
        assert!(!fx.work.path().join("run").exists());
    }

    #[test]
    fn test_tw018_failing_hook_halts() {
        let fx = Fixture::new();
        fx.hook("network", "pre_plan", "exit 3");
        let config = parse_config(CONFIG).unwrap();
        let report = fx.run(&config, &fx.options()).unwrap();

        match &report.status {
            RunStatus::Failed {
                definition,
                step,
                error,
            } => {
                assert_eq!(definition, "network");
                assert_eq!(*step, Step::Plan);
                assert!(error.contains("exit code 3"));
            }
            other => panic!("unexpected status: {other}"),
        }
        assert!(!fx.log().iter().any(|l| l.starts_with("network plan")));
        assert_eq!(report.records["database"].status, LifecycleStatus::Pending);
        let hooks = &report.records["network"].hooks;
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].event, HookEvent::PrePlan);
        assert_eq!(hooks[0].exit_code, 3);
    }

    #[test]
    fn test_tw018_hooks_see_remote_values() {
        let fx = Fixture::new();
        fx.hook(
            "database",
            "post_plan",
            "echo \"$1 $2 $TF_REMOTE_SUBNET $TF_VAR_ENVIRONMENT\" >> \"$TW_LOG\"",
        );
        let config = parse_config(CONFIG).unwrap();
        let report = fx.run(&config, &fx.options()).unwrap();
        assert!(report.succeeded());
        assert!(fx.log().contains(&"post plan from-state test".to_string()));
        assert_eq!(report.records["database"].hooks.len(), 1);
        assert_eq!(report.records["database"].hooks[0].event, HookEvent::PostPlan);
    }

    #[test]
    fn test_tw018_transient_init_retried() {
        let fx = Fixture::new();
        fx.marker("tags", "lock_init", "2");
        let config = parse_config(CONFIG).unwrap();
        let report = fx.run(&config, &fx.options()).unwrap();
        assert!(report.succeeded(), "{}", report.status);
        let init = &report.records["tags"].steps[0];
        assert_eq!(init.step, Step::Init);
        assert_eq!(init.attempts, 3);
    }

    #[test]
    fn test_tw018_transient_init_exhausted_is_backend_error() {
        let fx = Fixture::new();
        fx.marker("tags", "lock_init", "9");
        let config = parse_config(CONFIG).unwrap();
        let report = fx.run(&config, &fx.options()).unwrap();
        match &report.status {
            RunStatus::Failed { step, error, .. } => {
                assert_eq!(*step, Step::Init);
                assert!(error.contains("backend error"));
                assert!(error.contains("3 attempt"));
            }
            other => panic!("unexpected status: {other}"),
        }
    }

    #[test]
    fn test_tw018_non_transient_init_not_retried() {
        let fx = Fixture::new();
        fx.marker("tags", "fail_init", "");
        let config = parse_config(CONFIG).unwrap();
        let report = fx.run(&config, &fx.options()).unwrap();
        assert_eq!(report.records["tags"].steps[0].attempts, 1);
        assert!(matches!(report.status, RunStatus::Failed { step: Step::Init, .. }));
    }

    #[test]
    fn test_tw018_limit_with_excluded_upstream() {
        let fx = Fixture::new();
        fx.hook("database", "pre_init", "echo \"subnet=[$TF_REMOTE_SUBNET]\" >> \"$TW_LOG\"");
        let config = parse_config(CONFIG).unwrap();
        let mut options = fx.options();
        options.limit = vec!["database".into()];
        options.clean = false;
        let report = fx.run(&config, &options).unwrap();

        assert!(report.succeeded());
        assert_eq!(report.selected, vec!["database"]);
        assert!(report.warnings.iter().any(|w| w.contains("'network'")));
        assert!(!report.warnings.iter().any(|w| w.contains("omitted from hook environment")));
        assert!(fx.log().contains(&"subnet=[from-state]".to_string()));

        let root = report.retained_root.clone().unwrap();
        let checkout = root.join("definitions/database/.remote-state-network/worker-backend.tf");
        assert!(fs::read_to_string(checkout).unwrap().contains("state/test/network"));
        let locals =
            fs::read_to_string(root.join("definitions/database/worker-locals.tf")).unwrap();
        assert!(locals.contains("state/test/network/terraform.tfstate"));
        assert_eq!(report.records["database"].status, LifecycleStatus::Skipped);
    }

    #[test]
    fn test_tw018_unknown_limit_name() {
        let fx = Fixture::new();
        let config = parse_config(CONFIG).unwrap();
        let mut options = fx.options();
        options.limit = vec!["nope".into()];
        assert!(matches!(
            fx.run(&config, &options).unwrap_err(),
            WorkerError::Config(_)
        ));
    }

    #[test]
    fn test_tw018_cancelled_before_start() {
        let fx = Fixture::new();
        let config = parse_config(CONFIG).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = fx.run_with(&config, &fx.options(), &cancel).unwrap();
        assert!(matches!(report.status, RunStatus::Aborted { ref definition, .. } if definition == "tags"));
        assert_eq!(report.count(LifecycleStatus::Pending), 3);
        assert!(fx.log().is_empty());
        assert!(!fx.work.path().join("run/definitions").exists());
    }

    #[test]
    fn test_tw018_backend_artifacts_use_deployment_keys() {
        let fx = Fixture::new();
        let mut config = parse_config(CONFIG).unwrap();
        config.definitions["tags"].backend_prefix = Some("legacy".into());
        let mut options = fx.options();
        options.clean = false;
        let report = fx.run(&config, &options).unwrap();
        assert_eq!(report.records["tags"].backend_key.as_deref(), Some("legacy/test/tags"));
        assert_eq!(
            report.records["network"].backend_key.as_deref(),
            Some("state/test/network")
        );
        let root = report.retained_root.unwrap();
        let locals = fs::read_to_string(root.join("definitions/network/worker-locals.tf")).unwrap();
        assert!(locals.contains("legacy/test/tags/terraform.tfstate"));
    }

    #[test]
    fn test_tw018_missing_binary_is_config_error() {
        let fx = Fixture::new();
        let config = parse_config(CONFIG).unwrap();
        let mut options = fx.options();
        options.terraform_bin = fx.repo.path().join("bin/missing");
        assert!(matches!(
            fx.run(&config, &options).unwrap_err(),
            WorkerError::Config(_)
        ));
    }

    #[test]
    fn test_tw018_bad_deployment_name() {
        assert!(check_options(&RunOptions {
            deployment: "a/b".into(),
            ..RunOptions::default()
        })
        .is_err());
        assert!(check_options(&RunOptions::default()).is_ok());
    }
}
