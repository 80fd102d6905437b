//! TW-019: CLI subcommands: init, validate, terraform.

use crate::core::env::AmbientEnv;
use crate::core::retry::RetryPolicy;
use crate::core::types::{LifecycleStatus, PlanOutcome, RunOptions, RunReport, WorkerConfig};
use crate::core::{executor, parser, template};
use crate::transport::CancelToken;
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scaffold a new tfworker repository
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate worker.yaml and print the execution order
    Validate {
        /// Path to worker.yaml
        #[arg(short, long, default_value = "worker.yaml")]
        file: PathBuf,

        /// Only these definitions (comma separated)
        #[arg(long, value_delimiter = ',')]
        limit: Vec<String>,

        /// Template variable for worker.yaml (NAME=VALUE)
        #[arg(long = "config-var")]
        config_var: Vec<String>,
    },

    /// Render and run every definition through terraform
    Terraform {
        /// Path to worker.yaml
        #[arg(short, long, default_value = "worker.yaml")]
        file: PathBuf,

        /// Deployment name, part of every backend key
        #[arg(long)]
        deployment: String,

        /// Apply plans that have changes
        #[arg(long, conflicts_with = "destroy")]
        apply: bool,

        /// Destroy instead of apply
        #[arg(long)]
        destroy: bool,

        /// Apply or destroy even when the plan has no changes
        #[arg(long)]
        force: bool,

        /// Only these definitions (comma separated)
        #[arg(long, value_delimiter = ',')]
        limit: Vec<String>,

        /// Keep rendered workspaces after the run
        #[arg(long)]
        no_clean: bool,

        /// Echo terraform and hook output while running
        #[arg(long)]
        show_output: bool,

        /// Base64-encode list/map values passed to hooks
        #[arg(long)]
        b64_encode_hook_values: bool,

        /// Terraform binary (name on PATH or path)
        #[arg(long, default_value = "terraform")]
        terraform_bin: PathBuf,

        /// Shared module directory copied next to the definitions
        #[arg(long)]
        terraform_modules_dir: Option<PathBuf>,

        /// Directory for rendered workspaces (default: a temp dir)
        #[arg(long)]
        working_dir: Option<PathBuf>,

        /// Base for relative definition paths
        #[arg(long, default_value = ".")]
        repository_path: PathBuf,

        /// Provider plugin cache shared across definitions
        #[arg(long)]
        plugin_cache_dir: Option<PathBuf>,

        /// Template variable for worker.yaml (NAME=VALUE)
        #[arg(long = "config-var")]
        config_var: Vec<String>,

        /// Attempts for init on transient backend errors
        #[arg(long, default_value_t = 3)]
        retry_attempts: u32,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands, cancel: &CancelToken) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate {
            file,
            limit,
            config_var,
        } => cmd_validate(&file, &limit, &config_var),
        Commands::Terraform {
            file,
            deployment,
            apply,
            destroy,
            force,
            limit,
            no_clean,
            show_output,
            b64_encode_hook_values,
            terraform_bin,
            terraform_modules_dir,
            working_dir,
            repository_path,
            plugin_cache_dir,
            config_var,
            retry_attempts,
        } => {
            let options = RunOptions {
                deployment,
                clean: !no_clean,
                apply,
                destroy,
                force,
                limit,
                terraform_modules_dir,
                b64_encode_hook_values,
                show_output,
                terraform_bin,
                repository_path,
                working_dir,
                plugin_cache_dir,
                retry: RetryPolicy {
                    max_attempts: retry_attempts.max(1),
                    ..RetryPolicy::default()
                },
            };
            cmd_terraform(&file, &config_var, &options, cancel)
        }
    }
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("worker.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }

    let example = path.join("definitions").join("example");
    std::fs::create_dir_all(&example)
        .map_err(|e| format!("cannot create {}: {}", example.display(), e))?;

    let template = r#"version: "1.0"
description: "Managed by tfworker"

backend:
  type: s3
  bucket: "{{ env.TFWORKER_STATE_BUCKET }}"
  region: us-east-1
  prefix: terraform/state

providers:
  aws:
    requirements:
      version: ">= 5.0"
    vars:
      region: us-east-1

terraform_vars: {}

definitions:
  example:
    path: definitions/example
"#;
    std::fs::write(&config_path, template)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;
    let main_tf = example.join("main.tf");
    std::fs::write(&main_tf, "# example definition\n")
        .map_err(|e| format!("cannot write {}: {}", main_tf.display(), e))?;

    println!("Initialized tfworker repository at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}", main_tf.display());
    Ok(())
}

/// Parse and validate a worker config file, printing every error.
fn parse_and_validate(file: &Path, config_vars: &[String]) -> Result<WorkerConfig, String> {
    let vars = template::parse_config_vars(config_vars)?;
    let config = parser::parse_config_file(file, &vars, &AmbientEnv).map_err(|e| e.to_string())?;
    let errors = parser::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err(format!("{} validation error(s)", errors.len()))
}

fn cmd_validate(file: &Path, limit: &[String], config_vars: &[String]) -> Result<(), String> {
    let config = parse_and_validate(file, config_vars)?;
    let (order, projection) =
        executor::resolve_order(&config, limit).map_err(|e| e.to_string())?;

    println!(
        "OK: {} definitions, {} providers",
        config.definitions.len(),
        config.providers.len()
    );
    println!("Order: {}", order.join(" -> "));
    if !limit.is_empty() {
        println!("Selected: {}", projection.selected.join(", "));
    }
    for w in &projection.warnings {
        println!("  WARNING: {}", w);
    }
    Ok(())
}

fn cmd_terraform(
    file: &Path,
    config_vars: &[String],
    options: &RunOptions,
    cancel: &CancelToken,
) -> Result<(), String> {
    let config = parse_and_validate(file, config_vars)?;
    let cfg = executor::RunConfig {
        config: &config,
        options,
        env: &AmbientEnv,
        cancel,
    };
    let report = executor::run(&cfg).map_err(|e| e.to_string())?;
    print_report(&report);
    if report.succeeded() {
        Ok(())
    } else {
        Err(report.status.to_string())
    }
}

fn plan_label(plan: Option<PlanOutcome>) -> &'static str {
    match plan {
        Some(PlanOutcome::Changes) => "changes",
        Some(PlanOutcome::NoChanges) => "no changes",
        None => "-",
    }
}

/// Display a run report to stdout.
fn print_report(report: &RunReport) {
    println!(
        "Deployment: {} ({} of {} definitions)",
        report.deployment,
        report.selected.len(),
        report.order.len()
    );
    println!("Order: {}", report.selected.join(" -> "));
    println!();

    for record in report.records.values() {
        let elapsed: f64 = record
            .steps
            .iter()
            .map(|s| s.duration.as_secs_f64())
            .sum();
        println!(
            "  {}: {} (plan: {}, {:.1}s)",
            record.name,
            record.outcome(),
            plan_label(record.plan),
            elapsed
        );
        if let Some(ref failure) = record.failure {
            println!("    {} failed: {}", failure.step, failure.message);
        }
    }

    if !report.warnings.is_empty() {
        println!();
        for w in &report.warnings {
            println!("  WARNING: {}", w);
        }
    }
    if let Some(ref root) = report.retained_root {
        println!();
        println!("Workspaces kept at {}", root.display());
    }

    println!();
    println!(
        "Run {}: {} applied, {} destroyed, {} skipped, {} pending ({:.1}s)",
        report.status,
        report.count(LifecycleStatus::Applied),
        report.count(LifecycleStatus::Destroyed),
        report.count(LifecycleStatus::Skipped),
        report.count(LifecycleStatus::Pending),
        report.duration.as_secs_f64()
    );
}
