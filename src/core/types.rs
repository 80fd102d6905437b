//! TW-001: Configuration, lifecycle, and reporting types.
//!
//! The YAML schema types (`WorkerConfig` and friends) derive Deserialize and
//! are immutable once parsed. Lifecycle and report types are owned by the
//! executor and mutated only there.

use super::error::WorkerError;
use super::reference::RemoteReference;
use super::retry::RetryPolicy;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Top-level worker.yaml
// ============================================================================

/// Root configuration: the definitions of one deployment and their wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Where definitions keep their state
    pub backend: BackendConfig,

    /// Global provider set (order-preserving)
    #[serde(default)]
    pub providers: IndexMap<String, ProviderConfig>,

    /// Variables inherited by every definition
    #[serde(default)]
    pub terraform_vars: IndexMap<String, serde_json::Value>,

    /// Definitions in declaration order
    pub definitions: IndexMap<String, Definition>,
}

impl WorkerConfig {
    /// Look up a definition by name.
    pub fn definition(&self, name: &str) -> Option<&Definition> {
        self.definitions.get(name)
    }

    /// Declaration index of a definition.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.definitions.get_index_of(name)
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Global backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend type
    #[serde(rename = "type")]
    pub backend_type: BackendType,

    /// Bucket holding state (s3, gcs)
    #[serde(default)]
    pub bucket: Option<String>,

    /// Region of the bucket (s3)
    #[serde(default)]
    pub region: Option<String>,

    /// Key prefix shared by all definitions
    #[serde(default = "default_backend_prefix")]
    pub prefix: String,

    /// Credentials file (gcs)
    #[serde(default)]
    pub credentials: Option<String>,

    /// State root directory (local)
    #[serde(default)]
    pub path: Option<String>,
}

fn default_backend_prefix() -> String {
    "terraform/state".to_string()
}

/// Backend type enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    S3,
    Gcs,
    Local,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S3 => write!(f, "s3"),
            Self::Gcs => write!(f, "gcs"),
            Self::Local => write!(f, "local"),
        }
    }
}

// ============================================================================
// Providers
// ============================================================================

/// A globally configured provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Version and source constraints
    pub requirements: ProviderRequirements,

    /// Attributes of the `provider` block
    #[serde(default)]
    pub vars: IndexMap<String, serde_json::Value>,
}

/// Provider version/source requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequirements {
    pub version: String,
    #[serde(default)]
    pub source: Option<String>,
}

// ============================================================================
// Definitions
// ============================================================================

/// One orchestrated terraform module and its configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Definition {
    /// Unique name (filled from the map key by the parser)
    #[serde(default)]
    pub name: String,

    /// Module source: local path or git locator
    pub path: String,

    /// Definition-level variables (override globals)
    #[serde(default)]
    pub terraform_vars: IndexMap<String, serde_json::Value>,

    /// Local name → remote output reference
    #[serde(default)]
    pub remote_vars: IndexMap<String, RemoteReference>,

    /// Provider subset; `None` means every global provider
    #[serde(default)]
    pub providers: Option<Vec<String>>,

    /// Replaces the global backend prefix for this definition
    #[serde(default)]
    pub backend_prefix: Option<String>,

    /// Apply even when plan reports no changes
    #[serde(default)]
    pub always_apply: bool,

    /// Run even when excluded by a limit
    #[serde(default)]
    pub always_include: bool,

    /// Only inherit these global vars (empty = all)
    #[serde(default)]
    pub use_global_terraform_vars: Vec<String>,

    /// Never inherit these global vars
    #[serde(default)]
    pub ignored_global_terraform_vars: Vec<String>,

    /// Options for git sources
    #[serde(default)]
    pub remote_path_options: Option<RemotePathOptions>,
}

impl Definition {
    /// Build a definition programmatically.
    pub fn new(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            ..Self::default()
        }
    }

    /// Add a remote var, parsing the reference.
    pub fn with_remote(mut self, local: &str, reference: &str) -> Result<Self, WorkerError> {
        let r = super::reference::parse_reference(&self.name, reference)?;
        self.remote_vars.insert(local.to_string(), r);
        Ok(self)
    }

    /// Add a terraform var.
    pub fn with_var(mut self, key: &str, value: serde_json::Value) -> Self {
        self.terraform_vars.insert(key.to_string(), value);
        self
    }

    /// Distinct upstream definitions, in first-reference order.
    pub fn upstream(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for r in self.remote_vars.values() {
            if !out.contains(&r.source.as_str()) {
                out.push(&r.source);
            }
        }
        out
    }
}

/// Options for fetching a definition from git.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemotePathOptions {
    /// Branch or tag to check out
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,

    /// Subdirectory of the repository holding the module
    #[serde(default)]
    pub sub_path: Option<String>,
}

// ============================================================================
// Run options
// ============================================================================

/// Flags for one invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Deployment name (part of every backend key)
    pub deployment: String,
    /// Remove workspaces when the run ends
    pub clean: bool,
    /// Apply planned changes
    pub apply: bool,
    /// Destroy instead of apply
    pub destroy: bool,
    /// Apply/destroy even without planned changes
    pub force: bool,
    /// Only run these definitions (empty = all)
    pub limit: Vec<String>,
    /// Shared module directory copied next to the definitions
    pub terraform_modules_dir: Option<PathBuf>,
    /// Base64-encode complex values in hook environments
    pub b64_encode_hook_values: bool,
    /// Echo subprocess output as it arrives
    pub show_output: bool,
    /// Provisioning binary
    pub terraform_bin: PathBuf,
    /// Root that relative definition paths are resolved against
    pub repository_path: PathBuf,
    /// Run root; a fresh temporary directory when `None`
    pub working_dir: Option<PathBuf>,
    /// Exported as TF_PLUGIN_CACHE_DIR
    pub plugin_cache_dir: Option<PathBuf>,
    /// Backoff for transient backend errors
    pub retry: RetryPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            deployment: "default".to_string(),
            clean: true,
            apply: false,
            destroy: false,
            force: false,
            limit: Vec::new(),
            terraform_modules_dir: None,
            b64_encode_hook_values: false,
            show_output: false,
            terraform_bin: PathBuf::from("terraform"),
            repository_path: PathBuf::from("."),
            working_dir: None,
            plugin_cache_dir: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl RunOptions {
    /// What happens after a successful plan.
    pub fn mode(&self) -> RunMode {
        if self.destroy {
            RunMode::Destroy
        } else if self.apply {
            RunMode::Apply
        } else {
            RunMode::PlanOnly
        }
    }
}

/// Run mode derived from the apply/destroy flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    PlanOnly,
    Apply,
    Destroy,
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Pipeline step, used to attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Render,
    Init,
    Plan,
    Apply,
    Destroy,
    Cleanup,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Render => write!(f, "render"),
            Self::Init => write!(f, "init"),
            Self::Plan => write!(f, "plan"),
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Lifecycle event a hook script can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    PreInit,
    PostInit,
    PrePlan,
    PostPlan,
    PreApply,
    PostApply,
    PreDestroy,
    PostDestroy,
}

impl HookEvent {
    pub const ALL: [HookEvent; 8] = [
        Self::PreInit,
        Self::PostInit,
        Self::PrePlan,
        Self::PostPlan,
        Self::PreApply,
        Self::PostApply,
        Self::PreDestroy,
        Self::PostDestroy,
    ];

    /// Script stem, e.g. `pre_plan`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreInit => "pre_init",
            Self::PostInit => "post_init",
            Self::PrePlan => "pre_plan",
            Self::PostPlan => "post_plan",
            Self::PreApply => "pre_apply",
            Self::PostApply => "post_apply",
            Self::PreDestroy => "pre_destroy",
            Self::PostDestroy => "post_destroy",
        }
    }

    /// `pre` or `post`.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::PreInit | Self::PrePlan | Self::PreApply | Self::PreDestroy => "pre",
            _ => "post",
        }
    }

    /// The step this event wraps.
    pub fn step(&self) -> Step {
        match self {
            Self::PreInit | Self::PostInit => Step::Init,
            Self::PrePlan | Self::PostPlan => Step::Plan,
            Self::PreApply | Self::PostApply => Step::Apply,
            Self::PreDestroy | Self::PostDestroy => Step::Destroy,
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-definition lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Pending,
    Rendered,
    Initialized,
    Planned,
    Applied,
    Destroyed,
    Skipped,
    Failed,
    Cleaned,
}

impl LifecycleStatus {
    /// Terminal outcome of the pipeline (cleanup may still follow).
    pub fn is_outcome(&self) -> bool {
        matches!(
            self,
            Self::Applied | Self::Destroyed | Self::Skipped | Self::Failed
        )
    }

    /// Whether the state machine allows `self → next`.
    pub fn can_transition_to(&self, next: LifecycleStatus) -> bool {
        use LifecycleStatus::*;
        match (self, next) {
            (Pending, Rendered) | (Rendered, Initialized) | (Initialized, Planned) => true,
            (Planned, Applied) | (Planned, Destroyed) | (Planned, Skipped) => true,
            (Pending | Rendered | Initialized | Planned, Failed) => true,
            (Applied | Destroyed | Skipped | Failed, Cleaned) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Rendered => write!(f, "RENDERED"),
            Self::Initialized => write!(f, "INITIALIZED"),
            Self::Planned => write!(f, "PLANNED"),
            Self::Applied => write!(f, "APPLIED"),
            Self::Destroyed => write!(f, "DESTROYED"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cleaned => write!(f, "CLEANED"),
        }
    }
}

/// Result of a plan with `-detailed-exitcode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOutcome {
    NoChanges,
    Changes,
}

impl PlanOutcome {
    /// `0` → no changes, `2` → changes, anything else is an error.
    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::NoChanges),
            2 => Some(Self::Changes),
            _ => None,
        }
    }
}

// ============================================================================
// Execution records
// ============================================================================

/// One invocation of the provisioning binary.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step: Step,
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub attempts: u32,
    pub duration: Duration,
}

/// One hook script invocation.
#[derive(Debug, Clone)]
pub struct HookRecord {
    pub event: HookEvent,
    pub script: PathBuf,
    pub exit_code: i32,
    pub duration: Duration,
}

/// Where and why a definition failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub step: Step,
    pub message: String,
}

/// Lifecycle record for one definition.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub name: String,
    pub status: LifecycleStatus,
    pub history: Vec<LifecycleStatus>,
    pub backend_key: Option<String>,
    pub workspace: Option<PathBuf>,
    pub plan: Option<PlanOutcome>,
    pub steps: Vec<StepRecord>,
    pub hooks: Vec<HookRecord>,
    /// Generated file name → BLAKE3 digest
    pub artifacts: IndexMap<String, String>,
    pub failure: Option<Failure>,
}

impl ExecutionRecord {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: LifecycleStatus::Pending,
            history: vec![LifecycleStatus::Pending],
            backend_key: None,
            workspace: None,
            plan: None,
            steps: Vec::new(),
            hooks: Vec::new(),
            artifacts: IndexMap::new(),
            failure: None,
        }
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: LifecycleStatus) -> Result<(), WorkerError> {
        if !self.status.can_transition_to(next) {
            return Err(WorkerError::InvalidTransition {
                definition: self.name.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.history.push(next);
        Ok(())
    }

    /// Mark the definition failed at `step`.
    pub fn fail(&mut self, step: Step, message: impl Into<String>) -> Result<(), WorkerError> {
        self.transition(LifecycleStatus::Failed)?;
        self.failure = Some(Failure {
            step,
            message: message.into(),
        });
        Ok(())
    }

    /// Last pipeline outcome, ignoring cleanup.
    pub fn outcome(&self) -> LifecycleStatus {
        self.history
            .iter()
            .rev()
            .find(|s| **s != LifecycleStatus::Cleaned)
            .copied()
            .unwrap_or(LifecycleStatus::Pending)
    }
}

// ============================================================================
// Run report
// ============================================================================

/// Final status of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed {
        definition: String,
        step: Step,
        error: String,
    },
    Aborted {
        definition: String,
        step: Step,
    },
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed {
                definition,
                step,
                error,
            } => write!(f, "FAILED at {} of '{}': {}", step, definition, error),
            Self::Aborted { definition, step } => {
                write!(f, "ABORTED at {} of '{}'", step, definition)
            }
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub deployment: String,
    /// Full graph order
    pub order: Vec<String>,
    /// Order after limit projection
    pub selected: Vec<String>,
    pub records: IndexMap<String, ExecutionRecord>,
    pub warnings: Vec<String>,
    pub status: RunStatus,
    /// Run root, when retained
    pub retained_root: Option<PathBuf>,
    pub duration: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Count of definitions whose outcome is `status`.
    pub fn count(&self, status: LifecycleStatus) -> usize {
        self.records
            .values()
            .filter(|r| r.outcome() == status)
            .count()
    }
}

// ============================================================================
// Tests
// ============================================================================
