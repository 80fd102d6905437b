//! TW-012: Environment providers for subprocesses and config templating.

use indexmap::IndexMap;

/// Source of environment variables handed to terraform and hook scripts.
pub trait EnvProvider: Send + Sync {
    /// Look up one variable.
    fn var(&self, key: &str) -> Option<String>;

    /// Every variable, in a stable order.
    fn vars(&self) -> Vec<(String, String)>;
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmbientEnv;

impl EnvProvider for AmbientEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn vars(&self) -> Vec<(String, String)> {
        let mut all: Vec<(String, String)> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        all.sort();
        all
    }
}

/// A fixed set of variables.
#[derive(Debug, Clone, Default)]
pub struct StaticEnv {
    values: IndexMap<String, String>,
}

impl StaticEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Copy `PATH` from the process so scripts can find their tools.
    pub fn with_process_path(self) -> Self {
        match std::env::var("PATH") {
            Ok(path) => self.with("PATH", path),
            Err(_) => self,
        }
    }
}

impl EnvProvider for StaticEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn vars(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
