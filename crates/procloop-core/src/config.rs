use crate::error::ProcloopError;
use anyhow::Context;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Description of a child process to supervise
#[derive(Default, Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    pub command: String,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub args: Vec<String>,
    /// Exact `KEY=VALUE` environment of the child. `None` inherits the parent's.
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[builder(default)]
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Wall-clock budget in milliseconds; 0 or absent means unlimited.
    #[builder(default)]
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Close the child's stdin once every queued byte has been written.
    #[builder(default)]
    #[serde(default)]
    pub close_stdin: bool,
}

impl ProcessConfig {
    pub fn builder() -> ProcessConfigBuilder {
        ProcessConfigBuilder::default()
    }

    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), ProcloopError> {
        if self.command.trim().is_empty() {
            return Err(ProcloopError::Config("command cannot be empty".to_string()));
        }
        if let Some(env) = &self.env
            && let Some(bad) = env.iter().find(|entry| entry.is_empty() || entry.starts_with('='))
        {
            return Err(ProcloopError::Config(format!(
                "environment entry {bad:?} has no key"
            )));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, ProcloopError> {
        let config: ProcessConfig = serde_json::from_str(json)
            .context("parsing process configuration")
            .map_err(ProcloopError::Other)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ProcloopError> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))
            .map_err(ProcloopError::Other)?;
        Self::from_json_str(&contents)
    }
}

impl ProcessConfigBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    /// Add one `KEY=VALUE` entry to the explicit environment
    pub fn env<K: ToString, V: ToString>(&mut self, key: K, value: V) -> &mut Self {
        let env = self.env.get_or_insert_with(|| Some(Vec::new()));
        env.get_or_insert_with(Vec::new)
            .push(format!("{}={}", key.to_string(), value.to_string()));
        self
    }

    /// Replace the explicit environment with raw `KEY=VALUE` entries
    pub fn env_entries<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        self.env = Some(Some(iter.into_iter().map(|s| s.to_string()).collect()));
        self
    }
}
