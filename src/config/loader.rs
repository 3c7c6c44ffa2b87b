/// Configuration loading from JSON files and environment overrides
use crate::config::types::{BackendKind, Result, SandboxConfig, SandboxError};
use std::path::{Path, PathBuf};

pub const ENV_BACKEND: &str = "LIMITBOX_BACKEND";
pub const ENV_CGROUP_ROOT: &str = "LIMITBOX_CGROUP_ROOT";
pub const ENV_STRICT: &str = "LIMITBOX_STRICT";

impl SandboxConfig {
    /// Load configuration from a JSON file; missing keys take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: SandboxConfig = serde_json::from_str(&content).map_err(|e| {
            SandboxError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `LIMITBOX_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_BACKEND) {
            self.backend = BackendKind::parse(&value).ok_or_else(|| {
                SandboxError::Config(format!("{}: unknown backend '{}'", ENV_BACKEND, value))
            })?;
        }
        if let Some(value) = lookup(ENV_CGROUP_ROOT) {
            self.cgroup_root = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_STRICT) {
            self.strict_mode = match value.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(SandboxError::Config(format!(
                        "{}: expected boolean, got '{}'",
                        ENV_STRICT, other
                    )))
                }
            };
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.process_limit == 0 {
            return Err(SandboxError::Config(
                "process_limit must be at least 1".to_string(),
            ));
        }
        if self.sample_interval_ms == 0 {
            return Err(SandboxError::Config(
                "sample_interval_ms must be positive".to_string(),
            ));
        }
        if self.feedback.sentinel.is_empty() {
            return Err(SandboxError::Config(
                "feedback sentinel must not be empty".to_string(),
            ));
        }
        if self.strict_mode && self.backend == BackendKind::Rlimit {
            return Err(SandboxError::Config(
                "strict mode requires a cgroup backend".to_string(),
            ));
        }
        if !self.cgroup_root.is_absolute() {
            return Err(SandboxError::Config(format!(
                "cgroup_root must be absolute: {}",
                self.cgroup_root.display()
            )));
        }
        Ok(())
    }
}
