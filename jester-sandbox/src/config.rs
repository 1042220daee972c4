//! Engine configuration loaded from TOML

use crate::cache::CacheConfig;
use crate::error::ConfigError;
use crate::limits::ResourceLimits;
use crate::policy::SecurityPolicy;
use crate::rate_limit::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of concurrently running children
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    4
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// Interpreter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// Interpreter binary, resolved through the host PATH when not absolute
    #[serde(default = "default_program")]
    pub program: String,
}

fn default_program() -> String {
    "python3".to_string()
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Limits used when a request brings none
    #[serde(default)]
    pub limits: ResourceLimits,

    #[serde(default)]
    pub security: SecurityPolicy,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub interpreter: InterpreterConfig,
}

impl EngineConfig {
    /// Load and validate configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Load from file, falling back to defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_error = |detail: String| ConfigError::Write {
            path: path.to_path_buf(),
            detail,
        };

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| write_error(format!("failed to create config directory: {}", e)))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| write_error(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| write_error(e.to_string()))?;
        Ok(())
    }

    /// Get the configuration file path
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir()
            .ok_or_else(|| ConfigError::Invalid("cannot determine home directory".to_string()))?;
        Ok(home.join(".config").join("jester").join("config.toml"))
    }

    /// Reject settings that would make every execution fail or the engine stall
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.limits.has_zero_ceiling() {
            return invalid("limits must all be greater than zero");
        }
        if self.security.limit_ceiling.has_zero_ceiling() {
            return invalid("security.limit_ceiling must all be greater than zero");
        }
        if self.security.max_code_bytes == 0 {
            return invalid("security.max_code_bytes must be greater than zero");
        }
        if self.security.max_violations == 0 {
            return invalid("security.max_violations must be greater than zero");
        }
        if self.cache.capacity == 0 {
            return invalid("cache.capacity must be greater than zero");
        }
        if self.cache.ttl.is_zero() || self.cache.timeout_ttl.is_zero() {
            return invalid("cache TTLs must be greater than zero");
        }
        if self.rate_limit.executions_per_window == 0 {
            return invalid("rate_limit.executions_per_window must be greater than zero");
        }
        if self.rate_limit.window.is_zero() {
            return invalid("rate_limit.window must be greater than zero");
        }
        if self.pool.workers == 0 {
            return invalid("pool.workers must be greater than zero");
        }
        if self.interpreter.program.trim().is_empty() {
            return invalid("interpreter.program must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.interpreter.program, "python3");
        assert_eq!(config.pool.workers, 4);
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml(
            r#"
            [limits]
            max_wall_ms = 500

            [cache]
            ttl = "2m"

            [rate_limit]
            executions_per_window = 3
            window = "10s"
            "#,
        )
        .unwrap();

        assert_eq!(config.limits.max_wall_ms, 500);
        assert_eq!(config.limits.max_cpu_ms, ResourceLimits::default().max_cpu_ms);
        assert_eq!(config.cache.ttl, Duration::from_secs(120));
        assert_eq!(config.rate_limit.window, Duration::from_secs(10));
        assert!(config.security.denied_imports.contains("subprocess"));
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let err = EngineConfig::from_toml("[pool]\nworkers = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = EngineConfig::from_toml("[limits]\nmax_output_bytes = 0").unwrap_err();
        assert!(err.to_string().contains("limits"));
    }

    #[test]
    fn test_parse_error() {
        let err = EngineConfig::from_toml("[pool\nworkers = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = EngineConfig::default();
        config.pool.workers = 2;
        config.security.enforce_allow_list = true;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
