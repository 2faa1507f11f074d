//! Engine configuration, assembled from the CLI flag set.
//!
//! Unlike persistent services there is no config file here: one program
//! execution is parameterized entirely by its invocation. Validation
//! happens before the corpus loads, so configuration errors abort before
//! any work (or spend) begins.

use std::path::PathBuf;

use crate::error::RlmError;
use crate::session::DEFAULT_MODEL;

/// Cache settings for one run.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Caching can be disabled entirely; consumers handle that path.
    pub enabled: bool,
    /// Cache directory; the default lives under the system temp dir.
    pub dir: Option<PathBuf>,
    /// Entry time-to-live in hours.
    pub ttl_hours: i64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            enabled: true,
            dir: None,
            ttl_hours: 24,
        }
    }
}

/// Full engine configuration for one run.
#[derive(Debug, Clone)]
pub struct RlmConfig {
    pub model: String,
    pub max_budget_usd: f64,
    pub max_calls: u64,
    pub max_depth: u32,
    pub workers: usize,
    pub cache: CacheSettings,
    pub checkpoint: Option<PathBuf>,
    pub checkpoint_interval: usize,
    pub rlm_framing: bool,
    pub verbose: bool,
}

impl Default for RlmConfig {
    fn default() -> Self {
        RlmConfig {
            model: DEFAULT_MODEL.to_string(),
            max_budget_usd: 5.0,
            max_calls: 100,
            max_depth: 3,
            workers: 5,
            cache: CacheSettings::default(),
            checkpoint: None,
            checkpoint_interval: 10,
            rlm_framing: true,
            verbose: false,
        }
    }
}

impl RlmConfig {
    /// Validate before any corpus load or model call.
    pub fn validate(&self) -> Result<(), RlmError> {
        if self.max_budget_usd <= 0.0 {
            return Err(RlmError::Configuration(
                "--max-budget must be > 0".to_string(),
            ));
        }
        if self.max_calls == 0 {
            return Err(RlmError::Configuration("--max-calls must be > 0".to_string()));
        }
        if self.max_depth == 0 {
            return Err(RlmError::Configuration("--max-depth must be > 0".to_string()));
        }
        if self.workers == 0 {
            return Err(RlmError::Configuration("--workers must be > 0".to_string()));
        }
        if self.cache.ttl_hours <= 0 {
            return Err(RlmError::Configuration(
                "--cache-ttl must be > 0 hours".to_string(),
            ));
        }
        if self.checkpoint_interval == 0 {
            return Err(RlmError::Configuration(
                "--checkpoint-interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(RlmConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zeroes() {
        let mut config = RlmConfig::default();
        config.max_budget_usd = 0.0;
        assert!(matches!(
            config.validate(),
            Err(RlmError::Configuration(_))
        ));

        let mut config = RlmConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = RlmConfig::default();
        config.checkpoint_interval = 0;
        assert!(config.validate().is_err());
    }
}
