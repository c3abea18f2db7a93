use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::model::DispositionOutcome;
use crate::retry::RetryPolicy;

/// File name looked up in the station's working directory.
pub const CONFIG_FILE_NAME: &str = "holdtag.toml";

/// Environment override for `retry.max_attempts`.
pub const MAX_ATTEMPTS_ENV: &str = "HOLDTAG_MAX_ATTEMPTS";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HoldConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub disposition: DispositionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispositionConfig {
    /// Outcomes that close the tag as soon as they are recorded.
    #[serde(default = "default_auto_close")]
    pub auto_close: Vec<DispositionOutcome>,
    #[serde(default = "default_max_note_len")]
    pub max_note_len: usize,
}

impl Default for DispositionConfig {
    fn default() -> Self {
        Self {
            auto_close: default_auto_close(),
            max_note_len: default_max_note_len(),
        }
    }
}

impl HoldConfig {
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store.busy_timeout_ms)
    }

    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_backoff: Duration::from_millis(self.retry.base_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }

    /// Whether recording `outcome` should also close the tag.
    #[must_use]
    pub fn auto_closes(&self, outcome: DispositionOutcome) -> bool {
        outcome.is_final() && self.disposition.auto_close.contains(&outcome)
    }

    fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            bail!(
                "retry.base_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.base_backoff_ms,
                self.retry.max_backoff_ms
            );
        }
        if self.disposition.auto_close.contains(&DispositionOutcome::Pending) {
            bail!("disposition.auto_close cannot include 'pending'");
        }
        Ok(())
    }
}

/// Load `holdtag.toml` from `root`, falling back to defaults when absent,
/// then apply environment overrides.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the resulting
/// configuration is inconsistent.
pub fn load_config(root: &Path) -> Result<HoldConfig> {
    let path = root.join(CONFIG_FILE_NAME);
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        parse_config(&content).with_context(|| format!("Failed to parse {}", path.display()))?
    } else {
        HoldConfig::default()
    };

    apply_max_attempts_override(&mut config, env::var(MAX_ATTEMPTS_ENV).ok())?;
    config.validate()?;
    Ok(config)
}

/// Parse configuration text without touching the environment.
///
/// # Errors
///
/// Returns an error if the TOML is malformed.
pub fn parse_config(content: &str) -> Result<HoldConfig> {
    toml::from_str::<HoldConfig>(content).context("invalid holdtag configuration")
}

fn apply_max_attempts_override(config: &mut HoldConfig, raw: Option<String>) -> Result<()> {
    let Some(raw) = raw else {
        return Ok(());
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(());
    }
    config.retry.max_attempts = trimmed
        .parse()
        .with_context(|| format!("{MAX_ATTEMPTS_ENV}='{trimmed}' is not a positive integer"))?;
    tracing::debug!(max_attempts = config.retry.max_attempts, "retry budget overridden from env");
    Ok(())
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_max_attempts() -> u32 {
    8
}

const fn default_base_backoff_ms() -> u64 {
    2
}

const fn default_max_backoff_ms() -> u64 {
    50
}

fn default_auto_close() -> Vec<DispositionOutcome> {
    vec![DispositionOutcome::Release, DispositionOutcome::Destroy]
}

const fn default_max_note_len() -> usize {
    2_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_uses_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cfg = load_config(dir.path()).expect("load should succeed");
        assert_eq!(cfg.store.busy_timeout_ms, 5_000);
        assert_eq!(cfg.disposition.max_note_len, 2_000);
        assert!(cfg.auto_closes(DispositionOutcome::Release));
        assert!(cfg.auto_closes(DispositionOutcome::Destroy));
        assert!(!cfg.auto_closes(DispositionOutcome::Rework));
        assert!(!cfg.auto_closes(DispositionOutcome::Pending));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = parse_config(
            r#"
[retry]
max_attempts = 3

[disposition]
auto_close = ["rework"]
"#,
        )
        .expect("parse");
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.base_backoff_ms, 2);
        assert_eq!(cfg.disposition.auto_close, vec![DispositionOutcome::Rework]);
        assert_eq!(cfg.disposition.max_note_len, 2_000);
        assert_eq!(cfg.store, StoreConfig::default());
    }

    #[test]
    fn config_file_is_read_from_root() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[store]\nbusy_timeout_ms = 250\n",
        )
        .expect("write config");
        let cfg = load_config(dir.path()).expect("load");
        assert_eq!(cfg.busy_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[retry\n").expect("write config");
        let err = load_config(dir.path()).expect_err("bad toml");
        assert!(format!("{err:#}").contains(CONFIG_FILE_NAME));
    }

    #[test]
    fn env_override_replaces_max_attempts() {
        let mut cfg = HoldConfig::default();
        apply_max_attempts_override(&mut cfg, Some(" 12 ".into())).expect("override");
        assert_eq!(cfg.retry.max_attempts, 12);

        apply_max_attempts_override(&mut cfg, Some(String::new())).expect("blank is ignored");
        assert_eq!(cfg.retry.max_attempts, 12);

        assert!(apply_max_attempts_override(&mut cfg, Some("many".into())).is_err());
    }

    #[test]
    fn inconsistent_config_is_rejected() {
        let mut cfg = HoldConfig::default();
        cfg.disposition.auto_close.push(DispositionOutcome::Pending);
        assert!(cfg.validate().is_err());

        let mut cfg = HoldConfig::default();
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = HoldConfig::default();
        cfg.retry.base_backoff_ms = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn retry_policy_mirrors_config() {
        let policy = HoldConfig::default().retry_policy();
        assert_eq!(policy.max_attempts, 8);
        assert_eq!(policy.base_backoff, Duration::from_millis(2));
        assert_eq!(policy.max_backoff, Duration::from_millis(50));
    }
}
