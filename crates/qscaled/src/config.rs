//! qscaled.toml configuration parser.
//!
//! Every section and field is optional. Durations are strings with a unit
//! suffix: `"500ms"`, `"5s"`, `"2m"`, `"1h"`; a bare number is seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use qscale_autoscale::{ControllerConfig, ReconcilerConfig};
use qscale_broker::DEFAULT_FAILURE_THRESHOLD;
use qscale_rightsize::RightSizingConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub store: StoreConfig,
    pub reconcile: ReconcileConfig,
    pub broker: BrokerConfig,
    pub right_sizing: RightSizingSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Database file. Defaults to `<data-dir>/qscale.redb`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileConfig {
    pub interval: String,
    pub workers: usize,
    pub pass_timeout: String,
    pub retry_backoff: String,
    pub max_conflict_retries: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: "5s".to_string(),
            workers: 4,
            pass_timeout: "30s".to_string(),
            retry_backoff: "5s".to_string(),
            max_conflict_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub response_timeout: String,
    /// Consecutive failed calls before a cached client is dropped.
    pub failure_threshold: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            response_timeout: "2s".to_string(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RightSizingSection {
    pub threshold_percent: f64,
    pub oom_step_percent: u64,
}

impl Default for RightSizingSection {
    fn default() -> Self {
        let defaults = RightSizingConfig::default();
        Self {
            threshold_percent: defaults.threshold_percent,
            oom_step_percent: defaults.oom_step_percent,
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values that parse but cannot run.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.controller()?;
        self.reconciler()?;
        self.response_timeout()?;
        if self.reconcile.workers == 0 {
            bail!("reconcile.workers must be at least 1");
        }
        if self.broker.failure_threshold == 0 {
            bail!("broker.failure_threshold must be at least 1");
        }
        let threshold = self.right_sizing.threshold_percent;
        if !threshold.is_finite() || threshold < 0.0 {
            bail!("right_sizing.threshold_percent must be a non-negative number, got {threshold}");
        }
        Ok(())
    }

    pub fn store_path(&self, data_dir: &Path) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| data_dir.join("qscale.redb"))
    }

    pub fn controller(&self) -> anyhow::Result<ControllerConfig> {
        Ok(ControllerConfig {
            interval: parse_duration(&self.reconcile.interval).context("reconcile.interval")?,
            workers: self.reconcile.workers,
            retry_backoff: parse_duration(&self.reconcile.retry_backoff)
                .context("reconcile.retry_backoff")?,
        })
    }

    pub fn reconciler(&self) -> anyhow::Result<ReconcilerConfig> {
        Ok(ReconcilerConfig {
            pass_timeout: parse_duration(&self.reconcile.pass_timeout)
                .context("reconcile.pass_timeout")?,
            max_conflict_retries: self.reconcile.max_conflict_retries,
        })
    }

    pub fn response_timeout(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.broker.response_timeout).context("broker.response_timeout")
    }

    pub fn right_sizing(&self) -> RightSizingConfig {
        RightSizingConfig {
            threshold_percent: self.right_sizing.threshold_percent,
            oom_step_percent: self.right_sizing.oom_step_percent,
        }
    }
}

/// Parse a duration string like "500ms", "30s", "5m", "1h".
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, "s"),
    };
    if digits.is_empty() {
        bail!("invalid duration {s:?}: missing number");
    }
    let n: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration {s:?}"))?;
    let duration = match unit {
        "ms" => Duration::from_millis(n),
        "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n.saturating_mul(60)),
        "h" => Duration::from_secs(n.saturating_mul(3600)),
        other => bail!("invalid duration {s:?}: unknown unit {other:?}"),
    };
    if duration.is_zero() {
        bail!("invalid duration {s:?}: must be positive");
    }
    Ok(duration)
}
