use std::time::Duration;

use anyhow::Result;
use config::Config;
use lockstep_common::MAX_INV_ELEMENTS;

/// Tunables for barriers and retries. Loaded from the `harness` table of the
/// process configuration, layered over `config.default.toml`.
#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct HarnessConfig {
    /// Bound on the ping barrier when no test-case timeout applies.
    pub ping_timeout_secs: u64,
    pub verack_timeout_secs: u64,
    pub disconnect_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Attempts for the block reject check before giving up.
    pub reject_retries: u32,
    pub reject_retry_delay_ms: u64,
    /// Pending inventory is flushed as soon as it reaches this many entries.
    pub max_inv_elements: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            ping_timeout_secs: 60,
            verack_timeout_secs: 60,
            disconnect_timeout_secs: 10,
            poll_interval_ms: 50,
            reject_retries: 10,
            reject_retry_delay_ms: 500,
            max_inv_elements: MAX_INV_ELEMENTS,
        }
    }
}

impl HarnessConfig {
    pub const SECTION: &'static str = "harness";

    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        full_config.get::<HarnessConfig>(Self::SECTION)?.validated()
    }

    fn validated(self) -> Result<Self> {
        if self.max_inv_elements == 0 {
            anyhow::bail!("max-inv-elements must be at least 1");
        }
        if self.reject_retries == 0 {
            anyhow::bail!("reject-retries must be at least 1");
        }
        Ok(self)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn verack_timeout(&self) -> Duration {
        Duration::from_secs(self.verack_timeout_secs)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reject_retry_delay(&self) -> Duration {
        Duration::from_millis(self.reject_retry_delay_ms)
    }
}
