use serde::Deserialize;
use std::{error::Error, fs};
use url::Url;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CommonConfig {
    pub project_name: String,
    /// Empty means "run on the in-memory store" (development / tests).
    #[serde(default)]
    pub database_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub server_address: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1:3000".to_string(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Outbound delivery channels: the customer-facing and operator-facing bot
/// services, both plain HTTP.
#[derive(Debug, Deserialize, Clone)]
pub struct BotsConfig {
    pub customer_bot_url: Url,
    pub admin_bot_url: Url,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

impl Default for BotsConfig {
    fn default() -> Self {
        Self {
            customer_bot_url: Url::parse("http://localhost:8001").unwrap(),
            admin_bot_url: Url::parse("http://localhost:8002").unwrap(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

/// Per-queue tuning. Defaults match the production notification queue.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stalled_after_ms")]
    pub stalled_after_ms: u64,
    #[serde(default = "default_stall_check_interval_ms")]
    pub stall_check_interval_ms: u64,
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,
    /// Completed jobs are retained up to this age/count, oldest discarded first.
    #[serde(default = "default_keep_completed_age_secs")]
    pub keep_completed_age_secs: u64,
    #[serde(default = "default_keep_completed_count")]
    pub keep_completed_count: usize,
    /// Failed (dead-letter) jobs are kept longer for diagnostics.
    #[serde(default = "default_keep_failed_age_secs")]
    pub keep_failed_age_secs: u64,
    #[serde(default = "default_keep_failed_count")]
    pub keep_failed_count: usize,
}

fn default_concurrency() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_stalled_after_ms() -> u64 {
    30_000
}

fn default_stall_check_interval_ms() -> u64 {
    30_000
}

fn default_max_stalled_count() -> u32 {
    1
}

fn default_keep_completed_age_secs() -> u64 {
    3_600
}

fn default_keep_completed_count() -> usize {
    1_000
}

fn default_keep_failed_age_secs() -> u64 {
    24 * 3_600
}

fn default_keep_failed_count() -> usize {
    5_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            stalled_after_ms: default_stalled_after_ms(),
            stall_check_interval_ms: default_stall_check_interval_ms(),
            max_stalled_count: default_max_stalled_count(),
            keep_completed_age_secs: default_keep_completed_age_secs(),
            keep_completed_count: default_keep_completed_count(),
            keep_failed_age_secs: default_keep_failed_age_secs(),
            keep_failed_count: default_keep_failed_count(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct QueuesConfig {
    #[serde(default)]
    pub notifications: QueueConfig,
    #[serde(default)]
    pub images: QueueConfig,
    #[serde(default)]
    pub reports: QueueConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AbandonmentConfig {
    #[serde(default = "default_idle_threshold_hours")]
    pub idle_threshold_hours: i64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_reminder_check_interval_secs")]
    pub reminder_check_interval_secs: u64,
}

fn default_idle_threshold_hours() -> i64 {
    24
}

fn default_sweep_interval_secs() -> u64 {
    3_600
}

fn default_reminder_check_interval_secs() -> u64 {
    6 * 3_600
}

impl Default for AbandonmentConfig {
    fn default() -> Self {
        Self {
            idle_threshold_hours: default_idle_threshold_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
            reminder_check_interval_secs: default_reminder_check_interval_secs(),
        }
    }
}

/// Bounded grace for draining queues on shutdown. In-flight jobs past the
/// grace are abandoned, not failed.
#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    #[serde(default = "default_job_grace_ms")]
    pub job_grace_ms: u64,
    #[serde(default = "default_total_grace_ms")]
    pub total_grace_ms: u64,
}

fn default_job_grace_ms() -> u64 {
    5_000
}

fn default_total_grace_ms() -> u64 {
    10_000
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            job_grace_ms: default_job_grace_ms(),
            total_grace_ms: default_total_grace_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub common: CommonConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub bots: BotsConfig,
    #[serde(default)]
    pub queues: QueuesConfig,
    #[serde(default)]
    pub abandonment: AbandonmentConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Config {
    pub fn load(config_path: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let contents = fs::read_to_string(config_path)?;
        let config = serde_yml::from_str(&contents)?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_fills_defaults() {
        let config: Config = serde_yml::from_str(
            r#"
common:
  project_name: storefront
server:
  server_address: "127.0.0.1:3000"
queues:
  notifications:
    concurrency: 5
"#,
        )
        .unwrap();

        assert_eq!(config.common.project_name, "storefront");
        assert_eq!(config.queues.notifications.concurrency, 5);
        assert_eq!(config.queues.notifications.max_attempts, 3);
        assert_eq!(config.queues.images.concurrency, 1);
        assert_eq!(config.abandonment.idle_threshold_hours, 24);
        assert_eq!(config.shutdown.job_grace_ms, 5_000);
        assert_eq!(config.bots.retry_attempts, 3);
    }
}
