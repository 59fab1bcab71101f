use std::cmp;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CrawlError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlerConfig {
    /// Number of browser pages kept open
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Attempts per item, rate limited attempts excluded
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Startup delay between two consecutive workers
    #[serde(default = "default_worker_start_delay_ms")]
    pub worker_start_delay_ms: u64,

    /// Minimum delay between two items started by a worker (or by all
    /// workers when `stagger` is shared)
    #[serde(default = "default_min_action_interval_ms")]
    pub min_action_interval_ms: u64,

    #[serde(default)]
    pub stagger: StaggerScope,

    #[serde(default = "default_rate_limit_backoff_secs")]
    pub rate_limit_backoff_secs: u64,

    /// How many recent tweet ids are loaded to recognize known items
    #[serde(default = "default_known_ids_limit")]
    pub known_ids_limit: usize,

    /// Stop scrolling after this many consecutive known items
    #[serde(default = "default_early_stop_after")]
    pub early_stop_after: Option<usize>,

    #[serde(default)]
    pub order: ItemOrder,

    #[serde(default)]
    pub on_existing_run: ResumePolicy,

    #[serde(default = "default_run_retention_days")]
    pub run_retention_days: u32,

    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,

    /// Upper bound on the wait for in-flight work after an interruption
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Site root the timeline url is built from
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_handle_sigint")]
    pub handle_sigint: bool,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_workers: default_max_workers(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            worker_start_delay_ms: default_worker_start_delay_ms(),
            min_action_interval_ms: default_min_action_interval_ms(),
            stagger: StaggerScope::default(),
            rate_limit_backoff_secs: default_rate_limit_backoff_secs(),
            known_ids_limit: default_known_ids_limit(),
            early_stop_after: default_early_stop_after(),
            order: ItemOrder::default(),
            on_existing_run: ResumePolicy::default(),
            run_retention_days: default_run_retention_days(),
            download_concurrency: default_download_concurrency(),
            drain_timeout_secs: default_drain_timeout_secs(),
            output_dir: default_output_dir(),
            base_url: default_base_url(),
            handle_sigint: default_handle_sigint(),
        }
    }
}

impl CrawlerConfig {
    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.pool_size == 0 {
            return Err(CrawlError::Config("poolSize must be at least 1".into()));
        }
        if self.max_workers == 0 {
            return Err(CrawlError::Config("maxWorkers must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(CrawlError::Config("maxRetries must be at least 1".into()));
        }
        if self.download_concurrency == 0 {
            return Err(CrawlError::Config(
                "downloadConcurrency must be at least 1".into(),
            ));
        }
        if url::Url::parse(&self.base_url).is_err() {
            return Err(CrawlError::Config(format!(
                "baseUrl {:?} is not a valid url",
                self.base_url
            )));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(CrawlError::Config(
                "retryBaseDelayMs cannot exceed retryMaxDelayMs".into(),
            ));
        }
        Ok(())
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_secs(self.rate_limit_backoff_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Media timeline of an already normalized account name.
    pub fn timeline_url(&self, account: &str) -> String {
        format!("{}/{account}/media", self.base_url.trim_end_matches('/'))
    }
}

fn default_pool_size() -> usize {
    3
}

fn default_max_workers() -> usize {
    cmp::max(1, num_cpus::get().saturating_sub(2)).min(default_pool_size())
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    2_000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_worker_start_delay_ms() -> u64 {
    1_500
}

fn default_min_action_interval_ms() -> u64 {
    1_000
}

fn default_rate_limit_backoff_secs() -> u64 {
    60
}

fn default_known_ids_limit() -> usize {
    1_000
}

fn default_early_stop_after() -> Option<usize> {
    Some(20)
}

fn default_run_retention_days() -> u32 {
    7
}

fn default_download_concurrency() -> usize {
    4
}

fn default_drain_timeout_secs() -> u64 {
    30
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_base_url() -> String {
    "https://x.com".into()
}

fn default_handle_sigint() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum StaggerScope {
    /// Each worker spaces its own items
    #[default]
    PerWorker,
    /// All workers share one spacing schedule
    Shared,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ItemOrder {
    /// Timeline order, newest first
    #[default]
    Forward,
    /// Oldest first
    Reverse,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ResumePolicy {
    /// Continue the interrupted run
    #[default]
    Resume,
    /// Cancel the interrupted run and start a new one
    Restart,
}
