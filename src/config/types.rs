use crate::mapper::MappingDescriptor;
use crate::state::{BackoffPolicy, RetryPolicy};
use crate::url::PatternRules;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Chamber-Sync
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub recrawl: RecrawlConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    #[serde(default)]
    pub listing: Vec<ListingEntry>,
    #[serde(default)]
    pub mapping: Vec<MappingDescriptor>,
}

/// Relational store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,
}

/// Fetch/import worker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerConfig {
    /// Number of concurrent workers, each with its own connection
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Claimable records listed per query
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Idle wait between drain loops (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Age after which a claim is considered dead (seconds)
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,

    /// Total time allowed for one HTTP request (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            claim_timeout_secs: default_claim_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Retry budget and backoff configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,

    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_factor: default_backoff_factor(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            BackoffPolicy::new(
                Duration::from_secs(self.backoff_base_secs),
                self.backoff_factor,
                Duration::from_secs(self.backoff_cap_secs),
            ),
        )
    }
}

/// Recrawl scheduling configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RecrawlConfig {
    /// Period of scheduler passes and listing re-scans (seconds)
    #[serde(default = "default_recrawl_interval_secs")]
    pub interval_secs: u64,
}

impl Default for RecrawlConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_recrawl_interval_secs(),
        }
    }
}

impl RecrawlConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// URL pattern derivation configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DiscoveryConfig {
    /// Minimum length of an opaque token value
    #[serde(default = "default_token_min_length")]
    pub token_min_length: usize,

    /// Query parameters always treated as tokens
    #[serde(default)]
    pub token_params: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            token_min_length: default_token_min_length(),
            token_params: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn pattern_rules(&self) -> PatternRules {
        PatternRules::new(self.token_min_length, self.token_params.clone())
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the client
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the client
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the client
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for contact by the publisher
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

impl UserAgentConfig {
    /// Format: Name/Version (+ContactURL; ContactEmail)
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// A listing page linking to resources of one entity family
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListingEntry {
    pub url: String,

    pub family: String,

    /// Only links whose URL contains this string are tracked
    #[serde(default)]
    pub href_contains: Option<String>,
}

fn default_worker_count() -> usize {
    4
}

fn default_batch_size() -> u32 {
    16
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_claim_timeout_secs() -> u64 {
    600
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_secs() -> u64 {
    60
}

fn default_backoff_factor() -> u32 {
    2
}

fn default_backoff_cap_secs() -> u64 {
    24 * 60 * 60
}

fn default_recrawl_interval_secs() -> u64 {
    300
}

fn default_token_min_length() -> usize {
    24
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_header() {
        let ua = UserAgentConfig {
            crawler_name: "ChamberSync".to_string(),
            crawler_version: "0.3".to_string(),
            contact_url: "https://example.org/bot".to_string(),
            contact_email: "ops@example.org".to_string(),
        };
        assert_eq!(
            ua.header_value(),
            "ChamberSync/0.3 (+https://example.org/bot; ops@example.org)"
        );
    }

    #[test]
    fn test_retry_defaults_match_policy_defaults() {
        assert_eq!(RetryConfig::default().policy(), RetryPolicy::default());
    }
}
