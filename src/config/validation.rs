use crate::config::types::{
    Config, ListingEntry, RetryConfig, StoreConfig, UserAgentConfig, WorkerConfig,
};
use crate::mapper::MappingDescriptor;
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_store_config(&config.store)?;
    validate_worker_config(&config.worker)?;
    validate_retry_config(&config.retry)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_mappings(&config.mapping)?;
    validate_listings(&config.listing, &config.mapping)?;

    if config.recrawl.interval_secs < 1 {
        return Err(ConfigError::Validation(
            "recrawl interval-secs must be >= 1".to_string(),
        ));
    }

    if config.discovery.token_min_length < 8 {
        return Err(ConfigError::Validation(format!(
            "token-min-length must be >= 8, got {}",
            config.discovery.token_min_length
        )));
    }

    Ok(())
}

fn validate_store_config(config: &StoreConfig) -> Result<(), ConfigError> {
    if config.database_path.trim().is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_worker_config(config: &WorkerConfig) -> Result<(), ConfigError> {
    if config.count < 1 || config.count > 64 {
        return Err(ConfigError::Validation(format!(
            "worker count must be between 1 and 64, got {}",
            config.count
        )));
    }

    if config.batch_size < 1 {
        return Err(ConfigError::Validation(
            "worker batch-size must be >= 1".to_string(),
        ));
    }

    if config.poll_interval_ms < 10 {
        return Err(ConfigError::Validation(format!(
            "poll-interval-ms must be >= 10ms, got {}ms",
            config.poll_interval_ms
        )));
    }

    // A claim must outlive the request that serves it
    if config.claim_timeout_secs <= config.request_timeout_secs {
        return Err(ConfigError::Validation(format!(
            "claim-timeout-secs ({}) must exceed request-timeout-secs ({})",
            config.claim_timeout_secs, config.request_timeout_secs
        )));
    }

    Ok(())
}

fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.max_retries < 1 {
        return Err(ConfigError::Validation(
            "max-retries must be >= 1".to_string(),
        ));
    }

    if config.backoff_factor < 1 {
        return Err(ConfigError::Validation(
            "backoff-factor must be >= 1".to_string(),
        ));
    }

    if config.backoff_cap_secs < config.backoff_base_secs {
        return Err(ConfigError::Validation(format!(
            "backoff-cap-secs ({}) must be >= backoff-base-secs ({})",
            config.backoff_cap_secs, config.backoff_base_secs
        )));
    }

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler-name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler-name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact-url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

fn validate_mappings(mappings: &[MappingDescriptor]) -> Result<(), ConfigError> {
    let mut families = HashSet::new();

    for mapping in mappings {
        mapping.validate().map_err(ConfigError::InvalidMapping)?;

        if !families.insert(mapping.family.as_str()) {
            return Err(ConfigError::InvalidMapping(format!(
                "family '{}' is mapped more than once",
                mapping.family
            )));
        }
    }

    Ok(())
}

/// Every listing must point at an http(s) page and feed a mapped family
fn validate_listings(
    listings: &[ListingEntry],
    mappings: &[MappingDescriptor],
) -> Result<(), ConfigError> {
    for listing in listings {
        let url = Url::parse(&listing.url).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid listing URL '{}': {}", listing.url, e))
        })?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidUrl(format!(
                "Listing URL '{}' must use http or https",
                listing.url
            )));
        }

        if !mappings.iter().any(|m| m.family == listing.family) {
            return Err(ConfigError::Validation(format!(
                "Listing '{}' feeds family '{}', which has no [[mapping]]",
                listing.url, listing.family
            )));
        }
    }

    Ok(())
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    if email.is_empty() {
        return Err(ConfigError::Validation(
            "contact-email cannot be empty".to_string(),
        ));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    if !parts[1].contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(family: &str) -> MappingDescriptor {
        MappingDescriptor {
            family: family.to_string(),
            version: 1,
            natural_key: vec!["id".to_string()],
            fields: vec!["title".to_string()],
            ignore: Vec::new(),
            children: Vec::new(),
        }
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("user@example.com").is_ok());
        assert!(validate_email("admin@sub.example.com").is_ok());

        assert!(validate_email("").is_err());
        assert!(validate_email("invalid").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("user@").is_err());
        assert!(validate_email("user@domain").is_err());
    }

    #[test]
    fn test_worker_claim_timeout_must_exceed_request_timeout() {
        let config = WorkerConfig {
            claim_timeout_secs: 30,
            request_timeout_secs: 30,
            ..WorkerConfig::default()
        };
        assert!(validate_worker_config(&config).is_err());
        assert!(validate_worker_config(&WorkerConfig::default()).is_ok());
    }

    #[test]
    fn test_retry_cap_below_base_rejected() {
        let config = RetryConfig {
            backoff_base_secs: 600,
            backoff_cap_secs: 60,
            ..RetryConfig::default()
        };
        assert!(validate_retry_config(&config).is_err());
    }

    #[test]
    fn test_duplicate_family_rejected() {
        let result = validate_mappings(&[mapping("deputy"), mapping("deputy")]);
        assert!(matches!(result, Err(ConfigError::InvalidMapping(_))));
    }

    #[test]
    fn test_listing_requires_mapped_family() {
        let listing = ListingEntry {
            url: "https://example.org/deputies".to_string(),
            family: "deputy".to_string(),
            href_contains: None,
        };
        assert!(validate_listings(&[listing.clone()], &[mapping("deputy")]).is_ok());
        assert!(validate_listings(&[listing], &[mapping("law")]).is_err());
    }

    #[test]
    fn test_listing_scheme() {
        let listing = ListingEntry {
            url: "ftp://example.org/deputies".to_string(),
            family: "deputy".to_string(),
            href_contains: None,
        };
        assert!(matches!(
            validate_listings(&[listing], &[mapping("deputy")]),
            Err(ConfigError::InvalidUrl(_))
        ));
    }
}
