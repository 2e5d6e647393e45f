use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dedup::MergePolicy;
use crate::error::ScrapeError;
use crate::ratelimit::RateLimit;

/// Environment variable consulted when the config leaves `contact` unset.
pub const CONTACT_ENV: &str = "LEAFCUTTER_CONTACT";

/// Engine configuration. Every knob is required; there are no hidden defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Limit applied to any domain without an override.
    pub rate_limit: RateLimit,
    pub domain_rate_limits: HashMap<String, RateLimit>,
    /// Hard ceiling on pages fetched per run.
    pub max_pages: u32,
    /// Hard ceiling on records kept per run.
    pub max_records: usize,
    pub retry: RetryConfig,
    pub dedup_merge: MergePolicy,
    /// Operator contact string (e.g. an email), sent to targets that require it.
    pub contact: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ScrapeError> {
        let config: EngineConfig = serde_json::from_str(raw)
            .map_err(|e| ScrapeError::Config(format!("Invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ScrapeError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ScrapeError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ScrapeError> {
        self.rate_limit.validate("rate_limit")?;
        for (domain, limit) in &self.domain_rate_limits {
            limit.validate(&format!("domain_rate_limits.{domain}"))?;
        }
        if self.max_pages == 0 {
            return Err(ScrapeError::Config("max_pages must be at least 1".into()));
        }
        if self.max_records == 0 {
            return Err(ScrapeError::Config("max_records must be at least 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ScrapeError::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if let Some(contact) = &self.contact
            && contact.trim().is_empty()
        {
            return Err(ScrapeError::Config("contact must not be blank".into()));
        }
        Ok(())
    }

    /// Fill `contact` from `LEAFCUTTER_CONTACT` if the config left it unset.
    pub fn with_contact_from_env(self) -> Self {
        self.with_contact_from(std::env::var(CONTACT_ENV).ok())
    }

    /// Fill `contact` from `fallback` if the config left it unset.
    pub fn with_contact_from(mut self, fallback: Option<String>) -> Self {
        if self.contact.is_none() {
            self.contact = fallback.filter(|c| !c.trim().is_empty());
        }
        self
    }
}
