use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ErrorKind, ScrapeError};
use crate::models::Record;

/// Overall classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// No page failed.
    Success,
    /// Some page failed but records were recovered.
    Partial,
    /// A page failed and nothing was recovered.
    Failure,
    Cancelled,
}

impl RunStatus {
    pub fn classify(cancelled: bool, errors: usize, records: usize) -> Self {
        match (cancelled, errors, records) {
            (true, _, _) => RunStatus::Cancelled,
            (false, 0, _) => RunStatus::Success,
            (false, _, 0) => RunStatus::Failure,
            _ => RunStatus::Partial,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failure => "failure",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure attributed to one page of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageError {
    pub page: u32,
    pub kind: ErrorKind,
    pub message: String,
}

impl PageError {
    pub fn new(page: u32, error: &ScrapeError) -> Self {
        Self {
            page,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub pages_fetched: u32,
    /// Records extracted before deduplication.
    pub records_found: usize,
    pub duplicates_dropped: usize,
    pub retries: u32,
    /// Fetch attempts, retries included.
    #[serde(default)]
    pub requests: u32,
    #[serde(default)]
    pub requests_succeeded: u32,
    /// Wall time spent inside the fetcher, summed over attempts.
    #[serde(default)]
    pub fetch_time_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunStats {
    /// Share of fetch attempts that succeeded; 0 when nothing was fetched.
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        f64::from(self.requests_succeeded) / f64::from(self.requests)
    }

    pub fn avg_fetch_ms(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.fetch_time_ms as f64 / f64::from(self.requests)
    }
}

/// Terminal output of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub run_id: Uuid,
    pub ant: String,
    pub domain: String,
    pub status: RunStatus,
    /// Deduplicated records in first-seen order.
    pub records: Vec<Record>,
    pub errors: Vec<PageError>,
    pub stats: RunStats,
}

/// Serialisable output document: flat records plus a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeOutput {
    pub records: Vec<Map<String, Value>>,
    pub summary: RunSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub ant: String,
    pub domain: String,
    pub status: RunStatus,
    pub pages_fetched: u32,
    pub records_found: usize,
    pub duplicates_dropped: usize,
    pub retries: u32,
    pub requests: u32,
    pub success_rate: f64,
    pub avg_fetch_ms: f64,
    pub errors: Vec<PageError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ScrapeResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            ant: self.ant.clone(),
            domain: self.domain.clone(),
            status: self.status,
            pages_fetched: self.stats.pages_fetched,
            records_found: self.stats.records_found,
            duplicates_dropped: self.stats.duplicates_dropped,
            retries: self.stats.retries,
            requests: self.stats.requests,
            success_rate: self.stats.success_rate(),
            avg_fetch_ms: self.stats.avg_fetch_ms(),
            errors: self.errors.clone(),
            started_at: self.stats.started_at,
            finished_at: self.stats.finished_at,
        }
    }

    pub fn to_output(&self) -> ScrapeOutput {
        ScrapeOutput {
            records: self.records.iter().map(Record::flatten).collect(),
            summary: self.summary(),
        }
    }

    pub fn to_json_pretty(&self) -> Result<String, ScrapeError> {
        Ok(serde_json::to_string_pretty(&self.to_output())?)
    }
}
