use std::future::Future;

use serde_json::Value;

use crate::dedup::DedupKey;
use crate::error::ScrapeError;
use crate::models::{FetchRequest, FetchResponse, FetchStrategy, Record};
use crate::schema::ExtractionRule;

/// Performs one page fetch using a concrete strategy.
///
/// Implementations classify failures into the [`ScrapeError`] fetch kinds
/// and never retry on their own; retrying is [`RetryPolicy`](crate::retry::RetryPolicy)'s job.
pub trait Fetcher: Send + Sync + Clone {
    /// Whether this fetcher can serve targets using `strategy`.
    fn supports(&self, strategy: FetchStrategy) -> bool;

    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<FetchResponse, ScrapeError>> + Send;
}

/// Interprets [`ExtractionRule`] queries against a parsed document.
///
/// The core never looks inside a rule's `query`; this trait is the only
/// place where selector syntax has meaning.
pub trait RuleEvaluator: Send + Sync {
    type Document;

    /// Parse a response into a document, or fail with `DocumentFormat`.
    fn parse(&self, response: &FetchResponse) -> Result<Self::Document, ScrapeError>;

    /// Split a list page into one sub-document per item.
    fn select_items(
        &self,
        document: &Self::Document,
        query: &str,
    ) -> Result<Vec<Self::Document>, ScrapeError>;

    /// Evaluate a rule. `Ok(None)` means no match.
    fn evaluate(
        &self,
        document: &Self::Document,
        rule: &ExtractionRule,
    ) -> Result<Option<Value>, ScrapeError>;

    /// Check rule syntax before a run starts.
    fn validate_rule(
        &self,
        _strategy: FetchStrategy,
        _rule: &ExtractionRule,
    ) -> Result<(), ScrapeError> {
        Ok(())
    }
}

/// Derives the deduplication fingerprint of a record.
///
/// Returning `None` means the record has no identity and is always kept.
pub trait KeyFunction: Send + Sync {
    fn key(&self, record: &Record) -> Option<DedupKey>;
}

impl<T> KeyFunction for T
where
    T: Fn(&Record) -> Option<DedupKey> + Send + Sync,
{
    fn key(&self, record: &Record) -> Option<DedupKey> {
        self(record)
    }
}
