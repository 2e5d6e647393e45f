pub mod config;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod json;
pub mod models;
pub mod output;
pub mod pagination;
pub mod ratelimit;
pub mod report;
pub mod result;
pub mod retry;
pub mod runner;
pub mod schema;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::EngineConfig;
pub use dedup::{DedupEngine, DedupKey, FieldKey, Ingest, MergePolicy};
pub use error::{ErrorKind, ScrapeError};
pub use extract::{ExtractionPipeline, PageExtraction};
pub use json::JsonEvaluator;
pub use models::{
    EntryLocator, FetchRequest, FetchResponse, FetchStrategy, PageCursor, Pagination, Payload,
    Record, Target, compute_hash,
};
pub use ratelimit::{RateGrant, RateLimit, RateLimitedFetcher, RateLimiter};
pub use result::{RunStatus, ScrapeOutput, ScrapeResult};
pub use retry::RetryPolicy;
pub use runner::{Ant, AntRunner, ProbeReport};
pub use schema::{ExtractionRule, Schema, Transform};
pub use traits::{Fetcher, KeyFunction, RuleEvaluator};
