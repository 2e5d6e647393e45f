//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{EngineConfig, RetryConfig};
use crate::dedup::MergePolicy;
use crate::error::ScrapeError;
use crate::models::{FetchRequest, FetchResponse, FetchStrategy, Provenance, Record};
use crate::pagination::PageState;
use crate::ratelimit::RateLimit;
use crate::report::{RunEvent, RunReporter};
use crate::result::{RunStats, RunStatus, ScrapeResult};
use crate::traits::Fetcher;

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

type ResponderFn = dyn Fn(&FetchRequest) -> Result<FetchResponse, ScrapeError> + Send + Sync;

#[derive(Clone)]
enum Responder {
    /// Each call pops the first element; an empty queue answers `NotFound`.
    Script(Arc<Mutex<VecDeque<Result<FetchResponse, ScrapeError>>>>),
    Func(Arc<ResponderFn>),
}

/// One recorded fetch.
#[derive(Debug, Clone)]
pub struct Call {
    pub url: String,
    pub page: u32,
    pub at: Instant,
}

/// Mock fetcher with a scripted or computed response.
#[derive(Clone)]
pub struct MockFetcher {
    responder: Responder,
    calls: Arc<Mutex<Vec<Call>>>,
    latency: Duration,
    strategies: Vec<FetchStrategy>,
}

impl MockFetcher {
    fn with_responder(responder: Responder) -> Self {
        Self {
            responder,
            calls: Arc::new(Mutex::new(Vec::new())),
            latency: Duration::ZERO,
            strategies: vec![
                FetchStrategy::StaticHttp,
                FetchStrategy::JsonApi,
                FetchStrategy::Browser,
            ],
        }
    }

    /// Always answer with the same HTML body.
    pub fn html(body: &str) -> Self {
        let body = body.to_string();
        Self::from_fn(move |req| Ok(FetchResponse::html(req.url()?.to_string(), body.clone())))
    }

    pub fn scripted(responses: Vec<Result<FetchResponse, ScrapeError>>) -> Self {
        Self::with_responder(Responder::Script(Arc::new(Mutex::new(responses.into()))))
    }

    pub fn from_fn<G>(f: G) -> Self
    where
        G: Fn(&FetchRequest) -> Result<FetchResponse, ScrapeError> + Send + Sync + 'static,
    {
        Self::with_responder(Responder::Func(Arc::new(f)))
    }

    pub fn always_err<G>(make: G) -> Self
    where
        G: Fn() -> ScrapeError + Send + Sync + 'static,
    {
        Self::from_fn(move |_| Err(make()))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_strategies(mut self, strategies: &[FetchStrategy]) -> Self {
        self.strategies = strategies.to_vec();
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Fetcher for MockFetcher {
    fn supports(&self, strategy: FetchStrategy) -> bool {
        self.strategies.contains(&strategy)
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, ScrapeError> {
        let url = request
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|_| "<invalid>".into());
        self.calls.lock().unwrap().push(Call {
            url,
            page: request.page,
            at: Instant::now(),
        });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match &self.responder {
            Responder::Script(queue) => queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ScrapeError::NotFound("no scripted response".into()))),
            Responder::Func(f) => f(request),
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Reporter that keeps state transitions and event names.
#[derive(Debug, Default, Clone)]
pub struct RecordingReporter {
    transitions: Arc<Mutex<Vec<(PageState, PageState)>>>,
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl RecordingReporter {
    pub fn transitions(&self) -> Vec<(PageState, PageState)> {
        self.transitions.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }
}

impl RunReporter for RecordingReporter {
    fn report(&self, event: RunEvent<'_>) {
        let name = match &event {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::StateChanged { from, to, .. } => {
                self.transitions.lock().unwrap().push((*from, *to));
                "state_changed"
            }
            RunEvent::PageFetched { .. } => "page_fetched",
            RunEvent::PageExtracted { .. } => "page_extracted",
            RunEvent::PageFailed { .. } => "page_failed",
            RunEvent::RunFinished { .. } => "run_finished",
        };
        self.events.lock().unwrap().push(name);
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn fixed_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// A record whose fields are taken from a JSON object.
pub fn record(page: u32, fields: Value) -> Record {
    let Value::Object(fields) = fields else {
        panic!("record fields must be a JSON object");
    };
    Record {
        fields,
        provenance: Provenance {
            source_url: format!("https://example.com/list?page={page}"),
            page,
            extracted_at: fixed_time(),
        },
    }
}

pub fn json_page(url: &str, body: Value) -> FetchResponse {
    FetchResponse::json(url, body)
}

pub fn result_with(records: Vec<Record>) -> ScrapeResult {
    ScrapeResult {
        run_id: Uuid::new_v4(),
        ant: "test".into(),
        domain: "example.com".into(),
        status: RunStatus::Success,
        stats: RunStats {
            pages_fetched: 1,
            records_found: records.len(),
            duplicates_dropped: 0,
            retries: 0,
            requests: 1,
            requests_succeeded: 1,
            fetch_time_ms: 0,
            started_at: fixed_time(),
            finished_at: fixed_time(),
        },
        records,
        errors: Vec::new(),
    }
}

/// Config with fast retries and generous limits.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        rate_limit: RateLimit::new(100.0, 1),
        domain_rate_limits: HashMap::new(),
        max_pages: 20,
        max_records: 10_000,
        retry: RetryConfig {
            max_retries: 2,
            base_delay_ms: 10,
            max_delay_ms: 40,
        },
        dedup_merge: MergePolicy::Disabled,
        contact: None,
    }
}
