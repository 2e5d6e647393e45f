use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dedup::{DedupEngine, MergePolicy, NoKey};
use crate::error::{ErrorKind, ScrapeError};
use crate::extract::ExtractionPipeline;
use crate::models::{FetchRequest, Target};
use crate::pagination::{PageLimits, PageState, PaginationController};
use crate::ratelimit::{RateLimitedFetcher, RateLimiter};
use crate::report::{RunEvent, RunReporter, TracingRunReporter};
use crate::result::{RunStats, RunStatus, ScrapeResult};
use crate::retry::RetryPolicy;
use crate::schema::Schema;
use crate::traits::{Fetcher, KeyFunction, RuleEvaluator};

/// A configured scraper: what to fetch, what to extract, and how to
/// recognise duplicates.
#[derive(Clone)]
pub struct Ant {
    pub name: String,
    pub target: Arc<Target>,
    pub schema: Arc<Schema>,
    pub dedup_key: Arc<dyn KeyFunction>,
}

impl Ant {
    /// An ant that keeps every record (no deduplication key).
    pub fn new(name: impl Into<String>, target: Target, schema: Schema) -> Self {
        Self {
            name: name.into(),
            target: Arc::new(target),
            schema: Arc::new(schema),
            dedup_key: Arc::new(NoKey),
        }
    }

    pub fn with_dedup_key(mut self, key: impl KeyFunction + 'static) -> Self {
        self.dedup_key = Arc::new(key);
        self
    }
}

impl std::fmt::Debug for Ant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ant")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("schema", &self.schema.name)
            .finish_non_exhaustive()
    }
}

/// Outcome of a single health-check fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub reachable: bool,
    pub latency: Duration,
    pub status: Option<u16>,
    pub kind: Option<ErrorKind>,
    pub message: Option<String>,
}

impl ProbeReport {
    fn failed(latency: Duration, err: &ScrapeError) -> Self {
        Self {
            reachable: false,
            latency,
            status: None,
            kind: Some(err.kind()),
            message: Some(err.to_string()),
        }
    }
}

/// Orchestrates runs: preflight checks, pagination, deduplication and
/// outcome classification.
pub struct AntRunner<F, E, R = TracingRunReporter>
where
    F: Fetcher,
    E: RuleEvaluator,
    R: RunReporter,
{
    fetcher: RateLimitedFetcher<F>,
    pipeline: ExtractionPipeline<E>,
    retry: RetryPolicy,
    limits: PageLimits,
    merge: MergePolicy,
    contact: Option<String>,
    reporter: R,
}

impl<F, E> AntRunner<F, E, TracingRunReporter>
where
    F: Fetcher,
    E: RuleEvaluator,
{
    /// Build a runner from a validated config. Fails with `Config` on invalid values.
    pub fn new(fetcher: F, evaluator: E, config: &EngineConfig) -> Result<Self, ScrapeError> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::from_config(config));
        Ok(Self {
            fetcher: RateLimitedFetcher::new(fetcher, limiter),
            pipeline: ExtractionPipeline::new(evaluator),
            retry: RetryPolicy::from_config(&config.retry),
            limits: PageLimits {
                max_pages: config.max_pages,
                max_records: config.max_records,
            },
            merge: config.dedup_merge,
            contact: config.contact.clone(),
            reporter: TracingRunReporter,
        })
    }
}

impl<F, E, R> AntRunner<F, E, R>
where
    F: Fetcher,
    E: RuleEvaluator,
    R: RunReporter,
{
    /// Share an existing limiter (e.g. across several runners).
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.fetcher = RateLimitedFetcher::new(self.fetcher.inner().clone(), limiter);
        self
    }

    pub fn with_reporter<R2: RunReporter>(self, reporter: R2) -> AntRunner<F, E, R2> {
        AntRunner {
            fetcher: self.fetcher,
            pipeline: self.pipeline,
            retry: self.retry,
            limits: self.limits,
            merge: self.merge,
            contact: self.contact,
            reporter,
        }
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        self.fetcher.limiter()
    }

    /// Validate an ant against this runner before any request is made.
    ///
    /// Returns the contact string to attach, if the target requires one.
    fn preflight(&self, ant: &Ant) -> Result<Option<String>, ScrapeError> {
        let strategy = ant.target.strategy;
        if !self.fetcher.supports(strategy) {
            return Err(ScrapeError::Config(format!(
                "Fetcher does not support the {strategy} strategy required by '{}'",
                ant.name
            )));
        }
        let contact = self.contact_for(&ant.target)?;
        self.pipeline.validate_schema(strategy, &ant.schema)?;
        Ok(contact)
    }

    fn contact_for(&self, target: &Target) -> Result<Option<String>, ScrapeError> {
        if !target.requires_contact {
            return Ok(None);
        }
        match &self.contact {
            Some(contact) => Ok(Some(contact.clone())),
            None => Err(ScrapeError::Config(format!(
                "{} requires an operator contact; set `contact` or LEAFCUTTER_CONTACT",
                target.domain
            ))),
        }
    }

    /// Run an ant to completion.
    ///
    /// `Err` is only returned for problems found before the first request
    /// (unsupported strategy, missing contact, invalid schema). Page failures
    /// are reported inside the result.
    pub async fn run(
        &self,
        ant: &Ant,
        cancel: &CancellationToken,
    ) -> Result<ScrapeResult, ScrapeError> {
        let dedup = DedupEngine::new(Arc::clone(&ant.dedup_key), self.merge);
        self.run_with(ant, dedup, cancel).await
    }

    /// Run an ant, treating the keys of `prior` as already seen.
    pub async fn run_with_prior(
        &self,
        ant: &Ant,
        prior: &ScrapeResult,
        cancel: &CancellationToken,
    ) -> Result<ScrapeResult, ScrapeError> {
        let dedup = DedupEngine::new(Arc::clone(&ant.dedup_key), self.merge).with_prior(prior);
        self.run_with(ant, dedup, cancel).await
    }

    async fn run_with(
        &self,
        ant: &Ant,
        mut dedup: DedupEngine,
        cancel: &CancellationToken,
    ) -> Result<ScrapeResult, ScrapeError> {
        let contact = self.preflight(ant)?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.reporter.report(RunEvent::RunStarted {
            run_id,
            ant: &ant.name,
            domain: &ant.target.domain,
        });

        let controller = PaginationController::new(
            &self.fetcher,
            &self.pipeline,
            self.retry,
            self.limits,
            &self.reporter,
            run_id,
        );
        let outcome = controller
            .run(Arc::clone(&ant.target), &ant.schema, contact, &mut dedup, cancel)
            .await;

        let status = RunStatus::classify(
            outcome.state == PageState::Cancelled,
            outcome.errors.len(),
            dedup.len(),
        );
        let duplicates_dropped = dedup.duplicates_dropped();
        let records = dedup.into_records();

        self.reporter.report(RunEvent::RunFinished {
            run_id,
            status,
            pages: outcome.pages_fetched,
            records: records.len(),
        });

        Ok(ScrapeResult {
            run_id,
            ant: ant.name.clone(),
            domain: ant.target.domain.clone(),
            status,
            records,
            errors: outcome.errors,
            stats: RunStats {
                pages_fetched: outcome.pages_fetched,
                records_found: outcome.records_found,
                duplicates_dropped,
                retries: outcome.retries,
                requests: outcome.requests,
                requests_succeeded: outcome.requests_succeeded,
                fetch_time_ms: outcome.fetch_time.as_millis() as u64,
                started_at,
                finished_at: Utc::now(),
            },
        })
    }

    /// One rate-limited fetch of the entry page, without retry. Never fails:
    /// problems are reported in the [`ProbeReport`].
    pub async fn probe(&self, target: &Target) -> ProbeReport {
        let start = Instant::now();
        if !self.fetcher.supports(target.strategy) {
            let err = ScrapeError::Config(format!(
                "Fetcher does not support the {} strategy",
                target.strategy
            ));
            return ProbeReport::failed(start.elapsed(), &err);
        }
        let contact = match self.contact_for(target) {
            Ok(contact) => contact,
            Err(err) => return ProbeReport::failed(start.elapsed(), &err),
        };

        let request = FetchRequest::first(Arc::new(target.clone()), contact);
        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                tracing::debug!(domain = %target.domain, status = response.status, "Probe succeeded");
                ProbeReport {
                    reachable: true,
                    latency: start.elapsed(),
                    status: Some(response.status),
                    kind: None,
                    message: None,
                }
            }
            Err(err) => {
                tracing::debug!(domain = %target.domain, error = %err, "Probe failed");
                ProbeReport::failed(start.elapsed(), &err)
            }
        }
    }

    /// Run independent ants concurrently, at most `concurrency` at a time.
    ///
    /// All runs share this runner's rate limiter. Results are returned in the
    /// order of `ants`.
    pub async fn run_all(
        &self,
        ants: &[Ant],
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Vec<Result<ScrapeResult, ScrapeError>> {
        futures::stream::iter(ants.iter().map(|ant| self.run(ant, cancel)))
            .buffered(concurrency.max(1))
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::FieldKey;
    use crate::json::JsonEvaluator;
    use crate::models::{FetchResponse, FetchStrategy, Pagination};
    use crate::ratelimit::RateLimit;
    use crate::schema::{ExtractionRule, Transform};
    use crate::testutil::{MockFetcher, RecordingReporter, json_page, record, result_with, test_config};
    use serde_json::json;

    fn listing_target() -> Target {
        Target::new("https://jobs.example.com/api/jobs", FetchStrategy::JsonApi)
            .unwrap()
            .with_pagination(Pagination::NextLink)
    }

    fn jobs_schema() -> Schema {
        Schema::new("jobs")
            .with_items("jobs")
            .required_field("title", ExtractionRule::new("title"))
            .required_field("company", ExtractionRule::new("company"))
            .field("price", ExtractionRule::new("salary"))
            .transform(Transform::Number)
            .with_next_page(ExtractionRule::new("next"))
    }

    fn jobs_ant() -> Ant {
        Ant::new("jobs", listing_target(), jobs_schema())
            .with_dedup_key(FieldKey::new(["title", "company"]))
    }

    /// Five pages of two jobs each; page 3 serves an error page.
    fn five_pages_failing_on_third() -> MockFetcher {
        MockFetcher::from_fn(|req| {
            let url = req.url()?.to_string();
            let page = req.page;
            if page == 3 {
                return Ok(FetchResponse::html(url, "<html><body>Service update</body></html>"));
            }
            Ok(json_page(
                &url,
                json!({
                    "jobs": [
                        {"title": format!("Engineer {page}"), "company": "Acme", "salary": "$100,000"},
                        {"title": format!("Analyst {page}"), "company": "Acme"}
                    ],
                    "next": if page < 5 { json!(format!("/api/jobs?page={}", page + 1)) } else { json!(null) }
                }),
            ))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_result_preserves_earlier_pages() {
        let runner = AntRunner::new(
            five_pages_failing_on_third(),
            JsonEvaluator::new(),
            &test_config(),
        )
        .unwrap();
        let result = runner
            .run(&jobs_ant(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Partial);
        assert_eq!(result.records.len(), 4);
        assert_eq!(result.stats.pages_fetched, 3);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].page, 3);
        assert_eq!(result.errors[0].kind, ErrorKind::DocumentFormatError);
        assert_eq!(result.records[0].get("price"), Some(&json!(100000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_multi_page_run() {
        let fetcher = MockFetcher::from_fn(|req| {
            let page = req.page;
            Ok(json_page(
                &req.url()?.to_string(),
                json!({
                    "jobs": [
                        {"title": format!("Engineer {page}"), "company": "Acme"},
                        // Same posting listed on every page.
                        {"title": "Featured Role", "company": "ACME"}
                    ],
                    "next": if page < 3 { json!(format!("/api/jobs?page={}", page + 1)) } else { json!(null) }
                }),
            ))
        });
        let runner = AntRunner::new(fetcher, JsonEvaluator::new(), &test_config()).unwrap();
        let result = runner
            .run(&jobs_ant(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.stats.pages_fetched, 3);
        assert_eq!(result.stats.records_found, 6);
        assert_eq!(result.stats.duplicates_dropped, 2);
        let titles: Vec<_> = result.records.iter().map(|r| r.text("title").unwrap()).collect();
        assert_eq!(titles, ["Engineer 1", "Featured Role", "Engineer 2", "Engineer 3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_required_field_is_failure_without_records() {
        let fetcher = MockFetcher::from_fn(|req| {
            Ok(json_page(
                &req.url()?.to_string(),
                json!({"jobs": [{"title": "No company listed"}]}),
            ))
        });
        let runner = AntRunner::new(fetcher, JsonEvaluator::new(), &test_config()).unwrap();
        let result = runner
            .run(&jobs_ant(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Failure);
        assert!(result.records.is_empty());
        assert_eq!(result.errors[0].kind, ErrorKind::MissingRequiredField);
        assert!(result.errors[0].message.contains("company"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_is_reported() {
        let fetcher = MockFetcher::always_err(|| ScrapeError::Transient("HTTP 503".into()));
        let runner = AntRunner::new(fetcher.clone(), JsonEvaluator::new(), &test_config()).unwrap();
        let result = runner
            .run(&jobs_ant(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Failure);
        assert_eq!(result.errors[0].kind, ErrorKind::RetriesExhausted);
        assert_eq!(result.stats.retries, 2);
        assert_eq!(fetcher.call_count(), 3);
        assert_eq!(result.stats.requests, 3);
        assert_eq!(result.stats.requests_succeeded, 0);
        assert_eq!(result.stats.success_rate(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_slows_the_shared_limiter() {
        let fetcher = MockFetcher::always_err(|| ScrapeError::RateLimited("HTTP 429".into()));
        let runner = AntRunner::new(fetcher.clone(), JsonEvaluator::new(), &test_config()).unwrap();
        let ant = jobs_ant();
        let result = runner.run(&ant, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.errors[0].kind, ErrorKind::RetriesExhausted);
        // Three 429s: 100/s halved three times.
        assert_eq!(runner.rate_limiter().current_rate(&ant.target.domain), 12.5);
    }

    #[tokio::test]
    async fn test_unsupported_strategy_is_refused() {
        let fetcher = MockFetcher::html("<html></html>").with_strategies(&[FetchStrategy::StaticHttp]);
        let runner = AntRunner::new(fetcher.clone(), JsonEvaluator::new(), &test_config()).unwrap();
        let err = runner
            .run(&jobs_ant(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Config(_)));
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_is_refused() {
        let mut config = test_config();
        config.max_pages = 0;
        assert!(AntRunner::new(MockFetcher::html(""), JsonEvaluator::new(), &config).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_contact_required_and_passed_through() {
        let fetcher = MockFetcher::from_fn(|req| match req.contact.as_deref() {
            Some("ops@example.com") => Ok(json_page(
                &req.url()?.to_string(),
                json!({"jobs": [{"title": "t", "company": "c"}]}),
            )),
            _ => Err(ScrapeError::Blocked("missing contact".into())),
        });
        let ant = Ant::new(
            "sec",
            listing_target().requiring_contact(),
            jobs_schema(),
        );

        let without = AntRunner::new(fetcher.clone(), JsonEvaluator::new(), &test_config()).unwrap();
        let err = without.run(&ant, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ScrapeError::Config(ref m) if m.contains("contact")));

        let config = test_config().with_contact_from(Some("ops@example.com".into()));
        let with = AntRunner::new(fetcher, JsonEvaluator::new(), &config).unwrap();
        let result = with.run(&ant, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.records.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contact_not_sent_when_not_required() {
        let fetcher = MockFetcher::from_fn(|req| {
            assert!(req.contact.is_none());
            Ok(json_page(
                &req.url()?.to_string(),
                json!({"jobs": [{"title": "t", "company": "c"}]}),
            ))
        });
        let config = test_config().with_contact_from(Some("ops@example.com".into()));
        let runner = AntRunner::new(fetcher, JsonEvaluator::new(), &config).unwrap();
        let result = runner.run(&jobs_ant(), &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_surfaces_cancelled() {
        let fetcher = MockFetcher::from_fn(|req| {
            let page = req.page;
            Ok(json_page(
                &req.url()?.to_string(),
                json!({
                    "jobs": [{"title": format!("t{page}"), "company": "c"}],
                    "next": format!("/api/jobs?page={}", page + 1)
                }),
            ))
        })
        .with_latency(Duration::from_secs(1));
        let mut config = test_config();
        config.max_pages = 100;
        let runner = AntRunner::new(fetcher, JsonEvaluator::new(), &config).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });
        let result = runner.run(&jobs_ant(), &cancel).await.unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.records.len(), 2);
        assert!(result.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_prior_skips_known_records() {
        let fetcher = MockFetcher::from_fn(|req| {
            Ok(json_page(
                &req.url()?.to_string(),
                json!({"jobs": [
                    {"title": "Known Role", "company": "Acme"},
                    {"title": "New Role", "company": "Acme"}
                ]}),
            ))
        });
        let runner = AntRunner::new(fetcher, JsonEvaluator::new(), &test_config()).unwrap();
        let prior = result_with(vec![record(1, json!({"title": "known role", "company": "ACME"}))]);
        let result = runner
            .run_with_prior(&jobs_ant(), &prior, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].text("title").unwrap(), "New Role");
        assert_eq!(result.stats.duplicates_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_reports_instead_of_failing() {
        let ok = MockFetcher::html("<html></html>");
        let runner = AntRunner::new(ok, JsonEvaluator::new(), &test_config()).unwrap();
        let report = runner.probe(&listing_target()).await;
        assert!(report.reachable);
        assert_eq!(report.status, Some(200));
        assert!(report.kind.is_none());

        let blocked = MockFetcher::always_err(|| ScrapeError::Blocked("captcha".into()));
        let runner = AntRunner::new(blocked.clone(), JsonEvaluator::new(), &test_config()).unwrap();
        let report = runner.probe(&listing_target()).await;
        assert!(!report.reachable);
        assert_eq!(report.kind, Some(ErrorKind::Blocked));
        assert_eq!(blocked.call_count(), 1);

        // Transient failures are not retried by a probe.
        let flaky = MockFetcher::always_err(|| ScrapeError::Transient("timeout".into()));
        let runner = AntRunner::new(flaky.clone(), JsonEvaluator::new(), &test_config()).unwrap();
        let report = runner.probe(&listing_target()).await;
        assert_eq!(report.kind, Some(ErrorKind::Transient));
        assert_eq!(flaky.call_count(), 1);

        let report = runner.probe(&listing_target().requiring_contact()).await;
        assert_eq!(report.kind, Some(ErrorKind::Config));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_all_shares_rate_limiter() {
        let fetcher = MockFetcher::from_fn(|req| {
            Ok(json_page(
                &req.url()?.to_string(),
                json!({"jobs": [{"title": req.url()?.path().to_string(), "company": "c"}]}),
            ))
        });
        let mut config = test_config();
        config.rate_limit = RateLimit::new(1.0, 1);
        let runner = AntRunner::new(fetcher.clone(), JsonEvaluator::new(), &config)
            .unwrap()
            .with_rate_limiter(Arc::new(RateLimiter::new(RateLimit::new(1.0, 1))));

        let ants: Vec<Ant> = (0..3)
            .map(|i| {
                let target = Target::new(
                    &format!("https://jobs.example.com/board/{i}"),
                    FetchStrategy::JsonApi,
                )
                .unwrap();
                Ant::new(format!("board-{i}"), target, jobs_schema())
            })
            .collect();

        let start = Instant::now();
        let results = runner.run_all(&ants, 3, &CancellationToken::new()).await;
        assert_eq!(results.len(), 3);
        for (i, result) in results.iter().enumerate() {
            let result = result.as_ref().unwrap();
            assert_eq!(result.ant, format!("board-{i}"));
            assert_eq!(result.status, RunStatus::Success);
        }
        // Three same-domain requests at 1/s need at least two seconds.
        assert!(start.elapsed() + Duration::from_millis(1) >= Duration::from_secs(2));
        assert_eq!(fetcher.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_sees_run_lifecycle() {
        let fetcher = MockFetcher::from_fn(|req| {
            Ok(json_page(
                &req.url()?.to_string(),
                json!({"jobs": [{"title": "t", "company": "c"}]}),
            ))
        });
        let reporter = RecordingReporter::default();
        let runner = AntRunner::new(fetcher, JsonEvaluator::new(), &test_config())
            .unwrap()
            .with_reporter(reporter.clone());
        runner.run(&jobs_ant(), &CancellationToken::new()).await.unwrap();

        let events = reporter.events();
        assert_eq!(events.first(), Some(&"run_started"));
        assert_eq!(events.last(), Some(&"run_finished"));
        assert!(events.contains(&"page_fetched"));
        assert!(events.contains(&"page_extracted"));
    }
}
