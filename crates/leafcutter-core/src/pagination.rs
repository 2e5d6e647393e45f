//! The per-run pagination state machine.
//!
//! ```text
//! Start -> FetchingPage -> ExtractingPage -> AwaitingNextCursor -> FetchingPage ...
//!               |                |                  |
//!               v                v                  v
//!        Failed/Cancelled     Failed              Done
//! ```
//!
//! Pages are fetched strictly one after another: each request depends on the
//! cursor derived from the previous page. Any ambiguous continuation signal
//! ends the run as `Done`.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::dedup::{DedupEngine, Ingest};
use crate::error::ScrapeError;
use crate::extract::{ExtractionPipeline, PageExtraction};
use crate::models::{CursorState, FetchRequest, FetchResponse, PageCursor, Pagination, Target};
use crate::report::{RunEvent, RunReporter};
use crate::result::PageError;
use crate::retry::RetryPolicy;
use crate::schema::Schema;
use crate::traits::{Fetcher, RuleEvaluator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageState {
    Start,
    FetchingPage,
    ExtractingPage,
    AwaitingNextCursor,
    Done,
    Failed,
    Cancelled,
}

impl PageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PageState::Done | PageState::Failed | PageState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PageState::Start => "start",
            PageState::FetchingPage => "fetching-page",
            PageState::ExtractingPage => "extracting-page",
            PageState::AwaitingNextCursor => "awaiting-next-cursor",
            PageState::Done => "done",
            PageState::Failed => "failed",
            PageState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hard ceilings for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub max_pages: u32,
    pub max_records: usize,
}

/// What the controller reports once it reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationOutcome {
    pub state: PageState,
    pub pages_fetched: u32,
    /// Records extracted before deduplication.
    pub records_found: usize,
    pub retries: u32,
    /// Fetch attempts, retries included.
    pub requests: u32,
    pub requests_succeeded: u32,
    /// Wall time spent inside the fetcher.
    pub fetch_time: Duration,
    pub errors: Vec<PageError>,
}

/// Drives fetch -> extract -> dedup cycles for one target.
pub struct PaginationController<'a, F, E> {
    fetcher: &'a F,
    pipeline: &'a ExtractionPipeline<E>,
    retry: RetryPolicy,
    limits: PageLimits,
    reporter: &'a dyn RunReporter,
    run_id: Uuid,
}

struct Progress {
    state: PageState,
    request: FetchRequest,
    response: Option<FetchResponse>,
    extraction: Option<PageExtraction>,
    new_records: usize,
    limit_reached: bool,
    visited: HashSet<String>,
    outcome: PaginationOutcome,
}

impl<'a, F: Fetcher, E: RuleEvaluator> PaginationController<'a, F, E> {
    pub fn new(
        fetcher: &'a F,
        pipeline: &'a ExtractionPipeline<E>,
        retry: RetryPolicy,
        limits: PageLimits,
        reporter: &'a dyn RunReporter,
        run_id: Uuid,
    ) -> Self {
        Self {
            fetcher,
            pipeline,
            retry,
            limits,
            reporter,
            run_id,
        }
    }

    /// Run pages until a terminal state, handing records to `dedup`.
    ///
    /// Records already ingested are never discarded, whatever the final state.
    pub async fn run(
        &self,
        target: Arc<Target>,
        schema: &Schema,
        contact: Option<String>,
        dedup: &mut DedupEngine,
        cancel: &CancellationToken,
    ) -> PaginationOutcome {
        let mut p = Progress {
            state: PageState::Start,
            request: FetchRequest::first(target, contact),
            response: None,
            extraction: None,
            new_records: 0,
            limit_reached: false,
            visited: HashSet::new(),
            outcome: PaginationOutcome {
                state: PageState::Start,
                pages_fetched: 0,
                records_found: 0,
                retries: 0,
                requests: 0,
                requests_succeeded: 0,
                fetch_time: Duration::ZERO,
                errors: Vec::new(),
            },
        };

        while !p.state.is_terminal() {
            let next = match p.state {
                PageState::Start => PageState::FetchingPage,
                PageState::FetchingPage => self.fetch_page(&mut p, cancel).await,
                PageState::ExtractingPage => self.extract_page(&mut p, schema, dedup),
                PageState::AwaitingNextCursor => self.advance(&mut p, schema),
                PageState::Done | PageState::Failed | PageState::Cancelled => break,
            };
            self.reporter.report(RunEvent::StateChanged {
                run_id: self.run_id,
                page: p.request.page,
                from: p.state,
                to: next,
            });
            p.state = next;
        }

        p.outcome.state = p.state;
        p.outcome
    }

    async fn fetch_page(&self, p: &mut Progress, cancel: &CancellationToken) -> PageState {
        if cancel.is_cancelled() {
            return PageState::Cancelled;
        }
        let page = p.request.page;
        let url = match p.request.url() {
            Ok(url) => url,
            Err(err) => return self.fail(p, page, err),
        };
        p.visited.insert(url.to_string());

        let attempt = self.retry.execute(self.fetcher, &p.request, cancel).await;
        p.outcome.retries += attempt.retries;
        p.outcome.requests += attempt.attempts;
        p.outcome.fetch_time += attempt.fetch_time;

        match attempt.result {
            Ok(response) => {
                p.outcome.pages_fetched += 1;
                p.outcome.requests_succeeded += 1;
                // Redirects count as visited too.
                p.visited.insert(response.final_url.clone());
                self.reporter.report(RunEvent::PageFetched {
                    run_id: self.run_id,
                    page,
                    url: url.as_str(),
                    status: response.status,
                    retries: attempt.retries,
                });
                p.response = Some(response);
                PageState::ExtractingPage
            }
            Err(ScrapeError::Cancelled) => PageState::Cancelled,
            Err(err) => self.fail(p, page, err),
        }
    }

    fn extract_page(&self, p: &mut Progress, schema: &Schema, dedup: &mut DedupEngine) -> PageState {
        let page = p.request.page;
        let Some(response) = p.response.as_ref() else {
            return self.fail(p, page, ScrapeError::DocumentFormat("no response to extract".into()));
        };

        let extraction = match self.pipeline.extract_page(response, schema, page) {
            Ok(extraction) => extraction,
            Err(err) => return self.fail(p, page, err),
        };

        p.outcome.records_found += extraction.records.len();
        p.new_records = 0;
        for record in extraction.records.iter().cloned() {
            if dedup.len() >= self.limits.max_records {
                p.limit_reached = true;
                break;
            }
            if dedup.ingest(record) == Ingest::New {
                p.new_records += 1;
            }
        }
        if dedup.len() >= self.limits.max_records {
            p.limit_reached = true;
        }

        self.reporter.report(RunEvent::PageExtracted {
            run_id: self.run_id,
            page,
            records: extraction.records.len(),
            new_records: p.new_records,
        });
        p.extraction = Some(extraction);
        PageState::AwaitingNextCursor
    }

    fn advance(&self, p: &mut Progress, schema: &Schema) -> PageState {
        let (Some(response), Some(extraction)) = (p.response.take(), p.extraction.take()) else {
            return PageState::Done;
        };
        let page = p.request.page;

        if p.limit_reached {
            tracing::debug!(page, max_records = self.limits.max_records, "Record limit reached");
            return PageState::Done;
        }
        if p.new_records == 0 {
            tracing::debug!(page, "Page yielded no new records");
            return PageState::Done;
        }
        if p.outcome.pages_fetched >= self.limits.max_pages {
            tracing::debug!(page, max_pages = self.limits.max_pages, "Page limit reached");
            return PageState::Done;
        }

        let Some(cursor) = next_cursor(
            &p.request.target.pagination,
            p.request.cursor.as_ref(),
            &extraction,
            schema.next_page.is_some(),
            &response.final_url,
        ) else {
            return PageState::Done;
        };

        let mut next_request = p.request.clone();
        next_request.page += 1;
        next_request.cursor = Some(cursor);
        match next_request.url() {
            Ok(url) if !stays_on_target(&url, &p.request.target) => {
                tracing::warn!(
                    page,
                    host = url.host_str().unwrap_or_default(),
                    "Next link leaves the target host"
                );
                PageState::Done
            }
            Ok(url) if p.visited.contains(url.as_str()) => {
                tracing::debug!(page, %url, "Next cursor revisits a fetched page");
                PageState::Done
            }
            Ok(_) => {
                p.request = next_request;
                PageState::FetchingPage
            }
            Err(_) => PageState::Done,
        }
    }

    fn fail(&self, p: &mut Progress, page: u32, err: ScrapeError) -> PageState {
        self.reporter.report(RunEvent::PageFailed {
            run_id: self.run_id,
            page,
            error: &err,
        });
        p.outcome.errors.push(PageError::new(page, &err));
        PageState::Failed
    }
}

/// Whether `url` is served by the target: its host is the target's domain
/// key or the entry URL's host.
fn stays_on_target(url: &Url, target: &Target) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    if host == target.domain {
        return true;
    }
    target
        .entry_url()
        .ok()
        .and_then(|entry| entry.host_str().map(|h| h.eq_ignore_ascii_case(&host)))
        .unwrap_or(false)
}

/// Derive the cursor for the page after the current one.
///
/// Returns `None` whenever continuation is not clearly signalled.
pub(crate) fn next_cursor(
    pagination: &Pagination,
    current: Option<&PageCursor>,
    extraction: &PageExtraction,
    has_next_rule: bool,
    base_url: &str,
) -> Option<PageCursor> {
    let next = extraction.next.as_deref();
    // Numeric styles continue while the next-page rule matches, or while the
    // page produced items when there is no such rule.
    let numeric_continues = if has_next_rule {
        next.is_some()
    } else {
        extraction.items_seen > 0
    };

    let state = match pagination {
        Pagination::Single => return None,
        Pagination::NextLink => {
            let link = next?;
            let resolved = Url::parse(base_url).ok()?.join(link).ok()?;
            CursorState::NextUrl(resolved.to_string())
        }
        Pagination::PageNumber { param, start } => {
            if !numeric_continues {
                return None;
            }
            let number = match current.map(|c| &c.0) {
                Some(CursorState::PageNumber { number, .. }) => number.checked_add(1)?,
                _ => start.checked_add(1)?,
            };
            CursorState::PageNumber {
                param: param.clone(),
                number,
            }
        }
        Pagination::Offset { param } => {
            if !numeric_continues || extraction.items_seen == 0 {
                return None;
            }
            let offset = match current.map(|c| &c.0) {
                Some(CursorState::Offset { offset, .. }) => *offset,
                _ => 0,
            };
            CursorState::Offset {
                param: param.clone(),
                offset: offset + extraction.items_seen as u64,
            }
        }
        Pagination::Token { param } => CursorState::Token {
            param: param.clone(),
            token: next?.to_string(),
        },
    };
    Some(PageCursor(state))
}
