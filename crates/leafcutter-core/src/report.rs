use uuid::Uuid;

use crate::error::ScrapeError;
use crate::pagination::PageState;
use crate::result::RunStatus;

/// Events emitted while a run progresses.
#[derive(Debug, Clone)]
pub enum RunEvent<'a> {
    RunStarted {
        run_id: Uuid,
        ant: &'a str,
        domain: &'a str,
    },
    StateChanged {
        run_id: Uuid,
        page: u32,
        from: PageState,
        to: PageState,
    },
    PageFetched {
        run_id: Uuid,
        page: u32,
        url: &'a str,
        status: u16,
        retries: u32,
    },
    PageExtracted {
        run_id: Uuid,
        page: u32,
        records: usize,
        new_records: usize,
    },
    PageFailed {
        run_id: Uuid,
        page: u32,
        error: &'a ScrapeError,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        pages: u32,
        records: usize,
    },
}

/// Receives run events (decoupled logging).
pub trait RunReporter: Send + Sync {
    fn report(&self, event: RunEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunReporter;

impl RunReporter for TracingRunReporter {
    fn report(&self, event: RunEvent<'_>) {
        match event {
            RunEvent::RunStarted {
                run_id,
                ant,
                domain,
            } => {
                tracing::info!(%run_id, %ant, %domain, "Run started");
            }
            RunEvent::StateChanged {
                run_id,
                page,
                from,
                to,
            } => {
                tracing::debug!(%run_id, page, %from, %to, "Pagination state changed");
            }
            RunEvent::PageFetched {
                run_id,
                page,
                url,
                status,
                retries,
            } => {
                tracing::info!(%run_id, page, %url, status, retries, "Page fetched");
            }
            RunEvent::PageExtracted {
                run_id,
                page,
                records,
                new_records,
            } => {
                tracing::info!(%run_id, page, records, new_records, "Page extracted");
            }
            RunEvent::PageFailed {
                run_id,
                page,
                error,
            } => {
                tracing::warn!(%run_id, page, kind = %error.kind(), %error, "Page failed");
            }
            RunEvent::RunFinished {
                run_id,
                status,
                pages,
                records,
            } => {
                tracing::info!(%run_id, %status, pages, records, "Run finished");
            }
        }
    }
}

/// Reporter that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl RunReporter for NullReporter {}
