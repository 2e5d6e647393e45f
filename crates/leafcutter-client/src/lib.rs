pub mod api;
#[cfg(feature = "browser")]
pub mod browser_fetcher;
pub mod classify;
pub mod document;
pub mod fetcher;
pub mod html;
pub mod strategy;

pub use api::{ApiAuth, ApiFetcher};
#[cfg(feature = "browser")]
pub use browser_fetcher::BrowserFetcher;
pub use document::{Document, DocumentEvaluator};
pub use fetcher::{DEFAULT_USER_AGENT, HttpFetcher};
pub use html::{HtmlDocument, HtmlEvaluator};
pub use strategy::StrategyFetcher;
