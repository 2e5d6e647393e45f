use leafcutter_core::error::ScrapeError;
use leafcutter_core::models::{FetchRequest, FetchResponse, FetchStrategy};
use leafcutter_core::traits::Fetcher;

use crate::api::ApiFetcher;
#[cfg(feature = "browser")]
use crate::browser_fetcher::BrowserFetcher;
use crate::fetcher::HttpFetcher;

/// Routes each request to the fetcher registered for its target's strategy.
///
/// Strategies without a registered fetcher are reported as unsupported, so
/// the runner rejects such targets before any network activity.
#[derive(Clone, Debug, Default)]
pub struct StrategyFetcher {
    http: Option<HttpFetcher>,
    api: Option<ApiFetcher>,
    #[cfg(feature = "browser")]
    browser: Option<BrowserFetcher>,
}

impl StrategyFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Static HTTP and JSON API fetchers with default settings.
    pub fn standard() -> Result<Self, ScrapeError> {
        Ok(Self::new()
            .with_http(HttpFetcher::new()?)
            .with_api(ApiFetcher::new()?))
    }

    pub fn with_http(mut self, fetcher: HttpFetcher) -> Self {
        self.http = Some(fetcher);
        self
    }

    pub fn with_api(mut self, fetcher: ApiFetcher) -> Self {
        self.api = Some(fetcher);
        self
    }

    #[cfg(feature = "browser")]
    pub fn with_browser(mut self, fetcher: BrowserFetcher) -> Self {
        self.browser = Some(fetcher);
        self
    }

    fn unsupported(strategy: FetchStrategy) -> ScrapeError {
        ScrapeError::Config(format!("No fetcher registered for strategy '{strategy}'"))
    }
}

impl Fetcher for StrategyFetcher {
    fn supports(&self, strategy: FetchStrategy) -> bool {
        match strategy {
            FetchStrategy::StaticHttp => self.http.is_some(),
            FetchStrategy::JsonApi => self.api.is_some(),
            #[cfg(feature = "browser")]
            FetchStrategy::Browser => self.browser.is_some(),
            #[cfg(not(feature = "browser"))]
            FetchStrategy::Browser => false,
        }
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, ScrapeError> {
        let strategy = request.target.strategy;
        match strategy {
            FetchStrategy::StaticHttp => match &self.http {
                Some(fetcher) => fetcher.fetch(request).await,
                None => Err(Self::unsupported(strategy)),
            },
            FetchStrategy::JsonApi => match &self.api {
                Some(fetcher) => fetcher.fetch(request).await,
                None => Err(Self::unsupported(strategy)),
            },
            #[cfg(feature = "browser")]
            FetchStrategy::Browser => match &self.browser {
                Some(fetcher) => fetcher.fetch(request).await,
                None => Err(Self::unsupported(strategy)),
            },
            #[cfg(not(feature = "browser"))]
            FetchStrategy::Browser => Err(Self::unsupported(strategy)),
        }
    }
}
