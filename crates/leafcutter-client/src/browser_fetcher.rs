use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
use chromiumoxide::{Browser, BrowserConfig};
use chrono::Utc;
use futures::StreamExt;
use leafcutter_core::error::ScrapeError;
use leafcutter_core::models::{FetchRequest, FetchResponse, FetchStrategy, Payload};
use leafcutter_core::traits::Fetcher;

use crate::classify::{classify_body, user_agent_for};
use crate::fetcher::DEFAULT_USER_AGENT;

/// Headless-browser fetcher using Chromium via the Chrome DevTools Protocol.
///
/// Unlike [`HttpFetcher`](crate::HttpFetcher), this renders JavaScript
/// before returning the HTML, for targets whose listings are built
/// client-side.
///
/// A single Chromium process is shared across all clones of this struct;
/// each [`Fetcher::fetch`] call opens a new tab, grabs the rendered HTML,
/// and closes the tab.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use leafcutter_client::BrowserFetcher;
/// use leafcutter_core::models::{FetchRequest, FetchStrategy, Target};
/// use leafcutter_core::traits::Fetcher;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = BrowserFetcher::new().await?;
/// let target = Arc::new(Target::new("https://example.com", FetchStrategy::Browser)?);
/// let response = fetcher.fetch(&FetchRequest::first(target, None)).await?;
/// println!("{} bytes", response.payload.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BrowserFetcher {
    browser: Arc<Browser>,
    timeout: Duration,
    user_agent: String,
}

impl std::fmt::Debug for BrowserFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserFetcher")
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

impl BrowserFetcher {
    /// Launches a headless Chromium browser with a **30 s** navigation timeout.
    ///
    /// Requires a Chromium / Chrome binary reachable via `$PATH`, `$CHROME_BIN`,
    /// or the default locations checked by `chromiumoxide`.
    pub async fn new() -> Result<Self, ScrapeError> {
        Self::with_timeout(Duration::from_secs(30)).await
    }

    /// Launches a headless Chromium browser with a custom navigation timeout.
    pub async fn with_timeout(timeout: Duration) -> Result<Self, ScrapeError> {
        let mut builder = BrowserConfig::builder();
        builder = builder.no_sandbox().disable_default_args();

        // Snap-packaged Chromium exposes a wrapper that rejects standard
        // Chrome CLI flags (--headless, --disable-gpu, ...), so prefer the
        // real binary when one can be found.
        if let Some(bin) = Self::find_chrome_binary() {
            tracing::info!(binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .build()
            .map_err(|e| ScrapeError::Config(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ScrapeError::Config(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser CDP handler error");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            timeout,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        })
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Locate a usable Chrome/Chromium binary.
    ///
    /// `$CHROME_BIN` wins; then the binary inside the snap (the snap wrapper
    /// strips unknown flags); then well-known system paths. `None` lets
    /// `chromiumoxide` do its own lookup.
    fn find_chrome_binary() -> Option<PathBuf> {
        let candidates: &[&str] = &[
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ];

        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
        }

        candidates.iter().map(PathBuf::from).find(|p| p.exists())
    }

    async fn render(&self, request: &FetchRequest, url: &str) -> Result<(String, String), ScrapeError> {
        let cdp = |what: &str, e: chromiumoxide::error::CdpError| {
            ScrapeError::Transient(format!("{what} for {url}: {e}"))
        };

        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| cdp("Failed to open tab", e))?;

        let ua = user_agent_for(&self.user_agent, request.contact.as_deref());
        page.set_user_agent(SetUserAgentOverrideParams::new(ua))
            .await
            .map_err(|e| cdp("Failed to set user agent", e))?;

        let mut extra = serde_json::Map::new();
        for (name, value) in &request.headers {
            extra.insert(name.clone(), value.clone().into());
        }
        if let Some(contact) = &request.contact {
            extra.insert("From".to_string(), contact.clone().into());
        }
        if !extra.is_empty() {
            page.execute(SetExtraHttpHeadersParams::new(Headers::new(extra.into())))
                .await
                .map_err(|e| cdp("Failed to set request headers", e))?;
        }

        page.goto(url).await.map_err(|e| cdp("Failed to navigate", e))?;

        // <body> being present is the minimal signal that the page rendered.
        page.find_element("body")
            .await
            .map_err(|e| cdp("Page did not render body", e))?;

        let html = page
            .content()
            .await
            .map_err(|e| cdp("Failed to read page content", e))?;
        let final_url = page.url().await.ok().flatten().unwrap_or_else(|| url.to_string());

        if let Err(e) = page.close().await {
            tracing::debug!(url, error = %e, "Failed to close tab");
        }
        Ok((html, final_url))
    }
}

impl Fetcher for BrowserFetcher {
    fn supports(&self, strategy: FetchStrategy) -> bool {
        strategy == FetchStrategy::Browser
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, ScrapeError> {
        let url = request.url()?.to_string();
        let fetched_at = Utc::now();
        let started = tokio::time::Instant::now();

        let (html, final_url) = tokio::time::timeout(self.timeout, self.render(request, &url))
            .await
            .map_err(|_| {
                ScrapeError::Transient(format!(
                    "Browser render of {url} timed out after {}s",
                    self.timeout.as_secs()
                ))
            })??;

        if let Some(err) = classify_body(&html, &final_url) {
            return Err(err);
        }

        tracing::debug!(url = %final_url, bytes = html.len(), "Rendered page");
        // CDP does not expose the document status here; a rendered page is a 200.
        Ok(FetchResponse::new(Payload::Html(html), 200, final_url)
            .with_timing(fetched_at, started.elapsed()))
    }
}
