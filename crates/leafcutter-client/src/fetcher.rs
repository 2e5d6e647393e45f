use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use leafcutter_core::error::ScrapeError;
use leafcutter_core::models::{FetchRequest, FetchResponse, FetchStrategy, Payload};
use leafcutter_core::traits::Fetcher;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use url::Url;

use crate::classify::{classify_body, classify_status, request_headers, transport_error};

/// Product token sent as (the start of) the User-Agent.
pub const DEFAULT_USER_AGENT: &str = "Leafcutter/0.1";

/// A response body with the metadata needed to build a [`FetchResponse`].
#[derive(Debug)]
pub(crate) struct RawResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: String,
    pub elapsed: Duration,
}

/// Static HTTP fetcher using reqwest.
///
/// Downloads raw pages with the target's headers plus identity headers.
/// By default, SSRF protection is **enabled**: requests to private/reserved
/// IP ranges are blocked. Use [`allow_private_urls`](Self::allow_private_urls)
/// to disable this (e.g., for local testing where the user controls the machine).
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: Client,
    user_agent: String,
    ssrf_protection: bool,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, ScrapeError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, ScrapeError> {
        let client = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ScrapeError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            ssrf_protection: true,
        })
    }

    /// Replace the product token of the User-Agent. The contact string is
    /// still appended for targets that require it.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// GET `url`, classifying transport failures and non-success statuses.
    ///
    /// `secret_param` names a query parameter carrying credentials. It is
    /// sent but removed from the returned `final_url` and from error messages.
    pub(crate) async fn get(
        &self,
        url: Url,
        headers: HeaderMap,
        secret_param: Option<&str>,
    ) -> Result<RawResponse, ScrapeError> {
        if self.ssrf_protection {
            validate_url(&url).await?;
        }

        let shown = redact_query(&url, secret_param);
        let started = tokio::time::Instant::now();
        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| transport_error(&e.without_url(), shown.as_str()))?;

        let status = response.status().as_u16();
        let final_url = redact_query(response.url(), secret_param).to_string();
        if let Some(err) = classify_status(status, &final_url) {
            return Err(err);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase());
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(&e.without_url(), &final_url))?;

        Ok(RawResponse {
            status,
            final_url,
            content_type,
            body,
            elapsed: started.elapsed(),
        })
    }
}

/// `url` without the query parameter `param`.
pub(crate) fn redact_query(url: &Url, param: Option<&str>) -> Url {
    let Some(param) = param else {
        return url.clone();
    };
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != param)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    let mut redacted = url.clone();
    if kept.is_empty() {
        redacted.set_query(None);
    } else {
        redacted.query_pairs_mut().clear().extend_pairs(kept);
    }
    redacted
}

/// Choose the payload variant from the declared content type.
pub(crate) fn payload_for(content_type: Option<&str>, body: String) -> Payload {
    match content_type {
        Some(ct) if ct.contains("json") => match serde_json::from_str(&body) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(body),
        },
        Some(ct) if ct.contains("html") || ct.contains("xml") => Payload::Html(body),
        None => Payload::Html(body),
        Some(_) => Payload::Text(body),
    }
}

impl Fetcher for HttpFetcher {
    fn supports(&self, strategy: FetchStrategy) -> bool {
        strategy == FetchStrategy::StaticHttp
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, ScrapeError> {
        let url = request.url()?;
        let headers = request_headers(request, &self.user_agent)?;
        let fetched_at = Utc::now();
        let raw = self.get(url, headers, None).await?;

        let payload = payload_for(raw.content_type.as_deref(), raw.body);
        if let Payload::Html(html) = &payload
            && let Some(err) = classify_body(html, &raw.final_url)
        {
            return Err(err);
        }

        tracing::debug!(
            url = %raw.final_url,
            status = raw.status,
            kind = payload.kind(),
            bytes = payload.len(),
            "Fetched page"
        );
        Ok(FetchResponse::new(payload, raw.status, raw.final_url).with_timing(fetched_at, raw.elapsed))
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
pub(crate) async fn validate_url(url: &Url) -> Result<(), ScrapeError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ScrapeError::Config(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| ScrapeError::Config("URL has no host".to_string()))?;

    // IP literals are checked directly. IPv6 hosts come bracketed.
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(ScrapeError::Blocked(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ScrapeError::Transient(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(ScrapeError::Transient(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    for socket_addr in &addrs {
        if is_private_ip(socket_addr.ip()) {
            return Err(ScrapeError::Blocked(format!(
                "SSRF blocked: {host} resolves to private/reserved IP {}",
                socket_addr.ip()
            )));
        }
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()           // 127.0.0.0/8
                || v4.is_private()     // 10/8, 172.16/12, 192.168/16
                || v4.is_link_local()  // 169.254.0.0/16 (cloud metadata!)
                || v4.is_unspecified() // 0.0.0.0
                || v4.is_broadcast()   // 255.255.255.255
                || v4.is_documentation() // 192.0.2.0/24, 198.51.100.0/24, 203.0.113.0/24
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()       // ::1
                || v6.is_unspecified() // ::
                // fe80::/10 (link-local)
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                // fc00::/7 (unique local)
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                || match v6.to_ipv4_mapped() {
                    Some(v4) => is_private_ip(IpAddr::V4(v4)),
                    None => false,
                }
        }
    }
}
