//! Mapping of transport failures, status codes and response bodies onto the
//! [`ScrapeError`] fetch classifications.

use std::sync::LazyLock;

use leafcutter_core::error::ScrapeError;
use leafcutter_core::models::FetchRequest;
use reqwest::header::{FROM, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use scraper::{Html, Selector};

/// Phrases that mark a bot wall or CAPTCHA interstitial.
const BLOCK_SIGNATURES: &[&str] = &[
    "access denied",
    "captcha",
    "robot check",
    "are you a robot",
    "unusual traffic",
    "rate limit exceeded",
];

/// Phrases that mark content cut off by a subscription wall.
const PAYWALL_SIGNATURES: &[&str] = &[
    "subscribe to continue reading",
    "this article is for subscribers",
    "become a member to read",
    "premium content",
];

/// Bot walls are small interstitials; only the head of the body is scanned
/// so that ordinary pages mentioning these words further down pass.
const BLOCK_SCAN_BYTES: usize = 16 * 1024;

static PAYWALL_SELECTOR: LazyLock<Option<Selector>> = LazyLock::new(|| {
    Selector::parse(".paywall, .subscription-required, #paywall, [data-paywall]").ok()
});

/// Classify a non-success HTTP status. `None` means the status is a success.
pub fn classify_status(status: u16, url: &str) -> Option<ScrapeError> {
    let err = match status {
        200..=299 => return None,
        402 => ScrapeError::Paywalled(format!("HTTP 402 for {url}")),
        401 | 403 | 407 | 451 => ScrapeError::Blocked(format!("HTTP {status} for {url}")),
        429 => ScrapeError::RateLimited(format!("HTTP 429 for {url}")),
        408 => ScrapeError::Transient(format!("HTTP 408 for {url}")),
        400..=499 => ScrapeError::NotFound(format!("HTTP {status} for {url}")),
        500..=599 => ScrapeError::Transient(format!("HTTP {status} for {url}")),
        _ => ScrapeError::NotFound(format!("Unexpected HTTP {status} for {url}")),
    };
    Some(err)
}

/// Classify a reqwest transport error.
pub fn transport_error(err: &reqwest::Error, url: &str) -> ScrapeError {
    if err.is_builder() {
        ScrapeError::Config(format!("Invalid request for {url}: {err}"))
    } else if err.is_timeout() {
        ScrapeError::Transient(format!("Timed out fetching {url}"))
    } else if err.is_connect() {
        ScrapeError::Transient(format!("Connection failed for {url}: {err}"))
    } else if err.is_redirect() {
        ScrapeError::NotFound(format!("Redirect loop for {url}"))
    } else {
        ScrapeError::Transient(format!("Request to {url} failed: {err}"))
    }
}

/// Return the matched bot-wall phrase, if any.
pub fn detect_block(body: &str) -> Option<&'static str> {
    let mut end = body.len().min(BLOCK_SCAN_BYTES);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    let head = body[..end].to_lowercase();
    BLOCK_SIGNATURES.iter().copied().find(|sig| head.contains(sig))
}

/// Return a description of the paywall marker, if any.
pub fn detect_paywall(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    if let Some(selector) = PAYWALL_SELECTOR.as_ref()
        && document.select(selector).next().is_some()
    {
        return Some("paywall element".to_string());
    }
    let text = document.root_element().text().collect::<String>().to_lowercase();
    PAYWALL_SIGNATURES
        .iter()
        .find(|sig| text.contains(*sig))
        .map(|sig| format!("'{sig}'"))
}

/// Classify a successful HTML body that is really a bot wall or a paywall.
pub fn classify_body(html: &str, url: &str) -> Option<ScrapeError> {
    if let Some(sig) = detect_block(html) {
        return Some(ScrapeError::Blocked(format!("{url} served a bot wall ('{sig}')")));
    }
    detect_paywall(html)
        .map(|marker| ScrapeError::Paywalled(format!("{url} is behind a paywall ({marker})")))
}

/// The User-Agent to send: the base product token, plus the operator contact
/// when the request carries one (`Leafcutter/0.1 (ops@example.com)`).
pub fn user_agent_for(base: &str, contact: Option<&str>) -> String {
    match contact {
        Some(contact) => format!("{base} ({contact})"),
        None => base.to_string(),
    }
}

/// Headers for a request: the target's static headers, then identity.
pub fn request_headers(request: &FetchRequest, base_user_agent: &str) -> Result<HeaderMap, ScrapeError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ScrapeError::Config(format!("Invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ScrapeError::Config(format!("Invalid value for header {name}: {e}")))?;
        headers.insert(name, value);
    }

    let contact = request.contact.as_deref();
    let ua = user_agent_for(base_user_agent, contact);
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&ua)
            .map_err(|e| ScrapeError::Config(format!("Invalid User-Agent '{ua}': {e}")))?,
    );
    if let Some(contact) = contact {
        headers.insert(
            FROM,
            HeaderValue::from_str(contact)
                .map_err(|e| ScrapeError::Config(format!("Invalid contact '{contact}': {e}")))?,
        );
    }
    Ok(headers)
}
