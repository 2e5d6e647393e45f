use std::time::Duration;

use leafcutter_client::{ApiFetcher, DocumentEvaluator, HttpFetcher, StrategyFetcher};
use leafcutter_core::{AntRunner, EngineConfig};

pub const CONTACT: &str = "ops@example.com";

/// Fast limits so the suite does not wait on real rate limiting.
pub fn test_config(contact: Option<&str>) -> EngineConfig {
    let raw = serde_json::json!({
        "rate_limit": { "requests_per_second": 200.0, "burst": 5 },
        "domain_rate_limits": {},
        "max_pages": 10,
        "max_records": 1000,
        "retry": { "max_retries": 2, "base_delay_ms": 10, "max_delay_ms": 40 },
        "dedup_merge": "disabled",
        "contact": contact,
    });
    EngineConfig::from_json_str(&raw.to_string()).expect("valid test config")
}

/// Fetcher that may talk to the loopback mock server.
pub fn local_fetcher() -> StrategyFetcher {
    let http = HttpFetcher::with_timeout(Duration::from_secs(5))
        .expect("http client")
        .allow_private_urls();
    StrategyFetcher::new()
        .with_http(http.clone())
        .with_api(ApiFetcher::from_http(http))
}

pub fn runner(contact: Option<&str>) -> AntRunner<StrategyFetcher, DocumentEvaluator> {
    AntRunner::new(local_fetcher(), DocumentEvaluator::new(), &test_config(contact))
        .expect("valid runner")
}

/// A listing page with one `li.job` per title and an optional next link.
pub fn listing_page(titles: &[&str], next: Option<&str>) -> String {
    let items: String = titles
        .iter()
        .map(|t| {
            let slug = t.to_lowercase().replace(' ', "-");
            format!(r#"<li class="job"><h2>{t}</h2><a href="/jobs/{slug}">View</a></li>"#)
        })
        .collect();
    let next = next
        .map(|href| format!(r#"<a class="next" href="{href}">Next</a>"#))
        .unwrap_or_default();
    format!("<html><body><ul>{items}</ul>{next}</body></html>")
}
