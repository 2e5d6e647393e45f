use std::time::Duration;

use chrono::Utc;
use leafcutter_core::error::ScrapeError;
use leafcutter_core::models::{FetchRequest, FetchResponse, FetchStrategy, Payload};
use leafcutter_core::traits::Fetcher;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderName, HeaderValue};

use crate::classify::request_headers;
use crate::fetcher::HttpFetcher;

/// Credentials attached to every JSON API request.
#[derive(Clone)]
pub enum ApiAuth {
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// An arbitrary header such as `X-Api-Key`.
    Header { name: String, value: String },
    /// A query parameter such as `?api_key=...`.
    Query { param: String, value: String },
}

impl std::fmt::Debug for ApiAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secrets stay out of logs.
        match self {
            Self::Bearer(_) => f.write_str("Bearer(***)"),
            Self::Header { name, .. } => write!(f, "Header({name}: ***)"),
            Self::Query { param, .. } => write!(f, "Query({param}=***)"),
        }
    }
}

/// Fetcher for structured JSON endpoints.
///
/// Shares transport, SSRF guard and status classification with
/// [`HttpFetcher`]. Bodies that parse as JSON become [`Payload::Json`]
/// regardless of the declared content type; anything else is returned as
/// [`Payload::Text`] and fails at extraction with a document format error.
#[derive(Clone, Debug)]
pub struct ApiFetcher {
    http: HttpFetcher,
    auth: Option<ApiAuth>,
}

impl ApiFetcher {
    pub fn new() -> Result<Self, ScrapeError> {
        Ok(Self::from_http(HttpFetcher::new()?))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, ScrapeError> {
        Ok(Self::from_http(HttpFetcher::with_timeout(timeout)?))
    }

    pub fn from_http(http: HttpFetcher) -> Self {
        Self { http, auth: None }
    }

    pub fn with_auth(mut self, auth: ApiAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn allow_private_urls(mut self) -> Self {
        self.http = self.http.allow_private_urls();
        self
    }
}

impl Fetcher for ApiFetcher {
    fn supports(&self, strategy: FetchStrategy) -> bool {
        strategy == FetchStrategy::JsonApi
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, ScrapeError> {
        let mut url = request.url()?;
        let mut headers = request_headers(request, self.http.user_agent())?;
        if !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        }

        match &self.auth {
            Some(ApiAuth::Bearer(token)) => {
                let value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| ScrapeError::Config(format!("Invalid bearer token: {e}")))?;
                headers.insert(AUTHORIZATION, value);
            }
            Some(ApiAuth::Header { name, value }) => {
                let header = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| ScrapeError::Config(format!("Invalid header name '{name}': {e}")))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| ScrapeError::Config(format!("Invalid value for header {name}: {e}")))?;
                headers.insert(header, value);
            }
            Some(ApiAuth::Query { param, value }) => {
                url.query_pairs_mut().append_pair(param, value);
            }
            None => {}
        }

        let secret_param = match &self.auth {
            Some(ApiAuth::Query { param, .. }) => Some(param.as_str()),
            _ => None,
        };
        let fetched_at = Utc::now();
        let raw = self.http.get(url, headers, secret_param).await?;
        let payload = match serde_json::from_str(&raw.body) {
            Ok(value) => Payload::Json(value),
            Err(e) => {
                tracing::debug!(url = %raw.final_url, error = %e, "Response body is not JSON");
                Payload::Text(raw.body)
            }
        };

        tracing::debug!(
            url = %raw.final_url,
            status = raw.status,
            kind = payload.kind(),
            bytes = payload.len(),
            "Fetched API response"
        );
        Ok(FetchResponse::new(payload, raw.status, raw.final_url).with_timing(fetched_at, raw.elapsed))
    }
}
