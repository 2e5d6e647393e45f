use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::ScrapeError;

/// How pages of a target are fetched. Fixed for the life of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchStrategy {
    StaticHttp,
    JsonApi,
    Browser,
}

impl FetchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStrategy::StaticHttp => "static-http",
            FetchStrategy::JsonApi => "json-api",
            FetchStrategy::Browser => "browser",
        }
    }
}

impl fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the first page of a target lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryLocator {
    /// A complete page URL.
    Url(String),
    /// An API endpoint: `base` joined with `path`, plus fixed query parameters.
    Endpoint {
        base: String,
        path: String,
        #[serde(default)]
        query: BTreeMap<String, String>,
    },
}

/// How a target advances from one page to the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "kebab-case")]
pub enum Pagination {
    /// Only the entry page is fetched.
    Single,
    /// Follow the link produced by the schema's next-page rule.
    NextLink,
    /// Increment a page-number query parameter, starting at `start`.
    PageNumber { param: String, start: u32 },
    /// Advance an offset query parameter by the number of items seen.
    Offset { param: String },
    /// Pass the continuation token produced by the next-page rule.
    Token { param: String },
}

/// A scrape objective. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Rate-limiting key (host of the entry URL unless overridden).
    pub domain: String,
    pub entry: EntryLocator,
    pub strategy: FetchStrategy,
    pub pagination: Pagination,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// The target's access policy asks for an operator contact on every request.
    #[serde(default)]
    pub requires_contact: bool,
}

impl Target {
    /// Create a single-page target for a page URL.
    pub fn new(entry_url: &str, strategy: FetchStrategy) -> Result<Self, ScrapeError> {
        let url = parse_url(entry_url)?;
        Ok(Self {
            domain: host_of(&url)?,
            entry: EntryLocator::Url(url.to_string()),
            strategy,
            pagination: Pagination::Single,
            headers: BTreeMap::new(),
            requires_contact: false,
        })
    }

    /// Create a target for an API endpoint (`base` + `path`).
    pub fn endpoint(base: &str, path: &str, strategy: FetchStrategy) -> Result<Self, ScrapeError> {
        let base_url = parse_url(base)?;
        Ok(Self {
            domain: host_of(&base_url)?,
            entry: EntryLocator::Endpoint {
                base: base.to_string(),
                path: path.to_string(),
                query: BTreeMap::new(),
            },
            strategy,
            pagination: Pagination::Single,
            headers: BTreeMap::new(),
            requires_contact: false,
        })
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a fixed query parameter to an endpoint target.
    ///
    /// For URL targets the parameter is merged into the entry URL.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let (name, value) = (name.into(), value.into());
        match &mut self.entry {
            EntryLocator::Endpoint { query, .. } => {
                query.insert(name, value);
            }
            EntryLocator::Url(raw) => {
                if let Ok(url) = Url::parse(raw) {
                    *raw = set_query_param(url, &name, &value).to_string();
                }
            }
        }
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into().to_ascii_lowercase();
        self
    }

    pub fn requiring_contact(mut self) -> Self {
        self.requires_contact = true;
        self
    }

    /// Resolve the entry locator to the first page URL.
    pub fn entry_url(&self) -> Result<Url, ScrapeError> {
        match &self.entry {
            EntryLocator::Url(raw) => parse_url(raw),
            EntryLocator::Endpoint { base, path, query } => {
                let base = parse_url(base)?;
                let mut url = base
                    .join(path)
                    .map_err(|e| ScrapeError::Config(format!("Invalid endpoint path '{path}': {e}")))?;
                for (name, value) in query {
                    url = set_query_param(url, name, value);
                }
                Ok(url)
            }
        }
    }
}

/// Opaque resumption point for pagination.
///
/// Only the pagination controller creates cursors; everything else can only
/// read them through [`FetchRequest::url`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor(pub(crate) CursorState);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CursorState {
    NextUrl(String),
    PageNumber { param: String, number: u32 },
    Offset { param: String, offset: u64 },
    Token { param: String, token: String },
}

impl PageCursor {
    /// Short human-readable description for logs.
    pub fn describe(&self) -> String {
        match &self.0 {
            CursorState::NextUrl(url) => format!("next-url {url}"),
            CursorState::PageNumber { param, number } => format!("{param}={number}"),
            CursorState::Offset { param, offset } => format!("{param}={offset}"),
            CursorState::Token { param, .. } => format!("{param}=<token>"),
        }
    }
}

/// One page attempt against a target.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub target: Arc<Target>,
    /// 1-based page index within the run.
    pub page: u32,
    pub cursor: Option<PageCursor>,
    pub headers: BTreeMap<String, String>,
    /// Operator contact string, passed through verbatim.
    pub contact: Option<String>,
}

impl FetchRequest {
    /// Request for the entry page of a target.
    pub fn first(target: Arc<Target>, contact: Option<String>) -> Self {
        let headers = target.headers.clone();
        Self {
            target,
            page: 1,
            cursor: None,
            headers,
            contact,
        }
    }

    /// Resolve the concrete URL for this page.
    pub fn url(&self) -> Result<Url, ScrapeError> {
        let entry = self.target.entry_url()?;
        let Some(cursor) = &self.cursor else {
            return Ok(entry);
        };
        match &cursor.0 {
            CursorState::NextUrl(raw) => parse_url(raw),
            CursorState::PageNumber { param, number } => {
                Ok(set_query_param(entry, param, &number.to_string()))
            }
            CursorState::Offset { param, offset } => {
                Ok(set_query_param(entry, param, &offset.to_string()))
            }
            CursorState::Token { param, token } => Ok(set_query_param(entry, param, token)),
        }
    }
}

/// Raw page content as delivered by a fetch strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Html(String),
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Html(_) => "html",
            Payload::Json(_) => "json",
            Payload::Text(_) => "text",
            Payload::Bytes(_) => "bytes",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Html(s) | Payload::Text(s) => s.len(),
            Payload::Json(v) => v.to_string().len(),
            Payload::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A successful fetch. Failures are classified as [`ScrapeError`] instead.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub payload: Payload,
    pub status: u16,
    /// URL after redirects; relative next-page links resolve against it.
    pub final_url: String,
    pub fetched_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl FetchResponse {
    pub fn new(payload: Payload, status: u16, final_url: impl Into<String>) -> Self {
        Self {
            payload,
            status,
            final_url: final_url.into(),
            fetched_at: Utc::now(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn html(final_url: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Payload::Html(body.into()), 200, final_url)
    }

    pub fn json(final_url: impl Into<String>, body: Value) -> Self {
        Self::new(Payload::Json(body), 200, final_url)
    }

    pub fn with_timing(mut self, fetched_at: DateTime<Utc>, elapsed: Duration) -> Self {
        self.fetched_at = fetched_at;
        self.elapsed = elapsed;
        self
    }
}

/// Where and when a record was extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_url: String,
    pub page: u32,
    pub extracted_at: DateTime<Utc>,
}

/// One logical scraped item (a business, a job posting, an article).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Field values in schema order.
    pub fields: Map<String, Value>,
    pub provenance: Provenance,
}

impl Record {
    pub fn new(provenance: Provenance) -> Self {
        Self {
            fields: Map::new(),
            provenance,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Text form of a scalar field (strings verbatim, numbers/bools formatted).
    pub fn text(&self, field: &str) -> Option<String> {
        match self.fields.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Flatten nested maps and lists into a single-level map.
    ///
    /// Nested keys are joined with `_`; list elements use their index
    /// (`salary_min`, `tags_0`). Provenance is appended as `_source_url`,
    /// `_page` and `_extracted_at`.
    pub fn flatten(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for (key, value) in &self.fields {
            flatten_into(key, value, &mut out);
        }
        out.insert(
            "_source_url".into(),
            Value::String(self.provenance.source_url.clone()),
        );
        out.insert("_page".into(), Value::from(self.provenance.page));
        out.insert(
            "_extracted_at".into(),
            Value::String(self.provenance.extracted_at.to_rfc3339()),
        );
        out
    }
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Map<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, nested) in map {
                flatten_into(&format!("{prefix}_{key}"), nested, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, nested) in items.iter().enumerate() {
                flatten_into(&format!("{prefix}_{i}"), nested, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub(crate) fn parse_url(raw: &str) -> Result<Url, ScrapeError> {
    Url::parse(raw).map_err(|e| ScrapeError::Config(format!("Invalid URL '{raw}': {e}")))
}

fn host_of(url: &Url) -> Result<String, ScrapeError> {
    url.host_str()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| ScrapeError::Config(format!("URL has no host: {url}")))
}

/// Replace (or add) a single query parameter, keeping the others in order.
pub(crate) fn set_query_param(mut url: Url, name: &str, value: &str) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != name)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        pairs.append_pair(name, value);
    }
    url
}
