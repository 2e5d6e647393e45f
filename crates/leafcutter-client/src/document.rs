use leafcutter_core::error::ScrapeError;
use leafcutter_core::json::JsonEvaluator;
use leafcutter_core::models::{FetchResponse, FetchStrategy, Payload};
use leafcutter_core::schema::ExtractionRule;
use leafcutter_core::traits::RuleEvaluator;
use serde_json::Value;

use crate::html::{HtmlDocument, HtmlEvaluator, parse_markup};

/// A parsed response: markup for CSS rules or a JSON tree for path rules.
#[derive(Debug)]
pub enum Document {
    Html(HtmlDocument),
    Json(Value),
}

/// Evaluator for mixed workloads: picks CSS selectors or JSON paths by what
/// the response actually contains.
///
/// Rule syntax is validated per target strategy: `json-api` targets use
/// JSON paths, everything else CSS selectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentEvaluator {
    html: HtmlEvaluator,
    json: JsonEvaluator,
}

impl DocumentEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_text(text: &str, source: &str) -> Result<Document, ScrapeError> {
        match serde_json::from_str(text) {
            Ok(value) => Ok(Document::Json(value)),
            Err(_) => parse_markup(text, source).map(|html| Document::Html(HtmlDocument::new(html))),
        }
    }
}

impl RuleEvaluator for DocumentEvaluator {
    type Document = Document;

    fn parse(&self, response: &FetchResponse) -> Result<Document, ScrapeError> {
        let source = &response.final_url;
        match &response.payload {
            Payload::Json(value) => Ok(Document::Json(value.clone())),
            Payload::Html(_) => self.html.parse(response).map(Document::Html),
            Payload::Text(text) => Self::parse_text(text, source),
            Payload::Bytes(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    ScrapeError::DocumentFormat(format!("{source} returned non-UTF-8 bytes: {e}"))
                })?;
                Self::parse_text(text, source)
            }
        }
    }

    fn select_items(&self, document: &Document, query: &str) -> Result<Vec<Document>, ScrapeError> {
        Ok(match document {
            Document::Html(html) => self
                .html
                .select_items(html, query)?
                .into_iter()
                .map(Document::Html)
                .collect(),
            Document::Json(value) => self
                .json
                .select_items(value, query)?
                .into_iter()
                .map(Document::Json)
                .collect(),
        })
    }

    fn evaluate(&self, document: &Document, rule: &ExtractionRule) -> Result<Option<Value>, ScrapeError> {
        match document {
            Document::Html(html) => self.html.evaluate(html, rule),
            Document::Json(value) => self.json.evaluate(value, rule),
        }
    }

    fn validate_rule(&self, strategy: FetchStrategy, rule: &ExtractionRule) -> Result<(), ScrapeError> {
        match strategy {
            FetchStrategy::JsonApi => self.json.validate_rule(strategy, rule),
            FetchStrategy::StaticHttp | FetchStrategy::Browser => self.html.validate_rule(strategy, rule),
        }
    }
}
