//! CSS selector rules over HTML documents.
//!
//! A rule's `query` is a CSS selector. Without an `attribute` the matched
//! element's text (whitespace-trimmed) is returned; with one, the attribute
//! value. Elements with empty text or a missing attribute count as no match.

use std::rc::Rc;

use leafcutter_core::error::ScrapeError;
use leafcutter_core::models::{FetchResponse, FetchStrategy, Payload};
use leafcutter_core::schema::ExtractionRule;
use leafcutter_core::traits::RuleEvaluator;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlEvaluator;

impl HtmlEvaluator {
    pub fn new() -> Self {
        Self
    }
}

fn compile(query: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(query).map_err(|e| ScrapeError::InvalidRule {
        rule: query.to_string(),
        message: e.to_string(),
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").trim().to_string()
}

fn element_value(element: ElementRef<'_>, attribute: Option<&str>) -> Option<String> {
    let value = match attribute {
        Some(attr) => element.value().attr(attr)?.trim().to_string(),
        None => element_text(element),
    };
    (!value.is_empty()).then_some(value)
}

/// Parse markup, rejecting bodies that are plainly not HTML.
pub(crate) fn parse_markup(text: &str, source: &str) -> Result<Html, ScrapeError> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Err(ScrapeError::DocumentFormat(format!(
            "{source} returned JSON where HTML was expected"
        )));
    }
    if !trimmed.contains('<') {
        return Err(ScrapeError::DocumentFormat(format!(
            "{source} returned no markup"
        )));
    }
    Ok(Html::parse_document(text))
}

/// A parsed page, optionally narrowed to one item of a list page.
///
/// Items are addressed by the selector matches that lead to them rather
/// than re-parsed, so table rows and other context-sensitive markup keep
/// their structure.
#[derive(Debug, Clone)]
pub struct HtmlDocument {
    html: Rc<Html>,
    scope: Vec<(Rc<Selector>, usize)>,
}

impl HtmlDocument {
    pub fn new(html: Html) -> Self {
        Self {
            html: Rc::new(html),
            scope: Vec::new(),
        }
    }

    /// The item element this document is narrowed to, `None` for a whole page.
    fn scope_element(&self) -> Option<ElementRef<'_>> {
        let mut current: Option<ElementRef<'_>> = None;
        for (selector, index) in &self.scope {
            let next = match current {
                Some(element) => element.select(selector).nth(*index),
                None => self.html.select(selector).nth(*index),
            };
            current = Some(next?);
        }
        current
    }

    fn select<'a>(&'a self, selector: &'a Selector) -> Box<dyn Iterator<Item = ElementRef<'a>> + 'a> {
        if self.scope.is_empty() {
            return Box::new(self.html.select(selector));
        }
        match self.scope_element() {
            // The item element itself can be the match (e.g. `a` items with an `href` rule).
            Some(item) => Box::new(
                std::iter::once(item)
                    .filter(move |el| selector.matches(el))
                    .chain(item.select(selector)),
            ),
            None => Box::new(std::iter::empty()),
        }
    }

    fn narrowed(&self, selector: Rc<Selector>, index: usize) -> Self {
        let mut scope = self.scope.clone();
        scope.push((selector, index));
        Self {
            html: Rc::clone(&self.html),
            scope,
        }
    }
}

impl RuleEvaluator for HtmlEvaluator {
    type Document = HtmlDocument;

    fn parse(&self, response: &FetchResponse) -> Result<HtmlDocument, ScrapeError> {
        let source = &response.final_url;
        let html = match &response.payload {
            Payload::Html(text) | Payload::Text(text) => parse_markup(text, source)?,
            Payload::Bytes(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    ScrapeError::DocumentFormat(format!("{source} returned non-UTF-8 bytes: {e}"))
                })?;
                parse_markup(text, source)?
            }
            Payload::Json(_) => {
                return Err(ScrapeError::DocumentFormat(format!(
                    "{source} returned JSON where HTML was expected"
                )));
            }
        };
        Ok(HtmlDocument::new(html))
    }

    fn select_items(&self, document: &HtmlDocument, query: &str) -> Result<Vec<HtmlDocument>, ScrapeError> {
        let selector = Rc::new(compile(query)?);
        let count = match document.scope_element() {
            Some(item) => item.select(&selector).count(),
            None if document.scope.is_empty() => document.html.select(&selector).count(),
            None => 0,
        };
        Ok((0..count)
            .map(|index| document.narrowed(Rc::clone(&selector), index))
            .collect())
    }

    fn evaluate(&self, document: &HtmlDocument, rule: &ExtractionRule) -> Result<Option<Value>, ScrapeError> {
        let selector = compile(&rule.query)?;
        let attribute = rule.attribute.as_deref();
        let mut values = document
            .select(&selector)
            .filter_map(|element| element_value(element, attribute));

        if rule.multiple {
            let all: Vec<Value> = values.map(Value::String).collect();
            Ok((!all.is_empty()).then_some(Value::Array(all)))
        } else {
            Ok(values.next().map(Value::String))
        }
    }

    fn validate_rule(&self, _strategy: FetchStrategy, rule: &ExtractionRule) -> Result<(), ScrapeError> {
        compile(&rule.query).map(|_| ())
    }
}
