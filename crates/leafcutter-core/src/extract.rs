use serde_json::Value;

use crate::error::ScrapeError;
use crate::models::{FetchResponse, FetchStrategy, Provenance, Record};
use crate::schema::{ExtractionRule, Schema};
use crate::traits::RuleEvaluator;

/// Records extracted from one page plus its continuation hint.
#[derive(Debug, Clone, PartialEq)]
pub struct PageExtraction {
    pub records: Vec<Record>,
    /// Raw value of the schema's next-page rule (a link or a token).
    pub next: Option<String>,
    /// Number of items the item-scope query matched, before validation.
    pub items_seen: usize,
}

/// Applies a [`Schema`] to fetched documents through a [`RuleEvaluator`].
///
/// Extraction is pure: the same response and schema always produce the same
/// records.
#[derive(Debug, Clone)]
pub struct ExtractionPipeline<E> {
    evaluator: E,
}

impl<E: RuleEvaluator> ExtractionPipeline<E> {
    pub fn new(evaluator: E) -> Self {
        Self { evaluator }
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    /// Check the schema structure and every rule's syntax for `strategy`.
    pub fn validate_schema(&self, strategy: FetchStrategy, schema: &Schema) -> Result<(), ScrapeError> {
        schema.validate()?;
        for field in &schema.fields {
            self.evaluator.validate_rule(strategy, &field.rule)?;
        }
        if let Some(items) = &schema.items {
            self.evaluator
                .validate_rule(strategy, &ExtractionRule::new(items.as_str()))?;
        }
        if let Some(next) = &schema.next_page {
            self.evaluator.validate_rule(strategy, next)?;
        }
        Ok(())
    }

    /// Extract a single record from a detail page.
    pub fn extract(
        &self,
        response: &FetchResponse,
        schema: &Schema,
        page: u32,
    ) -> Result<Record, ScrapeError> {
        let document = self.evaluator.parse(response)?;
        self.build_record(&document, response, schema, page)
    }

    /// Extract every record on a page and the next-page hint.
    ///
    /// Without an item-scope query the whole page is one record. Any record
    /// missing a required field fails the page unless the schema allows
    /// partial records.
    pub fn extract_page(
        &self,
        response: &FetchResponse,
        schema: &Schema,
        page: u32,
    ) -> Result<PageExtraction, ScrapeError> {
        let document = self.evaluator.parse(response)?;

        let (records, items_seen) = match &schema.items {
            Some(query) => {
                let items = self.evaluator.select_items(&document, query)?;
                let records = items
                    .iter()
                    .map(|item| self.build_record(item, response, schema, page))
                    .collect::<Result<Vec<_>, _>>()?;
                let seen = items.len();
                (records, seen)
            }
            None => (vec![self.build_record(&document, response, schema, page)?], 1),
        };

        let next = match &schema.next_page {
            Some(rule) => self
                .evaluator
                .evaluate(&document, rule)?
                .and_then(|value| scalar_text(&value)),
            None => None,
        };

        tracing::debug!(
            schema = %schema.name,
            page,
            items = items_seen,
            records = records.len(),
            has_next = next.is_some(),
            "Extracted page"
        );

        Ok(PageExtraction {
            records,
            next,
            items_seen,
        })
    }

    fn build_record(
        &self,
        document: &E::Document,
        response: &FetchResponse,
        schema: &Schema,
        page: u32,
    ) -> Result<Record, ScrapeError> {
        let mut record = Record::new(Provenance {
            source_url: response.final_url.clone(),
            page,
            extracted_at: response.fetched_at,
        });

        for field in &schema.fields {
            let mut value = self.evaluator.evaluate(document, &field.rule)?;
            for transform in &field.transforms {
                value = value.and_then(|v| transform.apply(v, &response.final_url));
            }
            match value {
                Some(v) => {
                    record.fields.insert(field.name.clone(), v);
                }
                None if field.required && !schema.allow_partial => {
                    return Err(ScrapeError::MissingRequiredField(field.name.clone()));
                }
                None => {}
            }
        }
        Ok(record)
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => items.first().and_then(scalar_text),
        _ => None,
    }
}
