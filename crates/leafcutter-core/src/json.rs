//! Rule evaluation over JSON payloads.
//!
//! Queries are dotted paths: `data.items.0.title`. A leading `$` or `$.` is
//! accepted and ignored, `*` matches every element of an array (or every
//! value of an object), and numeric segments index into arrays. A query
//! starting with `..` searches the whole document for a key
//! (`..cik` finds every `cik` at any depth). A rule's `attribute` is read
//! as a key on each matched value.

use serde_json::Value;

use crate::error::ScrapeError;
use crate::models::{FetchResponse, FetchStrategy, Payload};
use crate::schema::ExtractionRule;
use crate::traits::RuleEvaluator;

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEvaluator;

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Key(&'a str),
    Index(usize),
    Wildcard,
}

#[derive(Debug, PartialEq)]
enum JsonPath<'a> {
    Path(Vec<Segment<'a>>),
    Recursive(&'a str),
}

fn compile(query: &str) -> Result<JsonPath<'_>, ScrapeError> {
    let invalid = |message: &str| ScrapeError::InvalidRule {
        rule: query.to_string(),
        message: message.to_string(),
    };

    let query = query.trim();
    if let Some(key) = query.strip_prefix("..") {
        if key.is_empty() || key.contains('.') {
            return Err(invalid("recursive search takes a single key"));
        }
        return Ok(JsonPath::Recursive(key));
    }

    let body = query
        .strip_prefix("$.")
        .or_else(|| query.strip_prefix('$'))
        .unwrap_or(query);
    if body.is_empty() {
        return Ok(JsonPath::Path(Vec::new()));
    }

    body.split('.')
        .map(|seg| match seg {
            "" => Err(invalid("empty path segment")),
            "*" => Ok(Segment::Wildcard),
            s if s.bytes().all(|b| b.is_ascii_digit()) => s
                .parse()
                .map(Segment::Index)
                .map_err(|_| invalid("index out of range")),
            s => Ok(Segment::Key(s)),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(JsonPath::Path)
}

fn resolve<'v>(root: &'v Value, path: &JsonPath<'_>) -> Vec<&'v Value> {
    match path {
        JsonPath::Recursive(key) => {
            let mut out = Vec::new();
            find_all(root, key, &mut out);
            out
        }
        JsonPath::Path(segments) => {
            let mut current = vec![root];
            for segment in segments {
                current = current
                    .into_iter()
                    .flat_map(|value| step(value, segment))
                    .collect();
                if current.is_empty() {
                    break;
                }
            }
            current
        }
    }
}

fn step<'v>(value: &'v Value, segment: &Segment<'_>) -> Vec<&'v Value> {
    match (segment, value) {
        (Segment::Key(key), Value::Object(map)) => map.get(*key).into_iter().collect(),
        (Segment::Index(i), Value::Array(items)) => items.get(*i).into_iter().collect(),
        // Objects keyed by numbers ("0", "1", ...) are common in API payloads.
        (Segment::Index(i), Value::Object(map)) => map.get(&i.to_string()).into_iter().collect(),
        (Segment::Wildcard, Value::Array(items)) => items.iter().collect(),
        (Segment::Wildcard, Value::Object(map)) => map.values().collect(),
        _ => Vec::new(),
    }
}

fn find_all<'v>(value: &'v Value, key: &str, out: &mut Vec<&'v Value>) {
    match value {
        Value::Object(map) => {
            if let Some(found) = map.get(key) {
                out.push(found);
            }
            for nested in map.values() {
                find_all(nested, key, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                find_all(item, key, out);
            }
        }
        _ => {}
    }
}

fn is_empty_match(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

impl JsonEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl RuleEvaluator for JsonEvaluator {
    type Document = Value;

    fn parse(&self, response: &FetchResponse) -> Result<Value, ScrapeError> {
        let parsed = match &response.payload {
            Payload::Json(value) => return Ok(value.clone()),
            Payload::Text(text) | Payload::Html(text) => serde_json::from_str(text),
            Payload::Bytes(bytes) => serde_json::from_slice(bytes),
        };
        parsed.map_err(|e| {
            ScrapeError::DocumentFormat(format!(
                "{} payload from {} is not JSON: {e}",
                response.payload.kind(),
                response.final_url
            ))
        })
    }

    fn select_items(&self, document: &Value, query: &str) -> Result<Vec<Value>, ScrapeError> {
        let path = compile(query)?;
        let matches = resolve(document, &path);
        // A path landing on an array selects its elements.
        if matches.len() == 1
            && let Some(Value::Array(items)) = matches.first().copied()
        {
            return Ok(items.clone());
        }
        Ok(matches.into_iter().cloned().collect())
    }

    fn evaluate(
        &self,
        document: &Value,
        rule: &ExtractionRule,
    ) -> Result<Option<Value>, ScrapeError> {
        let path = compile(&rule.query)?;
        let mut matches = resolve(document, &path);
        if let Some(attribute) = &rule.attribute {
            matches = matches
                .into_iter()
                .filter_map(|v| v.get(attribute.as_str()))
                .collect();
        }
        let mut matches = matches.into_iter().filter(|v| !is_empty_match(v));

        if rule.multiple {
            let all: Vec<Value> = matches.cloned().collect();
            Ok((!all.is_empty()).then_some(Value::Array(all)))
        } else {
            Ok(matches.next().cloned())
        }
    }

    fn validate_rule(
        &self,
        _strategy: FetchStrategy,
        rule: &ExtractionRule,
    ) -> Result<(), ScrapeError> {
        compile(&rule.query).map(|_| ())
    }
}
