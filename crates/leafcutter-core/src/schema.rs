use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::ScrapeError;

/// Declarative description of the fields to extract from a page.
///
/// Schemas are plain values: site-specific selectors live in the JSON a
/// caller passes in, never in engine code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    /// Fields in output order.
    pub fields: Vec<FieldSpec>,
    /// Item-scope query. When set, each matched item yields one record.
    #[serde(default)]
    pub items: Option<String>,
    /// Rule producing the next-page link or continuation token.
    #[serde(default)]
    pub next_page: Option<ExtractionRule>,
    /// Keep records that miss required fields instead of failing the page.
    #[serde(default)]
    pub allow_partial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub rule: ExtractionRule,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub transforms: Vec<Transform>,
}

/// A query understood by the strategy's rule evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRule {
    /// Opaque to the core (CSS selector, JSON path, ...).
    pub query: String,
    /// Attribute to read instead of the text content.
    #[serde(default)]
    pub attribute: Option<String>,
    /// Collect every match as a list instead of the first one.
    #[serde(default)]
    pub multiple: bool,
}

impl ExtractionRule {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            attribute: None,
            multiple: false,
        }
    }

    pub fn attr(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub fn all(mut self) -> Self {
        self.multiple = true;
        self
    }
}

impl fmt::Display for ExtractionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.attribute {
            Some(attr) => write!(f, "{}@{}", self.query, attr),
            None => f.write_str(&self.query),
        }
    }
}

/// Value transformation applied after a rule matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transform {
    Trim,
    CollapseWhitespace,
    Lowercase,
    Uppercase,
    /// First decimal number in the text; currency symbols and thousands
    /// separators are ignored.
    Number,
    /// Like `number`, truncated to an integer.
    Integer,
    /// Resolve a relative link against the page URL.
    AbsoluteUrl,
    /// Caller-registered function. Not representable in JSON.
    #[serde(skip)]
    Custom(CustomTransform),
}

type TransformFn = dyn Fn(Value) -> Option<Value> + Send + Sync;

/// Named caller-supplied transform.
#[derive(Clone)]
pub struct CustomTransform {
    name: String,
    func: Arc<TransformFn>,
}

impl CustomTransform {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for CustomTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomTransform")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Transform {
    /// Apply to a matched value. `None` means the value could not be converted
    /// and the field counts as unmatched.
    ///
    /// Lists are transformed element-wise; elements that fail are dropped.
    pub fn apply(&self, value: Value, source_url: &str) -> Option<Value> {
        if let Transform::Custom(custom) = self {
            return (custom.func)(value);
        }
        match value {
            Value::Array(items) => {
                let out: Vec<Value> = items
                    .into_iter()
                    .filter_map(|item| self.apply(item, source_url))
                    .collect();
                (!out.is_empty()).then_some(Value::Array(out))
            }
            Value::String(s) => self.apply_str(&s, source_url),
            Value::Number(_) if matches!(self, Transform::Integer) => {
                value.as_f64().map(|f| Value::from(f.trunc() as i64))
            }
            other => Some(other),
        }
    }

    fn apply_str(&self, s: &str, source_url: &str) -> Option<Value> {
        let out = match self {
            Transform::Trim => Value::String(s.trim().to_string()),
            Transform::CollapseWhitespace => {
                Value::String(s.split_whitespace().collect::<Vec<_>>().join(" "))
            }
            Transform::Lowercase => Value::String(s.to_lowercase()),
            Transform::Uppercase => Value::String(s.to_uppercase()),
            Transform::Number => parse_number(s)?,
            Transform::Integer => {
                let n = parse_number(s)?.as_f64()?;
                Value::from(n.trunc() as i64)
            }
            Transform::AbsoluteUrl => {
                let base = Url::parse(source_url).ok()?;
                Value::String(base.join(s.trim()).ok()?.to_string())
            }
            Transform::Custom(custom) => (custom.func)(Value::String(s.to_string()))?,
        };
        Some(out)
    }
}

/// Scan for the first number in `text`, e.g. `"$1,250.50 / month"` -> `1250.5`.
fn parse_number(text: &str) -> Option<Value> {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.iter().enumerate().position(|(i, c)| {
        c.is_ascii_digit()
            || (*c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()))
    })?;

    let mut digits = String::new();
    for &c in &chars[start..] {
        match c {
            '0'..='9' | '.' => digits.push(c),
            '-' if digits.is_empty() => digits.push(c),
            ',' | '_' => {}
            _ => break,
        }
    }
    let digits = digits.trim_end_matches('.');

    if !digits.contains('.')
        && let Ok(n) = digits.parse::<i64>()
    {
        return Some(Value::from(n));
    }
    let n = digits.parse::<f64>().ok()?;
    serde_json::Number::from_f64(n).map(Value::Number)
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            items: None,
            next_page: None,
            allow_partial: false,
        }
    }

    pub fn field(mut self, name: impl Into<String>, rule: ExtractionRule) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            rule,
            required: false,
            transforms: Vec::new(),
        });
        self
    }

    pub fn required_field(mut self, name: impl Into<String>, rule: ExtractionRule) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            rule,
            required: true,
            transforms: Vec::new(),
        });
        self
    }

    /// Append a transform to the most recently added field.
    pub fn transform(mut self, transform: Transform) -> Self {
        if let Some(field) = self.fields.last_mut() {
            field.transforms.push(transform);
        }
        self
    }

    pub fn with_items(mut self, query: impl Into<String>) -> Self {
        self.items = Some(query.into());
        self
    }

    pub fn with_next_page(mut self, rule: ExtractionRule) -> Self {
        self.next_page = Some(rule);
        self
    }

    pub fn allowing_partial(mut self) -> Self {
        self.allow_partial = true;
        self
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ScrapeError> {
        let schema: Schema = serde_json::from_str(raw)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn from_path(path: &Path) -> Result<Self, ScrapeError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ScrapeError::Config(format!("Failed to read schema file {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// Structural checks that do not depend on the rule evaluator.
    pub fn validate(&self) -> Result<(), ScrapeError> {
        if self.name.trim().is_empty() {
            return Err(ScrapeError::Config("Schema name must not be empty".into()));
        }
        if self.fields.is_empty() {
            return Err(ScrapeError::Config(format!(
                "Schema '{}' has no fields",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(ScrapeError::Config(format!(
                    "Schema '{}' declares field '{}' twice",
                    self.name, field.name
                )));
            }
            if field.rule.query.trim().is_empty() {
                return Err(ScrapeError::InvalidRule {
                    rule: field.name.clone(),
                    message: "empty query".into(),
                });
            }
        }
        if let Some(items) = &self.items
            && items.trim().is_empty()
        {
            return Err(ScrapeError::InvalidRule {
                rule: "items".into(),
                message: "empty query".into(),
            });
        }
        Ok(())
    }
}
