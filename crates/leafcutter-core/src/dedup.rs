use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::{Record, compute_hash};
use crate::result::ScrapeResult;
use crate::traits::KeyFunction;

/// Fingerprint identifying semantically equivalent records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, replace punctuation with spaces and collapse whitespace.
///
/// `"ACME, Inc."` and `"acme inc"` normalise to the same text.
pub fn normalize_text(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Key function hashing the normalised text of a set of fields.
///
/// Returns no key when none of the fields is present, so such records are
/// always kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldKey {
    fields: Vec<String>,
}

impl FieldKey {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl KeyFunction for FieldKey {
    fn key(&self, record: &Record) -> Option<DedupKey> {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|f| record.text(f).map(|t| normalize_text(&t)).unwrap_or_default())
            .collect();
        if parts.iter().all(String::is_empty) {
            return None;
        }
        Some(DedupKey(compute_hash(&parts.join("\u{1f}"))))
    }
}

/// Key function that never produces a key: every record is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKey;

impl KeyFunction for NoKey {
    fn key(&self, _record: &Record) -> Option<DedupKey> {
        None
    }
}

/// What happens to the fields of a duplicate record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// Duplicates are dropped untouched.
    #[default]
    Disabled,
    /// Fields missing on the first-seen record are copied from the duplicate.
    /// On conflict the first-seen value stays.
    FillMissing,
    /// Every field present on the duplicate overwrites the kept record.
    PreferLatest,
}

/// Outcome of [`DedupEngine::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    New,
    Duplicate,
}

/// Collapses records sharing a [`DedupKey`], preserving first-seen order.
pub struct DedupEngine {
    key_fn: Arc<dyn KeyFunction>,
    merge: MergePolicy,
    records: Vec<Record>,
    /// Index into `records`, or `None` for keys seeded from a prior result.
    index: HashMap<DedupKey, Option<usize>>,
    duplicates: usize,
}

impl fmt::Debug for DedupEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupEngine")
            .field("merge", &self.merge)
            .field("records", &self.records.len())
            .field("keys", &self.index.len())
            .field("duplicates", &self.duplicates)
            .finish()
    }
}

impl DedupEngine {
    pub fn new(key_fn: Arc<dyn KeyFunction>, merge: MergePolicy) -> Self {
        Self {
            key_fn,
            merge,
            records: Vec::new(),
            index: HashMap::new(),
            duplicates: 0,
        }
    }

    /// Mark every keyed record of a prior result as already seen.
    ///
    /// Prior records are not re-emitted; later matches count as duplicates.
    pub fn with_prior(mut self, prior: &ScrapeResult) -> Self {
        for record in &prior.records {
            if let Some(key) = self.key_fn.key(record) {
                self.index.entry(key).or_insert(None);
            }
        }
        tracing::debug!(seeded = self.index.len(), "Seeded dedup keys from prior result");
        self
    }

    pub fn ingest(&mut self, record: Record) -> Ingest {
        let Some(key) = self.key_fn.key(&record) else {
            self.records.push(record);
            return Ingest::New;
        };

        match self.index.get(&key).copied() {
            None => {
                self.index.insert(key, Some(self.records.len()));
                self.records.push(record);
                Ingest::New
            }
            Some(slot) => {
                self.duplicates += 1;
                if let Some(i) = slot {
                    merge_into(&mut self.records[i], record, self.merge);
                }
                Ingest::Duplicate
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn duplicates_dropped(&self) -> usize {
        self.duplicates
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

fn merge_into(kept: &mut Record, duplicate: Record, policy: MergePolicy) {
    match policy {
        MergePolicy::Disabled => {}
        MergePolicy::FillMissing => {
            for (name, value) in duplicate.fields {
                kept.fields.entry(name).or_insert(value);
            }
        }
        MergePolicy::PreferLatest => {
            for (name, value) in duplicate.fields {
                kept.fields.insert(name, value);
            }
        }
    }
}
