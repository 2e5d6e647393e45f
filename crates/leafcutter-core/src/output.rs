//! Writers for scraped records.
//!
//! Records are flattened first (see [`Record::flatten`]), so nested values
//! become `parent_child` columns and provenance appears as `_source_url`,
//! `_page` and `_extracted_at`.

use std::io::Write;

use serde_json::Value;

use crate::error::ScrapeError;
use crate::models::Record;

/// Write one flat JSON object per line.
pub fn write_json_lines<W: Write>(records: &[Record], mut writer: W) -> Result<usize, ScrapeError> {
    for record in records {
        serde_json::to_writer(&mut writer, &record.flatten())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(records.len())
}

/// Write records as CSV. The header is the union of all flat keys in
/// first-seen order; absent values are left empty.
pub fn write_csv<W: Write>(records: &[Record], writer: W) -> Result<usize, ScrapeError> {
    let rows: Vec<_> = records.iter().map(Record::flatten).collect();

    let mut header: Vec<&str> = Vec::new();
    for row in &rows {
        for key in row.keys() {
            if !header.contains(&key.as_str()) {
                header.push(key.as_str());
            }
        }
    }

    let mut out = csv::Writer::from_writer(writer);
    if !header.is_empty() {
        out.write_record(&header)?;
    }
    for row in &rows {
        out.write_record(header.iter().map(|key| cell(row.get(*key))))?;
    }
    out.flush()?;
    Ok(rows.len())
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
