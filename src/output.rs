use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;
use tracing::{info, warn};

use crate::extract::Record;

const TIMESTAMP_COLUMN: &str = "timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Csv,
}

/// Where a result goes. The format is fixed once, from the extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub path: PathBuf,
    pub format: OutputFormat,
}

impl OutputTarget {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => OutputFormat::Csv,
            _ => OutputFormat::Json,
        };
        OutputTarget { path, format }
    }
}

/// Outcome of a run as reported to the user: the extracted record on
/// success, `{"Success": false, "error": ...}` when no extraction happened.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Extracted(Record),
    Failed { error: String },
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Envelope::Extracted(record) => record.serialize(serializer),
            Envelope::Failed { error } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("Success", &false)?;
                map.serialize_entry("error", error)?;
                map.end()
            }
        }
    }
}

/// Serialize `envelope` and persist it to `target`, if any.
/// Returns the JSON form either way.
pub fn write(envelope: &Envelope, target: Option<&OutputTarget>) -> Result<String> {
    let json = serde_json::to_string(envelope).context("Failed to serialize result")?;

    let Some(target) = target else {
        return Ok(json);
    };

    match (target.format, envelope) {
        (OutputFormat::Csv, Envelope::Extracted(record)) => {
            append_csv(&target.path, record)?;
            info!(path = %target.path.display(), "Appended CSV row");
        }
        // Failure envelopes replace the file whatever its extension.
        _ => {
            std::fs::write(&target.path, &json)
                .with_context(|| format!("Failed to write {}", target.path.display()))?;
            info!(path = %target.path.display(), "Wrote JSON output");
        }
    }

    Ok(json)
}

fn append_csv(path: &Path, record: &Record) -> Result<()> {
    let exists = path.is_file();

    let fields: Vec<(&String, &Value)> = record
        .iter()
        .filter(|(k, _)| k.as_str() != TIMESTAMP_COLUMN)
        .collect();

    let mut header = vec![TIMESTAMP_COLUMN.to_string()];
    header.extend(fields.iter().map(|(k, _)| k.to_string()));

    if exists {
        check_header(path, &header);
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    if !exists {
        writer.write_record(&header)?;
    }

    let mut row = vec![timestamp()];
    row.extend(fields.iter().map(|(_, v)| cell(v)));
    writer.write_record(&row)?;
    writer
        .flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// An existing file keeps its header; a different one only gets a warning.
fn check_header(path: &Path, expected: &[String]) {
    let existing = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .ok()
        .and_then(|mut r| r.records().next())
        .and_then(|r| r.ok());

    if let Some(existing) = existing {
        if existing.iter().ne(expected.iter().map(String::as_str)) {
            warn!(
                path = %path.display(),
                existing = ?existing.iter().collect::<Vec<_>>(),
                expected = ?expected,
                "CSV header does not match this schema; appending anyway"
            );
        }
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

// ── Tests ──
