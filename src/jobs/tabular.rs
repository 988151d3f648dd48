//! Header-less comma-separated tables
//!
//! Parsing goes through `csv`, so quoted fields may contain commas, escaped
//! quotes and line breaks. Records may differ in width; callers that need a
//! rectangular table check it themselves.

use crate::error::{PipelineError, Result};
use std::io::Read;
use std::path::Path;

/// Data records of a table; blank and whitespace-only lines are dropped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub records: Vec<Record>,
}

/// One record with the line it started on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub line: u64,
    pub fields: Vec<String>,
}

impl Table {
    /// Parse CSV from `reader`; `source` only labels error messages
    pub fn from_reader<R: Read>(reader: R, source: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut records = Vec::new();
        for result in reader.records() {
            let record = result.map_err(|e| {
                let line = e.position().map(|p| p.line()).unwrap_or(0);
                PipelineError::InvalidData(format!("{}:{}: {}", source.display(), line, e))
            })?;
            if record.iter().all(|field| field.trim().is_empty()) {
                continue;
            }
            records.push(Record {
                line: record.position().map(|p| p.line()).unwrap_or(0),
                fields: record.iter().map(str::to_string).collect(),
            });
        }
        Ok(Table { records })
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        Self::from_reader(file, path)
    }

    /// Number of fields in the first record, 0 for a table without records
    pub fn width(&self) -> usize {
        self.records.first().map(|r| r.fields.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
