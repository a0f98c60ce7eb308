//! Output formatters for records.
//!
//! This module provides a trait for encoding records into rows of the output
//! log and implementations for CSV (the default) and JSON lines.

pub mod csv;
pub mod jsonl;

use crate::record::Record;
use std::io;

/// Trait for encoding records into output rows.
///
/// Implementations append complete rows, including the trailing newline, to
/// an in-memory buffer. The sink writes the buffer in a single call so a
/// row is never split across writes.
pub trait RecordFormatter: Send + Sync {
    /// Append the header row, if the format has one.
    fn write_header(&self, _out: &mut Vec<u8>) -> io::Result<()> {
        Ok(())
    }

    /// Append one data row for `record`.
    fn write_record(&self, record: &Record, out: &mut Vec<u8>) -> io::Result<()>;
}

/// Supported output log formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Comma-separated values with a header row
    #[default]
    Csv,
    /// One JSON object per line
    Jsonl,
}

impl OutputFormat {
    /// Create the formatter for this format.
    pub fn formatter(self) -> Box<dyn RecordFormatter> {
        match self {
            OutputFormat::Csv => Box::new(csv::CsvFormatter),
            OutputFormat::Jsonl => Box::new(jsonl::JsonLinesFormatter),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Csv => write!(f, "csv"),
            OutputFormat::Jsonl => write!(f, "jsonl"),
        }
    }
}
