//! JSON lines output formatter.

use crate::output::RecordFormatter;
use crate::record::Record;
use std::io::{self, Write};

/// Writes each record as a single-line JSON object. No header row.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLinesFormatter;

impl RecordFormatter for JsonLinesFormatter {
    fn write_record(&self, record: &Record, out: &mut Vec<u8>) -> io::Result<()> {
        serde_json::to_writer(&mut *out, record)?;
        out.write_all(b"\n")
    }
}
