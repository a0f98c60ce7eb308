//! CSV output formatter.

use crate::output::RecordFormatter;
use crate::record::Record;
use std::borrow::Cow;
use std::io::{self, Write};

/// Column names, in output order.
pub const HEADER: [&str; 6] = [
    "timestamp",
    "address",
    "rssi",
    "manufacturer_id",
    "raw_mdata",
    "service_data",
];

const DELIMITER: char = ',';
const QUOTE: char = '"';
const LINE_TERMINATOR: &str = "\r\n";

/// CSV formatter with minimal quoting.
///
/// Fields containing the delimiter, a quote or a line break are wrapped in
/// double quotes with embedded quotes doubled. Rows end with CRLF.
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvFormatter;

/// Quote a field only when it needs quoting.
pub fn escape_field(field: &str) -> Cow<'_, str> {
    let needs_quotes = field
        .chars()
        .any(|c| c == DELIMITER || c == QUOTE || c == '\r' || c == '\n');
    if !needs_quotes {
        return Cow::Borrowed(field);
    }

    let mut quoted = String::with_capacity(field.len() + 2);
    quoted.push(QUOTE);
    for c in field.chars() {
        if c == QUOTE {
            quoted.push(QUOTE);
        }
        quoted.push(c);
    }
    quoted.push(QUOTE);
    Cow::Owned(quoted)
}

fn write_row<'a>(out: &mut Vec<u8>, fields: impl IntoIterator<Item = &'a str>) -> io::Result<()> {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            write!(out, "{DELIMITER}")?;
        }
        out.write_all(escape_field(field).as_bytes())?;
    }
    out.write_all(LINE_TERMINATOR.as_bytes())
}

impl RecordFormatter for CsvFormatter {
    fn write_header(&self, out: &mut Vec<u8>) -> io::Result<()> {
        write_row(out, HEADER)
    }

    fn write_record(&self, record: &Record, out: &mut Vec<u8>) -> io::Result<()> {
        let rssi = record.rssi.to_string();
        write_row(
            out,
            [
                record.timestamp.as_str(),
                record.address.as_str(),
                rssi.as_str(),
                record.manufacturer_id.as_str(),
                record.raw_payload.as_str(),
                record.service_data_json.as_str(),
            ],
        )
    }
}
