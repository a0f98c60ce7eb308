//! Command-line value parsers and defaults.

use std::time::Duration;

/// Manufacturer id of the traffic-signal beacons this tool was written for.
pub const DEFAULT_MANUFACTURER_ID: u16 = 0x01CE;

/// Default output log file.
pub const DEFAULT_OUTPUT_PATH: &str = "traffic_raw.csv";

/// Default scan duration, as accepted by [`parse_duration`].
pub const DEFAULT_SCAN_DURATION: &str = "120";

/// Parse a 16-bit manufacturer id, decimal or `0x`-prefixed hex.
///
/// # Examples
/// ```
/// use beacon_logger::config::parse_manufacturer_id;
///
/// assert_eq!(parse_manufacturer_id("0x01CE").unwrap(), 0x01CE);
/// assert_eq!(parse_manufacturer_id("462").unwrap(), 0x01CE);
/// ```
pub fn parse_manufacturer_id(src: &str) -> Result<u16, String> {
    let src = src.trim();

    let parsed = match src
        .strip_prefix("0x")
        .or_else(|| src.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => src.parse(),
    };

    parsed.map_err(|_| format!("invalid manufacturer id: {src} (expected 0-65535 or 0x0000-0xFFFF)"))
}

/// Parse a scan duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// Fractional values are accepted. Zero is allowed; negative, infinite or
/// NaN values are rejected.
///
/// # Examples
/// ```
/// use beacon_logger::config::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("120").unwrap(), Duration::from_secs(120));
/// assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
/// assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num, scale) = if let Some(num) = src.strip_suffix("ms") {
        (num, 0.001)
    } else if let Some(num) = src.strip_suffix('h') {
        (num, 3600.0)
    } else if let Some(num) = src.strip_suffix('m') {
        (num, 60.0)
    } else if let Some(num) = src.strip_suffix('s') {
        (num, 1.0)
    } else {
        (src, 1.0)
    };

    let value: f64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {src}"))?;

    Duration::try_from_secs_f64(value * scale).map_err(|_| format!("invalid duration: {src}"))
}
