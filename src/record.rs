//! Canonical record built from a matching advertisement.

use crate::advertisement::AdvertisementEvent;
use chrono::{DateTime, FixedOffset, SecondsFormat};
use serde::Serialize;
use serde_json::{Map, Value};

/// One row of the output log.
///
/// Serialized field names match the CSV column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    /// Capture time, RFC 3339 with UTC offset. Best-effort wall clock.
    pub timestamp: String,
    /// Device address copied from the advertisement
    pub address: String,
    /// Signal strength copied from the advertisement
    pub rssi: i16,
    /// Target manufacturer id as `0xNNNN`
    pub manufacturer_id: String,
    /// Lowercase hex of the manufacturer payload
    #[serde(rename = "raw_mdata")]
    pub raw_payload: String,
    /// JSON object mapping service UUID to lowercase hex payload
    #[serde(rename = "service_data")]
    pub service_data_json: String,
}

/// Render a manufacturer id the way it is stored in the log.
pub fn format_manufacturer_id(id: u16) -> String {
    format!("0x{id:04X}")
}

/// Build a record from an advertisement that passed the filter.
///
/// `now` is passed in rather than read here so the output is deterministic.
pub fn build(
    event: &AdvertisementEvent,
    payload: &[u8],
    target_id: u16,
    now: DateTime<FixedOffset>,
) -> Record {
    Record {
        timestamp: now.to_rfc3339_opts(SecondsFormat::Micros, false),
        address: event.address.clone(),
        rssi: event.rssi,
        manufacturer_id: format_manufacturer_id(target_id),
        raw_payload: hex::encode(payload),
        service_data_json: service_data_json(event),
    }
}

fn service_data_json(event: &AdvertisementEvent) -> String {
    // serde_json's Map is ordered by key, so the output is stable across runs
    let map: Map<String, Value> = event
        .service_data
        .iter()
        .map(|(uuid, data)| (uuid.clone(), Value::String(hex::encode(data))))
        .collect();
    Value::Object(map).to_string()
}
