//! BLE advertisement event as delivered by a scanner backend.

use std::collections::HashMap;

/// One received advertisement.
///
/// Backends produce these and push them into the scan channel; the pipeline
/// consumes each one immediately and does not retain it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementEvent {
    /// Device address as reported by the platform (e.g. "AA:BB:CC:DD:EE:FF")
    pub address: String,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Manufacturer-specific data keyed by company identifier
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service data keyed by canonical 128-bit service UUID string
    pub service_data: HashMap<String, Vec<u8>>,
}

impl AdvertisementEvent {
    /// Create an event without any manufacturer or service data.
    pub fn new(address: impl Into<String>, rssi: i16) -> Self {
        Self {
            address: address.into(),
            rssi,
            manufacturer_data: HashMap::new(),
            service_data: HashMap::new(),
        }
    }

    /// Add a manufacturer data entry.
    pub fn with_manufacturer_data(mut self, id: u16, payload: impl Into<Vec<u8>>) -> Self {
        self.manufacturer_data.insert(id, payload.into());
        self
    }

    /// Add a service data entry.
    pub fn with_service_data(mut self, uuid: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        self.service_data.insert(uuid.into(), payload.into());
        self
    }
}
