//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.
//!
//! BlueZ reports new advertisements from a known device as property changes
//! on that device, so after the advertisement monitor has found a device we
//! follow its property stream and emit a fresh snapshot on every update.
//! One D-Bus signal fans out into one event per changed property, so events
//! that arrive together are handled as a single update.

use super::{EVENT_CHANNEL_BUFFER_SIZE, MANUFACTURER_DATA_TYPE, ScanError, ScanHandle};
use crate::advertisement::AdvertisementEvent;
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Adapter, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::StreamExt;
use log::{debug, trace};
use std::collections::HashSet;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

/// Upper bound on property events merged into one update.
const PROPERTY_BATCH_SIZE: usize = 16;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::SourceUnavailable(err.to_string())
    }
}

/// Start a passive scan for advertisements carrying `target_id` manufacturer data.
///
/// Initializes the default adapter and registers an advertisement monitor
/// matching the manufacturer id. Runs until the returned handle is stopped.
///
/// # Errors
/// Returns `ScanError::SourceUnavailable` if the session, adapter or monitor
/// cannot be set up.
pub async fn start_scan(target_id: u16) -> Result<ScanHandle, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    // Manufacturer ids are little-endian on air
    let pattern = Pattern {
        data_type: MANUFACTURER_DATA_TYPE,
        start_position: 0,
        content: target_id.to_le_bytes().to_vec(),
    };

    let monitor_manager = adapter.monitor().await?;
    let mut monitor_handle = monitor_manager
        .register(Monitor {
            patterns: Some(vec![pattern]),
            ..Default::default()
        })
        .await?;

    // Spawn a task that owns all Bluetooth state and runs the event loop
    let task = tokio::spawn(async move {
        // Keep all Bluetooth state alive by moving it into this task
        let _session = session;
        let _monitor_manager = monitor_manager;

        let mut watchers = JoinSet::new();
        let mut watched = HashSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                event = monitor_handle.next() => match event {
                    Some(MonitorEvent::DeviceFound(device_id)) => {
                        if watched.insert(device_id.device) {
                            debug!("following device {}", device_id.device);
                            watchers.spawn(watch_device(adapter.clone(), device_id.device, tx.clone()));
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        // aborts every per-device watcher and waits for them to finish
        watchers.shutdown().await;
    });

    Ok(ScanHandle::new(rx, shutdown_tx, task))
}

/// Emit an event for the device now and on every advertisement-related update.
async fn watch_device(adapter: Adapter, address: Address, tx: mpsc::Sender<AdvertisementEvent>) {
    let device = match adapter.device(address) {
        Ok(device) => device,
        Err(e) => {
            debug!("cannot open device {address}: {e}");
            return;
        }
    };

    if !forward_snapshot(&device, &tx).await {
        return;
    }

    let mut updates = match device.events().await {
        Ok(events) => events.ready_chunks(PROPERTY_BATCH_SIZE),
        Err(e) => {
            debug!("cannot follow device {address}: {e}");
            return;
        }
    };

    while let Some(batch) = updates.next().await {
        if carries_advertisement(&batch) && !forward_snapshot(&device, &tx).await {
            return;
        }
    }
}

/// Whether a batch of device events reflects a newly received advertisement.
fn carries_advertisement(batch: &[DeviceEvent]) -> bool {
    batch.iter().any(|event| {
        matches!(
            event,
            DeviceEvent::PropertyChanged(
                DeviceProperty::Rssi(_)
                    | DeviceProperty::ManufacturerData(_)
                    | DeviceProperty::ServiceData(_)
            )
        )
    })
}

/// Send the device's current advertisement data. Returns `false` once the
/// receiving side has gone away.
async fn forward_snapshot(device: &Device, tx: &mpsc::Sender<AdvertisementEvent>) -> bool {
    match snapshot(device).await {
        Ok(event) => tx.send(event).await.is_ok(),
        Err(e) => {
            trace!("skipping update from {}: {e}", device.address());
            true
        }
    }
}

async fn snapshot(device: &Device) -> bluer::Result<AdvertisementEvent> {
    let rssi = device.rssi().await?.unwrap_or_default();
    let manufacturer_data = device.manufacturer_data().await?.unwrap_or_default();
    let service_data = device
        .service_data()
        .await?
        .unwrap_or_default()
        .into_iter()
        .map(|(uuid, data)| (uuid.to_string(), data))
        .collect();

    Ok(AdvertisementEvent {
        address: device.address().to_string(),
        rssi,
        manufacturer_data,
        service_data,
    })
}
