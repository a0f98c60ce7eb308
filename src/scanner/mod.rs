//! BLE advertisement sources.
//!
//! Each backend pushes every advertisement it sees into a single bounded
//! channel and hands the receiving end back in a [`ScanHandle`]. The
//! consumer processes events strictly in arrival order, so the output sink
//! only ever has one writer.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::advertisement::AdvertisementEvent;
use log::warn;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth adapter could not be initialized (no adapter, permission denied, ...)
    #[error("Bluetooth unavailable: {0}")]
    SourceUnavailable(String),
    /// Backend not available (not compiled in)
    #[error("Backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(String),
}

/// Bluetooth manufacturer-specific data type (AD type 0xFF)
pub const MANUFACTURER_DATA_TYPE: u8 = 0xff;

/// Channel buffer size for advertisement events.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            #[cfg(feature = "hci")]
            "hci" | "raw" => Ok(Backend::Hci),
            _ => Err(ScanError::BackendNotAvailable(s.to_string())),
        }
    }
}

/// A running scan.
///
/// Yields advertisements through [`ScanHandle::recv`] until the backend
/// stops or [`ScanHandle::stop`] is called.
#[derive(Debug)]
pub struct ScanHandle {
    events: mpsc::Receiver<AdvertisementEvent>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ScanHandle {
    /// Wrap a backend task.
    ///
    /// The task must push events into the sender paired with `events`, and
    /// must return once `shutdown` fires or its sender reports the channel
    /// closed.
    pub fn new(
        events: mpsc::Receiver<AdvertisementEvent>,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            events,
            shutdown,
            task,
        }
    }

    /// Receive the next advertisement. `None` once the backend has finished.
    pub async fn recv(&mut self) -> Option<AdvertisementEvent> {
        self.events.recv().await
    }

    /// Stop scanning and wait until the backend has acknowledged.
    ///
    /// Events still queued in the channel are discarded. Once this returns
    /// no further events will be produced.
    pub async fn stop(self) {
        let ScanHandle {
            mut events,
            shutdown,
            task,
        } = self;

        events.close();
        // the task may already have exited on its own
        let _ = shutdown.send(());

        if let Err(e) = task.await {
            warn!("scanner task ended abnormally: {e}");
        }
    }
}

/// Start scanning with the specified backend.
///
/// `target_id` lets backends that support it pre-filter advertisements in
/// the controller or daemon. Callers still filter every event themselves.
///
/// # Errors
/// Returns `ScanError::SourceUnavailable` if the adapter cannot be initialized.
pub async fn start_scan(backend: Backend, target_id: u16) -> Result<ScanHandle, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::start_scan(target_id).await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::start_scan(target_id).await,
    }
}
