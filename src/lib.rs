//! `beacon-logger` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup
//! and process exit codes. The scan session itself lives in [`crate::app`]
//! where it can be tested deterministically with an injected advertisement
//! source and injected storage.

pub mod advertisement;
pub mod app;
pub mod config;
pub mod filter;
pub mod output;
pub mod record;
pub mod scanner;
pub mod sink;

// Re-export commonly used types at the crate root
pub use advertisement::AdvertisementEvent;
pub use app::{
    AdvertisementSource, Options, PlatformSource, RunError, ScanController, ScanState,
    SessionSummary, StopReason,
};
pub use filter::filter;
pub use output::{OutputFormat, RecordFormatter};
pub use record::{Record, build};
pub use scanner::{Backend, ScanError, ScanHandle};
pub use sink::{DurableSink, Storage};
