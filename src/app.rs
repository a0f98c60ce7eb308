//! Scan session controller for `beacon-logger`.
//!
//! This module is intentionally decoupled from CLI parsing and process exit codes
//! so it can be tested deterministically with an injected source and storage.

use crate::advertisement::AdvertisementEvent;
use crate::config::{
    DEFAULT_MANUFACTURER_ID, DEFAULT_OUTPUT_PATH, DEFAULT_SCAN_DURATION, parse_duration,
    parse_manufacturer_id,
};
use crate::filter::filter;
use crate::output::OutputFormat;
use crate::record::{self, format_manufacturer_id};
use crate::scanner::{Backend, ScanError, ScanHandle};
use crate::sink::{DurableSink, Storage};
use chrono::Local;
use clap::Parser;
use log::{debug, info, trace, warn};
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Configuration for a scan session.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Manufacturer id to record, decimal or 0x-prefixed hex.
    #[arg(
        long,
        value_parser = parse_manufacturer_id,
        default_value_t = DEFAULT_MANUFACTURER_ID,
        value_name = "ID"
    )]
    pub manufacturer_id: u16,

    /// Output log file. Truncated if it exists.
    #[arg(short, long, default_value = DEFAULT_OUTPUT_PATH, value_name = "PATH")]
    pub output: PathBuf,

    /// How long to scan.
    /// Accepts seconds (fractions allowed) or a suffix: 500ms, 30s, 2m, 1h.
    #[arg(short, long, value_parser = parse_duration, default_value = DEFAULT_SCAN_DURATION)]
    pub duration: Duration,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Output log format
    #[arg(long, default_value_t, value_enum)]
    pub format: OutputFormat,

    /// Verbose output, log every matching advertisement
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Errors returned by a scan session.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("cannot open output {}: {source}", path.display())]
    SinkOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("scan session already started")]
    AlreadyStarted,
}

/// Source abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait AdvertisementSource: Send + Sync {
    fn start_scanning(
        &self,
        backend: Backend,
        target_id: u16,
    ) -> Pin<Box<dyn Future<Output = Result<ScanHandle, ScanError>> + Send + '_>>;
}

/// Real source implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformSource;

impl AdvertisementSource for PlatformSource {
    fn start_scanning(
        &self,
        backend: Backend,
        target_id: u16,
    ) -> Pin<Box<dyn Future<Output = Result<ScanHandle, ScanError>> + Send + '_>> {
        Box::pin(async move { crate::scanner::start_scan(backend, target_id).await })
    }
}

/// Lifecycle of a [`ScanController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    Stopped,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DurationElapsed,
    Cancelled,
    SourceClosed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::DurationElapsed => write!(f, "duration elapsed"),
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::SourceClosed => write!(f, "source closed"),
        }
    }
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Advertisements taken from the source
    pub events_seen: u64,
    /// Advertisements carrying the target manufacturer id
    pub matched: u64,
    /// Rows durably written
    pub written: u64,
    /// Rows dropped because the append failed
    pub failed_writes: u64,
    pub stop_reason: Option<StopReason>,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} advertisements, {} matched, {} written, {} failed",
            self.events_seen, self.matched, self.written, self.failed_writes
        )?;
        if let Some(reason) = self.stop_reason {
            write!(f, " ({reason})")?;
        }
        Ok(())
    }
}

/// Owns all state of one scan session: target id, deadline, source handle
/// and output sink.
///
/// A controller runs at most once. Events are processed one at a time, each
/// filter, build and append completing before the next event is taken.
#[derive(Debug)]
pub struct ScanController {
    target_id: u16,
    duration: Duration,
    backend: Backend,
    state: ScanState,
    summary: SessionSummary,
}

impl ScanController {
    pub fn new(target_id: u16, duration: Duration, backend: Backend) -> Self {
        Self {
            target_id,
            duration,
            backend,
            state: ScanState::Idle,
            summary: SessionSummary::default(),
        }
    }

    pub fn from_options(options: &Options) -> Self {
        Self::new(options.manufacturer_id, options.duration, options.backend)
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn summary(&self) -> SessionSummary {
        self.summary
    }

    /// Create (or truncate) `output`, write it in `format` and run the session.
    ///
    /// # Errors
    /// Startup failures (output cannot be opened, header cannot be written,
    /// source unavailable) are returned. Per-record write failures are not.
    pub async fn run<F>(
        &mut self,
        output: &Path,
        format: OutputFormat,
        source: &dyn AdvertisementSource,
        cancel: F,
    ) -> Result<SessionSummary, RunError>
    where
        F: Future<Output = ()>,
    {
        self.ensure_idle()?;

        let sink = match DurableSink::open(output, format.formatter()) {
            Ok(sink) => sink,
            Err(e) => {
                self.state = ScanState::Stopped;
                return Err(RunError::SinkOpen {
                    path: output.to_path_buf(),
                    source: e,
                });
            }
        };

        self.run_with_sink(sink, source, cancel).await
    }

    /// Run the session against an already opened sink.
    ///
    /// Stops when the duration elapses, `cancel` resolves or the source ends,
    /// whichever comes first. The source has acknowledged the stop before
    /// the sink is closed.
    pub async fn run_with_sink<S, F>(
        &mut self,
        mut sink: DurableSink<S>,
        source: &dyn AdvertisementSource,
        cancel: F,
    ) -> Result<SessionSummary, RunError>
    where
        S: Storage,
        F: Future<Output = ()>,
    {
        self.ensure_idle()?;

        if let Err(e) = sink.write_header() {
            self.state = ScanState::Stopped;
            return Err(e.into());
        }

        let mut handle = match source.start_scanning(self.backend, self.target_id).await {
            Ok(handle) => handle,
            Err(e) => {
                self.state = ScanState::Stopped;
                // best effort, the scan error is what the caller needs to see
                let _ = sink.close();
                return Err(e.into());
            }
        };

        self.state = ScanState::Scanning;
        info!(
            "scanning for manufacturer {} advertisements for {:?}",
            format_manufacturer_id(self.target_id),
            self.duration
        );

        let now = Instant::now();
        let deadline = now
            .checked_add(self.duration)
            .unwrap_or_else(|| now + Duration::from_secs(u32::MAX.into()));
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        tokio::pin!(cancel);

        let reason = loop {
            tokio::select! {
                biased;
                _ = &mut sleep => break StopReason::DurationElapsed,
                _ = &mut cancel => break StopReason::Cancelled,
                event = handle.recv() => match event {
                    // the timer may not have been polled to completion yet
                    Some(_) if Instant::now() >= deadline => break StopReason::DurationElapsed,
                    Some(event) => self.process(&event, &mut sink),
                    None => break StopReason::SourceClosed,
                },
            }
        };

        self.state = ScanState::Stopped;
        self.summary.stop_reason = Some(reason);
        debug!("stopping scan: {reason}");

        handle.stop().await;
        sink.close()?;

        Ok(self.summary)
    }

    fn ensure_idle(&self) -> Result<(), RunError> {
        match self.state {
            ScanState::Idle => Ok(()),
            _ => Err(RunError::AlreadyStarted),
        }
    }

    /// Filter, build and append one advertisement.
    fn process<S: Storage>(&mut self, event: &AdvertisementEvent, sink: &mut DurableSink<S>) {
        self.summary.events_seen += 1;

        let Some(payload) = filter(event, self.target_id) else {
            trace!("ignoring advertisement from {}", event.address);
            return;
        };
        self.summary.matched += 1;

        let record = record::build(event, payload, self.target_id, Local::now().fixed_offset());
        match sink.append(&record) {
            Ok(()) => {
                self.summary.written += 1;
                debug!(
                    "{} rssi={} mdata={} service_data={}",
                    record.address, record.rssi, record.raw_payload, record.service_data_json
                );
            }
            Err(e) => {
                self.summary.failed_writes += 1;
                warn!("dropping record from {}: {e}", record.address);
            }
        }
    }
}
