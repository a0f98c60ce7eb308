//! Durable append-only output log.
//!
//! Every successful [`DurableSink::append`] has been flushed and synced to
//! storage before it returns, so killing the process right after the k-th
//! successful append leaves at least k data rows in the file.
//!
//! A failed append rolls the store back to the end of the last committed
//! row, so a partially written row never merges with the next one.

use crate::output::RecordFormatter;
use crate::record::Record;
use log::warn;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

/// Initial capacity of the per-row encode buffer.
const ROW_BUFFER_CAPACITY: usize = 256;

/// A writable store that can push its contents to stable storage.
pub trait Storage: Write {
    /// Make everything written so far durable.
    fn sync(&mut self) -> io::Result<()>;

    /// Discard everything past the first `len` bytes and continue writing
    /// from there.
    fn rollback(&mut self, len: u64) -> io::Result<()>;
}

impl Storage for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn rollback(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        Ok(())
    }
}

/// Like `Write::write_all`, but reports how many bytes were accepted
/// before a failure.
fn write_counted<W: Write>(out: &mut W, mut data: &[u8], written: &mut usize) -> io::Result<()> {
    while !data.is_empty() {
        match out.write(data) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                *written += n;
                data = &data[n..];
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Append-only record log with per-row durability.
///
/// The sink is owned by a single writer for its whole lifetime.
pub struct DurableSink<S: Storage = File> {
    storage: S,
    formatter: Box<dyn RecordFormatter>,
    buf: Vec<u8>,
    /// Bytes in the store that belong to complete rows.
    committed: u64,
    /// A partial row is left in the store because rollback failed.
    torn: bool,
}

impl DurableSink<File> {
    /// Create or truncate the file at `path`.
    ///
    /// # Errors
    /// Returns an `io::Error` if the file cannot be created or is not writable.
    pub fn open(path: impl AsRef<Path>, formatter: Box<dyn RecordFormatter>) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(file, formatter))
    }
}

impl<S: Storage> DurableSink<S> {
    /// Wrap an already opened, empty store.
    pub fn new(storage: S, formatter: Box<dyn RecordFormatter>) -> Self {
        Self {
            storage,
            formatter,
            buf: Vec::with_capacity(ROW_BUFFER_CAPACITY),
            committed: 0,
            torn: false,
        }
    }

    /// Write the header row.
    ///
    /// Not guarded: calling this twice writes two header rows.
    pub fn write_header(&mut self) -> io::Result<()> {
        self.buf.clear();
        self.formatter.write_header(&mut self.buf)?;
        self.commit()
    }

    /// Append one record and sync it to storage.
    ///
    /// # Errors
    /// Returns an `io::Error` if writing, flushing or syncing fails. The
    /// store is then rolled back to the previous row boundary.
    pub fn append(&mut self, record: &Record) -> io::Result<()> {
        self.buf.clear();
        self.formatter.write_record(record, &mut self.buf)?;
        self.commit()
    }

    /// Flush, sync and release the underlying store.
    pub fn close(mut self) -> io::Result<S> {
        self.storage.flush()?;
        self.storage.sync()?;
        Ok(self.storage)
    }

    fn commit(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        // terminate the leftover partial row so this one starts on its own line
        if self.torn {
            self.buf.insert(0, b'\n');
        }

        // one write per row so a row is never interleaved with another
        let mut written = 0;
        let result = write_counted(&mut self.storage, &self.buf, &mut written)
            .and_then(|()| self.storage.flush())
            .and_then(|()| self.storage.sync());

        match result {
            Ok(()) => {
                self.committed += written as u64;
                self.torn = false;
                Ok(())
            }
            Err(e) => {
                if written > 0 {
                    if let Err(rollback) = self.storage.rollback(self.committed) {
                        warn!("could not discard partial row: {rollback}");
                        self.committed += written as u64;
                        self.torn = true;
                    }
                }
                Err(e)
            }
        }
    }
}
