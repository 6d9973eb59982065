//! In-memory transport, used by tests and scratch pipelines.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{Result, TesseraError};

use super::{sort_expand_and_combine, Transport, DEFAULT_PAGE_SIZE};

/// Counters describing the I/O a [`MemoryTransport`] has served.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TransportStats {
    /// Number of `read_ranges` calls.
    pub readv_calls: u64,
    /// Total bytes handed back across all reads.
    pub bytes_served: u64,
}

/// A [`Transport`] holding files in a shared map.
///
/// Files can be deleted at any time, which makes this the backend of choice
/// for exercising the vanished-file reload protocol; read counters make I/O
/// patterns assertable.
pub struct MemoryTransport {
    files: RwLock<FxHashMap<String, Bytes>>,
    page_size: usize,
    readv_calls: AtomicU64,
    bytes_served: AtomicU64,
}

impl MemoryTransport {
    /// Creates an empty transport with the default page size.
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Creates an empty transport advertising `page_size`.
    pub fn with_page_size(page_size: usize) -> Self {
        MemoryTransport {
            files: RwLock::new(FxHashMap::default()),
            page_size,
            readv_calls: AtomicU64::new(0),
            bytes_served: AtomicU64::new(0),
        }
    }

    /// Removes `path`, so that subsequent reads fail with `StorageNotFound`.
    pub fn delete(&self, path: &str) -> Result<()> {
        self.files
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| TesseraError::StorageNotFound {
                path: path.to_string(),
            })
    }

    /// Snapshot of the I/O counters.
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            readv_calls: self.readv_calls.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
        }
    }

    fn file(&self, path: &str) -> Result<Bytes> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| TesseraError::StorageNotFound {
                path: path.to_string(),
            })
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn read_ranges(
        &self,
        path: &str,
        ranges: &[(u64, usize)],
        adjust_for_latency: bool,
        upper_limit: Option<u64>,
    ) -> Result<Vec<(u64, Vec<u8>)>> {
        let data = self.file(path)?;
        let ranges = if adjust_for_latency {
            sort_expand_and_combine(ranges, self.page_size, upper_limit)
        } else {
            ranges.to_vec()
        };
        self.readv_calls.fetch_add(1, Ordering::Relaxed);
        trace!(path, ranges = ranges.len(), "transport.readv");
        let mut out = Vec::with_capacity(ranges.len());
        for (offset, length) in ranges {
            let start = offset as usize;
            let available = data.len().saturating_sub(start);
            if available < length {
                return Err(TesseraError::ShortRead {
                    path: path.to_string(),
                    offset,
                    expected: length,
                    actual: available,
                });
            }
            self.bytes_served.fetch_add(length as u64, Ordering::Relaxed);
            out.push((offset, data[start..start + length].to_vec()));
        }
        Ok(out)
    }

    fn read_whole(&self, path: &str) -> Result<Vec<u8>> {
        let data = self.file(path)?;
        self.bytes_served
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data.to_vec())
    }

    fn file_size(&self, path: &str) -> Result<u64> {
        Ok(self.file(path)?.len() as u64)
    }

    fn recommended_page_size(&self) -> usize {
        self.page_size
    }

    fn put_bytes(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.files
            .write()
            .insert(path.to_string(), Bytes::copy_from_slice(bytes));
        Ok(())
    }
}
