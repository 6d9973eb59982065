#![forbid(unsafe_code)]

//! Byte-range storage backends.
//!
//! Indices never touch files directly; they go through [`Transport`], which
//! supplies batched range reads ("readv"), whole-file reads, sizes and
//! publication. Range requests can be expanded toward the transport's
//! recommended page size so that high-latency backends serve fewer, larger
//! reads.

use std::io;

use crate::error::{Result, TesseraError};

mod local;
mod memory;

pub use local::LocalTransport;
pub use memory::MemoryTransport;

/// Default page size used when a backend has no better answer.
pub const DEFAULT_PAGE_SIZE: usize = 4 * 1024;

/// A byte-range-capable storage backend.
pub trait Transport: Send + Sync + 'static {
    /// Reads the requested `(offset, length)` ranges of `path`.
    ///
    /// With `adjust_for_latency`, ranges are sorted, expanded toward
    /// [`Transport::recommended_page_size`], clamped to `upper_limit` when
    /// known, and coalesced; the returned chunks then arrive in ascending
    /// offset order and one chunk may cover several requests. Without it,
    /// ranges are served exactly as given, in request order.
    ///
    /// Missing files fail with `StorageNotFound`; ranges extending past the
    /// end of an existing file fail with `ShortRead`.
    fn read_ranges(
        &self,
        path: &str,
        ranges: &[(u64, usize)],
        adjust_for_latency: bool,
        upper_limit: Option<u64>,
    ) -> Result<Vec<(u64, Vec<u8>)>>;

    /// Reads the entire file at `path`.
    fn read_whole(&self, path: &str) -> Result<Vec<u8>>;

    /// Size of the file at `path` in bytes.
    fn file_size(&self, path: &str) -> Result<u64>;

    /// Preferred read granularity for this backend.
    fn recommended_page_size(&self) -> usize {
        DEFAULT_PAGE_SIZE
    }

    /// Publishes `bytes` at `path`, replacing any previous content.
    fn put_bytes(&self, path: &str, bytes: &[u8]) -> Result<()>;
}

/// Maps a std I/O error on `path` to the transport error contract.
pub(crate) fn io_error(path: &str, err: io::Error) -> TesseraError {
    if err.kind() == io::ErrorKind::NotFound {
        TesseraError::StorageNotFound {
            path: path.to_string(),
        }
    } else {
        TesseraError::Io(err)
    }
}

/// Sorts ranges, expands each toward `page_size`, clamps to `upper_limit`
/// and merges any that touch or overlap.
///
/// Expansion splits the extra bytes around the request: half before the
/// start (clamped at zero), the rest after the end. Zero-length ranges
/// after clamping are dropped.
pub(crate) fn sort_expand_and_combine(
    ranges: &[(u64, usize)],
    page_size: usize,
    upper_limit: Option<u64>,
) -> Vec<(u64, usize)> {
    let mut sorted: Vec<(u64, usize)> = ranges.to_vec();
    sorted.sort_unstable();
    let mut expanded: Vec<(u64, usize)> = Vec::with_capacity(sorted.len());
    for (offset, length) in sorted {
        let expansion = page_size.saturating_sub(length);
        let reduction = (expansion / 2) as u64;
        let new_offset = offset.saturating_sub(reduction);
        let mut new_length = length + expansion;
        if let Some(limit) = upper_limit {
            if new_offset + new_length as u64 > limit {
                new_length = limit.saturating_sub(new_offset) as usize;
            }
        }
        if new_length == 0 {
            continue;
        }
        expanded.push((new_offset, new_length));
    }
    let mut combined: Vec<(u64, usize)> = Vec::with_capacity(expanded.len());
    let mut iter = expanded.into_iter();
    let Some((mut cur_offset, mut cur_length)) = iter.next() else {
        return combined;
    };
    let mut cur_finish = cur_offset + cur_length as u64;
    for (offset, length) in iter {
        let finish = offset + length as u64;
        if offset > cur_finish {
            combined.push((cur_offset, cur_length));
            cur_offset = offset;
            cur_length = length;
            cur_finish = finish;
            continue;
        }
        if finish > cur_finish {
            cur_finish = finish;
            cur_length = (cur_finish - cur_offset) as usize;
        }
    }
    combined.push((cur_offset, cur_length));
    combined
}
