//! Local-filesystem transport rooted at a directory.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::error::{Result, TesseraError};

use super::{io_error, sort_expand_and_combine, Transport};

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// Filesystem-backed [`Transport`]; every path is resolved under a base
/// directory, and files are opened per call so a vanished file surfaces as
/// `StorageNotFound` on the operation that hits it.
pub struct LocalTransport {
    base: PathBuf,
}

impl LocalTransport {
    /// Creates a transport rooted at `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        LocalTransport { base: base.into() }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base.join(path)
    }

    fn open(&self, path: &str) -> Result<File> {
        File::open(self.full_path(path)).map_err(|e| io_error(path, e))
    }

    /// Reads exactly `length` bytes at `offset`, failing with `ShortRead`
    /// if the file ends first.
    fn read_range(&self, file: &File, path: &str, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        let mut filled = 0usize;
        while filled < length {
            let read = read_at(file, &mut buf[filled..], offset + filled as u64)
                .map_err(|e| io_error(path, e))?;
            if read == 0 {
                return Err(TesseraError::ShortRead {
                    path: path.to_string(),
                    offset,
                    expected: length,
                    actual: filled,
                });
            }
            filled += read;
        }
        Ok(buf)
    }
}

impl Transport for LocalTransport {
    fn read_ranges(
        &self,
        path: &str,
        ranges: &[(u64, usize)],
        adjust_for_latency: bool,
        upper_limit: Option<u64>,
    ) -> Result<Vec<(u64, Vec<u8>)>> {
        let ranges = if adjust_for_latency {
            sort_expand_and_combine(ranges, self.recommended_page_size(), upper_limit)
        } else {
            ranges.to_vec()
        };
        trace!(path, ranges = ranges.len(), "transport.readv");
        let file = self.open(path)?;
        let mut out = Vec::with_capacity(ranges.len());
        for (offset, length) in ranges {
            out.push((offset, self.read_range(&file, path, offset, length)?));
        }
        Ok(out)
    }

    fn read_whole(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.full_path(path)).map_err(|e| io_error(path, e))
    }

    fn file_size(&self, path: &str) -> Result<u64> {
        let meta = fs::metadata(self.full_path(path)).map_err(|e| io_error(path, e))?;
        Ok(meta.len())
    }

    fn put_bytes(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let target = self.full_path(path);
        if let Some(parent) = target.parent() {
            if parent != Path::new("") {
                fs::create_dir_all(parent).map_err(|e| io_error(path, e))?;
            }
        }
        // Publish through a rename so readers never observe a partial file.
        let tmp = target.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| io_error(path, e))?;
        fs::rename(&tmp, &target).map_err(|e| io_error(path, e))?;
        trace!(path, len = bytes.len(), "transport.put");
        Ok(())
    }
}
