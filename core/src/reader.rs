//! Random-access byte reading, with a bounded page cache and transparent
//! decompression layered on top.
//!
//! Every higher-level component (the ELF object model, DWARF sections, the
//! process address space) reads bytes through the [`Reader`] trait rather
//! than holding a raw slice or file handle directly, so the same code path
//! serves a memory-mapped executable, a `/proc/<pid>/mem` live process, and a
//! zlib-compressed debug section identically.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::ReaderError;

/// A source of bytes addressable by absolute offset.
///
/// Implementors need not be contiguous in memory (a process address space
/// backed by several `PT_LOAD` segments is not), but every offset in
/// `[0, len())` must be independently readable without requiring reads to
/// happen in order.
pub trait Reader: fmt::Debug {
    /// Total number of addressable bytes.
    fn len(&self) -> u64;

    /// Returns `true` if this reader has no addressable bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually read. Short reads are only permitted at the
    /// end of the addressable range.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ReaderError>;

    /// A short, human-readable identifier for error messages and logging,
    /// such as a file path or `"pid 1234"`.
    fn describe(&self) -> String;

    /// Reads exactly `buf.len()` bytes, failing if fewer are available.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), ReaderError> {
        let n = self.read_at(offset, buf)?;
        if n != buf.len() {
            return Err(ReaderError::OutOfBounds {
                offset,
                len: buf.len() as u64,
                available: n as u64,
            });
        }
        Ok(())
    }

    /// Reads a `Pod`-like fixed-size value at `offset` using the given byte
    /// order.
    fn read_u32_at(&self, offset: u64, little_endian: bool) -> Result<u32, ReaderError> {
        let mut buf = [0u8; 4];
        self.read_exact_at(offset, &mut buf)?;
        Ok(if little_endian {
            u32::from_le_bytes(buf)
        } else {
            u32::from_be_bytes(buf)
        })
    }

    /// Reads a NUL-terminated string starting at `offset`, bounded by
    /// `max_len` bytes.
    fn read_cstr_at(&self, offset: u64, max_len: usize) -> Result<String, ReaderError> {
        let mut buf = vec![0u8; max_len];
        let n = self.read_at(offset, &mut buf)?;
        buf.truncate(n);
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        buf.truncate(end);
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Reads the entire contents into a `Vec`. Used for small sections where
    /// random access is unnecessary once loaded (e.g. `.debug_abbrev`).
    fn read_all(&self) -> Result<Vec<u8>, ReaderError> {
        let len = self.len();
        let mut buf = vec![0u8; len as usize];
        self.read_exact_at(0, &mut buf)?;
        Ok(buf)
    }
}

/// A reader backed by a plain in-memory byte slice.
///
/// Used for tests and for sections that have already been decompressed or
/// otherwise materialized into owned memory.
#[derive(Clone)]
pub struct SliceReader {
    data: std::sync::Arc<[u8]>,
    label: String,
}

impl SliceReader {
    /// Wraps an owned byte buffer.
    pub fn new(data: Vec<u8>, label: impl Into<String>) -> Self {
        SliceReader {
            data: data.into(),
            label: label.into(),
        }
    }
}

impl fmt::Debug for SliceReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceReader")
            .field("label", &self.label)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Reader for SliceReader {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ReaderError> {
        let offset = offset as usize;
        if offset > self.data.len() {
            return Ok(0);
        }
        let available = &self.data[offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// A reader backed by an open file, read via positioned reads.
///
/// This does not memory-map the file; `elfstack-core` favors `pread`-style
/// positioned reads here because core files can be many gigabytes and the
/// caching reader above it already bounds how much ever lands in memory at
/// once. Callers that want to read a modestly sized executable in one shot
/// can wrap its bytes in a [`SliceReader`] instead.
pub struct FileReader {
    file: Mutex<File>,
    len: u64,
    path: PathBuf,
}

impl FileReader {
    /// Opens `path` for positioned reads.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReaderError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| ReaderError::Io(path.display().to_string(), e))?;
        let len = file
            .metadata()
            .map_err(|e| ReaderError::Io(path.display().to_string(), e))?
            .len();
        Ok(FileReader {
            file: Mutex::new(file),
            len,
            path,
        })
    }
}

impl fmt::Debug for FileReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileReader")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

impl Reader for FileReader {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ReaderError> {
        if offset >= self.len {
            return Ok(0);
        }
        let mut file = self.file.lock().expect("file reader mutex poisoned");
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| ReaderError::Io(self.path.display().to_string(), e))?;
        let max = (self.len - offset).min(buf.len() as u64) as usize;
        let mut read = 0;
        while read < max {
            match file.read(&mut buf[read..max]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReaderError::Io(self.path.display().to_string(), e)),
            }
        }
        Ok(read)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

const PAGE_SIZE: usize = 4096;
const DEFAULT_CACHE_PAGES: usize = 256;

struct Page {
    offset: u64,
    data: Vec<u8>,
}

/// Wraps a [`Reader`] with a bounded LRU page cache.
///
/// Every read is rounded out to whole `PAGE_SIZE` pages, which turns the
/// byte-at-a-time access patterns of DIE/CFI walking into a bounded number
/// of underlying reads regardless of how many fields get pulled out of the
/// same neighborhood of the file. The cache holds at most
/// `DEFAULT_CACHE_PAGES` pages (1 MiB by default); the oldest page is
/// evicted once that bound is hit.
pub struct CachingReader<R> {
    inner: R,
    cache: Mutex<Vec<Page>>,
    capacity: usize,
}

impl<R: Reader> CachingReader<R> {
    /// Wraps `inner` with the default cache size (1 MiB across 256 pages).
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_CACHE_PAGES)
    }

    /// Wraps `inner` with a cache of at most `capacity` pages.
    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        CachingReader {
            inner,
            cache: Mutex::new(Vec::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    fn page_at(&self, page_offset: u64) -> Result<Vec<u8>, ReaderError> {
        {
            let cache = self.cache.lock().expect("cache mutex poisoned");
            if let Some(page) = cache.iter().find(|p| p.offset == page_offset) {
                return Ok(page.data.clone());
            }
        }

        let mut buf = vec![0u8; PAGE_SIZE];
        let n = self.inner.read_at(page_offset, &mut buf)?;
        buf.truncate(n);

        let mut cache = self.cache.lock().expect("cache mutex poisoned");
        if cache.len() >= self.capacity {
            cache.remove(0);
        }
        cache.push(Page {
            offset: page_offset,
            data: buf.clone(),
        });
        Ok(buf)
    }
}

impl<R: fmt::Debug> fmt::Debug for CachingReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingReader").field("inner", &self.inner).finish()
    }
}

impl<R: Reader> Reader for CachingReader<R> {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ReaderError> {
        let mut total = 0;
        while total < buf.len() {
            let cur = offset + total as u64;
            let page_offset = cur - (cur % PAGE_SIZE as u64);
            let page = self.page_at(page_offset)?;
            let page_rel = (cur - page_offset) as usize;
            if page_rel >= page.len() {
                break;
            }
            let avail = &page[page_rel..];
            let want = (buf.len() - total).min(avail.len());
            buf[total..total + want].copy_from_slice(&avail[..want]);
            total += want;
            if avail.len() < PAGE_SIZE - page_rel {
                // Short page read: end of underlying data.
                break;
            }
        }
        Ok(total)
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

/// Inflates a zlib-compressed (`SHF_COMPRESSED`/`ELFCOMPRESS_ZLIB`, or
/// legacy `ZLIB\0` + big-endian size header) section into owned bytes.
pub fn decompress_zlib(compressed: &[u8], expected_size: u64) -> Result<Vec<u8>, ReaderError> {
    use flate2::read::ZlibDecoder;

    let mut out = Vec::with_capacity(expected_size as usize);
    let mut decoder = ZlibDecoder::new(compressed);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ReaderError::Decompress(e.to_string()))?;
    Ok(out)
}

/// Inflates an xz-compressed section (as emitted by some `.gnu_debugdata`
/// payloads) into owned bytes. Gated behind the `xz` feature, matching the
/// optional-compression-backend pattern `flate2` itself uses upstream.
#[cfg(feature = "xz")]
pub fn decompress_xz(compressed: &[u8]) -> Result<Vec<u8>, ReaderError> {
    use std::io::Read as _;
    let mut out = Vec::new();
    xz2::read::XzDecoder::new(compressed)
        .read_to_end(&mut out)
        .map_err(|e| ReaderError::Decompress(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn slice_reader_reads_within_bounds() {
        let reader = SliceReader::new(b"hello world".to_vec(), "test");
        let mut buf = [0u8; 5];
        assert_eq!(reader.read_at(6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn slice_reader_short_read_at_end() {
        let reader = SliceReader::new(b"hi".to_vec(), "test");
        let mut buf = [0u8; 10];
        assert_eq!(reader.read_at(0, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
    }

    #[test]
    fn read_exact_at_fails_on_truncation() {
        let reader = SliceReader::new(b"hi".to_vec(), "test");
        let mut buf = [0u8; 10];
        assert!(reader.read_exact_at(0, &mut buf).is_err());
    }

    #[test]
    fn caching_reader_spans_page_boundary() {
        let mut data = vec![0u8; PAGE_SIZE + 100];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let cached = CachingReader::new(SliceReader::new(data.clone(), "test"));

        let mut buf = vec![0u8; 200];
        cached
            .read_exact_at(PAGE_SIZE as u64 - 100, &mut buf)
            .unwrap();
        assert_eq!(buf, data[PAGE_SIZE - 100..PAGE_SIZE + 100]);
    }

    #[test]
    fn caching_reader_evicts_oldest_page() {
        let data = vec![7u8; PAGE_SIZE * 4];
        let cached = CachingReader::with_capacity(SliceReader::new(data, "test"), 2);
        let mut buf = [0u8; 1];
        cached.read_exact_at(0, &mut buf).unwrap();
        cached.read_exact_at(PAGE_SIZE as u64, &mut buf).unwrap();
        cached
            .read_exact_at(PAGE_SIZE as u64 * 2, &mut buf)
            .unwrap();
        let cache = cached.cache.lock().unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.iter().all(|p| p.offset != 0));
    }

    #[test]
    fn cstr_reads_up_to_nul() {
        let reader = SliceReader::new(b"abc\0def".to_vec(), "test");
        assert_eq!(reader.read_cstr_at(0, 7).unwrap(), "abc");
    }
}
