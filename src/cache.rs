//! Persistent index cache.
//!
//! A parsed index can be serialized next to its source file (or into the
//! user cache directory) and reloaded with a zero-copy memory map, skipping
//! both passes entirely when the source is unchanged. Freshness is judged
//! by the source's `(mtime, size)` pair; content is never inspected.
//!
//! ## On-disk format (version 3, little-endian)
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0      | 1    | version byte (3) |
//! | 1      | 7    | pad |
//! | 8      | 8    | source mtime, seconds since the Unix epoch |
//! | 16     | 8    | source size in bytes |
//! | 24     | 8    | columns |
//! | 32     | 2    | worker count |
//! | 34     | 6    | pad |
//! | 40     | 8*n  | per-worker separator counts |
//! | ...    | 8*total | flat, file-order separator positions |
//!
//! Every integer array sits on an 8-byte boundary so the loader can point
//! slices straight into the map.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use thiserror::Error;
use tracing::{debug, warn};

use crate::buffer::PaddedBuffer;
use crate::index::IndexStore;
use crate::orchestrator::{ParseOptions, ParseOutcome, Parser};

/// Extension of cache files.
pub const CACHE_EXTENSION: &str = "vidx";

const FORMAT_VERSION: u8 = 3;
const HEADER_SIZE: usize = 40;

/// Freshness token of a source file. Never interpreted as content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMetadata {
    /// Modification time in seconds since the Unix epoch.
    pub mtime: u64,
    /// File size in bytes.
    pub size: u64,
}

impl SourceMetadata {
    /// Stat `path` and capture its freshness token.
    pub fn for_path<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(Self {
            mtime,
            size: meta.len(),
        })
    }
}

/// Failure modes of cache reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache file is corrupted")]
    Corrupted,
    #[error("permission denied")]
    PermissionDenied,
    #[error("disk full")]
    DiskFull,
    #[error("cache file has an unsupported format version")]
    VersionMismatch,
    #[error("source file has changed since the cache was written")]
    SourceChanged,
    #[error("I/O error")]
    IoError,
    #[error("cache file not found")]
    NotFound,
}

fn classify_io(e: &io::Error) -> CacheError {
    const ENOSPC: i32 = 28;
    match e.kind() {
        io::ErrorKind::NotFound => CacheError::NotFound,
        io::ErrorKind::PermissionDenied => CacheError::PermissionDenied,
        _ if e.raw_os_error() == Some(ENOSPC) => CacheError::DiskFull,
        _ => CacheError::IoError,
    }
}

/// Where cache files live.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CacheLocation {
    /// `<source>.vidx` next to the source; falls back to the user cache
    /// directory when the source directory is not writable.
    #[default]
    SameDir,
    /// `<user_cache_dir>/csvidx/<hash>.vidx`.
    UserCache,
    /// `<dir>/<filename>.vidx`.
    Custom(PathBuf),
}

/// Cache behavior knobs.
pub struct CacheOptions<'a> {
    pub location: CacheLocation,
    /// Resolve symlinks before hashing, so the same underlying file reached
    /// through different paths shares one cache entry.
    pub resolve_symlinks: bool,
    /// Invoked when the configured location is unusable and a fallback (or
    /// silent disable) kicks in.
    pub warning: Option<&'a dyn Fn(&str)>,
}

impl Default for CacheOptions<'_> {
    fn default() -> Self {
        Self {
            location: CacheLocation::SameDir,
            resolve_symlinks: true,
            warning: None,
        }
    }
}

impl CacheOptions<'_> {
    fn warn_cb(&self, message: &str) {
        warn!("{message}");
        if let Some(cb) = self.warning {
            cb(message);
        }
    }
}

/// FNV-1a over the path bytes, rendered as 16 hex digits.
fn hash_path(path: &Path) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for &b in path.to_string_lossy().as_bytes() {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:016x}")
}

fn resolved_source(source: &Path, options: &CacheOptions) -> PathBuf {
    if options.resolve_symlinks {
        fs::canonicalize(source).unwrap_or_else(|_| source.to_path_buf())
    } else {
        source.to_path_buf()
    }
}

/// The per-user cache directory for this crate, created on demand.
/// `XDG_CACHE_HOME`, then `HOME/.cache`, then `USERPROFILE/.cache`.
fn user_cache_dir() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache")))
        .or_else(|| std::env::var_os("USERPROFILE").map(|h| PathBuf::from(h).join(".cache")))?;
    let dir = base.join("csvidx");
    fs::create_dir_all(&dir).ok()?;
    Some(dir)
}

fn user_cache_path(source: &Path, options: &CacheOptions) -> Option<PathBuf> {
    let dir = user_cache_dir()?;
    let resolved = resolved_source(source, options);
    Some(dir.join(format!("{}.{CACHE_EXTENSION}", hash_path(&resolved))))
}

fn with_vidx_extension(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(CACHE_EXTENSION);
    path.with_file_name(name)
}

/// Resolve the cache path for `source` under the configured location,
/// without probing writability.
pub fn cache_path(source: &Path, options: &CacheOptions) -> Option<PathBuf> {
    match &options.location {
        CacheLocation::SameDir => Some(with_vidx_extension(source)),
        CacheLocation::UserCache => user_cache_path(source, options),
        CacheLocation::Custom(dir) => {
            let resolved = resolved_source(source, options);
            let name = resolved.file_name()?;
            let mut file = name.to_os_string();
            file.push(".");
            file.push(CACHE_EXTENSION);
            Some(dir.join(file))
        }
    }
}

/// Serializes an index (plus its source freshness token) into the v3
/// format. Reads the index through its shared surface only.
pub struct CacheWriter<'a> {
    index: &'a IndexStore,
    meta: SourceMetadata,
}

impl<'a> CacheWriter<'a> {
    pub fn new(index: &'a IndexStore, meta: SourceMetadata) -> Self {
        Self { index, meta }
    }

    /// Write to `<path>.tmp`, then rename into place. The tmp file is
    /// removed on any failure.
    pub fn write_to(&self, path: &Path) -> Result<(), CacheError> {
        let tmp = path.with_extension(format!("{CACHE_EXTENSION}.tmp"));
        let result = self.write_tmp(&tmp).and_then(|()| {
            fs::rename(&tmp, path).map_err(|e| classify_io(&e))
        });
        if result.is_err() {
            fs::remove_file(&tmp).ok();
        }
        result
    }

    fn write_tmp(&self, tmp: &Path) -> Result<(), CacheError> {
        let file = fs::File::create(tmp).map_err(|e| classify_io(&e))?;
        let mut out = io::BufWriter::new(file);
        self.write_stream(&mut out).map_err(|e| classify_io(&e))?;
        out.flush().map_err(|e| classify_io(&e))
    }

    fn write_stream<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let n_threads = self.index.n_threads();

        let mut header = [0u8; HEADER_SIZE];
        header[0] = FORMAT_VERSION;
        header[8..16].copy_from_slice(&self.meta.mtime.to_le_bytes());
        header[16..24].copy_from_slice(&self.meta.size.to_le_bytes());
        header[24..32].copy_from_slice(&self.index.columns().to_le_bytes());
        header[32..34].copy_from_slice(&n_threads.to_le_bytes());
        out.write_all(&header)?;

        for t in 0..usize::from(n_threads) {
            out.write_all(&self.index.count(t).to_le_bytes())?;
        }
        // Linearize: slabs are already sorted and ordered by chunk start, so
        // concatenation is the flat file-order layout.
        for t in 0..usize::from(n_threads) {
            for &pos in self.index.thread_data(t) {
                out.write_all(&pos.to_le_bytes())?;
            }
        }
        Ok(())
    }
}

/// Load an index from `cache_path`, validating it against the source's
/// freshness token. On success the returned store borrows the mapped file
/// and releases it on drop.
pub fn load_from(cache_path: &Path, meta: SourceMetadata) -> Result<IndexStore, CacheError> {
    let size = match fs::metadata(cache_path) {
        Ok(m) => m.len() as usize,
        Err(e) => return Err(classify_io(&e)),
    };
    if size < HEADER_SIZE {
        discard_corrupted(cache_path);
        return Err(CacheError::Corrupted);
    }

    let file = fs::File::open(cache_path).map_err(|e| classify_io(&e))?;
    // Read-only mapping of a regular file.
    let map = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| classify_io(&e))?;

    if map[0] != FORMAT_VERSION {
        // An unknown layout is as unusable as a truncated one; never try to
        // interpret it, never leave it behind.
        drop(map);
        discard_corrupted(cache_path);
        return Err(CacheError::VersionMismatch);
    }

    let read_u64 = |offset: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&map[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    };
    let cached_mtime = read_u64(8);
    let cached_size = read_u64(16);
    if cached_mtime != meta.mtime || cached_size != meta.size {
        // Stale, not corrupt: the next write will replace it.
        return Err(CacheError::SourceChanged);
    }

    let columns = read_u64(24);
    let n_threads = u16::from_le_bytes([map[32], map[33]]);
    if n_threads == 0 {
        discard_corrupted(cache_path);
        return Err(CacheError::Corrupted);
    }

    let counts_offset = HEADER_SIZE;
    let counts_len = 8usize * usize::from(n_threads);
    let positions_offset = match counts_offset.checked_add(counts_len) {
        Some(end) if end <= map.len() => end,
        _ => {
            discard_corrupted(cache_path);
            return Err(CacheError::Corrupted);
        }
    };

    let remaining = map.len() - positions_offset;
    let mut total: u64 = 0;
    for t in 0..usize::from(n_threads) {
        let count = read_u64(counts_offset + 8 * t);
        total = match total.checked_add(count) {
            Some(t) => t,
            None => {
                discard_corrupted(cache_path);
                return Err(CacheError::Corrupted);
            }
        };
    }
    let positions_bytes = total.checked_mul(8);
    match positions_bytes {
        Some(bytes) if bytes <= remaining as u64 => {}
        _ => {
            discard_corrupted(cache_path);
            return Err(CacheError::Corrupted);
        }
    }

    debug!(
        cache = %cache_path.display(),
        total,
        n_threads,
        "loaded index cache via mmap"
    );
    Ok(IndexStore::from_mmap(
        map,
        columns,
        n_threads,
        counts_offset,
        positions_offset,
        total,
    ))
}

fn discard_corrupted(path: &Path) {
    if fs::remove_file(path).is_ok() {
        debug!(cache = %path.display(), "removed corrupted cache file");
    }
}

/// Resolve the cache path for `source` and load it.
pub fn load(source: &Path, options: &CacheOptions) -> Result<IndexStore, CacheError> {
    let meta = SourceMetadata::for_path(source).map_err(|e| classify_io(&e))?;
    let path = cache_path(source, options).ok_or(CacheError::NotFound)?;
    load_from(&path, meta)
}

/// Write `index` to the configured location, falling back from an
/// unwritable same-directory location to the user cache. Returns the path
/// written, or `None` when caching had to be disabled.
pub fn store(
    index: &IndexStore,
    source: &Path,
    meta: SourceMetadata,
    options: &CacheOptions,
) -> Result<Option<PathBuf>, CacheError> {
    let writer = CacheWriter::new(index, meta);
    let path = match cache_path(source, options) {
        Some(path) => path,
        None => {
            options.warn_cb("no usable cache directory; caching disabled");
            return Ok(None);
        }
    };
    match writer.write_to(&path) {
        Ok(()) => Ok(Some(path)),
        Err(CacheError::PermissionDenied) if options.location == CacheLocation::SameDir => {
            let fallback = match user_cache_path(source, options) {
                Some(p) => p,
                None => {
                    options.warn_cb(
                        "source directory is not writable and no user cache directory exists; caching disabled",
                    );
                    return Ok(None);
                }
            };
            options.warn_cb(&format!(
                "source directory is not writable, falling back to {}",
                fallback.display()
            ));
            match writer.write_to(&fallback) {
                Ok(()) => Ok(Some(fallback)),
                Err(CacheError::PermissionDenied) => {
                    options.warn_cb("user cache directory is not writable; caching disabled");
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

/// A parse that may have been satisfied from the cache.
pub struct CachedParse {
    pub outcome: ParseOutcome,
    /// True when the index came from a valid cache file and no parsing ran.
    pub used_cache: bool,
    /// Where the cache lives now, if anywhere.
    pub cache_path: Option<PathBuf>,
}

/// Load the index from cache if it is fresh; otherwise parse `buf` and
/// refresh the cache.
pub fn parse_with_cache(
    source: &Path,
    buf: &PaddedBuffer,
    parser: &Parser,
    parse_options: &ParseOptions,
    cache_options: &CacheOptions,
) -> io::Result<CachedParse> {
    let meta = SourceMetadata::for_path(source)?;
    if let Some(path) = cache_path(source, cache_options) {
        if let Ok(index) = load_from(&path, meta) {
            return Ok(CachedParse {
                outcome: ParseOutcome::from_cache(index),
                used_cache: true,
                cache_path: Some(path),
            });
        }
    }

    let outcome = parser.parse(buf, parse_options);
    let mut written = None;
    if outcome.success() {
        match store(&outcome.index, source, meta, cache_options) {
            Ok(path) => written = path,
            Err(e) => debug!("cache write failed: {e}"),
        }
    }
    Ok(CachedParse {
        outcome,
        used_cache: false,
        cache_path: written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_path_stable() {
        let a = hash_path(Path::new("/tmp/data.csv"));
        let b = hash_path(Path::new("/tmp/data.csv"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, hash_path(Path::new("/tmp/other.csv")));
    }

    #[test]
    fn test_same_dir_path() {
        let opts = CacheOptions::default();
        let path = cache_path(Path::new("/data/input.csv"), &opts).unwrap();
        assert_eq!(path, PathBuf::from("/data/input.csv.vidx"));
    }

    #[test]
    fn test_custom_dir_path() {
        let opts = CacheOptions {
            location: CacheLocation::Custom(PathBuf::from("/var/cache")),
            resolve_symlinks: false,
            ..CacheOptions::default()
        };
        let path = cache_path(Path::new("/data/input.csv"), &opts).unwrap();
        assert_eq!(path, PathBuf::from("/var/cache/input.csv.vidx"));
    }
}
