//! Storage media backing a block store
//!
//! A store never touches the file system directly. It asks a [`StorageMedium`]
//! for named byte streams, so the same engine runs over a directory on disk
//! ([`FileMedium`]) or over shared in-memory buffers ([`MemoryMedium`]).
//!
//! Paths are `/`-separated and relative to the medium root, e.g.
//! `Cache_images/fat`.

use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A seekable byte stream that can be resized
pub trait StoreStream: Read + Write + Seek + Send {
    /// Truncate or zero-extend the stream
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Current length in bytes
    fn len(&self) -> io::Result<u64>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl StoreStream for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

/// How a stream is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read and write, creating the stream if it is missing
    ReadWrite,
    /// Read only; the stream must exist
    ReadOnly,
}

/// Advisory exclusive lock on a medium path
///
/// The lock is released when the guard is dropped.
pub struct MediumLock {
    path: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl MediumLock {
    fn new(path: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        MediumLock {
            path: path.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for MediumLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediumLock").field("path", &self.path).finish()
    }
}

impl Drop for MediumLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Quota-aware persistent byte storage
pub trait StorageMedium: Send + Sync + fmt::Debug {
    /// Open a named stream
    fn open_stream(&self, path: &str, mode: OpenMode) -> io::Result<Box<dyn StoreStream>>;

    /// Check whether a stream exists
    fn exists(&self, path: &str) -> bool;

    /// Delete a stream; deleting a missing stream succeeds
    fn delete(&self, path: &str) -> io::Result<()>;

    /// Delete every stream under a directory prefix
    fn delete_dir(&self, dir: &str) -> io::Result<()>;

    /// List stream paths starting with `prefix`, sorted
    fn list(&self, prefix: &str) -> io::Result<Vec<String>>;

    /// Bytes still available to new data on this medium
    fn available_free_space(&self) -> io::Result<u64>;

    /// Try to take an exclusive lock; `None` if someone else holds it
    fn try_lock(&self, path: &str) -> io::Result<Option<MediumLock>>;
}

/// Medium rooted in a directory on the local file system
///
/// Free space is reported against a fixed quota, the way an isolated storage
/// area is bounded independently of the physical disk.
#[derive(Debug, Clone)]
pub struct FileMedium {
    root: PathBuf,
    quota: u64,
}

impl FileMedium {
    /// Create a medium rooted at `root`, creating the directory if needed
    pub fn new<P: AsRef<Path>>(root: P, quota: u64) -> io::Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        Ok(FileMedium {
            root: root.as_ref().to_path_buf(),
            quota,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }

    fn used_bytes(dir: &Path) -> io::Result<u64> {
        let mut total = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                total += Self::used_bytes(&entry.path())?;
            } else {
                total += meta.len();
            }
        }
        Ok(total)
    }

    fn collect(&self, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.collect(&path, out)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(name);
            }
        }
        Ok(())
    }
}

impl StorageMedium for FileMedium {
    fn open_stream(&self, path: &str, mode: OpenMode) -> io::Result<Box<dyn StoreStream>> {
        let full = self.resolve(path);
        let file = match mode {
            OpenMode::ReadWrite => {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)?;
                }
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&full)?
            }
            OpenMode::ReadOnly => OpenOptions::new().read(true).open(&full)?,
        };
        Ok(Box::new(file))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        match fs::remove_file(self.resolve(path)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn delete_dir(&self, dir: &str) -> io::Result<()> {
        match fs::remove_dir_all(self.resolve(dir)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        self.collect(&self.root, &mut names)?;
        names.retain(|name| name.starts_with(prefix));
        names.sort();
        Ok(names)
    }

    fn available_free_space(&self) -> io::Result<u64> {
        Ok(self.quota.saturating_sub(Self::used_bytes(&self.root)?))
    }

    /// Lock through an OS advisory lock on the lock file
    ///
    /// The OS drops the lock when its holder exits, so a lock file left by a
    /// crashed owner does not keep the store read-only. The file itself stays
    /// behind and records the PID of the current owner.
    fn try_lock(&self, path: &str) -> io::Result<Option<MediumLock>> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&full)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        }

        // A clean release empties the file
        let mut previous = Vec::new();
        file.read_to_end(&mut previous)?;
        let previous = String::from_utf8_lossy(&previous);
        if !previous.trim().is_empty() {
            tracing::warn!(
                "Taking over stale lock {:?} left by process {}",
                full,
                previous.trim()
            );
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Some(MediumLock::new(path, move || {
            if let Err(e) = file.set_len(0) {
                tracing::warn!("Failed to clear lock file {:?}: {}", full, e);
            }
            if let Err(e) = FileExt::unlock(&file) {
                tracing::warn!("Failed to unlock {:?}: {}", full, e);
            }
        })))
    }
}

/// Byte accounting shared by every stream of a [`MemoryMedium`]
#[derive(Debug, Default)]
struct MemoryUsage {
    capacity: Option<u64>,
    used: AtomicU64,
}

impl MemoryUsage {
    fn grow(&self, delta: u64) -> io::Result<()> {
        let capacity = match self.capacity {
            Some(capacity) => capacity,
            None => {
                self.used.fetch_add(delta, Ordering::SeqCst);
                return Ok(());
            }
        };

        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(delta).filter(|&total| total <= capacity)
            })
            .map(|_| ())
            .map_err(|used| {
                io::Error::new(
                    io::ErrorKind::Other,
                    format!(
                        "medium full: {} bytes used, {} more requested, capacity {}",
                        used, delta, capacity
                    ),
                )
            })
    }

    fn shrink(&self, delta: u64) {
        // Never underflows: every byte released was accounted by grow
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(delta))
            });
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<String, Arc<Mutex<Vec<u8>>>>,
    locks: HashSet<String>,
}

/// In-memory medium
///
/// Streams share their buffers with the medium, so reopening a store on the
/// same `MemoryMedium` (or a clone of it) sees previously written bytes.
#[derive(Debug, Clone, Default)]
pub struct MemoryMedium {
    state: Arc<Mutex<MemoryState>>,
    usage: Arc<MemoryUsage>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryMedium {
    /// Unbounded in-memory medium
    pub fn new() -> Self {
        Self::default()
    }

    /// In-memory medium that refuses to hold more than `capacity` bytes
    pub fn with_capacity(capacity: u64) -> Self {
        MemoryMedium {
            usage: Arc::new(MemoryUsage {
                capacity: Some(capacity),
                used: AtomicU64::new(0),
            }),
            ..Self::default()
        }
    }

    /// Make every subsequent `open_stream` fail, as if the medium went away
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Copy of a stream's current bytes
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state.files.get(path).map(|data| data.lock().clone())
    }

    /// Total bytes held across all streams
    pub fn used_bytes(&self) -> u64 {
        self.usage.used.load(Ordering::SeqCst)
    }
}

impl StorageMedium for MemoryMedium {
    fn open_stream(&self, path: &str, mode: OpenMode) -> io::Result<Box<dyn StoreStream>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "memory medium is unavailable",
            ));
        }

        let mut state = self.state.lock();
        let data = match (state.files.get(path), mode) {
            (Some(data), _) => data.clone(),
            (None, OpenMode::ReadWrite) => {
                let data = Arc::new(Mutex::new(Vec::new()));
                state.files.insert(path.to_string(), data.clone());
                data
            }
            (None, OpenMode::ReadOnly) => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no such stream: {}", path),
                ))
            }
        };

        Ok(Box::new(MemoryStream {
            data,
            position: 0,
            writable: mode == OpenMode::ReadWrite,
            usage: self.usage.clone(),
        }))
    }

    fn exists(&self, path: &str) -> bool {
        self.state.lock().files.contains_key(path)
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        if let Some(data) = self.state.lock().files.remove(path) {
            self.usage.shrink(data.lock().len() as u64);
        }
        Ok(())
    }

    fn delete_dir(&self, dir: &str) -> io::Result<()> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut state = self.state.lock();
        let doomed: Vec<String> = state
            .files
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect();
        for name in doomed {
            if let Some(data) = state.files.remove(&name) {
                self.usage.shrink(data.lock().len() as u64);
            }
        }
        Ok(())
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .files
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn available_free_space(&self) -> io::Result<u64> {
        Ok(match self.usage.capacity {
            Some(capacity) => capacity.saturating_sub(self.used_bytes()),
            None => u64::MAX,
        })
    }

    fn try_lock(&self, path: &str) -> io::Result<Option<MediumLock>> {
        let mut state = self.state.lock();
        if !state.locks.insert(path.to_string()) {
            return Ok(None);
        }

        let shared = self.state.clone();
        let owned = path.to_string();
        Ok(Some(MediumLock::new(path, move || {
            shared.lock().locks.remove(&owned);
        })))
    }
}

/// Stream over a shared in-memory buffer
struct MemoryStream {
    data: Arc<Mutex<Vec<u8>>>,
    position: u64,
    writable: bool,
    usage: Arc<MemoryUsage>,
}

impl MemoryStream {
    fn check_writable(&self) -> io::Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "stream opened read-only",
            ))
        }
    }

    fn resize(&self, data: &mut Vec<u8>, len: u64) -> io::Result<()> {
        let current = data.len() as u64;
        if len > current {
            self.usage.grow(len - current)?;
        } else {
            self.usage.shrink(current - len);
        }
        data.resize(len as usize, 0);
        Ok(())
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.lock();
        let start = (self.position as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_writable()?;
        let data = self.data.clone();
        let mut data = data.lock();
        let end = self.position + buf.len() as u64;
        if end > data.len() as u64 {
            self.resize(&mut data, end)?;
        }
        let start = self.position as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        self.position = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.lock().len() as i64;
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset as i64),
            SeekFrom::End(delta) => len.checked_add(delta),
            SeekFrom::Current(delta) => (self.position as i64).checked_add(delta),
        };

        match target {
            Some(target) if target >= 0 => {
                self.position = target as u64;
                Ok(self.position)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            )),
        }
    }
}

impl StoreStream for MemoryStream {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.check_writable()?;
        let data = self.data.clone();
        let mut data = data.lock();
        self.resize(&mut data, len)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.lock().len() as u64)
    }
}
