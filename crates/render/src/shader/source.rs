//! Where shader text comes from.
//!
//! Providers only need to read a source and ask for a cheap revision
//! marker; resolving identifiers to bytes belongs to the embedding
//! application.

use super::SourceId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait ShaderSource {
    fn read(&self, id: &SourceId) -> io::Result<String>;

    /// Marker that changes whenever the content may have changed.
    fn revision(&self, id: &SourceId) -> io::Result<u64>;
}

/// Files modified this recently may still change without their mtime
/// moving, on filesystems with coarse timestamps.
const SETTLE_WINDOW: Duration = Duration::from_secs(2);

/// Sources on disk, resolved against a root directory.
///
/// The revision combines mtime and length. While a file is inside the
/// settle window its revision changes on every call, so providers reread
/// it and fall back to comparing content.
#[derive(Debug, Clone)]
pub struct FileSource {
    root: PathBuf,
    unsettled_reads: Arc<AtomicU64>,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            unsettled_reads: Arc::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, id: &SourceId) -> PathBuf {
        self.root.join(id.as_str())
    }
}

impl ShaderSource for FileSource {
    fn read(&self, id: &SourceId) -> io::Result<String> {
        std::fs::read_to_string(self.path_of(id))
    }

    fn revision(&self, id: &SourceId) -> io::Result<u64> {
        let meta = std::fs::metadata(self.path_of(id))?;
        let modified = meta.modified()?;
        let nanos = modified
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());

        let mut hasher = DefaultHasher::new();
        (nanos, meta.len()).hash(&mut hasher);
        let settled = SystemTime::now()
            .duration_since(modified)
            .is_ok_and(|age| age >= SETTLE_WINDOW);
        if !settled {
            self.unsettled_reads
                .fetch_add(1, Ordering::Relaxed)
                .hash(&mut hasher);
        }
        Ok(hasher.finish())
    }
}

#[derive(Debug, Default)]
struct MemoryFiles {
    files: HashMap<SourceId, (String, u64)>,
    counter: u64,
}

/// In-memory sources. Clones share the same file table, so a caller can keep
/// a handle and edit sources after giving one to a provider.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    inner: Arc<RwLock<MemoryFiles>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a source; every call bumps its revision.
    pub fn set(&self, id: impl AsRef<str>, text: impl Into<String>) {
        let mut inner = self.inner.write();
        inner.counter += 1;
        let revision = inner.counter;
        inner.files.insert(SourceId::new(id), (text.into(), revision));
    }

    pub fn remove(&self, id: impl AsRef<str>) -> bool {
        self.inner.write().files.remove(&SourceId::new(id)).is_some()
    }

    pub fn with(self, id: impl AsRef<str>, text: impl Into<String>) -> Self {
        self.set(id, text);
        self
    }
}

fn not_found(id: &SourceId) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no source named '{id}'"))
}

impl ShaderSource for MemorySource {
    fn read(&self, id: &SourceId) -> io::Result<String> {
        self.inner
            .read()
            .files
            .get(id)
            .map(|(text, _)| text.clone())
            .ok_or_else(|| not_found(id))
    }

    fn revision(&self, id: &SourceId) -> io::Result<u64> {
        self.inner
            .read()
            .files
            .get(id)
            .map(|(_, rev)| *rev)
            .ok_or_else(|| not_found(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_revision_bumps_on_set() {
        let src = MemorySource::new().with("a.wgsl", "one");
        let id = SourceId::new("a.wgsl");
        let r1 = src.revision(&id).unwrap();
        src.set("a.wgsl", "one");
        assert_ne!(src.revision(&id).unwrap(), r1);
        assert_eq!(src.read(&id).unwrap(), "one");
    }

    #[test]
    fn memory_source_clones_share_files() {
        let src = MemorySource::new();
        let handle = src.clone();
        handle.set("./x.wgsl", "text");
        assert_eq!(src.read(&SourceId::new("x.wgsl")).unwrap(), "text");
        assert!(handle.remove("x.wgsl"));
        assert_eq!(
            src.read(&SourceId::new("x.wgsl")).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn file_source_reads_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/a.wgsl"), "fn a() {}").unwrap();
        let src = FileSource::new(dir.path());
        let id = SourceId::new("lib/a.wgsl");
        assert_eq!(src.read(&id).unwrap(), "fn a() {}");
        assert!(src.revision(&id).is_ok());
        assert!(src.read(&SourceId::new("missing.wgsl")).is_err());
    }

    #[test]
    fn freshly_written_file_revision_never_repeats() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.wgsl"), "aaaa").unwrap();
        let src = FileSource::new(dir.path());
        let id = SourceId::new("a.wgsl");
        let first = src.revision(&id).unwrap();
        // Same length, likely the same mtime tick.
        std::fs::write(dir.path().join("a.wgsl"), "bbbb").unwrap();
        assert_ne!(src.revision(&id).unwrap(), first);
    }

    #[test]
    fn settled_file_revision_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.wgsl");
        std::fs::write(&path, "fn old() {}").unwrap();
        let past = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(past)
            .unwrap();
        let src = FileSource::new(dir.path());
        let id = SourceId::new("old.wgsl");
        assert_eq!(src.revision(&id).unwrap(), src.revision(&id).unwrap());
    }
}
