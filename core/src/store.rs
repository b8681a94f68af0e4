//! Byte-addressable string storage behind the `FileStore` contract.
//!
//! The event stream and state snapshots are written through this trait so
//! that sessions can live on a local disk, in memory for tests, or on any
//! backend a deployment plugs in. Binary payloads are base64-encoded by the
//! caller; the store only ever sees strings.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

pub trait FileStore: Send + Sync {
    fn write(&self, path: &str, contents: &str) -> io::Result<()>;
    fn read(&self, path: &str) -> io::Result<String>;
    fn delete(&self, path: &str) -> io::Result<()>;
    /// All stored paths beginning with `prefix`, in lexicographic order.
    fn list(&self, prefix: &str) -> io::Result<Vec<String>>;
}

/// Store rooted at a directory on the local filesystem. Paths in the
/// namespace map directly onto files below the root.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl FileStore for LocalFileStore {
    fn write(&self, path: &str, contents: &str) -> io::Result<()> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, contents)
    }

    fn read(&self, path: &str) -> io::Result<String> {
        fs::read_to_string(self.full_path(path))
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        let full = self.full_path(path);
        if full.is_dir() {
            fs::remove_dir_all(full)
        } else {
            fs::remove_file(full)
        }
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        collect_files(&self.root, &self.root, &mut out)?;
        out.retain(|p| p.starts_with(prefix));
        out.sort();
        Ok(out)
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

/// Store backed by a map. Used by tests and headless runs that do not want
/// to touch the disk.
#[derive(Default)]
pub struct InMemoryFileStore {
    files: Mutex<BTreeMap<String, String>>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileStore for InMemoryFileStore {
    fn write(&self, path: &str, contents: &str) -> io::Result<()> {
        let mut files = lock(&self.files)?;
        files.insert(path.to_string(), contents.to_string());
        Ok(())
    }

    fn read(&self, path: &str) -> io::Result<String> {
        let files = lock(&self.files)?;
        files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        let mut files = lock(&self.files)?;
        files.remove(path);
        Ok(())
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let files = lock(&self.files)?;
        Ok(files
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> io::Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| io::Error::other("file store lock poisoned"))
}
