//! DNS answer cache with capture timestamps.
//!
//! Entries are keyed by (query name, query type) and remember when they were
//! captured; staleness is judged by the caller. An optional directory store
//! keeps one file per entry so answers survive restarts. File writes are not
//! transactional: a torn file simply fails to parse later and is treated as
//! a miss by the reader.

use rustc_hash::FxHashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use tracing::{debug, warn};

pub const DEFAULT_MAX_ENTRIES: usize = 4096;
pub const DEFAULT_DISK_BUDGET: u64 = 50 * 1024 * 1024;

#[derive(Clone)]
struct CacheEntry {
    response: Vec<u8>,
    captured_at: SystemTime,
}

/// A cached answer together with its capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAnswer {
    pub response: Vec<u8>,
    pub captured_at: SystemTime,
}

/// DNS answer cache.
///
/// Uses a 2-level map (qtype -> name -> entry) so lookups borrow the name
/// instead of allocating a key.
pub struct AnswerCache {
    entries: RwLock<FxHashMap<u16, FxHashMap<String, CacheEntry>>>,
    max_entries: usize,
    disk: Option<DiskStore>,
}

impl AnswerCache {
    /// Memory-only cache holding at most `max_entries` answers.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            max_entries: max_entries.max(1),
            disk: None,
        }
    }

    /// Cache backed by one file per entry under `dir`.
    pub fn with_disk(max_entries: usize, dir: impl Into<PathBuf>, budget_bytes: u64) -> Self {
        Self {
            disk: Some(DiskStore::new(dir, budget_bytes)),
            ..Self::new(max_entries)
        }
    }

    /// Look up an answer, falling back to the disk store on a memory miss.
    pub fn get(&self, name: &str, qtype: u16) -> Option<StoredAnswer> {
        {
            let Ok(entries) = self.entries.read() else {
                return None;
            };
            if let Some(entry) = entries.get(&qtype).and_then(|inner| inner.get(name)) {
                return Some(StoredAnswer {
                    response: entry.response.clone(),
                    captured_at: entry.captured_at,
                });
            }
        }

        let stored = self.disk.as_ref()?.read(name, qtype)?;
        self.insert_memory(name, qtype, stored.response.clone(), stored.captured_at);
        Some(stored)
    }

    /// Store or overwrite an answer captured at `captured_at`.
    pub fn put(&self, name: &str, qtype: u16, response: &[u8], captured_at: SystemTime) {
        self.insert_memory(name, qtype, response.to_vec(), captured_at);

        if let Some(disk) = &self.disk {
            if let Err(e) = disk.write(name, qtype, response) {
                warn!(name, qtype, error = %e, "failed to persist DNS answer");
            }
        }
    }

    /// Forget an entry held in memory.
    pub fn remove(&self, name: &str, qtype: u16) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        if let Some(inner) = entries.get_mut(&qtype) {
            inner.remove(name);
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .map(|e| e.values().map(|inner| inner.len()).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn disk(&self) -> Option<&DiskStore> {
        self.disk.as_ref()
    }

    fn insert_memory(&self, name: &str, qtype: u16, response: Vec<u8>, captured_at: SystemTime) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };

        entries.entry(qtype).or_default().insert(
            name.to_string(),
            CacheEntry {
                response,
                captured_at,
            },
        );

        let total: usize = entries.values().map(|inner| inner.len()).sum();
        if total > self.max_entries {
            evict_older_half(&mut entries, total);
        }
    }
}

impl Default for AnswerCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

/// Drop the older half of all entries by capture time.
fn evict_older_half(entries: &mut FxHashMap<u16, FxHashMap<String, CacheEntry>>, total: usize) {
    let mut stamps: Vec<SystemTime> = entries
        .values()
        .flat_map(|inner| inner.values().map(|e| e.captured_at))
        .collect();
    stamps.sort_unstable();

    let drop_count = total / 2;
    let cutoff = stamps[drop_count.saturating_sub(1)];
    let mut dropped = 0;

    for inner in entries.values_mut() {
        inner.retain(|_, e| {
            if dropped < drop_count && e.captured_at <= cutoff {
                dropped += 1;
                false
            } else {
                true
            }
        });
    }
    entries.retain(|_, inner| !inner.is_empty());
    debug!(dropped, remaining = total - dropped, "evicted DNS answers");
}

/// One-file-per-entry answer store.
///
/// File modification time doubles as the capture time.
pub struct DiskStore {
    dir: PathBuf,
    budget_bytes: u64,
}

impl DiskStore {
    pub fn new(dir: impl Into<PathBuf>, budget_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            budget_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str, qtype: u16) -> PathBuf {
        let safe: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}_{qtype}.d"))
    }

    fn read(&self, name: &str, qtype: u16) -> Option<StoredAnswer> {
        let path = self.path_for(name, qtype);
        let response = fs::read(&path).ok()?;
        let captured_at = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
        Some(StoredAnswer {
            response,
            captured_at,
        })
    }

    fn write(&self, name: &str, qtype: u16, response: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path_for(name, qtype), response)
    }

    /// Total size of the stored files in bytes.
    pub fn size(&self) -> io::Result<u64> {
        let mut size = 0;
        for entry in fs::read_dir(&self.dir)? {
            let meta = entry?.metadata()?;
            if meta.is_file() {
                size += meta.len();
            }
        }
        Ok(size)
    }

    /// Delete the oldest half of the files (by mtime) when the directory
    /// exceeds its byte budget. Returns how many files were removed.
    pub fn prune(&self) -> io::Result<usize> {
        if !self.dir.exists() || self.size()? <= self.budget_bytes {
            return Ok(0);
        }

        let mut files: Vec<(SystemTime, PathBuf)> = fs::read_dir(&self.dir)?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let meta = entry.metadata().ok()?;
                meta.is_file().then(|| (meta.modified().unwrap_or(SystemTime::UNIX_EPOCH), entry.path()))
            })
            .collect();
        files.sort_by_key(|(modified, _)| *modified);

        let mut removed = 0;
        for (_, path) in files.iter().take(files.len() / 2) {
            match fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to prune cache file"),
            }
        }
        debug!(removed, dir = %self.dir.display(), "pruned DNS cache directory");
        Ok(removed)
    }

    /// Remove the whole directory.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn put_then_get_returns_capture_time() {
        let cache = AnswerCache::new(16);
        cache.put("example.com", 1, b"answer", at(100));

        let stored = cache.get("example.com", 1).unwrap();
        assert_eq!(stored.response, b"answer");
        assert_eq!(stored.captured_at, at(100));
        assert!(cache.get("example.com", 28).is_none());
    }

    #[test]
    fn put_overwrites_existing_entry() {
        let cache = AnswerCache::new(16);
        cache.put("example.com", 1, b"old", at(1));
        cache.put("example.com", 1, b"new", at(2));

        assert_eq!(cache.get("example.com", 1).unwrap().response, b"new");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn overflow_discards_older_half() {
        let cache = AnswerCache::new(4);
        for i in 0..5u64 {
            cache.put(&format!("host{i}.com"), 1, b"a", at(i));
        }

        assert_eq!(cache.len(), 3);
        assert!(cache.get("host0.com", 1).is_none());
        assert!(cache.get("host1.com", 1).is_none());
        assert!(cache.get("host4.com", 1).is_some());
    }

    #[test]
    fn disk_store_survives_new_cache() {
        let dir = tempfile::tempdir().unwrap();
        let first = AnswerCache::with_disk(16, dir.path(), DEFAULT_DISK_BUDGET);
        first.put("example.com", 1, b"persisted", SystemTime::now());

        let second = AnswerCache::with_disk(16, dir.path(), DEFAULT_DISK_BUDGET);
        let stored = second.get("example.com", 1).unwrap();
        assert_eq!(stored.response, b"persisted");
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn disk_names_are_sanitized() {
        let store = DiskStore::new("/tmp/cache", 0);

        assert_eq!(
            store.path_for("../etc/passwd", 1),
            PathBuf::from("/tmp/cache/.._etc_passwd_1.d")
        );
    }

    #[test]
    fn prune_removes_oldest_half_over_budget() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path(), 10);
        for i in 0..4 {
            store.write(&format!("host{i}.com"), 1, &[0u8; 8]).unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(store.prune().unwrap(), 2);
        assert!(store.read("host0.com", 1).is_none());
        assert!(store.read("host3.com", 1).is_some());
    }

    #[test]
    fn prune_under_budget_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path(), 1024);
        store.write("a.com", 1, b"x").unwrap();

        assert_eq!(store.prune().unwrap(), 0);
        assert!(store.read("a.com", 1).is_some());
    }

    #[test]
    fn clear_missing_directory_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path().join("absent"), 0);

        assert!(store.clear().is_ok());
    }
}
