//! Two-Tier Verdict Cache
//!
//! Memory tier: bounded LRU with TTL. Disk tier: append-and-compact store
//! keyed by domain, durable across restarts, eventually consistent (writes
//! flow through a bounded queue to a dedicated writer task). A disk hit
//! repopulates memory. Overwrites are monotonic: only a Reasoning verdict
//! may replace a live entry, and only when the cached source is not already
//! Reasoning.

use chrono::{DateTime, Utc};
use guardian_engine::{Source, Verdict};
use moka::sync::Cache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Memory tier TTL
pub const MEMORY_TTL: Duration = Duration::from_secs(300);
/// Disk tier TTL
pub const DISK_TTL: Duration = Duration::from_secs(3600);
/// Disk store magic
pub const DISK_MAGIC: [u8; 4] = *b"NGVC";
/// Disk store format version
pub const DISK_VERSION: u8 = 1;

const STRIPES: usize = 16;
const WRITE_QUEUE: usize = 256;

/// One cached verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cached verdict
    pub verdict: Verdict,
    /// Insertion time; freshness is measured from here
    pub inserted_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        (now - self.inserted_at).to_std().map(|age| age < ttl).unwrap_or(true)
    }
}

/// Cache counters for the stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Entries in the memory tier
    pub memory_entries: u64,
    /// Entries in the disk tier index
    pub disk_entries: usize,
    /// Memory-tier hits
    pub hits: u64,
    /// Disk-tier hits (promoted to memory)
    pub disk_hits: u64,
    /// Full misses
    pub misses: u64,
    /// Disk writes dropped on queue overflow
    pub dropped_writes: u64,
}

/// Two-tier verdict cache.
pub struct VerdictCache {
    memory: Cache<String, CacheEntry>,
    disk: RwLock<HashMap<String, CacheEntry>>,
    writer: Option<mpsc::Sender<CacheEntry>>,
    stripes: Vec<Mutex<()>>,
    memory_ttl: Duration,
    disk_ttl: Duration,
    hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    dropped_writes: AtomicU64,
}

/// Owns the disk file and drains the cache's write queue.
pub struct DiskWriter {
    path: PathBuf,
    rx: mpsc::Receiver<CacheEntry>,
}

impl VerdictCache {
    /// Memory-only cache with default TTLs.
    pub fn new(capacity: u64) -> Self {
        Self::build(capacity, MEMORY_TTL, DISK_TTL, HashMap::new(), None)
    }

    /// Cache backed by a disk store. Compacts the store on open and returns
    /// the writer task alongside the cache.
    pub fn open(capacity: u64, path: PathBuf) -> (Self, DiskWriter) {
        Self::open_with_ttls(capacity, path, MEMORY_TTL, DISK_TTL)
    }

    /// As [`VerdictCache::open`] with explicit TTLs (tests use short ones).
    pub fn open_with_ttls(
        capacity: u64,
        path: PathBuf,
        memory_ttl: Duration,
        disk_ttl: Duration,
    ) -> (Self, DiskWriter) {
        let index = match compact(&path, disk_ttl) {
            Ok(index) => {
                if !index.is_empty() {
                    tracing::info!(entries = index.len(), path = %path.display(), "loaded disk verdict cache");
                }
                index
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "disk cache unreadable, starting empty");
                HashMap::new()
            }
        };

        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        let cache = Self::build(capacity, memory_ttl, disk_ttl, index, Some(tx));
        (cache, DiskWriter { path, rx })
    }

    fn build(
        capacity: u64,
        memory_ttl: Duration,
        disk_ttl: Duration,
        index: HashMap<String, CacheEntry>,
        writer: Option<mpsc::Sender<CacheEntry>>,
    ) -> Self {
        let memory = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(memory_ttl)
            .build();
        Self {
            memory,
            disk: RwLock::new(index),
            writer,
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
            memory_ttl,
            disk_ttl,
            hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            dropped_writes: AtomicU64::new(0),
        }
    }

    /// Read-through lookup: memory, then disk (lazily TTL-filtered, with
    /// promotion back into memory).
    pub fn lookup(&self, domain: &str) -> Option<Verdict> {
        let now = Utc::now();
        if let Some(entry) = self.memory.get(domain) {
            if entry.is_fresh(self.memory_ttl, now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.verdict);
            }
        }

        let disk_entry = self.disk.read().get(domain).cloned();
        if let Some(entry) = disk_entry {
            if entry.is_fresh(self.disk_ttl, now) {
                self.disk_hits.fetch_add(1, Ordering::Relaxed);
                self.memory.insert(domain.to_string(), entry.clone());
                return Some(entry.verdict);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Whether the domain has a live entry in either tier. Does not touch
    /// hit/miss counters.
    pub fn has_live(&self, domain: &str) -> bool {
        let now = Utc::now();
        if let Some(entry) = self.memory.get(domain) {
            if entry.is_fresh(self.memory_ttl, now) {
                return true;
            }
        }
        self.disk
            .read()
            .get(domain)
            .map(|e| e.is_fresh(self.disk_ttl, now))
            .unwrap_or(false)
    }

    /// Store a verdict, enforcing monotonic overwrite. Returns whether the
    /// entry was written.
    pub fn store(&self, verdict: Verdict) -> bool {
        let _guard = self.stripes[stripe_of(&verdict.domain)].lock();
        let now = Utc::now();

        let current = self
            .memory
            .get(&verdict.domain)
            .filter(|e| e.is_fresh(self.memory_ttl, now))
            .or_else(|| {
                self.disk
                    .read()
                    .get(&verdict.domain)
                    .filter(|e| e.is_fresh(self.disk_ttl, now))
                    .cloned()
            });

        if let Some(current) = current {
            let replaceable =
                verdict.source == Source::Reasoning && current.verdict.source != Source::Reasoning;
            if !replaceable {
                return false;
            }
        }

        let entry = CacheEntry {
            verdict,
            inserted_at: now,
        };
        self.memory.insert(entry.verdict.domain.clone(), entry.clone());
        self.disk.write().insert(entry.verdict.domain.clone(), entry.clone());

        if let Some(tx) = &self.writer {
            if tx.try_send(entry).is_err() {
                self.dropped_writes.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("disk cache write queue full, entry not persisted");
            }
        }
        true
    }

    /// Drop expired entries: runs the memory tier's pending evictions and
    /// prunes the disk index. Called from a 60 s background sweep.
    pub fn purge_expired(&self) {
        self.memory.run_pending_tasks();
        let now = Utc::now();
        let ttl = self.disk_ttl;
        let mut disk = self.disk.write();
        let before = disk.len();
        disk.retain(|_, e| e.is_fresh(ttl, now));
        let removed = before - disk.len();
        if removed > 0 {
            tracing::debug!(removed, "purged expired disk cache entries");
        }
    }

    /// Cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_entries: self.memory.entry_count(),
            disk_entries: self.disk.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
        }
    }
}

impl DiskWriter {
    /// Drain the write queue, appending entries to the store file. Runs
    /// until the cache (sender side) is dropped.
    pub async fn run(mut self) {
        while let Some(entry) = self.rx.recv().await {
            if let Err(e) = append_entry(&self.path, &entry) {
                tracing::warn!(path = %self.path.display(), error = %e, "disk cache append failed");
            }
        }
    }
}

fn stripe_of(domain: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    domain.hash(&mut hasher);
    (hasher.finish() as usize) % STRIPES
}

fn append_entry(path: &Path, entry: &CacheEntry) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    if file.metadata()?.len() == 0 {
        file.write_all(&DISK_MAGIC)?;
        file.write_all(&[DISK_VERSION, b'\n'])?;
    }
    let line = serde_json::to_string(entry)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Read the store, keep the freshest live entry per domain, and rewrite the
/// file atomically. Returns the surviving index.
fn compact(path: &Path, disk_ttl: Duration) -> std::io::Result<HashMap<String, CacheEntry>> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e),
    };

    let mut reader = BufReader::new(file);
    let mut header = [0u8; 6];
    reader.read_exact(&mut header)?;
    if header[..4] != DISK_MAGIC || header[4] != DISK_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad disk cache header",
        ));
    }

    let now = Utc::now();
    let mut index: HashMap<String, CacheEntry> = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: CacheEntry = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(_) => continue, // torn tail write
        };
        if !entry.is_fresh(disk_ttl, now) {
            continue;
        }
        match index.get(&entry.verdict.domain) {
            Some(existing) if existing.inserted_at >= entry.inserted_at => {}
            _ => {
                index.insert(entry.verdict.domain.clone(), entry);
            }
        }
    }

    let tmp = path.with_extension("tmp");
    {
        let mut out = std::fs::File::create(&tmp)?;
        out.write_all(&DISK_MAGIC)?;
        out.write_all(&[DISK_VERSION, b'\n'])?;
        for entry in index.values() {
            let line = serde_json::to_string(entry)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            out.write_all(line.as_bytes())?;
            out.write_all(b"\n")?;
        }
        out.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;

    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(domain: &str, source: Source) -> Verdict {
        Verdict {
            domain: domain.into(),
            risk: guardian_engine::Risk::Low,
            category: "System".into(),
            summary: "test".into(),
            is_anomaly: false,
            anomaly_score: 0.0,
            entropy: 1.0,
            source,
            upstream: None,
            decided_at: Utc::now(),
        }
    }

    #[test]
    fn test_roundtrip_and_miss() {
        let cache = VerdictCache::new(100);
        assert!(cache.lookup("a.example").is_none());
        assert!(cache.store(verdict("a.example", Source::Metadata)));
        let hit = cache.lookup("a.example").expect("hit");
        assert_eq!(hit.source, Source::Metadata);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = VerdictCache::build(
            100,
            Duration::from_millis(10),
            Duration::from_millis(10),
            HashMap::new(),
            None,
        );
        cache.store(verdict("a.example", Source::Heuristic));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.lookup("a.example").is_none());
        assert!(!cache.has_live("a.example"));
    }

    #[test]
    fn test_monotonic_overwrite() {
        let cache = VerdictCache::new(100);
        assert!(cache.store(verdict("a.example", Source::Heuristic)));
        // a lesser tier cannot replace a live entry
        assert!(!cache.store(verdict("a.example", Source::Metadata)));
        // reasoning can
        assert!(cache.store(verdict("a.example", Source::Reasoning)));
        // but reasoning does not replace reasoning
        assert!(!cache.store(verdict("a.example", Source::Reasoning)));
        assert_eq!(cache.lookup("a.example").unwrap().source, Source::Reasoning);
    }

    #[tokio::test]
    async fn test_disk_persistence_and_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.ngc");

        {
            let (cache, writer) = VerdictCache::open(100, path.clone());
            let handle = tokio::spawn(writer.run());
            assert!(cache.store(verdict("a.example", Source::Metadata)));
            assert!(cache.store(verdict("b.example", Source::Heuristic)));
            drop(cache); // closes the queue
            handle.await.unwrap();
        }

        let (reloaded, _writer) = VerdictCache::open(100, path.clone());
        assert_eq!(reloaded.stats().disk_entries, 2);
        let hit = reloaded.lookup("a.example").expect("disk hit");
        assert_eq!(hit.source, Source::Metadata);
        // promoted to memory
        assert_eq!(reloaded.stats().disk_hits, 1);
    }

    #[test]
    fn test_bad_header_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.ngc");
        std::fs::write(&path, b"not a cache file").unwrap();

        let (cache, _writer) = VerdictCache::open(100, path);
        assert_eq!(cache.stats().disk_entries, 0);
    }

    #[test]
    fn test_purge_expired_prunes_disk_index() {
        let cache = VerdictCache::build(
            100,
            Duration::from_millis(10),
            Duration::from_millis(10),
            HashMap::new(),
            None,
        );
        cache.store(verdict("a.example", Source::Heuristic));
        std::thread::sleep(Duration::from_millis(20));
        cache.purge_expired();
        assert_eq!(cache.stats().disk_entries, 0);
    }
}
