//! File-content cache with full and segment-level entries.
//!
//! Mutating tools must find their target here before editing (read-before-write);
//! the sufficiency check in [`sufficiency`] decides whether cached context is
//! enough for a proposed edit.
//!
//! Locking: a single reader-writer lock over the map. `get` takes the shared
//! side; access metadata lives in atomics so hits never need the exclusive
//! lock. Filesystem stats happen before any lock is taken.

mod entry;
pub mod sufficiency;

pub use entry::{content_hash, segment_key, CachedFile, CachedFileView, CachedSegment};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ToolError;

/// Which entry the eviction pass sacrifices first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    /// Prefer unmodified entries as victims, preserving in-session work.
    #[default]
    Hybrid,
}

/// Cache bounds and behavior. Provided config is respected verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCacheConfig {
    pub max_cache_size: u64,
    pub max_file_size: u64,
    pub max_entries: usize,
    pub max_segments: usize,
    /// 0 disables TTL expiry.
    pub ttl_secs: u64,
    pub eviction_policy: EvictionPolicy,
    pub enable_auto_refresh: bool,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 100 * 1024 * 1024,
            max_file_size: 10 * 1024 * 1024,
            max_entries: 500,
            max_segments: 50,
            ttl_secs: 0,
            eviction_policy: EvictionPolicy::Hybrid,
            enable_auto_refresh: true,
        }
    }
}

/// Per-file line in the planner's cache snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedFileSummary {
    pub path: PathBuf,
    pub size: u64,
    pub is_modified: bool,
    pub cached_at: DateTime<Utc>,
    pub is_truncated: bool,
}

struct CacheInner {
    entries: HashMap<PathBuf, CachedFile>,
    current_size: u64,
    /// Files read but refused caching because they exceed `max_file_size`.
    oversize: HashMap<PathBuf, u64>,
}

/// Thread-safe file cache. Key = absolute path.
pub struct FileCache {
    inner: RwLock<CacheInner>,
    config: FileCacheConfig,
}

impl FileCache {
    pub fn new(config: FileCacheConfig) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                entries: HashMap::new(),
                current_size: 0,
                oversize: HashMap::new(),
            }),
            config,
        }
    }

    pub fn config(&self) -> &FileCacheConfig {
        &self.config
    }

    /// Look up a full-or-partial entry, bumping access metadata on hit.
    ///
    /// With auto-refresh enabled the file is re-stat'd first; an mtime
    /// mismatch drops the entry and reports a miss. A TTL-expired entry is
    /// likewise dropped.
    pub fn get(&self, path: &Path) -> Option<CachedFileView> {
        // Stat outside the lock.
        let disk_mtime = if self.config.enable_auto_refresh {
            std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
        } else {
            None
        };

        let stale = {
            let inner = self.inner.read().expect("cache lock poisoned");
            let entry = inner.entries.get(path)?;

            if self.is_expired(entry) {
                true
            } else if self.config.enable_auto_refresh {
                match (entry.mod_time, disk_mtime) {
                    (Some(cached), Some(disk)) => cached != disk,
                    // File vanished from disk: treat as stale.
                    (Some(_), None) => true,
                    _ => false,
                }
            } else {
                false
            }
        };

        if stale {
            self.invalidate(path);
            return None;
        }

        let inner = self.inner.read().expect("cache lock poisoned");
        let entry = inner.entries.get(path)?;
        entry.touch();
        Some(entry.view())
    }

    /// Exact-key segment lookup. A subrange of an existing segment is a miss.
    pub fn get_segment(&self, path: &Path, start: usize, end: usize) -> Option<CachedSegment> {
        let inner = self.inner.read().expect("cache lock poisoned");
        let entry = inner.entries.get(path)?;
        let seg = entry.partial_cache.get(&segment_key(start, end))?;
        entry.touch();
        Some(seg.clone())
    }

    /// Install or replace a full entry. Clears any prior partial state.
    ///
    /// Returns `false` when the file exceeds `max_file_size`; the content is
    /// still usable by the caller, whose tool output should carry a
    /// truncated flag.
    pub fn put_full(&self, path: &Path, content: &str, mod_time: Option<SystemTime>) -> bool {
        let size = content.len() as u64;
        if size > self.config.max_file_size {
            let mut inner = self.inner.write().expect("cache lock poisoned");
            inner.oversize.insert(path.to_path_buf(), size);
            tracing::debug!(path = %path.display(), size, "file exceeds max_file_size, not cached");
            return false;
        }

        let total_lines = content.lines().count();
        let mut inner = self.inner.write().expect("cache lock poisoned");
        inner.oversize.remove(path);
        Self::evict_for(&mut inner, &self.config, path, size);

        let new_hash = entry::content_hash(content);
        match inner.entries.remove(path) {
            Some(mut existing) => {
                inner.current_size -= existing.size;
                existing.full_content = Some(content.to_string());
                existing.is_partial = false;
                existing.partial_cache.clear();
                existing.content_hash = Some(new_hash.clone());
                existing.total_lines = total_lines;
                existing.mod_time = mod_time;
                if existing.original_hash.is_none() {
                    existing.original_hash = Some(new_hash);
                }
                existing.recompute_size();
                inner.current_size += existing.size;
                inner.entries.insert(path.to_path_buf(), existing);
            }
            None => {
                let entry = CachedFile::full(content.to_string(), total_lines, mod_time);
                inner.current_size += entry.size;
                inner.entries.insert(path.to_path_buf(), entry);
            }
        }
        true
    }

    /// Add a line-range segment, creating a partial entry if none exists.
    ///
    /// Overwrites under the same range key. Past `max_segments` the segment
    /// with the oldest `cached_at` is dropped. On a full-content entry the
    /// segment is subsumed and this is a no-op.
    pub fn put_segment(&self, path: &Path, segment: CachedSegment, mod_time: Option<SystemTime>) {
        let mut guard = self.inner.write().expect("cache lock poisoned");
        let inner = &mut *guard;

        if let Some(existing) = inner.entries.get(path) {
            if !existing.is_partial {
                return;
            }
        }

        // The post-insert entry carries its current segments plus this one.
        let seg_size = segment.content.len() as u64;
        let existing_size = inner.entries.get(path).map(|e| e.size).unwrap_or(0);
        Self::evict_for(inner, &self.config, path, existing_size + seg_size);

        match inner.entries.get_mut(path) {
            Some(existing) => {
                inner.current_size -= existing.size;
                existing.partial_cache.insert(segment.key(), segment);
                while existing.partial_cache.len() > self.config.max_segments {
                    let oldest = existing
                        .partial_cache
                        .values()
                        .min_by_key(|s| s.tick)
                        .map(|s| s.key());
                    match oldest {
                        Some(key) => {
                            existing.partial_cache.remove(&key);
                        }
                        None => break,
                    }
                }
                existing.recompute_size();
                inner.current_size += existing.size;
            }
            None => {
                let entry = CachedFile::partial(segment, mod_time);
                inner.current_size += entry.size;
                inner.entries.insert(path.to_path_buf(), entry);
            }
        }
    }

    /// Record a successful write: full content replaces whatever was cached,
    /// partial entries are promoted, and the entry is flagged as modified.
    pub fn mark_modified(&self, path: &Path, new_content: &str, mod_time: Option<SystemTime>) {
        let size = new_content.len() as u64;
        if size > self.config.max_file_size {
            // An oversize write falls out of the cache entirely.
            let mut inner = self.inner.write().expect("cache lock poisoned");
            if let Some(old) = inner.entries.remove(path) {
                inner.current_size -= old.size;
            }
            inner.oversize.insert(path.to_path_buf(), size);
            return;
        }

        let total_lines = new_content.lines().count();
        let new_hash = entry::content_hash(new_content);
        let mut inner = self.inner.write().expect("cache lock poisoned");
        Self::evict_for(&mut inner, &self.config, path, size);

        match inner.entries.remove(path) {
            Some(mut existing) => {
                inner.current_size -= existing.size;
                existing.full_content = Some(new_content.to_string());
                existing.is_partial = false;
                existing.partial_cache.clear();
                existing.content_hash = Some(new_hash.clone());
                existing.total_lines = total_lines;
                existing.mod_time = mod_time;
                existing.is_modified = true;
                if existing.original_hash.is_none() {
                    existing.original_hash = Some(new_hash);
                }
                existing.recompute_size();
                inner.current_size += existing.size;
                inner.entries.insert(path.to_path_buf(), existing);
            }
            None => {
                let mut entry = CachedFile::full(new_content.to_string(), total_lines, mod_time);
                entry.is_modified = true;
                inner.current_size += entry.size;
                inner.entries.insert(path.to_path_buf(), entry);
            }
        }
    }

    /// Remove an entry outright.
    pub fn invalidate(&self, path: &Path) {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        if let Some(entry) = inner.entries.remove(path) {
            inner.current_size -= entry.size;
        }
        inner.oversize.remove(path);
    }

    /// Compare current on-disk content against the cached hash. Detects
    /// external edits the mtime check missed. Invalidates on drift.
    pub fn verify_disk(&self, path: &Path, disk_content: &str) -> Result<(), ToolError> {
        let drift = {
            let inner = self.inner.read().expect("cache lock poisoned");
            match inner.entries.get(path) {
                Some(entry) => match (&entry.content_hash, entry.is_modified) {
                    (Some(cached_hash), _) => *cached_hash != entry::content_hash(disk_content),
                    (None, _) => false,
                },
                None => false,
            }
        };

        if drift {
            self.invalidate(path);
            return Err(ToolError::ExternalModification(format!(
                "{} changed on disk since it was cached; re-read it before editing",
                path.display()
            )));
        }
        Ok(())
    }

    pub fn contains(&self, path: &Path) -> bool {
        let inner = self.inner.read().expect("cache lock poisoned");
        inner.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().expect("cache lock poisoned");
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_size(&self) -> u64 {
        let inner = self.inner.read().expect("cache lock poisoned");
        inner.current_size
    }

    /// Read-time snapshot for planner input and state publishing.
    pub fn summary(&self) -> Vec<CachedFileSummary> {
        let inner = self.inner.read().expect("cache lock poisoned");
        let mut out: Vec<CachedFileSummary> = inner
            .entries
            .iter()
            .map(|(path, entry)| CachedFileSummary {
                path: path.clone(),
                size: entry.size,
                is_modified: entry.is_modified,
                cached_at: entry.cached_at,
                is_truncated: false,
            })
            .collect();
        out.extend(inner.oversize.iter().map(|(path, size)| CachedFileSummary {
            path: path.clone(),
            size: *size,
            is_modified: false,
            cached_at: Utc::now(),
            is_truncated: true,
        }));
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    /// Candidate content for the sufficiency check: full content when
    /// available, otherwise all segments with their line-range headers.
    pub fn gather_candidate(&self, path: &Path) -> Option<String> {
        let view = {
            let inner = self.inner.read().expect("cache lock poisoned");
            inner.entries.get(path)?.view()
        };

        if let Some(full) = view.full_content {
            return Some(full);
        }
        if view.segments.is_empty() {
            return None;
        }

        let mut out = String::new();
        for seg in &view.segments {
            out.push_str(&format!("[lines {}-{}]\n", seg.start_line, seg.end_line));
            out.push_str(&seg.content);
            if !seg.content.ends_with('\n') {
                out.push('\n');
            }
        }
        Some(out)
    }

    fn is_expired(&self, entry: &CachedFile) -> bool {
        if self.config.ttl_secs == 0 {
            return false;
        }
        let age = Utc::now().signed_duration_since(entry.cached_at);
        age.to_std().unwrap_or(Duration::ZERO) > Duration::from_secs(self.config.ttl_secs)
    }

    /// Evict until the new insert of `incoming` bytes satisfies both bounds.
    /// The entry being replaced (if any) does not count against itself.
    fn evict_for(inner: &mut CacheInner, config: &FileCacheConfig, incoming_path: &Path, incoming: u64) {
        loop {
            let replacing = inner.entries.get(incoming_path).map(|e| e.size).unwrap_or(0);
            let effective_entries =
                inner.entries.len() - usize::from(inner.entries.contains_key(incoming_path));
            let effective_size = inner.current_size - replacing;

            let over_entries = effective_entries >= config.max_entries;
            let over_size = effective_size + incoming > config.max_cache_size;
            if !over_entries && !over_size {
                return;
            }

            let victim = Self::pick_victim(inner, config, incoming_path);
            match victim {
                Some(path) => {
                    if let Some(entry) = inner.entries.remove(&path) {
                        inner.current_size -= entry.size;
                        tracing::debug!(path = %path.display(), size = entry.size, "evicted cache entry");
                    }
                }
                None => return,
            }
        }
    }

    fn pick_victim(
        inner: &CacheInner,
        config: &FileCacheConfig,
        incoming_path: &Path,
    ) -> Option<PathBuf> {
        let candidates = inner
            .entries
            .iter()
            .filter(|(path, _)| path.as_path() != incoming_path);

        match config.eviction_policy {
            EvictionPolicy::Lru => candidates
                .min_by_key(|(_, e)| e.last_accessed())
                .map(|(p, _)| p.clone()),
            EvictionPolicy::Lfu => candidates
                .min_by_key(|(_, e)| (e.access_count(), e.last_accessed()))
                .map(|(p, _)| p.clone()),
            EvictionPolicy::Hybrid => {
                let unmodified = inner
                    .entries
                    .iter()
                    .filter(|(path, e)| path.as_path() != incoming_path && !e.is_modified)
                    .min_by_key(|(_, e)| e.last_accessed())
                    .map(|(p, _)| p.clone());
                unmodified.or_else(|| {
                    inner
                        .entries
                        .iter()
                        .filter(|(path, _)| path.as_path() != incoming_path)
                        .min_by_key(|(_, e)| e.last_accessed())
                        .map(|(p, _)| p.clone())
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn cache_with(config: FileCacheConfig) -> FileCache {
        FileCache::new(config)
    }

    fn small_config() -> FileCacheConfig {
        FileCacheConfig {
            enable_auto_refresh: false,
            ..Default::default()
        }
    }

    #[test]
    fn put_full_then_get_round_trips_content_and_hash() {
        let cache = cache_with(small_config());
        let path = Path::new("/ws/main.go");
        cache.put_full(path, "package main\n", None);

        let view = cache.get(path).expect("entry");
        assert_eq!(view.full_content.as_deref(), Some("package main\n"));
        assert_eq!(view.content_hash, Some(content_hash("package main\n")));
        assert!(!view.is_modified);
    }

    #[test]
    fn segment_lookup_is_exact_key_only() {
        let cache = cache_with(small_config());
        let path = Path::new("/ws/lib.rs");
        cache.put_segment(path, CachedSegment::new(10, 30, "body".into()), None);

        assert!(cache.get_segment(path, 10, 30).is_some());
        // A subrange of an existing segment is a miss.
        assert!(cache.get_segment(path, 12, 20).is_none());
    }

    #[test]
    fn put_full_clears_prior_segments() {
        let cache = cache_with(small_config());
        let path = Path::new("/ws/lib.rs");
        cache.put_segment(path, CachedSegment::new(1, 5, "head".into()), None);
        cache.put_full(path, "entire file\n", None);

        let view = cache.get(path).expect("entry");
        assert!(!view.is_partial);
        assert!(view.segments.is_empty());
        assert!(cache.get_segment(path, 1, 5).is_none());
    }

    #[test]
    fn segment_on_full_entry_is_subsumed() {
        let cache = cache_with(small_config());
        let path = Path::new("/ws/lib.rs");
        cache.put_full(path, "entire file\n", None);
        cache.put_segment(path, CachedSegment::new(1, 1, "entire file".into()), None);

        let view = cache.get(path).expect("entry");
        assert!(!view.is_partial);
        assert!(view.full_content.is_some());
    }

    #[test]
    fn oldest_segment_dropped_past_max_segments() {
        let config = FileCacheConfig {
            max_segments: 3,
            enable_auto_refresh: false,
            ..Default::default()
        };
        let cache = cache_with(config);
        let path = Path::new("/ws/big.rs");

        for i in 0..4usize {
            let start = i * 10 + 1;
            cache.put_segment(
                path,
                CachedSegment::new(start, start + 5, format!("seg{}", i)),
                None,
            );
        }

        // First segment (1-6) was cached earliest and must be gone.
        assert!(cache.get_segment(path, 1, 6).is_none());
        assert!(cache.get_segment(path, 31, 36).is_some());
        let view = cache.get(path).expect("entry");
        assert_eq!(view.segments.len(), 3);
    }

    #[test]
    fn mark_modified_promotes_partial_to_full() {
        let cache = cache_with(small_config());
        let path = Path::new("/ws/auth.go");
        cache.put_segment(path, CachedSegment::new(5, 9, "old chunk".into()), None);

        cache.mark_modified(path, "new full content\n", None);

        let view = cache.get(path).expect("entry");
        assert!(!view.is_partial);
        assert!(view.is_modified);
        assert_eq!(view.full_content.as_deref(), Some("new full content\n"));
        assert_eq!(view.content_hash, Some(content_hash("new full content\n")));
        assert!(view.segments.is_empty());
    }

    #[test]
    fn bounds_hold_after_inserts() {
        let config = FileCacheConfig {
            max_entries: 3,
            max_cache_size: 50,
            enable_auto_refresh: false,
            ..Default::default()
        };
        let cache = cache_with(config);

        for i in 0..10 {
            let path = PathBuf::from(format!("/ws/f{}.rs", i));
            cache.put_full(&path, "0123456789", None);
        }

        assert!(cache.len() <= 3);
        assert!(cache.current_size() <= 50);
    }

    #[test]
    fn lru_evicts_least_recently_accessed() {
        let config = FileCacheConfig {
            max_entries: 2,
            eviction_policy: EvictionPolicy::Lru,
            enable_auto_refresh: false,
            ..Default::default()
        };
        let cache = cache_with(config);
        let a = Path::new("/ws/a.rs");
        let b = Path::new("/ws/b.rs");

        cache.put_full(a, "aa", None);
        cache.put_full(b, "bb", None);
        cache.get(a); // refresh a

        cache.put_full(Path::new("/ws/c.rs"), "cc", None);
        assert!(cache.contains(a));
        assert!(!cache.contains(b));
    }

    #[test]
    fn lfu_breaks_ties_by_recency() {
        let config = FileCacheConfig {
            max_entries: 2,
            eviction_policy: EvictionPolicy::Lfu,
            enable_auto_refresh: false,
            ..Default::default()
        };
        let cache = cache_with(config);
        let a = Path::new("/ws/a.rs");
        let b = Path::new("/ws/b.rs");

        cache.put_full(a, "aa", None);
        cache.put_full(b, "bb", None);
        cache.get(a);
        cache.get(a);
        cache.get(b);

        cache.put_full(Path::new("/ws/c.rs"), "cc", None);
        assert!(cache.contains(a));
        assert!(!cache.contains(b));
    }

    #[test]
    fn hybrid_prefers_unmodified_victims() {
        let config = FileCacheConfig {
            max_entries: 2,
            eviction_policy: EvictionPolicy::Hybrid,
            enable_auto_refresh: false,
            ..Default::default()
        };
        let cache = cache_with(config);
        let modified = Path::new("/ws/work.rs");
        let cold = Path::new("/ws/cold.rs");

        cache.put_full(modified, "v1", None);
        cache.mark_modified(modified, "v2", None);
        cache.put_full(cold, "cc", None);
        // `modified` is older by recency, but hybrid must spare it.
        cache.get(cold);

        cache.put_full(Path::new("/ws/new.rs"), "nn", None);
        assert!(cache.contains(modified));
        assert!(!cache.contains(cold));
    }

    #[test]
    fn hybrid_falls_back_to_modified_when_no_other_choice() {
        let config = FileCacheConfig {
            max_entries: 1,
            eviction_policy: EvictionPolicy::Hybrid,
            enable_auto_refresh: false,
            ..Default::default()
        };
        let cache = cache_with(config);
        let modified = Path::new("/ws/work.rs");
        cache.put_full(modified, "v1", None);
        cache.mark_modified(modified, "v2", None);

        cache.put_full(Path::new("/ws/other.rs"), "oo", None);
        assert!(!cache.contains(modified));
        assert!(cache.contains(Path::new("/ws/other.rs")));
    }

    #[test]
    fn oversize_file_not_cached_but_summarized_as_truncated() {
        let config = FileCacheConfig {
            max_file_size: 4,
            enable_auto_refresh: false,
            ..Default::default()
        };
        let cache = cache_with(config);
        let path = Path::new("/ws/huge.bin");

        assert!(!cache.put_full(path, "way too large", None));
        assert!(!cache.contains(path));

        let summary = cache.summary();
        let line = summary.iter().find(|s| s.path == path).expect("summary line");
        assert!(line.is_truncated);
    }

    #[test]
    fn auto_refresh_drops_entry_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched.txt");
        std::fs::write(&path, "v1").unwrap();
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

        let cache = cache_with(FileCacheConfig::default());
        cache.put_full(&path, "v1", Some(mtime));
        assert!(cache.get(&path).is_some());

        // Rewriting after a short sleep advances the mtime.
        std::thread::sleep(Duration::from_millis(20));
        let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.write_all(b"v2").unwrap();
        drop(f);

        assert!(cache.get(&path).is_none());
        assert!(!cache.contains(&path));
    }

    #[test]
    fn verify_disk_flags_external_drift_and_invalidates() {
        let cache = cache_with(small_config());
        let path = Path::new("/ws/auth.go");
        cache.put_full(path, "cached content", None);

        let err = cache.verify_disk(path, "tampered content").unwrap_err();
        assert!(matches!(err, ToolError::ExternalModification(_)));
        assert!(!cache.contains(path));
    }

    #[test]
    fn gather_candidate_concatenates_segments_with_headers() {
        let cache = cache_with(small_config());
        let path = Path::new("/ws/lib.rs");
        cache.put_segment(path, CachedSegment::new(1, 2, "fn a() {}\nfn b() {}".into()), None);
        cache.put_segment(path, CachedSegment::new(10, 11, "fn z() {}".into()), None);

        let candidate = cache.gather_candidate(path).expect("candidate");
        assert!(candidate.contains("[lines 1-2]"));
        assert!(candidate.contains("[lines 10-11]"));
        assert!(candidate.contains("fn z() {}"));
    }
}
