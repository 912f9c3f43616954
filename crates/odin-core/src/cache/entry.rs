//! Cache entry types.
//!
//! A `CachedFile` is either a full-content entry or a partial entry holding
//! line-range segments, never both at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Logical clock for LRU ordering. Strictly monotonic, so two accesses in
/// the same millisecond still have a total order.
static CLOCK: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_tick() -> u64 {
    CLOCK.fetch_add(1, Ordering::Relaxed)
}

/// SHA-256 hex digest of file content.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A cached line-range segment of a file. Keyed by `"<start>-<end>"`.
#[derive(Debug, Clone)]
pub struct CachedSegment {
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub hash: String,
    pub cached_at: DateTime<Utc>,
    pub(crate) tick: u64,
}

impl CachedSegment {
    pub fn new(start_line: usize, end_line: usize, content: String) -> Self {
        let hash = content_hash(&content);
        Self {
            start_line,
            end_line,
            content,
            hash,
            cached_at: Utc::now(),
            tick: next_tick(),
        }
    }

    pub fn key(&self) -> String {
        segment_key(self.start_line, self.end_line)
    }
}

pub fn segment_key(start: usize, end: usize) -> String {
    format!("{}-{}", start, end)
}

/// A cached file entry. Exactly one of `full_content` / `is_partial` holds.
#[derive(Debug)]
pub struct CachedFile {
    pub full_content: Option<String>,
    pub is_partial: bool,
    pub partial_cache: HashMap<String, CachedSegment>,

    /// SHA-256 of the full content when known.
    pub content_hash: Option<String>,
    /// Bytes accounted against the cache budget.
    pub size: u64,
    pub total_lines: usize,
    pub cached_at: DateTime<Utc>,
    pub mod_time: Option<SystemTime>,
    /// Mutated in this session by a writing tool.
    pub is_modified: bool,
    /// Hash at first read; drift against it flags external tampering.
    pub original_hash: Option<String>,

    access_count: AtomicU64,
    last_accessed: AtomicU64,
}

impl CachedFile {
    pub fn full(content: String, total_lines: usize, mod_time: Option<SystemTime>) -> Self {
        let hash = content_hash(&content);
        let size = content.len() as u64;
        Self {
            full_content: Some(content),
            is_partial: false,
            partial_cache: HashMap::new(),
            content_hash: Some(hash.clone()),
            size,
            total_lines,
            cached_at: Utc::now(),
            mod_time,
            is_modified: false,
            original_hash: Some(hash),
            access_count: AtomicU64::new(0),
            last_accessed: AtomicU64::new(next_tick()),
        }
    }

    pub fn partial(segment: CachedSegment, mod_time: Option<SystemTime>) -> Self {
        let size = segment.content.len() as u64;
        let mut partial_cache = HashMap::new();
        partial_cache.insert(segment.key(), segment);
        Self {
            full_content: None,
            is_partial: true,
            partial_cache,
            content_hash: None,
            size,
            total_lines: 0,
            cached_at: Utc::now(),
            mod_time,
            is_modified: false,
            original_hash: None,
            access_count: AtomicU64::new(0),
            last_accessed: AtomicU64::new(next_tick()),
        }
    }

    /// Record an access. Callable under a shared lock.
    pub fn touch(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_accessed.store(next_tick(), Ordering::Relaxed);
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn last_accessed(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    /// Recompute `size` from current content.
    pub(crate) fn recompute_size(&mut self) {
        self.size = match &self.full_content {
            Some(c) => c.len() as u64,
            None => self
                .partial_cache
                .values()
                .map(|s| s.content.len() as u64)
                .sum(),
        };
    }
}

/// Immutable view of a cache entry handed out to tools.
#[derive(Debug, Clone)]
pub struct CachedFileView {
    pub full_content: Option<String>,
    pub is_partial: bool,
    pub segments: Vec<CachedSegment>,
    pub content_hash: Option<String>,
    pub size: u64,
    pub total_lines: usize,
    pub cached_at: DateTime<Utc>,
    pub is_modified: bool,
}

impl CachedFile {
    pub fn view(&self) -> CachedFileView {
        let mut segments: Vec<CachedSegment> = self.partial_cache.values().cloned().collect();
        segments.sort_by_key(|s| (s.start_line, s.end_line));
        CachedFileView {
            full_content: self.full_content.clone(),
            is_partial: self.is_partial,
            segments,
            content_hash: self.content_hash.clone(),
            size: self.size,
            total_lines: self.total_lines,
            cached_at: self.cached_at,
            is_modified: self.is_modified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_entry_sets_hash_and_original_hash() {
        let entry = CachedFile::full("hello\nworld\n".into(), 2, None);
        assert!(!entry.is_partial);
        assert_eq!(entry.content_hash, entry.original_hash);
        assert_eq!(entry.size, 12);
        assert_eq!(entry.total_lines, 2);
    }

    #[test]
    fn partial_entry_holds_segment_under_range_key() {
        let seg = CachedSegment::new(10, 20, "chunk".into());
        let entry = CachedFile::partial(seg, None);
        assert!(entry.is_partial);
        assert!(entry.full_content.is_none());
        assert!(entry.partial_cache.contains_key("10-20"));
        assert_eq!(entry.size, 5);
    }

    #[test]
    fn touch_bumps_access_metadata() {
        let entry = CachedFile::full("x".into(), 1, None);
        let before = entry.last_accessed();
        entry.touch();
        assert_eq!(entry.access_count(), 1);
        assert!(entry.last_accessed() > before);
    }

    #[test]
    fn content_hash_is_sha256_hex() {
        // sha256("abc")
        assert_eq!(
            content_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
