//! Three-layer duplicate suppression.
//!
//! Layers, consulted in order: this worker's own completed files, a lazily
//! reloaded union of peer progress, and a mirror of the target service's
//! fingerprint set. `seen` is a conservative approximation: a false negative
//! only costs a duplicate upload the server rejects gracefully; a false
//! positive would silently drop a book, so the mirror is only ever populated
//! from authoritative sources.

use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::fingerprint::Fingerprint;
use crate::progress::WorkerProgress;

/// Refresh triggers for the remote mirror.
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    /// Refresh after this many processed files.
    pub after_files: usize,
    /// Refresh after this much wall-clock time.
    pub after_elapsed: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            after_files: 1_500,
            after_elapsed: Duration::from_secs(15 * 60),
        }
    }
}

/// Which layer answered a `seen` lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeenLayer {
    Local,
    Peer,
    Mirror,
}

#[derive(Debug)]
pub struct DedupCache {
    local: HashSet<Fingerprint>,
    local_paths: HashSet<String>,
    peers: HashSet<Fingerprint>,
    mirror: HashSet<Fingerprint>,
    policy: RefreshPolicy,
    processed_since_refresh: usize,
    last_refresh: Instant,
}

impl DedupCache {
    pub fn new(policy: RefreshPolicy) -> Self {
        Self {
            local: HashSet::new(),
            local_paths: HashSet::new(),
            peers: HashSet::new(),
            mirror: HashSet::new(),
            policy,
            processed_since_refresh: 0,
            last_refresh: Instant::now(),
        }
    }

    /// Seed the local layer from this worker's own resumed progress.
    pub fn seed_local(&mut self, progress: &WorkerProgress) {
        for fp in progress.completed_fingerprints() {
            self.local.insert(fp);
        }
        for entry in progress.completed_files.values() {
            self.local_paths.insert(entry.path.clone());
        }
    }

    /// Replace the peer layer with a fresh union of peer progress.
    pub fn reload_peers(&mut self, fingerprints: HashSet<Fingerprint>) {
        self.peers = fingerprints;
    }

    /// Replace the mirror with a fresh authoritative set and reset triggers.
    pub fn apply_mirror(&mut self, fingerprints: HashSet<Fingerprint>) {
        self.mirror = fingerprints;
        self.processed_since_refresh = 0;
        self.last_refresh = Instant::now();
    }

    /// Reset triggers without replacing the mirror (refresh failed; the stale
    /// mirror stays conservative-valid).
    pub fn defer_refresh(&mut self) {
        self.processed_since_refresh = 0;
        self.last_refresh = Instant::now();
    }

    pub fn mirror_len(&self) -> usize {
        self.mirror.len()
    }

    /// Conservative membership test across all three layers.
    pub fn seen(&self, fp: &Fingerprint) -> Option<SeenLayer> {
        if self.local.contains(fp) {
            Some(SeenLayer::Local)
        } else if self.peers.contains(fp) {
            Some(SeenLayer::Peer)
        } else if self.mirror.contains(fp) {
            Some(SeenLayer::Mirror)
        } else {
            None
        }
    }

    /// Cheap pre-fingerprint check: was this exact path already resolved by
    /// this worker in an earlier run?
    pub fn seen_path(&self, path: &Path) -> bool {
        self.local_paths.contains(&path.display().to_string())
    }

    /// Record a locally resolved fingerprint (any terminal status).
    pub fn note_resolved(&mut self, fp: Fingerprint, path: &Path) {
        self.local_paths.insert(path.display().to_string());
        self.local.insert(fp);
    }

    /// Record a successful upload; the mirror learns it immediately so peers
    /// of this process (and later batches) skip it without a server round
    /// trip.
    pub fn note_uploaded(&mut self, fp: Fingerprint) {
        self.mirror.insert(fp.clone());
        self.local.insert(fp);
    }

    /// Count one processed file toward the refresh trigger and report whether
    /// a refresh is due.
    pub fn note_processed(&mut self) -> bool {
        self.processed_since_refresh += 1;
        self.refresh_due()
    }

    pub fn refresh_due(&self) -> bool {
        self.processed_since_refresh >= self.policy.after_files
            || self.last_refresh.elapsed() >= self.policy.after_elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::CompletedStatus;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint::new(format!("{n:08x}"), n)
    }

    #[test]
    fn layers_are_consulted_in_order() {
        let mut cache = DedupCache::new(RefreshPolicy::default());
        let mut progress = WorkerProgress::empty(0, 1);
        progress.record_completed(&fp(1), Path::new("/a"), CompletedStatus::Uploaded);
        cache.seed_local(&progress);
        cache.reload_peers([fp(1), fp(2)].into_iter().collect());
        cache.apply_mirror([fp(1), fp(2), fp(3)].into_iter().collect());

        assert_eq!(cache.seen(&fp(1)), Some(SeenLayer::Local));
        assert_eq!(cache.seen(&fp(2)), Some(SeenLayer::Peer));
        assert_eq!(cache.seen(&fp(3)), Some(SeenLayer::Mirror));
        assert_eq!(cache.seen(&fp(4)), None);
    }

    #[test]
    fn uploaded_fingerprints_join_the_mirror() {
        let mut cache = DedupCache::new(RefreshPolicy::default());
        assert_eq!(cache.seen(&fp(9)), None);
        cache.note_uploaded(fp(9));
        assert!(cache.seen(&fp(9)).is_some());
    }

    #[test]
    fn count_trigger_fires_after_threshold() {
        let policy = RefreshPolicy {
            after_files: 3,
            after_elapsed: Duration::from_secs(3600),
        };
        let mut cache = DedupCache::new(policy);
        assert!(!cache.note_processed());
        assert!(!cache.note_processed());
        assert!(cache.note_processed());

        cache.apply_mirror(HashSet::new());
        assert!(!cache.refresh_due());
    }

    #[test]
    fn elapsed_trigger_fires_after_window() {
        let policy = RefreshPolicy {
            after_files: usize::MAX,
            after_elapsed: Duration::ZERO,
        };
        let cache = DedupCache::new(policy);
        assert!(cache.refresh_due());
    }

    #[test]
    fn failed_refresh_defers_without_clearing_mirror() {
        let policy = RefreshPolicy {
            after_files: 1,
            after_elapsed: Duration::from_secs(3600),
        };
        let mut cache = DedupCache::new(policy);
        cache.apply_mirror([fp(5)].into_iter().collect());
        assert!(cache.note_processed());
        cache.defer_refresh();
        assert!(!cache.refresh_due());
        assert_eq!(cache.seen(&fp(5)), Some(SeenLayer::Mirror));
    }

    #[test]
    fn path_layer_catches_resumed_files_before_hashing() {
        let mut cache = DedupCache::new(RefreshPolicy::default());
        let mut progress = WorkerProgress::empty(0, 1);
        progress.record_completed(
            &fp(7),
            Path::new("/library/b.epub"),
            CompletedStatus::AlreadyPresentRemote,
        );
        cache.seed_local(&progress);
        assert!(cache.seen_path(Path::new("/library/b.epub")));
        assert!(!cache.seen_path(Path::new("/library/c.epub")));
    }
}
