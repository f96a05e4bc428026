//! The process-wide time→byte-offset recording index.
//!
//! One sorted entry list per recording path, guarded by a single
//! reader/writer lock. Rebuilds are single-flight per path and release the
//! lock between segments, so queries against a path mid-rebuild observe a
//! valid, always-sorted prefix instead of blocking for the whole rebuild.

pub mod scan;
pub mod sidecar;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use crate::config::{is_reserved_path, PathConfig, RecordFormat};
use crate::playback::segment::SegmentFinder;

/// One point in the time→offset mapping for a path.
///
/// `offset == 0` is a sentinel marking the start of a segment, not a
/// meaningful seek target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub time: DateTime<Utc>,
    pub offset: i64,
}

impl IndexEntry {
    /// True for segment-start markers.
    pub fn is_sentinel(&self) -> bool {
        self.offset == 0
    }
}

#[derive(Default)]
struct IndexState {
    entries: HashMap<String, Vec<IndexEntry>>,
    running: HashSet<String>,
}

/// Shared, per-path sorted index of recording fragments.
///
/// Explicitly constructed and injected into whoever needs it (server
/// context, recorder, cleaner); there is no global instance.
#[derive(Default)]
pub struct TimeIndex {
    state: RwLock<IndexState>,
}

/// Clears the running flag for a path when dropped, so a failed rebuild
/// never blocks future attempts.
struct RunningGuard<'a> {
    index: &'a TimeIndex,
    path_name: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.index.state.write().running.remove(&self.path_name);
    }
}

impl TimeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the index for every configured path.
    pub fn rebuild_all(
        &self,
        paths: &HashMap<String, PathConfig>,
        finder: &dyn SegmentFinder,
    ) {
        for (path_name, path_conf) in paths {
            self.rebuild_path(path_name, path_conf, finder);
        }
    }

    /// Rebuild the index for one path from its sidecars and segments.
    ///
    /// No-op for reserved pseudo-paths and non-fMP4 record formats.
    /// Single-flight: a rebuild already running for this path makes the call
    /// return immediately. Segment failures are logged and skipped; sidecar
    /// write failures are logged and ignored (the in-memory index stays
    /// authoritative).
    pub fn rebuild_path(
        &self,
        path_name: &str,
        path_conf: &PathConfig,
        finder: &dyn SegmentFinder,
    ) {
        if is_reserved_path(path_name) {
            return;
        }
        if path_conf.record_format != RecordFormat::Fmp4 {
            return;
        }

        let segments = match finder.find_segments(path_conf, path_name) {
            Ok(segments) => segments,
            Err(_) => return,
        };
        if segments.is_empty() {
            return;
        }

        let Some(_guard) = self.try_begin_rebuild(path_name) else {
            return;
        };

        tracing::info!(path = %path_name, "index rebuild started");
        let t0 = Instant::now();

        for seg in &segments {
            let (entries, scanned) = match sidecar::read_sidecar(seg) {
                Ok(entries) => (entries, false),
                Err(_) => match scan::scan_segment(seg) {
                    Ok(entries) => (entries, true),
                    Err(e) => {
                        tracing::warn!(path = %path_name, "failed to scan segment: {e}");
                        continue;
                    }
                },
            };

            if scanned {
                tracing::info!(
                    segment = %seg.fpath.display(),
                    len = entries.len(),
                    "segment scanned"
                );
            }

            // Merge under the lock, then release it before touching the
            // next segment so concurrent queries stay responsive.
            {
                let mut state = self.state.write();
                let list = state.entries.entry(path_name.to_string()).or_default();
                list.extend_from_slice(&entries);
                list.sort_by_key(|e| e.time);
            }

            if scanned {
                if let Err(e) = sidecar::write_sidecar(&seg.fpath, &entries) {
                    tracing::warn!(path = %path_name, "sidecar write failed: {e}");
                }
            }
        }

        tracing::info!(
            path = %path_name,
            elapsed = ?t0.elapsed(),
            "index rebuild done"
        );
    }

    /// Check-and-set the running flag, also ensuring an entry-list
    /// placeholder exists. `None` when a rebuild is already in flight.
    fn try_begin_rebuild(&self, path_name: &str) -> Option<RunningGuard<'_>> {
        let mut state = self.state.write();
        if !state.running.insert(path_name.to_string()) {
            return None;
        }
        state
            .entries
            .entry(path_name.to_string())
            .or_insert_with(|| Vec::with_capacity(128));
        Some(RunningGuard {
            index: self,
            path_name: path_name.to_string(),
        })
    }

    /// Append one live entry as the recorder produces fragments. Appends
    /// arrive in time order, so no eager sort; rebuild merges re-sort.
    pub fn append_live(&self, path_name: &str, time: DateTime<Utc>, offset: i64) {
        let mut state = self.state.write();
        state
            .entries
            .entry(path_name.to_string())
            .or_insert_with(|| Vec::with_capacity(128))
            .push(IndexEntry { time, offset });
    }

    /// The last known sync point at or before `start`, or 0 when the index
    /// cannot help and the caller must read from the start of the segment.
    ///
    /// Coarse and under-approximating: never returns an offset past the
    /// true target.
    pub fn find_seek_hint(&self, path_name: &str, start: DateTime<Utc>) -> i64 {
        let state = self.state.read();
        let Some(entries) = state.entries.get(path_name) else {
            return 0;
        };

        for (n, entry) in entries.iter().enumerate() {
            if entry.time > start {
                if n > 0 && !entries[n - 1].is_sentinel() {
                    return entries[n - 1].offset;
                }
                break;
            }
        }
        0
    }

    /// Persist the slice of this path's entries covering `[a, b)` as the
    /// sidecar for `segment_path`. Inverted or out-of-range bounds indicate
    /// an index/segment mismatch upstream; they are logged and ignored.
    pub fn extract_range(
        &self,
        path_name: &str,
        segment_path: &Path,
        a: DateTime<Utc>,
        b: DateTime<Utc>,
    ) {
        let slice: Vec<IndexEntry> = {
            let state = self.state.read();
            let Some(entries) = state.entries.get(path_name) else {
                return;
            };

            let mut n0 = entries.len();
            for (n, entry) in entries.iter().enumerate() {
                if entry.time == a {
                    n0 = n;
                    break;
                }
                if entry.time > a {
                    // Back off one entry to include the sync point before
                    // `a`, unless that entry is a sentinel or `a` precedes
                    // everything.
                    n0 = if n == 0 || entries[n - 1].is_sentinel() { n } else { n - 1 };
                    break;
                }
            }

            let n1 = entries[n0.min(entries.len())..]
                .iter()
                .position(|e| e.time >= b)
                .map(|p| n0 + p)
                .unwrap_or(entries.len());

            if n0 >= entries.len() || n1 <= n0 {
                tracing::warn!(
                    path = %path_name,
                    n0,
                    n1,
                    "impossible index bounds, skipping sidecar rewrite"
                );
                return;
            }
            entries[n0..n1].to_vec()
        };

        if let Err(e) = sidecar::write_sidecar(segment_path, &slice) {
            tracing::warn!(path = %path_name, "sidecar write failed: {e}");
        }
    }

    /// Remove the entries of the segment starting at `cut`: from the first
    /// entry at/after `cut` up to (excluding) the next sentinel. Removal
    /// never splits a segment from its anchoring sentinel. Called by the
    /// cleaner after it deletes a segment.
    pub fn prune_prefix(&self, path_name: &str, cut: DateTime<Utc>) {
        let mut state = self.state.write();
        let Some(entries) = state.entries.get_mut(path_name) else {
            return;
        };
        if entries.is_empty() || entries[entries.len() - 1].time < cut {
            return;
        }

        let n0 = match entries.iter().position(|e| e.time >= cut) {
            Some(n) => n,
            None => return,
        };
        let n1 = entries[n0 + 1..]
            .iter()
            .position(|e| e.is_sentinel())
            .map(|p| n0 + 1 + p)
            .unwrap_or(entries.len());

        entries.drain(n0..n1);
    }

    /// Snapshot of a path's entries, or `None` when the path has no index.
    pub fn dump(&self, path_name: &str) -> Option<Vec<IndexEntry>> {
        self.state.read().entries.get(path_name).cloned()
    }

    /// Whether the path currently has an entry list.
    pub fn contains(&self, path_name: &str) -> bool {
        self.state.read().entries.contains_key(path_name)
    }

    /// Whether a rebuild is currently running for the path.
    pub fn is_rebuilding(&self, path_name: &str) -> bool {
        self.state.read().running.contains(path_name)
    }

    /// Discard the current list ahead of an admin-triggered rebuild,
    /// keeping roughly its prior capacity. Returns `false` (and does
    /// nothing) when a rebuild is already running.
    pub fn reset_for_rebuild(&self, path_name: &str) -> bool {
        let mut state = self.state.write();
        if state.running.contains(path_name) {
            return false;
        }
        let prior_len = state.entries.get(path_name).map_or(0, |e| e.len());
        let capacity = 4096.min((prior_len >> 12) << 12).max(128);
        state
            .entries
            .insert(path_name.to_string(), Vec::with_capacity(capacity));
        true
    }

    /// Earliest and latest indexed times for a path, for introspection.
    pub fn time_span(&self, path_name: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let state = self.state.read();
        let entries = state.entries.get(path_name)?;
        Some((entries.first()?.time, entries.last()?.time))
    }
}

/// The index surface the recorder and cleaner depend on. A no-op
/// implementation lets those components run with indexing disabled.
pub trait IndexApi: Send + Sync {
    fn update(&self, path_name: &str, time: DateTime<Utc>, offset: i64);
    fn prune(&self, path_name: &str, cut: DateTime<Utc>);
    fn best_offset(&self, path_name: &str, start: DateTime<Utc>) -> i64;
}

impl IndexApi for TimeIndex {
    fn update(&self, path_name: &str, time: DateTime<Utc>, offset: i64) {
        self.append_live(path_name, time, offset);
    }

    fn prune(&self, path_name: &str, cut: DateTime<Utc>) {
        self.prune_prefix(path_name, cut);
    }

    fn best_offset(&self, path_name: &str, start: DateTime<Utc>) -> i64 {
        self.find_seek_hint(path_name, start)
    }
}

/// Index that indexes nothing.
#[derive(Debug, Default)]
pub struct NoIndex;

impl IndexApi for NoIndex {
    fn update(&self, _: &str, _: DateTime<Utc>, _: i64) {}
    fn prune(&self, _: &str, _: DateTime<Utc>) {}
    fn best_offset(&self, _: &str, _: DateTime<Utc>) -> i64 {
        0
    }
}
