//! Recording segment identity and discovery.
//!
//! The core treats a segment as opaque: a file location plus a wall-clock
//! start time. Discovery of which segment files exist is a collaborator
//! concern behind [`SegmentFinder`]; [`DiskSegmentFinder`] is the bundled
//! filesystem implementation (segment files named by their start time under
//! a per-path directory).

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use std::path::PathBuf;
use walkdir::WalkDir;

use crate::config::PathConfig;
use crate::error::{Error, Result};

/// File-name timestamp layout for on-disk segments, microsecond precision.
pub const SEGMENT_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S-%6f";

/// Extension of recording segment files.
pub const SEGMENT_EXT: &str = "mp4";

/// One recording segment on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Location of the segment file.
    pub fpath: PathBuf,
    /// Wall-clock time of the segment's first sample.
    pub start: DateTime<Utc>,
}

/// Discovery of the segments recorded for a path.
///
/// Implementations must return segments ordered by start time.
pub trait SegmentFinder: Send + Sync {
    /// All segments recorded for `path_name`.
    fn find_segments(&self, path_conf: &PathConfig, path_name: &str) -> Result<Vec<Segment>>;

    /// The segments overlapping `[start, start + duration)`, including the
    /// one already in progress at `start`.
    fn find_segments_in_timespan(
        &self,
        path_conf: &PathConfig,
        path_name: &str,
        start: DateTime<Utc>,
        duration: TimeDelta,
    ) -> Result<Vec<Segment>>;
}

/// Filesystem-backed segment finder.
#[derive(Debug, Default)]
pub struct DiskSegmentFinder;

impl DiskSegmentFinder {
    /// Parse a segment start time out of a file name stem.
    pub fn parse_start(stem: &str) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(stem, SEGMENT_TIME_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    fn segment_dir(path_conf: &PathConfig, path_name: &str) -> PathBuf {
        path_conf.record_path.join(path_name)
    }
}

impl SegmentFinder for DiskSegmentFinder {
    fn find_segments(&self, path_conf: &PathConfig, path_name: &str) -> Result<Vec<Segment>> {
        let dir = Self::segment_dir(path_conf, path_name);
        if !dir.is_dir() {
            return Err(Error::NoSegmentsFound);
        }

        let mut segments = Vec::new();
        for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(start) = Self::parse_start(stem) else {
                tracing::debug!(file = %path.display(), "skipping segment with unparseable name");
                continue;
            };
            segments.push(Segment {
                fpath: path.to_path_buf(),
                start,
            });
        }

        if segments.is_empty() {
            return Err(Error::NoSegmentsFound);
        }
        segments.sort_by_key(|s| s.start);
        Ok(segments)
    }

    fn find_segments_in_timespan(
        &self,
        path_conf: &PathConfig,
        path_name: &str,
        start: DateTime<Utc>,
        duration: TimeDelta,
    ) -> Result<Vec<Segment>> {
        let all = self.find_segments(path_conf, path_name)?;
        let window_end = start + duration;

        // Keep the segment already in progress at `start` plus everything
        // that begins inside the window.
        let first = all
            .iter()
            .rposition(|s| s.start <= start)
            .unwrap_or(0);
        let selected: Vec<Segment> = all
            .into_iter()
            .skip(first)
            .filter(|s| s.start < window_end)
            .collect();

        if selected.is_empty() {
            return Err(Error::NoSegmentsFound);
        }
        Ok(selected)
    }
}

/// Build the on-disk file name for a segment starting at `start`.
pub fn segment_file_name(start: DateTime<Utc>) -> String {
    format!("{}.{SEGMENT_EXT}", start.format(SEGMENT_TIME_FORMAT))
}

/// Type-erased convenience for collaborators holding a finder.
pub type SharedSegmentFinder = std::sync::Arc<dyn SegmentFinder>;
