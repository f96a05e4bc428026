//! Driving a muxer across one or more recorded segments.
//!
//! Given time-ordered candidate segments, a start time and a duration, the
//! driver emits one logical stream: init metadata from the first segment,
//! then parts from each segment in turn, for as long as consecutive
//! segments remain append-compatible and temporally contiguous. A
//! compatibility or contiguity break is end-of-available-data, not an
//! error.

use chrono::{DateTime, TimeDelta, Utc};
use std::fs::File;

use crate::config::RecordFormat;
use crate::error::{Error, Result};
use crate::index::TimeIndex;
use crate::mp4::{read_init, SegmentInit};
use crate::playback::mux::Muxer;
use crate::playback::segment::Segment;

/// Whether `init` can be appended to a stream started from `first_init`
/// that has reached `prev_end`: identical track layout, and the segment
/// starts within `tolerance` of where the previous one left off.
fn can_concatenate(
    first_init: &SegmentInit,
    prev_end: DateTime<Utc>,
    init: &SegmentInit,
    segment_start: DateTime<Utc>,
    tolerance: TimeDelta,
) -> bool {
    if !init.compatible_with(first_init) {
        return false;
    }
    (segment_start - prev_end).abs() <= tolerance
}

fn open_segment(segment: &Segment) -> Result<(File, SegmentInit)> {
    let mut file = File::open(&segment.fpath)?;
    let init = read_init(&mut file)
        .map_err(|e| Error::scan(segment.fpath.display(), e))?;
    Ok((file, init))
}

/// Mux the stream for `[start, start + duration)` out of `segments`.
///
/// The first segment is seeked via the index's hint before scanning;
/// subsequent segments are muxed whole-file relative to the request start.
/// Propagates every failure except what the muxer's sink signals itself
/// (early completion, client disconnect), which callers inspect on the
/// returned error.
#[allow(clippy::too_many_arguments)]
pub fn seek_and_mux<M: Muxer>(
    record_format: RecordFormat,
    path_name: &str,
    segments: &[Segment],
    start: DateTime<Utc>,
    duration: TimeDelta,
    index: &TimeIndex,
    muxer: &mut M,
    tolerance: TimeDelta,
) -> Result<()> {
    if record_format != RecordFormat::Fmp4 {
        return Err(Error::UnsupportedFormat(record_format.to_string()));
    }
    let Some(first_segment) = segments.first() else {
        return Err(Error::NoSegmentsFound);
    };

    let (mut file, first_init) = open_segment(first_segment)?;
    muxer.write_init(&first_init)?;

    let segment_start_offset = start - first_segment.start;

    let hint = index.find_seek_hint(path_name, start);
    if hint != 0 {
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(hint as u64))?;
    }

    let elapsed =
        muxer.seek_and_mux_parts(&mut file, segment_start_offset, duration, &first_init)?;
    let mut segment_end = start + elapsed;

    for seg in &segments[1..] {
        let (mut file, init) = open_segment(seg)?;

        if !can_concatenate(&first_init, segment_end, &init, seg.start, tolerance) {
            tracing::debug!(
                path = %path_name,
                segment = %seg.fpath.display(),
                "segment not contiguous, stopping concatenation"
            );
            break;
        }

        let segment_offset = seg.start - start;
        let elapsed = muxer.mux_parts(&mut file, segment_offset, duration, &first_init)?;
        segment_end = start + elapsed;
    }

    muxer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4::test_fixtures::{init_section, timed_fragment, timed_segment_bytes};
    use crate::playback::mux::Fmp4Muxer;
    use crate::playback::segment::segment_file_name;
    use chrono::{TimeZone, Utc};
    use std::path::Path;

    const SCALE: u32 = 90_000;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_755_700_200 + secs, 0).unwrap()
    }

    fn secs(s: f64) -> TimeDelta {
        TimeDelta::nanoseconds((s * 1e9) as i64)
    }

    fn tolerance() -> TimeDelta {
        TimeDelta::seconds(1)
    }

    /// Write a three-fragment, three-second segment starting at `start`.
    fn write_segment(dir: &Path, start: DateTime<Utc>, media: &[u8]) -> Segment {
        let data = timed_segment_bytes(
            SCALE,
            &[(0, SCALE, media), (90_000, SCALE, media), (180_000, SCALE, media)],
        );
        let fpath = dir.join(segment_file_name(start));
        std::fs::write(&fpath, data).unwrap();
        Segment { fpath, start }
    }

    fn mux_to_vec(
        segments: &[Segment],
        start: DateTime<Utc>,
        duration: TimeDelta,
        index: &TimeIndex,
    ) -> Result<Vec<u8>> {
        let mut muxer = Fmp4Muxer::new(Vec::new());
        seek_and_mux(
            RecordFormat::Fmp4,
            "cam1",
            segments,
            start,
            duration,
            index,
            &mut muxer,
            tolerance(),
        )?;
        Ok(muxer.into_inner())
    }

    #[test]
    fn rejects_non_fmp4_formats() {
        let index = TimeIndex::new();
        let mut muxer = Fmp4Muxer::new(Vec::new());
        let err = seek_and_mux(
            RecordFormat::Mpegts,
            "cam1",
            &[],
            ts(0),
            secs(1.0),
            &index,
            &mut muxer,
            tolerance(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn no_segments_is_an_error() {
        let index = TimeIndex::new();
        let err = mux_to_vec(&[], ts(0), secs(1.0), &index).unwrap_err();
        assert!(matches!(err, Error::NoSegmentsFound));
    }

    #[test]
    fn single_segment_from_its_start() {
        let tmp = tempfile::tempdir().unwrap();
        let seg = write_segment(tmp.path(), ts(0), b"aaaa");
        let index = TimeIndex::new();

        let out = mux_to_vec(&[seg.clone()], ts(0), secs(10.0), &index).unwrap();
        assert_eq!(out, std::fs::read(&seg.fpath).unwrap());
    }

    #[test]
    fn contiguous_segments_concatenate_without_repeating_init() {
        let tmp = tempfile::tempdir().unwrap();
        // Second segment starts exactly where the first ends.
        let seg1 = write_segment(tmp.path(), ts(0), b"aaaa");
        let seg2 = write_segment(tmp.path(), ts(3), b"bbbb");
        let index = TimeIndex::new();

        let out = mux_to_vec(&[seg1, seg2], ts(0), secs(10.0), &index).unwrap();

        let mut expected = init_section(&[(1, SCALE)]);
        for dt in [0u64, 90_000, 180_000] {
            expected.extend(timed_fragment(1, dt, &[SCALE], b"aaaa"));
        }
        for dt in [0u64, 90_000, 180_000] {
            expected.extend(timed_fragment(1, dt, &[SCALE], b"bbbb"));
        }
        assert_eq!(out, expected);
    }

    #[test]
    fn gap_beyond_tolerance_stops_after_first_segment() {
        let tmp = tempfile::tempdir().unwrap();
        let seg1 = write_segment(tmp.path(), ts(0), b"aaaa");
        // 2s gap between first segment end (t=3) and second start (t=5).
        let seg2 = write_segment(tmp.path(), ts(5), b"bbbb");
        let index = TimeIndex::new();

        let out = mux_to_vec(&[seg1.clone(), seg2], ts(0), secs(10.0), &index).unwrap();
        assert_eq!(out, std::fs::read(&seg1.fpath).unwrap());
    }

    #[test]
    fn gap_within_tolerance_concatenates() {
        let tmp = tempfile::tempdir().unwrap();
        let seg1 = write_segment(tmp.path(), ts(0), b"aaaa");
        // 0.5s gap, inside the 1s tolerance.
        let seg2 = Segment {
            start: ts(3) + TimeDelta::milliseconds(500),
            ..write_segment(tmp.path(), ts(4), b"bbbb")
        };
        let index = TimeIndex::new();

        let out = mux_to_vec(&[seg1.clone(), seg2.clone()], ts(0), secs(10.0), &index).unwrap();
        let seg1_len = std::fs::read(&seg1.fpath).unwrap().len();
        assert!(out.len() > seg1_len);
    }

    #[test]
    fn incompatible_init_stops_concatenation() {
        let tmp = tempfile::tempdir().unwrap();
        let seg1 = write_segment(tmp.path(), ts(0), b"aaaa");

        // Second segment declares a different track layout.
        let mut data = init_section(&[(2, SCALE)]);
        data.extend(timed_fragment(2, 0, &[SCALE], b"bbbb"));
        let fpath = tmp.path().join(segment_file_name(ts(3)));
        std::fs::write(&fpath, data).unwrap();
        let seg2 = Segment { fpath, start: ts(3) };

        let index = TimeIndex::new();
        let out = mux_to_vec(&[seg1.clone(), seg2], ts(0), secs(10.0), &index).unwrap();
        assert_eq!(out, std::fs::read(&seg1.fpath).unwrap());
    }

    #[test]
    fn seek_hint_bounds_the_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let seg = write_segment(tmp.path(), ts(0), b"aaaa");

        // Fragment byte offsets within the file.
        let init_len = init_section(&[(1, SCALE)]).len() as i64;
        let frag_len = timed_fragment(1, 0, &[SCALE], b"aaaa").len() as i64;
        let frag2_offset = init_len + 2 * frag_len;

        let index = TimeIndex::new();
        index.append_live("cam1", ts(0), 0);
        index.append_live("cam1", ts(2), frag2_offset);
        index.append_live("cam1", ts(3), 0);

        // The hint points at the third fragment, so earlier fragments are
        // never visited even though the requested start precedes them.
        let out = mux_to_vec(&[seg], ts(2) + TimeDelta::milliseconds(100), secs(10.0), &index)
            .unwrap();
        let mut expected = init_section(&[(1, SCALE)]);
        expected.extend(timed_fragment(1, 180_000, &[SCALE], b"aaaa"));
        assert_eq!(out, expected);
    }
}
