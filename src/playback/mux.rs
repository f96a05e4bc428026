//! Muxing parsed segment media into an output byte stream.
//!
//! [`Muxer`] is the seam between the seek-and-mux driver and the concrete
//! output format. The bundled [`Fmp4Muxer`] serializes fragmented MP4 by
//! passthrough: it selects the media fragments overlapping the requested
//! window and copies their `moof`+`mdat` byte ranges verbatim, so its
//! output is a pure function of the source segments and the window, and
//! pass 1 and pass 2 of a range response are guaranteed byte-identical.

use chrono::TimeDelta;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};
use crate::index::scan::{read_tfdt_decode_time, scaled_duration};
use crate::mp4::{walk_boxes, BoxType, SegmentInit, WalkAction, WalkError};

/// Serializer for one logical playback stream, fed init metadata once and
/// then parts from one or more source segments.
pub trait Muxer {
    /// Emit the stream's initialization metadata. Called exactly once,
    /// before any parts.
    fn write_init(&mut self, init: &SegmentInit) -> Result<()>;

    /// Mux parts of the first segment, whose media begins `start_offset`
    /// before the requested start. Reads fragments from the reader's
    /// current position; emits those overlapping `[start_offset,
    /// start_offset + duration)`, including the one covering the window
    /// start. Returns the elapsed time reached, relative to the request
    /// start.
    fn seek_and_mux_parts<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        start_offset: TimeDelta,
        duration: TimeDelta,
        init: &SegmentInit,
    ) -> Result<TimeDelta>;

    /// Mux parts of a subsequent segment that starts `segment_offset`
    /// after the requested start, stopping once `duration` is exhausted.
    /// Returns the elapsed time reached, relative to the request start.
    fn mux_parts<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        segment_offset: TimeDelta,
        duration: TimeDelta,
        init: &SegmentInit,
    ) -> Result<TimeDelta>;

    /// Finalize the stream.
    fn flush(&mut self) -> Result<()>;
}

/// One media fragment located in a segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Part {
    /// Absolute offset of the `moof` header.
    offset: u64,
    /// Absolute offset one past the trailing `mdat`.
    end: u64,
    /// Decode time relative to the segment start.
    start: TimeDelta,
    /// Total sample duration, zero when the fragment declares none.
    duration: TimeDelta,
}

impl Part {
    fn extent(&self) -> TimeDelta {
        self.start + self.duration
    }
}

/// Passthrough fragmented-MP4 muxer writing to `W`.
pub struct Fmp4Muxer<W: Write> {
    w: W,
}

impl<W: Write> Fmp4Muxer<W> {
    pub fn new(w: W) -> Self {
        Self { w }
    }

    pub fn into_inner(self) -> W {
        self.w
    }

    fn copy_part<R: Read + Seek>(&mut self, reader: &mut R, part: &Part) -> Result<()> {
        reader.seek(SeekFrom::Start(part.offset))?;
        let mut region = reader.take(part.end - part.offset);
        io::copy(&mut region, &mut self.w)?;
        Ok(())
    }
}

impl<W: Write> Muxer for Fmp4Muxer<W> {
    fn write_init(&mut self, init: &SegmentInit) -> Result<()> {
        self.w.write_all(&init.raw)?;
        Ok(())
    }

    fn seek_and_mux_parts<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        start_offset: TimeDelta,
        duration: TimeDelta,
        init: &SegmentInit,
    ) -> Result<TimeDelta> {
        let parts = collect_parts(reader, init)?;

        // Start at the last fragment beginning at or before the window
        // start; it covers the start even when its duration is unknown.
        let first = parts
            .iter()
            .rposition(|p| p.start <= start_offset)
            .unwrap_or(0);
        let window_end = start_offset + duration;

        let mut elapsed = TimeDelta::zero();
        for part in &parts[first..] {
            if part.start >= window_end {
                break;
            }
            self.copy_part(reader, part)?;
            elapsed = elapsed.max(part.extent() - start_offset);
        }
        Ok(elapsed)
    }

    fn mux_parts<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        segment_offset: TimeDelta,
        duration: TimeDelta,
        init: &SegmentInit,
    ) -> Result<TimeDelta> {
        let parts = collect_parts(reader, init)?;

        let mut elapsed = segment_offset;
        for part in &parts {
            if segment_offset + part.start >= duration {
                break;
            }
            self.copy_part(reader, part)?;
            elapsed = elapsed.max(segment_offset + part.extent());
        }
        Ok(elapsed)
    }

    fn flush(&mut self) -> Result<()> {
        self.w.flush()?;
        Ok(())
    }
}

/// Locate every media fragment from the reader's current position to the
/// end of the stream. Timing comes from the first `traf` of each `moof`;
/// the fragment extends to the end of the `mdat` that follows it.
fn collect_parts<R: Read + Seek>(reader: &mut R, init: &SegmentInit) -> Result<Vec<Part>> {
    struct Pending {
        offset: u64,
        /// Resolved track time scale; `None` until a readable tfhd names a
        /// declared track, and fragments without one are dropped.
        scale: Option<u32>,
        dt_units: Option<u64>,
        dur_units: u64,
        default_dur: u32,
        trafs_seen: u32,
    }

    let mut parts = Vec::new();
    let mut pending: Option<Pending> = None;

    walk_boxes(reader, &mut |h| match h.box_type() {
        BoxType::MOOF if h.info.depth == 0 => {
            pending = Some(Pending {
                offset: h.info.offset,
                scale: None,
                dt_units: None,
                dur_units: 0,
                default_dur: 0,
                trafs_seen: 0,
            });
            Ok(WalkAction::Descend)
        }
        BoxType::TRAF => {
            let Some(p) = pending.as_mut() else {
                return Ok(WalkAction::Continue);
            };
            p.trafs_seen += 1;
            if p.trafs_seen == 1 {
                Ok(WalkAction::Descend)
            } else {
                Ok(WalkAction::Continue)
            }
        }
        BoxType::TFHD => {
            let payload = h.read_payload()?;
            if let Some(fields) = read_tfhd(&payload) {
                let track = init.track(fields.track_id).ok_or_else(|| {
                    WalkError::Visitor(format!("invalid track ID: {}", fields.track_id))
                })?;
                if let Some(p) = pending.as_mut() {
                    p.scale = Some(track.time_scale);
                    p.default_dur = fields.default_sample_duration;
                }
            }
            Ok(WalkAction::Continue)
        }
        BoxType::TFDT => {
            let payload = h.read_payload()?;
            if let (Some(p), Some(units)) =
                (pending.as_mut(), read_tfdt_decode_time(&payload))
            {
                p.dt_units = Some(units);
            }
            Ok(WalkAction::Continue)
        }
        BoxType::TRUN => {
            let payload = h.read_payload()?;
            if let Some(p) = pending.as_mut() {
                p.dur_units += trun_duration(&payload, p.default_dur).unwrap_or(0);
            }
            Ok(WalkAction::Continue)
        }
        BoxType::MDAT if h.info.depth == 0 => {
            if let Some(p) = pending.take() {
                if let (Some(scale), Some(units)) = (p.scale, p.dt_units) {
                    parts.push(Part {
                        offset: p.offset,
                        end: h.info.end(),
                        start: scaled_duration(units, scale),
                        duration: scaled_duration(p.dur_units, scale),
                    });
                }
            }
            Ok(WalkAction::Continue)
        }
        _ => Ok(WalkAction::Continue),
    })
    .map_err(|e| match e {
        WalkError::Io(source) => Error::Io { source },
        other => Error::Internal(format!("invalid segment media: {other}")),
    })?;

    Ok(parts)
}

struct TfhdFields {
    track_id: u32,
    default_sample_duration: u32,
}

fn read_tfhd(payload: &[u8]) -> Option<TfhdFields> {
    let flags = u32::from_be_bytes([0, *payload.get(1)?, *payload.get(2)?, *payload.get(3)?]);
    let track_id = u32::from_be_bytes(payload.get(4..8)?.try_into().ok()?);

    let mut pos = 8usize;
    if flags & 0x01 != 0 {
        pos += 8; // base_data_offset
    }
    if flags & 0x02 != 0 {
        pos += 4; // sample_description_index
    }
    let default_sample_duration = if flags & 0x08 != 0 {
        u32::from_be_bytes(payload.get(pos..pos + 4)?.try_into().ok()?)
    } else {
        0
    };

    Some(TfhdFields {
        track_id,
        default_sample_duration,
    })
}

/// Total duration covered by one `trun`, summing per-sample durations when
/// present and falling back to `default_dur` per sample otherwise.
fn trun_duration(payload: &[u8], default_dur: u32) -> Option<u64> {
    let flags = u32::from_be_bytes([0, *payload.get(1)?, *payload.get(2)?, *payload.get(3)?]);
    let sample_count = u32::from_be_bytes(payload.get(4..8)?.try_into().ok()?);

    let mut pos = 8usize;
    if flags & 0x000001 != 0 {
        pos += 4; // data_offset
    }
    if flags & 0x000004 != 0 {
        pos += 4; // first_sample_flags
    }

    if flags & 0x000100 == 0 {
        return Some(u64::from(sample_count) * u64::from(default_dur));
    }

    let mut entry_size = 4usize;
    for bit in [0x000200u32, 0x000400, 0x000800] {
        if flags & bit != 0 {
            entry_size += 4;
        }
    }

    let mut total = 0u64;
    for _ in 0..sample_count {
        total += u64::from(u32::from_be_bytes(payload.get(pos..pos + 4)?.try_into().ok()?));
        pos += entry_size;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_early_completion_io;
    use crate::mp4::test_fixtures::{
        container, init_section, raw_box, timed_fragment, timed_segment_bytes,
    };
    use crate::mp4::read_init;
    use crate::playback::range_writer::RangeWriter;
    use std::io::Cursor;

    const SCALE: u32 = 90_000;

    fn secs(s: f64) -> TimeDelta {
        TimeDelta::nanoseconds((s * 1e9) as i64)
    }

    /// Three one-second fragments at t=0,1,2.
    fn sample_segment() -> Vec<u8> {
        timed_segment_bytes(
            SCALE,
            &[
                (0, SCALE, b"aaaa"),
                (90_000, SCALE, b"bbbb"),
                (180_000, SCALE, b"cccc"),
            ],
        )
    }

    fn fragment_bytes(dt: u64, media: &[u8]) -> Vec<u8> {
        timed_fragment(1, dt, &[SCALE], media)
    }

    #[test]
    fn fragment_with_truncated_tfhd_is_not_muxed() {
        let mut data = init_section(&[(1, SCALE)]);

        // Fragment whose tfhd ends before the track id; its tfdt is valid
        // but without a time scale the fragment has no place on the
        // timeline and must be dropped.
        let mut tfdt_payload = vec![1u8, 0, 0, 0];
        tfdt_payload.extend_from_slice(&0u64.to_be_bytes());
        data.extend(container(
            b"moof",
            &[container(
                b"traf",
                &[raw_box(b"tfhd", &[0u8; 4]), raw_box(b"tfdt", &tfdt_payload)],
            )],
        ));
        data.extend(raw_box(b"mdat", b"xxxx"));
        let good = fragment_bytes(90_000, b"aaaa");
        data.extend(&good);

        let mut cursor = Cursor::new(&data);
        let init = read_init(&mut cursor).unwrap();

        let mut m = Fmp4Muxer::new(Vec::new());
        let elapsed = m
            .seek_and_mux_parts(&mut cursor, TimeDelta::zero(), secs(10.0), &init)
            .unwrap();

        assert_eq!(m.into_inner(), good);
        assert_eq!(elapsed, secs(2.0));
    }

    #[test]
    fn muxes_whole_segment_from_time_zero() {
        let data = sample_segment();
        let mut cursor = Cursor::new(&data);
        let init = read_init(&mut cursor).unwrap();

        let mut m = Fmp4Muxer::new(Vec::new());
        m.write_init(&init).unwrap();
        let elapsed = m
            .seek_and_mux_parts(&mut cursor, TimeDelta::zero(), secs(10.0), &init)
            .unwrap();
        m.flush().unwrap();

        // Fragments are contiguous, so the output equals the whole file.
        assert_eq!(m.into_inner(), data);
        assert_eq!(elapsed, secs(3.0));
    }

    #[test]
    fn seek_includes_fragment_covering_window_start() {
        let data = sample_segment();
        let mut cursor = Cursor::new(&data);
        let init = read_init(&mut cursor).unwrap();

        let mut m = Fmp4Muxer::new(Vec::new());
        let elapsed = m
            .seek_and_mux_parts(&mut cursor, secs(1.5), secs(10.0), &init)
            .unwrap();

        // Window starts mid-fragment-1: fragment 0 is dropped, fragments
        // 1 and 2 are emitted.
        let mut expected = fragment_bytes(90_000, b"bbbb");
        expected.extend(fragment_bytes(180_000, b"cccc"));
        assert_eq!(m.into_inner(), expected);
        assert_eq!(elapsed, secs(1.5));
    }

    #[test]
    fn duration_bounds_emitted_fragments() {
        let data = sample_segment();
        let mut cursor = Cursor::new(&data);
        let init = read_init(&mut cursor).unwrap();

        let mut m = Fmp4Muxer::new(Vec::new());
        let elapsed = m
            .seek_and_mux_parts(&mut cursor, TimeDelta::zero(), secs(1.5), &init)
            .unwrap();

        // Fragment 2 starts at t=2, past the window end.
        let mut expected = fragment_bytes(0, b"aaaa");
        expected.extend(fragment_bytes(90_000, b"bbbb"));
        assert_eq!(m.into_inner(), expected);
        // Elapsed reflects the end of the last emitted fragment, which may
        // overshoot the requested duration.
        assert_eq!(elapsed, secs(2.0));
    }

    #[test]
    fn mux_parts_offsets_into_the_request_window() {
        let data = sample_segment();
        let mut cursor = Cursor::new(&data);
        let init = read_init(&mut cursor).unwrap();

        // Segment starts 5s into the request; only 6s were asked for, so
        // fragments at local t=0 (global 5s) fit but local t=1,2 do not.
        let mut m = Fmp4Muxer::new(Vec::new());
        let elapsed = m
            .mux_parts(&mut cursor, secs(5.0), secs(6.0), &init)
            .unwrap();

        assert_eq!(m.into_inner(), fragment_bytes(0, b"aaaa"));
        assert_eq!(elapsed, secs(6.0));
    }

    #[test]
    fn mux_parts_past_duration_emits_nothing() {
        let data = sample_segment();
        let mut cursor = Cursor::new(&data);
        let init = read_init(&mut cursor).unwrap();

        let mut m = Fmp4Muxer::new(Vec::new());
        let elapsed = m
            .mux_parts(&mut cursor, secs(10.0), secs(5.0), &init)
            .unwrap();
        assert!(m.into_inner().is_empty());
        assert_eq!(elapsed, secs(10.0));
    }

    #[test]
    fn write_init_emits_raw_init_section() {
        let data = sample_segment();
        let mut cursor = Cursor::new(&data);
        let init = read_init(&mut cursor).unwrap();

        let mut m = Fmp4Muxer::new(Vec::new());
        m.write_init(&init).unwrap();
        assert_eq!(m.into_inner(), init_section(&[(1, SCALE)]));
    }

    #[test]
    fn unknown_track_id_fails() {
        let mut data = init_section(&[(1, SCALE)]);
        data.extend(timed_fragment(7, 0, &[SCALE], b"xxxx"));
        let mut cursor = Cursor::new(&data);
        let init = read_init(&mut cursor).unwrap();

        let mut m = Fmp4Muxer::new(Vec::new());
        let err = m
            .seek_and_mux_parts(&mut cursor, TimeDelta::zero(), secs(10.0), &init)
            .unwrap_err();
        assert!(err.to_string().contains("invalid track ID"));
    }

    #[test]
    fn sink_early_completion_propagates() {
        let data = sample_segment();
        let mut cursor = Cursor::new(&data);
        let init = read_init(&mut cursor).unwrap();

        // A window satisfied after a handful of bytes makes the sink
        // reject further writes with the early-completion marker.
        let mut m = Fmp4Muxer::new(RangeWriter::range(Vec::new(), 0, Some(9)));
        let err = m
            .seek_and_mux_parts(&mut cursor, TimeDelta::zero(), secs(10.0), &init)
            .unwrap_err();
        match err {
            Error::Io { source } => assert!(is_early_completion_io(&source)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn trun_duration_variants() {
        // Per-sample durations present.
        let mut payload = vec![0u8, 0, 1, 0];
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.extend_from_slice(&3000u32.to_be_bytes());
        payload.extend_from_slice(&4500u32.to_be_bytes());
        assert_eq!(trun_duration(&payload, 0), Some(7500));

        // Durations absent: default applies per sample.
        let mut payload = vec![0u8, 0, 0, 0];
        payload.extend_from_slice(&4u32.to_be_bytes());
        assert_eq!(trun_duration(&payload, 1500), Some(6000));

        // Data offset and sample size fields shift the entry layout.
        let mut payload = vec![0u8, 0, 3, 1];
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.extend_from_slice(&0i32.to_be_bytes()); // data_offset
        payload.extend_from_slice(&100u32.to_be_bytes()); // dur 0
        payload.extend_from_slice(&999u32.to_be_bytes()); // size 0
        payload.extend_from_slice(&200u32.to_be_bytes()); // dur 1
        payload.extend_from_slice(&999u32.to_be_bytes()); // size 1
        assert_eq!(trun_duration(&payload, 0), Some(300));
    }

    #[test]
    fn tfhd_default_duration_offsets() {
        // flags: base_data_offset | default_sample_duration
        let mut payload = vec![0u8, 0, 0, 0x09];
        payload.extend_from_slice(&1u32.to_be_bytes()); // track id
        payload.extend_from_slice(&0u64.to_be_bytes()); // base_data_offset
        payload.extend_from_slice(&2500u32.to_be_bytes());
        let fields = read_tfhd(&payload).unwrap();
        assert_eq!(fields.track_id, 1);
        assert_eq!(fields.default_sample_duration, 2500);
    }
}
