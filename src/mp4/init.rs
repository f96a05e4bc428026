//! Fragmented-MP4 initialization metadata.
//!
//! The init section (`ftyp` + `moov`) declares the segment's tracks and
//! their time scales. [`read_init`] parses it from the start of a segment
//! and leaves the cursor right after `moov`, positioned for a fragment walk.

use std::io::{self, Read, Seek, SeekFrom};

use super::walker::{walk_boxes, BoxType, WalkAction, WalkError};

/// One track declared by the init section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackInit {
    pub id: u32,
    /// Time-scale units per second for this track's decode times.
    pub time_scale: u32,
}

/// Parsed init metadata plus its raw bytes, so a passthrough muxer can emit
/// the section verbatim.
#[derive(Debug, Clone)]
pub struct SegmentInit {
    pub tracks: Vec<TrackInit>,
    /// The exact `ftyp` + `moov` bytes.
    pub raw: Vec<u8>,
}

impl SegmentInit {
    /// Look up a track by id.
    pub fn track(&self, id: u32) -> Option<&TrackInit> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Whether a segment with `other`'s init can be appended to a stream
    /// started with this one: same tracks, same ids, same time scales.
    pub fn compatible_with(&self, other: &SegmentInit) -> bool {
        self.tracks == other.tracks
    }
}

/// Init parsing failure modes.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Walk(#[from] WalkError),

    #[error("I/O error while reading init: {0}")]
    Io(#[from] io::Error),

    #[error("init metadata has no moov box")]
    NoMoov,

    #[error("init metadata declares no tracks")]
    NoTracks,

    #[error("track {id} has no media time scale")]
    MissingTimeScale { id: u32 },
}

/// Parse the init section from the start of `reader`. On success the cursor
/// is positioned at the first byte after `moov`.
pub fn read_init<R: Read + Seek>(reader: &mut R) -> Result<SegmentInit, InitError> {
    reader.seek(SeekFrom::Start(0))?;

    let mut tracks: Vec<TrackInit> = Vec::new();
    let mut moov_end: Option<u64> = None;

    walk_boxes(reader, &mut |h| {
        // A top-level box past moov means the init section is over.
        if h.info.depth == 0 && moov_end.is_some() {
            return Ok(WalkAction::Stop);
        }

        match h.box_type() {
            BoxType::MOOV => {
                moov_end = Some(h.info.end());
                Ok(WalkAction::Descend)
            }
            BoxType::TRAK | BoxType::MDIA => Ok(WalkAction::Descend),
            BoxType::TKHD => {
                let payload = h.read_payload()?;
                let id = read_tkhd_track_id(&payload)
                    .ok_or_else(|| WalkError::Visitor("truncated tkhd box".into()))?;
                tracks.push(TrackInit { id, time_scale: 0 });
                Ok(WalkAction::Continue)
            }
            BoxType::MDHD => {
                let payload = h.read_payload()?;
                let scale = read_mdhd_time_scale(&payload)
                    .ok_or_else(|| WalkError::Visitor("truncated mdhd box".into()))?;
                if let Some(track) = tracks.last_mut() {
                    track.time_scale = scale;
                }
                Ok(WalkAction::Continue)
            }
            _ => Ok(WalkAction::Continue),
        }
    })?;

    let moov_end = moov_end.ok_or(InitError::NoMoov)?;
    if tracks.is_empty() {
        return Err(InitError::NoTracks);
    }
    if let Some(track) = tracks.iter().find(|t| t.time_scale == 0) {
        return Err(InitError::MissingTimeScale { id: track.id });
    }

    // Capture the raw init bytes and leave the cursor after moov.
    reader.seek(SeekFrom::Start(0))?;
    let mut raw = vec![0u8; moov_end as usize];
    reader.read_exact(&mut raw)?;

    Ok(SegmentInit { tracks, raw })
}

fn read_tkhd_track_id(payload: &[u8]) -> Option<u32> {
    let version = *payload.first()?;
    // version/flags, creation, modification precede the track id.
    let at = if version == 1 { 20 } else { 12 };
    let bytes = payload.get(at..at + 4)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

fn read_mdhd_time_scale(payload: &[u8]) -> Option<u32> {
    let version = *payload.first()?;
    let at = if version == 1 { 20 } else { 12 };
    let bytes = payload.get(at..at + 4)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}
