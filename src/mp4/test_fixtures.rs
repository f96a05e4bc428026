//! Builders for synthetic fragmented-MP4 byte streams used by tests.
//!
//! The boxes carry just enough structure for the init parser and the
//! fragment scanner: `ftyp` + `moov/trak/tkhd` + `mdia/mdhd` for init, then
//! `moof/traf/tfhd+tfdt` + `mdat` per fragment.

/// A box with the given type and payload.
pub fn raw_box(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
    out.extend_from_slice(box_type);
    out.extend_from_slice(payload);
    out
}

/// A container box holding the given children.
pub fn container(box_type: &[u8; 4], children: &[Vec<u8>]) -> Vec<u8> {
    let payload: Vec<u8> = children.iter().flatten().copied().collect();
    raw_box(box_type, &payload)
}

/// An `ftyp` box with the `isom` major brand.
pub fn ftyp() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(b"isom");
    payload.extend_from_slice(&[0, 0, 0, 1]);
    payload.extend_from_slice(b"iso6");
    raw_box(b"ftyp", &payload)
}

fn tkhd(track_id: u32) -> Vec<u8> {
    let mut payload = vec![0u8; 12]; // version 0, flags, creation, modification
    payload.extend_from_slice(&track_id.to_be_bytes());
    payload.extend_from_slice(&[0u8; 8]); // reserved
    raw_box(b"tkhd", &payload)
}

fn mdhd(time_scale: u32) -> Vec<u8> {
    let mut payload = vec![0u8; 12]; // version 0, flags, creation, modification
    payload.extend_from_slice(&time_scale.to_be_bytes());
    payload.extend_from_slice(&[0u8; 4]); // duration
    raw_box(b"mdhd", &payload)
}

/// An init section (`ftyp` + `moov`) declaring the given `(id, time_scale)`
/// tracks.
pub fn init_section(tracks: &[(u32, u32)]) -> Vec<u8> {
    let traks: Vec<Vec<u8>> = tracks
        .iter()
        .map(|&(id, scale)| {
            container(
                b"trak",
                &[tkhd(id), container(b"mdia", &[mdhd(scale)])],
            )
        })
        .collect();
    let mut out = ftyp();
    out.extend(container(b"moov", &traks));
    out
}

fn tfhd(track_id: u32) -> Vec<u8> {
    let mut payload = vec![0u8; 4]; // version 0, flags
    payload.extend_from_slice(&track_id.to_be_bytes());
    raw_box(b"tfhd", &payload)
}

fn tfdt(base_decode_time: u64) -> Vec<u8> {
    let mut payload = vec![1u8, 0, 0, 0]; // version 1, flags
    payload.extend_from_slice(&base_decode_time.to_be_bytes());
    raw_box(b"tfdt", &payload)
}

fn trun(sample_durations: &[u32]) -> Vec<u8> {
    let mut payload = vec![0u8, 0, 1, 0]; // version 0, sample-duration-present
    payload.extend_from_slice(&(sample_durations.len() as u32).to_be_bytes());
    for dur in sample_durations {
        payload.extend_from_slice(&dur.to_be_bytes());
    }
    raw_box(b"trun", &payload)
}

/// One media fragment: `moof[traf[tfhd, tfdt]]` followed by an `mdat`.
pub fn fragment(track_id: u32, base_decode_time: u64, media: &[u8]) -> Vec<u8> {
    let mut out = container(
        b"moof",
        &[container(b"traf", &[tfhd(track_id), tfdt(base_decode_time)])],
    );
    out.extend(raw_box(b"mdat", media));
    out
}

/// Like [`fragment`], but with a `trun` declaring per-sample durations so
/// the fragment's extent in time is known.
pub fn timed_fragment(
    track_id: u32,
    base_decode_time: u64,
    sample_durations: &[u32],
    media: &[u8],
) -> Vec<u8> {
    let mut out = container(
        b"moof",
        &[container(
            b"traf",
            &[
                tfhd(track_id),
                tfdt(base_decode_time),
                trun(sample_durations),
            ],
        )],
    );
    out.extend(raw_box(b"mdat", media));
    out
}

/// A complete single-track segment: init section plus one fragment per
/// `(base_decode_time, media)` pair, all on track 1.
pub fn segment_bytes(time_scale: u32, fragments: &[(u64, &[u8])]) -> Vec<u8> {
    let mut out = init_section(&[(1, time_scale)]);
    for &(dt, media) in fragments {
        out.extend(fragment(1, dt, media));
    }
    out
}

/// A complete single-track segment whose fragments carry `trun` sample
/// durations: one fragment per `(base_decode_time, total_duration, media)`
/// triple, all on track 1, each with a single sample.
pub fn timed_segment_bytes(time_scale: u32, fragments: &[(u64, u32, &[u8])]) -> Vec<u8> {
    let mut out = init_section(&[(1, time_scale)]);
    for &(dt, dur, media) in fragments {
        out.extend(timed_fragment(1, dt, &[dur], media));
    }
    out
}
