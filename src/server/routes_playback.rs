//! Playback endpoints: `GET /get` and `HEAD /get`.
//!
//! A request names a path, an RFC3339 start time and a duration; the
//! response is one fragmented-MP4 stream muxed out of every recorded
//! segment overlapping that window. `Range: bytes=a-b` headers are honored
//! with a two-pass protocol: a counting pass establishes the total body
//! length (muxing is a pure function of the request, so both passes
//! produce identical bytes), then an emitting pass streams only the
//! requested window. Malformed range syntax degrades to a full 200
//! response. HEAD runs the counting pass only.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use std::io::{self, Write};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::PathConfig;
use crate::error::{Error, Result};
use crate::playback::{seek_and_mux, Fmp4Muxer, RangeWriter, Segment};
use crate::server::error::AppError;
use crate::server::AppContext;

const CONTENT_TYPE_MP4: &str = "video/mp4";

/// Bounded handoff between the blocking mux task and the response body.
const BODY_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Deserialize)]
pub struct PlaybackQuery {
    path: String,
    start: String,
    duration: String,
    #[serde(default)]
    format: Option<String>,
}

/// Parsed and validated playback request.
struct PlaybackRequest {
    path_name: String,
    path_conf: PathConfig,
    start: DateTime<Utc>,
    duration: TimeDelta,
    segments: Vec<Segment>,
}

fn resolve_request(ctx: &AppContext, q: &PlaybackQuery) -> Result<PlaybackRequest> {
    let start = DateTime::parse_from_rfc3339(&q.start)
        .map_err(|e| Error::Validation(format!("invalid start: {e}")))?
        .with_timezone(&Utc);
    let duration = parse_duration(&q.duration)?;

    match q.format.as_deref() {
        None | Some("") | Some("fmp4") => {}
        Some("mp4") => {
            return Err(Error::Validation(
                "format=mp4 requires a progressive-MP4 muxer, which this build does not \
                 bundle; use format=fmp4"
                    .to_string(),
            ))
        }
        Some(other) => {
            return Err(Error::Validation(format!("invalid format: {other}")));
        }
    }

    let path_conf = ctx
        .config
        .find_path_conf(&q.path)
        .ok_or_else(|| Error::Validation(format!("path not configured: {}", q.path)))?
        .clone();

    let segments = ctx
        .finder
        .find_segments_in_timespan(&path_conf, &q.path, start, duration)?;

    Ok(PlaybackRequest {
        path_name: q.path.clone(),
        path_conf,
        start,
        duration,
        segments,
    })
}

/// Parse a duration given as decimal seconds (`"120"`, `"1.5"`) or as a
/// structured string with hour/minute/second units (`"1h20m30s"`,
/// `"500ms"`).
fn parse_duration(raw: &str) -> Result<TimeDelta> {
    if let Ok(secs) = raw.parse::<f64>() {
        if !secs.is_finite() || secs < 0.0 {
            return Err(Error::Validation(format!("invalid duration: {raw}")));
        }
        return Ok(TimeDelta::nanoseconds((secs * 1e9) as i64));
    }
    parse_structured_duration(raw)
        .ok_or_else(|| Error::Validation(format!("invalid duration: {raw}")))
}

fn parse_structured_duration(raw: &str) -> Option<TimeDelta> {
    // Longest suffix first so "ms" wins over "m" and "ns"/"us" over "s".
    const UNITS: [(&str, f64); 6] = [
        ("ns", 1e-9),
        ("us", 1e-6),
        ("ms", 1e-3),
        ("s", 1.0),
        ("m", 60.0),
        ("h", 3600.0),
    ];

    if raw.is_empty() {
        return None;
    }

    let mut total = 0f64;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let value: f64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let (unit, scale) = UNITS.iter().find(|(u, _)| rest.starts_with(u)).copied()?;
        rest = &rest[unit.len()..];
        total += value * scale;
    }

    if !total.is_finite() || total < 0.0 {
        return None;
    }
    Some(TimeDelta::nanoseconds((total * 1e9) as i64))
}

/// Parse `Range: bytes=<start>-[<end>]`. Anything else, including suffix
/// ranges and inverted bounds, yields `None` and the caller serves the full
/// body.
fn parse_range_header(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.strip_prefix("bytes=")?;
    let (start_s, end_s) = rest.split_once('-')?;
    let start = start_s.trim().parse::<u64>().ok()?;
    let end = if end_s.trim().is_empty() {
        None
    } else {
        Some(end_s.trim().parse::<u64>().ok()?)
    };
    if end.is_some_and(|e| e < start) {
        return None;
    }
    Some((start, end))
}

/// `Write` adapter feeding the response body channel. A closed channel
/// means the client went away; surfaced as `BrokenPipe` so the mux loop
/// stops.
struct ChannelSink {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run_mux<W: Write>(
    ctx: &AppContext,
    req: &PlaybackRequest,
    muxer: &mut Fmp4Muxer<W>,
) -> Result<()> {
    seek_and_mux(
        req.path_conf.record_format,
        &req.path_name,
        &req.segments,
        req.start,
        req.duration,
        &ctx.index,
        muxer,
        req.path_conf.concat_tolerance(),
    )
}

/// Counting pass: total body length for this request.
async fn measure_length(ctx: AppContext, req: &PlaybackRequest) -> Result<u64> {
    let req = clone_request(req);
    tokio::task::spawn_blocking(move || -> Result<u64> {
        let mut muxer = Fmp4Muxer::new(RangeWriter::counting());
        run_mux(&ctx, &req, &mut muxer)?;
        Ok(muxer.into_inner().position())
    })
    .await
    .map_err(|e| Error::Internal(format!("mux task panicked: {e}")))?
}

/// Emitting pass: stream the window `[offset, offset2]` (or everything
/// when `None`) into a response body. Failures here are logged only; the
/// status line is already committed.
fn stream_body(ctx: AppContext, req: &PlaybackRequest, window: Option<(u64, u64)>) -> Body {
    let req = clone_request(req);
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(BODY_CHANNEL_CAPACITY);

    tokio::task::spawn_blocking(move || {
        let sink = match window {
            Some((offset, offset2)) => {
                RangeWriter::range(ChannelSink { tx }, offset, Some(offset2))
            }
            None => RangeWriter::full(ChannelSink { tx }),
        };
        let mut muxer = Fmp4Muxer::new(sink);
        match run_mux(&ctx, &req, &mut muxer) {
            Ok(()) => {}
            Err(e) if e.is_early_completion() || e.is_disconnect() => {}
            Err(e) => {
                tracing::error!(path = %req.path_name, "mux failed mid-response: {e}");
            }
        }
    });

    Body::from_stream(ReceiverStream::new(rx))
}

fn clone_request(req: &PlaybackRequest) -> PlaybackRequest {
    PlaybackRequest {
        path_name: req.path_name.clone(),
        path_conf: req.path_conf.clone(),
        start: req.start,
        duration: req.duration,
        segments: req.segments.clone(),
    }
}

/// Kick off a background index rebuild the first time a path is played.
fn schedule_initial_rebuild(ctx: &AppContext, req: &PlaybackRequest) {
    if ctx.index.contains(&req.path_name) {
        return;
    }
    let index = ctx.index.clone();
    let finder = ctx.finder.clone();
    let path_name = req.path_name.clone();
    let path_conf = req.path_conf.clone();
    tokio::task::spawn_blocking(move || {
        index.rebuild_path(&path_name, &path_conf, finder.as_ref());
    });
}

pub async fn on_get(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Query(q): Query<PlaybackQuery>,
) -> std::result::Result<Response, AppError> {
    let req = resolve_request(&ctx, &q)?;
    schedule_initial_rebuild(&ctx, &req);

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_header);

    let Some((offset, end)) = range else {
        let body = stream_body(ctx, &req, None);
        return Ok((
            StatusCode::OK,
            [
                (header::ACCEPT_RANGES, "bytes".to_string()),
                (header::CONTENT_TYPE, CONTENT_TYPE_MP4.to_string()),
            ],
            body,
        )
            .into_response());
    };

    let length = measure_length(ctx.clone(), &req).await?;
    if offset >= length {
        return Ok((
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{length}"))],
        )
            .into_response());
    }
    let offset2 = end.unwrap_or(length - 1).min(length - 1);

    let body = stream_body(ctx, &req, Some((offset, offset2)));
    Ok((
        StatusCode::PARTIAL_CONTENT,
        [
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (header::CONTENT_TYPE, CONTENT_TYPE_MP4.to_string()),
            (
                header::CONTENT_RANGE,
                format!("bytes {offset}-{offset2}/{length}"),
            ),
            (header::CONTENT_LENGTH, (offset2 - offset + 1).to_string()),
        ],
        body,
    )
        .into_response())
}

pub async fn on_head(
    State(ctx): State<AppContext>,
    Query(q): Query<PlaybackQuery>,
) -> std::result::Result<Response, AppError> {
    let req = resolve_request(&ctx, &q)?;
    let length = measure_length(ctx, &req).await?;

    Ok((
        StatusCode::OK,
        [
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (header::CONTENT_TYPE, CONTENT_TYPE_MP4.to_string()),
            (header::CONTENT_LENGTH, length.to_string()),
        ],
    )
        .into_response())
}
