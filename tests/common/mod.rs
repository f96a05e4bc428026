//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`] which sets up a temporary recording tree, a
//! configuration with a single `cam1` path pointing at it, a fresh
//! [`TimeIndex`], and the full Axum router for in-process request testing
//! via `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use chronocast::config::{Config, PathConfig, RecordFormat};
use chronocast::index::TimeIndex;
use chronocast::mp4::test_fixtures::{init_section, timed_fragment, timed_segment_bytes};
use chronocast::playback::segment::segment_file_name;
use chronocast::playback::DiskSegmentFinder;
use chronocast::server::{create_router, AppContext};

/// 90kHz media timescale, one fragment per second in the stock segment.
pub const SCALE: u32 = 90_000;

/// Recording start time shared by the tests; segments are written at fixed
/// offsets from it.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 8, 20, 14, 30, 0).unwrap()
}

pub fn ts(offset_secs: i64) -> DateTime<Utc> {
    base_time() + chrono::TimeDelta::seconds(offset_secs)
}

/// Test harness wrapping a fully-constructed [`AppContext`] backed by a
/// temporary recording directory.
pub struct TestHarness {
    pub ctx: AppContext,
    pub router: Router,
    tmp: TempDir,
}

impl TestHarness {
    /// Create a new harness with a single fMP4 path named `cam1`.
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = Config::default();
        config.paths.insert(
            "cam1".to_string(),
            PathConfig {
                record_path: tmp.path().to_path_buf(),
                record_format: RecordFormat::Fmp4,
                concat_tolerance_secs: 1.0,
            },
        );

        let ctx = AppContext {
            config: Arc::new(config),
            index: Arc::new(TimeIndex::new()),
            finder: Arc::new(DiskSegmentFinder),
        };
        let router = create_router(ctx.clone());
        Self { ctx, router, tmp }
    }

    /// Write the stock three-fragment segment (one second per fragment,
    /// track 1, `media` repeated) starting at `start`. Returns the file's
    /// bytes.
    pub fn write_segment(&self, path_name: &str, start: DateTime<Utc>, media: &[u8]) -> Vec<u8> {
        let bytes = timed_segment_bytes(
            SCALE,
            &[
                (0, SCALE, media),
                (SCALE as u64, SCALE, media),
                (2 * SCALE as u64, SCALE, media),
            ],
        );
        self.write_segment_bytes(path_name, start, &bytes);
        bytes
    }

    /// Write arbitrary segment bytes under the path's recording directory.
    pub fn write_segment_bytes(&self, path_name: &str, start: DateTime<Utc>, bytes: &[u8]) {
        let dir = self.tmp.path().join(path_name);
        std::fs::create_dir_all(&dir).expect("failed to create segment dir");
        std::fs::write(dir.join(segment_file_name(start)), bytes)
            .expect("failed to write segment");
    }

    /// Issue a request against the router and collect the full body.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        range: Option<&str>,
    ) -> (StatusCode, HeaderMap, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(value) = range {
            builder = builder.header(header::RANGE, value);
        }
        let request = builder.body(Body::empty()).expect("failed to build request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("request failed");
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("failed to collect body")
            .to_bytes()
            .to_vec();
        (status, headers, body)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, HeaderMap, Vec<u8>) {
        self.request(Method::GET, uri, None).await
    }
}

/// The fragment region of the stock segment (everything after the init
/// section), for building expected concatenation output.
pub fn stock_fragments(media: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for dt in [0u64, SCALE as u64, 2 * SCALE as u64] {
        out.extend(timed_fragment(1, dt, &[SCALE], media));
    }
    out
}

/// Init section matching the stock segment's single track.
pub fn stock_init() -> Vec<u8> {
    init_section(&[(1, SCALE)])
}

/// Playback URI for `cam1` at an offset from [`base_time`].
pub fn get_uri(start_offset_secs: i64, duration: &str) -> String {
    format!(
        "/get?path=cam1&start={}&duration={duration}",
        ts(start_offset_secs).format("%Y-%m-%dT%H:%M:%SZ")
    )
}
