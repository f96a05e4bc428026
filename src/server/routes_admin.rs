//! Admin endpoints for index introspection and maintenance.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::error::Error;
use crate::server::error::AppError;
use crate::server::AppContext;

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    path: String,
}

/// `GET /index/dump?path=` — newline-delimited JSON of the path's index
/// entries, 404 when the path has no index.
pub async fn dump_index(
    State(ctx): State<AppContext>,
    Query(q): Query<PathQuery>,
) -> std::result::Result<Response, AppError> {
    let entries = ctx
        .index
        .dump(&q.path)
        .ok_or_else(|| Error::not_found("index", &q.path))?;

    let mut body = String::with_capacity(entries.len() * 64);
    for entry in &entries {
        let line = serde_json::to_string(entry)
            .map_err(|e| Error::Internal(format!("failed to encode index entry: {e}")))?;
        body.push_str(&line);
        body.push('\n');
    }

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        body,
    )
        .into_response())
}

/// `POST /index/rebuild?path=` — discard the path's in-memory entries and
/// schedule a background rebuild. Returns `202 Accepted` immediately; a
/// rebuild already in flight makes this a no-op.
pub async fn reindex(
    State(ctx): State<AppContext>,
    Query(q): Query<PathQuery>,
) -> std::result::Result<Response, AppError> {
    let path_conf = ctx
        .config
        .find_path_conf(&q.path)
        .ok_or_else(|| Error::not_found("path", &q.path))?
        .clone();

    if ctx.index.reset_for_rebuild(&q.path) {
        let index = ctx.index.clone();
        let finder = ctx.finder.clone();
        let path_name = q.path.clone();
        tokio::task::spawn_blocking(move || {
            index.rebuild_path(&path_name, &path_conf, finder.as_ref());
        });
    } else {
        tracing::info!(path = %q.path, "rebuild already running, request dropped");
    }

    Ok(StatusCode::ACCEPTED.into_response())
}
