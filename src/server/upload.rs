// Copyright (c) 2026 Lansend
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! `POST /upload`: stream one chunk of one negotiated file to disk.
//!
//! The handler validates the query and the optional `X-Content-Range`
//! header, borrows the file's write handle from the session manager, streams
//! the request body frame by frame (no buffering beyond one frame), and
//! commits the accounting when the chunk ends. The terminal chunk closes the
//! handle, fires the final progress callback and completes the file.
//!
//! Write errors close the handle and answer 500; the session survives and
//! the sender may retry the same range. The on-disk prefix is truncated back
//! to the accounted length so a retry appends at the right offset.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::core::events::{CompletionInfo, ProgressUpdate};
use crate::core::session::{ChunkGrant, OpenMode, SessionError};
use crate::core::types::ContentRange;
use crate::server::routes::{message, AppState};

/// Progress callbacks fire at most this often while a chunk streams.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Strip the descriptor path down to a safe basename: separators of either
/// flavour are honoured, any `..` component is refused, and the last
/// non-empty component wins.
pub fn sanitized_basename(file_name: &str) -> Option<String> {
    let normalized = file_name.replace('\\', "/");
    let mut last = None;
    for part in normalized.split('/') {
        if part == ".." {
            return None;
        }
        if !part.is_empty() && part != "." {
            last = Some(part);
        }
    }
    let base = last?;
    // Belt and braces: a basename must not be able to climb.
    if base.contains("..") {
        return None;
    }
    Some(base.to_string())
}

/// Destination path under `save_dir`, refusing anything that would escape it.
pub fn destination_path(save_dir: &Path, file_name: &str) -> Option<PathBuf> {
    let base = sanitized_basename(file_name)?;
    let dest = save_dir.join(&base);
    if !dest.starts_with(save_dir) {
        return None;
    }
    Some(dest)
}

fn speed(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        // Zero elapsed time reports zero, never NaN or infinity.
        return 0.0;
    }
    bytes as f64 / secs
}

fn map_session_error(e: SessionError) -> Response {
    match e {
        SessionError::NotFound => message(StatusCode::NOT_FOUND, "Session not found"),
        SessionError::FileNotAccepted => message(StatusCode::FORBIDDEN, "File not accepted"),
        SessionError::BadToken => message(StatusCode::FORBIDDEN, "Invalid token"),
        SessionError::IpMismatch => message(StatusCode::FORBIDDEN, "IP address mismatch"),
        SessionError::SizeMismatch => {
            message(StatusCode::BAD_REQUEST, "Range total does not match file size")
        }
        SessionError::OutOfOrder => message(StatusCode::BAD_REQUEST, "Unexpected chunk offset"),
        SessionError::Blocked => message(StatusCode::CONFLICT, "Blocked by another session"),
        SessionError::Rng => message(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
    }
}

/// Axum handler for `POST /upload`.
pub async fn handle_upload(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Response {
    let (Some(session_id), Some(file_id), Some(token)) = (
        params.get("sessionId").cloned(),
        params.get("fileId").cloned(),
        params.get("token").cloned(),
    ) else {
        return message(StatusCode::BAD_REQUEST, "Missing sessionId, fileId or token");
    };

    let range = match request.headers().get("x-content-range") {
        Some(v) => {
            let parsed = v
                .to_str()
                .ok()
                .and_then(|s| ContentRange::parse(s).ok());
            match parsed {
                Some(r) => Some(r),
                None => return message(StatusCode::BAD_REQUEST, "Invalid X-Content-Range"),
            }
        }
        None => None,
    };

    // Resource guard before any state is touched.
    if let Some(len) = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
    {
        if len > state.body_limit {
            return message(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
    }

    let grant = match state
        .sessions
        .begin_chunk(&session_id, &file_id, &token, addr.ip(), range.as_ref())
    {
        Ok(g) => g,
        Err(e) => return map_session_error(e),
    };

    match stream_chunk(&state, &session_id, &file_id, grant, range, request).await {
        Ok(response) => response,
        Err(response) => response,
    }
}

// The grant is already held: every early exit below must release it via
// fail_chunk so the file does not stay marked busy.
async fn stream_chunk(
    state: &Arc<AppState>,
    session_id: &str,
    file_id: &str,
    grant: ChunkGrant,
    range: Option<ContentRange>,
    request: Request,
) -> Result<Response, Response> {
    let fail = |msg: Response| -> Response {
        state.sessions.fail_chunk(session_id, file_id);
        msg
    };

    let Some(dest) = destination_path(&state.save_dir, &grant.file.file_name) else {
        return Err(fail(message(StatusCode::BAD_REQUEST, "Invalid file name")));
    };

    if tokio::fs::create_dir_all(&state.save_dir).await.is_err() {
        return Err(fail(message(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
        )));
    }

    let mut writer = match open_writer(&dest, grant.open).await {
        Ok(w) => w,
        Err(e) => {
            warn!(dest = %dest.display(), err = %e, "open failed");
            return Err(fail(message(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
            )));
        }
    };

    // Bytes this chunk is allowed to carry: the declared range, or the whole
    // descriptor size for a single-shot upload. Anything beyond is rejected.
    let chunk_cap = match &range {
        Some(r) => r.len(),
        None => grant.file.size,
    };

    let mut body = request.into_body().into_data_stream();
    let mut written: u64 = 0;
    let mut last_progress = Instant::now();

    while let Some(frame) = body.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                debug!(err = %e, "body stream error");
                truncate_back(state, session_id, file_id, &dest).await;
                return Err(message(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                ));
            }
        };
        written += frame.len() as u64;
        if written > chunk_cap || written > state.body_limit {
            let (status, text) = if written > chunk_cap {
                (StatusCode::BAD_REQUEST, "Payload exceeds declared size")
            } else {
                (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large")
            };
            truncate_back(state, session_id, file_id, &dest).await;
            return Err(message(status, text));
        }
        if let Err(e) = writer.write_all(&frame).await {
            warn!(dest = %dest.display(), err = %e, "write failed");
            truncate_back(state, session_id, file_id, &dest).await;
            return Err(message(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
            ));
        }

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            last_progress = Instant::now();
            let received = grant.bytes_received + written;
            state.observer.progress(&ProgressUpdate {
                file_id: file_id.to_string(),
                file_name: grant.file.file_name.clone(),
                bytes_received: received,
                total_bytes: grant.file.size,
                bytes_per_second: speed(received, grant.started.elapsed()),
                finished: false,
                completion: None,
            });
        }
    }

    // A ranged chunk must deliver exactly its declared byte count; a short
    // body would desynchronise the append offset.
    if let Some(r) = &range {
        if written != r.len() {
            truncate_back(state, session_id, file_id, &dest).await;
            return Err(message(
                StatusCode::BAD_REQUEST,
                "Body shorter than declared range",
            ));
        }
    }

    if let Err(e) = writer.flush().await {
        warn!(dest = %dest.display(), err = %e, "flush failed");
        truncate_back(state, session_id, file_id, &dest).await;
        return Err(message(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
        ));
    }

    let terminal = match &range {
        Some(r) => r.is_terminal(),
        None => grant.bytes_received + written >= grant.file.size,
    };

    let outcome = match state
        .sessions
        .finish_chunk(session_id, file_id, writer, written, terminal)
    {
        Ok(o) => o,
        // Cancelled while the chunk streamed.
        Err(_) => return Err(message(StatusCode::NOT_FOUND, "Session not found")),
    };

    if terminal {
        let elapsed = outcome.started.elapsed();
        let avg = speed(outcome.bytes_received, elapsed);
        state.observer.progress(&ProgressUpdate {
            file_id: file_id.to_string(),
            file_name: grant.file.file_name.clone(),
            bytes_received: outcome.bytes_received,
            total_bytes: grant.file.size,
            bytes_per_second: avg,
            finished: true,
            completion: Some(CompletionInfo {
                file_path: dest.clone(),
                total_time_seconds: elapsed.as_secs_f64(),
                average_speed: avg,
            }),
        });
        info!(
            file = %dest.display(),
            bytes = outcome.bytes_received,
            session_done = outcome.session_done,
            "file received"
        );
        Ok(message(StatusCode::OK, "File received"))
    } else {
        state.observer.progress(&ProgressUpdate {
            file_id: file_id.to_string(),
            file_name: grant.file.file_name.clone(),
            bytes_received: outcome.bytes_received,
            total_bytes: grant.file.size,
            bytes_per_second: speed(outcome.bytes_received, outcome.started.elapsed()),
            finished: false,
            completion: None,
        });
        Ok((
            StatusCode::OK,
            Json(serde_json::json!({
                "message": "Chunk received",
                "bytesReceived": outcome.bytes_received,
                "totalBytes": grant.file.size,
            })),
        )
            .into_response())
    }
}

async fn open_writer(dest: &Path, mode: OpenMode) -> std::io::Result<File> {
    match mode {
        OpenMode::Truncate => {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(dest)
                .await
        }
        OpenMode::Append => OpenOptions::new().create(true).append(true).open(dest).await,
        OpenMode::Reuse(f) => Ok(f),
    }
}

// Error path: release the grant and trim the file back to the accounted
// prefix so a retried chunk appends at the offset the sender expects.
async fn truncate_back(state: &Arc<AppState>, session_id: &str, file_id: &str, dest: &Path) {
    if let Some(prefix) = state.sessions.fail_chunk(session_id, file_id) {
        if let Ok(f) = OpenOptions::new().write(true).open(dest).await {
            let _ = f.set_len(prefix).await;
        }
    }
}
