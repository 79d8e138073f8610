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

//! The five protocol endpoints under `/api/localsend/v2`.
//!
//! | Method | Path              | Handler |
//! |--------|-------------------|---------|
//! | GET    | `/info`           | this node's descriptor |
//! | POST   | `/register`       | descriptor exchange (also a discovery signal) |
//! | POST   | `/prepare-upload` | PIN / acceptance / session creation |
//! | POST   | `/upload`         | chunk streaming ([`crate::server::upload`]) |
//! | POST   | `/cancel`         | session teardown |
//!
//! Bodies are parsed by hand so every rejection carries the protocol's
//! `{message}` JSON shape.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::core::events::TransferObserver;
use crate::core::session::{SessionError, SessionManager};
use crate::core::types::{DeviceInfo, Pin, PrepareUploadRequest, PrepareUploadResponse};
use crate::networking::registry::PeerRegistry;
use crate::server::upload;

/// Shared state of the serving side.
pub struct AppState {
    /// This node's advertised descriptor.
    pub device: DeviceInfo,
    /// The session table.
    pub sessions: Arc<SessionManager>,
    /// The peer registry (register calls feed it).
    pub registry: Arc<PeerRegistry>,
    /// Host callbacks.
    pub observer: TransferObserver,
    /// Required PIN, if configured.
    pub pin: Option<Pin>,
    /// Destination directory for received files.
    pub save_dir: PathBuf,
    /// Upload body-size limit in bytes.
    pub body_limit: u64,
}

/// JSON `{message}` response with a status.
pub fn message(status: StatusCode, text: &str) -> Response {
    (status, Json(serde_json::json!({ "message": text }))).into_response()
}

/// Router over the protocol surface.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/localsend/v2/info", get(info))
        .route("/api/localsend/v2/register", post(register))
        .route("/api/localsend/v2/prepare-upload", post(prepare_upload))
        .route("/api/localsend/v2/upload", post(upload::handle_upload))
        .route("/api/localsend/v2/cancel", post(cancel))
        .with_state(state)
}

async fn info(State(state): State<Arc<AppState>>) -> Json<DeviceInfo> {
    Json(state.device.clone())
}

async fn register(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let mut peer: DeviceInfo = match serde_json::from_slice(&body) {
        Ok(d) => d,
        Err(_) => return message(StatusCode::BAD_REQUEST, "Invalid body"),
    };

    if peer.fingerprint != state.device.fingerprint {
        peer.ip = Some(addr.ip());
        state.registry.insert(peer);
    }
    Json(state.device.clone()).into_response()
}

fn pin_matches(required: &Pin, supplied: Option<&str>) -> bool {
    match supplied {
        Some(p) => {
            p.len() == required.0.len() && p.as_bytes().ct_eq(required.0.as_bytes()).into()
        }
        None => false,
    }
}

async fn prepare_upload(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let req: PrepareUploadRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(_) => return message(StatusCode::BAD_REQUEST, "Invalid body"),
    };

    let mut sender = req.info;
    sender.ip = Some(addr.ip());

    // Contention check up front: a blocked peer never reaches the PIN or
    // the host prompt.
    if state.sessions.would_block(addr.ip()) {
        return message(StatusCode::CONFLICT, "Blocked by another session");
    }

    if let Some(required) = &state.pin {
        // A configured PIN replaces interactive confirmation; the observer
        // is not consulted on this path.
        if !pin_matches(required, params.get("pin").map(String::as_str)) {
            debug!(peer = %addr.ip(), "prepare-upload with missing or wrong pin");
            return message(StatusCode::UNAUTHORIZED, "PIN required");
        }
    } else {
        let files: Vec<_> = req.files.values().cloned().collect();
        if !state.observer.request(&sender, &files) {
            info!(peer = %addr.ip(), alias = %sender.alias, "transfer rejected");
            return message(StatusCode::FORBIDDEN, "Rejected");
        }
    }

    if req.files.is_empty() {
        // Nothing to send; accepted without a session.
        return StatusCode::NO_CONTENT.into_response();
    }

    match state.sessions.create_session(sender, addr.ip(), req.files) {
        Ok(created) => Json(PrepareUploadResponse {
            session_id: created.session_id,
            files: created.tokens,
        })
        .into_response(),
        Err(SessionError::Blocked) => {
            message(StatusCode::CONFLICT, "Blocked by another session")
        }
        Err(e) => {
            warn!(err = %e, "session creation failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(session_id) = params.get("sessionId") else {
        return message(StatusCode::BAD_REQUEST, "Missing sessionId");
    };
    // Idempotent: cancelling an unknown session is indistinguishable from
    // cancelling one that just completed.
    state.sessions.cancel(session_id);
    message(StatusCode::OK, "Session canceled")
}
