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

//! Inbound session manager.
//!
//! ## Ownership
//! The manager exclusively owns session state and every open write handle.
//! All mutation happens under one mutex with O(1) hold time; file I/O never
//! runs under the lock. The upload handler borrows a write handle for the
//! duration of exactly one chunk via [`SessionManager::begin_chunk`] /
//! [`SessionManager::finish_chunk`]; the in-order chunk property makes that
//! borrow exclusive.
//!
//! ## Admission
//! Single-peer-at-a-time: while any session for address A is active, a
//! prepare-upload from address B ≠ A answers "blocked" (HTTP 409 upstream).
//! A second prepare-upload from A itself replaces A's session.
//!
//! ## Lifetime
//! A session dies when every accepted file has been received, on explicit
//! cancel, when idle longer than the configured TTL, or at process exit.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::fs::File;
use tracing::{debug, info};

use crate::core::identity::{self, IdentityError};
use crate::core::types::{ContentRange, DeviceInfo, FileInfo};
use crate::monitoring::metrics::Metrics;

/// Session state errors, mapped to HTTP statuses by the server facade.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Unknown or already-destroyed session.
    #[error("session not found")]
    NotFound,
    /// File id was not part of the negotiated set.
    #[error("file not accepted")]
    FileNotAccepted,
    /// Token does not match the one issued for this file.
    #[error("bad token")]
    BadToken,
    /// Request source differs from the negotiating peer.
    #[error("ip mismatch")]
    IpMismatch,
    /// Another peer's session is active.
    #[error("blocked by another session")]
    Blocked,
    /// Chunk start does not continue the received prefix, or the file is
    /// already mid-chunk.
    #[error("out of order chunk")]
    OutOfOrder,
    /// Range total disagrees with the negotiated descriptor size.
    #[error("size mismatch")]
    SizeMismatch,
    /// System RNG failure while minting ids.
    #[error("rng")]
    Rng,
}

impl From<IdentityError> for SessionError {
    fn from(_: IdentityError) -> Self {
        SessionError::Rng
    }
}

/// How the upload handler must obtain its write handle for this chunk.
#[derive(Debug)]
pub enum OpenMode {
    /// First byte of the file: open and truncate.
    Truncate,
    /// Continuation after the previous handle was closed: reopen for append.
    Append,
    /// Continuation with the previous handle still open.
    Reuse(File),
}

/// Everything the upload handler needs to stream one chunk.
pub struct ChunkGrant {
    /// Negotiated descriptor of the target file.
    pub file: FileInfo,
    /// Write-handle acquisition mode.
    pub open: OpenMode,
    /// Bytes already received before this chunk.
    pub bytes_received: u64,
    /// When the first chunk of this file started.
    pub started: Instant,
}

/// Accounting returned when a chunk is committed.
pub struct ChunkOutcome {
    /// Bytes received after this chunk.
    pub bytes_received: u64,
    /// First-chunk timestamp, for average-speed accounting.
    pub started: Instant,
    /// True when the whole session completed with this chunk.
    pub session_done: bool,
}

struct FileProgress {
    bytes_received: u64,
    started: Instant,
    writer: Option<File>,
    // A chunk for this file is currently streaming.
    busy: bool,
}

struct Session {
    sender: DeviceInfo,
    client_addr: IpAddr,
    accepted: HashSet<String>,
    tokens: HashMap<String, String>,
    files: HashMap<String, FileInfo>,
    progress: HashMap<String, FileProgress>,
    received: HashSet<String>,
    last_activity: Instant,
}

/// Result of a successful prepare-upload.
pub struct CreatedSession {
    /// Fresh session id (hex, 32 chars).
    pub session_id: String,
    /// Per-file tokens keyed by file id.
    pub tokens: HashMap<String, String>,
}

/// The active-session table.
pub struct SessionManager {
    inner: Mutex<HashMap<String, Session>>,
    idle_ttl: Duration,
    metrics: Arc<Metrics>,
}

fn token_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

impl SessionManager {
    /// New empty table.
    pub fn new(idle_ttl: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            idle_ttl,
            metrics,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        // A poisoned session table is unrecoverable state; propagating the
        // inner value keeps the node serving.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a session for `sender` at `client_addr` covering `files`.
    ///
    /// Ids and tokens are minted before the lock is taken; the admission
    /// check and insertion form one short critical section.
    pub fn create_session(
        &self,
        sender: DeviceInfo,
        client_addr: IpAddr,
        files: HashMap<String, FileInfo>,
    ) -> Result<CreatedSession, SessionError> {
        let session_id = identity::random_hex(16)?;
        let mut tokens = HashMap::with_capacity(files.len());
        for id in files.keys() {
            tokens.insert(id.clone(), identity::random_hex(16)?);
        }

        let session = Session {
            sender,
            client_addr,
            accepted: files.keys().cloned().collect(),
            tokens: tokens.clone(),
            files,
            progress: HashMap::new(),
            received: HashSet::new(),
            last_activity: Instant::now(),
        };

        {
            let mut table = self.lock();
            if table.values().any(|s| s.client_addr != client_addr) {
                self.metrics.sessions_blocked_total.inc();
                return Err(SessionError::Blocked);
            }
            // Same address renegotiating: the old session is torn down,
            // write handles closing on drop.
            let replaced: Vec<String> = table
                .iter()
                .filter(|(_, s)| s.client_addr == client_addr)
                .map(|(id, _)| id.clone())
                .collect();
            for id in replaced {
                debug!(session = %id, "replacing session for renegotiating peer");
                table.remove(&id);
            }
            table.insert(session_id.clone(), session);
            self.metrics.sessions_active.set(table.len() as i64);
        }

        info!(session = %session_id, peer = %client_addr, "session created");
        Ok(CreatedSession { session_id, tokens })
    }

    /// Authorise one chunk and hand out the write handle.
    ///
    /// Checks, in order: session exists, source address matches, file id is
    /// accepted, token matches (constant time), the file is not already
    /// streaming a chunk, the range continues the received prefix and its
    /// total equals the descriptor size.
    pub fn begin_chunk(
        &self,
        session_id: &str,
        file_id: &str,
        token: &str,
        client_addr: IpAddr,
        range: Option<&ContentRange>,
    ) -> Result<ChunkGrant, SessionError> {
        let mut table = self.lock();
        let session = table.get_mut(session_id).ok_or(SessionError::NotFound)?;
        if session.client_addr != client_addr {
            return Err(SessionError::IpMismatch);
        }
        if !session.accepted.contains(file_id) {
            // Already-received files leave the accepted set untouched but
            // their progress entry is gone; a late duplicate still needs a
            // specific answer.
            return Err(SessionError::FileNotAccepted);
        }
        let issued = session
            .tokens
            .get(file_id)
            .ok_or(SessionError::FileNotAccepted)?;
        if !token_eq(issued, token) {
            return Err(SessionError::BadToken);
        }
        if session.received.contains(file_id) {
            return Err(SessionError::FileNotAccepted);
        }
        let file = session
            .files
            .get(file_id)
            .ok_or(SessionError::FileNotAccepted)?
            .clone();
        if let Some(r) = range {
            if r.total != file.size {
                return Err(SessionError::SizeMismatch);
            }
        }

        let now = Instant::now();
        session.last_activity = now;
        let progress = session
            .progress
            .entry(file_id.to_string())
            .or_insert_with(|| FileProgress {
                bytes_received: 0,
                started: now,
                writer: None,
                busy: false,
            });
        if progress.busy {
            return Err(SessionError::OutOfOrder);
        }

        let expected = progress.bytes_received;
        let start = range.map(|r| r.start).unwrap_or(0);
        if start != expected {
            return Err(SessionError::OutOfOrder);
        }

        let open = if start == 0 {
            // First byte: truncate, discarding any stale partial file. Any
            // previously open handle is dropped with the old progress state.
            progress.writer = None;
            OpenMode::Truncate
        } else {
            match progress.writer.take() {
                Some(f) => OpenMode::Reuse(f),
                None => OpenMode::Append,
            }
        };
        progress.busy = true;

        Ok(ChunkGrant {
            file,
            open,
            bytes_received: expected,
            started: progress.started,
        })
    }

    /// Commit a streamed chunk. `writer` returns to the table for
    /// non-terminal chunks and is dropped (closed) for terminal ones.
    ///
    /// Returns [`SessionError::NotFound`] when the session was cancelled
    /// while the chunk streamed; the handle is dropped in that case.
    pub fn finish_chunk(
        &self,
        session_id: &str,
        file_id: &str,
        writer: File,
        added: u64,
        terminal: bool,
    ) -> Result<ChunkOutcome, SessionError> {
        let mut table = self.lock();
        let session = table.get_mut(session_id).ok_or(SessionError::NotFound)?;
        let progress = session
            .progress
            .get_mut(file_id)
            .ok_or(SessionError::NotFound)?;

        progress.busy = false;
        progress.bytes_received += added;
        let bytes_received = progress.bytes_received;
        let started = progress.started;
        session.last_activity = Instant::now();
        self.metrics.bytes_received_total.inc_by(added);

        let mut session_done = false;
        if terminal {
            // completeFile: close the handle, drop per-file state, and
            // destroy the session once every accepted file has landed.
            drop(writer);
            session.progress.remove(file_id);
            session.received.insert(file_id.to_string());
            self.metrics.files_received_total.inc();
            if session.received.len() == session.accepted.len() {
                table.remove(session_id);
                self.metrics.sessions_active.set(table.len() as i64);
                session_done = true;
            }
        } else {
            progress.writer = Some(writer);
        }

        Ok(ChunkOutcome {
            bytes_received,
            started,
            session_done,
        })
    }

    /// Abandon a chunk after a write error: the handle is closed, the
    /// session survives, accounting stays at the pre-chunk prefix so the
    /// sender can retry the same range.
    ///
    /// Returns the accounted prefix length, for the handler's best-effort
    /// truncate-back.
    pub fn fail_chunk(&self, session_id: &str, file_id: &str) -> Option<u64> {
        let mut table = self.lock();
        let session = table.get_mut(session_id)?;
        let progress = session.progress.get_mut(file_id)?;
        progress.busy = false;
        progress.writer = None;
        session.last_activity = Instant::now();
        self.metrics.upload_errors_total.inc();
        Some(progress.bytes_received)
    }

    /// Tear down a session, closing every open write handle. Idempotent.
    pub fn cancel(&self, session_id: &str) -> bool {
        let mut table = self.lock();
        let existed = table.remove(session_id).is_some();
        self.metrics.sessions_active.set(table.len() as i64);
        if existed {
            info!(session = %session_id, "session cancelled");
        }
        existed
    }

    /// Tear down everything (shutdown path).
    pub fn cancel_all(&self) {
        let mut table = self.lock();
        let n = table.len();
        table.clear();
        self.metrics.sessions_active.set(0);
        if n > 0 {
            info!(sessions = n, "all sessions cancelled");
        }
    }

    /// Cancel sessions idle longer than the TTL; returns how many died.
    pub fn sweep_idle(&self) -> usize {
        let mut table = self.lock();
        let now = Instant::now();
        let before = table.len();
        table.retain(|id, s| {
            let keep = now.duration_since(s.last_activity) < self.idle_ttl;
            if !keep {
                debug!(session = %id, "session expired");
            }
            keep
        });
        let expired = before - table.len();
        if expired > 0 {
            self.metrics.sessions_expired_total.inc_by(expired as u64);
            self.metrics.sessions_active.set(table.len() as i64);
        }
        expired
    }

    /// Cheap admission pre-check: true when a prepare-upload from
    /// `client_addr` would answer "blocked" right now. Callers still rely on
    /// [`SessionManager::create_session`] for the authoritative check.
    pub fn would_block(&self, client_addr: IpAddr) -> bool {
        self.lock().values().any(|s| s.client_addr != client_addr)
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Whether a session id is live.
    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    /// Sender descriptor of a live session, if any.
    pub fn sender_of(&self, session_id: &str) -> Option<DeviceInfo> {
        self.lock().get(session_id).map(|s| s.sender.clone())
    }
}
