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

//! Peer-facing HTTP client: `info`, `register`, `prepare-upload`, chunked
//! `upload`, `cancel`.
//!
//! ## Sending model
//! Files at or below the chunk threshold go up in one streamed request with
//! no range header. Larger files are split into fixed-size chunks, each an
//! independent `POST /upload` carrying `X-Content-Range: bytes
//! START-END/TOTAL`; chunk N+1 is issued only after chunk N's response.
//!
//! ## TLS policy
//! With the insecure toggle on (the LAN default), certificate verification
//! is disabled at the transport; `LOCALSEND_INSECURE_TLS=0` restores
//! standard verification.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::core::identity;
use crate::core::types::{
    ContentRange, DeviceInfo, FileInfo, PrepareUploadRequest, PrepareUploadResponse, Protocol,
};

const INFO_TIMEOUT: Duration = Duration::from_secs(1);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(2);
const PREPARE_TIMEOUT: Duration = Duration::from_secs(5);
const UPLOAD_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-side transfer errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No response, connection failure, or timeout.
    #[error("peer unreachable")]
    Unreachable,
    /// Peer answered 401: a PIN is required or the supplied one is wrong.
    #[error("pin required or invalid")]
    PinRequired,
    /// Peer answered 403: the user (or policy) declined the transfer.
    #[error("rejected by peer")]
    Rejected,
    /// Peer answered 409: another session is active.
    #[error("blocked by another session")]
    Blocked,
    /// 2xx with an unparsable body, or an unexpected status.
    #[error("bad response")]
    BadResponse,
    /// A chunk was refused; the upload stops at the first failure.
    #[error("chunk refused")]
    ChunkRefused,
    /// Local file I/O failure.
    #[error("io")]
    Io,
}

/// Progress callback: `(bytes_sent, total, finished)`. Invoked before each
/// chunk and once on completion.
pub type SendProgressFn = dyn Fn(u64, u64, bool) + Send + Sync;

/// Client configuration derived from the node config.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Preferred protocol when probing.
    pub prefer: Protocol,
    /// Tolerate self-signed peer certificates.
    pub allow_insecure_tls: bool,
    /// Files larger than this are chunked.
    pub chunk_threshold: u64,
    /// Chunk size for ranged uploads.
    pub chunk_size: u64,
}

/// Peer endpoint coordinates.
#[derive(Clone, Copy, Debug)]
pub struct Target {
    /// Peer address.
    pub ip: IpAddr,
    /// Peer port.
    pub port: u16,
    /// Peer transport.
    pub protocol: Protocol,
}

impl Target {
    /// Endpoint of a discovered peer. `None` when discovery has not filled
    /// in the transport address yet.
    pub fn of(device: &DeviceInfo) -> Option<Target> {
        Some(Target {
            ip: device.ip?,
            port: device.port,
            protocol: device.protocol,
        })
    }
}

fn host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// The node's outbound HTTP client.
pub struct HttpClient {
    http: reqwest::Client,
    cfg: ClientConfig,
    device: DeviceInfo,
}

impl HttpClient {
    /// Build the client. The TLS toggle is baked in at construction.
    pub fn new(device: DeviceInfo, cfg: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(cfg.allow_insecure_tls)
            .build()
            .map_err(|_| ClientError::BadResponse)?;
        Ok(Self { http, cfg, device })
    }

    /// This node's advertised descriptor.
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    fn api(&self, protocol: Protocol, ip: IpAddr, port: u16, path: &str) -> String {
        format!(
            "{}://{}:{}/api/localsend/v2/{}",
            protocol.scheme(),
            host(ip),
            port,
            path
        )
    }

    /// `GET /info` on the preferred protocol, then the other. Any non-2xx
    /// or transport failure yields `None`.
    pub async fn info(&self, ip: IpAddr, port: u16) -> Option<DeviceInfo> {
        for protocol in [self.cfg.prefer, self.cfg.prefer.other()] {
            let url = self.api(protocol, ip, port, "info");
            let resp = match self.http.get(&url).timeout(INFO_TIMEOUT).send().await {
                Ok(r) => r,
                Err(_) => continue,
            };
            if !resp.status().is_success() {
                continue;
            }
            if let Ok(mut dev) = resp.json::<DeviceInfo>().await {
                dev.ip = Some(ip);
                return Some(dev);
            }
        }
        None
    }

    /// `POST /register` with our descriptor; returns the peer's, with its
    /// transport address attached.
    pub async fn register(&self, target: Target) -> Option<DeviceInfo> {
        let url = self.api(target.protocol, target.ip, target.port, "register");
        let resp = self
            .http
            .post(&url)
            .timeout(REGISTER_TIMEOUT)
            .json(&self.device)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            debug!(url = %url, status = %resp.status(), "register refused");
            return None;
        }
        let mut dev = resp.json::<DeviceInfo>().await.ok()?;
        dev.ip = Some(target.ip);
        Some(dev)
    }

    /// `POST /prepare-upload`. A 204 answer (nothing to send) maps to an
    /// empty token set.
    pub async fn prepare_upload(
        &self,
        target: Target,
        files: &[FileInfo],
        pin: Option<&str>,
    ) -> Result<PrepareUploadResponse, ClientError> {
        let url = self.api(target.protocol, target.ip, target.port, "prepare-upload");
        let body = PrepareUploadRequest {
            info: self.device.clone(),
            files: files.iter().map(|f| (f.id.clone(), f.clone())).collect(),
        };

        let mut req = self.http.post(&url).timeout(PREPARE_TIMEOUT).json(&body);
        if let Some(pin) = pin {
            req = req.query(&[("pin", pin)]);
        }
        let resp = req.send().await.map_err(|_| ClientError::Unreachable)?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => Err(ClientError::PinRequired),
            StatusCode::FORBIDDEN => Err(ClientError::Rejected),
            StatusCode::CONFLICT => Err(ClientError::Blocked),
            StatusCode::NO_CONTENT => Ok(PrepareUploadResponse {
                session_id: String::new(),
                files: HashMap::new(),
            }),
            s if s.is_success() => resp
                .json::<PrepareUploadResponse>()
                .await
                .map_err(|_| ClientError::BadResponse),
            _ => Err(ClientError::BadResponse),
        }
    }

    /// Upload one negotiated file, chunked when it exceeds the threshold.
    /// Stops at the first refused chunk.
    pub async fn upload_file(
        &self,
        target: Target,
        session_id: &str,
        file_id: &str,
        token: &str,
        path: &Path,
        progress: Option<&SendProgressFn>,
    ) -> Result<(), ClientError> {
        let meta = tokio::fs::metadata(path).await.map_err(|_| ClientError::Io)?;
        let total = meta.len();
        let url = self.api(target.protocol, target.ip, target.port, "upload");
        let query = [
            ("sessionId", session_id.to_string()),
            ("fileId", file_id.to_string()),
            ("token", token.to_string()),
        ];

        if total > self.cfg.chunk_threshold {
            let mut file = tokio::fs::File::open(path).await.map_err(|_| ClientError::Io)?;
            let mut sent: u64 = 0;
            while sent < total {
                let len = (total - sent).min(self.cfg.chunk_size);
                let range = ContentRange {
                    start: sent,
                    end: sent + len - 1,
                    total,
                };
                if let Some(cb) = progress {
                    cb(sent, total, false);
                }

                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf).await.map_err(|_| ClientError::Io)?;

                let resp = self
                    .http
                    .post(&url)
                    .timeout(UPLOAD_CHUNK_TIMEOUT)
                    .query(&query)
                    .header("X-Content-Range", range.to_string())
                    .header(reqwest::header::CONTENT_LENGTH, len)
                    .body(buf)
                    .send()
                    .await
                    .map_err(|_| ClientError::Unreachable)?;
                if !resp.status().is_success() {
                    warn!(status = %resp.status(), range = %range, "chunk refused; stopping");
                    return Err(ClientError::ChunkRefused);
                }
                sent += len;
            }
            if let Some(cb) = progress {
                cb(total, total, true);
            }
            return Ok(());
        }

        // Single shot: one streamed request, no range header.
        if let Some(cb) = progress {
            cb(0, total, false);
        }
        let file = tokio::fs::File::open(path).await.map_err(|_| ClientError::Io)?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let resp = self
            .http
            .post(&url)
            .timeout(UPLOAD_CHUNK_TIMEOUT)
            .query(&query)
            .body(body)
            .send()
            .await
            .map_err(|_| ClientError::Unreachable)?;
        if !resp.status().is_success() {
            return Err(ClientError::ChunkRefused);
        }
        if let Some(cb) = progress {
            cb(total, total, true);
        }
        Ok(())
    }

    /// `POST /cancel`. True when the peer acknowledged.
    pub async fn cancel_session(&self, target: Target, session_id: &str) -> bool {
        let url = self.api(target.protocol, target.ip, target.port, "cancel");
        match self
            .http
            .post(&url)
            .timeout(CANCEL_TIMEOUT)
            .query(&[("sessionId", session_id)])
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Build a file descriptor for a local file: fresh id, basename, size, MIME
/// hint by extension and (optionally) a streamed SHA-256.
pub async fn file_info_for_path(path: &Path, with_sha256: bool) -> Result<FileInfo, ClientError> {
    let meta = tokio::fs::metadata(path).await.map_err(|_| ClientError::Io)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(ClientError::Io)?
        .to_string();

    let sha256 = if with_sha256 {
        let mut file = tokio::fs::File::open(path).await.map_err(|_| ClientError::Io)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await.map_err(|_| ClientError::Io)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Some(hex::encode(hasher.finalize()))
    } else {
        None
    };

    Ok(FileInfo {
        id: identity::random_hex(8).map_err(|_| ClientError::Io)?,
        file_type: mime_for(&file_name).to_string(),
        file_name,
        size: meta.len(),
        sha256,
        preview: None,
        metadata: None,
    })
}

fn mime_for(name: &str) -> &'static str {
    match name.rsplit('.').next().map(|e| e.to_ascii_lowercase()) {
        Some(ext) => match ext.as_str() {
            "txt" | "md" | "log" => "text/plain",
            "pdf" => "application/pdf",
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "mp4" => "video/mp4",
            "zip" => "application/zip",
            "json" => "application/json",
            _ => "application/octet-stream",
        },
        None => "application/octet-stream",
    }
}
