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

//! LocalSend v2 wire types, the announcement codec and node configuration.
//!
//! ## Announcement datagram
//! A single JSON object per UDP datagram, at most 1500 bytes:
//!
//! ```text
//! {
//!   "alias": "Device Name",
//!   "version": "2.0",
//!   "deviceModel": "...",
//!   "deviceType": "desktop|mobile|web|headless|server",
//!   "fingerprint": "hex",
//!   "port": 53317,
//!   "protocol": "http|https",
//!   "download": false,
//!   "announce": true
//! }
//! ```
//!
//! Legacy senders mark a solicitation with `"announcement": true` instead of
//! `"announce": true`; either is accepted, and outgoing messages carry both.
//! Malformed datagrams (non-JSON, missing `fingerprint`, wrongly typed
//! fields) decode to an error and are dropped by the receive loop; the UDP
//! channel is lossy by design.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Protocol version advertised in every descriptor.
pub const PROTOCOL_VERSION: &str = "2.0";
/// Default TCP/UDP port of the protocol.
pub const DEFAULT_PORT: u16 = 53317;
/// IPv4 multicast group for announcements.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 167);
/// Hard cap on an announcement datagram.
pub const MAX_ANNOUNCEMENT_BYTES: usize = 1500;

/// Wire codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Payload is not the expected JSON shape.
    #[error("malformed json")]
    Json,
    /// Announcement without a usable fingerprint.
    #[error("missing fingerprint")]
    MissingFingerprint,
    /// Datagram exceeds the 1500-byte cap.
    #[error("oversized datagram")]
    TooLarge,
    /// `X-Content-Range` does not match `bytes <start>-<end>/<total>`.
    #[error("bad content range")]
    BadRange,
}

/// Device classification advertised in the descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Phone or tablet.
    Mobile,
    /// Desktop or laptop.
    Desktop,
    /// Browser client.
    Web,
    /// Headless process (no display).
    Headless,
    /// Server process.
    Server,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Desktop
    }
}

/// Transport protocol of a node's HTTP endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP.
    Http,
    /// HTTPS (commonly a self-signed certificate on a LAN).
    Https,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Http
    }
}

impl Protocol {
    /// URL scheme string.
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    /// The other transport, used as a probe fallback.
    pub fn other(&self) -> Protocol {
        match self {
            Protocol::Http => Protocol::Https,
            Protocol::Https => Protocol::Http,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Device descriptor: immutable per process lifetime except for the
/// transport-derived `ip`, which discovery fills in on reception.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Human label.
    pub alias: String,
    /// Protocol version string.
    #[serde(default = "default_version")]
    pub version: String,
    /// Optional model hint ("MacBook Pro", …).
    #[serde(rename = "deviceModel", skip_serializing_if = "Option::is_none", default)]
    pub device_model: Option<String>,
    /// Device classification.
    #[serde(rename = "deviceType", default)]
    pub device_type: DeviceType,
    /// Opaque per-process identifier (lowercase hex, 64 chars).
    pub fingerprint: String,
    /// TCP port of the HTTP endpoint.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Transport of the HTTP endpoint.
    #[serde(default)]
    pub protocol: Protocol,
    /// Whether a pull-download API is offered.
    #[serde(default)]
    pub download: bool,
    /// Source address, filled in by discovery. Never on the wire.
    #[serde(skip)]
    pub ip: Option<IpAddr>,
}

/// Announcement message: a descriptor plus the solicitation marker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Announcement {
    /// The announcing device.
    #[serde(flatten)]
    pub device: DeviceInfo,
    /// Solicitation marker.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub announce: Option<bool>,
    /// Legacy alias for `announce`, still emitted and accepted.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub announcement: Option<bool>,
}

impl Announcement {
    /// Build an outgoing message. Outgoing messages carry both marker
    /// spellings for compatibility with legacy peers.
    pub fn outgoing(device: DeviceInfo, announce: bool) -> Self {
        Self {
            device,
            announce: Some(announce),
            announcement: Some(announce),
        }
    }

    /// True when the sender expects a response (register or UDP reply).
    pub fn is_solicitation(&self) -> bool {
        self.announce.unwrap_or(false) || self.announcement.unwrap_or(false)
    }

    /// Encode as a single JSON datagram payload.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let bytes = serde_json::to_vec(self).map_err(|_| CodecError::Json)?;
        if bytes.len() > MAX_ANNOUNCEMENT_BYTES {
            return Err(CodecError::TooLarge);
        }
        Ok(bytes)
    }

    /// Decode a received datagram. The fingerprint must be present and
    /// non-empty; everything else falls back to protocol defaults.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() > MAX_ANNOUNCEMENT_BYTES {
            return Err(CodecError::TooLarge);
        }
        let msg: Announcement = serde_json::from_slice(bytes).map_err(|_| CodecError::Json)?;
        if msg.device.fingerprint.trim().is_empty() {
            return Err(CodecError::MissingFingerprint);
        }
        Ok(msg)
    }
}

/// Optional file timestamps (ISO-8601 strings, pass-through).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Last-modified timestamp.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub modified: Option<String>,
    /// Last-accessed timestamp.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub accessed: Option<String>,
}

fn default_file_type() -> String {
    "application/octet-stream".to_string()
}

/// File descriptor negotiated by prepare-upload. `size` is trusted as the
/// upload length; payload bytes beyond it are rejected.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileInfo {
    /// Sender-chosen id, unique within one prepare-upload request.
    pub id: String,
    /// Relative path as the sender sees it. The receiver keeps only the
    /// basename and refuses any `..` component.
    #[serde(rename = "fileName")]
    pub file_name: String,
    /// Payload length in bytes.
    pub size: u64,
    /// MIME hint, non-authoritative.
    #[serde(rename = "fileType", default = "default_file_type")]
    pub file_type: String,
    /// Hex SHA-256 of the payload, if the sender computed one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sha256: Option<String>,
    /// Inline preview (≤ 4 KiB recommended).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub preview: Option<String>,
    /// Optional timestamps.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<FileMetadata>,
}

/// `POST /prepare-upload` body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareUploadRequest {
    /// Sender descriptor.
    pub info: DeviceInfo,
    /// Offered files keyed by file id.
    pub files: HashMap<String, FileInfo>,
}

/// `POST /prepare-upload` success body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareUploadResponse {
    /// Receiver-issued session id (hex, 32 chars).
    #[serde(rename = "sessionId")]
    pub session_id: String,
    /// Per-file upload tokens keyed by file id.
    pub files: HashMap<String, String>,
}

/// `POST /upload` query parameters.
#[derive(Clone, Debug, Deserialize)]
pub struct UploadQuery {
    /// Session to write into.
    #[serde(rename = "sessionId")]
    pub session_id: String,
    /// File within the session.
    #[serde(rename = "fileId")]
    pub file_id: String,
    /// Per-file token issued by prepare-upload.
    pub token: String,
}

/// `POST /cancel` query parameters.
#[derive(Clone, Debug, Deserialize)]
pub struct SessionQuery {
    /// Session to tear down.
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// Parsed `X-Content-Range: bytes <start>-<end>/<total>` header with
/// `0 <= start <= end < total`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentRange {
    /// First byte offset of this chunk.
    pub start: u64,
    /// Last byte offset of this chunk (inclusive).
    pub end: u64,
    /// Total payload length.
    pub total: u64,
}

impl ContentRange {
    /// Parse the header value.
    pub fn parse(value: &str) -> Result<Self, CodecError> {
        let rest = value
            .trim()
            .strip_prefix("bytes ")
            .ok_or(CodecError::BadRange)?;
        let (range, total) = rest.split_once('/').ok_or(CodecError::BadRange)?;
        let (start, end) = range.split_once('-').ok_or(CodecError::BadRange)?;
        let start: u64 = start.trim().parse().map_err(|_| CodecError::BadRange)?;
        let end: u64 = end.trim().parse().map_err(|_| CodecError::BadRange)?;
        let total: u64 = total.trim().parse().map_err(|_| CodecError::BadRange)?;
        if start > end || end >= total {
            return Err(CodecError::BadRange);
        }
        Ok(Self { start, end, total })
    }

    /// Number of bytes this chunk carries.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// True when this chunk raises the received count to `total`.
    pub fn is_terminal(&self) -> bool {
        self.end + 1 >= self.total
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Pre-shared PIN, zeroized on drop.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Pin(pub String);

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log the PIN itself.
        f.write_str("Pin(***)")
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Cannot read the config file.
    #[error("read config")]
    Read,
    /// Cannot parse TOML.
    #[error("parse config")]
    Parse,
    /// Port outside [1, 65535].
    #[error("invalid-config: port outside [1, 65535]")]
    InvalidPort,
}

/// Node configuration root.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct NodeConfig {
    /// Node identity settings.
    #[serde(default)]
    pub node: NodeSettings,
    /// HTTP endpoint settings.
    #[serde(default)]
    pub http: HttpConfig,
    /// Discovery settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Transfer settings.
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Node identity settings.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeSettings {
    /// Human label advertised to peers.
    #[serde(default = "default_alias")]
    pub alias: String,
    /// Optional model hint.
    #[serde(default)]
    pub device_model: Option<String>,
    /// Device classification override. When unset, inferred from environment
    /// hints at startup (desktop, or headless/server under markers).
    #[serde(default)]
    pub device_type: Option<DeviceType>,
    /// Directory completed transfers are written into.
    #[serde(default = "default_save_dir")]
    pub save_dir: String,
    /// Advertise the pull-download API flag. No pull endpoint is served.
    #[serde(default)]
    pub download_api: bool,
}

fn default_alias() -> String {
    "lansend".to_string()
}

fn default_save_dir() -> String {
    "./received_files".to_string()
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            alias: default_alias(),
            device_model: None,
            device_type: None,
            save_dir: default_save_dir(),
            download_api: false,
        }
    }
}

/// HTTP endpoint settings.
#[derive(Clone, Debug, Deserialize)]
pub struct HttpConfig {
    /// Listen/advertised port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Serve (and prefer when dialing) http or https.
    #[serde(default)]
    pub protocol: Protocol,
    /// Optional pre-shared PIN required by prepare-upload.
    #[serde(default)]
    pub pin: Option<Pin>,
    /// Upload body-size limit in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit: u64,
    /// Directory for the self-signed certificate when serving https.
    #[serde(default)]
    pub cert_dir: Option<String>,
    /// Tolerate self-signed peer certificates when dialing https.
    /// `LOCALSEND_INSECURE_TLS=0` turns verification back on.
    #[serde(default = "default_true")]
    pub allow_insecure_tls: bool,
}

fn default_body_limit() -> u64 {
    5 * 1024 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            protocol: Protocol::Http,
            pin: None,
            body_limit: default_body_limit(),
            cert_dir: None,
            allow_insecure_tls: true,
        }
    }
}

/// Discovery settings.
#[derive(Clone, Debug, Deserialize)]
pub struct DiscoveryConfig {
    /// Enable the UDP multicast discoverer.
    #[serde(default = "default_true")]
    pub multicast: bool,
    /// Enable the HTTP subnet scanner.
    #[serde(default = "default_true")]
    pub scan: bool,
    /// Seconds between subnet sweeps.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Concurrent probes per sweep.
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,
    /// Verbose discovery tracing (`LOCALSEND_DEBUG_DISCOVERY=1`).
    #[serde(default)]
    pub debug: bool,
}

fn default_scan_interval() -> u64 {
    30
}

fn default_scan_concurrency() -> usize {
    50
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast: true,
            scan: true,
            scan_interval_secs: default_scan_interval(),
            scan_concurrency: default_scan_concurrency(),
            debug: false,
        }
    }
}

/// Transfer settings.
#[derive(Clone, Debug, Deserialize)]
pub struct TransferConfig {
    /// Files larger than this are sent in ranged chunks.
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: u64,
    /// Chunk size for ranged uploads.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Inbound sessions idle longer than this are cancelled.
    #[serde(default = "default_idle_ttl")]
    pub session_idle_ttl_secs: u64,
}

fn default_chunk_threshold() -> u64 {
    50 * 1024 * 1024
}

fn default_chunk_size() -> u64 {
    10 * 1024 * 1024
}

fn default_idle_ttl() -> u64 {
    600
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: default_chunk_threshold(),
            chunk_size: default_chunk_size(),
            session_idle_ttl_secs: default_idle_ttl(),
        }
    }
}

impl NodeConfig {
    /// Parse a TOML config document and fold in the environment toggles.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let mut cfg: NodeConfig = toml::from_str(raw).map_err(|_| ConfigError::Parse)?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::Read)?;
        Self::from_toml(&raw)
    }

    /// Fold the recognised environment toggles into the config. Read once at
    /// startup; nothing consults the environment afterwards.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("LOCALSEND_INSECURE_TLS") {
            self.http.allow_insecure_tls = v.trim() != "0";
        }
        if let Ok(v) = std::env::var("LOCALSEND_DEBUG_DISCOVERY") {
            self.discovery.debug = v.trim() == "1";
        }
    }

    /// Reject configurations the node cannot serve.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        Ok(())
    }
}
