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

use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus")]
    Prom,
}

/// Metrics container.
#[derive(Clone)]
pub struct Metrics {
    /// Registry.
    pub registry: Registry,

    /// Known peers gauge.
    pub peers_known: IntGauge,
    /// Active inbound sessions gauge.
    pub sessions_active: IntGauge,

    /// Announcement datagrams sent.
    pub announcements_sent_total: IntCounter,
    /// Announcement datagrams received and decoded.
    pub announcements_received_total: IntCounter,
    /// Datagrams dropped as malformed.
    pub announcements_invalid_total: IntCounter,
    /// Subnet-scan probes issued.
    pub scan_probes_total: IntCounter,

    /// Prepare-uploads answered 409.
    pub sessions_blocked_total: IntCounter,
    /// Sessions cancelled by the idle sweeper.
    pub sessions_expired_total: IntCounter,
    /// Files fully received.
    pub files_received_total: IntCounter,
    /// Payload bytes written to disk.
    pub bytes_received_total: IntCounter,
    /// Upload chunks failed with an I/O error.
    pub upload_errors_total: IntCounter,
}

impl Metrics {
    /// Create and register metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let peers_known = IntGauge::new("lansend_peers_known", "Known peers")
            .map_err(|_| MetricsError::Prom)?;
        let sessions_active = IntGauge::new("lansend_sessions_active", "Active inbound sessions")
            .map_err(|_| MetricsError::Prom)?;

        let announcements_sent_total = IntCounter::new(
            "lansend_announcements_sent_total",
            "Announcement datagrams sent",
        )
        .map_err(|_| MetricsError::Prom)?;
        let announcements_received_total = IntCounter::new(
            "lansend_announcements_received_total",
            "Announcement datagrams received",
        )
        .map_err(|_| MetricsError::Prom)?;
        let announcements_invalid_total = IntCounter::new(
            "lansend_announcements_invalid_total",
            "Datagrams dropped as malformed",
        )
        .map_err(|_| MetricsError::Prom)?;
        let scan_probes_total =
            IntCounter::new("lansend_scan_probes_total", "Subnet-scan probes issued")
                .map_err(|_| MetricsError::Prom)?;

        let sessions_blocked_total = IntCounter::new(
            "lansend_sessions_blocked_total",
            "Prepare-uploads blocked by another session",
        )
        .map_err(|_| MetricsError::Prom)?;
        let sessions_expired_total = IntCounter::new(
            "lansend_sessions_expired_total",
            "Sessions cancelled by the idle sweeper",
        )
        .map_err(|_| MetricsError::Prom)?;
        let files_received_total =
            IntCounter::new("lansend_files_received_total", "Files fully received")
                .map_err(|_| MetricsError::Prom)?;
        let bytes_received_total = IntCounter::new(
            "lansend_bytes_received_total",
            "Payload bytes written to disk",
        )
        .map_err(|_| MetricsError::Prom)?;
        let upload_errors_total =
            IntCounter::new("lansend_upload_errors_total", "Upload chunk I/O errors")
                .map_err(|_| MetricsError::Prom)?;

        registry
            .register(Box::new(peers_known.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(sessions_active.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(announcements_sent_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(announcements_received_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(announcements_invalid_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(scan_probes_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(sessions_blocked_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(sessions_expired_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(files_received_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(bytes_received_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(upload_errors_total.clone()))
            .map_err(|_| MetricsError::Prom)?;

        Ok(Self {
            registry,
            peers_known,
            sessions_active,
            announcements_sent_total,
            announcements_received_total,
            announcements_invalid_total,
            scan_probes_total,
            sessions_blocked_total,
            sessions_expired_total,
            files_received_total,
            bytes_received_total,
            upload_errors_total,
        })
    }

    /// Render the registry in Prometheus text format.
    pub fn render(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}
