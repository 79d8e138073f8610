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

//! Node lifecycle: wires discovery, the listener and the session table
//! together, and tears them down in order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::events::TransferObserver;
use crate::core::identity;
use crate::core::session::SessionManager;
use crate::core::types::{DeviceInfo, NodeConfig};
use crate::monitoring::metrics::Metrics;
use crate::networking::client::{self, ClientConfig, ClientError, HttpClient, SendProgressFn, Target};
use crate::networking::registry::PeerRegistry;
use crate::networking::{build_discoveries, Discovery};
use crate::server::{self, AppState, ServerHandle};

/// Drain deadline for in-flight handlers on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Cadence of the idle-session sweeper.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A running lansend node.
pub struct Node {
    device: DeviceInfo,
    registry: Arc<PeerRegistry>,
    client: Arc<HttpClient>,
    sessions: Arc<SessionManager>,
    metrics: Arc<Metrics>,
    discoveries: Vec<Arc<dyn Discovery>>,
    server: Option<ServerHandle>,
    sweeper: JoinHandle<()>,
    cfg: NodeConfig,
}

impl Node {
    /// Start discovery, the listener and the idle sweeper. Fails on invalid
    /// config or when no socket can be bound.
    pub async fn start(cfg: NodeConfig, observer: TransferObserver) -> anyhow::Result<Node> {
        cfg.validate()?;

        let metrics = Arc::new(Metrics::new()?);
        let device = identity::local_device(&cfg)?;
        info!(
            alias = %device.alias,
            fingerprint = %&device.fingerprint[..16.min(device.fingerprint.len())],
            port = device.port,
            protocol = %device.protocol,
            save_dir = %cfg.node.save_dir,
            "node starting"
        );

        let registry = Arc::new(PeerRegistry::new(metrics.clone()));
        let client = Arc::new(HttpClient::new(
            device.clone(),
            ClientConfig {
                prefer: cfg.http.protocol,
                allow_insecure_tls: cfg.http.allow_insecure_tls,
                chunk_threshold: cfg.transfer.chunk_threshold,
                chunk_size: cfg.transfer.chunk_size,
            },
        )?);
        let sessions = Arc::new(SessionManager::new(
            Duration::from_secs(cfg.transfer.session_idle_ttl_secs),
            metrics.clone(),
        ));

        let state = Arc::new(AppState {
            device: device.clone(),
            sessions: sessions.clone(),
            registry: registry.clone(),
            observer,
            pin: cfg.http.pin.clone(),
            save_dir: PathBuf::from(&cfg.node.save_dir),
            body_limit: cfg.http.body_limit,
        });
        let server = server::spawn(
            state,
            cfg.http.protocol,
            cfg.http.port,
            cfg.http.cert_dir.as_ref().map(PathBuf::from),
        )
        .await?;

        let discoveries = build_discoveries(
            &cfg,
            device.clone(),
            registry.clone(),
            client.clone(),
            metrics.clone(),
        )?;
        for d in &discoveries {
            d.start().await?;
            info!(channel = d.name(), "discovery started");
        }

        let sweeper = {
            let sessions = sessions.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                ticker.tick().await; // first tick is immediate and useless
                loop {
                    ticker.tick().await;
                    let expired = sessions.sweep_idle();
                    if expired > 0 {
                        warn!(expired, "idle sessions cancelled");
                    }
                }
            })
        };

        let node = Node {
            device,
            registry,
            client,
            sessions,
            metrics,
            discoveries,
            server: Some(server),
            sweeper,
            cfg,
        };
        node.announce();
        Ok(node)
    }

    /// Fire an announcement burst (and an immediate sweep) on every
    /// discovery channel, in the background.
    pub fn announce(&self) {
        for d in &self.discoveries {
            let d = d.clone();
            tokio::spawn(async move {
                if let Err(e) = d.announce().await {
                    warn!(channel = d.name(), err = %e, "announce failed");
                }
            });
        }
    }

    /// This node's advertised descriptor.
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// The peer registry.
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// The outbound client.
    pub fn client(&self) -> &Arc<HttpClient> {
        &self.client
    }

    /// The inbound session table.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Bound listener address (actual port when configured with an
    /// ephemeral one).
    pub async fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.server {
            Some(s) => s.local_addr().await,
            None => None,
        }
    }

    /// Prometheus text dump for the host.
    pub fn metrics_text(&self) -> String {
        self.metrics.render()
    }

    /// Send local files to a discovered peer: build descriptors, negotiate,
    /// upload each accepted file in turn, cancel the session on failure.
    pub async fn send_files(
        &self,
        peer: &DeviceInfo,
        paths: &[&Path],
        pin: Option<&str>,
        progress: Option<&SendProgressFn>,
    ) -> Result<(), ClientError> {
        let target = Target::of(peer).ok_or(ClientError::Unreachable)?;

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(client::file_info_for_path(path, true).await?);
        }

        let negotiated = self.client.prepare_upload(target, &files, pin).await?;
        if negotiated.files.is_empty() {
            return Ok(());
        }

        for (file, path) in files.iter().zip(paths) {
            let Some(token) = negotiated.files.get(&file.id) else {
                // Peer declined this file; the others still go through.
                continue;
            };
            if let Err(e) = self
                .client
                .upload_file(
                    target,
                    &negotiated.session_id,
                    &file.id,
                    token,
                    path,
                    progress,
                )
                .await
            {
                warn!(file = %file.file_name, err = %e, "upload failed; cancelling session");
                self.client
                    .cancel_session(target, &negotiated.session_id)
                    .await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Configuration the node was started with.
    pub fn config(&self) -> &NodeConfig {
        &self.cfg
    }

    /// Graceful shutdown: discovery first, then the listener (draining for
    /// up to 5 s), then every active session.
    pub async fn stop(mut self) {
        for d in &self.discoveries {
            d.stop().await;
        }
        if let Some(server) = self.server.take() {
            server.shutdown(SHUTDOWN_GRACE).await;
        }
        self.sweeper.abort();
        self.sessions.cancel_all();
        info!("node stopped");
    }
}
