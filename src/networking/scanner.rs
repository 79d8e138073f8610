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

//! HTTP subnet scanner: the discovery fallback for networks that filter
//! multicast.
//!
//! Every `scan_interval_secs` (and once immediately at start) the scanner
//! derives the /24 of each local IPv4 address, probes hosts .1–.254 except
//! itself with bounded concurrency, and records every host whose `info`
//! endpoint answers. Absence of a host is the normal case; probe failures
//! are silent. A sweep in flight swallows new triggers (single-flight).

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::types::{DeviceInfo, NodeConfig, DEFAULT_PORT};
use crate::monitoring::metrics::Metrics;
use crate::networking::client::HttpClient;
use crate::networking::interfaces;
use crate::networking::registry::PeerRegistry;
use crate::networking::Discovery;

/// Scanner settings.
#[derive(Clone, Debug)]
pub struct ScannerConfig {
    /// Seconds between sweeps.
    pub interval: Duration,
    /// Concurrent probes per sweep.
    pub concurrency: usize,
    /// Port probed on every candidate host.
    pub port: u16,
    /// Verbose sweep tracing.
    pub debug: bool,
}

impl From<&NodeConfig> for ScannerConfig {
    fn from(cfg: &NodeConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.discovery.scan_interval_secs.max(1)),
            concurrency: cfg.discovery.scan_concurrency.max(1),
            port: DEFAULT_PORT,
            debug: cfg.discovery.debug,
        }
    }
}

/// Candidate hosts for one sweep: the /24 of every local address, hosts
/// .1–.254, excluding the local addresses themselves.
pub fn candidate_hosts(local: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    let own: BTreeSet<Ipv4Addr> = local.iter().copied().collect();
    let mut out = BTreeSet::new();
    for addr in local {
        let [a, b, c, _] = addr.octets();
        for d in 1..=254u8 {
            let candidate = Ipv4Addr::new(a, b, c, d);
            if !own.contains(&candidate) {
                out.insert(candidate);
            }
        }
    }
    out.into_iter().collect()
}

/// The subnet-scan discovery channel.
pub struct HttpScanner {
    cfg: ScannerConfig,
    device: DeviceInfo,
    registry: Arc<PeerRegistry>,
    client: Arc<HttpClient>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    scanning: Arc<AtomicBool>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl HttpScanner {
    /// Prepare the channel. Nothing probes until [`Discovery::start`].
    pub fn new(
        cfg: ScannerConfig,
        device: DeviceInfo,
        registry: Arc<PeerRegistry>,
        client: Arc<HttpClient>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cfg,
            device,
            registry,
            client,
            metrics,
            cancel: CancellationToken::new(),
            scanning: Arc::new(AtomicBool::new(false)),
            sweeper: StdMutex::new(None),
        }
    }

    async fn sweep(
        cfg: &ScannerConfig,
        device: &DeviceInfo,
        registry: &Arc<PeerRegistry>,
        client: &Arc<HttpClient>,
        metrics: &Arc<Metrics>,
        scanning: &AtomicBool,
    ) {
        if scanning.swap(true, Ordering::AcqRel) {
            // A sweep is already running; this trigger is dropped.
            return;
        }

        let local = interfaces::local_ipv4_addrs();
        let candidates = candidate_hosts(&local);
        if cfg.debug {
            debug!(subnets = local.len(), hosts = candidates.len(), "subnet sweep starting");
        }

        let self_fingerprint = device.fingerprint.clone();
        stream::iter(candidates)
            .for_each_concurrent(cfg.concurrency, |ip| {
                let client = client.clone();
                let registry = registry.clone();
                let metrics = metrics.clone();
                let self_fingerprint = self_fingerprint.clone();
                async move {
                    metrics.scan_probes_total.inc();
                    if let Some(peer) = client.info(IpAddr::V4(ip), cfg.port).await {
                        if peer.fingerprint != self_fingerprint {
                            registry.insert(peer);
                        }
                    }
                }
            })
            .await;

        scanning.store(false, Ordering::Release);
    }
}

#[async_trait::async_trait]
impl Discovery for HttpScanner {
    fn name(&self) -> &'static str {
        "scanner"
    }

    async fn start(&self) -> anyhow::Result<()> {
        let cfg = self.cfg.clone();
        let device = self.device.clone();
        let registry = self.registry.clone();
        let client = self.client.clone();
        let metrics = self.metrics.clone();
        let scanning = self.scanning.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            info!(interval = ?cfg.interval, concurrency = cfg.concurrency, "subnet scanner started");
            let mut ticker = tokio::time::interval(cfg.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("subnet scanner exiting");
                        break;
                    }
                    // First tick fires immediately: one sweep at start.
                    _ = ticker.tick() => {
                        Self::sweep(&cfg, &device, &registry, &client, &metrics, &scanning).await;
                    }
                }
            }
        });

        *self.sweeper.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    async fn announce(&self) -> anyhow::Result<()> {
        Self::sweep(
            &self.cfg,
            &self.device,
            &self.registry,
            &self.client,
            &self.metrics,
            &self.scanning,
        )
        .await;
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }
}
