#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Networking: peer discovery (multicast + subnet scan), the peer registry
//! and the peer-facing HTTP client.

pub mod client;
pub mod interfaces;
pub mod multicast;
pub mod registry;
pub mod scanner;

use std::sync::Arc;

use crate::core::types::{DeviceInfo, NodeConfig};
use crate::monitoring::metrics::Metrics;

/// A discovery channel: something that watches the subnet and feeds the
/// peer registry.
#[async_trait::async_trait]
pub trait Discovery: Send + Sync {
    /// Channel name for logs.
    fn name(&self) -> &'static str;
    /// Begin listening/sweeping in background tasks.
    async fn start(&self) -> anyhow::Result<()>;
    /// Actively solicit peers (announcement burst or immediate sweep).
    async fn announce(&self) -> anyhow::Result<()>;
    /// Cancel background tasks and release sockets.
    async fn stop(&self);
}

/// Build the configured discovery channels. Multicast is the primary
/// mechanism; the HTTP scanner is the fallback for networks that filter
/// multicast.
pub fn build_discoveries(
    cfg: &NodeConfig,
    device: DeviceInfo,
    registry: Arc<registry::PeerRegistry>,
    client: Arc<client::HttpClient>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<Vec<Arc<dyn Discovery>>> {
    let mut out: Vec<Arc<dyn Discovery>> = Vec::new();
    if cfg.discovery.multicast {
        out.push(Arc::new(multicast::MulticastDiscovery::new(
            multicast::MulticastConfig::from(cfg),
            device.clone(),
            registry.clone(),
            client.clone(),
            metrics.clone(),
        )?));
    }
    if cfg.discovery.scan {
        out.push(Arc::new(scanner::HttpScanner::new(
            scanner::ScannerConfig::from(cfg),
            device,
            registry,
            client,
            metrics,
        )));
    }
    Ok(out)
}
