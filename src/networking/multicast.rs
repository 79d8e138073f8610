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

//! UDP multicast discoverer.
//!
//! One receive socket is bound with `SO_REUSEADDR` to `0.0.0.0:53317` and
//! joins `224.0.0.167` on every non-loopback IPv4 interface (or the default
//! interface when enumeration yields nothing). Join failures are logged and
//! skipped; the node continues with partial coverage.
//!
//! Announcing uses one send socket per interface, each pinned to its
//! interface via `IP_MULTICAST_IF` at setup. `announce()` sends a triple
//! burst at offsets {100 ms, 500 ms, 2000 ms} on every interface to
//! mitigate single-datagram loss. All sends are serialised behind one lock.
//!
//! On reception: parse, drop self-traffic by fingerprint, attach the source
//! address, answer solicitations (HTTP register, UDP reply fallback), then
//! insert into the registry. The registry lock is never held across I/O.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::core::types::{Announcement, DeviceInfo, NodeConfig, DEFAULT_PORT, MULTICAST_GROUP};
use crate::monitoring::metrics::Metrics;
use crate::networking::client::{HttpClient, Target};
use crate::networking::interfaces;
use crate::networking::registry::PeerRegistry;
use crate::networking::Discovery;

/// Announcement burst offsets from `announce()`.
const BURST_OFFSETS_MS: [u64; 3] = [100, 500, 2000];

/// Multicast settings.
#[derive(Clone, Debug)]
pub struct MulticastConfig {
    /// Multicast group to join.
    pub group: Ipv4Addr,
    /// UDP port (same number as the HTTP endpoint by protocol convention).
    pub port: u16,
    /// Verbose datagram tracing.
    pub debug: bool,
}

impl From<&NodeConfig> for MulticastConfig {
    fn from(cfg: &NodeConfig) -> Self {
        Self {
            group: MULTICAST_GROUP,
            port: DEFAULT_PORT,
            debug: cfg.discovery.debug,
        }
    }
}

// Shared by the listener task and the channel handle.
struct Inner {
    cfg: MulticastConfig,
    device: DeviceInfo,
    registry: Arc<PeerRegistry>,
    client: Arc<HttpClient>,
    metrics: Arc<Metrics>,
    recv_socket: Arc<UdpSocket>,
    // setMulticastInterface is per-socket state: one socket per interface,
    // all sends serialised behind this lock.
    send_sockets: Mutex<Vec<UdpSocket>>,
}

impl Inner {
    async fn send_burst(&self, announce: bool) {
        let msg = Announcement::outgoing(self.device.clone(), announce);
        let bytes = match msg.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(err = %e, "announcement encode failed");
                return;
            }
        };
        let dest = SocketAddr::V4(SocketAddrV4::new(self.cfg.group, self.cfg.port));

        let sockets = self.send_sockets.lock().await;
        for socket in sockets.iter() {
            match socket.send_to(&bytes, dest).await {
                Ok(n) => {
                    self.metrics.announcements_sent_total.inc();
                    if self.cfg.debug {
                        trace!(bytes = n, dest = %dest, "announcement sent");
                    }
                }
                Err(e) => warn!(err = %e, "announcement send failed"),
            }
        }
    }
}

async fn handle_datagram(inner: &Arc<Inner>, data: &[u8], src: SocketAddr) {
    let msg = match Announcement::decode(data) {
        Ok(m) => m,
        Err(e) => {
            inner.metrics.announcements_invalid_total.inc();
            if inner.cfg.debug {
                debug!(src = %src, err = %e, "dropping malformed datagram");
            }
            return;
        }
    };
    inner.metrics.announcements_received_total.inc();

    if msg.device.fingerprint == inner.device.fingerprint {
        // Our own datagram looping back.
        return;
    }

    let mut peer = msg.device.clone();
    peer.ip = Some(src.ip());
    if inner.cfg.debug {
        debug!(
            src = %src,
            alias = %peer.alias,
            fingerprint = %peer.fingerprint,
            "announcement received"
        );
    }

    if msg.is_solicitation() {
        // Answer outside the receive loop: register over HTTP, falling
        // back to a unicast UDP response, then record the peer.
        let inner = inner.clone();
        tokio::spawn(async move {
            let target = Target {
                ip: src.ip(),
                port: peer.port,
                protocol: peer.protocol,
            };
            if inner.client.register(target).await.is_none() {
                let reply = Announcement::outgoing(inner.device.clone(), false);
                if let Ok(bytes) = reply.encode() {
                    let dest = SocketAddr::new(src.ip(), peer.port);
                    if let Err(e) = inner.recv_socket.send_to(&bytes, dest).await {
                        debug!(dest = %dest, err = %e, "udp response failed");
                    }
                }
            }
            inner.registry.insert(peer);
        });
    } else {
        inner.registry.insert(peer);
    }
}

/// The multicast discovery channel.
pub struct MulticastDiscovery {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

fn multicast_recv_socket(cfg: &MulticastConfig) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let bind: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, cfg.port));
    socket.bind(&bind.into())?;

    let addrs = interfaces::local_ipv4_addrs();
    let mut joined = 0usize;
    for addr in &addrs {
        match socket.join_multicast_v4(&cfg.group, addr) {
            Ok(()) => joined += 1,
            Err(e) => warn!(iface = %addr, err = %e, "join_multicast failed; skipping interface"),
        }
    }
    if joined == 0 {
        // Enumeration failed or every join errored: fall back to the
        // default interface.
        socket.join_multicast_v4(&cfg.group, &Ipv4Addr::UNSPECIFIED)?;
        joined = 1;
    }
    info!(group = %cfg.group, port = cfg.port, interfaces = joined, "multicast group joined");

    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

fn send_socket_for(iface: Ipv4Addr) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_reuse_address(true)?;
    if iface != Ipv4Addr::UNSPECIFIED {
        socket.set_multicast_if_v4(&iface)?;
    }
    // TTL 1: announcements stay on the local subnet. Loopback on, so two
    // nodes on one host still see each other.
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    let bind: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    socket.bind(&bind.into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

impl MulticastDiscovery {
    /// Bind sockets and prepare the channel. No traffic flows until
    /// [`Discovery::start`].
    pub fn new(
        cfg: MulticastConfig,
        device: DeviceInfo,
        registry: Arc<PeerRegistry>,
        client: Arc<HttpClient>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let recv_socket = Arc::new(multicast_recv_socket(&cfg)?);

        let mut send_sockets = Vec::new();
        for addr in interfaces::local_ipv4_addrs() {
            match send_socket_for(addr) {
                Ok(s) => send_sockets.push(s),
                Err(e) => warn!(iface = %addr, err = %e, "send socket failed; skipping interface"),
            }
        }
        if send_sockets.is_empty() {
            // Default interface only.
            send_sockets.push(send_socket_for(Ipv4Addr::UNSPECIFIED)?);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                cfg,
                device,
                registry,
                client,
                metrics,
                recv_socket,
                send_sockets: Mutex::new(send_sockets),
            }),
            cancel: CancellationToken::new(),
            listener: StdMutex::new(None),
        })
    }
}

#[async_trait::async_trait]
impl Discovery for MulticastDiscovery {
    fn name(&self) -> &'static str {
        "multicast"
    }

    async fn start(&self) -> anyhow::Result<()> {
        let cancel = self.cancel.clone();
        let inner = self.inner.clone();

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("multicast listener exiting");
                        break;
                    }
                    result = inner.recv_socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, src)) => handle_datagram(&inner, &buf[..len], src).await,
                            Err(e) => {
                                warn!(err = %e, "multicast recv error");
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                }
            }
        });

        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    async fn announce(&self) -> anyhow::Result<()> {
        let mut elapsed = 0u64;
        for offset in BURST_OFFSETS_MS {
            tokio::time::sleep(Duration::from_millis(offset - elapsed)).await;
            elapsed = offset;
            self.inner.send_burst(true).await;
        }
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }
}
