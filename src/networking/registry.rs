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

//! Node-local registry of observed peers.
//!
//! Keyed by fingerprint, not by address: the same device reached over
//! multicast and over a subnet scan collapses into one entry. Insertion is
//! last-write-wins and there is no TTL eviction within a run; stale peers
//! are cheap to re-probe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::core::types::DeviceInfo;
use crate::monitoring::metrics::Metrics;

/// Listener invoked on every insert, including refreshes of an already-known
/// fingerprint (callers may want to bump UI freshness timestamps).
pub type PeerListener = Arc<dyn Fn(&DeviceInfo) + Send + Sync>;

/// In-memory peer set shared by both discovery channels.
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, DeviceInfo>>,
    listeners: Mutex<Vec<PeerListener>>,
    metrics: Arc<Metrics>,
}

impl PeerRegistry {
    /// New empty registry.
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            metrics,
        }
    }

    /// Insert or refresh a peer. Listeners run outside the lock.
    pub fn insert(&self, device: DeviceInfo) {
        {
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            debug!(
                fingerprint = %device.fingerprint,
                alias = %device.alias,
                ip = ?device.ip,
                "peer observed"
            );
            peers.insert(device.fingerprint.clone(), device.clone());
            self.metrics.peers_known.set(peers.len() as i64);
        }

        let listeners: Vec<PeerListener> = {
            let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        for l in listeners {
            l(&device);
        }
    }

    /// Register a listener for future inserts.
    pub fn subscribe(&self, listener: PeerListener) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Last-seen descriptor for a fingerprint.
    pub fn get(&self, fingerprint: &str) -> Option<DeviceInfo> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(fingerprint)
            .cloned()
    }

    /// Snapshot of all known peers.
    pub fn list(&self) -> Vec<DeviceInfo> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True when no peer has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
