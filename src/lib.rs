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

//! Lansend - a serverless LAN file-sharing node speaking the LocalSend v2
//! wire protocol.
//!
//! Every node is simultaneously a sender and a receiver:
//! - Dual-mechanism peer discovery: UDP multicast announcements on
//!   `224.0.0.167:53317` plus an HTTP subnet-scan fallback, deduplicated
//!   into one fingerprint-keyed registry
//! - Prepare-upload negotiation with per-file tokens, single-peer-at-a-time
//!   admission and an idle TTL
//! - Range-based resumable uploads streamed to disk with backpressure and
//!   progress accounting
//! - HTTP or HTTPS transport (self-signed certificates provisioned on
//!   demand), Prometheus metrics and structured logging

/// Core protocol primitives (wire types, identity, sessions, events).
pub mod core;
/// Observability (Prometheus metrics).
pub mod monitoring;
/// Peer discovery, the peer registry and the outbound HTTP client.
pub mod networking;
/// Node lifecycle wiring.
pub mod node;
/// Inbound HTTP surface.
pub mod server;
