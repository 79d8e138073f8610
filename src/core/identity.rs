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

//! Device identity: the advertised descriptor and its per-process
//! fingerprint.
//!
//! The fingerprint is 32 random bytes rendered as lowercase hex, regenerated
//! at every startup. It uniquely identifies this process to peers for the
//! duration of the run; discovery drops any traffic carrying our own
//! fingerprint.

use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

use crate::core::types::{DeviceInfo, DeviceType, NodeConfig, PROTOCOL_VERSION};

/// Identity errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// System RNG failure.
    #[error("rng")]
    Rng,
}

/// `n` random bytes rendered as lowercase hex.
pub fn random_hex(n: usize) -> Result<String, IdentityError> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; n];
    rng.fill(&mut buf).map_err(|_| IdentityError::Rng)?;
    Ok(hex::encode(buf))
}

/// Fresh 32-byte fingerprint (64 hex chars).
pub fn generate_fingerprint() -> Result<String, IdentityError> {
    random_hex(32)
}

/// Infer the device classification from environment hints: `server` under a
/// service manager, `headless` without a display, `desktop` otherwise.
pub fn infer_device_type() -> DeviceType {
    if std::env::var_os("INVOCATION_ID").is_some() {
        return DeviceType::Server;
    }
    let has_display = std::env::var_os("DISPLAY").is_some()
        || std::env::var_os("WAYLAND_DISPLAY").is_some()
        || cfg!(any(target_os = "macos", target_os = "windows"));
    if has_display {
        DeviceType::Desktop
    } else {
        DeviceType::Headless
    }
}

/// Build this node's advertised descriptor from its configuration, with a
/// freshly generated fingerprint.
pub fn local_device(cfg: &NodeConfig) -> Result<DeviceInfo, IdentityError> {
    Ok(DeviceInfo {
        alias: cfg.node.alias.clone(),
        version: PROTOCOL_VERSION.to_string(),
        device_model: cfg.node.device_model.clone(),
        device_type: cfg.node.device_type.unwrap_or_else(infer_device_type),
        fingerprint: generate_fingerprint()?,
        port: cfg.http.port,
        protocol: cfg.http.protocol,
        download: cfg.node.download_api,
        ip: None,
    })
}
