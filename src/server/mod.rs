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
#![allow(missing_docs)]

//! Inbound HTTP surface: router, upload streaming, TLS provisioning.

pub mod routes;
pub mod tls;
pub mod upload;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::core::types::Protocol;
pub use routes::AppState;

/// A running listener and its drain handle.
pub struct ServerHandle {
    handle: axum_server::Handle,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// The bound address, once the listener is up. Useful with port 0.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.listening().await
    }

    /// Stop accepting, drain in-flight handlers within `grace`, then stop.
    pub async fn shutdown(self, grace: Duration) {
        self.handle.graceful_shutdown(Some(grace));
        let _ = self.task.await;
    }
}

/// Bind and serve the protocol endpoints over the configured transport.
pub async fn spawn(
    state: Arc<AppState>,
    protocol: Protocol,
    port: u16,
    cert_dir: Option<PathBuf>,
) -> anyhow::Result<ServerHandle> {
    let app = routes::router(state).into_make_service_with_connect_info::<SocketAddr>();
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let handle = axum_server::Handle::new();

    let task = match protocol {
        Protocol::Http => {
            let server = axum_server::bind(addr).handle(handle.clone());
            tokio::spawn(async move {
                if let Err(e) = server.serve(app).await {
                    error!(err = %e, "http server error");
                }
            })
        }
        Protocol::Https => {
            let dir = cert_dir.unwrap_or_else(|| PathBuf::from("./certs"));
            let runtime = tls::load_or_generate(&dir, "lansend")?;
            let rustls = RustlsConfig::from_pem_file(&runtime.cert_path, &runtime.key_path).await?;
            let server = axum_server::bind_rustls(addr, rustls).handle(handle.clone());
            tokio::spawn(async move {
                if let Err(e) = server.serve(app).await {
                    error!(err = %e, "https server error");
                }
            })
        }
    };

    info!(port, %protocol, "listener starting");
    Ok(ServerHandle { handle, task })
}
