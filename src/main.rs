#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Lansend node entrypoint (systemd-friendly).
//! Starts discovery and the listener, then waits for a shutdown signal.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lansend::core::events::{ProgressUpdate, TransferObserver};
use lansend::core::types::{DeviceInfo, FileInfo, NodeConfig, Pin, Protocol};
use lansend::node::Node;

fn env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Config from an optional TOML file plus env overrides.
fn load_config() -> NodeConfig {
    let mut cfg = match std::env::var("LANSEND_CONFIG") {
        Ok(path) => match NodeConfig::from_file(&path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("config {path}: {e}");
                std::process::exit(2);
            }
        },
        Err(_) => {
            let mut c = NodeConfig::default();
            c.apply_env();
            c
        }
    };

    if let Ok(alias) = std::env::var("LANSEND_ALIAS") {
        cfg.node.alias = alias;
    }
    if let Ok(port) = std::env::var("LANSEND_PORT") {
        match port.parse::<u16>() {
            Ok(p) if p != 0 => cfg.http.port = p,
            _ => {
                eprintln!("LANSEND_PORT: invalid-config: port outside [1, 65535]");
                std::process::exit(2);
            }
        }
    }
    if env("LANSEND_PROTOCOL", "http") == "https" {
        cfg.http.protocol = Protocol::Https;
    }
    if let Ok(dir) = std::env::var("LANSEND_SAVE_DIR") {
        cfg.node.save_dir = dir;
    }
    if let Ok(pin) = std::env::var("LANSEND_PIN") {
        if !pin.trim().is_empty() {
            cfg.http.pin = Some(Pin(pin));
        }
    }
    cfg
}

/// Headless host policy: accept everything, narrate progress to the log.
fn headless_observer() -> TransferObserver {
    TransferObserver {
        on_request: Some(Arc::new(|sender: &DeviceInfo, files: &[FileInfo]| {
            let total: u64 = files.iter().map(|f| f.size).sum();
            info!(
                from = %sender.alias,
                files = files.len(),
                bytes = total,
                "incoming transfer accepted"
            );
            true
        })),
        on_progress: Some(Arc::new(|p: &ProgressUpdate| {
            if p.finished {
                if let Some(c) = &p.completion {
                    info!(
                        file = %p.file_name,
                        path = %c.file_path.display(),
                        secs = %format!("{:.2}", c.total_time_seconds),
                        rate = %format!("{:.0}", c.average_speed),
                        "transfer complete"
                    );
                }
            }
        })),
    }
}

#[tokio::main]
async fn main() {
    // RUST_LOG wins when set; otherwise LOCALSEND_DEBUG_DISCOVERY=1 raises
    // this crate to debug for discovery tracing.
    let default_directives = if std::env::var("LOCALSEND_DEBUG_DISCOVERY")
        .map(|v| v.trim() == "1")
        .unwrap_or(false)
    {
        "info,lansend=debug"
    } else {
        "info"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directives)),
        )
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init();

    let cfg = load_config();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git = option_env!("VERGEN_GIT_SHA").unwrap_or("unknown"),
        built = option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("unknown"),
        "lansend starting"
    );

    let node = match Node::start(cfg, headless_observer()).await {
        Ok(n) => n,
        Err(e) => {
            error!(err = %e, "node start failed");
            std::process::exit(1);
        }
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(err = %e, "signal handler failed; shutting down"),
    }
    node.stop().await;
}
