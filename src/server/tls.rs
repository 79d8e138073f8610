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

//! Self-signed TLS certificate provisioning for `protocol = "https"`.
//!
//! ECDSA P-256 via `rcgen`, PEM files on disk, regenerated when missing or
//! older than the validity window. Peers on a LAN verify nothing beyond the
//! transport by default; the SHA-256 fingerprint is logged at startup so a
//! cautious operator can pin it.

use std::path::{Path, PathBuf};

use anyhow::Context;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls_pemfile::certs;
use sha2::{Digest, Sha256};
use tracing::info;

const CERT_FILE: &str = "lansend-cert.pem";
const KEY_FILE: &str = "lansend-key.pem";
const CERT_VALIDITY_DAYS: u64 = 90;

/// Paths and identity of the serving certificate.
pub struct TlsRuntime {
    /// PEM certificate path.
    pub cert_path: PathBuf,
    /// PEM key path.
    pub key_path: PathBuf,
    /// Hex SHA-256 of the DER certificate, for pinning/display.
    pub fingerprint_sha256: String,
}

/// Load the node certificate from `cert_dir`, generating a fresh self-signed
/// one when missing or stale.
pub fn load_or_generate(cert_dir: &Path, common_name: &str) -> anyhow::Result<TlsRuntime> {
    let cert_path = cert_dir.join(CERT_FILE);
    let key_path = cert_dir.join(KEY_FILE);

    if !cert_path.exists() || !key_path.exists() || is_stale(&cert_path) {
        generate_self_signed(cert_dir, &cert_path, &key_path, common_name)?;
    }

    let cert_pem =
        std::fs::read(&cert_path).with_context(|| format!("reading {}", cert_path.display()))?;
    let mut reader = std::io::Cursor::new(&cert_pem);
    let first = certs(&mut reader)
        .next()
        .ok_or_else(|| anyhow::anyhow!("no certificate in {}", cert_path.display()))?
        .context("parsing certificate")?;
    let fingerprint_sha256 = hex::encode(Sha256::digest(&first));

    info!(fingerprint = %fingerprint_sha256, cert = %cert_path.display(), "tls certificate loaded");
    Ok(TlsRuntime {
        cert_path,
        key_path,
        fingerprint_sha256,
    })
}

fn generate_self_signed(
    cert_dir: &Path,
    cert_path: &Path,
    key_path: &Path,
    common_name: &str,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(cert_dir)
        .with_context(|| format!("creating {}", cert_dir.display()))?;

    let key_pair = KeyPair::generate().context("generating key pair")?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    let mut params = CertificateParams::new(vec![common_name.to_string()])
        .context("building cert params")?;
    params.distinguished_name = dn;

    let cert = params
        .self_signed(&key_pair)
        .context("self-signing certificate")?;

    std::fs::write(cert_path, cert.pem())
        .with_context(|| format!("writing {}", cert_path.display()))?;
    write_key(key_path, key_pair.serialize_pem().as_bytes())?;

    info!(cert = %cert_path.display(), "generated self-signed certificate");
    Ok(())
}

// Certificates are cheap to mint; file age stands in for parsing notAfter.
fn is_stale(cert_path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(cert_path) else {
        return true;
    };
    let Ok(modified) = meta.modified() else {
        return true;
    };
    let age_days = modified.elapsed().unwrap_or_default().as_secs() / 86_400;
    age_days >= CERT_VALIDITY_DAYS
}

fn write_key(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("writing {}", path.display()))?;
        f.write_all(data)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}
