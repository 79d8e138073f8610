#![forbid(unsafe_code)]

//! End-to-end transfers against a live listener on loopback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};

use lansend::core::events::{ProgressUpdate, TransferObserver};
use lansend::core::identity;
use lansend::core::session::SessionManager;
use lansend::core::types::{DeviceInfo, DeviceType, FileInfo, Pin, Protocol};
use lansend::monitoring::metrics::Metrics;
use lansend::networking::client::{ClientConfig, ClientError, HttpClient, Target};
use lansend::networking::registry::PeerRegistry;
use lansend::server::{self, AppState, ServerHandle};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn test_device(alias: &str) -> DeviceInfo {
    DeviceInfo {
        alias: alias.to_string(),
        version: "2.0".to_string(),
        device_model: None,
        device_type: DeviceType::Headless,
        fingerprint: identity::generate_fingerprint().expect("rng"),
        port: 53317,
        protocol: Protocol::Http,
        download: false,
        ip: None,
    }
}

struct Receiver {
    addr: SocketAddr,
    sessions: Arc<SessionManager>,
    save_dir: tempfile::TempDir,
    server: ServerHandle,
}

impl Receiver {
    fn saved(&self, name: &str) -> PathBuf {
        self.save_dir.path().join(name)
    }

    fn target(&self) -> Target {
        Target {
            ip: LOCALHOST,
            port: self.addr.port(),
            protocol: Protocol::Http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}/api/localsend/v2/{path}", self.addr.port())
    }
}

async fn start_receiver(pin: Option<&str>, observer: TransferObserver) -> Receiver {
    let metrics = Arc::new(Metrics::new().expect("metrics"));
    let save_dir = tempfile::tempdir().expect("tempdir");
    let sessions = Arc::new(SessionManager::new(Duration::from_secs(600), metrics.clone()));
    let registry = Arc::new(PeerRegistry::new(metrics));

    let state = Arc::new(AppState {
        device: test_device("receiver"),
        sessions: sessions.clone(),
        registry,
        observer,
        pin: pin.map(|p| Pin(p.to_string())),
        save_dir: save_dir.path().to_path_buf(),
        body_limit: 5 * 1024 * 1024 * 1024,
    });

    let server = server::spawn(state, Protocol::Http, 0, None)
        .await
        .expect("spawn server");
    let addr = server.local_addr().await.expect("bound addr");

    Receiver {
        addr,
        sessions,
        save_dir,
        server,
    }
}

fn sender_client(chunk_threshold: u64, chunk_size: u64) -> HttpClient {
    HttpClient::new(
        test_device("sender"),
        ClientConfig {
            prefer: Protocol::Http,
            allow_insecure_tls: true,
            chunk_threshold,
            chunk_size,
        },
    )
    .expect("client")
}

fn descriptor(id: &str, name: &str, payload: &[u8]) -> FileInfo {
    FileInfo {
        id: id.to_string(),
        file_name: name.to_string(),
        size: payload.len() as u64,
        file_type: "application/octet-stream".to_string(),
        sha256: Some(hex::encode(Sha256::digest(payload))),
        preview: None,
        metadata: None,
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn write_source(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    tokio::fs::write(&path, bytes).await.expect("write source");
    path
}

#[tokio::test]
async fn single_shot_transfer_end_to_end() {
    let progress: Arc<Mutex<Vec<ProgressUpdate>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = progress.clone();
    let observer = TransferObserver {
        on_request: Some(Arc::new(|_, _| true)),
        on_progress: Some(Arc::new(move |p| sink.lock().unwrap().push(p.clone()))),
    };
    let receiver = start_receiver(None, observer).await;

    let client = sender_client(50 * 1024 * 1024, 10 * 1024 * 1024);
    let bytes = payload(1_048_576);
    let src_dir = tempfile::tempdir().expect("tempdir");
    let src = write_source(&src_dir, "report.pdf", &bytes).await;

    let file = descriptor("file-1", "report.pdf", &bytes);
    let negotiated = client
        .prepare_upload(receiver.target(), &[file.clone()], None)
        .await
        .expect("prepare");
    assert_eq!(negotiated.session_id.len(), 32);
    assert_eq!(negotiated.files.len(), 1);

    let token = negotiated.files.get("file-1").expect("token");
    client
        .upload_file(
            receiver.target(),
            &negotiated.session_id,
            "file-1",
            token,
            &src,
            None,
        )
        .await
        .expect("upload");

    let written = tokio::fs::read(receiver.saved("report.pdf"))
        .await
        .expect("written file");
    assert_eq!(written, bytes);
    assert_eq!(
        hex::encode(Sha256::digest(&written)),
        file.sha256.clone().unwrap()
    );
    assert_eq!(receiver.sessions.active_count(), 0);

    {
        let updates = progress.lock().unwrap();
        assert!(!updates.is_empty());
        let last = updates.last().unwrap();
        assert!(last.finished);
        let completion = last.completion.as_ref().expect("completion info");
        assert_eq!(completion.file_path, receiver.saved("report.pdf"));
        assert_eq!(last.bytes_received, bytes.len() as u64);
    }

    receiver.server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn chunked_and_single_shot_produce_identical_files() {
    let bytes = payload(2_500);
    let src_dir = tempfile::tempdir().expect("tempdir");
    let src = write_source(&src_dir, "data.bin", &bytes).await;

    // Chunked: threshold below the file size forces three ranged requests.
    let chunked_rx = start_receiver(None, TransferObserver::accept_all()).await;
    let chunked_tx = sender_client(1_000, 1_000);
    let file = descriptor("f", "data.bin", &bytes);
    let negotiated = chunked_tx
        .prepare_upload(chunked_rx.target(), &[file.clone()], None)
        .await
        .expect("prepare");
    chunked_tx
        .upload_file(
            chunked_rx.target(),
            &negotiated.session_id,
            "f",
            negotiated.files.get("f").unwrap(),
            &src,
            None,
        )
        .await
        .expect("chunked upload");

    // Single shot: threshold above the file size.
    let single_rx = start_receiver(None, TransferObserver::accept_all()).await;
    let single_tx = sender_client(1_000_000, 1_000);
    let negotiated = single_tx
        .prepare_upload(single_rx.target(), &[file.clone()], None)
        .await
        .expect("prepare");
    single_tx
        .upload_file(
            single_rx.target(),
            &negotiated.session_id,
            "f",
            negotiated.files.get("f").unwrap(),
            &src,
            None,
        )
        .await
        .expect("single-shot upload");

    let a = tokio::fs::read(chunked_rx.saved("data.bin")).await.unwrap();
    let b = tokio::fs::read(single_rx.saved("data.bin")).await.unwrap();
    assert_eq!(a, bytes);
    assert_eq!(a, b);
    assert_eq!(chunked_rx.sessions.active_count(), 0);
    assert_eq!(single_rx.sessions.active_count(), 0);

    chunked_rx.server.shutdown(Duration::from_secs(1)).await;
    single_rx.server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn wrong_pin_answers_401_without_consulting_the_host() {
    let consulted = Arc::new(AtomicBool::new(false));
    let flag = consulted.clone();
    let observer = TransferObserver {
        on_request: Some(Arc::new(move |_, _| {
            flag.store(true, Ordering::SeqCst);
            true
        })),
        on_progress: None,
    };
    let receiver = start_receiver(Some("123456"), observer).await;
    let client = sender_client(1_000_000, 1_000);
    let file = descriptor("f", "x.bin", b"abcd");

    let err = client
        .prepare_upload(receiver.target(), &[file.clone()], Some("000000"))
        .await
        .expect_err("wrong pin");
    assert!(matches!(err, ClientError::PinRequired));

    let err = client
        .prepare_upload(receiver.target(), &[file.clone()], None)
        .await
        .expect_err("missing pin");
    assert!(matches!(err, ClientError::PinRequired));

    assert!(!consulted.load(Ordering::SeqCst));
    assert_eq!(receiver.sessions.active_count(), 0);

    // The right PIN opens a session, still without consulting the host.
    client
        .prepare_upload(receiver.target(), &[file], Some("123456"))
        .await
        .expect("correct pin");
    assert!(!consulted.load(Ordering::SeqCst));
    assert_eq!(receiver.sessions.active_count(), 1);

    receiver.server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn rejection_by_the_host_answers_403() {
    let observer = TransferObserver {
        on_request: Some(Arc::new(|_, _| false)),
        on_progress: None,
    };
    let receiver = start_receiver(None, observer).await;
    let client = sender_client(1_000_000, 1_000);

    let err = client
        .prepare_upload(receiver.target(), &[descriptor("f", "x.bin", b"abcd")], None)
        .await
        .expect_err("rejected");
    assert!(matches!(err, ClientError::Rejected));
    assert_eq!(receiver.sessions.active_count(), 0);

    receiver.server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn upload_without_params_is_400() {
    let receiver = start_receiver(None, TransferObserver::accept_all()).await;
    let http = reqwest::Client::new();
    let resp = http
        .post(receiver.url("upload"))
        .body("data")
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 400);
    receiver.server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn cancel_mid_transfer_kills_later_chunks() {
    let receiver = start_receiver(None, TransferObserver::accept_all()).await;
    let client = sender_client(1_000_000, 1_000);
    let bytes = payload(30);
    let file = descriptor("f", "partial.bin", &bytes);

    let negotiated = client
        .prepare_upload(receiver.target(), &[file], None)
        .await
        .expect("prepare");
    let token = negotiated.files.get("f").unwrap().clone();
    let http = reqwest::Client::new();
    let query = [
        ("sessionId", negotiated.session_id.clone()),
        ("fileId", "f".to_string()),
        ("token", token),
    ];

    let resp = http
        .post(receiver.url("upload"))
        .query(&query)
        .header("X-Content-Range", "bytes 0-9/30")
        .body(bytes[..10].to_vec())
        .send()
        .await
        .expect("chunk 1");
    assert_eq!(resp.status(), 200);

    assert!(client
        .cancel_session(receiver.target(), &negotiated.session_id)
        .await);
    assert_eq!(receiver.sessions.active_count(), 0);

    // Cancel is idempotent on the wire.
    assert!(client
        .cancel_session(receiver.target(), &negotiated.session_id)
        .await);

    let resp = http
        .post(receiver.url("upload"))
        .query(&query)
        .header("X-Content-Range", "bytes 10-19/30")
        .body(bytes[10..20].to_vec())
        .send()
        .await
        .expect("chunk 2");
    assert_eq!(resp.status(), 404);

    receiver.server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn second_peer_is_blocked_until_the_first_session_dies() {
    let receiver = start_receiver(None, TransferObserver::accept_all()).await;
    let client = sender_client(1_000_000, 1_000);
    let file = descriptor("f", "x.bin", b"abcd");

    let first = client
        .prepare_upload(receiver.target(), &[file.clone()], None)
        .await
        .expect("first peer");

    // A second peer shows up from another loopback address.
    let other = reqwest::Client::builder()
        .local_address(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)))
        .build()
        .expect("client");
    let body = serde_json::json!({
        "info": test_device("intruder"),
        "files": { "g": descriptor("g", "y.bin", b"efgh") },
    });
    let resp = other
        .post(receiver.url("prepare-upload"))
        .json(&body)
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 409);
    let msg: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(msg["message"], "Blocked by another session");

    // Once the active session is gone the other peer gets in.
    assert!(client
        .cancel_session(receiver.target(), &first.session_id)
        .await);
    let resp = other
        .post(receiver.url("prepare-upload"))
        .json(&body)
        .send()
        .await
        .expect("retry");
    assert_eq!(resp.status(), 200);

    receiver.server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn zero_size_file_completes() {
    let receiver = start_receiver(None, TransferObserver::accept_all()).await;
    let client = sender_client(1_000_000, 1_000);
    let src_dir = tempfile::tempdir().expect("tempdir");
    let src = write_source(&src_dir, "empty.bin", b"").await;

    let file = descriptor("f", "empty.bin", b"");
    let negotiated = client
        .prepare_upload(receiver.target(), &[file], None)
        .await
        .expect("prepare");
    client
        .upload_file(
            receiver.target(),
            &negotiated.session_id,
            "f",
            negotiated.files.get("f").unwrap(),
            &src,
            None,
        )
        .await
        .expect("upload");

    let meta = tokio::fs::metadata(receiver.saved("empty.bin"))
        .await
        .expect("empty file exists");
    assert_eq!(meta.len(), 0);
    assert_eq!(receiver.sessions.active_count(), 0);

    receiver.server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn range_total_mismatch_is_400_and_touches_nothing() {
    let receiver = start_receiver(None, TransferObserver::accept_all()).await;
    let client = sender_client(1_000_000, 1_000);
    let bytes = payload(10);
    let file = descriptor("f", "strict.bin", &bytes);

    let negotiated = client
        .prepare_upload(receiver.target(), &[file], None)
        .await
        .expect("prepare");
    let http = reqwest::Client::new();
    let resp = http
        .post(receiver.url("upload"))
        .query(&[
            ("sessionId", negotiated.session_id.as_str()),
            ("fileId", "f"),
            ("token", negotiated.files.get("f").unwrap().as_str()),
        ])
        .header("X-Content-Range", "bytes 0-4/20")
        .body(bytes[..5].to_vec())
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 400);

    // No partial file appeared and the session survived.
    assert!(tokio::fs::metadata(receiver.saved("strict.bin")).await.is_err());
    assert_eq!(receiver.sessions.active_count(), 1);

    receiver.server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn one_byte_ranged_terminal_chunk() {
    let receiver = start_receiver(None, TransferObserver::accept_all()).await;
    let client = sender_client(1_000_000, 1_000);
    let file = descriptor("f", "one.bin", b"x");

    let negotiated = client
        .prepare_upload(receiver.target(), &[file], None)
        .await
        .expect("prepare");
    let http = reqwest::Client::new();
    let resp = http
        .post(receiver.url("upload"))
        .query(&[
            ("sessionId", negotiated.session_id.as_str()),
            ("fileId", "f"),
            ("token", negotiated.files.get("f").unwrap().as_str()),
        ])
        .header("X-Content-Range", "bytes 0-0/1")
        .body("x")
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 200);
    let msg: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(msg["message"], "File received");

    let written = tokio::fs::read(receiver.saved("one.bin")).await.unwrap();
    assert_eq!(written, b"x");
    assert_eq!(receiver.sessions.active_count(), 0);

    receiver.server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn payload_beyond_declared_size_is_rejected() {
    let receiver = start_receiver(None, TransferObserver::accept_all()).await;
    let client = sender_client(1_000_000, 1_000);
    let file = descriptor("f", "tight.bin", b"abcd");

    let negotiated = client
        .prepare_upload(receiver.target(), &[file], None)
        .await
        .expect("prepare");
    let http = reqwest::Client::new();
    let query = [
        ("sessionId", negotiated.session_id.clone()),
        ("fileId", "f".to_string()),
        ("token", negotiated.files.get("f").unwrap().clone()),
    ];

    let resp = http
        .post(receiver.url("upload"))
        .query(&query)
        .body("abcdefgh")
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 400);
    assert_eq!(receiver.sessions.active_count(), 1);

    // The retry with the declared size still lands.
    let resp = http
        .post(receiver.url("upload"))
        .query(&query)
        .body("abcd")
        .send()
        .await
        .expect("retry");
    assert_eq!(resp.status(), 200);
    assert_eq!(receiver.sessions.active_count(), 0);

    receiver.server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn descriptor_paths_collapse_to_their_basename() {
    let receiver = start_receiver(None, TransferObserver::accept_all()).await;
    let client = sender_client(1_000_000, 1_000);
    let bytes = payload(16);
    let mut file = descriptor("f", "nested/dir/inner.txt", &bytes);
    file.size = bytes.len() as u64;

    let negotiated = client
        .prepare_upload(receiver.target(), &[file], None)
        .await
        .expect("prepare");
    let http = reqwest::Client::new();
    let resp = http
        .post(receiver.url("upload"))
        .query(&[
            ("sessionId", negotiated.session_id.as_str()),
            ("fileId", "f"),
            ("token", negotiated.files.get("f").unwrap().as_str()),
        ])
        .body(bytes.clone())
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 200);
    assert_eq!(
        tokio::fs::read(receiver.saved("inner.txt")).await.unwrap(),
        bytes
    );

    receiver.server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn dot_dot_components_are_refused() {
    let receiver = start_receiver(None, TransferObserver::accept_all()).await;
    let client = sender_client(1_000_000, 1_000);
    let file = descriptor("f", "../../escape.txt", b"evil");

    let negotiated = client
        .prepare_upload(receiver.target(), &[file], None)
        .await
        .expect("prepare");
    let http = reqwest::Client::new();
    let resp = http
        .post(receiver.url("upload"))
        .query(&[
            ("sessionId", negotiated.session_id.as_str()),
            ("fileId", "f"),
            ("token", negotiated.files.get("f").unwrap().as_str()),
        ])
        .body("evil")
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 400);

    receiver.server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn info_and_register_round_trip() {
    let receiver = start_receiver(None, TransferObserver::accept_all()).await;
    let client = sender_client(1_000_000, 1_000);

    let info = client
        .info(LOCALHOST, receiver.addr.port())
        .await
        .expect("info");
    assert_eq!(info.alias, "receiver");
    assert_eq!(info.ip, Some(LOCALHOST));

    let registered = client.register(receiver.target()).await.expect("register");
    assert_eq!(registered.alias, "receiver");

    receiver.server.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn empty_prepare_upload_answers_204() {
    let receiver = start_receiver(None, TransferObserver::accept_all()).await;
    let client = sender_client(1_000_000, 1_000);

    let negotiated = client
        .prepare_upload(receiver.target(), &[], None)
        .await
        .expect("204 maps to empty tokens");
    assert!(negotiated.files.is_empty());
    assert!(negotiated.session_id.is_empty());
    assert_eq!(receiver.sessions.active_count(), 0);

    receiver.server.shutdown(Duration::from_secs(1)).await;
}
