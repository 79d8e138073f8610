#![forbid(unsafe_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lansend::core::types::{DeviceInfo, DeviceType, NodeConfig, Protocol};
use lansend::monitoring::metrics::Metrics;
use lansend::networking::client::{ClientConfig, HttpClient};
use lansend::networking::multicast::{MulticastConfig, MulticastDiscovery};
use lansend::networking::registry::PeerRegistry;
use lansend::networking::scanner::candidate_hosts;
use lansend::networking::Discovery;

fn device(alias: &str, fingerprint: &str) -> DeviceInfo {
    DeviceInfo {
        alias: alias.to_string(),
        version: "2.0".to_string(),
        device_model: None,
        device_type: DeviceType::Headless,
        fingerprint: fingerprint.to_string(),
        port: 53317,
        protocol: Protocol::Http,
        download: false,
        ip: None,
    }
}

#[test]
fn candidate_hosts_cover_the_slash24_without_self() {
    let local = [Ipv4Addr::new(192, 168, 1, 42)];
    let hosts = candidate_hosts(&local);
    assert_eq!(hosts.len(), 253);
    assert!(!hosts.contains(&Ipv4Addr::new(192, 168, 1, 42)));
    assert!(hosts.contains(&Ipv4Addr::new(192, 168, 1, 1)));
    assert!(hosts.contains(&Ipv4Addr::new(192, 168, 1, 254)));
    assert!(!hosts.contains(&Ipv4Addr::new(192, 168, 1, 0)));
    assert!(!hosts.contains(&Ipv4Addr::new(192, 168, 1, 255)));
}

#[test]
fn candidate_hosts_merge_overlapping_subnets() {
    let local = [
        Ipv4Addr::new(192, 168, 1, 42),
        Ipv4Addr::new(192, 168, 1, 43),
        Ipv4Addr::new(10, 0, 0, 5),
    ];
    let hosts = candidate_hosts(&local);
    // One shared /24 (minus both local addresses) plus a second /24.
    assert_eq!(hosts.len(), 252 + 253);
    assert!(!hosts.contains(&Ipv4Addr::new(192, 168, 1, 43)));
    assert!(hosts.contains(&Ipv4Addr::new(10, 0, 0, 1)));
}

#[test]
fn registry_deduplicates_by_fingerprint_and_notifies_every_insert() {
    let metrics = Arc::new(Metrics::new().expect("metrics"));
    let registry = PeerRegistry::new(metrics);

    let notifications = Arc::new(AtomicUsize::new(0));
    let seen = notifications.clone();
    registry.subscribe(Arc::new(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    }));

    let mut peer = device("n2", "f2");
    peer.ip = Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)));
    registry.insert(peer.clone());
    assert_eq!(registry.len(), 1);

    // Same fingerprint from another channel: overwritten, not duplicated,
    // and the listener still fires (freshness refresh).
    peer.ip = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
    peer.alias = "n2-renamed".to_string();
    registry.insert(peer);
    assert_eq!(registry.len(), 1);
    assert_eq!(notifications.load(Ordering::SeqCst), 2);

    let stored = registry.get("f2").expect("stored");
    assert_eq!(stored.alias, "n2-renamed");
    assert_eq!(stored.ip, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))));

    registry.insert(device("n3", "f3"));
    assert_eq!(registry.len(), 2);
}

// Exercises real multicast sockets; filtered networks and sandboxes make it
// unreliable in CI.
#[tokio::test]
#[ignore = "requires a multicast-capable network"]
async fn two_nodes_discover_each_other_over_multicast() {
    let metrics_a = Arc::new(Metrics::new().unwrap());
    let metrics_b = Arc::new(Metrics::new().unwrap());
    let registry_a = Arc::new(PeerRegistry::new(metrics_a.clone()));
    let registry_b = Arc::new(PeerRegistry::new(metrics_b.clone()));

    let dev_a = device("node-a", &"aa".repeat(32));
    let dev_b = device("node-b", &"bb".repeat(32));

    let client_cfg = ClientConfig {
        prefer: Protocol::Http,
        allow_insecure_tls: true,
        chunk_threshold: 1,
        chunk_size: 1,
    };
    let client_a = Arc::new(HttpClient::new(dev_a.clone(), client_cfg.clone()).unwrap());
    let client_b = Arc::new(HttpClient::new(dev_b.clone(), client_cfg).unwrap());

    let cfg = MulticastConfig::from(&NodeConfig::default());
    let node_a = MulticastDiscovery::new(
        cfg.clone(),
        dev_a.clone(),
        registry_a.clone(),
        client_a,
        metrics_a,
    )
    .unwrap();
    let node_b = MulticastDiscovery::new(
        cfg,
        dev_b.clone(),
        registry_b.clone(),
        client_b,
        metrics_b,
    )
    .unwrap();

    node_a.start().await.unwrap();
    node_b.start().await.unwrap();
    node_a.announce().await.unwrap();

    // The burst spans 2 s; give the reply a moment more.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if registry_b.get(&dev_a.fingerprint).is_some()
            && registry_a.get(&dev_b.fingerprint).is_some()
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "peers did not discover each other in time"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Self-traffic never lands in a node's own registry.
    assert!(registry_a.get(&dev_a.fingerprint).is_none());
    assert!(registry_b.get(&dev_b.fingerprint).is_none());

    node_a.stop().await;
    node_b.stop().await;
}
