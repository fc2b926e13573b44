//! End-to-end scenarios over real sockets: local round-trips, two-node
//! replication, delete propagation, quota refusal, and PEX learning.

use peervault_crypto::{hash_key, EncryptionKey};
use peervault_network::{
    FileServer, PeerSource, PexConfig, ServerConfig, ServerError, TcpTransport, TransportConfig,
};
use peervault_storage::{GcConfig, QuotaManager};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

const GB: u64 = 1 << 30;

fn shared_key() -> EncryptionKey {
    EncryptionKey::from_bytes(&[1u8; 32])
}

fn fast_pex() -> PexConfig {
    PexConfig {
        warmup: Duration::from_millis(100),
        exchange_interval: Duration::from_millis(250),
        janitor_interval: Duration::from_secs(60),
        stale_after: Duration::from_secs(60),
        max_gossip_peers: 20,
    }
}

struct TestNode {
    server: Arc<FileServer>,
    addr: String,
    _tmp: TempDir,
}

async fn spawn_node(quota_bytes: u64, seeds: Vec<String>) -> TestNode {
    spawn_node_with(quota_bytes, seeds, None).await
}

async fn spawn_node_with(quota_bytes: u64, seeds: Vec<String>, pex: Option<PexConfig>) -> TestNode {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("vault");
    let quota = QuotaManager::create(&root, quota_bytes).unwrap();

    let mut transport_config = TransportConfig::new("127.0.0.1:0");
    transport_config.dial_timeout = Duration::from_secs(2);
    transport_config.max_retries = 3;
    transport_config.retry_delay = Duration::from_millis(50);
    let transport = TcpTransport::new(transport_config);

    let mut config = ServerConfig::new(shared_key(), root);
    config.seed_peers = seeds;
    config.get_response_wait = Duration::from_millis(300);
    config.stream_handover_wait = Duration::from_secs(3);
    // Keep the collector quiet during scenario runs.
    config.gc = GcConfig {
        initial_delay: Duration::from_secs(3600),
        sweep_interval: Duration::from_secs(3600),
        integrity_enabled: true,
    };
    let enable_pex = pex.is_some();
    if let Some(pex_config) = pex {
        config.pex = pex_config;
    }

    let server = FileServer::new(config, transport, quota).unwrap();
    if enable_pex {
        server.enable_pex();
    }
    server.start().await.unwrap();
    let addr = server
        .local_addr()
        .expect("server is listening")
        .to_string();
    TestNode {
        server,
        addr,
        _tmp: tmp,
    }
}

async fn wait_for_peer_count(server: &FileServer, want: usize) {
    for _ in 0..200 {
        if server.peer_count() >= want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!(
        "expected at least {want} peers, have {}",
        server.peer_count()
    );
}

async fn wait_for_replica(server: &FileServer, owner: &str, key_id: &str, present: bool) {
    for _ in 0..200 {
        if server.store().has_id(owner, key_id).await.unwrap() == present {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("replica state for {key_id} never became present={present}");
}

async fn read_all(mut file: tokio::fs::File) -> Vec<u8> {
    let mut out = Vec::new();
    file.read_to_end(&mut out).await.unwrap();
    out
}

#[tokio::test]
async fn local_put_then_get_round_trips() {
    let node = spawn_node(GB, vec![]).await;

    node.server
        .put("hello.txt", &mut &b"world"[..])
        .await
        .unwrap();
    let (size, file) = node.server.get("hello.txt").await.unwrap();
    assert_eq!(size, 5);
    assert_eq!(read_all(file).await, b"world");

    node.server.shutdown().await;
}

#[tokio::test]
async fn two_node_replication_and_network_get() {
    let a = spawn_node(GB, vec![]).await;
    let b = spawn_node(GB, vec![a.addr.clone()]).await;
    wait_for_peer_count(&b.server, 1).await;
    wait_for_peer_count(&a.server, 1).await;

    a.server
        .put("doc", &mut &b"payload-1234"[..])
        .await
        .unwrap();

    // The encrypted stream lands on B under A's namespace.
    let key_id = hash_key("doc");
    wait_for_replica(&b.server, a.server.id(), &key_id, true).await;

    // B has no copy under its own id, so this goes over the network.
    assert!(!b.server.store().has(b.server.id(), "doc").await.unwrap());
    let (size, file) = b.server.get("doc").await.unwrap();
    assert_eq!(size, 12);
    assert_eq!(read_all(file).await, b"payload-1234");
    assert!(b.server.store().has(b.server.id(), "doc").await.unwrap());

    a.server.shutdown().await;
    b.server.shutdown().await;
}

#[tokio::test]
async fn get_fans_in_from_multiple_holders() {
    let a = spawn_node(GB, vec![]).await;
    let b = spawn_node(GB, vec![a.addr.clone()]).await;
    wait_for_peer_count(&a.server, 1).await;

    a.server.put("k", &mut &b"abc"[..]).await.unwrap();
    let (_, file) = b.server.get("k").await.unwrap();
    assert_eq!(read_all(file).await, b"abc");

    // C connects to both holders and pulls the blob.
    let c = spawn_node(GB, vec![a.addr.clone(), b.addr.clone()]).await;
    wait_for_peer_count(&c.server, 2).await;

    let (_, file) = c.server.get("k").await.unwrap();
    assert_eq!(read_all(file).await, b"abc");
    assert!(c.server.store().has(c.server.id(), "k").await.unwrap());

    a.server.shutdown().await;
    b.server.shutdown().await;
    c.server.shutdown().await;
}

#[tokio::test]
async fn delete_propagates_to_replicas() {
    let a = spawn_node(GB, vec![]).await;
    let b = spawn_node(GB, vec![a.addr.clone()]).await;
    wait_for_peer_count(&a.server, 1).await;

    a.server.put("doc", &mut &b"payload"[..]).await.unwrap();
    let key_id = hash_key("doc");
    wait_for_replica(&b.server, a.server.id(), &key_id, true).await;

    a.server.delete("doc").await.unwrap();
    assert!(!a.server.store().has(a.server.id(), "doc").await.unwrap());
    wait_for_replica(&b.server, a.server.id(), &key_id, false).await;

    let err = b.server.get("doc").await.unwrap_err();
    assert!(matches!(err, ServerError::NotFound(_)));
    assert!(!b.server.store().has(b.server.id(), "doc").await.unwrap());

    a.server.shutdown().await;
    b.server.shutdown().await;
}

#[tokio::test]
async fn deleting_an_absent_blob_fails() {
    let node = spawn_node(GB, vec![]).await;
    let err = node.server.delete("never-stored").await.unwrap_err();
    assert!(matches!(err, ServerError::NotFound(_)));
}

#[tokio::test]
async fn quota_refusal_leaves_no_partial_blob() {
    let node = spawn_node(32, vec![]).await;

    // 20 payload bytes + 16 IV bytes on the wire exceed the budget.
    let data = [7u8; 20];
    let err = node.server.put("a", &mut &data[..]).await.unwrap_err();
    match err {
        ServerError::QuotaExceeded { needed, .. } => assert_eq!(needed, 36),
        other => panic!("expected a quota error, got {other}"),
    }

    let node_dir = node.server.store().root().join(node.server.id());
    assert!(!node_dir.exists());
}

#[tokio::test]
async fn zero_byte_payload_round_trips() {
    let node = spawn_node(GB, vec![]).await;

    let written = node.server.put("empty", &mut &b""[..]).await.unwrap();
    assert_eq!(written, 0);

    let (size, file) = node.server.get("empty").await.unwrap();
    assert_eq!(size, 0);
    assert!(read_all(file).await.is_empty());
}

#[tokio::test]
async fn get_for_a_name_nobody_has_is_not_found() {
    let node = spawn_node(GB, vec![]).await;

    let err = node.server.get("nobody-has-this").await.unwrap_err();
    assert!(matches!(err, ServerError::NotFound(_)));
    assert!(!node
        .server
        .store()
        .has(node.server.id(), "nobody-has-this")
        .await
        .unwrap());
}

#[tokio::test]
async fn repeated_put_is_idempotent_on_the_local_store() {
    let node = spawn_node(GB, vec![]).await;

    node.server.put("doc", &mut &b"same-bytes"[..]).await.unwrap();
    node.server.put("doc", &mut &b"same-bytes"[..]).await.unwrap();

    let files = node.server.list_files(node.server.id()).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].key, "doc");

    let (_, file) = node.server.get("doc").await.unwrap();
    assert_eq!(read_all(file).await, b"same-bytes");
}

#[tokio::test]
async fn pex_gossip_introduces_known_peers() {
    // C is a plain node nobody is connected to yet.
    let c = spawn_node(GB, vec![]).await;

    // A runs PEX and knows C's address without being connected to it.
    let a = spawn_node_with(GB, vec![], Some(fast_pex())).await;
    a.server.pex().note_peer(&c.addr, PeerSource::Mdns);

    // B runs PEX and connects only to A.
    let b = spawn_node_with(GB, vec![a.addr.clone()], Some(fast_pex())).await;
    wait_for_peer_count(&a.server, 1).await;

    // Within an exchange cycle A gossips C's address to B, which dials it.
    for _ in 0..200 {
        if b.server.peer_count() >= 2 && c.server.peer_count() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(b.server.peer_count() >= 2, "B never connected to C");
    assert!(c.server.peer_count() >= 1, "C never saw B");
    assert!(b
        .server
        .pex()
        .known_peers()
        .iter()
        .any(|p| p.address == c.addr && p.source == PeerSource::Pex));

    a.server.shutdown().await;
    b.server.shutdown().await;
    c.server.shutdown().await;
}
