//! The file server: the node's central state machine.
//!
//! Owns the content-addressed store, the quota gate, the garbage
//! collector, the transport, the peer registry, and the discovery
//! subsystems. Local clients call [`FileServer::put`],
//! [`FileServer::get`], and [`FileServer::delete`]; a single dispatcher
//! task routes every inbound control message to its handler.

use crate::discovery::{DiscoveryConfig, DiscoveryService, PeerFoundFn};
use crate::message::{
    decode_message, encode_frame, ControlMessage, InboundEvent, PeerSource, ProtocolError,
    STREAM_FRAME,
};
use crate::metrics::ServerMetrics;
use crate::pex::{PeerExchange, PexConfig};
use crate::sync_wait::wait_until;
use crate::transport::{TcpPeer, TcpTransport, TransportError};
use futures::future::join_all;
use parking_lot::Mutex;
use peervault_crypto::{self as crypto, CryptoError, EncryptionKey, IV_LEN};
use peervault_storage::{
    FileInfo, GarbageCollector, GcConfig, QuotaManager, QuotaStats, Store, StoreError, SweepStats,
};
use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// File server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("quota exceeded: {needed} bytes needed but only {available} available")]
    QuotaExceeded { needed: u64, available: u64 },
    #[error("blob {0:?} not found")]
    NotFound(String),
    #[error("peer {0} is not registered")]
    UnknownPeer(String),
    #[error("peer {0} never started its stream")]
    StreamHandover(String),
    #[error("stream truncated: expected {expected} bytes, got {actual}")]
    TruncatedStream { expected: u64, actual: u64 },
    #[error("server already started")]
    AlreadyStarted,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Mutex-guarded mapping from remote address to live peer handle.
///
/// A handle is present exactly while its read loop is running: the
/// transport's new-peer callback inserts it, the peer-closed callback
/// removes it.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, Arc<TcpPeer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, addr: String, peer: Arc<TcpPeer>) {
        self.peers.lock().insert(addr, peer);
    }

    pub fn remove(&self, addr: &str) -> Option<Arc<TcpPeer>> {
        self.peers.lock().remove(addr)
    }

    pub fn get(&self, addr: &str) -> Option<Arc<TcpPeer>> {
        self.peers.lock().get(addr).cloned()
    }

    /// Copy of the current peer set; handles are cheap clones. Taken
    /// under the lock so broadcasts can write outside it.
    pub fn snapshot(&self) -> Vec<(String, Arc<TcpPeer>)> {
        self.peers
            .lock()
            .iter()
            .map(|(addr, peer)| (addr.clone(), Arc::clone(peer)))
            .collect()
    }

    pub fn addrs(&self) -> Vec<String> {
        self.peers.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}

/// File server construction inputs.
#[derive(Clone)]
pub struct ServerConfig {
    pub enc_key: EncryptionKey,
    pub storage_root: PathBuf,
    pub seed_peers: Vec<String>,
    /// Address other nodes should dial; defaults to the bound address.
    pub advertise_addr: Option<String>,
    /// Explicit node id; generated when absent.
    pub node_id: Option<String>,
    /// Bounded wait for responders after a GetRequest broadcast.
    pub get_response_wait: Duration,
    /// Yield between a StoreNotice broadcast and the stream fan-out, so
    /// receivers reach their stream handover first.
    pub fanout_yield: Duration,
    /// How long an inbound-store handler waits for the announced stream.
    pub stream_handover_wait: Duration,
    pub gc: GcConfig,
    pub pex: PexConfig,
}

impl ServerConfig {
    pub fn new(enc_key: EncryptionKey, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            enc_key,
            storage_root: storage_root.into(),
            seed_peers: Vec::new(),
            advertise_addr: None,
            node_id: None,
            get_response_wait: Duration::from_millis(500),
            fanout_yield: Duration::from_millis(5),
            stream_handover_wait: Duration::from_secs(10),
            gc: GcConfig::default(),
            pex: PexConfig::default(),
        }
    }
}

/// The file server.
pub struct FileServer {
    id: String,
    config: ServerConfig,
    store: Arc<Store>,
    quota: Arc<QuotaManager>,
    gc: Arc<GarbageCollector>,
    metrics: Arc<ServerMetrics>,
    transport: Arc<TcpTransport>,
    peers: Arc<PeerRegistry>,
    pex: Arc<PeerExchange>,
    discovery: Mutex<Option<DiscoveryService>>,
    shutdown_tx: watch::Sender<bool>,
}

impl FileServer {
    /// Build a server around a transport and a loaded quota manager,
    /// wiring the transport's peer callbacks into the registry.
    pub fn new(
        config: ServerConfig,
        transport: Arc<TcpTransport>,
        quota: QuotaManager,
    ) -> Result<Arc<Self>, ServerError> {
        let id = match &config.node_id {
            Some(id) => id.clone(),
            None => crypto::generate_node_id()?,
        };
        let store = Arc::new(Store::new(&config.storage_root));
        let gc = Arc::new(GarbageCollector::with_config(&store, &id, config.gc.clone()));
        let metrics = Arc::new(ServerMetrics::new());
        {
            let metrics = Arc::clone(&metrics);
            gc.set_observer(Arc::new(move |stats: SweepStats| {
                metrics.record_sweep(stats)
            }));
        }
        let peers = Arc::new(PeerRegistry::new());
        let pex = Arc::new(PeerExchange::new(
            config.pex.clone(),
            Arc::clone(&peers),
            Arc::clone(&transport),
        ));

        let server = Arc::new(Self {
            id,
            config,
            store,
            quota: Arc::new(quota),
            gc,
            metrics,
            transport,
            peers,
            pex,
            discovery: Mutex::new(None),
            shutdown_tx: watch::channel(false).0,
        });

        let registry = Arc::clone(&server.peers);
        let metrics = Arc::clone(&server.metrics);
        server.transport.set_on_peer(Arc::new(move |peer| {
            let addr = peer.remote_addr().to_string();
            info!(peer = %addr, outbound = peer.is_outbound(), "connected with remote peer");
            registry.insert(addr, peer);
            metrics.record_peer_connected();
            Ok(())
        }));

        let registry = Arc::clone(&server.peers);
        let metrics = Arc::clone(&server.metrics);
        server.transport.set_on_peer_closed(Arc::new(move |addr| {
            registry.remove(addr);
            metrics.record_peer_disconnected();
            debug!(peer = %addr, "removed peer from registry");
        }));

        Ok(server)
    }

    /// Start listening, schedule seed dials, and spawn the dispatcher
    /// and GC loops. Discovery and PEX stay opt-in; call
    /// [`FileServer::enable_pex`] before `start` so seed addresses land
    /// in the known-peer cache.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        let inbound = self
            .transport
            .take_inbound()
            .ok_or(ServerError::AlreadyStarted)?;
        self.transport.listen_and_accept().await?;
        self.pex.set_self_addr(self.advertise_addr());

        for seed in &self.config.seed_peers {
            if seed.is_empty() {
                continue;
            }
            self.pex.note_peer(seed, PeerSource::Seed);
            let transport = Arc::clone(&self.transport);
            let addr = seed.clone();
            tokio::spawn(async move {
                debug!(%addr, "attempting to connect with seed node");
                if let Err(e) = transport.dial(&addr).await {
                    warn!(%addr, error = %e, "seed dial failed");
                }
            });
        }

        let server = Arc::clone(self);
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            server.dispatch_loop(inbound, shutdown).await;
        });

        self.gc.start(self.shutdown_tx.subscribe());

        info!(
            node = %&self.id[..8.min(self.id.len())],
            addr = %self.advertise_addr(),
            "file server started"
        );
        Ok(())
    }

    /// Stop the dispatcher and the listener. Peer read loops terminate
    /// on their next I/O error.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.transport.close();
        if let Some(discovery) = self.discovery.lock().take() {
            discovery.shutdown();
        }
        info!("file server stopped");
    }

    /// Advertise and browse on the link-local mDNS namespace, dialing
    /// every discovered peer.
    pub fn enable_local_discovery(&self) -> anyhow::Result<()> {
        let local = self
            .transport
            .local_addr()
            .ok_or_else(|| anyhow::anyhow!("transport is not listening yet"))?;
        let instance = format!("peervault-{}", &self.id[..12.min(self.id.len())]);
        let config = DiscoveryConfig::new(instance, local.port(), self.advertise_addr());

        let pex = Arc::clone(&self.pex);
        let transport = Arc::clone(&self.transport);
        let on_peer_found: PeerFoundFn = Arc::new(move |addr: String| {
            pex.note_peer(&addr, PeerSource::Mdns);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                if let Err(e) = transport.dial(&addr).await {
                    debug!(%addr, error = %e, "failed to connect to discovered peer");
                }
            });
        });

        let service = DiscoveryService::start(config, on_peer_found, self.shutdown_tx.subscribe())?;
        *self.discovery.lock() = Some(service);
        Ok(())
    }

    /// Enable gossip-based peer exchange.
    pub fn enable_pex(&self) {
        self.pex.start(self.shutdown_tx.subscribe());
    }

    // ----------------------------
    // Local client operations
    // ----------------------------

    /// Store a blob locally and replicate it to every connected peer.
    ///
    /// The source is buffered so the local write and the encrypted
    /// fan-out share one copy. Admission counts the on-wire size
    /// (plaintext plus IV); a refused put writes nothing.
    pub async fn put<R>(&self, key: &str, source: &mut R) -> Result<u64, ServerError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut data = Vec::new();
        source.read_to_end(&mut data).await?;

        let needed = data.len() as u64 + IV_LEN as u64;
        let (fits, available) = self.quota.check(self.store.root(), needed)?;
        if !fits {
            self.metrics.record_error();
            return Err(ServerError::QuotaExceeded { needed, available });
        }

        let written = self.store.write(&self.id, key, &mut &data[..]).await?;
        self.metrics.record_store(written);

        let notice = ControlMessage::StoreNotice {
            owner: self.id.clone(),
            key_id: crypto::hash_key(key),
            size: written + IV_LEN as u64,
        };
        let notice_frame = Arc::new(encode_frame(&notice)?);
        tokio::time::sleep(self.config.fanout_yield).await;

        let mut ciphertext = Cursor::new(Vec::with_capacity(data.len() + IV_LEN));
        crypto::encrypt_stream(&self.config.enc_key, &mut &data[..], &mut ciphertext).await?;
        let ciphertext = Arc::new(ciphertext.into_inner());

        // The notice and its stream go out under one writer guard per
        // peer, so nothing else can interleave inside the pair.
        let sends = self.peers.snapshot().into_iter().map(|(addr, peer)| {
            let notice_frame = Arc::clone(&notice_frame);
            let ciphertext = Arc::clone(&ciphertext);
            async move {
                let mut writer = peer.writer().await;
                let result = async {
                    writer.write_all(&notice_frame).await?;
                    writer.write_all(&[STREAM_FRAME]).await?;
                    writer.write_all(&ciphertext).await
                }
                .await;
                if let Err(e) = result {
                    warn!(peer = %addr, error = %e, "replication fan-out to peer failed");
                }
            }
        });
        join_all(sends).await;

        debug!(key, bytes = written, "stored blob and notified peers");
        Ok(written)
    }

    /// Fetch a blob: served from the local tree when present, otherwise
    /// pulled from the first peer that streams it back, stored locally,
    /// and then served.
    pub async fn get(&self, key: &str) -> Result<(u64, tokio::fs::File), ServerError> {
        if self.store.has(&self.id, key).await? {
            debug!(key, "serving blob from local disk");
            let (size, file) = self.store.read(&self.id, key).await?;
            self.metrics.record_fetch(size);
            return Ok((size, file));
        }

        info!(key, "blob not held locally, fetching from the network");
        let request = ControlMessage::GetRequest {
            requester: self.id.clone(),
            key_id: crypto::hash_key(key),
        };
        self.broadcast(&request).await?;
        tokio::time::sleep(self.config.get_response_wait).await;

        for (addr, peer) in self.peers.snapshot() {
            if !peer.is_streaming() {
                continue;
            }
            let received = self.read_blob_stream(&addr, &peer, key).await;
            peer.close_stream();
            match received {
                Ok(n) => {
                    self.metrics.record_fetch(n);
                    info!(key, bytes = n, peer = %addr, "received blob over the network");
                }
                Err(e) => {
                    self.metrics.record_error();
                    warn!(key, peer = %addr, error = %e, "failed to read blob stream");
                }
            }
        }

        match self.store.read(&self.id, key).await {
            Ok(found) => Ok(found),
            Err(StoreError::NotFound { .. }) => Err(ServerError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a responder's stream: u64-LE ciphertext size, then exactly
    /// that many bytes through the decryption filter into our own
    /// namespace.
    async fn read_blob_stream(
        &self,
        addr: &str,
        peer: &TcpPeer,
        key: &str,
    ) -> Result<u64, ServerError> {
        let key_id = crypto::hash_key(key);
        self.store.register_name(&key_id, key);

        let mut reader = peer.reader().await;
        // The dispatcher may have consumed this stream while we waited
        // for the read half.
        if !peer.is_streaming() {
            return Err(ServerError::StreamHandover(addr.to_string()));
        }
        let size = reader.read_u64_le().await?;
        let mut limited = (&mut *reader).take(size);
        let n = self
            .store
            .write_decrypt_id(&self.config.enc_key, &self.id, &key_id, &mut limited)
            .await?;
        if n + IV_LEN as u64 != size {
            return Err(ServerError::TruncatedStream {
                expected: size,
                actual: n + IV_LEN as u64,
            });
        }
        Ok(n)
    }

    /// Remove a blob locally and tell every peer to drop its replica.
    pub async fn delete(&self, key: &str) -> Result<(), ServerError> {
        if !self.store.has(&self.id, key).await? {
            return Err(ServerError::NotFound(key.to_string()));
        }
        self.store.delete(&self.id, key).await?;
        self.metrics.record_delete();

        let notice = ControlMessage::DeleteNotice {
            owner: self.id.clone(),
            key_id: crypto::hash_key(key),
        };
        self.broadcast(&notice).await?;
        info!(key, "deleted blob and notified peers");
        Ok(())
    }

    // ----------------------------
    // Store pass-throughs
    // ----------------------------

    pub fn list_files(&self, owner: &str) -> Result<Vec<FileInfo>, ServerError> {
        Ok(self.store.list(owner)?)
    }

    pub fn list_all_files(&self) -> Result<HashMap<String, Vec<FileInfo>>, ServerError> {
        Ok(self.store.list_all()?)
    }

    pub async fn read_direct(
        &self,
        owner: &str,
        key: &str,
    ) -> Result<(u64, tokio::fs::File), ServerError> {
        Ok(self.store.read(owner, key).await?)
    }

    pub async fn clear_storage(&self) -> Result<(), ServerError> {
        Ok(self.store.clear().await?)
    }

    pub fn clear_name_mappings(&self) {
        self.store.clear_names();
    }

    // ----------------------------
    // Accessors
    // ----------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Address peers should dial: the configured advertise address or
    /// the bound listen address.
    pub fn advertise_addr(&self) -> String {
        self.config
            .advertise_addr
            .clone()
            .or_else(|| self.transport.local_addr().map(|a| a.to_string()))
            .unwrap_or_default()
    }

    pub fn peer_addrs(&self) -> Vec<String> {
        self.peers.addrs()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn pex(&self) -> &PeerExchange {
        &self.pex
    }

    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    pub fn discovered_peers(&self) -> Vec<String> {
        self.discovery
            .lock()
            .as_ref()
            .map(|d| d.discovered_peers())
            .unwrap_or_default()
    }

    pub fn quota_stats(&self) -> std::io::Result<QuotaStats> {
        self.quota.stats(self.store.root())
    }

    // ----------------------------
    // Inbound dispatch
    // ----------------------------

    async fn dispatch_loop(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = wait_until(&mut shutdown, |stop| stop) => break,
                event = inbound.recv() => {
                    let Some(event) = event else { break };
                    if event.is_stream {
                        // Stream handovers are consumed by the put/get
                        // paths through the peer's gate.
                        continue;
                    }
                    let msg = match decode_message(&event.payload) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(from = %event.from, error = %e, "dropping undecodable message");
                            self.metrics.record_error();
                            continue;
                        }
                    };
                    self.metrics.record_message();
                    if let Err(e) = self.handle_message(&event.from, msg).await {
                        warn!(from = %event.from, error = %e, "message handler failed");
                        self.metrics.record_error();
                    }
                }
            }
        }
        debug!("dispatcher stopped");
    }

    async fn handle_message(&self, from: &str, msg: ControlMessage) -> Result<(), ServerError> {
        match msg {
            ControlMessage::StoreNotice {
                owner,
                key_id,
                size,
            } => self.handle_store_notice(from, owner, key_id, size).await,
            ControlMessage::GetRequest { requester, key_id } => {
                self.handle_get_request(from, requester, key_id).await
            }
            ControlMessage::DeleteNotice { owner, key_id } => {
                self.handle_delete_notice(from, owner, key_id).await
            }
            ControlMessage::PeerGossip { peers } => {
                self.pex.handle_gossip(from, peers).await;
                Ok(())
            }
        }
    }

    /// A peer is replicating a blob to us: wait for its stream, then
    /// read exactly `size` ciphertext bytes through the decryption
    /// filter into the owner's namespace.
    async fn handle_store_notice(
        &self,
        from: &str,
        owner: String,
        key_id: String,
        size: u64,
    ) -> Result<(), ServerError> {
        let peer = self
            .peers
            .get(from)
            .ok_or_else(|| ServerError::UnknownPeer(from.to_string()))?;

        if !peer.await_stream(self.config.stream_handover_wait).await {
            return Err(ServerError::StreamHandover(from.to_string()));
        }

        let received = async {
            let mut reader = peer.reader().await;
            let mut limited = (&mut *reader).take(size);
            let n = self
                .store
                .write_decrypt_id(&self.config.enc_key, &owner, &key_id, &mut limited)
                .await?;
            if n + IV_LEN as u64 != size {
                return Err(ServerError::TruncatedStream {
                    expected: size,
                    actual: n + IV_LEN as u64,
                });
            }
            Ok(n)
        }
        .await;
        peer.close_stream();

        let n = received?;
        self.metrics.record_replica(n);
        debug!(bytes = n, peer = %from, "stored replicated blob");
        Ok(())
    }

    /// A peer wants a blob: find it in the requester's namespace or any
    /// other owner's, then stream it back encrypted with a size prefix.
    async fn handle_get_request(
        &self,
        from: &str,
        requester: String,
        key_id: String,
    ) -> Result<(), ServerError> {
        let owner = if self.store.has_id(&requester, &key_id).await? {
            Some(requester)
        } else {
            self.store.locate_owner(&key_id).await?
        };
        let Some(owner) = owner else {
            return Err(ServerError::NotFound(key_id));
        };

        let (size, mut file) = self.store.read_id(&owner, &key_id).await?;
        let peer = self
            .peers
            .get(from)
            .ok_or_else(|| ServerError::UnknownPeer(from.to_string()))?;

        info!(key_id = %&key_id[..8.min(key_id.len())], peer = %from, "serving blob over the network");
        let mut writer = peer.writer().await;
        writer.write_all(&[STREAM_FRAME]).await?;
        writer.write_u64_le(size + IV_LEN as u64).await?;
        let sent = crypto::encrypt_stream(&self.config.enc_key, &mut file, &mut *writer).await?;
        drop(writer);

        self.metrics.record_serve(sent);
        debug!(bytes = sent, peer = %from, "wrote blob over the network");
        Ok(())
    }

    /// The owner deleted a blob; drop our replica if we hold one.
    async fn handle_delete_notice(
        &self,
        from: &str,
        owner: String,
        key_id: String,
    ) -> Result<(), ServerError> {
        if self.store.has_id(&owner, &key_id).await? {
            self.store.delete_id(&owner, &key_id).await?;
            debug!(key_id = %&key_id[..8.min(key_id.len())], peer = %from, "dropped replica after delete notice");
        }
        Ok(())
    }

    /// Send one control message to every registered peer. Per-peer
    /// failures are logged, not propagated.
    async fn broadcast(&self, msg: &ControlMessage) -> Result<(), ServerError> {
        let frame = Arc::new(encode_frame(msg)?);
        let sends = self.peers.snapshot().into_iter().map(|(addr, peer)| {
            let frame = Arc::clone(&frame);
            async move {
                if let Err(e) = peer.send(&frame).await {
                    warn!(peer = %addr, error = %e, "broadcast to peer failed");
                }
            }
        });
        join_all(sends).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_peer() -> (Arc<TcpPeer>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (served, remote) = listener.accept().await.unwrap();
        (Arc::new(TcpPeer::new(remote, false, served)), client)
    }

    #[tokio::test]
    async fn registry_tracks_insert_and_remove() {
        let (peer, _client) = socket_peer().await;
        let registry = PeerRegistry::new();
        assert!(registry.is_empty());

        registry.insert("127.0.0.1:9999".to_string(), peer);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("127.0.0.1:9999").is_some());
        assert_eq!(registry.addrs(), vec!["127.0.0.1:9999".to_string()]);
        assert_eq!(registry.snapshot().len(), 1);

        assert!(registry.remove("127.0.0.1:9999").is_some());
        assert!(registry.is_empty());
        assert!(registry.get("127.0.0.1:9999").is_none());
    }
}
