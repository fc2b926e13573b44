//! Gossip-based peer exchange.
//!
//! Tracks every peer address the node has heard of (seeds, mDNS hits,
//! gossip) and periodically shares a bounded slice of the ones it is not
//! currently connected to with every connected peer. Addresses learned
//! from inbound gossip are dialed asynchronously.

use crate::message::{encode_frame, ControlMessage, PeerRecord, PeerSource};
use crate::server::PeerRegistry;
use crate::sync_wait::wait_until;
use crate::transport::TcpTransport;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Peer-exchange timings and bounds.
#[derive(Debug, Clone)]
pub struct PexConfig {
    /// Delay before the first exchange after startup.
    pub warmup: Duration,
    pub exchange_interval: Duration,
    pub janitor_interval: Duration,
    /// Known peers unseen for longer than this are evicted.
    pub stale_after: Duration,
    /// Upper bound on one gossip payload.
    pub max_gossip_peers: usize,
}

impl Default for PexConfig {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(30),
            exchange_interval: Duration::from_secs(5 * 60),
            janitor_interval: Duration::from_secs(10 * 60),
            stale_after: Duration::from_secs(30 * 60),
            max_gossip_peers: 20,
        }
    }
}

/// One known peer address and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownPeer {
    pub address: String,
    pub last_seen: SystemTime,
    pub source: PeerSource,
}

impl KnownPeer {
    fn record(&self) -> PeerRecord {
        PeerRecord {
            address: self.address.clone(),
            last_seen_unix: self
                .last_seen
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            source: self.source,
        }
    }
}

/// Peer-exchange service. Constructed with the server, enabled opt-in.
pub struct PeerExchange {
    config: PexConfig,
    known: RwLock<HashMap<String, KnownPeer>>,
    enabled: AtomicBool,
    registry: Arc<PeerRegistry>,
    transport: Arc<TcpTransport>,
    self_addr: Mutex<String>,
}

impl PeerExchange {
    pub fn new(
        config: PexConfig,
        registry: Arc<PeerRegistry>,
        transport: Arc<TcpTransport>,
    ) -> Self {
        Self {
            config,
            known: RwLock::new(HashMap::new()),
            enabled: AtomicBool::new(false),
            registry,
            transport,
            self_addr: Mutex::new(String::new()),
        }
    }

    /// Record the address peers would reach this node at, so gossip
    /// about ourselves is never acted on.
    pub fn set_self_addr(&self, addr: String) {
        *self.self_addr.lock() = addr;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Enable the service and spawn the exchange and janitor loops.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("peer exchange (PEX) enabled");

        let pex = Arc::clone(self);
        let mut exchange_shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_until(&mut exchange_shutdown, |stop| stop) => return,
                _ = tokio::time::sleep(pex.config.warmup) => {}
            }
            pex.exchange().await;

            let mut ticker = tokio::time::interval(pex.config.exchange_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = wait_until(&mut exchange_shutdown, |stop| stop) => return,
                    _ = ticker.tick() => pex.exchange().await,
                }
            }
        });

        let pex = Arc::clone(self);
        let mut janitor_shutdown = shutdown;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pex.config.janitor_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = wait_until(&mut janitor_shutdown, |stop| stop) => return,
                    _ = ticker.tick() => pex.evict_stale(),
                }
            }
        });
    }

    /// Note a peer address sighting. No-op while the service is
    /// disabled; touching an already-known address refreshes it.
    pub fn note_peer(&self, address: &str, source: PeerSource) {
        if !self.is_enabled() || address.is_empty() {
            return;
        }
        let mut known = self.known.write();
        match known.get_mut(address) {
            Some(peer) => peer.last_seen = SystemTime::now(),
            None => {
                debug!(address, %source, "added peer to PEX cache");
                known.insert(
                    address.to_string(),
                    KnownPeer {
                        address: address.to_string(),
                        last_seen: SystemTime::now(),
                        source,
                    },
                );
            }
        }
    }

    /// Known peers the node is not currently connected to.
    pub fn sharable_peers(&self) -> Vec<PeerRecord> {
        let connected = self.registry.addrs();
        self.known
            .read()
            .values()
            .filter(|peer| !connected.contains(&peer.address))
            .map(KnownPeer::record)
            .collect()
    }

    /// All known peers, for operator inspection.
    pub fn known_peers(&self) -> Vec<KnownPeer> {
        self.known.read().values().cloned().collect()
    }

    /// Broadcast a bounded slice of sharable peers to every connection.
    async fn exchange(&self) {
        if !self.is_enabled() {
            return;
        }
        let mut peers = self.sharable_peers();
        peers.truncate(self.config.max_gossip_peers);
        if peers.is_empty() {
            return;
        }

        let count = peers.len();
        let frame = match encode_frame(&ControlMessage::PeerGossip { peers }) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode peer gossip");
                return;
            }
        };
        for (addr, peer) in self.registry.snapshot() {
            if let Err(e) = peer.send(&frame).await {
                debug!(peer = %addr, error = %e, "failed to send peer gossip");
            }
        }
        debug!(count, "exchanged known-peer list");
    }

    /// Handle a gossip payload from `from`: remember and dial every
    /// entry that is neither us, nor connected, nor already known.
    pub async fn handle_gossip(&self, from: &str, peers: Vec<PeerRecord>) {
        if !self.is_enabled() {
            return;
        }
        debug!(from, count = peers.len(), "received peers via PEX");
        let self_addr = self.self_addr.lock().clone();

        let mut fresh = 0usize;
        for record in peers {
            if record.address == self_addr {
                continue;
            }
            if self.registry.get(&record.address).is_some() {
                continue;
            }
            if self.known.read().contains_key(&record.address) {
                continue;
            }

            self.note_peer(&record.address, PeerSource::Pex);
            fresh += 1;

            let transport = Arc::clone(&self.transport);
            let address = record.address.clone();
            tokio::spawn(async move {
                debug!(%address, "dialing peer learned via PEX");
                if let Err(e) = transport.dial(&address).await {
                    debug!(%address, error = %e, "failed to connect to PEX peer");
                }
            });
        }
        if fresh > 0 {
            info!(fresh, from, "learned new peers via PEX");
        }
    }

    /// Evict known peers unseen past the staleness cutoff.
    pub fn evict_stale(&self) {
        let cutoff = self.config.stale_after;
        let now = SystemTime::now();
        let mut known = self.known.write();
        let before = known.len();
        known.retain(|_, peer| {
            now.duration_since(peer.last_seen)
                .map(|age| age <= cutoff)
                .unwrap_or(true)
        });
        let evicted = before - known.len();
        if evicted > 0 {
            debug!(evicted, "cleaned up stale PEX peers");
        }
    }
}
