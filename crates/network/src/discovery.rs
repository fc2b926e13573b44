//! Link-local peer discovery over multicast DNS.
//!
//! The node registers a `_peervault._tcp` service record carrying its
//! version and advertise address, browses for the same service, filters
//! out itself, suppresses recently-seen addresses, and hands every
//! surviving address to a dial callback.

use crate::netutil;
use crate::sync_wait::wait_until;
use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

/// mDNS service type, browsed and registered on the local domain.
pub const SERVICE_TYPE: &str = "_peervault._tcp.local.";

/// Version tag carried in the service TXT record.
pub const SERVICE_VERSION: &str = "1.0";

/// Discovery configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub instance_name: String,
    pub port: u16,
    pub advertise_addr: String,
    /// Re-dial suppression window for already-seen addresses.
    pub seen_window: Duration,
    /// Cache entries older than this are evicted by the janitor.
    pub cache_ttl: Duration,
    pub janitor_interval: Duration,
}

impl DiscoveryConfig {
    pub fn new(instance_name: impl Into<String>, port: u16, advertise_addr: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            port,
            advertise_addr: advertise_addr.into(),
            seen_window: Duration::from_secs(5 * 60),
            cache_ttl: Duration::from_secs(10 * 60),
            janitor_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Invoked for every newly discovered peer address.
pub type PeerFoundFn = Arc<dyn Fn(String) + Send + Sync>;

type SeenCache = Arc<RwLock<HashMap<String, Instant>>>;

/// mDNS announce/browse service.
pub struct DiscoveryService {
    daemon: ServiceDaemon,
    cache: SeenCache,
}

impl DiscoveryService {
    /// Register the service record, start browsing, and spawn the cache
    /// janitor. The daemon owns the periodic re-query schedule.
    pub fn start(
        config: DiscoveryConfig,
        on_peer_found: PeerFoundFn,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let daemon = ServiceDaemon::new().context("failed to start mDNS daemon")?;

        let host_name = format!("{}.local.", config.instance_name);
        let properties = [
            ("version", SERVICE_VERSION),
            ("addr", config.advertise_addr.as_str()),
        ];
        let record = ServiceInfo::new(
            SERVICE_TYPE,
            &config.instance_name,
            &host_name,
            "",
            config.port,
            &properties[..],
        )
        .context("invalid mDNS service record")?
        .enable_addr_auto();
        let own_fullname = record.get_fullname().to_string();
        daemon
            .register(record)
            .context("failed to register mDNS service")?;

        let events = daemon
            .browse(SERVICE_TYPE)
            .context("failed to browse mDNS services")?;

        let cache: SeenCache = Arc::new(RwLock::new(HashMap::new()));

        let browse_cache = Arc::clone(&cache);
        let browse_config = config.clone();
        let mut browse_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = wait_until(&mut browse_shutdown, |stop| stop) => return,
                    event = events.recv_async() => match event {
                        Ok(ServiceEvent::ServiceResolved(resolved)) => handle_resolved(
                            &browse_config,
                            &own_fullname,
                            &browse_cache,
                            &on_peer_found,
                            resolved.get_fullname(),
                            resolved.get_port(),
                            resolved.get_addresses().iter().copied().collect(),
                        ),
                        Ok(_) => {}
                        Err(_) => return,
                    }
                }
            }
        });

        let janitor_cache = Arc::clone(&cache);
        let ttl = config.cache_ttl;
        let mut janitor_shutdown = shutdown;
        let janitor_interval = config.janitor_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(janitor_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = wait_until(&mut janitor_shutdown, |stop| stop) => return,
                    _ = ticker.tick() => {
                        let evicted = evict_expired(&janitor_cache, ttl);
                        if evicted > 0 {
                            debug!(evicted, "removed stale peers from discovery cache");
                        }
                    }
                }
            }
        });

        info!(
            service = SERVICE_TYPE,
            port = config.port,
            "mDNS discovery started"
        );
        Ok(Self { daemon, cache })
    }

    /// Addresses currently held in the discovery cache.
    pub fn discovered_peers(&self) -> Vec<String> {
        self.cache.read().keys().cloned().collect()
    }

    pub fn shutdown(&self) {
        let _ = self.daemon.shutdown();
        debug!("mDNS discovery stopped");
    }
}

fn handle_resolved(
    config: &DiscoveryConfig,
    own_fullname: &str,
    cache: &SeenCache,
    on_peer_found: &PeerFoundFn,
    fullname: &str,
    port: u16,
    addresses: Vec<IpAddr>,
) {
    if fullname == own_fullname {
        return;
    }
    for addr in candidate_addrs(port, &addresses) {
        if is_self_addr(&addr, config) {
            continue;
        }
        if !mark_seen(cache, &addr, config.seen_window) {
            continue;
        }
        info!(peer = %addr, name = fullname, "discovered peer via mDNS");
        on_peer_found(addr);
    }
}

/// Render `ip:port` dial candidates from a resolved record.
fn candidate_addrs(port: u16, addresses: &[IpAddr]) -> Vec<String> {
    addresses
        .iter()
        .map(|ip| match ip {
            IpAddr::V4(v4) => format!("{v4}:{port}"),
            IpAddr::V6(v6) => format!("[{v6}]:{port}"),
        })
        .collect()
}

/// A resolved address counts as ourselves when it matches the advertise
/// address, or carries our port on one of our own IPs.
fn is_self_addr(addr: &str, config: &DiscoveryConfig) -> bool {
    if addr == config.advertise_addr {
        return true;
    }
    let own = [
        format!("{}:{}", netutil::local_ip(), config.port),
        format!("127.0.0.1:{}", config.port),
        format!("[::1]:{}", config.port),
    ];
    own.iter().any(|own_addr| own_addr == addr)
}

/// Record a sighting; false when the address was already seen within
/// the suppression window.
fn mark_seen(cache: &SeenCache, addr: &str, window: Duration) -> bool {
    let mut cache = cache.write();
    if let Some(last) = cache.get(addr) {
        if last.elapsed() < window {
            return false;
        }
    }
    cache.insert(addr.to_string(), Instant::now());
    true
}

/// Drop cache entries older than `ttl`; returns how many went.
fn evict_expired(cache: &SeenCache, ttl: Duration) -> usize {
    let mut cache = cache.write();
    let before = cache.len();
    cache.retain(|_, seen| seen.elapsed() < ttl);
    before - cache.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> DiscoveryConfig {
        DiscoveryConfig::new("peervault-test", 3000, "192.0.2.1:3000")
    }

    #[test]
    fn candidates_cover_v4_and_v6() {
        let addrs = vec![
            "192.168.1.7".parse().unwrap(),
            "fe80::2".parse().unwrap(),
        ];
        let rendered = candidate_addrs(4000, &addrs);
        assert!(rendered.contains(&"192.168.1.7:4000".to_string()));
        assert!(rendered.contains(&"[fe80::2]:4000".to_string()));
    }

    #[test]
    fn advertise_addr_is_self() {
        let config = test_config();
        assert!(is_self_addr("192.0.2.1:3000", &config));
        assert!(is_self_addr(&format!("127.0.0.1:{}", config.port), &config));
        assert!(!is_self_addr("192.0.2.9:3000", &config));
        // Same IP on another port is a different node.
        assert!(!is_self_addr("127.0.0.1:3001", &config));
    }

    #[test]
    fn sightings_are_suppressed_within_the_window() {
        let cache: SeenCache = Arc::new(RwLock::new(HashMap::new()));
        let window = Duration::from_secs(300);

        assert!(mark_seen(&cache, "10.0.0.5:3000", window));
        assert!(!mark_seen(&cache, "10.0.0.5:3000", window));
        assert!(mark_seen(&cache, "10.0.0.6:3000", window));

        // An expired entry is seen again.
        cache
            .write()
            .insert("10.0.0.5:3000".to_string(), Instant::now() - window * 2);
        assert!(mark_seen(&cache, "10.0.0.5:3000", window));
    }

    #[test]
    fn janitor_evicts_expired_entries() {
        let cache: SeenCache = Arc::new(RwLock::new(HashMap::new()));
        let ttl = Duration::from_secs(600);
        cache
            .write()
            .insert("old:3000".to_string(), Instant::now() - ttl * 2);
        cache.write().insert("new:3000".to_string(), Instant::now());

        assert_eq!(evict_expired(&cache, ttl), 1);
        let remaining = cache.read();
        assert!(remaining.contains_key("new:3000"));
        assert!(!remaining.contains_key("old:3000"));
    }

    #[test]
    fn own_record_is_ignored() {
        let config = test_config();
        let cache: SeenCache = Arc::new(RwLock::new(HashMap::new()));
        let dials = Arc::new(RwLock::new(Vec::<String>::new()));
        let dials_cb = Arc::clone(&dials);
        let callback: PeerFoundFn = Arc::new(move |addr| dials_cb.write().push(addr));

        let own_fullname = format!("{}.{}", config.instance_name, SERVICE_TYPE);
        handle_resolved(
            &config,
            &own_fullname,
            &cache,
            &callback,
            &own_fullname,
            config.port,
            vec!["192.168.1.7".parse().unwrap()],
        );
        assert!(dials.read().is_empty());

        handle_resolved(
            &config,
            &own_fullname,
            &cache,
            &callback,
            &format!("other.{SERVICE_TYPE}"),
            4000,
            vec!["192.168.1.8".parse().unwrap()],
        );
        assert_eq!(dials.read().as_slice(), ["192.168.1.8:4000".to_string()]);
    }
}
