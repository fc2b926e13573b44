//! Periodic integrity verification and cleanup.
//!
//! The collector rehashes every blob under the node's own namespace and
//! removes any whose digest no longer matches its leaf name, then sweeps
//! empty directories. It never touches replicas held for other owners.

use crate::store::Store;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Hex length of a blob leaf name eligible for integrity checks.
const LEAF_HEX_LEN: usize = 64;

/// Garbage collection timings.
#[derive(Debug, Clone)]
pub struct GcConfig {
    pub initial_delay: Duration,
    pub sweep_interval: Duration,
    pub integrity_enabled: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            integrity_enabled: true,
        }
    }
}

/// Outcome of one sweep, reported to the metrics collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub corrupted: usize,
    pub orphaned: usize,
    pub removed: usize,
}

/// Callback invoked after every sweep.
pub type SweepObserver = Arc<dyn Fn(SweepStats) + Send + Sync>;

/// Await until the shutdown flag flips true, without holding a
/// non-`Send` watch guard across an `.await` (as `wait_for` would).
async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Periodic integrity/garbage collector over one node namespace.
pub struct GarbageCollector {
    store_root: PathBuf,
    node_id: String,
    config: GcConfig,
    last_sweep: Mutex<Option<SweepStats>>,
    observer: Mutex<Option<SweepObserver>>,
}

impl GarbageCollector {
    pub fn new(store: &Store, node_id: impl Into<String>) -> Self {
        Self::with_config(store, node_id, GcConfig::default())
    }

    pub fn with_config(store: &Store, node_id: impl Into<String>, config: GcConfig) -> Self {
        Self {
            store_root: store.root().to_path_buf(),
            node_id: node_id.into(),
            config,
            last_sweep: Mutex::new(None),
            observer: Mutex::new(None),
        }
    }

    /// Install the sweep observer (the external metrics collaborator).
    pub fn set_observer(&self, observer: SweepObserver) {
        *self.observer.lock() = Some(observer);
    }

    pub fn last_sweep(&self) -> Option<SweepStats> {
        *self.last_sweep.lock()
    }

    /// Spawn the sweep loop: one sweep after the initial delay, then one
    /// per interval, until the shutdown signal flips.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let gc = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_stop(&mut shutdown) => return,
                _ = tokio::time::sleep(gc.config.initial_delay) => {}
            }
            gc.run_sweep_now().await;

            let mut ticker = tokio::time::interval(gc.config.sweep_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = wait_for_stop(&mut shutdown) => {
                        debug!("garbage collector stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        gc.run_sweep_now().await;
                    }
                }
            }
        });
    }

    /// Run one full sweep immediately and report its stats.
    pub async fn run_sweep_now(&self) -> SweepStats {
        let node_dir = self.store_root.join(&self.node_id);
        let integrity = self.config.integrity_enabled;
        let start = std::time::Instant::now();

        let stats = tokio::task::spawn_blocking(move || {
            let mut stats = SweepStats::default();
            if integrity {
                sweep_integrity(&node_dir, &mut stats);
            }
            sweep_orphans(&node_dir, &mut stats);
            stats
        })
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "garbage collection sweep panicked");
            SweepStats::default()
        });

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            corrupted = stats.corrupted,
            orphaned = stats.orphaned,
            removed = stats.removed,
            "garbage collection completed"
        );

        *self.last_sweep.lock() = Some(stats);
        if let Some(observer) = self.observer.lock().clone() {
            observer(stats);
        }
        stats
    }
}

/// Rehash every hash-named blob and remove the first-segment subtree of
/// any whose content digest disagrees with its leaf.
fn sweep_integrity(node_dir: &Path, stats: &mut SweepStats) {
    let mut stack = vec![node_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let leaf = entry.file_name().to_string_lossy().into_owned();
            if leaf.len() != LEAF_HEX_LEN || !leaf.bytes().all(|b| b.is_ascii_hexdigit()) {
                continue;
            }
            // Concurrent writers are tolerated: unreadable files are skipped.
            let actual = match file_digest(&path) {
                Ok(digest) => digest,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping unreadable blob");
                    continue;
                }
            };
            if actual != leaf {
                warn!(
                    path = %path.display(),
                    expected = %leaf,
                    actual = %actual,
                    "integrity violation, removing blob subtree"
                );
                stats.corrupted += 1;
                match first_segment_subtree(node_dir, &path) {
                    Some(subtree) => match std::fs::remove_dir_all(&subtree) {
                        Ok(()) => stats.removed += 1,
                        Err(e) => warn!(error = %e, "failed to remove corrupted blob"),
                    },
                    None => {
                        if std::fs::remove_file(&path).is_ok() {
                            stats.removed += 1;
                        }
                    }
                }
            }
        }
    }
}

/// Remove directories under the node dir that have become empty.
fn sweep_orphans(node_dir: &Path, stats: &mut SweepStats) {
    let mut dirs = Vec::new();
    let mut stack = vec![node_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
                dirs.push(path);
            }
        }
    }

    // Deepest first, so a whole empty chain goes in one sweep.
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        let empty = match std::fs::read_dir(&dir) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => continue,
        };
        if empty && std::fs::remove_dir(&dir).is_ok() {
            debug!(dir = %dir.display(), "removed empty directory");
            stats.orphaned += 1;
            stats.removed += 1;
        }
    }
}

/// The `<node-dir>/<first-segment>` subtree containing `path`.
fn first_segment_subtree(node_dir: &Path, path: &Path) -> Option<PathBuf> {
    let rel = path.strip_prefix(node_dir).ok()?;
    let first = rel.components().next()?;
    let subtree = node_dir.join(first);
    if subtree == *path {
        // Blob sits directly under the node dir; remove just the file.
        return None;
    }
    Some(subtree)
}

fn file_digest(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
