//! Storage quota management.
//!
//! The per-node byte budget is persisted as a small JSON descriptor next
//! to the store root. The descriptor is created once (interactively or
//! from a flag, by the CLI collaborator) and only changes on restart.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Descriptor file name, resolved against the store root.
pub const QUOTA_DESCRIPTOR: &str = ".quota.desc";

/// Quota errors
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("no quota descriptor at {0} and no collaborator to create one")]
    MissingDescriptor(PathBuf),
    #[error("invalid storage size {input:?}: {reason}")]
    InvalidSize { input: String, reason: String },
    #[error("failed to parse quota descriptor: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Persisted quota configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaDescriptor {
    pub max_bytes: u64,
    pub storage_root: String,
}

/// Storage usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaStats {
    pub used: u64,
    pub total: u64,
    pub available: u64,
}

/// Owns the node's maximum-bytes budget and answers admission queries.
#[derive(Debug)]
pub struct QuotaManager {
    descriptor: QuotaDescriptor,
    path: PathBuf,
}

impl QuotaManager {
    fn descriptor_path(root: &Path) -> PathBuf {
        root.join(QUOTA_DESCRIPTOR)
    }

    /// Load the descriptor from `root`, failing when it is absent.
    pub fn load_existing(root: &Path) -> Result<Self, QuotaError> {
        let path = Self::descriptor_path(root);
        if !path.is_file() {
            return Err(QuotaError::MissingDescriptor(path));
        }
        let data = std::fs::read(&path)?;
        let descriptor: QuotaDescriptor = serde_json::from_slice(&data)?;
        debug!(max_bytes = descriptor.max_bytes, "loaded quota descriptor");
        Ok(Self { descriptor, path })
    }

    /// Write a fresh descriptor and return the manager.
    pub fn create(root: &Path, max_bytes: u64) -> Result<Self, QuotaError> {
        std::fs::create_dir_all(root)?;
        let path = Self::descriptor_path(root);
        let descriptor = QuotaDescriptor {
            max_bytes,
            storage_root: root.to_string_lossy().into_owned(),
        };
        std::fs::write(&path, serde_json::to_vec_pretty(&descriptor)?)?;
        info!(
            max = %format_bytes(max_bytes),
            root = %root.display(),
            "storage quota initialized"
        );
        Ok(Self { descriptor, path })
    }

    /// Load the descriptor, or solicit a maximum from `provision` and
    /// persist it. The provisioner is the CLI collaborator; a server
    /// without one must refuse to start.
    pub fn load_or_create<F>(root: &Path, provision: F) -> anyhow::Result<Self>
    where
        F: FnOnce() -> anyhow::Result<u64>,
    {
        match Self::load_existing(root) {
            Ok(manager) => Ok(manager),
            Err(QuotaError::MissingDescriptor(_)) => {
                let max_bytes = provision()?;
                Ok(Self::create(root, max_bytes)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.descriptor.max_bytes
    }

    pub fn descriptor_file(&self) -> &Path {
        &self.path
    }

    /// Sum the file sizes under `root`. Unreadable entries are skipped.
    pub fn current_usage(&self, root: &Path) -> std::io::Result<u64> {
        let mut total = 0u64;
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && dir == root => {
                    return Ok(0)
                }
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else { continue };
                if meta.is_dir() {
                    stack.push(entry.path());
                } else {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }

    /// Admission query: does a blob of `candidate_bytes` fit?
    ///
    /// Returns the verdict together with the space still available so
    /// that a refusal can be surfaced to the user.
    pub fn check(&self, root: &Path, candidate_bytes: u64) -> std::io::Result<(bool, u64)> {
        let used = self.current_usage(root)?;
        let available = self.descriptor.max_bytes.saturating_sub(used);
        Ok((candidate_bytes <= available, available))
    }

    pub fn stats(&self, root: &Path) -> std::io::Result<QuotaStats> {
        let used = self.current_usage(root)?;
        let total = self.descriptor.max_bytes;
        Ok(QuotaStats {
            used,
            total,
            available: total.saturating_sub(used),
        })
    }
}

/// Parse a human-readable storage size such as `1GB`, `500MB`, or `32B`.
pub fn parse_storage_size(input: &str) -> Result<u64, QuotaError> {
    let trimmed = input.trim().to_uppercase();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (num_str, unit) = trimmed.split_at(split);

    let invalid = |reason: &str| QuotaError::InvalidSize {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    if num_str.is_empty() {
        return Err(invalid("no number found"));
    }
    let num: f64 = num_str.parse().map_err(|_| invalid("invalid number"))?;

    let multiplier: u64 = match unit.trim() {
        "B" | "BYTES" | "" => 1,
        "KB" | "K" => 1024,
        "MB" | "M" => 1024 * 1024,
        "GB" | "G" => 1024 * 1024 * 1024,
        "TB" | "T" => 1024u64.pow(4),
        other => {
            return Err(invalid(&format!(
                "unknown unit {other:?} (use B, KB, MB, GB, or TB)"
            )))
        }
    };

    Ok((num * multiplier as f64) as u64)
}

/// Render a byte count for humans (`1.5 GB`, `512 B`, ...).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
