//! PeerVault storage
//!
//! Content-addressed blob store, the storage-quota admission gate, and
//! the periodic integrity/garbage-collection sweep.
//!
//! ## Modules
//! - `store`: content-addressed tree keyed by (owner node-id, key-id)
//! - `quota`: per-node byte budget persisted next to the store root
//! - `gc`: rehash-and-compare sweeps over the node's own namespace

pub mod gc;
pub mod quota;
pub mod store;

pub use gc::{GarbageCollector, GcConfig, SweepObserver, SweepStats};
pub use quota::{format_bytes, parse_storage_size, QuotaError, QuotaManager, QuotaStats};
pub use store::{content_address, FileInfo, PathAddress, Store, StoreError, SEGMENT_LEN};
