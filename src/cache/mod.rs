//! HTTP response cache split into named, versioned partitions.
//!
//! This module provides:
//! - One partition per purpose (shell, API data, images) per version
//! - Lookup and store keyed by normalized GET identity
//! - Best-effort precaching of the app shell
//! - Eviction of every partition generation other than the current one

mod partition;
mod storage;

pub use partition::{PartitionName, Purpose};
pub use storage::{CachedResponse, PrecacheReport, ResponseCache};
