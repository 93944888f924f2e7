//! `tock-shard`: assigning jobs to workers.
//!
//! - [`HashRing`] maps a key onto one of N nodes via virtual-node hashing.
//! - [`assigned_shards`] gives each worker a bounded slice of the shard space
//!   for the current fleet size.
//! - [`ShardTable`] tags a job with its shards at registration time.

pub mod assign;
pub mod error;
pub mod ring;
pub mod shard;
pub mod table;

pub use assign::{assigned_shards, DEFAULT_MAX_QUERY_SIZE, PINNED_NODE_COUNT};
pub use error::{Result, ShardError};
pub use ring::{hash_key, HashRing, DEFAULT_REPLICAS};
pub use shard::{filter_matches, Shard, ShardFilter};
pub use table::ShardTable;
