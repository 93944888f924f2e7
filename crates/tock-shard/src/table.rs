use tracing::debug;

use crate::assign::{assigned_shards, PINNED_NODE_COUNT};
use crate::ring::HashRing;
use crate::shard::{Shard, ShardFilter};

/// Precomputed rings used to tag jobs with their shards at registration.
///
/// For every fleet size `F` in `2..=11` the table holds a ring whose nodes are
/// the slot ids `0..F * max_query_size`. A job is tagged once per fleet size,
/// so whichever size is live when a worker starts listening, the worker's
/// assignment from [`assigned_shards`] matches exactly one tag on every job.
#[derive(Debug, Clone)]
pub struct ShardTable {
    max_query_size: u32,
    /// `rings[F - 2]` serves fleet size `F`.
    rings: Vec<HashRing<u32>>,
}

impl ShardTable {
    /// Build every ring by growing one ring slot by slot and snapshotting it
    /// at each fleet-size boundary.
    pub fn new(replicas: usize, max_query_size: u32) -> Self {
        let mut ring = HashRing::new(replicas);
        let mut rings = Vec::with_capacity((PINNED_NODE_COUNT - 1) as usize);
        let mut next_slot = 0;

        for fleet in 2..=PINNED_NODE_COUNT {
            while next_slot < fleet * max_query_size {
                ring.add_node(next_slot);
                next_slot += 1;
            }
            rings.push(ring.clone());
        }
        debug!(
            replicas,
            max_query_size,
            slots = next_slot,
            "shard table built"
        );
        Self {
            max_query_size,
            rings,
        }
    }

    pub fn max_query_size(&self) -> u32 {
        self.max_query_size
    }

    /// One shard per partitioned fleet size, ordered by `node_count`.
    pub fn tags_for(&self, key: &str) -> Vec<Shard> {
        self.rings
            .iter()
            .zip(2..=PINNED_NODE_COUNT)
            .filter_map(|(ring, fleet)| ring.get_node(key).map(|&slot| Shard::new(slot, fleet)))
            .collect()
    }

    /// Listener filter for one worker; `None` for a single-worker fleet.
    pub fn filter_for(&self, worker_index: u32, fleet_size: u32) -> ShardFilter {
        assigned_shards(worker_index, fleet_size, self.max_query_size)
    }
}
