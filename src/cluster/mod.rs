//! Shard routing for a single process
//!
//! Keys are placed on a consistent hash ring of virtual nodes, so adding a
//! shard only moves about 1/N of the keyspace. [`LocalCluster`] combines the
//! ring with the set of shards this node currently owns; ownership can be
//! handed over at runtime to model a rebalance.
//!
//! ```text
//!        vnode(s0)      vnode(s2)
//!   ---o---------x-------o---------o---  ring of u64 hashes
//!                ^                 vnode(s1)
//!         hash(key) -> first vnode clockwise -> s2
//! ```
//!
//! # Example
//!
//! ```rust
//! use cascade_store::cluster::LocalCluster;
//! use cascade_store::engine::traits::ClusterRouter;
//!
//! let cluster = LocalCluster::new(4, 64);
//! let shard = cluster.shard_for("volume/merchant=7");
//! assert!(cluster.is_local(shard));
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use crate::engine::traits::{ClusterRouter, Routed, ShardTask};
use crate::error::Result;
use crate::queue::ApplyOutcome;
use crate::types::ShardId;

// =============================================================================
// Consistent Hash Ring
// =============================================================================

/// Hash ring mapping virtual node positions to shards
#[derive(Debug)]
pub struct ConsistentHashRing {
    ring: BTreeMap<u64, ShardId>,
    num_shards: usize,
    virtual_nodes: usize,
}

impl ConsistentHashRing {
    /// Build a ring; at least one shard and one virtual node are always used
    pub fn new(num_shards: usize, virtual_nodes: usize) -> Self {
        let num_shards = num_shards.max(1);
        let virtual_nodes = virtual_nodes.max(1);
        let mut ring = BTreeMap::new();
        for shard in 0..num_shards {
            for vnode in 0..virtual_nodes {
                ring.insert(hash(&format!("shard-{}-vnode-{}", shard, vnode)), shard);
            }
        }
        Self {
            ring,
            num_shards,
            virtual_nodes,
        }
    }

    /// Shard owning `key`
    pub fn route(&self, key: &str) -> ShardId {
        let h = hash(key);
        self.ring
            .range(h..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map_or(0, |(_, shard)| *shard)
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.num_shards
    }

    /// Virtual nodes per shard
    pub fn virtual_nodes_per_shard(&self) -> usize {
        self.virtual_nodes
    }

    /// Virtual node count per shard
    pub fn distribution(&self) -> Vec<usize> {
        let mut counts = vec![0; self.num_shards];
        for &shard in self.ring.values() {
            counts[shard] += 1;
        }
        counts
    }
}

fn hash(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

// =============================================================================
// Local Cluster
// =============================================================================

/// Single-node cluster router with an adjustable set of owned shards
#[derive(Debug)]
pub struct LocalCluster {
    ring: ConsistentHashRing,
    owned: RwLock<BTreeSet<ShardId>>,
}

impl LocalCluster {
    /// Router owning every shard
    pub fn new(num_shards: usize, virtual_nodes: usize) -> Self {
        let ring = ConsistentHashRing::new(num_shards, virtual_nodes);
        let owned = (0..ring.shard_count()).collect();
        Self {
            ring,
            owned: RwLock::new(owned),
        }
    }

    /// Router owning only `shards`
    pub fn with_owned_shards<I>(num_shards: usize, virtual_nodes: usize, shards: I) -> Self
    where
        I: IntoIterator<Item = ShardId>,
    {
        let ring = ConsistentHashRing::new(num_shards, virtual_nodes);
        let owned = shards
            .into_iter()
            .filter(|s| *s < ring.shard_count())
            .collect();
        Self {
            ring,
            owned: RwLock::new(owned),
        }
    }

    /// Hand a shard over to another node
    pub fn release_shard(&self, shard: ShardId) -> bool {
        let released = self.owned.write().remove(&shard);
        if released {
            tracing::info!(shard, "Shard released");
        }
        released
    }

    /// Take ownership of a shard
    pub fn acquire_shard(&self, shard: ShardId) -> bool {
        if shard >= self.ring.shard_count() {
            return false;
        }
        let acquired = self.owned.write().insert(shard);
        if acquired {
            tracing::info!(shard, "Shard acquired");
        }
        acquired
    }

    /// Underlying hash ring
    pub fn ring(&self) -> &ConsistentHashRing {
        &self.ring
    }
}

#[async_trait]
impl ClusterRouter for LocalCluster {
    fn shard_for(&self, key: &str) -> ShardId {
        self.ring.route(key)
    }

    fn is_local(&self, shard: ShardId) -> bool {
        self.owned.read().contains(&shard)
    }

    fn local_shards(&self) -> Vec<ShardId> {
        self.owned.read().iter().copied().collect()
    }

    async fn run_on_owner(&self, shard: ShardId, task: ShardTask) -> Routed<Result<ApplyOutcome>> {
        if !self.is_local(shard) {
            tracing::debug!(shard, "Shard not owned locally");
            return Routed::NotLocal;
        }
        Routed::Ran(task.await)
    }
}
