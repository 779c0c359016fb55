//! Topology - the NUMA shape the scheduler starts up against.
//!
//! Either detected from the host or fabricated for tests; a fake
//! topology lets a single-socket machine exercise multi-node queue
//! selection and stealing.

use serde::{Deserialize, Serialize};

/// One NUMA node and the workers it runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyNode {
    pub num_workers: usize,
}

/// Description of (real or simulated) NUMA nodes and workers per node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    nodes: Vec<TopologyNode>,
}

impl Topology {
    /// Detect the host: one node, one worker per logical core
    pub fn detect() -> Self {
        Self {
            nodes: vec![TopologyNode { num_workers: num_cpus::get().max(1) }],
        }
    }

    /// Fabricate `num_nodes` nodes with `workers_per_node` workers each
    pub fn fake(num_nodes: usize, workers_per_node: usize) -> Self {
        assert!(num_nodes > 0 && workers_per_node > 0);
        Self {
            nodes: (0..num_nodes)
                .map(|_| TopologyNode { num_workers: workers_per_node })
                .collect(),
        }
    }

    /// A single node with a single worker
    pub fn single_worker() -> Self {
        Self::fake(1, 1)
    }

    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn total_workers(&self) -> usize {
        self.nodes.iter().map(|node| node.num_workers).sum()
    }

    #[inline]
    pub fn nodes(&self) -> &[TopologyNode] {
        &self.nodes
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::detect()
    }
}
