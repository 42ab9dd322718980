//! Merkle-sum tree over customer records.
//!
//! Levels are numbered from the leaves (level 0) up to the root (level `height - 1`). Nodes that
//! were never written resolve to the cached zero node of their level, so a tree of height 64 costs
//! nothing until leaves are set.

use crate::error::CarbonError;
use crate::types::{AggregateNode, Customer, RatioBounds};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One hop of a witness path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessStep {
    /// True when the node on the path is the left child at this level.
    pub is_left: bool,
    pub sibling: AggregateNode,
}

/// Ordered sibling path from a leaf up to (but excluding) the root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub path: Vec<WitnessStep>,
}

impl Witness {
    /// Replay the path from `leaf` and return the root it implies.
    pub fn calculate_root(&self, leaf: &AggregateNode) -> Result<AggregateNode, CarbonError> {
        let mut current = *leaf;
        for step in &self.path {
            current = if step.is_left {
                AggregateNode::combine(&current, &step.sibling)?
            } else {
                AggregateNode::combine(&step.sibling, &current)?
            };
        }
        Ok(current)
    }

    /// Leaf index encoded by the left/right flags.
    pub fn calculate_index(&self) -> u64 {
        self.path
            .iter()
            .enumerate()
            .filter(|(_, step)| !step.is_left)
            .fold(0u64, |acc, (level, _)| acc | (1u64 << level))
    }
}

#[derive(Clone, Debug)]
pub struct MerkleSumTree {
    height: usize,
    bounds: RatioBounds,
    nodes: HashMap<(usize, u64), AggregateNode>,
    zeroes: Vec<AggregateNode>,
    sealed: bool,
}

impl MerkleSumTree {
    /// Empty tree with `2^(height-1)` zero leaves.
    pub fn new(height: usize, bounds: RatioBounds) -> Result<Self, CarbonError> {
        if height == 0 || height > 64 {
            return Err(CarbonError::UnsupportedConfiguration(format!(
                "tree height must be in 1..=64, got {height}"
            )));
        }

        let mut zeroes = Vec::with_capacity(height);
        zeroes.push(AggregateNode::zero(&bounds));
        for level in 1..height {
            let below = zeroes[level - 1];
            zeroes.push(AggregateNode::combine(&below, &below)?);
        }

        Ok(Self {
            height,
            bounds,
            nodes: HashMap::new(),
            zeroes,
            sealed: false,
        })
    }

    /// Smallest height whose leaf count holds `leaves` records.
    pub fn height_for(leaves: usize) -> usize {
        leaves.max(1).next_power_of_two().trailing_zeros() as usize + 1
    }

    /// Build, fill and seal a tree from an ordered record set. Record `i` lands at leaf `i`.
    pub fn from_customers(
        height: usize,
        customers: &[Customer],
        bounds: RatioBounds,
    ) -> Result<Self, CarbonError> {
        let mut tree = Self::new(height, bounds)?;
        if customers.len() as u64 > tree.leaf_count() {
            return Err(CarbonError::IndexOutOfRange {
                index: customers.len() as u64 - 1,
                leaf_count: tree.leaf_count(),
            });
        }
        for (i, customer) in customers.iter().enumerate() {
            tree.set_leaf(i as u64, customer.leaf(&bounds))?;
        }
        tree.seal();
        Ok(tree)
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn bounds(&self) -> RatioBounds {
        self.bounds
    }

    pub fn leaf_count(&self) -> u64 {
        1u64 << (self.height - 1)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Freeze the tree once its root has been handed downstream.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Precomputed zero node for `level`.
    pub fn zero(&self, level: usize) -> Option<&AggregateNode> {
        self.zeroes.get(level)
    }

    pub fn node(&self, level: usize, index: u64) -> AggregateNode {
        self.nodes
            .get(&(level, index))
            .copied()
            .unwrap_or_else(|| self.zeroes[level.min(self.height - 1)])
    }

    pub fn leaf(&self, index: u64) -> AggregateNode {
        self.node(0, index)
    }

    pub fn root(&self) -> AggregateNode {
        self.node(self.height - 1, 0)
    }

    /// Write a leaf and recompute its path to the root.
    ///
    /// Every ancestor is computed before anything is stored; a ratio-bound conflict at any level
    /// leaves the tree untouched.
    pub fn set_leaf(&mut self, index: u64, leaf: AggregateNode) -> Result<(), CarbonError> {
        if self.sealed {
            return Err(CarbonError::TreeSealed);
        }
        self.check_index(index)?;

        let mut updates = Vec::with_capacity(self.height);
        let mut current = leaf;
        let mut idx = index;
        updates.push(((0, idx), current));

        for level in 1..self.height {
            let sibling = self.node(level - 1, idx ^ 1);
            current = if idx % 2 == 0 {
                AggregateNode::combine(&current, &sibling)?
            } else {
                AggregateNode::combine(&sibling, &current)?
            };
            idx /= 2;
            updates.push(((level, idx), current));
        }

        self.nodes.extend(updates);
        Ok(())
    }

    /// Sibling path for leaf `index`, length `height - 1`.
    pub fn witness(&self, index: u64) -> Result<Witness, CarbonError> {
        self.check_index(index)?;

        let mut path = Vec::with_capacity(self.height - 1);
        let mut idx = index;
        for level in 0..self.height - 1 {
            let is_left = idx % 2 == 0;
            path.push(WitnessStep {
                is_left,
                sibling: self.node(level, idx ^ 1),
            });
            idx /= 2;
        }
        Ok(Witness { path })
    }

    /// Self-test: a leaf and its own witness reproduce the stored root.
    pub fn validate(&self, index: u64) -> Result<(), CarbonError> {
        let witness = self.witness(index)?;
        let computed = witness.calculate_root(&self.leaf(index))?;
        match computed.first_difference(&self.root()) {
            None => Ok(()),
            Some(field) => Err(CarbonError::Consistency(format!(
                "leaf {index} replays to a root with a different {field}"
            ))),
        }
    }

    /// Check an externally supplied witness for leaf `index` against this tree's root.
    pub fn validate_witness(&self, index: u64, witness: &Witness) -> Result<(), CarbonError> {
        self.check_index(index)?;
        if witness.path.len() != self.height - 1 {
            return Err(CarbonError::Consistency(format!(
                "witness has {} steps, tree of height {} needs {}",
                witness.path.len(),
                self.height,
                self.height - 1
            )));
        }
        if witness.calculate_index() != index {
            return Err(CarbonError::Consistency(format!(
                "witness encodes leaf {}, expected {index}",
                witness.calculate_index()
            )));
        }

        let computed = witness.calculate_root(&self.leaf(index))?;
        if computed != self.root() {
            return Err(CarbonError::WitnessRootMismatch);
        }
        Ok(())
    }

    fn check_index(&self, index: u64) -> Result<(), CarbonError> {
        if index >= self.leaf_count() {
            return Err(CarbonError::IndexOutOfRange {
                index,
                leaf_count: self.leaf_count(),
            });
        }
        Ok(())
    }
}
