//! Granted locks of one mode, ordered by extent.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Extent, Lock};

/// Locks of one mode keyed by extent.
///
/// Locks with identical extents share a node and form a policy group.
/// Nodes are ordered by extent start, then end.
#[derive(Debug, Default)]
pub struct IntervalTree {
    nodes: BTreeMap<(u64, u64), Vec<Arc<Lock>>>,
    len: usize,
}

impl IntervalTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, lock: Arc<Lock>) {
        let extent = lock.extent();
        self.nodes
            .entry((extent.start, extent.end))
            .or_default()
            .push(lock);
        self.len += 1;
    }

    /// Remove `lock`. Returns false if it was not in the tree.
    pub fn remove(&mut self, lock: &Arc<Lock>) -> bool {
        let extent = lock.extent();
        let key = (extent.start, extent.end);
        let Some(group) = self.nodes.get_mut(&key) else {
            return false;
        };
        let Some(pos) = group.iter().position(|held| Arc::ptr_eq(held, lock)) else {
            return false;
        };
        group.remove(pos);
        if group.is_empty() {
            self.nodes.remove(&key);
        }
        self.len -= 1;
        true
    }

    /// Nodes from the highest extent down, each with its group of locks in
    /// grant order.
    pub fn iter_rev(&self) -> impl Iterator<Item = (Extent, &[Arc<Lock>])> + '_ {
        self.nodes
            .iter()
            .rev()
            .map(|(&(start, end), group)| (Extent::new(start, end), group.as_slice()))
    }

    /// Locks whose extent overlaps `extent`.
    pub fn overlapping<'a>(&'a self, extent: &'a Extent) -> impl Iterator<Item = &'a Arc<Lock>> + 'a {
        self.nodes
            .range(..=(extent.end, u64::MAX))
            .filter(move |&(&(_, end), _)| end >= extent.start)
            .flat_map(|(_, group)| group.iter())
    }

    /// Remove and return every lock.
    pub fn drain(&mut self) -> Vec<Arc<Lock>> {
        self.len = 0;
        std::mem::take(&mut self.nodes)
            .into_values()
            .flatten()
            .collect()
    }

    /// Number of locks.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of distinct extents.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
