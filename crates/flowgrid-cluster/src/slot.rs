//! Slot assignment over the live master ring.
//!
//! Every master sorts the live master set with the same total order
//! (byte-wise on `host:port`, see [`NodeIdentity`]) and takes its position
//! in that order as its slot. No coordination is needed beyond agreeing on
//! the set. Inserting or removing one master shifts every later slot, so
//! assignments are always recomputed from scratch.

use flowgrid_core::NodeIdentity;

/// This node's position in the master ring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotAssignment {
    ring: Vec<NodeIdentity>,
    self_index: Option<usize>,
}

impl SlotAssignment {
    pub fn compute<'a, I>(masters: I, me: &NodeIdentity) -> Self
    where
        I: IntoIterator<Item = &'a NodeIdentity>,
    {
        let mut ring: Vec<NodeIdentity> = masters.into_iter().cloned().collect();
        ring.sort();
        ring.dedup();
        let self_index = ring.binary_search(me).ok();
        Self { ring, self_index }
    }

    /// Zero-based slot, or `None` when this node is not in the ring and
    /// must not claim any shard.
    pub fn slot(&self) -> Option<usize> {
        self.self_index
    }

    pub fn ring_size(&self) -> usize {
        self.ring.len()
    }

    pub fn ring(&self) -> &[NodeIdentity] {
        &self.ring
    }

    /// Whether `key` falls in this node's shard (`key mod ring_size == slot`).
    pub fn owns(&self, key: u64) -> bool {
        match self.self_index {
            Some(slot) => key % self.ring.len() as u64 == slot as u64,
            None => false,
        }
    }
}

/// `(slot, ring_size)` for `me` within `masters`.
pub fn compute_slot<'a, I>(masters: I, me: &NodeIdentity) -> (Option<usize>, usize)
where
    I: IntoIterator<Item = &'a NodeIdentity>,
{
    let assignment = SlotAssignment::compute(masters, me);
    (assignment.slot(), assignment.ring_size())
}
