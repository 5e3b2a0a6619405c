//! Purpose: Per-priority bucket table that keeps a linked store priority-ordered.
//! Exports: `PriorityIndex`, `repair_bucket`.
//! Role: Pure bookkeeping for `MessageStore`; never touches storage itself.
//! Invariants: Traversal order is priority-descending (9 -> 0), FIFO within a priority.
//! Invariants: `bucket[p]` is the last live record of priority `p` in traversal order, or none.
use crate::core::handle::Handle;
use crate::core::message::PRIORITY_LEVELS;

/// New value for a bucket after `deleted` was unlinked.
///
/// `predecessor` is what the linked store returned from the delete and
/// `nearest_higher` the closest set bucket above this priority. When the
/// predecessor is that higher record, no record of this priority is left.
pub fn repair_bucket(
    current: Option<Handle>,
    deleted: Handle,
    predecessor: Option<Handle>,
    nearest_higher: Option<Handle>,
) -> Option<Handle> {
    if current != Some(deleted) {
        return current;
    }
    if predecessor == nearest_higher {
        None
    } else {
        predecessor
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PriorityIndex {
    buckets: [Option<Handle>; PRIORITY_LEVELS],
}

impl PriorityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket(&self, priority: u8) -> Option<Handle> {
        self.buckets[priority as usize]
    }

    pub fn buckets(&self) -> &[Option<Handle>; PRIORITY_LEVELS] {
        &self.buckets
    }

    pub fn clear(&mut self) {
        self.buckets = [None; PRIORITY_LEVELS];
    }

    /// Closest tracked record with a strictly higher priority.
    pub fn nearest_higher(&self, priority: u8) -> Option<Handle> {
        self.buckets[priority as usize + 1..]
            .iter()
            .find_map(|bucket| *bucket)
    }

    /// Record a new message of `priority` must be linked after (`None` = front).
    pub fn insertion_point(&self, priority: u8) -> Option<Handle> {
        self.bucket(priority)
            .or_else(|| self.nearest_higher(priority))
    }

    pub fn record_store(&mut self, priority: u8, handle: Handle) {
        self.buckets[priority as usize] = Some(handle);
    }

    pub fn record_delete(&mut self, priority: u8, deleted: Handle, predecessor: Option<Handle>) {
        let nearest_higher = self.nearest_higher(priority);
        let slot = &mut self.buckets[priority as usize];
        *slot = repair_bucket(*slot, deleted, predecessor, nearest_higher);
    }

    /// Follows a record that a replace moved to a new handle.
    pub fn record_move(&mut self, priority: u8, from: Handle, to: Handle) {
        let slot = &mut self.buckets[priority as usize];
        if *slot == Some(from) {
            *slot = Some(to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PriorityIndex, repair_bucket};
    use crate::core::handle::Handle;

    fn h(index: u32) -> Option<Handle> {
        Some(Handle::new(index))
    }

    #[test]
    fn repair_leaves_untracked_buckets_alone() {
        let values = [None, h(0), h(1), h(2)];
        for current in values {
            for predecessor in values {
                for nearest_higher in values {
                    assert_eq!(
                        repair_bucket(current, Handle::new(3), predecessor, nearest_higher),
                        current
                    );
                }
            }
        }
    }

    #[test]
    fn repair_table() {
        let deleted = Handle::new(5);
        // Only record of its priority, behind a higher one.
        assert_eq!(repair_bucket(h(5), deleted, h(2), h(2)), None);
        // Only record in the whole store.
        assert_eq!(repair_bucket(h(5), deleted, None, None), None);
        // Same-priority predecessor takes over.
        assert_eq!(repair_bucket(h(5), deleted, h(4), h(2)), h(4));
        assert_eq!(repair_bucket(h(5), deleted, h(4), None), h(4));
        // At the front with higher buckets elsewhere (cannot happen in a valid order) keeps none.
        assert_eq!(repair_bucket(h(5), deleted, None, h(1)), None);
    }

    #[test]
    fn insertion_point_prefers_own_then_nearest_higher() {
        let mut index = PriorityIndex::new();
        assert_eq!(index.insertion_point(4), None);
        index.record_store(9, Handle::new(1));
        index.record_store(6, Handle::new(2));
        assert_eq!(index.insertion_point(4), h(2));
        assert_eq!(index.insertion_point(7), h(1));
        assert_eq!(index.insertion_point(9), h(1));
        index.record_store(4, Handle::new(3));
        assert_eq!(index.insertion_point(4), h(3));
        assert_eq!(index.nearest_higher(9), None);
    }

    #[test]
    fn move_follows_tracked_handle_only() {
        let mut index = PriorityIndex::new();
        index.record_store(3, Handle::new(1));
        index.record_move(3, Handle::new(7), Handle::new(8));
        assert_eq!(index.bucket(3), h(1));
        index.record_move(3, Handle::new(1), Handle::new(8));
        assert_eq!(index.bucket(3), h(8));
    }

    struct XorShift64(u64);

    impl XorShift64 {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    /// Drives the index against a plain vector model of the linked order.
    #[test]
    fn random_store_delete_keeps_order_and_buckets() {
        let mut rng = XorShift64(0x9e37_79b9_7f4a_7c15);
        let mut index = PriorityIndex::new();
        let mut order: Vec<(Handle, u8)> = Vec::new();
        let mut next_handle = 0u32;

        for _ in 0..4000 {
            if order.is_empty() || rng.next() % 3 != 0 {
                let priority = (rng.next() % 10) as u8;
                let handle = Handle::new(next_handle);
                next_handle += 1;
                let position = match index.insertion_point(priority) {
                    Some(after) => order
                        .iter()
                        .position(|(h, _)| *h == after)
                        .expect("insertion point is live")
                        + 1,
                    None => 0,
                };
                order.insert(position, (handle, priority));
                index.record_store(priority, handle);
            } else {
                let position = (rng.next() % order.len() as u64) as usize;
                let (handle, priority) = order.remove(position);
                let predecessor = position.checked_sub(1).map(|p| order[p].0);
                index.record_delete(priority, handle, predecessor);
            }

            assert!(order.windows(2).all(|pair| pair[0].1 >= pair[1].1));
            for priority in 0..10u8 {
                let expected = order
                    .iter()
                    .rev()
                    .find(|(_, p)| *p == priority)
                    .map(|(h, _)| *h);
                assert_eq!(index.bucket(priority), expected, "priority {priority}");
            }
        }
    }
}
