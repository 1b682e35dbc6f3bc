use std::collections::BTreeSet;

use tunnel_proto::ChannelId;

/// Allocates channel ids, reclaiming freed ones first.
///
/// Id 0 is the control channel and is never handed out.
pub(crate) struct IdAllocator {
    freed: BTreeSet<u32>,
    next: u32,
}

impl IdAllocator {
    pub(crate) fn new() -> Self {
        Self {
            freed: BTreeSet::new(),
            next: 1,
        }
    }

    /// Returns `None` when the id space is exhausted.
    pub(crate) fn alloc(&mut self) -> Option<ChannelId> {
        if let Some(freed) = self.freed.iter().next().copied() {
            self.freed.remove(&freed);
            return Some(ChannelId::from(freed));
        }

        let id = self.next;
        self.next = self.next.checked_add(1)?;
        Some(ChannelId::from(id))
    }

    /// Freed ids can be later reclaimed.
    pub(crate) fn free(&mut self, id: ChannelId) {
        self.freed.insert(u32::from(id));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn ids_start_at_one_and_are_reclaimed() {
        let mut allocator = IdAllocator::new();

        let first = allocator.alloc().unwrap();
        let second = allocator.alloc().unwrap();
        assert_eq!(u32::from(first), 1);
        assert_eq!(u32::from(second), 2);

        allocator.free(first);
        assert_eq!(u32::from(allocator.alloc().unwrap()), 1);
        assert_eq!(u32::from(allocator.alloc().unwrap()), 3);
    }
}
