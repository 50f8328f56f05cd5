//! The per-kind handle table: "just a slab" of integer handles.

use crate::error::TableError;
use crate::resources::ResourceId;
use std::mem;

/// The maximum handle value, keeping the upper bits free for tagging.
pub const MAX_RESOURCE_HANDLE: u32 = 1 << 30;

/// A slab mapping guest-visible integer handles to host representations.
///
/// Handles start at 1; 0 is never handed out. Freed slots are chained into a
/// singly linked free list threaded through the slots themselves, so both
/// allocation and removal are O(1). The table never shrinks.
#[derive(Debug)]
pub struct HandleTable {
    /// Handle of the first free slot, or 0 if the free list is empty.
    free: u32,
    slots: Vec<Slot>,
    max_handle: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// This slot is free and points to the next free handle, 0 terminating
    /// the list.
    Free { next: u32 },

    /// This slot holds a live handle.
    Occupied { rep: ResourceId, owned: bool },
}

/// What a live handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleEntry {
    /// The host representation named by the handle.
    pub rep: ResourceId,
    /// Whether the handle owns the representation or merely borrows it.
    pub owned: bool,
}

impl Default for HandleTable {
    fn default() -> HandleTable {
        HandleTable::new()
    }
}

impl HandleTable {
    /// Creates an empty table using the default handle cap.
    pub fn new() -> HandleTable {
        HandleTable::with_max_handle(MAX_RESOURCE_HANDLE)
    }

    /// Creates an empty table handing out handles strictly below
    /// `max_handle`.
    pub fn with_max_handle(max_handle: u32) -> HandleTable {
        HandleTable {
            free: 0,
            slots: Vec::new(),
            max_handle: max_handle.min(MAX_RESOURCE_HANDLE),
        }
    }

    /// Allocates an owning handle for `rep`.
    pub fn create_own(&mut self, rep: ResourceId) -> Result<u32, TableError> {
        self.insert(Slot::Occupied { rep, owned: true })
    }

    /// Allocates a borrowing handle for `rep`.
    pub fn create_borrow(&mut self, rep: ResourceId) -> Result<u32, TableError> {
        self.insert(Slot::Occupied { rep, owned: false })
    }

    fn insert(&mut self, new: Slot) -> Result<u32, TableError> {
        if self.free != 0 {
            let handle = self.free;
            let idx = (handle - 1) as usize;
            self.free = match mem::replace(&mut self.slots[idx], new) {
                Slot::Free { next } => next,
                Slot::Occupied { .. } => unreachable!("free list points at a live slot"),
            };
            return Ok(handle);
        }

        let handle = u32::try_from(self.slots.len() + 1).map_err(|_| TableError::Full)?;
        if handle >= self.max_handle {
            return Err(TableError::Full);
        }
        self.slots.push(new);
        Ok(handle)
    }

    fn slot(&self, handle: u32) -> Result<&Slot, TableError> {
        let idx = handle
            .checked_sub(1)
            .ok_or(TableError::UnknownHandle(handle))?;
        self.slots
            .get(idx as usize)
            .ok_or(TableError::UnknownHandle(handle))
    }

    /// Looks up `handle` without modifying the table.
    pub fn get(&self, handle: u32) -> Result<HandleEntry, TableError> {
        match *self.slot(handle)? {
            Slot::Occupied { rep, owned } => Ok(HandleEntry { rep, owned }),
            Slot::Free { .. } => Err(TableError::FreedHandle(handle)),
        }
    }

    /// Frees `handle`, returning what it referred to.
    ///
    /// Removing a handle that was never allocated or is already free fails
    /// and leaves the table untouched.
    pub fn remove(&mut self, handle: u32) -> Result<HandleEntry, TableError> {
        let entry = self.get(handle)?;
        self.slots[(handle - 1) as usize] = Slot::Free { next: self.free };
        self.free = handle;
        Ok(entry)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Occupied { .. }))
            .count()
    }

    /// Whether no handle is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots ever allocated, live or free.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn rep(n: u32) -> ResourceId {
        ResourceId::from_u32(n)
    }

    #[test]
    fn handles_start_at_one() {
        let mut table = HandleTable::new();
        assert_eq!(table.create_own(rep(10)).unwrap(), 1);
        assert_eq!(table.create_borrow(rep(11)).unwrap(), 2);
        assert_eq!(
            table.get(1).unwrap(),
            HandleEntry {
                rep: rep(10),
                owned: true
            }
        );
        assert!(!table.get(2).unwrap().owned);
        assert_eq!(table.get(0), Err(TableError::UnknownHandle(0)));
    }

    #[test]
    fn freed_handles_are_reused_lifo() {
        let mut table = HandleTable::new();
        for i in 0..4 {
            table.create_own(rep(i)).unwrap();
        }
        table.remove(2).unwrap();
        table.remove(4).unwrap();
        assert_eq!(table.create_own(rep(20)).unwrap(), 4);
        assert_eq!(table.create_own(rep(21)).unwrap(), 2);
        assert_eq!(table.create_own(rep(22)).unwrap(), 5);
        assert_eq!(table.capacity(), 5);
    }

    #[test]
    fn double_remove_leaves_table_intact() {
        let mut table = HandleTable::new();
        let a = table.create_own(rep(1)).unwrap();
        let b = table.create_own(rep(2)).unwrap();
        table.remove(a).unwrap();
        assert_eq!(table.remove(a), Err(TableError::FreedHandle(a)));
        assert_eq!(table.remove(99), Err(TableError::UnknownHandle(99)));
        assert_eq!(table.remove(0), Err(TableError::UnknownHandle(0)));

        // The free list still has exactly one entry and `b` is untouched.
        assert_eq!(table.get(b).unwrap().rep, rep(2));
        assert_eq!(table.create_own(rep(3)).unwrap(), a);
        assert_eq!(table.create_own(rep(4)).unwrap(), 3);
    }

    #[test]
    fn cap_is_enforced() {
        let mut table = HandleTable::with_max_handle(3);
        table.create_own(rep(1)).unwrap();
        table.create_own(rep(2)).unwrap();
        assert_eq!(table.create_own(rep(3)), Err(TableError::Full));
        table.remove(1).unwrap();
        assert_eq!(table.create_own(rep(3)).unwrap(), 1);
    }

    proptest! {
        #[test]
        fn reallocation_reuses_exactly_the_freed_handles(
            count in 1usize..64,
            freed in proptest::collection::vec(any::<prop::sample::Index>(), 0..64),
        ) {
            let mut table = HandleTable::new();
            let handles = (0..count)
                .map(|i| table.create_own(rep(i as u32)).unwrap())
                .collect::<Vec<_>>();
            let freed = freed
                .iter()
                .map(|i| handles[i.index(count)])
                .collect::<BTreeSet<_>>();
            for h in freed.iter() {
                table.remove(*h).unwrap();
            }
            let reused = (0..freed.len())
                .map(|i| table.create_own(rep(1000 + i as u32)).unwrap())
                .collect::<BTreeSet<_>>();
            prop_assert_eq!(&reused, &freed);
            prop_assert_eq!(table.capacity(), count);
            prop_assert_eq!(table.len(), count);
        }
    }
}
