//! Reference registry.
//!
//! Anchors engine objects that host proxies point at. Each slot owns one
//! engine registry reference and a count of the proxies sharing it; the
//! anchor is released when the count reaches zero. Slots are kept in a
//! slab with a free list and addressed by generation-checked [`SlotId`]s,
//! so a stale id can never reach a reused slot.
//!
//! The registry never calls into the engine. Anchoring and fetching go
//! through [`Context`](crate::state::Context), which creates the engine
//! reference first and then records it here.

use mlua::RegistryKey;
use std::collections::HashMap;

/// Generation-checked slot address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotId {
    index: u32,
    generation: u32,
}

/// Kind of engine object a slot anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectKind {
    Table,
    Function,
    Coroutine,
    UserData,
}

/// One anchored engine object.
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) key: RegistryKey,
    pub(crate) kind: ObjectKind,
    /// Coroutines only: whether the thread was anchored after it could
    /// already have run.
    pub(crate) started: bool,
    ptr: usize,
    refs: usize,
}

#[derive(Debug)]
enum Slot {
    Occupied { generation: u32, entry: Entry },
    Vacant { generation: u32 },
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Identity pointer to slot, for de-duplication.
    index: HashMap<usize, SlotId>,
    live: usize,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of occupied slots.
    pub(crate) fn live(&self) -> usize {
        self.live
    }

    /// Bumps the count of the slot already anchoring `ptr`, if any.
    pub(crate) fn retain_existing(&mut self, ptr: usize) -> Option<SlotId> {
        if ptr == 0 {
            return None;
        }
        let slot = *self.index.get(&ptr)?;
        let entry = self.get_mut(slot)?;
        entry.refs += 1;
        tracing::trace!(?slot, refs = entry.refs, "registry: retain");
        Some(slot)
    }

    /// Records a freshly created engine reference with a count of one.
    ///
    /// A null `ptr` is never indexed, so such objects always get their
    /// own slot.
    pub(crate) fn insert(
        &mut self,
        key: RegistryKey,
        ptr: usize,
        kind: ObjectKind,
        started: bool,
    ) -> SlotId {
        let entry = Entry {
            key,
            kind,
            started,
            ptr,
            refs: 1,
        };
        let slot = match self.free.pop() {
            Some(index) => {
                let at = index as usize;
                let generation = match &self.slots[at] {
                    Slot::Vacant { generation } => generation.wrapping_add(1),
                    Slot::Occupied { generation, .. } => generation.wrapping_add(1),
                };
                self.slots[at] = Slot::Occupied { generation, entry };
                SlotId { index, generation }
            }
            None => {
                let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
                self.slots.push(Slot::Occupied {
                    generation: 0,
                    entry,
                });
                SlotId {
                    index,
                    generation: 0,
                }
            }
        };
        if ptr != 0 {
            self.index.insert(ptr, slot);
        }
        self.live += 1;
        tracing::trace!(?slot, ?kind, live = self.live, "registry: anchor");
        self.check_invariants();
        slot
    }

    pub(crate) fn get(&self, slot: SlotId) -> Option<&Entry> {
        match self.slots.get(slot.index as usize)? {
            Slot::Occupied { generation, entry } if *generation == slot.generation => Some(entry),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, slot: SlotId) -> Option<&mut Entry> {
        match self.slots.get_mut(slot.index as usize)? {
            Slot::Occupied { generation, entry } if *generation == slot.generation => Some(entry),
            _ => None,
        }
    }

    /// Decrements the count of `slot`.
    ///
    /// Returns the engine reference once the last holder is gone; dropping
    /// the returned key releases the anchor.
    pub(crate) fn release(&mut self, slot: SlotId) -> Option<RegistryKey> {
        let entry = self.get_mut(slot)?;
        entry.refs -= 1;
        if entry.refs > 0 {
            tracing::trace!(?slot, refs = entry.refs, "registry: release");
            return None;
        }

        let at = slot.index as usize;
        let vacant = Slot::Vacant {
            generation: slot.generation,
        };
        let Slot::Occupied { entry, .. } = std::mem::replace(&mut self.slots[at], vacant) else {
            return None;
        };
        if entry.ptr != 0 && self.index.get(&entry.ptr) == Some(&slot) {
            self.index.remove(&entry.ptr);
        }
        self.free.push(slot.index);
        self.live -= 1;
        tracing::trace!(?slot, kind = ?entry.kind, live = self.live, "registry: unanchor");
        self.check_invariants();
        Some(entry.key)
    }

    #[cfg(feature = "consistency-checks")]
    fn check_invariants(&self) {
        let occupied = self
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Occupied { .. }))
            .count();
        assert_eq!(occupied, self.live, "registry live count drifted");
        assert_eq!(
            occupied + self.free.len(),
            self.slots.len(),
            "registry free list drifted"
        );
        for (ptr, slot) in &self.index {
            let entry = self.get(*slot);
            assert!(
                entry.is_some_and(|e| e.ptr == *ptr && e.refs > 0),
                "registry index points at a dead slot"
            );
        }
    }

    #[cfg(not(feature = "consistency-checks"))]
    #[inline]
    fn check_invariants(&self) {}
}
