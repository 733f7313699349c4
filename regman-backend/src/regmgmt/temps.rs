//! Spill temp pool
//!
//! Temps are stack slots the register manager spills into. They are bucketed
//! by size class and recycled for the rest of the method: a released temp goes
//! back on its class's free list and is handed out again to the next request
//! of the same kind. The spill area only ever grows, and its high-water mark
//! is what the frame layout reserves.

use log::{debug, trace};
use regman_codegen::Target;
use regman_common::{ice, ice_assert, TempId, TempKind};

/// Largest temp size handed out, in bytes
pub const TEMP_MAX_SIZE: u32 = 8;

const TEMP_SLOT_COUNT: usize = (TEMP_MAX_SIZE / 4) as usize;

fn slot_index(size: u32) -> usize {
    ice_assert!(
        size >= 4 && size <= TEMP_MAX_SIZE && size % 4 == 0,
        "no temp size class for {} bytes",
        size
    );
    (size / 4 - 1) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempSlot {
    pub id: TempId,
    pub size: u32,
    pub kind: TempKind,
}

/// Which list to walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempUsage {
    Free,
    Used,
}

#[derive(Debug, Clone)]
pub struct TempPool {
    pointer_size: u32,
    align_doubles: bool,
    /// Every temp ever created this method; `TempId(n)` lives at index `n - 1`
    slots: Vec<TempSlot>,
    /// Per size class, most recently released last
    free: [Vec<TempId>; TEMP_SLOT_COUNT],
    used: [Vec<TempId>; TEMP_SLOT_COUNT],
    frame_size: u32,
    gets: u64,
    releases: u64,
}

impl TempPool {
    pub fn new(target: &Target) -> Self {
        Self {
            pointer_size: target.pointer_size(),
            align_doubles: target.align_double_temps(),
            slots: Vec::new(),
            free: Default::default(),
            used: Default::default(),
            frame_size: 0,
            gets: 0,
            releases: 0,
        }
    }

    /// Forget every temp; the next method starts with an empty spill area
    pub fn reset(&mut self) {
        self.slots.clear();
        for list in self.free.iter_mut().chain(self.used.iter_mut()) {
            list.clear();
        }
        self.frame_size = 0;
        self.gets = 0;
        self.releases = 0;
    }

    fn create(&mut self, kind: TempKind) -> TempId {
        let size = kind.size(self.pointer_size);
        let id = TempId(self.slots.len() as u32 + 1);
        self.frame_size += size;
        if self.align_doubles && kind == TempKind::Float64 {
            self.frame_size += self.pointer_size;
        }
        self.slots.push(TempSlot { id, size, kind });
        id
    }

    /// Get a temp of `kind`, reusing a free one of the same kind when possible
    pub fn get(&mut self, kind: TempKind) -> TempId {
        let size = kind.size(self.pointer_size);
        let slot = slot_index(size);

        let reused = self.free[slot]
            .iter()
            .rposition(|&id| self.slots[id.0 as usize - 1].kind == kind)
            .map(|pos| self.free[slot].remove(pos));

        let id = match reused {
            Some(id) => {
                trace!("reused temp {}, slot {}, size = {}", id, slot, size);
                id
            }
            None => {
                let id = self.create(kind);
                debug!(
                    "created temp {} ({}), slot {}, spill area now {} bytes",
                    id, kind, slot, self.frame_size
                );
                id
            }
        };

        self.gets += 1;
        self.used[slot].push(id);
        id
    }

    /// Return a temp to its free list
    pub fn release(&mut self, id: TempId) {
        let size = self.slot(id).size;
        let slot = slot_index(size);

        match self.used[slot].iter().position(|&t| t == id) {
            Some(pos) => {
                self.used[slot].remove(pos);
            }
            None => ice!("release of temp {} which is not in use", id),
        }
        trace!("release temp {}, slot {}, size = {}", id, slot, size);

        self.releases += 1;
        self.free[slot].push(id);
    }

    /// Create `count` temps of `kind` up front, directly on the free list
    pub fn preallocate(&mut self, kind: TempKind, count: usize) {
        let slot = slot_index(kind.size(self.pointer_size));
        for _ in 0..count {
            let id = self.create(kind);
            debug!("pre-allocated temp {}, slot {}", id, slot);
            self.free[slot].push(id);
        }
    }

    pub fn slot(&self, id: TempId) -> &TempSlot {
        match (id.0 as usize).checked_sub(1).and_then(|i| self.slots.get(i)) {
            Some(slot) => slot,
            None => ice!("unknown temp {}", id),
        }
    }

    /// Temps on one list, smallest size class first, most recent first
    pub fn iter(&self, usage: TempUsage) -> impl Iterator<Item = &TempSlot> + '_ {
        let lists = match usage {
            TempUsage::Free => &self.free,
            TempUsage::Used => &self.used,
        };
        lists
            .iter()
            .flat_map(|list| list.iter().rev())
            .map(move |&id| &self.slots[id.0 as usize - 1])
    }

    pub fn find(&self, id: TempId, usage: TempUsage) -> Option<&TempSlot> {
        self.iter(usage).find(|slot| slot.id == id)
    }

    /// Number of temps created this method
    pub fn count(&self) -> usize {
        self.slots.len()
    }

    /// Spill area high-water mark in bytes
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn outstanding(&self) -> usize {
        self.used.iter().map(Vec::len).sum()
    }

    pub fn gets(&self) -> u64 {
        self.gets
    }

    pub fn releases(&self) -> u64 {
        self.releases
    }

    /// Every temp has been released
    pub fn all_free(&self) -> bool {
        self.outstanding() == 0 && self.gets == self.releases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_get_release_reuses_slot() {
        let mut pool = TempPool::new(&Target::x86());

        let first = pool.get(TempKind::Int32);
        assert_eq!(first, TempId(1));
        assert_eq!(pool.frame_size(), 4);

        pool.release(first);
        let again = pool.get(TempKind::Int32);
        assert_eq!(again, TempId(1));
        assert_eq!(pool.frame_size(), 4);
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn test_kinds_of_same_size_are_not_mixed() {
        let mut pool = TempPool::new(&Target::x86());

        let int_temp = pool.get(TempKind::Int32);
        pool.release(int_temp);

        // A GC reference must not land in a slot that held a plain integer
        let ref_temp = pool.get(TempKind::Ref);
        assert_eq!(ref_temp, TempId(2));
        assert_eq!(pool.frame_size(), 8);
    }

    #[test]
    fn test_most_recently_released_is_reused_first() {
        let mut pool = TempPool::new(&Target::x86());
        let a = pool.get(TempKind::Int32);
        let b = pool.get(TempKind::Int32);
        pool.release(a);
        pool.release(b);

        assert_eq!(pool.get(TempKind::Int32), b);
        assert_eq!(pool.get(TempKind::Int32), a);
    }

    #[test]
    fn test_outstanding_counts() {
        let mut pool = TempPool::new(&Target::x86());
        let a = pool.get(TempKind::Int32);
        let b = pool.get(TempKind::Float64);
        assert_eq!(pool.outstanding(), 2);
        assert!(!pool.all_free());

        pool.release(b);
        pool.release(a);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.gets(), 2);
        assert_eq!(pool.releases(), 2);
        assert!(pool.all_free());
    }

    #[test]
    fn test_double_alignment_padding() {
        let mut x86 = TempPool::new(&Target::x86());
        x86.get(TempKind::Float64);
        assert_eq!(x86.frame_size(), 8);

        let mut arm = TempPool::new(&Target::arm32());
        let id = arm.get(TempKind::Float64);
        assert_eq!(arm.frame_size(), 12);
        assert_eq!(arm.slot(id).size, 8);
    }

    #[test]
    fn test_preallocate_fills_free_list() {
        let mut pool = TempPool::new(&Target::x86());
        pool.preallocate(TempKind::Int32, 2);
        assert_eq!(pool.frame_size(), 8);
        assert_eq!(pool.iter(TempUsage::Free).count(), 2);

        let id = pool.get(TempKind::Int32);
        assert_eq!(pool.frame_size(), 8);
        assert!(pool.find(id, TempUsage::Used).is_some());
        assert!(pool.find(id, TempUsage::Free).is_none());
    }

    #[test]
    fn test_reset_forgets_temps() {
        let mut pool = TempPool::new(&Target::x86());
        pool.get(TempKind::Int32);
        pool.reset();
        assert_eq!(pool.count(), 0);
        assert_eq!(pool.frame_size(), 0);
        assert!(pool.all_free());
    }

    #[test]
    #[should_panic(expected = "not in use")]
    fn test_double_release_is_fatal() {
        let mut pool = TempPool::new(&Target::x86());
        let id = pool.get(TempKind::Int32);
        pool.release(id);
        pool.release(id);
    }
}
