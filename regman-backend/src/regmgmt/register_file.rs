//! Register state for one method
//!
//! The register file is the single owner of the per-register facets (used,
//! locked, reserved, holding a variable, multi-used, ever modified) and of
//! the value bindings. Policy lives elsewhere: the register manager decides
//! which register to hand out or evict, and asks the register file to record
//! the outcome.
//!
//! ## Safety Invariants
//!
//! - `locked ⊆ used`
//! - a register outside `used` has no primary binding and no aliases
//! - a register is in `multi` iff its alias list is non-empty

use log::trace;
use regman_codegen::{Reg, RegClass, RegMask, Target};
use regman_common::{ice, ice_assert, AddrId, ValueId};
use smallvec::SmallVec;

/// A value that also lives in a register whose primary binding is another value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiUse {
    pub value: ValueId,
    pub addr: Option<AddrId>,
}

/// Aliases of one register, oldest first
pub type AliasList = SmallVec<[MultiUse; 2]>;

#[derive(Debug, Clone)]
pub struct RegisterFile {
    used: RegMask,
    locked: RegMask,
    vars: RegMask,
    reserved: RegMask,
    multi: RegMask,
    modified: RegMask,
    used_value: Vec<Option<ValueId>>,
    used_addr: Vec<Option<AddrId>>,
    aliases: Vec<AliasList>,
}

impl RegisterFile {
    pub fn new(target: &Target) -> Self {
        let size = target.universe_size();
        Self {
            used: RegMask::empty(),
            locked: RegMask::empty(),
            vars: RegMask::empty(),
            reserved: target.reserved(),
            multi: RegMask::empty(),
            modified: RegMask::empty(),
            used_value: vec![None; size],
            used_addr: vec![None; size],
            aliases: vec![AliasList::new(); size],
        }
    }

    /// Clear all per-method state in place
    pub fn reset(&mut self) {
        self.used = RegMask::empty();
        self.locked = RegMask::empty();
        self.vars = RegMask::empty();
        self.multi = RegMask::empty();
        self.modified = RegMask::empty();
        self.used_value.fill(None);
        self.used_addr.fill(None);
        for list in &mut self.aliases {
            list.clear();
        }
    }

    pub fn used(&self) -> RegMask {
        self.used
    }

    pub fn locked(&self) -> RegMask {
        self.locked
    }

    pub fn vars(&self) -> RegMask {
        self.vars
    }

    pub fn reserved(&self) -> RegMask {
        self.reserved
    }

    pub fn multi(&self) -> RegMask {
        self.multi
    }

    pub fn modified(&self) -> RegMask {
        self.modified
    }

    pub fn is_used(&self, reg: Reg) -> bool {
        self.used.contains(reg)
    }

    pub fn is_locked(&self, reg: Reg) -> bool {
        self.locked.contains(reg)
    }

    pub fn holds_var(&self, reg: Reg) -> bool {
        self.vars.contains(reg)
    }

    pub fn is_reserved(&self, reg: Reg) -> bool {
        self.reserved.contains(reg)
    }

    pub fn is_multi_used(&self, reg: Reg) -> bool {
        self.multi.contains(reg)
    }

    pub fn is_free(&self, reg: Reg) -> bool {
        !(self.used | self.vars | self.reserved).contains(reg)
    }

    /// Registers of `class` that are not used, not holding a variable and not reserved
    pub fn free_mask<C: RegClass>(&self, class: RegMask<C>) -> RegMask<C> {
        ice_assert!(
            self.locked.is_subset_of(self.used),
            "locked registers {} are not all in use {}",
            self.locked,
            self.used
        );
        class.exclude(self.used | self.vars | self.reserved)
    }

    /// Registers of `class` the allocator may evict
    pub fn grabbable_mask<C: RegClass>(&self, class: RegMask<C>) -> RegMask<C> {
        ice_assert!(
            self.locked.is_subset_of(self.used),
            "locked registers {} are not all in use {}",
            self.locked,
            self.used
        );
        class.exclude(self.locked | self.vars | self.reserved)
    }

    /// Record the registers that hold long-lived variables
    pub fn set_vars(&mut self, mask: RegMask) {
        ice_assert!(
            !mask.intersects(self.reserved),
            "variables assigned to reserved registers {}",
            mask & self.reserved
        );
        trace!("variable registers {} -> {}", self.vars, mask);
        self.vars = mask;
    }

    pub fn set_modified(&mut self, mask: RegMask) {
        self.modified |= mask;
    }

    pub fn remove_modified(&mut self, mask: RegMask) {
        self.modified -= mask;
    }

    pub fn clear_modified(&mut self) {
        self.modified = RegMask::empty();
    }

    // Locking

    /// Lock registers that are not in use; they become used and locked
    pub fn lock_reg(&mut self, mask: RegMask) {
        ice_assert!(
            !mask.intersects(self.used),
            "lock_reg of registers already in use {}",
            mask & self.used
        );
        ice_assert!(!mask.intersects(self.locked), "lock_reg of locked registers {}", mask & self.locked);
        self.used |= mask;
        self.locked |= mask;
    }

    /// Lock registers that are in use and not yet locked
    pub fn lock_used_reg(&mut self, mask: RegMask) {
        ice_assert!(
            !mask.intersects(self.locked),
            "lock_used_reg of locked registers {}",
            mask & self.locked
        );
        ice_assert!(
            mask.is_subset_of(self.used),
            "lock_used_reg of registers not in use {}",
            mask - self.used
        );
        self.locked |= mask;
    }

    /// Undo `lock_reg`: the registers become free again
    pub fn unlock_reg(&mut self, mask: RegMask) {
        ice_assert!(mask.is_subset_of(self.used), "unlock_reg of registers not in use {}", mask - self.used);
        ice_assert!(
            mask.is_subset_of(self.locked),
            "unlock_reg of registers not locked {}",
            mask - self.locked
        );
        self.used -= mask;
        self.locked -= mask;
    }

    /// Undo `lock_used_reg`: the registers stay in use
    pub fn unlock_used_reg(&mut self, mask: RegMask) {
        ice_assert!(
            mask.is_subset_of(self.used),
            "unlock_used_reg of registers not in use {}",
            mask - self.used
        );
        ice_assert!(
            mask.is_subset_of(self.locked),
            "unlock_used_reg of registers not locked {}",
            mask - self.locked
        );
        self.locked -= mask;
    }

    /// Lock every register in `mask`, returning the ones that were already in use
    pub fn lock(&mut self, mask: RegMask) -> RegMask {
        let was_used = mask & self.used;
        let unused = mask - was_used;
        if !was_used.is_empty() {
            self.lock_used_reg(was_used);
        }
        if !unused.is_empty() {
            self.lock_reg(unused);
        }
        was_used
    }

    /// Undo `lock(mask)`, given the mask it returned
    pub fn unlock(&mut self, mask: RegMask, was_used: RegMask) {
        ice_assert!(
            was_used.is_subset_of(mask),
            "unlock with stale used mask {} for {}",
            was_used,
            mask
        );
        let unused = mask - was_used;
        if !was_used.is_empty() {
            self.unlock_used_reg(was_used);
        }
        if !unused.is_empty() {
            self.unlock_reg(unused);
        }
    }

    // Bindings

    pub fn primary(&self, reg: Reg) -> Option<ValueId> {
        self.used_value[reg.index()]
    }

    pub fn addr(&self, reg: Reg) -> Option<AddrId> {
        self.used_addr[reg.index()]
    }

    pub fn aliases(&self, reg: Reg) -> &[MultiUse] {
        &self.aliases[reg.index()]
    }

    /// `value` is the primary or one of the aliases of `reg`
    pub fn is_value_in_reg(&self, reg: Reg, value: ValueId) -> bool {
        self.primary(reg) == Some(value)
            || (self.is_multi_used(reg) && self.aliases(reg).iter().any(|a| a.value == value))
    }

    /// Make `value` the primary occupant of `reg`, which must have none
    pub fn bind(&mut self, reg: Reg, value: ValueId, addr: Option<AddrId>) {
        let i = reg.index();
        if let Some(old) = self.used_value[i] {
            ice!("{} bound to {} which still holds {}", value, reg, old);
        }
        self.used.insert(reg);
        self.used_value[i] = Some(value);
        self.used_addr[i] = addr;
    }

    /// Drop the primary binding of `reg` without touching the used bit
    pub fn unbind(&mut self, reg: Reg) -> Option<ValueId> {
        let i = reg.index();
        self.used_addr[i] = None;
        self.used_value[i].take()
    }

    /// Clear the used bit of registers whose bindings are gone
    pub fn release(&mut self, mask: RegMask) {
        ice_assert!(mask.is_subset_of(self.used), "free of registers not in use {}", mask - self.used);
        self.used -= mask;
        ice_assert!(
            self.locked.is_subset_of(self.used),
            "freed locked registers {}",
            self.locked - self.used
        );
    }

    /// Demote the primary occupant of `reg` to an alias, making room for a new primary
    pub fn push_alias(&mut self, reg: Reg) {
        ice_assert!(self.is_used(reg), "alias recorded on unused register {}", reg);
        let i = reg.index();
        let value = match self.used_value[i].take() {
            Some(value) => value,
            None => ice!("alias recorded on {} which has no primary value", reg),
        };
        let addr = self.used_addr[i].take();
        trace!("{} becomes an alias on {}", value, reg);
        self.aliases[i].push(MultiUse { value, addr });
        self.multi.insert(reg);
    }

    /// Replace the primary of `reg` with its most recent alias
    pub fn pop_alias(&mut self, reg: Reg) -> MultiUse {
        ice_assert!(self.is_multi_used(reg), "alias popped from {} which has none", reg);
        let i = reg.index();
        let alias = match self.aliases[i].pop() {
            Some(alias) => alias,
            None => ice!("multi-use register {} has an empty alias list", reg),
        };
        if self.aliases[i].is_empty() {
            self.multi.remove(reg);
        }
        self.used_value[i] = Some(alias.value);
        self.used_addr[i] = alias.addr;
        trace!("{} is now primary on {}", alias.value, reg);
        alias
    }

    /// Remove a non-primary `value` from the aliases of `reg`
    pub fn remove_alias(&mut self, reg: Reg, value: ValueId) {
        let i = reg.index();
        match self.aliases[i].iter().position(|a| a.value == value) {
            Some(pos) => {
                self.aliases[i].remove(pos);
            }
            None => ice!("{} is not an alias on {}", value, reg),
        }
        if self.aliases[i].is_empty() {
            self.multi.remove(reg);
        }
    }

    /// Take every alias of `reg`, leaving it single-use
    pub fn take_aliases(&mut self, reg: Reg) -> AliasList {
        self.multi.remove(reg);
        std::mem::take(&mut self.aliases[reg.index()])
    }

    /// Give `reg` an alias group, as when a multi-use value is reloaded
    pub fn install_aliases(&mut self, reg: Reg, aliases: AliasList) {
        ice_assert!(!aliases.is_empty(), "empty alias group installed on {}", reg);
        ice_assert!(!self.is_multi_used(reg), "alias group installed on multi-use {}", reg);
        self.aliases[reg.index()] = aliases;
        self.multi.insert(reg);
    }

    /// Describe every broken invariant; empty when consistent
    pub fn check(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.locked.is_subset_of(self.used) {
            problems.push(format!("locked {} not in use", self.locked - self.used));
        }
        if !self.multi.is_subset_of(self.used) {
            problems.push(format!("multi-use {} not in use", self.multi - self.used));
        }
        for (i, value) in self.used_value.iter().enumerate() {
            let reg = Reg::new(i as u8);
            if let Some(value) = value {
                if !self.is_used(reg) {
                    problems.push(format!("{} bound to unused {}", value, reg));
                }
            }
            if self.aliases[i].is_empty() == self.is_multi_used(reg) {
                problems.push(format!("alias list of {} disagrees with multi-use set", reg));
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn setup() -> (Target, RegisterFile) {
        let target = Target::x86();
        let regs = RegisterFile::new(&target);
        (target, regs)
    }

    fn reg(target: &Target, name: &str) -> Reg {
        target.reg(name).unwrap()
    }

    #[test]
    fn test_initial_free_mask_excludes_reserved() {
        let (target, regs) = setup();
        let free = regs.free_mask(target.int_regs());
        assert!(!free.contains(target.stack_pointer()));
        assert_eq!(free.count(), 7);
    }

    #[test]
    fn test_lock_round_trip_preserves_used_state() {
        let (target, mut regs) = setup();
        let eax = reg(&target, "eax");
        let ecx = reg(&target, "ecx");
        regs.bind(eax, ValueId(1), None);

        let mask = eax.mask() | ecx.mask();
        let was_used = regs.lock(mask);
        assert_eq!(was_used, eax.mask());
        assert_eq!(regs.locked(), mask);
        assert!(regs.is_used(ecx));

        regs.unlock(mask, was_used);
        assert!(regs.locked().is_empty());
        assert!(regs.is_used(eax));
        assert!(!regs.is_used(ecx));
    }

    #[test]
    #[should_panic(expected = "lock_reg of registers already in use")]
    fn test_lock_reg_requires_unused() {
        let (target, mut regs) = setup();
        let eax = reg(&target, "eax");
        regs.bind(eax, ValueId(1), None);
        regs.lock_reg(eax.mask());
    }

    #[test]
    #[should_panic(expected = "lock_used_reg of locked registers")]
    fn test_double_lock_is_fatal() {
        let (target, mut regs) = setup();
        let eax = reg(&target, "eax");
        regs.bind(eax, ValueId(1), None);
        regs.lock_used_reg(eax.mask());
        regs.lock_used_reg(eax.mask());
    }

    #[test]
    fn test_alias_push_and_pop() {
        let (target, mut regs) = setup();
        let eax = reg(&target, "eax");
        regs.bind(eax, ValueId(1), None);
        regs.push_alias(eax);
        regs.bind(eax, ValueId(2), Some(AddrId(7)));

        assert!(regs.is_multi_used(eax));
        assert!(regs.is_value_in_reg(eax, ValueId(1)));
        assert!(regs.is_value_in_reg(eax, ValueId(2)));

        let popped = regs.pop_alias(eax);
        assert_eq!(popped, MultiUse { value: ValueId(1), addr: None });
        assert_eq!(regs.primary(eax), Some(ValueId(1)));
        assert!(!regs.is_multi_used(eax));
        assert!(regs.check().is_empty());
    }

    #[test]
    fn test_grabbable_excludes_locked_and_vars() {
        let (target, mut regs) = setup();
        let eax = reg(&target, "eax");
        let esi = reg(&target, "esi");
        regs.bind(eax, ValueId(1), None);
        regs.lock_used_reg(eax.mask());
        regs.set_vars(esi.mask());

        let grabbable = regs.grabbable_mask(target.int_regs());
        assert!(!grabbable.contains(eax));
        assert!(!grabbable.contains(esi));
        assert!(!regs.free_mask(target.int_regs()).contains(esi));
    }

    #[test]
    #[should_panic(expected = "freed locked registers")]
    fn test_freeing_locked_register_is_fatal() {
        let (target, mut regs) = setup();
        let eax = reg(&target, "eax");
        regs.bind(eax, ValueId(1), None);
        regs.lock_used_reg(eax.mask());
        regs.unbind(eax);
        regs.release(eax.mask());
    }
}
