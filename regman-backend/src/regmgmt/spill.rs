//! Spilling and reloading
//!
//! When a register must be taken from its occupant, the occupant is stored
//! into a temp and a spill record remembers where it went. Records are kept
//! per source register, newest first, so that a value spilled twice from the
//! same register is found in the order it went out.
//!
//! A multi-used register spills as a group: the primary value first, then
//! its aliases, all sharing one temp. `more_multis` on a record says the
//! next record belongs to the same group. The temp goes back to the pool
//! only when the last record pointing at it is reloaded.
//!
//! Records live in an arena indexed by position; the per-register lists and
//! the free list are chains of indices into it.

use super::manager::RegisterManager;
use super::register_file::{AliasList, MultiUse};
use super::tracker::RegContent;
use log::{debug, trace};
use regman_codegen::{AllocClass, CodegenHooks, Gpr, Reg, RegMask, RegPair};
use regman_common::{ice, ice_assert, AddrId, TempId, TempKind, ValueId};

/// Spilled operands one addressing mode can have
const MAX_ADDR_SPILLS: u8 = 2;

/// Whether a reloaded value stays bound to its new register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepReg {
    Keep,
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillRecord {
    pub value: ValueId,
    pub temp: TempId,
    pub addr: Option<AddrId>,
    /// The next record in the list belongs to the same alias group
    pub more_multis: bool,
    /// Constant the register was known to hold when it went out
    pub constant: Option<i64>,
    next: Option<usize>,
}

impl SpillRecord {
    fn new(value: ValueId, temp: TempId, addr: Option<AddrId>, constant: Option<i64>) -> Self {
        Self {
            value,
            temp,
            addr,
            more_multis: false,
            constant,
            next: None,
        }
    }
}

/// Where a record sits in its register's list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Found {
    dsc: usize,
    prev: Option<usize>,
    /// First record of the alias group containing `dsc`
    group: usize,
}

/// Spill records of one method, listed per source register
#[derive(Debug, Clone)]
pub struct SpillTable {
    records: Vec<SpillRecord>,
    free: Vec<usize>,
    heads: Vec<Option<usize>>,
}

impl SpillTable {
    pub fn new(universe_size: usize) -> Self {
        Self {
            records: Vec::new(),
            free: Vec::new(),
            heads: vec![None; universe_size],
        }
    }

    pub fn reset(&mut self) {
        self.records.clear();
        self.free.clear();
        self.heads.fill(None);
    }

    fn alloc(&mut self, record: SpillRecord) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.records[index] = record;
                index
            }
            None => {
                self.records.push(record);
                self.records.len() - 1
            }
        }
    }

    fn rec(&self, index: usize) -> &SpillRecord {
        &self.records[index]
    }

    /// Put a group at the front of `reg`'s list, keeping its order
    fn push_group(&mut self, reg: Reg, group: &[SpillRecord]) {
        let mut next = self.heads[reg.index()];
        for record in group.iter().rev() {
            let index = self.alloc(SpillRecord { next, ..*record });
            next = Some(index);
        }
        self.heads[reg.index()] = next;
    }

    /// Pending records spilled from `reg`, newest first
    pub fn records(&self, reg: Reg) -> impl Iterator<Item = &SpillRecord> + '_ {
        let mut cursor = self.heads[reg.index()];
        std::iter::from_fn(move || {
            let index = cursor?;
            let record = &self.records[index];
            cursor = record.next;
            Some(record)
        })
    }

    fn find(&self, reg: Reg, value: ValueId) -> Option<Found> {
        let mut prev = None;
        let mut group = None;
        let mut cursor = self.heads[reg.index()];
        while let Some(index) = cursor {
            let record = self.rec(index);
            let starts_group = match prev {
                None => true,
                Some(p) => !self.rec(p).more_multis,
            };
            if starts_group {
                group = Some(index);
            }
            if record.value == value {
                return Some(Found {
                    dsc: index,
                    prev,
                    group: group.unwrap_or(index),
                });
            }
            prev = Some(index);
            cursor = record.next;
        }
        None
    }

    /// Unlink a record, returning its contents
    fn take(&mut self, reg: Reg, dsc: usize, prev: Option<usize>) -> SpillRecord {
        let record = self.records[dsc];
        match prev {
            None => self.heads[reg.index()] = record.next,
            Some(p) => {
                self.records[p].next = record.next;
                if self.records[p].more_multis && !record.more_multis {
                    self.records[p].more_multis = false;
                }
            }
        }
        self.free.push(dsc);
        record
    }

    /// Unlink the group whose first record is `start`
    fn take_group(&mut self, reg: Reg, start: usize) -> Vec<SpillRecord> {
        let mut prev = None;
        let mut cursor = self.heads[reg.index()];
        while let Some(index) = cursor {
            if index == start {
                break;
            }
            prev = Some(index);
            cursor = self.rec(index).next;
        }
        ice_assert!(cursor == Some(start), "spill group is not listed under {}", reg);

        let mut group = Vec::new();
        let mut cursor = Some(start);
        while let Some(index) = cursor {
            let more = self.rec(index).more_multis;
            cursor = self.rec(index).next;
            group.push(self.take(reg, index, prev));
            if !more {
                break;
            }
        }
        group
    }

    /// The register `value` was spilled from
    pub fn spilled_from(&self, value: ValueId) -> Option<Reg> {
        (0..self.heads.len())
            .map(|i| Reg::new(i as u8))
            .find(|&reg| self.records(reg).any(|r| r.value == value))
    }

    pub fn is_spilled(&self, value: ValueId) -> bool {
        self.spilled_from(value).is_some()
    }

    /// Some pending record still lives in `temp`
    pub fn references_temp(&self, temp: TempId) -> bool {
        (0..self.heads.len())
            .map(|i| Reg::new(i as u8))
            .any(|reg| self.records(reg).any(|r| r.temp == temp))
    }

    pub fn pending(&self) -> usize {
        self.records.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }
}

impl<H: CodegenHooks> RegisterManager<H> {
    /// Store the occupants of `reg` to a fresh temp and free the register.
    /// Aliases of a multi-used register go out with the primary value.
    pub fn spill_reg(&mut self, reg: Reg) {
        let value = match self.regs.primary(reg) {
            Some(value) => value,
            None => ice!("spill of {} which holds no value", self.name(reg)),
        };
        ice_assert!(!self.regs.is_locked(reg), "spill of locked {}", self.name(reg));
        ice_assert!(!self.regs.holds_var(reg), "spill of variable register {}", self.name(reg));

        let ty = self.hooks.value_type(value);
        let kind = TempKind::normalize(ty, self.target.long_uses_reg_pair());
        let temp = self.get_temp(kind);
        let constant = match self.tracker.content(reg) {
            RegContent::IntConstant(c) => Some(c),
            _ => None,
        };

        let addr = self.regs.addr(reg);
        self.addr_spill_oper(addr);

        let mut primary = SpillRecord::new(value, temp, addr, constant);
        primary.more_multis = self.regs.is_multi_used(reg);
        let mut group = vec![primary];
        if primary.more_multis {
            let aliases = self.regs.take_aliases(reg);
            let n = aliases.len();
            for (i, alias) in aliases.iter().rev().enumerate() {
                self.addr_spill_oper(alias.addr);
                let mut record = SpillRecord::new(alias.value, temp, alias.addr, constant);
                record.more_multis = i + 1 < n;
                group.push(record);
            }
        }

        debug!(
            "Spill {} from {} to {} ({} values)",
            value,
            self.name(reg),
            temp,
            group.len()
        );
        self.spills.push_group(reg, &group);
        self.hooks.spill_reg(kind.storage_type(), temp, reg);

        // aliases are already detached, so only the primary binding remains
        self.free_regs(reg.mask());
    }

    /// Spill `value`, which must be held in `reg`
    pub fn spill(&mut self, reg: Reg, value: ValueId) {
        let ty = self.hooks.value_type(value);
        if !self.is_pair_type(ty) {
            ice_assert!(!self.spills.is_spilled(value), "{} is already spilled", value);
        }
        ice_assert!(
            self.regs.is_value_in_reg(reg, value),
            "{} is not held in {}",
            value,
            self.name(reg)
        );
        self.spill_reg(reg);
    }

    /// Spill `reg` if anything lives in it
    pub fn spill_reg_if_used(&mut self, reg: Reg) {
        if self.regs.is_used(reg) {
            self.spill_reg(reg);
        }
    }

    /// Spill every used register of `mask`, as before a call
    pub fn spill_regs(&mut self, mask: RegMask) {
        ice_assert!(
            !mask.intersects(self.regs.locked()),
            "spill of locked registers {}",
            self.target.fmt_mask(mask & self.regs.locked())
        );
        ice_assert!(
            !mask.intersects(self.regs.vars()),
            "spill of variable registers {}",
            self.target.fmt_mask(mask & self.regs.vars())
        );
        let mut pending = mask & self.regs.used();
        ice_assert!(!pending.is_empty(), "spill_regs of {} with nothing in use", self.target.fmt_mask(mask));
        while let Some(reg) = pending.lowest() {
            pending.remove(reg);
            if self.regs.is_used(reg) {
                self.spill_reg(reg);
            }
        }
    }

    /// `value` has a pending spill record
    pub fn is_spilled(&self, value: ValueId) -> bool {
        self.spills.is_spilled(value)
    }

    /// Operands of `addr` currently spilled
    pub fn spilled_operands(&self, addr: AddrId) -> u8 {
        self.addr_spills.get(&addr).copied().unwrap_or(0)
    }

    fn addr_spill_oper(&mut self, addr: Option<AddrId>) {
        if let Some(addr) = addr {
            let count = self.addr_spills.entry(addr).or_insert(0);
            ice_assert!(*count < MAX_ADDR_SPILLS, "{} has too many spilled operands", addr);
            *count += 1;
            trace!("{} now has {} spilled operands", addr, count);
        }
    }

    fn addr_unspill_oper(&mut self, addr: Option<AddrId>) {
        if let Some(addr) = addr {
            match self.addr_spills.get_mut(&addr) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    self.addr_spills.remove(&addr);
                }
                None => ice!("{} has no spilled operands", addr),
            }
        }
    }

    fn find_spill(&self, value: ValueId) -> (Reg, Option<AddrId>) {
        let reg = match self.spills.spilled_from(value) {
            Some(reg) => reg,
            None => ice!("{} is not spilled", value),
        };
        let addr = self
            .spills
            .records(reg)
            .find(|r| r.value == value)
            .and_then(|r| r.addr);
        (reg, addr)
    }

    /// Bring a spilled value back into a register of `need` (any register
    /// of the class when `need` is empty).
    pub fn reload<C: AllocClass>(&mut self, value: ValueId, need: RegMask<C>, keep: KeepReg) -> Reg {
        let (old, addr) = self.find_spill(value);
        let reg = self.reload_one(value, old, need, keep);
        self.addr_unspill_oper(addr);
        if keep == KeepReg::Keep {
            self.mark_used(value, reg, addr);
        }
        reg
    }

    /// Reload `value` spilled from `old`, leaving the binding to the caller
    pub(super) fn reload_one<C: AllocClass>(
        &mut self,
        value: ValueId,
        old: Reg,
        need: RegMask<C>,
        keep: KeepReg,
    ) -> Reg {
        let found = match self.spills.find(old, value) {
            Some(found) => found,
            None => ice!("{} was not spilled from {}", value, self.name(old)),
        };
        let mut group = found.group;
        let multi_used = self.spills.rec(group).more_multis;
        if group == found.dsc {
            group = self.spills.rec(found.dsc).next.unwrap_or(group);
        }
        let record = self.spills.take(old, found.dsc, found.prev);

        let ty = self.hooks.value_type(value);
        let kind = TempKind::normalize(ty, self.target.long_uses_reg_pair());

        let allocatable = self.allocatable::<C>();
        let prefer_old = (need.is_empty() || need.widen().contains(old))
            && allocatable.widen().contains(old)
            && self.regs.is_free(old);
        let new = if prefer_old {
            self.regs.set_modified(old.mask());
            old
        } else {
            self.grab(need.or_if_empty(allocatable))
        };
        ice_assert!(
            ty.is_float() == self.target.is_float(new),
            "{} ({}) reloaded into the {} class",
            value,
            ty,
            C::NAME
        );

        match record.constant {
            Some(c) if self.target.int_regs().contains(new) => {
                self.tracker.note_constant(&mut self.regs, new, c)
            }
            _ => self.tracker.trash(&mut self.regs, new),
        }

        debug!("Reload {} from {} into {}", value, record.temp, self.name(new));
        self.hooks.reload_reg(kind.storage_type(), record.temp, new);

        if multi_used && keep == KeepReg::Keep {
            self.restore_aliases(old, new, group);
        }
        self.release_temp(record.temp);
        new
    }

    /// Move the rest of a reloaded group back onto its register as aliases.
    /// The group stays pending when the value came back in a different
    /// register, or when a member sits inside an addressing mode or has a
    /// pair type; those values are reloaded one by one.
    fn restore_aliases(&mut self, old: Reg, new: Reg, group: usize) {
        if old != new {
            trace!(
                "alias group of {} stays spilled, reloaded into {}",
                self.name(old),
                self.name(new)
            );
            return;
        }
        let mut cursor = Some(group);
        while let Some(index) = cursor {
            let record = self.spills.rec(index);
            if record.addr.is_some() || self.is_pair_type(self.hooks.value_type(record.value)) {
                trace!("alias group of {} stays spilled", self.name(old));
                return;
            }
            cursor = if record.more_multis { record.next } else { None };
        }

        let records = self.spills.take_group(old, group);
        let aliases: AliasList = records
            .iter()
            .rev()
            .map(|r| MultiUse {
                value: r.value,
                addr: r.addr,
            })
            .collect();
        trace!("{} aliases restored on {}", aliases.len(), self.name(new));
        self.regs.install_aliases(new, aliases);
    }

    /// Drop the spill record of `value` because it is used straight from
    /// its temp. The caller hands the temp back with `release_temp` when done.
    pub fn unspill_in_place(&mut self, value: ValueId) -> TempId {
        let (old, _) = self.find_spill(value);
        let found = match self.spills.find(old, value) {
            Some(found) => found,
            None => ice!("{} was not spilled from {}", value, self.name(old)),
        };
        let record = self.spills.take(old, found.dsc, found.prev);
        self.addr_unspill_oper(record.addr);
        debug!("{} used in place from {}", value, record.temp);
        record.temp
    }

    /// Reload a 64-bit value split over `old`, keeping either half that is
    /// still in its register.
    pub fn reload_pair(
        &mut self,
        value: ValueId,
        old: RegPair,
        need: RegMask<Gpr>,
        keep: KeepReg,
    ) -> RegPair {
        let (old_lo, old_hi) = (old.lo(), old.hi());
        let lo_resident = self.regs.is_value_in_reg(old_lo, value);
        let hi_resident = self.regs.is_value_in_reg(old_hi, value);

        let lo = if !lo_resident {
            if hi_resident {
                self.regs.lock_used_reg(old_hi.mask());
                let reg = self.reload_one(value, old_lo, need, KeepReg::Free);
                self.regs.unlock_used_reg(old_hi.mask());
                reg
            } else {
                self.reload_one(value, old_lo, need, KeepReg::Free)
            }
        } else {
            self.mark_value_free(old_lo, value);
            old_lo
        };

        let hi = if !hi_resident {
            let was_used = self.regs.lock(lo.mask());
            let reg = self.reload_one(value, old_hi, need, KeepReg::Free);
            self.regs.unlock(lo.mask(), was_used);
            reg
        } else {
            self.mark_value_free(old_hi, value);
            old_hi
        };

        let pair = RegPair::halves(lo, hi);
        if keep == KeepReg::Keep {
            self.mark_pair_used(value, pair);
        }
        pair
    }
}
