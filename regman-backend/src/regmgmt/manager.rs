//! Per-method register manager
//!
//! `RegisterManager` is the context object for one method's code
//! generation. It owns the register file, the spill tables, the temp pool and
//! the content tracker, plus the collaborator hooks, and implements the
//! allocation policy on top of them. The spill, pair and content-tracking
//! entry points live next to their data structures in `spill.rs`,
//! `pair.rs` and `tracker.rs`.

use super::register_file::RegisterFile;
use super::spill::SpillTable;
use super::temps::TempPool;
use super::tracker::ContentTracker;
use crate::AllocOptions;
use log::{debug, trace};
use regman_codegen::{AllocClass, CodegenHooks, Reg, RegClass, RegMask, Target};
use regman_common::{
    ice, ice_assert, AddrId, CompilerError, StorageType, TempId, TempKind, ValueId,
};
use std::collections::BTreeMap;

/// What the frame layout needs to know once a method is done
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSummary {
    /// Bytes of spill temps to reserve in the frame
    pub frame_size: u32,
    pub temp_count: usize,
    /// Every register written during the method
    pub modified: RegMask,
    /// Callee-saved registers the prologue must save
    pub used_callee_saved: RegMask,
}

pub struct RegisterManager<H: CodegenHooks> {
    pub(super) target: Target,
    pub(super) options: AllocOptions,
    pub(super) method: String,
    pub(super) regs: RegisterFile,
    pub(super) spills: SpillTable,
    pub(super) temps: TempPool,
    pub(super) tracker: ContentTracker,
    /// Spilled-operand count per addressing mode
    pub(super) addr_spills: BTreeMap<AddrId, u8>,
    pub(super) hooks: H,
}

impl<H: CodegenHooks> RegisterManager<H> {
    pub fn new(target: Target, options: AllocOptions, hooks: H) -> Self {
        Self {
            regs: RegisterFile::new(&target),
            spills: SpillTable::new(target.universe_size()),
            temps: TempPool::new(&target),
            tracker: ContentTracker::new(&target, &options),
            addr_spills: BTreeMap::new(),
            method: String::new(),
            target,
            options,
            hooks,
        }
    }

    /// Reset every table for the next method
    pub fn begin_method(&mut self, name: &str, options: AllocOptions) {
        debug!("Begin register management for {}", name);
        self.method = name.to_string();
        self.options = options;
        self.regs.reset();
        self.spills.reset();
        self.temps.reset();
        self.tracker.reset(&options);
        self.addr_spills.clear();
    }

    /// Check that the method left nothing behind and report the frame requirements
    pub fn finish_method(&mut self) -> Result<MethodSummary, CompilerError> {
        let mut problems = Vec::new();

        for i in 0..self.target.universe_size() {
            let reg = Reg::new(i as u8);
            if let Some(value) = self.regs.primary(reg) {
                problems.push(format!("{} still holds {}", self.target.reg_name(reg), value));
            }
            for record in self.spills.records(reg) {
                problems.push(format!(
                    "{} spilled from {} was never reloaded",
                    record.value,
                    self.target.reg_name(reg)
                ));
            }
        }
        if !self.regs.locked().is_empty() {
            problems.push(format!("registers {} still locked", self.target.fmt_mask(self.regs.locked())));
        }
        if !self.regs.multi().is_empty() {
            problems.push(format!(
                "registers {} still multi-used",
                self.target.fmt_mask(self.regs.multi())
            ));
        }
        if !self.temps.all_free() {
            problems.push(format!("{} temps still in use", self.temps.outstanding()));
        }
        for (addr, count) in &self.addr_spills {
            problems.push(format!("{} still has {} spilled operands", addr, count));
        }

        if !problems.is_empty() {
            return Err(CompilerError::InconsistentState {
                method: self.method.clone(),
                problems,
            });
        }

        let summary = MethodSummary {
            frame_size: self.temps.frame_size(),
            temp_count: self.temps.count(),
            modified: self.regs.modified(),
            used_callee_saved: self.used_callee_saved(),
        };
        debug!(
            "Finished {}: {} bytes of temps, callee-saved used {}",
            self.method,
            summary.frame_size,
            self.target.fmt_mask(summary.used_callee_saved)
        );
        Ok(summary)
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn options(&self) -> &AllocOptions {
        &self.options
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    pub fn temps(&self) -> &TempPool {
        &self.temps
    }

    pub fn tracker(&self) -> &ContentTracker {
        &self.tracker
    }

    pub fn spills(&self) -> &SpillTable {
        &self.spills
    }

    /// Describe every broken invariant; empty when consistent
    pub fn check_invariants(&self) -> Vec<String> {
        let mut problems = self.regs.check();
        for i in 0..self.target.universe_size() {
            let reg = Reg::new(i as u8);
            for record in self.spills.records(reg) {
                if self.temps.find(record.temp, super::temps::TempUsage::Used).is_none() {
                    problems.push(format!("{} spilled to released temp {}", record.value, record.temp));
                }
            }
        }
        let outstanding = self.temps.outstanding() as u64;
        if self.temps.gets() - self.temps.releases() != outstanding {
            problems.push(format!(
                "{} temps outstanding but {} gets and {} releases",
                outstanding,
                self.temps.gets(),
                self.temps.releases()
            ));
        }
        problems
    }

    pub(super) fn is_pair_type(&self, ty: StorageType) -> bool {
        ty == StorageType::Int64 && self.target.long_uses_reg_pair()
    }

    pub(super) fn name(&self, reg: Reg) -> &str {
        self.target.reg_name(reg)
    }

    /// Registers of class `C` that may ever be allocated
    pub fn allocatable<C: RegClass>(&self) -> RegMask<C> {
        self.target
            .all_regs()
            .restrict::<C>(&self.target)
            .exclude(self.target.reserved())
    }

    pub fn free_mask<C: RegClass>(&self) -> RegMask<C> {
        self.regs.free_mask(self.target.all_regs().restrict::<C>(&self.target))
    }

    pub fn grabbable_mask<C: RegClass>(&self) -> RegMask<C> {
        self.regs
            .grabbable_mask(self.target.all_regs().restrict::<C>(&self.target))
    }

    /// How many registers of `mask` are free right now
    pub fn free_needed_reg_count<C: RegClass>(&self, mask: RegMask<C>) -> u32 {
        (mask & self.free_mask::<C>()).count()
    }

    // Facets

    pub fn set_vars(&mut self, mask: RegMask) {
        self.regs.set_vars(mask);
    }

    pub fn lock_reg(&mut self, mask: RegMask) {
        self.regs.lock_reg(mask);
    }

    pub fn lock_used_reg(&mut self, mask: RegMask) {
        self.regs.lock_used_reg(mask);
    }

    pub fn unlock_reg(&mut self, mask: RegMask) {
        self.regs.unlock_reg(mask);
    }

    pub fn unlock_used_reg(&mut self, mask: RegMask) {
        self.regs.unlock_used_reg(mask);
    }

    /// Lock `mask`, returning the registers that were already in use
    pub fn lock(&mut self, mask: RegMask) -> RegMask {
        self.regs.lock(mask)
    }

    pub fn unlock(&mut self, mask: RegMask, was_used: RegMask) {
        self.regs.unlock(mask, was_used);
    }

    pub fn set_regs_modified(&mut self, mask: RegMask) {
        self.regs.set_modified(mask);
    }

    pub fn remove_regs_modified(&mut self, mask: RegMask) {
        self.regs.remove_modified(mask);
    }

    pub fn clear_regs_modified(&mut self) {
        self.regs.clear_modified();
    }

    pub fn modified(&self) -> RegMask {
        self.regs.modified()
    }

    /// Callee-saved registers touched so far
    pub fn used_callee_saved(&self) -> RegMask {
        self.regs.modified() & self.target.callee_saved()
    }

    // Bindings

    pub fn is_value_in_reg(&self, reg: Reg, value: ValueId) -> bool {
        self.regs.is_value_in_reg(reg, value)
    }

    /// Bind `value` to `reg`. If `reg` already holds another value, that
    /// value becomes an alias and `value` the new primary.
    pub fn mark_used(&mut self, value: ValueId, reg: Reg, addr: Option<AddrId>) {
        let ty = self.hooks.value_type(value);
        ice_assert!(!self.is_pair_type(ty), "{} ({}) needs a register pair", value, ty);
        ice_assert!(
            ty.is_float() == self.target.is_float(reg),
            "{} ({}) bound to {} of the wrong class",
            value,
            ty,
            self.name(reg)
        );
        ice_assert!(!self.regs.is_reserved(reg), "{} bound to reserved {}", value, self.name(reg));
        ice_assert!(
            reg != self.target.stack_pointer(),
            "{} bound to the stack pointer",
            value
        );

        debug!("{} now holds {}", self.name(reg), value);
        self.hooks.note_register_holds_pointer(reg, ty.is_gc());

        if self.regs.is_used(reg) {
            self.regs.push_alias(reg);
        }
        self.regs.bind(reg, value, addr);
    }

    /// Free every register in `mask`. A multi-used register is not freed:
    /// its next alias takes over as primary.
    pub fn mark_free(&mut self, mask: RegMask) {
        let multi = mask & self.regs.multi();
        for reg in multi.iter() {
            self.pop_alias(reg);
        }
        let rest = mask - multi;
        if !rest.is_empty() {
            self.free_regs(rest);
        }
    }

    /// Drop just the binding of `value` on `reg`
    pub fn mark_value_free(&mut self, reg: Reg, value: ValueId) {
        ice_assert!(
            self.regs.is_value_in_reg(reg, value),
            "{} is not held in {}",
            value,
            self.name(reg)
        );
        if !self.regs.is_multi_used(reg) {
            self.free_regs(reg.mask());
        } else if self.regs.primary(reg) == Some(value) {
            self.pop_alias(reg);
        } else {
            trace!("{} removed from the aliases of {}", value, self.name(reg));
            self.regs.remove_alias(reg, value);
        }
    }

    pub(super) fn free_regs(&mut self, mask: RegMask) {
        self.hooks.note_register_cleared(mask);
        for reg in mask.iter() {
            match self.regs.unbind(reg) {
                Some(value) => trace!("{} no longer holds {}", self.name(reg), value),
                None => ice!("free of {} which holds no value", self.name(reg)),
            }
        }
        self.regs.release(mask);
    }

    fn pop_alias(&mut self, reg: Reg) {
        let alias = self.regs.pop_alias(reg);
        let ty = self.hooks.value_type(alias.value);
        self.hooks.note_register_holds_pointer(reg, ty.is_gc());
    }

    // Allocation policy

    /// First register of `mask` in the class preference order. Untouched
    /// callee-saved registers are only taken when nothing else fits, and the
    /// frame pointer never is while it frames the method.
    pub fn pick_in_tmp_order<C: AllocClass>(&self, mask: RegMask<C>) -> Option<Reg> {
        if mask.is_empty() {
            return None;
        }
        let avoid = self.target.callee_saved() - self.regs.modified();
        let frame_pointer = self.frame_pointer_mask();

        for first_pass in [true, false] {
            for &reg in C::tmp_order(&self.target) {
                if frame_pointer.contains(reg) {
                    continue;
                }
                if first_pass && avoid.contains(reg) {
                    continue;
                }
                if mask.contains(reg) {
                    return Some(reg);
                }
            }
        }
        None
    }

    /// The frame pointer while it frames the method
    pub(super) fn frame_pointer_mask(&self) -> RegMask {
        match self.target.frame_pointer() {
            Some(fp) if self.options.frame_pointer_used => fp.mask(),
            _ => RegMask::empty(),
        }
    }

    /// First free register of `mask`, in preference order when it has one
    fn pick_free<C: AllocClass>(&self, mask: RegMask<C>) -> Option<Reg> {
        let free = (mask & self.free_mask::<C>()).exclude(self.frame_pointer_mask());
        self.pick_in_tmp_order(free).or_else(|| free.lowest())
    }

    /// Get a register from `mask`, spilling its current occupant if nothing
    /// in `mask` is free. Locked registers are never returned; when `mask`
    /// has nothing else to offer, any grabbable register of the class is used.
    pub fn grab<C: AllocClass>(&mut self, mask: RegMask<C>) -> Reg {
        ice_assert!(!mask.is_empty(), "grab from an empty {} mask", C::NAME);
        let mask = mask.exclude(self.regs.locked() | self.frame_pointer_mask());

        if let Some(reg) = self.pick_free(mask) {
            self.regs.set_modified(reg.mask());
            debug!("grab {}: {} is free", self.target.fmt_mask(mask), self.name(reg));
            return reg;
        }

        let mut candidates = mask & self.grabbable_mask::<C>();
        if candidates.is_empty() {
            let grabbable = self.grabbable_mask::<C>().exclude(self.frame_pointer_mask());
            if let Some(reg) = self.pick_free(grabbable) {
                self.regs.set_modified(reg.mask());
                debug!("grab {}: outside the mask, {} is free", self.target.fmt_mask(mask), self.name(reg));
                return reg;
            }
            candidates = grabbable;
        }

        let victim = match self
            .pick_in_tmp_order(candidates)
            .or_else(|| candidates.lowest())
        {
            Some(reg) => reg,
            None => ice!("Could not grab a register from {}", self.target.fmt_mask(mask)),
        };
        debug!("grab {}: evicting {}", self.target.fmt_mask(mask), self.name(victim));
        self.spill_reg(victim);
        self.regs.set_modified(victim.mask());
        victim
    }

    /// Grab a free register, preferring `hint` when it has any free member
    pub fn pick_free_reg<C: AllocClass>(&mut self, hint: RegMask<C>) -> Reg {
        let free = self.free_mask::<C>();
        ice_assert!(!free.is_empty(), "pick_free_reg with no free {} register", C::NAME);
        let mask = if hint.is_empty() { free } else { free.narrow_hint(hint) };
        self.grab(mask)
    }

    /// Choose a register treating both masks as hints: a free register of
    /// `best`, then of `mask`, then any free register, and only then grab
    /// with spilling.
    pub fn pick_reg<C: AllocClass>(&mut self, mask: RegMask<C>, best: RegMask<C>) -> Reg {
        let free = self.free_mask::<C>().exclude(self.frame_pointer_mask());
        let mut best = best;

        loop {
            let candidates = if !best.is_empty() {
                free & best
            } else if !mask.is_empty() {
                free & mask
            } else {
                free
            };
            if let Some(reg) = self.pick_free(candidates) {
                self.regs.set_modified(reg.mask());
                debug!("pick_reg: {} is free", self.name(reg));
                return reg;
            }
            if best.is_empty() {
                break;
            }
            best = RegMask::empty();
        }

        let spill_mask = if mask.is_empty() {
            free
        } else {
            if (mask & free) != free {
                if let Some(reg) = self.pick_free(free) {
                    self.regs.set_modified(reg.mask());
                    debug!("pick_reg: {} is free outside the mask", self.name(reg));
                    return reg;
                }
            }
            mask
        };

        let grabbable = self.grabbable_mask::<C>();
        let spill_mask = if spill_mask.intersects(grabbable) {
            spill_mask
        } else {
            grabbable
        };
        ice_assert!(!spill_mask.is_empty(), "pick_reg found no {} register to evict", C::NAME);
        self.grab(spill_mask)
    }

    /// `regs` without `exclude`, falling back to every allocatable register
    /// of the class without `exclude`
    pub fn must_exclude<C: RegClass>(&self, regs: RegMask<C>, exclude: RegMask<C>) -> RegMask<C> {
        let mask = (regs - exclude).or_if_empty(self.allocatable::<C>() - exclude);
        ice_assert!(!mask.is_empty(), "every {} register is excluded", C::NAME);
        mask
    }

    // Temps

    pub(super) fn get_temp(&mut self, kind: TempKind) -> TempId {
        let before = self.temps.frame_size();
        let temp = self.temps.get(kind);
        if self.temps.frame_size() != before {
            self.hooks.tmp_size_changed(self.temps.frame_size());
        }
        temp
    }

    /// Release a temp once nothing pending refers to it. Returns whether it
    /// went back to the pool; a temp still shared by spilled aliases stays
    /// in use until the last of them is reloaded.
    pub fn release_temp(&mut self, temp: TempId) -> bool {
        if self.spills.references_temp(temp) {
            trace!("temp {} still backs spilled aliases", temp);
            return false;
        }
        self.temps.release(temp);
        true
    }

    pub fn preallocate_temps(&mut self, kind: TempKind, count: usize) {
        let before = self.temps.frame_size();
        self.temps.preallocate(kind, count);
        if self.temps.frame_size() != before {
            self.hooks.tmp_size_changed(self.temps.frame_size());
        }
    }
}

// Unit tests for the register manager
#[cfg(test)]
#[path = "tests.rs"]
mod tests;
