//! Register pairs for 64-bit values on 32-bit targets
//!
//! Candidate pairs come from the target's pair strategy; this module only
//! filters them against the current register state and falls back to
//! grabbing the halves one at a time.

use super::manager::RegisterManager;
use log::debug;
use regman_codegen::{CodegenHooks, Gpr, RegMask, RegPair};
use regman_common::{ice_assert, ValueId};

impl<H: CodegenHooks> RegisterManager<H> {
    /// Registers a pair may never use: reserved ones, the stack pointer and
    /// the frame pointer while it frames the method
    fn pair_exclusions(&self) -> RegMask {
        self.target.reserved() | self.target.stack_pointer().mask() | self.frame_pointer_mask()
    }

    /// Best pair made of registers in `mask`, without evicting anything
    pub fn find_pair(&self, mask: RegMask<Gpr>) -> Option<RegPair> {
        let allowed = mask.exclude(self.pair_exclusions());
        if allowed.count() < 2 {
            return None;
        }
        self.target
            .pair_strategy()
            .candidates(allowed, self.target.int_tmp_order())
            .into_iter()
            .next()
    }

    /// Get two registers of `mask`, evicting occupants as needed
    pub fn grab_pair(&mut self, mask: RegMask<Gpr>) -> RegPair {
        let mask = mask.exclude(self.regs.locked());
        ice_assert!(mask.count() >= 2, "grab_pair from {} with fewer than two registers", self.target.fmt_mask(mask));

        if let Some(pair) = self.find_pair(mask & self.free_mask::<Gpr>()) {
            self.regs.set_modified(pair.mask());
            debug!("grab_pair: {} is free", self.fmt_pair(pair));
            return pair;
        }

        let usable = mask.exclude(self.pair_exclusions());
        let first = match self.pick_in_tmp_order(usable & self.free_mask::<Gpr>()) {
            Some(reg) => {
                self.regs.set_modified(reg.mask());
                reg
            }
            None => self.grab(usable),
        };

        self.regs.lock_reg(first.mask());
        let second = self.grab(usable.without(first));
        self.regs.unlock_reg(first.mask());

        let pair = RegPair::ordered(first, second);
        debug!("grab_pair: {}", self.fmt_pair(pair));
        pair
    }

    /// A free pair from `mask` if there is one, otherwise grab one
    pub fn pick_reg_pair(&mut self, mask: RegMask<Gpr>) -> RegPair {
        let mask = mask.or_if_empty(self.allocatable::<Gpr>());
        if let Some(pair) = self.find_pair(mask & self.free_mask::<Gpr>()) {
            self.regs.set_modified(pair.mask());
            return pair;
        }
        self.grab_pair(mask)
    }

    /// Bind a 64-bit `value` to both halves of `pair`
    pub fn mark_pair_used(&mut self, value: ValueId, pair: RegPair) {
        let ty = self.hooks.value_type(value);
        ice_assert!(self.is_pair_type(ty), "{} ({}) does not need a register pair", value, ty);

        debug!("{} now holds {}", self.fmt_pair(pair), value);
        self.hooks.note_register_cleared(pair.mask());
        for reg in [pair.lo(), pair.hi()] {
            if self.regs.is_used(reg) {
                self.regs.push_alias(reg);
            }
            self.regs.bind(reg, value, None);
        }
    }

    fn fmt_pair(&self, pair: RegPair) -> String {
        format!("{}:{}", self.name(pair.lo()), self.name(pair.hi()))
    }
}
