//! Register content tracking for redundant-load elimination
//!
//! The tracker remembers, per register, what it is known to contain: an
//! integer constant, a copy of a local variable, or one half of a 64-bit
//! local. The code generator consults it before emitting a load. It is an
//! oracle only; nothing here affects which registers are allocated, and an
//! entry is dropped (trashed) whenever it might have become stale.
//!
//! Every update that writes a register also marks it modified in the
//! register file, which feeds the callee-saved avoidance rule of the
//! allocator.
//!
//! Lookups answer "nothing known" when the method is compiled without
//! optimization, so debug code never depends on stale register contents.

use super::manager::RegisterManager;
use super::register_file::RegisterFile;
use crate::AllocOptions;
use log::trace;
use regman_codegen::{CloseConstantPolicy, CodegenHooks, Gpr, Reg, RegMask, RegPair, Target};
use regman_common::{ice_assert, LocalDesc, LocalId, StorageType};

/// What a register is known to contain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegContent {
    Trash,
    IntConstant(i64),
    Local { local: LocalId, is_gc: bool },
    LocalLow(LocalId),
    LocalHigh(LocalId),
}

#[derive(Debug, Clone)]
pub struct ContentTracker {
    values: Vec<RegContent>,
    int_regs: RegMask<Gpr>,
    policy: CloseConstantPolicy,
    enabled: bool,
    fully_interruptible: bool,
}

impl ContentTracker {
    pub fn new(target: &Target, options: &AllocOptions) -> Self {
        Self {
            values: vec![RegContent::Trash; target.universe_size()],
            int_regs: target.int_regs(),
            policy: target.close_constants(),
            enabled: options.tracks_redundant_loads(),
            fully_interruptible: options.fully_interruptible,
        }
    }

    /// Start a new method, possibly with different options
    pub fn reset(&mut self, options: &AllocOptions) {
        self.enabled = options.tracks_redundant_loads();
        self.fully_interruptible = options.fully_interruptible;
        self.clear();
    }

    /// Lookups are answered at all
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn content(&self, reg: Reg) -> RegContent {
        self.values[reg.index()]
    }

    /// Forget everything, as at a code label
    pub fn clear(&mut self) {
        self.values.fill(RegContent::Trash);
    }

    pub fn trash(&mut self, regs: &mut RegisterFile, reg: Reg) {
        regs.set_modified(reg.mask());
        self.values[reg.index()] = RegContent::Trash;
    }

    pub fn trash_mask(&mut self, regs: &mut RegisterFile, mask: RegMask) {
        for reg in mask.iter() {
            self.trash(regs, reg);
        }
    }

    /// Trash registers clobbered by a call, if tracking is on
    pub fn trash_reg_set(&mut self, regs: &mut RegisterFile, mask: RegMask) {
        if self.enabled {
            self.trash_mask(regs, mask);
        }
    }

    pub fn note_constant(&mut self, regs: &mut RegisterFile, reg: Reg, value: i64) {
        ice_assert!(self.int_regs.contains(reg), "constant {} tracked in non-integer {}", value, reg);
        regs.set_modified(reg.mask());
        trace!("{} now holds constant {}", reg, value);
        self.values[reg.index()] = RegContent::IntConstant(value);
    }

    /// `reg` was loaded from `local`
    pub fn note_local(&mut self, regs: &mut RegisterFile, reg: Reg, local: &LocalDesc) {
        ice_assert!(!local.ty.is_float(), "float local {} tracked in {}", local.id, reg);
        self.values[reg.index()] = RegContent::Trash;

        if local.addr_exposed {
            return;
        }
        regs.set_modified(reg.mask());

        if local.ty.is_gc() {
            if local.is_register || self.fully_interruptible {
                return;
            }
        } else if local.normalize_on_load {
            return;
        }

        trace!("{} now holds {}", reg, local.id);
        self.values[reg.index()] = if local.ty == StorageType::Int64 {
            RegContent::LocalLow(local.id)
        } else {
            RegContent::Local {
                local: local.id,
                is_gc: local.ty.is_gc(),
            }
        };
    }

    /// `reg` was loaded from one half of the 64-bit `local`
    pub fn note_local_long(&mut self, regs: &mut RegisterFile, reg: Reg, local: &LocalDesc, low: bool) {
        self.values[reg.index()] = RegContent::Trash;
        if local.addr_exposed {
            return;
        }
        regs.set_modified(reg.mask());
        self.values[reg.index()] = if low {
            RegContent::LocalLow(local.id)
        } else {
            RegContent::LocalHigh(local.id)
        };
    }

    /// `reg` was stored to `local`; a known constant stays the better description
    pub fn note_store(&mut self, regs: &mut RegisterFile, reg: Reg, local: &LocalDesc) {
        if matches!(self.content(reg), RegContent::IntConstant(_)) {
            return;
        }
        self.note_local(regs, reg, local);
    }

    pub fn note_copy(&mut self, regs: &mut RegisterFile, dst: Reg, src: Reg) {
        regs.set_modified(dst.mask());
        self.values[dst.index()] = self.values[src.index()];
    }

    pub fn note_swap(&mut self, regs: &mut RegisterFile, a: Reg, b: Reg) {
        regs.set_modified(a.mask() | b.mask());
        self.values.swap(a.index(), b.index());
    }

    /// An integer register holding exactly `value`
    pub fn find_constant(&self, value: i64) -> Option<Reg> {
        match self.find_close_constant(value) {
            Some((reg, 0)) => Some(reg),
            _ => None,
        }
    }

    /// An integer register holding `value` (delta 0) or a constant the target
    /// can adjust to `value` cheaply, with the delta to add
    pub fn find_close_constant(&self, value: i64) -> Option<(Reg, i64)> {
        if !self.enabled {
            return None;
        }

        let mut close: Option<(Reg, i64)> = None;
        for reg in self.int_regs.iter() {
            let RegContent::IntConstant(held) = self.content(reg) else {
                continue;
            };
            if held == value {
                return Some((reg, 0));
            }
            let delta = value.wrapping_sub(held);
            match self.policy {
                CloseConstantPolicy::ByteDelta => {
                    if close.is_none() && i8::try_from(delta).is_ok() {
                        close = Some((reg, delta));
                    }
                }
                CloseConstantPolicy::Smallest => {
                    if close.map_or(true, |(_, best)| delta.unsigned_abs() < best.unsigned_abs()) {
                        close = Some((reg, delta));
                    }
                }
            }
        }
        close
    }

    pub fn holds_constant(&self, reg: Reg, value: i64) -> bool {
        self.enabled && self.content(reg) == RegContent::IntConstant(value)
    }

    /// A register holding a copy of `local`. Enregistered locals are never
    /// reported: their register is their home, not a copy.
    pub fn find_local(&self, local: &LocalDesc) -> Option<Reg> {
        if !self.enabled || local.is_register {
            return None;
        }
        (0..self.values.len()).map(|i| Reg::new(i as u8)).find(|&reg| {
            matches!(self.content(reg), RegContent::Local { local: id, .. } if id == local.id)
        })
    }

    /// Two registers holding both halves of the 64-bit `local`
    pub fn find_local_pair(&self, local: LocalId) -> Option<RegPair> {
        if !self.enabled {
            return None;
        }
        let mut lo = None;
        let mut hi = None;
        for (i, content) in self.values.iter().enumerate() {
            let reg = Reg::new(i as u8);
            match *content {
                RegContent::LocalLow(id) if id == local && lo.is_none() => lo = Some(reg),
                RegContent::LocalHigh(id) if id == local && hi.is_none() => hi = Some(reg),
                _ => {}
            }
            if let (Some(lo), Some(hi)) = (lo, hi) {
                return Some(RegPair::halves(lo, hi));
            }
        }
        None
    }

    /// `local` was written; registers holding copies of it are stale
    pub fn trash_local(&mut self, local: LocalId) {
        if !self.enabled {
            return;
        }
        for content in &mut self.values {
            if matches!(*content, RegContent::Local { local: id, .. } if id == local) {
                *content = RegContent::Trash;
            }
        }
    }

    pub fn trash_local_long(&mut self, local: LocalId) {
        if !self.enabled {
            return;
        }
        for content in &mut self.values {
            if matches!(*content, RegContent::LocalLow(id) | RegContent::LocalHigh(id) if id == local) {
                *content = RegContent::Trash;
            }
        }
    }

    /// Keep only non-zero constants and non-pointer locals
    pub fn clear_pointers(&mut self) {
        for content in &mut self.values {
            let keep = match *content {
                RegContent::IntConstant(value) => value != 0,
                RegContent::Local { is_gc, .. } => !is_gc,
                _ => false,
            };
            if !keep {
                *content = RegContent::Trash;
            }
        }
    }

    /// Forget pointer-typed locals at a GC safe point, returning their registers
    pub fn trash_on_safepoint(&mut self) -> RegMask {
        let mut trashed: RegMask = RegMask::empty();
        for (i, content) in self.values.iter_mut().enumerate() {
            if let RegContent::Local { is_gc: true, .. } = *content {
                *content = RegContent::Trash;
                trashed.insert(Reg::new(i as u8));
            }
        }
        trashed
    }

    /// Integer registers whose contents are worthless
    pub fn useless_regs(&self) -> RegMask<Gpr> {
        if !self.enabled {
            return self.int_regs;
        }
        let mut useless = self.int_regs;
        for reg in self.int_regs.iter() {
            if self.content(reg) != RegContent::Trash {
                useless.remove(reg);
            }
        }
        useless
    }
}

/// Content-tracking entry points of the register manager. Updates go
/// through the manager so the register file sees every register written.
impl<H: CodegenHooks> RegisterManager<H> {
    pub fn note_constant(&mut self, reg: Reg, value: i64) {
        self.tracker.note_constant(&mut self.regs, reg, value);
    }

    pub fn note_local(&mut self, reg: Reg, local: &LocalDesc) {
        self.tracker.note_local(&mut self.regs, reg, local);
    }

    pub fn note_local_long(&mut self, reg: Reg, local: &LocalDesc, low: bool) {
        self.tracker.note_local_long(&mut self.regs, reg, local, low);
    }

    pub fn note_store(&mut self, reg: Reg, local: &LocalDesc) {
        self.tracker.note_store(&mut self.regs, reg, local);
    }

    pub fn note_copy(&mut self, dst: Reg, src: Reg) {
        self.tracker.note_copy(&mut self.regs, dst, src);
    }

    pub fn note_swap(&mut self, a: Reg, b: Reg) {
        self.tracker.note_swap(&mut self.regs, a, b);
    }

    pub fn trash_reg(&mut self, reg: Reg) {
        self.tracker.trash(&mut self.regs, reg);
    }

    pub fn trash_mask(&mut self, mask: RegMask) {
        self.tracker.trash_mask(&mut self.regs, mask);
    }

    /// Registers clobbered by a call
    pub fn trash_reg_set(&mut self, mask: RegMask) {
        self.tracker.trash_reg_set(&mut self.regs, mask);
    }

    pub fn trash_local(&mut self, local: LocalId) {
        self.tracker.trash_local(local);
    }

    pub fn trash_local_long(&mut self, local: LocalId) {
        self.tracker.trash_local_long(local);
    }

    /// Forget all register contents, as at a label
    pub fn clear_contents(&mut self) {
        self.tracker.clear();
    }

    pub fn clear_pointer_contents(&mut self) {
        self.tracker.clear_pointers();
    }

    /// A GC safe point: pointer locals cached in registers may move
    pub fn safepoint(&mut self) -> RegMask {
        let trashed = self.tracker.trash_on_safepoint();
        if !trashed.is_empty() {
            trace!("safepoint trashed {}", self.target.fmt_mask(trashed));
        }
        trashed
    }

    pub fn find_constant(&self, value: i64) -> Option<Reg> {
        self.tracker.find_constant(value)
    }

    pub fn find_close_constant(&self, value: i64) -> Option<(Reg, i64)> {
        self.tracker.find_close_constant(value)
    }

    pub fn find_local(&self, local: &LocalDesc) -> Option<Reg> {
        self.tracker.find_local(local)
    }

    pub fn find_local_pair(&self, local: LocalId) -> Option<RegPair> {
        self.tracker.find_local_pair(local)
    }

    pub fn useless_regs(&self) -> RegMask<Gpr> {
        self.tracker.useless_regs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Fixture {
        target: Target,
        regs: RegisterFile,
        tracker: ContentTracker,
    }

    fn fixture(target: Target) -> Fixture {
        let options = AllocOptions::default();
        Fixture {
            regs: RegisterFile::new(&target),
            tracker: ContentTracker::new(&target, &options),
            target,
        }
    }

    impl Fixture {
        fn reg(&self, name: &str) -> Reg {
            self.target.reg(name).unwrap()
        }
    }

    #[test]
    fn test_exact_constant_beats_earlier_close_one() {
        let mut f = fixture(Target::x86());
        let eax = f.reg("eax");
        let ebx = f.reg("ebx");
        f.tracker.note_constant(&mut f.regs, eax, 100);
        f.tracker.note_constant(&mut f.regs, ebx, 104);

        assert_eq!(f.tracker.find_close_constant(104), Some((ebx, 0)));
        assert_eq!(f.tracker.find_constant(104), Some(ebx));
        assert!(f.regs.modified().contains(eax));
    }

    #[test]
    fn test_byte_delta_takes_first_fit() {
        let mut f = fixture(Target::x86());
        let eax = f.reg("eax");
        let ecx = f.reg("ecx");
        f.tracker.note_constant(&mut f.regs, eax, 0);
        f.tracker.note_constant(&mut f.regs, ecx, 95);

        // eax is scanned first and 100 - 0 fits a signed byte
        assert_eq!(f.tracker.find_close_constant(100), Some((eax, 100)));
        assert_eq!(f.tracker.find_close_constant(1000), None);
        assert_eq!(f.tracker.find_constant(100), None);
    }

    #[test]
    fn test_smallest_delta_policy() {
        let mut f = fixture(Target::arm32());
        let r0 = f.reg("r0");
        let r1 = f.reg("r1");
        f.tracker.note_constant(&mut f.regs, r0, 0);
        f.tracker.note_constant(&mut f.regs, r1, 4000);

        assert_eq!(f.tracker.find_close_constant(3990), Some((r1, -10)));
    }

    #[test]
    fn test_lookups_disabled_without_optimization() {
        let target = Target::x86();
        let options = AllocOptions {
            min_opts: true,
            ..AllocOptions::default()
        };
        let mut regs = RegisterFile::new(&target);
        let mut tracker = ContentTracker::new(&target, &options);
        let eax = target.reg("eax").unwrap();

        tracker.note_constant(&mut regs, eax, 5);
        assert_eq!(tracker.find_constant(5), None);
        assert_eq!(tracker.useless_regs(), target.int_regs());
    }

    #[test]
    fn test_local_tracking_rules() {
        let mut f = fixture(Target::x86());
        let eax = f.reg("eax");
        let ecx = f.reg("ecx");

        let mut exposed = LocalDesc::new(LocalId(1), StorageType::Int32);
        exposed.addr_exposed = true;
        f.tracker.note_local(&mut f.regs, eax, &exposed);
        assert_eq!(f.tracker.content(eax), RegContent::Trash);

        let plain = LocalDesc::new(LocalId(2), StorageType::Int32);
        f.tracker.note_local(&mut f.regs, ecx, &plain);
        assert_eq!(f.tracker.find_local(&plain), Some(ecx));

        f.tracker.trash_local(LocalId(2));
        assert_eq!(f.tracker.find_local(&plain), None);
    }

    #[test]
    fn test_long_local_halves() {
        let mut f = fixture(Target::x86());
        let eax = f.reg("eax");
        let edx = f.reg("edx");
        let long = LocalDesc::new(LocalId(4), StorageType::Int64);

        f.tracker.note_local_long(&mut f.regs, edx, &long, false);
        f.tracker.note_local(&mut f.regs, eax, &long);
        assert_eq!(f.tracker.content(eax), RegContent::LocalLow(LocalId(4)));
        assert_eq!(f.tracker.find_local_pair(LocalId(4)), Some(RegPair::halves(eax, edx)));

        f.tracker.trash_local_long(LocalId(4));
        assert_eq!(f.tracker.find_local_pair(LocalId(4)), None);
    }

    #[test]
    fn test_safepoint_trashes_only_pointer_locals() {
        let mut f = fixture(Target::x86());
        let eax = f.reg("eax");
        let ecx = f.reg("ecx");
        let edx = f.reg("edx");

        f.tracker
            .note_local(&mut f.regs, eax, &LocalDesc::new(LocalId(1), StorageType::Ref));
        f.tracker
            .note_local(&mut f.regs, ecx, &LocalDesc::new(LocalId(2), StorageType::Int32));
        f.tracker.note_constant(&mut f.regs, edx, 7);

        assert_eq!(f.tracker.trash_on_safepoint(), eax.mask());
        assert_eq!(f.tracker.content(eax), RegContent::Trash);
        assert!(matches!(f.tracker.content(ecx), RegContent::Local { .. }));
        assert_eq!(f.tracker.content(edx), RegContent::IntConstant(7));
    }

    #[test]
    fn test_fully_interruptible_skips_pointer_locals() {
        let target = Target::x86();
        let options = AllocOptions {
            fully_interruptible: true,
            ..AllocOptions::default()
        };
        let mut regs = RegisterFile::new(&target);
        let mut tracker = ContentTracker::new(&target, &options);
        let eax = target.reg("eax").unwrap();

        tracker.note_local(&mut regs, eax, &LocalDesc::new(LocalId(1), StorageType::Ref));
        assert_eq!(tracker.content(eax), RegContent::Trash);
    }

    #[test]
    fn test_clear_pointers_keeps_safe_entries() {
        let mut f = fixture(Target::x86());
        let eax = f.reg("eax");
        let ecx = f.reg("ecx");
        let edx = f.reg("edx");
        f.tracker.note_constant(&mut f.regs, eax, 0);
        f.tracker.note_constant(&mut f.regs, ecx, 12);
        f.tracker
            .note_local(&mut f.regs, edx, &LocalDesc::new(LocalId(3), StorageType::Int16));

        f.tracker.clear_pointers();
        assert_eq!(f.tracker.content(eax), RegContent::Trash);
        assert_eq!(f.tracker.content(ecx), RegContent::IntConstant(12));
        assert!(matches!(f.tracker.content(edx), RegContent::Local { .. }));
    }

    #[test]
    fn test_copy_swap_and_store() {
        let mut f = fixture(Target::x86());
        let eax = f.reg("eax");
        let ecx = f.reg("ecx");
        f.tracker.note_constant(&mut f.regs, eax, 3);
        f.tracker.note_copy(&mut f.regs, ecx, eax);
        assert_eq!(f.tracker.content(ecx), RegContent::IntConstant(3));

        f.tracker.trash(&mut f.regs, eax);
        f.tracker.note_swap(&mut f.regs, eax, ecx);
        assert_eq!(f.tracker.content(eax), RegContent::IntConstant(3));
        assert_eq!(f.tracker.content(ecx), RegContent::Trash);

        // storing a known constant keeps the constant
        f.tracker
            .note_store(&mut f.regs, eax, &LocalDesc::new(LocalId(9), StorageType::Int32));
        assert!(f.tracker.holds_constant(eax, 3));
    }
}
