//! Typed register sets
//!
//! A `RegMask<C>` is a bitset over the target's register universe, tagged
//! with a register class so that integer and float masks cannot be mixed by
//! accident. `RegMask` without a parameter (`RegMask<AnyReg>`) spans the
//! whole universe and is what the register file stores internally.
//!
//! Class-specific masks are only produced by the target description
//! (`Target::int_regs`, `Target::class_mask`, `RegMask::restrict`), so a
//! `RegMask<Gpr>` never contains a float register.

use crate::asm::Reg;
use crate::target::Target;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Sub, SubAssign};

/// Largest register universe a target may declare
pub const MAX_REGS: usize = 64;

/// A register class: the subset of the universe a mask may range over
pub trait RegClass: Copy + Eq + Default + fmt::Debug + 'static {
    const NAME: &'static str;

    /// All registers of this class on `target`
    fn members(target: &Target) -> RegMask;
}

/// A class the allocator can hand out registers from
pub trait AllocClass: RegClass {
    /// Preference order used when several registers of the class are acceptable
    fn tmp_order(target: &Target) -> &[Reg];
}

/// The whole register universe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AnyReg;

/// Integer registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Gpr;

/// Floating-point registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fpr;

impl RegClass for AnyReg {
    const NAME: &'static str = "any";

    fn members(target: &Target) -> RegMask {
        target.all_regs()
    }
}

impl RegClass for Gpr {
    const NAME: &'static str = "integer";

    fn members(target: &Target) -> RegMask {
        target.int_regs().widen()
    }
}

impl RegClass for Fpr {
    const NAME: &'static str = "float";

    fn members(target: &Target) -> RegMask {
        target.float_regs().widen()
    }
}

impl AllocClass for Gpr {
    fn tmp_order(target: &Target) -> &[Reg] {
        target.int_tmp_order()
    }
}

impl AllocClass for Fpr {
    fn tmp_order(target: &Target) -> &[Reg] {
        target.float_tmp_order()
    }
}

/// Set of registers of class `C`
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegMask<C = AnyReg> {
    bits: u64,
    class: PhantomData<C>,
}

impl<C: RegClass> RegMask<C> {
    pub const fn empty() -> Self {
        RegMask {
            bits: 0,
            class: PhantomData,
        }
    }

    /// Mask from raw bits. Only the target description may vouch for the class.
    pub(crate) fn from_bits(bits: u64) -> Self {
        RegMask {
            bits,
            class: PhantomData,
        }
    }

    /// Raw bits, one per register ordinal
    pub fn bits(self) -> u64 {
        self.bits
    }

    pub fn is_empty(self) -> bool {
        self.bits == 0
    }

    pub fn count(self) -> u32 {
        self.bits.count_ones()
    }

    pub fn contains(self, reg: Reg) -> bool {
        self.bits & (1u64 << reg.index()) != 0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.bits & other.bits != 0
    }

    pub fn is_subset_of(self, other: Self) -> bool {
        self.bits & !other.bits == 0
    }

    pub fn remove(&mut self, reg: Reg) {
        self.bits &= !(1u64 << reg.index());
    }

    pub fn without(mut self, reg: Reg) -> Self {
        self.remove(reg);
        self
    }

    /// Lowest-numbered register in the set
    pub fn lowest(self) -> Option<Reg> {
        if self.bits == 0 {
            None
        } else {
            Some(Reg::new(self.bits.trailing_zeros() as u8))
        }
    }

    /// Registers in ascending ordinal order
    pub fn iter(self) -> RegMaskIter {
        RegMaskIter { bits: self.bits }
    }

    /// Forget the class
    pub fn widen(self) -> RegMask {
        RegMask {
            bits: self.bits,
            class: PhantomData,
        }
    }

    /// Remove every register of `other`, whatever its class
    pub fn exclude(self, other: RegMask) -> Self {
        RegMask {
            bits: self.bits & !other.bits,
            class: PhantomData,
        }
    }

    /// Keep only registers also in `other`, whatever its class
    pub fn intersect(self, other: RegMask) -> Self {
        RegMask {
            bits: self.bits & other.bits,
            class: PhantomData,
        }
    }

    /// `self`, or `fallback` when `self` is empty
    pub fn or_if_empty(self, fallback: Self) -> Self {
        if self.is_empty() {
            fallback
        } else {
            self
        }
    }

    /// Drop the registers in `exclude` unless that leaves nothing
    pub fn exclude_hint(self, exclude: Self) -> Self {
        (self - exclude).or_if_empty(self)
    }

    /// Narrow to `narrow` unless that leaves nothing
    pub fn narrow_hint(self, narrow: Self) -> Self {
        (self & narrow).or_if_empty(self)
    }
}

impl RegMask {
    pub fn from_reg(reg: Reg) -> Self {
        RegMask {
            bits: 1u64 << reg.index(),
            class: PhantomData,
        }
    }

    pub fn from_regs(regs: &[Reg]) -> Self {
        regs.iter().copied().collect()
    }

    pub fn insert(&mut self, reg: Reg) {
        self.bits |= 1u64 << reg.index();
    }

    /// The members of class `C` in this mask
    pub fn restrict<C: RegClass>(self, target: &Target) -> RegMask<C> {
        RegMask {
            bits: self.bits & C::members(target).bits,
            class: PhantomData,
        }
    }
}

impl FromIterator<Reg> for RegMask {
    fn from_iter<I: IntoIterator<Item = Reg>>(iter: I) -> Self {
        let mut mask: RegMask = RegMask::empty();
        for reg in iter {
            mask.insert(reg);
        }
        mask
    }
}

impl<C: RegClass> BitOr for RegMask<C> {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        RegMask {
            bits: self.bits | rhs.bits,
            class: PhantomData,
        }
    }
}

impl<C: RegClass> BitAnd for RegMask<C> {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        RegMask {
            bits: self.bits & rhs.bits,
            class: PhantomData,
        }
    }
}

impl<C: RegClass> Sub for RegMask<C> {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        RegMask {
            bits: self.bits & !rhs.bits,
            class: PhantomData,
        }
    }
}

impl<C: RegClass> BitOrAssign for RegMask<C> {
    fn bitor_assign(&mut self, rhs: Self) {
        self.bits |= rhs.bits;
    }
}

impl<C: RegClass> BitAndAssign for RegMask<C> {
    fn bitand_assign(&mut self, rhs: Self) {
        self.bits &= rhs.bits;
    }
}

impl<C: RegClass> SubAssign for RegMask<C> {
    fn sub_assign(&mut self, rhs: Self) {
        self.bits &= !rhs.bits;
    }
}

impl<C: RegClass> fmt::Debug for RegMask<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegMask<{}>{}", C::NAME, self)
    }
}

impl<C: RegClass> fmt::Display for RegMask<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, reg) in self.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", reg)?;
        }
        write!(f, "}}")
    }
}

/// Ascending iterator over the registers of a mask
pub struct RegMaskIter {
    bits: u64,
}

impl Iterator for RegMaskIter {
    type Item = Reg;

    fn next(&mut self) -> Option<Reg> {
        if self.bits == 0 {
            return None;
        }
        let index = self.bits.trailing_zeros();
        self.bits &= self.bits - 1;
        Some(Reg::new(index as u8))
    }
}
