//! Machine register handles and the instructions the register manager emits
//!
//! Registers are plain ordinals into the target's register universe. The
//! target description (see `target`) gives them names and classes; nothing in
//! this module knows which ordinal is the stack pointer.

use crate::regmask::{RegMask, MAX_REGS};
use regman_common::{StorageType, TempId};
use std::fmt;

/// A physical register, identified by its ordinal in the target's universe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reg(u8);

impl Reg {
    pub const fn new(index: u8) -> Self {
        assert!((index as usize) < MAX_REGS, "register ordinal out of range");
        Reg(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Single-register mask
    pub fn mask(self) -> RegMask {
        RegMask::from_reg(self)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Two registers jointly holding one value too wide for a single register.
///
/// `lo` holds the low half and `hi` the high half. Pairs handed out by the
/// pair allocator are canonical: `lo` has the lower ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegPair {
    lo: Reg,
    hi: Reg,
}

impl RegPair {
    /// Canonical pair of two distinct registers, lower ordinal first
    pub fn ordered(a: Reg, b: Reg) -> Self {
        assert_ne!(a, b, "a register pair needs two distinct registers");
        if a < b {
            RegPair { lo: a, hi: b }
        } else {
            RegPair { lo: b, hi: a }
        }
    }

    /// Pair with explicit halves, as left behind by a partial reload
    pub fn halves(lo: Reg, hi: Reg) -> Self {
        assert_ne!(lo, hi, "a register pair needs two distinct registers");
        RegPair { lo, hi }
    }

    pub fn lo(&self) -> Reg {
        self.lo
    }

    pub fn hi(&self) -> Reg {
        self.hi
    }

    pub fn mask(&self) -> RegMask {
        self.lo.mask() | self.hi.mask()
    }
}

impl fmt::Display for RegPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lo, self.hi)
    }
}

/// Instructions requested through the spill emitter hook
#[derive(Debug, Clone, PartialEq)]
pub enum AsmInst {
    /// Store `reg` into spill temp `temp`
    Spill { reg: Reg, temp: TempId, ty: StorageType },
    /// Load spill temp `temp` into `reg`
    Reload { reg: Reg, temp: TempId, ty: StorageType },
    /// The spill area of the frame grew to the given number of bytes
    FrameSize(u32),
    Comment(String),
}

impl fmt::Display for AsmInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsmInst::Spill { reg, temp, ty } => write!(f, "STORE.{} {}, [{}]", ty, reg, temp),
            AsmInst::Reload { reg, temp, ty } => write!(f, "LOAD.{} {}, [{}]", ty, reg, temp),
            AsmInst::FrameSize(size) => write!(f, "; spill area now {} bytes", size),
            AsmInst::Comment(text) => write!(f, "; {}", text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pair_ordering() {
        let pair = RegPair::ordered(Reg::new(5), Reg::new(2));
        assert_eq!(pair.lo(), Reg::new(2));
        assert_eq!(pair.hi(), Reg::new(5));

        let halves = RegPair::halves(Reg::new(5), Reg::new(2));
        assert_eq!(halves.lo(), Reg::new(5));
    }

    #[test]
    #[should_panic(expected = "two distinct registers")]
    fn test_pair_rejects_same_register() {
        RegPair::ordered(Reg::new(1), Reg::new(1));
    }

    #[test]
    fn test_instruction_display() {
        let spill = AsmInst::Spill {
            reg: Reg::new(0),
            temp: TempId(1),
            ty: StorageType::Int32,
        };
        assert_eq!(spill.to_string(), "STORE.int32 r0, [#1]");
        assert_eq!(AsmInst::FrameSize(8).to_string(), "; spill area now 8 bytes");
    }
}
