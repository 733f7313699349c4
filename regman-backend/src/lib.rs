//! Register manager - backend
//!
//! This crate provides the register management core of a method compiler:
//! the register file with its facets, the allocation and eviction policy,
//! spilling to stack temps and reloading, register pairs for 64-bit values,
//! and the register content tracker used for redundant-load elimination.
//!
//! A code generator owns one `RegisterManager` per compilation thread and
//! calls `begin_method` / `finish_method` around each method.

use serde::{Deserialize, Serialize};

pub mod regmgmt;

pub use regmgmt::{
    AliasList, ContentTracker, KeepReg, MethodSummary, MultiUse, RegContent, RegisterFile,
    RegisterManager, SpillRecord, SpillTable, TempPool, TempSlot, TempUsage, TEMP_MAX_SIZE,
};
pub use regman_codegen::{Reg, RegMask, RegPair, Target};

/// Per-method compilation options the register manager consults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocOptions {
    /// Minimal optimization: no content tracking lookups
    pub min_opts: bool,
    /// Debuggable code: same effect on content tracking as `min_opts`
    pub debug_code: bool,
    /// GC may interrupt at any instruction, so pointer locals are never cached
    pub fully_interruptible: bool,
    /// The frame pointer frames the method and is never allocated
    pub frame_pointer_used: bool,
}

impl AllocOptions {
    pub fn tracks_redundant_loads(&self) -> bool {
        !self.min_opts && !self.debug_code
    }
}

#[cfg(test)]
mod tests;
