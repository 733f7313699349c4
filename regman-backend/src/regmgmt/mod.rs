//! Register Management Module
//!
//! This module tracks which physical registers hold which values during
//! code generation for one method, picks registers for new values, evicts
//! values to stack temps when registers run out and brings them back.
//!
//! ## Architecture
//!
//! The module is structured as follows:
//! - `RegisterManager` - Public API, one per method being compiled
//! - `RegisterFile` - Register facets and value bindings
//! - `SpillTable` - Pending spill records, per source register
//! - `TempPool` - Stack temps, recycled by size class
//! - `ContentTracker` - Known register contents for load elimination
//!
//! Instruction emission, value types and GC bookkeeping are reached through
//! the `CodegenHooks` the manager is built with.
//!
//! ## Safety Invariants
//!
//! - Locked registers are always in use
//! - A value has at most one pending record per source register
//! - Every pending record refers to a temp that is in use
//! - A temp is back in the pool once no pending record refers to it
//! - Broken invariants abort the method through `ice!`

pub use self::manager::{MethodSummary, RegisterManager};
pub use self::register_file::{AliasList, MultiUse, RegisterFile};
pub use self::spill::{KeepReg, SpillRecord, SpillTable};
pub use self::temps::{TempPool, TempSlot, TempUsage, TEMP_MAX_SIZE};
pub use self::tracker::{ContentTracker, RegContent};

mod manager;
mod pair;
mod register_file;
mod spill;
mod temps;
mod tracker;
