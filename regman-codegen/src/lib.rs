//! Register manager - machine-level building blocks
//!
//! This crate describes the machine the register manager allocates for:
//!
//! - Register handles, register pairs and the spill/reload instructions
//! - Typed register masks (`RegMask<Gpr>`, `RegMask<Fpr>`, `RegMask`)
//! - Target descriptions: register classes, reserved and callee-saved sets,
//!   preference orders and pairing strategies
//! - The collaborator hooks through which spill code is emitted

pub mod asm;
pub mod emit;
pub mod hooks;
pub mod regmask;
pub mod target;

pub use asm::{AsmInst, Reg, RegPair};
pub use emit::emit_listing;
pub use hooks::{CodegenHooks, GcRegTracker, RecordingHooks, SpillEmitter, ValueInfo};
pub use regmask::{AllocClass, AnyReg, Fpr, Gpr, RegClass, RegMask, MAX_REGS};
pub use target::{
    CloseConstantPolicy, PairPreference, PairStrategy, PairStrategyConfig, Target, TargetConfig,
    TargetError, PRESETS,
};
