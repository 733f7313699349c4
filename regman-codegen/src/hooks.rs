//! Collaborator interfaces the register manager calls back into
//!
//! The register manager owns no instruction encoder, no value
//! representation and no GC tables. Whatever drives it supplies these three
//! facilities, usually as one object implementing all of them
//! (`CodegenHooks` is implemented automatically for such a type).

use crate::asm::{AsmInst, Reg};
use crate::regmask::RegMask;
use log::trace;
use regman_common::{ice, StorageType, TempId, ValueId};
use std::collections::HashMap;

/// Storage information about the values being allocated
pub trait ValueInfo {
    fn value_type(&self, value: ValueId) -> StorageType;
}

/// Instruction emission for spills and reloads
pub trait SpillEmitter {
    /// Store `reg` into `temp`
    fn spill_reg(&mut self, ty: StorageType, temp: TempId, reg: Reg);

    /// Load `temp` into `reg`
    fn reload_reg(&mut self, ty: StorageType, temp: TempId, reg: Reg);

    /// The spill area grew to `frame_size` bytes
    fn tmp_size_changed(&mut self, _frame_size: u32) {}
}

/// GC safe-point map maintenance
pub trait GcRegTracker {
    fn note_register_holds_pointer(&mut self, reg: Reg, is_pointer: bool);
    fn note_register_cleared(&mut self, mask: RegMask);
}

pub trait CodegenHooks: ValueInfo + SpillEmitter + GcRegTracker {}

impl<T: ValueInfo + SpillEmitter + GcRegTracker> CodegenHooks for T {}

/// Hooks that record everything they are told.
///
/// Used by the replay driver and by tests: storage types are registered up
/// front with `define`, emitted instructions accumulate until
/// `take_instructions`, and the set of registers currently holding GC
/// pointers is kept up to date.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    types: HashMap<ValueId, StorageType>,
    instructions: Vec<AsmInst>,
    gc_regs: RegMask,
    frame_size: u32,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, value: ValueId, ty: StorageType) {
        self.types.insert(value, ty);
    }

    pub fn instructions(&self) -> &[AsmInst] {
        &self.instructions
    }

    /// Take all accumulated instructions, leaving the buffer empty
    pub fn take_instructions(&mut self) -> Vec<AsmInst> {
        std::mem::take(&mut self.instructions)
    }

    /// Registers currently reported as holding GC pointers
    pub fn gc_regs(&self) -> RegMask {
        self.gc_regs
    }

    /// Last frame size reported through `tmp_size_changed`
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Add a comment to the instruction stream
    pub fn comment(&mut self, text: impl Into<String>) {
        self.instructions.push(AsmInst::Comment(text.into()));
    }
}

impl ValueInfo for RecordingHooks {
    fn value_type(&self, value: ValueId) -> StorageType {
        match self.types.get(&value) {
            Some(ty) => *ty,
            None => ice!("no storage type recorded for {}", value),
        }
    }
}

impl SpillEmitter for RecordingHooks {
    fn spill_reg(&mut self, ty: StorageType, temp: TempId, reg: Reg) {
        trace!("emit spill {} {} -> {}", ty, reg, temp);
        self.instructions.push(AsmInst::Spill { reg, temp, ty });
    }

    fn reload_reg(&mut self, ty: StorageType, temp: TempId, reg: Reg) {
        trace!("emit reload {} {} <- {}", ty, reg, temp);
        self.instructions.push(AsmInst::Reload { reg, temp, ty });
    }

    fn tmp_size_changed(&mut self, frame_size: u32) {
        self.frame_size = frame_size;
        self.instructions.push(AsmInst::FrameSize(frame_size));
    }
}

impl GcRegTracker for RecordingHooks {
    fn note_register_holds_pointer(&mut self, reg: Reg, is_pointer: bool) {
        if is_pointer {
            self.gc_regs.insert(reg);
        } else {
            self.gc_regs.remove(reg);
        }
    }

    fn note_register_cleared(&mut self, mask: RegMask) {
        self.gc_regs -= mask;
    }
}
