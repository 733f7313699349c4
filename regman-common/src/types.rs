//! Common types used throughout the register manager
//!
//! The register manager never looks inside the values it allocates for.
//! Everything it needs to know about a value, a local or an addressing mode
//! is expressed through the small handle types defined here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle for a value produced during code generation.
///
/// Only identity matters: the register manager compares handles and asks the
/// code generator for the storage type behind one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Method-local variable number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalId(pub u32);

/// Handle for a complex addressing mode whose operands live in registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddrId(pub u32);

/// Spill temp number. Temps are numbered from 1 in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TempId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{:02}", self.0)
    }
}

impl fmt::Display for AddrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addr{}", self.0)
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Storage type of a value as reported by the code generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    Int8,
    Int16,
    Int32,
    /// 64-bit integer. Occupies a register pair on targets without 64-bit registers.
    Int64,
    /// Managed object reference, reported to the GC
    Ref,
    /// Managed interior pointer, reported to the GC
    ByRef,
    Float32,
    Float64,
}

impl StorageType {
    /// Size in bytes for a target with the given pointer size
    pub fn size(&self, pointer_size: u32) -> u32 {
        match self {
            StorageType::Int8 => 1,
            StorageType::Int16 => 2,
            StorageType::Int32 | StorageType::Float32 => 4,
            StorageType::Int64 | StorageType::Float64 => 8,
            StorageType::Ref | StorageType::ByRef => pointer_size,
        }
    }

    /// Check if values of this type must be reported to the GC
    pub fn is_gc(&self) -> bool {
        matches!(self, StorageType::Ref | StorageType::ByRef)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, StorageType::Float32 | StorageType::Float64)
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::Int8 => write!(f, "int8"),
            StorageType::Int16 => write!(f, "int16"),
            StorageType::Int32 => write!(f, "int32"),
            StorageType::Int64 => write!(f, "int64"),
            StorageType::Ref => write!(f, "ref"),
            StorageType::ByRef => write!(f, "byref"),
            StorageType::Float32 => write!(f, "float"),
            StorageType::Float64 => write!(f, "double"),
        }
    }
}

/// The small set of kinds a spill temp can have.
///
/// Every storage type is normalized to one of these before a temp is
/// requested, so that temps can be shared between values of compatible types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TempKind {
    Int32,
    Int64,
    Ref,
    ByRef,
    Float32,
    Float64,
}

impl TempKind {
    /// Normalize a storage type to the temp kind used to spill it.
    ///
    /// When `long_uses_reg_pair` is set a 64-bit integer is spilled one
    /// register (one half) at a time, so it normalizes to `Int32`.
    pub fn normalize(ty: StorageType, long_uses_reg_pair: bool) -> Self {
        match ty {
            StorageType::Ref => TempKind::Ref,
            StorageType::ByRef => TempKind::ByRef,
            StorageType::Float32 => TempKind::Float32,
            StorageType::Float64 => TempKind::Float64,
            StorageType::Int64 if !long_uses_reg_pair => TempKind::Int64,
            StorageType::Int8 | StorageType::Int16 | StorageType::Int32 | StorageType::Int64 => {
                TempKind::Int32
            }
        }
    }

    pub fn size(&self, pointer_size: u32) -> u32 {
        self.storage_type().size(pointer_size)
    }

    /// The type used to load or store a temp of this kind
    pub fn storage_type(&self) -> StorageType {
        match self {
            TempKind::Int32 => StorageType::Int32,
            TempKind::Int64 => StorageType::Int64,
            TempKind::Ref => StorageType::Ref,
            TempKind::ByRef => StorageType::ByRef,
            TempKind::Float32 => StorageType::Float32,
            TempKind::Float64 => StorageType::Float64,
        }
    }
}

impl fmt::Display for TempKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.storage_type().fmt(f)
    }
}

/// What the content tracker needs to know about a local variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDesc {
    pub id: LocalId,
    pub ty: StorageType,
    /// The local's address escapes, so its memory can change behind our back
    #[serde(default)]
    pub addr_exposed: bool,
    /// The local is enregistered for its whole lifetime
    #[serde(default)]
    pub is_register: bool,
    /// Small local that must be widened on every load
    #[serde(default)]
    pub normalize_on_load: bool,
}

impl LocalDesc {
    pub fn new(id: LocalId, ty: StorageType) -> Self {
        Self {
            id,
            ty,
            addr_exposed: false,
            is_register: false,
            normalize_on_load: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_normalize_keeps_pointer_kinds() {
        assert_eq!(TempKind::normalize(StorageType::Ref, true), TempKind::Ref);
        assert_eq!(TempKind::normalize(StorageType::ByRef, false), TempKind::ByRef);
    }

    #[test]
    fn test_normalize_small_ints() {
        for ty in [StorageType::Int8, StorageType::Int16, StorageType::Int32] {
            assert_eq!(TempKind::normalize(ty, false), TempKind::Int32);
        }
    }

    #[test]
    fn test_normalize_long_depends_on_pairs() {
        assert_eq!(TempKind::normalize(StorageType::Int64, true), TempKind::Int32);
        assert_eq!(TempKind::normalize(StorageType::Int64, false), TempKind::Int64);
    }

    #[test]
    fn test_pointer_sized_temps() {
        assert_eq!(TempKind::Ref.size(4), 4);
        assert_eq!(TempKind::Ref.size(8), 8);
        assert_eq!(TempKind::Float64.size(4), 8);
    }

    #[test]
    fn test_display() {
        assert_eq!(ValueId(7).to_string(), "v7");
        assert_eq!(LocalId(3).to_string(), "V03");
        assert_eq!(TempId(1).to_string(), "#1");
        assert_eq!(TempKind::Float64.to_string(), "double");
    }
}
