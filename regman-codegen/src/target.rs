//! Register universe descriptions
//!
//! A `Target` is the configuration the register manager is parameterized
//! over: which registers exist and in which class, which are reserved or
//! callee-saved, the order in which registers are preferred, and how
//! two-register pairs are formed. Targets are loaded from a serde
//! `TargetConfig` (JSON) or taken from one of the built-in presets.
//!
//! Register ordinals are assigned in declaration order: integer registers
//! first, then float registers.

use crate::asm::{Reg, RegPair};
use crate::regmask::{AnyReg, Fpr, Gpr, RegClass, RegMask, MAX_REGS};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Unknown register `{0}`")]
    UnknownRegister(String),

    #[error("Register `{0}` is declared more than once")]
    DuplicateRegister(String),

    #[error("Too many registers: {0} (maximum: {MAX_REGS})")]
    TooManyRegisters(usize),

    #[error("Register `{reg}` is not a {class} register")]
    WrongClass { reg: String, class: &'static str },

    #[error("Reserved register `{0}` appears in a preference order")]
    ReservedInOrder(String),

    #[error("Stack pointer `{0}` must be reserved")]
    StackPointerNotReserved(String),

    #[error("Integer preference order is empty")]
    EmptyIntOrder,

    #[error("Unsupported pointer size: {0} bytes")]
    InvalidPointerSize(u32),

    #[error("Unknown target preset `{0}`")]
    UnknownPreset(String),

    #[error("Invalid target description: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How to choose among registers that hold a constant close to the one wanted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseConstantPolicy {
    /// First register whose difference fits a signed byte immediate
    #[default]
    ByteDelta,
    /// Register with the smallest absolute difference
    Smallest,
}

/// How candidate register pairs are ordered for a wide value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairStrategy {
    /// For each preferred first register, its partners in order
    Fixed(Vec<(Reg, Vec<Reg>)>),
    /// Every two-register combination of the integer preference order,
    /// earlier registers first
    Symmetric,
}

impl PairStrategy {
    /// Candidate pairs drawn from `allowed`, best first, each with the lower
    /// ordinal in `lo`
    pub fn candidates(&self, allowed: RegMask<Gpr>, tmp_order: &[Reg]) -> Vec<RegPair> {
        let mut pairs = Vec::new();
        match self {
            PairStrategy::Fixed(table) => {
                for (first, partners) in table {
                    if !allowed.contains(*first) {
                        continue;
                    }
                    for partner in partners {
                        if allowed.contains(*partner) {
                            pairs.push(RegPair::ordered(*first, *partner));
                        }
                    }
                }
            }
            PairStrategy::Symmetric => {
                for (i, &first) in tmp_order.iter().enumerate() {
                    if !allowed.contains(first) {
                        continue;
                    }
                    for &second in &tmp_order[i + 1..] {
                        if allowed.contains(second) {
                            pairs.push(RegPair::ordered(first, second));
                        }
                    }
                }
            }
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairPreference {
    pub first: String,
    pub partners: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PairStrategyConfig {
    Fixed { table: Vec<PairPreference> },
    Symmetric,
}

/// Serialized form of a target description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub int_regs: Vec<String>,
    #[serde(default)]
    pub float_regs: Vec<String>,
    #[serde(default)]
    pub reserved: Vec<String>,
    #[serde(default)]
    pub callee_saved: Vec<String>,
    pub int_tmp_order: Vec<String>,
    #[serde(default)]
    pub float_tmp_order: Vec<String>,
    pub stack_pointer: String,
    #[serde(default)]
    pub frame_pointer: Option<String>,
    pub pointer_size: u32,
    #[serde(default)]
    pub long_uses_reg_pair: bool,
    pub pair_strategy: PairStrategyConfig,
    #[serde(default)]
    pub close_constants: CloseConstantPolicy,
    #[serde(default)]
    pub align_double_temps: bool,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl TargetConfig {
    pub fn from_json(text: &str) -> Result<Self, TargetError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Description of a built-in preset, by name
    pub fn preset(name: &str) -> Result<Self, TargetError> {
        match name {
            "x86" => Ok(Self::x86()),
            "arm32" => Ok(Self::arm32()),
            _ => Err(TargetError::UnknownPreset(name.to_string())),
        }
    }

    /// 32-bit x86: six allocatable integer registers, register pairs for longs
    pub fn x86() -> Self {
        let partners = |first: &str, rest: &[&str]| PairPreference {
            first: first.to_string(),
            partners: names(rest),
        };
        TargetConfig {
            name: "x86".to_string(),
            int_regs: names(&["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"]),
            float_regs: names(&["xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7"]),
            reserved: names(&["esp"]),
            callee_saved: names(&["ebx", "ebp", "esi", "edi"]),
            int_tmp_order: names(&["eax", "edx", "ecx", "ebx", "esi", "edi"]),
            float_tmp_order: names(&["xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7"]),
            stack_pointer: "esp".to_string(),
            frame_pointer: Some("ebp".to_string()),
            pointer_size: 4,
            long_uses_reg_pair: true,
            pair_strategy: PairStrategyConfig::Fixed {
                table: vec![
                    partners("eax", &["edx", "ecx", "ebx", "esi", "edi", "ebp"]),
                    partners("ecx", &["edx", "ebx", "esi", "edi", "ebp"]),
                    partners("edx", &["ebx", "esi", "edi", "ebp"]),
                    partners("ebx", &["esi", "edi", "ebp"]),
                    partners("esi", &["edi", "ebp"]),
                    partners("edi", &["ebp"]),
                ],
            },
            close_constants: CloseConstantPolicy::ByteDelta,
            align_double_temps: false,
        }
    }

    /// 32-bit ARM: thirteen allocatable integer registers, symmetric pairing
    pub fn arm32() -> Self {
        let floats: Vec<String> = (0..32).map(|i| format!("f{}", i)).collect();
        let float_tmp_order = [14, 15, 12, 13, 10, 11, 8, 9, 6, 7, 4, 5, 2, 3, 0, 1]
            .into_iter()
            .chain(16..32)
            .map(|i| format!("f{}", i))
            .collect();
        TargetConfig {
            name: "arm32".to_string(),
            int_regs: names(&[
                "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp",
                "lr", "pc",
            ]),
            float_regs: floats,
            reserved: names(&["sp", "pc"]),
            callee_saved: (4..=10)
                .map(|i| format!("r{}", i))
                .chain((16..32).map(|i| format!("f{}", i)))
                .collect(),
            int_tmp_order: names(&[
                "r3", "r2", "r1", "r0", "r4", "r5", "r6", "r7", "lr", "r12", "r8", "r9", "r10",
            ]),
            float_tmp_order,
            stack_pointer: "sp".to_string(),
            frame_pointer: Some("r11".to_string()),
            pointer_size: 4,
            long_uses_reg_pair: true,
            pair_strategy: PairStrategyConfig::Symmetric,
            close_constants: CloseConstantPolicy::Smallest,
            align_double_temps: true,
        }
    }
}

/// Names of the built-in target presets
pub const PRESETS: &[&str] = &["x86", "arm32"];

/// A validated register universe description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    name: String,
    reg_names: Vec<String>,
    int_regs: RegMask,
    float_regs: RegMask,
    reserved: RegMask,
    callee_saved: RegMask,
    int_tmp_order: Vec<Reg>,
    float_tmp_order: Vec<Reg>,
    stack_pointer: Reg,
    frame_pointer: Option<Reg>,
    pointer_size: u32,
    long_uses_reg_pair: bool,
    pair_strategy: PairStrategy,
    close_constants: CloseConstantPolicy,
    align_double_temps: bool,
}

impl Target {
    pub fn from_config(config: &TargetConfig) -> Result<Self, TargetError> {
        let total = config.int_regs.len() + config.float_regs.len();
        if total > MAX_REGS {
            return Err(TargetError::TooManyRegisters(total));
        }
        if !matches!(config.pointer_size, 4 | 8) {
            return Err(TargetError::InvalidPointerSize(config.pointer_size));
        }

        let mut by_name = HashMap::new();
        let mut reg_names = Vec::with_capacity(total);
        for name in config.int_regs.iter().chain(&config.float_regs) {
            let reg = Reg::new(reg_names.len() as u8);
            if by_name.insert(name.clone(), reg).is_some() {
                return Err(TargetError::DuplicateRegister(name.clone()));
            }
            reg_names.push(name.clone());
        }

        let lookup = |name: &String| -> Result<Reg, TargetError> {
            by_name
                .get(name)
                .copied()
                .ok_or_else(|| TargetError::UnknownRegister(name.clone()))
        };
        let lookup_all = |list: &[String]| -> Result<Vec<Reg>, TargetError> {
            list.iter().map(lookup).collect()
        };

        let int_regs: RegMask = (0..config.int_regs.len()).map(|i| Reg::new(i as u8)).collect();
        let float_regs: RegMask = (config.int_regs.len()..total)
            .map(|i| Reg::new(i as u8))
            .collect();
        let reserved = RegMask::from_regs(&lookup_all(config.reserved.as_slice())?);
        let callee_saved = RegMask::from_regs(&lookup_all(config.callee_saved.as_slice())?);

        let check_order = |order: &[Reg], class: RegMask, class_name: &'static str| {
            for &reg in order {
                let name = &reg_names[reg.index()];
                if !class.contains(reg) {
                    return Err(TargetError::WrongClass {
                        reg: name.clone(),
                        class: class_name,
                    });
                }
                if reserved.contains(reg) {
                    return Err(TargetError::ReservedInOrder(name.clone()));
                }
            }
            Ok(())
        };

        let int_tmp_order = lookup_all(config.int_tmp_order.as_slice())?;
        if int_tmp_order.is_empty() {
            return Err(TargetError::EmptyIntOrder);
        }
        check_order(&int_tmp_order, int_regs, Gpr::NAME)?;
        let float_tmp_order = lookup_all(config.float_tmp_order.as_slice())?;
        check_order(&float_tmp_order, float_regs, Fpr::NAME)?;

        let stack_pointer = lookup(&config.stack_pointer)?;
        if !int_regs.contains(stack_pointer) {
            return Err(TargetError::WrongClass {
                reg: config.stack_pointer.clone(),
                class: Gpr::NAME,
            });
        }
        if !reserved.contains(stack_pointer) {
            return Err(TargetError::StackPointerNotReserved(config.stack_pointer.clone()));
        }
        let frame_pointer = config.frame_pointer.as_ref().map(lookup).transpose()?;

        let pair_strategy = match &config.pair_strategy {
            PairStrategyConfig::Symmetric => PairStrategy::Symmetric,
            PairStrategyConfig::Fixed { table } => {
                let mut rows = Vec::with_capacity(table.len());
                for row in table {
                    let first = lookup(&row.first)?;
                    let partners = lookup_all(row.partners.as_slice())?;
                    for &reg in partners.iter().chain(std::iter::once(&first)) {
                        if !int_regs.contains(reg) {
                            return Err(TargetError::WrongClass {
                                reg: reg_names[reg.index()].clone(),
                                class: Gpr::NAME,
                            });
                        }
                    }
                    rows.push((first, partners));
                }
                PairStrategy::Fixed(rows)
            }
        };

        debug!(
            "Target {}: {} integer and {} float registers",
            config.name,
            int_regs.count(),
            float_regs.count()
        );

        Ok(Target {
            name: config.name.clone(),
            reg_names,
            int_regs,
            float_regs,
            reserved,
            callee_saved,
            int_tmp_order,
            float_tmp_order,
            stack_pointer,
            frame_pointer,
            pointer_size: config.pointer_size,
            long_uses_reg_pair: config.long_uses_reg_pair,
            pair_strategy,
            close_constants: config.close_constants,
            align_double_temps: config.align_double_temps,
        })
    }

    pub fn x86() -> Self {
        Self::from_config(&TargetConfig::x86()).expect("built-in x86 description is valid")
    }

    pub fn arm32() -> Self {
        Self::from_config(&TargetConfig::arm32()).expect("built-in arm32 description is valid")
    }

    pub fn preset(name: &str) -> Result<Self, TargetError> {
        Self::from_config(&TargetConfig::preset(name)?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn universe_size(&self) -> usize {
        self.reg_names.len()
    }

    /// Look a register up by name
    pub fn reg(&self, name: &str) -> Option<Reg> {
        self.reg_names
            .iter()
            .position(|n| n == name)
            .map(|i| Reg::new(i as u8))
    }

    pub fn reg_name(&self, reg: Reg) -> &str {
        self.reg_names
            .get(reg.index())
            .map(String::as_str)
            .unwrap_or("<invalid>")
    }

    /// Mask with register names, for log messages and listings
    pub fn fmt_mask<C: RegClass>(&self, mask: RegMask<C>) -> String {
        let names: Vec<&str> = mask.iter().map(|r| self.reg_name(r)).collect();
        format!("{{{}}}", names.join(" "))
    }

    pub fn all_regs(&self) -> RegMask {
        self.int_regs | self.float_regs
    }

    pub fn int_regs(&self) -> RegMask<Gpr> {
        RegMask::from_bits(self.int_regs.bits())
    }

    pub fn float_regs(&self) -> RegMask<Fpr> {
        RegMask::from_bits(self.float_regs.bits())
    }

    pub fn is_float(&self, reg: Reg) -> bool {
        self.float_regs.contains(reg)
    }

    /// Registers never handed out by the allocator
    pub fn reserved(&self) -> RegMask {
        self.reserved
    }

    pub fn callee_saved(&self) -> RegMask {
        self.callee_saved
    }

    pub fn int_tmp_order(&self) -> &[Reg] {
        &self.int_tmp_order
    }

    pub fn float_tmp_order(&self) -> &[Reg] {
        &self.float_tmp_order
    }

    pub fn stack_pointer(&self) -> Reg {
        self.stack_pointer
    }

    pub fn frame_pointer(&self) -> Option<Reg> {
        self.frame_pointer
    }

    pub fn pointer_size(&self) -> u32 {
        self.pointer_size
    }

    /// 64-bit integers live in two registers
    pub fn long_uses_reg_pair(&self) -> bool {
        self.long_uses_reg_pair
    }

    pub fn pair_strategy(&self) -> &PairStrategy {
        &self.pair_strategy
    }

    pub fn close_constants(&self) -> CloseConstantPolicy {
        self.close_constants
    }

    /// Double temps carry an extra pointer-sized word for alignment
    pub fn align_double_temps(&self) -> bool {
        self.align_double_temps
    }

    /// Mask of class `C` built from `regs`, rejecting registers of another class
    pub fn class_mask<C: RegClass>(&self, regs: &[Reg]) -> Result<RegMask<C>, TargetError> {
        let members = C::members(self);
        for &reg in regs {
            if !members.contains(reg) {
                return Err(TargetError::WrongClass {
                    reg: self.reg_name(reg).to_string(),
                    class: C::NAME,
                });
            }
        }
        Ok(RegMask::<AnyReg>::from_regs(regs).restrict(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_x86_layout() {
        let target = Target::x86();
        let eax = target.reg("eax").unwrap();
        let edx = target.reg("edx").unwrap();

        assert_eq!(target.universe_size(), 16);
        assert_eq!(target.int_tmp_order()[0], eax);
        assert_eq!(target.int_tmp_order()[1], edx);
        assert!(target.reserved().contains(target.stack_pointer()));
        assert!(target.is_float(target.reg("xmm3").unwrap()));
        assert!(target.callee_saved().contains(target.reg("ebp").unwrap()));
        assert_eq!(target.fmt_mask(eax.mask() | edx.mask()), "{eax edx}");
    }

    #[test]
    fn test_x86_pair_table_order() {
        let target = Target::x86();
        let pairs = target
            .pair_strategy()
            .candidates(target.int_regs(), target.int_tmp_order());
        let named: Vec<String> = pairs
            .iter()
            .map(|p| format!("{}-{}", target.reg_name(p.lo()), target.reg_name(p.hi())))
            .collect();

        assert_eq!(pairs.len(), 21);
        assert_eq!(&named[..3], &["eax-edx", "eax-ecx", "eax-ebx"]);
        assert_eq!(named.last().map(String::as_str), Some("ebp-edi"));
    }

    #[test]
    fn test_symmetric_pairs_are_canonical() {
        let target = Target::arm32();
        let pairs = target
            .pair_strategy()
            .candidates(target.int_regs(), target.int_tmp_order());

        // r3 is the first preference, r2 the second
        assert_eq!(pairs[0], RegPair::ordered(target.reg("r2").unwrap(), target.reg("r3").unwrap()));
        assert!(pairs.iter().all(|p| p.lo() < p.hi()));
    }

    #[test]
    fn test_unknown_register_rejected() {
        let mut config = TargetConfig::x86();
        config.reserved.push("r99".to_string());
        let err = Target::from_config(&config).unwrap_err();
        assert!(matches!(err, TargetError::UnknownRegister(name) if name == "r99"));
    }

    #[test]
    fn test_reserved_register_in_order_rejected() {
        let mut config = TargetConfig::x86();
        config.int_tmp_order.push("esp".to_string());
        assert!(matches!(
            Target::from_config(&config),
            Err(TargetError::ReservedInOrder(_))
        ));
    }

    #[test]
    fn test_float_in_int_order_rejected() {
        let mut config = TargetConfig::x86();
        config.int_tmp_order.push("xmm0".to_string());
        assert!(matches!(
            Target::from_config(&config),
            Err(TargetError::WrongClass { class: "integer", .. })
        ));
    }

    #[test]
    fn test_stack_pointer_must_be_reserved() {
        let mut config = TargetConfig::x86();
        config.reserved.clear();
        assert!(matches!(
            Target::from_config(&config),
            Err(TargetError::StackPointerNotReserved(_))
        ));
    }

    #[test]
    fn test_config_json_roundtrip_loads() {
        let json = serde_json::to_string(&TargetConfig::arm32()).unwrap();
        let config = TargetConfig::from_json(&json).unwrap();
        let target = Target::from_config(&config).unwrap();
        assert_eq!(target, Target::arm32());
    }

    #[test]
    fn test_class_mask_checks_class() {
        let target = Target::x86();
        let eax = target.reg("eax").unwrap();
        let xmm0 = target.reg("xmm0").unwrap();

        assert_eq!(target.class_mask::<Gpr>(&[eax]).unwrap().count(), 1);
        assert!(target.class_mask::<Gpr>(&[xmm0]).is_err());
        assert!(target.class_mask::<Fpr>(&[xmm0]).is_ok());
    }
}
