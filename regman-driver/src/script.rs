//! Allocation scripts
//!
//! A script is a JSON description of one method's worth of register
//! manager calls, the way a code generator would issue them. Replaying it
//! against a target prints the spill code the manager asked for, the
//! answers to content queries, and the frame summary.

use anyhow::{bail, Context, Result};
use log::{debug, info};
use regman_backend::{AllocOptions, KeepReg, MethodSummary, RegisterManager};
use regman_codegen::{
    emit_listing, AllocClass, Fpr, Gpr, RecordingHooks, Reg, RegClass, RegMask, RegPair, Target,
};
use regman_common::{guard, AddrId, LocalDesc, LocalId, StorageType, ValueId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDecl {
    pub id: u32,
    pub ty: StorageType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDecl {
    pub id: u32,
    pub ty: StorageType,
    #[serde(default)]
    pub addr_exposed: bool,
    #[serde(default)]
    pub is_register: bool,
}

impl LocalDecl {
    fn desc(&self) -> LocalDesc {
        LocalDesc {
            addr_exposed: self.addr_exposed,
            is_register: self.is_register,
            ..LocalDesc::new(LocalId(self.id), self.ty)
        }
    }
}

fn keep_default() -> bool {
    true
}

/// One register manager call. Registers are given by name; an empty
/// register list means "any register of the value's class".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// Pick a register for `value` and bind it
    Alloc {
        value: u32,
        #[serde(default)]
        regs: Vec<String>,
        #[serde(default)]
        best: Vec<String>,
    },
    /// Grab a register from `regs` for `value`, evicting if needed
    Grab {
        value: u32,
        #[serde(default)]
        regs: Vec<String>,
    },
    MarkUsed {
        value: u32,
        reg: String,
        #[serde(default)]
        addr: Option<u32>,
    },
    Free { regs: Vec<String> },
    FreeValue { value: u32, reg: String },
    Spill { reg: String },
    SpillRegs { regs: Vec<String> },
    Reload {
        value: u32,
        #[serde(default)]
        regs: Vec<String>,
        #[serde(default = "keep_default")]
        keep: bool,
    },
    /// Use a spilled value straight from its temp
    UseInPlace { value: u32 },
    Lock { regs: Vec<String> },
    Unlock { regs: Vec<String> },
    SetVars { regs: Vec<String> },
    AllocPair {
        value: u32,
        #[serde(default)]
        regs: Vec<String>,
    },
    ReloadPair {
        value: u32,
        lo: String,
        hi: String,
        #[serde(default = "keep_default")]
        keep: bool,
    },
    NoteConstant { reg: String, value: i64 },
    NoteLocal { reg: String, local: u32 },
    StoreLocal { reg: String, local: u32 },
    FindConstant { value: i64 },
    FindLocal { local: u32 },
    /// A call clobbers `regs`
    Call { regs: Vec<String> },
    Label,
    Safepoint,
    Comment { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub method: String,
    #[serde(default)]
    pub options: AllocOptions,
    #[serde(default)]
    pub values: Vec<ValueDecl>,
    #[serde(default)]
    pub locals: Vec<LocalDecl>,
    pub ops: Vec<Op>,
}

impl Script {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid allocation script")
    }

    fn local(&self, id: u32) -> Result<LocalDesc> {
        match self.locals.iter().find(|l| l.id == id) {
            Some(local) => Ok(local.desc()),
            None => bail!("local V{:02} is not declared", id),
        }
    }
}

/// Result of replaying a script
#[derive(Debug)]
pub struct Replay {
    pub listing: String,
    pub summary: MethodSummary,
}

struct Session<'a> {
    script: &'a Script,
    manager: RegisterManager<RecordingHooks>,
    /// `was_used` masks of outstanding `lock` ops, innermost last
    locks: Vec<(RegMask, RegMask)>,
}

impl Session<'_> {
    fn reg(&self, name: &str) -> Result<Reg> {
        match self.manager.target().reg(name) {
            Some(reg) => Ok(reg),
            None => bail!("unknown register `{}`", name),
        }
    }

    fn regs(&self, names: &[String]) -> Result<Vec<Reg>> {
        names.iter().map(|name| self.reg(name)).collect()
    }

    fn mask(&self, names: &[String]) -> Result<RegMask> {
        Ok(RegMask::from_regs(&self.regs(names)?))
    }

    fn class_mask<C: RegClass>(&self, names: &[String]) -> Result<RegMask<C>> {
        Ok(self.manager.target().class_mask::<C>(&self.regs(names)?)?)
    }

    fn is_float(&self, value: u32) -> Result<bool> {
        match self.script.values.iter().find(|v| v.id == value) {
            Some(decl) => Ok(decl.ty.is_float()),
            None => bail!("value v{} is not declared", value),
        }
    }

    fn keep(keep: bool) -> KeepReg {
        if keep {
            KeepReg::Keep
        } else {
            KeepReg::Free
        }
    }

    fn alloc<C: AllocClass>(&mut self, value: ValueId, regs: &[String], best: &[String]) -> Result<Reg> {
        let mask = self.class_mask::<C>(regs)?;
        let best = self.class_mask::<C>(best)?;
        let reg = self.manager.pick_reg(mask, best);
        self.manager.mark_used(value, reg, None);
        Ok(reg)
    }

    fn grab<C: AllocClass>(&mut self, value: ValueId, regs: &[String]) -> Result<Reg> {
        let mask = self.class_mask::<C>(regs)?.or_if_empty(self.manager.allocatable::<C>());
        let reg = self.manager.grab(mask);
        self.manager.mark_used(value, reg, None);
        Ok(reg)
    }

    fn reload<C: AllocClass>(&mut self, value: ValueId, regs: &[String], keep: bool) -> Result<Reg> {
        let need = self.class_mask::<C>(regs)?;
        Ok(self.manager.reload(value, need, Self::keep(keep)))
    }

    fn note(&mut self, text: String) {
        debug!("{}", text);
        self.manager.hooks_mut().comment(text);
    }

    fn apply(&mut self, op: &Op) -> Result<()> {
        match op {
            Op::Alloc { value, regs, best } => {
                let id = ValueId(*value);
                let reg = if self.is_float(*value)? {
                    self.alloc::<Fpr>(id, regs, best)?
                } else {
                    self.alloc::<Gpr>(id, regs, best)?
                };
                let name = self.manager.target().reg_name(reg).to_string();
                self.note(format!("{} <- {}", name, id));
            }
            Op::Grab { value, regs } => {
                let id = ValueId(*value);
                let reg = if self.is_float(*value)? {
                    self.grab::<Fpr>(id, regs)?
                } else {
                    self.grab::<Gpr>(id, regs)?
                };
                let name = self.manager.target().reg_name(reg).to_string();
                self.note(format!("{} <- {}", name, id));
            }
            Op::MarkUsed { value, reg, addr } => {
                let reg = self.reg(reg)?;
                self.manager.mark_used(ValueId(*value), reg, addr.map(AddrId));
            }
            Op::Free { regs } => {
                let mask = self.mask(regs)?;
                self.manager.mark_free(mask);
            }
            Op::FreeValue { value, reg } => {
                let reg = self.reg(reg)?;
                self.manager.mark_value_free(reg, ValueId(*value));
            }
            Op::Spill { reg } => {
                let reg = self.reg(reg)?;
                self.manager.spill_reg(reg);
            }
            Op::SpillRegs { regs } => {
                let mask = self.mask(regs)?;
                self.manager.spill_regs(mask);
            }
            Op::Reload { value, regs, keep } => {
                let id = ValueId(*value);
                let reg = if self.is_float(*value)? {
                    self.reload::<Fpr>(id, regs, *keep)?
                } else {
                    self.reload::<Gpr>(id, regs, *keep)?
                };
                let name = self.manager.target().reg_name(reg).to_string();
                self.note(format!("{} reloaded into {}", id, name));
            }
            Op::UseInPlace { value } => {
                let temp = self.manager.unspill_in_place(ValueId(*value));
                self.note(format!("v{} used from {}", value, temp));
                self.manager.release_temp(temp);
            }
            Op::Lock { regs } => {
                let mask = self.mask(regs)?;
                let was_used = self.manager.lock(mask);
                self.locks.push((mask, was_used));
            }
            Op::Unlock { regs } => {
                let mask = self.mask(regs)?;
                match self.locks.pop() {
                    Some((locked, was_used)) if locked == mask => self.manager.unlock(mask, was_used),
                    Some((locked, _)) => bail!(
                        "unlock of {} but the innermost lock is {}",
                        self.manager.target().fmt_mask(mask),
                        self.manager.target().fmt_mask(locked)
                    ),
                    None => bail!("unlock without a matching lock"),
                }
            }
            Op::SetVars { regs } => {
                let mask = self.mask(regs)?;
                self.manager.set_vars(mask);
            }
            Op::AllocPair { value, regs } => {
                let mask = self.class_mask::<Gpr>(regs)?;
                let pair = self.manager.pick_reg_pair(mask);
                self.manager.mark_pair_used(ValueId(*value), pair);
                let target = self.manager.target();
                let text = format!(
                    "{}:{} <- v{}",
                    target.reg_name(pair.lo()),
                    target.reg_name(pair.hi()),
                    value
                );
                self.note(text);
            }
            Op::ReloadPair { value, lo, hi, keep } => {
                let old = RegPair::halves(self.reg(lo)?, self.reg(hi)?);
                let pair = self
                    .manager
                    .reload_pair(ValueId(*value), old, RegMask::empty(), Self::keep(*keep));
                let target = self.manager.target();
                let text = format!(
                    "v{} reloaded into {}:{}",
                    value,
                    target.reg_name(pair.lo()),
                    target.reg_name(pair.hi())
                );
                self.note(text);
            }
            Op::NoteConstant { reg, value } => {
                let reg = self.reg(reg)?;
                self.manager.note_constant(reg, *value);
            }
            Op::NoteLocal { reg, local } => {
                let reg = self.reg(reg)?;
                let local = self.script.local(*local)?;
                self.manager.note_local(reg, &local);
            }
            Op::StoreLocal { reg, local } => {
                let reg = self.reg(reg)?;
                let local = self.script.local(*local)?;
                self.manager.trash_local(local.id);
                self.manager.note_store(reg, &local);
            }
            Op::FindConstant { value } => {
                let text = match self.manager.find_close_constant(*value) {
                    Some((reg, 0)) => format!("constant {} is in {}", value, self.manager.target().reg_name(reg)),
                    Some((reg, delta)) => format!(
                        "constant {} is {} {:+}",
                        value,
                        self.manager.target().reg_name(reg),
                        delta
                    ),
                    None => format!("constant {} not in any register", value),
                };
                self.note(text);
            }
            Op::FindLocal { local } => {
                let desc = self.script.local(*local)?;
                let text = match self.manager.find_local(&desc) {
                    Some(reg) => format!("{} is in {}", desc.id, self.manager.target().reg_name(reg)),
                    None => format!("{} not in any register", desc.id),
                };
                self.note(text);
            }
            Op::Call { regs } => {
                let mask = self.mask(regs)?;
                self.manager.trash_reg_set(mask);
            }
            Op::Label => self.manager.clear_contents(),
            Op::Safepoint => {
                let trashed = self.manager.safepoint();
                if !trashed.is_empty() {
                    let text = format!("safepoint drops {}", self.manager.target().fmt_mask(trashed));
                    self.note(text);
                }
            }
            Op::Comment { text } => self.note(text.clone()),
        }
        Ok(())
    }
}

/// Run every op of `script` against a fresh register manager for `target`
pub fn replay(script: &Script, target: Target) -> Result<Replay> {
    let mut hooks = RecordingHooks::new();
    for decl in &script.values {
        hooks.define(ValueId(decl.id), decl.ty);
    }
    let mut manager = RegisterManager::new(target, script.options, hooks);
    manager.begin_method(&script.method, script.options);
    info!("Replaying {} ops of {} on {}", script.ops.len(), script.method, manager.target().name());

    let mut session = Session {
        script,
        manager,
        locks: Vec::new(),
    };
    for (index, op) in script.ops.iter().enumerate() {
        debug!("op {}: {:?}", index + 1, op);
        guard(|| session.apply(op))
            .map_err(anyhow::Error::from)
            .and_then(|result| result)
            .with_context(|| format!("op {} of {} failed", index + 1, script.method))?;
    }

    let summary = session.manager.finish_method()?;
    let listing = emit_listing(session.manager.hooks().instructions(), session.manager.target());
    Ok(Replay { listing, summary })
}

/// Human-readable frame summary
pub fn format_summary(summary: &MethodSummary, target: &Target) -> String {
    format!(
        "spill area: {} bytes in {} temps\nmodified: {}\ncallee-saved to preserve: {}\n",
        summary.frame_size,
        summary.temp_count,
        target.fmt_mask(summary.modified),
        target.fmt_mask(summary.used_callee_saved)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PRESSURE: &str = include_str!("../scripts/pressure.json");

    #[test]
    fn test_parse_ops() {
        let script = Script::from_json(
            r#"{
                "method": "m",
                "values": [{ "id": 1, "ty": "Int32" }],
                "ops": [
                    { "op": "alloc", "value": 1 },
                    { "op": "reload", "value": 1, "keep": false },
                    { "op": "label" }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(script.options, AllocOptions::default());
        assert_eq!(
            script.ops,
            vec![
                Op::Alloc {
                    value: 1,
                    regs: vec![],
                    best: vec![]
                },
                Op::Reload {
                    value: 1,
                    regs: vec![],
                    keep: false
                },
                Op::Label,
            ]
        );
    }

    #[test]
    fn test_replay_pressure_script() {
        let script = Script::from_json(PRESSURE).unwrap();
        let replay = replay(&script, Target::x86()).unwrap();
        assert!(replay.listing.contains("STORE.int32 eax, [#1]"));
        assert!(replay.listing.contains("LOAD.int32"));
        assert!(replay.listing.contains("; constant 1004 is ecx +4"));
        assert_eq!(replay.summary.frame_size, 4);
    }

    #[test]
    fn test_replay_reports_failing_op() {
        let script = Script::from_json(
            r#"{
                "method": "broken",
                "values": [{ "id": 1, "ty": "Int32" }],
                "ops": [
                    { "op": "alloc", "value": 1 },
                    { "op": "free", "regs": ["ecx"] }
                ]
            }"#,
        )
        .unwrap();
        let err = replay(&script, Target::x86()).unwrap_err();
        assert_eq!(err.to_string(), "op 2 of broken failed");
        assert!(format!("{:#}", err).contains("free of ecx which holds no value"));
    }

    #[test]
    fn test_replay_rejects_unknown_register() {
        let script = Script::from_json(
            r#"{ "method": "m", "ops": [{ "op": "spill", "reg": "rax" }] }"#,
        )
        .unwrap();
        let err = replay(&script, Target::x86()).unwrap_err();
        assert!(format!("{:#}", err).contains("unknown register `rax`"));
    }

    #[test]
    fn test_replay_reports_leftovers() {
        let script = Script::from_json(
            r#"{
                "method": "leaky",
                "values": [{ "id": 1, "ty": "Int32" }],
                "ops": [{ "op": "alloc", "value": 1 }]
            }"#,
        )
        .unwrap();
        let err = replay(&script, Target::x86()).unwrap_err();
        assert!(err.to_string().contains("eax still holds v1"));
    }
}
