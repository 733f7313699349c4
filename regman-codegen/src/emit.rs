//! Listing output for recorded spill code

use crate::asm::AsmInst;
use crate::target::Target;

/// Render instructions one per line, using the target's register names
pub fn emit_listing(insts: &[AsmInst], target: &Target) -> String {
    let mut out = String::new();
    for inst in insts {
        let line = match inst {
            AsmInst::Spill { reg, temp, ty } => {
                format!("    STORE.{} {}, [{}]", ty, target.reg_name(*reg), temp)
            }
            AsmInst::Reload { reg, temp, ty } => {
                format!("    LOAD.{} {}, [{}]", ty, target.reg_name(*reg), temp)
            }
            other => format!("    {}", other),
        };
        out.push_str(&line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use regman_common::{StorageType, TempId};

    #[test]
    fn test_listing_uses_register_names() {
        let target = Target::x86();
        let edx = target.reg("edx").unwrap();
        let insts = vec![
            AsmInst::FrameSize(4),
            AsmInst::Spill { reg: edx, temp: TempId(1), ty: StorageType::Int32 },
            AsmInst::Reload { reg: edx, temp: TempId(1), ty: StorageType::Int32 },
        ];

        assert_eq!(
            emit_listing(&insts, &target),
            "    ; spill area now 4 bytes\n    STORE.int32 edx, [#1]\n    LOAD.int32 edx, [#1]\n"
        );
    }
}
