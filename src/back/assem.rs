//! Abstract assembly instructions.
//!
//! Instructions carry a textual template with back-tick placeholders:
//! `` `s0 ``/`` `d0 `` name the Nth source or destination temp.
//! Formatting substitutes the allocated register's size-qualified name,
//! or a `tN.size` placeholder before allocation.

use smallvec::SmallVec;

use crate::back::target::Target;
use crate::common::Map;
use crate::middle::temp::{Label, Temp};

/// Operand lists are short: one or two temps usually, the calldefs set at
/// worst.
pub type TempVec = SmallVec<[Temp; 4]>;

/// Register assignment, by temp id.  Before allocation only machine
/// registers are present.
pub type Allocation = Map<u32, &'static str>;

#[derive(Clone, Debug)]
pub enum Instr {
    Oper {
        asm: String,
        dst: TempVec,
        src: TempVec,
        /// `None` falls through; `Some(labels)` transfers control only to
        /// the listed labels (possibly none, for the sink instruction).
        jump: Option<Vec<Label>>,
    },
    Label {
        asm: String,
        label: Label,
    },
    /// A register-to-register copy, kept apart so coalescing can try to
    /// delete it.
    Move {
        asm: String,
        dst: Temp,
        src: Temp,
    },
}

impl Instr {
    pub fn oper(asm: impl Into<String>, dst: TempVec, src: TempVec) -> Instr {
        Instr::Oper {
            asm: asm.into(),
            dst,
            src,
            jump: None,
        }
    }

    pub fn oper_jump(
        asm: impl Into<String>,
        dst: TempVec,
        src: TempVec,
        jump: Vec<Label>,
    ) -> Instr {
        Instr::Oper {
            asm: asm.into(),
            dst,
            src,
            jump: Some(jump),
        }
    }

    pub fn label(label: Label) -> Instr {
        Instr::Label {
            asm: format!("{label}:\n"),
            label,
        }
    }

    pub fn mv(asm: impl Into<String>, dst: Temp, src: Temp) -> Instr {
        Instr::Move {
            asm: asm.into(),
            dst,
            src,
        }
    }
}

fn format_temp(out: &mut String, t: Temp, allocation: &Allocation, target: &Target) {
    match allocation.get(&t.id) {
        Some(regname) => out.push_str(&target.backend.register_for_size(regname, t.size)),
        None => out.push_str(&format!("t{}.{}", t.id, t.size)),
    }
}

/// Render one instruction with its temps substituted.
pub fn format_instr(instr: &Instr, allocation: &Allocation, target: &Target) -> String {
    match instr {
        Instr::Label { asm, .. } => asm.clone(),
        Instr::Oper { asm, dst, src, .. } => {
            format_template(asm, dst.as_slice(), src.as_slice(), allocation, target)
        }
        Instr::Move { asm, dst, src } => format_template(
            asm,
            std::slice::from_ref(dst),
            std::slice::from_ref(src),
            allocation,
            target,
        ),
    }
}

fn format_template(
    asm: &str,
    dst: &[Temp],
    src: &[Temp],
    allocation: &Allocation,
    target: &Target,
) -> String {
    let mut out = String::with_capacity(asm.len() + 16);
    out.push('\t');
    let mut chars = asm.chars();
    while let Some(c) = chars.next() {
        if c != '`' {
            out.push(c);
            continue;
        }
        let s_or_d = chars.next().expect("placeholder kind");
        let idx = chars
            .next()
            .and_then(|d| d.to_digit(10))
            .expect("placeholder index") as usize;
        let t = match s_or_d {
            's' => src[idx],
            'd' => dst[idx],
            other => panic!("bad placeholder `{other}"),
        };
        format_temp(&mut out, t, allocation, target);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::target::TARGET_X86_64;
    use crate::middle::temp::{PtrDispo, TempState};
    use smallvec::smallvec;

    #[test]
    fn substitutes_allocated_registers_by_size() {
        let mut ts = TempState::new();
        let t = ts.new_temp(4, PtrDispo::NotPtr);
        let instr = Instr::oper("movl `s0, `d0\n", smallvec![t], smallvec![TARGET_X86_64.ret0.with_size(4)]);
        let mut allocation = Allocation::new();
        allocation.insert(TARGET_X86_64.ret0.id, "rax");
        allocation.insert(t.id, "rbx");
        let text = format_instr(&instr, &allocation, &TARGET_X86_64);
        assert_eq!(text, "\tmovl %eax, %ebx\n");
    }

    #[test]
    fn unallocated_temps_print_as_placeholders() {
        let mut ts = TempState::new();
        let t = ts.new_temp(8, PtrDispo::NotPtr);
        let instr = Instr::oper("pushq `s0\n", smallvec![], smallvec![t]);
        let text = format_instr(&instr, &Allocation::new(), &TARGET_X86_64);
        assert_eq!(text, format!("\tpushq t{}.8\n", t.id));
    }
}
