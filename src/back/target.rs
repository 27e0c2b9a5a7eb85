//! Target machine descriptions.
//!
//! A [Target] bundles the register file and calling-convention facts that
//! the earlier passes need (word size, argument registers, special
//! registers), and a [CodeGen] implementation that does the
//! target-specific work: instruction selection, spill loads and stores,
//! prologue/epilogue and section syntax.

use crate::back::assem::Instr;
use crate::common::Map;
use crate::middle::fragment::Fragment;
use crate::middle::frame::Frame;
use crate::middle::temp::{PtrDispo, Temp, TempState};
use crate::middle::tree::Stm;

pub const fn machine_reg(id: u32) -> Temp {
    Temp {
        id,
        size: 8,
        dispo: PtrDispo::NotPtr,
    }
}

pub struct Target {
    pub name: &'static str,
    pub word_size: usize,
    pub stack_alignment: usize,
    /// Registers that carry the first arguments, in convention order.
    pub arg_registers: &'static [Temp],
    pub callee_saves: &'static [Temp],
    pub caller_saves: &'static [Temp],
    pub sp: Temp,
    pub fp: Temp,
    pub ret0: Temp,
    pub ret1: Temp,
    /// Register names indexed by machine temp id; doubles as the
    /// allocator's colour palette.
    pub registers: &'static [&'static str],
    /// Prepended to global symbol names (`_` under macOS conventions).
    pub label_prefix: &'static str,
    pub comment_prefix: &'static str,
    pub backend: &'static dyn CodeGen,
}

impl Target {
    /// The precolouring: each machine register temp mapped to its name.
    pub fn temp_map(&self) -> Map<u32, &'static str> {
        self.registers
            .iter()
            .enumerate()
            .map(|(i, name)| (i as u32, *name))
            .collect()
    }

    pub fn is_machine_reg(&self, temp: Temp) -> bool {
        (temp.id as usize) < self.registers.len()
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target").field("name", &self.name).finish()
    }
}

/// Instruction selection output for one canonical statement.
pub struct MunchedStm {
    pub instrs: Vec<Instr>,
    /// Call-site pointer maps keyed by the fresh return labels emitted
    /// right after each call.
    pub frame_maps: Vec<Fragment>,
}

pub trait CodeGen: Sync {
    /// Maximal-munch tile one statement of canonical IR.
    fn codegen(&self, ts: &mut TempState, frame: &mut Frame, stm: &Stm) -> MunchedStm;

    /// Append the sink instruction marking the registers that are live
    /// out of the function (special registers, callee-saves, returns).
    fn proc_entry_exit_2(&self, frame: &Frame, body: &mut Vec<Instr>);

    /// The function's prologue and epilogue text.
    fn proc_entry_exit_3(&self, frame: &Frame) -> (String, String);

    /// A load from a spill slot, inserted before a use.
    fn load_temp(&self, offset: i32, temp: Temp) -> Instr;

    /// A store to a spill slot, inserted after a def.
    fn store_temp(&self, offset: i32, temp: Temp) -> Instr;

    /// The register's name when accessed at the given operand size.
    fn register_for_size(&self, regname: &str, size: usize) -> String;

    fn text_segment_header(&self) -> &'static str;
    fn string_section_header(&self) -> &'static str;
    fn data_section_header(&self) -> &'static str;
}

// ---------------------------------------------------------------------
// arm64 (macOS conventions)
// ---------------------------------------------------------------------

static ARM64_ARG_REGS: [Temp; 8] = [
    machine_reg(0),
    machine_reg(1),
    machine_reg(2),
    machine_reg(3),
    machine_reg(4),
    machine_reg(5),
    machine_reg(6),
    machine_reg(7),
];

static ARM64_CALLEE_SAVES: [Temp; 10] = [
    machine_reg(19),
    machine_reg(20),
    machine_reg(21),
    machine_reg(22),
    machine_reg(23),
    machine_reg(24),
    machine_reg(25),
    machine_reg(26),
    machine_reg(27),
    machine_reg(28),
];

// On Apple platforms x18 is reserved, so it is not in this list; the
// sink instruction keeps it live instead.
static ARM64_CALLER_SAVES: [Temp; 10] = [
    machine_reg(8),
    machine_reg(9),
    machine_reg(10),
    machine_reg(11),
    machine_reg(12),
    machine_reg(13),
    machine_reg(14),
    machine_reg(15),
    machine_reg(16),
    machine_reg(17),
];

static ARM64_REGISTERS: [&str; 32] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "fp", "x30", "sp",
];

pub static TARGET_ARM64: Target = Target {
    name: "arm64",
    word_size: 8,
    stack_alignment: 16,
    arg_registers: &ARM64_ARG_REGS,
    callee_saves: &ARM64_CALLEE_SAVES,
    caller_saves: &ARM64_CALLER_SAVES,
    sp: machine_reg(31),
    fp: machine_reg(29),
    ret0: machine_reg(0),
    ret1: machine_reg(1),
    registers: &ARM64_REGISTERS,
    label_prefix: "_",
    comment_prefix: ";",
    backend: &crate::back::arm64::Arm64,
};

// ---------------------------------------------------------------------
// x86-64 (GAS syntax, Linux)
// ---------------------------------------------------------------------

static X86_64_ARG_REGS: [Temp; 6] = [
    machine_reg(7), // rdi
    machine_reg(6), // rsi
    machine_reg(2), // rdx
    machine_reg(1), // rcx
    machine_reg(8), // r8
    machine_reg(9), // r9
];

static X86_64_CALLEE_SAVES: [Temp; 5] = [
    machine_reg(3),  // rbx
    machine_reg(12), // r12
    machine_reg(13), // r13
    machine_reg(14), // r14
    machine_reg(15), // r15
];

static X86_64_CALLER_SAVES: [Temp; 2] = [
    machine_reg(10), // r10
    machine_reg(11), // r11
];

static X86_64_REGISTERS: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

pub static TARGET_X86_64: Target = Target {
    name: "x86_64",
    word_size: 8,
    stack_alignment: 16,
    arg_registers: &X86_64_ARG_REGS,
    callee_saves: &X86_64_CALLEE_SAVES,
    caller_saves: &X86_64_CALLER_SAVES,
    sp: machine_reg(4), // rsp
    fp: machine_reg(5), // rbp
    ret0: machine_reg(0), // rax
    ret1: machine_reg(2), // rdx
    registers: &X86_64_REGISTERS,
    label_prefix: "",
    comment_prefix: "#",
    backend: &crate::back::x86_64::X86_64,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn palette_indices_match_machine_temp_ids() {
        assert_eq!(TARGET_X86_64.registers[TARGET_X86_64.fp.id as usize], "rbp");
        assert_eq!(TARGET_X86_64.registers[TARGET_X86_64.sp.id as usize], "rsp");
        assert_eq!(TARGET_ARM64.registers[TARGET_ARM64.fp.id as usize], "fp");
        assert_eq!(TARGET_ARM64.registers[TARGET_ARM64.sp.id as usize], "sp");
        assert_eq!(
            TARGET_X86_64.registers[TARGET_X86_64.arg_registers[0].id as usize],
            "rdi"
        );
    }

    #[test]
    fn temp_map_covers_the_whole_register_file() {
        let map = TARGET_ARM64.temp_map();
        assert_eq!(map.len(), 32);
        assert_eq!(map[&29], "fp");
        let map = TARGET_X86_64.temp_map();
        assert_eq!(map.len(), 16);
        assert_eq!(map[&0], "rax");
    }
}
