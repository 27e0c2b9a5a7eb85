//! The x86-64 (GAS syntax, Linux) instruction selector and emitter.
//!
//! Useful references
//! - <https://web.stanford.edu/class/cs107/guide/x86-64.html>

use log::debug;
use smallvec::smallvec;

use crate::back::assem::{Instr, TempVec};
use crate::back::target::{CodeGen, MunchedStm, TARGET_X86_64};
use crate::common::round_up;
use crate::middle::fragment::Fragment;
use crate::middle::frame::Frame;
use crate::middle::temp::{Label, Temp, TempState};
use crate::middle::tree::{Exp, Relop, Stm, TreeBinop};

pub struct X86_64;

const WORD_SIZE: usize = 8;

fn fp() -> Temp {
    TARGET_X86_64.fp
}

fn sp() -> Temp {
    TARGET_X86_64.sp
}

fn rax() -> Temp {
    TARGET_X86_64.ret0
}

fn rdx() -> Temp {
    TARGET_X86_64.ret1
}

fn rcx() -> Temp {
    crate::back::target::machine_reg(1)
}

/// Registers a called function will or is allowed to trash.
fn calldefs() -> TempVec {
    let mut c = TempVec::new();
    c.extend(TARGET_X86_64.caller_saves.iter().copied());
    c.push(rax());
    c.extend(
        TARGET_X86_64
            .arg_registers
            .iter()
            .map(|r| r.with_size(WORD_SIZE)),
    );
    c
}

/// The AT&T mnemonic suffix for an operand width.
fn suff(size: usize) -> &'static str {
    match size {
        8 => "q",
        4 => "l",
        2 => "w",
        1 => "b",
        other => panic!("invalid operand size {}", other),
    }
}

struct Muncher<'a> {
    ts: &'a mut TempState,
    frame: &'a mut Frame,
    instrs: Vec<Instr>,
    frame_maps: Vec<Fragment>,
}

impl Muncher<'_> {
    fn emit(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }

    fn new_temp_for(&mut self, exp: &Exp) -> Temp {
        self.ts.new_temp(exp.size(), exp.dispo())
    }

    fn munch_exp(&mut self, exp: &Exp) -> Temp {
        assert!(exp.size() <= 16);
        match exp {
            Exp::Mem { addr, .. } => {
                assert!(exp.size() <= 8);
                if let Exp::BinOp {
                    op: TreeBinop::Plus,
                    lhs,
                    rhs,
                } = &**addr
                {
                    // MEM(BINOP(+, e1, CONST))
                    if let Exp::Const { value, .. } = &**rhs {
                        let r = self.new_temp_for(exp);
                        let base = self.munch_exp(lhs);
                        self.emit(Instr::oper(
                            format!("mov{} {}(`s0), `d0\n", suff(exp.size()), value),
                            smallvec![r],
                            smallvec![base],
                        ));
                        return r;
                    }
                    // MEM(BINOP(+, CONST, e1))
                    if let Exp::Const { value, .. } = &**lhs {
                        let r = self.new_temp_for(exp);
                        let base = self.munch_exp(rhs);
                        self.emit(Instr::oper(
                            format!("mov{} {}(`s0), `d0\n", suff(exp.size()), value),
                            smallvec![r],
                            smallvec![base],
                        ));
                        return r;
                    }
                }

                // MEM(e1)
                let r = self.new_temp_for(exp);
                let base = self.munch_exp(addr);
                self.emit(Instr::oper(
                    format!("mov{} (`s0), `d0\n", suff(exp.size())),
                    smallvec![r],
                    smallvec![base],
                ));
                r
            }
            Exp::BinOp { op, lhs, rhs } => self.munch_binop(exp, *op, lhs, rhs),
            Exp::Const { value, .. } => {
                assert!(exp.size() <= 8);
                let r = self.new_temp_for(exp);
                self.emit(Instr::oper(
                    format!("mov{} ${}, `d0\n", suff(exp.size()), value),
                    smallvec![r],
                    smallvec![],
                ));
                r
            }
            Exp::Temp { temp, .. } => {
                assert!(temp.size <= 8);
                *temp
            }
            Exp::Name { label, .. } => {
                // a label pointing at data
                let r = self.new_temp_for(exp);
                self.emit(Instr::oper(
                    format!("leaq {}(%rip), `d0\n", label),
                    smallvec![r],
                    smallvec![],
                ));
                r
            }
            Exp::Call {
                func,
                args,
                size,
                ptr_map,
                ..
            } => {
                assert!(*size <= 8, "larger call results are not implemented");
                match &**func {
                    Exp::Name { label, .. } => {
                        let srcs = self.munch_args(0, args);
                        self.emit(Instr::oper(
                            format!("call {}\n", label),
                            calldefs(),
                            srcs,
                        ));
                    }
                    // indirect call
                    func => {
                        let mut srcs: TempVec = smallvec![self.munch_exp(func)];
                        srcs.extend(self.munch_args(0, args));
                        self.emit(Instr::oper("callq *`s0\n", calldefs(), srcs));
                    }
                }

                // key the call-site frame map by a label naming this
                // return address
                let ret_label = self.ts.prefixed_label("ret");
                self.emit(Instr::label(ret_label));
                self.frame_maps.push(Fragment::FrameMap {
                    map: ptr_map.clone(),
                    ret_label,
                });

                rax().with_size(*size)
            }
            Exp::ESeq { .. } => unreachable!("eseqs should no longer exist"),
        }
    }

    /// Two-address arithmetic: copy the left operand into the result
    /// register, then operate in place.  The copy is a `Move`, so
    /// coalescing usually deletes it.
    fn munch_binop(&mut self, exp: &Exp, op: TreeBinop, lhs: &Exp, rhs: &Exp) -> Temp {
        let size = exp.size();
        match op {
            TreeBinop::Plus => {
                // BINOP(+, e1, CONST)
                if let Exp::Const { value, .. } = rhs {
                    let r = self.new_temp_for(exp);
                    let lhs_t = self.munch_exp(lhs);
                    self.emit(Instr::mv(
                        format!("mov{} `s0, `d0\n", suff(size)),
                        r,
                        lhs_t,
                    ));
                    // the result register is read as well as written
                    self.emit(Instr::oper(
                        format!("add{} ${}, `d0\n", suff(size), value),
                        smallvec![r],
                        smallvec![r],
                    ));
                    return r;
                }
                self.two_address(exp, "add", lhs, rhs)
            }
            TreeBinop::Minus => self.two_address(exp, "sub", lhs, rhs),
            TreeBinop::Mul => self.two_address(exp, "imul", lhs, rhs),
            TreeBinop::Div => {
                // division fixes rdx:rax:
                //   rax <- rdx:rax / rhs ; rdx <- rdx:rax mod rhs
                // so clear rdx and record rax and rdx as both sources and
                // destinations
                let rhs_t = self.munch_exp(rhs);
                let rax_s = rax().with_size(size);
                let lhs_t = self.munch_exp(lhs);
                self.emit(Instr::mv(
                    format!("mov{} `s0, `d0\n", suff(size)),
                    rax_s,
                    lhs_t,
                ));
                self.emit(Instr::oper(
                    "xorq `s0, `d0\n",
                    smallvec![rdx()],
                    smallvec![rdx()],
                ));
                self.emit(Instr::oper(
                    format!("idiv{} `s0\n", suff(size)),
                    smallvec![rax_s, rdx()],
                    smallvec![rhs_t, rax_s, rdx()],
                ));
                // move the result out of rax again to keep it free
                let r = self.new_temp_for(exp);
                self.emit(Instr::mv(
                    format!("mov{} `s0, `d0\n", suff(size)),
                    r,
                    rax_s,
                ));
                r
            }
            TreeBinop::And => self.two_address(exp, "and", lhs, rhs),
            TreeBinop::Or => self.two_address(exp, "or", lhs, rhs),
            TreeBinop::Xor => self.two_address(exp, "xor", lhs, rhs),
            TreeBinop::LShift | TreeBinop::RShift | TreeBinop::ARShift => {
                let mnemonic = match op {
                    TreeBinop::LShift => "shl",
                    TreeBinop::RShift => "shr",
                    _ => "sar",
                };
                let r = self.new_temp_for(exp);
                // shift counts are immediates or the cl register
                if let Exp::Const { value, .. } = rhs {
                    let lhs_t = self.munch_exp(lhs);
                    self.emit(Instr::mv(
                        format!("mov{} `s0, `d0\n", suff(size)),
                        r,
                        lhs_t,
                    ));
                    self.emit(Instr::oper(
                        format!("{}{} ${}, `d0\n", mnemonic, suff(size), value),
                        smallvec![r],
                        smallvec![r],
                    ));
                } else {
                    let lhs_t = self.munch_exp(lhs);
                    self.emit(Instr::mv(
                        format!("mov{} `s0, `d0\n", suff(size)),
                        r,
                        lhs_t,
                    ));
                    let rhs_t = self.munch_exp(rhs);
                    let cl = rcx().with_size(1);
                    self.emit(Instr::mv(
                        format!("mov{} `s0, `d0\n", suff(rhs.size())),
                        rcx().with_size(rhs.size()),
                        rhs_t,
                    ));
                    self.emit(Instr::oper(
                        format!("{}{} `s0, `d0\n", mnemonic, suff(size)),
                        smallvec![r],
                        smallvec![cl, r],
                    ));
                }
                r
            }
        }
    }

    fn two_address(&mut self, exp: &Exp, mnemonic: &str, lhs: &Exp, rhs: &Exp) -> Temp {
        let size = exp.size();
        let r = self.new_temp_for(exp);
        let lhs_t = self.munch_exp(lhs);
        self.emit(Instr::mv(
            format!("mov{} `s0, `d0\n", suff(size)),
            r,
            lhs_t,
        ));
        let rhs_t = self.munch_exp(rhs);
        // the result register is read as well as written
        self.emit(Instr::oper(
            format!("{}{} `s0, `d0\n", mnemonic, suff(size)),
            smallvec![r],
            smallvec![rhs_t, r],
        ));
        r
    }

    fn munch_args(&mut self, arg_idx: usize, args: &[Exp]) -> TempVec {
        let Some((first, rest)) = args.split_first() else {
            return TempVec::new();
        };
        if arg_idx < TARGET_X86_64.arg_registers.len() {
            assert!(
                first.size() <= WORD_SIZE,
                "larger arguments are not implemented"
            );
            let param_reg = TARGET_X86_64.arg_registers[arg_idx].with_size(first.size());
            let src = self.munch_exp(first);
            self.emit(Instr::mv(
                format!("mov{} `s0, `d0\n", suff(first.size())),
                param_reg,
                src,
            ));
            let mut used = self.munch_args(arg_idx + 1, rest);
            used.insert(0, param_reg);
            used
        } else {
            self.munch_stack_args(args);
            TempVec::new()
        }
    }

    fn munch_stack_args(&mut self, args: &[Exp]) {
        let mut total = 0usize;
        for e in args {
            assert!(
                e.size() <= WORD_SIZE,
                "larger stack arguments are not implemented"
            );
            total = round_up(total, e.size());
            let src = self.munch_exp(e);
            self.emit(Instr::oper(
                format!("mov{} `s0, {}(`s1)\n", suff(e.size()), total),
                smallvec![],
                smallvec![src, sp()],
            ));
            total += e.size();
        }
        let total = round_up(total, TARGET_X86_64.stack_alignment);
        self.frame.reserve_outgoing_arg_space(total);
    }

    fn munch_stm(&mut self, stm: &Stm) {
        match stm {
            Stm::Seq(s1, s2) => {
                self.munch_stm(s1);
                self.munch_stm(s2);
            }
            Stm::Move { dst, src } => self.munch_move(dst, src),
            Stm::Label(label) => self.emit(Instr::label(*label)),
            Stm::Exp(e) => {
                // non-calls in statement position have no effect and are
                // dropped
                if !matches!(**e, Exp::Call { .. }) {
                    debug!("dropping dead code: {}", stm);
                    return;
                }
                self.munch_exp(e);
            }
            Stm::CJump { op, lhs, rhs, t, f } => self.munch_cjump(*op, lhs, rhs, *t, *f),
            Stm::Jump { labels, .. } => {
                assert_eq!(labels.len(), 1, "computed jumps are not implemented");
                self.emit(Instr::oper_jump(
                    format!("jmp {}\n", labels[0]),
                    smallvec![],
                    smallvec![],
                    vec![labels[0]],
                ));
            }
        }
    }

    fn munch_move(&mut self, dst: &Exp, src: &Exp) {
        match dst {
            Exp::Mem { addr, .. } => self.munch_store(addr, src),
            Exp::Temp { temp, .. } => {
                // movq $7, %rax
                if let Exp::Const { value, .. } = src {
                    if temp.size == 0 {
                        debug!("dropping zero-size move of {}", src);
                        return;
                    }
                    self.emit(Instr::oper(
                        format!("mov{} ${}, `d0\n", suff(src.size()), value),
                        smallvec![*temp],
                        smallvec![],
                    ));
                    return;
                }
                // movq %rbx, %rax
                let src_t = self.munch_exp(src);
                if src_t.size == 0 || temp.size == 0 {
                    debug!("dropping zero-size move of {}", src);
                    return;
                }
                debug_assert_eq!(src_t.size, temp.size);
                self.emit(Instr::mv(
                    format!("mov{} `s0, `d0\n", suff(src.size())),
                    *temp,
                    src_t,
                ));
            }
            _ => panic!("move into neither memory nor register"),
        }
    }

    fn munch_store(&mut self, addr: &Exp, src: &Exp) {
        if let Exp::BinOp { op, lhs, rhs } = addr {
            assert_eq!(*op, TreeBinop::Plus, "unexpected binop in mem");
            // MOVE(MEM(BINOP(+, e1, BINOP(*, e2, CONST scale))), e3)
            if let Exp::BinOp {
                op: TreeBinop::Mul,
                lhs: index,
                rhs: scale,
            } = &**rhs
            {
                if let Exp::Const { value, .. } = &**scale {
                    if matches!(value, 1 | 2 | 4 | 8) {
                        let base_t = self.munch_exp(lhs);
                        let index_t = self.munch_exp(index);
                        let src_t = self.munch_exp(src);
                        self.emit(Instr::oper(
                            format!("mov{} `s2, (`s0,`s1,{})\n", suff(src.size()), value),
                            smallvec![],
                            smallvec![base_t, index_t, src_t],
                        ));
                        return;
                    }
                }
            }
            // MOVE(MEM(BINOP(+, e1, CONST)), e2)
            if let Exp::Const { value, .. } = &**rhs {
                let base_t = self.munch_exp(lhs);
                let src_t = self.munch_exp(src);
                self.emit(Instr::oper(
                    format!("mov{} `s1, {}(`s0)\n", suff(src.size()), value),
                    smallvec![],
                    smallvec![base_t, src_t],
                ));
                return;
            }
            // MOVE(MEM(BINOP(+, CONST, e1)), e2)
            if let Exp::Const { value, .. } = &**lhs {
                let base_t = self.munch_exp(rhs);
                let src_t = self.munch_exp(src);
                self.emit(Instr::oper(
                    format!("mov{} `s1, {}(`s0)\n", suff(src.size()), value),
                    smallvec![],
                    smallvec![base_t, src_t],
                ));
                return;
            }
            // MOVE(MEM(BINOP(+, e1, e2)), e3)
            let base_t = self.munch_exp(lhs);
            let index_t = self.munch_exp(rhs);
            let src_t = self.munch_exp(src);
            self.emit(Instr::oper(
                format!("mov{} `s2, (`s0,`s1,1)\n", suff(src.size())),
                smallvec![],
                smallvec![base_t, index_t, src_t],
            ));
            return;
        }
        if matches!(addr, Exp::Const { .. }) {
            panic!("store to a constant address is not implemented");
        }
        // MOVE(MEM(e1), e2)
        let base_t = self.munch_exp(addr);
        let src_t = self.munch_exp(src);
        self.emit(Instr::oper(
            format!("mov{} `s1, (`s0)\n", suff(src.size())),
            smallvec![],
            smallvec![base_t, src_t],
        ));
    }

    fn munch_cjump(&mut self, op: Relop, lhs: &Exp, rhs: &Exp, t: Label, f: Label) {
        // CJUMP(op, MEM(BINOP(+, e1, CONST)), e2, ..)
        let handled = 'cmp: {
            if let Exp::Mem { addr, .. } = lhs {
                if let Exp::BinOp {
                    op: TreeBinop::Plus,
                    lhs: base,
                    rhs: disp,
                } = &**addr
                {
                    if let Exp::Const { value, .. } = &**disp {
                        let base_t = self.munch_exp(base);
                        let rhs_t = self.munch_exp(rhs);
                        self.emit(Instr::oper(
                            format!("cmp{} `s1, {}(`s0)\n", suff(lhs.size()), value),
                            smallvec![],
                            smallvec![base_t, rhs_t],
                        ));
                        break 'cmp true;
                    }
                }
            }
            // CJUMP(op, e1, CONST, ..)
            if let Exp::Const { value, .. } = rhs {
                let lhs_t = self.munch_exp(lhs);
                self.emit(Instr::oper(
                    format!("cmp{} ${}, `s0\n", suff(rhs.size()), value),
                    smallvec![],
                    smallvec![lhs_t],
                ));
                break 'cmp true;
            }
            // CJUMP(==, CONST, e1, ..): the constant is on the wrong side
            // for x86, but equality does not care
            if matches!(op, Relop::Eq | Relop::Ne) {
                if let Exp::Const { value, .. } = lhs {
                    let rhs_t = self.munch_exp(rhs);
                    self.emit(Instr::oper(
                        format!("cmp{} ${}, `s0\n", suff(lhs.size()), value),
                        smallvec![],
                        smallvec![rhs_t],
                    ));
                    break 'cmp true;
                }
            }
            false
        };
        if !handled {
            // CJUMP(op, e1, e2, ..)
            let lhs_t = self.munch_exp(lhs);
            let rhs_t = self.munch_exp(rhs);
            self.emit(Instr::oper(
                format!("cmp{} `s1, `s0\n", suff(lhs.size())),
                smallvec![],
                smallvec![lhs_t, rhs_t],
            ));
        }

        let cond = match op {
            Relop::Eq => "je",
            Relop::Ne => "jne",
            Relop::Gt => "jg",
            Relop::Ge => "jge",
            Relop::Lt => "jl",
            Relop::Le => "jle",
            Relop::Ult => "jb",
            Relop::Ule => "jbe",
            Relop::Ugt => "ja",
            Relop::Uge => "jae",
        };
        self.emit(Instr::oper_jump(
            format!("{} {}\n", cond, t),
            smallvec![],
            smallvec![],
            vec![t, f],
        ));
    }
}

impl CodeGen for X86_64 {
    fn codegen(&self, ts: &mut TempState, frame: &mut Frame, stm: &Stm) -> MunchedStm {
        let mut muncher = Muncher {
            ts,
            frame,
            instrs: Vec::new(),
            frame_maps: Vec::new(),
        };
        muncher.munch_stm(stm);
        MunchedStm {
            instrs: muncher.instrs,
            frame_maps: muncher.frame_maps,
        }
    }

    fn proc_entry_exit_2(&self, frame: &Frame, body: &mut Vec<Instr>) {
        let mut src: TempVec = TempVec::new();
        src.extend(TARGET_X86_64.callee_saves.iter().copied());
        src.push(sp());
        src.push(fp());
        src.push(frame.target.ret0.with_size(WORD_SIZE));
        src.push(frame.target.ret1.with_size(WORD_SIZE));
        body.push(Instr::oper_jump("\n", smallvec![], src, vec![]));
    }

    fn proc_entry_exit_3(&self, frame: &Frame) -> (String, String) {
        let name = frame.name;
        let frame_size = frame.frame_words() * WORD_SIZE;
        let prologue = format!(
            "\t.globl\t{name}\n\
             \t.p2align\t4, 0x90\n\
             \t.type\t{name},@function\n\
             {name}:\n\
             \t.cfi_startproc\n\
             \tpushq\t%rbp\n\
             \tmovq\t%rsp, %rbp\n\
             \tsubq\t${frame_size}, %rsp\n"
        );
        let epilogue = format!(
            "\taddq\t${frame_size}, %rsp\n\
             \tpopq\t%rbp\n\
             \tretq\n\
             \t.cfi_endproc\n"
        );
        (prologue, epilogue)
    }

    fn load_temp(&self, offset: i32, temp: Temp) -> Instr {
        Instr::oper(
            format!("mov{} {}(`s0), `d0\t# unspill\n", suff(temp.size), offset),
            smallvec![temp],
            smallvec![fp()],
        )
    }

    fn store_temp(&self, offset: i32, temp: Temp) -> Instr {
        Instr::oper(
            format!("mov{} `s1, {}(`s0)\t# spill\n", suff(temp.size), offset),
            smallvec![],
            smallvec![fp(), temp],
        )
    }

    fn register_for_size(&self, regname: &str, size: usize) -> String {
        static REGISTERS_8BIT: [&str; 16] = [
            "%al", "%cl", "%dl", "%bl", "%spl", "%bpl", "%sil", "%dil", "%r8b", "%r9b", "%r10b",
            "%r11b", "%r12b", "%r13b", "%r14b", "%r15b",
        ];
        static REGISTERS_16BIT: [&str; 16] = [
            "%ax", "%cx", "%dx", "%bx", "%sp", "%bp", "%si", "%di", "%r8w", "%r9w", "%r10w",
            "%r11w", "%r12w", "%r13w", "%r14w", "%r15w",
        ];
        static REGISTERS_32BIT: [&str; 16] = [
            "%eax", "%ecx", "%edx", "%ebx", "%esp", "%ebp", "%esi", "%edi", "%r8d", "%r9d",
            "%r10d", "%r11d", "%r12d", "%r13d", "%r14d", "%r15d",
        ];
        static REGISTERS_64BIT: [&str; 16] = [
            "%rax", "%rcx", "%rdx", "%rbx", "%rsp", "%rbp", "%rsi", "%rdi", "%r8", "%r9", "%r10",
            "%r11", "%r12", "%r13", "%r14", "%r15",
        ];
        let table = match size {
            1 => &REGISTERS_8BIT,
            2 => &REGISTERS_16BIT,
            4 => &REGISTERS_32BIT,
            8 => &REGISTERS_64BIT,
            other => panic!("invalid operand size {}", other),
        };
        let index = TARGET_X86_64
            .registers
            .iter()
            .position(|name| *name == regname)
            .unwrap_or_else(|| panic!("unexpected register name {}", regname));
        table[index].to_string()
    }

    fn text_segment_header(&self) -> &'static str {
        "\t.text\n"
    }

    fn string_section_header(&self) -> &'static str {
        "\n\t.section\t.rodata\n"
    }

    fn data_section_header(&self) -> &'static str {
        "\n\t.data\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::assem::format_instr;
    use crate::middle::temp::PtrDispo;
    use crate::middle::tree::{ty_int, ty_ptr, ty_void};

    fn munch(stm: &Stm) -> Vec<Instr> {
        let mut ts = TempState::new();
        let mut frame = Frame::new(crate::common::id("f"), &TARGET_X86_64);
        X86_64.codegen(&mut ts, &mut frame, stm).instrs
    }

    fn fmt(instrs: &[Instr]) -> String {
        instrs
            .iter()
            .map(|i| format_instr(i, &TARGET_X86_64.temp_map(), &TARGET_X86_64))
            .collect()
    }

    #[test]
    fn division_pins_rax_and_rdx() {
        let mut ts = TempState::new();
        let a = ts.new_temp(4, PtrDispo::NotPtr);
        let b = ts.new_temp(4, PtrDispo::NotPtr);
        let c = ts.new_temp(4, PtrDispo::NotPtr);
        let stm = Stm::Move {
            dst: Box::new(Exp::Temp {
                temp: c,
                ty: ty_int(),
            }),
            src: Box::new(Exp::BinOp {
                op: TreeBinop::Div,
                lhs: Box::new(Exp::Temp {
                    temp: a,
                    ty: ty_int(),
                }),
                rhs: Box::new(Exp::Temp {
                    temp: b,
                    ty: ty_int(),
                }),
            }),
        };
        let instrs = munch(&stm);
        let idiv = instrs
            .iter()
            .find_map(|i| match i {
                Instr::Oper { asm, dst, src, .. } if asm.starts_with("idiv") => Some((dst, src)),
                _ => None,
            })
            .expect("an idiv instruction");
        // rax and rdx are both read and written
        assert!(idiv.0.contains(&rax()) && idiv.0.contains(&rdx()));
        assert!(idiv.1.contains(&rax()) && idiv.1.contains(&rdx()));
        let text = fmt(&instrs);
        assert!(text.contains("xorq %rdx, %rdx"), "rdx must be cleared: {text}");
    }

    #[test]
    fn scaled_index_store_tiles_to_one_mov() {
        let mut ts = TempState::new();
        let base = ts.new_temp(8, PtrDispo::Ptr);
        let index = ts.new_temp(8, PtrDispo::NotPtr);
        let value = ts.new_temp(8, PtrDispo::NotPtr);
        let stm = Stm::Move {
            dst: Box::new(Exp::Mem {
                addr: Box::new(Exp::BinOp {
                    op: TreeBinop::Plus,
                    lhs: Box::new(Exp::Temp {
                        temp: base,
                        ty: ty_ptr(ty_void()),
                    }),
                    rhs: Box::new(Exp::BinOp {
                        op: TreeBinop::Mul,
                        lhs: Box::new(Exp::Temp {
                            temp: index,
                            ty: ty_int(),
                        }),
                        rhs: Box::new(Exp::Const {
                            value: 8,
                            size: 8,
                            ty: ty_int(),
                        }),
                    }),
                }),
                size: 8,
                ty: ty_int(),
            }),
            src: Box::new(Exp::Temp {
                temp: value,
                ty: ty_int(),
            }),
        };
        let instrs = munch(&stm);
        assert_eq!(instrs.len(), 1);
        let Instr::Oper { asm, .. } = &instrs[0] else {
            panic!("expected one store");
        };
        assert!(asm.contains("(`s0,`s1,8)"), "scaled addressing: {asm}");
    }

    #[test]
    fn comparison_against_reversed_constant() {
        let mut ts = TempState::new();
        let t = ts.new_temp(8, PtrDispo::NotPtr);
        let stm = Stm::CJump {
            op: Relop::Ne,
            lhs: Box::new(Exp::Const {
                value: 0,
                size: 8,
                ty: ty_int(),
            }),
            rhs: Box::new(Exp::Temp {
                temp: t,
                ty: ty_int(),
            }),
            t: crate::common::id("Lt"),
            f: crate::common::id("Lf"),
        };
        let instrs = munch(&stm);
        let text = fmt(&instrs);
        assert!(text.contains("cmpq $0"), "constant folds into cmp: {text}");
        assert!(text.contains("jne Lt"), "branch on the true label: {text}");
    }

    #[test]
    fn sized_register_names() {
        assert_eq!(X86_64.register_for_size("rax", 8), "%rax");
        assert_eq!(X86_64.register_for_size("rax", 4), "%eax");
        assert_eq!(X86_64.register_for_size("rax", 1), "%al");
        assert_eq!(X86_64.register_for_size("r12", 4), "%r12d");
        assert_eq!(X86_64.register_for_size("rdi", 2), "%di");
    }
}
