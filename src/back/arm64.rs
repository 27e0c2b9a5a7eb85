//! The arm64 (macOS conventions) instruction selector and emitter.
//!
//! Useful resources
//! - <https://developer.arm.com/documentation/102374/0101/Overview?lang=en>
//! - <https://modexp.wordpress.com/2018/10/30/arm64-assembly/>

use log::debug;
use smallvec::smallvec;

use crate::back::assem::{Instr, TempVec};
use crate::back::target::{CodeGen, MunchedStm, TARGET_ARM64};
use crate::common::round_up;
use crate::middle::fragment::Fragment;
use crate::middle::frame::Frame;
use crate::middle::temp::{Label, Temp, TempState};
use crate::middle::tree::{Exp, Relop, Stm, TreeBinop};

pub struct Arm64;

const WORD_SIZE: usize = 8;

fn fp() -> Temp {
    TARGET_ARM64.fp
}

fn sp() -> Temp {
    TARGET_ARM64.sp
}

/// Registers a called function is allowed to trash: the caller-saves, the
/// link register, and the argument registers.
fn calldefs() -> TempVec {
    let mut c = TempVec::new();
    c.extend(TARGET_ARM64.caller_saves.iter().copied());
    // the link register is by convention caller saved
    c.push(crate::back::target::machine_reg(30));
    c.extend(
        TARGET_ARM64
            .arg_registers
            .iter()
            .map(|r| r.with_size(WORD_SIZE)),
    );
    c
}

/// Mnemonic suffix selecting the operand width; word and half-word sizes
/// are carried by the w-register form instead.
fn suff(size: usize) -> &'static str {
    match size {
        8 | 4 => "",
        2 => "h",
        1 => "b",
        other => panic!("invalid operand size {}", other),
    }
}

/// Immediates in arithmetic instructions are shifted 16-bit values; we
/// only use the unshifted range.
fn can_be_immediate(value: i64) -> bool {
    value < (1 << 15) && value >= -(1 << 15)
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
        match exp {
            Exp::Mem { addr, .. } => {
                // MEM(BINOP(+, e1, CONST))
                if let Exp::BinOp {
                    op: TreeBinop::Plus,
                    lhs,
                    rhs,
                } = &**addr
                {
                    if let Exp::Const { value, .. } = &**rhs {
                        let r = self.new_temp_for(exp);
                        let base = self.munch_exp(lhs);
                        self.emit(Instr::oper(
                            format!("ldr{}\t`d0, [`s0, #{}]\n", suff(exp.size()), value),
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
                    format!("ldr{}\t`d0, [`s0]\n", suff(exp.size())),
                    smallvec![r],
                    smallvec![base],
                ));
                r
            }
            Exp::BinOp { op, lhs, rhs } => {
                // BINOP(+, e1, CONST)
                if *op == TreeBinop::Plus {
                    if let Exp::Const { value, .. } = &**rhs {
                        if can_be_immediate(*value) {
                            let r = self.new_temp_for(exp);
                            let base = self.munch_exp(lhs);
                            self.emit(Instr::oper(
                                format!("add\t`d0, `s0, #{}\n", value),
                                smallvec![r],
                                smallvec![base],
                            ));
                            return r;
                        }
                    }
                }

                // BINOP(op, e1, e2)
                let mnemonic = match op {
                    TreeBinop::Plus => "add",
                    TreeBinop::Minus => "sub",
                    TreeBinop::Mul => "mul",
                    TreeBinop::Div => "sdiv",
                    TreeBinop::And => "and",
                    TreeBinop::Or => "orr",
                    TreeBinop::Xor => "eor",
                    TreeBinop::LShift => "lsl",
                    TreeBinop::RShift => "lsr",
                    TreeBinop::ARShift => "asr",
                };
                let r = self.new_temp_for(exp);
                let lhs = self.munch_exp(lhs);
                let rhs = self.munch_exp(rhs);
                self.emit(Instr::oper(
                    format!("{}\t`d0, `s0, `s1\n", mnemonic),
                    smallvec![r],
                    smallvec![lhs, rhs],
                ));
                r
            }
            Exp::Const { value, .. } => {
                assert!(exp.size() <= 8);
                let r = self.new_temp_for(exp);
                let asm = if can_be_immediate(*value) {
                    format!("mov\t`d0, #{}\n", value)
                } else {
                    format!("ldr\t`d0, ={}\n", value)
                };
                self.emit(Instr::oper(asm, smallvec![r], smallvec![]));
                r
            }
            Exp::Temp { temp, .. } => {
                assert!(temp.size <= 8);
                *temp
            }
            Exp::Name { label, .. } => {
                // a label pointing at data: materialise its page and
                // offset
                let r = self.new_temp_for(exp);
                self.emit(Instr::oper(
                    format!("adrp\t`d0, {}\n", label),
                    smallvec![r],
                    smallvec![],
                ));
                self.emit(Instr::oper(
                    format!("add\t`d0, `s0, :lo12:{}\n", label),
                    smallvec![r],
                    smallvec![r],
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
                let Exp::Name { label, .. } = &**func else {
                    panic!("indirect calls are not implemented");
                };
                let srcs = self.munch_args(0, args);
                self.emit(Instr::oper(
                    format!("bl\t_{}\n", label),
                    calldefs(),
                    srcs,
                ));

                // a label directly after the call keys the call-site
                // frame map: it names this return address
                let ret_label = self.ts.prefixed_label("ret");
                self.emit(Instr::label(ret_label));
                self.frame_maps.push(Fragment::FrameMap {
                    map: ptr_map.clone(),
                    ret_label,
                });

                TARGET_ARM64.ret0.with_size(*size)
            }
            Exp::ESeq { .. } => unreachable!("eseqs should no longer exist"),
        }
    }

    fn munch_args(&mut self, arg_idx: usize, args: &[Exp]) -> TempVec {
        let Some((first, rest)) = args.split_first() else {
            return TempVec::new();
        };
        if arg_idx < TARGET_ARM64.arg_registers.len() {
            assert!(
                first.size() <= WORD_SIZE,
                "larger arguments are not implemented"
            );
            let param_reg = TARGET_ARM64.arg_registers[arg_idx].with_size(first.size());
            let src = self.munch_exp(first);
            self.emit(Instr::mv("mov\t`d0, `s0\n", param_reg, src));
            let mut used = self.munch_args(arg_idx + 1, rest);
            used.insert(0, param_reg);
            used
        } else {
            // remaining arguments go to the outgoing-argument area
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
            // sub-word values align to their own size
            total = round_up(total, e.size());
            let src = self.munch_exp(e);
            self.emit(Instr::oper(
                format!("str{}\t`s0, [`s1, #{}]\n", suff(e.size()), total),
                smallvec![],
                smallvec![src, sp()],
            ));
            total += e.size();
        }
        let total = round_up(total, TARGET_ARM64.stack_alignment);
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
                if !matches!(**e, Exp::Call { .. }) {
                    debug!("dropping dead code: {}", stm);
                    return;
                }
                // move the result into an unused temporary so the result
                // register does not stay live for the rest of the function
                let t = self.new_temp_for(e);
                let r = self.munch_exp(e);
                if t.size > 0 {
                    self.emit(Instr::mv("mov\t`d0, `s0\n", t, r));
                }
            }
            Stm::CJump { op, lhs, rhs, t, f } => self.munch_cjump(*op, lhs, rhs, *t, *f),
            Stm::Jump { labels, .. } => {
                assert_eq!(labels.len(), 1, "computed jumps are not implemented");
                self.emit(Instr::oper_jump(
                    format!("b\t{}\n", labels[0]),
                    smallvec![],
                    smallvec![],
                    vec![labels[0]],
                ));
            }
        }
    }

    fn munch_move(&mut self, dst: &Exp, src: &Exp) {
        match dst {
            Exp::Mem { addr, .. } => {
                // MOVE(MEM(BINOP(+, e1, CONST)), e2)
                if let Exp::BinOp {
                    op: TreeBinop::Plus,
                    lhs,
                    rhs,
                } = &**addr
                {
                    if let Exp::Const { value, .. } = &**rhs {
                        let value_t = self.munch_exp(src);
                        let base = self.munch_exp(lhs);
                        self.emit(Instr::oper(
                            format!("str{}\t`s0, [`s1, #{}]\n", suff(src.size()), value),
                            smallvec![],
                            smallvec![value_t, base],
                        ));
                        return;
                    }
                }

                // MOVE(MEM(e1), e2)
                let value_t = self.munch_exp(src);
                let base = self.munch_exp(addr);
                self.emit(Instr::oper(
                    format!("str{}\t`s0, [`s1]\n", suff(src.size())),
                    smallvec![],
                    smallvec![value_t, base],
                ));
            }
            Exp::Temp { temp, .. } => {
                let src_t = self.munch_exp(src);
                if src_t.size == 0 || temp.size == 0 {
                    debug!("dropping zero-size move: {}", src);
                    return;
                }
                debug_assert_eq!(src_t.size, temp.size);
                self.emit(Instr::mv("mov\t`d0, `s0\n", *temp, src_t));
            }
            _ => panic!("move into neither memory nor register"),
        }
    }

    fn munch_cjump(&mut self, op: Relop, lhs: &Exp, rhs: &Exp, t: Label, f: Label) {
        // compare-with-zero folds into cbz/cbnz
        if matches!(op, Relop::Eq | Relop::Ne) {
            let zero_form = match (lhs, rhs) {
                (Exp::Const { value: 0, .. }, e) => Some(e),
                (e, Exp::Const { value: 0, .. }) => Some(e),
                _ => None,
            };
            if let Some(e) = zero_form {
                let src = self.munch_exp(e);
                let mnemonic = if op == Relop::Eq { "cbz" } else { "cbnz" };
                self.emit(Instr::oper_jump(
                    format!("{}\t`s0, {}\n", mnemonic, t),
                    smallvec![],
                    smallvec![src],
                    vec![t, f],
                ));
                return;
            }
        }

        let lhs_t = self.munch_exp(lhs);
        let rhs_t = self.munch_exp(rhs);
        self.emit(Instr::oper(
            "cmp\t`s0, `s1\n",
            smallvec![],
            smallvec![lhs_t, rhs_t],
        ));

        let cond = match op {
            Relop::Eq => "b.eq",
            Relop::Ne => "b.ne",
            Relop::Gt => "b.gt",
            Relop::Ge => "b.ge",
            Relop::Lt => "b.lt",
            Relop::Le => "b.le",
            Relop::Ult => "b.lo",
            Relop::Ule => "b.ls",
            Relop::Ugt => "b.hi",
            Relop::Uge => "b.hs",
        };
        self.emit(Instr::oper_jump(
            format!("{}\t{}\n", cond, t),
            smallvec![],
            smallvec![],
            vec![t, f],
        ));
    }
}

impl CodeGen for Arm64 {
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
        src.extend(TARGET_ARM64.callee_saves.iter().copied());
        src.push(fp());
        src.push(sp());
        // x18 is reserved on Apple platforms; keeping it live prevents
        // allocation
        src.push(crate::back::target::machine_reg(18));
        src.push(frame.target.ret0.with_size(WORD_SIZE));
        body.push(Instr::oper_jump("\n", smallvec![], src, vec![]));
    }

    fn proc_entry_exit_3(&self, frame: &Frame) -> (String, String) {
        let name = frame.name;
        let frame_size = frame.frame_words() * WORD_SIZE;
        let prologue = format!(
            "\t.globl\t_{name}\n\
             \t.p2align\t2\n\
             _{name}:\n\
             \t.cfi_startproc\n\
             \tstp\tx29, x30, [sp, #-16]!\n\
             \tmov\tfp, sp\n\
             \t.cfi_def_cfa w29, 16\n\
             \t.cfi_offset w30, -8\n\
             \t.cfi_offset w29, -16\n\
             \tsub\tsp, sp, #{frame_size}\n"
        );
        let epilogue = format!(
            "\tadd\tsp, sp, #{frame_size}\n\
             \tldp\tx29, x30, [sp], #16\n\
             \tret\n\
             \t.cfi_endproc\n"
        );
        (prologue, epilogue)
    }

    fn load_temp(&self, offset: i32, temp: Temp) -> Instr {
        Instr::oper(
            format!("ldr{}\t`d0, [`s0, #{}]\t; unspill\n", suff(temp.size), offset),
            smallvec![temp],
            smallvec![fp()],
        )
    }

    fn store_temp(&self, offset: i32, temp: Temp) -> Instr {
        Instr::oper(
            format!("str{}\t`s0, [`s1, #{}]\t; spill\n", suff(temp.size), offset),
            smallvec![],
            smallvec![temp, fp()],
        )
    }

    fn register_for_size(&self, regname: &str, size: usize) -> String {
        debug_assert!(matches!(size, 1 | 2 | 4 | 8));
        if size == 8 || !regname.starts_with('x') {
            regname.to_string()
        } else {
            format!("w{}", &regname[1..])
        }
    }

    fn text_segment_header(&self) -> &'static str {
        "\t.section\t__TEXT,__text,regular,pure_instructions\n"
    }

    fn string_section_header(&self) -> &'static str {
        "\n\t.section\t__TEXT,__cstring,cstring_literals\n"
    }

    fn data_section_header(&self) -> &'static str {
        "\n\t.section\t__DATA,__const\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::assem::format_instr;
    use crate::middle::temp::PtrDispo;
    use crate::middle::tree::{ty_int, ty_ptr, ty_void};

    fn munch(stm: &Stm) -> (Vec<Instr>, TempState) {
        let mut ts = TempState::new();
        let mut frame = Frame::new(crate::common::id("f"), &TARGET_ARM64);
        let munched = Arm64.codegen(&mut ts, &mut frame, stm);
        (munched.instrs, ts)
    }

    fn fmt(instrs: &[Instr]) -> String {
        instrs
            .iter()
            .map(|i| format_instr(i, &TARGET_ARM64.temp_map(), &TARGET_ARM64))
            .collect()
    }

    #[test]
    fn load_with_offset_tiles_to_one_ldr() {
        let mut ts = TempState::new();
        let t = ts.new_temp(8, PtrDispo::NotPtr);
        let stm = Stm::Move {
            dst: Box::new(Exp::Temp {
                temp: t,
                ty: ty_int(),
            }),
            src: Box::new(Exp::Mem {
                addr: Box::new(Exp::BinOp {
                    op: TreeBinop::Plus,
                    lhs: Box::new(Exp::Temp {
                        temp: TARGET_ARM64.fp,
                        ty: ty_ptr(ty_void()),
                    }),
                    rhs: Box::new(Exp::Const {
                        value: -16,
                        size: 8,
                        ty: ty_int(),
                    }),
                }),
                size: 8,
                ty: ty_int(),
            }),
        };
        let (instrs, _) = munch(&stm);
        let text = fmt(&instrs);
        assert!(text.contains("ldr\t"), "no ldr in: {text}");
        assert!(text.contains("[fp, #-16]"), "missing addressing: {text}");
        // one load plus the register move
        assert_eq!(instrs.len(), 2);
    }

    #[test]
    fn comparison_with_zero_uses_cbz() {
        let mut ts = TempState::new();
        let t = ts.new_temp(8, PtrDispo::NotPtr);
        let (l_t, l_f) = (crate::common::id("Lt"), crate::common::id("Lf"));
        let stm = Stm::CJump {
            op: Relop::Eq,
            lhs: Box::new(Exp::Temp {
                temp: t,
                ty: ty_int(),
            }),
            rhs: Box::new(Exp::Const {
                value: 0,
                size: 8,
                ty: ty_int(),
            }),
            t: l_t,
            f: l_f,
        };
        let (instrs, _) = munch(&stm);
        let text = fmt(&instrs);
        assert!(text.contains("cbz\t"), "expected cbz: {text}");
        let Instr::Oper { jump: Some(j), .. } = &instrs[0] else {
            panic!("cbz must carry its jump targets");
        };
        assert_eq!(j, &vec![l_t, l_f]);
    }

    #[test]
    fn calls_clobber_calldefs_and_key_a_frame_map() {
        let stm = Stm::Exp(Box::new(Exp::Call {
            func: Box::new(Exp::Name {
                label: crate::common::id("sl_alloc_des"),
                size: 8,
            }),
            args: vec![Exp::Name {
                label: crate::common::id("L0"),
                size: 8,
            }],
            size: 8,
            ty: ty_ptr(ty_void()),
            ptr_map: Default::default(),
        }));
        let (instrs, _) = munch(&stm);
        let text = fmt(&instrs);
        assert!(text.contains("bl\t_sl_alloc_des"), "missing call: {text}");
        // the call lists the argument and caller-save registers as dsts
        let call = instrs
            .iter()
            .find(|i| matches!(i, Instr::Oper { asm, .. } if asm.starts_with("bl")))
            .unwrap();
        let Instr::Oper { dst, .. } = call else {
            unreachable!()
        };
        assert!(dst.contains(&TARGET_ARM64.arg_registers[0]));
        assert!(dst.contains(&crate::back::target::machine_reg(30)));
        // the instruction right after the call is the ret label
        let call_pos = instrs
            .iter()
            .position(|i| matches!(i, Instr::Oper { asm, .. } if asm.starts_with("bl")))
            .unwrap();
        assert!(matches!(instrs[call_pos + 1], Instr::Label { .. }));
    }

    #[test]
    fn register_names_shrink_with_size() {
        assert_eq!(Arm64.register_for_size("x9", 8), "x9");
        assert_eq!(Arm64.register_for_size("x9", 4), "w9");
        assert_eq!(Arm64.register_for_size("sp", 8), "sp");
        assert_eq!(Arm64.register_for_size("fp", 8), "fp");
    }
}
