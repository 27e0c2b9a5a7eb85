//! Translation from the typed AST to the tree IR.
//!
//! Every source expression turns into one of three intermediate forms:
//!
//! | form | content          | meaning                                   |
//! |------|------------------|-------------------------------------------|
//! | Ex   | expression       | produces a value                          |
//! | Nx   | statement        | effect only                               |
//! | Cx   | label bifunction | branches to one of two labels             |
//!
//! The natural form of each construct survives until a parent context
//! forces a shape, which is what makes short-circuit `&&`/`||` and
//! branch-on-comparison come out right without special cases downstream.

use crate::back::target::Target;
use crate::common::{id, Id, Map};
use crate::front::ast::{self, Decl, Expr, ExprKind, FuncDecl, Program, Type};
use crate::middle::fragment::Fragment;
use crate::middle::frame::{
    calculate_ptr_maps, proc_entry_exit_1, Access, Frame, Layouts, WORD_SIZE,
};
use crate::middle::temp::{Label, PtrDispo, TempState};
use crate::middle::tree::*;

const BOOL_SIZE: usize = 1;

/// The label the compiler emits calls to for heap allocation.
pub const ALLOC_FN: &str = "sl_alloc_des";

/// A deferred conditional: given true and false labels, produce the
/// branching statement.
pub type CxFn = Box<dyn FnOnce(Label, Label, &mut TempState) -> Stm>;

pub enum Translated {
    Ex(Exp),
    Nx(Stm),
    Cx(CxFn),
}

fn jump_not_zero(e: Exp, t: Label, f: Label) -> Stm {
    let zero = Exp::Const {
        value: 0,
        size: e.size(),
        ty: e.ty(),
    };
    Stm::CJump {
        op: Relop::Ne,
        lhs: Box::new(zero),
        rhs: Box::new(e),
        t,
        f,
    }
}

impl Translated {
    /// Force a value.
    pub fn un_ex(self, ts: &mut TempState) -> Exp {
        match self {
            Translated::Ex(e) => e,
            Translated::Nx(s) => Exp::ESeq {
                stm: Box::new(s),
                exp: Box::new(Exp::Const {
                    value: 0,
                    size: WORD_SIZE,
                    ty: ty_void(),
                }),
            },
            Translated::Cx(gen) => {
                let r = ts.new_temp(BOOL_SIZE, PtrDispo::NotPtr);
                let t = ts.new_label();
                let f = ts.new_label();
                let r_exp = || Exp::Temp {
                    temp: r,
                    ty: ty_bool(),
                };
                let const_bool = |value| Exp::Const {
                    value,
                    size: BOOL_SIZE,
                    ty: ty_bool(),
                };
                let branch = gen(t, f, ts);
                Exp::ESeq {
                    stm: Box::new(Stm::seq(
                        Stm::seq(
                            Stm::seq(
                                Stm::seq(
                                    Stm::Move {
                                        dst: Box::new(r_exp()),
                                        src: Box::new(const_bool(1)),
                                    },
                                    branch,
                                ),
                                Stm::Label(f),
                            ),
                            Stm::Move {
                                dst: Box::new(r_exp()),
                                src: Box::new(const_bool(0)),
                            },
                        ),
                        Stm::Label(t),
                    )),
                    exp: Box::new(r_exp()),
                }
            }
        }
    }

    /// Force an effect.
    pub fn un_nx(self, ts: &mut TempState) -> Stm {
        match self {
            Translated::Ex(e) => Stm::Exp(Box::new(e)),
            Translated::Nx(s) => s,
            Translated::Cx(gen) => {
                // evaluate the conditional and fall through either way
                let dst = ts.new_label();
                let branch = gen(dst, dst, ts);
                Stm::seq(branch, Stm::Label(dst))
            }
        }
    }

    /// Force a branch.
    pub fn un_cx(self) -> CxFn {
        match self {
            Translated::Ex(Exp::Const { value: 0, .. }) => {
                Box::new(|_t, f, _ts| Stm::jump_to(f))
            }
            Translated::Ex(Exp::Const { .. }) => Box::new(|t, _f, _ts| Stm::jump_to(t)),
            Translated::Ex(e) => Box::new(move |t, f, _ts| jump_not_zero(e, t, f)),
            Translated::Nx(_) => unreachable!("a statement has no conditional form"),
            Translated::Cx(gen) => gen,
        }
    }
}

/// Translate a source type to its backend view.  Mutually recursive
/// structs are handled by inserting an empty shell into the environment
/// before translating the fields, then filling the shell in.
pub fn translate_type(layouts: &Layouts, ty: &Type) -> Ty {
    fn go(layouts: &Layouts, ty: &Type, translated: &mut Map<Id, Ty>) -> Ty {
        match ty {
            Type::Ptr(pointee) => ty_ptr(go(layouts, pointee, translated)),
            Type::Name(name) => {
                if *name == id("int") {
                    return ty_int();
                }
                if *name == id("bool") {
                    return ty_bool();
                }
                if *name == id("void") {
                    return ty_void();
                }
                if let Some(found) = translated.get(name) {
                    return found.clone();
                }
                let shell: Ty = std::rc::Rc::new(TreeTy::Struct(std::cell::RefCell::new(vec![])));
                translated.insert(*name, shell.clone());
                let fields: Vec<Ty> = layouts
                    .struct_fields(*name)
                    .to_vec()
                    .iter()
                    .map(|(_, fty)| go(layouts, fty, translated))
                    .collect();
                if let TreeTy::Struct(cell) = &*shell {
                    *cell.borrow_mut() = fields;
                }
                shell
            }
        }
    }
    go(layouts, ty, &mut Map::new())
}

struct TranslateInfo<'a> {
    layouts: &'a mut Layouts,
    ts: &'a mut TempState,
    target: &'static Target,
    current_loop_end: Option<Label>,
    function_end_label: Label,
    end_label_used: bool,
    /// Interned descriptor strings, in first-use order.
    string_fragments: Vec<(Label, String)>,
}

impl TranslateInfo<'_> {
    fn tree_ty(&self, ty: &Type) -> Ty {
        translate_type(self.layouts, ty)
    }

    fn fp_exp(&self) -> Exp {
        Exp::Temp {
            temp: self.target.fp,
            ty: ty_ptr(ty_void()),
        }
    }

    /// `FP + offset`, or just `FP` when the offset is zero.
    fn frame_addr(&self, offset: i32) -> Exp {
        if offset == 0 {
            self.fp_exp()
        } else {
            Exp::BinOp {
                op: TreeBinop::Plus,
                lhs: Box::new(self.fp_exp()),
                rhs: Box::new(Exp::Const {
                    value: offset as i64,
                    size: WORD_SIZE,
                    ty: ty_ptr_diff(),
                }),
            }
        }
    }

    fn label_for_descriptor(&mut self, descriptor: String) -> Label {
        for (label, existing) in &self.string_fragments {
            if *existing == descriptor {
                return *label;
            }
        }
        let label = self.ts.new_label();
        self.string_fragments.push((label, descriptor));
        label
    }
}

/// Translate a whole checked, rewritten program into fragments: one
/// `Code` per function followed by the interned descriptor strings.
pub fn translate_program(
    layouts: &mut Layouts,
    ts: &mut TempState,
    target: &'static Target,
    program: &Program,
    frames: Vec<Frame>,
) -> Vec<Fragment> {
    let mut fragments = Vec::new();
    let mut strings = Vec::new();
    let mut frames = frames.into_iter();
    for decl in &program.decls {
        let Decl::Func(func) = decl else { continue };
        let mut frame = frames.next().expect("a frame per function");
        let mut info = TranslateInfo {
            layouts,
            ts,
            target,
            current_loop_end: None,
            function_end_label: Id::from("L?".to_string()),
            end_label_used: false,
            string_fragments: std::mem::take(&mut strings),
        };
        let body = translate_decl(&mut info, &frame, func);
        strings = std::mem::take(&mut info.string_fragments);
        let body = proc_entry_exit_1(ts, &mut frame, body);
        fragments.push(Fragment::code(body, frame));
    }
    assert!(frames.next().is_none(), "more frames than functions");
    for (label, value) in strings {
        fragments.push(Fragment::Str { label, value });
    }
    fragments
}

fn translate_decl(info: &mut TranslateInfo, frame: &Frame, decl: &FuncDecl) -> Stm {
    info.function_end_label = info.ts.new_label();
    info.end_label_used = false;

    assert!(!decl.body.is_empty(), "functions always have a body");
    let mut stmts: Option<Stm> = None;
    let mut last: Option<Translated> = None;
    for expr in &decl.body {
        if let Some(prev) = last.take() {
            let stm = prev.un_nx(info.ts);
            stmts = Some(match stmts {
                Some(acc) => Stm::seq(acc, stm),
                None => stm,
            });
        }
        last = Some(translate_expr(info, frame, expr));
    }
    let last = last.expect("non-empty body");

    let result_exp = match stmts {
        Some(stmts) => {
            let e = last.un_ex(info.ts);
            Exp::ESeq {
                stm: Box::new(stmts),
                exp: Box::new(e),
            }
        }
        None => last.un_ex(info.ts),
    };

    let return_assignment = assign_return(info.ts, frame, result_exp);
    if info.end_label_used {
        Stm::seq(return_assignment, Stm::Label(info.function_end_label))
    } else {
        return_assignment
    }
}

/// Assign `arg` to the return registers of the current function: one word
/// goes in `ret0`, two words in `ret0` and `ret1`, larger returns are
/// rejected at frame layout.
fn assign_return(ts: &mut TempState, frame: &Frame, arg: Exp) -> Stm {
    let size = arg.size();
    if size <= WORD_SIZE {
        let ret0 = frame.target.ret0.with_size(size);
        Stm::Move {
            dst: Box::new(Exp::Temp {
                temp: ret0,
                ty: arg.ty(),
            }),
            src: Box::new(arg),
        }
    } else if size <= 2 * WORD_SIZE {
        // the value is a struct lvalue: take its address once and load
        // the two halves
        let Exp::Mem { addr, .. } = arg else {
            panic!("two-word return of a non-addressable value");
        };
        let t = ts.new_temp(WORD_SIZE, PtrDispo::NotPtr);
        let t_exp = || Exp::Temp {
            temp: t,
            ty: ty_ptr(ty_void()),
        };
        let load_word = |offset: i64| Exp::Mem {
            addr: Box::new(if offset == 0 {
                t_exp()
            } else {
                Exp::BinOp {
                    op: TreeBinop::Plus,
                    lhs: Box::new(t_exp()),
                    rhs: Box::new(Exp::Const {
                        value: offset,
                        size: WORD_SIZE,
                        ty: ty_ptr_diff(),
                    }),
                }
            }),
            size: WORD_SIZE,
            ty: ty_void(),
        };
        let ret0 = frame.target.ret0.with_size(WORD_SIZE);
        let ret1 = frame.target.ret1.with_size(WORD_SIZE);
        Stm::seq(
            Stm::Move {
                dst: Box::new(t_exp()),
                src: addr,
            },
            Stm::seq(
                Stm::Move {
                    dst: Box::new(Exp::Temp {
                        temp: ret0,
                        ty: ty_void(),
                    }),
                    src: Box::new(load_word(0)),
                },
                Stm::Move {
                    dst: Box::new(Exp::Temp {
                        temp: ret1,
                        ty: ty_void(),
                    }),
                    src: Box::new(load_word(WORD_SIZE as i64)),
                },
            ),
        )
    } else {
        panic!("returns larger than two words are not implemented");
    }
}

fn translate_body(info: &mut TranslateInfo, frame: &Frame, body: &[Expr]) -> Translated {
    match body {
        [] => Translated::Ex(Exp::Const {
            value: 0,
            size: WORD_SIZE,
            ty: ty_void(),
        }),
        [only] => translate_expr(info, frame, only),
        [init @ .., last] => {
            let mut stmts: Option<Stm> = None;
            for expr in init {
                let stm = translate_expr(info, frame, expr).un_nx(info.ts);
                stmts = Some(match stmts {
                    Some(acc) => Stm::seq(acc, stm),
                    None => stm,
                });
            }
            let e = translate_expr(info, frame, last).un_ex(info.ts);
            Translated::Ex(Exp::ESeq {
                stm: Box::new(stmts.expect("non-empty prefix")),
                exp: Box::new(e),
            })
        }
    }
}

fn translate_var_ref(info: &TranslateInfo, frame: &Frame, var_id: i32, ty: &Type) -> Exp {
    let v = frame.var_by_id(var_id);
    match v.access {
        Access::Reg(temp) => Exp::Temp {
            temp,
            ty: info.tree_ty(ty),
        },
        Access::Frame(offset) => Exp::Mem {
            addr: Box::new(info.frame_addr(offset)),
            size: v.size,
            ty: info.tree_ty(ty),
        },
    }
}

fn translate_expr(info: &mut TranslateInfo, frame: &Frame, expr: &Expr) -> Translated {
    match &expr.kind {
        ExprKind::Int(value) => Translated::Ex(Exp::Const {
            value: *value,
            size: info.layouts.size_of(expr.ty()),
            ty: info.tree_ty(expr.ty()),
        }),
        ExprKind::Bool(value) => Translated::Ex(Exp::Const {
            value: *value as i64,
            size: info.layouts.size_of(expr.ty()),
            ty: ty_bool(),
        }),
        // happens as the value of a missing else branch
        ExprKind::Void => Translated::Ex(Exp::Const {
            value: 0,
            size: WORD_SIZE,
            ty: ty_void(),
        }),
        ExprKind::Var { var_id, .. } => {
            Translated::Ex(translate_var_ref(info, frame, *var_id, expr.ty()))
        }
        ExprKind::BinOp { op, lhs, rhs } => translate_binop(info, frame, *op, lhs, rhs),
        ExprKind::Let { ty, init, var_id, .. } => {
            let rhe = translate_expr(info, frame, init).un_ex(info.ts);
            let dst = translate_var_ref(info, frame, *var_id, ty);
            Translated::Nx(Stm::Move {
                dst: Box::new(dst),
                src: Box::new(rhe),
            })
        }
        ExprKind::Call {
            func,
            args,
            defined_vars,
        } => {
            let translated_args: Vec<Exp> = args
                .iter()
                .map(|arg| translate_expr(info, frame, arg).un_ex(info.ts))
                .collect();
            let size = info.layouts.size_of(expr.ty());
            assert!(
                size <= 2 * WORD_SIZE,
                "returns larger than two words are not implemented"
            );
            Translated::Ex(Exp::Call {
                func: Box::new(Exp::Name {
                    label: *func,
                    size: WORD_SIZE,
                }),
                args: translated_args,
                size,
                ty: info.tree_ty(expr.ty()),
                ptr_map: calculate_ptr_maps(frame, defined_vars),
            })
        }
        ExprKind::New {
            struct_name,
            args,
            defined_vars,
        } => translate_new(info, frame, *struct_name, args, defined_vars, expr),
        ExprKind::Return(arg) => {
            info.end_label_used = true;
            let jump = Stm::jump_to(info.function_end_label);
            let result = match arg {
                Some(arg) => {
                    let arg_exp = translate_expr(info, frame, arg).un_ex(info.ts);
                    Stm::seq(assign_return(info.ts, frame, arg_exp), jump)
                }
                None => jump,
            };
            Translated::Nx(result)
        }
        ExprKind::Break => {
            // jump to the end label of the enclosing loop
            let end = info
                .current_loop_end
                .expect("the checker rejects break outside a loop");
            Translated::Nx(Stm::jump_to(end))
        }
        ExprKind::Loop(body) => {
            let loop_start = info.ts.new_label();
            let loop_end = info.ts.new_label();
            let saved_end = info.current_loop_end.replace(loop_end);

            let mut stmts = Stm::Label(loop_start);
            for expr in body {
                let s = translate_expr(info, frame, expr).un_nx(info.ts);
                stmts = Stm::seq(stmts, s);
            }
            info.current_loop_end = saved_end;
            Translated::Nx(Stm::seq(stmts, Stm::Label(loop_end)))
        }
        ExprKind::Deref(arg) => {
            let addr = translate_expr(info, frame, arg).un_ex(info.ts);
            let size = info.layouts.size_of(expr.ty());
            assert!(size > 0);
            Translated::Ex(Exp::Mem {
                addr: Box::new(addr),
                size,
                ty: info.tree_ty(expr.ty()),
            })
        }
        ExprKind::AddrOf(arg) => {
            let arg = translate_expr(info, frame, arg).un_ex(info.ts);
            // vars, members and derefs all lower to MEM(addr), so taking
            // an address is just unwrapping
            let Exp::Mem { addr, .. } = arg else {
                unreachable!("address of a non-lvalue");
            };
            Translated::Ex(*addr)
        }
        ExprKind::Member { obj, field } => translate_member(info, frame, obj, *field),
        ExprKind::If { cond, cons, alt } => translate_if(info, frame, expr, cond, cons, alt),
    }
}

fn translate_binop(
    info: &mut TranslateInfo,
    frame: &Frame,
    op: ast::BinOp,
    lhs: &Expr,
    rhs: &Expr,
) -> Translated {
    let lhe = translate_expr(info, frame, lhs).un_ex(info.ts);
    let rhe = translate_expr(info, frame, rhs).un_ex(info.ts);

    match op {
        ast::BinOp::LOr => {
            // a || b:
            // t, f ->
            //      CJUMP(!=, a, 0, t, z)
            //  label z:
            //      CJUMP(!=, b, 0, t, f)
            return Translated::Cx(Box::new(move |t, f, ts| {
                let z = ts.new_label();
                let first = jump_not_zero(lhe, t, z);
                Stm::seq(
                    Stm::seq(first, Stm::Label(z)),
                    jump_not_zero(rhe, t, f),
                )
            }));
        }
        ast::BinOp::LAnd => {
            // a && b:
            // t, f ->
            //      CJUMP(!=, a, 0, z, f)
            //  label z:
            //      CJUMP(!=, b, 0, t, f)
            return Translated::Cx(Box::new(move |t, f, ts| {
                let z = ts.new_label();
                let first = jump_not_zero(lhe, z, f);
                Stm::seq(
                    Stm::seq(first, Stm::Label(z)),
                    jump_not_zero(rhe, t, f),
                )
            }));
        }
        _ => {}
    }

    if let Some(relop) = relop_for(op) {
        return Translated::Cx(Box::new(move |t, f, _ts| Stm::CJump {
            op: relop,
            lhs: Box::new(lhe),
            rhs: Box::new(rhe),
            t,
            f,
        }));
    }

    let tree_op = match op {
        ast::BinOp::Add => TreeBinop::Plus,
        ast::BinOp::Sub => TreeBinop::Minus,
        ast::BinOp::Mul => TreeBinop::Mul,
        ast::BinOp::Div => TreeBinop::Div,
        ast::BinOp::BitAnd => TreeBinop::And,
        ast::BinOp::BitOr => TreeBinop::Or,
        ast::BinOp::BitXor => TreeBinop::Xor,
        ast::BinOp::LShift => TreeBinop::LShift,
        ast::BinOp::RShift => TreeBinop::RShift,
        ast::BinOp::ARShift => TreeBinop::ARShift,
        _ => unreachable!("logical and relational operators handled above"),
    };
    Translated::Ex(Exp::BinOp {
        op: tree_op,
        lhs: Box::new(lhe),
        rhs: Box::new(rhe),
    })
}

fn relop_for(op: ast::BinOp) -> Option<Relop> {
    Some(match op {
        ast::BinOp::Eq => Relop::Eq,
        ast::BinOp::Ne => Relop::Ne,
        ast::BinOp::Lt => Relop::Lt,
        ast::BinOp::Gt => Relop::Gt,
        ast::BinOp::Le => Relop::Le,
        ast::BinOp::Ge => Relop::Ge,
        _ => return None,
    })
}

/// `new S(a, b, ...)`: call the runtime allocator with S's descriptor,
/// then initialise each field of the returned object.
fn translate_new(
    info: &mut TranslateInfo,
    frame: &Frame,
    struct_name: Id,
    args: &[Expr],
    defined_vars: &[i32],
    expr: &Expr,
) -> Translated {
    let result_ty = expr.ty(); // *S
    let struct_ty = Type::Name(struct_name);

    let r = info.ts.new_temp(WORD_SIZE, PtrDispo::Ptr);
    let r_exp = |info: &TranslateInfo| Exp::Temp {
        temp: r,
        ty: info.tree_ty(result_ty),
    };

    let descriptor = info.layouts.descriptor(&struct_ty);
    let descriptor_label = info.label_for_descriptor(descriptor);

    let assign = Stm::Move {
        dst: Box::new(r_exp(info)),
        src: Box::new(Exp::Call {
            func: Box::new(Exp::Name {
                label: info.ts.named_label(ALLOC_FN),
                size: WORD_SIZE,
            }),
            args: vec![Exp::Name {
                label: descriptor_label,
                size: WORD_SIZE,
            }],
            size: WORD_SIZE,
            ty: info.tree_ty(result_ty),
            ptr_map: calculate_ptr_maps(frame, defined_vars),
        }),
    };

    let mut init_seq = assign;
    let mut offset = 0usize;
    for arg in args {
        let arg_size = info.layouts.size_of(arg.ty());
        let arg_alignment = info.layouts.alignment_of(arg.ty());
        offset = crate::common::round_up(offset, arg_alignment);

        let addr = if offset == 0 {
            r_exp(info)
        } else {
            Exp::BinOp {
                op: TreeBinop::Plus,
                lhs: Box::new(r_exp(info)),
                rhs: Box::new(Exp::Const {
                    value: offset as i64,
                    size: WORD_SIZE,
                    ty: ty_ptr_diff(),
                }),
            }
        };
        let value = translate_expr(info, frame, arg).un_ex(info.ts);
        let init = Stm::Move {
            dst: Box::new(Exp::Mem {
                addr: Box::new(addr),
                size: arg_size,
                ty: value.ty(),
            }),
            src: Box::new(value),
        };
        offset += arg_size;
        init_seq = Stm::seq(init_seq, init);
    }

    Translated::Ex(Exp::ESeq {
        stm: Box::new(init_seq),
        exp: Box::new(r_exp(info)),
    })
}

fn translate_member(
    info: &mut TranslateInfo,
    frame: &Frame,
    obj: &Expr,
    field: Id,
) -> Translated {
    let struct_name = obj.ty().base_name();
    let (offset, member_size, member_ty) = info.layouts.field_offset(struct_name, field);
    assert!(member_size > 0);

    let base_ref = translate_expr(info, frame, obj).un_ex(info.ts);

    // The common case: the struct is in memory, on the stack or the heap.
    if let Exp::Mem { addr, .. } = base_ref {
        let member_addr = if offset == 0 {
            *addr
        } else {
            Exp::BinOp {
                op: TreeBinop::Plus,
                lhs: addr,
                rhs: Box::new(Exp::Const {
                    value: offset as i64,
                    size: WORD_SIZE,
                    ty: ty_ptr_diff(),
                }),
            }
        };
        return Translated::Ex(Exp::Mem {
            addr: Box::new(member_addr),
            size: member_size,
            ty: info.tree_ty(&member_ty),
        });
    }

    // The uncommon case: the whole struct fits in a register-held temp,
    // so the field is extracted with a shift and a mask.
    assert!(
        matches!(base_ref, Exp::Temp { .. }),
        "composite is neither in memory nor in a register"
    );
    let base_size = base_ref.size();
    let base_ty = base_ref.ty();
    let shift = (offset * 8) as i64;
    let mask = if member_size >= WORD_SIZE {
        -1i64
    } else {
        ((1u64 << (member_size * 8)) - 1) as i64
    };
    let shifted = if shift == 0 {
        base_ref
    } else {
        Exp::BinOp {
            op: TreeBinop::RShift,
            lhs: Box::new(base_ref),
            rhs: Box::new(Exp::Const {
                value: shift,
                size: base_size,
                ty: base_ty.clone(),
            }),
        }
    };
    Translated::Ex(Exp::BinOp {
        op: TreeBinop::And,
        lhs: Box::new(shifted),
        rhs: Box::new(Exp::Const {
            value: mask,
            size: base_size,
            ty: base_ty,
        }),
    })
}

fn translate_if(
    info: &mut TranslateInfo,
    frame: &Frame,
    expr: &Expr,
    cond: &Expr,
    cons: &[Expr],
    alt: &[Expr],
) -> Translated {
    let condition = translate_expr(info, frame, cond).un_cx();
    let cons_tr = translate_body(info, frame, cons).un_ex(info.ts);
    let alt_tr = translate_body(info, frame, alt).un_ex(info.ts);

    let tlabel = info.ts.new_label();
    let flabel = info.ts.new_label();
    let join = info.ts.new_label();

    // the result temp takes the size of the consequent's type; a void
    // branch yields a zero-size temp whose moves the instruction selector
    // drops
    let cons_size = info.layouts.size_of(expr.ty());
    let cons_ty = info.tree_ty(expr.ty());
    let r = info.ts.new_temp(cons_size, cons_ty.dispo());
    let r_exp = || Exp::Temp {
        temp: r,
        ty: cons_ty.clone(),
    };

    let mut res = condition(tlabel, flabel, info.ts);
    res = Stm::seq(res, Stm::Label(tlabel));
    res = Stm::seq(
        res,
        Stm::Move {
            dst: Box::new(r_exp()),
            src: Box::new(cons_tr),
        },
    );
    res = Stm::seq(res, Stm::jump_to(join));
    res = Stm::seq(res, Stm::Label(flabel));
    res = Stm::seq(
        res,
        Stm::Move {
            dst: Box::new(r_exp()),
            src: Box::new(alt_tr),
        },
    );
    res = Stm::seq(res, Stm::jump_to(join));
    res = Stm::seq(res, Stm::Label(join));
    Translated::Ex(Exp::ESeq {
        stm: Box::new(res),
        exp: Box::new(r_exp()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::target::TARGET_X86_64;
    use crate::front::{parse, rewrite_decompose_equal, verify_and_type_program};
    use crate::middle::frame::calculate_frames;

    fn translated(src: &str) -> Vec<Fragment> {
        let mut program = parse(src).unwrap();
        assert_eq!(verify_and_type_program("test.sl", &mut program), 0);
        rewrite_decompose_equal(&mut program);
        let mut layouts = Layouts::new(&program);
        let mut ts = TempState::new();
        let frames = calculate_frames(&mut layouts, &TARGET_X86_64, &mut ts, &program);
        translate_program(&mut layouts, &mut ts, &TARGET_X86_64, &program, frames)
    }

    fn count_exp(stm: &Stm, pred: &mut dyn FnMut(&Exp) -> bool) -> usize {
        fn walk_exp(e: &Exp, pred: &mut dyn FnMut(&Exp) -> bool) -> usize {
            let mut n = if pred(e) { 1 } else { 0 };
            match e {
                Exp::BinOp { lhs, rhs, .. } => {
                    n += walk_exp(lhs, pred) + walk_exp(rhs, pred);
                }
                Exp::Mem { addr, .. } => n += walk_exp(addr, pred),
                Exp::Call { func, args, .. } => {
                    n += walk_exp(func, pred);
                    for a in args {
                        n += walk_exp(a, pred);
                    }
                }
                Exp::ESeq { stm, exp } => {
                    n += count_exp(stm, pred) + walk_exp(exp, pred);
                }
                _ => {}
            }
            n
        }
        match stm {
            Stm::Move { dst, src } => walk_exp(dst, pred) + walk_exp(src, pred),
            Stm::Exp(e) => walk_exp(e, pred),
            Stm::Jump { dst, .. } => walk_exp(dst, pred),
            Stm::CJump { lhs, rhs, .. } => walk_exp(lhs, pred) + walk_exp(rhs, pred),
            Stm::Seq(s1, s2) => count_exp(s1, pred) + count_exp(s2, pred),
            Stm::Label(_) => 0,
        }
    }

    #[test]
    fn new_interns_one_descriptor_per_layout() {
        let fragments = translated(
            "struct N { v: int, n: *N }\n\
             fn mk() -> *N { new N(1, new N(2, 0)) }",
        );
        let strings: Vec<&str> = fragments
            .iter()
            .filter_map(|f| match f {
                Fragment::Str { value, .. } => Some(value.as_str()),
                _ => None,
            })
            .collect();
        // two allocations of the same struct share one "np" descriptor
        assert_eq!(strings, vec!["np"]);
    }

    #[test]
    fn calls_carry_the_allocator_name_and_ptr_map() {
        let fragments = translated(
            "struct N { v: int, n: *N }\n\
             fn mk(p: *N) -> *N { let q: *N = new N(3, p); q }",
        );
        let Fragment::Code { body, .. } = &fragments[0] else {
            panic!();
        };
        let allocs = count_exp(&body[0], &mut |e| {
            matches!(e, Exp::Call { func, .. }
                if matches!(&**func, Exp::Name { label, .. } if label.as_ref() == ALLOC_FN))
        });
        assert_eq!(allocs, 1);
    }

    #[test]
    fn struct_equality_lowers_to_two_field_compares() {
        let fragments = translated(
            "struct P { a: int, b: int }\n\
             fn eq(x: P, y: P) -> bool { x == y }",
        );
        let Fragment::Code { body, .. } = &fragments[0] else {
            panic!();
        };
        // both fields are extracted from register-held structs by
        // shift+mask, so the body contains AND nodes but no MEM nodes for
        // the operands
        let shifts = count_exp(&body[0], &mut |e| {
            matches!(e, Exp::BinOp { op: TreeBinop::And, .. })
        });
        assert_eq!(shifts, 4); // two fields on each side
    }

    #[test]
    fn register_formals_are_rebound_to_fresh_temps() {
        let fragments = translated("fn id(x: int) -> int { x }");
        let Fragment::Code { body, frame } = &fragments[0] else {
            panic!();
        };
        let v = frame.var_by_id(1);
        let Access::Reg(temp) = v.access else {
            panic!("word-size formal should be register-bound");
        };
        assert!(!temp.is_machine(), "formal must move to a fresh temp");
        // the entry move from the argument register exists
        let uses_arg_reg = count_exp(&body[0], &mut |e| {
            matches!(e, Exp::Temp { temp, .. } if *temp == TARGET_X86_64.arg_registers[0])
        });
        assert_eq!(uses_arg_reg, 1);
    }

    #[test]
    fn loop_translates_to_entry_and_exit_labels() {
        let fragments = translated("fn f() -> int { loop { return 3 } }");
        let Fragment::Code { body, .. } = &fragments[0] else {
            panic!();
        };
        let printed = format!("{}", body[0]);
        // a return inside the loop jumps to the function end label
        assert!(printed.contains("JUMP"));
        assert!(printed.contains("LABEL"));
    }
}
