//! The tree intermediate representation.
//!
//! Expressions and statements are mutually recursive; translation builds
//! arbitrary nestings and the canonicaliser flattens them.  Expressions
//! carry a byte size and a [tree type](TreeTy), from which the pointer
//! disposition of fresh temporaries is derived.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use derive_more::Display;

use crate::middle::frame::CallSiteMap;
use crate::middle::temp::{Label, PtrDispo, Temp};

/// Backend view of a type: just enough structure to answer "which words
/// are pointers".  Struct types may be mutually recursive; they are built
/// in two phases (an empty shell first, fields filled in afterwards), so
/// the field list sits behind a `RefCell`.
#[derive(Debug)]
pub enum TreeTy {
    Int,
    Bool,
    Void,
    /// An integer used in address arithmetic.
    PtrDiff,
    Ptr(Ty),
    Struct(RefCell<Vec<Ty>>),
}

pub type Ty = Rc<TreeTy>;

pub fn ty_int() -> Ty {
    Rc::new(TreeTy::Int)
}

pub fn ty_bool() -> Ty {
    Rc::new(TreeTy::Bool)
}

pub fn ty_void() -> Ty {
    Rc::new(TreeTy::Void)
}

pub fn ty_ptr_diff() -> Ty {
    Rc::new(TreeTy::PtrDiff)
}

pub fn ty_ptr(pointee: Ty) -> Ty {
    Rc::new(TreeTy::Ptr(pointee))
}

impl TreeTy {
    /// The pointer disposition of a temp holding a value of this type.
    pub fn dispo(&self) -> PtrDispo {
        match self {
            TreeTy::Ptr(_) => PtrDispo::Ptr,
            _ => PtrDispo::NotPtr,
        }
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum TreeBinop {
    #[display("+")]
    Plus,
    #[display("-")]
    Minus,
    #[display("*")]
    Mul,
    #[display("/")]
    Div,
    #[display("&")]
    And,
    #[display("|")]
    Or,
    #[display("^")]
    Xor,
    #[display("<<")]
    LShift,
    #[display(">>")]
    RShift,
    #[display(">>>")]
    ARShift,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Relop {
    #[display("==")]
    Eq,
    #[display("!=")]
    Ne,
    #[display("<")]
    Lt,
    #[display(">")]
    Gt,
    #[display("<=")]
    Le,
    #[display(">=")]
    Ge,
    #[display("u<")]
    Ult,
    #[display("u<=")]
    Ule,
    #[display("u>")]
    Ugt,
    #[display("u>=")]
    Uge,
}

impl Relop {
    /// The operator that holds exactly when `self` does not.
    pub fn invert(self) -> Relop {
        use Relop::*;
        match self {
            Eq => Ne,
            Ne => Eq,
            Lt => Ge,
            Ge => Lt,
            Gt => Le,
            Le => Gt,
            Ult => Uge,
            Uge => Ult,
            Ule => Ugt,
            Ugt => Ule,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Exp {
    /// The integer constant `value`.
    Const { value: i64, size: usize, ty: Ty },
    /// Symbolic constant naming an assembly label.
    Name { label: Label, size: usize },
    /// A cell in the abstract machine, similar to a register, but there
    /// are infinitely many.
    Temp { temp: Temp, ty: Ty },
    /// Evaluate `lhs`, then `rhs`, then apply the operator.
    BinOp {
        op: TreeBinop,
        lhs: Box<Exp>,
        rhs: Box<Exp>,
    },
    /// The contents of `size` bytes of memory starting at `addr`.
    Mem { addr: Box<Exp>, size: usize, ty: Ty },
    /// Evaluate the function address, then the arguments left to right,
    /// then transfer control.  `ptr_map` describes the stack pointers live
    /// across the call, keyed later by the call's return label.
    Call {
        func: Box<Exp>,
        args: Vec<Exp>,
        size: usize,
        ty: Ty,
        ptr_map: CallSiteMap,
    },
    /// Evaluate `stm` for its side effects, then `exp` for the result.
    ESeq { stm: Box<Stm>, exp: Box<Exp> },
}

impl Exp {
    pub fn size(&self) -> usize {
        match self {
            Exp::Const { size, .. } | Exp::Name { size, .. } | Exp::Mem { size, .. } => *size,
            Exp::Temp { temp, .. } => temp.size,
            Exp::Call { size, .. } => *size,
            Exp::BinOp { lhs, .. } => lhs.size(),
            Exp::ESeq { exp, .. } => exp.size(),
        }
    }

    pub fn ty(&self) -> Ty {
        match self {
            Exp::Const { ty, .. }
            | Exp::Temp { ty, .. }
            | Exp::Mem { ty, .. }
            | Exp::Call { ty, .. } => Rc::clone(ty),
            Exp::Name { .. } => ty_ptr_diff(),
            Exp::BinOp { lhs, .. } => lhs.ty(),
            Exp::ESeq { exp, .. } => exp.ty(),
        }
    }

    pub fn dispo(&self) -> PtrDispo {
        self.ty().dispo()
    }
}

#[derive(Clone, Debug)]
pub enum Stm {
    /// Evaluate `src` and store it into the temp or memory cell `dst`.
    Move { dst: Box<Exp>, src: Box<Exp> },
    /// Evaluate and discard.
    Exp(Box<Exp>),
    /// Transfer control to `dst`; `labels` lists every possible target.
    Jump { dst: Box<Exp>, labels: Vec<Label> },
    /// Compare and branch to `t` or `f`.
    CJump {
        op: Relop,
        lhs: Box<Exp>,
        rhs: Box<Exp>,
        t: Label,
        f: Label,
    },
    /// `s1` followed by `s2`.
    Seq(Box<Stm>, Box<Stm>),
    /// Define a label as a jump target.
    Label(Label),
}

impl Stm {
    pub fn seq(s1: Stm, s2: Stm) -> Stm {
        Stm::Seq(Box::new(s1), Box::new(s2))
    }

    /// `JUMP(NAME l, [l])`, the common direct jump.
    pub fn jump_to(label: Label) -> Stm {
        Stm::Jump {
            dst: Box::new(Exp::Name {
                label,
                size: crate::middle::frame::WORD_SIZE,
            }),
            labels: vec![label],
        }
    }
}

impl fmt::Display for Exp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exp::Const { value, size, .. } => write!(f, "CONST<{size}>({value})"),
            Exp::Name { label, .. } => write!(f, "NAME({label})"),
            Exp::Temp { temp, .. } => write!(f, "TEMP({temp})"),
            Exp::BinOp { op, lhs, rhs } => write!(f, "BINOP({op}, {lhs}, {rhs})"),
            Exp::Mem { addr, size, .. } => write!(f, "MEM<{size}>({addr})"),
            Exp::Call { func, args, .. } => {
                write!(f, "CALL({func}")?;
                for arg in args {
                    write!(f, ", {arg}")?;
                }
                write!(f, ")")
            }
            Exp::ESeq { stm, exp } => write!(f, "ESEQ({stm}, {exp})"),
        }
    }
}

impl fmt::Display for Stm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stm::Move { dst, src } => write!(f, "MOVE({dst}, {src})"),
            Stm::Exp(e) => write!(f, "EXP({e})"),
            Stm::Jump { dst, .. } => write!(f, "JUMP({dst})"),
            Stm::CJump { op, lhs, rhs, t, f: fl } => {
                write!(f, "CJUMP({op}, {lhs}, {rhs}, {t}, {fl})")
            }
            Stm::Seq(s1, s2) => write!(f, "SEQ({s1}, {s2})"),
            Stm::Label(l) => write!(f, "LABEL({l})"),
        }
    }
}
