//! The abstract syntax tree.

use std::fmt;

use derive_more::Display;

use crate::common::Id;

#[derive(Debug)]
pub struct Program {
    pub decls: Vec<Decl>,
}

#[derive(Debug)]
pub enum Decl {
    Struct(StructDecl),
    Func(FuncDecl),
}

impl Decl {
    pub fn name(&self) -> Id {
        match self {
            Decl::Struct(s) => s.name,
            Decl::Func(f) => f.name,
        }
    }
}

#[derive(Debug)]
pub struct StructDecl {
    pub name: Id,
    pub fields: Vec<Param>,
    pub line: u32,
}

#[derive(Debug)]
pub struct FuncDecl {
    pub name: Id,
    pub params: Vec<Param>,
    pub ret_type: Type,
    pub body: Vec<Expr>,
    pub line: u32,
}

/// A function parameter or a struct field.
#[derive(Debug)]
pub struct Param {
    pub name: Id,
    pub ty: Type,
    pub line: u32,
    /// Assigned by the type checker; parameters of a function get ids just
    /// like let-bound variables, struct fields keep the default.
    pub var_id: i32,
}

/// Source-level types.  `Name` is later resolved against the builtin types
/// or the program's struct declarations.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Type {
    Name(Id),
    Ptr(Box<Type>),
}

impl Type {
    pub fn ptr_to(pointee: Type) -> Type {
        Type::Ptr(Box::new(pointee))
    }

    /// The name at the bottom of a chain of pointers.
    pub fn base_name(&self) -> Id {
        match self {
            Type::Name(name) => *name,
            Type::Ptr(pointee) => pointee.base_name(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Name(name) => write!(f, "{name}"),
            Type::Ptr(pointee) => write!(f, "*{pointee}"),
        }
    }
}

/// Binary operators as they appear in the source.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum BinOp {
    #[display("+")]
    Add,
    #[display("-")]
    Sub,
    #[display("*")]
    Mul,
    #[display("/")]
    Div,
    #[display("&")]
    BitAnd,
    #[display("|")]
    BitOr,
    #[display("^")]
    BitXor,
    #[display("<<")]
    LShift,
    #[display(">>")]
    RShift,
    #[display(">>>")]
    ARShift,
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
    #[display("&&")]
    LAnd,
    #[display("||")]
    LOr,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        use BinOp::*;
        matches!(self, Eq | Ne | Lt | Gt | Le | Ge)
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::LAnd | BinOp::LOr)
    }
}

#[derive(Clone, Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: u32,
    /// Assigned by the type checker.
    pub ty: Option<Type>,
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    Int(i64),
    Bool(bool),
    /// The value of a missing else branch.
    Void,
    BinOp {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Let {
        name: Id,
        ty: Type,
        init: Box<Expr>,
        /// Assigned by the type checker.
        var_id: i32,
    },
    Call {
        func: Id,
        args: Vec<Expr>,
        /// Variable ids in scope at this call site; recorded by the type
        /// checker and turned into the call's frame map by translation.
        defined_vars: Vec<i32>,
    },
    New {
        struct_name: Id,
        args: Vec<Expr>,
        defined_vars: Vec<i32>,
    },
    Var {
        name: Id,
        /// Assigned by the type checker.
        var_id: i32,
    },
    Return(Option<Box<Expr>>),
    Break,
    Loop(Vec<Expr>),
    Deref(Box<Expr>),
    AddrOf(Box<Expr>),
    Member {
        obj: Box<Expr>,
        field: Id,
    },
    If {
        cond: Box<Expr>,
        cons: Vec<Expr>,
        /// A single `Void` expression when the else branch is absent.
        alt: Vec<Expr>,
    },
}

impl Expr {
    pub fn new(kind: ExprKind, line: u32) -> Expr {
        Expr {
            kind,
            line,
            ty: None,
        }
    }

    /// The type assigned by the checker.  Panics if the checker has not run;
    /// the backend is only ever handed checked trees.
    pub fn ty(&self) -> &Type {
        self.ty.as_ref().expect("expression was not type checked")
    }
}

fn write_body(f: &mut fmt::Formatter<'_>, body: &[Expr]) -> fmt::Result {
    write!(f, "{{ ")?;
    for (i, e) in body.iter().enumerate() {
        if i > 0 {
            write!(f, "; ")?;
        }
        write!(f, "{e}")?;
    }
    write!(f, " }}")
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Int(v) => write!(f, "{v}"),
            ExprKind::Bool(v) => write!(f, "{v}"),
            ExprKind::Void => write!(f, "()"),
            ExprKind::BinOp { op, lhs, rhs } => write!(f, "({lhs} {op} {rhs})"),
            ExprKind::Let { name, ty, init, .. } => {
                write!(f, "let {name}: {ty} = {init}")
            }
            ExprKind::Call { func, args, .. } => {
                write!(f, "{func}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            ExprKind::New {
                struct_name, args, ..
            } => {
                write!(f, "new {struct_name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            ExprKind::Var { name, .. } => write!(f, "{name}"),
            ExprKind::Return(Some(e)) => write!(f, "return {e}"),
            ExprKind::Return(None) => write!(f, "return"),
            ExprKind::Break => write!(f, "break"),
            ExprKind::Loop(body) => {
                write!(f, "loop ")?;
                write_body(f, body)
            }
            ExprKind::Deref(e) => write!(f, "*{e}"),
            ExprKind::AddrOf(e) => write!(f, "&{e}"),
            ExprKind::Member { obj, field } => write!(f, "{obj}.{field}"),
            ExprKind::If { cond, cons, alt } => {
                write!(f, "if {cond} ")?;
                write_body(f, cons)?;
                if !matches!(alt[..], [ref e] if matches!(e.kind, ExprKind::Void)) {
                    write!(f, " else ")?;
                    write_body(f, alt)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Decl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decl::Struct(s) => {
                write!(f, "struct {} {{ ", s.name)?;
                for (i, field) in s.fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.ty)?;
                }
                write!(f, " }}")
            }
            Decl::Func(func) => {
                write!(f, "fn {}(", func.name)?;
                for (i, p) in func.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", p.name, p.ty)?;
                }
                write!(f, ") -> {} ", func.ret_type)?;
                write_body(f, &func.body)
            }
        }
    }
}
