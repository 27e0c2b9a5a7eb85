//! The type checker.
//!
//! Walks the parsed program, resolves names against the builtin types and
//! the program's declarations, assigns every expression its type and every
//! variable binding a program-unique id.  It also records, at each call
//! site, the set of variable ids in scope — the layout pass later turns
//! those into the call's frame map.

use crate::common::{id, Id, Map};
use crate::front::ast::*;

/// The builtin type table: name, size, alignment.
pub const BUILTIN_TYPES: [(&str, usize, usize); 3] =
    [("int", 4, 4), ("bool", 1, 1), ("void", 0, 0)];

pub fn int_type() -> Type {
    Type::Name(id("int"))
}

pub fn bool_type() -> Type {
    Type::Name(id("bool"))
}

pub fn void_type() -> Type {
    Type::Name(id("void"))
}

/// Does evaluation of `expr` never fall through to the following
/// expression?  Used to allow a function body to end in a `return` or an
/// endless `loop` rather than a value of the return type.
fn diverges(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Return(_) => true,
        ExprKind::Loop(body) => !body.iter().any(breaks_enclosing_loop),
        ExprKind::If { cons, alt, .. } => {
            cons.last().is_some_and(diverges) && alt.last().is_some_and(diverges)
        }
        _ => false,
    }
}

/// Does `expr` contain a `break` that targets the enclosing loop?  Nested
/// loops capture their own breaks.
fn breaks_enclosing_loop(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Break => true,
        ExprKind::Loop(_) => false,
        ExprKind::If { cond, cons, alt } => {
            breaks_enclosing_loop(cond)
                || cons.iter().any(breaks_enclosing_loop)
                || alt.iter().any(breaks_enclosing_loop)
        }
        ExprKind::BinOp { lhs, rhs, .. } => {
            breaks_enclosing_loop(lhs) || breaks_enclosing_loop(rhs)
        }
        ExprKind::Let { init, .. } => breaks_enclosing_loop(init),
        ExprKind::Call { args, .. } | ExprKind::New { args, .. } => {
            args.iter().any(breaks_enclosing_loop)
        }
        ExprKind::Deref(arg) | ExprKind::AddrOf(arg) => breaks_enclosing_loop(arg),
        ExprKind::Member { obj, .. } => breaks_enclosing_loop(obj),
        ExprKind::Return(Some(arg)) => breaks_enclosing_loop(arg),
        _ => false,
    }
}

/// Is this expression something whose address exists?
pub fn is_lvalue(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Var { .. } | ExprKind::Deref(_) => true,
        ExprKind::Member { obj, .. } => is_lvalue(obj),
        _ => false,
    }
}

struct Scope {
    bindings: Map<Id, (Type, i32)>,
}

struct SemInfo {
    filename: String,
    structs: Map<Id, Vec<(Id, Type)>>,
    funcs: Map<Id, (Vec<Type>, Type)>,
    scopes: Vec<Scope>,
    next_var_id: i32,
    errors: usize,
    current_ret: Type,
    loop_depth: u32,
}

/// Type check `program`, filling in types, variable ids and call-site
/// defined-variable sets.  Returns the number of errors found.
pub fn verify_and_type_program(filename: &str, program: &mut Program) -> usize {
    // collect struct and function signatures up front so declarations can
    // refer to each other in any order
    let mut structs: Map<Id, Vec<(Id, Type)>> = Map::new();
    let mut funcs: Map<Id, (Vec<Type>, Type)> = Map::new();
    let mut errors = 0;
    for decl in &program.decls {
        match decl {
            Decl::Struct(s) => {
                if structs.insert(s.name, s.fields.iter().map(|f| (f.name, f.ty.clone())).collect()).is_some() {
                    eprintln!(
                        "{}:{}: error: duplicate struct definition '{}'",
                        filename, s.line, s.name
                    );
                    errors += 1;
                }
            }
            Decl::Func(f) => {
                let sig = (
                    f.params.iter().map(|p| p.ty.clone()).collect(),
                    f.ret_type.clone(),
                );
                if funcs.insert(f.name, sig).is_some() {
                    eprintln!(
                        "{}:{}: error: duplicate function definition '{}'",
                        filename, f.line, f.name
                    );
                    errors += 1;
                }
            }
        }
    }

    let mut info = SemInfo {
        filename: filename.to_string(),
        structs,
        funcs,
        scopes: vec![],
        next_var_id: 1,
        errors,
        current_ret: void_type(),
        loop_depth: 0,
    };

    for decl in &mut program.decls {
        match decl {
            Decl::Struct(s) => info.check_struct(s),
            Decl::Func(f) => info.check_func(f),
        }
    }
    info.errors
}

impl SemInfo {
    fn err(&mut self, line: u32, msg: String) {
        eprintln!("{}:{}: error: {}", self.filename, line, msg);
        self.errors += 1;
    }

    fn type_exists(&self, ty: &Type) -> bool {
        let name = ty.base_name();
        BUILTIN_TYPES.iter().any(|(n, _, _)| id(n) == name) || self.structs.contains_key(&name)
    }

    fn is_struct(&self, ty: &Type) -> bool {
        matches!(ty, Type::Name(name) if self.structs.contains_key(name))
    }

    fn push_scope(&mut self) {
        self.scopes.push(Scope {
            bindings: Map::new(),
        });
    }

    fn pop_scope(&mut self) {
        self.scopes.pop().expect("scope underflow");
    }

    fn declare(&mut self, line: u32, name: Id, ty: Type) -> i32 {
        let var_id = self.next_var_id;
        self.next_var_id += 1;
        let scope = self.scopes.last_mut().expect("no current scope");
        if scope.bindings.insert(name, (ty, var_id)).is_some() {
            self.err(
                line,
                format!("name '{}' already defined in this scope", name),
            );
        }
        var_id
    }

    fn lookup_var(&self, name: Id) -> Option<&(Type, i32)> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.bindings.get(&name))
    }

    /// The ids of every variable in scope, for a call-site frame map.
    fn defined_vars(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .scopes
            .iter()
            .flat_map(|scope| scope.bindings.values().map(|(_, var_id)| *var_id))
            .collect();
        ids.sort_unstable();
        ids
    }

    fn check_struct(&mut self, decl: &StructDecl) {
        for field in &decl.fields {
            if !self.type_exists(&field.ty) {
                self.err(
                    field.line,
                    format!("unknown type '{}' for field '{}'", field.ty, field.name),
                );
            }
        }
        // a struct may only contain itself through a pointer
        if self.struct_contains(decl.name, decl.name, &mut vec![]) {
            self.err(
                decl.line,
                format!("struct '{}' contains itself by value", decl.name),
            );
        }
    }

    fn struct_contains(&self, outer: Id, needle: Id, seen: &mut Vec<Id>) -> bool {
        if seen.contains(&outer) {
            return false;
        }
        seen.push(outer);
        let Some(fields) = self.structs.get(&outer) else {
            return false;
        };
        for (_, ty) in fields {
            if let Type::Name(name) = ty {
                if *name == needle || self.struct_contains(*name, needle, seen) {
                    return true;
                }
            }
        }
        false
    }

    fn check_func(&mut self, decl: &mut FuncDecl) {
        if !self.type_exists(&decl.ret_type) {
            self.err(
                decl.line,
                format!("unknown return type '{}'", decl.ret_type),
            );
        }
        self.current_ret = decl.ret_type.clone();
        self.push_scope();
        for param in &mut decl.params {
            if !self.type_exists(&param.ty) {
                self.err(
                    param.line,
                    format!("unknown type '{}' for parameter '{}'", param.ty, param.name),
                );
            }
            param.var_id = self.declare(param.line, param.name, param.ty.clone());
        }
        let result_ty = self.check_body(&mut decl.body);
        // the last expression is the function's result, unless control
        // never reaches the end of the body (a trailing return, or a loop
        // with no break)
        let diverging = decl.body.last().is_some_and(diverges);
        if !self.types_agree(&result_ty, &decl.ret_type) && !diverging {
            let line = decl.body.last().map(|e| e.line).unwrap_or(decl.line);
            self.err(
                line,
                format!(
                    "function '{}' returns '{}' but its body has type '{}'",
                    decl.name, decl.ret_type, result_ty
                ),
            );
        }
        self.pop_scope();
    }

    /// Check a sequence of expressions; the sequence's type is the type of
    /// the final expression, or void for an empty sequence.
    fn check_body(&mut self, body: &mut [Expr]) -> Type {
        let mut ty = void_type();
        let n = body.len();
        for (i, expr) in body.iter_mut().enumerate() {
            let t = self.check_expr(expr);
            if i == n - 1 {
                ty = t;
            }
        }
        ty
    }

    fn types_agree(&self, a: &Type, b: &Type) -> bool {
        a == b
    }

    /// Check `expr` against an expected type, allowing the literal `0` to
    /// stand for the null pointer.
    fn check_expr_expecting(&mut self, expr: &mut Expr, expected: &Type, what: &str) {
        if matches!(expected, Type::Ptr(_)) && matches!(expr.kind, ExprKind::Int(0)) {
            expr.ty = Some(expected.clone());
            return;
        }
        let actual = self.check_expr(expr);
        if !self.types_agree(&actual, expected) {
            self.err(
                expr.line,
                format!("{} has type '{}' but '{}' was expected", what, actual, expected),
            );
        }
    }

    fn check_expr(&mut self, expr: &mut Expr) -> Type {
        let line = expr.line;
        let ty = match &mut expr.kind {
            ExprKind::Int(_) => int_type(),
            ExprKind::Bool(_) => bool_type(),
            ExprKind::Void => void_type(),
            ExprKind::BinOp { op, lhs, rhs } => {
                let op = *op;
                let lt = self.check_expr(lhs);
                let rt = self.check_expr(rhs);
                if op.is_logical() {
                    if !self.types_agree(&lt, &bool_type()) || !self.types_agree(&rt, &bool_type())
                    {
                        self.err(line, format!("operands of '{}' must be bool", op));
                    }
                    bool_type()
                } else if matches!(op, BinOp::Eq | BinOp::Ne) {
                    // the null literal is allowed on either side of an
                    // equality with a pointer
                    if matches!(lt, Type::Ptr(_)) && matches!(rhs.kind, ExprKind::Int(0)) {
                        rhs.ty = Some(lt.clone());
                    } else if matches!(rt, Type::Ptr(_)) && matches!(lhs.kind, ExprKind::Int(0)) {
                        lhs.ty = Some(rt.clone());
                    } else if !self.types_agree(&lt, &rt) {
                        self.err(
                            line,
                            format!("cannot compare '{}' with '{}'", lt, rt),
                        );
                    }
                    bool_type()
                } else if op.is_comparison() {
                    if !self.types_agree(&lt, &int_type()) || !self.types_agree(&rt, &int_type()) {
                        self.err(line, format!("operands of '{}' must be int", op));
                    }
                    bool_type()
                } else {
                    if !self.types_agree(&lt, &int_type()) || !self.types_agree(&rt, &int_type()) {
                        self.err(line, format!("operands of '{}' must be int", op));
                    }
                    int_type()
                }
            }
            ExprKind::Let { name, ty, init, var_id } => {
                let name = *name;
                let annotated = ty.clone();
                if !self.type_exists(&annotated) {
                    self.err(line, format!("unknown type '{}'", annotated));
                }
                self.check_expr_expecting(init, &annotated, "let initialiser");
                *var_id = self.declare(line, name, annotated);
                void_type()
            }
            ExprKind::Call {
                func,
                args,
                defined_vars,
            } => {
                let func = *func;
                *defined_vars = self.defined_vars();
                match self.funcs.get(&func).cloned() {
                    None => {
                        self.err(line, format!("call to undefined function '{}'", func));
                        for arg in args {
                            self.check_expr(arg);
                        }
                        int_type()
                    }
                    Some((param_tys, ret)) => {
                        if args.len() != param_tys.len() {
                            self.err(
                                line,
                                format!(
                                    "function '{}' takes {} arguments but {} were given",
                                    func,
                                    param_tys.len(),
                                    args.len()
                                ),
                            );
                        }
                        for (arg, pty) in args.iter_mut().zip(&param_tys) {
                            self.check_expr_expecting(arg, pty, "argument");
                        }
                        ret
                    }
                }
            }
            ExprKind::New {
                struct_name,
                args,
                defined_vars,
            } => {
                let struct_name = *struct_name;
                *defined_vars = self.defined_vars();
                match self.structs.get(&struct_name).cloned() {
                    None => {
                        self.err(line, format!("'new' of unknown struct '{}'", struct_name));
                        for arg in args {
                            self.check_expr(arg);
                        }
                        int_type()
                    }
                    Some(fields) => {
                        if args.len() != fields.len() {
                            self.err(
                                line,
                                format!(
                                    "struct '{}' has {} fields but {} initialisers were given",
                                    struct_name,
                                    fields.len(),
                                    args.len()
                                ),
                            );
                        }
                        for (arg, (fname, fty)) in args.iter_mut().zip(&fields) {
                            self.check_expr_expecting(
                                arg,
                                fty,
                                &format!("initialiser for field '{}'", fname),
                            );
                        }
                        Type::ptr_to(Type::Name(struct_name))
                    }
                }
            }
            ExprKind::Var { name, var_id } => {
                let name = *name;
                match self.lookup_var(name) {
                    None => {
                        self.err(line, format!("use of undeclared variable '{}'", name));
                        int_type()
                    }
                    Some((ty, found_id)) => {
                        *var_id = *found_id;
                        ty.clone()
                    }
                }
            }
            ExprKind::Return(arg) => {
                let expected = self.current_ret.clone();
                match arg {
                    Some(arg) => self.check_expr_expecting(arg, &expected, "return value"),
                    None => {
                        if !self.types_agree(&expected, &void_type()) {
                            self.err(
                                line,
                                format!("return without a value in a function returning '{}'", expected),
                            );
                        }
                    }
                }
                void_type()
            }
            ExprKind::Break => {
                if self.loop_depth == 0 {
                    self.err(line, "'break' outside of a loop".to_string());
                }
                void_type()
            }
            ExprKind::Loop(body) => {
                self.loop_depth += 1;
                self.push_scope();
                self.check_body(body);
                self.pop_scope();
                self.loop_depth -= 1;
                void_type()
            }
            ExprKind::Deref(arg) => {
                let ty = self.check_expr(arg);
                match ty {
                    Type::Ptr(pointee) => (*pointee).clone(),
                    other => {
                        self.err(line, format!("cannot dereference a '{}'", other));
                        int_type()
                    }
                }
            }
            ExprKind::AddrOf(arg) => {
                let ty = self.check_expr(arg);
                if !is_lvalue(arg) {
                    self.err(line, "cannot take the address of this expression".to_string());
                }
                Type::ptr_to(ty)
            }
            ExprKind::Member { obj, field } => {
                let field = *field;
                let obj_ty = self.check_expr(obj);
                if !self.is_struct(&obj_ty) {
                    self.err(
                        line,
                        format!("member access on non-struct type '{}'", obj_ty),
                    );
                    int_type()
                } else {
                    let fields = self.structs[&obj_ty.base_name()].clone();
                    match fields.iter().find(|(name, _)| *name == field) {
                        Some((_, fty)) => fty.clone(),
                        None => {
                            let msg = format!(
                                "struct '{}' has no field '{}'",
                                obj_ty.base_name(),
                                field
                            );
                            self.err(line, msg);
                            int_type()
                        }
                    }
                }
            }
            ExprKind::If { cond, cons, alt } => {
                self.check_expr_expecting(cond, &bool_type(), "if condition");
                self.push_scope();
                let cons_ty = self.check_body(cons);
                self.pop_scope();
                let implicit_else =
                    matches!(alt[..], [ref e] if matches!(e.kind, ExprKind::Void));
                self.push_scope();
                let alt_ty = self.check_body(alt);
                self.pop_scope();
                if implicit_else {
                    if !self.types_agree(&cons_ty, &void_type()) {
                        self.err(
                            line,
                            "an 'if' without an 'else' must have type void".to_string(),
                        );
                    }
                    void_type()
                } else {
                    if !self.types_agree(&cons_ty, &alt_ty) {
                        self.err(
                            line,
                            format!(
                                "'if' branches have mismatched types '{}' and '{}'",
                                cons_ty, alt_ty
                            ),
                        );
                    }
                    cons_ty
                }
            }
        };
        expr.ty = Some(ty.clone());
        ty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse;

    fn check(src: &str) -> (Program, usize) {
        let mut program = parse(src).unwrap();
        let errors = verify_and_type_program("test.sl", &mut program);
        (program, errors)
    }

    #[test]
    fn assigns_types_and_var_ids() {
        let (program, errors) = check("fn g(x: int) -> int { let y: int = x; y }");
        assert_eq!(errors, 0);
        let Decl::Func(f) = &program.decls[0] else {
            panic!();
        };
        assert_eq!(f.params[0].var_id, 1);
        let ExprKind::Let { var_id, .. } = &f.body[0].kind else {
            panic!();
        };
        assert_eq!(*var_id, 2);
        let ExprKind::Var { var_id, .. } = &f.body[1].kind else {
            panic!();
        };
        assert_eq!(*var_id, 2);
        assert_eq!(f.body[1].ty.as_ref().unwrap(), &int_type());
    }

    #[test]
    fn records_defined_vars_at_call_sites() {
        let (program, errors) = check(
            "fn id(x: int) -> int { x }\n\
             fn f() -> int { let a: int = 1; let b: int = id(a); b }",
        );
        assert_eq!(errors, 0);
        let Decl::Func(f) = &program.decls[1] else {
            panic!();
        };
        let ExprKind::Let { init, .. } = &f.body[1].kind else {
            panic!();
        };
        let ExprKind::Call { defined_vars, .. } = &init.kind else {
            panic!();
        };
        // `a` (id 2) is defined at the call site; `b` is not yet
        assert_eq!(defined_vars, &vec![2]);
    }

    #[test]
    fn null_literal_initialises_pointer_fields() {
        let (_, errors) = check(
            "struct N { v: int, n: *N }\n\
             fn mk() -> *N { new N(1, new N(2, 0)) }",
        );
        assert_eq!(errors, 0);
    }

    #[test]
    fn rejects_bad_programs() {
        assert!(check("fn f() -> int { x }").1 > 0);
        assert!(check("fn f() -> int { true }").1 > 0);
        assert!(check("fn f() -> int { break; 0 }").1 > 0);
        assert!(check("fn f(p: *int) -> int { p + 1 }").1 > 0);
        assert!(check("struct S { s: S }").1 > 0);
    }

    #[test]
    fn struct_equality_is_well_typed() {
        let (_, errors) = check(
            "struct P { a: int, b: int }\n\
             fn eq(x: P, y: P) -> bool { x == y }",
        );
        assert_eq!(errors, 0);
    }
}
