//! Activation records and pointer maps.
//!
//! For every function we lay out the incoming parameters and every
//! let-bound local, and precompute a pointer bitmap for each variable:
//! one bit per word of its in-memory representation, set when that word
//! holds a heap pointer.  Call sites later select the subset of variables
//! in scope to form their frame maps.
//!
//! Frame picture (offsets relative to the frame pointer):
//!
//! ```text
//! +---------------+
//! | ...           |
//! | arguments     | +16 and up
//! +---------------+
//! | return addr   | +8
//! +---------------+
//! | prev FP       |  0   <- FP
//! +---------------+
//! | locals        | -8 and down
//! | spill slots   |
//! +---------------+
//! | outgoing args |
//! +---------------+      <- SP
//! ```

use crate::back::target::Target;
use crate::common::{id, Bitmap, Id, Map};
use crate::front::ast::{Decl, Expr, ExprKind, FuncDecl, Program, Type};
use crate::front::semantics::BUILTIN_TYPES;
use crate::middle::temp::{PtrDispo, Temp, TempState};
use crate::middle::tree::{Exp, Stm};

/// Word and pointer size.  Both supported targets are 64-bit.
pub const WORD_SIZE: usize = 8;

pub fn num_words(bytes: usize) -> usize {
    crate::common::round_up(bytes, WORD_SIZE) / WORD_SIZE
}

/// Size and alignment computation for source types, memoised per type.
pub struct Layouts {
    structs: Map<Id, Vec<(Id, Type)>>,
    memo: Map<Type, (usize, usize)>,
}

impl Layouts {
    pub fn new(program: &Program) -> Layouts {
        let structs = program
            .decls
            .iter()
            .filter_map(|decl| match decl {
                Decl::Struct(s) => Some((
                    s.name,
                    s.fields.iter().map(|f| (f.name, f.ty.clone())).collect(),
                )),
                Decl::Func(_) => None,
            })
            .collect();
        Layouts {
            structs,
            memo: Map::new(),
        }
    }

    pub fn is_struct(&self, ty: &Type) -> bool {
        matches!(ty, Type::Name(name) if self.structs.contains_key(name))
    }

    pub fn struct_fields(&self, name: Id) -> &[(Id, Type)] {
        self.structs
            .get(&name)
            .map(|fields| fields.as_slice())
            .unwrap_or_else(|| panic!("unknown struct '{}'", name))
    }

    fn builtin(ty: &Type) -> Option<(usize, usize)> {
        let Type::Name(name) = ty else { return None };
        BUILTIN_TYPES
            .iter()
            .find(|(n, _, _)| id(n) == *name)
            .map(|(_, size, align)| (*size, *align))
    }

    fn size_and_alignment(&mut self, ty: &Type) -> (usize, usize) {
        if let Some(known) = self.memo.get(ty) {
            return *known;
        }
        let computed = match ty {
            Type::Ptr(_) => (WORD_SIZE, WORD_SIZE),
            Type::Name(name) => {
                if let Some(builtin) = Self::builtin(ty) {
                    builtin
                } else {
                    // a struct: fields in order, each padded to its own
                    // alignment, the whole padded to the struct's alignment
                    let fields = self.struct_fields(*name).to_vec();
                    let mut size = 0;
                    let mut alignment = 0;
                    for (_, fty) in &fields {
                        let (fsize, falign) = self.size_and_alignment(fty);
                        size = crate::common::round_up(size, falign);
                        size += fsize;
                        alignment = alignment.max(falign);
                    }
                    (crate::common::round_up(size, alignment.max(1)), alignment)
                }
            }
        };
        self.memo.insert(ty.clone(), computed);
        computed
    }

    pub fn size_of(&mut self, ty: &Type) -> usize {
        self.size_and_alignment(ty).0
    }

    pub fn alignment_of(&mut self, ty: &Type) -> usize {
        self.size_and_alignment(ty).1
    }

    /// One bit per word of the type's representation, set where the word
    /// holds a pointer.
    pub fn ptr_map(&mut self, ty: &Type) -> Bitmap {
        let words = num_words(self.size_of(ty)).max(1);
        let mut map = Bitmap::new(words);
        self.ptr_map_into(ty, &mut map, 0);
        map
    }

    fn ptr_map_into(&mut self, ty: &Type, map: &mut Bitmap, word_offset: usize) {
        match ty {
            Type::Ptr(_) => map.set(word_offset),
            Type::Name(name) => {
                if Self::builtin(ty).is_some() {
                    return;
                }
                let fields = self.struct_fields(*name).to_vec();
                let mut offset = 0;
                for (_, fty) in &fields {
                    let (fsize, falign) = self.size_and_alignment(fty);
                    offset = crate::common::round_up(offset, falign);
                    // fields with sub-word alignment cannot hold pointers
                    if falign >= WORD_SIZE {
                        self.ptr_map_into(fty, map, word_offset + num_words(offset));
                    }
                    offset += fsize;
                }
            }
        }
    }

    /// A record descriptor for the type: one ASCII character per word,
    /// `p` where the word holds a pointer, `n` where it does not.
    ///
    /// ```text
    /// struct X { a: int, b: int, c: *int, d: bool }  =>  "npn"
    /// ```
    pub fn descriptor(&mut self, ty: &Type) -> String {
        let map = self.ptr_map(ty);
        (0..map.len())
            .map(|i| if map.get(i) { 'p' } else { 'n' })
            .collect()
    }

    /// Byte offset, size and type of `field` within `struct_name`.
    pub fn field_offset(&mut self, struct_name: Id, field: Id) -> (usize, usize, Type) {
        let fields = self.struct_fields(struct_name).to_vec();
        let mut offset = 0;
        for (name, fty) in &fields {
            let (fsize, falign) = self.size_and_alignment(fty);
            offset = crate::common::round_up(offset, falign);
            if *name == field {
                return (offset, fsize, fty.clone());
            }
            offset += fsize;
        }
        panic!("struct '{}' has no field '{}'", struct_name, field);
    }
}

/// Where a frame variable lives: at a frame-pointer offset, or in a
/// register-like temp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Frame(i32),
    Reg(Temp),
}

#[derive(Debug)]
pub struct FrameVar {
    pub name: Option<Id>,
    pub size: usize,
    pub alignment: usize,
    pub var_id: i32,
    pub access: Access,
    pub is_formal: bool,
    /// One bit per word of the variable, set where the word is a pointer.
    pub ptr_map: Bitmap,
}

impl FrameVar {
    /// The disposition of the variable's first word, used when the
    /// variable is bound to a temp.
    pub fn dispo(&self) -> PtrDispo {
        if self.ptr_map.get(0) {
            PtrDispo::Ptr
        } else {
            PtrDispo::NotPtr
        }
    }
}

/// A compiler-inserted stack slot for a spilled temporary.  The slot's
/// pointer disposition is the spilled temp's; inherit-disposition slots
/// carry a callee-save register's incoming value.
#[derive(Clone, Copy, Debug)]
pub struct SpillSlot {
    pub temp: Temp,
    pub offset: i32,
}

#[derive(Debug)]
pub struct Frame {
    pub name: Id,
    pub target: &'static Target,
    /// Most negative local offset allocated so far (≤ 0).
    pub last_local_offset: i32,
    /// Next incoming stack-argument offset (≥ 2 words, past the saved FP
    /// and return address).
    pub next_arg_offset: i32,
    next_arg_reg: usize,
    pub outgoing_arg_bytes: usize,
    pub vars: Vec<FrameVar>,
    /// Entry-sequence copies of the callee-save registers, in callee-save
    /// index order; filled by [proc_entry_exit_1].
    pub callee_save_temps: Vec<Temp>,
    /// Slots added by the register allocator.
    pub spills: Vec<SpillSlot>,
}

impl Frame {
    pub fn new(name: Id, target: &'static Target) -> Frame {
        Frame {
            name,
            target,
            last_local_offset: 0,
            next_arg_offset: (2 * target.word_size) as i32,
            next_arg_reg: 0,
            outgoing_arg_bytes: 0,
            vars: Vec::new(),
            callee_save_temps: Vec::new(),
            spills: Vec::new(),
        }
    }

    /// The number of words the prologue must lower the stack pointer by.
    pub fn frame_words(&self) -> usize {
        num_words(crate::common::round_up(
            (-self.last_local_offset) as usize + self.outgoing_arg_bytes,
            self.target.stack_alignment,
        ))
    }

    pub fn var_by_id(&self, var_id: i32) -> &FrameVar {
        self.vars
            .iter()
            .find(|v| v.var_id == var_id)
            .unwrap_or_else(|| panic!("variable id {} has no frame slot", var_id))
    }

    fn var_by_id_mut(&mut self, var_id: i32) -> &mut FrameVar {
        self.vars
            .iter_mut()
            .find(|v| v.var_id == var_id)
            .unwrap_or_else(|| panic!("variable id {} has no frame slot", var_id))
    }

    /// Take the next most negative offset aligned for `alignment`.
    fn alloc_local(&mut self, size: usize, alignment: usize) -> i32 {
        let mut offset = self.last_local_offset - size as i32;
        while offset % alignment as i32 != 0 {
            offset -= 1;
        }
        self.last_local_offset = offset;
        offset
    }

    /// Creates some space in the frame to store a spilled temporary.
    pub fn spill_temporary(&mut self, temp: Temp) -> i32 {
        let offset = self.alloc_local(WORD_SIZE, WORD_SIZE);
        self.spills.push(SpillSlot { temp, offset });
        offset
    }

    /// Ensure at least `required_bytes` of outgoing-argument space below
    /// the locals.
    pub fn reserve_outgoing_arg_space(&mut self, required_bytes: usize) {
        assert_eq!(
            required_bytes,
            crate::common::round_up(required_bytes, self.target.stack_alignment)
        );
        self.outgoing_arg_bytes = self.outgoing_arg_bytes.max(required_bytes);
    }

    /// Total words of the incoming-argument region, including the saved
    /// frame pointer and return address.
    pub fn num_arg_words(&self) -> usize {
        num_words(self.next_arg_offset as usize)
    }

    /// Total words of the locals region, including spill slots.
    pub fn num_local_words(&self) -> usize {
        num_words((-self.last_local_offset) as usize)
    }
}

/// The locals-bitmap word index of the word at frame offset `offset`
/// (`offset < 0`): the word at FP-8 has index 0.
pub fn local_word_index(offset: i32) -> usize {
    debug_assert!(offset < 0 && offset % WORD_SIZE as i32 == 0);
    (-offset) as usize / WORD_SIZE - 1
}

/// The pointer map of one call site: indices of pointer-holding words in
/// the argument and locals regions of the enclosing frame.  The counts
/// and packed bitmaps are produced at emission time, when the locals
/// region has reached its final extent.
#[derive(Clone, Debug, Default)]
pub struct CallSiteMap {
    pub arg_words: Vec<usize>,
    pub local_words: Vec<usize>,
}

/// Restrict the frame's pointer map to the variables in scope at a call
/// site.
pub fn calculate_ptr_maps(frame: &Frame, defined_vars: &[i32]) -> CallSiteMap {
    let mut map = CallSiteMap::default();
    for v in &frame.vars {
        if !defined_vars.contains(&v.var_id) {
            continue;
        }
        let Access::Frame(offset) = v.access else {
            continue;
        };
        // sub-word-aligned variables cannot hold pointers
        if v.alignment < WORD_SIZE {
            continue;
        }
        for i in 0..num_words(v.size) {
            if !v.ptr_map.get(i) {
                continue;
            }
            let word_offset = offset + (i * WORD_SIZE) as i32;
            if offset < 0 {
                map.local_words.push(local_word_index(word_offset));
            } else {
                map.arg_words.push(word_offset as usize / WORD_SIZE);
            }
        }
    }
    map.arg_words.sort_unstable();
    map.local_words.sort_unstable();
    map
}

/// Compute a frame for every function declaration, in program order.
pub fn calculate_frames(
    layouts: &mut Layouts,
    target: &'static Target,
    ts: &mut TempState,
    program: &Program,
) -> Vec<Frame> {
    program
        .decls
        .iter()
        .filter_map(|decl| match decl {
            Decl::Func(f) => Some(calculate_frame(layouts, target, ts, f)),
            Decl::Struct(_) => None,
        })
        .collect()
}

/// The variable a `&` expression names, peeling member accesses.  A
/// dereference stops the walk: the address then derives from a pointer
/// value, not from a variable's stack slot.
fn addrof_base(expr: &Expr) -> Option<i32> {
    match &expr.kind {
        ExprKind::Var { var_id, .. } => Some(*var_id),
        ExprKind::Member { obj, .. } => addrof_base(obj),
        _ => None,
    }
}

/// Variable ids whose stack address is taken somewhere in the body.
/// Those must stay frame-resident; everything else word-sized may live in
/// a register.
fn collect_escaping(exprs: &[Expr], escaping: &mut Vec<i32>) {
    for expr in exprs {
        collect_escaping_expr(expr, escaping);
    }
}

fn collect_escaping_expr(expr: &Expr, escaping: &mut Vec<i32>) {
    match &expr.kind {
        ExprKind::AddrOf(arg) => {
            if let Some(var_id) = addrof_base(arg) {
                escaping.push(var_id);
            }
            collect_escaping_expr(arg, escaping);
        }
        ExprKind::Int(_)
        | ExprKind::Bool(_)
        | ExprKind::Void
        | ExprKind::Var { .. }
        | ExprKind::Break
        | ExprKind::Return(None) => {}
        ExprKind::BinOp { lhs, rhs, .. } => {
            collect_escaping_expr(lhs, escaping);
            collect_escaping_expr(rhs, escaping);
        }
        ExprKind::Let { init, .. } => collect_escaping_expr(init, escaping),
        ExprKind::Call { args, .. } | ExprKind::New { args, .. } => {
            collect_escaping(args, escaping)
        }
        ExprKind::Return(Some(arg)) => collect_escaping_expr(arg, escaping),
        ExprKind::Loop(body) => collect_escaping(body, escaping),
        ExprKind::Deref(arg) => collect_escaping_expr(arg, escaping),
        ExprKind::Member { obj, .. } => collect_escaping_expr(obj, escaping),
        ExprKind::If { cond, cons, alt } => {
            collect_escaping_expr(cond, escaping);
            collect_escaping(cons, escaping);
            collect_escaping(alt, escaping);
        }
    }
}

fn calculate_frame(
    layouts: &mut Layouts,
    target: &'static Target,
    ts: &mut TempState,
    decl: &FuncDecl,
) -> Frame {
    log::debug!("calculating activation record for {}", decl.name);
    let mut frame = Frame::new(decl.name, target);

    let ret_size = layouts.size_of(&decl.ret_type);
    if ret_size > 2 * WORD_SIZE {
        panic!("returns larger than two words are not implemented");
    }

    for param in &decl.params {
        let size = layouts.size_of(&param.ty);
        assert!(size > 0, "zero-size parameter");
        let alignment = layouts.alignment_of(&param.ty);
        let ptr_map = layouts.ptr_map(&param.ty);

        let access = if size <= WORD_SIZE && frame.next_arg_reg < target.arg_registers.len() {
            let reg = target.arg_registers[frame.next_arg_reg].with_size(size);
            frame.next_arg_reg += 1;
            Access::Reg(reg)
        } else {
            let offset = crate::common::round_up(frame.next_arg_offset as usize, alignment) as i32;
            frame.next_arg_offset = offset + size as i32;
            Access::Frame(offset)
        };
        frame.vars.push(FrameVar {
            name: Some(param.name),
            size,
            alignment,
            var_id: param.var_id,
            access,
            is_formal: true,
            ptr_map,
        });
    }

    let mut escaping = Vec::new();
    collect_escaping(&decl.body, &mut escaping);
    for expr in &decl.body {
        alloc_locals_in_expr(layouts, &mut frame, ts, &escaping, expr);
    }
    frame
}

/// Walk an expression and allocate storage for every let binding: a fresh
/// temp for word-sized locals that never escape, a frame slot otherwise.
fn alloc_locals_in_expr(
    layouts: &mut Layouts,
    frame: &mut Frame,
    ts: &mut TempState,
    escaping: &[i32],
    expr: &Expr,
) {
    let recur = |layouts: &mut Layouts, frame: &mut Frame, ts: &mut TempState, e: &Expr| {
        alloc_locals_in_expr(layouts, frame, ts, escaping, e)
    };
    match &expr.kind {
        ExprKind::Let {
            name, ty, init, var_id,
        } => {
            recur(layouts, frame, ts, init);
            let size = layouts.size_of(ty);
            assert!(size > 0, "zero-size let-bound variable");
            let alignment = layouts.alignment_of(ty);
            let ptr_map = layouts.ptr_map(ty);
            let access = if size <= WORD_SIZE && !escaping.contains(var_id) {
                let dispo = if ptr_map.get(0) {
                    PtrDispo::Ptr
                } else {
                    PtrDispo::NotPtr
                };
                Access::Reg(ts.new_temp(size, dispo))
            } else {
                Access::Frame(frame.alloc_local(size, alignment))
            };
            frame.vars.push(FrameVar {
                name: Some(*name),
                size,
                alignment,
                var_id: *var_id,
                access,
                is_formal: false,
                ptr_map,
            });
        }
        ExprKind::Int(_)
        | ExprKind::Bool(_)
        | ExprKind::Void
        | ExprKind::Var { .. }
        | ExprKind::Break
        | ExprKind::Return(None) => {}
        ExprKind::BinOp { lhs, rhs, .. } => {
            recur(layouts, frame, ts, lhs);
            recur(layouts, frame, ts, rhs);
        }
        ExprKind::Call { args, .. } | ExprKind::New { args, .. } => {
            for arg in args {
                recur(layouts, frame, ts, arg);
            }
        }
        ExprKind::Return(Some(arg)) => recur(layouts, frame, ts, arg),
        ExprKind::Loop(body) => {
            for e in body {
                recur(layouts, frame, ts, e);
            }
        }
        ExprKind::Deref(arg) | ExprKind::AddrOf(arg) => recur(layouts, frame, ts, arg),
        ExprKind::Member { obj, .. } => recur(layouts, frame, ts, obj),
        ExprKind::If { cond, cons, alt } => {
            recur(layouts, frame, ts, cond);
            for e in cons {
                recur(layouts, frame, ts, e);
            }
            for e in alt {
                recur(layouts, frame, ts, e);
            }
        }
    }
}

/// Entry/exit shuffle, run on each translated function body:
///
/// 1. every register-passed formal is moved into a fresh temp, freeing the
///    argument register immediately;
/// 2. every callee-save register is copied into a fresh
///    inherit-disposition temp at entry and restored at exit, leaving the
///    register allocator to decide where those copies live.
pub fn proc_entry_exit_1(ts: &mut TempState, frame: &mut Frame, body: Stm) -> Stm {
    let mut arg_moves: Option<Stm> = None;
    let formal_ids: Vec<i32> = frame
        .vars
        .iter()
        .filter(|v| v.is_formal && matches!(v.access, Access::Reg(_)))
        .map(|v| v.var_id)
        .collect();
    for var_id in formal_ids {
        let (param_reg, dispo, size) = {
            let v = frame.var_by_id(var_id);
            let Access::Reg(reg) = v.access else {
                unreachable!()
            };
            (reg, v.dispo(), v.size)
        };
        let fresh = ts.new_temp(size, dispo);
        frame.var_by_id_mut(var_id).access = Access::Reg(fresh);
        let mv = Stm::Move {
            dst: Box::new(Exp::Temp {
                temp: fresh,
                ty: crate::middle::tree::ty_void(),
            }),
            src: Box::new(Exp::Temp {
                temp: param_reg,
                ty: crate::middle::tree::ty_void(),
            }),
        };
        arg_moves = Some(match arg_moves {
            Some(stm) => Stm::seq(stm, mv),
            None => mv,
        });
    }
    let mut body = match arg_moves {
        Some(moves) => Stm::seq(moves, body),
        None => body,
    };

    let word = frame.target.word_size;
    let save_temps: Vec<Temp> = frame
        .target
        .callee_saves
        .iter()
        .map(|_| ts.new_temp(word, PtrDispo::Inherit))
        .collect();

    let mut saves: Option<Stm> = None;
    for (cs, save) in frame.target.callee_saves.iter().zip(&save_temps) {
        let mv = Stm::Move {
            dst: Box::new(Exp::Temp {
                temp: *save,
                ty: crate::middle::tree::ty_void(),
            }),
            src: Box::new(Exp::Temp {
                temp: *cs,
                ty: crate::middle::tree::ty_void(),
            }),
        };
        saves = Some(match saves {
            Some(stm) => Stm::seq(stm, mv),
            None => mv,
        });
    }
    let mut restores: Option<Stm> = None;
    for (cs, save) in frame.target.callee_saves.iter().zip(&save_temps) {
        let mv = Stm::Move {
            dst: Box::new(Exp::Temp {
                temp: *cs,
                ty: crate::middle::tree::ty_void(),
            }),
            src: Box::new(Exp::Temp {
                temp: *save,
                ty: crate::middle::tree::ty_void(),
            }),
        };
        restores = Some(match restores {
            Some(stm) => Stm::seq(stm, mv),
            None => mv,
        });
    }
    frame.callee_save_temps = save_temps;

    if let Some(saves) = saves {
        body = Stm::seq(saves, body);
    }
    if let Some(restores) = restores {
        body = Stm::seq(body, restores);
    }
    body
}

/// The callee-save index whose incoming value `temp` carries, if `temp`
/// is one of the entry-sequence saves.
pub fn callee_save_index(frame: &Frame, temp: Temp) -> Option<usize> {
    frame.callee_save_temps.iter().position(|t| *t == temp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::target::{TARGET_ARM64, TARGET_X86_64};
    use crate::front::{parse, verify_and_type_program};

    fn prepared(src: &str) -> (Program, Layouts) {
        let mut program = parse(src).unwrap();
        assert_eq!(verify_and_type_program("test.sl", &mut program), 0);
        let layouts = Layouts::new(&program);
        (program, layouts)
    }

    #[test]
    fn struct_layout_padding_and_alignment() {
        let (program, mut layouts) = prepared(
            "struct X { a: int, b: int, c: *int, d: bool }\n\
             fn f() -> int { 0 }",
        );
        let _ = &program;
        let x = Type::Name(id("X"));
        assert_eq!(layouts.size_of(&x), 24);
        assert_eq!(layouts.alignment_of(&x), 8);
        assert_eq!(layouts.descriptor(&x), "npn");
    }

    #[test]
    fn linked_node_descriptor() {
        let (_, mut layouts) = prepared(
            "struct N { v: int, n: *N }\n\
             fn f() -> int { 0 }",
        );
        let n = Type::Name(id("N"));
        assert_eq!(layouts.size_of(&n), 16);
        assert_eq!(layouts.descriptor(&n), "np");
        let map = layouts.ptr_map(&n);
        assert!(!map.get(0));
        assert!(map.get(1));
    }

    #[test]
    fn nested_struct_pointer_words() {
        let (_, mut layouts) = prepared(
            "struct I { p: *int, v: int }\n\
             struct O { w: int, i: I }\n\
             fn f() -> int { 0 }",
        );
        let o = Type::Name(id("O"));
        // w pads to 8, then i's pointer lands at word 1
        assert_eq!(layouts.descriptor(&o), "npn");
    }

    #[test]
    fn local_offsets_are_aligned() {
        let (program, mut layouts) = prepared(
            "struct P { a: int, b: bool, q: *int }\n\
             fn f(a: int, b: bool, p: *P) -> int { let x: P = *p; let y: int = a; let z: *int = &y; y }",
        );
        let mut ts = TempState::new();
        let frames = calculate_frames(&mut layouts, &TARGET_ARM64, &mut ts, &program);
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        // x (a struct) and y (address taken) are frame-resident, z stays
        // in a register
        let frame_resident: Vec<_> = frame
            .vars
            .iter()
            .filter(|v| matches!(v.access, Access::Frame(_)))
            .collect();
        assert_eq!(frame_resident.len(), 2);
        let z = frame.vars.iter().find(|v| v.name == Some(id("z"))).unwrap();
        assert!(matches!(z.access, Access::Reg(_)));
        for v in &frame.vars {
            if let Access::Frame(offset) = v.access {
                assert_eq!(
                    offset.rem_euclid(v.alignment as i32),
                    0,
                    "offset {} of {:?} not {}-aligned",
                    offset,
                    v.name,
                    v.alignment
                );
                assert!(offset < 0, "locals grow downward");
            }
        }
        // frame size is a multiple of the stack alignment
        let bytes = frame.frame_words() * WORD_SIZE;
        assert_eq!(bytes % TARGET_ARM64.stack_alignment, 0);
    }

    #[test]
    fn first_params_go_in_registers_then_stack() {
        let params: Vec<String> = (0..8).map(|i| format!("p{i}: int")).collect();
        let src = format!("fn f({}) -> int {{ 0 }}", params.join(", "));
        let (program, mut layouts) = prepared(&src);
        let mut ts = TempState::new();
        let frames = calculate_frames(&mut layouts, &TARGET_X86_64, &mut ts, &program);
        let frame = &frames[0];
        let in_regs = frame
            .vars
            .iter()
            .filter(|v| matches!(v.access, Access::Reg(_)))
            .count();
        assert_eq!(in_regs, 6);
        let stack_offsets: Vec<i32> = frame
            .vars
            .iter()
            .filter_map(|v| match v.access {
                Access::Frame(o) => Some(o),
                _ => None,
            })
            .collect();
        // the two overflow parameters start past the saved FP and return
        // address
        assert_eq!(stack_offsets, vec![16, 20]);
    }

    #[test]
    fn call_site_map_selects_defined_pointers() {
        // taking &a keeps the pointer local frame-resident, so it shows
        // up in call-site maps
        let (program, mut layouts) = prepared(
            "struct N { v: int, n: *N }\n\
             fn g(p: *N) -> int { 0 }\n\
             fn f() -> int { let a: *N = 0; let b: **N = &a; let i: int = 1; g(a) }",
        );
        let mut ts = TempState::new();
        let frames = calculate_frames(&mut layouts, &TARGET_ARM64, &mut ts, &program);
        let frame = &frames[1];
        // `a` is a pointer local at fp-8; `i` is not a pointer
        let a = frame.vars.iter().find(|v| v.name == Some(id("a"))).unwrap();
        let Access::Frame(offset) = a.access else {
            panic!("pointer local should be frame-resident");
        };
        let map = calculate_ptr_maps(frame, &[a.var_id]);
        assert_eq!(map.local_words, vec![local_word_index(offset)]);
        assert!(map.arg_words.is_empty());
        // nothing defined: nothing mapped
        let empty = calculate_ptr_maps(frame, &[]);
        assert!(empty.local_words.is_empty());
    }

    #[test]
    fn spill_slots_extend_the_locals_region() {
        let (program, mut layouts) = prepared("fn f() -> int { 0 }");
        let mut ts = TempState::new();
        let mut frames = calculate_frames(&mut layouts, &TARGET_X86_64, &mut ts, &program);
        let frame = &mut frames[0];
        let t = ts.new_temp(8, PtrDispo::Ptr);
        let offset = frame.spill_temporary(t);
        assert_eq!(offset, -8);
        assert_eq!(offset % WORD_SIZE as i32, 0);
        assert_eq!(frame.num_local_words(), 1);
        assert_eq!(local_word_index(offset), 0);
    }
}
