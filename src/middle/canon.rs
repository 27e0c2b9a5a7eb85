//! Canonicalisation of the tree IR.
//!
//! Three phases, run per code fragment:
//!
//! 1. *Linearise*: hoist every `ESeq` out and flatten `Seq`s, so side
//!    effects happen in a known order.  Afterwards no `ESeq` remains and
//!    every `Call` sits directly under `Exp(..)` or `Move(Temp, ..)`.
//! 2. *Basic blocks*: partition the statement list into blocks that start
//!    with a label and end with a jump, deleting unreachable statements.
//! 3. *Trace schedule*: order the blocks so that each conditional
//!    branch's false label follows it directly, then clean up redundant
//!    jumps.

use log::debug;

use crate::back::target::Target;
use crate::common::Map;
use crate::middle::fragment::Fragment;
use crate::middle::frame::WORD_SIZE;
use crate::middle::temp::{Label, TempState};
use crate::middle::tree::*;

struct CanonInfo<'a> {
    ts: &'a mut TempState,
    target: &'static Target,
}

fn nop() -> Stm {
    Stm::Exp(Box::new(Exp::Const {
        value: 0,
        size: WORD_SIZE,
        ty: ty_void(),
    }))
}

fn is_nop(s: &Stm) -> bool {
    matches!(s, Stm::Exp(e) if matches!(**e, Exp::Const { .. }))
}

fn seq(s1: Stm, s2: Stm) -> Stm {
    if is_nop(&s1) {
        return s2;
    }
    if is_nop(&s2) {
        return s1;
    }
    Stm::seq(s1, s2)
}

/// Constants, and anything built only from constants.  The frame pointer
/// counts: it does not change within a function body.
fn is_const(target: &Target, e: &Exp) -> bool {
    match e {
        Exp::Const { .. } => true,
        Exp::Temp { temp, .. } => temp.id == target.fp.id,
        Exp::BinOp { lhs, rhs, .. } => is_const(target, lhs) && is_const(target, rhs),
        _ => false,
    }
}

fn may_define_temps(info: &CanonInfo, s: &Stm, e: &Exp) -> bool {
    match e {
        Exp::Const { .. } | Exp::Name { .. } => false,
        Exp::Temp { temp, .. } => {
            // non-fp machine registers are easily clobbered by calls
            if temp.is_machine() && temp.id != info.target.fp.id {
                return true;
            }
            match s {
                Stm::Move { dst, .. } => {
                    matches!(&**dst, Exp::Temp { temp: d, .. } if d.id == temp.id)
                }
                // calls themselves do not define non-machine temps
                Stm::Exp(_) => false,
                Stm::Jump { .. } | Stm::CJump { .. } | Stm::Label(_) => true,
                Stm::Seq(s1, s2) => {
                    may_define_temps(info, s1, e) || may_define_temps(info, s2, e)
                }
            }
        }
        Exp::BinOp { lhs, rhs, .. } => {
            may_define_temps(info, s, lhs) || may_define_temps(info, s, rhs)
        }
        Exp::Mem { .. } => true,
        Exp::Call { .. } => true,
        Exp::ESeq { .. } => unreachable!("eseqs are gone by the time commuting is asked"),
    }
}

/// Do the statement `s` and the expression `e` commute?  `e` has already
/// had its ESeqs removed and contains no nested calls.
fn commute(info: &CanonInfo, s: &Stm, e: &Exp) -> bool {
    if is_nop(s) || matches!(e, Exp::Name { .. }) || is_const(info.target, e) {
        return true;
    }
    !may_define_temps(info, s, e)
}

/// Pull the side effects out of a list of sibling expressions, hoisting a
/// value into a fresh temp whenever a later sibling's effects might
/// change it.  Calls are always hoisted so they never end up nested.
fn reorder(info: &mut CanonInfo, mut es: Vec<Exp>) -> (Stm, Vec<Exp>) {
    if es.is_empty() {
        return (nop(), vec![]);
    }
    let head = es.remove(0);
    if let Exp::Call { .. } = head {
        let size = head.size();
        let ty = head.ty();
        let t = info.ts.new_temp(size, ty.dispo());
        let temp_exp = Exp::Temp {
            temp: t,
            ty: ty.clone(),
        };
        let new_head = Exp::ESeq {
            stm: Box::new(Stm::Move {
                dst: Box::new(temp_exp.clone()),
                src: Box::new(head),
            }),
            exp: Box::new(temp_exp),
        };
        es.insert(0, new_head);
        return reorder(info, es);
    }

    let (stms, e) = do_exp(info, head);
    let (stms2, rest) = reorder(info, es);

    if commute(info, &stms2, &e) {
        let mut result = vec![e];
        result.extend(rest);
        (seq(stms, stms2), result)
    } else {
        debug!("do not commute: {} <-> {}", stms2, e);
        let t = info.ts.new_temp(e.size(), e.ty().dispo());
        let temp_exp = Exp::Temp {
            temp: t,
            ty: e.ty(),
        };
        let hoist = Stm::Move {
            dst: Box::new(temp_exp.clone()),
            src: Box::new(e),
        };
        let mut result = vec![temp_exp];
        result.extend(rest);
        (seq(seq(stms, hoist), stms2), result)
    }
}

fn do_exp(info: &mut CanonInfo, e: Exp) -> (Stm, Exp) {
    match e {
        Exp::BinOp { op, lhs, rhs } => {
            let (stms, mut es) = reorder(info, vec![*lhs, *rhs]);
            let rhs = es.pop().expect("two reordered operands");
            let lhs = es.pop().expect("two reordered operands");
            (
                stms,
                Exp::BinOp {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            )
        }
        Exp::Mem { addr, size, ty } => {
            let (stms, mut es) = reorder(info, vec![*addr]);
            let addr = es.pop().expect("one reordered operand");
            (
                stms,
                Exp::Mem {
                    addr: Box::new(addr),
                    size,
                    ty,
                },
            )
        }
        Exp::ESeq { stm, exp } => {
            let stms = do_stm(info, *stm);
            let (stms2, e3) = do_exp(info, *exp);
            (seq(stms, stms2), e3)
        }
        Exp::Call {
            func,
            args,
            size,
            ty,
            ptr_map,
        } => {
            let mut list = vec![*func];
            list.extend(args);
            let (stms, mut es) = reorder(info, list);
            let func = es.remove(0);
            (
                stms,
                Exp::Call {
                    func: Box::new(func),
                    args: es,
                    size,
                    ty,
                    ptr_map,
                },
            )
        }
        other => (nop(), other),
    }
}

fn do_stm(info: &mut CanonInfo, s: Stm) -> Stm {
    match s {
        Stm::Seq(s1, s2) => seq(do_stm(info, *s1), do_stm(info, *s2)),
        Stm::Jump { dst, labels } => {
            let (stms, mut es) = reorder(info, vec![*dst]);
            let dst = es.pop().expect("one reordered operand");
            seq(
                stms,
                Stm::Jump {
                    dst: Box::new(dst),
                    labels,
                },
            )
        }
        Stm::CJump { op, lhs, rhs, t, f } => {
            let (stms, mut es) = reorder(info, vec![*lhs, *rhs]);
            let rhs = es.pop().expect("two reordered operands");
            let lhs = es.pop().expect("two reordered operands");
            seq(
                stms,
                Stm::CJump {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                    t,
                    f,
                },
            )
        }
        Stm::Move { dst, src } => do_move(info, *dst, *src),
        Stm::Exp(e) => match *e {
            Exp::Call {
                func,
                args,
                size,
                ty,
                ptr_map,
            } => {
                let mut list = vec![*func];
                list.extend(args);
                let (stms, mut es) = reorder(info, list);
                let func = es.remove(0);
                seq(
                    stms,
                    Stm::Exp(Box::new(Exp::Call {
                        func: Box::new(func),
                        args: es,
                        size,
                        ty,
                        ptr_map,
                    })),
                )
            }
            e => {
                let (stms, mut es) = reorder(info, vec![e]);
                let e = es.pop().expect("one reordered operand");
                seq(stms, Stm::Exp(Box::new(e)))
            }
        },
        s @ Stm::Label(_) => s,
    }
}

fn do_move(info: &mut CanonInfo, dst: Exp, src: Exp) -> Stm {
    match (dst, src) {
        (dst @ Exp::Temp { .. }, Exp::Call { func, args, size, ty, ptr_map }) => {
            let mut list = vec![*func];
            list.extend(args);
            let (stms, mut es) = reorder(info, list);
            let func = es.remove(0);
            seq(
                stms,
                Stm::Move {
                    dst: Box::new(dst),
                    src: Box::new(Exp::Call {
                        func: Box::new(func),
                        args: es,
                        size,
                        ty,
                        ptr_map,
                    }),
                },
            )
        }
        (dst @ Exp::Temp { .. }, src) => {
            let (stms, mut es) = reorder(info, vec![src]);
            let src = es.pop().expect("one reordered operand");
            seq(
                stms,
                Stm::Move {
                    dst: Box::new(dst),
                    src: Box::new(src),
                },
            )
        }
        (Exp::Mem { addr, size, ty }, src) => {
            let (stms, mut es) = reorder(info, vec![*addr, src]);
            let src = es.pop().expect("two reordered operands");
            let addr = es.pop().expect("two reordered operands");
            seq(
                stms,
                Stm::Move {
                    dst: Box::new(Exp::Mem {
                        addr: Box::new(addr),
                        size,
                        ty,
                    }),
                    src: Box::new(src),
                },
            )
        }
        // not produced by translation, but handled defensively by
        // re-sequencing
        (Exp::ESeq { stm, exp }, src) => do_stm(
            info,
            Stm::seq(
                *stm,
                Stm::Move {
                    dst: exp,
                    src: Box::new(src),
                },
            ),
        ),
        (dst, src) => Stm::Move {
            dst: Box::new(dst),
            src: Box::new(src),
        },
    }
}

/// From an arbitrary statement, produce a list of statements satisfying
///   1. no SEQs or ESEQs remain;
///   2. the parent of every CALL is an EXP(..) or a MOVE(TEMP t, ..).
fn linearise(info: &mut CanonInfo, s: Stm) -> Vec<Stm> {
    fn linear(stm: Stm, out: &mut Vec<Stm>) {
        if let Stm::Seq(s1, s2) = stm {
            linear(*s1, out);
            linear(*s2, out);
        } else {
            out.push(stm);
        }
    }
    let mut out = vec![];
    linear(do_stm(info, s), &mut out);
    out
}

fn block_label(block: &[Stm]) -> Label {
    match block.first() {
        Some(Stm::Label(l)) => *l,
        _ => unreachable!("every basic block starts with a label"),
    }
}

/// Partition into blocks that start with a label and end with a jump.
/// Statements that follow a jump without an intervening label are dead
/// and deleted.  Returns the blocks and the synthetic end label that
/// fall-through of the final block targets.
fn basic_blocks(info: &mut CanonInfo, stmts: Vec<Stm>) -> (Vec<Vec<Stm>>, Label) {
    let done = info.ts.new_label();
    let mut blocks: Vec<Vec<Stm>> = vec![];
    let mut curr: Vec<Stm> = vec![];

    if !matches!(stmts.first(), Some(Stm::Label(_))) {
        curr.push(Stm::Label(info.ts.new_label()));
    }

    let mut iter = stmts.into_iter().peekable();
    while let Some(s) = iter.next() {
        debug_assert!(!curr.is_empty() || matches!(s, Stm::Label(_)));

        let is_jump = matches!(s, Stm::Jump { .. } | Stm::CJump { .. });
        curr.push(s);

        if is_jump {
            // anything from here to the next label is unreachable
            while let Some(next) = iter.peek() {
                if matches!(next, Stm::Label(_)) {
                    break;
                }
                debug!("deleting dead code: {}", next);
                iter.next();
            }
        }

        let fallthrough = match iter.peek() {
            None => Some(done),
            Some(Stm::Label(l)) => Some(*l),
            _ => None,
        };
        if let Some(target) = fallthrough {
            if !is_jump {
                curr.push(Stm::jump_to(target));
            }
            blocks.push(std::mem::take(&mut curr));
        }
    }
    assert!(curr.is_empty(), "the final block was not closed");

    if cfg!(debug_assertions) {
        for b in &blocks {
            assert!(matches!(b.first(), Some(Stm::Label(_))));
            assert!(matches!(
                b.last(),
                Some(Stm::Jump { .. } | Stm::CJump { .. })
            ));
        }
    }

    (blocks, done)
}

/// Chain blocks into traces, preferring the false branch of each
/// conditional so it can fall through, then flatten and clean up.
fn trace_schedule(info: &mut CanonInfo, blocks: Vec<Vec<Stm>>, done: Label) -> Vec<Stm> {
    let mut unmarked: Map<Label, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (block_label(b), i))
        .collect();

    let mut order: Vec<usize> = Vec::with_capacity(blocks.len());
    for start in 0..blocks.len() {
        let mut b = start;
        loop {
            if unmarked.remove(&block_label(&blocks[b])).is_none() {
                break;
            }
            order.push(b);
            let succ = match blocks[b].last() {
                Some(Stm::Jump { labels, .. }) => {
                    labels.iter().find_map(|l| unmarked.get(l).copied())
                }
                Some(Stm::CJump { t, f, .. }) => {
                    unmarked.get(f).copied().or_else(|| unmarked.get(t).copied())
                }
                _ => unreachable!("blocks end with a jump"),
            };
            match succ {
                Some(c) => b = c,
                None => break,
            }
        }
    }

    let mut slots: Vec<Option<Vec<Stm>>> = blocks.into_iter().map(Some).collect();
    let mut stmts: Vec<Stm> = order
        .into_iter()
        .flat_map(|i| slots[i].take().expect("each block scheduled once"))
        .collect();
    stmts.push(Stm::Label(done));

    remove_redundant_jumps(&mut stmts);
    put_falses_after_cjumps(info, stmts)
}

/// `JUMP(L1) ; LABEL(L1)` pairs collapse to just the label.
fn remove_redundant_jumps(stmts: &mut Vec<Stm>) {
    loop {
        let mut removed = false;
        let mut i = 0;
        while i + 1 < stmts.len() {
            let redundant = matches!(
                (&stmts[i], &stmts[i + 1]),
                (Stm::Jump { labels, .. }, Stm::Label(l))
                    if labels.len() == 1 && labels[0] == *l
            );
            if redundant {
                stmts.remove(i);
                removed = true;
            } else {
                i += 1;
            }
        }
        if !removed {
            break;
        }
    }
}

/// Rewrite every conditional jump so its false label comes next: invert
/// the comparison when the true label follows, or pad with a fresh label
/// and an unconditional jump when neither does.
fn put_falses_after_cjumps(info: &mut CanonInfo, stmts: Vec<Stm>) -> Vec<Stm> {
    let mut result = Vec::with_capacity(stmts.len());
    let mut iter = stmts.into_iter().peekable();
    while let Some(s) = iter.next() {
        let Stm::CJump { op, lhs, rhs, t, f } = s else {
            result.push(s);
            continue;
        };
        match iter.peek() {
            Some(Stm::Label(l)) if *l == f => {
                result.push(Stm::CJump { op, lhs, rhs, t, f });
            }
            Some(Stm::Label(l)) if *l == t => {
                // invert the operation and flip the labels
                result.push(Stm::CJump {
                    op: op.invert(),
                    lhs,
                    rhs,
                    t: f,
                    f: t,
                });
            }
            _ => {
                let f0 = info.ts.new_label();
                result.push(Stm::CJump { op, lhs, rhs, t, f: f0 });
                result.push(Stm::Label(f0));
                result.push(Stm::jump_to(f));
            }
        }
    }
    result
}

/// Every label referenced by a jump must be defined in the stream, or be
/// the permitted synthetic end label.
fn verify_statements(stmts: &[Stm], allowed: Option<Label>, check: &str) {
    let defined: crate::common::Set<Label> = stmts
        .iter()
        .filter_map(|s| match s {
            Stm::Label(l) => Some(*l),
            _ => None,
        })
        .collect();
    let ok = |l: &Label| defined.contains(l) || allowed == Some(*l);
    for s in stmts {
        match s {
            Stm::Jump { labels, .. } => {
                for l in labels {
                    assert!(ok(l), "{}: missing {} label", check, l);
                }
            }
            Stm::CJump { t, f, .. } => {
                assert!(ok(t), "{}: missing {} label", check, t);
                assert!(ok(f), "{}: missing {} label", check, f);
            }
            _ => {}
        }
    }
}

/// Canonicalise one function body.
pub fn canonicalise_body(ts: &mut TempState, target: &'static Target, body: Stm) -> Vec<Stm> {
    let mut info = CanonInfo { ts, target };
    let stmts = linearise(&mut info, body);
    verify_statements(&stmts, None, "post-linearise");
    let (blocks, done) = basic_blocks(&mut info, stmts);
    for b in &blocks {
        verify_statements(b, Some(done), "post-basic-blocks");
    }
    let stmts = trace_schedule(&mut info, blocks, done);
    verify_statements(&stmts, None, "post-trace-schedule");
    stmts
}

/// Canonicalise every code fragment in place.
pub fn canonicalise(ts: &mut TempState, target: &'static Target, fragments: &mut [Fragment]) {
    for frag in fragments {
        if let Fragment::Code { body, .. } = frag {
            let stm = {
                let mut drained = std::mem::take(body).into_iter();
                let first = drained.next().expect("translated body");
                drained.fold(first, Stm::seq)
            };
            *body = canonicalise_body(ts, target, stm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::target::TARGET_X86_64;
    use crate::front::{parse, rewrite_decompose_equal, verify_and_type_program};
    use crate::middle::frame::{calculate_frames, Layouts};
    use crate::middle::translate::translate_program;

    fn canonicalised(src: &str) -> Vec<Fragment> {
        let mut program = parse(src).unwrap();
        assert_eq!(verify_and_type_program("test.sl", &mut program), 0);
        rewrite_decompose_equal(&mut program);
        let mut layouts = Layouts::new(&program);
        let mut ts = TempState::new();
        let frames = calculate_frames(&mut layouts, &TARGET_X86_64, &mut ts, &program);
        let mut fragments =
            translate_program(&mut layouts, &mut ts, &TARGET_X86_64, &program, frames);
        canonicalise(&mut ts, &TARGET_X86_64, &mut fragments);
        fragments
    }

    fn no_eseq_exp(e: &Exp) {
        match e {
            Exp::ESeq { .. } => panic!("ESeq survived canonicalisation"),
            Exp::BinOp { lhs, rhs, .. } => {
                no_eseq_exp(lhs);
                no_eseq_exp(rhs);
            }
            Exp::Mem { addr, .. } => no_eseq_exp(addr),
            Exp::Call { func, args, .. } => {
                no_eseq_exp(func);
                for a in args {
                    no_eseq_exp(a);
                }
            }
            _ => {}
        }
    }

    /// Calls may only appear as the whole source of `Exp` or
    /// `Move(Temp, ..)`; anywhere else is a canonicalisation bug.
    fn no_nested_call(e: &Exp) {
        match e {
            Exp::Call { .. } => panic!("call in a non-canonical position"),
            Exp::BinOp { lhs, rhs, .. } => {
                no_nested_call(lhs);
                no_nested_call(rhs);
            }
            Exp::Mem { addr, .. } => no_nested_call(addr),
            Exp::ESeq { .. } => panic!("ESeq survived canonicalisation"),
            _ => {}
        }
    }

    fn assert_canonical(stmts: &[Stm]) {
        for s in stmts {
            match s {
                Stm::Seq(..) => panic!("Seq survived linearisation"),
                Stm::Move { dst, src } => {
                    no_eseq_exp(dst);
                    no_eseq_exp(src);
                    no_nested_call(dst);
                    if let Exp::Call { func, args, .. } = &**src {
                        assert!(
                            matches!(&**dst, Exp::Temp { .. }),
                            "call result must move into a temp"
                        );
                        no_nested_call(func);
                        for a in args {
                            no_nested_call(a);
                        }
                    } else {
                        no_nested_call(src);
                    }
                }
                Stm::Exp(e) => {
                    no_eseq_exp(e);
                    if let Exp::Call { func, args, .. } = &**e {
                        no_nested_call(func);
                        for a in args {
                            no_nested_call(a);
                        }
                    } else {
                        no_nested_call(e);
                    }
                }
                Stm::Jump { dst, .. } => {
                    no_eseq_exp(dst);
                    no_nested_call(dst);
                }
                Stm::CJump { lhs, rhs, .. } => {
                    no_eseq_exp(lhs);
                    no_eseq_exp(rhs);
                    no_nested_call(lhs);
                    no_nested_call(rhs);
                }
                Stm::Label(_) => {}
            }
        }
    }

    fn cjump_falses_follow(stmts: &[Stm]) {
        for (i, s) in stmts.iter().enumerate() {
            if let Stm::CJump { f, .. } = s {
                assert!(
                    matches!(stmts.get(i + 1), Some(Stm::Label(l)) if l == f),
                    "false label does not follow its cjump"
                );
            }
        }
    }

    #[test]
    fn nested_news_canonicalise() {
        let fragments = canonicalised(
            "struct N { v: int, n: *N }\n\
             fn mk() -> *N { new N(1, new N(2, 0)) }",
        );
        for frag in &fragments {
            if let Fragment::Code { body, .. } = frag {
                assert_canonical(body);
            }
        }
    }

    #[test]
    fn conditionals_put_false_labels_next() {
        let fragments = canonicalised(
            "fn f(a: int, b: int) -> int { if a < b && b < 100 { a } else { b } }",
        );
        for frag in &fragments {
            if let Fragment::Code { body, .. } = frag {
                assert_canonical(body);
                cjump_falses_follow(body);
            }
        }
    }

    #[test]
    fn loops_and_returns_flatten() {
        let fragments = canonicalised("fn f() -> int { loop { return 3 } }");
        let Fragment::Code { body, .. } = &fragments[0] else {
            panic!();
        };
        assert_canonical(body);
        // exactly one jump to the function end label remains
        let jumps = body
            .iter()
            .filter(|s| matches!(s, Stm::Jump { .. }))
            .count();
        assert!(jumps >= 1);
    }

    #[test]
    fn eseq_in_move_destination_is_resequenced() {
        // not produced by translation; constructed directly to exercise
        // the defensive branch
        let mut ts = TempState::new();
        let t = ts.new_temp(8, crate::middle::temp::PtrDispo::NotPtr);
        let side_effect = Stm::Move {
            dst: Box::new(Exp::Temp {
                temp: t,
                ty: ty_int(),
            }),
            src: Box::new(Exp::Const {
                value: 7,
                size: 8,
                ty: ty_int(),
            }),
        };
        let dst = Exp::ESeq {
            stm: Box::new(side_effect),
            exp: Box::new(Exp::Mem {
                addr: Box::new(Exp::Temp {
                    temp: t,
                    ty: ty_ptr(ty_int()),
                }),
                size: 8,
                ty: ty_int(),
            }),
        };
        let stm = Stm::Move {
            dst: Box::new(dst),
            src: Box::new(Exp::Const {
                value: 1,
                size: 8,
                ty: ty_int(),
            }),
        };
        let stmts = canonicalise_body(&mut ts, &TARGET_X86_64, stm);
        assert_canonical(&stmts);
        // the side effect must now precede the store
        let move_positions: Vec<usize> = stmts
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Stm::Move { .. } => Some(i),
                _ => None,
            })
            .collect();
        assert!(move_positions.len() >= 2);
        let store_pos = stmts
            .iter()
            .position(|s| matches!(s, Stm::Move { dst, .. } if matches!(&**dst, Exp::Mem { .. })))
            .expect("a store to memory");
        assert!(move_positions[0] < store_pos);
    }
}
