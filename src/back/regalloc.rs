//! Graph-colouring register allocation.
//!
//! Iterated colouring with conservative coalescing: build the
//! interference graph, simplify/coalesce/freeze/select-spill until the
//! worklists drain, assign colours off the select stack, and if any node
//! failed to colour, rewrite the program with spill code and start over.
//!
//! Nodes and moves are tracked with state tags rather than by physically
//! moving list cells; worklists are queues whose stale entries are
//! skipped on pop.

use std::collections::VecDeque;

use log::debug;

use crate::back::assem::{Allocation, Instr};
use crate::back::graph::NodeId;
use crate::back::liveness::{
    instrs2graph, interference_graph, temps_contain, FlowGraph, IGraph, LivenessResult,
};
use crate::back::target::Target;
use crate::common::Map;
use crate::middle::frame::Frame;
use crate::middle::temp::{Label, Temp, TempState};

pub struct RegAllocResult {
    pub instrs: Vec<Instr>,
    pub allocation: Allocation,
    /// Live-out temps at every label of the final program, for the
    /// callee-save bitmaps of the frame maps.
    pub live_outs_by_label: Map<Label, Vec<Temp>>,
    /// Per label, the spilled temps that were live across it when their
    /// spill was decided; their values sit in spill slots there.
    pub spill_live_by_label: Map<Label, Vec<Temp>>,
}

/// Allocate registers for one function's instruction list, spilling into
/// `frame` as needed.  `coalesce` switches move coalescing, kept as a
/// debugging aid.
pub fn alloc(
    ts: &mut TempState,
    frame: &mut Frame,
    mut instrs: Vec<Instr>,
    coalesce: bool,
) -> RegAllocResult {
    let mut spill_live_by_label: Map<Label, Vec<Temp>> = Map::new();
    loop {
        let flow = instrs2graph(&instrs);
        let LivenessResult { igraph, live_outs } = interference_graph(&flow);
        let outcome = color(igraph, &flow, frame.target, coalesce);

        if outcome.spills.is_empty() {
            let mut live_outs_by_label = Map::new();
            for (i, instr) in instrs.iter().enumerate() {
                if let Instr::Label { label, .. } = instr {
                    live_outs_by_label.insert(*label, live_outs[i].clone());
                }
            }
            remove_dead_moves(&outcome.allocation, &mut instrs);
            return RegAllocResult {
                instrs,
                allocation: outcome.allocation,
                live_outs_by_label,
                spill_live_by_label,
            };
        }

        // before the rewrite destroys them, note where the spilled values
        // are live: their slots hold pointers exactly there
        for (i, instr) in instrs.iter().enumerate() {
            if let Instr::Label { label, .. } = instr {
                for t in &outcome.spills {
                    if temps_contain(&live_outs[i], *t) {
                        spill_live_by_label.entry(*label).or_default().push(*t);
                    }
                }
            }
        }
        instrs = rewrite_spills(ts, frame, instrs, &outcome.spills);
    }
}

/// Rewrite the program for each actual spill: give the temp a frame slot,
/// rename each def and use to a fresh temp, and bracket them with a store
/// or a load.
fn rewrite_spills(
    ts: &mut TempState,
    frame: &mut Frame,
    instrs: Vec<Instr>,
    spills: &[Temp],
) -> Vec<Instr> {
    let backend = frame.target.backend;
    let mut result = instrs;
    for &t in spills {
        let offset = frame.spill_temporary(t);
        debug!("spilling t{} to frame offset {}", t.id, offset);
        let mut rewritten = Vec::with_capacity(result.len() + 8);
        for instr in result {
            match instr {
                Instr::Oper {
                    asm,
                    mut dst,
                    mut src,
                    jump,
                } => {
                    let mut load = None;
                    let mut store = None;
                    if src.contains(&t) {
                        let fresh = ts.new_temp(t.size, t.dispo);
                        for s in src.iter_mut() {
                            if *s == t {
                                *s = fresh;
                            }
                        }
                        load = Some(backend.load_temp(offset, fresh));
                    }
                    if dst.contains(&t) {
                        let fresh = ts.new_temp(t.size, t.dispo);
                        for d in dst.iter_mut() {
                            if *d == t {
                                *d = fresh;
                            }
                        }
                        store = Some(backend.store_temp(offset, fresh));
                    }
                    rewritten.extend(load);
                    rewritten.push(Instr::Oper { asm, dst, src, jump });
                    rewritten.extend(store);
                }
                Instr::Move {
                    asm,
                    mut dst,
                    mut src,
                } => {
                    let mut load = None;
                    let mut store = None;
                    if src == t {
                        let fresh = ts.new_temp(t.size, t.dispo);
                        src = fresh;
                        load = Some(backend.load_temp(offset, fresh));
                    }
                    if dst == t {
                        let fresh = ts.new_temp(t.size, t.dispo);
                        dst = fresh;
                        store = Some(backend.store_temp(offset, fresh));
                    }
                    rewritten.extend(load);
                    rewritten.push(Instr::Move { asm, dst, src });
                    rewritten.extend(store);
                }
                label @ Instr::Label { .. } => rewritten.push(label),
            }
        }
        result = rewritten;
    }
    result
}

/// Delete moves whose operands were assigned the same register.
fn remove_dead_moves(allocation: &Allocation, instrs: &mut Vec<Instr>) {
    instrs.retain(|instr| {
        let Instr::Move { dst, src, .. } = instr else {
            return true;
        };
        if dst.size != src.size {
            return true;
        }
        allocation[&dst.id] != allocation[&src.id]
    });
}

// ---------------------------------------------------------------------
// colouring
// ---------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum NodeState {
    Precolored,
    Initial,
    Simplify,
    Freeze,
    Spill,
    Stack,
    Coalesced,
    Colored,
    Spilled,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum MoveState {
    Worklist,
    Active,
    Coalesced,
    Constrained,
    Frozen,
}

struct ColorOutcome {
    allocation: Allocation,
    spills: Vec<Temp>,
}

struct Coloring<'a> {
    k: usize,
    igraph: IGraph,
    flow: &'a FlowGraph,
    target: &'static Target,

    state: Vec<NodeState>,
    color: Vec<Option<usize>>,
    degree: Vec<i32>,
    adj_list: Vec<Vec<NodeId>>,
    alias: Vec<Option<NodeId>>,

    moves: Vec<(NodeId, NodeId)>,
    move_state: Vec<MoveState>,
    move_list: Vec<Vec<usize>>,

    simplify_worklist: Vec<NodeId>,
    freeze_worklist: VecDeque<NodeId>,
    spill_worklist: Vec<NodeId>,
    worklist_moves: VecDeque<usize>,

    select_stack: Vec<NodeId>,
    coalesced_nodes: Vec<NodeId>,
    spilled_nodes: Vec<NodeId>,
}

fn color(
    igraph: IGraph,
    flow: &FlowGraph,
    target: &'static Target,
    coalesce: bool,
) -> ColorOutcome {
    let n = igraph.gtemp.len();
    let k = target.registers.len();

    let mut coloring = Coloring {
        k,
        flow,
        target,
        state: vec![NodeState::Initial; n],
        color: vec![None; n],
        degree: vec![0; n],
        adj_list: vec![Vec::new(); n],
        alias: vec![None; n],
        moves: igraph.moves.clone(),
        move_state: Vec::new(),
        move_list: vec![Vec::new(); n],
        simplify_worklist: Vec::new(),
        freeze_worklist: VecDeque::new(),
        spill_worklist: Vec::new(),
        worklist_moves: VecDeque::new(),
        select_stack: Vec::new(),
        coalesced_nodes: Vec::new(),
        spilled_nodes: Vec::new(),
        igraph,
    };

    for i in 0..n {
        let t = coloring.igraph.gtemp[i];
        if target.is_machine_reg(t) {
            coloring.state[i] = NodeState::Precolored;
            coloring.color[i] = Some(t.id as usize);
            // precolored nodes never simplify; treat their degree as
            // unbounded so conservative coalescing counts them
            coloring.degree[i] = i32::MAX;
        } else {
            coloring.adj_list[i] = coloring.igraph.graph.adj(NodeId(i)).collect();
            coloring.degree[i] = coloring.adj_list[i].len() as i32;
        }
    }

    let initial_state = if coalesce {
        MoveState::Worklist
    } else {
        MoveState::Frozen
    };
    for (m, (d, s)) in coloring.moves.clone().into_iter().enumerate() {
        coloring.move_state.push(initial_state);
        coloring.move_list[d.0].push(m);
        coloring.move_list[s.0].push(m);
        if coalesce {
            coloring.worklist_moves.push_back(m);
        }
    }

    // MakeWorklist
    for i in 0..n {
        if coloring.state[i] != NodeState::Initial {
            continue;
        }
        let node = NodeId(i);
        if coloring.degree[i] >= k as i32 {
            coloring.state[i] = NodeState::Spill;
            coloring.spill_worklist.push(node);
        } else if coalesce && coloring.is_move_related(node) {
            coloring.state[i] = NodeState::Freeze;
            coloring.freeze_worklist.push_back(node);
        } else {
            coloring.state[i] = NodeState::Simplify;
            coloring.simplify_worklist.push(node);
        }
    }

    loop {
        if let Some(node) = coloring.pop_simplify() {
            coloring.simplify(node);
        } else if let Some(m) = coloring.pop_move() {
            coloring.coalesce(m);
        } else if let Some(node) = coloring.pop_freeze() {
            coloring.freeze(node);
        } else if coloring.select_spill() {
            // a spill candidate moved to the simplify worklist
        } else {
            break;
        }
    }

    coloring.assign_colors();
    coloring.into_outcome()
}

impl Coloring<'_> {
    fn is_precolored(&self, n: NodeId) -> bool {
        self.state[n.0] == NodeState::Precolored
    }

    fn get_alias(&self, mut n: NodeId) -> NodeId {
        while self.state[n.0] == NodeState::Coalesced {
            n = self.alias[n.0].expect("coalesced nodes have aliases");
        }
        n
    }

    /// Neighbours that are still in play: not simplified away, not
    /// swallowed by coalescing.
    fn adjacent(&self, n: NodeId) -> Vec<NodeId> {
        self.adj_list[n.0]
            .iter()
            .copied()
            .filter(|m| {
                !matches!(
                    self.state[m.0],
                    NodeState::Stack | NodeState::Coalesced
                )
            })
            .collect()
    }

    fn node_moves(&self, n: NodeId) -> Vec<usize> {
        self.move_list[n.0]
            .iter()
            .copied()
            .filter(|m| {
                matches!(
                    self.move_state[*m],
                    MoveState::Active | MoveState::Worklist
                )
            })
            .collect()
    }

    fn is_move_related(&self, n: NodeId) -> bool {
        !self.node_moves(n).is_empty()
    }

    fn pop_simplify(&mut self) -> Option<NodeId> {
        while let Some(n) = self.simplify_worklist.pop() {
            if self.state[n.0] == NodeState::Simplify {
                return Some(n);
            }
        }
        None
    }

    fn pop_freeze(&mut self) -> Option<NodeId> {
        while let Some(n) = self.freeze_worklist.pop_front() {
            if self.state[n.0] == NodeState::Freeze {
                return Some(n);
            }
        }
        None
    }

    fn pop_move(&mut self) -> Option<usize> {
        while let Some(m) = self.worklist_moves.pop_front() {
            if self.move_state[m] == MoveState::Worklist {
                return Some(m);
            }
        }
        None
    }

    /// Move active moves involving `n` (through its alias) back to the
    /// worklist.
    fn enable_moves_node(&mut self, n: NodeId) {
        let alias = self.get_alias(n);
        for m in 0..self.moves.len() {
            if self.move_state[m] != MoveState::Active {
                continue;
            }
            let (d, s) = self.moves[m];
            if self.get_alias(d) == alias || self.get_alias(s) == alias {
                self.move_state[m] = MoveState::Worklist;
                self.worklist_moves.push_back(m);
            }
        }
    }

    fn enable_moves_adj(&mut self, m: NodeId) {
        self.enable_moves_node(m);
        for n in self.adjacent(m) {
            self.enable_moves_node(n);
        }
    }

    fn decrement_degree(&mut self, m: NodeId) {
        if self.is_precolored(m) {
            return;
        }
        let d = self.degree[m.0];
        if d == 0 {
            return;
        }
        self.degree[m.0] = d - 1;
        if d == self.k as i32 {
            // dropping from K to K-1 may enable moves on the neighbours
            self.enable_moves_adj(m);
            if self.state[m.0] == NodeState::Spill {
                if self.is_move_related(m) {
                    self.state[m.0] = NodeState::Freeze;
                    self.freeze_worklist.push_back(m);
                } else {
                    self.state[m.0] = NodeState::Simplify;
                    self.simplify_worklist.push(m);
                }
            }
        }
    }

    fn simplify(&mut self, node: NodeId) {
        self.state[node.0] = NodeState::Stack;
        self.select_stack.push(node);
        for m in self.adjacent(node) {
            self.decrement_degree(m);
        }
    }

    // ok to coalesce t's edge into r?
    fn ok(&self, t: NodeId, r: NodeId) -> bool {
        self.degree[t.0] < self.k as i32
            || self.is_precolored(t)
            || self.igraph.graph.is_adj(t, r)
    }

    /// George: safe to merge `v` into precolored `u` when every
    /// neighbour of `v` is low-degree, precolored, or already clashes
    /// with `u`.
    fn all_adjacent_ok(&self, u: NodeId, v: NodeId) -> bool {
        self.adjacent(v).into_iter().all(|t| self.ok(t, u))
    }

    /// Briggs: the merged node is safe when the union of the neighbours
    /// has fewer than K members of significant degree.
    fn conservative(&self, u: NodeId, v: NodeId) -> bool {
        let mut seen = crate::common::Set::new();
        let mut significant = 0;
        for t in self.adjacent(u).into_iter().chain(self.adjacent(v)) {
            if seen.insert(t) && self.degree[t.0] >= self.k as i32 {
                significant += 1;
            }
        }
        significant < self.k
    }

    fn add_work_list(&mut self, u: NodeId) {
        if !self.is_precolored(u)
            && !self.is_move_related(u)
            && self.degree[u.0] < self.k as i32
            && self.state[u.0] == NodeState::Freeze
        {
            self.state[u.0] = NodeState::Simplify;
            self.simplify_worklist.push(u);
        }
    }

    fn add_edge(&mut self, u: NodeId, v: NodeId) {
        if u == v || self.igraph.graph.is_adj(u, v) {
            return;
        }
        self.igraph.graph.add_edge(u, v);
        if !self.is_precolored(u) {
            self.degree[u.0] += 1;
            self.adj_list[u.0].push(v);
        }
        if !self.is_precolored(v) {
            self.degree[v.0] += 1;
            self.adj_list[v.0].push(u);
        }
    }

    fn combine(&mut self, u: NodeId, v: NodeId) {
        self.state[v.0] = NodeState::Coalesced;
        self.coalesced_nodes.push(v);
        self.alias[v.0] = Some(u);

        let v_moves = self.move_list[v.0].clone();
        self.move_list[u.0].extend(v_moves);
        self.enable_moves_node(v);

        for t in self.adjacent(v) {
            self.add_edge(t, u);
            self.decrement_degree(t);
        }

        if self.degree[u.0] >= self.k as i32 && self.state[u.0] == NodeState::Freeze {
            self.state[u.0] = NodeState::Spill;
            self.spill_worklist.push(u);
        }
    }

    fn coalesce(&mut self, m: usize) {
        let (x0, y0) = self.moves[m];
        let x = self.get_alias(x0);
        let y = self.get_alias(y0);
        let (u, v) = if self.is_precolored(y) { (y, x) } else { (x, y) };

        if u == v {
            self.move_state[m] = MoveState::Coalesced;
            self.add_work_list(u);
        } else if self.is_precolored(v) || self.igraph.graph.is_adj(u, v) {
            self.move_state[m] = MoveState::Constrained;
            self.add_work_list(u);
            self.add_work_list(v);
        } else {
            let safe = if self.is_precolored(u) {
                self.all_adjacent_ok(u, v)
            } else {
                self.conservative(u, v)
            };
            if safe {
                self.move_state[m] = MoveState::Coalesced;
                self.combine(u, v);
                self.add_work_list(u);
            } else {
                self.move_state[m] = MoveState::Active;
            }
        }
    }

    fn freeze(&mut self, u: NodeId) {
        self.state[u.0] = NodeState::Simplify;
        self.simplify_worklist.push(u);
        self.freeze_moves(u);
    }

    /// Give up on coalescing the moves of `u`; its partners may become
    /// simplifiable.
    fn freeze_moves(&mut self, u: NodeId) {
        let u_alias = self.get_alias(u);
        for m in self.node_moves(u) {
            let (x, y) = self.moves[m];
            let v = if self.get_alias(y) == u_alias {
                self.get_alias(x)
            } else {
                self.get_alias(y)
            };
            self.move_state[m] = MoveState::Frozen;
            if !self.is_move_related(v)
                && self.degree[v.0] < self.k as i32
                && self.state[v.0] == NodeState::Freeze
            {
                self.state[v.0] = NodeState::Simplify;
                self.simplify_worklist.push(v);
            }
        }
    }

    /// Number of uses plus defs in the flow graph, the spill heuristic.
    fn spill_cost(&self, node: NodeId) -> usize {
        let t = self.igraph.gtemp[node.0];
        let mut cost = 0;
        for i in 0..self.flow.def.len() {
            if temps_contain(&self.flow.def[i], t) {
                cost += 1;
            }
            if temps_contain(&self.flow.uses[i], t) {
                cost += 1;
            }
        }
        cost
    }

    fn select_spill(&mut self) -> bool {
        let state = &self.state;
        self.spill_worklist
            .retain(|n| matches!(state[n.0], NodeState::Spill));
        if self.spill_worklist.is_empty() {
            return false;
        }
        let mut best = self.spill_worklist[0];
        let mut best_cost = self.spill_cost(best);
        for n in &self.spill_worklist[1..] {
            let cost = self.spill_cost(*n);
            if cost < best_cost {
                best = *n;
                best_cost = cost;
            }
        }
        debug!(
            "spill candidate t{} (cost {})",
            self.igraph.gtemp[best.0].id,
            best_cost
        );
        self.state[best.0] = NodeState::Simplify;
        self.simplify_worklist.push(best);
        self.freeze_moves(best);
        true
    }

    fn assign_colors(&mut self) {
        while let Some(node) = self.select_stack.pop() {
            let mut ok_colors = vec![true; self.k];
            for w in &self.adj_list[node.0] {
                let wa = self.get_alias(*w);
                if matches!(
                    self.state[wa.0],
                    NodeState::Colored | NodeState::Precolored
                ) {
                    if let Some(c) = self.color[wa.0] {
                        ok_colors[c] = false;
                    }
                }
            }
            match ok_colors.iter().position(|free| *free) {
                None => {
                    self.state[node.0] = NodeState::Spilled;
                    self.spilled_nodes.push(node);
                }
                Some(c) => {
                    self.state[node.0] = NodeState::Colored;
                    self.color[node.0] = Some(c);
                }
            }
        }
        for v in self.coalesced_nodes.clone() {
            let alias = self.get_alias(v);
            self.color[v.0] = self.color[alias.0];
        }
    }

    fn into_outcome(self) -> ColorOutcome {
        let mut allocation = Allocation::new();
        let mut spills = Vec::new();
        for i in 0..self.igraph.gtemp.len() {
            let t = self.igraph.gtemp[i];
            match self.state[i] {
                NodeState::Precolored => {
                    allocation.insert(t.id, self.target.registers[t.id as usize]);
                }
                NodeState::Colored => {
                    let c = self.color[i].expect("colored nodes have colors");
                    allocation.insert(t.id, self.target.registers[c]);
                }
                NodeState::Coalesced => {
                    let alias = self.get_alias(NodeId(i));
                    if self.state[alias.0] == NodeState::Spilled {
                        continue;
                    }
                    let c = self.color[i].expect("coalesced into a colored node");
                    allocation.insert(t.id, self.target.registers[c]);
                }
                NodeState::Spilled => spills.push(t),
                other => unreachable!("node t{} finished in state {:?}", t.id, other),
            }
        }
        ColorOutcome { allocation, spills }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::target::TARGET_X86_64;
    use crate::middle::frame::Frame;
    use crate::middle::temp::{PtrDispo, TempState};
    use smallvec::smallvec;

    fn fresh(ts: &mut TempState) -> Temp {
        ts.new_temp(8, PtrDispo::NotPtr)
    }

    /// a := 1; b := 2; c := a + b; rax := c  (a and b interfere)
    fn small_program(ts: &mut TempState) -> (Vec<Instr>, Temp, Temp, Temp) {
        let a = fresh(ts);
        let b = fresh(ts);
        let c = fresh(ts);
        let rax = TARGET_X86_64.ret0;
        let instrs = vec![
            Instr::oper("movq $1, `d0\n", smallvec![a], smallvec![]),
            Instr::oper("movq $2, `d0\n", smallvec![b], smallvec![]),
            Instr::mv("movq `s0, `d0\n", c, a),
            Instr::oper("addq `s0, `d0\n", smallvec![c], smallvec![b, c]),
            Instr::mv("movq `s0, `d0\n", rax, c),
            Instr::oper_jump("\n", smallvec![], smallvec![rax], vec![]),
        ];
        (instrs, a, b, c)
    }

    #[test]
    fn interfering_temps_get_distinct_registers() {
        let mut ts = TempState::new();
        let (instrs, a, b, _c) = small_program(&mut ts);
        let mut frame = Frame::new(crate::common::id("f"), &TARGET_X86_64);
        let result = alloc(&mut ts, &mut frame, instrs, true);
        assert_ne!(result.allocation[&a.id], result.allocation[&b.id]);
        assert!(frame.spills.is_empty());
    }

    #[test]
    fn coalescing_removes_copy_chains() {
        let mut ts = TempState::new();
        let (instrs, _a, _b, c) = small_program(&mut ts);
        let mut frame = Frame::new(crate::common::id("f"), &TARGET_X86_64);
        let result = alloc(&mut ts, &mut frame, instrs, true);
        // c := a and rax := c coalesce away entirely
        let moves = result
            .instrs
            .iter()
            .filter(|i| matches!(i, Instr::Move { .. }))
            .count();
        assert_eq!(moves, 0);
        assert_eq!(result.allocation[&c.id], "rax");
    }

    #[test]
    fn disabling_coalescing_keeps_a_copy() {
        let mut ts = TempState::new();
        let (instrs, ..) = small_program(&mut ts);
        let mut frame = Frame::new(crate::common::id("f"), &TARGET_X86_64);
        let result = alloc(&mut ts, &mut frame, instrs, false);
        // without coalescing the allocator may still give both sides of a
        // move the same register by luck, but every surviving move must
        // then be removed by the dead-move pass; verify soundness instead
        for instr in &result.instrs {
            if let Instr::Move { dst, src, .. } = instr {
                assert_ne!(result.allocation[&dst.id], result.allocation[&src.id]);
            }
        }
    }

    #[test]
    fn high_pressure_forces_a_spill() {
        let mut ts = TempState::new();
        let mut frame = Frame::new(crate::common::id("f"), &TARGET_X86_64);
        // 20 temps all live at once on a 16-register machine: all are
        // defined before the first is used
        let temps: Vec<Temp> = (0..20).map(|_| fresh(&mut ts)).collect();
        let mut instrs: Vec<Instr> = temps
            .iter()
            .map(|t| Instr::oper("movq $7, `d0\n", smallvec![*t], smallvec![]))
            .collect();
        for t in &temps {
            instrs.push(Instr::oper("pushq `s0\n", smallvec![], smallvec![*t]));
        }
        instrs.push(Instr::oper_jump("\n", smallvec![], smallvec![], vec![]));
        let result = alloc(&mut ts, &mut frame, instrs, true);
        assert!(!frame.spills.is_empty(), "pressure must cause a spill");
        // every spill slot is word-aligned inside the locals region
        for slot in &frame.spills {
            assert!(slot.offset < 0);
            assert_eq!(slot.offset % 8, 0);
        }
        // the rewritten program allocates without conflicts at every
        // surviving move
        for instr in &result.instrs {
            if let Instr::Move { dst, src, .. } = instr {
                assert_ne!(result.allocation[&dst.id], result.allocation[&src.id]);
            }
        }
    }
}
