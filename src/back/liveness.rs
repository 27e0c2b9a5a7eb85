//! Liveness analysis.
//!
//! Builds a control-flow graph over the instruction list, solves the
//! live-out equations to a fixed point by backward iteration, and derives
//! the interference graph the register allocator colours.

use crate::back::assem::Instr;
use crate::back::graph::{Graph, NodeId};
use crate::common::{bitset_len, Map};
use crate::middle::temp::{Label, Temp};

// ---------------------------------------------------------------------
// sorted temp lists
// ---------------------------------------------------------------------

/// Sort by temp id and drop duplicates.
pub fn temps_sorted(temps: impl IntoIterator<Item = Temp>) -> Vec<Temp> {
    let mut v: Vec<Temp> = temps.into_iter().collect();
    v.sort();
    v.dedup();
    v
}

pub fn temps_union(a: &[Temp], b: &[Temp]) -> Vec<Temp> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

pub fn temps_minus(a: &[Temp], b: &[Temp]) -> Vec<Temp> {
    let mut out = Vec::with_capacity(a.len());
    let mut j = 0;
    for t in a {
        while j < b.len() && b[j] < *t {
            j += 1;
        }
        if j < b.len() && b[j] == *t {
            continue;
        }
        out.push(*t);
    }
    out
}

pub fn temps_eq(a: &[Temp], b: &[Temp]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}

pub fn temps_contain(a: &[Temp], t: Temp) -> bool {
    a.binary_search(&t).is_ok()
}

// ---------------------------------------------------------------------
// flow graph
// ---------------------------------------------------------------------

pub struct FlowGraph {
    pub control: Graph,
    /// Per node, the temps defined, sorted by id.
    pub def: Vec<Vec<Temp>>,
    /// Per node, the temps used, sorted by id.
    pub uses: Vec<Vec<Temp>>,
    pub is_move: Vec<bool>,
}

/// One flow node per instruction: fall-through edges except after
/// explicit jumps, plus an edge to every jump target.
pub fn instrs2graph(instrs: &[Instr]) -> FlowGraph {
    let mut control = Graph::new();
    let mut def = Vec::with_capacity(instrs.len());
    let mut uses = Vec::with_capacity(instrs.len());
    let mut is_move = Vec::with_capacity(instrs.len());
    let mut label_to_node: Map<Label, NodeId> = Map::new();

    let nodes: Vec<NodeId> = instrs.iter().map(|_| control.new_node()).collect();

    for (i, instr) in instrs.iter().enumerate() {
        match instr {
            Instr::Oper { dst, src, .. } => {
                def.push(temps_sorted(dst.iter().copied()));
                uses.push(temps_sorted(src.iter().copied()));
                is_move.push(false);
            }
            Instr::Label { label, .. } => {
                label_to_node.insert(*label, nodes[i]);
                def.push(vec![]);
                uses.push(vec![]);
                is_move.push(false);
            }
            Instr::Move { dst, src, .. } => {
                def.push(vec![*dst]);
                uses.push(vec![*src]);
                is_move.push(true);
            }
        }
    }

    for (i, instr) in instrs.iter().enumerate() {
        match instr {
            Instr::Oper {
                jump: Some(labels), ..
            } => {
                for label in labels {
                    match label_to_node.get(label) {
                        Some(target) => control.add_edge(nodes[i], *target),
                        None => log::warn!("no node for label: {}", label),
                    }
                }
            }
            _ => {
                if i + 1 < instrs.len() {
                    control.add_edge(nodes[i], nodes[i + 1]);
                }
            }
        }
    }

    FlowGraph {
        control,
        def,
        uses,
        is_move,
    }
}

// ---------------------------------------------------------------------
// interference graph
// ---------------------------------------------------------------------

pub struct IGraph {
    pub graph: Graph,
    /// Temp id to interference node.
    pub tnode: Map<u32, NodeId>,
    /// Interference node index to its temp.
    pub gtemp: Vec<Temp>,
    /// One `(dst, src)` pair per move instruction.
    pub moves: Vec<(NodeId, NodeId)>,
}

impl IGraph {
    pub fn node_for(&self, t: Temp) -> NodeId {
        self.tnode[&t.id]
    }

    pub fn temp_for(&self, n: NodeId) -> Temp {
        self.gtemp[n.0]
    }
}

pub struct LivenessResult {
    pub igraph: IGraph,
    /// Per flow node, the temps live out of it, sorted by id.
    pub live_outs: Vec<Vec<Temp>>,
}

struct BitSet(Vec<u64>);

impl BitSet {
    fn new(len: usize) -> BitSet {
        BitSet(vec![0; bitset_len(len)])
    }

    fn set(&mut self, i: usize) {
        self.0[i >> 6] |= 1 << (i & 63);
    }

    fn get(&self, i: usize) -> bool {
        self.0[i >> 6] & (1 << (i & 63)) != 0
    }

    fn union_with(&mut self, other: &BitSet) -> bool {
        let mut changed = false;
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            let next = *a | *b;
            changed |= next != *a;
            *a = next;
        }
        changed
    }
}

/// Build the interference graph from the flow graph's liveness solution:
/// at a non-move, every def interferes with everything live out; at a
/// move `d <- s`, `d` interferes with everything live out except `s`,
/// and `(d, s)` is recorded as a coalescable move.
pub fn interference_graph(flow: &FlowGraph) -> LivenessResult {
    let n = flow.control.len();

    let mut igraph = IGraph {
        graph: Graph::new(),
        tnode: Map::new(),
        gtemp: Vec::new(),
        moves: Vec::new(),
    };
    let node_for = |igraph: &mut IGraph, t: Temp| -> NodeId {
        if let Some(found) = igraph.tnode.get(&t.id) {
            return *found;
        }
        let node = igraph.graph.new_node();
        igraph.tnode.insert(t.id, node);
        igraph.gtemp.push(t);
        node
    };
    for i in 0..n {
        for t in flow.def[i].iter().chain(&flow.uses[i]) {
            node_for(&mut igraph, *t);
        }
    }
    let temp_count = igraph.gtemp.len();

    // def/use as bitsets over interference-node indices
    let mut def_bs = Vec::with_capacity(n);
    let mut use_bs = Vec::with_capacity(n);
    for i in 0..n {
        let mut d = BitSet::new(temp_count);
        for t in &flow.def[i] {
            d.set(igraph.node_for(*t).0);
        }
        def_bs.push(d);
        let mut u = BitSet::new(temp_count);
        for t in &flow.uses[i] {
            u.set(igraph.node_for(*t).0);
        }
        use_bs.push(u);
    }

    // in[n] = use[n] ∪ (out[n] \ def[n]); out[n] = ∪ in[s]
    let mut live_in: Vec<BitSet> = (0..n).map(|_| BitSet::new(temp_count)).collect();
    let mut live_out: Vec<BitSet> = (0..n).map(|_| BitSet::new(temp_count)).collect();
    loop {
        let mut changed = false;
        for i in (0..n).rev() {
            for s in flow.control.succ(NodeId(i)) {
                // split borrows: out[i] and in[s] are distinct unless the
                // node loops to itself, which the instruction stream
                // cannot produce
                let in_s = std::mem::replace(&mut live_in[s.0], BitSet::new(0));
                changed |= live_out[i].union_with(&in_s);
                live_in[s.0] = in_s;
            }
            let mut new_in = BitSet::new(temp_count);
            for w in 0..new_in.0.len() {
                new_in.0[w] = use_bs[i].0[w] | (live_out[i].0[w] & !def_bs[i].0[w]);
            }
            changed |= live_in[i].union_with(&new_in);
        }
        if !changed {
            break;
        }
    }

    // interference edges
    for i in 0..n {
        for d in &flow.def[i] {
            let d_node = igraph.node_for(*d);
            if !flow.is_move[i] {
                for j in 0..temp_count {
                    if live_out[i].get(j) {
                        mk_edge(&mut igraph.graph, d_node, NodeId(j));
                    }
                }
            } else {
                debug_assert_eq!(flow.uses[i].len(), 1);
                let u_node = igraph.node_for(flow.uses[i][0]);
                igraph.moves.push((d_node, u_node));
                for j in 0..temp_count {
                    if live_out[i].get(j) && NodeId(j) != u_node {
                        mk_edge(&mut igraph.graph, d_node, NodeId(j));
                    }
                }
            }
        }
    }

    let live_outs: Vec<Vec<Temp>> = (0..n)
        .map(|i| {
            let temps = (0..temp_count)
                .filter(|j| live_out[i].get(*j))
                .map(|j| igraph.gtemp[j]);
            temps_sorted(temps)
        })
        .collect();

    LivenessResult { igraph, live_outs }
}

fn mk_edge(graph: &mut Graph, a: NodeId, b: NodeId) {
    if a != b && !graph.is_adj(a, b) {
        graph.add_edge(a, b);
    }
}

/// Debug dump of the interference graph, for the `-l` stop flag.
pub fn igraph_show(igraph: &IGraph) -> String {
    let mut out = String::new();
    out.push_str("# ---- Interference Graph ----\n");
    let mut temps = igraph.gtemp.clone();
    temps.sort();
    for t in &temps {
        out.push_str(&format!("# {} [", t.id));
        let node = igraph.node_for(*t);
        let mut adj: Vec<Temp> = igraph.graph.adj(node).map(|m| igraph.temp_for(m)).collect();
        adj.sort();
        for a in adj {
            out.push_str(&format!("{},", a.id));
        }
        out.push_str("]\n");
    }
    out.push_str("# ----------------------------\n");
    out.push_str("# ----       Moves        ----\n");
    for (d, s) in &igraph.moves {
        out.push_str(&format!(
            "# {} <- {}\n",
            igraph.temp_for(*d).id,
            igraph.temp_for(*s).id
        ));
    }
    out.push_str("# ----------------------------\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::temp::{PtrDispo, TempState};
    use smallvec::smallvec;

    fn t(id: u32) -> Temp {
        Temp {
            id,
            size: 8,
            dispo: PtrDispo::NotPtr,
        }
    }

    #[test]
    fn sorted_list_algebra() {
        let a = temps_sorted([t(3), t(1), t(5), t(3)]);
        let b = temps_sorted([t(2), t(3)]);
        assert_eq!(a.iter().map(|x| x.id).collect::<Vec<_>>(), vec![1, 3, 5]);

        let u = temps_union(&a, &b);
        assert_eq!(u.iter().map(|x| x.id).collect::<Vec<_>>(), vec![1, 2, 3, 5]);
        // union is idempotent and commutative
        assert!(temps_eq(&temps_union(&a, &a), &a));
        assert!(temps_eq(&temps_union(&a, &b), &temps_union(&b, &a)));

        // minus(union(a,b), b) == minus(a, b)
        assert!(temps_eq(
            &temps_minus(&temps_union(&a, &b), &b),
            &temps_minus(&a, &b)
        ));
        assert!(temps_eq(&a, &a));
        assert!(!temps_eq(&a, &b));

        let m = temps_minus(&a, &b);
        assert_eq!(m.iter().map(|x| x.id).collect::<Vec<_>>(), vec![1, 5]);
    }

    #[test]
    fn straightline_liveness() {
        let mut ts = TempState::new();
        let a = ts.new_temp(8, PtrDispo::NotPtr);
        let b = ts.new_temp(8, PtrDispo::NotPtr);
        // a := 1 ; b := a ; use(a, b)
        let instrs = vec![
            Instr::oper("li `d0\n", smallvec![a], smallvec![]),
            Instr::mv("mov `d0, `s0\n", b, a),
            Instr::oper("use `s0, `s1\n", smallvec![], smallvec![a, b]),
        ];
        let flow = instrs2graph(&instrs);
        assert!(flow.is_move[1]);
        let result = interference_graph(&flow);
        // a is live across the move and used after it, so a and b interfere
        let an = result.igraph.node_for(a);
        let bn = result.igraph.node_for(b);
        assert!(result.igraph.graph.is_adj(an, bn));
        // the move is recorded for coalescing
        assert_eq!(result.igraph.moves, vec![(bn, an)]);
        // live out of the first instruction: a
        assert!(temps_contain(&result.live_outs[0], a));
        assert!(!temps_contain(&result.live_outs[0], b));
    }

    #[test]
    fn move_source_does_not_interfere_with_destination() {
        let mut ts = TempState::new();
        let a = ts.new_temp(8, PtrDispo::NotPtr);
        let b = ts.new_temp(8, PtrDispo::NotPtr);
        // a := 1 ; b := a ; use(b)   — a dies at the move
        let instrs = vec![
            Instr::oper("li `d0\n", smallvec![a], smallvec![]),
            Instr::mv("mov `d0, `s0\n", b, a),
            Instr::oper("use `s0\n", smallvec![], smallvec![b]),
        ];
        let flow = instrs2graph(&instrs);
        let result = interference_graph(&flow);
        let an = result.igraph.node_for(a);
        let bn = result.igraph.node_for(b);
        assert!(!result.igraph.graph.is_adj(an, bn));
    }

    #[test]
    fn jump_edges_follow_labels() {
        let mut ts = TempState::new();
        let a = ts.new_temp(8, PtrDispo::NotPtr);
        let l = crate::common::id("L9");
        // jump over the def of a; at the join a is only live on one path
        let instrs = vec![
            Instr::oper_jump("jmp L9\n", smallvec![], smallvec![], vec![l]),
            Instr::oper("li `d0\n", smallvec![a], smallvec![]),
            Instr::label(l),
            Instr::oper("use `s0\n", smallvec![], smallvec![a]),
        ];
        let flow = instrs2graph(&instrs);
        // the jump's only successor is the label
        assert_eq!(flow.control.succ(NodeId(0)), &[NodeId(2)]);
        let result = interference_graph(&flow);
        // a is live into the label from the fall-through path
        assert!(temps_contain(&result.live_outs[1], a));
    }
}
