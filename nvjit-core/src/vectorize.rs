//! Rewrite of an innermost counted loop into a vector loop followed by the
//! original loop as scalar residue.
//!
//! ```text
//! P:        acc_r = splat(identity); vi = splat(i) + lane index
//! guard:    i + lanes > n -> combine
//! VE..VBB:  vector body; i += lanes; vi += splat(lanes); i + lanes <= n -> VE
//! combine:  r = r OP acc_r[0] OP .. OP acc_r[lanes - 1]
//! residue:  i >= n -> X
//! E..BB:    original loop
//! X
//! ```
//!
//! The accumulators start at the identity, so combining after zero vector
//! iterations leaves the reductions unchanged.

use std::collections::HashMap;

use log::debug;

use crate::analysis::invariance::LoopInfo;
use crate::analysis::reduction::ReductionOp;
use crate::analysis::LoopAnalysis;
use crate::error::Result;
use crate::ir::{
    BlockId, Cond, DataType, InductionVariable, Literal, Method, Node, NodeId, Opcode, Region,
    RegionId, RegionKind, SymbolId,
};
use crate::{bail_fatal, bail_invalid};

/// What the vectorization checks established about a loop.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorPlan {
    pub region: RegionId,
    pub piv: SymbolId,
    pub data_type: DataType,
    pub reductions: Vec<(SymbolId, ReductionOp)>,
}

impl VectorPlan {
    /// `None` when the analysis found no data type or the loop has nested loops.
    pub fn from_analysis(analysis: &LoopAnalysis<'_>) -> Option<VectorPlan> {
        let region = analysis.region();
        if !analysis.method.region(region).children.is_empty() {
            return None;
        }
        Some(VectorPlan {
            region,
            piv: analysis.piv,
            data_type: analysis.data_type?,
            reductions: analysis
                .valid_reductions()
                .map(|r| (r.symbol, r.op))
                .collect(),
        })
    }

    pub fn lanes(&self) -> u32 {
        self.data_type.lanes()
    }
}

/// Result of a successful rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vectorized {
    /// The new vector loop.
    pub region: RegionId,
    pub lanes: u32,
}

/// Apply `plan` to `method`.
pub fn vectorize_loop(method: &mut Method, plan: &VectorPlan) -> Result<Vectorized> {
    let region = plan.region;
    let lanes = plan.lanes();
    if lanes < 2 {
        bail_fatal!(None, "{} has no vector width for {}", region, plan.data_type);
    }
    let Some(iv) = method.region(region).induction.clone() else {
        bail_fatal!(None, "{} has no induction variable", region);
    };
    let Some(bound) = iv.exit_bound else {
        bail_fatal!(None, "{} has no exit bound", region);
    };
    let Some(preheader) = method.loop_preheader(region) else {
        bail_fatal!(None, "{} has no preheader", region);
    };
    let Some(test) = method.terminator(iv.branch_block) else {
        bail_fatal!(None, "{} has no exit test", iv.branch_block);
    };
    let cond = match method.node(test).op {
        Opcode::If(c @ Cond::Lt, _) => c,
        _ => bail_fatal!(Some(test), "exit test is not a less-than comparison"),
    };
    let exits: Vec<BlockId> = method.exit_edges(region).into_iter().map(|(_, to)| to).collect();
    let exit = match exits.as_slice() {
        [first, rest @ ..] if rest.iter().all(|b| b == first) => *first,
        _ => bail_fatal!(None, "{} does not have a single exit", region),
    };

    let info = LoopInfo::new(method, region);
    let entry = method.region(region).entry;
    let parent = method.region(region).parent.unwrap_or(method.root);
    let body: Vec<BlockId> = method
        .layout
        .iter()
        .copied()
        .filter(|&b| info.contains_block(b))
        .collect();
    let piv_ty = method.symbol(plan.piv).ty;

    let mut rw = Rewriter {
        method,
        info: &info,
        plan,
        vector_syms: HashMap::new(),
        memo: HashMap::new(),
        vpiv: None,
    };

    // Accumulators at the identity.
    let mut prologue = Vec::new();
    for &(sym, op) in &plan.reductions {
        let ty = rw.method.symbol(sym).ty;
        let (Some(vty), Some(identity)) = (ty.vector_of(), op.identity(ty)) else {
            bail_invalid!(test, "reduction on {} cannot be vectorized", rw.method.symbol(sym).name);
        };
        let acc = rw.vector_temp(sym, vty);
        let id = rw.method.new_const(ty, identity);
        let splat = rw.method.new_op(Opcode::Splat, vty, vec![id]);
        prologue.push(rw.method.new_store(acc, splat));
    }
    if rw.uses_piv_as_value(&body) {
        let vty = piv_ty.vector_of().unwrap_or(DataType::VectorInt32);
        let vpiv = rw.method.temp(format!("{}.vec", rw.method.symbol(plan.piv).name), vty);
        let load = rw.method.new_load(plan.piv);
        let splat = rw.method.new_op(Opcode::Splat, vty, vec![load]);
        let lane = rw.method.new_op(Opcode::LaneIndex, vty, vec![]);
        let init = rw.method.new_op(Opcode::Add, vty, vec![splat, lane]);
        prologue.push(rw.method.new_store(vpiv, init));
        rw.vpiv = Some(vpiv);
    }
    for store in prologue {
        let at = rw
            .method
            .block(preheader)
            .trees
            .len()
            .saturating_sub(usize::from(ends_with_goto(rw.method, preheader)));
        rw.method.block_mut(preheader).trees.insert(at, store);
    }

    // Blocks of the vector loop, the combine and the residue guard.
    let guard = rw.method.add_block();
    let clones: HashMap<BlockId, BlockId> = body.iter().map(|&b| (b, rw.method.add_block())).collect();
    let combine = rw.method.add_block();
    let residue = rw.method.add_block();
    let vector_entry = clones[&entry];
    let vector_branch = clones[&iv.branch_block];

    let mut cursor = preheader;
    for b in std::iter::once(guard)
        .chain(body.iter().map(|b| clones[b]))
        .chain([combine, residue])
    {
        rw.method.insert_block_after(cursor, b);
        cursor = b;
    }
    rw.method.retarget(preheader, entry, guard);

    // guard: not enough iterations left for one vector step
    let limit = rw.limit(bound);
    let i = rw.method.new_load(plan.piv);
    let step = rw.method.new_int(piv_ty, i64::from(lanes));
    let next = rw.method.new_op(Opcode::Add, piv_ty, vec![i, step]);
    let test_tree = rw.method.new_if(Cond::Gt, next, limit, combine);
    rw.method.block_mut(guard).trees.push(test_tree);

    // vector body
    for &b in &body {
        let trees = rw.method.block(b).trees.clone();
        let mut out = Vec::new();
        for t in trees {
            let node = rw.method.node(t).clone();
            if node.op == Opcode::Store && node.symbol == Some(plan.piv) {
                continue;
            }
            if b == iv.branch_block && t == test {
                continue;
            }
            match node.op {
                Opcode::Goto => {
                    let target = node.target.map(|d| clones.get(&d).copied().unwrap_or(d));
                    let goto = rw.method.add_node(Node { target, ..node });
                    out.push(goto);
                }
                op if op.is_branch() => bail_fatal!(Some(t), "branch inside a vectorized loop"),
                _ => out.push(rw.vector_tree(t)?),
            }
        }
        rw.method.block_mut(clones[&b]).trees = out;
    }
    let i = rw.method.new_load(plan.piv);
    let minus = rw.method.new_int(piv_ty, -i64::from(lanes));
    let inc = rw.method.new_op(Opcode::Sub, piv_ty, vec![i, minus]);
    let store = rw.method.new_store(plan.piv, inc);
    rw.method.block_mut(vector_branch).trees.push(store);
    if let Some(vpiv) = rw.vpiv {
        let vty = rw.method.symbol(vpiv).ty;
        let v = rw.method.new_load(vpiv);
        let n = rw.method.new_int(piv_ty, i64::from(lanes));
        let splat = rw.method.new_op(Opcode::Splat, vty, vec![n]);
        let add = rw.method.new_op(Opcode::Add, vty, vec![v, splat]);
        let store = rw.method.new_store(vpiv, add);
        rw.method.block_mut(vector_branch).trees.push(store);
    }
    let limit = rw.limit(bound);
    let i = rw.method.new_load(plan.piv);
    let step = rw.method.new_int(piv_ty, i64::from(lanes));
    let next = rw.method.new_op(Opcode::Add, piv_ty, vec![i, step]);
    let back = rw.method.new_if(Cond::Le, next, limit, vector_entry);
    rw.method.block_mut(vector_branch).trees.push(back);

    // combine
    for &(sym, op) in &plan.reductions {
        let Some(opcode) = op.opcode() else {
            continue;
        };
        let ty = rw.method.symbol(sym).ty;
        let acc = rw.vector_syms[&sym];
        let mut value = rw.method.new_load(sym);
        for k in 0..lanes {
            let v = rw.method.new_load(acc);
            let elem = rw.method.add_node(Node {
                literal: Some(Literal::Int(i64::from(k))),
                ..Node::new(Opcode::GetElem, ty, vec![v])
            });
            value = rw.method.new_op(opcode, ty, vec![value, elem]);
        }
        let store = rw.method.new_store(sym, value);
        rw.method.block_mut(combine).trees.push(store);
    }

    // residue guard
    let i = rw.method.new_load(plan.piv);
    let n = rw.method.dup_tree(bound);
    let skip = rw.method.new_if(cond.reversed(), i, n, exit);
    rw.method.block_mut(residue).trees.push(skip);

    let vector_blocks: Vec<BlockId> = body.iter().map(|b| clones[b]).collect();
    let vector_bound = rw.limit(bound);
    let origin = rw.method.region(region).origin;
    let vector_region = rw.method.regions.alloc(Region {
        kind: RegionKind::NaturalLoop,
        entry: vector_entry,
        blocks: vector_blocks,
        children: Vec::new(),
        parent: Some(parent),
        induction: Some(InductionVariable {
            symbol: plan.piv,
            entry: None,
            exit_bound: Some(vector_bound),
            increment: i64::from(lanes),
            branch_block: vector_branch,
        }),
        origin,
        transaction_start: false,
    });
    let method = rw.method;
    method.region_mut(parent).children.push(vector_region);
    for b in [guard, combine, residue] {
        method.add_block_to_region(parent, b);
    }

    debug!(
        "vectorized {} into {} with {} lanes of {}",
        region, vector_region, lanes, plan.data_type
    );
    Ok(Vectorized {
        region: vector_region,
        lanes,
    })
}

fn ends_with_goto(method: &Method, block: BlockId) -> bool {
    method
        .last_tree(block)
        .is_some_and(|t| method.node(t).op == Opcode::Goto)
}

/// Builds vector copies of scalar trees. Shared nodes are copied once.
struct Rewriter<'a> {
    method: &'a mut Method,
    info: &'a LoopInfo,
    plan: &'a VectorPlan,
    /// Vector counterpart of every scalar local stored in the loop.
    vector_syms: HashMap<SymbolId, SymbolId>,
    memo: HashMap<NodeId, NodeId>,
    vpiv: Option<SymbolId>,
}

impl Rewriter<'_> {
    fn vector_temp(&mut self, sym: SymbolId, vty: DataType) -> SymbolId {
        if let Some(&v) = self.vector_syms.get(&sym) {
            return v;
        }
        let name = format!("{}.vec", self.method.symbol(sym).name);
        let v = self.method.temp(name, vty);
        self.vector_syms.insert(sym, v);
        v
    }

    /// Exclusive upper limit of `i`.
    fn limit(&mut self, bound: NodeId) -> NodeId {
        self.method.dup_tree(bound)
    }

    /// The body reads the induction variable outside address computations.
    fn uses_piv_as_value(&self, body: &[BlockId]) -> bool {
        let method = &*self.method;
        let piv = self.plan.piv;
        let mut found = false;
        for &b in body {
            for &t in &method.block(b).trees {
                let node = method.node(t);
                let values: Vec<NodeId> = match node.op {
                    Opcode::StoreIndirect => node.child(1).into_iter().collect(),
                    Opcode::Store if node.symbol != Some(piv) => node.children.clone(),
                    Opcode::TreeTop => node.children.clone(),
                    _ => Vec::new(),
                };
                method.walk_postorder(&values, &mut |_, n| {
                    if n.op == Opcode::Load && n.symbol == Some(piv) {
                        found = true;
                    }
                });
            }
        }
        found
    }

    fn vector_tree(&mut self, id: NodeId) -> Result<NodeId> {
        let node = self.method.node(id).clone();
        match node.op {
            Opcode::StoreIndirect => {
                let (Some(addr), Some(value)) = (node.child(0), node.child(1)) else {
                    bail_fatal!(Some(id), "indirect store needs an address and a value");
                };
                let vty = self.vector_type(id, node.ty)?;
                let addr = self.method.dup_tree(addr);
                let value = self.vector_value(value)?;
                Ok(self.method.add_node(Node {
                    ty: vty,
                    children: vec![addr, value],
                    ..node
                }))
            }
            Opcode::Store => {
                let (Some(sym), Some(value)) = (node.symbol, node.child(0)) else {
                    bail_fatal!(Some(id), "store without a symbol");
                };
                let vty = self.vector_type(id, node.ty)?;
                let value = self.vector_value(value)?;
                let target = self.vector_temp(sym, vty);
                Ok(self.method.new_store(target, value))
            }
            Opcode::TreeTop => {
                let Some(child) = node.child(0) else {
                    bail_fatal!(Some(id), "empty tree top");
                };
                let child = self.vector_value(child)?;
                Ok(self.method.new_treetop(child))
            }
            _ => bail_invalid!(id, "{:?} cannot be vectorized", node.op),
        }
    }

    fn vector_value(&mut self, id: NodeId) -> Result<NodeId> {
        if let Some(&v) = self.memo.get(&id) {
            return Ok(v);
        }
        let node = self.method.node(id).clone();
        let vty = self.vector_type(id, node.ty)?;
        let v = if node.op == Opcode::Load && node.symbol == Some(self.plan.piv) {
            match self.vpiv {
                Some(vpiv) => self.method.new_load(vpiv),
                None => bail_fatal!(Some(id), "induction variable read without a vector copy"),
            }
        } else if let Some(&vsym) = node.symbol.and_then(|s| self.vector_syms.get(&s)).filter(|_| node.op == Opcode::Load) {
            self.method.new_load(vsym)
        } else if self.info.is_invariant(self.method, id) {
            let scalar = self.method.dup_tree(id);
            self.method.new_op(Opcode::Splat, vty, vec![scalar])
        } else {
            match node.op {
                Opcode::LoadIndirect => {
                    let Some(addr) = node.child(0) else {
                        bail_fatal!(Some(id), "indirect load without an address");
                    };
                    let addr = self.method.dup_tree(addr);
                    self.method.add_node(Node {
                        ty: vty,
                        children: vec![addr],
                        ..node
                    })
                }
                Opcode::Load => {
                    let Some(sym) = node.symbol else {
                        bail_fatal!(Some(id), "load without a symbol");
                    };
                    let vsym = self.vector_temp(sym, vty);
                    self.method.new_load(vsym)
                }
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Rem
                | Opcode::Shl
                | Opcode::Shr
                | Opcode::UShr
                | Opcode::And
                | Opcode::Xor
                | Opcode::Or
                | Opcode::Neg => {
                    let mut children = Vec::with_capacity(node.children.len());
                    for &c in &node.children {
                        children.push(self.vector_value(c)?);
                    }
                    self.method.new_op(node.op, vty, children)
                }
                op => bail_invalid!(id, "{:?} cannot be vectorized", op),
            }
        };
        self.memo.insert(id, v);
        Ok(v)
    }

    fn vector_type(&self, id: NodeId, ty: DataType) -> Result<DataType> {
        match ty.vector_of() {
            Some(v) => Ok(v),
            None => bail_invalid!(id, "no vector type for {}", ty),
        }
    }
}
