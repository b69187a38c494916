//! Cross-iteration dependence checks.
//!
//! Memory: every pair of indirect stores, and every (store, load) pair on the
//! same shadow, must either touch the same element in the same iteration or
//! be a constant number of bytes apart with enough slack for one vector.
//!
//! Scalars: a load reached by a definition inside the loop must not also be
//! reached by one from outside it.

use crate::error::{Check, Stage, Stop};
use crate::ir::usedef::DefSite;
use crate::ir::{Method, NodeId, Opcode, VECTOR_LENGTH};

use super::invariance::{same_value, LoopInfo};
use super::LoopAnalysis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependenceKind {
    /// Store then load.
    Flow,
    /// Store then store.
    Output,
}

impl LoopAnalysis<'_> {
    pub fn check_independence(&self) -> Check {
        let method = self.method;
        let mut defs = Vec::new();
        let mut uses = Vec::new();
        method.walk_postorder(&self.info.trees(method), &mut |id, node| match node.op {
            Opcode::StoreIndirect => defs.push(id),
            Opcode::LoadIndirect => uses.push(id),
            _ => {}
        });

        let may_alias = |a: NodeId, b: NodeId| method.node(a).symbol == method.node(b).symbol;

        for (i, &d1) in defs.iter().enumerate() {
            for &d2 in &defs[i + 1..] {
                if may_alias(d1, d2) && !independent(method, &self.info, d1, d2, DependenceKind::Output) {
                    return Err(Stop::reject_at(
                        Stage::Independence,
                        d2,
                        format!("output dependence between {} and {}", d1, d2),
                    ));
                }
            }
            for &u in &uses {
                if may_alias(d1, u) && !independent(method, &self.info, d1, u, DependenceKind::Flow) {
                    return Err(Stop::reject_at(
                        Stage::Independence,
                        u,
                        format!("flow dependence between {} and {}", d1, u),
                    ));
                }
            }
        }

        for &def in &self.defs_in_loop {
            for &u in self.usedef.uses_of(DefSite::Store(def)) {
                let outside = self.usedef.defs_of(u).iter().any(|d| match d {
                    DefSite::Store(s) => !self.defs_in_loop.contains(s),
                    DefSite::Entry(_) => true,
                });
                if outside {
                    return Err(Stop::reject_at(
                        Stage::Independence,
                        u,
                        "both a definition from inside and outside the loop reach a temporary",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Whether two accesses on the same shadow can run in vector lockstep.
pub fn independent(method: &Method, info: &LoopInfo, a: NodeId, b: NodeId, kind: DependenceKind) -> bool {
    let (Some(addr_a), Some(addr_b)) = (method.node(a).child(0), method.node(b).child(0)) else {
        return false;
    };
    if !info.is_invariant(method, addr_a)
        && !info.is_invariant(method, addr_b)
        && same_value(method, addr_a, addr_b)
    {
        return true;
    }
    constant_distance(method, info, addr_a, addr_b)
        .is_some_and(|d| distance_is_safe(d, kind))
}

/// Flow dependences are accepted at a distance of at least one vector or at
/// a non-positive distance; output dependences at a non-negative distance or
/// at least one vector backwards.
pub fn distance_is_safe(distance: i64, kind: DependenceKind) -> bool {
    let width = VECTOR_LENGTH as i64;
    match kind {
        DependenceKind::Flow => distance >= width || distance <= 0,
        DependenceKind::Output => distance >= 0 || distance <= -width,
    }
}

/// Byte distance `addr_a - addr_b` when both are `AddrAdd` off the same
/// invariant base, both offsets vary only through the induction variable,
/// and they differ by a literal constant.
pub fn constant_distance(method: &Method, info: &LoopInfo, addr_a: NodeId, addr_b: NodeId) -> Option<i64> {
    let (na, nb) = (method.node(addr_a), method.node(addr_b));
    if na.op != Opcode::AddrAdd || nb.op != Opcode::AddrAdd {
        return None;
    }
    let (base_a, off_a) = (na.child(0)?, na.child(1)?);
    let (base_b, off_b) = (nb.child(0)?, nb.child(1)?);
    if !info.is_invariant(method, base_a)
        || !info.is_invariant(method, base_b)
        || !same_value(method, base_a, base_b)
    {
        return None;
    }

    let (var_a, sign_a) = single_loop_variant(method, info, off_a)?;
    let (var_b, sign_b) = single_loop_variant(method, info, off_b)?;
    if !same_value(method, var_a, var_b) || sign_a != sign_b || !is_induction_load(method, info, var_a) {
        return None;
    }

    let mut constants_only = true;
    let da = sym_eval(method, info, off_a, &mut constants_only);
    let db = sym_eval(method, info, off_b, &mut constants_only);
    if !constants_only {
        return None;
    }
    Some(da.wrapping_sub(db))
}

/// The one loop-variant leaf of an offset tree and whether it is added.
///
/// Element offsets look like `Add(Mul(Convert(i + 4), 4), header)`, so the
/// walk goes through the arithmetic down to the operands; a subtraction
/// flips the sign of its right operand. Any other variant node is a term of
/// its own.
fn single_loop_variant(method: &Method, info: &LoopInfo, offset: NodeId) -> Option<(NodeId, bool)> {
    fn walk(method: &Method, info: &LoopInfo, id: NodeId, positive: bool, out: &mut Vec<(NodeId, bool)>) {
        if info.is_invariant(method, id) {
            return;
        }
        let node = method.node(id);
        match (node.op, node.child(0), node.child(1)) {
            (Opcode::Sub, Some(a), Some(b)) => {
                walk(method, info, a, positive, out);
                walk(method, info, b, !positive, out);
            }
            (Opcode::Neg, Some(a), _) => walk(method, info, a, !positive, out),
            (Opcode::Add | Opcode::Mul | Opcode::Convert | Opcode::UConvert | Opcode::PassThrough, Some(_), _) => {
                for &c in &node.children {
                    walk(method, info, c, positive, out);
                }
            }
            _ => out.push((id, positive)),
        }
    }
    let mut found = Vec::new();
    walk(method, info, offset, true, &mut found);
    match found.as_slice() {
        [single] => Some(*single),
        _ => None,
    }
}

fn is_induction_load(method: &Method, info: &LoopInfo, id: NodeId) -> bool {
    let node = method.node(id);
    node.op == Opcode::Load && info.piv.is_some_and(|piv| node.symbol == Some(piv))
}

/// Constant part of an offset. Loop-variant leaves count as zero; an
/// invariant leaf that is not a literal clears `constants_only`.
fn sym_eval(method: &Method, info: &LoopInfo, id: NodeId, constants_only: &mut bool) -> i64 {
    let node = method.node(id);
    if let Some(v) = node.int_value() {
        return v;
    }
    let mut child = |i: usize| {
        node.child(i)
            .map(|c| sym_eval(method, info, c, constants_only))
            .unwrap_or(0)
    };
    match node.op {
        Opcode::Add => child(0).wrapping_add(child(1)),
        Opcode::Sub => child(0).wrapping_sub(child(1)),
        Opcode::Mul => child(0).wrapping_mul(child(1)),
        Opcode::Neg => child(0).wrapping_neg(),
        Opcode::Convert | Opcode::UConvert | Opcode::PassThrough => child(0),
        _ => {
            if info.is_invariant(method, id) {
                *constants_only = false;
            }
            0
        }
    }
}
