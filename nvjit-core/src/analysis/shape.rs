//! Structural checks on candidate loops.

use crate::error::{reject, Check, Stage, Stop};
use crate::ir::{Cond, Method, NodeId, Opcode, RegionId, SymbolId};

use super::Access;

/// Every nested loop is the only child of its parent and every non-branch
/// block of the nest has at most one successor. Induction variables of the
/// nest are collected into `pivs`.
pub fn check_perfect_nest(method: &Method, region: RegionId, pivs: &mut Vec<SymbolId>) -> Check {
    let r = method.region(region);
    if !r.is_natural_loop() {
        return reject(Stage::PerfectNest, format!("{} is not a natural loop", region));
    }
    let Some(iv) = r.induction.as_ref() else {
        return reject(Stage::PerfectNest, format!("{} has no induction variable", region));
    };
    pivs.push(iv.symbol);
    for &b in &r.blocks {
        if b != iv.branch_block && method.successors(b).len() > 1 {
            return reject(Stage::PerfectNest, format!("{} branches inside the nest", b));
        }
    }
    match r.children.as_slice() {
        [] => Ok(()),
        [child] => check_perfect_nest(method, *child, pivs),
        _ => reject(Stage::PerfectNest, format!("{} has sibling loops", region)),
    }
}

/// The loop counts `i` up by one against a strict `i < n` test, and
/// every array access moves by exactly one element per iteration (loads may
/// also stay put).
pub fn check_loop_iteration(method: &Method, region: RegionId, accesses: &[Access]) -> Check {
    let r = method.region(region);
    let Some(iv) = r.induction.as_ref() else {
        return reject(Stage::IterationPattern, "loop has no induction variable");
    };
    if iv.increment != 1 {
        return reject(Stage::IterationPattern, "induction variable is not incremented by 1");
    }
    let Some(branch) = method.terminator(iv.branch_block) else {
        return reject(Stage::IterationPattern, "branch block has no exit test");
    };
    let test = method.node(branch);
    let Opcode::If(cond, _) = test.op else {
        return reject(Stage::IterationPattern, "exit test is not a conditional branch");
    };
    if cond != Cond::Lt {
        return Err(Stop::reject_at(
            Stage::IterationPattern,
            branch,
            "exit test is not a strict less-than comparison",
        ));
    }

    let counted = method.block(iv.branch_block).trees.iter().any(|&t| {
        let st = method.node(t);
        st.op == Opcode::Store
            && st.symbol == Some(iv.symbol)
            && st
                .child(0)
                .is_some_and(|inc| test.children.contains(&inc) && is_unit_increment(method, inc, iv.symbol))
    });
    if !counted {
        return Err(Stop::reject_at(
            Stage::IterationPattern,
            branch,
            "induction variable is not counted up by one",
        ));
    }

    for a in accesses {
        let element = a.element.size() as i64;
        let ok = match a.stride {
            Some(s) if a.is_store => s == element,
            Some(s) => s == element || s == 0,
            None => false,
        };
        if !ok {
            return Err(Stop::reject_at(
                Stage::IterationPattern,
                a.node,
                "array access does not advance one element per iteration",
            ));
        }
    }
    Ok(())
}

/// `Sub (Load iv) (Const -1)`.
pub fn is_unit_increment(method: &Method, inc: NodeId, iv: SymbolId) -> bool {
    let node = method.node(inc);
    if node.op != Opcode::Sub {
        return false;
    }
    let (Some(a), Some(b)) = (node.child(0), node.child(1)) else {
        return false;
    };
    let load = method.node(a);
    load.op == Opcode::Load && load.symbol == Some(iv) && method.node(b).int_value() == Some(-1)
}

/// Shape requirements shared by both paths: a natural loop with a unit
/// induction variable that is not the start of a transaction.
pub fn check_loop_shape(method: &Method, region: RegionId) -> Check {
    let r = method.region(region);
    if !r.is_natural_loop() {
        return reject(Stage::Shape, "region is not a natural loop");
    }
    if r.transaction_start {
        return reject(Stage::Shape, "loop starts a transaction");
    }
    match r.induction.as_ref() {
        Some(iv) if iv.increment.abs() == 1 => Ok(()),
        Some(_) => reject(Stage::Shape, "induction variable increment is not 1"),
        None => reject(Stage::Shape, "loop has no primary induction variable"),
    }
}

/// Kernel threads cover `[start, end)` upwards, so an offloaded loop must
/// count up by one against `i < n`.
pub fn check_offload_iteration(method: &Method, region: RegionId) -> Check {
    let Some(iv) = method.region(region).induction.as_ref() else {
        return reject(Stage::Shape, "loop has no primary induction variable");
    };
    if iv.increment != 1 {
        return reject(Stage::Shape, "kernel loops must count up by one");
    }
    match method.terminator(iv.branch_block).map(|t| (t, method.node(t).op)) {
        Some((_, Opcode::If(Cond::Lt, _))) => Ok(()),
        Some((t, _)) => Err(Stop::reject_at(
            Stage::Shape,
            t,
            "kernel loop exit test is not a strict less-than comparison",
        )),
        None => reject(Stage::Shape, "branch block has no exit test"),
    }
}
