//! Affine evaluation of index and address expressions.
//!
//! An expression is affine in the induction variable `i` when it evaluates
//! to `stride * i + k` with a compile-time integer `stride` and a loop
//! invariant `k`. Only the stride is tracked.

use crate::ir::{Method, NodeId, Opcode, SymbolId};

use super::invariance::LoopInfo;

/// Coefficient of `piv` in `expr`, or `None` if `expr` is not affine.
pub fn affine_stride(method: &Method, info: &LoopInfo, piv: SymbolId, expr: NodeId) -> Option<i64> {
    let node = method.node(expr);
    if node.op == Opcode::Load && node.symbol == Some(piv) {
        return Some(1);
    }
    if info.is_invariant(method, expr) {
        return Some(0);
    }
    let child = |i: usize| node.child(i).and_then(|c| affine_stride(method, info, piv, c));
    match node.op {
        Opcode::Add | Opcode::AddrAdd => Some(child(0)?.checked_add(child(1)?)?),
        Opcode::Sub => Some(child(0)?.checked_sub(child(1)?)?),
        Opcode::Neg => Some(-child(0)?),
        Opcode::Convert | Opcode::UConvert | Opcode::PassThrough => child(0),
        Opcode::Mul => {
            let (a, b) = (node.child(0)?, node.child(1)?);
            let (sa, sb) = (child(0)?, child(1)?);
            match (sa, sb) {
                (0, 0) => Some(0),
                (s, 0) => Some(s.checked_mul(const_value(method, b)?)?),
                (0, s) => Some(s.checked_mul(const_value(method, a)?)?),
                // i * i
                _ => None,
            }
        }
        Opcode::Shl => {
            let s = child(0)?;
            let amount = const_value(method, node.child(1)?)?;
            if !(0..32).contains(&amount) {
                return None;
            }
            s.checked_mul(1i64 << amount)
        }
        _ => None,
    }
}

pub fn is_affine(method: &Method, info: &LoopInfo, piv: SymbolId, expr: NodeId) -> bool {
    affine_stride(method, info, piv, expr).is_some()
}

/// Integer constant, looking through widening conversions.
fn const_value(method: &Method, id: NodeId) -> Option<i64> {
    let node = method.node(id);
    match node.op {
        Opcode::Const => node.int_value(),
        Opcode::Convert | Opcode::UConvert => const_value(method, node.child(0)?),
        _ => None,
    }
}
