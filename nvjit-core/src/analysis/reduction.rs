//! Reduction idiom recognition.
//!
//! `sum = sum OP expr` where the right-hand side mentions `sum` exactly once,
//! through add/sub or mul chains, and nothing else in the loop reads it.

use std::collections::HashMap;

use crate::ir::{DataType, Literal, Method, NodeId, Opcode, SymbolId};

use super::invariance::LoopInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionOp {
    Uninitialized,
    /// Terminal for the rest of the loop.
    Invalid,
    Add,
    Mul,
}

impl ReductionOp {
    pub fn opcode(self) -> Option<Opcode> {
        match self {
            ReductionOp::Add => Some(Opcode::Add),
            ReductionOp::Mul => Some(Opcode::Mul),
            _ => None,
        }
    }

    /// Neutral element of the operator for a scalar type.
    pub fn identity(self, ty: DataType) -> Option<Literal> {
        let one = matches!(self, ReductionOp::Mul);
        match (self, ty) {
            (ReductionOp::Add | ReductionOp::Mul, t) if t.is_integral() => {
                Some(Literal::Int(one as i64))
            }
            (ReductionOp::Add | ReductionOp::Mul, t) if t.is_floating_point() => {
                Some(Literal::Float(if one { 1.0 } else { 0.0 }))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub op: ReductionOp,
    /// Stores that update the reduction variable.
    pub stores: Vec<NodeId>,
    pub symbol: SymbolId,
}

impl Reduction {
    pub fn new(symbol: SymbolId) -> Self {
        Reduction {
            op: ReductionOp::Uninitialized,
            stores: Vec::new(),
            symbol,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.op, ReductionOp::Add | ReductionOp::Mul)
    }
}

/// Pattern matcher for the right-hand side of a reduction store.
pub struct ReductionMatcher<'a> {
    pub method: &'a Method,
    pub info: &'a LoopInfo,
    pub ref_counts: &'a HashMap<NodeId, u32>,
}

impl ReductionMatcher<'_> {
    /// Does `node` combine the reduction variable exactly once with values
    /// free of it? Updates `reduction.op` with the operator found.
    pub fn is_reduction(&self, node: NodeId, reduction: &mut Reduction, path_op: ReductionOp) -> bool {
        if reduction.op == ReductionOp::Invalid || self.info.is_invariant(self.method, node) {
            return false;
        }
        if self.ref_counts.get(&node).copied().unwrap_or(0) != 1 {
            return false;
        }
        let n = self.method.node(node);
        if matches!(n.op, Opcode::Convert | Opcode::UConvert) {
            if let Some(c) = n.child(0).filter(|&c| self.method.node(c).op.is_load()) {
                return self.is_reduction(c, reduction, path_op);
            }
        }
        if n.op.is_load() {
            if n.op == Opcode::Load && n.symbol == Some(reduction.symbol) {
                reduction.op = path_op;
                return true;
            }
            return false;
        }
        let op = match n.op {
            Opcode::Add | Opcode::Sub => ReductionOp::Add,
            Opcode::Mul => ReductionOp::Mul,
            Opcode::PassThrough => {
                return n
                    .child(0)
                    .is_some_and(|c| self.is_reduction(c, reduction, path_op));
            }
            _ => {
                reduction.op = ReductionOp::Invalid;
                return false;
            }
        };
        if path_op != ReductionOp::Uninitialized && path_op != op {
            return false;
        }
        let (Some(first), Some(second)) = (n.child(0), n.child(1)) else {
            reduction.op = ReductionOp::Invalid;
            return false;
        };
        let matched = (self.is_reduction(first, reduction, op) && self.no_reduction_var(second, reduction))
            || (n.op != Opcode::Sub
                && self.is_reduction(second, reduction, op)
                && self.no_reduction_var(first, reduction));
        if matched && reduction.op != ReductionOp::Invalid {
            return true;
        }
        reduction.op = ReductionOp::Invalid;
        false
    }

    /// `node` does not read the reduction variable.
    pub fn no_reduction_var(&self, node: NodeId, reduction: &mut Reduction) -> bool {
        if self.info.is_invariant(self.method, node) {
            return true;
        }
        let n = self.method.node(node);
        if matches!(n.op, Opcode::Convert | Opcode::UConvert) {
            if let Some(c) = n.child(0).filter(|&c| self.method.node(c).op.is_load()) {
                return self.no_reduction_var(c, reduction);
            }
        }
        if n.op.is_load() {
            return !(n.op == Opcode::Load && n.symbol == Some(reduction.symbol));
        }
        match n.op {
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Rem => n
                .children
                .iter()
                .all(|&c| self.no_reduction_var(c, reduction)),
            _ => {
                reduction.op = ReductionOp::Invalid;
                false
            }
        }
    }
}
