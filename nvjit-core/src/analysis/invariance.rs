//! Loop invariance of expression trees.

use std::collections::HashSet;

use crate::ir::{BlockId, Method, NodeId, Opcode, RegionId, SymbolId};

/// What a loop writes, collected once per loop.
#[derive(Debug, Clone)]
pub struct LoopInfo {
    pub region: RegionId,
    /// All blocks of the loop including nested loops, in layout order.
    pub blocks: Vec<BlockId>,
    /// Symbols stored directly in the loop.
    pub stored: HashSet<SymbolId>,
    /// Shadows and fields stored through an address in the loop.
    pub stored_indirect: HashSet<SymbolId>,
    pub has_calls: bool,
    pub piv: Option<SymbolId>,
}

impl LoopInfo {
    pub fn new(method: &Method, region: RegionId) -> Self {
        let blocks = method.region_blocks(region);
        let mut stored = HashSet::new();
        let mut stored_indirect = HashSet::new();
        let mut has_calls = false;
        let roots: Vec<NodeId> = blocks
            .iter()
            .flat_map(|&b| method.block(b).trees.iter().copied())
            .collect();
        method.walk_postorder(&roots, &mut |_, node| match node.op {
            Opcode::Store => stored.extend(node.symbol),
            Opcode::StoreIndirect => stored_indirect.extend(node.symbol),
            Opcode::ArrayCopy { .. } => has_calls = true,
            Opcode::Call => has_calls = true,
            _ => {}
        });
        let piv = method.region(region).induction.as_ref().map(|iv| iv.symbol);
        LoopInfo {
            region,
            blocks,
            stored,
            stored_indirect,
            has_calls,
            piv,
        }
    }

    /// All trees of the loop in block order.
    pub fn trees(&self, method: &Method) -> Vec<NodeId> {
        self.blocks
            .iter()
            .flat_map(|&b| method.block(b).trees.iter().copied())
            .collect()
    }

    pub fn contains_block(&self, block: BlockId) -> bool {
        self.blocks.contains(&block)
    }

    /// The value of `id` is the same in every iteration of the loop.
    pub fn is_invariant(&self, method: &Method, id: NodeId) -> bool {
        let node = method.node(id);
        match node.op {
            Opcode::Const | Opcode::LoadAddr => true,
            Opcode::Load => match node.symbol {
                Some(s) => !self.stored.contains(&s) && Some(s) != self.piv,
                None => false,
            },
            Opcode::LoadIndirect => {
                let written = node
                    .symbol
                    .is_none_or(|s| self.stored_indirect.contains(&s));
                !written && !self.has_calls && self.children_invariant(method, id)
            }
            Opcode::Call
            | Opcode::NewArray
            | Opcode::Store
            | Opcode::StoreIndirect
            | Opcode::ArrayCopy { .. }
            | Opcode::LaneIndex => false,
            op if op.is_terminator() || op.is_check() => false,
            _ => self.children_invariant(method, id),
        }
    }

    fn children_invariant(&self, method: &Method, id: NodeId) -> bool {
        method
            .node(id)
            .children
            .iter()
            .all(|&c| self.is_invariant(method, c))
    }
}

/// Structural equality of two expression trees.
pub fn same_value(method: &Method, a: NodeId, b: NodeId) -> bool {
    if a == b {
        return true;
    }
    let (x, y) = (method.node(a), method.node(b));
    x.op == y.op
        && x.ty == y.ty
        && x.symbol == y.symbol
        && x.literal == y.literal
        && x.children.len() == y.children.len()
        && x.children
            .iter()
            .zip(&y.children)
            .all(|(&c, &d)| same_value(method, c, d))
}
