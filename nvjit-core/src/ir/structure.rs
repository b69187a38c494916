//! Control flow and region queries derived from the block layout.
//!
//! Successor edges are not stored; they are recomputed from the last tree of
//! each block. Rewrites that add blocks go through the edge-editing helpers at
//! the bottom of this file so that the layout and region tree stay in step.

use std::collections::{HashMap, HashSet};

use super::{BlockId, Method, Node, NodeId, Opcode, RegionId};

impl Method {
    /// Position of a block in the physical layout.
    pub fn layout_position(&self, block: BlockId) -> Option<usize> {
        self.layout.iter().position(|&b| b == block)
    }

    /// Next block in physical layout, the fall-through successor.
    pub fn layout_next(&self, block: BlockId) -> Option<BlockId> {
        let pos = self.layout_position(block)?;
        self.layout.get(pos + 1).copied()
    }

    /// Last tree, if it ends the block with an explicit control transfer.
    pub fn terminator(&self, block: BlockId) -> Option<NodeId> {
        self.last_tree(block)
            .filter(|&t| self.node(t).op.is_terminator())
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        let mut succs = Vec::new();
        let last = self.last_tree(block).map(|t| self.node(t));
        match last.map(|n| n.op) {
            Some(Opcode::If(..)) => {
                if let Some(t) = last.and_then(|n| n.target) {
                    succs.push(t);
                }
                if let Some(next) = self.layout_next(block) {
                    if !succs.contains(&next) {
                        succs.push(next);
                    }
                }
            }
            Some(Opcode::Goto) => succs.extend(last.and_then(|n| n.target)),
            Some(Opcode::Return) => {}
            Some(Opcode::Lookup) | Some(Opcode::Table) => {
                if let Some(n) = last {
                    for &(_, dest) in &n.cases {
                        if !succs.contains(&dest) {
                            succs.push(dest);
                        }
                    }
                    if let Some(d) = n.target {
                        if !succs.contains(&d) {
                            succs.push(d);
                        }
                    }
                }
            }
            _ => succs.extend(self.layout_next(block)),
        }
        succs
    }

    /// Predecessor lists for every block in the layout.
    pub fn predecessors(&self) -> HashMap<BlockId, Vec<BlockId>> {
        let mut preds: HashMap<BlockId, Vec<BlockId>> =
            self.layout.iter().map(|&b| (b, Vec::new())).collect();
        for &b in &self.layout {
            for s in self.successors(b) {
                preds.entry(s).or_default().push(b);
            }
        }
        preds
    }

    pub fn preds_of(&self, block: BlockId) -> Vec<BlockId> {
        self.layout
            .iter()
            .copied()
            .filter(|&b| self.successors(b).contains(&block))
            .collect()
    }

    /// Number of parents referencing each node across all trees in the layout.
    pub fn reference_counts(&self) -> HashMap<NodeId, u32> {
        let mut counts = HashMap::new();
        let mut seen = HashSet::new();
        for &b in &self.layout {
            for &t in &self.block(b).trees {
                *counts.entry(t).or_insert(0) += 1;
                self.count_children(t, &mut counts, &mut seen);
            }
        }
        counts
    }

    fn count_children(
        &self,
        id: NodeId,
        counts: &mut HashMap<NodeId, u32>,
        seen: &mut HashSet<NodeId>,
    ) {
        if !seen.insert(id) {
            return;
        }
        for &c in &self.node(id).children {
            *counts.entry(c).or_insert(0) += 1;
            self.count_children(c, counts, seen);
        }
    }

    // =========================================================================
    // Regions
    // =========================================================================

    /// All blocks of a region including nested regions, in layout order.
    pub fn region_blocks(&self, region: RegionId) -> Vec<BlockId> {
        let mut set = HashSet::new();
        self.collect_region_blocks(region, &mut set);
        self.layout.iter().copied().filter(|b| set.contains(b)).collect()
    }

    fn collect_region_blocks(&self, region: RegionId, out: &mut HashSet<BlockId>) {
        let r = self.region(region);
        out.extend(r.blocks.iter().copied());
        for &child in &r.children {
            self.collect_region_blocks(child, out);
        }
    }

    pub fn region_contains(&self, region: RegionId, block: BlockId) -> bool {
        self.region_blocks(region).contains(&block)
    }

    /// Strict descendants of a region, parents before children.
    pub fn descendants(&self, region: RegionId) -> Vec<RegionId> {
        let mut out = Vec::new();
        let mut stack: Vec<RegionId> = self.region(region).children.iter().rev().copied().collect();
        while let Some(r) = stack.pop() {
            out.push(r);
            stack.extend(self.region(r).children.iter().rev().copied());
        }
        out
    }

    /// Innermost region that directly holds a block.
    pub fn region_of(&self, block: BlockId) -> Option<RegionId> {
        self.regions
            .iter()
            .find(|(_, r)| r.blocks.contains(&block))
            .map(|(&id, _)| id)
    }

    /// Edges leaving a region, as (source inside, destination outside).
    pub fn exit_edges(&self, region: RegionId) -> Vec<(BlockId, BlockId)> {
        let blocks: HashSet<BlockId> = self.region_blocks(region).into_iter().collect();
        let mut edges = Vec::new();
        for &b in &self.layout {
            if !blocks.contains(&b) {
                continue;
            }
            for s in self.successors(b) {
                if !blocks.contains(&s) {
                    edges.push((b, s));
                }
            }
        }
        edges
    }

    /// The unique block outside a loop that enters it, provided that block
    /// has the loop entry as its only successor and the loop does not start
    /// at the method entry.
    pub fn loop_preheader(&self, region: RegionId) -> Option<BlockId> {
        let entry = self.region(region).entry;
        if self.entry_block() == Some(entry) {
            return None;
        }
        let blocks: HashSet<BlockId> = self.region_blocks(region).into_iter().collect();
        let outside: Vec<BlockId> = self
            .preds_of(entry)
            .into_iter()
            .filter(|p| !blocks.contains(p))
            .collect();
        match outside.as_slice() {
            [single] if self.successors(*single) == vec![entry] => Some(*single),
            _ => None,
        }
    }

    /// Give a loop a preheader by placing an empty block in front of its
    /// entry and redirecting the outside branches to it. `None` when a block
    /// of the loop falls through into the entry.
    pub fn create_preheader(&mut self, region: RegionId) -> Option<BlockId> {
        if let Some(existing) = self.loop_preheader(region) {
            return Some(existing);
        }
        let entry = self.region(region).entry;
        let blocks: HashSet<BlockId> = self.region_blocks(region).into_iter().collect();
        let pos = self.layout_position(entry)?;
        if let Some(&prev) = pos.checked_sub(1).and_then(|p| self.layout.get(p)) {
            let jumps = self.terminator(prev).and_then(|t| self.node(t).target) == Some(entry);
            if blocks.contains(&prev) && !jumps && self.successors(prev).contains(&entry) {
                return None;
            }
        }

        let outside: Vec<BlockId> = self
            .preds_of(entry)
            .into_iter()
            .filter(|p| !blocks.contains(p))
            .collect();
        let new = self.add_block();
        self.insert_block_before(entry, new);
        for p in outside {
            self.retarget(p, entry, new);
        }
        let owner = self.region(region).parent.unwrap_or(self.root);
        self.add_block_to_region(owner, new);
        Some(new)
    }

    pub fn add_block_to_region(&mut self, region: RegionId, block: BlockId) {
        self.region_mut(region).blocks.push(block);
    }

    // =========================================================================
    // Layout and edge editing
    // =========================================================================

    /// Place `new` immediately before `before` in the layout.
    pub fn insert_block_before(&mut self, before: BlockId, new: BlockId) {
        let pos = self.layout_position(before).unwrap_or(self.layout.len());
        self.layout.insert(pos, new);
    }

    /// Place `new` immediately after `after` in the layout.
    pub fn insert_block_after(&mut self, after: BlockId, new: BlockId) {
        let pos = self
            .layout_position(after)
            .map(|p| p + 1)
            .unwrap_or(self.layout.len());
        self.layout.insert(pos, new);
    }

    /// Redirect explicit branches of `block` that go to `from` so they go to `to`.
    /// Returns whether any explicit target changed.
    pub fn retarget(&mut self, block: BlockId, from: BlockId, to: BlockId) -> bool {
        let Some(last) = self.last_tree(block) else {
            return false;
        };
        let node = self.node_mut(last);
        let mut changed = false;
        if node.target == Some(from) {
            node.target = Some(to);
            changed = true;
        }
        for (_, dest) in node.cases.iter_mut() {
            if *dest == from {
                *dest = to;
                changed = true;
            }
        }
        changed
    }

    /// Insert a new empty block on the edge `from -> to` and return it.
    ///
    /// A fall-through edge gets the new block placed right after `from`; an
    /// explicit branch is redirected to a new block at the end of the layout
    /// that jumps to `to`.
    pub fn split_edge(&mut self, from: BlockId, to: BlockId) -> BlockId {
        let new = self.add_block();
        let falls_through = self.layout_next(from) == Some(to)
            && !matches!(self.terminator(from).map(|t| self.node(t).op), Some(Opcode::Goto))
            && self.terminator(from).and_then(|t| self.node(t).target) != Some(to);
        if falls_through {
            self.insert_block_after(from, new);
        } else {
            self.retarget(from, to, new);
            let goto = self.add_node(Node {
                target: Some(to),
                ..Node::new(Opcode::Goto, super::DataType::NoType, vec![])
            });
            self.block_mut(new).trees.push(goto);
            self.layout.push(new);
        }
        if let Some(region) = self.region_of(from) {
            self.add_block_to_region(region, new);
        }
        new
    }
}
