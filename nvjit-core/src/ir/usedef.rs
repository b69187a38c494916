//! Reaching definitions for direct loads and stores of locals and parameters.
//!
//! A definition is either the value a symbol holds on method entry or a direct
//! store. A load sees the definitions reaching the start of the tree in which
//! it is first referenced; stores in the same tree take effect afterwards.

use std::collections::{HashMap, HashSet};

use super::{BlockId, Method, NodeId, Opcode, SymbolId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefSite {
    /// Value on method entry.
    Entry(SymbolId),
    Store(NodeId),
}

#[derive(Debug, Clone, Default)]
pub struct UseDefInfo {
    defs_of_use: HashMap<NodeId, Vec<DefSite>>,
    uses_of_def: HashMap<DefSite, Vec<NodeId>>,
    block_of: HashMap<NodeId, BlockId>,
}

type DefSet = HashSet<DefSite>;

impl UseDefInfo {
    pub fn compute(method: &Method) -> Self {
        let tracked: HashSet<SymbolId> = method
            .symbols
            .iter()
            .filter(|(_, s)| s.is_auto_or_parm())
            .map(|(&id, _)| id)
            .collect();

        let symbol_of = |site: &DefSite| -> Option<SymbolId> {
            match site {
                DefSite::Entry(s) => Some(*s),
                DefSite::Store(n) => method.node(*n).symbol,
            }
        };

        // Direct stores of each tree, in evaluation order.
        let mut tree_stores: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut tree_loads: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut seen = HashSet::new();
        for &b in &method.layout {
            for &t in &method.block(b).trees {
                let mut stores = Vec::new();
                let mut loads = Vec::new();
                collect(method, t, &tracked, &mut seen, &mut stores, &mut loads);
                tree_stores.insert(t, stores);
                tree_loads.insert(t, loads);
            }
        }

        let apply = |set: &mut DefSet, stores: &[NodeId]| {
            for &st in stores {
                let sym = method.node(st).symbol;
                set.retain(|d| symbol_of(d) != sym);
                set.insert(DefSite::Store(st));
            }
        };

        let preds = method.predecessors();
        let entry = method.entry_block();
        let entry_defs: DefSet = tracked.iter().map(|&s| DefSite::Entry(s)).collect();
        let mut out: HashMap<BlockId, DefSet> =
            method.layout.iter().map(|&b| (b, DefSet::new())).collect();

        let block_in = |b: BlockId, out: &HashMap<BlockId, DefSet>| -> DefSet {
            let mut set = if Some(b) == entry {
                entry_defs.clone()
            } else {
                DefSet::new()
            };
            for p in preds.get(&b).into_iter().flatten() {
                set.extend(out[p].iter().copied());
            }
            set
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &b in &method.layout {
                let mut set = block_in(b, &out);
                for t in &method.block(b).trees {
                    apply(&mut set, &tree_stores[t]);
                }
                if set != out[&b] {
                    out.insert(b, set);
                    changed = true;
                }
            }
        }

        let mut info = UseDefInfo::default();
        for &b in &method.layout {
            let mut set = block_in(b, &out);
            for t in &method.block(b).trees {
                for &load in &tree_loads[t] {
                    let sym = method.node(load).symbol;
                    let mut defs: Vec<DefSite> =
                        set.iter().copied().filter(|d| symbol_of(d) == sym).collect();
                    defs.sort_by_key(def_order);
                    for &d in &defs {
                        info.uses_of_def.entry(d).or_default().push(load);
                    }
                    info.defs_of_use.insert(load, defs);
                    info.block_of.insert(load, b);
                }
                for &st in &tree_stores[t] {
                    info.block_of.insert(st, b);
                }
                apply(&mut set, &tree_stores[t]);
            }
        }
        info
    }

    /// Definitions reaching a direct load.
    pub fn defs_of(&self, use_node: NodeId) -> &[DefSite] {
        self.defs_of_use.get(&use_node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct loads reached by a definition.
    pub fn uses_of(&self, def: DefSite) -> &[NodeId] {
        self.uses_of_def.get(&def).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Block in which a tracked load or store is evaluated.
    pub fn block_of(&self, node: NodeId) -> Option<BlockId> {
        self.block_of.get(&node).copied()
    }
}

fn def_order(d: &DefSite) -> (u8, u32) {
    match d {
        DefSite::Entry(s) => (0, s.0),
        DefSite::Store(n) => (1, n.0),
    }
}

fn collect(
    method: &Method,
    id: NodeId,
    tracked: &HashSet<SymbolId>,
    seen: &mut HashSet<NodeId>,
    stores: &mut Vec<NodeId>,
    loads: &mut Vec<NodeId>,
) {
    if !seen.insert(id) {
        return;
    }
    let node = method.node(id);
    for &c in &node.children {
        collect(method, c, tracked, seen, stores, loads);
    }
    let on_tracked = node.symbol.is_some_and(|s| tracked.contains(&s));
    match node.op {
        Opcode::Load if on_tracked => loads.push(id),
        Opcode::Store if on_tracked => stores.push(id),
        _ => {}
    }
}
