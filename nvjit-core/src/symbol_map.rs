//! Host symbols that cross into a GPU kernel.
//!
//! One [`SymbolMapEntry`] per symbol referenced inside the loop being
//! offloaded. Loop-invariant values become kernel parameters and get a slot;
//! loop-variant locals stay at slot -1 and are carried as kernel autos.
//! The map lives for one GPU scope and is cleared before the next one.

use indexmap::IndexMap;

use crate::ir::{NodeId, SymbolId};

/// Access bits recorded per parameter.
pub const ACCESS_READ: u8 = 1;
pub const ACCESS_WRITE: u8 = 2;

/// Address range of an array parameter that can be transferred tightly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddrRange {
    /// No access of this kind seen yet.
    #[default]
    NotYetSeen,
    /// Seen, but no range is needed.
    None,
    /// Several or non-affine accesses: transfer the whole array.
    Invalid,
    /// The single affine address expression in the loop.
    Expr(NodeId),
}

impl AddrRange {
    pub fn expr(self) -> Option<NodeId> {
        match self {
            AddrRange::Expr(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolMapEntry {
    /// Node producing the host value, for fields and array elements read
    /// through `LoadIndirect`.
    pub node: Option<NodeId>,
    pub host_symbol: SymbolId,
    /// Array element size in bytes, -1 when the symbol is not an array.
    pub element_size: i32,
    /// Kernel parameter slot, -1 for loop-variant autos.
    pub slot: i32,
    pub access: u8,
    /// Device pointer mirroring an address-typed host value.
    pub dev_temp: Option<SymbolId>,
    /// Host local holding the value handed to the kernel.
    pub host_temp: Option<SymbolId>,
    /// Transfers are hoisted to the enclosing natural-loop scope.
    pub hoist: bool,
    pub rhs: AddrRange,
    pub lhs: AddrRange,
}

impl SymbolMapEntry {
    fn new(host_symbol: SymbolId, element_size: i32, slot: i32, node: Option<NodeId>) -> Self {
        SymbolMapEntry {
            node,
            host_symbol,
            element_size,
            slot,
            access: 0,
            dev_temp: None,
            host_temp: None,
            hoist: false,
            rhs: AddrRange::NotYetSeen,
            lhs: AddrRange::NotYetSeen,
        }
    }

    pub fn is_parameter(&self) -> bool {
        self.slot >= 0
    }

    pub fn is_array(&self) -> bool {
        self.element_size > 0
    }

    pub fn reads(&self) -> bool {
        self.access & ACCESS_READ != 0
    }

    pub fn writes(&self) -> bool {
        self.access & ACCESS_WRITE != 0
    }
}

/// Symbol table of one GPU scope.
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    entries: IndexMap<SymbolId, SymbolMapEntry>,
    next_slot: i32,
    /// Kernel locals in declaration order. Index 0 is the induction variable.
    pub autos: Vec<SymbolId>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.autos.clear();
        self.next_slot = 0;
    }

    /// Give `symbol` a kernel parameter slot.
    ///
    /// A symbol that already has a slot keeps it. A loop-variant entry that is
    /// promoted gets the next free slot.
    pub fn assign_parameter_slot(
        &mut self,
        symbol: SymbolId,
        element_size: i32,
        node: Option<NodeId>,
    ) -> i32 {
        if let Some(entry) = self.entries.get_mut(&symbol) {
            if entry.slot >= 0 {
                return entry.slot;
            }
            entry.slot = self.next_slot;
            entry.element_size = element_size;
            entry.node = node;
            self.next_slot += 1;
            return entry.slot;
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.entries
            .insert(symbol, SymbolMapEntry::new(symbol, element_size, slot, node));
        slot
    }

    /// Record a loop-variant local. It keeps slot -1.
    pub fn map_auto(&mut self, symbol: SymbolId) {
        if !self.entries.contains_key(&symbol) {
            self.entries
                .insert(symbol, SymbolMapEntry::new(symbol, -1, -1, None));
        }
        if !self.autos.contains(&symbol) {
            self.autos.push(symbol);
        }
    }

    pub fn get(&self, symbol: SymbolId) -> Option<&SymbolMapEntry> {
        self.entries.get(&symbol)
    }

    pub fn get_mut(&mut self, symbol: SymbolId) -> Option<&mut SymbolMapEntry> {
        self.entries.get_mut(&symbol)
    }

    pub fn contains(&self, symbol: SymbolId) -> bool {
        self.entries.contains_key(&symbol)
    }

    /// Slot of a parameter, `None` for autos and unmapped symbols.
    pub fn slot(&self, symbol: SymbolId) -> Option<u32> {
        self.get(symbol)
            .filter(|e| e.is_parameter())
            .map(|e| e.slot as u32)
    }

    /// Index of a kernel local in [`SymbolMap::autos`].
    pub fn auto_index(&self, symbol: SymbolId) -> Option<usize> {
        self.autos.iter().position(|&s| s == symbol)
    }

    pub fn next_slot(&self) -> i32 {
        self.next_slot
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolMapEntry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SymbolMapEntry> {
        self.entries.values_mut()
    }

    /// Parameter entries in slot order.
    pub fn parameters(&self) -> Vec<&SymbolMapEntry> {
        let mut params: Vec<&SymbolMapEntry> =
            self.entries.values().filter(|e| e.is_parameter()).collect();
        params.sort_by_key(|e| e.slot);
        params
    }

    /// Symbols of the parameter entries in slot order.
    pub fn parameter_symbols(&self) -> Vec<SymbolId> {
        self.parameters().iter().map(|e| e.host_symbol).collect()
    }
}
