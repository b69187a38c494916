//! Tree IR consumed by the GPU kernel generator and the loop parallelizer.
//!
//! A [`Method`] is a list of blocks in physical layout order. Each block holds
//! statement trees whose nodes live in a flat arena. A node may be referenced
//! from several parents (it is then evaluated once, at its first reference).
//!
//! Control flow is implicit in the last tree of each block:
//! - `If` branches to its target or falls through to the layout successor
//! - `Goto` jumps to its target
//! - `Return` leaves the method
//! - `Lookup`/`Table` switch over their cases and default
//! - anything else falls through to the layout successor
//!
//! Loop structure is supplied alongside the CFG as a [`Region`] tree (the
//! structural analysis of the host compiler); see [`structure`].

pub mod builder;
pub mod dominators;
pub mod dump;
pub mod edit;
pub mod structure;
pub mod usedef;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::IdArena;

// =============================================================================
// ID Types
// =============================================================================

/// IR node. IDs are assigned once and never reused within a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        NodeId(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Symbol referenced by loads, stores and calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolId(pub u32);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for SymbolId {
    fn from(id: u32) -> Self {
        SymbolId(id)
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Basic block. Block numbers appear in kernel labels (`block_N`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for BlockId {
    fn from(id: u32) -> Self {
        BlockId(id)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block_{}", self.0)
    }
}

/// Node of the region structure tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(pub u32);

impl RegionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for RegionId {
    fn from(id: u32) -> Self {
        RegionId(id)
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region {}", self.0)
    }
}

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    NoType,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    Address,
    VectorInt8,
    VectorInt16,
    VectorInt32,
    VectorInt64,
    VectorFloat,
    VectorDouble,
}

/// Width in bytes of every vector type.
pub const VECTOR_LENGTH: u32 = 16;

impl DataType {
    pub fn size(self) -> u32 {
        match self {
            DataType::NoType => 0,
            DataType::Int8 => 1,
            DataType::Int16 => 2,
            DataType::Int32 | DataType::Float => 4,
            DataType::Int64 | DataType::Double | DataType::Address => 8,
            _ => VECTOR_LENGTH,
        }
    }

    pub fn is_integral(self) -> bool {
        matches!(
            self,
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64
        )
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, DataType::Float | DataType::Double)
    }

    /// Vector type with this element type.
    pub fn vector_of(self) -> Option<DataType> {
        match self {
            DataType::Int8 => Some(DataType::VectorInt8),
            DataType::Int16 => Some(DataType::VectorInt16),
            DataType::Int32 => Some(DataType::VectorInt32),
            DataType::Int64 => Some(DataType::VectorInt64),
            DataType::Float => Some(DataType::VectorFloat),
            DataType::Double => Some(DataType::VectorDouble),
            _ => None,
        }
    }

    /// Element type of a vector type; scalar types map to themselves.
    pub fn element(self) -> DataType {
        match self {
            DataType::VectorInt8 => DataType::Int8,
            DataType::VectorInt16 => DataType::Int16,
            DataType::VectorInt32 => DataType::Int32,
            DataType::VectorInt64 => DataType::Int64,
            DataType::VectorFloat => DataType::Float,
            DataType::VectorDouble => DataType::Double,
            other => other,
        }
    }

    /// Number of elements of `self` that fit in one vector register.
    pub fn lanes(self) -> u32 {
        match self.element().size() {
            0 => 0,
            n => VECTOR_LENGTH / n,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// Opcodes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Cond {
    /// Condition that holds exactly when `self` does not.
    pub fn reversed(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
        }
    }
}

/// How a comparison treats its operands.
///
/// Integers compare signed or unsigned. Floating point compares ordered or
/// unordered (unordered is true when either operand is NaN).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CmpMode {
    #[default]
    Signed,
    Unsigned,
    Ordered,
    Unordered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// Literal in `Node::literal`. An `Address` constant must be 0 (null).
    Const,
    /// Direct load of `Node::symbol`.
    Load,
    /// Direct store of child 0 into `Node::symbol`.
    Store,
    /// Load through the address in child 0. `Node::symbol` is the array
    /// shadow or the field being read.
    LoadIndirect,
    /// Store child 1 through the address in child 0.
    StoreIndirect,
    /// Address of `Node::symbol`.
    LoadAddr,

    Add,
    Sub,
    Mul,
    Div,
    UDiv,
    Rem,
    URem,
    Neg,
    Abs,
    Shl,
    Shr,
    UShr,
    Rol,
    And,
    Or,
    Xor,
    /// High half of the double-width product.
    MulHigh,
    UMulHigh,

    /// Signed conversion to `Node::ty` from the type of child 0.
    Convert,
    UConvert,
    /// Reinterpret the bits of child 0 as `Node::ty`.
    BitsCast,
    /// Address plus byte offset.
    AddrAdd,

    /// Comparison producing an `Int32` 0 or 1.
    Compare(Cond, CmpMode),
    /// Conditional branch to `Node::target`.
    If(Cond, CmpMode),
    Goto,
    /// Return, with the value in child 0 unless `Node::ty` is `NoType`.
    Return,
    /// Switch on child 0 over `Node::cases`; default in `Node::target`.
    Lookup,
    /// Switch on child 0 over `0..cases.len()`; default in `Node::target`.
    Table,

    /// Throws when the reference in child 0 is null; evaluates to it.
    NullCheck,
    /// Throws unless `0 <= child 1 < child 0` (array length, index).
    BoundCheck,
    /// Throws when the divisor in child 0 is zero.
    DivCheck,

    ArrayLength,
    /// Copy child 2 bytes from child 0 to child 1. With five children the
    /// first two are the source and destination objects.
    ArrayCopy {
        width: u8,
        backward: bool,
    },
    NewArray,
    /// Call of `Node::symbol` with the children as arguments.
    Call,
    /// Anchor evaluating child 0 for its side effects.
    TreeTop,
    /// Evaluates to child 0.
    PassThrough,

    /// Broadcast scalar child 0 to every vector lane.
    Splat,
    /// Lane `Node::literal` of vector child 0.
    GetElem,
    /// Vector whose lane `k` is `k`.
    LaneIndex,
}

impl Opcode {
    pub fn is_branch(self) -> bool {
        matches!(self, Opcode::If(..) | Opcode::Goto)
    }

    pub fn is_switch(self) -> bool {
        matches!(self, Opcode::Lookup | Opcode::Table)
    }

    /// Ends a block with an explicit control transfer.
    pub fn is_terminator(self) -> bool {
        self.is_branch() || self.is_switch() || self == Opcode::Return
    }

    pub fn is_store(self) -> bool {
        matches!(self, Opcode::Store | Opcode::StoreIndirect)
    }

    pub fn is_load(self) -> bool {
        matches!(self, Opcode::Load | Opcode::LoadIndirect)
    }

    pub fn is_check(self) -> bool {
        matches!(self, Opcode::NullCheck | Opcode::BoundCheck | Opcode::DivCheck)
    }
}

// =============================================================================
// Nodes and symbols
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub op: Opcode,
    #[serde(default)]
    pub ty: DataType,
    #[serde(default)]
    pub children: Vec<NodeId>,
    #[serde(default)]
    pub symbol: Option<SymbolId>,
    #[serde(default)]
    pub literal: Option<Literal>,
    #[serde(default)]
    pub target: Option<BlockId>,
    #[serde(default)]
    pub cases: Vec<(i64, BlockId)>,
    /// Constant or arithmetic with unsigned semantics.
    #[serde(default)]
    pub unsigned: bool,
}

impl Node {
    pub fn new(op: Opcode, ty: DataType, children: Vec<NodeId>) -> Self {
        Node {
            op,
            ty,
            children,
            symbol: None,
            literal: None,
            target: None,
            cases: Vec::new(),
            unsigned: false,
        }
    }

    pub fn child(&self, i: usize) -> Option<NodeId> {
        self.children.get(i).copied()
    }

    pub fn int_value(&self) -> Option<i64> {
        match (self.op, self.literal) {
            (Opcode::Const, Some(Literal::Int(v))) => Some(v),
            _ => None,
        }
    }

    pub fn is_null_const(&self) -> bool {
        self.op == Opcode::Const && self.ty == DataType::Address && self.int_value() == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn name(self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        }
    }
}

/// Methods and fields with a fixed meaning to the kernel generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recognized {
    BlockIdx(Axis),
    BlockDim(Axis),
    ThreadIdx(Axis),
    SyncThreads,
    Sqrt,
    Sin,
    Cos,
    Log,
    Exp,
    AbsF,
    AbsD,
    /// Static flag selecting the GPU side of a parallel forEach.
    TryGpu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SymbolKind {
    /// Method local.
    Auto,
    /// Method parameter in `slot` (slot 0 is `this` for instance methods).
    Parm { slot: u32 },
    Static,
    /// The elements of all arrays of one element type.
    ArrayShadow,
    /// Instance field. `shared` is the element count of a field annotated to
    /// live in on-device shared memory.
    Field { shared: Option<u32> },
    Method { class: String, resolved: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub ty: DataType,
    pub kind: SymbolKind,
    /// Declared type signature, e.g. `[I` for an int array.
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub recognized: Option<Recognized>,
}

impl Symbol {
    pub fn is_auto_or_parm(&self) -> bool {
        matches!(self.kind, SymbolKind::Auto | SymbolKind::Parm { .. })
    }

    pub fn is_static(&self) -> bool {
        self.kind == SymbolKind::Static
    }

    pub fn is_array_shadow(&self) -> bool {
        self.kind == SymbolKind::ArrayShadow
    }

    pub fn shared_memory_len(&self) -> Option<u32> {
        match self.kind {
            SymbolKind::Field { shared } => shared,
            _ => None,
        }
    }

    pub fn is_resolved_method(&self) -> bool {
        matches!(self.kind, SymbolKind::Method { resolved: true, .. })
    }

    pub fn class_name(&self) -> Option<&str> {
        match &self.kind {
            SymbolKind::Method { class, .. } => Some(class),
            _ => None,
        }
    }
}

/// Element size in bytes of an array signature such as `[I`.
pub fn array_element_size(signature: &str) -> Option<u32> {
    let rest = signature.strip_prefix('[')?;
    match rest.chars().next()? {
        'Z' | 'B' => Some(1),
        'C' | 'S' => Some(2),
        'I' | 'F' => Some(4),
        'J' | 'D' => Some(8),
        'L' | '[' => Some(8),
        _ => None,
    }
}

// =============================================================================
// Blocks, regions and methods
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub trees: Vec<NodeId>,
    #[serde(default)]
    pub cold: bool,
    /// Block belongs to the forEach pipeline machinery around a kernel.
    #[serde(default)]
    pub pipeline: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionKind {
    Acyclic,
    NaturalLoop,
}

/// Source construct a loop was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoopOrigin {
    #[default]
    Plain,
    /// Body of a parallel `IntStream.forEach`.
    ParallelForEach,
    /// Loop explicitly marked as a data-parallel kernel.
    SpmdKernel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InductionVariable {
    pub symbol: SymbolId,
    /// Initial value.
    pub entry: Option<NodeId>,
    /// Right-hand side of the exit test.
    pub exit_bound: Option<NodeId>,
    pub increment: i64,
    /// Block holding the exit test.
    pub branch_block: BlockId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub kind: RegionKind,
    pub entry: BlockId,
    /// Blocks directly in this region, excluding those of child regions.
    pub blocks: Vec<BlockId>,
    #[serde(default)]
    pub children: Vec<RegionId>,
    #[serde(default)]
    pub parent: Option<RegionId>,
    #[serde(default)]
    pub induction: Option<InductionVariable>,
    #[serde(default)]
    pub origin: LoopOrigin,
    #[serde(default)]
    pub transaction_start: bool,
}

impl Region {
    pub fn is_natural_loop(&self) -> bool {
        self.kind == RegionKind::NaturalLoop
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    #[serde(default)]
    pub is_static: bool,
    /// Whole method is compiled as a GPU kernel.
    #[serde(default)]
    pub gpu_kernel: bool,
    #[serde(default)]
    pub return_type: DataType,
    /// Parameters in slot order.
    #[serde(default)]
    pub params: Vec<SymbolId>,
    pub nodes: IdArena<NodeId, Node>,
    pub symbols: IdArena<SymbolId, Symbol>,
    pub blocks: IdArena<BlockId, Block>,
    /// Physical block order. The first block is the method entry.
    pub layout: Vec<BlockId>,
    pub regions: IdArena<RegionId, Region>,
    pub root: RegionId,
}

impl Method {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id]
    }

    pub fn region(&self, id: RegionId) -> &Region {
        &self.regions[id]
    }

    pub fn region_mut(&mut self, id: RegionId) -> &mut Region {
        &mut self.regions[id]
    }

    pub fn entry_block(&self) -> Option<BlockId> {
        self.layout.first().copied()
    }

    pub fn add_node(&mut self, node: Node) -> NodeId {
        self.nodes.alloc(node)
    }

    pub fn add_symbol(&mut self, symbol: Symbol) -> SymbolId {
        self.symbols.alloc(symbol)
    }

    /// Allocate an empty block. It is not placed in the layout.
    pub fn add_block(&mut self) -> BlockId {
        self.blocks.alloc(Block::default())
    }

    /// Symbol of a node, when the node's opcode carries one.
    pub fn node_symbol(&self, id: NodeId) -> Option<&Symbol> {
        self.node(id).symbol.map(|s| self.symbol(s))
    }

    /// Last tree of a block, the one that decides its successors.
    pub fn last_tree(&self, block: BlockId) -> Option<NodeId> {
        self.block(block).trees.last().copied()
    }

    pub fn temp(&mut self, name: impl Into<String>, ty: DataType) -> SymbolId {
        self.add_symbol(Symbol {
            name: name.into(),
            ty,
            kind: SymbolKind::Auto,
            signature: None,
            recognized: None,
        })
    }

    /// Structural copy of a tree. Leaves are copied too, so the result shares
    /// nothing with the original.
    pub fn dup_tree(&mut self, id: NodeId) -> NodeId {
        let mut node = self.node(id).clone();
        let children = node.children.clone();
        node.children = children.into_iter().map(|c| self.dup_tree(c)).collect();
        self.add_node(node)
    }

    /// Visit every node of the given trees once, children before parents.
    pub fn walk_postorder(&self, roots: &[NodeId], f: &mut impl FnMut(NodeId, &Node)) {
        let mut seen = std::collections::HashSet::new();
        for &root in roots {
            self.walk_postorder_from(root, &mut seen, f);
        }
    }

    fn walk_postorder_from(
        &self,
        id: NodeId,
        seen: &mut std::collections::HashSet<NodeId>,
        f: &mut impl FnMut(NodeId, &Node),
    ) {
        if !seen.insert(id) {
            return;
        }
        let node = self.node(id);
        for &c in &node.children {
            self.walk_postorder_from(c, seen, f);
        }
        f(id, node);
    }
}
