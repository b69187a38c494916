//! Builder for constructing methods, their loops and their region tree.
//!
//! Used by the sample scenarios and by tests. Array accesses are built in the
//! canonical shape the analyzer expects:
//!
//! ```text
//! LoadIndirect <shadow>
//!   AddrAdd
//!     Load a
//!     Add
//!       Mul (Convert i64 (index)) (Const elemSize)
//!       Const headerSize
//! ```
//!
//! and counted loops in the rotated shape with the increment shared between
//! the store and the exit test:
//!
//! ```text
//! Store i (Sub (Load i) (Const -1))
//! If Lt (Sub ...) (Load n)  -> loop entry
//! ```

use std::collections::HashMap;

use super::{
    Block, BlockId, CmpMode, Cond, DataType, InductionVariable, Literal, LoopOrigin, Method, Node,
    NodeId, Opcode, Recognized, Region, RegionId, RegionKind, Symbol, SymbolId, SymbolKind,
};
use crate::IdArena;

/// Error type for method construction.
#[derive(Debug, Clone, PartialEq)]
pub enum BuilderError {
    /// A branch names a block that is not in the layout.
    UnknownTarget { block: BlockId, target: BlockId },
    /// A block has a control transfer before its last tree.
    MisplacedTerminator(BlockId),
    /// A loop was closed without any block in its body.
    EmptyLoop,
}

impl std::fmt::Display for BuilderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuilderError::UnknownTarget { block, target } => {
                write!(f, "{} branches to unknown {}", block, target)
            }
            BuilderError::MisplacedTerminator(b) => {
                write!(f, "{} has a control transfer before its last tree", b)
            }
            BuilderError::EmptyLoop => write!(f, "loop has no body blocks"),
        }
    }
}

impl std::error::Error for BuilderError {}

/// Blocks created for a counted loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopParts {
    pub region: RegionId,
    /// Zero-trip guard in front of the preheader.
    pub guard: BlockId,
    pub preheader: BlockId,
    pub entry: BlockId,
    pub branch_block: BlockId,
    /// Block after the loop; current when the loop is closed.
    pub exit: BlockId,
    /// The shared `Sub (Load i) (Const -1)` increment node.
    pub increment: NodeId,
}

/// Builder for a [`Method`].
///
/// The entry block exists from the start and is current.
pub struct MethodBuilder {
    method: Method,
    current: BlockId,
    shadows: HashMap<DataType, SymbolId>,
    header_size: i64,
    open_loops: Vec<RegionId>,
}

impl MethodBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let mut blocks = IdArena::new();
        let entry = blocks.alloc(Block::default());
        let mut regions = IdArena::new();
        let root = regions.alloc(Region {
            kind: RegionKind::Acyclic,
            entry,
            blocks: Vec::new(),
            children: Vec::new(),
            parent: None,
            induction: None,
            origin: LoopOrigin::Plain,
            transaction_start: false,
        });
        MethodBuilder {
            method: Method {
                name: name.into(),
                is_static: true,
                gpu_kernel: false,
                return_type: DataType::NoType,
                params: Vec::new(),
                nodes: IdArena::new(),
                symbols: IdArena::new(),
                blocks,
                layout: vec![entry],
                regions,
                root,
            },
            current: entry,
            shadows: HashMap::new(),
            header_size: crate::config::ObjectModel::default().array_header_size as i64,
            open_loops: Vec::new(),
        }
    }

    pub fn set_static(&mut self, is_static: bool) -> &mut Self {
        self.method.is_static = is_static;
        self
    }

    pub fn set_gpu_kernel(&mut self, gpu_kernel: bool) -> &mut Self {
        self.method.gpu_kernel = gpu_kernel;
        self
    }

    pub fn set_return_type(&mut self, ty: DataType) -> &mut Self {
        self.method.return_type = ty;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    // =========================================================================
    // Symbols
    // =========================================================================

    fn symbol(&mut self, name: &str, ty: DataType, kind: SymbolKind) -> SymbolId {
        self.method.add_symbol(Symbol {
            name: name.to_string(),
            ty,
            kind,
            signature: None,
            recognized: None,
        })
    }

    pub fn auto(&mut self, name: &str, ty: DataType) -> SymbolId {
        self.symbol(name, ty, SymbolKind::Auto)
    }

    pub fn parm(&mut self, name: &str, ty: DataType) -> SymbolId {
        let slot = self.method.params.len() as u32;
        let id = self.symbol(name, ty, SymbolKind::Parm { slot });
        self.method.params.push(id);
        id
    }

    pub fn array_parm(&mut self, name: &str, signature: &str) -> SymbolId {
        let id = self.parm(name, DataType::Address);
        self.method.symbols[id].signature = Some(signature.to_string());
        id
    }

    /// The static flag guarding the GPU side of a parallel forEach.
    pub fn try_gpu_flag(&mut self) -> SymbolId {
        let id = self.symbol("tryGPU", DataType::Int32, SymbolKind::Static);
        self.method.symbols[id].recognized = Some(Recognized::TryGpu);
        id
    }

    pub fn field(&mut self, name: &str, ty: DataType, shared: Option<u32>) -> SymbolId {
        self.symbol(name, ty, SymbolKind::Field { shared })
    }

    /// Array-typed instance field. `shared` places it in on-device shared
    /// memory with that many elements.
    pub fn array_field(&mut self, name: &str, signature: &str, shared: Option<u32>) -> SymbolId {
        let id = self.field(name, DataType::Address, shared);
        self.method.symbols[id].signature = Some(signature.to_string());
        id
    }

    /// Element shadow for arrays of `ty`, one per element type.
    pub fn shadow(&mut self, ty: DataType) -> SymbolId {
        if let Some(&s) = self.shadows.get(&ty) {
            return s;
        }
        let id = self.symbol(&format!("<array-shadow {}>", ty), ty, SymbolKind::ArrayShadow);
        self.shadows.insert(ty, id);
        id
    }

    pub fn method_symbol(
        &mut self,
        class: &str,
        name: &str,
        ret: DataType,
        recognized: Option<Recognized>,
    ) -> SymbolId {
        let id = self.symbol(
            name,
            ret,
            SymbolKind::Method {
                class: class.to_string(),
                resolved: true,
            },
        );
        self.method.symbols[id].recognized = recognized;
        id
    }

    pub fn unresolved_method(&mut self, class: &str, name: &str, ret: DataType) -> SymbolId {
        self.symbol(
            name,
            ret,
            SymbolKind::Method {
                class: class.to_string(),
                resolved: false,
            },
        )
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    pub fn node(&mut self, node: Node) -> NodeId {
        self.method.add_node(node)
    }

    fn constant(&mut self, ty: DataType, literal: Literal) -> NodeId {
        self.node(Node {
            literal: Some(literal),
            ..Node::new(Opcode::Const, ty, vec![])
        })
    }

    pub fn iconst(&mut self, v: i32) -> NodeId {
        self.constant(DataType::Int32, Literal::Int(v as i64))
    }

    pub fn lconst(&mut self, v: i64) -> NodeId {
        self.constant(DataType::Int64, Literal::Int(v))
    }

    pub fn fconst(&mut self, v: f32) -> NodeId {
        self.constant(DataType::Float, Literal::Float(v as f64))
    }

    pub fn dconst(&mut self, v: f64) -> NodeId {
        self.constant(DataType::Double, Literal::Float(v))
    }

    pub fn aconst_null(&mut self) -> NodeId {
        self.constant(DataType::Address, Literal::Int(0))
    }

    pub fn load(&mut self, sym: SymbolId) -> NodeId {
        let ty = self.method.symbols[sym].ty;
        self.node(Node {
            symbol: Some(sym),
            ..Node::new(Opcode::Load, ty, vec![])
        })
    }

    pub fn store_node(&mut self, sym: SymbolId, value: NodeId) -> NodeId {
        let ty = self.method.symbols[sym].ty;
        self.node(Node {
            symbol: Some(sym),
            ..Node::new(Opcode::Store, ty, vec![value])
        })
    }

    pub fn unary(&mut self, op: Opcode, ty: DataType, a: NodeId) -> NodeId {
        self.node(Node::new(op, ty, vec![a]))
    }

    pub fn binary(&mut self, op: Opcode, ty: DataType, a: NodeId, b: NodeId) -> NodeId {
        self.node(Node::new(op, ty, vec![a, b]))
    }

    pub fn convert(&mut self, ty: DataType, a: NodeId) -> NodeId {
        self.unary(Opcode::Convert, ty, a)
    }

    pub fn compare(&mut self, cond: Cond, mode: CmpMode, a: NodeId, b: NodeId) -> NodeId {
        self.binary(Opcode::Compare(cond, mode), DataType::Int32, a, b)
    }

    /// Byte address of `base[index]` for elements of `elem_size` bytes.
    pub fn element_address(&mut self, base: NodeId, index: NodeId, elem_size: u32) -> NodeId {
        let wide = self.convert(DataType::Int64, index);
        let size = self.lconst(elem_size as i64);
        let scaled = self.binary(Opcode::Mul, DataType::Int64, wide, size);
        let header = self.lconst(self.header_size);
        let offset = self.binary(Opcode::Add, DataType::Int64, scaled, header);
        self.binary(Opcode::AddrAdd, DataType::Address, base, offset)
    }

    /// `base[index]` for an array of `ty`.
    pub fn load_element(&mut self, base: NodeId, index: NodeId, ty: DataType) -> NodeId {
        let addr = self.element_address(base, index, ty.size());
        let shadow = self.shadow(ty);
        self.node(Node {
            symbol: Some(shadow),
            ..Node::new(Opcode::LoadIndirect, ty, vec![addr])
        })
    }

    pub fn store_element_node(
        &mut self,
        base: NodeId,
        index: NodeId,
        ty: DataType,
        value: NodeId,
    ) -> NodeId {
        let addr = self.element_address(base, index, ty.size());
        let shadow = self.shadow(ty);
        self.node(Node {
            symbol: Some(shadow),
            ..Node::new(Opcode::StoreIndirect, ty, vec![addr, value])
        })
    }

    pub fn load_field(&mut self, object: NodeId, field: SymbolId, offset: i64) -> NodeId {
        let ty = self.method.symbols[field].ty;
        let off = self.lconst(offset);
        let addr = self.binary(Opcode::AddrAdd, DataType::Address, object, off);
        self.node(Node {
            symbol: Some(field),
            ..Node::new(Opcode::LoadIndirect, ty, vec![addr])
        })
    }

    pub fn array_length(&mut self, array: NodeId) -> NodeId {
        self.unary(Opcode::ArrayLength, DataType::Int32, array)
    }

    pub fn call(&mut self, method: SymbolId, args: Vec<NodeId>) -> NodeId {
        let ty = self.method.symbols[method].ty;
        self.node(Node {
            symbol: Some(method),
            ..Node::new(Opcode::Call, ty, args)
        })
    }

    // =========================================================================
    // Statements and control flow
    // =========================================================================

    /// Append a tree to the current block.
    pub fn push(&mut self, tree: NodeId) -> NodeId {
        let current = self.current;
        self.method.blocks[current].trees.push(tree);
        tree
    }

    pub fn store(&mut self, sym: SymbolId, value: NodeId) -> NodeId {
        let st = self.store_node(sym, value);
        self.push(st)
    }

    pub fn store_element(
        &mut self,
        base: NodeId,
        index: NodeId,
        ty: DataType,
        value: NodeId,
    ) -> NodeId {
        let st = self.store_element_node(base, index, ty, value);
        self.push(st)
    }

    /// Anchor an expression evaluated for its side effects.
    pub fn treetop(&mut self, expr: NodeId) -> NodeId {
        let tt = self.node(Node::new(Opcode::TreeTop, DataType::NoType, vec![expr]));
        self.push(tt)
    }

    /// Allocate a new block at the end of the layout without switching to it.
    pub fn new_block(&mut self) -> BlockId {
        let b = self.method.add_block();
        self.method.layout.push(b);
        b
    }

    /// Allocate a block to branch to before it is placed.
    pub fn reserve_block(&mut self) -> BlockId {
        self.method.add_block()
    }

    /// Append a reserved block to the layout and make it current.
    pub fn place_block(&mut self, block: BlockId) {
        if !self.method.layout.contains(&block) {
            self.method.layout.push(block);
        }
        self.current = block;
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    /// Start a new block in layout order and make it current.
    pub fn begin_block(&mut self) -> BlockId {
        let b = self.new_block();
        self.current = b;
        b
    }

    pub fn if_goto(
        &mut self,
        cond: Cond,
        mode: CmpMode,
        a: NodeId,
        b: NodeId,
        target: BlockId,
    ) -> NodeId {
        let node = self.node(Node {
            target: Some(target),
            ..Node::new(Opcode::If(cond, mode), DataType::NoType, vec![a, b])
        });
        self.push(node)
    }

    pub fn goto(&mut self, target: BlockId) -> NodeId {
        let node = self.node(Node {
            target: Some(target),
            ..Node::new(Opcode::Goto, DataType::NoType, vec![])
        });
        self.push(node)
    }

    pub fn ret(&mut self, value: Option<NodeId>) -> NodeId {
        let (ty, children) = match value {
            Some(v) => (self.method.nodes[v].ty, vec![v]),
            None => (DataType::NoType, vec![]),
        };
        let node = self.node(Node::new(Opcode::Return, ty, children));
        self.push(node)
    }

    pub fn set_cold(&mut self, block: BlockId) {
        self.method.blocks[block].cold = true;
    }

    pub fn set_pipeline(&mut self, block: BlockId) {
        self.method.blocks[block].pipeline = true;
    }

    /// Guard the rest of the current block on the tryGPU flag. The new current
    /// block is the GPU side; `cpu_path` is taken when the flag is zero.
    pub fn try_gpu_guard(&mut self, flag: SymbolId, cpu_path: BlockId) -> BlockId {
        let load = self.load(flag);
        let zero = self.iconst(0);
        self.if_goto(Cond::Eq, CmpMode::Signed, load, zero, cpu_path);
        self.begin_block()
    }

    // =========================================================================
    // Loops
    // =========================================================================

    /// Build `for (iv = start; iv < bound; iv++) body` from the current block.
    ///
    /// The current block receives the initialization and the zero-trip guard.
    /// `body` is called with the loop entry current and a fresh load of `iv`;
    /// every block it creates belongs to the loop. Loops built inside `body`
    /// become children of this one.
    pub fn counted_loop(
        &mut self,
        iv: SymbolId,
        start: NodeId,
        bound_sym: SymbolId,
        origin: LoopOrigin,
        body: impl FnOnce(&mut Self, NodeId),
    ) -> Result<LoopParts, BuilderError> {
        let guard = self.current;
        self.store(iv, start);
        let exit = self.method.add_block();

        let iv_load = self.load(iv);
        let bound_load = self.load(bound_sym);
        self.if_goto(Cond::Ge, CmpMode::Signed, iv_load, bound_load, exit);

        let preheader = self.begin_block();
        let entry = self.begin_block();

        let region = self.method.regions.alloc(Region {
            kind: RegionKind::NaturalLoop,
            entry,
            blocks: Vec::new(),
            children: Vec::new(),
            parent: self.open_loops.last().copied(),
            induction: None,
            origin,
            transaction_start: false,
        });
        if let Some(&outer) = self.open_loops.last() {
            self.method.regions[outer].children.push(region);
        }
        self.method.regions[region].blocks.push(entry);
        self.open_loops.push(region);

        let first = self.method.layout.len() - 1;
        let body_iv = self.load(iv);
        body(self, body_iv);
        self.open_loops.pop();

        // Blocks created by the body that nested loops did not claim.
        let claimed: Vec<BlockId> = self
            .method
            .descendants(region)
            .into_iter()
            .flat_map(|r| self.method.regions[r].blocks.clone())
            .collect();
        let created: Vec<BlockId> = self.method.layout[first + 1..]
            .iter()
            .copied()
            .filter(|b| !claimed.contains(b) && !self.method.regions[region].blocks.contains(b))
            .collect();
        self.method.regions[region].blocks.extend(created);

        let branch_block = self.current;
        if !self.method.regions[region].blocks.contains(&branch_block) {
            return Err(BuilderError::EmptyLoop);
        }
        let old = self.load(iv);
        let minus_one = self.iconst(-1);
        let increment = self.binary(Opcode::Sub, DataType::Int32, old, minus_one);
        self.store(iv, increment);
        let bound_again = self.load(bound_sym);
        self.if_goto(Cond::Lt, CmpMode::Signed, increment, bound_again, entry);

        self.method.regions[region].induction = Some(InductionVariable {
            symbol: iv,
            entry: Some(start),
            exit_bound: Some(bound_again),
            increment: 1,
            branch_block,
        });

        self.method.layout.push(exit);
        self.current = exit;
        if let Some(&outer) = self.open_loops.last() {
            self.method.regions[outer].blocks.push(preheader);
            self.method.regions[outer].blocks.push(exit);
        }

        Ok(LoopParts {
            region,
            guard,
            preheader,
            entry,
            branch_block,
            exit,
            increment,
        })
    }

    /// Validate the CFG and attach unclaimed blocks and loops to the root.
    pub fn finish(mut self) -> Result<Method, BuilderError> {
        let root = self.method.root;
        let mut claimed = Vec::new();
        for (&id, r) in &self.method.regions {
            if id != root {
                claimed.extend(r.blocks.iter().copied());
            }
        }
        let top: Vec<RegionId> = self
            .method
            .regions
            .iter()
            .filter(|&(&id, r)| id != root && r.parent.is_none())
            .map(|(&id, _)| id)
            .collect();
        for r in &top {
            self.method.regions[*r].parent = Some(root);
        }
        let unclaimed: Vec<BlockId> = self
            .method
            .layout
            .iter()
            .copied()
            .filter(|b| !claimed.contains(b))
            .collect();
        let root_region = &mut self.method.regions[root];
        root_region.children = top;
        root_region.blocks = unclaimed;

        for &b in &self.method.layout {
            let trees = &self.method.blocks[b].trees;
            for (i, &t) in trees.iter().enumerate() {
                let node = &self.method.nodes[t];
                if node.op.is_terminator() && i + 1 != trees.len() {
                    return Err(BuilderError::MisplacedTerminator(b));
                }
                let targets = node.target.iter().chain(node.cases.iter().map(|(_, d)| d));
                for &target in targets {
                    if !self.method.layout.contains(&target) {
                        return Err(BuilderError::UnknownTarget { block: b, target });
                    }
                }
            }
        }
        Ok(self.method)
    }
}
