//! Node constructors for rewriting an existing method.
//!
//! New nodes are always fresh; shared nodes of the original trees are never
//! mutated, only referenced or copied.

use super::{BlockId, Cond, CmpMode, DataType, Literal, Method, Node, NodeId, Opcode, RegionId, Symbol, SymbolId, SymbolKind};

impl Method {
    pub fn new_const(&mut self, ty: DataType, literal: Literal) -> NodeId {
        self.add_node(Node {
            literal: Some(literal),
            ..Node::new(Opcode::Const, ty, vec![])
        })
    }

    pub fn new_int(&mut self, ty: DataType, v: i64) -> NodeId {
        self.new_const(ty, Literal::Int(v))
    }

    pub fn new_load(&mut self, sym: SymbolId) -> NodeId {
        let ty = self.symbol(sym).ty;
        self.add_node(Node {
            symbol: Some(sym),
            ..Node::new(Opcode::Load, ty, vec![])
        })
    }

    pub fn new_load_addr(&mut self, sym: SymbolId) -> NodeId {
        self.add_node(Node {
            symbol: Some(sym),
            ..Node::new(Opcode::LoadAddr, DataType::Address, vec![])
        })
    }

    pub fn new_store(&mut self, sym: SymbolId, value: NodeId) -> NodeId {
        let ty = self.symbol(sym).ty;
        self.add_node(Node {
            symbol: Some(sym),
            ..Node::new(Opcode::Store, ty, vec![value])
        })
    }

    pub fn new_op(&mut self, op: Opcode, ty: DataType, children: Vec<NodeId>) -> NodeId {
        self.add_node(Node::new(op, ty, children))
    }

    pub fn new_call(&mut self, callee: SymbolId, args: Vec<NodeId>) -> NodeId {
        let ty = self.symbol(callee).ty;
        self.add_node(Node {
            symbol: Some(callee),
            ..Node::new(Opcode::Call, ty, args)
        })
    }

    pub fn new_treetop(&mut self, expr: NodeId) -> NodeId {
        self.new_op(Opcode::TreeTop, DataType::NoType, vec![expr])
    }

    pub fn new_if(&mut self, cond: Cond, a: NodeId, b: NodeId, target: BlockId) -> NodeId {
        self.add_node(Node {
            target: Some(target),
            ..Node::new(Opcode::If(cond, CmpMode::Signed), DataType::NoType, vec![a, b])
        })
    }

    pub fn new_goto(&mut self, target: BlockId) -> NodeId {
        self.add_node(Node {
            target: Some(target),
            ..Node::new(Opcode::Goto, DataType::NoType, vec![])
        })
    }

    /// Convert an integer value to `Int64` unless it already is one.
    pub fn widen_to_long(&mut self, value: NodeId) -> NodeId {
        if self.node(value).ty == DataType::Int64 {
            value
        } else {
            self.new_op(Opcode::Convert, DataType::Int64, vec![value])
        }
    }

    /// Find or declare a resolved method symbol of `class`.
    pub fn helper_symbol(&mut self, class: &str, name: &str, ret: DataType) -> SymbolId {
        let existing = self.symbols.iter().find(|(_, s)| {
            s.name == name && s.ty == ret && s.class_name() == Some(class)
        });
        if let Some((&id, _)) = existing {
            return id;
        }
        self.add_symbol(Symbol {
            name: name.to_string(),
            ty: ret,
            kind: SymbolKind::Method {
                class: class.to_string(),
                resolved: true,
            },
            signature: None,
            recognized: None,
        })
    }

    /// Copy of a tree with every load of `sym` replaced by a copy of
    /// `replacement`.
    pub fn dup_substituting(&mut self, id: NodeId, sym: SymbolId, replacement: NodeId) -> NodeId {
        let node = self.node(id).clone();
        if node.op == Opcode::Load && node.symbol == Some(sym) {
            return self.dup_tree(replacement);
        }
        let children = node
            .children
            .iter()
            .map(|&c| self.dup_substituting(c, sym, replacement))
            .collect();
        self.add_node(Node { children, ..node })
    }
}
