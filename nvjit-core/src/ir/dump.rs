//! Human-readable listing of a method, used by the driver and in test
//! failure messages.
//!
//! ```text
//! block_3 (region 1, natural loop):
//!   n12 StoreIndirect <array-shadow Int32> : Int32
//!     n9 AddrAdd : Address
//!       ...
//! ```
//!
//! A node referenced a second time is printed as `==> nK`.

use std::collections::HashSet;
use std::fmt::{self, Write};

use super::{Literal, Method, NodeId, RegionKind};

impl Method {
    pub fn dump(&self) -> String {
        let mut out = String::new();
        // Writing into a String never fails.
        let _ = self.write_dump(&mut out);
        out
    }

    fn write_dump(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "method {} -> {}", self.name, self.return_type)?;
        let mut seen = HashSet::new();
        for &b in &self.layout {
            let region = self.region_of(b);
            let kind = region.map(|r| match self.region(r).kind {
                RegionKind::NaturalLoop => "natural loop",
                RegionKind::Acyclic => "acyclic",
            });
            match (region, kind) {
                (Some(r), Some(k)) => writeln!(out, "{} ({}, {}):", b, r, k)?,
                _ => writeln!(out, "{}:", b)?,
            }
            for &t in &self.block(b).trees {
                self.write_tree(out, t, 1, &mut seen)?;
            }
        }
        Ok(())
    }

    fn write_tree(
        &self,
        out: &mut String,
        id: NodeId,
        depth: usize,
        seen: &mut HashSet<NodeId>,
    ) -> fmt::Result {
        let indent = "  ".repeat(depth);
        if !seen.insert(id) {
            return writeln!(out, "{}==> {}", indent, id);
        }
        let node = self.node(id);
        write!(out, "{}{} {:?}", indent, id, node.op)?;
        if let Some(sym) = node.symbol {
            write!(out, " {}", self.symbol(sym).name)?;
        }
        match node.literal {
            Some(Literal::Int(v)) => write!(out, " {}", v)?,
            Some(Literal::Float(v)) => write!(out, " {}", v)?,
            None => {}
        }
        write!(out, " : {}", node.ty)?;
        if let Some(target) = node.target {
            write!(out, " -> {}", target)?;
        }
        for (value, dest) in &node.cases {
            write!(out, " [{} -> {}]", value, dest)?;
        }
        writeln!(out)?;
        for &c in &node.children {
            self.write_tree(out, c, depth + 1, seen)?;
        }
        Ok(())
    }
}
