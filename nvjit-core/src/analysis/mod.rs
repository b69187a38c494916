//! Loop eligibility analysis.
//!
//! A candidate loop goes through the stages below in order and stops at the
//! first one that rejects it:
//!
//! 1. shape: single induction variable, increment 1, preheader
//! 2. perfect nest
//! 3. data locality: one natural data width, supported vector ops, no
//!    temporaries escaping the loop unless they are reductions
//! 4. affine access: constant stride for every array access
//! 5. independence: no cross-iteration memory or scalar dependence
//! 6. reduction recognition (runs inside the data-locality walk)
//! 7. iteration pattern: `i < n` exit test, `i += 1`, contiguous accesses
//!
//! The GPU offload path uses [`offload`] instead of stages 2-7; parallel
//! forEach bodies are independent by construction.

pub mod affine;
pub mod dependence;
pub mod invariance;
pub mod offload;
pub mod reduction;
pub mod shape;

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::config::{GpuOptions, SimdTarget};
use crate::error::{reject, Check, Stage, Stop};
use crate::ir::usedef::{DefSite, UseDefInfo};
use crate::ir::{DataType, Method, NodeId, Opcode, RegionId, SymbolId};

use self::affine::{affine_stride, is_affine};
use self::invariance::LoopInfo;
use self::reduction::{Reduction, ReductionMatcher, ReductionOp};

/// Indirect memory access seen by the data-locality walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub node: NodeId,
    pub is_store: bool,
    pub element: DataType,
    /// Byte stride per iteration, `None` when not affine.
    pub stride: Option<i64>,
}

/// Per-loop state of the vectorization checks.
pub struct LoopAnalysis<'a> {
    pub method: &'a Method,
    pub options: &'a GpuOptions,
    pub simd: &'a SimdTarget,
    pub usedef: &'a UseDefInfo,
    pub info: LoopInfo,
    pub piv: SymbolId,
    /// Induction variables of the loop and its nested loops.
    pub piv_list: Vec<SymbolId>,
    /// Element type shared by every memory access of the loop.
    pub data_type: Option<DataType>,
    /// Direct stores that are neither induction updates nor reductions.
    pub defs_in_loop: HashSet<NodeId>,
    /// Loads reached by [`LoopAnalysis::defs_in_loop`].
    pub uses_of_defs_in_loop: HashSet<NodeId>,
    /// Value nodes evaluated inside the loop.
    pub uses_in_loop: HashSet<NodeId>,
    pub reductions: IndexMap<SymbolId, Reduction>,
    pub accesses: Vec<Access>,
    ref_counts: HashMap<NodeId, u32>,
    visited: HashSet<NodeId>,
}

impl<'a> LoopAnalysis<'a> {
    pub fn new(
        method: &'a Method,
        region: RegionId,
        options: &'a GpuOptions,
        simd: &'a SimdTarget,
        usedef: &'a UseDefInfo,
    ) -> Result<Self, Stop> {
        let Some(iv) = method.region(region).induction.as_ref() else {
            return reject(Stage::Shape, "loop has no primary induction variable");
        };
        Ok(LoopAnalysis {
            method,
            options,
            simd,
            usedef,
            info: LoopInfo::new(method, region),
            piv: iv.symbol,
            piv_list: Vec::new(),
            data_type: None,
            defs_in_loop: HashSet::new(),
            uses_of_defs_in_loop: HashSet::new(),
            uses_in_loop: HashSet::new(),
            reductions: IndexMap::new(),
            accesses: Vec::new(),
            ref_counts: method.reference_counts(),
            visited: HashSet::new(),
        })
    }

    pub fn region(&self) -> RegionId {
        self.info.region
    }

    /// Run every stage of the vectorization checks.
    pub fn check_simd_candidate(&mut self) -> Check {
        let mut pivs = Vec::new();
        shape::check_perfect_nest(self.method, self.region(), &mut pivs)?;
        self.piv_list = pivs;
        self.check_data_locality()?;
        self.check_affine_accesses()?;
        self.check_independence()?;
        shape::check_loop_iteration(self.method, self.region(), &self.accesses)
    }

    /// Reductions recognized by the data-locality walk.
    pub fn valid_reductions(&self) -> impl Iterator<Item = &Reduction> {
        self.reductions.values().filter(|r| r.is_valid())
    }

    // =========================================================================
    // Data locality
    // =========================================================================

    pub fn check_data_locality(&mut self) -> Check {
        self.set_loop_data_type()?;
        for tree in self.info.trees(self.method) {
            if !self.visit_tree(tree) {
                return Err(Stop::reject_at(
                    Stage::DataLocality,
                    tree,
                    "statement cannot be vectorized",
                ));
            }
        }
        let escaping = self
            .uses_of_defs_in_loop
            .iter()
            .find(|u| !self.uses_in_loop.contains(u));
        if let Some(&u) = escaping {
            return Err(Stop::reject_at(
                Stage::DataLocality,
                u,
                "temporary defined in the loop is used outside it",
            ));
        }
        Ok(())
    }

    /// The width of the first array access decides the data type.
    fn set_loop_data_type(&mut self) -> Check {
        let method = self.method;
        for tree in self.info.trees(method) {
            let mut found = None;
            method.walk_postorder(&[tree], &mut |_, node| {
                let on_shadow = node
                    .symbol
                    .is_some_and(|s| method.symbol(s).is_array_shadow());
                if found.is_none()
                    && on_shadow
                    && matches!(node.op, Opcode::LoadIndirect | Opcode::StoreIndirect)
                {
                    found = Some(node.ty);
                }
            });
            if found.is_some() {
                self.data_type = found;
                return Ok(());
            }
        }
        reject(Stage::DataLocality, "loop does not access any array")
    }

    fn data_size(&self) -> u32 {
        self.data_type.map(DataType::size).unwrap_or(0)
    }

    fn supports(&self, op: Opcode, ty: DataType) -> bool {
        ty.vector_of().is_some_and(|v| self.simd.supports(op, v))
    }

    fn reduction_supported(&self, ty: DataType) -> bool {
        if ty.is_floating_point() && !self.options.enable_fp_reduction {
            return false;
        }
        [Opcode::Splat, Opcode::Store, Opcode::Load, Opcode::GetElem]
            .iter()
            .all(|&op| self.supports(op, ty))
    }

    fn visit_tree(&mut self, tree: NodeId) -> bool {
        let method = self.method;
        let node = method.node(tree);
        match node.op {
            Opcode::StoreIndirect => {
                let (Some(addr), Some(value)) = (node.child(0), node.child(1)) else {
                    return false;
                };
                if node.ty.size() != self.data_size() || !self.supports(node.op, node.ty) {
                    return false;
                }
                if self.info.is_invariant(method, addr) {
                    return false;
                }
                self.record_access(tree, addr, true);
                self.visit_node(value, None)
            }
            Opcode::Store => {
                let (Some(sym), Some(value)) = (node.symbol, node.child(0)) else {
                    return false;
                };
                if self.piv_list.contains(&sym) && node.ty == DataType::Int32 {
                    return is_affine(method, &self.info, sym, value);
                }
                self.record_reduction_store(tree, sym, value);
                if self.info.is_invariant(method, value) {
                    return true;
                }
                if node.ty.size() != self.data_size() || !self.supports(node.op, node.ty) {
                    return false;
                }
                self.visit_node(value, Some(sym))
            }
            Opcode::If(..) | Opcode::Goto => true,
            Opcode::TreeTop => node.child(0).is_some_and(|c| self.visit_node(c, None)),
            _ => false,
        }
    }

    fn record_reduction_store(&mut self, store: NodeId, sym: SymbolId, value: NodeId) {
        let ty = self.method.node(store).ty;
        let supported = self.reduction_supported(ty);
        let mut reduction = self
            .reductions
            .shift_remove(&sym)
            .unwrap_or_else(|| Reduction::new(sym));
        if !supported {
            reduction.op = ReductionOp::Invalid;
        }
        if reduction.op != ReductionOp::Invalid {
            let matcher = ReductionMatcher {
                method: self.method,
                info: &self.info,
                ref_counts: &self.ref_counts,
            };
            let path = reduction.op;
            if matcher.is_reduction(value, &mut reduction, path) {
                reduction.stores.push(store);
            } else {
                reduction.op = ReductionOp::Invalid;
                self.add_def_in_loop(store);
                for prev in std::mem::take(&mut reduction.stores) {
                    self.add_def_in_loop(prev);
                }
            }
        } else {
            self.add_def_in_loop(store);
        }
        self.reductions.insert(sym, reduction);
    }

    fn add_def_in_loop(&mut self, store: NodeId) {
        self.defs_in_loop.insert(store);
        self.uses_of_defs_in_loop
            .extend(self.usedef.uses_of(DefSite::Store(store)).iter().copied());
    }

    fn record_access(&mut self, node: NodeId, addr: NodeId, is_store: bool) {
        let stride = affine_stride(self.method, &self.info, self.piv, addr);
        self.accesses.push(Access {
            node,
            is_store,
            element: self.method.node(node).ty,
            stride,
        });
    }

    fn visit_node(&mut self, id: NodeId, store_sym: Option<SymbolId>) -> bool {
        if !self.visited.insert(id) {
            return true;
        }
        let method = self.method;
        let node = method.node(id);
        if node.ty.size() != self.data_size() {
            return false;
        }
        if self.info.is_invariant(method, id) {
            return true;
        }
        self.uses_in_loop.insert(id);
        if !self.supports(node.op, node.ty) {
            return false;
        }
        match node.op {
            Opcode::Load if node.symbol == Some(self.piv) => {
                [Opcode::Store, Opcode::GetElem, Opcode::Add, Opcode::Splat]
                    .iter()
                    .all(|&op| self.supports(op, node.ty))
            }
            Opcode::LoadIndirect => {
                let Some(addr) = node.child(0) else {
                    return false;
                };
                self.record_access(id, addr, false);
                true
            }
            Opcode::Load => {
                let Some(sym) = node.symbol else {
                    return false;
                };
                match self.reductions.get_mut(&sym) {
                    Some(r) if r.op != ReductionOp::Invalid && Some(sym) != store_sym => {
                        r.op = ReductionOp::Invalid;
                        let stores = std::mem::take(&mut r.stores);
                        for s in stores {
                            self.add_def_in_loop(s);
                        }
                    }
                    Some(_) => {}
                    None => {
                        let mut r = Reduction::new(sym);
                        r.op = ReductionOp::Invalid;
                        self.reductions.insert(sym, r);
                    }
                }
                true
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Rem
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::UShr
            | Opcode::And
            | Opcode::Xor
            | Opcode::Or
            | Opcode::Neg => node
                .children
                .clone()
                .into_iter()
                .all(|c| self.visit_node(c, store_sym)),
            _ => false,
        }
    }

    // =========================================================================
    // Affine accesses
    // =========================================================================

    pub fn check_affine_accesses(&self) -> Check {
        match self.accesses.iter().find(|a| a.stride.is_none()) {
            Some(a) => Err(Stop::reject_at(
                Stage::Affine,
                a.node,
                "array index is not affine in the induction variable",
            )),
            None => Ok(()),
        }
    }
}
