//! Analysis of parallel forEach loops for GPU offload.
//!
//! Runs after the loop has been recognized as a forEach body and before any
//! kernel text is produced:
//! - locate the tryGPU guard that selects the lambda's CPU path
//! - map every symbol the body touches onto kernel parameters and locals
//! - classify array accesses as reads or writes with tight address ranges
//! - for natural-loop scopes, scan the CPU side of the envelope for races
//!   with hoisted transfers

use std::collections::HashSet;

use log::debug;

use crate::config::GpuOptions;
use crate::error::{reject, Check, Stage, Stop};
use crate::ir::dominators::PostDominators;
use crate::ir::usedef::{DefSite, UseDefInfo};
use crate::ir::{
    array_element_size, BlockId, Cond, DataType, Method, NodeId, Opcode, Recognized, RegionId,
    SymbolId, SymbolKind,
};
use crate::symbol_map::{AddrRange, SymbolMap, ACCESS_READ, ACCESS_WRITE};

use super::affine::affine_stride;
use super::invariance::{same_value, LoopInfo};

// =============================================================================
// tryGPU guard
// =============================================================================

/// The branch on the static tryGPU flag in front of a forEach loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryGpuGuard {
    pub block: BlockId,
    pub branch: NodeId,
    /// Entry of the lambda's CPU implementation.
    pub cpu_block: BlockId,
}

/// Walk up single-predecessor blocks from the preheader looking for the
/// tryGPU test. `reversed` holds branches already flipped by an earlier
/// transformation.
pub fn find_try_gpu_guard(
    method: &Method,
    preheader: BlockId,
    reversed: &HashSet<NodeId>,
) -> Result<TryGpuGuard, Stop> {
    let mut block = preheader;
    loop {
        if let Some(branch) = method.terminator(block).filter(|&t| is_try_gpu_test(method, t)) {
            let node = method.node(branch);
            let is_eq = matches!(node.op, Opcode::If(Cond::Eq, _));
            let cpu_block = if is_eq ^ reversed.contains(&branch) {
                node.target
            } else {
                method.layout_next(block)
            };
            return match cpu_block {
                Some(cpu_block) => Ok(TryGpuGuard {
                    block,
                    branch,
                    cpu_block,
                }),
                None => reject(Stage::TryGpuGuard, "tryGPU guard has no CPU path"),
            };
        }
        if Some(block) == method.entry_block() {
            break;
        }
        match method.preds_of(block).as_slice() {
            [single] => block = *single,
            _ => break,
        }
    }
    reject(Stage::TryGpuGuard, "no tryGPU guard in front of the loop")
}

/// `If Eq|Ne (Load tryGPU) (Const 0)`.
fn is_try_gpu_test(method: &Method, id: NodeId) -> bool {
    let node = method.node(id);
    if !matches!(node.op, Opcode::If(Cond::Eq | Cond::Ne, _)) {
        return false;
    }
    let (Some(a), Some(b)) = (node.child(0), node.child(1)) else {
        return false;
    };
    let flag = method.node(a);
    flag.op == Opcode::Load
        && flag
            .symbol
            .is_some_and(|s| method.symbol(s).recognized == Some(Recognized::TryGpu))
        && method.node(b).int_value() == Some(0)
}

// =============================================================================
// CPU blocks of a natural-loop scope
// =============================================================================

/// Check the blocks of `envelope` outside its kernels.
///
/// Array accesses and calls inside the forEach pipeline flag their block
/// for a flush of device buffers; elsewhere only calls into `java/lang/` and
/// `java/util/` are tolerated. Cold loops are skipped and their preheaders
/// flagged. Returns the blocks to flush.
pub fn scan_cpu_blocks(method: &Method, envelope: RegionId, kernels: &[RegionId]) -> Result<Vec<BlockId>, Stop> {
    let kernel_blocks: HashSet<BlockId> = kernels
        .iter()
        .flat_map(|&k| method.region_blocks(k))
        .collect();
    let cold_loops: Vec<RegionId> = method
        .descendants(envelope)
        .into_iter()
        .filter(|&r| {
            let region = method.region(r);
            region.is_natural_loop()
                && method.block(region.entry).cold
                && !kernel_blocks.contains(&region.entry)
        })
        .collect();
    let cold_blocks: HashSet<BlockId> = cold_loops
        .iter()
        .flat_map(|&r| method.region_blocks(r))
        .collect();

    let mut flush = Vec::new();
    let mut seen = HashSet::new();
    for b in method.region_blocks(envelope) {
        if kernel_blocks.contains(&b) || cold_blocks.contains(&b) {
            continue;
        }
        for &t in &method.block(b).trees {
            visit_cpu_node(method, b, t, &mut seen, &mut flush)?;
        }
    }
    for &r in &cold_loops {
        let at = method.loop_preheader(r).unwrap_or(method.region(r).entry);
        if !flush.contains(&at) {
            flush.push(at);
        }
    }
    Ok(flush)
}

fn visit_cpu_node(
    method: &Method,
    block: BlockId,
    id: NodeId,
    seen: &mut HashSet<NodeId>,
    flush: &mut Vec<BlockId>,
) -> Check {
    if !seen.insert(id) {
        return Ok(());
    }
    let node = method.node(id);
    let on_shadow = node
        .symbol
        .is_some_and(|s| method.symbol(s).is_array_shadow());
    let array_op = (on_shadow && matches!(node.op, Opcode::LoadIndirect | Opcode::StoreIndirect))
        || matches!(node.op, Opcode::ArrayCopy { .. });
    if array_op || node.op == Opcode::Call {
        if method.block(block).pipeline {
            if !flush.contains(&block) {
                flush.push(block);
            }
        } else if node.op == Opcode::Call {
            let Some(callee) = node.symbol.map(|s| method.symbol(s)) else {
                return Err(Stop::reject_at(Stage::CpuBlockScan, id, "call without a target"));
            };
            if !callee.is_resolved_method() {
                return Err(Stop::reject_at(
                    Stage::CpuBlockScan,
                    id,
                    format!("unresolved call to {} in the GPU scope", callee.name),
                ));
            }
            let class = callee.class_name().unwrap_or("");
            if !class.starts_with("java/lang/") && !class.starts_with("java/util/") {
                return Err(Stop::reject_at(
                    Stage::CpuBlockScan,
                    id,
                    format!("call to {}.{} may race with hoisted transfers", class, callee.name),
                ));
            }
        } else {
            return Err(Stop::reject_at(
                Stage::CpuBlockScan,
                id,
                "array access outside the kernels may race with hoisted transfers",
            ));
        }
    }
    for &c in &node.children {
        visit_cpu_node(method, block, c, seen, flush)?;
    }
    Ok(())
}

// =============================================================================
// Symbol mapping and array accesses
// =============================================================================

/// Offload analysis of one forEach loop.
pub struct OffloadAnalysis<'a> {
    pub method: &'a Method,
    pub options: &'a GpuOptions,
    pub usedef: &'a UseDefInfo,
    pub postdom: &'a PostDominators,
    pub info: LoopInfo,
    pub piv: SymbolId,
    pub preheader: BlockId,
    visited: HashSet<NodeId>,
}

impl<'a> OffloadAnalysis<'a> {
    pub fn new(
        method: &'a Method,
        region: RegionId,
        preheader: BlockId,
        options: &'a GpuOptions,
        usedef: &'a UseDefInfo,
        postdom: &'a PostDominators,
    ) -> Result<Self, Stop> {
        let Some(iv) = method.region(region).induction.as_ref() else {
            return reject(Stage::Shape, "loop has no primary induction variable");
        };
        Ok(OffloadAnalysis {
            method,
            options,
            usedef,
            postdom,
            info: LoopInfo::new(method, region),
            piv: iv.symbol,
            preheader,
            visited: HashSet::new(),
        })
    }

    /// The exit test of the loop, excluded from the kernel body mapping.
    pub fn loop_test(&self) -> Option<NodeId> {
        let iv = self.method.region(self.info.region).induction.as_ref()?;
        self.method.terminator(iv.branch_block)
    }

    /// Fill `map` with the parameters and locals of the kernel.
    pub fn map_symbols(&mut self, map: &mut SymbolMap) -> Check {
        map.clear();
        map.map_auto(self.piv);
        self.visited.clear();
        let test = self.loop_test();
        for tree in self.info.trees(self.method) {
            if Some(tree) == test {
                continue;
            }
            self.map_node(tree, map, false)?;
        }
        Ok(())
    }

    fn map_node(&mut self, id: NodeId, map: &mut SymbolMap, parent_is_null_check: bool) -> Check {
        if !self.visited.insert(id) {
            return Ok(());
        }
        let method = self.method;
        let node = method.node(id);
        match node.op {
            Opcode::TreeTop => {
                return match node.child(0) {
                    Some(c) => self.map_node(c, map, false),
                    None => Ok(()),
                };
            }
            Opcode::NullCheck => {
                return match node.child(0) {
                    Some(c) => self.map_node(c, map, true),
                    None => Ok(()),
                };
            }
            _ => {}
        }

        if let Some(sym) = node.symbol {
            let symbol = method.symbol(sym);
            match (&symbol.kind, node.op) {
                (SymbolKind::Method { resolved: false, .. }, _) => {
                    return Err(Stop::reject_at(
                        Stage::SymbolMapping,
                        id,
                        format!("unresolved call to {}", symbol.name),
                    ));
                }
                (SymbolKind::Method { .. }, _) => {}
                (SymbolKind::Auto | SymbolKind::Parm { .. }, Opcode::Load | Opcode::Store) => {
                    if sym != self.piv {
                        if self.info.is_invariant(method, id) {
                            let size = if symbol.ty == DataType::Address {
                                match self.find_array_element_size(sym, Some(id)) {
                                    Some(size) => size as i32,
                                    None => {
                                        return Err(Stop::reject_at(
                                            Stage::SymbolMapping,
                                            id,
                                            format!("element size of {} is unknown", symbol.name),
                                        ))
                                    }
                                }
                            } else {
                                -1
                            };
                            map.assign_parameter_slot(sym, size, None);
                            return Ok(());
                        }
                        map.map_auto(sym);
                    }
                }
                (SymbolKind::ArrayShadow | SymbolKind::Field { .. }, Opcode::LoadIndirect | Opcode::StoreIndirect) => {
                    if symbol.shared_memory_len().is_none() {
                        if self.info.is_invariant(method, id) {
                            if let Some(existing) = map.get(sym).and_then(|e| e.node) {
                                if !same_value(method, existing, id) {
                                    return Err(Stop::reject_at(
                                        Stage::SymbolMapping,
                                        id,
                                        format!("several invariant loads through {}", symbol.name),
                                    ));
                                }
                            }
                            let size = if node.ty == DataType::Address {
                                match symbol.signature.as_deref().and_then(array_element_size) {
                                    Some(size) => size as i32,
                                    None => {
                                        return Err(Stop::reject_at(
                                            Stage::SymbolMapping,
                                            id,
                                            format!("element size of {} is unknown", symbol.name),
                                        ))
                                    }
                                }
                            } else {
                                -1
                            };
                            if !parent_is_null_check {
                                map.assign_parameter_slot(sym, size, Some(id));
                                return Ok(());
                            }
                        } else if node.ty == DataType::Address {
                            return Err(Stop::reject_at(
                                Stage::SymbolMapping,
                                id,
                                format!("loop-variant reference loaded through {}", symbol.name),
                            ));
                        }
                    }
                }
                _ => {
                    return Err(Stop::reject_at(
                        Stage::SymbolMapping,
                        id,
                        format!("unsupported symbol reference {}", symbol.name),
                    ));
                }
            }
        }

        for &c in &node.children {
            self.map_node(c, map, false)?;
        }
        Ok(())
    }

    /// Element size of the array held by an address-typed local, from its
    /// signature or from the definitions reaching `use_node`.
    pub fn find_array_element_size(&self, sym: SymbolId, use_node: Option<NodeId>) -> Option<u32> {
        let method = self.method;
        if let Some(size) = method.symbol(sym).signature.as_deref().and_then(array_element_size) {
            return Some(size);
        }
        let defs = self.usedef.defs_of(use_node?);
        let mut size = None;
        for def in defs {
            let DefSite::Store(store) = def else {
                return None;
            };
            let value = method.node(*store).child(0)?;
            if !method.node(value).op.is_load() {
                return None;
            }
            let s = method
                .node_symbol(value)?
                .signature
                .as_deref()
                .and_then(array_element_size)?;
            if size.is_some_and(|prev| prev != s) {
                return None;
            }
            size = Some(s);
        }
        size
    }

    /// Record reads and writes of every array parameter. Returns whether
    /// some array base could not be traced to a parameter.
    pub fn detect_array_accesses(&mut self, map: &mut SymbolMap) -> Result<bool, Stop> {
        self.visited.clear();
        let method = self.method;
        let mut not_found = false;
        for b in self.info.blocks.clone() {
            for &t in &method.block(b).trees {
                self.detect_node(t, b, map, &mut not_found)?;
            }
        }
        if self.options.disable_data_transfer_elimination || not_found {
            for entry in map.iter_mut().filter(|e| e.is_parameter()) {
                entry.access |= ACCESS_READ | ACCESS_WRITE;
            }
        }
        Ok(not_found)
    }

    fn detect_node(&mut self, id: NodeId, block: BlockId, map: &mut SymbolMap, not_found: &mut bool) -> Check {
        if !self.visited.insert(id) {
            return Ok(());
        }
        let method = self.method;
        let node = method.node(id);
        let on_shadow = node
            .symbol
            .is_some_and(|s| method.symbol(s).is_array_shadow());

        let mut addrs: Vec<(NodeId, bool)> = Vec::new();
        match node.op {
            Opcode::LoadIndirect if on_shadow => addrs.extend(node.child(0).map(|a| (a, false))),
            Opcode::StoreIndirect if on_shadow => addrs.extend(node.child(0).map(|a| (a, true))),
            Opcode::ArrayLength => addrs.extend(node.child(0).map(|a| (a, false))),
            Opcode::ArrayCopy { .. } => {
                let first = if node.children.len() == 5 { 2 } else { 0 };
                addrs.extend(node.child(first).map(|a| (a, false)));
                addrs.extend(node.child(first + 1).map(|a| (a, true)));
            }
            _ => {}
        }

        for (addr, is_write) in addrs {
            match resolve_array_base(method, self.usedef, map, addr) {
                Some(sym) => self.record_access(id, block, addr, sym, is_write, map)?,
                None => {
                    *not_found = true;
                    if is_write && !self.options.safe_mt {
                        return Err(Stop::reject_at(Stage::ArrayAccess, id, "ambiguous store"));
                    }
                }
            }
        }

        for &c in &node.children {
            self.detect_node(c, block, map, not_found)?;
        }
        Ok(())
    }

    fn record_access(
        &self,
        id: NodeId,
        block: BlockId,
        addr: NodeId,
        sym: SymbolId,
        is_write: bool,
        map: &mut SymbolMap,
    ) -> Check {
        let options = self.options;
        let stride = affine_stride(self.method, &self.info, self.piv, addr);
        let post_dominates = self.postdom.post_dominates(block, self.preheader);
        let Some(entry) = map.get_mut(sym) else {
            return Ok(());
        };
        if !is_write {
            entry.access |= ACCESS_READ;
            if !options.disable_data_transfer_elimination {
                entry.rhs = match entry.rhs {
                    AddrRange::NotYetSeen => match stride {
                        Some(s) if s > 0 => AddrRange::Expr(addr),
                        _ => AddrRange::Invalid,
                    },
                    _ => AddrRange::Invalid,
                };
            }
            return Ok(());
        }

        entry.access |= ACCESS_WRITE;
        if options.disable_data_transfer_elimination && options.safe_mt {
            return Ok(());
        }
        if entry.lhs == AddrRange::NotYetSeen && post_dominates {
            if stride == Some(entry.element_size as i64) {
                entry.lhs = AddrRange::Expr(addr);
                return Ok(());
            }
            entry.lhs = AddrRange::Invalid;
            if !options.safe_mt {
                return Err(Stop::reject_at(Stage::ArrayAccess, id, "non-contiguous store"));
            }
        } else {
            entry.lhs = AddrRange::Invalid;
            if !options.safe_mt {
                return Err(Stop::reject_at(
                    Stage::ArrayAccess,
                    id,
                    "multiple or conditional stores",
                ));
            }
        }
        debug!("store through {} accepted in safe-MT mode", sym);
        Ok(())
    }
}

/// Symbol map entry holding the array an address expression points into.
///
/// The base of an `AddrAdd` must be a load of a parameter, or a load of a
/// local whose only reaching definition copies a parameter.
pub fn resolve_array_base(method: &Method, usedef: &UseDefInfo, map: &SymbolMap, addr: NodeId) -> Option<SymbolId> {
    let a = method.node(addr);
    let base = if a.op == Opcode::AddrAdd { a.child(0)? } else { addr };
    let node = method.node(base);
    if !node.op.is_load() {
        return None;
    }
    let sym = node.symbol?;
    if map.get(sym).is_some_and(|e| e.is_parameter()) {
        return Some(sym);
    }
    if node.op != Opcode::Load {
        return None;
    }
    match usedef.defs_of(base) {
        [DefSite::Store(store)] => {
            let value = method.node(*store).child(0)?;
            let v = method.node(value);
            let source = v.symbol?;
            (v.op.is_load() && map.get(source).is_some_and(|e| e.is_parameter())).then_some(source)
        }
        _ => None,
    }
}
