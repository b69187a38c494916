//! Host-side rewrite around an offloaded loop.
//!
//! The GPU path is spliced in on the edge from the loop preheader `P` to the
//! loop entry `E`; the original loop stays in place as the CPU path.
//!
//! ```text
//! P
//! setup:     host temps of field parameters
//! enter:     scope = regionEntryGPU(kind, &startPC)              single kernel
//! estimate:  lambdaCost, dataCost += len * size per non-null array
//! decide:    estimateGPU(..) != 0 -> cpu                        unless forced
//! copyTo:    dev_k = copyToGPU(scope, host_k, size, start, end, noCopy)
//! parms:     parms = allocateGPUKernelParms(verbose, n); parms[k] = ..
//! launch:    launchGPU(scope, i, bound, n, parms, ptx, &startPC, exc)
//! copyFrom:  copyFromGPU / invalidateGPU
//! exit:      keep-alive; regionExitGPU(scope)                   single kernel
//! check:     getStateGPU(scope, &startPC) != 0 -> E
//! done:      goto X
//! cpu:       regionExitGPU(scope); goto E                       single kernel
//! E .. X     original loop
//! ```
//!
//! A natural-loop scope enters and exits the GPU region once, around the
//! envelope, and flushes device buffers in front of CPU blocks that touch
//! arrays.

use std::collections::HashSet;

use log::{debug, trace};

use crate::analysis::invariance::{same_value, LoopInfo};
use crate::bail_fatal;
use crate::config::GpuOptions;
use crate::emit::KernelText;
use crate::error::Result;
use crate::ir::{
    BlockId, Cond, DataType, Literal, Method, Node, NodeId, Opcode, RegionId, Symbol, SymbolId,
    SymbolKind,
};
use crate::supervisor::{GpuScope, ScopeKind};
use crate::symbol_map::{SymbolMap, SymbolMapEntry};

/// Class of the runtime helpers called from host code.
pub const GPU_RUNTIME: &str = "gpu/Runtime";

/// Where an offloaded loop sits in the host CFG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchSite {
    pub region: RegionId,
    pub preheader: BlockId,
    pub entry: BlockId,
    /// The single block the loop exits to.
    pub exit: BlockId,
}

impl LaunchSite {
    /// `None` unless the loop has a preheader and exactly one exit destination.
    pub fn find(method: &Method, region: RegionId) -> Option<LaunchSite> {
        let preheader = method.loop_preheader(region)?;
        let mut exits = method.exit_edges(region).into_iter().map(|(_, to)| to);
        let exit = exits.next()?;
        if exits.any(|to| to != exit) {
            return None;
        }
        Some(LaunchSite {
            region,
            preheader,
            entry: method.region(region).entry,
            exit,
        })
    }
}

/// Flip the tryGPU branch once so that the forEach path carrying the kernel
/// launch becomes the default.
pub fn reverse_try_gpu_guard(method: &mut Method, branch: NodeId, reversed: &mut HashSet<NodeId>) {
    if !reversed.insert(branch) {
        return;
    }
    let node = method.node_mut(branch);
    if let Opcode::If(cond, mode) = node.op {
        node.op = Opcode::If(cond.reversed(), mode);
        trace!("reversed tryGPU guard {}", branch);
    }
}

/// Set the hoist flag on address parameters whose host value does not change
/// inside the envelope of a natural-loop scope.
pub fn mark_hoisted(method: &Method, options: &GpuOptions, scope: &GpuScope, map: &mut SymbolMap) {
    if scope.kind != ScopeKind::NaturalLoop || options.disable_transfer_hoist {
        return;
    }
    let info = LoopInfo::new(method, scope.envelope);
    for entry in map.iter_mut().filter(|e| e.is_parameter()) {
        if value_type(method, entry) != DataType::Address {
            continue;
        }
        entry.hoist = match entry.node {
            Some(n) => info.is_invariant(method, n),
            None => !info.stored.contains(&entry.host_symbol),
        };
    }
}

// =============================================================================
// Envelope of a natural-loop scope
// =============================================================================

/// Region entry in front of the envelope, region exit on each of its exit
/// edges and flushes in front of CPU blocks. Done once per scope.
pub fn transform_envelope(method: &mut Method, scope: &mut GpuScope) -> Result<()> {
    if scope.transformed {
        return Ok(());
    }
    let envelope = scope.envelope;
    let Some(preheader) = method.loop_preheader(envelope) else {
        bail_fatal!(None, "envelope of {} has no preheader", envelope);
    };
    let entry = method.region(envelope).entry;
    let start_pc = start_pc_symbol(method, entry);
    let scope_sym = *scope
        .scope_sym
        .get_or_insert_with(|| method.temp("gpuScope", DataType::Int64));

    let enter = method.split_edge(preheader, entry);
    let call = region_entry_call(method, ScopeKind::NaturalLoop, start_pc);
    let store = method.new_store(scope_sym, call);
    method.block_mut(enter).trees.push(store);

    let outer = method.region(envelope).parent.unwrap_or(method.root);
    for (from, to) in method.exit_edges(envelope) {
        let exit = method.split_edge(from, to);
        move_block_out_of(method, envelope, exit, outer);
        let tree = region_exit_tree(method, scope_sym);
        let at = method.block(exit).trees.len().saturating_sub(usize::from(ends_with_goto(method, exit)));
        method.block_mut(exit).trees.insert(at, tree);
        scope.exit_points.push((exit, tree));
    }

    for block in scope.flush_blocks.clone() {
        let flush = method.helper_symbol(GPU_RUNTIME, "flushGPU", DataType::NoType);
        let load = method.new_load(scope_sym);
        let call = method.new_call(flush, vec![load]);
        let tree = method.new_treetop(call);
        method.block_mut(block).trees.insert(0, tree);
    }

    scope.transformed = true;
    debug!(
        "entered GPU scope around {} with {} exits and {} flushes",
        envelope,
        scope.exit_points.len(),
        scope.flush_blocks.len()
    );
    Ok(())
}

/// A block created by splitting an exit edge belongs to the enclosing region.
fn move_block_out_of(method: &mut Method, envelope: RegionId, block: BlockId, outer: RegionId) {
    for r in std::iter::once(envelope).chain(method.descendants(envelope)) {
        method.region_mut(r).blocks.retain(|&b| b != block);
    }
    method.add_block_to_region(outer, block);
}

fn ends_with_goto(method: &Method, block: BlockId) -> bool {
    method
        .last_tree(block)
        .is_some_and(|t| method.node(t).op == Opcode::Goto)
}

// =============================================================================
// Kernel launch
// =============================================================================

/// Splice the GPU path of one kernel in front of its loop.
///
/// `map` must hold the parameters the kernel was emitted with; it receives
/// the host and device temps created here.
pub fn transform_kernel(
    method: &mut Method,
    options: &GpuOptions,
    scope: &mut GpuScope,
    map: &mut SymbolMap,
    site: &LaunchSite,
    kernel: &KernelText,
) -> Result<()> {
    let Some(iv) = method.region(site.region).induction.clone() else {
        bail_fatal!(None, "offloaded {} has no induction variable", site.region);
    };
    let Some(bound) = iv.exit_bound else {
        bail_fatal!(None, "offloaded {} has no exit bound", site.region);
    };
    let piv = iv.symbol;
    let single = scope.kind == ScopeKind::SingleKernel;
    let owner = method.region_of(site.preheader);
    let start_pc = start_pc_symbol(method, site.entry);
    let scope_sym = *scope
        .scope_sym
        .get_or_insert_with(|| method.temp("gpuScope", DataType::Int64));
    let nested = nested_trip_counts(method, site.region);

    let mut params: Vec<SymbolMapEntry> = map.parameters().into_iter().cloned().collect();
    let jumps_to_loop = method
        .terminator(site.preheader)
        .and_then(|t| method.node(t).target)
        == Some(site.entry);
    let mut splice = Splice::new(method, owner, site.preheader);
    splice.next_block();
    if jumps_to_loop {
        let first = splice.cursor;
        splice.method.retarget(site.preheader, site.entry, first);
    }

    // setup
    for entry in params.iter_mut() {
        let ty = value_type(splice.method, entry);
        let host = match entry.node {
            Some(n) => {
                let name = format!("{}.host", splice.method.symbol(entry.host_symbol).name);
                let temp = splice.method.temp(name, ty);
                let value = splice.method.dup_tree(n);
                let store = splice.method.new_store(temp, value);
                splice.push(store);
                temp
            }
            None => entry.host_symbol,
        };
        entry.host_temp = Some(host);
        if ty == DataType::Address {
            let name = format!("{}.dev", splice.method.symbol(entry.host_symbol).name);
            entry.dev_temp = Some(splice.method.temp(name, DataType::Address));
        }
    }

    // enter
    let cpu_exit = single.then(|| splice.method.add_block());
    if single {
        splice.next_block();
        let call = region_entry_call(splice.method, ScopeKind::SingleKernel, start_pc);
        let store = splice.method.new_store(scope_sym, call);
        splice.push(store);
    }
    let cpu_target = cpu_exit.unwrap_or(site.entry);

    // estimate and decide
    if !options.force {
        splice.next_block();
        let lambda = splice.method.temp("lambdaCost", DataType::Int64);
        let data = splice.method.temp("dataCost", DataType::Int64);
        let mut cost = splice.trip_count(bound, Some(piv), None);
        for (nested_bound, nested_entry) in nested {
            let trip = splice.trip_count(nested_bound, None, Some(nested_entry));
            cost = splice.method.new_op(Opcode::Add, DataType::Int64, vec![cost, trip]);
        }
        let store = splice.method.new_store(lambda, cost);
        splice.push(store);
        let zero = splice.method.new_int(DataType::Int64, 0);
        let store = splice.method.new_store(data, zero);
        splice.push(store);

        let arrays: Vec<(SymbolId, i32)> = params
            .iter()
            .filter(|e| e.is_array())
            .filter_map(|e| e.host_temp.map(|h| (h, e.element_size)))
            .collect();
        let decide = splice.method.add_block();
        let guards: Vec<BlockId> = arrays.iter().map(|_| splice.method.add_block()).collect();
        for (k, &(host, size)) in arrays.iter().enumerate() {
            let skip = guards.get(k + 1).copied().unwrap_or(decide);
            splice.place(guards[k]);
            let load = splice.method.new_load(host);
            let null = splice.method.new_const(DataType::Address, Literal::Int(0));
            let test = splice.method.new_if(Cond::Eq, load, null, skip);
            splice.push(test);

            splice.next_block();
            let load = splice.method.new_load(host);
            let len = splice.method.new_op(Opcode::ArrayLength, DataType::Int32, vec![load]);
            let len = splice.method.widen_to_long(len);
            let size = splice.method.new_int(DataType::Int64, i64::from(size));
            let bytes = splice.method.new_op(Opcode::Mul, DataType::Int64, vec![len, size]);
            let acc = splice.method.new_load(data);
            let sum = splice.method.new_op(Opcode::Add, DataType::Int64, vec![acc, bytes]);
            let store = splice.method.new_store(data, sum);
            splice.push(store);
        }
        splice.place(decide);

        let estimate = splice.method.helper_symbol(GPU_RUNTIME, "estimateGPU", DataType::Int32);
        let args = vec![
            splice.method.new_load(scope_sym),
            splice.method.new_int(DataType::Int32, i64::from(kernel.kernel_id)),
            splice.method.new_load_addr(start_pc),
            splice.method.new_load(lambda),
            splice.method.new_load(data),
            splice.method.new_load(piv),
            splice.method.dup_tree(bound),
        ];
        let call = splice.method.new_call(estimate, args);
        let zero = splice.method.new_int(DataType::Int32, 0);
        let test = splice.method.new_if(Cond::Ne, call, zero, cpu_target);
        splice.push(test);
    }

    // copyTo
    splice.next_block();
    let copy_to = splice.method.helper_symbol(GPU_RUNTIME, "copyToGPU", DataType::Address);
    for entry in params.iter().filter(|e| e.dev_temp.is_some()) {
        let (Some(host), Some(dev)) = (entry.host_temp, entry.dev_temp) else {
            continue;
        };
        let range = transfer_range_to(splice.method, options, entry);
        let (start, end) = splice.range(range, entry.element_size, piv, bound);
        let args = vec![
            splice.method.new_load(scope_sym),
            splice.method.new_load(host),
            splice.method.new_int(DataType::Int32, i64::from(entry.element_size.max(0))),
            start,
            end,
            splice.method.new_int(DataType::Int32, i64::from(!entry.reads())),
        ];
        let call = splice.method.new_call(copy_to, args);
        let store = splice.method.new_store(dev, call);
        splice.push(store);
    }

    // parms
    splice.next_block();
    let slots = params.len() as i64;
    let parms = splice.method.temp("gpuParms", DataType::Address);
    let parm_buffer = parameter_buffer_symbol(splice.method);
    let alloc = splice.method.helper_symbol(GPU_RUNTIME, "allocateGPUKernelParms", DataType::Address);
    let args = vec![
        splice.method.new_int(DataType::Int32, i64::from(options.verbose)),
        splice.method.new_int(DataType::Int32, slots),
    ];
    let call = splice.method.new_call(alloc, args);
    let store = splice.method.new_store(parms, call);
    splice.push(store);
    for entry in &params {
        let value = match (entry.dev_temp, entry.host_temp) {
            (Some(dev), _) => splice.method.new_load(dev),
            (None, Some(host)) => splice.method.new_load(host),
            (None, None) => bail_fatal!(entry.node, "parameter {} has no host value", entry.host_symbol),
        };
        let ty = splice.method.node(value).ty;
        let base = splice.method.new_load(parms);
        let offset = splice.method.new_int(DataType::Int64, 8 * i64::from(entry.slot));
        let addr = splice.method.new_op(Opcode::AddrAdd, DataType::Address, vec![base, offset]);
        let store = splice.method.add_node(Node {
            symbol: Some(parm_buffer),
            ..Node::new(Opcode::StoreIndirect, ty, vec![addr, value])
        });
        splice.push(store);
    }

    // launch
    splice.next_block();
    let launch = splice.method.helper_symbol(GPU_RUNTIME, "launchGPU", DataType::Int32);
    let args = vec![
        splice.method.new_load(scope_sym),
        splice.method.new_load(piv),
        splice.method.dup_tree(bound),
        splice.method.new_int(DataType::Int32, slots),
        splice.method.new_load(parms),
        splice.method.new_int(DataType::Int32, i64::from(kernel.kernel_id)),
        splice.method.new_load_addr(start_pc),
        splice.method.new_int(DataType::Int32, i64::from(kernel.has_exception_checks)),
    ];
    let call = splice.method.new_call(launch, args);
    let tree = splice.method.new_treetop(call);
    splice.push(tree);

    // copyFrom / invalidate
    splice.next_block();
    for entry in params.iter().filter(|e| !e.hoist) {
        let (Some(host), Some(dev)) = (entry.host_temp, entry.dev_temp) else {
            continue;
        };
        let call = if entry.writes() {
            let helper = splice.method.helper_symbol(GPU_RUNTIME, "copyFromGPU", DataType::NoType);
            let range = (!options.disable_data_transfer_elimination)
                .then(|| entry.lhs.expr())
                .flatten();
            let (start, end) = splice.range(range, entry.element_size, piv, bound);
            let args = vec![
                splice.method.new_load(scope_sym),
                splice.method.new_load(host),
                splice.method.new_load(dev),
                splice.method.new_int(DataType::Int32, i64::from(entry.element_size.max(0))),
                start,
                end,
            ];
            splice.method.new_call(helper, args)
        } else {
            let helper = splice.method.helper_symbol(GPU_RUNTIME, "invalidateGPU", DataType::NoType);
            let args = vec![
                splice.method.new_load(scope_sym),
                splice.method.new_load(host),
                splice.method.new_load(dev),
            ];
            splice.method.new_call(helper, args)
        };
        let tree = splice.method.new_treetop(call);
        splice.push(tree);
    }

    // exit
    if single {
        splice.next_block();
        let tree = region_exit_tree(splice.method, scope_sym);
        splice.push(tree);
        scope.exit_points.push((splice.cursor, tree));
    }

    // check
    splice.next_block();
    let state = splice.method.helper_symbol(GPU_RUNTIME, "getStateGPU", DataType::Int32);
    let args = vec![splice.method.new_load(scope_sym), splice.method.new_load_addr(start_pc)];
    let call = splice.method.new_call(state, args);
    let zero = splice.method.new_int(DataType::Int32, 0);
    let test = splice.method.new_if(Cond::Ne, call, zero, site.entry);
    splice.push(test);

    // done
    splice.next_block();
    let goto = splice.method.new_goto(site.exit);
    splice.push(goto);

    if let Some(cpu) = cpu_exit {
        splice.place(cpu);
        let tree = region_exit_tree(splice.method, scope_sym);
        splice.push(tree);
        let goto = splice.method.new_goto(site.entry);
        splice.push(goto);
    }

    keep_alive(method, scope, &params);

    for entry in params {
        if let Some(e) = map.get_mut(entry.host_symbol) {
            e.host_temp = entry.host_temp;
            e.dev_temp = entry.dev_temp;
        }
    }
    debug!(
        "spliced launch of kernel {} in front of {} ({} parameters)",
        kernel.kernel_id, site.region, slots
    );
    Ok(())
}

/// Store a dummy combination of the addresses of all promoted host values
/// in front of every region exit, so the host compiler keeps them alive.
fn keep_alive(method: &mut Method, scope: &mut GpuScope, params: &[SymbolMapEntry]) {
    let first = scope.live_sym.is_none();
    let live = *scope
        .live_sym
        .get_or_insert_with(|| method.temp("gpuLive", DataType::Int64));
    for &(block, exit) in &scope.exit_points {
        let mut value = if first {
            method.new_int(DataType::Int64, 0)
        } else {
            method.new_load(live)
        };
        for host in params.iter().filter_map(|e| e.host_temp) {
            let addr = method.new_load_addr(host);
            let addr = method.new_op(Opcode::Convert, DataType::Int64, vec![addr]);
            value = method.new_op(Opcode::Add, DataType::Int64, vec![value, addr]);
        }
        let store = method.new_store(live, value);
        let trees = &mut method.block_mut(block).trees;
        let at = trees.iter().position(|&t| t == exit).unwrap_or(trees.len());
        trees.insert(at, store);
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Appends new blocks after a cursor in the layout.
struct Splice<'m> {
    method: &'m mut Method,
    owner: Option<RegionId>,
    cursor: BlockId,
}

impl<'m> Splice<'m> {
    fn new(method: &'m mut Method, owner: Option<RegionId>, cursor: BlockId) -> Self {
        Splice {
            method,
            owner,
            cursor,
        }
    }

    fn next_block(&mut self) {
        let b = self.method.add_block();
        self.place(b);
    }

    fn place(&mut self, block: BlockId) {
        self.method.insert_block_after(self.cursor, block);
        if let Some(r) = self.owner {
            self.method.add_block_to_region(r, block);
        }
        self.cursor = block;
    }

    fn push(&mut self, tree: NodeId) {
        let cursor = self.cursor;
        self.method.block_mut(cursor).trees.push(tree);
    }

    /// `bound - start` as a long, reading the induction variable when no
    /// start tree is given.
    fn trip_count(&mut self, bound: NodeId, piv: Option<SymbolId>, start: Option<NodeId>) -> NodeId {
        let end = self.method.dup_tree(bound);
        let begin = match (start, piv) {
            (Some(s), _) => self.method.dup_tree(s),
            (None, Some(p)) => self.method.new_load(p),
            (None, None) => self.method.new_int(DataType::Int32, 0),
        };
        let ty = self.method.node(end).ty;
        let trip = self.method.new_op(Opcode::Sub, ty, vec![end, begin]);
        self.method.widen_to_long(trip)
    }

    /// Byte range `[start, end)` of a transfer. Without an affine address
    /// the whole array is transferred, signalled by `0, -1`.
    fn range(&mut self, addr: Option<NodeId>, size: i32, piv: SymbolId, bound: NodeId) -> (NodeId, NodeId) {
        let offset = addr.and_then(|a| {
            let node = self.method.node(a);
            (node.op == Opcode::AddrAdd).then(|| node.child(1)).flatten()
        });
        let Some(offset) = offset else {
            let start = self.method.new_int(DataType::Int64, 0);
            let end = self.method.new_int(DataType::Int64, -1);
            return (start, end);
        };
        let start = self.method.dup_tree(offset);
        let start = self.method.widen_to_long(start);
        let last = self.method.dup_tree(bound);
        let ty = self.method.node(last).ty;
        let one = self.method.new_int(ty, 1);
        let last = self.method.new_op(Opcode::Sub, ty, vec![last, one]);
        let end = self.method.dup_substituting(offset, piv, last);
        let end = self.method.widen_to_long(end);
        let size = self.method.new_int(DataType::Int64, i64::from(size.max(1)));
        let end = self.method.new_op(Opcode::Add, DataType::Int64, vec![end, size]);
        (start, end)
    }
}

/// Address expression whose range is copied to the device, when one
/// affine expression covers every access.
fn transfer_range_to(method: &Method, options: &GpuOptions, entry: &SymbolMapEntry) -> Option<NodeId> {
    if options.disable_data_transfer_elimination {
        return None;
    }
    match (entry.reads(), entry.writes()) {
        (true, true) => {
            let rhs = entry.rhs.expr()?;
            let lhs = entry.lhs.expr()?;
            same_value(method, rhs, lhs).then_some(rhs)
        }
        (true, false) => entry.rhs.expr(),
        (false, _) => entry.lhs.expr(),
    }
}

/// Type of the value a parameter carries into the kernel.
fn value_type(method: &Method, entry: &SymbolMapEntry) -> DataType {
    match entry.node {
        Some(n) => method.node(n).ty,
        None => method.symbol(entry.host_symbol).ty,
    }
}

/// Trip counts of nested loops counting up by one whose start and bound are
/// known before `region`. Cold loops and everything below them are skipped.
pub(crate) fn nested_trip_counts(method: &Method, region: RegionId) -> Vec<(NodeId, NodeId)> {
    let info = LoopInfo::new(method, region);
    let mut out = Vec::new();
    collect_trip_counts(method, &info, region, &mut out);
    out
}

fn collect_trip_counts(method: &Method, info: &LoopInfo, r: RegionId, out: &mut Vec<(NodeId, NodeId)>) {
    let region = method.region(r);
    if method.block(region.entry).cold {
        return;
    }
    let counted = region
        .induction
        .as_ref()
        .filter(|iv| r != info.region && region.is_natural_loop() && iv.increment == 1)
        .and_then(|iv| Some((iv.exit_bound?, iv.entry?)));
    if let Some((bound, entry)) = counted {
        if info.is_invariant(method, bound) && info.is_invariant(method, entry) {
            out.push((bound, entry));
        }
    }
    for &child in &region.children {
        collect_trip_counts(method, info, child, out);
    }
}

/// Static holding the bytecode position of a launch, named after the loop entry.
fn start_pc_symbol(method: &mut Method, entry: BlockId) -> SymbolId {
    let name = format!("startPC.{}", entry.0);
    let existing = method
        .symbols
        .iter()
        .find(|(_, s)| s.name == name && s.is_static());
    if let Some((&id, _)) = existing {
        return id;
    }
    method.add_symbol(Symbol {
        name,
        ty: DataType::Address,
        kind: SymbolKind::Static,
        signature: None,
        recognized: None,
    })
}

fn parameter_buffer_symbol(method: &mut Method) -> SymbolId {
    let existing = method
        .symbols
        .iter()
        .find(|(_, s)| s.name == "<gpu parameter buffer>" && s.is_static());
    if let Some((&id, _)) = existing {
        return id;
    }
    method.add_symbol(Symbol {
        name: "<gpu parameter buffer>".to_string(),
        ty: DataType::Address,
        kind: SymbolKind::Static,
        signature: None,
        recognized: None,
    })
}

fn region_entry_call(method: &mut Method, kind: ScopeKind, start_pc: SymbolId) -> NodeId {
    let helper = method.helper_symbol(GPU_RUNTIME, "regionEntryGPU", DataType::Int64);
    let code = method.new_int(DataType::Int32, i64::from(kind.code()));
    let pc = method.new_load_addr(start_pc);
    method.new_call(helper, vec![code, pc])
}

fn region_exit_tree(method: &mut Method, scope_sym: SymbolId) -> NodeId {
    let helper = method.helper_symbol(GPU_RUNTIME, "regionExitGPU", DataType::NoType);
    let load = method.new_load(scope_sym);
    let call = method.new_call(helper, vec![load]);
    method.new_treetop(call)
}
