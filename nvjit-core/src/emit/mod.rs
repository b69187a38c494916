//! NVVM IR text generation.
//!
//! [`dump_kernel`] renders either one offloadable loop or a whole method
//! marked as a GPU kernel. For a loop, each GPU thread runs exactly one
//! iteration: the prologue computes the thread's induction value from the
//! launch coordinates and the backedge becomes `ret void`.
//!
//! The kernel uses the typed-pointer NVVM IR dialect:
//!
//! ```text
//! define void @test0(i8* %p0, i32 %startInclusive, i32 %endExclusive, i8* %ExceptionKind) {
//! entry:
//!   %p0.addr = alloca i8*, align 8
//!   ...
//! }
//! ```
//!
//! Numbered values (`%7`) are allocated from one counter per kernel. Labels
//! are named (`block_N`, `NullCheckOK3`, `ArrayCopy0`) so they never take a
//! number.

use std::collections::{HashMap, HashSet};
use std::fmt;

use indexmap::IndexMap;
use log::debug;

use crate::classify::type_name;
use crate::config::{DeviceOracle, GpuOptions, ObjectModel};
use crate::error::{CompilerError, Result};
use crate::ir::dominators::PostDominators;
use crate::ir::usedef::UseDefInfo;
use crate::ir::{array_element_size, BlockId, DataType, Method, NodeId, Opcode, RegionId, SymbolId, SymbolKind};
use crate::symbol_map::SymbolMap;

/// Append one formatted line to an [`IrBuffer`].
macro_rules! ir {
    ($out:expr) => {
        $out.line(format_args!(""))
    };
    ($out:expr, $($arg:tt)*) => {
        $out.line(format_args!($($arg)*))
    };
}

mod array_copy;
pub mod intrinsics;
mod render;

// =============================================================================
// Results
// =============================================================================

/// Outcome of an offload attempt as seen by the surrounding code generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuResult {
    Success,
    InvalidProgram,
    HelperError,
}

impl From<&CompilerError> for GpuResult {
    fn from(err: &CompilerError) -> Self {
        match err {
            CompilerError::HelperError(_) => GpuResult::HelperError,
            _ => GpuResult::InvalidProgram,
        }
    }
}

impl<T> From<&Result<T>> for GpuResult {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => GpuResult::Success,
            Err(e) => GpuResult::from(e),
        }
    }
}

/// A rendered kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelText {
    pub kernel_id: u32,
    pub text: String,
    /// The kernel can store into the exception-kind cell.
    pub has_exception_checks: bool,
    /// Parameter slots whose null checks were eliminated; bit `k` is slot `k`.
    pub null_check_arguments: u64,
}

/// Append-only text buffer the kernel is rendered into.
#[derive(Debug, Clone)]
pub struct IrBuffer {
    text: String,
}

impl IrBuffer {
    pub const INITIAL_CAPACITY: usize = 4096;

    pub fn new() -> Self {
        IrBuffer {
            text: String::with_capacity(Self::INITIAL_CAPACITY),
        }
    }

    pub fn line(&mut self, args: fmt::Arguments<'_>) {
        // Formatting into a String never fails.
        let _ = fmt::Write::write_fmt(&mut self.text, args);
        self.text.push('\n');
    }

    pub fn append(&mut self, other: &IrBuffer) {
        self.text.push_str(&other.text);
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

impl Default for IrBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for IrBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.text.push_str(s);
        Ok(())
    }
}

// =============================================================================
// Entry point
// =============================================================================

/// Read-only inputs shared by every kernel of a compilation.
#[derive(Clone, Copy)]
pub struct EmitEnv<'a> {
    pub options: &'a GpuOptions,
    pub object_model: &'a ObjectModel,
    pub device: &'a dyn DeviceOracle,
}

/// What to render.
#[derive(Clone, Copy)]
pub enum KernelTarget<'a> {
    /// One iteration of a loop per thread. `map` holds the loop's kernel
    /// parameters and locals.
    Loop {
        region: RegionId,
        map: &'a SymbolMap,
        usedef: &'a UseDefInfo,
    },
    /// The whole method; parameters come from its signature.
    Method,
}

/// Render a kernel. Any error discards the partial text.
pub fn dump_kernel(
    method: &Method,
    target: KernelTarget<'_>,
    env: &EmitEnv<'_>,
    kernel_id: u32,
    epoch: u64,
) -> Result<KernelText> {
    let mut cx = EmitContext::new(method, target, env, epoch)?;
    cx.emit_entry()?;
    cx.emit_blocks()?;
    let kernel = cx.assemble(kernel_id)?;
    debug!(
        "Rendered kernel test{} for {} ({} bytes)",
        kernel_id,
        method.name,
        kernel.text.len()
    );
    Ok(kernel)
}

// =============================================================================
// Emission context
// =============================================================================

/// Loop being rendered as a kernel.
struct LoopKernel<'a> {
    map: &'a SymbolMap,
    usedef: &'a UseDefInfo,
    /// Loop entry; branches back to it end the thread.
    first: BlockId,
}

/// Address space an indirect access goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Space {
    Default,
    Shared,
    ReadOnly,
}

/// State of one kernel emission. Nothing outlives the call to [`dump_kernel`].
struct EmitContext<'a> {
    method: &'a Method,
    options: &'a GpuOptions,
    object_model: &'a ObjectModel,
    kernel: Option<LoopKernel<'a>>,
    /// Blocks rendered, in layout order.
    blocks: Vec<BlockId>,
    in_kernel: HashSet<BlockId>,
    /// Blocks that need an explicit label.
    targets: HashSet<BlockId>,
    current_block: Option<BlockId>,

    body: IrBuffer,
    next_id: u32,
    epoch: u64,
    visited: HashMap<NodeId, u64>,
    names: HashMap<NodeId, String>,
    labels: u32,
    array_copies: u32,

    need_null: bool,
    need_bnd: bool,
    need_div: bool,
    /// Shared-memory globals by field, with their declaration.
    shared_fields: IndexMap<SymbolId, String>,
    /// Read-only cache for array elements; `Some(true)` for the
    /// two-parameter intrinsic form.
    ldg_array: Option<bool>,
    ldg_header: Option<bool>,
    nvvm_version: (u32, u32),
    eliminated: HashSet<NodeId>,
    null_check_arguments: u64,
    /// Kernel locals of a whole-method kernel, in symbol order.
    method_autos: Vec<SymbolId>,
}

impl<'a> EmitContext<'a> {
    fn new(
        method: &'a Method,
        target: KernelTarget<'a>,
        env: &EmitEnv<'a>,
        epoch: u64,
    ) -> Result<Self> {
        let cc = env.device.compute_capability()?;
        let nvvm_version = env.device.nvvm_version()?;
        let options = env.options;
        let two_param = nvvm_version > (1, 2);
        let ldg_ok = cc >= (3, 5);

        let (kernel, blocks) = match target {
            KernelTarget::Loop { region, map, usedef } => {
                let first = method.region(region).entry;
                let kernel = LoopKernel { map, usedef, first };
                (Some(kernel), method.region_blocks(region))
            }
            KernelTarget::Method => (None, method.layout.clone()),
        };

        let mut cx = EmitContext {
            method,
            options,
            object_model: env.object_model,
            in_kernel: blocks.iter().copied().collect(),
            blocks,
            kernel,
            targets: HashSet::new(),
            current_block: None,
            body: IrBuffer::new(),
            next_id: 0,
            epoch,
            visited: HashMap::new(),
            names: HashMap::new(),
            labels: 0,
            array_copies: 0,
            need_null: false,
            need_bnd: false,
            need_div: false,
            shared_fields: IndexMap::new(),
            ldg_array: (ldg_ok && !options.disable_read_only_cache_array).then_some(two_param),
            ldg_header: (ldg_ok && !options.disable_read_only_cache_obj_hdr).then_some(two_param),
            nvvm_version,
            eliminated: HashSet::new(),
            null_check_arguments: 0,
            method_autos: Vec::new(),
        };
        cx.collect_targets();
        cx.collect_symbols()?;
        if cx.kernel.is_none() && options.enable_exception_check_elimination {
            cx.find_eliminable_null_checks();
        }
        Ok(cx)
    }

    fn is_true_gpu(&self) -> bool {
        self.kernel.is_none()
    }

    fn fresh(&mut self) -> String {
        let n = self.next_id;
        self.next_id += 1;
        format!("%{}", n)
    }

    fn fresh_label(&mut self, prefix: &str) -> String {
        let n = self.labels;
        self.labels += 1;
        format!("{}{}", prefix, n)
    }

    fn ty(&self, ty: DataType, node: NodeId) -> Result<&'static str> {
        type_name(ty).ok_or_else(|| crate::err_invalid!(node, "type {} has no NVVM counterpart", ty))
    }

    // =========================================================================
    // Pre-scan
    // =========================================================================

    /// Label every block that is reached other than by falling through from
    /// its layout predecessor.
    fn collect_targets(&mut self) {
        if let Some(k) = &self.kernel {
            self.targets.insert(k.first);
        }
        let method = self.method;
        for &b in &self.blocks {
            let Some(term) = method.terminator(b) else {
                continue;
            };
            let node = method.node(term);
            let mut dests: Vec<BlockId> = node.target.into_iter().collect();
            dests.extend(node.cases.iter().map(|&(_, d)| d));
            if matches!(node.op, Opcode::If(..)) {
                // The fall-through side is named by the `br` too.
                dests.extend(method.layout_next(b));
            }
            for d in dests {
                if self.in_kernel.contains(&d) {
                    self.targets.insert(d);
                }
            }
        }
    }

    /// Shared-memory fields and the locals of a whole-method kernel.
    fn collect_symbols(&mut self) -> Result<()> {
        let method = self.method;
        let roots: Vec<NodeId> = self
            .blocks
            .iter()
            .flat_map(|&b| method.block(b).trees.iter().copied())
            .collect();
        let mut shared = Vec::new();
        let mut autos = Vec::new();
        method.walk_postorder(&roots, &mut |id, node| {
            let Some(sym) = node.symbol else {
                return;
            };
            let symbol = method.symbol(sym);
            if let Some(len) = symbol.shared_memory_len() {
                shared.push((sym, id, len));
            }
            if symbol.kind == SymbolKind::Auto && matches!(node.op, Opcode::Load | Opcode::Store) {
                autos.push(sym);
            }
        });
        for (sym, id, len) in shared {
            if self.shared_fields.contains_key(&sym) {
                continue;
            }
            let symbol = method.symbol(sym);
            let elem = symbol
                .signature
                .as_deref()
                .and_then(intrinsics::signature_element_type)
                .ok_or_else(|| {
                    crate::err_invalid!(id, "shared field {} is not an array", symbol.name)
                })?;
            let decl = format!(
                "@{} = internal addrspace(3) global [{} x {}] zeroinitializer, align 8",
                symbol.name, len, elem
            );
            self.shared_fields.insert(sym, decl);
        }
        if self.is_true_gpu() {
            autos.sort();
            autos.dedup();
            self.method_autos = autos;
        }
        Ok(())
    }

    /// Null checks of parameters in blocks every path from the entry goes
    /// through are hoisted to the caller.
    fn find_eliminable_null_checks(&mut self) {
        let method = self.method;
        let Some(entry) = method.entry_block() else {
            return;
        };
        let postdom = PostDominators::compute(method);
        let mut eliminated = HashSet::new();
        let mut vector = 0u64;
        for &b in &self.blocks {
            if !postdom.post_dominates(b, entry) {
                continue;
            }
            method.walk_postorder(&method.block(b).trees, &mut |id, node| {
                if node.op != Opcode::NullCheck {
                    return;
                }
                let Some(reference) = node.child(0) else {
                    return;
                };
                let r = method.node(reference);
                if r.op != Opcode::Load {
                    return;
                }
                if let Some(SymbolKind::Parm { slot }) = r.symbol.map(|s| &method.symbol(s).kind) {
                    if *slot < 64 {
                        eliminated.insert(id);
                        vector |= 1u64 << *slot;
                    }
                }
            });
        }
        self.eliminated = eliminated;
        self.null_check_arguments = vector;
    }

    // =========================================================================
    // Parameters and locals
    // =========================================================================

    /// Kernel parameters as (type, slot, is array).
    fn parameters(&self) -> Result<Vec<(&'static str, u32, bool)>> {
        let method = self.method;
        let mut params = Vec::new();
        match &self.kernel {
            Some(k) => {
                for entry in k.map.parameters() {
                    let ty = match entry.node {
                        Some(n) => method.node(n).ty,
                        None => method.symbol(entry.host_symbol).ty,
                    };
                    let name = type_name(ty).ok_or_else(|| {
                        CompilerError::InvalidProgram(
                            format!("parameter {} has type {}", entry.host_symbol, ty),
                            entry.node,
                        )
                    })?;
                    params.push((name, entry.slot as u32, entry.is_array() && ty == DataType::Address));
                }
            }
            None => {
                for &p in &method.params {
                    let symbol = method.symbol(p);
                    let SymbolKind::Parm { slot } = symbol.kind else {
                        crate::bail_fatal!(None, "method parameter {} is not a Parm", symbol.name);
                    };
                    let name = type_name(symbol.ty).ok_or_else(|| {
                        CompilerError::InvalidProgram(format!("parameter {} has type {}", symbol.name, symbol.ty), None)
                    })?;
                    let is_array = symbol.ty == DataType::Address
                        && symbol.signature.as_deref().and_then(array_element_size).is_some();
                    params.push((name, slot, is_array));
                }
            }
        }
        Ok(params)
    }

    /// Kernel locals as (type, index).
    fn locals(&self) -> Result<Vec<(&'static str, u32, usize)>> {
        let method = self.method;
        let autos = match &self.kernel {
            Some(k) => k.map.autos.clone(),
            None => self.method_autos.clone(),
        };
        let mut out = Vec::new();
        for (i, sym) in autos.into_iter().enumerate() {
            let ty = method.symbol(sym).ty;
            let name = type_name(ty).ok_or_else(|| {
                CompilerError::InvalidProgram(format!("local {} has type {}", sym, ty), None)
            })?;
            out.push((name, ty.size(), i));
        }
        Ok(out)
    }

    /// Stack slot of a symbol referenced by a direct load or store.
    fn slot_name(&self, sym: SymbolId, node: NodeId) -> Result<String> {
        match &self.kernel {
            Some(k) => {
                if let Some(slot) = k.map.slot(sym) {
                    return Ok(format!("%p{}.addr", slot));
                }
                if let Some(i) = k.map.auto_index(sym) {
                    return Ok(format!("%a{}.addr", i));
                }
            }
            None => {
                let symbol = self.method.symbol(sym);
                if let SymbolKind::Parm { slot } = symbol.kind {
                    return Ok(format!("%p{}.addr", slot));
                }
                if let Some(i) = self.method_autos.iter().position(|&s| s == sym) {
                    return Ok(format!("%a{}.addr", i));
                }
            }
        }
        crate::bail_invalid!(node, "symbol {} is not available in the kernel", sym)
    }

    fn return_type(&self) -> Result<&'static str> {
        if self.kernel.is_some() {
            return Ok("void");
        }
        type_name(self.method.return_type).ok_or_else(|| {
            CompilerError::InvalidProgram(
                format!("return type {} has no NVVM counterpart", self.method.return_type),
                None,
            )
        })
    }

    fn return_statement(&self) -> Result<String> {
        Ok(match self.return_type()? {
            "void" => "ret void".to_string(),
            ty => format!("ret {} undef", ty),
        })
    }

    // =========================================================================
    // Entry block
    // =========================================================================

    fn emit_entry(&mut self) -> Result<()> {
        let params = self.parameters()?;
        let locals = self.locals()?;
        let align_offset = self
            .object_model
            .gpu_alignment
            .saturating_sub(self.object_model.array_header_size);

        let record_null_checks = self.is_true_gpu() && self.options.enable_exception_check_elimination;
        let out = &mut self.body;
        ir!(out, "entry:");
        if record_null_checks {
            ir!(out, "  ; needNullCheckArguments_vector=0x{:016x}", self.null_check_arguments);
        }
        for &(ty, slot, is_array) in &params {
            let mut value = format!("%p{}", slot);
            if is_array && !self.options.disable_buffer_align {
                ir!(out, "  %p{}.t = getelementptr inbounds i8* %p{}, i32 {}", slot, slot, align_offset);
                value = format!("%p{}.t", slot);
            }
            let align = type_align(ty);
            ir!(out, "  %p{}.addr = alloca {}, align {}", slot, ty, align);
            ir!(out, "  store {} {}, {}* %p{}.addr, align {}", ty, value, ty, slot, align);
            if is_array && !self.options.disable_read_only_cache_obj_hdr {
                let name = &value[1..];
                ir!(
                    out,
                    "  %inv_{}_header = call {{}}* @llvm.invariant.start(i64 {}, i8* {})",
                    name,
                    self.object_model.object_header_invariant,
                    value
                );
            }
        }
        for &(ty, size, i) in &locals {
            ir!(out, "  %a{}.addr = alloca {}, align {}", i, ty, size);
        }

        if let Some(first) = self.kernel.as_ref().map(|k| k.first) {
            let ctaid = self.fresh();
            let ntid = self.fresh();
            let base = self.fresh();
            let tid = self.fresh();
            let index = self.fresh();
            let iv = self.fresh();
            let test = self.fresh();
            let out = &mut self.body;
            ir!(out, "  {} = call i32 @llvm.nvvm.read.ptx.sreg.ctaid.x()", ctaid);
            ir!(out, "  {} = call i32 @llvm.nvvm.read.ptx.sreg.ntid.x()", ntid);
            ir!(out, "  {} = mul i32 {}, {}", base, ctaid, ntid);
            ir!(out, "  {} = call i32 @llvm.nvvm.read.ptx.sreg.tid.x()", tid);
            ir!(out, "  {} = add i32 {}, {}", index, base, tid);
            ir!(out, "  {} = add i32 {}, %startInclusive", iv, index);
            ir!(out, "  store i32 {}, i32* %a0.addr, align 4", iv);
            ir!(out, "  {} = icmp slt i32 {}, %endExclusive", test, iv);
            ir!(out, "  br i1 {}, label %{}, label %block_0", test, first);
            ir!(out, "block_0:");
            ir!(out, "  ret void");
        }
        Ok(())
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    fn emit_blocks(&mut self) -> Result<()> {
        let method = self.method;
        // A loop kernel enters its first block through a branch.
        let mut open = self.is_true_gpu();
        let blocks = self.blocks.clone();
        for (i, &b) in blocks.iter().enumerate() {
            self.current_block = Some(b);
            if self.targets.contains(&b) || !open {
                if open {
                    ir!(self.body, "  br label %{}", b);
                }
                ir!(self.body, "{}:", b);
                open = true;
            }
            for &tree in &method.block(b).trees {
                if !open {
                    crate::bail_fatal!(Some(tree), "{} continues after its terminator", b);
                }
                if self.emit_tree(tree)? {
                    open = false;
                }
            }
            if !open {
                continue;
            }
            let next = method.layout_next(b);
            let follows = next.is_some() && next == blocks.get(i + 1).copied();
            match next {
                Some(n) if !follows => {
                    self.jump(n)?;
                    open = false;
                }
                None => {
                    let ret = self.return_statement()?;
                    ir!(self.body, "  {}", ret);
                    open = false;
                }
                _ => {}
            }
        }
        if open {
            let ret = self.return_statement()?;
            ir!(self.body, "  {}", ret);
        }
        Ok(())
    }

    /// Label for a branch destination. Destinations outside a loop kernel
    /// leave through `block_0`.
    fn label_for(&self, dest: BlockId) -> String {
        if self.kernel.is_some() && !self.in_kernel.contains(&dest) {
            "block_0".to_string()
        } else {
            dest.to_string()
        }
    }

    fn is_backedge(&self, dest: BlockId) -> bool {
        self.kernel.as_ref().is_some_and(|k| k.first == dest)
    }

    /// Unconditional transfer to `dest`.
    fn jump(&mut self, dest: BlockId) -> Result<()> {
        if self.is_backedge(dest) {
            ir!(self.body, "  ret void");
        } else {
            let label = self.label_for(dest);
            ir!(self.body, "  br label %{}", label);
        }
        Ok(())
    }

    /// Render a statement. Returns true when it ended the block.
    fn emit_tree(&mut self, tree: NodeId) -> Result<bool> {
        let method = self.method;
        let node = method.node(tree);
        match node.op {
            Opcode::If(cond, mode) => {
                self.emit_if(tree, cond, mode)?;
                Ok(true)
            }
            Opcode::Goto => {
                let Some(dest) = node.target else {
                    crate::bail_fatal!(Some(tree), "goto without a target");
                };
                self.jump(dest)?;
                Ok(true)
            }
            Opcode::Return => {
                if self.kernel.is_some() || node.ty == DataType::NoType {
                    ir!(self.body, "  ret void");
                } else {
                    let Some(c) = node.child(0) else {
                        crate::bail_fatal!(Some(tree), "return without a value");
                    };
                    let v = self.value(c)?;
                    let ty = self.ty(node.ty, tree)?;
                    ir!(self.body, "  ret {} {}", ty, v);
                }
                Ok(true)
            }
            Opcode::Lookup => {
                self.emit_lookup(tree)?;
                Ok(true)
            }
            Opcode::Table => {
                self.emit_table(tree)?;
                Ok(true)
            }
            _ => {
                self.render(tree)?;
                Ok(false)
            }
        }
    }

    fn emit_if(&mut self, tree: NodeId, cond: crate::ir::Cond, mode: crate::ir::CmpMode) -> Result<()> {
        let method = self.method;
        let node = method.node(tree);
        let Some(dest) = node.target else {
            crate::bail_fatal!(Some(tree), "conditional branch without a target");
        };
        if self.is_backedge(dest) {
            ir!(self.body, "  ret void");
            return Ok(());
        }
        let (Some(a), Some(b)) = (node.child(0), node.child(1)) else {
            crate::bail_fatal!(Some(tree), "conditional branch needs two operands");
        };
        let operand = method.node(a).ty;
        let va = self.value(a)?;
        let vb = self.value(b)?;
        let mnemonic = crate::classify::compare(cond, mode, operand)
            .ok_or_else(|| crate::err_invalid!(tree, "cannot compare values of type {}", operand))?;
        let ty = self.ty(operand, a)?;
        let test = self.fresh();
        ir!(self.body, "  {} = {} {} {}, {}", test, mnemonic, ty, va, vb);

        let fall = self
            .current_block
            .and_then(|cur| method.layout_next(cur))
            .map(|n| self.label_for(n))
            .unwrap_or_else(|| "block_0".to_string());
        let taken = self.label_for(dest);
        ir!(self.body, "  br i1 {}, label %{}, label %{}", test, taken, fall);
        Ok(())
    }

    /// Lookup switches compare the key against each case in turn.
    fn emit_lookup(&mut self, tree: NodeId) -> Result<()> {
        let method = self.method;
        let node = method.node(tree);
        let (Some(key), Some(default)) = (node.child(0), node.target) else {
            crate::bail_fatal!(Some(tree), "lookup needs a key and a default");
        };
        let v = self.value(key)?;
        let ty = self.ty(method.node(key).ty, key)?;
        for &(case, dest) in &node.cases {
            let test = self.fresh();
            let next = self.fresh_label("Lookup");
            let taken = self.label_for(dest);
            ir!(self.body, "  {} = icmp eq {} {}, {}", test, ty, v, case);
            ir!(self.body, "  br i1 {}, label %{}, label %{}", test, taken, next);
            ir!(self.body, "{}:", next);
        }
        self.jump(default)
    }

    fn emit_table(&mut self, tree: NodeId) -> Result<()> {
        let method = self.method;
        let node = method.node(tree);
        let (Some(key), Some(default)) = (node.child(0), node.target) else {
            crate::bail_fatal!(Some(tree), "table needs a key and a default");
        };
        let v = self.value(key)?;
        let ty = self.ty(method.node(key).ty, key)?;
        let default = self.label_for(default);
        ir!(self.body, "  switch {} {}, label %{} [", ty, v, default);
        for (i, &(_, dest)) in node.cases.iter().enumerate() {
            let label = self.label_for(dest);
            ir!(self.body, "    {} {}, label %{}", ty, i, label);
        }
        ir!(self.body, "  ]");
        Ok(())
    }

    // =========================================================================
    // Assembly
    // =========================================================================

    fn emit_landing_pads(&mut self) -> Result<()> {
        let ret = self.return_statement()?;
        let pads = [
            (self.need_null, "NullException", intrinsics::NULL_EXCEPTION),
            (self.need_bnd, "BndException", intrinsics::BND_EXCEPTION),
            (self.need_div, "DivException", intrinsics::DIV_EXCEPTION),
        ];
        for (needed, label, code) in pads {
            if !needed {
                continue;
            }
            let cell = self.fresh();
            ir!(self.body, "{}:", label);
            ir!(self.body, "  {} = bitcast i8* %ExceptionKind to i32*", cell);
            ir!(self.body, "  store i32 {}, i32* {}, align 4", code, cell);
            ir!(self.body, "  {}", ret);
        }
        Ok(())
    }

    fn assemble(mut self, kernel_id: u32) -> Result<KernelText> {
        self.emit_landing_pads()?;
        let params = self.parameters()?;
        let ret = self.return_type()?;

        let mut arg_types: Vec<&str> = params.iter().map(|&(ty, _, _)| ty).collect();
        let mut args: Vec<String> = params
            .iter()
            .map(|&(ty, slot, _)| format!("{} %p{}", ty, slot))
            .collect();
        if self.kernel.is_some() {
            arg_types.extend(["i32", "i32"]);
            args.push("i32 %startInclusive".into());
            args.push("i32 %endExclusive".into());
        }
        arg_types.push("i8*");
        args.push("i8* %ExceptionKind".into());

        let mut out = IrBuffer::new();
        ir!(out, "target triple = \"{}\"", intrinsics::TARGET_TRIPLE);
        ir!(out, "target datalayout = \"{}\"", intrinsics::DATA_LAYOUT);
        ir!(out);
        for decl in self.shared_fields.values() {
            ir!(out, "{}", decl);
        }
        ir!(out, "{}", intrinsics::EXCEPTION_KIND_GLOBAL);
        if let Some(two_param) = self.ldg_array.or(self.ldg_header) {
            for decl in intrinsics::ldg_declares(two_param) {
                ir!(out, "{}", decl);
            }
        }
        for decl in intrinsics::INVARIANT_DECLARES {
            ir!(out, "{}", decl);
        }
        ir!(out);
        ir!(out, "define {} @test{}({}) {{", ret, kernel_id, args.join(", "));
        out.append(&self.body);
        ir!(out, "}}");
        ir!(out);
        for decl in intrinsics::sreg_declares() {
            ir!(out, "{}", decl);
        }
        if self.options.enable_math {
            for decl in intrinsics::MATH_DECLARES {
                ir!(out, "{}", decl);
            }
        }
        ir!(out, "{}", intrinsics::BARRIER_DECLARE);
        ir!(out);
        for line in intrinsics::METADATA_CONSTANTS {
            ir!(out, "{}", line);
        }
        ir!(out, "!nvvmir.version = !{{!0}}");
        ir!(out, "!0 = metadata !{{i32 {}, i32 {}}}", self.nvvm_version.0, self.nvvm_version.1);
        ir!(out, "!nvvm.annotations = !{{!1}}");
        ir!(
            out,
            "!1 = metadata !{{{} ({})* @test{}, metadata !\"kernel\", i32 1}}",
            ret,
            arg_types.join(", "),
            kernel_id
        );

        Ok(KernelText {
            kernel_id,
            text: out.into_string(),
            has_exception_checks: self.need_null || self.need_bnd || self.need_div,
            null_check_arguments: self.null_check_arguments,
        })
    }
}

/// Natural alignment of a scalar NVVM type.
fn type_align(ty: &str) -> u32 {
    match ty {
        "i8" => 1,
        "i16" => 2,
        "i32" | "float" => 4,
        _ => 8,
    }
}
