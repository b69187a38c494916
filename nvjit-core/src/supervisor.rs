//! Boundary with the compilation supervisor.
//!
//! The supervisor owns the scratch memory of a compilation, hands out visit
//! epochs and can ask a compilation to stop. The parallelizer only polls for
//! interruption between passes.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::ir::{BlockId, NodeId, RegionId, SymbolId};
use crate::IdArena;

pub trait CompilationSupervisor {
    /// Scratch allocator valid for the current compilation.
    fn memory_region(&mut self) -> &mut ScratchRegion;
    /// Non-zero reason code when the compilation should stop.
    fn compilation_should_be_interrupted(&self) -> u32;
    /// Next visit epoch. Never wraps within one compilation.
    fn inc_visit_epoch(&mut self) -> u64;
}

// =============================================================================
// GPU scopes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u32);

impl ScopeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for ScopeId {
    fn from(id: u32) -> Self {
        ScopeId(id)
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// An outer loop whose inner forEach kernels share hoisted transfers.
    NaturalLoop,
    /// One kernel loop on its own.
    SingleKernel,
}

impl ScopeKind {
    /// Code passed to the region-entry helper.
    pub fn code(self) -> i32 {
        match self {
            ScopeKind::NaturalLoop => 0,
            ScopeKind::SingleKernel => 1,
        }
    }
}

/// A GPU scope and the host-side state its transformation accumulates.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuScope {
    pub kind: ScopeKind,
    /// The enveloping loop, or the kernel loop itself for a single kernel.
    pub envelope: RegionId,
    pub kernels: Vec<RegionId>,
    /// Handle returned by the region-entry helper.
    pub scope_sym: Option<SymbolId>,
    /// Keep-alive accumulator of promoted symbols.
    pub live_sym: Option<SymbolId>,
    /// Region-exit calls, with their block. Keep-alive code goes before them.
    pub exit_points: Vec<(BlockId, NodeId)>,
    /// Envelope-level code (region entry/exit, flushes) is in place.
    pub transformed: bool,
    /// Blocks that must flush device data before running on the CPU.
    pub flush_blocks: Vec<BlockId>,
}

impl GpuScope {
    pub fn new(kind: ScopeKind, envelope: RegionId, kernels: Vec<RegionId>) -> Self {
        GpuScope {
            kind,
            envelope,
            kernels,
            scope_sym: None,
            live_sym: None,
            exit_points: Vec::new(),
            transformed: false,
            flush_blocks: Vec::new(),
        }
    }
}

/// Per-compilation scratch memory.
#[derive(Debug, Default)]
pub struct ScratchRegion {
    scopes: IdArena<ScopeId, GpuScope>,
}

impl ScratchRegion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_scope(&mut self, scope: GpuScope) -> ScopeId {
        self.scopes.alloc(scope)
    }

    pub fn scope(&self, id: ScopeId) -> &GpuScope {
        &self.scopes[id]
    }

    pub fn scope_mut(&mut self, id: ScopeId) -> &mut GpuScope {
        &mut self.scopes[id]
    }

    pub fn scope_ids(&self) -> Vec<ScopeId> {
        self.scopes.ids().collect()
    }

    /// Drop everything allocated for the previous compilation.
    pub fn reset(&mut self) {
        self.scopes = IdArena::new();
    }
}

// =============================================================================
// In-process supervisor
// =============================================================================

/// Supervisor for one compilation thread. The interruption flag may be set
/// from any thread.
#[derive(Debug)]
pub struct LocalSupervisor {
    region: ScratchRegion,
    interrupt: Arc<AtomicU32>,
    epoch: u64,
}

impl LocalSupervisor {
    pub fn new() -> Self {
        Self::with_interrupt_flag(Arc::new(AtomicU32::new(0)))
    }

    pub fn with_interrupt_flag(interrupt: Arc<AtomicU32>) -> Self {
        LocalSupervisor {
            region: ScratchRegion::new(),
            interrupt,
            epoch: 0,
        }
    }

    /// Handle for requesting interruption from elsewhere.
    pub fn interrupt_flag(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.interrupt)
    }

    pub fn interrupt(&self, reason: u32) {
        self.interrupt.store(reason, Ordering::Relaxed);
    }
}

impl Default for LocalSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilationSupervisor for LocalSupervisor {
    fn memory_region(&mut self) -> &mut ScratchRegion {
        &mut self.region
    }

    fn compilation_should_be_interrupted(&self) -> u32 {
        self.interrupt.load(Ordering::Relaxed)
    }

    fn inc_visit_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }
}
