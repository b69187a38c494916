//! Driver of GPU offload and auto-vectorization for one method.
//!
//! ```text
//! whole-method kernel?  -> render it, done
//! collect GPU scopes    (forEach loops, grouped by enveloping loop)
//! for each scope        analyze, render, splice the host launch
//! collect SIMD loops    (innermost loops not consumed by a GPU scope)
//! for each loop         analyze, vectorize
//! ```
//!
//! Interruption requested by the supervisor is honored between passes only.
//! A loop that is rejected, or whose kernel cannot be rendered, leaves the
//! method untouched.

use std::collections::HashSet;

use log::{debug, info, trace, warn};

use crate::analysis::offload::{find_try_gpu_guard, scan_cpu_blocks, OffloadAnalysis};
use crate::analysis::shape::{check_loop_shape, check_offload_iteration};
use crate::analysis::LoopAnalysis;
use crate::config::{DeviceOracle, GpuOptions, ObjectModel, SimdTarget};
use crate::emit::{dump_kernel, EmitEnv, GpuResult, KernelTarget, KernelText};
use crate::error::{CompilerError, Rejection, Result, Stage, Stop};
use crate::host_transform::{
    mark_hoisted, reverse_try_gpu_guard, transform_envelope, transform_kernel, LaunchSite,
};
use crate::ir::dominators::PostDominators;
use crate::ir::usedef::UseDefInfo;
use crate::ir::{LoopOrigin, Method, NodeId, RegionId};
use crate::supervisor::{CompilationSupervisor, GpuScope, ScopeId, ScopeKind};
use crate::symbol_map::SymbolMap;
use crate::vectorize::{vectorize_loop, VectorPlan};

/// Outcome of one attempt to offload a loop.
#[derive(Debug, Clone, PartialEq)]
pub enum OffloadOutcome {
    Success(KernelText),
    Rejected(Rejection),
    InvalidProgram(String),
    HelperError(String),
}

impl OffloadOutcome {
    pub fn gpu_result(&self) -> Option<GpuResult> {
        match self {
            OffloadOutcome::Success(_) => Some(GpuResult::Success),
            OffloadOutcome::Rejected(_) => None,
            OffloadOutcome::InvalidProgram(_) => Some(GpuResult::InvalidProgram),
            OffloadOutcome::HelperError(_) => Some(GpuResult::HelperError),
        }
    }
}

/// What one run of the driver did to a method.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub kernels: Vec<KernelText>,
    /// Loops that now launch a kernel.
    pub offloaded: Vec<RegionId>,
    /// Original loop and the vector loop created in front of it.
    pub vectorized: Vec<(RegionId, RegionId)>,
    pub rejections: Vec<(RegionId, Rejection)>,
    /// Render failures; each one left its loop on the CPU.
    pub gpu_errors: Vec<CompilerError>,
}

pub struct Parallelizer<'a> {
    options: &'a GpuOptions,
    object_model: &'a ObjectModel,
    simd: &'a SimdTarget,
    device: &'a dyn DeviceOracle,
    supervisor: &'a mut dyn CompilationSupervisor,
    map: SymbolMap,
    ptx_count: u32,
    reversed: HashSet<NodeId>,
    /// Set after a device query failed; no further GPU work this compilation.
    gpu_disabled: bool,
}

impl<'a> Parallelizer<'a> {
    pub fn new(
        options: &'a GpuOptions,
        object_model: &'a ObjectModel,
        simd: &'a SimdTarget,
        device: &'a dyn DeviceOracle,
        supervisor: &'a mut dyn CompilationSupervisor,
    ) -> Self {
        Parallelizer {
            options,
            object_model,
            simd,
            device,
            supervisor,
            map: SymbolMap::new(),
            ptx_count: 0,
            reversed: HashSet::new(),
            gpu_disabled: false,
        }
    }

    /// Number of kernels rendered so far; the next kernel gets this id.
    pub fn ptx_count(&self) -> u32 {
        self.ptx_count
    }

    pub fn perform(&mut self, method: &mut Method) -> Result<PassReport> {
        let mut report = PassReport::default();
        self.check_interrupt()?;
        self.supervisor.memory_region().reset();

        if method.gpu_kernel && self.options.enable_gpu {
            self.compile_whole_method(method, &mut report)?;
            return Ok(report);
        }

        if self.options.enable_gpu {
            let scopes = self.collect_scopes(method);
            self.check_interrupt()?;
            for id in scopes {
                if self.gpu_disabled {
                    break;
                }
                self.offload_scope(method, id, &mut report)?;
                self.check_interrupt()?;
            }
        }

        if !self.options.disable_auto_simd && self.simd.supports_auto_simd {
            let candidates = self.collect_simd_loops(method, &report.offloaded);
            self.check_interrupt()?;
            for region in candidates {
                self.vectorize_candidate(method, region, &mut report)?;
                self.check_interrupt()?;
            }
        }
        Ok(report)
    }

    fn check_interrupt(&self) -> Result<()> {
        match self.supervisor.compilation_should_be_interrupted() {
            0 => Ok(()),
            code => Err(CompilerError::Interrupted(code)),
        }
    }

    fn env(&self) -> EmitEnv<'a> {
        EmitEnv {
            options: self.options,
            object_model: self.object_model,
            device: self.device,
        }
    }

    fn log_rejection(&self, method: &Method, what: &str, rejection: &Rejection) {
        if self.options.trace_rejections() {
            info!("Rejected {} in {}: {}", what, method.name, rejection);
        } else {
            debug!("Rejected {} in {}: {}", what, method.name, rejection);
        }
    }

    // =========================================================================
    // Whole-method kernels
    // =========================================================================

    fn compile_whole_method(&mut self, method: &Method, report: &mut PassReport) -> Result<()> {
        let epoch = self.supervisor.inc_visit_epoch();
        match dump_kernel(method, KernelTarget::Method, &self.env(), self.ptx_count, epoch) {
            Ok(kernel) => {
                self.ptx_count += 1;
                info!("Compiled {} as GPU kernel test{}", method.name, kernel.kernel_id);
                report.kernels.push(kernel);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("GPU kernel {} falls back to the CPU: {}", method.name, e);
                self.gpu_disabled |= matches!(e, CompilerError::HelperError(_));
                report.gpu_errors.push(e);
                Ok(())
            }
        }
    }

    // =========================================================================
    // GPU scopes
    // =========================================================================

    /// Group outermost kernel candidates by their outermost enclosing loop.
    fn collect_scopes(&mut self, method: &Method) -> Vec<ScopeId> {
        let mut candidates = Vec::new();
        collect_candidates(method, method.root, &mut candidates);

        let mut groups: Vec<(Option<RegionId>, Vec<RegionId>)> = Vec::new();
        for k in candidates {
            let envelope = outermost_enclosing_loop(method, k);
            match groups.iter_mut().find(|(e, _)| envelope.is_some() && *e == envelope) {
                Some((_, kernels)) => kernels.push(k),
                None => groups.push((envelope, vec![k])),
            }
        }

        let region = self.supervisor.memory_region();
        groups
            .into_iter()
            .map(|(envelope, kernels)| {
                let scope = match envelope {
                    Some(e) => GpuScope::new(ScopeKind::NaturalLoop, e, kernels),
                    None => GpuScope::new(ScopeKind::SingleKernel, kernels[0], kernels),
                };
                region.alloc_scope(scope)
            })
            .collect()
    }

    fn offload_scope(&mut self, method: &mut Method, id: ScopeId, report: &mut PassReport) -> Result<()> {
        let mut scope = self.supervisor.memory_region().scope(id).clone();
        self.map.clear();

        if scope.kind == ScopeKind::NaturalLoop {
            let checked = match method.loop_preheader(scope.envelope) {
                Some(_) => scan_cpu_blocks(method, scope.envelope, &scope.kernels),
                None => Err(Stop::reject(Stage::Shape, "enveloping loop has no preheader")),
            };
            match checked {
                Ok(flush) => scope.flush_blocks = flush,
                Err(Stop::Reject(r)) => {
                    self.log_rejection(method, "GPU scope", &r);
                    report.rejections.push((scope.envelope, r));
                    return Ok(());
                }
                Err(Stop::Fatal(msg)) => return Err(CompilerError::Fatal(msg, None)),
            }
        }

        for &kernel in &scope.kernels.clone() {
            let outcome = self.try_offload_loop(method, &mut scope, kernel)?;
            if let Some(result) = outcome.gpu_result() {
                trace!("Offload of loop {} in {}: {:?}", kernel, method.name, result);
            }
            match outcome {
                OffloadOutcome::Success(text) => {
                    report.offloaded.push(kernel);
                    report.kernels.push(text);
                }
                OffloadOutcome::Rejected(r) => {
                    self.log_rejection(method, "forEach", &r);
                    report.rejections.push((kernel, r));
                }
                OffloadOutcome::InvalidProgram(msg) => {
                    warn!("forEach in {} stays on the CPU: {}", method.name, msg);
                    report.gpu_errors.push(CompilerError::InvalidProgram(msg, None));
                }
                OffloadOutcome::HelperError(msg) => {
                    warn!("GPU offload disabled for {}: {}", method.name, msg);
                    report.gpu_errors.push(CompilerError::HelperError(msg));
                    self.gpu_disabled = true;
                    break;
                }
            }
        }
        *self.supervisor.memory_region().scope_mut(id) = scope;
        Ok(())
    }

    /// Analyze, render and splice one kernel loop.
    pub fn try_offload_loop(
        &mut self,
        method: &mut Method,
        scope: &mut GpuScope,
        region: RegionId,
    ) -> Result<OffloadOutcome> {
        let (site, guard, usedef) = match self.analyze_offload(method, scope, region) {
            Ok(found) => found,
            Err(Stop::Reject(r)) => return Ok(OffloadOutcome::Rejected(r)),
            Err(Stop::Fatal(msg)) => return Err(CompilerError::Fatal(msg, None)),
        };

        let epoch = self.supervisor.inc_visit_epoch();
        let target = KernelTarget::Loop {
            region,
            map: &self.map,
            usedef: &usedef,
        };
        let kernel = match dump_kernel(method, target, &self.env(), self.ptx_count, epoch) {
            Ok(kernel) => kernel,
            Err(CompilerError::InvalidProgram(msg, _)) => return Ok(OffloadOutcome::InvalidProgram(msg)),
            Err(CompilerError::HelperError(msg)) => return Ok(OffloadOutcome::HelperError(msg)),
            Err(e) => return Err(e),
        };

        let snapshot = method.clone();
        if let Err(e) = splice_launch(method, self.options, scope, &mut self.map, &site, &kernel) {
            *method = snapshot;
            return Err(e);
        }
        self.ptx_count += 1;
        if let Some(branch) = guard {
            reverse_try_gpu_guard(method, branch, &mut self.reversed);
        }
        info!(
            "Offloaded forEach {} in {} as test{}",
            region, method.name, kernel.kernel_id
        );
        Ok(OffloadOutcome::Success(kernel))
    }

    /// Every check that precedes rendering. Leaves `self.map` holding the
    /// kernel parameters.
    fn analyze_offload(
        &mut self,
        method: &Method,
        scope: &GpuScope,
        region: RegionId,
    ) -> std::result::Result<(LaunchSite, Option<NodeId>, UseDefInfo), Stop> {
        check_loop_shape(method, region)?;
        check_offload_iteration(method, region)?;
        let Some(site) = LaunchSite::find(method, region) else {
            return Err(Stop::reject(Stage::Shape, "loop has no preheader or several exits"));
        };
        let guard = match method.region(region).origin {
            LoopOrigin::ParallelForEach => Some(find_try_gpu_guard(method, site.preheader, &self.reversed)?.branch),
            _ => None,
        };
        let usedef = UseDefInfo::compute(method);
        let postdom = PostDominators::compute(method);
        let mut analysis = OffloadAnalysis::new(method, region, site.preheader, self.options, &usedef, &postdom)?;
        analysis.map_symbols(&mut self.map)?;
        analysis.detect_array_accesses(&mut self.map)?;
        mark_hoisted(method, self.options, scope, &mut self.map);
        Ok((site, guard, usedef))
    }

    // =========================================================================
    // Vectorization
    // =========================================================================

    /// Natural loops without nested loops that are still placed and were not
    /// turned into kernels.
    fn collect_simd_loops(&self, method: &Method, offloaded: &[RegionId]) -> Vec<RegionId> {
        let consumed: HashSet<RegionId> = offloaded
            .iter()
            .flat_map(|&r| std::iter::once(r).chain(method.descendants(r)))
            .collect();
        method
            .descendants(method.root)
            .into_iter()
            .filter(|r| !consumed.contains(r))
            .filter(|&r| {
                let region = method.region(r);
                region.is_natural_loop()
                    && region.children.is_empty()
                    && method.layout_position(region.entry).is_some()
            })
            .collect()
    }

    /// Every vectorization check, ending in the rewrite plan.
    fn plan_vectorization(&self, method: &Method, region: RegionId) -> std::result::Result<VectorPlan, Stop> {
        check_loop_shape(method, region)?;
        if method.loop_preheader(region).is_none() {
            return Err(Stop::reject(Stage::Shape, "loop has no preheader"));
        }
        let usedef = UseDefInfo::compute(method);
        let mut analysis = LoopAnalysis::new(method, region, self.options, self.simd, &usedef)?;
        analysis.check_simd_candidate()?;
        VectorPlan::from_analysis(&analysis)
            .ok_or_else(|| Stop::reject(Stage::PerfectNest, "only innermost loops are vectorized"))
    }

    fn vectorize_candidate(&mut self, method: &mut Method, region: RegionId, report: &mut PassReport) -> Result<()> {
        let snapshot = method.clone();
        // Only the vectorizer path creates a missing preheader.
        if method.loop_preheader(region).is_none() && method.create_preheader(region).is_some() {
            debug!("Created a preheader for loop {} in {}", region, method.name);
        }
        let plan = match self.plan_vectorization(method, region) {
            Ok(plan) => plan,
            Err(Stop::Reject(r)) => {
                *method = snapshot;
                self.log_rejection(method, "SIMD loop", &r);
                report.rejections.push((region, r));
                return Ok(());
            }
            Err(Stop::Fatal(msg)) => {
                *method = snapshot;
                return Err(CompilerError::Fatal(msg, None));
            }
        };

        match vectorize_loop(method, &plan) {
            Ok(done) => {
                info!(
                    "Vectorized loop {} in {} with {} lanes",
                    region, method.name, done.lanes
                );
                report.vectorized.push((region, done.region));
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                *method = snapshot;
                Err(e)
            }
            Err(e) => {
                *method = snapshot;
                debug!("Loop {} in {} not vectorized: {}", region, method.name, e);
                Ok(())
            }
        }
    }
}

/// Envelope code on first use, then the launch of one kernel.
fn splice_launch(
    method: &mut Method,
    options: &GpuOptions,
    scope: &mut GpuScope,
    map: &mut SymbolMap,
    site: &LaunchSite,
    kernel: &KernelText,
) -> Result<()> {
    if scope.kind == ScopeKind::NaturalLoop {
        transform_envelope(method, scope)?;
    }
    transform_kernel(method, options, scope, map, site, kernel)
}

/// Outermost forEach and kernel loops below `region`.
fn collect_candidates(method: &Method, region: RegionId, out: &mut Vec<RegionId>) {
    for &child in &method.region(region).children {
        let r = method.region(child);
        let candidate = r.is_natural_loop()
            && matches!(r.origin, LoopOrigin::ParallelForEach | LoopOrigin::SpmdKernel);
        if candidate {
            out.push(child);
        } else {
            collect_candidates(method, child, out);
        }
    }
}

fn outermost_enclosing_loop(method: &Method, region: RegionId) -> Option<RegionId> {
    let mut outer = None;
    let mut current = method.region(region).parent;
    while let Some(r) = current {
        if method.region(r).is_natural_loop() {
            outer = Some(r);
        }
        current = method.region(r).parent;
    }
    outer
}
