// =============================================================================
// End-to-end tests of the parallelizer over the sample methods
// =============================================================================

use crate::config::{GpuOptions, ObjectModel, SimdTarget, StaticDevice};
use crate::error::{CompilerError, Stage};
use crate::host_transform::GPU_RUNTIME;
use crate::ir::{Cond, Method, Opcode, RegionId};
use crate::parallelizer::{Parallelizer, PassReport};
use crate::samples::{self, Scenario};
use crate::supervisor::{CompilationSupervisor, GpuScope, LocalSupervisor, ScopeKind};
use crate::Result;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn gpu_options() -> GpuOptions {
    GpuOptions {
        enable_gpu: true,
        ..GpuOptions::default()
    }
}

fn run(method: &mut Method, options: &GpuOptions) -> Result<PassReport> {
    run_on(method, options, &StaticDevice::default())
}

fn run_on(method: &mut Method, options: &GpuOptions, device: &StaticDevice) -> Result<PassReport> {
    init_logging();
    let object_model = ObjectModel::default();
    let simd = SimdTarget::default();
    let mut supervisor = LocalSupervisor::new();
    let mut pass = Parallelizer::new(options, &object_model, &simd, device, &mut supervisor);
    pass.perform(method)
}

/// Names of the runtime helpers a method calls, in node order.
fn runtime_calls(method: &Method) -> Vec<String> {
    method
        .nodes
        .values()
        .filter(|n| n.op == Opcode::Call)
        .filter_map(|n| n.symbol)
        .map(|s| method.symbol(s))
        .filter(|s| s.class_name() == Some(GPU_RUNTIME))
        .map(|s| s.name.clone())
        .collect()
}

fn count(calls: &[String], name: &str) -> usize {
    calls.iter().filter(|c| *c == name).count()
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_every_scenario_builds() {
    for scenario in Scenario::ALL {
        let method = scenario.build().expect("build failed");
        assert!(!method.layout.is_empty(), "{} has no blocks", scenario);
        assert_eq!(scenario.name().parse::<Scenario>(), Ok(scenario));
    }
    assert!("matrix-multiply".parse::<Scenario>().is_err());
}

#[test]
fn test_vector_add_offloaded() {
    let mut method = samples::vector_add().expect("build failed");
    let report = run(&mut method, &gpu_options()).expect("pass failed");

    assert_eq!(report.offloaded.len(), 1);
    assert_eq!(report.kernels.len(), 1);
    assert_eq!(report.kernels[0].kernel_id, 0);
    assert!(report.kernels[0].text.contains("define void @test0("));
    assert!(report.gpu_errors.is_empty());
    assert!(report.vectorized.is_empty());

    let calls = runtime_calls(&method);
    assert_eq!(count(&calls, "launchGPU"), 1);
    assert_eq!(count(&calls, "regionEntryGPU"), 1);
    assert_eq!(count(&calls, "copyToGPU"), 3);
}

#[test]
fn test_gpu_disabled_leaves_for_each_alone() {
    let mut method = samples::vector_add().expect("build failed");
    let report = run(&mut method, &GpuOptions::default()).expect("pass failed");
    assert!(report.kernels.is_empty());
    assert!(runtime_calls(&method).is_empty());
}

#[test]
fn test_sum_of_squares_vectorized() {
    let mut method = samples::sum_of_squares().expect("build failed");
    let report = run(&mut method, &GpuOptions::default()).expect("pass failed");

    assert_eq!(report.vectorized.len(), 1);
    let (scalar, vector) = report.vectorized[0];
    assert_ne!(scalar, vector);
    assert_eq!(
        method.region(vector).induction.as_ref().map(|iv| iv.increment),
        Some(4)
    );
    assert!(report.kernels.is_empty());
}

#[test]
fn test_auto_simd_disabled() {
    let mut method = samples::sum_of_squares().expect("build failed");
    let original = method.clone();
    let options = GpuOptions {
        disable_auto_simd: true,
        ..GpuOptions::default()
    };
    let report = run(&mut method, &options).expect("pass failed");
    assert!(report.vectorized.is_empty());
    assert_eq!(method, original);
}

#[test]
fn test_reversed_copy_rejected() {
    let mut method = samples::reversed_copy().expect("build failed");
    let original = method.clone();
    let report = run(&mut method, &gpu_options()).expect("pass failed");

    assert!(report.vectorized.is_empty());
    assert_eq!(report.rejections.len(), 1);
    assert_eq!(report.rejections[0].1.stage, Stage::Independence);
    assert_eq!(method, original);
}

#[test]
fn test_foreign_call_stays_on_cpu() {
    let mut method = samples::foreign_call().expect("build failed");
    let original = method.clone();
    let report = run(&mut method, &gpu_options()).expect("pass failed");

    assert!(report.offloaded.is_empty());
    assert_eq!(report.gpu_errors.len(), 1);
    match &report.gpu_errors[0] {
        CompilerError::InvalidProgram(msg, _) => assert!(msg.contains("unrecognized method compute")),
        other => panic!("expected InvalidProgram, got {:?}", other),
    }
    assert!(report.vectorized.is_empty());
    assert_eq!(method, original);
}

#[test]
fn test_natural_scope_hoists_transfers() {
    let mut method = samples::natural_scope().expect("build failed");
    let report = run(&mut method, &gpu_options()).expect("pass failed");

    assert_eq!(report.offloaded.len(), 1);
    let calls = runtime_calls(&method);
    // Entered once around the outer loop, not per launch.
    assert_eq!(count(&calls, "regionEntryGPU"), 1);
    assert_eq!(count(&calls, "regionExitGPU"), 1);
    assert_eq!(count(&calls, "launchGPU"), 1);
    // Both arrays are invariant in the outer loop, so nothing is copied back per launch.
    assert_eq!(count(&calls, "copyFromGPU"), 0);
    assert_eq!(count(&calls, "invalidateGPU"), 0);
}

#[test]
fn test_kernel_method_compiled_whole() {
    let mut method = samples::kernel_method().expect("build failed");
    let report = run(&mut method, &gpu_options()).expect("pass failed");
    assert_eq!(report.kernels.len(), 1);
    assert!(report.kernels[0].text.contains("define void @test0(i8* %p0, i32 %p1, i8* %ExceptionKind)"));
    assert!(report.offloaded.is_empty());
}

fn first_loop(method: &Method) -> RegionId {
    method
        .descendants(method.root)
        .into_iter()
        .find(|&r| method.region(r).is_natural_loop())
        .expect("no loop")
}

#[test]
fn test_decrementing_for_each_stays_on_cpu() {
    let mut method = samples::vector_add().expect("build failed");
    let region = first_loop(&method);
    let branch = method
        .region(region)
        .induction
        .as_ref()
        .and_then(|iv| method.terminator(iv.branch_block))
        .expect("no exit test");
    if let Opcode::If(_, mode) = method.node(branch).op {
        method.node_mut(branch).op = Opcode::If(Cond::Ge, mode);
    }
    if let Some(iv) = method.region_mut(region).induction.as_mut() {
        iv.increment = -1;
    }
    let original = method.clone();

    let report = run(&mut method, &gpu_options()).expect("pass failed");
    assert!(report.offloaded.is_empty());
    assert!(report.kernels.is_empty());
    assert!(report
        .rejections
        .iter()
        .any(|(r, rejection)| *r == region && rejection.stage == Stage::Shape));
    assert!(runtime_calls(&method).is_empty());
    assert_eq!(method, original);
}

// =============================================================================
// Failures and driver state
// =============================================================================

#[test]
fn test_device_query_failure_falls_back() {
    let mut method = samples::vector_add().expect("build failed");
    let original = method.clone();
    let device = StaticDevice {
        compute_capability: None,
        ..StaticDevice::default()
    };
    let report = run_on(&mut method, &gpu_options(), &device).expect("pass failed");

    assert!(report.kernels.is_empty());
    assert!(matches!(report.gpu_errors.as_slice(), [CompilerError::HelperError(_)]));
    assert_eq!(method, original);
}

#[test]
fn test_interrupted_compilation() {
    init_logging();
    let mut method = samples::sum_of_squares().expect("build failed");
    let original = method.clone();
    let options = GpuOptions::default();
    let object_model = ObjectModel::default();
    let simd = SimdTarget::default();
    let device = StaticDevice::default();
    let mut supervisor = LocalSupervisor::new();
    supervisor.interrupt(3);

    let mut pass = Parallelizer::new(&options, &object_model, &simd, &device, &mut supervisor);
    match pass.perform(&mut method) {
        Err(CompilerError::Interrupted(code)) => assert_eq!(code, 3),
        other => panic!("expected interruption, got {:?}", other.map(|r| r.kernels.len())),
    }
    assert_eq!(method, original);
}

#[test]
fn test_kernel_ids_increase_across_methods() {
    init_logging();
    let options = gpu_options();
    let object_model = ObjectModel::default();
    let simd = SimdTarget::default();
    let device = StaticDevice::default();
    let mut supervisor = LocalSupervisor::new();
    let mut pass = Parallelizer::new(&options, &object_model, &simd, &device, &mut supervisor);

    let mut first = samples::vector_add().expect("build failed");
    let mut second = samples::kernel_method().expect("build failed");
    let a = pass.perform(&mut first).expect("pass failed");
    let b = pass.perform(&mut second).expect("pass failed");
    assert_eq!(a.kernels[0].kernel_id, 0);
    assert_eq!(b.kernels[0].kernel_id, 1);
    assert_eq!(pass.ptx_count(), 2);
}

#[test]
fn test_failed_splice_keeps_kernel_id() {
    init_logging();
    let options = gpu_options();
    let object_model = ObjectModel::default();
    let simd = SimdTarget::default();
    let device = StaticDevice::default();
    let mut supervisor = LocalSupervisor::new();
    let mut pass = Parallelizer::new(&options, &object_model, &simd, &device, &mut supervisor);

    let mut method = samples::vector_add().expect("build failed");
    let original = method.clone();
    let kernel = first_loop(&method);
    // The method body has no preheader, so entering the scope fails after the
    // kernel is rendered.
    let mut scope = GpuScope::new(ScopeKind::NaturalLoop, method.root, vec![kernel]);
    let outcome = pass.try_offload_loop(&mut method, &mut scope, kernel);
    assert!(matches!(outcome, Err(CompilerError::Fatal(..))));
    assert_eq!(pass.ptx_count(), 0);
    assert_eq!(method, original);

    let mut next = samples::kernel_method().expect("build failed");
    let report = pass.perform(&mut next).expect("pass failed");
    assert_eq!(report.kernels[0].kernel_id, 0);
    assert_eq!(pass.ptx_count(), 1);
}

#[test]
fn test_supervisor_state() {
    let mut supervisor = LocalSupervisor::new();
    assert_eq!(supervisor.inc_visit_epoch(), 1);
    assert_eq!(supervisor.inc_visit_epoch(), 2);

    let method = samples::vector_add().expect("build failed");
    let root = method.root;
    let region = supervisor.memory_region();
    let id = region.alloc_scope(GpuScope::new(ScopeKind::SingleKernel, root, vec![root]));
    assert_eq!(region.scope(id).kind, ScopeKind::SingleKernel);
    region.reset();
    assert!(region.scope_ids().is_empty());

    let flag = supervisor.interrupt_flag();
    flag.store(7, std::sync::atomic::Ordering::Relaxed);
    assert_eq!(supervisor.compilation_should_be_interrupted(), 7);
}

#[test]
fn test_options_from_json() {
    let options = GpuOptions::from_json(r#"{ "enable_gpu": true, "force": true }"#).expect("parse failed");
    assert!(options.enable_gpu);
    assert!(options.force);
    assert!(!options.enable_math);

    let err = GpuOptions::from_json("{ \"enable_gpu\": 1 }").expect_err("parsed");
    assert!(matches!(err, CompilerError::Config(_)));
}

/// Drop the empty preheader of the first loop so the guard enters it directly.
fn without_preheader(method: &mut Method) {
    let region = method
        .descendants(method.root)
        .into_iter()
        .find(|&r| method.region(r).is_natural_loop())
        .expect("no loop");
    let preheader = method.loop_preheader(region).expect("no preheader");
    let owner = method.region_of(preheader).expect("unowned preheader");
    method.layout.retain(|&b| b != preheader);
    method.region_mut(owner).blocks.retain(|&b| b != preheader);
    assert_eq!(method.loop_preheader(region), None);
}

#[test]
fn test_vectorizer_creates_preheader() {
    let mut method = samples::sum_of_squares().expect("build failed");
    without_preheader(&mut method);
    let report = run(&mut method, &GpuOptions::default()).expect("pass failed");
    assert_eq!(report.vectorized.len(), 1);
}

#[test]
fn test_created_preheader_dropped_on_rejection() {
    let mut method = samples::reversed_copy().expect("build failed");
    without_preheader(&mut method);
    let original = method.clone();

    let report = run(&mut method, &GpuOptions::default()).expect("pass failed");
    assert_eq!(report.rejections.len(), 1);
    assert_eq!(method, original);
}

#[test]
fn test_host_without_simd() {
    init_logging();
    let mut method = samples::sum_of_squares().expect("build failed");
    let original = method.clone();
    let options = GpuOptions::default();
    let object_model = ObjectModel::default();
    let simd = SimdTarget::none();
    let device = StaticDevice::default();
    let mut supervisor = LocalSupervisor::new();
    let mut pass = Parallelizer::new(&options, &object_model, &simd, &device, &mut supervisor);
    let report = pass.perform(&mut method).expect("pass failed");
    assert!(report.vectorized.is_empty());
    assert_eq!(method, original);
}
