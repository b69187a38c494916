use std::collections::HashSet;

use crate::analysis::affine::affine_stride;
use crate::analysis::dependence::{constant_distance, distance_is_safe, DependenceKind};
use crate::analysis::invariance::LoopInfo;
use crate::analysis::offload::{find_try_gpu_guard, scan_cpu_blocks, OffloadAnalysis};
use crate::analysis::reduction::ReductionOp;
use crate::analysis::shape::{check_loop_shape, check_offload_iteration};
use crate::analysis::LoopAnalysis;
use crate::config::{GpuOptions, SimdTarget};
use crate::error::{Check, Stage, Stop};
use crate::ir::builder::MethodBuilder;
use crate::ir::dominators::PostDominators;
use crate::ir::usedef::UseDefInfo;
use crate::ir::{Cond, DataType, LoopOrigin, Method, NodeId, Opcode, RegionId, SymbolId};
use crate::samples;
use crate::symbol_map::{AddrRange, SymbolMap};

fn loops(method: &Method) -> Vec<RegionId> {
    method
        .descendants(method.root)
        .into_iter()
        .filter(|&r| method.region(r).is_natural_loop())
        .collect()
}

fn symbol_named(method: &Method, name: &str) -> SymbolId {
    method
        .symbols
        .iter()
        .find(|(_, s)| s.name == name)
        .map(|(&id, _)| id)
        .unwrap_or_else(|| panic!("no symbol {}", name))
}

fn stage_of(check: Check) -> Option<Stage> {
    match check {
        Ok(()) => None,
        Err(stop) => stop.rejection().map(|r| r.stage),
    }
}

fn simd_check(method: &Method, options: &GpuOptions) -> Check {
    let simd = SimdTarget::default();
    let usedef = UseDefInfo::compute(method);
    let region = loops(method)[0];
    let mut analysis = LoopAnalysis::new(method, region, options, &simd, &usedef)?;
    analysis.check_simd_candidate()
}

/// `acc = combine(acc, a[i])` over an array of `ty`, returning `acc`.
fn reduce_array(
    ty: DataType,
    signature: &str,
    combine: impl FnOnce(&mut MethodBuilder, NodeId, NodeId) -> NodeId,
) -> Method {
    let mut b = MethodBuilder::new("reduce");
    b.set_return_type(ty);
    let a = b.array_parm("a", signature);
    let n = b.parm("n", DataType::Int32);
    let i = b.auto("i", DataType::Int32);
    let acc = b.auto("acc", ty);
    let init = match ty {
        DataType::Float => b.fconst(0.0),
        DataType::Double => b.dconst(0.0),
        _ => b.iconst(0),
    };
    b.store(acc, init);
    let zero = b.iconst(0);
    b.counted_loop(i, zero, n, LoopOrigin::Plain, |b, i| {
        let la = b.load(a);
        let x = b.load_element(la, i, ty);
        let old = b.load(acc);
        let next = combine(b, old, x);
        b.store(acc, next);
    })
    .expect("loop");
    let result = b.load(acc);
    b.ret(Some(result));
    b.finish().expect("build failed")
}

// =============================================================================
// Vectorization checks
// =============================================================================

#[test]
fn test_sum_reduction_is_accepted() {
    let method = samples::sum_of_squares().expect("build failed");
    let options = GpuOptions::default();
    let simd = SimdTarget::default();
    let usedef = UseDefInfo::compute(&method);
    let region = loops(&method)[0];
    let mut analysis = LoopAnalysis::new(&method, region, &options, &simd, &usedef).expect("no induction");
    analysis.check_simd_candidate().expect("rejected");

    assert_eq!(analysis.data_type, Some(DataType::Int32));
    let reductions: Vec<_> = analysis.valid_reductions().map(|r| (r.symbol, r.op)).collect();
    assert_eq!(reductions, vec![(symbol_named(&method, "sum"), ReductionOp::Add)]);
    assert!(analysis.accesses.iter().all(|a| a.stride == Some(4)));
}

#[test]
fn test_product_reduction_is_accepted() {
    let method = reduce_array(DataType::Int32, "[I", |b, acc, x| {
        b.binary(Opcode::Mul, DataType::Int32, acc, x)
    });
    assert_eq!(simd_check(&method, &GpuOptions::default()), Ok(()));
}

#[test]
fn test_reversed_subtraction_is_not_a_reduction() {
    // acc = a[i] - acc flips the sign every iteration.
    let method = reduce_array(DataType::Int32, "[I", |b, acc, x| {
        b.binary(Opcode::Sub, DataType::Int32, x, acc)
    });
    assert_eq!(stage_of(simd_check(&method, &GpuOptions::default())), Some(Stage::DataLocality));
}

#[test]
fn test_float_reduction_needs_opt_in() {
    let method = reduce_array(DataType::Float, "[F", |b, acc, x| {
        b.binary(Opcode::Add, DataType::Float, acc, x)
    });
    assert_eq!(stage_of(simd_check(&method, &GpuOptions::default())), Some(Stage::DataLocality));

    let options = GpuOptions {
        enable_fp_reduction: true,
        ..GpuOptions::default()
    };
    assert_eq!(simd_check(&method, &options), Ok(()));
}

#[test]
fn test_reversed_access_is_dependent() {
    let method = samples::reversed_copy().expect("build failed");
    assert_eq!(stage_of(simd_check(&method, &GpuOptions::default())), Some(Stage::Independence));
}

#[test]
fn test_distinct_arrays_may_alias() {
    // Every int array shares one shadow, so c[i] = a[i] + b[i] cannot prove
    // that c does not overlap a.
    let method = samples::vector_add().expect("build failed");
    assert_eq!(stage_of(simd_check(&method, &GpuOptions::default())), Some(Stage::Independence));
}

#[test]
fn test_loop_without_arrays_is_rejected() {
    let method = reduce_array(DataType::Int32, "[I", |b, acc, _| {
        let one = b.iconst(1);
        b.binary(Opcode::Add, DataType::Int32, acc, one)
    });
    assert_eq!(stage_of(simd_check(&method, &GpuOptions::default())), Some(Stage::DataLocality));
}

#[test]
fn test_dependence_distances() {
    assert!(distance_is_safe(16, DependenceKind::Flow));
    assert!(distance_is_safe(0, DependenceKind::Flow));
    assert!(distance_is_safe(-4, DependenceKind::Flow));
    assert!(!distance_is_safe(4, DependenceKind::Flow));
    assert!(!distance_is_safe(15, DependenceKind::Flow));

    assert!(distance_is_safe(4, DependenceKind::Output));
    assert!(distance_is_safe(-16, DependenceKind::Output));
    assert!(!distance_is_safe(-4, DependenceKind::Output));
}

#[test]
fn test_loop_shape() {
    let mut method = samples::sum_of_squares().expect("build failed");
    let region = loops(&method)[0];
    assert_eq!(check_loop_shape(&method, region), Ok(()));
    assert_eq!(stage_of(check_loop_shape(&method, method.root)), Some(Stage::Shape));

    method.region_mut(region).transaction_start = true;
    assert_eq!(stage_of(check_loop_shape(&method, region)), Some(Stage::Shape));
    method.region_mut(region).transaction_start = false;

    if let Some(iv) = method.region_mut(region).induction.as_mut() {
        iv.increment = 2;
    }
    assert_eq!(stage_of(check_loop_shape(&method, region)), Some(Stage::Shape));
}

/// Replace the condition of the exit test of `region`.
fn set_exit_test(method: &mut Method, region: RegionId, cond: Cond) {
    let branch = method
        .region(region)
        .induction
        .as_ref()
        .and_then(|iv| method.terminator(iv.branch_block))
        .expect("no exit test");
    if let Opcode::If(_, mode) = method.node(branch).op {
        method.node_mut(branch).op = Opcode::If(cond, mode);
    }
}

#[test]
fn test_exit_test_must_be_strict() {
    let mut method = samples::sum_of_squares().expect("build failed");
    let region = loops(&method)[0];
    set_exit_test(&mut method, region, Cond::Le);
    assert_eq!(stage_of(simd_check(&method, &GpuOptions::default())), Some(Stage::IterationPattern));
}

#[test]
fn test_kernel_loop_counts_up() {
    let mut method = samples::vector_add().expect("build failed");
    let region = loops(&method)[0];
    assert_eq!(check_offload_iteration(&method, region), Ok(()));

    set_exit_test(&mut method, region, Cond::Le);
    assert_eq!(stage_of(check_offload_iteration(&method, region)), Some(Stage::Shape));

    set_exit_test(&mut method, region, Cond::Ge);
    if let Some(iv) = method.region_mut(region).induction.as_mut() {
        iv.increment = -1;
    }
    assert_eq!(check_loop_shape(&method, region), Ok(()));
    assert_eq!(stage_of(check_offload_iteration(&method, region)), Some(Stage::Shape));
}

#[test]
fn test_self_referencing_reduction_is_invalid() {
    // sum = sum + a[i] + sum reads sum twice.
    let mut b = MethodBuilder::new("doubled");
    b.set_return_type(DataType::Int32);
    let a = b.array_parm("a", "[I");
    let n = b.parm("n", DataType::Int32);
    let i = b.auto("i", DataType::Int32);
    let sum = b.auto("sum", DataType::Int32);
    let zero = b.iconst(0);
    b.store(sum, zero);
    let zero = b.iconst(0);
    b.counted_loop(i, zero, n, LoopOrigin::Plain, |b, iv| {
        let la = b.load(a);
        let x = b.load_element(la, iv, DataType::Int32);
        let first = b.load(sum);
        let partial = b.binary(Opcode::Add, DataType::Int32, first, x);
        let second = b.load(sum);
        let next = b.binary(Opcode::Add, DataType::Int32, partial, second);
        b.store(sum, next);
    })
    .expect("loop");
    let result = b.load(sum);
    b.ret(Some(result));
    let method = b.finish().expect("build failed");

    let options = GpuOptions::default();
    let simd = SimdTarget::default();
    let usedef = UseDefInfo::compute(&method);
    let region = loops(&method)[0];
    let mut analysis = LoopAnalysis::new(&method, region, &options, &simd, &usedef).expect("no induction");
    assert_eq!(stage_of(analysis.check_simd_candidate()), Some(Stage::DataLocality));
    let sum = symbol_named(&method, "sum");
    assert_eq!(analysis.reductions.get(&sum).map(|r| r.op), Some(ReductionOp::Invalid));
    assert_eq!(analysis.valid_reductions().count(), 0);
}

/// `a[i] = 1; a[i + 4] = 2` over an int array.
fn shifted_stores() -> Method {
    let mut b = MethodBuilder::new("shiftedStores");
    let a = b.array_parm("a", "[I");
    let n = b.parm("n", DataType::Int32);
    let i = b.auto("i", DataType::Int32);
    let zero = b.iconst(0);
    b.counted_loop(i, zero, n, LoopOrigin::Plain, |b, iv| {
        let la = b.load(a);
        let one = b.iconst(1);
        b.store_element(la, iv, DataType::Int32, one);
        let la = b.load(a);
        let li = b.load(i);
        let four = b.iconst(4);
        let shifted = b.binary(Opcode::Add, DataType::Int32, li, four);
        let two = b.iconst(2);
        b.store_element(la, shifted, DataType::Int32, two);
    })
    .expect("loop");
    b.ret(None);
    b.finish().expect("build failed")
}

/// Address operands of the indirect loads and stores of a loop, in tree order.
fn indirect_addresses(method: &Method, info: &LoopInfo) -> Vec<NodeId> {
    let mut out = Vec::new();
    method.walk_postorder(&info.trees(method), &mut |_, node| {
        if matches!(node.op, Opcode::LoadIndirect | Opcode::StoreIndirect) {
            out.extend(node.child(0));
        }
    });
    out
}

#[test]
fn test_shifted_stores_are_independent() {
    let method = shifted_stores();
    assert_eq!(simd_check(&method, &GpuOptions::default()), Ok(()));
}

#[test]
fn test_constant_distance() {
    let method = shifted_stores();
    let info = LoopInfo::new(&method, loops(&method)[0]);
    let addrs = indirect_addresses(&method, &info);
    assert_eq!(addrs.len(), 2);
    // Each store loads the array on its own.
    let base = |addr: NodeId| method.node(addr).child(0).expect("no base");
    assert_ne!(base(addrs[0]), base(addrs[1]));

    assert_eq!(constant_distance(&method, &info, addrs[0], addrs[1]), Some(-16));
    assert_eq!(constant_distance(&method, &info, addrs[1], addrs[0]), Some(16));
    assert_eq!(constant_distance(&method, &info, addrs[0], addrs[0]), Some(0));
    assert!(distance_is_safe(-16, DependenceKind::Output));

    let method = samples::vector_add().expect("build failed");
    let info = LoopInfo::new(&method, loops(&method)[0]);
    let addrs = indirect_addresses(&method, &info);
    assert_eq!(addrs.len(), 3);
    for (x, &a) in addrs.iter().enumerate() {
        for &b in &addrs[x + 1..] {
            assert_eq!(constant_distance(&method, &info, a, b), None);
        }
    }
}

#[test]
fn test_affine_stride() {
    let mut b = MethodBuilder::new("strides");
    let a = b.array_parm("a", "[I");
    let n = b.parm("n", DataType::Int32);
    let i = b.auto("i", DataType::Int32);
    let j = b.auto("j", DataType::Int32);
    let zero = b.iconst(0);
    b.store(j, zero);
    let zero = b.iconst(0);
    let mut exprs = Vec::new();
    b.counted_loop(i, zero, n, LoopOrigin::Plain, |b, iv| {
        // 3 * i + 5
        let three = b.iconst(3);
        let scaled = b.binary(Opcode::Mul, DataType::Int32, three, iv);
        let five = b.iconst(5);
        exprs.push(b.binary(Opcode::Add, DataType::Int32, scaled, five));
        // i * 4 - n
        let li = b.load(i);
        let four = b.iconst(4);
        let scaled = b.binary(Opcode::Mul, DataType::Int32, li, four);
        let ln = b.load(n);
        exprs.push(b.binary(Opcode::Sub, DataType::Int32, scaled, ln));
        // i * i
        let (x, y) = (b.load(i), b.load(i));
        exprs.push(b.binary(Opcode::Mul, DataType::Int32, x, y));
        // i * a[j]
        let la = b.load(a);
        let lj = b.load(j);
        let aj = b.load_element(la, lj, DataType::Int32);
        let li = b.load(i);
        exprs.push(b.binary(Opcode::Mul, DataType::Int32, li, aj));
    })
    .expect("loop");
    b.ret(None);
    let method = b.finish().expect("build failed");

    let info = LoopInfo::new(&method, loops(&method)[0]);
    let strides: Vec<_> = exprs
        .iter()
        .map(|&e| affine_stride(&method, &info, i, e))
        .collect();
    assert_eq!(strides, vec![Some(3), Some(4), None, None]);
}

// =============================================================================
// Offload analysis
// =============================================================================

fn map_loop(method: &Method, options: &GpuOptions, map: &mut SymbolMap) -> Result<bool, Stop> {
    let region = loops(method)[0];
    let preheader = method.loop_preheader(region).expect("no preheader");
    let usedef = UseDefInfo::compute(method);
    let postdom = PostDominators::compute(method);
    let mut analysis = OffloadAnalysis::new(method, region, preheader, options, &usedef, &postdom)?;
    analysis.map_symbols(map)?;
    analysis.detect_array_accesses(map)
}

#[test]
fn test_vector_add_symbol_mapping() {
    let method = samples::vector_add().expect("build failed");
    let mut map = SymbolMap::new();
    let not_found = map_loop(&method, &GpuOptions::default(), &mut map).expect("rejected");
    assert!(!not_found);

    let (a, b, c, n) = (
        symbol_named(&method, "a"),
        symbol_named(&method, "b"),
        symbol_named(&method, "c"),
        symbol_named(&method, "n"),
    );
    // Slots follow the order in which the body references the arrays.
    assert_eq!(map.parameter_symbols(), vec![c, a, b]);
    // The bound only appears in the exit test.
    assert!(!map.contains(n));
    assert_eq!(map.autos, vec![symbol_named(&method, "i")]);

    for read in [a, b] {
        let entry = map.get(read).expect("unmapped");
        assert!(entry.reads() && !entry.writes());
        assert!(matches!(entry.rhs, AddrRange::Expr(_)));
        assert_eq!(entry.element_size, 4);
    }
    let out = map.get(c).expect("unmapped");
    assert!(out.writes() && !out.reads());
    assert!(matches!(out.lhs, AddrRange::Expr(_)));
}

#[test]
fn test_transfer_elimination_disabled_copies_everything() {
    let method = samples::vector_add().expect("build failed");
    let options = GpuOptions {
        disable_data_transfer_elimination: true,
        ..GpuOptions::default()
    };
    let mut map = SymbolMap::new();
    map_loop(&method, &options, &mut map).expect("rejected");
    for entry in map.parameters() {
        assert!(entry.reads() && entry.writes());
        assert_eq!(entry.rhs, AddrRange::NotYetSeen);
    }
}

#[test]
fn test_unresolved_call_is_rejected() {
    let mut b = MethodBuilder::new("lazy");
    let a = b.array_parm("a", "[I");
    let n = b.parm("n", DataType::Int32);
    let i = b.auto("i", DataType::Int32);
    let callee = b.unresolved_method("Foo", "later", DataType::Int32);
    let zero = b.iconst(0);
    b.counted_loop(i, zero, n, LoopOrigin::SpmdKernel, |b, i| {
        let r = b.call(callee, vec![i]);
        let la = b.load(a);
        b.store_element(la, i, DataType::Int32, r);
    })
    .expect("loop");
    b.ret(None);
    let method = b.finish().expect("build failed");

    let mut map = SymbolMap::new();
    let stop = map_loop(&method, &GpuOptions::default(), &mut map).expect_err("accepted");
    let rejection = stop.rejection().expect("not a rejection");
    assert_eq!(rejection.stage, Stage::SymbolMapping);
    assert!(rejection.reason.contains("later"));
}

#[test]
fn test_resolved_call_maps() {
    let method = samples::foreign_call().expect("build failed");
    let mut map = SymbolMap::new();
    map_loop(&method, &GpuOptions::default(), &mut map).expect("rejected");
    assert_eq!(map.parameters().len(), 2);
}

#[test]
fn test_try_gpu_guard() {
    let method = samples::vector_add().expect("build failed");
    let region = loops(&method)[0];
    let preheader = method.loop_preheader(region).expect("no preheader");

    let guard = find_try_gpu_guard(&method, preheader, &HashSet::new()).expect("no guard");
    assert_eq!(Some(guard.block), method.entry_block());
    let cpu_call = method.block(guard.cpu_block).trees.iter().any(|&t| {
        let node = method.node(t);
        node.op == Opcode::TreeTop
            && node
                .child(0)
                .is_some_and(|c| method.node(c).op == Opcode::Call)
    });
    assert!(cpu_call, "{}", method.dump());

    // Once flipped, the CPU path is the fall-through.
    let reversed = HashSet::from([guard.branch]);
    let flipped = find_try_gpu_guard(&method, preheader, &reversed).expect("no guard");
    assert_eq!(Some(flipped.cpu_block), method.layout_next(guard.block));
}

#[test]
fn test_missing_try_gpu_guard() {
    let method = samples::reversed_copy().expect("build failed");
    let region = loops(&method)[0];
    let preheader = method.loop_preheader(region).expect("no preheader");
    let err = find_try_gpu_guard(&method, preheader, &HashSet::new()).expect_err("found a guard");
    assert_eq!(err.rejection().map(|r| r.stage), Some(Stage::TryGpuGuard));
}

// =============================================================================
// CPU blocks of a natural-loop scope
// =============================================================================

/// `for (j < m) { cpu_work; for (i < n) a[i] = 1; }` with the inner loop
/// marked as a kernel.
fn envelope_with(pipeline: bool, cpu_work: impl FnOnce(&mut MethodBuilder, SymbolId, NodeId)) -> Method {
    let mut b = MethodBuilder::new("envelope");
    let a = b.array_parm("a", "[I");
    let n = b.parm("n", DataType::Int32);
    let m = b.parm("m", DataType::Int32);
    let i = b.auto("i", DataType::Int32);
    let j = b.auto("j", DataType::Int32);
    let zero = b.iconst(0);
    b.counted_loop(j, zero, m, LoopOrigin::Plain, |b, j| {
        if pipeline {
            let block = b.current_block();
            b.set_pipeline(block);
        }
        cpu_work(b, a, j);
        let zero = b.iconst(0);
        b.counted_loop(i, zero, n, LoopOrigin::SpmdKernel, |b, i| {
            let la = b.load(a);
            let one = b.iconst(1);
            b.store_element(la, i, DataType::Int32, one);
        })
        .expect("inner loop");
    })
    .expect("outer loop");
    b.ret(None);
    b.finish().expect("build failed")
}

fn scan(method: &Method) -> Result<Vec<crate::ir::BlockId>, Stop> {
    let outer = loops(method)
        .into_iter()
        .find(|&r| !method.region(r).children.is_empty())
        .expect("no envelope");
    let kernels = method.region(outer).children.clone();
    scan_cpu_blocks(method, outer, &kernels)
}

#[test]
fn test_quiet_envelope() {
    let method = envelope_with(false, |_, _, _| {});
    assert_eq!(scan(&method), Ok(vec![]));
}

#[test]
fn test_library_calls_are_tolerated() {
    let method = envelope_with(false, |b, _, j| {
        let abs = b.method_symbol("java/lang/Math", "abs", DataType::Int32, None);
        let call = b.call(abs, vec![j]);
        b.treetop(call);
    });
    assert_eq!(scan(&method), Ok(vec![]));
}

#[test]
fn test_user_call_races_with_transfers() {
    let method = envelope_with(false, |b, _, _| {
        let log = b.method_symbol("Foo", "log", DataType::NoType, None);
        let call = b.call(log, vec![]);
        b.treetop(call);
    });
    let err = scan(&method).expect_err("accepted");
    assert_eq!(err.rejection().map(|r| r.stage), Some(Stage::CpuBlockScan));
}

#[test]
fn test_cpu_array_access() {
    let store = |b: &mut MethodBuilder, a: SymbolId, j: NodeId| {
        let la = b.load(a);
        let zero = b.iconst(0);
        b.store_element(la, j, DataType::Int32, zero);
    };
    let method = envelope_with(false, store);
    let err = scan(&method).expect_err("accepted");
    assert_eq!(err.rejection().map(|r| r.stage), Some(Stage::CpuBlockScan));

    // Inside the forEach pipeline the block is flushed instead.
    let method = envelope_with(true, store);
    let flush = scan(&method).expect("rejected");
    assert_eq!(flush.len(), 1);
    assert!(method.block(flush[0]).pipeline);
}

#[test]
fn test_cold_loop_is_skipped_and_flushed() {
    let method = envelope_with(false, |b, _, _| {
        let k = b.auto("k", DataType::Int32);
        let c = b.parm("c", DataType::Int32);
        let zero = b.iconst(0);
        b.counted_loop(k, zero, c, LoopOrigin::Plain, |b, _| {
            let block = b.current_block();
            b.set_cold(block);
            let log = b.method_symbol("Foo", "log", DataType::NoType, None);
            let call = b.call(log, vec![]);
            b.treetop(call);
        })
        .expect("cold loop");
    });
    let outer = loops(&method)
        .into_iter()
        .find(|&r| !method.region(r).children.is_empty())
        .expect("no envelope");
    let (kernels, cold): (Vec<RegionId>, Vec<RegionId>) = method
        .region(outer)
        .children
        .iter()
        .partition(|&&r| method.region(r).origin == LoopOrigin::SpmdKernel);
    assert_eq!(cold.len(), 1);

    // The user call sits in a cold loop, so only that loop's preheader is flushed.
    let flush = scan_cpu_blocks(&method, outer, &kernels).expect("rejected");
    assert_eq!(flush, vec![method.loop_preheader(cold[0]).expect("no preheader")]);
}
