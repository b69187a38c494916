use std::collections::HashSet;

use crate::analysis::offload::OffloadAnalysis;
use crate::config::GpuOptions;
use crate::emit::KernelText;
use crate::host_transform::{
    mark_hoisted, nested_trip_counts, reverse_try_gpu_guard, transform_envelope, transform_kernel, LaunchSite,
    GPU_RUNTIME,
};
use crate::ir::builder::MethodBuilder;
use crate::ir::dominators::PostDominators;
use crate::ir::usedef::UseDefInfo;
use crate::ir::{DataType, Literal, LoopOrigin, Method, NodeId, Opcode, RegionId, SymbolId};
use crate::samples;
use crate::supervisor::{GpuScope, ScopeKind};
use crate::symbol_map::SymbolMap;

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

fn map_loop(method: &Method, region: RegionId, options: &GpuOptions) -> SymbolMap {
    let preheader = method.loop_preheader(region).expect("no preheader");
    let usedef = UseDefInfo::compute(method);
    let postdom = PostDominators::compute(method);
    let mut map = SymbolMap::new();
    let mut analysis =
        OffloadAnalysis::new(method, region, preheader, options, &usedef, &postdom).expect("no induction");
    analysis.map_symbols(&mut map).expect("mapping rejected");
    analysis.detect_array_accesses(&mut map).expect("access rejected");
    map
}

fn kernel(kernel_id: u32) -> KernelText {
    KernelText {
        kernel_id,
        text: String::new(),
        has_exception_checks: true,
        null_check_arguments: 0,
    }
}

/// Runtime helper calls in layout order.
fn runtime_calls(method: &Method) -> Vec<(String, NodeId)> {
    let mut calls = Vec::new();
    let mut seen = HashSet::new();
    for &b in &method.layout {
        for &t in &method.block(b).trees {
            let mut stack = vec![t];
            while let Some(id) = stack.pop() {
                if !seen.insert(id) {
                    continue;
                }
                let node = method.node(id);
                if node.op == Opcode::Call {
                    if let Some(sym) = node.symbol {
                        let callee = method.symbol(sym);
                        if callee.class_name() == Some(GPU_RUNTIME) {
                            calls.push((callee.name.clone(), id));
                        }
                    }
                }
                stack.extend(node.children.iter().rev());
            }
        }
    }
    calls
}

fn names(calls: &[(String, NodeId)]) -> Vec<&str> {
    calls.iter().map(|(n, _)| n.as_str()).collect()
}

/// Offload the vector_add loop as a single-kernel scope.
fn offload_vector_add(options: &GpuOptions) -> (Method, LaunchSite, SymbolMap, GpuScope) {
    let mut method = samples::vector_add().expect("build failed");
    let region = loops(&method)[0];
    let mut map = map_loop(&method, region, options);
    let site = LaunchSite::find(&method, region).expect("no launch site");
    let mut scope = GpuScope::new(ScopeKind::SingleKernel, region, vec![region]);
    transform_kernel(&mut method, options, &mut scope, &mut map, &site, &kernel(5)).expect("transform failed");
    (method, site, map, scope)
}

// =============================================================================
// Launch site
// =============================================================================

#[test]
fn test_launch_site() {
    let method = samples::vector_add().expect("build failed");
    let region = loops(&method)[0];
    let site = LaunchSite::find(&method, region).expect("no launch site");
    assert_eq!(site.region, region);
    assert_eq!(Some(site.preheader), method.loop_preheader(region));
    assert_eq!(site.entry, method.region(region).entry);
    assert_eq!(method.exit_edges(region), vec![(site.entry, site.exit)]);
}

// =============================================================================
// Single-kernel launch
// =============================================================================

#[test]
fn test_single_kernel_launch_sequence() {
    let (method, site, _, scope) = offload_vector_add(&GpuOptions::default());
    let calls = runtime_calls(&method);
    // Parameters in slot order are c, a, b; only c is written.
    assert_eq!(
        names(&calls),
        vec![
            "regionEntryGPU",
            "estimateGPU",
            "copyToGPU",
            "copyToGPU",
            "copyToGPU",
            "allocateGPUKernelParms",
            "launchGPU",
            "copyFromGPU",
            "invalidateGPU",
            "invalidateGPU",
            "regionExitGPU",
            "getStateGPU",
            "regionExitGPU",
        ]
    );

    // The preheader no longer enters the loop directly.
    assert_ne!(method.successors(site.preheader), vec![site.entry]);
    assert!(scope.scope_sym.is_some());
    assert!(scope.live_sym.is_some());
    assert_eq!(scope.exit_points.len(), 1);

    // The CPU fallback leaves the region and runs the original loop.
    let cpu = *method.layout.iter().rev().find(|&&b| {
        method
            .last_tree(b)
            .is_some_and(|t| method.node(t).op == Opcode::Goto && method.node(t).target == Some(site.entry))
    })
    .expect("no CPU fallback");
    assert_eq!(method.successors(cpu), vec![site.entry]);
}

#[test]
fn test_launch_arguments() {
    let (method, _, _, _) = offload_vector_add(&GpuOptions::default());
    let calls = runtime_calls(&method);
    let (_, launch) = calls.iter().find(|(n, _)| n == "launchGPU").expect("no launch");
    let args = &method.node(*launch).children;
    assert_eq!(args.len(), 8);
    // parameter count, kernel id and exception flag
    assert_eq!(method.node(args[3]).literal, Some(Literal::Int(3)));
    assert_eq!(method.node(args[5]).literal, Some(Literal::Int(5)));
    assert_eq!(method.node(args[7]).literal, Some(Literal::Int(1)));
}

#[test]
fn test_forced_launch_skips_estimate() {
    let options = GpuOptions {
        force: true,
        ..GpuOptions::default()
    };
    let (method, _, _, _) = offload_vector_add(&options);
    let calls = runtime_calls(&method);
    assert!(!names(&calls).contains(&"estimateGPU"));
    assert_eq!(names(&calls).first().copied(), Some("regionEntryGPU"));
}

#[test]
fn test_temps_recorded_in_map() {
    let (method, _, map, _) = offload_vector_add(&GpuOptions::default());
    for name in ["a", "b", "c"] {
        let entry = map.get(symbol_named(&method, name)).expect("unmapped array");
        assert!(entry.host_temp.is_some(), "{} has no host temp", name);
        let dev = entry.dev_temp.expect("no device temp");
        assert_eq!(method.symbol(dev).name, format!("{}.dev", name));
    }
}

#[test]
fn test_transfer_range_of_affine_access() {
    let (method, _, _, _) = offload_vector_add(&GpuOptions::default());
    let calls = runtime_calls(&method);
    for (_, call) in calls.iter().filter(|(n, _)| n == "copyToGPU") {
        let args = &method.node(*call).children;
        // [start, end) comes from the access, not the whole-array marker.
        assert_ne!(method.node(args[4]).literal, Some(Literal::Int(-1)));
    }
}

#[test]
fn test_whole_array_transfer_without_elimination() {
    let options = GpuOptions {
        disable_data_transfer_elimination: true,
        ..GpuOptions::default()
    };
    let (method, _, _, _) = offload_vector_add(&options);
    let calls = runtime_calls(&method);
    let (_, copy) = calls.iter().find(|(n, _)| n == "copyToGPU").expect("no copy");
    let args = &method.node(*copy).children;
    assert_eq!(method.node(args[3]).literal, Some(Literal::Int(0)));
    assert_eq!(method.node(args[4]).literal, Some(Literal::Int(-1)));
}

// =============================================================================
// Hoisting and natural-loop scopes
// =============================================================================

#[test]
fn test_invariant_arrays_are_hoisted() {
    let method = samples::natural_scope().expect("build failed");
    let regions = loops(&method);
    let outer = regions
        .iter()
        .copied()
        .find(|&r| !method.region(r).children.is_empty())
        .expect("no outer loop");
    let inner = method.region(outer).children[0];
    let scope = GpuScope::new(ScopeKind::NaturalLoop, outer, vec![inner]);

    let options = GpuOptions::default();
    let mut map = map_loop(&method, inner, &options);
    mark_hoisted(&method, &options, &scope, &mut map);
    assert!(map.get(symbol_named(&method, "a")).expect("a").hoist);
    assert!(map.get(symbol_named(&method, "b")).expect("b").hoist);

    let options = GpuOptions {
        disable_transfer_hoist: true,
        ..GpuOptions::default()
    };
    let mut map = map_loop(&method, inner, &options);
    mark_hoisted(&method, &options, &scope, &mut map);
    assert!(map.iter().all(|e| !e.hoist));
}

#[test]
fn test_single_kernel_scope_never_hoists() {
    let method = samples::vector_add().expect("build failed");
    let region = loops(&method)[0];
    let scope = GpuScope::new(ScopeKind::SingleKernel, region, vec![region]);
    let options = GpuOptions::default();
    let mut map = map_loop(&method, region, &options);
    mark_hoisted(&method, &options, &scope, &mut map);
    assert!(map.iter().all(|e| !e.hoist));
}

#[test]
fn test_envelope_entered_once() {
    let mut method = samples::natural_scope().expect("build failed");
    let regions = loops(&method);
    let outer = regions
        .iter()
        .copied()
        .find(|&r| !method.region(r).children.is_empty())
        .expect("no outer loop");
    let inner = method.region(outer).children[0];
    let mut scope = GpuScope::new(ScopeKind::NaturalLoop, outer, vec![inner]);
    let first = method.entry_block().expect("no entry");
    scope.flush_blocks.push(first);

    transform_envelope(&mut method, &mut scope).expect("transform failed");
    assert!(scope.transformed);
    assert_eq!(scope.exit_points.len(), 1);
    let (exit, _) = scope.exit_points[0];
    assert_eq!(method.region_of(exit), Some(method.root));

    let calls = runtime_calls(&method);
    assert_eq!(names(&calls), vec!["flushGPU", "regionEntryGPU", "regionExitGPU"]);

    // A second kernel of the same scope leaves the envelope alone.
    transform_envelope(&mut method, &mut scope).expect("transform failed");
    assert_eq!(runtime_calls(&method).len(), 3);
}

#[test]
fn test_try_gpu_guard_reversed_once() {
    let mut method = samples::vector_add().expect("build failed");
    let first = method.entry_block().expect("no entry");
    let branch = method.terminator(first).expect("no guard");
    let Opcode::If(cond, mode) = method.node(branch).op else {
        panic!("guard is not a conditional branch");
    };

    let mut reversed = HashSet::new();
    reverse_try_gpu_guard(&mut method, branch, &mut reversed);
    reverse_try_gpu_guard(&mut method, branch, &mut reversed);
    assert_eq!(method.node(branch).op, Opcode::If(cond.reversed(), mode));
    assert!(reversed.contains(&branch));
}

// =============================================================================
// Cost estimate
// =============================================================================

/// A forEach over `n` holding a loop to `m` and a loop to `i`.
fn nested_bounds() -> (Method, RegionId, RegionId, RegionId) {
    let mut b = MethodBuilder::new("nestedBounds");
    let n = b.parm("n", DataType::Int32);
    let m = b.parm("m", DataType::Int32);
    let i = b.auto("i", DataType::Int32);
    let j = b.auto("j", DataType::Int32);
    let k = b.auto("k", DataType::Int32);
    let zero = b.iconst(0);
    let mut inner = Vec::new();
    let outer = b
        .counted_loop(i, zero, n, LoopOrigin::ParallelForEach, |b, _| {
            let zero = b.iconst(0);
            inner.push(b.counted_loop(j, zero, m, LoopOrigin::Plain, |_, _| {}).expect("loop").region);
            let zero = b.iconst(0);
            inner.push(b.counted_loop(k, zero, i, LoopOrigin::Plain, |_, _| {}).expect("loop").region);
        })
        .expect("loop")
        .region;
    b.ret(None);
    let method = b.finish().expect("build failed");
    (method, outer, inner[0], inner[1])
}

#[test]
fn test_nested_trip_counts() {
    let (mut method, outer, to_m, to_i) = nested_bounds();
    let m = symbol_named(&method, "m");
    let counts = nested_trip_counts(&method, outer);
    assert_eq!(counts.len(), 1);
    assert_eq!(method.node(counts[0].0).symbol, Some(m));
    assert_eq!(method.node(counts[0].1).int_value(), Some(0));
    // The bound of the loop to `i` changes in every iteration.
    assert_eq!(method.region(outer).children, vec![to_m, to_i]);

    if let Some(iv) = method.region_mut(to_m).induction.as_mut() {
        iv.increment = -1;
    }
    assert!(nested_trip_counts(&method, outer).is_empty());
    if let Some(iv) = method.region_mut(to_m).induction.as_mut() {
        iv.increment = 1;
    }

    let entry = method.region(to_m).entry;
    method.block_mut(entry).cold = true;
    assert!(nested_trip_counts(&method, outer).is_empty());
}
