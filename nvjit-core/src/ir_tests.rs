// =============================================================================
// Tests
// =============================================================================

use crate::ir::builder::{BuilderError, MethodBuilder};
use crate::ir::dominators::PostDominators;
use crate::ir::usedef::{DefSite, UseDefInfo};
use crate::ir::{BlockId, DataType, Method, Opcode, RegionId};
use crate::samples;
use crate::IdArena;

fn natural_loops(method: &Method) -> Vec<RegionId> {
    method
        .descendants(method.root)
        .into_iter()
        .filter(|&r| method.region(r).is_natural_loop())
        .collect()
}

fn symbol_named(method: &Method, name: &str) -> crate::ir::SymbolId {
    method
        .symbols
        .iter()
        .find(|(_, s)| s.name == name)
        .map(|(&id, _)| id)
        .unwrap_or_else(|| panic!("no symbol {}", name))
}

#[test]
fn test_counted_loop_is_rotated_with_preheader() {
    let method = samples::sum_of_squares().expect("build failed");
    let loops = natural_loops(&method);
    assert_eq!(loops.len(), 1);

    let region = method.region(loops[0]);
    let iv = region.induction.as_ref().expect("no induction variable");
    assert_eq!(method.symbol(iv.symbol).name, "i");
    assert_eq!(iv.increment, 1);
    assert_eq!(iv.branch_block, region.entry);

    let preheader = method.loop_preheader(loops[0]).expect("no preheader");
    assert_eq!(method.successors(preheader), vec![region.entry]);

    let exits = method.exit_edges(loops[0]);
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].0, region.entry);
    assert_eq!(method.successors(region.entry), vec![region.entry, exits[0].1]);
}

#[test]
fn test_nested_loops_form_region_tree() {
    let method = samples::natural_scope().expect("build failed");
    let loops = natural_loops(&method);
    assert_eq!(loops.len(), 2);

    let outer = loops
        .iter()
        .copied()
        .find(|&r| !method.region(r).children.is_empty())
        .expect("no outer loop");
    let inner = method.region(outer).children[0];
    assert_eq!(method.region(inner).parent, Some(outer));
    assert_eq!(method.region(outer).parent, Some(method.root));

    // The inner preheader and exit belong to the outer loop body.
    let inner_preheader = method.loop_preheader(inner).expect("no inner preheader");
    assert_eq!(method.region_of(inner_preheader), Some(outer));
    assert!(method.region_contains(outer, method.region(inner).entry));
}

#[test]
fn test_builder_rejects_unplaced_target() {
    let mut b = MethodBuilder::new("dangling");
    let nowhere = b.reserve_block();
    b.goto(nowhere);
    match b.finish() {
        Err(BuilderError::UnknownTarget { target, .. }) => assert_eq!(target, nowhere),
        other => panic!("expected UnknownTarget, got {:?}", other.map(|m| m.name)),
    }
}

#[test]
fn test_builder_rejects_tree_after_terminator() {
    let mut b = MethodBuilder::new("early");
    let entry = b.current_block();
    let x = b.auto("x", DataType::Int32);
    let end = b.new_block();
    b.goto(end);
    let one = b.iconst(1);
    b.store(x, one);
    b.switch_to(end);
    b.ret(None);
    match b.finish() {
        Err(BuilderError::MisplacedTerminator(block)) => assert_eq!(block, entry),
        other => panic!("expected MisplacedTerminator, got {:?}", other.map(|m| m.name)),
    }
}

#[test]
fn test_split_fall_through_edge() {
    let mut method = samples::sum_of_squares().expect("build failed");
    let region = natural_loops(&method)[0];
    let entry = method.region(region).entry;
    let preheader = method.loop_preheader(region).expect("no preheader");

    let new = method.split_edge(preheader, entry);
    assert_eq!(method.layout_next(preheader), Some(new));
    assert_eq!(method.successors(preheader), vec![new]);
    assert_eq!(method.successors(new), vec![entry]);
    assert_eq!(method.region_of(new), method.region_of(preheader));
}

#[test]
fn test_split_branch_edge() {
    let mut method = samples::vector_add().expect("build failed");
    let first = method.entry_block().expect("no entry");
    let branch = method.terminator(first).expect("no guard branch");
    let cpu = method.node(branch).target.expect("guard without target");

    let new = method.split_edge(first, cpu);
    assert_eq!(method.node(branch).target, Some(new));
    assert_eq!(method.layout.last().copied(), Some(new));
    assert_eq!(method.successors(new), vec![cpu]);
}

#[test]
fn test_reaching_definitions_of_loop_carried_local() {
    let method = samples::sum_of_squares().expect("build failed");
    let usedef = UseDefInfo::compute(&method);
    let sum = symbol_named(&method, "sum");

    let loads: Vec<_> = method
        .nodes
        .iter()
        .filter(|(_, n)| n.op == Opcode::Load && n.symbol == Some(sum))
        .map(|(&id, _)| id)
        .collect();
    assert_eq!(loads.len(), 2);
    for load in loads {
        let defs = usedef.defs_of(load);
        assert_eq!(defs.len(), 2, "defs of {}: {:?}", load, defs);
        assert!(defs.iter().all(|d| matches!(d, DefSite::Store(_))));
    }
}

#[test]
fn test_parameter_reaches_from_entry() {
    let method = samples::sum_of_squares().expect("build failed");
    let usedef = UseDefInfo::compute(&method);
    let n = symbol_named(&method, "n");
    let load = method
        .nodes
        .iter()
        .find(|(_, node)| node.op == Opcode::Load && node.symbol == Some(n))
        .map(|(&id, _)| id)
        .expect("no load of n");
    assert_eq!(usedef.defs_of(load), &[DefSite::Entry(n)]);
}

#[test]
fn test_post_dominators() {
    let method = samples::kernel_method().expect("build failed");
    let postdom = PostDominators::compute(&method);
    let [entry, body, done] = method.layout[..] else {
        panic!("unexpected layout {:?}", method.layout);
    };
    assert!(postdom.post_dominates(entry, entry));
    assert!(postdom.post_dominates(done, entry));
    assert!(postdom.post_dominates(done, body));
    assert!(!postdom.post_dominates(body, entry));
}

#[test]
fn test_method_survives_json() {
    let method = samples::vector_add().expect("build failed");
    let text = serde_json::to_string(&method).expect("serialize failed");
    let back: Method = serde_json::from_str(&text).expect("deserialize failed");
    assert_eq!(back, method);
}

#[test]
fn test_dump_marks_shared_nodes() {
    let method = samples::sum_of_squares().expect("build failed");
    let text = method.dump();
    assert!(text.starts_with("method sumOfSquares -> Int32"));
    assert!(text.contains("natural loop"));
    assert!(text.contains("LoadIndirect <array-shadow Int32> : Int32"));
    // The squared element is one node referenced twice.
    assert!(text.contains("==> n"));
}

#[test]
fn test_dup_substituting_replaces_loads() {
    let mut method = samples::sum_of_squares().expect("build failed");
    let i = symbol_named(&method, "i");
    let load = method.new_load(i);
    let one = method.new_int(DataType::Int32, 1);
    let expr = method.new_op(Opcode::Add, DataType::Int32, vec![load, one]);
    let seven = method.new_int(DataType::Int32, 7);

    let copy = method.dup_substituting(expr, i, seven);
    assert_ne!(copy, expr);
    let children = method.node(copy).children.clone();
    assert_eq!(method.node(children[0]).int_value(), Some(7));
    assert_ne!(children[0], seven);
    assert_eq!(method.node(children[1]).int_value(), Some(1));
}

/// Drop the empty preheader of the first loop so the guard enters it directly.
fn without_preheader(method: &mut Method) -> RegionId {
    let region = natural_loops(method)[0];
    let preheader = method.loop_preheader(region).expect("no preheader");
    let owner = method.region_of(preheader).expect("unowned preheader");
    method.layout.retain(|&b| b != preheader);
    method.region_mut(owner).blocks.retain(|&b| b != preheader);
    region
}

#[test]
fn test_create_preheader() {
    let mut method = samples::sum_of_squares().expect("build failed");
    let region = without_preheader(&mut method);
    assert_eq!(method.loop_preheader(region), None);

    let entry = method.region(region).entry;
    let new = method.create_preheader(region).expect("no preheader created");
    assert_eq!(method.loop_preheader(region), Some(new));
    assert_eq!(method.layout_next(new), Some(entry));
    assert_eq!(method.region_of(new), Some(method.root));
    // Asking again returns the same block.
    assert_eq!(method.create_preheader(region), Some(new));
}

#[test]
fn test_arena_equality() {
    let mut left: IdArena<BlockId, &str> = IdArena::new();
    let mut right = left.clone();
    assert_eq!(left, right);

    left.alloc("entry");
    assert_ne!(left, right);
    right.alloc("entry");
    assert_eq!(left, right);
    right.alloc("exit");
    assert_ne!(left, right);

    let method = samples::vector_add().expect("build failed");
    let mut copy = method.clone();
    assert_eq!(copy, method);
    copy.add_block();
    assert_ne!(copy, method);
}
