use crate::analysis::reduction::ReductionOp;
use crate::analysis::LoopAnalysis;
use crate::config::{GpuOptions, SimdTarget};
use crate::error::CompilerError;
use crate::ir::builder::MethodBuilder;
use crate::ir::usedef::UseDefInfo;
use crate::ir::{DataType, LoopOrigin, Method, Opcode, RegionId, SymbolId};
use crate::samples;
use crate::vectorize::{vectorize_loop, VectorPlan};

fn first_loop(method: &Method) -> RegionId {
    method
        .descendants(method.root)
        .into_iter()
        .find(|&r| method.region(r).is_natural_loop())
        .expect("no loop")
}

fn symbol_named(method: &Method, name: &str) -> Option<SymbolId> {
    method
        .symbols
        .iter()
        .find(|(_, s)| s.name == name)
        .map(|(&id, _)| id)
}

fn plan_for(method: &Method) -> VectorPlan {
    let options = GpuOptions::default();
    let simd = SimdTarget::default();
    let usedef = UseDefInfo::compute(method);
    let mut analysis =
        LoopAnalysis::new(method, first_loop(method), &options, &simd, &usedef).expect("no induction");
    analysis.check_simd_candidate().expect("rejected");
    VectorPlan::from_analysis(&analysis).expect("no plan")
}

fn count_ops(method: &Method, op: Opcode) -> usize {
    method.nodes.values().filter(|n| n.op == op).count()
}

#[test]
fn test_sum_of_squares_vector_loop() {
    let mut method = samples::sum_of_squares().expect("build failed");
    let original = first_loop(&method);
    let preheader = method.loop_preheader(original).expect("no preheader");
    let sum = symbol_named(&method, "sum").expect("no sum");

    let plan = plan_for(&method);
    assert_eq!(plan.lanes(), 4);
    assert_eq!(plan.reductions, vec![(sum, ReductionOp::Add)]);

    let done = vectorize_loop(&mut method, &plan).expect("rewrite failed");
    assert_eq!(done.lanes, 4);

    let vector = method.region(done.region);
    assert!(vector.is_natural_loop());
    assert_eq!(vector.parent, Some(method.root));
    assert_eq!(vector.induction.as_ref().map(|iv| iv.increment), Some(4));
    assert!(method.layout_position(vector.entry).is_some());

    // The scalar loop survives as the residue.
    assert!(method.region(method.root).children.contains(&original));

    let acc = symbol_named(&method, "sum.vec").expect("no accumulator");
    assert_eq!(method.symbol(acc).ty, DataType::VectorInt32);
    assert_eq!(count_ops(&method, Opcode::GetElem), 4);

    // The preheader now enters the vector guard rather than the scalar loop.
    let guard = method.successors(preheader);
    assert_eq!(guard.len(), 1);
    assert_ne!(guard[0], method.region(original).entry);
    assert_eq!(method.layout_next(preheader), Some(guard[0]));
}

#[test]
fn test_induction_variable_as_value() {
    // a[i] = i
    let mut b = MethodBuilder::new("iota");
    let a = b.array_parm("a", "[I");
    let n = b.parm("n", DataType::Int32);
    let i = b.auto("i", DataType::Int32);
    let zero = b.iconst(0);
    b.counted_loop(i, zero, n, LoopOrigin::Plain, |b, i| {
        let la = b.load(a);
        b.store_element(la, i, DataType::Int32, i);
    })
    .expect("loop");
    b.ret(None);
    let mut method = b.finish().expect("build failed");

    let plan = plan_for(&method);
    assert!(plan.reductions.is_empty());
    vectorize_loop(&mut method, &plan).expect("rewrite failed");

    let vpiv = symbol_named(&method, "i.vec").expect("no vector induction variable");
    assert_eq!(method.symbol(vpiv).ty, DataType::VectorInt32);
    assert_eq!(count_ops(&method, Opcode::LaneIndex), 1);
    let vector_stores = method
        .nodes
        .values()
        .filter(|n| n.op == Opcode::StoreIndirect && n.ty == DataType::VectorInt32)
        .count();
    assert_eq!(vector_stores, 1);
}

#[test]
fn test_plan_without_vector_width() {
    let mut method = samples::sum_of_squares().expect("build failed");
    let region = first_loop(&method);
    let plan = VectorPlan {
        region,
        piv: symbol_named(&method, "i").expect("no i"),
        data_type: DataType::NoType,
        reductions: Vec::new(),
    };
    let err = vectorize_loop(&mut method, &plan).expect_err("rewrote the loop");
    assert!(matches!(err, CompilerError::Fatal(..)));
}

#[test]
fn test_call_in_body_cannot_be_rewritten() {
    let mut method = samples::foreign_call().expect("build failed");
    let region = first_loop(&method);
    let plan = VectorPlan {
        region,
        piv: symbol_named(&method, "i").expect("no i"),
        data_type: DataType::Int32,
        reductions: Vec::new(),
    };
    let err = vectorize_loop(&mut method, &plan).expect_err("rewrote the loop");
    assert!(matches!(err, CompilerError::InvalidProgram(..)));
    assert!(!err.is_fatal());
}
