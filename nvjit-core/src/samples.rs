//! Sample methods shared by the tests and the command-line driver.
//!
//! Each sample is a small static method built with [`MethodBuilder`] in the
//! shape a bytecode front end would produce.

use std::fmt;
use std::str::FromStr;

use crate::ir::builder::{BuilderError, LoopParts, MethodBuilder};
use crate::ir::{
    Axis, CmpMode, Cond, DataType, LoopOrigin, Method, NodeId, Opcode, Recognized, SymbolId,
};

/// Class declaring the CPU implementation of forEach lambdas.
const LAMBDA_CLASS: &str = "Sample$Lambda";
/// Class declaring the launch-coordinate intrinsics.
const KERNEL_CLASS: &str = "com/ibm/gpu/Kernel";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    VectorAdd,
    SumOfSquares,
    ReversedCopy,
    ForeignCall,
    NaturalScope,
    KernelMethod,
}

impl Scenario {
    pub const ALL: [Scenario; 6] = [
        Scenario::VectorAdd,
        Scenario::SumOfSquares,
        Scenario::ReversedCopy,
        Scenario::ForeignCall,
        Scenario::NaturalScope,
        Scenario::KernelMethod,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::VectorAdd => "vector-add",
            Scenario::SumOfSquares => "sum-of-squares",
            Scenario::ReversedCopy => "reversed-copy",
            Scenario::ForeignCall => "foreign-call",
            Scenario::NaturalScope => "natural-scope",
            Scenario::KernelMethod => "kernel-method",
        }
    }

    pub fn build(self) -> Result<Method, BuilderError> {
        match self {
            Scenario::VectorAdd => vector_add(),
            Scenario::SumOfSquares => sum_of_squares(),
            Scenario::ReversedCopy => reversed_copy(),
            Scenario::ForeignCall => foreign_call(),
            Scenario::NaturalScope => natural_scope(),
            Scenario::KernelMethod => kernel_method(),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL
            .iter()
            .copied()
            .find(|sc| sc.name() == s)
            .ok_or_else(|| format!("unknown scenario '{}'", s))
    }
}

/// Parallel forEach in front of which the tryGPU guard selects the lambda's
/// CPU implementation.
fn for_each(
    b: &mut MethodBuilder,
    bound: SymbolId,
    body: impl FnOnce(&mut MethodBuilder, NodeId),
) -> Result<LoopParts, BuilderError> {
    let flag = b.try_gpu_flag();
    let cpu = b.reserve_block();
    b.try_gpu_guard(flag, cpu);
    let i = b.auto("i", DataType::Int32);
    let zero = b.iconst(0);
    let parts = b.counted_loop(i, zero, bound, LoopOrigin::ParallelForEach, body)?;
    let after = b.reserve_block();
    b.goto(after);

    b.place_block(cpu);
    let lambda = b.method_symbol(LAMBDA_CLASS, "forEachCPU", DataType::NoType, None);
    let n = b.load(bound);
    let call = b.call(lambda, vec![n]);
    b.treetop(call);
    b.place_block(after);
    Ok(parts)
}

/// `for (i = 0; i < n; i++) c[i] = a[i] + b[i];` as a parallel forEach.
pub fn vector_add() -> Result<Method, BuilderError> {
    let mut b = MethodBuilder::new("vectorAdd");
    let a = b.array_parm("a", "[I");
    let bs = b.array_parm("b", "[I");
    let c = b.array_parm("c", "[I");
    let n = b.parm("n", DataType::Int32);
    for_each(&mut b, n, |b, i| {
        let la = b.load(a);
        let x = b.load_element(la, i, DataType::Int32);
        let lb = b.load(bs);
        let y = b.load_element(lb, i, DataType::Int32);
        let sum = b.binary(Opcode::Add, DataType::Int32, x, y);
        let lc = b.load(c);
        b.store_element(lc, i, DataType::Int32, sum);
    })?;
    b.ret(None);
    b.finish()
}

/// `sum += a[i] * a[i]` in a plain counted loop; returns `sum`.
pub fn sum_of_squares() -> Result<Method, BuilderError> {
    let mut b = MethodBuilder::new("sumOfSquares");
    b.set_return_type(DataType::Int32);
    let a = b.array_parm("a", "[I");
    let n = b.parm("n", DataType::Int32);
    let i = b.auto("i", DataType::Int32);
    let sum = b.auto("sum", DataType::Int32);
    let zero = b.iconst(0);
    b.store(sum, zero);
    let zero = b.iconst(0);
    b.counted_loop(i, zero, n, LoopOrigin::Plain, |b, i| {
        let la = b.load(a);
        let x = b.load_element(la, i, DataType::Int32);
        let square = b.binary(Opcode::Mul, DataType::Int32, x, x);
        let acc = b.load(sum);
        let next = b.binary(Opcode::Add, DataType::Int32, acc, square);
        b.store(sum, next);
    })?;
    let result = b.load(sum);
    b.ret(Some(result));
    b.finish()
}

/// `a[i] = a[n - i]`: the array reads itself in the opposite direction.
pub fn reversed_copy() -> Result<Method, BuilderError> {
    let mut b = MethodBuilder::new("reversedCopy");
    let a = b.array_parm("a", "[I");
    let n = b.parm("n", DataType::Int32);
    let i = b.auto("i", DataType::Int32);
    let zero = b.iconst(0);
    b.counted_loop(i, zero, n, LoopOrigin::Plain, |b, i| {
        let la = b.load(a);
        let ln = b.load(n);
        let mirrored = b.binary(Opcode::Sub, DataType::Int32, ln, i);
        let x = b.load_element(la, mirrored, DataType::Int32);
        let la = b.load(a);
        b.store_element(la, i, DataType::Int32, x);
    })?;
    b.ret(None);
    b.finish()
}

/// A forEach body calling an ordinary user method.
pub fn foreign_call() -> Result<Method, BuilderError> {
    let mut b = MethodBuilder::new("foreignCall");
    let a = b.array_parm("a", "[I");
    let out = b.array_parm("b", "[I");
    let n = b.parm("n", DataType::Int32);
    let compute = b.method_symbol("Foo", "compute", DataType::Int32, None);
    for_each(&mut b, n, |b, i| {
        let la = b.load(a);
        let x = b.load_element(la, i, DataType::Int32);
        let r = b.call(compute, vec![x]);
        let lo = b.load(out);
        b.store_element(lo, i, DataType::Int32, r);
    })?;
    b.ret(None);
    b.finish()
}

/// `for (j < m) for (i < n) b[i] += a[i]` with the inner loop marked as a
/// data-parallel kernel.
pub fn natural_scope() -> Result<Method, BuilderError> {
    let mut b = MethodBuilder::new("repeatedAdd");
    let a = b.array_parm("a", "[I");
    let out = b.array_parm("b", "[I");
    let n = b.parm("n", DataType::Int32);
    let m = b.parm("m", DataType::Int32);
    let i = b.auto("i", DataType::Int32);
    let j = b.auto("j", DataType::Int32);

    let mut inner = Err(BuilderError::EmptyLoop);
    let zero = b.iconst(0);
    b.counted_loop(j, zero, m, LoopOrigin::Plain, |b, _| {
        let zero = b.iconst(0);
        inner = b.counted_loop(i, zero, n, LoopOrigin::SpmdKernel, |b, i| {
            let la = b.load(a);
            let x = b.load_element(la, i, DataType::Int32);
            let lo = b.load(out);
            let y = b.load_element(lo, i, DataType::Int32);
            let sum = b.binary(Opcode::Add, DataType::Int32, y, x);
            let lo = b.load(out);
            b.store_element(lo, i, DataType::Int32, sum);
        });
    })?;
    inner?;
    b.ret(None);
    b.finish()
}

/// A method compiled as a whole into one kernel:
///
/// ```text
/// tid = blockIdx.x * blockDim.x + threadIdx.x;
/// if (tid < n) a[tid] = a[tid] * 2;
/// ```
pub fn kernel_method() -> Result<Method, BuilderError> {
    let mut b = MethodBuilder::new("scaleKernel");
    b.set_gpu_kernel(true);
    let a = b.array_parm("a", "[I");
    let n = b.parm("n", DataType::Int32);
    let tid = b.auto("tid", DataType::Int32);
    let block_idx = b.method_symbol(
        KERNEL_CLASS,
        "blockIdxX",
        DataType::Int32,
        Some(Recognized::BlockIdx(Axis::X)),
    );
    let block_dim = b.method_symbol(
        KERNEL_CLASS,
        "blockDimX",
        DataType::Int32,
        Some(Recognized::BlockDim(Axis::X)),
    );
    let thread_idx = b.method_symbol(
        KERNEL_CLASS,
        "threadIdxX",
        DataType::Int32,
        Some(Recognized::ThreadIdx(Axis::X)),
    );

    let la = b.load(a);
    let check = b.unary(Opcode::NullCheck, DataType::Address, la);
    b.treetop(check);
    let bx = b.call(block_idx, vec![]);
    let bd = b.call(block_dim, vec![]);
    let tx = b.call(thread_idx, vec![]);
    let base = b.binary(Opcode::Mul, DataType::Int32, bx, bd);
    let id = b.binary(Opcode::Add, DataType::Int32, base, tx);
    b.store(tid, id);
    let done = b.reserve_block();
    let t = b.load(tid);
    let ln = b.load(n);
    b.if_goto(Cond::Ge, CmpMode::Signed, t, ln, done);

    b.begin_block();
    let la = b.load(a);
    let t = b.load(tid);
    let x = b.load_element(la, t, DataType::Int32);
    let two = b.iconst(2);
    let doubled = b.binary(Opcode::Mul, DataType::Int32, x, two);
    let la = b.load(a);
    let t = b.load(tid);
    b.store_element(la, t, DataType::Int32, doubled);

    b.place_block(done);
    b.ret(None);
    b.finish()
}
