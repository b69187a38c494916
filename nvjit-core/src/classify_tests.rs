use crate::classify::{classify, compare, mnemonic, type_name, var_type_name};
use crate::ir::builder::MethodBuilder;
use crate::ir::{CmpMode, Cond, DataType, Opcode};

#[test]
fn test_integer_arithmetic() {
    assert_eq!(mnemonic(Opcode::Add, DataType::Int32, DataType::Int32), Some("add"));
    assert_eq!(mnemonic(Opcode::Shr, DataType::Int64, DataType::Int64), Some("ashr"));
    assert_eq!(mnemonic(Opcode::UShr, DataType::Int32, DataType::Int32), Some("lshr"));
    assert_eq!(mnemonic(Opcode::Rem, DataType::Int32, DataType::Int32), Some("srem"));
}

#[test]
fn test_floating_point_arithmetic() {
    assert_eq!(mnemonic(Opcode::Add, DataType::Float, DataType::Float), Some("fadd"));
    assert_eq!(mnemonic(Opcode::Div, DataType::Double, DataType::Double), Some("fdiv"));
    assert_eq!(mnemonic(Opcode::Neg, DataType::Float, DataType::Float), Some("fsub"));
    // Bitwise operators have no floating-point form.
    assert_eq!(mnemonic(Opcode::Xor, DataType::Float, DataType::Float), None);
}

#[test]
fn test_conversions() {
    assert_eq!(mnemonic(Opcode::Convert, DataType::Int64, DataType::Int32), Some("sext"));
    assert_eq!(mnemonic(Opcode::UConvert, DataType::Int64, DataType::Int32), Some("zext"));
    assert_eq!(mnemonic(Opcode::Convert, DataType::Int8, DataType::Int32), Some("trunc"));
    assert_eq!(mnemonic(Opcode::Convert, DataType::Float, DataType::Int32), Some("sitofp"));
    assert_eq!(mnemonic(Opcode::Convert, DataType::Int32, DataType::Double), Some("fptosi"));
    assert_eq!(mnemonic(Opcode::Convert, DataType::Double, DataType::Float), Some("fpext"));
    assert_eq!(mnemonic(Opcode::Convert, DataType::Address, DataType::Int64), Some("inttoptr"));
    assert_eq!(mnemonic(Opcode::Convert, DataType::Int32, DataType::Int32), None);
    assert_eq!(mnemonic(Opcode::BitsCast, DataType::Float, DataType::Int32), Some("bitcast"));
    assert_eq!(mnemonic(Opcode::BitsCast, DataType::Double, DataType::Int32), None);
}

#[test]
fn test_comparisons() {
    assert_eq!(compare(Cond::Lt, CmpMode::Signed, DataType::Int32), Some("icmp slt"));
    assert_eq!(compare(Cond::Lt, CmpMode::Unsigned, DataType::Int32), Some("icmp ult"));
    assert_eq!(compare(Cond::Ge, CmpMode::Signed, DataType::Address), Some("icmp uge"));
    assert_eq!(compare(Cond::Ne, CmpMode::Ordered, DataType::Double), Some("fcmp one"));
    assert_eq!(compare(Cond::Ne, CmpMode::Unordered, DataType::Float), Some("fcmp une"));
    assert_eq!(compare(Cond::Eq, CmpMode::Signed, DataType::VectorInt32), None);
}

#[test]
fn test_unsupported_opcodes() {
    for op in [Opcode::Call, Opcode::NewArray, Opcode::ArrayLength, Opcode::NullCheck] {
        assert_eq!(mnemonic(op, DataType::Int32, DataType::Int32), None, "{:?}", op);
    }
}

#[test]
fn test_compare_node_yields_int() {
    let mut b = MethodBuilder::new("cmp");
    let x = b.parm("x", DataType::Double);
    let lx = b.load(x);
    let zero = b.dconst(0.0);
    let cmp = b.compare(Cond::Gt, CmpMode::Ordered, lx, zero);
    let c = classify(b.method(), cmp).expect("compare unclassified");
    assert_eq!(c.mnemonic, "fcmp ogt");
    assert_eq!(c.result, DataType::Int32);
}

#[test]
fn test_type_names() {
    assert_eq!(type_name(DataType::Address), Some("i8*"));
    assert_eq!(var_type_name(DataType::Float), Some("f32"));
    assert_eq!(var_type_name(DataType::Address), Some("p64"));
    assert_eq!(type_name(DataType::VectorFloat), None);
}
