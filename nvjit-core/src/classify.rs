//! Opcode classification for NVVM IR emission.
//!
//! A pure table lookup keyed by opcode value and operand types. `None` means
//! the node has no direct NVVM counterpart; callers that need a mnemonic must
//! treat that as a rejection of the whole loop.

use crate::ir::{CmpMode, Cond, DataType, Method, NodeId, Opcode};

/// Mnemonic and result type of a node that maps onto one NVVM instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified {
    pub mnemonic: &'static str,
    pub result: DataType,
}

/// NVVM spelling of a scalar type.
pub fn type_name(ty: DataType) -> Option<&'static str> {
    match ty {
        DataType::NoType => Some("void"),
        DataType::Int8 => Some("i8"),
        DataType::Int16 => Some("i16"),
        DataType::Int32 => Some("i32"),
        DataType::Int64 => Some("i64"),
        DataType::Float => Some("float"),
        DataType::Double => Some("double"),
        DataType::Address => Some("i8*"),
        _ => None,
    }
}

/// Type suffix used in intrinsic names (`ldg.global.f.f32`).
pub fn var_type_name(ty: DataType) -> Option<&'static str> {
    match ty {
        DataType::NoType => Some("void"),
        DataType::Int8 => Some("i8"),
        DataType::Int16 => Some("i16"),
        DataType::Int32 => Some("i32"),
        DataType::Int64 => Some("i64"),
        DataType::Float => Some("f32"),
        DataType::Double => Some("f64"),
        DataType::Address => Some("p64"),
        _ => None,
    }
}

/// Classify a node of `method`.
pub fn classify(method: &Method, id: NodeId) -> Option<Classified> {
    let node = method.node(id);
    let operand = node
        .child(0)
        .map(|c| method.node(c).ty)
        .unwrap_or(DataType::NoType);
    let mnemonic = mnemonic(node.op, node.ty, operand)?;
    let result = match node.op {
        Opcode::Compare(..) => DataType::Int32,
        _ => node.ty,
    };
    Some(Classified { mnemonic, result })
}

/// Mnemonic for `op` producing `ty` from a first operand of type `operand`.
pub fn mnemonic(op: Opcode, ty: DataType, operand: DataType) -> Option<&'static str> {
    let int = ty.is_integral();
    let fp = ty.is_floating_point();
    match op {
        Opcode::Load | Opcode::LoadIndirect => Some("load"),
        Opcode::Store | Opcode::StoreIndirect => Some("store"),
        Opcode::Goto => Some("br"),
        Opcode::Return => Some("ret"),
        Opcode::Lookup | Opcode::Table => Some("switch"),
        Opcode::AddrAdd => Some("getelementptr"),

        Opcode::Add if int => Some("add"),
        Opcode::Add if fp => Some("fadd"),
        Opcode::Sub | Opcode::Neg if int => Some("sub"),
        Opcode::Sub | Opcode::Neg if fp => Some("fsub"),
        Opcode::Mul if int => Some("mul"),
        Opcode::Mul if fp => Some("fmul"),
        Opcode::Div if int => Some("sdiv"),
        Opcode::Div if fp => Some("fdiv"),
        Opcode::UDiv if int => Some("udiv"),
        Opcode::Rem if int => Some("srem"),
        Opcode::Rem if fp => Some("frem"),
        Opcode::URem if int => Some("urem"),
        Opcode::Shl if int => Some("shl"),
        Opcode::Shr if int => Some("ashr"),
        Opcode::UShr if int => Some("lshr"),
        Opcode::And if int => Some("and"),
        Opcode::Or if int => Some("or"),
        Opcode::Xor if int => Some("xor"),

        Opcode::Convert => convert(operand, ty, false),
        Opcode::UConvert => convert(operand, ty, true),
        Opcode::BitsCast => match (operand, ty) {
            (DataType::Int32, DataType::Float)
            | (DataType::Float, DataType::Int32)
            | (DataType::Int64, DataType::Double)
            | (DataType::Double, DataType::Int64) => Some("bitcast"),
            _ => None,
        },

        Opcode::Compare(cond, mode) | Opcode::If(cond, mode) => compare(cond, mode, operand),

        _ => None,
    }
}

fn convert(from: DataType, to: DataType, unsigned: bool) -> Option<&'static str> {
    use DataType::*;
    match (from, to) {
        (a, b) if a.is_integral() && b.is_integral() => {
            if b.size() > a.size() {
                Some(if unsigned { "zext" } else { "sext" })
            } else if b.size() < a.size() {
                Some("trunc")
            } else {
                None
            }
        }
        (a, b) if a.is_integral() && b.is_floating_point() => {
            Some(if unsigned { "uitofp" } else { "sitofp" })
        }
        (a, b) if a.is_floating_point() && b.is_integral() => {
            Some(if unsigned { "fptoui" } else { "fptosi" })
        }
        (Float, Double) => Some("fpext"),
        (Double, Float) => Some("fptrunc"),
        (a, Address) if a.is_integral() => Some("inttoptr"),
        (Address, b) if b.is_integral() => Some("ptrtoint"),
        _ => None,
    }
}

/// `icmp`/`fcmp` with its predicate.
pub fn compare(cond: Cond, mode: CmpMode, operand: DataType) -> Option<&'static str> {
    if operand.is_floating_point() {
        let unordered = mode == CmpMode::Unordered;
        return Some(match (cond, unordered) {
            (Cond::Eq, false) => "fcmp oeq",
            (Cond::Ne, false) => "fcmp one",
            (Cond::Lt, false) => "fcmp olt",
            (Cond::Ge, false) => "fcmp oge",
            (Cond::Gt, false) => "fcmp ogt",
            (Cond::Le, false) => "fcmp ole",
            (Cond::Eq, true) => "fcmp ueq",
            (Cond::Ne, true) => "fcmp une",
            (Cond::Lt, true) => "fcmp ult",
            (Cond::Ge, true) => "fcmp uge",
            (Cond::Gt, true) => "fcmp ugt",
            (Cond::Le, true) => "fcmp ule",
        });
    }
    if !(operand.is_integral() || operand == DataType::Address) {
        return None;
    }
    // Addresses always compare unsigned.
    let unsigned = mode == CmpMode::Unsigned || operand == DataType::Address;
    Some(match (cond, unsigned) {
        (Cond::Eq, _) => "icmp eq",
        (Cond::Ne, _) => "icmp ne",
        (Cond::Lt, false) => "icmp slt",
        (Cond::Ge, false) => "icmp sge",
        (Cond::Gt, false) => "icmp sgt",
        (Cond::Le, false) => "icmp sle",
        (Cond::Lt, true) => "icmp ult",
        (Cond::Ge, true) => "icmp uge",
        (Cond::Gt, true) => "icmp ugt",
        (Cond::Le, true) => "icmp ule",
    })
}
