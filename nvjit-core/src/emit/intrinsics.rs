//! Names and declarations of the NVVM builtins a kernel may call.

use crate::ir::{Axis, DataType, Recognized};

pub const TARGET_TRIPLE: &str = "nvptx64-unknown-cuda";

pub const DATA_LAYOUT: &str = "e-p:64:64:64-i1:8:8-i8:8:8-i16:16:16-i32:32:32-i64:64:64-f32:32:32-f64:64:64-v16:16:16-v32:32:32-v64:64:64-v128:128:128-n16:32:64";

pub const EXCEPTION_KIND_GLOBAL: &str =
    "@_ExceptionKind = addrspace(1) global [1 x i32] zeroinitializer, align 4";

pub const INVARIANT_DECLARES: [&str; 2] = [
    "declare {}* @llvm.invariant.start(i64, i8* nocapture) nounwind",
    "declare void @llvm.invariant.end({}*, i64, i8* nocapture) nounwind",
];

pub const BARRIER_DECLARE: &str = "declare void @llvm.nvvm.barrier0() nounwind readnone";

/// Values stored into the exception-kind cell by the landing pads.
pub const NULL_EXCEPTION: u32 = 1;
pub const BND_EXCEPTION: u32 = 2;
pub const DIV_EXCEPTION: u32 = 3;

pub const METADATA_CONSTANTS: [&str; 5] = [
    "!10 = metadata !{i32    0}",
    "!11 = metadata !{i32    1}",
    "!12 = metadata !{i32    2}",
    "!14 = metadata !{i32    4}",
    "!18 = metadata !{i32    8}",
];

/// The special register read for a kernel-coordinate query.
pub fn sreg_name(recognized: Recognized) -> Option<String> {
    let (reg, axis) = match recognized {
        Recognized::BlockIdx(a) => ("ctaid", a),
        Recognized::BlockDim(a) => ("ntid", a),
        Recognized::ThreadIdx(a) => ("tid", a),
        _ => return None,
    };
    Some(format!("llvm.nvvm.read.ptx.sreg.{}.{}", reg, axis.name()))
}

/// Declarations of every special register, emitted after the kernel.
pub fn sreg_declares() -> Vec<String> {
    let mut out = Vec::new();
    for reg in ["ctaid", "ntid", "tid"] {
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            out.push(format!(
                "declare i32 @llvm.nvvm.read.ptx.sreg.{}.{}() nounwind readnone",
                reg,
                axis.name()
            ));
        }
    }
    out
}

/// libdevice function and its floating-point type for a math call.
pub fn math_builtin(recognized: Recognized) -> Option<(&'static str, DataType)> {
    match recognized {
        Recognized::Sqrt => Some(("__nv_sqrt", DataType::Double)),
        Recognized::Sin => Some(("__nv_sin", DataType::Double)),
        Recognized::Cos => Some(("__nv_cos", DataType::Double)),
        Recognized::Log => Some(("__nv_log", DataType::Double)),
        Recognized::Exp => Some(("__nv_exp", DataType::Double)),
        Recognized::AbsD => Some(("__nv_fabs", DataType::Double)),
        Recognized::AbsF => Some(("__nv_fabsf", DataType::Float)),
        _ => None,
    }
}

pub const MATH_DECLARES: [&str; 7] = [
    "declare double @__nv_sin(double) nounwind readnone",
    "declare double @__nv_cos(double) nounwind readnone",
    "declare double @__nv_sqrt(double) nounwind readnone",
    "declare double @__nv_log(double) nounwind readnone",
    "declare double @__nv_exp(double) nounwind readnone",
    "declare double @__nv_fabs(double) nounwind readnone",
    "declare float @__nv_fabsf(float) nounwind readnone",
];

const LDG_TYPES: [(&str, &str, &str); 7] = [
    ("i8", "i", "i8"),
    ("i16", "i", "i16"),
    ("i32", "i", "i32"),
    ("i64", "i", "i64"),
    ("float", "f", "f32"),
    ("double", "f", "f64"),
    ("i8*", "p", "p64"),
];

/// Read-only global load for an element type. NVVM IR up to 1.2 takes the
/// pointer only; later versions also take the alignment.
pub fn ldg_name(ty: &str, with_alignment: bool) -> Option<String> {
    let &(_, class, suffix) = LDG_TYPES.iter().find(|(t, _, _)| *t == ty)?;
    Some(if with_alignment {
        format!("llvm.nvvm.ldg.global.{}.{}.p0{}", class, suffix, suffix)
    } else {
        format!("llvm.nvvm.ldg.global.{}.{}", class, suffix)
    })
}

pub fn ldg_declares(with_alignment: bool) -> Vec<String> {
    LDG_TYPES
        .iter()
        .filter_map(|&(ty, _, _)| {
            let name = ldg_name(ty, with_alignment)?;
            Some(if with_alignment {
                format!("declare {} @{}({}*, i32) nounwind readonly", ty, name, ty)
            } else {
                format!("declare {} @{}({}*) nounwind readonly", ty, name, ty)
            })
        })
        .collect()
}

/// NVVM element type of an array signature such as `[I`.
pub fn signature_element_type(signature: &str) -> Option<&'static str> {
    match signature.strip_prefix('[')?.chars().next()? {
        'Z' | 'B' => Some("i8"),
        'C' | 'S' => Some("i16"),
        'I' => Some("i32"),
        'J' => Some("i64"),
        'F' => Some("float"),
        'D' => Some("double"),
        'L' | '[' => Some("i8*"),
        _ => None,
    }
}
