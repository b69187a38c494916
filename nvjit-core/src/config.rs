//! Per-compilation configuration.
//!
//! Everything here is built once before the driver runs and passed down by
//! reference; nothing is read lazily from the environment.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CompilerError, Result};
use crate::ir::{DataType, Opcode};

/// Feature toggles for GPU offload and auto-vectorization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuOptions {
    pub enable_gpu: bool,
    /// Launch on the GPU without consulting the cost estimate.
    pub force: bool,
    pub verbose: bool,
    pub details: bool,
    pub disable_read_only_cache_array: bool,
    pub disable_read_only_cache_obj_hdr: bool,
    pub disable_exception_checks: bool,
    pub disable_data_transfer_elimination: bool,
    pub disable_transfer_hoist: bool,
    pub enable_math: bool,
    /// The user accepts data races from non-contiguous or conditional stores.
    pub safe_mt: bool,
    pub enable_fp_reduction: bool,
    pub disable_auto_simd: bool,
    pub disable_buffer_align: bool,
    pub enable_exception_check_elimination: bool,
}

impl GpuOptions {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| CompilerError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CompilerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Rejections are reported at info level when the user asked for them.
    pub fn trace_rejections(&self) -> bool {
        self.verbose || self.details
    }
}

/// Object layout constants of the host VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectModel {
    /// Bytes before the first element of a contiguous array.
    pub array_header_size: u32,
    pub array_length_offset: u32,
    /// Alignment of array buffers allocated on the device.
    pub gpu_alignment: u32,
    /// Bytes of the object header that never change after allocation.
    pub object_header_invariant: u32,
}

impl Default for ObjectModel {
    fn default() -> Self {
        ObjectModel {
            array_header_size: 16,
            array_length_offset: 8,
            gpu_alignment: 128,
            object_header_invariant: 12,
        }
    }
}

/// Host vector unit capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimdTarget {
    pub supports_auto_simd: bool,
    /// Vector opcodes the host can evaluate, keyed by vector type.
    pub supported: Vec<(Opcode, DataType)>,
}

impl SimdTarget {
    pub fn none() -> Self {
        SimdTarget {
            supports_auto_simd: false,
            supported: Vec::new(),
        }
    }

    pub fn supports(&self, op: Opcode, vector_ty: DataType) -> bool {
        self.supported.contains(&(op, vector_ty))
    }
}

impl Default for SimdTarget {
    fn default() -> Self {
        let memory = [
            Opcode::Load,
            Opcode::Store,
            Opcode::LoadIndirect,
            Opcode::StoreIndirect,
            Opcode::Splat,
            Opcode::GetElem,
            Opcode::LaneIndex,
            Opcode::Const,
        ];
        let int_ops = [
            Opcode::Add,
            Opcode::Sub,
            Opcode::Mul,
            Opcode::Neg,
            Opcode::And,
            Opcode::Or,
            Opcode::Xor,
            Opcode::Shl,
            Opcode::Shr,
            Opcode::UShr,
        ];
        let fp_ops = [Opcode::Add, Opcode::Sub, Opcode::Mul, Opcode::Div, Opcode::Neg];

        let mut supported = Vec::new();
        for ty in [
            DataType::VectorInt8,
            DataType::VectorInt16,
            DataType::VectorInt32,
            DataType::VectorInt64,
        ] {
            supported.extend(memory.iter().chain(int_ops.iter()).map(|&op| (op, ty)));
        }
        for ty in [DataType::VectorFloat, DataType::VectorDouble] {
            supported.extend(memory.iter().chain(fp_ops.iter()).map(|&op| (op, ty)));
        }
        SimdTarget {
            supports_auto_simd: true,
            supported,
        }
    }
}

// =============================================================================
// Device queries
// =============================================================================

/// Read-only view of the installed GPU and toolchain.
pub trait DeviceOracle {
    /// Compute capability as (major, minor).
    fn compute_capability(&self) -> Result<(u32, u32)>;
    /// NVVM IR version supported by the toolchain as (major, minor).
    fn nvvm_version(&self) -> Result<(u32, u32)>;
    fn device_count(&self) -> u32;
}

/// Fixed answers, for tests and offline compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticDevice {
    pub compute_capability: Option<(u32, u32)>,
    pub nvvm_version: Option<(u32, u32)>,
    pub device_count: u32,
}

impl Default for StaticDevice {
    fn default() -> Self {
        StaticDevice {
            compute_capability: Some((3, 5)),
            nvvm_version: Some((1, 2)),
            device_count: 1,
        }
    }
}

impl DeviceOracle for StaticDevice {
    fn compute_capability(&self) -> Result<(u32, u32)> {
        self.compute_capability
            .ok_or_else(|| CompilerError::HelperError("compute capability query failed".into()))
    }

    fn nvvm_version(&self) -> Result<(u32, u32)> {
        self.nvvm_version
            .ok_or_else(|| CompilerError::HelperError("NVVM version query failed".into()))
    }

    fn device_count(&self) -> u32 {
        self.device_count
    }
}
