use half::{bf16, f16};
use std::fmt;

/// Element types for Q/K/V/O tensors and the KV-cache.
///
/// All compute in this crate accumulates in `f32` internally (spec.md §4.1:
/// "Produces FP32 attention scores even when A/B are BF16/FP16"); `BF16` and
/// `F16` only affect storage footprint and down-cast rounding, modeled here
/// with the `half` crate's round-trip rather than a distinct in-memory
/// representation for every kernel path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point.
    F32,
    /// 16-bit brain floating point.
    Bf16,
    /// 16-bit IEEE 754 half-precision floating point.
    F16,
    /// 8-bit unsigned integer, used only for quantized KV-cache storage.
    U8,
}

impl DType {
    /// Size in bytes of a single stored element.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::Bf16 | DType::F16 => 2,
            DType::U8 => 1,
        }
    }

    /// True for the two reduced-precision floating types that BRGEMM paths
    /// require backend ISA support for (spec.md §7, `BackendUnavailable`).
    pub fn is_reduced_float(&self) -> bool {
        matches!(self, DType::Bf16 | DType::F16)
    }

    /// Round `x` through this dtype's representation, emulating the
    /// precision loss of the down-cast step in masked softmax (spec.md §4.2
    /// step 7) and of casting an FP32 result tile to the output dtype
    /// (spec.md §4.4 step 3). `F32`/`U8` are no-ops here; `U8` values are
    /// produced exclusively by the quantization path in `quant.rs`, never by
    /// this generic cast.
    pub fn cast_round_trip(&self, x: f32) -> f32 {
        match self {
            DType::F32 => x,
            DType::Bf16 => bf16::from_f32(x).to_f32(),
            DType::F16 => f16::from_f32(x).to_f32(),
            DType::U8 => x,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::Bf16 => write!(f, "bf16"),
            DType::F16 => write!(f, "f16"),
            DType::U8 => write!(f, "u8"),
        }
    }
}
