//! `sdpa-tensor` - tensor primitives and fused kernel building blocks for a
//! CPU scaled dot-product attention engine.
//!
//! This crate provides:
//! - `Shape`/`TensorView`/`TensorViewMut`: strided, non-owning tensor views
//! - `DType`/`CpuStorage`: element types and owned scratch/cache buffers
//! - `MatmulBackend`/`ReferenceBackend`: the matmul primitive wrapper (C1)
//! - `cpu::softmax_row`: the masked-softmax fused primitive (C2)
//! - `quant`: per-row int8 quantize/dequantize for the KV-cache (C3)

pub mod backend;
pub mod cache;
pub mod cpu;
pub mod dtype;
pub mod error;
pub mod quant;
pub mod shape;
pub mod storage;
pub mod view;

// Re-export primary types at the crate root for convenience.
pub use backend::{GemmKey, MatmulBackend, PackedPanel, ReferenceBackend};
pub use cache::PrimitiveKernel;
pub use cpu::{softmax_row, softmax_row_cast, CausalPolarity, SoftmaxRowArgs};
pub use dtype::DType;
pub use error::{Result, TensorError};
pub use quant::{dequantize_one, dequantize_row, quantize_row, ScaleZeroPoint};
pub use shape::{permute_strides, Shape};
pub use storage::CpuStorage;
pub use view::{TensorView, TensorViewMut};
