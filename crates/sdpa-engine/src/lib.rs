//! `sdpa-engine` - the CPU scaled dot-product attention execution engine:
//! prefill and incremental kernels, KV-cache/beam-search state management,
//! and the dispatcher that selects between them.
//!
//! Built on top of `sdpa-tensor`'s strided views, matmul backend wrapper,
//! and fused masked-softmax primitive.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod incremental;
pub mod kv_cache;
pub mod prefill;

pub use config::{Config, KvCachePrecision};
pub use dispatcher::{AttentionMask, Engine, KernelStrategy};
pub use error::{AttnError, Result};
pub use incremental::IncrementalInputs;
pub use kv_cache::KvCacheState;
pub use prefill::PrefillInputs;
