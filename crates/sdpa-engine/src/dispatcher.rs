//! Per-call orchestration (C7): axis permutation, optional fused-concat
//! into the KV-cache, kernel selection, and output layout handling.
//!
//! Grounded on the teacher's `LlamaModel::forward` top-level per-layer loop
//! (the single place that decides "do I have a cache to read/write and how
//! many query tokens am I processing this call"), generalized into an
//! explicit `KernelStrategy` selection instead of an implicit branch buried
//! in the forward pass (spec.md §9 REDESIGN FLAGS: "replace [backend
//! dispatch] with a closed variant `KernelStrategy`").

use sdpa_tensor::backend::MatmulBackend;
use sdpa_tensor::cpu::CausalPolarity;
use sdpa_tensor::dtype::DType;
use sdpa_tensor::view::{TensorView, TensorViewMut};
use sdpa_tensor::shape::Shape;

use crate::config::Config;
use crate::error::{AttnError, Result};
use crate::incremental::{self, IncrementalInputs};
use crate::kv_cache::KvCacheState;
use crate::prefill::{self, PrefillInputs};

/// The attention mask supplied to a call, exactly one of the two kinds
/// spec.md §3 names: an additive float bias, or explicit boolean bytes plus
/// polarity. Both route straight into the fused softmax primitive (C2),
/// which already consumes boolean masks natively — there is no separate
/// materialize-to-additive step (see DESIGN.md's Open Question resolution).
pub enum AttentionMask<'a> {
    Additive(&'a [f32]),
    Boolean(&'a [u8], CausalPolarity),
}

/// Which code path a call resolved to, surfaced for logging/inspection
/// (spec.md §9 REDESIGN FLAGS; spec.md §4.7 selection table). Mirrors
/// `prefill::run`'s own internal sub-strategy decision so a caller can log
/// or assert on it without duplicating that logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelStrategy {
    Incremental,
    FullMatmul,
    BlockPanelBrgemm,
    /// FP32 prefill, regardless of `H_q` vs `H_kv` (spec.md §4.7 selection
    /// table: "fp32 | any | >1 | SGEMM prefill").
    Sgemm,
}

/// Owns the matmul backend and a fixed-size thread pool (spec.md §5:
/// "bounded thread pool whose size is fixed at construction").
pub struct Engine {
    backend: Box<dyn MatmulBackend>,
    pool: rayon::ThreadPool,
}

impl Engine {
    /// Build an engine with a pool sized to the available parallelism.
    pub fn new(backend: Box<dyn MatmulBackend>) -> Result<Self> {
        Self::with_threads(backend, 0)
    }

    /// Build an engine with an explicit thread count. `0` defers to
    /// rayon's default (one worker per logical CPU).
    pub fn with_threads(backend: Box<dyn MatmulBackend>, num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| AttnError::AllocationFailure(e.to_string()))?;
        Ok(Engine { backend, pool })
    }

    pub fn backend(&self) -> &dyn MatmulBackend {
        self.backend.as_ref()
    }

    /// The compute entry point (spec.md §6). `cache`/`beam_idx` are only
    /// consulted when `config.fuse_concat` is set. `q`, `k`, `v` are in
    /// logical axis order; `config.permute_axes` maps them to canonical
    /// `[B,H,L,S]` before dispatch (stride permutation only, never a copy).
    #[allow(clippy::too_many_arguments)]
    pub fn attention(
        &self,
        q: TensorView,
        k: TensorView,
        v: TensorView,
        mask: Option<AttentionMask>,
        alibi: Option<&[f32]>,
        scale: Option<f32>,
        config: &Config,
        mut cache: Option<&mut KvCacheState>,
        beam_idx: Option<&[i32]>,
        out_dtype: DType,
        out: &mut TensorViewMut,
    ) -> Result<()> {
        if q.ndim() != 4 || k.ndim() != 4 || v.ndim() != 4 {
            return Err(AttnError::PreconditionFailure(
                "Q, K, V must each be rank 4: [B, H, L, S]".into(),
            ));
        }
        if out_dtype != DType::F32 && !self.backend.supports(out_dtype) {
            return Err(AttnError::BackendUnavailable(out_dtype.to_string()));
        }

        let q = q.permute(&config.permute_axes)?;
        let k = k.permute(&config.permute_axes)?;
        let v = v.permute(&config.permute_axes)?;

        let h_q = q.dim(1);
        let q_len = q.dim(2);
        let s = q.dim(3);
        let h_kv = k.dim(1);
        if h_kv == 0 || h_q % h_kv != 0 {
            return Err(AttnError::PreconditionFailure(format!(
                "H_q={} is not a multiple of H_kv={}",
                h_q, h_kv
            )));
        }
        let scale = scale.unwrap_or_else(|| 1.0 / (s as f32).sqrt());

        let (additive_mask, causal_bool) = match mask {
            Some(AttentionMask::Additive(m)) => (Some(m), None),
            Some(AttentionMask::Boolean(bytes, polarity)) => (None, Some((bytes, polarity))),
            None => (None, None),
        };

        let l0 = cache.as_ref().map(|c| c.length()).unwrap_or(0);

        // Fused-concat: absorb the current step's K/V into the cache, then
        // read K/V for the kernel back out of the cache (spec.md §4.7 step 2).
        let (cache_k, cache_v): (Option<Vec<f32>>, Option<Vec<f32>>) = if config.fuse_concat {
            let cache = cache
                .as_deref_mut()
                .ok_or_else(|| AttnError::PreconditionFailure("fuse_concat requires a KV-cache handle".into()))?;
            let l1 = k.dim(2);
            let batch_out = beam_idx.map(|b| b.len()).unwrap_or(q.dim(0));
            let mut flat_k = vec![0.0f32; batch_out * h_kv * l1 * s];
            let mut flat_v = vec![0.0f32; batch_out * h_kv * l1 * s];
            for bi in 0..batch_out {
                for hi in 0..h_kv {
                    for t in 0..l1 {
                        for d in 0..s {
                            let off = ((bi * h_kv + hi) * l1 + t) * s + d;
                            flat_k[off] = k.get(&[bi, hi, t, d]);
                            flat_v[off] = v.get(&[bi, hi, t, d]);
                        }
                    }
                }
            }
            cache.append(&flat_k, &flat_v, l1, beam_idx)?;
            (Some(materialize_k(cache)), Some(materialize_v(cache)))
        } else {
            (None, None)
        };

        let materialized_kv_len = cache.as_ref().map(|c| c.length()).unwrap_or(0);

        // The kernel always writes into a canonical [B,H_q,q_len,S] scratch
        // buffer; the final write-back below either copies it straight
        // through or transposes into `[B,q_len,H_q*S]` for `output_blhxs`.
        let canonical_shape = Shape::new(vec![q.dim(0), h_q, q_len, s]);
        let mut canonical_buf = vec![0.0f32; canonical_shape.numel()];
        let mut canonical_view = TensorViewMut::from_contiguous(&mut canonical_buf, &canonical_shape)?;

        let effective_causal = config.is_causal || config.fuse_causal_attn;

        let strategy = if q_len == 1 || (config.fuse_concat && l0 > 0) {
            KernelStrategy::Incremental
        } else if out_dtype == DType::F32 {
            KernelStrategy::Sgemm
        } else if h_q == h_kv {
            KernelStrategy::FullMatmul
        } else {
            KernelStrategy::BlockPanelBrgemm
        };
        tracing::debug!(?strategy, b = q.dim(0), h_q, h_kv, q_len, "dispatch: kernel strategy selected");

        self.pool.install(|| -> Result<()> {
            match strategy {
                KernelStrategy::Incremental => {
                    let cache = cache
                        .ok_or_else(|| AttnError::PreconditionFailure("incremental path requires a KV-cache".into()))?;
                    let inputs = IncrementalInputs {
                        q,
                        scale,
                        alibi,
                        additive_mask,
                        causal_bool,
                        is_causal: effective_causal,
                    };
                    incremental::run(&inputs, cache, &mut canonical_view)
                }
                KernelStrategy::FullMatmul | KernelStrategy::BlockPanelBrgemm | KernelStrategy::Sgemm => {
                    let (k, v) = match (&cache_k, &cache_v) {
                        (Some(ck), Some(cv)) => {
                            let kv_shape = Shape::new(vec![q.dim(0), h_kv, materialized_kv_len, s]);
                            (
                                TensorView::from_contiguous(ck, kv_shape.clone())?,
                                TensorView::from_contiguous(cv, kv_shape)?,
                            )
                        }
                        _ => (k, v),
                    };
                    let inputs = PrefillInputs {
                        q,
                        k,
                        v,
                        scale,
                        alibi,
                        additive_mask,
                        causal_bool,
                        is_causal: effective_causal,
                        out_dtype,
                    };
                    prefill::run(&inputs, self.backend.as_ref(), &mut canonical_view)
                }
            }
        })?;

        let b = canonical_shape.dim(0);
        if config.output_blhxs {
            for bi in 0..b {
                for hi in 0..h_q {
                    for m in 0..q_len {
                        for d in 0..s {
                            out.set(&[bi, m, hi * s + d], canonical_view.get(&[bi, hi, m, d]));
                        }
                    }
                }
            }
        } else {
            for bi in 0..b {
                for hi in 0..h_q {
                    for m in 0..q_len {
                        for d in 0..s {
                            out.set(&[bi, hi, m, d], canonical_view.get(&[bi, hi, m, d]));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Read back the full live K history for every logical batch lane,
/// indirected through the beam table, into a contiguous `[B,H_kv,length,S]`
/// buffer the prefill kernel can treat as a plain tensor view.
fn materialize_k(cache: &KvCacheState) -> Vec<f32> {
    materialize(cache, true)
}

fn materialize_v(cache: &KvCacheState) -> Vec<f32> {
    materialize(cache, false)
}

fn materialize(cache: &KvCacheState, is_k: bool) -> Vec<f32> {
    let b = cache.batch();
    let h_kv = cache.h_kv();
    let s = cache.head_dim();
    let length = cache.length();
    let beam_table = cache.beam_table_k();
    let mut out = vec![0.0f32; b * h_kv * length * s];
    let mut row = vec![0.0f32; s];
    for bi in 0..b {
        for hi in 0..h_kv {
            for t in 0..length {
                let src_b = beam_table[bi * cache.capacity() + t] as usize;
                if is_k {
                    cache.read_k_row(src_b, hi, t, &mut row);
                } else {
                    cache.read_v_row(src_b, hi, t, &mut row);
                }
                let off = ((bi * h_kv + hi) * length + t) * s;
                out[off..off + s].copy_from_slice(&row);
            }
        }
    }
    out
}
