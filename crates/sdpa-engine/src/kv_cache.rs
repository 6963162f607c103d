//! Per-layer KV-cache state machine (C6): geometric growth, beam reorder via
//! an index table, reset, and optional int8 packing.
//!
//! Grounded on the teacher's flat `KvCache` (`k: Vec<Vec<f32>>` per layer,
//! `update`/`get_k`/`get_v`/`reset`), generalized from "one batch lane, no
//! beam indirection" to the full `[B, H_kv, capacity, S]` layout with a beam
//! table (spec.md §3, §4.6).

use sdpa_tensor::{quant, CpuStorage, DType, ScaleZeroPoint};

use crate::config::KvCachePrecision;
use crate::error::{AttnError, Result};

fn precision_dtype(p: KvCachePrecision) -> DType {
    match p {
        KvCachePrecision::F32 => DType::F32,
        KvCachePrecision::F16 => DType::F16,
        KvCachePrecision::Bf16 => DType::Bf16,
        KvCachePrecision::U8 => DType::U8,
    }
}

/// Owned per-layer KV-cache state: `past_K`/`past_V` `[B,H_kv,capacity,S]`,
/// optional `[B,H_kv,capacity]` scale/zero-point tables when quantized, and
/// a single shared beam table (spec.md §9: "storing identical K and V
/// tables is defensive duplication... an implementation may collapse to
/// one provided readers never assume divergent content" — both
/// `beam_table_k()` and `beam_table_v()` below return the same table).
pub struct KvCacheState {
    h_kv: usize,
    head_dim: usize,
    precision: KvCachePrecision,
    batch: usize,
    capacity: usize,
    length: usize,
    is_reset: bool,
    past_k: CpuStorage,
    past_v: CpuStorage,
    scale_zp_k: Vec<ScaleZeroPoint>,
    scale_zp_v: Vec<ScaleZeroPoint>,
    /// `[batch * capacity]`; entry `beam_table[b*capacity+t]` names the
    /// physical lane that produced timestep `t` of logical sequence `b`.
    beam_table: Vec<i32>,
}

impl KvCacheState {
    /// Construct an empty cache (state `Empty`: capacity 0, length 0) for
    /// `batch` sequences of `h_kv` heads with head dimension `head_dim`.
    pub fn new(batch: usize, h_kv: usize, head_dim: usize, precision: KvCachePrecision) -> Self {
        KvCacheState {
            h_kv,
            head_dim,
            precision,
            batch,
            capacity: 0,
            length: 0,
            is_reset: false,
            past_k: CpuStorage::zeros(precision_dtype(precision), 0),
            past_v: CpuStorage::zeros(precision_dtype(precision), 0),
            scale_zp_k: Vec::new(),
            scale_zp_v: Vec::new(),
            beam_table: Vec::new(),
        }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn h_kv(&self) -> usize {
        self.h_kv
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_reset(&self) -> bool {
        self.is_reset
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.precision, KvCachePrecision::U8)
    }

    /// Row-major element offset of `(b,h,t)`'s first element.
    #[inline]
    fn row_offset(&self, b: usize, h: usize, t: usize) -> usize {
        ((b * self.h_kv + h) * self.capacity + t) * self.head_dim
    }

    #[inline]
    fn scale_zp_index(&self, b: usize, h: usize, t: usize) -> usize {
        (b * self.h_kv + h) * self.capacity + t
    }

    /// Read-only view of the K cache storage (invariant I4: whenever
    /// `is_quantized()`, every valid `(b,h,t) < length` has a matching
    /// `scale_zp_k` entry).
    pub fn past_k(&self) -> &CpuStorage {
        &self.past_k
    }

    pub fn past_v(&self) -> &CpuStorage {
        &self.past_v
    }

    pub fn scale_zp_k(&self) -> &[ScaleZeroPoint] {
        &self.scale_zp_k
    }

    pub fn scale_zp_v(&self) -> &[ScaleZeroPoint] {
        &self.scale_zp_v
    }

    /// The beam table (spec.md §9: collapsed single table, both K and V
    /// readers consult this one).
    pub fn beam_table_k(&self) -> &[i32] {
        &self.beam_table
    }

    pub fn beam_table_v(&self) -> &[i32] {
        &self.beam_table
    }

    /// Read one `(b,h,t)` row of K, dequantizing if the cache is U8.
    pub fn read_k_row(&self, b: usize, h: usize, t: usize, out: &mut [f32]) {
        Self::read_row(&self.past_k, &self.scale_zp_k, self, b, h, t, out);
    }

    pub fn read_v_row(&self, b: usize, h: usize, t: usize, out: &mut [f32]) {
        Self::read_row(&self.past_v, &self.scale_zp_v, self, b, h, t, out);
    }

    fn read_row(
        storage: &CpuStorage,
        szp_table: &[ScaleZeroPoint],
        cache: &KvCacheState,
        b: usize,
        h: usize,
        t: usize,
        out: &mut [f32],
    ) {
        let off = cache.row_offset(b, h, t);
        if cache.is_quantized() {
            let szp = szp_table[cache.scale_zp_index(b, h, t)];
            for (d, o) in out.iter_mut().enumerate() {
                *o = quant::dequantize_one(storage.get_f32(off + d) as u8, szp);
            }
        } else {
            for (d, o) in out.iter_mut().enumerate() {
                *o = storage.get_f32(off + d);
            }
        }
    }

    /// Mark the cache logically empty; the next `append` treats history as
    /// absent but may reuse the current allocation (spec.md §4.6 "On
    /// reset").
    pub fn reset(&mut self) {
        self.is_reset = true;
        self.length = 0;
        tracing::debug!(capacity = self.capacity, "kv-cache reset");
    }

    /// Append the current step's K/V (`[batch_out, h_kv, l1, head_dim]`
    /// flattened row-major, where `batch_out = beam_idx.map(len).unwrap_or
    /// (self.batch())`) and advance the beam table.
    ///
    /// `beam_idx[b]` names the physical lane the (possibly reordered or
    /// expanded) logical sequence `b` inherits its history from. `None`
    /// means identity on the existing batch (no beam search in play).
    pub fn append(&mut self, cur_k: &[f32], cur_v: &[f32], l1: usize, beam_idx: Option<&[i32]>) -> Result<()> {
        let row = self.h_kv * self.head_dim;
        let batch_out = beam_idx.map(|idx| idx.len()).unwrap_or(self.batch);
        if batch_out == 0 {
            return Err(AttnError::PreconditionFailure("append batch must be nonzero".into()));
        }
        let expected = batch_out * l1 * row;
        if cur_k.len() != expected {
            return Err(AttnError::PreconditionFailure(format!(
                "cur_k has {} elements, expected batch*l1*h_kv*head_dim={}",
                cur_k.len(),
                expected
            )));
        }
        if cur_v.len() != cur_k.len() {
            return Err(AttnError::PreconditionFailure(
                "cur_k and cur_v must have matching length".into(),
            ));
        }
        if let Some(idx) = beam_idx {
            for &i in idx {
                if i < 0 || i as usize >= self.batch {
                    return Err(AttnError::CacheInconsistency(format!(
                        "beam_idx entry {} out of range for prior batch {}",
                        i, self.batch
                    )));
                }
            }
        }

        let l0 = if self.is_reset { 0 } else { self.length };
        let batch_changed = batch_out != self.batch;

        if batch_changed {
            self.expand_and_gather(beam_idx.unwrap(), batch_out, l0, l1)?;
        } else {
            if l0 + l1 > self.capacity {
                self.grow(l0, l1)?;
            }
            self.reorder_beam_table(beam_idx, l0);
        }
        self.append_identity_beam_rows(l0, l1);
        self.write_step(cur_k, cur_v, l0, l1)?;

        self.length = l0 + l1;
        self.is_reset = false;
        tracing::debug!(
            batch = self.batch,
            length = self.length,
            capacity = self.capacity,
            "kv-cache append complete"
        );
        Ok(())
    }

    /// Pure capacity growth: same batch, same logical lane ownership.
    /// Reallocates to `capacity := 2*(l0+l1)` and copies the live prefix
    /// verbatim (identity on physical lanes; spec.md §4.6 growth rule).
    fn grow(&mut self, l0: usize, l1: usize) -> Result<()> {
        let new_capacity = 2 * (l0 + l1);
        let dtype = precision_dtype(self.precision);
        let mut new_k = CpuStorage::zeros(dtype, self.batch * self.h_kv * new_capacity * self.head_dim);
        let mut new_v = CpuStorage::zeros(dtype, self.batch * self.h_kv * new_capacity * self.head_dim);
        let quantized = self.is_quantized();
        let mut new_szp_k = if quantized {
            vec![ScaleZeroPoint { scale: 1.0, zero_point: 0.0 }; self.batch * self.h_kv * new_capacity]
        } else {
            Vec::new()
        };
        let mut new_szp_v = new_szp_k.clone();
        let mut new_beam_table = vec![0i32; self.batch * new_capacity];

        for b in 0..self.batch {
            for h in 0..self.h_kv {
                for t in 0..l0 {
                    self.copy_physical_row(b, h, t, &mut new_k, &mut new_v, new_capacity, b);
                    if quantized {
                        let src = self.scale_zp_index(b, h, t);
                        let dst = (b * self.h_kv + h) * new_capacity + t;
                        new_szp_k[dst] = self.scale_zp_k[src];
                        new_szp_v[dst] = self.scale_zp_v[src];
                    }
                }
            }
            for t in 0..l0 {
                new_beam_table[b * new_capacity + t] = self.beam_table[b * self.capacity + t];
            }
        }

        self.past_k = new_k;
        self.past_v = new_v;
        self.scale_zp_k = new_szp_k;
        self.scale_zp_v = new_szp_v;
        self.beam_table = new_beam_table;
        self.capacity = new_capacity;
        tracing::debug!(new_capacity, "kv-cache grown");
        Ok(())
    }

    /// Beam expansion: batch size changes from `self.batch` to
    /// `batch_out`. Physically gathers each new lane's history from its
    /// source lane `beam_idx[b]` (spec.md §4.6 "resetBeamTablePastKV"),
    /// since the new lane count has no prior physical storage of its own.
    fn expand_and_gather(&mut self, beam_idx: &[i32], batch_out: usize, l0: usize, l1: usize) -> Result<()> {
        let new_capacity = 2 * (l0 + l1).max(1);
        let dtype = precision_dtype(self.precision);
        let mut new_k = CpuStorage::zeros(dtype, batch_out * self.h_kv * new_capacity * self.head_dim);
        let mut new_v = CpuStorage::zeros(dtype, batch_out * self.h_kv * new_capacity * self.head_dim);
        let quantized = self.is_quantized();
        let mut new_szp_k = if quantized {
            vec![ScaleZeroPoint { scale: 1.0, zero_point: 0.0 }; batch_out * self.h_kv * new_capacity]
        } else {
            Vec::new()
        };
        let mut new_szp_v = new_szp_k.clone();
        let mut new_beam_table = vec![0i32; batch_out * new_capacity];

        for b in 0..batch_out {
            let src_b = beam_idx[b] as usize;
            for h in 0..self.h_kv {
                for t in 0..l0 {
                    self.copy_physical_row(src_b, h, t, &mut new_k, &mut new_v, new_capacity, b);
                    if quantized {
                        let src = self.scale_zp_index(src_b, h, t);
                        let dst = (b * self.h_kv + h) * new_capacity + t;
                        new_szp_k[dst] = self.scale_zp_k[src];
                        new_szp_v[dst] = self.scale_zp_v[src];
                    }
                }
            }
            for t in 0..l0 {
                // Gathered physically onto lane b: table becomes identity.
                new_beam_table[b * new_capacity + t] = b as i32;
            }
        }

        self.past_k = new_k;
        self.past_v = new_v;
        self.scale_zp_k = new_szp_k;
        self.scale_zp_v = new_szp_v;
        self.beam_table = new_beam_table;
        self.capacity = new_capacity;
        self.batch = batch_out;
        tracing::debug!(batch_out, new_capacity, "kv-cache beam-expanded");
        Ok(())
    }

    /// Copy one physical `(src_b,h,t)` row from the current buffers into
    /// `(dst_b,h,t)` of freshly allocated `dst_k`/`dst_v` (sized for
    /// `dst_capacity`). Element-wise through `f32` round-trips losslessly
    /// for U8 codes already in `[0,255]`.
    fn copy_physical_row(
        &self,
        src_b: usize,
        h: usize,
        t: usize,
        dst_k: &mut CpuStorage,
        dst_v: &mut CpuStorage,
        dst_capacity: usize,
        dst_b: usize,
    ) {
        let src_off = self.row_offset(src_b, h, t);
        let dst_off = ((dst_b * self.h_kv + h) * dst_capacity + t) * self.head_dim;
        for d in 0..self.head_dim {
            dst_k.set_f32(dst_off + d, self.past_k.get_f32(src_off + d));
            dst_v.set_f32(dst_off + d, self.past_v.get_f32(src_off + d));
        }
    }

    /// Beam-table reorder step 2 (spec.md §4.6): for each lane `b`, copy
    /// `beam_table[b, 0..l0)` from the pre-update table at
    /// `beam_idx[b]`. Physical K/V rows are untouched — only the 4-byte
    /// indices move. A `None` or identity `beam_idx` is a no-op.
    fn reorder_beam_table(&mut self, beam_idx: Option<&[i32]>, l0: usize) {
        let Some(idx) = beam_idx else { return };
        if l0 == 0 {
            return;
        }
        let old = self.beam_table.clone();
        for (b, &src_b) in idx.iter().enumerate() {
            let src_b = src_b as usize;
            for t in 0..l0 {
                self.beam_table[b * self.capacity + t] = old[src_b * self.capacity + t];
            }
        }
    }

    /// Beam-table step 3: append identity for the new step's rows (spec.md
    /// §4.6), and — when `l0 == 0` (fresh or post-reset) — this alone
    /// covers the full valid range, satisfying step 1's "initialize
    /// identity" without a separate code path.
    fn append_identity_beam_rows(&mut self, l0: usize, l1: usize) {
        for b in 0..self.batch {
            for i in 0..l1 {
                self.beam_table[b * self.capacity + l0 + i] = b as i32;
            }
        }
    }

    /// Physically write `cur_k`/`cur_v` into `past_{K,V}[:,:,l0..l0+l1,:]`,
    /// quantizing per-row into `scale_zp_{K,V}` if the cache is U8 (spec.md
    /// §4.3 granularity: one pair per `(b,h_kv,t)`, shared by K and V).
    fn write_step(&mut self, cur_k: &[f32], cur_v: &[f32], l0: usize, l1: usize) -> Result<()> {
        let row = self.h_kv * self.head_dim;
        for b in 0..self.batch {
            for h in 0..self.h_kv {
                for i in 0..l1 {
                    let t = l0 + i;
                    let src_off = b * l1 * row + i * row + h * self.head_dim;
                    let k_row = &cur_k[src_off..src_off + self.head_dim];
                    let v_row = &cur_v[src_off..src_off + self.head_dim];
                    let dst_off = self.row_offset(b, h, t);
                    if self.is_quantized() {
                        let (codes_k, szp_k) = quant::quantize_row(k_row);
                        let (codes_v, szp_v) = quant::quantize_row(v_row);
                        for d in 0..self.head_dim {
                            self.past_k.set_f32(dst_off + d, codes_k[d] as f32);
                            self.past_v.set_f32(dst_off + d, codes_v[d] as f32);
                        }
                        let szp_idx = self.scale_zp_index(b, h, t);
                        self.scale_zp_k[szp_idx] = szp_k;
                        self.scale_zp_v[szp_idx] = szp_v;
                    } else {
                        for d in 0..self.head_dim {
                            self.past_k.set_f32(dst_off + d, k_row[d]);
                            self.past_v.set_f32(dst_off + d, v_row[d]);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
