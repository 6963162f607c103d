use std::fmt::Debug;

use crate::dtype::DType;
use crate::error::{Result, TensorError};

/// The 7-tuple key spec.md §4.1 names for the packed BRGEMM cache: "Keyed on
/// the 7-tuple; cached." Also reused to key the general-matmul primitive
/// descriptor cache (spec.md §9: "keyed structs with structural equality and
/// hashing").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GemmKey {
    pub dtype: DType,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
}

impl GemmKey {
    pub fn new(dtype: DType, m: usize, n: usize, k: usize, lda: usize, ldb: usize, ldc: usize) -> Self {
        GemmKey {
            dtype,
            m,
            n,
            k,
            lda,
            ldb,
            ldc,
        }
    }
}

/// An opaque packed right-hand-side panel. Only `MatmulBackend::pack_b`
/// constructs one; callers pass it back to `execute_brgemm` unexamined
/// (spec.md §4.1: "packed-B layout is opaque and only produced by
/// `pack_B`").
#[derive(Debug, Clone)]
pub struct PackedPanel {
    data: Vec<f32>,
    key: GemmKey,
}

impl PackedPanel {
    fn new(data: Vec<f32>, key: GemmKey) -> Self {
        PackedPanel { data, key }
    }

    /// The key this panel was packed for — `execute_brgemm` implementations
    /// should assert the caller's key matches before touching `data`.
    pub fn key(&self) -> &GemmKey {
        &self.key
    }
}

/// Uniform wrapper over matmul backends (spec.md §4.1, C1): general matmul,
/// packed BRGEMM, and SGEMM, all framed as `C = alpha*op(A)*op(B) +
/// beta*C`. In production this interface sits in front of oneDNN matmul,
/// a BRGEMM micro-kernel, and MLAS SGEMM; here `ReferenceBackend` is a
/// correctness-first pure-Rust stand-in for all three, matching the
/// spec.md §1 framing of those kernels as "consumed through a narrow
/// interface."
pub trait MatmulBackend: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// True if this backend can serve `dtype` (e.g. a non-AVX512-BF16 host
    /// reports `false` for `DType::Bf16`); the dispatcher turns a `false`
    /// here into `BackendUnavailable`.
    fn supports(&self, dtype: DType) -> bool;

    /// General matmul producing FP32 scores even when inputs are reduced
    /// precision (spec.md §4.1 item 1). `a` is `[m,k]`, `b` is `[k,n]`
    /// (already transposed by the caller if `transpose_b` was requested at
    /// the view level), both row-major with the given leading dimensions.
    /// `c` accumulates `alpha*A@B + beta*C`.
    #[allow(clippy::too_many_arguments)]
    fn general_matmul(
        &self,
        a: &[f32],
        b: &[f32],
        m: usize,
        k: usize,
        n: usize,
        lda: usize,
        ldb: usize,
        ldc: usize,
        alpha: f32,
        beta: f32,
        c: &mut [f32],
    ) -> Result<()>;

    /// FP32-only thin GEMM call with leading dims and an explicit
    /// transpose-B flag (spec.md §4.1 item 3), used as the FP32 fallback
    /// prefill path (spec.md §4.4: "FP32 fallback uses SGEMM") and the
    /// dedicated SGEMM prefill strategy (spec.md §4.7 selection table:
    /// "fp32 | any | >1 | SGEMM prefill"), wired in by
    /// `sdpa-engine::prefill::run_sgemm`.
    ///
    /// When `transpose_b` is set, `b` is `[n, k]` row-major with leading
    /// dimension `ldb` (`ldb >= k`) and `op(B) = B^T`; the default
    /// implementation transposes into a scratch buffer and forwards to
    /// `general_matmul` — a real MLAS-backed backend would fold the
    /// transpose into its own kernel instead.
    #[allow(clippy::too_many_arguments)]
    fn sgemm(
        &self,
        a: &[f32],
        b: &[f32],
        m: usize,
        k: usize,
        n: usize,
        lda: usize,
        ldb: usize,
        ldc: usize,
        transpose_b: bool,
        alpha: f32,
        beta: f32,
        c: &mut [f32],
    ) -> Result<PackedPanelExecuted> {
        if !transpose_b {
            self.general_matmul(a, b, m, k, n, lda, ldb, ldc, alpha, beta, c)?;
            return Ok(PackedPanelExecuted);
        }
        if ldb < k {
            return Err(TensorError::Other(format!(
                "sgemm: ldb={} smaller than k={} for transpose_b",
                ldb, k
            )));
        }
        if b.len() < n * ldb {
            return Err(TensorError::Other(format!(
                "sgemm: b too small ({} elems) for n={} ldb={}",
                b.len(),
                n,
                ldb
            )));
        }
        let mut bt = vec![0.0f32; k * n];
        for row in 0..n {
            for col in 0..k {
                bt[col * n + row] = b[row * ldb + col];
            }
        }
        self.general_matmul(a, &bt, m, k, n, lda, n, ldc, alpha, beta, c)?;
        Ok(PackedPanelExecuted)
    }

    /// Pack `src` (the `[k,n]` right-hand side, or `[n,k]` if
    /// `b_transposed`) into the backend's opaque panel layout for `key`.
    fn pack_b(&self, key: &GemmKey, src: &[f32], b_transposed: bool) -> Result<PackedPanel>;

    fn scratch_a_size(&self, key: &GemmKey) -> usize;
    fn scratch_b_size(&self, key: &GemmKey) -> usize;
    fn wsp_size(&self, key: &GemmKey) -> usize;

    /// Execute a packed BRGEMM tile: `c[0..tail_m, ..] = a[0..tail_m,..] @
    /// packed_b`, using `wsp` and `scratch_a` as backend workspace.
    /// `tail_m`, when `Some`, handles the "tail M-blocks... flagged at call
    /// time" case from spec.md §4.1.
    #[allow(clippy::too_many_arguments)]
    fn execute_brgemm(
        &self,
        key: &GemmKey,
        tail_m: Option<usize>,
        a: &[f32],
        packed_b: &PackedPanel,
        c: &mut [f32],
        wsp: &mut [f32],
        scratch_a: &mut [f32],
    ) -> Result<()>;
}

/// Marker returned by the default `sgemm` forwarding path; callers only care
/// that the call succeeded.
#[derive(Debug, Clone, Copy)]
pub struct PackedPanelExecuted;

/// Pure-Rust reference implementation of `MatmulBackend`.
///
/// Straightforward triple-nested loops, correctness over peak performance —
/// a stand-in for oneDNN/BRGEMM/MLAS when no vendor kernel is linked in.
/// `pack_b` here just copies `src` into row-major `[n,k]` (transposed)
/// layout so `execute_brgemm`'s inner loop can stream it contiguously; a
/// real BRGEMM backend would block/interleave it for its micro-kernel tile
/// shape instead.
#[derive(Debug, Clone, Default)]
pub struct ReferenceBackend;

impl ReferenceBackend {
    pub fn new() -> Self {
        ReferenceBackend
    }
}

impl MatmulBackend for ReferenceBackend {
    fn name(&self) -> &str {
        "reference"
    }

    fn supports(&self, _dtype: DType) -> bool {
        // The reference backend always upconverts to f32 internally, so it
        // can serve every dtype spec.md enumerates (BF16/F16/F32 inputs,
        // F32 accumulation); a vendor backend would report false for
        // dtypes its ISA doesn't support.
        true
    }

    fn general_matmul(
        &self,
        a: &[f32],
        b: &[f32],
        m: usize,
        k: usize,
        n: usize,
        lda: usize,
        ldb: usize,
        ldc: usize,
        alpha: f32,
        beta: f32,
        c: &mut [f32],
    ) -> Result<()> {
        if a.len() < m * lda.max(k) || lda < k {
            return Err(TensorError::Other(format!(
                "general_matmul: a too small ({} elems) for m={} lda={}",
                a.len(),
                m,
                lda
            )));
        }
        if b.len() < k * ldb.max(n) || ldb < n {
            return Err(TensorError::Other(format!(
                "general_matmul: b too small ({} elems) for k={} ldb={}",
                b.len(),
                k,
                ldb
            )));
        }
        if c.len() < m * ldc.max(n) || ldc < n {
            return Err(TensorError::Other(format!(
                "general_matmul: c too small ({} elems) for m={} ldc={}",
                c.len(),
                m,
                ldc
            )));
        }

        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0f32;
                for p in 0..k {
                    sum += a[i * lda + p] * b[p * ldb + j];
                }
                let idx = i * ldc + j;
                c[idx] = alpha * sum + beta * c[idx];
            }
        }
        Ok(())
    }

    fn pack_b(&self, key: &GemmKey, src: &[f32], b_transposed: bool) -> Result<PackedPanel> {
        let (k, n) = (key.k, key.n);
        if src.len() < k * n {
            return Err(TensorError::Other(format!(
                "pack_b: src has {} elements, need k*n={}",
                src.len(),
                k * n
            )));
        }
        // Normalize to row-major [k, n] regardless of incoming transpose,
        // so execute_brgemm always streams the same layout.
        let mut packed = vec![0.0f32; k * n];
        if b_transposed {
            // src is [n, k]; transpose into [k, n].
            for row in 0..n {
                for col in 0..k {
                    packed[col * n + row] = src[row * k + col];
                }
            }
        } else {
            packed.copy_from_slice(&src[..k * n]);
        }
        Ok(PackedPanel::new(packed, *key))
    }

    fn scratch_a_size(&self, key: &GemmKey) -> usize {
        key.m * key.k
    }

    fn scratch_b_size(&self, key: &GemmKey) -> usize {
        key.k * key.n
    }

    fn wsp_size(&self, key: &GemmKey) -> usize {
        key.m * key.n
    }

    fn execute_brgemm(
        &self,
        key: &GemmKey,
        tail_m: Option<usize>,
        a: &[f32],
        packed_b: &PackedPanel,
        c: &mut [f32],
        _wsp: &mut [f32],
        scratch_a: &mut [f32],
    ) -> Result<()> {
        if packed_b.key() != key {
            return Err(TensorError::Other(
                "execute_brgemm: packed panel was built for a different key".to_string(),
            ));
        }
        let m = tail_m.unwrap_or(key.m);
        if a.len() < m * key.lda {
            return Err(TensorError::Other(format!(
                "execute_brgemm: a too small ({} elems) for m={} lda={}",
                a.len(),
                m,
                key.lda
            )));
        }
        if scratch_a.len() < m * key.k {
            return Err(TensorError::Other(
                "execute_brgemm: scratch_a smaller than scratch_a_size()".to_string(),
            ));
        }
        if c.len() < m * key.ldc {
            return Err(TensorError::Other(format!(
                "execute_brgemm: c too small ({} elems) for m={} ldc={}",
                c.len(),
                m,
                key.ldc
            )));
        }

        // Stage the (possibly strided) A tile into contiguous scratch, then
        // run the dense GEMM against the packed, row-major [k,n] panel.
        for i in 0..m {
            scratch_a[i * key.k..i * key.k + key.k]
                .copy_from_slice(&a[i * key.lda..i * key.lda + key.k]);
        }
        for i in 0..m {
            for j in 0..key.n {
                let mut sum = 0.0f32;
                for p in 0..key.k {
                    sum += scratch_a[i * key.k + p] * packed_b.data[p * key.n + j];
                }
                c[i * key.ldc + j] = sum;
            }
        }
        Ok(())
    }
}
