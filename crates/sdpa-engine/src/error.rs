use thiserror::Error;

/// The four fatal-to-the-call error kinds (spec.md §7). All are synchronous:
/// they terminate the current call with no partial effects on the caller's
/// tensors, and `KvCacheState::append` is transactional (built into a
/// scratch buffer, swapped in only on full success).
#[derive(Error, Debug)]
pub enum AttnError {
    /// Shape/precision/config combination this engine does not support:
    /// rank mismatch, `H_q % H_kv != 0`, a BF16 path requested without
    /// backend support, mask rank too high, etc.
    #[error("precondition failed: {0}")]
    PreconditionFailure(String),

    /// No matmul backend selected at construction matches the requested
    /// precision (e.g. BF16 requested, backend only supports F32).
    #[error("backend unavailable for dtype {0}")]
    BackendUnavailable(String),

    /// Scratch or cache growth could not be satisfied.
    #[error("allocation failed: {0}")]
    AllocationFailure(String),

    /// `beam_idx[b] >= prior_batch`, or reset-state flags disagree between
    /// the K and V caches.
    #[error("cache inconsistency: {0}")]
    CacheInconsistency(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] sdpa_tensor::TensorError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, AttnError>;
