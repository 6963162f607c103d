//! Process-wide packed-kernel cache (spec.md §9: "model it as an
//! engine-scoped concurrent map with single-writer semantics at prepare
//! time to avoid thrashing under many model instances").
//!
//! The reference backend has no expensive kernel-compilation step, so the
//! cached value here is the cheap-to-recompute scratch-sizing triple; a
//! vendor backend (oneDNN primitive, BRGEMM micro-kernel descriptor) would
//! instead cache an opaque compiled object behind the same `GemmKey`.
//! Lookup is lock-free-ish via `parking_lot::RwLock::read`; insertion takes
//! the write lock only once per distinct shape, at prepare time, before the
//! parallel region forks (spec.md §5: "insertion is single-writer... before
//! fork").

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::backend::{GemmKey, MatmulBackend};

/// Cached per-shape sizing for a packed BRGEMM kernel.
#[derive(Debug, Clone, Copy)]
pub struct PrimitiveKernel {
    pub scratch_a_size: usize,
    pub scratch_b_size: usize,
    pub wsp_size: usize,
}

static CACHE: Lazy<RwLock<HashMap<GemmKey, PrimitiveKernel>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Look up (or compute and insert) the `PrimitiveKernel` for `key`.
///
/// Read path takes only the shared lock; a miss briefly upgrades to the
/// write lock to insert, matching the "lookup-only after insert" access
/// pattern spec.md §9 describes for the primitive cache.
pub fn prepare(key: GemmKey, backend: &dyn MatmulBackend) -> PrimitiveKernel {
    if let Some(k) = CACHE.read().get(&key) {
        return *k;
    }
    let kernel = PrimitiveKernel {
        scratch_a_size: backend.scratch_a_size(&key),
        scratch_b_size: backend.scratch_b_size(&key),
        wsp_size: backend.wsp_size(&key),
    };
    let mut w = CACHE.write();
    // Another thread may have inserted between our read-miss and taking
    // the write lock; `entry` keeps the first winner rather than clobbering.
    let inserted = *w.entry(key).or_insert(kernel);
    tracing::trace!(?key, "packed-kernel cache prepared");
    inserted
}

/// Number of distinct shapes currently cached. Test-only introspection.
#[cfg(test)]
pub fn len() -> usize {
    CACHE.read().len()
}
