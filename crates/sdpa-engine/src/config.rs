/// Element type the KV-cache stores rows as (spec.md §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvCachePrecision {
    F32,
    F16,
    Bf16,
    U8,
}

/// Per-call configuration recognized by `Engine::attention` (spec.md §6).
///
/// Plain struct, no file format or environment layer: the engine has no
/// config file, matching spec.md's "no file format, wire protocol, CLI, or
/// persistence." Construct via `Config::default()` and override fields, the
/// same pattern the teacher uses for its FFI-facing parameter structs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Transpose output to `[B, q_len, H_q*S]` instead of `[B,H_q,q_len,S]`.
    pub output_blhxs: bool,
    /// Treat the supplied mask as also encoding causal truncation.
    pub fuse_causal_attn: bool,
    /// Implicit causal masking with no explicit mask tensor.
    pub is_causal: bool,
    /// Append the current step's K/V into the KV-cache before computing.
    pub fuse_concat: bool,
    /// Logical-to-canonical axis permutation applied to all tensor views.
    pub permute_axes: [usize; 4],
    /// Storage precision for the KV-cache when `fuse_concat` is set.
    pub kv_cache_precision: KvCachePrecision,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            output_blhxs: false,
            fuse_causal_attn: false,
            is_causal: false,
            fuse_concat: false,
            permute_axes: [0, 1, 2, 3],
            kv_cache_precision: KvCachePrecision::F32,
        }
    }
}
