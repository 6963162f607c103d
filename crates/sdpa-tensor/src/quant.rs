//! Per-row asymmetric int8 quantization for the KV-cache (C3).
//!
//! Granularity is one `(scale, zero_point)` pair per `(b, h_kv, t)` row,
//! applied identically to the K and V entries of that time step; the pair
//! itself is just a plain tuple here, stored by the caller (the KV-cache
//! state machine) alongside the row it was derived from.

/// A row's `(scale, zero_point)` quantization parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleZeroPoint {
    pub scale: f32,
    pub zero_point: f32,
}

/// Quantize one `[S]` row to `u8` codes, computing scale/zero-point from
/// the row's own min/max (spec.md §4.3).
///
/// A constant row (`max == min`) would divide by zero; `scale` is pinned
/// to `1.0` in that case and every code is `zero_point` (all values equal
/// the row's constant), so `dequantize` still round-trips exactly.
pub fn quantize_row(row: &[f32]) -> (Vec<u8>, ScaleZeroPoint) {
    let min = row.iter().copied().fold(f32::INFINITY, f32::min);
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    let scale = if max > min { (max - min) / 255.0 } else { 1.0 };
    let zero_point = if max > min { -min / scale } else { 0.0 };

    let codes = row
        .iter()
        .map(|&x| (x / scale + zero_point).round().clamp(0.0, 255.0) as u8)
        .collect();

    (codes, ScaleZeroPoint { scale, zero_point })
}

/// Dequantize one row of `u8` codes back to `f32` using `szp`.
pub fn dequantize_row(codes: &[u8], szp: ScaleZeroPoint) -> Vec<f32> {
    codes
        .iter()
        .map(|&q| (q as f32 - szp.zero_point) * szp.scale)
        .collect()
}

/// Dequantize a single code in place, the hot-path form used by the
/// incremental kernel's per-timestep gather (spec.md §4.5 step 1).
#[inline]
pub fn dequantize_one(code: u8, szp: ScaleZeroPoint) -> f32 {
    (code as f32 - szp.zero_point) * szp.scale
}
