//! Masked softmax (C2): the single fused primitive consumed by both the
//! prefill and incremental kernels.

use crate::error::{Result, TensorError};

/// Selects which bit value in a boolean causal mask means "keep".
///
/// `SelectNegInfAtZero` matches spec.md's `select_nfltmax_at_0 = true`: a
/// zero byte means mask out. `SelectNegInfAtOne` is the flipped polarity,
/// included so P8 (mask polarity) can be expressed as "bit-flip the mask
/// and flip the polarity, get the identical result" without the caller
/// pre-inverting bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalPolarity {
    SelectNegInfAtZero,
    SelectNegInfAtOne,
}

impl CausalPolarity {
    fn masks_out(&self, byte: u8) -> bool {
        match self {
            CausalPolarity::SelectNegInfAtZero => byte == 0,
            CausalPolarity::SelectNegInfAtOne => byte != 0,
        }
    }
}

/// Element-wise recipe for one row of scaled dot-product attention scores,
/// mirroring spec.md §4.2 steps 1-5 before the softmax itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftmaxRowArgs<'a> {
    pub d_scale: f32,
    pub alibi: Option<&'a [f32]>,
    pub add_mask: Option<&'a [f32]>,
    pub causal_bool: Option<(&'a [u8], CausalPolarity)>,
    /// Number of leading positions that are live; positions `>= n_causal`
    /// are forced to -inf (auto-causal truncation, or an all-masked row
    /// when zero).
    pub n_causal: usize,
}

/// Apply the masked-softmax primitive to one row of raw dot-product scores.
///
/// `input` and `output` both have length `kv_len`; `output[n]` receives the
/// down-cast softmax weight for key position `n`. `output` may alias
/// `input`'s backing storage at the call site but this function takes
/// disjoint slices, matching C2's "scale, mask, softmax" contract in
/// isolation from storage concerns.
///
/// An all-`-inf` row (`n_causal == 0`, or every element masked) produces
/// all zeros rather than `NaN` (spec.md B3): the max-subtraction step
/// degenerates to `exp(-inf - -inf)`, which this function special-cases.
pub fn softmax_row(input: &[f32], output: &mut [f32], args: SoftmaxRowArgs) -> Result<()> {
    let kv_len = input.len();
    if output.len() != kv_len {
        return Err(TensorError::ShapeMismatch {
            expected: vec![kv_len],
            got: vec![output.len()],
        });
    }
    if let Some(a) = args.alibi {
        if a.len() != kv_len {
            return Err(TensorError::ShapeMismatch {
                expected: vec![kv_len],
                got: vec![a.len()],
            });
        }
    }
    if let Some(m) = args.add_mask {
        if m.len() != kv_len {
            return Err(TensorError::ShapeMismatch {
                expected: vec![kv_len],
                got: vec![m.len()],
            });
        }
    }
    if let Some((bytes, _)) = args.causal_bool {
        if bytes.len() != kv_len {
            return Err(TensorError::ShapeMismatch {
                expected: vec![kv_len],
                got: vec![bytes.len()],
            });
        }
    }

    let mut scores = vec![0.0f32; kv_len];
    for n in 0..kv_len {
        let mut x = input[n] * args.d_scale;
        if let Some(a) = args.alibi {
            x += a[n];
        }
        if let Some(m) = args.add_mask {
            x += m[n];
        }
        if let Some((bytes, polarity)) = args.causal_bool {
            if polarity.masks_out(bytes[n]) {
                x = f32::NEG_INFINITY;
            }
        }
        if n >= args.n_causal {
            x = f32::NEG_INFINITY;
        }
        scores[n] = x;
    }

    let max_val = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    if !max_val.is_finite() {
        // Every position masked: B3 says zeros, not NaN.
        output.fill(0.0);
        return Ok(());
    }

    let mut sum = 0.0f32;
    for n in 0..kv_len {
        let e = (scores[n] - max_val).exp();
        output[n] = e;
        sum += e;
    }
    for n in 0..kv_len {
        output[n] /= sum;
    }
    Ok(())
}

/// Run `softmax_row` and down-cast through `out_dtype`'s representation
/// (spec.md §4.2 step 7), writing the result back into `output` in place.
pub fn softmax_row_cast(
    input: &[f32],
    output: &mut [f32],
    args: SoftmaxRowArgs,
    out_dtype: crate::dtype::DType,
) -> Result<()> {
    softmax_row(input, output, args)?;
    for x in output.iter_mut() {
        *x = out_dtype.cast_round_trip(*x);
    }
    Ok(())
}
