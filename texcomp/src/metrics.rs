//! Squared error accumulation shared by the LDR and HDR encoders.

use crate::lanes::{LaneF32, LaneI16, LaneU16, LaneU32, LANE_WIDTH};

/// Accumulates integer squared residuals per channel across the pixels of a
/// candidate, finalized once with per channel squared weights.
#[derive(Debug, Clone)]
pub struct AggregatedError<const N: usize> {
    accum: [LaneU32; N],
}

impl<const N: usize> AggregatedError<N> {
    pub fn new() -> Self {
        AggregatedError {
            accum: [LaneU32::zero(); N],
        }
    }

    #[inline]
    pub fn add(&mut self, reconstructed: &[LaneU16; N], original: &[LaneU16; N], channels: usize) {
        for ch in 0..channels {
            let mut sq = LaneU32::zero();
            for i in 0..LANE_WIDTH {
                let d = reconstructed[ch].lane(i) as i32 - original[ch].lane(i) as i32;
                sq.set_lane(i, (d * d) as u32);
            }
            self.accum[ch] = self.accum[ch] + sq;
        }
    }

    pub fn finalize(&self, channel_weights_sq: &[f32; N]) -> LaneF32 {
        let mut total = LaneF32::zero();
        for ch in 0..N {
            total = total + self.accum[ch].to_f32() * channel_weights_sq[ch];
        }
        total
    }
}

impl<const N: usize> Default for AggregatedError<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Immediate weighted squared error for one pixel, no accumulator.
#[inline]
pub fn compute_error_ldr_simple<const N: usize>(
    reconstructed: &[LaneU16; N],
    original: &[LaneU16; N],
    channels: usize,
    channel_weights_sq: &[f32; N],
) -> LaneF32 {
    let mut error = LaneF32::zero();
    for ch in 0..channels {
        let diff = reconstructed[ch].to_f32() - original[ch].to_f32();
        error = error + diff * diff * channel_weights_sq[ch];
    }
    error
}

/// HDR error in the numeric 16 bit space. Cheap, used by fast indexing.
#[inline]
pub fn compute_error_hdr_fast(
    reconstructed: &[LaneI16; 3],
    original: &[LaneI16; 3],
    channel_weights_sq: &[f32; 3],
) -> LaneF32 {
    let mut error = LaneF32::zero();
    for ch in 0..3 {
        let diff = reconstructed[ch].to_f32() - original[ch].to_f32();
        error = error + diff * diff * channel_weights_sq[ch];
    }
    error
}

/// HDR error in linear space, decoding both values from the
/// two's-complement-like half representation first.
#[inline]
pub fn compute_error_hdr_slow(
    reconstructed: &[LaneI16; 3],
    original: &[LaneI16; 3],
    channel_weights_sq: &[f32; 3],
) -> LaneF32 {
    let mut error = LaneF32::zero();
    for ch in 0..3 {
        let diff = twos_cl_half_to_f32(reconstructed[ch]) - twos_cl_half_to_f32(original[ch]);
        error = error + diff * diff * channel_weights_sq[ch];
    }
    error
}

/// Decode a two's-complement-like half float representation to linear f32.
///
/// Non-negative values are raw binary16 bit patterns; negative values are the
/// negated pattern of the magnitude.
#[inline]
pub fn twos_cl_half_to_f32(v: LaneI16) -> LaneF32 {
    let mut out = LaneF32::zero();
    for i in 0..LANE_WIDTH {
        let x = v.lane(i);
        let magnitude = half::f16::from_bits(x.unsigned_abs()).to_f32();
        out.set_lane(i, if x < 0 { -magnitude } else { magnitude });
    }
    out
}

/// Scale pixels by channel weights ahead of endpoint fitting.
#[inline]
pub fn pre_weight_pixels<const N: usize, const PX: usize>(
    pixels: &[[LaneU16; N]; PX],
    channel_weights: &[f32; N],
) -> [[LaneF32; N]; PX] {
    let mut out = [[LaneF32::zero(); N]; PX];
    for px in 0..PX {
        for ch in 0..N {
            out[px][ch] = pixels[px][ch].to_f32() * channel_weights[ch];
        }
    }
    out
}

/// HDR variant over signed 16 bit pixels.
#[inline]
pub fn pre_weight_pixels_hdr<const PX: usize>(
    pixels: &[[LaneI16; 3]; PX],
    channel_weights: &[f32; 4],
) -> [[LaneF32; 3]; PX] {
    let mut out = [[LaneF32::zero(); 3]; PX];
    for px in 0..PX {
        for ch in 0..3 {
            out[px][ch] = pixels[px][ch].to_f32() * channel_weights[ch];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregated_error_weights() {
        let mut agg = AggregatedError::<3>::new();
        let recon = [LaneU16::splat(10), LaneU16::splat(0), LaneU16::splat(5)];
        let orig = [LaneU16::splat(13), LaneU16::splat(4), LaneU16::splat(5)];
        agg.add(&recon, &orig, 3);
        agg.add(&recon, &orig, 1);

        let err = agg.finalize(&[1.0, 2.0, 1.0]);
        // 9 + 9 for red, 16 * 2 for green, 0 for blue.
        assert_eq!(err.lane(0), 9.0 + 9.0 + 32.0);
    }

    #[test]
    fn twos_cl_half_decodes_sign() {
        let one = half::f16::from_f32(1.0).to_bits() as i16;
        let v = LaneI16::splat(-one);
        assert_eq!(twos_cl_half_to_f32(v).lane(0), -1.0);
    }
}
