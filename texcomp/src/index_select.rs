//! Per pixel index assignment against a fixed endpoint pair.
//!
//! Selection projects the pixel onto the endpoint axis in the weighted
//! channel metric and rounds to the nearest index. Reconstruction uses the
//! hardware interpolation (64ths weights) so the error seen by the search is
//! the error hardware will produce.

use crate::lanes::{LaneF32, LaneI16, LaneI32, LaneU16, Mask, Rounding, LANE_WIDTH};

/// Interpolation weight in 64ths for `index` out of `max_index`.
///
/// Reproduces the BC7 weight tables exactly for 2, 3 and 4 bit precisions.
#[inline]
pub fn bc7_weight(index: LaneU16, max_index: u16) -> LaneU16 {
    let mut out = LaneU16::zero();
    for i in 0..LANE_WIDTH {
        out.set_lane(i, (index.lane(i) * 128 + max_index) / (2 * max_index));
    }
    out
}

#[derive(Debug, Clone)]
pub struct IndexSelector<const N: usize> {
    end_point: [[LaneU16; N]; 2],
    axis: [LaneF32; N],
    origin_dot: LaneF32,
    max_index: u16,
}

impl<const N: usize> IndexSelector<N> {
    pub fn new(channel_weights: &[f32; N], end_point: &[[LaneU16; N]; 2], range: u16) -> Self {
        let mut diff_weighted = [LaneF32::zero(); N];
        let mut total = LaneF32::zero();

        for ch in 0..N {
            diff_weighted[ch] =
                (end_point[1][ch].to_f32() - end_point[0][ch].to_f32()) * channel_weights[ch];
            total = total + diff_weighted[ch] * diff_weighted[ch];
        }

        let scale = LaneF32::splat(f32::from(range - 1)) / total.make_safe_denominator();

        let mut axis = [LaneF32::zero(); N];
        let mut origin_dot = LaneF32::zero();
        for ch in 0..N {
            axis[ch] = diff_weighted[ch] * channel_weights[ch] * scale;
            origin_dot = origin_dot + end_point[0][ch].to_f32() * axis[ch];
        }

        IndexSelector {
            end_point: *end_point,
            axis,
            origin_dot,
            max_index: range - 1,
        }
    }

    /// Index of the interpolated value closest to `pixel` along the axis.
    pub fn select_ldr(&self, pixel: &[LaneF32; N], rounding: Rounding) -> LaneU16 {
        let mut dist = -self.origin_dot;
        for ch in 0..N {
            dist = dist + pixel[ch] * self.axis[ch];
        }

        dist.clamp(0.0, f32::from(self.max_index)).round_to_u16(rounding)
    }

    /// Hardware reconstruction of `index` on the first `channels` channels.
    pub fn reconstruct_ldr_bc7(&self, index: LaneU16, out: &mut [LaneU16; N], channels: usize) {
        let w = bc7_weight(index, self.max_index);
        let inv = LaneU16::splat(64) - w;

        for ch in 0..channels {
            let interp = inv.compact_mul(self.end_point[0][ch])
                + w.compact_mul(self.end_point[1][ch])
                + LaneU16::splat(32);
            out[ch] = interp >> 6;
        }
    }
}

/// HDR index selector over raw (pre-finishing) endpoint interpolation.
#[derive(Debug, Clone)]
pub struct IndexSelectorHdr {
    raw_ep: [[LaneI32; 3]; 2],
    axis: [LaneF32; 3],
    origin_dot: LaneF32,
    inverted: Mask,
    max_index: u16,
    is_signed: bool,
}

impl IndexSelectorHdr {
    /// `raw_ep` are the unquantized endpoint values hardware interpolates;
    /// `finished_ep` the values it finally reconstructs, which define the
    /// projection axis.
    pub fn new(
        channel_weights: &[f32; 4],
        raw_ep: &[[LaneI32; 3]; 2],
        finished_ep: &[[LaneI16; 3]; 2],
        range: u16,
        is_signed: bool,
    ) -> Self {
        let mut diff_weighted = [LaneF32::zero(); 3];
        let mut total = LaneF32::zero();
        for ch in 0..3 {
            diff_weighted[ch] =
                (finished_ep[1][ch].to_f32() - finished_ep[0][ch].to_f32()) * channel_weights[ch];
            total = total + diff_weighted[ch] * diff_weighted[ch];
        }

        let scale = LaneF32::splat(f32::from(range - 1)) / total.make_safe_denominator();

        let mut axis = [LaneF32::zero(); 3];
        let mut origin_dot = LaneF32::zero();
        for ch in 0..3 {
            axis[ch] = diff_weighted[ch] * channel_weights[ch] * scale;
            origin_dot = origin_dot + finished_ep[0][ch].to_f32() * axis[ch];
        }

        IndexSelectorHdr {
            raw_ep: *raw_ep,
            axis,
            origin_dot,
            inverted: Mask::splat(false),
            max_index: range - 1,
            is_signed,
        }
    }

    /// Swap the endpoint order on the given lanes. Selection and
    /// reconstruction stay consistent with the swapped committed endpoints.
    pub fn conditional_invert(&mut self, mask: Mask) {
        for ch in 0..3 {
            let ep0 = self.raw_ep[0][ch];
            let ep1 = self.raw_ep[1][ch];
            self.raw_ep[0][ch] = LaneI32::select(mask, ep1, ep0);
            self.raw_ep[1][ch] = LaneI32::select(mask, ep0, ep1);
        }
        self.inverted = self.inverted | mask;
    }

    fn apply_inversion(&self, index: LaneU16) -> LaneU16 {
        let flipped = LaneU16::splat(self.max_index) - index;
        LaneU16::select(self.inverted, flipped, index)
    }

    /// Projection select on the numeric color space coordinates.
    pub fn select_hdr_fast(&self, pixel_color_space: &[LaneF32; 3], rounding: Rounding) -> LaneU16 {
        let mut dist = -self.origin_dot;
        for ch in 0..3 {
            dist = dist + pixel_color_space[ch] * self.axis[ch];
        }

        let index = dist
            .clamp(0.0, f32::from(self.max_index))
            .round_to_u16(rounding);
        self.apply_inversion(index)
    }

    /// Exhaustive select on linear weighted coordinates.
    pub fn select_hdr_slow(
        &self,
        pixel_linear_weighted: &[LaneF32; 3],
        channel_weights: &[f32; 4],
    ) -> LaneU16 {
        let mut best_error = LaneF32::splat(f32::MAX);
        let mut best_index = LaneU16::zero();

        for index in 0..=self.max_index {
            let recon = self.reconstruct(LaneU16::splat(index));

            let mut error = LaneF32::zero();
            for ch in 0..3 {
                let linear =
                    crate::metrics::twos_cl_half_to_f32(recon[ch]) * channel_weights[ch];
                let diff = linear - pixel_linear_weighted[ch];
                error = error + diff * diff;
            }

            let better = error.lt(best_error);
            best_index.conditional_assign(better, LaneU16::splat(index));
            best_error = best_error.min(error);
        }

        best_index
    }

    /// Finished (hardware visible) reconstruction of a committed index.
    pub fn reconstruct(&self, index: LaneU16) -> [LaneI16; 3] {
        let w = bc7_weight(index, self.max_index).to_i32();
        let inv = LaneU16::splat(64).to_i32() - w;

        let mut out = [LaneI16::zero(); 3];
        for ch in 0..3 {
            for i in 0..LANE_WIDTH {
                let interp = (inv.lane(i) * self.raw_ep[0][ch].lane(i)
                    + w.lane(i) * self.raw_ep[1][ch].lane(i)
                    + 32)
                    >> 6;

                let finished = if self.is_signed {
                    let sign = if interp < 0 { -1 } else { 1 };
                    sign * ((interp.abs() * 31) >> 5)
                } else {
                    (interp * 31) >> 6
                };

                debug_assert!(finished >= i16::MIN as i32 && finished <= i16::MAX as i32);
                out[ch].set_lane(i, finished as i16);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_formula_matches_tables() {
        let w2 = [0u16, 21, 43, 64];
        let w3 = [0u16, 9, 18, 27, 37, 46, 55, 64];
        let w4 = [0u16, 4, 9, 13, 17, 21, 26, 30, 34, 38, 43, 47, 51, 55, 60, 64];

        for (max, table) in [(3u16, &w2[..]), (7, &w3[..]), (15, &w4[..])] {
            for (i, expected) in table.iter().enumerate() {
                let w = bc7_weight(LaneU16::splat(i as u16), max);
                assert_eq!(w.lane(0), *expected, "index {i} of {} levels", max + 1);
            }
        }
    }

    #[test]
    fn ldr_select_hits_exact_interpolants() {
        let eps = [[LaneU16::splat(0); 1], [LaneU16::splat(255); 1]];
        let selector = IndexSelector::<1>::new(&[1.0], &eps, 4);

        for (i, v) in [0.0f32, 85.0, 170.0, 255.0].iter().enumerate() {
            let index = selector.select_ldr(&[LaneF32::splat(*v)], Rounding::Nearest);
            assert_eq!(index.lane(0), i as u16);
        }

        let mut recon = [LaneU16::zero(); 1];
        selector.reconstruct_ldr_bc7(LaneU16::splat(3), &mut recon, 1);
        assert_eq!(recon[0].lane(0), 255);
    }

    #[test]
    fn hdr_invert_flips_selection_and_reconstruction() {
        let raw = [[LaneI32::splat(0); 3], [LaneI32::splat(0x7bff); 3]];
        let finished = [[LaneI16::splat(0); 3], [LaneI16::splat(31743); 3]];
        let mut selector = IndexSelectorHdr::new(&[1.0; 4], &raw, &finished, 16, false);

        let high = [LaneF32::splat(31743.0); 3];
        assert_eq!(selector.select_hdr_fast(&high, Rounding::Nearest).lane(0), 15);

        selector.conditional_invert(Mask::splat(true));
        let index = selector.select_hdr_fast(&high, Rounding::Nearest);
        assert_eq!(index.lane(0), 0);

        // Index 0 now reconstructs the high endpoint.
        let recon = selector.reconstruct(index);
        assert_eq!(recon[0].lane(0), ((0x7bff * 31) >> 6) as i16);
    }
}
