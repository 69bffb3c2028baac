//! BC6H block encoding.
//!
//! Pixels are first mapped to a two's-complement-like 16 bit half space.
//! The search descends endpoint precisions, quantizing candidate endpoint
//! pairs and scoring index assignments, then checks which of the fourteen
//! header modes can legally delta-encode the winning endpoints. Packing
//! scatters the endpoint fields across the mode specific header layout.

use crate::bits::Packer;
use crate::endpoints::{EndpointSelector, UnfinishedEndpoints, NUM_ENDPOINT_PASSES};
use crate::index_select::IndexSelectorHdr;
use crate::lanes::{LaneF32, LaneI16, LaneI32, LaneU16, Mask, Rounding, LANE_WIDTH};
use crate::metrics::{
    compute_error_hdr_fast, compute_error_hdr_slow, pre_weight_pixels_hdr, twos_cl_half_to_f32,
};
use crate::refine::EndpointRefiner;
use crate::tables::{
    Bc6hMode, FIXUP_INDEXES_2, HDR_MODES, HDR_MODES_EXIST_FOR_PRECISION, MAX_HDR_PRECISION,
    PARTITION_MAP_2,
};
use crate::{Flags, Options, PixelBlockF16};

pub(crate) const MAX_TWEAK_ROUNDS: usize = 4;
pub(crate) const MAX_REFINE_ROUNDS: usize = 3;
const MAX_META_ROUNDS: usize = MAX_TWEAK_ROUNDS * MAX_REFINE_ROUNDS;

fn quantize_single_signed(elem: LaneI16, precision: u32) -> LaneI16 {
    let negative = elem.lt(LaneI16::zero());
    let abs = elem.abs();

    let scaled = (abs.to_f32() * (32.0 / 31.0)).round_to_u16(Rounding::Up);
    let quantized = (scaled >> (16 - precision)).to_i16();

    quantized.conditional_negate(negative)
}

fn quantize_single_unsigned(elem: LaneU16, precision: u32) -> LaneU16 {
    let scaled = (elem.to_f32() * (64.0 / 31.0))
        .min(LaneF32::splat(65535.0))
        .round_to_u16(Rounding::Up);
    scaled >> (16 - precision)
}

/// Expand a signed quantized endpoint element to the raw value hardware
/// interpolates and the finished value it reconstructs.
fn unquantize_single_signed(comp: LaneI16, precision: u32) -> (LaneI16, LaneI16) {
    let negative = comp.lt(LaneI16::zero());
    let abs_comp = comp.abs().cast_u16();

    let (unq, abs_unq);
    if precision >= 16 {
        unq = comp;
        abs_unq = abs_comp;
    } else {
        let max_comp_minus_one = LaneI16::splat((1 << (precision - 1)) - 2);
        let is_zero = comp.eq(LaneI16::zero());
        let is_max = max_comp_minus_one.lt(comp);

        let mut expanded =
            (abs_comp << (16 - precision)) + LaneU16::splat(0x4000 >> (precision - 1));
        expanded.conditional_assign(is_zero, LaneU16::zero());
        expanded.conditional_assign(is_max, LaneU16::splat(0x7fff));

        abs_unq = expanded;
        unq = expanded.to_i16().conditional_negate(negative);
    }

    let finished = ((abs_unq.widen_mul(31) >> 5).to_u16().to_i16()).conditional_negate(negative);
    (unq, finished)
}

fn unquantize_single_unsigned(comp: LaneU16, precision: u32) -> (LaneU16, LaneU16) {
    let mut unq = comp;
    if precision < 15 {
        let max_comp_minus_one = LaneU16::splat((1 << precision) - 2);
        let is_zero = comp.eq(LaneU16::zero());
        let is_max = max_comp_minus_one.lt(comp);

        unq = (comp << (16 - precision)) + LaneU16::splat(0x8000 >> precision);
        unq.conditional_assign(is_zero, LaneU16::zero());
        unq.conditional_assign(is_max, LaneU16::splat(0xffff));
    }

    let finished = (unq.widen_mul(31) >> 6).to_u16();
    (unq, finished)
}

struct QuantizedSubset {
    quantized: [[LaneI32; 3]; 2],
    selector: IndexSelectorHdr,
}

#[allow(clippy::too_many_arguments)]
fn quantize_endpoints(
    end_points: &[[LaneI16; 3]; 2],
    float_pixels_2cl: &[[LaneF32; 3]; 16],
    float_pixels_linear_weighted: &[[LaneF32; 3]; 16],
    indexes: &mut [LaneU16; 16],
    fixup_index: usize,
    precision: u32,
    index_range: u16,
    channel_weights: &[f32; 4],
    fast_indexing: bool,
    is_signed: bool,
) -> QuantizedSubset {
    let mut quantized = [[LaneI32::zero(); 3]; 2];
    let mut raw = [[LaneI32::zero(); 3]; 2];
    let mut finished = [[LaneI16::zero(); 3]; 2];

    for epi in 0..2 {
        for ch in 0..3 {
            if is_signed {
                let q = quantize_single_signed(end_points[epi][ch], precision);
                let (unq, fin) = unquantize_single_signed(q, precision);
                quantized[epi][ch] = q.to_i32();
                raw[epi][ch] = unq.to_i32();
                finished[epi][ch] = fin;
            } else {
                let q = quantize_single_unsigned(end_points[epi][ch].to_u16(), precision);
                let (unq, fin) = unquantize_single_unsigned(q, precision);
                quantized[epi][ch] = q.to_i32();
                raw[epi][ch] = unq.to_i32();
                finished[epi][ch] = fin.to_i16();
            }
        }
    }

    let mut selector = IndexSelectorHdr::new(channel_weights, &raw, &finished, index_range, is_signed);

    let half_range_minus_one = LaneU16::splat(index_range / 2 - 1);

    let mut index = if fast_indexing {
        selector.select_hdr_fast(&float_pixels_2cl[fixup_index], Rounding::Nearest)
    } else {
        selector.select_hdr_slow(&float_pixels_linear_weighted[fixup_index], channel_weights)
    };

    // Force the fixup pixel into the low half of the index range by
    // swapping the endpoint order where it is not.
    let invert = half_range_minus_one.lt(index);
    if invert.any() {
        index.conditional_assign(invert, LaneU16::splat(index_range - 1) - index);
        selector.conditional_invert(invert);

        for ch in 0..3 {
            let first = quantized[0][ch];
            let second = quantized[1][ch];
            quantized[0][ch] = LaneI32::select(invert, second, first);
            quantized[1][ch] = LaneI32::select(invert, first, second);
        }
    }

    indexes[fixup_index] = index;

    QuantizedSubset { quantized, selector }
}

fn truncate_to_precision_signed(v: LaneI32, bits: u32) -> LaneI32 {
    let mut out = LaneI32::zero();
    for lane in 0..LANE_WIDTH {
        let mask = (1i32 << bits) - 1;
        let sign = 1i32 << (bits - 1);
        let truncated = v.lane(lane) & mask;
        out.set_lane(lane, (truncated ^ sign) - sign);
    }
    out
}

/// Delta-encode endpoints for a transformed mode and verify the deltas
/// reconstruct the original values modulo the base precision.
fn evaluate_partitioned_legality(
    ep0: &[[LaneI32; 3]; 2],
    ep1: &[[LaneI32; 3]; 2],
    a_prec: u32,
    b_prec: &[u8; 3],
    is_transformed: bool,
    encoded: &mut [[[LaneI32; 3]; 2]; 2],
) -> Mask {
    let mut all_legal = Mask::splat(true);

    let significant_mask = LaneI32::splat((1i32 << a_prec) - 1);

    for ch in 0..3 {
        encoded[0][0][ch] = ep0[0][ch];
        encoded[0][1][ch] = ep0[1][ch];
        encoded[1][0][ch] = ep1[0][ch];
        encoded[1][1][ch] = ep1[1][ch];

        if is_transformed {
            for subset in 0..2 {
                for epi in 0..2 {
                    if subset == 0 && epi == 0 {
                        continue;
                    }

                    let reduced = encoded[subset][epi][ch] & significant_mask;

                    let delta = truncate_to_precision_signed(
                        encoded[subset][epi][ch] - encoded[0][0][ch],
                        b_prec[ch] as u32,
                    );
                    encoded[subset][epi][ch] = delta;

                    let reconstructed = (delta + ep0[0][ch]) & significant_mask;
                    all_legal = all_legal & reconstructed.eq(reduced);
                }
            }
        }

        if !all_legal.any() {
            break;
        }
    }

    all_legal
}

fn evaluate_single_legality(
    ep: &[[LaneI32; 3]; 2],
    a_prec: u32,
    b_prec: &[u8; 3],
    is_transformed: bool,
    encoded: &mut [[LaneI32; 3]; 2],
) -> Mask {
    let mut all_legal = Mask::splat(true);

    let significant_mask = LaneI32::splat((1i32 << a_prec) - 1);

    for ch in 0..3 {
        encoded[0][ch] = ep[0][ch];
        encoded[1][ch] = ep[1][ch];

        if is_transformed {
            let reduced = encoded[1][ch] & significant_mask;

            let delta =
                truncate_to_precision_signed(encoded[1][ch] - encoded[0][ch], b_prec[ch] as u32);
            encoded[1][ch] = delta;

            let reconstructed = (delta + ep[0][ch]) & significant_mask;
            all_legal = all_legal & reconstructed.eq(reduced);
        }
    }

    all_legal
}

/// Encode a batch of blocks to BC6H.
pub fn encode_bc6h(
    outputs: &mut [[u8; 16]; LANE_WIDTH],
    inputs: &[PixelBlockF16; LANE_WIDTH],
    options: &Options,
    is_signed: bool,
) {
    let num_tweak_rounds = options.tweak_rounds_bc6h.clamp(1, MAX_TWEAK_ROUNDS);
    let num_refine_rounds = options.refine_rounds_bc6h.clamp(1, MAX_REFINE_ROUNDS);

    let fast_indexing = options.flags.contains(Flags::BC6H_FAST_INDEXING);
    let channel_weights = options.effective_weights();
    let rgb_weights = [channel_weights[0], channel_weights[1], channel_weights[2]];

    let mut channel_weights_sq = [0.0f32; 3];
    for ch in 0..3 {
        channel_weights_sq[ch] = channel_weights[ch] * channel_weights[ch];
    }

    let mut pixels = [[LaneI16::zero(); 3]; 16];
    let mut float_pixels_2cl = [[LaneF32::zero(); 3]; 16];
    let mut float_pixels_linear_weighted = [[LaneF32::zero(); 3]; 16];

    for px in 0..16 {
        for ch in 0..3 {
            let mut value = LaneI16::zero();
            for (lane, input) in inputs.iter().enumerate() {
                value.set_lane(lane, input.pixels[px][ch] as i16);
            }

            // Convert sign+magnitude half patterns to the two's-complement
            // like space. -32768 is unreachable because the magnitude is
            // clamped first.
            if is_signed {
                let negative = value.lt(LaneI16::zero());
                let magnitude = value & LaneI16::splat(0x7fff);
                value.conditional_assign(negative, magnitude.neg());
                value = value.max(LaneI16::splat(-31743));
            } else {
                value = value.max(LaneI16::zero());
            }
            value = value.min(LaneI16::splat(31743));

            pixels[px][ch] = value;
            float_pixels_2cl[px][ch] = value.to_f32();
            float_pixels_linear_weighted[px][ch] =
                twos_cl_half_to_f32(value) * channel_weights[ch];
        }
    }

    let pre_weighted = pre_weight_pixels_hdr(&pixels, &channel_weights);

    let mut best_end_points = [[[LaneI32::zero(); 3]; 2]; 2];
    let mut best_indexes = [LaneU16::zero(); 16];
    let mut best_error = LaneF32::splat(f32::MAX);
    let mut best_mode = LaneU16::zero();
    let mut best_partition = LaneU16::zero();

    // Principal axis fits per partition and for the whole block.
    let mut partitioned_ufep = [[UnfinishedEndpoints::<3>::zero(); 2]; 32];
    for (p, ufep) in partitioned_ufep.iter_mut().enumerate() {
        let partition_mask = PARTITION_MAP_2[p];

        let mut selectors = [EndpointSelector::<3>::new(), EndpointSelector::<3>::new()];
        for pass in 0..NUM_ENDPOINT_PASSES {
            for px in 0..16 {
                let subset = ((partition_mask >> px) & 1) as usize;
                selectors[subset].contribute(&pre_weighted[px], pass, LaneF32::splat(1.0));
            }
            for selector in selectors.iter_mut() {
                selector.finish_pass(pass);
            }
        }

        for subset in 0..2 {
            ufep[subset] = selectors[subset].get_endpoints(&rgb_weights);
        }
    }

    let single_ufep = {
        let mut selector = EndpointSelector::<3>::new();
        for pass in 0..NUM_ENDPOINT_PASSES {
            for px in 0..16 {
                selector.contribute(&pre_weighted[px], pass, LaneF32::splat(1.0));
            }
            selector.finish_pass(pass);
        }
        selector.get_endpoints(&rgb_weights)
    };

    for partitioned in [false, true] {
        for a_prec in (0..=MAX_HDR_PRECISION as u32).rev() {
            if !HDR_MODES_EXIST_FOR_PRECISION[partitioned as usize][a_prec as usize] {
                continue;
            }

            let num_partitions = if partitioned { 32 } else { 1 };
            let num_subsets = if partitioned { 2 } else { 1 };
            let index_bits: u32 = if partitioned { 3 } else { 4 };
            let index_range: u16 = 1 << index_bits;

            for p in 0..num_partitions {
                let partition_mask = if partitioned { PARTITION_MAP_2[p] } else { 0 };

                let mut meta_quantized = [[[[LaneI32::zero(); 3]; 2]; 2]; MAX_META_ROUNDS];
                let mut meta_indexes = [[LaneU16::zero(); 16]; MAX_META_ROUNDS];
                let mut meta_error = [[LaneF32::zero(); 2]; MAX_META_ROUNDS];
                let mut round_valid = [[false; 2]; MAX_META_ROUNDS];
                let mut round_written = [[false; 2]; MAX_META_ROUNDS];

                for subset in 0..num_subsets {
                    for tweak in 0..num_tweak_rounds {
                        let mut refiner: Option<EndpointRefiner<3>> = None;

                        for refine_pass in 0..num_refine_rounds {
                            let meta_round = tweak * MAX_REFINE_ROUNDS + refine_pass;

                            let end_points_color_space = if refine_pass == 0 {
                                let ufep = if partitioned {
                                    &partitioned_ufep[p][subset]
                                } else {
                                    &single_ufep
                                };

                                if is_signed {
                                    ufep.finish_hdr_signed(tweak, index_range)
                                } else {
                                    ufep.finish_hdr_unsigned(tweak, index_range)
                                }
                            } else {
                                refiner
                                    .as_ref()
                                    .expect("refined pass follows a contributing pass")
                                    .get_refined_hdr(is_signed, Rounding::Nearest)
                            };

                            let mut next_refiner = EndpointRefiner::<3>::new(index_range, &rgb_weights);

                            let fixup_index = if subset == 0 {
                                0
                            } else {
                                FIXUP_INDEXES_2[p] as usize
                            };

                            let subset_result = quantize_endpoints(
                                &end_points_color_space,
                                &float_pixels_2cl,
                                &float_pixels_linear_weighted,
                                &mut meta_indexes[meta_round],
                                fixup_index,
                                a_prec,
                                index_range,
                                &channel_weights,
                                fast_indexing,
                                is_signed,
                            );
                            meta_quantized[meta_round][subset] = subset_result.quantized;
                            round_written[meta_round][subset] = true;
                            let index_selector = subset_result.selector;

                            // A round that re-derives endpoints an earlier
                            // round already scored adds nothing, and neither
                            // would refining it further.
                            if meta_round > 0 {
                                let mut any_same = Mask::splat(false);
                                for prev in 0..meta_round {
                                    if !round_written[prev][subset] {
                                        continue;
                                    }

                                    let mut same = Mask::splat(true);
                                    for epi in 0..2 {
                                        for ch in 0..3 {
                                            same = same
                                                & meta_quantized[prev][subset][epi][ch]
                                                    .eq(meta_quantized[meta_round][subset][epi][ch]);
                                        }
                                    }
                                    any_same = any_same | same;
                                    if any_same.all() {
                                        break;
                                    }
                                }

                                if any_same.all() {
                                    break;
                                }
                            }

                            round_valid[meta_round][subset] = true;

                            let mut subset_error = LaneF32::zero();

                            for px in 0..16 {
                                if partitioned && subset != ((partition_mask >> px) & 1) as usize {
                                    continue;
                                }

                                let index = if px == fixup_index {
                                    meta_indexes[meta_round][px]
                                } else {
                                    let index = if fast_indexing {
                                        index_selector
                                            .select_hdr_fast(&float_pixels_2cl[px], Rounding::Nearest)
                                    } else {
                                        index_selector.select_hdr_slow(
                                            &float_pixels_linear_weighted[px],
                                            &channel_weights,
                                        )
                                    };
                                    meta_indexes[meta_round][px] = index;
                                    index
                                };

                                let reconstructed =
                                    index_selector.reconstruct(meta_indexes[meta_round][px]);

                                subset_error = subset_error
                                    + if fast_indexing {
                                        compute_error_hdr_fast(
                                            &reconstructed,
                                            &pixels[px],
                                            &channel_weights_sq,
                                        )
                                    } else {
                                        compute_error_hdr_slow(
                                            &reconstructed,
                                            &pixels[px],
                                            &channel_weights_sq,
                                        )
                                    };

                                if refine_pass != num_refine_rounds - 1 {
                                    next_refiner.contribute(&pre_weighted[px], index, 3);
                                }
                            }

                            meta_error[meta_round][subset] = subset_error;
                            refiner = Some(next_refiner);
                        }
                    }
                }

                // Score subset-candidate combinations and commit the first
                // header mode that can represent the winner.
                let num_meta1 = if partitioned { MAX_META_ROUNDS } else { 1 };
                for meta0 in 0..MAX_META_ROUNDS {
                    if !round_valid[meta0][0] {
                        continue;
                    }

                    for meta1 in 0..num_meta1 {
                        let mut combined_error = meta_error[meta0][0];
                        if partitioned {
                            if !round_valid[meta1][1] {
                                continue;
                            }
                            combined_error = combined_error + meta_error[meta1][1];
                        }

                        let error_better = combined_error.lt(best_error);
                        if !error_better.any() {
                            continue;
                        }

                        let mut needs_commit = error_better;

                        for (mode_index, mode) in HDR_MODES.iter().enumerate() {
                            if mode.partitioned != partitioned || mode.a_prec as u32 != a_prec {
                                continue;
                            }

                            let mut encoded = [[[LaneI32::zero(); 3]; 2]; 2];
                            let is_legal = if partitioned {
                                evaluate_partitioned_legality(
                                    &meta_quantized[meta0][0],
                                    &meta_quantized[meta1][1],
                                    mode.a_prec as u32,
                                    &mode.b_prec,
                                    mode.transformed,
                                    &mut encoded,
                                )
                            } else {
                                let mut single = [[LaneI32::zero(); 3]; 2];
                                let legal = evaluate_single_legality(
                                    &meta_quantized[meta0][0],
                                    mode.a_prec as u32,
                                    &mode.b_prec,
                                    mode.transformed,
                                    &mut single,
                                );
                                encoded[0] = single;
                                legal
                            };

                            let legal_and_better = error_better & is_legal & needs_commit;
                            if !legal_and_better.any() {
                                continue;
                            }

                            best_error.conditional_assign(legal_and_better, combined_error);
                            best_mode
                                .conditional_assign(legal_and_better, LaneU16::splat(mode_index as u16));
                            best_partition
                                .conditional_assign(legal_and_better, LaneU16::splat(p as u16));

                            for subset in 0..num_subsets {
                                for epi in 0..2 {
                                    for ch in 0..3 {
                                        best_end_points[subset][epi][ch].conditional_assign(
                                            legal_and_better,
                                            encoded[subset][epi][ch],
                                        );
                                    }
                                }
                            }

                            for px in 0..16 {
                                let subset = ((partition_mask >> px) & 1) as usize;
                                let source = if subset == 0 {
                                    meta_indexes[meta0][px]
                                } else {
                                    meta_indexes[meta1][px]
                                };
                                best_indexes[px].conditional_assign(legal_and_better, source);
                            }

                            needs_commit = needs_commit.and_not(legal_and_better);
                            if !needs_commit.any() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    for (lane, output) in outputs.iter_mut().enumerate() {
        pack_one(
            best_mode.lane(lane) as usize,
            best_partition.lane(lane),
            &best_end_points,
            &best_indexes,
            lane,
            output,
        );
    }
}

/// One scattered header field: `len` bits of `field` starting at `lsb`,
/// optionally emitted in reverse bit order.
#[derive(Clone, Copy)]
struct Seg {
    field: u8,
    lsb: u8,
    len: u8,
    rev: bool,
}

const fn seg(field: u8, lsb: u8, len: u8) -> Seg {
    Seg { field, lsb, len, rev: false }
}

const fn seg_rev(field: u8, lsb: u8, len: u8) -> Seg {
    Seg { field, lsb, len, rev: true }
}

// Field order is [rw, rx, ry, rz, gw, gx, gy, gz, bw, bx, by, bz].
const RW: u8 = 0;
const RX: u8 = 1;
const RY: u8 = 2;
const RZ: u8 = 3;
const GW: u8 = 4;
const GX: u8 = 5;
const GY: u8 = 6;
const GZ: u8 = 7;
const BW: u8 = 8;
const BX: u8 = 9;
const BY: u8 = 10;
const BZ: u8 = 11;

static MODE_LAYOUTS: [&[Seg]; 14] = [
    // Mode 0x00: 10.555 x3
    &[
        seg(GY, 4, 1), seg(BY, 4, 1), seg(BZ, 4, 1),
        seg(RW, 0, 10), seg(GW, 0, 10), seg(BW, 0, 10),
        seg(RX, 0, 5), seg(GZ, 4, 1), seg(GY, 0, 4),
        seg(GX, 0, 5), seg(BZ, 0, 1), seg(GZ, 0, 4),
        seg(BX, 0, 5), seg(BZ, 1, 1), seg(BY, 0, 4),
        seg(RY, 0, 5), seg(BZ, 2, 1), seg(RZ, 0, 5), seg(BZ, 3, 1),
    ],
    // Mode 0x01: 7.666 x3
    &[
        seg(GY, 5, 1), seg(GZ, 4, 1), seg(GZ, 5, 1),
        seg(RW, 0, 7), seg(BZ, 0, 1), seg(BZ, 1, 1), seg(BY, 4, 1),
        seg(GW, 0, 7), seg(BY, 5, 1), seg(BZ, 2, 1), seg(GY, 4, 1),
        seg(BW, 0, 7), seg(BZ, 3, 1), seg(BZ, 5, 1), seg(BZ, 4, 1),
        seg(RX, 0, 6), seg(GY, 0, 4), seg(GX, 0, 6), seg(GZ, 0, 4),
        seg(BX, 0, 6), seg(BY, 0, 4), seg(RY, 0, 6), seg(RZ, 0, 6),
    ],
    // Mode 0x02: 11.555 / 11.444 / 11.444
    &[
        seg(RW, 0, 10), seg(GW, 0, 10), seg(BW, 0, 10),
        seg(RX, 0, 5), seg(RW, 10, 1), seg(GY, 0, 4),
        seg(GX, 0, 4), seg(GW, 10, 1), seg(BZ, 0, 1), seg(GZ, 0, 4),
        seg(BX, 0, 4), seg(BW, 10, 1), seg(BZ, 1, 1), seg(BY, 0, 4),
        seg(RY, 0, 5), seg(BZ, 2, 1), seg(RZ, 0, 5), seg(BZ, 3, 1),
    ],
    // Mode 0x06: 11.444 / 11.555 / 11.444
    &[
        seg(RW, 0, 10), seg(GW, 0, 10), seg(BW, 0, 10),
        seg(RX, 0, 4), seg(RW, 10, 1), seg(GZ, 4, 1), seg(GY, 0, 4),
        seg(GX, 0, 5), seg(GW, 10, 1), seg(GZ, 0, 4),
        seg(BX, 0, 4), seg(BW, 10, 1), seg(BZ, 1, 1), seg(BY, 0, 4),
        seg(RY, 0, 4), seg(BZ, 0, 1), seg(BZ, 2, 1),
        seg(RZ, 0, 4), seg(GY, 4, 1), seg(BZ, 3, 1),
    ],
    // Mode 0x0a: 11.444 / 11.444 / 11.555
    &[
        seg(RW, 0, 10), seg(GW, 0, 10), seg(BW, 0, 10),
        seg(RX, 0, 4), seg(RW, 10, 1), seg(BY, 4, 1), seg(GY, 0, 4),
        seg(GX, 0, 4), seg(GW, 10, 1), seg(BZ, 0, 1), seg(GZ, 0, 4),
        seg(BX, 0, 5), seg(BW, 10, 1), seg(BY, 0, 4),
        seg(RY, 0, 4), seg(BZ, 1, 1), seg(BZ, 2, 1),
        seg(RZ, 0, 4), seg(BZ, 4, 1), seg(BZ, 3, 1),
    ],
    // Mode 0x0e: 9.555 x3
    &[
        seg(RW, 0, 9), seg(BY, 4, 1), seg(GW, 0, 9), seg(GY, 4, 1),
        seg(BW, 0, 9), seg(BZ, 4, 1),
        seg(RX, 0, 5), seg(GZ, 4, 1), seg(GY, 0, 4),
        seg(GX, 0, 5), seg(BZ, 0, 1), seg(GZ, 0, 4),
        seg(BX, 0, 5), seg(BZ, 1, 1), seg(BY, 0, 4),
        seg(RY, 0, 5), seg(BZ, 2, 1), seg(RZ, 0, 5), seg(BZ, 3, 1),
    ],
    // Mode 0x12: 8.666 / 8.555 / 8.555
    &[
        seg(RW, 0, 8), seg(GZ, 4, 1), seg(BY, 4, 1),
        seg(GW, 0, 8), seg(BZ, 2, 1), seg(GY, 4, 1),
        seg(BW, 0, 8), seg(BZ, 3, 1), seg(BZ, 4, 1),
        seg(RX, 0, 6), seg(GY, 0, 4),
        seg(GX, 0, 5), seg(BZ, 0, 1), seg(GZ, 0, 4),
        seg(BX, 0, 5), seg(BZ, 1, 1), seg(BY, 0, 4),
        seg(RY, 0, 6), seg(RZ, 0, 6),
    ],
    // Mode 0x16: 8.555 / 8.666 / 8.555
    &[
        seg(RW, 0, 8), seg(BZ, 0, 1), seg(BY, 4, 1),
        seg(GW, 0, 8), seg(GY, 5, 1), seg(GY, 4, 1),
        seg(BW, 0, 8), seg(GZ, 5, 1), seg(BZ, 4, 1),
        seg(RX, 0, 5), seg(GZ, 4, 1), seg(GY, 0, 4),
        seg(GX, 0, 6), seg(GZ, 0, 4),
        seg(BX, 0, 5), seg(BZ, 1, 1), seg(BY, 0, 4),
        seg(RY, 0, 5), seg(BZ, 2, 1), seg(RZ, 0, 5), seg(BZ, 3, 1),
    ],
    // Mode 0x1a: 8.555 / 8.555 / 8.666
    &[
        seg(RW, 0, 8), seg(BZ, 1, 1), seg(BY, 4, 1),
        seg(GW, 0, 8), seg(BY, 5, 1), seg(GY, 4, 1),
        seg(BW, 0, 8), seg(BZ, 5, 1), seg(BZ, 4, 1),
        seg(RX, 0, 5), seg(GZ, 4, 1), seg(GY, 0, 4),
        seg(GX, 0, 5), seg(BZ, 0, 1), seg(GZ, 0, 4),
        seg(BX, 0, 6), seg(BY, 0, 4),
        seg(RY, 0, 5), seg(BZ, 2, 1), seg(RZ, 0, 5), seg(BZ, 3, 1),
    ],
    // Mode 0x1e: 6666 x3, untransformed
    &[
        seg(RW, 0, 6), seg(GZ, 4, 1), seg(BZ, 0, 1), seg(BZ, 1, 1), seg(BY, 4, 1),
        seg(GW, 0, 6), seg(GY, 5, 1), seg(BY, 5, 1), seg(BZ, 2, 1), seg(GY, 4, 1),
        seg(BW, 0, 6), seg(GZ, 5, 1), seg(BZ, 3, 1), seg(BZ, 5, 1), seg(BZ, 4, 1),
        seg(RX, 0, 6), seg(GY, 0, 4), seg(GX, 0, 6), seg(GZ, 0, 4),
        seg(BX, 0, 6), seg(BY, 0, 4), seg(RY, 0, 6), seg(RZ, 0, 6),
    ],
    // Mode 0x03: 10.10 x3, untransformed
    &[
        seg(RW, 0, 10), seg(GW, 0, 10), seg(BW, 0, 10),
        seg(RX, 0, 10), seg(GX, 0, 10), seg(BX, 0, 10),
    ],
    // Mode 0x07: 11.9 x3
    &[
        seg(RW, 0, 10), seg(GW, 0, 10), seg(BW, 0, 10),
        seg(RX, 0, 9), seg(RW, 10, 1),
        seg(GX, 0, 9), seg(GW, 10, 1),
        seg(BX, 0, 9), seg(BW, 10, 1),
    ],
    // Mode 0x0b: 12.8 x3
    &[
        seg(RW, 0, 10), seg(GW, 0, 10), seg(BW, 0, 10),
        seg(RX, 0, 8), seg_rev(RW, 10, 2),
        seg(GX, 0, 8), seg_rev(GW, 10, 2),
        seg(BX, 0, 8), seg_rev(BW, 10, 2),
    ],
    // Mode 0x0f: 16.4 x3
    &[
        seg(RW, 0, 10), seg(GW, 0, 10), seg(BW, 0, 10),
        seg(RX, 0, 4), seg_rev(RW, 10, 6),
        seg(GX, 0, 4), seg_rev(GW, 10, 6),
        seg(BX, 0, 4), seg_rev(BW, 10, 6),
    ],
];

fn pack_one(
    mode_index: usize,
    partition: u16,
    end_points: &[[[LaneI32; 3]; 2]; 2],
    indexes: &[LaneU16; 16],
    lane: usize,
    output: &mut [u8; 16],
) {
    let mode: &Bc6hMode = &HDR_MODES[mode_index];

    let mut fields = [0u32; 12];
    for subset in 0..2 {
        for epi in 0..2 {
            for ch in 0..3 {
                fields[ch * 4 + subset * 2 + epi] = end_points[subset][epi][ch].lane(lane) as u32;
            }
        }
    }

    let mut packer = Packer::new();

    // Two bit mode ids for 0x00/0x01, five bits for the rest.
    packer.pack((mode.mode_id & 3) as u16, 2);
    if mode.mode_id > 1 {
        packer.pack((mode.mode_id >> 2) as u16, 3);
    }

    for s in MODE_LAYOUTS[mode_index] {
        let value = fields[s.field as usize] >> s.lsb;
        if s.rev {
            for k in 0..s.len {
                packer.pack(((value >> (s.len - 1 - k)) & 1) as u16, 1);
            }
        } else {
            packer.pack((value & ((1u32 << s.len) - 1)) as u16, s.len as usize);
        }
    }

    let (fixup_index, index_bits) = if mode.partitioned {
        packer.pack(partition, 5);
        (FIXUP_INDEXES_2[partition as usize] as usize, 3usize)
    } else {
        (0, 4)
    };

    for (px, index) in indexes.iter().enumerate() {
        let value = index.lane(lane);
        if px == 0 || px == fixup_index {
            debug_assert!(value < (1 << (index_bits - 1)));
            packer.pack(value, index_bits - 1);
        } else {
            packer.pack(value, index_bits);
        }
    }

    packer.flush(output);
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    fn solid_blocks(rgb: [f32; 3]) -> [PixelBlockF16; LANE_WIDTH] {
        let mut pixels = [[0u16; 4]; 16];
        for pixel in pixels.iter_mut() {
            for ch in 0..3 {
                pixel[ch] = f16::from_f32(rgb[ch]).to_bits();
            }
            pixel[3] = f16::from_f32(1.0).to_bits();
        }
        [PixelBlockF16 { pixels }; LANE_WIDTH]
    }

    fn encode(inputs: &[PixelBlockF16; LANE_WIDTH], is_signed: bool) -> [[u8; 16]; LANE_WIDTH] {
        let mut outputs = [[0u8; 16]; LANE_WIDTH];
        encode_bc6h(&mut outputs, inputs, &Options::default(), is_signed);
        outputs
    }

    fn decode(block: &[u8; 16], is_signed: bool) -> [[u16; 3]; 16] {
        let mut out = [[0u16; 3]; 16];
        blockdec::bc6h_half(block, &mut out, is_signed);
        out
    }

    fn read_mode_id(block: &[u8; 16]) -> u8 {
        let low = block[0] & 3;
        if low < 2 {
            low
        } else {
            block[0] & 0x1f
        }
    }

    #[test]
    fn unsigned_dark_block_round_trips() {
        let rgb = [0.01f32, 0.02, 0.03];
        let outputs = encode(&solid_blocks(rgb), false);

        for block in &outputs {
            // A constant block wants the finest endpoint precision, which
            // only the unpartitioned modes provide.
            let id = read_mode_id(block);
            assert!(
                matches!(id, 0x03 | 0x07 | 0x0b | 0x0f),
                "expected an unpartitioned mode, got {id:#x}"
            );

            let decoded = decode(block, false);
            for px in decoded {
                for ch in 0..3 {
                    let value = f16::from_bits(px[ch]).to_f32();
                    let relative = (value - rgb[ch]).abs() / rgb[ch];
                    assert!(relative < 0.01, "channel {ch}: {value} vs {}", rgb[ch]);
                }
            }
        }
    }

    #[test]
    fn signed_block_preserves_negative_values() {
        let rgb = [-1.0f32, 0.0, 1.0];
        let outputs = encode(&solid_blocks(rgb), true);

        for block in &outputs {
            let decoded = decode(block, true);
            for px in decoded {
                let r = px[0];
                assert_ne!(r & 0x8000, 0, "red should stay negative");
                let r_value = -f16::from_bits(r & 0x7fff).to_f32();
                assert!((r_value + 1.0).abs() < 0.01, "red {r_value}");

                let g_value = f16::from_bits(px[1] & 0x7fff).to_f32();
                assert!(g_value.abs() < 0.001, "green {g_value}");

                let b_value = f16::from_bits(px[2]).to_f32();
                assert!((b_value - 1.0).abs() < 0.01, "blue {b_value}");
            }
        }
    }

    #[test]
    fn delta_transform_legality_wraps_at_precision() {
        let base = LaneI32::splat(60);
        let other = LaneI32::splat(63);
        let ep = [[base; 3], [other; 3]];

        let mut encoded = [[LaneI32::zero(); 3]; 2];
        let legal = evaluate_single_legality(&ep, 6, &[4, 4, 4], true, &mut encoded);
        assert!(legal.all());
        assert_eq!(encoded[1][0].lane(0), 3);

        // A delta of 40 cannot fit 4 signed bits.
        let far = LaneI32::splat(100);
        let ep = [[base; 3], [far; 3]];
        let legal = evaluate_single_legality(&ep, 7, &[4, 4, 4], true, &mut encoded);
        assert!(!legal.any());
    }

    #[test]
    fn gradient_block_decodes_within_tolerance() {
        let mut pixels = [[0u16; 4]; 16];
        for (px, pixel) in pixels.iter_mut().enumerate() {
            let v = 0.1 + px as f32 * 0.05;
            for ch in 0..3 {
                pixel[ch] = f16::from_f32(v * (ch + 1) as f32).to_bits();
            }
            pixel[3] = f16::from_f32(1.0).to_bits();
        }
        let inputs = [PixelBlockF16 { pixels }; LANE_WIDTH];
        let outputs = encode(&inputs, false);

        for block in &outputs {
            let decoded = decode(block, false);
            for (px, pixel) in decoded.iter().enumerate() {
                for ch in 0..3 {
                    let expected = f16::from_bits(pixels[px][ch]).to_f32();
                    let value = f16::from_bits(pixel[ch]).to_f32();
                    assert!(
                        (value - expected).abs() <= expected * 0.25 + 0.01,
                        "pixel {px} channel {ch}: {value} vs {expected}"
                    );
                }
            }
        }
    }
}
