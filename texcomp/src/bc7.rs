//! BC7 block encoding.
//!
//! The search walks mode x partition x shape x tweak x parity x refinement
//! candidates, keeping the best error per shape so partitions sharing a
//! shape pay for it once. Modes 4 and 5 (dual plane) solve RGB and alpha
//! independently per rotation. Packing canonicalizes index MSBs against the
//! fixup pixels and emits the 128 bit payload.

use crate::bits::Packer;
use crate::endpoints::{EndpointSelector, UnfinishedEndpoints, MAX_TWEAK_ROUNDS, NUM_ENDPOINT_PASSES};
use crate::index_select::IndexSelector;
use crate::lanes::{LaneF32, LaneU16, Mask, Rounding, LANE_WIDTH};
use crate::metrics::{compute_error_ldr_simple, pre_weight_pixels, AggregatedError};
use crate::plan::Bc7EncodingPlan;
use crate::refine::EndpointRefiner;
use crate::single_color::{tables_for_mode, ScTable};
use crate::tables::{
    FIXUP_INDEXES_2, FIXUP_INDEXES_3, FRAGMENTS, NUM_SHAPES_ALL, PARTITION_MAP_2, PARTITION_MAP_3,
    SHAPES_1, SHAPES_2, SHAPES_3, SHAPE_LIST_1, SHAPE_LIST_2, SHAPE_LIST_3, SHAPE_LIST_3_SHORT,
    SHAPE_RANGES,
};
use crate::{Flags, Options, PixelBlockU8};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PBitMode {
    PerEndpoint,
    PerSubset,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AlphaMode {
    Combined,
    Separate,
    None,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Bc7ModeInfo {
    pub p_bit_mode: PBitMode,
    pub alpha_mode: AlphaMode,
    pub rgb_bits: u32,
    pub alpha_bits: u32,
    pub partition_bits: u32,
    pub num_subsets: usize,
    pub index_bits: u32,
    pub alpha_index_bits: u32,
    pub has_index_selector: bool,
}

pub(crate) static BC7_MODES: [Bc7ModeInfo; 8] = [
    Bc7ModeInfo { p_bit_mode: PBitMode::PerEndpoint, alpha_mode: AlphaMode::None, rgb_bits: 4, alpha_bits: 0, partition_bits: 4, num_subsets: 3, index_bits: 3, alpha_index_bits: 0, has_index_selector: false },
    Bc7ModeInfo { p_bit_mode: PBitMode::PerSubset, alpha_mode: AlphaMode::None, rgb_bits: 6, alpha_bits: 0, partition_bits: 6, num_subsets: 2, index_bits: 3, alpha_index_bits: 0, has_index_selector: false },
    Bc7ModeInfo { p_bit_mode: PBitMode::None, alpha_mode: AlphaMode::None, rgb_bits: 5, alpha_bits: 0, partition_bits: 6, num_subsets: 3, index_bits: 2, alpha_index_bits: 0, has_index_selector: false },
    Bc7ModeInfo { p_bit_mode: PBitMode::PerEndpoint, alpha_mode: AlphaMode::None, rgb_bits: 7, alpha_bits: 0, partition_bits: 6, num_subsets: 2, index_bits: 2, alpha_index_bits: 0, has_index_selector: false },
    Bc7ModeInfo { p_bit_mode: PBitMode::None, alpha_mode: AlphaMode::Separate, rgb_bits: 5, alpha_bits: 6, partition_bits: 0, num_subsets: 1, index_bits: 2, alpha_index_bits: 3, has_index_selector: true },
    Bc7ModeInfo { p_bit_mode: PBitMode::None, alpha_mode: AlphaMode::Separate, rgb_bits: 7, alpha_bits: 8, partition_bits: 0, num_subsets: 1, index_bits: 2, alpha_index_bits: 2, has_index_selector: false },
    Bc7ModeInfo { p_bit_mode: PBitMode::PerEndpoint, alpha_mode: AlphaMode::Combined, rgb_bits: 7, alpha_bits: 7, partition_bits: 0, num_subsets: 1, index_bits: 4, alpha_index_bits: 0, has_index_selector: false },
    Bc7ModeInfo { p_bit_mode: PBitMode::PerEndpoint, alpha_mode: AlphaMode::Combined, rgb_bits: 5, alpha_bits: 5, partition_bits: 6, num_subsets: 2, index_bits: 2, alpha_index_bits: 0, has_index_selector: false },
];

/// Per-block best result, mutated as candidate modes are evaluated.
pub(crate) struct WorkInfo {
    pub mode: LaneU16,
    pub error: LaneF32,
    pub ep: [[[LaneU16; 4]; 2]; 3],
    pub indexes: [LaneU16; 16],
    pub indexes2: [LaneU16; 16],
    pub partition: LaneU16,
    pub rotation: LaneU16,
    pub index_selector: LaneU16,
}

impl WorkInfo {
    fn new() -> Self {
        WorkInfo {
            mode: LaneU16::zero(),
            error: LaneF32::splat(f32::MAX),
            ep: [[[LaneU16::zero(); 4]; 2]; 3],
            indexes: [LaneU16::zero(); 16],
            indexes2: [LaneU16::zero(); 16],
            partition: LaneU16::zero(),
            rotation: LaneU16::zero(),
            index_selector: LaneU16::zero(),
        }
    }
}

fn quantize(color: &mut [LaneU16], bits: u32, channels: usize) {
    let addend = LaneU16::splat(127 + (1 << (7 - bits)));
    for c in color.iter_mut().take(channels) {
        *c = ((*c << bits) - *c + addend) >> 8;
    }
}

fn quantize_p(color: &mut [LaneU16], bits: u32, p: u16, channels: usize) {
    let addend = if p != 0 { (1u16 << (8 - bits)) - 1 } else { 255 };
    let addend = LaneU16::splat(addend);
    for c in color.iter_mut().take(channels) {
        let quantized = ((*c << (bits + 1)) - *c + addend) >> 9;
        *c = (quantized << 1) | LaneU16::splat(p);
    }
}

fn unquantize(color: &mut [LaneU16], bits: u32, channels: usize) {
    for c in color.iter_mut().take(channels) {
        let expanded = *c << (8 - bits);
        *c = expanded | (expanded >> bits);
    }
}

fn compress_endpoints0(ep: &mut [[LaneU16; 4]; 2], p: [u16; 2]) {
    for (e, p) in ep.iter_mut().zip(p) {
        quantize_p(e, 4, p, 3);
        unquantize(e, 5, 3);
        e[3] = LaneU16::splat(255);
    }
}

fn compress_endpoints1(ep: &mut [[LaneU16; 4]; 2], p: u16) {
    for e in ep.iter_mut() {
        quantize_p(e, 6, p, 3);
        unquantize(e, 7, 3);
        e[3] = LaneU16::splat(255);
    }
}

fn compress_endpoints2(ep: &mut [[LaneU16; 4]; 2]) {
    for e in ep.iter_mut() {
        quantize(e, 5, 3);
        unquantize(e, 5, 3);
        e[3] = LaneU16::splat(255);
    }
}

fn compress_endpoints3(ep: &mut [[LaneU16; 4]; 2], p: [u16; 2]) {
    for (e, p) in ep.iter_mut().zip(p) {
        quantize_p(e, 7, p, 3);
        e[3] = LaneU16::splat(255);
    }
}

fn compress_endpoints4(ep_rgb: &mut [[LaneU16; 3]; 2], ep_a: &mut [LaneU16; 2]) {
    for e in ep_rgb.iter_mut() {
        quantize(e, 5, 3);
        unquantize(e, 5, 3);
    }
    for a in ep_a.iter_mut() {
        let mut one = [*a];
        quantize(&mut one, 6, 1);
        unquantize(&mut one, 6, 1);
        *a = one[0];
    }
}

fn compress_endpoints5(ep_rgb: &mut [[LaneU16; 3]; 2], _ep_a: &mut [LaneU16; 2]) {
    for e in ep_rgb.iter_mut() {
        quantize(e, 7, 3);
        unquantize(e, 7, 3);
    }
    // Alpha stays full precision.
}

fn compress_endpoints6(ep: &mut [[LaneU16; 4]; 2], p: [u16; 2]) {
    for (e, p) in ep.iter_mut().zip(p) {
        quantize_p(e, 7, p, 4);
    }
}

fn compress_endpoints7(ep: &mut [[LaneU16; 4]; 2], p: [u16; 2]) {
    for (e, p) in ep.iter_mut().zip(p) {
        quantize_p(e, 5, p, 4);
        unquantize(e, 6, 4);
    }
}

fn tweak_alpha(original: [LaneU16; 2], tweak: usize, range: u16) -> [LaneU16; 2] {
    let factors = crate::endpoints::compute_tweak_factors(tweak, range);

    let base = original[0].to_f32();
    let offset = original[1].to_f32() - base;

    [
        (base + offset * factors[0]).clamp(0.0, 255.0).round_to_u16(Rounding::Nearest),
        (base + offset * factors[1]).clamp(0.0, 255.0).round_to_u16(Rounding::Nearest),
    ]
}

struct SinglePlaneTemporaries {
    unfinished_rgb: [UnfinishedEndpoints<3>; NUM_SHAPES_ALL],
    unfinished_rgba: [UnfinishedEndpoints<4>; crate::tables::NUM_SHAPES_12],
    fragment_best_indexes: [LaneU16; FRAGMENTS.len()],
    shape_best_ep: [[[LaneU16; 4]; 2]; NUM_SHAPES_ALL],
    shape_best_error: [LaneF32; NUM_SHAPES_ALL],
}

impl SinglePlaneTemporaries {
    fn new() -> Box<Self> {
        Box::new(SinglePlaneTemporaries {
            unfinished_rgb: [UnfinishedEndpoints::zero(); NUM_SHAPES_ALL],
            unfinished_rgba: [UnfinishedEndpoints::zero(); crate::tables::NUM_SHAPES_12],
            fragment_best_indexes: [LaneU16::zero(); FRAGMENTS.len()],
            shape_best_ep: [[[LaneU16::zero(); 4]; 2]; NUM_SHAPES_ALL],
            shape_best_error: [LaneF32::zero(); NUM_SHAPES_ALL],
        })
    }
}

fn shape_range(shape: usize) -> (usize, usize) {
    let (start, len) = SHAPE_RANGES[shape];
    (start as usize, len as usize)
}

fn fit_shape_endpoints<const N: usize>(
    shape: usize,
    pre_weighted: &[[LaneF32; N]; 16],
    channel_weights: &[f32; N],
) -> UnfinishedEndpoints<N> {
    let (start, len) = shape_range(shape);

    let mut selector = EndpointSelector::<N>::new();
    for pass in 0..NUM_ENDPOINT_PASSES {
        for i in 0..len {
            let px = FRAGMENTS[start + i] as usize;
            selector.contribute(&pre_weighted[px], pass, LaneF32::splat(1.0));
        }
        selector.finish_pass(pass);
    }
    selector.get_endpoints(channel_weights)
}

#[allow(clippy::too_many_arguments)]
fn try_single_color_multi_table(
    pixels: &[[LaneU16; 4]; 16],
    average: &[LaneF32; 4],
    num_real_channels: usize,
    fragment: &[u8],
    static_alpha_error: LaneF32,
    punch_through_invalid: &[Mask; 4],
    shape_best_error: &mut LaneF32,
    shape_best_ep: &mut [[LaneU16; 4]; 2],
    fragment_best_indexes: &mut [LaneU16],
    channel_weights_sq: &[f32; 4],
    tables: &[ScTable],
) {
    let mut best_average_error = LaneF32::splat(f32::MAX);

    let mut int_average = [LaneU16::zero(); 4];
    for ch in 0..4 {
        int_average[ch] = average[ch].round_to_u16(Rounding::Nearest);
    }

    let mut eps = [[LaneU16::zero(); 4]; 2];
    let mut reconstructed = [LaneU16::zero(); 4];
    let mut index = LaneU16::zero();
    for epi in 0..2 {
        eps[epi][3] = LaneU16::splat(255);
    }
    reconstructed[3] = LaneU16::splat(255);

    // Multiple tables can hold a valid solid color; keep the one whose
    // reconstruction lands closest to the true average.
    for table in tables {
        let pti = punch_through_invalid[table.p_bits as usize];

        let mut candidate_eps = [[LaneU16::zero(); 4]; 2];
        let mut candidate_reconstructed = [LaneU16::zero(); 4];

        // Table lookups are lane dependent; this is one of the two loops
        // that intentionally runs scalar.
        for lane in 0..LANE_WIDTH {
            for ch in 0..num_real_channels {
                let entry = table.entries[int_average[ch].lane(lane) as usize];
                candidate_eps[0][ch].set_lane(lane, entry.min as u16);
                candidate_eps[1][ch].set_lane(lane, entry.max as u16);
                candidate_reconstructed[ch].set_lane(lane, entry.actual as u16);
            }
        }

        let mut avg_error = LaneF32::zero();
        for ch in 0..num_real_channels {
            let delta = candidate_reconstructed[ch].to_f32() - average[ch];
            avg_error = avg_error + delta * delta * channel_weights_sq[ch];
        }

        let better = avg_error.lt(best_average_error).and_not(pti);
        if better.any() {
            best_average_error.conditional_assign(better, avg_error);
            index.conditional_assign(better, LaneU16::splat(table.index as u16));

            for ch in 0..num_real_channels {
                reconstructed[ch].conditional_assign(better, candidate_reconstructed[ch]);
                for epi in 0..2 {
                    eps[epi][ch].conditional_assign(better, candidate_eps[epi][ch]);
                }
            }
        }
    }

    let mut agg_error = AggregatedError::<4>::new();
    for &px in fragment {
        agg_error.add(&reconstructed, &pixels[px as usize], num_real_channels);
    }

    let error = agg_error.finalize(channel_weights_sq) + static_alpha_error;

    let better = error.lt(*shape_best_error);
    if better.any() {
        *shape_best_error = shape_best_error.min(error);
        for epi in 0..2 {
            for ch in 0..num_real_channels {
                shape_best_ep[epi][ch].conditional_assign(better, eps[epi][ch]);
            }
        }
        for slot in fragment_best_indexes.iter_mut().take(fragment.len()) {
            slot.conditional_assign(better, index);
        }
    }
}

#[allow(clippy::needless_range_loop)]
fn try_single_plane(
    flags: Flags,
    pixels: &[[LaneU16; 4]; 16],
    float_pixels: &[[LaneF32; 4]; 16],
    channel_weights: &[f32; 4],
    plan: &Bc7EncodingPlan,
    num_refine_rounds: usize,
    work: &mut WorkInfo,
) {
    let num_refine_rounds = num_refine_rounds.max(1);

    let mut channel_weights_sq = [0.0f32; 4];
    for ch in 0..4 {
        channel_weights_sq[ch] = channel_weights[ch] * channel_weights[ch];
    }

    let mut temps = SinglePlaneTemporaries::new();

    let mut max_alpha = LaneU16::zero();
    let mut min_alpha = LaneU16::splat(255);
    let mut is_punch_through = Mask::splat(true);
    for px in 0..16 {
        let a = pixels[px][3];
        max_alpha = max_alpha.max(a);
        min_alpha = min_alpha.min(a);

        is_punch_through = is_punch_through
            & (a.eq(LaneU16::zero()) | a.eq(LaneU16::splat(255)));
    }

    let block_has_non_max_alpha = min_alpha.lt(LaneU16::splat(255));
    let block_has_non_zero_alpha = LaneU16::zero().lt(max_alpha);

    let any_block_has_alpha = block_has_non_max_alpha.any();

    // RGB modes stay in play while some block is essentially opaque.
    let allow_rgb_modes = LaneU16::splat(250).lt(min_alpha).any();

    // Mode 4's 7.7.7.1 endpoints nearly always beat mode 7 on opaque
    // blocks, so mode 7 is only tried for RGB when the plan asks for it.
    let allow_mode7 = any_block_has_alpha || plan.mode7_rgb_partition_enabled != 0;

    let pre_weighted = pre_weight_pixels(pixels, channel_weights);

    if allow_rgb_modes {
        let mut rgb_weights = [0.0f32; 3];
        rgb_weights.copy_from_slice(&channel_weights[..3]);

        let mut pre_weighted_rgb = [[LaneF32::zero(); 3]; 16];
        for px in 0..16 {
            for ch in 0..3 {
                pre_weighted_rgb[px][ch] = pre_weighted[px][ch];
            }
        }

        for i in 0..plan.rgb_num_shapes {
            let shape = plan.rgb_shape_list[i] as usize;
            temps.unfinished_rgb[shape] =
                fit_shape_endpoints(shape, &pre_weighted_rgb, &rgb_weights);
        }
    }

    for i in 0..plan.rgba_num_shapes {
        let shape = plan.rgba_shape_list[i] as usize;
        // The RGB fit only exists for shapes an RGB mode evaluates; the
        // single subset shape is RGBA-only and always needs its own fit.
        let have_rgb_fit = allow_rgb_modes && plan.seed_points_for_shape_rgb[shape] > 0;
        if any_block_has_alpha || !have_rgb_fit {
            temps.unfinished_rgba[shape] =
                fit_shape_endpoints(shape, &pre_weighted, channel_weights);
        } else {
            temps.unfinished_rgba[shape] = temps.unfinished_rgb[shape].expand_alpha(255.0);
        }
    }

    for mode in [0usize, 1, 2, 3, 6, 7] {
        if mode < 4 && !allow_rgb_modes {
            continue;
        }
        if mode == 7 && !allow_mode7 {
            continue;
        }

        let mode_info = &BC7_MODES[mode];
        let is_rgb = mode < 4;

        let num_partitions = 1usize << mode_info.partition_bits;
        let num_subsets = mode_info.num_subsets;
        let index_prec = mode_info.index_bits;

        let parity_bit_max = match mode_info.p_bit_mode {
            PBitMode::PerEndpoint => 4,
            PBitMode::PerSubset => 2,
            PBitMode::None => 1,
        };

        let num_real_channels = if is_rgb { 3 } else { 4 };

        let shape_list: &[u8] = match num_subsets {
            1 => &SHAPE_LIST_1,
            2 => &SHAPE_LIST_2,
            _ => {
                if num_partitions == 16 {
                    &SHAPE_LIST_3_SHORT
                } else {
                    &SHAPE_LIST_3
                }
            }
        };

        for slot in temps.shape_best_error.iter_mut() {
            *slot = LaneF32::splat(f32::MAX);
        }

        for &shape in shape_list {
            let shape = shape as usize;

            let num_tweak_rounds = if is_rgb {
                plan.seed_points_for_shape_rgb[shape] as usize
            } else {
                plan.seed_points_for_shape_rgba[shape] as usize
            };
            if num_tweak_rounds == 0 {
                continue;
            }
            let num_tweak_rounds = num_tweak_rounds.min(MAX_TWEAK_ROUNDS);

            let (shape_start, shape_length) = shape_range(shape);

            // RGB modes leave alpha at 255; the residual alpha error is a
            // constant for the shape.
            let mut alpha_agg = AggregatedError::<1>::new();
            if is_rgb && any_block_has_alpha {
                let filled_alpha = [LaneU16::splat(255)];
                for i in 0..shape_length {
                    let px = FRAGMENTS[shape_start + i] as usize;
                    alpha_agg.add(&filled_alpha, &[pixels[px][3]], 1);
                }
            }
            let static_alpha_error = alpha_agg.finalize(&[channel_weights_sq[3]]);

            let mut tweak_base_ep = [[[LaneU16::zero(); 4]; 2]; MAX_TWEAK_ROUNDS];
            for tweak in 0..num_tweak_rounds {
                if is_rgb {
                    let finished = temps.unfinished_rgb[shape].finish_ldr(tweak, 1 << index_prec);
                    for epi in 0..2 {
                        for ch in 0..3 {
                            tweak_base_ep[tweak][epi][ch] = finished[epi][ch];
                        }
                        tweak_base_ep[tweak][epi][3] = LaneU16::splat(255);
                    }
                } else {
                    tweak_base_ep[tweak] =
                        temps.unfinished_rgba[shape].finish_ldr(tweak, 1 << index_prec);
                }
            }

            let mut punch_through_invalid = [Mask::splat(false); 4];
            for p_iter in 0..parity_bit_max {
                if flags.contains(Flags::BC7_RESPECT_PUNCH_THROUGH) && (mode == 6 || mode == 7) {
                    // These parity bits affect alpha.
                    if p_iter == 0 {
                        punch_through_invalid[p_iter] = is_punch_through & block_has_non_zero_alpha;
                    } else if p_iter == parity_bit_max - 1 {
                        punch_through_invalid[p_iter] = is_punch_through & block_has_non_max_alpha;
                    } else {
                        punch_through_invalid[p_iter] = is_punch_through;
                    }
                }
            }

            for p_iter in 0..parity_bit_max {
                if punch_through_invalid[p_iter].all() {
                    continue;
                }
                let need_punch_through_check = punch_through_invalid[p_iter].any();

                let p = [(p_iter & 1) as u16, ((p_iter >> 1) & 1) as u16];

                for tweak in 0..num_tweak_rounds {
                    let mut ep = tweak_base_ep[tweak];

                    for refine in 0..num_refine_rounds {
                        match mode {
                            0 => compress_endpoints0(&mut ep, p),
                            1 => compress_endpoints1(&mut ep, p[0]),
                            2 => compress_endpoints2(&mut ep),
                            3 => compress_endpoints3(&mut ep, p),
                            6 => compress_endpoints6(&mut ep, p),
                            7 => compress_endpoints7(&mut ep, p),
                            _ => unreachable!("single plane mode {mode}"),
                        }

                        let mut shape_error = LaneF32::zero();

                        let index_selector =
                            IndexSelector::<4>::new(channel_weights, &ep, 1 << index_prec);

                        let mut ep_refiner =
                            EndpointRefiner::<4>::new(1 << index_prec, channel_weights);

                        let mut indexes = [LaneU16::zero(); 16];
                        let mut agg_error = AggregatedError::<4>::new();

                        for i in 0..shape_length {
                            let px = FRAGMENTS[shape_start + i] as usize;

                            let mut index =
                                index_selector.select_ldr(&float_pixels[px], Rounding::Nearest);
                            let mut reconstructed = [LaneU16::zero(); 4];
                            index_selector.reconstruct_ldr_bc7(
                                index,
                                &mut reconstructed,
                                num_real_channels,
                            );

                            if flags.contains(Flags::BC7_FAST_INDEXING) {
                                agg_error.add(&reconstructed, &pixels[px], num_real_channels);
                            } else {
                                let mut error = compute_error_ldr_simple(
                                    &reconstructed,
                                    &pixels[px],
                                    num_real_channels,
                                    &channel_weights_sq,
                                );

                                let alt_indexes = [
                                    index.max(LaneU16::splat(1)) - LaneU16::splat(1),
                                    (index + LaneU16::splat(1))
                                        .min(LaneU16::splat((1 << index_prec) - 1)),
                                ];

                                for alt in alt_indexes {
                                    index_selector.reconstruct_ldr_bc7(
                                        alt,
                                        &mut reconstructed,
                                        num_real_channels,
                                    );

                                    let alt_error = compute_error_ldr_simple(
                                        &reconstructed,
                                        &pixels[px],
                                        num_real_channels,
                                        &channel_weights_sq,
                                    );
                                    let better = alt_error.lt(error);
                                    error = error.min(alt_error);
                                    index.conditional_assign(better, alt);
                                }

                                shape_error = shape_error + error;
                            }

                            if refine != num_refine_rounds - 1 {
                                ep_refiner.contribute(&pre_weighted[px], index, num_real_channels);
                            }

                            indexes[i] = index;
                        }

                        if flags.contains(Flags::BC7_FAST_INDEXING) {
                            shape_error = agg_error.finalize(&channel_weights_sq);
                        }

                        if is_rgb {
                            shape_error = shape_error + static_alpha_error;
                        }

                        let mut better = shape_error.lt(temps.shape_best_error[shape]);
                        if better.any() {
                            let mut punch_through_ok = true;
                            if need_punch_through_check {
                                better = better.and_not(punch_through_invalid[p_iter]);
                                punch_through_ok = better.any();
                            }

                            if punch_through_ok {
                                temps.shape_best_error[shape].conditional_assign(better, shape_error);
                                for epi in 0..2 {
                                    for ch in 0..num_real_channels {
                                        temps.shape_best_ep[shape][epi][ch]
                                            .conditional_assign(better, ep[epi][ch]);
                                    }
                                }
                                for i in 0..shape_length {
                                    temps.fragment_best_indexes[shape_start + i]
                                        .conditional_assign(better, indexes[i]);
                                }
                            }
                        }

                        if refine != num_refine_rounds - 1 {
                            ep = ep_refiner.get_refined_ldr(num_real_channels, Rounding::Nearest);
                        }
                    }
                }
            }

            if flags.contains(Flags::BC7_TRY_SINGLE_COLOR) {
                let mut total = [LaneU16::zero(); 4];
                for i in 0..shape_length {
                    let px = FRAGMENTS[shape_start + i] as usize;
                    for ch in 0..4 {
                        total[ch] = total[ch] + pixels[px][ch];
                    }
                }

                let rcp_len = 1.0 / shape_length as f32;
                let mut average = [LaneF32::zero(); 4];
                for ch in 0..4 {
                    average[ch] = total[ch].to_f32() * rcp_len;
                }

                let fragment = &FRAGMENTS[shape_start..shape_start + shape_length];

                try_single_color_multi_table(
                    pixels,
                    &average,
                    num_real_channels,
                    fragment,
                    static_alpha_error,
                    &punch_through_invalid,
                    &mut temps.shape_best_error[shape],
                    &mut temps.shape_best_ep[shape],
                    &mut temps.fragment_best_indexes[shape_start..shape_start + shape_length],
                    &channel_weights_sq,
                    tables_for_mode(mode),
                );
            }
        }

        let partitions_enabled_bits: u64 = match mode {
            0 => plan.mode0_partition_enabled as u64,
            1 => plan.mode1_partition_enabled,
            2 => plan.mode2_partition_enabled,
            3 => plan.mode3_partition_enabled,
            6 => plan.mode6_enabled as u64,
            7 => {
                if any_block_has_alpha {
                    plan.mode7_rgba_partition_enabled
                } else {
                    plan.mode7_rgb_partition_enabled
                }
            }
            _ => unreachable!(),
        };

        for partition in 0..num_partitions {
            if (partitions_enabled_bits >> partition) & 1 == 0 {
                continue;
            }

            let partition_shapes: &[u8] = match num_subsets {
                1 => &SHAPES_1[partition],
                2 => &SHAPES_2[partition],
                _ => &SHAPES_3[partition],
            };

            let mut total_error = LaneF32::zero();
            for &shape in partition_shapes {
                total_error = total_error + temps.shape_best_error[shape as usize];
            }

            let mut error_better = total_error.lt(work.error);

            if mode == 7 && any_block_has_alpha {
                // Keep opaque blocks out of mode 7 partitions the RGB plan
                // did not ask for, so results match the plan's intent.
                let rgb_allowed = (plan.mode7_rgb_partition_enabled >> partition) & 1 != 0;
                if !rgb_allowed {
                    error_better = error_better & block_has_non_max_alpha;
                }
            }

            if error_better.any() {
                for (subset, &shape) in partition_shapes.iter().enumerate() {
                    let shape = shape as usize;
                    let (shape_start, shape_length) = shape_range(shape);

                    for epi in 0..2 {
                        for ch in 0..4 {
                            work.ep[subset][epi][ch]
                                .conditional_assign(error_better, temps.shape_best_ep[shape][epi][ch]);
                        }
                    }

                    for i in 0..shape_length {
                        let px = FRAGMENTS[shape_start + i] as usize;
                        work.indexes[px].conditional_assign(
                            error_better,
                            temps.fragment_best_indexes[shape_start + i],
                        );
                    }
                }

                work.error.conditional_assign(error_better, total_error);
                work.mode.conditional_assign(error_better, LaneU16::splat(mode as u16));
                work.partition
                    .conditional_assign(error_better, LaneU16::splat(partition as u16));
            }
        }
    }
}

#[allow(clippy::needless_range_loop)]
fn try_dual_plane(
    flags: Flags,
    pixels: &[[LaneU16; 4]; 16],
    float_pixels: &[[LaneF32; 4]; 16],
    channel_weights: &[f32; 4],
    plan: &Bc7EncodingPlan,
    num_refine_rounds: usize,
    work: &mut WorkInfo,
) {
    let num_refine_rounds = num_refine_rounds.max(1);

    let mut channel_weights_sq = [0.0f32; 4];
    for ch in 0..4 {
        channel_weights_sq[ch] = channel_weights[ch] * channel_weights[ch];
    }

    for mode in [4usize, 5] {
        for rotation in 0..4usize {
            let num_sp = if mode == 4 {
                plan.mode4_sp[rotation]
            } else {
                [plan.mode5_sp[rotation]; 2]
            };

            if num_sp[0] == 0 && num_sp[1] == 0 {
                continue;
            }

            let alpha_channel = (rotation + 3) & 3;
            let red_channel = if rotation == 1 { 3 } else { 0 };
            let green_channel = if rotation == 2 { 3 } else { 1 };
            let blue_channel = if rotation == 3 { 3 } else { 2 };

            let mut rotated_rgb = [[LaneU16::zero(); 3]; 16];
            let mut float_rotated_rgb = [[LaneF32::zero(); 3]; 16];
            for px in 0..16 {
                rotated_rgb[px][0] = pixels[px][red_channel];
                rotated_rgb[px][1] = pixels[px][green_channel];
                rotated_rgb[px][2] = pixels[px][blue_channel];
                for ch in 0..3 {
                    float_rotated_rgb[px][ch] = rotated_rgb[px][ch].to_f32();
                }
            }

            let max_index_selector = if mode == 4 { 2 } else { 1 };

            let rotated_rgb_weights = [
                channel_weights[red_channel],
                channel_weights[green_channel],
                channel_weights[blue_channel],
            ];
            let rotated_rgb_weights_sq = [
                channel_weights_sq[red_channel],
                channel_weights_sq[green_channel],
                channel_weights_sq[blue_channel],
            ];
            let rotated_alpha_weight_sq = [channel_weights_sq[alpha_channel]];

            // The alpha plane is independent, so selection and refinement
            // run unweighted; only the error totals are weighted.
            let uniform_weight = [1.0f32];

            let pre_weighted_rotated_rgb = pre_weight_pixels(&rotated_rgb, &rotated_rgb_weights);

            for index_selector_slot in 0..max_index_selector {
                let num_tweak_rounds = num_sp[index_selector_slot] as usize;
                if num_tweak_rounds == 0 {
                    continue;
                }
                let num_tweak_rounds = num_tweak_rounds.min(MAX_TWEAK_ROUNDS);

                let mut rgb_selector = EndpointSelector::<3>::new();
                for pass in 0..NUM_ENDPOINT_PASSES {
                    for px in 0..16 {
                        rgb_selector.contribute(
                            &pre_weighted_rotated_rgb[px],
                            pass,
                            LaneF32::splat(1.0),
                        );
                    }
                    rgb_selector.finish_pass(pass);
                }

                let mut alpha_range = [pixels[0][alpha_channel]; 2];
                for px in 1..16 {
                    alpha_range[0] = alpha_range[0].min(pixels[px][alpha_channel]);
                    alpha_range[1] = alpha_range[1].max(pixels[px][alpha_channel]);
                }

                let (rgb_prec, alpha_prec): (u32, u32) = if mode == 4 {
                    if index_selector_slot != 0 {
                        (3, 2)
                    } else {
                        (2, 3)
                    }
                } else {
                    (2, 2)
                };

                let unfinished_rgb = rgb_selector.get_endpoints(&rotated_rgb_weights);

                let mut best_rgb_error = LaneF32::splat(f32::MAX);
                let mut best_alpha_error = LaneF32::splat(f32::MAX);
                let mut best_rgb_indexes = [LaneU16::zero(); 16];
                let mut best_alpha_indexes = [LaneU16::zero(); 16];
                let mut best_ep = [[LaneU16::zero(); 4]; 2];

                for tweak in 0..num_tweak_rounds {
                    let mut rgb_ep = {
                        let finished = unfinished_rgb.finish_ldr(tweak, 1 << rgb_prec);
                        [finished[0], finished[1]]
                    };
                    let mut alpha_ep = tweak_alpha(alpha_range, tweak, 1 << alpha_prec);

                    for refine in 0..num_refine_rounds {
                        if mode == 4 {
                            compress_endpoints4(&mut rgb_ep, &mut alpha_ep);
                        } else {
                            compress_endpoints5(&mut rgb_ep, &mut alpha_ep);
                        }

                        let alpha_ep_pair = [[alpha_ep[0]], [alpha_ep[1]]];
                        let alpha_index_selector =
                            IndexSelector::<1>::new(&uniform_weight, &alpha_ep_pair, 1 << alpha_prec);
                        let rgb_index_selector =
                            IndexSelector::<3>::new(&rotated_rgb_weights, &rgb_ep, 1 << rgb_prec);

                        let mut rgb_refiner =
                            EndpointRefiner::<3>::new(1 << rgb_prec, &rotated_rgb_weights);
                        let mut alpha_refiner =
                            EndpointRefiner::<1>::new(1 << alpha_prec, &uniform_weight);

                        let mut error_rgb = LaneF32::zero();
                        let mut error_alpha = LaneF32::zero();

                        let mut rgb_indexes = [LaneU16::zero(); 16];
                        let mut alpha_indexes = [LaneU16::zero(); 16];

                        let mut rgb_agg = AggregatedError::<3>::new();
                        let mut alpha_agg = AggregatedError::<1>::new();

                        for px in 0..16 {
                            let mut rgb_index = rgb_index_selector
                                .select_ldr(&float_rotated_rgb[px], Rounding::Nearest);
                            let mut alpha_index = alpha_index_selector
                                .select_ldr(&[float_pixels[px][alpha_channel]], Rounding::Nearest);

                            let mut reconstructed_rgb = [LaneU16::zero(); 3];
                            let mut reconstructed_alpha = [LaneU16::zero(); 1];
                            rgb_index_selector.reconstruct_ldr_bc7(rgb_index, &mut reconstructed_rgb, 3);
                            alpha_index_selector
                                .reconstruct_ldr_bc7(alpha_index, &mut reconstructed_alpha, 1);

                            if flags.contains(Flags::BC7_FAST_INDEXING) {
                                rgb_agg.add(&reconstructed_rgb, &rotated_rgb[px], 3);
                                alpha_agg.add(&reconstructed_alpha, &[pixels[px][alpha_channel]], 1);
                            } else {
                                let mut rgb_error = compute_error_ldr_simple(
                                    &reconstructed_rgb,
                                    &rotated_rgb[px],
                                    3,
                                    &rotated_rgb_weights_sq,
                                );
                                let mut alpha_error = compute_error_ldr_simple(
                                    &reconstructed_alpha,
                                    &[pixels[px][alpha_channel]],
                                    1,
                                    &rotated_alpha_weight_sq,
                                );

                                let alt_rgb = [
                                    rgb_index.max(LaneU16::splat(1)) - LaneU16::splat(1),
                                    (rgb_index + LaneU16::splat(1))
                                        .min(LaneU16::splat((1 << rgb_prec) - 1)),
                                ];
                                let alt_alpha = [
                                    alpha_index.max(LaneU16::splat(1)) - LaneU16::splat(1),
                                    (alpha_index + LaneU16::splat(1))
                                        .min(LaneU16::splat((1 << alpha_prec) - 1)),
                                ];

                                for i in 0..2 {
                                    rgb_index_selector
                                        .reconstruct_ldr_bc7(alt_rgb[i], &mut reconstructed_rgb, 3);
                                    alpha_index_selector.reconstruct_ldr_bc7(
                                        alt_alpha[i],
                                        &mut reconstructed_alpha,
                                        1,
                                    );

                                    let alt_rgb_error = compute_error_ldr_simple(
                                        &reconstructed_rgb,
                                        &rotated_rgb[px],
                                        3,
                                        &rotated_rgb_weights_sq,
                                    );
                                    let alt_alpha_error = compute_error_ldr_simple(
                                        &reconstructed_alpha,
                                        &[pixels[px][alpha_channel]],
                                        1,
                                        &rotated_alpha_weight_sq,
                                    );

                                    let rgb_better = alt_rgb_error.lt(rgb_error);
                                    let alpha_better = alt_alpha_error.lt(alpha_error);

                                    rgb_error = rgb_error.min(alt_rgb_error);
                                    alpha_error = alpha_error.min(alt_alpha_error);

                                    rgb_index.conditional_assign(rgb_better, alt_rgb[i]);
                                    alpha_index.conditional_assign(alpha_better, alt_alpha[i]);
                                }

                                error_rgb = error_rgb + rgb_error;
                                error_alpha = error_alpha + alpha_error;
                            }

                            if refine != num_refine_rounds - 1 {
                                rgb_refiner.contribute(&pre_weighted_rotated_rgb[px], rgb_index, 3);
                                alpha_refiner.contribute(
                                    &[float_pixels[px][alpha_channel]],
                                    alpha_index,
                                    1,
                                );
                            }

                            rgb_indexes[px] = rgb_index;
                            alpha_indexes[px] = alpha_index;
                        }

                        if flags.contains(Flags::BC7_FAST_INDEXING) {
                            error_rgb = rgb_agg.finalize(&rotated_rgb_weights_sq);
                            error_alpha = alpha_agg.finalize(&rotated_alpha_weight_sq);
                        }

                        let rgb_better = error_rgb.lt(best_rgb_error);
                        if rgb_better.any() {
                            best_rgb_error = error_rgb.min(best_rgb_error);
                            for px in 0..16 {
                                best_rgb_indexes[px].conditional_assign(rgb_better, rgb_indexes[px]);
                            }
                            for epi in 0..2 {
                                for ch in 0..3 {
                                    best_ep[epi][ch].conditional_assign(rgb_better, rgb_ep[epi][ch]);
                                }
                            }
                        }

                        let alpha_better = error_alpha.lt(best_alpha_error);
                        if alpha_better.any() {
                            best_alpha_error = error_alpha.min(best_alpha_error);
                            for px in 0..16 {
                                best_alpha_indexes[px]
                                    .conditional_assign(alpha_better, alpha_indexes[px]);
                            }
                            for epi in 0..2 {
                                best_ep[epi][3].conditional_assign(alpha_better, alpha_ep[epi]);
                            }
                        }

                        if refine != num_refine_rounds - 1 {
                            rgb_ep = rgb_refiner.get_refined_ldr(3, Rounding::Nearest);
                            let refined_alpha = alpha_refiner.get_refined_ldr(1, Rounding::Nearest);
                            alpha_ep = [refined_alpha[0][0], refined_alpha[1][0]];
                        }
                    }
                }

                let combined_error = best_rgb_error + best_alpha_error;
                let error_better = combined_error.lt(work.error);

                work.error = combined_error.min(work.error);
                work.mode.conditional_assign(error_better, LaneU16::splat(mode as u16));
                work.rotation
                    .conditional_assign(error_better, LaneU16::splat(rotation as u16));
                work.index_selector
                    .conditional_assign(error_better, LaneU16::splat(index_selector_slot as u16));

                for px in 0..16 {
                    let (primary, secondary) = if index_selector_slot != 0 {
                        (best_alpha_indexes[px], best_rgb_indexes[px])
                    } else {
                        (best_rgb_indexes[px], best_alpha_indexes[px])
                    };
                    work.indexes[px].conditional_assign(error_better, primary);
                    work.indexes2[px].conditional_assign(error_better, secondary);
                }

                for epi in 0..2 {
                    for ch in 0..4 {
                        work.ep[0][epi][ch].conditional_assign(error_better, best_ep[epi][ch]);
                    }
                }
            }
        }
    }
}

/// Encode a batch of blocks to BC7.
pub fn encode_bc7(
    outputs: &mut [[u8; 16]; LANE_WIDTH],
    inputs: &[PixelBlockU8; LANE_WIDTH],
    options: &Options,
    plan: &Bc7EncodingPlan,
) {
    let channel_weights = options.effective_weights();

    let mut pixels = [[LaneU16::zero(); 4]; 16];
    let mut float_pixels = [[LaneF32::zero(); 4]; 16];
    for px in 0..16 {
        for ch in 0..4 {
            for (lane, input) in inputs.iter().enumerate() {
                pixels[px][ch].set_lane(lane, input.pixels[px][ch] as u16);
            }
            float_pixels[px][ch] = pixels[px][ch].to_f32();
        }
    }

    let mut work = WorkInfo::new();

    try_single_plane(
        options.flags,
        &pixels,
        &float_pixels,
        &channel_weights,
        plan,
        options.refine_rounds_bc7,
        &mut work,
    );
    try_dual_plane(
        options.flags,
        &pixels,
        &float_pixels,
        &channel_weights,
        plan,
        options.refine_rounds_bc7,
        &mut work,
    );

    for (lane, output) in outputs.iter_mut().enumerate() {
        pack_one(&work, lane, output);
    }
}

fn pack_one(work: &WorkInfo, lane: usize, output: &mut [u8; 16]) {
    let mode = work.mode.lane(lane) as usize;
    let partition = work.partition.lane(lane);
    let index_selector = work.index_selector.lane(lane);
    let rotation = work.rotation.lane(lane);

    let mode_info = &BC7_MODES[mode];

    let mut indexes = [0u16; 16];
    let mut indexes2 = [0u16; 16];
    let mut end_points = [[[0u16; 4]; 2]; 3];

    for px in 0..16 {
        indexes[px] = work.indexes[px].lane(lane);
        if mode_info.alpha_mode == AlphaMode::Separate {
            indexes2[px] = work.indexes2[px].lane(lane);
        }
    }

    for subset in 0..3 {
        for epi in 0..2 {
            for ch in 0..4 {
                end_points[subset][epi][ch] = work.ep[subset][epi][ch].lane(lane);
            }
        }
    }

    let mut fixups = [0usize; 3];

    if mode_info.alpha_mode == AlphaMode::Separate {
        let mut flip_rgb = indexes[0] & (1 << (mode_info.index_bits - 1)) != 0;
        let mut flip_alpha = indexes2[0] & (1 << (mode_info.alpha_index_bits - 1)) != 0;

        if flip_rgb {
            let high_index = (1 << mode_info.index_bits) - 1;
            for index in indexes.iter_mut() {
                *index = high_index - *index;
            }
        }
        if flip_alpha {
            let high_index = (1 << mode_info.alpha_index_bits) - 1;
            for index in indexes2.iter_mut() {
                *index = high_index - *index;
            }
        }

        // The index selector swaps which stream drives which plane.
        if index_selector != 0 {
            core::mem::swap(&mut flip_rgb, &mut flip_alpha);
        }

        // Only the RGB channels swap; alpha follows its own flip.
        if flip_rgb {
            for ch in 0..3 {
                let tmp = end_points[0][0][ch];
                end_points[0][0][ch] = end_points[0][1][ch];
                end_points[0][1][ch] = tmp;
            }
        }
        if flip_alpha {
            let tmp = end_points[0][0][3];
            end_points[0][0][3] = end_points[0][1][3];
            end_points[0][1][3] = tmp;
        }

        debug_assert!(indexes[0] < (1 << (mode_info.index_bits - 1)));
        debug_assert!(indexes2[0] < (1 << (mode_info.alpha_index_bits - 1)));
    } else {
        if mode_info.num_subsets == 2 {
            fixups[1] = FIXUP_INDEXES_2[partition as usize] as usize;
        } else if mode_info.num_subsets == 3 {
            fixups[1] = FIXUP_INDEXES_3[partition as usize][0] as usize;
            fixups[2] = FIXUP_INDEXES_3[partition as usize][1] as usize;
        }

        let mut flip = [false; 3];
        for subset in 0..mode_info.num_subsets {
            flip[subset] = indexes[fixups[subset]] & (1 << (mode_info.index_bits - 1)) != 0;
        }

        if flip.iter().any(|&f| f) {
            let high_index = (1 << mode_info.index_bits) - 1;
            for px in 0..16 {
                let subset = subset_for_pixel(mode_info.num_subsets, partition, px);
                if flip[subset] {
                    indexes[px] = high_index - indexes[px];
                }
            }

            let max_ch = if mode_info.alpha_mode == AlphaMode::Combined { 4 } else { 3 };
            for subset in 0..mode_info.num_subsets {
                if flip[subset] {
                    for ch in 0..max_ch {
                        let tmp = end_points[subset][0][ch];
                        end_points[subset][0][ch] = end_points[subset][1][ch];
                        end_points[subset][1][ch] = tmp;
                    }
                }
            }
        }

        for subset in 0..mode_info.num_subsets {
            debug_assert!(indexes[fixups[subset]] < (1 << (mode_info.index_bits - 1)));
        }
    }

    let mut packer = Packer::new();

    packer.pack(1 << mode, mode + 1);

    if mode_info.partition_bits > 0 {
        packer.pack(partition, mode_info.partition_bits as usize);
    }

    if mode_info.alpha_mode == AlphaMode::Separate {
        packer.pack(rotation, 2);
    }

    if mode_info.has_index_selector {
        packer.pack(index_selector, 1);
    }

    for ch in 0..3 {
        for subset in 0..mode_info.num_subsets {
            for epi in 0..2 {
                let ep_part = end_points[subset][epi][ch] >> (8 - mode_info.rgb_bits);
                packer.pack(ep_part, mode_info.rgb_bits as usize);
            }
        }
    }

    if mode_info.alpha_mode != AlphaMode::None {
        for subset in 0..mode_info.num_subsets {
            for epi in 0..2 {
                let ep_part = end_points[subset][epi][3] >> (8 - mode_info.alpha_bits);
                packer.pack(ep_part, mode_info.alpha_bits as usize);
            }
        }
    }

    match mode_info.p_bit_mode {
        PBitMode::PerSubset => {
            for subset in 0..mode_info.num_subsets {
                let p = (end_points[subset][0][0] >> (7 - mode_info.rgb_bits)) & 1;
                packer.pack(p, 1);
            }
        }
        PBitMode::PerEndpoint => {
            for subset in 0..mode_info.num_subsets {
                for epi in 0..2 {
                    let p = (end_points[subset][epi][0] >> (7 - mode_info.rgb_bits)) & 1;
                    packer.pack(p, 1);
                }
            }
        }
        PBitMode::None => {}
    }

    for px in 0..16 {
        let mut bits = mode_info.index_bits as usize;
        if px == 0 || px == fixups[1] || px == fixups[2] {
            bits -= 1;
        }
        packer.pack(indexes[px], bits);
    }

    if mode_info.alpha_mode == AlphaMode::Separate {
        for px in 0..16 {
            let mut bits = mode_info.alpha_index_bits as usize;
            if px == 0 {
                bits -= 1;
            }
            packer.pack(indexes2[px], bits);
        }
    }

    packer.flush(output);
}

pub(crate) fn subset_for_pixel(num_subsets: usize, partition: u16, px: usize) -> usize {
    match num_subsets {
        2 => ((PARTITION_MAP_2[partition as usize] >> px) & 1) as usize,
        3 => ((PARTITION_MAP_3[partition as usize] >> (px * 2)) & 3) as usize,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lanes::LANE_WIDTH;

    fn solid_blocks(color: [u8; 4]) -> [PixelBlockU8; LANE_WIDTH] {
        [PixelBlockU8 { pixels: [color; 16] }; LANE_WIDTH]
    }

    fn encode_one(
        inputs: &[PixelBlockU8; LANE_WIDTH],
        options: &Options,
        quality: u32,
    ) -> [[u8; 16]; LANE_WIDTH] {
        let plan = Bc7EncodingPlan::from_quality(quality);
        let mut outputs = [[0u8; 16]; LANE_WIDTH];
        encode_bc7(&mut outputs, inputs, options, &plan);
        outputs
    }

    fn decode(block: &[u8; 16]) -> [[u8; 4]; 16] {
        let mut out = [[0u8; 4]; 16];
        blockdec::bc7(block, &mut out);
        out
    }

    fn block_mode(block: &[u8; 16]) -> u32 {
        block[0].trailing_zeros()
    }

    #[test]
    fn solid_red_round_trips() {
        let options = Options {
            flags: Flags::BC7_TRY_SINGLE_COLOR,
            ..Options::default()
        };
        let outputs = encode_one(&solid_blocks([255, 0, 0, 255]), &options, 40);

        for block in &outputs {
            let decoded = decode(block);
            for px in decoded {
                for ch in 0..4 {
                    let expected = [255u8, 0, 0, 255][ch] as i32;
                    assert!((px[ch] as i32 - expected).abs() <= 1, "{px:?}");
                }
            }
        }
    }

    #[test]
    fn mode_prefix_bit_is_unary() {
        for color in [[255u8, 0, 0, 255], [1, 2, 3, 4], [128, 128, 128, 0]] {
            let outputs = encode_one(&solid_blocks(color), &Options::default(), 40);
            for block in &outputs {
                assert_ne!(block[0], 0, "mode prefix must contain a set bit");
                let mode = block_mode(block);
                assert!(mode <= 7);
            }
        }
    }

    #[test]
    fn horizontal_gradient_round_trips() {
        let mut pixels = [[0u8; 4]; 16];
        for (px, pixel) in pixels.iter_mut().enumerate() {
            let row = (px / 4) as u8;
            *pixel = [row * 16, row * 16, row * 16, 255];
        }
        let inputs = [PixelBlockU8 { pixels }; LANE_WIDTH];

        let outputs = encode_one(&inputs, &Options::default(), 40);
        for block in &outputs {
            let decoded = decode(block);
            for (px, pixel) in decoded.iter().enumerate() {
                for ch in 0..4 {
                    let expected = pixels[px][ch] as i32;
                    assert!(
                        (pixel[ch] as i32 - expected).abs() <= 1,
                        "pixel {px} channel {ch}: {} vs {expected}",
                        pixel[ch]
                    );
                }
            }
        }
    }

    #[test]
    fn varied_blocks_pack_and_decode() {
        // Exercises the multi-subset packing paths; the canonical fixup
        // form and 128 bit total are asserted inside pack_one and flush.
        let mut pixels = [[0u8; 4]; 16];
        for (px, pixel) in pixels.iter_mut().enumerate() {
            let v = (px * 16) as u8;
            *pixel = [v, 255 - v, (px as u8) * 7, 255];
        }
        let inputs = [PixelBlockU8 { pixels }; LANE_WIDTH];
        let outputs = encode_one(&inputs, &Options::default(), 60);

        for block in &outputs {
            let decoded = decode(block);
            for (px, pixel) in decoded.iter().enumerate() {
                for ch in 0..3 {
                    let d = (pixel[ch] as i32 - pixels[px][ch] as i32).abs();
                    assert!(d <= 40, "pixel {px} channel {ch} off by {d}");
                }
                assert!(pixel[3] >= 254);
            }
        }
    }

    #[test]
    fn quality_is_monotone() {
        let mut pixels = [[0u8; 4]; 16];
        for (px, pixel) in pixels.iter_mut().enumerate() {
            *pixel = [
                (px * 13 % 256) as u8,
                (px * 29 % 256) as u8,
                (255 - px * 11 % 256) as u8,
                255,
            ];
        }
        let inputs = [PixelBlockU8 { pixels }; LANE_WIDTH];

        let mut previous_error = u64::MAX;
        for quality in [1u32, 20, 45, 70] {
            let outputs = encode_one(&inputs, &Options::default(), quality);

            let mut total_error = 0u64;
            for block in &outputs {
                let decoded = decode(block);
                for (px, pixel) in decoded.iter().enumerate() {
                    for ch in 0..4 {
                        let d = pixel[ch] as i64 - pixels[px][ch] as i64;
                        total_error += (d * d) as u64;
                    }
                }
            }

            assert!(
                total_error <= previous_error,
                "quality {quality} error {total_error} > {previous_error}"
            );
            previous_error = total_error;
        }
    }

    #[test]
    fn punch_through_alpha_stays_binary() {
        let mut pixels = [[0u8; 4]; 16];
        for (px, pixel) in pixels.iter_mut().enumerate() {
            let alpha = if px % 2 == 0 { 0 } else { 255 };
            *pixel = [(px * 17 % 256) as u8, 90, 200, alpha];
        }
        let inputs = [PixelBlockU8 { pixels }; LANE_WIDTH];

        let options = Options {
            flags: Flags::BC7_RESPECT_PUNCH_THROUGH,
            ..Options::default()
        };
        let outputs = encode_one(&inputs, &options, 30);

        for block in &outputs {
            let decoded = decode(block);
            for (px, pixel) in decoded.iter().enumerate() {
                assert_eq!(pixel[3], pixels[px][3], "pixel {px} alpha changed");
            }
        }
    }
}
