//! ETC1 and ETC2 block encoding.
//!
//! ETC2 color blocks try planar, T (twice, with the chroma split flipped),
//! H, and the two ETC1 base modes, keeping the lowest error encoding. The
//! differential legality search and the candidate color dedupe run scalar
//! per lane; everything else is lane parallel.

use crate::lanes::{LaneF32, LaneI16, LaneI32, LaneU16, LaneU32, Mask, Rounding, LANE_WIDTH};
use crate::tables::{
    EAC_MODIFIER_TABLE_POSITIVE, EAC_ROUNDING_TABLES, EAC_ROUNDING_TABLE_WIDTH,
    ETC1_MODIFIER_TABLES, ETC1_POTENTIAL_OFFSETS, ETC_TH_MODIFIER_TABLE, MAX_DIFFERENTIAL_ATTEMPTS,
    MAX_POTENTIAL_OFFSETS,
};
use crate::{Flags, Options, PixelBlockScalarS16, PixelBlockU8};

/// Pixels of each half block for the two flip orientations.
const FLIP_TABLES: [[[usize; 8]; 2]; 2] = [
    [[0, 1, 4, 5, 8, 9, 12, 13], [2, 3, 6, 7, 10, 11, 14, 15]],
    [[0, 1, 2, 3, 4, 5, 6, 7], [8, 9, 10, 11, 12, 13, 14, 15]],
];

/// Wire codes for the four sorted modifier slots.
const MODIFIER_CODES: [u16; 4] = [3, 2, 0, 1];

/// Column major wire order of the selector bits.
const SELECTOR_ORDER: [usize; 16] = [0, 4, 8, 12, 1, 5, 9, 13, 2, 6, 10, 14, 3, 7, 11, 15];

/// Scratch for the differential pair search.
pub struct DiffResolveStorage {
    num_attempts: [LaneU16; 2],
    errors: [Vec<LaneF32>; 2],
    selectors: [Vec<LaneU16>; 2],
    colors: [Vec<LaneU16>; 2],
    tables: [Vec<LaneU16>; 2],
    sort_indexes: [Vec<u16>; 2],
}

impl DiffResolveStorage {
    fn new() -> Self {
        // Differential-only encodes append one extra candidate per table.
        let capacity = MAX_DIFFERENTIAL_ATTEMPTS + 8;
        let zero_f = vec![LaneF32::zero(); capacity];
        let zero_u = vec![LaneU16::zero(); capacity];
        let zero_s = vec![0u16; capacity];
        DiffResolveStorage {
            num_attempts: [LaneU16::zero(); 2],
            errors: [zero_f.clone(), zero_f],
            selectors: [zero_u.clone(), zero_u.clone()],
            colors: [zero_u.clone(), zero_u.clone()],
            tables: [zero_u.clone(), zero_u],
            sort_indexes: [zero_s.clone(), zero_s],
        }
    }
}

/// Scratch for H mode color pair evaluation.
pub struct HModeEval {
    errors: Vec<[LaneF32; 16]>,
    sign_bits: Vec<LaneU16>,
    unique_quantized: Vec<LaneU16>,
    num_unique: [LaneU16; 2],
}

impl HModeEval {
    // Each sector contributes at most 33 distinct quantized colors (the
    // offset premultiplier walk is 33 steps long).
    const MAX_COLORS: usize = 66;

    fn new() -> Self {
        HModeEval {
            errors: vec![[LaneF32::zero(); 16]; Self::MAX_COLORS],
            sign_bits: vec![LaneU16::zero(); Self::MAX_COLORS],
            unique_quantized: vec![LaneU16::zero(); Self::MAX_COLORS],
            num_unique: [LaneU16::zero(); 2],
        }
    }
}

/// Caller owned workspace for ETC1 encoding.
pub struct Etc1Scratch {
    drs: DiffResolveStorage,
}

impl Etc1Scratch {
    pub fn new() -> Box<Self> {
        Box::new(Etc1Scratch {
            drs: DiffResolveStorage::new(),
        })
    }
}

/// Caller owned workspace for ETC2 encoding.
pub struct Etc2Scratch {
    h: HModeEval,
    drs: DiffResolveStorage,
}

impl Etc2Scratch {
    pub fn new() -> Box<Self> {
        Box::new(Etc2Scratch {
            h: HModeEval::new(),
            drs: DiffResolveStorage::new(),
        })
    }
}

#[derive(Clone, Copy)]
struct EtcParams {
    flags: Flags,
    weights: [f32; 3],
}

impl EtcParams {
    fn from_options(options: &Options) -> Self {
        let weights = options.effective_weights();
        EtcParams {
            flags: options.flags,
            weights: [weights[0], weights[1], weights[2]],
        }
    }

    fn is_uniform(&self) -> bool {
        self.flags.contains(Flags::UNIFORM)
    }

    fn is_fake_bt709(&self) -> bool {
        self.flags.contains(Flags::ETC_USE_FAKE_BT709) && !self.is_uniform()
    }
}

fn compute_error_uniform(pixel_a: &[LaneU16; 3], pixel_b: &[LaneU16; 3]) -> LaneF32 {
    let mut error = LaneF32::zero();
    for ch in 0..3 {
        let diff = (pixel_a[ch].to_i16() - pixel_b[ch].to_i16()).to_f32();
        error = error + diff * diff;
    }
    error
}

fn compute_error_weighted(
    reconstructed: &[LaneU16; 3],
    pre_weighted_pixel: &[LaneF32; 3],
    params: &EtcParams,
) -> LaneF32 {
    let mut error = LaneF32::zero();
    for ch in 0..3 {
        let diff = reconstructed[ch].to_f32() * params.weights[ch] - pre_weighted_pixel[ch];
        error = error + diff * diff;
    }
    error
}

fn compute_error_fake_bt709(
    reconstructed: &[LaneU16; 3],
    pre_weighted_pixel: &[LaneF32; 3],
) -> LaneF32 {
    let yuv = convert_to_fake_bt709(
        reconstructed[0].to_f32(),
        reconstructed[1].to_f32(),
        reconstructed[2].to_f32(),
    );

    let mut error = LaneF32::zero();
    for ch in 0..3 {
        let diff = yuv[ch] - pre_weighted_pixel[ch];
        error = error + diff * diff;
    }
    error
}

fn pixel_error(
    reconstructed: &[LaneU16; 3],
    pixels: &[LaneU16; 3],
    pre_weighted: &[LaneF32; 3],
    params: &EtcParams,
) -> LaneF32 {
    if params.is_fake_bt709() {
        compute_error_fake_bt709(reconstructed, pre_weighted)
    } else if params.is_uniform() {
        compute_error_uniform(reconstructed, pixels)
    } else {
        compute_error_weighted(reconstructed, pre_weighted, params)
    }
}

fn convert_to_fake_bt709(r: LaneF32, g: LaneF32, b: LaneF32) -> [LaneF32; 3] {
    [
        r * 0.368233989135369 + g * 1.23876274963149 + b * 0.125054068802017,
        r * 0.5 - g * 0.4541529 - b * 0.04584709,
        r * -0.081014709086133 - g * 0.272538676238785 + b * 0.353553390593274,
    ]
}

fn convert_from_fake_bt709(yuv: &[LaneF32; 3]) -> [LaneF32; 3] {
    let y = yuv[0] * 0.57735026466774571071;
    let u = yuv[1];
    let v = yuv[2];

    [
        y + u * 1.5748000207960953486,
        y - u * 0.46812425854364753669 - v * 0.26491652528157560861,
        y + v * 2.6242146882856944069,
    ]
}

fn etc_differential_is_legal_scalar(a: u16, b: u16) -> bool {
    fn channel(a: u16, b: u16) -> bool {
        let diff = b as i16 - a as i16;
        (-4..=3).contains(&diff)
    }

    channel(a >> 10, b >> 10) && channel((a >> 5) & 31, (b >> 5) & 31) && channel(a & 31, b & 31)
}

fn extract_blocks(
    inputs: &[PixelBlockU8; LANE_WIDTH],
    params: &EtcParams,
) -> ([[LaneU16; 3]; 16], [[LaneF32; 3]; 16]) {
    let mut pixels = [[LaneU16::zero(); 3]; 16];
    let mut pre_weighted = [[LaneF32::zero(); 3]; 16];

    for px in 0..16 {
        for ch in 0..3 {
            for (lane, input) in inputs.iter().enumerate() {
                pixels[px][ch].set_lane(lane, input.pixels[px][ch] as u16);
            }
        }

        if params.is_fake_bt709() {
            pre_weighted[px] = convert_to_fake_bt709(
                pixels[px][0].to_f32(),
                pixels[px][1].to_f32(),
                pixels[px][2].to_f32(),
            );
        } else if params.is_uniform() {
            for ch in 0..3 {
                pre_weighted[px][ch] = pixels[px][ch].to_f32();
            }
        } else {
            for ch in 0..3 {
                pre_weighted[px][ch] = pixels[px][ch].to_f32() * params.weights[ch];
            }
        }
    }

    (pixels, pre_weighted)
}

/// Write the two 32 bit halves of a block as big endian bytes for the lanes
/// selected by `mask`.
fn emit_blocks(outputs: &mut [[u8; 8]; LANE_WIDTH], mask: Mask, blocks: &[u64; LANE_WIDTH]) {
    for lane in 0..LANE_WIDTH {
        if mask.lane(lane) {
            outputs[lane] = blocks[lane].to_be_bytes();
        }
    }
}

/// Score one half block against a quantized base color and modifier table.
fn test_half_block(
    quantized_packed_color: LaneU16,
    pixels: &[[LaneU16; 3]; 8],
    pre_weighted: &[[LaneF32; 3]; 8],
    modifiers: &[i16; 4],
    is_differential: bool,
    params: &EtcParams,
) -> (LaneF32, LaneU16) {
    let mut unquantized = [LaneU16::zero(); 3];
    for ch in 0..3 {
        let quantized = (quantized_packed_color >> (ch as u32 * 5)) & LaneU16::splat(31);
        unquantized[ch] = if is_differential {
            (quantized << 3) | (quantized >> 2)
        } else {
            (quantized << 4) | quantized
        };
    }

    let mut modified = [[LaneU16::zero(); 3]; 4];
    for (s, modifier) in modifiers.iter().enumerate() {
        for ch in 0..3 {
            let value = unquantized[ch].to_i16() + LaneI16::splat(*modifier);
            modified[s][ch] = value.max(LaneI16::zero()).to_u16().min(LaneU16::splat(255));
        }
    }

    let mut selectors = LaneU16::zero();
    let mut total_error = LaneF32::zero();

    for px in 0..8 {
        let mut best_error = LaneF32::splat(f32::MAX);
        let mut best_selector = LaneU16::zero();

        for (s, candidate) in modified.iter().enumerate() {
            let error = pixel_error(candidate, &pixels[px], &pre_weighted[px], params);

            let better = error.lt(best_error);
            best_selector.conditional_assign(better, LaneU16::splat(s as u16));
            best_error = best_error.min(error);
        }

        total_error = total_error + best_error;
        selectors = selectors | (best_selector << (px as u32 * 2));
    }

    (total_error, selectors)
}

/// T and H mode sector split: a 2D PCA over the chroma plane assigns each
/// pixel to one of two sectors.
fn chroma_sector_assignments(pixels: &[[LaneU16; 3]; 16]) -> [Mask; 16] {
    let mut chroma = [[LaneI16::zero(); 2]; 16];
    for px in 0..16 {
        chroma[px][0] = pixels[px][0].to_i16() - pixels[px][2].to_i16();
        chroma[px][1] =
            pixels[px][0].to_i16() - (pixels[px][1] << 1).to_i16() + pixels[px][2].to_i16();
    }

    let mut centroid = [LaneI16::zero(); 2];
    for px in 0..16 {
        for ch in 0..2 {
            centroid[ch] = centroid[ch] + chroma[px][ch];
        }
    }

    let mut delta = [[LaneI16::zero(); 2]; 16];
    for px in 0..16 {
        for ch in 0..2 {
            delta[px][ch] = (chroma[px][ch] << 4) - centroid[ch];
        }
    }

    let rcp_sqrt3 = 0.57735026918962576450914878050196f32;

    let mut cov_xx = LaneF32::zero();
    let mut cov_yy = LaneF32::zero();
    let mut cov_xy = LaneF32::zero();
    for px in 0..16 {
        let nx = delta[px][0].to_f32();
        let ny = delta[px][1].to_f32() * rcp_sqrt3;
        cov_xx = cov_xx + nx * nx;
        cov_yy = cov_yy + ny * ny;
        cov_xy = cov_xy + nx * ny;
    }

    let half_trace = (cov_xx + cov_yy) * 0.5;
    let det = cov_xx * cov_yy - cov_xy * cov_xy;
    let mm = (half_trace * half_trace - det).max(LaneF32::zero()).sqrt();
    let ev = half_trace + mm;

    let mut dx = cov_yy - ev + cov_xy;
    let dy = -(cov_xx - ev + cov_xy);

    // A degenerate distribution gets an arbitrary split plane.
    let all_zero = dx.eq(LaneF32::zero()) & dy.eq(LaneF32::zero());
    dx.conditional_assign(all_zero, LaneF32::splat(1.0));

    let mut assignments = [Mask::splat(false); 16];
    for px in 0..16 {
        let dot = delta[px][0].to_f32() * dx + delta[px][1].to_f32() * dy * rcp_sqrt3;
        assignments[px] = dot.lt(LaneF32::zero());
    }
    assignments
}

/// Round a 4 bit quantized color toward the best of the eight floor/ceil
/// octants in the fake BT.709 metric.
fn resolve_th_fake_bt709_rounding(
    quantized: &mut [LaneU16; 3],
    targets: &[LaneU16; 3],
    granularity: LaneU16,
) {
    let mut low_octant = [LaneF32::zero(); 3];
    let mut high_octant = [LaneF32::zero(); 3];

    for ch in 0..3 {
        let unquantized = (quantized[ch] << 4) | quantized[ch];
        let unquantized_next =
            (unquantized + LaneU16::splat(17)).min(LaneU16::splat(255));

        low_octant[ch] = (unquantized.compact_mul(granularity) << 1).to_f32();
        high_octant[ch] = (unquantized_next.compact_mul(granularity) << 1).to_f32();
    }

    let mut best_error = LaneF32::splat(f32::MAX);
    let mut best_octant = LaneU16::zero();

    let cumulative_yuv =
        convert_to_fake_bt709(targets[0].to_f32(), targets[1].to_f32(), targets[2].to_f32());

    for octant in 0..8u16 {
        let r = if octant & 1 != 0 { high_octant[0] } else { low_octant[0] };
        let g = if octant & 2 != 0 { high_octant[1] } else { low_octant[1] };
        let b = if octant & 4 != 0 { high_octant[2] } else { low_octant[2] };

        let octant_yuv = convert_to_fake_bt709(r, g, b);

        let mut error = LaneF32::zero();
        for ch in 0..3 {
            let delta = octant_yuv[ch] - cumulative_yuv[ch];
            error = error + delta * delta;
        }

        let better = error.lt(best_error);
        best_octant.conditional_assign(better, LaneU16::splat(octant));
        best_error = best_error.min(error);
    }

    for ch in 0..3 {
        quantized[ch] = quantized[ch] + ((best_octant >> ch as u32) & LaneU16::splat(1));
    }
}

/// Quantize a half block color sum in the fake BT.709 metric, either with
/// the 8-octant search or a per channel round to nearest.
fn resolve_half_block_fake_bt709(
    quantized: &mut [LaneU16; 3],
    sector_cumulative: &[LaneU16; 3],
    is_differential: bool,
    accurate: bool,
) {
    if accurate {
        for ch in 0..3 {
            let cu = sector_cumulative[ch];
            quantized[ch] = if is_differential {
                ((cu << 5) - cu + (cu >> 3)) >> 11
            } else {
                ((cu << 5) - (cu << 1) + (cu >> 3)) >> 12
            };
        }

        let mut low_octant = [LaneF32::zero(); 3];
        let mut high_octant = [LaneF32::zero(); 3];
        for ch in 0..3 {
            let (unquantized, unquantized_next) = if is_differential {
                let unq = (quantized[ch] << 3) | (quantized[ch] >> 2);
                let next = (quantized[ch] + LaneU16::splat(1)).min(LaneU16::splat(31));
                (unq, (next << 3) | (next >> 2))
            } else {
                let unq = (quantized[ch] << 4) | quantized[ch];
                (unq, (unq + LaneU16::splat(17)).min(LaneU16::splat(255)))
            };
            low_octant[ch] = (unquantized << 3).to_f32();
            high_octant[ch] = (unquantized_next << 3).to_f32();
        }

        let mut best_error = LaneF32::splat(f32::MAX);
        let mut best_octant = LaneU16::zero();

        let cumulative_yuv = convert_to_fake_bt709(
            sector_cumulative[0].to_f32(),
            sector_cumulative[1].to_f32(),
            sector_cumulative[2].to_f32(),
        );

        for octant in 0..8u16 {
            let r = if octant & 1 != 0 { high_octant[0] } else { low_octant[0] };
            let g = if octant & 2 != 0 { high_octant[1] } else { low_octant[1] };
            let b = if octant & 4 != 0 { high_octant[2] } else { low_octant[2] };

            let octant_yuv = convert_to_fake_bt709(r, g, b);

            let mut error = LaneF32::zero();
            for ch in 0..3 {
                let delta = octant_yuv[ch] - cumulative_yuv[ch];
                error = error + delta * delta;
            }

            let better = error.lt(best_error);
            best_octant.conditional_assign(better, LaneU16::splat(octant));
            best_error = best_error.min(error);
        }

        let upper = if is_differential { 31 } else { 15 };
        for ch in 0..3 {
            let bumped = quantized[ch] + ((best_octant >> ch as u32) & LaneU16::splat(1));
            quantized[ch] = bumped.min(LaneU16::splat(upper));
        }
    } else {
        // Round to nearest per channel.
        for ch in 0..3 {
            let cu = sector_cumulative[ch];
            quantized[ch] = if is_differential {
                ((cu << 5) - cu + (cu >> 3) + LaneU16::splat(1024)) >> 11
            } else {
                ((cu << 5) - (cu << 1) + (cu >> 3) + LaneU16::splat(2048)) >> 12
            };
        }
    }
}

#[allow(clippy::needless_range_loop)]
fn encode_t_mode(
    outputs: &mut [[u8; 8]; LANE_WIDTH],
    best_error: &mut LaneF32,
    is_isolated: &[Mask; 16],
    pixels: &[[LaneU16; 3]; 16],
    pre_weighted: &[[LaneF32; 3]; 16],
    params: &EtcParams,
) {
    let is_fake_bt709 = params.is_fake_bt709();

    let mut best_is_this_mode = Mask::splat(false);

    let mut isolated_total = [LaneU16::zero(); 3];
    let mut line_total = [LaneU16::zero(); 3];
    let mut num_isolated = LaneU16::zero();

    // Line totals start as the block sum; the isolated sector subtracts out.
    for px in 0..16 {
        for ch in 0..3 {
            isolated_total[ch] =
                isolated_total[ch] + LaneU16::select_or_zero(is_isolated[px], pixels[px][ch]);
            line_total[ch] = line_total[ch] + pixels[px][ch];
        }
        num_isolated = num_isolated + LaneU16::select_or_zero(is_isolated[px], LaneU16::splat(1));
    }

    for ch in 0..3 {
        line_total[ch] = line_total[ch] - isolated_total[ch];
    }
    let num_line = LaneU16::splat(16) - num_isolated;

    let mut isolated_quantized = [LaneU16::zero(); 3];
    let mut isolated_targets = [LaneU16::zero(); 3];
    {
        let addend = (num_isolated << 4) | num_isolated;
        for ch in 0..3 {
            let mut numerator = isolated_total[ch] + isolated_total[ch];
            if !is_fake_bt709 {
                numerator = numerator + addend;
            }

            for lane in 0..LANE_WIDTH {
                let divisor = num_isolated.lane(lane) as u32 * 34;
                let q = if divisor == 0 {
                    0
                } else {
                    (numerator.lane(lane) as u32 / divisor) as u16
                };
                isolated_quantized[ch].set_lane(lane, q.min(15));
            }

            isolated_targets[ch] = numerator;
        }
    }

    if is_fake_bt709 {
        resolve_th_fake_bt709_rounding(&mut isolated_quantized, &isolated_targets, num_isolated);
    }

    let mut isolated_color = [LaneU16::zero(); 3];
    for ch in 0..3 {
        isolated_color[ch] = isolated_quantized[ch] | (isolated_quantized[ch] << 4);
    }

    let mut isolated_error = [LaneF32::zero(); 16];
    for px in 0..16 {
        isolated_error[px] = pixel_error(&isolated_color, &pixels[px], &pre_weighted[px], params);
    }

    let mut best_selectors = LaneI32::zero();
    let mut best_table = LaneU16::zero();
    let mut best_line_color = LaneU16::zero();

    let max_line = num_line.to_i16();
    let min_line = max_line.neg();

    let mut cluster_max_line = 0i16;
    for lane in 0..LANE_WIDTH {
        cluster_max_line = cluster_max_line.max(max_line.lane(lane));
    }
    let cluster_min_line = -cluster_max_line;

    let line_addend = (num_line << 4) | num_line;

    for table in 0..8usize {
        let mut num_unique = [0usize; LANE_WIDTH];
        let mut unique_quantized = [LaneU16::zero(); 33];

        let modifier = LaneU16::splat(ETC_TH_MODIFIER_TABLE[table] as u16);
        let modifier_offset = modifier + modifier;

        for offset_premultiplier in cluster_min_line..=cluster_max_line {
            let clamped =
                LaneI16::splat(offset_premultiplier).max(min_line).min(max_line);
            let modifier_addend = clamped.compact_mul(modifier_offset.to_i16());

            let mut quantized = [LaneU16::zero(); 3];
            if is_fake_bt709 {
                let mut targets = [LaneU16::zero(); 3];
                for ch in 0..3 {
                    let numerator = ((line_total[ch] + line_total[ch]).to_i16() + modifier_addend)
                        .max(LaneI16::zero())
                        .to_u16();

                    for lane in 0..LANE_WIDTH {
                        let divisor = num_line.lane(lane) as u32 * 34;
                        let q = if divisor == 0 {
                            0
                        } else {
                            (numerator.lane(lane) as u32 / divisor) as u16
                        };
                        quantized[ch].set_lane(lane, q.min(15));
                    }
                    targets[ch] = numerator;
                }
                resolve_th_fake_bt709_rounding(&mut quantized, &targets, num_line);
            } else {
                for ch in 0..3 {
                    let numerator = ((line_total[ch] + line_total[ch] + line_addend).to_i16()
                        + modifier_addend)
                        .max(LaneI16::zero())
                        .to_u16();

                    for lane in 0..LANE_WIDTH {
                        let divisor = num_line.lane(lane) as u32 * 34;
                        let q = if divisor == 0 {
                            0
                        } else {
                            (numerator.lane(lane) as u32 / divisor) as u16
                        };
                        quantized[ch].set_lane(lane, q.min(15));
                    }
                }
            }

            let packed = quantized[0] | (quantized[1] << 5) | (quantized[2] << 10);

            for lane in 0..LANE_WIDTH {
                let color = packed.lane(lane);
                let n = num_unique[lane];
                if n == 0 || color != unique_quantized[n - 1].lane(lane) {
                    unique_quantized[n].set_lane(lane, color);
                    num_unique[lane] += 1;
                }
            }
        }

        // Stripe unfilled lanes with their first color so the error loop
        // can stay lane parallel.
        let max_unique = num_unique.iter().copied().max().unwrap();
        for lane in 0..LANE_WIDTH {
            let fill = unique_quantized[0].lane(lane);
            for slot in num_unique[lane]..max_unique {
                unique_quantized[slot].set_lane(lane, fill);
            }
        }

        for ci in 0..max_unique {
            let mut line_colors = [[LaneU16::zero(); 3]; 3];
            for ch in 0..3 {
                let quantized_channel =
                    (unique_quantized[ci] >> (ch as u32 * 5)) & LaneU16::splat(15);
                let unquantized = (quantized_channel << 4) | quantized_channel;

                line_colors[0][ch] = (unquantized + modifier).min(LaneU16::splat(255));
                line_colors[1][ch] = unquantized;
                line_colors[2][ch] = (unquantized.to_i16() - modifier.to_i16())
                    .max(LaneI16::zero())
                    .to_u16();
            }

            let mut selectors = LaneI32::zero();
            let mut error = LaneF32::zero();
            for px in 0..16 {
                let mut px_error = isolated_error[px];
                let mut px_selector = LaneU16::zero();

                for (i, line_color) in line_colors.iter().enumerate() {
                    let candidate_error =
                        pixel_error(line_color, &pixels[px], &pre_weighted[px], params);
                    let better = candidate_error.lt(px_error);
                    px_error = px_error.min(candidate_error);
                    px_selector.conditional_assign(better, LaneU16::splat(i as u16 + 1));
                }

                error = error + px_error;
                selectors = selectors | (px_selector.to_i32() << (px as u32 * 2));
            }

            let better = error.lt(*best_error);
            *best_error = best_error.min(error);

            if better.any() {
                best_line_color.conditional_assign(better, unique_quantized[ci]);
                best_selectors.conditional_assign(better, selectors);
                best_table.conditional_assign(better, LaneU16::splat(table as u16));
                best_is_this_mode = best_is_this_mode | better;
            }
        }
    }

    let mut blocks = [0u64; LANE_WIDTH];
    for lane in 0..LANE_WIDTH {
        if !best_is_this_mode.lane(lane) {
            continue;
        }

        let line_color = best_line_color.lane(lane);
        let isolated = [
            isolated_quantized[0].lane(lane),
            isolated_quantized[1].lane(lane),
            isolated_quantized[2].lane(lane),
        ];
        let table = best_table.lane(lane);
        let selectors = best_selectors.lane(lane);

        let line = [
            line_color & 15,
            (line_color >> 5) & 15,
            (line_color >> 10) & 15,
        ];

        let rh = (isolated[0] >> 2) & 3;
        let rl = isolated[0] & 3;

        let mut block = 0u64;

        // The R channel field must overflow its 5 bit range for hardware
        // to pick T mode.
        if rh + rl < 4 {
            block |= 1 << 58;
        } else {
            block |= 7 << 61;
        }

        block |= (rh as u64) << 59;
        block |= (rl as u64) << 56;
        block |= (isolated[1] as u64) << 52;
        block |= (isolated[2] as u64) << 48;
        block |= (line[0] as u64) << 44;
        block |= (line[1] as u64) << 40;
        block |= (line[2] as u64) << 36;
        block |= (((table >> 1) & 3) as u64) << 34;
        block |= 1 << 33;
        block |= ((table & 1) as u64) << 32;

        for px in 0..16 {
            let sel = (selectors >> (2 * SELECTOR_ORDER[px] as u32)) & 3;
            if sel & 1 != 0 {
                block |= 1 << px;
            }
            if sel & 2 != 0 {
                block |= 1 << (16 + px);
            }
        }

        blocks[lane] = block;
    }

    emit_blocks(outputs, best_is_this_mode, &blocks);
}

#[allow(clippy::needless_range_loop)]
fn encode_h_mode(
    outputs: &mut [[u8; 8]; LANE_WIDTH],
    best_error: &mut LaneF32,
    groupings: &[Mask; 16],
    pixels: &[[LaneU16; 3]; 16],
    he: &mut HModeEval,
    pre_weighted: &[[LaneF32; 3]; 16],
    params: &EtcParams,
) {
    let mut best_is_this_mode = Mask::splat(false);

    let mut counts = [LaneU16::zero(); 2];
    let mut totals = [[LaneU16::zero(); 3]; 2];

    for px in 0..16 {
        for ch in 0..3 {
            totals[0][ch] = totals[0][ch] + pixels[px][ch];
            totals[1][ch] = totals[1][ch] + LaneU16::select_or_zero(groupings[px], pixels[px][ch]);
        }
        counts[1] = counts[1] + LaneU16::select_or_zero(groupings[px], LaneU16::splat(1));
    }

    for ch in 0..3 {
        totals[0][ch] = totals[0][ch] - totals[1][ch];
    }
    counts[0] = LaneU16::splat(16) - counts[1];

    let mut best_sector_bits = LaneU16::zero();
    let mut best_sign_bits = LaneU16::zero();
    let mut best_colors = [LaneU16::zero(); 2];
    let mut best_table = LaneU16::zero();

    for table in 0..8usize {
        let modifier = ETC_TH_MODIFIER_TABLE[table];

        for sector in 0..2 {
            for lane in 0..LANE_WIDTH {
                let mut lane_unique: [u16; 33] = [0; 33];
                let mut lane_num_unique = 0usize;

                let sector_count = counts[sector].lane(lane) as i32;
                let mut sector_totals = [0i32; 3];
                for ch in 0..3 {
                    sector_totals[ch] = totals[sector][ch].lane(lane) as i32;
                }

                let modifier_offset = modifier as i32 * 2;

                for offset_premultiplier in -sector_count..=sector_count {
                    let mut quantized = [0i32; 3];
                    for ch in 0..3 {
                        quantized[ch] = if sector_count == 0 {
                            0
                        } else {
                            ((sector_totals[ch] * 2
                                + sector_count * 17
                                + modifier_offset * offset_premultiplier)
                                .max(0)
                                / (sector_count * 34))
                                .min(15)
                        };
                    }

                    let packed =
                        ((quantized[0] << 10) | (quantized[1] << 5) | quantized[2]) as u16;
                    if lane_num_unique == 0 || packed != lane_unique[lane_num_unique - 1] {
                        lane_unique[lane_num_unique] = packed;
                        lane_num_unique += 1;
                    }
                }

                he.num_unique[sector].set_lane(lane, lane_num_unique as u16);

                let base_index = if sector == 1 {
                    he.num_unique[0].lane(lane) as usize
                } else {
                    0
                };
                for i in 0..lane_num_unique {
                    he.unique_quantized[base_index + i].set_lane(lane, lane_unique[i]);
                }
            }
        }

        let total_colors = he.num_unique[0] + he.num_unique[1];
        let mut max_error_colors = 0usize;
        for lane in 0..LANE_WIDTH {
            max_error_colors = max_error_colors.max(total_colors.lane(lane) as usize);
        }

        for lane in 0..LANE_WIDTH {
            let last = total_colors.lane(lane) as usize;
            let stripe = he.unique_quantized[0].lane(lane);
            for i in last..max_error_colors {
                he.unique_quantized[i].set_lane(lane, stripe);
            }
        }

        for ci in 0..max_error_colors {
            let mut colors = [[LaneU16::zero(); 3]; 2];
            for ch in 0..3 {
                let quantized_channel =
                    (he.unique_quantized[ci] >> ((2 - ch) as u32 * 5)) & LaneU16::splat(15);
                let unquantized = (quantized_channel << 4) | quantized_channel;

                colors[0][ch] = (unquantized + LaneU16::splat(modifier as u16))
                    .min(LaneU16::splat(255));
                colors[1][ch] = (unquantized.to_i16() - LaneI16::splat(modifier))
                    .max(LaneI16::zero())
                    .to_u16();
            }

            let mut sign_bits = LaneU16::zero();
            for px in 0..16 {
                let errors = [
                    pixel_error(&colors[0], &pixels[px], &pre_weighted[px], params),
                    pixel_error(&colors[1], &pixels[px], &pre_weighted[px], params),
                ];

                let one_less = errors[1].lt(errors[0]);
                he.errors[ci][px] = errors[0].min(errors[1]);
                sign_bits =
                    sign_bits | LaneU16::select_or_zero(one_less, LaneU16::splat(1 << px));
            }
            he.sign_bits[ci] = sign_bits;
        }

        let mut max_combos = 0usize;
        for lane in 0..LANE_WIDTH {
            let combos =
                he.num_unique[0].lane(lane) as usize * he.num_unique[1].lane(lane) as usize;
            max_combos = max_combos.max(combos);
        }

        let mut indexes = [LaneU16::zero(); 2];
        let max_index = [
            he.num_unique[0] - LaneU16::splat(1),
            he.num_unique[1] - LaneU16::splat(1),
        ];

        let mut block1_starts = [0usize; LANE_WIDTH];
        for lane in 0..LANE_WIDTH {
            block1_starts[lane] = he.num_unique[0].lane(lane) as usize;
        }

        for _combo in 0..max_combos {
            let mut index0 = indexes[0] + LaneU16::splat(1);
            let index0_overflow = max_index[0].lt(index0);
            index0.conditional_assign(index0_overflow, LaneU16::zero());

            let index1 = max_index[1]
                .min(indexes[1] + LaneU16::select_or_zero(index0_overflow, LaneU16::splat(1)));
            indexes[0] = index0;
            indexes[1] = index1;

            let mut ci0 = [0usize; LANE_WIDTH];
            let mut ci1 = [0usize; LANE_WIDTH];
            let mut color0 = LaneU16::zero();
            let mut color1 = LaneU16::zero();

            for lane in 0..LANE_WIDTH {
                ci0[lane] = index0.lane(lane) as usize;
                ci1[lane] = index1.lane(lane) as usize + block1_starts[lane];
                color0.set_lane(lane, he.unique_quantized[ci0[lane]].lane(lane));
                color1.set_lane(lane, he.unique_quantized[ci1[lane]].lane(lane));
            }

            let mut total_error = LaneF32::zero();
            let mut sector_bits = LaneU16::zero();
            let mut sign_bits = LaneU16::zero();
            for px in 0..16 {
                let mut error_ci0 = LaneF32::zero();
                let mut error_ci1 = LaneF32::zero();
                let mut sign_bits0 = LaneU16::zero();
                let mut sign_bits1 = LaneU16::zero();

                for lane in 0..LANE_WIDTH {
                    error_ci0.set_lane(lane, he.errors[ci0[lane]][px].lane(lane));
                    error_ci1.set_lane(lane, he.errors[ci1[lane]][px].lane(lane));
                    sign_bits0.set_lane(lane, he.sign_bits[ci0[lane]].lane(lane));
                    sign_bits1.set_lane(lane, he.sign_bits[ci1[lane]].lane(lane));
                }

                total_error = total_error + error_ci0.min(error_ci1);

                let bit = LaneU16::splat(1 << px);
                let error1_better = error_ci1.lt(error_ci0);

                sector_bits = sector_bits | LaneU16::select_or_zero(error1_better, bit);
                sign_bits =
                    sign_bits | (bit & LaneU16::select(error1_better, sign_bits1, sign_bits0));
            }

            let better = total_error.lt(*best_error);
            if better.any() {
                best_is_this_mode = best_is_this_mode | better;
                best_table.conditional_assign(better, LaneU16::splat(table as u16));
                best_colors[0].conditional_assign(better, color0);
                best_colors[1].conditional_assign(better, color1);
                best_sector_bits.conditional_assign(better, sector_bits);
                best_sign_bits.conditional_assign(better, sign_bits);
                *best_error = best_error.min(total_error);
            }
        }
    }

    if !best_is_this_mode.any() {
        return;
    }

    let mut blocks = [0u64; LANE_WIDTH];
    let mut emit = Mask::splat(false);

    for lane in 0..LANE_WIDTH {
        if !best_is_this_mode.lane(lane) {
            continue;
        }

        let lane_colors = [best_colors[0].lane(lane), best_colors[1].lane(lane)];
        if lane_colors[0] == lane_colors[1] {
            // An equal pair would decode as T mode; leave the previous
            // best encoding in place.
            continue;
        }

        let mut colors = [[0i32; 3]; 2];
        for sector in 0..2 {
            for ch in 0..3 {
                colors[sector][ch] = ((lane_colors[sector] >> ((2 - ch) * 5)) & 15) as i32;
            }
        }

        let mut sector_bits = best_sector_bits.lane(lane);
        let table = best_table.lane(lane);

        let sign_bits = best_sign_bits.lane(lane);

        // Table bit 0 is carried by the color order.
        if ((table & 1) == 1) != (lane_colors[0] > lane_colors[1]) {
            colors.swap(0, 1);
            sector_bits ^= 0xffff;
        }

        let r1 = colors[0][0] as u64;
        let g1a = (colors[0][1] >> 1) as u64;
        let g1b = (colors[0][1] & 1) as u64;
        let b1a = (colors[0][2] >> 3) as u64;
        let b1b = (colors[0][2] & 7) as u64;
        let r2 = colors[1][0] as u64;
        let g2 = colors[1][1] as u64;
        let b2 = colors[1][2] as u64;

        let mut block = 0u64;

        // R must not overflow, G must.
        if (g1a & 4) != 0 && r1 + g1a < 8 {
            block |= 1 << 63;
        }

        let fake_dg = b1b >> 1;
        let fake_g = b1a | (g1b << 1);
        if fake_g + fake_dg < 4 {
            block |= 1 << 50;
        } else {
            block |= 7 << 53;
        }

        let da = ((table >> 2) & 1) as u64;
        let db = ((table >> 1) & 1) as u64;

        block |= r1 << 59;
        block |= g1a << 56;
        block |= g1b << 52;
        block |= b1a << 51;
        block |= b1b << 47;
        block |= r2 << 43;
        block |= g2 << 39;
        block |= b2 << 35;
        block |= da << 34;
        block |= 1 << 33;
        block |= db << 32;

        for px in 0..16 {
            let sector_bit = (sector_bits >> SELECTOR_ORDER[px]) & 1;
            let sign_bit = (sign_bits >> SELECTOR_ORDER[px]) & 1;

            block |= (sign_bit as u64) << px;
            block |= (sector_bit as u64) << (16 + px);
        }

        blocks[lane] = block;
        emit.set_lane(lane, true);
    }

    emit_blocks(outputs, emit, &blocks);
}

fn decode_planar_coeff(coeff: LaneU16, ch: usize) -> LaneU16 {
    if ch == 1 {
        (coeff << 1) | (coeff >> 6)
    } else {
        (coeff << 2) | (coeff >> 4)
    }
}

#[allow(clippy::needless_range_loop)]
fn encode_planar(
    outputs: &mut [[u8; 8]; LANE_WIDTH],
    best_error: &mut LaneF32,
    pixels: &[[LaneU16; 3]; 16],
    pre_weighted: &[[LaneF32; 3]; 16],
    params: &EtcParams,
) {
    let is_fake_bt709 = params.is_fake_bt709();
    let is_uniform = params.is_uniform();

    // Solve (x*H + y*V + O - C)^2 per channel, working with H' = (H-O)/4
    // and V' = (V-O)/4 to keep the system simple.
    let mut h = [LaneF32::zero(); 3];
    let mut v = [LaneF32::zero(); 3];
    let mut o = [LaneF32::zero(); 3];

    let mut total_error = LaneF32::zero();
    let mut best_coeffs = [[LaneU16::zero(); 3]; 3];

    for ch in 0..3 {
        let mut fhh = 0.0f32;
        let mut fho = 0.0f32;
        let mut fhv = 0.0f32;
        let mut foo = 0.0f32;
        let mut fov = 0.0f32;
        let mut fvv = 0.0f32;
        let mut fh = LaneF32::zero();
        let mut fv = LaneF32::zero();
        let mut fo = LaneF32::zero();

        for px in 0..16 {
            let x = (px % 4) as f32;
            let y = (px / 4) as f32;
            let c = if is_fake_bt709 {
                pre_weighted[px][ch]
            } else {
                pixels[px][ch].to_f32()
            };

            fhh += x * x;
            fhv += 2.0 * x * y;
            fho += 2.0 * x;
            foo += 1.0;
            fov += 2.0 * y;
            fvv += y * y;

            fh = fh - c * (2.0 * x);
            fv = fv - c * (2.0 * y);
            fo = fo - c * 2.0;
        }

        // Gaussian elimination over
        //   [2fhh  fho  fhv | -fh]
        //   [fhv   fov  2fvv| -fv]
        //   [fho   2foo fov | -fo]
        let d = 2.0 * fhh;
        let e = fho;
        let f = fhv;
        let g_d = fh;

        let i = fhv;
        let j = fov;
        let k = 2.0 * fvv;
        let l_d = fv;

        let m = fho;
        let n = 2.0 * foo;
        let p = fov;
        let q_d = fo;

        let r0to1 = -i / d;
        let r0to2 = -m / d;

        let j1 = j + r0to1 * e;
        let k1 = k + r0to1 * f;
        let l1_d = l_d + g_d * r0to1;

        let n1 = n + r0to2 * e;
        let p1 = p + r0to2 * f;
        let q1_d = q_d + g_d * r0to2;

        let r1to2 = -p1 / k1;

        let n2 = n1 + r1to2 * j1;
        let q2_d = q1_d + l1_d * r1to2;

        o[ch] = -q2_d / n2;

        let r2to1 = -j1 / n2;
        let l2_d = l1_d + q2_d * r2to1;

        let elim2 = -f / k1;
        let elim1 = -e / n2;

        let g2_d = g_d + l2_d * elim2 + q2_d * elim1;

        h[ch] = -g2_d / d;
        v[ch] = -l2_d / k1;

        h[ch] = h[ch] * 4.0 + o[ch];
        v[ch] = v[ch] * 4.0 + o[ch];
    }

    if is_fake_bt709 {
        let o_rgb = convert_from_fake_bt709(&o);
        let h_rgb = convert_from_fake_bt709(&h);
        let v_rgb = convert_from_fake_bt709(&v);

        for ch in 0..3 {
            let coeffs = [o_rgb[ch], h_rgb[ch], v_rgb[ch]];
            for (c, coeff) in coeffs.iter().enumerate() {
                let clamped = coeff.max(LaneF32::zero());
                let scaled = if ch == 1 {
                    (clamped * (127.0 / 255.0)).min(LaneF32::splat(127.0))
                } else {
                    (clamped * (63.0 / 255.0)).min(LaneF32::splat(63.0))
                };
                best_coeffs[ch][c] = scaled.round_to_u16(Rounding::Nearest);
            }
        }

        let mut reconstructed = [[LaneU16::zero(); 3]; 16];
        for ch in 0..3 {
            let d_o = decode_planar_coeff(best_coeffs[ch][0], ch);
            let d_h = decode_planar_coeff(best_coeffs[ch][1], ch);
            let d_v = decode_planar_coeff(best_coeffs[ch][2], ch);

            let h_minus_o = d_h.to_i16() - d_o.to_i16();
            let v_minus_o = d_v.to_i16() - d_o.to_i16();
            let addend = (d_o << 2).to_i16() + LaneI16::splat(2);

            for px in 0..16 {
                let x = LaneI16::splat((px % 4) as i16);
                let y = LaneI16::splat((px / 4) as i16);

                let interpolated =
                    (x.compact_mul(h_minus_o) + y.compact_mul(v_minus_o) + addend) >> 2;
                reconstructed[px][ch] = interpolated
                    .max(LaneI16::zero())
                    .to_u16()
                    .min(LaneU16::splat(255));
            }
        }

        total_error = LaneF32::zero();
        for px in 0..16 {
            total_error =
                total_error + compute_error_fake_bt709(&reconstructed[px], &pre_weighted[px]);
        }
    } else {
        for ch in 0..3 {
            let coeffs = [o[ch], h[ch], v[ch]];
            let mut coeff_ranges = [[LaneU16::zero(); 2]; 3];

            for (c, coeff) in coeffs.iter().enumerate() {
                let clamped = coeff.max(LaneF32::zero());
                let scaled = if ch == 1 {
                    (clamped * (127.0 / 255.0)).min(LaneF32::splat(127.0))
                } else {
                    (clamped * (63.0 / 255.0)).min(LaneF32::splat(63.0))
                };
                coeff_ranges[c][0] = scaled.round_to_u16(Rounding::Down);
                coeff_ranges[c][1] = scaled.round_to_u16(Rounding::Up);
            }

            let mut best_channel_error = LaneF32::splat(f32::MAX);
            for io in 0..2 {
                let d_o = decode_planar_coeff(coeff_ranges[0][io], ch);

                for ih in 0..2 {
                    let d_h = decode_planar_coeff(coeff_ranges[1][ih], ch);
                    let h_minus_o = d_h.to_i16() - d_o.to_i16();

                    for iv in 0..2 {
                        let d_v = decode_planar_coeff(coeff_ranges[2][iv], ch);
                        let v_minus_o = d_v.to_i16() - d_o.to_i16();

                        let addend = (d_o << 2).to_i16() + LaneI16::splat(2);

                        let mut error = LaneF32::zero();
                        for px in 0..16 {
                            let x = LaneI16::splat((px % 4) as i16);
                            let y = LaneI16::splat((px / 4) as i16);

                            let interpolated = (x.compact_mul(h_minus_o)
                                + y.compact_mul(v_minus_o)
                                + addend)
                                >> 2;
                            let decoded = interpolated
                                .max(LaneI16::zero())
                                .to_u16()
                                .min(LaneU16::splat(255));

                            let delta = (pixels[px][ch].to_i16() - decoded.to_i16()).to_f32();
                            error = error + delta * delta;
                        }

                        let better = error.lt(best_channel_error);
                        if better.any() {
                            best_channel_error = best_channel_error.min(error);
                            best_coeffs[ch][0].conditional_assign(better, coeff_ranges[0][io]);
                            best_coeffs[ch][1].conditional_assign(better, coeff_ranges[1][ih]);
                            best_coeffs[ch][2].conditional_assign(better, coeff_ranges[2][iv]);
                        }
                    }
                }
            }

            if !is_uniform {
                best_channel_error =
                    best_channel_error * (params.weights[ch] * params.weights[ch]);
            }

            total_error = total_error + best_channel_error;
        }
    }

    let better = total_error.lt(*best_error);
    if !better.any() {
        return;
    }
    *best_error = best_error.min(total_error);

    let mut blocks = [0u64; LANE_WIDTH];
    for lane in 0..LANE_WIDTH {
        if !better.lane(lane) {
            continue;
        }

        let ro = best_coeffs[0][0].lane(lane) as u64;
        let rh = best_coeffs[0][1].lane(lane) as u64;
        let rv = best_coeffs[0][2].lane(lane) as u64;

        let go = best_coeffs[1][0].lane(lane) as u64;
        let gh = best_coeffs[1][1].lane(lane) as u64;
        let gv = best_coeffs[1][2].lane(lane) as u64;

        let bo = best_coeffs[2][0].lane(lane) as u64;
        let bh = best_coeffs[2][1].lane(lane) as u64;
        let bv = best_coeffs[2][2].lane(lane) as u64;

        let go1 = go >> 6;
        let go2 = go & 63;

        let bo1 = bo >> 5;
        let bo2 = (bo >> 3) & 3;
        let bo3 = bo & 7;

        let rh1 = rh >> 1;
        let rh2 = rh & 1;

        let fake_r = ro >> 2;
        let fake_dr = go1 | ((ro & 3) << 1);

        let fake_g = go2 >> 2;
        let fake_dg = ((go2 & 3) << 1) | bo1;

        let fake_b = bo2;
        let fake_db = bo3 >> 1;

        let mut block = 0u64;

        // R and G stay in range; B overflows to signal planar mode.
        if (fake_dr & 4) != 0 && fake_r + fake_dr < 8 {
            block |= 1 << 63;
        }
        if (fake_dg & 4) != 0 && fake_g + fake_dg < 8 {
            block |= 1 << 55;
        }
        if fake_b + fake_db < 4 {
            block |= 1 << 42;
        } else {
            block |= 7 << 45;
        }

        block |= ro << 57;
        block |= go1 << 56;
        block |= go2 << 49;
        block |= bo1 << 48;
        block |= bo2 << 43;
        block |= bo3 << 39;
        block |= rh1 << 34;
        block |= 1 << 33;
        block |= rh2 << 32;

        block |= gh << 25;
        block |= bh << 19;
        block |= rv << 13;
        block |= gv << 6;
        block |= bv;

        blocks[lane] = block;
    }

    emit_blocks(outputs, better, &blocks);
}

#[allow(clippy::needless_range_loop)]
#[allow(clippy::too_many_arguments)]
fn compress_etc1_internal(
    best_total_error: &mut LaneF32,
    outputs: &mut [[u8; 8]; LANE_WIDTH],
    pixels: &[[LaneU16; 3]; 16],
    pre_weighted: &[[LaneF32; 3]; 16],
    drs: &mut DiffResolveStorage,
    params: &EtcParams,
    allow_individual: bool,
) {
    let is_fake_bt709 = params.is_fake_bt709();

    let mut best_colors = [LaneU16::zero(); 2];
    let mut best_selectors = [LaneU16::zero(); 2];
    let mut best_tables = [LaneU16::zero(); 2];
    let mut best_flip = LaneU16::zero();
    let mut best_d = LaneU16::zero();

    let mut best_is_this_mode = Mask::splat(false);

    let mut sector_pixels = [[[[LaneU16::zero(); 3]; 8]; 2]; 2];
    let mut sector_pre_weighted = [[[[LaneF32::zero(); 3]; 8]; 2]; 2];
    let mut sector_cumulative = [[[LaneU16::zero(); 3]; 2]; 2];

    for flip in 0..2 {
        for sector in 0..2 {
            for px in 0..8 {
                let src = FLIP_TABLES[flip][sector][px];
                for ch in 0..3 {
                    let value = pixels[src][ch];
                    sector_pixels[flip][sector][px][ch] = value;
                    sector_pre_weighted[flip][sector][px][ch] = pre_weighted[src][ch];
                    sector_cumulative[flip][sector][ch] =
                        sector_cumulative[flip][sector][ch] + value;
                }
            }
        }
    }

    for flip in 0..2 {
        drs.num_attempts = [LaneU16::zero(); 2];

        let mut best_ind_error = [LaneF32::splat(f32::MAX); 2];
        let mut best_ind_selectors = [LaneU16::zero(); 2];
        let mut best_ind_colors = [LaneU16::zero(); 2];
        let mut best_ind_table = [LaneU16::zero(); 2];

        for d in 0..2 {
            if d == 0 && !allow_individual {
                continue;
            }

            for sector in 0..2 {
                for table in 0..8usize {
                    let offsets = &ETC1_POTENTIAL_OFFSETS[table];

                    let mut possible_colors = [LaneU16::zero(); MAX_POTENTIAL_OFFSETS + 1];
                    let mut num_offsets = offsets.len;

                    for oi in 0..offsets.len {
                        let mut quantized = [LaneU16::zero(); 3];
                        let mut offset_cumulative = [LaneU16::zero(); 3];

                        for ch in 0..3 {
                            let cu = (sector_cumulative[flip][sector][ch].to_i16()
                                + LaneI16::splat(offsets.offsets[oi]))
                            .max(LaneI16::zero())
                            .to_u16()
                            .min(LaneU16::splat(2040));

                            if is_fake_bt709 {
                                offset_cumulative[ch] = cu;
                            } else if d == 1 {
                                quantized[ch] =
                                    ((cu << 5) - cu + (cu >> 3) + LaneU16::splat(1024)) >> 11;
                            } else {
                                quantized[ch] = ((cu << 5) - (cu << 1)
                                    + (cu >> 3)
                                    + LaneU16::splat(2048))
                                    >> 12;
                            }
                        }

                        if is_fake_bt709 {
                            resolve_half_block_fake_bt709(
                                &mut quantized,
                                &offset_cumulative,
                                d == 1,
                                params.flags.contains(Flags::ETC_FAKE_BT709_ACCURATE),
                            );
                        }

                        possible_colors[oi] =
                            quantized[0] | (quantized[1] << 5) | (quantized[2] << 10);
                    }

                    // For differential-only encodes the pair search must
                    // always find a legal combination; the sector average
                    // itself pairs legally with itself across sectors.
                    if d == 1 && !allow_individual {
                        let mut quantized = [LaneU16::zero(); 3];
                        let whole = [
                            sector_cumulative[flip][0][0] + sector_cumulative[flip][1][0],
                            sector_cumulative[flip][0][1] + sector_cumulative[flip][1][1],
                            sector_cumulative[flip][0][2] + sector_cumulative[flip][1][2],
                        ];
                        for ch in 0..3 {
                            let cu = (whole[ch] >> 1).min(LaneU16::splat(2040));
                            quantized[ch] =
                                ((cu << 5) - cu + (cu >> 3) + LaneU16::splat(1024)) >> 11;
                        }
                        possible_colors[num_offsets] =
                            quantized[0] | (quantized[1] << 5) | (quantized[2] << 10);
                        num_offsets += 1;
                    }

                    let mut num_unique = LaneU16::zero();
                    for lane in 0..LANE_WIDTH {
                        let mut lane_unique = 1usize;
                        for i in 1..num_offsets {
                            let color = possible_colors[i].lane(lane);
                            if color != possible_colors[lane_unique - 1].lane(lane) {
                                possible_colors[lane_unique].set_lane(lane, color);
                                lane_unique += 1;
                            }
                        }
                        num_unique.set_lane(lane, lane_unique as u16);
                    }

                    let mut max_unique = 0usize;
                    for lane in 0..LANE_WIDTH {
                        max_unique = max_unique.max(num_unique.lane(lane) as usize);
                    }

                    for lane in 0..LANE_WIDTH {
                        let fill = possible_colors[0].lane(lane);
                        for i in num_unique.lane(lane) as usize..max_unique {
                            possible_colors[i].set_lane(lane, fill);
                        }
                    }

                    for i in 0..max_unique {
                        let quantized = possible_colors[i];
                        let (error, selectors) = test_half_block(
                            quantized,
                            &sector_pixels[flip][sector],
                            &sector_pre_weighted[flip][sector],
                            &ETC1_MODIFIER_TABLES[table],
                            d == 1,
                            params,
                        );

                        if d == 0 {
                            let better = error.lt(best_ind_error[sector]);
                            if better.any() {
                                best_ind_error[sector] = best_ind_error[sector].min(error);
                                best_ind_selectors[sector].conditional_assign(better, selectors);
                                best_ind_colors[sector].conditional_assign(better, quantized);
                                best_ind_table[sector]
                                    .conditional_assign(better, LaneU16::splat(table as u16));
                            }
                        } else {
                            let in_bounds = LaneU16::splat(i as u16).lt(num_unique);

                            let storage_indexes = drs.num_attempts[sector];
                            drs.num_attempts[sector] = drs.num_attempts[sector]
                                + LaneU16::select_or_zero(in_bounds, LaneU16::splat(1));

                            for lane in 0..LANE_WIDTH {
                                let slot = storage_indexes.lane(lane) as usize;
                                drs.errors[sector][slot].set_lane(lane, error.lane(lane));
                                drs.selectors[sector][slot].set_lane(lane, selectors.lane(lane));
                                drs.colors[sector][slot].set_lane(lane, quantized.lane(lane));
                                drs.tables[sector][slot].set_lane(lane, table as u16);
                            }
                        }
                    }
                }
            }

            if d == 0 {
                let total = best_ind_error[0] + best_ind_error[1];
                let better = total.lt(*best_total_error);
                if better.any() {
                    best_is_this_mode = best_is_this_mode | better;

                    *best_total_error = best_total_error.min(total);
                    best_flip.conditional_assign(better, LaneU16::splat(flip as u16));
                    best_d.conditional_assign(better, LaneU16::splat(d as u16));
                    for sector in 0..2 {
                        best_colors[sector].conditional_assign(better, best_ind_colors[sector]);
                        best_selectors[sector]
                            .conditional_assign(better, best_ind_selectors[sector]);
                        best_tables[sector].conditional_assign(better, best_ind_table[sector]);
                    }
                }
            } else {
                // Legality constrains the two sector colors jointly, with
                // heavy early outs; this search runs scalar per lane.
                for lane in 0..LANE_WIDTH {
                    let mut lane_best_total = best_total_error.lane(lane);
                    let mut best_diff_errors = [f32::MAX; 2];
                    let mut best_diff_selectors = [0u16; 2];
                    let mut best_diff_colors = [0u16; 2];
                    let mut best_diff_tables = [0u16; 2];

                    for sector in 0..2 {
                        let attempts = drs.num_attempts[sector].lane(lane) as usize;
                        for i in 0..attempts {
                            let error = drs.errors[sector][i].lane(lane);
                            if error < best_diff_errors[sector] {
                                best_diff_errors[sector] = error;
                                best_diff_selectors[sector] = drs.selectors[sector][i].lane(lane);
                                best_diff_colors[sector] = drs.colors[sector][i].lane(lane);
                                best_diff_tables[sector] = drs.tables[sector][i].lane(lane);
                            }
                        }
                    }

                    if best_diff_errors[0] + best_diff_errors[1] >= lane_best_total {
                        continue;
                    }

                    if etc_differential_is_legal_scalar(best_diff_colors[0], best_diff_colors[1]) {
                        best_is_this_mode.set_lane(lane, true);
                        best_total_error
                            .set_lane(lane, best_diff_errors[0] + best_diff_errors[1]);
                        best_flip.set_lane(lane, flip as u16);
                        best_d.set_lane(lane, d as u16);
                        for sector in 0..2 {
                            best_colors[sector].set_lane(lane, best_diff_colors[sector]);
                            best_selectors[sector].set_lane(lane, best_diff_selectors[sector]);
                            best_tables[sector].set_lane(lane, best_diff_tables[sector]);
                        }
                        continue;
                    }

                    // Sort both sectors' candidates by error and scan pairs
                    // until the first legal combination.
                    let mut num_sort = [0usize; 2];
                    for sector in 0..2 {
                        let attempts = drs.num_attempts[sector].lane(lane) as usize;
                        let mut count = 0usize;
                        for i in 0..attempts {
                            if drs.errors[sector][i].lane(lane) < lane_best_total {
                                drs.sort_indexes[sector][count] = i as u16;
                                count += 1;
                            }
                        }
                        num_sort[sector] = count;

                        let errors = &drs.errors[sector];
                        drs.sort_indexes[sector][..count].sort_unstable_by(|&a, &b| {
                            let ea = errors[a as usize].lane(lane);
                            let eb = errors[b as usize].lane(lane);
                            ea.partial_cmp(&eb).unwrap().then(a.cmp(&b))
                        });
                    }

                    'outer: for i in 0..num_sort[0] {
                        let attempt0 = drs.sort_indexes[0][i] as usize;
                        let error0 = drs.errors[0][attempt0].lane(lane);

                        if error0 >= lane_best_total {
                            break;
                        }

                        let max_error1 = lane_best_total - error0;
                        let color0 = drs.colors[0][attempt0].lane(lane);

                        if max_error1 < best_diff_errors[1] {
                            break;
                        }

                        for j in 0..num_sort[1] {
                            let attempt1 = drs.sort_indexes[1][j] as usize;
                            let error1 = drs.errors[1][attempt1].lane(lane);

                            if error1 >= max_error1 {
                                break;
                            }

                            let color1 = drs.colors[1][attempt1].lane(lane);

                            if etc_differential_is_legal_scalar(color0, color1) {
                                lane_best_total = error0 + error1;

                                best_is_this_mode.set_lane(lane, true);
                                best_total_error.set_lane(lane, lane_best_total);
                                best_flip.set_lane(lane, flip as u16);
                                best_d.set_lane(lane, d as u16);
                                best_colors[0].set_lane(lane, color0);
                                best_colors[1].set_lane(lane, color1);
                                best_selectors[0]
                                    .set_lane(lane, drs.selectors[0][attempt0].lane(lane));
                                best_selectors[1]
                                    .set_lane(lane, drs.selectors[1][attempt1].lane(lane));
                                best_tables[0]
                                    .set_lane(lane, drs.tables[0][attempt0].lane(lane));
                                best_tables[1]
                                    .set_lane(lane, drs.tables[1][attempt1].lane(lane));
                                continue 'outer;
                            }
                        }
                    }
                }
            }
        }
    }

    let mut blocks = [0u64; LANE_WIDTH];
    for lane in 0..LANE_WIDTH {
        if !best_is_this_mode.lane(lane) {
            continue;
        }

        let flip = best_flip.lane(lane) as usize;
        let d = best_d.lane(lane) as u64;

        let mut colors = [[0u64; 3]; 2];
        for sector in 0..2 {
            let packed = best_colors[sector].lane(lane);
            for ch in 0..3 {
                colors[sector][ch] = ((packed >> (ch * 5)) & 31) as u64;
            }
        }

        let mut block = 0u64;
        if d == 0 {
            // Individual mode carries 4 bit colors.
            block |= colors[0][0] << 60;
            block |= colors[1][0] << 56;
            block |= colors[0][1] << 52;
            block |= colors[1][1] << 48;
            block |= colors[0][2] << 44;
            block |= colors[1][2] << 40;
        } else {
            block |= colors[0][0] << 59;
            block |= ((colors[1][0].wrapping_sub(colors[0][0])) & 7) << 56;
            block |= colors[0][1] << 51;
            block |= ((colors[1][1].wrapping_sub(colors[0][1])) & 7) << 48;
            block |= colors[0][2] << 43;
            block |= ((colors[1][2].wrapping_sub(colors[0][2])) & 7) << 40;
        }
        block |= (best_tables[0].lane(lane) as u64) << 37;
        block |= (best_tables[1].lane(lane) as u64) << 34;
        block |= d << 33;
        block |= (flip as u64) << 32;

        let mut unpacked_codes = [0u16; 16];
        for sector in 0..2 {
            let sector_selectors = best_selectors[sector].lane(lane);
            for px in 0..8 {
                let selector = (sector_selectors >> (2 * px)) & 3;
                unpacked_codes[FLIP_TABLES[flip][sector][px]] =
                    MODIFIER_CODES[selector as usize];
            }
        }

        for sb in 0..2u64 {
            for px in 0..16 {
                let bit = ((unpacked_codes[SELECTOR_ORDER[px]] >> sb) & 1) as u64;
                block |= bit << (px as u64 + sb * 16);
            }
        }

        blocks[lane] = block;
    }

    emit_blocks(outputs, best_is_this_mode, &blocks);
}

/// Encode a batch of blocks to ETC1.
pub fn encode_etc1(
    outputs: &mut [[u8; 8]; LANE_WIDTH],
    inputs: &[PixelBlockU8; LANE_WIDTH],
    options: &Options,
    scratch: &mut Etc1Scratch,
) {
    let params = EtcParams::from_options(options);
    let (pixels, pre_weighted) = extract_blocks(inputs, &params);

    let mut best_error = LaneF32::splat(f32::MAX);
    compress_etc1_internal(
        &mut best_error,
        outputs,
        &pixels,
        &pre_weighted,
        &mut scratch.drs,
        &params,
        true,
    );
}

/// Encode a batch of blocks to ETC2 (RGB, no alpha).
pub fn encode_etc2(
    outputs: &mut [[u8; 8]; LANE_WIDTH],
    inputs: &[PixelBlockU8; LANE_WIDTH],
    options: &Options,
    scratch: &mut Etc2Scratch,
) {
    let params = EtcParams::from_options(options);
    let (pixels, pre_weighted) = extract_blocks(inputs, &params);

    let mut best_error = LaneF32::splat(f32::MAX);

    encode_planar(outputs, &mut best_error, &pixels, &pre_weighted, &params);

    let mut sector_assignments = chroma_sector_assignments(&pixels);

    encode_t_mode(
        outputs,
        &mut best_error,
        &sector_assignments,
        &pixels,
        &pre_weighted,
        &params,
    );

    for assignment in sector_assignments.iter_mut() {
        *assignment = !*assignment;
    }

    encode_t_mode(
        outputs,
        &mut best_error,
        &sector_assignments,
        &pixels,
        &pre_weighted,
        &params,
    );

    encode_h_mode(
        outputs,
        &mut best_error,
        &sector_assignments,
        &pixels,
        &mut scratch.h,
        &pre_weighted,
        &params,
    );

    compress_etc1_internal(
        &mut best_error,
        outputs,
        &pixels,
        &pre_weighted,
        &mut scratch.drs,
        &params,
        true,
    );
}

/// Score one half block in punch-through mode: transparent pixels take the
/// dedicated selector, opaque ones choose between base, +modifier and
/// -modifier.
fn test_half_block_punchthrough(
    quantized_packed_color: LaneU16,
    pixels: &[[LaneU16; 3]; 8],
    pre_weighted: &[[LaneF32; 3]; 8],
    transparent: &[Mask; 8],
    modifier: i16,
    params: &EtcParams,
) -> (LaneF32, LaneU16) {
    let mut unquantized = [LaneU16::zero(); 3];
    for ch in 0..3 {
        let quantized = (quantized_packed_color >> (ch as u32 * 5)) & LaneU16::splat(31);
        unquantized[ch] = (quantized << 3) | (quantized >> 2);
    }

    // Wire codes when the opaque bit is clear: 0 keeps the base color,
    // 1 adds the modifier, 2 is transparent, 3 subtracts the modifier.
    let wire_modifiers = [(0u16, 0i16), (1, modifier), (3, -modifier)];

    let mut selectors = LaneU16::zero();
    let mut total_error = LaneF32::zero();

    for px in 0..8 {
        let mut best_error = LaneF32::splat(f32::MAX);
        let mut best_code = LaneU16::zero();

        for (code, mod_value) in wire_modifiers {
            let mut candidate = [LaneU16::zero(); 3];
            for ch in 0..3 {
                let value = unquantized[ch].to_i16() + LaneI16::splat(mod_value);
                candidate[ch] = value.max(LaneI16::zero()).to_u16().min(LaneU16::splat(255));
            }

            let error = pixel_error(&candidate, &pixels[px], &pre_weighted[px], params);
            let better = error.lt(best_error);
            best_code.conditional_assign(better, LaneU16::splat(code));
            best_error = best_error.min(error);
        }

        // Transparent pixels cost nothing in color and must use code 2.
        best_code.conditional_assign(transparent[px], LaneU16::splat(2));
        best_error.conditional_assign(transparent[px], LaneF32::zero());

        total_error = total_error + best_error;
        selectors = selectors | (best_code << (px as u32 * 2));
    }

    (total_error, selectors)
}

/// Encode a batch of blocks to ETC2 with punch-through alpha.
///
/// Pixels with alpha below 128 become transparent. Blocks with no
/// transparent pixels encode as ordinary opaque differential blocks.
pub fn encode_etc2_punchthrough(
    outputs: &mut [[u8; 8]; LANE_WIDTH],
    inputs: &[PixelBlockU8; LANE_WIDTH],
    options: &Options,
    scratch: &mut Etc1Scratch,
) {
    let params = EtcParams::from_options(options);
    let (pixels, pre_weighted) = extract_blocks(inputs, &params);

    let mut transparent = [Mask::splat(false); 16];
    let mut has_transparent = Mask::splat(false);
    for px in 0..16 {
        let mut alpha = LaneU16::zero();
        for (lane, input) in inputs.iter().enumerate() {
            alpha.set_lane(lane, input.pixels[px][3] as u16);
        }
        transparent[px] = alpha.lt(LaneU16::splat(128));
        has_transparent = has_transparent | transparent[px];
    }

    // Opaque result: a differential-only search packed with the opaque bit
    // set, which is exactly the punch-through wire format for opaque
    // blocks.
    let mut opaque_blocks = *outputs;
    let mut opaque_error = LaneF32::splat(f32::MAX);
    compress_etc1_internal(
        &mut opaque_error,
        &mut opaque_blocks,
        &pixels,
        &pre_weighted,
        &mut scratch.drs,
        &params,
        false,
    );

    // Transparent result: per sector candidate search with the three
    // opaque-bit-clear modifiers and forced transparent selectors.
    let mut punch_blocks = [[0u8; 8]; LANE_WIDTH];
    encode_punchthrough_differential(
        &mut punch_blocks,
        &pixels,
        &pre_weighted,
        &transparent,
        &params,
    );

    for lane in 0..LANE_WIDTH {
        outputs[lane] = if has_transparent.lane(lane) {
            punch_blocks[lane]
        } else {
            opaque_blocks[lane]
        };
    }
}

#[allow(clippy::needless_range_loop)]
fn encode_punchthrough_differential(
    outputs: &mut [[u8; 8]; LANE_WIDTH],
    pixels: &[[LaneU16; 3]; 16],
    pre_weighted: &[[LaneF32; 3]; 16],
    transparent: &[Mask; 16],
    params: &EtcParams,
) {
    let mut best_error = LaneF32::splat(f32::MAX);
    let mut best_colors = [LaneU16::zero(); 2];
    let mut best_selectors = [LaneU16::zero(); 2];
    let mut best_tables = [LaneU16::zero(); 2];
    let mut best_flip = LaneU16::zero();
    let mut committed = Mask::splat(false);

    for flip in 0..2 {
        let mut sector_pixels = [[[LaneU16::zero(); 3]; 8]; 2];
        let mut sector_pre_weighted = [[[LaneF32::zero(); 3]; 8]; 2];
        let mut sector_transparent = [[Mask::splat(false); 8]; 2];
        let mut opaque_totals = [[LaneU16::zero(); 3]; 2];
        let mut opaque_counts = [LaneU16::zero(); 2];

        for sector in 0..2 {
            for px in 0..8 {
                let src = FLIP_TABLES[flip][sector][px];
                for ch in 0..3 {
                    sector_pixels[sector][px][ch] = pixels[src][ch];
                    sector_pre_weighted[sector][px][ch] = pre_weighted[src][ch];
                    opaque_totals[sector][ch] = opaque_totals[sector][ch]
                        + LaneU16::select_or_zero(!transparent[src], pixels[src][ch]);
                }
                sector_transparent[sector][px] = transparent[src];
                opaque_counts[sector] = opaque_counts[sector]
                    + LaneU16::select_or_zero(!transparent[src], LaneU16::splat(1));
            }
        }

        // Candidate attempts per sector and table, searched for the best
        // legal pair afterwards like the opaque differential mode.
        const MAX_PT_ATTEMPTS: usize = 8 * 20;
        let mut attempt_errors = [[LaneF32::zero(); MAX_PT_ATTEMPTS]; 2];
        let mut attempt_selectors = [[LaneU16::zero(); MAX_PT_ATTEMPTS]; 2];
        let mut attempt_colors = [[LaneU16::zero(); MAX_PT_ATTEMPTS]; 2];
        let mut attempt_tables = [[LaneU16::zero(); MAX_PT_ATTEMPTS]; 2];
        let mut attempt_counts = [0usize; 2];

        for sector in 0..2 {
            for table in 0..8usize {
                let modifier = ETC1_MODIFIER_TABLES[table][3];

                // Candidate base colors around the opaque average, shifted
                // by whole modifier steps; lanes with no opaque pixels fall
                // back to zero.
                let mut candidates = [LaneU16::zero(); 19];
                let mut candidate_counts = [0usize; LANE_WIDTH];
                for lane in 0..LANE_WIDTH {
                    let count = opaque_counts[sector].lane(lane) as i32;
                    let mut lane_candidates = [0u16; 19];
                    let mut n = 0usize;

                    let premultiplier_limit = count.min(8);
                    for premultiplier in -premultiplier_limit..=premultiplier_limit {
                        let mut quantized = [0i32; 3];
                        for ch in 0..3 {
                            let total = opaque_totals[sector][ch].lane(lane) as i32;
                            quantized[ch] = if count == 0 {
                                0
                            } else {
                                (((total + modifier as i32 * premultiplier) * 62 + count * 255)
                                    / (count * 510))
                                    .clamp(0, 31)
                            };
                        }
                        let packed =
                            (quantized[0] | (quantized[1] << 5) | (quantized[2] << 10)) as u16;
                        if n == 0 || lane_candidates[n - 1] != packed {
                            lane_candidates[n] = packed;
                            n += 1;
                        }
                    }
                    if n == 0 {
                        lane_candidates[0] = 0;
                        n = 1;
                    }

                    candidate_counts[lane] = n;
                    for i in 0..n {
                        candidates[i].set_lane(lane, lane_candidates[i]);
                    }
                }

                let max_candidates = candidate_counts.iter().copied().max().unwrap();
                for lane in 0..LANE_WIDTH {
                    let fill = candidates[0].lane(lane);
                    for i in candidate_counts[lane]..max_candidates {
                        candidates[i].set_lane(lane, fill);
                    }
                }

                for i in 0..max_candidates {
                    let (error, selectors) = test_half_block_punchthrough(
                        candidates[i],
                        &sector_pixels[sector],
                        &sector_pre_weighted[sector],
                        &sector_transparent[sector],
                        modifier,
                        params,
                    );

                    let slot = attempt_counts[sector];
                    attempt_errors[sector][slot] = error;
                    attempt_selectors[sector][slot] = selectors;
                    attempt_colors[sector][slot] = candidates[i];
                    attempt_tables[sector][slot] = LaneU16::splat(table as u16);
                    attempt_counts[sector] += 1;
                }
            }
        }

        // A shared candidate guarantees the pair search always succeeds:
        // the whole block's opaque average paired with itself has zero
        // channel deltas.
        {
            let whole_totals = [
                opaque_totals[0][0] + opaque_totals[1][0],
                opaque_totals[0][1] + opaque_totals[1][1],
                opaque_totals[0][2] + opaque_totals[1][2],
            ];
            let whole_count = opaque_counts[0] + opaque_counts[1];

            let mut shared = LaneU16::zero();
            for lane in 0..LANE_WIDTH {
                let count = whole_count.lane(lane) as i32;
                let mut packed = 0u16;
                for ch in 0..3 {
                    let total = whole_totals[ch].lane(lane) as i32;
                    let q = if count == 0 {
                        0
                    } else {
                        ((total * 62 + count * 255) / (count * 510)).clamp(0, 31)
                    };
                    packed |= (q as u16) << (ch * 5);
                }
                shared.set_lane(lane, packed);
            }

            for sector in 0..2 {
                let (error, selectors) = test_half_block_punchthrough(
                    shared,
                    &sector_pixels[sector],
                    &sector_pre_weighted[sector],
                    &sector_transparent[sector],
                    ETC1_MODIFIER_TABLES[0][3],
                    params,
                );

                let slot = attempt_counts[sector];
                attempt_errors[sector][slot] = error;
                attempt_selectors[sector][slot] = selectors;
                attempt_colors[sector][slot] = shared;
                attempt_tables[sector][slot] = LaneU16::zero();
                attempt_counts[sector] += 1;
            }
        }

        // Legal pair search, scalar per lane.
        for lane in 0..LANE_WIDTH {
            let mut lane_best = best_error.lane(lane);

            for i in 0..attempt_counts[0] {
                let error0 = attempt_errors[0][i].lane(lane);
                if error0 >= lane_best {
                    continue;
                }
                let color0 = attempt_colors[0][i].lane(lane);

                for j in 0..attempt_counts[1] {
                    let error1 = attempt_errors[1][j].lane(lane);
                    if error0 + error1 >= lane_best {
                        continue;
                    }
                    let color1 = attempt_colors[1][j].lane(lane);

                    if etc_differential_is_legal_scalar(color0, color1) {
                        lane_best = error0 + error1;
                        best_error.set_lane(lane, lane_best);
                        best_flip.set_lane(lane, flip as u16);
                        best_colors[0].set_lane(lane, color0);
                        best_colors[1].set_lane(lane, color1);
                        best_selectors[0].set_lane(lane, attempt_selectors[0][i].lane(lane));
                        best_selectors[1].set_lane(lane, attempt_selectors[1][j].lane(lane));
                        best_tables[0].set_lane(lane, attempt_tables[0][i].lane(lane));
                        best_tables[1].set_lane(lane, attempt_tables[1][j].lane(lane));
                        committed.set_lane(lane, true);
                    }
                }
            }
        }
    }

    debug_assert!(committed.all(), "shared average candidate always pairs legally");

    let mut blocks = [0u64; LANE_WIDTH];
    for lane in 0..LANE_WIDTH {
        let flip = best_flip.lane(lane) as usize;

        let mut colors = [[0u64; 3]; 2];
        for sector in 0..2 {
            let packed = best_colors[sector].lane(lane);
            for ch in 0..3 {
                colors[sector][ch] = ((packed >> (ch * 5)) & 31) as u64;
            }
        }

        let mut block = 0u64;
        block |= colors[0][0] << 59;
        block |= ((colors[1][0].wrapping_sub(colors[0][0])) & 7) << 56;
        block |= colors[0][1] << 51;
        block |= ((colors[1][1].wrapping_sub(colors[0][1])) & 7) << 48;
        block |= colors[0][2] << 43;
        block |= ((colors[1][2].wrapping_sub(colors[0][2])) & 7) << 40;
        block |= (best_tables[0].lane(lane) as u64) << 37;
        block |= (best_tables[1].lane(lane) as u64) << 34;
        // Bit 33 is the opaque flag and stays clear.
        block |= (flip as u64) << 32;

        let mut wire_codes = [0u16; 16];
        for sector in 0..2 {
            let selectors = best_selectors[sector].lane(lane);
            for px in 0..8 {
                wire_codes[FLIP_TABLES[flip][sector][px]] = (selectors >> (2 * px)) & 3;
            }
        }

        for sb in 0..2u64 {
            for px in 0..16 {
                let bit = ((wire_codes[SELECTOR_ORDER[px]] >> sb) & 1) as u64;
                block |= bit << (px as u64 + sb * 16);
            }
        }

        blocks[lane] = block;
    }

    emit_blocks(outputs, Mask::splat(true), &blocks);
}

fn quantize_eac(
    table_index: usize,
    value: LaneI16,
    base_value: LaneI16,
    multiplier: LaneU16,
    value_scale: i16,
) -> (LaneU16, LaneI16) {
    let offset = value - base_value;
    let offset_times_2 = offset + offset;

    // Every modifier table reflects about -0.5, so quantization happens on
    // the positive side and mirrors back by sign.
    let scaled_multiplier = multiplier.compact_mul(LaneU16::splat(value_scale as u16));
    let offset_about_reflector_times_2 = offset_times_2 + scaled_multiplier.to_i16();

    let abs_offset = offset_about_reflector_times_2.abs().to_u16();
    let lookup_numerator = abs_offset >> 1;

    let mut positive_index = LaneU16::zero();
    let mut positive_offset = LaneU16::zero();
    for lane in 0..LANE_WIDTH {
        let mut lookup = lookup_numerator.lane(lane) as usize
            / (scaled_multiplier.lane(lane) as usize).max(1);
        if lookup >= EAC_ROUNDING_TABLE_WIDTH {
            lookup = EAC_ROUNDING_TABLE_WIDTH - 1;
        }
        let index = EAC_ROUNDING_TABLES[table_index][lookup];
        positive_index.set_lane(lane, index as u16);
        positive_offset
            .set_lane(lane, EAC_MODIFIER_TABLE_POSITIVE[table_index][index as usize] as u16);
    }

    let sign_bits = offset_about_reflector_times_2 >> 15;
    let offset_unmultiplied = positive_offset.to_i16() ^ sign_bits;
    let quantized_offset = offset_unmultiplied.compact_mul(scaled_multiplier.to_i16());

    let offset_value = base_value + quantized_offset;

    let index_sub = sign_bits.cast_u16() & LaneU16::splat(4);
    let indexes = positive_index + LaneU16::splat(4) - index_sub;

    (indexes, offset_value)
}

/// Encode a batch of 8 bit alpha blocks to EAC.
pub fn encode_eac_alpha(
    outputs: &mut [[u8; 8]; LANE_WIDTH],
    inputs: &[PixelBlockU8; LANE_WIDTH],
    _options: &Options,
) {
    let mut pixels = [LaneU16::zero(); 16];
    for px in 0..16 {
        for (lane, input) in inputs.iter().enumerate() {
            pixels[px].set_lane(lane, input.pixels[px][3] as u16);
        }
    }

    encode_eac_block(outputs, &pixels, 1, false);
}

/// Encode a batch of single channel blocks to EAC R11.
pub fn encode_eac_r11(
    outputs: &mut [[u8; 8]; LANE_WIDTH],
    inputs: &[PixelBlockScalarS16; LANE_WIDTH],
    is_signed: bool,
) {
    let (lo, hi) = if is_signed { (-1023, 1023) } else { (0, 2047) };

    let mut pixels = [LaneU16::zero(); 16];
    for px in 0..16 {
        for (lane, input) in inputs.iter().enumerate() {
            let clamped = input.values[px].clamp(lo, hi);
            // Bias signed values into unsigned space for the scan.
            let biased = if is_signed { clamped + 1023 } else { clamped };
            pixels[px].set_lane(lane, biased as u16);
        }
    }

    encode_eac_block(outputs, &pixels, 8, is_signed);
}

#[allow(clippy::needless_range_loop)]
fn encode_eac_block(
    outputs: &mut [[u8; 8]; LANE_WIDTH],
    pixels: &[LaneU16; 16],
    value_scale: i16,
    is_signed: bool,
) {
    let mut min_value = LaneU16::splat(u16::MAX);
    let mut max_value = LaneU16::zero();
    for px in 0..16 {
        min_value = min_value.min(pixels[px]);
        max_value = max_value.max(pixels[px]);
    }

    let span = max_value - min_value;
    let span_midpoint_times_2 = max_value + min_value;

    let mut best_total_error = LaneU32::splat(u32::MAX);
    let mut best_table_index = LaneU16::zero();
    let mut best_base_codeword = LaneU16::zero();
    let mut best_multiplier = LaneU16::zero();
    let mut best_indexes = [LaneU16::zero(); 16];

    let num_ranges = 10;
    for table_index in 0..16usize {
        for r in 0..num_ranges {
            let subrange = r % 3;
            let main_range = r / 3;

            let positives = &EAC_MODIFIER_TABLE_POSITIVE[table_index];
            let max_offset = positives[3 - main_range - (subrange & 1)];
            let min_offset = -positives[3 - main_range - ((subrange >> 1) & 1)] - 1;
            let offset_span = (max_offset - min_offset) as u16;

            let mut min_multiplier = LaneU16::zero();
            for lane in 0..LANE_WIDTH {
                let lane_span = span.lane(lane);
                min_multiplier.set_lane(lane, lane_span / (offset_span * value_scale as u16));
            }

            // Both tried multipliers must stay in 1..=15.
            min_multiplier = min_multiplier
                .min(LaneU16::splat(14))
                .max(LaneU16::splat(1));

            for multiplier_offset in 0..2u16 {
                let multiplier = min_multiplier + LaneU16::splat(multiplier_offset);
                let scale = value_scale as i32;
                let value_limit: i32 = if value_scale == 1 { 255 } else { 2047 };

                // base = (minValue + maxValue - m*(maxOffset + minOffset)) / 2
                let mut base_value = LaneI16::zero();
                for lane in 0..LANE_WIDTH {
                    let m = multiplier.lane(lane) as i32 * scale;
                    let unclamped_times_2 = span_midpoint_times_2.lane(lane) as i32
                        - max_offset as i32 * m
                        - min_offset as i32 * m;
                    let clamped_times_2 = unclamped_times_2.clamp(0, 2 * value_limit);
                    base_value.set_lane(lane, ((clamped_times_2 + 1) / 2) as i16);
                }

                // Snap the base to what the codeword can represent.
                let mut base_codeword = LaneU16::zero();
                for lane in 0..LANE_WIDTH {
                    let base = base_value.lane(lane) as i32;
                    let cw = if value_scale == 1 {
                        base.clamp(0, 255)
                    } else if is_signed {
                        (((base - 1023) as f32 / 8.0).round() as i32).clamp(-127, 127)
                    } else {
                        (((base - 4) as f32 / 8.0).round() as i32).clamp(0, 255)
                    };
                    base_codeword.set_lane(lane, (cw & 0xff) as u16);

                    let decoded_base = if value_scale == 1 {
                        cw
                    } else if is_signed {
                        cw * 8 + 1023
                    } else {
                        cw * 8 + 4
                    };
                    base_value.set_lane(lane, decoded_base as i16);
                }

                let mut indexes = [LaneU16::zero(); 16];
                let mut total_error = LaneU32::zero();
                for px in 0..16 {
                    let (px_indexes, quantized) = quantize_eac(
                        table_index,
                        pixels[px].to_i16(),
                        base_value,
                        multiplier,
                        value_scale,
                    );
                    indexes[px] = px_indexes;

                    let clamp_hi = if value_scale == 1 { 255 } else { 2047 };
                    let clamped = quantized
                        .max(LaneI16::zero())
                        .to_u16()
                        .min(LaneU16::splat(clamp_hi));

                    for lane in 0..LANE_WIDTH {
                        let diff =
                            clamped.lane(lane) as i32 - pixels[px].lane(lane) as i32;
                        total_error.set_lane(
                            lane,
                            total_error.lane(lane) + (diff * diff) as u32,
                        );
                    }
                }

                let better = total_error.lt(best_total_error);
                if better.any() {
                    best_total_error = LaneU32::select(better, total_error, best_total_error);
                    best_table_index
                        .conditional_assign(better, LaneU16::splat(table_index as u16));
                    best_base_codeword.conditional_assign(better, base_codeword);
                    best_multiplier.conditional_assign(better, multiplier);
                    for px in 0..16 {
                        best_indexes[px].conditional_assign(better, indexes[px]);
                    }
                }
            }
        }
    }

    for lane in 0..LANE_WIDTH {
        let output = &mut outputs[lane];
        output[0] = best_base_codeword.lane(lane) as u8;
        output[1] =
            ((best_multiplier.lane(lane) << 4) | best_table_index.lane(lane)) as u8;

        let mut wire_indexes = [0u16; 16];
        for px in 0..16 {
            wire_indexes[SELECTOR_ORDER[px]] = best_indexes[px].lane(lane);
        }

        let mut offset = 2;
        let mut bits = 0u32;
        let mut num_bits = 0;
        for index in wire_indexes {
            bits = (bits << 3) | index as u32;
            num_bits += 3;

            if num_bits >= 8 {
                output[offset] = (bits >> (num_bits - 8)) as u8;
                offset += 1;
                num_bits -= 8;
                bits &= (1 << num_bits) - 1;
            }
        }

        debug_assert!(offset == 8 && num_bits == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks_from(pixels: [[u8; 4]; 16]) -> [PixelBlockU8; LANE_WIDTH] {
        [PixelBlockU8 { pixels }; LANE_WIDTH]
    }

    fn decode_etc2(block: &[u8; 8]) -> [[u8; 4]; 16] {
        let mut out = [[0u8; 4]; 16];
        blockdec::etc2_rgb(block, &mut out);
        out
    }

    #[test]
    fn solid_color_is_near_exact() {
        let color = [80u8, 160, 240, 255];
        let inputs = blocks_from([color; 16]);

        let mut scratch = Etc2Scratch::new();
        let mut outputs = [[0u8; 8]; LANE_WIDTH];
        encode_etc2(&mut outputs, &inputs, &Options::default(), &mut scratch);

        for block in &outputs {
            let decoded = decode_etc2(block);
            for px in decoded {
                for ch in 0..3 {
                    let d = (px[ch] as i32 - color[ch] as i32).abs();
                    assert!(d <= 4, "channel {ch} off by {d}");
                }
            }
        }
    }

    #[test]
    fn sharp_chroma_split_stays_sharp() {
        let mut pixels = [[0u8; 4]; 16];
        for (px, pixel) in pixels.iter_mut().enumerate() {
            *pixel = if px % 4 < 2 {
                [255, 0, 0, 255]
            } else {
                [0, 255, 0, 255]
            };
        }
        let inputs = blocks_from(pixels);

        let mut scratch = Etc2Scratch::new();
        let mut outputs = [[0u8; 8]; LANE_WIDTH];
        encode_etc2(&mut outputs, &inputs, &Options::default(), &mut scratch);

        for block in &outputs {
            let decoded = decode_etc2(block);
            for (px, pixel) in decoded.iter().enumerate() {
                for ch in 0..3 {
                    let d = (pixel[ch] as i32 - pixels[px][ch] as i32).abs();
                    assert!(d <= 8, "pixel {px} channel {ch} off by {d}");
                }
            }
        }
    }

    #[test]
    fn etc1_gradient_decodes_reasonably() {
        let mut pixels = [[0u8; 4]; 16];
        for (px, pixel) in pixels.iter_mut().enumerate() {
            let v = (px * 12 + 40) as u8;
            *pixel = [v, v, v, 255];
        }
        let inputs = blocks_from(pixels);

        let mut scratch = Etc1Scratch::new();
        let mut outputs = [[0u8; 8]; LANE_WIDTH];
        encode_etc1(&mut outputs, &inputs, &Options::default(), &mut scratch);

        for block in &outputs {
            let decoded = decode_etc2(block);
            for (px, pixel) in decoded.iter().enumerate() {
                for ch in 0..3 {
                    let d = (pixel[ch] as i32 - pixels[px][ch] as i32).abs();
                    assert!(d <= 32, "pixel {px} channel {ch} off by {d}");
                }
            }
        }
    }

    #[test]
    fn punchthrough_alpha_is_binary() {
        let mut pixels = [[0u8; 4]; 16];
        for (px, pixel) in pixels.iter_mut().enumerate() {
            let alpha = if px < 8 { 255 } else { 0 };
            *pixel = [(px * 15) as u8, 100, 180, alpha];
        }
        let inputs = blocks_from(pixels);

        let mut scratch = Etc1Scratch::new();
        let mut outputs = [[0u8; 8]; LANE_WIDTH];
        encode_etc2_punchthrough(&mut outputs, &inputs, &Options::default(), &mut scratch);

        for block in &outputs {
            let mut decoded = [[0u8; 4]; 16];
            blockdec::etc2_punchthrough(block, &mut decoded);

            for (px, pixel) in decoded.iter().enumerate() {
                assert_eq!(pixel[3], pixels[px][3], "pixel {px} alpha");
                if pixels[px][3] == 0 {
                    assert_eq!(&pixel[..3], &[0, 0, 0], "transparent pixels decode black");
                }
            }
        }
    }

    #[test]
    fn opaque_punchthrough_keeps_opaque_bit() {
        let pixels = [[120u8, 130, 140, 255]; 16];
        let inputs = blocks_from(pixels);

        let mut scratch = Etc1Scratch::new();
        let mut outputs = [[0u8; 8]; LANE_WIDTH];
        encode_etc2_punchthrough(&mut outputs, &inputs, &Options::default(), &mut scratch);

        for block in &outputs {
            // Bit 33 of the block is the opaque flag.
            assert_eq!(block[3] & 2, 2);

            let mut decoded = [[0u8; 4]; 16];
            blockdec::etc2_punchthrough(block, &mut decoded);
            for px in decoded {
                assert_eq!(px[3], 255);
                for ch in 0..3 {
                    let d = (px[ch] as i32 - pixels[0][ch] as i32).abs();
                    assert!(d <= 8, "channel {ch} off by {d}");
                }
            }
        }
    }

    #[test]
    fn eac_alpha_round_trips() {
        let mut pixels = [[0u8; 4]; 16];
        for (px, pixel) in pixels.iter_mut().enumerate() {
            pixel[3] = (px * 16 + 8) as u8;
        }
        let inputs = blocks_from(pixels);

        let mut outputs = [[0u8; 8]; LANE_WIDTH];
        encode_eac_alpha(&mut outputs, &inputs, &Options::default());

        for block in &outputs {
            let mut decoded = [0u8; 16];
            blockdec::eac_alpha(block, &mut decoded);

            // Sixteen distinct values only get eight reconstruction
            // levels, so the ramp cannot land closer than a couple of
            // level spacings.
            for px in 0..16 {
                let d = (decoded[px] as i32 - pixels[px][3] as i32).abs();
                assert!(d <= 32, "pixel {px} off by {d}");
            }
        }
    }

    #[test]
    fn eac_alpha_solid_is_exact() {
        let mut pixels = [[0u8; 4]; 16];
        for pixel in pixels.iter_mut() {
            pixel[3] = 77;
        }
        let inputs = blocks_from(pixels);

        let mut outputs = [[0u8; 8]; LANE_WIDTH];
        encode_eac_alpha(&mut outputs, &inputs, &Options::default());

        for block in &outputs {
            let mut decoded = [0u8; 16];
            blockdec::eac_alpha(block, &mut decoded);
            // Table 13 contains a zero modifier, so constant alpha is
            // representable exactly.
            for px in 0..16 {
                assert_eq!(decoded[px], 77);
            }
        }
    }

    #[test]
    fn eac_r11_unsigned_round_trips() {
        let mut values = [0i16; 16];
        for (px, value) in values.iter_mut().enumerate() {
            *value = (px * 128 + 11) as i16;
        }
        let inputs = [PixelBlockScalarS16 { values }; LANE_WIDTH];

        let mut outputs = [[0u8; 8]; LANE_WIDTH];
        encode_eac_r11(&mut outputs, &inputs, false);

        for block in &outputs {
            let mut decoded = [0u16; 16];
            blockdec::eac_r11(block, &mut decoded);

            for px in 0..16 {
                let d = (decoded[px] as i32 - values[px] as i32).abs();
                assert!(d <= 200, "pixel {px}: {} vs {}", decoded[px], values[px]);
            }
        }
    }
}
