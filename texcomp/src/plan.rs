//! BC7 encoding plans.
//!
//! A plan decides which modes, partitions and shapes the search evaluates
//! and how many tweak rounds each shape gets. Plans either come from a
//! quality level or from explicit per mode seed point counts.

use crate::tables::{NUM_SHAPES_12, NUM_SHAPES_ALL, SHAPES_1, SHAPES_2, SHAPES_3};

pub const NUM_RGB_SHAPES: usize = NUM_SHAPES_ALL;
pub const NUM_RGBA_SHAPES: usize = NUM_SHAPES_12;

/// Explicit seed point counts per mode and partition. A count of zero
/// disables that mode and partition combination.
#[derive(Debug, Clone)]
pub struct Bc7FineTuningParams {
    pub mode0_sp: [u8; 16],
    pub mode1_sp: [u8; 64],
    pub mode2_sp: [u8; 64],
    pub mode3_sp: [u8; 64],
    /// Per rotation, per index selector.
    pub mode4_sp: [[u8; 2]; 4],
    /// Per rotation.
    pub mode5_sp: [u8; 4],
    pub mode6_sp: u8,
    pub mode7_sp: [u8; 64],
}

impl Default for Bc7FineTuningParams {
    fn default() -> Self {
        Bc7FineTuningParams {
            mode0_sp: [0; 16],
            mode1_sp: [0; 64],
            mode2_sp: [0; 64],
            mode3_sp: [0; 64],
            mode4_sp: [[0; 2]; 4],
            mode5_sp: [0; 4],
            mode6_sp: 0,
            mode7_sp: [0; 64],
        }
    }
}

/// Search schedule consumed by the BC7 encoder.
#[derive(Debug, Clone)]
pub struct Bc7EncodingPlan {
    pub mode0_partition_enabled: u16,
    pub mode1_partition_enabled: u64,
    pub mode2_partition_enabled: u64,
    pub mode3_partition_enabled: u64,
    pub mode4_sp: [[u8; 2]; 4],
    pub mode5_sp: [u8; 4],
    pub mode6_enabled: bool,
    pub mode7_rgba_partition_enabled: u64,
    pub mode7_rgb_partition_enabled: u64,

    pub seed_points_for_shape_rgb: [u8; NUM_RGB_SHAPES],
    pub seed_points_for_shape_rgba: [u8; NUM_RGBA_SHAPES],

    pub rgb_shape_list: [u8; NUM_RGB_SHAPES],
    pub rgb_num_shapes: usize,
    pub rgba_shape_list: [u8; NUM_RGBA_SHAPES],
    pub rgba_num_shapes: usize,
}

impl Bc7EncodingPlan {
    /// Build a plan from explicit fine tuning parameters.
    pub fn from_fine_tuning(params: &Bc7FineTuningParams) -> Self {
        let mut plan = Bc7EncodingPlan {
            mode0_partition_enabled: 0,
            mode1_partition_enabled: 0,
            mode2_partition_enabled: 0,
            mode3_partition_enabled: 0,
            mode4_sp: params.mode4_sp,
            mode5_sp: params.mode5_sp,
            mode6_enabled: false,
            mode7_rgba_partition_enabled: 0,
            mode7_rgb_partition_enabled: 0,
            seed_points_for_shape_rgb: [0; NUM_RGB_SHAPES],
            seed_points_for_shape_rgba: [0; NUM_RGBA_SHAPES],
            rgb_shape_list: [0; NUM_RGB_SHAPES],
            rgb_num_shapes: 0,
            rgba_shape_list: [0; NUM_RGBA_SHAPES],
            rgba_num_shapes: 0,
        };

        let raise_rgb = |seeds: &mut [u8; NUM_RGB_SHAPES], shape: u8, sp: u8| {
            let slot = &mut seeds[shape as usize];
            *slot = (*slot).max(sp);
        };

        for partition in 0..16 {
            let sp = params.mode0_sp[partition];
            if sp == 0 {
                continue;
            }
            plan.mode0_partition_enabled |= 1 << partition;
            for subset in 0..3 {
                raise_rgb(
                    &mut plan.seed_points_for_shape_rgb,
                    SHAPES_3[partition][subset],
                    sp,
                );
            }
        }

        for partition in 0..64 {
            let sp = params.mode1_sp[partition];
            if sp == 0 {
                continue;
            }
            plan.mode1_partition_enabled |= 1 << partition;
            for subset in 0..2 {
                raise_rgb(
                    &mut plan.seed_points_for_shape_rgb,
                    SHAPES_2[partition][subset],
                    sp,
                );
            }
        }

        for partition in 0..64 {
            let sp = params.mode2_sp[partition];
            if sp == 0 {
                continue;
            }
            plan.mode2_partition_enabled |= 1 << partition;
            for subset in 0..3 {
                raise_rgb(
                    &mut plan.seed_points_for_shape_rgb,
                    SHAPES_3[partition][subset],
                    sp,
                );
            }
        }

        for partition in 0..64 {
            let sp = params.mode3_sp[partition];
            if sp == 0 {
                continue;
            }
            plan.mode3_partition_enabled |= 1 << partition;
            for subset in 0..2 {
                raise_rgb(
                    &mut plan.seed_points_for_shape_rgb,
                    SHAPES_2[partition][subset],
                    sp,
                );
            }
        }

        if params.mode6_sp != 0 {
            plan.mode6_enabled = true;
            let shape = SHAPES_1[0][0] as usize;
            plan.seed_points_for_shape_rgba[shape] =
                plan.seed_points_for_shape_rgba[shape].max(params.mode6_sp);
        }

        for partition in 0..64 {
            let sp = params.mode7_sp[partition];
            if sp == 0 {
                continue;
            }
            plan.mode7_rgba_partition_enabled |= 1 << partition;
            for subset in 0..2 {
                let shape = SHAPES_2[partition][subset] as usize;
                plan.seed_points_for_shape_rgba[shape] =
                    plan.seed_points_for_shape_rgba[shape].max(sp);
            }
        }

        for shape in 0..NUM_RGB_SHAPES {
            if plan.seed_points_for_shape_rgb[shape] > 0 {
                plan.rgb_shape_list[plan.rgb_num_shapes] = shape as u8;
                plan.rgb_num_shapes += 1;
            }
        }

        for shape in 0..NUM_RGBA_SHAPES {
            if plan.seed_points_for_shape_rgba[shape] > 0 {
                plan.rgba_shape_list[plan.rgba_num_shapes] = shape as u8;
                plan.rgba_num_shapes += 1;
            }
        }

        // Mode 7 only earns its keep on RGB blocks where mode 3 is not
        // already trying the same partition.
        plan.mode7_rgb_partition_enabled =
            plan.mode7_rgba_partition_enabled & !plan.mode3_partition_enabled;

        plan
    }

    /// Build a plan from a quality level in 1..=100.
    ///
    /// The schedule is monotone: everything evaluated at quality `q` is also
    /// evaluated at any higher quality, so raising quality never increases
    /// encoding error.
    pub fn from_quality(quality: u32) -> Self {
        let q = quality.clamp(1, 100);

        // 1..=4 seed points, nondecreasing in quality.
        let base_seeds = (1 + (q - 1) * 3 / 99) as u8;
        let partition_seeds = base_seeds.min(2);

        // Leading prefix of partitions enabled for a mode that phases in at
        // `start` and reaches all `count` partitions at quality `end`.
        let prefix = |start: u32, end: u32, count: u64| -> u64 {
            if q < start {
                return 0;
            }
            let span = (end - start + 1) as u64;
            let steps = (q.min(end) - start + 1) as u64;
            let enabled = (steps * count + span - 1) / span;
            if enabled >= count {
                u64::MAX >> (64 - count)
            } else {
                (1u64 << enabled) - 1
            }
        };

        let mut params = Bc7FineTuningParams {
            mode6_sp: base_seeds,
            ..Default::default()
        };

        let mode1_mask = prefix(1, 100, 64);
        // Mode 3 saturates before mode 7 phases in, so the derived mode 7
        // RGB mask never loses a partition as quality rises.
        let mode3_mask = prefix(30, 49, 64);
        let mode0_mask = prefix(45, 100, 16);
        let mode7_mask = prefix(50, 100, 64);
        let mode2_mask = prefix(60, 100, 64);

        for partition in 0..64 {
            if (mode1_mask >> partition) & 1 != 0 {
                params.mode1_sp[partition] = base_seeds;
            }
            if (mode3_mask >> partition) & 1 != 0 {
                params.mode3_sp[partition] = partition_seeds;
            }
            if (mode7_mask >> partition) & 1 != 0 {
                params.mode7_sp[partition] = partition_seeds;
            }
            if (mode2_mask >> partition) & 1 != 0 {
                params.mode2_sp[partition] = partition_seeds;
            }
        }
        for partition in 0..16 {
            if (mode0_mask >> partition) & 1 != 0 {
                params.mode0_sp[partition] = partition_seeds;
            }
        }

        let rotation_start = [1u32, 40, 60, 80];
        for (rotation, start) in rotation_start.iter().enumerate() {
            if q >= *start {
                params.mode5_sp[rotation] = base_seeds;
                params.mode4_sp[rotation] = [base_seeds, base_seeds];
            }
        }

        Self::from_fine_tuning(&params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_plans_are_monotone() {
        let mut previous = Bc7EncodingPlan::from_quality(1);
        for q in 2..=100 {
            let plan = Bc7EncodingPlan::from_quality(q);

            assert_eq!(
                plan.mode1_partition_enabled & previous.mode1_partition_enabled,
                previous.mode1_partition_enabled,
                "quality {q} dropped mode 1 partitions"
            );
            assert_eq!(
                plan.mode3_partition_enabled & previous.mode3_partition_enabled,
                previous.mode3_partition_enabled
            );
            assert_eq!(
                plan.mode7_rgba_partition_enabled & previous.mode7_rgba_partition_enabled,
                previous.mode7_rgba_partition_enabled
            );

            for shape in 0..NUM_RGB_SHAPES {
                assert!(
                    plan.seed_points_for_shape_rgb[shape]
                        >= previous.seed_points_for_shape_rgb[shape]
                );
            }
            for shape in 0..NUM_RGBA_SHAPES {
                assert!(
                    plan.seed_points_for_shape_rgba[shape]
                        >= previous.seed_points_for_shape_rgba[shape]
                );
            }

            previous = plan;
        }
    }

    #[test]
    fn minimum_quality_is_not_empty() {
        let plan = Bc7EncodingPlan::from_quality(1);
        assert!(plan.mode6_enabled);
        assert!(plan.mode1_partition_enabled != 0);
        assert!(plan.rgb_num_shapes > 0);
        assert!(plan.rgba_num_shapes > 0);
    }

    #[test]
    fn maximum_quality_enables_everything() {
        let plan = Bc7EncodingPlan::from_quality(100);
        assert_eq!(plan.mode0_partition_enabled, 0xffff);
        assert_eq!(plan.mode1_partition_enabled, u64::MAX);
        assert_eq!(plan.mode2_partition_enabled, u64::MAX);
        assert_eq!(plan.mode3_partition_enabled, u64::MAX);
        assert_eq!(plan.mode7_rgba_partition_enabled, u64::MAX);
        assert!(plan.mode6_enabled);
        assert_eq!(plan.mode4_sp[3], [4, 4]);
    }

    #[test]
    fn shape_lists_match_seed_points() {
        let plan = Bc7EncodingPlan::from_quality(75);
        for i in 0..plan.rgb_num_shapes {
            let shape = plan.rgb_shape_list[i] as usize;
            assert!(plan.seed_points_for_shape_rgb[shape] > 0);
        }
        for i in 0..plan.rgba_num_shapes {
            let shape = plan.rgba_shape_list[i] as usize;
            assert!(plan.seed_points_for_shape_rgba[shape] > 0);
        }
    }

    #[test]
    fn mode7_rgb_excludes_mode3_partitions() {
        let params = Bc7FineTuningParams {
            mode3_sp: {
                let mut sp = [0; 64];
                sp[5] = 2;
                sp
            },
            mode7_sp: {
                let mut sp = [0; 64];
                sp[5] = 2;
                sp[9] = 2;
                sp
            },
            ..Default::default()
        };

        let plan = Bc7EncodingPlan::from_fine_tuning(&params);
        assert_eq!(plan.mode7_rgba_partition_enabled, (1 << 5) | (1 << 9));
        assert_eq!(plan.mode7_rgb_partition_enabled, 1 << 9);
    }
}
