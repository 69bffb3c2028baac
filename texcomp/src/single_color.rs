//! Single color endpoint tables for BC7.
//!
//! For a near-constant partition the search can be short-circuited: for each
//! target channel value there is a best achievable endpoint pair given the
//! mode's quantization, parity bits and one interpolation index. The tables
//! are built per mode, per parity combination and per index at compile time
//! by enumerating every quantized endpoint pair.

/// Best endpoint pair approximating one target channel value.
#[derive(Debug, Clone, Copy)]
pub struct ScTableEntry {
    /// Unquantized low endpoint.
    pub min: u8,
    /// Unquantized high endpoint.
    pub max: u8,
    /// The value hardware reconstructs from this pair.
    pub actual: u8,
}

/// One table: a fixed interpolation index and parity combination.
#[derive(Debug, Clone, Copy)]
pub struct ScTable {
    pub entries: [ScTableEntry; 256],
    /// Index every pixel is assigned when this table wins.
    pub index: u8,
    /// Parity combination, `p0 | p1 << 1`, for punch-through gating.
    pub p_bits: u8,
}

/// Unquantize a `bits`-wide value with optional parity bit appended,
/// matching the hardware endpoint expansion for every BC7 mode.
const fn unquantize(q: u16, bits: u32, parity: Option<u16>) -> u8 {
    let (combined, width) = match parity {
        Some(p) => ((q << 1) | p, bits + 1),
        None => (q, bits),
    };

    let expanded = combined << (8 - width);
    (expanded | (expanded >> width)) as u8
}

const fn interpolate(min: u8, max: u8, weight: u16) -> u8 {
    (((64 - weight) * min as u16 + weight * max as u16 + 32) >> 6) as u8
}

const fn build_table(
    bits: u32,
    parity: Option<(u16, u16)>,
    index: u8,
    index_bits: usize,
) -> ScTable {
    let weight = weight_table_const(index_bits)[index as usize];
    let levels: u16 = 1 << bits;

    // Every reconstruction some endpoint pair can produce, keeping the first
    // pair found for each value.
    let mut achievable = [false; 256];
    let mut pair_min = [0u8; 256];
    let mut pair_max = [0u8; 256];

    let mut lo = 0u16;
    while lo < levels {
        let min = match parity {
            Some((p0, _)) => unquantize(lo, bits, Some(p0)),
            None => unquantize(lo, bits, None),
        };

        let mut hi = 0u16;
        while hi < levels {
            let max = match parity {
                Some((_, p1)) => unquantize(hi, bits, Some(p1)),
                None => unquantize(hi, bits, None),
            };

            let actual = interpolate(min, max, weight) as usize;
            if !achievable[actual] {
                achievable[actual] = true;
                pair_min[actual] = min;
                pair_max[actual] = max;
            }

            hi += 1;
        }
        lo += 1;
    }

    let mut entries = [ScTableEntry { min: 0, max: 0, actual: 0 }; 256];
    let mut target = 0usize;
    while target < 256 {
        let mut distance = 0isize;
        loop {
            let below = target as isize - distance;
            let above = target as isize + distance;
            if below >= 0 && achievable[below as usize] {
                entries[target] = ScTableEntry {
                    min: pair_min[below as usize],
                    max: pair_max[below as usize],
                    actual: below as u8,
                };
                break;
            }
            if above < 256 && achievable[above as usize] {
                entries[target] = ScTableEntry {
                    min: pair_min[above as usize],
                    max: pair_max[above as usize],
                    actual: above as u8,
                };
                break;
            }
            distance += 1;
        }
        target += 1;
    }

    let p_bits = match parity {
        Some((p0, p1)) => (p0 | (p1 << 1)) as u8,
        None => 0,
    };

    ScTable { entries, index, p_bits }
}

// `weight_table` is not callable in const context; mirror it here.
const fn weight_table_const(index_bits: usize) -> &'static [u16] {
    match index_bits {
        2 => &[0, 21, 43, 64],
        3 => &[0, 9, 18, 27, 37, 46, 55, 64],
        _ => &[0, 4, 9, 13, 17, 21, 26, 30, 34, 38, 43, 47, 51, 55, 60, 64],
    }
}

macro_rules! parity_index_tables {
    ($bits:expr, $index_bits:expr, [$(($p0:expr, $p1:expr, $idx:expr)),* $(,)?]) => {
        [$(build_table($bits, Some(($p0, $p1)), $idx, $index_bits)),*]
    };
}

static MODE0_TABLES: [ScTable; 12] = parity_index_tables!(4, 3, [
    (0, 0, 1), (0, 0, 2), (0, 0, 3),
    (0, 1, 1), (0, 1, 2), (0, 1, 3),
    (1, 0, 1), (1, 0, 2), (1, 0, 3),
    (1, 1, 1), (1, 1, 2), (1, 1, 3),
]);

static MODE1_TABLES: [ScTable; 6] = parity_index_tables!(6, 3, [
    (0, 0, 1), (0, 0, 2), (0, 0, 3),
    (1, 1, 1), (1, 1, 2), (1, 1, 3),
]);

static MODE2_TABLES: [ScTable; 1] = [build_table(5, None, 1, 2)];

static MODE3_TABLES: [ScTable; 2] = parity_index_tables!(7, 2, [(0, 0, 1), (1, 1, 1)]);

static MODE6_TABLES: [ScTable; 14] = parity_index_tables!(7, 4, [
    (0, 0, 1), (0, 0, 2), (0, 0, 3), (0, 0, 4), (0, 0, 5), (0, 0, 6), (0, 0, 7),
    (1, 1, 1), (1, 1, 2), (1, 1, 3), (1, 1, 4), (1, 1, 5), (1, 1, 6), (1, 1, 7),
]);

static MODE7_TABLES: [ScTable; 4] = parity_index_tables!(5, 2, [
    (0, 0, 1), (0, 1, 1), (1, 0, 1), (1, 1, 1),
]);

/// Tables to probe for a mode of the single-plane search.
pub fn tables_for_mode(mode: usize) -> &'static [ScTable] {
    match mode {
        0 => &MODE0_TABLES,
        1 => &MODE1_TABLES,
        2 => &MODE2_TABLES,
        3 => &MODE3_TABLES,
        6 => &MODE6_TABLES,
        7 => &MODE7_TABLES,
        _ => unreachable!("mode {mode} has no single color tables"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::weight_table;

    fn check_reconstruction(tables: &[ScTable], index_bits: usize) {
        for table in tables {
            let weight = weight_table(index_bits)[table.index as usize];
            for entry in &table.entries {
                assert_eq!(
                    interpolate(entry.min, entry.max, weight),
                    entry.actual,
                    "index {} p_bits {}",
                    table.index,
                    table.p_bits
                );
            }
        }
    }

    #[test]
    fn entries_reconstruct_their_actual_color() {
        check_reconstruction(&MODE0_TABLES, 3);
        check_reconstruction(&MODE1_TABLES, 3);
        check_reconstruction(&MODE2_TABLES, 2);
        check_reconstruction(&MODE3_TABLES, 2);
        check_reconstruction(&MODE6_TABLES, 4);
        check_reconstruction(&MODE7_TABLES, 2);
    }

    #[test]
    fn high_precision_modes_are_near_exact() {
        // Mode 6 stores 7.1 endpoints, so every target is achievable exactly.
        for table in &MODE6_TABLES {
            for (target, entry) in table.entries.iter().enumerate() {
                let err = (entry.actual as i32 - target as i32).abs();
                assert!(err <= 1, "target {target} actual {}", entry.actual);
            }
        }
    }

    #[test]
    fn endpoints_carry_their_parity_bits() {
        // Packing recovers the parity bit from bit 7 - rgb_bits of the
        // unquantized endpoint.
        for table in &MODE7_TABLES {
            for entry in &table.entries {
                assert_eq!((entry.min >> 2) & 1, table.p_bits & 1);
                assert_eq!((entry.max >> 2) & 1, (table.p_bits >> 1) & 1);
            }
        }
    }
}
