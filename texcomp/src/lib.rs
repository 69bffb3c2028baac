//! # Introduction
//! CPU encoders for the BC6H, BC7, ETC1 and ETC2 families of fixed-rate
//! 4x4 block compressed texture formats.
//!
//! Each encoder takes a batch of [`LANE_WIDTH`] input blocks and produces
//! the exact 8 or 16 byte payloads the hardware decoders expect, searching
//! modes, partitions, endpoints, parity bits and per pixel indexes for the
//! encoding with the lowest weighted squared error. All per pixel work runs
//! lane parallel across the batch.
//!
//! The batch entry points ([`encode_bc7`], [`encode_bc6h`], [`encode_etc2`]
//! and friends) are the core API and never fail. The `*_from_*` helpers
//! work over byte slices of whole block streams and validate input sizes,
//! which is usually what texture pipelines want.
//!
//! # Limitations
//! Surfaces are the caller's problem: splitting an image into 4x4 blocks,
//! mipmapping and container formats all happen above this crate. Encoding is
//! single threaded per call; callers are free to process disjoint batches
//! from multiple threads.

use bytemuck::{Pod, Zeroable};

mod bc6h;
mod bc7;
mod bits;
mod endpoints;
mod etc;
mod index_select;
mod lanes;
mod metrics;
mod plan;
mod refine;
mod single_color;
mod tables;

pub mod error;
use error::EncodeError;

pub use bc6h::encode_bc6h;
pub use bc7::encode_bc7;
pub use etc::{
    encode_eac_alpha, encode_eac_r11, encode_etc1, encode_etc2, encode_etc2_punchthrough,
    Etc1Scratch, Etc2Scratch,
};
pub use lanes::LANE_WIDTH;
pub use plan::{Bc7EncodingPlan, Bc7FineTuningParams};

/// Encoder behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u32);

impl Flags {
    /// Pick the single best BC7 index instead of also testing its
    /// neighbors.
    pub const BC7_FAST_INDEXING: Flags = Flags(1 << 0);
    /// Probe the precomputed single color tables for near constant
    /// partitions.
    pub const BC7_TRY_SINGLE_COLOR: Flags = Flags(1 << 1);
    /// Avoid candidates that would change alpha values that are exactly 0
    /// or 255 in a block that only contains such values.
    pub const BC7_RESPECT_PUNCH_THROUGH: Flags = Flags(1 << 2);
    /// Assign BC6H indexes from numeric space coordinates instead of the
    /// slower linear space scan.
    pub const BC6H_FAST_INDEXING: Flags = Flags(1 << 3);
    /// Use the fake BT.709 error metric for ETC encoding.
    pub const ETC_USE_FAKE_BT709: Flags = Flags(1 << 4);
    /// With [`Flags::ETC_USE_FAKE_BT709`], use the 8-octant quantization
    /// refinement instead of the fast per channel rounding.
    pub const ETC_FAKE_BT709_ACCURATE: Flags = Flags(1 << 5);
    /// Ignore channel weights and treat every channel equally.
    pub const UNIFORM: Flags = Flags(1 << 6);

    pub const fn empty() -> Flags {
        Flags(0)
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

/// Shared encoder options.
#[derive(Debug, Clone)]
pub struct Options {
    pub flags: Flags,
    /// Per channel error weights, RGBA order.
    pub weights: [f32; 4],
    /// Lloyd refinement rounds for the BC7 searches.
    pub refine_rounds_bc7: usize,
    /// Endpoint axis perturbation rounds for BC6H.
    pub tweak_rounds_bc6h: usize,
    /// Lloyd refinement rounds for BC6H.
    pub refine_rounds_bc6h: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            flags: Flags::empty(),
            weights: [1.0; 4],
            refine_rounds_bc7: 2,
            tweak_rounds_bc6h: 1,
            refine_rounds_bc6h: 2,
        }
    }
}

impl Options {
    /// Channel weights with the [`Flags::UNIFORM`] override applied.
    pub(crate) fn effective_weights(&self) -> [f32; 4] {
        if self.flags.contains(Flags::UNIFORM) {
            [1.0; 4]
        } else {
            self.weights
        }
    }
}

/// One 4x4 block of 8 bit RGBA pixels, row major.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PixelBlockU8 {
    pub pixels: [[u8; 4]; 16],
}

/// One 4x4 block of RGBA binary16 bit patterns, row major. Alpha is passed
/// through unencoded.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PixelBlockF16 {
    pub pixels: [[u16; 4]; 16],
}

/// One 4x4 block of signed 16 bit scalars for EAC R11 encoding.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PixelBlockScalarS16 {
    pub values: [i16; 16],
}

const RGBA8_BLOCK_BYTES: usize = 16 * 4;
const F16_BLOCK_BYTES: usize = 16 * 4 * 2;

fn batch_pad<T: Copy>(blocks: &[T], fallback: T) -> impl Iterator<Item = [T; LANE_WIDTH]> + '_ {
    blocks.chunks(LANE_WIDTH).map(move |chunk| {
        let mut batch = [*chunk.last().unwrap_or(&fallback); LANE_WIDTH];
        batch[..chunk.len()].copy_from_slice(chunk);
        batch
    })
}

/// Encode a stream of RGBA8 data (64 bytes per block) to BC7.
pub fn bc7_from_rgba8(
    data: &[u8],
    options: &Options,
    plan: &Bc7EncodingPlan,
) -> Result<Vec<u8>, EncodeError> {
    if data.len() % RGBA8_BLOCK_BYTES != 0 {
        return Err(EncodeError::InvalidDataLength {
            expected_multiple: RGBA8_BLOCK_BYTES,
            actual: data.len(),
        });
    }

    let blocks: &[PixelBlockU8] = bytemuck::cast_slice(data);
    let mut output = Vec::with_capacity(blocks.len() * 16);

    let mut remaining = blocks.len();
    for batch in batch_pad(blocks, PixelBlockU8 { pixels: [[0; 4]; 16] }) {
        let mut encoded = [[0u8; 16]; LANE_WIDTH];
        encode_bc7(&mut encoded, &batch, options, plan);

        for block in encoded.iter().take(remaining.min(LANE_WIDTH)) {
            output.extend_from_slice(block);
        }
        remaining = remaining.saturating_sub(LANE_WIDTH);
    }

    Ok(output)
}

/// Encode a stream of RGBA binary16 data (128 bytes per block, little
/// endian) to BC6H.
pub fn bc6h_from_f16(
    data: &[u8],
    options: &Options,
    is_signed: bool,
) -> Result<Vec<u8>, EncodeError> {
    if data.len() % F16_BLOCK_BYTES != 0 {
        return Err(EncodeError::InvalidDataLength {
            expected_multiple: F16_BLOCK_BYTES,
            actual: data.len(),
        });
    }

    let mut blocks = Vec::with_capacity(data.len() / F16_BLOCK_BYTES);
    for chunk in data.chunks_exact(F16_BLOCK_BYTES) {
        let mut block = PixelBlockF16 { pixels: [[0; 4]; 16] };
        for (px, pixel) in chunk.chunks_exact(8).enumerate() {
            for ch in 0..4 {
                block.pixels[px][ch] =
                    u16::from_le_bytes([pixel[ch * 2], pixel[ch * 2 + 1]]);
            }
        }
        blocks.push(block);
    }

    let mut output = Vec::with_capacity(blocks.len() * 16);
    let mut remaining = blocks.len();
    for batch in batch_pad(&blocks, PixelBlockF16 { pixels: [[0; 4]; 16] }) {
        let mut encoded = [[0u8; 16]; LANE_WIDTH];
        encode_bc6h(&mut encoded, &batch, options, is_signed);

        for block in encoded.iter().take(remaining.min(LANE_WIDTH)) {
            output.extend_from_slice(block);
        }
        remaining = remaining.saturating_sub(LANE_WIDTH);
    }

    Ok(output)
}

/// Encode a stream of RGBA8 data (64 bytes per block) to ETC2 RGB.
pub fn etc2_from_rgba8(data: &[u8], options: &Options) -> Result<Vec<u8>, EncodeError> {
    if data.len() % RGBA8_BLOCK_BYTES != 0 {
        return Err(EncodeError::InvalidDataLength {
            expected_multiple: RGBA8_BLOCK_BYTES,
            actual: data.len(),
        });
    }

    let blocks: &[PixelBlockU8] = bytemuck::cast_slice(data);
    let mut scratch = Etc2Scratch::new();
    let mut output = Vec::with_capacity(blocks.len() * 8);

    let mut remaining = blocks.len();
    for batch in batch_pad(blocks, PixelBlockU8 { pixels: [[0; 4]; 16] }) {
        let mut encoded = [[0u8; 8]; LANE_WIDTH];
        encode_etc2(&mut encoded, &batch, options, &mut scratch);

        for block in encoded.iter().take(remaining.min(LANE_WIDTH)) {
            output.extend_from_slice(block);
        }
        remaining = remaining.saturating_sub(LANE_WIDTH);
    }

    Ok(output)
}

/// Encode a stream of RGBA8 data to the interleaved EAC alpha + ETC2 color
/// layout (16 bytes per block, alpha block first).
pub fn etc2_eac_from_rgba8(data: &[u8], options: &Options) -> Result<Vec<u8>, EncodeError> {
    if data.len() % RGBA8_BLOCK_BYTES != 0 {
        return Err(EncodeError::InvalidDataLength {
            expected_multiple: RGBA8_BLOCK_BYTES,
            actual: data.len(),
        });
    }

    let blocks: &[PixelBlockU8] = bytemuck::cast_slice(data);
    let mut scratch = Etc2Scratch::new();
    let mut output = Vec::with_capacity(blocks.len() * 16);

    let mut remaining = blocks.len();
    for batch in batch_pad(blocks, PixelBlockU8 { pixels: [[0; 4]; 16] }) {
        let mut color = [[0u8; 8]; LANE_WIDTH];
        let mut alpha = [[0u8; 8]; LANE_WIDTH];
        encode_etc2(&mut color, &batch, options, &mut scratch);
        encode_eac_alpha(&mut alpha, &batch, options);

        for i in 0..remaining.min(LANE_WIDTH) {
            output.extend_from_slice(&alpha[i]);
            output.extend_from_slice(&color[i]);
        }
        remaining = remaining.saturating_sub(LANE_WIDTH);
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_length_validation() {
        let options = Options::default();
        let plan = Bc7EncodingPlan::from_quality(10);

        let result = bc7_from_rgba8(&[0u8; 65], &options, &plan);
        assert!(matches!(
            result,
            Err(EncodeError::InvalidDataLength {
                expected_multiple: 64,
                actual: 65
            })
        ));

        let result = bc6h_from_f16(&[0u8; 130], &options, false);
        assert!(matches!(
            result,
            Err(EncodeError::InvalidDataLength {
                expected_multiple: 128,
                actual: 130
            })
        ));
    }

    #[test]
    fn stream_encodes_partial_batches() {
        // Three blocks force a padded batch.
        let data = vec![200u8; 64 * 3];
        let options = Options::default();
        let plan = Bc7EncodingPlan::from_quality(5);

        let encoded = bc7_from_rgba8(&data, &options, &plan).unwrap();
        assert_eq!(encoded.len(), 3 * 16);

        let encoded = etc2_from_rgba8(&data, &options).unwrap();
        assert_eq!(encoded.len(), 3 * 8);

        let encoded = etc2_eac_from_rgba8(&data, &options).unwrap();
        assert_eq!(encoded.len(), 3 * 16);
    }

    #[test]
    fn empty_stream_is_empty() {
        let options = Options::default();
        let plan = Bc7EncodingPlan::from_quality(5);
        assert!(bc7_from_rgba8(&[], &options, &plan).unwrap().is_empty());
    }

    #[test]
    fn flags_compose() {
        let flags = Flags::BC7_FAST_INDEXING | Flags::UNIFORM;
        assert!(flags.contains(Flags::BC7_FAST_INDEXING));
        assert!(flags.contains(Flags::UNIFORM));
        assert!(!flags.contains(Flags::BC7_TRY_SINGLE_COLOR));

        let options = Options {
            flags: Flags::UNIFORM,
            weights: [2.0, 1.0, 0.5, 1.0],
            ..Options::default()
        };
        assert_eq!(options.effective_weights(), [1.0; 4]);
    }
}
