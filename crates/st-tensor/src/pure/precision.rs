// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! bfloat16 helpers used to emulate reduced-precision forward passes while
//! keeping `f32` master weights.

use super::Tensor;

/// Convert `f32` to bf16 bits, rounding the dropped mantissa to nearest-even.
#[inline]
pub fn f32_to_bf16(x: f32) -> u16 {
    let bits = x.to_bits();
    if x.is_nan() {
        // quiet NaN, sign preserved
        let sign = (bits >> 16) & 0x8000;
        return (sign | 0x7FC0) as u16;
    }
    let round = bits.wrapping_add(0x7FFF + ((bits >> 16) & 1));
    (round >> 16) as u16
}

/// Widen bf16 bits back to `f32`.
#[inline]
pub fn bf16_to_f32(x: u16) -> f32 {
    f32::from_bits((x as u32) << 16)
}

/// Round an `f32` to the nearest representable bf16 value.
#[inline]
pub fn round_to_bf16(x: f32) -> f32 {
    bf16_to_f32(f32_to_bf16(x))
}

impl Tensor {
    /// Returns a copy with every element rounded through bf16.
    pub fn to_bf16_precision(&self) -> Tensor {
        let mut rounded = self.clone();
        for value in rounded.data_mut() {
            *value = round_to_bf16(*value);
        }
        rounded
    }
}
