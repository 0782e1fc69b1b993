//! Math utilities
//!
//! Bit-level helpers used by page-table addressing, plus re-exports from glam.

use serde::{Deserialize, Serialize};

pub use glam::{Quat, UVec2, UVec4, Vec2, Vec3, Vec4};

/// Spread the low 16 bits of `x` into the even bit positions.
#[inline]
pub fn morton_code2(x: u32) -> u32 {
    let mut x = x & 0x0000_ffff;
    x = (x ^ (x << 8)) & 0x00ff_00ff;
    x = (x ^ (x << 4)) & 0x0f0f_0f0f;
    x = (x ^ (x << 2)) & 0x3333_3333;
    x = (x ^ (x << 1)) & 0x5555_5555;
    x
}

/// Gather the even bit positions of `x` back into the low 16 bits.
///
/// Exact inverse of [`morton_code2`]; odd bits are ignored, so the Y
/// coordinate of an address is recovered with `reverse_morton_code2(code >> 1)`.
#[inline]
pub fn reverse_morton_code2(x: u32) -> u32 {
    let mut x = x & 0x5555_5555;
    x = (x ^ (x >> 1)) & 0x3333_3333;
    x = (x ^ (x >> 2)) & 0x0f0f_0f0f;
    x = (x ^ (x >> 4)) & 0x00ff_00ff;
    x = (x ^ (x >> 8)) & 0x0000_ffff;
    x
}

/// Interleave a 2D tile coordinate into a single address (X in even bits)
#[inline]
pub fn encode_morton2(x: u32, y: u32) -> u32 {
    morton_code2(x) | (morton_code2(y) << 1)
}

/// Split an interleaved address back into its 2D tile coordinate
#[inline]
pub fn decode_morton2(code: u32) -> UVec2 {
    UVec2::new(reverse_morton_code2(code), reverse_morton_code2(code >> 1))
}

/// Floor of log2, with `floor_log2(0) == 0`
#[inline]
pub fn floor_log2(value: u32) -> u32 {
    if value == 0 { 0 } else { 31 - value.leading_zeros() }
}

/// Ceiling of log2, with `ceil_log2(0) == ceil_log2(1) == 0`
#[inline]
pub fn ceil_log2(value: u32) -> u32 {
    if value <= 1 { 0 } else { 32 - (value - 1).leading_zeros() }
}

/// Store the raw IEEE-754 bits of a float in a uniform word.
///
/// This is a bit copy, not a numeric conversion: `pack_float_bits(1.0)` is
/// `0x3f80_0000`, never `1`.
#[inline]
pub fn pack_float_bits(value: f32) -> u32 {
    value.to_bits()
}

/// Read back a float stored with [`pack_float_bits`]
#[inline]
pub fn unpack_float_bits(bits: u32) -> f32 {
    f32::from_bits(bits)
}

/// Axis-aligned 2D box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Box2 {
    /// Minimum corner
    pub min: Vec2,
    /// Maximum corner
    pub max: Vec2,
}

impl Box2 {
    /// Create a box from min and max corners
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    /// Create a box from a corner and a size
    pub fn from_min_size(min: Vec2, size: Vec2) -> Self {
        Self { min, max: min + size }
    }

    /// Get the full size of the box
    pub fn size(&self) -> Vec2 {
        self.max - self.min
    }

    /// Get the half-size of the box
    pub fn extent(&self) -> Vec2 {
        self.size() * 0.5
    }

    /// Get the center of the box
    pub fn center(&self) -> Vec2 {
        (self.min + self.max) * 0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_morton_interleave() {
        assert_eq!(morton_code2(0b1), 0b1);
        assert_eq!(morton_code2(0b11), 0b101);
        assert_eq!(encode_morton2(1, 0), 0b01);
        assert_eq!(encode_morton2(0, 1), 0b10);
        assert_eq!(encode_morton2(3, 3), 0b1111);
    }

    #[test]
    fn test_morton_round_trip_12_bit_range() {
        for x in (0..4096).step_by(37).chain([4095]) {
            for y in (0..4096).step_by(41).chain([4095]) {
                let code = encode_morton2(x, y);
                assert_eq!(decode_morton2(code), UVec2::new(x, y));
            }
        }
    }

    #[test]
    fn test_reverse_morton_ignores_odd_bits() {
        let code = encode_morton2(0x0abc, 0x0fff);
        assert_eq!(reverse_morton_code2(code), 0x0abc);
        assert_eq!(reverse_morton_code2(code >> 1), 0x0fff);
    }

    #[test]
    fn test_log2_helpers() {
        assert_eq!(floor_log2(0), 0);
        assert_eq!(floor_log2(1), 0);
        assert_eq!(floor_log2(256), 8);
        assert_eq!(floor_log2(257), 8);

        assert_eq!(ceil_log2(0), 0);
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(256), 8);
        assert_eq!(ceil_log2(257), 9);
    }

    #[test]
    fn test_pack_float_bits_is_not_numeric_cast() {
        assert_eq!(pack_float_bits(1.0), 0x3f80_0000);
        assert_ne!(pack_float_bits(1.0), 1);
        assert_eq!(pack_float_bits(0.0), 0);
        assert_eq!(unpack_float_bits(pack_float_bits(0.125)), 0.125);
    }

    #[test]
    fn test_box2() {
        let b = Box2::from_min_size(Vec2::new(1.0, 2.0), Vec2::new(4.0, 2.0));
        assert_eq!(b.max, Vec2::new(5.0, 4.0));
        assert_eq!(b.center(), Vec2::new(3.0, 3.0));
        assert_eq!(b.extent(), Vec2::new(2.0, 1.0));
    }
}
