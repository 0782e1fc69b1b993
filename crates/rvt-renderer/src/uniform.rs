//! Uniform Packing
//!
//! Bit-exact constant-buffer words read by the virtual texture sampling
//! shader. Float fields hold raw IEEE-754 bits; integer fields are stored
//! as-is. Changing any layout here requires the matching shader change.

use glam::UVec4;
use rvt_core::{floor_log2, pack_float_bits};

use crate::allocator::AllocatedVirtualTexture;

/// Largest page table side in tiles; page X/Y each get 12 bits
pub const MAX_PAGE_TABLE_SIZE: u32 = 4096;

/// Log2 of the effective max anisotropy for a texture.
///
/// The requested anisotropy is clamped to `[1, tile_border_size]` since the
/// sampler footprint cannot reach past the tile border. A zero border yields 0.
pub fn max_anisotropy_log2(max_anisotropy: i32, tile_border_size: u32) -> u32 {
    let border = tile_border_size.min(i32::MAX as u32) as i32;
    let clamped = if max_anisotropy < 1 {
        1
    } else if max_anisotropy < border {
        max_anisotropy
    } else {
        border
    };

    if clamped > 0 { floor_log2(clamped as u32) } else { 0 }
}

/// Pack the two page-table words for an allocated virtual texture.
///
/// Layout:
/// - word 0: `{f(w / 4096), f(h / 4096), w, h}` with `w`/`h` in tiles
/// - word 1: `{aniso_log2, x | y << 12 | log2(tile) << 24, max_level, space << 28}`
///
/// Both words are zero when nothing is allocated.
pub fn pack_page_table_uniform(
    allocated: Option<&AllocatedVirtualTexture>,
    max_anisotropy: i32,
) -> [UVec4; 2] {
    let Some(allocated) = allocated else {
        return [UVec4::ZERO; 2];
    };

    let page = allocated.page_coords();
    debug_assert!(
        page.x < MAX_PAGE_TABLE_SIZE && page.y < MAX_PAGE_TABLE_SIZE,
        "page coordinate {page} outside the 12-bit range"
    );

    let width = allocated.width_in_tiles;
    let height = allocated.height_in_tiles;
    let word0 = UVec4::new(
        pack_float_bits(width as f32 / MAX_PAGE_TABLE_SIZE as f32),
        pack_float_bits(height as f32 / MAX_PAGE_TABLE_SIZE as f32),
        width,
        height,
    );

    let page_bits = page.x | (page.y << 12) | (floor_log2(allocated.virtual_tile_size) << 24);
    let word1 = UVec4::new(
        max_anisotropy_log2(max_anisotropy, allocated.tile_border_size),
        page_bits,
        allocated.max_level,
        allocated.space_id << 28,
    );

    [word0, word1]
}

/// Pack the physical texture word for one layer:
/// `{0, f(tile / size), f(border / size), f((tile + 2 * border) / size)}`.
///
/// Zero when nothing is allocated or the layer has no physical backing.
pub fn pack_uniform(allocated: Option<&AllocatedVirtualTexture>, layer: usize) -> UVec4 {
    let Some(allocated) = allocated else {
        return UVec4::ZERO;
    };

    let physical_size = allocated.physical_texture_size(layer);
    if physical_size == 0 {
        return UVec4::ZERO;
    }

    let size = physical_size as f32;
    let tile = allocated.virtual_tile_size as f32;
    let border = allocated.tile_border_size as f32;
    UVec4::new(
        0,
        pack_float_bits(tile / size),
        pack_float_bits(border / size),
        pack_float_bits((tile + 2.0 * border) / size),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocationId;
    use rvt_core::{encode_morton2, unpack_float_bits};
    use smallvec::smallvec;

    fn allocated(x: u32, y: u32) -> AllocatedVirtualTexture {
        AllocatedVirtualTexture {
            id: AllocationId(0),
            space_id: 3,
            virtual_address: encode_morton2(x, y),
            virtual_tile_size: 256,
            tile_border_size: 4,
            width_in_tiles: 256,
            height_in_tiles: 128,
            max_level: 8,
            physical_texture_sizes: smallvec![4224, 0],
        }
    }

    #[test]
    fn test_page_table_uniform_null() {
        assert_eq!(pack_page_table_uniform(None, 8), [UVec4::ZERO; 2]);
    }

    #[test]
    fn test_page_table_uniform_layout() {
        let [word0, word1] = pack_page_table_uniform(Some(&allocated(5, 9)), 8);

        assert_eq!(unpack_float_bits(word0.x), 256.0 / 4096.0);
        assert_eq!(unpack_float_bits(word0.y), 128.0 / 4096.0);
        assert_eq!(word0.z, 256);
        assert_eq!(word0.w, 128);

        // Anisotropy 8 clamped to the border of 4
        assert_eq!(word1.x, 2);
        assert_eq!(word1.y, 5 | (9 << 12) | (8 << 24));
        assert_eq!(word1.z, 8);
        assert_eq!(word1.w, 3 << 28);
    }

    #[test]
    fn test_page_table_uniform_max_coordinates() {
        let [_, word1] = pack_page_table_uniform(Some(&allocated(4095, 4095)), 1);
        assert_eq!(word1.y & 0xfff, 4095);
        assert_eq!((word1.y >> 12) & 0xfff, 4095);
        assert_eq!(word1.y >> 24, 8);
    }

    #[test]
    fn test_float_words_are_bitcast() {
        let mut texture = allocated(0, 0);
        texture.width_in_tiles = 4096;
        let [word0, _] = pack_page_table_uniform(Some(&texture), 8);

        // 4096 / 4096 = 1.0, stored as IEEE bits rather than the integer 1
        assert_eq!(word0.x, 1.0f32.to_bits());
        assert_ne!(word0.x, 1);
        assert_eq!(word0.z, 4096);
    }

    #[test]
    fn test_max_anisotropy_log2() {
        assert_eq!(max_anisotropy_log2(8, 8), 3);
        assert_eq!(max_anisotropy_log2(16, 8), 3);
        assert_eq!(max_anisotropy_log2(4, 8), 2);
        assert_eq!(max_anisotropy_log2(3, 8), 1);
        assert_eq!(max_anisotropy_log2(0, 8), 0);
        assert_eq!(max_anisotropy_log2(-4, 8), 0);
        assert_eq!(max_anisotropy_log2(8, 2), 1);
        assert_eq!(max_anisotropy_log2(8, 0), 0);
    }

    #[test]
    fn test_layer_uniform() {
        let texture = allocated(0, 0);
        let word = pack_uniform(Some(&texture), 0);

        assert_eq!(word.x, 0);
        assert_eq!(unpack_float_bits(word.y), 256.0 / 4224.0);
        assert_eq!(unpack_float_bits(word.z), 4.0 / 4224.0);
        assert_eq!(unpack_float_bits(word.w), 264.0 / 4224.0);
    }

    #[test]
    fn test_layer_uniform_zero_fill() {
        let texture = allocated(0, 0);
        assert_eq!(pack_uniform(None, 0), UVec4::ZERO);
        assert_eq!(pack_uniform(Some(&texture), 1), UVec4::ZERO);
        assert_eq!(pack_uniform(Some(&texture), 7), UVec4::ZERO);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "outside the 12-bit range")]
    fn test_page_coordinate_beyond_12_bits() {
        let texture = allocated(4096, 0);
        pack_page_table_uniform(Some(&texture), 8);
    }
}
