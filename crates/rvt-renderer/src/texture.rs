//! Virtual Texture Layout
//!
//! Producer descriptions and the per-layer pixel formats they use.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Maximum number of layers a single virtual texture can carry
pub const MAX_LAYERS: usize = 8;

/// Physical-texture pixel formats used by virtual texture layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// BC1, 4 bits per texel, RGB with 1-bit alpha
    Dxt1,
    /// BC3, 8 bits per texel, RGBA
    Dxt5,
    /// BC5, 8 bits per texel, two channels
    Bc5,
    /// Uncompressed 8-bit BGRA
    B8G8R8A8,
    /// One BC1 block per texel, written by the compress pass
    R32G32Uint,
    /// One BC3/BC5 block per texel, written by the compress pass
    R32G32B32A32Uint,
}

impl PixelFormat {
    /// Whether this is a block-compressed format
    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Dxt1 | Self::Dxt5 | Self::Bc5)
    }

    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dxt1 => "DXT1",
            Self::Dxt5 => "DXT5",
            Self::Bc5 => "BC5",
            Self::B8G8R8A8 => "B8G8R8A8",
            Self::R32G32Uint => "R32G32_UINT",
            Self::R32G32B32A32Uint => "R32G32B32A32_UINT",
        }
    }

    /// Matching wgpu texture format
    pub fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            Self::Dxt1 => wgpu::TextureFormat::Bc1RgbaUnorm,
            Self::Dxt5 => wgpu::TextureFormat::Bc3RgbaUnorm,
            Self::Bc5 => wgpu::TextureFormat::Bc5RgUnorm,
            Self::B8G8R8A8 => wgpu::TextureFormat::Bgra8Unorm,
            Self::R32G32Uint => wgpu::TextureFormat::Rg32Uint,
            Self::R32G32B32A32Uint => wgpu::TextureFormat::Rgba32Uint,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Layout of a tiled, sparse, mip-mapped texture handed to the allocator
/// when its producer is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VtProducerDescription {
    /// Name (for debugging)
    pub name: String,
    /// Always 2 for runtime virtual textures
    pub dimensions: u32,
    /// Tile size in texels, excluding borders
    pub tile_size: u32,
    /// Border texels on each side of a tile
    pub tile_border_size: u32,
    /// Texture width divided by the tile size
    pub width_in_tiles: u32,
    /// Texture height divided by the tile size
    pub height_in_tiles: u32,
    /// Number of mip levels below the top one; never less than 1
    pub max_level: u32,
    /// One physical format per layer
    pub layer_formats: SmallVec<[PixelFormat; 2]>,
}

impl VtProducerDescription {
    /// Number of layers
    pub fn num_layers(&self) -> usize {
        self.layer_formats.len()
    }

    /// Tile size including the border on both sides
    pub fn physical_tile_size(&self) -> u32 {
        self.tile_size + 2 * self.tile_border_size
    }

    /// Texture width in texels
    pub fn width_in_pixels(&self) -> u32 {
        self.width_in_tiles * self.tile_size
    }

    /// Texture height in texels
    pub fn height_in_pixels(&self) -> u32 {
        self.height_in_tiles * self.tile_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_pixel_format_compression() {
        assert!(PixelFormat::Dxt1.is_compressed());
        assert!(PixelFormat::Bc5.is_compressed());
        assert!(!PixelFormat::B8G8R8A8.is_compressed());
        assert!(!PixelFormat::R32G32Uint.is_compressed());
        assert_eq!(PixelFormat::R32G32B32A32Uint.to_wgpu(), wgpu::TextureFormat::Rgba32Uint);
        assert_eq!(PixelFormat::Dxt5.to_wgpu(), wgpu::TextureFormat::Bc3RgbaUnorm);
        assert_eq!(PixelFormat::Bc5.to_string(), "BC5");
    }

    #[test]
    fn test_description_sizes() {
        let desc = VtProducerDescription {
            name: "Terrain".into(),
            dimensions: 2,
            tile_size: 256,
            tile_border_size: 4,
            width_in_tiles: 16,
            height_in_tiles: 8,
            max_level: 4,
            layer_formats: smallvec![PixelFormat::Dxt1, PixelFormat::Bc5],
        };
        assert_eq!(desc.num_layers(), 2);
        assert_eq!(desc.physical_tile_size(), 264);
        assert_eq!(desc.width_in_pixels(), 4096);
        assert_eq!(desc.height_in_pixels(), 2048);
    }
}
