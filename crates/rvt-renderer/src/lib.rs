//! # RVT Renderer
//!
//! Runtime virtual texture production and GPU page-table addressing.
//!
//! ## Features
//! - Producer descriptions derived from power-of-two biased asset properties
//! - Orthographic page views and pass selection for rendering tiles
//! - Render resources that register producers and own page-table allocations
//! - Bit-packed page-table and physical-texture uniforms for sampling shaders
//! - A reference virtual texture system with private page-table spaces
//! - Material dependency tracking so stale uniform bindings are recached

pub mod allocator;
pub mod component;
pub mod material;
pub mod producer;
pub mod render_page;
pub mod render_resource;
pub mod runtime_virtual_texture;
pub mod system;
pub mod texture;
pub mod uniform;

pub use allocator::{
    AllocatedVirtualTexture, AllocatedVtDescription, AllocationId, VirtualTextureAllocator,
    VirtualTextureStats,
};
pub use component::{RuntimeVirtualTextureComponent, SharedVirtualTexture};
pub use material::{MaterialDependencyIndex, MaterialId, MaterialRegistry};
pub use producer::{
    PageRenderRequest, PageRenderTarget, ProducerHandle, RuntimeVirtualTextureProducer,
    VirtualTexture,
};
pub use render_page::{RenderPageSetup, render_page_setup};
pub use render_resource::{
    RenderContext, RenderQueue, ResourceState, RuntimeVirtualTextureRenderResource,
    spawn_render_thread,
};
pub use runtime_virtual_texture::{
    RuntimeVirtualTexture, RuntimeVirtualTextureMaterialType, RuntimeVirtualTextureProperties,
};
pub use system::{VirtualTextureSystem, compute_mip_level, encode_page, tiles_for_region};
pub use texture::{PixelFormat, VtProducerDescription};
pub use uniform::{MAX_PAGE_TABLE_SIZE, pack_page_table_uniform, pack_uniform};

use rvt_platform::PlatformError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Renderer errors
#[derive(Error, Debug)]
pub enum RendererError {
    #[error("Too many layers: {0} (max {max})", max = texture::MAX_LAYERS)]
    TooManyLayers(usize),

    #[error("All {0} page-table spaces are in use")]
    OutOfSpaces(usize),

    #[error("Page table full in space {0}")]
    PageTableFull(u32),

    #[error("Page table of {0} tiles exceeds the addressable range")]
    PageTableTooLarge(u32),

    #[error("Unknown producer handle: {0:?}")]
    UnknownProducer(ProducerHandle),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

/// Result type for renderer operations
pub type RendererResult<T> = Result<T, RendererError>;

/// Virtual texture system settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualTextureSettings {
    /// Maximum anisotropy used when sampling virtual textures.
    /// Clamped per texture to `[1, tile_border_size]` when packed.
    pub max_anisotropy: i32,
    /// Tiles per side of each physical pool texture
    pub physical_pool_tiles: u32,
}

impl Default for VirtualTextureSettings {
    fn default() -> Self {
        Self {
            max_anisotropy: 8,
            physical_pool_tiles: 16,
        }
    }
}

impl VirtualTextureSettings {
    /// Parse settings from JSON; missing fields keep their defaults
    pub fn from_json(json: &str) -> RendererResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
