//! Virtual Texture Allocator Interface
//!
//! The seam between render resources and whatever owns the global page
//! tables and physical pools. Every method is called on the render thread
//! only; implementations need no internal locking.

use std::sync::Arc;

use glam::UVec2;
use rvt_core::decode_morton2;
use smallvec::SmallVec;

use crate::RendererResult;
use crate::producer::{ProducerHandle, VirtualTexture};
use crate::texture::VtProducerDescription;

/// Request for a page-table allocation covering one or more producer layers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AllocatedVtDescription {
    /// Always 2 for runtime virtual textures
    pub dimensions: u32,
    /// Tile size in texels, excluding borders
    pub tile_size: u32,
    /// Border texels on each side of a tile
    pub tile_border_size: u32,
    /// Request a dedicated page-table space instead of sharing one
    pub private_space: bool,
    /// Producer feeding each layer
    pub producer_handles: SmallVec<[ProducerHandle; 2]>,
    /// Layer of the producer feeding each layer
    pub local_layer_to_produce: SmallVec<[u8; 2]>,
}

impl AllocatedVtDescription {
    /// Number of layers
    pub fn num_layers(&self) -> usize {
        self.producer_handles.len()
    }
}

/// Identifier of a live page-table allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub u32);

/// A page-table slot assigned to a virtual texture
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatedVirtualTexture {
    /// Allocation identity, used to destroy it
    pub id: AllocationId,
    /// Page-table space holding the allocation (4-bit budget)
    pub space_id: u32,
    /// Morton-coded tile coordinate of the allocation inside its space
    pub virtual_address: u32,
    /// Tile size in texels, excluding borders
    pub virtual_tile_size: u32,
    /// Border texels on each side of a tile
    pub tile_border_size: u32,
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    pub max_level: u32,
    /// Physical pool texture size per layer, in texels
    pub physical_texture_sizes: SmallVec<[u32; 2]>,
}

impl AllocatedVirtualTexture {
    /// Physical pool texture size of a layer, zero when the layer has no backing
    pub fn physical_texture_size(&self, layer: usize) -> u32 {
        self.physical_texture_sizes.get(layer).copied().unwrap_or(0)
    }

    /// Page coordinate of the allocation's first tile
    pub fn page_coords(&self) -> UVec2 {
        decode_morton2(self.virtual_address)
    }

    /// Width in texels
    pub fn width_in_pixels(&self) -> u32 {
        self.width_in_tiles * self.virtual_tile_size
    }

    /// Height in texels
    pub fn height_in_pixels(&self) -> u32 {
        self.height_in_tiles * self.virtual_tile_size
    }
}

/// Allocator bookkeeping snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtualTextureStats {
    /// Registered producers
    pub producers: usize,
    /// Live allocations (de-duplicated)
    pub allocations: usize,
    /// Live page-table spaces
    pub spaces: usize,
}

/// Global virtual texture services consumed by render resources
pub trait VirtualTextureAllocator: Send {
    /// Register a producer, returning a handle unique to this call
    fn register_producer(
        &mut self,
        description: &VtProducerDescription,
        producer: Arc<dyn VirtualTexture>,
    ) -> ProducerHandle;

    /// Unregister a producer. Allocations referencing it must be destroyed first.
    fn release_producer(&mut self, handle: ProducerHandle);

    /// Assign a page-table slot
    fn allocate_virtual_texture(
        &mut self,
        description: &AllocatedVtDescription,
    ) -> RendererResult<AllocatedVirtualTexture>;

    /// Release a page-table slot
    fn destroy_virtual_texture(&mut self, allocated: &AllocatedVirtualTexture);

    /// Current bookkeeping counts
    fn stats(&self) -> VirtualTextureStats;
}
