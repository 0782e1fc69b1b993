//! Virtual Texture Producers
//!
//! Producers generate tile data on demand for pages the sampler touches.
//! The allocator only references them; ownership stays with whoever placed
//! the virtual texture in the world.

use bitflags::bitflags;
use glam::{UVec2, Vec2};
use parking_lot::Mutex;
use rvt_core::{Box2, Transform, decode_morton2};
use smallvec::SmallVec;

use crate::render_page::{RenderPageSetup, render_page_setup};
use crate::runtime_virtual_texture::RuntimeVirtualTextureMaterialType;
use crate::texture::{PixelFormat, VtProducerDescription};

/// Handle to a producer registered with a virtual texture allocator.
///
/// The default handle is invalid. A handle stays unique for the lifetime of
/// the allocator: the magic number changes every time a slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProducerHandle {
    /// Slot in the producer registry
    pub index: u32,
    /// Generation of the slot; zero means invalid
    pub magic: u32,
}

impl ProducerHandle {
    /// Create a handle from its parts
    pub fn new(index: u32, magic: u32) -> Self {
        Self { index, magic }
    }

    /// Whether this handle was issued by an allocator
    pub fn is_valid(&self) -> bool {
        self.magic != 0
    }
}

bitflags! {
    /// Selects the layers of a virtual texture a request applies to
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LayerMask: u8 {
        const LAYER_0 = 1 << 0;
        const LAYER_1 = 1 << 1;
        const LAYER_2 = 1 << 2;
        const LAYER_3 = 1 << 3;
        const LAYER_4 = 1 << 4;
        const LAYER_5 = 1 << 5;
        const LAYER_6 = 1 << 6;
        const LAYER_7 = 1 << 7;
    }
}

impl LayerMask {
    /// Mask selecting the first `count` layers
    pub fn first(count: usize) -> Self {
        let bits = if count >= 8 { 0xff } else { (1u8 << count) - 1 };
        Self::from_bits_retain(bits)
    }

    /// Whether the given layer index is selected
    pub fn has_layer(&self, layer: usize) -> bool {
        layer < 8 && self.bits() & (1 << layer) != 0
    }
}

/// Page request priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestPagePriority {
    Normal,
    High,
}

/// Outcome of asking a producer for a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPageResult {
    /// The page can be produced right away
    Available,
    /// The page is being prepared; ask again later
    Pending,
    /// The page will never be available
    Invalid,
}

/// Destination of one produced layer inside its physical pool texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProduceTargetLayer {
    /// Physical tile coordinate in the pool
    pub page_location: UVec2,
}

/// Producer interface consumed by the virtual texture allocator
pub trait VirtualTexture: Send + Sync {
    /// Ask whether a page can be produced
    fn request_page_data(
        &self,
        producer: ProducerHandle,
        layer_mask: LayerMask,
        v_level: u8,
        v_address: u32,
        priority: RequestPagePriority,
    ) -> RequestPageResult;

    /// Produce a page into the given physical targets, one per layer
    fn produce_page_data(
        &self,
        producer: ProducerHandle,
        layer_mask: LayerMask,
        v_level: u8,
        v_address: u32,
        targets: &[ProduceTargetLayer],
    );
}

/// One requested layer of a page render
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageRenderTarget {
    pub layer: usize,
    /// Format of the physical pool texture
    pub format: PixelFormat,
    /// Destination rectangle in the pool texture, in texels
    pub dest_box: Box2,
}

/// A tile the renderer must draw into physical pool textures
#[derive(Debug, Clone, PartialEq)]
pub struct PageRenderRequest {
    /// Material outputs to render
    pub material_type: RuntimeVirtualTextureMaterialType,
    /// Maps UV space back to the world volume
    pub uv_to_world: Transform,
    /// UV range of the tile, including its border
    pub uv_range: Box2,
    /// Requested layers, in layer order
    pub targets: Vec<PageRenderTarget>,
}

impl PageRenderRequest {
    /// Target for `layer`, if that layer was requested
    pub fn target(&self, layer: usize) -> Option<&PageRenderTarget> {
        self.targets.iter().find(|target| target.layer == layer)
    }
}

/// Producer for runtime virtual textures.
///
/// Page data is rendered, not loaded, so every page is immediately available.
/// Produced pages are queued as [`PageRenderRequest`]s for the renderer.
pub struct RuntimeVirtualTextureProducer {
    material_type: RuntimeVirtualTextureMaterialType,
    tile_size: u32,
    tile_border_size: u32,
    width_in_tiles: u32,
    height_in_tiles: u32,
    layer_formats: SmallVec<[PixelFormat; 2]>,
    uv_to_world: Transform,
    pending: Mutex<Vec<PageRenderRequest>>,
}

impl RuntimeVirtualTextureProducer {
    /// Create a producer for the given layout, rendering the volume at `uv_to_world`
    pub fn new(
        description: &VtProducerDescription,
        material_type: RuntimeVirtualTextureMaterialType,
        uv_to_world: Transform,
    ) -> Self {
        Self {
            material_type,
            tile_size: description.tile_size,
            tile_border_size: description.tile_border_size,
            width_in_tiles: description.width_in_tiles,
            height_in_tiles: description.height_in_tiles,
            layer_formats: description.layer_formats.clone(),
            uv_to_world,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// UV range covered by a tile at `v_level`, padded by the tile border
    pub fn tile_uv_range(&self, v_level: u8, v_address: u32) -> Box2 {
        let tile = decode_morton2(v_address).as_vec2();
        let level_scale = (1u32 << v_level) as f32;
        let divisor = Vec2::new(
            self.width_in_tiles as f32 / level_scale,
            self.height_in_tiles as f32 / level_scale,
        );

        let uv = tile / divisor;
        let uv_size = Vec2::ONE / divisor;
        let uv_border = uv_size * (self.tile_border_size as f32 / self.tile_size as f32);
        Box2::new(uv - uv_border, uv + uv_size + uv_border)
    }

    /// Destination rectangle of a physical tile, in texels
    pub fn dest_box(&self, target: &ProduceTargetLayer) -> Box2 {
        let physical_tile_size = (self.tile_size + 2 * self.tile_border_size) as f32;
        Box2::from_min_size(
            target.page_location.as_vec2() * physical_tile_size,
            Vec2::splat(physical_tile_size),
        )
    }

    /// Placement of the rendered volume
    pub fn uv_to_world(&self) -> &Transform {
        &self.uv_to_world
    }

    /// Take every queued render request
    pub fn take_requests(&self) -> Vec<PageRenderRequest> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Take every queued render request and resolve its passes and view
    pub fn take_page_setups(&self) -> Vec<RenderPageSetup> {
        self.take_requests().iter().map(render_page_setup).collect()
    }

    /// Number of queued render requests
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }
}

impl VirtualTexture for RuntimeVirtualTextureProducer {
    fn request_page_data(
        &self,
        _producer: ProducerHandle,
        _layer_mask: LayerMask,
        _v_level: u8,
        _v_address: u32,
        _priority: RequestPagePriority,
    ) -> RequestPageResult {
        RequestPageResult::Available
    }

    fn produce_page_data(
        &self,
        _producer: ProducerHandle,
        layer_mask: LayerMask,
        v_level: u8,
        v_address: u32,
        targets: &[ProduceTargetLayer],
    ) {
        let targets = targets
            .iter()
            .zip(&self.layer_formats)
            .enumerate()
            .filter(|(layer, _)| layer_mask.has_layer(*layer))
            .map(|(layer, (target, &format))| PageRenderTarget {
                layer,
                format,
                dest_box: self.dest_box(target),
            })
            .collect();

        self.pending.lock().push(PageRenderRequest {
            material_type: self.material_type,
            uv_to_world: self.uv_to_world,
            uv_range: self.tile_uv_range(v_level, v_address),
            targets,
        });
    }
}
