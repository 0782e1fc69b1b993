//! Virtual Texture System
//!
//! Reference implementation of [`VirtualTextureAllocator`]: a producer
//! registry, up to [`MAX_SPACES`] page-table spaces, and Morton-ordered
//! address allocation inside each space.

use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::AHashMap;
use glam::Vec2;
use rvt_core::ceil_log2;
use smallvec::SmallVec;

use crate::allocator::{
    AllocatedVirtualTexture, AllocatedVtDescription, AllocationId, VirtualTextureAllocator,
    VirtualTextureStats,
};
use crate::producer::{ProducerHandle, VirtualTexture};
use crate::texture::{MAX_LAYERS, VtProducerDescription};
use crate::{RendererError, RendererResult, VirtualTextureSettings};

/// Space IDs are packed into 4 bits
pub const MAX_SPACES: usize = 16;

/// Page coordinates are packed into 12 bits per axis
pub const LOG2_MAX_PAGE_TABLE_SIZE: u32 = 12;

/// Pack a page request word: `x | y << 12 | level << 24 | space << 28`
pub fn encode_page(space_id: u32, v_level: u32, v_tile_x: u32, v_tile_y: u32) -> u32 {
    v_tile_x | (v_tile_y << 12) | (v_level << 24) | (space_id << 28)
}

/// Mip level at which the texture maps about one texel per pixel when
/// drawn at `screen_space_size`
pub fn compute_mip_level(allocated: &AllocatedVirtualTexture, screen_space_size: Vec2) -> f32 {
    let texels_per_pixel = Vec2::new(
        allocated.width_in_pixels() as f32 / screen_space_size.x,
        allocated.height_in_pixels() as f32 / screen_space_size.y,
    );
    let ppx = texels_per_pixel.x * texels_per_pixel.x;
    let ppy = texels_per_pixel.y * texels_per_pixel.y;
    0.5 * ppx.max(ppy).log2()
}

/// Packed page words covering a texel region of an allocation.
///
/// With an explicit `mip_level` only that level is requested. Otherwise the
/// level is picked from `screen_space_size`, clamped to the allocation's
/// mip chain, and the next level down is requested too for trilinear
/// filtering.
///
/// A region empty on both axes extends to the texture's far edges from its
/// `region_min`; any other region is clipped to the texture bounds. Tiles
/// only partially covered at the region's min edge are skipped.
pub fn tiles_for_region(
    allocated: &AllocatedVirtualTexture,
    screen_space_size: Vec2,
    region_min: (u32, u32),
    region_max: (u32, u32),
    mip_level: Option<u32>,
) -> Vec<u32> {
    let width = allocated.width_in_pixels();
    let height = allocated.height_in_pixels();
    let max = if region_min.0 >= region_max.0 && region_min.1 >= region_max.1 {
        (width, height)
    } else {
        (region_max.0.min(width), region_max.1.min(height))
    };

    let mut pages = Vec::new();
    match mip_level {
        Some(v_level) => push_region_tiles(&mut pages, allocated, region_min, max, v_level),
        None => {
            let max_level = allocated.max_level;
            let v_level = compute_mip_level(allocated, screen_space_size).floor();
            let v_level = (v_level.max(0.0) as u32).min(max_level);
            push_region_tiles(&mut pages, allocated, region_min, max, v_level);
            if v_level < max_level {
                push_region_tiles(&mut pages, allocated, region_min, max, v_level + 1);
            }
        }
    }
    pages
}

fn push_region_tiles(
    pages: &mut Vec<u32>,
    allocated: &AllocatedVirtualTexture,
    min: (u32, u32),
    max: (u32, u32),
    v_level: u32,
) {
    let tile = allocated.virtual_tile_size;
    let level_tiles = |(x, y): (u32, u32)| {
        (
            x.checked_shr(v_level).unwrap_or(0).div_ceil(tile),
            y.checked_shr(v_level).unwrap_or(0).div_ceil(tile),
        )
    };
    let tile_min = level_tiles(min);
    let tile_max = level_tiles(max);

    let base = allocated.page_coords();
    let base_x = base.x.checked_shr(v_level).unwrap_or(0);
    let base_y = base.y.checked_shr(v_level).unwrap_or(0);

    for y in tile_min.1..tile_max.1 {
        for x in tile_min.0..tile_max.0 {
            pages.push(encode_page(allocated.space_id, v_level, base_x + x, base_y + y));
        }
    }
}

struct ProducerEntry {
    description: VtProducerDescription,
    // Held so the producer outlives its registration
    _producer: Arc<dyn VirtualTexture>,
}

#[derive(Default)]
struct ProducerSlot {
    magic: u32,
    entry: Option<ProducerEntry>,
}

/// Producer slots with generational handles
#[derive(Default)]
struct ProducerRegistry {
    slots: Vec<ProducerSlot>,
    free_slots: Vec<u32>,
    count: usize,
}

impl ProducerRegistry {
    fn register(&mut self, entry: ProducerEntry) -> ProducerHandle {
        let index = match self.free_slots.pop() {
            Some(index) => index,
            None => {
                self.slots.push(ProducerSlot::default());
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.magic = slot.magic.wrapping_add(1).max(1);
        slot.entry = Some(entry);
        self.count += 1;
        ProducerHandle::new(index, slot.magic)
    }

    fn find(&self, handle: ProducerHandle) -> Option<&ProducerEntry> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| handle.is_valid() && slot.magic == handle.magic)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn release(&mut self, handle: ProducerHandle) -> bool {
        if self.find(handle).is_none() {
            return false;
        }
        self.slots[handle.index as usize].entry = None;
        self.free_slots.push(handle.index);
        self.count -= 1;
        true
    }
}

/// Quadtree buddy allocator over a Morton-ordered address range.
///
/// An aligned square block of side `2^level` tiles is a contiguous range of
/// `4^level` Morton addresses, so splitting a block yields four children and
/// a block can merge back once all four are free.
struct AddressAllocator {
    log2_size: u32,
    free: Vec<BTreeSet<u32>>,
    allocated: AHashMap<u32, u32>,
}

impl AddressAllocator {
    fn new(log2_size: u32) -> Self {
        let mut free = vec![BTreeSet::new(); log2_size as usize + 1];
        free[log2_size as usize].insert(0);
        Self {
            log2_size,
            free,
            allocated: AHashMap::new(),
        }
    }

    fn block_len(level: u32) -> u32 {
        1 << (2 * level)
    }

    fn allocate(&mut self, level: u32) -> Option<u32> {
        if level > self.log2_size {
            return None;
        }

        let from = (level..=self.log2_size).find(|&l| !self.free[l as usize].is_empty())?;
        let address = self.free[from as usize].pop_first()?;

        for split in (level..from).rev() {
            let len = Self::block_len(split);
            for child in 1..4 {
                self.free[split as usize].insert(address + child * len);
            }
        }

        self.allocated.insert(address, level);
        Some(address)
    }

    fn free(&mut self, address: u32) -> bool {
        let Some(mut level) = self.allocated.remove(&address) else {
            return false;
        };

        let mut address = address;
        while level < self.log2_size {
            let len = Self::block_len(level);
            let parent = address & !(Self::block_len(level + 1) - 1);
            let siblings: SmallVec<[u32; 3]> = (0..4)
                .map(|child| parent + child * len)
                .filter(|&sibling| sibling != address)
                .collect();

            let free_list = &mut self.free[level as usize];
            if !siblings.iter().all(|sibling| free_list.contains(sibling)) {
                break;
            }
            for sibling in &siblings {
                free_list.remove(sibling);
            }

            address = parent;
            level += 1;
        }

        self.free[level as usize].insert(address);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SpaceDescription {
    dimensions: u32,
    tile_size: u32,
    tile_border_size: u32,
    num_layers: usize,
    private_space: bool,
}

struct Space {
    id: u32,
    description: SpaceDescription,
    addresses: AddressAllocator,
    ref_count: u32,
}

struct AllocationEntry {
    description: AllocatedVtDescription,
    texture: AllocatedVirtualTexture,
    ref_count: u32,
}

/// In-process virtual texture system
pub struct VirtualTextureSystem {
    settings: VirtualTextureSettings,
    producers: ProducerRegistry,
    spaces: Vec<Option<Space>>,
    allocations: AHashMap<AllocationId, AllocationEntry>,
    allocation_lookup: AHashMap<AllocatedVtDescription, AllocationId>,
    next_allocation_id: u32,
}

impl VirtualTextureSystem {
    /// Create an empty system
    pub fn new(settings: VirtualTextureSettings) -> Self {
        Self {
            settings,
            producers: ProducerRegistry::default(),
            spaces: (0..MAX_SPACES).map(|_| None).collect(),
            allocations: AHashMap::new(),
            allocation_lookup: AHashMap::new(),
            next_allocation_id: 0,
        }
    }

    /// Description of a registered producer
    pub fn producer_description(&self, handle: ProducerHandle) -> Option<&VtProducerDescription> {
        self.producers.find(handle).map(|entry| &entry.description)
    }

    /// Page-table side length of a live space, in tiles
    pub fn page_table_size(&self, space_id: u32) -> Option<u32> {
        self.spaces
            .get(space_id as usize)
            .and_then(Option::as_ref)
            .map(|space| 1 << space.addresses.log2_size)
    }

    fn acquire_space(
        &mut self,
        description: SpaceDescription,
        block_log2: u32,
    ) -> RendererResult<(u32, u32)> {
        if !description.private_space {
            for space in self.spaces.iter_mut().flatten() {
                if space.description == description {
                    if let Some(address) = space.addresses.allocate(block_log2) {
                        space.ref_count += 1;
                        return Ok((space.id, address));
                    }
                }
            }
        }

        let slot = self
            .spaces
            .iter()
            .position(Option::is_none)
            .ok_or(RendererError::OutOfSpaces(MAX_SPACES))?;
        let id = slot as u32;

        // Private spaces are sized to fit exactly one allocation
        let log2_size = if description.private_space {
            block_log2
        } else {
            LOG2_MAX_PAGE_TABLE_SIZE
        };

        let mut addresses = AddressAllocator::new(log2_size);
        let address = addresses
            .allocate(block_log2)
            .ok_or(RendererError::PageTableFull(id))?;

        tracing::debug!(
            target: "virtual_texture",
            space_id = id,
            page_table_size = 1u32 << log2_size,
            private = description.private_space,
            "Created page-table space"
        );

        self.spaces[slot] = Some(Space {
            id,
            description,
            addresses,
            ref_count: 1,
        });
        Ok((id, address))
    }

    fn release_space(&mut self, space_id: u32, address: u32) {
        let Some(slot) = self.spaces.get_mut(space_id as usize) else {
            return;
        };
        let Some(space) = slot.as_mut() else {
            return;
        };

        space.addresses.free(address);
        space.ref_count -= 1;

        if space.ref_count == 0 && space.description.private_space {
            *slot = None;
            tracing::debug!(
                target: "virtual_texture",
                space_id,
                "Destroyed private page-table space"
            );
        }
    }
}

impl Default for VirtualTextureSystem {
    fn default() -> Self {
        Self::new(VirtualTextureSettings::default())
    }
}

impl VirtualTextureAllocator for VirtualTextureSystem {
    fn register_producer(
        &mut self,
        description: &VtProducerDescription,
        producer: Arc<dyn VirtualTexture>,
    ) -> ProducerHandle {
        let handle = self.producers.register(ProducerEntry {
            description: description.clone(),
            _producer: producer,
        });
        log::debug!("Registered producer '{}' as {:?}", description.name, handle);
        handle
    }

    fn release_producer(&mut self, handle: ProducerHandle) {
        let referencing = self
            .allocations
            .values()
            .filter(|entry| entry.description.producer_handles.contains(&handle))
            .count();
        if referencing > 0 {
            log::warn!(
                "Releasing producer {:?} still referenced by {} allocation(s)",
                handle,
                referencing
            );
        }

        if self.producers.release(handle) {
            log::debug!("Released producer {:?}", handle);
        } else {
            log::warn!("Release of unknown producer {:?}", handle);
        }
    }

    fn allocate_virtual_texture(
        &mut self,
        description: &AllocatedVtDescription,
    ) -> RendererResult<AllocatedVirtualTexture> {
        let num_layers = description.num_layers();
        if num_layers > MAX_LAYERS {
            return Err(RendererError::TooManyLayers(num_layers));
        }
        assert!(num_layers > 0, "virtual texture allocation without layers");

        // Identical requests share one allocation
        if let Some(entry) = self
            .allocation_lookup
            .get(description)
            .and_then(|id| self.allocations.get_mut(id))
        {
            entry.ref_count += 1;
            return Ok(entry.texture.clone());
        }

        let mut width_in_tiles = 0;
        let mut height_in_tiles = 0;
        let mut max_level = 0;
        for &handle in &description.producer_handles {
            let producer = self
                .producers
                .find(handle)
                .ok_or(RendererError::UnknownProducer(handle))?;
            width_in_tiles = width_in_tiles.max(producer.description.width_in_tiles);
            height_in_tiles = height_in_tiles.max(producer.description.height_in_tiles);
            max_level = max_level.max(producer.description.max_level);
        }

        let size_in_tiles = width_in_tiles.max(height_in_tiles);
        let block_log2 = ceil_log2(size_in_tiles);
        if block_log2 > LOG2_MAX_PAGE_TABLE_SIZE {
            return Err(RendererError::PageTableTooLarge(size_in_tiles));
        }

        let (space_id, virtual_address) = self.acquire_space(
            SpaceDescription {
                dimensions: description.dimensions,
                tile_size: description.tile_size,
                tile_border_size: description.tile_border_size,
                num_layers,
                private_space: description.private_space,
            },
            block_log2,
        )?;

        let physical_tile_size = description.tile_size + 2 * description.tile_border_size;
        let physical_texture_size = self.settings.physical_pool_tiles * physical_tile_size;

        let id = AllocationId(self.next_allocation_id);
        self.next_allocation_id += 1;

        let texture = AllocatedVirtualTexture {
            id,
            space_id,
            virtual_address,
            virtual_tile_size: description.tile_size,
            tile_border_size: description.tile_border_size,
            width_in_tiles,
            height_in_tiles,
            max_level,
            physical_texture_sizes: std::iter::repeat_n(physical_texture_size, num_layers)
                .collect(),
        };

        tracing::debug!(
            target: "virtual_texture",
            allocation = id.0,
            space_id,
            virtual_address,
            width_in_tiles,
            height_in_tiles,
            "Allocated virtual texture"
        );

        self.allocation_lookup.insert(description.clone(), id);
        self.allocations.insert(
            id,
            AllocationEntry {
                description: description.clone(),
                texture: texture.clone(),
                ref_count: 1,
            },
        );
        Ok(texture)
    }

    fn destroy_virtual_texture(&mut self, allocated: &AllocatedVirtualTexture) {
        let Some(entry) = self.allocations.get_mut(&allocated.id) else {
            log::warn!("Destroy of unknown allocation {:?}", allocated.id);
            return;
        };

        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return;
        }

        if let Some(entry) = self.allocations.remove(&allocated.id) {
            self.allocation_lookup.remove(&entry.description);
            self.release_space(entry.texture.space_id, entry.texture.virtual_address);
            log::debug!("Destroyed allocation {:?}", allocated.id);
        }
    }

    fn stats(&self) -> VirtualTextureStats {
        VirtualTextureStats {
            producers: self.producers.count,
            allocations: self.allocations.len(),
            spaces: self.spaces.iter().flatten().count(),
        }
    }
}
