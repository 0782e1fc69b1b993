//! Runtime Virtual Texture Render Resource
//!
//! Render-thread side of a runtime virtual texture. Registers the producer
//! with the allocator and owns the page-table allocation built on top of it.

use std::sync::Arc;

use rvt_platform::{RenderCommandQueue, RenderThread, is_in_render_thread};
use smallvec::SmallVec;

use crate::RendererResult;
use crate::allocator::{
    AllocatedVirtualTexture, AllocatedVtDescription, VirtualTextureAllocator, VirtualTextureStats,
};
use crate::producer::{ProducerHandle, VirtualTexture};
use crate::texture::VtProducerDescription;

/// State owned by the render thread.
///
/// Only constructible on a render thread, so any method taking
/// `&mut RenderContext` is guaranteed to run there.
pub struct RenderContext {
    allocator: Box<dyn VirtualTextureAllocator>,
}

impl RenderContext {
    /// Create a context around the allocator. Panics off the render thread.
    pub fn new(allocator: Box<dyn VirtualTextureAllocator>) -> Self {
        assert!(
            is_in_render_thread(),
            "render context created outside the render thread"
        );
        Self { allocator }
    }

    /// Get the allocator
    pub fn allocator(&mut self) -> &mut dyn VirtualTextureAllocator {
        self.allocator.as_mut()
    }

    /// Allocator bookkeeping counts
    pub fn stats(&self) -> VirtualTextureStats {
        self.allocator.stats()
    }
}

/// Queue of commands for the render thread
pub type RenderQueue = RenderCommandQueue<RenderContext>;

/// Spawn a render thread whose context owns `allocator`
pub fn spawn_render_thread(
    allocator: Box<dyn VirtualTextureAllocator>,
) -> RendererResult<RenderThread<RenderContext>> {
    let thread = RenderThread::spawn("RenderThread", move || RenderContext::new(allocator))?;
    Ok(thread)
}

/// Lifecycle of a render resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Created, nothing registered yet
    Uninitialized,
    /// Producer registered, no page-table allocation
    Registered,
    /// Producer registered and page table allocated
    Allocated,
    /// Everything released; the resource cannot be reused
    Released,
}

/// Bridges a producer and the allocator for the lifetime of one
/// initialization of a runtime virtual texture.
pub struct RuntimeVirtualTextureRenderResource {
    description: VtProducerDescription,
    producer: Arc<dyn VirtualTexture>,
    producer_handle: ProducerHandle,
    allocated: Option<AllocatedVirtualTexture>,
    state: ResourceState,
}

impl RuntimeVirtualTextureRenderResource {
    /// Create a resource; nothing is registered until [`Self::init_rhi`]
    pub fn new(description: VtProducerDescription, producer: Arc<dyn VirtualTexture>) -> Self {
        Self {
            description,
            producer,
            producer_handle: ProducerHandle::default(),
            allocated: None,
            state: ResourceState::Uninitialized,
        }
    }

    /// Register the producer and acquire the page-table allocation
    pub fn init_rhi(&mut self, context: &mut RenderContext) {
        assert_eq!(
            self.state,
            ResourceState::Uninitialized,
            "render resource '{}' initialized twice",
            self.description.name
        );

        self.producer_handle = context
            .allocator()
            .register_producer(&self.description, self.producer.clone());
        self.state = ResourceState::Registered;
        log::debug!(
            "Registered runtime virtual texture '{}' as {:?}",
            self.description.name,
            self.producer_handle
        );

        self.acquire_allocated_virtual_texture(context);
    }

    /// Get the page-table allocation, allocating it on first use.
    ///
    /// Returns `None` if the allocator refused the request; the failure is
    /// logged and a later call retries.
    pub fn acquire_allocated_virtual_texture(
        &mut self,
        context: &mut RenderContext,
    ) -> Option<&AllocatedVirtualTexture> {
        assert!(
            matches!(self.state, ResourceState::Registered | ResourceState::Allocated),
            "allocation requested for render resource '{}' in state {:?}",
            self.description.name,
            self.state
        );

        if self.allocated.is_none() {
            let description = self.allocation_description();
            match context.allocator().allocate_virtual_texture(&description) {
                Ok(allocated) => {
                    log::debug!(
                        "Allocated runtime virtual texture '{}' in space {}",
                        self.description.name,
                        allocated.space_id
                    );
                    self.allocated = Some(allocated);
                    self.state = ResourceState::Allocated;
                }
                Err(err) => {
                    log::error!(
                        "Failed to allocate runtime virtual texture '{}': {}",
                        self.description.name,
                        err
                    );
                }
            }
        }

        self.allocated.as_ref()
    }

    /// Destroy the page-table allocation, if any
    pub fn release_allocated_virtual_texture(&mut self, context: &mut RenderContext) {
        if let Some(allocated) = self.allocated.take() {
            context.allocator().destroy_virtual_texture(&allocated);
            if self.state == ResourceState::Allocated {
                self.state = ResourceState::Registered;
            }
        }
    }

    /// Release the allocation, then unregister the producer
    pub fn release_rhi(&mut self, context: &mut RenderContext) {
        if self.state == ResourceState::Released {
            return;
        }

        // A live allocation references the producer handle
        self.release_allocated_virtual_texture(context);

        if self.producer_handle.is_valid() {
            context.allocator().release_producer(self.producer_handle);
            log::debug!(
                "Released runtime virtual texture '{}' ({:?})",
                self.description.name,
                self.producer_handle
            );
        }
        self.producer_handle = ProducerHandle::default();
        self.state = ResourceState::Released;
    }

    fn allocation_description(&self) -> AllocatedVtDescription {
        let num_layers = self.description.num_layers();
        AllocatedVtDescription {
            dimensions: self.description.dimensions,
            tile_size: self.description.tile_size,
            tile_border_size: self.description.tile_border_size,
            private_space: true,
            producer_handles: SmallVec::from_elem(self.producer_handle, num_layers),
            local_layer_to_produce: (0..num_layers as u8).collect(),
        }
    }

    /// Handle from registration; invalid unless registered
    pub fn producer_handle(&self) -> ProducerHandle {
        self.producer_handle
    }

    /// Current allocation, without allocating
    pub fn allocated_virtual_texture(&self) -> Option<&AllocatedVirtualTexture> {
        self.allocated.as_ref()
    }

    /// Get the lifecycle state
    pub fn state(&self) -> ResourceState {
        self.state
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::allocator::AllocationId;
    use crate::producer::{LayerMask, ProduceTargetLayer, RequestPagePriority, RequestPageResult};
    use crate::texture::PixelFormat;
    use crate::{RendererError, VirtualTextureSystem};
    use parking_lot::Mutex;
    use smallvec::smallvec;

    /// Allocator call, in the order it reached the allocator
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Register(ProducerHandle),
        Release(ProducerHandle),
        Allocate(AllocationId, usize),
        Destroy(AllocationId),
    }

    /// Allocator that records every call and can be told to refuse allocations
    #[derive(Default)]
    pub(crate) struct RecordingAllocator {
        pub calls: Arc<Mutex<Vec<Call>>>,
        pub fail_allocations: bool,
        next: u32,
    }

    impl VirtualTextureAllocator for RecordingAllocator {
        fn register_producer(
            &mut self,
            _: &VtProducerDescription,
            _: Arc<dyn VirtualTexture>,
        ) -> ProducerHandle {
            self.next += 1;
            let handle = ProducerHandle::new(self.next, 1);
            self.calls.lock().push(Call::Register(handle));
            handle
        }

        fn release_producer(&mut self, handle: ProducerHandle) {
            self.calls.lock().push(Call::Release(handle));
        }

        fn allocate_virtual_texture(
            &mut self,
            description: &AllocatedVtDescription,
        ) -> RendererResult<AllocatedVirtualTexture> {
            if self.fail_allocations {
                return Err(RendererError::OutOfSpaces(16));
            }
            self.next += 1;
            let id = AllocationId(self.next);
            self.calls.lock().push(Call::Allocate(id, description.num_layers()));
            Ok(AllocatedVirtualTexture {
                id,
                space_id: 0,
                virtual_address: 0,
                virtual_tile_size: description.tile_size,
                tile_border_size: description.tile_border_size,
                width_in_tiles: 4,
                height_in_tiles: 4,
                max_level: 2,
                physical_texture_sizes: smallvec![1024; description.num_layers()],
            })
        }

        fn destroy_virtual_texture(&mut self, allocated: &AllocatedVirtualTexture) {
            self.calls.lock().push(Call::Destroy(allocated.id));
        }

        fn stats(&self) -> VirtualTextureStats {
            VirtualTextureStats::default()
        }
    }

    pub(crate) struct NullProducer;

    impl VirtualTexture for NullProducer {
        fn request_page_data(
            &self,
            _: ProducerHandle,
            _: LayerMask,
            _: u8,
            _: u32,
            _: RequestPagePriority,
        ) -> RequestPageResult {
            RequestPageResult::Invalid
        }

        fn produce_page_data(
            &self,
            _: ProducerHandle,
            _: LayerMask,
            _: u8,
            _: u32,
            _: &[ProduceTargetLayer],
        ) {
        }
    }

    fn description() -> VtProducerDescription {
        VtProducerDescription {
            name: "Terrain".into(),
            dimensions: 2,
            tile_size: 256,
            tile_border_size: 4,
            width_in_tiles: 4,
            height_in_tiles: 4,
            max_level: 2,
            layer_formats: smallvec![PixelFormat::Dxt1, PixelFormat::Bc5],
        }
    }

    fn resource() -> RuntimeVirtualTextureRenderResource {
        RuntimeVirtualTextureRenderResource::new(description(), Arc::new(NullProducer))
    }

    #[test]
    fn test_lifecycle_call_order() {
        let allocator = RecordingAllocator::default();
        let calls = allocator.calls.clone();
        let thread = spawn_render_thread(Box::new(allocator)).unwrap();
        let queue = thread.queue();

        let resource = queue
            .enqueue_and_wait(|context| {
                let mut resource = resource();
                resource.init_rhi(context);
                assert_eq!(resource.state(), ResourceState::Allocated);
                let allocated = resource.allocated_virtual_texture().unwrap();
                assert_eq!(allocated.physical_texture_size(1), 1024);

                // Acquiring again returns the existing allocation
                let id = resource.acquire_allocated_virtual_texture(context).unwrap().id;
                assert_eq!(id, AllocationId(2));

                resource.release_rhi(context);
                resource
            })
            .unwrap();

        assert_eq!(resource.state(), ResourceState::Released);
        assert!(!resource.producer_handle().is_valid());
        assert!(resource.allocated_virtual_texture().is_none());

        let handle = ProducerHandle::new(1, 1);
        assert_eq!(
            *calls.lock(),
            vec![
                Call::Register(handle),
                Call::Allocate(AllocationId(2), 2),
                Call::Destroy(AllocationId(2)),
                Call::Release(handle),
            ]
        );
    }

    #[test]
    fn test_release_is_idempotent() {
        let allocator = RecordingAllocator::default();
        let calls = allocator.calls.clone();
        let thread = spawn_render_thread(Box::new(allocator)).unwrap();

        thread
            .queue()
            .enqueue_and_wait(|context| {
                let mut resource = resource();
                resource.init_rhi(context);
                resource.release_rhi(context);
                resource.release_rhi(context);
            })
            .unwrap();

        assert_eq!(calls.lock().len(), 4);
    }

    #[test]
    fn test_allocation_failure_degrades() {
        let allocator = RecordingAllocator {
            fail_allocations: true,
            ..Default::default()
        };
        let calls = allocator.calls.clone();
        let thread = spawn_render_thread(Box::new(allocator)).unwrap();

        let state = thread
            .queue()
            .enqueue_and_wait(|context| {
                let mut resource = resource();
                resource.init_rhi(context);
                let state = resource.state();
                assert!(resource.allocated_virtual_texture().is_none());
                resource.release_rhi(context);
                state
            })
            .unwrap();

        assert_eq!(state, ResourceState::Registered);
        let handle = ProducerHandle::new(1, 1);
        assert_eq!(*calls.lock(), vec![Call::Register(handle), Call::Release(handle)]);
    }

    #[test]
    fn test_with_reference_system() {
        let thread = spawn_render_thread(Box::new(VirtualTextureSystem::default())).unwrap();

        let stats = thread
            .queue()
            .enqueue_and_wait(|context| {
                let mut resource = resource();
                resource.init_rhi(context);
                let live = context.stats();
                resource.release_rhi(context);
                (live, context.stats())
            })
            .unwrap();

        assert_eq!(stats.0, VirtualTextureStats { producers: 1, allocations: 1, spaces: 1 });
        assert_eq!(stats.1, VirtualTextureStats::default());
    }

    #[test]
    fn test_double_init_panics() {
        let thread = spawn_render_thread(Box::new(VirtualTextureSystem::default())).unwrap();

        let panicked = thread
            .queue()
            .enqueue_and_wait(|context| {
                let mut resource = resource();
                resource.init_rhi(context);
                let second = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    resource.init_rhi(context)
                }));
                resource.release_rhi(context);
                second.is_err()
            })
            .unwrap();

        assert!(panicked);
    }

    #[test]
    #[should_panic(expected = "outside the render thread")]
    fn test_context_off_render_thread_panics() {
        let _ = RenderContext::new(Box::new(VirtualTextureSystem::default()));
    }
}
