//! Runtime Virtual Texture Component
//!
//! Places a runtime virtual texture volume in the world. The component owns
//! the producer and keeps the asset initialized while it is registered.

use std::sync::Arc;

use parking_lot::Mutex;
use rvt_core::Transform;

use crate::RendererResult;
use crate::producer::{RuntimeVirtualTextureProducer, VirtualTexture};
use crate::runtime_virtual_texture::RuntimeVirtualTexture;

/// Shared handle to a runtime virtual texture asset
pub type SharedVirtualTexture = Arc<Mutex<RuntimeVirtualTexture>>;

/// Component binding a runtime virtual texture asset to a world volume
pub struct RuntimeVirtualTextureComponent {
    virtual_texture: Option<SharedVirtualTexture>,
    transform: Transform,
    producer: Option<Arc<RuntimeVirtualTextureProducer>>,
    registered: bool,
}

impl RuntimeVirtualTextureComponent {
    /// Create an unregistered component
    pub fn new(virtual_texture: Option<SharedVirtualTexture>, transform: Transform) -> Self {
        Self {
            virtual_texture,
            transform,
            producer: None,
            registered: false,
        }
    }

    /// Start rendering into the asset
    pub fn register(&mut self) -> RendererResult<()> {
        self.registered = true;
        self.initialize_texture()
    }

    /// Stop rendering and release the asset's resource
    pub fn unregister(&mut self) -> RendererResult<()> {
        if !self.registered {
            return Ok(());
        }
        self.registered = false;
        self.release_texture()
    }

    /// Move the volume. Re-initializes the asset while registered.
    pub fn set_transform(&mut self, transform: Transform) -> RendererResult<()> {
        self.transform = transform;
        if self.registered {
            self.initialize_texture()?;
        }
        Ok(())
    }

    /// Swap the asset rendered into
    pub fn set_virtual_texture(
        &mut self,
        virtual_texture: Option<SharedVirtualTexture>,
    ) -> RendererResult<()> {
        if self.registered {
            self.release_texture()?;
        }
        self.virtual_texture = virtual_texture;
        if self.registered {
            self.initialize_texture()?;
        }
        Ok(())
    }

    /// Apply edited asset properties
    pub fn post_edit_change(&mut self) -> RendererResult<()> {
        if self.registered {
            self.initialize_texture()?;
        }
        Ok(())
    }

    fn initialize_texture(&mut self) -> RendererResult<()> {
        let Some(virtual_texture) = &self.virtual_texture else {
            self.producer = None;
            return Ok(());
        };

        let mut virtual_texture = virtual_texture.lock();
        let properties = virtual_texture.properties();
        let producer = properties.enabled.then(|| {
            Arc::new(RuntimeVirtualTextureProducer::new(
                &virtual_texture.producer_description(),
                properties.material_type,
                self.transform,
            ))
        });

        let shared = producer.clone().map(|p| p as Arc<dyn VirtualTexture>);
        virtual_texture.initialize(shared, &self.transform)?;
        self.producer = producer;
        Ok(())
    }

    fn release_texture(&mut self) -> RendererResult<()> {
        if let Some(virtual_texture) = &self.virtual_texture {
            virtual_texture.lock().release()?;
        }
        self.producer = None;
        Ok(())
    }

    pub fn virtual_texture(&self) -> Option<&SharedVirtualTexture> {
        self.virtual_texture.as_ref()
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// Producer rendering pages for the asset, while registered
    pub fn producer(&self) -> Option<&Arc<RuntimeVirtualTextureProducer>> {
        self.producer.as_ref()
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }
}

impl Drop for RuntimeVirtualTextureComponent {
    fn drop(&mut self) {
        if let Err(err) = self.unregister() {
            log::error!("Failed to unregister runtime virtual texture component: {}", err);
        }
    }
}
