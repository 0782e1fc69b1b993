//! Runtime Virtual Texture Asset
//!
//! Game-thread configuration of a runtime virtual texture, and the lifecycle
//! of the render resource backing it.

use std::sync::Arc;

use glam::{UVec4, Vec4};
use parking_lot::Mutex;
use rvt_core::{TextureId, Transform, ceil_log2};
use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};

use crate::allocator::AllocatedVirtualTexture;
use crate::material::MaterialDependencyIndex;
use crate::producer::VirtualTexture;
use crate::render_resource::{RenderQueue, RuntimeVirtualTextureRenderResource};
use crate::texture::{PixelFormat, VtProducerDescription};
use crate::uniform::{pack_page_table_uniform, pack_uniform};
use crate::{RendererResult, VirtualTextureSettings};

/// Material outputs stored in a runtime virtual texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RuntimeVirtualTextureMaterialType {
    /// Base color only
    BaseColor,
    /// Base color and normal
    #[default]
    #[serde(rename = "BaseColor_Normal")]
    BaseColorNormal,
    /// Base color, normal, roughness and specular
    #[serde(rename = "BaseColor_Normal_Specular")]
    BaseColorNormalSpecular,
}

impl RuntimeVirtualTextureMaterialType {
    /// Physical formats of each layer
    pub fn layer_formats(self, compress: bool) -> SmallVec<[PixelFormat; 2]> {
        let pick = |compressed| if compress { compressed } else { PixelFormat::B8G8R8A8 };
        match self {
            Self::BaseColor => smallvec![pick(PixelFormat::Dxt1)],
            Self::BaseColorNormal => smallvec![pick(PixelFormat::Dxt1), pick(PixelFormat::Bc5)],
            Self::BaseColorNormalSpecular => {
                smallvec![pick(PixelFormat::Dxt1), pick(PixelFormat::Dxt5)]
            }
        }
    }
}

fn enabled_default() -> bool {
    true
}

/// Persisted configuration of a runtime virtual texture.
///
/// Sizes are stored as small biased integers. Always read them through the
/// decoding getters, which keep the real sizes powers of two and bounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeVirtualTextureProperties {
    pub material_type: RuntimeVirtualTextureMaterialType,
    pub compress_textures: bool,
    /// Decodes to `1 << clamp(width + 10, 10, 18)`
    pub width: i32,
    /// Decodes to `1 << clamp(height + 10, 10, 18)`
    pub height: i32,
    /// Decodes to `1 << clamp(tile_size + 6, 6, 10)`
    pub tile_size: i32,
    /// Decodes to `2 * clamp(tile_border_size, 0, 4)`
    pub tile_border_size: i32,
    pub remove_low_mips: i32,
    /// Debug toggle, never persisted
    #[serde(skip, default = "enabled_default")]
    pub enabled: bool,
}

impl Default for RuntimeVirtualTextureProperties {
    fn default() -> Self {
        Self {
            material_type: RuntimeVirtualTextureMaterialType::default(),
            compress_textures: true,
            width: 6,
            height: 6,
            tile_size: 2,
            tile_border_size: 2,
            remove_low_mips: 0,
            enabled: true,
        }
    }
}

impl RuntimeVirtualTextureProperties {
    /// Width in texels, in [1024, 262144]
    pub fn width(&self) -> u32 {
        1 << (self.width.saturating_add(10)).clamp(10, 18)
    }

    /// Height in texels, in [1024, 262144]
    pub fn height(&self) -> u32 {
        1 << (self.height.saturating_add(10)).clamp(10, 18)
    }

    /// Larger of width and height
    pub fn size(&self) -> u32 {
        self.width().max(self.height())
    }

    /// Tile size in texels, in [64, 1024]
    pub fn tile_size(&self) -> u32 {
        1 << (self.tile_size.saturating_add(6)).clamp(6, 10)
    }

    /// Border texels per tile side, one of {0, 2, 4, 6, 8}
    pub fn tile_border_size(&self) -> u32 {
        2 * self.tile_border_size.clamp(0, 4) as u32
    }

    pub fn width_in_tiles(&self) -> u32 {
        self.width() / self.tile_size()
    }

    pub fn height_in_tiles(&self) -> u32 {
        self.height() / self.tile_size()
    }

    /// Number of mip levels below the top one, never less than 1
    pub fn max_level(&self) -> u32 {
        let natural = ceil_log2(self.width_in_tiles().max(self.height_in_tiles())) as i32;
        natural.saturating_sub(self.remove_low_mips).max(1) as u32
    }

    /// Number of physical layers
    pub fn layer_count(&self) -> usize {
        self.layer_formats().len()
    }

    /// Physical format of a layer
    pub fn layer_format(&self, layer: usize) -> Option<PixelFormat> {
        self.layer_formats().get(layer).copied()
    }

    fn layer_formats(&self) -> SmallVec<[PixelFormat; 2]> {
        self.material_type.layer_formats(self.compress_textures)
    }

    /// Layout handed to the allocator when the producer is registered
    pub fn producer_description(&self, name: &str) -> VtProducerDescription {
        VtProducerDescription {
            name: name.to_string(),
            dimensions: 2,
            tile_size: self.tile_size(),
            tile_border_size: self.tile_border_size(),
            width_in_tiles: self.width_in_tiles(),
            height_in_tiles: self.height_in_tiles(),
            max_level: self.max_level(),
            layer_formats: self.layer_formats(),
        }
    }

    /// Searchable metadata, from the decoded sizes
    pub fn asset_registry_tags(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Width", self.width().to_string()),
            ("Height", self.height().to_string()),
            ("TileSize", self.tile_size().to_string()),
            ("TileBorderSize", self.tile_border_size().to_string()),
        ]
    }

    /// Load from JSON; missing fields keep their defaults
    pub fn from_json(json: &str) -> RendererResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Save as pretty-printed JSON
    pub fn to_json(&self) -> RendererResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// A runtime virtual texture asset.
///
/// Owns at most one render resource at a time. The resource is created by
/// [`Self::initialize`] and destroyed by [`Self::release`], re-initialization,
/// or drop; destruction blocks until the render thread has released it.
pub struct RuntimeVirtualTexture {
    id: TextureId,
    name: String,
    properties: RuntimeVirtualTextureProperties,
    world_to_uv: [Vec4; 3],
    resource: Option<Arc<Mutex<RuntimeVirtualTextureRenderResource>>>,
    render_queue: RenderQueue,
    materials: Arc<dyn MaterialDependencyIndex>,
}

impl RuntimeVirtualTexture {
    /// Create an asset with no render resource
    pub fn new(
        id: TextureId,
        name: impl Into<String>,
        properties: RuntimeVirtualTextureProperties,
        render_queue: RenderQueue,
        materials: Arc<dyn MaterialDependencyIndex>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            properties,
            world_to_uv: [Vec4::ZERO; 3],
            resource: None,
            render_queue,
            materials,
        }
    }

    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &RuntimeVirtualTextureProperties {
        &self.properties
    }

    /// Edit the properties. Takes effect on the next [`Self::initialize`].
    pub fn properties_mut(&mut self) -> &mut RuntimeVirtualTextureProperties {
        &mut self.properties
    }

    pub fn width(&self) -> u32 {
        self.properties.width()
    }

    pub fn height(&self) -> u32 {
        self.properties.height()
    }

    pub fn tile_size(&self) -> u32 {
        self.properties.tile_size()
    }

    pub fn tile_border_size(&self) -> u32 {
        self.properties.tile_border_size()
    }

    /// Layout handed to the allocator when the producer is registered
    pub fn producer_description(&self) -> VtProducerDescription {
        self.properties.producer_description(&self.name)
    }

    /// Rebuild the render resource for a new producer and volume placement.
    ///
    /// Any existing resource is fully released first. A `None` producer
    /// leaves the asset without a resource.
    pub fn initialize(
        &mut self,
        producer: Option<Arc<dyn VirtualTexture>>,
        box_to_world: &Transform,
    ) -> RendererResult<()> {
        let scale = box_to_world.scale;
        self.world_to_uv = [
            box_to_world.position.extend(1.0),
            (box_to_world.unit_axis_x() / scale.x).extend(0.0),
            (box_to_world.unit_axis_y() / scale.y).extend(0.0),
        ];

        self.release_resource()?;
        self.init_resource(producer)?;
        log::debug!("Initialized runtime virtual texture '{}'", self.name);

        self.notify_materials();
        Ok(())
    }

    /// Release the render resource and tell dependent materials
    pub fn release(&mut self) -> RendererResult<()> {
        self.release_resource()?;
        log::debug!("Released runtime virtual texture '{}'", self.name);

        self.notify_materials();
        Ok(())
    }

    fn init_resource(&mut self, producer: Option<Arc<dyn VirtualTexture>>) -> RendererResult<()> {
        assert!(
            self.resource.is_none(),
            "runtime virtual texture '{}' already has a render resource",
            self.name
        );

        let Some(producer) = producer else {
            return Ok(());
        };

        let resource = Arc::new(Mutex::new(RuntimeVirtualTextureRenderResource::new(
            self.producer_description(),
            producer,
        )));
        let render_resource = resource.clone();
        self.render_queue
            .enqueue(move |context| render_resource.lock().init_rhi(context))?;

        self.resource = Some(resource);
        Ok(())
    }

    fn release_resource(&mut self) -> RendererResult<()> {
        let Some(resource) = self.resource.take() else {
            return Ok(());
        };

        self.render_queue
            .enqueue(move |context| resource.lock().release_rhi(context))?;
        // Nothing on the render thread may still reference the resource
        self.render_queue.flush()?;
        Ok(())
    }

    /// Whether a render resource is live
    pub fn has_resource(&self) -> bool {
        self.resource.is_some()
    }

    /// Page-table allocation as of the last render command that ran
    pub fn allocated_virtual_texture(&self) -> Option<AllocatedVirtualTexture> {
        self.resource
            .as_ref()?
            .lock()
            .allocated_virtual_texture()
            .cloned()
    }

    /// World-to-UV vector read by material shaders: origin, U axis, V axis.
    /// Panics if `index >= 3`.
    pub fn uniform_parameter(&self, index: usize) -> Vec4 {
        assert!(index < 3, "uniform parameter index {index} out of range");
        self.world_to_uv[index]
    }

    /// Packed page-table words, zero without an allocation
    pub fn page_table_uniform(&self, settings: &VirtualTextureSettings) -> [UVec4; 2] {
        pack_page_table_uniform(self.allocated_virtual_texture().as_ref(), settings.max_anisotropy)
    }

    /// Packed physical texture word of a layer, zero without backing
    pub fn layer_uniform(&self, layer: usize) -> UVec4 {
        pack_uniform(self.allocated_virtual_texture().as_ref(), layer)
    }

    /// Recache every material sampling this texture
    pub fn notify_materials(&self) {
        let users = self.materials.find_users_of(self.id);
        for &material in &users {
            self.materials.recache_uniform_expressions(material);
        }
        log::debug!(
            "Recached {} material(s) using runtime virtual texture '{}'",
            users.len(),
            self.name
        );
    }
}

impl Drop for RuntimeVirtualTexture {
    fn drop(&mut self) {
        if let Err(err) = self.release_resource() {
            log::error!(
                "Failed to release runtime virtual texture '{}': {}",
                self.name,
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::VirtualTextureStats;
    use crate::material::{Material, MaterialProperty, MaterialRegistry, TextureBinding};
    use crate::render_resource::tests::NullProducer;
    use crate::render_resource::{RenderContext, spawn_render_thread};
    use crate::{RendererError, VirtualTextureSystem};
    use glam::{Quat, Vec3};
    use rvt_platform::RenderThread;

    const ID: TextureId = TextureId(7);

    struct Fixture {
        thread: RenderThread<RenderContext>,
        materials: Arc<MaterialRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                thread: spawn_render_thread(Box::new(VirtualTextureSystem::default())).unwrap(),
                materials: Arc::new(MaterialRegistry::new()),
            }
        }

        fn asset(&self, properties: RuntimeVirtualTextureProperties) -> RuntimeVirtualTexture {
            let queue = self.thread.queue();
            RuntimeVirtualTexture::new(ID, "Landscape", properties, queue, self.materials.clone())
        }

        fn live_stats() -> VirtualTextureStats {
            VirtualTextureStats {
                producers: 1,
                allocations: 1,
                spaces: 1,
            }
        }

        fn stats(&self) -> VirtualTextureStats {
            self.thread.queue().enqueue_and_wait(|context| context.stats()).unwrap()
        }

        fn flush(&self) {
            self.thread.queue().flush().unwrap();
        }
    }

    fn producer() -> Option<Arc<dyn VirtualTexture>> {
        Some(Arc::new(NullProducer))
    }

    #[test]
    fn test_default_properties_decode() {
        let properties = RuntimeVirtualTextureProperties::default();
        assert_eq!(properties.width(), 65536);
        assert_eq!(properties.height(), 65536);
        assert_eq!(properties.tile_size(), 256);
        assert_eq!(properties.tile_border_size(), 4);
        assert_eq!(properties.width_in_tiles(), 256);
        assert_eq!(properties.max_level(), 8);
        assert!(properties.enabled);
    }

    #[test]
    fn test_getter_clamps() {
        let mut properties = RuntimeVirtualTextureProperties {
            width: 0,
            height: 8,
            tile_size: 0,
            tile_border_size: 0,
            ..Default::default()
        };
        assert_eq!(properties.width(), 1024);
        assert_eq!(properties.height(), 262144);
        assert_eq!(properties.size(), 262144);
        assert_eq!(properties.tile_size(), 64);
        assert_eq!(properties.tile_border_size(), 0);

        properties.width = -5;
        properties.height = 100;
        properties.tile_size = 9;
        properties.tile_border_size = 7;
        assert_eq!(properties.width(), 1024);
        assert_eq!(properties.height(), 262144);
        assert_eq!(properties.tile_size(), 1024);
        assert_eq!(properties.tile_border_size(), 8);
    }

    #[test]
    fn test_sizes_are_powers_of_two_and_tile_evenly() {
        for width in 0..=8 {
            for tile_size in 0..=4 {
                let properties = RuntimeVirtualTextureProperties {
                    width,
                    height: 8 - width,
                    tile_size,
                    ..Default::default()
                };
                assert!(properties.width().is_power_of_two());
                assert!(properties.tile_size().is_power_of_two());
                assert_eq!(properties.width() % properties.tile_size(), 0);
                let tiled_width = properties.width_in_tiles() * properties.tile_size();
                assert_eq!(tiled_width, properties.width());
            }
        }
    }

    #[test]
    fn test_max_level_never_below_one() {
        let properties = RuntimeVirtualTextureProperties {
            width: 6,
            tile_size: 2,
            remove_low_mips: 3,
            ..Default::default()
        };
        assert_eq!(properties.max_level(), 5);

        let properties = RuntimeVirtualTextureProperties {
            width: 0,
            height: 0,
            tile_size: 4,
            remove_low_mips: 6,
            ..Default::default()
        };
        assert_eq!(properties.width_in_tiles(), 1);
        assert_eq!(properties.max_level(), 1);

        let properties = RuntimeVirtualTextureProperties {
            remove_low_mips: i32::MAX,
            ..Default::default()
        };
        assert_eq!(properties.max_level(), 1);
    }

    #[test]
    fn test_layer_formats() {
        let mut properties = RuntimeVirtualTextureProperties {
            material_type: RuntimeVirtualTextureMaterialType::BaseColorNormalSpecular,
            compress_textures: true,
            ..Default::default()
        };
        assert_eq!(properties.layer_count(), 2);
        assert_eq!(properties.layer_format(0), Some(PixelFormat::Dxt1));
        assert_eq!(properties.layer_format(1), Some(PixelFormat::Dxt5));
        assert_eq!(properties.layer_format(2), None);

        properties.material_type = RuntimeVirtualTextureMaterialType::BaseColor;
        assert_eq!(properties.layer_count(), 1);

        properties.material_type = RuntimeVirtualTextureMaterialType::BaseColorNormal;
        properties.compress_textures = false;
        assert_eq!(properties.layer_format(0), Some(PixelFormat::B8G8R8A8));
        assert_eq!(properties.layer_format(1), Some(PixelFormat::B8G8R8A8));
    }

    #[test]
    fn test_producer_description_is_deterministic() {
        let properties = RuntimeVirtualTextureProperties::default();
        let a = properties.producer_description("Landscape");
        let b = properties.producer_description("Landscape");
        assert_eq!(a, b);
        assert_eq!(a.dimensions, 2);
        assert_eq!(a.width_in_tiles, 256);
        assert_eq!(a.height_in_tiles, 256);
        assert_eq!(a.layer_formats.as_slice(), &[PixelFormat::Dxt1, PixelFormat::Bc5]);
    }

    #[test]
    fn test_asset_registry_tags() {
        let tags = RuntimeVirtualTextureProperties::default().asset_registry_tags();
        assert_eq!(
            tags,
            vec![
                ("Width", "65536".to_string()),
                ("Height", "65536".to_string()),
                ("TileSize", "256".to_string()),
                ("TileBorderSize", "4".to_string()),
            ]
        );
    }

    #[test]
    fn test_properties_json() {
        let properties = RuntimeVirtualTextureProperties::from_json(
            r#"{ "material_type": "BaseColor_Normal_Specular", "width": 2, "enabled": false }"#,
        )
        .unwrap();
        assert_eq!(
            properties.material_type,
            RuntimeVirtualTextureMaterialType::BaseColorNormalSpecular
        );
        assert_eq!(properties.width(), 4096);
        assert_eq!(properties.tile_size(), 256);
        assert!(properties.enabled);

        let json = properties.to_json().unwrap();
        assert!(!json.contains("enabled"));
        assert_eq!(RuntimeVirtualTextureProperties::from_json(&json).unwrap(), properties);

        assert!(matches!(
            RuntimeVirtualTextureProperties::from_json(r#"{ "material_type": "Emissive" }"#),
            Err(RendererError::Serialization(_))
        ));
    }

    #[test]
    fn test_initialize_and_release() {
        let fixture = Fixture::new();
        let mut asset = fixture.asset(RuntimeVirtualTextureProperties::default());

        asset.initialize(producer(), &Transform::IDENTITY).unwrap();
        fixture.flush();

        let allocated = asset.allocated_virtual_texture().unwrap();
        assert_eq!(allocated.width_in_tiles, 256);
        assert_eq!(allocated.max_level, 8);
        assert_eq!(fixture.stats(), Fixture::live_stats());

        asset.release().unwrap();
        assert!(!asset.has_resource());
        assert!(asset.allocated_virtual_texture().is_none());
        assert_eq!(fixture.stats(), VirtualTextureStats::default());

        // Re-initializing after release registers afresh
        asset.initialize(producer(), &Transform::IDENTITY).unwrap();
        assert_eq!(fixture.stats().producers, 1);
    }

    #[test]
    fn test_initialize_twice_keeps_one_resource() {
        let fixture = Fixture::new();
        let mut asset = fixture.asset(RuntimeVirtualTextureProperties::default());

        asset.initialize(producer(), &Transform::IDENTITY).unwrap();
        asset.initialize(producer(), &Transform::IDENTITY).unwrap();

        assert_eq!(fixture.stats(), Fixture::live_stats());
    }

    #[test]
    fn test_null_producer_has_no_resource() {
        let fixture = Fixture::new();
        let mut asset = fixture.asset(RuntimeVirtualTextureProperties::default());

        asset.initialize(None, &Transform::IDENTITY).unwrap();
        assert!(!asset.has_resource());
        assert!(asset.allocated_virtual_texture().is_none());
        assert_eq!(asset.page_table_uniform(&VirtualTextureSettings::default()), [UVec4::ZERO; 2]);
        assert_eq!(asset.layer_uniform(0), UVec4::ZERO);
        assert_eq!(fixture.stats(), VirtualTextureStats::default());
    }

    #[test]
    fn test_drop_releases_resource() {
        let fixture = Fixture::new();
        {
            let mut asset = fixture.asset(RuntimeVirtualTextureProperties::default());
            asset.initialize(producer(), &Transform::IDENTITY).unwrap();
        }
        assert_eq!(fixture.stats(), VirtualTextureStats::default());
    }

    #[test]
    fn test_packed_uniforms() {
        let fixture = Fixture::new();
        let mut asset = fixture.asset(RuntimeVirtualTextureProperties::default());
        asset.initialize(producer(), &Transform::IDENTITY).unwrap();
        fixture.flush();

        let [word0, word1] = asset.page_table_uniform(&VirtualTextureSettings::default());
        assert_eq!(word0.z, 256);
        assert_eq!(word0.w, 256);
        // Anisotropy 8 clamped to the 4 texel border
        assert_eq!(word1.x, 2);
        assert_eq!(word1.y >> 24, 8);
        assert_eq!(word1.z, 8);

        assert_ne!(asset.layer_uniform(1), UVec4::ZERO);
        assert_eq!(asset.layer_uniform(2), UVec4::ZERO);
    }

    #[test]
    fn test_world_to_uv_parameters() {
        let fixture = Fixture::new();
        let mut asset = fixture.asset(RuntimeVirtualTextureProperties::default());
        let box_to_world = Transform::new(
            Vec3::new(100.0, 200.0, 0.0),
            Quat::from_rotation_z(std::f32::consts::FRAC_PI_2),
            Vec3::new(1000.0, 500.0, 10.0),
        );

        asset.initialize(None, &box_to_world).unwrap();

        assert_eq!(asset.uniform_parameter(0), Vec4::new(100.0, 200.0, 0.0, 1.0));
        let u = asset.uniform_parameter(1);
        let v = asset.uniform_parameter(2);
        assert!((u - Vec4::new(0.0, 0.001, 0.0, 0.0)).abs().max_element() < 1e-6);
        assert!((v - Vec4::new(-0.002, 0.0, 0.0, 0.0)).abs().max_element() < 1e-6);

        // A world point maps into [0, 1] UV space
        let corner = box_to_world.transform_point(Vec3::new(1.0, 1.0, 0.0)).extend(1.0);
        let offset = corner - asset.uniform_parameter(0);
        assert!((offset.dot(u) - 1.0).abs() < 1e-4);
        assert!((offset.dot(v) - 1.0).abs() < 1e-4);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_uniform_parameter_bounds() {
        let fixture = Fixture::new();
        let asset = fixture.asset(RuntimeVirtualTextureProperties::default());
        asset.uniform_parameter(3);
    }

    #[test]
    fn test_materials_notified() {
        let fixture = Fixture::new();
        let mut material = Material::new("Terrain");
        material.set_property("rvt", MaterialProperty::Texture(TextureBinding::new(ID)));
        let user = fixture.materials.add_material(material);
        let other = fixture.materials.add_material(Material::new("Other"));

        let mut asset = fixture.asset(RuntimeVirtualTextureProperties::default());
        asset.initialize(producer(), &Transform::IDENTITY).unwrap();
        asset.release().unwrap();

        assert_eq!(fixture.materials.uniform_expression_generation(user), Some(2));
        assert_eq!(fixture.materials.uniform_expression_generation(other), Some(0));
    }
}
