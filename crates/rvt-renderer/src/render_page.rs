//! Page Rendering Setup
//!
//! Resolves a [`PageRenderRequest`] into what the GPU needs to draw one
//! virtual texture tile: an orthographic view looking down the volume's Z
//! axis onto the tile's UV range, the passes to run, the intermediate
//! targets each pass writes, and the final copies into the physical pool.
//!
//! Materials are drawn into uncompressed BGRA targets. When the pool is
//! block compressed a compress pass packs each 4x4 block into one texel of
//! an integer target, which is then copied into the pool texture. The
//! specular variant stores its second layer uncompressed with a different
//! channel layout, so it goes through a copy pass instead.

use glam::{Mat4, UVec2, Vec3, Vec4};
use smallvec::{SmallVec, smallvec};

use crate::producer::PageRenderRequest;
use crate::runtime_virtual_texture::RuntimeVirtualTextureMaterialType;
use crate::texture::PixelFormat;

/// Orthographic camera for one tile
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageView {
    /// World position at the tile's UV center, on the volume's mid plane
    pub look_at: Vec3,
    /// Camera position on the top face of the volume
    pub origin: Vec3,
    /// World-to-view rotation; view space looks along +Z with +Y down
    pub view_rotation: Mat4,
    /// Half width of the view, in world units
    pub ortho_width: f32,
    /// Half height of the view, in world units
    pub ortho_height: f32,
    pub near_plane: f32,
    pub far_plane: f32,
    /// Reversed-Z orthographic projection: near maps to 1, far to 0
    pub projection: Mat4,
}

impl PageView {
    fn new(request: &PageRenderRequest) -> Self {
        let uv_to_world = &request.uv_to_world;
        let uv_center = request.uv_range.center();
        let uv_extent = request.uv_range.extent();

        let look_at = uv_to_world.transform_point(uv_center.extend(0.0));
        let half_z = uv_to_world.scale.z;
        let origin = look_at + half_z * uv_to_world.unit_axis_z();

        let scaled_x = uv_to_world.unit_axis_x() * uv_to_world.scale.x;
        let scaled_y = uv_to_world.unit_axis_y() * uv_to_world.scale.y;
        let ortho_width = scaled_x.length() * uv_extent.x;
        let ortho_height = scaled_y.length() * uv_extent.y;

        let view_rotation = Mat4::from_diagonal(Vec4::new(1.0, -1.0, -1.0, 1.0))
            * Mat4::from_quat(uv_to_world.rotation.inverse());

        let near_plane = 0.0;
        let far_plane = half_z * 2.0;
        let depth_range = far_plane - near_plane;
        // A flat volume has no depth to map
        let z_scale = if depth_range > 0.0 { 1.0 / depth_range } else { 0.0 };
        let projection = reversed_z_ortho(ortho_width, ortho_height, z_scale, -near_plane);

        Self {
            look_at,
            origin,
            view_rotation,
            ortho_width,
            ortho_height,
            near_plane,
            far_plane,
            projection,
        }
    }

    /// World-to-view transform
    pub fn view_matrix(&self) -> Mat4 {
        self.view_rotation * Mat4::from_translation(-self.origin)
    }

    /// World-to-clip transform
    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view_matrix()
    }
}

fn reversed_z_ortho(width: f32, height: f32, z_scale: f32, z_offset: f32) -> Mat4 {
    let inv_width = if width != 0.0 { 1.0 / width } else { 0.0 };
    let inv_height = if height != 0.0 { 1.0 / height } else { 0.0 };
    Mat4::from_cols(
        Vec4::new(inv_width, 0.0, 0.0, 0.0),
        Vec4::new(0.0, inv_height, 0.0, 0.0),
        Vec4::new(0.0, 0.0, -z_scale, 0.0),
        Vec4::new(0.0, 0.0, 1.0 - z_offset * z_scale, 1.0),
    )
}

/// A transient texture written by one of the page passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntermediateTarget {
    pub format: PixelFormat,
    /// Size in texels
    pub size: UVec2,
    /// Written with sRGB encoding
    pub srgb: bool,
}

impl IntermediateTarget {
    fn linear(format: PixelFormat, size: UVec2) -> Self {
        Self {
            format,
            size,
            srgb: false,
        }
    }
}

/// Intermediate texture holding a layer's final texels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    /// Index into [`RenderPageSetup::render_targets`]
    Render(usize),
    /// Index into [`RenderPageSetup::compress_targets`]
    Compress(usize),
    /// Index into [`RenderPageSetup::copy_targets`]
    Copy(usize),
}

/// Final copy of one layer into its physical pool texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOutput {
    pub layer: usize,
    pub source: OutputSource,
    /// Top-left texel of the destination in the pool texture
    pub dest_position: UVec2,
}

/// Everything needed to render one tile
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPageSetup {
    pub material_type: RuntimeVirtualTextureMaterialType,
    /// Size of the rendered tile, border included
    pub texture_size: UVec2,
    pub view: PageView,
    /// Draw the material into the render targets
    pub render_pass: bool,
    /// Block-compress the render targets
    pub compress_pass: bool,
    /// Repack the specular layer without compression
    pub copy_pass: bool,
    pub render_targets: SmallVec<[IntermediateTarget; 3]>,
    pub compress_targets: SmallVec<[IntermediateTarget; 2]>,
    pub copy_targets: SmallVec<[IntermediateTarget; 1]>,
    /// One entry per requested layer that has a source
    pub outputs: SmallVec<[PageOutput; 2]>,
}

/// Resolve the view, passes and targets for a page render request.
///
/// Nothing is rendered unless layer 0 is requested. Whether to compress is
/// decided by the format of layer 0 alone.
pub fn render_page_setup(request: &PageRenderRequest) -> RenderPageSetup {
    use RuntimeVirtualTextureMaterialType::*;

    let material_type = request.material_type;
    let layer_0 = request.target(0);
    let texture_size = layer_0.map_or(UVec2::ZERO, |target| target.dest_box.size().as_uvec2());

    let render_pass = layer_0.is_some();
    let compress_pass = layer_0.is_some_and(|target| target.format.is_compressed());
    let copy_pass = render_pass && !compress_pass && material_type == BaseColorNormalSpecular;

    let mut render_targets = SmallVec::new();
    if render_pass {
        let bgra = IntermediateTarget::linear(PixelFormat::B8G8R8A8, texture_size);
        render_targets.push(IntermediateTarget { srgb: true, ..bgra });
        match material_type {
            BaseColor => {}
            BaseColorNormal => render_targets.push(bgra),
            BaseColorNormalSpecular => render_targets.extend([bgra, bgra]),
        }
    }

    let mut compress_targets = SmallVec::new();
    if compress_pass {
        let block_size = texture_size / 4;
        compress_targets.push(IntermediateTarget::linear(PixelFormat::R32G32Uint, block_size));
        if material_type != BaseColor {
            compress_targets.push(IntermediateTarget::linear(
                PixelFormat::R32G32B32A32Uint,
                block_size,
            ));
        }
    }

    let copy_targets = if copy_pass {
        smallvec![IntermediateTarget::linear(PixelFormat::B8G8R8A8, texture_size)]
    } else {
        SmallVec::new()
    };

    let source = |layer: usize| -> Option<OutputSource> {
        if !render_pass {
            return None;
        }
        match (layer, material_type) {
            (0, _) if compress_pass => Some(OutputSource::Compress(0)),
            (0, _) => Some(OutputSource::Render(0)),
            (1, BaseColorNormal | BaseColorNormalSpecular) if compress_pass => {
                Some(OutputSource::Compress(1))
            }
            (1, BaseColorNormal) => Some(OutputSource::Render(1)),
            (1, BaseColorNormalSpecular) if copy_pass => Some(OutputSource::Copy(0)),
            _ => None,
        }
    };

    let outputs = request
        .targets
        .iter()
        .filter_map(|target| {
            source(target.layer).map(|source| PageOutput {
                layer: target.layer,
                source,
                dest_position: target.dest_box.min.as_uvec2(),
            })
        })
        .collect();

    RenderPageSetup {
        material_type,
        texture_size,
        view: PageView::new(request),
        render_pass,
        compress_pass,
        copy_pass,
        render_targets,
        compress_targets,
        copy_targets,
        outputs,
    }
}
