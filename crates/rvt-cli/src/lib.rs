//! # rvt CLI
//!
//! Offline inspection of runtime virtual texture assets.
//!
//! ## Commands
//! - `describe` - Decoded sizes, producer layout and registry tags
//! - `pack` - Packed shader uniforms of an initialized asset
//! - `page` - View, passes and targets used to render one tile
//! - `morton` - Interleave a tile coordinate into a page address
//! - `unmorton` - Split a page address back into a tile coordinate

use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use rvt_core::math::UVec2;
use rvt_core::{TextureId, Transform, decode_morton2, encode_morton2};
use rvt_renderer::producer::{LayerMask, ProduceTargetLayer};
use rvt_renderer::{
    MaterialRegistry, ProducerHandle, RenderPageSetup, RuntimeVirtualTexture,
    RuntimeVirtualTextureComponent, RuntimeVirtualTextureProducer,
    RuntimeVirtualTextureProperties, VirtualTexture, VirtualTextureSettings,
    VirtualTextureSystem, spawn_render_thread,
};

/// Runtime virtual texture inspector
#[derive(Parser)]
#[command(name = "rvt")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Print the decoded layout of an asset
    Describe {
        /// Asset properties (JSON)
        asset: PathBuf,
    },

    /// Initialize an asset and print its packed uniforms
    Pack {
        /// Asset properties (JSON)
        asset: PathBuf,

        /// Virtual texture settings (JSON)
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Override the max anisotropy setting
        #[arg(long, allow_negative_numbers = true)]
        max_anisotropy: Option<i32>,
    },

    /// Print how one tile of an asset is rendered
    Page {
        /// Asset properties (JSON)
        asset: PathBuf,

        /// Mip level of the tile
        #[arg(short, long, default_value_t = 0)]
        level: u8,

        /// Tile coordinate at that level
        x: u32,
        y: u32,
    },

    /// Morton-encode a tile coordinate
    Morton {
        x: u32,
        y: u32,
    },

    /// Decode a Morton page address (decimal or 0x-prefixed hex)
    Unmorton {
        #[arg(value_parser = parse_address)]
        address: u32,
    },
}

fn parse_address(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|err| format!("invalid address '{value}': {err}"))
}

fn asset_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "RuntimeVirtualTexture".to_string())
}

fn load_properties(path: &Path) -> Result<RuntimeVirtualTextureProperties> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read asset {}", path.display()))?;
    RuntimeVirtualTextureProperties::from_json(&json)
        .with_context(|| format!("failed to parse asset {}", path.display()))
}

fn load_settings(
    path: Option<&Path>,
    max_anisotropy: Option<i32>,
) -> Result<VirtualTextureSettings> {
    let mut settings = match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read settings {}", path.display()))?;
            VirtualTextureSettings::from_json(&json)
                .with_context(|| format!("failed to parse settings {}", path.display()))?
        }
        None => VirtualTextureSettings::default(),
    };
    if let Some(max_anisotropy) = max_anisotropy {
        settings.max_anisotropy = max_anisotropy;
    }
    Ok(settings)
}

/// Human-readable layout of an asset
pub fn describe(name: &str, properties: &RuntimeVirtualTextureProperties) -> Result<String> {
    let mut out = String::new();
    write_description(&mut out, name, properties)?;
    Ok(out)
}

fn write_description(
    out: &mut String,
    name: &str,
    properties: &RuntimeVirtualTextureProperties,
) -> fmt::Result {
    let desc = properties.producer_description(name);

    writeln!(out, "{name}")?;
    writeln!(out, "  size:        {} x {}", properties.width(), properties.height())?;
    writeln!(
        out,
        "  tiles:       {} x {} of {} (+{} border)",
        desc.width_in_tiles, desc.height_in_tiles, desc.tile_size, desc.tile_border_size
    )?;
    writeln!(out, "  max level:   {}", desc.max_level)?;
    writeln!(out, "  material:    {:?}", properties.material_type)?;
    for (layer, format) in desc.layer_formats.iter().enumerate() {
        writeln!(out, "  layer {layer}:     {format} ({:?})", format.to_wgpu())?;
    }
    for (key, value) in properties.asset_registry_tags() {
        writeln!(out, "  tag {key} = {value}")?;
    }
    Ok(())
}

/// Initialize the asset against a reference system and format its uniforms
pub fn pack(
    name: &str,
    properties: RuntimeVirtualTextureProperties,
    settings: VirtualTextureSettings,
) -> Result<String> {
    let system = VirtualTextureSystem::new(settings.clone());
    let render_thread = spawn_render_thread(Box::new(system))?;
    let layer_count = properties.layer_count();

    let virtual_texture = Arc::new(Mutex::new(RuntimeVirtualTexture::new(
        TextureId(1),
        name,
        properties,
        render_thread.queue(),
        Arc::new(MaterialRegistry::new()),
    )));

    let mut component =
        RuntimeVirtualTextureComponent::new(Some(virtual_texture.clone()), Transform::IDENTITY);
    component.register()?;
    render_thread.queue().flush()?;

    let mut out = String::new();
    {
        let virtual_texture = virtual_texture.lock();
        anyhow::ensure!(
            virtual_texture.allocated_virtual_texture().is_some(),
            "'{name}' has no page-table allocation"
        );
        write_uniforms(&mut out, name, &virtual_texture, &settings, layer_count)?;
    }

    component.unregister()?;
    Ok(out)
}

fn write_uniforms(
    out: &mut String,
    name: &str,
    virtual_texture: &RuntimeVirtualTexture,
    settings: &VirtualTextureSettings,
    layer_count: usize,
) -> fmt::Result {
    if let Some(allocated) = virtual_texture.allocated_virtual_texture() {
        writeln!(
            out,
            "{name}: space {} address {:#x} page {}",
            allocated.space_id,
            allocated.virtual_address,
            allocated.page_coords()
        )?;
    }
    for (i, word) in virtual_texture.page_table_uniform(settings).iter().enumerate() {
        writeln!(
            out,
            "  page table {i}: {:08x} {:08x} {:08x} {:08x}",
            word.x, word.y, word.z, word.w
        )?;
    }
    for layer in 0..layer_count {
        let word = virtual_texture.layer_uniform(layer);
        writeln!(
            out,
            "  layer {layer}:      {:08x} {:08x} {:08x} {:08x}",
            word.x, word.y, word.z, word.w
        )?;
    }
    Ok(())
}

/// Produce one tile into the first physical slot of each layer and format
/// the resulting render setup
pub fn page(
    name: &str,
    properties: &RuntimeVirtualTextureProperties,
    level: u8,
    x: u32,
    y: u32,
) -> Result<String> {
    let desc = properties.producer_description(name);
    anyhow::ensure!(
        u32::from(level) <= desc.max_level,
        "level {level} is above the last level {}",
        desc.max_level
    );
    let width = (desc.width_in_tiles >> level).max(1);
    let height = (desc.height_in_tiles >> level).max(1);
    anyhow::ensure!(
        x < width && y < height,
        "tile ({x}, {y}) is outside the {width} x {height} tiles of level {level}"
    );

    let producer =
        RuntimeVirtualTextureProducer::new(&desc, properties.material_type, Transform::IDENTITY);
    let targets: Vec<_> = (0..desc.num_layers() as u32)
        .map(|layer| ProduceTargetLayer {
            page_location: UVec2::new(layer, 0),
        })
        .collect();
    producer.produce_page_data(
        ProducerHandle::default(),
        LayerMask::first(desc.num_layers()),
        level,
        encode_morton2(x, y),
        &targets,
    );

    let mut out = String::new();
    for setup in producer.take_page_setups() {
        write_page_setup(&mut out, &setup)?;
    }
    Ok(out)
}

fn write_page_setup(out: &mut String, setup: &RenderPageSetup) -> fmt::Result {
    let view = &setup.view;
    writeln!(out, "{:?} tile {}", setup.material_type, setup.texture_size)?;
    writeln!(out, "  look at:     {}", view.look_at)?;
    writeln!(out, "  origin:      {}", view.origin)?;
    writeln!(out, "  ortho:       {} x {}", view.ortho_width, view.ortho_height)?;
    writeln!(out, "  depth:       {} .. {}", view.near_plane, view.far_plane)?;
    writeln!(
        out,
        "  passes:      render {} compress {} copy {}",
        setup.render_pass, setup.compress_pass, setup.copy_pass
    )?;

    let groups = [
        ("render", &setup.render_targets[..]),
        ("compress", &setup.compress_targets[..]),
        ("copy", &setup.copy_targets[..]),
    ];
    for (pass, targets) in groups {
        for (i, target) in targets.iter().enumerate() {
            let srgb = if target.srgb { " sRGB" } else { "" };
            writeln!(out, "  {pass} {i}:    {}{srgb} {}", target.format, target.size)?;
        }
    }
    for output in &setup.outputs {
        writeln!(
            out,
            "  output {}:    {:?} -> {}",
            output.layer, output.source, output.dest_position
        )?;
    }
    Ok(())
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match cli.command {
        Commands::Describe { asset } => {
            let properties = load_properties(&asset)?;
            print!("{}", describe(&asset_name(&asset), &properties)?);
        }

        Commands::Pack {
            asset,
            settings,
            max_anisotropy,
        } => {
            let properties = load_properties(&asset)?;
            let settings = load_settings(settings.as_deref(), max_anisotropy)?;
            log::debug!("Packing with {:?}", settings);
            print!("{}", pack(&asset_name(&asset), properties, settings)?);
        }

        Commands::Page { asset, level, x, y } => {
            let properties = load_properties(&asset)?;
            print!("{}", page(&asset_name(&asset), &properties, level, x, y)?);
        }

        Commands::Morton { x, y } => {
            anyhow::ensure!(x < 4096 && y < 4096, "tile coordinates must be below 4096");
            println!("{:#x}", encode_morton2(x, y));
        }

        Commands::Unmorton { address } => {
            let tile = decode_morton2(address);
            println!("{} {}", tile.x, tile.y);
        }
    }

    Ok(())
}
