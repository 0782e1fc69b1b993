//! # RVT Core
//!
//! Core math shared by the runtime virtual texture crates.
//!
//! - **Morton coding**: 2D tile coordinates interleaved into page-table addresses
//! - **Bit helpers**: integer log2 and raw IEEE-754 packing for GPU uniforms
//! - **Transform**: scale/rotation/translation used to place a virtual texture volume

pub mod math;
pub mod transform;

pub use math::{
    Box2, ceil_log2, decode_morton2, encode_morton2, floor_log2, morton_code2, pack_float_bits,
    reverse_morton_code2, unpack_float_bits,
};
pub use transform::Transform;

/// Identifier of a texture asset, shared by materials and virtual textures
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct TextureId(pub u64);

impl TextureId {
    /// Get the raw ID value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TextureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
