//! Material System
//!
//! Materials and instances with texture bindings, plus the dependency index
//! used to recache uniform expressions when a runtime virtual texture changes.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use parking_lot::RwLock;
use rvt_core::TextureId;

/// Material identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u64);

/// Material property types
#[derive(Debug, Clone, PartialEq)]
pub enum MaterialProperty {
    Float(f32),
    Vec4([f32; 4]),
    Texture(TextureBinding),
    Bool(bool),
}

/// Texture binding for materials
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureBinding {
    /// Texture asset ID
    pub texture_id: TextureId,
}

impl TextureBinding {
    /// Bind a texture
    pub fn new(texture_id: TextureId) -> Self {
        Self { texture_id }
    }
}

fn textures_in<'a>(
    properties: impl Iterator<Item = &'a MaterialProperty>,
) -> impl Iterator<Item = TextureId> {
    properties.filter_map(|property| match property {
        MaterialProperty::Texture(binding) => Some(binding.texture_id),
        _ => None,
    })
}

/// Material definition
#[derive(Debug, Clone)]
pub struct Material {
    /// Material name
    pub name: String,
    /// Material properties
    pub properties: AHashMap<String, MaterialProperty>,
    /// Bumped every time uniform expressions are recached
    uniform_expression_generation: u64,
}

impl Material {
    /// Create a new material
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: AHashMap::new(),
            uniform_expression_generation: 0,
        }
    }

    /// Set a property
    pub fn set_property(&mut self, name: impl Into<String>, value: MaterialProperty) {
        self.properties.insert(name.into(), value);
    }

    /// Get a property
    pub fn get_property(&self, name: &str) -> Option<&MaterialProperty> {
        self.properties.get(name)
    }

    /// Whether any property binds the texture
    pub fn references(&self, texture: TextureId) -> bool {
        textures_in(self.properties.values()).any(|id| id == texture)
    }

    /// Recompute uniform expressions, invalidating cached shader constants
    pub fn recache_uniform_expressions(&mut self) {
        self.uniform_expression_generation += 1;
    }

    /// Number of times uniform expressions were recached
    pub fn uniform_expression_generation(&self) -> u64 {
        self.uniform_expression_generation
    }
}

/// Material instance with per-instance overrides
#[derive(Debug, Clone)]
pub struct MaterialInstance {
    /// Instance name
    pub name: String,
    /// Parent material or instance
    pub parent: MaterialId,
    /// Instance-specific property overrides
    pub overrides: AHashMap<String, MaterialProperty>,
}

impl MaterialInstance {
    /// Create a new instance of a parent material
    pub fn new(name: impl Into<String>, parent: MaterialId) -> Self {
        Self {
            name: name.into(),
            parent,
            overrides: AHashMap::new(),
        }
    }

    /// Override a property
    pub fn set_override(&mut self, name: impl Into<String>, value: MaterialProperty) {
        self.overrides.insert(name.into(), value);
    }

    /// Whether any override binds the texture
    pub fn references(&self, texture: TextureId) -> bool {
        textures_in(self.overrides.values()).any(|id| id == texture)
    }
}

/// Finds the materials that must be recached when a texture changes
pub trait MaterialDependencyIndex: Send + Sync {
    /// Base materials referencing the texture directly or through an instance
    fn find_users_of(&self, texture: TextureId) -> Vec<MaterialId>;

    /// Recompute the uniform expressions of a base material
    fn recache_uniform_expressions(&self, material: MaterialId);
}

#[derive(Debug, Clone)]
enum Entry {
    Material(Material),
    Instance(MaterialInstance),
}

impl Entry {
    fn references(&self, texture: TextureId) -> bool {
        match self {
            Entry::Material(material) => material.references(texture),
            Entry::Instance(instance) => instance.references(texture),
        }
    }
}

/// Registry of every loaded material and material instance
#[derive(Default)]
pub struct MaterialRegistry {
    entries: RwLock<AHashMap<MaterialId, Entry>>,
    next_id: AtomicU64,
}

impl MaterialRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, entry: Entry) -> MaterialId {
        let id = MaterialId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.entries.write().insert(id, entry);
        id
    }

    /// Add a base material
    pub fn add_material(&self, material: Material) -> MaterialId {
        self.insert(Entry::Material(material))
    }

    /// Add a material instance
    pub fn add_instance(&self, instance: MaterialInstance) -> MaterialId {
        self.insert(Entry::Instance(instance))
    }

    /// Remove a material or instance
    pub fn remove(&self, id: MaterialId) -> bool {
        self.entries.write().remove(&id).is_some()
    }

    /// Number of materials and instances
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Resolve a material or instance to its base material
    pub fn base_material(&self, id: MaterialId) -> Option<MaterialId> {
        let entries = self.entries.read();
        Self::resolve_base(&entries, id)
    }

    fn resolve_base(entries: &AHashMap<MaterialId, Entry>, id: MaterialId) -> Option<MaterialId> {
        let mut current = id;
        // Bounded walk so a parent cycle cannot hang
        for _ in 0..=entries.len() {
            match entries.get(&current)? {
                Entry::Material(_) => return Some(current),
                Entry::Instance(instance) => current = instance.parent,
            }
        }
        None
    }

    /// Uniform expression generation of a base material
    pub fn uniform_expression_generation(&self, id: MaterialId) -> Option<u64> {
        match self.entries.read().get(&id)? {
            Entry::Material(material) => Some(material.uniform_expression_generation()),
            Entry::Instance(_) => None,
        }
    }
}

impl MaterialDependencyIndex for MaterialRegistry {
    fn find_users_of(&self, texture: TextureId) -> Vec<MaterialId> {
        let entries = self.entries.read();
        let users: BTreeSet<MaterialId> = entries
            .iter()
            .filter(|(_, entry)| entry.references(texture))
            .filter_map(|(&id, _)| Self::resolve_base(&entries, id))
            .collect();
        users.into_iter().collect()
    }

    fn recache_uniform_expressions(&self, material: MaterialId) {
        match self.entries.write().get_mut(&material) {
            Some(Entry::Material(material)) => material.recache_uniform_expressions(),
            Some(Entry::Instance(_)) => {
                log::warn!("Recache requested for material instance {:?}", material)
            }
            None => log::warn!("Recache requested for unknown material {:?}", material),
        }
    }
}
