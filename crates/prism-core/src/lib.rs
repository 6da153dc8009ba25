//! Core types and traits for the Prism engine.
//!
//! This crate provides the foundational types shared by the raster and
//! ray-traced renderers:
//! - Scene snapshot model consumed from the external scene graph
//! - Closed material model
//! - Mesh data and bounds
//! - Selection id encoding used by picking
//! - Runtime render settings

pub mod camera;
pub mod error;
pub mod ids;
pub mod material;
pub mod math;
pub mod mesh;
pub mod scene;
pub mod selection;
pub mod settings;

pub use camera::Camera;
pub use error::{Error, Result};
pub use ids::{EnvironmentKey, MaterialId, MeshId, ObjectId, TextureId};
pub use material::{
    EmissiveMaterial, LambertMaterial, Material, MaterialKind, PbrMaterial, ShadingParams,
};
pub use math::Aabb;
pub use mesh::{MeshData, Vertex};
pub use scene::{
    DirectionalLight, PointLight, SceneObject, SceneObjectFlags, SceneSnapshot, SceneSource,
    SharedScene,
};
pub use selection::{Axis, PickResult, SelectionId};
pub use settings::{OutputFormat, RenderSettings};

/// Engine-wide constants
pub mod constants {
    /// Number of frame slots cycled by the raster frame loop.
    pub const FRAMES_IN_FLIGHT: usize = 3;
    /// Number of faces in a cubemap.
    pub const CUBE_FACES: u32 = 6;
    /// Maximum ray recursion depth the path tracer pipeline requires.
    pub const RAY_RECURSION_DEPTH: u32 = 2;
    /// Size of the shared bindless texture array.
    pub const MAX_TEXTURES: u32 = 64;
}
