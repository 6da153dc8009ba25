//! Closed material model.
//!
//! Every consumer (batching, GPU block packing, ray-traced shading) matches on
//! [`Material`] exhaustively, so adding a kind is a compiler-checked change.

use serde::{Deserialize, Serialize};

use crate::ids::TextureId;

/// Physically based metallic/roughness material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PbrMaterial {
    pub base_color: [f32; 4],
    pub metallic: f32,
    pub roughness: f32,
    #[serde(skip)]
    pub albedo_texture: Option<TextureId>,
    #[serde(skip)]
    pub metallic_roughness_texture: Option<TextureId>,
}

impl Default for PbrMaterial {
    fn default() -> Self {
        Self {
            base_color: [0.8, 0.8, 0.8, 1.0],
            metallic: 0.0,
            roughness: 0.5,
            albedo_texture: None,
            metallic_roughness_texture: None,
        }
    }
}

/// Purely diffuse material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LambertMaterial {
    pub albedo: [f32; 4],
    #[serde(skip)]
    pub albedo_texture: Option<TextureId>,
}

impl Default for LambertMaterial {
    fn default() -> Self {
        Self {
            albedo: [0.8, 0.8, 0.8, 1.0],
            albedo_texture: None,
        }
    }
}

/// Light-emitting surface, unaffected by scene lighting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmissiveMaterial {
    pub color: [f32; 3],
    pub strength: f32,
}

impl Default for EmissiveMaterial {
    fn default() -> Self {
        Self {
            color: [1.0, 1.0, 1.0],
            strength: 1.0,
        }
    }
}

/// A registered material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Material {
    Pbr(PbrMaterial),
    Lambert(LambertMaterial),
    Emissive(EmissiveMaterial),
}

/// Discriminant of [`Material`], used as the batch key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum MaterialKind {
    Pbr = 0,
    Lambert = 1,
    Emissive = 2,
}

impl MaterialKind {
    /// All kinds in batch draw order.
    pub const ALL: [Self; 3] = [Self::Pbr, Self::Lambert, Self::Emissive];

    /// Number of kinds.
    pub const COUNT: usize = Self::ALL.len();

    /// Dense index, also the fragment shader specialization constant.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Whether point lights add to this kind's shading.
    pub const fn receives_point_lights(self) -> bool {
        match self {
            Self::Pbr | Self::Lambert => true,
            Self::Emissive => false,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Pbr => "pbr",
            Self::Lambert => "lambert",
            Self::Emissive => "emissive",
        }
    }
}

/// Flattened shading parameters shared by both renderers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShadingParams {
    pub base_color: [f32; 4],
    pub emission: [f32; 3],
    pub metallic: f32,
    pub roughness: f32,
}

impl Material {
    pub const fn kind(&self) -> MaterialKind {
        match self {
            Self::Pbr(_) => MaterialKind::Pbr,
            Self::Lambert(_) => MaterialKind::Lambert,
            Self::Emissive(_) => MaterialKind::Emissive,
        }
    }

    /// Shading parameters in the common metallic/roughness form.
    pub fn shading(&self) -> ShadingParams {
        match self {
            Self::Pbr(m) => ShadingParams {
                base_color: m.base_color,
                emission: [0.0; 3],
                metallic: m.metallic.clamp(0.0, 1.0),
                roughness: m.roughness.clamp(0.04, 1.0),
            },
            Self::Lambert(m) => ShadingParams {
                base_color: m.albedo,
                emission: [0.0; 3],
                metallic: 0.0,
                roughness: 1.0,
            },
            Self::Emissive(m) => ShadingParams {
                base_color: [0.0, 0.0, 0.0, 1.0],
                emission: m.color.map(|c| c * m.strength.max(0.0)),
                metallic: 0.0,
                roughness: 1.0,
            },
        }
    }

    /// Albedo and metallic/roughness texture slots, if bound.
    pub const fn textures(&self) -> [Option<TextureId>; 2] {
        match self {
            Self::Pbr(m) => [m.albedo_texture, m.metallic_roughness_texture],
            Self::Lambert(m) => [m.albedo_texture, None],
            Self::Emissive(_) => [None, None],
        }
    }
}

impl Default for Material {
    fn default() -> Self {
        Self::Pbr(PbrMaterial::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_indices_are_dense() {
        for (i, kind) in MaterialKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn emissive_scales_by_strength() {
        let material = Material::Emissive(EmissiveMaterial {
            color: [1.0, 0.5, 0.25],
            strength: 4.0,
        });
        assert_eq!(material.shading().emission, [4.0, 2.0, 1.0]);
        assert_eq!(material.kind(), MaterialKind::Emissive);
    }

    #[test]
    fn pbr_roughness_is_clamped() {
        let material = Material::Pbr(PbrMaterial {
            roughness: 0.0,
            metallic: 3.0,
            ..PbrMaterial::default()
        });
        let shading = material.shading();
        assert!(shading.roughness >= 0.04);
        assert_eq!(shading.metallic, 1.0);
    }

    #[test]
    fn lambert_has_no_specular_texture() {
        let material = Material::Lambert(LambertMaterial {
            albedo_texture: Some(TextureId(3)),
            ..LambertMaterial::default()
        });
        assert_eq!(material.textures(), [Some(TextureId(3)), None]);
    }
}
