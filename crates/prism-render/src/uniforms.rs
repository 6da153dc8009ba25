//! GPU-visible uniform blocks and push constants of the raster passes.
//!
//! Field order and padding mirror the std140 blocks in `prism-shaders`.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use prism_core::{Camera, Material, SceneSnapshot, SelectionId, TextureId};

/// Scene-wide uniforms bound at set 0.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct SceneUniforms {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub view_projection: [[f32; 4]; 4],
    pub inverse_view_projection: [[f32; 4]; 4],
    /// xyz: camera position, w: exposure
    pub camera_position: [f32; 4],
    /// xyz: direction the sun travels, w: intensity (0 without a sun)
    pub sun_direction: [f32; 4],
    /// rgb: sun color, w: 1 when an environment is active
    pub sun_color: [f32; 4],
    pub viewport: [f32; 4],
    /// x: prefiltered mip count, y: IBL intensity
    pub ibl: [f32; 4],
}

impl SceneUniforms {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Build the uniforms for one frame.
    pub fn new(
        scene: &SceneSnapshot,
        extent: (u32, u32),
        environment_active: bool,
        prefiltered_mips: u32,
        ibl_intensity: f32,
    ) -> Self {
        let mut camera = scene.camera.clone();
        let (width, height) = (extent.0.max(1) as f32, extent.1.max(1) as f32);
        camera.set_aspect(width / height);

        let (sun_direction, sun_color) = scene.sun.map_or(
            ([0.0, -1.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0]),
            |sun| {
                let dir = sun.direction.normalize_or(Vec3::NEG_Y);
                (
                    [dir.x, dir.y, dir.z, sun.intensity.max(0.0)],
                    [sun.color.x, sun.color.y, sun.color.z, 0.0],
                )
            },
        );
        let mut uniforms = Self::from_camera(&camera);
        uniforms.camera_position[3] = scene.exposure;
        uniforms.sun_direction = sun_direction;
        uniforms.sun_color = sun_color;
        uniforms.sun_color[3] = if environment_active { 1.0 } else { 0.0 };
        uniforms.viewport = [width, height, 1.0 / width, 1.0 / height];
        uniforms.ibl = [prefiltered_mips as f32, ibl_intensity, 0.0, 0.0];
        uniforms
    }

    fn from_camera(camera: &Camera) -> Self {
        let view = camera.view_matrix();
        let projection = camera.projection_matrix();
        let view_projection = projection * view;
        Self {
            view: view.to_cols_array_2d(),
            projection: projection.to_cols_array_2d(),
            view_projection: view_projection.to_cols_array_2d(),
            inverse_view_projection: view_projection.inverse().to_cols_array_2d(),
            camera_position: [camera.position.x, camera.position.y, camera.position.z, 1.0],
            sun_direction: [0.0; 4],
            sun_color: [0.0; 4],
            viewport: [0.0; 4],
            ibl: [0.0; 4],
        }
    }
}

/// Per-object transform block, addressed with a dynamic offset at set 1.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ObjectBlock {
    pub model: [[f32; 4]; 4],
    pub normal_matrix: [[f32; 4]; 4],
}

impl ObjectBlock {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn from_transform(model: Mat4) -> Self {
        let normal = if model.determinant().abs() > f32::EPSILON {
            model.inverse().transpose()
        } else {
            Mat4::IDENTITY
        };
        Self {
            model: model.to_cols_array_2d(),
            normal_matrix: normal.to_cols_array_2d(),
        }
    }
}

/// Material parameters, addressed with a dynamic offset at set 2.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct MaterialBlock {
    pub base_color: [f32; 4],
    pub emission: [f32; 4],
    /// x: metallic, y: roughness
    pub pbr: [f32; 4],
    /// x: albedo slot, y: metallic/roughness slot, -1 when unbound
    pub textures: [i32; 4],
}

impl MaterialBlock {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Pack a material. Texture slots not present in the table are dropped.
    pub fn from_material(material: &Material, texture_present: impl Fn(TextureId) -> bool) -> Self {
        let shading = material.shading();
        let slot = |texture: Option<TextureId>| {
            texture
                .filter(|&t| texture_present(t))
                .map_or(-1, |t| t.0 as i32)
        };
        let [albedo, metallic_roughness] = material.textures();
        Self {
            base_color: shading.base_color,
            emission: [
                shading.emission[0],
                shading.emission[1],
                shading.emission[2],
                0.0,
            ],
            pbr: [shading.metallic, shading.roughness, 0.0, 0.0],
            textures: [slot(albedo), slot(metallic_roughness), -1, -1],
        }
    }
}

/// Per-draw push constants shared by the base and additive forward passes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct DrawPushConstants {
    pub selection_id: u32,
    pub selected: u32,
    pub _pad: [u32; 2],
    /// xyz: light position, w: radius
    pub light_position_radius: [f32; 4],
    /// rgb: light color, w: intensity
    pub light_color_intensity: [f32; 4],
}

impl DrawPushConstants {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;

    pub const fn base(selection: SelectionId, selected: bool) -> Self {
        Self {
            selection_id: selection.raw(),
            selected: selected as u32,
            _pad: [0; 2],
            light_position_radius: [0.0; 4],
            light_color_intensity: [0.0; 4],
        }
    }

    #[must_use]
    pub fn with_point_light(mut self, light: &prism_core::PointLight) -> Self {
        self.light_position_radius = [
            light.position.x,
            light.position.y,
            light.position.z,
            light.radius,
        ];
        self.light_color_intensity = [light.color.x, light.color.y, light.color.z, light.intensity];
        self
    }
}

/// Post pass parameters.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PostPushConstants {
    /// rgb: outline color, a: opacity
    pub outline_color: [f32; 4],
    pub exposure: f32,
    /// Outline thickness in pixels
    pub outline_width: f32,
    pub _pad: [f32; 2],
}

impl PostPushConstants {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

impl Default for PostPushConstants {
    fn default() -> Self {
        Self {
            outline_color: [1.0, 0.6, 0.1, 1.0],
            exposure: 1.0,
            outline_width: 1.5,
            _pad: [0.0; 2],
        }
    }
}

/// Gizmo axis parameters.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct GizmoPushConstants {
    pub mvp: [[f32; 4]; 4],
    pub color: [f32; 4],
    pub selection_id: u32,
    pub _pad: [u32; 3],
}

impl GizmoPushConstants {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::{DirectionalLight, PbrMaterial};

    #[test]
    fn block_sizes_match_shader_layouts() {
        assert_eq!(SceneUniforms::SIZE, 336);
        assert_eq!(ObjectBlock::SIZE, 128);
        assert_eq!(MaterialBlock::SIZE, 64);
        assert_eq!(DrawPushConstants::SIZE, 48);
        assert_eq!(GizmoPushConstants::SIZE, 96);
        assert_eq!(PostPushConstants::SIZE % 16, 0);
    }

    #[test]
    fn missing_sun_has_zero_intensity() {
        let scene = SceneSnapshot {
            sun: None,
            ..SceneSnapshot::default()
        };
        let uniforms = SceneUniforms::new(&scene, (800, 600), false, 8, 1.0);
        assert_eq!(uniforms.sun_direction[3], 0.0);
        assert_eq!(uniforms.sun_color[3], 0.0);
        assert_eq!(uniforms.viewport[0], 800.0);
    }

    #[test]
    fn environment_flag_and_mips_are_packed() {
        let scene = SceneSnapshot {
            sun: Some(DirectionalLight::default()),
            ..SceneSnapshot::default()
        };
        let uniforms = SceneUniforms::new(&scene, (64, 64), true, 8, 0.5);
        assert_eq!(uniforms.sun_color[3], 1.0);
        assert_eq!(uniforms.ibl[0], 8.0);
        assert_eq!(uniforms.ibl[1], 0.5);
        assert!(uniforms.sun_direction[3] > 0.0);
    }

    #[test]
    fn unknown_textures_become_unbound() {
        let material = Material::Pbr(PbrMaterial {
            albedo_texture: Some(TextureId(2)),
            metallic_roughness_texture: Some(TextureId(9)),
            ..PbrMaterial::default()
        });
        let block = MaterialBlock::from_material(&material, |t| t.0 < 4);
        assert_eq!(block.textures, [2, -1, -1, -1]);
    }

    #[test]
    fn degenerate_transform_keeps_identity_normals() {
        let block = ObjectBlock::from_transform(Mat4::from_scale(Vec3::ZERO));
        assert_eq!(block.normal_matrix, Mat4::IDENTITY.to_cols_array_2d());
    }
}
