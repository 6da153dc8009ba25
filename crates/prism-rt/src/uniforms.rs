//! Uniform block read by every path tracing stage.

use bytemuck::{Pod, Zeroable};
use prism_core::{PointLight, RenderSettings, SceneSnapshot};

/// Point lights beyond this count are ignored by the integrator.
pub const MAX_POINT_LIGHTS: usize = 8;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct TracePointLight {
    pub position_radius: [f32; 4],
    pub color_intensity: [f32; 4],
}

impl From<&PointLight> for TracePointLight {
    fn from(light: &PointLight) -> Self {
        Self {
            position_radius: light.position.extend(light.radius).to_array(),
            color_intensity: light.color.extend(light.intensity).to_array(),
        }
    }
}

/// std140 `TraceUniforms` block.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct TraceUniforms {
    pub inverse_view: [[f32; 4]; 4],
    pub inverse_projection: [[f32; 4]; 4],
    /// xyz: travel direction, w: intensity (0 without a sun).
    pub sun_direction: [f32; 4],
    /// w: 1 when an environment is bound.
    pub sun_color: [f32; 4],
    /// Samples per pixel, max depth, seed, point light count.
    pub params: [u32; 4],
    pub point_lights: [TracePointLight; MAX_POINT_LIGHTS],
}

impl TraceUniforms {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn new(
        scene: &SceneSnapshot,
        settings: &RenderSettings,
        environment_active: bool,
        seed: u32,
    ) -> Self {
        let mut camera = scene.camera.clone();
        camera.set_aspect(settings.width as f32 / settings.height.max(1) as f32);

        let (sun_direction, sun_color) = scene.sun.map_or(([0.0, -1.0, 0.0, 0.0], [0.0; 3]), |sun| {
            (
                sun.direction.normalize_or_zero().extend(sun.intensity).to_array(),
                sun.color.to_array(),
            )
        });
        let [r, g, b] = sun_color;

        let mut point_lights = [TracePointLight::default(); MAX_POINT_LIGHTS];
        let count = scene.point_lights.len().min(MAX_POINT_LIGHTS);
        for (slot, light) in point_lights.iter_mut().zip(&scene.point_lights) {
            *slot = light.into();
        }
        if scene.point_lights.len() > MAX_POINT_LIGHTS {
            tracing::warn!(
                "{} point lights in scene, path tracer uses the first {MAX_POINT_LIGHTS}",
                scene.point_lights.len()
            );
        }

        Self {
            inverse_view: camera.view_matrix().inverse().to_cols_array_2d(),
            inverse_projection: camera.projection_matrix().inverse().to_cols_array_2d(),
            sun_direction,
            sun_color: [r, g, b, if environment_active { 1.0 } else { 0.0 }],
            params: [settings.samples, settings.max_depth, seed, count as u32],
            point_lights,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::{Mat4, Vec3, Vec4};

    #[test]
    fn block_matches_shader_size() {
        assert_eq!(TraceUniforms::SIZE, 432);
    }

    #[test]
    fn params_carry_settings() {
        let settings = RenderSettings::default().with_samples(16).with_max_depth(4);
        let uniforms = TraceUniforms::new(&SceneSnapshot::default(), &settings, true, 7);
        assert_eq!(uniforms.params, [16, 4, 7, 0]);
        assert_relative_eq!(uniforms.sun_color[3], 1.0);
    }

    #[test]
    fn missing_sun_has_zero_intensity() {
        let scene = SceneSnapshot {
            sun: None,
            ..SceneSnapshot::default()
        };
        let uniforms = TraceUniforms::new(&scene, &RenderSettings::default(), false, 0);
        assert_relative_eq!(uniforms.sun_direction[3], 0.0);
        assert_relative_eq!(uniforms.sun_color[3], 0.0);
    }

    #[test]
    fn point_lights_are_capped() {
        let light = PointLight {
            position: Vec3::ONE,
            color: Vec3::X,
            intensity: 5.0,
            radius: 3.0,
        };
        let scene = SceneSnapshot {
            point_lights: vec![light; MAX_POINT_LIGHTS + 3],
            ..SceneSnapshot::default()
        };
        let uniforms = TraceUniforms::new(&scene, &RenderSettings::default(), false, 0);
        assert_eq!(uniforms.params[3], MAX_POINT_LIGHTS as u32);
        assert_eq!(uniforms.point_lights[0].position_radius, [1.0, 1.0, 1.0, 3.0]);
    }

    #[test]
    fn inverse_view_recovers_camera_position() {
        let scene = SceneSnapshot::default();
        let uniforms = TraceUniforms::new(&scene, &RenderSettings::default(), false, 0);
        let origin = Mat4::from_cols_array_2d(&uniforms.inverse_view) * Vec4::W;
        assert_relative_eq!(origin.x, scene.camera.position.x, epsilon = 1e-4);
        assert_relative_eq!(origin.y, scene.camera.position.y, epsilon = 1e-4);
        assert_relative_eq!(origin.z, scene.camera.position.z, epsilon = 1e-4);
    }
}
