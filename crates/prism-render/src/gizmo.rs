//! Three-axis translation gizmo drawn in the UI pass.

use glam::{Mat4, Quat, Vec3};
use prism_core::{Axis, Camera};

use crate::uniforms::GizmoPushConstants;

/// World units per unit of camera distance, keeping the gizmo a constant
/// size on screen.
pub const GIZMO_SCREEN_FACTOR: f32 = 0.15;

const SHAFT_RADIUS: f32 = 0.02;
const SHAFT_LENGTH: f32 = 0.8;
const TIP_RADIUS: f32 = 0.07;
const TIP_SEGMENTS: u32 = 12;

/// Axis colors, RGB for XYZ.
pub const AXIS_COLORS: [[f32; 4]; 3] = [
    [0.9, 0.2, 0.2, 1.0],
    [0.2, 0.85, 0.3, 1.0],
    [0.25, 0.4, 0.95, 1.0],
];

/// Arrow along +X from the origin to 1.0: a square shaft plus a cone tip.
pub fn arrow_mesh() -> (Vec<[f32; 3]>, Vec<u32>) {
    let mut positions = Vec::new();
    let mut indices = Vec::new();

    let r = SHAFT_RADIUS;
    for x in [0.0, SHAFT_LENGTH] {
        for (y, z) in [(-r, -r), (r, -r), (r, r), (-r, r)] {
            positions.push([x, y, z]);
        }
    }
    for side in 0..4u32 {
        let next = (side + 1) % 4;
        indices.extend_from_slice(&[side, next, 4 + next, side, 4 + next, 4 + side]);
    }

    let base = positions.len() as u32;
    positions.push([1.0, 0.0, 0.0]);
    positions.push([SHAFT_LENGTH, 0.0, 0.0]);
    for i in 0..TIP_SEGMENTS {
        let angle = i as f32 / TIP_SEGMENTS as f32 * std::f32::consts::TAU;
        positions.push([SHAFT_LENGTH, angle.cos() * TIP_RADIUS, angle.sin() * TIP_RADIUS]);
    }
    for i in 0..TIP_SEGMENTS {
        let a = base + 2 + i;
        let b = base + 2 + (i + 1) % TIP_SEGMENTS;
        indices.extend_from_slice(&[base, a, b, base + 1, b, a]);
    }

    (positions, indices)
}

/// Rotation taking +X onto `axis`.
pub fn axis_rotation(axis: Axis) -> Quat {
    match axis {
        Axis::X => Quat::IDENTITY,
        Axis::Y => Quat::from_rotation_z(std::f32::consts::FRAC_PI_2),
        Axis::Z => Quat::from_rotation_y(-std::f32::consts::FRAC_PI_2),
    }
}

/// World-space scale that keeps the gizmo a constant screen size.
pub fn gizmo_scale(camera: &Camera, anchor: Vec3) -> f32 {
    (camera.distance_to(anchor) * GIZMO_SCREEN_FACTOR).max(1e-3)
}

/// Push constants for the three axis draws around `anchor`.
pub fn axis_draws(view_projection: Mat4, camera: &Camera, anchor: Vec3) -> [GizmoPushConstants; 3] {
    let scale = gizmo_scale(camera, anchor);
    Axis::ALL.map(|axis| {
        let model = Mat4::from_scale_rotation_translation(
            Vec3::splat(scale),
            axis_rotation(axis),
            anchor,
        );
        GizmoPushConstants {
            mvp: (view_projection * model).to_cols_array_2d(),
            color: AXIS_COLORS[axis.index()],
            selection_id: axis.selection_id().raw(),
            _pad: [0; 3],
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use prism_core::selection::GIZMO_AXIS_IDS;

    #[test]
    fn rotations_map_x_onto_each_axis() {
        for (axis, expected) in Axis::ALL.into_iter().zip([Vec3::X, Vec3::Y, Vec3::Z]) {
            let mapped = axis_rotation(axis) * Vec3::X;
            assert_relative_eq!(mapped.x, expected.x, epsilon = 1e-5);
            assert_relative_eq!(mapped.y, expected.y, epsilon = 1e-5);
            assert_relative_eq!(mapped.z, expected.z, epsilon = 1e-5);
        }
    }

    #[test]
    fn scale_tracks_camera_distance() {
        let camera = Camera::looking_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, 1.0, 1.0);
        assert_relative_eq!(gizmo_scale(&camera, Vec3::ZERO), 10.0 * GIZMO_SCREEN_FACTOR);
        assert_relative_eq!(
            gizmo_scale(&camera, Vec3::new(0.0, 0.0, -10.0)),
            20.0 * GIZMO_SCREEN_FACTOR
        );
    }

    #[test]
    fn draws_use_reserved_ids() {
        let camera = Camera::default();
        let draws = axis_draws(camera.view_projection_matrix(), &camera, Vec3::ZERO);
        let ids: Vec<u32> = draws.iter().map(|d| d.selection_id).collect();
        assert_eq!(ids, GIZMO_AXIS_IDS.to_vec());
    }

    #[test]
    fn arrow_indices_are_in_range() {
        let (positions, indices) = arrow_mesh();
        assert_eq!(indices.len() % 3, 0);
        assert!(indices.iter().all(|&i| (i as usize) < positions.len()));
        let max_x = positions.iter().map(|p| p[0]).fold(f32::MIN, f32::max);
        assert_relative_eq!(max_x, 1.0);
    }
}
