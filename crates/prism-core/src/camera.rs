//! Camera state shared by the raster and ray-traced renderers.

use glam::{Mat4, Vec3};

/// Perspective camera.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    /// Vertical field of view in radians.
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 1.0, 5.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.05,
            far: 500.0,
        }
    }
}

impl Camera {
    /// Create a camera looking from `position` at `target`.
    pub fn looking_at(position: Vec3, target: Vec3, fov: f32, aspect: f32) -> Self {
        Self {
            position,
            direction: (target - position).normalize_or(Vec3::NEG_Z),
            fov,
            aspect,
            ..Self::default()
        }
    }

    /// Look at a target position.
    pub fn look_at(&mut self, target: Vec3) {
        self.direction = (target - self.position).normalize_or(self.direction);
    }

    /// Set the aspect ratio.
    pub fn set_aspect(&mut self, aspect: f32) {
        if aspect.is_finite() && aspect > 0.0 {
            self.aspect = aspect;
        }
    }

    /// Orbit around `pivot` by yaw/pitch deltas in radians.
    pub fn orbit(&mut self, pivot: Vec3, yaw: f32, pitch: f32) {
        let offset = self.position - pivot;
        let radius = offset.length();
        if radius <= f32::EPSILON {
            return;
        }
        let current_pitch = (offset.y / radius).clamp(-1.0, 1.0).asin();
        let current_yaw = offset.z.atan2(offset.x);
        let limit = std::f32::consts::FRAC_PI_2 - 0.01;
        let new_pitch = (current_pitch + pitch).clamp(-limit, limit);
        let new_yaw = current_yaw + yaw;
        self.position = pivot
            + Vec3::new(
                radius * new_pitch.cos() * new_yaw.cos(),
                radius * new_pitch.sin(),
                radius * new_pitch.cos() * new_yaw.sin(),
            );
        self.look_at(pivot);
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    /// Vulkan-style projection (depth 0..1, Y flipped for clip space).
    pub fn projection_matrix(&self) -> Mat4 {
        let mut proj = Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far);
        proj.y_axis.y *= -1.0;
        proj
    }

    /// Get the view-projection matrix.
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Distance from the camera to a world-space point.
    pub fn distance_to(&self, point: Vec3) -> f32 {
        self.position.distance(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn looking_at_normalizes_direction() {
        let camera = Camera::looking_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, 1.0, 1.0);
        assert_relative_eq!(camera.direction.length(), 1.0, epsilon = 1e-6);
        assert_relative_eq!(camera.direction.z, -1.0, epsilon = 1e-6);
    }

    #[test]
    fn orbit_preserves_radius() {
        let mut camera = Camera::looking_at(Vec3::new(3.0, 0.0, 4.0), Vec3::ZERO, 1.0, 1.0);
        camera.orbit(Vec3::ZERO, 0.7, 0.3);
        assert_relative_eq!(camera.position.length(), 5.0, epsilon = 1e-4);
        assert_relative_eq!(camera.direction.dot(-camera.position.normalize()), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn projection_flips_y() {
        let camera = Camera::default();
        assert!(camera.projection_matrix().y_axis.y < 0.0);
    }
}
