//! In-memory triangle meshes.
//!
//! Meshes arrive already decoded; file parsing lives with the asset importer.

use glam::{Vec2, Vec3};

use crate::error::{Error, Result};
use crate::math::Aabb;

/// Interleaved vertex shared by the raster vertex stage and the ray tracer's
/// buffer-reference reads (scalar layout, 32 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            uv: uv.to_array(),
        }
    }

    /// Byte stride of one vertex.
    pub const STRIDE: u32 = std::mem::size_of::<Self>() as u32;
}

/// Indexed triangle list with precomputed bounds.
#[derive(Clone, Debug)]
pub struct MeshData {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    bounds: Aabb,
}

impl MeshData {
    /// Validate and wrap vertex/index arrays.
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Result<Self> {
        if vertices.is_empty() || indices.is_empty() {
            return Err(Error::InvalidData("mesh has no geometry".to_string()));
        }
        if indices.len() % 3 != 0 {
            return Err(Error::InvalidData(format!(
                "index count {} is not a multiple of 3",
                indices.len()
            )));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(Error::OutOfRange(format!(
                "index {bad} exceeds vertex count {}",
                vertices.len()
            )));
        }
        let bounds = Aabb::from_points(vertices.iter().map(|v| Vec3::from(v.position)));
        Ok(Self {
            vertices,
            indices,
            bounds,
        })
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Object-space bounds.
    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn triangle_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }

    /// UV sphere centred at the origin.
    pub fn uv_sphere(radius: f32, segments: u32, rings: u32) -> Self {
        let segments = segments.max(3);
        let rings = rings.max(2);
        let mut vertices = Vec::with_capacity(((segments + 1) * (rings + 1)) as usize);
        for ring in 0..=rings {
            let v = ring as f32 / rings as f32;
            let theta = v * std::f32::consts::PI;
            for segment in 0..=segments {
                let u = segment as f32 / segments as f32;
                let phi = u * std::f32::consts::TAU;
                let normal = Vec3::new(phi.cos() * theta.sin(), theta.cos(), phi.sin() * theta.sin());
                vertices.push(Vertex::new(normal * radius, normal, Vec2::new(u, v)));
            }
        }

        let stride = segments + 1;
        let mut indices = Vec::with_capacity((segments * rings * 6) as usize);
        for ring in 0..rings {
            for segment in 0..segments {
                let a = ring * stride + segment;
                let b = a + stride;
                indices.extend_from_slice(&[a, a + 1, b, a + 1, b + 1, b]);
            }
        }

        Self::from_generated(vertices, indices)
    }

    /// Axis-aligned square in the XZ plane facing +Y.
    pub fn plane(half_extent: f32) -> Self {
        let h = half_extent;
        let vertices = vec![
            Vertex::new(Vec3::new(-h, 0.0, -h), Vec3::Y, Vec2::new(0.0, 0.0)),
            Vertex::new(Vec3::new(h, 0.0, -h), Vec3::Y, Vec2::new(1.0, 0.0)),
            Vertex::new(Vec3::new(h, 0.0, h), Vec3::Y, Vec2::new(1.0, 1.0)),
            Vertex::new(Vec3::new(-h, 0.0, h), Vec3::Y, Vec2::new(0.0, 1.0)),
        ];
        Self::from_generated(vertices, vec![0, 2, 1, 0, 3, 2])
    }

    /// Unit-extent cube with per-face normals.
    pub fn cube(half_extent: f32) -> Self {
        let faces = [
            (Vec3::X, Vec3::Y),
            (Vec3::NEG_X, Vec3::Y),
            (Vec3::Y, Vec3::Z),
            (Vec3::NEG_Y, Vec3::Z),
            (Vec3::Z, Vec3::Y),
            (Vec3::NEG_Z, Vec3::Y),
        ];
        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, up) in faces {
            let right = up.cross(normal);
            let base = vertices.len() as u32;
            for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let position = (normal + right * su + up * sv) * half_extent;
                let uv = Vec2::new((su + 1.0) * 0.5, (sv + 1.0) * 0.5);
                vertices.push(Vertex::new(position, normal, uv));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self::from_generated(vertices, indices)
    }

    fn from_generated(vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        let bounds = Aabb::from_points(vertices.iter().map(|v| Vec3::from(v.position)));
        Self {
            vertices,
            indices,
            bounds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_is_32_bytes() {
        assert_eq!(Vertex::STRIDE, 32);
    }

    #[test]
    fn rejects_out_of_range_index() {
        let vertices = vec![Vertex::default(); 3];
        assert!(matches!(
            MeshData::new(vertices, vec![0, 1, 3]),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn rejects_partial_triangle() {
        let vertices = vec![Vertex::default(); 3];
        assert!(MeshData::new(vertices, vec![0, 1]).is_err());
    }

    #[test]
    fn generated_meshes_are_valid() {
        for mesh in [MeshData::uv_sphere(1.0, 16, 8), MeshData::plane(2.0), MeshData::cube(0.5)] {
            let checked = MeshData::new(mesh.vertices().to_vec(), mesh.indices().to_vec());
            assert!(checked.is_ok());
            assert!(!mesh.bounds().is_empty());
        }
    }

    #[test]
    fn sphere_bounds_match_radius() {
        let mesh = MeshData::uv_sphere(2.0, 32, 16);
        let size = mesh.bounds().size();
        assert!((size.x - 4.0).abs() < 1e-3);
        assert!((size.y - 4.0).abs() < 1e-3);
    }

    #[test]
    fn cube_normals_point_outward() {
        let mesh = MeshData::cube(1.0);
        for v in mesh.vertices() {
            let p = Vec3::from(v.position);
            let n = Vec3::from(v.normal);
            assert!(p.dot(n) > 0.0);
        }
    }
}
