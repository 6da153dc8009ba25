//! Host-side planning of one ray-traced render.
//!
//! Every mesh-bearing object gets its own BLAS, built over the mesh in
//! object space, and one TLAS instance that carries the world transform.

use std::sync::Arc;

use ash::vk;
use glam::Mat4;
use prism_core::{Material, MaterialId, MeshData, MeshId, ObjectId, SceneObject};
use prism_render::RenderResources;

/// Lookups the planner needs from the resource tables.
pub trait SceneResolver {
    fn mesh_data(&self, id: MeshId) -> Option<Arc<MeshData>>;
    fn material(&self, id: MaterialId) -> Option<Material>;
}

impl SceneResolver for RenderResources {
    fn mesh_data(&self, id: MeshId) -> Option<Arc<MeshData>> {
        self.mesh(id).map(|mesh| Arc::clone(&mesh.data))
    }

    fn material(&self, id: MaterialId) -> Option<Material> {
        Self::material(self, id).cloned()
    }
}

/// One TLAS instance and the BLAS it references.
#[derive(Clone, Debug)]
pub struct InstancePlan {
    pub object: ObjectId,
    /// Index into the BLAS list, equal to the instance custom index.
    pub blas_index: u32,
    pub mesh: Arc<MeshData>,
    pub material: Material,
    pub transform: Mat4,
}

/// Resolve the objects that take part in the render.
///
/// Hidden objects and objects whose mesh or material cannot be resolved are
/// skipped.
pub fn plan_instances(objects: &[SceneObject], resolver: &impl SceneResolver) -> Vec<InstancePlan> {
    let mut plans = Vec::with_capacity(objects.len());
    for object in objects.iter().filter(|o| o.is_visible()) {
        let Some(mesh_id) = object.mesh else {
            continue;
        };
        let Some(mesh) = resolver.mesh_data(mesh_id) else {
            tracing::trace!("Object {} skipped: unknown mesh {mesh_id}", object.id);
            continue;
        };
        let Some(material) = object.material.and_then(|id| resolver.material(id)) else {
            tracing::trace!("Object {} skipped: unresolved material", object.id);
            continue;
        };
        plans.push(InstancePlan {
            object: object.id,
            blas_index: plans.len() as u32,
            mesh,
            material,
            transform: object.transform,
        });
    }
    plans
}

/// Row-major 3x4 affine part of `m`.
pub fn transform_rows(m: Mat4) -> vk::TransformMatrixKHR {
    let r = m.transpose();
    let mut matrix = [0.0; 12];
    matrix[0..4].copy_from_slice(&r.x_axis.to_array());
    matrix[4..8].copy_from_slice(&r.y_axis.to_array());
    matrix[8..12].copy_from_slice(&r.z_axis.to_array());
    vk::TransformMatrixKHR { matrix }
}

/// TLAS instance for `plan` referencing the BLAS at `blas_address`.
pub fn instance(plan: &InstancePlan, blas_address: vk::DeviceAddress) -> vk::AccelerationStructureInstanceKHR {
    vk::AccelerationStructureInstanceKHR {
        transform: transform_rows(plan.transform),
        instance_custom_index_and_mask: vk::Packed24_8::new(plan.blas_index, 0xFF),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            0,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: blas_address,
        },
    }
}

/// Per-instance record read by the closest-hit stage (scalar layout).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ObjectDescription {
    pub vertex_address: u64,
    pub index_address: u64,
    pub base_color: [f32; 4],
    pub emission: [f32; 4],
    /// x: metallic, y: roughness, z: material kind.
    pub surface: [f32; 4],
}

impl ObjectDescription {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn new(material: &Material, vertex_address: u64, index_address: u64) -> Self {
        let shading = material.shading();
        let [r, g, b] = shading.emission;
        Self {
            vertex_address,
            index_address,
            base_color: shading.base_color,
            emission: [r, g, b, 0.0],
            surface: [
                shading.metallic,
                shading.roughness,
                material.kind() as u32 as f32,
                0.0,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec3;
    use hashbrown::HashMap;
    use prism_core::{EmissiveMaterial, LambertMaterial, SceneObjectFlags};

    #[derive(Default)]
    struct Tables {
        meshes: HashMap<MeshId, Arc<MeshData>>,
        materials: HashMap<MaterialId, Material>,
    }

    impl SceneResolver for Tables {
        fn mesh_data(&self, id: MeshId) -> Option<Arc<MeshData>> {
            self.meshes.get(&id).cloned()
        }

        fn material(&self, id: MaterialId) -> Option<Material> {
            self.materials.get(&id).cloned()
        }
    }

    fn tables() -> Tables {
        let mut tables = Tables::default();
        tables.meshes.insert(MeshId(0), Arc::new(MeshData::cube(0.5)));
        tables.meshes.insert(MeshId(1), Arc::new(MeshData::plane(4.0)));
        tables.materials.insert(
            MaterialId(0),
            Material::Lambert(LambertMaterial {
                albedo: [0.8, 0.8, 0.8, 1.0],
                albedo_texture: None,
            }),
        );
        tables
    }

    fn object(id: u32, mesh: u32) -> SceneObject {
        SceneObject::new(ObjectId(id))
            .with_mesh(MeshId(mesh))
            .with_material(MaterialId(0))
    }

    #[test]
    fn one_blas_per_mesh_bearing_object() {
        // The same mesh twice still gets two BLAS
        let objects = vec![object(1, 0), object(2, 0), object(3, 1)];
        let plans = plan_instances(&objects, &tables());
        assert_eq!(plans.len(), 3);
        let indices: Vec<u32> = plans.iter().map(|p| p.blas_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn unresolvable_and_hidden_objects_are_skipped() {
        let mut hidden = object(4, 0);
        hidden.flags = SceneObjectFlags::empty();
        let objects = vec![
            SceneObject::new(ObjectId(1)),
            object(2, 9),
            SceneObject::new(ObjectId(3)).with_mesh(MeshId(0)),
            hidden,
            object(5, 1),
        ];
        let plans = plan_instances(&objects, &tables());
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].object, ObjectId(5));
        assert_eq!(plans[0].blas_index, 0);
    }

    #[test]
    fn transform_rows_are_row_major() {
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)) * Mat4::from_scale(Vec3::splat(2.0));
        let rows = transform_rows(m).matrix;
        assert_eq!(rows, [2.0, 0.0, 0.0, 1.0, 0.0, 2.0, 0.0, 2.0, 0.0, 0.0, 2.0, 3.0]);
    }

    #[test]
    fn instance_carries_index_and_address() {
        let plans = plan_instances(&[object(1, 0), object(2, 1)], &tables());
        let inst = instance(&plans[1], 0xABC0);
        assert_eq!(inst.instance_custom_index_and_mask.low_24(), 1);
        assert_eq!(inst.instance_custom_index_and_mask.high_8(), 0xFF);
        assert_eq!(unsafe { inst.acceleration_structure_reference.device_handle }, 0xABC0);
    }

    #[test]
    fn object_description_layout() {
        assert_eq!(ObjectDescription::SIZE, 64);
        let material = Material::Emissive(EmissiveMaterial {
            color: [1.0, 0.5, 0.25],
            strength: 2.0,
        });
        let desc = ObjectDescription::new(&material, 16, 32);
        assert_relative_eq!(desc.emission[0], 2.0);
        assert_relative_eq!(desc.emission[2], 0.5);
        assert_relative_eq!(desc.surface[2], material.kind() as u32 as f32);
        assert_eq!((desc.vertex_address, desc.index_address), (16, 32));
    }
}
