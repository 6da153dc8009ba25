//! Per-frame draw batching and descriptor binding order.
//!
//! Batches are rebuilt from the live scene-object list every frame. Each
//! object that resolves to both a mesh and a material lands in the batch of
//! its material kind; everything else is skipped.

use glam::Mat4;
use prism_core::math::align_up;
use prism_core::{
    Aabb, MaterialId, MaterialKind, MeshId, ObjectId, PointLight, SceneObject, SelectionId,
};

/// Descriptor set indices of the forward pipeline layout.
pub mod sets {
    pub const SCENE: u32 = 0;
    pub const OBJECT: u32 = 1;
    pub const MATERIAL: u32 = 2;
    pub const TEXTURES: u32 = 3;
    pub const ENVIRONMENT: u32 = 4;
    pub const COUNT: usize = 5;
}

/// Lookups the batcher needs from the render context.
pub trait BatchResolver {
    /// Object-space bounds of an uploaded mesh.
    fn mesh_bounds(&self, mesh: MeshId) -> Option<Aabb>;
    /// Kind of a registered material.
    fn material_kind(&self, material: MaterialId) -> Option<MaterialKind>;
}

/// One draw in a batch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DrawRecord {
    pub object: ObjectId,
    pub mesh: MeshId,
    /// Index into this frame's transform blocks.
    pub transform_block: u32,
    /// Index into the material blocks (the material id).
    pub material_block: u32,
    pub selection: SelectionId,
    pub selected: bool,
    /// World-space bounds, used for point light culling.
    pub world_bounds: Aabb,
}

/// All draws of one material kind.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawBatch {
    pub kind: MaterialKind,
    pub records: Vec<DrawRecord>,
}

impl DrawBatch {
    /// Records whose bounds intersect the light's radius sphere.
    pub fn lit_by<'a>(&'a self, light: &'a PointLight) -> impl Iterator<Item = &'a DrawRecord> {
        self.records
            .iter()
            .filter(move |r| r.world_bounds.intersects_sphere(light.position, light.radius))
    }
}

/// Batches plus the transform of every transform block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DrawList {
    /// Non-empty batches in [`MaterialKind::ALL`] order.
    pub batches: Vec<DrawBatch>,
    pub transforms: Vec<Mat4>,
}

impl DrawList {
    pub fn draw_count(&self) -> usize {
        self.batches.iter().map(|b| b.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Partition the visible, fully resolved objects by material kind.
#[cfg_attr(
    feature = "profiling-tracy",
    tracing::instrument(level = "trace", skip_all)
)]
pub fn build_batches(objects: &[SceneObject], resolver: &impl BatchResolver) -> DrawList {
    let mut by_kind: [Vec<DrawRecord>; MaterialKind::COUNT] = Default::default();
    let mut transforms = Vec::with_capacity(objects.len());

    for object in objects {
        if !object.is_visible() {
            continue;
        }
        let (Some(mesh), Some(material)) = (object.mesh, object.material) else {
            tracing::trace!("Skipping {}: no mesh or material", object.id);
            continue;
        };
        let Some(bounds) = resolver.mesh_bounds(mesh) else {
            tracing::trace!("Skipping {}: unknown {mesh}", object.id);
            continue;
        };
        let Some(kind) = resolver.material_kind(material) else {
            tracing::trace!("Skipping {}: unknown {material}", object.id);
            continue;
        };

        let transform_block = transforms.len() as u32;
        transforms.push(object.transform);
        by_kind[kind.index()].push(DrawRecord {
            object: object.id,
            mesh,
            transform_block,
            material_block: material.0,
            selection: SelectionId::from_object(object.id),
            selected: object.is_selected(),
            world_bounds: bounds.transformed(object.transform),
        });
    }

    let batches = MaterialKind::ALL
        .into_iter()
        .zip(by_kind)
        .filter(|(_, records)| !records.is_empty())
        .map(|(kind, records)| DrawBatch { kind, records })
        .collect();

    DrawList {
        batches,
        transforms,
    }
}

/// Which forward sub-pass a draw belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassKind {
    /// IBL, directional light and selection tint.
    Base,
    /// One point light, blended additively.
    Additive,
}

/// Dynamic uniform block strides, already aligned to the device's
/// `minUniformBufferOffsetAlignment`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockSizes {
    pub object: u64,
    pub material: u64,
}

impl BlockSizes {
    pub const fn aligned(object: u64, material: u64, min_alignment: u64) -> Self {
        Self {
            object: align_up(object, min_alignment),
            material: align_up(material, min_alignment),
        }
    }
}

/// One descriptor set bind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetBinding {
    pub set: u32,
    pub dynamic_offset: Option<u32>,
}

/// Ordered descriptor set binds for one draw.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrawBinding {
    pub sets: Vec<SetBinding>,
}

impl DrawBinding {
    /// Resolve the set order and dynamic offsets of `record` in `pass`.
    pub fn for_record(record: &DrawRecord, sizes: BlockSizes, pass: PassKind) -> Self {
        let mut bindings = vec![
            SetBinding {
                set: sets::SCENE,
                dynamic_offset: None,
            },
            SetBinding {
                set: sets::OBJECT,
                dynamic_offset: Some((u64::from(record.transform_block) * sizes.object) as u32),
            },
            SetBinding {
                set: sets::MATERIAL,
                dynamic_offset: Some((u64::from(record.material_block) * sizes.material) as u32),
            },
            SetBinding {
                set: sets::TEXTURES,
                dynamic_offset: None,
            },
        ];
        if pass == PassKind::Base {
            bindings.push(SetBinding {
                set: sets::ENVIRONMENT,
                dynamic_offset: None,
            });
        }
        Self { sets: bindings }
    }

    /// Dynamic offsets in set order, as `vkCmdBindDescriptorSets` expects.
    pub fn dynamic_offsets(&self) -> Vec<u32> {
        self.sets.iter().filter_map(|s| s.dynamic_offset).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use prism_core::SceneObjectFlags;

    struct Tables;

    impl BatchResolver for Tables {
        fn mesh_bounds(&self, mesh: MeshId) -> Option<Aabb> {
            (mesh.0 < 2).then(|| Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0)))
        }

        fn material_kind(&self, material: MaterialId) -> Option<MaterialKind> {
            MaterialKind::ALL.get(material.index()).copied()
        }
    }

    fn object(id: u32, mesh: Option<u32>, material: Option<u32>) -> SceneObject {
        SceneObject {
            mesh: mesh.map(MeshId),
            material: material.map(MaterialId),
            ..SceneObject::new(ObjectId(id))
        }
    }

    #[test]
    fn partitions_by_material_kind() {
        let objects = vec![
            object(0, Some(0), Some(1)),
            object(1, Some(1), Some(0)),
            object(2, Some(0), Some(1)),
            object(3, Some(1), Some(2)),
        ];
        let list = build_batches(&objects, &Tables);

        let kinds: Vec<_> = list.batches.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![MaterialKind::Pbr, MaterialKind::Lambert, MaterialKind::Emissive]
        );
        assert_eq!(list.batches[1].records.len(), 2);
        assert_eq!(list.draw_count(), 4);
        assert_eq!(list.transforms.len(), 4);
    }

    #[test]
    fn unresolved_and_hidden_objects_are_skipped() {
        let mut hidden = object(4, Some(0), Some(0));
        hidden.flags = SceneObjectFlags::empty();
        let objects = vec![
            object(0, None, Some(0)),
            object(1, Some(0), None),
            object(2, Some(7), Some(0)),
            object(3, Some(0), Some(9)),
            hidden,
            object(5, Some(1), Some(0)),
        ];
        let list = build_batches(&objects, &Tables);
        assert_eq!(list.draw_count(), 1);
        assert_eq!(list.batches[0].records[0].object, ObjectId(5));
        assert_eq!(list.batches[0].records[0].transform_block, 0);
    }

    #[test]
    fn records_carry_selection_encoding() {
        let mut selected = object(6, Some(0), Some(0));
        selected.flags |= SceneObjectFlags::SELECTED;
        let list = build_batches(&[selected], &Tables);
        let record = list.batches[0].records[0];
        assert_eq!(record.selection.raw(), 7);
        assert!(record.selected);
    }

    #[test]
    fn binding_order_and_offsets() {
        let record = DrawRecord {
            object: ObjectId(0),
            mesh: MeshId(0),
            transform_block: 3,
            material_block: 2,
            selection: SelectionId::from_object(ObjectId(0)),
            selected: false,
            world_bounds: Aabb::EMPTY,
        };
        let sizes = BlockSizes::aligned(128, 64, 256);
        assert_eq!(sizes, BlockSizes { object: 256, material: 256 });

        let base = DrawBinding::for_record(&record, sizes, PassKind::Base);
        let order: Vec<_> = base.sets.iter().map(|s| s.set).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(base.dynamic_offsets(), vec![768, 512]);

        let additive = DrawBinding::for_record(&record, sizes, PassKind::Additive);
        assert_eq!(additive.sets.len(), 4);
        assert!(additive.sets.iter().all(|s| s.set != sets::ENVIRONMENT));
    }

    #[test]
    fn point_light_culls_by_world_bounds() {
        let near = object(0, Some(0), Some(0));
        let far = object(1, Some(0), Some(0))
            .with_transform(Mat4::from_translation(Vec3::new(50.0, 0.0, 0.0)));
        let list = build_batches(&[near, far], &Tables);
        let light = PointLight {
            position: Vec3::new(2.0, 0.0, 0.0),
            color: Vec3::ONE,
            intensity: 10.0,
            radius: 1.5,
        };
        let lit: Vec<_> = list.batches[0].lit_by(&light).map(|r| r.object).collect();
        assert_eq!(lit, vec![ObjectId(0)]);
    }
}
