//! Per-frame scene snapshot consumed from the scene graph.
//!
//! The renderers never own scene state. They pull a [`SceneSnapshot`] from a
//! [`SceneSource`] each frame (raster) or each render call (ray traced).

use std::sync::Arc;

use bitflags::bitflags;
use glam::{Mat4, Vec3};
use parking_lot::RwLock;

use crate::camera::Camera;
use crate::ids::{EnvironmentKey, MaterialId, MeshId, ObjectId};

bitflags! {
    /// Per-object state bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct SceneObjectFlags: u32 {
        const VISIBLE = 1 << 0;
        const SELECTED = 1 << 1;
    }
}

impl Default for SceneObjectFlags {
    fn default() -> Self {
        Self::VISIBLE
    }
}

/// A flattened, resolved scene-graph node.
#[derive(Clone, Debug, PartialEq)]
pub struct SceneObject {
    pub id: ObjectId,
    pub mesh: Option<MeshId>,
    pub material: Option<MaterialId>,
    /// Object-to-world transform.
    pub transform: Mat4,
    pub flags: SceneObjectFlags,
}

impl SceneObject {
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            mesh: None,
            material: None,
            transform: Mat4::IDENTITY,
            flags: SceneObjectFlags::default(),
        }
    }

    #[must_use]
    pub fn with_mesh(mut self, mesh: MeshId) -> Self {
        self.mesh = Some(mesh);
        self
    }

    #[must_use]
    pub fn with_material(mut self, material: MaterialId) -> Self {
        self.material = Some(material);
        self
    }

    #[must_use]
    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub const fn is_selected(&self) -> bool {
        self.flags.contains(SceneObjectFlags::SELECTED)
    }

    pub const fn is_visible(&self) -> bool {
        self.flags.contains(SceneObjectFlags::VISIBLE)
    }

    /// World-space origin of the object.
    pub fn world_position(&self) -> Vec3 {
        self.transform.w_axis.truncate()
    }
}

/// Infinitely distant light.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DirectionalLight {
    /// Direction the light travels (from light towards the scene).
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-0.4, -1.0, -0.3).normalize(),
            color: Vec3::ONE,
            intensity: 3.0,
        }
    }
}

/// Punctual light with a finite influence radius.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    pub radius: f32,
}

/// Everything a renderer reads from the scene for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct SceneSnapshot {
    pub camera: Camera,
    pub sun: Option<DirectionalLight>,
    pub point_lights: Vec<PointLight>,
    pub skybox: Option<EnvironmentKey>,
    pub objects: Vec<SceneObject>,
    pub exposure: f32,
}

impl Default for SceneSnapshot {
    fn default() -> Self {
        Self {
            camera: Camera::default(),
            sun: Some(DirectionalLight::default()),
            point_lights: Vec::new(),
            skybox: None,
            objects: Vec::new(),
            exposure: 1.0,
        }
    }
}

impl SceneSnapshot {
    /// First selected object, which anchors the transform gizmo.
    pub fn selected_object(&self) -> Option<&SceneObject> {
        self.objects
            .iter()
            .find(|o| o.is_selected() && o.is_visible())
    }
}

/// Supplier of scene snapshots. Implemented by the scene graph.
pub trait SceneSource: Send + Sync {
    fn snapshot(&self) -> SceneSnapshot;
}

/// Minimal thread-safe scene store for apps and tests.
#[derive(Clone, Default)]
pub struct SharedScene {
    inner: Arc<RwLock<SceneSnapshot>>,
}

impl SharedScene {
    pub fn new(snapshot: SceneSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    pub fn set_camera(&self, camera: Camera) {
        self.inner.write().camera = camera;
    }

    pub fn set_skybox(&self, skybox: Option<EnvironmentKey>) {
        self.inner.write().skybox = skybox;
    }

    pub fn set_sun(&self, sun: Option<DirectionalLight>) {
        self.inner.write().sun = sun;
    }

    pub fn add_point_light(&self, light: PointLight) {
        self.inner.write().point_lights.push(light);
    }

    /// Insert an object, replacing any existing object with the same id.
    pub fn upsert_object(&self, object: SceneObject) {
        let mut scene = self.inner.write();
        match scene.objects.iter_mut().find(|o| o.id == object.id) {
            Some(existing) => *existing = object,
            None => scene.objects.push(object),
        }
    }

    /// Select exactly one object (or none).
    pub fn select(&self, id: Option<ObjectId>) {
        for object in &mut self.inner.write().objects {
            object
                .flags
                .set(SceneObjectFlags::SELECTED, Some(object.id) == id);
        }
    }

    /// Run `f` against the mutable snapshot.
    pub fn update<R>(&self, f: impl FnOnce(&mut SceneSnapshot) -> R) -> R {
        f(&mut self.inner.write())
    }
}

impl SceneSource for SharedScene {
    fn snapshot(&self) -> SceneSnapshot {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_is_exclusive() {
        let scene = SharedScene::default();
        for i in 0..3 {
            scene.upsert_object(SceneObject::new(ObjectId(i)));
        }
        scene.select(Some(ObjectId(1)));
        scene.select(Some(ObjectId(2)));
        let snapshot = scene.snapshot();
        let selected: Vec<_> = snapshot
            .objects
            .iter()
            .filter(|o| o.is_selected())
            .map(|o| o.id)
            .collect();
        assert_eq!(selected, vec![ObjectId(2)]);
        assert_eq!(snapshot.selected_object().map(|o| o.id), Some(ObjectId(2)));
    }

    #[test]
    fn upsert_replaces_by_id() {
        let scene = SharedScene::default();
        scene.upsert_object(SceneObject::new(ObjectId(7)));
        scene.upsert_object(SceneObject::new(ObjectId(7)).with_mesh(MeshId(1)));
        let snapshot = scene.snapshot();
        assert_eq!(snapshot.objects.len(), 1);
        assert_eq!(snapshot.objects[0].mesh, Some(MeshId(1)));
    }

    #[test]
    fn invisible_selection_has_no_gizmo_anchor() {
        let mut object = SceneObject::new(ObjectId(0));
        object.flags = SceneObjectFlags::SELECTED;
        let snapshot = SceneSnapshot {
            objects: vec![object],
            ..SceneSnapshot::default()
        };
        assert!(snapshot.selected_object().is_none());
    }
}
