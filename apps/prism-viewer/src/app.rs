//! Viewer application: window, input and demo scene.

use std::path::PathBuf;
use std::sync::Arc;

use glam::{Mat4, Vec3};
use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, MouseButton, MouseScrollDelta, WindowEvent};
use winit::event_loop::ActiveEventLoop;
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

use prism_app::{Engine, EngineConfig};
use prism_core::{
    Camera, DirectionalLight, EmissiveMaterial, LambertMaterial, Material, MeshData, ObjectId,
    PbrMaterial, PickResult, PointLight, RenderSettings, SceneObject, SharedScene,
};

/// Orbit speed in radians per pixel of drag.
const ORBIT_SENSITIVITY: f32 = 0.005;

/// Fraction of the pivot distance moved per scroll line.
const ZOOM_STEP: f32 = 0.1;

const MIN_DISTANCE: f32 = 1.0;

/// Viewer options from the command line.
#[derive(Clone, Debug)]
pub struct ViewerOptions {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub target_fps: Option<u32>,
    pub environment: Option<PathBuf>,
    /// Settings used when a still is path traced with `R`.
    pub trace: RenderSettings,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            vsync: true,
            target_fps: Some(60),
            environment: None,
            trace: RenderSettings::default(),
        }
    }
}

impl ViewerOptions {
    /// Parse viewer flags; path tracing flags are handed to
    /// [`RenderSettings::parse_args`].
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let mut options = Self {
            trace: RenderSettings::default().parse_args(args)?,
            ..Self::default()
        };

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1);
            match args[i].as_str() {
                "--environment" => {
                    if let Some(path) = value {
                        options.environment = Some(PathBuf::from(path));
                        i += 1;
                    }
                }
                "--fps" => {
                    if let Some(v) = value.and_then(|v| v.parse().ok()) {
                        options.target_fps = (v > 0).then_some(v);
                        i += 1;
                    }
                }
                "--no-vsync" => options.vsync = false,
                _ => {}
            }
            i += 1;
        }
        Ok(options)
    }
}

/// Camera orbit state driven by the mouse.
#[derive(Debug, Default)]
struct OrbitInput {
    dragging: bool,
    cursor: (f64, f64),
}

/// Everything that exists once the window is up.
struct ViewerState {
    // Dropped before the window so the surface never outlives it
    engine: Engine,
    window: Arc<Window>,
    scene: SharedScene,
    pivot: Vec3,
    orbit: OrbitInput,
}

/// The winit application.
pub struct Viewer {
    options: ViewerOptions,
    state: Option<ViewerState>,
}

impl Viewer {
    pub const fn new(options: ViewerOptions) -> Self {
        Self {
            options,
            state: None,
        }
    }

    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<ViewerState> {
        let attributes = Window::default_attributes()
            .with_title("Prism Viewer")
            .with_inner_size(PhysicalSize::new(self.options.width, self.options.height));
        let window = Arc::new(event_loop.create_window(attributes)?);
        let size = window.inner_size();

        let scene = SharedScene::default();
        let config = EngineConfig::new("prism-viewer")
            .with_vsync(self.options.vsync)
            .with_target_fps(self.options.target_fps);
        let engine = Engine::new(
            window.as_ref(),
            (size.width, size.height),
            Arc::new(scene.clone()),
            config,
        )?;
        if !engine.ray_tracing_available() {
            warn!("Path traced stills are unavailable on this device");
        }

        let pivot = populate_scene(&engine, &scene, size)?;
        if let Some(path) = &self.options.environment {
            match engine.import_environment(path)? {
                Some(key) => scene.set_skybox(Some(key)),
                None => warn!("Could not load environment {}", path.display()),
            }
        }

        engine.set_active(true);
        Ok(ViewerState {
            engine,
            window,
            scene,
            pivot,
            orbit: OrbitInput::default(),
        })
    }
}

/// Register the demo meshes and materials and fill the scene. Returns the
/// orbit pivot.
fn populate_scene(
    engine: &Engine,
    scene: &SharedScene,
    size: PhysicalSize<u32>,
) -> anyhow::Result<Vec3> {
    let sphere = engine.add_mesh(MeshData::uv_sphere(0.6, 48, 24))?;
    let cube = engine.add_mesh(MeshData::cube(0.5))?;
    let ground = engine.add_mesh(MeshData::plane(12.0))?;

    let gold = engine.add_material(Material::Pbr(PbrMaterial {
        base_color: [1.0, 0.77, 0.34, 1.0],
        metallic: 1.0,
        roughness: 0.3,
        ..PbrMaterial::default()
    }))?;
    let clay = engine.add_material(Material::Lambert(LambertMaterial {
        albedo: [0.7, 0.35, 0.25, 1.0],
        ..LambertMaterial::default()
    }))?;
    let floor = engine.add_material(Material::Lambert(LambertMaterial::default()))?;
    let lamp = engine.add_material(Material::Emissive(EmissiveMaterial {
        color: [1.0, 0.85, 0.6],
        strength: 4.0,
    }))?;

    let objects = [
        SceneObject::new(ObjectId(0)).with_mesh(ground).with_material(floor),
        SceneObject::new(ObjectId(1))
            .with_mesh(sphere)
            .with_material(gold)
            .with_transform(Mat4::from_translation(Vec3::new(-1.2, 0.6, 0.0))),
        SceneObject::new(ObjectId(2))
            .with_mesh(cube)
            .with_material(clay)
            .with_transform(
                Mat4::from_translation(Vec3::new(1.2, 0.5, 0.0))
                    * Mat4::from_rotation_y(0.6),
            ),
        SceneObject::new(ObjectId(3))
            .with_mesh(sphere)
            .with_material(lamp)
            .with_transform(
                Mat4::from_translation(Vec3::new(0.0, 2.2, -1.5)) * Mat4::from_scale(Vec3::splat(0.25)),
            ),
    ];
    for object in objects {
        scene.upsert_object(object);
    }

    let pivot = Vec3::new(0.0, 0.5, 0.0);
    scene.set_camera(Camera::looking_at(
        Vec3::new(0.0, 2.5, 6.0),
        pivot,
        std::f32::consts::FRAC_PI_4,
        aspect(size),
    ));
    scene.set_sun(Some(DirectionalLight::default()));
    scene.add_point_light(PointLight {
        position: Vec3::new(0.0, 2.2, -1.5),
        color: Vec3::new(1.0, 0.85, 0.6),
        intensity: 6.0,
        radius: 8.0,
    });
    Ok(pivot)
}

fn aspect(size: PhysicalSize<u32>) -> f32 {
    size.width.max(1) as f32 / size.height.max(1) as f32
}

impl ViewerState {
    fn handle_click(&self) {
        let (x, y) = (self.orbit.cursor.0 as u32, self.orbit.cursor.1 as u32);
        match self.engine.pick(x, y) {
            Ok(PickResult::Object { id, .. }) => {
                info!("Selected {id}");
                self.scene.select(Some(id));
            }
            Ok(PickResult::GizmoAxis(axis)) => info!("Gizmo axis {axis:?}"),
            Ok(PickResult::Nothing) => self.scene.select(None),
            Err(e) => error!("Pick failed: {e}"),
        }
    }

    fn handle_cursor(&mut self, x: f64, y: f64) {
        let (dx, dy) = (x - self.orbit.cursor.0, y - self.orbit.cursor.1);
        self.orbit.cursor = (x, y);
        if self.orbit.dragging {
            let pivot = self.pivot;
            self.scene.update(|scene| {
                scene.camera.orbit(
                    pivot,
                    dx as f32 * ORBIT_SENSITIVITY,
                    dy as f32 * ORBIT_SENSITIVITY,
                );
            });
        }
    }

    fn handle_zoom(&self, lines: f32) {
        let pivot = self.pivot;
        self.scene.update(|scene| {
            let camera = &mut scene.camera;
            let distance = camera.distance_to(pivot);
            let step = (distance * ZOOM_STEP * lines).min(distance - MIN_DISTANCE);
            camera.position += camera.direction * step;
        });
    }

    fn handle_resize(&self, size: PhysicalSize<u32>) {
        if let Err(e) = self.engine.resize(size.width, size.height) {
            error!("Resize failed: {e}");
        }
        self.scene.update(|scene| scene.camera.set_aspect(aspect(size)));
    }

    fn render_still(&mut self, settings: &RenderSettings) {
        match self.engine.render_scene(settings) {
            Ok(Some(report)) => info!(
                "Wrote {} ({} samples, {:.2?})",
                report.path.display(),
                settings.samples,
                report.elapsed
            ),
            Ok(None) => warn!("Nothing to path trace"),
            Err(e) => error!("Path trace failed: {e}"),
        }
    }
}

impl ApplicationHandler for Viewer {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }
        match self.create_state(event_loop) {
            Ok(state) => {
                info!("Viewer ready");
                self.state = Some(state);
            }
            Err(e) => {
                error!("Failed to initialize viewer: {e:#}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(state) = &mut self.state else {
            return;
        };

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    state.engine.shutdown();
                }
                event_loop.exit();
            }
            WindowEvent::Resized(size) => state.handle_resize(size),
            WindowEvent::Focused(focused) => state.engine.set_active(focused),
            WindowEvent::CursorMoved { position, .. } => state.handle_cursor(position.x, position.y),
            WindowEvent::MouseInput {
                state: button_state,
                button,
                ..
            } => match (button, button_state) {
                (MouseButton::Left, ElementState::Pressed) => state.handle_click(),
                (MouseButton::Right, pressed) => {
                    state.orbit.dragging = pressed == ElementState::Pressed;
                }
                _ => {}
            },
            WindowEvent::MouseWheel { delta, .. } => {
                let lines = match delta {
                    MouseScrollDelta::LineDelta(_, y) => y,
                    MouseScrollDelta::PixelDelta(p) => p.y as f32 / 40.0,
                };
                state.handle_zoom(lines);
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => match code {
                KeyCode::KeyR => {
                    let settings = self.options.trace.clone();
                    state.render_still(&settings);
                }
                KeyCode::Space => {
                    let active = state.engine.state() != prism_app::LoopState::Running;
                    state.engine.set_active(active);
                }
                KeyCode::Escape => event_loop.exit(),
                _ => {}
            },
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let Some(state) = &self.state else {
            return;
        };
        if let Some(e) = state.engine.take_error() {
            error!("Renderer stopped: {e}");
            event_loop.exit();
        } else if state.engine.state() == prism_app::LoopState::Stopped {
            event_loop.exit();
        }
        state.window.set_title(&format!("Prism Viewer ({} frames)", state.engine.frames()));
    }
}
