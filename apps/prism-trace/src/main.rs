//! Headless path traced stills.
//!
//! Builds a demo scene, path traces it once and writes the image.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p prism-trace -- [OPTIONS]
//! ```
//!
//! Settings are read from `--settings <FILE>` (JSON) first; command line
//! flags override individual fields.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use glam::{Mat4, Vec3};
use tracing::{info, warn};

use prism_core::{
    Camera, DirectionalLight, LambertMaterial, Material, MeshData, ObjectId, PbrMaterial,
    RenderSettings, SceneObject, SceneSnapshot,
};
use prism_gpu::GpuContextBuilder;
use prism_render::{IblConfig, RenderResources};
use prism_rt::PathTracer;

/// Command line options.
#[derive(Debug, Clone, PartialEq)]
struct TraceOptions {
    settings: RenderSettings,
    environment: Option<PathBuf>,
    /// Number of spheres in the demo row.
    spheres: u32,
}

impl TraceOptions {
    fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let settings_file = flag_value(args, "--settings").map(PathBuf::from);
        let base = match &settings_file {
            Some(path) => load_settings(path)?,
            None => RenderSettings::default(),
        };
        let settings = base.parse_args(args)?;
        settings.validate()?;

        let spheres = match flag_value(args, "--spheres") {
            Some(v) => v.parse().with_context(|| format!("--spheres '{v}'"))?,
            None => 3,
        };
        if spheres == 0 {
            bail!("--spheres must be at least 1");
        }

        Ok(Self {
            settings,
            environment: flag_value(args, "--environment").map(PathBuf::from),
            spheres,
        })
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn load_settings(path: &Path) -> anyhow::Result<RenderSettings> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading settings {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing settings {}", path.display()))
}

/// A row of PBR spheres with increasing roughness on a diffuse floor.
fn demo_scene(
    resources: &mut RenderResources,
    spheres: u32,
    aspect: f32,
) -> anyhow::Result<SceneSnapshot> {
    let sphere = resources.add_mesh(MeshData::uv_sphere(0.5, 64, 32))?;
    let floor = resources.add_mesh(MeshData::plane(20.0))?;
    let floor_material = resources.add_material(Material::Lambert(LambertMaterial::default()))?;

    let mut objects = vec![SceneObject::new(ObjectId(0))
        .with_mesh(floor)
        .with_material(floor_material)];
    let span = (spheres - 1) as f32 * 1.25;
    for i in 0..spheres {
        let t = if spheres > 1 {
            i as f32 / (spheres - 1) as f32
        } else {
            0.5
        };
        let material = resources.add_material(Material::Pbr(PbrMaterial {
            base_color: [0.9, 0.9, 0.9, 1.0],
            metallic: 1.0,
            roughness: 0.05 + 0.9 * t,
            ..PbrMaterial::default()
        }))?;
        objects.push(
            SceneObject::new(ObjectId(i + 1))
                .with_mesh(sphere)
                .with_material(material)
                .with_transform(Mat4::from_translation(Vec3::new(
                    i as f32 * 1.25 - span * 0.5,
                    0.5,
                    0.0,
                ))),
        );
    }

    Ok(SceneSnapshot {
        camera: Camera::looking_at(
            Vec3::new(0.0, 1.5, span.max(2.0) + 3.0),
            Vec3::new(0.0, 0.5, 0.0),
            std::f32::consts::FRAC_PI_4,
            aspect,
        ),
        sun: Some(DirectionalLight::default()),
        objects,
        ..SceneSnapshot::default()
    })
}

fn run(options: &TraceOptions) -> anyhow::Result<()> {
    let gpu = Arc::new(
        GpuContextBuilder::new()
            .app_name("prism-trace")
            .validation(cfg!(debug_assertions))
            .headless()
            .build()?,
    );
    info!("GPU: {}", gpu.capabilities().summary());

    let mut resources = RenderResources::new(Arc::clone(&gpu), IblConfig::default())?;
    let mut tracer = PathTracer::new(Arc::clone(&gpu)).context("path tracer")?;

    let settings = &options.settings;
    let aspect = settings.width as f32 / settings.height as f32;
    let mut scene = demo_scene(&mut resources, options.spheres, aspect)?;
    if let Some(path) = &options.environment {
        scene.skybox = resources.import_environment(path)?;
        if scene.skybox.is_none() {
            warn!("Could not load environment {}, using black", path.display());
        }
    }

    let environment = resources.environment(scene.skybox.as_ref())?;
    let source = environment.active.then_some(environment.source);
    match tracer.render(&scene, &resources, source.as_deref(), settings)? {
        Some(report) => info!(
            "Wrote {} ({}x{}, {} spp, depth {}) in {:.2?}",
            report.path.display(),
            settings.width,
            settings.height,
            settings.samples,
            settings.max_depth,
            report.elapsed
        ),
        None => warn!("Scene was empty, nothing written"),
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    prism_app::init_logging();
    if !prism_rt::is_available() {
        bail!("prism-trace was built without the ray_tracing feature");
    }
    let options = TraceOptions::from_args(&args)?;
    run(&options)
}

fn print_help() {
    eprintln!(
        "Prism headless path tracer

USAGE:
    cargo run -p prism-trace -- [OPTIONS]

OPTIONS:
    --settings <FILE>       JSON render settings; flags below override it
    --samples <N>           Samples per pixel (default: 64)
    --max-depth <N>         Maximum bounce count (default: 4)
    --width <N>             Image width (default: 1024)
    --height <N>            Image height (default: 1024)
    -o, --output <PATH>     Output file; .hdr selects Radiance HDR
    --format <png|hdr>      Output encoding
    --environment <PATH>    Equirectangular environment image
    --spheres <N>           Spheres in the demo row (default: 3)
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::OutputFormat;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("prism-trace")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_without_flags() {
        let options = TraceOptions::from_args(&args(&[])).unwrap();
        assert_eq!(options.settings, RenderSettings::default());
        assert_eq!(options.spheres, 3);
        assert!(options.environment.is_none());
    }

    #[test]
    fn flags_override_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("settings.json");
        std::fs::write(
            &file,
            r#"{ "samples": 256, "max_depth": 8, "width": 640, "height": 480 }"#,
        )
        .unwrap();

        let options = TraceOptions::from_args(&args(&[
            "--settings",
            file.to_str().unwrap(),
            "--samples",
            "16",
            "-o",
            "still.hdr",
        ]))
        .unwrap();
        assert_eq!(options.settings.samples, 16);
        assert_eq!(options.settings.max_depth, 8);
        assert_eq!((options.settings.width, options.settings.height), (640, 480));
        assert_eq!(options.settings.format, OutputFormat::Hdr);
    }

    #[test]
    fn invalid_resolution_is_rejected() {
        assert!(TraceOptions::from_args(&args(&["--width", "0"])).is_err());
    }

    #[test]
    fn zero_spheres_is_rejected() {
        assert!(TraceOptions::from_args(&args(&["--spheres", "0"])).is_err());
    }

    #[test]
    fn missing_settings_file_is_an_error() {
        assert!(TraceOptions::from_args(&args(&["--settings", "/nonexistent/s.json"])).is_err());
    }
}
