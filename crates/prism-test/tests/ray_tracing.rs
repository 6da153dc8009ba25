//! Path tracer scenarios. All of these need a ray tracing capable GPU.

use approx::assert_abs_diff_eq;
use prism_core::{OutputFormat, RenderSettings, SceneSnapshot};
use prism_rt::IntegratorState;
use prism_test::{row_of_cubes, write_test_hdr, HeadlessEngine};

fn engine_with_tracer() -> HeadlessEngine {
    let engine = HeadlessEngine::new().unwrap();
    assert!(engine.tracer().is_some(), "device lacks ray tracing support");
    engine
}

#[test]
#[ignore = "Requires GPU hardware"]
fn one_blas_per_mesh_object() {
    let mut engine = engine_with_tracer();
    let scene = row_of_cubes(engine.resources_mut(), 4).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let settings = RenderSettings::default()
        .with_samples(4)
        .with_resolution(64, 64)
        .with_output(dir.path().join("row.png"));

    let report = engine.trace(&scene, &settings).unwrap().unwrap();
    assert_eq!(report.blas_count, 5);
    assert_eq!(report.tlas_instance_count, 5);
    assert!(report.path.exists());
}

#[test]
#[ignore = "Requires GPU hardware"]
fn repeated_renders_leave_no_acceleration_structures() {
    let mut engine = engine_with_tracer();
    let scene = row_of_cubes(engine.resources_mut(), 3).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let settings = RenderSettings::default()
        .with_samples(1)
        .with_resolution(32, 32)
        .with_output(dir.path().join("leak.png"));

    for _ in 0..3 {
        engine.trace(&scene, &settings).unwrap();
        let tracer = engine.tracer().unwrap();
        assert_eq!(tracer.tracker().live(), 0);
        assert_eq!(tracer.state(), IntegratorState::Idle);
    }
}

#[test]
#[ignore = "Requires GPU hardware"]
fn empty_scene_renders_nothing() {
    let mut engine = engine_with_tracer();
    let dir = tempfile::tempdir().unwrap();
    let settings = RenderSettings::default().with_output(dir.path().join("empty.png"));

    let report = engine.trace(&SceneSnapshot::default(), &settings).unwrap();
    assert!(report.is_none());
    assert!(!dir.path().join("empty.png").exists());
}

#[test]
#[ignore = "Requires GPU hardware"]
fn zero_samples_still_completes() {
    let mut engine = engine_with_tracer();
    let scene = row_of_cubes(engine.resources_mut(), 1).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let settings = RenderSettings::default()
        .with_samples(0)
        .with_resolution(16, 16)
        .with_output(dir.path().join("zero.hdr"));

    let report = engine.trace(&scene, &settings).unwrap().unwrap();
    let written = image::open(&report.path).unwrap().into_rgb32f();
    assert_eq!((written.width(), written.height()), (16, 16));
    for pixel in written.pixels() {
        for channel in pixel.0 {
            assert_abs_diff_eq!(channel, 0.0);
        }
    }
}

#[test]
#[ignore = "Requires GPU hardware"]
fn hdr_still_with_environment() {
    let mut engine = engine_with_tracer();
    let dir = tempfile::tempdir().unwrap();
    let sky = dir.path().join("sky.hdr");
    write_test_hdr(&sky, 256, 128).unwrap();
    let key = engine.import_environment(&sky).unwrap();
    assert!(key.is_some());

    let mut scene = row_of_cubes(engine.resources_mut(), 1).unwrap();
    scene.skybox = key;
    let output = dir.path().join("still.hdr");
    let settings = RenderSettings::default()
        .with_samples(256)
        .with_max_depth(8)
        .with_resolution(1024, 1024)
        .with_format(OutputFormat::Hdr)
        .with_output(&output);

    let report = engine.trace(&scene, &settings).unwrap().unwrap();
    assert!(report.elapsed.as_nanos() > 0);
    assert_eq!(report.path, output);

    let written = image::open(&output).unwrap();
    assert_eq!((written.width(), written.height()), (1024, 1024));
    assert!(matches!(written, image::DynamicImage::ImageRgb32F(_)));
}
