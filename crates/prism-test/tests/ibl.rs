//! Environment import and IBL bake scenarios.

use prism_core::constants::CUBE_FACES;
use prism_core::math::mip_count;
use prism_render::IblConfig;
use prism_test::{write_test_hdr, HeadlessEngine};

#[test]
#[ignore = "Requires GPU hardware"]
fn imported_environment_bakes_full_cubemaps() {
    let ibl = IblConfig::default()
        .with_environment_resolution(64)
        .with_prefilter_resolution(32);
    let mut engine = HeadlessEngine::with_ibl(ibl).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("env.hdr");
    write_test_hdr(&path, 128, 64).unwrap();

    let key = engine.import_environment(&path).unwrap().unwrap();
    let asset = engine.resources().environment_asset(&key).unwrap();
    assert_eq!(asset.face_count(), CUBE_FACES);
    assert_eq!(asset.prefiltered_mip_count(), mip_count(32));
    assert_eq!(asset.prefiltered_mip_count(), 6);

    let binding = engine.resources().environment(Some(&key)).unwrap();
    assert!(binding.active);
    assert_eq!(binding.prefiltered_mips, 6);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn importing_twice_reuses_the_bake() {
    let mut engine = HeadlessEngine::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("env.hdr");
    write_test_hdr(&path, 64, 32).unwrap();

    let first = engine.import_environment(&path).unwrap();
    let second = engine.import_environment(&path).unwrap();
    assert_eq!(first, second);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn undecodable_environment_is_skipped() {
    let mut engine = HeadlessEngine::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.hdr");
    std::fs::write(&path, b"not an image").unwrap();

    assert!(engine.import_environment(&path).unwrap().is_none());
    let binding = engine.resources().environment(None).unwrap();
    assert!(!binding.active);
}
