//! Selection attachment scenarios on the offscreen raster path.

use prism_core::selection::{GIZMO_AXIS_IDS, MAX_OBJECT_ID};
use prism_core::{ObjectId, PickResult};
use prism_test::{row_of_cubes, select, HeadlessEngine};

const SIZE: u32 = 128;

#[test]
#[ignore = "Requires GPU hardware"]
fn unchanged_frames_pick_identically() {
    let mut engine = HeadlessEngine::new().unwrap();
    let scene = row_of_cubes(engine.resources_mut(), 1).unwrap();
    engine.enable_raster(SIZE, SIZE).unwrap();

    engine.render_frame(&scene).unwrap();
    let first = engine.selection_texel(SIZE / 2, SIZE / 2).unwrap();
    engine.render_frame(&scene).unwrap();
    let second = engine.selection_texel(SIZE / 2, SIZE / 2).unwrap();

    assert!(first.is_some());
    assert_eq!(first, second);
    assert_eq!(
        engine.pick(SIZE / 2, SIZE / 2).unwrap(),
        PickResult::Object {
            id: ObjectId(1),
            selected: false
        }
    );
}

#[test]
#[ignore = "Requires GPU hardware"]
fn gizmo_axes_pick_reserved_ids() {
    let mut engine = HeadlessEngine::new().unwrap();
    let mut scene = row_of_cubes(engine.resources_mut(), 1).unwrap();
    select(&mut scene, ObjectId(1));
    engine.enable_raster(SIZE, SIZE).unwrap();

    let stats = engine.render_frame(&scene).unwrap();
    assert!(stats.gizmo_drawn);

    let mut axes = Vec::new();
    for y in (0..SIZE).step_by(2) {
        for x in (0..SIZE).step_by(2) {
            if let Some([id, _, _]) = engine.selection_texel(x, y).unwrap() {
                let raw = id.round() as u32;
                if raw > MAX_OBJECT_ID {
                    assert!(GIZMO_AXIS_IDS.contains(&raw), "unexpected reserved id {raw}");
                }
            }
            if let PickResult::GizmoAxis(axis) = engine.pick(x, y).unwrap() {
                axes.push(axis);
            }
        }
    }
    assert!(!axes.is_empty(), "no gizmo axis under any sampled pixel");
}

#[test]
#[ignore = "Requires GPU hardware"]
fn background_picks_nothing() {
    let mut engine = HeadlessEngine::new().unwrap();
    let scene = row_of_cubes(engine.resources_mut(), 1).unwrap();
    engine.enable_raster(SIZE, SIZE).unwrap();
    engine.render_frame(&scene).unwrap();

    // Top row looks over the ground plane into the sky
    assert_eq!(engine.pick(SIZE / 2, 0).unwrap(), PickResult::Nothing);
}
