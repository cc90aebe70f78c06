use sdf_forge::compiler::MonitorTap;
use sdf_forge::config::FAR_DISTANCE;
use sdf_forge::graph::library::{
    circle_2d, demo_scene_2d, demo_scene_3d, pinhole_camera_3d, solid_colorize, solid_render_2d,
    sphere_3d,
};
use sdf_forge::graph::{CombineOp, Scene, SceneMode, StageItem, StageKind};
use sdf_forge::pipeline::{PipelineStage, shape_instance_name};
use sdf_forge::{BuildError, CpuBackend, Pipeline, PipelineSettings, RenderError};

const BLUE: [f32; 4] = [0.0, 0.0, 1.0, 1.0];
const WHITE: [f32; 4] = [1.0; 4];

fn pipeline(settings: PipelineSettings) -> Pipeline<CpuBackend> {
    Pipeline::new(CpuBackend::new(), settings)
}

fn scene_2d(shapes: Vec<StageItem>) -> Scene {
    let mut scene = Scene::new(SceneMode::TwoD)
        .with_item(
            StageKind::PreStage,
            StageItem::new("bg").with_component("colorize", solid_colorize("background", BLUE)),
        )
        .with_item(
            StageKind::RenderStage,
            StageItem::new("r").with_component("render", solid_render_2d("render")),
        );
    scene.stage_mut(StageKind::ShapeStage).items = shapes;
    scene
}

fn circle_item(id: &str, radius: f32) -> StageItem {
    StageItem::new(id).with_shape(circle_2d(id, radius))
}

fn texel(texels: &[[f32; 4]], width: u32, x: u32, y: u32) -> [f32; 4] {
    texels[(y * width + x) as usize]
}

#[test]
fn circle_renders_over_the_background() {
    let mut p = pipeline(PipelineSettings::default());
    assert!(p.build(&scene_2d(vec![circle_item("c", 3.0)]), None).is_empty());
    p.render(8.0, 8.0).unwrap();
    let (w, h, texels) = p.read_result().unwrap();
    assert_eq!((w, h), (8, 8));
    assert_eq!(texel(&texels, w, 4, 4), WHITE);
    assert_eq!(texel(&texels, w, 0, 0), BLUE);
    assert_eq!(p.stage(), PipelineStage::HitAndNormals);

    let depth = p.pair_texture("depth").unwrap();
    let depth = p.read_texture(depth).unwrap();
    assert_eq!(texel(&depth, 8, 4, 4), [-3.0, 1.0, 0.0, 0.0]);
}

#[test]
fn missing_passes_fall_back_to_sentinels() {
    let mut p = pipeline(PipelineSettings::default());
    p.build(&scene_2d(Vec::new()), None);
    p.render(4.0, 4.0).unwrap();
    let depth = p.pair_texture("depth").unwrap();
    let depth = p.read_texture(depth).unwrap();
    assert!(depth.iter().all(|t| *t == [FAR_DISTANCE, 0.0, 0.0, 0.0]));
    let (_, _, result) = p.read_result().unwrap();
    assert!(result.iter().all(|t| *t == BLUE));

    // No background and no render: the result is the fallback clear color.
    let fallback = [0.5, 0.25, 0.0, 1.0];
    let mut p = pipeline(PipelineSettings {
        background_fallback: fallback,
        ..PipelineSettings::default()
    });
    p.build(&Scene::new(SceneMode::TwoD), None);
    p.render(2.0, 2.0).unwrap();
    let (_, _, result) = p.read_result().unwrap();
    assert!(result.iter().all(|t| *t == fallback));
}

#[test]
fn resize_checks_are_idempotent() {
    let mut p = pipeline(PipelineSettings::default());
    p.build(&scene_2d(vec![circle_item("c", 2.0)]), None);
    assert!(p.render_if_resolution_changed(8.0, 8.0).unwrap());
    let dispatches = p.backend().dispatch_count();
    assert!(!p.render_if_resolution_changed(8.0, 8.0).unwrap());
    assert!(!p.render_if_resolution_changed(7.6, 8.2).unwrap());
    assert_eq!(p.backend().dispatch_count(), dispatches);

    assert!(p.render_if_resolution_changed(4.0, 8.0).unwrap());
    assert_eq!(p.resolution(), Some((4, 8)));
    assert!(matches!(
        p.render_if_resolution_changed(-1.0, 8.0),
        Err(RenderError::InvalidResolution { .. })
    ));
    // The failed request left the last result alone.
    assert_eq!(p.resolution(), Some((4, 8)));
}

#[test]
fn monitor_captures_the_running_distance() {
    let mut p = pipeline(PipelineSettings::default());
    let tap = MonitorTap::new("c", "out");
    assert!(p.build(&scene_2d(vec![circle_item("c", 3.0)]), Some(&tap)).is_empty());
    p.render(8.0, 8.0).unwrap();
    let (texture, channels) = p.monitor_texture().expect("monitor texture");
    assert_eq!(channels, 1);
    let monitor = p.read_texture(texture).unwrap();
    assert_eq!(texel(&monitor, 8, 4, 4), [-3.0, -3.0, -3.0, 1.0]);
}

fn result_with_tap(scene: &Scene, tap: Option<&MonitorTap>) -> Vec<[f32; 4]> {
    let mut p = pipeline(PipelineSettings::default());
    assert!(p.build(scene, tap).is_empty());
    p.render(8.0, 8.0).unwrap();
    p.read_result().unwrap().2
}

#[test]
fn out_tap_leaves_the_result_untouched() {
    let scene = scene_2d(vec![circle_item("c", 3.0)]);
    let tap = MonitorTap::new("c", "out");
    assert_eq!(result_with_tap(&scene, Some(&tap)), result_with_tap(&scene, None));

    let scene = demo_scene_3d();
    let tap = MonitorTap::new("sphere", "out");
    assert_eq!(result_with_tap(&scene, Some(&tap)), result_with_tap(&scene, None));
}

#[test]
fn unknown_monitor_fragment_is_a_diagnostic() {
    let mut p = pipeline(PipelineSettings::default());
    let tap = MonitorTap::new("c", "nope");
    let diagnostics = p.build(&scene_2d(vec![circle_item("c", 3.0)]), Some(&tap));
    assert_eq!(diagnostics.len(), 1);
    assert!(matches!(diagnostics[0].error, BuildError::MonitorTargetMissing { .. }));
    assert!(p.monitor_texture().is_none());
    assert!(p.render(4.0, 4.0).is_ok());
}

#[test]
fn one_failing_shape_does_not_stop_the_others() {
    let broken = StageItem::new("broken")
        .with_shape(circle_2d("ok", 1.0))
        .with_shape(solid_colorize("paint", WHITE));
    let mut p = pipeline(PipelineSettings::default());
    let diagnostics = p.build(&scene_2d(vec![circle_item("c", 3.0), broken]), None);
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].instance, shape_instance_name(1));
    assert_eq!(diagnostics[0].component.as_deref(), Some("paint"));
    assert_eq!(p.shape_instances(), [shape_instance_name(0)]);
    p.render(8.0, 8.0).unwrap();
    let (w, _, texels) = p.read_result().unwrap();
    assert_eq!(texel(&texels, w, 4, 4), WHITE);
}

#[test]
fn value_edits_apply_without_a_rebuild() {
    let mut p = pipeline(PipelineSettings::default());
    p.build(&scene_2d(vec![circle_item("c", 3.0)]), None);
    let kernel = p.instance("shape_0").unwrap().kernel();

    let mut moved = scene_2d(vec![StageItem::new("c").with_shape(circle_2d("c", 3.0).with_field("_posX", 2.0))]);
    assert!(p.update_values(&moved).unwrap() > 0);
    assert_eq!(p.instance("shape_0").unwrap().kernel(), kernel);
    p.render(8.0, 8.0).unwrap();
    let depth = p.pair_texture("depth").unwrap();
    let depth = p.read_texture(depth).unwrap();
    assert_eq!(texel(&depth, 8, 4, 4)[0], -1.0);

    // Removing a compiled component needs a rebuild; nothing is half-applied.
    moved.stage_mut(StageKind::ShapeStage).items.clear();
    assert!(matches!(
        p.update_values(&moved),
        Err(BuildError::LayoutChanged { .. })
    ));
    p.render(8.0, 8.0).unwrap();
    let depth = p.pair_texture("depth").unwrap();
    let depth = p.read_texture(depth).unwrap();
    assert_eq!(texel(&depth, 8, 4, 4)[0], -1.0);
}

fn ring_item(hole_x: f32) -> StageItem {
    StageItem::new("ring").with_shape(
        circle_2d("outer", 3.0).with_sub_component(
            circle_2d("hole", 1.0)
                .with_combine(CombineOp::Subtract)
                .with_field("_posX", hole_x),
        ),
    )
}

#[test]
fn sub_component_values_refresh_in_place() {
    let mut p = pipeline(PipelineSettings::default());
    assert!(p.build(&demo_scene_2d(), None).is_empty());
    assert!(p.update_values(&demo_scene_2d()).unwrap() > 0);

    assert!(p.build(&scene_2d(vec![ring_item(0.0)]), None).is_empty());
    let kernel = p.instance("shape_0").unwrap().kernel();
    p.update_values(&scene_2d(vec![ring_item(1.0)])).unwrap();
    assert_eq!(p.instance("shape_0").unwrap().kernel(), kernel);
    p.render(8.0, 8.0).unwrap();
    let depth = p.pair_texture("depth").unwrap();
    let depth = p.read_texture(depth).unwrap();
    assert_eq!(texel(&depth, 8, 4, 4)[0], 0.0);

    // A new link in the chain changes the kernel.
    let longer = StageItem::new("ring").with_shape(
        circle_2d("outer", 3.0).with_sub_component(
            circle_2d("hole", 1.0)
                .with_combine(CombineOp::Subtract)
                .with_sub_component(circle_2d("dot", 0.5)),
        ),
    );
    assert!(matches!(
        p.update_values(&scene_2d(vec![longer])),
        Err(BuildError::LayoutChanged { key }) if key == "dot"
    ));
}

#[test]
fn scenes_without_a_camera_refresh_in_place() {
    let scene = Scene::new(SceneMode::ThreeD).with_item(
        StageKind::ShapeStage,
        StageItem::new("ball").with_shape(sphere_3d("ball", 1.0)),
    );
    let mut p = pipeline(PipelineSettings::default());
    p.build(&scene, None);
    assert!(p.instance("camera3D").is_some());
    assert!(p.update_values(&scene).unwrap() > 0);

    let with_camera = scene.with_item(
        StageKind::PreStage,
        StageItem::new("cam").with_component("camera", pinhole_camera_3d("cam")),
    );
    assert!(matches!(
        p.update_values(&with_camera),
        Err(BuildError::LayoutChanged { key }) if key == "cam"
    ));
}

#[test]
fn stage_ceiling_limits_the_3d_ladder() {
    let scene = demo_scene_3d();
    for (ceiling, expected) in [
        (PipelineStage::HitAndNormals, PipelineStage::HitAndNormals),
        (PipelineStage::Ao, PipelineStage::Ao),
        (PipelineStage::ShadowsAndMaterials, PipelineStage::ShadowsAndMaterials),
    ] {
        let mut p = pipeline(PipelineSettings {
            max_stage: ceiling,
            ..PipelineSettings::default()
        });
        assert!(p.build(&scene, None).is_empty());
        p.render(6.0, 6.0).unwrap();
        assert_eq!(p.stage(), expected, "ceiling {ceiling}");
        assert_eq!(p.result_texture(), p.texture("result"));
    }
}

#[test]
fn minimal_preview_stops_at_hit_and_normals() {
    let mut p = pipeline(PipelineSettings::default());
    p.set_minimal_preview(true);
    p.build(&demo_scene_3d(), None);
    p.render(4.0, 4.0).unwrap();
    assert_eq!(p.stage(), PipelineStage::HitAndNormals);
    assert!(p.texture("composite").is_none());
}

#[test]
fn full_3d_render_reaches_reflection() {
    let mut p = pipeline(PipelineSettings::default());
    assert!(p.build(&demo_scene_3d(), None).is_empty());
    let result = p.render(6.0, 6.0).unwrap();
    assert_eq!(p.stage(), PipelineStage::Reflection);
    assert_eq!(Some(result), p.texture("composite"));

    let (_, _, texels) = p.read_result().unwrap();
    assert!(texels.iter().all(|t| t.iter().all(|c| c.is_finite())));
    // Shapes in view: not every pixel shows the same color.
    assert!(texels.iter().any(|t| *t != texels[0]));
}

#[test]
fn rebuild_resets_the_stage_and_render_requires_a_build() {
    let mut p = pipeline(PipelineSettings::default());
    assert_eq!(p.render(4.0, 4.0), Err(RenderError::NotBuilt));
    p.build(&scene_2d(vec![circle_item("c", 1.0)]), None);
    p.render(4.0, 4.0).unwrap();
    assert_eq!(p.stage(), PipelineStage::HitAndNormals);
    p.build(&scene_2d(vec![circle_item("c", 1.0)]), None);
    assert_eq!(p.stage(), PipelineStage::Compiled);
}
