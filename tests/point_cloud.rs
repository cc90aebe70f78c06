use sdf_forge::graph::library::{demo_scene_3d, pinhole_camera_3d, sphere_3d, transform_3d};
use sdf_forge::graph::{Scene, SceneMode, StageItem, StageKind};
use sdf_forge::pipeline::PipelineStage;
use sdf_forge::{CpuBackend, PipelineSettings, PointCloudPipeline, RenderError};

const WHITE: [f32; 4] = [1.0; 4];

fn pipeline() -> PointCloudPipeline<CpuBackend> {
    PointCloudPipeline::new(CpuBackend::new(), PipelineSettings::default())
}

#[test]
fn every_visible_point_lights_one_texel() {
    let mut p = pipeline();
    p.build(&demo_scene_3d());
    p.render(32.0, 32.0).unwrap();
    let (w, h, texels) = p.read_result().unwrap();
    assert_eq!((w, h), (32, 32));
    let lit = texels.iter().filter(|t| **t == WHITE).count();
    assert_eq!(p.visible_points(), 2);
    assert_eq!(lit, 2);
}

#[test]
fn points_behind_the_camera_are_not_drawn() {
    let scene = Scene::new(SceneMode::ThreeD)
        .with_item(
            StageKind::PreStage,
            StageItem::new("cam").with_component("camera", pinhole_camera_3d("cam")),
        )
        .with_item(
            StageKind::ShapeStage,
            StageItem::new("front").with_shape(sphere_3d("a", 1.0)),
        )
        .with_item(
            StageKind::ShapeStage,
            StageItem::new("behind").with_transform(transform_3d("t", [0.0, 0.0, -20.0])),
        );
    let mut p = pipeline();
    p.build(&scene);
    assert_eq!(p.points().len(), 2);
    p.render(16.0, 16.0).unwrap();
    assert_eq!(p.visible_points(), 1);
}

#[test]
fn render_contract_matches_the_kernel_pipeline() {
    let mut p = pipeline();
    assert_eq!(p.render(4.0, 4.0), Err(RenderError::NotBuilt));
    p.build(&demo_scene_3d());
    assert_eq!(p.stage(), PipelineStage::Compiled);
    assert!(matches!(
        p.render(f32::NAN, 4.0),
        Err(RenderError::InvalidResolution { .. })
    ));
    assert!(p.render_if_resolution_changed(8.0, 8.0).unwrap());
    assert!(!p.render_if_resolution_changed(8.0, 8.0).unwrap());
    assert_eq!(p.backend().texture_count(), 1);
    assert!(p.render_if_resolution_changed(8.0, 4.0).unwrap());
    assert_eq!(p.backend().texture_count(), 1);
}

#[test]
fn camera_fields_move_the_projection() {
    let scene = |fov: f32| {
        Scene::new(SceneMode::ThreeD)
            .with_item(
                StageKind::PreStage,
                StageItem::new("cam")
                    .with_component("camera", pinhole_camera_3d("cam").with_field("_fov", fov)),
            )
            .with_item(
                StageKind::ShapeStage,
                StageItem::new("edge").with_shape(sphere_3d("s", 1.0).with_field("_posX", 2.5)),
            )
    };
    let mut p = pipeline();
    p.build(&scene(30.0));
    p.render(16.0, 16.0).unwrap();
    assert_eq!(p.visible_points(), 0);

    p.build(&scene(90.0));
    p.render(16.0, 16.0).unwrap();
    assert_eq!(p.visible_points(), 1);
    assert_eq!(p.camera().fov_y, 90.0);
}
