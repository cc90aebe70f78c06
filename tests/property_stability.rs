use proptest::prelude::*;

use sdf_forge::compiler::{Instance, StreamBuilder, StreamKind, StreamOptions};
use sdf_forge::graph::library::{box_2d, circle_2d};
use sdf_forge::graph::{Fragment, Scene, SceneMode, StageItem, StageKind};
use sdf_forge::values::{extract_fragment_value, insert_fragment_value};
use sdf_forge::CpuBackend;

fn scene(radius: f32, x: f32, half: [f32; 2]) -> Scene {
    Scene::new(SceneMode::TwoD).with_item(
        StageKind::ShapeStage,
        StageItem::new("s")
            .with_shape(circle_2d("c", radius).with_field("_posX", x))
            .with_shape(box_2d("b", half[0], half[1])),
    )
}

fn build(scene: &Scene, backend: &mut CpuBackend) -> Instance {
    let mut builder = StreamBuilder::new();
    builder
        .open_stream(StreamKind::Sdf2D, "shape_0", StreamOptions::default())
        .unwrap();
    for shape in scene.items(StageKind::ShapeStage)[0].shapes() {
        builder.push_component(shape, &[]).unwrap();
    }
    builder.close_stream(backend).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn refreshed_values_match_a_fresh_build(
        radius in 0.1f32..40.0,
        x in -100f32..100.0,
        w in 0.1f32..20.0,
        h in 0.1f32..20.0,
    ) {
        let mut backend = CpuBackend::new().without_validation();
        let mut instance = build(&scene(1.0, 0.0, [1.0, 1.0]), &mut backend);
        let edited = scene(radius, x, [w, h]);
        let written = instance.refresh_values(&edited).unwrap();
        prop_assert!(written > 0);

        let fresh = build(&edited, &mut backend);
        prop_assert_eq!(instance.properties().records(), fresh.properties().records());
        prop_assert_eq!(instance.properties().layout(), fresh.properties().layout());
        prop_assert_eq!(instance.source(), fresh.source());
    }

    #[test]
    fn inserts_keep_the_declared_arity(
        values in proptest::collection::vec(-1000f32..1000.0, 3..=6),
    ) {
        let mut fragment = Fragment::vector(&[0.0, 0.0, 0.0]);
        insert_fragment_value(&mut fragment, &values).unwrap();
        prop_assert_eq!(fragment.arguments.len(), 3);
        let extracted = extract_fragment_value(&fragment).unwrap();
        prop_assert_eq!(&extracted[..3], &values[..3]);
    }

    #[test]
    fn narrow_inserts_change_nothing(values in proptest::collection::vec(-10f32..10.0, 0..3)) {
        let mut fragment = Fragment::vector(&[1.0, 2.0, 3.0]);
        let before = fragment.clone();
        prop_assert!(insert_fragment_value(&mut fragment, &values).is_err());
        prop_assert_eq!(fragment, before);
    }
}
