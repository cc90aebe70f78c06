//! Default component library and demo scenes.

use super::component::{CombineOp, Component, ComponentKind, Statement};
use super::fragment::Fragment;
use super::scene::{Scene, SceneMode, StageItem, StageKind};

fn var(name: &str, ty: &str) -> Fragment {
    Fragment::variable(name, ty)
}

fn call(name: &str, ty: &str, args: Vec<Fragment>) -> Fragment {
    Fragment::call(name, ty, args)
}

fn sub(ty: &str, a: Fragment, b: Fragment) -> Fragment {
    Fragment::arith("-", ty, a, b)
}

fn add(ty: &str, a: Fragment, b: Fragment) -> Fragment {
    Fragment::arith("+", ty, a, b)
}

fn mul(ty: &str, a: Fragment, b: Fragment) -> Fragment {
    Fragment::arith("*", ty, a, b)
}

fn div(ty: &str, a: Fragment, b: Fragment) -> Fragment {
    Fragment::arith("/", ty, a, b)
}

fn out_distance(value: Fragment) -> Statement {
    Statement::assign(Fragment::out("outDistance", "float"), value)
}

fn out_color(value: Fragment) -> Statement {
    Statement::assign(Fragment::out("outColor", "float4"), value)
}

pub fn circle_2d(id: &str, radius: f32) -> Component {
    Component::new(id, ComponentKind::Sdf2D)
        .named("Circle")
        .with_statement(out_distance(sub(
            "float",
            call("length", "float", vec![var("position", "float2")]),
            Fragment::scalar(radius),
        )))
}

pub fn box_2d(id: &str, half_width: f32, half_height: f32) -> Component {
    let q = || var("q", "float2");
    Component::new(id, ComponentKind::Sdf2D)
        .named("Box")
        .with_statement(Statement::define(
            "q",
            "float2",
            sub(
                "float2",
                call("abs", "float2", vec![var("position", "float2")]),
                Fragment::vector(&[half_width, half_height]),
            ),
        ))
        .with_statement(out_distance(add(
            "float",
            call(
                "length",
                "float",
                vec![call("max", "float2", vec![q(), Fragment::scalar(0.0)])],
            ),
            call(
                "min",
                "float",
                vec![
                    call(
                        "max",
                        "float",
                        vec![q().with_qualifier("x"), q().with_qualifier("y")],
                    ),
                    Fragment::scalar(0.0),
                ],
            ),
        )))
}

pub fn sphere_3d(id: &str, radius: f32) -> Component {
    Component::new(id, ComponentKind::Sdf3D)
        .named("Sphere")
        .with_statement(out_distance(sub(
            "float",
            call("length", "float", vec![var("position", "float3")]),
            Fragment::scalar(radius),
        )))
}

pub fn box_3d(id: &str, half_extent: [f32; 3]) -> Component {
    let q = || var("q", "float3");
    Component::new(id, ComponentKind::Sdf3D)
        .named("Box")
        .with_statement(Statement::define(
            "q",
            "float3",
            sub(
                "float3",
                call("abs", "float3", vec![var("position", "float3")]),
                Fragment::vector(&half_extent),
            ),
        ))
        .with_statement(out_distance(add(
            "float",
            call(
                "length",
                "float",
                vec![call("max", "float3", vec![q(), Fragment::scalar(0.0)])],
            ),
            call(
                "min",
                "float",
                vec![
                    call(
                        "max",
                        "float",
                        vec![
                            q().with_qualifier("x"),
                            call(
                                "max",
                                "float",
                                vec![q().with_qualifier("y"), q().with_qualifier("z")],
                            ),
                        ],
                    ),
                    Fragment::scalar(0.0),
                ],
            ),
        )))
}

pub fn solid_colorize(id: &str, color: [f32; 4]) -> Component {
    Component::new(id, ComponentKind::Colorize)
        .named("Solid")
        .with_statement(out_color(Fragment::vector(&color)))
}

pub fn gradient_colorize(id: &str, top: [f32; 4], bottom: [f32; 4]) -> Component {
    Component::new(id, ComponentKind::Colorize)
        .named("Gradient")
        .with_statement(out_color(call(
            "mix",
            "float4",
            vec![
                Fragment::vector(&top),
                Fragment::vector(&bottom),
                var("uv", "float2").with_qualifier("y"),
            ],
        )))
}

pub fn sky_dome(id: &str, horizon: [f32; 4], zenith: [f32; 4]) -> Component {
    Component::new(id, ComponentKind::SkyDome)
        .named("Sky Dome")
        .with_statement(out_color(call(
            "mix",
            "float4",
            vec![
                Fragment::vector(&horizon),
                Fragment::vector(&zenith),
                call(
                    "clamp",
                    "float",
                    vec![
                        var("dir", "float3").with_qualifier("y"),
                        Fragment::scalar(0.0),
                        Fragment::scalar(1.0),
                    ],
                ),
            ],
        )))
}

/// Pans by `_posX/_posY` and zooms by `_zoom`.
pub fn pan_camera_2d(id: &str) -> Component {
    Component::new(id, ComponentKind::Camera2D)
        .named("Pan Camera")
        .with_statement(Statement::assign(
            Fragment::out("outPosition", "float2"),
            add(
                "float2",
                div("float2", var("position", "float2"), Fragment::field("_zoom")),
                call(
                    "float2",
                    "float2",
                    vec![Fragment::field("_posX"), Fragment::field("_posY")],
                ),
            ),
        ))
}

/// Pinhole camera at `_posX/_posY/_posZ` looking at `_lookAtX/_lookAtY/_lookAtZ`
/// with a vertical field of view of `_fov` degrees.
pub fn pinhole_camera_3d(id: &str) -> Component {
    let f3 = |name: &str| var(name, "float3");
    Component::new(id, ComponentKind::Camera3D)
        .named("Pinhole Camera")
        .with_statement(Statement::define(
            "eye",
            "float3",
            call(
                "float3",
                "float3",
                vec![
                    Fragment::field("_posX"),
                    Fragment::field("_posY"),
                    Fragment::field("_posZ"),
                ],
            ),
        ))
        .with_statement(Statement::define(
            "target",
            "float3",
            call(
                "float3",
                "float3",
                vec![
                    Fragment::field("_lookAtX"),
                    Fragment::field("_lookAtY"),
                    Fragment::field("_lookAtZ"),
                ],
            ),
        ))
        .with_statement(Statement::define(
            "forward",
            "float3",
            call("normalize", "float3", vec![sub("float3", f3("target"), f3("eye"))]),
        ))
        .with_statement(Statement::define(
            "right",
            "float3",
            call(
                "normalize",
                "float3",
                vec![call(
                    "cross",
                    "float3",
                    vec![Fragment::vector(&[0.0, 1.0, 0.0]), f3("forward")],
                )],
            ),
        ))
        .with_statement(Statement::define(
            "up",
            "float3",
            call("cross", "float3", vec![f3("forward"), f3("right")]),
        ))
        .with_statement(Statement::define(
            "ratio",
            "float",
            div(
                "float",
                var("size", "float2").with_qualifier("x"),
                var("size", "float2").with_qualifier("y"),
            ),
        ))
        .with_statement(Statement::define(
            "pixel",
            "float2",
            mul(
                "float2",
                sub("float2", var("uv", "float2"), Fragment::scalar(0.5)),
                call(
                    "float2",
                    "float2",
                    vec![var("ratio", "float"), Fragment::scalar(-1.0)],
                ),
            ),
        ))
        .with_statement(Statement::define(
            "focal",
            "float",
            div(
                "float",
                Fragment::scalar(1.0),
                call(
                    "tan",
                    "float",
                    vec![mul(
                        "float",
                        call("radians", "float", vec![Fragment::field("_fov")]),
                        Fragment::scalar(0.5),
                    )],
                ),
            ),
        ))
        .with_statement(Statement::assign(
            Fragment::out("outPosition", "float3"),
            f3("eye"),
        ))
        .with_statement(Statement::assign(
            Fragment::out("outDirection", "float3"),
            call(
                "normalize",
                "float3",
                vec![add(
                    "float3",
                    add(
                        "float3",
                        mul("float3", f3("forward"), var("focal", "float")),
                        mul(
                            "float3",
                            f3("right"),
                            var("pixel", "float2").with_qualifier("x"),
                        ),
                    ),
                    mul(
                        "float3",
                        f3("up"),
                        var("pixel", "float2").with_qualifier("y"),
                    ),
                )],
            ),
        ))
}

/// Anti-aliased solid fill of the distance field over the background.
pub fn solid_render_2d(id: &str) -> Component {
    Component::new(id, ComponentKind::Render2D)
        .named("Solid Color")
        .with_statement(Statement::define("pixelSize", "float", Fragment::scalar(2.0)))
        .with_statement(Statement::define(
            "smooth",
            "float",
            call(
                "smoothstep",
                "float",
                vec![
                    Fragment::scalar(0.0),
                    var("pixelSize", "float"),
                    var("distance", "float"),
                ],
            ),
        ))
        .with_statement(out_color(call(
            "mix",
            "float4",
            vec![
                var("matColor", "float4"),
                var("backColor", "float4"),
                var("smooth", "float"),
            ],
        )))
}

/// Diffuse lighting with ambient occlusion and shadows.
pub fn lit_render_3d(id: &str) -> Component {
    Component::new(id, ComponentKind::Render3D)
        .named("Lit")
        .with_statement(Statement::define(
            "light",
            "float3",
            call(
                "normalize",
                "float3",
                vec![Fragment::vector(&[0.5, 0.8, -0.6])],
            ),
        ))
        .with_statement(Statement::define(
            "diffuse",
            "float",
            call(
                "max",
                "float",
                vec![
                    call(
                        "dot",
                        "float",
                        vec![var("normal", "float3"), var("light", "float3")],
                    ),
                    Fragment::scalar(0.0),
                ],
            ),
        ))
        .with_statement(Statement::define(
            "lit",
            "float",
            mul(
                "float",
                add(
                    "float",
                    Fragment::scalar(0.15),
                    mul("float", var("diffuse", "float"), var("shadow", "float")),
                ),
                var("occlusion", "float"),
            ),
        ))
        .with_statement(out_color(call(
            "mix",
            "float4",
            vec![
                var("backColor", "float4"),
                call(
                    "float4",
                    "float4",
                    vec![
                        mul(
                            "float3",
                            var("matColor", "float4").with_qualifier("xyz"),
                            var("lit", "float"),
                        ),
                        Fragment::scalar(1.0),
                    ],
                ),
                var("hit", "float"),
            ],
        )))
}

pub fn transform_2d(id: &str, x: f32, y: f32) -> Component {
    Component::new(id, ComponentKind::Transform2D)
        .named("Transform")
        .with_field("_posX", x)
        .with_field("_posY", y)
}

pub fn transform_3d(id: &str, position: [f32; 3]) -> Component {
    Component::new(id, ComponentKind::Transform3D)
        .named("Transform")
        .with_field("_posX", position[0])
        .with_field("_posY", position[1])
        .with_field("_posZ", position[2])
}

/// Gradient background, a circle unioned with a box minus a smaller circle,
/// and the anti-aliased solid render.
pub fn demo_scene_2d() -> Scene {
    let ring = circle_2d("hole", 12.0).with_combine(CombineOp::Subtract);
    Scene::new(SceneMode::TwoD)
        .with_item(
            StageKind::PreStage,
            StageItem::new("Background").with_component(
                "colorize",
                gradient_colorize("background", [0.2, 0.2, 0.25, 1.0], [0.45, 0.45, 0.55, 1.0]),
            ),
        )
        .with_item(
            StageKind::ShapeStage,
            StageItem::new("Shapes")
                .with_shape(circle_2d("disk", 40.0).with_field("_posX", -30.0))
                .with_shape(box_2d("box", 30.0, 20.0).with_field("_posX", 30.0).with_sub_component(ring)),
        )
        .with_item(
            StageKind::RenderStage,
            StageItem::new("Render").with_component("render", solid_render_2d("render")),
        )
}

/// Sky dome, pinhole camera, a sphere resting next to a box, lit render.
pub fn demo_scene_3d() -> Scene {
    Scene::new(SceneMode::ThreeD)
        .with_item(
            StageKind::PreStage,
            StageItem::new("Sky")
                .with_component(
                    "background",
                    sky_dome("sky", [0.7, 0.75, 0.8, 1.0], [0.25, 0.35, 0.6, 1.0]),
                )
                .with_component("camera", pinhole_camera_3d("camera")),
        )
        .with_item(
            StageKind::ShapeStage,
            StageItem::new("Sphere").with_shape(sphere_3d("sphere", 1.0).with_field("_posX", -1.0)),
        )
        .with_item(
            StageKind::ShapeStage,
            StageItem::new("Box")
                .with_transform(transform_3d("box_transform", [1.2, 0.0, 0.0]))
                .with_shape(box_3d("box", [0.6, 0.6, 0.6])),
        )
        .with_item(
            StageKind::RenderStage,
            StageItem::new("Render").with_component("render", lit_render_3d("render")),
        )
}
