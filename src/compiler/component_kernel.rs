//! Kernels wrapping a single component: background, 3D camera rays and the
//! final render combine.

use crate::error::BuildError;
use crate::graph::component::{Component, ComponentKind};
use crate::kernel::ir::{Access, Builtin, EntryPoint, Expr, KernelModule, Stmt, COORD, SIZE};
use crate::kernel::types::ValueType;
use crate::kernel::utility::MAIN_ENTRY;

use super::bindings::{self, out};
use super::binding_format;
use super::instance::{InstanceParts, InstanceRole, MonitorEntry};
use super::lower::{BlockSpec, lower_component};
use super::monitor::{MONITOR_BINDING, MONITOR_VAR, MonitorTarget};
use super::property::{PropertyTable, dry_run};
use super::stream::out_fragment;

pub const MAIN_MONITOR_ENTRY: &str = "main_monitor";

/// How one component is fed from textures and where its outputs go.
struct Wiring {
    reads: Vec<&'static str>,
    prologue: Vec<Stmt>,
    spec: BlockSpec,
    /// Caller variables receiving the outputs, with their seed values.
    outer: Vec<(&'static str, ValueType, Expr)>,
    stores: Vec<Stmt>,
    writes: Vec<String>,
}

fn v4(parts: Vec<Expr>) -> Expr {
    Expr::vec(ValueType::Vec4, parts)
}

fn uv() -> Stmt {
    Stmt::let_("k_uv", Expr::div(Expr::var(COORD), Expr::var(SIZE)))
}

fn base_spec() -> BlockSpec {
    BlockSpec::default()
        .input("uv", Expr::var("k_uv"))
        .input("size", Expr::var(SIZE))
}

fn mismatch(component: &Component, context: &str) -> BuildError {
    BuildError::KindMismatch {
        component: component.id.clone(),
        kind: component.kind.to_string(),
        context: context.to_string(),
    }
}

/// Colorize or SkyDome filling the background texture. A sky dome reads the
/// camera ray directions.
pub fn background_kernel(
    name: &str,
    component: &Component,
    monitor: Option<&MonitorTarget>,
) -> Result<InstanceParts, BuildError> {
    let mut wiring = Wiring {
        reads: Vec::new(),
        prologue: vec![uv()],
        spec: base_spec().output("outColor", "k_color"),
        outer: vec![(
            "k_color",
            ValueType::Vec4,
            v4(vec![
                Expr::Const(0.0),
                Expr::Const(0.0),
                Expr::Const(0.0),
                Expr::Const(1.0),
            ]),
        )],
        stores: vec![Stmt::store(out(bindings::BACKGROUND), Expr::var("k_color"))],
        writes: vec![out(bindings::BACKGROUND)],
    };
    match component.kind {
        ComponentKind::Colorize => {}
        ComponentKind::SkyDome => {
            wiring.reads.push(bindings::RAY_DIRECTION);
            wiring.prologue.push(Stmt::let_(
                "k_dir",
                Expr::load(bindings::RAY_DIRECTION).swizzle("xyz"),
            ));
            wiring.spec = wiring.spec.input("dir", Expr::var("k_dir"));
        }
        _ => return Err(mismatch(component, "background")),
    }
    single(name, InstanceRole::Background, component, wiring, monitor)
}

/// Camera3D writing per-pixel ray origins and directions.
pub fn camera_kernel(
    name: &str,
    component: &Component,
    monitor: Option<&MonitorTarget>,
) -> Result<InstanceParts, BuildError> {
    if component.kind != ComponentKind::Camera3D {
        return Err(mismatch(component, "camera rays"));
    }
    let c = Expr::Const;
    let wiring = Wiring {
        reads: Vec::new(),
        prologue: vec![uv()],
        spec: base_spec()
            .output("outPosition", "k_ro")
            .output("outDirection", "k_rd"),
        outer: vec![
            (
                "k_ro",
                ValueType::Vec3,
                Expr::vec(ValueType::Vec3, vec![c(0.0), c(0.0), c(-5.0)]),
            ),
            (
                "k_rd",
                ValueType::Vec3,
                Expr::vec(ValueType::Vec3, vec![c(0.0), c(0.0), c(1.0)]),
            ),
        ],
        stores: vec![
            Stmt::store(
                out(bindings::RAY_ORIGIN),
                v4(vec![Expr::var("k_ro"), c(1.0)]),
            ),
            Stmt::store(
                out(bindings::RAY_DIRECTION),
                v4(vec![
                    Expr::call(Builtin::Normalize, vec![Expr::var("k_rd")]),
                    c(1.0),
                ]),
            ),
        ],
        writes: vec![out(bindings::RAY_ORIGIN), out(bindings::RAY_DIRECTION)],
    };
    single(name, InstanceRole::Camera, component, wiring, monitor)
}

/// Render2D or Render3D combining the earlier passes into the result.
pub fn render_kernel(
    name: &str,
    component: &Component,
    far: f32,
    monitor: Option<&MonitorTarget>,
) -> Result<InstanceParts, BuildError> {
    let mut prologue = vec![
        uv(),
        Stmt::let_("k_depth", Expr::load(bindings::DEPTH)),
        Stmt::let_("k_back", Expr::load(bindings::BACKGROUND)),
        Stmt::let_("k_mat", Expr::load(bindings::MATERIAL)),
    ];
    let mut reads = vec![bindings::BACKGROUND, bindings::DEPTH, bindings::MATERIAL];
    let mut spec = base_spec()
        .input("distance", Expr::var("k_depth").swizzle("x"))
        .input("backColor", Expr::var("k_back"))
        .input("matColor", Expr::var("k_mat"))
        .output("outColor", "k_color");
    match component.kind {
        ComponentKind::Render2D => {}
        ComponentKind::Render3D => {
            reads.extend([
                bindings::NORMAL,
                bindings::META,
                bindings::RAY_ORIGIN,
                bindings::RAY_DIRECTION,
            ]);
            prologue.extend([
                Stmt::let_("k_meta", Expr::load(bindings::META)),
                Stmt::let_("k_rdw", Expr::load(bindings::RAY_DIRECTION)),
                Stmt::let_(
                    "k_hit",
                    Expr::mul(
                        Expr::sub(
                            Expr::Const(1.0),
                            Expr::call(
                                Builtin::Step,
                                vec![Expr::Const(far * 0.5), Expr::var("k_depth").swizzle("x")],
                            ),
                        ),
                        Expr::call(
                            Builtin::Step,
                            vec![Expr::Const(0.5), Expr::var("k_rdw").swizzle("w")],
                        ),
                    ),
                ),
            ]);
            spec = spec
                .input("hit", Expr::var("k_hit"))
                .input("normal", Expr::load(bindings::NORMAL).swizzle("xyz"))
                .input("occlusion", Expr::var("k_meta").swizzle("x"))
                .input("shadow", Expr::var("k_meta").swizzle("y"))
                .input("rayOrigin", Expr::load(bindings::RAY_ORIGIN).swizzle("xyz"))
                .input("rayDirection", Expr::var("k_rdw").swizzle("xyz"));
        }
        _ => return Err(mismatch(component, "render")),
    }
    let wiring = Wiring {
        reads,
        prologue,
        spec,
        outer: vec![("k_color", ValueType::Vec4, Expr::var("k_back"))],
        stores: vec![Stmt::store(out(bindings::RESULT), Expr::var("k_color"))],
        writes: vec![out(bindings::RESULT)],
    };
    single(name, InstanceRole::Render, component, wiring, monitor)
}

fn single(
    name: &str,
    role: InstanceRole,
    component: &Component,
    wiring: Wiring,
    monitor: Option<&MonitorTarget>,
) -> Result<InstanceParts, BuildError> {
    let mut table = PropertyTable::new();
    table.collect(dry_run(component)?);

    let mut module = KernelModule::new(name);
    for r in &wiring.reads {
        module.bind(r, binding_format(r), Access::Read);
    }
    for w in &wiring.writes {
        module.bind(w, binding_format(w), Access::Write);
    }

    let head = |body: &mut Vec<Stmt>| {
        body.extend(wiring.prologue.iter().cloned());
        for (var, ty, seed) in &wiring.outer {
            body.push(Stmt::var(*var, *ty, seed.clone()));
        }
    };

    let mut body = Vec::new();
    head(&mut body);
    body.push(lower_component(component, &table, &wiring.spec)?.stmt);
    body.extend(wiring.stores.iter().cloned());
    module.entries.push(EntryPoint {
        name: MAIN_ENTRY.into(),
        reads: wiring.reads.iter().map(|r| r.to_string()).collect(),
        writes: wiring.writes.clone(),
        body,
    });

    let mut monitor_entry = None;
    if let Some(target) = monitor.filter(|t| t.matches(component)) {
        let spec = wiring
            .spec
            .clone()
            .capture(&out_fragment(component, target), MONITOR_VAR);
        let mut body = vec![Stmt::var(
            MONITOR_VAR,
            ValueType::Vec4,
            v4(vec![Expr::Const(0.0)]),
        )];
        head(&mut body);
        let lowered = lower_component(component, &table, &spec)?;
        body.push(lowered.stmt);
        body.push(Stmt::store(MONITOR_BINDING, Expr::var(MONITOR_VAR)));
        module.bind(MONITOR_BINDING, binding_format(MONITOR_BINDING), Access::Write);
        module.entries.push(EntryPoint {
            name: MAIN_MONITOR_ENTRY.into(),
            reads: wiring.reads.iter().map(|r| r.to_string()).collect(),
            writes: vec![MONITOR_BINDING.to_string()],
            body,
        });
        monitor_entry = Some(MonitorEntry {
            entry: MAIN_MONITOR_ENTRY.into(),
            component: component.id.clone(),
            channels: lowered.captured.map_or(4, ValueType::arity),
        });
    }

    tracing::debug!(
        kernel = name,
        component = %component.id,
        records = table.len(),
        "component kernel"
    );
    Ok(InstanceParts {
        name: name.to_string(),
        role,
        module,
        properties: table,
        components: vec![component.clone()],
        monitor: monitor_entry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::library::{
        gradient_colorize, lit_render_3d, pinhole_camera_3d, sky_dome, solid_render_2d,
    };
    use crate::kernel::validation::validate_module;

    fn target(component: &str, fragment: &str) -> MonitorTarget {
        MonitorTarget {
            component: component.into(),
            fragment: fragment.into(),
        }
    }

    fn check(parts: &InstanceParts) {
        assert_eq!(parts.module.verify(), Ok(()), "{}", parts.name);
        if let Err(e) = validate_module(&parts.module) {
            panic!("{e:#}");
        }
    }

    #[test]
    fn every_component_kernel_validates() {
        let sky = sky_dome("sky", [1.0; 4], [0.0; 4]);
        let kernels = [
            background_kernel("pre", &gradient_colorize("bg", [1.0; 4], [0.0; 4]), None),
            background_kernel("pre", &sky, Some(&target("sky", "out"))),
            camera_kernel("camera3D", &pinhole_camera_3d("cam"), Some(&target("cam", "focal"))),
            render_kernel("render", &solid_render_2d("r"), 10000.0, None),
            render_kernel("render", &lit_render_3d("r"), 10000.0, Some(&target("r", "lit"))),
        ];
        for parts in kernels {
            check(&parts.expect("kernel"));
        }
    }

    #[test]
    fn out_taps_report_output_channels() {
        let camera = camera_kernel("camera3D", &pinhole_camera_3d("cam"), Some(&target("cam", "out")))
            .expect("camera");
        assert_eq!(camera.monitor.map(|m| m.channels), Some(3));

        let render = render_kernel("render", &solid_render_2d("r"), 1.0, Some(&target("r", "out")))
            .expect("render");
        assert_eq!(render.monitor.map(|m| m.channels), Some(4));

        let scalar = render_kernel("render", &solid_render_2d("r"), 1.0, Some(&target("r", "smooth")))
            .expect("render");
        assert_eq!(scalar.monitor.map(|m| m.channels), Some(1));
    }

    #[test]
    fn taps_on_other_components_add_no_entry() {
        let parts = render_kernel("render", &solid_render_2d("r"), 1.0, Some(&target("x", "out")))
            .expect("render");
        assert!(parts.monitor.is_none());
        assert!(!parts.module.has_entry(MAIN_MONITOR_ENTRY));
    }

    #[test]
    fn kinds_are_checked() {
        assert!(matches!(
            background_kernel("pre", &solid_render_2d("r"), None),
            Err(BuildError::KindMismatch { .. })
        ));
        assert!(matches!(
            camera_kernel("camera3D", &sky_dome("s", [0.0; 4], [0.0; 4]), None),
            Err(BuildError::KindMismatch { .. })
        ));
    }
}
