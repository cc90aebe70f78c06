//! Stream builder: folds an ordered sequence of SDF components into one shape
//! kernel.
//!
//! Each pushed component is dry-run, its properties are claimed and its body is
//! lowered right away. The combinator tree is turned into the map function and
//! the pass entry points when the stream is closed.

use crate::backend::Backend;
use crate::config::PipelineSettings;
use crate::error::BuildError;
use crate::graph::component::{Component, ComponentKind};
use crate::kernel::ir::{
    Access, AssignOp, Builtin, CompareOp, EntryPoint, Expr, Function, KernelModule, Stmt, COORD,
    SIZE,
};
use crate::kernel::types::ValueType;

use super::bindings::{self, out};
use super::binding_format;
use super::combine::CombineTree;
use super::instance::{Instance, InstanceParts, InstanceRole, MonitorEntry};
use super::lower::{BlockSpec, lower_component};
use super::monitor::{MONITOR_BINDING, MONITOR_VAR, MonitorTarget, widen};
use super::property::{PropertyTable, SlotKey, dry_run};

pub const HIT_ENTRY: &str = "hit";
pub const HIT_AND_NORMALS_ENTRY: &str = "hit_and_normals";
pub const AO_ENTRY: &str = "compute_ao";
pub const SHADOW_ENTRY: &str = "compute_shadow";
pub const MATERIAL_ENTRY: &str = "compute_material";
pub const HIT_MONITOR_ENTRY: &str = "hit_monitor";

const MAP_FN: &str = "k_map";
const MAP_MONITOR_FN: &str = "k_map_monitor";
const NORMAL_FN: &str = "k_normal";
const ROTATE_X_FN: &str = "k_rotate_x";
const ROTATE_Y_FN: &str = "k_rotate_y";
const ROTATE_Z_FN: &str = "k_rotate_z";

const HIT_EPSILON: f32 = 0.001;
const NORMAL_EPSILON: f32 = 0.0005;
const AO_STEPS: u32 = 5;
const SHADOW_STEPS: u32 = 32;
const SHADOW_MAX_DISTANCE: f32 = 50.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Sdf2D,
    Sdf3D,
}

impl StreamKind {
    pub fn shape_kind(self) -> ComponentKind {
        match self {
            StreamKind::Sdf2D => ComponentKind::Sdf2D,
            StreamKind::Sdf3D => ComponentKind::Sdf3D,
        }
    }

    pub fn transform_kind(self) -> ComponentKind {
        match self {
            StreamKind::Sdf2D => ComponentKind::Transform2D,
            StreamKind::Sdf3D => ComponentKind::Transform3D,
        }
    }

    fn point_type(self) -> ValueType {
        match self {
            StreamKind::Sdf2D => ValueType::Vec2,
            StreamKind::Sdf3D => ValueType::Vec3,
        }
    }
}

/// Sphere-trace parameters baked into 3D shape kernels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TraceSettings {
    pub far: f32,
    pub max_steps: u32,
    /// Normalized direction towards the light.
    pub light: [f32; 3],
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self::from(&PipelineSettings::default())
    }
}

impl From<&PipelineSettings> for TraceSettings {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            far: settings.far_distance,
            max_steps: settings.max_steps,
            light: settings.light(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Camera2D rewriting the 2D origin.
    pub camera: Option<Component>,
    /// Colorize component evaluated where this stream wins the depth test.
    pub material: Option<Component>,
    pub monitor: Option<MonitorTarget>,
    /// Value stored in `depth.y` where this stream is the closest surface.
    pub shape_id: f32,
    pub trace: TraceSettings,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            camera: None,
            material: None,
            monitor: None,
            shape_id: 1.0,
            trace: TraceSettings::default(),
        }
    }
}

impl StreamOptions {
    pub fn with_camera(mut self, camera: Component) -> Self {
        self.camera = Some(camera);
        self
    }

    pub fn with_material(mut self, material: Component) -> Self {
        self.material = Some(material);
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorTarget) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_shape_id(mut self, shape_id: f32) -> Self {
        self.shape_id = shape_id;
        self
    }

    pub fn with_trace(mut self, trace: TraceSettings) -> Self {
        self.trace = trace;
        self
    }
}

struct Leaf {
    stmts: Vec<Stmt>,
}

/// Where the monitor tap of a stream points.
enum Tap {
    /// Combined distance of the stream.
    Out,
    /// A body variable of one leaf, captured by `k_map_monitor`.
    Leaf { stmts: Vec<Stmt>, ty: ValueType },
    Camera(String),
    Material(String),
}

struct OpenStream {
    kind: StreamKind,
    name: String,
    options: StreamOptions,
    table: PropertyTable,
    components: Vec<Component>,
    leaves: Vec<Leaf>,
    tree: Option<CombineTree>,
    tap: Option<Tap>,
}

/// Builds one shape [`Instance`] per `open_stream`/`close_stream` session.
#[derive(Default)]
pub struct StreamBuilder {
    open: Option<OpenStream>,
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Number of components pushed since the stream was opened.
    pub fn pushed(&self) -> usize {
        self.open.as_ref().map_or(0, |s| s.leaves.len())
    }

    /// Start a new stream, discarding any unfinished one.
    pub fn open_stream(
        &mut self,
        kind: StreamKind,
        name: &str,
        options: StreamOptions,
    ) -> Result<(), BuildError> {
        self.open = None;
        let mut table = PropertyTable::new();
        let mut components = Vec::new();
        if let Some(camera) = &options.camera {
            if kind != StreamKind::Sdf2D || camera.kind != ComponentKind::Camera2D {
                return Err(kind_mismatch(camera, "stream camera"));
            }
            table.collect(dry_run(camera)?);
            components.push(camera.clone());
        }
        if let Some(material) = &options.material {
            if material.kind != ComponentKind::Colorize {
                return Err(kind_mismatch(material, "stream material"));
            }
            table.collect(dry_run(material)?);
            components.push(material.clone());
        }

        let mut tap = None;
        if let Some(target) = &options.monitor {
            let fragment = |c: &Component| out_fragment(c, target);
            if let Some(camera) = options.camera.as_ref().filter(|c| target.matches(c)) {
                tap = Some(Tap::Camera(fragment(camera)));
            } else if let Some(material) = options.material.as_ref().filter(|c| target.matches(c)) {
                tap = Some(Tap::Material(fragment(material)));
            }
        }

        tracing::debug!(stream = name, ?kind, "open stream");
        self.open = Some(OpenStream {
            kind,
            name: name.to_string(),
            options,
            table,
            components,
            leaves: Vec::new(),
            tree: None,
            tap,
        });
        Ok(())
    }

    /// Append `component` (and its sub-component chain) evaluated in the space
    /// of `transforms`, outermost first. The first push initializes the field;
    /// later pushes combine with it through the component's own operator.
    pub fn push_component(
        &mut self,
        component: &Component,
        transforms: &[&Component],
    ) -> Result<(), BuildError> {
        let stream = self
            .open
            .as_mut()
            .ok_or_else(|| BuildError::stream("push_component without an open stream"))?;
        let kind = stream.kind;

        for transform in transforms {
            if transform.kind != kind.transform_kind() {
                return Err(kind_mismatch(transform, "stream transform"));
            }
        }
        let chain = component.chain();
        for link in &chain {
            if link.kind != kind.shape_kind() {
                return Err(kind_mismatch(link, "stream shape"));
            }
            if stream.components.iter().any(|c| c.id == link.id) {
                return Err(BuildError::stream(format!(
                    "component '{}' pushed twice into stream '{}'",
                    link.id, stream.name
                )));
            }
        }

        // Nothing is committed until every link has lowered.
        let mut table = stream.table.clone();
        let mut owned = Vec::new();
        for transform in transforms {
            let seen = stream.components.iter().chain(&owned).any(|c| c.id == transform.id);
            if !seen {
                table.collect(dry_run(transform)?);
                let mut t = (*transform).clone();
                t.sub_component = None;
                owned.push(t);
            }
        }

        let mut leaves = Vec::new();
        let mut tap = None;
        let mut node: Option<CombineTree> = None;
        let far = stream.options.trace.far;
        for link in chain {
            table.collect(dry_run(link)?);
            let index = stream.leaves.len() + leaves.len();
            let position = position_expr(kind, &table, transforms, link)?;
            let (stmts, _) = leaf_stmts(link, &table, index, &position, far, None)?;

            if let Some(target) = stream.options.monitor.as_ref().filter(|t| t.matches(link)) {
                tap = Some(if target.is_out() {
                    Tap::Out
                } else {
                    let (stmts, ty) =
                        leaf_stmts(link, &table, index, &position, far, Some(&target.fragment))?;
                    Tap::Leaf {
                        stmts,
                        ty: ty.unwrap_or(ValueType::F32),
                    }
                });
            }

            leaves.push(Leaf { stmts });
            let mut l = link.clone();
            l.sub_component = None;
            owned.push(l);
            node = Some(match node {
                None => CombineTree::leaf(index),
                Some(prev) => CombineTree::combine(link.combine, prev, CombineTree::leaf(index)),
            });
        }

        stream.table = table;
        stream.components.extend(owned);
        stream.leaves.extend(leaves);
        if tap.is_some() {
            stream.tap = tap;
        }
        if let Some(node) = node {
            stream.tree = Some(CombineTree::push(stream.tree.take(), component.combine, node));
        }
        tracing::trace!(
            stream = %stream.name,
            component = %component.id,
            leaves = stream.leaves.len(),
            records = stream.table.len(),
            "pushed component"
        );
        Ok(())
    }

    /// Finish the kernel and compile it. The stream is closed whether or not
    /// compilation succeeds.
    pub fn close_stream<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> Result<Instance, BuildError> {
        let parts = self.finish()?;
        Instance::compile(parts, backend)
    }

    /// Finish the kernel without compiling it.
    pub fn finish(&mut self) -> Result<InstanceParts, BuildError> {
        let stream = self
            .open
            .take()
            .ok_or_else(|| BuildError::stream("close_stream without an open stream"))?;
        let Some(tree) = stream.tree.clone() else {
            return Err(BuildError::stream(format!(
                "stream '{}' has no components",
                stream.name
            )));
        };
        let (module, monitor) = match stream.kind {
            StreamKind::Sdf2D => stream.module_2d(&tree)?,
            StreamKind::Sdf3D => stream.module_3d(&tree)?,
        };
        tracing::debug!(
            stream = %stream.name,
            components = stream.components.len(),
            records = stream.table.len(),
            monitor = monitor.is_some(),
            "closed stream"
        );
        Ok(InstanceParts {
            name: stream.name,
            role: InstanceRole::Shape,
            module,
            properties: stream.table,
            components: stream.components,
            monitor,
        })
    }
}

fn kind_mismatch(component: &Component, context: &str) -> BuildError {
    BuildError::KindMismatch {
        component: component.id.clone(),
        kind: component.kind.to_string(),
        context: context.to_string(),
    }
}

/// Fragment captured for a tap on a non-shape component; `out` maps to the
/// kind's last output.
pub(crate) fn out_fragment(component: &Component, target: &MonitorTarget) -> String {
    if target.is_out() {
        if let Some((name, _)) = component.kind.outputs().last() {
            return (*name).to_string();
        }
    }
    target.fragment.clone()
}

/// `let k_p{i}`, `var k_d{i}` and the component block writing the distance.
fn leaf_stmts(
    link: &Component,
    table: &PropertyTable,
    index: usize,
    position: &Expr,
    far: f32,
    capture: Option<&str>,
) -> Result<(Vec<Stmt>, Option<ValueType>), BuildError> {
    let point = format!("k_p{index}");
    let dist = format!("k_d{index}");
    let mut spec = BlockSpec::default()
        .input("position", Expr::var(point.as_str()))
        .output("outDistance", &dist);
    if let Some(fragment) = capture {
        spec = spec.capture(fragment, MONITOR_VAR);
    }
    let block = lower_component(link, table, &spec)?;
    Ok((
        vec![
            Stmt::let_(point, position.clone()),
            Stmt::var(dist, ValueType::F32, Expr::Const(far)),
            block.stmt,
        ],
        block.captured,
    ))
}

fn field(table: &PropertyTable, component: &Component, name: &str) -> Result<Expr, BuildError> {
    let slot = table.slot(&SlotKey::field(&component.id, name))?;
    Ok(Expr::Property {
        slot,
        ty: ValueType::F32,
    })
}

fn v2(x: Expr, y: Expr) -> Expr {
    Expr::vec(ValueType::Vec2, vec![x, y])
}

fn v3(x: Expr, y: Expr, z: Expr) -> Expr {
    Expr::vec(ValueType::Vec3, vec![x, y, z])
}

fn v4(parts: Vec<Expr>) -> Expr {
    Expr::vec(ValueType::Vec4, parts)
}

fn c3(v: [f32; 3]) -> Expr {
    v3(Expr::Const(v[0]), Expr::Const(v[1]), Expr::Const(v[2]))
}

fn splat4(v: f32) -> Expr {
    v4(vec![Expr::Const(v)])
}

/// Local evaluation point of `link`: the map argument moved through every
/// transform and then the component's own placement.
fn position_expr(
    kind: StreamKind,
    table: &PropertyTable,
    transforms: &[&Component],
    link: &Component,
) -> Result<Expr, BuildError> {
    let mut p = Expr::var("k_p");
    for placement in transforms.iter().copied().chain(std::iter::once(link)) {
        p = match kind {
            StreamKind::Sdf2D => Expr::sub(
                p,
                v2(
                    field(table, placement, "_posX")?,
                    field(table, placement, "_posY")?.neg(),
                ),
            ),
            StreamKind::Sdf3D => {
                let moved = Expr::sub(
                    p,
                    v3(
                        field(table, placement, "_posX")?,
                        field(table, placement, "_posY")?,
                        field(table, placement, "_posZ")?,
                    ),
                );
                let z = Expr::func(
                    ROTATE_Z_FN,
                    vec![moved, field(table, placement, "_rotateZ")?.neg()],
                );
                let y = Expr::func(ROTATE_Y_FN, vec![z, field(table, placement, "_rotateY")?.neg()]);
                Expr::func(ROTATE_X_FN, vec![y, field(table, placement, "_rotateX")?.neg()])
            }
        };
    }
    Ok(p)
}

fn rotate_fn(name: &str, axis: usize) -> Function {
    let v = || Expr::var("k_v");
    let c = || Expr::var("k_c");
    let s = || Expr::var("k_s");
    let (x, y, z) = (v().swizzle("x"), v().swizzle("y"), v().swizzle("z"));
    let ret = match axis {
        0 => v3(
            x,
            Expr::sub(Expr::mul(c(), y.clone()), Expr::mul(s(), z.clone())),
            Expr::add(Expr::mul(s(), y), Expr::mul(c(), z)),
        ),
        1 => v3(
            Expr::add(Expr::mul(c(), x.clone()), Expr::mul(s(), z.clone())),
            y,
            Expr::add(Expr::mul(s(), x).neg(), Expr::mul(c(), z)),
        ),
        _ => v3(
            Expr::sub(Expr::mul(c(), x.clone()), Expr::mul(s(), y.clone())),
            Expr::add(Expr::mul(s(), x), Expr::mul(c(), y)),
            z,
        ),
    };
    Function {
        name: name.to_string(),
        params: vec![("k_v".into(), ValueType::Vec3), ("k_deg".into(), ValueType::F32)],
        ret: ValueType::Vec3,
        body: vec![
            Stmt::let_("k_r", Expr::call(Builtin::Radians, vec![Expr::var("k_deg")])),
            Stmt::let_("k_c", Expr::call(Builtin::Cos, vec![Expr::var("k_r")])),
            Stmt::let_("k_s", Expr::call(Builtin::Sin, vec![Expr::var("k_r")])),
            Stmt::Return(Some(ret)),
        ],
    }
}

/// Tetrahedron-sampled gradient of the map.
fn normal_fn() -> Function {
    let corners = [
        [1.0, -1.0, -1.0],
        [-1.0, -1.0, 1.0],
        [-1.0, 1.0, -1.0],
        [1.0, 1.0, 1.0],
    ];
    let mut sum: Option<Expr> = None;
    for k in corners {
        let sample = Expr::func(
            MAP_FN,
            vec![Expr::add(
                Expr::var("k_p"),
                Expr::mul(c3(k), Expr::Const(NORMAL_EPSILON)),
            )],
        );
        let term = Expr::mul(c3(k), sample);
        sum = Some(match sum {
            None => term,
            Some(acc) => Expr::add(acc, term),
        });
    }
    Function {
        name: NORMAL_FN.into(),
        params: vec![("k_p".into(), ValueType::Vec3)],
        ret: ValueType::Vec3,
        body: vec![Stmt::Return(Some(Expr::call(
            Builtin::Normalize,
            sum.into_iter().collect(),
        )))],
    }
}

fn entry(
    module: &mut KernelModule,
    name: &str,
    reads: &[&str],
    writes: &[String],
    body: Vec<Stmt>,
) {
    for r in reads {
        module.bind(r, binding_format(r), Access::Read);
    }
    for w in writes {
        module.bind(w, binding_format(w), Access::Write);
    }
    module.entries.push(EntryPoint {
        name: name.to_string(),
        reads: reads.iter().map(|r| r.to_string()).collect(),
        writes: writes.to_vec(),
        body,
    });
}

fn monitor_channels(ty: ValueType) -> usize {
    ty.arity()
}

impl OpenStream {
    fn map_fn(&self, tree: &CombineTree) -> Function {
        let mut body: Vec<Stmt> = self.leaves.iter().flat_map(|l| l.stmts.clone()).collect();
        body.push(Stmt::Return(Some(
            tree.to_expr(&|i| Expr::var(format!("k_d{i}"))),
        )));
        Function {
            name: MAP_FN.into(),
            params: vec![("k_p".into(), self.kind.point_type())],
            ret: ValueType::F32,
            body,
        }
    }

    fn map_monitor_fn(&self, stmts: &[Stmt]) -> Function {
        let mut body = vec![Stmt::var(MONITOR_VAR, ValueType::Vec4, splat4(0.0))];
        body.extend(stmts.iter().cloned());
        body.push(Stmt::Return(Some(Expr::var(MONITOR_VAR))));
        Function {
            name: MAP_MONITOR_FN.into(),
            params: vec![("k_p".into(), self.kind.point_type())],
            ret: ValueType::Vec4,
            body,
        }
    }

    /// `var k_color` seeded white, then the material block writing into it.
    fn material_stmts(
        &self,
        capture: Option<&str>,
    ) -> Result<(Vec<Stmt>, Option<ValueType>), BuildError> {
        let mut out = vec![Stmt::var("k_color", ValueType::Vec4, splat4(1.0))];
        let mut captured = None;
        if let Some(material) = &self.options.material {
            let mut spec = BlockSpec::default()
                .input("uv", Expr::var("k_uv"))
                .input("size", Expr::var(SIZE))
                .output("outColor", "k_color");
            if let Some(fragment) = capture {
                spec = spec.capture(fragment, MONITOR_VAR);
            }
            let lowered = lower_component(material, &self.table, &spec)?;
            captured = lowered.captured;
            out.push(lowered.stmt);
        }
        Ok((out, captured))
    }

    fn uv() -> Stmt {
        Stmt::let_("k_uv", Expr::div(Expr::var(COORD), Expr::var(SIZE)))
    }

    /// Origin setup of 2D entries: centered pixel coordinate, optionally
    /// rewritten by the camera.
    fn origin_2d(
        &self,
        capture: Option<&str>,
    ) -> Result<(Vec<Stmt>, Option<ValueType>), BuildError> {
        let mut out = vec![
            Stmt::let_(
                "k_origin0",
                Expr::sub(Expr::var(COORD), Expr::mul(Expr::var(SIZE), Expr::Const(0.5))),
            ),
            Stmt::var("k_origin", ValueType::Vec2, Expr::var("k_origin0")),
        ];
        let mut captured = None;
        if let Some(camera) = &self.options.camera {
            let mut spec = BlockSpec::default()
                .input("position", Expr::var("k_origin0"))
                .output("outPosition", "k_origin");
            if let Some(fragment) = capture {
                spec = spec.capture(fragment, MONITOR_VAR);
            }
            let lowered = lower_component(camera, &self.table, &spec)?;
            captured = lowered.captured;
            out.push(lowered.stmt);
        }
        out.push(Self::uv());
        Ok((out, captured))
    }

    fn depth_record(&self, dist: Expr) -> Expr {
        v4(vec![
            dist,
            Expr::Const(self.options.shape_id),
            Expr::Const(0.0),
            Expr::Const(0.0),
        ])
    }

    fn module_2d(
        &self,
        tree: &CombineTree,
    ) -> Result<(KernelModule, Option<MonitorEntry>), BuildError> {
        let mut module = KernelModule::new(&self.name);
        module.functions.push(self.map_fn(tree));

        let (mut body, _) = self.origin_2d(None)?;
        body.push(Stmt::let_("k_prev", Expr::load(bindings::DEPTH)));
        body.push(Stmt::let_(
            "k_dist",
            Expr::func(MAP_FN, vec![Expr::var("k_origin")]),
        ));
        let (mut then, _) = self.material_stmts(None)?;
        then.push(Stmt::store(
            out(bindings::DEPTH),
            self.depth_record(Expr::var("k_dist")),
        ));
        then.push(Stmt::store(out(bindings::MATERIAL), Expr::var("k_color")));
        body.push(Stmt::If {
            cond: Expr::cmp(
                CompareOp::Lt,
                Expr::var("k_dist"),
                Expr::var("k_prev").swizzle("x"),
            ),
            then,
            otherwise: vec![
                Stmt::store(out(bindings::DEPTH), Expr::var("k_prev")),
                Stmt::store(out(bindings::MATERIAL), Expr::load(bindings::MATERIAL)),
            ],
        });
        entry(
            &mut module,
            HIT_ENTRY,
            &[bindings::DEPTH, bindings::MATERIAL],
            &[out(bindings::DEPTH), out(bindings::MATERIAL)],
            body,
        );

        let Some(tap) = &self.tap else {
            return Ok((module, None));
        };
        let mut body = vec![Stmt::var(MONITOR_VAR, ValueType::Vec4, splat4(0.0))];
        let mut reads = Vec::new();
        let camera_capture = match tap {
            Tap::Camera(fragment) => Some(fragment.as_str()),
            _ => None,
        };
        let (origin, camera_ty) = self.origin_2d(camera_capture)?;
        body.extend(origin);
        let channels = match tap {
            Tap::Out => {
                reads.push(bindings::DEPTH);
                body.push(Stmt::let_("k_prev", Expr::load(bindings::DEPTH)));
                body.push(Stmt::let_(
                    "k_mon",
                    Expr::call(
                        Builtin::Min,
                        vec![
                            Expr::func(MAP_FN, vec![Expr::var("k_origin")]),
                            Expr::var("k_prev").swizzle("x"),
                        ],
                    ),
                ));
                body.push(Stmt::set(MONITOR_VAR, widen(Expr::var("k_mon"), ValueType::F32)));
                1
            }
            Tap::Leaf { stmts, ty } => {
                module.functions.push(self.map_monitor_fn(stmts));
                body.push(Stmt::set(
                    MONITOR_VAR,
                    Expr::func(MAP_MONITOR_FN, vec![Expr::var("k_origin")]),
                ));
                monitor_channels(*ty)
            }
            Tap::Camera(_) => monitor_channels(camera_ty.unwrap_or(ValueType::Vec2)),
            Tap::Material(fragment) => {
                let (stmts, ty) = self.material_stmts(Some(fragment))?;
                body.extend(stmts);
                monitor_channels(ty.unwrap_or(ValueType::Vec4))
            }
        };
        body.push(Stmt::store(MONITOR_BINDING, Expr::var(MONITOR_VAR)));
        entry(
            &mut module,
            HIT_MONITOR_ENTRY,
            &reads,
            &[MONITOR_BINDING.to_string()],
            body,
        );
        Ok((module, Some(self.monitor_entry(channels))))
    }

    fn monitor_entry(&self, channels: usize) -> MonitorEntry {
        MonitorEntry {
            entry: HIT_MONITOR_ENTRY.into(),
            component: self
                .options
                .monitor
                .as_ref()
                .map(|t| t.component.clone())
                .unwrap_or_default(),
            channels,
        }
    }

    /// `k_prev`, `k_ro`, `k_rdw`, `k_rd` from the incoming depth and rays.
    fn ray_inputs() -> Vec<Stmt> {
        vec![
            Stmt::let_("k_prev", Expr::load(bindings::DEPTH)),
            Stmt::let_("k_ro", Expr::load(bindings::RAY_ORIGIN).swizzle("xyz")),
            Stmt::let_("k_rdw", Expr::load(bindings::RAY_DIRECTION)),
            Stmt::let_("k_rd", Expr::var("k_rdw").swizzle("xyz")),
        ]
    }

    fn sample_point(t: Expr) -> Expr {
        Expr::add(Expr::var("k_ro"), Expr::mul(Expr::var("k_rd"), t))
    }

    /// Sphere trace bounded by the incoming depth; leaves `k_t` and `k_hit`.
    fn march(&self) -> Vec<Stmt> {
        let step = vec![
            Stmt::when(
                Expr::cmp(
                    CompareOp::Ge,
                    Expr::var("k_t"),
                    Expr::var("k_prev").swizzle("x"),
                ),
                vec![Stmt::Break],
            ),
            Stmt::let_(
                "k_h",
                Expr::func(MAP_FN, vec![Self::sample_point(Expr::var("k_t"))]),
            ),
            Stmt::when(
                Expr::cmp(CompareOp::Lt, Expr::var("k_h"), Expr::Const(HIT_EPSILON)),
                vec![Stmt::set("k_hit", Expr::Const(1.0)), Stmt::Break],
            ),
            Stmt::set("k_t", Expr::add(Expr::var("k_t"), Expr::var("k_h"))),
        ];
        vec![
            Stmt::var("k_t", ValueType::F32, Expr::Const(0.0)),
            Stmt::var("k_hit", ValueType::F32, Expr::Const(0.0)),
            Stmt::when(
                Expr::cmp(
                    CompareOp::Gt,
                    Expr::var("k_rdw").swizzle("w"),
                    Expr::Const(0.5),
                ),
                vec![Stmt::Loop {
                    counter: "k_i".into(),
                    count: self.options.trace.max_steps,
                    body: step,
                }],
            ),
        ]
    }

    fn hit_and_normals(&self) -> Vec<Stmt> {
        let mut body = Self::ray_inputs();
        body.extend(self.march());
        body.push(Stmt::If {
            cond: Expr::cmp(CompareOp::Gt, Expr::var("k_hit"), Expr::Const(0.5)),
            then: vec![
                Stmt::let_("k_pos", Self::sample_point(Expr::var("k_t"))),
                Stmt::store(out(bindings::DEPTH), self.depth_record(Expr::var("k_t"))),
                Stmt::store(
                    out(bindings::NORMAL),
                    v4(vec![
                        Expr::func(NORMAL_FN, vec![Expr::var("k_pos")]),
                        Expr::Const(1.0),
                    ]),
                ),
            ],
            otherwise: vec![
                Stmt::store(out(bindings::DEPTH), Expr::var("k_prev")),
                Stmt::store(out(bindings::NORMAL), Expr::load(bindings::NORMAL)),
            ],
        });
        body
    }

    /// Shared head of the AO and shadow passes: passes `meta` through where
    /// nothing was hit, otherwise leaves the surface point in `k_pos` and the
    /// normal in `k_n`.
    fn surface_prologue(&self) -> Vec<Stmt> {
        let far = self.options.trace.far;
        vec![
            Stmt::let_("k_depth", Expr::load(bindings::DEPTH)),
            Stmt::let_("k_meta", Expr::load(bindings::META)),
            Stmt::let_("k_ro", Expr::load(bindings::RAY_ORIGIN).swizzle("xyz")),
            Stmt::let_("k_rdw", Expr::load(bindings::RAY_DIRECTION)),
            Stmt::let_("k_rd", Expr::var("k_rdw").swizzle("xyz")),
            Stmt::when(
                Expr::or(
                    Expr::cmp(
                        CompareOp::Ge,
                        Expr::var("k_depth").swizzle("x"),
                        Expr::Const(far * 0.5),
                    ),
                    Expr::cmp(
                        CompareOp::Lt,
                        Expr::var("k_rdw").swizzle("w"),
                        Expr::Const(0.5),
                    ),
                ),
                vec![
                    Stmt::store(out(bindings::META), Expr::var("k_meta")),
                    Stmt::Return(None),
                ],
            ),
            Stmt::let_("k_n", Expr::load(bindings::NORMAL).swizzle("xyz")),
            Stmt::let_(
                "k_pos",
                Self::sample_point(Expr::var("k_depth").swizzle("x")),
            ),
        ]
    }

    fn compute_ao(&self) -> Vec<Stmt> {
        let mut body = self.surface_prologue();
        body.push(Stmt::var("k_occ", ValueType::F32, Expr::Const(0.0)));
        body.push(Stmt::var("k_sca", ValueType::F32, Expr::Const(1.0)));
        body.push(Stmt::Loop {
            counter: "k_i".into(),
            count: AO_STEPS,
            body: vec![
                Stmt::let_(
                    "k_h",
                    Expr::add(
                        Expr::Const(0.01),
                        Expr::div(
                            Expr::mul(Expr::Const(0.12), Expr::var("k_i")),
                            Expr::Const((AO_STEPS - 1) as f32),
                        ),
                    ),
                ),
                Stmt::let_(
                    "k_d",
                    Expr::func(
                        MAP_FN,
                        vec![Expr::add(
                            Expr::var("k_pos"),
                            Expr::mul(Expr::var("k_n"), Expr::var("k_h")),
                        )],
                    ),
                ),
                Stmt::Assign {
                    target: "k_occ".into(),
                    component: None,
                    op: AssignOp::Add,
                    value: Expr::mul(
                        Expr::sub(Expr::var("k_h"), Expr::var("k_d")),
                        Expr::var("k_sca"),
                    ),
                },
                Stmt::Assign {
                    target: "k_sca".into(),
                    component: None,
                    op: AssignOp::Mul,
                    value: Expr::Const(0.95),
                },
            ],
        });
        body.push(Stmt::let_(
            "k_ao",
            Expr::call(
                Builtin::Clamp,
                vec![
                    Expr::sub(
                        Expr::Const(1.0),
                        Expr::mul(Expr::Const(3.0), Expr::var("k_occ")),
                    ),
                    Expr::Const(0.0),
                    Expr::Const(1.0),
                ],
            ),
        ));
        body.push(Stmt::store(
            out(bindings::META),
            v4(vec![
                Expr::mul(Expr::var("k_meta").swizzle("x"), Expr::var("k_ao")),
                Expr::var("k_meta").swizzle("yzw"),
            ]),
        ));
        body
    }

    fn compute_shadow(&self) -> Vec<Stmt> {
        let light = c3(self.options.trace.light);
        let mut body = self.surface_prologue();
        body.push(Stmt::let_(
            "k_start",
            Expr::add(
                Expr::var("k_pos"),
                Expr::mul(Expr::var("k_n"), Expr::Const(0.01)),
            ),
        ));
        body.push(Stmt::var("k_res", ValueType::F32, Expr::Const(1.0)));
        body.push(Stmt::var("k_st", ValueType::F32, Expr::Const(0.02)));
        body.push(Stmt::Loop {
            counter: "k_i".into(),
            count: SHADOW_STEPS,
            body: vec![
                Stmt::let_(
                    "k_h",
                    Expr::func(
                        MAP_FN,
                        vec![Expr::add(
                            Expr::var("k_start"),
                            Expr::mul(light, Expr::var("k_st")),
                        )],
                    ),
                ),
                Stmt::set(
                    "k_res",
                    Expr::call(
                        Builtin::Min,
                        vec![
                            Expr::var("k_res"),
                            Expr::div(
                                Expr::mul(Expr::Const(8.0), Expr::var("k_h")),
                                Expr::var("k_st"),
                            ),
                        ],
                    ),
                ),
                Stmt::Assign {
                    target: "k_st".into(),
                    component: None,
                    op: AssignOp::Add,
                    value: Expr::call(
                        Builtin::Clamp,
                        vec![Expr::var("k_h"), Expr::Const(0.02), Expr::Const(0.5)],
                    ),
                },
                Stmt::when(
                    Expr::or(
                        Expr::cmp(CompareOp::Lt, Expr::var("k_res"), Expr::Const(HIT_EPSILON)),
                        Expr::cmp(
                            CompareOp::Gt,
                            Expr::var("k_st"),
                            Expr::Const(SHADOW_MAX_DISTANCE),
                        ),
                    ),
                    vec![Stmt::Break],
                ),
            ],
        });
        body.push(Stmt::store(
            out(bindings::META),
            v4(vec![
                Expr::var("k_meta").swizzle("x"),
                Expr::mul(
                    Expr::var("k_meta").swizzle("y"),
                    Expr::call(
                        Builtin::Clamp,
                        vec![Expr::var("k_res"), Expr::Const(0.0), Expr::Const(1.0)],
                    ),
                ),
                Expr::var("k_meta").swizzle("zw"),
            ]),
        ));
        body
    }

    fn compute_material(&self) -> Result<Vec<Stmt>, BuildError> {
        let far = self.options.trace.far;
        let mut body = vec![
            Stmt::let_("k_depth", Expr::load(bindings::DEPTH)),
            Stmt::let_("k_prev", Expr::load(bindings::MATERIAL)),
            Self::uv(),
        ];
        let (mut then, _) = self.material_stmts(None)?;
        then.push(Stmt::store(out(bindings::MATERIAL), Expr::var("k_color")));
        body.push(Stmt::If {
            cond: Expr::and(
                Expr::cmp(
                    CompareOp::Lt,
                    Expr::var("k_depth").swizzle("x"),
                    Expr::Const(far * 0.5),
                ),
                Expr::cmp(
                    CompareOp::Lt,
                    Expr::call(
                        Builtin::Abs,
                        vec![Expr::sub(
                            Expr::var("k_depth").swizzle("y"),
                            Expr::Const(self.options.shape_id),
                        )],
                    ),
                    Expr::Const(0.5),
                ),
            ),
            then,
            otherwise: vec![Stmt::store(out(bindings::MATERIAL), Expr::var("k_prev"))],
        });
        Ok(body)
    }

    fn module_3d(
        &self,
        tree: &CombineTree,
    ) -> Result<(KernelModule, Option<MonitorEntry>), BuildError> {
        let mut module = KernelModule::new(&self.name);
        module.functions.push(rotate_fn(ROTATE_X_FN, 0));
        module.functions.push(rotate_fn(ROTATE_Y_FN, 1));
        module.functions.push(rotate_fn(ROTATE_Z_FN, 2));
        module.functions.push(self.map_fn(tree));
        module.functions.push(normal_fn());

        let rays = [bindings::DEPTH, bindings::RAY_ORIGIN, bindings::RAY_DIRECTION];
        entry(
            &mut module,
            HIT_AND_NORMALS_ENTRY,
            &[bindings::DEPTH, bindings::NORMAL, bindings::RAY_ORIGIN, bindings::RAY_DIRECTION],
            &[out(bindings::DEPTH), out(bindings::NORMAL)],
            self.hit_and_normals(),
        );
        let surface = [
            bindings::DEPTH,
            bindings::NORMAL,
            bindings::META,
            bindings::RAY_ORIGIN,
            bindings::RAY_DIRECTION,
        ];
        entry(
            &mut module,
            AO_ENTRY,
            &surface,
            &[out(bindings::META)],
            self.compute_ao(),
        );
        entry(
            &mut module,
            SHADOW_ENTRY,
            &surface,
            &[out(bindings::META)],
            self.compute_shadow(),
        );
        if self.options.material.is_some() {
            entry(
                &mut module,
                MATERIAL_ENTRY,
                &[bindings::DEPTH, bindings::MATERIAL],
                &[out(bindings::MATERIAL)],
                self.compute_material()?,
            );
        }

        let Some(tap) = &self.tap else {
            return Ok((module, None));
        };
        let mut body = vec![Stmt::var(MONITOR_VAR, ValueType::Vec4, splat4(0.0))];
        let mut reads: Vec<&str> = Vec::new();
        let channels = match tap {
            Tap::Out => {
                reads.extend(rays);
                body.extend(Self::ray_inputs());
                body.extend(self.march());
                body.push(Stmt::var("k_mon", ValueType::F32, Expr::var("k_prev").swizzle("x")));
                body.push(Stmt::when(
                    Expr::cmp(CompareOp::Gt, Expr::var("k_hit"), Expr::Const(0.5)),
                    vec![Stmt::set("k_mon", Expr::var("k_t"))],
                ));
                body.push(Stmt::set(MONITOR_VAR, widen(Expr::var("k_mon"), ValueType::F32)));
                1
            }
            Tap::Leaf { stmts, ty } => {
                reads.extend(rays);
                module.functions.push(self.map_monitor_fn(stmts));
                body.extend(Self::ray_inputs());
                body.extend(self.march());
                body.push(Stmt::set(
                    MONITOR_VAR,
                    Expr::func(
                        MAP_MONITOR_FN,
                        vec![Self::sample_point(Expr::call(
                            Builtin::Min,
                            vec![Expr::var("k_t"), Expr::Const(self.options.trace.far)],
                        ))],
                    ),
                ));
                monitor_channels(*ty)
            }
            Tap::Camera(_) => {
                return Err(BuildError::stream("3D streams take no camera"));
            }
            Tap::Material(fragment) => {
                body.push(Self::uv());
                let (stmts, ty) = self.material_stmts(Some(fragment))?;
                body.extend(stmts);
                monitor_channels(ty.unwrap_or(ValueType::Vec4))
            }
        };
        body.push(Stmt::store(MONITOR_BINDING, Expr::var(MONITOR_VAR)));
        entry(
            &mut module,
            HIT_MONITOR_ENTRY,
            &reads,
            &[MONITOR_BINDING.to_string()],
            body,
        );
        Ok((module, Some(self.monitor_entry(channels))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::graph::component::CombineOp;
    use crate::graph::library::{
        box_2d, circle_2d, pan_camera_2d, solid_colorize, sphere_3d, transform_2d,
    };
    use crate::kernel::validation::validate_module;

    #[test]
    fn failing_chain_link_leaves_the_stream_unchanged() {
        let mut builder = StreamBuilder::new();
        builder
            .open_stream(StreamKind::Sdf2D, "s", StreamOptions::default())
            .unwrap();
        builder.push_component(&circle_2d("a", 1.0), &[]).unwrap();
        let snapshot = |b: &StreamBuilder| {
            b.open
                .as_ref()
                .map(|s| (s.table.clone(), s.components.len(), s.leaves.len()))
        };
        let before = snapshot(&builder);

        let mut hole = circle_2d("hole", 1.0);
        hole.fields.remove("_posX");
        let chained = circle_2d("b", 2.0).with_sub_component(hole);
        let offset = transform_2d("t", 1.0, 0.0);
        assert!(builder.push_component(&chained, &[&offset]).is_err());
        assert_eq!(snapshot(&builder), before);

        builder.push_component(&circle_2d("b", 2.0), &[&offset]).unwrap();
        assert_eq!(builder.pushed(), 2);
    }

    fn validated(parts: &InstanceParts) {
        assert_eq!(parts.module.verify(), Ok(()));
        if let Err(e) = validate_module(&parts.module) {
            panic!("{e:#}");
        }
    }

    #[test]
    fn push_and_close_require_an_open_stream() {
        let mut builder = StreamBuilder::new();
        assert!(matches!(
            builder.push_component(&circle_2d("c", 1.0), &[]),
            Err(BuildError::Stream(_))
        ));
        assert!(matches!(builder.finish(), Err(BuildError::Stream(_))));

        builder
            .open_stream(StreamKind::Sdf2D, "shape_0", StreamOptions::default())
            .expect("open");
        assert!(matches!(builder.finish(), Err(BuildError::Stream(_))));
        assert!(!builder.is_open());
    }

    #[test]
    fn reopening_discards_the_previous_stream() {
        let mut builder = StreamBuilder::new();
        builder
            .open_stream(StreamKind::Sdf2D, "a", StreamOptions::default())
            .expect("open");
        builder.push_component(&circle_2d("c", 1.0), &[]).expect("push");
        builder
            .open_stream(StreamKind::Sdf2D, "b", StreamOptions::default())
            .expect("reopen");
        assert_eq!(builder.pushed(), 0);
        builder.push_component(&circle_2d("c", 1.0), &[]).expect("push again");
        assert_eq!(builder.finish().expect("finish").name, "b");
    }

    #[test]
    fn wrong_kinds_and_duplicates_are_rejected() {
        let mut builder = StreamBuilder::new();
        builder
            .open_stream(StreamKind::Sdf2D, "s", StreamOptions::default())
            .expect("open");
        assert!(matches!(
            builder.push_component(&sphere_3d("ball", 1.0), &[]),
            Err(BuildError::KindMismatch { .. })
        ));
        builder.push_component(&circle_2d("c", 1.0), &[]).expect("push");
        assert!(matches!(
            builder.push_component(&circle_2d("c", 2.0), &[]),
            Err(BuildError::Stream(_))
        ));

        let err = builder.open_stream(
            StreamKind::Sdf3D,
            "s3",
            StreamOptions::default().with_camera(pan_camera_2d("cam")),
        );
        assert!(matches!(err, Err(BuildError::KindMismatch { .. })));
    }

    #[test]
    fn two_d_kernel_validates_with_camera_material_and_transform() {
        let mut builder = StreamBuilder::new();
        let options = StreamOptions::default()
            .with_camera(pan_camera_2d("cam"))
            .with_material(solid_colorize("paint", [1.0, 0.0, 0.0, 1.0]));
        builder.open_stream(StreamKind::Sdf2D, "shape_0", options).expect("open");
        let t = transform_2d("t", 10.0, 5.0);
        builder
            .push_component(
                &box_2d("b", 4.0, 3.0)
                    .with_sub_component(circle_2d("hole", 1.0).with_combine(CombineOp::Subtract)),
                &[&t],
            )
            .expect("push box");
        builder.push_component(&circle_2d("c", 2.0), &[&t]).expect("push circle");
        let parts = builder.finish().expect("finish");
        validated(&parts);
        assert!(parts.module.has_entry(HIT_ENTRY));
        assert!(parts.monitor.is_none());
        let ids: Vec<&str> = parts.components.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["cam", "paint", "t", "b", "hole", "c"]);
    }

    #[test]
    fn three_d_kernel_exposes_every_pass() {
        let mut builder = StreamBuilder::new();
        builder
            .open_stream(
                StreamKind::Sdf3D,
                "shape_0",
                StreamOptions::default().with_material(solid_colorize("paint", [1.0; 4])),
            )
            .expect("open");
        builder.push_component(&sphere_3d("s", 1.0), &[]).expect("push");
        let parts = builder.finish().expect("finish");
        validated(&parts);
        for e in [HIT_AND_NORMALS_ENTRY, AO_ENTRY, SHADOW_ENTRY, MATERIAL_ENTRY] {
            assert!(parts.module.has_entry(e), "{e}");
        }
    }

    #[test]
    fn monitor_channels_follow_the_tapped_arity() {
        let cases = [("b", "q", 2), ("b", "out", 1), ("paint", "out", 4)];
        for (component, fragment, channels) in cases {
            let mut builder = StreamBuilder::new();
            let options = StreamOptions::default()
                .with_material(solid_colorize("paint", [1.0; 4]))
                .with_monitor(MonitorTarget {
                    component: component.into(),
                    fragment: fragment.into(),
                });
            builder.open_stream(StreamKind::Sdf2D, "s", options).expect("open");
            builder.push_component(&box_2d("b", 1.0, 1.0), &[]).expect("push");
            let parts = builder.finish().expect("finish");
            validated(&parts);
            let monitor = parts.monitor.expect("monitor entry");
            assert_eq!(monitor.channels, channels, "{component}.{fragment}");
            assert!(parts.module.has_entry(HIT_MONITOR_ENTRY));
        }
    }

    #[test]
    fn close_compiles_through_the_backend() {
        let mut backend = CpuBackend::new();
        let mut builder = StreamBuilder::new();
        builder
            .open_stream(StreamKind::Sdf2D, "shape_0", StreamOptions::default())
            .expect("open");
        builder.push_component(&circle_2d("c", 3.0), &[]).expect("push");
        let instance = builder.close_stream(&mut backend).expect("close");
        assert_eq!(instance.role(), InstanceRole::Shape);
        assert!(instance.debug_range("c").is_some());
        assert!(instance.debug_range("missing").is_none());
    }
}
