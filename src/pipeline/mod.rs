//! Multi-pass render pipeline.
//!
//! [`Pipeline::build`] turns a [`Scene`] into named [`Instance`]s (`pre`,
//! `camera3D`, `shape_{i}`, `render`); [`Pipeline::render`] runs them in a
//! fixed order over pooled textures and returns the final texture.

pub mod camera;
pub mod export;
pub mod point_cloud;
pub mod stage;
pub mod textures;

use std::collections::BTreeMap;
use std::fmt;

use crate::backend::{Backend, KernelId, TextureId};
use crate::compiler::bindings::{self, out};
use crate::compiler::component_kernel::{background_kernel, camera_kernel, render_kernel};
use crate::compiler::monitor::{self, MONITOR_BINDING, MonitorTap, MonitorTarget};
use crate::compiler::stream::{
    AO_ENTRY, HIT_AND_NORMALS_ENTRY, HIT_ENTRY, MATERIAL_ENTRY, SHADOW_ENTRY,
};
use crate::compiler::{
    Instance, InstanceParts, StreamBuilder, StreamKind, StreamOptions, TraceSettings,
    binding_format,
};
use crate::config::{PipelineSettings, RenderSettings};
use crate::error::{BackendError, BuildError, RenderError};
use crate::graph::library::pinhole_camera_3d;
use crate::graph::{Component, ComponentKind, Scene, SceneMode, StageItem, StageKind};
use crate::kernel::utility::{MAIN_ENTRY, reflect_rays_module, reflection_composite_module};

pub use point_cloud::PointCloudPipeline;
pub use stage::PipelineStage;
pub use textures::{ActiveSlot, PingPong, TexturePool, validate_resolution};

pub const PRE_INSTANCE: &str = "pre";
pub const CAMERA_INSTANCE: &str = "camera3D";
pub const RENDER_INSTANCE: &str = "render";
/// Instance name of utility kernels in diagnostics.
pub const UTILITY_INSTANCE: &str = "utility";
/// Instance name of monitor resolution failures in diagnostics.
pub const MONITOR_INSTANCE: &str = "monitor";

const DEFAULT_CAMERA_ID: &str = "default_camera";
const REFLECTION_PREFIX: &str = "refl_";

const WHITE: [f32; 4] = [1.0; 4];
const NEUTRAL_META: [f32; 4] = [1.0, 1.0, 0.0, 0.0];

pub fn shape_instance_name(index: usize) -> String {
    format!("shape_{index}")
}

/// A failed Instance of the last build.
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub instance: String,
    pub component: Option<String>,
    pub error: BuildError,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.component {
            Some(c) => write!(f, "{} ({c}): {}", self.instance, self.error),
            None => write!(f, "{}: {}", self.instance, self.error),
        }
    }
}

struct Utilities {
    reflect: KernelId,
    composite: KernelId,
}

/// Textures left behind by one 3D trace.
#[derive(Clone, Copy, Debug)]
struct Surfaces {
    depth: TextureId,
    normal: TextureId,
    meta: TextureId,
    material: TextureId,
}

/// Ray textures of one 3D trace.
#[derive(Clone, Copy, Debug)]
struct Rays {
    origin: TextureId,
    direction: TextureId,
}

pub struct Pipeline<B: Backend> {
    backend: B,
    settings: PipelineSettings,
    render_settings: RenderSettings,
    minimal_preview: bool,
    mode: SceneMode,
    instances: BTreeMap<String, Instance>,
    shape_order: Vec<String>,
    utilities: Option<Utilities>,
    monitor_target: Option<MonitorTarget>,
    monitor_instance: Option<String>,
    pool: TexturePool,
    stage: PipelineStage,
    diagnostics: Vec<Diagnostic>,
    resolution: Option<(u32, u32)>,
    result: Option<TextureId>,
}

impl<B: Backend> Pipeline<B> {
    pub fn new(backend: B, settings: PipelineSettings) -> Self {
        Self {
            backend,
            settings,
            render_settings: RenderSettings::default(),
            minimal_preview: false,
            mode: SceneMode::default(),
            instances: BTreeMap::new(),
            shape_order: Vec::new(),
            utilities: None,
            monitor_target: None,
            monitor_instance: None,
            pool: TexturePool::new(),
            stage: PipelineStage::None,
            diagnostics: Vec::new(),
            resolution: None,
            result: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Trace parameters are baked into kernels and apply from the next build;
    /// the stage ceiling, reflectivity and fallback color apply immediately.
    pub fn set_settings(&mut self, settings: PipelineSettings) {
        self.settings = settings;
    }

    pub fn set_render_settings(&mut self, settings: RenderSettings) {
        self.render_settings = settings;
    }

    /// Cap rendering at hit and normals for cheap previews.
    pub fn set_minimal_preview(&mut self, minimal: bool) {
        self.minimal_preview = minimal;
    }

    pub fn minimal_preview(&self) -> bool {
        self.minimal_preview
    }

    /// Highest stage a render may reach.
    pub fn max_stage(&self) -> PipelineStage {
        if self.minimal_preview {
            self.settings.max_stage.min(PipelineStage::HitAndNormals)
        } else {
            self.settings.max_stage
        }
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn instance(&self, name: &str) -> Option<&Instance> {
        self.instances.get(name)
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    /// Shape Instance names in render order.
    pub fn shape_instances(&self) -> &[String] {
        &self.shape_order
    }

    pub fn result_texture(&self) -> Option<TextureId> {
        self.result
    }

    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.resolution
    }

    /// Monitor texture and its active channel count, once a render ran a tap.
    pub fn monitor_texture(&self) -> Option<(TextureId, usize)> {
        let name = self.monitor_instance.as_deref()?;
        let channels = self.instances.get(name)?.monitor()?.channels;
        Some((self.pool.get(bindings::MONITOR)?, channels))
    }

    /// A pooled single texture by logical name.
    pub fn texture(&self, name: &str) -> Option<TextureId> {
        self.pool.get(name)
    }

    /// Current side of a pooled pair by logical name.
    pub fn pair_texture(&self, name: &str) -> Option<TextureId> {
        self.pool.pair(name).map(|p| p.current())
    }

    pub fn read_texture(&mut self, texture: TextureId) -> Result<Vec<[f32; 4]>, RenderError> {
        Ok(self.backend.read_texture(texture)?)
    }

    /// Compile every pass of `scene`. Failed Instances are reported and the
    /// previous Instance of the same name, if any, stays in service.
    #[tracing::instrument(skip_all, fields(mode = ?scene.mode))]
    pub fn build(&mut self, scene: &Scene, monitor_tap: Option<&MonitorTap>) -> Vec<Diagnostic> {
        self.stage = PipelineStage::Compiling;
        self.diagnostics.clear();
        self.mode = scene.mode;
        self.monitor_target = None;
        if let Some(tap) = monitor_tap {
            match monitor::resolve(scene, tap) {
                Ok(Some(target)) => self.monitor_target = Some(target),
                Ok(None) => tracing::debug!(component = %tap.component, "monitor tap matched nothing"),
                Err(error) => self.report(MONITOR_INSTANCE, Some(&tap.component), error),
            }
        }

        let mut wanted = Vec::new();
        let target = self.monitor_target.clone();

        let background = match scene.mode {
            SceneMode::TwoD => scene.first_of_kind(StageKind::PreStage, ComponentKind::Colorize),
            SceneMode::ThreeD => scene
                .first_of_kind(StageKind::PreStage, ComponentKind::SkyDome)
                .or_else(|| scene.first_of_kind(StageKind::PreStage, ComponentKind::Colorize)),
        };
        if let Some(c) = background {
            wanted.push(PRE_INSTANCE.to_string());
            let parts = background_kernel(PRE_INSTANCE, c, target.as_ref());
            self.install(PRE_INSTANCE, Some(&c.id), parts);
        }

        let mut camera_2d = None;
        match scene.mode {
            SceneMode::TwoD => {
                camera_2d = scene
                    .first_of_kind(StageKind::PreStage, ComponentKind::Camera2D)
                    .cloned();
            }
            SceneMode::ThreeD => {
                let fallback;
                let camera = match scene.first_of_kind(StageKind::PreStage, ComponentKind::Camera3D) {
                    Some(c) => c,
                    None => {
                        fallback = pinhole_camera_3d(DEFAULT_CAMERA_ID);
                        &fallback
                    }
                };
                wanted.push(CAMERA_INSTANCE.to_string());
                let parts = camera_kernel(CAMERA_INSTANCE, camera, target.as_ref());
                self.install(CAMERA_INSTANCE, Some(&camera.id), parts);
            }
        }

        self.shape_order.clear();
        let trace = TraceSettings::from(&self.settings);
        let shape_items = scene
            .items(StageKind::ShapeStage)
            .iter()
            .filter(|item| item.has_shapes());
        for (index, item) in shape_items.enumerate() {
            let name = shape_instance_name(index);
            let mut options = StreamOptions::default()
                .with_shape_id(index as f32 + 1.0)
                .with_trace(trace);
            options.camera = camera_2d.clone();
            options.material = item.material().cloned();
            options.monitor = target.clone();
            match shape_parts(scene.mode, &name, item, options) {
                Ok(parts) => self.install(&name, None, Ok(parts)),
                Err((component, error)) => self.install(&name, component.as_deref(), Err(error)),
            }
            wanted.push(name.clone());
            self.shape_order.push(name);
        }

        let render_kind = match scene.mode {
            SceneMode::TwoD => ComponentKind::Render2D,
            SceneMode::ThreeD => ComponentKind::Render3D,
        };
        if let Some(c) = scene.first_of_kind(StageKind::RenderStage, render_kind) {
            wanted.push(RENDER_INSTANCE.to_string());
            let parts = render_kernel(RENDER_INSTANCE, c, trace.far, target.as_ref());
            self.install(RENDER_INSTANCE, Some(&c.id), parts);
        }

        self.build_utilities();

        let stale: Vec<String> = self
            .instances
            .keys()
            .filter(|name| !wanted.contains(name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(old) = self.instances.remove(&name) {
                self.backend.release_kernel(old.kernel());
            }
        }
        self.shape_order.retain(|name| self.instances.contains_key(name));
        self.monitor_instance = self
            .instances
            .iter()
            .find(|(_, i)| i.monitor().is_some())
            .map(|(name, _)| name.clone());

        self.stage = PipelineStage::Compiled;
        tracing::info!(
            instances = self.instances.len(),
            shapes = self.shape_order.len(),
            diagnostics = self.diagnostics.len(),
            monitor = ?self.monitor_instance,
            "pipeline built"
        );
        self.diagnostics.clone()
    }

    /// Rewrite property values from an edited scene without recompiling.
    /// Nothing changes unless every Instance accepts the new values; a
    /// [`BuildError::LayoutChanged`] means the caller should rebuild.
    pub fn update_values(&mut self, scene: &Scene) -> Result<usize, BuildError> {
        let mut refreshed = BTreeMap::new();
        let mut written = 0;
        for (name, instance) in &self.instances {
            if instance.owns(DEFAULT_CAMERA_ID)
                && scene.find_component(DEFAULT_CAMERA_ID).is_none()
            {
                if let Some(camera) =
                    scene.first_of_kind(StageKind::PreStage, ComponentKind::Camera3D)
                {
                    return Err(BuildError::LayoutChanged {
                        key: camera.id.clone(),
                    });
                }
                refreshed.insert(name.clone(), instance.clone());
                continue;
            }
            let mut updated = instance.clone();
            written += updated.refresh_values(scene)?;
            refreshed.insert(name.clone(), updated);
        }
        self.instances = refreshed;
        tracing::debug!(records = written, "property values refreshed");
        Ok(written)
    }

    fn report(&mut self, instance: &str, component: Option<&str>, error: BuildError) {
        let component = error
            .component()
            .or(component)
            .map(str::to_string);
        tracing::warn!(
            instance,
            component = component.as_deref().unwrap_or("-"),
            kept_previous = self.instances.contains_key(instance),
            %error,
            "instance failed to build"
        );
        self.diagnostics.push(Diagnostic {
            instance: instance.to_string(),
            component,
            error,
        });
    }

    fn install(
        &mut self,
        name: &str,
        component: Option<&str>,
        parts: Result<InstanceParts, BuildError>,
    ) {
        match parts.and_then(|p| Instance::compile(p, &mut self.backend)) {
            Ok(instance) => {
                if let Some(old) = self.instances.insert(name.to_string(), instance) {
                    self.backend.release_kernel(old.kernel());
                }
            }
            Err(error) => self.report(name, component, error),
        }
    }

    fn build_utilities(&mut self) {
        if let Some(old) = self.utilities.take() {
            self.backend.release_kernel(old.reflect);
            self.backend.release_kernel(old.composite);
        }
        if self.mode != SceneMode::ThreeD {
            return;
        }
        let reflect = self
            .backend
            .compile(&reflect_rays_module(self.settings.far_distance));
        let composite = self.backend.compile(&reflection_composite_module());
        match (reflect, composite) {
            (Ok(reflect), Ok(composite)) => self.utilities = Some(Utilities { reflect, composite }),
            (reflect, composite) => {
                for (label, result) in [("reflect_rays", reflect), ("reflection_composite", composite)] {
                    match result {
                        Ok(kernel) => self.backend.release_kernel(kernel),
                        Err(source) => self.report(
                            UTILITY_INSTANCE,
                            None,
                            BuildError::Backend {
                                label: label.to_string(),
                                source,
                            },
                        ),
                    }
                }
            }
        }
    }

    /// Render with the stored [`RenderSettings`].
    pub fn render(&mut self, width: f32, height: f32) -> Result<TextureId, RenderError> {
        let settings = self.render_settings;
        self.render_with(width, height, settings)
    }

    #[tracing::instrument(skip(self, settings))]
    pub fn render_with(
        &mut self,
        width: f32,
        height: f32,
        settings: RenderSettings,
    ) -> Result<TextureId, RenderError> {
        let (w, h) = validate_resolution(width, height)?;
        if self.stage < PipelineStage::Compiled {
            return Err(RenderError::NotBuilt);
        }
        self.render_settings = settings;
        for instance in self.instances.values_mut() {
            instance.set_globals(&settings);
        }
        if self.monitor_instance.is_some() {
            let monitor = self.ensure(bindings::MONITOR, w, h)?;
            self.backend.clear(monitor, [0.0; 4])?;
        }

        let (result, reached) = match self.mode {
            SceneMode::TwoD => self.render_2d(w, h)?,
            SceneMode::ThreeD => self.render_3d(w, h)?,
        };
        self.stage = self.stage.max(reached);
        self.resolution = Some((w, h));
        self.result = Some(result);
        tracing::debug!(width = w, height = h, stage = %self.stage, "rendered");
        Ok(result)
    }

    /// Render only if the result texture does not already have this size.
    /// Returns whether a render happened.
    pub fn render_if_resolution_changed(
        &mut self,
        width: f32,
        height: f32,
    ) -> Result<bool, RenderError> {
        let (w, h) = validate_resolution(width, height)?;
        if let Some(result) = self.result {
            let current = self.backend.texture_desc(result).map(|d| (d.width, d.height));
            if current == Some((w, h)) {
                return Ok(false);
            }
        }
        self.render(width, height)?;
        Ok(true)
    }

    /// Read back the final texture of the last render.
    pub fn read_result(&mut self) -> Result<(u32, u32, Vec<[f32; 4]>), RenderError> {
        let (Some(result), Some((w, h))) = (self.result, self.resolution) else {
            return Err(RenderError::NotBuilt);
        };
        Ok((w, h, self.backend.read_texture(result)?))
    }

    fn ensure(&mut self, name: &str, w: u32, h: u32) -> Result<TextureId, RenderError> {
        Ok(self
            .pool
            .ensure(&mut self.backend, name, w, h, binding_format(name))?)
    }

    /// (Re)allocate pair `prefix + name`, put it on its first slot and clear it.
    fn fresh_pair(
        &mut self,
        prefix: &str,
        name: &str,
        w: u32,
        h: u32,
        clear: [f32; 4],
    ) -> Result<(), RenderError> {
        let key = format!("{prefix}{name}");
        self.pool
            .ensure_pair(&mut self.backend, &key, w, h, binding_format(name))?;
        self.pool.reset(&key);
        let pair = self.pair(prefix, name)?;
        self.backend.clear(pair.current(), clear)?;
        Ok(())
    }

    fn pair(&self, prefix: &str, name: &str) -> Result<PingPong, RenderError> {
        self.pool
            .pair(&format!("{prefix}{name}"))
            .ok_or_else(|| {
                RenderError::Backend(BackendError::TextureMismatch(format!(
                    "texture pair '{prefix}{name}' is not allocated"
                )))
            })
    }

    fn swap(&mut self, prefix: &str, name: &str) {
        self.pool.swap(&format!("{prefix}{name}"));
    }

    /// Dispatch `entry` of Instance `name` if it exists, followed by its
    /// monitor entry when `monitor` is set and the Instance carries the tap.
    fn run_pass(
        &mut self,
        name: &str,
        entry: &str,
        textures: &[(&str, TextureId)],
        monitor: bool,
    ) -> Result<bool, RenderError> {
        let Some(instance) = self.instances.get(name) else {
            return Ok(false);
        };
        if !instance.has_entry(entry) {
            return Ok(false);
        }
        tracing::debug!(instance = name, entry, "dispatch");
        instance.dispatch(&mut self.backend, entry, textures)?;
        if monitor && self.monitor_instance.as_deref() == Some(name) {
            if let (Some(tap), Some(target)) = (instance.monitor(), self.pool.get(bindings::MONITOR)) {
                let mut with_monitor = textures.to_vec();
                with_monitor.push((MONITOR_BINDING, target));
                instance.dispatch(&mut self.backend, &tap.entry, &with_monitor)?;
            }
        }
        Ok(true)
    }

    fn background_pass(
        &mut self,
        target: TextureId,
        ray_direction: Option<TextureId>,
        monitor: bool,
    ) -> Result<(), RenderError> {
        let out_background = out(bindings::BACKGROUND);
        let mut textures = vec![(out_background.as_str(), target)];
        if let Some(direction) = ray_direction {
            textures.push((bindings::RAY_DIRECTION, direction));
        }
        if !self.run_pass(PRE_INSTANCE, MAIN_ENTRY, &textures, monitor)? {
            tracing::debug!("no background instance, clearing to the fallback color");
            self.backend.clear(target, self.settings.background_fallback)?;
        }
        Ok(())
    }

    fn render_2d(&mut self, w: u32, h: u32) -> Result<(TextureId, PipelineStage), RenderError> {
        let background = self.ensure(bindings::BACKGROUND, w, h)?;
        self.background_pass(background, None, true)?;

        let far = self.settings.far_distance;
        self.fresh_pair("", bindings::DEPTH, w, h, [far, 0.0, 0.0, 0.0])?;
        self.fresh_pair("", bindings::MATERIAL, w, h, WHITE)?;
        let (out_depth, out_material) = (out(bindings::DEPTH), out(bindings::MATERIAL));
        for name in self.shape_order.clone() {
            let depth = self.pair("", bindings::DEPTH)?;
            let material = self.pair("", bindings::MATERIAL)?;
            let textures = [
                (bindings::DEPTH, depth.current()),
                (bindings::MATERIAL, material.current()),
                (out_depth.as_str(), depth.next()),
                (out_material.as_str(), material.next()),
            ];
            if self.run_pass(&name, HIT_ENTRY, &textures, true)? {
                self.swap("", bindings::DEPTH);
                self.swap("", bindings::MATERIAL);
            }
        }

        let depth = self.pair("", bindings::DEPTH)?.current();
        let material = self.pair("", bindings::MATERIAL)?.current();
        let result = self.ensure(bindings::RESULT, w, h)?;
        let out_result = out(bindings::RESULT);
        let textures = [
            (bindings::BACKGROUND, background),
            (bindings::DEPTH, depth),
            (bindings::MATERIAL, material),
            (out_result.as_str(), result),
        ];
        if !self.run_pass(RENDER_INSTANCE, MAIN_ENTRY, &textures, true)? {
            self.backend.copy(background, result)?;
        }
        Ok((result, PipelineStage::HitAndNormals))
    }

    fn render_3d(&mut self, w: u32, h: u32) -> Result<(TextureId, PipelineStage), RenderError> {
        let ceiling = self.max_stage();
        let rays = Rays {
            origin: self.ensure(bindings::RAY_ORIGIN, w, h)?,
            direction: self.ensure(bindings::RAY_DIRECTION, w, h)?,
        };
        let (out_origin, out_direction) = (out(bindings::RAY_ORIGIN), out(bindings::RAY_DIRECTION));
        let textures = [
            (out_origin.as_str(), rays.origin),
            (out_direction.as_str(), rays.direction),
        ];
        if !self.run_pass(CAMERA_INSTANCE, MAIN_ENTRY, &textures, true)? {
            tracing::warn!("no camera instance, every ray misses");
            self.backend.clear(rays.origin, [0.0, 0.0, 0.0, 1.0])?;
            self.backend.clear(rays.direction, [0.0; 4])?;
        }

        let background = self.ensure(bindings::BACKGROUND, w, h)?;
        self.background_pass(background, Some(rays.direction), true)?;

        let (surfaces, mut reached) = self.trace("", w, h, rays, ceiling, true)?;
        let result = self.ensure(bindings::RESULT, w, h)?;
        self.render_pass(background, surfaces, rays, result, true)?;

        let can_reflect = self.instances.contains_key(RENDER_INSTANCE) && self.utilities.is_some();
        if ceiling < PipelineStage::Reflection || !can_reflect {
            return Ok((result, reached));
        }
        let composite = self.reflection_pass(w, h, surfaces, rays, result)?;
        reached = PipelineStage::Reflection;
        Ok((composite, reached))
    }

    /// Hit, normals and as many surface passes as `ceiling` allows, on the
    /// pairs named `prefix + name`.
    fn trace(
        &mut self,
        prefix: &str,
        w: u32,
        h: u32,
        rays: Rays,
        ceiling: PipelineStage,
        monitor: bool,
    ) -> Result<(Surfaces, PipelineStage), RenderError> {
        let far = self.settings.far_distance;
        self.fresh_pair(prefix, bindings::DEPTH, w, h, [far, 0.0, 0.0, 0.0])?;
        self.fresh_pair(prefix, bindings::NORMAL, w, h, [0.0; 4])?;
        self.fresh_pair(prefix, bindings::META, w, h, NEUTRAL_META)?;
        self.fresh_pair(prefix, bindings::MATERIAL, w, h, WHITE)?;

        let shapes = self.shape_order.clone();
        let (out_depth, out_normal) = (out(bindings::DEPTH), out(bindings::NORMAL));
        for name in &shapes {
            let depth = self.pair(prefix, bindings::DEPTH)?;
            let normal = self.pair(prefix, bindings::NORMAL)?;
            let textures = [
                (bindings::DEPTH, depth.current()),
                (bindings::NORMAL, normal.current()),
                (bindings::RAY_ORIGIN, rays.origin),
                (bindings::RAY_DIRECTION, rays.direction),
                (out_depth.as_str(), depth.next()),
                (out_normal.as_str(), normal.next()),
            ];
            if self.run_pass(name, HIT_AND_NORMALS_ENTRY, &textures, monitor)? {
                self.swap(prefix, bindings::DEPTH);
                self.swap(prefix, bindings::NORMAL);
            }
        }
        let mut reached = PipelineStage::HitAndNormals;

        let mut surface_entries = Vec::new();
        if ceiling >= PipelineStage::Ao {
            surface_entries.push((AO_ENTRY, PipelineStage::Ao));
        }
        if ceiling >= PipelineStage::ShadowsAndMaterials {
            surface_entries.push((SHADOW_ENTRY, PipelineStage::ShadowsAndMaterials));
        }
        let out_meta = out(bindings::META);
        for (entry, stage) in surface_entries {
            for name in &shapes {
                let meta = self.pair(prefix, bindings::META)?;
                let textures = [
                    (bindings::DEPTH, self.pair(prefix, bindings::DEPTH)?.current()),
                    (bindings::NORMAL, self.pair(prefix, bindings::NORMAL)?.current()),
                    (bindings::META, meta.current()),
                    (bindings::RAY_ORIGIN, rays.origin),
                    (bindings::RAY_DIRECTION, rays.direction),
                    (out_meta.as_str(), meta.next()),
                ];
                if self.run_pass(name, entry, &textures, false)? {
                    self.swap(prefix, bindings::META);
                }
            }
            reached = stage;
        }

        if ceiling >= PipelineStage::ShadowsAndMaterials {
            let out_material = out(bindings::MATERIAL);
            for name in &shapes {
                let material = self.pair(prefix, bindings::MATERIAL)?;
                let textures = [
                    (bindings::DEPTH, self.pair(prefix, bindings::DEPTH)?.current()),
                    (bindings::MATERIAL, material.current()),
                    (out_material.as_str(), material.next()),
                ];
                if self.run_pass(name, MATERIAL_ENTRY, &textures, false)? {
                    self.swap(prefix, bindings::MATERIAL);
                }
            }
        }

        let surfaces = Surfaces {
            depth: self.pair(prefix, bindings::DEPTH)?.current(),
            normal: self.pair(prefix, bindings::NORMAL)?.current(),
            meta: self.pair(prefix, bindings::META)?.current(),
            material: self.pair(prefix, bindings::MATERIAL)?.current(),
        };
        Ok((surfaces, reached))
    }

    fn render_pass(
        &mut self,
        background: TextureId,
        surfaces: Surfaces,
        rays: Rays,
        target: TextureId,
        monitor: bool,
    ) -> Result<(), RenderError> {
        let out_result = out(bindings::RESULT);
        let textures = [
            (bindings::BACKGROUND, background),
            (bindings::DEPTH, surfaces.depth),
            (bindings::NORMAL, surfaces.normal),
            (bindings::META, surfaces.meta),
            (bindings::MATERIAL, surfaces.material),
            (bindings::RAY_ORIGIN, rays.origin),
            (bindings::RAY_DIRECTION, rays.direction),
            (out_result.as_str(), target),
        ];
        if !self.run_pass(RENDER_INSTANCE, MAIN_ENTRY, &textures, monitor)? {
            self.backend.copy(background, target)?;
        }
        Ok(())
    }

    /// Trace reflected rays, render them and mix the reflection over `result`.
    fn reflection_pass(
        &mut self,
        w: u32,
        h: u32,
        primary: Surfaces,
        rays: Rays,
        result: TextureId,
    ) -> Result<TextureId, RenderError> {
        let Some((reflect, composite_kernel)) =
            self.utilities.as_ref().map(|u| (u.reflect, u.composite))
        else {
            return Ok(result);
        };
        let reflected = Rays {
            origin: self.pool.ensure(
                &mut self.backend,
                &format!("{REFLECTION_PREFIX}{}", bindings::RAY_ORIGIN),
                w,
                h,
                binding_format(bindings::RAY_ORIGIN),
            )?,
            direction: self.pool.ensure(
                &mut self.backend,
                &format!("{REFLECTION_PREFIX}{}", bindings::RAY_DIRECTION),
                w,
                h,
                binding_format(bindings::RAY_DIRECTION),
            )?,
        };
        let (out_origin, out_direction) = (out(bindings::RAY_ORIGIN), out(bindings::RAY_DIRECTION));
        self.backend.dispatch(
            reflect,
            MAIN_ENTRY,
            &[],
            &[
                (bindings::DEPTH, primary.depth),
                (bindings::NORMAL, primary.normal),
                (bindings::RAY_ORIGIN, rays.origin),
                (bindings::RAY_DIRECTION, rays.direction),
                (out_origin.as_str(), reflected.origin),
                (out_direction.as_str(), reflected.direction),
            ],
        )?;

        let (surfaces, _) = self.trace(
            REFLECTION_PREFIX,
            w,
            h,
            reflected,
            PipelineStage::ShadowsAndMaterials,
            false,
        )?;
        let background = self.pool.ensure(
            &mut self.backend,
            &format!("{REFLECTION_PREFIX}{}", bindings::BACKGROUND),
            w,
            h,
            binding_format(bindings::BACKGROUND),
        )?;
        self.background_pass(background, Some(reflected.direction), false)?;
        let reflection = self.ensure(bindings::REFLECTION, w, h)?;
        self.render_pass(background, surfaces, reflected, reflection, false)?;

        let composite = self.ensure(bindings::COMPOSITE, w, h)?;
        let out_composite = out(bindings::COMPOSITE);
        self.backend.dispatch(
            composite_kernel,
            MAIN_ENTRY,
            &[[self.settings.reflectivity, 0.0, 0.0, 0.0]],
            &[
                (bindings::RESULT, result),
                (bindings::REFLECTION, reflection),
                (bindings::RAY_DIRECTION, reflected.direction),
                (out_composite.as_str(), composite),
            ],
        )?;
        Ok(composite)
    }
}

type Blamed = (Option<String>, BuildError);

fn blame(error: BuildError, fallback: Option<&str>) -> Blamed {
    let component = error.component().or(fallback).map(str::to_string);
    (component, error)
}

/// One shape stream for a top-level item; errors carry the component that
/// was being pushed.
fn shape_parts(
    mode: SceneMode,
    name: &str,
    item: &StageItem,
    options: StreamOptions,
) -> Result<InstanceParts, Blamed> {
    let kind = match mode {
        SceneMode::TwoD => StreamKind::Sdf2D,
        SceneMode::ThreeD => StreamKind::Sdf3D,
    };
    let mut builder = StreamBuilder::new();
    builder
        .open_stream(kind, name, options)
        .map_err(|e| blame(e, None))?;
    let mut transforms = Vec::new();
    push_item(&mut builder, item, &mut transforms)?;
    builder.finish().map_err(|e| blame(e, None))
}

/// Push an item's shapes, then its children, inside its transform.
fn push_item<'a>(
    builder: &mut StreamBuilder,
    item: &'a StageItem,
    transforms: &mut Vec<&'a Component>,
) -> Result<(), Blamed> {
    let depth = transforms.len();
    if let Some(t) = &item.transform {
        transforms.push(t);
    }
    for shape in item.shapes() {
        builder
            .push_component(shape, transforms)
            .map_err(|e| blame(e, Some(&shape.id)))?;
    }
    for child in &item.children {
        push_item(builder, child, transforms)?;
    }
    transforms.truncate(depth);
    Ok(())
}
