//! Point-cloud preview: one rasterized point per shape item, no kernel
//! compilation involved.

use crate::backend::{Backend, ClipPoint, PointStyle, TextureId, project_to_pixel};
use crate::compiler::{binding_format, bindings};
use crate::config::PipelineSettings;
use crate::error::{BackendError, RenderError};
use crate::graph::{Component, ComponentKind, Scene, StageItem, StageKind};

use super::camera::{CameraParams, transform_point};
use super::stage::PipelineStage;
use super::textures::{TexturePool, validate_resolution};

fn position_of(component: &Component) -> [f32; 3] {
    let f = |name: &str| component.field(name).unwrap_or(0.0);
    [f("_posX"), f("_posY"), f("_posZ")]
}

fn add(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

/// Item positions, parents before children. Transforms accumulate down the
/// hierarchy; an item without one is placed at its first shape, and an item
/// with neither contributes no point.
fn collect_points(item: &StageItem, parent: [f32; 3], out: &mut Vec<[f32; 3]>) {
    let offset = match &item.transform {
        Some(t) => {
            let p = add(parent, position_of(t));
            out.push(p);
            p
        }
        None => {
            if let Some(shape) = item.shapes().iter().find(|c| c.kind.is_sdf()) {
                out.push(add(parent, position_of(shape)));
            }
            parent
        }
    };
    for child in &item.children {
        collect_points(child, offset, out);
    }
}

pub struct PointCloudPipeline<B: Backend> {
    backend: B,
    settings: PipelineSettings,
    style: PointStyle,
    camera: CameraParams,
    points: Vec<[f32; 3]>,
    visible: usize,
    pool: TexturePool,
    stage: PipelineStage,
    result: Option<TextureId>,
}

impl<B: Backend> PointCloudPipeline<B> {
    pub fn new(backend: B, settings: PipelineSettings) -> Self {
        let style = PointStyle {
            background: settings.background_fallback,
            ..PointStyle::default()
        };
        Self {
            backend,
            settings,
            style,
            camera: CameraParams::default(),
            points: Vec::new(),
            visible: 0,
            pool: TexturePool::new(),
            stage: PipelineStage::None,
            result: None,
        }
    }

    pub fn with_style(mut self, style: PointStyle) -> Self {
        self.style = style;
        self
    }

    pub fn build(&mut self, scene: &Scene) {
        self.stage = PipelineStage::Compiling;
        self.camera = scene
            .first_of_kind(StageKind::PreStage, ComponentKind::Camera3D)
            .map(CameraParams::from_component)
            .unwrap_or_default();
        self.points.clear();
        for item in scene.items(StageKind::ShapeStage) {
            collect_points(item, [0.0; 3], &mut self.points);
        }
        self.stage = PipelineStage::Compiled;
        tracing::info!(points = self.points.len(), "point cloud built");
    }

    #[tracing::instrument(skip(self))]
    pub fn render(&mut self, width: f32, height: f32) -> Result<TextureId, RenderError> {
        let (w, h) = validate_resolution(width, height)?;
        if self.stage < PipelineStage::Compiled {
            return Err(RenderError::NotBuilt);
        }
        let view_projection = self.camera.view_projection(w as f32 / h as f32)?;
        let clip: Vec<ClipPoint> = self
            .points
            .iter()
            .map(|p| transform_point(&view_projection, *p))
            .collect();
        self.visible = clip
            .iter()
            .filter(|p| project_to_pixel(**p, w, h).is_some())
            .count();

        let result = self.pool.ensure(
            &mut self.backend,
            bindings::RESULT,
            w,
            h,
            binding_format(bindings::RESULT),
        )?;
        self.backend.draw_points(result, &clip, &self.style)?;
        self.stage = self.stage.max(PipelineStage::HitAndNormals);
        self.result = Some(result);
        tracing::debug!(
            points = self.points.len(),
            visible = self.visible,
            far = self.settings.far_distance,
            "point cloud rendered"
        );
        Ok(result)
    }

    /// Render only if the result texture does not already have this size.
    pub fn render_if_resolution_changed(
        &mut self,
        width: f32,
        height: f32,
    ) -> Result<bool, RenderError> {
        let (w, h) = validate_resolution(width, height)?;
        if let Some(result) = self.result {
            if self.backend.texture_desc(result).map(|d| (d.width, d.height)) == Some((w, h)) {
                return Ok(false);
            }
        }
        self.render(width, height)?;
        Ok(true)
    }

    /// Read back the last rendered result as `(width, height, texels)`.
    pub fn read_result(&mut self) -> Result<(u32, u32, Vec<[f32; 4]>), RenderError> {
        let result = self.result.ok_or(RenderError::NotBuilt)?;
        let desc = self
            .backend
            .texture_desc(result)
            .ok_or(BackendError::UnknownTexture(result.0))?;
        Ok((desc.width, desc.height, self.backend.read_texture(result)?))
    }

    pub fn points(&self) -> &[[f32; 3]] {
        &self.points
    }

    /// Points that landed inside the viewport on the last render.
    pub fn visible_points(&self) -> usize {
        self.visible
    }

    pub fn camera(&self) -> &CameraParams {
        &self.camera
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn result_texture(&self) -> Option<TextureId> {
        self.result
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::graph::library::{demo_scene_3d, sphere_3d, transform_3d};
    use crate::graph::SceneMode;

    #[test]
    fn transforms_accumulate_and_shapes_fill_in() {
        let item = StageItem::new("parent")
            .with_transform(transform_3d("t", [1.0, 2.0, 0.0]))
            .with_child(
                StageItem::new("child").with_shape(sphere_3d("s", 1.0).with_field("_posZ", 3.0)),
            );
        let mut points = Vec::new();
        collect_points(&item, [0.0; 3], &mut points);
        assert_eq!(points, vec![[1.0, 2.0, 0.0], [1.0, 2.0, 3.0]]);
    }

    #[test]
    fn items_without_transform_or_shape_add_no_point() {
        let item = StageItem::new("group")
            .with_child(StageItem::new("ball").with_shape(sphere_3d("s", 1.0).with_field("_posX", 2.0)));
        let mut points = Vec::new();
        collect_points(&item, [0.0, 1.0, 0.0], &mut points);
        assert_eq!(points, vec![[2.0, 1.0, 0.0]]);
    }

    #[test]
    fn demo_scene_points_are_visible() {
        let mut p = PointCloudPipeline::new(CpuBackend::new(), PipelineSettings::default());
        p.build(&demo_scene_3d());
        assert_eq!(p.points().len(), 2);
        p.render(16.0, 16.0).unwrap();
        assert_eq!(p.visible_points(), 2);
        assert_eq!(p.stage(), PipelineStage::HitAndNormals);
        assert!(!p.render_if_resolution_changed(16.0, 16.0).unwrap());
        assert!(p.render_if_resolution_changed(8.0, 16.0).unwrap());
    }

    #[test]
    fn empty_scene_renders_the_background() {
        let mut p = PointCloudPipeline::new(CpuBackend::new(), PipelineSettings::default());
        p.build(&Scene::new(SceneMode::ThreeD));
        let result = p.render(4.0, 4.0).unwrap();
        let texels = p.backend_mut().read_texture(result).unwrap();
        assert!(texels.iter().all(|t| *t == [0.0, 0.0, 0.0, 1.0]));
        assert_eq!(p.visible_points(), 0);
    }
}
