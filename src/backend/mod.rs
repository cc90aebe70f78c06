//! Execution backends.
//!
//! A backend compiles [`KernelModule`]s, owns textures and runs entry points
//! over them. Pipelines own their backend and pass it explicitly; nothing here
//! reaches for a process-wide device.

pub mod cpu;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod interp;

use crate::compiler::property::Record;
use crate::error::BackendError;
use crate::kernel::ir::KernelModule;
use crate::kernel::types::TextureFormat;

pub use cpu::CpuBackend;
#[cfg(feature = "gpu")]
pub use gpu::GpuBackend;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl TextureDesc {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn validate(&self) -> Result<(), BackendError> {
        if self.width == 0 || self.height == 0 {
            return Err(BackendError::InvalidTexture {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

/// Clip-space point `(x, y, z, w)`.
pub type ClipPoint = [f32; 4];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointStyle {
    pub color: [f32; 4],
    pub background: [f32; 4],
}

impl Default for PointStyle {
    fn default() -> Self {
        Self {
            color: [1.0, 1.0, 1.0, 1.0],
            background: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

pub trait Backend {
    fn name(&self) -> &'static str;

    fn compile(&mut self, module: &KernelModule) -> Result<KernelId, BackendError>;

    fn release_kernel(&mut self, kernel: KernelId);

    fn create_texture(&mut self, desc: TextureDesc) -> Result<TextureId, BackendError>;

    fn release_texture(&mut self, texture: TextureId);

    fn texture_desc(&self, texture: TextureId) -> Option<TextureDesc>;

    /// Run `entry` once per texel of its first write binding. `bindings` maps
    /// every binding the entry reads or writes to a texture.
    fn dispatch(
        &mut self,
        kernel: KernelId,
        entry: &str,
        data: &[Record],
        bindings: &[(&str, TextureId)],
    ) -> Result<(), BackendError>;

    fn clear(&mut self, texture: TextureId, value: [f32; 4]) -> Result<(), BackendError>;

    /// Copy between textures of identical size and format.
    fn copy(&mut self, src: TextureId, dst: TextureId) -> Result<(), BackendError>;

    /// Clear `target` to the background and rasterize one texel per visible point.
    fn draw_points(
        &mut self,
        target: TextureId,
        points: &[ClipPoint],
        style: &PointStyle,
    ) -> Result<(), BackendError>;

    /// Texels in row-major order, waiting for outstanding work first.
    fn read_texture(&mut self, texture: TextureId) -> Result<Vec<[f32; 4]>, BackendError>;
}

/// Bindings of one entry point resolved to textures.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct EntryBindings {
    pub reads: Vec<(String, TextureId)>,
    pub writes: Vec<(String, TextureId)>,
}

/// Look up every binding `entry` touches, rejecting missing ones and textures
/// that are both read and written.
pub(crate) fn resolve_entry_bindings(
    module: &KernelModule,
    entry: &str,
    bindings: &[(&str, TextureId)],
) -> Result<EntryBindings, BackendError> {
    let e = module
        .entry(entry)
        .ok_or_else(|| BackendError::UnknownEntry {
            kernel: module.label.clone(),
            entry: entry.to_string(),
        })?;
    let find = |name: &str| -> Result<TextureId, BackendError> {
        bindings
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| *t)
            .ok_or_else(|| BackendError::MissingBinding {
                entry: entry.to_string(),
                binding: name.to_string(),
            })
    };
    let reads = e
        .reads
        .iter()
        .map(|n| find(n.as_str()).map(|t| (n.clone(), t)))
        .collect::<Result<Vec<_>, _>>()?;
    let writes = e
        .writes
        .iter()
        .map(|n| find(n.as_str()).map(|t| (n.clone(), t)))
        .collect::<Result<Vec<_>, _>>()?;
    for (name, w) in &writes {
        if reads.iter().any(|(_, r)| r == w) || writes.iter().filter(|(_, o)| o == w).count() > 1 {
            return Err(BackendError::AliasedBinding {
                entry: entry.to_string(),
                binding: name.clone(),
            });
        }
    }
    Ok(EntryBindings { reads, writes })
}

/// Pixel a clip-space point lands on, if it is in front of the camera and
/// inside the viewport.
pub fn project_to_pixel(point: ClipPoint, width: u32, height: u32) -> Option<(u32, u32)> {
    let [x, y, z, w] = point;
    if w <= 0.0 || !w.is_finite() {
        return None;
    }
    let (nx, ny, nz) = (x / w, y / w, z / w);
    if !(-1.0..=1.0).contains(&nx) || !(-1.0..=1.0).contains(&ny) || !(0.0..=1.0).contains(&nz) {
        return None;
    }
    let px = ((nx * 0.5 + 0.5) * width as f32).floor();
    let py = ((0.5 - ny * 0.5) * height as f32).floor();
    let px = (px as u32).min(width.saturating_sub(1));
    let py = (py as u32).min(height.saturating_sub(1));
    Some((px, py))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ir::{Access, EntryPoint, Expr, Stmt};

    fn module() -> KernelModule {
        let mut m = KernelModule::new("m");
        m.bind("src", TextureFormat::Rgba32Float, Access::Read);
        m.bind("out", TextureFormat::Rgba32Float, Access::Write);
        m.entries.push(EntryPoint {
            name: "main".into(),
            reads: vec!["src".into()],
            writes: vec!["out".into()],
            body: vec![Stmt::store("out", Expr::load("src"))],
        });
        m
    }

    #[test]
    fn bindings_must_be_complete_and_distinct() {
        let m = module();
        let ok = resolve_entry_bindings(&m, "main", &[("src", TextureId(1)), ("out", TextureId(2))]);
        assert!(ok.is_ok());
        assert!(matches!(
            resolve_entry_bindings(&m, "main", &[("src", TextureId(1))]),
            Err(BackendError::MissingBinding { .. })
        ));
        assert!(matches!(
            resolve_entry_bindings(&m, "main", &[("src", TextureId(1)), ("out", TextureId(1))]),
            Err(BackendError::AliasedBinding { .. })
        ));
        assert!(matches!(
            resolve_entry_bindings(&m, "other", &[]),
            Err(BackendError::UnknownEntry { .. })
        ));
    }

    #[test]
    fn projection_flips_y_and_culls_behind_the_camera() {
        assert_eq!(project_to_pixel([0.0, 0.0, 0.5, 1.0], 10, 10), Some((5, 5)));
        assert_eq!(project_to_pixel([-1.0, 1.0, 0.5, 1.0], 10, 10), Some((0, 0)));
        assert_eq!(project_to_pixel([0.0, 0.0, 0.5, -1.0], 10, 10), None);
        assert_eq!(project_to_pixel([2.0, 0.0, 0.5, 1.0], 10, 10), None);
    }

    #[test]
    fn zero_sized_textures_are_rejected() {
        assert!(TextureDesc::new(0, 4, TextureFormat::Rgba8Unorm).validate().is_err());
        assert!(TextureDesc::new(4, 4, TextureFormat::Rgba8Unorm).validate().is_ok());
    }
}
