//! Reference backend: interprets kernel IR on the CPU.
//!
//! Used by tests and headless rendering. Texel stores are quantized to the
//! texture format, so results match what a GPU storage texture would hold.

use std::collections::BTreeMap;

use half::f16;

use super::interp::{Pixel, run_entry};
use super::{
    Backend, ClipPoint, KernelId, PointStyle, TextureDesc, TextureId, project_to_pixel,
    resolve_entry_bindings,
};
use crate::compiler::property::Record;
use crate::error::BackendError;
use crate::kernel::ir::KernelModule;
use crate::kernel::types::TextureFormat;
use crate::kernel::validation::validate_module;

struct CpuTexture {
    desc: TextureDesc,
    texels: Vec<[f32; 4]>,
}

impl CpuTexture {
    fn texel(&self, x: u32, y: u32) -> [f32; 4] {
        if x >= self.desc.width || y >= self.desc.height {
            return [0.0; 4];
        }
        self.texels[(y * self.desc.width + x) as usize]
    }
}

pub struct CpuBackend {
    kernels: BTreeMap<KernelId, KernelModule>,
    textures: BTreeMap<TextureId, CpuTexture>,
    next_id: u32,
    validate_wgsl: bool,
    dispatches: usize,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    /// Backend that also validates the emitted WGSL of every compiled module.
    pub fn new() -> Self {
        Self {
            kernels: BTreeMap::new(),
            textures: BTreeMap::new(),
            next_id: 1,
            validate_wgsl: true,
            dispatches: 0,
        }
    }

    /// Skip naga validation; IR verification still runs.
    pub fn without_validation(mut self) -> Self {
        self.validate_wgsl = false;
        self
    }

    /// Dispatches run since creation.
    pub fn dispatch_count(&self) -> usize {
        self.dispatches
    }

    pub fn kernel_count(&self) -> usize {
        self.kernels.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn texture(&self, id: TextureId) -> Result<&CpuTexture, BackendError> {
        self.textures
            .get(&id)
            .ok_or(BackendError::UnknownTexture(id.0))
    }

    fn texture_mut(&mut self, id: TextureId) -> Result<&mut CpuTexture, BackendError> {
        self.textures
            .get_mut(&id)
            .ok_or(BackendError::UnknownTexture(id.0))
    }
}

/// Round a texel to what `format` can store.
pub fn quantize(format: TextureFormat, texel: [f32; 4]) -> [f32; 4] {
    match format {
        TextureFormat::Rgba32Float => texel,
        TextureFormat::Rgba16Float => texel.map(|v| f16::from_f32(v).to_f32()),
        TextureFormat::Rgba8Unorm => texel.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() / 255.0),
    }
}

pub(super) fn check_format(
    module: &KernelModule,
    binding: &str,
    desc: TextureDesc,
) -> Result<(), BackendError> {
    match module.binding(binding) {
        Some(b) if b.format == desc.format => Ok(()),
        Some(b) => Err(BackendError::TextureMismatch(format!(
            "binding '{binding}' of '{}' is {:?} but the texture is {:?}",
            module.label, b.format, desc.format
        ))),
        None => Err(BackendError::TextureMismatch(format!(
            "'{}' declares no binding '{binding}'",
            module.label
        ))),
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn compile(&mut self, module: &KernelModule) -> Result<KernelId, BackendError> {
        module.verify().map_err(|message| BackendError::Compile {
            label: module.label.clone(),
            message,
        })?;
        if self.validate_wgsl {
            validate_module(module).map_err(|e| BackendError::Compile {
                label: module.label.clone(),
                message: format!("{e:#}"),
            })?;
        }
        let id = KernelId(self.next());
        self.kernels.insert(id, module.clone());
        Ok(id)
    }

    fn release_kernel(&mut self, kernel: KernelId) {
        self.kernels.remove(&kernel);
    }

    fn create_texture(&mut self, desc: TextureDesc) -> Result<TextureId, BackendError> {
        desc.validate()?;
        let id = TextureId(self.next());
        self.textures.insert(
            id,
            CpuTexture {
                desc,
                texels: vec![[0.0; 4]; desc.texel_count()],
            },
        );
        Ok(id)
    }

    fn release_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn texture_desc(&self, texture: TextureId) -> Option<TextureDesc> {
        self.textures.get(&texture).map(|t| t.desc)
    }

    fn dispatch(
        &mut self,
        kernel: KernelId,
        entry: &str,
        data: &[Record],
        bindings: &[(&str, TextureId)],
    ) -> Result<(), BackendError> {
        let module = self
            .kernels
            .get(&kernel)
            .ok_or(BackendError::UnknownKernel(kernel.0))?;
        let resolved = resolve_entry_bindings(module, entry, bindings)?;
        let entry_point = module
            .entry(entry)
            .ok_or_else(|| BackendError::UnknownEntry {
                kernel: module.label.clone(),
                entry: entry.to_string(),
            })?;

        let mut reads = Vec::with_capacity(resolved.reads.len());
        for (name, id) in &resolved.reads {
            let tex = self.texture(*id)?;
            check_format(module, name, tex.desc)?;
            reads.push((name.as_str(), tex));
        }
        let mut outputs = Vec::with_capacity(resolved.writes.len());
        for (name, id) in &resolved.writes {
            let tex = self.texture(*id)?;
            check_format(module, name, tex.desc)?;
            outputs.push((name.as_str(), *id, tex.desc, tex.texels.clone()));
        }
        let Some(&(_, _, size, _)) = outputs.first() else {
            return Err(BackendError::UnknownEntry {
                kernel: module.label.clone(),
                entry: entry.to_string(),
            });
        };
        if let Some((name, ..)) = outputs
            .iter()
            .find(|(_, _, d, _)| (d.width, d.height) != (size.width, size.height))
        {
            return Err(BackendError::TextureMismatch(format!(
                "output '{name}' of '{entry}' differs in size from the first output"
            )));
        }

        let mut texels: Vec<(&str, [f32; 4])> = reads.iter().map(|(n, _)| (*n, [0.0; 4])).collect();
        for y in 0..size.height {
            for x in 0..size.width {
                for ((_, tex), slot) in reads.iter().zip(texels.iter_mut()) {
                    slot.1 = tex.texel(x, y);
                }
                let pixel = Pixel {
                    coord: [x as f32, y as f32],
                    size: [size.width as f32, size.height as f32],
                    texels: &texels,
                };
                let stores = run_entry(module, entry_point, data, &pixel).map_err(|message| {
                    BackendError::Interpreter {
                        entry: format!("{}::{entry}", module.label),
                        message: format!("at ({x}, {y}): {message}"),
                    }
                })?;
                let index = (y * size.width + x) as usize;
                for (binding, value) in stores {
                    if let Some(out) = outputs.iter_mut().find(|o| o.0 == binding) {
                        out.3[index] = quantize(out.2.format, value);
                    }
                }
            }
        }

        let finished: Vec<(TextureId, Vec<[f32; 4]>)> =
            outputs.into_iter().map(|(_, id, _, t)| (id, t)).collect();
        for (id, data) in finished {
            self.texture_mut(id)?.texels = data;
        }
        self.dispatches += 1;
        Ok(())
    }

    fn clear(&mut self, texture: TextureId, value: [f32; 4]) -> Result<(), BackendError> {
        let tex = self.texture_mut(texture)?;
        let value = quantize(tex.desc.format, value);
        tex.texels.fill(value);
        Ok(())
    }

    fn copy(&mut self, src: TextureId, dst: TextureId) -> Result<(), BackendError> {
        let (desc, texels) = {
            let s = self.texture(src)?;
            (s.desc, s.texels.clone())
        };
        let d = self.texture_mut(dst)?;
        if d.desc != desc {
            return Err(BackendError::TextureMismatch(format!(
                "copy from {desc:?} into {:?}",
                d.desc
            )));
        }
        d.texels = texels;
        Ok(())
    }

    fn draw_points(
        &mut self,
        target: TextureId,
        points: &[ClipPoint],
        style: &PointStyle,
    ) -> Result<(), BackendError> {
        let tex = self.texture_mut(target)?;
        let (w, h, format) = (tex.desc.width, tex.desc.height, tex.desc.format);
        tex.texels.fill(quantize(format, style.background));
        let color = quantize(format, style.color);
        for p in points {
            if let Some((x, y)) = project_to_pixel(*p, w, h) {
                tex.texels[(y * w + x) as usize] = color;
            }
        }
        self.dispatches += 1;
        Ok(())
    }

    fn read_texture(&mut self, texture: TextureId) -> Result<Vec<[f32; 4]>, BackendError> {
        Ok(self.texture(texture)?.texels.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ir::{Access, COORD, EntryPoint, Expr, Stmt};
    use crate::kernel::types::ValueType;

    fn gradient_module() -> KernelModule {
        let mut m = KernelModule::new("gradient");
        m.bind("src", TextureFormat::Rgba32Float, Access::Read);
        m.bind("out", TextureFormat::Rgba16Float, Access::Write);
        m.entries.push(EntryPoint {
            name: "main".into(),
            reads: vec!["src".into()],
            writes: vec!["out".into()],
            body: vec![Stmt::store(
                "out",
                Expr::vec(
                    ValueType::Vec4,
                    vec![
                        Expr::var(COORD),
                        Expr::load("src").swizzle("x"),
                        Expr::Property {
                            slot: 0,
                            ty: ValueType::F32,
                        },
                    ],
                ),
            )],
        });
        m
    }

    #[test]
    fn dispatch_runs_every_pixel_of_the_output() {
        let mut b = CpuBackend::new();
        let k = b.compile(&gradient_module()).unwrap();
        let src = b
            .create_texture(TextureDesc::new(1, 1, TextureFormat::Rgba32Float))
            .unwrap();
        let out = b
            .create_texture(TextureDesc::new(3, 2, TextureFormat::Rgba16Float))
            .unwrap();
        b.clear(src, [0.5, 0.0, 0.0, 0.0]).unwrap();
        b.dispatch(k, "main", &[[7.0, 0.0, 0.0, 0.0]], &[("src", src), ("out", out)])
            .unwrap();
        let texels = b.read_texture(out).unwrap();
        assert_eq!(texels.len(), 6);
        assert_eq!(texels[0], [0.0, 0.0, 0.5, 7.0]);
        // Reads outside a smaller input come back as zero.
        assert_eq!(texels[5], [2.0, 1.0, 0.0, 7.0]);
        assert_eq!(b.dispatch_count(), 1);
    }

    #[test]
    fn dispatch_checks_formats() {
        let mut b = CpuBackend::new();
        let k = b.compile(&gradient_module()).unwrap();
        let src = b
            .create_texture(TextureDesc::new(2, 2, TextureFormat::Rgba32Float))
            .unwrap();
        let wrong = b
            .create_texture(TextureDesc::new(2, 2, TextureFormat::Rgba32Float))
            .unwrap();
        let err = b
            .dispatch(k, "main", &[], &[("src", src), ("out", wrong)])
            .unwrap_err();
        assert!(matches!(err, BackendError::TextureMismatch(_)));
    }

    #[test]
    fn compile_rejects_broken_modules() {
        let mut m = gradient_module();
        m.entries[0].body = vec![Stmt::store("out", Expr::var("nowhere"))];
        let err = CpuBackend::new().compile(&m).unwrap_err();
        assert!(matches!(err, BackendError::Compile { .. }));
    }

    #[test]
    fn stores_are_quantized_to_the_format() {
        assert_eq!(quantize(TextureFormat::Rgba8Unorm, [2.0, -1.0, 0.5, 1.0])[..2], [1.0, 0.0]);
        let h = quantize(TextureFormat::Rgba16Float, [0.1, 0.0, 0.0, 0.0])[0];
        assert!((h - 0.1).abs() < 1e-3 && h != 0.1);
    }

    #[test]
    fn copy_and_points_respect_texture_shape() {
        let mut b = CpuBackend::new();
        let a = b
            .create_texture(TextureDesc::new(4, 4, TextureFormat::Rgba8Unorm))
            .unwrap();
        let c = b
            .create_texture(TextureDesc::new(2, 2, TextureFormat::Rgba8Unorm))
            .unwrap();
        assert!(b.copy(a, c).is_err());

        let style = PointStyle::default();
        b.draw_points(a, &[[0.0, 0.0, 0.5, 1.0], [0.0, 0.0, 0.5, -1.0]], &style)
            .unwrap();
        let texels = b.read_texture(a).unwrap();
        let lit = texels.iter().filter(|t| **t == style.color).count();
        assert_eq!(lit, 1);
        assert_eq!(texels[2 * 4 + 2], style.color);

        b.release_texture(a);
        assert!(b.read_texture(a).is_err());
        assert!(b.create_texture(TextureDesc::new(0, 1, TextureFormat::Rgba8Unorm)).is_err());
    }
}
