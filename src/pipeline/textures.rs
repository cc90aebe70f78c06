//! Named textures and ping-pong pairs, reallocated on size or format change.

use std::collections::BTreeMap;

use crate::backend::{Backend, TextureDesc, TextureId};
use crate::error::{BackendError, RenderError};
use crate::kernel::types::TextureFormat;

/// Round a requested resolution to whole texels, rejecting empty or
/// non-finite sizes before anything reaches a backend.
pub fn validate_resolution(width: f32, height: f32) -> Result<(u32, u32), RenderError> {
    let invalid = RenderError::InvalidResolution { width, height };
    if !width.is_finite() || !height.is_finite() {
        return Err(invalid);
    }
    let (w, h) = (width.round(), height.round());
    if w < 1.0 || h < 1.0 || w > u32::MAX as f32 || h > u32::MAX as f32 {
        return Err(invalid);
    }
    Ok((w as u32, h as u32))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ActiveSlot {
    #[default]
    First,
    Second,
}

impl ActiveSlot {
    pub fn other(self) -> Self {
        match self {
            ActiveSlot::First => ActiveSlot::Second,
            ActiveSlot::Second => ActiveSlot::First,
        }
    }

    fn index(self) -> usize {
        match self {
            ActiveSlot::First => 0,
            ActiveSlot::Second => 1,
        }
    }
}

/// Two textures of one shape; passes read `current` and write `next`, then swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PingPong {
    slots: [TextureId; 2],
    active: ActiveSlot,
}

impl PingPong {
    pub fn new(first: TextureId, second: TextureId) -> Self {
        Self {
            slots: [first, second],
            active: ActiveSlot::First,
        }
    }

    pub fn current(&self) -> TextureId {
        self.slots[self.active.index()]
    }

    pub fn next(&self) -> TextureId {
        self.slots[self.active.other().index()]
    }

    pub fn active(&self) -> ActiveSlot {
        self.active
    }

    pub fn swap(&mut self) {
        self.active = self.active.other();
    }

    pub fn textures(&self) -> [TextureId; 2] {
        self.slots
    }
}

#[derive(Debug, Default)]
pub struct TexturePool {
    singles: BTreeMap<String, TextureId>,
    pairs: BTreeMap<String, PingPong>,
}

impl TexturePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Texture `name` with exactly this shape; a mismatching allocation is
    /// released and replaced, which invalidates earlier handles.
    pub fn ensure<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        name: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<TextureId, BackendError> {
        let desc = TextureDesc::new(width, height, format);
        desc.validate()?;
        if let Some(id) = self.singles.get(name).copied() {
            if backend.texture_desc(id) == Some(desc) {
                return Ok(id);
            }
            backend.release_texture(id);
            self.singles.remove(name);
        }
        let id = backend.create_texture(desc)?;
        tracing::trace!(texture = name, width, height, ?format, "allocated texture");
        self.singles.insert(name.to_string(), id);
        Ok(id)
    }

    /// Pair `name` with this shape. A reallocated pair starts on its first slot.
    pub fn ensure_pair<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        name: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<PingPong, BackendError> {
        let desc = TextureDesc::new(width, height, format);
        desc.validate()?;
        if let Some(pair) = self.pairs.get(name).copied() {
            if pair
                .textures()
                .iter()
                .all(|t| backend.texture_desc(*t) == Some(desc))
            {
                return Ok(pair);
            }
            for t in pair.textures() {
                backend.release_texture(t);
            }
            self.pairs.remove(name);
        }
        let first = backend.create_texture(desc)?;
        let second = match backend.create_texture(desc) {
            Ok(t) => t,
            Err(e) => {
                backend.release_texture(first);
                return Err(e);
            }
        };
        tracing::trace!(pair = name, width, height, ?format, "allocated ping-pong pair");
        let pair = PingPong::new(first, second);
        self.pairs.insert(name.to_string(), pair);
        Ok(pair)
    }

    pub fn get(&self, name: &str) -> Option<TextureId> {
        self.singles.get(name).copied()
    }

    pub fn pair(&self, name: &str) -> Option<PingPong> {
        self.pairs.get(name).copied()
    }

    /// Swap a pair and return its new state.
    pub fn swap(&mut self, name: &str) -> Option<PingPong> {
        let pair = self.pairs.get_mut(name)?;
        pair.swap();
        Some(*pair)
    }

    /// Put a pair back on its first slot.
    pub fn reset(&mut self, name: &str) {
        if let Some(pair) = self.pairs.get_mut(name) {
            pair.active = ActiveSlot::First;
        }
    }

    pub fn release_all<B: Backend + ?Sized>(&mut self, backend: &mut B) {
        for (_, id) in std::mem::take(&mut self.singles) {
            backend.release_texture(id);
        }
        for (_, pair) in std::mem::take(&mut self.pairs) {
            for t in pair.textures() {
                backend.release_texture(t);
            }
        }
    }

    /// Backend textures held by the pool.
    pub fn texture_count(&self) -> usize {
        self.singles.len() + self.pairs.len() * 2
    }
}
