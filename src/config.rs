//! Pipeline and per-render settings.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pipeline::stage::PipelineStage;

/// Far-distance sentinel written to depth textures where nothing was hit.
pub const FAR_DISTANCE: f32 = 10000.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    /// Highest stage a render may reach.
    pub max_stage: PipelineStage,
    /// Direction towards the light, used by the shadow pass.
    pub light_direction: [f32; 3],
    /// Blend factor of the reflection composite.
    pub reflectivity: f32,
    /// Clear color used when the scene has no background component.
    pub background_fallback: [f32; 4],
    /// Sphere-trace step budget of the 3D hit pass.
    pub max_steps: u32,
    pub far_distance: f32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_stage: PipelineStage::Reflection,
            light_direction: [0.5, 0.8, -0.6],
            reflectivity: 0.25,
            background_fallback: [0.0, 0.0, 0.0, 1.0],
            max_steps: 128,
            far_distance: FAR_DISTANCE,
        }
    }
}

impl PipelineSettings {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to parse pipeline settings")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Normalized light direction; falls back to straight up for a zero vector.
    pub fn light(&self) -> [f32; 3] {
        let [x, y, z] = self.light_direction;
        let len = (x * x + y * y + z * z).sqrt();
        if len <= f32::EPSILON || !len.is_finite() {
            [0.0, 1.0, 0.0]
        } else {
            [x / len, y / len, z / len]
        }
    }
}

/// Values written into record 0 of every property buffer before a dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderSettings {
    /// Seconds, exposed to bodies as `time`.
    pub time: f32,
    pub seed: f32,
}

impl RenderSettings {
    pub fn globals(&self) -> [f32; 4] {
        [self.time, self.seed, 0.0, 0.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let s = PipelineSettings::from_json_str(r#"{"maxStage":"ao","reflectivity":0.5}"#)
            .expect("settings");
        assert_eq!(s.max_stage, PipelineStage::Ao);
        assert_eq!(s.reflectivity, 0.5);
        assert_eq!(s.max_steps, 128);
        assert_eq!(s.far_distance, FAR_DISTANCE);
    }

    #[test]
    fn unknown_stage_is_an_error() {
        let err = PipelineSettings::from_json_str(r#"{"maxStage":"bloom"}"#).unwrap_err();
        assert!(format!("{err:#}").contains("pipeline settings"));
    }

    #[test]
    fn load_names_the_missing_file() {
        let err = PipelineSettings::load("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("not/here.json"));
    }

    #[test]
    fn light_is_normalized() {
        let s = PipelineSettings {
            light_direction: [0.0, 2.0, 0.0],
            ..PipelineSettings::default()
        };
        assert_eq!(s.light(), [0.0, 1.0, 0.0]);
    }
}
