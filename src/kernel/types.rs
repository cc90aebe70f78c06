//! Value and texture types shared by the kernel IR, the emitter and the backends.

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Numeric type of a kernel expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueType {
    F32,
    Vec2,
    Vec3,
    Vec4,
}

impl ValueType {
    /// Returns the WGSL type name for this value type.
    pub fn wgsl(self) -> &'static str {
        match self {
            ValueType::F32 => "f32",
            ValueType::Vec2 => "vec2f",
            ValueType::Vec3 => "vec3f",
            ValueType::Vec4 => "vec4f",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            ValueType::F32 => 1,
            ValueType::Vec2 => 2,
            ValueType::Vec3 => 3,
            ValueType::Vec4 => 4,
        }
    }

    pub fn from_arity(n: usize) -> Option<Self> {
        match n {
            1 => Some(ValueType::F32),
            2 => Some(ValueType::Vec2),
            3 => Some(ValueType::Vec3),
            4 => Some(ValueType::Vec4),
            _ => None,
        }
    }

    /// Graph-side type name (`float`, `float2`, ...).
    pub fn type_name(self) -> &'static str {
        match self {
            ValueType::F32 => "float",
            ValueType::Vec2 => "float2",
            ValueType::Vec3 => "float3",
            ValueType::Vec4 => "float4",
        }
    }

    /// Parse a graph type name. Arity comes from the trailing digit.
    pub fn from_type_name(name: &str) -> Result<Self, GraphError> {
        let arity = type_name_arity(name).ok_or_else(|| GraphError::UnknownType(name.into()))?;
        ValueType::from_arity(arity).ok_or_else(|| GraphError::UnknownType(name.into()))
    }

    pub fn is_scalar(self) -> bool {
        self == ValueType::F32
    }
}

/// Number of components a graph type name declares: `float3` -> 3, `float` -> 1.
pub fn type_name_arity(name: &str) -> Option<usize> {
    let base = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if base != "float" && base != "half" {
        return None;
    }
    match &name[base.len()..] {
        "" => Some(1),
        "2" => Some(2),
        "3" => Some(3),
        "4" => Some(4),
        _ => None,
    }
}

/// Pixel format of a pipeline texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
}

impl TextureFormat {
    /// WGSL storage texel format.
    pub fn wgsl(self) -> &'static str {
        match self {
            TextureFormat::Rgba8Unorm => "rgba8unorm",
            TextureFormat::Rgba16Float => "rgba16float",
            TextureFormat::Rgba32Float => "rgba32float",
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}
