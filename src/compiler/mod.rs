//! Component graph to kernel compiler.
//!
//! [`property`] assigns buffer slots, [`lower`] turns component bodies into IR
//! blocks, [`stream`] folds SDF components into shape kernels and
//! [`component_kernel`] wraps single components (background, camera, render).
//! Each compiled kernel is an [`Instance`].

pub mod combine;
pub mod component_kernel;
pub mod instance;
pub mod lower;
pub mod monitor;
pub mod property;
pub mod stream;

pub use combine::CombineTree;
pub use instance::{Instance, InstanceParts, InstanceRole, MonitorEntry};
pub use monitor::{MonitorTap, MonitorTarget, OUT_TAP};
pub use property::{PropertyTable, SlotKey};
pub use stream::{StreamBuilder, StreamKind, StreamOptions, TraceSettings};

use crate::kernel::types::TextureFormat;

/// Logical texture names shared by generated kernels and the pipeline.
///
/// Kernels read a texture under its name and write the next version of it
/// under `out_<name>`.
pub mod bindings {
    pub const BACKGROUND: &str = "background";
    pub const DEPTH: &str = "depth";
    pub const NORMAL: &str = "normal";
    pub const META: &str = "meta";
    pub const MATERIAL: &str = "material";
    pub const RAY_ORIGIN: &str = "ray_origin";
    pub const RAY_DIRECTION: &str = "ray_direction";
    pub const RESULT: &str = "result";
    pub const MONITOR: &str = "monitor";
    pub const REFLECTION: &str = "reflection";
    pub const COMPOSITE: &str = "composite";

    pub fn out(name: &str) -> String {
        format!("out_{name}")
    }
}

/// Pixel format of a logical texture, with or without the `out_` prefix.
pub fn binding_format(name: &str) -> TextureFormat {
    use bindings::*;
    match name.strip_prefix("out_").unwrap_or(name) {
        DEPTH | NORMAL | RAY_ORIGIN | RAY_DIRECTION | MONITOR => TextureFormat::Rgba32Float,
        _ => TextureFormat::Rgba16Float,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_bindings_share_the_format_of_their_texture() {
        for name in [bindings::DEPTH, bindings::META, bindings::RESULT] {
            assert_eq!(binding_format(name), binding_format(&bindings::out(name)));
        }
        assert_eq!(binding_format(bindings::DEPTH), TextureFormat::Rgba32Float);
        assert_eq!(binding_format(bindings::RESULT), TextureFormat::Rgba16Float);
    }
}
