//! Compiles signed-distance-field component graphs into compute kernels and
//! runs them as a staged render pipeline.

pub mod backend;
pub mod compiler;
pub mod config;
pub mod error;
pub mod graph;
pub mod kernel;
pub mod pipeline;
pub mod values;

pub use backend::{Backend, CpuBackend};
pub use config::{PipelineSettings, RenderSettings};
pub use error::{BackendError, BuildError, GraphError, RenderError};
pub use pipeline::{Pipeline, PipelineStage, PointCloudPipeline};
