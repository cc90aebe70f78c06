//! Error types shared by the graph model, the kernel compiler, backends and pipelines.
//!
//! Library layers return these typed errors; the binary and file-loading helpers
//! wrap them in `anyhow`.

use thiserror::Error;

/// Structural problems in a component graph.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("component '{component}' is missing field '{field}'")]
    MissingField { component: String, field: String },

    #[error("fragment '{name}' declares {expected} components but has {found} arguments")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("fragment '{name}' is not a numeric literal")]
    NotALiteral { name: String },

    #[error("value has {found} components but fragment '{name}' needs {expected}")]
    ValueTooNarrow {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("unknown type name '{0}'")]
    UnknownType(String),
}

/// Failures while turning components into a kernel module and compiling it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("component '{component}': unknown variable '{name}'")]
    UnknownVariable { component: String, name: String },

    #[error("component '{component}': unknown function '{name}'")]
    UnknownFunction { component: String, name: String },

    #[error("component '{component}': {message}")]
    Type { component: String, message: String },

    #[error("component '{component}' of kind {kind} cannot be used here ({context})")]
    KindMismatch {
        component: String,
        kind: String,
        context: String,
    },

    #[error("property slot {key} was never collected")]
    UnclaimedSlot { key: String },

    #[error("property layout changed at {key}; rebuild required")]
    LayoutChanged { key: String },

    #[error("stream builder: {0}")]
    Stream(String),

    #[error("monitor fragment '{fragment}' not found in component '{component}'")]
    MonitorTargetMissing { component: String, fragment: String },

    #[error("kernel '{label}' failed to compile: {source}")]
    Backend {
        label: String,
        #[source]
        source: BackendError,
    },
}

impl BuildError {
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    pub fn type_error(component: &str, message: impl Into<String>) -> Self {
        Self::Type {
            component: component.to_string(),
            message: message.into(),
        }
    }

    /// Component the error points at, if it names one.
    pub fn component(&self) -> Option<&str> {
        match self {
            BuildError::Graph(GraphError::MissingField { component, .. })
            | BuildError::UnknownVariable { component, .. }
            | BuildError::UnknownFunction { component, .. }
            | BuildError::Type { component, .. }
            | BuildError::KindMismatch { component, .. }
            | BuildError::MonitorTargetMissing { component, .. } => Some(component),
            _ => None,
        }
    }
}

/// Failures reported by a [`crate::backend::Backend`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("compile failed for '{label}': {message}")]
    Compile { label: String, message: String },

    #[error("unknown kernel handle {0}")]
    UnknownKernel(u32),

    #[error("kernel '{kernel}' has no entry point '{entry}'")]
    UnknownEntry { kernel: String, entry: String },

    #[error("unknown texture handle {0}")]
    UnknownTexture(u32),

    #[error("entry '{entry}' needs binding '{binding}'")]
    MissingBinding { entry: String, binding: String },

    #[error("entry '{entry}' reads and writes the same texture through '{binding}'")]
    AliasedBinding { entry: String, binding: String },

    #[error("texture mismatch: {0}")]
    TextureMismatch(String),

    #[error("invalid texture request {width}x{height}")]
    InvalidTexture { width: u32, height: u32 },

    #[error("device error: {0}")]
    Device(String),

    #[error("kernel '{entry}' faulted: {message}")]
    Interpreter { entry: String, message: String },
}

/// Failures of a render request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderError {
    #[error("invalid resolution {width}x{height}")]
    InvalidResolution { width: f32, height: f32 },

    #[error("pipeline has not been built")]
    NotBuilt,

    #[error("degenerate camera: {0}")]
    DegenerateCamera(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_name_the_offender() {
        let err = GraphError::ArityMismatch {
            name: "tint".into(),
            expected: 3,
            found: 2,
        };
        assert!(err.to_string().contains("'tint'"));
        assert!(err.to_string().contains("3 components"));

        let err = BuildError::from(GraphError::MissingField {
            component: "circle".into(),
            field: "_posX".into(),
        });
        assert!(err.to_string().contains("_posX"));
    }

    #[test]
    fn backend_error_is_kept_as_source() {
        let err = BuildError::Backend {
            label: "shape_0".into(),
            source: BackendError::Compile {
                label: "shape_0".into(),
                message: "bad".into(),
            },
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("compile failed for 'shape_0': bad"));
    }
}
