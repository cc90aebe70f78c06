//! Kernel intermediate representation, WGSL emission and validation.

pub mod ir;
pub mod types;
pub mod utility;
pub mod utils;
pub mod validation;
pub mod wgsl;

pub use ir::{Access, Binding, Builtin, EntryPoint, Expr, Function, KernelModule, Stmt};
pub use types::{TextureFormat, ValueType};
pub use wgsl::{EmittedModule, emit_module, emit_wgsl};
