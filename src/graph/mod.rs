//! In-memory component graph handed over by the editor: fragments, components,
//! and the staged scene, plus a small default library.

pub mod component;
pub mod fragment;
pub mod library;
pub mod scene;

pub use component::{AssignOperator, CombineOp, Component, ComponentKind, Statement};
pub use fragment::{Fragment, FragmentKind};
pub use scene::{MATERIAL_LIST, SHAPES_LIST, Scene, SceneMode, Stage, StageItem, StageKind};
