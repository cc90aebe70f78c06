//! Value extraction and defaulting helpers shared by the stream builder and
//! editor collaborators.
//!
//! These define the canonical mapping between a fragment or field and the
//! `[f32; 4]` record it occupies in a property buffer. Malformed literals are
//! reported as [`GraphError`]s; nothing is silently skipped.

use std::collections::BTreeMap;

use crate::error::GraphError;
use crate::graph::component::{Component, ComponentKind};
use crate::graph::fragment::{Fragment, FragmentKind};
use crate::kernel::types::type_name_arity;

/// Value given to every component of a new default literal.
pub const DEFAULT_LITERAL_VALUE: f32 = 1.0;

/// Editor hints for a literal: slider range and display precision.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LiteralMeta {
    pub min: f32,
    pub max: f32,
    pub precision: u32,
}

impl Default for LiteralMeta {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 1.0,
            precision: 3,
        }
    }
}

fn literal_arity(fragment: &Fragment) -> Result<usize, GraphError> {
    match fragment.kind {
        FragmentKind::ConstantValue => Ok(1),
        FragmentKind::ConstantDefinition => {
            let expected = fragment
                .declared_arity()
                .ok_or_else(|| GraphError::UnknownType(fragment.type_name.clone()))?;
            if fragment.arguments.len() != expected {
                return Err(GraphError::ArityMismatch {
                    name: fragment.name.clone(),
                    expected,
                    found: fragment.arguments.len(),
                });
            }
            if let Some(bad) = fragment
                .arguments
                .iter()
                .find(|a| a.kind != FragmentKind::ConstantValue)
            {
                return Err(GraphError::NotALiteral {
                    name: bad.name.clone(),
                });
            }
            Ok(expected)
        }
        _ => Err(GraphError::NotALiteral {
            name: fragment.name.clone(),
        }),
    }
}

/// Current value of a literal fragment, zero-padded to four components.
pub fn extract_fragment_value(fragment: &Fragment) -> Result<[f32; 4], GraphError> {
    let arity = literal_arity(fragment)?;
    let mut out = [0.0; 4];
    if fragment.kind == FragmentKind::ConstantValue {
        out[0] = fragment.value();
    } else {
        for (slot, arg) in out.iter_mut().zip(&fragment.arguments).take(arity) {
            *slot = arg.value();
        }
    }
    Ok(out)
}

/// Current value of a named component field.
pub fn extract_component_value(component: &Component, field: &str) -> Result<f32, GraphError> {
    component
        .field(field)
        .ok_or_else(|| GraphError::MissingField {
            component: component.id.clone(),
            field: field.to_string(),
        })
}

/// Write `value` into a literal fragment.
///
/// Values wider than the literal are truncated. Narrower values, and vector
/// literals whose argument count disagrees with their type, are rejected
/// without touching the fragment.
pub fn insert_fragment_value(fragment: &mut Fragment, value: &[f32]) -> Result<(), GraphError> {
    let arity = literal_arity(fragment)?;
    if value.len() < arity {
        return Err(GraphError::ValueTooNarrow {
            name: fragment.name.clone(),
            expected: arity,
            found: value.len(),
        });
    }
    if fragment.kind == FragmentKind::ConstantValue {
        fragment.set_value(value[0]);
    } else {
        for (arg, v) in fragment.arguments.iter_mut().zip(value) {
            arg.set_value(*v);
        }
    }
    Ok(())
}

/// Literal for `type_name`: a scalar for `float`, otherwise a vector literal
/// with one scalar argument per component.
pub fn default_constant_for_type(type_name: &str) -> Result<Fragment, GraphError> {
    let arity =
        type_name_arity(type_name).ok_or_else(|| GraphError::UnknownType(type_name.to_string()))?;
    let values = vec![DEFAULT_LITERAL_VALUE; arity];
    let mut fragment = if arity == 1 {
        Fragment::scalar(DEFAULT_LITERAL_VALUE)
    } else {
        Fragment::vector(&values)
    };
    fragment.type_name = type_name.to_string();
    if arity > 1 {
        fragment.name = type_name.to_string();
    }
    Ok(fragment)
}

pub fn default_literal_meta(_type_name: &str) -> LiteralMeta {
    LiteralMeta::default()
}

/// Fields a new component of `kind` starts with.
pub fn default_component_fields(kind: ComponentKind) -> BTreeMap<String, f32> {
    kind.default_fields()
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

/// Check that every field the kind requires is present.
pub fn check_component_fields(component: &Component) -> Result<(), GraphError> {
    for (name, _) in component.kind.default_fields() {
        extract_component_value(component, name)?;
    }
    Ok(())
}
