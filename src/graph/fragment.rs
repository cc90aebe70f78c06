//! Expression fragments inside a component body.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::kernel::types::type_name_arity;

/// Key of a literal's numeric value in [`Fragment::values`].
pub const VALUE_KEY: &str = "value";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FragmentKind {
    /// Scalar literal (`values["value"]`).
    ConstantValue,
    /// Vector literal owning exactly `arity` scalar literal arguments.
    ConstantDefinition,
    /// Reference to a body variable, an implicit input or a component field.
    VariableReference,
    /// Reference to one of the component kind's output variables.
    OutVariable,
    /// Builtin function or vector constructor applied to `arguments`.
    Primitive,
    /// Binary operator (`name` is `+`, `-`, `*` or `/`) over two arguments.
    Arithmetic,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub kind: FragmentKind,
    pub type_name: String,
    #[serde(default)]
    pub name: String,
    /// Swizzle applied to a reference (`xy`, `z`, ...).
    #[serde(default)]
    pub qualifier: String,
    #[serde(default)]
    pub negated: bool,
    #[serde(default)]
    pub arguments: Vec<Fragment>,
    #[serde(default)]
    pub values: BTreeMap<String, f32>,
}

impl Fragment {
    fn new(kind: FragmentKind, type_name: &str, name: &str) -> Self {
        Self {
            kind,
            type_name: type_name.to_string(),
            name: name.to_string(),
            qualifier: String::new(),
            negated: false,
            arguments: Vec::new(),
            values: BTreeMap::new(),
        }
    }

    pub fn scalar(value: f32) -> Self {
        let mut f = Self::new(FragmentKind::ConstantValue, "float", "float");
        f.values.insert(VALUE_KEY.to_string(), value);
        f
    }

    /// Vector literal of `values.len()` components (2..=4).
    pub fn vector(values: &[f32]) -> Self {
        let type_name = format!("float{}", values.len());
        let mut f = Self::new(FragmentKind::ConstantDefinition, &type_name, &type_name);
        f.arguments = values.iter().map(|v| Fragment::scalar(*v)).collect();
        f
    }

    pub fn variable(name: &str, type_name: &str) -> Self {
        Self::new(FragmentKind::VariableReference, type_name, name)
    }

    /// Reference to a scalar component field such as `_posX`.
    pub fn field(name: &str) -> Self {
        Self::variable(name, "float")
    }

    pub fn out(name: &str, type_name: &str) -> Self {
        Self::new(FragmentKind::OutVariable, type_name, name)
    }

    pub fn call(name: &str, type_name: &str, arguments: Vec<Fragment>) -> Self {
        let mut f = Self::new(FragmentKind::Primitive, type_name, name);
        f.arguments = arguments;
        f
    }

    pub fn arith(op: &str, type_name: &str, a: Fragment, b: Fragment) -> Self {
        let mut f = Self::new(FragmentKind::Arithmetic, type_name, op);
        f.arguments = vec![a, b];
        f
    }

    pub fn with_qualifier(mut self, qualifier: &str) -> Self {
        self.qualifier = qualifier.to_string();
        self
    }

    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// Component count this fragment evaluates to. A qualifier wins over the
    /// declared type; otherwise the type name's trailing digit decides.
    pub fn arity(&self) -> usize {
        if !self.qualifier.is_empty() {
            return self.qualifier.len();
        }
        type_name_arity(&self.type_name).unwrap_or(1)
    }

    /// Arity declared by the type name alone.
    pub fn declared_arity(&self) -> Option<usize> {
        type_name_arity(&self.type_name)
    }

    pub fn value(&self) -> f32 {
        self.values.get(VALUE_KEY).copied().unwrap_or(0.0)
    }

    pub fn set_value(&mut self, value: f32) {
        self.values.insert(VALUE_KEY.to_string(), value);
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            FragmentKind::ConstantValue | FragmentKind::ConstantDefinition
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_follows_qualifier_then_type_suffix() {
        assert_eq!(Fragment::vector(&[1.0, 2.0, 3.0]).arity(), 3);
        assert_eq!(Fragment::scalar(2.0).arity(), 1);
        let swizzled = Fragment::variable("position", "float3").with_qualifier("xy");
        assert_eq!(swizzled.arity(), 2);
        assert_eq!(swizzled.declared_arity(), Some(3));
    }

    #[test]
    fn literal_constructors_fill_values() {
        let v = Fragment::vector(&[0.5, 0.25]);
        assert_eq!(v.kind, FragmentKind::ConstantDefinition);
        assert_eq!(v.type_name, "float2");
        assert_eq!(v.arguments.len(), 2);
        assert_eq!(v.arguments[1].value(), 0.25);
        assert!(v.is_literal());
        assert!(!Fragment::field("_posX").is_literal());
    }

    #[test]
    fn decodes_from_camel_case_json() {
        let f: Fragment = serde_json::from_str(
            r#"{"kind":"variableReference","typeName":"float2","name":"uv","qualifier":"y"}"#,
        )
        .expect("fragment json");
        assert_eq!(f.kind, FragmentKind::VariableReference);
        assert_eq!(f.arity(), 1);
        assert!(f.arguments.is_empty());
    }
}
