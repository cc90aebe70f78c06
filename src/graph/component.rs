//! Components: typed graph nodes with fields, a statement body and an optional
//! boolean operand.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::fragment::Fragment;
use crate::kernel::types::ValueType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    #[serde(rename = "sdf2d")]
    Sdf2D,
    #[serde(rename = "sdf3d")]
    Sdf3D,
    #[serde(rename = "transform2d")]
    Transform2D,
    #[serde(rename = "transform3d")]
    Transform3D,
    #[serde(rename = "colorize")]
    Colorize,
    #[serde(rename = "camera2d")]
    Camera2D,
    #[serde(rename = "camera3d")]
    Camera3D,
    #[serde(rename = "skyDome")]
    SkyDome,
    #[serde(rename = "render2d")]
    Render2D,
    #[serde(rename = "render3d")]
    Render3D,
}

const SDF_2D_FIELDS: &[(&str, f32)] = &[
    ("_posX", 0.0),
    ("_posY", 0.0),
    ("_scaleX", 1.0),
    ("_scaleY", 1.0),
    ("_rotate", 0.0),
];

const SDF_3D_FIELDS: &[(&str, f32)] = &[
    ("_posX", 0.0),
    ("_posY", 0.0),
    ("_posZ", 0.0),
    ("_rotateX", 0.0),
    ("_rotateY", 0.0),
    ("_rotateZ", 0.0),
    ("_scale", 1.0),
];

const TRANSFORM_2D_FIELDS: &[(&str, f32)] = &[
    ("_posX", 0.0),
    ("_posY", 0.0),
    ("_rotate", 0.0),
    ("_scale", 1.0),
];

const CAMERA_2D_FIELDS: &[(&str, f32)] = &[("_posX", 0.0), ("_posY", 0.0), ("_zoom", 1.0)];

const CAMERA_3D_FIELDS: &[(&str, f32)] = &[
    ("_posX", 0.0),
    ("_posY", 0.0),
    ("_posZ", -5.0),
    ("_lookAtX", 0.0),
    ("_lookAtY", 0.0),
    ("_lookAtZ", 0.0),
    ("_fov", 60.0),
];

impl ComponentKind {
    pub fn name(self) -> &'static str {
        match self {
            ComponentKind::Sdf2D => "SDF2D",
            ComponentKind::Sdf3D => "SDF3D",
            ComponentKind::Transform2D => "Transform2D",
            ComponentKind::Transform3D => "Transform3D",
            ComponentKind::Colorize => "Colorize",
            ComponentKind::Camera2D => "Camera2D",
            ComponentKind::Camera3D => "Camera3D",
            ComponentKind::SkyDome => "SkyDome",
            ComponentKind::Render2D => "Render2D",
            ComponentKind::Render3D => "Render3D",
        }
    }

    /// Fields every component of this kind carries, with their defaults.
    pub fn default_fields(self) -> &'static [(&'static str, f32)] {
        match self {
            ComponentKind::Sdf2D => SDF_2D_FIELDS,
            ComponentKind::Sdf3D | ComponentKind::Transform3D => SDF_3D_FIELDS,
            ComponentKind::Transform2D => TRANSFORM_2D_FIELDS,
            ComponentKind::Camera2D => CAMERA_2D_FIELDS,
            ComponentKind::Camera3D => CAMERA_3D_FIELDS,
            ComponentKind::Colorize
            | ComponentKind::SkyDome
            | ComponentKind::Render2D
            | ComponentKind::Render3D => &[],
        }
    }

    /// Read-only variables the kernel provides to a body of this kind.
    pub fn inputs(self) -> &'static [(&'static str, ValueType)] {
        use ValueType::*;
        match self {
            ComponentKind::Sdf2D | ComponentKind::Camera2D => &[("position", Vec2)],
            ComponentKind::Sdf3D => &[("position", Vec3)],
            ComponentKind::Colorize | ComponentKind::Camera3D => {
                &[("uv", Vec2), ("size", Vec2)]
            }
            ComponentKind::SkyDome => &[("uv", Vec2), ("size", Vec2), ("dir", Vec3)],
            ComponentKind::Render2D => &[
                ("uv", Vec2),
                ("size", Vec2),
                ("distance", F32),
                ("backColor", Vec4),
                ("matColor", Vec4),
            ],
            ComponentKind::Render3D => &[
                ("uv", Vec2),
                ("size", Vec2),
                ("distance", F32),
                ("hit", F32),
                ("normal", Vec3),
                ("occlusion", F32),
                ("shadow", F32),
                ("backColor", Vec4),
                ("matColor", Vec4),
                ("rayOrigin", Vec3),
                ("rayDirection", Vec3),
            ],
            ComponentKind::Transform2D | ComponentKind::Transform3D => &[],
        }
    }

    /// Variables a body of this kind writes its result to.
    pub fn outputs(self) -> &'static [(&'static str, ValueType)] {
        use ValueType::*;
        match self {
            ComponentKind::Sdf2D | ComponentKind::Sdf3D => &[("outDistance", F32)],
            ComponentKind::Colorize
            | ComponentKind::SkyDome
            | ComponentKind::Render2D
            | ComponentKind::Render3D => &[("outColor", Vec4)],
            ComponentKind::Camera2D => &[("outPosition", Vec2)],
            ComponentKind::Camera3D => &[("outPosition", Vec3), ("outDirection", Vec3)],
            ComponentKind::Transform2D | ComponentKind::Transform3D => &[],
        }
    }

    pub fn is_sdf(self) -> bool {
        matches!(self, ComponentKind::Sdf2D | ComponentKind::Sdf3D)
    }

    pub fn is_transform(self) -> bool {
        matches!(self, ComponentKind::Transform2D | ComponentKind::Transform3D)
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How a component's field combines with the running field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CombineOp {
    #[default]
    Union,
    Intersect,
    Subtract,
}

impl CombineOp {
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            CombineOp::Union => a.min(b),
            CombineOp::Intersect => a.max(b),
            CombineOp::Subtract => a.max(-b),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignOperator {
    #[default]
    #[serde(rename = "=")]
    Set,
    #[serde(rename = "+=")]
    Add,
    #[serde(rename = "-=")]
    Sub,
    #[serde(rename = "*=")]
    Mul,
    #[serde(rename = "/=")]
    Div,
}

/// One line of a component body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "statement", rename_all = "camelCase")]
pub enum Statement {
    /// `var name: type = value`
    #[serde(rename_all = "camelCase")]
    Define {
        name: String,
        type_name: String,
        value: Fragment,
    },
    /// `target op value`; the target is a variable or out-variable reference.
    Assign {
        target: Fragment,
        #[serde(default)]
        op: AssignOperator,
        value: Fragment,
    },
}

impl Statement {
    pub fn define(name: &str, type_name: &str, value: Fragment) -> Self {
        Statement::Define {
            name: name.to_string(),
            type_name: type_name.to_string(),
            value,
        }
    }

    pub fn assign(target: Fragment, value: Fragment) -> Self {
        Statement::Assign {
            target,
            op: AssignOperator::Set,
            value,
        }
    }

    pub fn assign_op(target: Fragment, op: AssignOperator, value: Fragment) -> Self {
        Statement::Assign { target, op, value }
    }

    /// Fragments in evaluation order: the value first, then the target.
    pub fn fragments(&self) -> Vec<&Fragment> {
        match self {
            Statement::Define { value, .. } => vec![value],
            Statement::Assign { target, value, .. } => vec![value, target],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub id: String,
    pub kind: ComponentKind,
    #[serde(default)]
    pub library_name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, f32>,
    #[serde(default)]
    pub body: Vec<Statement>,
    #[serde(default)]
    pub combine: CombineOp,
    #[serde(default)]
    pub sub_component: Option<Box<Component>>,
}

impl Component {
    /// New component with the kind's default fields and an empty body.
    pub fn new(id: &str, kind: ComponentKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            library_name: String::new(),
            fields: kind
                .default_fields()
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            body: Vec::new(),
            combine: CombineOp::Union,
            sub_component: None,
        }
    }

    pub fn named(mut self, library_name: &str) -> Self {
        self.library_name = library_name.to_string();
        self
    }

    pub fn with_field(mut self, name: &str, value: f32) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn with_statement(mut self, statement: Statement) -> Self {
        self.body.push(statement);
        self
    }

    pub fn with_combine(mut self, op: CombineOp) -> Self {
        self.combine = op;
        self
    }

    /// Attach a boolean operand; the operand's own `combine` decides how it
    /// combines with this component.
    pub fn with_sub_component(mut self, sub: Component) -> Self {
        self.sub_component = Some(Box::new(sub));
        self
    }

    pub fn field(&self, name: &str) -> Option<f32> {
        self.fields.get(name).copied()
    }

    pub fn set_field(&mut self, name: &str, value: f32) {
        self.fields.insert(name.to_string(), value);
    }

    /// Fields in the order properties are collected: kind defaults first, then
    /// any extra fields by name.
    pub fn ordered_fields(&self) -> Vec<&str> {
        let defaults = self.kind.default_fields();
        let mut out: Vec<&str> = defaults.iter().map(|(k, _)| *k).collect();
        for k in self.fields.keys() {
            if !defaults.iter().any(|(d, _)| d == k) {
                out.push(k.as_str());
            }
        }
        out
    }

    /// Whether the body declares a variable or the kind provides one under `name`.
    pub fn defines(&self, name: &str) -> bool {
        self.kind.inputs().iter().any(|(n, _)| *n == name)
            || self.kind.outputs().iter().any(|(n, _)| *n == name)
            || self
                .body
                .iter()
                .any(|s| matches!(s, Statement::Define { name: n, .. } if n == name))
    }

    /// This component followed by its chain of sub-components.
    pub fn chain(&self) -> Vec<&Component> {
        let mut out = vec![self];
        let mut cur = self;
        while let Some(sub) = cur.sub_component.as_deref() {
            out.push(sub);
            cur = sub;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_components_carry_kind_defaults() {
        let c = Component::new("c", ComponentKind::Sdf2D);
        for (name, value) in SDF_2D_FIELDS {
            assert_eq!(c.field(name), Some(*value));
        }
        let cam = Component::new("cam", ComponentKind::Camera3D);
        assert_eq!(cam.field("_posZ"), Some(-5.0));
        assert_eq!(cam.field("_fov"), Some(60.0));
    }

    #[test]
    fn ordered_fields_put_defaults_first() {
        let c = Component::new("c", ComponentKind::Sdf2D).with_field("_extra", 2.0);
        let order = c.ordered_fields();
        assert_eq!(&order[..5], &["_posX", "_posY", "_scaleX", "_scaleY", "_rotate"]);
        assert_eq!(order[5], "_extra");
    }

    #[test]
    fn combine_ops_match_sdf_booleans() {
        assert_eq!(CombineOp::Union.apply(1.0, -2.0), -2.0);
        assert_eq!(CombineOp::Intersect.apply(1.0, -2.0), 1.0);
        assert_eq!(CombineOp::Subtract.apply(-1.0, -2.0), 2.0);
    }

    #[test]
    fn chain_walks_sub_components() {
        let c = Component::new("a", ComponentKind::Sdf2D)
            .with_sub_component(Component::new("b", ComponentKind::Sdf2D).with_sub_component(
                Component::new("c", ComponentKind::Sdf2D),
            ));
        let ids: Vec<&str> = c.chain().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn statements_decode_with_operator_symbols() {
        let s: Statement = serde_json::from_str(
            r#"{"statement":"assign","op":"+=",
                "target":{"kind":"outVariable","typeName":"float","name":"outDistance"},
                "value":{"kind":"constantValue","typeName":"float","values":{"value":1.0}}}"#,
        )
        .expect("statement json");
        match s {
            Statement::Assign { op, .. } => assert_eq!(op, AssignOperator::Add),
            other => panic!("unexpected {other:?}"),
        }
    }
}
