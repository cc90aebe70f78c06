//! Monitor taps: capture one fragment's value into a side texture.

use serde::{Deserialize, Serialize};

use crate::error::BuildError;
use crate::graph::component::{Component, ComponentKind};
use crate::graph::scene::Scene;
use crate::kernel::ir::Expr;
use crate::kernel::types::ValueType;

/// Fragment name that taps the pass's own output.
pub const OUT_TAP: &str = "out";
/// Write binding of monitor entries.
pub const MONITOR_BINDING: &str = "out_monitor";
/// Internal variable holding the captured value.
pub const MONITOR_VAR: &str = "k_monitor";

/// A requested tap, as handed over by the inspector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorTap {
    /// Component id to match exactly.
    pub component: String,
    /// Variable to capture: a body definition, an input, an output, or `out`.
    pub fragment: String,
    /// Fallback when no component carries the id.
    #[serde(default)]
    pub kind: Option<ComponentKind>,
}

impl MonitorTap {
    pub fn new(component: &str, fragment: &str) -> Self {
        Self {
            component: component.to_string(),
            fragment: fragment.to_string(),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: ComponentKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn is_out(&self) -> bool {
        self.fragment == OUT_TAP
    }
}

/// A tap resolved against a scene.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorTarget {
    pub component: String,
    pub fragment: String,
}

impl MonitorTarget {
    pub fn is_out(&self) -> bool {
        self.fragment == OUT_TAP
    }

    pub fn matches(&self, component: &Component) -> bool {
        self.component == component.id
    }
}

/// Exact id first; otherwise the first component of the tap's kind that
/// defines the fragment. `Ok(None)` when nothing matches.
pub fn resolve(scene: &Scene, tap: &MonitorTap) -> Result<Option<MonitorTarget>, BuildError> {
    let by_id = scene.components_by_id();
    if let Some(component) = by_id.get(tap.component.as_str()) {
        if !tap.is_out() && !component.defines(&tap.fragment) {
            return Err(BuildError::MonitorTargetMissing {
                component: component.id.clone(),
                fragment: tap.fragment.clone(),
            });
        }
        return Ok(Some(MonitorTarget {
            component: component.id.clone(),
            fragment: tap.fragment.clone(),
        }));
    }
    let Some(kind) = tap.kind else {
        return Ok(None);
    };
    Ok(scene
        .components()
        .into_iter()
        .filter(|c| c.kind == kind)
        .find(|c| tap.is_out() || c.defines(&tap.fragment))
        .map(|c| MonitorTarget {
            component: c.id.clone(),
            fragment: tap.fragment.clone(),
        }))
}

/// Widen a value to `vec4f`: scalar `s` -> `(s, s, s, 1)`, vec2 -> `(x, y, 0, 1)`,
/// vec3 -> `(x, y, z, 1)`.
pub fn widen(value: Expr, ty: ValueType) -> Expr {
    match ty {
        ValueType::F32 => Expr::vec(
            ValueType::Vec4,
            vec![value.clone(), value.clone(), value, Expr::Const(1.0)],
        ),
        ValueType::Vec2 => Expr::vec(
            ValueType::Vec4,
            vec![value, Expr::Const(0.0), Expr::Const(1.0)],
        ),
        ValueType::Vec3 => Expr::vec(ValueType::Vec4, vec![value, Expr::Const(1.0)]),
        ValueType::Vec4 => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::library::{circle_2d, demo_scene_2d};
    use crate::graph::scene::{SceneMode, StageItem, StageKind};

    #[test]
    fn exact_id_wins_over_kind() {
        let scene = demo_scene_2d();
        let tap = MonitorTap::new("box", "q").with_kind(ComponentKind::Sdf2D);
        let target = resolve(&scene, &tap).expect("resolve").expect("target");
        assert_eq!(target.component, "box");
    }

    #[test]
    fn kind_fallback_picks_the_first_definer() {
        let scene = demo_scene_2d();
        let tap = MonitorTap::new("gone", "q").with_kind(ComponentKind::Sdf2D);
        let target = resolve(&scene, &tap).expect("resolve").expect("target");
        assert_eq!(target.component, "box");
        assert_eq!(resolve(&scene, &MonitorTap::new("gone", "q")), Ok(None));
    }

    #[test]
    fn unknown_fragment_on_a_known_component_is_an_error() {
        let scene = Scene::new(SceneMode::TwoD).with_item(
            StageKind::ShapeStage,
            StageItem::new("s").with_shape(circle_2d("c", 1.0)),
        );
        assert!(matches!(
            resolve(&scene, &MonitorTap::new("c", "nope")),
            Err(BuildError::MonitorTargetMissing { .. })
        ));
        assert!(resolve(&scene, &MonitorTap::new("c", OUT_TAP)).is_ok());
    }

    #[test]
    fn widening_fills_missing_channels() {
        let w = widen(Expr::var("v"), ValueType::Vec2);
        assert_eq!(
            w,
            Expr::vec(
                ValueType::Vec4,
                vec![Expr::var("v"), Expr::Const(0.0), Expr::Const(1.0)]
            )
        );
        assert_eq!(widen(Expr::var("c"), ValueType::Vec4), Expr::var("c"));
    }
}
