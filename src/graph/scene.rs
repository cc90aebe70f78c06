//! Scene / stage graph handed to pipelines.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::component::{Component, ComponentKind};

/// Name of the component list holding an item's shapes.
pub const SHAPES_LIST: &str = "shapes";
/// List holding the Colorize that paints an item's shapes.
pub const MATERIAL_LIST: &str = "material";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SceneMode {
    #[default]
    #[serde(rename = "2d")]
    TwoD,
    #[serde(rename = "3d")]
    ThreeD,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageKind {
    PreStage,
    ShapeStage,
    RenderStage,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageItem {
    pub name: String,
    /// Position offset applied to this item's components and all descendants.
    #[serde(default)]
    pub transform: Option<Component>,
    /// Named component lists; shapes live under [`SHAPES_LIST`].
    #[serde(default)]
    pub lists: BTreeMap<String, Vec<Component>>,
    #[serde(default)]
    pub children: Vec<StageItem>,
}

impl StageItem {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_transform(mut self, transform: Component) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_shape(self, shape: Component) -> Self {
        self.with_component(SHAPES_LIST, shape)
    }

    pub fn with_material(self, material: Component) -> Self {
        self.with_component(MATERIAL_LIST, material)
    }

    pub fn with_component(mut self, list: &str, component: Component) -> Self {
        self.lists.entry(list.to_string()).or_default().push(component);
        self
    }

    pub fn with_child(mut self, child: StageItem) -> Self {
        self.children.push(child);
        self
    }

    pub fn shapes(&self) -> &[Component] {
        self.lists.get(SHAPES_LIST).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First Colorize of the material list.
    pub fn material(&self) -> Option<&Component> {
        self.lists
            .get(MATERIAL_LIST)?
            .iter()
            .find(|c| c.kind == ComponentKind::Colorize)
    }

    /// Depth-first visit of every component reachable from this item,
    /// sub-components included.
    pub fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Component)) {
        if let Some(t) = &self.transform {
            f(t);
        }
        for list in self.lists.values() {
            for c in list {
                for link in c.chain() {
                    f(link);
                }
            }
        }
        for child in &self.children {
            child.visit(f);
        }
    }

    /// Whether any SDF component exists in this item's subtree.
    pub fn has_shapes(&self) -> bool {
        let mut found = false;
        self.visit(&mut |c| found |= c.kind.is_sdf());
        found
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub kind: StageKind,
    #[serde(default)]
    pub items: Vec<StageItem>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    #[serde(default)]
    pub mode: SceneMode,
    pub stages: Vec<Stage>,
}

impl Scene {
    /// Empty scene with the three fixed stages.
    pub fn new(mode: SceneMode) -> Self {
        Self {
            mode,
            stages: [
                StageKind::PreStage,
                StageKind::ShapeStage,
                StageKind::RenderStage,
            ]
            .into_iter()
            .map(|kind| Stage {
                kind,
                items: Vec::new(),
            })
            .collect(),
        }
    }

    pub fn stage(&self, kind: StageKind) -> Option<&Stage> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    pub fn stage_mut(&mut self, kind: StageKind) -> &mut Stage {
        if let Some(i) = self.stages.iter().position(|s| s.kind == kind) {
            return &mut self.stages[i];
        }
        self.stages.push(Stage {
            kind,
            items: Vec::new(),
        });
        let last = self.stages.len() - 1;
        &mut self.stages[last]
    }

    pub fn with_item(mut self, kind: StageKind, item: StageItem) -> Self {
        self.stage_mut(kind).items.push(item);
        self
    }

    pub fn items(&self, kind: StageKind) -> &[StageItem] {
        self.stage(kind).map(|s| s.items.as_slice()).unwrap_or(&[])
    }

    /// First component of `kind` in a stage, depth-first.
    pub fn first_of_kind(&self, stage: StageKind, kind: ComponentKind) -> Option<&Component> {
        let mut found = None;
        for item in self.items(stage) {
            item.visit(&mut |c| {
                if found.is_none() && c.kind == kind {
                    found = Some(c);
                }
            });
        }
        found
    }

    pub fn find_component(&self, id: &str) -> Option<&Component> {
        let mut found = None;
        for stage in &self.stages {
            for item in &stage.items {
                item.visit(&mut |c| {
                    if found.is_none() && c.id == id {
                        found = Some(c);
                    }
                });
            }
        }
        found
    }

    /// Every component in stage order, depth-first.
    pub fn components(&self) -> Vec<&Component> {
        let mut out = Vec::new();
        for stage in &self.stages {
            for item in &stage.items {
                item.visit(&mut |c| out.push(c));
            }
        }
        out
    }

    /// Every component in the scene keyed by id (first occurrence wins).
    pub fn components_by_id(&self) -> BTreeMap<&str, &Component> {
        let mut out = BTreeMap::new();
        for stage in &self.stages {
            for item in &stage.items {
                item.visit(&mut |c| {
                    out.entry(c.id.as_str()).or_insert(c);
                });
            }
        }
        out
    }
}
