//! Compiled pass: kernel module, emitted source, property buffer and handle.

use std::ops::Range;

use crate::backend::{Backend, KernelId, TextureId};
use crate::config::RenderSettings;
use crate::error::{BackendError, BuildError};
use crate::graph::component::{Component, Statement};
use crate::graph::fragment::Fragment;
use crate::graph::scene::Scene;
use crate::kernel::ir::KernelModule;
use crate::kernel::wgsl::{EmittedModule, emit_module};

use super::lower::block_label;
use super::property::{PropertyTable, dry_run};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceRole {
    Background,
    Camera,
    Shape,
    Render,
}

/// Monitor variant of an Instance's entry point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorEntry {
    pub entry: String,
    pub component: String,
    /// Active channels of the monitor texture.
    pub channels: usize,
}

/// Everything an Instance is made of before compilation.
#[derive(Clone, Debug)]
pub struct InstanceParts {
    pub name: String,
    pub role: InstanceRole,
    pub module: KernelModule,
    pub properties: PropertyTable,
    pub components: Vec<Component>,
    pub monitor: Option<MonitorEntry>,
}

#[derive(Clone, Debug)]
pub struct Instance {
    name: String,
    role: InstanceRole,
    module: KernelModule,
    source: EmittedModule,
    properties: PropertyTable,
    components: Vec<Component>,
    kernel: KernelId,
    monitor: Option<MonitorEntry>,
}

impl Instance {
    /// Emit the source once and hand the module to the backend.
    pub fn compile<B: Backend + ?Sized>(
        parts: InstanceParts,
        backend: &mut B,
    ) -> Result<Self, BuildError> {
        let source = emit_module(&parts.module);
        let kernel = backend
            .compile(&parts.module)
            .map_err(|source| BuildError::Backend {
                label: parts.name.clone(),
                source,
            })?;
        tracing::debug!(
            instance = %parts.name,
            records = parts.properties.len(),
            lines = source.text.lines().count(),
            "compiled instance"
        );
        Ok(Self {
            name: parts.name,
            role: parts.role,
            module: parts.module,
            source,
            properties: parts.properties,
            components: parts.components,
            kernel,
            monitor: parts.monitor,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> InstanceRole {
        self.role
    }

    pub fn module(&self) -> &KernelModule {
        &self.module
    }

    /// Emitted WGSL.
    pub fn source(&self) -> &str {
        &self.source.text
    }

    pub fn emitted(&self) -> &EmittedModule {
        &self.source
    }

    pub fn properties(&self) -> &PropertyTable {
        &self.properties
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn kernel(&self) -> KernelId {
        self.kernel
    }

    pub fn monitor(&self) -> Option<&MonitorEntry> {
        self.monitor.as_ref()
    }

    pub fn has_entry(&self, entry: &str) -> bool {
        self.module.has_entry(entry)
    }

    pub fn owns(&self, component_id: &str) -> bool {
        self.components.iter().any(|c| c.id == component_id)
    }

    /// Source lines (1-based, end exclusive) of a component's block.
    pub fn debug_range(&self, component_id: &str) -> Option<Range<usize>> {
        let label = self
            .components
            .iter()
            .find(|c| c.id == component_id)
            .map(block_label)?;
        self.source.span_of(&label)
    }

    pub fn set_globals(&mut self, settings: &RenderSettings) {
        self.properties.set_globals(settings.globals());
    }

    /// Rewrite property values from an edited scene without recompiling.
    ///
    /// Fails with [`BuildError::LayoutChanged`] if any owned component is gone
    /// or changed shape (statements, references, fields or literal layout);
    /// the caller should rebuild then.
    pub fn refresh_values(&mut self, scene: &Scene) -> Result<usize, BuildError> {
        let mut staged = Vec::new();
        for (index, old) in self.components.iter().enumerate() {
            let new = scene
                .find_component(&old.id)
                .ok_or_else(|| BuildError::LayoutChanged {
                    key: old.id.clone(),
                })?;
            if skeleton(old) != skeleton(new) {
                return Err(BuildError::LayoutChanged {
                    key: old.id.clone(),
                });
            }
            // Chain links are owned right after their parent, in chain order.
            for (offset, link) in new.chain().into_iter().enumerate().skip(1) {
                let owned = self.components.get(index + offset);
                if owned.map(|c| c.id.as_str()) != Some(link.id.as_str()) {
                    return Err(BuildError::LayoutChanged {
                        key: link.id.clone(),
                    });
                }
            }
            let entries = dry_run(new)?;
            if entries.len() != self.properties.keys_of(&old.id).count() {
                return Err(BuildError::LayoutChanged {
                    key: old.id.clone(),
                });
            }
            staged.push((new.clone(), entries));
        }

        let mut written = 0;
        let mut components = Vec::with_capacity(staged.len());
        for (component, entries) in staged {
            for (key, value) in entries {
                self.properties.update(&key, value)?;
                written += 1;
            }
            components.push(component);
        }
        self.components = components;
        Ok(written)
    }

    pub fn dispatch<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        entry: &str,
        bindings: &[(&str, TextureId)],
    ) -> Result<(), BackendError> {
        backend.dispatch(self.kernel, entry, self.properties.records(), bindings)
    }
}

/// Copy of a component with every numeric value zeroed. Two components with
/// equal skeletons produce the same kernel and property layout.
fn skeleton(component: &Component) -> Component {
    let mut c = component.clone();
    for v in c.fields.values_mut() {
        *v = 0.0;
    }
    for statement in &mut c.body {
        match statement {
            Statement::Define { value, .. } => zero_literals(value),
            Statement::Assign { target, value, .. } => {
                zero_literals(target);
                zero_literals(value);
            }
        }
    }
    c.library_name.clear();
    c.sub_component = None;
    c
}

fn zero_literals(fragment: &mut Fragment) {
    for v in fragment.values.values_mut() {
        *v = 0.0;
    }
    for arg in &mut fragment.arguments {
        zero_literals(arg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::component::CombineOp;
    use crate::graph::library::circle_2d;

    #[test]
    fn skeleton_ignores_values_but_not_structure() {
        let a = circle_2d("c", 1.0).with_field("_posX", 3.0);
        let b = circle_2d("c", 7.0);
        assert_eq!(skeleton(&a), skeleton(&b));

        let c = circle_2d("c", 1.0).with_combine(CombineOp::Subtract);
        assert_ne!(skeleton(&a), skeleton(&c));

        let d = circle_2d("c", 1.0).with_field("_extra", 0.0);
        assert_ne!(skeleton(&a), skeleton(&d));
    }

    #[test]
    fn skeleton_leaves_chain_links_to_their_own_entries() {
        let plain = circle_2d("c", 1.0);
        let chained = circle_2d("c", 1.0).with_sub_component(circle_2d("d", 2.0));
        assert_eq!(skeleton(&plain), skeleton(&chained));
    }
}
