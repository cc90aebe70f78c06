//! Property buffer symbol table.
//!
//! Every component field and every literal fragment claims one 16-byte record
//! (`vec4f` in WGSL). Slots are assigned before any code is lowered; lowering
//! only looks keys up, so the emitted indices and the packed buffer cannot
//! drift apart.

use std::collections::HashMap;
use std::fmt;

use crate::error::{BuildError, GraphError};
use crate::graph::component::{Component, Statement};
use crate::graph::fragment::Fragment;
use crate::values::{check_component_fields, extract_component_value, extract_fragment_value};

pub type SlotId = usize;
pub type Record = [f32; 4];

/// Position of a fragment inside a component body:
/// `[statement index, fragment index, argument index...]`.
/// The fragment index follows [`Statement::fragments`] (value = 0, target = 1).
pub type FragmentPath = Vec<usize>;

/// Slot of the per-render globals record (`time`, `seed`).
pub const GLOBALS_SLOT: SlotId = 0;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SlotKey {
    Globals,
    Field { component: String, field: String },
    Literal { component: String, path: FragmentPath },
}

impl SlotKey {
    pub fn field(component: &str, field: &str) -> Self {
        SlotKey::Field {
            component: component.to_string(),
            field: field.to_string(),
        }
    }

    pub fn literal(component: &str, path: &[usize]) -> Self {
        SlotKey::Literal {
            component: component.to_string(),
            path: path.to_vec(),
        }
    }

    pub fn component(&self) -> Option<&str> {
        match self {
            SlotKey::Globals => None,
            SlotKey::Field { component, .. } | SlotKey::Literal { component, .. } => {
                Some(component)
            }
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKey::Globals => f.write_str("globals"),
            SlotKey::Field { component, field } => write!(f, "{component}.{field}"),
            SlotKey::Literal { component, path } => {
                write!(f, "{component}@")?;
                for (i, p) in path.iter().enumerate() {
                    if i > 0 {
                        f.write_str(".")?;
                    }
                    write!(f, "{p}")?;
                }
                Ok(())
            }
        }
    }
}

/// Packed records plus the key each slot was claimed for.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyTable {
    records: Vec<Record>,
    keys: Vec<SlotKey>,
    index: HashMap<SlotKey, SlotId>,
}

impl Default for PropertyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyTable {
    /// Table holding only the globals record.
    pub fn new() -> Self {
        let mut table = Self {
            records: Vec::new(),
            keys: Vec::new(),
            index: HashMap::new(),
        };
        table.claim(SlotKey::Globals, [0.0; 4]);
        table
    }

    /// First-seen slot assignment. Claiming an existing key returns its slot and
    /// leaves the stored value alone.
    pub fn claim(&mut self, key: SlotKey, value: Record) -> SlotId {
        if let Some(slot) = self.index.get(&key) {
            return *slot;
        }
        let slot = self.records.len();
        self.records.push(value);
        self.keys.push(key.clone());
        self.index.insert(key, slot);
        slot
    }

    pub fn slot(&self, key: &SlotKey) -> Result<SlotId, BuildError> {
        self.index
            .get(key)
            .copied()
            .ok_or_else(|| BuildError::UnclaimedSlot {
                key: key.to_string(),
            })
    }

    pub fn contains(&self, key: &SlotKey) -> bool {
        self.index.contains_key(key)
    }

    /// Rewrite the value of an existing slot.
    pub fn update(&mut self, key: &SlotKey, value: Record) -> Result<(), BuildError> {
        let slot = *self.index.get(key).ok_or_else(|| BuildError::LayoutChanged {
            key: key.to_string(),
        })?;
        self.records[slot] = value;
        Ok(())
    }

    pub fn set_globals(&mut self, value: Record) {
        self.records[GLOBALS_SLOT] = value;
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn record(&self, slot: SlotId) -> Option<Record> {
        self.records.get(slot).copied()
    }

    /// Slot keys in slot order.
    pub fn layout(&self) -> &[SlotKey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn size_bytes(&self) -> u64 {
        (self.records.len() as u64) * 16
    }

    /// Buffer contents ready for upload.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.records.as_slice())
    }

    /// Keys claimed on behalf of one component, in slot order.
    pub fn keys_of<'a>(&'a self, component: &'a str) -> impl Iterator<Item = &'a SlotKey> + 'a {
        self.keys
            .iter()
            .filter(move |k| k.component() == Some(component))
    }

    pub fn collect(&mut self, entries: Vec<(SlotKey, Record)>) {
        for (key, value) in entries {
            self.claim(key, value);
        }
    }
}

/// Current values of every field and literal of `component`, keyed and ordered
/// the way they are claimed: kind fields first, then extra fields, then
/// literals depth-first through the body.
pub fn dry_run(component: &Component) -> Result<Vec<(SlotKey, Record)>, GraphError> {
    check_component_fields(component)?;
    let mut out = Vec::new();
    for field in component.ordered_fields() {
        let v = extract_component_value(component, field)?;
        out.push((SlotKey::field(&component.id, field), [v, 0.0, 0.0, 0.0]));
    }
    for (si, statement) in component.body.iter().enumerate() {
        for (fi, fragment) in statement.fragments().into_iter().enumerate() {
            let mut path = vec![si, fi];
            literals(&component.id, fragment, &mut path, &mut out)?;
        }
    }
    Ok(out)
}

fn literals(
    component: &str,
    fragment: &Fragment,
    path: &mut Vec<usize>,
    out: &mut Vec<(SlotKey, Record)>,
) -> Result<(), GraphError> {
    if fragment.is_literal() {
        out.push((
            SlotKey::literal(component, path),
            extract_fragment_value(fragment)?,
        ));
        return Ok(());
    }
    for (i, arg) in fragment.arguments.iter().enumerate() {
        path.push(i);
        literals(component, arg, path, out)?;
        path.pop();
    }
    Ok(())
}

/// Number of statements whose fragments carry literals; used in logs.
pub fn literal_count(component: &Component) -> usize {
    component
        .body
        .iter()
        .filter(|s| match s {
            Statement::Define { value, .. } => has_literal(value),
            Statement::Assign { value, target, .. } => has_literal(value) || has_literal(target),
        })
        .count()
}

fn has_literal(fragment: &Fragment) -> bool {
    fragment.is_literal() || fragment.arguments.iter().any(has_literal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::component::ComponentKind;
    use crate::graph::library::circle_2d;

    #[test]
    fn globals_occupy_slot_zero() {
        let t = PropertyTable::new();
        assert_eq!(t.len(), 1);
        assert_eq!(t.slot(&SlotKey::Globals), Ok(GLOBALS_SLOT));
        assert_eq!(t.as_bytes().len(), 16);
    }

    #[test]
    fn claims_are_first_seen() {
        let mut t = PropertyTable::new();
        let a = t.claim(SlotKey::field("c", "_posX"), [1.0, 0.0, 0.0, 0.0]);
        let b = t.claim(SlotKey::field("c", "_posY"), [2.0, 0.0, 0.0, 0.0]);
        let again = t.claim(SlotKey::field("c", "_posX"), [9.0, 0.0, 0.0, 0.0]);
        assert_eq!((a, b, again), (1, 2, 1));
        assert_eq!(t.record(1), Some([1.0, 0.0, 0.0, 0.0]));
    }

    #[test]
    fn unknown_keys_are_explicit_errors() {
        let mut t = PropertyTable::new();
        let key = SlotKey::literal("c", &[0, 0]);
        assert!(matches!(t.slot(&key), Err(BuildError::UnclaimedSlot { .. })));
        assert!(matches!(
            t.update(&key, [0.0; 4]),
            Err(BuildError::LayoutChanged { .. })
        ));
    }

    #[test]
    fn dry_run_orders_fields_before_literals() {
        let c = circle_2d("disk", 5.0);
        let entries = dry_run(&c).expect("dry run");
        let keys: Vec<String> = entries.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(
            keys,
            [
                "disk._posX",
                "disk._posY",
                "disk._scaleX",
                "disk._scaleY",
                "disk._rotate",
                "disk@0.0.1",
            ]
        );
        assert_eq!(entries[5].1, [5.0, 0.0, 0.0, 0.0]);
        assert_eq!(literal_count(&c), 1);
    }

    #[test]
    fn dry_run_rejects_components_missing_kind_fields() {
        let mut c = Component::new("c", ComponentKind::Sdf2D);
        c.fields.remove("_posX");
        assert!(matches!(dry_run(&c), Err(GraphError::MissingField { .. })));
    }
}
