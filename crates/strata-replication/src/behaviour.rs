//! Behaviour declarations and the per-object element table.
//!
//! A template declares an ordered list of [`BehaviourDef`]s, each exposing
//! zero or more fields, lists and functions. At setup the declarations are
//! flattened, in declaration order, into one fixed array per category. The
//! resulting indices are what travels on the wire, so they never change for
//! the lifetime of the object.

use std::fmt;

use serde::Serialize;

use crate::error::TemplateError;
use crate::identity::ObjectId;
use crate::sync::{SyncField, SyncFunction, SyncList};

/// Hard cap on elements per category per object (one count byte on the wire).
pub const MAX_ELEMENTS_PER_KIND: usize = 255;

// ---------------------------------------------------------------------------
// Element tags
// ---------------------------------------------------------------------------

/// The three replicable element categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// A single replicated value.
    Field,
    /// An index-addressed replicated list.
    List,
    /// A remotely invocable function.
    Function,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field => f.write_str("field"),
            Self::List => f.write_str("list"),
            Self::Function => f.write_str("function"),
        }
    }
}

/// When a field's value reaches a new subscriber and how changes are filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncBehaviour {
    /// Included in the spawn message; changes to an equal value are skipped.
    #[default]
    Default,
    /// Included in the spawn message; every write is sent, even if unchanged.
    AlwaysSync,
    /// Withheld from the spawn message and sent as a targeted follow-up delta.
    DoNotSyncInitialDataImmediately,
}

/// Who may write an element and who receives its changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Authority writes, every subscriber receives.
    #[default]
    ServerToClients,
    /// Authority writes, only the owning connection receives.
    ServerToOwner,
    /// The owning client writes; the authority applies it and relays it to
    /// the other subscribers.
    ClientMulticast,
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// Declaration of one replicated field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Name, for logs and lookups.
    pub name: String,
    /// Initial-sync and change-filter behaviour.
    pub behaviour: SyncBehaviour,
    /// Write/fan-out mode.
    pub mode: SyncMode,
    /// Serialized initial value.
    pub initial: Vec<u8>,
}

/// Declaration of one replicated list.
#[derive(Debug, Clone, PartialEq)]
pub struct ListDef {
    /// Name, for logs and lookups.
    pub name: String,
    /// Fan-out mode. Only `ClientMulticast` lists accept operations from the
    /// owning client; every other mode is written by the authority alone.
    pub mode: SyncMode,
}

/// Declaration of one remotely invocable function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    /// Name, for logs and lookups.
    pub name: String,
    /// Reject calls from connections that do not own the object.
    pub require_owner: bool,
}

/// One replicable sub-component of a template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BehaviourDef {
    /// Behaviour name.
    pub name: String,
    /// Fields in declaration order.
    pub fields: Vec<FieldDef>,
    /// Lists in declaration order.
    pub lists: Vec<ListDef>,
    /// Functions in declaration order.
    pub functions: Vec<FunctionDef>,
}

impl BehaviourDef {
    /// Starts an empty behaviour declaration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Declares a field whose initial value is `initial`, serialized with postcard.
    pub fn field<T: Serialize>(
        mut self,
        name: impl Into<String>,
        initial: &T,
        behaviour: SyncBehaviour,
        mode: SyncMode,
    ) -> Self {
        let initial = postcard::to_allocvec(initial).unwrap_or_default();
        self.fields.push(FieldDef {
            name: name.into(),
            behaviour,
            mode,
            initial,
        });
        self
    }

    /// Declares a list.
    pub fn list(mut self, name: impl Into<String>, mode: SyncMode) -> Self {
        self.lists.push(ListDef {
            name: name.into(),
            mode,
        });
        self
    }

    /// Declares a function.
    pub fn function(mut self, name: impl Into<String>, require_owner: bool) -> Self {
        self.functions.push(FunctionDef {
            name: name.into(),
            require_owner,
        });
        self
    }
}

/// Checks the per-category caps across all behaviours of a template.
pub fn validate_behaviours(asset_id: &str, behaviours: &[BehaviourDef]) -> Result<(), TemplateError> {
    let counts = [
        (ElementKind::Field, behaviours.iter().map(|b| b.fields.len()).sum::<usize>()),
        (ElementKind::List, behaviours.iter().map(|b| b.lists.len()).sum()),
        (ElementKind::Function, behaviours.iter().map(|b| b.functions.len()).sum()),
    ];
    for (kind, count) in counts {
        if count > MAX_ELEMENTS_PER_KIND {
            return Err(TemplateError::TooManyElements {
                asset_id: asset_id.to_string(),
                kind,
                count,
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ElementTable
// ---------------------------------------------------------------------------

/// The flattened, fixed-order element arrays of one object.
#[derive(Debug, Clone, Default)]
pub struct ElementTable {
    fields: Vec<SyncField>,
    lists: Vec<SyncList>,
    functions: Vec<SyncFunction>,
}

impl ElementTable {
    /// Flattens `behaviours` in declaration order, stamping every element
    /// with `object_id`. Callers validate the caps first.
    pub fn setup(object_id: ObjectId, behaviours: &[BehaviourDef]) -> Self {
        let mut table = Self::default();
        for behaviour in behaviours {
            for def in &behaviour.fields {
                let index = table.fields.len() as u8;
                table.fields.push(SyncField::new(object_id, index, def));
            }
            for def in &behaviour.lists {
                let index = table.lists.len() as u8;
                table.lists.push(SyncList::new(object_id, index, def));
            }
            for def in &behaviour.functions {
                let index = table.functions.len() as u8;
                table.functions.push(SyncFunction::new(object_id, index, def));
            }
        }
        table
    }

    /// All fields, in index order.
    pub fn fields(&self) -> &[SyncField] {
        &self.fields
    }

    /// All lists, in index order.
    pub fn lists(&self) -> &[SyncList] {
        &self.lists
    }

    /// All functions, in index order.
    pub fn functions(&self) -> &[SyncFunction] {
        &self.functions
    }

    /// Field at `index`.
    pub fn field(&self, index: u8) -> Option<&SyncField> {
        self.fields.get(index as usize)
    }

    /// Mutable field at `index`.
    pub fn field_mut(&mut self, index: u8) -> Option<&mut SyncField> {
        self.fields.get_mut(index as usize)
    }

    /// List at `index`.
    pub fn list(&self, index: u8) -> Option<&SyncList> {
        self.lists.get(index as usize)
    }

    /// Mutable list at `index`.
    pub fn list_mut(&mut self, index: u8) -> Option<&mut SyncList> {
        self.lists.get_mut(index as usize)
    }

    /// Function at `index`.
    pub fn function(&self, index: u8) -> Option<&SyncFunction> {
        self.functions.get(index as usize)
    }

    /// Index of the first field named `name`.
    pub fn field_index(&self, name: &str) -> Option<u8> {
        self.fields.iter().position(|f| f.name() == name).map(|i| i as u8)
    }

    /// Index of the first list named `name`.
    pub fn list_index(&self, name: &str) -> Option<u8> {
        self.lists.iter().position(|l| l.name() == name).map(|i| i as u8)
    }

    /// Index of the first function named `name`.
    pub fn function_index(&self, name: &str) -> Option<u8> {
        self.functions.iter().position(|f| f.name() == name).map(|i| i as u8)
    }

    /// Number of elements in `kind`.
    pub fn len(&self, kind: ElementKind) -> usize {
        match kind {
            ElementKind::Field => self.fields.len(),
            ElementKind::List => self.lists.len(),
            ElementKind::Function => self.functions.len(),
        }
    }

    /// Indices of the fields written since the last flush.
    pub fn dirty_fields(&self) -> Vec<u8> {
        self.fields.iter().filter(|f| f.is_dirty()).map(|f| f.index()).collect()
    }

    /// Marks every field as sent. Returns how many were dirty.
    pub(crate) fn clear_dirty(&mut self) -> usize {
        let mut cleared = 0;
        for field in self.fields.iter_mut().filter(|f| f.is_dirty()) {
            field.clear_dirty();
            cleared += 1;
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_behaviours() -> Vec<BehaviourDef> {
        vec![
            BehaviourDef::new("stats")
                .field("hp", &100u32, SyncBehaviour::Default, SyncMode::ServerToClients)
                .field("mp", &50u32, SyncBehaviour::Default, SyncMode::ServerToOwner)
                .list("buffs", SyncMode::ServerToClients),
            BehaviourDef::new("movement")
                .field("speed", &4.5f32, SyncBehaviour::AlwaysSync, SyncMode::ClientMulticast)
                .function("jump", true),
        ]
    }

    #[test]
    fn test_elements_indexed_in_declaration_order() {
        let table = ElementTable::setup(ObjectId(7), &two_behaviours());
        assert_eq!(table.len(ElementKind::Field), 3);
        assert_eq!(table.field_index("hp"), Some(0));
        assert_eq!(table.field_index("mp"), Some(1));
        assert_eq!(table.field_index("speed"), Some(2));
        assert_eq!(table.list_index("buffs"), Some(0));
        assert_eq!(table.function_index("jump"), Some(0));
        assert!(table.fields().iter().all(|f| f.object_id() == ObjectId(7)));
    }

    #[test]
    fn test_validate_rejects_256_fields() {
        let mut behaviour = BehaviourDef::new("wide");
        for i in 0..256 {
            behaviour = behaviour.field(format!("f{i}"), &0u8, SyncBehaviour::Default, SyncMode::ServerToClients);
        }
        let err = validate_behaviours("wide", &[behaviour]).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::TooManyElements { kind: ElementKind::Field, count: 256, .. }
        ));
    }

    #[test]
    fn test_validate_accepts_255_split_across_behaviours() {
        let mut a = BehaviourDef::new("a");
        let mut b = BehaviourDef::new("b");
        for i in 0..200 {
            a = a.function(format!("a{i}"), false);
        }
        for i in 0..55 {
            b = b.function(format!("b{i}"), false);
        }
        assert!(validate_behaviours("split", &[a, b]).is_ok());
    }
}
