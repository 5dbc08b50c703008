//! Replicated element storage: fields, lists and function slots.
//!
//! Values are stored as postcard bytes so the dispatcher can route them
//! without knowing their types; the typed accessors decode on demand.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::behaviour::{FieldDef, FunctionDef, ListDef, SyncBehaviour, SyncMode};
use crate::identity::ObjectId;

/// Hard cap on items in one replicated list (one count byte on the wire).
pub const MAX_LIST_ITEMS: usize = 255;

// ---------------------------------------------------------------------------
// SyncField
// ---------------------------------------------------------------------------

/// One replicated value.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncField {
    object_id: ObjectId,
    index: u8,
    name: String,
    behaviour: SyncBehaviour,
    mode: SyncMode,
    value: Vec<u8>,
    dirty: bool,
}

impl SyncField {
    pub(crate) fn new(object_id: ObjectId, index: u8, def: &FieldDef) -> Self {
        Self {
            object_id,
            index,
            name: def.name.clone(),
            behaviour: def.behaviour,
            mode: def.mode,
            value: def.initial.clone(),
            dirty: false,
        }
    }

    /// Id of the object this field belongs to.
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Index within the object's field array.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Declared name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Initial-sync behaviour.
    pub fn behaviour(&self) -> SyncBehaviour {
        self.behaviour
    }

    /// Write/fan-out mode.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Serialized current value.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Current value decoded as `T`.
    pub fn get<T: DeserializeOwned>(&self) -> Option<T> {
        postcard::from_bytes(&self.value).ok()
    }

    /// Changed since the last flush.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// `true` when the value travels in the spawn message.
    pub fn syncs_initially(&self) -> bool {
        self.behaviour != SyncBehaviour::DoNotSyncInitialDataImmediately
    }

    /// Stores a locally produced value. Returns `false` when the write is
    /// filtered out (equal value on a non-`AlwaysSync` field).
    pub(crate) fn write(&mut self, value: Vec<u8>) -> bool {
        if self.behaviour != SyncBehaviour::AlwaysSync && value == self.value {
            return false;
        }
        self.value = value;
        self.dirty = true;
        true
    }

    /// Stores a value received from the wire.
    pub(crate) fn apply_remote(&mut self, value: Vec<u8>) {
        self.value = value;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

// ---------------------------------------------------------------------------
// SyncList
// ---------------------------------------------------------------------------

/// Kind of one list operation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOp {
    /// Append `payload`.
    Add,
    /// Replace the item at `index` with `payload`.
    Set,
    /// Remove the item at `index`.
    Remove,
    /// Remove every item.
    Clear,
    /// Insert `payload` before `index`.
    Insert,
}

/// Reasons a list operation cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListError {
    /// The list already holds the maximum number of items.
    #[error("list is full (255 items)")]
    Full,
    /// The operation's index is outside the list.
    #[error("list index {index} out of range (len {len})")]
    IndexOutOfRange {
        /// Requested index.
        index: i32,
        /// Current length.
        len: usize,
    },
    /// The operation needs an index but carries none.
    #[error("{0:?} requires an index")]
    MissingIndex(ListOp),
    /// The operation needs a payload but carries none.
    #[error("{0:?} requires a payload")]
    MissingPayload(ListOp),
}

/// One replicated, index-addressed list.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncList {
    object_id: ObjectId,
    index: u8,
    name: String,
    mode: SyncMode,
    items: Vec<Vec<u8>>,
}

impl SyncList {
    pub(crate) fn new(object_id: ObjectId, index: u8, def: &ListDef) -> Self {
        Self {
            object_id,
            index,
            name: def.name.clone(),
            mode: def.mode,
            items: Vec::new(),
        }
    }

    /// Id of the object this list belongs to.
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Index within the object's list array.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Declared name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fan-out mode.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Serialized items.
    pub fn items(&self) -> &[Vec<u8>] {
        &self.items
    }

    /// Items decoded as `T`; undecodable items are skipped.
    pub fn decoded<T: DeserializeOwned>(&self) -> Vec<T> {
        self.items
            .iter()
            .filter_map(|item| postcard::from_bytes(item).ok())
            .collect()
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// `true` when the list holds nothing.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Applies one operation. On error the list is unchanged.
    pub(crate) fn apply(
        &mut self,
        op: ListOp,
        index: Option<i32>,
        payload: Option<&[u8]>,
    ) -> Result<(), ListError> {
        match op {
            ListOp::Clear => self.items.clear(),
            ListOp::Add => {
                let payload = payload.ok_or(ListError::MissingPayload(op))?;
                if self.items.len() >= MAX_LIST_ITEMS {
                    return Err(ListError::Full);
                }
                self.items.push(payload.to_vec());
            }
            ListOp::Insert => {
                let payload = payload.ok_or(ListError::MissingPayload(op))?;
                if self.items.len() >= MAX_LIST_ITEMS {
                    return Err(ListError::Full);
                }
                let at = self.position(op, index, self.items.len() + 1)?;
                self.items.insert(at, payload.to_vec());
            }
            ListOp::Set => {
                let payload = payload.ok_or(ListError::MissingPayload(op))?;
                let at = self.position(op, index, self.items.len())?;
                self.items[at] = payload.to_vec();
            }
            ListOp::Remove => {
                let at = self.position(op, index, self.items.len())?;
                self.items.remove(at);
            }
        }
        Ok(())
    }

    /// Replaces the whole contents with an initial burst.
    pub(crate) fn replace(&mut self, items: Vec<Vec<u8>>) -> Result<(), ListError> {
        if items.len() > MAX_LIST_ITEMS {
            return Err(ListError::Full);
        }
        self.items = items;
        Ok(())
    }

    /// Validates `index` against an exclusive upper `bound`.
    fn position(&self, op: ListOp, index: Option<i32>, bound: usize) -> Result<usize, ListError> {
        let index = index.ok_or(ListError::MissingIndex(op))?;
        usize::try_from(index)
            .ok()
            .filter(|&i| i < bound)
            .ok_or(ListError::IndexOutOfRange {
                index,
                len: self.items.len(),
            })
    }
}

// ---------------------------------------------------------------------------
// SyncFunction
// ---------------------------------------------------------------------------

/// One remotely invocable function slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncFunction {
    object_id: ObjectId,
    index: u8,
    name: String,
    require_owner: bool,
}

impl SyncFunction {
    pub(crate) fn new(object_id: ObjectId, index: u8, def: &FunctionDef) -> Self {
        Self {
            object_id,
            index,
            name: def.name.clone(),
            require_owner: def.require_owner,
        }
    }

    /// Id of the object this function belongs to.
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Index within the object's function array.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Declared name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calls from non-owners are rejected.
    pub fn require_owner(&self) -> bool {
        self.require_owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(behaviour: SyncBehaviour) -> SyncField {
        SyncField::new(
            ObjectId(1),
            0,
            &FieldDef {
                name: "hp".into(),
                behaviour,
                mode: SyncMode::ServerToClients,
                initial: postcard::to_allocvec(&10u32).unwrap(),
            },
        )
    }

    fn list() -> SyncList {
        SyncList::new(
            ObjectId(1),
            0,
            &ListDef {
                name: "inventory".into(),
                mode: SyncMode::ServerToClients,
            },
        )
    }

    #[test]
    fn test_default_field_skips_equal_write() {
        let mut f = field(SyncBehaviour::Default);
        assert!(!f.write(postcard::to_allocvec(&10u32).unwrap()));
        assert!(!f.is_dirty());
        assert!(f.write(postcard::to_allocvec(&11u32).unwrap()));
        assert!(f.is_dirty());
        assert_eq!(f.get::<u32>(), Some(11));
    }

    #[test]
    fn test_always_sync_field_marks_equal_write_dirty() {
        let mut f = field(SyncBehaviour::AlwaysSync);
        assert!(f.write(postcard::to_allocvec(&10u32).unwrap()));
        assert!(f.is_dirty());
        f.clear_dirty();
        assert!(!f.is_dirty());
    }

    #[test]
    fn test_list_operations() {
        let mut l = list();
        l.apply(ListOp::Add, None, Some(b"a")).unwrap();
        l.apply(ListOp::Add, None, Some(b"c")).unwrap();
        l.apply(ListOp::Insert, Some(1), Some(b"b")).unwrap();
        assert_eq!(l.items(), &[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        l.apply(ListOp::Set, Some(2), Some(b"z")).unwrap();
        l.apply(ListOp::Remove, Some(0), None).unwrap();
        assert_eq!(l.items(), &[b"b".to_vec(), b"z".to_vec()]);

        l.apply(ListOp::Clear, None, None).unwrap();
        assert!(l.is_empty());
    }

    #[test]
    fn test_list_insert_at_end_allowed() {
        let mut l = list();
        l.apply(ListOp::Insert, Some(0), Some(b"x")).unwrap();
        l.apply(ListOp::Insert, Some(1), Some(b"y")).unwrap();
        assert_eq!(l.len(), 2);
    }

    #[test]
    fn test_list_rejects_bad_ops_without_change() {
        let mut l = list();
        l.apply(ListOp::Add, None, Some(b"a")).unwrap();
        assert_eq!(
            l.apply(ListOp::Set, Some(5), Some(b"x")),
            Err(ListError::IndexOutOfRange { index: 5, len: 1 })
        );
        assert_eq!(
            l.apply(ListOp::Remove, Some(-1), None),
            Err(ListError::IndexOutOfRange { index: -1, len: 1 })
        );
        assert_eq!(l.apply(ListOp::Remove, None, None), Err(ListError::MissingIndex(ListOp::Remove)));
        assert_eq!(l.apply(ListOp::Add, None, None), Err(ListError::MissingPayload(ListOp::Add)));
        assert_eq!(l.len(), 1);
    }

    #[test]
    fn test_list_caps_at_255_items() {
        let mut l = list();
        for i in 0..MAX_LIST_ITEMS {
            l.apply(ListOp::Add, None, Some(&[i as u8])).unwrap();
        }
        assert_eq!(l.apply(ListOp::Add, None, Some(b"x")), Err(ListError::Full));
        assert_eq!(l.apply(ListOp::Insert, Some(0), Some(b"x")), Err(ListError::Full));
        assert_eq!(l.replace(vec![Vec::new(); 256]), Err(ListError::Full));
    }
}
