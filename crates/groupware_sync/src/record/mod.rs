//! Records and their nested sub-collections
//!
//! A record is a typed bag of properties. It tracks which properties were
//! edited since the last server confirmation (the dirty set) and the values
//! they held before, so edits can be sent as a minimal diff or rolled back.

pub mod value;

pub use value::PropValue;

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Identity properties of top-level records
pub const DEFAULT_ID_PROPS: [&str; 3] = ["entryid", "parent_entryid", "store_entryid"];

/// Property holding the recurring series identifier
pub const SERIES_PROP: &str = "goid";

/// Message or folder class, e.g. `IPM.Note` or `IPF.Appointment`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordType(String);

impl RecordType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Dotted prefixes of the class, most specific first.
    ///
    /// `IPM.Note.SMIME` yields `IPM.Note.SMIME`, `IPM.Note`, `IPM`.
    pub fn lineage(&self) -> Vec<&str> {
        let mut out = vec![self.0.as_str()];
        let mut rest = self.0.as_str();
        while let Some(pos) = rest.rfind('.') {
            rest = &rest[..pos];
            out.push(rest);
        }
        out
    }

    /// Whether this class equals `other` or is a dotted refinement of it
    pub fn is_subclass_of(&self, other: &RecordType) -> bool {
        let me = self.0.to_ascii_lowercase();
        let parent = other.0.to_ascii_lowercase();
        me == parent || me.starts_with(&format!("{}.", parent))
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity property of the children of a named sub-collection
fn child_id_props(collection: &str) -> Vec<String> {
    let prop = match collection {
        "recipients" => "rowid",
        "attachments" => "attach_num",
        _ => "entryid",
    };
    vec![prop.to_string()]
}

/// Ordered children owned by one parent record
#[derive(Debug, Clone)]
pub struct SubCollection {
    items: Vec<Record>,
    removed: Vec<Record>,
    child_type: RecordType,
    child_id_props: Vec<String>,
}

impl SubCollection {
    pub fn new(child_type: RecordType, child_id_props: Vec<String>) -> Self {
        Self {
            items: Vec::new(),
            removed: Vec::new(),
            child_type,
            child_id_props,
        }
    }

    /// Empty collection using the built-in identity property for `name`
    pub fn named(name: &str) -> Self {
        Self::new(RecordType::new(name), child_id_props(name))
    }

    pub fn items(&self) -> &[Record] {
        &self.items
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Record> {
        self.items.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// New phantom child of this collection's type, not yet added
    pub fn create_child(&self, props: Vec<(&str, PropValue)>) -> Record {
        Record::new_phantom_with(self.child_type.clone(), self.child_id_props.clone(), props)
    }

    pub fn add(&mut self, record: Record) {
        self.items.push(record);
    }

    /// Remove the child at `index`. Children the server already knows about
    /// are remembered so the next diff can report them.
    pub fn remove(&mut self, index: usize) -> Option<Record> {
        if index >= self.items.len() {
            return None;
        }
        let record = self.items.remove(index);
        if !record.is_phantom() {
            self.removed.push(record.clone());
        }
        Some(record)
    }

    pub fn added(&self) -> Vec<&Record> {
        self.items.iter().filter(|r| r.is_phantom()).collect()
    }

    pub fn modified(&self) -> Vec<&Record> {
        self.items
            .iter()
            .filter(|r| !r.is_phantom() && r.has_changes())
            .collect()
    }

    pub fn removed(&self) -> &[Record] {
        &self.removed
    }

    pub fn has_changes(&self) -> bool {
        !self.removed.is_empty()
            || self
                .items
                .iter()
                .any(|r| r.is_phantom() || r.has_changes())
    }

    pub fn commit(&mut self) {
        self.removed.clear();
        for item in &mut self.items {
            item.commit();
        }
    }

    /// Drop unsent additions, restore removed children and undo child edits
    pub fn reject(&mut self) {
        self.items.retain(|r| !r.is_phantom());
        self.items.append(&mut self.removed);
        for item in &mut self.items {
            item.reject();
        }
    }

    /// Replace the children with the server's list
    pub fn replace_from_wire(&mut self, items: &[Value]) -> Result<(), SyncError> {
        let mut parsed = Vec::with_capacity(items.len());
        for item in items {
            parsed.push(Record::from_wire(
                item,
                &self.child_type,
                &self.child_id_props,
            )?);
        }
        self.items = parsed;
        self.removed.clear();
        Ok(())
    }
}

/// Extract `{"item": [...]}` style child lists
fn wire_item_list(value: &Value) -> Option<&Vec<Value>> {
    value.as_object()?.get("item")?.as_array()
}

/// A typed bag of named properties
#[derive(Debug, Clone)]
pub struct Record {
    record_type: RecordType,
    phantom_id: Uuid,
    phantom: bool,
    id_props: Vec<String>,
    props: BTreeMap<String, PropValue>,
    dirty: BTreeSet<String>,
    original: BTreeMap<String, Option<PropValue>>,
    sub_collections: BTreeMap<String, SubCollection>,
    message_actions: BTreeMap<String, PropValue>,
    opened: bool,
    stale: bool,
    creating: bool,
}

impl Record {
    fn empty(record_type: RecordType, id_props: Vec<String>) -> Self {
        Self {
            record_type,
            phantom_id: Uuid::new_v4(),
            phantom: false,
            id_props,
            props: BTreeMap::new(),
            dirty: BTreeSet::new(),
            original: BTreeMap::new(),
            sub_collections: BTreeMap::new(),
            message_actions: BTreeMap::new(),
            opened: false,
            stale: false,
            creating: false,
        }
    }

    /// A record the server has never seen. Its initial properties count as
    /// edits so a create sends all of them.
    pub fn new_phantom(record_type: impl Into<RecordType>, props: Vec<(&str, PropValue)>) -> Self {
        let id_props = DEFAULT_ID_PROPS.iter().map(|s| s.to_string()).collect();
        Self::new_phantom_with(record_type.into(), id_props, props)
    }

    fn new_phantom_with(
        record_type: RecordType,
        id_props: Vec<String>,
        props: Vec<(&str, PropValue)>,
    ) -> Self {
        let mut record = Self::empty(record_type, id_props);
        record.phantom = true;
        for (name, value) in props {
            record.props.insert(name.to_string(), value);
            record.dirty.insert(name.to_string());
        }
        record
    }

    /// Build a committed record from a server item.
    ///
    /// Identity properties are read from the top level, the rest from the
    /// `props` object. Top-level objects holding an `item` list become
    /// sub-collections.
    pub fn from_wire(
        item: &Value,
        default_type: &RecordType,
        id_props: &[String],
    ) -> Result<Self, SyncError> {
        let mut record = Self::empty(default_type.clone(), id_props.to_vec());
        record.apply_server_data(item)?;
        Ok(record)
    }

    /// Same as [`Record::from_wire`] with the default identity properties
    pub fn from_wire_default(item: &Value, default_type: &RecordType) -> Result<Self, SyncError> {
        let id_props: Vec<String> = DEFAULT_ID_PROPS.iter().map(|s| s.to_string()).collect();
        Self::from_wire(item, default_type, &id_props)
    }

    pub fn record_type(&self) -> &RecordType {
        &self.record_type
    }

    pub fn phantom_id(&self) -> Uuid {
        self.phantom_id
    }

    pub fn is_phantom(&self) -> bool {
        self.phantom
    }

    pub fn id_props(&self) -> &[String] {
        &self.id_props
    }

    pub fn is_id_prop(&self, name: &str) -> bool {
        self.id_props.iter().any(|p| p == name)
    }

    pub fn get(&self, name: &str) -> Option<&PropValue> {
        self.props.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.props.get(name).and_then(PropValue::as_str)
    }

    pub fn props(&self) -> &BTreeMap<String, PropValue> {
        &self.props
    }

    pub fn entry_id(&self) -> Option<&str> {
        self.get_str("entryid")
    }

    pub fn parent_entry_id(&self) -> Option<&str> {
        self.get_str("parent_entryid")
    }

    pub fn store_entry_id(&self) -> Option<&str> {
        self.get_str("store_entryid")
    }

    pub fn series_id(&self) -> Option<&str> {
        self.get_str(SERIES_PROP).filter(|s| !s.is_empty())
    }

    /// Value of the first identity property, when set
    pub fn primary_id(&self) -> Option<&PropValue> {
        let first = self.id_props.first()?;
        match self.props.get(first) {
            Some(PropValue::Null) | None => None,
            Some(PropValue::Text(s)) if s.is_empty() => None,
            Some(v) => Some(v),
        }
    }

    pub fn has_identity(&self) -> bool {
        self.primary_id().is_some()
    }

    pub fn dirty_props(&self) -> &BTreeSet<String> {
        &self.dirty
    }

    /// Unsent property edits here or in any sub-collection
    pub fn has_changes(&self) -> bool {
        !self.dirty.is_empty() || self.sub_collections.values().any(|s| s.has_changes())
    }

    /// Set a property. Returns false when the value was already in place.
    /// Setting a property back to its pre-edit value clears its dirty flag.
    pub fn set(&mut self, name: &str, value: impl Into<PropValue>) -> bool {
        let value = value.into();
        if self.props.get(name) == Some(&value) {
            return false;
        }

        let previous = self.props.insert(name.to_string(), value);
        let original = self
            .original
            .entry(name.to_string())
            .or_insert(previous)
            .clone();

        if !self.phantom && original.as_ref() == self.props.get(name) {
            self.original.remove(name);
            self.dirty.remove(name);
        } else {
            self.dirty.insert(name.to_string());
        }
        true
    }

    /// Undo every unsent edit
    pub fn reject(&mut self) {
        for (name, value) in std::mem::take(&mut self.original) {
            match value {
                Some(v) => {
                    self.props.insert(name, v);
                }
                None => {
                    self.props.remove(&name);
                }
            }
        }
        self.dirty.clear();
        for sub in self.sub_collections.values_mut() {
            sub.reject();
        }
    }

    /// Mark the current state as server-confirmed
    pub fn commit(&mut self) {
        self.dirty.clear();
        self.original.clear();
        self.message_actions.clear();
        self.phantom = false;
        self.creating = false;
        for sub in self.sub_collections.values_mut() {
            sub.commit();
        }
    }

    /// Merge a server item into this record and commit.
    pub fn apply_server_data(&mut self, item: &Value) -> Result<(), SyncError> {
        let obj = item
            .as_object()
            .ok_or_else(|| SyncError::MalformedPayload("record item is not an object".into()))?;

        for id in &self.id_props {
            if let Some(v) = obj.get(id) {
                self.props.insert(id.clone(), PropValue::from_wire(v));
            }
        }

        if let Some(props) = obj.get("props") {
            let props = props
                .as_object()
                .ok_or_else(|| SyncError::MalformedPayload("props is not an object".into()))?;
            for (name, v) in props {
                self.props.insert(name.clone(), PropValue::from_wire(v));
            }
        }

        for (name, v) in obj {
            if name == "props" || self.is_id_prop(name) {
                continue;
            }
            if let Some(items) = wire_item_list(v) {
                self.sub_collections
                    .entry(name.clone())
                    .or_insert_with(|| SubCollection::named(name))
                    .replace_from_wire(items)?;
            }
        }

        let class = self
            .get_str("message_class")
            .or_else(|| self.get_str("container_class"))
            .map(RecordType::new);
        if let Some(class) = class {
            self.record_type = class;
        }

        self.commit();
        Ok(())
    }

    /// Take over another instance's properties and children.
    /// Identity flags of this instance are kept.
    pub fn merge_from(&mut self, other: &Record) {
        self.record_type = other.record_type.clone();
        self.props = other.props.clone();
        self.sub_collections = other.sub_collections.clone();
    }

    pub fn sub_collection(&self, name: &str) -> Option<&SubCollection> {
        self.sub_collections.get(name)
    }

    pub fn sub_collection_mut(&mut self, name: &str) -> &mut SubCollection {
        self.sub_collections
            .entry(name.to_string())
            .or_insert_with(|| SubCollection::named(name))
    }

    pub fn sub_collections(&self) -> &BTreeMap<String, SubCollection> {
        &self.sub_collections
    }

    /// Attach a server-side action (e.g. `send`, `copy`) to the next write
    pub fn add_message_action(&mut self, name: &str, value: impl Into<PropValue>) {
        self.message_actions.insert(name.to_string(), value.into());
    }

    pub fn delete_message_action(&mut self, name: &str) {
        self.message_actions.remove(name);
    }

    pub fn clear_message_actions(&mut self) {
        self.message_actions.clear();
    }

    pub fn message_actions(&self) -> &BTreeMap<String, PropValue> {
        &self.message_actions
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }

    /// Full data has been fetched; clears staleness
    pub fn mark_opened(&mut self) {
        self.opened = true;
        self.stale = false;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn is_creating(&self) -> bool {
        self.creating
    }

    pub fn set_creating(&mut self) {
        self.creating = true;
    }

    pub fn clear_creating(&mut self) {
        self.creating = false;
    }
}

/// Shared reference to a record.
///
/// Two handles are the same record only when they point at the same
/// allocation; equal properties do not make records identical.
#[derive(Debug, Clone)]
pub struct RecordHandle(Arc<RwLock<Record>>);

impl RecordHandle {
    pub fn new(record: Record) -> Self {
        Self(Arc::new(RwLock::new(record)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Record> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Record> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ptr_eq(&self, other: &RecordHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Allocation address, stable for the handle's lifetime
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Independent deep copy sharing the same logical identity
    pub fn copy(&self) -> RecordHandle {
        RecordHandle::new(self.read().clone())
    }
}

impl From<Record> for RecordHandle {
    fn from(record: Record) -> Self {
        Self::new(record)
    }
}
