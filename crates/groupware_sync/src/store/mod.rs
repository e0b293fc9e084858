//! In-memory record stores
//!
//! A store holds an ordered list of keyed records, a snapshot of the last
//! server-confirmed membership, and the parameters of its last load. Changes
//! are broadcast to subscribers over flume channels.
//!
//! Lock order: a store lock may be held while locking its records, never
//! the other way around.

pub mod manager;
pub mod shadow;

use crate::error::SyncError;
use crate::keys::{KeyAllocator, RecordKey};
use crate::record::{Record, RecordHandle, RecordType};
use crate::routing::ModuleNames;
use crate::sync::transport::ServerAction;
use chrono::{DateTime, Utc};
use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(pub u64);

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store-{}", self.0)
    }
}

/// Who caused a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOrigin {
    /// A UI collaborator edited the store
    Local,
    /// The server confirmed or pushed the change
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOperation {
    Edit,
    Commit,
    Reject,
}

/// Change notifications delivered to store subscribers
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Add {
        store: StoreId,
        origin: EventOrigin,
        records: Vec<RecordHandle>,
    },
    Remove {
        store: StoreId,
        origin: EventOrigin,
        records: Vec<RecordHandle>,
    },
    Update {
        store: StoreId,
        origin: EventOrigin,
        operation: UpdateOperation,
        records: Vec<RecordHandle>,
    },
    Load {
        store: StoreId,
        records: Vec<RecordHandle>,
    },
    /// A write request completed successfully
    Write {
        store: StoreId,
        action: ServerAction,
        records: Vec<RecordHandle>,
    },
    Exception {
        store: StoreId,
        action: ServerAction,
        error: SyncError,
    },
}

impl StoreEvent {
    pub fn store(&self) -> StoreId {
        match self {
            StoreEvent::Add { store, .. }
            | StoreEvent::Remove { store, .. }
            | StoreEvent::Update { store, .. }
            | StoreEvent::Load { store, .. }
            | StoreEvent::Write { store, .. }
            | StoreEvent::Exception { store, .. } => *store,
        }
    }

    pub fn origin(&self) -> EventOrigin {
        match self {
            StoreEvent::Add { origin, .. }
            | StoreEvent::Remove { origin, .. }
            | StoreEvent::Update { origin, .. } => *origin,
            StoreEvent::Load { .. } | StoreEvent::Write { .. } | StoreEvent::Exception { .. } => {
                EventOrigin::Server
            }
        }
    }
}

/// Parameters of a list request, remembered to scope notifications
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Folder entryids whose contents were listed
    #[serde(default)]
    pub folders: Vec<String>,
    /// Mailbox (store) entryids whose children were listed
    #[serde(default)]
    pub stores: Vec<String>,
    #[serde(default)]
    pub params: Value,
}

impl LoadOptions {
    pub fn folder(entry_id: &str) -> Self {
        Self {
            folders: vec![entry_id.to_string()],
            ..Default::default()
        }
    }

    pub fn mailbox(store_entry_id: &str) -> Self {
        Self {
            stores: vec![store_entry_id.to_string()],
            ..Default::default()
        }
    }
}

/// How a store keys its records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Key by entryid once known, allocate otherwise
    Identity,
    /// Always allocate a fresh key
    Fresh,
}

#[derive(Debug, Clone)]
struct Entry {
    key: RecordKey,
    record: RecordHandle,
}

#[derive(Debug)]
struct Listener {
    tx: Sender<StoreEvent>,
    server_only: bool,
}

#[derive(Debug)]
pub struct Store {
    id: StoreId,
    name: String,
    modules: Option<ModuleNames>,
    record_type: RecordType,
    key_mode: KeyMode,
    load_scope: bool,
    keys: Arc<KeyAllocator>,
    entries: Vec<Entry>,
    snapshot: Vec<Entry>,
    last_load: Option<LoadOptions>,
    executed: HashMap<ServerAction, DateTime<Utc>>,
    listeners: Vec<Listener>,
}

impl Store {
    pub fn new(name: &str, record_type: RecordType, keys: Arc<KeyAllocator>) -> Self {
        Self {
            id: StoreId(keys.next_serial()),
            name: name.to_string(),
            modules: None,
            record_type,
            key_mode: KeyMode::Identity,
            load_scope: true,
            keys,
            entries: Vec::new(),
            snapshot: Vec::new(),
            last_load: None,
            executed: HashMap::new(),
            listeners: Vec::new(),
        }
    }

    /// Pin the store to fixed modules instead of routing by record type
    pub fn with_modules(mut self, modules: ModuleNames) -> Self {
        self.modules = Some(modules);
        self
    }

    pub fn with_key_mode(mut self, key_mode: KeyMode) -> Self {
        self.key_mode = key_mode;
        self
    }

    /// Never match a notification scope, whatever was loaded
    pub fn without_load_scope(mut self) -> Self {
        self.load_scope = false;
        self
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn modules(&self) -> Option<&ModuleNames> {
        self.modules.as_ref()
    }

    pub fn record_type(&self) -> &RecordType {
        &self.record_type
    }

    pub fn key_mode(&self) -> KeyMode {
        self.key_mode
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn records(&self) -> Vec<RecordHandle> {
        self.entries.iter().map(|e| e.record.clone()).collect()
    }

    pub fn keys(&self) -> Vec<RecordKey> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    pub fn get(&self, key: &RecordKey) -> Option<RecordHandle> {
        self.entries
            .iter()
            .find(|e| &e.key == key)
            .map(|e| e.record.clone())
    }

    pub fn contains(&self, record: &RecordHandle) -> bool {
        self.position(record).is_some()
    }

    pub fn key_of(&self, record: &RecordHandle) -> Option<RecordKey> {
        self.position(record).map(|i| self.entries[i].key.clone())
    }

    fn position(&self, record: &RecordHandle) -> Option<usize> {
        self.entries.iter().position(|e| e.record.ptr_eq(record))
    }

    /// Key the record holds here, or the key it would get when added
    pub fn key_for(&self, record: &RecordHandle) -> RecordKey {
        if let Some(key) = self.key_of(record) {
            return key;
        }
        self.mint_key(record)
    }

    fn mint_key(&self, record: &RecordHandle) -> RecordKey {
        match self.key_mode {
            KeyMode::Identity => match record.read().entry_id() {
                Some(id) if !id.is_empty() => RecordKey::new(id),
                _ => self.keys.allocate(),
            },
            KeyMode::Fresh => self.keys.allocate(),
        }
    }

    /// Add a record. Adding the same handle again is a no-op returning its
    /// existing key. In identity mode a different handle with the same
    /// entryid takes over the existing entry.
    pub fn add(&mut self, record: RecordHandle, origin: EventOrigin) -> RecordKey {
        if let Some(key) = self.key_of(&record) {
            return key;
        }

        let key = self.mint_key(&record);
        let existing = match self.key_mode {
            KeyMode::Identity => self.entries.iter().position(|e| e.key == key),
            KeyMode::Fresh => None,
        };

        match existing {
            Some(index) => {
                let old = std::mem::replace(&mut self.entries[index].record, record.clone());
                self.emit(StoreEvent::Remove {
                    store: self.id,
                    origin,
                    records: vec![old],
                });
            }
            None => self.entries.push(Entry {
                key: key.clone(),
                record: record.clone(),
            }),
        }

        debug!("{} added record {}", self.id, key);
        self.emit(StoreEvent::Add {
            store: self.id,
            origin,
            records: vec![record],
        });
        key
    }

    /// Remove a record by reference. Returns false if it was not present.
    pub fn remove(&mut self, record: &RecordHandle, origin: EventOrigin) -> bool {
        let Some(index) = self.position(record) else {
            return false;
        };
        let entry = self.entries.remove(index);
        debug!("{} removed record {}", self.id, entry.key);
        self.emit(StoreEvent::Remove {
            store: self.id,
            origin,
            records: vec![entry.record],
        });
        true
    }

    /// Remove a record without notifying subscribers
    pub fn remove_silent(&mut self, record: &RecordHandle) -> bool {
        match self.position(record) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop records the server reported as deleted, from both the working
    /// list and the snapshot
    pub fn remove_committed(&mut self, entry_ids: &[String]) -> Vec<RecordHandle> {
        let matches = |e: &Entry| {
            e.record
                .read()
                .entry_id()
                .map(|id| entry_ids.iter().any(|d| d == id))
                .unwrap_or(false)
        };

        let mut removed = Vec::new();
        self.entries.retain(|e| {
            if matches(e) {
                removed.push(e.record.clone());
                false
            } else {
                true
            }
        });
        self.snapshot.retain(|e| !matches(e));

        if !removed.is_empty() {
            self.emit(StoreEvent::Remove {
                store: self.id,
                origin: EventOrigin::Server,
                records: removed.clone(),
            });
        }
        removed
    }

    /// Apply a local edit to a record held by this store
    pub fn update_record<R>(
        &mut self,
        record: &RecordHandle,
        edit: impl FnOnce(&mut Record) -> R,
    ) -> Option<R> {
        self.position(record)?;
        let result = edit(&mut record.write());
        self.emit_update(vec![record.clone()], EventOrigin::Local, UpdateOperation::Edit);
        Some(result)
    }

    pub fn emit_update(
        &mut self,
        records: Vec<RecordHandle>,
        origin: EventOrigin,
        operation: UpdateOperation,
    ) {
        if records.is_empty() {
            return;
        }
        self.emit(StoreEvent::Update {
            store: self.id,
            origin,
            operation,
            records,
        });
    }

    /// Reconcile the index after the server assigned an identity. In
    /// identity mode the record is re-keyed by its entryid.
    pub fn remap(&mut self, record: &RecordHandle) {
        record.write().clear_creating();
        if self.key_mode != KeyMode::Identity {
            return;
        }
        let Some(index) = self.position(record) else {
            return;
        };
        let entry_id = record.read().entry_id().map(str::to_string);
        if let Some(id) = entry_id {
            let key = RecordKey::new(id);
            if self.entries[index].key != key {
                debug!("{} remapped {} to {}", self.id, self.entries[index].key, key);
                self.entries[index].key = key;
            }
        }
    }

    pub fn records_with_entry_id(&self, entry_id: &str) -> Vec<RecordHandle> {
        self.entries
            .iter()
            .filter(|e| e.record.read().entry_id() == Some(entry_id))
            .map(|e| e.record.clone())
            .collect()
    }

    /// Records with unsent edits or never written to the server
    pub fn modified_records(&self) -> Vec<RecordHandle> {
        self.entries
            .iter()
            .filter(|e| {
                let r = e.record.read();
                r.is_phantom() || r.has_changes()
            })
            .map(|e| e.record.clone())
            .collect()
    }

    /// Mark every other record sharing `record`'s series as stale
    pub fn mark_series_stale(&self, record: &RecordHandle) -> Vec<RecordHandle> {
        let series = match record.read().series_id() {
            Some(s) => s.to_string(),
            None => return Vec::new(),
        };

        let mut marked = Vec::new();
        for e in &self.entries {
            if e.record.ptr_eq(record) {
                continue;
            }
            let mut other = e.record.write();
            if other.series_id() == Some(series.as_str()) {
                other.mark_stale();
                marked.push(e.record.clone());
            }
        }
        if !marked.is_empty() {
            debug!("{} marked {} series instances stale", self.id, marked.len());
        }
        marked
    }

    pub fn last_load(&self) -> Option<&LoadOptions> {
        self.last_load.as_ref()
    }

    pub fn set_last_load(&mut self, options: LoadOptions) {
        self.last_load = Some(options);
    }

    /// Whether the last load listed the contents of `folder_entry_id`
    pub fn contains_folder_in_last_load(&self, folder_entry_id: &str) -> bool {
        if !self.load_scope {
            return false;
        }
        self.last_load
            .as_ref()
            .map(|l| l.folders.iter().any(|f| f.eq_ignore_ascii_case(folder_entry_id)))
            .unwrap_or(false)
    }

    /// Whether the last load listed children of mailbox `store_entry_id`
    pub fn contains_store_in_last_load(&self, store_entry_id: &str) -> bool {
        if !self.load_scope {
            return false;
        }
        self.last_load
            .as_ref()
            .map(|l| l.stores.iter().any(|s| s.eq_ignore_ascii_case(store_entry_id)))
            .unwrap_or(false)
    }

    /// Replace the contents with a server list and take a new snapshot
    pub fn load_records(&mut self, records: Vec<Record>) -> Vec<RecordHandle> {
        let mut entries: Vec<Entry> = Vec::with_capacity(records.len());
        for record in records {
            let handle = RecordHandle::new(record);
            let key = self.mint_key(&handle);
            match entries.iter_mut().find(|e| e.key == key) {
                Some(existing) => existing.record = handle,
                None => entries.push(Entry { key, record: handle }),
            }
        }

        self.entries = entries;
        self.commit_snapshot();
        let handles = self.records();
        debug!("{} loaded {} records", self.id, handles.len());
        self.emit(StoreEvent::Load {
            store: self.id,
            records: handles.clone(),
        });
        handles
    }

    /// Current membership becomes last-known-good
    pub fn commit_snapshot(&mut self) {
        self.snapshot = self.entries.clone();
    }

    /// Restore the snapshot membership and undo unsent edits
    pub fn revert(&mut self) {
        self.entries = self.snapshot.clone();
        let records = self.records();
        for r in &records {
            r.write().reject();
        }
        self.emit_update(records, EventOrigin::Local, UpdateOperation::Reject);
    }

    pub fn record_execution(&mut self, action: ServerAction, at: DateTime<Utc>) {
        self.executed.insert(action, at);
    }

    pub fn last_execution_time(&self, action: ServerAction) -> Option<DateTime<Utc>> {
        self.executed.get(&action).copied()
    }

    /// Receive every event of this store
    pub fn subscribe(&mut self) -> Receiver<StoreEvent> {
        self.subscribe_filtered(false)
    }

    /// Receive events; with `server_only` local edits are filtered out
    pub fn subscribe_filtered(&mut self, server_only: bool) -> Receiver<StoreEvent> {
        let (tx, rx) = flume::unbounded();
        self.listeners.push(Listener { tx, server_only });
        rx
    }

    pub fn emit(&mut self, event: StoreEvent) {
        let server = event.origin() == EventOrigin::Server;
        self.listeners.retain(|l| {
            if l.server_only && !server {
                return !l.tx.is_disconnected();
            }
            l.tx.send(event.clone()).is_ok()
        });
    }
}

/// Shared, lockable store
#[derive(Debug, Clone)]
pub struct StoreHandle {
    id: StoreId,
    inner: Arc<RwLock<Store>>,
}

impl StoreHandle {
    pub fn new(store: Store) -> Self {
        Self {
            id: store.id(),
            inner: Arc::new(RwLock::new(store)),
        }
    }

    /// Id without taking the lock
    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ptr_eq(&self, other: &StoreHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakStoreHandle {
        WeakStoreHandle {
            id: self.id,
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning store reference held by pending handlers and managers
#[derive(Debug, Clone)]
pub struct WeakStoreHandle {
    id: StoreId,
    inner: Weak<RwLock<Store>>,
}

impl WeakStoreHandle {
    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn upgrade(&self) -> Option<StoreHandle> {
        self.inner.upgrade().map(|inner| StoreHandle { id: self.id, inner })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> Store {
        Store::new("mail", RecordType::new("IPM.Note"), Arc::new(KeyAllocator::default()))
    }

    fn wire(entry_id: &str, goid: Option<&str>) -> Record {
        let mut props = json!({"message_class": "IPM.Appointment"});
        if let Some(g) = goid {
            props["goid"] = json!(g);
        }
        Record::from_wire_default(
            &json!({"entryid": entry_id, "parent_entryid": "F1", "props": props}),
            &RecordType::new("IPM.Appointment"),
        )
        .unwrap()
    }

    #[test]
    fn test_add_is_idempotent_per_handle() {
        let mut s = store();
        let rx = s.subscribe();
        let r = RecordHandle::new(wire("E1", None));
        let k1 = s.add(r.clone(), EventOrigin::Local);
        let k2 = s.add(r, EventOrigin::Local);
        assert_eq!(k1, k2);
        assert_eq!(k1.as_str(), "E1");
        assert_eq!(s.len(), 1);
        assert_eq!(rx.drain().count(), 1);
    }

    #[test]
    fn test_identity_mode_replaces_same_entryid() {
        let mut s = store();
        let a = RecordHandle::new(wire("E1", None));
        let b = RecordHandle::new(wire("E1", None));
        s.add(a.clone(), EventOrigin::Server);
        s.add(b.clone(), EventOrigin::Server);
        assert_eq!(s.len(), 1);
        assert!(s.contains(&b));
        assert!(!s.contains(&a));
    }

    #[test]
    fn test_fresh_mode_never_reuses_keys() {
        let mut s = store().with_key_mode(KeyMode::Fresh);
        let a = RecordHandle::new(wire("E1", None));
        let b = a.copy();
        let ka = s.add(a, EventOrigin::Local);
        let kb = s.add(b, EventOrigin::Local);
        assert_ne!(ka, kb);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut s = store();
        let r = RecordHandle::new(wire("E1", None));
        assert!(!s.remove(&r, EventOrigin::Local));
    }

    #[test]
    fn test_remap_rekeys_created_record() {
        let mut s = store();
        let r = RecordHandle::new(Record::new_phantom("IPM.Note", vec![]));
        r.write().set_creating();
        let before = s.add(r.clone(), EventOrigin::Local);
        assert!(before.as_str().starts_with("ext-record-"));

        r.write()
            .apply_server_data(&json!({"entryid": "NEW"}))
            .unwrap();
        s.remap(&r);
        assert_eq!(s.key_of(&r).unwrap().as_str(), "NEW");
        assert!(!r.read().is_creating());
    }

    #[test]
    fn test_last_load_matching_is_case_insensitive() {
        let mut s = store();
        s.set_last_load(LoadOptions::folder("ABCD"));
        assert!(s.contains_folder_in_last_load("abcd"));
        assert!(!s.contains_folder_in_last_load("F2"));
        assert!(!s.contains_store_in_last_load("ABCD"));
    }

    #[test]
    fn test_fresh_keyed_store_keeps_load_scope() {
        let mut s = store().with_key_mode(KeyMode::Fresh);
        s.set_last_load(LoadOptions::folder("F1"));
        assert!(s.contains_folder_in_last_load("F1"));

        let mut unscoped = store().without_load_scope();
        unscoped.set_last_load(LoadOptions::folder("F1"));
        assert!(!unscoped.contains_folder_in_last_load("F1"));
    }

    #[test]
    fn test_load_then_revert_restores_membership() {
        let mut s = store();
        s.load_records(vec![wire("E1", None), wire("E2", None)]);
        let extra = RecordHandle::new(wire("E3", None));
        s.add(extra.clone(), EventOrigin::Local);
        let first = s.records()[0].clone();
        first.write().set("subject", "changed");

        s.revert();
        assert_eq!(s.len(), 2);
        assert!(!s.contains(&extra));
        assert!(!first.read().has_changes());
    }

    #[test]
    fn test_remove_committed_drops_matching() {
        let mut s = store();
        s.load_records(vec![wire("E1", None), wire("E2", None)]);
        let removed = s.remove_committed(&["E2".to_string()]);
        assert_eq!(removed.len(), 1);
        assert_eq!(s.keys(), vec![RecordKey::new("E1")]);
    }

    #[test]
    fn test_series_siblings_marked_stale() {
        let mut s = store().with_key_mode(KeyMode::Fresh);
        let a = RecordHandle::new(wire("E1", Some("G1")));
        let b = RecordHandle::new(wire("E2", Some("G1")));
        let c = RecordHandle::new(wire("E3", Some("G2")));
        for r in [&a, &b, &c] {
            s.add(r.clone(), EventOrigin::Server);
        }

        let marked = s.mark_series_stale(&a);
        assert_eq!(marked.len(), 1);
        assert!(!a.read().is_stale());
        assert!(b.read().is_stale());
        assert!(!c.read().is_stale());
    }

    #[test]
    fn test_server_only_listener_skips_local_events() {
        let mut s = store();
        let all = s.subscribe();
        let server = s.subscribe_filtered(true);
        let r = RecordHandle::new(wire("E1", None));
        s.add(r.clone(), EventOrigin::Local);
        s.remove_committed(&["E1".to_string()]);

        assert_eq!(all.drain().count(), 2);
        let events: Vec<_> = server.drain().collect();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StoreEvent::Remove { origin, .. } => assert_eq!(*origin, EventOrigin::Server),
            _ => panic!("Expected Remove"),
        }
    }

    #[test]
    fn test_weak_handle_expires() {
        let handle = StoreHandle::new(store());
        let weak = handle.downgrade();
        assert!(weak.upgrade().is_some());
        drop(handle);
        assert!(weak.upgrade().is_none());
    }
}
