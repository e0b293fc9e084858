//! Unsolicited notification routing
//!
//! Notifications name the folders or mailboxes they touch but never the
//! store that should consume them. The resolver finds every live store whose
//! last load covered those identifiers and builds one handler per store.

use super::handler::{collect_items, CompositeHandler, ResponseHandler};
use crate::record::{Record, RecordHandle, RecordType};
use crate::store::manager::StoreManager;
use crate::store::{
    EventOrigin, LoadOptions, StoreHandle, StoreId, UpdateOperation, WeakStoreHandle,
};
use crate::sync::transport::ServerAction;
use chrono::{DateTime, Utc};
use flume::Sender;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Notifier modules whose payloads describe folders rather than items
pub const DEFAULT_HIERARCHY_MODULES: [&str; 3] =
    ["hierarchynotifier", "newmailnotifier", "addressbooknotifier"];

/// Ask the context to list a store again with its last load options
#[derive(Debug, Clone)]
pub struct ReloadRequest {
    pub store: WeakStoreHandle,
    pub options: LoadOptions,
}

/// Everything the resolver may route a notification to
pub struct ResolveScope<'a> {
    pub items: &'a StoreManager,
    pub folders: &'a StoreManager,
    pub hierarchy: Option<&'a StoreHandle>,
    pub singletons: &'a HashMap<String, StoreHandle>,
    pub reloads: &'a Sender<ReloadRequest>,
}

#[derive(Debug, Clone)]
pub struct NotificationResolver {
    hierarchy_modules: HashSet<String>,
}

impl NotificationResolver {
    pub fn new<I, S>(hierarchy_modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hierarchy_modules: hierarchy_modules
                .into_iter()
                .map(|m| m.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_hierarchy_module(&self, module: &str) -> bool {
        self.hierarchy_modules.contains(&module.to_ascii_lowercase())
    }

    /// Build the handler(s) for a notification, or `None` when no live
    /// store is affected
    pub fn resolve(
        &self,
        module: &str,
        payload: &Value,
        scope: &ResolveScope<'_>,
    ) -> Option<Box<dyn ResponseHandler>> {
        let Some(sections) = payload.as_object() else {
            warn!("{}: notification payload is not an object, dropping", module);
            return None;
        };

        let mut handlers: Vec<Box<dyn ResponseHandler>> = if self.is_hierarchy_module(module) {
            self.folder_handlers(module, sections, scope)
        } else {
            item_handlers(sections, scope)
        };

        match handlers.len() {
            0 => {
                debug!("{}: no store affected, dropping notification", module);
                None
            }
            1 => handlers.pop(),
            n => {
                debug!("{}: notification fans out to {} stores", module, n);
                Some(Box::new(CompositeHandler::new(handlers)))
            }
        }
    }

    fn folder_handlers(
        &self,
        module: &str,
        sections: &Map<String, Value>,
        scope: &ResolveScope<'_>,
    ) -> Vec<Box<dyn ResponseHandler>> {
        let mailboxes = collect_ids(sections, "store_entryid", folder_items);

        let mut targets: Vec<(StoreHandle, bool)> = scope
            .folders
            .stores_for_mailboxes(&mailboxes)
            .into_iter()
            .map(|s| (s, false))
            .collect();
        if let Some(hierarchy) = scope.hierarchy {
            add_target(&mut targets, hierarchy.clone(), true);
        }
        if let Some(single) = scope.singletons.get(&module.to_ascii_lowercase()) {
            add_target(&mut targets, single.clone(), true);
        }

        targets
            .into_iter()
            .map(|(store, accept_all)| {
                Box::new(FolderNotificationHandler::new(&store, accept_all)) as Box<dyn ResponseHandler>
            })
            .collect()
    }
}

impl Default for NotificationResolver {
    fn default() -> Self {
        Self::new(DEFAULT_HIERARCHY_MODULES)
    }
}

fn item_handlers(
    sections: &Map<String, Value>,
    scope: &ResolveScope<'_>,
) -> Vec<Box<dyn ResponseHandler>> {
    let folders = collect_ids(sections, "parent_entryid", collect_items);
    scope
        .items
        .stores_for_folders(&folders)
        .into_iter()
        .map(|store| {
            Box::new(ItemNotificationHandler::new(&store, scope.reloads.clone()))
                as Box<dyn ResponseHandler>
        })
        .collect()
}

fn add_target(targets: &mut Vec<(StoreHandle, bool)>, store: StoreHandle, accept_all: bool) {
    match targets.iter_mut().find(|(s, _)| s.id() == store.id()) {
        Some(existing) => existing.1 |= accept_all,
        None => targets.push((store, accept_all)),
    }
}

/// Distinct string values of `prop` over the items of every section
fn collect_ids(
    sections: &Map<String, Value>,
    prop: &str,
    items: fn(&Value) -> Vec<&Value>,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for section in sections.values() {
        for item in items(section) {
            if let Some(id) = item.get(prop).and_then(Value::as_str) {
                if !out.iter().any(|o| o == id) {
                    out.push(id.to_string());
                }
            }
        }
    }
    out
}

/// Folder entries of a hierarchy section. Folders may be listed directly or
/// nested under a `folders` object, itself possibly inside mailbox items.
fn folder_items(section: &Value) -> Vec<&Value> {
    let source = section.get("folders").unwrap_or(section);
    let mut out = Vec::new();
    for item in collect_items(source) {
        if item.get("folders").is_some() {
            out.extend(folder_items(item));
        } else {
            out.push(item);
        }
    }
    out
}

fn entry_id(item: &Value) -> Option<&str> {
    item.get("entryid").and_then(Value::as_str)
}

/// Applies item notifications to one list store
pub struct ItemNotificationHandler {
    store: WeakStoreHandle,
    target: Option<StoreHandle>,
    received: DateTime<Utc>,
    reload: bool,
    reloads: Sender<ReloadRequest>,
}

impl ItemNotificationHandler {
    pub fn new(store: &StoreHandle, reloads: Sender<ReloadRequest>) -> Self {
        Self {
            store: store.downgrade(),
            target: None,
            received: Utc::now(),
            reload: false,
            reloads,
        }
    }

    /// Items whose parent folder this store actually listed
    fn relevant<'v>(store: &StoreHandle, data: &'v Value) -> Vec<&'v Value> {
        let s = store.read();
        collect_items(data)
            .into_iter()
            .filter(|item| {
                item.get("parent_entryid")
                    .and_then(Value::as_str)
                    .map(|f| s.contains_folder_in_last_load(f))
                    .unwrap_or(false)
            })
            .collect()
    }

    fn on_create(&mut self, store: &StoreHandle, items: &[&Value]) {
        if items.is_empty() {
            return;
        }
        let last_list = store.read().last_execution_time(ServerAction::List);
        match last_list {
            Some(t) if t >= self.received => {
                debug!("{} listed after the notification, no reload", store.id());
            }
            _ => self.reload = true,
        }
    }

    fn on_update(&mut self, store: &StoreHandle, items: &[&Value]) -> bool {
        let mut ok = true;
        let mut updated: Vec<RecordHandle> = Vec::new();
        let mut s = store.write();

        for item in items {
            let Some(id) = entry_id(item) else { continue };
            let new_class = item
                .get("message_class")
                .or_else(|| item.pointer("/props/message_class"))
                .and_then(Value::as_str)
                .map(RecordType::new);

            for record in s.records_with_entry_id(id) {
                let mut r = record.write();
                // Narrowing to a subclass keeps every property the record
                // already has; anything else needs a fresh list.
                if let Some(class) = &new_class {
                    if !r.record_type().is_subclass_of(class) {
                        info!(
                            "{}: {} changed class {} -> {}, reloading",
                            s.id(),
                            id,
                            r.record_type(),
                            class
                        );
                        self.reload = true;
                    }
                }
                if let Err(e) = r.apply_server_data(item) {
                    warn!("Failed to apply notification to {}: {}", id, e);
                    ok = false;
                    continue;
                }
                drop(r);
                updated.push(record);
            }
        }

        s.emit_update(updated, EventOrigin::Server, UpdateOperation::Commit);
        ok
    }

    fn on_delete(&mut self, store: &StoreHandle, items: &[&Value]) {
        let ids: Vec<String> = items
            .iter()
            .filter_map(|i| entry_id(i).map(str::to_string))
            .collect();
        if ids.is_empty() {
            return;
        }
        let removed = store.write().remove_committed(&ids);
        debug!("{}: removed {} deleted records", store.id(), removed.len());
    }
}

impl ResponseHandler for ItemNotificationHandler {
    fn start(&mut self, module: &str, received: DateTime<Utc>) -> bool {
        self.received = received;
        self.target = self.store.upgrade();
        if self.target.is_none() {
            debug!("{}: target store dropped before notification", module);
        }
        self.target.is_some()
    }

    fn handle(&mut self, action: &str, data: &Value) -> bool {
        let Some(store) = self.target.clone() else {
            return false;
        };
        let items = Self::relevant(&store, data);
        match action {
            "create" => {
                self.on_create(&store, &items);
                true
            }
            "update" => self.on_update(&store, &items),
            "delete" => {
                self.on_delete(&store, &items);
                true
            }
            other => {
                debug!("Ignoring notification section {}", other);
                true
            }
        }
    }

    fn done(&mut self, _success: bool) {
        let Some(store) = self.target.take() else {
            return;
        };
        if !self.reload {
            return;
        }
        self.reload = false;

        let options = store.read().last_load().cloned().unwrap_or_default();
        info!("{} scheduled for reload", store.id());
        if self
            .reloads
            .send(ReloadRequest {
                store: store.downgrade(),
                options,
            })
            .is_err()
        {
            warn!("Reload channel closed, {} not reloaded", store.id());
        }
    }

    fn bound_stores(&self) -> Vec<StoreId> {
        vec![self.store.id()]
    }
}

/// Applies hierarchy notifications to one folder store
pub struct FolderNotificationHandler {
    store: WeakStoreHandle,
    target: Option<StoreHandle>,
    accept_all: bool,
}

impl FolderNotificationHandler {
    /// With `accept_all` every folder is applied, otherwise only folders of
    /// mailboxes the store listed
    pub fn new(store: &StoreHandle, accept_all: bool) -> Self {
        Self {
            store: store.downgrade(),
            target: None,
            accept_all,
        }
    }

    fn wanted<'v>(&self, store: &StoreHandle, data: &'v Value) -> Vec<&'v Value> {
        let s = store.read();
        folder_items(data)
            .into_iter()
            .filter(|item| entry_id(item).is_some())
            .filter(|item| {
                self.accept_all
                    || item
                        .get("store_entryid")
                        .and_then(Value::as_str)
                        .map(|m| s.contains_store_in_last_load(m))
                        .unwrap_or(false)
            })
            .collect()
    }

    fn upsert(&self, store: &StoreHandle, items: &[&Value]) -> bool {
        let mut ok = true;
        let mut updated = Vec::new();
        let mut s = store.write();

        for item in items {
            let Some(id) = entry_id(item) else { continue };
            let existing = s.records_with_entry_id(id);
            if existing.is_empty() {
                match Record::from_wire_default(item, &RecordType::new("IPF")) {
                    Ok(record) => {
                        s.add(RecordHandle::new(record), EventOrigin::Server);
                    }
                    Err(e) => {
                        warn!("Skipping malformed folder {}: {}", id, e);
                        ok = false;
                    }
                }
                continue;
            }
            for record in existing {
                if let Err(e) = record.write().apply_server_data(item) {
                    warn!("Failed to apply folder {}: {}", id, e);
                    ok = false;
                    continue;
                }
                updated.push(record);
            }
        }

        s.emit_update(updated, EventOrigin::Server, UpdateOperation::Commit);
        ok
    }
}

impl ResponseHandler for FolderNotificationHandler {
    fn start(&mut self, _module: &str, _received: DateTime<Utc>) -> bool {
        self.target = self.store.upgrade();
        self.target.is_some()
    }

    fn handle(&mut self, action: &str, data: &Value) -> bool {
        let Some(store) = self.target.clone() else {
            return false;
        };
        let items = self.wanted(&store, data);
        if items.is_empty() {
            return true;
        }
        match action {
            "create" | "update" => self.upsert(&store, &items),
            "delete" => {
                let ids: Vec<String> = items
                    .iter()
                    .filter_map(|i| entry_id(i).map(str::to_string))
                    .collect();
                store.write().remove_committed(&ids);
                true
            }
            _ => true,
        }
    }

    fn done(&mut self, _success: bool) {
        self.target = None;
    }

    fn bound_stores(&self) -> Vec<StoreId> {
        vec![self.store.id()]
    }
}
