//! Store managers
//!
//! A manager knows every live store of one kind (item lists or folder
//! hierarchies). It answers "which stores loaded this folder / mailbox" for
//! the notification resolver, multiplexes the stores' events to its own
//! subscribers, and copies server-confirmed writes into other stores that
//! hold the same record.

use super::{EventOrigin, StoreEvent, StoreHandle, StoreId, UpdateOperation, WeakStoreHandle};
use crate::record::{Record, RecordHandle};
use crate::sync::transport::ServerAction;
use flume::{Receiver, Sender};
use tracing::{debug, info};

#[derive(Debug)]
struct Registration {
    store: WeakStoreHandle,
    server_only: bool,
    rx: Receiver<StoreEvent>,
}

#[derive(Debug)]
struct Listener {
    tx: Sender<StoreEvent>,
    server_only: bool,
}

#[derive(Debug)]
pub struct StoreManager {
    name: String,
    registrations: Vec<Registration>,
    listeners: Vec<Listener>,
}

impl StoreManager {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            registrations: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Track a store. With `server_only` the manager only sees the store's
    /// server-originated events.
    pub fn register(&mut self, store: &StoreHandle, server_only: bool) {
        if self.is_registered(store.id()) {
            return;
        }
        let rx = store.write().subscribe_filtered(server_only);
        debug!("{}: registered {}", self.name, store.id());
        self.registrations.push(Registration {
            store: store.downgrade(),
            server_only,
            rx,
        });
    }

    pub fn unregister(&mut self, id: StoreId) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.store.id() != id);
        before != self.registrations.len()
    }

    pub fn is_registered(&self, id: StoreId) -> bool {
        self.registrations.iter().any(|r| r.store.id() == id)
    }

    pub fn is_server_only(&self, id: StoreId) -> Option<bool> {
        self.registrations
            .iter()
            .find(|r| r.store.id() == id)
            .map(|r| r.server_only)
    }

    /// Receive the events of every registered store
    pub fn subscribe(&mut self, server_only: bool) -> Receiver<StoreEvent> {
        let (tx, rx) = flume::unbounded();
        self.listeners.push(Listener { tx, server_only });
        rx
    }

    /// Live registered stores, in registration order
    pub fn stores(&self) -> Vec<StoreHandle> {
        self.registrations
            .iter()
            .filter_map(|r| r.store.upgrade())
            .collect()
    }

    /// Forget stores that have been dropped
    pub fn prune(&mut self) {
        let name = &self.name;
        self.registrations.retain(|r| {
            let alive = r.store.is_alive();
            if !alive {
                debug!("{}: pruned dropped {}", name, r.store.id());
            }
            alive
        });
    }

    /// Stores whose last load listed one of `folders`
    pub fn stores_for_folders(&self, folders: &[String]) -> Vec<StoreHandle> {
        self.stores()
            .into_iter()
            .filter(|s| {
                let store = s.read();
                folders.iter().any(|f| store.contains_folder_in_last_load(f))
            })
            .collect()
    }

    /// Stores whose last load listed children of one of `mailboxes`
    pub fn stores_for_mailboxes(&self, mailboxes: &[String]) -> Vec<StoreHandle> {
        self.stores()
            .into_iter()
            .filter(|s| {
                let store = s.read();
                mailboxes.iter().any(|m| store.contains_store_in_last_load(m))
            })
            .collect()
    }

    /// Drain pending store events, forward them to subscribers and
    /// propagate completed writes. Returns the number of events handled.
    pub fn relay(&mut self) -> usize {
        self.prune();

        let pending: Vec<StoreEvent> = self
            .registrations
            .iter()
            .flat_map(|r| r.rx.drain().collect::<Vec<_>>())
            .collect();

        for event in &pending {
            if let StoreEvent::Write {
                store,
                action,
                records,
            } = event
            {
                self.propagate_write(*store, *action, records);
            }
            self.forward(event);
        }
        pending.len()
    }

    fn forward(&mut self, event: &StoreEvent) {
        let server = event.origin() == EventOrigin::Server;
        self.listeners.retain(|l| {
            if l.server_only && !server {
                return !l.tx.is_disconnected();
            }
            l.tx.send(event.clone()).is_ok()
        });
    }

    fn propagate_write(
        &self,
        source: StoreId,
        action: ServerAction,
        records: &[RecordHandle],
    ) {
        // Snapshot the written records so no source lock is held below
        let written: Vec<(String, Record, RecordHandle)> = records
            .iter()
            .filter_map(|h| {
                let r = h.read();
                let id = r.entry_id()?.to_string();
                Some((id, r.clone(), h.clone()))
            })
            .collect();
        if written.is_empty() {
            return;
        }

        for target in self.stores() {
            if target.id() == source {
                continue;
            }
            let mut store = target.write();
            match action {
                ServerAction::Delete => {
                    let ids: Vec<String> = written.iter().map(|(id, _, _)| id.clone()).collect();
                    let removed = store.remove_committed(&ids);
                    if !removed.is_empty() {
                        info!(
                            "{}: removed {} deleted records from {}",
                            self.name,
                            removed.len(),
                            target.id()
                        );
                    }
                }
                ServerAction::Save | ServerAction::Open => {
                    let mut updated = Vec::new();
                    for (id, data, handle) in &written {
                        for other in store.records_with_entry_id(id) {
                            if other.ptr_eq(handle) {
                                continue;
                            }
                            let mut r = other.write();
                            if r.has_changes() {
                                debug!(
                                    "{}: kept unsaved edits of {} in {}",
                                    self.name,
                                    id,
                                    target.id()
                                );
                                continue;
                            }
                            r.merge_from(data);
                            r.commit();
                            drop(r);
                            updated.push(other);
                        }
                    }
                    if !updated.is_empty() {
                        debug!(
                            "{}: propagated {} records into {}",
                            self.name,
                            updated.len(),
                            target.id()
                        );
                        store.emit_update(updated, EventOrigin::Server, UpdateOperation::Commit);
                    }
                }
                ServerAction::List => {}
            }
        }
    }
}
