//! Shadow registry
//!
//! Side table of records currently open for editing. Entries are private
//! copies, so edits never leak into list stores until they are saved. Each
//! entry is keyed by a freshly allocated key, never by the record's entryid,
//! because the same logical record can be open more than once.
//!
//! The registry holds records of every type and routes each one to its
//! backend module individually.

use super::manager::StoreManager;
use super::{EventOrigin, KeyMode, Store, StoreHandle, StoreId};
use crate::keys::{KeyAllocator, RecordKey};
use crate::record::{RecordHandle, RecordType};
use crate::routing::ModuleRouter;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct ShadowRegistry {
    store: StoreHandle,
    router: Arc<ModuleRouter>,
    standalone: bool,
    server_only: bool,
}

impl ShadowRegistry {
    pub fn new(
        keys: Arc<KeyAllocator>,
        router: Arc<ModuleRouter>,
        standalone: bool,
        server_only: bool,
    ) -> Self {
        let store = Store::new("shadow", RecordType::new("IPM"), keys)
            .with_key_mode(KeyMode::Fresh)
            .without_load_scope();
        Self {
            store: StoreHandle::new(store),
            router,
            standalone,
            server_only,
        }
    }

    pub fn id(&self) -> StoreId {
        self.store.id()
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn is_standalone(&self) -> bool {
        self.standalone
    }

    /// Hook into the item and folder managers. A standalone registry stays
    /// detached; a server-only one sees only server-confirmed events.
    pub fn attach(&self, items: &mut StoreManager, folders: &mut StoreManager) {
        if self.standalone {
            return;
        }
        items.register(&self.store, self.server_only);
        folders.register(&self.store, self.server_only);
        debug!(
            "shadow registry attached to {} and {} (server_only={})",
            items.name(),
            folders.name(),
            self.server_only
        );
    }

    pub fn detach(&self, items: &mut StoreManager, folders: &mut StoreManager) {
        items.unregister(self.store.id());
        folders.unregister(self.store.id());
    }

    /// Existing key of this exact record object, or a freshly minted one
    pub fn key_for(&self, record: &RecordHandle) -> RecordKey {
        self.store.read().key_for(record)
    }

    /// Register a record; adding the same object twice returns its key
    pub fn add(&self, record: RecordHandle) -> RecordKey {
        self.store.write().add(record, EventOrigin::Local)
    }

    pub fn remove(&self, record: &RecordHandle) -> bool {
        self.store.write().remove(record, EventOrigin::Local)
    }

    /// Remove without a `remove` event, used when an editor closes after a
    /// successful save
    pub fn remove_silent(&self, record: &RecordHandle) -> bool {
        self.store.write().remove_silent(record)
    }

    pub fn contains(&self, record: &RecordHandle) -> bool {
        self.store.read().contains(record)
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    pub fn records(&self) -> Vec<RecordHandle> {
        self.store.read().records()
    }

    /// Only discards the creation marker; keys never change
    pub fn remap(&self, record: &RecordHandle) {
        self.store.write().remap(record);
    }

    pub fn list_module_name(&self, record: &RecordHandle) -> String {
        self.router
            .list_module_name(record.read().record_type())
            .to_string()
    }

    pub fn item_module_name(&self, record: &RecordHandle) -> String {
        self.router
            .item_module_name(record.read().record_type())
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::store::LoadOptions;
    use serde_json::json;

    fn registry(standalone: bool) -> ShadowRegistry {
        ShadowRegistry::new(
            Arc::new(KeyAllocator::default()),
            Arc::new(ModuleRouter::default()),
            standalone,
            true,
        )
    }

    fn appointment() -> RecordHandle {
        RecordHandle::new(
            Record::from_wire_default(
                &json!({"entryid": "E1", "props": {"message_class": "IPM.Appointment"}}),
                &RecordType::new("IPM"),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_copy_gets_distinct_key() {
        let reg = registry(false);
        let r = appointment();
        let minted = reg.key_for(&r);
        let added = reg.add(r.copy());
        assert_ne!(minted, added);
    }

    #[test]
    fn test_add_same_object_is_idempotent() {
        let reg = registry(false);
        let r = appointment();
        let k1 = reg.add(r.clone());
        let k2 = reg.add(r.clone());
        assert_eq!(k1, k2);
        assert_eq!(reg.key_for(&r), k1);
        assert_eq!(reg.len(), 1);

        assert!(reg.remove(&r));
        assert!(!reg.remove(&r));
    }

    #[test]
    fn test_two_copies_coexist() {
        let reg = registry(false);
        let r = appointment();
        let a = reg.add(r.copy());
        let b = reg.add(r.copy());
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_routes_per_record_type() {
        let reg = registry(false);
        let task = RecordHandle::new(Record::new_phantom("IPM.Task", vec![]));
        assert_eq!(reg.item_module_name(&appointment()), "appointmentitemmodule");
        assert_eq!(reg.list_module_name(&task), "tasklistmodule");
        let odd = RecordHandle::new(Record::new_phantom("Custom", vec![]));
        assert_eq!(reg.item_module_name(&odd), "createmailitemmodule");
    }

    #[test]
    fn test_remap_keeps_key() {
        let reg = registry(false);
        let r = RecordHandle::new(Record::new_phantom("IPM.Note", vec![]));
        r.write().set_creating();
        let key = reg.add(r.clone());
        r.write().apply_server_data(&json!({"entryid": "NEW"})).unwrap();
        reg.remap(&r);
        assert_eq!(reg.key_for(&r), key);
        assert!(!r.read().is_creating());
    }

    #[test]
    fn test_standalone_is_not_attached() {
        let mut items = StoreManager::new("items");
        let mut folders = StoreManager::new("folders");
        registry(true).attach(&mut items, &mut folders);
        assert!(items.stores().is_empty());

        let reg = registry(false);
        reg.attach(&mut items, &mut folders);
        assert_eq!(items.is_server_only(reg.id()), Some(true));
        reg.store().write().set_last_load(LoadOptions::folder("F1"));
        assert!(!reg.store().read().contains_folder_in_last_load("F1"));
        assert!(items.stores_for_folders(&["F1".to_string()]).is_empty());
    }

    #[test]
    fn test_silent_remove_emits_nothing() {
        let reg = registry(false);
        let rx = reg.store().write().subscribe();
        let r = appointment();
        reg.add(r.clone());
        rx.drain().for_each(drop);
        assert!(reg.remove_silent(&r));
        assert_eq!(rx.drain().count(), 0);
    }
}
