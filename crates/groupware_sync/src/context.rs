//! Session context
//!
//! Owns everything that lives for one client session: the key allocator,
//! the routing table, both store managers, the hierarchy store, the shadow
//! registry and the pending request table. All inbound traffic is processed
//! on the caller's thread through [`SyncContext::pump`] or
//! [`SyncContext::run_until_shutdown`], in arrival order.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::keys::KeyAllocator;
use crate::record::{RecordHandle, RecordType};
use crate::routing::{ModuleNames, ModuleRouter};
use crate::serializer::{DiffSerializer, WriteAction};
use crate::store::manager::StoreManager;
use crate::store::shadow::ShadowRegistry;
use crate::store::{KeyMode, LoadOptions, Store, StoreHandle, StoreId};
use crate::sync::correlator::{Completion, RequestOutcome, ResponseCorrelator};
use crate::sync::handler::process_response;
use crate::sync::notification::{NotificationResolver, ReloadRequest, ResolveScope};
use crate::sync::transport::{Inbound, RequestId, ServerAction, Transport};
use chrono::Utc;
use flume::{Receiver, Sender};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct SyncContext {
    config: SyncConfig,
    keys: Arc<KeyAllocator>,
    router: Arc<ModuleRouter>,
    correlator: ResponseCorrelator,
    resolver: NotificationResolver,
    transport: Arc<dyn Transport>,
    items: StoreManager,
    folders: StoreManager,
    hierarchy: StoreHandle,
    singletons: HashMap<String, StoreHandle>,
    shadow: ShadowRegistry,
    inbound_tx: Option<Sender<Inbound>>,
    inbound_rx: Receiver<Inbound>,
    reload_tx: Sender<ReloadRequest>,
    reload_rx: Receiver<ReloadRequest>,
    shut_down: bool,
}

impl SyncContext {
    pub fn new(config: SyncConfig, transport: Arc<dyn Transport>) -> Self {
        let keys = Arc::new(KeyAllocator::new(config.keys.prefix.clone()));
        let router = Arc::new(config.router());
        let correlator = ResponseCorrelator::new(router.clone(), DiffSerializer::default());
        let resolver = NotificationResolver::new(&config.notifications.hierarchy_modules);

        let mut items = StoreManager::new("item-manager");
        let mut folders = StoreManager::new("folder-manager");

        let hierarchy = StoreHandle::new(
            Store::new("hierarchy", RecordType::new("IPF"), keys.clone())
                .with_modules(ModuleNames::new("hierarchymodule", "hierarchymodule")),
        );
        folders.register(&hierarchy, false);

        let shadow = ShadowRegistry::new(
            keys.clone(),
            router.clone(),
            config.shadow.standalone,
            config.shadow.server_only,
        );
        shadow.attach(&mut items, &mut folders);

        let (inbound_tx, inbound_rx) = flume::unbounded();
        let (reload_tx, reload_rx) = flume::unbounded();

        info!("Sync context created");
        Self {
            config,
            keys,
            router,
            correlator,
            resolver,
            transport,
            items,
            folders,
            hierarchy,
            singletons: HashMap::new(),
            shadow,
            inbound_tx: Some(inbound_tx),
            inbound_rx,
            reload_tx,
            reload_rx,
            shut_down: false,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn router(&self) -> &ModuleRouter {
        &self.router
    }

    pub fn correlator(&self) -> &ResponseCorrelator {
        &self.correlator
    }

    pub fn shadow(&self) -> &ShadowRegistry {
        &self.shadow
    }

    pub fn hierarchy(&self) -> &StoreHandle {
        &self.hierarchy
    }

    pub fn item_manager(&mut self) -> &mut StoreManager {
        &mut self.items
    }

    pub fn folder_manager(&mut self) -> &mut StoreManager {
        &mut self.folders
    }

    /// Sender the transport pushes responses and notifications into. `None`
    /// once `run_until_shutdown` has taken over the channel.
    pub fn inbound(&self) -> Option<Sender<Inbound>> {
        self.inbound_tx.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// New item list store. The caller owns it; the managers only keep a
    /// weak reference, so dropping it unregisters it.
    pub fn create_store(&mut self, name: &str, record_type: &str) -> StoreHandle {
        let store = StoreHandle::new(Store::new(
            name,
            RecordType::new(record_type),
            self.keys.clone(),
        ));
        self.items.register(&store, false);
        debug!("Created {} ({})", store.id(), name);
        store
    }

    /// List store that keys every record freshly, for result sets where one
    /// entryid can show up more than once (search results, embedded messages)
    pub fn create_fresh_store(&mut self, name: &str, record_type: &str) -> StoreHandle {
        let store = StoreHandle::new(
            Store::new(name, RecordType::new(record_type), self.keys.clone())
                .with_key_mode(KeyMode::Fresh),
        );
        self.items.register(&store, false);
        debug!("Created {} ({}, fresh keys)", store.id(), name);
        store
    }

    /// New folder store for the hierarchy of one or more mailboxes
    pub fn create_folder_store(&mut self, name: &str) -> StoreHandle {
        let store = StoreHandle::new(
            Store::new(name, RecordType::new("IPF"), self.keys.clone())
                .with_modules(ModuleNames::new("hierarchymodule", "hierarchymodule")),
        );
        self.folders.register(&store, false);
        store
    }

    /// Store that receives every notification of a hierarchy notifier
    /// module, e.g. the address book for `addressbooknotifier`
    pub fn register_singleton(&mut self, module: &str, store: &StoreHandle) {
        self.singletons
            .insert(module.to_ascii_lowercase(), store.clone());
        self.folders.register(store, false);
    }

    pub fn release_store(&mut self, store: &StoreHandle) {
        self.items.unregister(store.id());
        self.folders.unregister(store.id());
        self.singletons.retain(|_, s| !s.ptr_eq(store));
    }

    pub fn load(
        &mut self,
        store: &StoreHandle,
        options: LoadOptions,
        completion: Option<Completion>,
    ) -> Result<RequestId, SyncError> {
        self.correlator
            .dispatch_list(self.transport.as_ref(), store, options, completion)
    }

    pub fn load_hierarchy(&mut self, completion: Option<Completion>) -> Result<RequestId, SyncError> {
        let hierarchy = self.hierarchy.clone();
        self.load(&hierarchy, LoadOptions::default(), completion)
    }

    /// Write a record: create when the server has never seen it, update
    /// otherwise
    pub fn save(
        &mut self,
        store: &StoreHandle,
        record: &RecordHandle,
        completion: Option<Completion>,
    ) -> Result<RequestId, SyncError> {
        let action = if record.read().is_phantom() {
            WriteAction::Create
        } else {
            WriteAction::Update
        };
        self.correlator.dispatch_write(
            self.transport.as_ref(),
            store,
            vec![record.clone()],
            action,
            completion,
        )
    }

    pub fn destroy(
        &mut self,
        store: &StoreHandle,
        record: &RecordHandle,
        completion: Option<Completion>,
    ) -> Result<RequestId, SyncError> {
        self.correlator.dispatch_write(
            self.transport.as_ref(),
            store,
            vec![record.clone()],
            WriteAction::Destroy,
            completion,
        )
    }

    /// Fetch the full record unless it is already open and not stale, in
    /// which case the completion runs immediately and no request is sent
    pub fn open(
        &mut self,
        store: &StoreHandle,
        record: &RecordHandle,
        completion: Option<Completion>,
    ) -> Result<Option<RequestId>, SyncError> {
        let fresh = {
            let r = record.read();
            r.is_opened() && !r.is_stale()
        };
        if fresh {
            if let Some(completion) = completion {
                completion(RequestOutcome {
                    success: true,
                    action: ServerAction::Open,
                    records: vec![record.clone()],
                    error: None,
                });
            }
            return Ok(None);
        }

        self.correlator
            .dispatch_open(self.transport.as_ref(), store, record.clone(), completion)
            .map(Some)
    }

    /// Start editing: a private copy is registered in the shadow registry
    pub fn begin_edit(&self, record: &RecordHandle) -> RecordHandle {
        let copy = record.copy();
        let key = self.shadow.add(copy.clone());
        debug!("Editing {} as {}", record.read().record_type(), key);
        copy
    }

    pub fn end_edit(&self, copy: &RecordHandle) -> bool {
        self.shadow.remove(copy)
    }

    /// Save a shadow copy. Once confirmed, the write is copied into every
    /// list store holding the same record.
    pub fn save_shadow(
        &mut self,
        copy: &RecordHandle,
        completion: Option<Completion>,
    ) -> Result<RequestId, SyncError> {
        if !self.shadow.contains(copy) {
            return Err(SyncError::InvalidInput(
                "record is not open for editing".into(),
            ));
        }
        let store = self.shadow.store().clone();
        self.save(&store, copy, completion)
    }

    /// Process everything currently queued. Returns the number of inbound
    /// messages handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(msg) = self.inbound_rx.try_recv() {
            handled += 1;
            if let Err(e) = self.process(msg) {
                warn!("Dropped inbound message: {}", e);
            }
            if self.shut_down {
                break;
            }
        }
        self.process_reloads();
        self.relay();
        handled
    }

    /// Apply one inbound message
    pub fn process(&mut self, msg: Inbound) -> Result<(), SyncError> {
        match msg {
            Inbound::Response {
                request_id,
                module,
                payload,
            } => {
                self.correlator
                    .handle_response(request_id, &module, &payload, Utc::now())?;
            }
            Inbound::Notification { module, payload } => {
                self.handle_notification(&module, &payload);
            }
            Inbound::Shutdown => self.shutdown(),
        }
        self.relay();
        Ok(())
    }

    /// Resolve and apply a notification. Returns the stores it was applied
    /// to; empty when it was dropped.
    pub fn handle_notification(&mut self, module: &str, payload: &Value) -> Vec<StoreId> {
        let scope = ResolveScope {
            items: &self.items,
            folders: &self.folders,
            hierarchy: Some(&self.hierarchy),
            singletons: &self.singletons,
            reloads: &self.reload_tx,
        };
        let Some(mut handler) = self.resolver.resolve(module, payload, &scope) else {
            return Vec::new();
        };

        let stores = handler.bound_stores();
        info!("{}: notification applied to {} stores", module, stores.len());
        process_response(handler.as_mut(), module, payload, Utc::now());
        stores
    }

    /// Issue the list requests notifications asked for
    pub fn process_reloads(&mut self) -> usize {
        let mut issued = 0;
        while let Ok(req) = self.reload_rx.try_recv() {
            let Some(store) = req.store.upgrade() else {
                continue;
            };
            match self.load(&store, req.options, None) {
                Ok(_) => issued += 1,
                Err(e) => error!("Failed to reload {}: {}", store.id(), e),
            }
        }
        issued
    }

    /// Let both managers forward and propagate store events until quiet
    pub fn relay(&mut self) {
        while self.items.relay() + self.folders.relay() > 0 {}
    }

    /// Process inbound traffic until a shutdown message arrives or every
    /// sender handed out by `inbound` is gone. The context drops its own
    /// sender first, so a transport that goes away ends the loop.
    pub async fn run_until_shutdown(&mut self) {
        self.inbound_tx = None;
        let rx = self.inbound_rx.clone();
        while !self.shut_down {
            match rx.recv_async().await {
                Ok(msg) => {
                    if let Err(e) = self.process(msg) {
                        warn!("Dropped inbound message: {}", e);
                    }
                    self.process_reloads();
                }
                Err(_) => {
                    info!("Inbound channel closed");
                    self.shutdown();
                }
            }
        }
    }

    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        let pending = self.correlator.pending_count();
        if pending > 0 {
            warn!("Shutting down with {} requests in flight", pending);
        }
        self.shadow.detach(&mut self.items, &mut self.folders);
        self.singletons.clear();
        self.shut_down = true;
        info!("Sync context shut down");
    }
}
