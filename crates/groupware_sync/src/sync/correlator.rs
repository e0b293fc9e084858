//! Request dispatch and response correlation
//!
//! Every outgoing request gets an id and a handler bound to the records it
//! carried. When the response arrives the handler matches returned items
//! back to those exact record objects, applies the server's values, re-keys
//! the owning store and finally runs the caller's completion.

use super::handler::{collect_items, process_response, ResponseHandler};
use super::transport::{OutboundRequest, RequestId, ServerAction, Transport};
use crate::error::SyncError;
use crate::record::{PropValue, Record, RecordHandle, DEFAULT_ID_PROPS};
use crate::routing::ModuleRouter;
use crate::serializer::{DiffSerializer, WriteAction};
use crate::store::{
    EventOrigin, LoadOptions, StoreEvent, StoreHandle, StoreId, UpdateOperation, WeakStoreHandle,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What the caller of a request learns when it completes
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub success: bool,
    pub action: ServerAction,
    pub records: Vec<RecordHandle>,
    pub error: Option<SyncError>,
}

pub type Completion = Box<dyn FnOnce(RequestOutcome) + Send>;

struct PendingRequest {
    module: String,
    action: ServerAction,
    handler: Box<dyn ResponseHandler>,
}

pub struct ResponseCorrelator {
    pending: HashMap<RequestId, PendingRequest>,
    active: HashMap<ServerAction, Vec<RequestId>>,
    next_id: u64,
    router: Arc<ModuleRouter>,
    serializer: DiffSerializer,
}

impl ResponseCorrelator {
    pub fn new(router: Arc<ModuleRouter>, serializer: DiffSerializer) -> Self {
        Self {
            pending: HashMap::new(),
            active: HashMap::new(),
            next_id: 1,
            router,
            serializer,
        }
    }

    pub fn router(&self) -> &ModuleRouter {
        &self.router
    }

    pub fn serializer(&self) -> &DiffSerializer {
        &self.serializer
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether a request for `action` (any action when `None`) is in flight
    pub fn is_executing(&self, action: Option<ServerAction>) -> bool {
        match action {
            Some(a) => self.active.get(&a).map(|ids| !ids.is_empty()).unwrap_or(false),
            None => !self.pending.is_empty(),
        }
    }

    fn item_module(&self, store: &StoreHandle, record: &RecordHandle) -> String {
        if let Some(fixed) = store.read().modules() {
            return fixed.item.clone();
        }
        self.router
            .item_module_name(record.read().record_type())
            .to_string()
    }

    /// Send a request and remember `handler` for its response
    pub fn dispatch_request(
        &mut self,
        transport: &dyn Transport,
        module: &str,
        action: ServerAction,
        payload: Value,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<RequestId, SyncError> {
        let request_id = RequestId(self.next_id);
        self.next_id += 1;

        transport.send(OutboundRequest {
            request_id,
            module: module.to_string(),
            action,
            payload,
        })?;

        info!("Dispatched {} request {} to {}", action, request_id, module);
        self.pending.insert(
            request_id,
            PendingRequest {
                module: module.to_string(),
                action,
                handler,
            },
        );
        self.active.entry(action).or_default().push(request_id);
        Ok(request_id)
    }

    /// Serialize and send a write for records held by `store`. Serialization
    /// errors are returned before anything is sent.
    pub fn dispatch_write(
        &mut self,
        transport: &dyn Transport,
        store: &StoreHandle,
        records: Vec<RecordHandle>,
        action: WriteAction,
        completion: Option<Completion>,
    ) -> Result<RequestId, SyncError> {
        let Some(first) = records.first() else {
            return Err(SyncError::InvalidInput("write without records".into()));
        };
        let module = self.item_module(store, first);

        let mut payloads = Vec::with_capacity(records.len());
        for r in &records {
            payloads.push(self.serializer.serialize(&r.read(), action)?);
        }
        let payload = if payloads.len() == 1 {
            payloads.remove(0)
        } else {
            Value::Array(payloads)
        };

        let server_action = ServerAction::for_write(action);
        let creating = if action == WriteAction::Create {
            records.clone()
        } else {
            Vec::new()
        };
        let handler = StoreResponseHandler::new(store, server_action, records, completion);
        let request_id =
            self.dispatch_request(transport, &module, server_action, payload, Box::new(handler))?;

        for r in &creating {
            r.write().set_creating();
        }
        Ok(request_id)
    }

    /// Fetch the full data of one record
    pub fn dispatch_open(
        &mut self,
        transport: &dyn Transport,
        store: &StoreHandle,
        record: RecordHandle,
        completion: Option<Completion>,
    ) -> Result<RequestId, SyncError> {
        let module = self.item_module(store, &record);
        let payload = self.serializer.serialize_open(&record.read())?;
        let handler = StoreResponseHandler::new(store, ServerAction::Open, vec![record], completion);
        self.dispatch_request(transport, &module, ServerAction::Open, payload, Box::new(handler))
    }

    /// List a store's contents. The load options are remembered on the store
    /// right away so notifications can be scoped while the list is in flight.
    pub fn dispatch_list(
        &mut self,
        transport: &dyn Transport,
        store: &StoreHandle,
        options: LoadOptions,
        completion: Option<Completion>,
    ) -> Result<RequestId, SyncError> {
        let module = {
            let s = store.read();
            match s.modules() {
                Some(fixed) => fixed.list.clone(),
                None => self.router.list_module_name(s.record_type()).to_string(),
            }
        };
        let payload = serde_json::to_value(&options)?;
        store.write().set_last_load(options);

        let handler = StoreResponseHandler::new(store, ServerAction::List, Vec::new(), completion);
        self.dispatch_request(transport, &module, ServerAction::List, payload, Box::new(handler))
    }

    /// Route a response to the handler of its request. Returns whether the
    /// response was applied successfully.
    pub fn handle_response(
        &mut self,
        request_id: RequestId,
        module: &str,
        payload: &Value,
        received: DateTime<Utc>,
    ) -> Result<bool, SyncError> {
        let mut pending = self
            .pending
            .remove(&request_id)
            .ok_or(SyncError::UnknownRequest(request_id.0))?;

        if let Some(ids) = self.active.get_mut(&pending.action) {
            ids.retain(|id| *id != request_id);
        }
        if pending.module != module {
            warn!(
                "Response {} came from {} but was sent to {}",
                request_id, module, pending.module
            );
        }

        debug!("Handling {} response {}", pending.action, request_id);
        Ok(process_response(
            pending.handler.as_mut(),
            module,
            payload,
            received,
        ))
    }
}

/// Applies a solicited response to the store that sent the request
pub struct StoreResponseHandler {
    store: WeakStoreHandle,
    target: Option<StoreHandle>,
    action: ServerAction,
    sent: Vec<RecordHandle>,
    matched: Vec<bool>,
    received: DateTime<Utc>,
    error: Option<SyncError>,
    completion: Option<Completion>,
}

impl StoreResponseHandler {
    pub fn new(
        store: &StoreHandle,
        action: ServerAction,
        sent: Vec<RecordHandle>,
        completion: Option<Completion>,
    ) -> Self {
        let matched = vec![false; sent.len()];
        Self {
            store: store.downgrade(),
            target: None,
            action,
            sent,
            matched,
            received: Utc::now(),
            error: None,
            completion,
        }
    }

    fn clear_creating(&self) {
        for r in &self.sent {
            r.write().clear_creating();
        }
    }

    fn complete(&mut self, success: bool) {
        if let Some(completion) = self.completion.take() {
            completion(RequestOutcome {
                success,
                action: self.action,
                records: self.sent.clone(),
                error: self.error.clone(),
            });
        }
    }

    /// Find the sent record a response item belongs to: same entryid (and
    /// attachment path for embedded messages), else the first unmatched
    /// record that had no identity yet.
    fn correlate(&mut self, item: &Value) -> Option<RecordHandle> {
        let entry_id = item.get("entryid").and_then(Value::as_str);
        let attach_num = item.get("attach_num");

        let by_id = entry_id.and_then(|id| {
            self.sent.iter().enumerate().position(|(i, r)| {
                if self.matched[i] {
                    return false;
                }
                let r = r.read();
                r.entry_id() == Some(id)
                    && r.get("attach_num") == attach_num.map(PropValue::from_wire).as_ref()
            })
        });

        let index = by_id.or_else(|| {
            self.sent
                .iter()
                .enumerate()
                .position(|(i, r)| !self.matched[i] && !r.read().has_identity())
        })?;

        self.matched[index] = true;
        Some(self.sent[index].clone())
    }

    fn apply_items(&mut self, data: &Value) -> bool {
        let Some(store) = self.target.clone() else {
            return false;
        };

        let mut ok = true;
        let mut updated = Vec::new();
        for item in collect_items(data) {
            let Some(record) = self.correlate(item) else {
                debug!("No sent record matches response item, skipping");
                continue;
            };

            let mut s = store.write();
            if !s.contains(&record) {
                debug!("{} no longer holds the record, skipping", s.id());
                continue;
            }

            if let Err(e) = record.write().apply_server_data(item) {
                warn!("Failed to apply {} response: {}", self.action, e);
                ok = false;
                continue;
            }
            if self.action == ServerAction::Open {
                record.write().mark_opened();
            }
            s.remap(&record);
            if self.action.is_write() {
                s.mark_series_stale(&record);
            }
            updated.push(record);
        }

        if !updated.is_empty() {
            store
                .write()
                .emit_update(updated, EventOrigin::Server, UpdateOperation::Commit);
        }
        ok
    }

    fn apply_list(&mut self, data: &Value) -> bool {
        let Some(store) = self.target.clone() else {
            return false;
        };
        let mut s = store.write();
        let id_props: Vec<String> = DEFAULT_ID_PROPS.iter().map(|p| p.to_string()).collect();
        let record_type = s.record_type().clone();

        let mut records = Vec::new();
        for item in collect_items(data) {
            match Record::from_wire(item, &record_type, &id_props) {
                Ok(r) => records.push(r),
                Err(e) => warn!("Skipping malformed list item: {}", e),
            }
        }
        s.load_records(records);
        true
    }

    fn apply_error(&mut self, data: &Value) -> bool {
        let message = data
            .pointer("/info/display_message")
            .or_else(|| data.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| data.to_string());
        let err = SyncError::Transport(message);
        error!("{} request failed: {}", self.action, err);

        if let Some(store) = &self.target {
            let mut s = store.write();
            let id = s.id();
            s.emit(StoreEvent::Exception {
                store: id,
                action: self.action,
                error: err.clone(),
            });
        }
        self.error = Some(err);
        false
    }
}

impl ResponseHandler for StoreResponseHandler {
    fn start(&mut self, module: &str, received: DateTime<Utc>) -> bool {
        self.received = received;
        match self.store.upgrade() {
            Some(store) => {
                self.target = Some(store);
                true
            }
            None => {
                warn!("{}: {} response for a dropped store, ignoring", module, self.action);
                self.error = Some(SyncError::StoreGone);
                self.clear_creating();
                self.complete(false);
                false
            }
        }
    }

    fn handle(&mut self, action: &str, data: &Value) -> bool {
        match action {
            "item" | "update" => self.apply_items(data),
            "list" | "updatelist" => self.apply_list(data),
            "success" => data.as_bool().unwrap_or(true),
            "error" => self.apply_error(data),
            other => {
                debug!("Ignoring response section {}", other);
                true
            }
        }
    }

    fn done(&mut self, success: bool) {
        if !success {
            self.clear_creating();
        }
        if let Some(store) = self.target.take() {
            let mut s = store.write();
            s.record_execution(self.action, self.received);

            if success && self.action.is_write() {
                let sent: Vec<RecordHandle> = self
                    .sent
                    .iter()
                    .filter(|r| s.contains(r) || self.action == ServerAction::Delete)
                    .cloned()
                    .collect();

                if self.action == ServerAction::Delete {
                    let ids: Vec<String> = sent
                        .iter()
                        .filter_map(|r| r.read().entry_id().map(str::to_string))
                        .collect();
                    s.remove_committed(&ids);
                } else {
                    for r in &sent {
                        r.write().commit();
                    }
                }
                s.commit_snapshot();

                let id = s.id();
                s.emit(StoreEvent::Write {
                    store: id,
                    action: self.action,
                    records: sent,
                });
            }
        }

        info!("{} request finished (success={})", self.action, success);
        self.complete(success);
    }

    fn bound_stores(&self) -> Vec<StoreId> {
        vec![self.store.id()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyAllocator;
    use crate::record::RecordType;
    use crate::store::{KeyMode, Store};
    use crate::sync::transport::RecordingTransport;
    use serde_json::json;
    use std::sync::Mutex;

    struct Harness {
        transport: RecordingTransport,
        correlator: ResponseCorrelator,
        store: StoreHandle,
    }

    fn harness() -> Harness {
        let keys = Arc::new(KeyAllocator::default());
        let store = StoreHandle::new(Store::new("cal", RecordType::new("IPM.Appointment"), keys));
        Harness {
            transport: RecordingTransport::new(),
            correlator: ResponseCorrelator::new(Arc::new(ModuleRouter::default()), DiffSerializer::default()),
            store,
        }
    }

    fn capture() -> (Arc<Mutex<Option<RequestOutcome>>>, Completion) {
        let slot = Arc::new(Mutex::new(None));
        let out = slot.clone();
        (slot, Box::new(move |o| *out.lock().unwrap() = Some(o)))
    }

    fn appointment(entry_id: &str, goid: &str) -> Record {
        Record::from_wire_default(
            &json!({
                "entryid": entry_id,
                "parent_entryid": "F1",
                "props": {"message_class": "IPM.Appointment", "goid": goid, "subject": "s"}
            }),
            &RecordType::new("IPM.Appointment"),
        )
        .unwrap()
    }

    #[test]
    fn test_create_reconciles_phantom() {
        let mut h = harness();
        let r = RecordHandle::new(Record::new_phantom(
            "IPM.Appointment",
            vec![("subject", "Standup".into())],
        ));
        let key = h.store.write().add(r.clone(), EventOrigin::Local);
        let (slot, done) = capture();

        let id = h
            .correlator
            .dispatch_write(&h.transport, &h.store, vec![r.clone()], WriteAction::Create, Some(done))
            .unwrap();
        let sent = h.transport.last().unwrap();
        assert_eq!(sent.module, "appointmentitemmodule");
        assert_eq!(sent.action, ServerAction::Save);
        assert!(r.read().is_creating());
        assert!(h.correlator.is_executing(Some(ServerAction::Save)));

        let ok = h
            .correlator
            .handle_response(
                id,
                "appointmentitemmodule",
                &json!({"item": {"entryid": "E9", "props": {"subject": "Standup"}}}),
                Utc::now(),
            )
            .unwrap();
        assert!(ok);
        assert!(!h.correlator.is_executing(None));

        let rec = r.read();
        assert_eq!(rec.entry_id(), Some("E9"));
        assert!(!rec.is_phantom());
        assert!(!rec.has_changes());
        assert!(!rec.is_creating());
        drop(rec);

        let s = h.store.read();
        assert_ne!(s.key_of(&r).unwrap(), key);
        assert_eq!(s.key_of(&r).unwrap().as_str(), "E9");
        assert!(s.last_execution_time(ServerAction::Save).is_some());
        assert!(slot.lock().unwrap().as_ref().unwrap().success);
    }

    struct OfflineTransport;

    impl Transport for OfflineTransport {
        fn send(&self, _request: OutboundRequest) -> Result<(), SyncError> {
            Err(SyncError::Transport("offline".into()))
        }
    }

    #[test]
    fn test_unsent_create_is_not_marked_creating() {
        let mut h = harness();
        let r = RecordHandle::new(Record::new_phantom("IPM.Appointment", vec![]));
        h.store.write().add(r.clone(), EventOrigin::Local);

        match h
            .correlator
            .dispatch_write(&OfflineTransport, &h.store, vec![r.clone()], WriteAction::Create, None)
        {
            Err(SyncError::Transport(_)) => {}
            _ => panic!("Expected Transport error"),
        }
        assert!(!r.read().is_creating());
        assert!(!h.correlator.is_executing(None));
    }

    #[test]
    fn test_failed_create_clears_creating() {
        let mut h = harness();
        let r = RecordHandle::new(Record::new_phantom("IPM.Appointment", vec![]));
        h.store.write().add(r.clone(), EventOrigin::Local);
        let (slot, done) = capture();

        let id = h
            .correlator
            .dispatch_write(&h.transport, &h.store, vec![r.clone()], WriteAction::Create, Some(done))
            .unwrap();
        assert!(r.read().is_creating());

        let ok = h
            .correlator
            .handle_response(id, "appointmentitemmodule", &json!({"success": false}), Utc::now())
            .unwrap();
        assert!(!ok);
        assert!(!r.read().is_creating());
        assert!(r.read().is_phantom());
        assert!(!slot.lock().unwrap().as_ref().unwrap().success);
    }

    #[test]
    fn test_failed_write_keeps_edits() {
        let mut h = harness();
        let r = RecordHandle::new(appointment("E1", "G1"));
        h.store.write().add(r.clone(), EventOrigin::Server);
        r.write().set("subject", "new");
        let rx = h.store.write().subscribe();
        let (slot, done) = capture();

        let id = h
            .correlator
            .dispatch_write(&h.transport, &h.store, vec![r.clone()], WriteAction::Update, Some(done))
            .unwrap();
        let ok = h
            .correlator
            .handle_response(
                id,
                "appointmentitemmodule",
                &json!({"error": {"info": {"display_message": "denied"}}}),
                Utc::now(),
            )
            .unwrap();

        assert!(!ok);
        assert!(r.read().has_changes());
        let outcome = slot.lock().unwrap().take().unwrap();
        assert!(!outcome.success);
        match outcome.error {
            Some(SyncError::Transport(msg)) => assert_eq!(msg, "denied"),
            _ => panic!("Expected Transport error"),
        }
        assert!(rx.drain().any(|e| matches!(e, StoreEvent::Exception { .. })));
    }

    #[test]
    fn test_unknown_request_id() {
        let mut h = harness();
        match h.correlator.handle_response(RequestId(42), "m", &json!({}), Utc::now()) {
            Err(SyncError::UnknownRequest(42)) => {}
            _ => panic!("Expected UnknownRequest"),
        }
    }

    #[test]
    fn test_dropped_store_completes_with_store_gone() {
        let mut h = harness();
        let r = RecordHandle::new(appointment("E1", "G1"));
        h.store.write().add(r.clone(), EventOrigin::Server);
        let (slot, done) = capture();
        let id = h
            .correlator
            .dispatch_write(&h.transport, &h.store, vec![r], WriteAction::Update, Some(done))
            .unwrap();

        drop(h.store);
        let ok = h
            .correlator
            .handle_response(id, "appointmentitemmodule", &json!({"success": true}), Utc::now())
            .unwrap();
        assert!(!ok);
        let outcome = slot.lock().unwrap().take().unwrap();
        assert!(matches!(outcome.error, Some(SyncError::StoreGone)));
    }

    #[test]
    fn test_write_marks_series_siblings_stale() {
        let mut h = harness();
        let a = RecordHandle::new(appointment("E1", "G1"));
        let b = RecordHandle::new(appointment("E2", "G1"));
        h.store.write().add(a.clone(), EventOrigin::Server);
        h.store.write().add(b.clone(), EventOrigin::Server);
        a.write().set("subject", "moved");

        let id = h
            .correlator
            .dispatch_write(&h.transport, &h.store, vec![a.clone()], WriteAction::Update, None)
            .unwrap();
        h.correlator
            .handle_response(
                id,
                "appointmentitemmodule",
                &json!({"item": {"entryid": "E1", "props": {"subject": "moved"}}}),
                Utc::now(),
            )
            .unwrap();

        assert!(!a.read().is_stale());
        assert!(b.read().is_stale());
        assert_eq!(b.read().get_str("subject"), Some("s"));
    }

    #[test]
    fn test_embedded_message_matches_attach_num() {
        let mut h = harness();
        h.store = StoreHandle::new(
            Store::new(
                "embedded",
                RecordType::new("IPM.Appointment"),
                Arc::new(KeyAllocator::default()),
            )
            .with_key_mode(KeyMode::Fresh),
        );
        let outer = RecordHandle::new(appointment("E1", "G1"));
        let mut embedded = appointment("E1", "G1");
        embedded.set("attach_num", PropValue::List(vec![PropValue::Int(0)]));
        embedded.commit();
        let embedded = RecordHandle::new(embedded);
        h.store.write().add(outer.clone(), EventOrigin::Server);
        h.store.write().add(embedded.clone(), EventOrigin::Server);

        let id = h
            .correlator
            .dispatch_write(
                &h.transport,
                &h.store,
                vec![outer.clone(), embedded.clone()],
                WriteAction::Update,
                None,
            )
            .unwrap();
        h.correlator
            .handle_response(
                id,
                "appointmentitemmodule",
                &json!({"item": [{"entryid": "E1", "attach_num": [0], "props": {"subject": "inner"}}]}),
                Utc::now(),
            )
            .unwrap();

        assert_eq!(embedded.read().get_str("subject"), Some("inner"));
        assert_eq!(outer.read().get_str("subject"), Some("s"));
    }

    #[test]
    fn test_list_remembers_load_and_fills_store() {
        let mut h = harness();
        let id = h
            .correlator
            .dispatch_list(&h.transport, &h.store, LoadOptions::folder("F1"), None)
            .unwrap();
        assert!(h.store.read().contains_folder_in_last_load("F1"));
        assert_eq!(h.transport.last().unwrap().module, "appointmentlistmodule");

        h.correlator
            .handle_response(
                id,
                "appointmentlistmodule",
                &json!({"list": {"item": [
                    {"entryid": "E1", "parent_entryid": "F1", "props": {"subject": "a"}},
                    {"entryid": "E2", "parent_entryid": "F1", "props": {"subject": "b"}}
                ]}}),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(h.store.read().len(), 2);
        assert!(h.store.read().last_execution_time(ServerAction::List).is_some());
    }

    #[test]
    fn test_destroy_without_identity_is_not_sent() {
        let mut h = harness();
        let r = RecordHandle::new(Record::new_phantom("IPM.Appointment", vec![]));
        match h
            .correlator
            .dispatch_write(&h.transport, &h.store, vec![r], WriteAction::Destroy, None)
        {
            Err(SyncError::InvalidRecordState(_)) => {}
            _ => panic!("Expected InvalidRecordState"),
        }
        assert!(h.transport.sent().is_empty());
    }
}
