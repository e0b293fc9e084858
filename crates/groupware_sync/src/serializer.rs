//! Minimal write payloads
//!
//! A payload carries the record's identity, the properties edited since the
//! last commit, one diff per changed sub-collection and any pending message
//! actions. Serializing never touches the record's dirty state; that is
//! cleared only once the server confirms the write.

use crate::error::SyncError;
use crate::record::{PropValue, Record, SubCollection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAction {
    Create,
    Update,
    Destroy,
}

impl fmt::Display for WriteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteAction::Create => "create",
            WriteAction::Update => "update",
            WriteAction::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffSerializer {
    /// Permit update/destroy payloads for records without identity
    pub allow_empty: bool,
}

impl DiffSerializer {
    pub fn new(allow_empty: bool) -> Self {
        Self { allow_empty }
    }

    pub fn serialize(&self, record: &Record, action: WriteAction) -> Result<Value, SyncError> {
        if action != WriteAction::Create && !record.has_identity() && !self.allow_empty {
            return Err(SyncError::InvalidRecordState(format!(
                "cannot {} a {} record without identity",
                action,
                record.record_type()
            )));
        }

        let mut out = render(record, action);
        if !record.message_actions().is_empty() {
            out.insert(
                "message_action".to_string(),
                render_map(record.message_actions().iter()),
            );
        }
        Ok(Value::Object(out))
    }

    /// Payload for fetching the full record: identity only
    pub fn serialize_open(&self, record: &Record) -> Result<Value, SyncError> {
        if !record.has_identity() {
            return Err(SyncError::InvalidRecordState(format!(
                "cannot open a {} record without identity",
                record.record_type()
            )));
        }
        Ok(Value::Object(identity(record)))
    }
}

fn render_map<'a>(entries: impl Iterator<Item = (&'a String, &'a PropValue)>) -> Value {
    Value::Object(entries.map(|(k, v)| (k.clone(), v.to_wire())).collect())
}

fn identity(record: &Record) -> Map<String, Value> {
    record
        .id_props()
        .iter()
        .filter_map(|id| match record.get(id) {
            Some(PropValue::Null) | None => None,
            Some(v) => Some((id.clone(), v.to_wire())),
        })
        .collect()
}

fn render(record: &Record, action: WriteAction) -> Map<String, Value> {
    let mut out = identity(record);
    if action == WriteAction::Destroy {
        return out;
    }

    let props = record
        .dirty_props()
        .iter()
        .filter(|name| !record.is_id_prop(name))
        .filter_map(|name| record.get(name).map(|v| (name, v)));
    out.insert("props".to_string(), render_map(props));

    for (name, sub) in record.sub_collections() {
        if let Some(diff) = sub_collection_diff(sub) {
            out.insert(name.clone(), diff);
        }
    }
    out
}

fn sub_collection_diff(sub: &SubCollection) -> Option<Value> {
    let add: Vec<Value> = sub
        .added()
        .into_iter()
        .map(|c| Value::Object(render(c, WriteAction::Create)))
        .collect();
    let modify: Vec<Value> = sub
        .modified()
        .into_iter()
        .map(|c| Value::Object(render(c, WriteAction::Update)))
        .collect();
    let remove: Vec<Value> = sub
        .removed()
        .iter()
        .map(|c| Value::Object(identity(c)))
        .collect();

    if add.is_empty() && modify.is_empty() && remove.is_empty() {
        return None;
    }

    let mut diff = Map::new();
    for (key, list) in [("add", add), ("modify", modify), ("remove", remove)] {
        if !list.is_empty() {
            diff.insert(key.to_string(), Value::Array(list));
        }
    }
    Some(Value::Object(diff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordType;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn contact() -> Record {
        Record::from_wire_default(
            &json!({
                "entryid": "E1",
                "parent_entryid": "F1",
                "store_entryid": "S1",
                "props": {"message_class": "IPM.Contact", "display_name": "Ann"},
                "recipients": {"item": [
                    {"rowid": 1, "props": {"email": "a@x"}},
                    {"rowid": 2, "props": {"email": "b@x"}}
                ]}
            }),
            &RecordType::new("IPM"),
        )
        .unwrap()
    }

    #[test]
    fn test_unmodified_record_has_empty_diff() {
        let payload = DiffSerializer::default()
            .serialize(&contact(), WriteAction::Update)
            .unwrap();
        assert_eq!(payload["props"], json!({}));
        assert!(payload.get("recipients").is_none());
        assert_eq!(payload["entryid"], "E1");
    }

    #[test]
    fn test_only_dirty_props_are_sent() {
        let mut r = contact();
        r.set("display_name", "X");
        let payload = DiffSerializer::default()
            .serialize(&r, WriteAction::Update)
            .unwrap();
        assert_eq!(payload["props"], json!({"display_name": "X"}));
    }

    #[test]
    fn test_identity_props_stripped_from_props() {
        let r = Record::new_phantom(
            "IPM.Note",
            vec![("parent_entryid", "F1".into()), ("subject", "Hi".into())],
        );
        let payload = DiffSerializer::default()
            .serialize(&r, WriteAction::Create)
            .unwrap();
        assert_eq!(payload["parent_entryid"], "F1");
        assert_eq!(payload["props"], json!({"subject": "Hi"}));
    }

    #[test]
    fn test_single_modified_child() {
        let mut r = contact();
        r.sub_collection_mut("recipients")
            .get_mut(1)
            .unwrap()
            .set("email", "c@x");
        let payload = DiffSerializer::default()
            .serialize(&r, WriteAction::Update)
            .unwrap();

        let diff = &payload["recipients"];
        assert_eq!(diff["modify"].as_array().unwrap().len(), 1);
        assert_eq!(diff["modify"][0]["rowid"], 2);
        assert_eq!(diff["modify"][0]["props"], json!({"email": "c@x"}));
        assert!(diff.get("add").is_none());
        assert!(diff.get("remove").is_none());
    }

    #[test]
    fn test_added_and_removed_children() {
        let mut r = contact();
        let subs = r.sub_collection_mut("recipients");
        subs.remove(0);
        let child = subs.create_child(vec![("email", "d@x".into())]);
        subs.add(child);

        let payload = DiffSerializer::default()
            .serialize(&r, WriteAction::Update)
            .unwrap();
        assert_eq!(payload["recipients"]["remove"], json!([{"rowid": 1}]));
        assert_eq!(
            payload["recipients"]["add"],
            json!([{"props": {"email": "d@x"}}])
        );
    }

    #[test]
    fn test_destroy_without_identity_is_rejected() {
        let r = Record::new_phantom("IPM.Note", vec![]);
        match DiffSerializer::default().serialize(&r, WriteAction::Destroy) {
            Err(SyncError::InvalidRecordState(_)) => {}
            _ => panic!("Expected InvalidRecordState"),
        }

        let payload = DiffSerializer::new(true)
            .serialize(&r, WriteAction::Destroy)
            .unwrap();
        assert_eq!(payload, json!({}));
    }

    #[test]
    fn test_destroy_sends_identity_and_actions() {
        let mut r = contact();
        r.set("display_name", "X");
        r.add_message_action("soft_delete", true);
        let payload = DiffSerializer::default()
            .serialize(&r, WriteAction::Destroy)
            .unwrap();
        assert!(payload.get("props").is_none());
        assert_eq!(payload["message_action"], json!({"soft_delete": true}));
        assert_eq!(payload["entryid"], "E1");
    }

    #[test]
    fn test_dates_are_epoch_seconds() {
        let due = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let r = Record::new_phantom("IPM.Task", vec![("duedate", due.into())]);
        let payload = DiffSerializer::default()
            .serialize(&r, WriteAction::Create)
            .unwrap();
        assert_eq!(payload["props"]["duedate"], json!(due.timestamp()));
    }

    #[test]
    fn test_serialize_is_pure() {
        let mut r = contact();
        r.set("display_name", "X");
        let s = DiffSerializer::default();
        let first = s.serialize(&r, WriteAction::Update).unwrap();
        let second = s.serialize(&r, WriteAction::Update).unwrap();
        assert_eq!(first, second);
        assert!(r.has_changes());
    }
}
