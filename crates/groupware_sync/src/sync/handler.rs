//! Response handlers
//!
//! A handler consumes one server payload in three steps: `start` once,
//! `handle` for every action section of the payload, `done` once with the
//! overall outcome. Solicited responses and unsolicited notifications go
//! through the same driver.

use crate::store::StoreId;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

pub trait ResponseHandler: Send {
    /// Prepare for a payload from `module`. Returning false skips the
    /// payload entirely.
    fn start(&mut self, module: &str, received: DateTime<Utc>) -> bool;

    /// Apply one action section. Returns false if the section failed.
    fn handle(&mut self, action: &str, data: &Value) -> bool;

    fn done(&mut self, success: bool);

    /// Stores this handler writes into
    fn bound_stores(&self) -> Vec<StoreId> {
        Vec::new()
    }
}

/// Drive `handler` through a payload. Returns the overall success.
pub fn process_response(
    handler: &mut dyn ResponseHandler,
    module: &str,
    payload: &Value,
    received: DateTime<Utc>,
) -> bool {
    if !handler.start(module, received) {
        return false;
    }

    let Some(sections) = payload.as_object() else {
        warn!("{}: response payload is not an object, ignoring", module);
        handler.done(false);
        return false;
    };

    let mut success = true;
    for (action, data) in sections {
        if !handler.handle(action, data) {
            success = false;
        }
    }
    handler.done(success);
    success
}

/// Replays every hook to each child in order
#[derive(Default)]
pub struct CompositeHandler {
    children: Vec<Box<dyn ResponseHandler>>,
    active: Vec<bool>,
}

impl CompositeHandler {
    pub fn new(children: Vec<Box<dyn ResponseHandler>>) -> Self {
        let active = vec![false; children.len()];
        Self { children, active }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

impl ResponseHandler for CompositeHandler {
    fn start(&mut self, module: &str, received: DateTime<Utc>) -> bool {
        for (child, active) in self.children.iter_mut().zip(self.active.iter_mut()) {
            *active = child.start(module, received);
        }
        self.active.iter().any(|a| *a)
    }

    fn handle(&mut self, action: &str, data: &Value) -> bool {
        let mut ok = true;
        for (child, active) in self.children.iter_mut().zip(self.active.iter()) {
            if *active && !child.handle(action, data) {
                ok = false;
            }
        }
        ok
    }

    fn done(&mut self, success: bool) {
        for (child, active) in self.children.iter_mut().zip(self.active.iter()) {
            if *active {
                child.done(success);
            }
        }
    }

    fn bound_stores(&self) -> Vec<StoreId> {
        let mut out: Vec<StoreId> = Vec::new();
        for id in self.children.iter().flat_map(|c| c.bound_stores()) {
            if !out.contains(&id) {
                out.push(id);
            }
        }
        out
    }
}

/// Items of a section: an array, an object with an `item` list or single
/// `item`, or one bare object
pub fn collect_items(data: &Value) -> Vec<&Value> {
    match data {
        Value::Array(items) => items.iter().collect(),
        Value::Object(obj) => match obj.get("item") {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(item @ Value::Object(_)) => vec![item],
            Some(_) => Vec::new(),
            None => vec![data],
        },
        _ => Vec::new(),
    }
}
