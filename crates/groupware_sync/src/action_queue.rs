//! Confirmation queue
//!
//! Runs an ordered list of steps where each step may pause, typically on a
//! confirmation dialog, before it lets the queue continue. A step receives a
//! [`Resume`] handle and must consume it exactly once: `done(true)` moves on
//! to the next step, `done(false)` aborts the whole run.
//!
//! A step that drops its handle without calling it stalls the queue. There
//! is no timeout.

use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

/// One step of a queue
pub type QueueAction = Arc<dyn Fn(Resume) + Send + Sync>;

type OnComplete = Box<dyn FnOnce(bool) + Send>;

#[derive(Clone)]
struct QueueTask {
    action: QueueAction,
    scope: String,
}

impl QueueTask {
    fn matches(&self, action: &QueueAction, scope: &str) -> bool {
        same_action(&self.action, action) && self.scope == scope
    }
}

fn same_action(a: &QueueAction, b: &QueueAction) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueState {
    Idle,
    /// Waiting on the step at this index
    Running(usize),
    Completed(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueEvent {
    Started { tasks: usize },
    Completed { success: bool },
}

struct Inner {
    tasks: Vec<QueueTask>,
    state: QueueState,
    run_id: u64,
    on_complete: Option<OnComplete>,
    listeners: Vec<Sender<QueueEvent>>,
}

impl Inner {
    fn emit(&mut self, event: QueueEvent) {
        self.listeners.retain(|tx| tx.send(event).is_ok());
    }
}

#[derive(Clone)]
pub struct ActionQueue {
    inner: Arc<Mutex<Inner>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ActionQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                tasks: Vec::new(),
                state: QueueState::Idle,
                run_id: 0,
                on_complete: None,
                listeners: Vec::new(),
            })),
        }
    }

    pub fn add(&self, action: QueueAction, scope: &str) {
        lock(&self.inner).tasks.push(QueueTask {
            action,
            scope: scope.to_string(),
        });
    }

    /// Remove the first task with this action and scope. While running only
    /// steps that have not started yet can be removed.
    pub fn remove(&self, action: &QueueAction, scope: &str) -> bool {
        let mut inner = lock(&self.inner);
        let first_removable = match inner.state {
            QueueState::Running(current) => current + 1,
            _ => 0,
        };
        let found = inner
            .tasks
            .iter()
            .enumerate()
            .skip(first_removable)
            .find(|(_, t)| t.matches(action, scope))
            .map(|(i, _)| i);

        match found {
            Some(index) => {
                inner.tasks.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).tasks.is_empty()
    }

    pub fn state(&self) -> QueueState {
        lock(&self.inner).state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), QueueState::Running(_))
    }

    pub fn subscribe(&self) -> Receiver<QueueEvent> {
        let (tx, rx) = flume::unbounded();
        lock(&self.inner).listeners.push(tx);
        rx
    }

    /// Start from the first step. Restarting a running queue abandons the
    /// previous run; its completion receives `false`.
    pub fn run(&self, on_complete: impl FnOnce(bool) + Send + 'static) {
        let (abandoned, first, run_id) = {
            let mut inner = lock(&self.inner);
            let abandoned = match inner.state {
                QueueState::Running(_) => {
                    warn!("Action queue restarted while running");
                    inner.on_complete.take()
                }
                _ => None,
            };

            inner.run_id += 1;
            inner.on_complete = Some(Box::new(on_complete));
            let tasks = inner.tasks.len();
            inner.emit(QueueEvent::Started { tasks });
            info!("Action queue started with {} tasks", tasks);

            let first = inner.tasks.first().map(|t| t.action.clone());
            if first.is_some() {
                inner.state = QueueState::Running(0);
            }
            (abandoned, first, inner.run_id)
        };

        if let Some(previous) = abandoned {
            previous(false);
        }

        match first {
            Some(action) => action(Resume {
                queue: Arc::downgrade(&self.inner),
                run_id,
                index: 0,
            }),
            None => finish(&self.inner, run_id, true),
        }
    }

    /// Run the queue and wait for its outcome
    pub async fn run_until_complete(&self) -> bool {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.run(move |success| {
            let _ = tx.send(success);
        });
        rx.await.unwrap_or(false)
    }
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn finish(queue: &Mutex<Inner>, run_id: u64, success: bool) {
    let on_complete = {
        let mut inner = lock(queue);
        if inner.run_id != run_id {
            return;
        }
        inner.state = QueueState::Completed(success);
        inner.emit(QueueEvent::Completed { success });
        inner.on_complete.take()
    };
    info!("Action queue finished (success={})", success);
    if let Some(on_complete) = on_complete {
        on_complete(success);
    }
}

/// Continuation handed to each step
pub struct Resume {
    queue: Weak<Mutex<Inner>>,
    run_id: u64,
    index: usize,
}

impl Resume {
    /// Index of the step this handle belongs to
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn done(self, success: bool) {
        let Some(queue) = self.queue.upgrade() else {
            debug!("Action queue dropped before step {} resumed", self.index);
            return;
        };

        let next = {
            let mut inner = lock(&queue);
            if inner.run_id != self.run_id || inner.state != QueueState::Running(self.index) {
                warn!("Ignoring stale resume for step {}", self.index);
                return;
            }
            if !success {
                None
            } else {
                let index = self.index + 1;
                match inner.tasks.get(index).map(|t| t.action.clone()) {
                    Some(action) => {
                        inner.state = QueueState::Running(index);
                        Some((index, action))
                    }
                    None => None,
                }
            }
        };

        match next {
            Some((index, action)) => action(Resume {
                queue: Arc::downgrade(&queue),
                run_id: self.run_id,
                index,
            }),
            None => finish(&queue, self.run_id, success),
        }
    }

    pub fn proceed(self) {
        self.done(true);
    }

    pub fn abort(self) {
        self.done(false);
    }
}
