//! groupware-sync - client-side record synchronization core
//!
//! Keeps in-memory record stores consistent with a groupware backend that
//! answers requests and also pushes untagged change notifications.
//!
//! ## Module Organization
//!
//! - `record/`: Records, sub-collections and property values
//! - `keys`: Local record keys
//! - `routing`: Record type to backend module table
//! - `serializer`: Minimal write payloads
//! - `store/`: Stores, store managers and the shadow registry
//! - `sync/`: Transport seam, response correlation and notification routing
//! - `action_queue`: Confirmation step queue
//! - `context`: Session context driving all of the above
//! - `config/`: Configuration management

pub mod action_queue;
pub mod config;
pub mod context;
pub mod error;
pub mod keys;
pub mod record;
pub mod routing;
pub mod serializer;
pub mod store;
pub mod sync;

pub use action_queue::{ActionQueue, QueueAction, QueueEvent, QueueState, Resume};
pub use config::SyncConfig;
pub use context::SyncContext;
pub use error::SyncError;
pub use keys::{KeyAllocator, RecordKey};
pub use record::{PropValue, Record, RecordHandle, RecordType, SubCollection};
pub use routing::{ModuleNames, ModuleRouter};
pub use serializer::{DiffSerializer, WriteAction};
pub use store::manager::StoreManager;
pub use store::shadow::ShadowRegistry;
pub use store::{EventOrigin, LoadOptions, Store, StoreEvent, StoreHandle, StoreId};
pub use sync::{Inbound, NotificationResolver, RecordingTransport, ServerAction, Transport};

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            // Debug build: show debug logs for our crate, info for others
            EnvFilter::new("groupware_sync=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
