//! Replay a captured session log against fresh stores
//!
//! Input is JSON lines. `store` entries declare a list or folder store and
//! the folders or mailboxes it loaded; `notification` entries are resolved
//! and applied. Each notification logs the stores it reached.
//!
//! Usage: sync-replay <log.jsonl> [config.toml]

use groupware_sync::config::{load_config, load_config_from_path};
use groupware_sync::{
    init_tracing, LoadOptions, RecordingTransport, StoreHandle, SyncContext, SyncError,
};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum ReplayEntry {
    Store {
        name: String,
        #[serde(default = "default_record_type")]
        record_type: String,
        #[serde(default)]
        folders: Vec<String>,
        #[serde(default)]
        stores: Vec<String>,
    },
    Notification {
        module: String,
        payload: Value,
    },
}

fn default_record_type() -> String {
    "IPM.Note".to_string()
}

fn replay(log: &Path, config: Option<&Path>) -> Result<usize, SyncError> {
    let config = match config {
        Some(path) => load_config_from_path(path)?,
        None => load_config()?,
    };

    let transport = RecordingTransport::new();
    let mut ctx = SyncContext::new(config, Arc::new(transport.clone()));
    let mut stores: Vec<StoreHandle> = Vec::new();
    let mut applied = 0;

    let content = fs::read_to_string(log)?;
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: ReplayEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Line {}: skipping unreadable entry: {}", line_no + 1, e);
                continue;
            }
        };

        match entry {
            ReplayEntry::Store {
                name,
                record_type,
                folders,
                stores: mailboxes,
            } => {
                let store = if mailboxes.is_empty() {
                    ctx.create_store(&name, &record_type)
                } else {
                    ctx.create_folder_store(&name)
                };
                store.write().set_last_load(LoadOptions {
                    folders,
                    stores: mailboxes,
                    ..Default::default()
                });
                info!("Line {}: {} is {}", line_no + 1, name, store.id());
                stores.push(store);
            }
            ReplayEntry::Notification { module, payload } => {
                let reached = ctx.handle_notification(&module, &payload);
                ctx.relay();
                if reached.is_empty() {
                    info!("Line {}: {} reached no store", line_no + 1, module);
                } else {
                    applied += 1;
                    let names: Vec<String> = reached.iter().map(|id| id.to_string()).collect();
                    info!("Line {}: {} reached {}", line_no + 1, module, names.join(", "));
                }
            }
        }
    }

    ctx.process_reloads();
    for req in transport.take() {
        info!("Would send {} to {}: {}", req.action, req.module, req.payload);
    }
    ctx.shutdown();
    Ok(applied)
}

fn main() -> ExitCode {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let Some(log) = args.get(1) else {
        eprintln!("Usage: sync-replay <log.jsonl> [config.toml]");
        return ExitCode::from(2);
    };
    let config = args.get(2).map(Path::new);

    match replay(Path::new(log), config) {
        Ok(applied) => {
            info!("Replay finished, {} notifications applied", applied);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Replay failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
