use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::SyncError;
use crate::keys::DEFAULT_KEY_PREFIX;
use crate::routing::{ModuleNames, ModuleRouter};
use crate::sync::notification::DEFAULT_HIERARCHY_MODULES;

/// Synchronization core configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub shadow: ShadowConfig,

    #[serde(default)]
    pub keys: KeyConfig,
}

/// Record type to module routing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Modules for record types with no matching route
    #[serde(default)]
    pub default: ModuleNames,

    /// Message class (e.g. `IPM.Note`) to modules. Merged over the built-in
    /// routes.
    #[serde(default)]
    pub types: HashMap<String, ModuleNames>,
}

/// Notification routing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Notifier modules whose payloads describe folders
    #[serde(default = "default_hierarchy_modules")]
    pub hierarchy_modules: Vec<String>,
}

/// Shadow registry wiring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    /// Do not hook the registry into the store managers at all
    #[serde(default)]
    pub standalone: bool,

    /// Only observe server-confirmed events
    #[serde(default = "default_true")]
    pub server_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    #[serde(default = "default_key_prefix")]
    pub prefix: String,
}

fn default_hierarchy_modules() -> Vec<String> {
    DEFAULT_HIERARCHY_MODULES
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            hierarchy_modules: default_hierarchy_modules(),
        }
    }
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            standalone: false,
            server_only: true,
        }
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            prefix: default_key_prefix(),
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, SyncError> {
        toml::from_str(content)
            .map_err(|e| SyncError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Built-in routes overlaid with the configured ones
    pub fn router(&self) -> ModuleRouter {
        let mut router = ModuleRouter::new(self.routing.default.clone());
        for (class, names) in crate::routing::builtin_routes() {
            router.insert(class, names);
        }
        for (class, names) in &self.routing.types {
            router.insert(class, names.clone());
        }
        router
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("groupware-sync").join("config.toml"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(
            home_dir
                .join(".config")
                .join("groupware-sync")
                .join("config.toml"),
        );
    }

    paths
}

/// Load configuration from the first default path that exists
pub fn load_config() -> Result<SyncConfig, SyncError> {
    info!("Loading configuration from default paths");

    for path in default_config_paths() {
        if path.exists() {
            info!("Found config at: {:?}", path);
            return load_config_from_path(&path);
        }
    }

    info!("No config file found, using defaults");
    Ok(SyncConfig::default())
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<SyncConfig, SyncError> {
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("Failed to read config: {}", e)))?;

    SyncConfig::from_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordType;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.keys.prefix, "ext-record");
        assert!(config.shadow.server_only);
        assert!(!config.shadow.standalone);
        assert!(config
            .notifications
            .hierarchy_modules
            .contains(&"hierarchynotifier".to_string()));
        assert_eq!(config.routing.default.item, "createmailitemmodule");
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = SyncConfig::from_toml_str("").unwrap();
        assert_eq!(config.notifications.hierarchy_modules.len(), 3);
        assert!(config.shadow.server_only);
    }

    #[test]
    fn test_routes_overlay_builtins() {
        let config = SyncConfig::from_toml_str(
            r#"
            [routing.default]
            list = "genericlistmodule"
            item = "genericitemmodule"

            [routing.types."IPM.Task"]
            list = "todolistmodule"
            item = "todoitemmodule"
            "#,
        )
        .unwrap();

        let router = config.router();
        assert_eq!(router.item_module_name(&RecordType::new("IPM.Task")), "todoitemmodule");
        assert_eq!(
            router.item_module_name(&RecordType::new("IPM.Contact")),
            "contactitemmodule"
        );
        assert_eq!(router.item_module_name(&RecordType::new("Other")), "genericitemmodule");
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[shadow]\nstandalone = true\n\n[keys]\nprefix = \"tmp\"").unwrap();

        let config = load_config_from_path(file.path()).unwrap();
        assert!(config.shadow.standalone);
        assert!(config.shadow.server_only);
        assert_eq!(config.keys.prefix, "tmp");
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        match SyncConfig::from_toml_str("routing = 3") {
            Err(SyncError::Config(_)) => {}
            _ => panic!("Expected Config error"),
        }
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        match load_config_from_path(&dir.path().join("absent.toml")) {
            Err(SyncError::Config(_)) => {}
            _ => panic!("Expected Config error"),
        }
    }
}
