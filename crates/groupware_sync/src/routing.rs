//! Record type to backend module routing
//!
//! Each record class maps to a pair of modules: one that serves lists and
//! one that serves single items. Lookup walks the dotted class from the most
//! specific prefix to the least, then falls back to the default pair.

use crate::record::RecordType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleNames {
    pub list: String,
    pub item: String,
}

impl ModuleNames {
    pub fn new(list: &str, item: &str) -> Self {
        Self {
            list: list.to_string(),
            item: item.to_string(),
        }
    }
}

impl Default for ModuleNames {
    fn default() -> Self {
        Self::new("maillistmodule", "createmailitemmodule")
    }
}

/// Built-in routes for the standard message classes
pub fn builtin_routes() -> Vec<(&'static str, ModuleNames)> {
    vec![
        ("IPM.Note", ModuleNames::new("maillistmodule", "createmailitemmodule")),
        (
            "IPM.Appointment",
            ModuleNames::new("appointmentlistmodule", "appointmentitemmodule"),
        ),
        ("IPM.Contact", ModuleNames::new("contactlistmodule", "contactitemmodule")),
        ("IPM.DistList", ModuleNames::new("contactlistmodule", "contactitemmodule")),
        ("IPM.Task", ModuleNames::new("tasklistmodule", "taskitemmodule")),
        (
            "IPM.StickyNote",
            ModuleNames::new("stickynotelistmodule", "stickynoteitemmodule"),
        ),
        (
            "AB",
            ModuleNames::new("addressbooklistmodule", "addressbookitemmodule"),
        ),
        ("IPF", ModuleNames::new("hierarchymodule", "hierarchymodule")),
    ]
}

#[derive(Debug, Clone)]
pub struct ModuleRouter {
    default: ModuleNames,
    table: HashMap<String, ModuleNames>,
}

impl ModuleRouter {
    /// Router with an explicit default and no routes
    pub fn new(default: ModuleNames) -> Self {
        Self {
            default,
            table: HashMap::new(),
        }
    }

    /// Built-in routes with the mail modules as default
    pub fn with_builtin_routes() -> Self {
        let mut router = Self::new(ModuleNames::default());
        for (class, names) in builtin_routes() {
            router.insert(class, names);
        }
        router
    }

    /// Add or replace a route. Classes compare case-insensitively.
    pub fn insert(&mut self, class: &str, names: ModuleNames) {
        self.table.insert(class.to_ascii_lowercase(), names);
    }

    pub fn default_modules(&self) -> &ModuleNames {
        &self.default
    }

    pub fn resolve(&self, record_type: &RecordType) -> &ModuleNames {
        record_type
            .lineage()
            .into_iter()
            .find_map(|prefix| self.table.get(&prefix.to_ascii_lowercase()))
            .unwrap_or(&self.default)
    }

    pub fn list_module_name(&self, record_type: &RecordType) -> &str {
        &self.resolve(record_type).list
    }

    pub fn item_module_name(&self, record_type: &RecordType) -> &str {
        &self.resolve(record_type).item
    }
}

impl Default for ModuleRouter {
    fn default() -> Self {
        Self::with_builtin_routes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_walks_lineage() {
        let router = ModuleRouter::default();
        let t = RecordType::new("IPM.Appointment.Occurrence");
        assert_eq!(router.item_module_name(&t), "appointmentitemmodule");
        assert_eq!(router.list_module_name(&t), "appointmentlistmodule");
    }

    #[test]
    fn test_unknown_type_uses_default() {
        let router = ModuleRouter::default();
        let t = RecordType::new("X.Custom");
        assert_eq!(router.item_module_name(&t), "createmailitemmodule");
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut router = ModuleRouter::new(ModuleNames::default());
        router.insert("IPM.Task", ModuleNames::new("tl", "ti"));
        assert_eq!(router.item_module_name(&RecordType::new("ipm.task")), "ti");
    }

    #[test]
    fn test_distlist_routes_to_contacts() {
        let router = ModuleRouter::default();
        assert_eq!(
            router.item_module_name(&RecordType::new("IPM.DistList")),
            "contactitemmodule"
        );
    }
}
