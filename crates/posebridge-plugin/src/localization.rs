//! Localized strings for the host and for plugins.
//!
//! A resource root holds one flat JSON object per language, named
//! `<language>.json`. Lookups try the plugin's own strings first, then the
//! host's, and yield an empty string when neither has the key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::PluginError;
use crate::sync::{read, write};

/// Language used when the requested one has no resource file.
pub const FALLBACK_LANGUAGE: &str = "en";

#[derive(Debug, Default, Clone)]
struct StringTable {
    root: Option<PathBuf>,
    strings: HashMap<String, String>,
}

impl StringTable {
    fn load(root: &Path, language: &str) -> Result<Self, PluginError> {
        let mut file = root.join(format!("{language}.json"));
        if !file.is_file() {
            file = root.join(format!("{FALLBACK_LANGUAGE}.json"));
        }
        let strings = if file.is_file() {
            serde_json::from_str(&std::fs::read_to_string(&file)?)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            root: Some(root.to_path_buf()),
            strings,
        })
    }

    fn reload(&mut self, language: &str) {
        let Some(root) = self.root.clone() else {
            return;
        };
        match Self::load(&root, language) {
            Ok(table) => *self = table,
            Err(e) => {
                tracing::warn!(root = %root.display(), "failed to reload strings: {e}");
                self.strings.clear();
            }
        }
    }
}

pub struct Localization {
    language: RwLock<String>,
    host: RwLock<StringTable>,
    plugins: RwLock<HashMap<String, StringTable>>,
}

impl Localization {
    /// Host strings come from `host_root` when given.
    pub fn new(host_root: Option<&Path>, language: &str) -> Self {
        let host = match host_root {
            Some(root) => StringTable::load(root, language).unwrap_or_else(|e| {
                tracing::warn!(root = %root.display(), "failed to load host strings: {e}");
                StringTable {
                    root: Some(root.to_path_buf()),
                    strings: HashMap::new(),
                }
            }),
            None => StringTable::default(),
        };
        Self {
            language: RwLock::new(language.to_string()),
            host: RwLock::new(host),
            plugins: RwLock::new(HashMap::new()),
        }
    }

    pub fn language(&self) -> String {
        read(&self.language).clone()
    }

    /// Switch language and reload every table.
    pub fn set_language(&self, language: &str) {
        *write(&self.language) = language.to_string();
        write(&self.host).reload(language);
        for table in write(&self.plugins).values_mut() {
            table.reload(language);
        }
        tracing::info!(language, "language changed");
    }

    /// Point a plugin's lookups at its own resource folder.
    pub fn set_plugin_root(&self, guid: &str, root: &Path) -> Result<(), PluginError> {
        let table = StringTable::load(root, &self.language())?;
        tracing::debug!(plugin = %guid, strings = table.strings.len(), "plugin strings loaded");
        write(&self.plugins).insert(guid.to_string(), table);
        Ok(())
    }

    pub fn forget_plugin(&self, guid: &str) {
        write(&self.plugins).remove(guid);
    }

    /// Plugin string first, host string second, empty when neither exists.
    pub fn lookup(&self, guid: &str, key: &str) -> String {
        if let Some(value) = read(&self.plugins)
            .get(guid)
            .and_then(|table| table.strings.get(key))
        {
            return value.clone();
        }
        read(&self.host).strings.get(key).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_strings(dir: &Path, language: &str, json: &str) {
        std::fs::write(dir.join(format!("{language}.json")), json).unwrap();
    }

    #[test]
    fn test_plugin_strings_shadow_host_strings() {
        let host = tempfile::tempdir().unwrap();
        let plugin = tempfile::tempdir().unwrap();
        write_strings(host.path(), "en", r#"{"title":"Host","only_host":"H"}"#);
        write_strings(plugin.path(), "en", r#"{"title":"Plugin"}"#);

        let strings = Localization::new(Some(host.path()), "en");
        strings.set_plugin_root("DEV", plugin.path()).unwrap();

        assert_eq!(strings.lookup("DEV", "title"), "Plugin");
        assert_eq!(strings.lookup("DEV", "only_host"), "H");
        assert_eq!(strings.lookup("OTHER", "title"), "Host");
        assert_eq!(strings.lookup("DEV", "missing"), "");
    }

    #[test]
    fn test_missing_language_falls_back_to_english() {
        let host = tempfile::tempdir().unwrap();
        write_strings(host.path(), "en", r#"{"ok":"OK"}"#);
        let strings = Localization::new(Some(host.path()), "pl");
        assert_eq!(strings.language(), "pl");
        assert_eq!(strings.lookup("ANY", "ok"), "OK");
    }

    #[test]
    fn test_set_language_reloads_tables() {
        let host = tempfile::tempdir().unwrap();
        write_strings(host.path(), "en", r#"{"ok":"OK"}"#);
        write_strings(host.path(), "de", r#"{"ok":"Gut"}"#);
        let strings = Localization::new(Some(host.path()), "en");
        strings.set_language("de");
        assert_eq!(strings.lookup("ANY", "ok"), "Gut");
    }

    #[test]
    fn test_no_roots_yields_empty_strings() {
        let strings = Localization::new(None, "en");
        assert_eq!(strings.lookup("ANY", "anything"), "");
    }

    #[test]
    fn test_malformed_plugin_strings_rejected() {
        let plugin = tempfile::tempdir().unwrap();
        write_strings(plugin.path(), "en", "[1, 2]");
        let strings = Localization::new(None, "en");
        assert!(strings.set_plugin_root("DEV", plugin.path()).is_err());
        assert_eq!(strings.lookup("DEV", "x"), "");
    }
}
