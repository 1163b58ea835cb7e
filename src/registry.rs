//! Process-wide plugin registry.
//!
//! Plugins are the factories handing out [`ReaderDriver`]s. The registry is
//! a global map so every part of an application resolves readers through
//! the same directory.

// ───── Std Lib ─────
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// ───── Crates ─────
use lazy_static::lazy_static;

// ───── Local Modules ─────
use crate::driver::ReaderDriver;
use crate::error::ServiceError;
use crate::reader::CardReader;

/// A registered source of reader drivers.
pub trait ReaderPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Names of the readers currently handled by this plugin.
    fn reader_names(&self) -> Vec<String>;

    /// Hands out the driver for one of this plugin's readers.
    fn reader_driver(&self, reader_name: &str) -> Result<Arc<dyn ReaderDriver>, ServiceError>;
}

lazy_static! {
    /// Global directory of registered plugins, keyed by plugin name.
    static ref PLUGINS: Mutex<HashMap<String, Arc<dyn ReaderPlugin>>> =
        Mutex::new(HashMap::new());
}

/// Registers a plugin. Registering the same name twice is an error.
pub fn register_plugin(plugin: Arc<dyn ReaderPlugin>) -> Result<(), ServiceError> {
    let mut plugins = PLUGINS.lock().unwrap();
    let name = plugin.name().to_string();

    if plugins.contains_key(&name) {
        return Err(ServiceError::IllegalState(format!(
            "plugin '{}' is already registered",
            name
        )));
    }

    log::info!("Plugin '{}' registered", name);
    plugins.insert(name, plugin);
    Ok(())
}

/// Removes a plugin from the directory. Returns whether it was present.
pub fn unregister_plugin(name: &str) -> bool {
    let removed = PLUGINS.lock().unwrap().remove(name).is_some();
    if removed {
        log::info!("Plugin '{}' unregistered", name);
    }
    removed
}

pub fn plugin_names() -> Vec<String> {
    PLUGINS.lock().unwrap().keys().cloned().collect()
}

pub fn get_plugin(name: &str) -> Option<Arc<dyn ReaderPlugin>> {
    PLUGINS.lock().unwrap().get(name).cloned()
}

/// Finds the named reader across all registered plugins and wraps its
/// driver into a [`CardReader`].
pub fn find_reader(reader_name: &str) -> Result<CardReader, ServiceError> {
    let plugins: Vec<Arc<dyn ReaderPlugin>> =
        PLUGINS.lock().unwrap().values().cloned().collect();

    for plugin in plugins {
        if plugin
            .reader_names()
            .iter()
            .any(|name| name == reader_name)
        {
            let driver = plugin
                .reader_driver(reader_name)
                .map_err(|e| ServiceError::Plugin(format!("plugin '{}': {}", plugin.name(), e)))?;
            return Ok(CardReader::new(plugin.name(), driver));
        }
    }

    Err(ServiceError::IllegalState(format!(
        "reader '{}' is not handled by any registered plugin",
        reader_name
    )))
}
