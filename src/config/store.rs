//! Path-addressed access to the live configuration
//!
//! Keys are joined by `/`. A `set` must resolve through existing maps down to
//! an existing leaf, and the new value must fit the typed field; otherwise
//! the mutation is aborted with [`PedlError::ConfigPath`].

use super::Config;
use crate::error::{PedlError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// A successful mutation, handed to the change callback
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub path: String,
    pub value: Value,
    /// The configuration after the change
    pub config: Config,
}

impl ConfigChange {
    /// First path segment (`digital_inputs` for `digital_inputs/D1/inverted`)
    pub fn root(&self) -> &str {
        self.path.split('/').next().unwrap_or("")
    }
}

type ChangeCallback = Box<dyn Fn(&ConfigChange) + Send + Sync>;

pub struct ConfigStore {
    config: Mutex<Config>,
    callback: Mutex<Option<ChangeCallback>>,
    dirty: AtomicBool,
    path: Option<PathBuf>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        Self {
            config: Mutex::new(config),
            callback: Mutex::new(None),
            dirty: AtomicBool::new(false),
            path: None,
        }
    }

    /// A store that persists to `path`
    pub fn with_path(config: Config, path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new(config)
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Register the change callback, replacing any previous one
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(&ConfigChange) + Send + Sync + 'static,
    {
        *self.callback.lock() = Some(Box::new(callback));
    }

    /// Copy of the current configuration
    pub fn snapshot(&self) -> Config {
        self.config.lock().clone()
    }

    /// Read the configuration without cloning it
    pub fn read<R>(&self, f: impl FnOnce(&Config) -> R) -> R {
        f(&self.config.lock())
    }

    /// Value at a key path, if it exists
    pub fn get(&self, path: &str) -> Option<Value> {
        let tree = serde_json::to_value(&*self.config.lock()).ok()?;
        let mut node = &tree;
        for key in split_path(path) {
            node = node.as_object()?.get(key)?;
        }
        Some(node.clone())
    }

    /// Set the value at a key path and notify the change callback
    ///
    /// The callback runs before this returns, after the config lock is
    /// released, so it may read the store but must not call `set`. Sets are
    /// serialized through to their callbacks: each callback sees the latest
    /// configuration and callbacks run in mutation order.
    pub fn set(&self, path: &str, value: Value) -> Result<()> {
        let keys: Vec<&str> = split_path(path).collect();
        let (leaf, parents) = keys
            .split_last()
            .ok_or_else(|| PedlError::config_path(path, "empty key path"))?;

        let callback = self.callback.lock();
        let updated = {
            let mut config = self.config.lock();
            let mut tree = serde_json::to_value(&*config)
                .map_err(|e| PedlError::Serialization(e.to_string()))?;

            let mut node = &mut tree;
            for key in parents {
                node = node
                    .as_object_mut()
                    .and_then(|map| map.get_mut(*key))
                    .filter(|child| child.is_object())
                    .ok_or_else(|| {
                        PedlError::config_path(path, format!("'{}' is not a section", key))
                    })?;
            }
            let map = node
                .as_object_mut()
                .ok_or_else(|| PedlError::config_path(path, "parent is not a section"))?;
            let slot = map
                .get_mut(*leaf)
                .ok_or_else(|| PedlError::config_path(path, format!("no key '{}'", leaf)))?;
            *slot = value.clone();

            let mut new_config: Config = serde_json::from_value(tree)
                .map_err(|e| PedlError::config_path(path, e.to_string()))?;
            new_config.fill_missing_inputs();
            *config = new_config.clone();
            new_config
        };

        self.dirty.store(true, Ordering::SeqCst);
        tracing::debug!("config set {} = {}", path, value);

        if let Some(callback) = callback.as_ref() {
            callback(&ConfigChange {
                path: path.to_string(),
                value,
                config: updated,
            });
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Write the configuration to its file if it changed since the last save
    ///
    /// Returns whether anything was written.
    pub fn save_if_dirty(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        if let Err(e) = self.snapshot().save(path) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        tracing::debug!("config saved to {}", path.display());
        Ok(true)
    }

    /// Write the configuration to its file unconditionally
    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| PedlError::Config("config has no file path".to_string()))?;
        self.snapshot().save(path)?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}
