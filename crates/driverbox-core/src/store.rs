//! Config store: one `config.json` per plugin directory under the driver root
//!
//! Every mutation writes the config to disk before the in-memory copy is
//! replaced, so a failed write leaves the store unchanged. Only `add_config`
//! optimizes the config it stores.

use crate::error::CoreError;
use crate::model::{Device, DeviceConfig, DeviceModel};
use crate::persistence;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Declarative config file of a plugin directory
pub const CONFIG_FILE: &str = "config.json";
/// Optional codec script of a plugin directory
pub const CONVERTER_FILE: &str = "converter.lua";

/// Persistent per-plugin device configs
pub struct ConfigStore {
    root: PathBuf,
    configs: Mutex<BTreeMap<String, DeviceConfig>>,
}

impl ConfigStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            configs: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn config_path(&self, plugin_key: &str) -> PathBuf {
        self.root.join(plugin_key).join(CONFIG_FILE)
    }

    /// Walk the root directory, parse and validate every plugin config
    pub async fn load(&self) -> Result<BTreeMap<String, DeviceConfig>, CoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CoreError::LoadCoreConfig(format!("{}: {e}", self.root.display())))?;

        let mut loaded = BTreeMap::new();
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| CoreError::LoadCoreConfig(format!("{}: {e}", self.root.display())))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| CoreError::LoadCoreConfig(e.to_string()))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            let key = entry.file_name().to_string_lossy().into_owned();
            let path = self.config_path(&key);
            let contents = persistence::read_optional(&path)
                .await
                .map_err(|e| CoreError::LoadCoreConfig(format!("{}: {e}", path.display())))?;
            let Some(contents) = contents else {
                continue;
            };
            let mut config: DeviceConfig = serde_json::from_str(&contents)
                .map_err(|e| CoreError::LoadCoreConfig(format!("{}: {e}", path.display())))?;
            config.normalize();
            config
                .validate()
                .map_err(|e| CoreError::LoadCoreConfig(format!("{}: {e}", path.display())))?;
            tracing::info!(
                "Loaded plugin config {} ({}, {} models)",
                key,
                config.protocol_name,
                config.device_models.len()
            );
            loaded.insert(key, config);
        }

        *self.configs.lock().await = loaded.clone();
        Ok(loaded)
    }

    /// Snapshot of every plugin config, keyed by plugin directory
    pub async fn configs(&self) -> BTreeMap<String, DeviceConfig> {
        self.configs.lock().await.clone()
    }

    pub async fn config(&self, plugin_key: &str) -> Option<DeviceConfig> {
        self.configs.lock().await.get(plugin_key).cloned()
    }

    /// Codec script stored next to a plugin config
    pub async fn script(&self, plugin_key: &str) -> Result<Option<String>, CoreError> {
        let path = self.root.join(plugin_key).join(CONVERTER_FILE);
        Ok(persistence::read_optional(&path).await?)
    }

    async fn persist(&self, plugin_key: &str, config: &DeviceConfig) -> Result<(), CoreError> {
        persistence::write_json(&self.config_path(plugin_key), config).await
    }

    /// Upsert a config, merging into an existing one for the same protocol,
    /// and store its optimized form
    ///
    /// Returns the plugin key the config is stored under.
    pub async fn add_config(&self, mut incoming: DeviceConfig) -> Result<String, CoreError> {
        incoming.normalize();
        incoming.validate()?;

        let mut configs = self.configs.lock().await;
        let existing = configs
            .iter()
            .find(|(_, c)| c.protocol_name == incoming.protocol_name)
            .map(|(k, c)| (k.clone(), c.clone()));

        let (key, merged) = match existing {
            Some((key, mut config)) => {
                config.merge(incoming);
                config.validate()?;
                (key, config)
            }
            None => {
                let mut key = incoming.protocol_name.clone();
                let mut suffix = 1;
                while configs.contains_key(&key) || self.root.join(&key).exists() {
                    key = format!("{}_{suffix}", incoming.protocol_name);
                    suffix += 1;
                }
                (key, incoming)
            }
        };
        let merged = merged.optimized();

        self.persist(&key, &merged).await?;
        configs.insert(key.clone(), merged);
        tracing::info!("Stored plugin config {}", key);
        Ok(key)
    }

    /// Add a model to a plugin config; an existing model of that name is kept
    pub async fn add_model(&self, plugin_key: &str, mut model: DeviceModel) -> Result<(), CoreError> {
        let mut configs = self.configs.lock().await;
        let Some(current) = configs.get(plugin_key) else {
            return Err(CoreError::PluginNotFound(plugin_key.to_string()));
        };
        if current.model(&model.name).is_some() {
            return Ok(());
        }

        let mut config = current.clone();
        for device in &mut model.devices {
            device.model_name.clone_from(&model.name);
        }
        config.device_models.push(model);
        config.normalize();
        config.validate()?;

        self.persist(plugin_key, &config).await?;
        configs.insert(plugin_key.to_string(), config);
        Ok(())
    }

    /// Insert or replace a device under its model; returns the plugin key
    pub async fn add_or_update_device(&self, device: Device) -> Result<String, CoreError> {
        let mut configs = self.configs.lock().await;
        let Some((key, current)) = configs
            .iter()
            .find(|(_, c)| c.model(&device.model_name).is_some())
        else {
            return Err(CoreError::ModelNotFound(device.model_name.clone()));
        };
        if !current.connections.contains_key(&device.connection_key) {
            return Err(CoreError::ConnectionNotFound(device.connection_key.clone()));
        }

        let key = key.clone();
        let mut config = current.clone();
        if let Some(model) = config.model_mut(&device.model_name) {
            match model.devices.iter_mut().find(|d| d.id == device.id) {
                Some(existing) => *existing = device,
                None => model.devices.push(device),
            }
        }

        self.persist(&key, &config).await?;
        configs.insert(key.clone(), config);
        Ok(key)
    }

    /// Remove devices from whichever configs hold them
    pub async fn batch_remove_device(&self, ids: &[String]) -> Result<(), CoreError> {
        let mut configs = self.configs.lock().await;
        let mut changed = Vec::new();
        for (key, current) in configs.iter() {
            if !current.devices().any(|d| ids.contains(&d.id)) {
                continue;
            }
            let mut config = current.clone();
            for model in &mut config.device_models {
                model.devices.retain(|d| !ids.contains(&d.id));
            }
            changed.push((key.clone(), config));
        }

        for (key, config) in changed {
            self.persist(&key, &config).await?;
            configs.insert(key, config);
        }
        Ok(())
    }

    pub async fn update_device_property(
        &self,
        id: &str,
        property: &str,
        value: &str,
    ) -> Result<(), CoreError> {
        let mut configs = self.configs.lock().await;
        let Some((key, current)) = configs.iter().find(|(_, c)| c.device(id).is_some()) else {
            return Err(CoreError::DeviceNotFound(id.to_string()));
        };

        let key = key.clone();
        let mut config = current.clone();
        for device in config
            .device_models
            .iter_mut()
            .flat_map(|m| m.devices.iter_mut())
            .filter(|d| d.id == id)
        {
            device
                .properties
                .insert(property.to_string(), value.to_string());
        }

        self.persist(&key, &config).await?;
        configs.insert(key, config);
        Ok(())
    }

    /// Add or replace a connection of a plugin config
    pub async fn add_connection(
        &self,
        plugin_key: &str,
        connection_key: &str,
        connection: Value,
    ) -> Result<(), CoreError> {
        let mut configs = self.configs.lock().await;
        let Some(current) = configs.get(plugin_key) else {
            return Err(CoreError::PluginNotFound(plugin_key.to_string()));
        };

        let mut config = current.clone();
        config
            .connections
            .insert(connection_key.to_string(), connection);

        self.persist(plugin_key, &config).await?;
        configs.insert(plugin_key.to_string(), config);
        Ok(())
    }

    pub async fn connection(&self, connection_key: &str) -> Option<Value> {
        self.configs
            .lock()
            .await
            .values()
            .find_map(|c| c.connections.get(connection_key).cloned())
    }

    pub async fn plugin_of_connection(&self, connection_key: &str) -> Option<String> {
        self.configs
            .lock()
            .await
            .iter()
            .find(|(_, c)| c.connections.contains_key(connection_key))
            .map(|(k, _)| k.clone())
    }

    pub async fn plugin_of_model(&self, model_name: &str) -> Option<String> {
        self.configs
            .lock()
            .await
            .iter()
            .find(|(_, c)| c.model(model_name).is_some())
            .map(|(k, _)| k.clone())
    }
}
