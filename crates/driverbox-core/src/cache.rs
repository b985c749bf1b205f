//! Core cache: in-memory index over the config store
//!
//! Lookups take a read lock on the index only. Mutations are serialized,
//! persisted through the store, and then folded back into the index; events
//! are published after every lock is released.

use crate::bus::EventBus;
use crate::error::CoreError;
use crate::event::EventCode;
use crate::model::{Device, DeviceConfig, DeviceModel, Point};
use crate::shadow::DeviceShadow;
use crate::store::ConfigStore;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct ModelEntry {
    plugin: String,
    model: DeviceModel,
    points: HashMap<String, Point>,
}

#[derive(Debug, Clone)]
struct ConnectionEntry {
    plugin: String,
    value: Value,
}

#[derive(Debug, Default)]
struct Index {
    models: HashMap<String, ModelEntry>,
    devices: HashMap<String, Device>,
    device_plugins: HashMap<String, String>,
    connections: HashMap<String, ConnectionEntry>,
    tags: HashMap<String, BTreeSet<String>>,
}

impl Index {
    fn build(configs: &BTreeMap<String, DeviceConfig>) -> Result<Self, CoreError> {
        let mut index = Self::default();
        for (plugin, config) in configs {
            for (key, value) in &config.connections {
                if let Some(owner) = index.connections.get(key) {
                    return Err(CoreError::LoadCoreConfig(format!(
                        "connection {key} is declared by both {} and {plugin}",
                        owner.plugin
                    )));
                }
                index.connections.insert(
                    key.clone(),
                    ConnectionEntry {
                        plugin: plugin.clone(),
                        value: value.clone(),
                    },
                );
            }

            for model in &config.device_models {
                if let Some(existing) = index.models.get(&model.name) {
                    if existing.model.model_id != model.model_id {
                        return Err(CoreError::LoadCoreConfig(format!(
                            "model {} redefined with modelId {} (was {})",
                            model.name, model.model_id, existing.model.model_id
                        )));
                    }
                } else {
                    let mut definition = model.clone();
                    definition.devices.clear();
                    index.models.insert(
                        model.name.clone(),
                        ModelEntry {
                            plugin: plugin.clone(),
                            points: model
                                .device_points
                                .iter()
                                .map(|p| (p.name.clone(), p.clone()))
                                .collect(),
                            model: definition,
                        },
                    );
                }

                for device in &model.devices {
                    if let Some(existing) = index.devices.get(&device.id) {
                        return Err(CoreError::LoadCoreConfig(
                            CoreError::ConflictModel {
                                id: device.id.clone(),
                                requested: device.model_name.clone(),
                                existing: existing.model_name.clone(),
                            }
                            .to_string(),
                        ));
                    }
                    for tag in &device.tags {
                        index
                            .tags
                            .entry(tag.clone())
                            .or_default()
                            .insert(device.id.clone());
                    }
                    index.device_plugins.insert(device.id.clone(), plugin.clone());
                    index.devices.insert(device.id.clone(), device.clone());
                }
            }
        }
        Ok(index)
    }
}

/// Indexed view of every configured connection, model and device
pub struct CoreCache {
    store: ConfigStore,
    shadow: Arc<DeviceShadow>,
    bus: Arc<EventBus>,
    index: RwLock<Index>,
    mutation: Mutex<()>,
}

impl CoreCache {
    #[must_use]
    pub fn new(store: ConfigStore, shadow: Arc<DeviceShadow>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            shadow,
            bus,
            index: RwLock::new(Index::default()),
            mutation: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    #[must_use]
    pub fn shadow(&self) -> &Arc<DeviceShadow> {
        &self.shadow
    }

    /// Reset the index and reload everything from disk
    ///
    /// Mutations issued meanwhile wait until the reload completes.
    pub async fn reload(&self) -> Result<(), CoreError> {
        let _guard = self.mutation.lock().await;
        let configs = self.store.load().await?;
        let index = Index::build(&configs)?;
        let devices = index.devices.len();
        self.register_shadow(&index);
        *self.index.write() = index;
        tracing::info!("Core cache loaded {} plugin configs, {} devices", configs.len(), devices);
        Ok(())
    }

    fn register_shadow(&self, index: &Index) {
        for device in index.devices.values() {
            self.shadow
                .add_device(&device.id, &device.model_name, device.ttl().ok());
        }
    }

    /// Re-index from the store and announce devices that were not known before
    async fn refresh(&self) -> Result<(), CoreError> {
        let configs = self.store.configs().await;
        let next = Index::build(&configs)?;
        self.register_shadow(&next);
        let added: Vec<String> = {
            let mut index = self.index.write();
            let mut added: Vec<String> = next
                .devices
                .keys()
                .filter(|id| !index.devices.contains_key(*id))
                .cloned()
                .collect();
            added.sort();
            *index = next;
            added
        };
        for id in added {
            self.bus.trigger_events(EventCode::DeviceAdded, &id, Value::Null);
        }
        Ok(())
    }

    fn check_device(&self, device: &Device) -> Result<(), CoreError> {
        let index = self.index.read();
        if !index.models.contains_key(&device.model_name) {
            return Err(CoreError::ModelNotFound(device.model_name.clone()));
        }
        if let Some(existing) = index.devices.get(&device.id) {
            if existing.model_name != device.model_name {
                return Err(CoreError::ConflictModel {
                    id: device.id.clone(),
                    requested: device.model_name.clone(),
                    existing: existing.model_name.clone(),
                });
            }
        }
        Ok(())
    }

    // ----- queries -----

    #[must_use]
    pub fn get_model(&self, name: &str) -> Option<DeviceModel> {
        self.index.read().models.get(name).map(|m| m.model.clone())
    }

    #[must_use]
    pub fn get_device(&self, id: &str) -> Option<Device> {
        self.index.read().devices.get(id).cloned()
    }

    #[must_use]
    pub fn get_point_by_model(&self, model: &str, point: &str) -> Option<Point> {
        self.index
            .read()
            .models
            .get(model)
            .and_then(|m| m.points.get(point))
            .cloned()
    }

    #[must_use]
    pub fn get_point_by_device(&self, id: &str, point: &str) -> Option<Point> {
        let index = self.index.read();
        let device = index.devices.get(id)?;
        index
            .models
            .get(&device.model_name)
            .and_then(|m| m.points.get(point))
            .cloned()
    }

    /// Every configured device, ordered by id
    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.index.read().devices.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    #[must_use]
    pub fn models(&self) -> Vec<DeviceModel> {
        let mut models: Vec<DeviceModel> =
            self.index.read().models.values().map(|m| m.model.clone()).collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }

    #[must_use]
    pub fn devices_by_tag(&self, tag: &str) -> Vec<Device> {
        let index = self.index.read();
        index
            .tags
            .get(tag)
            .into_iter()
            .flatten()
            .filter_map(|id| index.devices.get(id).cloned())
            .collect()
    }

    /// Plugin directory that owns a device
    #[must_use]
    pub fn device_plugin(&self, id: &str) -> Option<String> {
        self.index.read().device_plugins.get(id).cloned()
    }

    /// Plugin directory that owns a model
    #[must_use]
    pub fn model_plugin(&self, name: &str) -> Option<String> {
        self.index.read().models.get(name).map(|m| m.plugin.clone())
    }

    #[must_use]
    pub fn connection(&self, key: &str) -> Option<Value> {
        self.index.read().connections.get(key).map(|c| c.value.clone())
    }

    #[must_use]
    pub fn connection_plugin(&self, key: &str) -> Option<String> {
        self.index.read().connections.get(key).map(|c| c.plugin.clone())
    }

    // ----- mutations -----

    /// Upsert a plugin config (merged by protocol) and announce new devices
    pub async fn add_config(&self, mut config: DeviceConfig) -> Result<String, CoreError> {
        let _guard = self.mutation.lock().await;
        config.normalize();
        {
            let index = self.index.read();
            for model in &config.device_models {
                if let Some(existing) = index.models.get(&model.name) {
                    if existing.model.model_id != model.model_id {
                        return Err(CoreError::InvalidConfig(format!(
                            "model {} already defined with modelId {}",
                            model.name, existing.model.model_id
                        )));
                    }
                }
            }
        }
        for device in config.devices() {
            if let Some(existing) = self.get_device(&device.id) {
                if existing.model_name != device.model_name {
                    return Err(CoreError::ConflictModel {
                        id: device.id.clone(),
                        requested: device.model_name.clone(),
                        existing: existing.model_name,
                    });
                }
            }
        }

        let key = self.store.add_config(config).await?;
        self.refresh().await?;
        Ok(key)
    }

    /// Add a model to a plugin; a model that already exists is left alone
    pub async fn add_model(&self, plugin: &str, model: DeviceModel) -> Result<(), CoreError> {
        let _guard = self.mutation.lock().await;
        if self.index.read().models.contains_key(&model.name) {
            return Ok(());
        }
        self.store.add_model(plugin, model).await?;
        self.refresh().await
    }

    /// Insert or replace a device
    pub async fn add_or_update_device(&self, mut device: Device) -> Result<(), CoreError> {
        let _guard = self.mutation.lock().await;
        self.check_device(&device)?;
        device.ttl()?;
        if device.description.is_empty() {
            device.description.clone_from(&device.id);
        }
        self.store.add_or_update_device(device).await?;
        self.refresh().await
    }

    /// Remove devices everywhere; `DeviceDeleting` fires while they can still be queried
    pub async fn batch_remove_device(&self, ids: &[String]) -> Result<(), CoreError> {
        let _guard = self.mutation.lock().await;
        let known: Vec<String> = {
            let index = self.index.read();
            ids.iter()
                .filter(|id| index.devices.contains_key(*id))
                .cloned()
                .collect()
        };
        for id in &known {
            self.bus
                .trigger_events(EventCode::DeviceDeleting, id, Value::Null);
        }

        self.store.batch_remove_device(&known).await?;
        self.refresh().await?;
        self.shadow.delete_device(&known);
        tracing::info!("Removed {} devices", known.len());
        Ok(())
    }

    pub async fn update_device_property(
        &self,
        id: &str,
        property: &str,
        value: &str,
    ) -> Result<(), CoreError> {
        let _guard = self.mutation.lock().await;
        if self.get_device(id).is_none() {
            return Err(CoreError::DeviceNotFound(id.to_string()));
        }
        self.store.update_device_property(id, property, value).await?;
        self.refresh().await
    }

    pub async fn add_connection(
        &self,
        plugin: &str,
        key: &str,
        connection: Value,
    ) -> Result<(), CoreError> {
        let _guard = self.mutation.lock().await;
        if let Some(owner) = self.connection_plugin(key) {
            if owner != plugin {
                return Err(CoreError::InvalidConfig(format!(
                    "connection {key} belongs to {owner}"
                )));
            }
        }
        self.store.add_connection(plugin, key, connection).await?;
        self.refresh().await
    }
}
