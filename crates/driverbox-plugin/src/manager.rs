//! Running plugins and the device-level read/write entry points

use crate::error::PluginError;
use crate::plugin::{Plugin, PluginContext};
use crate::registry::PluginRegistry;
use crate::scheduler::ConnectorScheduler;
use async_trait::async_trait;
use dashmap::DashMap;
use driverbox_core::pipeline::convert_value;
use driverbox_core::{CoreError, DeviceShadow, Point, PointData, PointWriter};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Read-back attempts after a write before giving up on confirmation
pub const CONFIRM_ATTEMPTS: u32 = 10;
/// Backoff unit; attempt `n` waits `n` units
pub const CONFIRM_BACKOFF: Duration = Duration::from_millis(100);

pub struct PluginManager {
    registry: Arc<PluginRegistry>,
    ctx: PluginContext,
    running: DashMap<String, Arc<dyn Plugin>>,
    reload_lock: Mutex<()>,
}

impl PluginManager {
    #[must_use]
    pub fn new(registry: Arc<PluginRegistry>, ctx: PluginContext) -> Self {
        Self {
            registry,
            ctx,
            running: DashMap::new(),
            reload_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn context(&self) -> &PluginContext {
        &self.ctx
    }

    /// Start one plugin per stored config; a failing plugin does not stop the rest
    pub async fn start(&self) -> usize {
        let configs = self.ctx.cache.store().configs().await;
        for (key, config) in configs {
            if self.running.contains_key(&key) {
                continue;
            }
            let plugin = match self.registry.create(&config.protocol_name) {
                Ok(plugin) => plugin,
                Err(e) => {
                    tracing::warn!("Skipping plugin {}: {}", key, e);
                    continue;
                }
            };
            match plugin.initialize(&key, &config, self.ctx.clone()).await {
                Ok(()) => {
                    self.running.insert(key, plugin);
                }
                Err(e) => {
                    tracing::error!("Failed to initialize plugin {}: {}", key, e);
                    plugin.destroy().await;
                }
            }
        }
        tracing::info!("{} plugins running", self.running.len());
        self.running.len()
    }

    #[must_use]
    pub fn plugin(&self, key: &str) -> Option<Arc<dyn Plugin>> {
        self.running.get(key).map(|p| p.clone())
    }

    #[must_use]
    pub fn plugin_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.running.iter().map(|p| p.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Connector owning a device
    pub fn connector(&self, device_id: &str) -> Result<Arc<ConnectorScheduler>, PluginError> {
        let key = self
            .ctx
            .cache
            .device_plugin(device_id)
            .ok_or_else(|| PluginError::DeviceNotFound(device_id.to_string()))?;
        let plugin = self
            .plugin(&key)
            .ok_or(PluginError::PluginNotFound(key))?;
        plugin.connector(device_id)
    }

    fn point(&self, device_id: &str, name: &str) -> Result<Point, PluginError> {
        if self.ctx.cache.get_device(device_id).is_none() {
            return Err(PluginError::DeviceNotFound(device_id.to_string()));
        }
        self.ctx
            .cache
            .get_point_by_device(device_id, name)
            .ok_or_else(|| PluginError::PointNotFound {
                device: device_id.to_string(),
                point: name.to_string(),
            })
    }

    pub async fn write_point(&self, device_id: &str, point: PointData) -> Result<(), PluginError> {
        self.write_points(device_id, vec![point]).await
    }

    /// Validate, coerce and write; confirmation runs in the background
    pub async fn write_points(
        &self,
        device_id: &str,
        points: Vec<PointData>,
    ) -> Result<(), PluginError> {
        let mut converted = Vec::with_capacity(points.len());
        for data in points {
            let point = self.point(device_id, &data.name)?;
            if !point.writable() {
                return Err(PluginError::PointNotWritable {
                    device: device_id.to_string(),
                    point: data.name,
                });
            }
            let value = match point.value_type {
                Some(value_type) => convert_value(&data.value, value_type).map_err(|reason| {
                    CoreError::InvalidPointValue {
                        point: data.name.clone(),
                        reason,
                    }
                })?,
                None => data.value,
            };
            converted.push(PointData::new(data.name, value));
        }

        let connector = self.connector(device_id)?;
        connector.write(device_id, converted.clone()).await?;

        let readable: Vec<PointData> = converted
            .into_iter()
            .filter(|p| {
                self.ctx
                    .cache
                    .get_point_by_device(device_id, &p.name)
                    .is_some_and(|point| point.readable())
            })
            .collect();
        if !readable.is_empty() {
            let shadow = self.ctx.cache.shadow().clone();
            let device_id = device_id.to_string();
            tokio::spawn(async move {
                if !confirm_write(&shadow, &connector, &device_id, &readable).await {
                    tracing::warn!("Write to {} was not confirmed by read-back", device_id);
                }
            });
        }
        Ok(())
    }

    /// Force-read points of a device through the pipeline
    pub async fn read_points(&self, device_id: &str, names: &[String]) -> Result<(), PluginError> {
        for name in names {
            let point = self.point(device_id, name)?;
            if !point.readable() {
                return Err(PluginError::PointNotReadable {
                    device: device_id.to_string(),
                    point: name.clone(),
                });
            }
        }
        self.connector(device_id)?.read(device_id, names).await
    }

    /// Stop every plugin, reload configuration and start again
    pub async fn reload(&self) -> Result<usize, PluginError> {
        let _guard = self.reload_lock.lock().await;
        self.destroy_all().await;
        self.ctx.cache.reload().await?;
        Ok(self.start().await)
    }

    pub async fn destroy_all(&self) {
        let keys = self.plugin_keys();
        for key in keys {
            if let Some((_, plugin)) = self.running.remove(&key) {
                plugin.destroy().await;
            }
        }
    }
}

fn same_value(actual: &Value, expected: &Value) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => (a - b).abs() < 1e-6,
        _ => actual == expected,
    }
}

/// Poll the device until the shadow reflects the written values
async fn confirm_write(
    shadow: &DeviceShadow,
    connector: &ConnectorScheduler,
    device_id: &str,
    points: &[PointData],
) -> bool {
    let names: Vec<String> = points.iter().map(|p| p.name.clone()).collect();
    for attempt in 1..=CONFIRM_ATTEMPTS {
        tokio::time::sleep(CONFIRM_BACKOFF * attempt).await;
        if let Err(e) = connector.read(device_id, &names).await {
            tracing::debug!("Read-back of {} failed: {}", device_id, e);
            continue;
        }
        let confirmed = points.iter().all(|p| {
            shadow
                .get_device_point(device_id, &p.name)
                .ok()
                .flatten()
                .is_some_and(|v| same_value(&v, &p.value))
        });
        if confirmed {
            tracing::debug!("Write to {} confirmed after {} reads", device_id, attempt);
            return true;
        }
    }
    false
}

#[async_trait]
impl PointWriter for PluginManager {
    async fn write_points(&self, device_id: &str, points: Vec<PointData>) -> Result<(), CoreError> {
        PluginManager::write_points(self, device_id, points)
            .await
            .map_err(|e| CoreError::Write {
                device: device_id.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::cache;
    use driverbox_core::{Crontab, DeviceModel};
    use serde_json::json;

    async fn manager(dir: &std::path::Path) -> PluginManager {
        let (cache, pipeline) = cache(dir).await;
        let manager = PluginManager::new(
            Arc::new(PluginRegistry::with_builtins()),
            PluginContext {
                cache,
                pipeline,
                crontab: Arc::new(Crontab::new()),
                virtual_mode: false,
            },
        );
        assert_eq!(manager.start().await, 1);
        manager
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_point_converts_and_echoes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;

        manager
            .write_point("dev3", PointData::new("fan", "2"))
            .await
            .unwrap();
        let shadow = manager.context().cache.shadow();
        assert_eq!(shadow.get_device_point("dev3", "fan").unwrap(), Some(json!(2)));
        let details = shadow.get_device_point_details("dev3", "fan").unwrap().unwrap();
        assert_eq!(details.write_value, json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;

        assert!(matches!(
            manager.write_point("dev3", PointData::new("temp", 1)).await,
            Err(PluginError::PointNotWritable { .. })
        ));
        assert!(matches!(
            manager.write_point("dev3", PointData::new("nope", 1)).await,
            Err(PluginError::PointNotFound { .. })
        ));
        assert!(matches!(
            manager.write_point("ghost", PointData::new("fan", 1)).await,
            Err(PluginError::DeviceNotFound(_))
        ));
        assert!(matches!(
            manager.write_point("dev3", PointData::new("fan", "high")).await,
            Err(PluginError::Core(CoreError::InvalidPointValue { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_points_requires_readable() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;

        assert!(matches!(
            manager.read_points("dev3", &["reset".to_string()]).await,
            Err(PluginError::PointNotReadable { .. })
        ));
        manager
            .read_points("dev3", &["temp".to_string()])
            .await
            .unwrap();
        assert_eq!(
            manager.context().cache.shadow().get_device_point("dev3", "temp").unwrap(),
            Some(json!(0.0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_keeps_added_model_and_connection() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let cache = manager.context().cache.clone();

        cache
            .add_model("virtual", DeviceModel::new("spare", Vec::new()))
            .await
            .unwrap();
        cache
            .add_connection("virtual", "c2", json!({"virtual": true}))
            .await
            .unwrap();
        cache
            .batch_remove_device(&["dev3".to_string(), "dev4".to_string()])
            .await
            .unwrap();

        manager.reload().await.unwrap();
        assert!(cache.get_model("spare").is_some());
        assert!(cache.get_model("hvac").is_some());
        assert!(cache.connection("c2").is_some());
        assert!(cache.get_device("dev3").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_write_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let connector = manager.connector("dev4").unwrap();
        connector
            .write("dev4", vec![PointData::new("fan", 3)])
            .await
            .unwrap();

        let shadow = manager.context().cache.shadow().clone();
        assert!(confirm_write(&shadow, &connector, "dev4", &[PointData::new("fan", 3)]).await);
        assert!(!confirm_write(&shadow, &connector, "dev4", &[PointData::new("fan", 4)]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_restarts_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        assert_eq!(manager.plugin_keys(), vec!["virtual"]);

        assert_eq!(manager.reload().await.unwrap(), 1);
        assert!(manager.connector("dev3").is_ok());

        manager.destroy_all().await;
        assert!(manager.plugin_keys().is_empty());
        assert!(manager.context().crontab.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_point_writer_maps_errors() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let writer: &dyn PointWriter = &manager;
        let err = writer
            .write_points("dev3", vec![PointData::new("temp", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Write { .. }));
    }
}
