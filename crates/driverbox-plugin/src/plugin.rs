//! Plugin contract and the codec/transport based plugin

use crate::codec::Codec;
use crate::connector::CodecConnector;
use crate::error::PluginError;
use crate::group::create_point_groups;
use crate::scheduler::{ConnectorScheduler, SchedulerOptions};
use crate::transport::{Transport, VirtualTransport};
use async_trait::async_trait;
use dashmap::DashMap;
use driverbox_core::{CoreCache, Crontab, DeviceConfig, Pipeline};
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Shared services handed to plugins at initialization
#[derive(Clone)]
pub struct PluginContext {
    pub cache: Arc<CoreCache>,
    pub pipeline: Arc<Pipeline>,
    pub crontab: Arc<Crontab>,
    /// Replace every transport with the in-memory simulator
    pub virtual_mode: bool,
}

/// A protocol driver owning the connectors of one plugin config
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Build and start connectors from the config's connections
    async fn initialize(
        &self,
        plugin_key: &str,
        config: &DeviceConfig,
        ctx: PluginContext,
    ) -> Result<(), PluginError>;

    /// Connector owning the device's connection
    fn connector(&self, device_id: &str) -> Result<Arc<ConnectorScheduler>, PluginError>;

    /// Stop connector loops, then close transports
    async fn destroy(&self);
}

fn default_enable() -> bool {
    true
}

fn default_timeout() -> u64 {
    1000
}

fn default_retry() -> u32 {
    3
}

fn default_min_interval() -> u64 {
    100
}

fn default_batch_read_len() -> u64 {
    32
}

fn default_offline_threshold() -> u32 {
    1
}

/// Options recognized on every connection; other keys belong to the codec
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    #[serde(default, rename = "virtual")]
    pub virtual_mode: bool,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_enable")]
    pub enable: bool,
    /// Request timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_retry")]
    pub retry: u32,
    /// Pause between requests in milliseconds
    #[serde(default = "default_min_interval")]
    pub min_interval: u64,
    #[serde(default = "default_batch_read_len")]
    pub batch_read_len: u64,
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold: u32,
}

impl ConnectionOptions {
    #[must_use]
    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            timeout: Duration::from_millis(self.timeout),
            retry: self.retry,
            min_interval: Duration::from_millis(self.min_interval),
            offline_threshold: self.offline_threshold,
        }
    }
}

pub type TransportFactory =
    Arc<dyn Fn(&str, &ConnectionOptions) -> Result<Arc<dyn Transport>, PluginError> + Send + Sync>;

/// Plugin built from a codec and a transport factory
pub struct ConnectorPlugin {
    name: String,
    codec: Arc<dyn Codec>,
    transport_factory: TransportFactory,
    connectors: DashMap<String, Arc<ConnectorScheduler>>,
    cache: RwLock<Option<Arc<CoreCache>>>,
}

impl ConnectorPlugin {
    #[must_use]
    pub fn new(name: impl Into<String>, codec: Arc<dyn Codec>, transport_factory: TransportFactory) -> Self {
        Self {
            name: name.into(),
            codec,
            transport_factory,
            connectors: DashMap::new(),
            cache: RwLock::new(None),
        }
    }

    /// Started connector for a connection key
    #[must_use]
    pub fn connection(&self, connection_key: &str) -> Option<Arc<ConnectorScheduler>> {
        self.connectors.get(connection_key).map(|c| c.clone())
    }
}

#[async_trait]
impl Plugin for ConnectorPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(
        &self,
        plugin_key: &str,
        config: &DeviceConfig,
        ctx: PluginContext,
    ) -> Result<(), PluginError> {
        *self.cache.write() = Some(ctx.cache.clone());

        for (key, value) in &config.connections {
            let options: ConnectionOptions = serde_json::from_value(value.clone())
                .map_err(|e| PluginError::InvalidConnection(format!("{key}: {e}")))?;
            if !options.enable {
                tracing::info!("Connection {} of {} is disabled", key, plugin_key);
                continue;
            }

            let transport: Arc<dyn Transport> = if options.virtual_mode || ctx.virtual_mode {
                Arc::new(VirtualTransport::new())
            } else {
                (self.transport_factory)(key, &options)?
            };
            let connector = Arc::new(CodecConnector::new(key.clone(), self.codec.clone(), transport));
            let scheduler = Arc::new(ConnectorScheduler::new(
                connector,
                ctx.pipeline.clone(),
                ctx.cache.shadow().clone(),
                options.scheduler_options(),
            ));

            for device in config.devices().filter(|d| &d.connection_key == key) {
                if let Some(model) = config.model(&device.model_name) {
                    scheduler.add_groups(create_point_groups(&device.id, model, options.batch_read_len));
                }
            }
            scheduler.start(&ctx.crontab)?;
            self.connectors.insert(key.clone(), scheduler);
        }

        tracing::info!(
            "Plugin {} ({}) initialized {} connectors",
            plugin_key,
            self.name,
            self.connectors.len()
        );
        Ok(())
    }

    fn connector(&self, device_id: &str) -> Result<Arc<ConnectorScheduler>, PluginError> {
        let cache = self
            .cache
            .read()
            .clone()
            .ok_or(PluginError::NotSupportGetConnector)?;
        let device = cache
            .get_device(device_id)
            .ok_or_else(|| PluginError::DeviceNotFound(device_id.to_string()))?;
        self.connection(&device.connection_key)
            .ok_or(PluginError::ConnectorNotFound(device.connection_key))
    }

    async fn destroy(&self) {
        let connectors: Vec<Arc<ConnectorScheduler>> =
            self.connectors.iter().map(|c| c.value().clone()).collect();
        for connector in &connectors {
            connector.stop();
        }
        for connector in connectors {
            connector.release().await;
        }
        self.connectors.clear();
        tracing::info!("Plugin {} destroyed", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::scheduler::tests::cache;

    fn virtual_plugin() -> ConnectorPlugin {
        ConnectorPlugin::new(
            "virtual",
            Arc::new(JsonCodec),
            Arc::new(|_key: &str, _options: &ConnectionOptions| {
                Ok(Arc::new(VirtualTransport::new()) as Arc<dyn Transport>)
            }),
        )
    }

    #[test]
    fn test_connection_option_defaults() {
        let options: ConnectionOptions =
            serde_json::from_value(serde_json::json!({"address": "10.0.0.2:502"})).unwrap();
        assert!(options.enable);
        assert!(!options.virtual_mode);
        let scheduler = options.scheduler_options();
        assert_eq!(scheduler.timeout, Duration::from_millis(1000));
        assert_eq!(scheduler.retry, 3);
        assert_eq!(options.batch_read_len, 32);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_resolves_connectors_by_device() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, pipeline) = cache(dir.path()).await;
        let crontab = Arc::new(Crontab::new());
        let plugin = virtual_plugin();
        let config = cache.store().config("virtual").await.unwrap();

        plugin
            .initialize(
                "virtual",
                &config,
                PluginContext {
                    cache: cache.clone(),
                    pipeline,
                    crontab: crontab.clone(),
                    virtual_mode: false,
                },
            )
            .await
            .unwrap();

        let connector = plugin.connector("dev3").unwrap();
        assert_eq!(connector.key(), "c1");
        assert_eq!(connector.group_count(), 2);
        assert!(matches!(
            plugin.connector("ghost"),
            Err(PluginError::DeviceNotFound(_))
        ));

        plugin.destroy().await;
        assert!(crontab.is_empty());
        assert!(matches!(
            plugin.connector("dev3"),
            Err(PluginError::ConnectorNotFound(_))
        ));
    }
}
