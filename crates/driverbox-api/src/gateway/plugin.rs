//! The `gateway` plugin: subordinate devices written through `control` frames

use super::session::GatewaySessions;
use super::gateway_of;
use async_trait::async_trait;
use dashmap::DashMap;
use driverbox_core::{CoreCache, DeviceConfig, DeviceData};
use driverbox_plugin::{
    CodecConnector, ConnectionOptions, ConnectorScheduler, Frame, JsonCodec, Plugin,
    PluginContext, PluginError, Transport,
};
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;

/// Protocol name of federated subordinate devices
pub const GATEWAY_PLUGIN: &str = "gateway";
/// Connection field naming the subordinate that owns it
pub const GATEWAY_KEY_FIELD: &str = "gatewayKey";

/// Forwards writes to the subordinate's live session
///
/// Reads answer nothing: subordinate values arrive through `report` frames.
struct GatewayTransport {
    gateway_key: String,
    sessions: Arc<GatewaySessions>,
}

#[async_trait]
impl Transport for GatewayTransport {
    async fn send(&self, frame: Frame) -> Result<Option<Frame>, PluginError> {
        let request = frame.into_json()?;
        if request["mode"] != "write" {
            return Ok(None);
        }
        let data: DeviceData = serde_json::from_value(json!({
            "id": request["id"],
            "values": request["values"],
        }))?;
        let session = self
            .sessions
            .get(&self.gateway_key)
            .ok_or_else(|| PluginError::TransportClosed(self.gateway_key.clone()))?;
        tracing::debug!(
            "Forwarding {} points of {} to gateway {}",
            data.values.len(),
            data.id,
            self.gateway_key
        );
        session.control(data).await?;
        Ok(None)
    }

    async fn close(&self) {}
}

pub struct GatewayPlugin {
    sessions: Arc<GatewaySessions>,
    connectors: DashMap<String, Arc<ConnectorScheduler>>,
    cache: RwLock<Option<Arc<CoreCache>>>,
}

impl GatewayPlugin {
    #[must_use]
    pub fn new(sessions: Arc<GatewaySessions>) -> Self {
        Self {
            sessions,
            connectors: DashMap::new(),
            cache: RwLock::new(None),
        }
    }
}

#[async_trait]
impl Plugin for GatewayPlugin {
    fn name(&self) -> &str {
        GATEWAY_PLUGIN
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
            let gateway_key = value
                .get(GATEWAY_KEY_FIELD)
                .and_then(|v| v.as_str())
                .or_else(|| gateway_of(key))
                .unwrap_or(key)
                .to_string();

            let transport = Arc::new(GatewayTransport {
                gateway_key,
                sessions: self.sessions.clone(),
            });
            let connector = Arc::new(CodecConnector::new(key.clone(), Arc::new(JsonCodec), transport));
            let scheduler = Arc::new(ConnectorScheduler::new(
                connector,
                ctx.pipeline.clone(),
                ctx.cache.shadow().clone(),
                options.scheduler_options(),
            ));
            self.connectors.insert(key.clone(), scheduler);
        }

        tracing::info!(
            "Gateway plugin {} serves {} subordinate connections",
            plugin_key,
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
        self.connectors
            .get(&device.connection_key)
            .map(|c| c.clone())
            .ok_or(PluginError::ConnectorNotFound(device.connection_key))
    }

    async fn destroy(&self) {
        let connectors: Vec<Arc<ConnectorScheduler>> =
            self.connectors.iter().map(|c| c.value().clone()).collect();
        for connector in connectors {
            connector.release().await;
        }
        self.connectors.clear();
        tracing::info!("Gateway plugin destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::session::Session;
    use crate::gateway::PayloadType;
    use driverbox_core::{ConfigStore, Crontab, DeviceShadow, EventBus, Pipeline, PointData};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn gateway_config() -> DeviceConfig {
        serde_json::from_value(json!({
            "protocolName": GATEWAY_PLUGIN,
            "connections": {"sub-1/c1": {GATEWAY_KEY_FIELD: "sub-1", "timeout": 500}},
            "deviceModels": [{
                "name": "sub-1/meter",
                "devicePoints": [
                    {"name": "power", "valueType": "float", "readWrite": "R"},
                    {"name": "relay", "valueType": "int", "readWrite": "RW"}
                ],
                "devices": [{"id": "sub-1/m1", "connectionKey": "sub-1/c1"}]
            }]
        }))
        .unwrap()
    }

    async fn context(dir: &std::path::Path) -> PluginContext {
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(CoreCache::new(
            ConfigStore::new(dir),
            Arc::new(DeviceShadow::new()),
            bus.clone(),
        ));
        cache.add_config(gateway_config()).await.unwrap();
        PluginContext {
            pipeline: Arc::new(Pipeline::new(cache.clone(), bus)),
            cache,
            crontab: Arc::new(Crontab::new()),
            virtual_mode: false,
        }
    }

    #[tokio::test]
    async fn test_write_becomes_control() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        let sessions = Arc::new(GatewaySessions::new());
        let plugin = GatewayPlugin::new(sessions.clone());
        plugin
            .initialize(GATEWAY_PLUGIN, &gateway_config(), ctx.clone())
            .await
            .unwrap();
        let connector = plugin.connector("sub-1/m1").unwrap();
        assert_eq!(connector.key(), "sub-1/c1");
        assert_eq!(connector.group_count(), 0);

        // nobody connected yet
        assert!(matches!(
            connector
                .write("sub-1/m1", vec![PointData::new("relay", 1)])
                .await,
            Err(PluginError::TransportClosed(_))
        ));

        let (tx, mut outbox) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(Uuid::new_v4(), "sub-1", tx));
        sessions.register(session.clone()).unwrap();
        let subordinate = tokio::spawn(async move {
            let frame = outbox.recv().await.unwrap();
            assert_eq!(frame.kind, PayloadType::Control);
            let data = frame.device_data.unwrap();
            session.resolve_control(Ok(()));
            data
        });

        connector
            .write("sub-1/m1", vec![PointData::new("relay", 1)])
            .await
            .unwrap();
        let sent = subordinate.await.unwrap();
        assert_eq!(sent.id, "sub-1/m1");
        assert_eq!(sent.value("relay"), Some(&json!(1)));
        assert_eq!(
            ctx.cache
                .shadow()
                .get_write_point_value("sub-1/m1", "relay")
                .unwrap(),
            Some(json!(1))
        );

        plugin.destroy().await;
        assert!(matches!(
            plugin.connector("sub-1/m1"),
            Err(PluginError::ConnectorNotFound(_))
        ));
    }
}
