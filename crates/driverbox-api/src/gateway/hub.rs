//! Master side of the federation socket

use super::session::{GatewayError, GatewaySessions, Session};
use super::{gateway_of, namespaced, GatewayPayload, PayloadType, SyncedDevice};
use super::plugin::{GATEWAY_KEY_FIELD, GATEWAY_PLUGIN};
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use driverbox_core::{CoreCache, Device, DeviceConfig, DeviceData, DeviceModel};
use driverbox_plugin::PluginManager;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Request timeout of subordinate connections, in milliseconds
const CONTROL_TIMEOUT_MS: u64 = 5000;
/// Connection key used when a subordinate device names none
const DEFAULT_CONNECTION: &str = "default";

pub struct GatewayHub {
    serial: String,
    sessions: Arc<GatewaySessions>,
    plugins: Arc<PluginManager>,
}

impl GatewayHub {
    #[must_use]
    pub fn new(
        serial: impl Into<String>,
        sessions: Arc<GatewaySessions>,
        plugins: Arc<PluginManager>,
    ) -> Self {
        Self {
            serial: serial.into(),
            sessions,
            plugins,
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<GatewaySessions> {
        &self.sessions
    }

    fn cache(&self) -> &Arc<CoreCache> {
        &self.plugins.context().cache
    }

    /// Handle one inbound frame, returning the reply to send back if any
    pub async fn handle(
        &self,
        connection_id: Uuid,
        outbox: &mpsc::UnboundedSender<GatewayPayload>,
        session: &mut Option<Arc<Session>>,
        payload: GatewayPayload,
    ) -> Option<GatewayPayload> {
        match payload.kind {
            PayloadType::Register => {
                let result = self.register(connection_id, outbox, session, &payload.gateway_key);
                Some(GatewayPayload::reply(PayloadType::RegisterRes, result))
            }
            PayloadType::Unregister => {
                let result = match session.take() {
                    Some(current) => {
                        self.disconnect(&current);
                        Ok(())
                    }
                    None => Err(GatewayError::NotRegistered),
                };
                Some(GatewayPayload::reply(PayloadType::UnregisterRes, result))
            }
            PayloadType::Ping => Some(GatewayPayload::new(PayloadType::Pong)),
            PayloadType::ControlRes => {
                match session {
                    Some(current) => {
                        let result = if payload.error.is_empty() {
                            Ok(())
                        } else {
                            Err(payload.error)
                        };
                        if !current.resolve_control(result) {
                            tracing::debug!(
                                "Gateway {} answered a control nobody waits for",
                                current.gateway_key()
                            );
                        }
                    }
                    None => tracing::warn!("controlRes from an unregistered connection"),
                }
                None
            }
            PayloadType::Report => {
                let result = match session {
                    Some(current) => self.report(current, payload.device_data),
                    None => Err(GatewayError::NotRegistered),
                };
                Some(GatewayPayload::reply(PayloadType::ReportRes, result))
            }
            PayloadType::SyncModels => {
                let result = match session {
                    Some(current) => {
                        self.sync_models(current, payload.models);
                        Ok(())
                    }
                    None => Err(GatewayError::NotRegistered),
                };
                Some(GatewayPayload::reply(PayloadType::SyncModelsRes, result))
            }
            PayloadType::SyncDevices => {
                let result = match session {
                    Some(current) => self.sync_devices(current, payload.devices).await,
                    None => Err(GatewayError::NotRegistered),
                };
                Some(GatewayPayload::reply(PayloadType::SyncDevicesRes, result))
            }
            PayloadType::SyncShadow => {
                let result = match session {
                    Some(current) => {
                        self.sync_shadow(current, payload.shadow);
                        Ok(())
                    }
                    None => Err(GatewayError::NotRegistered),
                };
                Some(GatewayPayload::reply(PayloadType::SyncShadowRes, result))
            }
            other => {
                tracing::debug!("Ignoring gateway frame {:?}", other);
                None
            }
        }
    }

    fn register(
        &self,
        connection_id: Uuid,
        outbox: &mpsc::UnboundedSender<GatewayPayload>,
        session: &mut Option<Arc<Session>>,
        gateway_key: &str,
    ) -> Result<(), GatewayError> {
        if gateway_key.is_empty() || gateway_key.contains('/') {
            return Err(GatewayError::GatewayKey);
        }
        if gateway_key == self.serial {
            return Err(GatewayError::SelfRegister);
        }
        if let Some(current) = session {
            if current.gateway_key() != gateway_key {
                return Err(GatewayError::AlreadyRegistered);
            }
            return Ok(());
        }

        let created = Arc::new(Session::new(connection_id, gateway_key, outbox.clone()));
        self.sessions.register(created.clone())?;
        *session = Some(created);
        tracing::info!("Gateway {} registered", gateway_key);
        Ok(())
    }

    /// Drop the session and mark its devices offline
    pub fn disconnect(&self, session: &Session) {
        if self
            .sessions
            .remove(session.gateway_key(), session.connection_id())
            .is_none()
        {
            return;
        }
        let shadow = self.cache().shadow();
        for device in self.cache().devices() {
            if gateway_of(&device.id) == Some(session.gateway_key()) {
                let _ = shadow.set_offline(&device.id);
            }
        }
        tracing::info!("Gateway {} disconnected", session.gateway_key());
    }

    fn report(&self, session: &Session, data: Option<DeviceData>) -> Result<(), GatewayError> {
        let mut data = data.ok_or(GatewayError::DeviceId)?;
        if data.id.is_empty() {
            return Err(GatewayError::DeviceId);
        }
        data.id = namespaced(session.gateway_key(), &data.id);
        self.plugins.context().pipeline.export_to(vec![data]);
        Ok(())
    }

    fn sync_models(&self, session: &Session, models: Vec<DeviceModel>) {
        let key = session.gateway_key();
        let models: Vec<DeviceModel> = models
            .into_iter()
            .map(|mut model| {
                model.name = namespaced(key, &model.name);
                model.devices.clear();
                model
            })
            .collect();
        tracing::debug!("Gateway {} synced {} models", key, models.len());
        session.stash_models(models);
    }

    /// Register the subordinate's devices under the `gateway` plugin
    async fn sync_devices(&self, session: &Session, devices: Vec<Device>) -> Result<(), GatewayError> {
        let key = session.gateway_key();
        let cache = self.cache();
        let mut models: BTreeMap<String, DeviceModel> = BTreeMap::new();
        let mut connections = BTreeMap::new();
        let mut new_connection = false;

        for mut device in devices {
            if device.id.is_empty() || device.model_name.is_empty() {
                return Err(GatewayError::DeviceId);
            }
            device.id = namespaced(key, &device.id);
            device.model_name = namespaced(key, &device.model_name);
            let connection = if device.connection_key.is_empty() {
                DEFAULT_CONNECTION
            } else {
                device.connection_key.as_str()
            };
            device.connection_key = namespaced(key, connection);
            device.driver_key.clear();

            if let Some(local) = cache.get_device(&device.id) {
                device.description = local.description;
                device.tags = local.tags;
                device.properties = local.properties;
            }

            if !connections.contains_key(&device.connection_key) {
                new_connection |= cache.connection(&device.connection_key).is_none();
                connections.insert(
                    device.connection_key.clone(),
                    json!({GATEWAY_KEY_FIELD: key, "timeout": CONTROL_TIMEOUT_MS}),
                );
            }

            if !models.contains_key(&device.model_name) {
                let model = session
                    .stashed_model(&device.model_name)
                    .or_else(|| cache.get_model(&device.model_name))
                    .map(|mut m| {
                        m.devices.clear();
                        m
                    })
                    .ok_or_else(|| {
                        GatewayError::Sync(format!("model {} is not synced", device.model_name))
                    })?;
                models.insert(device.model_name.clone(), model);
            }
            if let Some(model) = models.get_mut(&device.model_name) {
                model.devices.push(device);
            }
        }

        if models.is_empty() {
            return Ok(());
        }
        let count: usize = models.values().map(|m| m.devices.len()).sum();
        let config = DeviceConfig {
            device_models: models.into_values().collect(),
            connections,
            protocol_name: GATEWAY_PLUGIN.to_string(),
        };
        let plugin_key = cache
            .add_config(config)
            .await
            .map_err(|e| GatewayError::Sync(e.to_string()))?;

        if new_connection || self.plugins.plugin(&plugin_key).is_none() {
            self.plugins
                .reload()
                .await
                .map_err(|e| GatewayError::Sync(e.to_string()))?;
        }
        tracing::info!("Gateway {} synced {} devices", key, count);
        Ok(())
    }

    fn sync_shadow(&self, session: &Session, devices: Vec<SyncedDevice>) {
        let shadow = self.cache().shadow();
        for synced in devices {
            let id = namespaced(session.gateway_key(), &synced.id);
            if !shadow.has_device(&id) {
                tracing::warn!("Gateway {} sent shadow of unknown device {}", session.gateway_key(), id);
                continue;
            }
            for (point, state) in synced.points {
                if state.value.is_null() {
                    continue;
                }
                if let Err(e) = shadow.set_device_point(&id, &point, state.value) {
                    tracing::warn!("Shadow sync of {}.{} failed: {}", id, point, e);
                }
            }
            if !synced.online {
                let _ = shadow.set_offline(&id);
            }
        }
    }

    /// Serve one subordinate connection until it closes
    pub async fn serve(self: Arc<Self>, socket: WebSocket) {
        let connection_id = Uuid::new_v4();
        let (mut sender, mut receiver) = socket.split();
        let (outbox, mut outgoing) = mpsc::unbounded_channel::<GatewayPayload>();

        let send_task = tokio::spawn(async move {
            while let Some(payload) = outgoing.recv().await {
                let text = match serde_json::to_string(&payload) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to encode gateway frame: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let mut session: Option<Arc<Session>> = None;
        while let Some(msg) = receiver.next().await {
            let raw = match msg {
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Binary(bytes)) => bytes,
                Ok(Message::Close(_)) | Err(_) => break,
                _ => continue,
            };
            let payload: GatewayPayload = match serde_json::from_slice(&raw) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("Malformed gateway frame: {}", e);
                    continue;
                }
            };
            if let Some(reply) = self.handle(connection_id, &outbox, &mut session, payload).await {
                if outbox.send(reply).is_err() {
                    break;
                }
            }
        }

        if let Some(current) = session {
            self.disconnect(&current);
        }
        send_task.abort();
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let hub = state.gateway.clone();
    ws.on_upgrade(move |socket| hub.serve(socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayPlugin, SyncedPoint};
    use driverbox_core::{ConfigStore, Crontab, DeviceShadow, EventBus, Pipeline, PointData};
    use driverbox_plugin::{Plugin, PluginContext, PluginRegistry};
    use serde_json::Value;

    struct Fixture {
        hub: GatewayHub,
        outbox: mpsc::UnboundedSender<GatewayPayload>,
        outgoing: mpsc::UnboundedReceiver<GatewayPayload>,
        session: Option<Arc<Session>>,
        connection_id: Uuid,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let bus = Arc::new(EventBus::new());
            let cache = Arc::new(CoreCache::new(
                ConfigStore::new(dir.path()),
                Arc::new(DeviceShadow::new()),
                bus.clone(),
            ));
            cache.reload().await.unwrap();
            let sessions = Arc::new(GatewaySessions::new());
            let registry = PluginRegistry::new();
            let factory_sessions = sessions.clone();
            registry.register(
                GATEWAY_PLUGIN,
                Arc::new(move || Arc::new(GatewayPlugin::new(factory_sessions.clone())) as Arc<dyn Plugin>),
            );
            let plugins = Arc::new(PluginManager::new(
                Arc::new(registry),
                PluginContext {
                    pipeline: Arc::new(Pipeline::new(cache.clone(), bus)),
                    cache,
                    crontab: Arc::new(Crontab::new()),
                    virtual_mode: false,
                },
            ));
            let (outbox, outgoing) = mpsc::unbounded_channel();
            Self {
                hub: GatewayHub::new("master-1", sessions, plugins),
                outbox,
                outgoing,
                session: None,
                connection_id: Uuid::new_v4(),
                _dir: dir,
            }
        }

        async fn send(&mut self, payload: Value) -> Option<GatewayPayload> {
            let payload: GatewayPayload = serde_json::from_value(payload).unwrap();
            self.hub
                .handle(self.connection_id, &self.outbox, &mut self.session, payload)
                .await
        }

        /// Register as `sub-1` with one meter synced
        async fn federated() -> Self {
            let mut fixture = Self::new().await;
            fixture.send(json!({"type": 1, "gateway_key": "sub-1"})).await;
            fixture
                .send(json!({"type": 11, "models": [{
                    "name": "meter",
                    "devicePoints": [
                        {"name": "power", "valueType": "float", "readWrite": "R"},
                        {"name": "relay", "valueType": "int", "readWrite": "RW"}
                    ]
                }]}))
                .await;
            let reply = fixture
                .send(json!({"type": 13, "devices": [
                    {"id": "m1", "modelName": "meter", "connectionKey": "bus0"}
                ]}))
                .await
                .unwrap();
            assert_eq!(reply.kind, PayloadType::SyncDevicesRes);
            assert!(reply.error.is_empty(), "{}", reply.error);
            fixture
        }
    }

    #[tokio::test]
    async fn test_register_rules() {
        let mut fixture = Fixture::new().await;

        let reply = fixture.send(json!({"type": 3})).await.unwrap();
        assert_eq!(reply.error, "gateway is not registered");
        let reply = fixture.send(json!({"type": 1})).await.unwrap();
        assert_eq!(reply.error, "gateway key error");
        let reply = fixture
            .send(json!({"type": 1, "gateway_key": "master-1"}))
            .await
            .unwrap();
        assert_eq!(reply.error, "self register");

        let reply = fixture
            .send(json!({"type": 1, "gateway_key": "sub-1"}))
            .await
            .unwrap();
        assert_eq!(reply.kind, PayloadType::RegisterRes);
        assert!(reply.error.is_empty());
        assert_eq!(fixture.hub.sessions().keys(), vec!["sub-1"]);

        // a second connection cannot take the same key
        let mut other = None;
        let (tx, _rx) = mpsc::unbounded_channel();
        let reply = fixture
            .hub
            .handle(
                Uuid::new_v4(),
                &tx,
                &mut other,
                serde_json::from_value(json!({"type": 1, "gateway_key": "sub-1"})).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(reply.error, "already registered");

        let reply = fixture.send(json!({"type": 5})).await.unwrap();
        assert_eq!(reply.kind, PayloadType::Pong);

        let reply = fixture.send(json!({"type": 3})).await.unwrap();
        assert!(reply.error.is_empty());
        assert!(fixture.hub.sessions().keys().is_empty());
    }

    #[tokio::test]
    async fn test_sync_requires_registration() {
        let mut fixture = Fixture::new().await;
        let reply = fixture
            .send(json!({"type": 7, "device_data": {"id": "m1", "values": []}}))
            .await
            .unwrap();
        assert_eq!(reply.kind, PayloadType::ReportRes);
        assert_eq!(reply.error, "gateway is not registered");
    }

    #[tokio::test]
    async fn test_sync_devices_namespaces_and_starts_plugin() {
        let fixture = Fixture::federated().await;
        let cache = fixture.hub.cache();

        let device = cache.get_device("sub-1/m1").unwrap();
        assert_eq!(device.model_name, "sub-1/meter");
        assert_eq!(device.connection_key, "sub-1/bus0");
        assert_eq!(
            cache.connection("sub-1/bus0").unwrap()[GATEWAY_KEY_FIELD],
            "sub-1"
        );
        assert!(cache.shadow().has_device("sub-1/m1"));
        assert_eq!(fixture.hub.plugins.plugin_keys(), vec![GATEWAY_PLUGIN]);
        assert!(fixture.hub.plugins.connector("sub-1/m1").is_ok());
    }

    #[tokio::test]
    async fn test_sync_devices_needs_model() {
        let mut fixture = Fixture::new().await;
        fixture.send(json!({"type": 1, "gateway_key": "sub-1"})).await;
        let reply = fixture
            .send(json!({"type": 13, "devices": [
                {"id": "m1", "modelName": "ghost", "connectionKey": "bus0"}
            ]}))
            .await
            .unwrap();
        assert_eq!(reply.error, "model sub-1/ghost is not synced");
    }

    #[tokio::test]
    async fn test_report_and_shadow_reach_local_shadow() {
        let mut fixture = Fixture::federated().await;

        let reply = fixture
            .send(json!({"type": 7, "device_data": {
                "id": "sub-1/m1",
                "values": [{"name": "power", "value": 12.5}]
            }}))
            .await
            .unwrap();
        assert!(reply.error.is_empty());
        let shadow = fixture.hub.cache().shadow().clone();
        assert_eq!(
            shadow.get_device_point("sub-1/m1", "power").unwrap(),
            Some(json!(12.5))
        );
        assert!(shadow.get_device_status("sub-1/m1").unwrap());

        let synced = SyncedDevice {
            id: "m1".into(),
            online: false,
            points: BTreeMap::from([("relay".to_string(), SyncedPoint { value: json!(1) })]),
        };
        let reply = fixture
            .send(json!({"type": 15, "shadow": [synced]}))
            .await
            .unwrap();
        assert_eq!(reply.kind, PayloadType::SyncShadowRes);
        assert!(!shadow.get_device_status("sub-1/m1").unwrap());
        let relay = shadow
            .get_device_point_details("sub-1/m1", "relay")
            .unwrap()
            .unwrap();
        assert_eq!(relay.value, json!(1));
    }

    #[tokio::test]
    async fn test_write_round_trips_through_control() {
        let mut fixture = Fixture::federated().await;
        let plugins = fixture.hub.plugins.clone();
        let writing = tokio::spawn(async move {
            plugins
                .write_point("sub-1/m1", PointData::new("relay", 1))
                .await
        });

        let control = fixture.outgoing.recv().await.unwrap();
        assert_eq!(control.kind, PayloadType::Control);
        assert_eq!(control.gateway_key, "sub-1");
        assert_eq!(control.device_data.unwrap().id, "sub-1/m1");

        assert!(fixture.send(json!({"type": 10})).await.is_none());
        writing.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_marks_devices_offline() {
        let mut fixture = Fixture::federated().await;
        fixture
            .send(json!({"type": 7, "device_data": {
                "id": "m1",
                "values": [{"name": "power", "value": 3}]
            }}))
            .await;
        let shadow = fixture.hub.cache().shadow().clone();
        assert!(shadow.get_device_status("sub-1/m1").unwrap());

        let session = fixture.session.take().unwrap();
        fixture.hub.disconnect(&session);
        assert!(!shadow.get_device_status("sub-1/m1").unwrap());
        assert!(fixture.hub.sessions().get("sub-1").is_none());
    }
}
