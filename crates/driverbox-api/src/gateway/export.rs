//! Subordinate side of the federation socket
//!
//! Dials the master's `/ws/gateway-export`, registers under this gateway's
//! serial number and mirrors local models, devices, shadow and live reports
//! upstream. Device ids travel as `<serial>/<id>` and each device is grouped
//! on the master under a connection named after its model.

use super::session::GatewayError;
use super::{namespaced, GatewayPayload, PayloadType, SyncedDevice, SyncedPoint};
use driverbox_core::{CoreCache, CoreError, Device, DeviceData, Event, Export};
use driverbox_plugin::PluginManager;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};

pub const EXPORT_NAME: &str = "gateway";

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct GatewayExport {
    serial: String,
    plugins: Arc<PluginManager>,
    outbox: Mutex<Option<mpsc::UnboundedSender<GatewayPayload>>>,
    registered: AtomicBool,
}

impl GatewayExport {
    #[must_use]
    pub fn new(serial: impl Into<String>, plugins: Arc<PluginManager>) -> Arc<Self> {
        Arc::new(Self {
            serial: serial.into(),
            plugins,
            outbox: Mutex::new(None),
            registered: AtomicBool::new(false),
        })
    }

    fn cache(&self) -> &Arc<CoreCache> {
        &self.plugins.context().cache
    }

    /// Id of a local device as the master knows it
    #[must_use]
    pub fn upstream_id(&self, id: &str) -> String {
        namespaced(&self.serial, id)
    }

    fn local_id<'a>(&self, id: &'a str) -> &'a str {
        id.strip_prefix(self.serial.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(id)
    }

    /// Bind a fresh master connection and announce this gateway on it
    pub fn attach(&self, outbox: mpsc::UnboundedSender<GatewayPayload>) {
        self.registered.store(false, Ordering::Release);
        let mut register = GatewayPayload::new(PayloadType::Register);
        register.gateway_key = self.serial.clone();
        if outbox.send(register).is_err() {
            tracing::warn!("Master connection closed before registering");
        }
        *self.outbox.lock() = Some(outbox);
    }

    pub fn detach(&self) {
        self.registered.store(false, Ordering::Release);
        self.outbox.lock().take();
    }

    fn send(&self, payload: GatewayPayload) -> bool {
        let kind = payload.kind;
        let sent = self
            .outbox
            .lock()
            .as_ref()
            .is_some_and(|outbox| outbox.send(payload).is_ok());
        if !sent {
            tracing::debug!("Dropping {:?} frame, master is not connected", kind);
        }
        sent
    }

    /// The `syncModels`, `syncDevices` and `syncShadow` frames, in send order
    #[must_use]
    pub fn sync_frames(&self) -> [GatewayPayload; 3] {
        let cache = self.cache();

        let mut models = GatewayPayload::new(PayloadType::SyncModels);
        models.models = cache
            .models()
            .into_iter()
            .map(|mut model| {
                model.devices.clear();
                model
            })
            .collect();

        let mut devices = GatewayPayload::new(PayloadType::SyncDevices);
        devices.devices = cache
            .devices()
            .into_iter()
            .map(|device| self.upstream_device(device))
            .collect();

        let mut shadow = GatewayPayload::new(PayloadType::SyncShadow);
        shadow.shadow = cache
            .shadow()
            .get_devices()
            .into_iter()
            .map(|device| SyncedDevice {
                id: self.upstream_id(&device.id),
                online: device.online,
                points: device
                    .points
                    .into_iter()
                    .map(|(name, point)| (name, SyncedPoint { value: point.value }))
                    .collect(),
            })
            .collect();

        [models, devices, shadow]
    }

    fn upstream_device(&self, device: Device) -> Device {
        let mut upstream = Device::new(
            self.upstream_id(&device.id),
            device.model_name.clone(),
            device.model_name,
        );
        upstream.description = device.description;
        upstream.tags = device.tags;
        upstream.properties = device.properties;
        upstream
    }

    /// Handle one frame from the master, returning the reply to send back if any
    pub async fn handle(&self, payload: GatewayPayload) -> Option<GatewayPayload> {
        match payload.kind {
            PayloadType::RegisterRes => {
                if !payload.error.is_empty() {
                    tracing::error!("Master gateway refused registration: {}", payload.error);
                    return None;
                }
                self.registered.store(true, Ordering::Release);
                tracing::info!("Registered at master gateway as {}", self.serial);
                for frame in self.sync_frames() {
                    self.send(frame);
                }
                None
            }
            PayloadType::UnregisterRes => {
                self.registered.store(false, Ordering::Release);
                None
            }
            PayloadType::Ping => Some(GatewayPayload::new(PayloadType::Pong)),
            PayloadType::Control => {
                let result = self.control(payload.device_data).await;
                if let Err(e) = &result {
                    tracing::warn!("Control from master gateway failed: {}", e);
                }
                Some(GatewayPayload::reply(PayloadType::ControlRes, result))
            }
            kind @ (PayloadType::ReportRes
            | PayloadType::SyncModelsRes
            | PayloadType::SyncDevicesRes
            | PayloadType::SyncShadowRes) => {
                if payload.error.is_empty() {
                    tracing::debug!("Master gateway accepted {:?}", kind);
                } else {
                    tracing::error!("Master gateway answered {:?}: {}", kind, payload.error);
                }
                None
            }
            other => {
                tracing::debug!("Ignoring gateway frame {:?}", other);
                None
            }
        }
    }

    async fn control(&self, data: Option<DeviceData>) -> Result<(), GatewayError> {
        let data = data
            .filter(|data| !data.id.is_empty())
            .ok_or(GatewayError::DeviceId)?;
        if data.values.is_empty() {
            return Ok(());
        }
        let id = self.local_id(&data.id).to_string();
        self.plugins
            .write_points(&id, data.values)
            .await
            .map_err(|e| GatewayError::Control(e.to_string()))
    }

    /// Keep a connection to the master open, reconnecting after failures
    pub async fn run(self: Arc<Self>, url: String) {
        loop {
            match self.connect(&url).await {
                Ok(()) => tracing::warn!("Master gateway {} closed the connection", url),
                Err(e) => tracing::warn!("Master gateway {} unreachable: {}", url, e),
            }
            self.detach();
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn connect(&self, url: &str) -> Result<(), tungstenite::Error> {
        let (socket, _) = tokio_tungstenite::connect_async(url).await?;
        tracing::info!("Connected to master gateway {}", url);
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
        self.attach(outbox.clone());

        while let Some(msg) = receiver.next().await {
            let raw = match msg {
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Binary(bytes)) => bytes,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("Master gateway socket error: {}", e);
                    break;
                }
            };
            let payload: GatewayPayload = match serde_json::from_slice(&raw) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("Malformed gateway frame: {}", e);
                    continue;
                }
            };
            if let Some(reply) = self.handle(payload).await {
                if outbox.send(reply).is_err() {
                    break;
                }
            }
        }

        send_task.abort();
        Ok(())
    }
}

impl Export for GatewayExport {
    fn name(&self) -> &str {
        EXPORT_NAME
    }

    fn is_ready(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    fn on_event(&self, _event: &Event) -> Result<(), CoreError> {
        Ok(())
    }

    fn export_to(&self, data: &DeviceData) {
        if !self.is_ready() {
            return;
        }
        let mut report = GatewayPayload::new(PayloadType::Report);
        let mut upstream = data.clone();
        upstream.id = self.upstream_id(&data.id);
        report.device_data = Some(upstream);
        self.send(report);
    }
}
