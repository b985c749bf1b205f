//! Device auto-discovery: registers devices announced by `DeviceDiscover`
//!
//! The event carries a library model key and a device; the model is loaded
//! from `library/model/<key>.json`, renamed, patched with per-point overrides
//! and added to the plugin owning the protocol before the device itself.

use crate::bus::Export;
use crate::cache::CoreCache;
use crate::data::DeviceData;
use crate::error::CoreError;
use crate::event::{Event, EventCode};
use crate::library::LibraryStore;
use crate::model::{Device, DeviceModel};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const EXPORT_NAME: &str = "discover";

/// Payload of a `DeviceDiscover` event
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDiscover {
    /// Name of the registered model; `<protocolName>_<modelKey>` when empty
    #[serde(default)]
    pub model_name: String,
    pub model_key: String,
    pub device: Map<String, Value>,
    /// Point name to the properties replacing the library definition
    #[serde(default)]
    pub model: BTreeMap<String, Map<String, Value>>,
    pub protocol_name: String,
    pub connection_key: String,
}

impl DeviceDiscover {
    fn registered_model_name(&self) -> String {
        if self.model_name.is_empty() {
            format!("{}_{}", self.protocol_name, self.model_key)
        } else {
            self.model_name.clone()
        }
    }
}

type Request = (String, DeviceDiscover);

pub struct DiscoverExport {
    cache: Arc<CoreCache>,
    library: Arc<LibraryStore>,
    ready: AtomicBool,
    tx: mpsc::UnboundedSender<Request>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Request>>>,
}

impl DiscoverExport {
    #[must_use]
    pub fn new(cache: Arc<CoreCache>, library: Arc<LibraryStore>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            cache,
            library,
            ready: AtomicBool::new(false),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    /// Spawn the worker applying discovered devices; only the first call starts one
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let mut rx = self.rx.lock().take()?;
        let cache = self.cache.clone();
        let library = self.library.clone();
        self.ready.store(true, Ordering::Release);
        Some(tokio::spawn(async move {
            while let Some((id, request)) = rx.recv().await {
                if let Err(e) = register(&cache, &library, request).await {
                    tracing::error!("Auto discover of device {} failed: {}", id, e);
                }
            }
            tracing::debug!("Discover worker stopped");
        }))
    }

    /// Register one discovered device and its model
    pub async fn discover(&self, request: DeviceDiscover) -> Result<(), CoreError> {
        register(&self.cache, &self.library, request).await
    }
}

impl Export for DiscoverExport {
    fn name(&self) -> &str {
        EXPORT_NAME
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn on_event(&self, event: &Event) -> Result<(), CoreError> {
        if event.code != EventCode::DeviceDiscover {
            return Ok(());
        }
        tracing::info!("Device auto discover {}", event.key);
        let request: DeviceDiscover = serde_json::from_value(event.value.clone())?;
        self.tx
            .send((event.key.clone(), request))
            .map_err(|_| CoreError::Export {
                export: EXPORT_NAME.to_string(),
                reason: "discover worker stopped".to_string(),
            })
    }

    fn export_to(&self, _data: &DeviceData) {}
}

async fn register(
    cache: &CoreCache,
    library: &LibraryStore,
    request: DeviceDiscover,
) -> Result<(), CoreError> {
    let mut model: DeviceModel = library
        .model(&request.model_key)
        .await?
        .ok_or_else(|| CoreError::ModelNotFound(request.model_key.clone()))?;
    model.name = request.registered_model_name();
    model.devices.clear();
    for point in &mut model.device_points {
        let Some(overrides) = request.model.get(&point.name) else {
            continue;
        };
        let mut patched = match serde_json::to_value(&*point)? {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        patched.extend(overrides.clone());
        *point = serde_json::from_value(Value::Object(patched))?;
    }

    let plugin = cache
        .store()
        .configs()
        .await
        .into_iter()
        .find(|(_, c)| c.protocol_name == request.protocol_name)
        .map(|(key, _)| key)
        .ok_or_else(|| CoreError::PluginNotFound(request.protocol_name.clone()))?;

    let mut device = request.device;
    device.insert("modelName".to_string(), Value::String(model.name.clone()));
    device.insert(
        "connectionKey".to_string(),
        Value::String(request.connection_key.clone()),
    );
    let device: Device = serde_json::from_value(Value::Object(device))?;

    let model_name = model.name.clone();
    cache.add_model(&plugin, model).await?;
    cache.add_or_update_device(device).await?;
    tracing::info!("Discovered device registered under model {}", model_name);
    Ok(())
}
