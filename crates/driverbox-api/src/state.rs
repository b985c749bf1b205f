//! Service wiring shared by every handler

use crate::gateway::{GatewayExport, GatewayHub, GatewayPlugin, GatewaySessions, GATEWAY_PLUGIN};
use dashmap::DashMap;
use driverbox_core::discover::DiscoverExport;
use driverbox_core::library::LibraryStore;
use driverbox_core::metadata::Metadata;
use driverbox_core::{
    ConfigStore, CoreCache, CoreError, Crontab, DeviceShadow, EventBus, Pipeline, PointWriter,
    Settings,
};
use driverbox_plugin::{Plugin, PluginContext, PluginManager, PluginRegistry};
use linkedge_engine::{LinkEdge, LinkEdgeError};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Failed to initialize logger: {0}")]
    InitLogger(String),

    #[error("Failed to load core config: {0}")]
    LoadCoreConfig(String),
}

impl From<CoreError> for StartupError {
    fn from(e: CoreError) -> Self {
        Self::LoadCoreConfig(e.to_string())
    }
}

impl From<LinkEdgeError> for StartupError {
    fn from(e: LinkEdgeError) -> Self {
        Self::LoadCoreConfig(e.to_string())
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub metadata: Arc<Metadata>,
    pub cache: Arc<CoreCache>,
    pub bus: Arc<EventBus>,
    pub crontab: Arc<Crontab>,
    pub plugins: Arc<PluginManager>,
    pub linkedge: Arc<LinkEdge>,
    pub library: Arc<LibraryStore>,
    /// Process-local key/value store for plugins and front ends
    pub plugin_cache: Arc<DashMap<String, Value>>,
    pub gateway: Arc<GatewayHub>,
    /// Background listeners aborted on shutdown
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl AppState {
    /// Load configuration and start plugins, rules and background loops
    pub async fn bootstrap(settings: Settings) -> Result<Self, StartupError> {
        let metadata = Metadata::load(&settings.serial_file()).await?;
        tracing::info!(
            "Gateway {} ({} {})",
            metadata.serial_no,
            metadata.product,
            metadata.version
        );
        if settings.mirror_enabled {
            tracing::info!("Mirror export requested; mirror devices are managed externally");
        }

        let bus = Arc::new(EventBus::new());
        let crontab = Arc::new(Crontab::new());
        let shadow = Arc::new(DeviceShadow::new());
        shadow.start_status_listener(&crontab)?;
        let mut tasks = vec![bus.forward_shadow_events(&shadow)];

        let cache = Arc::new(CoreCache::new(
            ConfigStore::new(settings.driver_dir()),
            shadow,
            bus.clone(),
        ));
        cache.reload().await?;

        let library = Arc::new(LibraryStore::new(settings.library_dir()));
        if settings.discover_enabled {
            let discover = DiscoverExport::new(cache.clone(), library.clone());
            tasks.extend(discover.start());
            bus.register(discover);
        } else {
            tracing::warn!("Discover export is disabled");
        }

        let sessions = Arc::new(GatewaySessions::new());
        let registry = PluginRegistry::with_builtins();
        let factory_sessions = sessions.clone();
        registry.register(
            GATEWAY_PLUGIN,
            Arc::new(move || Arc::new(GatewayPlugin::new(factory_sessions.clone())) as Arc<dyn Plugin>),
        );
        let plugins = Arc::new(PluginManager::new(
            Arc::new(registry),
            PluginContext {
                cache: cache.clone(),
                pipeline: Arc::new(Pipeline::new(cache.clone(), bus.clone())),
                crontab: crontab.clone(),
                virtual_mode: settings.virtual_mode,
            },
        ));
        plugins.start().await;

        let linkedge = LinkEdge::new(
            settings.linkedge_dir(),
            cache.clone(),
            bus.clone(),
            plugins.clone() as Arc<dyn PointWriter>,
            crontab.clone(),
        );
        linkedge.start().await?;
        bus.register(linkedge.clone());

        if let Some(url) = settings.gateway_master_url.clone() {
            let upstream = GatewayExport::new(metadata.serial_no.clone(), plugins.clone());
            tasks.push(tokio::spawn(upstream.clone().run(url)));
            bus.register(upstream);
        }

        let gateway = Arc::new(GatewayHub::new(
            metadata.serial_no.clone(),
            sessions,
            plugins.clone(),
        ));

        Ok(Self {
            library,
            settings: Arc::new(settings),
            metadata: Arc::new(metadata),
            cache,
            bus,
            crontab,
            plugins,
            linkedge,
            plugin_cache: Arc::new(DashMap::new()),
            gateway,
            tasks: Arc::new(Mutex::new(tasks)),
        })
    }

    /// Stop connectors first, then rules and timers
    pub async fn shutdown(&self) {
        self.plugins.destroy_all().await;
        self.linkedge.destroy();
        self.cache.shadow().stop_status_listener();
        self.crontab.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("driverbox stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) async fn state(dir: &std::path::Path) -> AppState {
        let mut settings = Settings::default();
        settings.resource_path = dir.to_path_buf();
        settings.virtual_mode = true;
        AppState::bootstrap(settings).await.unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_empty_resource_dir() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path()).await;
        assert!(state.cache.devices().is_empty());
        assert!(state.plugins.plugin_keys().is_empty());
        assert!(dir.path().join(".driverbox_serial_no").exists());

        // the serial survives a restart
        let serial = state.metadata.serial_no.clone();
        state.shutdown().await;
        let again = super::tests::state(dir.path()).await;
        assert_eq!(again.metadata.serial_no, serial);
        again.shutdown().await;
    }

    #[tokio::test]
    async fn test_discovered_device_is_registered() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_dir = dir.path().join("driver").join("virtual");
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(
            plugin_dir.join("config.json"),
            r#"{"protocolName": "virtual", "connections": {"bus0": {"discover": true}}, "deviceModels": []}"#,
        )
        .unwrap();
        let models = dir.path().join("library").join("model");
        std::fs::create_dir_all(&models).unwrap();
        std::fs::write(
            models.join("lamp.json"),
            r#"{"name": "lamp", "devicePoints": [{"name": "on", "valueType": "int", "readWrite": "RW"}]}"#,
        )
        .unwrap();

        let state = state(dir.path()).await;
        state.bus.trigger_events(
            driverbox_core::EventCode::DeviceDiscover,
            "lamp1",
            serde_json::json!({
                "modelKey": "lamp",
                "protocolName": "virtual",
                "connectionKey": "bus0",
                "device": {"id": "lamp1"}
            }),
        );
        for _ in 0..100 {
            if state.cache.get_device("lamp1").is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(state.cache.get_device("lamp1").unwrap().model_name, "virtual_lamp");
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_broken_config() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_dir = dir.path().join("driver").join("broken");
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(plugin_dir.join("config.json"), "{ not json").unwrap();

        let mut settings = Settings::default();
        settings.resource_path = dir.path().to_path_buf();
        assert!(matches!(
            AppState::bootstrap(settings).await,
            Err(StartupError::LoadCoreConfig(_))
        ));
    }
}
