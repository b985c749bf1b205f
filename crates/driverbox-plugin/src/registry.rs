//! Name -> plugin factory table

use crate::codec::JsonCodec;
use crate::error::PluginError;
use crate::plugin::{ConnectionOptions, ConnectorPlugin, Plugin};
use crate::transport::{TcpLineTransport, Transport, VirtualTransport};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Protocol name of the in-memory simulator plugin
pub const VIRTUAL_PLUGIN: &str = "virtual";
/// Protocol name of the newline-delimited JSON over TCP plugin
pub const TCP_JSON_PLUGIN: &str = "tcp_json";

#[derive(Default)]
pub struct PluginRegistry {
    factories: DashMap<String, PluginFactory>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in plugins
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(
            VIRTUAL_PLUGIN,
            Arc::new(|| {
                Arc::new(ConnectorPlugin::new(
                    VIRTUAL_PLUGIN,
                    Arc::new(JsonCodec),
                    Arc::new(|_: &str, _: &ConnectionOptions| {
                        Ok(Arc::new(VirtualTransport::new()) as Arc<dyn Transport>)
                    }),
                )) as Arc<dyn Plugin>
            }),
        );
        registry.register(
            TCP_JSON_PLUGIN,
            Arc::new(|| {
                Arc::new(ConnectorPlugin::new(
                    TCP_JSON_PLUGIN,
                    Arc::new(JsonCodec),
                    Arc::new(|key: &str, options: &ConnectionOptions| {
                        let address = options.address.clone().ok_or_else(|| {
                            PluginError::InvalidConnection(format!("{key}: missing address"))
                        })?;
                        Ok(Arc::new(TcpLineTransport::new(
                            address,
                            Duration::from_millis(options.timeout),
                        )) as Arc<dyn Transport>)
                    }),
                )) as Arc<dyn Plugin>
            }),
        );
        registry
    }

    pub fn register(&self, name: &str, factory: PluginFactory) {
        tracing::debug!("Registered plugin factory {}", name);
        self.factories.insert(name.to_string(), factory);
    }

    /// Instantiate a plugin by protocol name
    pub fn create(&self, name: &str) -> Result<Arc<dyn Plugin>, PluginError> {
        let factory = self
            .factories
            .get(name)
            .map(|f| f.clone())
            .ok_or_else(|| PluginError::PluginNotFound(name.to_string()))?;
        Ok(factory())
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|f| f.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        let registry = PluginRegistry::with_builtins();
        assert_eq!(registry.names(), vec![TCP_JSON_PLUGIN, VIRTUAL_PLUGIN]);
        assert_eq!(registry.create(VIRTUAL_PLUGIN).unwrap().name(), VIRTUAL_PLUGIN);
        assert!(matches!(
            registry.create("bacnet"),
            Err(PluginError::PluginNotFound(_))
        ));
    }
}
