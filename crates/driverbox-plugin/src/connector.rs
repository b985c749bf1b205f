//! Connector contract: encode, send, decode over one owned link

use crate::codec::{Codec, EncodeMode, Frame};
use crate::error::PluginError;
use crate::transport::Transport;
use async_trait::async_trait;
use driverbox_core::{DeviceData, PointData};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Live I/O object for one connection key
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connection key this connector owns
    fn key(&self) -> &str;

    fn encode(
        &self,
        device_id: &str,
        mode: EncodeMode,
        points: &[PointData],
    ) -> Result<Frame, PluginError>;

    fn decode(&self, raw: Frame) -> Result<Vec<DeviceData>, PluginError>;

    /// Synchronous request/response I/O
    async fn send(&self, raw: Frame) -> Result<Option<Frame>, PluginError>;

    /// Close the link; safe to call more than once
    async fn release(&self);
}

/// Connector assembled from a codec and a transport
pub struct CodecConnector {
    key: String,
    codec: Arc<dyn Codec>,
    transport: Arc<dyn Transport>,
    released: AtomicBool,
}

impl CodecConnector {
    #[must_use]
    pub fn new(key: impl Into<String>, codec: Arc<dyn Codec>, transport: Arc<dyn Transport>) -> Self {
        Self {
            key: key.into(),
            codec,
            transport,
            released: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Connector for CodecConnector {
    fn key(&self) -> &str {
        &self.key
    }

    fn encode(
        &self,
        device_id: &str,
        mode: EncodeMode,
        points: &[PointData],
    ) -> Result<Frame, PluginError> {
        self.codec.encode(device_id, mode, points)
    }

    fn decode(&self, raw: Frame) -> Result<Vec<DeviceData>, PluginError> {
        self.codec.decode(raw)
    }

    async fn send(&self, raw: Frame) -> Result<Option<Frame>, PluginError> {
        if self.released.load(Ordering::Acquire) {
            return Err(PluginError::TransportClosed(self.key.clone()));
        }
        self.transport.send(raw).await
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.close().await;
        tracing::info!("Connector {} released", self.key);
    }
}
