//! Write path used by the scene engine to reach the plugin layer

use crate::data::PointData;
use crate::error::CoreError;
use async_trait::async_trait;

/// Dispatches point writes to whatever connector owns a device
#[async_trait]
pub trait PointWriter: Send + Sync {
    /// Write a batch of points to one device, in order
    async fn write_points(&self, device_id: &str, points: Vec<PointData>) -> Result<(), CoreError>;
}
