//! Dispatch of device-point batches produced by a firing

use driverbox_core::{CoreCache, EventBus, EventCode, PointData, PointWriter};
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub struct ActionExecutor {
    cache: Arc<CoreCache>,
    bus: Arc<EventBus>,
    writer: Arc<dyn PointWriter>,
}

impl ActionExecutor {
    #[must_use]
    pub fn new(cache: Arc<CoreCache>, bus: Arc<EventBus>, writer: Arc<dyn PointWriter>) -> Self {
        Self { cache, bus, writer }
    }

    /// Write each device's batch and return the devices that succeeded
    ///
    /// Connections run in parallel; devices sharing a connection are written
    /// one after another. Unknown and offline devices are skipped.
    pub async fn dispatch(
        &self,
        rule_id: &str,
        batches: BTreeMap<String, Vec<PointData>>,
    ) -> BTreeSet<String> {
        let shadow = self.cache.shadow();
        let mut by_connection: BTreeMap<String, Vec<(String, Vec<PointData>)>> = BTreeMap::new();

        for (device_id, points) in batches {
            if !shadow.has_device(&device_id) {
                tracing::warn!("LinkEdge {} targets unknown device {}", rule_id, device_id);
                self.bus.trigger_events(
                    EventCode::UnknownDevice,
                    rule_id,
                    Value::String(device_id),
                );
                continue;
            }
            let Some(device) = self.cache.get_device(&device_id) else {
                tracing::error!("LinkEdge {}: device {} missing from cache", rule_id, device_id);
                continue;
            };
            by_connection
                .entry(device.connection_key)
                .or_default()
                .push((device_id, points));
        }

        let tasks = by_connection.into_values().map(|devices| async move {
            let mut written = Vec::new();
            for (device_id, points) in devices {
                if !shadow.get_device_status(&device_id).unwrap_or(false) {
                    tracing::error!("Device {} offline, skip linkEdge {} action", device_id, rule_id);
                    continue;
                }
                let count = points.len();
                match self.writer.write_points(&device_id, points).await {
                    Ok(()) => {
                        tracing::info!("LinkEdge {} wrote {} points to {}", rule_id, count, device_id);
                        written.push(device_id);
                    }
                    Err(e) => {
                        tracing::error!("LinkEdge {} write to {} failed: {}", rule_id, device_id, e);
                    }
                }
            }
            written
        });

        join_all(tasks).await.into_iter().flatten().collect()
    }
}
