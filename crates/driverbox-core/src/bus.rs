//! Event bus: fan-out of events and telemetry to registered exports

use crate::data::DeviceData;
use crate::error::CoreError;
use crate::event::{Event, EventCode};
use crate::shadow::{DeviceShadow, ShadowEvent};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// A northbound sink or local rule engine fed by the bus
///
/// Calls are made synchronously from the publishing task; an export that
/// needs to do I/O dispatches internally.
pub trait Export: Send + Sync {
    fn name(&self) -> &str;

    fn is_ready(&self) -> bool;

    fn on_event(&self, event: &Event) -> Result<(), CoreError>;

    fn export_to(&self, data: &DeviceData);
}

/// Messages mirrored to bus subscribers
#[derive(Debug, Clone)]
pub enum BusMessage {
    Event(Event),
    Data(DeviceData),
}

/// Ordered list of exports plus a broadcast mirror
pub struct EventBus {
    exports: RwLock<Vec<Arc<dyn Export>>>,
    event_tx: broadcast::Sender<BusMessage>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            exports: RwLock::new(Vec::new()),
            event_tx,
        }
    }

    /// Append an export; delivery follows registration order
    pub fn register(&self, export: Arc<dyn Export>) {
        tracing::info!("Registered export {}", export.name());
        self.exports.write().push(export);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.event_tx.subscribe()
    }

    fn ready_exports(&self) -> Vec<Arc<dyn Export>> {
        self.exports
            .read()
            .iter()
            .filter(|e| e.is_ready())
            .cloned()
            .collect()
    }

    /// Deliver an event to every ready export; failures are only logged
    pub fn trigger_events(&self, code: EventCode, key: &str, value: Value) {
        let event = Event {
            code,
            key: key.to_string(),
            value,
        };
        for export in self.ready_exports() {
            if let Err(e) = export.on_event(&event) {
                tracing::warn!("Export {} failed on {} event: {}", export.name(), code, e);
            }
        }
        let _ = self.event_tx.send(BusMessage::Event(event));
    }

    /// Deliver telemetry to every ready export
    pub fn export_to(&self, data: &DeviceData) {
        for export in self.ready_exports() {
            export.export_to(data);
        }
        let _ = self.event_tx.send(BusMessage::Data(data.clone()));
    }

    /// Republish shadow liveness transitions as `DeviceOnline` events
    pub fn forward_shadow_events(self: &Arc<Self>, shadow: &DeviceShadow) -> JoinHandle<()> {
        let mut rx = shadow.subscribe();
        let bus = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ShadowEvent::Online { id, online }) => {
                        bus.trigger_events(EventCode::DeviceOnline, &id, Value::Bool(online));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Shadow listener lagged, missed {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("Shadow event channel closed");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PointData;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recorder {
        name: String,
        ready: bool,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Export for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_ready(&self) -> bool {
            self.ready
        }

        fn on_event(&self, event: &Event) -> Result<(), CoreError> {
            self.log.lock().push(format!("{}:{}:{}", self.name, event.code, event.key));
            if self.fail {
                return Err(CoreError::Export {
                    export: self.name.clone(),
                    reason: "boom".into(),
                });
            }
            Ok(())
        }

        fn export_to(&self, data: &DeviceData) {
            self.log.lock().push(format!("{}:data:{}", self.name, data.id));
        }
    }

    fn recorder(name: &str, ready: bool, fail: bool, log: &Arc<Mutex<Vec<String>>>) -> Arc<Recorder> {
        Arc::new(Recorder {
            name: name.into(),
            ready,
            fail,
            log: log.clone(),
        })
    }

    #[test]
    fn test_fan_out_in_registration_order_skips_not_ready() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        bus.register(recorder("a", true, true, &log));
        bus.register(recorder("b", false, false, &log));
        bus.register(recorder("c", true, false, &log));

        bus.trigger_events(EventCode::DeviceAdded, "dev1", Value::Null);
        bus.export_to(&DeviceData::new("dev1", vec![PointData::new("temp", 1)]));

        assert_eq!(
            *log.lock(),
            vec![
                "a:deviceAdded:dev1",
                "c:deviceAdded:dev1",
                "a:data:dev1",
                "c:data:dev1"
            ]
        );
    }

    #[tokio::test]
    async fn test_shadow_transitions_are_forwarded() {
        let bus = Arc::new(EventBus::new());
        let shadow = DeviceShadow::new();
        let mut rx = bus.subscribe();
        let handle = bus.forward_shadow_events(&shadow);

        shadow.add_device("dev1", "sensor", None);
        shadow.set_device_point("dev1", "temp", json!(1)).unwrap();

        match rx.recv().await.unwrap() {
            BusMessage::Event(event) => {
                assert_eq!(event.code, EventCode::DeviceOnline);
                assert_eq!(event.key, "dev1");
                assert_eq!(event.value, json!(true));
            }
            other => panic!("unexpected message {other:?}"),
        }
        handle.abort();
    }
}
