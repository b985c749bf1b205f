//! Device shadow: last known point values plus liveness
//!
//! The topology map and each device carry their own lock. Callers always take
//! the topology lock first; per-device locks are never held while the
//! topology lock is requested. Online transitions are broadcast after the
//! device lock is released.

use crate::crontab::{Crontab, Future};
use crate::error::CoreError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Default TTL of a shadow device
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Cadence of the TTL sweeper
pub const STATUS_CHECK_INTERVAL: &str = "5s";
/// Minimum silence before `may_be_offline` may downgrade a device
pub const OFFLINE_GRACE: Duration = Duration::from_secs(60);
/// Consecutive failures before `may_be_offline` may downgrade a device
pub const OFFLINE_STRIKES: u32 = 3;

/// Notifications emitted by the shadow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowEvent {
    Online { id: String, online: bool },
}

/// Last known state of a single point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowPoint {
    pub name: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub write_value: Value,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub write_at: Option<DateTime<Utc>>,
    /// Monotonic time of the last value update
    #[serde(skip)]
    pub refreshed: Option<Instant>,
}

/// Last known state of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowDevice {
    pub id: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub online: bool,
    #[serde(with = "ttl_format")]
    pub ttl: Duration,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disconnect_times: u32,
    #[serde(default)]
    pub points: BTreeMap<String, ShadowPoint>,
    /// Monotonic time of the last value update
    #[serde(skip)]
    pub refreshed: Option<Instant>,
}

impl ShadowDevice {
    fn new(id: &str, model_name: &str, ttl: Duration) -> Self {
        Self {
            id: id.to_string(),
            model_name: model_name.to_string(),
            online: false,
            ttl,
            updated_at: None,
            disconnect_times: 0,
            points: BTreeMap::new(),
            refreshed: None,
        }
    }

    fn stale(&self, now: Instant, window: Duration) -> bool {
        self.refreshed
            .map_or(true, |t| now.saturating_duration_since(t) > window)
    }

    /// Go offline when the TTL elapsed; true on transition
    fn expire(&mut self, now: Instant) -> bool {
        if self.online && self.stale(now, self.ttl) {
            self.online = false;
            true
        } else {
            false
        }
    }
}

mod ttl_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(ttl: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*ttl).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Strictly increasing wall clock stamp
fn next_stamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(p) if now <= p => p + chrono::Duration::nanoseconds(1),
        _ => now,
    }
}

type Entry = Arc<RwLock<ShadowDevice>>;

/// Concurrent shadow of every registered device
pub struct DeviceShadow {
    devices: RwLock<HashMap<String, Entry>>,
    event_tx: broadcast::Sender<ShadowEvent>,
    sweeper: Mutex<Option<Future>>,
}

impl Default for DeviceShadow {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceShadow {
    #[must_use]
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            devices: RwLock::new(HashMap::new()),
            event_tx,
            sweeper: Mutex::new(None),
        }
    }

    /// Subscribe to online/offline transitions
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ShadowEvent> {
        self.event_tx.subscribe()
    }

    fn entry(&self, id: &str) -> Result<Entry, CoreError> {
        self.devices
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownDevice(id.to_string()))
    }

    fn notify(&self, id: &str, online: bool) {
        tracing::info!("Device {} is now {}", id, if online { "online" } else { "offline" });
        let _ = self.event_tx.send(ShadowEvent::Online {
            id: id.to_string(),
            online,
        });
    }

    /// Register a device; no-op when it already exists
    pub fn add_device(&self, id: &str, model_name: &str, ttl: Option<Duration>) {
        let mut devices = self.devices.write();
        if devices.contains_key(id) {
            return;
        }
        let ttl = ttl.unwrap_or(DEFAULT_TTL);
        devices.insert(
            id.to_string(),
            Arc::new(RwLock::new(ShadowDevice::new(id, model_name, ttl))),
        );
        tracing::debug!("Shadow device {} added (ttl {:?})", id, ttl);
    }

    #[must_use]
    pub fn has_device(&self, id: &str) -> bool {
        self.devices.read().contains_key(id)
    }

    /// Drop devices from the shadow
    pub fn delete_device(&self, ids: &[String]) {
        let mut devices = self.devices.write();
        for id in ids {
            if devices.remove(id).is_some() {
                tracing::debug!("Shadow device {} deleted", id);
            }
        }
    }

    /// Snapshot of one device; TTL expiry is applied first
    pub fn get_device(&self, id: &str) -> Result<ShadowDevice, CoreError> {
        let entry = self.entry(id)?;
        let (snapshot, expired) = {
            let mut device = entry.write();
            let expired = device.expire(Instant::now());
            (device.clone(), expired)
        };
        if expired {
            self.notify(id, false);
        }
        Ok(snapshot)
    }

    /// Snapshots of every device, ordered by id
    #[must_use]
    pub fn get_devices(&self) -> Vec<ShadowDevice> {
        let mut list: Vec<ShadowDevice> = self
            .devices
            .read()
            .values()
            .map(|entry| entry.read().clone())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Record a sampled value; marks the device online
    pub fn set_device_point(&self, id: &str, name: &str, value: Value) -> Result<(), CoreError> {
        let entry = self.entry(id)?;
        let came_online = {
            let mut device = entry.write();
            let now = Instant::now();
            let stamp = next_stamp(device.updated_at);
            device.updated_at = Some(stamp);
            device.refreshed = Some(now);
            device.disconnect_times = 0;

            let point = device
                .points
                .entry(name.to_string())
                .or_insert_with(|| ShadowPoint {
                    name: name.to_string(),
                    ..ShadowPoint::default()
                });
            point.value = value;
            point.updated_at = Some(next_stamp(point.updated_at).max(stamp));
            point.refreshed = Some(now);

            let came_online = !device.online;
            device.online = true;
            came_online
        };
        if came_online {
            self.notify(id, true);
        }
        Ok(())
    }

    /// Value of a point, only while the device is online and the sample is fresh
    pub fn get_device_point(&self, id: &str, name: &str) -> Result<Option<Value>, CoreError> {
        let entry = self.entry(id)?;
        let now = Instant::now();
        let (value, expired) = {
            let mut device = entry.write();
            let expired = device.expire(now);
            let ttl = device.ttl;
            let value = if device.online {
                device
                    .points
                    .get(name)
                    .filter(|p| p.refreshed.is_some_and(|t| now.saturating_duration_since(t) <= ttl))
                    .map(|p| p.value.clone())
            } else {
                None
            };
            (value, expired)
        };
        if expired {
            self.notify(id, false);
        }
        Ok(value)
    }

    /// Fresh values of every point of an online device
    pub fn get_device_points(&self, id: &str) -> Result<BTreeMap<String, Value>, CoreError> {
        let device = self.get_device(id)?;
        if !device.online {
            return Ok(BTreeMap::new());
        }
        let now = Instant::now();
        Ok(device
            .points
            .into_values()
            .filter(|p| p.refreshed.is_some_and(|t| now.saturating_duration_since(t) <= device.ttl))
            .map(|p| (p.name, p.value))
            .collect())
    }

    /// Raw point state, ignoring liveness
    pub fn get_device_point_details(
        &self,
        id: &str,
        name: &str,
    ) -> Result<Option<ShadowPoint>, CoreError> {
        let entry = self.entry(id)?;
        let device = entry.read();
        Ok(device.points.get(name).cloned())
    }

    /// Record the last commanded value of a point
    pub fn set_write_point_value(&self, id: &str, name: &str, value: Value) -> Result<(), CoreError> {
        let entry = self.entry(id)?;
        let mut device = entry.write();
        let point = device
            .points
            .entry(name.to_string())
            .or_insert_with(|| ShadowPoint {
                name: name.to_string(),
                ..ShadowPoint::default()
            });
        point.write_value = value;
        point.write_at = Some(next_stamp(point.write_at));
        Ok(())
    }

    pub fn get_write_point_value(&self, id: &str, name: &str) -> Result<Option<Value>, CoreError> {
        let entry = self.entry(id)?;
        let device = entry.read();
        Ok(device
            .points
            .get(name)
            .filter(|p| p.write_at.is_some())
            .map(|p| p.write_value.clone()))
    }

    /// Current liveness; TTL expiry is applied first
    pub fn get_device_status(&self, id: &str) -> Result<bool, CoreError> {
        self.get_device(id).map(|d| d.online)
    }

    pub fn get_device_update_at(&self, id: &str) -> Result<Option<DateTime<Utc>>, CoreError> {
        let entry = self.entry(id)?;
        let updated_at = entry.read().updated_at;
        Ok(updated_at)
    }

    pub fn set_online(&self, id: &str) -> Result<(), CoreError> {
        self.set_status(id, true)
    }

    pub fn set_offline(&self, id: &str) -> Result<(), CoreError> {
        self.set_status(id, false)
    }

    fn set_status(&self, id: &str, online: bool) -> Result<(), CoreError> {
        let entry = self.entry(id)?;
        let changed = {
            let mut device = entry.write();
            let changed = device.online != online;
            device.online = online;
            changed
        };
        if changed {
            self.notify(id, online);
        }
        Ok(())
    }

    /// Count a communication failure; returns true when the device went offline
    ///
    /// A device is downgraded only after `OFFLINE_STRIKES` failures and more
    /// than `OFFLINE_GRACE` without a sample.
    pub fn may_be_offline(&self, id: &str) -> Result<bool, CoreError> {
        let entry = self.entry(id)?;
        let went_offline = {
            let mut device = entry.write();
            device.disconnect_times = device.disconnect_times.saturating_add(1);
            if device.online
                && device.disconnect_times >= OFFLINE_STRIKES
                && device.stale(Instant::now(), OFFLINE_GRACE)
            {
                device.online = false;
                true
            } else {
                false
            }
        };
        if went_offline {
            self.notify(id, false);
        }
        Ok(went_offline)
    }

    /// Downgrade every online device whose TTL elapsed
    pub fn check_offline(&self) {
        let now = Instant::now();
        let expired: Vec<String> = {
            let devices = self.devices.read();
            devices
                .values()
                .filter_map(|entry| {
                    let mut device = entry.write();
                    device.expire(now).then(|| device.id.clone())
                })
                .collect()
        };
        for id in expired {
            self.notify(&id, false);
        }
    }

    /// Install the TTL sweeper on the shared crontab
    pub fn start_status_listener(self: &Arc<Self>, crontab: &Crontab) -> Result<(), CoreError> {
        let shadow = Arc::downgrade(self);
        let future = crontab.add_func(STATUS_CHECK_INTERVAL, move || {
            if let Some(shadow) = shadow.upgrade() {
                shadow.check_offline();
            }
        })?;
        if let Some(previous) = self.sweeper.lock().replace(future) {
            previous.disable();
        }
        tracing::info!("Shadow status listener started");
        Ok(())
    }

    pub fn stop_status_listener(&self) {
        if let Some(future) = self.sweeper.lock().take() {
            future.disable();
            tracing::info!("Shadow status listener stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(rx: &mut broadcast::Receiver<ShadowEvent>) -> Vec<ShadowEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn offline(id: &str) -> ShadowEvent {
        ShadowEvent::Online {
            id: id.to_string(),
            online: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_hides_value_and_goes_offline() {
        let shadow = DeviceShadow::new();
        let mut rx = shadow.subscribe();
        shadow.add_device("dev1", "sensor", Some(Duration::from_secs(2)));
        shadow.set_device_point("dev1", "temp", json!(25)).unwrap();
        assert_eq!(shadow.get_device_point("dev1", "temp").unwrap(), Some(json!(25)));

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(shadow.get_device_point("dev1", "temp").unwrap(), None);
        assert!(!shadow.get_device_status("dev1").unwrap());
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                ShadowEvent::Online {
                    id: "dev1".into(),
                    online: true
                },
                offline("dev1"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_fires_offline_once() {
        let crontab = Crontab::new();
        let shadow = Arc::new(DeviceShadow::new());
        shadow.start_status_listener(&crontab).unwrap();
        shadow.add_device("dev1", "sensor", Some(Duration::from_secs(2)));
        shadow.set_device_point("dev1", "temp", json!(25)).unwrap();
        let mut rx = shadow.subscribe();

        tokio::time::sleep(Duration::from_secs(16)).await;

        assert_eq!(drain(&mut rx), vec![offline("dev1")]);
        let device = shadow.get_devices().pop().unwrap();
        assert!(!device.online);

        shadow.stop_status_listener();
        assert!(crontab.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_may_be_offline_needs_three_strikes_and_grace() {
        let shadow = DeviceShadow::new();
        shadow.add_device("dev2", "sensor", None);
        shadow.set_device_point("dev2", "temp", json!(1)).unwrap();
        let mut rx = shadow.subscribe();

        assert!(!shadow.may_be_offline("dev2").unwrap());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!shadow.may_be_offline("dev2").unwrap());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(shadow.may_be_offline("dev2").unwrap());
        assert!(!shadow.may_be_offline("dev2").unwrap());

        assert!(!shadow.get_device_status("dev2").unwrap());
        assert_eq!(drain(&mut rx), vec![offline("dev2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_may_be_offline_within_grace_keeps_online() {
        let shadow = DeviceShadow::new();
        shadow.add_device("dev2", "sensor", None);
        shadow.set_device_point("dev2", "temp", json!(1)).unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            assert!(!shadow.may_be_offline("dev2").unwrap());
        }
        assert!(shadow.get_device_status("dev2").unwrap());

        // A fresh sample resets the strike counter
        tokio::time::sleep(Duration::from_secs(20)).await;
        shadow.set_device_point("dev2", "temp", json!(2)).unwrap();
        assert_eq!(shadow.get_device("dev2").unwrap().disconnect_times, 0);
    }

    #[test]
    fn test_set_point_updates_details_monotonically() {
        let shadow = DeviceShadow::new();
        shadow.add_device("dev1", "sensor", None);
        shadow.set_device_point("dev1", "temp", json!(20)).unwrap();
        let first = shadow.get_device_point_details("dev1", "temp").unwrap().unwrap();
        shadow.set_device_point("dev1", "temp", json!(21)).unwrap();
        let second = shadow.get_device_point_details("dev1", "temp").unwrap().unwrap();

        assert_eq!(second.value, json!(21));
        assert!(second.updated_at > first.updated_at);
    }

    #[test]
    fn test_write_value_slot() {
        let shadow = DeviceShadow::new();
        shadow.add_device("dev1", "switch", None);
        assert_eq!(shadow.get_write_point_value("dev1", "onoff").unwrap(), None);

        shadow.set_write_point_value("dev1", "onoff", json!(1)).unwrap();
        let details = shadow.get_device_point_details("dev1", "onoff").unwrap().unwrap();
        assert_eq!(shadow.get_write_point_value("dev1", "onoff").unwrap(), Some(json!(1)));
        assert!(details.write_at.is_some());
        // Commanding a value does not make the device online
        assert!(!shadow.get_device_status("dev1").unwrap());
    }

    #[test]
    fn test_explicit_transitions_fire_on_change_only() {
        let shadow = DeviceShadow::new();
        let mut rx = shadow.subscribe();
        shadow.add_device("dev1", "sensor", None);
        shadow.set_offline("dev1").unwrap();
        shadow.set_online("dev1").unwrap();
        shadow.set_online("dev1").unwrap();
        shadow.set_offline("dev1").unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                ShadowEvent::Online {
                    id: "dev1".into(),
                    online: true
                },
                offline("dev1"),
            ]
        );
    }

    #[test]
    fn test_unknown_device_and_lifecycle() {
        let shadow = DeviceShadow::new();
        assert!(matches!(
            shadow.set_device_point("ghost", "p", json!(1)),
            Err(CoreError::UnknownDevice(id)) if id == "ghost"
        ));

        shadow.add_device("dev1", "sensor", Some(Duration::from_secs(10)));
        shadow.add_device("dev1", "other", None);
        let device = shadow.get_device("dev1").unwrap();
        assert_eq!(device.model_name, "sensor");
        assert_eq!(device.ttl, Duration::from_secs(10));
        assert!(shadow.has_device("dev1"));

        shadow.delete_device(&["dev1".to_string()]);
        assert!(!shadow.has_device("dev1"));
        assert!(shadow.get_device_status("dev1").is_err());
    }

    #[test]
    fn test_shadow_device_serializes_ttl() {
        let shadow = DeviceShadow::new();
        shadow.add_device("dev1", "sensor", Some(Duration::from_secs(90)));
        let value = serde_json::to_value(shadow.get_device("dev1").unwrap()).unwrap();
        assert_eq!(value["ttl"], "1m 30s");
        assert_eq!(value["modelName"], "sensor");
    }
}
