//! Per-connector collection loop and write arbitration
//!
//! Reads and writes share one transport lock. A write announces itself
//! through `pending_writes` before waiting on the lock, and the collection
//! loop gives up its remaining slots for the tick while any write is pending.

use crate::codec::EncodeMode;
use crate::connector::Connector;
use crate::error::PluginError;
use crate::group::PointGroup;
use driverbox_core::crontab::Future;
use driverbox_core::{Crontab, DeviceData, DeviceShadow, Pipeline, PointData};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Cadence of the collection loop
pub const COLLECT_TICK: &str = "1s";

/// Timing and retry policy of a connector
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Per-request timeout
    pub timeout: Duration,
    /// Attempts per write
    pub retry: u32,
    /// Pause between consecutive requests
    pub min_interval: Duration,
    /// Consecutive read failures before a device may be marked offline
    pub offline_threshold: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            retry: 3,
            min_interval: Duration::from_millis(100),
            offline_threshold: 1,
        }
    }
}

struct PendingWrite<'a>(&'a AtomicUsize);

impl<'a> PendingWrite<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Drives one connector: scheduled group reads plus on-demand reads and writes
pub struct ConnectorScheduler {
    connector: Arc<dyn Connector>,
    pipeline: Arc<Pipeline>,
    shadow: Arc<DeviceShadow>,
    options: SchedulerOptions,
    groups: Mutex<Vec<PointGroup>>,
    io: tokio::sync::Mutex<()>,
    pending_writes: AtomicUsize,
    future: Mutex<Option<Future>>,
    active: AtomicBool,
}

impl ConnectorScheduler {
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        pipeline: Arc<Pipeline>,
        shadow: Arc<DeviceShadow>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            connector,
            pipeline,
            shadow,
            options,
            groups: Mutex::new(Vec::new()),
            io: tokio::sync::Mutex::new(()),
            pending_writes: AtomicUsize::new(0),
            future: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        self.connector.key()
    }

    #[must_use]
    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn add_groups(&self, groups: Vec<PointGroup>) {
        self.groups.lock().extend(groups);
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }

    /// Devices with at least one scheduled group
    #[must_use]
    pub fn devices(&self) -> BTreeSet<String> {
        self.groups
            .lock()
            .iter()
            .map(|g| g.device_id.clone())
            .collect()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Install the collection loop on the crontab
    pub fn start(self: &Arc<Self>, crontab: &Crontab) -> Result<(), PluginError> {
        let scheduler = Arc::downgrade(self);
        let future = crontab.add_task(COLLECT_TICK, move || {
            let scheduler = scheduler.clone();
            async move {
                if let Some(scheduler) = scheduler.upgrade() {
                    scheduler.collect().await;
                }
            }
        })?;
        if let Some(previous) = self.future.lock().replace(future) {
            previous.disable();
        }
        self.active.store(true, Ordering::Release);
        tracing::info!(
            "Connector {} started with {} read groups",
            self.key(),
            self.group_count()
        );
        Ok(())
    }

    /// Stop the collection loop; in-flight requests finish on their own
    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
        if let Some(future) = self.future.lock().take() {
            future.disable();
            tracing::info!("Connector {} stopped", self.key());
        }
    }

    /// Stop the loop, then close the transport
    pub async fn release(&self) {
        self.stop();
        let _io = self.io.lock().await;
        self.connector.release().await;
    }

    async fn exchange(
        &self,
        device_id: &str,
        mode: EncodeMode,
        points: &[PointData],
    ) -> Result<Vec<DeviceData>, PluginError> {
        let frame = self.connector.encode(device_id, mode, points)?;
        let response = tokio::time::timeout(self.options.timeout, self.connector.send(frame))
            .await
            .map_err(|_| PluginError::ProtocolTimeout)??;
        match response {
            Some(raw) => self.connector.decode(raw),
            None => Ok(Vec::new()),
        }
    }

    /// Run every due group once
    pub async fn collect(&self) {
        let due: Vec<(usize, String, Vec<PointData>)> = {
            let now = Instant::now();
            self.groups
                .lock()
                .iter()
                .enumerate()
                .filter(|(_, g)| g.due(now))
                .map(|(i, g)| {
                    let points = g
                        .points
                        .iter()
                        .map(|p| PointData::new(p.name.clone(), Value::Null))
                        .collect();
                    (i, g.device_id.clone(), points)
                })
                .collect()
        };

        for (index, device_id, points) in due {
            if !self.is_active() {
                return;
            }
            if self.pending_writes.load(Ordering::Acquire) > 0 {
                tracing::debug!("Connector {} yields to pending writes", self.key());
                return;
            }

            let mode = if points.len() > 1 {
                EncodeMode::BatchRead
            } else {
                EncodeMode::Read
            };
            let result = {
                let _io = self.io.lock().await;
                self.exchange(&device_id, mode, &points).await
            };
            let failures = {
                let mut groups = self.groups.lock();
                let Some(group) = groups.get_mut(index) else {
                    return;
                };
                group.latest = Some(Instant::now());
                match &result {
                    Ok(_) => group.failures = 0,
                    Err(e) if e.is_transient() => group.failures += 1,
                    Err(_) => {}
                }
                group.failures
            };

            match result {
                Ok(data) => self.pipeline.export_to(data),
                Err(e) if e.is_fatal() => {
                    tracing::error!("Connector {} lost its transport: {}", self.key(), e);
                    self.fail_all();
                    return;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!("Read {} on {} failed: {}", device_id, self.key(), e);
                    if failures >= self.options.offline_threshold {
                        let _ = self.shadow.may_be_offline(&device_id);
                    }
                }
                Err(e) => {
                    tracing::warn!("Dropping frame from {} on {}: {}", device_id, self.key(), e);
                }
            }

            tokio::time::sleep(self.options.min_interval).await;
        }
    }

    fn fail_all(&self) {
        self.stop();
        for device_id in self.devices() {
            let _ = self.shadow.set_offline(&device_id);
        }
    }

    /// Read points now and push the response through the pipeline
    pub async fn read(&self, device_id: &str, points: &[String]) -> Result<(), PluginError> {
        let request: Vec<PointData> = points
            .iter()
            .map(|p| PointData::new(p.clone(), Value::Null))
            .collect();
        let data = {
            let _pending = PendingWrite::new(&self.pending_writes);
            let _io = self.io.lock().await;
            self.exchange(device_id, EncodeMode::Read, &request).await?
        };
        self.pipeline.export_to(data);
        Ok(())
    }

    /// Write points to a device as one request, retrying transient failures
    pub async fn write(&self, device_id: &str, points: Vec<PointData>) -> Result<(), PluginError> {
        let _pending = PendingWrite::new(&self.pending_writes);
        let _io = self.io.lock().await;

        for point in &points {
            self.shadow
                .set_write_point_value(device_id, &point.name, point.value.clone())?;
        }

        let attempts = self.options.retry.max(1);
        let mut attempt = 1;
        loop {
            match self.exchange(device_id, EncodeMode::Write, &points).await {
                Ok(data) => {
                    if !data.is_empty() {
                        self.pipeline.export_to(data);
                    }
                    tracing::debug!("Wrote {} points to {}", points.len(), device_id);
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        "Write to {} failed (attempt {}/{}): {}",
                        device_id,
                        attempt,
                        attempts,
                        e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.options.min_interval).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        let _ = self.shadow.may_be_offline(device_id);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::{Frame, JsonCodec};
    use crate::connector::CodecConnector;
    use crate::group::create_point_groups;
    use crate::transport::{Transport, VirtualTransport};
    use async_trait::async_trait;
    use driverbox_core::{ConfigStore, CoreCache, DeviceConfig, EventBus};
    use serde_json::json;

    pub(crate) async fn cache(dir: &std::path::Path) -> (Arc<CoreCache>, Arc<Pipeline>) {
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(CoreCache::new(
            ConfigStore::new(dir),
            Arc::new(DeviceShadow::new()),
            bus.clone(),
        ));
        let config: DeviceConfig = serde_json::from_value(json!({
            "protocolName": "virtual",
            "connections": {"c1": {"virtual": true}},
            "deviceModels": [{
                "name": "hvac",
                "devicePoints": [
                    {"name": "temp", "valueType": "float", "readWrite": "R", "address": 0},
                    {"name": "humidity", "valueType": "float", "readWrite": "R", "address": 1},
                    {"name": "fan", "valueType": "int", "readWrite": "RW", "address": 5},
                    {"name": "reset", "valueType": "int", "readWrite": "W", "address": 9}
                ],
                "devices": [
                    {"id": "dev3", "connectionKey": "c1"},
                    {"id": "dev4", "connectionKey": "c1"}
                ]
            }]
        }))
        .unwrap();
        cache.add_config(config).await.unwrap();
        let pipeline = Arc::new(Pipeline::new(cache.clone(), Arc::new(EventBus::new())));
        (cache, pipeline)
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Echo,
        Timeout,
        Closed,
    }

    struct ScriptedTransport {
        behavior: parking_lot::Mutex<Behavior>,
        inner: VirtualTransport,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, frame: Frame) -> Result<Option<Frame>, PluginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let behavior = *self.behavior.lock();
            match behavior {
                Behavior::Echo => self.inner.send(frame).await,
                Behavior::Timeout => Err(PluginError::ProtocolTimeout),
                Behavior::Closed => Err(PluginError::TransportClosed("test".into())),
            }
        }

        async fn close(&self) {}
    }

    fn scheduler(
        cache: &Arc<CoreCache>,
        pipeline: &Arc<Pipeline>,
        behavior: Behavior,
    ) -> (Arc<ConnectorScheduler>, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport {
            behavior: parking_lot::Mutex::new(behavior),
            inner: VirtualTransport::new(),
            calls: AtomicUsize::new(0),
        });
        transport.inner.set("dev3", "temp", json!(21.5));
        let connector = Arc::new(CodecConnector::new("c1", Arc::new(JsonCodec), transport.clone()));
        let scheduler = Arc::new(ConnectorScheduler::new(
            connector,
            pipeline.clone(),
            cache.shadow().clone(),
            SchedulerOptions::default(),
        ));
        let model = cache.get_model("hvac").unwrap();
        scheduler.add_groups(create_point_groups("dev3", &model, 32));
        scheduler.active.store(true, Ordering::Release);
        (scheduler, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_reads_into_shadow() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, pipeline) = cache(dir.path()).await;
        let (scheduler, transport) = scheduler(&cache, &pipeline, Behavior::Echo);

        scheduler.collect().await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        let shadow = cache.shadow();
        assert_eq!(shadow.get_device_point("dev3", "temp").unwrap(), Some(json!(21.5)));
        assert_eq!(shadow.get_device_point("dev3", "fan").unwrap(), Some(json!(0)));

        // not due again before its duration elapses
        scheduler.collect().await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_on_crontab_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, pipeline) = cache(dir.path()).await;
        let (scheduler, transport) = scheduler(&cache, &pipeline, Behavior::Echo);
        let crontab = Crontab::new();

        scheduler.start(&crontab).unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        let calls = transport.calls.load(Ordering::SeqCst);
        assert!(calls >= 2, "expected reads, got {calls}");

        scheduler.stop();
        assert!(!scheduler.is_active());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_mark_device_offline() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, pipeline) = cache(dir.path()).await;
        let (scheduler, transport) = scheduler(&cache, &pipeline, Behavior::Echo);
        scheduler.collect().await;
        assert!(cache.shadow().get_device_status("dev3").unwrap());

        *transport.behavior.lock() = Behavior::Timeout;
        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..3 {
            scheduler.collect().await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert!(!cache.shadow().get_device_status("dev3").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_transport_stops_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, pipeline) = cache(dir.path()).await;
        let (scheduler, _transport) = scheduler(&cache, &pipeline, Behavior::Closed);
        cache.shadow().set_online("dev3").unwrap();

        scheduler.collect().await;
        assert!(!scheduler.is_active());
        assert!(!cache.shadow().get_device_status("dev3").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_write_preempts_reads() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, pipeline) = cache(dir.path()).await;
        let (scheduler, transport) = scheduler(&cache, &pipeline, Behavior::Echo);

        {
            let _pending = PendingWrite::new(&scheduler.pending_writes);
            scheduler.collect().await;
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        scheduler.collect().await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_records_command_and_echo() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, pipeline) = cache(dir.path()).await;
        let (scheduler, transport) = scheduler(&cache, &pipeline, Behavior::Echo);

        scheduler
            .write("dev4", vec![PointData::new("fan", 1)])
            .await
            .unwrap();
        let shadow = cache.shadow();
        assert_eq!(shadow.get_write_point_value("dev4", "fan").unwrap(), Some(json!(1)));
        assert_eq!(shadow.get_device_point("dev4", "fan").unwrap(), Some(json!(1)));
        assert_eq!(transport.inner.get("dev4", "fan"), Some(json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_retries_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, pipeline) = cache(dir.path()).await;
        let (scheduler, transport) = scheduler(&cache, &pipeline, Behavior::Timeout);

        let result = scheduler.write("dev4", vec![PointData::new("fan", 1)]).await;
        assert!(matches!(result, Err(PluginError::ProtocolTimeout)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }
}
