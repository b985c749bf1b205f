//! Trigger registration: cron entries and point watches

use crate::error::LinkEdgeError;
use crate::evaluator::check_point_value;
use crate::model::{LinkEdgeConfig, PointCondition, Trigger};
use driverbox_core::crontab::Future;
use driverbox_core::{Crontab, DeviceData};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Emitted when a schedule trigger fires
#[derive(Debug, Clone)]
pub struct ScheduleFired {
    pub rule_id: String,
}

struct PointWatch {
    condition: PointCondition,
    /// Start of the current satisfied stretch for held conditions
    held_since: Option<Instant>,
}

pub struct TriggerScheduler {
    crontab: Arc<Crontab>,
    schedules: Mutex<BTreeMap<String, Vec<Future>>>,
    watches: Mutex<BTreeMap<String, Vec<PointWatch>>>,
    event_tx: broadcast::Sender<ScheduleFired>,
}

impl TriggerScheduler {
    #[must_use]
    pub fn new(crontab: Arc<Crontab>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            crontab,
            schedules: Mutex::new(BTreeMap::new()),
            watches: Mutex::new(BTreeMap::new()),
            event_tx,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ScheduleFired> {
        self.event_tx.subscribe()
    }

    /// Install every trigger of a rule, replacing earlier registrations
    pub fn register(&self, rule: &LinkEdgeConfig) -> Result<(), LinkEdgeError> {
        self.remove(&rule.id);

        let mut futures = Vec::new();
        let mut watches = Vec::new();
        for trigger in &rule.trigger {
            match trigger {
                Trigger::Schedule { cron } => {
                    let id = rule.id.clone();
                    let event_tx = self.event_tx.clone();
                    let added = self.crontab.add_func(cron, move || {
                        tracing::debug!("Schedule trigger fired for linkEdge {}", id);
                        let _ = event_tx.send(ScheduleFired {
                            rule_id: id.clone(),
                        });
                    });
                    match added {
                        Ok(future) => {
                            tracing::info!("Added schedule trigger '{}' for linkEdge {}", cron, rule.id);
                            futures.push(future);
                        }
                        Err(e) => {
                            for future in futures {
                                future.disable();
                            }
                            return Err(LinkEdgeError::InvalidTrigger(format!("{cron}: {e}")));
                        }
                    }
                }
                Trigger::DevicePoint(condition) => {
                    if !condition.is_complete() {
                        for future in futures {
                            future.disable();
                        }
                        return Err(LinkEdgeError::InvalidTrigger(format!(
                            "incomplete point trigger {}.{}",
                            condition.device_id, condition.point
                        )));
                    }
                    watches.push(PointWatch {
                        condition: condition.clone(),
                        held_since: None,
                    });
                }
                Trigger::DeviceEvent { .. } => {}
            }
        }

        if !futures.is_empty() {
            self.schedules.lock().insert(rule.id.clone(), futures);
        }
        if !watches.is_empty() {
            self.watches.lock().insert(rule.id.clone(), watches);
        }
        Ok(())
    }

    pub fn remove(&self, rule_id: &str) {
        if let Some(futures) = self.schedules.lock().remove(rule_id) {
            for future in futures {
                future.disable();
            }
            tracing::debug!("Removed schedule triggers for linkEdge {}", rule_id);
        }
        self.watches.lock().remove(rule_id);
    }

    pub fn clear(&self) {
        let schedules = std::mem::take(&mut *self.schedules.lock());
        for future in schedules.into_values().flatten() {
            future.disable();
        }
        self.watches.lock().clear();
    }

    /// Rules whose point triggers are satisfied by a telemetry record
    pub fn matches(&self, data: &DeviceData) -> Vec<String> {
        let now = Instant::now();
        let mut fired = Vec::new();
        let mut watches = self.watches.lock();

        for point in &data.values {
            for (rule_id, rule_watches) in watches.iter_mut() {
                for watch in rule_watches.iter_mut() {
                    let condition = &watch.condition;
                    if condition.device_id != data.id || condition.point != point.name {
                        continue;
                    }
                    let satisfied = check_point_value(condition, &point.value).is_ok();
                    if condition.duration == 0 {
                        if satisfied {
                            fired.push(rule_id.clone());
                        }
                        continue;
                    }

                    if !satisfied {
                        watch.held_since = None;
                        continue;
                    }
                    let Some(since) = watch.held_since else {
                        watch.held_since = Some(now);
                        continue;
                    };
                    if now.saturating_duration_since(since) >= Duration::from_secs(condition.duration) {
                        watch.held_since = Some(now);
                        fired.push(rule_id.clone());
                    }
                }
            }
        }
        fired
    }

    #[must_use]
    pub fn schedule_count(&self) -> usize {
        self.schedules.lock().values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.watches.lock().values().map(Vec::len).sum()
    }
}
