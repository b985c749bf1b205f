//! Scene engine: rule CRUD, firing and telemetry-driven triggers

use crate::error::LinkEdgeError;
use crate::evaluator::ConditionEvaluator;
use crate::executor::ActionExecutor;
use crate::model::{
    Action, LinkEdgeConfig, RESULT_FAIL, RESULT_PART_SUCCESS, RESULT_SUCCESS,
};
use crate::persistence;
use crate::scheduler::TriggerScheduler;
use dashmap::DashMap;
use driverbox_core::{
    CoreCache, CoreError, Crontab, DeviceData, Event, EventBus, EventCode, Export, PointData,
    PointWriter,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Deepest cascade level allowed; the root firing is level 0
pub const MAX_DEPTH: usize = 10;
/// Name under which the engine registers on the event bus
pub const EXPORT_NAME: &str = "linkedge";

/// Events emitted by the engine
#[derive(Debug, Clone)]
pub enum LinkEdgeEvent {
    /// A rule ran its actions; `result` is the action tally
    Triggered { id: String, result: String },
    /// A firing was refused or aborted
    Failed { id: String, error: String },
    Created { id: String },
    Updated { id: String },
    Deleted { id: String },
}

pub struct LinkEdge {
    me: Weak<Self>,
    dir: PathBuf,
    configs: DashMap<String, LinkEdgeConfig>,
    bus: Arc<EventBus>,
    evaluator: ConditionEvaluator,
    executor: ActionExecutor,
    scheduler: TriggerScheduler,
    event_tx: broadcast::Sender<LinkEdgeEvent>,
    ready: AtomicBool,
    listener: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LinkEdge {
    #[must_use]
    pub fn new(
        dir: impl Into<PathBuf>,
        cache: Arc<CoreCache>,
        bus: Arc<EventBus>,
        writer: Arc<dyn PointWriter>,
        crontab: Arc<Crontab>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        let dir = dir.into();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            dir,
            configs: DashMap::new(),
            evaluator: ConditionEvaluator::new(cache.shadow().clone()),
            executor: ActionExecutor::new(cache, bus.clone(), writer),
            bus,
            scheduler: TriggerScheduler::new(crontab),
            event_tx,
            ready: AtomicBool::new(false),
            listener: parking_lot::Mutex::new(None),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load persisted rules, register their triggers and start listening
    pub async fn start(&self) -> Result<usize, LinkEdgeError> {
        let rules = persistence::load_rules(&self.dir).await?;
        for rule in rules {
            if let Err(e) = self.scheduler.register(&rule) {
                tracing::warn!("Failed to register triggers of linkEdge {}: {}", rule.id, e);
            }
            self.configs.insert(rule.id.clone(), rule);
        }

        let handle = self.start_scheduler_listener();
        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
        self.ready.store(true, Ordering::Release);
        tracing::info!("LinkEdge engine started with {} rules", self.configs.len());
        Ok(self.configs.len())
    }

    /// Stop schedules and the listener; rules stay on disk
    pub fn destroy(&self) {
        self.ready.store(false, Ordering::Release);
        self.scheduler.clear();
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        tracing::info!("LinkEdge engine stopped");
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEdgeEvent> {
        self.event_tx.subscribe()
    }

    /// Rules sorted by id, optionally restricted to a tag
    #[must_use]
    pub fn list(&self, tag: Option<&str>) -> Vec<LinkEdgeConfig> {
        let mut rules: Vec<LinkEdgeConfig> = self
            .configs
            .iter()
            .filter(|r| tag.map_or(true, |t| t.is_empty() || r.has_tag(t)))
            .map(|r| r.value().clone())
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    pub fn get(&self, id: &str) -> Result<LinkEdgeConfig, LinkEdgeError> {
        self.configs
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| LinkEdgeError::NotFound(id.to_string()))
    }

    /// Most recently executed rule, if any rule ran
    #[must_use]
    pub fn get_last(&self) -> Option<LinkEdgeConfig> {
        self.configs
            .iter()
            .filter(|r| r.last_executed_at.is_some())
            .max_by_key(|r| r.last_executed_at)
            .map(|r| r.value().clone())
    }

    /// Persist a new rule and register its triggers
    pub async fn create(&self, mut rule: LinkEdgeConfig) -> Result<LinkEdgeConfig, LinkEdgeError> {
        if rule.id.is_empty() {
            rule.id = uuid::Uuid::new_v4().simple().to_string();
        }
        persistence::validate_id(&rule.id)?;
        if self.configs.contains_key(&rule.id) {
            return Err(LinkEdgeError::AlreadyExists(rule.id));
        }
        if rule.action.is_empty() {
            return Err(LinkEdgeError::ActionListEmpty);
        }

        persistence::save_rule(&self.dir, &rule).await?;
        self.configs.insert(rule.id.clone(), rule.clone());
        if let Err(e) = self.scheduler.register(&rule) {
            let _ = self.delete(&rule.id).await;
            return Err(e);
        }

        let _ = self.event_tx.send(LinkEdgeEvent::Created {
            id: rule.id.clone(),
        });
        tracing::info!("Created linkEdge {} ({})", rule.name, rule.id);
        Ok(rule)
    }

    /// Replace a rule; execution history is kept
    pub async fn update(&self, mut rule: LinkEdgeConfig) -> Result<LinkEdgeConfig, LinkEdgeError> {
        if rule.action.is_empty() {
            return Err(LinkEdgeError::ActionListEmpty);
        }
        let existing = self.get(&rule.id)?;
        rule.last_executed_at = existing.last_executed_at;
        rule.executed = existing.executed;

        self.remove(&rule.id).await?;
        let rule = self.create(rule).await?;
        let _ = self.event_tx.send(LinkEdgeEvent::Updated {
            id: rule.id.clone(),
        });
        Ok(rule)
    }

    pub async fn delete(&self, id: &str) -> Result<(), LinkEdgeError> {
        persistence::validate_id(id)?;
        if !self.configs.contains_key(id) {
            return Err(LinkEdgeError::NotFound(id.to_string()));
        }
        self.remove(id).await?;
        let _ = self.event_tx.send(LinkEdgeEvent::Deleted { id: id.to_string() });
        tracing::info!("Deleted linkEdge {}", id);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), LinkEdgeError> {
        self.scheduler.remove(id);
        self.configs.remove(id);
        persistence::remove_rule(&self.dir, id).await
    }

    /// Flip `enable` and persist it
    pub async fn set_enable(&self, id: &str, enable: bool) -> Result<LinkEdgeConfig, LinkEdgeError> {
        let mut rule = self.get(id)?;
        rule.enable = enable;
        self.update(rule).await
    }

    /// Fire a rule as a root firing
    pub async fn trigger(&self, id: &str) -> Result<(), LinkEdgeError> {
        let result = self.run(id, 0, None).await;
        if let Err(e) = &result {
            self.report_failure(id, e);
        }
        result
    }

    /// Run an unsaved rule; nothing is persisted or published
    pub async fn preview(&self, rule: LinkEdgeConfig) -> Result<(), LinkEdgeError> {
        self.run("", 0, Some(rule)).await
    }

    fn report_failure(&self, id: &str, e: &LinkEdgeError) {
        if e.is_skip() {
            tracing::debug!("LinkEdge {} skipped: {}", id, e);
        } else {
            tracing::error!("LinkEdge {} failed: {}", id, e);
        }
        let _ = self.event_tx.send(LinkEdgeEvent::Failed {
            id: id.to_string(),
            error: e.to_string(),
        });
    }

    /// Fire a rule in the background
    fn spawn_trigger(&self, id: String, depth: usize) {
        let Some(engine) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = engine.run(&id, depth, None).await {
                engine.report_failure(&id, &e);
            }
        });
    }

    async fn run(
        &self,
        id: &str,
        depth: usize,
        preview: Option<LinkEdgeConfig>,
    ) -> Result<(), LinkEdgeError> {
        if depth > MAX_DEPTH {
            return Err(LinkEdgeError::ExecuteTooDeep(depth));
        }
        let rule = match preview {
            Some(rule) => rule,
            None => match self.configs.get(id) {
                Some(rule) => rule.value().clone(),
                None => {
                    self.bus
                        .trigger_events(EventCode::UnknownLinkEdge, id, Value::Null);
                    return Err(LinkEdgeError::NotFound(id.to_string()));
                }
            },
        };

        if !rule.enable {
            return Err(LinkEdgeError::Disabled(rule.id));
        }
        if rule.action.is_empty() {
            return Err(LinkEdgeError::ActionListEmpty);
        }
        if rule.silent_period > 0 {
            if let Some(executed) = rule.executed {
                let silent = Duration::from_secs(rule.silent_period);
                if Instant::now().saturating_duration_since(executed) < silent {
                    return Err(LinkEdgeError::ExecuteTooFrequent(rule.id));
                }
            }
        }
        self.evaluator.check_all(&rule.condition)?;

        let mut succeeded = 0;
        let mut device_actions = Vec::new();
        let mut batches: BTreeMap<String, Vec<PointData>> = BTreeMap::new();
        for action in &rule.action {
            if let Err(e) = self.evaluator.check_all(action.conditions()) {
                tracing::debug!("LinkEdge {} action skipped: {}", id, e);
                succeeded += 1;
                continue;
            }

            match action {
                Action::DevicePoint(action) => {
                    let values = action.point_values();
                    if !values.is_empty() {
                        batches.entry(action.device_id.clone()).or_default().extend(
                            values
                                .into_iter()
                                .map(|v| PointData::new(v.point, Value::String(v.value))),
                        );
                    }
                    device_actions.push(action.device_id.clone());
                }
                Action::LinkEdge { id: target, .. } => {
                    succeeded += 1;
                    self.spawn_trigger(target.clone(), depth + 1);
                }
            }

            if let Some(pause) = action.sleep() {
                tokio::time::sleep(pause).await;
            }
        }

        let written = self.executor.dispatch(id, batches).await;
        succeeded += device_actions.iter().filter(|d| written.contains(*d)).count();

        if id.is_empty() {
            return Ok(());
        }
        if let Some(mut stored) = self.configs.get_mut(id) {
            stored.mark_executed();
        }
        let result = if succeeded == rule.action.len() {
            RESULT_SUCCESS
        } else if succeeded == 0 {
            RESULT_FAIL
        } else {
            RESULT_PART_SUCCESS
        };
        self.bus.trigger_events(
            EventCode::LinkEdgeTrigger,
            id,
            Value::String(result.to_string()),
        );
        let _ = self.event_tx.send(LinkEdgeEvent::Triggered {
            id: id.to_string(),
            result: result.to_string(),
        });
        Ok(())
    }

    fn start_scheduler_listener(&self) -> JoinHandle<()> {
        let engine = self.me.clone();
        let mut rx = self.scheduler.subscribe();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(fired) => {
                        let Some(engine) = engine.upgrade() else {
                            break;
                        };
                        engine.spawn_trigger(fired.rule_id, 0);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("LinkEdge schedule listener lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("LinkEdge schedule channel closed");
                        break;
                    }
                }
            }
        })
    }
}

impl Export for LinkEdge {
    fn name(&self) -> &str {
        EXPORT_NAME
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn on_event(&self, event: &Event) -> Result<(), CoreError> {
        if event.code == EventCode::LinkEdgeTrigger {
            tracing::info!("LinkEdge {} finished: {}", event.key, event.value);
        }
        Ok(())
    }

    fn export_to(&self, data: &DeviceData) {
        for id in self.scheduler.matches(data) {
            tracing::info!("Point trigger fired linkEdge {}", id);
            self.spawn_trigger(id, 0);
        }
    }
}
