//! Shared cron facility
//!
//! A spec is either a human duration (`"5s"`, `"1m"`, `"@every 500ms"`) or a
//! cron expression with seconds resolution (6/7 fields; classic 5-field
//! expressions fire at second 0). Every entry runs in its own task, so a slow
//! callback delays only its own next tick.

use crate::error::CoreError;
use chrono::Local;
use dashmap::DashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

type Entries = DashMap<u64, JoinHandle<()>>;

/// Parsed schedule spec
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl FromStr for ScheduleSpec {
    type Err = CoreError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let trimmed = spec.trim();
        let duration = trimmed.strip_prefix("@every").unwrap_or(trimmed).trim();
        if let Ok(every) = humantime::parse_duration(duration) {
            if every.is_zero() {
                return Err(CoreError::InvalidSchedule(spec.to_string()));
            }
            return Ok(Self::Every(every));
        }

        let expression = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };
        cron::Schedule::from_str(&expression)
            .map(|s| Self::Cron(Box::new(s)))
            .map_err(|e| CoreError::InvalidSchedule(format!("{spec}: {e}")))
    }
}

/// Handle to a scheduled entry
#[derive(Debug, Clone)]
pub struct Future {
    id: u64,
    entries: Weak<Entries>,
}

impl Future {
    /// Remove the entry; a callback already running is aborted at its next await
    pub fn disable(&self) {
        if let Some(entries) = self.entries.upgrade() {
            if let Some((_, handle)) = entries.remove(&self.id) {
                handle.abort();
                tracing::debug!("Disabled crontab entry {}", self.id);
            }
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.entries
            .upgrade()
            .is_some_and(|entries| entries.contains_key(&self.id))
    }
}

/// Process-wide scheduler
pub struct Crontab {
    entries: Arc<Entries>,
    next_id: AtomicU64,
}

impl Default for Crontab {
    fn default() -> Self {
        Self::new()
    }
}

impl Crontab {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Schedule a synchronous callback
    pub fn add_func<F>(&self, spec: &str, f: F) -> Result<Future, CoreError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_task(spec, move || {
            f();
            std::future::ready(())
        })
    }

    /// Schedule an async callback; the entry awaits it before the next tick
    pub fn add_task<F, Fut>(&self, spec: &str, f: F) -> Result<Future, CoreError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let schedule: ScheduleSpec = spec.parse()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let handle = match schedule {
            ScheduleSpec::Every(period) => tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // Skip the first immediate tick
                interval.tick().await;

                loop {
                    interval.tick().await;
                    f().await;
                }
            }),
            ScheduleSpec::Cron(schedule) => tokio::spawn(async move {
                let mut last = Local::now();
                loop {
                    let Some(next) = schedule.after(&last).next() else {
                        tracing::warn!("No upcoming times for crontab entry {}", id);
                        break;
                    };
                    let wait = (next - Local::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::time::sleep(wait).await;
                    last = next;
                    f().await;
                }
            }),
        };

        self.entries.insert(id, handle);
        tracing::debug!("Added crontab entry {} ({})", id, spec);
        Ok(Future {
            id,
            entries: Arc::downgrade(&self.entries),
        })
    }

    /// Number of active entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Abort every entry
    pub fn stop(&self) {
        self.entries.retain(|_, handle| {
            handle.abort();
            false
        });
        tracing::info!("Crontab stopped");
    }
}

impl Drop for Crontab {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            entry.value().abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_parse_specs() {
        assert!(matches!(
            "5s".parse::<ScheduleSpec>().unwrap(),
            ScheduleSpec::Every(d) if d == Duration::from_secs(5)
        ));
        assert!(matches!(
            "@every 1m".parse::<ScheduleSpec>().unwrap(),
            ScheduleSpec::Every(d) if d == Duration::from_secs(60)
        ));
        assert!(matches!(
            "*/10 * * * * *".parse::<ScheduleSpec>().unwrap(),
            ScheduleSpec::Cron(_)
        ));
        assert!(matches!(
            "30 8 * * *".parse::<ScheduleSpec>().unwrap(),
            ScheduleSpec::Cron(_)
        ));
        assert!("0s".parse::<ScheduleSpec>().is_err());
        assert!("not a schedule".parse::<ScheduleSpec>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_entry_fires_and_disables() {
        let crontab = Crontab::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let future = crontab
            .add_func("1s", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(future.is_active());

        future.disable();
        assert!(!future.is_active());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_entries() {
        let crontab = Crontab::new();
        crontab.add_func("1s", || {}).unwrap();
        crontab.add_task("2s", || async {}).unwrap();
        assert_eq!(crontab.len(), 2);
        crontab.stop();
        assert!(crontab.is_empty());
    }
}
