//! Rule documents: triggers, conditions and actions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tokio::time::Instant;

/// Action tally published with `LinkEdgeTrigger`
pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_PART_SUCCESS: &str = "partSuccess";
pub const RESULT_FAIL: &str = "fail";

/// A scene rule as stored in `<id>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkEdgeConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Minimum seconds between two firings; 0 disables the gate
    #[serde(default)]
    pub silent_period: u64,
    #[serde(default)]
    pub trigger: Vec<Trigger>,
    #[serde(default)]
    pub condition: Vec<Condition>,
    #[serde(default)]
    pub action: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) executed: Option<Instant>,
}

impl LinkEdgeConfig {
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub(crate) fn mark_executed(&mut self) {
        self.last_executed_at = Some(Utc::now());
        self.executed = Some(Instant::now());
    }
}

/// Comparison operator of a point condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
}

impl Op {
    #[must_use]
    pub fn compare(self, actual: f64, expected: f64) -> bool {
        match self {
            Self::Eq => actual == expected,
            Self::Ne => actual != expected,
            Self::Gt => actual > expected,
            Self::Ge => actual >= expected,
            Self::Lt => actual < expected,
            Self::Le => actual <= expected,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        };
        f.write_str(s)
    }
}

/// Accept `"80"`, `80` or `true` for fields stored as text
fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}

fn lenient_optional_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let s = lenient_string(d)?;
    Ok((!s.is_empty()).then_some(s))
}

/// `devSn.point <op> value`, optionally held for `duration` seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointCondition {
    #[serde(rename = "devSn")]
    pub device_id: String,
    pub point: String,
    pub condition: Op,
    #[serde(deserialize_with = "lenient_string")]
    pub value: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub duration: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl PointCondition {
    #[must_use]
    pub fn new(device_id: &str, point: &str, condition: Op, value: impl Into<String>) -> Self {
        Self {
            device_id: device_id.to_string(),
            point: point.to_string(),
            condition,
            value: value.into(),
            duration: 0,
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        !self.device_id.is_empty() && !self.point.is_empty() && !self.value.is_empty()
    }
}

/// What starts a rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Trigger {
    /// Cron expression or duration such as `"@every 10s"`
    Schedule { cron: String },
    /// Point comparison checked on every telemetry update
    DevicePoint(PointCondition),
    /// Accepted and ignored
    DeviceEvent {
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

/// Guard evaluated before a rule or an action runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Condition {
    DevicePoint(PointCondition),
    /// Epoch milliseconds, both ends inclusive
    ExecuteTime { begin: i64, end: i64 },
    /// Held-value form; evaluated by the trigger duration pathway instead
    LastTime {
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// `MM-DD` to `MM-DD`, wrapping over the new year when `end < begin`
    DateInterval {
        #[serde(default)]
        begin_date: String,
        #[serde(default)]
        end_date: String,
    },
    Years { years: Vec<i32> },
    Months { months: Vec<u32> },
    Days { days: Vec<u32> },
    /// 0 or 7 is Sunday
    Weeks { weeks: Vec<u32> },
    /// `HH:MM` window, both ends inclusive
    #[serde(alias = "timeInterval")]
    Times { begin_time: String, end_time: String },
}

/// One point of a batched device write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointValue {
    pub point: String,
    #[serde(deserialize_with = "lenient_string")]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePointAction {
    #[serde(rename = "devSn")]
    pub device_id: String,
    /// Single-point form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_optional_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub points: Vec<PointValue>,
    #[serde(default)]
    pub condition: Vec<Condition>,
    /// Pause after dispatch, e.g. `"500ms"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep: Option<String>,
}

impl DevicePointAction {
    /// Single-point form first, then the batch
    #[must_use]
    pub fn point_values(&self) -> Vec<PointValue> {
        let mut values = Vec::with_capacity(self.points.len() + 1);
        if let (Some(point), Some(value)) = (&self.point, &self.value) {
            if !point.is_empty() {
                values.push(PointValue {
                    point: point.clone(),
                    value: value.clone(),
                });
            }
        }
        values.extend(self.points.iter().cloned());
        values
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    DevicePoint(DevicePointAction),
    /// Cascade into another rule
    LinkEdge {
        id: String,
        #[serde(default)]
        condition: Vec<Condition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sleep: Option<String>,
    },
}

impl Action {
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        match self {
            Self::DevicePoint(action) => &action.condition,
            Self::LinkEdge { condition, .. } => condition,
        }
    }

    /// Parsed post-dispatch pause; unparsable values are ignored
    #[must_use]
    pub fn sleep(&self) -> Option<std::time::Duration> {
        let raw = match self {
            Self::DevicePoint(action) => action.sleep.as_deref(),
            Self::LinkEdge { sleep, .. } => sleep.as_deref(),
        }?;
        humantime::parse_duration(raw.trim()).ok()
    }
}
