//! Condition evaluator for scene rules

use crate::error::LinkEdgeError;
use crate::model::{Condition, Op, PointCondition};
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveTime, Timelike};
use driverbox_core::DeviceShadow;
use serde_json::Value;
use std::sync::Arc;

pub struct ConditionEvaluator {
    shadow: Arc<DeviceShadow>,
}

impl ConditionEvaluator {
    #[must_use]
    pub fn new(shadow: Arc<DeviceShadow>) -> Self {
        Self { shadow }
    }

    /// Evaluate in order against the local clock; the first failure wins
    pub fn check_all(&self, conditions: &[Condition]) -> Result<(), LinkEdgeError> {
        self.check_all_at(conditions, Local::now())
    }

    pub fn check_all_at(
        &self,
        conditions: &[Condition],
        now: DateTime<Local>,
    ) -> Result<(), LinkEdgeError> {
        for condition in conditions {
            self.check(condition, now)?;
        }
        Ok(())
    }

    fn check(&self, condition: &Condition, now: DateTime<Local>) -> Result<(), LinkEdgeError> {
        match condition {
            Condition::DevicePoint(point) => {
                if !point.is_complete() {
                    return Err(LinkEdgeError::InvalidCondition(format!(
                        "incomplete point condition {}.{}",
                        point.device_id, point.point
                    )));
                }
                let value = self
                    .shadow
                    .get_device_point(&point.device_id, &point.point)?
                    .unwrap_or(Value::Null);
                check_point_value(point, &value)
            }
            Condition::ExecuteTime { begin, end } => {
                let millis = now.timestamp_millis();
                if millis < *begin {
                    return Err(mismatch("execution time has not started"));
                }
                if millis > *end {
                    return Err(mismatch("execution time has expired"));
                }
                Ok(())
            }
            Condition::LastTime { .. } => Ok(()),
            Condition::DateInterval {
                begin_date,
                end_date,
            } => {
                if begin_date.is_empty() || end_date.is_empty() {
                    return Ok(());
                }
                if in_date_interval(begin_date, end_date, now.date_naive())? {
                    Ok(())
                } else {
                    Err(mismatch("date is outside the interval"))
                }
            }
            Condition::Years { years } => {
                check_member(years.contains(&now.year()), "years")
            }
            Condition::Months { months } => {
                check_member(months.contains(&now.month()), "months")
            }
            Condition::Days { days } => check_member(days.contains(&now.day()), "days"),
            Condition::Weeks { weeks } => {
                let weekday = now.weekday().num_days_from_sunday();
                let hit = weeks.contains(&weekday) || (weekday == 0 && weeks.contains(&7));
                check_member(hit, "weeks")
            }
            Condition::Times {
                begin_time,
                end_time,
            } => {
                let begin = parse_time(begin_time)?;
                let end = parse_time(end_time)?;
                let minute = NaiveTime::from_hms_opt(now.hour(), now.minute(), 0)
                    .unwrap_or(NaiveTime::MIN);
                let inside = if begin <= end {
                    minute >= begin && minute <= end
                } else {
                    minute >= begin || minute <= end
                };
                check_member(inside, "times")
            }
        }
    }
}

fn mismatch(reason: impl Into<String>) -> LinkEdgeError {
    LinkEdgeError::ConditionMismatch(reason.into())
}

fn check_member(hit: bool, kind: &str) -> Result<(), LinkEdgeError> {
    if hit {
        Ok(())
    } else {
        Err(mismatch(format!("mismatch {kind} condition")))
    }
}

/// Compare a live point value with a condition
///
/// Strings support only `=` and `!=`; everything else is compared as a float.
pub fn check_point_value(condition: &PointCondition, actual: &Value) -> Result<(), LinkEdgeError> {
    let failed = || {
        mismatch(format!(
            "expect {}{}{}, actual value={}",
            condition.point, condition.condition, condition.value, actual
        ))
    };

    let number = match actual {
        Value::String(s) => {
            let equal = *s == condition.value;
            return match condition.condition {
                Op::Eq if equal => Ok(()),
                Op::Ne if !equal => Ok(()),
                Op::Eq | Op::Ne => Err(failed()),
                op => Err(LinkEdgeError::InvalidCondition(format!(
                    "operator {op} is not supported for string point {}",
                    condition.point
                ))),
            };
        }
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    let Some(number) = number else {
        return Err(failed());
    };
    let expected: f64 = condition.value.trim().parse().map_err(|_| {
        LinkEdgeError::InvalidCondition(format!(
            "{} is not a number for point {}",
            condition.value, condition.point
        ))
    })?;

    if condition.condition.compare(number, expected) {
        Ok(())
    } else {
        Err(failed())
    }
}

fn parse_time(s: &str) -> Result<NaiveTime, LinkEdgeError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|_| LinkEdgeError::InvalidTimeFormat(s.to_string()))
}

/// Day of year of `MM-DD` in `year`; Feb 29 falls back to Feb 28 outside leap years
fn day_of_year(month_day: &str, year: i32) -> Result<u32, LinkEdgeError> {
    let invalid = || LinkEdgeError::InvalidTimeFormat(month_day.to_string());
    let (month, day) = month_day.trim().split_once('-').ok_or_else(invalid)?;
    let month: u32 = month.parse().map_err(|_| invalid())?;
    let mut day: u32 = day.parse().map_err(|_| invalid())?;
    if month == 2 && day == 29 && NaiveDate::from_ymd_opt(year, 2, 29).is_none() {
        day = 28;
    }
    NaiveDate::from_ymd_opt(year, month, day)
        .map(|d| d.ordinal())
        .ok_or_else(invalid)
}

fn in_date_interval(begin: &str, end: &str, today: NaiveDate) -> Result<bool, LinkEdgeError> {
    let begin = day_of_year(begin, today.year())?;
    let end = day_of_year(end, today.year())?;
    let current = today.ordinal();
    Ok(if begin <= end {
        current >= begin && current <= end
    } else {
        current <= end || current >= begin
    })
}
