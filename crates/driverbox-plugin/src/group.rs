//! Read grouping: points batched by register type, cadence and address span

use driverbox_core::{DeviceModel, Point};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Collection cadence for points that do not declare a `duration`
pub const DEFAULT_DURATION: Duration = Duration::from_secs(1);

/// A batch of points read with one request
#[derive(Debug, Clone)]
pub struct PointGroup {
    pub device_id: String,
    pub register_type: String,
    pub duration: Duration,
    pub address: u64,
    pub quantity: u64,
    pub points: Vec<Point>,
    /// Last time the group was read
    pub latest: Option<Instant>,
    /// Consecutive failed reads
    pub failures: u32,
}

impl PointGroup {
    #[must_use]
    pub fn due(&self, now: Instant) -> bool {
        self.latest
            .map_or(true, |latest| now.saturating_duration_since(latest) >= self.duration)
    }
}

struct Slot {
    address: u64,
    quantity: u64,
    /// One past the last register
    end: u64,
    point: Point,
}

fn register_type(point: &Point) -> String {
    point
        .extend_str("registerType")
        .or_else(|| point.extend_str("objectType"))
        .unwrap_or_default()
        .to_string()
}

fn duration(point: &Point) -> Duration {
    point
        .extend_str("duration")
        .and_then(|d| humantime::parse_duration(d).ok())
        .filter(|d| !d.is_zero())
        .unwrap_or(DEFAULT_DURATION)
}

/// Build the read groups of one device
///
/// Readable points are bucketed by `(registerType, duration)`, ordered by
/// address, and merged while the group spans at most `batch_read_len`
/// registers. Points without an `address` take their declaration index.
#[must_use]
pub fn create_point_groups(device_id: &str, model: &DeviceModel, batch_read_len: u64) -> Vec<PointGroup> {
    let mut buckets: BTreeMap<(String, Duration), Vec<Slot>> = BTreeMap::new();
    for (index, point) in model.device_points.iter().enumerate() {
        if !point.readable() {
            continue;
        }
        let address = point.extend_u64("address").unwrap_or(index as u64);
        let quantity = point.extend_u64("quantity").unwrap_or(1).max(1);
        let Some(end) = address.checked_add(quantity) else {
            tracing::warn!(
                "Skipping point {}.{}: address {} + quantity {} overflows",
                model.name,
                point.name,
                address,
                quantity
            );
            continue;
        };
        buckets
            .entry((register_type(point), duration(point)))
            .or_default()
            .push(Slot {
                address,
                quantity,
                end,
                point: point.clone(),
            });
    }

    let batch_read_len = batch_read_len.max(1);
    let mut groups = Vec::new();
    for ((register_type, duration), mut slots) in buckets {
        slots.sort_by_key(|s| s.address);
        let mut current: Option<PointGroup> = None;
        for slot in slots {
            let end = slot.end;
            if let Some(group) = current.as_mut() {
                if end.saturating_sub(group.address) <= batch_read_len {
                    group.quantity = group.quantity.max(end - group.address);
                    group.points.push(slot.point);
                    continue;
                }
            }
            if let Some(done) = current.take() {
                groups.push(done);
            }
            current = Some(PointGroup {
                device_id: device_id.to_string(),
                register_type: register_type.clone(),
                duration,
                address: slot.address,
                quantity: slot.quantity,
                points: vec![slot.point],
                latest: None,
                failures: 0,
            });
        }
        groups.extend(current);
    }
    groups
}
