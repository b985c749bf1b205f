//! Event codes published on the event bus

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Closed set of event codes raised by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventCode {
    /// A device was registered in the cache
    DeviceAdded,
    /// A device is about to be removed; it can still be queried
    DeviceDeleting,
    /// A device changed between online and offline
    DeviceOnline,
    /// A device was discovered by a plugin
    DeviceDiscover,
    /// Service health changed
    ServiceStatus,
    /// A scene finished executing
    LinkEdgeTrigger,
    /// Values are about to be exported
    Exporting,
    /// Raw plugin callback
    Export,
    /// A device was switched on or off
    DeviceOnOff,
    /// A scene targeted a device unknown to the shadow
    UnknownDevice,
    /// A trigger named a scene that does not exist
    UnknownLinkEdge,
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DeviceAdded => "deviceAdded",
            Self::DeviceDeleting => "deviceDeleting",
            Self::DeviceOnline => "deviceOnline",
            Self::DeviceDiscover => "deviceDiscover",
            Self::ServiceStatus => "serviceStatus",
            Self::LinkEdgeTrigger => "linkEdgeTrigger",
            Self::Exporting => "exporting",
            Self::Export => "export",
            Self::DeviceOnOff => "deviceOnOff",
            Self::UnknownDevice => "unknownDevice",
            Self::UnknownLinkEdge => "unknownLinkEdge",
        };
        f.write_str(s)
    }
}

/// Service status values carried by `ServiceStatus`
pub const SERVICE_STATUS_HEALTHY: &str = "healthy";
pub const SERVICE_STATUS_ERROR: &str = "error";

/// An event as delivered to exports and bus subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub code: EventCode,
    pub key: String,
    pub value: Value,
}
