//! Edge runtime kernel for driverbox
//!
//! Holds the in-memory source of truth for connections, models and devices,
//! the device shadow, the export event bus and the shared crontab that the
//! plugin scheduler and the scene engine build on.

pub mod bus;
pub mod cache;
pub mod crontab;
pub mod data;
pub mod discover;
pub mod error;
pub mod event;
pub mod library;
pub mod metadata;
pub mod model;
pub mod persistence;
pub mod pipeline;
pub mod settings;
pub mod shadow;
pub mod store;
pub mod writer;

pub use bus::{EventBus, Export};
pub use cache::CoreCache;
pub use crontab::Crontab;
pub use data::{DeviceData, EventData, PointData};
pub use error::CoreError;
pub use event::{Event, EventCode};
pub use model::{Device, DeviceConfig, DeviceModel, Point, ReadWrite, ReportMode, ValueType};
pub use pipeline::Pipeline;
pub use settings::Settings;
pub use shadow::{DeviceShadow, ShadowDevice, ShadowEvent, ShadowPoint};
pub use store::ConfigStore;
pub use writer::PointWriter;
