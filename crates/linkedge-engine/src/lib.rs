//! Scene linkage engine for driverbox
//!
//! Rules pair triggers (cron schedules or point comparisons) with
//! conditions and actions that write device points or cascade into other
//! rules.

pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod model;
pub mod persistence;
pub mod scheduler;

pub use engine::{LinkEdge, LinkEdgeEvent};
pub use error::LinkEdgeError;
pub use model::*;
