//! Plugin layer for driverbox
//!
//! Plugins own connectors (one per connection key). Each connector runs a
//! collection loop on the shared crontab, reading grouped points and pushing
//! the decoded values through the ingest pipeline, while writes are
//! serialized against reads on the same transport.

pub mod codec;
pub mod connector;
pub mod error;
pub mod group;
pub mod manager;
pub mod plugin;
pub mod registry;
pub mod scheduler;
pub mod transport;

pub use codec::{Codec, EncodeMode, Frame, JsonCodec};
pub use connector::{CodecConnector, Connector};
pub use error::PluginError;
pub use group::PointGroup;
pub use manager::PluginManager;
pub use plugin::{ConnectionOptions, ConnectorPlugin, Plugin, PluginContext};
pub use registry::PluginRegistry;
pub use scheduler::ConnectorScheduler;
pub use transport::{TcpLineTransport, Transport, VirtualTransport};
