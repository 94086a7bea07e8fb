//! Distributed services engine.
//!
//! A [`DseNode`] hosts [`Service`]s and exposes them over a [`Transport`]
//! on two tiers of topics: one control topic shared by all nodes and one
//! topic per service id. The [`DsManager`] keeps datasource records in a
//! registry and every node reconciles its datasource services against it.

pub mod api;
pub mod config;
pub mod control_bus;
pub mod datasource;
pub mod drivers;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod node;
pub mod policy;
pub mod service;
pub mod transport;

pub use config::DseConfig;
pub use control_bus::{ControlBus, ControlBusConfig, DseStatus, PeerStatus, CONTROL_BUS_ID};
pub use datasource::{DataSourceService, DsManager, DsManagerConfig, DS_MANAGER_SERVICE_ID};
pub use error::{DseError, DseResult, ErrorKind};
pub use launcher::{launch, launch_with, DseHandle, LaunchOptions};
pub use node::{DseNode, DseNodeBuilder};
pub use service::{Service, ServiceBase};
pub use transport::{LocalTransport, Target, Transport};
