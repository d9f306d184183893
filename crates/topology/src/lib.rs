//! Cluster liveness monitoring for the shared document store.
//!
//! A monitor runs one per owning process, periodically fetches the
//! store's topology status, reconciles the shared host-seed list, and
//! escalates repeated fetch failures into a terminal, explicit shutdown
//! of monitoring.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod monitor;

pub use error::Error;
pub use monitor::{ClusterMonitor, MAX_STATUS_FAILURES, MonitorListener, MonitorSettings};
