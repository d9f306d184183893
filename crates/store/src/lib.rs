//! Abstract interface for drivers of a shared document store.
//!
//! This crate provides:
//! - The document/filter/update/sort model drivers exchange
//! - The `StoreDriver` trait and change-feed types
//! - Connection settings consumed opaquely by drivers
//! - The `DocumentMapper` contract for typed records
//! - Topology-status types used by cluster monitoring
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod document;
mod driver;
mod mapper;
mod query;
mod settings;
mod status;

pub use document::Document;
pub use driver::{ChangeEvent, ChangeOperation, StoreDriver, StoreDriverError};
pub use mapper::{DocumentMapper, JsonMapper, MapperError};
pub use query::{Filter, Order, Sort, Update};
pub use settings::{ClusterConfig, DriverSettings, ReadPreference, SettingsError, WriteSafety};
pub use status::{MemberState, MemberStatus, TopologyStatus};
