//! Data-access layer. Each sub-module owns the SQL for one entity so the
//! rest of the crate (message router, ingestion pipeline, schedulers) can
//! work with domain models without knowing the schema.

pub mod contact_service;
pub mod device_service;
pub mod event_service;
pub mod group_service;
pub mod stats_service;

pub use contact_service::*;
pub use device_service::*;
pub use event_service::*;
pub use group_service::*;
pub use stats_service::*;
