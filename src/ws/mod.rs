pub mod handler;
pub mod hub;
pub mod models;
pub mod registry;
pub mod router;
