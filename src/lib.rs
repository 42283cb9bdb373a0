pub mod server;

pub mod db;
pub mod ws;

pub mod ingest;
pub mod scheduler;
pub mod web;
