// lib.rs
pub mod colors;
pub mod commands;
pub mod config;
pub mod devices;
pub mod docs;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod relay;
pub mod sessions;
pub mod transport;
pub mod utils;

pub use handlers::build_router;
pub use relay::Relay;
