pub mod api;
pub mod config;
pub mod router;
pub mod server;
pub mod webhook;
