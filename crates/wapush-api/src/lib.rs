//! wapush-api: HTTP surface of the wapush gateway
//!
//! Session pairing/logout with a WebSocket status stream, campaign control
//! endpoints, and the Cloud API webhook (delivery statuses and inbound
//! opt-out detection). Built with axum.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;

pub use error::{ApiError, Result};
pub use server::{app, start_server, AppState};
