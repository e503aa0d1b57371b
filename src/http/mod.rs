//! HTTP surface of the gateway: routing, auth extraction, TLS, pipeline.

pub mod auth;
pub mod handlers;
pub mod server;
pub mod tls;

pub use server::{AppState, HttpServer};
