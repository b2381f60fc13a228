//! # Drip Gateway
//! HTTP API in front of the subscription registry.

pub mod routes;
pub mod server;

#[cfg(test)]
mod testing;

pub use server::{AppState, build_router, start_server};
