//! HTTP transport for tomes.
//!
//! Mounts every route a [`tome::TomeManager`] reports, plus `GET /health`
//! and, when enabled, the cave registry at `GET /registry`.

pub mod app;
pub mod config;
pub mod middleware;
pub mod routes;

pub use app::{build_app, load_cave, AppState};
pub use config::{CaveFile, ServerConfig};
