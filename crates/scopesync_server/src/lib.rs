//! # scopesync server
//!
//! HTTP front end for a [`SyncPeer`](scopesync_engine::SyncPeer).
//!
//! This crate provides:
//! - `POST /sync`: one JSON request frame in, one response frame out
//! - `GET /health`: liveness and open session count
//! - A background task that reaps idle peer sessions
//!
//! Errors are returned as a JSON error body with the status the engine
//! assigns to each error kind, so clients can tell retryable failures from
//! fatal ones.
//!
//! ```rust,ignore
//! use scopesync_server::{ServerConfig, SyncServer};
//! use tokio_util::sync::CancellationToken;
//!
//! let server = SyncServer::new(ServerConfig::default(), peer);
//! server.serve(CancellationToken::new()).await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;

pub use config::ServerConfig;
pub use error::{ApiError, ServerError, ServerResult};
pub use handler::{create_router, HealthResponse, HEALTH_PATH};
pub use server::SyncServer;
