//! Haiku Studio live project client.
//!
//! Keeps a local view of one project in sync with the server:
//!
//! - [`channel`]: reconnecting WebSocket that delivers whole-project snapshots.
//! - [`client`]: HTTP requests that start server-side jobs.
//! - [`session`]: the per-project event loop tying both to the reconciler.
//! - [`view`]: what a renderer receives, plus a plain-text renderer.
//! - [`config`]: file and environment configuration.

pub mod channel;
pub mod client;
pub mod config;
pub mod session;
pub mod view;

pub use studio_core::{models, pending, reconcile, snapshot};
