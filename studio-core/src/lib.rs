//! Core state for the Haiku Studio live project view.
//!
//! Everything in this crate is synchronous and free of I/O. The channel,
//! HTTP client and session loop live in the `haiku-studio` crate and feed
//! this one with parsed events.
//!
//! - [`models`]: the client-visible project tree.
//! - [`snapshot`]: turning a pushed JSON snapshot into a [`models::Project`].
//! - [`pending`]: user actions that are in flight on the server.
//! - [`reconcile`]: the [`reconcile::Reconciler`] that owns the tree and the
//!   pending set and merges every snapshot into them.

pub mod models;
pub mod pending;
pub mod reconcile;
pub mod snapshot;

pub use models::*;
pub use pending::{Action, ActionId, ActionKind, Outcome, PendingAction, Retired, UnknownReason};
pub use reconcile::{Reconciler, Reconciliation};
pub use snapshot::{RawSnapshot, SnapshotError};
