//! Domain models for Haiku Studio.
//!
//! # Core Concepts
//!
//! - [`Project`]: Top-level container. The client never creates or edits one
//!   locally; every version of it comes from a server snapshot.
//! - [`Haiku`]: Generated poem. Its text never changes after creation.
//! - [`ImagePrompt`]: Prompt derived from a haiku. The only entity a user can
//!   edit in place.
//! - [`GeneratedImage`]: Image produced from a prompt, immutable.
//! - [`Critique`]: Append-only score card, has no identity of its own.
//!
//! All identities are opaque [`EntityId`]s. Entities are matched across
//! snapshots by identity only, never by position.

mod haiku;
mod id;
mod project;

pub use haiku::*;
pub use id::*;
pub use project::*;
