//! Control-plane leader for a multi-process packet-processing dataplane.
//!
//! The leader owns the authoritative configuration of a running app graph,
//! serves structured RPCs over a local unix socket, validates and applies
//! path-directed mutations against a schema grammar, diffs the resulting
//! graph against the previous one, and ships the action stream to follower
//! worker processes over bounded shared-memory rings.

pub mod action;
pub mod channel;
pub mod error;
pub mod graph;
pub mod leader;
pub mod mutator;
pub mod paths;
pub mod schema;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the main surface at crate root for convenience
pub use crate::action::Action;
pub use crate::graph::{compute_config_actions, AppGraph, AppSpec, LinkSpec};
pub use crate::leader::{Leader, LeaderOptions};
pub use crate::schema::{Grammar, Schema, Value};
