//! Engine layer: wires the subsystems into one service
//!
//! [`OntologyService`] owns the lock manager, merge engine, outbox, and
//! audit store over a shared DocStore, and implements the branch-level
//! operations (create, delete, schema commit, merge) that compose them.
//! [`BackgroundTasks`] owns the four long-lived loops and their graceful
//! shutdown.
//!
//! Components are constructed once at startup and passed by handle; there
//! are no global registries.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod background;
mod service;

pub use background::BackgroundTasks;
pub use service::{is_protected_branch, OntologyService};
