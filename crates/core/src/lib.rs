#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared models and pure logic for the ClickUp agent orchestrator.
//!
//! Nothing in this crate touches the filesystem, the network or child
//! processes; the daemon crate owns all I/O.

pub mod admission;
pub mod api;
pub mod backoff;
pub mod model;
pub mod validation;

mod util;

pub use util::{new_session_id, new_ulid, now_ms, rfc3339_from_ms};
