//! `jobmesh-core`: identifiers and record paths shared by every crate.
//!
//! This crate is **pure** (no IO, no threads).

pub mod error;
pub mod id;
pub mod path;

pub use error::{CoreError, CoreResult};
pub use id::{ProcessId, SessionId};
pub use path::{filter_name, RecordPath};
