//! Session history persistence for Convoy
//!
//! One durable record per agent invocation: the prompt that was sent, the
//! captured output, the parsed message stream, and the final outcome.
//! Records are appended when an agent is spawned and updated in place when it
//! finishes; nothing here ever deletes them.

pub mod db;
pub mod error;
pub mod sessions;

pub use db::Database;
pub use error::{Error, Result};
pub use sessions::{
    NewSession, Page, SessionFilters, SessionLog, SessionRecord, SessionStatus, SessionUpdate,
};
