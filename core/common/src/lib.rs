//! Common utilities and types shared across tandem crates.
//!
//! The sync engine treats domain entities as opaque records. This crate
//! defines that record envelope, the entity-type tag that selects a
//! store, and the error type every other crate reports through.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{EntityType, OperationKind, Record};
