//! Storage collaborators for the tandem sync engine.
//!
//! This crate provides the two stores the engine reconciles:
//! - a local, always-available record store ([`LocalStore`]) with in-memory
//!   and file-backed implementations
//! - a remote, authoritative store ([`RemoteStore`]) with an in-memory
//!   emulation and an authenticated HTTP client
//!
//! plus credential providers and a registry for resolving a remote backend
//! by name and configuration.
//!
//! # Design Principles
//! - Entities are opaque records: no domain decoding happens here
//! - Async operations: every store call may suspend
//! - Unified error semantics: connectivity, "not found" and "already exists"
//!   mean the same thing across backends

pub mod credentials;
pub mod http;
pub mod local;
pub mod memory;
pub mod registry;
pub mod remote;

pub use credentials::{CredentialProvider, StaticCredentials};
pub use http::{create_http_store, HttpRemoteConfig, HttpRemoteStore};
pub use local::{FileLocalStore, LocalStore};
pub use memory::{MemoryLocalStore, MemoryRemoteStore};
pub use registry::{create_default_registry, RemoteFactory, StoreRegistry};
pub use remote::{BatchConflict, BatchOutcome, RemoteChange, RemoteStore};
