//! hfshim Storage - Object store abstraction and redb backend
//!
//! This crate provides:
//! - KVStore trait for storage abstraction
//! - redb-based implementation
//! - ResourceStore, the Kubernetes-shaped object API the controller talks to
//! - KvResourceStore, an embedded ResourceStore with owner-reference GC
//! - StoreClient, a typed wrapper with create_or_update

pub mod client;
pub mod encoding;
pub mod error;
pub mod kv;
pub mod redb_backend;
pub mod store;

// Re-export commonly used types
pub use client::{OperationResult, StoreClient};
pub use encoding::KeyEncoder;
pub use error::{Result, StorageError};
pub use kv::{KVStore, Transaction};
pub use redb_backend::RedbBackend;
pub use store::{KvResourceStore, ResourceStore};
