//! Warden Storage - policy store and activity persistence.
//!
//! This crate provides:
//!
//! - [`PolicyStore`], the single-key atomic store every component reads policy
//!   from, and [`MemoryStore`], its in-process implementation with TTLs
//! - [`PolicyView`], typed lookups over the store keyspace
//! - [`SqliteActivityLog`], an activity sink backed by SQLite
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use warden_core::{ConnDecision, DecisionRecord, Reason, SecurityLevel};
//! use warden_storage::{MemoryStore, PolicyView};
//!
//! let view = PolicyView::new(Arc::new(MemoryStore::new()), SecurityLevel::Standard);
//! let record = DecisionRecord::new("10.0.0.2", "93.184.216.34", ConnDecision::Block, Reason::PolicyCheck);
//! view.store_decision(&record, Duration::from_secs(3600)).unwrap();
//! assert!(view.cached_decision("10.0.0.2", "93.184.216.34").unwrap().block());
//! ```

mod activity_log;
pub mod error;
pub mod keys;
mod policy;
mod pool;
pub mod repository;
mod schema;
mod store;

pub use activity_log::SqliteActivityLog;
pub use error::{Result, StorageError};
pub use policy::PolicyView;
pub use pool::ConnectionPool;
pub use repository::ActivityRepo;
pub use store::{MemoryStore, PolicyStore};
