//! # idbx Engine
//!
//! In-memory object-store engine with IndexedDB-style semantics.
//!
//! One [`Engine`] hosts any number of named, versioned databases. Each
//! database holds object stores of JSON records addressed by totally
//! ordered keys, with optional secondary indexes. All access runs through
//! auto-committing transactions scheduled on an explicit task queue.
//!
//! The engine guarantees:
//! - Requests of one transaction execute in issuance order
//! - A transaction commits once no further work can reach it
//! - Any request failure aborts its transaction and rolls back every
//!   effect, index entries included
//! - Version upgrades run exclusively: concurrent opens wait, existing
//!   connections are asked to step aside
//!
//! ## Usage
//!
//! ```
//! use idbx_engine::{Engine, KeyPath, StoreParams, TransactionMode};
//! use serde_json::json;
//!
//! let engine = Engine::new();
//! let open = engine.open("inventory", 1).unwrap();
//! open.on_upgrade_needed(|event| {
//!     let params = StoreParams {
//!         key_path: Some(KeyPath::single("id")),
//!         auto_increment: false,
//!     };
//!     event.transaction.create_object_store("items", params).unwrap();
//! });
//! open.on_success(|connection| {
//!     let tx = connection
//!         .transaction(&["items"], TransactionMode::ReadWrite)
//!         .unwrap();
//!     let store = tx.object_store("items").unwrap();
//!     store.add(json!({"id": 1, "name": "bolt"}), None).unwrap();
//! });
//! engine.run_until_idle();
//! ```
//!
//! Everything is single-threaded: handles are not `Send`, and callbacks
//! run on the thread driving [`Engine::run_until_idle`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod handle;
mod key;
mod request;
mod store;
mod task;

pub use engine::{DatabaseInfo, Engine, TransactionMode, TransactionState};
pub use error::{EngineError, EngineResult};
pub use handle::{Connection, Index, ObjectStore, Transaction};
pub use key::{Key, KeyPath, KeyRange};
pub use request::{OpResult, OpenRequest, Request, UpgradeEvent};
pub use store::{IndexParams, StoreParams};
