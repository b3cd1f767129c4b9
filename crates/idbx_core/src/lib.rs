//! # idbx Client Bindings
//!
//! Continuation-based access to the idbx object-store engine:
//! connections, versioned schemas, transactions, object stores, and
//! secondary indexes over JSON records sorted by a total key order.
//!
//! The engine's event-callback surface (requests with success and error
//! slots, auto-committing transactions) is folded into plain
//! continuations receiving [`IdbResult`] values:
//!
//! - every operation's continuation fires exactly once;
//! - a transaction's outcome continuation fires after all of its
//!   operation continuations;
//! - setup failures, operation failures, and aborts all arrive as
//!   [`IdbError`] values, never as panics;
//! - handles used after their transaction finished fail deterministically
//!   without reaching the engine.
//!
//! ## Usage
//!
//! ```
//! use idbx_core::{open, quick, Engine, Key, KeyPath, OpenHooks, StoreParams};
//! use serde_json::json;
//!
//! let engine = Engine::new();
//!
//! // Open at version 1, creating the schema on first use.
//! let hooks = OpenHooks::new().with_upgrade(|tx, _old, _new| {
//!     let params = StoreParams {
//!         key_path: Some(KeyPath::single("id")),
//!         auto_increment: false,
//!     };
//!     tx.create_store("cats", params).unwrap();
//! });
//! open(&engine, "pets", 1, hooks, |result| {
//!     let connection = result.unwrap();
//!     let record = json!({ "id": 1, "name": "tom" });
//!     quick::put(&connection, "cats", record, None, |key| {
//!         assert_eq!(key.unwrap(), Key::integer(1));
//!     });
//! });
//!
//! engine.run_until_idle();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod connection;
mod error;
mod index;
mod request;
mod store;
mod transaction;

pub mod quick;

pub use connection::{delete_database, list_databases, open, Connection, OpenHooks};
pub use error::{IdbError, IdbResult};
pub use index::Index;
pub use store::Store;
pub use transaction::{Transaction, TransactionPhase};

// The engine data model is the client data model; re-export it so
// applications depend on this crate alone.
pub use idbx_engine::{
    DatabaseInfo, Engine, EngineError, IndexParams, Key, KeyPath, KeyRange, StoreParams,
    TransactionMode,
};
