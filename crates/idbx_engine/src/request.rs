//! Request objects: per-operation completion slots.
//!
//! Every asynchronous engine operation hands back a request. The caller
//! registers at most one success and one failure handler; the engine fires
//! exactly one of them, from a queued job, never re-entrantly from the
//! call that created the request.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::Value;

use crate::error::EngineError;
use crate::handle::{Connection, Transaction};
use crate::key::Key;

/// Successful payload of a store or index operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpResult {
    /// The primary key a write landed under.
    Key(Key),
    /// A single optional record value.
    Value(Option<Value>),
    /// Record values in key order.
    Values(Vec<Value>),
    /// A single optional key.
    FoundKey(Option<Key>),
    /// Keys in order.
    Keys(Vec<Key>),
    /// A record count.
    Count(u64),
    /// Completion with nothing to report.
    Done,
}

struct RequestInner<T> {
    on_success: RefCell<Option<Box<dyn FnOnce(T)>>>,
    on_error: RefCell<Option<Box<dyn FnOnce(EngineError)>>>,
    settled: Cell<bool>,
}

/// Handle to a pending operation.
///
/// Cloning shares the same completion slots. A request settles once; any
/// later settlement attempt is ignored, and a handler registered after
/// settlement never runs.
pub struct Request<T> {
    inner: Rc<RequestInner<T>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Request<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Rc::new(RequestInner {
                on_success: RefCell::new(None),
                on_error: RefCell::new(None),
                settled: Cell::new(false),
            }),
        }
    }

    /// Registers the success handler, replacing any previous one.
    pub fn on_success(&self, handler: impl FnOnce(T) + 'static) {
        *self.inner.on_success.borrow_mut() = Some(Box::new(handler));
    }

    /// Registers the failure handler, replacing any previous one.
    pub fn on_error(&self, handler: impl FnOnce(EngineError) + 'static) {
        *self.inner.on_error.borrow_mut() = Some(Box::new(handler));
    }

    /// Returns `true` once the request has succeeded or failed.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.inner.settled.get()
    }

    pub(crate) fn fire_success(&self, value: T) {
        if self.inner.settled.replace(true) {
            return;
        }
        let handler = self.inner.on_success.borrow_mut().take();
        if let Some(handler) = handler {
            handler(value);
        }
    }

    pub(crate) fn fire_error(&self, error: EngineError) {
        if self.inner.settled.replace(true) {
            return;
        }
        let handler = self.inner.on_error.borrow_mut().take();
        if let Some(handler) = handler {
            handler(error);
        }
    }
}

/// Event delivered when an open request must upgrade the database.
///
/// Schema changes go through the carried upgrade-mode transaction. The
/// open request settles only after this transaction finishes: success on
/// commit, failure on abort.
pub struct UpgradeEvent {
    /// The upgrade-mode transaction, already running.
    pub transaction: Transaction,
    /// Version on disk before the upgrade. Zero for a fresh database.
    pub old_version: u32,
    /// Version being upgraded to.
    pub new_version: u32,
}

struct OpenRequestInner {
    on_upgrade: RefCell<Option<Box<dyn FnOnce(UpgradeEvent)>>>,
    on_blocked: RefCell<Option<Box<dyn FnOnce(u32, u32)>>>,
    on_success: RefCell<Option<Box<dyn FnOnce(Connection)>>>,
    on_error: RefCell<Option<Box<dyn FnOnce(EngineError)>>>,
    settled: Cell<bool>,
    blocked_fired: Cell<bool>,
}

/// Handle to a pending database open.
///
/// An open may pass through an upgrade and a blocked notification before
/// it settles with a connection or an error. The upgrade and blocked
/// handlers fire at most once each; success and failure are mutually
/// exclusive and final.
#[derive(Clone)]
pub struct OpenRequest {
    inner: Rc<OpenRequestInner>,
}

impl OpenRequest {
    pub(crate) fn new() -> Self {
        Self {
            inner: Rc::new(OpenRequestInner {
                on_upgrade: RefCell::new(None),
                on_blocked: RefCell::new(None),
                on_success: RefCell::new(None),
                on_error: RefCell::new(None),
                settled: Cell::new(false),
                blocked_fired: Cell::new(false),
            }),
        }
    }

    /// Registers the handler that performs schema changes during an
    /// upgrade.
    pub fn on_upgrade_needed(&self, handler: impl FnOnce(UpgradeEvent) + 'static) {
        *self.inner.on_upgrade.borrow_mut() = Some(Box::new(handler));
    }

    /// Registers the handler called when open connections hold the
    /// upgrade back. Receives the current and requested versions.
    pub fn on_blocked(&self, handler: impl FnOnce(u32, u32) + 'static) {
        *self.inner.on_blocked.borrow_mut() = Some(Box::new(handler));
    }

    /// Registers the success handler receiving the connection.
    pub fn on_success(&self, handler: impl FnOnce(Connection) + 'static) {
        *self.inner.on_success.borrow_mut() = Some(Box::new(handler));
    }

    /// Registers the failure handler.
    pub fn on_error(&self, handler: impl FnOnce(EngineError) + 'static) {
        *self.inner.on_error.borrow_mut() = Some(Box::new(handler));
    }

    /// Returns `true` once the open has succeeded or failed.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.inner.settled.get()
    }

    pub(crate) fn fire_upgrade(&self, event: UpgradeEvent) {
        let handler = self.inner.on_upgrade.borrow_mut().take();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    pub(crate) fn fire_blocked(&self, current: u32, requested: u32) {
        if self.inner.blocked_fired.replace(true) {
            return;
        }
        let handler = self.inner.on_blocked.borrow_mut().take();
        if let Some(handler) = handler {
            handler(current, requested);
        }
    }

    pub(crate) fn fire_success(&self, connection: Connection) {
        if self.inner.settled.replace(true) {
            return;
        }
        let handler = self.inner.on_success.borrow_mut().take();
        if let Some(handler) = handler {
            handler(connection);
        }
    }

    pub(crate) fn fire_error(&self, error: EngineError) {
        if self.inner.settled.replace(true) {
            return;
        }
        let handler = self.inner.on_error.borrow_mut().take();
        if let Some(handler) = handler {
            handler(error);
        }
    }
}
