//! Continuation plumbing between engine requests and callers.
//!
//! Every operation in this crate funnels through [`dispatch`]: run a thunk
//! that submits one engine request, then fold synchronous setup failure,
//! asynchronous failure, and decoded success into a single continuation
//! that fires exactly once.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;

use idbx_engine::{Key, OpResult, Request};

use crate::error::{IdbError, IdbResult};

/// A continuation slot that fires at most once.
///
/// Clones share the slot. The first `resolve` consumes the continuation;
/// later calls are ignored. Used wherever two event sources (a request and
/// its transaction, success and error slots) race to deliver one result.
pub(crate) struct OnceCont<T> {
    slot: Rc<RefCell<Option<Box<dyn FnOnce(IdbResult<T>)>>>>,
}

impl<T> Clone for OnceCont<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> OnceCont<T> {
    pub(crate) fn new(continuation: impl FnOnce(IdbResult<T>) + 'static) -> Self {
        Self {
            slot: Rc::new(RefCell::new(Some(Box::new(continuation)))),
        }
    }

    /// Fires the continuation with `result`, unless it already fired.
    pub(crate) fn resolve(&self, result: IdbResult<T>) {
        let continuation = self.slot.borrow_mut().take();
        if let Some(continuation) = continuation {
            continuation(result);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_resolved(&self) -> bool {
        self.slot.borrow().is_none()
    }
}

/// Submits one engine request and wires its outcome into `continuation`.
///
/// A thunk error means the operation never started; it is delivered
/// through the continuation like any other failure. On success the engine
/// payload is decoded into the typed result; a shape mismatch surfaces as
/// [`IdbError::Unexpected`].
pub(crate) fn dispatch<T: 'static>(
    thunk: impl FnOnce() -> IdbResult<Request<OpResult>>,
    decode: impl FnOnce(OpResult) -> IdbResult<T> + 'static,
    continuation: impl FnOnce(IdbResult<T>) + 'static,
) {
    let cont = OnceCont::new(continuation);
    match thunk() {
        Ok(request) => {
            let on_success = cont.clone();
            request.on_success(move |payload| on_success.resolve(decode(payload)));
            request.on_error(move |error| cont.resolve(Err(error.into())));
        }
        Err(error) => cont.resolve(Err(error)),
    }
}

// === Payload decoders ===

pub(crate) fn expect_key(payload: OpResult) -> IdbResult<Key> {
    match payload {
        OpResult::Key(key) => Ok(key),
        other => Err(mismatch("a primary key", &other)),
    }
}

pub(crate) fn expect_value(payload: OpResult) -> IdbResult<Option<Value>> {
    match payload {
        OpResult::Value(value) => Ok(value),
        other => Err(mismatch("an optional record", &other)),
    }
}

pub(crate) fn expect_values(payload: OpResult) -> IdbResult<Vec<Value>> {
    match payload {
        OpResult::Values(values) => Ok(values),
        other => Err(mismatch("a list of records", &other)),
    }
}

pub(crate) fn expect_found_key(payload: OpResult) -> IdbResult<Option<Key>> {
    match payload {
        OpResult::FoundKey(key) => Ok(key),
        other => Err(mismatch("an optional key", &other)),
    }
}

pub(crate) fn expect_keys(payload: OpResult) -> IdbResult<Vec<Key>> {
    match payload {
        OpResult::Keys(keys) => Ok(keys),
        other => Err(mismatch("a list of keys", &other)),
    }
}

pub(crate) fn expect_count(payload: OpResult) -> IdbResult<u64> {
    match payload {
        OpResult::Count(count) => Ok(count),
        other => Err(mismatch("a count", &other)),
    }
}

pub(crate) fn expect_done(payload: OpResult) -> IdbResult<()> {
    match payload {
        OpResult::Done => Ok(()),
        other => Err(mismatch("a bare completion", &other)),
    }
}

fn mismatch(wanted: &str, got: &OpResult) -> IdbError {
    IdbError::unexpected(format!("expected {wanted}, got {got:?}"))
}
