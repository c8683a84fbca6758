//! Coalescing of state mutations into as few requests as possible.
//!
//! Mutations made while a [`GuardScope`] is alive only count up a pending
//! counter. [`QueryGuard::settle`] then issues at most one request at a time:
//! the first caller drives it, later callers queue for the driver's result,
//! and if anything was triggered while the request was in flight the driver
//! repeats it for the newest state before handing out the result.

use crate::error::{Result, SearchError};
use std::cell::RefCell;
use std::future::Future;
use tokio::sync::oneshot;
use tracing::debug;

struct GuardInner<R> {
    depth: usize,
    pending: usize,
    in_flight: bool,
    waiters: Vec<oneshot::Sender<Result<R>>>,
    requests: u64,
}

pub struct QueryGuard<R> {
    inner: RefCell<GuardInner<R>>,
}

/// A guarded block. Nested scopes are harmless; the guard leaves the
/// collecting state when the outermost scope drops.
pub struct GuardScope<'a, R> {
    guard: &'a QueryGuard<R>,
}

impl<R> Drop for GuardScope<'_, R> {
    fn drop(&mut self) {
        let mut inner = self.guard.inner.borrow_mut();
        inner.depth = inner.depth.saturating_sub(1);
    }
}

/// Resets the in-flight flag even if the driving future is dropped part-way.
/// Dropping the queued senders wakes every waiter with `Abandoned`.
struct Flight<'a, R> {
    guard: &'a QueryGuard<R>,
}

impl<R> Drop for Flight<'_, R> {
    fn drop(&mut self) {
        let mut inner = self.guard.inner.borrow_mut();
        inner.in_flight = false;
        inner.waiters.clear();
    }
}

impl<R: Clone> QueryGuard<R> {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(GuardInner {
                depth: 0,
                pending: 0,
                in_flight: false,
                waiters: Vec::new(),
                requests: 0,
            }),
        }
    }

    pub fn enter(&self) -> GuardScope<'_, R> {
        self.inner.borrow_mut().depth += 1;
        GuardScope { guard: self }
    }

    pub fn is_collecting(&self) -> bool {
        self.inner.borrow().depth > 0
    }

    /// Record a mutation that needs a request.
    pub fn trigger(&self) {
        self.inner.borrow_mut().pending += 1;
    }

    pub fn pending(&self) -> usize {
        self.inner.borrow().pending
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.borrow().in_flight
    }

    /// Requests issued over the guard's lifetime.
    pub fn requests_issued(&self) -> u64 {
        self.inner.borrow().requests
    }

    /// Issue the request if anything is pending.
    ///
    /// Returns `None` straight away when nothing was triggered. Otherwise
    /// every caller gets the result of the request that covered its
    /// mutations, which may be a later request than the one in flight when
    /// it arrived.
    pub async fn settle<F, Fut>(&self, mut execute: F) -> Option<Result<R>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let waiter = {
            let mut inner = self.inner.borrow_mut();
            if inner.pending == 0 {
                return None;
            }
            if inner.in_flight {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push(tx);
                Some(rx)
            } else {
                inner.in_flight = true;
                None
            }
        };

        if let Some(rx) = waiter {
            debug!("Request already in flight, waiting for its result");
            return Some(rx.await.unwrap_or(Err(SearchError::Abandoned)));
        }

        let flight = Flight { guard: self };
        let result = loop {
            let coalesced = {
                let mut inner = self.inner.borrow_mut();
                let coalesced = inner.pending;
                inner.pending = 0;
                inner.requests += 1;
                coalesced
            };
            debug!(mutations = coalesced, "Issuing coalesced request");
            let result = execute().await;
            if self.inner.borrow().pending == 0 {
                break result;
            }
            debug!("State changed while the request was in flight, re-issuing");
        };

        let waiters = std::mem::take(&mut self.inner.borrow_mut().waiters);
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        drop(flight);
        Some(result)
    }

    /// Run `mutate` inside a guarded block, then settle.
    pub async fn run<M, F, Fut>(&self, mutate: M, execute: F) -> Result<Option<R>>
    where
        M: FnOnce() -> Result<()>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        {
            let _scope = self.enter();
            mutate()?;
        }
        if self.is_collecting() {
            // An enclosing block settles for us.
            return Ok(None);
        }
        self.settle(execute).await.transpose()
    }
}

impl<R: Clone> Default for QueryGuard<R> {
    fn default() -> Self {
        Self::new()
    }
}
