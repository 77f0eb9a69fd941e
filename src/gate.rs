//! Input/output gates and the per-request context.
//!
//! Each request context owns two gates. The input gate is closed while a
//! storage write is in flight for the associated durable object; inbound
//! event dispatch (WebSocket messages and closes, timer fires, incoming
//! request results) waits until it opens, so the worker observes writes in
//! commit order. The output gate is closed while any durable-object write
//! is unconfirmed; outbound effects (response body emission, WebSocket
//! send/close, queue send) wait until it opens, so no side effect escapes
//! before the write it depends on is durable.
//!
//! The context also carries the subrequest budget: outbound fetches, cache
//! misses that fetch upstream, and coupled WebSocket messages consume from
//! `external_subrequest_limit`. Durable-object-scoped contexts reset the
//! counter so traffic internal to an object does not count against the
//! outer request.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{ErrorKind, KumoError, Result};

/// A binary condition that suspends operations until open.
///
/// The gate counts outstanding locks; it is open exactly when the count is
/// zero. Dropping a [`GateLock`] releases one count and wakes waiters.
///
/// # Examples
///
/// ```rust
/// use kumo::gate::Gate;
///
/// # async fn example() {
/// let gate = Gate::new();
/// let lock = gate.lock();
/// let waiter = {
///     let gate = gate.clone();
///     tokio::spawn(async move { gate.wait_open().await })
/// };
/// drop(lock);
/// waiter.await.unwrap();
/// # }
/// ```
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    count: Mutex<usize>,
    notify: Notify,
}

/// RAII lock holding a gate closed; released on drop.
pub struct GateLock {
    inner: Arc<GateInner>,
}

impl Gate {
    /// Creates an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the gate until the returned lock is dropped.
    pub fn lock(&self) -> GateLock {
        *self.inner.count.lock() += 1;
        GateLock {
            inner: self.inner.clone(),
        }
    }

    /// Returns whether the gate is currently open.
    pub fn is_open(&self) -> bool {
        *self.inner.count.lock() == 0
    }

    /// Suspends until the gate is open.
    pub async fn wait_open(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if *self.inner.count.lock() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for GateLock {
    fn drop(&mut self) {
        let mut count = self.inner.count.lock();
        *count -= 1;
        if *count == 0 {
            self.inner.notify.notify_waiters();
        }
    }
}

/// Per-request state: gates, depths, and the subrequest budget.
#[derive(Clone)]
pub struct RequestContext {
    /// Gate for inbound event dispatch.
    pub input_gate: Gate,
    /// Gate for outbound effects.
    pub output_gate: Gate,
    /// Nesting depth of service-to-service requests.
    pub request_depth: u32,
    /// Nesting depth within a single pipeline.
    pub pipeline_depth: u32,
    external_subrequest_limit: Option<usize>,
    external_subrequests: Arc<AtomicUsize>,
}

impl RequestContext {
    /// Creates a top-level request context with the given budget.
    pub fn new(external_subrequest_limit: Option<usize>) -> Self {
        Self {
            input_gate: Gate::new(),
            output_gate: Gate::new(),
            request_depth: 1,
            pipeline_depth: 1,
            external_subrequest_limit,
            external_subrequests: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Derives a durable-object-scoped context: fresh gates and a reset
    /// subrequest counter, one level deeper.
    pub fn durable_object_scope(&self) -> Self {
        Self {
            input_gate: Gate::new(),
            output_gate: Gate::new(),
            request_depth: self.request_depth + 1,
            pipeline_depth: 1,
            external_subrequest_limit: self.external_subrequest_limit,
            external_subrequests: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Consumes one unit of the external-subrequest budget.
    pub fn count_external_subrequest(&self) -> Result<()> {
        let used = self.external_subrequests.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.external_subrequest_limit {
            if used > limit {
                return Err(KumoError::new(
                    ErrorKind::Capacity,
                    "Error",
                    format!(
                        "Too many subrequests: the limit of {limit} external subrequests was exceeded"
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Number of external subrequests consumed so far.
    pub fn external_subrequests_used(&self) -> usize {
        self.external_subrequests.load(Ordering::SeqCst)
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn open_gate_does_not_block() {
        let gate = Gate::new();
        assert!(gate.is_open());
        gate.wait_open().await;
    }

    #[tokio::test]
    async fn waiters_resume_when_last_lock_drops() {
        let gate = Gate::new();
        let lock_a = gate.lock();
        let lock_b = gate.lock();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.wait_open().await;
            })
        };

        drop(lock_a);
        // Still closed: one lock remains.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(lock_b);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resume")
            .unwrap();
    }

    #[tokio::test]
    async fn subrequest_budget_enforced() {
        let ctx = RequestContext::new(Some(2));
        assert!(ctx.count_external_subrequest().is_ok());
        assert!(ctx.count_external_subrequest().is_ok());
        let err = ctx.count_external_subrequest().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capacity);
    }

    #[tokio::test]
    async fn durable_object_scope_resets_budget() {
        let ctx = RequestContext::new(Some(1));
        ctx.count_external_subrequest().unwrap();
        assert!(ctx.count_external_subrequest().is_err());

        let scoped = ctx.durable_object_scope();
        assert_eq!(scoped.request_depth, 2);
        assert!(scoped.count_external_subrequest().is_ok());
        // The outer context budget is unaffected by the scoped one.
        assert_eq!(ctx.external_subrequests_used(), 2);
    }
}
