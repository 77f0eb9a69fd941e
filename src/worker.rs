//! The pluggable worker seam and its bindings.
//!
//! Script loading, module linking and the isolate that actually runs user
//! code are external collaborators; the simulator consumes them through
//! the narrow [`WorkerInstance`] trait: `fetch` for HTTP dispatch,
//! `scheduled` for cron-style and alarm dispatch, and `queue` for batch
//! deliveries. [`Bindings`] is the wiring surface that owns the gateway
//! set and exposes it by name, mirroring how the platform presents
//! namespaces to user code.
//!
//! # Examples
//!
//! ```rust
//! use kumo::worker::WorkerInstance;
//! use kumo::types::{WorkerRequest, Response};
//! use kumo::gate::RequestContext;
//! use kumo::body::KumoBody;
//! use kumo::error::Result;
//! use async_trait::async_trait;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl WorkerInstance for Echo {
//!     async fn fetch(&self, req: WorkerRequest, _ctx: RequestContext) -> Result<Response> {
//!         Ok(Response::new(KumoBody::from(req.uri().path().to_string())))
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    cache::CacheGateway,
    durable::DurableObjectStore,
    error::{ErrorKind, KumoError, Result},
    gate::RequestContext,
    kv::KvGateway,
    queue::{MessageBatch, QueueBroker, QueueConsumer},
    r2::R2Gateway,
    types::{Response, WorkerRequest},
};

/// Controller passed to scheduled (cron or alarm) dispatches.
#[derive(Debug, Clone)]
pub struct ScheduledController {
    /// Scheduled fire time in unix milliseconds.
    pub scheduled_time: u64,
    /// Cron expression label, empty for alarm dispatches.
    pub cron: String,
}

/// A worker: the unit of user code the simulator hosts.
#[async_trait]
pub trait WorkerInstance: Send + Sync {
    /// Handles one HTTP request.
    async fn fetch(&self, request: WorkerRequest, ctx: RequestContext) -> Result<Response>;

    /// Handles a scheduled (cron or alarm) dispatch.
    async fn scheduled(&self, controller: ScheduledController) -> Result<()> {
        let _ = controller;
        Ok(())
    }

    /// Handles a delivered queue batch.
    async fn queue(&self, batch: MessageBatch) -> Result<()> {
        let _ = batch;
        Ok(())
    }
}

/// Adapts a worker instance into a queue consumer callback.
pub fn queue_consumer(worker: Arc<dyn WorkerInstance>) -> QueueConsumer {
    Arc::new(move |batch| {
        let worker = worker.clone();
        Box::pin(async move { worker.queue(batch).await })
    })
}

/// Named gateway wiring exposed to the worker.
#[derive(Default)]
pub struct Bindings {
    kv: HashMap<String, Arc<KvGateway>>,
    caches: HashMap<String, Arc<CacheGateway>>,
    buckets: HashMap<String, Arc<R2Gateway>>,
    durable_objects: HashMap<String, Arc<DurableObjectStore>>,
    queues: Option<QueueBroker>,
}

impl Bindings {
    /// Creates an empty binding set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a KV namespace binding.
    pub fn add_kv(&mut self, name: impl Into<String>, gateway: Arc<KvGateway>) -> Result<()> {
        insert_unique(&mut self.kv, name.into(), gateway)
    }

    /// Adds a named cache binding.
    pub fn add_cache(&mut self, name: impl Into<String>, gateway: Arc<CacheGateway>) -> Result<()> {
        insert_unique(&mut self.caches, name.into(), gateway)
    }

    /// Adds an object-store bucket binding.
    pub fn add_bucket(&mut self, name: impl Into<String>, gateway: Arc<R2Gateway>) -> Result<()> {
        insert_unique(&mut self.buckets, name.into(), gateway)
    }

    /// Adds a durable-object namespace binding.
    pub fn add_durable_object(
        &mut self,
        name: impl Into<String>,
        store: Arc<DurableObjectStore>,
    ) -> Result<()> {
        insert_unique(&mut self.durable_objects, name.into(), store)
    }

    /// Sets the queue broker shared by every queue binding.
    pub fn set_queue_broker(&mut self, broker: QueueBroker) {
        self.queues = Some(broker);
    }

    /// KV namespace by binding name.
    pub fn kv(&self, name: &str) -> Option<&Arc<KvGateway>> {
        self.kv.get(name)
    }

    /// Cache by binding name.
    pub fn cache(&self, name: &str) -> Option<&Arc<CacheGateway>> {
        self.caches.get(name)
    }

    /// Bucket by binding name.
    pub fn bucket(&self, name: &str) -> Option<&Arc<R2Gateway>> {
        self.buckets.get(name)
    }

    /// Durable-object namespace by binding name.
    pub fn durable_object(&self, name: &str) -> Option<&Arc<DurableObjectStore>> {
        self.durable_objects.get(name)
    }

    /// The queue broker, if configured.
    pub fn queue_broker(&self) -> Option<&QueueBroker> {
        self.queues.as_ref()
    }
}

fn insert_unique<T>(map: &mut HashMap<String, T>, name: String, value: T) -> Result<()> {
    if map.contains_key(&name) {
        return Err(KumoError::new(
            ErrorKind::Configuration,
            "ERR_DUPLICATE_NAME",
            format!("Binding \"{name}\" is already registered"),
        ));
    }
    map.insert(name, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::system_clock, storage::MemoryStorage};

    #[test]
    fn duplicate_bindings_rejected() {
        let clock = system_clock();
        let storage = Arc::new(MemoryStorage::new(clock.clone()));
        let mut bindings = Bindings::new();
        bindings
            .add_kv("NS", Arc::new(KvGateway::new("NS", storage.clone(), clock.clone())))
            .unwrap();
        let err = bindings
            .add_kv("NS", Arc::new(KvGateway::new("NS", storage, clock)))
            .unwrap_err();
        assert_eq!(err.name(), "ERR_DUPLICATE_NAME");
        assert!(bindings.kv("NS").is_some());
        assert!(bindings.kv("OTHER").is_none());
    }
}
