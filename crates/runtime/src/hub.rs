//! The hub: owns the shared index and the queues workers talk through (§4.5).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use hive_core::{DomainId, Map, RefCountTable, RefQueue, Value};

use crate::error::{Error, Result};
use crate::queue::{Item, ItemKind, MultiChannelQueue};
use crate::reflect::ReflectedError;

/// A worker-reported lifecycle or failure event, delivered through the
/// health queue.
#[derive(Debug, Clone)]
pub enum HealthEvent {
    Start(DomainId),
    Close(DomainId),
    Error { worker: DomainId, class_name: String, message: String, error: Option<ReflectedError> },
}

/// What a blocking `Hub::listen` call surfaces from `for_hub`.
#[derive(Debug, Clone)]
pub enum Message {
    /// A worker-initiated, no-reply-expected push.
    Broadcast { from: DomainId, value: Value },
    /// A worker asking the hub to do something; answer with [`Hub::reply_to_worker`].
    Request { from: DomainId, id: u64, value: Value },
    /// A worker's answer to a hub-initiated [`Hub::request_worker`].
    Response { id: u64, value: Value, is_error: bool },
}

fn decode(item: Item) -> Message {
    match item.kind {
        ItemKind::Broadcast => Message::Broadcast { from: item.sender, value: item.payload },
        ItemKind::Request => Message::Request { from: item.sender, id: item.id, value: item.payload },
        ItemKind::Response => Message::Response { id: item.id, value: item.payload, is_error: item.is_error },
    }
}

struct WorkerRegistration {
    id: DomainId,
    channel: usize,
    main_refs: Arc<RefQueue<Value>>,
}

const DEFAULT_MAX_WORKERS: usize = 64;

/// Owns the shared index `Map` plus the three queues named in §4.5: the
/// worker-facing queue (broadcast + per-worker side channels), the hub-facing
/// queue (workers' requests/responses/pushes), and the health queue.
pub struct Hub {
    domain: DomainId,
    index: RwLock<Map>,
    index_table: RefCountTable<Value>,
    for_workers: MultiChannelQueue,
    for_hub: MultiChannelQueue,
    health: Mutex<Vec<HealthEvent>>,
    health_closed: Mutex<bool>,
    health_condvar: parking_lot::Condvar,
    workers: Mutex<Vec<WorkerRegistration>>,
    next_request_id: AtomicU64,
}

impl Hub {
    pub fn new(max_workers: usize) -> Arc<Hub> {
        let domain = DomainId::next();
        info!(%domain, "hub started");
        Arc::new(Hub {
            domain,
            index: RwLock::new(Map::new(domain)),
            index_table: RefCountTable::new(),
            for_workers: MultiChannelQueue::new(max_workers),
            for_hub: MultiChannelQueue::new(0),
            health: Mutex::new(Vec::new()),
            health_closed: Mutex::new(false),
            health_condvar: parking_lot::Condvar::new(),
            workers: Mutex::new(Vec::new()),
            next_request_id: AtomicU64::new(1),
        })
    }

    pub fn with_default_capacity() -> Arc<Hub> {
        Self::new(DEFAULT_MAX_WORKERS)
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    /// A cheap (`Arc`-bump) clone of the current index, for a worker to
    /// reconcile into its own view.
    pub fn index_snapshot(&self) -> Map {
        self.index.read().clone()
    }

    // -- indexing -----------------------------------------------------

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    pub fn get(&self, key: &Value) -> Result<Value> {
        Ok(self.index.read().get(key)?)
    }

    pub fn contains(&self, key: &Value) -> Result<bool> {
        Ok(self.index.read().contains(key)?)
    }

    #[instrument(skip(self, key, val))]
    pub fn set(&self, key: Value, val: Value) -> Result<()> {
        self.drain_all_worker_refs();
        let mut g = self.index.write();
        *g = g.assoc(key, val)?;
        Ok(())
    }

    #[instrument(skip(self, key))]
    pub fn delete(&self, key: &Value) -> Result<()> {
        self.drain_all_worker_refs();
        let mut g = self.index.write();
        *g = g.without(key)?;
        Ok(())
    }

    // -- worker registry ------------------------------------------------

    pub(crate) fn register_worker(&self, id: DomainId, main_refs: Arc<RefQueue<Value>>) -> Result<usize> {
        let channel = self.for_workers.add_channel()?;
        self.workers.lock().push(WorkerRegistration { id, channel, main_refs });
        debug!(%id, channel, "worker registered");
        Ok(channel)
    }

    pub(crate) fn unregister_worker(&self, id: DomainId) {
        self.workers.lock().retain(|w| w.id != id);
        debug!(%id, "worker unregistered");
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Drain every registered worker's main-refs queue against this hub's
    /// `RefCountTable`. Called before every index write (invariant 6), and
    /// exposed directly for callers that want an explicit safepoint.
    pub fn flush_refs(&self) -> Vec<hive_core::DrainReport> {
        self.drain_all_worker_refs()
    }

    fn drain_all_worker_refs(&self) -> Vec<hive_core::DrainReport> {
        let workers = self.workers.lock();
        workers.iter().map(|w| w.main_refs.drain(&self.index_table)).collect()
    }

    pub(crate) fn drain_worker_main_refs(&self, id: DomainId) -> Option<hive_core::DrainReport> {
        let workers = self.workers.lock();
        workers.iter().find(|w| w.id == id).map(|w| w.main_refs.drain(&self.index_table))
    }

    // -- worker-facing queue --------------------------------------------

    /// Post a reply-able request that the first listening worker consumes
    /// (§6) — unlike [`Hub::broadcast`], exactly one worker sees it, and
    /// that worker can answer through [`Worker::respond`] to a matching
    /// [`Hub::listen`] call. Returns the correlation id.
    pub fn push(&self, val: Value) -> Result<u64> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.for_workers.put(0, Item::request(self.domain, id, val))?;
        Ok(id)
    }

    /// Post one independent copy per registered worker.
    pub fn broadcast(&self, val: Value) -> Result<usize> {
        let domain = self.domain;
        self.for_workers.broadcast(move || Item::broadcast(domain, val.clone()))
    }

    /// Post a request to a specific worker's side channel, returning its
    /// correlation id. The worker answers with a `Response` on `for_hub`.
    pub fn request_worker(&self, channel: usize, payload: Value) -> Result<u64> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.for_workers.put(channel, Item::request(self.domain, id, payload))?;
        Ok(id)
    }

    pub fn close_workers_queue(&self) {
        self.for_workers.close();
    }

    /// The underlying worker-facing queue, for `Worker::listen` to block on
    /// its own side channel directly.
    pub(crate) fn worker_queue(&self) -> &MultiChannelQueue {
        &self.for_workers
    }

    /// Used by a `Worker` to post a push/request/response onto the
    /// hub-facing queue.
    pub(crate) fn post_from_worker(&self, item: Item) -> Result<()> {
        self.for_hub.put(0, item)
    }

    // -- hub-facing queue -------------------------------------------------

    /// Block until a worker-initiated push, request, or response arrives.
    pub fn listen(&self) -> Result<Message> {
        Ok(decode(self.for_hub.listen(0)?))
    }

    /// Answer a worker-initiated `Request` directly on that worker's own
    /// side channel, so a reply never competes with broadcast traffic.
    pub fn reply_to_worker(&self, worker: DomainId, id: u64, result: std::result::Result<Value, String>) -> Result<()> {
        let channel = {
            let workers = self.workers.lock();
            workers.iter().find(|w| w.id == worker).map(|w| w.channel)
        };
        let channel = channel.ok_or(Error::ClosedQueue)?;
        let (payload, is_error) = match result {
            Ok(v) => (v, false),
            Err(msg) => (Value::str(msg), true),
        };
        self.for_workers.put(channel, Item::response(self.domain, id, payload, is_error))
    }

    pub fn close_hub_queue(&self) {
        self.for_hub.close();
    }

    // -- health -----------------------------------------------------------

    pub(crate) fn push_health(&self, event: HealthEvent) -> Result<()> {
        let mut g = self.health.lock();
        if *self.health_closed.lock() {
            return Err(Error::ClosedQueue);
        }
        g.push(event);
        self.health_condvar.notify_all();
        Ok(())
    }

    /// Block until a health event is available.
    pub fn listen_health(&self) -> Result<HealthEvent> {
        let mut g = self.health.lock();
        loop {
            if !g.is_empty() {
                return Ok(g.remove(0));
            }
            if *self.health_closed.lock() {
                return Err(Error::ClosedQueue);
            }
            self.health_condvar.wait(&mut g);
        }
    }

    pub fn close_health_queue(&self) {
        *self.health_closed.lock() = true;
        self.health_condvar.notify_all();
    }

    /// Close every queue this hub owns. Workers blocked in `listen` wake
    /// with `ClosedQueue`.
    pub fn close(&self) {
        self.close_workers_queue();
        self.close_hub_queue();
        self.close_health_queue();
        info!(domain = %self.domain, "hub closed");
    }
}
