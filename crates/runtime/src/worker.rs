//! The worker side of a hub/worker pair (§4.6).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, instrument};

use hive_core::{reconcile, Direction, DomainId, Map, RefCountTable, RefQueue, Value};

use crate::error::Result;
use crate::hub::{Hub, HealthEvent};
use crate::queue::Item;
use crate::reflect::{reflect, RaisedError};

/// One domain's view into a [`Hub`]: a reconciled read-only window onto the
/// hub's index, plus the request/response/health traffic that crosses
/// through the hub's queues.
pub struct Worker {
    hub: Arc<Hub>,
    id: DomainId,
    channel: usize,
    next_request_id: AtomicU64,
    /// Schedules ops on hub-owned objects this worker has been handed; the
    /// hub drains it (it owns the objects, so it owns the bookkeeping).
    main_refs: Arc<RefQueue<Value>>,
    /// Schedules ops on this worker's own objects that the hub points at;
    /// this worker drains it against `worker_table`.
    worker_refs: RefQueue<Value>,
    worker_table: RefCountTable<Value>,
    view_ref: Arc<Value>,
    closed: AtomicBool,
}

impl Worker {
    pub fn new(hub: Arc<Hub>) -> Result<Self> {
        let id = DomainId::next();
        let main_refs = Arc::new(RefQueue::new(hub.domain()));
        let channel = hub.register_worker(id, Arc::clone(&main_refs))?;

        let view = reconcile(&Value::Map(hub.index_snapshot()), Direction::HubToWorker, id)?;
        let view_ref = Arc::new(view);
        main_refs.schedule_increment(Arc::clone(&view_ref));

        let worker = Worker {
            hub,
            id,
            channel,
            next_request_id: AtomicU64::new(1),
            main_refs,
            worker_refs: RefQueue::new(id),
            worker_table: RefCountTable::new(),
            view_ref,
            closed: AtomicBool::new(false),
        };
        worker.report_start()?;
        debug!(worker = %id, channel, "worker started");
        Ok(worker)
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    fn view(&self) -> Result<Map> {
        match reconcile(&Value::Map(self.hub.index_snapshot()), Direction::HubToWorker, self.id)? {
            Value::Map(m) => Ok(m),
            _ => unreachable!("reconciling a Map always yields a Map"),
        }
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.view()?.len())
    }

    pub fn contains(&self, key: &Value) -> Result<bool> {
        Ok(self.view()?.contains(key)?)
    }

    pub fn get(&self, key: &Value) -> Result<Value> {
        Ok(self.view()?.get(key)?)
    }

    /// Block for the next message addressed to this worker (its own side
    /// channel, or the hub's shared broadcast/push channel).
    pub fn listen(&self) -> Result<WorkerMessage> {
        let item = self.hub_for_workers().listen(self.channel)?;
        Ok(decode_for_worker(item))
    }

    fn hub_for_workers(&self) -> &crate::queue::MultiChannelQueue {
        self.hub.worker_queue()
    }

    /// Initiate a request to the hub, returning a correlation id. The hub
    /// answers on its `for_hub` queue — see [`Hub::listen`].
    #[instrument(skip(self, payload))]
    pub fn request(&self, payload: Value) -> Result<u64> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.hub.post_from_worker(Item::request(self.id, id, payload))?;
        Ok(id)
    }

    /// Answer a hub-initiated request (received as [`WorkerMessage::Request`]).
    pub fn respond(&self, id: u64, value: Value) -> Result<()> {
        self.hub.post_from_worker(Item::response(self.id, id, value, false))
    }

    /// Push a one-way message to the hub.
    pub fn push_to_hub(&self, value: Value) -> Result<()> {
        self.hub.post_from_worker(Item::broadcast(self.id, value))
    }

    /// Drain this worker's own ref queue against its own table — the
    /// mirror image of the hub's `flush_refs`.
    pub fn flush_refs(&self) -> hive_core::DrainReport {
        self.worker_refs.drain(&self.worker_table)
    }

    pub fn report_start(&self) -> Result<()> {
        self.hub.push_health(HealthEvent::Start(self.id))
    }

    pub fn report_close(&self) -> Result<()> {
        self.hub.push_health(HealthEvent::Close(self.id))
    }

    pub fn report_error(&self, error: RaisedError) -> Result<()> {
        let root = Arc::new(error);
        let reflected = reflect(&root);
        let r = reflected.root();
        self.hub.push_health(HealthEvent::Error {
            worker: self.id,
            class_name: r.class_name.clone(),
            message: r.message.clone(),
            error: Some(reflected),
        })
    }

    /// Report close, release this worker's hold on its hub view, and drop
    /// its registration.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        self.report_close()?;
        self.main_refs.schedule_decrement(Arc::clone(&self.view_ref));
        self.hub.drain_worker_main_refs(self.id);
        self.flush_refs();
        self.hub.unregister_worker(self.id);
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Relaxed) {
            let _ = self.close();
        }
    }
}

/// What a worker's `listen()` surfaces, decoded from the underlying
/// [`Message`] shape the hub side also uses.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Broadcast { value: Value },
    Request { id: u64, value: Value },
    Response { id: u64, value: Value, is_error: bool },
}

fn decode_for_worker(item: Item) -> WorkerMessage {
    match item.kind {
        crate::queue::ItemKind::Broadcast => WorkerMessage::Broadcast { value: item.payload },
        crate::queue::ItemKind::Request => WorkerMessage::Request { id: item.id, value: item.payload },
        crate::queue::ItemKind::Response => {
            WorkerMessage::Response { id: item.id, value: item.payload, is_error: item.is_error }
        }
    }
}

// Re-exported so downstream match arms can name it without importing hub.rs
// directly.
pub use crate::hub::Message as HubMessage;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_sees_values_the_hub_set_before_registration() {
        let hub = Hub::with_default_capacity();
        hub.set(Value::str("a"), Value::Int(1)).unwrap();
        let worker = Worker::new(Arc::clone(&hub)).unwrap();
        assert!(worker.get(&Value::str("a")).unwrap().structural_eq(&Value::Int(1)).unwrap());
    }

    #[test]
    fn nested_map_round_trips_through_worker_view() {
        let hub = Hub::with_default_capacity();
        let inner = Map::new(hub.domain()).assoc(Value::str("c"), Value::Int(2)).unwrap();
        hub.set(Value::str("b"), Value::Map(inner)).unwrap();

        let worker = Worker::new(Arc::clone(&hub)).unwrap();
        worker.flush_refs();
        let first = hub.flush_refs();
        assert!(first.iter().map(|r| r.net_delta()).sum::<i64>() >= 0);

        match worker.get(&Value::str("b")).unwrap() {
            Value::Map(nested) => {
                assert!(nested.get(&Value::str("c")).unwrap().structural_eq(&Value::Int(2)).unwrap());
            }
            other => panic!("expected a nested map, got {other:?}"),
        }

        let second = hub.flush_refs();
        assert_eq!(second.iter().map(|r| r.net_delta()).sum::<i64>(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let hub = Hub::with_default_capacity();
        let worker = Worker::new(Arc::clone(&hub)).unwrap();
        worker.close().unwrap();
        worker.close().unwrap();
    }

    #[test]
    fn replies_correlate_by_id_not_arrival_order() {
        let hub = Hub::with_default_capacity();
        let worker = Worker::new(Arc::clone(&hub)).unwrap();

        let id_a = hub.request_worker(worker.channel(), Value::str("first")).unwrap();
        let id_b = hub.request_worker(worker.channel(), Value::str("second")).unwrap();
        assert_ne!(id_a, id_b);

        let msg_a = worker.listen().unwrap();
        let msg_b = worker.listen().unwrap();
        let (req_a, req_b) = match (msg_a, msg_b) {
            (WorkerMessage::Request { id, .. }, WorkerMessage::Request { id: id2, .. }) => (id, id2),
            other => panic!("expected two requests, got {other:?}"),
        };
        assert_eq!((req_a, req_b), (id_a, id_b));

        // Answer out of arrival order.
        worker.respond(id_b, Value::str("answer-b")).unwrap();
        worker.respond(id_a, Value::str("answer-a")).unwrap();

        let mut answers = std::collections::HashMap::new();
        for _ in 0..2 {
            match hub.listen().unwrap() {
                HubMessage::Response { id, value, is_error } => {
                    assert!(!is_error);
                    answers.insert(id, value);
                }
                other => panic!("expected a response, got {other:?}"),
            }
        }
        assert!(answers[&id_a].structural_eq(&Value::str("answer-a")).unwrap());
        assert!(answers[&id_b].structural_eq(&Value::str("answer-b")).unwrap());
    }
}
