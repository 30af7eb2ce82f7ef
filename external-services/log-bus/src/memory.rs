//! In-process broker with RabbitMQ queue semantics
//!
//! Used by the test suites and for local runs without a broker. It models the
//! parts of AMQP this crate relies on: queue declaration equivalence, default
//! exchange routing (unroutable publishes are dropped), per-consumer prefetch,
//! round-robin dispatch, ack/nack/reject, and requeue of unacknowledged
//! deliveries when a channel or connection closes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerTransport, Delivery, DeliveryAcker, DeliveryStream,
    QueueOptions, TransportError, TransportResult,
};

/// Operations that can be made to fail once via [`InMemoryBroker::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Connect,
    OpenChannel,
    DeclareQueue,
    Publish,
    Prefetch,
    Subscribe,
    Settle,
    CloseChannel,
    CloseConnection,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    /// Open channel id -> owning connection id.
    channels: HashMap<u64, u64>,
    connections: HashSet<u64>,
    faults: HashSet<Fault>,
    /// Highest number of unacknowledged deliveries seen per consumer tag.
    peak_in_flight: HashMap<String, usize>,
    next_id: u64,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerSlot>,
    unacked: HashMap<u64, Unacked>,
    cursor: usize,
}

#[derive(Clone)]
struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    consumer_id: u64,
    message: Message,
}

struct ConsumerSlot {
    id: u64,
    channel_id: u64,
    tag: String,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<TransportResult<Delivery>>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Requeue,
    Discard,
}

fn broker_error(message: impl Into<String>) -> TransportError {
    TransportError::Broker(message.into())
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            unacked: HashMap::new(),
            cursor: 0,
        }
    }

    /// Put a departed consumer's outstanding deliveries back at the head of
    /// the queue, oldest first.
    fn requeue_outstanding(&mut self, consumer_id: u64) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.consumer_id == consumer_id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.ready.push_front(Message {
                    redelivered: true,
                    ..unacked.message
                });
            }
        }
    }
}

impl BrokerState {
    fn take_fault(&mut self, fault: Fault) -> TransportResult<()> {
        if self.faults.remove(&fault) {
            return Err(broker_error(format!("injected fault: {fault:?}")));
        }
        Ok(())
    }

    fn ensure_channel(&self, channel_id: u64) -> TransportResult<()> {
        if self.channels.contains_key(&channel_id) {
            Ok(())
        } else {
            Err(broker_error(format!("channel {channel_id} is closed")))
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn enqueue(&mut self, queue: &str, body: Vec<u8>, broker: &Weak<Mutex<BrokerState>>) -> bool {
        let Some(state) = self.queues.get_mut(queue) else {
            return false;
        };
        state.ready.push_back(Message {
            body,
            redelivered: false,
        });
        self.dispatch(queue, broker);
        true
    }

    /// Hand ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self, queue_name: &str, broker: &Weak<Mutex<BrokerState>>) {
        let BrokerState {
            queues,
            peak_in_flight,
            next_id,
            ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        loop {
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let start = queue.cursor % count;
            let Some(index) = (0..count)
                .map(|offset| (start + offset) % count)
                .find(|&i| queue.consumers.get(i).is_some_and(ConsumerSlot::has_capacity))
            else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            *next_id += 1;
            let delivery_tag = *next_id;
            let delivery = Delivery {
                delivery_tag,
                redelivered: message.redelivered,
                body: message.body.clone(),
                acker: Arc::new(MemoryAcker {
                    broker: broker.clone(),
                    queue: queue_name.to_string(),
                    delivery_tag,
                }),
            };

            let Some(slot) = queue.consumers.get_mut(index) else {
                queue.ready.push_front(message);
                return;
            };
            if slot.sender.send(Ok(delivery)).is_err() {
                // The subscriber dropped its stream: treat as a cancelled consumer.
                let departed = queue.consumers.remove(index);
                queue.ready.push_front(message);
                queue.requeue_outstanding(departed.id);
                continue;
            }

            slot.in_flight += 1;
            let peak = peak_in_flight.entry(slot.tag.clone()).or_default();
            *peak = (*peak).max(slot.in_flight);

            queue.unacked.insert(
                delivery_tag,
                Unacked {
                    consumer_id: slot.id,
                    message,
                },
            );
            queue.cursor = index + 1;
        }
    }

    fn settle(
        &mut self,
        queue_name: &str,
        delivery_tag: u64,
        settlement: Settlement,
        broker: &Weak<Mutex<BrokerState>>,
    ) -> TransportResult<()> {
        self.take_fault(Fault::Settle)?;

        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| broker_error(format!("NOT_FOUND - no queue '{queue_name}'")))?;
        let unacked = queue.unacked.remove(&delivery_tag).ok_or_else(|| {
            broker_error(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"))
        })?;

        if let Some(slot) = queue
            .consumers
            .iter_mut()
            .find(|slot| slot.id == unacked.consumer_id)
        {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }

        match settlement {
            Settlement::Ack | Settlement::Discard => {}
            Settlement::Requeue => queue.ready.push_front(Message {
                redelivered: true,
                ..unacked.message
            }),
        }

        self.dispatch(queue_name, broker);
        Ok(())
    }

    fn close_channel(&mut self, channel_id: u64, broker: &Weak<Mutex<BrokerState>>) {
        if self.channels.remove(&channel_id).is_none() {
            return;
        }

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in &names {
            if let Some(queue) = self.queues.get_mut(name) {
                let departed: Vec<u64> = queue
                    .consumers
                    .iter()
                    .filter(|slot| slot.channel_id == channel_id)
                    .map(|slot| slot.id)
                    .collect();
                queue.consumers.retain(|slot| slot.channel_id != channel_id);
                for consumer_id in departed {
                    queue.requeue_outstanding(consumer_id);
                }
            }
        }
        for name in &names {
            self.dispatch(name, broker);
        }
        debug!(channel_id, "In-memory channel closed");
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next occurrence of `fault` fail with a broker error.
    pub fn fail_next(&self, fault: Fault) {
        self.state.lock().faults.insert(fault);
    }

    /// Declare a queue outside of any client, e.g. to pre-provision it with
    /// different flags.
    ///
    /// # Errors
    ///
    /// Fails when the queue exists with different flags.
    pub fn declare(&self, queue: &str, options: QueueOptions) -> TransportResult<()> {
        declare_in(&mut self.state.lock(), queue, options)
    }

    /// Place a raw body on a queue, bypassing any client. Returns `false` when
    /// the queue does not exist.
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) -> bool {
        let weak = Arc::downgrade(&self.state);
        self.state.lock().enqueue(queue, body.into(), &weak)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// Messages waiting to be delivered.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Bodies of the messages waiting to be delivered, head first.
    pub fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Highest number of unacknowledged deliveries any consumer with this tag
    /// has held at once.
    pub fn peak_unacked(&self, consumer_tag: &str) -> usize {
        self.state
            .lock()
            .peak_in_flight
            .get(consumer_tag)
            .copied()
            .unwrap_or(0)
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.len()
    }
}

fn declare_in(state: &mut BrokerState, queue: &str, options: QueueOptions) -> TransportResult<()> {
    match state.queues.get(queue) {
        Some(existing) if existing.options != options => Err(broker_error(format!(
            "PRECONDITION_FAILED - inequivalent arg for queue '{queue}': declared {:?}, requested {:?}",
            existing.options, options
        ))),
        Some(_) => Ok(()),
        None => {
            state.queues.insert(queue.to_string(), QueueState::new(options));
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn connect(
        &self,
        _uri: &str,
        connection_name: Option<&str>,
    ) -> TransportResult<Box<dyn BrokerConnection>> {
        let mut state = self.state.lock();
        state.take_fault(Fault::Connect)?;
        let id = state.next_id();
        state.connections.insert(id);
        debug!(connection_id = id, connection_name, "In-memory connection opened");

        Ok(Box::new(MemoryConnection {
            id,
            broker: self.state.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> TransportResult<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.lock();
        state.take_fault(Fault::OpenChannel)?;
        if !state.connections.contains(&self.id) {
            return Err(broker_error(format!("connection {} is closed", self.id)));
        }
        let id = state.next_id();
        state.channels.insert(id, self.id);

        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
            prefetch: AtomicU16::new(0),
        }))
    }

    async fn close(&self) -> TransportResult<()> {
        let weak = Arc::downgrade(&self.broker);
        let mut state = self.broker.lock();
        state.take_fault(Fault::CloseConnection)?;
        if !state.connections.remove(&self.id) {
            return Err(broker_error(format!("connection {} is already closed", self.id)));
        }

        let owned: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, connection)| **connection == self.id)
            .map(|(channel, _)| *channel)
            .collect();
        for channel_id in owned {
            state.close_channel(channel_id, &weak);
        }
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    broker: Arc<Mutex<BrokerState>>,
    prefetch: AtomicU16,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> TransportResult<()> {
        let weak = Arc::downgrade(&self.broker);
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;
        state.take_fault(Fault::DeclareQueue)?;

        let declared = declare_in(&mut state, name, options);
        if declared.is_err() {
            // A failed declaration is a channel-level exception in AMQP.
            state.close_channel(self.id, &weak);
        }
        declared
    }

    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        _content_type: &str,
    ) -> TransportResult<()> {
        let weak = Arc::downgrade(&self.broker);
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;
        state.take_fault(Fault::Publish)?;

        if !state.enqueue(routing_key, payload.to_vec(), &weak) {
            debug!(routing_key, "Dropped unroutable message");
        }
        Ok(())
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> TransportResult<()> {
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;
        state.take_fault(Fault::Prefetch)?;
        self.prefetch.store(prefetch_count, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> TransportResult<DeliveryStream> {
        let weak = Arc::downgrade(&self.broker);
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;
        state.take_fault(Fault::Subscribe)?;

        let duplicate = state.queues.values().any(|q| {
            q.consumers
                .iter()
                .any(|slot| slot.channel_id == self.id && slot.tag == consumer_tag)
        });
        if duplicate {
            return Err(broker_error(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"
            )));
        }

        let id = state.next_id();
        let (sender, receiver) = mpsc::unbounded_channel();
        let slot = ConsumerSlot {
            id,
            channel_id: self.id,
            tag: consumer_tag.to_string(),
            prefetch: self.prefetch.load(Ordering::SeqCst),
            in_flight: 0,
            sender,
        };
        state
            .queues
            .get_mut(queue)
            .ok_or_else(|| broker_error(format!("NOT_FOUND - no queue '{queue}'")))?
            .consumers
            .push(slot);
        state.dispatch(queue, &weak);

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn close(&self) -> TransportResult<()> {
        let weak = Arc::downgrade(&self.broker);
        let mut state = self.broker.lock();
        state.take_fault(Fault::CloseChannel)?;
        state.ensure_channel(self.id)?;
        state.close_channel(self.id, &weak);
        Ok(())
    }
}

struct MemoryAcker {
    broker: Weak<Mutex<BrokerState>>,
    queue: String,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, settlement: Settlement) -> TransportResult<()> {
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| broker_error("broker has shut down"))?;
        let mut state = broker.lock();
        state.settle(&self.queue, self.delivery_tag, settlement, &self.broker)
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> TransportResult<()> {
        self.settle(Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> TransportResult<()> {
        self.settle(if requeue {
            Settlement::Requeue
        } else {
            Settlement::Discard
        })
    }

    async fn reject(&self, requeue: bool) -> TransportResult<()> {
        self.nack(requeue).await
    }
}
