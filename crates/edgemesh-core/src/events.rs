//! Event Bus (spec section 4.7): the single point through which every
//! state change flows, fanning out to a bounded ring buffer, named
//! counters, and zero or more live subscribers.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::ids::TaskId;
use crate::store::{Event, EventType};

/// Default ring buffer capacity (spec.md section 6).
pub const DEFAULT_RING_CAPACITY: usize = 2000;

/// Default broadcast channel capacity backing live subscribers. Sized
/// generously above the ring buffer since slow subscribers are dropped,
/// not buffered indefinitely (spec.md section 4.7).
const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

struct RingBuffer {
    capacity: usize,
    events: std::collections::VecDeque<Event>,
    /// `taskId -> enqueued_at`, used to pair `task.enqueued` with
    /// `task.claimed` for claim-latency summaries. A task that is never
    /// claimed (cancelled while queued, or sent straight to the DLQ) would
    /// otherwise sit here forever, so entries are also tracked in
    /// `enqueued_order` and evicted oldest-first past `capacity`, same as
    /// the ring buffer itself.
    enqueued_at: HashMap<TaskId, chrono::DateTime<chrono::Utc>>,
    enqueued_order: std::collections::VecDeque<TaskId>,
    /// Recorded claim-latency samples, oldest first. Evicted the same way
    /// as `events` once past `capacity`, so a long-running process doesn't
    /// carry an ever-growing sample set into every `/metrics` percentile
    /// computation.
    claim_latencies_ms: std::collections::VecDeque<i64>,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: std::collections::VecDeque::with_capacity(capacity),
            enqueued_at: HashMap::new(),
            enqueued_order: std::collections::VecDeque::new(),
            claim_latencies_ms: std::collections::VecDeque::new(),
        }
    }

    fn push(&mut self, event: &Event) {
        match (event.event_type, event.task_id) {
            (EventType::TaskEnqueued, Some(task_id)) => {
                self.enqueued_at.insert(task_id, event.at);
                self.enqueued_order.push_back(task_id);
                while self.enqueued_order.len() > self.capacity {
                    if let Some(oldest) = self.enqueued_order.pop_front() {
                        self.enqueued_at.remove(&oldest);
                    }
                }
            }
            (EventType::TaskClaimed, Some(task_id)) => {
                if let Some(enqueued_at) = self.enqueued_at.remove(&task_id) {
                    self.claim_latencies_ms.push_back((event.at - enqueued_at).num_milliseconds());
                    if self.claim_latencies_ms.len() > self.capacity {
                        self.claim_latencies_ms.pop_front();
                    }
                }
            }
            _ => {}
        }

        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event.clone());
    }
}

#[derive(Default)]
struct Counters {
    by_event_type: HashMap<&'static str, u64>,
    by_caller: HashMap<String, u64>,
}

/// Fan-out point for every state-change event in the process.
///
/// Built-in subscribers (ring buffer, counters) are always active. Live
/// subscribers are opt-in via [`EventBus::subscribe`] and receive events
/// through a `tokio::sync::broadcast` channel — a subscriber that falls
/// behind the channel's capacity silently misses old events (per the
/// broadcast channel's lag semantics) rather than blocking emitters.
pub struct EventBus {
    ring: Mutex<RingBuffer>,
    counters: Mutex<Counters>,
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(ring_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            ring: Mutex::new(RingBuffer::new(ring_capacity)),
            counters: Mutex::new(Counters::default()),
            sender,
        }
    }

    /// Emit an event to every subscriber, in order. Synchronous and
    /// non-blocking: the ring buffer and counters are plain in-memory
    /// updates, and broadcasting to live subscribers never awaits a slow
    /// receiver (it just drops the send if there are none, or lets lagging
    /// receivers skip ahead).
    pub fn emit(&self, event: Event) {
        {
            let mut ring = self.ring.lock().expect("ring buffer mutex poisoned");
            ring.push(&event);
        }
        {
            let mut counters = self.counters.lock().expect("counters mutex poisoned");
            *counters.by_event_type.entry(event_type_label(event.event_type)).or_insert(0) += 1;
        }
        // Ignore the `Err` case: it only means there are currently no
        // live subscribers, which is not a failure of the bus.
        let _ = self.sender.send(event);
    }

    /// Emit an event and additionally attribute it to a caller identity
    /// surface for the request-rate counter.
    pub fn emit_with_caller(&self, event: Event, caller: &str) {
        self.record_request(caller);
        self.emit(event);
    }

    /// Bump the request-rate counter for a caller identity surface without
    /// an accompanying `Event` — for authenticated requests that do not
    /// themselves produce a state-change event (a token refresh, a claim
    /// poll that finds nothing to claim).
    pub fn record_request(&self, caller: &str) {
        let mut counters = self.counters.lock().expect("counters mutex poisoned");
        *counters.by_caller.entry(caller.to_string()).or_insert(0) += 1;
    }

    /// Subscribe to the live event stream. Each subscriber gets its own
    /// receiver; a receiver that falls too far behind observes
    /// `RecvError::Lagged` and should treat that as "some events were
    /// missed", matching the "slow subscribers are disconnected, not
    /// buffered indefinitely" contract.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn counters_snapshot(&self) -> HashMap<&'static str, u64> {
        self.counters.lock().expect("counters mutex poisoned").by_event_type.clone()
    }

    pub fn caller_counters_snapshot(&self) -> HashMap<String, u64> {
        self.counters.lock().expect("counters mutex poisoned").by_caller.clone()
    }

    /// Recent events retained by the ring buffer, oldest first.
    pub fn recent_events(&self) -> Vec<Event> {
        self.ring.lock().expect("ring buffer mutex poisoned").events.iter().cloned().collect()
    }

    /// Claim-latency samples (ms) paired so far, oldest first.
    pub fn claim_latencies_ms(&self) -> Vec<i64> {
        self.ring.lock().expect("ring buffer mutex poisoned").claim_latencies_ms.iter().copied().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

fn event_type_label(event_type: EventType) -> &'static str {
    match event_type {
        EventType::NodeRegistered => "node.registered",
        EventType::NodeHeartbeat => "node.heartbeat",
        EventType::NodeRevoked => "node.revoked",
        EventType::NodeDrain => "node.drain",
        EventType::NodeUndrain => "node.undrain",
        EventType::TaskEnqueued => "task.enqueued",
        EventType::TaskClaimed => "task.claimed",
        EventType::TaskRunning => "task.running",
        EventType::TaskDone => "task.done",
        EventType::TaskFailed => "task.failed",
        EventType::TaskCancelled => "task.cancelled",
    }
}
