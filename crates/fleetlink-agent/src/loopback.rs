//! In-memory transport that plays the coordinator inside the process.
//!
//! Replies are delivered on a per-connection dispatch thread, so the
//! correlation gateway sees the same send-then-callback ordering it sees on a
//! real socket. Used by tests and by `fleetlink simulate`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use serde_json::{Value, json};
use tracing::{debug, warn};

use fleetlink_core::error::AgentError;
use fleetlink_core::protocol::{
    AckMode, CORRELATION_ID_HEADER, DESTINATION_HEADER, HEARTBEAT_ENDPOINT, REGISTRATION_ENDPOINT,
    SERVER_RESPONSES_TOPIC,
};

use crate::transport::{Connection, Connector, CorrelationId, Headers, Listener};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Coordinator side of the loopback: turns a request into an optional reply.
pub trait Responder: Send + Sync {
    /// `None` means the coordinator never answers (the caller times out).
    fn respond(&self, destination: &str, body: &Value) -> Option<Value>;
}

// ============================================================================
// Scripted coordinator
// ============================================================================

/// Well-behaved coordinator with knobs for injecting faults.
///
/// By default it accepts registration with `initial_id`, answers each
/// heartbeat `{id: n}` with `{id: n + 1}`, and answers every bootstrap
/// request with an empty resource.
pub struct ScriptedCoordinator {
    initial_id: i64,
    queued: Mutex<HashMap<String, VecDeque<Value>>>,
    silent: Mutex<HashSet<String>>,
    requests: Mutex<HashMap<String, Vec<Value>>>,
    heartbeats: AtomicU64,
    skew_at: Mutex<Option<(u64, i64)>>,
    restart_at: Mutex<Option<u64>>,
}

impl ScriptedCoordinator {
    pub fn new(initial_id: i64) -> Self {
        Self {
            initial_id,
            queued: Mutex::new(HashMap::new()),
            silent: Mutex::new(HashSet::new()),
            requests: Mutex::new(HashMap::new()),
            heartbeats: AtomicU64::new(0),
            skew_at: Mutex::new(None),
            restart_at: Mutex::new(None),
        }
    }

    /// Answer the next request to `destination` with `reply` verbatim.
    pub fn queue_reply(&self, destination: &str, reply: Value) {
        lock(&self.queued)
            .entry(destination.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Answer the next registration with `reply` verbatim.
    pub fn reply_to_registration(&self, reply: Value) {
        self.queue_reply(REGISTRATION_ENDPOINT, reply);
    }

    /// Never answer requests to `destination`.
    pub fn drop_replies_to(&self, destination: &str) {
        lock(&self.silent).insert(destination.to_string());
    }

    /// Resume answering requests to `destination`.
    pub fn restore_replies_to(&self, destination: &str) {
        lock(&self.silent).remove(destination);
    }

    /// Offset the id of the `nth` heartbeat reply (1-based) by `skew`.
    pub fn skew_heartbeat(&self, nth: u64, skew: i64) {
        *lock(&self.skew_at) = Some((nth, skew));
    }

    /// Set `restartAgent: "true"` on the `nth` heartbeat reply (1-based).
    pub fn restart_at_heartbeat(&self, nth: u64) {
        *lock(&self.restart_at) = Some(nth);
    }

    /// Bodies received on `destination`, oldest first.
    pub fn requests_to(&self, destination: &str) -> Vec<Value> {
        lock(&self.requests)
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }

    /// Heartbeats answered so far.
    pub fn heartbeat_count(&self) -> u64 {
        self.heartbeats.load(Ordering::SeqCst)
    }

    fn heartbeat_reply(&self, body: &Value) -> Value {
        let n = self.heartbeats.fetch_add(1, Ordering::SeqCst) + 1;
        let id = body.get("id").and_then(Value::as_i64).unwrap_or(0);
        let skew = match *lock(&self.skew_at) {
            Some((at, skew)) if at == n => skew,
            _ => 0,
        };
        let mut reply = json!({ "id": id + 1 + skew });
        if *lock(&self.restart_at) == Some(n) {
            reply["restartAgent"] = json!("true");
        }
        reply
    }
}

impl Responder for ScriptedCoordinator {
    fn respond(&self, destination: &str, body: &Value) -> Option<Value> {
        lock(&self.requests)
            .entry(destination.to_string())
            .or_default()
            .push(body.clone());

        if lock(&self.silent).contains(destination) {
            return None;
        }
        if let Some(reply) = lock(&self.queued)
            .get_mut(destination)
            .and_then(VecDeque::pop_front)
        {
            return Some(reply);
        }

        Some(match destination {
            REGISTRATION_ENDPOINT => json!({ "id": self.initial_id, "exitstatus": 0 }),
            HEARTBEAT_ENDPOINT => self.heartbeat_reply(body),
            other => json!({ "endpoint": other, "data": {} }),
        })
    }
}

// ============================================================================
// Connector / connection
// ============================================================================

type Frame = (Headers, Value);

/// Opens loopback sessions against a [`Responder`].
pub struct LoopbackConnector {
    responder: Arc<dyn Responder>,
    refuse: AtomicBool,
    connections: Mutex<Vec<Arc<LoopbackConnection>>>,
}

impl LoopbackConnector {
    pub fn new(responder: Arc<dyn Responder>) -> Self {
        Self {
            responder,
            refuse: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Make subsequent `connect` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn last_connection(&self) -> Option<Arc<LoopbackConnection>> {
        lock(&self.connections).last().cloned()
    }
}

impl Connector for LoopbackConnector {
    fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, AgentError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(AgentError::Transport(anyhow::anyhow!(
                "Connection refused by {}",
                url
            )));
        }
        let connection = Arc::new(LoopbackConnection::open(Arc::clone(&self.responder)));
        lock(&self.connections).push(Arc::clone(&connection));
        debug!(url, "Loopback connection opened");
        Ok(connection)
    }
}

/// One loopback session with its own dispatch thread.
pub struct LoopbackConnection {
    responder: Arc<dyn Responder>,
    next_id: AtomicU64,
    closed: AtomicBool,
    subscriptions: Arc<Mutex<Vec<(String, AckMode)>>>,
    listeners: Arc<Mutex<Vec<Arc<dyn Listener>>>>,
    outbound: Mutex<Option<Sender<Frame>>>,
}

impl LoopbackConnection {
    fn open(responder: Arc<dyn Responder>) -> Self {
        let (tx, rx) = mpsc::channel::<Frame>();
        let listeners: Arc<Mutex<Vec<Arc<dyn Listener>>>> = Arc::new(Mutex::new(Vec::new()));
        let subscriptions: Arc<Mutex<Vec<(String, AckMode)>>> = Arc::new(Mutex::new(Vec::new()));

        let dispatch_listeners = Arc::clone(&listeners);
        let dispatch_subscriptions = Arc::clone(&subscriptions);
        thread::spawn(move || {
            for (headers, body) in rx {
                let destination = headers.get(DESTINATION_HEADER).cloned().unwrap_or_default();
                let subscribed = lock(&dispatch_subscriptions)
                    .iter()
                    .any(|(topic, _)| *topic == destination);
                if !subscribed {
                    debug!(destination = %destination, "Dropping frame for unsubscribed topic");
                    continue;
                }
                let listeners = lock(&dispatch_listeners).clone();
                for listener in listeners {
                    if let Err(e) = listener.on_message(&headers, &body) {
                        warn!(topic = listener.topic(), error = %e, "Listener failed");
                    }
                }
            }
        });

        Self {
            responder,
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            subscriptions,
            listeners,
            outbound: Mutex::new(Some(tx)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribed topics in subscription order.
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions)
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Listeners attached to this session, in attach order.
    pub fn listeners(&self) -> Vec<Arc<dyn Listener>> {
        lock(&self.listeners).clone()
    }

    pub fn ack_modes(&self) -> Vec<AckMode> {
        lock(&self.subscriptions).iter().map(|(_, ack)| *ack).collect()
    }

    /// Push an unsolicited frame onto `topic`, as the coordinator would.
    pub fn publish(&self, topic: &str, body: Value) -> Result<(), AgentError> {
        let mut headers = Headers::new();
        headers.insert(DESTINATION_HEADER.to_string(), topic.to_string());
        self.enqueue(topic, (headers, body))
    }

    fn enqueue(&self, destination: &str, frame: Frame) -> Result<(), AgentError> {
        let closed = || AgentError::TransportClosed {
            destination: destination.to_string(),
        };
        if self.is_closed() {
            return Err(closed());
        }
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| closed()),
            None => Err(closed()),
        }
    }
}

impl Connection for LoopbackConnection {
    fn send(&self, body: &Value, destination: &str) -> Result<CorrelationId, AgentError> {
        if self.is_closed() {
            return Err(AgentError::TransportClosed {
                destination: destination.to_string(),
            });
        }
        let correlation_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();

        if let Some(reply) = self.responder.respond(destination, body) {
            let mut headers = Headers::new();
            headers.insert(
                DESTINATION_HEADER.to_string(),
                SERVER_RESPONSES_TOPIC.to_string(),
            );
            headers.insert(CORRELATION_ID_HEADER.to_string(), correlation_id.clone());
            self.enqueue(destination, (headers, reply))?;
        }
        Ok(correlation_id)
    }

    fn subscribe(&self, destination: &str, ack: AckMode) -> Result<(), AgentError> {
        if self.is_closed() {
            return Err(AgentError::TransportClosed {
                destination: destination.to_string(),
            });
        }
        lock(&self.subscriptions).push((destination.to_string(), ack));
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn Listener>) {
        lock(&self.listeners).push(listener);
    }

    fn disconnect(&self) -> Result<(), AgentError> {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the sender ends the dispatch thread once it drains.
        lock(&self.outbound).take();
        Ok(())
    }
}
