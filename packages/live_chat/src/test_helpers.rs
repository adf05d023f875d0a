//! In-process fakes for driving a `ChatSession` without a network.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Notify, watch};

use crate::channel::ChannelKey;
use crate::error::{ChatError, ChatResult};
use crate::history::HistoryFetcher;
use crate::transport::{
    ConnectionState, InboundFrame, InboundHandler, SubscriptionHandle, Transport,
};

/// A record at `2024-11-25T<hh_mm>:00`.
pub fn record(id: &str, hh_mm: &str) -> Value {
    json!({
        "id": id,
        "nickname": "kim",
        "message": format!("message {id}"),
        "timestamp": format!("2024-11-25T{hh_mm}:00"),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Succeed,
    Fail,
    /// Never resolves.
    Hang,
    /// Succeeds once the test releases [`FakeTransport::connect_gate`].
    Gated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

struct FakeState {
    state: watch::Sender<ConnectionState>,
    behavior: Mutex<ConnectBehavior>,
    handlers: Mutex<HashMap<String, (String, InboundHandler)>>,
    published: Mutex<Vec<Published>>,
    connect_gate: Arc<Notify>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    unsubscribes: AtomicUsize,
    next_sub: AtomicUsize,
}

/// A transport whose connect outcome and inbound traffic the test controls.
#[derive(Clone)]
pub struct FakeTransport {
    inner: Arc<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::with_behavior(ConnectBehavior::Succeed)
    }

    pub fn with_behavior(behavior: ConnectBehavior) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(FakeState {
                state,
                behavior: Mutex::new(behavior),
                handlers: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                connect_gate: Arc::new(Notify::new()),
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                unsubscribes: AtomicUsize::new(0),
                next_sub: AtomicUsize::new(0),
            }),
        }
    }

    /// A second handle onto the same fake, usable after the session drops it.
    pub fn shared(&self) -> Self {
        self.clone()
    }

    pub fn set_behavior(&self, behavior: ConnectBehavior) {
        *self.inner.behavior.lock() = behavior;
    }

    /// Release one pending `Gated` connect.
    pub fn connect_gate(&self) -> Arc<Notify> {
        self.inner.connect_gate.clone()
    }

    /// Push a message body to whoever is subscribed on `topic`.
    pub fn deliver(&self, topic: &str, body: &str) {
        let handler = self
            .inner
            .handlers
            .lock()
            .get(topic)
            .map(|(_, h)| h.clone());
        if let Some(handler) = handler {
            handler(InboundFrame {
                topic: topic.to_string(),
                headers: Vec::new(),
                body: body.to_string(),
            });
        }
    }

    /// Simulate the server going away.
    pub fn drop_connection(&self) {
        self.inner.handlers.lock().clear();
        self.set_state(ConnectionState::Closed);
    }

    pub fn published(&self) -> Vec<Published> {
        self.inner.published.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    /// SUBSCRIBEs that registered a new handler.
    pub fn subscribe_count(&self) -> usize {
        self.inner.next_sub.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.inner.unsubscribes.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: ConnectionState) {
        self.inner.state.send_if_modified(|current| {
            let changed = *current != next;
            *current = next;
            changed
        });
    }
}

impl Transport for FakeTransport {
    async fn connect(&self, _endpoint: &str) -> ChatResult<()> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        if self.state().can_publish() {
            return Ok(());
        }
        let reconnecting = self.state() == ConnectionState::Closed;
        self.set_state(if reconnecting {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });
        let behavior = *self.inner.behavior.lock();
        match behavior {
            ConnectBehavior::Succeed => {
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            ConnectBehavior::Fail => {
                self.set_state(ConnectionState::Closed);
                Err(ChatError::TransportUnavailable("connection refused".into()))
            }
            ConnectBehavior::Hang => std::future::pending().await,
            ConnectBehavior::Gated => {
                self.inner.connect_gate.notified().await;
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
        }
    }

    fn subscribe(&self, topic: &str, handler: InboundHandler) -> ChatResult<SubscriptionHandle> {
        if !self.state().can_publish() {
            return Err(ChatError::NotConnected);
        }
        let mut handlers = self.inner.handlers.lock();
        let id = match handlers.get(topic) {
            Some((id, _)) => id.clone(),
            None => {
                let id = format!("sub-{}", self.inner.next_sub.fetch_add(1, Ordering::SeqCst));
                handlers.insert(topic.to_string(), (id.clone(), handler));
                id
            }
        };
        drop(handlers);
        self.set_state(ConnectionState::Subscribed);
        Ok(SubscriptionHandle {
            id,
            topic: topic.to_string(),
        })
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> ChatResult<()> {
        if self.inner.handlers.lock().remove(&handle.topic).is_some() {
            self.inner.unsubscribes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn publish(&self, topic: &str, headers: &[(String, String)], body: &str) -> ChatResult<()> {
        if !self.state().can_publish() {
            return Err(ChatError::NotConnected);
        }
        self.inner.published.lock().push(Published {
            topic: topic.to_string(),
            headers: headers.to_vec(),
            body: body.to_string(),
        });
        Ok(())
    }

    fn disconnect(&self) {
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        self.inner.handlers.lock().clear();
        self.set_state(ConnectionState::Closed);
    }

    fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }
}

/// History that answers with scripted results, optionally only after the
/// test opens the gate for that call.
pub struct FakeHistory {
    /// Call `n` gets entry `n`; the last entry repeats.
    results: Vec<ChatResult<Vec<Value>>>,
    gated: bool,
    gates: Mutex<HashMap<usize, Arc<Notify>>>,
    calls: AtomicUsize,
}

impl FakeHistory {
    fn scripted(results: Vec<ChatResult<Vec<Value>>>, gated: bool) -> Self {
        Self {
            results,
            gated,
            gates: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn ready(records: Vec<Value>) -> Self {
        Self::scripted(vec![Ok(records)], false)
    }

    pub fn gated(records: Vec<Value>) -> Self {
        Self::scripted(vec![Ok(records)], true)
    }

    /// One gated batch per call, in call order.
    pub fn sequence(batches: Vec<Vec<Value>>) -> Self {
        Self::scripted(batches.into_iter().map(Ok).collect(), true)
    }

    pub fn failing(err: ChatError) -> Self {
        Self::scripted(vec![Err(err)], false)
    }

    /// Release the first fetch.
    pub fn gate(&self) -> Arc<Notify> {
        self.gate_for(0)
    }

    /// Release fetch number `call` (zero-based). A release before the fetch
    /// starts is remembered.
    pub fn gate_for(&self, call: usize) -> Arc<Notify> {
        self.gates.lock().entry(call).or_default().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HistoryFetcher for FakeHistory {
    async fn fetch_history(&self, _channel: &ChannelKey) -> ChatResult<Vec<Value>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.gated {
            let gate = self.gate_for(call);
            gate.notified().await;
        }
        let last = self.results.len().saturating_sub(1);
        self.results
            .get(call.min(last))
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}
