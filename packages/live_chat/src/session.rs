//! Chat session controller.
//!
//! A `ChatSession` owns one transport connection and one message log for one
//! channel, from `activate` until `deactivate` (or drop). Connect, history and
//! inbound-message completions all arrive on a single mpsc queue; only
//! [`ChatSession::next_update`] drains it, so the log has exactly one writer.
//!
//! Every queued completion is tagged with the activation epoch it belongs to.
//! `reconnect` starts a new epoch, and anything still in flight from the old
//! one is discarded when it lands.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ChannelKey;
use crate::credentials::CredentialSource;
use crate::error::{ChatError, ChatResult};
use crate::follow::{FollowTracker, ScrollPosition};
use crate::history::HistoryFetcher;
use crate::log::MessageLog;
use crate::message::Message;
use crate::transport::{
    ConnectionState, InboundFrame, InboundHandler, SubscriptionHandle, Transport,
};

/// What changed, as seen by the consumer rendering the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// New messages entered the log. `auto_advance` tells the consumer to
    /// scroll to the newest message.
    MessagesChanged { inserted: usize, auto_advance: bool },
    ConnectionChanged(ConnectionState),
    /// Connect or subscribe failed. The session stays usable; retry with
    /// [`ChatSession::reconnect`].
    ConnectFailed(ChatError),
    /// History could not be loaded. Live messages still flow.
    HistoryFailed(ChatError),
    /// A record was rejected at intake and not inserted.
    MessageDropped(ChatError),
}

enum Event {
    Connected,
    ConnectFailed(ChatError),
    Inbound(InboundFrame),
    History(ChatResult<Vec<serde_json::Value>>),
    State(ConnectionState),
}

struct Envelope {
    epoch: u64,
    event: Event,
}

pub struct ChatSession<T, H, C>
where
    T: Transport,
    H: HistoryFetcher,
    C: CredentialSource,
{
    channel: ChannelKey,
    endpoint: String,
    transport: Arc<T>,
    history: Arc<H>,
    credentials: C,
    log: MessageLog,
    follow: FollowTracker,
    events_tx: mpsc::UnboundedSender<Envelope>,
    events_rx: mpsc::UnboundedReceiver<Envelope>,
    pending: VecDeque<SessionUpdate>,
    epoch: u64,
    reported_state: Option<ConnectionState>,
    subscription: Option<SubscriptionHandle>,
    /// Set from spawn until the connect call returns, before its completion
    /// is queued.
    connect_in_flight: Arc<AtomicBool>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    active: bool,
}

impl<T, H, C> ChatSession<T, H, C>
where
    T: Transport,
    H: HistoryFetcher,
    C: CredentialSource,
{
    /// Start a session: connect, then subscribe to the channel topic, while
    /// history loads concurrently. Must be called inside a tokio runtime.
    pub fn activate(
        channel: ChannelKey,
        endpoint: impl Into<String>,
        transport: T,
        history: H,
        credentials: C,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut session = Self {
            channel,
            endpoint: endpoint.into(),
            transport: Arc::new(transport),
            history: Arc::new(history),
            credentials,
            log: MessageLog::new(),
            follow: FollowTracker::new(),
            events_tx,
            events_rx,
            pending: VecDeque::new(),
            epoch: 0,
            reported_state: None,
            subscription: None,
            connect_in_flight: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            active: true,
        };
        info!(channel = %session.channel, endpoint = %session.endpoint, "activating chat session");
        session.spawn_state_watch();
        session.start_epoch();
        session
    }

    pub fn channel(&self) -> &ChannelKey {
        &self.channel
    }

    pub fn messages(&self) -> &[Message] {
        self.log.messages()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The live subscription, if the session is currently listening.
    pub fn subscription(&self) -> Option<&SubscriptionHandle> {
        self.subscription.as_ref()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_pinned(&self) -> bool {
        self.follow.is_pinned()
    }

    pub fn on_scroll(&mut self, position: ScrollPosition) {
        self.follow.on_scroll(position);
    }

    /// Wait for the next change. Returns `None` once the session has been
    /// deactivated.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            if !self.active {
                return None;
            }
            if let Some(update) = self.pending.pop_front() {
                return Some(update);
            }
            let envelope = self.events_rx.recv().await?;
            self.handle(envelope);
        }
    }

    /// Publish `text` to the channel. The credential is read now, on every
    /// call; with none available the transport is never touched.
    pub fn send(&self, text: &str) -> ChatResult<()> {
        if !self.active {
            return Err(ChatError::SessionClosed);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let credential = self
            .credentials
            .current()
            .ok_or(ChatError::Unauthenticated)?;

        let mut body = self.channel.routing_fields();
        body.insert("message".into(), serde_json::Value::String(text.to_string()));
        let body = serde_json::Value::Object(body).to_string();
        let headers = [("Authorization".to_string(), credential.bearer_header())];

        self.transport
            .publish(self.channel.publish_destination(), &headers, &body)
            .inspect_err(|e| warn!(channel = %self.channel, error = %e, "send failed"))
    }

    /// Re-run connect, subscribe and history after the connection closed or
    /// failed. A no-op while a connect is in flight or the channel is
    /// already subscribed.
    pub fn reconnect(&mut self) -> ChatResult<()> {
        if !self.active {
            return Err(ChatError::SessionClosed);
        }
        let state = self.transport.state();
        let listening = state.can_publish() && self.subscription.is_some();
        if self.connect_in_flight.load(Ordering::SeqCst) || state.is_connecting() || listening {
            debug!(%state, "reconnect skipped");
            return Ok(());
        }
        self.tasks.retain(|task| !task.is_finished());
        self.subscription = None;
        self.epoch += 1;
        info!(channel = %self.channel, epoch = self.epoch, "reconnecting");
        self.start_epoch();
        Ok(())
    }

    /// Tear the session down. Cancels in-flight work and disconnects the
    /// transport exactly once; later calls do nothing.
    pub fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(handle) = self.subscription.take() {
            if let Err(e) = self.transport.unsubscribe(&handle) {
                debug!(topic = %handle.topic, error = %e, "unsubscribe on teardown failed");
            }
        }
        self.transport.disconnect();
        self.pending.clear();
        self.events_rx.close();
        info!(channel = %self.channel, "chat session deactivated");
    }

    fn start_epoch(&mut self) {
        self.spawn_connect();
        self.spawn_history();
    }

    fn spawn_connect(&mut self) {
        let transport = self.transport.clone();
        let endpoint = self.endpoint.clone();
        let tx = self.events_tx.clone();
        let cancel = self.cancel.clone();
        let in_flight = self.connect_in_flight.clone();
        let epoch = self.epoch;
        in_flight.store(true, Ordering::SeqCst);
        self.tasks.push(tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = transport.connect(&endpoint) => result,
            };
            in_flight.store(false, Ordering::SeqCst);
            let event = match result {
                Ok(()) => Event::Connected,
                Err(e) => Event::ConnectFailed(e),
            };
            let _ = tx.send(Envelope { epoch, event });
        }));
    }

    fn spawn_history(&mut self) {
        let history = self.history.clone();
        let channel = self.channel.clone();
        let tx = self.events_tx.clone();
        let cancel = self.cancel.clone();
        let epoch = self.epoch;
        self.tasks.push(tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = history.fetch_history(&channel) => result,
            };
            let _ = tx.send(Envelope {
                epoch,
                event: Event::History(result),
            });
        }));
    }

    fn spawn_state_watch(&mut self) {
        let mut states = self.transport.watch_state();
        let tx = self.events_tx.clone();
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                let state = *states.borrow_and_update();
                let envelope = Envelope {
                    epoch: 0,
                    event: Event::State(state),
                };
                if tx.send(envelope).is_err() {
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = states.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }));
    }

    fn handle(&mut self, envelope: Envelope) {
        let Envelope { epoch, event } = envelope;
        if let Event::State(state) = event {
            self.on_state(state);
            return;
        }
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "dropping stale completion");
            return;
        }
        match event {
            Event::Connected => self.on_connected(),
            Event::ConnectFailed(e) => {
                warn!(channel = %self.channel, error = %e, "connect failed");
                self.pending.push_back(SessionUpdate::ConnectFailed(e));
            }
            Event::Inbound(frame) => self.on_inbound(frame),
            Event::History(Ok(records)) => self.on_history(records),
            Event::History(Err(e)) => {
                warn!(channel = %self.channel, error = %e, "history unavailable");
                self.pending.push_back(SessionUpdate::HistoryFailed(e));
            }
            Event::State(_) => {}
        }
    }

    fn on_state(&mut self, state: ConnectionState) {
        if self.reported_state == Some(state) {
            return;
        }
        self.reported_state = Some(state);
        if state == ConnectionState::Closed {
            self.subscription = None;
        }
        self.pending
            .push_back(SessionUpdate::ConnectionChanged(state));
    }

    fn on_connected(&mut self) {
        let tx = self.events_tx.clone();
        let epoch = self.epoch;
        let handler: InboundHandler = Arc::new(move |frame| {
            let _ = tx.send(Envelope {
                epoch,
                event: Event::Inbound(frame),
            });
        });
        let topic = self.channel.topic();
        match self.transport.subscribe(&topic, handler) {
            Ok(handle) => {
                info!(channel = %self.channel, %topic, id = %handle.id, "listening");
                self.subscription = Some(handle);
            }
            Err(e) => {
                warn!(channel = %self.channel, %topic, error = %e, "subscribe failed");
                self.pending.push_back(SessionUpdate::ConnectFailed(e));
            }
        }
    }

    fn on_inbound(&mut self, frame: InboundFrame) {
        match Message::from_json(&self.channel, &frame.body) {
            Ok(message) => {
                let id = message.id.clone();
                if self.log.append(message) {
                    self.messages_changed(1);
                } else {
                    debug!(%id, "duplicate live message ignored");
                }
            }
            Err(e) => {
                warn!(channel = %self.channel, topic = %frame.topic, error = %e, "dropping live message");
                self.pending.push_back(SessionUpdate::MessageDropped(e));
            }
        }
    }

    fn on_history(&mut self, records: Vec<serde_json::Value>) {
        let mut accepted = Vec::with_capacity(records.len());
        for record in records {
            match Message::from_value(&self.channel, record) {
                Ok(message) => accepted.push(message),
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "dropping history record");
                    self.pending.push_back(SessionUpdate::MessageDropped(e));
                }
            }
        }
        let inserted = self.log.merge_batch(accepted);
        debug!(channel = %self.channel, inserted, total = self.log.len(), "history merged");
        if inserted > 0 {
            self.messages_changed(inserted);
        }
    }

    fn messages_changed(&mut self, inserted: usize) {
        let auto_advance = self.follow.on_messages_changed(&self.log);
        self.pending.push_back(SessionUpdate::MessagesChanged {
            inserted,
            auto_advance,
        });
    }
}

impl<T, H, C> Drop for ChatSession<T, H, C>
where
    T: Transport,
    H: HistoryFetcher,
    C: CredentialSource,
{
    fn drop(&mut self) {
        self.deactivate();
    }
}
