//! STOMP over WebSocket, built on tokio-tungstenite.
//!
//! One reader task dispatches inbound frames to subscription handlers in
//! arrival order; one writer task drains an unbounded queue so `publish`
//! never waits on the socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::stomp::{Command, Frame, split_frames};
use super::{ConnectionState, InboundFrame, InboundHandler, SubscriptionHandle, Transport};
use crate::error::{ChatError, ChatResult};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The live half of a connection attempt. `outbound` is set once the STOMP
/// handshake completes.
struct Link {
    generation: u64,
    cancel: CancellationToken,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
}

struct Subscription {
    id: String,
    handler: InboundHandler,
}

struct Inner {
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    /// Keyed by topic.
    subscriptions: Mutex<HashMap<String, Subscription>>,
    next_subscription: AtomicU64,
    generation: AtomicU64,
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(state = %next, "transport state changed");
        }
    }

    fn send_frame(&self, frame: Frame) -> ChatResult<()> {
        let link = self.link.lock();
        let outbound = link
            .as_ref()
            .and_then(|l| l.outbound.as_ref())
            .ok_or(ChatError::NotConnected)?;
        outbound.send(frame).map_err(|_| ChatError::NotConnected)
    }

    /// Route one inbound frame. Returns false when the server reported an
    /// unrecoverable error.
    fn dispatch(&self, frame: Frame, cancel: &CancellationToken) -> bool {
        match frame.command {
            Command::Message => {
                // Handlers run under the lock so `disconnect` cannot return
                // while a callback is still in flight.
                let subscriptions = self.subscriptions.lock();
                if cancel.is_cancelled() {
                    return true;
                }
                let by_id = frame
                    .get("subscription")
                    .and_then(|id| subscriptions.iter().find(|(_, s)| s.id == id));
                let by_topic = || {
                    frame
                        .get("destination")
                        .and_then(|dest| subscriptions.get_key_value(dest))
                };
                match by_id.or_else(by_topic) {
                    Some((topic, subscription)) => {
                        let inbound = InboundFrame {
                            topic: topic.clone(),
                            headers: frame.headers.clone(),
                            body: frame.body.clone(),
                        };
                        (subscription.handler)(inbound);
                    }
                    None => debug!(
                        destination = frame.get("destination").unwrap_or_default(),
                        "message for unknown subscription"
                    ),
                }
                true
            }
            Command::Error => {
                error!(
                    reason = frame.get("message").unwrap_or_default(),
                    body = %frame.body,
                    "server sent ERROR frame"
                );
                false
            }
            Command::Receipt => {
                debug!(receipt = frame.get("receipt-id").unwrap_or_default(), "receipt");
                true
            }
            other => {
                debug!(command = %other, "ignoring frame");
                true
            }
        }
    }

    /// Reader-side teardown. Ignored if a newer connection already replaced
    /// the one that failed.
    fn connection_lost(&self, generation: u64) {
        let lost = {
            let mut link = self.link.lock();
            if link.as_ref().map(|l| l.generation) != Some(generation) {
                return;
            }
            link.take()
        };
        if let Some(l) = lost {
            l.cancel.cancel();
        }
        // `subscribe` takes this lock before `link`; never hold both here.
        self.subscriptions.lock().clear();
        self.set_state(ConnectionState::Closed);
        warn!("transport connection lost");
    }
}

/// A STOMP 1.2 client connection over a WebSocket.
pub struct StompTransport {
    inner: Arc<Inner>,
    connect_timeout: Duration,
}

impl Default for StompTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl StompTransport {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                state,
                link: Mutex::new(None),
                subscriptions: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(0),
                generation: AtomicU64::new(0),
            }),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Transport for StompTransport {
    async fn connect(&self, endpoint: &str) -> ChatResult<()> {
        let cancel = CancellationToken::new();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut link = self.inner.link.lock();
            let current = *self.inner.state.borrow();
            if current.can_publish() {
                return Ok(());
            }
            if current.is_connecting() {
                return Err(ChatError::TransportUnavailable(
                    "connect already in progress".into(),
                ));
            }
            *link = Some(Link {
                generation,
                cancel: cancel.clone(),
                outbound: None,
            });
            self.inner.set_state(if current == ConnectionState::Closed {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });
        }

        info!(endpoint, "connecting");
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ChatError::SessionClosed),
            handshake = tokio::time::timeout(self.connect_timeout, handshake(endpoint)) => {
                handshake.unwrap_or_else(|_| {
                    Err(ChatError::TransportUnavailable("handshake timed out".into()))
                })
            }
        };

        let ws = match result {
            Ok(ws) => ws,
            Err(e) => {
                let mut link = self.inner.link.lock();
                if link.as_ref().map(|l| l.generation) == Some(generation) {
                    link.take();
                    self.inner.set_state(ConnectionState::Closed);
                }
                warn!(endpoint, error = %e, "connect failed");
                return Err(e);
            }
        };

        let mut link = self.inner.link.lock();
        let Some(current) = link.as_mut().filter(|l| l.generation == generation) else {
            // Torn down while the handshake was completing.
            return Err(ChatError::SessionClosed);
        };
        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        current.outbound = Some(tx);
        tokio::spawn(write_loop(sink, rx, cancel.clone()));
        tokio::spawn(read_loop(stream, self.inner.clone(), cancel, generation));
        self.inner.set_state(ConnectionState::Connected);
        info!(endpoint, "connected");
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: InboundHandler) -> ChatResult<SubscriptionHandle> {
        if !self.state().can_publish() {
            return Err(ChatError::NotConnected);
        }
        let mut subscriptions = self.inner.subscriptions.lock();
        if let Some(existing) = subscriptions.get(topic) {
            debug!(topic, id = %existing.id, "already subscribed");
            return Ok(SubscriptionHandle {
                id: existing.id.clone(),
                topic: topic.to_string(),
            });
        }

        // Both locks stay held until the state is set: `connection_lost` and
        // `disconnect` take `link` first, so their `Closed` always lands after
        // this `Subscribed`, never before it.
        let link = self.inner.link.lock();
        let Some(outbound) = link.as_ref().and_then(|l| l.outbound.as_ref()) else {
            return Err(ChatError::NotConnected);
        };
        let id = format!(
            "sub-{}",
            self.inner.next_subscription.fetch_add(1, Ordering::Relaxed)
        );
        outbound
            .send(
                Frame::new(Command::Subscribe)
                    .header("id", id.as_str())
                    .header("destination", topic)
                    .header("ack", "auto"),
            )
            .map_err(|_| ChatError::NotConnected)?;
        subscriptions.insert(
            topic.to_string(),
            Subscription {
                id: id.clone(),
                handler,
            },
        );
        self.inner.set_state(ConnectionState::Subscribed);
        drop(link);
        drop(subscriptions);

        info!(topic, id = %id, "subscribed");
        Ok(SubscriptionHandle {
            id,
            topic: topic.to_string(),
        })
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> ChatResult<()> {
        let removed = {
            let mut subscriptions = self.inner.subscriptions.lock();
            match subscriptions.get(&handle.topic) {
                Some(s) if s.id == handle.id => subscriptions.remove(&handle.topic).is_some(),
                _ => false,
            }
        };
        if removed && self.state().can_publish() {
            self.inner
                .send_frame(Frame::new(Command::Unsubscribe).header("id", handle.id.as_str()))?;
        }
        Ok(())
    }

    fn publish(&self, topic: &str, headers: &[(String, String)], body: &str) -> ChatResult<()> {
        if !self.state().can_publish() {
            return Err(ChatError::NotConnected);
        }
        let mut frame = Frame::new(Command::Send)
            .header("destination", topic)
            .header("content-type", "application/json");
        frame.headers.extend(headers.iter().cloned());
        self.inner.send_frame(frame.body(body))?;
        debug!(topic, bytes = body.len(), "published");
        Ok(())
    }

    fn disconnect(&self) {
        let link = self.inner.link.lock().take();
        if let Some(link) = link {
            if let Some(outbound) = &link.outbound {
                let _ = outbound.send(Frame::new(Command::Disconnect));
            }
            link.cancel.cancel();
            info!("disconnected");
        }
        self.inner.subscriptions.lock().clear();
        self.inner.set_state(ConnectionState::Closed);
    }

    fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }
}

impl Drop for StompTransport {
    fn drop(&mut self) {
        if self.inner.link.lock().is_some() {
            self.disconnect();
        }
    }
}

async fn handshake(endpoint: &str) -> ChatResult<WsStream> {
    let (mut ws, _) = tokio_tungstenite::connect_async(endpoint)
        .await
        .map_err(ChatError::from_tungstenite)?;

    let host = endpoint
        .parse::<tungstenite::http::Uri>()
        .ok()
        .and_then(|uri| uri.host().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string());
    let connect = Frame::new(Command::Connect)
        .header("accept-version", "1.2")
        .header("host", host)
        .header("heart-beat", "0,0");
    ws.send(WsMessage::Text(connect.encode().into()))
        .await
        .map_err(|e| ChatError::TransportUnavailable(e.to_string()))?;

    while let Some(msg) = ws.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                for raw in split_frames(text.as_str()) {
                    match Frame::decode(raw)? {
                        Some(frame) if frame.command == Command::Connected => {
                            debug!(
                                version = frame.get("version").unwrap_or("1.0"),
                                "stomp session established"
                            );
                            return Ok(ws);
                        }
                        Some(frame) if frame.command == Command::Error => {
                            return Err(ChatError::TransportUnavailable(format!(
                                "server rejected connect: {}",
                                frame.get("message").unwrap_or(frame.body.as_str())
                            )));
                        }
                        Some(frame) => debug!(command = %frame.command, "frame before CONNECTED"),
                        None => {}
                    }
                }
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => return Err(ChatError::TransportUnavailable(e.to_string())),
        }
    }
    Err(ChatError::TransportUnavailable(
        "socket closed during handshake".into(),
    ))
}

async fn write_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            // Frames queued before cancellation (DISCONNECT in particular) still go out.
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let last = frame.command == Command::Disconnect;
                if let Err(e) = sink.send(WsMessage::Text(frame.encode().into())).await {
                    warn!(error = %e, "websocket write failed");
                    break;
                }
                if last {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    inner: Arc<Inner>,
    cancel: CancellationToken,
    generation: u64,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(WsMessage::Text(text))) => {
                for raw in split_frames(text.as_str()) {
                    match Frame::decode(raw) {
                        Ok(Some(frame)) => {
                            if !inner.dispatch(frame, &cancel) {
                                inner.connection_lost(generation);
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "dropping undecodable frame"),
                    }
                }
            }
            Some(Ok(WsMessage::Close(reason))) => {
                info!(?reason, "server closed websocket");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(error = %e, "websocket read failed");
                break;
            }
            None => break,
        }
    }
    inner.connection_lost(generation);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A transport whose link is an in-memory queue instead of a socket.
    fn linked() -> (StompTransport, mpsc::UnboundedReceiver<Frame>) {
        let transport = StompTransport::new();
        let (tx, rx) = mpsc::unbounded_channel();
        *transport.inner.link.lock() = Some(Link {
            generation: 1,
            cancel: CancellationToken::new(),
            outbound: Some(tx),
        });
        transport.inner.set_state(ConnectionState::Connected);
        (transport, rx)
    }

    fn noop() -> InboundHandler {
        Arc::new(|_| {})
    }

    #[test]
    fn subscribe_after_link_is_gone_leaves_state_alone() {
        let (transport, _rx) = linked();
        // Link taken, `Closed` not yet published.
        transport.inner.link.lock().take();

        let err = transport.subscribe("/sub/general-live-chat", noop()).unwrap_err();
        assert_eq!(err, ChatError::NotConnected);
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert!(transport.inner.subscriptions.lock().is_empty());
    }

    #[test]
    fn connection_lost_after_subscribe_ends_closed() {
        let (transport, mut rx) = linked();
        let handle = transport.subscribe("/sub/general-live-chat", noop()).unwrap();
        assert_eq!(transport.state(), ConnectionState::Subscribed);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.command, Command::Subscribe);
        assert_eq!(frame.get("id"), Some(handle.id.as_str()));

        transport.inner.connection_lost(1);
        assert_eq!(transport.state(), ConnectionState::Closed);
        assert!(transport.inner.subscriptions.lock().is_empty());
        assert_eq!(
            transport.subscribe("/sub/general-live-chat", noop()),
            Err(ChatError::NotConnected)
        );
    }

    #[test]
    fn stale_generation_does_not_tear_down_current_link() {
        let (transport, _rx) = linked();
        transport.subscribe("/sub/general-live-chat", noop()).unwrap();
        transport.inner.connection_lost(0);
        assert_eq!(transport.state(), ConnectionState::Subscribed);
        assert_eq!(transport.inner.subscriptions.lock().len(), 1);
    }

    #[test]
    fn unsubscribe_sends_frame_once() {
        let (transport, mut rx) = linked();
        let handle = transport.subscribe("/sub/general-live-chat", noop()).unwrap();
        rx.try_recv().unwrap();

        transport.unsubscribe(&handle).unwrap();
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.command, Command::Unsubscribe);
        assert_eq!(frame.get("id"), Some(handle.id.as_str()));

        transport.unsubscribe(&handle).unwrap();
        assert!(rx.try_recv().is_err());
        assert!(transport.inner.subscriptions.lock().is_empty());
    }
}
