//! Relay link: one WebSocket connection to one relay.
//!
//! Each link runs as its own tokio task that exclusively owns the socket.
//! The [`RelayLink`] handle talks to it over a command channel and observes
//! its [`LinkState`] through a watch channel. Everything the relay sends is
//! reported as a [`LinkEvent`] on a channel supplied by the owner, shared by
//! all links.
//!
//! Subscriptions are kept by the task and replayed verbatim after every
//! reconnect. Publishes are never queued: while the link is down they fail
//! immediately with [`RelayError::NotConnected`].

use crate::event::WireEvent;
use crate::protocol::{ClientMessage, Filter, RelayMessage};
use a2a_relay_types::error::{RelayError, RelayResult};
use a2a_relay_types::TransportConfig;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// How often abandoned publish waiters are swept.
const PUBLISH_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Connection settings for a single relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    pub reconnect_delay: Duration,
    pub auto_reconnect: bool,
}

impl LinkConfig {
    /// Settings for `url` with the default timeouts.
    pub fn new(url: impl Into<String>) -> Self {
        Self::from_transport(url, &TransportConfig::default())
    }

    /// Settings for `url` taken from the transport configuration.
    pub fn from_transport(url: impl Into<String>, config: &TransportConfig) -> Self {
        Self {
            url: url.into(),
            connect_timeout: config.connect_timeout(),
            publish_timeout: config.publish_timeout(),
            reconnect_delay: config.reconnect_delay(),
            auto_reconnect: config.auto_reconnect,
        }
    }
}

/// Connection state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Shut down by [`RelayLink::close`]; terminal.
    Closed,
}

/// Something that happened on a link, tagged with the relay URL.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected {
        relay: String,
    },
    Disconnected {
        relay: String,
    },
    Event {
        relay: String,
        sub_id: String,
        event: WireEvent,
    },
    Error {
        relay: String,
        error: RelayError,
    },
}

impl LinkEvent {
    pub fn relay(&self) -> &str {
        match self {
            Self::Connected { relay }
            | Self::Disconnected { relay }
            | Self::Event { relay, .. }
            | Self::Error { relay, .. } => relay,
        }
    }
}

enum Command {
    Subscribe {
        id: String,
        filter: Filter,
    },
    Unsubscribe {
        id: String,
    },
    Publish {
        event: WireEvent,
        reply: oneshot::Sender<RelayResult<()>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a running relay link task.
///
/// Dropping the handle shuts the link down as if [`RelayLink::close`] had
/// been called.
pub struct RelayLink {
    config: LinkConfig,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LinkState>,
    outcome: watch::Receiver<Option<RelayResult<()>>>,
}

impl RelayLink {
    /// Validate the URL and start the link task. The task begins connecting
    /// immediately and reports through `events`.
    pub fn spawn(config: LinkConfig, events: mpsc::Sender<LinkEvent>) -> RelayResult<Self> {
        validate_url(&config.url)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let task = LinkTask {
            config: config.clone(),
            commands: cmd_rx,
            events,
            state: state_tx,
            outcome: outcome_tx,
            subscriptions: BTreeMap::new(),
            in_flight: HashMap::new(),
            close_ack: None,
            closing: false,
        };
        tokio::spawn(task.run());

        Ok(Self {
            config,
            commands: cmd_tx,
            state: state_rx,
            outcome: outcome_rx,
        })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Register a subscription, replacing any with the same id. Sent now if
    /// connected and replayed after every reconnect.
    pub fn subscribe(&self, id: impl Into<String>, filter: Filter) {
        let _ = self.commands.send(Command::Subscribe {
            id: id.into(),
            filter,
        });
    }

    /// Drop a subscription, sending `CLOSE` if connected.
    pub fn unsubscribe(&self, id: impl Into<String>) {
        let _ = self.commands.send(Command::Unsubscribe { id: id.into() });
    }

    /// Publish an event and wait for the relay's `OK`.
    pub async fn publish(&self, event: &WireEvent) -> RelayResult<()> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected(self.config.url.clone()));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Publish {
                event: event.clone(),
                reply: reply_tx,
            })
            .map_err(|_| RelayError::Closed)?;

        match tokio::time::timeout(self.config.publish_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::ConnectionLost),
            Err(_) => {
                debug!(relay = %self.config.url, event_id = %event.id, "Publish timed out");
                Err(RelayError::Timeout(self.config.publish_timeout))
            }
        }
    }

    /// Wait for the outcome of the link's connection attempt, or the most
    /// recent one if several have happened.
    pub async fn wait_connected(&self, timeout: Duration) -> RelayResult<()> {
        let mut outcome = self.outcome.clone();
        let waited = tokio::time::timeout(timeout, async {
            match outcome.wait_for(Option::is_some).await {
                Ok(result) => result.clone().unwrap_or(Err(RelayError::Closed)),
                Err(_) => Err(RelayError::Closed),
            }
        })
        .await;
        waited.unwrap_or_else(|_| {
            Err(RelayError::Connect(format!(
                "no connection within {timeout:?}"
            )))
        })
    }

    /// Send `CLOSE` for every subscription, close the socket, and stop
    /// reconnecting. Resolves once the task has finished.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Close { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Accept only `ws://` and `wss://` URLs with a host.
pub fn validate_url(raw: &str) -> RelayResult<url::Url> {
    let parsed = url::Url::parse(raw).map_err(|e| RelayError::InvalidUrl(format!("{raw}: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" if parsed.host_str().is_some() => Ok(parsed),
        _ => Err(RelayError::InvalidUrl(format!(
            "{raw}: expected ws:// or wss://"
        ))),
    }
}

enum Attempt {
    Open(Box<WsStream>),
    Failed(RelayError),
    Shutdown,
}

enum SessionEnd {
    Lost,
    Shutdown,
}

struct LinkTask {
    config: LinkConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<LinkEvent>,
    state: watch::Sender<LinkState>,
    outcome: watch::Sender<Option<RelayResult<()>>>,
    subscriptions: BTreeMap<String, Filter>,
    /// Publish waiters by event id. Only populated while connected.
    in_flight: HashMap<String, Vec<oneshot::Sender<RelayResult<()>>>>,
    close_ack: Option<oneshot::Sender<()>>,
    closing: bool,
}

impl LinkTask {
    async fn run(mut self) {
        let url = self.config.url.clone();

        loop {
            self.state.send_replace(LinkState::Connecting);
            debug!(relay = %url, "Connecting to relay");

            let ws = match self.connect().await {
                Attempt::Open(ws) => ws,
                Attempt::Shutdown => break,
                Attempt::Failed(error) => {
                    warn!(relay = %url, error = %error, "Relay connection failed");
                    self.outcome.send_replace(Some(Err(error.clone())));
                    self.state.send_replace(LinkState::Disconnected);
                    self.emit(LinkEvent::Error {
                        relay: url.clone(),
                        error,
                    })
                    .await;
                    if !self.config.auto_reconnect || self.idle().await.is_break() {
                        break;
                    }
                    continue;
                }
            };

            info!(relay = %url, "Connected to relay");
            self.outcome.send_replace(Some(Ok(())));
            self.state.send_replace(LinkState::Connected);

            let end = self.session(*ws).await;
            self.fail_in_flight();

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost => {
                    self.state.send_replace(LinkState::Disconnected);
                    self.emit(LinkEvent::Disconnected { relay: url.clone() })
                        .await;
                    if !self.config.auto_reconnect {
                        info!(relay = %url, "Relay connection lost, auto-reconnect disabled");
                        break;
                    }
                    warn!(
                        relay = %url,
                        delay_ms = self.config.reconnect_delay.as_millis(),
                        "Relay connection lost, reconnecting"
                    );
                    if self.idle().await.is_break() {
                        break;
                    }
                }
            }
        }

        if self.closing {
            self.state.send_replace(LinkState::Closed);
        } else {
            self.state.send_replace(LinkState::Disconnected);
        }
        if let Some(done) = self.close_ack.take() {
            let _ = done.send(());
        }
        info!(relay = %url, "Relay link stopped");
    }

    /// One connection attempt, bounded by the connect timeout. Commands keep
    /// being served while it runs.
    async fn connect(&mut self) -> Attempt {
        let timeout = self.config.connect_timeout;
        let attempt = tokio::time::timeout(
            timeout,
            tokio_tungstenite::connect_async(self.config.url.clone()),
        );
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(Ok((ws, _response))) => Attempt::Open(Box::new(ws)),
                        Ok(Err(e)) => Attempt::Failed(RelayError::Connect(e.to_string())),
                        Err(_) => Attempt::Failed(RelayError::Connect(format!(
                            "timed out after {timeout:?}"
                        ))),
                    };
                }
                cmd = self.commands.recv() => {
                    if self.handle_offline(cmd).is_break() {
                        return Attempt::Shutdown;
                    }
                }
            }
        }
    }

    /// Wait out the reconnect delay while serving commands.
    async fn idle(&mut self) -> ControlFlow<()> {
        let sleep = tokio::time::sleep(self.config.reconnect_delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return ControlFlow::Continue(()),
                cmd = self.commands.recv() => {
                    if self.handle_offline(cmd).is_break() {
                        return ControlFlow::Break(());
                    }
                }
            }
        }
    }

    fn handle_offline(&mut self, cmd: Option<Command>) -> ControlFlow<()> {
        match cmd {
            None => {
                self.closing = true;
                ControlFlow::Break(())
            }
            Some(Command::Close { done }) => {
                self.closing = true;
                self.close_ack = Some(done);
                ControlFlow::Break(())
            }
            Some(Command::Subscribe { id, filter }) => {
                self.subscriptions.insert(id, filter);
                ControlFlow::Continue(())
            }
            Some(Command::Unsubscribe { id }) => {
                self.subscriptions.remove(&id);
                ControlFlow::Continue(())
            }
            Some(Command::Publish { reply, .. }) => {
                let _ = reply.send(Err(RelayError::NotConnected(self.config.url.clone())));
                ControlFlow::Continue(())
            }
        }
    }

    /// Replay subscriptions, signal `Connected`, then serve the socket until
    /// it drops or the link is closed.
    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let url = self.config.url.clone();
        let (mut write, mut read) = ws.split();

        for (id, filter) in &self.subscriptions {
            let req = ClientMessage::Req {
                sub_id: id.clone(),
                filter: filter.clone(),
            };
            if write.send(Message::Text(req.to_json())).await.is_err() {
                warn!(relay = %url, sub_id = %id, "Failed to send REQ");
                return SessionEnd::Lost;
            }
            debug!(relay = %url, sub_id = %id, "Subscription sent");
        }
        self.emit(LinkEvent::Connected { relay: url.clone() }).await;

        let mut sweep = tokio::time::interval(PUBLISH_SWEEP_INTERVAL);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        None => {
                            self.closing = true;
                            self.shutdown(&mut write).await;
                            return SessionEnd::Shutdown;
                        }
                        Some(Command::Close { done }) => {
                            self.closing = true;
                            self.close_ack = Some(done);
                            self.shutdown(&mut write).await;
                            return SessionEnd::Shutdown;
                        }
                        Some(Command::Subscribe { id, filter }) => {
                            let req = ClientMessage::Req { sub_id: id.clone(), filter: filter.clone() };
                            self.subscriptions.insert(id, filter);
                            if write.send(Message::Text(req.to_json())).await.is_err() {
                                return SessionEnd::Lost;
                            }
                        }
                        Some(Command::Unsubscribe { id }) => {
                            if self.subscriptions.remove(&id).is_some() {
                                let close = ClientMessage::Close { sub_id: id };
                                if write.send(Message::Text(close.to_json())).await.is_err() {
                                    return SessionEnd::Lost;
                                }
                            }
                        }
                        Some(Command::Publish { event, reply }) => {
                            let frame = ClientMessage::Event(event.clone()).to_json();
                            if write.send(Message::Text(frame)).await.is_err() {
                                let _ = reply.send(Err(RelayError::ConnectionLost));
                                return SessionEnd::Lost;
                            }
                            debug!(relay = %url, event_id = %event.id, "Event published");
                            self.in_flight.entry(event.id).or_default().push(reply);
                        }
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.dispatch(&text).await,
                        Some(Ok(Message::Close(frame))) => {
                            debug!(relay = %url, ?frame, "Relay closed the connection");
                            return SessionEnd::Lost;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(relay = %url, error = %e, "Relay read error");
                            return SessionEnd::Lost;
                        }
                        None => {
                            debug!(relay = %url, "Relay stream ended");
                            return SessionEnd::Lost;
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.in_flight.retain(|_, waiters| {
                        waiters.retain(|w| !w.is_closed());
                        !waiters.is_empty()
                    });
                }
            }
        }
    }

    async fn dispatch(&mut self, text: &str) {
        let url = &self.config.url;
        match RelayMessage::parse(text) {
            Some(RelayMessage::Event { sub_id, event }) => {
                if !self.subscriptions.contains_key(&sub_id) {
                    trace!(relay = %url, sub_id = %sub_id, "Event for unknown subscription");
                    return;
                }
                let relay = url.clone();
                self.emit(LinkEvent::Event {
                    relay,
                    sub_id,
                    event,
                })
                .await;
            }
            Some(RelayMessage::Ok {
                event_id,
                accepted,
                message,
            }) => {
                let Some(waiters) = self.in_flight.remove(&event_id) else {
                    trace!(relay = %url, event_id = %event_id, "OK for unknown event");
                    return;
                };
                if !accepted {
                    debug!(relay = %url, event_id = %event_id, reason = %message, "Relay rejected event");
                }
                for waiter in waiters {
                    let result = if accepted {
                        Ok(())
                    } else {
                        Err(RelayError::Rejected(message.clone()))
                    };
                    let _ = waiter.send(result);
                }
            }
            Some(RelayMessage::Eose { sub_id }) => {
                trace!(relay = %url, sub_id = %sub_id, "End of stored events");
            }
            Some(RelayMessage::Notice { message }) => {
                info!(relay = %url, notice = %message, "Relay notice");
            }
            None => {
                trace!(relay = %url, "Dropping unrecognised relay frame");
            }
        }
    }

    async fn shutdown(&mut self, write: &mut WsSink) {
        for id in self.subscriptions.keys() {
            let close = ClientMessage::Close { sub_id: id.clone() };
            if write.send(Message::Text(close.to_json())).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    }

    fn fail_in_flight(&mut self) {
        for (_, waiters) in self.in_flight.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(RelayError::ConnectionLost));
            }
        }
    }

    async fn emit(&self, event: LinkEvent) {
        if self.events.send(event).await.is_err() {
            trace!(relay = %self.config.url, "Link event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("wss://relay.damus.io").is_ok());
        assert!(validate_url("ws://127.0.0.1:7777/path").is_ok());
        for bad in ["https://relay.example", "relay.example", "", "ws://", "file:///tmp/x"] {
            assert!(
                matches!(validate_url(bad), Err(RelayError::InvalidUrl(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_link_config_from_transport() {
        let mut config = TransportConfig::default();
        config.publish_timeout_secs = 3;
        config.auto_reconnect = false;
        let link = LinkConfig::from_transport("wss://r.example", &config);
        assert_eq!(link.publish_timeout, Duration::from_secs(3));
        assert_eq!(link.reconnect_delay, Duration::from_secs(5));
        assert!(!link.auto_reconnect);
    }

    #[tokio::test]
    async fn test_spawn_rejects_invalid_url() {
        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(
            RelayLink::spawn(LinkConfig::new("http://nope"), tx),
            Err(RelayError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_relay_reports_failure() {
        // Bind then drop a listener so the port is very likely closed.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut config = LinkConfig::new(format!("ws://127.0.0.1:{port}"));
        config.auto_reconnect = false;
        config.connect_timeout = Duration::from_secs(2);

        let (tx, mut rx) = mpsc::channel(8);
        let link = RelayLink::spawn(config, tx).unwrap();

        let outcome = link.wait_connected(Duration::from_secs(5)).await;
        assert!(matches!(outcome, Err(RelayError::Connect(_))), "{outcome:?}");
        assert!(matches!(rx.recv().await, Some(LinkEvent::Error { .. })));

        let kp = crate::identity::Keypair::generate();
        let event = WireEvent::sign(&kp, 1, vec![], String::new());
        assert!(matches!(
            link.publish(&event).await,
            Err(RelayError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_close_before_connect() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut config = LinkConfig::new(format!("ws://127.0.0.1:{port}"));
        config.reconnect_delay = Duration::from_secs(60);
        let (tx, _rx) = mpsc::channel(8);
        let link = RelayLink::spawn(config, tx).unwrap();

        link.close().await;
        assert_eq!(link.state(), LinkState::Closed);
        // Closing again is a no-op.
        link.close().await;
    }
}
