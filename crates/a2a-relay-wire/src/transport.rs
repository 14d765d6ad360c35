//! Transport orchestrator: correlated request/response over relay links.
//!
//! A [`RelayTransport`] owns the agent keypair and one [`RelayLink`] per
//! relay. All links feed one channel drained by a single dispatcher task,
//! which also owns the [`PendingTable`] and the duplicate-event filter.
//! `send()` reaches the dispatcher through a command channel that is always
//! polled before link events, so a request is registered before its response
//! can possibly be processed.
//!
//! Inbound events pass through, in order: signature/id verification,
//! de-duplication, own-event filtering, envelope opening, payload parsing.
//! Anything failing a step is logged and dropped; it never reaches the
//! application handler.

use crate::envelope::Envelope;
use crate::event::{event_tag, recipient_tag, WireEvent};
use crate::identity::{Keypair, PublicKey};
use crate::pending::{PendingTable, ResultSink};
use crate::protocol::Filter;
use crate::relay::{LinkConfig, LinkEvent, RelayLink};
use a2a_relay_types::error::{TransportError, TransportResult};
use a2a_relay_types::message::{RpcError, MESSAGE_SEND};
use a2a_relay_types::{AgentMessage, RelayPayload, TransportConfig};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Subscription id used for the inbox on every relay.
pub const INBOX_SUBSCRIPTION: &str = "a2a-inbox";

/// Capacity of the shared link event channel.
const LINK_EVENT_BUFFER: usize = 1024;

/// How many event ids are remembered for de-duplication.
const SEEN_EVENTS_CAPACITY: usize = 10_000;

/// Reply sent when the handler fails or none is registered.
pub const FALLBACK_REPLY: &str = "Message received, but the agent could not produce a reply.";

/// JSON-RPC error codes carried in fallback responses.
pub mod error_codes {
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const HANDLER_ERROR: i32 = -32000;
}

/// Application callback invoked for every inbound request.
///
/// Returning `Err` (or panicking) makes the transport answer with a fallback
/// acknowledgement instead.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(
        &self,
        sender: &str,
        message: AgentMessage,
    ) -> Result<AgentMessage, String>;
}

enum DispatchCommand {
    Register {
        id: String,
        timeout: Duration,
        sink: ResultSink,
    },
    Cancel {
        id: String,
    },
    PendingCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// State shared between the transport handle, the dispatcher, and request
/// handler tasks.
struct Shared {
    keypair: Arc<Keypair>,
    identity: String,
    config: TransportConfig,
    links: RwLock<Vec<Arc<RelayLink>>>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
}

impl Shared {
    fn connected_links(&self) -> Vec<Arc<RelayLink>> {
        self.links
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|l| l.is_connected())
            .cloned()
            .collect()
    }

    fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Encrypt `payload` for `recipient` and wrap it in a signed event.
    fn seal(
        &self,
        recipient: &PublicKey,
        payload: &RelayPayload,
        tags: Vec<Vec<String>>,
    ) -> TransportResult<WireEvent> {
        let plaintext = payload.to_json()?;
        let envelope = Envelope::seal(plaintext.as_bytes(), &self.keypair, recipient)?;
        Ok(WireEvent::sign(
            &self.keypair,
            self.config.event_kind,
            tags,
            envelope.to_json(),
        ))
    }
}

/// Encrypted request/response messaging over a set of relays.
pub struct RelayTransport {
    shared: Arc<Shared>,
    commands: Mutex<Option<mpsc::UnboundedSender<DispatchCommand>>>,
    link_events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
}

impl RelayTransport {
    pub fn new(keypair: Keypair, config: TransportConfig) -> Self {
        let identity = keypair.identity();
        Self {
            shared: Arc::new(Shared {
                keypair: Arc::new(keypair),
                identity,
                config,
                links: RwLock::new(Vec::new()),
                handler: RwLock::new(None),
            }),
            commands: Mutex::new(None),
            link_events: Mutex::new(None),
        }
    }

    /// Build a transport using the keypair at `config.keypair_path`,
    /// generating one if absent.
    pub fn from_config(config: TransportConfig) -> TransportResult<Self> {
        let keypair = Keypair::load_or_generate(&config.keypair_path)?;
        Ok(Self::new(keypair, config))
    }

    /// This agent's identity (hex public key).
    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    pub fn keypair(&self) -> &Keypair {
        &self.shared.keypair
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Register the handler for inbound requests, replacing any previous one.
    pub fn on_message(&self, handler: Arc<dyn MessageHandler>) {
        *self
            .shared
            .handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Open a link to each relay and subscribe to this agent's inbox.
    ///
    /// Invalid URLs are skipped with a warning. Succeeds if at least one link
    /// connects; links that did not connect keep retrying in the background.
    pub async fn connect(&self, relay_urls: &[String]) -> TransportResult<()> {
        let events_tx = self.ensure_dispatcher();
        let config = &self.shared.config;
        let window = i64::try_from(config.since_window_secs).unwrap_or(i64::MAX);
        let since = Utc::now().timestamp().saturating_sub(window);
        let filter = Filter::new()
            .kind(config.event_kind)
            .recipient(self.shared.identity.clone())
            .since(since);

        let mut new_links = Vec::new();
        for url in relay_urls {
            match RelayLink::spawn(LinkConfig::from_transport(url, config), events_tx.clone()) {
                Ok(link) => {
                    link.subscribe(INBOX_SUBSCRIPTION, filter.clone());
                    new_links.push(Arc::new(link));
                }
                Err(e) => warn!(relay = %url, error = %e, "Skipping relay"),
            }
        }

        let wait = config.connect_timeout().saturating_add(Duration::from_secs(1));
        let outcomes = join_all(new_links.iter().map(|l| l.wait_connected(wait))).await;
        let connected = outcomes.iter().filter(|o| o.is_ok()).count();

        if connected == 0 {
            warn!(relays = relay_urls.len(), "Could not connect to any relay");
            join_all(new_links.iter().map(|l| l.close())).await;
            return Err(TransportError::NoRelaysAvailable(relay_urls.len()));
        }

        for (link, outcome) in new_links.iter().zip(&outcomes) {
            if let Err(e) = outcome {
                warn!(relay = %link.url(), error = %e, "Relay unavailable, retrying in background");
            }
        }
        info!(
            identity = %self.shared.identity,
            connected,
            total = new_links.len(),
            "Relay transport connected"
        );

        self.shared
            .links
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend(new_links);
        Ok(())
    }

    /// Send `message` to `recipient` and wait for the correlated response.
    ///
    /// `timeout` defaults to the configured request timeout.
    pub async fn send(
        &self,
        recipient: &str,
        message: AgentMessage,
        timeout: Option<Duration>,
    ) -> TransportResult<AgentMessage> {
        let recipient_key = PublicKey::from_hex(recipient)
            .map_err(|e| TransportError::InvalidRecipient(format!("{recipient}: {e}")))?;
        if recipient_key.to_hex() == self.shared.identity {
            return Err(TransportError::InvalidRecipient(format!(
                "{recipient}: cannot send to own identity"
            )));
        }

        let links = self.shared.connected_links();
        if links.is_empty() {
            return Err(TransportError::NoConnectedRelays);
        }
        let commands = self
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(TransportError::NoConnectedRelays)?;

        let timeout = timeout.unwrap_or_else(|| self.shared.config.request_timeout());
        let payload = RelayPayload::request(message);
        let id = payload.id().to_string();
        let event = self.shared.seal(
            &recipient_key,
            &payload,
            vec![recipient_tag(&recipient_key.to_hex())],
        )?;

        let (sink, mut result_rx) = oneshot::channel();
        commands
            .send(DispatchCommand::Register {
                id: id.clone(),
                timeout,
                sink,
            })
            .map_err(|_| TransportError::TransportClosed)?;

        debug!(
            correlation_id = %id,
            event_id = %event.id,
            recipient = %recipient_key,
            relays = links.len(),
            "Sending request"
        );

        let publishes = join_all(links.iter().map(|link| link.publish(&event)));
        tokio::select! {
            result = &mut result_rx => {
                return result.unwrap_or(Err(TransportError::TransportClosed));
            }
            results = publishes => {
                if results.iter().all(Result::is_err) {
                    let reasons = links
                        .iter()
                        .zip(&results)
                        .filter_map(|(l, r)| r.as_ref().err().map(|e| format!("{}: {e}", l.url())))
                        .collect::<Vec<_>>()
                        .join("; ");
                    warn!(correlation_id = %id, reasons = %reasons, "Request not accepted by any relay");
                    let _ = commands.send(DispatchCommand::Cancel { id });
                    return Err(TransportError::PublishFailed(reasons));
                }
            }
        }

        result_rx
            .await
            .unwrap_or(Err(TransportError::TransportClosed))
    }

    /// Send a single text message and return the reply's text, using the
    /// configured request timeout.
    pub async fn send_text(&self, recipient: &str, text: &str) -> TransportResult<String> {
        let reply = self
            .send(recipient, AgentMessage::user_text(text), None)
            .await?;
        Ok(reply.text())
    }

    /// URLs of links that are currently connected.
    pub fn connected_relays(&self) -> Vec<String> {
        self.shared
            .connected_links()
            .iter()
            .map(|l| l.url().to_string())
            .collect()
    }

    /// Number of requests awaiting a response.
    pub async fn pending_count(&self) -> usize {
        let commands = self
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(commands) = commands else {
            return 0;
        };
        let (reply, rx) = oneshot::channel();
        if commands.send(DispatchCommand::PendingCount { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Fail every outstanding request with `TransportClosed` and close every
    /// relay link. The transport can be connected again afterwards.
    pub async fn disconnect(&self) {
        let commands = self.commands.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(commands) = commands {
            let (done, done_rx) = oneshot::channel();
            if commands.send(DispatchCommand::Shutdown { done }).is_ok() {
                let _ = done_rx.await;
            }
        }
        self.link_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let links: Vec<_> = self
            .shared
            .links
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        join_all(links.iter().map(|l| l.close())).await;
        info!(identity = %self.shared.identity, "Relay transport disconnected");
    }

    /// Start the dispatcher if it is not running; returns the link event
    /// sender feeding it.
    fn ensure_dispatcher(&self) -> mpsc::Sender<LinkEvent> {
        let mut link_events = self.link_events.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = link_events.as_ref() {
            return tx.clone();
        }

        let (events_tx, events_rx) = mpsc::channel(LINK_EVENT_BUFFER);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            shared: Arc::clone(&self.shared),
            commands: cmd_rx,
            events: events_rx,
            pending: PendingTable::new(),
            seen: SeenEvents::new(SEEN_EVENTS_CAPACITY),
        };
        tokio::spawn(dispatcher.run());

        *self.commands.lock().unwrap_or_else(|e| e.into_inner()) = Some(cmd_tx);
        *link_events = Some(events_tx.clone());
        events_tx
    }
}

/// Bounded set of recently seen event ids; the oldest are forgotten first.
struct SeenEvents {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenEvents {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `false` if `id` was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

struct Dispatcher {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<DispatchCommand>,
    events: mpsc::Receiver<LinkEvent>,
    pending: PendingTable,
    seen: SeenEvents,
}

impl Dispatcher {
    async fn run(mut self) {
        let mut events_open = true;

        loop {
            let deadline = self.pending.next_deadline();

            tokio::select! {
                biased;

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(DispatchCommand::Register { id, timeout, sink }) => {
                            self.pending.register(id, Instant::now(), timeout, sink);
                        }
                        Some(DispatchCommand::Cancel { id }) => {
                            self.pending.cancel(&id);
                        }
                        Some(DispatchCommand::PendingCount { reply }) => {
                            let _ = reply.send(self.pending.len());
                        }
                        Some(DispatchCommand::Shutdown { done }) => {
                            self.shutdown();
                            let _ = done.send(());
                            return;
                        }
                        None => {
                            self.shutdown();
                            return;
                        }
                    }
                }
                event = self.events.recv(), if events_open => {
                    match event {
                        Some(event) => self.on_link_event(event),
                        None => events_open = false,
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let expired = self.pending.expire(Instant::now());
                    if expired > 0 {
                        debug!(expired, "Expired pending requests");
                    }
                }
            }
        }
    }

    fn shutdown(&mut self) {
        let drained = self.pending.drain();
        debug!(drained, "Dispatcher stopped");
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { relay } => debug!(relay = %relay, "Link connected"),
            LinkEvent::Disconnected { relay } => debug!(relay = %relay, "Link disconnected"),
            LinkEvent::Error { relay, error } => {
                trace!(relay = %relay, error = %error, "Link error")
            }
            LinkEvent::Event { relay, event, .. } => self.on_event(&relay, event),
        }
    }

    fn on_event(&mut self, relay: &str, event: WireEvent) {
        let shared = &self.shared;

        if event.kind != shared.config.event_kind {
            trace!(relay = %relay, event_id = %event.id, kind = event.kind, "Ignoring event of other kind");
            return;
        }
        if !event.verify() {
            warn!(relay = %relay, event_id = %event.id, "Dropping event with invalid id or signature");
            return;
        }
        if !self.seen.insert(&event.id) {
            trace!(relay = %relay, event_id = %event.id, "Duplicate event");
            return;
        }
        if event.pubkey == shared.identity {
            trace!(event_id = %event.id, "Ignoring own event");
            return;
        }
        if event.recipient() != Some(shared.identity.as_str()) {
            debug!(relay = %relay, event_id = %event.id, "Event not addressed to us");
            return;
        }

        let envelope = match Envelope::from_json(&event.content) {
            Ok(env) => env,
            Err(e) => {
                warn!(relay = %relay, event_id = %event.id, error = %e, "Dropping malformed envelope");
                return;
            }
        };
        if envelope.sender_pub_key.to_hex() != event.pubkey {
            warn!(relay = %relay, event_id = %event.id, "Envelope sender does not match event author");
            return;
        }
        let plaintext = match envelope.open(&shared.keypair) {
            Ok(p) => p,
            Err(e) => {
                warn!(relay = %relay, event_id = %event.id, error = %e, "Dropping undecryptable envelope");
                return;
            }
        };
        let payload = match RelayPayload::from_json(&plaintext) {
            Ok(p) => p,
            Err(e) => {
                warn!(relay = %relay, event_id = %event.id, error = %e, "Dropping unparseable payload");
                return;
            }
        };

        match payload {
            RelayPayload::Response { id, message, error } => {
                if let Some(error) = &error {
                    debug!(correlation_id = %id, code = error.code, error = %error.message, "Remote handler reported an error");
                }
                if !self.pending.resolve(&id, message) {
                    debug!(correlation_id = %id, event_id = %event.id, "Dropping late or duplicate response");
                }
            }
            RelayPayload::Request {
                id,
                method,
                message,
            } => {
                debug!(correlation_id = %id, event_id = %event.id, sender = %envelope.sender_pub_key, "Inbound request");
                tokio::spawn(handle_request(
                    Arc::clone(shared),
                    envelope.sender_pub_key,
                    event.id,
                    id,
                    method,
                    message,
                ));
            }
        }
    }
}

/// Run the handler for one request and publish the reply.
async fn handle_request(
    shared: Arc<Shared>,
    sender: PublicKey,
    request_event_id: String,
    id: String,
    method: String,
    message: AgentMessage,
) {
    let sender_hex = sender.to_hex();

    let (reply, error) = if method != MESSAGE_SEND {
        warn!(correlation_id = %id, method = %method, "Unsupported method");
        fallback(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    } else {
        match shared.handler() {
            None => {
                warn!(correlation_id = %id, "No message handler registered");
                fallback(
                    error_codes::METHOD_NOT_FOUND,
                    "No message handler registered".to_string(),
                )
            }
            Some(handler) => {
                let from = sender_hex.clone();
                let joined =
                    tokio::spawn(async move { handler.handle_message(&from, message).await })
                        .await;
                match joined {
                    Ok(Ok(reply)) => (reply, None),
                    Ok(Err(e)) => {
                        warn!(correlation_id = %id, error = %e, "Message handler failed");
                        fallback(error_codes::HANDLER_ERROR, e)
                    }
                    Err(e) => {
                        warn!(correlation_id = %id, error = %e, "Message handler panicked");
                        fallback(
                            error_codes::INTERNAL_ERROR,
                            "Message handler panicked".to_string(),
                        )
                    }
                }
            }
        }
    };

    let payload = RelayPayload::Response {
        id: id.clone(),
        message: reply,
        error,
    };
    let event = match shared.seal(
        &sender,
        &payload,
        vec![recipient_tag(&sender_hex), event_tag(&request_event_id)],
    ) {
        Ok(event) => event,
        Err(e) => {
            warn!(correlation_id = %id, error = %e, "Failed to seal response");
            return;
        }
    };

    let links = shared.connected_links();
    if links.is_empty() {
        warn!(correlation_id = %id, "No connected relays, response dropped");
        return;
    }
    let results = join_all(links.iter().map(|l| l.publish(&event))).await;
    let accepted = results.iter().filter(|r| r.is_ok()).count();
    if accepted == 0 {
        warn!(correlation_id = %id, "Response not accepted by any relay");
    } else {
        debug!(correlation_id = %id, event_id = %event.id, accepted, "Response published");
    }
}

fn fallback(code: i32, message: String) -> (AgentMessage, Option<RpcError>) {
    (
        AgentMessage::agent_text(FALLBACK_REPLY),
        Some(RpcError { code, message }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seen_events_bounded() {
        let mut seen = SeenEvents::new(3);
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(seen.insert("c"));
        assert!(seen.insert("d"));
        // "a" was evicted, the rest are remembered.
        assert!(seen.insert("a"));
        assert!(!seen.insert("c"));
        assert!(!seen.insert("d"));
        assert_eq!(seen.ids.len(), 3);
    }

    #[tokio::test]
    async fn test_send_without_relays() {
        let transport = RelayTransport::new(Keypair::generate(), TransportConfig::default());
        let recipient = Keypair::generate().identity();
        let err = transport
            .send(&recipient, AgentMessage::user_text("ping"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NoConnectedRelays));
        assert_eq!(transport.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_invalid_recipient() {
        let transport = RelayTransport::new(Keypair::generate(), TransportConfig::default());
        let short = "ab".repeat(16);
        for bad in ["", "xyz", short.as_str()] {
            let err = transport
                .send(bad, AgentMessage::user_text("ping"), None)
                .await
                .unwrap_err();
            assert!(matches!(err, TransportError::InvalidRecipient(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_connect_with_only_invalid_urls() {
        let transport = RelayTransport::new(Keypair::generate(), TransportConfig::default());
        let err = transport
            .connect(&["http://not-a-relay".to_string(), "garbage".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NoRelaysAvailable(2)));
        assert!(transport.connected_relays().is_empty());
        transport.disconnect().await;
    }

    #[test]
    fn test_fallback_reply() {
        let (message, error) = fallback(error_codes::HANDLER_ERROR, "boom".into());
        assert_eq!(message.text(), FALLBACK_REPLY);
        assert_eq!(
            error,
            Some(RpcError {
                code: -32000,
                message: "boom".into()
            })
        );
    }
}
