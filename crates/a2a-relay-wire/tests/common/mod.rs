//! In-process relay for integration tests.
//!
//! Accepts WebSocket clients on `127.0.0.1:0`, stores every published event,
//! fans events out to matching subscriptions, and acknowledges publishes.
//! It performs no validation of its own, so client-side checks can be
//! exercised with forged events.

#![allow(dead_code)]

use a2a_relay_types::TransportConfig;
use a2a_relay_wire::event::WireEvent;
use a2a_relay_wire::protocol::{ClientMessage, Filter, RelayMessage};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

// ---------------------------------------------------------------------------
// Mock relay
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RelayState {
    events: Vec<WireEvent>,
    reqs: Vec<(String, Filter)>,
    closes: Vec<String>,
    clients: HashMap<u64, Client>,
    /// `Some(reason)` rejects every publish.
    reject: Option<String>,
    /// Never acknowledge publishes.
    silent: bool,
}

struct Client {
    subs: HashMap<String, Filter>,
    tx: mpsc::UnboundedSender<String>,
}

impl RelayState {
    fn store_and_fan_out(&mut self, event: WireEvent) {
        for client in self.clients.values() {
            for (sub_id, filter) in &client.subs {
                if filter.matches(&event) {
                    let frame = RelayMessage::Event {
                        sub_id: sub_id.clone(),
                        event: event.clone(),
                    };
                    let _ = client.tx.send(frame.to_json());
                }
            }
        }
        self.events.push(event);
    }
}

pub struct MockRelay {
    pub url: String,
    state: Arc<Mutex<RelayState>>,
    kill: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let state = Arc::new(Mutex::new(RelayState::default()));
        let (kill, _) = broadcast::channel(4);
        let next_id = Arc::new(AtomicU64::new(0));

        let accept_state = Arc::clone(&state);
        let accept_kill = kill.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(serve(
                    id,
                    stream,
                    Arc::clone(&accept_state),
                    accept_kill.subscribe(),
                ));
            }
        });

        Self {
            url,
            state,
            kill,
            accept_task,
        }
    }

    /// Abruptly drop every open connection. New connections are accepted.
    pub fn drop_connections(&self) {
        let _ = self.kill.send(());
    }

    /// Stop accepting connections and drop the open ones.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.drop_connections();
    }

    pub fn set_reject(&self, reason: Option<&str>) {
        self.state.lock().unwrap().reject = reason.map(str::to_string);
    }

    pub fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    /// Store an event and deliver it to subscribers as if it were published.
    pub fn inject(&self, event: WireEvent) {
        self.state.lock().unwrap().store_and_fan_out(event);
    }

    pub fn events(&self) -> Vec<WireEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn reqs(&self) -> Vec<(String, Filter)> {
        self.state.lock().unwrap().reqs.clone()
    }

    pub fn closes(&self) -> Vec<String> {
        self.state.lock().unwrap().closes.clone()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().unwrap().clients.len()
    }

    pub async fn wait_for_reqs(&self, count: usize) -> Vec<(String, Filter)> {
        wait_until(|| self.reqs().len() >= count).await;
        self.reqs()
    }

    pub async fn wait_for_events(&self, count: usize) -> Vec<WireEvent> {
        wait_until(|| self.events().len() >= count).await;
        self.events()
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve(
    id: u64,
    stream: TcpStream,
    state: Arc<Mutex<RelayState>>,
    mut kill: broadcast::Receiver<()>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.lock().unwrap().clients.insert(
        id,
        Client {
            subs: HashMap::new(),
            tx: tx.clone(),
        },
    );

    loop {
        tokio::select! {
            _ = kill.recv() => break,
            Some(out) = rx.recv() => {
                if write.send(Message::Text(out)).await.is_err() {
                    break;
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_frame(id, &text, &state, &tx),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.lock().unwrap().clients.remove(&id);
}

fn handle_frame(
    id: u64,
    text: &str,
    state: &Mutex<RelayState>,
    tx: &mpsc::UnboundedSender<String>,
) {
    let mut state = state.lock().unwrap();
    match ClientMessage::parse(text) {
        Some(ClientMessage::Req { sub_id, filter }) => {
            state.reqs.push((sub_id.clone(), filter.clone()));
            for event in state.events.iter().filter(|e| filter.matches(e)) {
                let frame = RelayMessage::Event {
                    sub_id: sub_id.clone(),
                    event: event.clone(),
                };
                let _ = tx.send(frame.to_json());
            }
            let _ = tx.send(
                RelayMessage::Eose {
                    sub_id: sub_id.clone(),
                }
                .to_json(),
            );
            if let Some(client) = state.clients.get_mut(&id) {
                client.subs.insert(sub_id, filter);
            }
        }
        Some(ClientMessage::Close { sub_id }) => {
            if let Some(client) = state.clients.get_mut(&id) {
                client.subs.remove(&sub_id);
            }
            state.closes.push(sub_id);
        }
        Some(ClientMessage::Event(event)) => {
            if state.silent {
                return;
            }
            let (accepted, message) = match &state.reject {
                Some(reason) => (false, reason.clone()),
                None => (true, String::new()),
            };
            let ok = RelayMessage::Ok {
                event_id: event.id.clone(),
                accepted,
                message,
            };
            if accepted {
                state.store_and_fan_out(event);
            }
            let _ = tx.send(ok.to_json());
        }
        None => {
            let _ = tx.send(
                RelayMessage::Notice {
                    message: "could not parse message".into(),
                }
                .to_json(),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Poll `cond` every 10ms for up to 5 seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A transport config pointed at the given relays with short timeouts.
pub fn test_config(dir: &Path, relays: &[&MockRelay]) -> TransportConfig {
    TransportConfig {
        relays: relays.iter().map(|r| r.url.clone()).collect(),
        keypair_path: dir.join("keypair.json"),
        request_timeout_secs: 5,
        publish_timeout_secs: 2,
        connect_timeout_secs: 2,
        reconnect_delay_secs: 1,
        ..TransportConfig::default()
    }
}
