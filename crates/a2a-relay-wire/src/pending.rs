//! Outstanding requests keyed by correlation id.
//!
//! Owned by the transport's dispatcher task, so there is no interior locking.
//! Every entry leaves the table exactly once: on its response, at its
//! deadline, on cancellation, or when the transport shuts down.

use a2a_relay_types::error::{TransportError, TransportResult};
use a2a_relay_types::AgentMessage;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Where a request's outcome is delivered.
pub type ResultSink = oneshot::Sender<TransportResult<AgentMessage>>;

/// Horizon used when `created_at + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

struct PendingRequest {
    created_at: Instant,
    timeout: Duration,
    deadline: Instant,
    sink: ResultSink,
}

/// Table of in-flight requests.
#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<String, PendingRequest>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request expiring at `created_at + timeout`. Timeouts too
    /// large to represent are clamped to a far-future deadline.
    ///
    /// Returns `false` (dropping `sink`) if `id` is already registered.
    pub fn register(
        &mut self,
        id: String,
        created_at: Instant,
        timeout: Duration,
        sink: ResultSink,
    ) -> bool {
        if self.entries.contains_key(&id) {
            warn!(correlation_id = %id, "Duplicate correlation id, not registering");
            return false;
        }
        debug!(correlation_id = %id, timeout_ms = timeout.as_millis(), "Registered pending request");
        self.entries.insert(
            id,
            PendingRequest {
                created_at,
                timeout,
                deadline: deadline_after(created_at, timeout),
                sink,
            },
        );
        true
    }

    /// Deliver a response. Returns `false` for unknown, already-resolved, or
    /// expired ids.
    pub fn resolve(&mut self, id: &str, message: AgentMessage) -> bool {
        let Some(pending) = self.entries.remove(id) else {
            debug!(correlation_id = %id, "Response for unknown or expired correlation id");
            return false;
        };
        debug!(
            correlation_id = %id,
            response_time_ms = pending.created_at.elapsed().as_millis(),
            "Completed pending request"
        );
        if pending.sink.send(Ok(message)).is_err() {
            debug!(correlation_id = %id, "Pending request receiver dropped");
        }
        true
    }

    /// Remove a request without delivering anything.
    pub fn cancel(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Fail every request whose deadline is at or before `now` with
    /// [`TransportError::TimedOut`]. Returns how many expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(pending) = self.entries.remove(id) {
                debug!(correlation_id = %id, timeout_ms = pending.timeout.as_millis(), "Pending request timed out");
                let _ = pending.sink.send(Err(TransportError::TimedOut(pending.timeout)));
            }
        }
        expired.len()
    }

    /// Fail every remaining request with [`TransportError::TransportClosed`].
    pub fn drain(&mut self) -> usize {
        let count = self.entries.len();
        for (_, pending) in self.entries.drain() {
            let _ = pending.sink.send(Err(TransportError::TransportClosed));
        }
        count
    }

    /// The earliest deadline in the table, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|p| p.deadline).min()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn deadline_after(created_at: Instant, timeout: Duration) -> Instant {
    created_at
        .checked_add(timeout)
        .or_else(|| created_at.checked_add(FAR_FUTURE))
        .unwrap_or(created_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(
        table: &mut PendingTable,
        id: &str,
        now: Instant,
        secs: u64,
    ) -> oneshot::Receiver<TransportResult<AgentMessage>> {
        let (tx, rx) = oneshot::channel();
        assert!(table.register(id.to_string(), now, Duration::from_secs(secs), tx));
        rx
    }

    #[test]
    fn test_resolve_exactly_once() {
        let mut table = PendingTable::new();
        let now = Instant::now();
        let mut rx = register(&mut table, "a", now, 30);

        assert!(table.resolve("a", AgentMessage::agent_text("first")));
        assert!(!table.resolve("a", AgentMessage::agent_text("second")));
        assert!(table.is_empty());

        let got = rx.try_recv().unwrap().unwrap();
        assert_eq!(got.text(), "first");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut table = PendingTable::new();
        let now = Instant::now();
        let _rx = register(&mut table, "a", now, 30);
        let (tx, mut rx2) = oneshot::channel();
        assert!(!table.register("a".into(), now, Duration::from_secs(1), tx));
        assert_eq!(table.len(), 1);
        // The rejected sink was dropped.
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_expire_only_past_deadlines() {
        let mut table = PendingTable::new();
        let now = Instant::now();
        let mut short = register(&mut table, "short", now, 1);
        let mut long = register(&mut table, "long", now, 60);

        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(1)));
        assert_eq!(table.expire(now), 0);
        assert_eq!(table.expire(now + Duration::from_secs(1)), 1);
        assert!(!table.contains("short"));
        assert!(table.contains("long"));

        match short.try_recv().unwrap() {
            Err(TransportError::TimedOut(d)) => assert_eq!(d, Duration::from_secs(1)),
            other => panic!("expected TimedOut, got {other:?}"),
        }
        assert!(long.try_recv().is_err());

        // Late response after expiry is dropped.
        assert!(!table.resolve("short", AgentMessage::agent_text("late")));
        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_cancel_delivers_nothing() {
        let mut table = PendingTable::new();
        let now = Instant::now();
        let mut rx = register(&mut table, "a", now, 30);
        assert!(table.cancel("a"));
        assert!(!table.cancel("a"));
        assert!(matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
    }

    #[test]
    fn test_drain_fails_everything_with_closed() {
        let mut table = PendingTable::new();
        let now = Instant::now();
        let mut receivers: Vec<_> = (0..5)
            .map(|i| register(&mut table, &format!("r{i}"), now, 30))
            .collect();

        assert_eq!(table.drain(), 5);
        assert!(table.is_empty());
        assert_eq!(table.next_deadline(), None);
        for rx in &mut receivers {
            assert!(matches!(
                rx.try_recv().unwrap(),
                Err(TransportError::TransportClosed)
            ));
        }
    }

    #[test]
    fn test_huge_timeout_clamped() {
        let mut table = PendingTable::new();
        let now = Instant::now();
        let (tx, mut rx) = oneshot::channel();
        assert!(table.register("forever".into(), now, Duration::MAX, tx));

        let deadline = table.next_deadline().unwrap();
        assert!(deadline > now + Duration::from_secs(86_400 * 365));
        assert_eq!(table.expire(now + Duration::from_secs(3600)), 0);
        assert!(rx.try_recv().is_err());

        assert!(table.resolve("forever", AgentMessage::agent_text("done")));
        assert_eq!(rx.try_recv().unwrap().unwrap().text(), "done");
    }

    #[test]
    fn test_resolve_after_receiver_dropped() {
        let mut table = PendingTable::new();
        let rx = register(&mut table, "a", Instant::now(), 30);
        drop(rx);
        // Still removed; the caller simply stopped waiting.
        assert!(table.resolve("a", AgentMessage::agent_text("x")));
        assert!(table.is_empty());
    }
}
