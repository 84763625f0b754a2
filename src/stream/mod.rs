//! Stream hub: per-`stream_id` event pipes for server-push delivery.
//!
//! A stream id is issued by the client and registered when its
//! server-push connection arrives. At most one consumer per id: a
//! reconnect replaces the channel and drains any events buffered while
//! nobody was listening. Sessions idle past the grace window are
//! garbage collected and later events for them are dropped.

mod events;

pub use events::{AiResponsePayload, QueryResultPayload, StreamEvent};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::StreamNotifier;

/// Cap on events buffered for a consumer-less session.
const PENDING_BUFFER_CAP: usize = 256;

struct Session {
    chat_id: String,
    owner_user: String,
    sender: Mutex<Option<mpsc::UnboundedSender<StreamEvent>>>,
    pending: Mutex<VecDeque<StreamEvent>>,
    cancel: Mutex<CancellationToken>,
    terminal_sent: AtomicBool,
    last_active: Mutex<Instant>,
}

impl Session {
    fn touch(&self) {
        *self.last_active.lock().expect("last_active lock") = Instant::now();
    }
}

/// Process-wide registry of live stream sessions.
pub struct StreamHub {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    grace: Duration,
}

impl StreamHub {
    /// Creates a hub with the given idle grace window.
    pub fn new(grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            grace,
        })
    }

    /// Registers (or re-registers) a stream and returns its receiver.
    ///
    /// On reconnect the previous channel is replaced and buffered
    /// events are flushed into the new one, in order.
    pub fn register(
        &self,
        stream_id: &str,
        chat_id: &str,
        owner_user: &str,
    ) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut sessions = self.sessions.write().expect("sessions lock");
        let session = sessions
            .entry(stream_id.to_string())
            .or_insert_with(|| {
                Arc::new(Session {
                    chat_id: chat_id.to_string(),
                    owner_user: owner_user.to_string(),
                    sender: Mutex::new(None),
                    pending: Mutex::new(VecDeque::new()),
                    cancel: Mutex::new(CancellationToken::new()),
                    terminal_sent: AtomicBool::new(false),
                    last_active: Mutex::new(Instant::now()),
                })
            })
            .clone();
        drop(sessions);

        {
            let mut pending = session.pending.lock().expect("pending lock");
            for event in pending.drain(..) {
                let _ = tx.send(event);
            }
        }
        *session.sender.lock().expect("sender lock") = Some(tx);
        session.touch();

        debug!(stream_id, chat_id, "Stream registered");
        rx
    }

    /// Removes a session entirely and cancels any in-flight work.
    pub fn unregister(&self, stream_id: &str) {
        let removed = self
            .sessions
            .write()
            .expect("sessions lock")
            .remove(stream_id);
        if let Some(session) = removed {
            session.cancel.lock().expect("cancel lock").cancel();
            debug!(stream_id, "Stream unregistered");
        }
    }

    /// Detaches the consumer but keeps the session for the grace
    /// window (client disconnects, may reconnect).
    pub fn detach_consumer(&self, stream_id: &str) {
        if let Some(session) = self.session(stream_id) {
            *session.sender.lock().expect("sender lock") = None;
            session.touch();
        }
    }

    fn session(&self, stream_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("sessions lock")
            .get(stream_id)
            .cloned()
    }

    /// The cancellation token for a stream's in-flight work.
    pub fn cancel_token(&self, stream_id: &str) -> Option<CancellationToken> {
        self.session(stream_id)
            .map(|s| s.cancel.lock().expect("cancel lock").clone())
    }

    /// Triggers cancellation of the stream's in-flight work and arms a
    /// fresh token for the next turn.
    pub fn cancel(&self, stream_id: &str) {
        if let Some(session) = self.session(stream_id) {
            let mut guard = session.cancel.lock().expect("cancel lock");
            guard.cancel();
            *guard = CancellationToken::new();
        }
    }

    /// Marks the start of a user turn: re-arms the at-most-once
    /// terminal-event latch.
    pub fn begin_turn(&self, stream_id: &str) {
        if let Some(session) = self.session(stream_id) {
            session.terminal_sent.store(false, Ordering::SeqCst);
            session.touch();
        }
    }

    /// Emits an event on a stream, in producer order.
    ///
    /// Terminal events pass the at-most-once latch; a second terminal
    /// event for the same turn is dropped. Events for unknown streams
    /// are dropped.
    pub fn emit(&self, stream_id: &str, event: StreamEvent) {
        let Some(session) = self.session(stream_id) else {
            debug!(stream_id, event = event.name(), "Dropping event for unknown stream");
            return;
        };

        if event.is_terminal()
            && session
                .terminal_sent
                .swap(true, Ordering::SeqCst)
        {
            warn!(
                stream_id,
                event = event.name(),
                "Suppressing second terminal event for the same turn"
            );
            return;
        }

        session.touch();

        let mut sender = session.sender.lock().expect("sender lock");
        let delivered = match sender.as_ref() {
            Some(tx) => tx.send(event.clone()).is_ok(),
            None => false,
        };
        if !delivered {
            // No consumer (or it went away mid-send); buffer for a
            // possible reconnect.
            *sender = None;
            drop(sender);
            self.buffer_pending(&session, event);
        }
    }

    fn buffer_pending(&self, session: &Session, event: StreamEvent) {
        let mut pending = session.pending.lock().expect("pending lock");
        if pending.len() >= PENDING_BUFFER_CAP {
            pending.pop_front();
        }
        pending.push_back(event);
    }

    /// Emits to every stream bound to a chat.
    pub fn emit_to_chat(&self, chat_id: &str, event: StreamEvent) {
        let targets: Vec<String> = self
            .sessions
            .read()
            .expect("sessions lock")
            .iter()
            .filter(|(_, s)| s.chat_id == chat_id)
            .map(|(id, _)| id.clone())
            .collect();
        for stream_id in targets {
            self.emit(&stream_id, event.clone());
        }
    }

    /// Returns the chat a stream belongs to.
    pub fn chat_for(&self, stream_id: &str) -> Option<String> {
        self.session(stream_id).map(|s| s.chat_id.clone())
    }

    /// Returns the owner of a stream.
    pub fn owner_for(&self, stream_id: &str) -> Option<String> {
        self.session(stream_id).map(|s| s.owner_user.clone())
    }

    /// Collects sessions that have had no consumer and no activity for
    /// longer than the grace window. Returns how many were dropped.
    pub fn collect_idle(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write().expect("sessions lock");
        let before = sessions.len();
        sessions.retain(|stream_id, session| {
            let has_consumer = session.sender.lock().expect("sender lock").is_some();
            let idle = now.duration_since(*session.last_active.lock().expect("last_active lock"));
            let keep = has_consumer || idle < self.grace;
            if !keep {
                debug!(stream_id, "Collecting idle stream session");
                session.cancel.lock().expect("cancel lock").cancel();
            }
            keep
        });
        before - sessions.len()
    }

    /// Spawns the periodic idle collector. Stops when the returned
    /// token is cancelled.
    pub fn start_gc(self: &Arc<Self>, every: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let stop = token.clone();
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let dropped = hub.collect_idle();
                        if dropped > 0 {
                            debug!(dropped, "Stream GC pass");
                        }
                    }
                }
            }
        });
        token
    }
}

impl StreamNotifier for StreamHub {
    fn on_connected(&self, chat_id: &str) {
        self.emit_to_chat(
            chat_id,
            StreamEvent::DbConnected {
                chat_id: chat_id.to_string(),
            },
        );
    }

    fn on_disconnected(&self, chat_id: &str) {
        self.emit_to_chat(
            chat_id,
            StreamEvent::DbDisconnected {
                chat_id: chat_id.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(msg: &str) -> StreamEvent {
        StreamEvent::AiResponseStep {
            message: msg.into(),
            user_message_id: "m1".into(),
        }
    }

    fn terminal() -> StreamEvent {
        StreamEvent::ResponseCancelled {
            user_message_id: "m1".into(),
        }
    }

    #[tokio::test]
    async fn test_fifo_delivery() {
        let hub = StreamHub::new(Duration::from_secs(300));
        let mut rx = hub.register("s1", "c1", "u1");

        hub.emit("s1", step("one"));
        hub.emit("s1", step("two"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        match (first, second) {
            (
                StreamEvent::AiResponseStep { message: a, .. },
                StreamEvent::AiResponseStep { message: b, .. },
            ) => {
                assert_eq!(a, "one");
                assert_eq!(b, "two");
            }
            _ => panic!("wrong event kinds"),
        }
    }

    #[tokio::test]
    async fn test_at_most_one_terminal_event_per_turn() {
        let hub = StreamHub::new(Duration::from_secs(300));
        let mut rx = hub.register("s1", "c1", "u1");
        hub.begin_turn("s1");

        hub.emit("s1", terminal());
        hub.emit("s1", terminal());

        assert!(rx.recv().await.unwrap().is_terminal());
        assert!(rx.try_recv().is_err());

        // A new turn re-arms the latch.
        hub.begin_turn("s1");
        hub.emit("s1", terminal());
        assert!(rx.recv().await.unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_reconnect_flushes_pending() {
        let hub = StreamHub::new(Duration::from_secs(300));
        let rx = hub.register("s1", "c1", "u1");
        drop(rx);

        hub.emit("s1", step("while away"));

        let mut rx = hub.register("s1", "c1", "u1");
        match rx.recv().await.unwrap() {
            StreamEvent::AiResponseStep { message, .. } => assert_eq!(message, "while away"),
            _ => panic!("wrong event kind"),
        }
    }

    #[tokio::test]
    async fn test_events_for_unknown_stream_are_dropped() {
        let hub = StreamHub::new(Duration::from_secs(300));
        // No panic, nothing to observe: the event just disappears.
        hub.emit("ghost", step("anyone there?"));
    }

    #[tokio::test]
    async fn test_idle_collection() {
        let hub = StreamHub::new(Duration::from_millis(1));
        let rx = hub.register("s1", "c1", "u1");
        drop(rx);
        hub.detach_consumer("s1");

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hub.collect_idle(), 1);
        assert!(hub.chat_for("s1").is_none());
    }

    #[tokio::test]
    async fn test_consumer_keeps_session_alive() {
        let hub = StreamHub::new(Duration::from_millis(1));
        let _rx = hub.register("s1", "c1", "u1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hub.collect_idle(), 0);
    }

    #[tokio::test]
    async fn test_notifier_routes_by_chat() {
        let hub = StreamHub::new(Duration::from_secs(300));
        let mut rx1 = hub.register("s1", "c1", "u1");
        let mut rx2 = hub.register("s2", "c2", "u1");

        hub.on_disconnected("c1");

        match rx1.recv().await.unwrap() {
            StreamEvent::DbDisconnected { chat_id } => assert_eq!(chat_id, "c1"),
            _ => panic!("wrong event kind"),
        }
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_rearms_token() {
        let hub = StreamHub::new(Duration::from_secs(300));
        let _rx = hub.register("s1", "c1", "u1");

        let token = hub.cancel_token("s1").unwrap();
        hub.cancel("s1");
        assert!(token.is_cancelled());

        let fresh = hub.cancel_token("s1").unwrap();
        assert!(!fresh.is_cancelled());
    }
}
