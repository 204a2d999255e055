//! Progress-event bus and server-sent-event fan-out.
//!
//! Mirrors report progress through a [`StateSender`], a per-mirror wrapper
//! that tags every event with the mirror id (`<kind>.<code>`) before
//! forwarding it to the single process-wide channel. The [`SseBroker`]
//! consumes that channel and fans events out to connected subscribers; on
//! connect it replays the last-known state of every mirror so late
//! subscribers see a consistent snapshot.
//!
//! Each subscriber owns a bounded queue. When a slow reader lets its queue
//! fill up, the broker drops that subscriber's oldest pending event in
//! favour of the new one, so one stalled client never holds back the rest.
//!
//! # Example
//!
//! ```
//! use pkgrelay_state::{SseBroker, StateSender};
//! use pkgrelay_types::{MirrorKind, Status, mirror_id};
//!
//! let (tx, rx) = crossbeam::channel::unbounded();
//! let broker = SseBroker::spawn(rx);
//!
//! let state = StateSender::new(mirror_id(MirrorKind::Npm, "main"), tx);
//! state.running("Syncing packages");
//!
//! let subscriber = broker.subscribe();
//! let payload = subscriber.recv().expect("event");
//! let event: pkgrelay_types::State = serde_json::from_slice(&payload).expect("json");
//! assert_eq!(event.id, "npm.main");
//! ```

use std::collections::BTreeMap;
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use pkgrelay_types::{State, Status};

/// Queue depth granted to each SSE subscriber before drop-oldest kicks in.
pub const SUBSCRIBER_QUEUE: usize = 256;

/// Per-mirror wrapper around the process-wide state channel.
#[derive(Debug, Clone)]
pub struct StateSender {
    id: String,
    tx: Sender<State>,
}

impl StateSender {
    pub fn new(id: impl Into<String>, tx: Sender<State>) -> Self {
        Self { id: id.into(), tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn send(&self, status: Status, message: impl Into<String>) {
        // a missing broker must never stall a sync pass
        let _ = self.tx.send(State::new(self.id.clone(), status, message));
    }

    pub fn running(&self, message: impl Into<String>) {
        self.send(Status::Running, message);
    }

    pub fn hold(&self, message: impl Into<String>) {
        self.send(Status::Hold, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(Status::Error, message);
    }
}

enum Control {
    Subscribe(u64, Sender<Vec<u8>>, Receiver<Vec<u8>>),
    Unsubscribe(u64),
}

/// Fan-out of state events to SSE subscribers.
pub struct SseBroker {
    control: Sender<Control>,
    next_id: std::sync::atomic::AtomicU64,
    _worker: JoinHandle<()>,
}

impl SseBroker {
    /// Start the broker thread consuming `events`.
    pub fn spawn(events: Receiver<State>) -> SseBroker {
        let (control_tx, control_rx) = unbounded();
        let worker = std::thread::spawn(move || broker_loop(events, control_rx));
        SseBroker {
            control: control_tx,
            next_id: std::sync::atomic::AtomicU64::new(0),
            _worker: worker,
        }
    }

    /// Register a new subscriber. The returned handle yields JSON-encoded
    /// state events, starting with a replay of every mirror's last state.
    pub fn subscribe(&self) -> Subscriber {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let (tx, rx) = bounded(SUBSCRIBER_QUEUE);
        let _ = self
            .control
            .send(Control::Subscribe(id, tx, rx.clone()));
        Subscriber {
            id,
            rx,
            control: self.control.clone(),
        }
    }
}

/// One connected SSE client. Dropping it unregisters from the broker.
pub struct Subscriber {
    id: u64,
    rx: Receiver<Vec<u8>>,
    control: Sender<Control>,
}

impl Subscriber {
    /// Block until the next event payload.
    pub fn recv(&self) -> Option<Vec<u8>> {
        self.rx.recv().ok()
    }

    /// Wait for the next event payload with a bound.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Result<Vec<u8>, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Unsubscribe(self.id));
    }
}

struct Client {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl Client {
    /// Enqueue a payload, discarding the oldest pending one when full.
    fn push(&self, payload: Vec<u8>) {
        let mut payload = payload;
        loop {
            match self.tx.try_send(payload) {
                Ok(()) => return,
                Err(crossbeam::channel::TrySendError::Full(p)) => {
                    let _ = self.rx.try_recv();
                    payload = p;
                }
                Err(crossbeam::channel::TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

fn broker_loop(events: Receiver<State>, control: Receiver<Control>) {
    let mut clients: BTreeMap<u64, Client> = BTreeMap::new();
    let mut last: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    loop {
        crossbeam::select! {
            recv(events) -> event => {
                let Ok(event) = event else { return };
                let payload = match serde_json::to_vec(&event) {
                    Ok(p) => p,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to encode state event");
                        continue;
                    }
                };
                last.insert(event.id.clone(), payload.clone());
                for client in clients.values() {
                    client.push(payload.clone());
                }
            }
            recv(control) -> message => {
                match message {
                    Ok(Control::Subscribe(id, tx, rx)) => {
                        let client = Client { tx, rx };
                        // replay the last-known state of every mirror
                        for payload in last.values() {
                            client.push(payload.clone());
                        }
                        clients.insert(id, client);
                    }
                    Ok(Control::Unsubscribe(id)) => {
                        clients.remove(&id);
                    }
                    Err(_) => return,
                }
            }
        }
    }
}

/// Frame a payload as one SSE message.
pub fn sse_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(b"data: ");
    frame.extend_from_slice(payload);
    frame.extend_from_slice(b"\n\n");
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkgrelay_types::{MirrorKind, mirror_id};
    use std::time::Duration;

    #[test]
    fn sender_tags_events_with_mirror_id() {
        let (tx, rx) = unbounded();
        let sender = StateSender::new(mirror_id(MirrorKind::Composer, "packagist"), tx);

        sender.running("Syncing packages");

        let event = rx.recv_timeout(Duration::from_secs(1)).expect("event");
        assert_eq!(event.id, "composer.packagist");
        assert_eq!(event.status, Status::Running);
        assert_eq!(event.message, "Syncing packages");
    }

    #[test]
    fn broker_fans_out_to_subscribers() {
        let (tx, rx) = unbounded();
        let broker = SseBroker::spawn(rx);

        let first = broker.subscribe();
        let second = broker.subscribe();

        let sender = StateSender::new("git.main", tx);
        sender.running("Fetch repo.git");

        for subscriber in [&first, &second] {
            let payload = subscriber
                .recv_timeout(Duration::from_secs(1))
                .expect("event");
            let event: State = serde_json::from_slice(&payload).expect("json");
            assert_eq!(event.message, "Fetch repo.git");
        }
    }

    #[test]
    fn late_subscriber_gets_last_state_replay() {
        let (tx, rx) = unbounded();
        let broker = SseBroker::spawn(rx);

        let sender = StateSender::new("npm.main", tx.clone());
        sender.running("first");
        sender.hold("latest");

        // events land before anyone is connected
        std::thread::sleep(Duration::from_millis(50));

        let subscriber = broker.subscribe();
        let payload = subscriber
            .recv_timeout(Duration::from_secs(1))
            .expect("replayed event");
        let event: State = serde_json::from_slice(&payload).expect("json");
        assert_eq!(event.id, "npm.main");
        assert_eq!(event.message, "latest");
    }

    #[test]
    fn slow_subscriber_drops_oldest_not_newest() {
        let (tx, rx) = unbounded();
        let broker = SseBroker::spawn(rx);
        let subscriber = broker.subscribe();

        let sender = StateSender::new("static.files", tx);
        for i in 0..(SUBSCRIBER_QUEUE + 50) {
            sender.running(format!("event {i}"));
        }
        std::thread::sleep(Duration::from_millis(100));

        // drain; the tail of the stream must be intact
        let mut latest = None;
        while let Ok(payload) = subscriber.recv_timeout(Duration::from_millis(50)) {
            latest = Some(payload);
        }
        let event: State =
            serde_json::from_slice(&latest.expect("some events survived")).expect("json");
        assert_eq!(event.message, format!("event {}", SUBSCRIBER_QUEUE + 49));
    }

    #[test]
    fn sse_frame_wraps_payload() {
        assert_eq!(sse_frame(b"{}"), b"data: {}\n\n");
    }
}
