//! Mirror life cycle and the shared sync-loop driver.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use pkgrelay_state::StateSender;

/// A mirror instance: open stores at `init`, run the periodic sync loop in
/// `serve` until the cancellation channel fires.
pub trait MirrorService: Send + Sync {
    fn init(&self) -> Result<()>;
    fn serve(self: Arc<Self>, shutdown: Receiver<()>) -> Result<()>;
}

/// Outcome of one wait between sync passes.
pub enum LoopStep {
    Continue,
    Cancelled,
}

/// The "fetch, then wait, then fetch" state machine shared by the sync
/// loops: after a pass completes, emit `HOLD` and sleep `interval`, waking
/// early on cancellation. One driver thread alternates between syncing and
/// sleeping; a second sync never starts while one is in progress.
pub fn hold_between_runs(
    state: &StateSender,
    shutdown: &Receiver<()>,
    interval: Duration,
) -> LoopStep {
    state.hold("Wait for a new run");
    match shutdown.recv_timeout(interval) {
        Err(RecvTimeoutError::Timeout) => LoopStep::Continue,
        Ok(()) | Err(RecvTimeoutError::Disconnected) => LoopStep::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use pkgrelay_types::{State, Status};

    #[test]
    fn hold_emits_and_times_out() {
        let (state_tx, state_rx) = unbounded::<State>();
        let (_shutdown_tx, shutdown_rx) = unbounded::<()>();
        let state = StateSender::new("composer.test", state_tx);

        let step = hold_between_runs(&state, &shutdown_rx, Duration::from_millis(10));
        assert!(matches!(step, LoopStep::Continue));

        let event = state_rx.try_recv().expect("hold event");
        assert_eq!(event.status, Status::Hold);
    }

    #[test]
    fn hold_wakes_on_cancellation() {
        let (state_tx, _state_rx) = unbounded::<State>();
        let (shutdown_tx, shutdown_rx) = unbounded::<()>();
        let state = StateSender::new("composer.test", state_tx);

        shutdown_tx.send(()).expect("signal");
        let step = hold_between_runs(&state, &shutdown_rx, Duration::from_secs(3600));
        assert!(matches!(step, LoopStep::Cancelled));
    }

    #[test]
    fn hold_treats_disconnect_as_cancellation() {
        let (state_tx, _state_rx) = unbounded::<State>();
        let (shutdown_tx, shutdown_rx) = unbounded::<()>();
        drop(shutdown_tx);
        let state = StateSender::new("composer.test", state_tx);

        let step = hold_between_runs(&state, &shutdown_rx, Duration::from_secs(3600));
        assert!(matches!(step, LoopStep::Cancelled));
    }
}
