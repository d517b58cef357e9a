//! Cross-thread hand-off into a running engine.
//!
//! Push-source messages and stop requests arrive from other threads. Both go
//! through a [`PushSignal`]: a flag pair guarded by a `parking_lot` mutex with
//! a condition variable that wakes a real-time clock blocked between cycles.
//! Messages themselves wait in a queue and are applied during the push
//! node's slot of the next cycle.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::value::DeltaValue;

#[derive(Debug, Default)]
struct SignalState {
    push_pending: bool,
    stop_requested: bool,
}

/// Wake-up channel between producer threads and the evaluation thread.
#[derive(Debug, Default)]
pub struct PushSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl PushSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_push_pending(&self) {
        self.state.lock().push_pending = true;
        self.cond.notify_all();
    }

    pub fn push_pending(&self) -> bool {
        self.state.lock().push_pending
    }

    pub fn reset_push_pending(&self) {
        self.state.lock().push_pending = false;
    }

    pub fn request_stop(&self) {
        self.state.lock().stop_requested = true;
        self.cond.notify_all();
    }

    pub fn stop_requested(&self) -> bool {
        self.state.lock().stop_requested
    }

    /// Block for at most `timeout`, returning early when a push or stop
    /// arrives. Returns whether either flag is set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.push_pending && !state.stop_requested {
            self.cond.wait_for(&mut state, timeout);
        }
        state.push_pending || state.stop_requested
    }
}

/// A message for the push-source node at `node_ndx` of the root graph.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub node_ndx: usize,
    pub value: DeltaValue,
}

pub(crate) type PushQueue = Arc<Mutex<VecDeque<PushMessage>>>;

/// Thread-safe handle for feeding push-source nodes.
#[derive(Debug, Clone)]
pub struct PushMessageSender {
    queue: PushQueue,
    signal: Arc<PushSignal>,
}

impl PushMessageSender {
    pub(crate) fn new(queue: PushQueue, signal: Arc<PushSignal>) -> Self {
        Self { queue, signal }
    }

    /// Enqueue a value for the push node at `node_ndx` and wake the engine.
    ///
    /// Returns `false` once the engine has been asked to stop.
    pub fn send(&self, node_ndx: usize, value: impl Into<DeltaValue>) -> bool {
        if self.signal.stop_requested() {
            warn!(node_ndx, "dropping push message: engine is stopping");
            return false;
        }
        self.queue.lock().push_back(PushMessage {
            node_ndx,
            value: value.into(),
        });
        self.signal.mark_push_pending();
        true
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Thread-safe handle for stopping a running engine.
#[derive(Debug, Clone)]
pub struct StopHandle {
    signal: Arc<PushSignal>,
}

impl StopHandle {
    pub(crate) fn new(signal: Arc<PushSignal>) -> Self {
        Self { signal }
    }

    /// Ask the engine to stop after the cycle in progress.
    pub fn request_stop(&self) {
        self.signal.request_stop();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.signal.stop_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn send_marks_the_signal() {
        let signal = Arc::new(PushSignal::new());
        let sender = PushMessageSender::new(PushQueue::default(), signal.clone());
        assert!(!signal.push_pending());
        assert!(sender.send(0, 5));
        assert!(signal.push_pending());
        assert_eq!(sender.pending(), 1);
    }

    #[test]
    fn wait_returns_when_another_thread_pushes() {
        let signal = Arc::new(PushSignal::new());
        let sender = PushMessageSender::new(PushQueue::default(), signal.clone());
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            sender.send(1, "tick")
        });
        let mut woke = false;
        for _ in 0..100 {
            if signal.wait(Duration::from_millis(50)) {
                woke = true;
                break;
            }
        }
        assert!(producer.join().unwrap());
        assert!(woke);
    }

    #[test]
    fn stopped_engines_reject_messages() {
        let signal = Arc::new(PushSignal::new());
        let sender = PushMessageSender::new(PushQueue::default(), signal.clone());
        StopHandle::new(signal).request_stop();
        assert!(!sender.send(0, 1));
        assert_eq!(sender.pending(), 0);
    }
}
