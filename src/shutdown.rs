//! One-shot stop signal shared between a worker thread and its owner.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

/// Cloneable stop flag that sleeping workers can wait on.
///
/// Triggering drops the only sender, which wakes every receiver blocked in
/// [`StopSignal::wait_timeout`] at once.
#[derive(Clone)]
pub struct StopSignal {
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Create an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }

    /// Request a stop. Calling this more than once is harmless.
    pub fn trigger(&self) {
        self.sender.lock().take();
    }

    /// Whether a stop was requested.
    pub fn is_triggered(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for up to `timeout`. Returns `true` if woken by a stop request.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out_when_untriggered() {
        let signal = StopSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
        assert!(!signal.is_triggered());
    }

    #[test]
    fn test_trigger_wakes_waiter_early() {
        let signal = StopSignal::new();
        let waiter = signal.clone();
        let handle = std::thread::spawn(move || {
            let started = Instant::now();
            let woken = waiter.wait_timeout(Duration::from_secs(10));
            (woken, started.elapsed())
        });

        std::thread::sleep(Duration::from_millis(20));
        signal.trigger();
        signal.trigger();

        let (woken, elapsed) = handle.join().expect("waiter thread");
        assert!(woken);
        assert!(elapsed < Duration::from_secs(5));
        assert!(signal.is_triggered());
    }
}
