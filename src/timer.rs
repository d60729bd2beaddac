/// One-shot callback timers for step and routine deadlines.
///
/// Each timer is a thread parked on `recv_timeout`; dropping the handle
/// hangs up the channel and wakes the thread without firing. A timer
/// that has already started firing cannot be recalled — callers guard
/// against stale fires with their own state checks.

use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::Duration;

/// Handle to a pending callback. Dropping it cancels the callback if it
/// has not fired yet.
pub(crate) struct OneShot {
    _cancel: SyncSender<()>,
}

/// Run `f` once after `after`, unless the returned handle is dropped
/// first.
pub(crate) fn one_shot<F>(after: Duration, f: F) -> OneShot
where
    F: FnOnce() + Send + 'static,
{
    let (cancel, parked) = mpsc::sync_channel::<()>(1);
    thread::Builder::new()
        .name("one-shot".into())
        .spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = parked.recv_timeout(after) {
                f();
            }
        })
        .expect("one-shot timer thread spawn failed");
    OneShot { _cancel: cancel }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let timer = one_shot(Duration::from_millis(10), move || {
            flag.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        assert!(fired.load(Ordering::SeqCst));
        drop(timer);
    }

    #[test]
    fn drop_cancels() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let timer = one_shot(Duration::from_millis(20), move || {
            flag.store(true, Ordering::SeqCst);
        });
        drop(timer);
        thread::sleep(Duration::from_millis(60));
        assert!(!fired.load(Ordering::SeqCst));
    }
}
