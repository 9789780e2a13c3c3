//! Cancellable per-session timers
//!
//! Each (session, kind) slot holds at most one pending timer; scheduling
//! into an occupied slot replaces it. Timers run on `tokio::time`, so tests
//! drive them with a paused clock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    QrWatchdog,
    Reconnect,
}

type Slots = HashMap<(String, TimerKind), (u64, JoinHandle<()>)>;

#[derive(Clone, Default)]
pub struct TimerSet {
    slots: Arc<Mutex<Slots>>,
    next_token: Arc<AtomicU64>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay` unless cancelled first
    pub fn schedule<F>(&self, session_id: &str, kind: TimerKind, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let key = (session_id.to_string(), kind);
        let slots = Arc::clone(&self.slots);
        let own_key = key.clone();

        // Hold the slot map while spawning so the task cannot vacate its
        // slot before it has been recorded.
        let Ok(mut guard) = self.slots.lock() else {
            return;
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Vacate the slot before running so the task can reschedule or
            // cancel this kind without aborting itself.
            if let Ok(mut slots) = slots.lock() {
                if slots.get(&own_key).is_some_and(|(t, _)| *t == token) {
                    slots.remove(&own_key);
                }
            }
            task.await;
        });

        if let Some((_, previous)) = guard.insert(key, (token, handle)) {
            previous.abort();
        }
    }

    pub fn cancel(&self, session_id: &str, kind: TimerKind) -> bool {
        let removed = self
            .slots
            .lock()
            .ok()
            .and_then(|mut slots| slots.remove(&(session_id.to_string(), kind)));
        match removed {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_session(&self, session_id: &str) {
        self.cancel(session_id, TimerKind::QrWatchdog);
        self.cancel(session_id, TimerKind::Reconnect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let timers = TimerSet::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        timers.schedule("s1", TimerKind::Reconnect, Duration::from_secs(3), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(2999)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // The fired timer vacated its slot
        assert!(!timers.cancel("s1", TimerKind::Reconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_replace() {
        let timers = TimerSet::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&fired);
        timers.schedule("s1", TimerKind::QrWatchdog, Duration::from_secs(1), async move {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.cancel("s1", TimerKind::QrWatchdog));
        assert!(!timers.cancel("s1", TimerKind::QrWatchdog));

        let c2 = Arc::clone(&fired);
        timers.schedule("s1", TimerKind::Reconnect, Duration::from_secs(1), async move {
            c2.fetch_add(10, Ordering::SeqCst);
        });
        let c3 = Arc::clone(&fired);
        timers.schedule("s1", TimerKind::Reconnect, Duration::from_secs(2), async move {
            c3.fetch_add(100, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 100);
    }
}
