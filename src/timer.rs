//! Timer Service
//!
//! Delivers one-shot and periodic events into the inbox of the task that
//! owns the timers. Timers are addressed by key: scheduling a key that is
//! already armed replaces the old timer, and cancelling aborts the
//! underlying task so no stale event is delivered after cleanup.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Keyed timers feeding a component inbox
pub struct Timers<K, E>
where
    K: Eq + Hash + Clone + Debug,
    E: Clone + Send + 'static,
{
    inbox: mpsc::Sender<E>,
    armed: HashMap<K, JoinHandle<()>>,
}

impl<K, E> Timers<K, E>
where
    K: Eq + Hash + Clone + Debug,
    E: Clone + Send + 'static,
{
    /// Create a timer service that delivers into `inbox`
    pub fn new(inbox: mpsc::Sender<E>) -> Self {
        Self {
            inbox,
            armed: HashMap::new(),
        }
    }

    /// Deliver `event` once after `delay`
    pub fn schedule_once(&mut self, key: K, delay: Duration, event: E) {
        let inbox = self.inbox.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(event).await;
        });
        self.arm(key, handle);
    }

    /// Deliver `event` every `period`, first delivery one period from now
    pub fn schedule_periodic(&mut self, key: K, period: Duration, event: E) {
        let inbox = self.inbox.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if inbox.send(event.clone()).await.is_err() {
                    break;
                }
            }
        });
        self.arm(key, handle);
    }

    /// Cancel the timer under `key`; returns whether one was armed
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.armed.remove(key) {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    /// Cancel every timer
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.armed.drain() {
            handle.abort();
        }
    }

    /// Check whether a timer under `key` can still fire
    pub fn is_armed(&self, key: &K) -> bool {
        self.armed.get(key).map(|h| !h.is_finished()).unwrap_or(false)
    }

    fn arm(&mut self, key: K, handle: JoinHandle<()>) {
        if let Some(old) = self.armed.insert(key.clone(), handle) {
            tracing::trace!("Rescheduling timer {:?}", key);
            old.abort();
        }
    }
}

impl<K, E> Drop for Timers<K, E>
where
    K: Eq + Hash + Clone + Debug,
    E: Clone + Send + 'static,
{
    fn drop(&mut self) {
        self.cancel_all();
    }
}
