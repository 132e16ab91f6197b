use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Host-keyed "do not call before" windows learned from 429 responses.
///
/// Shared by every dispatcher so that two endpoints resolving to the same host
/// back off together. The outer map lock is held only long enough to clone the
/// per-host slot; deadline reads and writes go through the slot's own lock.
#[derive(Debug)]
pub struct BackoffTracker {
    default_window: Duration,
    hosts: Mutex<HashMap<String, Arc<Mutex<Option<Instant>>>>>,
}

impl BackoffTracker {
    pub fn new(default_window: Duration) -> Self {
        Self {
            default_window,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Remaining backoff for `host`, if a window is active. Expired windows
    /// are cleared on access.
    pub fn active(&self, host: &str) -> Option<Duration> {
        let slot = self.slot(host);
        let mut guard = slot.lock().ok()?;
        let until = (*guard)?;
        let now = Instant::now();
        if until <= now {
            *guard = None;
            return None;
        }
        Some(until - now)
    }

    /// Starts (or extends) a backoff window for `host`. `retry_after` comes
    /// from the response when present; otherwise the configured default
    /// window applies.
    pub fn record(&self, host: &str, retry_after: Option<Duration>) {
        let window = retry_after.unwrap_or(self.default_window);
        let until = Instant::now() + window;
        let slot = self.slot(host);
        if let Ok(mut guard) = slot.lock() {
            // Never shorten a window another request already recorded.
            if guard.map(|existing| existing < until).unwrap_or(true) {
                *guard = Some(until);
            }
        }
    }

    fn slot(&self, host: &str) -> Arc<Mutex<Option<Instant>>> {
        let mut guard = match self.hosts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.entry(host.to_string()).or_default().clone()
    }
}
