//! Login lockout tracking.
//!
//! Counts failed logins per (username, ip) in a sliding window and locks
//! the pair once the threshold is exceeded. Every login path — password,
//! OAuth and the bind confirmation — consults the guard, so lockout is
//! uniform regardless of method. State is in-process; a restart clears it,
//! which matches the rest of the ephemeral ceremony state.

use crate::config::LockoutConfig;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct FailureRecord {
    count: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

#[derive(Clone)]
pub struct SecurityGuard {
    records: Arc<DashMap<(String, String), FailureRecord>>,
    max_failures: u32,
    window: Duration,
    lock_duration: Duration,
    last_cleanup: Arc<Mutex<Instant>>,
}

impl SecurityGuard {
    pub fn new(config: &LockoutConfig) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            max_failures: config.max_failures,
            window: Duration::from_secs(config.window_secs),
            lock_duration: Duration::from_secs(config.lock_secs),
            last_cleanup: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Drop stale records occasionally so the map does not grow unbounded.
    fn maybe_cleanup(&self) {
        const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

        if let Ok(mut last_cleanup) = self.last_cleanup.try_lock() {
            if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                *last_cleanup = Instant::now();
                drop(last_cleanup);

                let window = self.window;
                self.records.retain(|_, rec| {
                    rec.locked_until.is_some_and(|until| until > Instant::now())
                        || rec.window_start.elapsed() < window
                });
            }
        }
    }

    /// Record one failed attempt. Locks the pair once the windowed count
    /// reaches the threshold.
    pub fn record_failure(&self, username: &str, ip: &str) {
        self.maybe_cleanup();

        let key = (username.to_string(), ip.to_string());
        let mut entry = self.records.entry(key).or_insert_with(|| FailureRecord {
            count: 0,
            window_start: Instant::now(),
            locked_until: None,
        });

        if entry.window_start.elapsed() >= self.window {
            entry.count = 0;
            entry.window_start = Instant::now();
        }
        entry.count += 1;

        if entry.count >= self.max_failures {
            entry.locked_until = Some(Instant::now() + self.lock_duration);
            tracing::warn!(username = username, ip = ip, "login lockout engaged");
        }
    }

    /// Reset counters after a successful authentication.
    pub fn record_success(&self, username: &str, ip: &str) {
        self.records
            .remove(&(username.to_string(), ip.to_string()));
    }

    /// Remaining lock time for this exact (username, ip), if locked.
    pub fn lock_remaining(&self, username: &str, ip: &str) -> Option<Duration> {
        let key = (username.to_string(), ip.to_string());
        let entry = self.records.get(&key)?;
        let until = entry.locked_until?;
        until.checked_duration_since(Instant::now())
    }

    pub fn is_locked(&self, username: &str, ip: &str) -> bool {
        self.lock_remaining(username, ip).is_some()
    }

    /// Whether any ip currently holds a lock for this username. Used by
    /// flows that know the account but not the ip that tripped the lock.
    pub fn is_user_blocked(&self, username: &str) -> Option<Duration> {
        self.records
            .iter()
            .filter(|entry| entry.key().0 == username)
            .filter_map(|entry| {
                entry
                    .value()
                    .locked_until
                    .and_then(|until| until.checked_duration_since(Instant::now()))
            })
            .max()
    }
}
