//! Upstream credential pool.
//!
//! Credentials are handed out round-robin. A credential that fails
//! authorization is quarantined for a recovery window and skipped until the
//! window lapses; expiry is lazy and evaluated on every selection. When every
//! credential is quarantined at once the pool forgets all failures and keeps
//! rotating over the full set rather than stalling.

use crate::config::RECOVERY_WINDOW;
use crate::error::ConfigError;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// An opaque upstream secret. Two credentials are equal when their values are.
#[derive(Clone)]
pub struct Credential(Arc<SecretString>);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Arc::new(SecretString::from(value.into())))
    }

    /// The raw secret, for building the `Authorization` header.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for Credential {}

impl Hash for Credential {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.expose().hash(state);
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([redacted])")
    }
}

/// Snapshot of pool health, served by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    cursor: usize,
    failed_at: HashMap<Credential, Instant>,
}

impl PoolState {
    fn purge_expired(&mut self, now: Instant, window: Duration) {
        self.failed_at
            .retain(|_, at| now.saturating_duration_since(*at) < window);
    }
}

#[derive(Debug)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
    recovery_window: Duration,
    state: Mutex<PoolState>,
}

impl CredentialPool {
    pub fn new<I, S>(keys: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let credentials: Vec<Credential> = keys.into_iter().map(Credential::new).collect();
        if credentials.is_empty() {
            return Err(ConfigError::NoCredentials);
        }
        Ok(Self {
            credentials,
            recovery_window: RECOVERY_WINDOW,
            state: Mutex::new(PoolState::default()),
        })
    }

    pub fn with_recovery_window(mut self, window: Duration) -> Self {
        self.recovery_window = window;
        self
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn select(&self) -> Credential {
        self.select_at(Instant::now())
    }

    /// Pick the next credential as of `now`.
    pub fn select_at(&self, now: Instant) -> Credential {
        let mut state = self.lock();
        state.purge_expired(now, self.recovery_window);

        let eligible: Vec<&Credential> = self
            .credentials
            .iter()
            .filter(|c| !state.failed_at.contains_key(*c))
            .collect();

        if eligible.is_empty() {
            warn!(
                total = self.credentials.len(),
                "all credentials quarantined, resetting failure records"
            );
            state.failed_at.clear();
            let picked = self.credentials[state.cursor % self.credentials.len()].clone();
            state.cursor = state.cursor.wrapping_add(1);
            return picked;
        }

        let picked = eligible[state.cursor % eligible.len()].clone();
        state.cursor = state.cursor.wrapping_add(1);
        picked
    }

    pub fn mark_failed(&self, credential: &Credential, reason: &str) {
        self.mark_failed_at(credential, reason, Instant::now());
    }

    /// Quarantine `credential` starting at `now`. Re-marking refreshes the timestamp.
    pub fn mark_failed_at(&self, credential: &Credential, reason: &str, now: Instant) {
        if !self.credentials.contains(credential) {
            warn!(reason, "ignoring failure report for a credential outside the pool");
            return;
        }

        let mut state = self.lock();
        state.failed_at.insert(credential.clone(), now);
        warn!(
            reason,
            failed = state.failed_at.len(),
            total = self.credentials.len(),
            recovery_secs = self.recovery_window.as_secs(),
            "credential quarantined"
        );
    }

    pub fn stats(&self) -> PoolStats {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> PoolStats {
        let mut state = self.lock();
        state.purge_expired(now, self.recovery_window);
        let failed = state.failed_at.len();
        debug!(failed, total = self.credentials.len(), "pool stats");
        PoolStats {
            total: self.credentials.len(),
            available: self.credentials.len() - failed,
            failed,
        }
    }

    // Every critical section leaves the state consistent, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pool(keys: &[&str]) -> CredentialPool {
        CredentialPool::new(keys.iter().copied()).unwrap()
    }

    #[test]
    fn test_empty_pool_rejected() {
        let empty: Vec<String> = Vec::new();
        assert!(matches!(
            CredentialPool::new(empty),
            Err(ConfigError::NoCredentials)
        ));
    }

    #[test]
    fn test_round_robin_visits_every_credential() {
        for size in 1..=6 {
            let keys: Vec<String> = (0..size).map(|i| format!("k{}", i)).collect();
            let pool = CredentialPool::new(keys.clone()).unwrap();

            let first_round: HashSet<String> = (0..size)
                .map(|_| pool.select().expose().to_string())
                .collect();
            assert_eq!(first_round.len(), size, "pool size {}", size);

            // Second round repeats the same order.
            let again: Vec<String> = (0..size)
                .map(|_| pool.select().expose().to_string())
                .collect();
            assert_eq!(again, keys);
        }
    }

    #[test]
    fn test_consecutive_selections_differ() {
        let pool = pool(&["a", "b", "c"]);
        let mut prev = pool.select();
        for _ in 0..10 {
            let next = pool.select();
            assert_ne!(prev, next);
            prev = next;
        }
    }

    #[test]
    fn test_failed_credential_skipped_until_window_elapses() {
        let pool = pool(&["a", "b", "c"]);
        let bad = Credential::new("b");
        let t0 = Instant::now();
        pool.mark_failed_at(&bad, "HTTP 401", t0);

        for i in 0..20 {
            let at = t0 + Duration::from_secs(i);
            assert_ne!(pool.select_at(at), bad);
        }

        let later = t0 + RECOVERY_WINDOW + Duration::from_secs(1);
        let picks: Vec<Credential> = (0..3).map(|_| pool.select_at(later)).collect();
        assert!(picks.contains(&bad));
    }

    #[test]
    fn test_all_failed_forces_reset() {
        let pool = pool(&["a", "b"]);
        let t0 = Instant::now();
        pool.mark_failed_at(&Credential::new("a"), "HTTP 401", t0);
        pool.mark_failed_at(&Credential::new("b"), "HTTP 403", t0);
        assert_eq!(pool.stats_at(t0).failed, 2);

        let picked = pool.select_at(t0);
        assert!(picked == Credential::new("a") || picked == Credential::new("b"));
        assert_eq!(
            pool.stats_at(t0),
            PoolStats {
                total: 2,
                available: 2,
                failed: 0
            }
        );
    }

    #[test]
    fn test_mark_failed_is_idempotent_and_refreshes() {
        let pool = pool(&["a", "b"]);
        let a = Credential::new("a");
        let t0 = Instant::now();
        pool.mark_failed_at(&a, "first", t0);
        pool.mark_failed_at(&a, "second", t0 + Duration::from_secs(50));

        assert_eq!(pool.stats_at(t0 + Duration::from_secs(50)).failed, 1);
        // Still quarantined 70s after the first mark because the second refreshed it.
        assert_eq!(pool.stats_at(t0 + Duration::from_secs(70)).failed, 1);
        assert_eq!(pool.stats_at(t0 + Duration::from_secs(111)).failed, 0);
    }

    #[test]
    fn test_unknown_credential_ignored() {
        let pool = pool(&["a"]);
        pool.mark_failed(&Credential::new("zzz"), "HTTP 401");
        assert_eq!(pool.stats().failed, 0);
    }

    #[test]
    fn test_first_two_failed_selects_third() {
        let pool = pool(&["k1", "k2", "k3"]);
        pool.mark_failed(&Credential::new("k1"), "HTTP 401");
        pool.mark_failed(&Credential::new("k2"), "HTTP 401");
        for _ in 0..5 {
            assert_eq!(pool.select().expose(), "k3");
        }
    }

    #[test]
    fn test_custom_recovery_window() {
        let pool = pool(&["a", "b"]).with_recovery_window(Duration::from_secs(5));
        let t0 = Instant::now();
        pool.mark_failed_at(&Credential::new("a"), "HTTP 401", t0);
        assert_eq!(pool.stats_at(t0 + Duration::from_secs(4)).failed, 1);
        assert_eq!(pool.stats_at(t0 + Duration::from_secs(5)).failed, 0);
    }

    #[test]
    fn test_concurrent_selects_lose_no_cursor_updates() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 300;
        let keys = ["a", "b", "c"];
        let pool = pool(&keys);

        let picks: Vec<String> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        (0..PER_THREAD)
                            .map(|_| pool.select().expose().to_string())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });

        let mut counts: HashMap<String, usize> = HashMap::new();
        for key in picks {
            *counts.entry(key).or_default() += 1;
        }
        for key in keys {
            assert_eq!(counts[key], THREADS * PER_THREAD / keys.len(), "key {}", key);
        }
    }

    #[test]
    fn test_concurrent_marks_keep_stats_consistent() {
        let keys: Vec<String> = (0..6).map(|i| format!("k{}", i)).collect();
        let pool = CredentialPool::new(keys.clone()).unwrap();

        std::thread::scope(|s| {
            for t in 0..6 {
                let pool = &pool;
                let keys = &keys;
                s.spawn(move || {
                    for i in 0..200 {
                        let picked = pool.select();
                        if (i + t) % 3 == 0 {
                            pool.mark_failed(&picked, "HTTP 401");
                        }
                        if i % 7 == 0 {
                            let other = Credential::new(keys[(i + t) % keys.len()].clone());
                            pool.mark_failed(&other, "HTTP 403");
                        }
                        let stats = pool.stats();
                        assert_eq!(stats.total, keys.len());
                        assert_eq!(stats.available + stats.failed, stats.total);
                    }
                });
            }
        });

        let stats = pool.stats();
        assert_eq!(stats.available + stats.failed, 6);
        assert!(stats.failed <= 6);
        // Every failed entry still names a pool member.
        let state = pool.lock();
        assert!(state.failed_at.keys().all(|c| pool.credentials.contains(c)));
    }

    #[test]
    fn test_debug_is_redacted() {
        let printed = format!("{:?}", pool(&["sk-live-secret"]));
        assert!(!printed.contains("sk-live-secret"));
    }
}
