//! Hands credential records to virtual users.
//!
//! A run uses one of two modes, chosen once from the whole credential list and
//! the run's total CCU:
//! - [`PoolMode::Exclusive`] when there are at least as many credentials as users.
//!   Each worker draws from its own share, and each credential is locked by the
//!   user holding it until released.
//! - [`PoolMode::Reuse`] otherwise. Every worker draws from the full list in one
//!   run-wide round-robin order, and the same credential is used by several users
//!   at once.
//!
//! The list, the counter and the lock set live in a [`CredentialArbiter`] owned by
//! the run, so ordering and exclusivity hold across every worker of that run.

use crate::model::Credential;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    Exclusive,
    Reuse,
}

type Keyed = Arc<Vec<(String, Credential)>>;

/// Run-scoped state shared by all pools of a run.
#[derive(Debug, Clone)]
pub struct CredentialArbiter {
    all: Keyed,
    mode: PoolMode,
    counter: Arc<AtomicUsize>,
    locked: Arc<Mutex<HashSet<String>>>,
}

impl CredentialArbiter {
    /// Arbiter for a run of `ccu` users over `credentials`.
    pub fn new(credentials: Vec<Credential>, ccu: usize) -> Self {
        let mode = if credentials.len() >= ccu {
            PoolMode::Exclusive
        } else {
            PoolMode::Reuse
        };
        Self {
            all: keyed(credentials),
            mode,
            counter: Arc::default(),
            locked: Arc::default(),
        }
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    /// The pool one worker hands out from. `share` is that worker's slice of the
    /// run's credentials; reuse mode ignores it in favour of the full list.
    pub fn pool(&self, share: Vec<Credential>) -> CredentialPool {
        let credentials = match self.mode {
            PoolMode::Exclusive => keyed(share),
            PoolMode::Reuse => self.all.clone(),
        };
        CredentialPool {
            credentials,
            mode: self.mode,
            arbiter: self.clone(),
        }
    }
}

fn keyed(credentials: Vec<Credential>) -> Keyed {
    Arc::new(credentials.into_iter().map(|c| (identity(&c), c)).collect())
}

fn identity(credential: &Credential) -> String {
    serde_json::Value::Object(credential.clone()).to_string()
}

#[derive(Debug, Clone)]
pub struct CredentialPool {
    credentials: Keyed,
    mode: PoolMode,
    arbiter: CredentialArbiter,
}

impl CredentialPool {
    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// `None` means the exclusive pool is momentarily exhausted, or the pool is empty.
    pub fn acquire(&self) -> Option<Credential> {
        if self.credentials.is_empty() {
            return None;
        }
        match self.mode {
            PoolMode::Reuse => {
                let n = self.arbiter.counter.fetch_add(1, Ordering::SeqCst);
                Some(self.credentials[n % self.credentials.len()].1.clone())
            }
            PoolMode::Exclusive => {
                let mut locked = self.arbiter.locked.lock();
                let (key, cred) = self
                    .credentials
                    .iter()
                    .find(|(key, _)| !locked.contains(key.as_str()))?;
                locked.insert(key.clone());
                Some(cred.clone())
            }
        }
    }

    pub fn release(&self, credential: &Credential) {
        if self.mode == PoolMode::Exclusive {
            self.arbiter.locked.lock().remove(&identity(credential));
        }
    }

    /// Credentials not currently locked.
    pub fn available(&self) -> usize {
        match self.mode {
            PoolMode::Reuse => self.credentials.len(),
            PoolMode::Exclusive => {
                let locked = self.arbiter.locked.lock();
                self.credentials
                    .iter()
                    .filter(|(key, _)| !locked.contains(key.as_str()))
                    .count()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cred(name: &str) -> Credential {
        json!({ "username": name }).as_object().cloned().unwrap()
    }

    fn name(c: &Credential) -> &str {
        c["username"].as_str().unwrap()
    }

    fn both(names: &[&str]) -> Vec<Credential> {
        names.iter().map(|n| cred(n)).collect()
    }

    #[test]
    fn mode_follows_run_size() {
        assert_eq!(CredentialArbiter::new(both(&["A", "B"]), 2).mode(), PoolMode::Exclusive);
        assert_eq!(CredentialArbiter::new(both(&["A", "B"]), 5).mode(), PoolMode::Reuse);
    }

    #[test]
    fn reuse_is_round_robin() {
        let pool = CredentialArbiter::new(both(&["A", "B"]), 5).pool(both(&["A", "B"]));
        let names: Vec<String> = (0..5)
            .map(|_| name(&pool.acquire().unwrap()).to_string())
            .collect();
        assert_eq!(names, ["A", "B", "A", "B", "A"]);
    }

    #[test]
    fn reuse_order_spans_workers_with_different_shares() {
        let all = both(&["A", "B", "C", "D"]);
        let arbiter = CredentialArbiter::new(all, 6);
        let first = arbiter.pool(both(&["A", "C"]));
        let second = arbiter.pool(both(&["B", "D"]));

        let mut handed = Vec::new();
        for _ in 0..3 {
            handed.push(name(&first.acquire().unwrap()).to_string());
            handed.push(name(&second.acquire().unwrap()).to_string());
        }
        assert_eq!(handed, ["A", "B", "C", "D", "A", "B"]);
    }

    #[test]
    fn exclusive_never_hands_out_the_same_credential_twice() {
        let pool = CredentialArbiter::new(both(&["A", "B"]), 2).pool(both(&["A", "B"]));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || pool.acquire())
            })
            .collect();
        let mut got: Vec<String> = handles
            .into_iter()
            .map(|h| name(&h.join().unwrap().unwrap()).to_string())
            .collect();
        got.sort();
        assert_eq!(got, ["A", "B"]);
        assert_eq!(pool.available(), 0);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn exclusive_pools_only_see_their_share() {
        let arbiter = CredentialArbiter::new(both(&["A", "B"]), 2);
        let first = arbiter.pool(both(&["A"]));
        let second = arbiter.pool(both(&["B"]));
        assert_eq!(name(&first.acquire().unwrap()), "A");
        assert!(first.acquire().is_none());
        assert_eq!(name(&second.acquire().unwrap()), "B");
    }

    #[test]
    fn release_makes_credential_acquirable_again() {
        let pool = CredentialArbiter::new(both(&["A", "B"]), 2).pool(both(&["A", "B"]));
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert_eq!(name(&a), "A");

        pool.release(&a);
        assert_eq!(pool.available(), 1);
        assert_eq!(name(&pool.acquire().unwrap()), "A");
    }

    #[test]
    fn exclusive_locks_span_pools_of_one_run() {
        let arbiter = CredentialArbiter::new(both(&["A"]), 1);
        let first = arbiter.pool(both(&["A"]));
        let second = arbiter.pool(both(&["A"]));
        assert!(first.acquire().is_some());
        assert!(second.acquire().is_none());
    }

    #[test]
    fn empty_pool_yields_nothing() {
        let pool = CredentialArbiter::new(vec![], 3).pool(vec![]);
        assert!(pool.is_empty());
        assert!(pool.acquire().is_none());
    }
}
