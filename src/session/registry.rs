//! Counts of in-flight sessions per user.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::{Error, Result};

#[derive(Default)]
struct Counts {
    per_user: DashMap<String, usize>,
    total: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct ActiveSessions {
    counts: Arc<Counts>,
    limit: Option<usize>,
}

impl ActiveSessions {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            counts: Arc::default(),
            limit,
        }
    }

    /// Registers a session for `user_id`, refusing it past the per-user cap.
    pub fn acquire(&self, user_id: &str) -> Result<SessionGuard> {
        let mut entry = self.counts.per_user.entry(user_id.to_string()).or_insert(0);
        if let Some(limit) = self.limit
            && *entry >= limit
        {
            return Err(Error::ConcurrencyLimit {
                user_id: user_id.to_string(),
                limit,
            });
        }
        *entry += 1;
        drop(entry);
        self.counts.total.fetch_add(1, Ordering::AcqRel);

        Ok(SessionGuard {
            sessions: self.clone(),
            user_id: user_id.to_string(),
        })
    }

    pub fn count(&self, user_id: &str) -> usize {
        self.counts.per_user.get(user_id).map(|c| *c).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.total.load(Ordering::Acquire)
    }

    fn release(&self, user_id: &str) {
        if let Some(mut count) = self.counts.per_user.get_mut(user_id) {
            *count = count.saturating_sub(1);
        }
        self.counts.per_user.remove_if(user_id, |_, count| *count == 0);
        self.counts.total.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Releases its slot when the owning session task ends.
pub struct SessionGuard {
    sessions: ActiveSessions,
    user_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.release(&self.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_on_drop() {
        let sessions = ActiveSessions::new(None);
        let a = sessions.acquire("u1").unwrap();
        let b = sessions.acquire("u1").unwrap();
        let _c = sessions.acquire("u2").unwrap();
        assert_eq!(sessions.count("u1"), 2);
        assert_eq!(sessions.total(), 3);

        drop(a);
        drop(b);
        assert_eq!(sessions.count("u1"), 0);
        assert_eq!(sessions.total(), 1);
    }

    #[test]
    fn test_per_user_cap() {
        let sessions = ActiveSessions::new(Some(1));
        let first = sessions.acquire("u1").unwrap();
        assert!(matches!(
            sessions.acquire("u1"),
            Err(Error::ConcurrencyLimit { limit: 1, .. })
        ));
        assert!(sessions.acquire("u2").is_ok());

        drop(first);
        assert!(sessions.acquire("u1").is_ok());
    }
}
