//! Session-scoped uid generator for worker identities.

use std::sync::Mutex;

use crate::core::identity::MAX_UID;
use crate::error::IdentityError;

/// Strictly increasing uid source, shared by reference among creation sites.
///
/// The next value is checkpointed by the caller (see `io::session`) so a
/// resumed session never reissues a uid already in use.
#[derive(Debug)]
pub struct UidCounter {
    next: Mutex<u32>,
}

impl Default for UidCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl UidCounter {
    pub fn new() -> Self {
        Self {
            next: Mutex::new(1),
        }
    }

    /// Resume from a checkpointed next value.
    pub fn starting_at(next: u32) -> Self {
        Self {
            next: Mutex::new(next.max(1)),
        }
    }

    /// Issue the next uid.
    pub fn issue(&self) -> Result<u32, IdentityError> {
        let mut next = self.lock();
        let uid = *next;
        if uid > MAX_UID {
            return Err(IdentityError::UidExhausted { max: MAX_UID });
        }
        *next = uid + 1;
        Ok(uid)
    }

    /// The value the next call to [`issue`](Self::issue) will return.
    pub fn peek(&self) -> u32 {
        *self.lock()
    }

    /// Restore a checkpoint. Never moves the counter backwards past values
    /// already issued in this process.
    pub fn restore(&self, next: u32) {
        let mut current = self.lock();
        *current = (*current).max(next).max(1);
    }

    /// Record an existing uid (e.g. found on disk) so it is never reissued.
    pub fn observe(&self, uid: u32) {
        let mut current = self.lock();
        if uid >= *current {
            *current = uid.saturating_add(1);
        }
    }

    /// Start a fresh session.
    pub fn reset(&self) {
        *self.lock() = 1;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, u32> {
        // A poisoned counter still holds a valid u32.
        self.next.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn issues_strictly_increasing_from_one() {
        let counter = UidCounter::new();
        assert_eq!(counter.issue().expect("uid"), 1);
        assert_eq!(counter.issue().expect("uid"), 2);
        assert_eq!(counter.peek(), 3);
    }

    #[test]
    fn observe_and_restore_keep_issued_uids_below_next() {
        let counter = UidCounter::new();
        counter.observe(41);
        assert_eq!(counter.peek(), 42);
        counter.observe(5);
        assert_eq!(counter.peek(), 42);
        counter.restore(10);
        assert_eq!(counter.peek(), 42);
        counter.restore(100);
        assert_eq!(counter.issue().expect("uid"), 100);
    }

    #[test]
    fn reset_starts_a_new_session() {
        let counter = UidCounter::starting_at(77);
        counter.reset();
        assert_eq!(counter.issue().expect("uid"), 1);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let counter = UidCounter::starting_at(MAX_UID);
        assert_eq!(counter.issue().expect("last uid"), MAX_UID);
        assert!(matches!(
            counter.issue(),
            Err(IdentityError::UidExhausted { .. })
        ));
    }

    #[test]
    fn concurrent_issue_never_duplicates() {
        let counter = Arc::new(UidCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    (0..200)
                        .map(|_| counter.issue().expect("uid"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for uid in handle.join().expect("join") {
                assert!(seen.insert(uid), "uid {uid} issued twice");
            }
        }
        assert_eq!(seen.len(), 1600);
        assert_eq!(counter.peek(), 1601);
    }
}
