//! Single-flight gate for update sessions.
//!
//! Every update path (browser upload, push from a companion tool) goes through
//! the same [`SessionGuard`], so two updates can never write the flash region
//! at the same time.

use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Grants at most one [`SessionPermit`] at a time.
///
/// Cloning the guard shares the same gate.
#[derive(Debug, Clone, Default)]
pub struct SessionGuard {
    active: Arc<AtomicBool>,
}

impl SessionGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a session as in progress, unless one already is.
    ///
    /// Returns `None` when another permit is outstanding. The caller must
    /// reject the new request without touching the flash region.
    #[must_use]
    pub fn try_acquire(&self) -> Option<SessionPermit> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| {
                debug!("Session guard: acquired");
                SessionPermit {
                    active: Arc::clone(&self.active),
                }
            })
    }

    /// Whether a permit is currently outstanding.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Proof of exclusive access to the update path.
///
/// Released by [`SessionPermit::release`] or when dropped.
#[derive(Debug)]
pub struct SessionPermit {
    active: Arc<AtomicBool>,
}

impl SessionPermit {
    /// Give the gate back.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
        debug!("Session guard: released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_permit() {
        let guard = SessionGuard::new();
        assert!(!guard.is_active());

        let permit = guard.try_acquire().expect("first acquire");
        assert!(guard.is_active());
        assert!(guard.try_acquire().is_none());
        assert!(guard.try_acquire().is_none());

        permit.release();
        assert!(!guard.is_active());
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn test_drop_releases() {
        let guard = SessionGuard::new();
        {
            let _permit = guard.try_acquire().unwrap();
            assert!(guard.is_active());
        }
        assert!(!guard.is_active());
    }

    #[test]
    fn test_clones_share_state() {
        let guard = SessionGuard::new();
        let other = guard.clone();
        let permit = guard.try_acquire().unwrap();
        assert!(other.is_active());
        assert!(other.try_acquire().is_none());
        drop(permit);
        assert!(other.try_acquire().is_some());
    }

    #[test]
    fn test_contended_acquire_across_threads() {
        let guard = SessionGuard::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = guard.clone();
                std::thread::spawn(move || guard.try_acquire().map(std::mem::forget).is_some())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 1);
    }
}
