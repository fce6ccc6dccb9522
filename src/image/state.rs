//! The per-image lifecycle state machine (§3 Lifecycle, §4.6).
//!
//! ```text
//! mapped -> dependentsMapped -> rebased -> bound ->
//!     dependentsInited -> beingInited -> inited
//! ```
//! `terminated` is reached only via GC, after `inited`.
//!
//! Transitions are modeled as an atomic compare-and-swap over a `u8` so
//! that "am I already past this point" checks (used to break cycles in
//! `recursiveLoadLibraries`/`recursiveInitialization`-style walks) never
//! need to take the image's own lock.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ImageState {
    Mapped = 0,
    DependentsMapped = 1,
    Rebased = 2,
    Bound = 3,
    DependentsInited = 4,
    BeingInited = 5,
    Inited = 6,
    Terminated = 7,
}

impl ImageState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Mapped,
            1 => Self::DependentsMapped,
            2 => Self::Rebased,
            3 => Self::Bound,
            4 => Self::DependentsInited,
            5 => Self::BeingInited,
            6 => Self::Inited,
            _ => Self::Terminated,
        }
    }
}

/// Atomic holder for an [`ImageState`], exposing the monotonic,
/// CAS-guarded transitions the loader relies on to break cycles.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(initial: ImageState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn get(&self) -> ImageState {
        ImageState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Attempts to move the state forward to `next` if the current state
    /// is `< next`. Returns `true` if this call performed the transition
    /// (the caller "owns" whatever follows), `false` if some other caller
    /// already did (or is doing) it -- used to implement the
    /// "break cycles" idiom throughout §4.5/§4.6.
    pub fn advance_if_below(&self, next: ImageState) -> bool {
        loop {
            let cur = self.0.load(Ordering::Acquire);
            if cur >= next as u8 {
                return false;
            }
            if self
                .0
                .compare_exchange_weak(cur, next as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Unconditionally sets the state forward. Used once a transition's
    /// precondition has already been established by the caller (e.g.
    /// after `advance_if_below` claimed ownership of a phase).
    pub fn set(&self, next: ImageState) {
        self.0.store(next as u8, Ordering::Release);
    }

    /// Reverts to `prior`. Used to unwind a partial `dlopen` (§7
    /// Propagation) when a later phase fails.
    pub fn revert(&self, prior: ImageState) {
        self.0.store(prior as u8, Ordering::Release);
    }

    pub fn at_least(&self, target: ImageState) -> bool {
        self.get() >= target
    }
}

/// Per-image recursive lock guarding initializer execution (§4.6 "Per-image
/// initializer recursion is guarded by a thread-owned recursive lock so
/// that an initializer that `dlopen`s a library already being
/// initialized on the same thread proceeds without deadlock, while a
/// second thread blocks").
///
/// `parking_lot` has no built-in reentrant mutex that also exposes
/// "was this reentrant" to the caller, so this tracks the owning thread
/// and a recursion depth by hand.
#[derive(Default)]
pub struct InitLock {
    state: Mutex<Option<(ThreadId, u32)>>,
    released: Condvar,
}

/// What [`InitLock::enter`] discovered: whether the caller now owns the
/// section and must run the initializer, or is re-entering from the
/// same thread and must treat the call as a no-op (§4.6 cycle rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitLockEntry {
    Owns,
    Reentrant,
}

impl InitLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until this thread either acquires the lock fresh or
    /// discovers it already owns it reentrantly. A different thread
    /// that finds the lock held blocks until [`InitLock::exit`] releases it.
    pub fn enter(&self) -> InitLockEntry {
        let this = std::thread::current().id();
        let mut guard = self.state.lock();
        loop {
            match *guard {
                None => {
                    *guard = Some((this, 1));
                    return InitLockEntry::Owns;
                }
                Some((owner, depth)) if owner == this => {
                    *guard = Some((owner, depth + 1));
                    return InitLockEntry::Reentrant;
                }
                Some(_) => self.released.wait(&mut guard),
            }
        }
    }

    pub fn exit(&self) {
        let this = std::thread::current().id();
        let mut guard = self.state.lock();
        match *guard {
            Some((owner, depth)) if owner == this && depth > 1 => {
                *guard = Some((owner, depth - 1));
            }
            Some((owner, _)) if owner == this => {
                *guard = None;
                self.released.notify_all();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_lock_is_reentrant_on_same_thread() {
        let lock = InitLock::new();
        assert_eq!(lock.enter(), InitLockEntry::Owns);
        assert_eq!(lock.enter(), InitLockEntry::Reentrant);
        lock.exit();
        lock.exit();
        // Fully released: a fresh enter owns again.
        assert_eq!(lock.enter(), InitLockEntry::Owns);
        lock.exit();
    }

    #[test]
    fn advance_if_below_is_one_shot() {
        let cell = StateCell::new(ImageState::Mapped);
        assert!(cell.advance_if_below(ImageState::DependentsMapped));
        assert!(!cell.advance_if_below(ImageState::DependentsMapped));
        assert_eq!(cell.get(), ImageState::DependentsMapped);
    }

    #[test]
    fn ordering_is_total() {
        assert!(ImageState::Mapped < ImageState::Bound);
        assert!(ImageState::BeingInited < ImageState::Inited);
        assert!(ImageState::Inited < ImageState::Terminated);
    }
}
