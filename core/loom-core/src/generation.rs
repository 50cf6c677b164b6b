//! Latest-wins operation tokens and the resume/fork in-flight slot.
//!
//! Every lifecycle operation takes a token before its first await. When a newer
//! operation begins (or the view unmounts) older tokens go stale, and their
//! continuations must stop before touching session state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, SessionError};

#[derive(Debug, Clone)]
pub struct GenerationCounter {
    current: Arc<AtomicU64>,
    mounted: Arc<AtomicBool>,
}

impl Default for GenerationCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self {
            current: Arc::new(AtomicU64::new(0)),
            mounted: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Starts a new operation, superseding every outstanding token.
    pub fn begin(&self) -> OperationToken {
        let generation = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        OperationToken {
            generation,
            current: Arc::clone(&self.current),
            mounted: Arc::clone(&self.mounted),
        }
    }

    /// Supersedes outstanding tokens without starting anything.
    pub fn invalidate(&self) {
        self.current.fetch_add(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn unmount(&self) {
        self.mounted.store(false, Ordering::SeqCst);
        self.invalidate();
    }

    pub fn mount(&self) {
        self.mounted.store(true, Ordering::SeqCst);
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct OperationToken {
    generation: u64,
    current: Arc<AtomicU64>,
    mounted: Arc<AtomicBool>,
}

impl OperationToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
            && self.current.load(Ordering::SeqCst) == self.generation
    }

    /// Checked after every await; a stale token aborts the continuation.
    pub fn ensure_current(&self) -> Result<()> {
        if !self.mounted.load(Ordering::SeqCst) {
            return Err(SessionError::Unmounted);
        }
        if self.current.load(Ordering::SeqCst) != self.generation {
            return Err(SessionError::Superseded);
        }
        Ok(())
    }
}

/// Admits at most one resume or fork at a time.
#[derive(Debug, Clone, Default)]
pub struct InFlightSlot {
    busy: Arc<AtomicBool>,
}

impl InFlightSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Result<InFlightPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SessionError::OperationInFlight)?;
        Ok(InFlightPermit {
            busy: Arc::clone(&self.busy),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

/// Releases the slot on drop, on every exit path.
#[derive(Debug)]
pub struct InFlightPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_operation_supersedes_older_token() {
        let counter = GenerationCounter::new();
        let first = counter.begin();
        assert!(first.ensure_current().is_ok());

        let second = counter.begin();
        assert!(matches!(first.ensure_current(), Err(SessionError::Superseded)));
        assert!(second.is_current());
    }

    #[test]
    fn unmount_stales_every_token() {
        let counter = GenerationCounter::new();
        let token = counter.begin();
        counter.unmount();
        assert!(matches!(token.ensure_current(), Err(SessionError::Unmounted)));

        counter.mount();
        assert!(counter.begin().is_current());
    }

    #[test]
    fn in_flight_slot_admits_one_and_releases_on_drop() {
        let slot = InFlightSlot::new();
        let permit = slot.try_acquire().expect("first permit");
        assert!(matches!(
            slot.try_acquire(),
            Err(SessionError::OperationInFlight)
        ));
        drop(permit);
        assert!(!slot.is_busy());
        assert!(slot.try_acquire().is_ok());
    }
}
