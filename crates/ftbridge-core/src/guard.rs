//! Interface claim lifetime.
//!
//! A [`ClaimGuard`] owns a claimed interface together with the bulk pipes
//! opened on it, and gives the claim back exactly once: on explicit release,
//! or when the guard is dropped. The pipes are shut down before the interface
//! is released, since an open endpoint keeps the claim alive. Release errors
//! are logged and discarded. The [`ReleaseRegistry`] keeps weak references to
//! every live guard so a context shutdown can release claims whose owner
//! was leaked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::pipe::LazyPipe;
use crate::transport::UsbInterface;

/// Type-erased release hook held by the registry.
pub(crate) trait Releasable: Send + Sync {
    fn release_claim(&self) -> bool;
    fn is_released(&self) -> bool;
    fn label(&self) -> &str;
}

struct ClaimState<I: UsbInterface> {
    write_pipe: LazyPipe<I::OutPipe>,
    read_pipe: LazyPipe<I::InPipe>,
    interface: I,
    released: AtomicBool,
    grace: Duration,
    label: String,
}

impl<I: UsbInterface> Releasable for ClaimState<I> {
    fn release_claim(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.write_pipe.shutdown();
        self.read_pipe.shutdown();
        if let Err(e) = self.interface.release() {
            debug!(device = %self.label, error = %e, "Interface release failed (ignored)");
        }
        thread::sleep(self.grace);
        true
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Owner of one interface claim.
pub struct ClaimGuard<I: UsbInterface> {
    state: Arc<ClaimState<I>>,
}

impl<I: UsbInterface> ClaimGuard<I> {
    /// Guard that sleeps `grace` after giving the claim back.
    pub fn with_grace(interface: I, label: impl Into<String>, grace: Duration) -> Self {
        Self {
            state: Arc::new(ClaimState {
                write_pipe: LazyPipe::new(),
                read_pipe: LazyPipe::new(),
                interface,
                released: AtomicBool::new(false),
                grace,
                label: label.into(),
            }),
        }
    }

    pub fn interface(&self) -> &I {
        &self.state.interface
    }

    pub(crate) fn write_pipe(&self) -> &LazyPipe<I::OutPipe> {
        &self.state.write_pipe
    }

    pub(crate) fn read_pipe(&self) -> &LazyPipe<I::InPipe> {
        &self.state.read_pipe
    }

    /// Release the claim. Returns `false` if it was already released.
    pub fn release(&self) -> bool {
        self.state.release_claim()
    }

    pub fn is_released(&self) -> bool {
        self.state.is_released()
    }

    pub(crate) fn hook(&self) -> Weak<dyn Releasable> {
        let weak: Weak<ClaimState<I>> = Arc::downgrade(&self.state);
        weak
    }
}

impl<I: UsbInterface> Drop for ClaimGuard<I> {
    fn drop(&mut self) {
        if !self.state.is_released() {
            debug!(device = %self.state.label, "Releasing claim on drop");
            self.state.release_claim();
        }
    }
}

/// Fallback release hooks for claims that outlive their owning scope.
#[derive(Default)]
pub struct ReleaseRegistry {
    hooks: Mutex<Vec<Weak<dyn Releasable>>>,
}

impl ReleaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, hook: Weak<dyn Releasable>) {
        let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        hooks.retain(|h| h.strong_count() > 0);
        hooks.push(hook);
    }

    /// Number of registered claims still held.
    pub fn active(&self) -> usize {
        let hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        hooks
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|h| !h.is_released())
            .count()
    }

    /// Release every claim still held. Returns how many were released.
    pub fn release_all(&self) -> usize {
        let hooks: Vec<_> = {
            let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
            hooks.drain(..).collect()
        };

        let mut released = 0;
        for hook in hooks.iter().filter_map(Weak::upgrade) {
            if hook.is_released() {
                continue;
            }
            warn!(device = %hook.label(), "Releasing claim left open at shutdown");
            if hook.release_claim() {
                released += 1;
            }
        }
        released
    }
}
