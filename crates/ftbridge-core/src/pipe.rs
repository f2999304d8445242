//! Lazily opened bulk pipe.
//!
//! The pipe moves `Closed -> Opening -> Open` under a mutex. Only the
//! caller that observed `Closed` performs the open; concurrent callers wait
//! on the condition variable until the pipe is `Open` or back to `Closed`.
//!
//! [`LazyPipe::shutdown`] is terminal. An open still in flight when it runs
//! drops its pipe on completion instead of storing it, and `shutdown` does
//! not return until that has happened.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::transport::TransportError;

enum PipeState<P> {
    Closed,
    Opening,
    Open(P),
    /// Shutdown requested while an open was in flight.
    Closing,
    Shutdown,
}

pub(crate) struct LazyPipe<P> {
    state: Mutex<PipeState<P>>,
    ready: Condvar,
}

impl<P> LazyPipe<P> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PipeState::Closed),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipeState<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, state: MutexGuard<'a, PipeState<P>>) -> MutexGuard<'a, PipeState<P>> {
        self.ready.wait(state).unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `transfer` on the pipe, opening it with `open` on first use.
    ///
    /// The pipe lock is held for the duration of the transfer. Fails with
    /// `NotClaimed` once the pipe has been shut down.
    pub(crate) fn with<T>(
        &self,
        open: impl FnOnce() -> Result<P, TransportError>,
        transfer: impl FnOnce(&mut P) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut state = self.lock();
        loop {
            match &mut *state {
                PipeState::Open(pipe) => return transfer(pipe),
                PipeState::Opening | PipeState::Closing => state = self.wait(state),
                PipeState::Shutdown => return Err(TransportError::NotClaimed),
                PipeState::Closed => {
                    *state = PipeState::Opening;
                    drop(state);

                    let opened = open();

                    state = self.lock();
                    if matches!(*state, PipeState::Closing) {
                        drop(opened);
                        *state = PipeState::Shutdown;
                        self.ready.notify_all();
                        return Err(TransportError::NotClaimed);
                    }
                    return match opened {
                        Ok(mut pipe) => {
                            let result = transfer(&mut pipe);
                            *state = PipeState::Open(pipe);
                            self.ready.notify_all();
                            result
                        }
                        Err(e) => {
                            *state = PipeState::Closed;
                            self.ready.notify_all();
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    /// Drop the pipe for good. Waits for an in-flight open to finish.
    /// Returns whether a pipe was open.
    pub(crate) fn shutdown(&self) -> bool {
        let mut state = self.lock();
        loop {
            match *state {
                PipeState::Opening => {
                    *state = PipeState::Closing;
                    state = self.wait(state);
                }
                PipeState::Closing => state = self.wait(state),
                _ => break,
            }
        }
        let previous = std::mem::replace(&mut *state, PipeState::Shutdown);
        self.ready.notify_all();
        matches!(previous, PipeState::Open(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn busy() -> TransportError {
        TransportError::Busy { interface: 0 }
    }

    #[test]
    fn test_opens_once() {
        let pipe: LazyPipe<u32> = LazyPipe::new();
        let opens = AtomicUsize::new(0);
        let open = || {
            opens.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        };

        assert_eq!(pipe.with(open, |p| Ok(*p)), Ok(7));
        assert_eq!(pipe.with(open, |p| Ok(*p + 1)), Ok(8));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_open_returns_to_closed() {
        let pipe: LazyPipe<u32> = LazyPipe::new();
        assert_eq!(pipe.with(|| Err(busy()), |p| Ok(*p)), Err(busy()));
        assert_eq!(pipe.with(|| Ok(1), |p| Ok(*p)), Ok(1));
    }

    #[test]
    fn test_concurrent_first_use() {
        let pipe: LazyPipe<u32> = LazyPipe::new();
        let opens = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let open = || {
                        opens.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        Ok(1)
                    };
                    pipe.with(open, |p| {
                        *p += 1;
                        Ok(())
                    })
                    .unwrap();
                });
            }
        });

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(pipe.with(|| Ok(0), |p| Ok(*p)), Ok(9));
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let pipe: LazyPipe<u32> = LazyPipe::new();
        pipe.with(|| Ok(1), |_| Ok(())).unwrap();
        assert!(pipe.shutdown());
        assert!(!pipe.shutdown());

        let opened = AtomicUsize::new(0);
        let result = pipe.with(
            || {
                opened.fetch_add(1, Ordering::SeqCst);
                Ok(5)
            },
            |p| Ok(*p),
        );
        assert_eq!(result, Err(TransportError::NotClaimed));
        assert_eq!(opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_during_open_drops_new_pipe() {
        struct Tracked<'a>(&'a AtomicUsize);
        impl Drop for Tracked<'_> {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = AtomicUsize::new(0);
        let transfers = AtomicUsize::new(0);
        let pipe: LazyPipe<Tracked<'_>> = LazyPipe::new();
        let (started_tx, started_rx) = mpsc::channel();

        thread::scope(|s| {
            let opener = s.spawn(|| {
                pipe.with(
                    || {
                        started_tx.send(()).unwrap();
                        thread::sleep(Duration::from_millis(100));
                        Ok(Tracked(&dropped))
                    },
                    |_| {
                        transfers.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                )
            });

            started_rx.recv().unwrap();
            assert!(!pipe.shutdown());
            // The opener has finished with its pipe by the time shutdown returns.
            assert_eq!(dropped.load(Ordering::SeqCst), 1);
            assert_eq!(opener.join().unwrap(), Err(TransportError::NotClaimed));
        });

        assert_eq!(transfers.load(Ordering::SeqCst), 0);
        assert_eq!(
            pipe.with(|| Ok(Tracked(&dropped)), |_| Ok(())),
            Err(TransportError::NotClaimed)
        );
    }
}
