//! Lifecycle gate serializing registry shutdown.
//!
//! Every public registry operation passes through [`LifecycleGate::require_open`]
//! before touching the cache, and `close` is sequenced so that exactly one
//! caller performs the drain while concurrent callers block until the gate
//! reaches a terminal state.

use parking_lot::{Condvar, Mutex};

use crate::error::{RegistryError, RegistryResult};

/// Lifecycle state of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Accepting operations.
    Open,
    /// A close is in progress; new operations are rejected.
    Closing,
    /// Closed cleanly. Terminal.
    Closed,
    /// Close failed; the registry is unusable. Terminal.
    Error,
}

/// Outcome of [`LifecycleGate::begin_close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseRole {
    /// The caller won the race and must drain, then call `finish_close`.
    Drainer,
    /// Another caller already closed the gate cleanly.
    AlreadyClosed,
}

/// Mutex-and-condvar gate over [`GateState`].
#[derive(Debug)]
pub struct LifecycleGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Default for LifecycleGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleGate {
    /// Creates an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Open),
            cond: Condvar::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> GateState {
        *self.state.lock()
    }

    /// Fails unless the gate is open.
    ///
    /// A closing gate already rejects new work, so `Closing` reports the
    /// same error as `Closed`.
    pub fn require_open(&self) -> RegistryResult<()> {
        match *self.state.lock() {
            GateState::Open => Ok(()),
            GateState::Closing | GateState::Closed => Err(RegistryError::Closed),
            GateState::Error => Err(RegistryError::failed(
                "registry did not shut down cleanly",
            )),
        }
    }

    /// Claims or waits out the close.
    ///
    /// The first caller on an open gate flips it to `Closing` and becomes
    /// the drainer. Everyone else blocks until the drainer publishes a
    /// terminal state and then observes the same outcome the drainer saw.
    pub fn begin_close(&self) -> RegistryResult<CloseRole> {
        let mut state = self.state.lock();
        loop {
            match *state {
                GateState::Open => {
                    *state = GateState::Closing;
                    return Ok(CloseRole::Drainer);
                }
                GateState::Closing => self.cond.wait(&mut state),
                GateState::Closed => return Ok(CloseRole::AlreadyClosed),
                GateState::Error => {
                    return Err(RegistryError::failed(
                        "registry did not shut down cleanly",
                    ))
                }
            }
        }
    }

    /// Publishes the drain outcome and wakes every waiting closer.
    ///
    /// Only the caller that received [`CloseRole::Drainer`] may call this.
    pub fn finish_close(&self, ok: bool) {
        let mut state = self.state.lock();
        debug_assert_eq!(*state, GateState::Closing);
        *state = if ok { GateState::Closed } else { GateState::Error };
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn open_gate_admits_operations() {
        let gate = LifecycleGate::new();
        assert_eq!(gate.state(), GateState::Open);
        assert!(gate.require_open().is_ok());
    }

    #[test]
    fn closing_gate_rejects_operations() {
        let gate = LifecycleGate::new();
        assert_eq!(gate.begin_close().unwrap(), CloseRole::Drainer);
        assert!(matches!(gate.require_open(), Err(RegistryError::Closed)));

        gate.finish_close(true);
        assert_eq!(gate.state(), GateState::Closed);
        assert!(matches!(gate.require_open(), Err(RegistryError::Closed)));
    }

    #[test]
    fn failed_close_is_terminal_error() {
        let gate = LifecycleGate::new();
        assert_eq!(gate.begin_close().unwrap(), CloseRole::Drainer);
        gate.finish_close(false);

        assert_eq!(gate.state(), GateState::Error);
        assert!(matches!(
            gate.require_open(),
            Err(RegistryError::Failed { .. })
        ));
        assert!(matches!(
            gate.begin_close(),
            Err(RegistryError::Failed { .. })
        ));
    }

    #[test]
    fn second_close_after_success_is_a_no_op() {
        let gate = LifecycleGate::new();
        assert_eq!(gate.begin_close().unwrap(), CloseRole::Drainer);
        gate.finish_close(true);
        assert_eq!(gate.begin_close().unwrap(), CloseRole::AlreadyClosed);
    }

    #[test]
    fn concurrent_closers_block_until_the_drainer_finishes() {
        let gate = Arc::new(LifecycleGate::new());
        assert_eq!(gate.begin_close().unwrap(), CloseRole::Drainer);

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.begin_close())
            })
            .collect();

        // Give the waiters time to park on the condvar.
        thread::sleep(Duration::from_millis(50));
        gate.finish_close(true);

        for handle in waiters {
            assert_eq!(handle.join().unwrap().unwrap(), CloseRole::AlreadyClosed);
        }
    }

    #[test]
    fn concurrent_closers_observe_the_drainer_failure() {
        let gate = Arc::new(LifecycleGate::new());
        assert_eq!(gate.begin_close().unwrap(), CloseRole::Drainer);

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.begin_close())
        };

        thread::sleep(Duration::from_millis(50));
        gate.finish_close(false);

        assert!(matches!(
            waiter.join().unwrap(),
            Err(RegistryError::Failed { .. })
        ));
    }
}
