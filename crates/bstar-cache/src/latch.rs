//! Per-node lock state machine.
//!
//! Three acquisition modes share one latch:
//! - Read: any number of holders, blocked by a writer or a pending upgrade
//! - Reserve: at most one holder, coexists with readers
//! - Write: a reservation upgraded once every reader has left
//!
//! Waiters sleep on one of two condition variables. `access` wakes threads
//! waiting to read or reserve; `write` wakes the reserving thread waiting for
//! readers to drain.

use parking_lot::{Condvar, Mutex};

/// Lock mode held on a node by a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Referenced but not latched.
    None,
    /// Shared access.
    Read,
    /// Intent to write. Excludes other reservations, admits readers.
    Reserve,
    /// Exclusive access.
    Write,
}

#[derive(Debug, Default)]
struct LatchState {
    readers: u32,
    reserved: bool,
    exclusive: bool,
    awaiting_write: u32,
}

/// Snapshot of a latch, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatchSnapshot {
    pub readers: u32,
    pub reserved: bool,
    pub exclusive: bool,
}

/// Blocking latch implementing the Read / Reserve / Write protocol.
#[derive(Debug, Default)]
pub struct NodeLatch {
    state: Mutex<LatchState>,
    access: Condvar,
    write: Condvar,
}

impl NodeLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `mode` from an unlatched state, blocking while incompatible.
    pub fn acquire(&self, mode: LockMode) {
        match mode {
            LockMode::None => {}
            LockMode::Read => {
                let mut state = self.state.lock();
                while state.exclusive || state.awaiting_write > 0 {
                    self.access.wait(&mut state);
                }
                state.readers += 1;
            }
            LockMode::Reserve => {
                let mut state = self.state.lock();
                while state.reserved {
                    self.access.wait(&mut state);
                }
                state.reserved = true;
            }
            LockMode::Write => {
                self.acquire(LockMode::Reserve);
                self.upgrade();
            }
        }
    }

    /// Tries to acquire `mode` without blocking.
    #[cfg(test)]
    pub(crate) fn try_acquire(&self, mode: LockMode) -> bool {
        let mut state = self.state.lock();
        match mode {
            LockMode::None => true,
            LockMode::Read => {
                if state.exclusive || state.awaiting_write > 0 {
                    return false;
                }
                state.readers += 1;
                true
            }
            LockMode::Reserve => {
                if state.reserved {
                    return false;
                }
                state.reserved = true;
                true
            }
            LockMode::Write => {
                if state.reserved || state.readers > 0 {
                    return false;
                }
                state.reserved = true;
                state.exclusive = true;
                true
            }
        }
    }

    /// Turns a held reservation into exclusive access.
    fn upgrade(&self) {
        let mut state = self.state.lock();
        assert!(
            state.reserved && !state.exclusive,
            "latch upgrade without a reservation"
        );
        state.awaiting_write += 1;
        while state.readers > 0 {
            self.write.wait(&mut state);
        }
        state.awaiting_write -= 1;
        state.exclusive = true;
    }

    /// Releases a held `mode`.
    ///
    /// Panics if the latch does not hold that mode; that can only happen
    /// through a reference-counting bug.
    pub fn release(&self, mode: LockMode) {
        match mode {
            LockMode::None => {}
            LockMode::Read => {
                let mut state = self.state.lock();
                assert!(state.readers > 0, "read latch released with no readers");
                state.readers -= 1;
                if state.readers == 0 && state.awaiting_write > 0 {
                    self.write.notify_all();
                }
            }
            LockMode::Reserve | LockMode::Write => {
                let mut state = self.state.lock();
                assert!(state.reserved, "{:?} latch released while not held", mode);
                state.reserved = false;
                state.exclusive = false;
                drop(state);
                self.access.notify_all();
            }
        }
    }

    /// Moves a holder from `from` to `to`.
    ///
    /// Reserve to Write waits for readers to drain. Write to Reserve and
    /// Write to Read downgrade in place. Read to Reserve or Write is not
    /// atomic: the read latch is dropped before the new mode is requested.
    pub fn transition(&self, from: LockMode, to: LockMode) {
        if from == to {
            return;
        }
        match (from, to) {
            (LockMode::None, _) => self.acquire(to),
            (_, LockMode::None) => self.release(from),
            (LockMode::Reserve, LockMode::Write) => self.upgrade(),
            (LockMode::Reserve, LockMode::Read) => {
                self.acquire(LockMode::Read);
                self.release(LockMode::Reserve);
            }
            (LockMode::Write, LockMode::Reserve) => {
                let mut state = self.state.lock();
                state.exclusive = false;
                drop(state);
                self.access.notify_all();
            }
            (LockMode::Write, LockMode::Read) => {
                let mut state = self.state.lock();
                state.exclusive = false;
                state.reserved = false;
                state.readers += 1;
                drop(state);
                self.access.notify_all();
            }
            (LockMode::Read, _) => {
                self.release(LockMode::Read);
                self.acquire(to);
            }
            _ => unreachable!("identical modes handled above"),
        }
    }

    pub fn snapshot(&self) -> LatchSnapshot {
        let state = self.state.lock();
        LatchSnapshot {
            readers: state.readers,
            reserved: state.reserved,
            exclusive: state.exclusive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_readers_share() {
        let latch = NodeLatch::new();
        latch.acquire(LockMode::Read);
        latch.acquire(LockMode::Read);
        assert_eq!(latch.snapshot().readers, 2);
        latch.release(LockMode::Read);
        latch.release(LockMode::Read);
        assert_eq!(latch.snapshot().readers, 0);
    }

    #[test]
    fn test_reserve_admits_readers() {
        let latch = NodeLatch::new();
        latch.acquire(LockMode::Reserve);
        assert!(latch.try_acquire(LockMode::Read));
        assert!(!latch.try_acquire(LockMode::Reserve));
        latch.release(LockMode::Read);
        latch.release(LockMode::Reserve);
        assert!(latch.try_acquire(LockMode::Reserve));
    }

    #[test]
    fn test_write_excludes_everything() {
        let latch = NodeLatch::new();
        latch.acquire(LockMode::Write);
        let snap = latch.snapshot();
        assert!(snap.reserved && snap.exclusive);
        assert!(!latch.try_acquire(LockMode::Read));
        assert!(!latch.try_acquire(LockMode::Reserve));
        assert!(!latch.try_acquire(LockMode::Write));
        latch.release(LockMode::Write);
        assert!(latch.try_acquire(LockMode::Write));
    }

    #[test]
    fn test_downgrade_write_to_reserve() {
        let latch = NodeLatch::new();
        latch.acquire(LockMode::Write);
        latch.transition(LockMode::Write, LockMode::Reserve);
        assert!(latch.try_acquire(LockMode::Read));
        assert!(!latch.try_acquire(LockMode::Reserve));
    }

    #[test]
    fn test_downgrade_write_to_read() {
        let latch = NodeLatch::new();
        latch.acquire(LockMode::Write);
        latch.transition(LockMode::Write, LockMode::Read);
        let snap = latch.snapshot();
        assert_eq!(snap.readers, 1);
        assert!(!snap.reserved);
        assert!(latch.try_acquire(LockMode::Reserve));
    }

    #[test]
    fn test_upgrade_waits_for_readers() {
        let latch = Arc::new(NodeLatch::new());
        latch.acquire(LockMode::Read);
        latch.acquire(LockMode::Reserve);

        let upgraded = Arc::new(AtomicBool::new(false));
        let handle = {
            let latch = Arc::clone(&latch);
            let upgraded = Arc::clone(&upgraded);
            thread::spawn(move || {
                latch.transition(LockMode::Reserve, LockMode::Write);
                upgraded.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!upgraded.load(Ordering::SeqCst));
        // a pending upgrade blocks new readers
        assert!(!latch.try_acquire(LockMode::Read));

        latch.release(LockMode::Read);
        handle.join().unwrap();
        assert!(upgraded.load(Ordering::SeqCst));
        assert!(latch.snapshot().exclusive);
    }

    #[test]
    fn test_reader_wakes_after_writer() {
        let latch = Arc::new(NodeLatch::new());
        latch.acquire(LockMode::Write);

        let handle = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                latch.acquire(LockMode::Read);
                latch.release(LockMode::Read);
            })
        };

        thread::sleep(Duration::from_millis(20));
        latch.release(LockMode::Write);
        handle.join().unwrap();
        assert_eq!(latch.snapshot().readers, 0);
    }

    #[test]
    #[should_panic(expected = "no readers")]
    fn test_release_underflow_panics() {
        let latch = NodeLatch::new();
        latch.release(LockMode::Read);
    }
}
