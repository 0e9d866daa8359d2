//! Three-mode node lock: read / intent / write.
//!
//! `read` may overlap `read`. `intent` excludes other `intent` holders
//! and `write`, but allows concurrent readers. `write` excludes
//! everything, and may only be taken while holding `intent`.
//!
//! The intent hold is a count: the split path takes an extra reference
//! on a node it is about to retire so the path teardown and the
//! in-memory free can each release one.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Intent,
    Write,
}

#[derive(Debug, Default)]
struct LockState {
    readers: u32,
    intent: u32,
    write: bool,
}

#[derive(Debug, Default)]
pub struct NodeLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl NodeLock {
    pub fn lock_read(&self) {
        let mut s = self.state.lock();
        while s.write {
            self.cond.wait(&mut s);
        }
        s.readers += 1;
    }

    pub fn unlock_read(&self) {
        let mut s = self.state.lock();
        assert!(s.readers > 0, "read unlock without lock");
        s.readers -= 1;
        drop(s);
        self.cond.notify_all();
    }

    pub fn lock_intent(&self) {
        let mut s = self.state.lock();
        while s.intent > 0 || s.write {
            self.cond.wait(&mut s);
        }
        s.intent = 1;
    }

    #[must_use]
    pub fn try_lock_intent(&self) -> bool {
        let mut s = self.state.lock();
        if s.intent > 0 || s.write {
            return false;
        }
        s.intent = 1;
        true
    }

    /// Take an additional intent reference on an already intent-locked
    /// node.
    pub fn increment_intent(&self) {
        let mut s = self.state.lock();
        assert!(s.intent > 0, "intent increment without intent lock");
        s.intent += 1;
    }

    pub fn unlock_intent(&self) {
        let mut s = self.state.lock();
        assert!(s.intent > 0, "intent unlock without lock");
        s.intent -= 1;
        drop(s);
        self.cond.notify_all();
    }

    /// Try to upgrade to write without waiting for readers. The caller
    /// must hold intent.
    #[must_use]
    pub fn try_lock_write(&self) -> bool {
        let mut s = self.state.lock();
        assert!(s.intent > 0, "write lock without intent");
        if s.readers > 0 || s.write {
            return false;
        }
        s.write = true;
        true
    }

    /// Upgrade to write. The caller must hold intent; waits for readers
    /// to drain.
    pub fn lock_write(&self) {
        let mut s = self.state.lock();
        assert!(s.intent > 0, "write lock without intent");
        assert!(!s.write, "write lock already held");
        while s.readers > 0 {
            self.cond.wait(&mut s);
        }
        s.write = true;
    }

    pub fn unlock_write(&self) {
        let mut s = self.state.lock();
        assert!(s.write, "write unlock without lock");
        s.write = false;
        drop(s);
        self.cond.notify_all();
    }

    #[must_use]
    pub fn intent_held(&self) -> bool {
        self.state.lock().intent > 0
    }

    #[must_use]
    pub fn write_held(&self) -> bool {
        self.state.lock().write
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn intent_allows_readers() {
        let l = NodeLock::default();
        l.lock_intent();
        l.lock_read();
        l.unlock_read();
        l.unlock_intent();
    }

    #[test]
    fn intent_excludes_intent() {
        let l = NodeLock::default();
        l.lock_intent();
        assert!(!l.try_lock_intent());
        l.unlock_intent();
        assert!(l.try_lock_intent());
        l.unlock_intent();
    }

    #[test]
    fn write_waits_for_readers() {
        let l = Arc::new(NodeLock::default());
        l.lock_intent();
        l.lock_read();

        let l2 = Arc::clone(&l);
        let t = std::thread::spawn(move || {
            l2.lock_write();
            l2.unlock_write();
        });
        // Give the writer a moment to block, then release the reader.
        std::thread::sleep(std::time::Duration::from_millis(10));
        l.unlock_read();
        t.join().unwrap();
        l.unlock_intent();
    }

    #[test]
    fn try_write_fails_under_readers() {
        let l = NodeLock::default();
        l.lock_intent();
        l.lock_read();
        assert!(!l.try_lock_write());
        l.unlock_read();
        assert!(l.try_lock_write());
        l.unlock_write();
        l.unlock_intent();
    }

    #[test]
    fn intent_reference_counting() {
        let l = NodeLock::default();
        l.lock_intent();
        l.increment_intent();
        l.unlock_intent();
        assert!(l.intent_held());
        l.unlock_intent();
        assert!(!l.intent_held());
    }
}
