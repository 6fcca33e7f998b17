//! §5.2 Emergency lock: a FIFO of emergency reports, held by any thread
//! reporting one so the queue update is atomic. §7 names the three codes
//! the ambient stack (storage, protocol init) actually raises.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyCode {
    NonVolatileMemory,
    NonVolatileAutoSave,
    InconsistentObjectDict,
}

#[derive(Debug, Clone)]
pub struct EmergencyEntry {
    pub code: EmergencyCode,
    pub info: u32,
}

/// §5.2 emergency FIFO, shared by `Arc` across the RT and mainline threads.
#[derive(Clone)]
pub struct EmergencyRegistry {
    inner: Arc<Mutex<VecDeque<EmergencyEntry>>>,
}

impl EmergencyRegistry {
    pub fn new() -> EmergencyRegistry {
        EmergencyRegistry { inner: Arc::new(Mutex::new(VecDeque::new())) }
    }

    pub fn push(&self, code: EmergencyCode, info: u32) {
        self.inner.lock().push_back(EmergencyEntry { code, info });
    }

    pub fn pop(&self) -> Option<EmergencyEntry> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EmergencyRegistry {
    fn default() -> EmergencyRegistry {
        EmergencyRegistry::new()
    }
}

/// §7 debounce helper for `NON_VOLATILE_AUTO_SAVE`: an emergency is raised
/// only on the rising edge of a failing condition, and implicitly cleared
/// (no emergency emitted) on the falling edge.
pub struct EdgeDebouncedFault {
    failing: bool,
}

impl EdgeDebouncedFault {
    pub fn new() -> EdgeDebouncedFault {
        EdgeDebouncedFault { failing: false }
    }

    /// Feeds the current tick's condition. Returns `true` exactly on the
    /// tick the condition transitions from ok to failing.
    pub fn observe(&mut self, is_failing: bool) -> bool {
        let rising = is_failing && !self.failing;
        self.failing = is_failing;
        rising
    }
}

impl Default for EdgeDebouncedFault {
    fn default() -> EdgeDebouncedFault {
        EdgeDebouncedFault::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_is_fifo() {
        let reg = EmergencyRegistry::new();
        reg.push(EmergencyCode::NonVolatileMemory, 1);
        reg.push(EmergencyCode::InconsistentObjectDict, 2);
        assert_eq!(reg.pop().unwrap().info, 1);
        assert_eq!(reg.pop().unwrap().info, 2);
        assert!(reg.pop().is_none());
    }

    #[test]
    fn debounce_fires_only_on_rising_edge() {
        let mut fault = EdgeDebouncedFault::new();
        assert!(!fault.observe(false));
        assert!(fault.observe(true)); // rising
        assert!(!fault.observe(true)); // still failing, no repeat
        assert!(!fault.observe(false)); // falling, no emergency
        assert!(fault.observe(true)); // rising again
    }
}
