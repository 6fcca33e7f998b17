//! §3 Object dictionary: a `Mutex`-guarded byte-oriented store behind the
//! object-dictionary lock of §5. Storage entries address into it by
//! `(address, length)`; index/sub-index addressing belongs to the
//! out-of-scope protocol layer this spec does not redefine.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Identifies a contiguous byte range inside the dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub u32);

/// Mutex-guarded byte store. The RT thread holds the per-entry lock during
/// SYNC/RPDO/TPDO processing; the mainline holds it during explicit OD
/// operations; the storage engine holds it while serializing entry bytes for
/// save — all three share the same cell, not a copy of it.
#[derive(Clone)]
pub struct ObjectDictionary {
    inner: Arc<Mutex<HashMap<Address, Arc<Mutex<Vec<u8>>>>>>,
}

impl ObjectDictionary {
    pub fn new() -> ObjectDictionary {
        ObjectDictionary { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn write(&self, addr: Address, bytes: &[u8]) {
        let cell = self.entry_handle(addr);
        let mut guard = cell.lock();
        guard.clear();
        guard.extend_from_slice(bytes);
    }

    pub fn read(&self, addr: Address) -> Option<Vec<u8>> {
        self.inner.lock().get(&addr).map(|cell| cell.lock().clone())
    }

    /// The shared cell backing `addr`, created empty on first access.
    /// Handed to a `StorageEntry` so writes from the protocol layer are
    /// visible to the next auto-save tick without a copy through this
    /// dictionary.
    pub fn entry_handle(&self, addr: Address) -> Arc<Mutex<Vec<u8>>> {
        self.inner.lock().entry(addr).or_insert_with(|| Arc::new(Mutex::new(Vec::new()))).clone()
    }
}

impl Default for ObjectDictionary {
    fn default() -> ObjectDictionary {
        ObjectDictionary::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let od = ObjectDictionary::new();
        od.write(Address(0x1000), &[1, 2, 3]);
        assert_eq!(od.read(Address(0x1000)), Some(vec![1, 2, 3]));
    }

    #[test]
    fn read_of_unwritten_address_is_none() {
        let od = ObjectDictionary::new();
        assert_eq!(od.read(Address(0x2000)), None);
    }
}
