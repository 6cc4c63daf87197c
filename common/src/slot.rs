use std::sync::{Arc, Mutex, PoisonError};

/// Single-item, latest-wins hand-off between one writer and many readers.
///
/// The lock is held only to swap or clone the `Arc`, never while a value is
/// built or read. Published values are immutable, so a reader always sees a
/// complete value: either the previous one or the new one.
#[derive(Debug)]
pub struct LatestSlot<T> {
    inner: Mutex<Option<Arc<T>>>,
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Replace the current value.
    pub fn publish(&self, value: T) {
        let value = Arc::new(value);
        // Drop the previous value outside the lock.
        let _previous = {
            let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            guard.replace(value)
        };
    }

    /// Current value, or `None` before the first publish.
    pub fn snapshot(&self) -> Option<Arc<T>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn empty_until_first_publish() {
        let slot: LatestSlot<u32> = LatestSlot::new();
        assert!(slot.snapshot().is_none());

        slot.publish(1);
        assert_eq!(*slot.snapshot().unwrap(), 1);
    }

    #[test]
    fn latest_value_wins() {
        let slot = LatestSlot::new();
        slot.publish("a");
        slot.publish("b");
        slot.publish("c");
        assert_eq!(*slot.snapshot().unwrap(), "c");
    }

    #[test]
    fn snapshot_survives_later_publish() {
        let slot = LatestSlot::new();
        slot.publish(vec![1u8; 4]);
        let held = slot.snapshot().unwrap();
        slot.publish(vec![2u8; 4]);
        assert_eq!(*held, vec![1u8; 4]);
        assert_eq!(*slot.snapshot().unwrap(), vec![2u8; 4]);
    }

    #[test]
    fn concurrent_readers_never_see_torn_values() {
        // Every published buffer is uniform; a torn read would mix fill values.
        const LEN: usize = 64 * 1024;
        let slot = Arc::new(LatestSlot::new());
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let slot = Arc::clone(&slot);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut seen = 0u32;
                    while !done.load(Ordering::Acquire) {
                        if let Some(buf) = slot.snapshot() {
                            let buf: &Vec<u8> = &buf;
                            assert_eq!(buf.len(), LEN);
                            let first = buf[0];
                            assert!(buf.iter().all(|&b| b == first), "torn read");
                            seen += 1;
                        }
                    }
                    seen
                })
            })
            .collect();

        for fill in 0..200u32 {
            slot.publish(vec![(fill % 251) as u8; LEN]);
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
