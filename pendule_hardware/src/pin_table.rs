//! Pin handles shared by the control thread and the interrupt threads.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) struct PinTable<H> {
    pins: Mutex<HashMap<u8, H>>,
}

impl<H> PinTable<H> {
    pub(crate) fn new() -> Self {
        Self {
            pins: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<u8, H>> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the handle for `pin`; the caller drops it after the table is unlocked.
    pub(crate) fn take(&self, pin: u8) -> Option<H> {
        self.lock().remove(&pin)
    }

    /// Run `f` on the handle for `pin` with the table unlocked, then put the
    /// handle back unless the pin was claimed again meanwhile.
    ///
    /// `f` may wait on threads (interrupt callbacks) that lock the table.
    pub(crate) fn with_detached<R>(&self, pin: u8, f: impl FnOnce(&mut H) -> R) -> Option<R> {
        let mut handle = self.take(pin)?;
        let out = f(&mut handle);
        self.lock().entry(pin).or_insert(handle);
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn detached_work_may_wait_on_threads_that_lock_the_table() {
        let table = Arc::new(PinTable::new());
        table.lock().insert(5, "input");
        let other = Arc::clone(&table);
        let joined = table.with_detached(5, |h| {
            // Same shape as clearing an interrupt whose callback writes a pin.
            let callback = thread::spawn(move || {
                other.lock().insert(6, "output");
            });
            assert_eq!(*h, "input");
            callback.join().is_ok()
        });
        assert_eq!(joined, Some(true));
        let pins = table.lock();
        assert_eq!((pins.get(&5), pins.get(&6)), (Some(&"input"), Some(&"output")));
    }

    #[test]
    fn missing_pins_are_skipped() {
        let table: PinTable<u32> = PinTable::new();
        assert_eq!(table.with_detached(3, |_| ()), None);
        assert!(table.take(3).is_none());
    }

    #[test]
    fn reclaimed_pin_keeps_the_newer_handle() {
        let table = PinTable::new();
        table.lock().insert(4, 1);
        table.with_detached(4, |_| {
            table.lock().insert(4, 2);
        });
        assert_eq!(table.lock().get(&4), Some(&2));
    }
}
