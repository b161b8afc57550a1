//! Lock helpers shared by the pool, promises and transports.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the data if a panicking holder poisoned it
///
/// Callbacks run user code, so a panic while a lock is held must not wedge
/// every later caller.
pub(crate) fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};

    #[test]
    fn test_guard_recovers_poisoned_mutex() {
        let mutex = Mutex::new(vec![1]);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut items = mutex.lock().unwrap();
            items.push(2);
            panic!("holder panicked");
        }));

        assert!(result.is_err());
        assert!(mutex.is_poisoned());
        guard(&mutex).push(3);
        assert_eq!(*guard(&mutex), vec![1, 2, 3]);
    }
}
