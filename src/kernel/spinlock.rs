use super::proc::{Cpus, IntrLock};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{AtomicBool, Ordering};

// A table lock. Only the process holding the baton ever runs kernel code,
// so a lock is never contended: finding it held means the same process
// tried to take it twice, which is a kernel bug.
#[derive(Debug)]
pub struct Mutex<T> {
    name: &'static str,  // Name of lock
    locked: AtomicBool,  // Is the lock held?
    data: UnsafeCell<T>, // actual data
}

#[derive(Debug)]
pub struct MutexGuard<'a, T: 'a> {
    mutex: &'a Mutex<T>,
    _intr_lock: IntrLock,
}

impl<T> Mutex<T> {
    pub const fn new(value: T, name: &'static str) -> Mutex<T> {
        Mutex {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
            name,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        let _intr_lock = Cpus::lock_mycpu(self.name); // mask the clock while the table is in flux.

        assert!(
            self.locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok(),
            "acquire {}",
            self.name
        );
        MutexGuard {
            mutex: self,
            _intr_lock,
        }
    }

    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn unlock(guard: MutexGuard<'_, T>) -> &'_ Mutex<T> {
        guard.mutex()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

unsafe impl<T: Send> Sync for Mutex<T> {}

impl<'a, T: 'a> MutexGuard<'a, T> {
    // Returns a reference to the original 'Mutex' object.
    pub fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<'a, T: 'a> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        assert!(self.mutex.holding(), "release {}", self.mutex.name);
        self.mutex.locked.store(false, Ordering::Release);
    }
}

impl<'a, T: 'a> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: 'a> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_masks_and_releases() {
        let m = Mutex::new(7, "test");
        assert!(Cpus::intr_get());
        {
            let mut g = m.lock();
            *g += 1;
            assert!(!Cpus::intr_get());
            assert!(m.holding());
        }
        assert!(Cpus::intr_get());
        assert!(!m.holding());
        assert_eq!(*m.lock(), 8);
    }

    #[test]
    #[should_panic(expected = "acquire test")]
    fn double_acquire_panics() {
        let m = Mutex::new((), "test");
        let _a = m.lock();
        let _b = m.lock();
    }
}
