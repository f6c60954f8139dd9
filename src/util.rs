use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ops::Deref;
use core::sync::atomic::{AtomicU8, Ordering};

/// An [`UnsafeCell`] that can be shared between threads.
///
/// Every use site is responsible for its own synchronization; this type only
/// exists so that fields which are protected by external means (interrupt
/// disabling, scheduler locks) don't need a `Sync` wrapper at each use.
#[repr(transparent)]
#[derive(Debug)]
pub struct SharedUnsafeCell<T: ?Sized>(UnsafeCell<T>);

impl<T> SharedUnsafeCell<T> {
    pub const fn new(val: T) -> Self {
        SharedUnsafeCell(UnsafeCell::new(val))
    }
}

impl<T: ?Sized> Deref for SharedUnsafeCell<T> {
    type Target = UnsafeCell<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

unsafe impl<T> Sync for SharedUnsafeCell<T> {}
unsafe impl<T> Send for SharedUnsafeCell<T> {}

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const INIT: u8 = 2;

/// A value with an explicit one-time initialization lifecycle.
///
/// Used for kernel singletons that are created once during boot and then
/// accessed for the rest of the kernel's life. Initializing twice or reading
/// before initialization is a programming error and panics.
pub struct OneShotManualInit<T> {
    state: AtomicU8,
    val: SharedUnsafeCell<MaybeUninit<T>>,
}

impl<T> OneShotManualInit<T> {
    pub const fn uninit() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            val: SharedUnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    pub fn is_init(&self) -> bool {
        self.state.load(Ordering::Acquire) == INIT
    }

    /// Initializes the value, returning a reference to it.
    ///
    /// # Panics
    ///
    /// Panics if the value has already been initialized.
    #[track_caller]
    pub fn set(&self, val: T) -> &T {
        if self
            .state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            panic!("OneShotManualInit initialized multiple times");
        }

        // SAFETY: The state was UNINIT, so no references to the value exist,
        //         and the swap to INITIALIZING keeps any concurrent set() from
        //         getting here. We hold the only access to the cell.
        unsafe {
            (*self.val.get()).write(val);
        }

        self.state.store(INIT, Ordering::Release);

        // SAFETY: Initialization just completed.
        unsafe { (*self.val.get()).assume_init_ref() }
    }

    pub fn try_get(&self) -> Option<&T> {
        if self.is_init() {
            // SAFETY: The state was seen as INIT, so the value is fully
            //         written and never changes again.
            Some(unsafe { (*self.val.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Gets the initialized value.
    ///
    /// # Panics
    ///
    /// Panics if [`OneShotManualInit::set`] has not been called yet.
    #[track_caller]
    pub fn get(&self) -> &T {
        self.try_get().expect("OneShotManualInit used before being initialized")
    }
}

impl<T> Drop for OneShotManualInit<T> {
    fn drop(&mut self) {
        if self.is_init() {
            // SAFETY: Initialization was complete, so a valid value is here.
            unsafe {
                (*self.val.get()).assume_init_drop();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::OneShotManualInit;

    #[test]
    fn test_one_shot_set_then_get() {
        let v: OneShotManualInit<u32> = OneShotManualInit::uninit();

        assert!(!v.is_init());
        assert_eq!(None, v.try_get());

        assert_eq!(&1234, v.set(1234));

        assert!(v.is_init());
        assert_eq!(Some(&1234), v.try_get());
        assert_eq!(&1234, v.get());
    }

    #[test]
    #[should_panic(expected = "used before being initialized")]
    fn test_one_shot_get_uninit() {
        let v: OneShotManualInit<u32> = OneShotManualInit::uninit();
        v.get();
    }

    #[test]
    #[should_panic(expected = "initialized multiple times")]
    fn test_one_shot_double_set() {
        let v: OneShotManualInit<u32> = OneShotManualInit::uninit();

        v.set(1);
        v.set(2);
    }
}
