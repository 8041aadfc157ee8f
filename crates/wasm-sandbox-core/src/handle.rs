//! Owning wrappers around raw VM handles.
//!
//! - [`ForeignHandle`]: unique ownership of one opaque handle value, released
//!   through a [`Deleter`] exactly once
//! - [`SharedHandle`]: reference-counted ownership of a lifecycle object, so
//!   dependents (instances of a module, memory blocks of an instance) keep
//!   their owner alive
//!
//! Each handle kind is one `(RawHandle, Deleter)` pair, e.g. guest addresses
//! freed back to an instance heap, or arena bytes returned to the runtime.

use std::fmt;
use std::mem;
use std::ops::Deref;
use std::sync::Arc;

/// A raw handle value with a distinguished "empty" value.
pub trait RawHandle: Copy + Eq + fmt::Debug {
    /// The value meaning "owns nothing".
    const NULL: Self;

    /// Returns `true` if this is the empty value.
    fn is_null(self) -> bool {
        self == Self::NULL
    }
}

/// Guest-relative addresses. Address 0 is never handed out.
impl RawHandle for u32 {
    const NULL: Self = 0;
}

/// Byte counts leased from an arena. A zero-byte lease owns nothing.
impl RawHandle for u64 {
    const NULL: Self = 0;
}

/// Releases one handle value.
pub trait Deleter<H: RawHandle> {
    /// Release `handle`. Never called with [`RawHandle::NULL`].
    fn delete(&mut self, handle: H);
}

/// Unique ownership of one opaque handle.
///
/// The handle is adopted as-is on construction and released by the deleter
/// when replaced or dropped. There is no `Clone`: a handle value moves with
/// its owner, so it is released exactly once.
pub struct ForeignHandle<H: RawHandle, D: Deleter<H>> {
    handle: H,
    deleter: D,
}

impl<H: RawHandle, D: Deleter<H>> ForeignHandle<H, D> {
    /// Adopt `handle` without validating it.
    pub fn new(handle: H, deleter: D) -> Self {
        Self { handle, deleter }
    }

    /// An empty handle that will only release what it is later reset to.
    pub fn null(deleter: D) -> Self {
        Self::new(H::NULL, deleter)
    }

    /// The raw value. Ownership stays here.
    pub fn get(&self) -> H {
        self.handle
    }

    /// Returns `true` if nothing is owned.
    pub fn is_null(&self) -> bool {
        self.handle.is_null()
    }

    /// Release the current value (if any) and adopt `handle`.
    ///
    /// Resetting to the value already held is a no-op.
    pub fn reset(&mut self, handle: H) {
        if handle == self.handle {
            return;
        }
        let old = mem::replace(&mut self.handle, handle);
        if !old.is_null() {
            self.deleter.delete(old);
        }
    }

    /// Give up ownership without releasing. The handle becomes empty.
    pub fn release(&mut self) -> H {
        mem::replace(&mut self.handle, H::NULL)
    }

    /// The deleter this handle releases through.
    pub fn deleter(&self) -> &D {
        &self.deleter
    }
}

impl<H: RawHandle, D: Deleter<H>> Drop for ForeignHandle<H, D> {
    fn drop(&mut self) {
        self.reset(H::NULL);
    }
}

impl<H: RawHandle, D: Deleter<H>> fmt::Debug for ForeignHandle<H, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignHandle")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Reference-counted ownership of a lifecycle object.
///
/// Cloning never fails and only bumps the count. The wrapped object is
/// dropped when the last `SharedHandle` to it goes away.
pub struct SharedHandle<T> {
    inner: Arc<T>,
}

impl<T> SharedHandle<T> {
    /// Take ownership of `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }

    /// Take ownership of an exclusively owned boxed object.
    pub fn from_box(value: Box<T>) -> Self {
        Self {
            inner: Arc::from(value),
        }
    }

    /// A counted reference to the object.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.inner)
    }

    /// Number of live owners.
    pub fn strong_count(this: &Self) -> usize {
        Arc::strong_count(&this.inner)
    }

    /// Returns `true` if both handles share one object.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.inner, &other.inner)
    }
}

impl<T> Clone for SharedHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Deref for SharedHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: fmt::Debug> fmt::Debug for SharedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[derive(Clone, Default)]
    struct Recorder {
        deleted: Rc<RefCell<Vec<u32>>>,
    }

    impl Deleter<u32> for Recorder {
        fn delete(&mut self, handle: u32) {
            self.deleted.borrow_mut().push(handle);
        }
    }

    #[test]
    fn test_drop_deletes_once() {
        let recorder = Recorder::default();
        {
            let handle = ForeignHandle::new(7u32, recorder.clone());
            assert_eq!(handle.get(), 7);
            assert!(!handle.is_null());
        }
        assert_eq!(*recorder.deleted.borrow(), vec![7]);
    }

    #[test]
    fn test_null_handle_never_deletes() {
        let recorder = Recorder::default();
        drop(ForeignHandle::null(recorder.clone()));
        assert!(recorder.deleted.borrow().is_empty());
    }

    #[test]
    fn test_reset_deletes_previous() {
        let recorder = Recorder::default();
        let mut handle = ForeignHandle::new(1u32, recorder.clone());

        handle.reset(2);
        assert_eq!(*recorder.deleted.borrow(), vec![1]);
        assert_eq!(handle.get(), 2);

        // Same value: nothing released
        handle.reset(2);
        assert_eq!(*recorder.deleted.borrow(), vec![1]);

        handle.reset(0);
        assert!(handle.is_null());
        assert_eq!(*recorder.deleted.borrow(), vec![1, 2]);

        drop(handle);
        assert_eq!(*recorder.deleted.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_release_gives_up_ownership() {
        let recorder = Recorder::default();
        let mut handle = ForeignHandle::new(9u32, recorder.clone());

        assert_eq!(handle.release(), 9);
        assert!(handle.is_null());
        drop(handle);
        assert!(recorder.deleted.borrow().is_empty());
    }

    #[test]
    fn test_move_transfers_ownership() {
        let recorder = Recorder::default();
        let first = ForeignHandle::new(5u32, recorder.clone());
        let second = first;
        assert!(recorder.deleted.borrow().is_empty());
        drop(second);
        assert_eq!(*recorder.deleted.borrow(), vec![5]);
    }

    #[test]
    fn test_shared_handle_counts_owners() {
        let shared = SharedHandle::new(String::from("module"));
        assert_eq!(SharedHandle::strong_count(&shared), 1);

        let other = shared.clone();
        assert_eq!(SharedHandle::strong_count(&shared), 2);
        assert!(SharedHandle::ptr_eq(&shared, &other));
        assert_eq!(other.len(), 6);

        let counted = shared.get();
        assert_eq!(SharedHandle::strong_count(&shared), 3);
        drop(counted);
        drop(other);
        assert_eq!(SharedHandle::strong_count(&shared), 1);
    }

    #[test]
    fn test_shared_handle_drops_with_last_owner() {
        let recorder = Recorder::default();
        let shared = SharedHandle::from_box(Box::new(ForeignHandle::new(3u32, recorder.clone())));
        let other = shared.clone();

        drop(shared);
        assert!(recorder.deleted.borrow().is_empty());
        drop(other);
        assert_eq!(*recorder.deleted.borrow(), vec![3]);
    }
}
