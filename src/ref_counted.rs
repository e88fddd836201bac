//! Intrusive reference counting: the shared object carries its own counter, and [Handle] is the
//!  shared-ownership pointer that increments and decrements it.
//!
//! This is used for objects that are shared between the network worker thread and application
//!  threads (connections, outbound messages). Destruction happens synchronously in the `drop` of
//!  the last handle, so side effects of the referent's `Drop` are immediately observable.
//!
//! The counter is the only part of the referent that is synchronized by this module - types that
//!  have mutable state need their own lock.

use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicI32, Ordering};

/// The counter embedded in a reference counted object.
///
/// Adding a reference is only valid for a live object, and removing one only while the count is
///  positive. After the object is destroyed, the counter is set to [RefCount::POISONED] so that
///  accidental use through a dangling reference trips an assertion rather than silently
///  corrupting the count.
pub struct RefCount {
    count: AtomicI32,
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

impl RefCount {
    pub const POISONED: i32 = -100_000;

    pub const fn new() -> RefCount {
        RefCount {
            count: AtomicI32::new(0),
        }
    }

    pub fn add_ref(&self) {
        let prev = self.count.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev >= 0, "add_ref on an object that was already destroyed (ref count {})", prev);
    }

    /// Returns `true` iff this call removed the last reference - the caller is then responsible for
    ///  destroying the object.
    #[must_use]
    pub fn dec_ref(&self) -> bool {
        let prev = self.count.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "dec_ref on an object without references (ref count {})", prev);

        if prev == 1 {
            // synchronize with all previous releases before the object is torn down
            fence(Ordering::Acquire);
            true
        }
        else {
            false
        }
    }

    pub fn get(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn poison(&self) {
        self.count.store(Self::POISONED, Ordering::Release);
    }

    pub fn is_poisoned(&self) -> bool {
        self.get() < 0
    }
}

impl Debug for RefCount {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RefCount({})", self.get())
    }
}

/// Objects that are shared through [Handle] embed a [RefCount] and expose it here.
pub trait RefCounted: Send + Sync {
    fn ref_count(&self) -> &RefCount;
}

/// A shared-ownership pointer to a [RefCounted] object. Cloning a handle adds a reference, dropping
///  it removes one, and the referent is destroyed by the drop that removes the last reference.
///
/// Handles compare equal iff they point to the same object. A null handle never touches any
///  referent.
pub struct Handle<T: RefCounted> {
    ptr: Option<NonNull<T>>,
    _owned: PhantomData<T>,
}

// NB: RefCounted requires Send + Sync, and the counter is atomic
unsafe impl<T: RefCounted> Send for Handle<T> {}
unsafe impl<T: RefCounted> Sync for Handle<T> {}

impl<T: RefCounted> Handle<T> {
    /// Moves the value to the heap and returns the first handle to it
    pub fn new(value: T) -> Handle<T> {
        debug_assert_eq!(value.ref_count().get(), 0, "a new object should not have references");

        let ptr = NonNull::from(Box::leak(Box::new(value)));
        // SAFETY: the pointer was just created from a live Box
        unsafe { ptr.as_ref() }.ref_count().add_ref();

        Handle {
            ptr: Some(ptr),
            _owned: PhantomData,
        }
    }

    pub const fn null() -> Handle<T> {
        Handle {
            ptr: None,
            _owned: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    pub fn get(&self) -> Option<&T> {
        // SAFETY: a non-null handle holds a reference, so the referent is alive for as long as
        //  the handle is borrowed
        self.ptr.map(|p| unsafe { &*p.as_ptr() })
    }

    /// Mutable access is only handed out if this is the only handle to the object.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        let ptr = self.ptr?;
        // SAFETY: see `get`
        if unsafe { ptr.as_ref() }.ref_count().get() != 1 {
            return None;
        }
        // SAFETY: this is the only handle, and it is borrowed mutably
        Some(unsafe { &mut *ptr.as_ptr() })
    }

    /// The referent's current reference count, or 0 for a null handle
    pub fn ref_count_of(&self) -> u32 {
        self.get()
            .map(|r| r.ref_count().get().max(0) as u32)
            .unwrap_or(0)
    }

    pub fn ptr_eq(a: &Handle<T>, b: &Handle<T>) -> bool {
        a.ptr == b.ptr
    }
}

impl<T: RefCounted> Clone for Handle<T> {
    fn clone(&self) -> Self {
        if let Some(referent) = self.get() {
            referent.ref_count().add_ref();
        }
        Handle {
            ptr: self.ptr,
            _owned: PhantomData,
        }
    }
}

impl<T: RefCounted> Drop for Handle<T> {
    fn drop(&mut self) {
        let Some(ptr) = self.ptr.take() else {
            return;
        };

        // SAFETY: this handle still holds its reference at this point
        let is_last = unsafe { ptr.as_ref() }.ref_count().dec_ref();
        if is_last {
            // SAFETY: the last reference is gone, and the pointer originates from Box::leak in `new`
            unsafe {
                ptr.as_ref().ref_count().poison();
                drop(Box::from_raw(ptr.as_ptr()));
            }
        }
    }
}

impl<T: RefCounted> Default for Handle<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: RefCounted> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.get()
            .expect("this is a bug: dereferencing a null handle")
    }
}

impl<T: RefCounted> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}
impl<T: RefCounted> Eq for Handle<T> {}

impl<T: RefCounted + Debug> Debug for Handle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.get() {
            Some(referent) => write!(f, "Handle({:?})", referent),
            None => write!(f, "Handle(null)"),
        }
    }
}
