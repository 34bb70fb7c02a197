//! Ownership wrappers for objects whose lifetime is owned by someone else
//! (devices, surfaces, preview targets, package targets).
//!
//! A handle releases its resource exactly once: either explicitly through
//! [`NativeHandle::release`], or when the handle is dropped. Moving the
//! resource out with `take` transfers the release obligation to the caller.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// A resource that must be given back to its owner exactly once.
pub trait NativeResource: Send {
    fn release_native(self);
}

impl<T: ?Sized + Send + Sync> NativeResource for Arc<T> {
    fn release_native(self) {
        drop(self);
    }
}

pub struct NativeHandle<T: NativeResource> {
    inner: Option<T>,
}

impl<T: NativeResource> NativeHandle<T> {
    pub fn new(resource: T) -> Self {
        Self {
            inner: Some(resource),
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.inner.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.inner.as_mut()
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_none()
    }

    pub fn take(&mut self) -> Option<T> {
        self.inner.take()
    }

    /// Returns `true` only for the call that actually released the resource.
    pub fn release(&mut self) -> bool {
        match self.inner.take() {
            Some(resource) => {
                resource.release_native();
                true
            }
            None => false,
        }
    }
}

impl<T: NativeResource> Drop for NativeHandle<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: NativeResource> fmt::Debug for NativeHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("released", &self.is_released())
            .finish()
    }
}

/// Thread-safe variant used where a handle is read from one thread and
/// released from another (cancel vs. production, dispose vs. preview).
pub struct SharedHandle<T: NativeResource> {
    inner: Mutex<Option<T>>,
}

impl<T: NativeResource> SharedHandle<T> {
    pub fn new(resource: T) -> Self {
        Self {
            inner: Mutex::new(Some(resource)),
        }
    }

    pub fn empty() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Installs a new resource, releasing the previous one if any.
    pub fn replace(&self, resource: T) {
        let previous = self.lock().replace(resource);
        if let Some(previous) = previous {
            previous.release_native();
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.lock().as_ref().map(f)
    }

    pub fn is_released(&self) -> bool {
        self.lock().is_none()
    }

    pub fn take(&self) -> Option<T> {
        self.lock().take()
    }

    pub fn release(&self) -> bool {
        let resource = self.lock().take();
        match resource {
            Some(resource) => {
                resource.release_native();
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        // a panic while holding the lock leaves the slot itself consistent
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: NativeResource + Clone> SharedHandle<T> {
    pub fn cloned(&self) -> Option<T> {
        self.lock().clone()
    }
}

impl<T: NativeResource> Default for SharedHandle<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: NativeResource> Drop for SharedHandle<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: NativeResource> fmt::Debug for SharedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHandle")
            .field("released", &self.is_released())
            .finish()
    }
}
