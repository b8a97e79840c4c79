//! Whole-value snapshots with a monotonic version.
//!
//! Shared caches are only ever replaced or appended to as a unit. Tagging each write with a
//! version (and each in-flight request with a ticket) makes "is this response stale?" a
//! comparison instead of an accident of arrival order.

use std::sync::Arc;

#[derive(Debug)]
pub struct Versioned<T> {
    version: u64,
    value: Arc<T>,
}

impl<T> Clone for Versioned<T> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            value: Arc::clone(&self.value),
        }
    }
}

impl<T: Default> Default for Versioned<T> {
    fn default() -> Self {
        Self {
            version: 0,
            value: Arc::new(T::default()),
        }
    }
}

impl<T> Versioned<T> {
    /// Zero until the first write.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    /// Replace the whole value and bump the version.
    pub fn replace(&mut self, value: T) -> u64 {
        self.value = Arc::new(value);
        self.version += 1;
        self.version
    }

    /// Replace only when `ticket` is newer than the version currently held.
    ///
    /// Tickets are issued before the request that produced `value` was sent, so an
    /// older ticket resolving late cannot overwrite a newer result.
    pub fn replace_if_newer(&mut self, ticket: u64, value: T) -> bool {
        if ticket <= self.version {
            return false;
        }
        self.value = Arc::new(value);
        self.version = ticket;
        true
    }
}

impl<T: Clone> Versioned<T> {
    /// Copy-on-write update of the held value; bumps the version.
    pub fn update(&mut self, f: impl FnOnce(&mut T)) -> u64 {
        f(Arc::make_mut(&mut self.value));
        self.version += 1;
        self.version
    }
}
