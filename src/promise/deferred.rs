use crate::error::Error;
use crate::promise::{Promise, Settlement, TickFn};

/// The resolver half of a [`Promise`]: the engine (or any producer) holds
/// the deferred and settles it, while observers hold the promise. Settling
/// more than once is a no-op.
pub struct Deferred<T> {
    promise: Promise<T>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    pub fn new() -> Self {
        Self {
            promise: Promise::pending(None),
        }
    }

    /// A deferred whose promise pumps the given driver tick while a caller
    /// blocks in [`Promise::wait`].
    pub(crate) fn with_tick(tick: Option<TickFn>) -> Self {
        Self {
            promise: Promise::pending(tick),
        }
    }

    pub fn resolve(&self, value: T) {
        self.promise.settle(Settlement::Fulfilled(value));
    }

    pub fn reject(&self, error: Error) {
        self.promise.settle(Settlement::Rejected(error));
    }

    pub fn promise(&self) -> Promise<T> {
        self.promise.clone()
    }
}

impl<T: Clone + Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}
