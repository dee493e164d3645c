//! Resolve-once value slots.
//!
//! A [`Deferred`] is shared between whoever will produce a value and any
//! number of waiters. The first successful resolution is final; a rejection
//! stays in place only until something succeeds.

use crate::error::{CacheError, CacheResult};
use std::sync::Arc;
use tokio::sync::watch;

type Slot<T> = Option<CacheResult<T>>;

/// A single-resolution value slot.
#[derive(Debug)]
pub struct Deferred<T> {
    tx: Arc<watch::Sender<Slot<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Clone> Deferred<T> {
    /// A slot nobody has resolved yet.
    pub fn pending() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// A slot that already holds `value`.
    pub fn resolved(value: T) -> Self {
        let (tx, _rx) = watch::channel(Some(Ok(value)));
        Self { tx: Arc::new(tx) }
    }

    /// Resolve with a value. Returns `false` when the slot already held one.
    pub fn resolve(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| match slot {
            Some(Ok(_)) => false,
            _ => {
                *slot = Some(Ok(value));
                true
            }
        })
    }

    /// Reject the slot. Ignored once anything has been delivered.
    pub fn reject(&self, err: CacheError) -> bool {
        self.tx.send_if_modified(|slot| match slot {
            None => {
                *slot = Some(Err(err));
                true
            }
            Some(_) => false,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.tx.borrow().is_none()
    }

    /// Whether the slot currently holds an error.
    pub fn is_rejected(&self) -> bool {
        matches!(&*self.tx.borrow(), Some(Err(_)))
    }

    /// The resolved value, if there is one right now.
    pub fn peek(&self) -> Option<T> {
        match &*self.tx.borrow() {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Wait for the slot to settle.
    ///
    /// `on_abandon` builds the error reported if every producer handle is gone
    /// while the slot is still pending.
    pub async fn wait(&self, on_abandon: impl FnOnce() -> CacheError) -> CacheResult<T> {
        let mut rx = self.tx.subscribe();
        let outcome = match rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => match &*slot {
                Some(result) => result.clone(),
                None => Err(on_abandon()),
            },
            Err(_) => Err(on_abandon()),
        };
        outcome
    }
}
