//! Single-resolution latch.
//!
//! A latch starts unset and can be triggered once; every waiter, including
//! those that arrive after the trigger, observes that first value. Later
//! triggers are discarded.

use std::sync::Mutex;

use tokio::sync::Notify;

pub struct Latch<T> {
    value: Mutex<Option<T>>,
    notify: Notify,
}

impl<T: Clone> Latch<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Sets the value if unset. Returns whether this call won.
    pub fn trigger(&self, value: T) -> bool {
        {
            let mut slot = match self.value.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
        }
        self.notify.notify_waiters();
        true
    }

    pub fn get(&self) -> Option<T> {
        match self.value.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.get().is_some()
    }

    /// Waits for the first trigger.
    pub async fn wait(&self) -> T {
        loop {
            // Registered before the check, so a trigger in between is not lost.
            let notified = self.notify.notified();
            if let Some(value) = self.get() {
                return value;
            }
            notified.await;
        }
    }
}

impl<T: Clone> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}
