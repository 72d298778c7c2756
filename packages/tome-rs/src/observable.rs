//! Push-based observable primitives.
//!
//! [`Subject`] fans a value out to every registered callback. [`BehaviorSubject`]
//! additionally remembers the last value and replays it to new subscribers,
//! which is what render-key observers need: they always start from the current key.
//!
//! # Guarantees
//!
//! - **Synchronous delivery**: callbacks run on the notifying call, in subscription order
//! - **No lock held during delivery**: callbacks may subscribe or unsubscribe freely
//! - **Panic isolation**: a panicking callback is logged and skipped, the rest still run
//!
//! # Example
//!
//! ```ignore
//! let keys = BehaviorSubject::new("editor".to_string());
//! let sub = keys.subscribe(|key| println!("render key: {key}"));  // prints "editor"
//! keys.next("editor-clear1".to_string());                         // prints "editor-clear1"
//! sub.unsubscribe();                                            // or drop(sub)
//! ```

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use tracing::error;

use crate::lock;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Observers<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

/// Handle returned by `subscribe`.
///
/// Dropping the handle unsubscribes. Call [`Subscription::detach`] to keep the
/// observer registered for as long as the subject lives.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// A subscription that does nothing when cancelled.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub(crate) fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(f)),
        }
    }

    /// Stop receiving notifications.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the observer registered after this handle is gone.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Multicast subject: every `next` is pushed to all current subscribers.
pub struct Subject<T> {
    observers: Arc<Mutex<Observers<T>>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            observers: self.observers.clone(),
        }
    }
}

impl<T> Default for Subject<T> {
    fn default() -> Self {
        Self {
            observers: Arc::new(Mutex::new(Observers::default())),
        }
    }
}

impl<T: 'static> Subject<T> {
    /// Create a subject with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for every future value.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut observers = lock(&self.observers);
            let id = observers.next_id;
            observers.next_id += 1;
            observers.entries.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<Observers<T>>> = Arc::downgrade(&self.observers);
        Subscription::from_fn(move || {
            if let Some(observers) = weak.upgrade() {
                lock(&observers).entries.retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Push a value to every subscriber.
    pub fn next(&self, value: &T) {
        // Snapshot so callbacks can (un)subscribe without deadlocking.
        let callbacks: Vec<Callback<T>> = lock(&self.observers)
            .entries
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(value))) {
                error!(panic = %panic_message(&panic), "observer panicked");
            }
        }
    }

    /// Number of live subscribers.
    pub fn observer_count(&self) -> usize {
        lock(&self.observers).entries.len()
    }
}

/// Subject that holds a current value and replays it on subscribe.
pub struct BehaviorSubject<T> {
    current: Arc<Mutex<T>>,
    subject: Subject<T>,
}

impl<T> Clone for BehaviorSubject<T> {
    fn clone(&self) -> Self {
        Self {
            current: self.current.clone(),
            subject: self.subject.clone(),
        }
    }
}

impl<T: Clone + 'static> BehaviorSubject<T> {
    /// Create a behavior subject seeded with `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            current: Arc::new(Mutex::new(initial)),
            subject: Subject::new(),
        }
    }

    /// The most recent value.
    pub fn value(&self) -> T {
        lock(&self.current).clone()
    }

    /// Register a callback; it is invoked immediately with the current value.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let current = self.value();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&current))) {
            error!(panic = %panic_message(&panic), "observer panicked on replay");
        }
        self.subject.subscribe(callback)
    }

    /// Replace the current value and notify subscribers.
    pub fn next(&self, value: T) {
        *lock(&self.current) = value.clone();
        self.subject.next(&value);
    }

    /// Number of live subscribers.
    pub fn observer_count(&self) -> usize {
        self.subject.observer_count()
    }
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
