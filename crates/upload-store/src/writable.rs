//! Observable value container.
//!
//! A [`Writable`] holds one value and broadcasts every replacement to its
//! observers. Notifications are synchronous and delivered in registration
//! order. A `set` issued from inside an observer is queued behind the
//! notifications already in flight, so every observer sees values in the
//! order the writes were made.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Subscriber<T> {
    id: u64,
    active: Arc<AtomicBool>,
    observer: Observer<T>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self { id: self.id, active: Arc::clone(&self.active), observer: Arc::clone(&self.observer) }
    }
}

struct State<T> {
    value: Arc<T>,
    subscribers: Vec<Subscriber<T>>,
    next_subscriber_id: u64,
    pending: VecDeque<(Subscriber<T>, Arc<T>)>,
    dispatching: bool,
}

struct Shared<T> {
    state: ReentrantMutex<RefCell<State<T>>>,
}

type StateGuard<'a, T> = ReentrantMutexGuard<'a, RefCell<State<T>>>;

/// Writable observable store. Clones are handles to the same store.
pub struct Writable<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Writable<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T: Default + Send + Sync + 'static> Default for Writable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Writable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.shared.state.lock();
        let state = guard.borrow();
        f.debug_struct("Writable")
            .field("value", &state.value)
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Writable<T> {
    pub fn new(initial: T) -> Self {
        let state = State {
            value: Arc::new(initial),
            subscribers: Vec::new(),
            next_subscriber_id: 0,
            pending: VecDeque::new(),
            dispatching: false,
        };

        Self { shared: Arc::new(Shared { state: ReentrantMutex::new(RefCell::new(state)) }) }
    }

    /// Current value.
    pub fn get(&self) -> Arc<T> {
        let guard = self.shared.state.lock();
        let value = Arc::clone(&guard.borrow().value);
        value
    }

    /// Registers `observer`. It is called right away with the current value and
    /// again after every `set`/`update` until the returned [`Subscription`] is
    /// released.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let guard = self.shared.state.lock();
        let subscriber = {
            let mut state = guard.borrow_mut();
            state.next_subscriber_id += 1;
            let subscriber = Subscriber {
                id: state.next_subscriber_id,
                active: Arc::new(AtomicBool::new(true)),
                observer: Arc::new(observer),
            };
            state.subscribers.push(subscriber.clone());
            let current = Arc::clone(&state.value);
            state.pending.push_back((subscriber.clone(), current));
            subscriber
        };

        tracing::trace!(subscriber = subscriber.id, "observer subscribed");
        Self::drain(&guard);

        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        let id = subscriber.id;
        Subscription {
            active: subscriber.active,
            release: Some(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    let guard = shared.state.lock();
                    guard.borrow_mut().subscribers.retain(|existing| existing.id != id);
                    tracing::trace!(subscriber = id, "observer unsubscribed");
                }
            })),
        }
    }

    /// Replaces the value and notifies every observer, even when the new value
    /// equals the old one.
    pub fn set(&self, value: T) {
        let guard = self.shared.state.lock();
        Self::publish(&guard, Arc::new(value));
    }

    /// Derives the next value from the current one, then behaves like [`set`].
    ///
    /// The read and the write happen under the store lock, so updates from
    /// other threads cannot interleave with it.
    ///
    /// [`set`]: Writable::set
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let guard = self.shared.state.lock();
        let current = Arc::clone(&guard.borrow().value);
        let next = f(&current);
        Self::publish(&guard, Arc::new(next));
    }

    /// Like [`update`](Writable::update), but `f` may decline the write by
    /// returning `None`, in which case nothing is stored and nobody is
    /// notified. Returns whether a new value was published.
    pub fn try_update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> Option<T>,
    {
        let guard = self.shared.state.lock();
        let current = Arc::clone(&guard.borrow().value);
        match f(&current) {
            Some(next) => {
                Self::publish(&guard, Arc::new(next));
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let guard = self.shared.state.lock();
        let count = guard.borrow().subscribers.len();
        count
    }

    fn publish(guard: &StateGuard<'_, T>, next: Arc<T>) {
        {
            let mut state = guard.borrow_mut();
            state.value = Arc::clone(&next);
            let subscribers = state.subscribers.clone();
            for subscriber in subscribers {
                state.pending.push_back((subscriber, Arc::clone(&next)));
            }
            tracing::trace!(observers = state.subscribers.len(), "value published");
        }

        Self::drain(guard);
    }

    fn drain(guard: &StateGuard<'_, T>) {
        {
            let mut state = guard.borrow_mut();
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }

        let _reset = DispatchReset { guard };

        loop {
            let next = guard.borrow_mut().pending.pop_front();
            let Some((subscriber, value)) = next else {
                break;
            };

            if subscriber.active.load(Ordering::Acquire) {
                (subscriber.observer)(&value);
            }
        }
    }
}

/// Clears the dispatching flag even if an observer panics, dropping whatever
/// was still queued.
struct DispatchReset<'a, 'b, T> {
    guard: &'a StateGuard<'b, T>,
}

impl<T> Drop for DispatchReset<'_, '_, T> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.guard.try_borrow_mut() {
            state.dispatching = false;
            if std::thread::panicking() {
                state.pending.clear();
            }
        }
    }
}

/// Registration handle returned by [`Writable::subscribe`].
///
/// Dropping it or calling [`unsubscribe`](Subscription::unsubscribe) stops all
/// further notifications to the observer, including ones already queued.
#[must_use = "dropping a Subscription unsubscribes the observer"]
pub struct Subscription {
    active: Arc<AtomicBool>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Keeps the observer registered for as long as the store lives.
    pub fn detach(mut self) {
        self.release = None;
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            self.active.store(false, Ordering::Release);
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("active", &self.is_active()).finish()
    }
}
