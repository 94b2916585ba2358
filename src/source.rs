//! # Source Tracker Seam
//!
//! Concrete source trackers (a Garmin LiveTrack poller, a MapMyTracks poller,
//! a replay source reading a recorded file) are out of scope here — they
//! live upstream of this crate. What *is* in scope is the seam they plug
//! into: [`RawPointSource`] describes what a tracker must expose, and
//! [`Observer`] is the small pub/sub primitive the pipeline and its callers
//! use to watch for new points without depending on how they got produced.
//!
//! This lets [`crate::pipeline`] be driven by any upstream, and lets tests
//! drive it with an in-memory fake source instead of a live poller.

use std::sync::{Arc, Mutex};

use crate::pipeline::RawPoint;

/// A subscribable callback, one registration slot per call to `subscribe`.
/// Invoked in registration order; a callback that panics or otherwise
/// misbehaves is the caller's problem; one that returns an error from
/// fallible work it does internally should log it rather than propagate it,
/// since a single bad observer must not stop delivery to the others.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A simple in-process observable: callers `subscribe`, the owner `notify`s.
/// Mirrors the teacher's `ProgressCallback` (`Arc<dyn Fn(..) + Send + Sync>`)
/// generalized from a single progress slot to an arbitrary number of
/// subscribers.
pub struct Observer<T> {
    subscribers: Mutex<Vec<Callback<T>>>,
}

impl<T> Observer<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a callback. Returns the index it was registered at, which
    /// callers can ignore; there is no unsubscribe, since every known caller
    /// lives as long as the source itself.
    pub fn subscribe(&self, callback: Callback<T>) -> usize {
        let mut subscribers = self.subscribers.lock().expect("observer mutex poisoned");
        subscribers.push(callback);
        subscribers.len() - 1
    }

    /// Invokes every subscriber, in registration order, with the same value.
    pub fn notify(&self, value: &T) {
        let subscribers = self.subscribers.lock().expect("observer mutex poisoned").clone();
        for callback in subscribers {
            callback(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("observer mutex poisoned").len()
    }
}

impl<T> Default for Observer<T> {
    fn default() -> Self {
        Self::new()
    }
}

// `Vec<Callback<T>>` is `Clone` because `Arc` is; this lets `notify` release
// the lock before invoking callbacks, so a callback that re-enters
// `subscribe` doesn't deadlock.
impl<T> Clone for Observer<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Mutex::new(self.subscribers.lock().expect("observer mutex poisoned").clone()),
        }
    }
}

/// A reset notification: a source that replays or reconnects tells
/// subscribers to discard state derived from points seen before the reset,
/// rather than treating a replayed point as a new one.
#[derive(Debug, Clone, Copy)]
pub struct SourceReset;

/// What any upstream raw-point source must expose, regardless of whether it
/// polls an API, tails a file, or replays a fixture. The pipeline depends
/// only on this trait, never on a concrete tracker.
pub trait RawPointSource: Send + Sync {
    /// All points delivered so far, oldest first. Implementations that
    /// stream unboundedly may choose to cap this to a recent window; the
    /// pipeline only relies on `subscribe_new_points` for points beyond
    /// whatever was returned by the most recent call.
    fn points(&self) -> Vec<RawPoint>;

    /// Registers for individual new points as they arrive.
    fn subscribe_new_points(&self, callback: Callback<RawPoint>) -> usize;

    /// Registers for reset notifications (§5a).
    fn subscribe_reset(&self, callback: Callback<SourceReset>) -> usize;

    /// Signals the source to stop producing new points. Implementations
    /// that own a background poller should join it before returning.
    fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn notify_invokes_every_subscriber_in_order() {
        let observer: Observer<u32> = Observer::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = Arc::clone(&order);
        observer.subscribe(Arc::new(move |v: &u32| order_a.lock().unwrap().push(("a", *v))));
        let order_b = Arc::clone(&order);
        observer.subscribe(Arc::new(move |v: &u32| order_b.lock().unwrap().push(("b", *v))));

        observer.notify(&7);

        assert_eq!(*order.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn subscriber_count_tracks_registrations() {
        let observer: Observer<u32> = Observer::new();
        assert_eq!(observer.subscriber_count(), 0);
        observer.subscribe(Arc::new(|_: &u32| {}));
        observer.subscribe(Arc::new(|_: &u32| {}));
        assert_eq!(observer.subscriber_count(), 2);
    }

    #[test]
    fn callback_can_resubscribe_without_deadlock() {
        let observer: Arc<Observer<u32>> = Arc::new(Observer::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let observer_for_cb = Arc::clone(&observer);
        let calls_for_cb = Arc::clone(&calls);
        observer.subscribe(Arc::new(move |_: &u32| {
            calls_for_cb.fetch_add(1, Ordering::SeqCst);
            observer_for_cb.subscribe(Arc::new(|_: &u32| {}));
        }));

        observer.notify(&1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(observer.subscriber_count(), 2);
    }
}
