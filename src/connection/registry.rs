use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, Weak,
    atomic::{AtomicBool, Ordering},
};

use crate::{metrics::METRICS, schema::SensorReading};

type Callback = dyn Fn(&SensorReading) + Send + Sync;

struct Entry {
    id: u64,

    /// Cleared on unsubscribe so an in-flight dispatch pass skips it.
    active: AtomicBool,

    callback: Box<Callback>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: Vec<Arc<Entry>>,
}

/// Ordered set of reading callbacks.
///
/// Registration order is dispatch order. The registry is shared between
/// the connection driver (dispatch) and callers (subscribe/unsubscribe).
///
/// SNAPSHOT SAFETY:
/// - Dispatch copies the entry list and releases the lock before any
///   callback runs, so callbacks may subscribe or unsubscribe freely.
/// - An entry unsubscribed during a pass is skipped if its turn has not
///   come yet; every other entry is invoked exactly once.
/// - Entries added during a pass start receiving with the next reading.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for every reading dispatched from now on.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SensorReading) + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;

        inner.entries.push(Arc::new(Entry {
            id,
            active: AtomicBool::new(true),
            callback: Box::new(callback),
        }));
        METRICS.subscribers_active.fetch_add(1, Ordering::Relaxed);

        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    /// Delivers `reading` to every current subscriber, in order.
    ///
    /// A panicking callback is logged and counted; delivery continues
    /// with the next subscriber. Returns how many callbacks completed.
    pub fn dispatch(&self, reading: &SensorReading) -> usize {
        let snapshot: Vec<Arc<Entry>> = lock(&self.inner).entries.clone();
        let mut delivered = 0;

        for entry in snapshot {
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }

            match panic::catch_unwind(AssertUnwindSafe(|| (entry.callback)(reading))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    METRICS.subscriber_faults.fetch_add(1, Ordering::Relaxed);
                    log::error!(
                        "Subscriber #{} panicked: {}",
                        entry.id,
                        panic_message(payload.as_ref())
                    );
                }
            }
        }

        delivered
    }
}

/// Handle returned by [`SubscriberRegistry::subscribe`].
///
/// Dropping the handle keeps the callback registered; only
/// [`Subscription::unsubscribe`] removes it.
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Inner>>,
}

impl Subscription {
    /// Removes exactly this callback. Repeated calls are no-ops.
    pub fn unsubscribe(&self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };

        let mut inner = lock(&inner);
        if let Some(pos) = inner.entries.iter().position(|e| e.id == self.id) {
            let entry = inner.entries.remove(pos);
            entry.active.store(false, Ordering::Release);
            METRICS.subscribers_active.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

// Callbacks never run while the lock is held, so a poisoned lock
// only means a panic inside the registry bookkeeping itself.
fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn reading(spo2: f64) -> SensorReading {
        SensorReading {
            spo2,
            hr: 70.0,
            hr_quality: 90.0,
            status: None,
        }
    }

    fn recorder(log: Arc<Mutex<Vec<String>>>, name: &'static str) -> impl Fn(&SensorReading) + Send + Sync + 'static {
        move |r: &SensorReading| log.lock().unwrap().push(format!("{}:{}", name, r.spo2))
    }

    #[test]
    fn fans_out_in_subscription_order() {
        let registry = SubscriberRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let _a = registry.subscribe(recorder(log.clone(), "a"));
        let _b = registry.subscribe(recorder(log.clone(), "b"));
        let _c = registry.subscribe(recorder(log.clone(), "c"));

        assert_eq!(registry.dispatch(&reading(97.0)), 3);
        assert_eq!(*log.lock().unwrap(), vec!["a:97", "b:97", "c:97"]);
    }

    #[test]
    fn every_subscriber_sees_an_identical_record() {
        let registry = SubscriberRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let subs: Vec<_> = (0..3)
            .map(|_| {
                let seen = seen.clone();
                registry.subscribe(move |r| seen.lock().unwrap().push(r.clone()))
            })
            .collect();

        let sent = SensorReading {
            status: Some(crate::schema::MeasurementStatus::Measuring),
            ..reading(95.5)
        };
        registry.dispatch(&sent);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|r| *r == sent));
        drop(subs);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let registry = SubscriberRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = registry.subscribe(recorder(log.clone(), "a"));
        let _b = registry.subscribe(recorder(log.clone(), "b"));

        a.unsubscribe();
        a.unsubscribe();

        assert_eq!(registry.len(), 1);
        registry.dispatch(&reading(90.0));
        assert_eq!(*log.lock().unwrap(), vec!["b:90"]);
    }

    #[test]
    fn unsubscribing_a_later_entry_mid_dispatch_keeps_the_rest() {
        let registry = SubscriberRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let b_handle: Arc<OnceLock<Subscription>> = Arc::new(OnceLock::new());

        let _a = registry.subscribe({
            let log = log.clone();
            let b_handle = b_handle.clone();
            move |r: &SensorReading| {
                log.lock().unwrap().push(format!("a:{}", r.spo2));
                if let Some(b) = b_handle.get() {
                    b.unsubscribe();
                }
            }
        });
        b_handle.set(registry.subscribe(recorder(log.clone(), "b"))).unwrap();
        let _c = registry.subscribe(recorder(log.clone(), "c"));

        registry.dispatch(&reading(98.0));
        registry.dispatch(&reading(99.0));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:98", "c:98", "a:99", "c:99"]
        );
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let registry = SubscriberRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let own: Arc<OnceLock<Subscription>> = Arc::new(OnceLock::new());

        let handle = registry.subscribe({
            let log = log.clone();
            let own = own.clone();
            move |r: &SensorReading| {
                log.lock().unwrap().push(format!("once:{}", r.spo2));
                if let Some(me) = own.get() {
                    me.unsubscribe();
                }
            }
        });
        own.set(handle).unwrap();
        let _after = registry.subscribe(recorder(log.clone(), "after"));

        registry.dispatch(&reading(96.0));
        registry.dispatch(&reading(97.0));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["once:96", "after:96", "after:97"]
        );
    }

    #[test]
    fn subscriber_added_during_dispatch_starts_next_time() {
        let registry = SubscriberRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let added: Arc<OnceLock<Subscription>> = Arc::new(OnceLock::new());

        let _a = registry.subscribe({
            let registry = registry.clone();
            let log = log.clone();
            let added = added.clone();
            move |_r: &SensorReading| {
                if added.get().is_none() {
                    let _ = added.set(registry.subscribe(recorder(log.clone(), "late")));
                }
            }
        });

        registry.dispatch(&reading(91.0));
        assert!(log.lock().unwrap().is_empty());

        registry.dispatch(&reading(92.0));
        assert_eq!(*log.lock().unwrap(), vec!["late:92"]);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let registry = SubscriberRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let _a = registry.subscribe(recorder(log.clone(), "a"));
        let _boom = registry.subscribe(|_r: &SensorReading| panic!("display went away"));
        let _c = registry.subscribe(recorder(log.clone(), "c"));

        assert_eq!(registry.dispatch(&reading(94.0)), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:94", "c:94"]);

        // Still registered and still isolated on the next reading.
        assert_eq!(registry.dispatch(&reading(95.0)), 2);
    }

    #[test]
    fn handle_outliving_registry_is_harmless() {
        let registry = SubscriberRegistry::new();
        let handle = registry.subscribe(|_r: &SensorReading| {});
        drop(registry);

        handle.unsubscribe();
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn std::any::Any + Send> = Box::new("borrowed");
        let other: Box<dyn std::any::Any + Send> = Box::new(7u8);

        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
