//! ServiceRegistry: the record cache plus debounced change notifications.
//!
//! Packets tend to arrive in bursts (one announcement is often split over
//! several packets, and every responder on the network answers the same
//! query).  Instead of notifying listeners once per packet, each mutation
//! restarts a timer; listeners are called once, with a freshly computed
//! service list, when the burst has been quiet for the debounce delay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use labhost_core::Service;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::records::{RecordCache, RecordUpdate};

/// Default quiet period before listeners are notified.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(400);

/// Called with the current services of the subscribed types.
pub type ServicesCallback = Arc<dyn Fn(Vec<Service>) + Send + Sync>;

struct Subscription {
    id: u64,
    types: Vec<String>,
    callback: ServicesCallback,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared cache, subscriptions and debounce timer.
pub struct ServiceRegistry {
    cache: Mutex<RecordCache>,
    subscriptions: Mutex<Vec<Subscription>>,
    next_subscription: AtomicU64,
    debounce: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl ServiceRegistry {
    pub fn new(debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            cache: Mutex::new(RecordCache::new()),
            subscriptions: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
            debounce,
            timer: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Stores the records of one packet and schedules a notification.
    ///
    /// With a zero debounce delay listeners are notified before this returns.
    pub fn ingest(self: &Arc<Self>, updates: Vec<RecordUpdate>) {
        if updates.is_empty() {
            return;
        }

        let now = Instant::now().into_std();
        {
            let mut cache = lock(&self.cache);
            for update in updates {
                trace!(name = %update.name, "record {:?}", update.data);
                cache.insert(update, now);
            }
        }

        if self.debounce.is_zero() {
            self.notify_all();
        } else {
            self.restart_timer();
        }
    }

    fn restart_timer(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let delay = self.debounce;
        let task = tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(registry) = weak.upgrade() {
                registry.notify_all();
            }
        });

        if let Some(previous) = lock(&self.timer).replace(task) {
            previous.abort();
        }
    }

    /// Expires stale records, then lists every live service of `types`.
    pub fn list(&self, types: &[String]) -> Vec<Service> {
        let now = Instant::now().into_std();
        let mut cache = lock(&self.cache);

        let expired = cache.expire(now);
        if expired > 0 {
            debug!(expired, "dropped expired mDNS records");
        }

        types.iter().flat_map(|t| cache.services(t, now)).collect()
    }

    /// Registers `callback` until `cancel` fires or the registry is closed.
    ///
    /// The returned handle belongs to the task watching for either event;
    /// callers may drop it.
    pub fn subscribe(
        self: &Arc<Self>,
        types: Vec<String>,
        callback: ServicesCallback,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscriptions).push(Subscription { id, types, callback });

        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = shutdown.cancelled() => {}
            }
            if let Some(registry) = weak.upgrade() {
                lock(&registry.subscriptions).retain(|s| s.id != id);
                debug!(id, "service subscription ended");
            }
        })
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    fn notify_all(&self) {
        let targets: Vec<(Vec<String>, ServicesCallback)> = lock(&self.subscriptions)
            .iter()
            .map(|s| (s.types.clone(), Arc::clone(&s.callback)))
            .collect();

        for (types, callback) in targets {
            callback(self.list(&types));
        }
    }

    /// Cancels the pending notification and drops every subscription.
    pub fn close(&self) {
        self.shutdown.cancel();
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
        lock(&self.subscriptions).clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
