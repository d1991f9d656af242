//! `RequestScheduler`/`CubeRetriever`: batches outgoing cube/key/notification
//! requests, enforces "at most one in-flight `CubeRequest` per key" (§4.6),
//! and drives retry/backoff and subscription renewal.
//!
//! Grounded on the teacher's `sync.rs` (batch timers, in-flight bookkeeping)
//! generalized from block/tx sync to cube keys, and on its timer-reuse
//! pattern for `ShortenableTimeout`.

use crate::net::types::{CubeKey, NotificationKey, now};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use tokio::time::{Duration, Instant, sleep_until};

/// A timeout that can only ever be moved earlier. Re-arming with a later
/// deadline than the current one is a no-op; re-arming after the timeout
/// has already fired starts a fresh one. Grounded on the teacher's reuse of
/// a single retry timer across repeated partial responses instead of
/// spawning a new task per attempt.
pub struct ShortenableTimeout {
    deadline: Instant,
    fired: bool,
}

impl ShortenableTimeout {
    pub fn new(delay: Duration) -> Self {
        Self {
            deadline: Instant::now() + delay,
            fired: false,
        }
    }

    /// Move the deadline earlier if `delay` from now is sooner than the
    /// current deadline, or re-arm from scratch if this timeout already
    /// fired. Returns `true` if the deadline changed.
    pub fn shorten_to(&mut self, delay: Duration) -> bool {
        let candidate = Instant::now() + delay;
        if self.fired {
            self.deadline = candidate;
            self.fired = false;
            return true;
        }
        if candidate < self.deadline {
            self.deadline = candidate;
            return true;
        }
        false
    }

    pub async fn wait(&mut self) {
        sleep_until(self.deadline).await;
        self.fired = true;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// A request queued or in flight, keyed by what's being asked for.
enum PendingKind {
    Cube {
        key: CubeKey,
        waiters: Vec<oneshot::Sender<Vec<u8>>>,
        attempts: u32,
    },
    Notifications {
        recipient: NotificationKey,
        attempts: u32,
    },
}

struct PendingState {
    kind: PendingKind,
    requested_at: u64,
}

/// Batches and deduplicates outgoing cube/key/notification requests. Owned
/// exclusively by one actor task; not meant to be shared across threads
/// directly (mirrors the teacher's single-owner sync state).
pub struct RequestScheduler {
    pending: HashMap<CubeKey, PendingState>,
    pending_notifications: HashMap<NotificationKey, PendingState>,
    queue: VecDeque<CubeKey>,
    notify_queue: VecDeque<NotificationKey>,
    subscriptions: HashSet<CubeKey>,
    notification_subscriptions: HashSet<NotificationKey>,
    max_batch_size: usize,
}

/// Outcome of attempting to enqueue a cube request: either it's genuinely
/// new and should go out on the wire, or it was merged into an existing
/// in-flight request (the single-in-flight-per-key invariant, §4.6).
pub enum EnqueueOutcome {
    NewRequest,
    MergedIntoExisting,
}

impl RequestScheduler {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            pending: HashMap::new(),
            pending_notifications: HashMap::new(),
            queue: VecDeque::new(),
            notify_queue: VecDeque::new(),
            subscriptions: HashSet::new(),
            notification_subscriptions: HashSet::new(),
            max_batch_size,
        }
    }

    /// Request a cube by key. If a request for this key is already in
    /// flight, the new waiter attaches to it instead of issuing a second
    /// wire request (§4.6 invariant: at most one in-flight `CubeRequest`
    /// per key).
    pub fn request_cube(&mut self, key: CubeKey) -> (EnqueueOutcome, oneshot::Receiver<Vec<u8>>) {
        let (tx, rx) = oneshot::channel();
        match self.pending.get_mut(&key) {
            Some(state) => {
                if let PendingKind::Cube { waiters, .. } = &mut state.kind {
                    waiters.push(tx);
                }
                (EnqueueOutcome::MergedIntoExisting, rx)
            }
            None => {
                self.pending.insert(
                    key,
                    PendingState {
                        kind: PendingKind::Cube {
                            key,
                            waiters: vec![tx],
                            attempts: 0,
                        },
                        requested_at: now(),
                    },
                );
                self.queue.push_back(key);
                (EnqueueOutcome::NewRequest, rx)
            }
        }
    }

    pub fn is_in_flight(&self, key: &CubeKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.pending.len()
    }

    /// Drain up to `max_batch_size` queued keys into a single wire batch.
    pub fn drain_batch(&mut self) -> Vec<CubeKey> {
        let mut batch = Vec::new();
        while batch.len() < self.max_batch_size {
            match self.queue.pop_front() {
                Some(k) => batch.push(k),
                None => break,
            }
        }
        batch
    }

    /// Resolve a pending cube request with the bytes received from a peer,
    /// satisfying every attached waiter.
    pub fn resolve_cube(&mut self, key: CubeKey, bytes: Vec<u8>) {
        if let Some(state) = self.pending.remove(&key)
            && let PendingKind::Cube { waiters, .. } = state.kind
        {
            for w in waiters {
                let _ = w.send(bytes.clone());
            }
        }
    }

    /// Mark an attempt as failed and re-queue it if under the retry cap;
    /// returns `true` if it will be retried, `false` if it was abandoned
    /// (all waiters dropped with their senders consumed, which resolves
    /// their receivers to `RecvError`, i.e. a `Timeout`/`Cancelled` surface
    /// at the caller).
    pub fn fail_and_maybe_retry(&mut self, key: CubeKey, max_attempts: u32) -> bool {
        if let Some(state) = self.pending.get_mut(&key)
            && let PendingKind::Cube {
                attempts,
                key: stored_key,
                ..
            } = &mut state.kind
        {
            debug_assert_eq!(
                *stored_key, key,
                "pending state keyed under a different cube key"
            );
            *attempts += 1;
            if *attempts < max_attempts {
                self.queue.push_back(key);
                return true;
            }
        }
        self.pending.remove(&key);
        false
    }

    /// Seconds since a cube request was first issued, used by the caller to
    /// decide whether `request_timeout` has elapsed.
    pub fn pending_cube_age_secs(&self, key: &CubeKey) -> Option<u64> {
        self.pending
            .get(key)
            .map(|s| now().saturating_sub(s.requested_at))
    }

    /// Seconds since a notification request was first issued.
    pub fn pending_notifications_age_secs(&self, recipient: &NotificationKey) -> Option<u64> {
        self.pending_notifications
            .get(recipient)
            .map(|s| now().saturating_sub(s.requested_at))
    }

    /// Mark a notification request as failed and re-queue it if under the
    /// retry cap, mirroring `fail_and_maybe_retry` for cubes.
    pub fn fail_and_maybe_retry_notifications(
        &mut self,
        recipient: NotificationKey,
        max_attempts: u32,
    ) -> bool {
        if let Some(state) = self.pending_notifications.get_mut(&recipient)
            && let PendingKind::Notifications {
                attempts,
                recipient: stored,
                ..
            } = &mut state.kind
        {
            debug_assert_eq!(
                *stored, recipient,
                "pending state keyed under a different recipient"
            );
            *attempts += 1;
            if *attempts < max_attempts {
                self.notify_queue.push_back(recipient);
                return true;
            }
        }
        self.pending_notifications.remove(&recipient);
        false
    }

    pub fn subscribe_cube(&mut self, key: CubeKey) {
        self.subscriptions.insert(key);
    }

    pub fn unsubscribe_cube(&mut self, key: &CubeKey) {
        self.subscriptions.remove(key);
    }

    pub fn is_subscribed_cube(&self, key: &CubeKey) -> bool {
        self.subscriptions.contains(key)
    }

    pub fn subscribe_notifications(&mut self, recipient: NotificationKey) {
        self.notification_subscriptions.insert(recipient);
    }

    pub fn is_subscribed_notifications(&self, recipient: &NotificationKey) -> bool {
        self.notification_subscriptions.contains(recipient)
    }

    /// Request notifications for a recipient, same single-in-flight
    /// discipline as cube requests.
    pub fn request_notifications(&mut self, recipient: NotificationKey) -> EnqueueOutcome {
        if self.pending_notifications.contains_key(&recipient) {
            return EnqueueOutcome::MergedIntoExisting;
        }
        self.pending_notifications.insert(
            recipient,
            PendingState {
                kind: PendingKind::Notifications {
                    recipient,
                    attempts: 0,
                },
                requested_at: now(),
            },
        );
        self.notify_queue.push_back(recipient);
        EnqueueOutcome::NewRequest
    }

    pub fn resolve_notifications(&mut self, recipient: NotificationKey) {
        self.pending_notifications.remove(&recipient);
    }

    /// The request-scale factor applied per peer, given the current peer
    /// count and a configured floor denominator (open question (a)).
    pub fn requests_per_peer(&self, total_pending: usize, denominator: usize) -> usize {
        if denominator == 0 {
            return total_pending;
        }
        total_pending.div_ceil(denominator)
    }

    /// Cancel every pending request, resolving their receivers to a
    /// dropped-sender error (the caller observes this as `Cancelled`). Used
    /// on scheduler shutdown.
    pub fn shutdown(&mut self) {
        self.pending.clear();
        self.pending_notifications.clear();
        self.queue.clear();
        self.notify_queue.clear();
    }
}

/// Shared handle so multiple tasks (connection readers, the batch-flush
/// timer) can drive one scheduler instance, matching the actor-with-mutex
/// pattern used elsewhere in this crate for single-owner state reached from
/// several tokio tasks.
pub type SharedScheduler = Arc<Mutex<RequestScheduler>>;

pub fn new_shared(max_batch_size: usize) -> SharedScheduler {
    Arc::new(Mutex::new(RequestScheduler::new(max_batch_size)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> CubeKey {
        CubeKey::new([b; 32])
    }

    #[tokio::test]
    async fn duplicate_requests_for_same_key_merge() {
        let mut sched = RequestScheduler::new(10);
        let (outcome1, rx1) = sched.request_cube(key(1));
        assert!(matches!(outcome1, EnqueueOutcome::NewRequest));
        let (outcome2, rx2) = sched.request_cube(key(1));
        assert!(matches!(outcome2, EnqueueOutcome::MergedIntoExisting));
        assert_eq!(sched.in_flight_count(), 1);

        sched.resolve_cube(key(1), vec![9, 9]);
        assert_eq!(rx1.await.unwrap(), vec![9, 9]);
        assert_eq!(rx2.await.unwrap(), vec![9, 9]);
    }

    #[test]
    fn drain_batch_respects_max_size() {
        let mut sched = RequestScheduler::new(2);
        sched.request_cube(key(1));
        sched.request_cube(key(2));
        sched.request_cube(key(3));
        let batch = sched.drain_batch();
        assert_eq!(batch.len(), 2);
        let rest = sched.drain_batch();
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn failed_request_retries_until_attempt_cap() {
        let mut sched = RequestScheduler::new(10);
        sched.request_cube(key(1));
        assert!(sched.fail_and_maybe_retry(key(1), 3));
        assert!(sched.fail_and_maybe_retry(key(1), 3));
        assert!(!sched.fail_and_maybe_retry(key(1), 3));
        assert!(!sched.is_in_flight(&key(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn shortenable_timeout_fires_at_initial_deadline() {
        let mut t = ShortenableTimeout::new(Duration::from_millis(100));
        let start = Instant::now();
        t.wait().await;
        assert!(Instant::now() >= start + Duration::from_millis(100));
    }

    #[test]
    fn shortening_to_a_later_deadline_is_a_noop() {
        let mut t = ShortenableTimeout::new(Duration::from_secs(10));
        let original = t.deadline();
        let changed = t.shorten_to(Duration::from_secs(20));
        assert!(!changed);
        assert_eq!(t.deadline(), original);
    }

    #[test]
    fn shortening_to_an_earlier_deadline_moves_it() {
        let mut t = ShortenableTimeout::new(Duration::from_secs(10));
        let changed = t.shorten_to(Duration::from_millis(1));
        assert!(changed);
        assert!(t.deadline() < Instant::now() + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_after_fire_starts_a_fresh_timeout() {
        let mut t = ShortenableTimeout::new(Duration::from_millis(10));
        t.wait().await;
        assert!(t.fired);
        let changed = t.shorten_to(Duration::from_secs(5));
        assert!(changed);
        assert!(!t.fired);
    }
}
