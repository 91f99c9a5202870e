//! Renewal scheduler.
//!
//! Owns at most one pending renewal timer. Arming a timer always cancels the
//! previous one first, so two renewals for the same scheduler can never be
//! pending at once. A successful renewal stores the new credential and arms
//! the next timer; a failed one leaves the scheduler idle until the next
//! login.
//!
//! # States
//!
//! - `Idle`: no timer pending.
//! - `Scheduled`: exactly one timer pending.
//! - `Renewing`: the timer fired and the renewal request is in flight.
//!
//! Every transition happens under one async mutex. Each `schedule`/`cancel`
//! bumps a generation counter; a fired timer or a finished renewal whose
//! generation is no longer current has been superseded and is discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::RenewalClient;
use crate::clock::{Clock, SystemClock};
use crate::credential::{Credential, DEFAULT_RENEWAL_MARGIN, renewal_delay};
use crate::error::RenewalFailureKind;
use crate::events::{SessionEvent, SessionEventBroadcaster};
use crate::store::CredentialStore;

// Timer deadline used when `now + delay` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Callback invoked with `(token, expires_at)` after every successful renewal.
pub type RenewalObserver = Arc<dyn Fn(&str, i64) + Send + Sync>;

/// Snapshot of the scheduler state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Scheduled {
        /// Wall-clock fire time in epoch milliseconds.
        fires_at: i64,
        delay: Duration,
    },
    Renewing,
}

impl SchedulerState {
    #[inline]
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    #[inline]
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled { .. })
    }
}

/// Result of [`RenewalScheduler::schedule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A timer was armed.
    Armed { delay: Duration, fires_at: i64 },
    /// The credential is already inside its renewal window (or expired); no
    /// timer was armed and the scheduler is idle.
    Skipped,
}

struct PendingTimer {
    fires_at: i64,
    delay: Duration,
    handle: JoinHandle<()>,
}

enum Phase {
    Idle,
    Scheduled(PendingTimer),
    Renewing,
}

struct Slot {
    generation: u64,
    phase: Phase,
    last_failure: Option<RenewalFailureKind>,
}

impl Slot {
    /// Invalidate the current generation and drop any pending timer.
    ///
    /// Returns true if a timer was pending.
    fn cancel_pending(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Scheduled(timer) => {
                timer.handle.abort();
                true
            }
            Phase::Renewing | Phase::Idle => false,
        }
    }
}

struct Inner {
    slot: Mutex<Slot>,
    client: Arc<dyn RenewalClient>,
    store: CredentialStore,
    clock: Arc<dyn Clock>,
    margin: Duration,
    observer: Option<RenewalObserver>,
    events: SessionEventBroadcaster,
    armed: AtomicU64,
}

impl Inner {
    fn schedule_locked(self: &Arc<Self>, slot: &mut Slot, credential: Credential) -> ScheduleOutcome {
        if slot.cancel_pending() {
            debug!("Replaced pending renewal timer");
        }

        let now = self.clock.now_millis();
        let expires_at = credential.expires_at;

        let Some(delay) = renewal_delay(&credential, now, self.margin) else {
            debug!(
                expires_at,
                remaining_ms = credential.remaining_millis(now),
                "Credential is inside its renewal window; not scheduling"
            );
            self.events.publish(SessionEvent::RenewalSkipped { expires_at });
            return ScheduleOutcome::Skipped;
        };

        let generation = slot.generation;
        let fires_at = now.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));
        let now_instant = tokio::time::Instant::now();
        let deadline = now_instant
            .checked_add(delay)
            .unwrap_or_else(|| now_instant + FAR_FUTURE);
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(generation, credential).await;
            }
        });

        slot.phase = Phase::Scheduled(PendingTimer {
            fires_at,
            delay,
            handle,
        });
        self.armed.fetch_add(1, Ordering::SeqCst);

        debug!(expires_at, fires_at, delay_ms = delay.as_millis() as u64, "Renewal timer armed");
        self.events
            .publish(SessionEvent::RenewalScheduled { expires_at, fires_at });

        ScheduleOutcome::Armed { delay, fires_at }
    }

    async fn fire(self: Arc<Self>, generation: u64, credential: Credential) {
        {
            let mut slot = self.slot.lock().await;
            if slot.generation != generation {
                debug!("Ignoring superseded renewal timer");
                return;
            }
            // Drops this task's own handle, which only detaches it.
            slot.phase = Phase::Renewing;
        }

        debug!(expires_at = credential.expires_at, "Renewal timer fired");
        let result = self.client.renew(&credential).await;

        let mut slot = self.slot.lock().await;
        if slot.generation != generation {
            info!("Renewal finished after the session was cancelled or rescheduled; discarding result");
            return;
        }

        match result {
            Ok(renewed) => {
                if let Err(e) = self.store.set(&renewed).await {
                    warn!(error = %e, "Failed to persist renewed credential (non-fatal)");
                }
                slot.last_failure = None;

                if let Some(observer) = &self.observer {
                    observer(&renewed.token, renewed.expires_at);
                }

                info!(expires_at = renewed.expires_at, "Credential renewed");
                self.events.publish(SessionEvent::Renewed {
                    expires_at: renewed.expires_at,
                });

                self.schedule_locked(&mut slot, renewed);
            }
            Err(e) => {
                let kind = e.kind();
                slot.phase = Phase::Idle;
                slot.last_failure = Some(kind);

                warn!(%kind, error = %e, "Credential renewal failed; automatic renewal stopped");
                self.events.publish(SessionEvent::RenewalStopped {
                    kind,
                    reason: e.to_string(),
                });
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Phase::Scheduled(timer) = &self.slot.get_mut().phase {
            timer.handle.abort();
        }
    }
}

/// Keeps a credential alive by renewing it shortly before it expires.
///
/// Cheap to clone; clones share the same timer and state.
#[derive(Clone)]
pub struct RenewalScheduler {
    inner: Arc<Inner>,
}

impl RenewalScheduler {
    /// Start building a scheduler around a renewal client and a store.
    pub fn builder(client: Arc<dyn RenewalClient>, store: CredentialStore) -> RenewalSchedulerBuilder {
        RenewalSchedulerBuilder {
            client,
            store,
            clock: Arc::new(SystemClock),
            margin: DEFAULT_RENEWAL_MARGIN,
            observer: None,
            events: SessionEventBroadcaster::new(),
        }
    }

    /// Arm a renewal timer for `credential`, replacing any pending one.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn schedule(&self, credential: Credential) -> ScheduleOutcome {
        let mut slot = self.inner.slot.lock().await;
        self.inner.schedule_locked(&mut slot, credential)
    }

    /// Drop any pending timer. Idempotent.
    ///
    /// A renewal already in flight is left to finish, but its result is
    /// discarded. Returns true if a timer was pending.
    pub async fn cancel(&self) -> bool {
        let mut slot = self.inner.slot.lock().await;
        let was_pending = slot.cancel_pending();
        if was_pending {
            debug!("Renewal timer cancelled");
        }
        was_pending
    }

    pub async fn state(&self) -> SchedulerState {
        let slot = self.inner.slot.lock().await;
        match &slot.phase {
            Phase::Idle => SchedulerState::Idle,
            Phase::Scheduled(timer) => SchedulerState::Scheduled {
                fires_at: timer.fires_at,
                delay: timer.delay,
            },
            Phase::Renewing => SchedulerState::Renewing,
        }
    }

    /// Kind of the failure that stopped the last renewal cycle, if any.
    ///
    /// Reset by the next successful renewal.
    pub async fn last_failure(&self) -> Option<RenewalFailureKind> {
        self.inner.slot.lock().await.last_failure
    }

    /// Forget a recorded failure (a fresh login starts a new cycle).
    pub(crate) async fn reset_failure(&self) {
        self.inner.slot.lock().await.last_failure = None;
    }

    /// Number of timers armed over the lifetime of this scheduler.
    pub fn armed_count(&self) -> u64 {
        self.inner.armed.load(Ordering::SeqCst)
    }

    pub fn margin(&self) -> Duration {
        self.inner.margin
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Store that renewed credentials are written to.
    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn events(&self) -> &SessionEventBroadcaster {
        &self.inner.events
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("margin", &self.inner.margin)
            .field("armed", &self.armed_count())
            .finish_non_exhaustive()
    }
}

/// Builder for [`RenewalScheduler`].
pub struct RenewalSchedulerBuilder {
    client: Arc<dyn RenewalClient>,
    store: CredentialStore,
    clock: Arc<dyn Clock>,
    margin: Duration,
    observer: Option<RenewalObserver>,
    events: SessionEventBroadcaster,
}

impl RenewalSchedulerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    /// Callback invoked after every successful renewal.
    pub fn observer(mut self, observer: impl Fn(&str, i64) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Publish events through an existing broadcaster.
    pub fn events(mut self, events: SessionEventBroadcaster) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> RenewalScheduler {
        RenewalScheduler {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    generation: 0,
                    phase: Phase::Idle,
                    last_failure: None,
                }),
                client: self.client,
                store: self.store,
                clock: self.clock,
                margin: self.margin,
                observer: self.observer,
                events: self.events,
                armed: AtomicU64::new(0),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex as SyncMutex;

    use super::*;
    use crate::clock::TokioClock;
    use crate::error::RenewalError;
    use crate::testing::{Reply, ScriptedClient, settle};

    const T0: i64 = 1_700_000_000_000;

    struct Fixture {
        scheduler: RenewalScheduler,
        client: Arc<ScriptedClient>,
        store: CredentialStore,
        observed: Arc<SyncMutex<Vec<(String, i64)>>>,
    }

    fn fixture(replies: Vec<Reply>) -> Fixture {
        let clock = Arc::new(TokioClock::new(T0));
        let client = Arc::new(ScriptedClient::new(clock.clone(), replies));
        let store = CredentialStore::in_memory();
        let observed = Arc::new(SyncMutex::new(Vec::new()));
        let sink = observed.clone();

        let scheduler = RenewalScheduler::builder(client.clone(), store.clone())
            .clock(clock)
            .observer(move |token, expires_at| sink.lock().push((token.to_string(), expires_at)))
            .build();

        Fixture {
            scheduler,
            client,
            store,
            observed,
        }
    }

    async fn advance_ms(ms: u64) {
        tokio::time::advance(Duration::from_millis(ms)).await;
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_expiry_minus_margin() {
        let f = fixture(vec![Reply::Lifetime(25_000)]);

        let outcome = f.scheduler.schedule(Credential::new("a", T0 + 25_000)).await;
        assert_eq!(
            outcome,
            ScheduleOutcome::Armed {
                delay: Duration::from_millis(5_000),
                fires_at: T0 + 5_000,
            }
        );
        assert_eq!(f.scheduler.armed_count(), 1);

        advance_ms(4_999).await;
        assert_eq!(f.client.calls(), 0);

        advance_ms(1).await;
        assert_eq!(f.client.calls(), 1);
        assert_eq!(f.client.tokens_seen(), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inside_margin_arms_nothing() {
        let f = fixture(vec![]);

        let outcome = f.scheduler.schedule(Credential::new("a", T0 + 10_000)).await;
        assert_eq!(outcome, ScheduleOutcome::Skipped);
        assert_eq!(f.scheduler.state().await, SchedulerState::Idle);
        assert_eq!(f.scheduler.armed_count(), 0);

        advance_ms(60_000).await;
        assert_eq!(f.client.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_cancels_previous_timer() {
        let f = fixture(vec![Reply::Lifetime(25_000)]);

        f.scheduler.schedule(Credential::new("a", T0 + 25_000)).await;
        let outcome = f.scheduler.schedule(Credential::new("b", T0 + 1_000)).await;
        assert_eq!(outcome, ScheduleOutcome::Skipped);
        assert!(f.scheduler.state().await.is_idle());

        advance_ms(30_000).await;
        assert_eq!(f.client.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_schedule_replaces_first() {
        let f = fixture(vec![Reply::Lifetime(10_000)]);

        f.scheduler.schedule(Credential::new("a", T0 + 25_000)).await;
        f.scheduler.schedule(Credential::new("b", T0 + 30_000)).await;
        assert_eq!(f.scheduler.armed_count(), 2);
        assert_eq!(
            f.scheduler.state().await,
            SchedulerState::Scheduled {
                fires_at: T0 + 10_000,
                delay: Duration::from_millis(10_000),
            }
        );

        // The first timer would have fired here.
        advance_ms(5_000).await;
        assert_eq!(f.client.calls(), 0);

        advance_ms(5_000).await;
        assert_eq!(f.client.calls(), 1);
        assert_eq!(f.client.tokens_seen(), vec!["b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_chains_next_timer() {
        let f = fixture(vec![
            Reply::Lifetime(25_000),
            Reply::Lifetime(25_000),
            Reply::Lifetime(25_000),
        ]);

        f.scheduler.schedule(Credential::new("a", T0 + 25_000)).await;

        advance_ms(5_000).await;
        assert_eq!(f.client.calls(), 1);
        assert_eq!(f.scheduler.armed_count(), 2);
        assert_eq!(
            f.scheduler.state().await,
            SchedulerState::Scheduled {
                fires_at: T0 + 10_000,
                delay: Duration::from_millis(5_000),
            }
        );
        assert_eq!(
            f.store.get().await.unwrap(),
            Some(Credential::new("tok-1", T0 + 30_000))
        );

        advance_ms(5_000).await;
        assert_eq!(f.client.calls(), 2);
        assert_eq!(f.scheduler.armed_count(), 3);
        assert_eq!(f.client.tokens_seen(), vec!["a".to_string(), "tok-1".to_string()]);

        assert!(f.scheduler.cancel().await);
        advance_ms(60_000).await;
        assert_eq!(f.client.calls(), 2);
        assert!(f.scheduler.state().await.is_idle());

        assert_eq!(
            *f.observed.lock(),
            vec![
                ("tok-1".to_string(), T0 + 30_000),
                ("tok-2".to_string(), T0 + 35_000),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_stop_the_cycle() {
        let failures = [
            (RenewalError::NoResponse("down".into()), RenewalFailureKind::NoResponse),
            (RenewalError::MissingAuthHeader, RenewalFailureKind::MissingAuthHeader),
            (
                RenewalError::InvalidExpiration(Some("soon".into())),
                RenewalFailureKind::InvalidExpiration,
            ),
        ];

        for (error, kind) in failures {
            let f = fixture(vec![Reply::Fail(error), Reply::Lifetime(25_000)]);
            let mut events = f.scheduler.events().subscribe();

            f.scheduler.schedule(Credential::new("a", T0 + 25_000)).await;
            advance_ms(5_000).await;

            assert_eq!(f.client.calls(), 1);
            assert!(f.scheduler.state().await.is_idle());
            assert_eq!(f.scheduler.last_failure().await, Some(kind));
            assert_eq!(f.scheduler.armed_count(), 1);
            assert!(f.observed.lock().is_empty());
            assert_eq!(f.store.get().await.unwrap(), None);

            advance_ms(120_000).await;
            assert_eq!(f.client.calls(), 1);

            let mut stopped = None;
            while let Ok(event) = events.try_recv() {
                if let SessionEvent::RenewalStopped { kind, .. } = event {
                    stopped = Some(kind);
                }
            }
            assert_eq!(stopped, Some(kind));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let f = fixture(vec![]);
        assert!(!f.scheduler.cancel().await);

        f.scheduler.schedule(Credential::new("a", T0 + 25_000)).await;
        assert!(f.scheduler.cancel().await);
        assert!(!f.scheduler.cancel().await);
        assert!(f.scheduler.state().await.is_idle());

        advance_ms(10_000).await;
        assert_eq!(f.client.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_flight_discards_result() {
        let clock = Arc::new(TokioClock::new(T0));
        let client = Arc::new(
            ScriptedClient::new(clock.clone(), vec![Reply::Lifetime(25_000)])
                .with_latency(Duration::from_millis(1_000)),
        );
        let store = CredentialStore::in_memory();
        let observed = Arc::new(AtomicUsize::new(0));
        let counter = observed.clone();
        let scheduler = RenewalScheduler::builder(client.clone(), store.clone())
            .clock(clock)
            .observer(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        scheduler.schedule(Credential::new("a", T0 + 25_000)).await;
        advance_ms(5_000).await;
        assert_eq!(client.calls(), 1);
        assert_eq!(scheduler.state().await, SchedulerState::Renewing);

        advance_ms(500).await;
        assert!(!scheduler.cancel().await);
        assert!(scheduler.state().await.is_idle());

        advance_ms(1_000).await;
        assert!(scheduler.state().await.is_idle());
        assert_eq!(store.get().await.unwrap(), None);
        assert_eq!(observed.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.armed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_scheduler_aborts_timer() {
        let f = fixture(vec![Reply::Lifetime(25_000)]);
        let client = f.client.clone();

        f.scheduler.schedule(Credential::new("a", T0 + 25_000)).await;
        drop(f);

        advance_ms(10_000).await;
        assert_eq!(client.calls(), 0);
    }
}
