use governor::clock::{Clock, DefaultClock, Reference};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::server::monitoring::{TargetLabels, AVAILABILITY_METRICS};

/// Failure votes needed, together with [`TICKET_SILENCE`], to mark a target down.
pub const TICKET_THRESHOLD: u32 = 10;
/// Silence that must accompany a full ticket.
pub const TICKET_SILENCE: Duration = Duration::from_secs(5);
/// Silence after which any failure report marks the target down.
pub const MAX_SILENCE: Duration = Duration::from_secs(10);

pub(crate) type DirectLimiter<C> =
    RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// One accepted vote per second per target.
pub(crate) fn vote_quota() -> Quota {
    Quota::per_second(nonzero!(1u32))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityState<I> {
    pub reachable: bool,
    pub on_failure_probation: bool,
    pub failure_ticket: u32,
    pub last_success: I,
}

/// Hysteresis voter deciding whether one target is reachable.
///
/// Failure and success votes each pass through their own 1/s limiter, so a
/// storm of reports moves the ticket at most once per second. A target goes
/// down when `(ticket >= 10 && silence > 5s) || silence > 10s`, where silence
/// is the time since the last reported success.
pub struct AvailabilityVoter<C: Clock = DefaultClock> {
    target: String,
    clock: C,
    state: RwLock<AvailabilityState<C::Instant>>,
    failure_votes: DirectLimiter<C>,
    success_votes: DirectLimiter<C>,
}

impl AvailabilityVoter<DefaultClock> {
    pub fn new(target: impl Into<String>) -> Self {
        Self::with_clock(target, DefaultClock::default())
    }
}

impl<C: Clock> AvailabilityVoter<C> {
    /// Starts reachable, as a freshly configured target is presumed healthy.
    pub fn with_clock(target: impl Into<String>, clock: C) -> Self {
        let now = clock.now();
        Self {
            target: target.into(),
            failure_votes: RateLimiter::direct_with_clock(vote_quota(), &clock),
            success_votes: RateLimiter::direct_with_clock(vote_quota(), &clock),
            state: RwLock::new(AvailabilityState {
                reachable: true,
                on_failure_probation: false,
                failure_ticket: 0,
                last_success: now,
            }),
            clock,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Resets to a known verdict, e.g. after an initial health probe.
    pub fn init(&self, healthy: bool) {
        let mut state = self.write_state();
        state.reachable = healthy;
        state.on_failure_probation = !healthy;
        state.failure_ticket = 0;
        state.last_success = self.clock.now();
        drop(state);
        self.publish(healthy);
    }

    pub fn is_available(&self) -> bool {
        self.read_state().reachable
    }

    pub fn snapshot(&self) -> AvailabilityState<C::Instant> {
        *self.read_state()
    }

    pub fn report_success(&self) {
        let mut state = self.write_state();
        state.last_success = self.clock.now();
        // While reachable only the silence clock moves; the ticket keeps its votes.
        if state.reachable {
            return;
        }
        if !state.on_failure_probation || self.success_votes.check().is_err() {
            return;
        }

        debug!(
            event = "availability_success_vote",
            target = %self.target,
            "Success vote accepted"
        );
        let recovered = !state.reachable;
        state.on_failure_probation = false;
        state.reachable = true;
        state.failure_ticket = 0;
        drop(state);

        if recovered {
            info!(event = "target_available", target = %self.target, "Target is available");
            self.publish(true);
        }
    }

    /// Records a failure. Returns `true` iff the target is, or just became, unreachable.
    pub fn report_failure(&self) -> bool {
        let mut state = self.write_state();
        if !state.reachable {
            return true;
        }
        state.on_failure_probation = true;

        if self.failure_votes.check().is_ok() {
            state.failure_ticket += 1;
            debug!(
                event = "availability_failure_vote",
                target = %self.target,
                ticket = state.failure_ticket,
                "Failure vote accepted"
            );
            if let Some(metrics) = AVAILABILITY_METRICS.get() {
                metrics
                    .failure_votes
                    .get_or_create(&TargetLabels::new(&self.target))
                    .inc();
            }
        }

        let silence: Duration = self.clock.now().duration_since(state.last_success).into();
        let ticket_path = state.failure_ticket >= TICKET_THRESHOLD && silence > TICKET_SILENCE;
        if !(ticket_path || silence > MAX_SILENCE) {
            return false;
        }

        state.reachable = false;
        state.failure_ticket = 0;
        drop(state);

        info!(
            event = "target_unavailable",
            target = %self.target,
            silence_ms = silence.as_millis() as u64,
            "Target is not available"
        );
        if let Some(metrics) = AVAILABILITY_METRICS.get() {
            metrics
                .transitions_down
                .get_or_create(&TargetLabels::new(&self.target))
                .inc();
        }
        self.publish(false);
        true
    }

    fn publish(&self, reachable: bool) {
        if let Some(metrics) = AVAILABILITY_METRICS.get() {
            metrics
                .target_available
                .get_or_create(&TargetLabels::new(&self.target))
                .set(i64::from(reachable));
        }
    }

    // A poisoned lock still holds a consistent state: every write is a set of
    // plain field stores that cannot panic half-way.
    fn read_state(&self) -> RwLockReadGuard<'_, AvailabilityState<C::Instant>> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, AvailabilityState<C::Instant>> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
