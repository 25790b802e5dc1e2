//! Adaptive admission control for in-flight request concurrency.
//!
//! The [`AdmissionController`] bounds how many requests may execute at once and
//! tunes that bound from observed outcomes, AIMD-style: every successful
//! completion raises the ceiling by one slot (up to a hard cap), while a
//! canceled request (the usual signature of overload-driven timeouts) cuts it
//! back toward the floor. Internal errors are treated as noise and move
//! nothing.
//!
//! Alongside the ceiling, the controller keeps an online estimate of typical
//! request latency. When the limiter is saturated, [`AdmissionController::admit`]
//! consults that estimate: if a slot is predicted to free up within the
//! configured wait budget it briefly waits and retries once, otherwise it
//! rejects immediately. The estimate rises instantly to any slower observation
//! and decays quickly on faster ones, so saturation errs toward rejecting
//! rather than queueing.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::ClientError;

const DEFAULT_MAX_CEILING: usize = 15;
const DEFAULT_MIN_CEILING: usize = 2;
const DEFAULT_WAIT_BUDGET: Duration = Duration::from_secs(3);

/// The stable, client-visible denial message.
pub const ADMISSION_DENIED_MESSAGE: &str = "limit is reached, please try again later";

/// Classification of a completed request, reported at release.
///
/// The controller's update rule is a three-way switch on this tag; richer
/// signals (e.g. downstream throttling) belong in a separate input channel,
/// not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Execution completed and produced a value.
    Ok,
    /// Execution failed with a non-cancellation error.
    Error,
    /// The caller's context was canceled or its deadline expired before
    /// execution completed.
    Canceled,
}

/// Token for one admitted request.
///
/// A permit is handed out by [`AdmissionController::admit`] and consumed by
/// [`AdmissionController::release`]. It is deliberately not `Clone`: release
/// takes it by value, so a permit cannot be released twice. Dropping a permit
/// without releasing it leaves the active count permanently inflated; callers
/// own exactly one release per admission.
#[derive(Debug)]
pub struct AdmissionPermit {
    started_at: Instant,
    predicted_at: Instant,
}

impl AdmissionPermit {
    /// When this request was admitted.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// When this request was predicted to complete, based on the latency
    /// estimate at admission time.
    pub fn predicted_at(&self) -> Instant {
        self.predicted_at
    }
}

/// Construction parameters for an [`AdmissionController`].
///
/// Any zero field is replaced with its default at construction, so a partially
/// filled config is valid.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionConfig {
    /// Absolute ceiling on concurrent admissions. Default 15.
    pub max_ceiling: usize,
    /// Floor the adaptive ceiling cannot cross. Default 2.
    pub min_ceiling: usize,
    /// Upper bound on how long a single `admit` call may wait before
    /// rejecting; also the initial latency estimate. Default 3 s.
    pub wait_budget: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_ceiling: DEFAULT_MAX_CEILING,
            min_ceiling: DEFAULT_MIN_CEILING,
            wait_budget: DEFAULT_WAIT_BUDGET,
        }
    }
}

struct ControllerState {
    active_count: usize,
    current_ceiling: usize,
    predicted_duration: Duration,
}

/// The admission controller: one per HTTP endpoint, shared across all request
/// tasks via `Arc`.
///
/// All mutable state lives behind a single mutex. `admit` may sleep once,
/// bounded by the wait budget; `release` never sleeps.
pub struct AdmissionController {
    max_ceiling: usize,
    min_ceiling: usize,
    wait_budget: Duration,
    state: Mutex<ControllerState>,
}

impl AdmissionController {
    /// Create a controller from `config`, replacing zero fields with defaults.
    ///
    /// The effective ceiling starts at `max_ceiling` and the latency estimate
    /// starts at `wait_budget`.
    pub fn new(config: AdmissionConfig) -> Self {
        let max_ceiling = if config.max_ceiling == 0 {
            DEFAULT_MAX_CEILING
        } else {
            config.max_ceiling
        };
        // The floor cannot sit above the ceiling.
        let min_ceiling = if config.min_ceiling == 0 {
            DEFAULT_MIN_CEILING
        } else {
            config.min_ceiling
        }
        .min(max_ceiling);
        let wait_budget = if config.wait_budget.is_zero() {
            DEFAULT_WAIT_BUDGET
        } else {
            config.wait_budget
        };
        Self {
            max_ceiling,
            min_ceiling,
            wait_budget,
            state: Mutex::new(ControllerState {
                active_count: 0,
                current_ceiling: max_ceiling,
                predicted_duration: wait_budget,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        // Nothing panics while holding the lock, so a poisoned mutex only
        // means some caller unwound elsewhere; the state itself is intact.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attempt to admit one request.
    ///
    /// Fast path: if the active count is under the current ceiling, the request
    /// is admitted immediately. Otherwise, when `allow_wait` is set and the
    /// latency estimate fits inside the wait budget, this waits for one
    /// predicted request duration and retries exactly once before rejecting.
    /// Total wall time is therefore bounded by the wait budget.
    ///
    /// Waiters are not queued; on wakeup they compete with everyone else for
    /// a slot. The goal is load shedding, not fairness.
    pub async fn admit(&self, allow_wait: bool) -> Result<AdmissionPermit, ClientError> {
        self.admit_inner(allow_wait).await.0
    }

    /// `admit` with the wait surfaced: the second element is how long the
    /// attempt slept before its retry, `None` when it never slept. The gateway
    /// turns this into telemetry; the public [`admit`](Self::admit) discards
    /// it.
    pub(crate) async fn admit_inner(
        &self,
        allow_wait: bool,
    ) -> (Result<AdmissionPermit, ClientError>, Option<Duration>) {
        if let Some(permit) = self.try_admit() {
            return (Ok(permit), None);
        }
        let mut slept = None;
        if allow_wait {
            let predicted = self.predicted_duration();
            if predicted <= self.wait_budget {
                tracing::debug!(
                    wait = ?predicted,
                    "admission at ceiling, waiting for a predicted slot"
                );
                tokio::time::sleep(predicted).await;
                slept = Some(predicted);
                if let Some(permit) = self.try_admit() {
                    return (Ok(permit), slept);
                }
            }
        }
        tracing::debug!(
            active = self.active_count(),
            ceiling = self.current_ceiling(),
            "admission denied"
        );
        (Err(ClientError::new(ADMISSION_DENIED_MESSAGE)), slept)
    }

    fn try_admit(&self) -> Option<AdmissionPermit> {
        let mut state = self.state();
        if state.active_count < state.current_ceiling {
            state.active_count += 1;
            let started_at = Instant::now();
            let predicted_at = started_at + state.predicted_duration;
            drop(state);
            return Some(AdmissionPermit {
                started_at,
                predicted_at,
            });
        }
        None
    }

    /// Release an admitted request, feeding its outcome back into the
    /// controller.
    ///
    /// The ceiling moves first: `Ok` adds a slot up to the cap, `Error` moves
    /// nothing, and `Canceled` subtracts, multiplicatively when the request ran
    /// past its predicted duration or the wait budget and by one slot
    /// otherwise. The latency estimate then absorbs the observed duration
    /// unless the outcome was `Error`, which says nothing about latency.
    pub fn release(&self, permit: AdmissionPermit, outcome: Outcome) {
        let mut state = self.state();
        if state.active_count == 0 {
            // Contract violation (release without admission); recover rather
            // than underflow.
            tracing::warn!("release without a matching admission");
        } else {
            state.active_count -= 1;
        }
        let elapsed = permit.started_at.elapsed();

        match outcome {
            Outcome::Ok => {
                if state.current_ceiling < self.max_ceiling {
                    state.current_ceiling += 1;
                }
            }
            Outcome::Error => {}
            Outcome::Canceled => {
                if state.current_ceiling > self.min_ceiling {
                    let from = state.current_ceiling;
                    if elapsed > state.predicted_duration || elapsed > self.wait_budget {
                        let cut = ((state.current_ceiling - self.min_ceiling) / 2).max(1);
                        state.current_ceiling -= cut;
                    } else {
                        state.current_ceiling -= 1;
                    }
                    tracing::debug!(
                        from,
                        to = state.current_ceiling,
                        elapsed = ?elapsed,
                        "ceiling lowered after canceled request"
                    );
                }
            }
        }

        if outcome != Outcome::Error {
            if elapsed >= state.predicted_duration {
                state.predicted_duration = elapsed;
            } else {
                let next = state.predicted_duration - (elapsed + state.predicted_duration) / 2;
                // elapsed < predicted on this branch, which keeps the result
                // strictly positive at nanosecond granularity.
                debug_assert!(next > Duration::ZERO);
                state.predicted_duration = next;
            }
        }
    }

    /// Number of currently admitted requests. Snapshot under the lock.
    pub fn active_count(&self) -> usize {
        self.state().active_count
    }

    /// The effective concurrency ceiling at this instant. Snapshot under the
    /// lock.
    pub fn current_ceiling(&self) -> usize {
        self.state().current_ceiling
    }

    /// Current estimate of typical request latency. Snapshot under the lock.
    pub fn predicted_duration(&self) -> Duration {
        self.state().predicted_duration
    }

    /// The configured hard ceiling.
    pub fn max_ceiling(&self) -> usize {
        self.max_ceiling
    }

    /// The configured floor.
    pub fn min_ceiling(&self) -> usize {
        self.min_ceiling
    }

    /// The configured wait budget.
    pub fn wait_budget(&self) -> Duration {
        self.wait_budget
    }

    /// Override the effective ceiling, clamped to `[min_ceiling, max_ceiling]`.
    ///
    /// Operational control for draining or pinning an endpoint; the adaptive
    /// loop keeps running from the new value.
    pub fn set_ceiling(&self, ceiling: usize) {
        let clamped = ceiling.clamp(self.min_ceiling, self.max_ceiling);
        let mut state = self.state();
        if state.current_ceiling != clamped {
            tracing::info!(from = state.current_ceiling, to = clamped, "ceiling override");
            state.current_ceiling = clamped;
        }
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("AdmissionController")
            .field("max_ceiling", &self.max_ceiling)
            .field("min_ceiling", &self.min_ceiling)
            .field("wait_budget", &self.wait_budget)
            .field("active_count", &state.active_count)
            .field("current_ceiling", &state.current_ceiling)
            .field("predicted_duration", &state.predicted_duration)
            .finish()
    }
}
