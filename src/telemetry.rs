//! Telemetry for the admission pipeline.
//!
//! One [`GateEvent`] describes each admission decision and each released
//! request. A sink is nothing more than a cloneable
//! `tower::Service<GateEvent>`; [`TelemetrySink`] is blanket-implemented, so
//! the bundled sinks and anything assembled from tower combinators plug in the
//! same way.
//!
//! Emission is fire-and-forget: [`emit`] drives the sink to readiness, hands
//! it the event, and ignores the rest. A sink that is slow or failing loses
//! events; it never slows a request down.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::{ready, Ready};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tower::{Service, ServiceExt};

use crate::admission::Outcome;

/// Events emitted around admission decisions and request completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateEvent {
    /// A request was admitted; `active` includes it.
    Admitted { active: usize, ceiling: usize },
    /// An admission attempt found the limiter saturated and slept before its
    /// single retry. `slept` is the latency estimate the wait was based on.
    /// Reported by the controller itself, never inferred from counters.
    Waited { slept: Duration },
    /// An admission attempt gave up.
    Rejected { active: usize, ceiling: usize },
    /// An admitted request finished and released its slot; `ceiling` is the
    /// value after the release was applied.
    Released {
        outcome: Outcome,
        elapsed: Duration,
        ceiling: usize,
    },
}

impl fmt::Display for GateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admitted { active, ceiling } => {
                write!(f, "admitted: active={active}, ceiling={ceiling}")
            }
            Self::Waited { slept } => write!(f, "waited: slept={slept:?}"),
            Self::Rejected { active, ceiling } => {
                write!(f, "rejected: active={active}, ceiling={ceiling}")
            }
            Self::Released {
                outcome,
                elapsed,
                ceiling,
            } => write!(
                f,
                "released: outcome={outcome:?}, elapsed={elapsed:?}, ceiling={ceiling}"
            ),
        }
    }
}

/// Anything the gateway can emit events into.
///
/// Blanket-implemented for every cloneable `tower::Service<GateEvent>` that
/// responds with `()` and whose future is `Send`; there is nothing to
/// implement by hand.
pub trait TelemetrySink: Service<GateEvent, Response = ()> + Clone + Send + 'static
where
    Self::Future: Send,
{
}

impl<S> TelemetrySink for S
where
    S: Service<GateEvent, Response = ()> + Clone + Send + 'static,
    S::Future: Send,
{
}

/// Fire-and-forget emission.
///
/// Readiness is awaited and the outcome discarded, whether the sink refused
/// the event or processed it. Dropped events only show up as a trace line.
pub async fn emit<S: TelemetrySink>(sink: S, event: GateEvent)
where
    S::Future: Send,
{
    if sink.oneshot(event).await.is_err() {
        tracing::trace!("telemetry event dropped");
    }
}

/// Discards everything. The gateway's default.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl Service<GateEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: GateEvent) -> Self::Future {
        ready(Ok(()))
    }
}

/// Forwards each event to `tracing` at INFO level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl Service<GateEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GateEvent) -> Self::Future {
        tracing::info!(%event, "admission telemetry");
        ready(Ok(()))
    }
}

/// Keeps the most recent events in a bounded ring. For tests and debugging.
#[derive(Clone, Debug)]
pub struct MemorySink {
    buffer: Arc<Mutex<VecDeque<GateEvent>>>,
    capacity: usize,
}

impl MemorySink {
    /// A sink remembering the last 1,000 events.
    pub fn new() -> Self {
        Self::with_capacity(1_000)
    }

    /// A sink with an explicit bound; at least one event is always kept.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// The recorded events, oldest first.
    pub fn events(&self) -> Vec<GateEvent> {
        self.buffer.lock().unwrap().iter().cloned().collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.buffer.lock().unwrap().clear();
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<GateEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GateEvent) -> Self::Future {
        let mut buffer = self.buffer.lock().unwrap();
        while buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(event);
        ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct RefusingSink;

    impl Service<GateEvent> for RefusingSink {
        type Response = ();
        type Error = std::io::Error;
        type Future = Ready<Result<(), std::io::Error>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _event: GateEvent) -> Self::Future {
            ready(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "sink full",
            )))
        }
    }

    #[tokio::test]
    async fn memory_sink_records_in_order() {
        let sink = MemorySink::new();
        emit(
            sink.clone(),
            GateEvent::Admitted {
                active: 1,
                ceiling: 15,
            },
        )
        .await;
        emit(
            sink.clone(),
            GateEvent::Released {
                outcome: Outcome::Ok,
                elapsed: Duration::from_millis(12),
                ceiling: 15,
            },
        )
        .await;

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], GateEvent::Admitted { active: 1, .. }));
        assert!(matches!(
            events[1],
            GateEvent::Released {
                outcome: Outcome::Ok,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn memory_sink_keeps_only_the_newest() {
        let sink = MemorySink::with_capacity(2);
        for active in 0..3 {
            emit(sink.clone(), GateEvent::Admitted { active, ceiling: 5 }).await;
        }
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], GateEvent::Admitted { active: 1, .. }));
        assert!(matches!(events[1], GateEvent::Admitted { active: 2, .. }));
    }

    #[tokio::test]
    async fn memory_sink_can_be_cleared() {
        let sink = MemorySink::new();
        emit(sink.clone(), GateEvent::Rejected { active: 5, ceiling: 5 }).await;
        assert_eq!(sink.events().len(), 1);
        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn emit_swallows_sink_errors() {
        // Completes without propagating the sink's failure.
        emit(
            RefusingSink,
            GateEvent::Waited {
                slept: Duration::from_millis(50),
            },
        )
        .await;
        emit(
            NullSink,
            GateEvent::Rejected {
                active: 5,
                ceiling: 5,
            },
        )
        .await;
    }

    #[test]
    fn event_display_is_compact() {
        let event = GateEvent::Waited {
            slept: Duration::from_millis(250),
        };
        assert_eq!(event.to_string(), "waited: slept=250ms");
        let event = GateEvent::Admitted {
            active: 3,
            ceiling: 10,
        };
        assert_eq!(event.to_string(), "admitted: active=3, ceiling=10");
    }
}
