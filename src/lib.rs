#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! Adaptive admission control for GraphQL services: a self-tuning concurrency
//! limiter that bounds in-flight query executions, plus a tower-service HTTP
//! adapter that wires it in front of any GraphQL engine.
//!
//! ## How it works
//!
//! - An [`AdmissionController`] tracks active requests against an effective
//!   ceiling. Successful completions raise the ceiling additively; canceled
//!   requests (the usual face of overload timeouts) cut it multiplicatively
//!   toward a floor; internal errors move nothing.
//! - An online latency predictor bounds how long a saturated `admit` call is
//!   worth waiting: if typical requests finish inside the wait budget, the
//!   caller briefly waits for a slot to free; otherwise it is rejected
//!   immediately with a stable, client-safe message.
//! - [`GraphqlGateway`] turns one HTTP request into one
//!   admit → parse → prepare → execute → release cycle, classifying every
//!   termination path (including client disconnect) into the outcome the
//!   controller learns from.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use floodgate::{AdmissionConfig, AdmissionController, Outcome};
//!
//! #[tokio::main]
//! async fn main() {
//!     let controller = Arc::new(AdmissionController::new(AdmissionConfig {
//!         max_ceiling: 15,
//!         min_ceiling: 2,
//!         wait_budget: Duration::from_secs(3),
//!     }));
//!
//!     let permit = match controller.admit(true).await {
//!         Ok(permit) => permit,
//!         Err(denied) => {
//!             eprintln!("{denied}");
//!             return;
//!         }
//!     };
//!
//!     // ... run the request ...
//!
//!     controller.release(permit, Outcome::Ok);
//! }
//! ```

pub mod admission;
pub mod error;
pub mod graphql;
pub mod http;
pub mod telemetry;

// Re-exports
pub use admission::{
    AdmissionConfig, AdmissionController, AdmissionPermit, Outcome, ADMISSION_DENIED_MESSAGE,
};
pub use error::{is_canceled, root_cause, BoxError, Canceled, ClientError, GraphqlError};
pub use graphql::QueryBackend;
pub use crate::http::{ErrorHook, GraphqlGateway};
pub use telemetry::{GateEvent, LogSink, MemorySink, NullSink, TelemetrySink};
