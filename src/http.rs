//! The request-handler adapter: one HTTP request in, one admission cycle out.
//!
//! [`GraphqlGateway`] is a cloneable `tower_service::Service` over
//! `http::Request<Bytes>`, so any hyper/axum-style server can mount it once
//! bodies are collected. Per request it:
//!
//! 1. validates the transport envelope (POST, non-empty JSON body); failures
//!    here never reach the admission controller;
//! 2. asks the [`AdmissionController`] for a slot (`admit(true)`, exactly
//!    once);
//! 3. drives the backend: parse, prepare, execute;
//! 4. releases the slot with the outcome of whichever step terminated the
//!    request.
//!
//! Every response is HTTP 200 with the `{"data": …, "errors": …}` envelope;
//! admission denial, validation failures, and execution errors differ only in
//! the error message and `extensions.code`. The one exception is client-side
//! cancellation: the slot is released as `Canceled` and no body is written,
//! because nobody is left to read it.
//!
//! Cancellation is observed through a [`CancellationToken`] carried in the
//! request's extensions (servers insert one and cancel it on client
//! disconnect; absent a token, the request is treated as non-cancelable). The
//! gateway also guards the admission slot against its own future being dropped
//! mid-flight: that path releases `Canceled` too, so a vanished client can
//! never leak a slot.

use std::convert::Infallible;
use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tower_service::Service;

use crate::admission::{AdmissionController, AdmissionPermit, Outcome};
use crate::error::{
    is_canceled, ClientError, GraphqlError, INTERNAL_ERROR_CODE, INTERNAL_ERROR_MESSAGE,
};
use crate::graphql::QueryBackend;
use crate::telemetry::{emit, GateEvent, NullSink, TelemetrySink};

/// Out-of-band observer for failed requests.
///
/// Receives the original (unscrubbed) error and the query text, when one was
/// decoded. Called for every failure that produces an error response; canceled
/// requests produce no response and are not reported here.
pub type ErrorHook = Arc<dyn Fn(&(dyn StdError + 'static), Option<&str>) + Send + Sync>;

/// Shape of the POST body: `{"query": string, "variables": object?}`.
///
/// Both fields default when absent; an empty query is the backend parser's
/// problem, not a transport error.
#[derive(Debug, Deserialize)]
struct PostBody {
    #[serde(default)]
    query: String,
    #[serde(default)]
    variables: Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct ResponseBody {
    data: Value,
    errors: Option<Vec<GraphqlError>>,
}

/// GraphQL-over-HTTP endpoint with adaptive admission control.
pub struct GraphqlGateway<B, S = NullSink> {
    backend: Arc<B>,
    controller: Arc<AdmissionController>,
    sink: S,
    error_hook: Option<ErrorHook>,
}

impl<B, S: Clone> Clone for GraphqlGateway<B, S> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            controller: self.controller.clone(),
            sink: self.sink.clone(),
            error_hook: self.error_hook.clone(),
        }
    }
}

impl<B: QueryBackend> GraphqlGateway<B, NullSink> {
    /// A gateway over `backend` with a default admission controller.
    pub fn new(backend: B) -> Self {
        Self::with_controller(backend, Arc::new(AdmissionController::default()))
    }

    /// A gateway sharing an existing controller (e.g. to expose its telemetry
    /// accessors elsewhere).
    pub fn with_controller(backend: B, controller: Arc<AdmissionController>) -> Self {
        Self {
            backend: Arc::new(backend),
            controller,
            sink: NullSink,
            error_hook: None,
        }
    }
}

impl<B, S> GraphqlGateway<B, S> {
    /// Swap in a telemetry sink.
    pub fn with_sink<S2: TelemetrySink>(self, sink: S2) -> GraphqlGateway<B, S2>
    where
        S2::Future: Send,
    {
        GraphqlGateway {
            backend: self.backend,
            controller: self.controller,
            sink,
            error_hook: self.error_hook,
        }
    }

    /// Register the out-of-band error hook.
    pub fn with_error_hook(
        mut self,
        hook: impl Fn(&(dyn StdError + 'static), Option<&str>) + Send + Sync + 'static,
    ) -> Self {
        self.error_hook = Some(Arc::new(hook));
        self
    }

    /// The controller this gateway admits through.
    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }
}

impl<B, S> GraphqlGateway<B, S>
where
    B: QueryBackend,
    S: TelemetrySink + Sync,
    S::Future: Send,
{
    async fn handle(self, req: Request<Bytes>) -> Response<Bytes> {
        if req.method() != Method::POST {
            return self.failure(&ClientError::new("request must be a POST"), None);
        }

        let token = req
            .extensions()
            .get::<CancellationToken>()
            .cloned()
            .unwrap_or_default();
        let body = req.into_body();
        if body.is_empty() {
            return self.failure(&ClientError::new("request must include a query"), None);
        }

        let params: PostBody = match serde_json::from_slice(&body) {
            Ok(params) => params,
            Err(err) => {
                let err = ClientError::new(format!("failed to recognize JSON request: '{err}'"));
                return self.failure(&err, None);
            }
        };

        // Admission precedes all per-query work; everything above is invisible
        // to the controller. The controller reports whether the attempt slept,
        // so the wait event reflects what actually happened.
        let (admitted, slept) = self.controller.admit_inner(true).await;
        if let Some(slept) = slept {
            emit(self.sink.clone(), GateEvent::Waited { slept }).await;
        }
        let permit = match admitted {
            Ok(permit) => permit,
            Err(denied) => {
                emit(
                    self.sink.clone(),
                    GateEvent::Rejected {
                        active: self.controller.active_count(),
                        ceiling: self.controller.current_ceiling(),
                    },
                )
                .await;
                return self.failure(&denied, Some(&params.query));
            }
        };
        emit(
            self.sink.clone(),
            GateEvent::Admitted {
                active: self.controller.active_count(),
                ceiling: self.controller.current_ceiling(),
            },
        )
        .await;
        let guard = PermitGuard::new(self.controller.clone(), permit);

        let parsed = match self.backend.parse(&params.query, &params.variables) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.release(guard, Outcome::Error).await;
                return self.failure(err.as_ref(), Some(&params.query));
            }
        };

        if let Err(err) = self.backend.prepare(&parsed) {
            self.release(guard, Outcome::Error).await;
            return self.failure(err.as_ref(), Some(&params.query));
        }

        // The backend's re-run harness owns execution; hold the slot until it
        // terminates, however it terminates.
        match self.backend.execute(token, &parsed).await {
            Ok(value) => {
                self.release(guard, Outcome::Ok).await;
                json_response(render(&ResponseBody {
                    data: value,
                    errors: None,
                }))
            }
            Err(err) if is_canceled(err.as_ref()) => {
                self.release(guard, Outcome::Canceled).await;
                tracing::debug!("execution canceled by client, response suppressed");
                Response::new(Bytes::new())
            }
            Err(err) => {
                self.release(guard, Outcome::Error).await;
                self.failure(err.as_ref(), Some(&params.query))
            }
        }
    }

    async fn release(&self, guard: PermitGuard, outcome: Outcome) {
        let elapsed = guard.complete(outcome);
        emit(
            self.sink.clone(),
            GateEvent::Released {
                outcome,
                elapsed,
                ceiling: self.controller.current_ceiling(),
            },
        )
        .await;
    }

    /// Render `err` into an error envelope, reporting it to the hook first.
    fn failure(&self, err: &(dyn StdError + 'static), query: Option<&str>) -> Response<Bytes> {
        if let Some(hook) = &self.error_hook {
            hook(err, query);
        }
        json_response(render(&ResponseBody {
            data: Value::Null,
            errors: Some(vec![GraphqlError::from_error(err)]),
        }))
    }
}

impl<B, S> Service<Request<Bytes>> for GraphqlGateway<B, S>
where
    B: QueryBackend,
    S: TelemetrySink + Sync,
    S::Future: Send,
{
    type Response = Response<Bytes>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Bytes>) -> Self::Future {
        let gateway = self.clone();
        Box::pin(async move { Ok(gateway.handle(req).await) })
    }
}

/// Ties the admission slot to the response future.
///
/// Normal paths call [`complete`](PermitGuard::complete) with the classified
/// outcome. If the future is dropped instead (client disconnected and the
/// server dropped the connection task), the slot is released as `Canceled`.
struct PermitGuard {
    controller: Arc<AdmissionController>,
    permit: Option<AdmissionPermit>,
}

impl PermitGuard {
    fn new(controller: Arc<AdmissionController>, permit: AdmissionPermit) -> Self {
        Self {
            controller,
            permit: Some(permit),
        }
    }

    fn complete(mut self, outcome: Outcome) -> Duration {
        match self.permit.take() {
            Some(permit) => {
                let elapsed = permit.started_at().elapsed();
                self.controller.release(permit, outcome);
                elapsed
            }
            None => Duration::ZERO,
        }
    }
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.controller.release(permit, Outcome::Canceled);
        }
    }
}

fn json_response(body: Bytes) -> Response<Bytes> {
    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn render(body: &ResponseBody) -> Bytes {
    match serde_json::to_vec(body) {
        Ok(bytes) => Bytes::from(bytes),
        // Unreachable for Value/GraphqlError, but the wire keeps its shape
        // even if serialization ever fails.
        Err(err) => {
            tracing::error!(error = %err, "response serialization failed");
            Bytes::from(format!(
                r#"{{"data":null,"errors":[{{"message":"{INTERNAL_ERROR_MESSAGE}","path":null,"extensions":{{"code":"{INTERNAL_ERROR_CODE}","timestamp":"{}"}}}}]}}"#,
                chrono::Utc::now().to_rfc3339(),
            ))
        }
    }
}
