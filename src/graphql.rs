//! The seam to the GraphQL engine proper.
//!
//! This crate does not parse or execute GraphQL. The HTTP gateway drives any
//! engine that implements [`QueryBackend`]: parse the query text, prepare the
//! parsed form against the schema, execute it to a JSON value. Root-type
//! dispatch (query vs. mutation) is the backend's business; the gateway never
//! looks inside `Query`.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;

/// A pluggable GraphQL engine.
///
/// Contract notes for implementers:
///
/// - `parse` failures that stem from the query text should be returned as
///   [`ClientError`](crate::error::ClientError) so their message reaches the
///   client; anything else is scrubbed to an internal error on the wire.
/// - `execute` typically runs under the engine's re-run harness (reactive
///   caching, batching). It must terminate once `token` is canceled and then
///   return an error whose root cause is [`Canceled`](crate::error::Canceled);
///   the gateway holds the admission slot until `execute` returns.
#[async_trait]
pub trait QueryBackend: Send + Sync + 'static {
    /// The parsed form of a request, opaque to the gateway.
    type Query: Send + Sync;

    /// Parse the query text with its variables.
    fn parse(&self, query: &str, variables: &Map<String, Value>) -> Result<Self::Query, BoxError>;

    /// Validate the parsed query against the schema before execution.
    fn prepare(&self, query: &Self::Query) -> Result<(), BoxError>;

    /// Execute the prepared query to completion, observing `token` for
    /// client-side cancellation.
    async fn execute(&self, token: CancellationToken, query: &Self::Query)
        -> Result<Value, BoxError>;
}
