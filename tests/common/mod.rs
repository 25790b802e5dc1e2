#![allow(dead_code)]

//! Shared helpers for the integration suites.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use floodgate::{BoxError, Canceled, ClientError, QueryBackend};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// Test backend exposing a single `mirror(value)` field that negates an
/// integer, with hooks for the failure paths.
///
/// Query-text conventions:
/// - an empty query fails `parse` with a client error;
/// - a query mentioning `unprepared` fails `prepare` with an internal error;
/// - a query mentioning `boom` fails `execute` with an internal error;
/// - anything else resolves `mirror` after the configured delay, or returns a
///   wrapped [`Canceled`] if the token fires first.
pub struct MirrorBackend {
    pub delay: Duration,
}

impl MirrorBackend {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

pub struct MirrorQuery {
    text: String,
    value: i64,
}

#[async_trait]
impl QueryBackend for MirrorBackend {
    type Query = MirrorQuery;

    fn parse(&self, query: &str, variables: &Map<String, Value>) -> Result<MirrorQuery, BoxError> {
        if query.is_empty() {
            return Err(Box::new(ClientError::new("must have a single query")));
        }
        let value = variables.get("value").and_then(Value::as_i64).unwrap_or(0);
        Ok(MirrorQuery {
            text: query.to_owned(),
            value,
        })
    }

    fn prepare(&self, query: &MirrorQuery) -> Result<(), BoxError> {
        if query.text.contains("unprepared") {
            return Err("field has no registered resolver".into());
        }
        Ok(())
    }

    async fn execute(
        &self,
        token: CancellationToken,
        query: &MirrorQuery,
    ) -> Result<Value, BoxError> {
        if query.text.contains("boom") {
            return Err("resolver panicked: boom".into());
        }
        tokio::select! {
            _ = token.cancelled() => Err(Box::new(Canceled)),
            _ = tokio::time::sleep(self.delay) => {
                Ok(serde_json::json!({ "mirror": -query.value }))
            }
        }
    }
}

/// Build a POST request against the gateway.
pub fn post(body: &str) -> http::Request<Bytes> {
    http::Request::builder()
        .method(http::Method::POST)
        .uri("/graphql")
        .body(Bytes::from(body.to_owned()))
        .expect("valid request")
}

/// The standard mirror query with `value` bound to 1.
pub const MIRROR_QUERY: &str =
    r#"{"query": "query TestQuery($value: int64) { mirror(value: $value) }", "variables": { "value": 1 }}"#;
