//! HTTP transport for the scheduler and operator APIs.
//!
//! Calls are JSON bodies. Subscriptions answer with a long-lived
//! newline-delimited JSON stream that ends when the client goes away.

pub mod error;

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::State,
    http::{
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use corral_id::StreamId;
use serde::{de::DeserializeOwned, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::authz::Principal;
use crate::content::ContentType;
use crate::master::MasterHandle;
use crate::operator::{self, OperatorResponse};
use crate::queue::Queue;
use crate::scheduler::{self, SchedulerResponse};
use error::ApiError;

/// Header carrying the subscription stream id in both directions.
pub const STREAM_ID_HEADER: &str = "corral-stream-id";

const STREAM_CONTENT_TYPE: &str = "application/x-ndjson";

/// Create the master API router.
pub fn create_router(master: MasterHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/scheduler", post(scheduler_call))
        .route("/api/v1/operator", post(operator_call))
        .layer(TraceLayer::new_for_http())
        .with_state(master)
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" while the master actor runs, "unavailable" after it exits.
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
}

async fn health(State(master): State<MasterHandle>) -> impl IntoResponse {
    let (status, label) = if master.is_stopped() {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    } else {
        (StatusCode::OK, "ok")
    };
    let body = HealthResponse {
        status: label.to_string(),
        service: "corral-master".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    };
    (status, Json(body))
}

async fn scheduler_call(
    State(master): State<MasterHandle>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let raw: scheduler::RawCall = decode(&headers, &body)?;
    let principal = principal(&headers)?;
    let stream_id = match header_str(&headers, STREAM_ID_HEADER)? {
        Some(value) => Some(StreamId::parse(value).map_err(|e| {
            ApiError::bad_request("invalid_stream_id", format!("Invalid stream id: {e}"))
        })?),
        None => None,
    };

    match master.scheduler_call(raw, principal, stream_id).await? {
        SchedulerResponse::Accepted => Ok(StatusCode::ACCEPTED.into_response()),
        SchedulerResponse::OperationStatuses(statuses) => Ok(Json(statuses).into_response()),
        SchedulerResponse::Subscribed(subscription) => {
            let mut response = stream_response(subscription.events);
            let stream_id = HeaderValue::from_str(&subscription.stream_id.to_string())
                .map_err(|e| ApiError::internal("invalid_header", e.to_string()))?;
            response.headers_mut().insert(STREAM_ID_HEADER, stream_id);
            Ok(response)
        }
    }
}

async fn operator_call(
    State(master): State<MasterHandle>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let raw: operator::RawCall = decode(&headers, &body)?;
    let principal = principal(&headers)?;

    match master.operator_call(raw, principal).await? {
        OperatorResponse::Accepted => Ok(StatusCode::ACCEPTED.into_response()),
        OperatorResponse::Reply(response) => Ok(Json(response).into_response()),
        OperatorResponse::Subscribed(events) => Ok(stream_response(events)),
    }
}

// =============================================================================
// Request helpers
// =============================================================================

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, ApiError> {
    headers
        .get(name)
        .map(|value| {
            value.to_str().map_err(|_| {
                ApiError::bad_request("invalid_header", format!("Header '{name}' is not ASCII"))
            })
        })
        .transpose()
}

/// Checks the media types and decodes the JSON body.
fn decode<T: DeserializeOwned>(headers: &HeaderMap, body: &[u8]) -> Result<T, ApiError> {
    let content_type = header_str(headers, CONTENT_TYPE.as_str())?.ok_or_else(|| {
        ApiError::unsupported_media_type("Expecting 'Content-Type' to be present")
    })?;
    let content_type: ContentType = content_type
        .parse()
        .map_err(|e: crate::content::UnsupportedMediaType| {
            ApiError::unsupported_media_type(e.to_string())
        })?;
    if !content_type.is_supported() || content_type.is_streaming() {
        return Err(ApiError::unsupported_media_type(format!(
            "Request body encoding '{content_type}' is not supported"
        )));
    }

    // Wildcards and unknown types fall back to JSON.
    if let Some(accept) = header_str(headers, ACCEPT.as_str())? {
        if let Ok(accept) = accept.parse::<ContentType>() {
            if !accept.is_supported() {
                return Err(ApiError::not_acceptable(format!(
                    "Response encoding '{accept}' is not supported"
                )));
            }
        }
    }

    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request("invalid_body", format!("Failed to parse body: {e}")))
}

/// `Authorization: Bearer <principal>` names the caller.
fn principal(headers: &HeaderMap) -> Result<Option<Principal>, ApiError> {
    let Some(value) = header_str(headers, AUTHORIZATION.as_str())? else {
        return Ok(None);
    };
    match value.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(Some(Principal::new(token.trim()))),
        _ => Err(ApiError::bad_request(
            "invalid_authorization",
            "Expecting 'Authorization: Bearer <principal>'",
        )),
    }
}

// =============================================================================
// Event streams
// =============================================================================

/// Closes the queue once the response body is dropped, which stops its
/// heartbeat and makes the master drop further events.
struct CloseOnDrop<T>(Queue<T>);

impl<T> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

fn stream_response<T>(events: Queue<T>) -> Response
where
    T: Serialize + Send + 'static,
{
    let stream = futures_util::stream::unfold(CloseOnDrop(events), |guard| async move {
        let event = guard.0.get().await.ok()?;
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode event; closing stream");
                return None;
            }
        };
        line.push(b'\n');
        Some((Ok::<_, Infallible>(Bytes::from(line)), guard))
    });

    let mut response = Body::from_stream(stream).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(STREAM_CONTENT_TYPE));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn test_missing_content_type_is_415() {
        let err = decode::<scheduler::RawCall>(&HeaderMap::new(), b"{}").unwrap_err();
        assert_eq!(err.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[test]
    fn test_protobuf_body_is_415() {
        let headers = headers(&[("content-type", "application/x-protobuf")]);
        let err = decode::<scheduler::RawCall>(&headers, b"{}").unwrap_err();
        assert_eq!(err.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[test]
    fn test_protobuf_accept_is_406() {
        let headers = headers(&[
            ("content-type", "application/json"),
            ("accept", "application/x-protobuf"),
        ]);
        let err = decode::<scheduler::RawCall>(&headers, b"{}").unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_ACCEPTABLE);
    }

    #[test]
    fn test_wildcard_accept_is_json() {
        let headers = headers(&[("content-type", "application/json"), ("accept", "*/*")]);
        assert!(decode::<scheduler::RawCall>(&headers, b"{}").is_ok());
    }

    #[test]
    fn test_bearer_principal() {
        let principal = principal(&headers(&[("authorization", "Bearer ops")])).unwrap();
        assert_eq!(principal, Some(Principal::new("ops")));

        assert_eq!(
            principal_or_status(&headers(&[("authorization", "Basic b3Bz")])),
            StatusCode::BAD_REQUEST
        );
        assert!(super::principal(&HeaderMap::new()).unwrap().is_none());
    }

    fn principal_or_status(headers: &HeaderMap) -> StatusCode {
        match principal(headers) {
            Ok(_) => StatusCode::OK,
            Err(e) => e.status,
        }
    }

    #[tokio::test]
    async fn test_stream_closes_queue_on_drop() {
        let events = Queue::<scheduler::Event>::new();
        let response = stream_response(events.clone());
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            STREAM_CONTENT_TYPE
        );
        drop(response);
        assert!(events.is_closed());
    }
}
