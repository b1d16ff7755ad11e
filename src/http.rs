//! Thin `axum` front door. Translates the header/status-code contract
//! into [`Broker`] calls and back; no stream semantics live here.
//!
//! One `handle_*` function per operation behind a wildcard-path router,
//! generic over a [`Broker`] and its four collaborator traits so the
//! adapter layer never depends on a concrete backend.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{sse::Event, IntoResponse, Response, Sse},
    routing::{delete, get, head, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::cursor;
use crate::delivery::DeliveryEvent;
use crate::error::EngineError;
use crate::objectstore::ObjectStore;
use crate::queue::DurableQueue;
use crate::registry::Registry;
use crate::subscribers::SubscriberStore;
use crate::types::{AppendRequest, CreateRequest, Expiry, ProducerTriple};
use crate::Broker;

/// Shared state handed to every handler. Cloning only bumps the `Arc`.
pub struct AppState<O, Q, S, R>
where
    O: ObjectStore + 'static,
    Q: DurableQueue + 'static,
    S: SubscriberStore + 'static,
    R: Registry + 'static,
{
    pub broker: Arc<Broker<O, Q, S, R>>,
}

impl<O, Q, S, R> Clone for AppState<O, Q, S, R>
where
    O: ObjectStore + 'static,
    Q: DurableQueue + 'static,
    S: SubscriberStore + 'static,
    R: Registry + 'static,
{
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    pub offset: Option<String>,
    pub live: Option<String>,
    pub cursor: Option<String>,
    pub timeout_ms: Option<u64>,
}

pub fn create_router<O, Q, S, R>(state: AppState<O, Q, S, R>) -> Router
where
    O: ObjectStore + 'static,
    Q: DurableQueue + 'static,
    S: SubscriberStore + 'static,
    R: Registry + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/{*path}", put(handle_create))
        .route("/{*path}", head(handle_head))
        .route("/{*path}", get(handle_read))
        .route("/{*path}", post(handle_append))
        .route("/{*path}", delete(handle_delete))
        .layer(cors)
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Stamps every request/response with an `X-Request-Id`, generating one if
/// the caller didn't send one, and opens a tracing span carrying it so a
/// request's whole handling can be correlated in the logs.
async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("X-Request-Id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request
        .headers_mut()
        .insert("X-Request-Id", request_id.parse().unwrap());

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let mut response = next.run(request).instrument(span).await;
    response
        .headers_mut()
        .insert("X-Request-Id", request_id.parse().unwrap());
    response
}

/// Splits a wildcard path into `(project_id, stream_id)`: the first segment
/// names the project, everything after it names the stream within it.
fn split_path(path: &str) -> Result<(String, String), Response> {
    match path.split_once('/') {
        Some((project_id, stream_id)) if !project_id.is_empty() && !stream_id.is_empty() => {
            Ok((project_id.to_string(), stream_id.to_string()))
        }
        _ => Err((StatusCode::BAD_REQUEST, "path must be /{project_id}/{stream_id}").into_response()),
    }
}

fn engine_error_response(err: EngineError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, err.to_string()).into_response();
    match &err {
        EngineError::ClosedConflict => {
            response
                .headers_mut()
                .insert("Stream-Closed", "true".parse().unwrap());
        }
        EngineError::SeqGap { expected, received } => {
            let headers = response.headers_mut();
            headers.insert("Producer-Expected-Seq", expected.to_string().parse().unwrap());
            headers.insert("Producer-Received-Seq", received.to_string().parse().unwrap());
        }
        _ => {}
    }
    response
}

fn parse_ttl_header(headers: &HeaderMap) -> Option<u64> {
    headers.get("Stream-TTL").and_then(|v| v.to_str().ok()).and_then(|v| v.parse().ok())
}

fn parse_expires_at_header(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    headers
        .get("Stream-Expires-At")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_close_header(headers: &HeaderMap) -> bool {
    headers.get("Stream-Close").and_then(|v| v.to_str().ok()) == Some("true")
}

fn parse_producer_triple(headers: &HeaderMap) -> Result<Option<ProducerTriple>, Response> {
    let id = headers.get("Producer-Id").and_then(|v| v.to_str().ok());
    let epoch = headers.get("Producer-Epoch").and_then(|v| v.to_str().ok());
    let seq = headers.get("Producer-Seq").and_then(|v| v.to_str().ok());
    match (id, epoch, seq) {
        (None, None, None) => Ok(None),
        (Some(id), Some(epoch), Some(seq)) => {
            let epoch = epoch
                .parse()
                .map_err(|_| (StatusCode::BAD_REQUEST, "malformed Producer-Epoch").into_response())?;
            let seq = seq
                .parse()
                .map_err(|_| (StatusCode::BAD_REQUEST, "malformed Producer-Seq").into_response())?;
            Ok(Some(ProducerTriple { id: id.to_string(), epoch, seq }))
        }
        _ => Err((StatusCode::BAD_REQUEST, "Producer-Id/Producer-Epoch/Producer-Seq must all be set together").into_response()),
    }
}

async fn handle_create<O, Q, S, R>(
    State(state): State<AppState<O, Q, S, R>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response
where
    O: ObjectStore + 'static,
    Q: DurableQueue + 'static,
    S: SubscriberStore + 'static,
    R: Registry + 'static,
{
    let (project_id, stream_id) = match split_path(&path) {
        Ok(pair) => pair,
        Err(response) => return response,
    };
    debug!(project_id, stream_id, "creating stream");

    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(String::from);
    let ttl_seconds = parse_ttl_header(&headers);
    let expires_at = parse_expires_at_header(&headers);
    if ttl_seconds.is_some() && expires_at.is_some() {
        return (StatusCode::BAD_REQUEST, "cannot specify both Stream-TTL and Stream-Expires-At").into_response();
    }
    let expiry = ttl_seconds
        .map(Expiry::TtlSeconds)
        .or(expires_at.map(Expiry::ExpiresAt));

    let producer = match parse_producer_triple(&headers) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::BAD_REQUEST, "failed to read body").into_response(),
    };
    let initial_body = if body_bytes.is_empty() { None } else { Some(body_bytes) };
    let public = headers.get("Stream-Public").and_then(|v| v.to_str().ok()) == Some("true");

    let request = CreateRequest {
        content_type: content_type.clone(),
        initial_body,
        producer,
        close: parse_close_header(&headers),
        public,
        expiry,
        stream_seq: headers.get("Stream-Seq").and_then(|v| v.to_str().ok()).map(String::from),
    };

    match state.broker.create(&project_id, &stream_id, request).await {
        Ok(outcome) => {
            let mut response = Response::builder()
                .status(if outcome.created { StatusCode::CREATED } else { StatusCode::OK })
                .header("Stream-Next-Offset", &outcome.next_offset)
                .header(header::LOCATION, &path);
            if let Some(ct) = content_type {
                response = response.header(header::CONTENT_TYPE, ct);
            }
            response.body(Body::empty()).unwrap().into_response()
        }
        Err(e) => {
            warn!(project_id, stream_id, error = %e, "failed to create stream");
            engine_error_response(e)
        }
    }
}

async fn handle_head<O, Q, S, R>(
    State(state): State<AppState<O, Q, S, R>>,
    Path(path): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Response
where
    O: ObjectStore + 'static,
    Q: DurableQueue + 'static,
    S: SubscriberStore + 'static,
    R: Registry + 'static,
{
    let (project_id, stream_id) = match split_path(&path) {
        Ok(pair) => pair,
        Err(response) => return response,
    };

    let head = match state.broker.head(&project_id, &stream_id).await {
        Ok(head) => head,
        Err(e) => return engine_error_response(e),
    };

    let client_cursor = query.cursor.as_deref().and_then(cursor::parse_cursor);
    let response_cursor = cursor::next_cursor(client_cursor, state.broker.config());

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header("Stream-Next-Offset", &head.next_offset)
        .header("Stream-Closed", head.closed.to_string())
        .header("Stream-Cursor", response_cursor.to_string());
    if let Some(ttl) = head.ttl_seconds_remaining {
        response = response.header("Stream-TTL", ttl.to_string());
    }
    if let Some(expires_at) = head.expires_at {
        response = response.header("Stream-Expires-At", expires_at.to_rfc3339());
    }
    if let Some(ct) = &head.content_type {
        response = response.header(header::CONTENT_TYPE, ct.as_str());
    }
    response.body(Body::empty()).unwrap().into_response()
}

async fn handle_read<O, Q, S, R>(
    State(state): State<AppState<O, Q, S, R>>,
    Path(path): Path<String>,
    Query(query): Query<ReadQuery>,
    headers: HeaderMap,
) -> Response
where
    O: ObjectStore + 'static,
    Q: DurableQueue + 'static,
    S: SubscriberStore + 'static,
    R: Registry + 'static,
{
    let (project_id, stream_id) = match split_path(&path) {
        Ok(pair) => pair,
        Err(response) => return response,
    };
    let offset = query.offset.clone().unwrap_or_else(|| crate::offset::Offset::ZERO.encode());
    if offset.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty offset parameter").into_response();
    }
    let client_cursor = query.cursor.as_deref().and_then(cursor::parse_cursor);
    let response_cursor = cursor::next_cursor(client_cursor, state.broker.config());
    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    match query.live.as_deref() {
        Some("sse") => handle_sse(state, project_id, stream_id, offset, response_cursor).await,
        Some("long-poll") => handle_long_poll(state, project_id, stream_id, offset, response_cursor, query.timeout_ms).await,
        _ => handle_catch_up(state, project_id, stream_id, offset, response_cursor, if_none_match).await,
    }
}

async fn handle_catch_up<O, Q, S, R>(
    state: AppState<O, Q, S, R>,
    project_id: String,
    stream_id: String,
    offset: String,
    cursor: u64,
    if_none_match: Option<String>,
) -> Response
where
    O: ObjectStore + 'static,
    Q: DurableQueue + 'static,
    S: SubscriberStore + 'static,
    R: Registry + 'static,
{
    match state.broker.read(&project_id, &stream_id, &offset).await {
        Ok(result) => {
            if !result.etag.is_empty() && if_none_match.as_deref() == Some(result.etag.as_str()) {
                return not_modified_response(&result, cursor);
            }
            read_outcome_response(StatusCode::OK, &result, cursor)
        }
        Err(e) => engine_error_response(e),
    }
}

async fn handle_long_poll<O, Q, S, R>(
    state: AppState<O, Q, S, R>,
    project_id: String,
    stream_id: String,
    offset: String,
    cursor: u64,
    timeout_ms: Option<u64>,
) -> Response
where
    O: ObjectStore + 'static,
    Q: DurableQueue + 'static,
    S: SubscriberStore + 'static,
    R: Registry + 'static,
{
    let timeout_ms = timeout_ms.unwrap_or(state.broker.config().default_long_poll_timeout_ms);
    let request_url = format!("/{project_id}/{stream_id}?offset={offset}&live=long-poll");
    match state
        .broker
        .wait_for_tail(&project_id, &stream_id, &offset, Some(request_url), timeout_ms)
        .await
    {
        Ok(result) if !result.body.is_empty() || result.closed_at_tail => {
            read_outcome_response(StatusCode::OK, &result, cursor)
        }
        Ok(result) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("Stream-Next-Offset", &result.next_offset)
            .header("Stream-Cursor", cursor.to_string())
            .header("Stream-Up-To-Date", "true")
            .body(Body::empty())
            .unwrap(),
        Err(e) => engine_error_response(e),
    }
}

fn read_outcome_response(status: StatusCode, result: &crate::types::ReadOutcome, cursor: u64) -> Response {
    let mut response = Response::builder()
        .status(status)
        .header("Stream-Next-Offset", &result.next_offset)
        .header("Stream-Cursor", cursor.to_string())
        .header("Stream-Up-To-Date", result.up_to_date.to_string())
        .header("Stream-Closed", result.closed_at_tail.to_string())
        .header(header::ETAG, &result.etag)
        .header(header::CACHE_CONTROL, &result.cache_control);
    if let Some(ts) = result.write_timestamp {
        response = response.header("Stream-Write-Timestamp", ts.to_string());
    }
    if let Some(ct) = &result.content_type {
        response = response.header(header::CONTENT_TYPE, ct.as_str());
    }
    response.body(Body::from(result.body.clone())).unwrap()
}

/// A conditional catch-up read whose `If-None-Match` matches the current
/// etag: same headers as a normal read response, no body.
fn not_modified_response(result: &crate::types::ReadOutcome, cursor: u64) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .header("Stream-Next-Offset", &result.next_offset)
        .header("Stream-Cursor", cursor.to_string())
        .header("Stream-Up-To-Date", result.up_to_date.to_string())
        .header("Stream-Closed", result.closed_at_tail.to_string())
        .header(header::ETAG, &result.etag)
        .header(header::CACHE_CONTROL, &result.cache_control);
    if let Some(ct) = &result.content_type {
        response = response.header(header::CONTENT_TYPE, ct.as_str());
    }
    response.body(Body::empty()).unwrap()
}

async fn handle_sse<O, Q, S, R>(
    state: AppState<O, Q, S, R>,
    project_id: String,
    stream_id: String,
    offset: String,
    cursor: u64,
) -> Response
where
    O: ObjectStore + 'static,
    Q: DurableQueue + 'static,
    S: SubscriberStore + 'static,
    R: Registry + 'static,
{
    let stream = create_sse_stream(state, project_id, stream_id, offset, cursor);
    Sse::new(stream)
        .keep_alive(
            axum::response::sse::KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keepalive"),
        )
        .into_response()
}

fn create_sse_stream<O, Q, S, R>(
    state: AppState<O, Q, S, R>,
    project_id: String,
    stream_id: String,
    mut offset: String,
    mut current_cursor: u64,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>>
where
    O: ObjectStore + 'static,
    Q: DurableQueue + 'static,
    S: SubscriberStore + 'static,
    R: Registry + 'static,
{
    async_stream::stream! {
        let mut rx = match state.broker.subscribe_live(&project_id, &stream_id).await {
            Ok(rx) => rx,
            Err(_) => return,
        };

        if let Ok(result) = state.broker.read(&project_id, &stream_id, &offset).await {
            if !result.body.is_empty() {
                yield Ok(Event::default().event("data").data(String::from_utf8_lossy(&result.body).into_owned()));
            }
            offset = result.next_offset.clone();
            current_cursor = cursor::next_cursor(Some(current_cursor), state.broker.config());
            let control = serde_json::json!({
                "streamNextOffset": result.next_offset,
                "streamCursor": current_cursor.to_string(),
                "upToDate": result.up_to_date,
            });
            yield Ok(Event::default().event("control").data(control.to_string()));
        }

        loop {
            match rx.recv().await {
                Ok(DeliveryEvent::Data { body }) => {
                    yield Ok(Event::default().event("data").data(String::from_utf8_lossy(&body).into_owned()));
                }
                Ok(DeliveryEvent::Control { next_offset, up_to_date, closed, write_timestamp, cursor }) => {
                    offset = next_offset.clone();
                    current_cursor = cursor;
                    let control = serde_json::json!({
                        "streamNextOffset": next_offset,
                        "streamCursor": cursor.to_string(),
                        "upToDate": up_to_date,
                        "closed": closed,
                        "writeTimestamp": write_timestamp,
                    });
                    yield Ok(Event::default().event("control").data(control.to_string()));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    if let Ok(result) = state.broker.read(&project_id, &stream_id, &offset).await {
                        offset = result.next_offset.clone();
                    }
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn handle_append<O, Q, S, R>(
    State(state): State<AppState<O, Q, S, R>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response
where
    O: ObjectStore + 'static,
    Q: DurableQueue + 'static,
    S: SubscriberStore + 'static,
    R: Registry + 'static,
{
    let (project_id, stream_id) = match split_path(&path) {
        Ok(pair) => pair,
        Err(response) => return response,
    };

    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(String::from);
    let stream_seq = headers.get("Stream-Seq").and_then(|v| v.to_str().ok()).map(String::from);
    let close = parse_close_header(&headers);
    let producer = match parse_producer_triple(&headers) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::BAD_REQUEST, "failed to read body").into_response(),
    };
    if body_bytes.is_empty() && !close {
        return (StatusCode::BAD_REQUEST, "empty body not allowed").into_response();
    }

    let request = AppendRequest {
        payload: body_bytes,
        content_type,
        producer,
        stream_seq,
        close,
    };

    match state.broker.append(&project_id, &stream_id, request).await {
        Ok(outcome) => {
            let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::OK);
            Response::builder()
                .status(status)
                .header("Stream-Next-Offset", &outcome.next_offset)
                .header("Stream-Closed", outcome.closed.to_string())
                .body(Body::empty())
                .unwrap()
        }
        Err(e) => {
            warn!(project_id, stream_id, error = %e, "failed to append to stream");
            engine_error_response(e)
        }
    }
}

async fn handle_delete<O, Q, S, R>(
    State(state): State<AppState<O, Q, S, R>>,
    Path(path): Path<String>,
) -> Response
where
    O: ObjectStore + 'static,
    Q: DurableQueue + 'static,
    S: SubscriberStore + 'static,
    R: Registry + 'static,
{
    let (project_id, stream_id) = match split_path(&path) {
        Ok(pair) => pair,
        Err(response) => return response,
    };
    match state.broker.delete(&project_id, &stream_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => engine_error_response(e),
    }
}
