//! The long-poll endpoint (`spec.md` §4.5) and the reserved diagnostics 404.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{body::Body, Json};
use bytes::Bytes;
use serde_json::Value;

use crate::backend::BusError;
use crate::engine::identity::IdentityRequest;
use crate::http::HttpState;
use crate::session::ClientSession;

/// Reserved query/body keys that are never treated as channel cursors
/// (`spec.md` §6 names `__seq`; `__stream`/`__since_epoch` are this crate's
/// own reserved extensions for selecting streaming mode and carrying the
/// opaque reset-detection token, documented in `DESIGN.md`).
const RESERVED_SEQ: &str = "__seq";
const RESERVED_STREAM: &str = "__stream";
const RESERVED_SINCE_EPOCH: &str = "__since_epoch";

/// Boundary between chunks in streaming mode.
const CHUNK_BOUNDARY: &[u8] = b"\n--message-bus-boundary--\n";

pub async fn diagnostics_reserved() -> StatusCode {
    StatusCode::NOT_FOUND
}

#[derive(Debug)]
pub enum BusApiError {
    ClientError(String),
    Unavailable(String),
}

impl From<BusError> for BusApiError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::ClientError(m) => Self::ClientError(m),
            BusError::BackendUnavailable(m) => Self::Unavailable(m),
            BusError::BackendReadOnly => Self::Unavailable("backend is read-only".to_string()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

impl IntoResponse for BusApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::ClientError(m) => (StatusCode::BAD_REQUEST, m),
            Self::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Parsed request parameters: channel cursors plus the reserved controls.
struct ParsedRequest {
    cursors: HashMap<String, u64>,
    seq: Option<String>,
    streaming: bool,
    since_epoch: Option<String>,
}

fn parse_pairs(pairs: impl Iterator<Item = (String, String)>) -> Result<ParsedRequest, BusApiError> {
    let mut cursors = HashMap::new();
    let mut seq = None;
    let mut streaming = false;
    let mut since_epoch = None;

    for (key, value) in pairs {
        match key.as_str() {
            RESERVED_SEQ => seq = Some(value),
            RESERVED_STREAM => streaming = value == "1" || value == "true",
            RESERVED_SINCE_EPOCH => since_epoch = Some(value),
            channel => {
                let cursor: u64 = value
                    .parse()
                    .map_err(|_| BusApiError::ClientError(format!("cursor for {channel} is not a non-negative integer")))?;
                cursors.insert(channel.to_string(), cursor);
            }
        }
    }

    Ok(ParsedRequest { cursors, seq, streaming, since_epoch })
}

fn parse_json_body(bytes: &[u8]) -> Result<ParsedRequest, BusApiError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| BusApiError::ClientError(format!("invalid JSON body: {e}")))?;
    let Value::Object(map) = value else {
        return Err(BusApiError::ClientError("body must be a JSON object".to_string()));
    };

    let pairs = map.into_iter().map(|(k, v)| {
        let s = match v {
            Value::String(s) => s,
            other => other.to_string(),
        };
        (k, s)
    });
    parse_pairs(pairs)
}

fn parse_form_body(bytes: &[u8]) -> ParsedRequest {
    let pairs = form_urlencoded::parse(bytes).into_owned();
    // Well-formed `key=value` pairs only; malformed cursor values are
    // rejected per-key in `parse_pairs`, not here.
    parse_pairs(pairs).unwrap_or(ParsedRequest {
        cursors: HashMap::new(),
        seq: None,
        streaming: false,
        since_epoch: None,
    })
}

/// `POST/GET /<base>/<client_id>/poll` (`spec.md` §4.5).
pub async fn poll(
    State(state): State<HttpState>,
    Path(client_id): Path<String>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, BusApiError> {
    let query_request = match &query {
        Some(q) if !q.is_empty() => parse_pairs(form_urlencoded::parse(q.as_bytes()).into_owned())?,
        _ => ParsedRequest { cursors: HashMap::new(), seq: None, streaming: false, since_epoch: None },
    };

    let mut parsed = if body.is_empty() {
        query_request
    } else {
        let content_type = headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let mut body_request = if content_type.starts_with("application/json") {
            parse_json_body(&body)?
        } else {
            parse_form_body(&body)
        };
        body_request.cursors.extend(query_request.cursors);
        body_request.seq = body_request.seq.or(query_request.seq);
        body_request.streaming |= query_request.streaming;
        body_request.since_epoch = body_request.since_epoch.or(query_request.since_epoch);
        body_request
    };
    parsed.cursors.retain(|k, _| !k.is_empty());

    let identity_req = IdentityRequest { client_id: &client_id, headers: &headers };
    let identity = Arc::new(state.engine.identity_hooks().resolve(&identity_req));

    let mut session = ClientSession::new(
        identity,
        parsed.cursors,
        state.config.long_poll_timeout,
        parsed.streaming,
        parsed.since_epoch,
    );

    let mut response = if session.streaming {
        stream_response(state, session).await
    } else {
        let messages = session.run(&state.engine).await?;
        Json(messages).into_response()
    };

    if let Some(seq) = parsed.seq {
        if let Ok(value) = axum::http::HeaderValue::from_str(&seq) {
            response.headers_mut().insert("x-message-bus-seq", value);
        }
    }

    Ok(response)
}

/// Streaming long-poll (`spec.md` §4.5 streaming mode): holds the HTTP
/// connection open and emits one JSON chunk per non-empty batch, looping
/// until `session.deadline` rather than closing after the first delivery.
/// Each `session.run` call advances `session.cursors` to the highest
/// `message_id` delivered per channel, so looping never re-sends a batch.
async fn stream_response(state: HttpState, session: ClientSession) -> Response {
    let keepalive = state.config.keepalive;
    let engine = Arc::clone(&state.engine);
    let mut session = session;

    let body = Body::from_stream(async_stream::stream! {
        loop {
            let deadline_remaining = session.deadline.saturating_duration_since(std::time::Instant::now());
            if deadline_remaining.is_zero() {
                yield Ok::<_, std::io::Error>(bytes::Bytes::from(keepalive_chunk()));
                break;
            }

            let wait_for = deadline_remaining.min(keepalive);
            match tokio::time::timeout(wait_for, session.run(&engine)).await {
                Ok(Ok(messages)) if !messages.is_empty() => {
                    yield Ok(encode_chunk(&messages));
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "streaming poll: session error");
                    break;
                }
                Err(_) => {
                    yield Ok::<_, std::io::Error>(bytes::Bytes::from(keepalive_chunk()));
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "application/json; charset=utf-8")
        .body(body)
        .expect("static response parts are always valid")
}

fn encode_chunk(messages: &[crate::session::WireMessage]) -> bytes::Bytes {
    let mut out = serde_json::to_vec(messages).expect("WireMessage always serializes");
    out.extend_from_slice(CHUNK_BOUNDARY);
    bytes::Bytes::from(out)
}

fn keepalive_chunk() -> Vec<u8> {
    let mut out = b"[]".to_vec();
    out.extend_from_slice(CHUNK_BOUNDARY);
    out
}
