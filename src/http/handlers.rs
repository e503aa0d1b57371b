//! Request pipeline: one HTTP request spliced onto one pooled connection.
//!
//! # Responsibilities
//! - Extract Basic credentials before any pool traffic
//! - Emit the `RestRequest`, pair the response, forward the status
//! - Stream request and response bodies without whole-body buffering
//! - Release the connection on every exit path via the pool guard
//!
//! # State Machine
//! ```text
//! AUTH ──ok──▶ SEND_REQ ──ok──▶ RECV_STATUS ──ok──▶ [WRITE_BODY]
//!      ──ok──▶ [RECV_STATUS_2] ──ok──▶ READ_BODY ──done──▶ CLEANUP
//! any state ──auth_err──▶ CLEANUP(401)
//! any state ──io_err | timeout | protocol──▶ CLEANUP(5xx, invalidate conn)
//! any state ──app_err──▶ CLEANUP(status from response, conn stays healthy)
//! ```
//!
//! The handler runs the pipeline inline until the HTTP status is known, then
//! moves the connection into a task that pumps the chunked body into the
//! response stream; dropping the guard there is the scoped cleanup.

use std::io;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::channel::mpsc;
use futures::SinkExt;
use serde_json::json;

use crate::http::auth;
use crate::http::server::AppState;
use crate::iomgr::connection::HttpChunkSender;
use crate::iomgr::error::IoMgrError;
use crate::iomgr::pool::PooledConn;
use crate::proto::{DatabaseObjectType, RestVerb};

/// What one request asks the IOMgr to do.
struct Target {
    verb: RestVerb,
    object_type: DatabaseObjectType,
    object_name: String,
    object_id: u64,
}

/// Captures the request line for the access log emitted on completion.
struct RequestLog {
    method: Method,
    path: String,
    start: Instant,
}

impl RequestLog {
    fn new(method: Method, uri: &Uri) -> Self {
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| uri.path().to_owned());
        Self {
            method,
            path,
            start: Instant::now(),
        }
    }

    fn emit(&self, status: StatusCode) {
        tracing::info!(
            target: "access",
            status = status.as_u16(),
            latency_ms = self.start.elapsed().as_millis() as u64,
            method = %self.method,
            path = %self.path,
            "request completed"
        );
    }
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn status_from_code(code: u32) -> StatusCode {
    if code == 0 {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::from_u16(code as u16).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Maps a pipeline error to the HTTP response that ends the request.
fn iomgr_failure(log: &RequestLog, err: &IoMgrError) -> Response {
    tracing::error!(error = %err, "request pipeline failed");
    let status = match err {
        IoMgrError::App { rest_status, .. } => status_from_code(*rest_status),
        IoMgrError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    log.emit(status);
    json_error(status, &err.to_string())
}

fn auth_failure(log: &RequestLog, err: &auth::AuthError) -> Response {
    tracing::error!(error = %err, "authentication failed");
    log.emit(StatusCode::UNAUTHORIZED);
    json_error(StatusCode::UNAUTHORIZED, &err.to_string())
}

/// Turns the rest of the chunk stream into the HTTP response body. The
/// connection guard moves into the pump task and is released when the stream
/// ends, succeed or fail.
fn stream_response(
    state: &AppState,
    mut conn: PooledConn,
    status: StatusCode,
    log: RequestLog,
) -> Response {
    let (mut tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(2);
    let http_chunk_size = state.http_chunk_size;

    tokio::spawn(async move {
        match conn.stream_body_from_peer(&mut tx, http_chunk_size).await {
            Ok(_) => log.emit(status),
            Err(e) => {
                tracing::error!(error = %e, "response streaming failed");
                let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                log.emit(status);
            }
        }
    });

    let mut response = Response::new(Body::from_stream(rx));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Common flow for verbs without a request body (GET, DELETE).
async fn run_read(state: AppState, log: RequestLog, headers: HeaderMap, target: Target) -> Response {
    let (user_name, token) = match auth::basic_credentials(&headers) {
        Ok(credentials) => credentials,
        Err(e) => return auth_failure(&log, &e),
    };

    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(error = %e, "can't acquire IOMgr connection");
            log.emit(StatusCode::INTERNAL_SERVER_ERROR);
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    let request_id = match conn
        .send_request(
            target.verb,
            target.object_type,
            &user_name,
            &token,
            &target.object_name,
            target.object_id,
        )
        .await
    {
        Ok(id) => id,
        Err(e) => return iomgr_failure(&log, &e),
    };

    let status = match conn.recv_response(request_id).await {
        Ok(status) => status,
        Err(e) => return iomgr_failure(&log, &e),
    };

    stream_response(&state, conn, status_from_code(status), log)
}

/// Write flow (POST, PATCH, PUT): the IOMgr confirms twice, once before the
/// payload goes forward and once after.
async fn run_write(
    state: AppState,
    log: RequestLog,
    headers: HeaderMap,
    target: Target,
    body: Body,
) -> Response {
    let (user_name, token) = match auth::basic_credentials(&headers) {
        Ok(credentials) => credentials,
        Err(e) => return auth_failure(&log, &e),
    };

    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(error = %e, "can't acquire IOMgr connection");
            log.emit(StatusCode::INTERNAL_SERVER_ERROR);
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    let request_id = match conn
        .send_request(
            target.verb,
            target.object_type,
            &user_name,
            &token,
            &target.object_name,
            target.object_id,
        )
        .await
    {
        Ok(id) => id,
        Err(e) => return iomgr_failure(&log, &e),
    };

    // First response: the engine is ready to take the payload.
    if let Err(e) = conn.recv_response(request_id).await {
        return iomgr_failure(&log, &e);
    }

    if let Err(e) = conn
        .stream_body_to_peer(
            body.into_data_stream(),
            state.max_json_payload_size,
            state.request_payload_buffer_size,
        )
        .await
    {
        return iomgr_failure(&log, &e);
    }

    // Second response: the engine accepted the write.
    let status = match conn.recv_response(request_id).await {
        Ok(status) => status,
        Err(e) => return iomgr_failure(&log, &e),
    };

    stream_response(&state, conn, status_from_code(status), log)
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

pub async fn get_databases(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let log = RequestLog::new(method, &uri);
    let target = Target {
        verb: RestVerb::Get,
        object_type: DatabaseObjectType::Database,
        object_name: String::new(),
        object_id: 0,
    };
    run_read(state, log, headers, target).await
}

pub async fn get_tables(
    State(state): State<AppState>,
    Path(database_name): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let log = RequestLog::new(method, &uri);
    let target = Target {
        verb: RestVerb::Get,
        object_type: DatabaseObjectType::Table,
        object_name: database_name,
        object_id: 0,
    };
    run_read(state, log, headers, target).await
}

pub async fn get_rows(
    State(state): State<AppState>,
    Path((database_name, table_name)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let log = RequestLog::new(method, &uri);
    let target = Target {
        verb: RestVerb::Get,
        object_type: DatabaseObjectType::Row,
        object_name: format!("{database_name}.{table_name}"),
        object_id: 0,
    };
    run_read(state, log, headers, target).await
}

pub async fn get_row(
    State(state): State<AppState>,
    Path((database_name, table_name, row_id)): Path<(String, String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let log = RequestLog::new(method, &uri);
    let Ok(row_id) = row_id.parse::<u64>() else {
        log.emit(StatusCode::INTERNAL_SERVER_ERROR);
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "invalid row_id");
    };
    let target = Target {
        verb: RestVerb::Get,
        object_type: DatabaseObjectType::Row,
        object_name: format!("{database_name}.{table_name}"),
        object_id: row_id,
    };
    run_read(state, log, headers, target).await
}

pub async fn delete_row(
    State(state): State<AppState>,
    Path((database_name, table_name, row_id)): Path<(String, String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let log = RequestLog::new(method, &uri);
    let Ok(row_id) = row_id.parse::<u64>() else {
        log.emit(StatusCode::INTERNAL_SERVER_ERROR);
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "invalid row_id");
    };
    let target = Target {
        verb: RestVerb::Delete,
        object_type: DatabaseObjectType::Row,
        object_name: format!("{database_name}.{table_name}"),
        object_id: row_id,
    };
    run_read(state, log, headers, target).await
}

pub async fn post_rows(
    State(state): State<AppState>,
    Path((database_name, table_name)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let log = RequestLog::new(method, &uri);
    let target = Target {
        verb: RestVerb::Post,
        object_type: DatabaseObjectType::Row,
        object_name: format!("{database_name}.{table_name}"),
        object_id: 0,
    };
    run_write(state, log, headers, target, body).await
}

/// PUT is a synonym for PATCH; both land here.
pub async fn patch_row(
    State(state): State<AppState>,
    Path((database_name, table_name, row_id)): Path<(String, String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let log = RequestLog::new(method, &uri);
    let Ok(row_id) = row_id.parse::<u64>() else {
        log.emit(StatusCode::INTERNAL_SERVER_ERROR);
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "invalid row_id");
    };
    let target = Target {
        verb: RestVerb::Patch,
        object_type: DatabaseObjectType::Row,
        object_name: format!("{database_name}.{table_name}"),
        object_id: row_id,
    };
    run_write(state, log, headers, target, body).await
}

// ---------------------------------------------------------------------------
// SQL query endpoint
// ---------------------------------------------------------------------------

fn query_param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

pub async fn get_query(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let log = RequestLog::new(method, &uri);

    // Single query form: ?q=...
    if let Some(q) = query_param(&params, "q") {
        let target = Target {
            verb: RestVerb::Get,
            object_type: DatabaseObjectType::Sql,
            object_name: q.to_owned(),
            object_id: 0,
        };
        return run_read(state, log, headers, target).await;
    }

    // Multi-query form: ?q1=...&q2=..., contiguous from 1.
    let mut queries = Vec::new();
    while let Some(q) = query_param(&params, &format!("q{}", queries.len() + 1)) {
        queries.push(q.to_owned());
    }
    if queries.is_empty() {
        log.emit(StatusCode::BAD_REQUEST);
        return json_error(StatusCode::BAD_REQUEST, "missing query parameter");
    }

    run_multi_query(state, log, headers, queries).await
}

async fn send_literal(tx: &mut HttpChunkSender, literal: &'static [u8]) -> Result<(), ()> {
    tx.send(Ok(Bytes::from_static(literal))).await.map_err(|_| ())
}

async fn send_error_document(tx: &mut HttpChunkSender, status: StatusCode, text: &str) -> Result<(), ()> {
    let doc = serde_json::to_vec(&json!({ "status": status.as_u16(), "error": text }))
        .unwrap_or_default();
    tx.send(Ok(Bytes::from(doc))).await.map_err(|_| ())
}

/// One sub-query of the multi-query form. Failed queries put an error
/// document into the array; a fatal connection error also ends the batch.
async fn run_one_query(
    conn: &mut PooledConn,
    tx: &mut HttpChunkSender,
    query: &str,
    user_name: &str,
    token: &str,
    http_chunk_size: usize,
) -> Result<(), ()> {
    let request_id = match conn
        .send_request(RestVerb::Get, DatabaseObjectType::Sql, user_name, token, query, 0)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(error = %e, "query dispatch failed");
            send_error_document(tx, StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).await?;
            return Err(());
        }
    };

    match conn.recv_response(request_id).await {
        Ok(_) => {}
        Err(IoMgrError::App { rest_status, code, text }) => {
            tracing::error!(code, text = %text, "query rejected by IOMgr");
            send_error_document(tx, status_from_code(rest_status), &text).await?;
            return Ok(());
        }
        Err(e) => {
            tracing::error!(error = %e, "query response failed");
            send_error_document(tx, StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).await?;
            return Err(());
        }
    }

    match conn.stream_body_from_peer(tx, http_chunk_size).await {
        Ok(_) => Ok(()),
        Err(e) => {
            // Mid-body failure; the document is already partially written,
            // so no error document can be inserted here.
            tracing::error!(error = %e, "query result streaming failed");
            Err(())
        }
    }
}

/// Multi-query pipeline: one HTTP 200 whose body is a JSON array with one
/// document per sub-query, all served by the same pooled connection.
async fn run_multi_query(
    state: AppState,
    log: RequestLog,
    headers: HeaderMap,
    queries: Vec<String>,
) -> Response {
    let (user_name, token) = match auth::basic_credentials(&headers) {
        Ok(credentials) => credentials,
        Err(e) => return auth_failure(&log, &e),
    };

    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(error = %e, "can't acquire IOMgr connection");
            log.emit(StatusCode::INTERNAL_SERVER_ERROR);
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    let (mut tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(2);
    let http_chunk_size = state.http_chunk_size;

    tokio::spawn(async move {
        let mut broken = send_literal(&mut tx, b"[").await.is_err();
        if !broken {
            for (index, query) in queries.iter().enumerate() {
                if index > 0 && send_literal(&mut tx, b",").await.is_err() {
                    broken = true;
                    break;
                }
                if run_one_query(&mut conn, &mut tx, query, &user_name, &token, http_chunk_size)
                    .await
                    .is_err()
                {
                    broken = true;
                    break;
                }
            }
        }
        // The array is closed even after a failed sub-query.
        let closed = send_literal(&mut tx, b"]").await.is_ok();
        if broken || !closed {
            conn.invalidate();
        }
        log.emit(StatusCode::OK);
    });

    let mut response = Response::new(Body::from_stream(rx));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
