//! HTTP surface: login/logout, the gated API routes, embedded dashboard
//! assets, and the middleware stack around them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{AppendHeaders, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::error::ApiError;
use crate::process::terminate;
use crate::session::{
    cookie_value, expired_cookie, session_cookie, Session, CSRF_COOKIE, CSRF_HEADER,
    SESSION_COOKIE,
};
use crate::state::AppState;
use crate::ws::ws_handler;

const INDEX_HTML: &str = include_str!("../static/index.html");
const APP_JS: &str = include_str!("../static/app.js");
const STYLE_CSS: &str = include_str!("../static/style.css");

const MAX_LOGIN_BODY: usize = 256;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/metrics", get(metrics))
        .route("/api/export", get(export))
        .route("/api/connections", get(connections))
        .route("/api/kill", post(kill).fallback(method_not_allowed))
        .route("/api/config", get(config))
        .route("/ws", get(ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));

    Router::new()
        .route("/", get(index))
        .route("/index.html", get(index))
        .route("/app.js", get(app_js))
        .route("/style.css", get(style_css))
        .route("/api/login", post(login).fallback(method_not_allowed))
        .route("/api/logout", post(logout).fallback(method_not_allowed))
        .route("/api/auth/check", get(auth_check))
        .merge(protected)
        .fallback(fallback)
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(recover_panics))
        .with_state(state)
}

// ---------- middleware ----------

async fn recover_panics(req: Request, next: Next) -> Response {
    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(resp) => resp,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            error!(panic = %msg, "handler panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal Server Error" })),
            )
                .into_response()
        }
    }
}

async fn security_headers(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let h = resp.headers_mut();
    h.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    h.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    h.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("same-origin"),
    );
    resp
}

/// Valid session required; mutating methods also need the CSRF header.
async fn require_session(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let session = session_from(&state, req.headers()).ok_or(ApiError::Unauthorized)?;
    if !matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
        let submitted = req
            .headers()
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !session.csrf_matches(submitted) {
            return Err(ApiError::CsrfMismatch);
        }
    }
    Ok(next.run(req).await)
}

fn session_from(state: &AppState, headers: &HeaderMap) -> Option<Session> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|h| cookie_value(h, SESSION_COOKIE))
        .and_then(|token| state.gate.sessions.get(token))
}

/// Rate-limit key for the caller. Forwarding headers only count behind a
/// trusted proxy; otherwise they are attacker-controlled.
fn client_addr(
    state: &AppState,
    headers: &HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> String {
    if state.trust_proxy_headers {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let real = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded.or(real) {
            return ip.to_string();
        }
    }
    peer.map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ---------- auth ----------

#[derive(Deserialize)]
struct LoginRequest {
    password: String,
}

async fn login(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let addr = client_addr(&state, &headers, peer);
    state.gate.limiter.check(&addr)?;

    if body.len() > MAX_LOGIN_BODY {
        return Err(ApiError::BadRequest("Bad request"));
    }
    let req: LoginRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::BadRequest("Bad request"))?;

    let session = state.gate.login(&addr, &req.password).await?;
    let secure = state.secure_cookies;
    Ok((
        AppendHeaders([
            (
                header::SET_COOKIE,
                session_cookie(SESSION_COOKIE, &session.token, true, secure),
            ),
            (
                header::SET_COOKIE,
                session_cookie(CSRF_COOKIE, &session.csrf, false, secure),
            ),
        ]),
        Json(json!({ "ok": true })),
    )
        .into_response())
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|h| cookie_value(h, SESSION_COOKIE))
    {
        state.gate.logout(token);
    }
    (
        AppendHeaders([
            (header::SET_COOKIE, expired_cookie(SESSION_COOKIE)),
            (header::SET_COOKIE, expired_cookie(CSRF_COOKIE)),
        ]),
        Json(json!({ "ok": true })),
    )
        .into_response()
}

async fn auth_check(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match session_from(&state, &headers) {
        Some(_) => Json(json!({ "authenticated": true })).into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "authenticated": false })),
        )
            .into_response(),
    }
}

async fn fallback(State(state): State<AppState>, headers: HeaderMap) -> ApiError {
    match session_from(&state, &headers) {
        Some(_) => ApiError::NotFound("Not found".to_string()),
        None => ApiError::Unauthorized,
    }
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

// ---------- API ----------

async fn snapshot_json(state: &AppState) -> Result<String, ApiError> {
    let viewers = state.hub.viewer_count().await;
    state
        .snapshots
        .json(viewers)
        .await
        .map(|s| s.to_string())
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("Failed to collect metrics")))
}

async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let body = snapshot_json(&state).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

async fn export(State(state): State<AppState>) -> Result<Response, ApiError> {
    let body = snapshot_json(&state).await?;
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let disposition = format!("attachment; filename=talaria-metrics-{unix}.json");
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

async fn connections(State(state): State<AppState>) -> Result<Response, ApiError> {
    let table = state.connections.clone();
    let details = tokio::task::spawn_blocking(move || table.details())
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(Json(details).into_response())
}

async fn kill(Query(q): Query<HashMap<String, String>>) -> Result<Response, ApiError> {
    let raw = q
        .get("pid")
        .filter(|s| !s.is_empty())
        .ok_or(ApiError::BadRequest("Missing pid"))?;
    let pid: u32 = raw.parse().map_err(|_| ApiError::BadRequest("Invalid pid"))?;

    tokio::task::spawn_blocking(move || terminate(pid))
        .await
        .map_err(|e| ApiError::Internal(e.into()))??;
    Ok((StatusCode::OK, format!("Process {pid} killed")).into_response())
}

async fn config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "theme": &*state.theme }))
}

// ---------- static assets ----------

async fn index() -> Response {
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        INDEX_HTML,
    )
        .into_response()
}

async fn app_js() -> Response {
    (
        [(header::CONTENT_TYPE, "text/javascript; charset=utf-8")],
        APP_JS,
    )
        .into_response()
}

async fn style_css() -> Response {
    (
        [(header::CONTENT_TYPE, "text/css; charset=utf-8")],
        STYLE_CSS,
    )
        .into_response()
}
