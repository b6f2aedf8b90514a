//! HTTP trigger endpoint.
//!
//! `GET|POST /deploy?t=<token>&b=<branch>&c=<commit>` runs one deployment and
//! answers with the rendered transcript. Provider webhooks hit the same route
//! with their event headers and payload. `GET /healthz` answers `ok`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, FromRequest, Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, PRAGMA};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use gitdeploy_core::{DeployReport, Deployer, TriggerRequest};

/// Response header carrying the run id.
pub const HEADER_RUN_ID: &str = "x-gitdeploy-run-id";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Clone)]
pub struct AppState {
    deployer: Arc<Deployer>,
}

pub fn router(deployer: Arc<Deployer>) -> Router {
    let state = AppState { deployer };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/deploy", get(deploy).post(deploy))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

/// Query parameters of `/deploy`.
#[derive(Debug, Default, Deserialize)]
pub struct DeployQuery {
    /// Access token.
    pub t: Option<String>,
    /// Branch.
    pub b: Option<String>,
    /// Commit.
    pub c: Option<String>,
}

/// GitHub's form-encoded delivery format.
#[derive(Debug, Deserialize)]
struct PayloadForm {
    payload: String,
}

async fn deploy(
    State(st): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<DeployQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let caller = caller_address(&headers, peer, st.deployer.config().trust_forwarded_for);
    let body = match decode_body(&headers, body).await {
        Ok(body) => body,
        Err(rejection) => return rejection,
    };

    let mut trigger = TriggerRequest {
        caller_address: caller,
        token: query.t,
        ..TriggerRequest::default()
    }
    .with_body(body);
    if let Some(branch) = query.b {
        trigger = trigger.with_branch(branch);
    }
    if let Some(commit) = query.c {
        trigger = trigger.with_commit(commit);
    }
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            trigger = trigger.with_header(name.as_str(), value);
        }
    }

    // Runs to completion even if the caller disconnects.
    let deployer = Arc::clone(&st.deployer);
    let run = tokio::spawn(async move { deployer.handle(trigger).await });
    match run.await {
        Ok(report) => report_response(&report),
        Err(e) => {
            error!(error = %e, "deployment task failed");
            no_store((StatusCode::INTERNAL_SERVER_ERROR, "deployment task failed\n").into_response())
        }
    }
}

/// Peer IP, or the first `X-Forwarded-For` entry when trusted.
fn caller_address(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(addr) = forwarded {
            return addr.to_string();
        }
    }
    peer.ip().to_string()
}

/// Unwrap a form-encoded `payload=` field; other bodies pass through.
async fn decode_body(headers: &HeaderMap, body: Bytes) -> Result<Vec<u8>, Response> {
    let is_form = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(FORM_CONTENT_TYPE));
    if !is_form || body.is_empty() {
        return Ok(body.to_vec());
    }

    let request = Request::builder()
        .method("POST")
        .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
        .body(Body::from(body))
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()).into_response())?;
    match Form::<PayloadForm>::from_request(request, &()).await {
        Ok(Form(form)) => Ok(form.payload.into_bytes()),
        Err(rejection) => {
            debug!(error = %rejection, "form body without payload field");
            Err(no_store((StatusCode::BAD_REQUEST, rejection.body_text()).into_response()))
        }
    }
}

fn report_response(report: &DeployReport) -> Response {
    let status = StatusCode::from_u16(report.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (
        status,
        [(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))],
        report.body(),
    )
        .into_response();
    if let Ok(run_id) = HeaderValue::from_str(&report.run_id) {
        response.headers_mut().insert(HEADER_RUN_ID, run_id);
    }
    no_store(response)
}

fn no_store(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, max-age=0"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    response
}
