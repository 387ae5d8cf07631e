// Copyright 2025 the workhost authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The per-worker HTTP surface: `executeCommand`, `ready`, and
//! `getPublicMethods/:pluginName`, behind the shutting-down rejection
//! middleware and the mirrored-origin CORS header rule.
//!
//! Router assembly follows the usual axum shape: typed handlers over an
//! `AppState`, served with `axum::serve(...).with_graceful_shutdown(...)`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::dispatcher::Command;
use crate::worker::runtime::WorkerRuntime;

const ALLOWED_METHODS: &str = "GET, PUT, OPTIONS";
const ALLOWED_HEADERS: &str =
    "Content-Type, Content-Length, X-Content-Length, Access-Control-Allow-Origin, User-Agent, Authorization";

pub fn build_router(runtime: Arc<WorkerRuntime>) -> Router {
    let prefix = runtime.config.url_prefix.trim_matches('/');
    let execute_path = format!("/{prefix}/executeCommand");
    let ready_path = format!("/{prefix}/ready");
    let public_methods_path = format!("/{prefix}/getPublicMethods/:plugin_name");

    Router::new()
        .route(&execute_path, put(execute_command))
        .route(&ready_path, get(ready))
        .route(&public_methods_path, get(get_public_methods))
        .layer(middleware::from_fn(cors_middleware))
        .layer(middleware::from_fn_with_state(runtime.clone(), reject_while_shutting_down))
        .layer(TraceLayer::new_for_http())
        .with_state(runtime)
}

async fn reject_while_shutting_down(
    State(runtime): State<Arc<WorkerRuntime>>,
    request: Request,
    next: Next,
) -> Response {
    if runtime.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    next.run(request).await
}

/// Mirrors the request's `Origin` (falling back to `Host`, then `*`) into
/// `Access-Control-Allow-Origin`. Plain `tower_http::cors` can't express the
/// Host fallback, so this is hand-rolled.
async fn cors_middleware(request: Request, next: Next) -> Response {
    let origin = request.headers().get(header::ORIGIN).cloned();
    let host = request.headers().get(header::HOST).cloned();
    let is_preflight = request.method() == Method::OPTIONS;

    let mut response = next.run(request).await;

    let allow_origin = origin.or(host).unwrap_or_else(|| HeaderValue::from_static("*"));
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOWED_METHODS));
    headers.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOWED_HEADERS));

    if is_preflight {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

async fn execute_command(State(runtime): State<Arc<WorkerRuntime>>, body: Bytes) -> Response {
    let cmd: Command = match serde_json::from_slice(&body) {
        Ok(cmd) => cmd,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"statusCode": 400, "result": "Invalid body"})),
            )
                .into_response();
        }
    };

    match runtime.execute_command(cmd).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "statusCode": 200,
                "operationType": outcome.operation_type,
                "result": outcome.result,
            })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "statusCode": 500,
                "result": {"message": e.to_string(), "stack": Value::Null},
            })),
        )
            .into_response(),
    }
}

async fn ready(State(runtime): State<Arc<WorkerRuntime>>) -> Response {
    if runtime.is_ready().await {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        (StatusCode::OK, Json(json!({"status": "ready", "timestamp": timestamp}))).into_response()
    } else {
        (StatusCode::OK, Json(Value::String("not-ready".to_string()))).into_response()
    }
}

async fn get_public_methods(
    State(runtime): State<Arc<WorkerRuntime>>,
    Path(plugin_name): Path<String>,
) -> Response {
    match runtime.get_public_methods(&plugin_name).await {
        Some(methods) => (StatusCode::OK, Json(methods)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DynamicPortPolicy, WorkerConfig};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use std::path::PathBuf;
    use tower::ServiceExt;

    fn runtime() -> Arc<WorkerRuntime> {
        WorkerRuntime::new(WorkerConfig {
            id: "w1".into(),
            url_prefix: "api".into(),
            host: "127.0.0.1".into(),
            port: 0,
            dynamic_port: DynamicPortPolicy::Disabled,
            storage: PathBuf::from("/tmp"),
            env: None,
        })
    }

    #[tokio::test]
    async fn ready_reports_not_ready_before_init() {
        let app = build_router(runtime());
        let response = app
            .oneshot(HttpRequest::get("/api/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"\"not-ready\"");
    }

    #[tokio::test]
    async fn execute_command_with_bad_body_is_400() {
        let app = build_router(runtime());
        let response = app
            .oneshot(
                HttpRequest::put("/api/executeCommand")
                    .header("content-type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_plugin_public_methods_is_404() {
        let app = build_router(runtime());
        let response = app
            .oneshot(
                HttpRequest::get("/api/getPublicMethods/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cors_header_mirrors_origin() {
        let app = build_router(runtime());
        let response = app
            .oneshot(
                HttpRequest::get("/api/ready")
                    .header("origin", "https://example.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://example.test"
        );
    }
}
