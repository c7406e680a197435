//! Axum + Askama operator console: cycle status, manual checks and recipient management.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{rejection::JsonRejection, Path as AxumPath, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Map, Value};
use shiftwatch_core::Recipient;
use shiftwatch_storage::RegistryError;
use shiftwatch_sync::{describe_paths, Checker, CheckerConfig, CycleError};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "shiftwatch-web";

pub const DEFAULT_WEB_PORT: u16 = 5003;

#[derive(Clone)]
pub struct AppState {
    pub checker: Arc<Checker>,
    pub config: CheckerConfig,
}

impl AppState {
    pub fn new(checker: Arc<Checker>, config: CheckerConfig) -> Self {
        Self { checker, config }
    }
}

struct RecipientRow {
    email: String,
    channels: String,
    delay: u64,
}

struct PathRow {
    name: &'static str,
    path: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    status: &'static str,
    last_run_id: String,
    finished_at: String,
    message: String,
    recipients: Vec<RecipientRow>,
    paths: Vec<PathRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/check", post(check_handler))
        .route("/recipients", get(list_recipients).post(add_recipient))
        .route(
            "/recipients/{email}",
            put(update_recipient).delete(remove_recipient),
        )
        .route("/notifications/test", post(test_notification_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("SHIFTWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_WEB_PORT)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web console listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.checker.tracker().snapshot();
    let stored = state.checker.registry().list().await.unwrap_or_else(|err| {
        warn!(error = %err, "recipient list unavailable for the console");
        Vec::new()
    });
    let recipients = stored
        .into_iter()
        .map(|r| {
            let mut channels = Vec::new();
            if r.use_email {
                channels.push("email");
            }
            if r.use_telegram {
                channels.push("telegram");
            }
            RecipientRow {
                channels: if channels.is_empty() { "none".into() } else { channels.join(", ") },
                delay: r.delay,
                email: r.email,
            }
        })
        .collect();
    let tpl = IndexTemplate {
        status: snapshot.status.as_str(),
        last_run_id: snapshot
            .last_run_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "n/a".into()),
        finished_at: snapshot
            .finished_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "n/a".into()),
        message: snapshot.message.unwrap_or_default(),
        recipients,
        paths: describe_paths(&state.config)
            .into_iter()
            .map(|(name, path)| PathRow {
                name,
                path: path.display().to_string(),
            })
            .collect(),
    };
    render_html(tpl)
}

async fn health_handler() -> Response {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().timestamp(),
    }))
    .into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.checker.tracker().snapshot()).into_response()
}

/// Starts a cycle in the background; the caller polls `/status` for the result.
async fn check_handler(State(state): State<Arc<AppState>>) -> Response {
    if state.checker.tracker().is_running() {
        return error_json(StatusCode::CONFLICT, "a check cycle is already running");
    }
    let checker = Arc::clone(&state.checker);
    tokio::spawn(async move {
        match checker.run().await {
            Ok(outcome) => info!(run_id = %outcome.run_id, "manual check finished"),
            Err(CycleError::AlreadyRunning) => info!("manual check skipped; cycle already running"),
            Err(err) => error!(error = %err, "manual check failed"),
        }
    });
    (StatusCode::ACCEPTED, Json(json!({ "status": "started" }))).into_response()
}

async fn list_recipients(State(state): State<Arc<AppState>>) -> Response {
    match state.checker.registry().list().await {
        Ok(recipients) => Json(recipients).into_response(),
        Err(err) => registry_error(err),
    }
}

async fn add_recipient(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Recipient>, JsonRejection>,
) -> Response {
    let Json(recipient) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    match state.checker.registry().add(recipient.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(recipient)).into_response(),
        Err(err) => registry_error(err),
    }
}

/// Merges the body onto the stored recipient; fields it omits keep their stored values and
/// the email always comes from the path.
async fn update_recipient(
    State(state): State<Arc<AppState>>,
    AxumPath(email): AxumPath<String>,
    body: Result<Json<Map<String, Value>>, JsonRejection>,
) -> Response {
    let Json(changes) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    match state.checker.registry().patch(&email, changes).await {
        Ok(recipient) => Json(recipient).into_response(),
        Err(err) => registry_error(err),
    }
}

async fn remove_recipient(
    State(state): State<Arc<AppState>>,
    AxumPath(email): AxumPath<String>,
) -> Response {
    match state.checker.registry().remove(&email).await {
        Ok(removed) => Json(removed).into_response(),
        Err(err) => registry_error(err),
    }
}

async fn test_notification_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.checker.test_notification().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => {
            warn!(error = %err, "test notification not sent");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

fn registry_error(err: RegistryError) -> Response {
    let status = match &err {
        RegistryError::Duplicate(_) => StatusCode::CONFLICT,
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Invalid(_) | RegistryError::Malformed(_) => StatusCode::BAD_REQUEST,
        RegistryError::Corrupt { .. } | RegistryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %err, "recipient registry unavailable");
    }
    error_json(status, &err.to_string())
}

/// Malformed or mistyped request bodies are client errors, reported like registry rejections.
fn bad_body(rejection: JsonRejection) -> Response {
    error_json(StatusCode::BAD_REQUEST, &rejection.body_text())
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use shiftwatch_core::RunId;
    use shiftwatch_notify::{LogOnlyAlert, RecordingSink};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const PAGE: &str = r#"<table><tbody>
        <tr class="MuiTableRow-root MuiTableRow-hover">
          <td>Gala</td><td>2024-05-10</td><td>18:00</td><td>London</td><td>Usher</td><td>1/4</td>
        </tr></tbody></table>"#;

    fn test_state() -> (TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("positions.html");
        std::fs::write(&page, PAGE).unwrap();
        let mut config = CheckerConfig::in_dir(dir.path());
        config.source_file = Some(page);
        let checker = Checker::from_config(
            &config,
            Arc::new(RecordingSink::new()),
            Arc::new(LogOnlyAlert),
        )
        .unwrap();
        (dir, AppState::new(Arc::new(checker), config))
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> axum::http::Request<Body> {
        let builder = axum::http::Request::builder().method(method).uri(uri);
        match body {
            Some(v) => builder
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn index_renders_status_and_paths() {
        let (_dir, state) = test_state();
        let resp = app(state)
            .oneshot(request("GET", "/", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains("Shiftwatch"));
        assert!(html.contains("idle"));
        assert!(html.contains("jobs_seen.json"));
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let (_dir, state) = test_state();
        let resp = app(state).oneshot(request("GET", "/health", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "healthy");
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn status_starts_idle() {
        let (_dir, state) = test_state();
        let resp = app(state).oneshot(request("GET", "/status", None)).await.unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["status"], "idle");
        assert!(json["last_run_id"].is_null());
    }

    #[tokio::test]
    async fn check_conflicts_while_a_cycle_runs() {
        let (_dir, state) = test_state();
        state.checker.tracker().begin(&RunId::new("run_busy"));
        let resp = app(state).oneshot(request("POST", "/check", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn check_is_accepted_when_idle() {
        let (_dir, state) = test_state();
        let resp = app(state).oneshot(request("POST", "/check", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn recipient_lifecycle_maps_registry_errors() {
        let (_dir, state) = test_state();
        let router = app(state);
        let alice = json!({ "email": "alice@example.test", "delay": 5 });

        let resp = router.clone().oneshot(request("POST", "/recipients", Some(alice.clone()))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let resp = router.clone().oneshot(request("POST", "/recipients", Some(alice))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let bad = json!({ "email": "not-an-email" });
        let resp = router.clone().oneshot(request("POST", "/recipients", Some(bad))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let no_chat = json!({ "use_telegram": true });
        let resp = router
            .clone()
            .oneshot(request("PUT", "/recipients/alice@example.test", Some(no_chat)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let prefs = json!({ "delay": 10, "notify_reopened": false });
        let resp = router
            .clone()
            .oneshot(request("PUT", "/recipients/alice@example.test", Some(prefs.clone())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["delay"], 10);
        assert_eq!(json["notify_reopened"], false);

        let resp = router
            .clone()
            .oneshot(request("PUT", "/recipients/bob@example.test", Some(prefs)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = router.clone().oneshot(request("GET", "/recipients", None)).await.unwrap();
        let json = body_json(resp).await;
        assert_eq!(json.as_array().unwrap().len(), 1);

        let resp = router
            .clone()
            .oneshot(request("DELETE", "/recipients/alice@example.test", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = router
            .oneshot(request("DELETE", "/recipients/alice@example.test", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn mistyped_bodies_are_bad_requests() {
        let (_dir, state) = test_state();
        let router = app(state);
        for body in [json!({ "delay": 5 }), json!({ "email": 5 })] {
            let resp = router.clone().oneshot(request("POST", "/recipients", Some(body))).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert!(body_json(resp).await["error"].is_string());
        }

        let alice = json!({ "email": "alice@example.test" });
        router.clone().oneshot(request("POST", "/recipients", Some(alice))).await.unwrap();
        let resp = router
            .oneshot(request("PUT", "/recipients/alice@example.test", Some(json!({ "delay": "soon" }))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_keeps_fields_the_body_omits() {
        let (_dir, state) = test_state();
        let mut stored = Recipient::new("alice@example.test");
        stored.use_telegram = true;
        stored.telegram_id = "42".into();
        stored.notify_spotfreed = false;
        state.checker.registry().add(stored).await.unwrap();

        let resp = app(state.clone())
            .oneshot(request("PUT", "/recipients/alice@example.test", Some(json!({ "delay": 10 }))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["delay"], 10);
        assert_eq!(json["use_telegram"], true);
        assert_eq!(json["telegram_id"], "42");
        assert_eq!(json["notify_spotfreed"], false);

        let saved = state.checker.registry().get("alice@example.test").await.unwrap().unwrap();
        assert_eq!(saved.delay, 10);
        assert_eq!(saved.telegram_id, "42");
    }

    #[tokio::test]
    async fn unreadable_recipient_list_is_a_server_error() {
        let (_dir, state) = test_state();
        std::fs::write(&state.config.recipients_file, b"[{").unwrap();
        let router = app(state);

        let resp = router.clone().oneshot(request("GET", "/recipients", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let resp = router.clone().oneshot(request("POST", "/notifications/test", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let resp = router.oneshot(request("GET", "/", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_notification_reports_recipients() {
        let (_dir, state) = test_state();
        state
            .checker
            .registry()
            .add(Recipient::new("ops@example.test"))
            .await
            .unwrap();
        let resp = app(state)
            .oneshot(request("POST", "/notifications/test", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["notified"][0], "ops@example.test");
    }
}
