//! Version authority HTTP server

pub mod api;
pub mod auth;
pub mod error;
pub mod rate_limit;

use anyhow::Result;
use axum::routing::{delete, get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::storage::Database;

pub use auth::Principal;
pub use error::ApiError;
pub use rate_limit::{RateLimit, SlidingWindowLimiter, Unlimited};

const LIMITER_CLEANUP_EVERY: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub limiter: Arc<dyn RateLimit>,
}

impl AppState {
    pub fn new(db: Database, limiter: Arc<dyn RateLimit>) -> Self {
        Self { db, limiter }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/v1/sync/manifest", get(api::manifest))
        .route("/api/v1/sync/report", post(api::report_sync))
        .route("/api/v1/machines", post(api::register_machine))
        .route("/api/v1/assets", post(api::create_asset))
        .route("/api/v1/assets/{id}", delete(api::delete_asset))
        .route(
            "/api/v1/assets/{id}/content",
            get(api::get_content).put(api::push_content),
        )
        .route(
            "/api/v1/assets/{id}/versions",
            get(api::list_versions).post(api::publish_version),
        )
        .route("/api/v1/assets/{id}/versions/{version}", get(api::get_version))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `state` on an already-bound listener until the process is interrupted
pub async fn serve_with_listener(listener: TcpListener, state: AppState) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;
    Ok(())
}

pub async fn serve(config: &ServerConfig) -> Result<()> {
    let db = Database::open(&config.db_path)?;
    if let Some(token) = &config.bootstrap_token {
        let user = db.ensure_user(token)?;
        info!("Bootstrap token ready for user {}", user);
    }

    let limiter = Arc::new(SlidingWindowLimiter::per_minute(config.rate_limit_per_minute));
    let sweeper = Arc::clone(&limiter);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LIMITER_CLEANUP_EVERY);
        loop {
            ticker.tick().await;
            sweeper.cleanup(LIMITER_CLEANUP_EVERY);
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(
        "Version authority listening on {} (db {})",
        addr,
        config.db_path.display()
    );

    serve_with_listener(listener, AppState::new(db, limiter)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PushResponse, RegisterMachineRequest, SyncManifest};
    use crate::hash::content_hash;
    use crate::storage::authority::tests::inline_asset;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    struct Harness {
        db: Database,
        asset: String,
        machine: String,
    }

    fn harness(limiter: Arc<dyn RateLimit>) -> (Router, Harness) {
        let db = Database::open_in_memory().unwrap();
        let user = db.ensure_user("secret").unwrap();
        let machine = db
            .register_machine(
                &user,
                &RegisterMachineRequest {
                    name: "laptop".into(),
                    identifier: "id".into(),
                },
            )
            .unwrap()
            .id;
        let asset = db.create_asset(&user, &inline_asset("reviewer", "v1")).unwrap().id;
        let app = router(AppState::new(db.clone(), limiter));
        (app, Harness { db, asset, machine })
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, "Bearer secret");
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn push_body(content: &str, machine: &str) -> serde_json::Value {
        serde_json::json!({
            "content": content,
            "localHash": content_hash(content),
            "machineId": machine,
        })
    }

    #[tokio::test]
    async fn test_requires_bearer_token() {
        let (app, _) = harness(Arc::new(Unlimited));
        let response = app
            .clone()
            .oneshot(Request::get("/api/v1/sync/manifest?machineId=x").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::get("/api/v1/sync/manifest?machineId=x")
                    .header(header::AUTHORIZATION, "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_push_then_manifest() {
        let (app, h) = harness(Arc::new(Unlimited));
        let uri = format!("/api/v1/assets/{}/content", h.asset);

        let response = app
            .clone()
            .oneshot(request("PUT", &uri, Some(push_body("v2", &h.machine))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let pushed: PushResponse = json(response).await;
        assert_eq!(pushed.version, "1.0.1");

        let response = app
            .oneshot(request(
                "GET",
                &format!("/api/v1/sync/manifest?machineId={}", h.machine),
                None,
            ))
            .await
            .unwrap();
        let manifest: SyncManifest = json(response).await;
        let asset = &manifest.assets[0];
        assert_eq!(asset.current_version, "1.0.1");
        assert_eq!(
            asset.sync_state.as_ref().unwrap().local_hash,
            Some(content_hash("v2"))
        );
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (app, h) = harness(Arc::new(Unlimited));

        let missing = app
            .clone()
            .oneshot(request("GET", "/api/v1/assets/nope/content", None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = json(missing).await;
        assert!(body["error"].as_str().unwrap().contains("nope"));

        let no_machine = app
            .clone()
            .oneshot(request("GET", "/api/v1/sync/manifest", None))
            .await
            .unwrap();
        assert_eq!(no_machine.status(), StatusCode::BAD_REQUEST);

        h.db.conn
            .lock()
            .execute(
                "UPDATE assets SET current_version = 'one' WHERE id = ?1",
                [&h.asset],
            )
            .unwrap();
        let malformed = app
            .oneshot(request(
                "PUT",
                &format!("/api/v1/assets/{}/content", h.asset),
                Some(push_body("v2", &h.machine)),
            ))
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_rate_limited_with_retry_after() {
        let (app, h) = harness(Arc::new(SlidingWindowLimiter::per_minute(1)));
        let uri = format!("/api/v1/assets/{}/content", h.asset);

        let first = app.clone().oneshot(request("GET", &uri, None)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(request("GET", &uri, None)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(header::RETRY_AFTER));
    }
}
