// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    currency::CurrencyReply,
    models::{SyncRequest, SyncResponse},
    providers::RateFunction,
    state::AppState,
    sync::SyncReport,
};

pub mod health;
pub mod rates;
pub mod sync;

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/sync", post(sync::trigger_sync))
        .route("/rates", get(rates::get_rate))
        .with_state(state.clone());

    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .with_state(state);

    Router::new()
        .merge(health_routes)
        .nest("/v1", v1_routes)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CorsLayer::permissive())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        health::liveness,
        sync::trigger_sync,
        rates::get_rate
    ),
    components(
        schemas(
            health::ReadyResponse,
            health::HealthChecks,
            health::HealthResponse,
            SyncRequest,
            SyncResponse,
            SyncReport,
            CurrencyReply,
            RateFunction
        )
    ),
    tags(
        (name = "Health", description = "Liveness and readiness probes"),
        (name = "Sync", description = "On-demand ledger reconciliation"),
        (name = "Rates", description = "Cached exchange-rate lookups")
    )
)]
struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{FieldCipher, StaticKeyProvider, KEY_LEN};
    use crate::currency::CurrencyWorker;
    use crate::providers::{RateProvider, RateProviderError, RateQuery, RateQuote};
    use crate::storage::{LedgerDatabase, ProfileDatabase};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct FixedRate;

    #[async_trait]
    impl RateProvider for FixedRate {
        async fn quote(&self, _: &RateQuery) -> Result<RateQuote, RateProviderError> {
            Ok(RateQuote {
                rate: 20.0,
                data: json!({"success": true}),
            })
        }
    }

    /// Router over real stores with the synchronizer not running.
    fn app(dir: &tempfile::TempDir, shutdown: &CancellationToken) -> Router {
        let cipher = FieldCipher::new(&StaticKeyProvider::new([9u8; KEY_LEN])).unwrap();
        let ledger = Arc::new(LedgerDatabase::open(&dir.path().join("ledger.redb")).unwrap());
        let profile = Arc::new(
            ProfileDatabase::open(&dir.path().join("profile.redb"), Arc::new(cipher)).unwrap(),
        );
        let (worker, currency) = CurrencyWorker::new(Arc::new(FixedRate), "ZAR", "R");
        tokio::spawn(worker.run(shutdown.clone()));
        let (sync, _) = crate::sync::trigger_channel();

        router(AppState {
            ledger,
            profile,
            sync,
            currency,
            data_dir: dir.path().to_path_buf(),
        })
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_components() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = CancellationToken::new();
        let response = app(&dir, &shutdown)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["checks"]["ledger"], "ok");
    }

    #[tokio::test]
    async fn rates_go_through_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = CancellationToken::new();
        let app = app(&dir, &shutdown);
        let response = app
            .clone()
            .oneshot(
                Request::get("/v1/rates?base=USD&amount=2&date=2024-01-05")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["rate"], 20.0);
        assert_eq!(body["result"], 40.0);
        assert_eq!(body["currency_symbol"], "R");

        let response = app
            .oneshot(Request::get("/v1/rates?base=dollar").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sync_without_worker_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = CancellationToken::new();
        let response = app(&dir, &shutdown)
            .oneshot(Request::post("/v1/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
