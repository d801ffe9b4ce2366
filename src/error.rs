// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::warn;

use crate::currency::CurrencyError;
use crate::storage::StoreError;
use crate::sync::SyncError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        warn!(error = %e, "Storage failure in API handler");
        if e.is_integrity_violation() {
            return Self::internal("stored record failed integrity check");
        }
        match e {
            StoreError::NotFound(what) => Self::not_found(format!("{what} not found")),
            _ => Self::internal("storage error"),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::UnknownUser(chat_id) => Self::not_found(format!("user {chat_id} not found")),
            SyncError::Stopped => Self::unavailable("synchronizer is not running"),
            SyncError::Banking(e) => Self::bad_gateway(e.to_string()),
            SyncError::Store(e) => e.into(),
        }
    }
}

impl From<CurrencyError> for ApiError {
    fn from(e: CurrencyError) -> Self {
        match e {
            CurrencyError::InvalidRequest(message) => Self::bad_request(message),
            CurrencyError::Provider(e) => Self::bad_gateway(e.to_string()),
            CurrencyError::Stopped => Self::unavailable("currency worker is not running"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::RateProviderError;
    use axum::body::to_bytes;

    #[test]
    fn constructors_set_status_and_message() {
        let nf = ApiError::not_found("missing");
        assert_eq!(nf.status, StatusCode::NOT_FOUND);
        assert_eq!(nf.message, "missing");

        let bad = ApiError::bad_request("bad");
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);

        let gw = ApiError::bad_gateway("upstream");
        assert_eq!(gw.status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn domain_errors_map_to_statuses() {
        assert_eq!(ApiError::from(SyncError::UnknownUser(5)).status, StatusCode::NOT_FOUND);
        assert_eq!(ApiError::from(SyncError::Stopped).status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ApiError::from(CurrencyError::InvalidRequest("x".into())).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(CurrencyError::Provider(RateProviderError::Rejected("quota".into()))).status,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(StoreError::InvalidRecord("x".into())).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn into_response_returns_json_body() {
        let response = ApiError::bad_request("bad data").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body_bytes.to_vec()).unwrap();
        assert_eq!(body, r#"{"error":"bad data"}"#);
    }
}
