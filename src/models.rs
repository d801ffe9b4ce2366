// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # API Data Models
//!
//! Request and response bodies of the operational API. Worker-facing types
//! ([`SyncReport`], [`CurrencyReply`]) are re-used directly as response
//! bodies.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

pub use crate::currency::CurrencyReply;
pub use crate::sync::SyncReport;

/// Body of `POST /v1/sync`. An absent body or `chat_id` runs a full sweep.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct SyncRequest {
    /// Refresh this user's accounts and cards instead of sweeping.
    #[serde(default)]
    pub chat_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SyncResponse {
    /// `sync_all` or `refresh_profile`.
    pub trigger: String,
    pub report: SyncReport,
}

/// Query parameters for `GET /v1/rates`.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct RateParams {
    /// ISO 4217 code to convert from.
    pub base: String,
    /// ISO 4217 code to convert to (default: local currency).
    pub target: Option<String>,
    /// Amount in major units (default: 1).
    pub amount: Option<f64>,
    /// `YYYY-MM-DD`; selects the historical rate.
    pub date: Option<String>,
}
