// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    extract::{Query, State},
    Json,
};

use crate::currency::CurrencyRequest;
use crate::error::ApiError;
use crate::models::{CurrencyReply, RateParams};
use crate::providers::RateFunction;
use crate::state::AppState;

/// Look up an exchange rate through the currency worker.
///
/// A `date` selects the historical rate; otherwise the live rate is used.
#[utoipa::path(
    get,
    path = "/v1/rates",
    tag = "Rates",
    params(RateParams),
    responses(
        (status = 200, description = "Rate resolved", body = CurrencyReply),
        (status = 400, description = "Invalid currency or date"),
        (status = 502, description = "Rate provider failure"),
        (status = 503, description = "Currency worker not running")
    )
)]
pub async fn get_rate(
    State(state): State<AppState>,
    Query(params): Query<RateParams>,
) -> Result<Json<CurrencyReply>, ApiError> {
    let function = if params.date.is_some() {
        RateFunction::Historical
    } else {
        RateFunction::Live
    };
    let amount = params.amount.unwrap_or(1.0);
    if !amount.is_finite() {
        return Err(ApiError::bad_request("amount must be a finite number"));
    }

    let reply = state
        .currency
        .convert(CurrencyRequest {
            function,
            base: params.base,
            target: params.target,
            amount,
            date: params.date,
        })
        .await?;
    Ok(Json(reply))
}
