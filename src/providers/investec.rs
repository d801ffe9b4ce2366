// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Programmable-banking API client (Investec Open API).
//!
//! Authentication is OAuth client-credentials: the user's client id and
//! secret as basic auth plus their API key header. Tokens live in a
//! [`BankSession`] owned by the caller; when the client has to fetch a new
//! one it marks the session as rotated so the caller can persist it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::is_transient_http;
use crate::storage::{AccessToken, BankCredentials, LedgerTransaction, User};

pub const DEFAULT_API_BASE_URL: &str = "https://openapi.investec.com";

const TOKEN_PATH: &str = "/identity/v2/oauth2/token";
const ACCOUNTS_PATH: &str = "/za/pb/v1/accounts";
const CARDS_PATH: &str = "/za/v1/cards";

/// Refresh tokens this long before their stated expiry.
const TOKEN_EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum BankingError {
    #[error("banking API unreachable: {0}")]
    Unreachable(String),

    #[error("banking API auth failed: {0}")]
    Auth(String),

    #[error("banking API request failed: {0}")]
    Request(String),

    #[error("banking API response was invalid: {0}")]
    InvalidResponse(String),
}

impl BankingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BankingError::Unreachable(_))
    }
}

// =============================================================================
// Session
// =============================================================================

/// Per-user credentials and the current bearer token.
#[derive(Debug, Clone)]
pub struct BankSession {
    pub chat_id: i64,
    pub client_id: String,
    pub credentials: BankCredentials,
    pub token: Option<AccessToken>,
    rotated: bool,
}

impl BankSession {
    pub fn new(user: &User, token: Option<AccessToken>) -> Self {
        Self {
            chat_id: user.chat_id,
            client_id: user.client_id.clone(),
            credentials: user.credentials.clone(),
            token,
            rotated: false,
        }
    }

    /// Install a freshly issued token.
    pub fn rotate(&mut self, token: AccessToken) {
        self.token = Some(token);
        self.rotated = true;
    }

    /// The token issued since the last call, if any.
    pub fn take_rotated(&mut self) -> Option<AccessToken> {
        if std::mem::take(&mut self.rotated) {
            self.token.clone()
        } else {
            None
        }
    }

    fn valid_token(&self) -> Option<&str> {
        let horizon = Utc::now() + chrono::Duration::seconds(TOKEN_EXPIRY_SKEW_SECS);
        self.token
            .as_ref()
            .filter(|t| !t.is_expired(horizon))
            .map(|t| t.token.as_str())
    }
}

#[async_trait]
pub trait BankingApi: Send + Sync {
    /// Raw account metadata objects (`accountId`, `accountNumber`, ...).
    async fn accounts(&self, session: &mut BankSession) -> Result<Vec<Value>, BankingError>;

    /// Raw card metadata objects (`CardKey`, `CardNumber`, `AccountId`, ...).
    async fn cards(&self, session: &mut BankSession) -> Result<Vec<Value>, BankingError>;

    /// Posted transactions for one account, optionally since a `YYYY-MM-DD` date.
    async fn account_transactions(
        &self,
        session: &mut BankSession,
        account_id: &str,
        from_date: Option<&str>,
    ) -> Result<Vec<LedgerTransaction>, BankingError>;
}

// =============================================================================
// InvestecClient
// =============================================================================

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    1799
}

#[derive(Debug, Clone)]
pub struct InvestecClient {
    api_base_url: String,
    currency: String,
    http: Client,
}

impl InvestecClient {
    /// `currency` is stamped on API-sourced records, which carry none.
    pub fn new(api_base_url: &str, currency: &str) -> Result<Self, BankingError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BankingError::Request(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            currency: currency.to_ascii_uppercase(),
            http,
        })
    }

    async fn fetch_token(&self, session: &mut BankSession) -> Result<String, BankingError> {
        debug!(chat_id = session.chat_id, "Requesting banking API access token");
        let response = self
            .http
            .post(format!("{}{}", self.api_base_url, TOKEN_PATH))
            .basic_auth(&session.client_id, Some(&session.credentials.secret))
            .header("x-api-key", &session.credentials.api_key)
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| map_send_error("POST token", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BankingError::Auth(format!("token endpoint returned {status}: {body}")));
        }

        let token: OAuthTokenResponse = response
            .json()
            .await
            .map_err(|e| BankingError::InvalidResponse(format!("token response: {e}")))?;

        let access = AccessToken {
            token: token.access_token.clone(),
            expires_at: Utc::now() + chrono::Duration::seconds(token.expires_in),
        };
        session.rotate(access);
        Ok(token.access_token)
    }

    async fn bearer(&self, session: &mut BankSession) -> Result<String, BankingError> {
        let cached = session.valid_token().map(str::to_string);
        match cached {
            Some(token) => Ok(token),
            None => self.fetch_token(session).await,
        }
    }

    /// GET with one retry on 401 after forcing a new token.
    async fn get_json(
        &self,
        session: &mut BankSession,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, BankingError> {
        let mut token = self.bearer(session).await?;

        for attempt in 0..2 {
            let response = self
                .http
                .get(format!("{}{}", self.api_base_url, path))
                .bearer_auth(&token)
                .header("Accept", "application/json")
                .query(query)
                .send()
                .await
                .map_err(|e| map_send_error(&format!("GET {path}"), e))?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                warn!(chat_id = session.chat_id, path, "Access token rejected, re-authenticating");
                token = self.fetch_token(session).await?;
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = format!("GET {path} returned {status}: {body}");
                return Err(if status.is_server_error() {
                    BankingError::Unreachable(message)
                } else {
                    BankingError::Request(message)
                });
            }
            return response
                .json()
                .await
                .map_err(|e| BankingError::InvalidResponse(format!("GET {path} invalid JSON: {e}")));
        }

        Err(BankingError::Auth(format!("GET {path} unauthorized after token refresh")))
    }
}

#[async_trait]
impl BankingApi for InvestecClient {
    async fn accounts(&self, session: &mut BankSession) -> Result<Vec<Value>, BankingError> {
        let response = self.get_json(session, ACCOUNTS_PATH, &[]).await?;
        extract_list(&response, "/data/accounts")
    }

    async fn cards(&self, session: &mut BankSession) -> Result<Vec<Value>, BankingError> {
        let response = self.get_json(session, CARDS_PATH, &[]).await?;
        extract_list(&response, "/data/cards")
    }

    async fn account_transactions(
        &self,
        session: &mut BankSession,
        account_id: &str,
        from_date: Option<&str>,
    ) -> Result<Vec<LedgerTransaction>, BankingError> {
        let path = format!("{ACCOUNTS_PATH}/{account_id}/transactions");
        let query: Vec<(&str, &str)> = from_date.map(|d| ("fromDate", d)).into_iter().collect();
        let response = self.get_json(session, &path, &query).await?;

        let mut transactions = Vec::new();
        for raw in extract_list(&response, "/data/transactions")? {
            match map_api_transaction(account_id, &self.currency, raw) {
                Some(tx) => transactions.push(tx),
                None => warn!(account_id, "Skipping API transaction without postedOrder"),
            }
        }
        Ok(transactions)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn map_send_error(context: &str, err: reqwest::Error) -> BankingError {
    if is_transient_http(&err) {
        BankingError::Unreachable(format!("{context}: {err}"))
    } else {
        BankingError::Request(format!("{context} failed: {err}"))
    }
}

fn extract_list(response: &Value, pointer: &str) -> Result<Vec<Value>, BankingError> {
    response
        .pointer(pointer)
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| BankingError::InvalidResponse(format!("missing {pointer} in response")))
}

fn take_string(map: &mut Map<String, Value>, field: &str) -> Option<String> {
    match map.remove(field) {
        Some(Value::String(s)) => Some(s),
        Some(other) if !other.is_null() => Some(other.to_string()),
        _ => None,
    }
}

/// Map one API transaction onto the ledger document shape.
///
/// `amount` is a decimal major-unit value; `postingDate` stays in the
/// document since the watermark resumes from it.
pub fn map_api_transaction(
    account_id: &str,
    currency: &str,
    raw: Value,
) -> Option<LedgerTransaction> {
    let Value::Object(mut map) = raw else {
        return None;
    };

    let posted_order = match map.remove("postedOrder")? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    let cents_amount = map
        .remove("amount")
        .and_then(|v| v.as_f64())
        .map(|a| (a * 100.0).round() as i64)
        .unwrap_or_default();
    let account_id = take_string(&mut map, "accountId").unwrap_or_else(|| account_id.to_string());
    let reference = take_string(&mut map, "uuid")
        .unwrap_or_else(|| format!("{account_id}-{posted_order}"));
    let date_time = map
        .get("transactionDate")
        .or_else(|| map.get("postingDate"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some(LedgerTransaction {
        account_id: Some(account_id),
        account_number: None,
        card: None,
        reference,
        date_time,
        cents_amount,
        currency_code: currency.to_string(),
        merchant: None,
        description: take_string(&mut map, "description"),
        kind: take_string(&mut map, "type"),
        posted_order: Some(posted_order),
        extra: map,
    })
}
