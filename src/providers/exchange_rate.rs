// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Exchange-rate lookups against exchangerate.host.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use super::is_transient_http;

pub const DEFAULT_BASE_URL: &str = "http://api.exchangerate.host/";

/// Provider endpoint to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RateFunction {
    /// Current rate.
    Live,
    /// Rate on a given date.
    Historical,
}

impl RateFunction {
    pub fn path(self) -> &'static str {
        match self {
            RateFunction::Live => "live",
            RateFunction::Historical => "historical",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateQuery {
    pub function: RateFunction,
    pub source: String,
    pub target: String,
    pub amount: f64,
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateQuote {
    pub rate: f64,
    /// Raw provider payload.
    pub data: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum RateProviderError {
    #[error("rate provider unreachable: {0}")]
    Unreachable(String),

    #[error("rate provider request failed: {0}")]
    Request(String),

    #[error("rate provider rejected request: {0}")]
    Rejected(String),

    #[error("rate provider response was invalid: {0}")]
    InvalidResponse(String),
}

impl RateProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RateProviderError::Unreachable(_))
    }
}

#[async_trait]
pub trait RateProvider: Send + Sync {
    async fn quote(&self, query: &RateQuery) -> Result<RateQuote, RateProviderError>;
}

#[derive(Debug, Clone)]
pub struct ExchangeRateHostClient {
    base_url: String,
    access_key: Option<String>,
    http: Client,
}

impl ExchangeRateHostClient {
    pub fn new(base_url: &str, access_key: Option<String>) -> Result<Self, RateProviderError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| RateProviderError::Request(format!("failed to build HTTP client: {e}")))?;

        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            base_url,
            access_key,
            http,
        })
    }
}

#[async_trait]
impl RateProvider for ExchangeRateHostClient {
    async fn quote(&self, query: &RateQuery) -> Result<RateQuote, RateProviderError> {
        let url = format!("{}{}", self.base_url, query.function.path());
        let amount = query.amount.to_string();

        let mut params: Vec<(&str, &str)> = vec![
            ("source", query.source.as_str()),
            ("currencies", query.target.as_str()),
            ("amount", amount.as_str()),
        ];
        if let Some(date) = &query.date {
            params.push(("date", date.as_str()));
        }
        if let Some(key) = &self.access_key {
            params.push(("access_key", key.as_str()));
        }

        let response = self
            .http
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| {
                if is_transient_http(&e) {
                    RateProviderError::Unreachable(format!("GET {url}: {e}"))
                } else {
                    RateProviderError::Request(format!("GET {url} failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RateProviderError::Request(format!(
                "GET {url} returned {status}: {body}"
            )));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| RateProviderError::InvalidResponse(format!("GET {url} invalid JSON: {e}")))?;

        let rate = extract_rate(&data, &query.source, &query.target)?;
        Ok(RateQuote { rate, data })
    }
}

/// Read `quotes["{source}{target}"]` from a successful payload.
pub fn extract_rate(data: &Value, source: &str, target: &str) -> Result<f64, RateProviderError> {
    let success = data.get("success").and_then(Value::as_bool).unwrap_or(false);
    if !success {
        let info = data
            .pointer("/error/info")
            .and_then(Value::as_str)
            .unwrap_or("request unsuccessful");
        return Err(RateProviderError::Rejected(info.to_string()));
    }

    let pair = format!("{source}{target}");
    data.get("quotes")
        .and_then(|q| q.get(&pair))
        .and_then(Value::as_f64)
        .ok_or_else(|| RateProviderError::InvalidResponse(format!("missing quote {pair}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_quote_for_pair() {
        let data = json!({"success": true, "source": "USD", "quotes": {"USDZAR": 18.25}});
        assert_eq!(extract_rate(&data, "USD", "ZAR").unwrap(), 18.25);
    }

    #[test]
    fn unsuccessful_payload_surfaces_provider_message() {
        let data = json!({"success": false, "error": {"code": 101, "info": "invalid access key"}});
        match extract_rate(&data, "USD", "ZAR") {
            Err(RateProviderError::Rejected(info)) => assert_eq!(info, "invalid access key"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_pair_is_invalid() {
        let data = json!({"success": true, "quotes": {"USDEUR": 0.9}});
        assert!(matches!(
            extract_rate(&data, "USD", "ZAR"),
            Err(RateProviderError::InvalidResponse(_))
        ));
    }

    #[test]
    fn function_paths() {
        assert_eq!(RateFunction::Live.path(), "live");
        assert_eq!(RateFunction::Historical.path(), "historical");
        assert_eq!(serde_json::to_value(RateFunction::Historical).unwrap(), json!("historical"));
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let client = ExchangeRateHostClient::new("http://rates.local", None).unwrap();
        assert_eq!(client.base_url, "http://rates.local/");
    }
}
