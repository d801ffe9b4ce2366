// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Currency Cache Worker
//!
//! A single task owns the rate cache and answers lookups sent over an
//! in-process channel, one request at a time. Callers hold a cloneable
//! [`CurrencyHandle`].
//!
//! Cache entries are keyed by `(base currency, day)`, where the day is the
//! requested date or today's UTC date for live lookups. Each entry holds
//! the quotes fetched for that key by target currency. Entries are never
//! evicted; failed lookups are not cached.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::providers::{RateFunction, RateProvider, RateProviderError, RateQuery, RateQuote};

const REQUEST_BUFFER: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CurrencyError {
    #[error("rate lookup failed: {0}")]
    Provider(#[from] RateProviderError),

    #[error("invalid currency request: {0}")]
    InvalidRequest(String),

    #[error("currency worker is not running")]
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Deserialize, ToSchema)]
pub struct CurrencyRequest {
    pub function: RateFunction,
    /// ISO 4217 code to convert from.
    pub base: String,
    /// ISO 4217 code to convert to. Defaults to the local currency.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default = "default_amount")]
    pub amount: f64,
    /// `YYYY-MM-DD`, for historical lookups.
    #[serde(default)]
    pub date: Option<String>,
}

fn default_amount() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CurrencyReply {
    pub rate: f64,
    /// `amount * rate`.
    pub result: f64,
    pub base: String,
    /// ISO code of the target currency.
    pub int_curr_symbol: String,
    /// Display symbol of the target currency.
    pub currency_symbol: String,
    /// Raw provider payload; absent for same-currency requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub data: Option<Value>,
}

struct CurrencyCall {
    request: CurrencyRequest,
    reply: oneshot::Sender<Result<CurrencyReply, CurrencyError>>,
}

/// Cloneable request side of the worker.
#[derive(Clone)]
pub struct CurrencyHandle {
    tx: mpsc::Sender<CurrencyCall>,
    local_currency: String,
}

impl CurrencyHandle {
    pub async fn convert(&self, request: CurrencyRequest) -> Result<CurrencyReply, CurrencyError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CurrencyCall { request, reply })
            .await
            .map_err(|_| CurrencyError::Stopped)?;
        rx.await.map_err(|_| CurrencyError::Stopped)?
    }

    /// Convert minor units into the local currency.
    ///
    /// Uses the historical rate when `date` is given, the live rate otherwise.
    pub async fn to_local_cents(
        &self,
        cents: i64,
        currency: &str,
        date: Option<&str>,
    ) -> Result<i64, CurrencyError> {
        if currency.eq_ignore_ascii_case(&self.local_currency) {
            return Ok(cents);
        }
        let function = if date.is_some() {
            RateFunction::Historical
        } else {
            RateFunction::Live
        };
        let reply = self
            .convert(CurrencyRequest {
                function,
                base: currency.to_string(),
                target: Some(self.local_currency.clone()),
                amount: 1.0,
                date: date.map(str::to_string),
            })
            .await?;
        Ok((cents as f64 * reply.rate).round() as i64)
    }
}

type CacheKey = (String, NaiveDate);

pub struct CurrencyWorker {
    provider: Arc<dyn RateProvider>,
    local_currency: String,
    symbols: HashMap<String, String>,
    cache: LruCache<CacheKey, HashMap<String, RateQuote>>,
    rx: mpsc::Receiver<CurrencyCall>,
}

impl CurrencyWorker {
    /// Build the worker and its handle. `local_symbol` is the display
    /// symbol of `local_currency`.
    pub fn new(
        provider: Arc<dyn RateProvider>,
        local_currency: &str,
        local_symbol: &str,
    ) -> (Self, CurrencyHandle) {
        let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
        let local_currency = local_currency.to_ascii_uppercase();
        let symbols = HashMap::from([(local_currency.clone(), local_symbol.to_string())]);
        let worker = Self {
            provider,
            local_currency: local_currency.clone(),
            symbols,
            cache: LruCache::unbounded(),
            rx,
        };
        (
            worker,
            CurrencyHandle {
                tx,
                local_currency,
            },
        )
    }

    /// Serve requests until shutdown or until every handle is dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(local_currency = %self.local_currency, "Currency worker starting");
        loop {
            let call = tokio::select! {
                call = self.rx.recv() => call,
                _ = shutdown.cancelled() => None,
            };
            let Some(call) = call else {
                info!(cached = self.cache.len(), "Currency worker shutting down");
                return;
            };

            let result = tokio::select! {
                result = self.lookup(call.request) => result,
                _ = shutdown.cancelled() => {
                    info!("Currency worker shutting down");
                    return;
                }
            };
            // The caller may have given up waiting.
            let _ = call.reply.send(result);
        }
    }

    async fn lookup(&mut self, request: CurrencyRequest) -> Result<CurrencyReply, CurrencyError> {
        let base = normalize_code(&request.base)?;
        let target = match &request.target {
            Some(code) => normalize_code(code)?,
            None => self.local_currency.clone(),
        };
        let currency_symbol = self
            .symbols
            .get(&target)
            .cloned()
            .unwrap_or_else(|| target.clone());

        if base == target {
            return Ok(CurrencyReply {
                rate: 1.0,
                result: request.amount,
                base,
                int_curr_symbol: target,
                currency_symbol,
                data: None,
            });
        }

        let day = match (&request.function, &request.date) {
            (_, Some(date)) => NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| {
                CurrencyError::InvalidRequest(format!("date {date:?} is not YYYY-MM-DD"))
            })?,
            (RateFunction::Historical, None) => {
                return Err(CurrencyError::InvalidRequest(
                    "historical lookups need a date".into(),
                ))
            }
            (RateFunction::Live, None) => Utc::now().date_naive(),
        };
        let key = (base.clone(), day);

        let cached = self
            .cache
            .get(&key)
            .and_then(|quotes| quotes.get(&target))
            .cloned();
        let quote = match cached {
            Some(quote) => {
                debug!(%base, %target, %day, "Rate cache hit");
                quote
            }
            None => {
                debug!(%base, %target, %day, function = ?request.function, "Rate cache miss");
                let query = RateQuery {
                    function: request.function,
                    source: base.clone(),
                    target: target.clone(),
                    amount: request.amount,
                    date: request.date.clone(),
                };
                let quote = self.provider.quote(&query).await.map_err(|e| {
                    warn!(%base, %target, error = %e, "Rate lookup failed");
                    e
                })?;
                self.cache
                    .get_or_insert_mut(key, HashMap::new)
                    .insert(target.clone(), quote.clone());
                quote
            }
        };

        Ok(CurrencyReply {
            rate: quote.rate,
            result: request.amount * quote.rate,
            base,
            int_curr_symbol: target,
            currency_symbol,
            data: Some(quote.data),
        })
    }
}

fn normalize_code(code: &str) -> Result<String, CurrencyError> {
    let code = code.trim();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(CurrencyError::InvalidRequest(format!(
            "{code:?} is not an ISO 4217 code"
        )));
    }
    Ok(code.to_ascii_uppercase())
}
