// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! All settings come from the environment and are read once at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding `ledger.redb` and `profile.redb` | `/data` |
//! | `HOST` | Operational API bind address | `0.0.0.0` |
//! | `PORT` | Operational API bind port | `8080` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |
//! | `FIELD_ENCRYPTION_KEY` | Base64 of the 32-byte field key | Required |
//! | `QUEUE_URL` | Event queue URL; consumer disabled when unset | Unset |
//! | `QUEUE_ENDPOINT` | Queue service endpoint | Origin of `QUEUE_URL` |
//! | `QUEUE_MAX_MESSAGES` | Messages per receive | `10` |
//! | `QUEUE_WAIT_SECS` | Long-poll wait | `10` |
//! | `QUEUE_VISIBILITY_TIMEOUT_SECS` | Visibility timeout per receive | `30` |
//! | `QUEUE_BACKOFF_SECS` | Sleep after a failed poll cycle | `10` |
//! | `INGEST_DB_MUTATIONS` | Persist external transactions | `true` |
//! | `INGEST_REMOVE_MESSAGES` | Delete processed messages | `true` |
//! | `SYNC_INTERVAL_SECS` | Period between reconciliation sweeps | `3600` |
//! | `SYNC_IDLE_SECS` | Idle re-check sleep of the synchronizer | `30` |
//! | `BANK_API_BASE_URL` | Banking API origin | `https://openapi.investec.com` |
//! | `BANK_ACCOUNT_CURRENCY` | Currency of API-sourced records | `ZAR` |
//! | `EXCHANGE_RATE_BASE_URL` | Exchange-rate provider | `http://api.exchangerate.host/` |
//! | `EXCHANGE_RATE_ACCESS_KEY` | Exchange-rate provider key | Unset |
//! | `LOCAL_CURRENCY` | Conversion target | `ZAR` |
//! | `LOCAL_CURRENCY_SYMBOL` | Display symbol of the local currency | `R` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::ingest::ConsumerOptions;
use crate::providers::{exchange_rate, investec, ReceiveOptions};
use crate::sync::SyncOptions;

/// Environment variable name for the data directory path.
pub const DATA_DIR_ENV: &str = "DATA_DIR";

/// Default data directory.
pub const DEFAULT_DATA_DIR: &str = "/data";

pub const FIELD_ENCRYPTION_KEY_ENV: &str = "FIELD_ENCRYPTION_KEY";
pub const QUEUE_URL_ENV: &str = "QUEUE_URL";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(String),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub url: String,
    pub endpoint: Option<String>,
    pub consumer: ConsumerOptions,
}

#[derive(Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    /// Base64; decoded by the key provider.
    pub field_encryption_key: String,
    pub queue: Option<QueueConfig>,
    pub sync: SyncOptions,
    pub bank_api_base_url: String,
    pub bank_account_currency: String,
    pub exchange_rate_base_url: String,
    pub exchange_rate_access_key: Option<String>,
    pub local_currency: String,
    pub local_currency_symbol: String,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("data_dir", &self.data_dir)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("log_format", &self.log_format)
            .field("field_encryption_key", &"<redacted>")
            .field("queue", &self.queue)
            .field("sync", &self.sync)
            .field("bank_api_base_url", &self.bank_api_base_url)
            .field("bank_account_currency", &self.bank_account_currency)
            .field("exchange_rate_base_url", &self.exchange_rate_base_url)
            .field(
                "exchange_rate_access_key",
                &self.exchange_rate_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("local_currency", &self.local_currency)
            .field("local_currency_symbol", &self.local_currency_symbol)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_optional)
    }

    /// Build the configuration from an arbitrary variable source. Empty
    /// values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let log_format = match env.or_default("LOG_FORMAT", "pretty").as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            other => {
                return Err(ConfigError::Invalid {
                    name: "LOG_FORMAT".into(),
                    reason: format!("expected json or pretty, got {other:?}"),
                })
            }
        };

        let queue = match env.optional(QUEUE_URL_ENV) {
            Some(url) => {
                url::Url::parse(&url).map_err(|e| ConfigError::Invalid {
                    name: QUEUE_URL_ENV.into(),
                    reason: e.to_string(),
                })?;
                Some(QueueConfig {
                    url,
                    endpoint: env.optional("QUEUE_ENDPOINT"),
                    consumer: ConsumerOptions {
                        receive: ReceiveOptions {
                            max_messages: env.parsed("QUEUE_MAX_MESSAGES", 10)?,
                            wait: Duration::from_secs(env.parsed("QUEUE_WAIT_SECS", 10)?),
                            visibility_timeout: Duration::from_secs(
                                env.parsed("QUEUE_VISIBILITY_TIMEOUT_SECS", 30)?,
                            ),
                        },
                        backoff: Duration::from_secs(env.parsed("QUEUE_BACKOFF_SECS", 10)?),
                        db_mutations: env.flag("INGEST_DB_MUTATIONS", true)?,
                        remove_messages: env.flag("INGEST_REMOVE_MESSAGES", true)?,
                    },
                })
            }
            None => None,
        };

        Ok(Self {
            data_dir: PathBuf::from(env.or_default(DATA_DIR_ENV, DEFAULT_DATA_DIR)),
            host: env.or_default("HOST", "0.0.0.0"),
            port: env.parsed("PORT", 8080)?,
            log_format,
            field_encryption_key: env.required(FIELD_ENCRYPTION_KEY_ENV)?,
            queue,
            sync: SyncOptions {
                interval: Duration::from_secs(env.parsed("SYNC_INTERVAL_SECS", 3600)?),
                idle: Duration::from_secs(env.parsed("SYNC_IDLE_SECS", 30)?),
            },
            bank_api_base_url: env.or_default("BANK_API_BASE_URL", investec::DEFAULT_API_BASE_URL),
            bank_account_currency: env.or_default("BANK_ACCOUNT_CURRENCY", "ZAR"),
            exchange_rate_base_url: env
                .or_default("EXCHANGE_RATE_BASE_URL", exchange_rate::DEFAULT_BASE_URL),
            exchange_rate_access_key: env.optional("EXCHANGE_RATE_ACCESS_KEY"),
            local_currency: env.or_default("LOCAL_CURRENCY", "ZAR"),
            local_currency_symbol: env.or_default("LOCAL_CURRENCY_SYMBOL", "R"),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &str) -> Result<String, ConfigError> {
        self.optional(name)
            .ok_or_else(|| ConfigError::Missing(name.to_string()))
    }

    fn or_default(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                name: name.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(name).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(ConfigError::Invalid {
                name: name.to_string(),
                reason: format!("expected a boolean, got {v:?}"),
            }),
        }
    }
}

fn env_optional(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| map.get(name).cloned())
    }

    const KEY: (&str, &str) = ("FIELD_ENCRYPTION_KEY", "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=");

    #[test]
    fn defaults_apply() {
        let config = load(&[KEY]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/data"));
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.queue.is_none());
        assert_eq!(config.sync.interval, Duration::from_secs(3600));
        assert_eq!(config.sync.idle, Duration::from_secs(30));
        assert_eq!(config.bank_api_base_url, "https://openapi.investec.com");
        assert_eq!(config.local_currency, "ZAR");
        assert_eq!(config.local_currency_symbol, "R");
        assert!(config.exchange_rate_access_key.is_none());
    }

    #[test]
    fn encryption_key_is_required() {
        assert_eq!(
            load(&[]).unwrap_err(),
            ConfigError::Missing("FIELD_ENCRYPTION_KEY".into())
        );
        assert!(load(&[("FIELD_ENCRYPTION_KEY", "   ")]).is_err());
    }

    #[test]
    fn queue_settings_are_read_when_url_present() {
        let config = load(&[
            KEY,
            ("QUEUE_URL", "https://sqs.eu-west-1.amazonaws.com/123/card-events"),
            ("QUEUE_MAX_MESSAGES", "5"),
            ("QUEUE_WAIT_SECS", "20"),
            ("INGEST_REMOVE_MESSAGES", "false"),
        ])
        .unwrap();
        let queue = config.queue.unwrap();
        assert_eq!(queue.consumer.receive.max_messages, 5);
        assert_eq!(queue.consumer.receive.wait, Duration::from_secs(20));
        assert_eq!(queue.consumer.receive.visibility_timeout, Duration::from_secs(30));
        assert!(queue.consumer.db_mutations);
        assert!(!queue.consumer.remove_messages);
        assert!(queue.endpoint.is_none());
    }

    #[test]
    fn invalid_values_fail_instead_of_defaulting() {
        assert!(matches!(
            load(&[KEY, ("PORT", "eighty")]),
            Err(ConfigError::Invalid { name, .. }) if name == "PORT"
        ));
        assert!(matches!(
            load(&[KEY, ("LOG_FORMAT", "xml")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            load(&[KEY, ("QUEUE_URL", "https://q.local/1/q"), ("INGEST_DB_MUTATIONS", "maybe")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            load(&[KEY, ("QUEUE_URL", "not a url")]),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = load(&[KEY, ("EXCHANGE_RATE_ACCESS_KEY", "top-secret")]).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("top-secret"));
        assert!(!debug.contains(KEY.1));
    }
}
