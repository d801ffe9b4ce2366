// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! External collaborators reached over HTTP.
//!
//! Each provider is consumed through a trait so the workers can be driven by
//! in-process fakes in tests. The concrete clients share one convention:
//! connect and timeout failures are reported as transient so the calling
//! loop backs off instead of dropping work.

pub mod exchange_rate;
pub mod investec;
pub mod queue;

pub use exchange_rate::{
    ExchangeRateHostClient, RateFunction, RateProvider, RateProviderError, RateQuery, RateQuote,
};
pub use investec::{BankSession, BankingApi, BankingError, InvestecClient};
pub use queue::{QueueClient, QueueError, QueueMessage, ReceiveOptions, SqsClient};

/// True for failures where retrying later can succeed unchanged.
pub(crate) fn is_transient_http(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}
