// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Card Ledger - Transaction Sync & Notification Service
//!
//! Keeps a local ledger of bank-card transactions in step with two sources:
//! change events delivered over a queue, and periodic reconciliation
//! against the banking API. Account and card metadata is stored with every
//! sensitive field encrypted.
//!
//! ## Modules
//!
//! - `ingest` - Queue consumer (normalize, dedup-insert, notify, ack)
//! - `sync` - Watermark-based reconciliation synchronizer
//! - `currency` - Cached exchange-rate worker
//! - `storage` - Ledger and profile stores (redb)
//! - `crypto` - Encrypted field envelopes and digests
//! - `providers` - Queue, banking and exchange-rate clients
//! - `api` - Operational HTTP API (Axum)

pub mod api;
pub mod config;
pub mod crypto;
pub mod currency;
pub mod error;
pub mod ingest;
pub mod models;
pub mod notify;
pub mod providers;
pub mod state;
pub mod storage;
pub mod sync;
