// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage Module
//!
//! Two embedded redb databases live under `DATA_DIR`:
//!
//! ```text
//! /data/
//!   ledger.redb    # Ledger Store: replicated transaction documents
//!   profile.redb   # Credential/Profile Store: users, tokens, accounts, cards
//! ```
//!
//! The two stores are eventually consistent with each other; nothing here
//! coordinates writes across them.

pub mod error;
pub mod ledger;
pub mod profile;
pub mod transaction;

pub use error::{StoreError, StoreResult};
pub use ledger::{ChargeQuery, InsertOutcome, InsertSummary, LedgerDatabase, Watermark};
pub use profile::{
    AccessToken, Account, BankCredentials, Card, ProfileDatabase, RegisterOutcome, User,
};
pub use transaction::{CardRef, LedgerTransaction, Merchant};

/// File name of the ledger database inside the data directory.
pub const LEDGER_DB_FILE: &str = "ledger.redb";

/// File name of the profile database inside the data directory.
pub const PROFILE_DB_FILE: &str = "profile.redb";
