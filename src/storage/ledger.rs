// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ledger Store: replicated transaction documents in redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `transactions`: dedup key → serialized LedgerTransaction
//! - `account_posted_index`: composite key (account_id|posted_order_be) → dedup key
//! - `card_date_index`: composite key (card_id_be|dateTime|dedup key) → dedup key
//!
//! Uniqueness is enforced by checking and inserting inside a single write
//! transaction; redb allows one writer at a time, so concurrent writers
//! cannot both observe a key as absent.

use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::{debug, warn};

use super::error::{StoreError, StoreResult};
use super::transaction::LedgerTransaction;

// =============================================================================
// Table Definitions
// =============================================================================

/// Primary table: dedup key → LedgerTransaction (JSON bytes).
const TRANSACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("transactions");

/// Index for watermark lookups. Key format: `account_id|posted_order_be`.
const ACCOUNT_POSTED_INDEX: TableDefinition<&[u8], &str> =
    TableDefinition::new("account_posted_index");

/// Index for card charge queries. Key format: `card_id_be|dateTime|dedup_key`.
const CARD_DATE_INDEX: TableDefinition<&[u8], &str> = TableDefinition::new("card_date_index");

// =============================================================================
// Result Types
// =============================================================================

/// Outcome of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertSummary {
    pub inserted: usize,
    pub duplicates: usize,
    /// Records without a usable uniqueness key; skipped.
    pub rejected: usize,
}

/// Highest persisted `postedOrder` for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub posted_order: u64,
    /// Posting date of that record, used as the provider's `fromDate`.
    pub date: Option<String>,
}

/// Filter for card charge listings.
#[derive(Debug, Clone)]
pub struct ChargeQuery {
    pub account_number: String,
    pub card_id: u64,
    /// Inclusive lower bound, `YYYY-MM-DD`.
    pub since: String,
    pub merchant: Option<String>,
    pub include_simulation: bool,
}

// =============================================================================
// Index Key Helpers
// =============================================================================

fn posted_index_key(account_id: &str, posted_order: u64) -> Vec<u8> {
    let mut key = account_prefix(account_id);
    key.extend_from_slice(&posted_order.to_be_bytes());
    key
}

/// Length-prefixed so no account id can be a byte prefix of another's keys.
fn account_prefix(account_id: &str) -> Vec<u8> {
    let len = u32::try_from(account_id.len()).unwrap_or(u32::MAX);
    let mut prefix = Vec::with_capacity(4 + account_id.len() + 8);
    prefix.extend_from_slice(&len.to_be_bytes());
    prefix.extend_from_slice(account_id.as_bytes());
    prefix
}

/// Upper bound past any `posted_index_key` of this account.
fn account_prefix_end(account_id: &str) -> Vec<u8> {
    let mut end = account_prefix(account_id);
    end.extend_from_slice(&[0xFF; 9]);
    end
}

fn card_index_key(card_id: u64, date_time: &str, dedup_key: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + date_time.len() + 1 + dedup_key.len());
    key.extend_from_slice(&card_id.to_be_bytes());
    key.extend_from_slice(date_time.as_bytes());
    key.push(b'|');
    key.extend_from_slice(dedup_key.as_bytes());
    key
}

fn card_range(card_id: u64, since: &str) -> (Vec<u8>, Vec<u8>) {
    let mut start = Vec::with_capacity(8 + since.len());
    start.extend_from_slice(&card_id.to_be_bytes());
    start.extend_from_slice(since.as_bytes());

    let mut end = card_id.to_be_bytes().to_vec();
    end.push(0xFF);
    (start, end)
}

fn posted_order_from_key(key: &[u8]) -> Option<u64> {
    let tail = key.len().checked_sub(8).map(|at| &key[at..])?;
    tail.try_into().ok().map(u64::from_be_bytes)
}

// =============================================================================
// LedgerDatabase
// =============================================================================

/// Embedded ACID ledger of card/account transactions.
pub struct LedgerDatabase {
    db: Database,
}

impl LedgerDatabase {
    /// Open (or create) the ledger at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TRANSACTIONS)?;
            let _ = write_txn.open_table(ACCOUNT_POSTED_INDEX)?;
            let _ = write_txn.open_table(CARD_DATE_INDEX)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Insert one document unless its uniqueness key is already present.
    pub fn insert_if_absent(&self, tx: &LedgerTransaction) -> StoreResult<InsertOutcome> {
        if tx.dedup_key().is_none() {
            return Err(StoreError::InvalidRecord(format!(
                "transaction {:?} has no account/card or posted order",
                tx.reference
            )));
        }
        let summary = self.insert_many(std::slice::from_ref(tx))?;
        Ok(if summary.inserted == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyExists
        })
    }

    /// Bulk insert in one write transaction, skipping keys already stored
    /// (including repeats within `txs`).
    pub fn insert_many(&self, txs: &[LedgerTransaction]) -> StoreResult<InsertSummary> {
        let mut summary = InsertSummary::default();
        if txs.is_empty() {
            return Ok(summary);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut tx_table = write_txn.open_table(TRANSACTIONS)?;
            let mut posted_idx = write_txn.open_table(ACCOUNT_POSTED_INDEX)?;
            let mut card_idx = write_txn.open_table(CARD_DATE_INDEX)?;

            for tx in txs {
                let Some(key) = tx.dedup_key() else {
                    warn!(reference = %tx.reference, "Skipping ledger record without uniqueness key");
                    summary.rejected += 1;
                    continue;
                };

                let exists = tx_table.get(key.as_str())?.is_some();
                if exists {
                    debug!(key = %key, "Ledger record already present");
                    summary.duplicates += 1;
                    continue;
                }

                let json = serde_json::to_vec(tx)?;
                tx_table.insert(key.as_str(), json.as_slice())?;

                if let (Some(account_id), Some(posted)) = (&tx.account_id, tx.posted_order) {
                    let idx_key = posted_index_key(account_id, posted);
                    posted_idx.insert(idx_key.as_slice(), key.as_str())?;
                }
                if let Some(card_id) = tx.card_id() {
                    let idx_key = card_index_key(card_id, &tx.date_time, &key);
                    card_idx.insert(idx_key.as_slice(), key.as_str())?;
                }
                summary.inserted += 1;
            }
        }
        write_txn.commit()?;
        Ok(summary)
    }

    /// Look up one document by its uniqueness key.
    pub fn get(&self, key: &str) -> StoreResult<Option<LedgerTransaction>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSACTIONS)?;
        match table.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn count(&self) -> StoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSACTIONS)?;
        Ok(table.len()?)
    }

    /// Highest `postedOrder` stored for the account, if any.
    pub fn watermark(&self, account_id: &str) -> StoreResult<Option<Watermark>> {
        let read_txn = self.db.begin_read()?;
        let idx_table = read_txn.open_table(ACCOUNT_POSTED_INDEX)?;
        let tx_table = read_txn.open_table(TRANSACTIONS)?;

        let prefix = account_prefix(account_id);
        let prefix_end = account_prefix_end(account_id);

        let Some(entry) = idx_table
            .range(prefix.as_slice()..prefix_end.as_slice())?
            .next_back()
        else {
            return Ok(None);
        };
        let (idx_key, doc_key) = entry?;

        let posted_order = posted_order_from_key(idx_key.value()).ok_or_else(|| {
            StoreError::InvalidRecord(format!("corrupt posted index for account {account_id}"))
        })?;

        let date = match tx_table.get(doc_key.value())? {
            Some(value) => {
                let tx: LedgerTransaction = serde_json::from_slice(value.value())?;
                tx.extra
                    .get("postingDate")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or_else(|| tx.calendar_date().map(str::to_string))
            }
            None => None,
        };

        Ok(Some(Watermark { posted_order, date }))
    }

    /// Card charges since a date, oldest first.
    ///
    /// Credits are never charges. Simulation references are skipped unless
    /// `include_simulation` is set.
    pub fn card_charges(&self, query: &ChargeQuery) -> StoreResult<Vec<LedgerTransaction>> {
        let read_txn = self.db.begin_read()?;
        let idx_table = read_txn.open_table(CARD_DATE_INDEX)?;
        let tx_table = read_txn.open_table(TRANSACTIONS)?;

        let (start, end) = card_range(query.card_id, &query.since);
        let mut charges = Vec::new();

        for entry in idx_table.range(start.as_slice()..end.as_slice())? {
            let (_, doc_key) = entry?;
            let Some(value) = tx_table.get(doc_key.value())? else {
                continue;
            };
            let tx: LedgerTransaction = serde_json::from_slice(value.value())?;

            if tx.account_number.as_deref() != Some(query.account_number.as_str()) {
                continue;
            }
            if tx.is_credit() || (tx.is_simulation() && !query.include_simulation) {
                continue;
            }
            if let Some(merchant) = &query.merchant {
                if tx.merchant_name() != Some(merchant.as_str()) {
                    continue;
                }
            }
            charges.push(tx);
        }

        Ok(charges)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::transaction::{CardRef, Merchant};
    use serde_json::{json, Map};

    fn temp_db() -> (LedgerDatabase, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = LedgerDatabase::open(&dir.path().join("ledger.redb")).unwrap();
        (db, dir)
    }

    fn api_tx(account_id: &str, posted: u64, date: &str) -> LedgerTransaction {
        let mut extra = Map::new();
        extra.insert("postingDate".into(), json!(date));
        LedgerTransaction {
            account_id: Some(account_id.into()),
            posted_order: Some(posted),
            reference: format!("ref-{posted}"),
            date_time: format!("{date}T08:00:00"),
            cents_amount: -1000,
            currency_code: "ZAR".into(),
            kind: Some("DEBIT".into()),
            extra,
            ..Default::default()
        }
    }

    fn card_tx(reference: &str, date_time: &str, merchant: &str, kind: &str) -> LedgerTransaction {
        LedgerTransaction {
            account_number: Some("A1".into()),
            card: Some(CardRef { id: 7 }),
            reference: reference.into(),
            date_time: date_time.into(),
            cents_amount: 500,
            currency_code: "USD".into(),
            merchant: Some(Merchant {
                name: merchant.into(),
                extra: Map::new(),
            }),
            kind: Some(kind.into()),
            ..Default::default()
        }
    }

    #[test]
    fn insert_is_idempotent() {
        let (db, _dir) = temp_db();
        let tx = api_tx("acc-1", 5, "2024-01-01");

        assert_eq!(db.insert_if_absent(&tx).unwrap(), InsertOutcome::Inserted);
        assert_eq!(db.insert_if_absent(&tx).unwrap(), InsertOutcome::AlreadyExists);
        assert_eq!(db.count().unwrap(), 1);

        let key = tx.dedup_key().unwrap();
        assert_eq!(db.get(&key).unwrap().unwrap(), tx);
    }

    #[test]
    fn insert_many_counts_duplicates_within_batch() {
        let (db, _dir) = temp_db();
        db.insert_if_absent(&api_tx("acc-1", 1, "2024-01-01")).unwrap();

        let batch = vec![
            api_tx("acc-1", 1, "2024-01-01"),
            api_tx("acc-1", 2, "2024-01-02"),
            api_tx("acc-1", 2, "2024-01-02"),
            LedgerTransaction::default(),
        ];
        let summary = db.insert_many(&batch).unwrap();
        assert_eq!(
            summary,
            InsertSummary {
                inserted: 1,
                duplicates: 2,
                rejected: 1
            }
        );
        assert_eq!(db.count().unwrap(), 2);
    }

    #[test]
    fn insert_without_key_is_rejected() {
        let (db, _dir) = temp_db();
        let err = db.insert_if_absent(&LedgerTransaction::default()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
    }

    #[test]
    fn watermark_tracks_highest_posted_order() {
        let (db, _dir) = temp_db();
        assert!(db.watermark("acc-1").unwrap().is_none());

        db.insert_many(&[
            api_tx("acc-1", 300, "2024-03-01"),
            api_tx("acc-1", 2, "2024-01-01"),
            api_tx("acc-1", 256, "2024-02-01"),
        ])
        .unwrap();

        let wm = db.watermark("acc-1").unwrap().unwrap();
        assert_eq!(wm.posted_order, 300);
        assert_eq!(wm.date.as_deref(), Some("2024-03-01"));
    }

    #[test]
    fn watermark_does_not_leak_across_accounts() {
        let (db, _dir) = temp_db();
        db.insert_if_absent(&api_tx("acc-1", 10, "2024-01-01")).unwrap();
        db.insert_if_absent(&api_tx("acc-10", 99, "2024-01-09")).unwrap();
        db.insert_if_absent(&api_tx("acc-0", 77, "2024-01-07")).unwrap();

        assert_eq!(db.watermark("acc-1").unwrap().unwrap().posted_order, 10);
        assert_eq!(db.watermark("acc-10").unwrap().unwrap().posted_order, 99);
        assert!(db.watermark("acc").unwrap().is_none());
    }

    #[test]
    fn watermark_ignores_ids_extending_the_account_id() {
        let (db, _dir) = temp_db();
        db.insert_if_absent(&api_tx("a", 3, "2024-01-01")).unwrap();
        db.insert_if_absent(&api_tx("a|x", 500, "2024-01-09")).unwrap();
        db.insert_if_absent(&api_tx("a|\u{ff}", 900, "2024-01-10")).unwrap();

        let mark = db.watermark("a").unwrap().unwrap();
        assert_eq!(mark.posted_order, 3);
        assert_eq!(mark.date.as_deref(), Some("2024-01-01"));
        assert_eq!(db.watermark("a|x").unwrap().unwrap().posted_order, 500);
        assert!(db.watermark("b").unwrap().is_none());
    }

    #[test]
    fn card_charges_filter_credit_simulation_and_date() {
        let (db, _dir) = temp_db();
        db.insert_many(&[
            card_tx("r1", "2024-01-01T09:00:00", "Acme", "DEBIT"),
            card_tx("r2", "2024-01-05T09:00:00", "Acme", "DEBIT"),
            card_tx("r3", "2024-01-06T09:00:00", "Other", "DEBIT"),
            card_tx("r4", "2024-01-07T09:00:00", "Acme", "CREDIT"),
            card_tx("simulation_1704448800", "2024-01-05T10:00:00", "Acme", "DEBIT"),
        ])
        .unwrap();

        let mut query = ChargeQuery {
            account_number: "A1".into(),
            card_id: 7,
            since: "2024-01-05".into(),
            merchant: None,
            include_simulation: false,
        };
        let refs: Vec<String> = db
            .card_charges(&query)
            .unwrap()
            .into_iter()
            .map(|t| t.reference)
            .collect();
        assert_eq!(refs, vec!["r2", "r3"]);

        query.include_simulation = true;
        query.merchant = Some("Acme".into());
        let refs: Vec<String> = db
            .card_charges(&query)
            .unwrap()
            .into_iter()
            .map(|t| t.reference)
            .collect();
        assert_eq!(refs, vec!["r2", "simulation_1704448800"]);
    }

    #[test]
    fn card_charges_ignore_other_accounts() {
        let (db, _dir) = temp_db();
        let mut foreign = card_tx("r1", "2024-01-05T09:00:00", "Acme", "DEBIT");
        foreign.account_number = Some("B2".into());
        db.insert_if_absent(&foreign).unwrap();

        let query = ChargeQuery {
            account_number: "A1".into(),
            card_id: 7,
            since: "2024-01-01".into(),
            merchant: None,
            include_simulation: false,
        };
        assert!(db.card_charges(&query).unwrap().is_empty());
    }

    #[test]
    fn posted_keys_sort_numerically() {
        let a = posted_index_key("acc", 255);
        let b = posted_index_key("acc", 256);
        assert!(a < b);
        assert!(b < account_prefix_end("acc"));
        assert_eq!(posted_order_from_key(&b), Some(256));
    }
}
