// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Reconciliation Synchronizer
//!
//! Background task that backfills the ledger from the banking API so
//! transactions missed by the queue still land exactly once.
//!
//! ## Strategy
//!
//! A sweep runs when the sync interval has elapsed since the previous one
//! (and once right after startup), or when a caller sends a
//! [`SyncTrigger`] through a [`SyncHandle`]. For every registered user and
//! each of their accounts the sweep:
//! 1. Reads the account's watermark (highest stored `postedOrder`).
//! 2. Fetches API transactions from the watermark's posting date on.
//! 3. Keeps only records strictly past the watermark.
//! 4. Inserts them through the ledger's insert-if-absent path.
//!
//! A failing account is logged and skipped; siblings still sync. Tokens
//! issued during the sweep are written back to the profile store.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken`, like the event consumer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::providers::{BankSession, BankingApi, BankingError};
use crate::storage::{InsertSummary, LedgerDatabase, ProfileDatabase, StoreError};

/// Default period between timer-driven sweeps.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(3600);

/// Default sleep between due-checks while idle.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(30);

const TRIGGER_BUFFER: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("banking API error: {0}")]
    Banking(#[from] BankingError),

    #[error("unknown user {0}")]
    UnknownUser(i64),

    #[error("synchronizer is not running")]
    Stopped,
}

/// Work a caller can ask the synchronizer to do out of schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Run a full sweep now.
    SyncAll,
    /// Re-fetch one user's accounts and cards.
    RefreshProfile { chat_id: i64 },
}

/// Counters for one sweep or refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct SyncReport {
    pub users: usize,
    pub accounts: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed_accounts: usize,
    pub failed_users: usize,
    pub accounts_refreshed: usize,
    pub cards_refreshed: usize,
}

impl SyncReport {
    fn absorb(&mut self, summary: InsertSummary) {
        self.inserted += summary.inserted;
        self.duplicates += summary.duplicates;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub interval: Duration,
    pub idle: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
            idle: DEFAULT_IDLE_INTERVAL,
        }
    }
}

#[derive(Debug)]
pub struct SyncCall {
    trigger: SyncTrigger,
    reply: oneshot::Sender<Result<SyncReport, SyncError>>,
}

/// Cloneable sender side used by the HTTP surface.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncCall>,
}

impl SyncHandle {
    /// Enqueue a trigger and wait until the synchronizer has processed it.
    pub async fn trigger(&self, trigger: SyncTrigger) -> Result<SyncReport, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SyncCall { trigger, reply })
            .await
            .map_err(|_| SyncError::Stopped)?;
        rx.await.map_err(|_| SyncError::Stopped)?
    }
}

pub fn trigger_channel() -> (SyncHandle, mpsc::Receiver<SyncCall>) {
    let (tx, rx) = mpsc::channel(TRIGGER_BUFFER);
    (SyncHandle { tx }, rx)
}

pub struct LedgerSync {
    ledger: Arc<LedgerDatabase>,
    profile: Arc<ProfileDatabase>,
    bank: Arc<dyn BankingApi>,
    options: SyncOptions,
    triggers: mpsc::Receiver<SyncCall>,
    last_sync: Option<Instant>,
}

impl LedgerSync {
    pub fn new(
        ledger: Arc<LedgerDatabase>,
        profile: Arc<ProfileDatabase>,
        bank: Arc<dyn BankingApi>,
        options: SyncOptions,
        triggers: mpsc::Receiver<SyncCall>,
    ) -> Self {
        Self {
            ledger,
            profile,
            bank,
            options,
            triggers,
            last_sync: None,
        }
    }

    /// Run the synchronizer loop until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(sync.run(shutdown.clone()));
    /// ```
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.options.interval.as_secs(),
            idle_secs = self.options.idle.as_secs(),
            "Ledger synchronizer starting"
        );
        let mut triggers_open = true;

        loop {
            if shutdown.is_cancelled() {
                info!("Ledger synchronizer shutting down");
                return;
            }

            if self.is_due() {
                tokio::select! {
                    _ = self.timed_sweep() => {},
                    _ = shutdown.cancelled() => {
                        info!("Ledger synchronizer shutting down");
                        return;
                    }
                }
                continue;
            }

            let call = tokio::select! {
                call = self.triggers.recv(), if triggers_open => call,
                _ = tokio::time::sleep(self.options.idle) => continue,
                _ = shutdown.cancelled() => {
                    info!("Ledger synchronizer shutting down");
                    return;
                }
            };

            let Some(call) = call else {
                debug!("All sync handles dropped, timer-only mode");
                triggers_open = false;
                continue;
            };

            // Dropping the in-flight call answers the caller with `Stopped`.
            tokio::select! {
                _ = self.handle(call) => {},
                _ = shutdown.cancelled() => {
                    info!("Ledger synchronizer shutting down");
                    return;
                }
            }
        }
    }

    fn is_due(&self) -> bool {
        self.last_sync
            .map_or(true, |at| at.elapsed() >= self.options.interval)
    }

    async fn timed_sweep(&mut self) {
        match self.sync_all().await {
            Ok(report) => info!(
                users = report.users,
                accounts = report.accounts,
                inserted = report.inserted,
                duplicates = report.duplicates,
                failed_accounts = report.failed_accounts,
                failed_users = report.failed_users,
                "Ledger synchronizer: sweep finished"
            ),
            Err(e) => warn!(error = %e, "Ledger synchronizer: sweep failed"),
        }
        self.last_sync = Some(Instant::now());
    }

    async fn handle(&mut self, call: SyncCall) {
        debug!(trigger = ?call.trigger, "Sync trigger received");
        let result = match call.trigger {
            SyncTrigger::SyncAll => {
                let result = self.sync_all().await;
                self.last_sync = Some(Instant::now());
                result
            }
            SyncTrigger::RefreshProfile { chat_id } => self.refresh_profile(chat_id).await,
        };
        if let Err(e) = &result {
            warn!(trigger = ?call.trigger, error = %e, "Sync trigger failed");
        }
        // The caller may have given up waiting.
        let _ = call.reply.send(result);
    }

    /// Sweep every user and account once.
    pub async fn sync_all(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();

        for chat_id in self.profile.list_chat_ids()? {
            match self.sync_user(chat_id, &mut report).await {
                Ok(()) => report.users += 1,
                Err(e) => {
                    if matches!(&e, SyncError::Store(s) if s.is_integrity_violation()) {
                        error!(chat_id, error = %e, "Integrity failure reading user profile");
                    } else {
                        warn!(chat_id, error = %e, "Failed to sync user");
                    }
                    report.failed_users += 1;
                }
            }
        }

        Ok(report)
    }

    async fn sync_user(&self, chat_id: i64, report: &mut SyncReport) -> Result<(), SyncError> {
        let user = self
            .profile
            .get_user(chat_id)?
            .ok_or(SyncError::UnknownUser(chat_id))?;
        let token = self.profile.get_access_token(chat_id)?;
        let mut session = BankSession::new(&user, token);

        for account in self.profile.list_accounts(chat_id)? {
            report.accounts += 1;
            let result = self.sync_account(&mut session, &account.account_id).await;
            self.persist_rotated_token(&mut session)?;

            match result {
                Ok(summary) => {
                    if summary.inserted > 0 {
                        info!(
                            chat_id,
                            account_id = %account.account_id,
                            inserted = summary.inserted,
                            "Backfilled transactions"
                        );
                    }
                    report.absorb(summary);
                }
                Err(e) => {
                    warn!(
                        chat_id,
                        account_id = %account.account_id,
                        error = %e,
                        "Failed to sync account"
                    );
                    report.failed_accounts += 1;
                }
            }
        }

        Ok(())
    }

    /// Fetch and insert everything past the account's watermark.
    pub async fn sync_account(
        &self,
        session: &mut BankSession,
        account_id: &str,
    ) -> Result<InsertSummary, SyncError> {
        let watermark = self.ledger.watermark(account_id)?;
        let last_posted = watermark.as_ref().map(|w| w.posted_order);
        let from_date = watermark.as_ref().and_then(|w| w.date.as_deref());

        debug!(account_id, ?last_posted, from_date, "Fetching account transactions");
        let fetched = self
            .bank
            .account_transactions(session, account_id, from_date)
            .await?;

        let fresh: Vec<_> = fetched
            .into_iter()
            .filter(|tx| match (tx.posted_order, last_posted) {
                (Some(posted), Some(last)) => posted > last,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .collect();

        if fresh.is_empty() {
            return Ok(InsertSummary::default());
        }
        Ok(self.ledger.insert_many(&fresh)?)
    }

    /// Re-fetch a user's accounts and cards and upsert them.
    pub async fn refresh_profile(&self, chat_id: i64) -> Result<SyncReport, SyncError> {
        let user = self
            .profile
            .get_user(chat_id)?
            .ok_or(SyncError::UnknownUser(chat_id))?;
        let token = self.profile.get_access_token(chat_id)?;
        let mut session = BankSession::new(&user, token);

        let result = self.fetch_profile(&mut session).await;
        self.persist_rotated_token(&mut session)?;
        let (accounts, cards) = result?;

        let report = SyncReport {
            users: 1,
            accounts_refreshed: self.profile.upsert_accounts(chat_id, &accounts)?,
            cards_refreshed: self.profile.upsert_cards(chat_id, &cards)?,
            ..Default::default()
        };
        info!(
            chat_id,
            accounts = report.accounts_refreshed,
            cards = report.cards_refreshed,
            "Profile refreshed"
        );
        Ok(report)
    }

    async fn fetch_profile(
        &self,
        session: &mut BankSession,
    ) -> Result<(Vec<serde_json::Value>, Vec<serde_json::Value>), SyncError> {
        let accounts = self.bank.accounts(session).await?;
        let cards = self.bank.cards(session).await?;
        Ok((accounts, cards))
    }

    fn persist_rotated_token(&self, session: &mut BankSession) -> Result<(), SyncError> {
        if let Some(token) = session.take_rotated() {
            debug!(chat_id = session.chat_id, "Persisting rotated access token");
            self.profile.update_access_token(session.chat_id, &token)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
