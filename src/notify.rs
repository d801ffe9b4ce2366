// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Internal notification events.
//!
//! The ingestion consumer pushes one [`TransactionNotification`] per new
//! transaction onto a bounded channel. A chat front-end is expected to own
//! the receiving end; without one, [`log_notifications`] drains it.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::storage::LedgerTransaction;

/// Default capacity of the notification channel.
pub const NOTIFICATION_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionNotification {
    pub chat_id: i64,
    pub transaction: LedgerTransaction,
}

pub fn channel() -> (
    mpsc::Sender<TransactionNotification>,
    mpsc::Receiver<TransactionNotification>,
) {
    mpsc::channel(NOTIFICATION_BUFFER)
}

/// Log every notification until shutdown or until all senders are gone.
pub async fn log_notifications(
    mut rx: mpsc::Receiver<TransactionNotification>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(n) => info!(
                    chat_id = n.chat_id,
                    reference = %n.transaction.reference,
                    cents_amount = n.transaction.cents_amount,
                    currency = %n.transaction.currency_code,
                    merchant = n.transaction.merchant_name().unwrap_or_default(),
                    "Transaction notification"
                ),
                None => return,
            },
            _ = shutdown.cancelled() => return,
        }
    }
}
