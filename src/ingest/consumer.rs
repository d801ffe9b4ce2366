// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Event Ingestion Consumer
//!
//! Background task that long-polls the external queue and turns each
//! message into at most one ledger record and one notification.
//!
//! ## Per-message pipeline
//!
//! ```text
//! parse -> normalize -> resolve owner -> [insert-if-absent] -> notify -> ack
//! ```
//!
//! - Malformed messages are logged and acknowledged; siblings continue.
//! - Events for cards without an owner are acknowledged and not stored.
//! - Duplicates (insert reports `AlreadyExists`) are acknowledged silently.
//! - A notification slot is reserved before the insert, so a stored record
//!   is always followed by its notification.
//! - Queue and storage failures abort the cycle, leaving unacknowledged
//!   messages to reappear after their visibility timeout, and the loop
//!   backs off before the next receive.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken`; an in-flight batch is
//! abandoned, which is safe because redelivery is deduplicated.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message::{normalize, Origin, QueueEvent};
use crate::notify::TransactionNotification;
use crate::providers::{QueueClient, QueueError, QueueMessage, ReceiveOptions};
use crate::storage::{InsertOutcome, LedgerDatabase, ProfileDatabase, StoreError};

/// Default back-off after a failed poll cycle.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("notification channel closed")]
    NotificationChannelClosed,
}

impl IngestError {
    pub fn is_transient(&self) -> bool {
        match self {
            IngestError::Queue(e) => e.is_transient(),
            IngestError::Store(e) => !e.is_integrity_violation(),
            IngestError::NotificationChannelClosed => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub receive: ReceiveOptions,
    pub backoff: Duration,
    /// Persist external transactions before notifying.
    pub db_mutations: bool,
    /// Delete processed messages from the queue.
    pub remove_messages: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            receive: ReceiveOptions::default(),
            backoff: DEFAULT_BACKOFF,
            db_mutations: true,
            remove_messages: true,
        }
    }
}

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Notified { chat_id: i64 },
    Duplicate,
    NoOwner,
    Discarded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub received: usize,
    pub notified: usize,
    pub duplicates: usize,
    pub unowned: usize,
    pub discarded: usize,
    /// Left on the queue after an integrity failure.
    pub held: usize,
}

impl PollSummary {
    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Notified { .. } => self.notified += 1,
            MessageOutcome::Duplicate => self.duplicates += 1,
            MessageOutcome::NoOwner => self.unowned += 1,
            MessageOutcome::Discarded => self.discarded += 1,
        }
    }
}

pub struct EventConsumer {
    queue: Arc<dyn QueueClient>,
    ledger: Arc<LedgerDatabase>,
    profile: Arc<ProfileDatabase>,
    notifications: mpsc::Sender<TransactionNotification>,
    options: ConsumerOptions,
}

impl EventConsumer {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        ledger: Arc<LedgerDatabase>,
        profile: Arc<ProfileDatabase>,
        notifications: mpsc::Sender<TransactionNotification>,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            queue,
            ledger,
            profile,
            notifications,
            options,
        }
    }

    /// Run the consumer loop until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(consumer.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            max_messages = self.options.receive.max_messages,
            wait_secs = self.options.receive.wait.as_secs(),
            db_mutations = self.options.db_mutations,
            remove_messages = self.options.remove_messages,
            "Event consumer starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Event consumer shutting down");
                return;
            }

            let result = tokio::select! {
                result = self.poll_step() => result,
                _ = shutdown.cancelled() => {
                    info!("Event consumer shutting down");
                    return;
                }
            };

            match result {
                Ok(summary) if summary.received > 0 => {
                    info!(
                        received = summary.received,
                        notified = summary.notified,
                        duplicates = summary.duplicates,
                        unowned = summary.unowned,
                        discarded = summary.discarded,
                        held = summary.held,
                        "Event consumer: batch processed"
                    );
                }
                Ok(_) => {}
                Err(IngestError::NotificationChannelClosed) => {
                    warn!("Notification receiver gone, event consumer stopping");
                    return;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        transient = e.is_transient(),
                        backoff_secs = self.options.backoff.as_secs(),
                        "Event consumer: poll cycle failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.backoff) => {},
                        _ = shutdown.cancelled() => {
                            info!("Event consumer shutting down");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Receive one batch and process its messages in order.
    pub async fn poll_step(&self) -> Result<PollSummary, IngestError> {
        let messages = self.queue.receive(&self.options.receive).await?;
        let mut summary = PollSummary {
            received: messages.len(),
            ..Default::default()
        };

        for message in &messages {
            match self.process_message(message).await {
                Ok(outcome) => {
                    summary.record(outcome);
                    self.acknowledge(message).await?;
                }
                Err(IngestError::Store(e)) if e.is_integrity_violation() => {
                    error!(
                        message_id = %message.message_id,
                        error = %e,
                        "Integrity failure while routing event, leaving message on queue"
                    );
                    summary.held += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(summary)
    }

    /// Normalize, route, and persist a single message.
    pub async fn process_message(
        &self,
        message: &QueueMessage,
    ) -> Result<MessageOutcome, IngestError> {
        let event = match QueueEvent::parse(&message.body) {
            Ok(event) => event,
            Err(reason) => {
                warn!(message_id = %message.message_id, reason = %reason, "Discarding queue message");
                return Ok(MessageOutcome::Discarded);
            }
        };

        if let QueueEvent::Change(change) = &event {
            info!(
                event_id = %change.id,
                detail_type = %change.detail_type,
                source = %change.source,
                operation = %change.detail.operation_type,
                "Ledger change event"
            );
        }

        let normalized = match normalize(event) {
            Ok(n) => n,
            Err(reason) => {
                warn!(message_id = %message.message_id, reason = %reason, "Discarding queue message");
                return Ok(MessageOutcome::Discarded);
            }
        };
        let tx = &normalized.transaction;
        info!(
            reference = %tx.reference,
            card_id = normalized.card_id,
            date_time = %tx.date_time,
            "Transaction event"
        );

        let Some(user) = self.profile.user_for_card(normalized.card_id)? else {
            warn!(
                reference = %tx.reference,
                card_id = normalized.card_id,
                "Ignoring event for card without an associated user"
            );
            return Ok(MessageOutcome::NoOwner);
        };
        debug!(chat_id = user.chat_id, card_id = normalized.card_id, "Card owner resolved");

        // Once the record is stored, the send below cannot fail.
        let permit = self
            .notifications
            .reserve()
            .await
            .map_err(|_| IngestError::NotificationChannelClosed)?;

        if normalized.origin == Origin::External {
            if self.options.db_mutations {
                match self.ledger.insert_if_absent(tx)? {
                    InsertOutcome::Inserted => {
                        debug!(reference = %tx.reference, "Transaction persisted");
                    }
                    InsertOutcome::AlreadyExists => {
                        warn!(
                            reference = %tx.reference,
                            date_time = %tx.date_time,
                            "Discarding duplicate transaction event"
                        );
                        return Ok(MessageOutcome::Duplicate);
                    }
                }
            } else {
                warn!(reference = %tx.reference, "Not persisting transaction: DB mutations disabled");
            }
        }

        debug!(chat_id = user.chat_id, "Creating notification event");
        permit.send(TransactionNotification {
            chat_id: user.chat_id,
            transaction: normalized.transaction,
        });

        Ok(MessageOutcome::Notified {
            chat_id: user.chat_id,
        })
    }

    async fn acknowledge(&self, message: &QueueMessage) -> Result<(), IngestError> {
        if self.options.remove_messages {
            debug!(message_id = %message.message_id, "Removing message from queue");
            self.queue.delete(&message.receipt_handle).await?;
        } else {
            warn!(message_id = %message.message_id, "Not removing message: queue removal disabled");
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
