// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Queue-driven transaction ingestion.

pub mod consumer;
pub mod message;

pub use consumer::{ConsumerOptions, EventConsumer, IngestError, MessageOutcome, PollSummary};
pub use message::{epoch_seconds, normalize, Discard, Normalized, Origin, QueueEvent};
