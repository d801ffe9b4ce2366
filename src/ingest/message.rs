// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Queue message shapes and their normalization.
//!
//! Two shapes arrive on the queue:
//!
//! ```text
//! change event:  { "id", "detail-type", "source",
//!                  "detail": { "operationType", "fullDocument"? } }
//! raw webhook:   { "accountNumber", "card": { "id" }, "reference", ... }
//! ```
//!
//! Change events describe documents already in the ledger; raw webhooks are
//! new data that still has to be persisted.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use serde_json::Value;

use crate::storage::transaction::{LedgerTransaction, SIMULATION_REFERENCE};

const DELETE_OPERATION: &str = "delete";

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "detail-type", default)]
    pub detail_type: String,
    #[serde(default)]
    pub source: String,
    pub detail: ChangeDetail,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDetail {
    pub operation_type: String,
    #[serde(default)]
    pub full_document: Option<Value>,
}

/// A parsed queue message body.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Change(ChangeEvent),
    Transaction(Value),
}

/// Where a normalized transaction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Already stored; notify only.
    Ledger,
    /// New data; persist before notifying.
    External,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub origin: Origin,
    pub card_id: u64,
    pub transaction: LedgerTransaction,
}

/// Why a message was dropped without processing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Discard {
    #[error("body is not JSON: {0}")]
    MalformedJson(String),

    #[error("change event is malformed: {0}")]
    MalformedChange(String),

    #[error("change event {id} is a delete")]
    DeleteOperation { id: String },

    #[error("change event {id} ({operation}) carries no document")]
    MissingDocument { id: String, operation: String },

    #[error("transaction is missing account or card")]
    MissingFields,

    #[error("transaction is malformed: {0}")]
    InvalidTransaction(String),
}

impl QueueEvent {
    pub fn parse(body: &str) -> Result<Self, Discard> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| Discard::MalformedJson(e.to_string()))?;
        if value.get("detail").is_some() {
            let change: ChangeEvent = serde_json::from_value(value)
                .map_err(|e| Discard::MalformedChange(e.to_string()))?;
            return Ok(QueueEvent::Change(change));
        }
        Ok(QueueEvent::Transaction(value))
    }
}

/// Reduce either message shape to one canonical transaction.
pub fn normalize(event: QueueEvent) -> Result<Normalized, Discard> {
    let (origin, document) = match event {
        QueueEvent::Change(change) => {
            let ChangeEvent { id, detail, .. } = change;
            if detail.operation_type == DELETE_OPERATION {
                return Err(Discard::DeleteOperation { id });
            }
            let document = detail
                .full_document
                .filter(|d| !d.is_null())
                .ok_or(Discard::MissingDocument {
                    id,
                    operation: detail.operation_type,
                })?;
            (Origin::Ledger, document)
        }
        QueueEvent::Transaction(document) => (Origin::External, document),
    };

    let mut transaction: LedgerTransaction = serde_json::from_value(document)
        .map_err(|e| Discard::InvalidTransaction(e.to_string()))?;

    let has_account = transaction.account_number.is_some() || transaction.account_id.is_some();
    let card_id = match (has_account, transaction.card_id()) {
        (true, Some(card_id)) => card_id,
        _ => return Err(Discard::MissingFields),
    };

    rewrite_simulation_reference(&mut transaction)?;

    Ok(Normalized {
        origin,
        card_id,
        transaction,
    })
}

/// Give bare `simulation` references a per-transaction suffix so repeated
/// simulator runs don't collide on the uniqueness key.
fn rewrite_simulation_reference(tx: &mut LedgerTransaction) -> Result<(), Discard> {
    if tx.reference != SIMULATION_REFERENCE {
        return Ok(());
    }
    let epoch = epoch_seconds(&tx.date_time).ok_or_else(|| {
        Discard::InvalidTransaction(format!("unparseable dateTime {:?}", tx.date_time))
    })?;
    tx.reference = format!("{SIMULATION_REFERENCE}_{epoch}");
    Ok(())
}

/// Unix seconds of an ISO timestamp. Values without an offset are UTC.
pub fn epoch_seconds(date_time: &str) -> Option<i64> {
    let s = date_time.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn webhook() -> Value {
        json!({
            "accountNumber": "A1",
            "card": {"id": 7},
            "reference": "simulation",
            "dateTime": "2024-01-05T10:00:00",
            "centsAmount": 500,
            "currencyCode": "USD",
            "merchant": {"name": "Acme"},
            "type": "DEBIT"
        })
    }

    #[test]
    fn raw_webhook_is_external() {
        let event = QueueEvent::parse(&webhook().to_string()).unwrap();
        let normalized = normalize(event).unwrap();
        assert_eq!(normalized.origin, Origin::External);
        assert_eq!(normalized.card_id, 7);
        assert_eq!(normalized.transaction.reference, "simulation_1704448800");
        assert_eq!(normalized.transaction.cents_amount, 500);
    }

    #[test]
    fn change_insert_is_ledger_origin() {
        let body = json!({
            "id": "evt-1",
            "detail-type": "MongoDB Database Trigger",
            "source": "aws.partner/mongodb",
            "detail": {"operationType": "insert", "fullDocument": webhook()}
        });
        let normalized = normalize(QueueEvent::parse(&body.to_string()).unwrap()).unwrap();
        assert_eq!(normalized.origin, Origin::Ledger);
        assert_eq!(normalized.transaction.merchant_name(), Some("Acme"));
    }

    #[test]
    fn change_delete_is_discarded() {
        let body = json!({"id": "evt-2", "detail": {"operationType": "delete"}});
        let err = normalize(QueueEvent::parse(&body.to_string()).unwrap()).unwrap_err();
        assert_eq!(err, Discard::DeleteOperation { id: "evt-2".into() });
    }

    #[test]
    fn change_without_document_is_discarded() {
        let body = json!({"id": "evt-3", "detail": {"operationType": "update", "fullDocument": null}});
        let err = normalize(QueueEvent::parse(&body.to_string()).unwrap()).unwrap_err();
        assert!(matches!(err, Discard::MissingDocument { .. }));
    }

    #[test]
    fn missing_card_or_account_is_discarded() {
        let mut doc = webhook();
        doc.as_object_mut().unwrap().remove("card");
        let err = normalize(QueueEvent::Transaction(doc)).unwrap_err();
        assert_eq!(err, Discard::MissingFields);

        let mut doc = webhook();
        doc.as_object_mut().unwrap().remove("accountNumber");
        let err = normalize(QueueEvent::Transaction(doc)).unwrap_err();
        assert_eq!(err, Discard::MissingFields);
    }

    #[test]
    fn non_json_body_is_discarded() {
        assert!(matches!(
            QueueEvent::parse("not json"),
            Err(Discard::MalformedJson(_))
        ));
        assert!(matches!(
            QueueEvent::parse(r#"{"detail": {"fullDocument": {}}}"#),
            Err(Discard::MalformedChange(_))
        ));
    }

    #[test]
    fn ordinary_references_are_untouched() {
        let mut doc = webhook();
        doc["reference"] = json!("simulation_1700000000");
        let normalized = normalize(QueueEvent::Transaction(doc)).unwrap();
        assert_eq!(normalized.transaction.reference, "simulation_1700000000");
    }

    #[test]
    fn simulation_with_bad_date_is_discarded() {
        let mut doc = webhook();
        doc["dateTime"] = json!("yesterday");
        assert!(matches!(
            normalize(QueueEvent::Transaction(doc)),
            Err(Discard::InvalidTransaction(_))
        ));
    }

    #[test]
    fn epoch_parsing_variants() {
        assert_eq!(epoch_seconds("2024-01-05T10:00:00"), Some(1_704_448_800));
        assert_eq!(epoch_seconds("2024-01-05T10:00:00.250"), Some(1_704_448_800));
        assert_eq!(epoch_seconds("2024-01-05T10:00:00Z"), Some(1_704_448_800));
        assert_eq!(epoch_seconds("2024-01-05T12:00:00+02:00"), Some(1_704_448_800));
        assert_eq!(epoch_seconds("2024-01-05"), Some(1_704_412_800));
        assert_eq!(epoch_seconds("garbage"), None);
    }
}
