// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Canonical ledger transaction document.
//!
//! Both the queue consumer and the synchronizer normalize into this type
//! before touching the Ledger Store. Unknown provider fields are kept in
//! `extra` so the stored document mirrors what the provider sent.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Reference prefix used by the banking simulator.
pub const SIMULATION_REFERENCE: &str = "simulation";

/// Transaction type of incoming funds.
pub const CREDIT: &str = "CREDIT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardRef {
    #[serde(deserialize_with = "u64_from_number_or_string")]
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Merchant {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTransaction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<CardRef>,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub date_time: String,
    #[serde(default)]
    pub cents_amount: i64,
    #[serde(default)]
    pub currency_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant: Option<Merchant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "opt_u64_from_number_or_string"
    )]
    pub posted_order: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LedgerTransaction {
    /// Natural uniqueness key.
    ///
    /// `(accountId, postedOrder)` when both are known, otherwise
    /// `(accountNumber | accountId, card.id, reference)`. `None` means the
    /// record cannot be deduplicated and must not be stored.
    pub fn dedup_key(&self) -> Option<String> {
        if let (Some(account_id), Some(posted)) = (&self.account_id, self.posted_order) {
            return Some(format!("posted|{account_id}|{posted:020}"));
        }
        let account = self
            .account_number
            .as_deref()
            .or(self.account_id.as_deref())?;
        let card = self.card.as_ref()?;
        Some(format!("ref|{account}|{}|{}", card.id, self.reference))
    }

    /// First ten characters of `dateTime`, when it looks like a date.
    pub fn calendar_date(&self) -> Option<&str> {
        self.date_time
            .get(..10)
            .filter(|d| d.as_bytes().get(4) == Some(&b'-'))
    }

    pub fn is_simulation(&self) -> bool {
        self.reference.starts_with(SIMULATION_REFERENCE)
    }

    pub fn is_credit(&self) -> bool {
        self.kind.as_deref() == Some(CREDIT)
    }

    pub fn card_id(&self) -> Option<u64> {
        self.card.as_ref().map(|c| c.id)
    }

    pub fn merchant_name(&self) -> Option<&str> {
        self.merchant.as_ref().map(|m| m.name.as_str())
    }
}

fn u64_from_number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Float(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Float(f) if f >= 0.0 && f.fract() == 0.0 => Ok(f as u64),
        Raw::Float(f) => Err(serde::de::Error::custom(format!("not an integer id: {f}"))),
        Raw::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("not an integer id: {s:?}"))),
    }
}

fn opt_u64_from_number_or_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "u64_from_number_or_string")] u64);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(n)| n))
}
