// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Credential/Profile Store backed by redb.
//!
//! Every sensitive value is persisted as an [`Envelope`] sealed with the
//! owner's chat id as header, next to a SHA-384 digest for equality lookups.
//! Plaintext only exists in the DTOs returned to callers.
//!
//! ## Table Layout
//!
//! - `users`: chat_id → StoredUser
//! - `client_digest_index`: digest(client_id) → chat_id
//! - `access_tokens`: chat_id → StoredToken (expiry kept in plaintext)
//! - `accounts`: composite key (chat_id_be|account_id) → StoredAccount
//! - `cards`: composite key (chat_id_be|card_id_be) → StoredCard
//! - `card_owners`: card_id → chat_id

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::error::{StoreError, StoreResult};
use crate::crypto::{digest, Envelope, FieldCipher};

// =============================================================================
// Table Definitions
// =============================================================================

const USERS: TableDefinition<i64, &[u8]> = TableDefinition::new("users");
const CLIENT_DIGEST_INDEX: TableDefinition<&str, i64> = TableDefinition::new("client_digest_index");
const ACCESS_TOKENS: TableDefinition<i64, &[u8]> = TableDefinition::new("access_tokens");
const ACCOUNTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("accounts");
const CARDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("cards");
const CARD_OWNERS: TableDefinition<u64, i64> = TableDefinition::new("card_owners");

// =============================================================================
// Stored Records
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct StoredUser {
    chat_id: i64,
    client_id: Envelope,
    client_id_digest: String,
    credentials: Envelope,
    credentials_digest: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredToken {
    token: Envelope,
    token_digest: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredAccount {
    account_id: String,
    account_number: Envelope,
    account_number_digest: String,
    info: Envelope,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredCard {
    card_id: u64,
    account_id: String,
    card_number: Envelope,
    card_number_digest: String,
    info: Envelope,
    updated_at: DateTime<Utc>,
}

// =============================================================================
// Decrypted DTOs
// =============================================================================

/// Banking API credential blob.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankCredentials {
    pub secret: String,
    pub api_key: String,
}

impl fmt::Debug for BankCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BankCredentials")
            .field("secret", &"<redacted>")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub chat_id: i64,
    pub client_id: String,
    pub credentials: BankCredentials,
}

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub account_id: String,
    pub account_number: String,
    /// Full provider metadata.
    pub info: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub card_id: u64,
    pub account_id: String,
    pub card_number: String,
    pub info: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    CredentialsUpdated,
}

// =============================================================================
// Key Helpers
// =============================================================================

fn header(chat_id: i64) -> String {
    chat_id.to_string()
}

fn owner_key(chat_id: i64, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + suffix.len());
    key.extend_from_slice(&chat_id.to_be_bytes());
    key.extend_from_slice(suffix);
    key
}

/// Upper bound past any `owner_key` of this chat id.
fn owner_prefix_end(chat_id: i64) -> Vec<u8> {
    let mut end = chat_id.to_be_bytes().to_vec();
    end.extend_from_slice(&[0xFF; 9]);
    end
}

fn required_str<'a>(info: &'a Value, field: &str) -> StoreResult<&'a str> {
    info.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::InvalidRecord(format!("missing string field {field}")))
}

fn required_u64(info: &Value, field: &str) -> StoreResult<u64> {
    match info.get(field) {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| StoreError::InvalidRecord(format!("missing integer field {field}")))
}

// =============================================================================
// ProfileDatabase
// =============================================================================

pub struct ProfileDatabase {
    db: Database,
    cipher: Arc<FieldCipher>,
}

impl ProfileDatabase {
    /// Open (or create) the profile store at the given path.
    pub fn open(path: &Path, cipher: Arc<FieldCipher>) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(USERS)?;
            let _ = write_txn.open_table(CLIENT_DIGEST_INDEX)?;
            let _ = write_txn.open_table(ACCESS_TOKENS)?;
            let _ = write_txn.open_table(ACCOUNTS)?;
            let _ = write_txn.open_table(CARDS)?;
            let _ = write_txn.open_table(CARD_OWNERS)?;
        }
        write_txn.commit()?;

        Ok(Self { db, cipher })
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Create a user, or replace the credentials of an existing one in place.
    pub fn register_user(
        &self,
        chat_id: i64,
        client_id: &str,
        credentials: &BankCredentials,
    ) -> StoreResult<RegisterOutcome> {
        let h = header(chat_id);
        let credentials_json = serde_json::to_string(credentials)?;
        let now = Utc::now();

        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut users = write_txn.open_table(USERS)?;
            let existing = users
                .get(chat_id)?
                .map(|v| serde_json::from_slice::<StoredUser>(v.value()))
                .transpose()?;

            let (record, outcome) = match existing {
                Some(mut user) => {
                    debug!(chat_id, "Updating stored credentials");
                    user.credentials = self.cipher.encrypt(&h, &credentials_json)?;
                    user.credentials_digest = digest(&credentials_json);
                    user.updated_at = now;
                    (user, RegisterOutcome::CredentialsUpdated)
                }
                None => {
                    debug!(chat_id, "Registering new user");
                    let user = StoredUser {
                        chat_id,
                        client_id: self.cipher.encrypt(&h, client_id)?,
                        client_id_digest: digest(client_id),
                        credentials: self.cipher.encrypt(&h, &credentials_json)?,
                        credentials_digest: digest(&credentials_json),
                        created_at: now,
                        updated_at: now,
                    };
                    (user, RegisterOutcome::Created)
                }
            };

            let json = serde_json::to_vec(&record)?;
            users.insert(chat_id, json.as_slice())?;

            let mut digests = write_txn.open_table(CLIENT_DIGEST_INDEX)?;
            digests.insert(record.client_id_digest.as_str(), chat_id)?;
            outcome
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    pub fn get_user(&self, chat_id: i64) -> StoreResult<Option<User>> {
        let read_txn = self.db.begin_read()?;
        let users = read_txn.open_table(USERS)?;
        match users.get(chat_id)? {
            Some(value) => {
                let stored: StoredUser = serde_json::from_slice(value.value())?;
                Ok(Some(self.open_user(stored)?))
            }
            None => Ok(None),
        }
    }

    /// Registered chat ids without decrypting anything.
    pub fn list_chat_ids(&self) -> StoreResult<Vec<i64>> {
        let read_txn = self.db.begin_read()?;
        let users = read_txn.open_table(USERS)?;
        let mut ids = Vec::new();
        for entry in users.iter()? {
            let (key, _) = entry?;
            ids.push(key.value());
        }
        Ok(ids)
    }

    pub fn list_users(&self) -> StoreResult<Vec<User>> {
        let read_txn = self.db.begin_read()?;
        let users = read_txn.open_table(USERS)?;
        let mut out = Vec::new();
        for entry in users.iter()? {
            let (_, value) = entry?;
            let stored: StoredUser = serde_json::from_slice(value.value())?;
            out.push(self.open_user(stored)?);
        }
        Ok(out)
    }

    /// Digest lookup; no envelope is opened.
    pub fn find_user_by_client_id(&self, client_id: &str) -> StoreResult<Option<i64>> {
        let read_txn = self.db.begin_read()?;
        let digests = read_txn.open_table(CLIENT_DIGEST_INDEX)?;
        Ok(digests.get(digest(client_id).as_str())?.map(|v| v.value()))
    }

    /// Owner of a card, if the card has been synced into some profile.
    pub fn user_for_card(&self, card_id: u64) -> StoreResult<Option<User>> {
        let chat_id = {
            let read_txn = self.db.begin_read()?;
            let owners = read_txn.open_table(CARD_OWNERS)?;
            let owner = owners.get(card_id)?.map(|v| v.value());
            owner
        };
        match chat_id {
            Some(chat_id) => self.get_user(chat_id),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Access tokens
    // =========================================================================

    /// `None` means the user never authorized against the banking API.
    pub fn get_access_token(&self, chat_id: i64) -> StoreResult<Option<AccessToken>> {
        let read_txn = self.db.begin_read()?;
        let tokens = read_txn.open_table(ACCESS_TOKENS)?;
        match tokens.get(chat_id)? {
            Some(value) => {
                let stored: StoredToken = serde_json::from_slice(value.value())?;
                Ok(Some(AccessToken {
                    token: self.cipher.decrypt(&header(chat_id), &stored.token)?,
                    expires_at: stored.expires_at,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn update_access_token(&self, chat_id: i64, token: &AccessToken) -> StoreResult<()> {
        let record = StoredToken {
            token: self.cipher.encrypt(&header(chat_id), &token.token)?,
            token_digest: digest(&token.token),
            expires_at: token.expires_at,
        };
        let json = serde_json::to_vec(&record)?;

        let write_txn = self.db.begin_write()?;
        {
            let users = write_txn.open_table(USERS)?;
            if users.get(chat_id)?.is_none() {
                return Err(StoreError::NotFound(format!("user {chat_id}")));
            }
            let mut tokens = write_txn.open_table(ACCESS_TOKENS)?;
            tokens.insert(chat_id, json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Upsert by `accountId`. Existing rows only get their info blob refreshed.
    pub fn upsert_accounts(&self, chat_id: i64, infos: &[Value]) -> StoreResult<usize> {
        let h = header(chat_id);
        let now = Utc::now();

        let write_txn = self.db.begin_write()?;
        {
            let users = write_txn.open_table(USERS)?;
            if users.get(chat_id)?.is_none() {
                return Err(StoreError::NotFound(format!("user {chat_id}")));
            }
            let mut accounts = write_txn.open_table(ACCOUNTS)?;

            for info in infos {
                let account_id = required_str(info, "accountId")?;
                let key = owner_key(chat_id, account_id.as_bytes());
                let info_envelope = self.cipher.encrypt(&h, &serde_json::to_string(info)?)?;

                let existing = accounts
                    .get(key.as_slice())?
                    .map(|v| serde_json::from_slice::<StoredAccount>(v.value()))
                    .transpose()?;

                let record = match existing {
                    Some(mut account) => {
                        account.info = info_envelope;
                        account.updated_at = now;
                        account
                    }
                    None => {
                        let number = required_str(info, "accountNumber")?;
                        StoredAccount {
                            account_id: account_id.to_string(),
                            account_number: self.cipher.encrypt(&h, number)?,
                            account_number_digest: digest(number),
                            info: info_envelope,
                            updated_at: now,
                        }
                    }
                };
                let json = serde_json::to_vec(&record)?;
                accounts.insert(key.as_slice(), json.as_slice())?;
            }
        }
        write_txn.commit()?;

        debug!(chat_id, count = infos.len(), "Accounts upserted");
        Ok(infos.len())
    }

    pub fn list_accounts(&self, chat_id: i64) -> StoreResult<Vec<Account>> {
        let read_txn = self.db.begin_read()?;
        let accounts = read_txn.open_table(ACCOUNTS)?;
        let start = owner_key(chat_id, &[]);
        let end = owner_prefix_end(chat_id);

        let mut out = Vec::new();
        for entry in accounts.range(start.as_slice()..end.as_slice())? {
            let (_, value) = entry?;
            let stored: StoredAccount = serde_json::from_slice(value.value())?;
            out.push(self.open_account(chat_id, stored)?);
        }
        Ok(out)
    }

    pub fn get_account(&self, chat_id: i64, account_id: &str) -> StoreResult<Option<Account>> {
        let read_txn = self.db.begin_read()?;
        let accounts = read_txn.open_table(ACCOUNTS)?;
        let key = owner_key(chat_id, account_id.as_bytes());
        match accounts.get(key.as_slice())? {
            Some(value) => {
                let stored: StoredAccount = serde_json::from_slice(value.value())?;
                Ok(Some(self.open_account(chat_id, stored)?))
            }
            None => Ok(None),
        }
    }

    /// Account id whose number matches, compared by digest only.
    pub fn find_account_by_number(
        &self,
        chat_id: i64,
        account_number: &str,
    ) -> StoreResult<Option<String>> {
        let wanted = digest(account_number);
        let read_txn = self.db.begin_read()?;
        let accounts = read_txn.open_table(ACCOUNTS)?;
        let start = owner_key(chat_id, &[]);
        let end = owner_prefix_end(chat_id);

        for entry in accounts.range(start.as_slice()..end.as_slice())? {
            let (_, value) = entry?;
            let stored: StoredAccount = serde_json::from_slice(value.value())?;
            if stored.account_number_digest == wanted {
                return Ok(Some(stored.account_id));
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Cards
    // =========================================================================

    /// Upsert by `CardKey`, recording the card's owner for event routing.
    pub fn upsert_cards(&self, chat_id: i64, infos: &[Value]) -> StoreResult<usize> {
        let h = header(chat_id);
        let now = Utc::now();

        let write_txn = self.db.begin_write()?;
        {
            let users = write_txn.open_table(USERS)?;
            if users.get(chat_id)?.is_none() {
                return Err(StoreError::NotFound(format!("user {chat_id}")));
            }
            let mut cards = write_txn.open_table(CARDS)?;
            let mut owners = write_txn.open_table(CARD_OWNERS)?;

            for info in infos {
                let card_id = required_u64(info, "CardKey")?;
                let card_be = card_id.to_be_bytes();
                let key = owner_key(chat_id, &card_be);
                let info_envelope = self.cipher.encrypt(&h, &serde_json::to_string(info)?)?;

                let existing = cards
                    .get(key.as_slice())?
                    .map(|v| serde_json::from_slice::<StoredCard>(v.value()))
                    .transpose()?;

                let record = match existing {
                    Some(mut card) => {
                        card.info = info_envelope;
                        card.updated_at = now;
                        card
                    }
                    None => {
                        let number = required_str(info, "CardNumber")?;
                        StoredCard {
                            card_id,
                            account_id: required_str(info, "AccountId")?.to_string(),
                            card_number: self.cipher.encrypt(&h, number)?,
                            card_number_digest: digest(number),
                            info: info_envelope,
                            updated_at: now,
                        }
                    }
                };
                let json = serde_json::to_vec(&record)?;
                cards.insert(key.as_slice(), json.as_slice())?;

                let previous = owners.insert(card_id, chat_id)?.map(|v| v.value());
                if let Some(prev) = previous.filter(|prev| *prev != chat_id) {
                    cards.remove(owner_key(prev, &card_be).as_slice())?;
                    debug!(card_id, from = prev, to = chat_id, "Card changed owner");
                }
            }
        }
        write_txn.commit()?;

        debug!(chat_id, count = infos.len(), "Cards upserted");
        Ok(infos.len())
    }

    pub fn list_cards(&self, chat_id: i64) -> StoreResult<Vec<Card>> {
        let read_txn = self.db.begin_read()?;
        let cards = read_txn.open_table(CARDS)?;
        let start = owner_key(chat_id, &[]);
        let end = owner_prefix_end(chat_id);

        let mut out = Vec::new();
        for entry in cards.range(start.as_slice()..end.as_slice())? {
            let (_, value) = entry?;
            let stored: StoredCard = serde_json::from_slice(value.value())?;
            out.push(self.open_card(chat_id, stored)?);
        }
        Ok(out)
    }

    pub fn get_card(&self, chat_id: i64, card_id: u64) -> StoreResult<Option<Card>> {
        let read_txn = self.db.begin_read()?;
        let cards = read_txn.open_table(CARDS)?;
        let key = owner_key(chat_id, &card_id.to_be_bytes());
        match cards.get(key.as_slice())? {
            Some(value) => {
                let stored: StoredCard = serde_json::from_slice(value.value())?;
                Ok(Some(self.open_card(chat_id, stored)?))
            }
            None => Ok(None),
        }
    }

    // =========================================================================
    // Envelope opening
    // =========================================================================

    fn open_user(&self, stored: StoredUser) -> StoreResult<User> {
        let h = header(stored.chat_id);
        let client_id = self.cipher.decrypt(&h, &stored.client_id)?;
        let credentials_json = self.cipher.decrypt(&h, &stored.credentials)?;
        Ok(User {
            chat_id: stored.chat_id,
            client_id,
            credentials: serde_json::from_str(&credentials_json)?,
        })
    }

    fn open_account(&self, chat_id: i64, stored: StoredAccount) -> StoreResult<Account> {
        let h = header(chat_id);
        Ok(Account {
            account_number: self.cipher.decrypt(&h, &stored.account_number)?,
            info: serde_json::from_str(&self.cipher.decrypt(&h, &stored.info)?)?,
            account_id: stored.account_id,
        })
    }

    fn open_card(&self, chat_id: i64, stored: StoredCard) -> StoreResult<Card> {
        let h = header(chat_id);
        Ok(Card {
            card_number: self.cipher.decrypt(&h, &stored.card_number)?,
            info: serde_json::from_str(&self.cipher.decrypt(&h, &stored.info)?)?,
            card_id: stored.card_id,
            account_id: stored.account_id,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{StaticKeyProvider, KEY_LEN};
    use serde_json::json;

    fn temp_db() -> (ProfileDatabase, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cipher = FieldCipher::new(&StaticKeyProvider::new([3u8; KEY_LEN])).unwrap();
        let db = ProfileDatabase::open(&dir.path().join("profile.redb"), Arc::new(cipher)).unwrap();
        (db, dir)
    }

    fn creds(secret: &str) -> BankCredentials {
        BankCredentials {
            secret: secret.to_string(),
            api_key: "api-key-1".to_string(),
        }
    }

    #[test]
    fn register_and_read_back() {
        let (db, _dir) = temp_db();
        let outcome = db.register_user(42, "client-abc", &creds("s1")).unwrap();
        assert_eq!(outcome, RegisterOutcome::Created);

        let user = db.get_user(42).unwrap().unwrap();
        assert_eq!(user.client_id, "client-abc");
        assert_eq!(user.credentials, creds("s1"));
        assert!(db.get_user(43).unwrap().is_none());
    }

    #[test]
    fn re_registration_updates_credentials_in_place() {
        let (db, _dir) = temp_db();
        db.register_user(42, "client-abc", &creds("s1")).unwrap();
        let outcome = db.register_user(42, "client-ignored", &creds("s2")).unwrap();
        assert_eq!(outcome, RegisterOutcome::CredentialsUpdated);

        let users = db.list_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].client_id, "client-abc");
        assert_eq!(users[0].credentials.secret, "s2");
        assert_eq!(db.list_chat_ids().unwrap(), vec![42]);
    }

    #[test]
    fn find_user_by_client_digest() {
        let (db, _dir) = temp_db();
        db.register_user(-1001, "client-neg", &creds("s")).unwrap();
        assert_eq!(db.find_user_by_client_id("client-neg").unwrap(), Some(-1001));
        assert_eq!(db.find_user_by_client_id("client-other").unwrap(), None);
    }

    #[test]
    fn access_token_lifecycle() {
        let (db, _dir) = temp_db();
        db.register_user(42, "client-abc", &creds("s1")).unwrap();
        assert!(db.get_access_token(42).unwrap().is_none());

        let expires_at = Utc::now() + chrono::Duration::minutes(30);
        let token = AccessToken {
            token: "bearer-1".into(),
            expires_at,
        };
        db.update_access_token(42, &token).unwrap();
        assert_eq!(db.get_access_token(42).unwrap(), Some(token));

        let rotated = AccessToken {
            token: "bearer-2".into(),
            expires_at,
        };
        db.update_access_token(42, &rotated).unwrap();
        assert_eq!(db.get_access_token(42).unwrap().unwrap().token, "bearer-2");
    }

    #[test]
    fn token_for_unknown_user_is_not_found() {
        let (db, _dir) = temp_db();
        let token = AccessToken {
            token: "t".into(),
            expires_at: Utc::now(),
        };
        assert!(matches!(
            db.update_access_token(1, &token),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn accounts_upsert_by_account_id() {
        let (db, _dir) = temp_db();
        db.register_user(42, "client-abc", &creds("s1")).unwrap();

        let info = json!({"accountId": "acc-1", "accountNumber": "10012345678", "productName": "Private Bank"});
        db.upsert_accounts(42, &[info]).unwrap();
        let refreshed = json!({"accountId": "acc-1", "accountNumber": "10012345678", "productName": "Renamed"});
        db.upsert_accounts(42, &[refreshed.clone()]).unwrap();

        let accounts = db.list_accounts(42).unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].account_number, "10012345678");
        assert_eq!(accounts[0].info, refreshed);

        assert_eq!(
            db.find_account_by_number(42, "10012345678").unwrap().as_deref(),
            Some("acc-1")
        );
        assert!(db.find_account_by_number(42, "999").unwrap().is_none());
        assert!(db.get_account(42, "acc-1").unwrap().is_some());
        assert!(db.list_accounts(43).unwrap().is_empty());
    }

    #[test]
    fn cards_route_to_owner() {
        let (db, _dir) = temp_db();
        db.register_user(42, "client-abc", &creds("s1")).unwrap();
        db.register_user(43, "client-def", &creds("s2")).unwrap();

        db.upsert_cards(
            42,
            &[json!({"CardKey": "7", "CardNumber": "402167xxxxxx9999", "AccountId": "acc-1"})],
        )
        .unwrap();
        db.upsert_cards(
            43,
            &[json!({"CardKey": 8, "CardNumber": "402167xxxxxx1111", "AccountId": "acc-2"})],
        )
        .unwrap();

        assert_eq!(db.user_for_card(7).unwrap().unwrap().chat_id, 42);
        assert_eq!(db.user_for_card(8).unwrap().unwrap().chat_id, 43);
        assert!(db.user_for_card(9).unwrap().is_none());

        let card = db.get_card(42, 7).unwrap().unwrap();
        assert_eq!(card.card_number, "402167xxxxxx9999");
        assert_eq!(card.account_id, "acc-1");
        assert_eq!(db.list_cards(42).unwrap().len(), 1);
        assert!(db.get_card(43, 7).unwrap().is_none());
    }

    #[test]
    fn card_moving_to_new_owner_leaves_no_stale_row() {
        let (db, _dir) = temp_db();
        db.register_user(42, "client-abc", &creds("s1")).unwrap();
        db.register_user(43, "client-def", &creds("s2")).unwrap();

        let info = json!({"CardKey": 7, "CardNumber": "402167xxxxxx9999", "AccountId": "acc-1"});
        db.upsert_cards(42, std::slice::from_ref(&info)).unwrap();
        db.upsert_cards(43, &[info]).unwrap();

        assert_eq!(db.user_for_card(7).unwrap().unwrap().chat_id, 43);
        assert!(db.list_cards(42).unwrap().is_empty());
        assert!(db.get_card(42, 7).unwrap().is_none());
        let moved = db.get_card(43, 7).unwrap().unwrap();
        assert_eq!(moved.card_number, "402167xxxxxx9999");

        // Same owner again keeps its row.
        db.upsert_cards(43, &[json!({"CardKey": 7, "Status": "Active"})]).unwrap();
        assert_eq!(db.list_cards(43).unwrap().len(), 1);
    }

    #[test]
    fn upsert_requires_registered_user() {
        let (db, _dir) = temp_db();
        let res = db.upsert_accounts(5, &[json!({"accountId": "a", "accountNumber": "1"})]);
        assert!(matches!(res, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn malformed_card_info_is_rejected() {
        let (db, _dir) = temp_db();
        db.register_user(42, "client-abc", &creds("s1")).unwrap();
        let res = db.upsert_cards(42, &[json!({"CardNumber": "x", "AccountId": "a"})]);
        assert!(matches!(res, Err(StoreError::InvalidRecord(_))));
    }

    #[test]
    fn envelope_moved_to_other_user_fails_integrity() {
        let (db, _dir) = temp_db();
        db.register_user(42, "client-abc", &creds("s1")).unwrap();

        // Copy user 42's record under user 43's key.
        let write_txn = db.db.begin_write().unwrap();
        {
            let mut users = write_txn.open_table(USERS).unwrap();
            let bytes = users.get(42).unwrap().unwrap().value().to_vec();
            let mut stored: StoredUser = serde_json::from_slice(&bytes).unwrap();
            stored.chat_id = 43;
            let json = serde_json::to_vec(&stored).unwrap();
            users.insert(43, json.as_slice()).unwrap();
        }
        write_txn.commit().unwrap();

        let err = db.get_user(43).unwrap_err();
        assert!(err.is_integrity_violation());
    }

    #[test]
    fn plaintext_never_hits_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.redb");
        {
            let cipher = FieldCipher::new(&StaticKeyProvider::new([3u8; KEY_LEN])).unwrap();
            let db = ProfileDatabase::open(&path, Arc::new(cipher)).unwrap();
            db.register_user(42, "CLIENT-PLAINTEXT-MARKER", &creds("SECRET-PLAINTEXT-MARKER"))
                .unwrap();
        }
        let bytes = std::fs::read(&path).unwrap();
        let haystack = String::from_utf8_lossy(&bytes);
        assert!(!haystack.contains("CLIENT-PLAINTEXT-MARKER"));
        assert!(!haystack.contains("SECRET-PLAINTEXT-MARKER"));
    }
}
