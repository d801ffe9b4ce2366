// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::path::PathBuf;
use std::sync::Arc;

use crate::currency::CurrencyHandle;
use crate::storage::{LedgerDatabase, ProfileDatabase};
use crate::sync::SyncHandle;

/// Shared handles for the operational API. Workers own their own state;
/// handlers only talk to them through channels.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<LedgerDatabase>,
    pub profile: Arc<ProfileDatabase>,
    pub sync: SyncHandle,
    pub currency: CurrencyHandle,
    pub data_dir: PathBuf,
}
