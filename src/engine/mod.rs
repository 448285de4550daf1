//! Accounting core — the ledger, position, bet, settlement, and reward
//! engines.
//!
//! Every public operation here is one atomic unit: it opens a storage
//! transaction, reads current state, validates, computes new state, and
//! commits ledger + entity + audit changes together or not at all.
//! Transient write races (`StorageConflict`) are retried a bounded number
//! of times before surfacing to the caller.

pub mod bets;
pub mod ledger;
pub mod positions;
pub mod rewards;
pub mod settlement;

use sqlx::SqlitePool;

use crate::config::EconomyConfig;
use crate::storage::Storage;

/// Retry budget for operations that lose a write race.
pub(crate) const CONFLICT_RETRIES: u32 = 3;

/// The accounting core. Cheap to clone; all state lives in storage.
#[derive(Clone)]
pub struct Engine {
    pub(crate) storage: Storage,
    pub(crate) economy: EconomyConfig,
}

impl Engine {
    pub fn new(storage: Storage, economy: EconomyConfig) -> Self {
        Self { storage, economy }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn economy(&self) -> &EconomyConfig {
        &self.economy
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        self.storage.pool()
    }
}
