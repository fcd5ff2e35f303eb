//! Transaction (order) model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::{DayKey, IdMap, Record, RecordId, SyncStamps, Table};
use crate::error::{Error, Result};

/// Kind of ledger transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    #[default]
    Sale,
    Purchase,
}

impl TransactionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sale => "SALE",
            Self::Purchase => "PURCHASE",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SALE" => Ok(Self::Sale),
            "PURCHASE" => Ok(Self::Purchase),
            other => Err(format!("unknown transaction kind '{other}'")),
        }
    }
}

/// Kitchen/counter preparation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreparationStatus {
    #[default]
    Pending,
    Ready,
}

impl PreparationStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Ready => "READY",
        }
    }
}

impl fmt::Display for PreparationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PreparationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "READY" => Ok(Self::Ready),
            other => Err(format!("unknown preparation status '{other}'")),
        }
    }
}

/// A ledger transaction; its line items live in their own table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: RecordId,
    pub date_key: DayKey,
    pub kind: TransactionKind,
    /// `None` books the transaction on the walk-in client
    pub client_id: Option<RecordId>,
    pub preparation_status: PreparationStatus,
    /// Append-only void marker; transactions are never deleted
    pub reversed: bool,
    pub payment_method: Option<String>,
    #[serde(flatten)]
    pub stamps: SyncStamps,
}

impl Transaction {
    #[must_use]
    pub fn new(
        date_key: DayKey,
        kind: TransactionKind,
        client_id: Option<RecordId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RecordId::generate(),
            date_key,
            kind,
            client_id,
            preparation_status: PreparationStatus::Pending,
            reversed: false,
            payment_method: None,
            stamps: SyncStamps::created(now),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TransactionRow {
    id: RecordId,
    date_key: DayKey,
    kind: TransactionKind,
    #[serde(default)]
    client_id: Option<RecordId>,
    #[serde(default)]
    preparation_status: PreparationStatus,
    #[serde(default)]
    reversed: bool,
    #[serde(default)]
    payment_method: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl Record for Transaction {
    const TABLE: Table = Table::Transactions;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn stamps(&self) -> &SyncStamps {
        &self.stamps
    }

    fn stamps_mut(&mut self) -> &mut SyncStamps {
        &mut self.stamps
    }

    fn to_remote(&self, ids: &IdMap) -> Result<Value> {
        let row = TransactionRow {
            id: self.id.clone(),
            date_key: self.date_key,
            kind: self.kind,
            client_id: self
                .client_id
                .as_ref()
                .map(|client| ids.remote_id(Table::Clients, client)),
            preparation_status: self.preparation_status,
            reversed: self.reversed,
            payment_method: self.payment_method.clone(),
            created_at: Some(self.stamps.created_at),
            updated_at: self.stamps.updated_at,
        };
        Ok(serde_json::to_value(row)?)
    }

    fn from_remote(row: Value, ids: &IdMap) -> Result<Self> {
        let row: TransactionRow = serde_json::from_value(row)?;
        if row.id.is_blank() {
            return Err(Error::InvalidInput(
                "remote transaction row without id".into(),
            ));
        }
        Ok(Self {
            id: row.id,
            date_key: row.date_key,
            kind: row.kind,
            client_id: row
                .client_id
                .map(|client| ids.local_id(Table::Clients, &client)),
            preparation_status: row.preparation_status,
            reversed: row.reversed,
            payment_method: row.payment_method,
            stamps: SyncStamps {
                created_at: row.created_at.unwrap_or(row.updated_at),
                updated_at: row.updated_at,
                last_synced_at: None,
            },
        })
    }
}
