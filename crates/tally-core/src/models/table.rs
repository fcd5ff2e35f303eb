//! Synced table names

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A table mirrored between the local store and the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Clients,
    Products,
    Employees,
    Transactions,
    LineItems,
}

impl Table {
    /// Every table in dependency order: parents before children.
    pub const ALL: [Self; 5] = [
        Self::Clients,
        Self::Products,
        Self::Employees,
        Self::Transactions,
        Self::LineItems,
    ];

    /// Table name, identical locally and remotely.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Clients => "clients",
            Self::Products => "products",
            Self::Employees => "employees",
            Self::Transactions => "transactions",
            Self::LineItems => "line_items",
        }
    }

    /// Key under which this table's pull watermark is persisted.
    #[must_use]
    pub fn watermark_key(self) -> String {
        format!("last_seen:{}", self.name())
    }

    /// Whether rows are deduplicated by normalized name.
    #[must_use]
    pub const fn is_deduplicated(self) -> bool {
        matches!(self, Self::Clients | Self::Products)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clients" => Ok(Self::Clients),
            "products" => Ok(Self::Products),
            "employees" => Ok(Self::Employees),
            "transactions" => Ok(Self::Transactions),
            "line_items" => Ok(Self::LineItems),
            other => Err(format!("unknown table '{other}'")),
        }
    }
}
