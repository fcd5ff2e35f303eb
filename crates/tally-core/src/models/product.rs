//! Product model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{IdMap, NamedRecord, Record, RecordId, SyncStamps, Table};
use crate::error::{Error, Result};

/// A product on sale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: RecordId,
    /// Display name; its normalized form is the deduplication key
    pub name: String,
    /// Unit price, always positive
    pub price: f64,
    pub active: bool,
    pub remote_id: Option<RecordId>,
    #[serde(flatten)]
    pub stamps: SyncStamps,
}

impl Product {
    /// Create a new product at `now`. Validation happens in the service layer.
    #[must_use]
    pub fn new(name: impl Into<String>, price: f64, now: DateTime<Utc>) -> Self {
        Self {
            id: RecordId::generate(),
            name: name.into().trim().to_string(),
            price,
            active: true,
            remote_id: None,
            stamps: SyncStamps::created(now),
        }
    }
}

/// Check a price before it reaches the store.
pub fn validate_price(price: f64) -> Result<()> {
    if price.is_finite() && price > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "price must be a positive number, got {price}"
        )))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ProductRow {
    id: RecordId,
    name: String,
    price: f64,
    #[serde(default = "default_active")]
    active: bool,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

const fn default_active() -> bool {
    true
}

impl Record for Product {
    const TABLE: Table = Table::Products;

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
        let row = ProductRow {
            id: ids.remote_id(Table::Products, &self.id),
            name: self.name.clone(),
            price: self.price,
            active: self.active,
            created_at: Some(self.stamps.created_at),
            updated_at: self.stamps.updated_at,
        };
        Ok(serde_json::to_value(row)?)
    }

    fn from_remote(row: Value, ids: &IdMap) -> Result<Self> {
        let row: ProductRow = serde_json::from_value(row)?;
        if row.id.is_blank() {
            return Err(Error::InvalidInput("remote product row without id".into()));
        }
        let id = ids.local_id(Table::Products, &row.id);
        let remote_id = (id != row.id).then_some(row.id);
        Ok(Self {
            id,
            name: row.name,
            price: row.price,
            active: row.active,
            remote_id,
            stamps: SyncStamps {
                created_at: row.created_at.unwrap_or(row.updated_at),
                updated_at: row.updated_at,
                last_synced_at: None,
            },
        })
    }
}

impl NamedRecord for Product {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn remote_id(&self) -> Option<&RecordId> {
        self.remote_id.as_ref()
    }

    fn set_remote_id(&mut self, remote_id: Option<RecordId>) {
        self.remote_id = remote_id;
    }

    fn set_id(&mut self, id: RecordId) {
        self.id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_price_rejects_non_positive() {
        assert!(validate_price(2.5).is_ok());
        assert!(validate_price(0.0).is_err());
        assert!(validate_price(-1.0).is_err());
        assert!(validate_price(f64::NAN).is_err());
        assert!(validate_price(f64::INFINITY).is_err());
    }

    #[test]
    fn retained_local_id_is_translated_both_ways() {
        let mut ids = IdMap::default();
        ids.insert(Table::Products, "L1".into(), "R2".into());

        let row = json!({
            "id": "R2",
            "name": "coffee ",
            "price": 3.0,
            "updated_at": "2024-03-01T10:00:00Z"
        });
        let product = Product::from_remote(row, &ids).unwrap();
        assert_eq!(product.id, RecordId::from("L1"));
        assert_eq!(product.remote_id, Some(RecordId::from("R2")));

        let outbound = product.to_remote(&ids).unwrap();
        assert_eq!(outbound["id"], "R2");
    }

    #[test]
    fn name_key_is_normalized() {
        let product = Product::new("Coffee", 3.0, Utc::now());
        let remote = Product {
            name: "coffee ".to_string(),
            ..product.clone()
        };
        assert_eq!(product.name_key(), remote.name_key());
    }
}
