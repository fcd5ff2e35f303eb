//! Line item model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{IdMap, Product, Record, RecordId, SyncStamps, Table};
use crate::error::{Error, Result};

/// One product line of a transaction, with its price frozen at order time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: RecordId,
    pub transaction_id: RecordId,
    pub product_id: Option<RecordId>,
    /// Product name at order time
    pub product_name: String,
    pub quantity: u32,
    /// Unit price at order time
    pub unit_price: f64,
    #[serde(flatten)]
    pub stamps: SyncStamps,
}

impl LineItem {
    /// Snapshot `product` into a new line of `transaction_id`.
    #[must_use]
    pub fn for_product(
        transaction_id: &RecordId,
        product: &Product,
        quantity: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RecordId::generate(),
            transaction_id: transaction_id.clone(),
            product_id: Some(product.id.clone()),
            product_name: product.name.clone(),
            quantity,
            unit_price: product.price,
            stamps: SyncStamps::created(now),
        }
    }

    /// Line total
    #[must_use]
    pub fn total(&self) -> f64 {
        f64::from(self.quantity) * self.unit_price
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LineItemRow {
    id: RecordId,
    transaction_id: RecordId,
    #[serde(default)]
    product_id: Option<RecordId>,
    #[serde(default)]
    product_name: String,
    quantity: u32,
    unit_price: f64,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl Record for LineItem {
    const TABLE: Table = Table::LineItems;

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
        let row = LineItemRow {
            id: self.id.clone(),
            transaction_id: self.transaction_id.clone(),
            product_id: self
                .product_id
                .as_ref()
                .map(|product| ids.remote_id(Table::Products, product)),
            product_name: self.product_name.clone(),
            quantity: self.quantity,
            unit_price: self.unit_price,
            created_at: Some(self.stamps.created_at),
            updated_at: self.stamps.updated_at,
        };
        Ok(serde_json::to_value(row)?)
    }

    fn from_remote(row: Value, ids: &IdMap) -> Result<Self> {
        let row: LineItemRow = serde_json::from_value(row)?;
        if row.id.is_blank() || row.transaction_id.is_blank() {
            return Err(Error::InvalidInput(
                "remote line item row without id or transaction".into(),
            ));
        }
        Ok(Self {
            id: row.id,
            transaction_id: row.transaction_id,
            product_id: row
                .product_id
                .map(|product| ids.local_id(Table::Products, &product)),
            product_name: row.product_name,
            quantity: row.quantity,
            unit_price: row.unit_price,
            stamps: SyncStamps {
                created_at: row.created_at.unwrap_or(row.updated_at),
                updated_at: row.updated_at,
                last_synced_at: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_product_name_and_price() {
        let now = Utc::now();
        let product = Product::new("Espresso", 2.5, now);
        let tx_id = RecordId::generate();
        let item = LineItem::for_product(&tx_id, &product, 3, now);

        assert_eq!(item.product_name, "Espresso");
        assert!((item.total() - 7.5).abs() < f64::EPSILON);
        assert_eq!(item.transaction_id, tx_id);
    }

    #[test]
    fn rejects_orphan_rows() {
        let row = serde_json::json!({
            "id": "i-1",
            "transaction_id": " ",
            "quantity": 1,
            "unit_price": 1.0,
            "updated_at": "2024-03-01T10:00:00Z"
        });
        assert!(LineItem::from_remote(row, &IdMap::default()).is_err());
    }
}
