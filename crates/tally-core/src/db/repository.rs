//! Record repository shared by every synced table

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Params, Row};
use std::marker::PhantomData;
use std::str::FromStr;

use super::conflict_repository::ConflictRepository;
use crate::error::Result;
use crate::models::{
    Client, Employee, LineItem, NamedRecord, Product, Record, RecordId, SyncStamps, Table,
    Transaction,
};
use crate::util::synced_stamp;

/// A record with a local SQL mapping.
pub trait LocalRecord: Record {
    /// Column names, `id` first and the three sync stamps last
    const COLUMNS: &'static [&'static str];

    /// Values in `COLUMNS` order
    fn to_params(&self) -> Vec<SqlValue>;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// What `apply_remote` did with an inbound row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Inserted or overwritten
    Applied,
    /// Local row already held this exact version
    Unchanged,
    /// Local row is newer; kept and logged as a conflict
    Rejected,
}

/// Repository for one table, borrowing the connection (or an open SQL transaction).
pub struct RecordRepository<'a, R> {
    conn: &'a Connection,
    _record: PhantomData<R>,
}

impl<'a, R: LocalRecord> RecordRepository<'a, R> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            _record: PhantomData,
        }
    }

    fn select_sql(clause: &str) -> String {
        format!(
            "SELECT {} FROM {} {clause}",
            R::COLUMNS.join(", "),
            R::TABLE.name()
        )
    }

    pub(crate) fn query<P: Params>(&self, clause: &str, params: P) -> Result<Vec<R>> {
        let mut stmt = self.conn.prepare(&Self::select_sql(clause))?;
        let records = stmt
            .query_map(params, R::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Get a record by ID
    pub fn get(&self, id: &RecordId) -> Result<Option<R>> {
        let record = self
            .conn
            .query_row(
                &Self::select_sql("WHERE id = ?1"),
                params![id.as_str()],
                R::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Every row, oldest first
    pub fn list_all(&self) -> Result<Vec<R>> {
        self.query("ORDER BY created_at ASC, id ASC", [])
    }

    /// Rows never synced or mutated after their last sync
    pub fn list_dirty(&self) -> Result<Vec<R>> {
        self.query(
            "WHERE last_synced_at IS NULL OR updated_at > last_synced_at
             ORDER BY updated_at ASC, id ASC",
            [],
        )
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", R::TABLE.name()),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn count_dirty(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE last_synced_at IS NULL OR updated_at > last_synced_at",
                R::TABLE.name()
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Insert or replace a record by id
    pub fn upsert(&self, record: &R) -> Result<()> {
        let placeholders = (1..=R::COLUMNS.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = R::COLUMNS[1..]
            .iter()
            .map(|column| format!("{column} = excluded.{column}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})
             ON CONFLICT(id) DO UPDATE SET {updates}",
            R::TABLE.name(),
            R::COLUMNS.join(", "),
        );
        self.conn.execute(&sql, params_from_iter(record.to_params()))?;
        Ok(())
    }

    /// Physically remove a row; returns whether it existed
    pub fn delete(&self, id: &RecordId) -> Result<bool> {
        let removed = self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", R::TABLE.name()),
            params![id.as_str()],
        )?;
        Ok(removed > 0)
    }

    /// Confirm an uploaded batch.
    ///
    /// Each entry carries the `updated_at` that was transmitted; rows changed
    /// since then are left dirty.
    pub fn mark_synced(&self, pushed: &[(RecordId, DateTime<Utc>)], now: DateTime<Utc>) -> Result<usize> {
        let mut stmt = self.conn.prepare(&format!(
            "UPDATE {} SET last_synced_at = MAX(?1, updated_at) WHERE id = ?2 AND updated_at = ?3",
            R::TABLE.name()
        ))?;
        let mut marked = 0;
        for (id, updated_at) in pushed {
            marked += stmt.execute(params![
                now.timestamp_micros(),
                id.as_str(),
                updated_at.timestamp_micros()
            ])?;
        }
        Ok(marked)
    }

    /// Apply a row received from the remote store under last-write-wins.
    pub fn apply_remote(&self, mut incoming: R, now: DateTime<Utc>) -> Result<ApplyOutcome> {
        if let Some(current) = self.get(incoming.id())? {
            if current.same_content(&incoming) && !current.is_dirty() {
                return Ok(ApplyOutcome::Unchanged);
            }
            let local_updated_at = current.stamps().updated_at;
            let incoming_updated_at = incoming.stamps().updated_at;
            if local_updated_at > incoming_updated_at {
                ConflictRepository::new(self.conn).record(
                    R::TABLE,
                    incoming.id(),
                    local_updated_at,
                    incoming_updated_at,
                    now,
                )?;
                tracing::debug!(
                    "Kept newer local {} {} over incoming row",
                    R::TABLE,
                    incoming.id()
                );
                return Ok(ApplyOutcome::Rejected);
            }
        }

        let stamps = incoming.stamps_mut();
        stamps.last_synced_at = Some(synced_stamp(now, stamps.updated_at));
        self.upsert(&incoming)?;
        Ok(ApplyOutcome::Applied)
    }
}

impl<R: LocalRecord + NamedRecord> RecordRepository<'_, R> {
    /// Rows whose normalized name equals `name_key`, active ones first
    pub fn find_by_name_key(&self, name_key: &str) -> Result<Vec<R>> {
        self.query(
            "WHERE name_key = ?1 ORDER BY active DESC, created_at ASC, id ASC",
            params![name_key],
        )
    }

    /// Rows carrying a canonical remote id
    pub fn list_with_remote_id(&self) -> Result<Vec<R>> {
        self.query("WHERE remote_id IS NOT NULL", [])
    }
}

impl RecordRepository<'_, Transaction> {
    /// Transactions booked on `day` with the given kind
    pub fn for_day(&self, day: &str, kind: &str) -> Result<Vec<Transaction>> {
        self.query(
            "WHERE date_key = ?1 AND kind = ?2 ORDER BY created_at ASC, id ASC",
            params![day, kind],
        )
    }
}

impl RecordRepository<'_, LineItem> {
    /// Line items of one transaction
    pub fn for_transaction(&self, transaction_id: &RecordId) -> Result<Vec<LineItem>> {
        self.query(
            "WHERE transaction_id = ?1 ORDER BY created_at ASC, id ASC",
            params![transaction_id.as_str()],
        )
    }
}

/// Child tables and columns holding references to rows of `table`
pub const fn child_references(table: Table) -> &'static [(Table, &'static str)] {
    match table {
        Table::Clients => &[
            (Table::Transactions, "client_id"),
            (Table::Employees, "client_id"),
        ],
        Table::Products => &[(Table::LineItems, "product_id")],
        Table::Employees | Table::Transactions | Table::LineItems => &[],
    }
}

/// Point child references from `from` to `to`, bumping `updated_at` so the
/// children upload again. Returns the number of rows touched.
pub fn remap_references(
    conn: &Connection,
    table: Table,
    from: &RecordId,
    to: &RecordId,
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut remapped = 0;
    for (child, column) in child_references(table) {
        remapped += conn.execute(
            &format!(
                "UPDATE {child} SET {column} = ?1, updated_at = MAX(?2, updated_at + 1)
                 WHERE {column} = ?3"
            ),
            params![to.as_str(), now.timestamp_micros(), from.as_str()],
        )?;
    }
    Ok(remapped)
}

fn conversion_error(column: &str, message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        Type::Text,
        format!("{column}: {}", message.into()).into(),
    )
}

fn read_time(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let micros: i64 = row.get(column)?;
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| conversion_error(column, format!("timestamp out of range: {micros}")))
}

fn read_parsed<T: FromStr<Err = String>>(row: &Row<'_>, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    raw.parse().map_err(|message: String| conversion_error(column, message))
}

fn read_id(row: &Row<'_>, column: &str) -> rusqlite::Result<RecordId> {
    row.get::<_, String>(column).map(RecordId::from)
}

fn read_optional_id(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<RecordId>> {
    Ok(row.get::<_, Option<String>>(column)?.map(RecordId::from))
}

fn read_stamps(row: &Row<'_>) -> rusqlite::Result<SyncStamps> {
    let last_synced_at = match row.get::<_, Option<i64>>("last_synced_at")? {
        Some(_) => Some(read_time(row, "last_synced_at")?),
        None => None,
    };
    Ok(SyncStamps {
        created_at: read_time(row, "created_at")?,
        updated_at: read_time(row, "updated_at")?,
        last_synced_at,
    })
}

fn text(value: impl Into<String>) -> SqlValue {
    SqlValue::Text(value.into())
}

fn optional_text(value: Option<&str>) -> SqlValue {
    value.map_or(SqlValue::Null, text)
}

fn stamp_values(stamps: &SyncStamps) -> [SqlValue; 3] {
    [
        SqlValue::Integer(stamps.created_at.timestamp_micros()),
        SqlValue::Integer(stamps.updated_at.timestamp_micros()),
        stamps
            .last_synced_at
            .map_or(SqlValue::Null, |synced| SqlValue::Integer(synced.timestamp_micros())),
    ]
}

impl LocalRecord for Client {
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "name_key",
        "kind",
        "active",
        "remote_id",
        "created_at",
        "updated_at",
        "last_synced_at",
    ];

    fn to_params(&self) -> Vec<SqlValue> {
        let mut values = vec![
            text(self.id.as_str()),
            text(self.name.as_str()),
            text(self.name_key()),
            text(self.kind.as_str()),
            SqlValue::Integer(i64::from(self.active)),
            optional_text(self.remote_id.as_ref().map(RecordId::as_str)),
        ];
        values.extend(stamp_values(&self.stamps));
        values
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: read_id(row, "id")?,
            name: row.get("name")?,
            kind: read_parsed(row, "kind")?,
            active: row.get("active")?,
            remote_id: read_optional_id(row, "remote_id")?,
            stamps: read_stamps(row)?,
        })
    }
}

impl LocalRecord for Product {
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "name_key",
        "price",
        "active",
        "remote_id",
        "created_at",
        "updated_at",
        "last_synced_at",
    ];

    fn to_params(&self) -> Vec<SqlValue> {
        let mut values = vec![
            text(self.id.as_str()),
            text(self.name.as_str()),
            text(self.name_key()),
            SqlValue::Real(self.price),
            SqlValue::Integer(i64::from(self.active)),
            optional_text(self.remote_id.as_ref().map(RecordId::as_str)),
        ];
        values.extend(stamp_values(&self.stamps));
        values
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: read_id(row, "id")?,
            name: row.get("name")?,
            price: row.get("price")?,
            active: row.get("active")?,
            remote_id: read_optional_id(row, "remote_id")?,
            stamps: read_stamps(row)?,
        })
    }
}

impl LocalRecord for Transaction {
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "date_key",
        "kind",
        "client_id",
        "preparation_status",
        "reversed",
        "payment_method",
        "created_at",
        "updated_at",
        "last_synced_at",
    ];

    fn to_params(&self) -> Vec<SqlValue> {
        let mut values = vec![
            text(self.id.as_str()),
            text(self.date_key.to_string()),
            text(self.kind.as_str()),
            optional_text(self.client_id.as_ref().map(RecordId::as_str)),
            text(self.preparation_status.as_str()),
            SqlValue::Integer(i64::from(self.reversed)),
            optional_text(self.payment_method.as_deref()),
        ];
        values.extend(stamp_values(&self.stamps));
        values
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: read_id(row, "id")?,
            date_key: read_parsed(row, "date_key")?,
            kind: read_parsed(row, "kind")?,
            client_id: read_optional_id(row, "client_id")?,
            preparation_status: read_parsed(row, "preparation_status")?,
            reversed: row.get("reversed")?,
            payment_method: row.get("payment_method")?,
            stamps: read_stamps(row)?,
        })
    }
}

impl LocalRecord for LineItem {
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "transaction_id",
        "product_id",
        "product_name",
        "quantity",
        "unit_price",
        "created_at",
        "updated_at",
        "last_synced_at",
    ];

    fn to_params(&self) -> Vec<SqlValue> {
        let mut values = vec![
            text(self.id.as_str()),
            text(self.transaction_id.as_str()),
            optional_text(self.product_id.as_ref().map(RecordId::as_str)),
            text(self.product_name.as_str()),
            SqlValue::Integer(i64::from(self.quantity)),
            SqlValue::Real(self.unit_price),
        ];
        values.extend(stamp_values(&self.stamps));
        values
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: read_id(row, "id")?,
            transaction_id: read_id(row, "transaction_id")?,
            product_id: read_optional_id(row, "product_id")?,
            product_name: row.get("product_name")?,
            quantity: row.get("quantity")?,
            unit_price: row.get("unit_price")?,
            stamps: read_stamps(row)?,
        })
    }
}

impl LocalRecord for Employee {
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "client_id",
        "active",
        "created_at",
        "updated_at",
        "last_synced_at",
    ];

    fn to_params(&self) -> Vec<SqlValue> {
        let mut values = vec![
            text(self.id.as_str()),
            text(self.name.as_str()),
            optional_text(self.client_id.as_ref().map(RecordId::as_str)),
            SqlValue::Integer(i64::from(self.active)),
        ];
        values.extend(stamp_values(&self.stamps));
        values
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: read_id(row, "id")?,
            name: row.get("name")?,
            client_id: read_optional_id(row, "client_id")?,
            active: row.get("active")?,
            stamps: read_stamps(row)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{DayKey, TransactionKind};
    use crate::util::parse_timestamp;
    use pretty_assertions::assert_eq;

    fn at(value: &str) -> DateTime<Utc> {
        parse_timestamp(value).unwrap()
    }

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_upsert_and_get_round_trip() {
        let db = setup();
        let repo = RecordRepository::<Transaction>::new(db.connection());
        let mut tx = Transaction::new(
            "2024-03-01".parse::<DayKey>().unwrap(),
            TransactionKind::Sale,
            Some(RecordId::from("c-1")),
            at("2024-03-01T10:00:00.123456Z"),
        );
        tx.payment_method = Some("cash".into());

        repo.upsert(&tx).unwrap();

        assert_eq!(repo.get(&tx.id).unwrap(), Some(tx));
        assert_eq!(repo.count().unwrap(), 1);
    }

    #[test]
    fn test_dirty_detection_and_mark_synced() {
        let db = setup();
        let repo = RecordRepository::<Product>::new(db.connection());
        let product = Product::new("Tea", 2.0, at("2024-03-01T10:00:00Z"));
        repo.upsert(&product).unwrap();
        assert_eq!(repo.list_dirty().unwrap().len(), 1);

        let marked = repo
            .mark_synced(
                &[(product.id.clone(), product.stamps.updated_at)],
                at("2024-03-01T10:00:05Z"),
            )
            .unwrap();
        assert_eq!(marked, 1);
        assert!(repo.list_dirty().unwrap().is_empty());
        assert_eq!(repo.count_dirty().unwrap(), 0);
    }

    #[test]
    fn test_mark_synced_skips_rows_changed_in_flight() {
        let db = setup();
        let repo = RecordRepository::<Product>::new(db.connection());
        let mut product = Product::new("Tea", 2.0, at("2024-03-01T10:00:00Z"));
        repo.upsert(&product).unwrap();
        let pushed = product.stamps.updated_at;

        product.price = 2.5;
        product.stamps.touch(at("2024-03-01T10:00:01Z"));
        repo.upsert(&product).unwrap();

        let marked = repo
            .mark_synced(&[(product.id.clone(), pushed)], at("2024-03-01T10:00:02Z"))
            .unwrap();
        assert_eq!(marked, 0);
        assert_eq!(repo.list_dirty().unwrap(), vec![product]);
    }

    #[test]
    fn test_mark_synced_never_stamps_before_update() {
        let db = setup();
        let repo = RecordRepository::<Client>::new(db.connection());
        let client = Client::new("Ana", at("2024-03-01T10:05:00Z"));
        repo.upsert(&client).unwrap();

        repo.mark_synced(
            &[(client.id.clone(), client.stamps.updated_at)],
            at("2024-03-01T10:00:00Z"),
        )
        .unwrap();

        let stored = repo.get(&client.id).unwrap().unwrap();
        assert_eq!(stored.stamps.last_synced_at, Some(client.stamps.updated_at));
        assert!(!stored.is_dirty());
    }

    #[test]
    fn test_apply_remote_is_idempotent() {
        let db = setup();
        let repo = RecordRepository::<Client>::new(db.connection());
        let client = Client::new("Ana", at("2024-03-01T10:00:00Z"));

        let first = repo
            .apply_remote(client.clone(), at("2024-03-01T10:01:00Z"))
            .unwrap();
        let after_first = repo.get(&client.id).unwrap();
        let second = repo
            .apply_remote(client.clone(), at("2024-03-01T10:02:00Z"))
            .unwrap();

        assert_eq!(first, ApplyOutcome::Applied);
        assert_eq!(second, ApplyOutcome::Unchanged);
        assert_eq!(repo.get(&client.id).unwrap(), after_first);
    }

    #[test]
    fn test_apply_remote_keeps_newer_local_row() {
        let db = setup();
        let repo = RecordRepository::<Product>::new(db.connection());
        let mut local = Product::new("Tea", 2.0, at("2024-03-01T10:00:00Z"));
        local.stamps.touch(at("2024-03-01T10:10:00Z"));
        repo.upsert(&local).unwrap();

        let mut incoming = local.clone();
        incoming.price = 9.0;
        incoming.stamps.updated_at = at("2024-03-01T10:05:00Z");

        let outcome = repo
            .apply_remote(incoming, at("2024-03-01T10:11:00Z"))
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::Rejected);
        assert_eq!(repo.get(&local.id).unwrap().unwrap().price, 2.0);
        let conflicts = ConflictRepository::new(db.connection()).list(10).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].record_id, local.id.as_str());
    }

    #[test]
    fn test_apply_remote_equal_timestamps_take_incoming() {
        let db = setup();
        let repo = RecordRepository::<Product>::new(db.connection());
        let local = Product::new("Tea", 2.0, at("2024-03-01T10:00:00Z"));
        repo.upsert(&local).unwrap();

        let mut incoming = local.clone();
        incoming.price = 3.0;

        let outcome = repo
            .apply_remote(incoming, at("2024-03-01T10:01:00Z"))
            .unwrap();
        let stored = repo.get(&local.id).unwrap().unwrap();

        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(stored.price, 3.0);
        assert!(!stored.is_dirty());
    }

    #[test]
    fn test_find_by_name_key_ignores_case_and_spacing() {
        let db = setup();
        let repo = RecordRepository::<Product>::new(db.connection());
        let now = at("2024-03-01T10:00:00Z");
        repo.upsert(&Product::new("Iced  Coffee", 3.0, now)).unwrap();
        repo.upsert(&Product::new("iced coffee ", 3.0, now)).unwrap();
        repo.upsert(&Product::new("Tea", 3.0, now)).unwrap();

        assert_eq!(repo.find_by_name_key("iced coffee").unwrap().len(), 2);
    }

    #[test]
    fn test_remap_references_bumps_children() {
        let db = setup();
        let now = at("2024-03-01T10:00:00Z");
        let tx = Transaction::new(
            "2024-03-01".parse().unwrap(),
            TransactionKind::Sale,
            Some(RecordId::from("L1")),
            now,
        );
        let transactions = RecordRepository::<Transaction>::new(db.connection());
        transactions.upsert(&tx).unwrap();
        transactions
            .mark_synced(&[(tx.id.clone(), now)], now)
            .unwrap();

        let later = at("2024-03-01T10:00:30Z");
        let remapped = remap_references(
            db.connection(),
            Table::Clients,
            &RecordId::from("L1"),
            &RecordId::from("R2"),
            later,
        )
        .unwrap();

        let stored = transactions.get(&tx.id).unwrap().unwrap();
        assert_eq!(remapped, 1);
        assert_eq!(stored.client_id, Some(RecordId::from("R2")));
        assert_eq!(stored.stamps.updated_at, later);
        assert!(stored.is_dirty());
    }

    #[test]
    fn test_remap_client_reaches_employees() {
        let db = setup();
        let now = at("2024-03-01T10:00:00Z");
        let employees = RecordRepository::<Employee>::new(db.connection());
        let attached = Employee::new("Carla", Some(RecordId::from("L1")), now);
        let unattached = Employee::new("Davi", None, now);
        employees.upsert(&attached).unwrap();
        employees.upsert(&unattached).unwrap();
        employees
            .mark_synced(
                &[(attached.id.clone(), now), (unattached.id.clone(), now)],
                now,
            )
            .unwrap();

        let later = at("2024-03-01T10:00:30Z");
        let remapped = remap_references(
            db.connection(),
            Table::Clients,
            &RecordId::from("L1"),
            &RecordId::from("R2"),
            later,
        )
        .unwrap();

        assert_eq!(remapped, 1);
        let stored = employees.get(&attached.id).unwrap().unwrap();
        assert_eq!(stored.client_id, Some(RecordId::from("R2")));
        assert!(stored.is_dirty());
        assert_eq!(employees.list_dirty().unwrap(), vec![stored]);
    }

    #[test]
    fn test_delete() {
        let db = setup();
        let repo = RecordRepository::<LineItem>::new(db.connection());
        let product = Product::new("Tea", 2.0, at("2024-03-01T10:00:00Z"));
        let item = LineItem::for_product(&RecordId::from("t-1"), &product, 2, product.stamps.created_at);
        repo.upsert(&item).unwrap();

        assert!(repo.delete(&item.id).unwrap());
        assert!(!repo.delete(&item.id).unwrap());
        assert!(repo.for_transaction(&RecordId::from("t-1")).unwrap().is_empty());
    }
}
