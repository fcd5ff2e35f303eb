use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use tally_core::config::{default_config_path, TallyConfig};
use tally_core::db::{LAST_PULL_AT, LAST_PUSH_AT, LAST_SYNC_ERROR};
use tally_core::models::{NamedRecord, Record};
use tally_core::projection::{DailyLedger, ViewCache};
use tally_core::util::normalize_name;
use tally_core::{
    Client, DayKey, Employee, LedgerService, LocalStore, Product, RecordId, SyncConflict,
    SyncEngine, Transaction,
};

use crate::error::CliError;

/// `NAME`, `NAME x QTY` (also `×` or `*`)
const ORDER_LINE_PATTERN: &str = r"^\s*(?P<name>.+?)(?:\s+[xX×*]\s*(?P<qty>\d+))?\s*$";

/// Everything a command needs to reach the local and remote stores.
pub struct Context {
    pub config: TallyConfig,
    pub config_path: PathBuf,
    pub db_path: PathBuf,
    pub offline: bool,
}

impl Context {
    pub fn load(
        config_path: Option<PathBuf>,
        db_path: Option<PathBuf>,
        offline: bool,
    ) -> Result<Self, CliError> {
        let config_path = match config_path {
            Some(path) => path,
            None => default_config_path()?,
        };
        let mut config = TallyConfig::load_from_path(&config_path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        let db_path = config.resolve_db_path(db_path)?;
        tracing::debug!(
            "Loaded config from {}; database at {}",
            config_path.display(),
            db_path.display()
        );
        Ok(Self {
            config,
            config_path,
            db_path,
            offline,
        })
    }

    pub async fn open_store(&self) -> Result<LocalStore, CliError> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(LocalStore::open_path(self.db_path.clone()).await?)
    }

    pub async fn ledger(&self) -> Result<LedgerService, CliError> {
        Ok(LedgerService::new(self.open_store().await?))
    }

    pub fn engine(&self, store: LocalStore) -> Result<SyncEngine, CliError> {
        if !self.config.is_remote_configured() {
            return Err(CliError::SyncNotConfigured);
        }
        let remote = self.config.remote()?;
        Ok(SyncEngine::new(
            store,
            Arc::new(remote),
            self.config.engine_options(),
        ))
    }

    pub fn engine_with_view(&self, store: LocalStore, view: ViewCache) -> Result<SyncEngine, CliError> {
        if !self.config.is_remote_configured() {
            return Err(CliError::SyncNotConfigured);
        }
        let remote = self.config.remote()?;
        Ok(SyncEngine::with_view(
            store,
            Arc::new(remote),
            self.config.engine_options(),
            view,
        ))
    }

    /// Upload right after a local write. The write already succeeded, so a
    /// failed upload is only reported.
    pub async fn push_after_write(&self, ledger: &LedgerService) {
        if self.offline || !self.config.is_remote_configured() {
            return;
        }
        let engine = match self.engine(ledger.store().clone()) {
            Ok(engine) => engine,
            Err(error) => {
                eprintln!("Saved locally; upload skipped: {error}");
                return;
            }
        };
        let report = engine.push().await;
        tracing::debug!("Push after write: {report}");
        if !report.is_success() {
            eprintln!("Saved locally; {report}. It will be retried on the next sync.");
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SyncStatusItem {
    pub remote_configured: bool,
    pub pending: BTreeMap<String, usize>,
    pub last_push_at: Option<String>,
    pub last_pull_at: Option<String>,
    pub last_error: Option<String>,
}

pub async fn sync_status(store: &LocalStore, remote_configured: bool) -> Result<SyncStatusItem, CliError> {
    let pending = store
        .dirty_counts()
        .await?
        .into_iter()
        .map(|(table, count)| (table.name().to_string(), count))
        .collect();
    Ok(SyncStatusItem {
        remote_configured,
        pending,
        last_push_at: store.setting(LAST_PUSH_AT).await?,
        last_pull_at: store.setting(LAST_PULL_AT).await?,
        last_error: store.setting(LAST_SYNC_ERROR).await?,
    })
}

pub fn parse_day(value: Option<&str>) -> Result<DayKey, CliError> {
    match value {
        Some(value) => value
            .parse()
            .map_err(|error| CliError::InvalidArgument(format!("invalid day: {error}"))),
        None => Ok(DayKey::today()),
    }
}

pub fn join_words(words: &[String]) -> String {
    words.join(" ").trim().to_string()
}

pub fn order_line_pattern() -> Result<Regex, CliError> {
    Regex::new(ORDER_LINE_PATTERN).map_err(|error| CliError::InvalidArgument(error.to_string()))
}

/// Split an order line into the product reference and its quantity (1 when omitted).
pub fn parse_order_line(pattern: &Regex, line: &str) -> Result<(String, u32), CliError> {
    let captures = pattern
        .captures(line)
        .ok_or_else(|| CliError::InvalidArgument(format!("invalid order line '{line}'")))?;
    let name = captures
        .name("name")
        .map(|name| name.as_str().trim().to_string())
        .unwrap_or_default();
    let quantity = match captures.name("qty") {
        Some(qty) => qty.as_str().parse().map_err(|_| {
            CliError::InvalidArgument(format!("quantity in '{line}' is too large"))
        })?,
        None => 1,
    };
    Ok((name, quantity))
}

/// Find a client or product by exact ID, normalized name, or unique ID prefix.
/// Active records win name matches.
pub fn resolve_named<'a, R: NamedRecord>(
    records: &'a [R],
    query: &str,
    kind: &'static str,
) -> Result<&'a R, CliError> {
    resolve_by(records, query, kind, |record| {
        (record.id(), record.name_key(), record.is_active())
    })
}

/// Same lookup rules as [`resolve_named`] for employees.
pub fn resolve_employee<'a>(
    employees: &'a [Employee],
    query: &str,
) -> Result<&'a Employee, CliError> {
    resolve_by(employees, query, "employee", |employee| {
        (&employee.id, normalize_name(&employee.name), employee.active)
    })
}

fn resolve_by<'a, R>(
    records: &'a [R],
    query: &str,
    kind: &'static str,
    describe: impl Fn(&R) -> (&RecordId, String, bool),
) -> Result<&'a R, CliError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(CliError::InvalidArgument(format!("{kind} cannot be empty")));
    }
    if let Some(record) = records.iter().find(|record| describe(record).0.as_str() == query) {
        return Ok(record);
    }

    let key = normalize_name(query);
    let mut by_name: Vec<&R> = records
        .iter()
        .filter(|record| describe(record).1 == key)
        .collect();
    by_name.sort_by_key(|record| !describe(record).2);
    if let Some(record) = by_name.first() {
        return Ok(*record);
    }

    let by_prefix: Vec<&R> = records
        .iter()
        .filter(|record| describe(record).0.as_str().starts_with(query))
        .collect();
    match by_prefix.as_slice() {
        [record] => Ok(*record),
        [] => Err(CliError::NotFound {
            kind,
            query: query.to_string(),
        }),
        matches => Err(CliError::Ambiguous(format!(
            "{kind} ID prefix '{query}' matches {} records",
            matches.len()
        ))),
    }
}

pub async fn resolve_transaction(store: &LocalStore, query: &str) -> Result<Transaction, CliError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(CliError::InvalidArgument("transaction ID cannot be empty".into()));
    }
    if let Some(transaction) = store.get::<Transaction>(&RecordId::from(query)).await? {
        return Ok(transaction);
    }
    let mut matches: Vec<Transaction> = store
        .list_all::<Transaction>()
        .await?
        .into_iter()
        .filter(|transaction| transaction.id.as_str().starts_with(query))
        .collect();
    match matches.len() {
        0 => Err(CliError::NotFound {
            kind: "transaction",
            query: query.to_string(),
        }),
        1 => Ok(matches.remove(0)),
        count => Err(CliError::Ambiguous(format!(
            "transaction ID prefix '{query}' matches {count} transactions"
        ))),
    }
}

pub fn short_id(id: &RecordId) -> &str {
    let id = id.as_str();
    id.char_indices().nth(8).map_or(id, |(end, _)| &id[..end])
}

pub fn format_money(amount: f64) -> String {
    format!("{amount:.2}")
}

pub fn format_client_lines(clients: &[Client]) -> Vec<String> {
    clients
        .iter()
        .map(|client| {
            let mut line = format!("{}  {}", short_id(&client.id), client.name);
            if !client.active {
                line.push_str(" (inactive)");
            }
            if client.is_dirty() {
                line.push_str(" *");
            }
            line
        })
        .collect()
}

/// Employees with the client they are attached to, when known
pub fn format_employee_lines(employees: &[Employee], clients: &[Client]) -> Vec<String> {
    employees
        .iter()
        .map(|employee| {
            let mut line = format!("{}  {}", short_id(&employee.id), employee.name);
            if let Some(client_id) = &employee.client_id {
                let client = clients
                    .iter()
                    .find(|client| client.id == *client_id)
                    .map_or_else(
                        || short_id(client_id).to_string(),
                        |client| client.name.clone(),
                    );
                line.push_str(&format!(" @ {client}"));
            }
            if !employee.active {
                line.push_str(" (inactive)");
            }
            if employee.is_dirty() {
                line.push_str(" *");
            }
            line
        })
        .collect()
}

pub fn format_product_lines(products: &[Product]) -> Vec<String> {
    products
        .iter()
        .map(|product| {
            let mut line = format!(
                "{}  {:<24} {:>8}",
                short_id(&product.id),
                product.name,
                format_money(product.price)
            );
            if !product.active {
                line.push_str(" (inactive)");
            }
            if product.is_dirty() {
                line.push_str(" *");
            }
            line
        })
        .collect()
}

pub fn format_ledger_lines(ledger: &DailyLedger) -> Vec<String> {
    let mut lines = vec![format!(
        "{}: {} orders, {} pending, total {}",
        ledger.day,
        ledger.entries.len(),
        ledger.pending(),
        format_money(ledger.total)
    )];
    for entry in &ledger.entries {
        let state = if entry.is_reversed() {
            "VOID".to_string()
        } else {
            entry.transaction.preparation_status.to_string()
        };
        lines.push(format!(
            "{}  {:<7} {:<20} {:>8}",
            short_id(entry.id()),
            state,
            entry.client_name,
            format_money(entry.total)
        ));
        for item in &entry.items {
            lines.push(format!(
                "    {} x {} @ {}",
                item.quantity,
                item.product_name,
                format_money(item.unit_price)
            ));
        }
    }
    lines
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {}  table={} record={} local={} incoming={}",
                conflict.resolved_at,
                conflict.strategy,
                conflict.table_name,
                conflict.record_id,
                conflict.local_updated_at,
                conflict.incoming_updated_at
            )
        })
        .collect()
}

pub fn format_sync_status_lines(status: &SyncStatusItem) -> Vec<String> {
    let pending: usize = status.pending.values().sum();
    let mut lines = vec![if status.remote_configured {
        format!("Pending uploads: {pending}")
    } else {
        format!("Pending uploads: {pending} (remote not configured)")
    }];
    for (table, count) in status.pending.iter().filter(|(_, count)| **count > 0) {
        lines.push(format!("  {table}: {count}"));
    }
    lines.push(format!(
        "Last push: {}",
        status.last_push_at.as_deref().unwrap_or("never")
    ));
    lines.push(format!(
        "Last pull: {}",
        status.last_pull_at.as_deref().unwrap_or("never")
    ));
    if let Some(error) = &status.last_error {
        lines.push(format!("Last error: {error}"));
    }
    lines
}
