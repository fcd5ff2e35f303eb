//! Mutating ledger operations: validate, write locally, refresh the view,
//! then hand the change to the uploader.

use serde_json::{json, Value};

use crate::db::LocalRecord;
use crate::error::{Error, Result};
use crate::models::{
    validate_price, Client, DayKey, Employee, LineItem, NamedRecord, PreparationStatus, Product,
    RecordId, Transaction, TransactionKind,
};
use crate::projection::{build_daily_ledger, DailyLedger, ViewCache};
use crate::services::LocalStore;
use crate::sync::{AffectedScope, NetworkMonitor, SyncEngine};
use crate::util::{normalize_text_option, now};

/// One requested line of an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderLine {
    pub product_id: RecordId,
    pub quantity: u32,
}

/// Input of [`LedgerService::place_order`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OrderRequest {
    pub day: Option<DayKey>,
    pub kind: TransactionKind,
    /// `None` books the order on the walk-in client
    pub client_id: Option<RecordId>,
    pub lines: Vec<OrderLine>,
    pub payment_method: Option<String>,
}

/// A placed order
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub transaction: Transaction,
    pub items: Vec<LineItem>,
}

impl PlacedOrder {
    pub fn total(&self) -> f64 {
        self.items.iter().map(LineItem::total).sum()
    }
}

#[derive(Clone)]
struct Uploader {
    engine: SyncEngine,
    network: NetworkMonitor,
}

/// Entry point for every user-initiated change. Cheap to clone.
#[derive(Clone)]
pub struct LedgerService {
    store: LocalStore,
    view: Option<ViewCache>,
    uploader: Option<Uploader>,
}

impl LedgerService {
    /// Local-only service; changes stay dirty until something pushes them.
    pub fn new(store: LocalStore) -> Self {
        Self {
            store,
            view: None,
            uploader: None,
        }
    }

    /// Refresh `view` after each change.
    #[must_use]
    pub fn with_view(mut self, view: ViewCache) -> Self {
        self.view = Some(view);
        self
    }

    /// Start a push after each change while `network` reports online.
    #[must_use]
    pub fn with_sync(mut self, engine: SyncEngine, network: NetworkMonitor) -> Self {
        if self.view.is_none() {
            self.view = engine.view().cloned();
        }
        self.uploader = Some(Uploader { engine, network });
        self
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn view(&self) -> Option<&ViewCache> {
        self.view.as_ref()
    }

    pub async fn list_clients(&self, include_inactive: bool) -> Result<Vec<Client>> {
        let mut clients: Vec<Client> = self.store.list_all().await?;
        clients.retain(|client| include_inactive || client.active);
        clients.sort_by_key(NamedRecord::name_key);
        Ok(clients)
    }

    pub async fn list_products(&self, include_inactive: bool) -> Result<Vec<Product>> {
        let mut products: Vec<Product> = self.store.list_all().await?;
        products.retain(|product| include_inactive || product.active);
        products.sort_by_key(NamedRecord::name_key);
        Ok(products)
    }

    pub async fn create_client(&self, name: &str) -> Result<Client> {
        let name = required_name(name)?;
        let client = Client::new(name, now());
        self.store.put_unique_name(&client).await?;
        tracing::debug!("Created client {} ({})", client.name, client.id);
        self.after_write(AffectedScope::clients()).await;
        Ok(client)
    }

    pub async fn rename_client(&self, id: &RecordId, name: &str) -> Result<Client> {
        let name = required_name(name)?;
        let mut client: Client = self.require(id).await?;
        if client.name == name {
            return Ok(client);
        }
        client.name = name;
        client.stamps.touch(now());
        self.store.put_unique_name(&client).await?;
        self.after_write(AffectedScope::clients()).await;
        Ok(client)
    }

    /// Soft-delete a client; its past orders keep pointing at it.
    pub async fn deactivate_client(&self, id: &RecordId) -> Result<Client> {
        let mut client: Client = self.require(id).await?;
        if !client.active {
            return Ok(client);
        }
        client.active = false;
        client.stamps.touch(now());
        self.store.put(&client).await?;
        tracing::debug!("Deactivated client {}", client.id);
        self.after_write(AffectedScope::clients()).await;
        Ok(client)
    }

    pub async fn create_product(&self, name: &str, price: f64) -> Result<Product> {
        let name = required_name(name)?;
        validate_price(price)?;
        let product = Product::new(name, price, now());
        self.store.put_unique_name(&product).await?;
        tracing::debug!("Created product {} ({})", product.name, product.id);
        self.after_write(AffectedScope::default()).await;
        Ok(product)
    }

    /// Change the price of future orders; placed orders keep their snapshot.
    pub async fn set_product_price(&self, id: &RecordId, price: f64) -> Result<Product> {
        validate_price(price)?;
        let mut product: Product = self.require(id).await?;
        if (product.price - price).abs() < f64::EPSILON {
            return Ok(product);
        }
        product.price = price;
        product.stamps.touch(now());
        self.store.put(&product).await?;
        self.after_write(AffectedScope::default()).await;
        Ok(product)
    }

    pub async fn deactivate_product(&self, id: &RecordId) -> Result<Product> {
        let mut product: Product = self.require(id).await?;
        if !product.active {
            return Ok(product);
        }
        product.active = false;
        product.stamps.touch(now());
        self.store.put(&product).await?;
        tracing::debug!("Deactivated product {}", product.id);
        self.after_write(AffectedScope::default()).await;
        Ok(product)
    }

    pub async fn list_employees(&self, include_inactive: bool) -> Result<Vec<Employee>> {
        let mut employees: Vec<Employee> = self.store.list_all().await?;
        employees.retain(|employee| include_inactive || employee.active);
        employees.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(employees)
    }

    /// Register an employee, optionally attached to an active client.
    pub async fn create_employee(
        &self,
        name: &str,
        client_id: Option<&RecordId>,
    ) -> Result<Employee> {
        let name = required_name(name)?;
        if let Some(client_id) = client_id {
            let client: Client = self.require(client_id).await?;
            if !client.active {
                return Err(Error::InvalidInput(format!(
                    "client '{}' is inactive",
                    client.name
                )));
            }
        }

        let employee = Employee::new(name, client_id.cloned(), now());
        self.store.put(&employee).await?;
        tracing::debug!("Created employee {} ({})", employee.name, employee.id);
        self.after_write(AffectedScope::default()).await;
        Ok(employee)
    }

    pub async fn deactivate_employee(&self, id: &RecordId) -> Result<Employee> {
        let mut employee: Employee = self.require(id).await?;
        if !employee.active {
            return Ok(employee);
        }
        employee.active = false;
        employee.stamps.touch(now());
        self.store.put(&employee).await?;
        tracing::debug!("Deactivated employee {}", employee.id);
        self.after_write(AffectedScope::default()).await;
        Ok(employee)
    }

    /// The walk-in client, created on first use.
    pub async fn ensure_walk_in_client(&self) -> Result<Client> {
        let (client, created) = self.store.ensure_walk_in(now()).await?;
        if created {
            tracing::info!("Seeded walk-in client {}", client.id);
            self.after_write(AffectedScope::clients()).await;
        }
        Ok(client)
    }

    /// Write a transaction and its line items in one local transaction.
    ///
    /// Every line must reference an active product with a positive quantity,
    /// and the client, when given, must be active. Prices are copied from the
    /// products as they are now.
    pub async fn place_order(&self, request: OrderRequest) -> Result<PlacedOrder> {
        if request.lines.is_empty() {
            return Err(Error::InvalidInput("an order needs at least one line".into()));
        }
        if let Some(client_id) = &request.client_id {
            let client: Client = self.require(client_id).await?;
            if !client.active {
                return Err(Error::InvalidInput(format!(
                    "client '{}' is inactive",
                    client.name
                )));
            }
        }

        let mut products = Vec::with_capacity(request.lines.len());
        for line in &request.lines {
            if line.quantity == 0 {
                return Err(Error::InvalidInput(format!(
                    "quantity for product {} must be positive",
                    line.product_id
                )));
            }
            let product: Product = self.require(&line.product_id).await?;
            if !product.active {
                return Err(Error::InvalidInput(format!(
                    "product '{}' is inactive",
                    product.name
                )));
            }
            products.push((product, line.quantity));
        }

        let placed_at = now();
        let day = request.day.unwrap_or_else(DayKey::today);
        let mut transaction = Transaction::new(day, request.kind, request.client_id, placed_at);
        transaction.payment_method = normalize_text_option(request.payment_method);
        let items: Vec<LineItem> = products
            .iter()
            .map(|(product, quantity)| {
                LineItem::for_product(&transaction.id, product, *quantity, placed_at)
            })
            .collect();

        self.store.insert_order(&transaction, &items).await?;
        tracing::debug!(
            "Placed {} {} with {} lines on {day}",
            transaction.kind,
            transaction.id,
            items.len()
        );
        self.after_write(AffectedScope::day(day)).await;
        Ok(PlacedOrder { transaction, items })
    }

    /// Mark a transaction reversed. Reversing twice is a no-op.
    pub async fn reverse_transaction(&self, id: &RecordId) -> Result<Transaction> {
        let mut transaction: Transaction = self.require(id).await?;
        if transaction.reversed {
            return Ok(transaction);
        }
        transaction.reversed = true;
        transaction.stamps.touch(now());
        self.store.put(&transaction).await?;
        tracing::debug!("Reversed transaction {}", transaction.id);
        self.after_patch(&transaction, json!({ "reversed": true })).await;
        Ok(transaction)
    }

    pub async fn set_preparation_status(
        &self,
        id: &RecordId,
        status: PreparationStatus,
    ) -> Result<Transaction> {
        let mut transaction: Transaction = self.require(id).await?;
        if transaction.reversed {
            return Err(Error::InvalidInput(format!(
                "transaction {id} is reversed"
            )));
        }
        if transaction.preparation_status == status {
            return Ok(transaction);
        }
        transaction.preparation_status = status;
        transaction.stamps.touch(now());
        self.store.put(&transaction).await?;
        self.after_patch(&transaction, json!({ "preparation_status": status }))
            .await;
        Ok(transaction)
    }

    /// Ledger of `day`, selecting it in the view when there is one.
    pub async fn daily_ledger(&self, day: DayKey) -> Result<DailyLedger> {
        match &self.view {
            Some(view) => view.select_day(day).await,
            None => {
                let records = self.store.day_records(day, TransactionKind::Sale).await?;
                Ok(build_daily_ledger(day, records))
            }
        }
    }

    async fn require<R: LocalRecord>(&self, id: &RecordId) -> Result<R> {
        self.store
            .get::<R>(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} {id}", R::TABLE)))
    }

    /// Refresh the view and start an upload. The write already succeeded, so
    /// failures here are only logged.
    async fn after_write(&self, scope: AffectedScope) {
        self.refresh_view(&scope).await;
        if let Some(engine) = self.online_engine() {
            engine.spawn_push();
        }
    }

    /// Like [`Self::after_write`] for a change to a few fields of one
    /// transaction: an uploaded row is patched in place, anything else goes
    /// through a regular push.
    async fn after_patch(&self, transaction: &Transaction, patch: Value) {
        self.refresh_view(&AffectedScope::day(transaction.date_key))
            .await;
        let Some(engine) = self.online_engine() else {
            return;
        };
        let engine = engine.clone();
        let id = transaction.id.clone();
        tokio::spawn(async move {
            match engine.patch::<Transaction>(&id, patch).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(error) => tracing::warn!("Patch of transaction {id} failed: {error}"),
            }
            let report = engine.push().await;
            if !report.is_success() {
                tracing::warn!("Background push incomplete: {report}; retrying next cycle");
            }
        });
    }

    async fn refresh_view(&self, scope: &AffectedScope) {
        if let Some(view) = &self.view {
            if let Err(error) = view.refresh_for(scope).await {
                tracing::warn!("Failed to refresh ledger view: {error}");
            }
        }
    }

    fn online_engine(&self) -> Option<&SyncEngine> {
        let uploader = self.uploader.as_ref()?;
        if !uploader.network.is_online() {
            tracing::debug!("Offline, change stays queued for upload");
            return None;
        }
        Some(&uploader.engine)
    }
}

fn required_name(name: &str) -> Result<String> {
    let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return Err(Error::InvalidInput("name cannot be empty".into()));
    }
    Ok(name)
}
