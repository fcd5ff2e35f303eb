use tally_core::models::{PreparationStatus, TransactionKind};
use tally_core::services::{OrderLine, OrderRequest};
use tally_core::{Client, Product};

use crate::cli::PrepStatus;
use crate::commands::common::{
    format_money, order_line_pattern, parse_day, parse_order_line, resolve_named,
    resolve_transaction, short_id, Context,
};
use crate::error::CliError;

pub struct OrderArgs {
    pub lines: Vec<String>,
    pub client: Option<String>,
    pub day: Option<String>,
    pub purchase: bool,
    pub pay: Option<String>,
}

pub async fn run_order(args: OrderArgs, context: &Context) -> Result<(), CliError> {
    let ledger = context.ledger().await?;
    let day = parse_day(args.day.as_deref())?;

    let products: Vec<Product> = ledger.list_products(true).await?;
    let pattern = order_line_pattern()?;
    let mut lines = Vec::with_capacity(args.lines.len());
    for raw in &args.lines {
        let (reference, quantity) = parse_order_line(&pattern, raw)?;
        let product = resolve_named(&products, &reference, "product")?;
        lines.push(OrderLine {
            product_id: product.id.clone(),
            quantity,
        });
    }

    let client_id = match args.client.as_deref() {
        Some(query) => {
            let clients: Vec<Client> = ledger.list_clients(true).await?;
            Some(resolve_named(&clients, query, "client")?.id.clone())
        }
        None => None,
    };

    let placed = ledger
        .place_order(OrderRequest {
            day: Some(day),
            kind: if args.purchase {
                TransactionKind::Purchase
            } else {
                TransactionKind::Sale
            },
            client_id,
            lines,
            payment_method: args.pay,
        })
        .await?;
    println!(
        "{}  {} lines, total {}",
        placed.transaction.id,
        placed.items.len(),
        format_money(placed.total())
    );
    context.push_after_write(&ledger).await;
    Ok(())
}

pub async fn run_void(id: &str, context: &Context) -> Result<(), CliError> {
    let ledger = context.ledger().await?;
    let transaction = resolve_transaction(ledger.store(), id).await?;
    let reversed = ledger.reverse_transaction(&transaction.id).await?;
    println!("Voided {} on {}", short_id(&reversed.id), reversed.date_key);
    context.push_after_write(&ledger).await;
    Ok(())
}

pub async fn run_status(id: &str, status: PrepStatus, context: &Context) -> Result<(), CliError> {
    let ledger = context.ledger().await?;
    let transaction = resolve_transaction(ledger.store(), id).await?;
    let status = match status {
        PrepStatus::Pending => PreparationStatus::Pending,
        PrepStatus::Ready => PreparationStatus::Ready,
    };
    let updated = ledger
        .set_preparation_status(&transaction.id, status)
        .await?;
    println!("{}  {}", short_id(&updated.id), updated.preparation_status);
    context.push_after_write(&ledger).await;
    Ok(())
}
