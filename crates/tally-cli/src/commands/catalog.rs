use tally_core::{Client, Employee, Product};

use crate::cli::{ClientCommands, EmployeeCommands, ProductCommands};
use crate::commands::common::{
    format_client_lines, format_employee_lines, format_product_lines, join_words,
    resolve_employee, resolve_named, short_id, Context,
};
use crate::error::CliError;

pub async fn run_client(command: ClientCommands, context: &Context) -> Result<(), CliError> {
    let ledger = context.ledger().await?;
    match command {
        ClientCommands::Add { name } => {
            let client = ledger.create_client(&join_words(&name)).await?;
            println!("{}", client.id);
            context.push_after_write(&ledger).await;
        }
        ClientCommands::List { all, json } => {
            let clients = ledger.list_clients(all).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&clients)?);
            } else if clients.is_empty() {
                println!("No clients yet.");
            } else {
                for line in format_client_lines(&clients) {
                    println!("{line}");
                }
            }
        }
        ClientCommands::Rename { client, name } => {
            let clients: Vec<Client> = ledger.list_clients(true).await?;
            let target = resolve_named(&clients, &client, "client")?;
            let renamed = ledger.rename_client(&target.id, &join_words(&name)).await?;
            println!("{}  {}", short_id(&renamed.id), renamed.name);
            context.push_after_write(&ledger).await;
        }
        ClientCommands::Deactivate { client } => {
            let clients: Vec<Client> = ledger.list_clients(true).await?;
            let target = resolve_named(&clients, &client, "client")?;
            let client = ledger.deactivate_client(&target.id).await?;
            println!("Deactivated {}", client.name);
            context.push_after_write(&ledger).await;
        }
    }
    Ok(())
}

pub async fn run_product(command: ProductCommands, context: &Context) -> Result<(), CliError> {
    let ledger = context.ledger().await?;
    match command {
        ProductCommands::Add { name, price } => {
            let product = ledger.create_product(&name, price).await?;
            println!("{}", product.id);
            context.push_after_write(&ledger).await;
        }
        ProductCommands::List { all, json } => {
            let products = ledger.list_products(all).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&products)?);
            } else if products.is_empty() {
                println!("No products yet.");
            } else {
                for line in format_product_lines(&products) {
                    println!("{line}");
                }
            }
        }
        ProductCommands::Price { product, price } => {
            let products: Vec<Product> = ledger.list_products(true).await?;
            let target = resolve_named(&products, &product, "product")?;
            let product = ledger.set_product_price(&target.id, price).await?;
            println!("{} now costs {:.2}", product.name, product.price);
            context.push_after_write(&ledger).await;
        }
        ProductCommands::Deactivate { product } => {
            let products: Vec<Product> = ledger.list_products(true).await?;
            let target = resolve_named(&products, &product, "product")?;
            let product = ledger.deactivate_product(&target.id).await?;
            println!("Deactivated {}", product.name);
            context.push_after_write(&ledger).await;
        }
    }
    Ok(())
}

pub async fn run_employee(command: EmployeeCommands, context: &Context) -> Result<(), CliError> {
    let ledger = context.ledger().await?;
    match command {
        EmployeeCommands::Add { name, client } => {
            let client_id = match client {
                Some(query) => {
                    let clients: Vec<Client> = ledger.list_clients(true).await?;
                    Some(resolve_named(&clients, &query, "client")?.id.clone())
                }
                None => None,
            };
            let employee = ledger
                .create_employee(&join_words(&name), client_id.as_ref())
                .await?;
            println!("{}", employee.id);
            context.push_after_write(&ledger).await;
        }
        EmployeeCommands::List { all, json } => {
            let employees = ledger.list_employees(all).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&employees)?);
            } else if employees.is_empty() {
                println!("No employees yet.");
            } else {
                let clients = ledger.list_clients(true).await?;
                for line in format_employee_lines(&employees, &clients) {
                    println!("{line}");
                }
            }
        }
        EmployeeCommands::Deactivate { employee } => {
            let employees: Vec<Employee> = ledger.list_employees(true).await?;
            let target = resolve_employee(&employees, &employee)?;
            let employee = ledger.deactivate_employee(&target.id).await?;
            println!("Deactivated {}", employee.name);
            context.push_after_write(&ledger).await;
        }
    }
    Ok(())
}
