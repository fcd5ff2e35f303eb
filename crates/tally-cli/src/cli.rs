use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Offline-first sales ledger for small counters and kitchens")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to the configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Keep changes local; do not push after writing
    #[arg(long, global = true)]
    pub offline: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage clients
    Client {
        #[command(subcommand)]
        command: ClientCommands,
    },
    /// Manage products
    Product {
        #[command(subcommand)]
        command: ProductCommands,
    },
    /// Manage employees
    Employee {
        #[command(subcommand)]
        command: EmployeeCommands,
    },
    /// Place an order, e.g. `tally order "Coffee x2" Cake`
    Order {
        /// Lines as `NAME`, `NAME x QTY` or `ID x QTY`
        #[arg(required = true)]
        lines: Vec<String>,
        /// Client name or ID (walk-in when omitted)
        #[arg(long, value_name = "CLIENT")]
        client: Option<String>,
        /// Ledger day (`YYYY-MM-DD`, today when omitted)
        #[arg(long, value_name = "DAY")]
        day: Option<String>,
        /// Record a purchase instead of a sale
        #[arg(long)]
        purchase: bool,
        /// Free-text payment method
        #[arg(long, value_name = "METHOD")]
        pay: Option<String>,
    },
    /// Reverse (void) a transaction
    #[command(alias = "reverse")]
    Void {
        /// Transaction ID or unique ID prefix
        id: String,
    },
    /// Change a transaction's preparation status
    Status {
        /// Transaction ID or unique ID prefix
        id: String,
        #[arg(value_enum)]
        status: PrepStatus,
    },
    /// Print the ledger of one day
    Day {
        /// Day (`YYYY-MM-DD`, today when omitted)
        day: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Synchronize with the remote store
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
    /// Run live sync and print the ledger as it changes
    Watch {
        /// Day to follow (today when omitted)
        day: Option<String>,
    },
    /// Inspect or write the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ClientCommands {
    /// Create a client
    Add {
        /// Client name
        #[arg(required = true)]
        name: Vec<String>,
    },
    /// List clients
    List {
        /// Include inactive clients
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rename a client
    Rename {
        /// Client name, ID or unique ID prefix
        client: String,
        /// New name
        #[arg(required = true)]
        name: Vec<String>,
    },
    /// Deactivate a client
    Deactivate {
        /// Client name, ID or unique ID prefix
        client: String,
    },
}

#[derive(Subcommand)]
pub enum ProductCommands {
    /// Create a product
    Add {
        /// Product name
        name: String,
        /// Unit price
        price: f64,
    },
    /// List products
    List {
        /// Include inactive products
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change the price of a product
    Price {
        /// Product name, ID or unique ID prefix
        product: String,
        /// New unit price
        price: f64,
    },
    /// Deactivate a product
    Deactivate {
        /// Product name, ID or unique ID prefix
        product: String,
    },
}

#[derive(Subcommand)]
pub enum EmployeeCommands {
    /// Register an employee
    Add {
        /// Employee name
        #[arg(required = true)]
        name: Vec<String>,
        /// Client the employee consumes under (name or ID)
        #[arg(long, value_name = "CLIENT")]
        client: Option<String>,
    },
    /// List employees
    List {
        /// Include inactive employees
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Deactivate an employee
    Deactivate {
        /// Employee name, ID or unique ID prefix
        employee: String,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum PrepStatus {
    Pending,
    Ready,
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Upload every dirty record
    Push,
    /// Pull remote changes since the last watermark
    Pull,
    /// Show pending uploads and the last sync results
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recently resolved sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration (keys redacted)
    Show,
    /// Write remote settings to the configuration file
    Init {
        /// Supabase project URL
        #[arg(long, value_name = "URL")]
        supabase_url: Option<String>,
        /// Supabase anon/public key
        #[arg(long, value_name = "KEY")]
        supabase_anon_key: Option<String>,
        /// Identity strategy for duplicate names (adopt_canonical, retain_local)
        #[arg(long, value_name = "STRATEGY")]
        identity_strategy: Option<String>,
    },
}
