use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use uuid::Uuid;

/// AI API Framework: metered gateway for Azure AI services
#[derive(Parser)]
#[command(name = "aiapi", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to bind (defaults to AIAPI_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage users and their API keys
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Manage the endpoint catalogue
    Endpoint {
        #[command(subcommand)]
        command: EndpointCommands,
    },

    /// Inspect or adjust monthly credit balances
    Balance {
        #[command(subcommand)]
        command: BalanceCommands,
    },
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Create a user and print its API key
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        /// 0 = admin, 1..=5 = metered tiers
        #[arg(long)]
        scope: i16,
        #[arg(long)]
        department: Option<String>,
    },
    /// List users
    List {
        #[arg(long, default_value = "200")]
        limit: i64,
    },
    /// Deactivate a user
    Disable {
        #[arg(long)]
        id: Uuid,
    },
}

#[derive(Subcommand)]
pub enum EndpointCommands {
    /// Register a billable endpoint
    Create {
        #[arg(long)]
        path: String,
        #[arg(long)]
        cost: Decimal,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List all endpoints, including inactive ones
    List,
}

#[derive(Subcommand)]
pub enum BalanceCommands {
    /// Show a user's balance for the current month
    Show {
        #[arg(long)]
        user_id: Uuid,
    },
    /// Apply a signed credit adjustment to the current month
    Adjust {
        #[arg(long)]
        user_id: Uuid,
        #[arg(long, allow_hyphen_values = true)]
        amount: Decimal,
        #[arg(long)]
        description: Option<String>,
    },
}
