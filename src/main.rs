use std::net::SocketAddr;
use std::sync::Arc;

use ai_api_framework::cache::TieredCache;
use ai_api_framework::models::balance::{month_start, validate_adjustment, BalanceView, MAX_BALANCE};
use ai_api_framework::models::endpoint::{normalize_path, validate_cost};
use ai_api_framework::models::secret::generate_api_key;
use ai_api_framework::models::user::{validate_email, validate_user_name, Scope};
use ai_api_framework::store::postgres::{Charge, NewUser, PgStore};
use ai_api_framework::{build_router, config, jobs, AppState};
use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "ai-api-framework"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "ai_api_framework=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::User { command }) => {
            let db = PgStore::connect(&cfg.database_url, 2).await?;
            handle_user_command(&db, command).await
        }
        Some(cli::Commands::Endpoint { command }) => {
            let db = PgStore::connect(&cfg.database_url, 2).await?;
            handle_endpoint_command(&db, command).await
        }
        Some(cli::Commands::Balance { command }) => {
            let db = PgStore::connect(&cfg.database_url, 2).await?;
            handle_balance_command(&db, &cfg, command).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: config::Config, port: u16) -> anyhow::Result<()> {
    tracing::info!("Connecting to database...");
    let db = PgStore::connect(&cfg.database_url, cfg.db_max_connections).await?;

    tracing::info!("Running migrations...");
    db.migrate().await?;

    let cache = match &cfg.redis_url {
        Some(url) => {
            tracing::info!("Connecting to Redis...");
            let client = redis::Client::open(url.as_str())?;
            let conn = redis::aio::ConnectionManager::new(client).await?;
            TieredCache::new(conn)
        }
        None => {
            tracing::warn!("REDIS_URL not set, using the in-process cache only");
            TieredCache::local_only()
        }
    };

    let azure = &cfg.azure;
    tracing::info!(
        openai = azure.openai.is_some(),
        speech = azure.speech.is_some(),
        document = azure.document.is_some(),
        cost = azure.cost.is_some(),
        timezone = %cfg.timezone,
        "Azure services configured"
    );

    let state = Arc::new(AppState::new(db, cache, cfg)?);
    let app = build_router(state.clone());

    jobs::cleanup::spawn(state.clone());
    tracing::info!("Background cleanup job started (every 1h)");

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("AI API Framework listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn handle_user_command(db: &PgStore, cmd: cli::UserCommands) -> anyhow::Result<()> {
    match cmd {
        cli::UserCommands::Create {
            name,
            email,
            scope,
            department,
        } => {
            validate_user_name(&name).map_err(anyhow::Error::msg)?;
            validate_email(email.trim()).map_err(anyhow::Error::msg)?;
            let scope = Scope::try_from(scope).map_err(anyhow::Error::msg)?;
            let key = generate_api_key();

            let user = db
                .insert_user(&NewUser {
                    user_name: name.trim().to_string(),
                    email: email.trim().to_string(),
                    department,
                    scope: scope.value(),
                    api_key_hash: key.hash,
                    api_key_prefix: key.display_prefix,
                })
                .await?;
            println!(
                "User created:\n  ID:      {}\n  Name:    {}\n  Scope:   {}\n  API key: {}\n\nStore the key now; it cannot be shown again.",
                user.id, user.user_name, user.scope, key.plaintext
            );
        }
        cli::UserCommands::List { limit } => {
            let users = db.list_users(limit, 0).await?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                println!(
                    "{:<38} {:<20} {:<30} {:<6} {:<8} KEY",
                    "ID", "NAME", "EMAIL", "SCOPE", "ACTIVE"
                );
                for u in users {
                    println!(
                        "{:<38} {:<20} {:<30} {:<6} {:<8} {}...",
                        u.id, u.user_name, u.email, u.scope, u.is_active, u.api_key_prefix
                    );
                }
            }
        }
        cli::UserCommands::Disable { id } => match db.deactivate_user(id).await? {
            Some(user) => println!("User {} disabled.", user.user_name),
            None => println!("User not found."),
        },
    }
    Ok(())
}

async fn handle_endpoint_command(db: &PgStore, cmd: cli::EndpointCommands) -> anyhow::Result<()> {
    match cmd {
        cli::EndpointCommands::Create {
            path,
            cost,
            description,
        } => {
            let path = normalize_path(&path).map_err(anyhow::Error::msg)?;
            let cost = validate_cost(cost).map_err(anyhow::Error::msg)?;
            let row = db.insert_endpoint(&path, description.trim(), cost).await?;
            println!(
                "Endpoint registered:\n  ID:   {}\n  Path: {}\n  Cost: {}",
                row.id, row.path, row.cost
            );
        }
        cli::EndpointCommands::List => {
            let rows = db.list_endpoints(false).await?;
            if rows.is_empty() {
                println!("No endpoints registered.");
            } else {
                println!("{:<38} {:<36} {:<10} {:<8}", "ID", "PATH", "COST", "ACTIVE");
                for e in rows {
                    println!("{:<38} {:<36} {:<10} {:<8}", e.id, e.path, e.cost, e.is_active);
                }
            }
        }
    }
    Ok(())
}

async fn handle_balance_command(
    db: &PgStore,
    cfg: &config::Config,
    cmd: cli::BalanceCommands,
) -> anyhow::Result<()> {
    let month = month_start(Utc::now(), cfg.timezone);
    match cmd {
        cli::BalanceCommands::Show { user_id } => {
            let user = db
                .get_user(user_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("user not found: {}", user_id))?;
            let view = match user.scope().monthly_allocation() {
                Some(allocation) => {
                    BalanceView::from(&db.ensure_monthly_balance(user.id, month, allocation).await?)
                }
                None => BalanceView::unlimited(user.id, month),
            };
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        cli::BalanceCommands::Adjust {
            user_id,
            amount,
            description,
        } => {
            let amount = validate_adjustment(amount).map_err(anyhow::Error::msg)?;
            let user = db
                .get_user(user_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("user not found: {}", user_id))?;
            let allocation = user
                .scope()
                .monthly_allocation()
                .ok_or_else(|| anyhow::anyhow!("admin users have no balance to adjust"))?;
            let description = description.unwrap_or_else(|| "adjustment via CLI".to_string());
            let charge = Charge {
                user_id: user.id,
                month,
                allocation,
                endpoint_id: None,
                amount,
                description: Some(&description),
            };
            match db.adjust_balance(&charge).await? {
                Some((balance, _)) => println!(
                    "Balance for {} is now {} ({} allocated).",
                    user.user_name, balance.current_balance, balance.allocated
                ),
                None => anyhow::bail!(
                    "adjustment would take the balance below zero or to {} or more",
                    MAX_BALANCE
                ),
            }
        }
    }
    Ok(())
}
