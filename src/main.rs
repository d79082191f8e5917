use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loris::{
    AppConfig, AppContext, Database, build_router, diagram, lab,
    schema::{AdapterRegistry, SchemaRegistry},
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "loris")]
#[command(about = "Schema-driven data entry for laboratory databases")]
struct Cli {
    /// JSON configuration file (falls back to LORIS_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the JSON API over the lab schema
    Serve {
        /// Seed lookup tables and experimenters
        #[arg(long)]
        demo: bool,
    },
    /// Print a Graphviz diagram of the lab schema
    Diagram {
        #[arg(long)]
        schema: Option<String>,
        #[arg(long, conflicts_with = "schema")]
        table: Option<String>,
        /// Leave out part tables and lookup tables
        #[arg(long)]
        essential: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("failed to load application configuration")?;

    match cli.command {
        Command::Serve { demo } => serve(config, demo).await,
        Command::Diagram {
            schema,
            table,
            essential,
        } => print_diagram(&config, schema.as_deref(), table.as_deref(), essential),
    }
}

fn lab_database(demo: bool) -> Result<Database> {
    let adapters = AdapterRegistry::default();
    if demo {
        return lab::demo_database(&adapters).context("failed to build demo database");
    }
    let mut db = Database::new();
    lab::declare_lab_schema(&mut db, &adapters).context("failed to declare lab schema")?;
    Ok(db)
}

async fn serve(config: AppConfig, demo: bool) -> Result<()> {
    let addr = config.address();
    let ctx = AppContext::new(config, lab_database(demo)?)
        .await
        .context("failed to set up application context")?;

    let app = build_router(Arc::new(ctx));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    info!(address = %addr, demo, "loris started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

fn print_diagram(config: &AppConfig, schema: Option<&str>, table: Option<&str>, essential: bool) -> Result<()> {
    let db = lab_database(false)?;
    let dot = match table {
        Some(table) => diagram::table_diagram(db.catalog(), table)?,
        None => {
            let mut registry = SchemaRegistry::new();
            registry.refresh(db.catalog(), &config.skip_schemas);
            diagram::schema_diagram(&registry, schema, essential)?
        }
    };
    print!("{}", dot);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("loris=info,tower_http=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install Ctrl+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
