//! proofbot server entry point.

mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use proofbot_common::{Config, build_blob_store};
use proofbot_core::{AppContext, SqlDurableStore};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "proofbot", version, about = "Proof intake and recovery service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Recover the cache and serve until interrupted.
    Serve,
    /// Print the durable and cached copy of a participant.
    Show {
        /// Participant id.
        id: String,
    },
    /// Delete every cached record, durable row and blob.
    Purge {
        /// Confirm the purge.
        #[arg(long)]
        yes: bool,
    },
    /// Seed synthetic participants through the normal write path.
    Populate {
        /// Number of participants.
        count: u32,
    },
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proofbot=debug,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;

    let db = proofbot_db::init(&config.database)
        .await
        .context("connecting to database")?;
    info!("Connected to database");
    let durable = Arc::new(SqlDurableStore::new(Arc::new(db)));
    let blobs = build_blob_store(&config.storage)?;

    let ctx = AppContext::build(config, durable, blobs).await?;

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&ctx).await,
        Command::Show { id } => {
            let view = ctx.admin.show(&id).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            if !view.in_sync() {
                warn!(entity_id = %id, "Cached copy differs from durable row");
            }
            Ok(())
        }
        Command::Purge { yes } => {
            if yes {
                let report = ctx.admin.purge_all().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            } else {
                Err(anyhow::anyhow!("refusing to purge without --yes"))
            }
        }
        Command::Populate { count } => {
            let written = ctx.admin.populate(count).await?;
            println!("Populated {written} participants");
            Ok(())
        }
    };

    ctx.shutdown().await;
    result
}

async fn serve(ctx: &AppContext) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.config.server.host, ctx.config.server.port)
        .parse()
        .context("parsing listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "Listening");

    let app = routes::router(ctx.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    });

    // Readiness is withheld until the cache is rebuilt.
    if let Some(report) = ctx.start().await.context("startup recovery")? {
        tokio::spawn(async move {
            let outcomes = report.repairs.wait().await;
            let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
            info!(repaired = outcomes.len() - failed, failed, "Artifact repair finished");
        });
    }

    server.await??;
    info!("Server stopped");
    Ok(())
}
