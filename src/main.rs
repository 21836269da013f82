//! Custobot - mention-triggered transaction pipeline for custodial agent wallets
//!
//! # WARNING
//! - Bots hold real funds in custodial wallets. Guard the vault key.
//! - Mentions are a public, adversarial input channel; only the configured
//!   commander handle can trigger trades or withdrawals.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

// Use the library crate
use custobot::cli::commands;
use custobot::config::Config;
use custobot::model::BotStatus;

/// Custobot - mention-triggered transaction pipeline
#[derive(Parser)]
#[command(name = "custobot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the mention pipeline
    Start {
        /// Run in dry-run mode (no real transactions)
        #[arg(long)]
        dry_run: bool,
    },

    /// Resolve operations stuck in `submitting` and exit
    Reconcile,

    /// Bot management commands
    Bot {
        #[command(subcommand)]
        action: BotAction,
    },

    /// Show recent audit entries for a bot
    Audit {
        /// Bot name
        bot: String,

        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Show current configuration (secrets masked)
    Config,
}

#[derive(Subcommand)]
enum BotAction {
    /// Create a bot with a fresh custodial wallet
    Create {
        /// Bot name (unique)
        name: String,

        /// Commander handle allowed to issue commands via mentions
        #[arg(long)]
        commander: String,

        /// Personality configuration
        #[arg(long, default_value = "")]
        personality: String,
    },

    /// List all configured bots
    List,

    /// Pause a bot (mentions are still recorded, commands rejected)
    Pause { name: String },

    /// Activate a bot
    Resume { name: String },

    /// Delete a bot and everything it owns
    Delete {
        name: String,

        /// Skip confirmation
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("custobot=info".parse().unwrap()),
        )
        .with_target(true)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Start { dry_run } => commands::start(&config, dry_run).await,
        Commands::Reconcile => commands::reconcile(&config).await,
        Commands::Bot { action } => match action {
            BotAction::Create {
                name,
                commander,
                personality,
            } => commands::bot_create(&config, &name, &commander, &personality).await,
            BotAction::List => commands::bot_list(&config).await,
            BotAction::Pause { name } => {
                commands::bot_set_status(&config, &name, BotStatus::Paused).await
            }
            BotAction::Resume { name } => {
                commands::bot_set_status(&config, &name, BotStatus::Active).await
            }
            BotAction::Delete { name, force } => {
                commands::bot_delete(&config, &name, force).await
            }
        },
        Commands::Audit { bot, limit } => commands::audit_show(&config, &bot, limit).await,
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
