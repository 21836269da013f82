//! CLI command implementations

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::collab::{DryRunExecutor, LogReplySink, NullMentionSource};
use crate::config::Config;
use crate::engine::ExecutionEngine;
use crate::model::{ActionSource, BotStatus};
use crate::pipeline::MentionPipeline;
use crate::store::{NewBot, SqliteStore};
use crate::vault::CredentialVault;

async fn init(config: &Config) -> Result<(SqliteStore, Arc<CredentialVault>, AuditLog)> {
    let store = SqliteStore::connect(&config.store).await?;
    let vault = Arc::new(CredentialVault::from_env(&config.vault.key_env_var)?);
    let audit = AuditLog::new(store.clone());
    Ok((store, vault, audit))
}

/// Start the mention pipeline
pub async fn start(config: &Config, dry_run: bool) -> Result<()> {
    if dry_run {
        warn!("Running in DRY-RUN mode - no real transactions will be broadcast");
    } else {
        // Chain/social integrations are wired externally; without them the
        // stub collaborators keep the pipeline runnable end to end.
        warn!("No chain integration configured - falling back to dry-run executor");
    }

    let (store, vault, audit) = init(config).await?;

    let engine = Arc::new(ExecutionEngine::new(
        store.clone(),
        vault,
        Arc::new(DryRunExecutor),
        audit.clone(),
        config.engine.clone(),
    ));

    // Resolve anything a previous process left stuck in `submitting`
    let reconciled = engine.reconcile_stuck().await?;
    if reconciled > 0 {
        warn!("Reconciled {} stuck operation(s) to failed on startup", reconciled);
    }

    let pipeline = Arc::new(MentionPipeline::new(
        store,
        engine,
        Arc::new(NullMentionSource),
        Arc::new(LogReplySink),
        audit,
        config.pipeline.clone(),
    ));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_token.cancel();
        }
    });

    pipeline.run(shutdown).await?;
    Ok(())
}

/// Run the stuck-submitting watchdog once and exit
pub async fn reconcile(config: &Config) -> Result<()> {
    let (store, vault, audit) = init(config).await?;
    let engine = ExecutionEngine::new(
        store,
        vault,
        Arc::new(DryRunExecutor),
        audit,
        config.engine.clone(),
    );
    let resolved = engine.reconcile_stuck().await?;
    println!("Resolved {} stuck operation(s)", resolved);
    Ok(())
}

/// Create a bot with a freshly generated custodial wallet
pub async fn bot_create(
    config: &Config,
    name: &str,
    commander: &str,
    personality: &str,
) -> Result<()> {
    let (store, vault, audit) = init(config).await?;

    let keypair = Keypair::new();
    let address = keypair.pubkey().to_string();
    let encrypted_key = vault.encrypt_to_envelope(&keypair.to_bytes())?;

    let (bot, wallet) = store
        .create_bot(
            NewBot {
                name: name.to_string(),
                personality: personality.to_string(),
                commander_handle: commander.to_string(),
                post_interval_secs: 3600,
                poll_interval_secs: config.pipeline.poll_interval_secs,
            },
            &address,
            &encrypted_key,
        )
        .await?;

    audit
        .append(
            Some(&bot.id),
            "bot_created",
            json!({ "name": bot.name, "commander": bot.commander_handle }),
            ActionSource::Dashboard,
        )
        .await?;

    println!("Created bot '{}' (id {})", bot.name, bot.id);
    println!("Wallet address: {}", wallet.address);
    println!("Status: {} - run 'bot resume {}' to activate", bot.status.as_str(), bot.name);
    Ok(())
}

/// List all bots
pub async fn bot_list(config: &Config) -> Result<()> {
    let (store, _vault, _audit) = init(config).await?;
    let bots = store.list_bots().await?;
    if bots.is_empty() {
        println!("No bots configured");
        return Ok(());
    }
    for bot in bots {
        let wallet = store.wallet_for_bot(&bot.id).await?;
        println!(
            "{:<20} {:<10} commander=@{} wallet={}",
            bot.name,
            bot.status.as_str(),
            bot.commander_handle,
            wallet.address
        );
    }
    Ok(())
}

/// Change a bot's lifecycle status
pub async fn bot_set_status(config: &Config, name: &str, status: BotStatus) -> Result<()> {
    let (store, _vault, audit) = init(config).await?;
    let bot = store.get_bot_by_name(name).await?;
    store.set_bot_status(&bot.id, status).await?;
    audit
        .append(
            Some(&bot.id),
            "bot_status_changed",
            json!({ "from": bot.status.as_str(), "to": status.as_str() }),
            ActionSource::Dashboard,
        )
        .await?;
    println!("Bot '{}' is now {}", name, status.as_str());
    Ok(())
}

/// Delete a bot and everything it owns
pub async fn bot_delete(config: &Config, name: &str, force: bool) -> Result<()> {
    if !force {
        anyhow::bail!(
            "Deleting '{}' removes its wallet, trades, withdrawals, mentions, posts \
             and audit history. Re-run with --force to confirm.",
            name
        );
    }
    let (store, _vault, _audit) = init(config).await?;
    let bot = store.get_bot_by_name(name).await?;
    store.delete_bot_cascade(&bot.id).await?;
    println!("Deleted bot '{}' and all owned entities", name);
    Ok(())
}

/// Show recent audit entries for a bot
pub async fn audit_show(config: &Config, bot_name: &str, limit: i64) -> Result<()> {
    let (store, _vault, audit) = init(config).await?;
    let bot = store.get_bot_by_name(bot_name).await?;
    let entries = audit.for_bot(&bot.id, limit).await?;
    for entry in entries {
        println!(
            "{} [{}] {} {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.source.as_str(),
            entry.action,
            entry.details
        );
    }
    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}
