use serenity::async_trait;
use serenity::builder::{CreateInteractionResponse, CreateInteractionResponseMessage};
use serenity::client::{Context, EventHandler};
use serenity::model::gateway::Ready;
use serenity::model::prelude::*;
use serenity::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::commands;
use crate::config::Config;
use crate::premium::manager::PremiumManager;

pub struct ShardManagerContainer;

impl TypeMapKey for ShardManagerContainer {
    type Value = Arc<serenity::gateway::ShardManager>;
}

pub struct Handler {
    pub config: Config,
    pub premium: Arc<PremiumManager>,
    maintenance_started: AtomicBool,
}

impl Handler {
    pub fn new(config: Config, premium: Arc<PremiumManager>) -> Self {
        info!("Creating new Handler instance");
        Self {
            config,
            premium,
            maintenance_started: AtomicBool::new(false),
        }
    }

    /// True exactly once. `ready` fires again after a gateway re-identify,
    /// and the maintenance loop must not be duplicated.
    fn claim_maintenance_start(&self) -> bool {
        !self.maintenance_started.swap(true, Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("{} is connected and ready!", ready.user.name);
        info!("Bot ID: {}", ready.user.id);
        info!("Connected to {} guilds", ready.guilds.len());
        info!("Bot ready! Use !sync_all to manually sync slash commands.");

        // Background maintenance: expiration sweep plus cache pruning on a
        // fixed interval for the life of the process. Reads re-check expiry
        // lazily, so a delayed pass only postpones cleanup.
        if self.claim_maintenance_start() {
            let premium = self.premium.clone();
            let sweep_interval = self.config.sweep_interval_secs;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));
                interval.tick().await; // first tick fires immediately
                loop {
                    interval.tick().await;
                    let (guilds, users) = premium.sweep().await;
                    premium.prune_caches();
                    if guilds > 0 || users > 0 {
                        info!(
                            "Maintenance pass: downgraded {} guilds and {} users",
                            guilds, users
                        );
                    }
                }
            });
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            info!("Received command: {}", command.data.name);
            let result = match command.data.name.as_str() {
                "ping" => commands::ping(&ctx, &command).await,
                "premium" => commands::premium(&ctx, &command, &self.premium).await,
                "features" => commands::features(&ctx, &command, &self.premium).await,
                "grantpremium" => commands::grantpremium(&ctx, &command, &self.premium).await,
                "revokepremium" => commands::revokepremium(&ctx, &command, &self.premium).await,
                _ => {
                    error!("Unknown command: {}", command.data.name);
                    Ok(())
                }
            };

            if let Err(e) = result {
                error!("Error handling command {}: {}", command.data.name, e);
                let response = CreateInteractionResponse::Message(
                    CreateInteractionResponseMessage::new()
                        .content("An error occurred while processing the command.")
                        .ephemeral(true),
                );
                let _ = command.create_response(&ctx.http, response).await;
            }
        }
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        if msg.content.starts_with("!sync_all") {
            info!("Sync command received from {}", msg.author.tag());

            if let Some(guild_id) = msg.guild_id {
                match guild_id.member(&ctx.http, msg.author.id).await {
                    Ok(member) => {
                        if !member
                            .permissions(&ctx.cache)
                            .map_or(false, |p| p.administrator())
                        {
                            let _ = msg
                                .reply(&ctx.http, "❌ You need Administrator permissions to sync commands.")
                                .await;
                            return;
                        }
                    }
                    Err(_) => {
                        let _ = msg.reply(&ctx.http, "❌ Unable to check permissions.").await;
                        return;
                    }
                }
            } else {
                let _ = msg
                    .reply(&ctx.http, "❌ This command can only be used in servers.")
                    .await;
                return;
            }

            let _ = msg.reply(&ctx.http, "🔄 Syncing commands... Please wait.").await;

            let register_commands = vec![
                commands::register_ping(),
                commands::register_premium(),
                commands::register_features(),
                commands::register_grantpremium(),
                commands::register_revokepremium(),
            ];

            tokio::time::sleep(Duration::from_millis(500)).await;

            match Command::set_global_commands(&ctx.http, register_commands).await {
                Ok(commands) => {
                    info!("Successfully synced {} slash commands", commands.len());
                    let _ = msg
                        .reply(
                            &ctx.http,
                            &format!("✅ Successfully synced {} slash commands!", commands.len()),
                        )
                        .await;
                }
                Err(e) => {
                    error!("Failed to sync commands: {}", e);
                    let _ = msg
                        .reply(&ctx.http, &format!("❌ Failed to sync commands: {}", e))
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::model::Store;
    use crate::db::safe::SafeMongo;
    use crate::premium::features::FeatureRegistry;

    fn handler() -> Handler {
        let config = Config {
            discord_token: "x".repeat(60),
            mongodb_uri: "mongodb://localhost:27017".to_string(),
            mongodb_db: "prism_test".to_string(),
            default_duration_days: 30,
            cache_ttl_secs: 300,
            sweep_interval_secs: 3600,
        };
        let mongo = Arc::new(SafeMongo::new(&config.mongodb_uri, &config.mongodb_db));
        let premium = Arc::new(PremiumManager::new(
            Arc::new(Store::new(mongo)),
            FeatureRegistry::builtin(),
            config.cache_ttl_secs,
            config.default_duration_days,
        ));
        Handler::new(config, premium)
    }

    #[test]
    fn maintenance_loop_starts_only_once() {
        let handler = handler();
        assert!(handler.claim_maintenance_start());
        assert!(!handler.claim_maintenance_start());
        assert!(!handler.claim_maintenance_start());
    }
}
