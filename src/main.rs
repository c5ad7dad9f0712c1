mod bot;
mod commands;
mod config;
mod db;
mod premium;

use std::sync::Arc;

use anyhow::Result;
use bot::{Handler, ShardManagerContainer};
use config::Config;
use db::model::Store;
use db::safe::SafeMongo;
use premium::features::FeatureRegistry;
use premium::manager::PremiumManager;
use serenity::prelude::*;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting Prism bot...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    let mongo = Arc::new(SafeMongo::new(&config.mongodb_uri, &config.mongodb_db));
    let store = Arc::new(Store::new(mongo.clone()));
    let premium = Arc::new(PremiumManager::new(
        store,
        FeatureRegistry::builtin(),
        config.cache_ttl_secs,
        config.default_duration_days,
    ));
    info!(
        "Premium manager initialized: {} registered features, {} day default duration",
        premium.registry().len(),
        premium.default_duration_days()
    );

    // The wrapper reconnects lazily, so a failed initial connection only
    // delays index creation; premium reads fail closed in the meantime.
    match mongo.connect().await {
        Ok(()) => {
            if let Err(e) = premium.ensure_indexes().await {
                warn!("Failed to ensure premium indexes: {}", e);
            }
        }
        Err(e) => warn!("Initial MongoDB connection failed, operations will retry: {}", e),
    }

    let handler = Handler::new(config.clone(), premium.clone());

    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILDS;

    info!("Creating Discord client with intents: {:?}", intents);

    let mut client = match Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .await
    {
        Ok(client) => {
            info!("Discord client created successfully");
            client
        }
        Err(e) => {
            error!("Failed to create Discord client: {}", e);
            return Err(e.into());
        }
    };

    {
        let mut data = client.data.write().await;
        data.insert::<ShardManagerContainer>(client.shard_manager.clone());
    }

    info!("Prism bot is starting up...");

    if let Err(e) = client.start().await {
        error!("Client error: {:?}", e);
        return Err(e.into());
    }

    Ok(())
}
