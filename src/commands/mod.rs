use serenity::builder::{
    CreateCommand, CreateCommandOption, CreateEmbed, CreateInteractionResponse,
    CreateInteractionResponseMessage, EditInteractionResponse,
};
use serenity::model::application::CommandOptionType;
use serenity::model::prelude::*;
use serenity::prelude::*;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info};

use crate::bot::ShardManagerContainer;
use crate::premium::features::Tier;
use crate::premium::manager::PremiumManager;

const GOLD: u32 = 0xFFD700;
const GRAY: u32 = 0x99AAB5;
const FOOTER: &str = "Prism Bot";

/// "custom_commands" -> "Custom Commands"
fn display_name(feature: &str) -> String {
    feature
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn integer_option(command: &CommandInteraction, name: &str) -> Option<i64> {
    command
        .data
        .options
        .iter()
        .find(|option| option.name == name)
        .and_then(|option| option.value.as_i64())
}

fn is_admin(command: &CommandInteraction) -> bool {
    command
        .member
        .as_ref()
        .and_then(|member| member.permissions)
        .map_or(false, |permissions| permissions.administrator())
}

async fn reply_ephemeral(
    ctx: &Context,
    command: &CommandInteraction,
    content: &str,
) -> Result<(), serenity::Error> {
    let response = CreateInteractionResponse::Message(
        CreateInteractionResponseMessage::new()
            .content(content)
            .ephemeral(true),
    );
    command.create_response(&ctx.http, response).await
}

/// Resolves the guild the interaction came from, replying with an error when
/// the command was used outside a server.
async fn require_guild(
    ctx: &Context,
    command: &CommandInteraction,
) -> Result<Option<GuildId>, serenity::Error> {
    match command.guild_id {
        Some(id) => Ok(Some(id)),
        None => {
            reply_ephemeral(ctx, command, "This command can only be used in a server.").await?;
            Ok(None)
        }
    }
}

pub async fn ping(ctx: &Context, command: &CommandInteraction) -> Result<(), serenity::Error> {
    info!("Ping command executed by {}", command.user.tag());
    let http = ctx.http.clone();

    let initial_response = CreateInteractionResponse::Message(
        CreateInteractionResponseMessage::new()
            .content("Calculating ping...")
            .ephemeral(false),
    );
    command.create_response(&http, initial_response).await?;

    let start = Instant::now();
    let _test_call = command.get_response(&http).await;
    let api_latency = start.elapsed().as_millis();

    let ws_latency = {
        let data_read = ctx.data.read().await;
        match data_read.get::<ShardManagerContainer>() {
            Some(shard_manager) => {
                let shard_runners = shard_manager.runners.lock().await;
                shard_runners
                    .values()
                    .next()
                    .and_then(|info| info.latency)
                    .map(|d| d.as_millis())
                    .unwrap_or(0)
            }
            None => 0,
        }
    };

    debug!("Ping results - API: {}ms, WebSocket: {}ms", api_latency, ws_latency);

    let embed = CreateEmbed::new()
        .title("Connection Status")
        .color(0x00FF00)
        .field("API Latency", format!("{}ms", api_latency), true)
        .field("WebSocket Latency", format!("{}ms", ws_latency), true)
        .timestamp(Utc::now())
        .footer(serenity::builder::CreateEmbedFooter::new(FOOTER));

    let edit_response = EditInteractionResponse::new().content("").embed(embed);
    command.edit_response(&http, edit_response).await?;

    Ok(())
}

/// `/premium` - current subscription status for this server.
pub async fn premium(
    ctx: &Context,
    command: &CommandInteraction,
    manager: &PremiumManager,
) -> Result<(), serenity::Error> {
    let guild_id = match require_guild(ctx, command).await? {
        Some(id) => id,
        None => return Ok(()),
    };
    info!(
        "Premium status command executed by {} in guild {}",
        command.user.tag(),
        guild_id
    );

    command.defer(&ctx.http).await?;
    let status = manager.guild_status(guild_id.get()).await;

    let mut embed = CreateEmbed::new()
        .title("Premium Status")
        .footer(serenity::builder::CreateEmbedFooter::new(FOOTER))
        .timestamp(Utc::now());

    if status.is_premium {
        embed = embed.color(GOLD).field(
            "Status",
            format!("✅ This server has premium tier: **{}**", status.tier_name),
            false,
        );
        match status.expires_at {
            Some(expires_at) => {
                embed = embed.field(
                    "Expires",
                    format!(
                        "{} ({} days left)",
                        expires_at.format("%Y-%m-%d"),
                        status.days_left
                    ),
                    true,
                );
            }
            None => {
                embed = embed.field("Expires", "Never", true);
            }
        }
        let features = status
            .features
            .iter()
            .map(|f| format!("• {}", display_name(f)))
            .collect::<Vec<_>>()
            .join("\n");
        embed = embed.field(
            "Features",
            if features.is_empty() {
                "No features enabled".to_string()
            } else {
                features
            },
            false,
        );
    } else {
        embed = embed
            .color(GRAY)
            .field("Status", "❌ This server does not have premium", false)
            .field(
                "Upgrade",
                "Use `/features` to see what each premium tier unlocks.",
                false,
            );
    }

    let edit_response = EditInteractionResponse::new().embed(embed);
    command.edit_response(&ctx.http, edit_response).await?;
    Ok(())
}

/// `/features` - full catalog grouped by category, marking what this
/// server's tier unlocks.
pub async fn features(
    ctx: &Context,
    command: &CommandInteraction,
    manager: &PremiumManager,
) -> Result<(), serenity::Error> {
    let guild_id = match require_guild(ctx, command).await? {
        Some(id) => id,
        None => return Ok(()),
    };
    info!(
        "Features command executed by {} in guild {}",
        command.user.tag(),
        guild_id
    );

    command.defer(&ctx.http).await?;
    let guild_tier = manager.guild_tier(guild_id.get()).await;

    let mut categories: BTreeMap<&str, Vec<&crate::premium::features::Feature>> = BTreeMap::new();
    for feature in manager.registry().all() {
        categories.entry(&feature.category).or_default().push(feature);
    }

    let mut embed = CreateEmbed::new()
        .title("Premium Features")
        .description(format!(
            "This server is on the **{}** tier.",
            guild_tier.name()
        ))
        .color(if guild_tier > Tier::None { GOLD } else { GRAY })
        .footer(serenity::builder::CreateEmbedFooter::new(FOOTER))
        .timestamp(Utc::now());

    for (category, mut features) in categories {
        features.sort_by_key(|f| (f.required_level, f.name.clone()));
        let mut value = String::new();
        for feature in features {
            if feature.required_level <= guild_tier {
                value.push_str(&format!(
                    "✅ **{}**\n{}\n\n",
                    display_name(&feature.name),
                    feature.description
                ));
            } else {
                value.push_str(&format!(
                    "⭐ **{}** ({} tier)\n{}\n\n",
                    display_name(&feature.name),
                    feature.required_level,
                    feature.description
                ));
            }
        }
        embed = embed.field(category, value, false);
    }

    let edit_response = EditInteractionResponse::new().embed(embed);
    command.edit_response(&ctx.http, edit_response).await?;
    Ok(())
}

/// `/grantpremium tier [days]` - administrator-only.
pub async fn grantpremium(
    ctx: &Context,
    command: &CommandInteraction,
    manager: &PremiumManager,
) -> Result<(), serenity::Error> {
    let guild_id = match require_guild(ctx, command).await? {
        Some(id) => id,
        None => return Ok(()),
    };
    if !is_admin(command) {
        return reply_ephemeral(
            ctx,
            command,
            "❌ You need Administrator permissions to manage premium.",
        )
        .await;
    }

    let tier = match integer_option(command, "tier")
        .and_then(|raw| i32::try_from(raw).ok())
        .and_then(Tier::from_i32)
    {
        Some(tier) if tier > Tier::None => tier,
        _ => {
            return reply_ephemeral(ctx, command, "❌ Invalid premium tier.").await;
        }
    };
    let days = integer_option(command, "days");
    if matches!(days, Some(d) if d <= 0) {
        return reply_ephemeral(ctx, command, "❌ Duration must be a positive number of days.")
            .await;
    }

    info!(
        "Grant premium command executed by {} in guild {}: tier {}, days {:?}",
        command.user.tag(),
        guild_id,
        tier,
        days
    );

    command.defer(&ctx.http).await?;
    if manager.grant_guild(guild_id.get(), tier, days).await {
        let status = manager.guild_status(guild_id.get()).await;
        let embed = CreateEmbed::new()
            .title("Premium Granted")
            .color(GOLD)
            .field("Tier", tier.name(), true)
            .field(
                "Expires",
                status
                    .expires_at
                    .map(|e| e.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "Never".to_string()),
                true,
            )
            .field(
                "Features",
                status
                    .features
                    .iter()
                    .map(|f| format!("• {}", display_name(f)))
                    .collect::<Vec<_>>()
                    .join("\n"),
                false,
            )
            .footer(serenity::builder::CreateEmbedFooter::new(FOOTER))
            .timestamp(Utc::now());
        let edit_response = EditInteractionResponse::new().embed(embed);
        command.edit_response(&ctx.http, edit_response).await?;
    } else {
        let edit_response = EditInteractionResponse::new()
            .content("❌ Failed to update premium status. Please try again later.");
        command.edit_response(&ctx.http, edit_response).await?;
    }
    Ok(())
}

/// `/revokepremium` - administrator-only.
pub async fn revokepremium(
    ctx: &Context,
    command: &CommandInteraction,
    manager: &PremiumManager,
) -> Result<(), serenity::Error> {
    let guild_id = match require_guild(ctx, command).await? {
        Some(id) => id,
        None => return Ok(()),
    };
    if !is_admin(command) {
        return reply_ephemeral(
            ctx,
            command,
            "❌ You need Administrator permissions to manage premium.",
        )
        .await;
    }

    info!(
        "Revoke premium command executed by {} in guild {}",
        command.user.tag(),
        guild_id
    );

    command.defer(&ctx.http).await?;
    let content = if manager.revoke_guild(guild_id.get()).await {
        "✅ Premium has been revoked from this server.".to_string()
    } else {
        "❌ This server has no premium subscription to revoke.".to_string()
    };
    let edit_response = EditInteractionResponse::new().content(content);
    command.edit_response(&ctx.http, edit_response).await?;
    Ok(())
}

pub fn register_ping() -> CreateCommand {
    CreateCommand::new("ping").description("Check the bot's connection latency and status")
}

pub fn register_premium() -> CreateCommand {
    CreateCommand::new("premium").description("View this server's premium subscription status")
}

pub fn register_features() -> CreateCommand {
    CreateCommand::new("features").description("Browse the premium feature catalog")
}

pub fn register_grantpremium() -> CreateCommand {
    CreateCommand::new("grantpremium")
        .description("Grant a premium tier to this server (admin only)")
        .default_member_permissions(Permissions::ADMINISTRATOR)
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "tier", "Premium tier to grant")
                .required(true)
                .add_int_choice("Basic", 1)
                .add_int_choice("Standard", 2)
                .add_int_choice("Pro", 3)
                .add_int_choice("Enterprise", 4),
        )
        .add_option(CreateCommandOption::new(
            CommandOptionType::Integer,
            "days",
            "Subscription duration in days (default 30)",
        ))
}

pub fn register_revokepremium() -> CreateCommand {
    CreateCommand::new("revokepremium")
        .description("Revoke this server's premium subscription (admin only)")
        .default_member_permissions(Permissions::ADMINISTRATOR)
}
