mod api;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use murmur_backend::conversation::ConversationSnapshot;
use murmur_backend::message::InboundMessage;
use tracing_subscriber::EnvFilter;

use api::ApiClient;

/// Operator console for a running murmur backend.
#[derive(Debug, Parser)]
#[command(name = "murmur", version)]
struct Cli {
    /// Backend base URL (defaults to MURMUR_BACKEND_URL or http://127.0.0.1:8797).
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Backend health and active conversation count.
    Status,
    /// List active conversations.
    Conversations,
    /// Show one conversation in full.
    Show { channel: String },
    /// End a conversation now.
    Disengage { channel: String },
    /// Push a synthetic inbound message through the daemon.
    Inject {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        author: String,
        #[arg(long)]
        text: String,
        #[arg(long)]
        guild: Option<String>,
        /// Mention the bot so the message opens a conversation.
        #[arg(long)]
        mention: bool,
        /// Deliver as a direct message instead of a guild message.
        #[arg(long, conflicts_with = "guild")]
        direct: bool,
    },
    /// Stream engagement events until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,murmur=info")),
        )
        .init();

    let cli = Cli::parse();
    let client = match cli.url {
        Some(url) => ApiClient::new(
            url,
            std::env::var("MURMUR_BACKEND_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
        ),
        None => ApiClient::from_env(),
    };
    tracing::debug!("Backend API: {}", client.base_url());

    match cli.command {
        Command::Status => {
            let health = client.health().await?;
            println!(
                "{} as {} ({} active conversation{})",
                health.status,
                health.self_id,
                health.active_conversations,
                if health.active_conversations == 1 { "" } else { "s" }
            );
        }
        Command::Conversations => {
            let conversations = client.list_conversations().await?;
            if conversations.is_empty() {
                println!("No active conversations");
            }
            for conversation in &conversations {
                println!("{}", conversation_line(conversation));
            }
        }
        Command::Show { channel } => match client.get_conversation(&channel).await? {
            Some(conversation) => println!(
                "{}",
                serde_json::to_string_pretty(&conversation)
                    .context("Failed to render conversation")?
            ),
            None => println!("No conversation in {}", channel),
        },
        Command::Disengage { channel } => {
            if client.disengage(&channel).await? {
                println!("Disengaged from {}", channel);
            } else {
                println!("No conversation in {}", channel);
            }
        }
        Command::Inject {
            channel,
            author,
            text,
            guild,
            mention,
            direct,
        } => {
            let mentioned_user_ids = if mention {
                vec![client.health().await?.self_id]
            } else {
                Vec::new()
            };
            let now = Utc::now();
            let message = InboundMessage {
                id: format!("cli-{}", now.timestamp_nanos_opt().unwrap_or_default()),
                author_id: author.clone(),
                author_name: author,
                text,
                timestamp_ms: now.timestamp_millis(),
                mentioned_user_ids,
                replied_to_message_id: None,
                channel_id: channel,
                is_direct_message: direct,
                guild_id: guild,
            };
            let outcome = client.inject(&message).await?;
            println!("{} -> {}", message.id, outcome);
        }
        Command::Watch => {
            client
                .watch_events_forever(|event| println!("{}", event.summary_line()))
                .await;
        }
    }

    Ok(())
}

fn conversation_line(conversation: &ConversationSnapshot) -> String {
    format!(
        "{:<20} {:<10} replies={} participants={} buffered={}{}",
        conversation.channel_id,
        format!("{:?}", conversation.state).to_lowercase(),
        conversation.reply_count,
        conversation.participants.len(),
        conversation.message_buffer.len(),
        if conversation.responding {
            " (responding)"
        } else {
            ""
        }
    )
}
