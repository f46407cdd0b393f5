use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    ClientEvent, ConversationKey, Message, MessagingSession, SendTarget, SessionIdentity,
};
use futures::StreamExt;
use shared::{
    domain::{ConversationId, MessageStatus, UserId},
    protocol::HistoryPage,
};
use tracing_subscriber::EnvFilter;

mod config;

#[derive(Parser, Debug)]
#[command(about = "Terminal client for one-to-one messaging")]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    user_id: Option<i64>,
    /// Send over `socket` or `rest`.
    #[arg(long)]
    route: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List conversations, most recent first.
    Conversations,
    /// Print the latest page of a conversation.
    History {
        conversation: i64,
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    /// Send one message and wait for the server to confirm it.
    Send {
        #[arg(long, conflicts_with = "conversation")]
        to: Option<i64>,
        #[arg(long)]
        conversation: Option<i64>,
        content: String,
        #[arg(long, default_value_t = 15)]
        wait_secs: u64,
    },
    Search {
        conversation: i64,
        query: String,
    },
    /// Stay connected and print incoming messages and status changes.
    Listen,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(v) = args.server_url {
        settings.server_url = v;
    }
    if let Some(v) = args.token {
        settings.token = Some(v);
    }
    if let Some(v) = args.user_id {
        settings.user_id = Some(v);
    }
    if let Some(raw) = args.route.as_deref() {
        settings.route = config::parse_route(raw)
            .with_context(|| format!("unknown route '{raw}', expected socket or rest"))?;
    }

    let token = settings
        .token
        .clone()
        .context("no token configured; pass --token or set MESSAGING_TOKEN")?;
    let user_id = settings
        .user_id
        .context("no user id configured; pass --user-id or set APP__USER_ID")?;

    let session = MessagingSession::new(
        settings.client_config(),
        SessionIdentity {
            user_id: UserId(user_id),
            token,
        },
    )?;

    let outcome = run(&session, args.command).await;
    session.shutdown().await;
    outcome
}

async fn run(session: &Arc<MessagingSession>, command: Command) -> Result<()> {
    match command {
        Command::Conversations => {
            for entry in session.refresh_conversations().await? {
                println!(
                    "{}\t{}\t{}",
                    entry.key,
                    entry
                        .peer_display_name
                        .clone()
                        .unwrap_or_else(|| format!("user {}", entry.peer_id)),
                    entry.last_message_preview.as_deref().unwrap_or("")
                );
            }
        }
        Command::History {
            conversation,
            pages,
        } => {
            let conversation = ConversationId(conversation);
            let mut page = HistoryPage::default();
            for _ in 0..pages.max(1) {
                let merge = session.load_history(conversation, page).await?;
                if merge.inserted == 0 {
                    break;
                }
                page = page.next();
            }
            for message in session.messages(ConversationKey::Confirmed(conversation)).await {
                print_message(&message);
            }
        }
        Command::Send {
            to,
            conversation,
            content,
            wait_secs,
        } => {
            let target = match (to, conversation) {
                (Some(peer), _) => SendTarget::Peer(UserId(peer)),
                (None, Some(id)) => {
                    session.refresh_conversations().await?;
                    SendTarget::Conversation(ConversationId(id))
                }
                (None, None) => bail!("pass --to <user id> or --conversation <id>"),
            };
            let mut events = session.subscribe();
            session.start().await?;
            let receipt = session.send(target, &content).await?;
            tracing::info!(temp_id = %receipt.temp_id, conversation = %receipt.conversation, "send: queued");

            let confirmed = tokio::time::timeout(Duration::from_secs(wait_secs), async {
                loop {
                    match events.recv().await {
                        Ok(ClientEvent::MessageUpserted { message, .. })
                            if message.temp_id.as_ref() == Some(&receipt.temp_id)
                                && message.status != MessageStatus::Pending =>
                        {
                            return Ok(message);
                        }
                        Ok(ClientEvent::SendFailed { temp_id, reason })
                            if temp_id == receipt.temp_id =>
                        {
                            bail!("send failed: {reason}");
                        }
                        Ok(_) => {}
                        Err(err) => bail!("event stream closed: {err}"),
                    }
                }
            })
            .await
            .context("timed out waiting for the server to confirm the message")??;
            print_message(&confirmed);
        }
        Command::Search {
            conversation,
            query,
        } => {
            for message in session.search(ConversationId(conversation), &query).await? {
                print_message(&message);
            }
        }
        Command::Listen => {
            let events = session.event_stream();
            tokio::pin!(events);
            session.start().await?;
            session.refresh_conversations().await?;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.next() => {
                        let Some(event) = event else { break };
                        print_event(&event);
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_message(message: &Message) {
    let id = message
        .message_id
        .map(|id| id.to_string())
        .or_else(|| message.temp_id.as_ref().map(ToString::to_string))
        .unwrap_or_default();
    println!(
        "[{}] #{id} {} -> {} ({}): {}",
        message.created_at.format("%Y-%m-%d %H:%M:%S"),
        message.sender_id,
        message.receiver_id,
        message.status.as_str(),
        message.content
    );
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::MessageUpserted { message, .. } => print_message(message),
        ClientEvent::MessageStatusChanged {
            message_id, status, ..
        } => println!("status #{message_id} -> {}", status.as_str()),
        ClientEvent::ConnectionStateChanged(state) => println!("connection: {state:?}"),
        ClientEvent::SendFailed { temp_id, reason } => println!("send {temp_id} failed: {reason}"),
        ClientEvent::AuthenticationFailed(reason) => println!("authentication failed: {reason}"),
        ClientEvent::Error(reason) => println!("error: {reason}"),
        ClientEvent::ConversationsUpdated
        | ClientEvent::HistoryMerged { .. }
        | ClientEvent::MessageDiscarded { .. } => {}
    }
}
