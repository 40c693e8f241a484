#![deny(dead_code)]
use anyhow::Result;
use clap::Parser;
use log::{info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use famchat::memory::{MemoryBackend, MemoryIdentity};
use famchat::ports::topic_for;
use famchat::utils;
use famchat::{ChatClient, ChatError, Message, MessageStatus, StoreChange, SyncConfig};

/// Command line arguments for the famchat demo
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "famchat: realtime family chat sync, demonstrated against an in-memory backend.",
    long_about = "Runs two clients (mom and kid) against an in-process backend and prints\n\
    the conversation as each of them sees it: optimistic sends, typing indicators,\n\
    a failed send with retry, and recovery from a dropped live channel."
)]
struct Args {
    /// Write logs to this file instead of stdout
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Sync config JSON (defaults to the user config dir)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Conversation id to chat in
    #[arg(long, default_value = "family")]
    conversation: String,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn status_marker(msg: &Message) -> &'static str {
    match msg.status {
        MessageStatus::Pending => "…",
        MessageStatus::Sent => "✓",
        MessageStatus::Failed => "✗ (tap to retry)",
    }
}

fn print_timeline(who: &str, client: &ChatClient, conversation: &str) {
    println!("--- {}'s view of #{} ---", who, conversation);
    for msg in client.messages(conversation) {
        println!(
            "[{}] {:>6}: {} {}",
            msg.created_at.format("%H:%M:%S%.3f"),
            msg.sender_id,
            msg.body,
            status_marker(&msg)
        );
    }
    let typing = client.typing_users(conversation);
    if !typing.is_empty() {
        println!("({} typing…)", typing.into_iter().collect::<Vec<_>>().join(", "));
    }
    println!();
}

/// Wait until a store reports a change matching `pred`, or give up.
async fn wait_for(
    changes: &mut tokio::sync::mpsc::UnboundedReceiver<StoreChange>,
    pred: impl Fn(&StoreChange) -> bool,
) -> bool {
    let wait = async {
        while let Some(change) = changes.recv().await {
            if pred(&change) {
                return true;
            }
        }
        false
    };
    tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap_or(false)
}

fn load_config(args: &Args) -> Result<SyncConfig> {
    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::load_default()?,
    };
    // Keep the demo snappy
    config.backoff_base_ms = config.backoff_base_ms.min(200);
    config.backoff_cap_ms = config.backoff_cap_ms.max(config.backoff_base_ms);
    config.send_attempts = 1;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    utils::setup_logging(args.log_file.as_ref().and_then(|p| p.to_str()), level)?;
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);

    let config = load_config(&args)?;
    let conversation = args.conversation.clone();

    let backend = MemoryBackend::default();
    backend.add_group(&conversation, &["mom", "kid"]);
    backend.seed_message(&conversation, "mom", "Welcome to the family chat!");

    let mom = ChatClient::builder(
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        Arc::new(MemoryIdentity::signed_in("mom")),
    )
    .config(config.clone())
    .build()?;
    let kid = ChatClient::builder(
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        Arc::new(MemoryIdentity::signed_in("kid")),
    )
    .config(config)
    .sweep_interval(Duration::from_millis(500))
    .build()?;

    let group = mom.load_group(&conversation).await?;
    println!("Group #{} members: {:?}\n", group.id, group.participant_ids);

    let mom_handle = mom.subscribe(&conversation).await?;
    let kid_handle = kid.subscribe(&conversation).await?;
    let mut mom_changes = mom.watch(&conversation);
    let mut kid_changes = kid.watch(&conversation);

    // Typing shows up on the other side
    kid.set_typing(&conversation)?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    print_timeline("mom", &mom, &conversation);

    let correlation_id = kid.send(&conversation, "can I go to Sam's after school?", None)?;
    print_timeline("kid (before the backend answers)", &kid, &conversation);
    wait_for(&mut kid_changes, |c| matches!(c, StoreChange::Replaced { .. })).await;
    wait_for(&mut mom_changes, |c| matches!(c, StoreChange::Inserted { .. })).await;
    info!("Kid's message {} confirmed", correlation_id);

    // A send that the backend rejects stays visible as failed
    backend.fail_next_persist(ChatError::TransientNetwork("backend unavailable".to_string()));
    let failed = mom.send(&conversation, "yes, be home by 6", None)?;
    wait_for(&mut mom_changes, |c| matches!(c, StoreChange::Failed { .. })).await;
    print_timeline("mom (after a failed send)", &mom, &conversation);

    mom.retry(&conversation, &failed)?;
    wait_for(&mut mom_changes, |c| matches!(c, StoreChange::Replaced { .. })).await;

    // Drop the live channels; messages sent meanwhile arrive through resync
    backend.disconnect(&topic_for(&conversation));
    backend.seed_message(&conversation, "mom", "and bring your jacket");
    tokio::time::sleep(Duration::from_millis(600)).await;
    if !kid.subscriptions().is_connected(&conversation) {
        warn!("Kid's channel has not reconnected yet");
    }

    print_timeline("mom", &mom, &conversation);
    print_timeline("kid", &kid, &conversation);
    println!(
        "kid has {} unread message(s); channel opened {} time(s)",
        kid.unread_count(&conversation),
        backend.open_count(&topic_for(&conversation))
    );

    mom.unsubscribe(&mom_handle);
    kid.unsubscribe(&kid_handle);
    mom.shutdown();
    kid.shutdown();
    info!("Demo finished");
    Ok(())
}
