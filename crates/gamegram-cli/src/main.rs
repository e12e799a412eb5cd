mod commands;
mod config;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use gamegram_loopback::LoopbackStore;
use gamegram_sync::{
    ConnectionState, ScrollDirective, SyncEngine, SyncHandle, ViewState, summarize,
};
use gamegram_types::{Delivery, Message, MessageKey, RoomId};

use crate::commands::{CliCommand, HELP};
use crate::config::CliConfig;

const SEED_USERS: [&str; 3] = ["@ana", "@bo", "@kit"];
const SEED_ROOMS: [&str; 3] = ["general", "random", "dev"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gamegram=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = CliConfig::from_env()?;

    let remote = Arc::new(LoopbackStore::new());
    for (offset, name) in (0..).zip(SEED_ROOMS) {
        remote.add_room(config.room_id + offset, name);
    }
    for n in 1..=config.seed_messages {
        let user = SEED_USERS[n as usize % SEED_USERS.len()];
        remote.seed_message(config.room_id, user, &format!("history #{}", n));
    }
    for (offset, name) in (1..).zip(&SEED_ROOMS[1..]) {
        remote.seed_message(config.room_id + offset, "@kit", &format!("welcome to #{}", name));
    }
    info!(
        room_id = config.room_id,
        username = %config.identity.username,
        seeded = config.seed_messages,
        "starting gamegram harness"
    );

    let engine = SyncEngine::start(
        config.sync.clone(),
        config.identity.clone(),
        config.room_id,
        remote.clone(),
    );
    let handle = engine.handle();

    let printer = tokio::spawn(print_views(handle.subscribe()));
    let scroller = tokio::spawn(print_directives(handle.directives()));

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match commands::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("! {}", e);
                continue;
            }
        };
        if command == CliCommand::Quit {
            break;
        }
        run_command(command, &handle, &remote);
    }

    engine.stop().await;
    printer.abort();
    scroller.abort();
    info!("bye");
    Ok(())
}

fn run_command(command: CliCommand, handle: &SyncHandle, remote: &Arc<LoopbackStore>) {
    match command {
        CliCommand::Send(text) => {
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = handle.send_message(text).await {
                    println!("! {}", e);
                }
            });
        }
        CliCommand::PostAs { username, text } => {
            remote.post_as(handle.view().room_id, &username, &text);
        }
        CliCommand::React { message_id, emoji } => {
            let handle = handle.clone();
            tokio::spawn(async move {
                match handle.toggle_reaction(message_id, emoji).await {
                    Ok(outcome) => println!("~ reaction {:?}", outcome),
                    Err(e) => println!("! {}", e),
                }
            });
        }
        CliCommand::Older => handle.load_older(),
        CliCommand::Bottom => handle.scroll_to_bottom(),
        CliCommand::Scroll(position) => handle.on_scroll_position_changed(position),
        CliCommand::Offline => {
            remote.set_offline(true);
            handle.set_online(false);
        }
        CliCommand::Online => {
            remote.set_offline(false);
            handle.set_online(true);
        }
        CliCommand::Hide => handle.set_visible(false),
        CliCommand::Show => handle.set_visible(true),
        CliCommand::Retry(temp_id) => {
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = handle.retry_send(temp_id).await {
                    println!("! {}", e);
                }
            });
        }
        CliCommand::Discard(temp_id) => handle.discard_failed(temp_id),
        CliCommand::Refresh => handle.refresh(),
        CliCommand::Channels => {
            let handle = handle.clone();
            tokio::spawn(async move {
                match handle.list_rooms().await {
                    Ok(rooms) => {
                        let current = handle.view().room_id;
                        for room in rooms {
                            let mark = if room.id == current { "*" } else { " " };
                            println!("{} {:>3}  #{}", mark, room.id, room.name);
                        }
                    }
                    Err(e) => println!("! {}", e),
                }
            });
        }
        CliCommand::Join(room_id) => handle.join_room(room_id),
        CliCommand::Help => println!("{}", HELP),
        CliCommand::Quit => {}
    }
}

/// Print messages whose rendering changed, plus status transitions.
async fn print_views(mut views: watch::Receiver<ViewState>) {
    let mut rendered: HashMap<MessageKey, String> = HashMap::new();
    let mut status: Option<(ConnectionState, usize, Option<String>)> = None;
    let mut header: Option<(RoomId, Option<String>)> = None;

    loop {
        let view = views.borrow_and_update().clone();

        let name = view
            .rooms
            .iter()
            .find(|r| r.id == view.room_id)
            .map(|r| r.name.clone());
        let next_header = (view.room_id, name);
        if header.as_ref() != Some(&next_header) {
            if header.as_ref().map(|(id, _)| *id) != Some(view.room_id) {
                rendered.clear();
                status = None;
            }
            let label = next_header.1.as_deref().unwrap_or("?");
            println!("== #{} (room {})", label, view.room_id);
            header = Some(next_header);
        }

        for msg in view.messages.iter() {
            let line = render(msg, &view.username);
            if rendered.get(&msg.key) != Some(&line) {
                println!("{}", line);
                rendered.insert(msg.key.clone(), line);
            }
        }
        rendered.retain(|key, _| view.messages.iter().any(|m| &m.key == key));

        let next = (view.connection_status, view.unviewed_count, view.last_error.clone());
        if status.as_ref() != Some(&next) {
            println!(
                "-- {:?} | {} unread | {} loaded{}{}",
                next.0,
                next.1,
                view.messages.len(),
                if view.has_more_history { "" } else { " (all history)" },
                next.2.as_deref().map(|e| format!(" | error: {}", e)).unwrap_or_default(),
            );
            status = Some(next);
        }

        if views.changed().await.is_err() {
            return;
        }
    }
}

async fn print_directives(mut directives: broadcast::Receiver<ScrollDirective>) {
    loop {
        match directives.recv().await {
            Ok(directive) => println!("~ {:?}", directive),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "scroll directives lagged")
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn render(msg: &Message, me: &str) -> String {
    let id = match &msg.key {
        MessageKey::Server(id) => id.to_string(),
        MessageKey::Temp(temp) => temp.to_string(),
    };
    let badge = if msg.is_authenticated { "✓" } else { "" };
    let mut line = format!(
        "[{}] {} {}{}: {}",
        id,
        msg.created_at.format("%H:%M:%S"),
        msg.username,
        badge,
        msg.text
    );
    for group in summarize(&msg.reactions, me) {
        let mark = if group.reacted_by_me { "*" } else { "" };
        line.push_str(&format!("  {}{}{}", group.emoji, group.count, mark));
    }
    match &msg.delivery {
        Delivery::Pending => line.push_str("  (sending)"),
        Delivery::Failed { reason } => {
            line.push_str(&format!("  (failed: {}; /retry {})", reason, id))
        }
        Delivery::Sent => {}
    }
    line
}
