mod cli;
mod config;
mod handlers;
mod logging;

use crate::{
    cli::{Args, Commands},
    config::AppConfig,
    handlers::ConsoleHandler,
};
use anyhow::{Context, Result, bail};
use blive::{RoomClient, RoomTarget};
use clap::Parser;
use std::{
    process,
    sync::{Arc, atomic::Ordering},
};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {:#}", e);
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(log_dir) = args.log_dir {
        config.log_dir = log_dir;
    }
    let _guard = logging::init_logging(&config.log_dir)?;
    blive::api::install_rustls_provider();

    match args.command {
        Commands::Listen {
            rooms,
            users,
            monitor,
            save_history,
        } => {
            for room in rooms {
                if !config.rooms.contains(&room) {
                    config.rooms.push(room);
                }
            }
            for uid in users {
                if !config.users.contains(&uid) {
                    config.users.push(uid);
                }
            }
            config.monitor |= monitor;
            if save_history.is_some() {
                config.client.history_dir = save_history;
            }
            listen(config).await
        }
        Commands::Send {
            room,
            message,
            reply_uid,
            reply_uname,
        } => {
            let reply = reply_uid.zip(reply_uname);
            send(config, room, &message, reply).await
        }
    }
}

async fn listen(config: AppConfig) -> Result<()> {
    if config.rooms.is_empty() && config.users.is_empty() {
        bail!("No rooms to listen to: pass --rooms/--users, set LIVE_ROOM_ID or add `rooms` to blive.toml");
    }

    // one HTTP client for every room
    let http = blive::api::default_client(config.client.http_timeout())?;
    let console = Arc::new(ConsoleHandler::default());

    let targets = config
        .rooms
        .iter()
        .map(|&id| RoomTarget::Room(id))
        .chain(config.users.iter().map(|&uid| RoomTarget::User(uid)));

    let mut clients = Vec::new();
    for target in targets {
        let builder = match target {
            RoomTarget::Room(id) => RoomClient::builder().room(id),
            RoomTarget::User(uid) => RoomClient::builder().user(uid),
        };
        let client = Arc::new(
            builder
                .config(config.client.clone())
                .http_client(http.clone())
                .registry(handlers::console_registry(console.clone()))
                .build()
                .with_context(|| format!("Failed to create client for {target:?}"))?,
        );

        if config.monitor {
            client.spawn_live_monitor(true);
        } else if let Err(e) = client.start().await {
            error!(?target, "Failed to start: {}", e);
        }
        clients.push(client);
    }

    info!("Listening to {} room(s), press Ctrl+C to stop", clients.len());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutting down");
    futures::future::join_all(clients.iter().map(|client| client.close())).await;

    let counters = console.counters();
    info!(
        danmaku = counters.danmaku.load(Ordering::Relaxed),
        entries = counters.entries.load(Ordering::Relaxed),
        shares = counters.shares.load(Ordering::Relaxed),
        "Stopped"
    );
    Ok(())
}

async fn send(config: AppConfig, room: u64, message: &str, reply: Option<(u64, String)>) -> Result<()> {
    let client = RoomClient::builder()
        .room(room)
        .config(config.client)
        .build()
        .context("Failed to create client")?;

    let result = client
        .send_message(message, reply.as_ref().map(|(uid, name)| (*uid, name.as_str())))
        .await;
    client.close().await;

    let status = result.context("Failed to send message")?;
    if !status.is_success() {
        bail!("Message rejected: {status:?}");
    }
    println!("[{room}] | sent: {message}");
    Ok(())
}
