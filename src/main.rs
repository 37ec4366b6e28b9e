use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voicemesh::config::{SessionConfig, DEFAULT_RELAY_URL, DEFAULT_STUN_URL};
use voicemesh::session::{RoomSession, RoomUpdate, SessionCommand};

#[derive(Debug, Parser)]
#[command(
    name = "voicemesh",
    about = "Full-mesh voice chat over a signaling relay",
    version
)]
struct Cli {
    /// WebSocket URL of the signaling relay.
    #[arg(long, default_value = DEFAULT_RELAY_URL)]
    relay: String,

    /// Room to join.
    #[arg(long, default_value = "lobby")]
    room: String,

    /// Display name; generated when omitted.
    #[arg(long)]
    username: Option<String>,

    /// ICE server for the media engine; repeat for more than one.
    #[arg(long = "ice-server", default_value = DEFAULT_STUN_URL)]
    ice_servers: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voicemesh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let username = cli
        .username
        .unwrap_or_else(|| format!("user-{}", rand::random::<u32>()));
    let config = SessionConfig {
        relay_url: cli.relay,
        ice_servers: cli.ice_servers,
        ..SessionConfig::default()
    };

    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let (mut session, handle) = RoomSession::join(&config, &username, &cli.room, updates_tx)
        .context("could not join the room")?;

    println!("joined room '{}' as '{}'", cli.room, username);
    println!("type to chat, /mute to toggle the microphone, /quit to leave");

    let printer = tokio::spawn(async move {
        while let Some(update) = updates_rx.recv().await {
            match update {
                RoomUpdate::Chat { from, content } => println!("{from}: {content}"),
                RoomUpdate::Notice(text) => println!("* {text}"),
                RoomUpdate::Roster(names) => {
                    if names.is_empty() {
                        println!("* nobody else is here");
                    } else {
                        println!("* in the room: {}", names.join(", "));
                    }
                }
            }
        }
    });

    let input = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let command = match line.trim() {
                        "" => continue,
                        "/quit" => SessionCommand::Leave,
                        "/mute" => SessionCommand::ToggleMute,
                        _ => SessionCommand::Chat(line),
                    };
                    let leaving = matches!(command, SessionCommand::Leave);
                    if !input.send(command) || leaving {
                        break;
                    }
                }
                Ok(None) | Err(_) => {
                    let _ = input.send(SessionCommand::Leave);
                    break;
                }
            }
        }
    });

    session.run().await;
    printer.abort();
    Ok(())
}
