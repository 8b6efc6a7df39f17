//! Hushlink - end-to-end encrypted peer-to-peer chat in the terminal
//!
//! Joins a relay room, negotiates a direct QUIC channel with the other
//! peer and exchanges encrypted text and images over it.

mod commands;
mod state;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use crypto_session::Identity;
use net_transport::{QuicConfig, QuicTransport};
use relay_client::{RelayClient, RelayConfig, RelayEvent};
use secure_session::{OutgoingMessage, SecureSession, SessionConfig, SessionEvent};
use shared_protocol::RoomId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use commands::{Command, HELP, load_image};
use state::AppState;

#[derive(Parser, Debug)]
#[command(name = "hushlink")]
#[command(version)]
#[command(about = "End-to-end encrypted peer-to-peer chat")]
struct Cli {
    /// Relay WebSocket URL
    #[arg(long, env = "HUSHLINK_RELAY_URL", default_value = "ws://localhost:8080")]
    relay_url: String,

    /// Room to join; a random one is generated when omitted
    #[arg(short, long, env = "HUSHLINK_ROOM")]
    room: Option<String>,

    /// Address advertised to the peer for the direct channel
    #[arg(long, env = "HUSHLINK_ADVERTISE_IP")]
    advertise_ip: Option<IpAddr>,

    /// Seconds allowed for the handshake to complete
    #[arg(long, default_value_t = secure_session::DEFAULT_HANDSHAKE_TIMEOUT_SECS)]
    handshake_timeout: u64,

    /// Log filter directives
    #[arg(long, env = "RUST_LOG", default_value = "hushlink=info")]
    log: String,
}

/// Per-session plumbing owned by the main loop
struct Wiring {
    relay_tx: mpsc::Sender<RelayEvent>,
    events: mpsc::Receiver<SessionEvent>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).context("invalid log filter")?)
        .with_target(false)
        .init();

    let identity = Identity::generate().context("no secure random source available")?;
    let state = Arc::new(AppState::new(identity, cli.room.as_deref().map(RoomId::from))?);
    state.store_keypair_record()?;

    println!("peer id      {}", state.peer_id);
    println!("room         {}", state.room_id);
    println!("fingerprint  {}", state.identity.fingerprint());

    let relay = RelayClient::new(RelayConfig::new(
        cli.relay_url.clone(),
        state.room_id.clone(),
        state.peer_id.clone(),
    ));
    let (relay_handle, mut relay_rx) = relay
        .connect()
        .await
        .with_context(|| format!("could not reach relay at {}", cli.relay_url))?;

    let quic_config = QuicConfig {
        advertise_ip: cli.advertise_ip,
        ..Default::default()
    };
    let session_config = SessionConfig {
        handshake_timeout: Duration::from_secs(cli.handshake_timeout),
        ..Default::default()
    };

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut wiring: Option<Wiring> = None;

    info!("Waiting for a peer in {}", state.room_id);

    loop {
        tokio::select! {
            event = relay_rx.recv() => {
                let Some(event) = event else {
                    warn!("Relay event stream ended");
                    break;
                };

                let starts_session = matches!(
                    event,
                    RelayEvent::PeerJoined { .. } | RelayEvent::Offer { .. }
                );

                if wiring.is_none() && starts_session {
                    let (transport, transport_rx) = QuicTransport::new(quic_config.clone());
                    let (session, events) = SecureSession::new(
                        state.identity.clone(),
                        transport,
                        relay_handle.clone(),
                        session_config.clone(),
                    );
                    let (relay_tx, session_relay_rx) = mpsc::channel(64);
                    tokio::spawn(session.clone().run(session_relay_rx, transport_rx));
                    state.set_session(session);
                    wiring = Some(Wiring { relay_tx, events });
                }

                match &wiring {
                    Some(w) => {
                        if w.relay_tx.send(event).await.is_err() {
                            warn!("Session no longer accepts relay events");
                        }
                    }
                    None => print_relay_event(&event),
                }
            }

            event = next_session_event(&mut wiring) => {
                let closed = matches!(event, SessionEvent::Closed { .. });
                print_session_event(&event);
                if closed {
                    state.take_session();
                    wiring = None;
                    println!("* waiting for a new peer");
                }
            }

            line = stdin.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match Command::parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(Command::Panic)) => {
                        panic_all(&state, &relay).await;
                        return Ok(());
                    }
                    Ok(Some(command)) => run_command(&state, command).await,
                    Ok(None) => {}
                    Err(e) => println!("! {}", e),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    if let Some(session) = state.take_session() {
        session.close("user quit").await;
    }
    relay.disconnect();
    state.vault.destroy()?;
    Ok(())
}

async fn next_session_event(wiring: &mut Option<Wiring>) -> SessionEvent {
    match wiring.as_mut() {
        Some(w) => match w.events.recv().await {
            Some(event) => event,
            None => SessionEvent::Closed {
                reason: "session ended".to_string(),
            },
        },
        None => std::future::pending().await,
    }
}

async fn run_command(state: &AppState, command: Command) {
    match command {
        Command::Send(text) => send(state, OutgoingMessage::Text(text)).await,
        Command::Image(path) => match load_image(&path) {
            Ok(uri) => send(state, OutgoingMessage::Image(uri)).await,
            Err(e) => println!("! {}", e),
        },
        Command::Fingerprint => {
            println!("* you   {}", state.identity.fingerprint());
            match state.session().and_then(|s| s.remote_fingerprint()) {
                Some(fp) => println!("* peer  {}", fp),
                None => println!("* peer  (no key exchanged yet)"),
            }
        }
        Command::Vault => match state.vault.list_entries() {
            Ok(entries) => {
                for entry in entries {
                    println!("* {} @ {}", entry.key, entry.timestamp);
                }
            }
            Err(e) => println!("! vault: {}", e),
        },
        Command::Help => println!("{}", HELP),
        Command::Quit | Command::Panic => {}
    }
}

async fn send(state: &AppState, message: OutgoingMessage) {
    let Some(session) = state.session() else {
        println!("! no peer connected");
        return;
    };
    if let Err(e) = session.send(message).await {
        println!("! {}", e);
    }
}

/// Destroy the session key, drop the relay and seal the vault
async fn panic_all(state: &AppState, relay: &RelayClient) {
    if let Some(session) = state.take_session() {
        session.panic().await;
    }
    relay.disconnect();
    if let Err(e) = state.vault.panic() {
        error!("Vault panic failed: {}", e);
    }
    println!("* panic: keys and vault destroyed");
}

fn print_relay_event(event: &RelayEvent) {
    match event {
        RelayEvent::Joined { room_id } => println!("* joined {}", room_id),
        RelayEvent::Error { message } => println!("! relay: {}", message),
        RelayEvent::Disconnected => println!("! relay disconnected"),
        other => info!("Relay event outside a session: {:?}", other),
    }
}

fn print_session_event(event: &SessionEvent) {
    match event {
        SessionEvent::Status(message) => println!("* {}", message),
        SessionEvent::PhaseChanged(phase) => info!("Session {}", phase),
        SessionEvent::Text { text, .. } => println!("< {}", text),
        SessionEvent::Image { image, .. } => {
            println!("< [image, {} bytes encoded]", image.len())
        }
        SessionEvent::Error(e) => println!("! {}", e),
        SessionEvent::Closed { reason } => println!("* session closed: {}", reason),
    }
}
