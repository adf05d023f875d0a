use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::prelude::*;

use live_chat::config::{FileConfig, LiveChatConfig, SessionConfig, load_config};
use live_chat::credentials::FallbackCredential;
use live_chat::{
    ChannelKey, ChatError, ChatSession, ConnectionState, HttpHistoryFetcher, Message, MessageId,
    SessionUpdate, StompTransport,
};

type Session = ChatSession<StompTransport, HttpHistoryFetcher, FallbackCredential>;

#[derive(Parser)]
#[command(name = "live-chat")]
#[command(about = "Terminal client for live chat channels")]
struct Cli {
    /// Custom data directory (defaults to ~/.live-chat)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Channel to join: "global" or "event:<id>"
    #[arg(short, long, default_value = "global")]
    channel: ChannelKey,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

struct Settings {
    dirs: LiveChatConfig,
    file: FileConfig,
    session: SessionConfig,
}

impl Settings {
    fn open(&self, channel: ChannelKey) -> Result<Session> {
        let transport =
            StompTransport::new().with_connect_timeout(self.session.connect_timeout);
        let history =
            HttpHistoryFetcher::new(&self.file.server.http_base_url, self.session.history_timeout)
                .context("Failed to build history client")?;
        let credentials = self.file.auth.credential_source(&self.dirs.data_dir);
        Ok(ChatSession::activate(
            channel,
            self.file.server.ws_endpoint.clone(),
            transport,
            history,
            credentials,
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the chat.
    let default_directive = if cli.debug {
        "live_chat=debug,info"
    } else {
        "live_chat=warn,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let dirs = LiveChatConfig::new(cli.data_dir)?;
    let file: FileConfig = load_config(&dirs.data_dir)
        .extract()
        .with_context(|| format!("Invalid config: {}", dirs.config_toml_path().display()))?;
    let settings = Settings {
        session: SessionConfig::from_file(&file.session),
        file,
        dirs,
    };
    info!(endpoint = %settings.file.server.ws_endpoint, "starting live chat");

    run(settings, cli.channel).await
}

async fn run(settings: Settings, channel: ChannelKey) -> Result<()> {
    let mut session = settings.open(channel)?;
    let mut printed: HashSet<MessageId> = HashSet::new();
    let mut attempts: u32 = 0;
    let mut retry_at: Option<Instant> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    eprintln!("* joining {} (/join <channel>, /reconnect, /quit)", session.channel());

    loop {
        tokio::select! {
            update = session.next_update() => {
                let Some(update) = update else { break };
                match update {
                    SessionUpdate::MessagesChanged { .. } => {
                        print_new(session.messages(), &mut printed);
                    }
                    SessionUpdate::ConnectionChanged(ConnectionState::Subscribed) => {
                        attempts = 0;
                        eprintln!("* listening on {}", session.channel());
                    }
                    SessionUpdate::ConnectionChanged(ConnectionState::Closed) => {
                        let max = settings.session.max_reconnect_attempts;
                        if attempts < max {
                            attempts += 1;
                            let delay = settings.session.reconnect_delay;
                            retry_at = Some(Instant::now() + delay);
                            eprintln!(
                                "* disconnected, retrying in {}s ({attempts}/{max})",
                                delay.as_secs()
                            );
                        } else {
                            eprintln!("* disconnected; type /reconnect to try again");
                        }
                    }
                    SessionUpdate::ConnectionChanged(state) => debug!(%state, "connection"),
                    SessionUpdate::ConnectFailed(e) | SessionUpdate::HistoryFailed(e) => {
                        eprintln!("! {e}");
                    }
                    SessionUpdate::MessageDropped(e) => debug!(error = %e, "message dropped"),
                }
            }

            _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                retry_at = None;
                session.reconnect()?;
            }

            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else { break };
                let line = line.trim();
                match line.split_once(' ').map_or((line, ""), |(cmd, rest)| (cmd, rest.trim())) {
                    ("/quit", _) => break,
                    ("/reconnect", _) => {
                        attempts = 0;
                        retry_at = None;
                        session.reconnect()?;
                    }
                    ("/join", target) => match target.parse::<ChannelKey>() {
                        Ok(next) => {
                            session.deactivate();
                            drop(session);
                            printed.clear();
                            attempts = 0;
                            retry_at = None;
                            session = settings.open(next)?;
                            eprintln!("* joining {}", session.channel());
                        }
                        Err(e) => eprintln!("! {e}"),
                    },
                    _ => send(&session, &settings, line),
                }
            }
        }
    }

    session.deactivate();
    Ok(())
}

fn send(session: &Session, settings: &Settings, text: &str) {
    match session.send(text) {
        Ok(()) | Err(ChatError::EmptyMessage) => {}
        Err(ChatError::Unauthenticated) => eprintln!(
            "! not signed in: set {} or write a token to {}",
            settings.file.auth.token_env,
            settings
                .file
                .auth
                .token_file
                .clone()
                .unwrap_or_else(|| settings.dirs.token_path())
                .display()
        ),
        Err(e) => eprintln!("! {e}"),
    }
}

fn print_new(messages: &[Message], printed: &mut HashSet<MessageId>) {
    for msg in messages {
        if printed.insert(msg.id.clone()) {
            println!(
                "[{}] {}: {}",
                msg.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S"),
                msg.sender,
                msg.body
            );
        }
    }
}
