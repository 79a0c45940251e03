//! Interactive console for the realtime session layer.
//!
//! Reads lines from stdin: plain text is sent as a user turn, lines starting
//! with `/` are commands (`/help` lists them). Backend events are printed as
//! they arrive.

use anyhow::{Context, anyhow};
use clap::Parser;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use voxbridge_realtime::{
    Config, ConnectionConfig, Provider, RealtimeClient, RealtimeEvent, Session, Subscription,
    audio::{AudioSource, PlaybackHandle, PlaybackQueue},
    events::{ContentPayload, ToolResponse},
};

/// voxbridge - talk to a realtime voice backend from the terminal
#[derive(Parser, Debug)]
#[command(name = "voxbridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Transport to start on (webrtc or websocket). Overrides REALTIME_PROVIDER.
    #[arg(short = 'p', long = "provider")]
    provider: Option<String>,

    /// Voice for the assistant's audio.
    #[arg(long)]
    voice: Option<String>,

    /// System instructions for the session.
    #[arg(short = 'i', long)]
    instructions: Option<String>,

    /// Do not connect until `/connect` is entered.
    #[arg(long)]
    no_connect: bool,
}

const HELP: &str = "\
/connect            connect the active provider
/disconnect         close the connection
/switch <provider>  move to webrtc or websocket
/record             start streaming the microphone
/stop               stop streaming and end the turn
/status             show provider and connection state
/quit               leave";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(value) = &cli.provider {
        config.provider = Provider::parse(value)
            .ok_or_else(|| anyhow!("unknown provider '{}', expected webrtc or websocket", value))?;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(provider = %config.provider, "Configuration loaded");

    // --- 3. Build the session ---
    let playback = spawn_playback()?;
    let session =
        Session::from_config(&config, playback).context("Failed to build realtime session")?;
    let client = RealtimeClient::spawn(session);
    let events = client.subscribe().await?;
    tokio::spawn(print_events(events, client.clone()));

    if !cli.no_connect {
        let connection = connection_config(&config, config.provider, &cli);
        if let Err(e) = client.connect(connection).await {
            error!(error = %e, "Initial connect failed, use /connect to retry");
        }
    }

    // --- 4. Run the prompt until stdin closes or Ctrl+C ---
    println!("{}", HELP);
    tokio::select! {
        result = repl(&client, &config, &cli) => result?,
        _ = shutdown_signal() => {}
    }

    client.disconnect().await?;
    info!("Bye");
    Ok(())
}

/// Listens for the `Ctrl+C` signal.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

fn connection_config(config: &Config, provider: Provider, cli: &Cli) -> ConnectionConfig {
    let mut connection = config.connection_config(provider);
    if let Some(voice) = &cli.voice {
        connection = connection.with_voice(voice);
    }
    if let Some(instructions) = &cli.instructions {
        connection = connection.with_instructions(instructions);
    }
    connection
}

async fn repl(client: &RealtimeClient, config: &Config, cli: &Cli) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut words = line.split_whitespace();
        match words.next() {
            Some("/quit") | Some("/exit") => break,
            Some("/help") => println!("{}", HELP),
            Some("/connect") => {
                let (provider, _) = client.status().await?;
                if let Err(e) = client.connect(connection_config(config, provider, cli)).await {
                    println!("connect failed: {}", e);
                }
            }
            Some("/disconnect") => {
                if !client.disconnect().await? {
                    println!("not connected");
                }
            }
            Some("/switch") => {
                let Some(provider) = words.next().and_then(Provider::parse) else {
                    println!("usage: /switch <webrtc|websocket>");
                    continue;
                };
                match client.switch_provider(provider).await {
                    Ok(true) => println!("switched to {}, use /connect", provider),
                    Ok(false) => println!("already on {}", provider),
                    Err(e) => println!("switch failed: {}", e),
                }
            }
            Some("/record") => match microphone() {
                Some(source) => {
                    if let Err(e) = client.start_recording(source).await {
                        println!("cannot record: {}", e);
                    }
                }
                None => println!("built without microphone support"),
            },
            Some("/stop") => {
                if !client.stop_recording().await? {
                    println!("not recording");
                }
            }
            Some("/status") => {
                let (provider, status) = client.status().await?;
                println!("{} ({})", provider, status);
            }
            Some(command) if command.starts_with('/') => {
                println!("unknown command {}, try /help", command)
            }
            _ => {
                if !client.send_text(line).await? {
                    println!("not connected, text dropped");
                }
            }
        }
    }
    Ok(())
}

async fn print_events(mut events: Subscription, client: RealtimeClient) {
    while let Some(event) = events.recv().await {
        match event {
            RealtimeEvent::Content(ContentPayload { text, done, .. }) => {
                if done {
                    println!();
                } else {
                    print!("{}", text);
                    let _ = std::io::stdout().flush();
                }
            }
            RealtimeEvent::Audio(pcm16) => debug!(bytes = pcm16.len(), "Assistant audio"),
            RealtimeEvent::ToolCall(call) => {
                // No tools are registered by the console; answer so the turn can finish.
                warn!(name = %call.name, "Backend requested an unknown tool");
                let response = ToolResponse {
                    call_id: call.call_id,
                    output: serde_json::json!({ "error": format!("unknown tool {}", call.name) }),
                };
                if let Err(e) = client.send_tool_response(response).await {
                    error!(error = %e, "Failed to answer tool call");
                }
            }
            RealtimeEvent::Error(message) => println!("[error] {}", message),
            other => println!("[{}]", other.name()),
        }
    }
}

#[cfg(feature = "native-audio")]
fn spawn_playback() -> anyhow::Result<PlaybackHandle> {
    use voxbridge_realtime::audio::SpeakerSink;

    let sink = SpeakerSink::open().context("Failed to open speaker")?;
    Ok(PlaybackQueue::spawn(sink))
}

#[cfg(not(feature = "native-audio"))]
fn spawn_playback() -> anyhow::Result<PlaybackHandle> {
    Ok(PlaybackQueue::spawn(voxbridge_realtime::audio::NullSink))
}

#[cfg(feature = "native-audio")]
fn microphone() -> Option<Box<dyn AudioSource>> {
    Some(Box::new(voxbridge_realtime::audio::MicrophoneSource::new()))
}

#[cfg(not(feature = "native-audio"))]
fn microphone() -> Option<Box<dyn AudioSource>> {
    None
}
