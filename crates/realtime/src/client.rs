//! A cloneable handle that drives a [`Session`] from a single task.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::{
    audio::AudioSource,
    config::{ConnectionConfig, Provider},
    error::{RealtimeError, RealtimeResult},
    events::{Subscription, ToolResponse},
    session::{Session, SessionStatus},
};

enum Command {
    Connect {
        config: Option<ConnectionConfig>,
        reply: oneshot::Sender<RealtimeResult<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<bool>,
    },
    SendAudio {
        pcm16: Bytes,
        reply: oneshot::Sender<bool>,
    },
    SendText {
        text: String,
        reply: oneshot::Sender<bool>,
    },
    SendToolResponse {
        response: ToolResponse,
        reply: oneshot::Sender<bool>,
    },
    SwitchProvider {
        target: Provider,
        reply: oneshot::Sender<RealtimeResult<bool>>,
    },
    UpdateConfig {
        config: ConnectionConfig,
        reply: oneshot::Sender<RealtimeResult<()>>,
    },
    StartRecording {
        source: Box<dyn AudioSource>,
        reply: oneshot::Sender<RealtimeResult<()>>,
    },
    StopRecording {
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<(Provider, SessionStatus)>,
    },
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
}

/// Handle to a session running on its own task.
///
/// Commands are applied strictly in the order they are sent. The task stops,
/// disconnecting the session, once every handle is dropped.
#[derive(Clone, Debug)]
pub struct RealtimeClient {
    tx: mpsc::Sender<Command>,
}

impl RealtimeClient {
    pub fn spawn(session: Session) -> Self {
        let (tx, rx) = mpsc::channel(128);
        tokio::spawn(run(session, rx));
        Self { tx }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> RealtimeResult<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| RealtimeError::ClientClosed)?;
        response.await.map_err(|_| RealtimeError::ClientClosed)
    }

    pub async fn connect(&self, config: ConnectionConfig) -> RealtimeResult<()> {
        self.request(|reply| Command::Connect {
            config: Some(config),
            reply,
        })
        .await?
    }

    /// Connects with the session's current configuration.
    pub async fn connect_default(&self) -> RealtimeResult<()> {
        self.request(|reply| Command::Connect {
            config: None,
            reply,
        })
        .await?
    }

    pub async fn disconnect(&self) -> RealtimeResult<bool> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    pub async fn send_audio(&self, pcm16: Bytes) -> RealtimeResult<bool> {
        self.request(|reply| Command::SendAudio { pcm16, reply })
            .await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> RealtimeResult<bool> {
        let text = text.into();
        self.request(|reply| Command::SendText { text, reply }).await
    }

    pub async fn send_tool_response(&self, response: ToolResponse) -> RealtimeResult<bool> {
        self.request(|reply| Command::SendToolResponse { response, reply })
            .await
    }

    pub async fn switch_provider(&self, target: Provider) -> RealtimeResult<bool> {
        self.request(|reply| Command::SwitchProvider { target, reply })
            .await?
    }

    pub async fn update_config(&self, config: ConnectionConfig) -> RealtimeResult<()> {
        self.request(|reply| Command::UpdateConfig { config, reply })
            .await?
    }

    pub async fn start_recording(&self, source: Box<dyn AudioSource>) -> RealtimeResult<()> {
        self.request(|reply| Command::StartRecording { source, reply })
            .await?
    }

    pub async fn stop_recording(&self) -> RealtimeResult<bool> {
        self.request(|reply| Command::StopRecording { reply }).await
    }

    pub async fn status(&self) -> RealtimeResult<(Provider, SessionStatus)> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn subscribe(&self) -> RealtimeResult<Subscription> {
        self.request(|reply| Command::Subscribe { reply }).await
    }
}

async fn run(mut session: Session, mut rx: mpsc::Receiver<Command>) {
    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Connect { config, reply }) => {
                    if !connect(&mut session, &mut rx, config, reply).await {
                        break;
                    }
                }
                Some(command) => apply(&mut session, command).await,
                None => break,
            },
            input = session.next_input() => session.handle_input(input).await,
        }
    }
    info!("All client handles dropped, closing realtime session");
    session.close().await;
}

/// Drives one connect attempt while still listening for commands.
///
/// A disconnect, or a switch to another registered provider, arriving
/// mid-handshake drops the attempt and tears the adapter down. Switches that
/// would be a no-op or are refused are answered without touching the attempt.
/// Returns `false` once every handle is gone.
async fn connect(
    session: &mut Session,
    rx: &mut mpsc::Receiver<Command>,
    config: Option<ConnectionConfig>,
    reply: oneshot::Sender<RealtimeResult<()>>,
) -> bool {
    let config = config.unwrap_or_else(|| session.config().clone());
    let provider = session.provider();
    let switchable: Vec<Provider> = [Provider::WebRtc, Provider::WebSocket]
        .into_iter()
        .filter(|target| *target != provider && session.supports(*target))
        .collect();
    let mut deferred = Vec::new();

    let interrupted = {
        let attempt = session.connect(config);
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                result = &mut attempt => {
                    let _ = reply.send(result);
                    break None;
                }
                command = rx.recv() => match command {
                    Some(Command::Connect { reply, .. }) => {
                        let _ = reply.send(Err(RealtimeError::Misuse(
                            "connect already in progress".to_string(),
                        )));
                    }
                    Some(Command::SwitchProvider { target, reply }) if !switchable.contains(&target) => {
                        let _ = reply.send(refuse_switch(provider, target));
                    }
                    Some(command @ (Command::Disconnect { .. } | Command::SwitchProvider { .. })) => {
                        break Some((reply, Some(command)));
                    }
                    Some(Command::SendAudio { reply, .. })
                    | Some(Command::SendText { reply, .. })
                    | Some(Command::SendToolResponse { reply, .. }) => {
                        debug!("Dropping send while connecting");
                        let _ = reply.send(false);
                    }
                    Some(Command::Status { reply }) => {
                        let _ = reply.send((provider, SessionStatus::Connecting));
                    }
                    Some(command) => deferred.push(command),
                    None => break Some((reply, None)),
                },
            }
        }
    };

    let mut keep_running = true;
    if let Some((reply, command)) = interrupted {
        info!(provider = %provider, "Connect attempt aborted");
        let _ = reply.send(Err(RealtimeError::Connection(
            "connect attempt aborted".to_string(),
        )));
        let torn_down = session.disconnect().await;
        match command {
            Some(Command::Disconnect { reply }) => {
                let _ = reply.send(torn_down);
            }
            Some(command) => apply(session, command).await,
            None => keep_running = false,
        }
    }
    for command in deferred {
        apply(session, command).await;
    }
    keep_running
}

/// The answer to a switch that cannot interrupt a pending connect.
fn refuse_switch(current: Provider, target: Provider) -> RealtimeResult<bool> {
    if target == current {
        debug!(provider = %target, "Already on requested provider");
        Ok(false)
    } else {
        Err(RealtimeError::Misuse(format!(
            "no adapter registered for {}",
            target
        )))
    }
}

async fn apply(session: &mut Session, command: Command) {
    match command {
        Command::Connect { config, reply } => {
            let config = config.unwrap_or_else(|| session.config().clone());
            let _ = reply.send(session.connect(config).await);
        }
        Command::Disconnect { reply } => {
            let _ = reply.send(session.disconnect().await);
        }
        Command::SendAudio { pcm16, reply } => {
            let _ = reply.send(session.send_audio(pcm16).await);
        }
        Command::SendText { text, reply } => {
            let _ = reply.send(session.send_text(&text).await);
        }
        Command::SendToolResponse { response, reply } => {
            let _ = reply.send(session.send_tool_response(&response).await);
        }
        Command::SwitchProvider { target, reply } => {
            let _ = reply.send(session.switch_provider(target).await);
        }
        Command::UpdateConfig { config, reply } => {
            let _ = reply.send(session.update_config(config).await);
        }
        Command::StartRecording { source, reply } => {
            let _ = reply.send(session.start_recording(source).await);
        }
        Command::StopRecording { reply } => {
            let _ = reply.send(session.stop_recording().await);
        }
        Command::Status { reply } => {
            let _ = reply.send((session.provider(), session.status()));
        }
        Command::Subscribe { reply } => {
            let _ = reply.send(session.subscribe());
        }
    }
}
