//! Sequential playback of assistant audio with barge-in support.

use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::pcm;
use crate::error::RealtimeResult;

/// An output device.
#[async_trait]
pub trait AudioSink: Send {
    /// Plays `samples` (mono, normalized) and resolves once they have been played.
    ///
    /// The future may be dropped part way through; `halt` follows in that case.
    async fn play(&mut self, samples: &[f32]) -> RealtimeResult<()>;

    /// Silences whatever the device still holds.
    async fn halt(&mut self);
}

/// Discards audio. Used when no output device is configured.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl AudioSink for NullSink {
    async fn play(&mut self, _samples: &[f32]) -> RealtimeResult<()> {
        Ok(())
    }

    async fn halt(&mut self) {}
}

#[derive(Debug)]
enum PlaybackCommand {
    Enqueue(Vec<f32>),
    Interrupt,
    Pending(oneshot::Sender<usize>),
    Shutdown,
}

/// Cloneable handle to the playback task.
#[derive(Clone, Debug)]
pub struct PlaybackHandle {
    tx: mpsc::UnboundedSender<PlaybackCommand>,
}

impl PlaybackHandle {
    /// Queues PCM16 little-endian audio behind whatever is already playing.
    pub fn enqueue(&self, pcm16: &[u8]) {
        let samples = pcm::bytes_to_f32(pcm16);
        if samples.is_empty() {
            return;
        }
        self.send(PlaybackCommand::Enqueue(samples));
    }

    /// Drops every queued buffer and cuts the one playing.
    pub fn interrupt(&self) {
        self.send(PlaybackCommand::Interrupt);
    }

    /// Buffers queued or playing. Zero once the task has stopped.
    pub async fn pending(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        self.send(PlaybackCommand::Pending(tx));
        rx.await.unwrap_or(0)
    }

    pub fn shutdown(&self) {
        self.send(PlaybackCommand::Shutdown);
    }

    fn send(&self, command: PlaybackCommand) {
        if self.tx.send(command).is_err() {
            debug!("Playback task has stopped, dropping command");
        }
    }
}

pub struct PlaybackQueue;

impl PlaybackQueue {
    /// Spawns the playback task on the current runtime.
    pub fn spawn<S>(sink: S) -> PlaybackHandle
    where
        S: AudioSink + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(sink, rx));
        PlaybackHandle { tx }
    }
}

enum Outcome {
    Finished,
    Interrupted,
    Shutdown,
}

async fn run<S: AudioSink>(mut sink: S, mut rx: mpsc::UnboundedReceiver<PlaybackCommand>) {
    let mut queue: VecDeque<Vec<f32>> = VecDeque::new();

    loop {
        let Some(buffer) = queue.pop_front() else {
            match rx.recv().await {
                Some(PlaybackCommand::Enqueue(samples)) => queue.push_back(samples),
                Some(PlaybackCommand::Interrupt) => sink.halt().await,
                Some(PlaybackCommand::Pending(reply)) => {
                    let _ = reply.send(0);
                }
                Some(PlaybackCommand::Shutdown) | None => break,
            }
            continue;
        };

        let outcome = {
            let play = sink.play(&buffer);
            tokio::pin!(play);
            loop {
                tokio::select! {
                    biased;
                    command = rx.recv() => match command {
                        Some(PlaybackCommand::Enqueue(samples)) => queue.push_back(samples),
                        Some(PlaybackCommand::Interrupt) => break Outcome::Interrupted,
                        Some(PlaybackCommand::Pending(reply)) => {
                            let _ = reply.send(queue.len() + 1);
                        }
                        Some(PlaybackCommand::Shutdown) | None => break Outcome::Shutdown,
                    },
                    result = &mut play => {
                        if let Err(e) = result {
                            warn!(error = %e, "Audio sink failed to play buffer");
                        }
                        break Outcome::Finished;
                    }
                }
            }
        };

        match outcome {
            Outcome::Finished => {}
            Outcome::Interrupted => {
                debug!(dropped = queue.len(), "Playback interrupted");
                queue.clear();
                sink.halt().await;
            }
            Outcome::Shutdown => {
                sink.halt().await;
                break;
            }
        }
    }
    info!("Playback task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Recorder {
        played: Arc<Mutex<Vec<Vec<f32>>>>,
    }

    /// Takes 10 ms per buffer.
    struct PacedSink {
        recorder: Recorder,
    }

    #[async_trait]
    impl AudioSink for PacedSink {
        async fn play(&mut self, samples: &[f32]) -> RealtimeResult<()> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.recorder.played.lock().unwrap().push(samples.to_vec());
            Ok(())
        }

        async fn halt(&mut self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffers_play_in_order_without_overlap() {
        let recorder = Recorder::default();
        let handle = PlaybackQueue::spawn(PacedSink {
            recorder: recorder.clone(),
        });

        handle.enqueue(&pcm::to_le_bytes(&[16384]));
        handle.enqueue(&pcm::to_le_bytes(&[-16384, 0]));
        handle.enqueue(&[]);
        assert_eq!(handle.pending().await, 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.pending().await, 0);

        let played = recorder.played.lock().unwrap().clone();
        assert_eq!(played, vec![vec![0.5], vec![-0.5, 0.0]]);
    }

    #[tokio::test]
    async fn test_pending_is_zero_after_shutdown() {
        let handle = PlaybackQueue::spawn(NullSink);
        handle.shutdown();
        tokio::task::yield_now().await;
        assert_eq!(handle.pending().await, 0);
    }
}
