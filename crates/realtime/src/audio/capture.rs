//! Microphone capture: fixed-size PCM16 frames, forwarded one by one or in
//! time-windowed batches.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use super::pcm;
use crate::error::{RealtimeError, RealtimeResult};

/// A producer of mono PCM16 samples at [`pcm::PCM16_SAMPLE_RATE`].
#[async_trait]
pub trait AudioSource: Send {
    /// Starts the device. Chunks may have any length.
    async fn start(&mut self) -> RealtimeResult<mpsc::Receiver<Vec<i16>>>;

    /// Stops the device. The source may still deliver what it captured
    /// before the stop, but must drop its sender once done so the receiver
    /// sees the end of the stream.
    async fn stop(&mut self);
}

/// How captured frames are handed to the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Every frame is forwarded as soon as it is complete.
    Immediate,
    /// Frames accumulate until `window` worth of audio is buffered or the
    /// window timer fires.
    Batched { window: Duration },
}

/// Cuts an arbitrary chunk stream into frames of a fixed sample count.
#[derive(Debug)]
pub struct Framer {
    frame_samples: usize,
    pending: Vec<i16>,
}

impl Framer {
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
        }
    }

    pub fn push(&mut self, chunk: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(chunk);
        let complete = self.pending.len() / self.frame_samples;
        let mut frames = Vec::with_capacity(complete);
        for _ in 0..complete {
            let rest = self.pending.split_off(self.frame_samples);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }

    /// The trailing partial frame, if any samples are left over.
    pub fn finish(&mut self) -> Option<Vec<i16>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

#[derive(Debug)]
struct Batcher {
    window: Option<Duration>,
    frames_per_batch: usize,
    buffer: BytesMut,
    frames: usize,
}

impl Batcher {
    fn new(policy: DeliveryPolicy, frame_samples: usize) -> Self {
        let (window, frames_per_batch) = match policy {
            DeliveryPolicy::Immediate => (None, 1),
            DeliveryPolicy::Batched { window } => {
                let per_batch = pcm::samples_in(window) / frame_samples.max(1);
                (Some(window), per_batch.max(1))
            }
        };
        Self {
            window,
            frames_per_batch,
            buffer: BytesMut::new(),
            frames: 0,
        }
    }

    fn push(&mut self, frame: &[i16]) -> Option<Bytes> {
        self.buffer.extend_from_slice(&pcm::to_le_bytes(frame));
        self.frames += 1;
        if self.frames >= self.frames_per_batch {
            self.flush()
        } else {
            None
        }
    }

    fn flush(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        self.frames = 0;
        Some(self.buffer.split().freeze())
    }
}

/// A running capture pipeline.
///
/// Read batches with [`CaptureHandle::next_chunk`]; [`CaptureHandle::stop`]
/// returns everything still in flight, tail included.
#[derive(Debug)]
pub struct CaptureHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    output: mpsc::Receiver<Bytes>,
    task: JoinHandle<()>,
}

impl CaptureHandle {
    pub async fn start(
        mut source: Box<dyn AudioSource>,
        frame_samples: usize,
        policy: DeliveryPolicy,
    ) -> RealtimeResult<Self> {
        let chunks = source.start().await.map_err(|e| match e {
            RealtimeError::Media(_) => e,
            other => RealtimeError::Media(other.to_string()),
        })?;
        info!(?policy, frame_samples, "Audio capture started");

        let (stop_tx, stop_rx) = oneshot::channel();
        let (out_tx, output) = mpsc::channel(64);
        let pipeline = Pipeline {
            framer: Framer::new(frame_samples),
            batcher: Batcher::new(policy, frame_samples),
            out: out_tx,
        };
        let task = tokio::spawn(pipeline.run(source, chunks, stop_rx));

        Ok(Self {
            stop_tx: Some(stop_tx),
            output,
            task,
        })
    }

    /// The next unit to hand to the transport, in capture order.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.output.recv().await
    }

    /// Stops the source and drains the pipeline: the partial frame and the
    /// partial batch come back last.
    pub async fn stop(mut self) -> Vec<Bytes> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let mut remaining = Vec::new();
        while let Some(chunk) = self.output.recv().await {
            remaining.push(chunk);
        }
        if let Err(e) = self.task.await {
            warn!(error = ?e, "Audio capture task ended abnormally");
        }
        debug!(chunks = remaining.len(), "Audio capture drained");
        remaining
    }
}

struct Pipeline {
    framer: Framer,
    batcher: Batcher,
    out: mpsc::Sender<Bytes>,
}

impl Pipeline {
    async fn run(
        mut self,
        mut source: Box<dyn AudioSource>,
        mut chunks: mpsc::Receiver<Vec<i16>>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let mut ticker = self.batcher.window.map(|window| {
            let mut ticker = tokio::time::interval_at(Instant::now() + window, window);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => {
                        if !self.accept(&chunk).await {
                            source.stop().await;
                            return;
                        }
                    }
                    None => break,
                },
                _ = next_tick(&mut ticker) => {
                    if let Some(batch) = self.batcher.flush() {
                        if self.out.send(batch).await.is_err() {
                            source.stop().await;
                            return;
                        }
                    }
                }
            }
        }

        source.stop().await;
        while let Some(chunk) = chunks.recv().await {
            if !self.accept(&chunk).await {
                return;
            }
        }
        if let Some(tail) = self.framer.finish() {
            if let Some(batch) = self.batcher.push(&tail) {
                let _ = self.out.send(batch).await;
            }
        }
        if let Some(batch) = self.batcher.flush() {
            let _ = self.out.send(batch).await;
        }
        info!("Audio capture stopped");
    }

    /// Returns `false` once nobody reads the output any more.
    async fn accept(&mut self, chunk: &[i16]) -> bool {
        for frame in self.framer.push(chunk) {
            if let Some(batch) = self.batcher.push(&frame) {
                if self.out.send(batch).await.is_err() {
                    return false;
                }
            }
        }
        true
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
