//! `cpal` microphone and speaker, resampled to and from the session rate.
//!
//! A `cpal::Stream` cannot leave the thread that built it, so each device
//! lives on its own std thread. Samples cross over through `ringbuf`.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use ringbuf::{HeapCons, HeapProd, HeapRb, traits::*};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use super::capture::AudioSource;
use super::pcm::{self, PCM16_SAMPLE_RATE};
use super::playback::AudioSink;
use crate::error::{RealtimeError, RealtimeResult};

const RESAMPLER_CHUNK: usize = 480;
/// Two seconds at 48 kHz.
const RING_CAPACITY: usize = 96_000;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn media<E: std::fmt::Display>(context: &str) -> impl FnOnce(E) -> RealtimeError + '_ {
    move |e| RealtimeError::Media(format!("{}: {}", context, e))
}

/// Mono rate conversion with an internal carry-over buffer.
struct RateConverter {
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl RateConverter {
    fn new(from_rate: u32, to_rate: u32) -> RealtimeResult<Self> {
        let resampler = if from_rate == to_rate {
            None
        } else {
            Some(
                FastFixedIn::<f32>::new(
                    to_rate as f64 / from_rate as f64,
                    1.0,
                    PolynomialDegree::Cubic,
                    RESAMPLER_CHUNK,
                    1,
                )
                .map_err(media("failed to create resampler"))?,
            )
        };
        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    fn convert(&mut self, samples: &[f32]) -> RealtimeResult<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let mut converted = resampler
                .process(&[chunk], None)
                .map_err(media("resampling failed"))?;
            out.append(&mut converted[0]);
        }
        Ok(out)
    }

    /// Converts whatever is still buffered, padding the final chunk.
    fn flush(&mut self) -> RealtimeResult<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let chunk = std::mem::take(&mut self.pending);
        let mut converted = resampler
            .process_partial(Some(&[chunk][..]), None)
            .map_err(media("resampling failed"))?;
        Ok(converted.swap_remove(0))
    }

    /// Forgets buffered input and filter state.
    fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// The default input device.
pub struct MicrophoneSource {
    running: Option<Arc<AtomicBool>>,
}

impl MicrophoneSource {
    pub fn new() -> Self {
        Self { running: None }
    }
}

impl Default for MicrophoneSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioSource for MicrophoneSource {
    async fn start(&mut self) -> RealtimeResult<mpsc::Receiver<Vec<i16>>> {
        let running = Arc::new(AtomicBool::new(true));
        let (chunks_tx, chunks_rx) = mpsc::channel(64);
        let (ready_tx, ready_rx) = oneshot::channel();

        let flag = running.clone();
        thread::Builder::new()
            .name("voxbridge-mic".to_string())
            .spawn(move || run_microphone(flag, chunks_tx, ready_tx))
            .map_err(media("failed to spawn microphone thread"))?;

        ready_rx
            .await
            .map_err(|_| RealtimeError::Media("microphone thread exited".to_string()))??;
        self.running = Some(running);
        Ok(chunks_rx)
    }

    async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.store(false, Ordering::SeqCst);
        }
    }
}

fn open_microphone(
    producer: HeapProd<f32>,
) -> RealtimeResult<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| RealtimeError::Media("no input device available".to_string()))?;
    let supported = device
        .default_input_config()
        .map_err(media("no usable input configuration"))?;
    let config: StreamConfig = supported.config();
    let channels = config.channels as usize;
    info!(
        device = %device.name().unwrap_or_default(),
        rate = config.sample_rate.0,
        channels,
        format = ?supported.sample_format(),
        "Opening microphone"
    );

    let mut producer = producer;
    let on_error = |e| error!(error = %e, "Microphone stream error");
    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                producer.push_slice(&downmix(data, channels));
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                producer.push_slice(&downmix(&pcm::convert_i16_to_f32(data), channels));
            },
            on_error,
            None,
        ),
        other => {
            return Err(RealtimeError::Media(format!(
                "unsupported input sample format {:?}",
                other
            )));
        }
    }
    .map_err(media("failed to open microphone"))?;
    stream.play().map_err(media("failed to start microphone"))?;
    Ok((stream, config.sample_rate.0))
}

fn run_microphone(
    running: Arc<AtomicBool>,
    chunks: mpsc::Sender<Vec<i16>>,
    ready: oneshot::Sender<RealtimeResult<()>>,
) {
    let (producer, mut consumer) = HeapRb::<f32>::new(RING_CAPACITY).split();
    let (stream, device_rate) = match open_microphone(producer) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let mut converter = match RateConverter::new(device_rate, PCM16_SAMPLE_RATE) {
        Ok(converter) => converter,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut scratch = vec![0f32; RING_CAPACITY];
    while running.load(Ordering::SeqCst) {
        thread::sleep(POLL_INTERVAL);
        let read = consumer.pop_slice(&mut scratch);
        if read == 0 {
            continue;
        }
        match converter.convert(&scratch[..read]) {
            Ok(samples) if !samples.is_empty() => {
                if chunks.blocking_send(pcm::convert_f32_to_i16(&samples)).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Dropping microphone audio"),
        }
    }
    drop(stream);

    // Whatever the device produced before the stream closed still belongs to the turn.
    let read = consumer.pop_slice(&mut scratch);
    match drain_converter(&mut converter, &scratch[..read]) {
        Ok(tail) if !tail.is_empty() => {
            let _ = chunks.blocking_send(pcm::convert_f32_to_i16(&tail));
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Dropping microphone tail"),
    }
    drop(chunks);
    info!("Microphone closed");
}

fn drain_converter(converter: &mut RateConverter, remaining: &[f32]) -> RealtimeResult<Vec<f32>> {
    let mut tail = converter.convert(remaining)?;
    tail.append(&mut converter.flush()?);
    Ok(tail)
}

/// The default output device.
pub struct SpeakerSink {
    producer: HeapProd<f32>,
    converter: RateConverter,
    flush: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl SpeakerSink {
    /// Opens the default output device on a dedicated thread.
    pub fn open() -> RealtimeResult<Self> {
        let (producer, consumer) = HeapRb::<f32>::new(RING_CAPACITY).split();
        let flush = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let (thread_flush, thread_running) = (flush.clone(), running.clone());
        thread::Builder::new()
            .name("voxbridge-speaker".to_string())
            .spawn(move || run_speaker(consumer, thread_flush, thread_running, ready_tx))
            .map_err(media("failed to spawn speaker thread"))?;

        let device_rate = ready_rx
            .recv()
            .map_err(|_| RealtimeError::Media("speaker thread exited".to_string()))??;
        Ok(Self {
            producer,
            converter: RateConverter::new(PCM16_SAMPLE_RATE, device_rate)?,
            flush,
            running,
        })
    }
}

impl Drop for SpeakerSink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioSink for SpeakerSink {
    async fn play(&mut self, samples: &[f32]) -> RealtimeResult<()> {
        let converted = self.converter.convert(samples)?;
        let mut offset = 0;
        while offset < converted.len() {
            offset += self.producer.push_slice(&converted[offset..]);
            if offset < converted.len() {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
        while self.producer.occupied_len() > 0 {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    async fn halt(&mut self) {
        self.converter.reset();
        self.flush.store(true, Ordering::SeqCst);
    }
}

fn run_speaker(
    consumer: HeapCons<f32>,
    flush: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    ready: std::sync::mpsc::Sender<RealtimeResult<u32>>,
) {
    let opened = (|| {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| RealtimeError::Media("no output device available".to_string()))?;
        let supported = device
            .default_output_config()
            .map_err(media("no usable output configuration"))?;
        if supported.sample_format() != SampleFormat::F32 {
            return Err(RealtimeError::Media(format!(
                "unsupported output sample format {:?}",
                supported.sample_format()
            )));
        }
        let config: StreamConfig = supported.config();
        let channels = config.channels as usize;
        info!(rate = config.sample_rate.0, channels, "Opening speaker");

        let mut consumer = consumer;
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if flush.swap(false, Ordering::SeqCst) {
                        consumer.clear();
                    }
                    for frame in data.chunks_mut(channels) {
                        let sample = consumer.try_pop().unwrap_or(0.0);
                        frame.iter_mut().for_each(|out| *out = sample);
                    }
                },
                |e| error!(error = %e, "Speaker stream error"),
                None,
            )
            .map_err(media("failed to open speaker"))?;
        stream.play().map_err(media("failed to start speaker"))?;
        Ok((stream, config.sample_rate.0))
    })();

    let stream = match opened {
        Ok((stream, rate)) => {
            let _ = ready.send(Ok(rate));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    while running.load(Ordering::SeqCst) {
        thread::sleep(POLL_INTERVAL);
    }
    drop(stream);
    info!("Speaker closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_averages_channels() {
        assert_eq!(downmix(&[0.5, 0.25, -1.0, 1.0], 2), vec![0.375, 0.0]);
        assert_eq!(downmix(&[0.1, 0.2], 1), vec![0.1, 0.2]);
    }

    #[test]
    fn test_same_rate_passes_through() {
        let mut converter = RateConverter::new(24000, 24000).unwrap();
        assert_eq!(converter.convert(&[0.1, 0.2]).unwrap(), vec![0.1, 0.2]);
    }

    #[test]
    fn test_upsampling_buffers_until_a_full_chunk() {
        let mut converter = RateConverter::new(24000, 48000).unwrap();
        assert!(converter.convert(&[0.0; 100]).unwrap().is_empty());
        let out = converter.convert(&[0.0; RESAMPLER_CHUNK]).unwrap();
        assert!(!out.is_empty());
    }

    #[test]
    fn test_reset_forgets_buffered_input() {
        let mut converter = RateConverter::new(24000, 48000).unwrap();
        assert!(converter.convert(&[0.5; 100]).unwrap().is_empty());
        converter.reset();
        // 100 + 380 would complete a chunk had the first call been kept.
        assert!(converter.convert(&[0.5; RESAMPLER_CHUNK - 100]).unwrap().is_empty());
        assert_eq!(converter.pending.len(), RESAMPLER_CHUNK - 100);
    }

    #[test]
    fn test_tail_is_converted_on_close() {
        let mut converter = RateConverter::new(48000, 24000).unwrap();
        assert!(converter.convert(&[0.25; 200]).unwrap().is_empty());
        let tail = drain_converter(&mut converter, &[0.25; 100]).unwrap();
        assert!(!tail.is_empty());
        assert!(converter.pending.is_empty());
        assert!(converter.flush().unwrap().is_empty());
    }

    #[test]
    fn test_passthrough_tail_keeps_every_sample() {
        let mut converter = RateConverter::new(24000, 24000).unwrap();
        assert_eq!(drain_converter(&mut converter, &[0.1; 300]).unwrap().len(), 300);
    }
}
