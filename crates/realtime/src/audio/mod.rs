//! Audio plumbing on both sides of the session: capture towards the backend,
//! playback of what the backend sends back.

pub mod capture;
#[cfg(feature = "native-audio")]
pub mod device;
pub mod pcm;
pub mod playback;

pub use capture::{AudioSource, CaptureHandle, DeliveryPolicy};
pub use pcm::PCM16_SAMPLE_RATE;
pub use playback::{AudioSink, NullSink, PlaybackHandle, PlaybackQueue};
#[cfg(feature = "native-audio")]
pub use device::{MicrophoneSource, SpeakerSink};
