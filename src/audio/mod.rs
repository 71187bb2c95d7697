//! Audio Module - Capture, Codec, Playback
//!
//! Dieses Modul verwaltet:
//! - Geräte-Zugriff über die `AudioBackend`-Naht (cpal-Implementierung)
//! - Capture-Pipeline (Frames → RMS → PCM16 → Kanal)
//! - Playback-Scheduler (Queue + virtuelle Uhr, Barge-in)
//! - PCM16-Codec und Lautstärke-Glättung

mod capture;
mod codec;
mod device;
mod playback;
mod volume;

pub use capture::{run_capture, CaptureEnd};
pub use codec::{decode_pcm16, encode_pcm16, rms, AudioFrame};
pub use device::{
    AudioBackend, AudioError, CaptureConfig, CaptureGuard, CaptureHandle, CpalBackend,
    OutputConfig, OutputSink,
};
pub use playback::{PlaybackScheduler, PlaybackSegment};
pub use volume::VolumeMeter;
