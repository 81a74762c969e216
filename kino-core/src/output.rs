//! Audio device output.
//!
//! The engine's obligation ends at the device callback: fill the
//! buffer the hardware hands us by draining the ring. cpal provides
//! the device behind the [`OutputBackend`] seam so the rest of the
//! engine (and every test) runs without hardware.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::ring::RingConsumer;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("No audio output device available")]
    NoDevice,
    #[error("Failed to configure device: {0}")]
    DeviceConfig(String),
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),
    #[error("Stream error: {0}")]
    Stream(String),
}

/// Output format the ring was sized for, plus an optional device
/// request. `device: None` means the host default; a name that does
/// not resolve falls back to the default rather than failing the
/// open.
#[derive(Debug, Clone, Default)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub device: Option<String>,
}

// ============================================================================
// Gain
// ============================================================================

/// Linear volume shared between the control context and the device
/// callback. Stored as f32 bits in an atomic so the callback reads it
/// without a lock; clamped to [0, 1] at the setter, trusted at drain.
#[derive(Clone)]
pub struct Gain(Arc<AtomicU32>);

impl Gain {
    pub fn new(value: f32) -> Self {
        let gain = Self(Arc::new(AtomicU32::new(0)));
        gain.set(value);
        gain
    }

    pub fn set(&self, value: f32) {
        self.0
            .store(value.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

impl Default for Gain {
    fn default() -> Self {
        Self::new(1.0)
    }
}

// ============================================================================
// Device Seam
// ============================================================================

/// A running output stream. Not `Send`: device streams stay on the
/// thread that opened them (cpal's contract), which is the session's
/// control thread.
pub trait AudioOutput {
    /// Suspend or resume the device callback. While paused the
    /// consumer is quiescent, which is what makes producer-side ring
    /// resets safe.
    fn set_paused(&mut self, paused: bool) -> Result<(), AudioError>;

    fn device_name(&self) -> Option<&str>;
}

/// Opens output streams. The callback it installs must drain the
/// given consumer with the current gain and nothing else.
pub trait OutputBackend {
    fn open(
        &self,
        spec: AudioSpec,
        consumer: RingConsumer,
        gain: Gain,
    ) -> Result<Box<dyn AudioOutput>, AudioError>;
}

/// Backend that swallows the consumer and plays nothing. For tests
/// and muted hosts.
pub struct NullBackend;

struct NullOutput;

impl AudioOutput for NullOutput {
    fn set_paused(&mut self, _paused: bool) -> Result<(), AudioError> {
        Ok(())
    }

    fn device_name(&self) -> Option<&str> {
        None
    }
}

impl OutputBackend for NullBackend {
    fn open(
        &self,
        _spec: AudioSpec,
        _consumer: RingConsumer,
        _gain: Gain,
    ) -> Result<Box<dyn AudioOutput>, AudioError> {
        Ok(Box::new(NullOutput))
    }
}

// ============================================================================
// cpal Backend
// ============================================================================

#[cfg(feature = "cpal-output")]
pub use cpal_backend::{list_output_devices, CpalBackend, OutputDeviceInfo};

#[cfg(feature = "cpal-output")]
mod cpal_backend {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, SampleRate, Stream, StreamConfig};
    use serde::Serialize;
    use tracing::{debug, warn};

    #[derive(Debug, Clone, Serialize)]
    pub struct OutputDeviceInfo {
        pub name: String,
        pub is_default: bool,
    }

    /// Enumerate output devices on the default host.
    pub fn list_output_devices() -> Result<Vec<OutputDeviceInfo>, AudioError> {
        let host = cpal::default_host();
        let default_name = host
            .default_output_device()
            .and_then(|d| d.name().ok());

        let devices = host
            .output_devices()
            .map_err(|e| AudioError::DeviceConfig(e.to_string()))?;

        let mut result = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                let is_default = default_name.as_deref() == Some(name.as_str());
                result.push(OutputDeviceInfo { name, is_default });
            }
        }
        Ok(result)
    }

    fn named_output_device(host: &cpal::Host, name: &str) -> Option<cpal::Device> {
        host.output_devices()
            .ok()?
            .find(|device| device.name().map(|n| n == name).unwrap_or(false))
    }

    /// Default-host cpal backend.
    pub struct CpalBackend;

    struct CpalOutput {
        stream: Stream,
        device_name: Option<String>,
    }

    impl AudioOutput for CpalOutput {
        fn set_paused(&mut self, paused: bool) -> Result<(), AudioError> {
            let result = if paused {
                self.stream.pause().map_err(|e| e.to_string())
            } else {
                self.stream.play().map_err(|e| e.to_string())
            };
            result.map_err(AudioError::Stream)
        }

        fn device_name(&self) -> Option<&str> {
            self.device_name.as_deref()
        }
    }

    impl OutputBackend for CpalBackend {
        fn open(
            &self,
            spec: AudioSpec,
            mut consumer: RingConsumer,
            gain: Gain,
        ) -> Result<Box<dyn AudioOutput>, AudioError> {
            let host = cpal::default_host();
            let device = match spec.device.as_deref() {
                Some(requested) => match named_output_device(&host, requested) {
                    Some(device) => device,
                    None => {
                        warn!(requested, "output device not found, using default");
                        host.default_output_device().ok_or(AudioError::NoDevice)?
                    }
                },
                None => host.default_output_device().ok_or(AudioError::NoDevice)?,
            };
            let device_name = device.name().ok();

            let sample_format = device
                .default_output_config()
                .map_err(|e| AudioError::DeviceConfig(e.to_string()))?
                .sample_format();

            let config = StreamConfig {
                channels: spec.channels,
                sample_rate: SampleRate(spec.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let err_fn = |err| warn!("audio stream error: {err}");

            let stream = match sample_format {
                SampleFormat::F32 => device
                    .build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            let out: &mut [u8] = bytemuck::cast_slice_mut(data);
                            consumer.drain(out, gain.get());
                            consumer.compact_if_low();
                        },
                        err_fn,
                        None,
                    )
                    .map_err(|e| AudioError::Stream(e.to_string()))?,
                SampleFormat::I16 => {
                    // Ring stores f32; drain into a scratch buffer and
                    // narrow on the way out.
                    let mut scratch: Vec<u8> = Vec::new();
                    device
                        .build_output_stream(
                            &config,
                            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                                scratch.resize(data.len() * 4, 0);
                                consumer.drain(&mut scratch, gain.get());
                                for (dst, src) in data.iter_mut().zip(scratch.chunks_exact(4)) {
                                    let s =
                                        f32::from_ne_bytes([src[0], src[1], src[2], src[3]]);
                                    *dst = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                                }
                                consumer.compact_if_low();
                            },
                            err_fn,
                            None,
                        )
                        .map_err(|e| AudioError::Stream(e.to_string()))?
                }
                other => {
                    return Err(AudioError::UnsupportedFormat(format!("{other:?}")));
                }
            };

            // Streams start live on some hosts; hold it paused until
            // play().
            stream
                .pause()
                .map_err(|e| AudioError::Stream(e.to_string()))?;

            debug!(
                device = device_name.as_deref().unwrap_or("unknown"),
                sample_rate = spec.sample_rate,
                channels = spec.channels,
                "audio output opened"
            );

            Ok(Box::new(CpalOutput {
                stream,
                device_name,
            }))
        }
    }
}
