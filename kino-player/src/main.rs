//! # KINO Player
//!
//! Headless playback host for kino-core. Plays a synthetic clip
//! through the full engine (demux, decode, convert, ring, device
//! output) in real time and dumps playback metrics as JSON on exit.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kino_core::convert::{PixelFormat, PresentSink, RgbFrame, VideoFrame};
use kino_core::decode::{
    AudioBackend, AudioChunk, CodecProvider, DecodeError, DecoderBackend, VideoBackend,
};
use kino_core::demux::{
    AudioParams, CompressedPacket, DemuxError, Demuxer, DemuxerFactory, SeekError,
    StreamDescriptor, VideoParams,
};
use kino_core::output::{NullBackend, OutputBackend};
use kino_core::session::{MediaSession, PlaybackEvent, PlaybackObserver, SessionConfig};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;
const FRAME_RATE: f64 = 30.0;
const SAMPLE_RATE: u32 = 48_000;
const CHANNELS: u16 = 2;
/// Audio frames per packet, one packet per video frame.
const SAMPLES_PER_PACKET: u32 = SAMPLE_RATE / FRAME_RATE as u32;
const KEYFRAME_INTERVAL: u32 = 30;
const PTS_STEP_US: i64 = 33_333;

// ============================================================================
// Options
// ============================================================================

#[derive(Clone)]
struct AppOptions {
    /// Clip length in video frames.
    frames: u32,
    mute: bool,
    volume: f32,
    /// Seek target fired once, two seconds into playback.
    seek: Option<f64>,
    /// Output device name, host default when unset.
    device: Option<String>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            frames: 150,
            mute: false,
            volume: 1.0,
            seek: None,
            device: None,
        }
    }
}

impl AppOptions {
    fn from_args(args: &[String]) -> Result<Self> {
        let mut opts = Self::default();
        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--frames" => {
                    opts.frames = iter
                        .next()
                        .context("--frames needs a value")?
                        .parse()
                        .context("--frames expects a frame count")?;
                }
                "--volume" => {
                    opts.volume = iter
                        .next()
                        .context("--volume needs a value")?
                        .parse()
                        .context("--volume expects a number in [0, 1]")?;
                }
                "--seek" => {
                    opts.seek = Some(
                        iter.next()
                            .context("--seek needs a value")?
                            .parse()
                            .context("--seek expects seconds")?,
                    );
                }
                "--device" => {
                    opts.device = Some(iter.next().context("--device needs a name")?.clone());
                }
                "--mute" => opts.mute = true,
                other => bail!("unknown argument: {other}"),
            }
        }
        Ok(opts)
    }
}

// ============================================================================
// Synthetic Source
// ============================================================================

/// In-process "container": video and audio packets interleaved in
/// timestamp order, each carrying its frame index as payload.
struct SyntheticDemuxer {
    streams: Vec<StreamDescriptor>,
    total_frames: u32,
    next_video: u32,
    next_audio: u32,
}

impl SyntheticDemuxer {
    fn new(total_frames: u32) -> Self {
        let streams = vec![
            StreamDescriptor::video(
                0,
                "synthetic-gradient",
                VideoParams {
                    width: WIDTH,
                    height: HEIGHT,
                    frame_rate: FRAME_RATE,
                },
            ),
            StreamDescriptor::audio(
                1,
                "synthetic-sine",
                AudioParams {
                    sample_rate: SAMPLE_RATE,
                    channels: CHANNELS,
                },
            ),
        ];
        Self {
            streams,
            total_frames,
            next_video: 0,
            next_audio: 0,
        }
    }

    fn packet(stream_index: u32, frame: u32) -> CompressedPacket {
        let pts_us = frame as i64 * PTS_STEP_US;
        CompressedPacket {
            stream_index,
            pts_us,
            dts_us: pts_us,
            keyframe: frame % KEYFRAME_INTERVAL == 0,
            data: frame.to_le_bytes().to_vec(),
        }
    }
}

impl Demuxer for SyntheticDemuxer {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn read_packet(&mut self) -> Option<CompressedPacket> {
        // Interleave by timestamp, video first on ties.
        if self.next_video < self.total_frames && self.next_video <= self.next_audio {
            let packet = Self::packet(0, self.next_video);
            self.next_video += 1;
            Some(packet)
        } else if self.next_audio < self.total_frames {
            let packet = Self::packet(1, self.next_audio);
            self.next_audio += 1;
            Some(packet)
        } else {
            None
        }
    }

    fn seek(&mut self, target_secs: f64) -> Result<(), SeekError> {
        if target_secs < 0.0 {
            return Err(SeekError::OutOfRange(target_secs));
        }
        let frame = (target_secs * FRAME_RATE) as u32;
        if frame >= self.total_frames {
            return Err(SeekError::OutOfRange(target_secs));
        }
        // Land on the keyframe at or before the target.
        let keyframe = frame - frame % KEYFRAME_INTERVAL;
        self.next_video = keyframe;
        self.next_audio = keyframe;
        Ok(())
    }
}

struct SyntheticFactory {
    frames: u32,
}

impl DemuxerFactory for SyntheticFactory {
    fn open(&self, _path: &Path) -> Result<Box<dyn Demuxer>, DemuxError> {
        Ok(Box::new(SyntheticDemuxer::new(self.frames)))
    }
}

// ============================================================================
// Synthetic Decoders
// ============================================================================

fn frame_index(packet: &CompressedPacket) -> Result<u32, DecodeError> {
    let bytes: [u8; 4] = packet
        .data
        .as_slice()
        .try_into()
        .map_err(|_| DecodeError::DecodeFailed("short payload".into()))?;
    Ok(u32::from_le_bytes(bytes))
}

/// Emits a scrolling luma gradient so every frame is distinct.
#[derive(Default)]
struct GradientDecoder {
    ready: Vec<VideoFrame>,
}

impl DecoderBackend for GradientDecoder {
    type Frame = VideoFrame;

    fn submit(&mut self, packet: &CompressedPacket) -> Result<(), DecodeError> {
        let index = frame_index(packet)?;
        let mut frame = VideoFrame::new(WIDTH, HEIGHT, PixelFormat::Yuv420p);
        let y_size = (WIDTH * HEIGHT) as usize;
        for (i, y) in frame.data[..y_size].iter_mut().enumerate() {
            let x = i as u32 % WIDTH;
            *y = (x.wrapping_add(index * 4) & 0xff) as u8;
        }
        frame.data[y_size..].fill(128);
        frame.pts_us = packet.pts_us;
        self.ready.push(frame);
        Ok(())
    }

    fn poll_frame(&mut self) -> Result<Option<VideoFrame>, DecodeError> {
        Ok(if self.ready.is_empty() {
            None
        } else {
            Some(self.ready.remove(0))
        })
    }

    fn begin_flush(&mut self) {}

    fn reset(&mut self) {
        self.ready.clear();
    }

    fn name(&self) -> &str {
        "synthetic-gradient"
    }
}

/// Emits a 440 Hz stereo sine, phase derived from the packet index so
/// playback stays click-free across seeks.
#[derive(Default)]
struct SineDecoder {
    ready: Vec<AudioChunk>,
}

impl DecoderBackend for SineDecoder {
    type Frame = AudioChunk;

    fn submit(&mut self, packet: &CompressedPacket) -> Result<(), DecodeError> {
        let index = frame_index(packet)?;
        let base = index as u64 * SAMPLES_PER_PACKET as u64;
        let mut samples = Vec::with_capacity((SAMPLES_PER_PACKET * CHANNELS as u32) as usize);
        for n in 0..SAMPLES_PER_PACKET as u64 {
            let t = (base + n) as f32 / SAMPLE_RATE as f32;
            let value = (std::f32::consts::TAU * 440.0 * t).sin() * 0.2;
            for _ in 0..CHANNELS {
                samples.push(value);
            }
        }
        self.ready.push(AudioChunk {
            samples,
            channels: CHANNELS,
            pts_us: packet.pts_us,
        });
        Ok(())
    }

    fn poll_frame(&mut self) -> Result<Option<AudioChunk>, DecodeError> {
        Ok(if self.ready.is_empty() {
            None
        } else {
            Some(self.ready.remove(0))
        })
    }

    fn begin_flush(&mut self) {}

    fn reset(&mut self) {
        self.ready.clear();
    }

    fn name(&self) -> &str {
        "synthetic-sine"
    }
}

struct SyntheticCodecs;

impl CodecProvider for SyntheticCodecs {
    fn open_video(&self, _descriptor: &StreamDescriptor) -> Result<VideoBackend, DecodeError> {
        Ok(Box::new(GradientDecoder::default()))
    }

    fn open_audio(&self, _descriptor: &StreamDescriptor) -> Result<AudioBackend, DecodeError> {
        Ok(Box::new(SineDecoder::default()))
    }
}

// ============================================================================
// Presentation
// ============================================================================

/// Headless "display": counts frames and logs once a second.
#[derive(Clone)]
struct StatsSink {
    frames: Arc<AtomicU64>,
}

impl PresentSink for StatsSink {
    fn present(&mut self, frame: &RgbFrame) {
        let count = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if count % 30 == 0 {
            tracing::debug!(
                frames = count,
                pts_us = frame.pts_us,
                "presented"
            );
        }
    }
}

struct EventLogger;

impl PlaybackObserver for EventLogger {
    fn on_event(&self, event: &PlaybackEvent) {
        match event {
            PlaybackEvent::StateChanged(state) => tracing::info!(?state, "playback state"),
            PlaybackEvent::EndOfStream => tracing::info!("end of stream"),
            PlaybackEvent::SeekFailed { target_secs } => {
                tracing::warn!(target_secs, "seek rejected")
            }
            PlaybackEvent::AudioDisabled { reason } => {
                tracing::warn!(reason = %reason, "audio disabled")
            }
            PlaybackEvent::AudioChunkDropped => {
                tracing::debug!("audio chunk dropped")
            }
        }
    }
}

// ============================================================================
// Main
// ============================================================================

fn output_backend(mute: bool) -> Box<dyn OutputBackend> {
    if mute {
        return Box::new(NullBackend);
    }
    #[cfg(feature = "audio")]
    {
        Box::new(kino_core::output::CpalBackend)
    }
    #[cfg(not(feature = "audio"))]
    {
        Box::new(NullBackend)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kino=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let opts = AppOptions::from_args(&args)?;

    tracing::info!("KINO Player v{}", kino_core::VERSION);

    #[cfg(feature = "audio")]
    if !opts.mute {
        match kino_core::output::list_output_devices() {
            Ok(devices) => {
                for device in &devices {
                    tracing::info!(name = %device.name, default = device.is_default, "output device");
                }
            }
            Err(err) => tracing::warn!("device enumeration failed: {err}"),
        }
    }

    let frames = Arc::new(AtomicU64::new(0));
    let mut session = MediaSession::with_config(
        Box::new(SyntheticFactory { frames: opts.frames }),
        Box::new(SyntheticCodecs),
        output_backend(opts.mute),
        Box::new(StatsSink {
            frames: frames.clone(),
        }),
        SessionConfig {
            audio_device: opts.device.clone(),
            ..SessionConfig::default()
        },
    );
    session.set_observer(Box::new(EventLogger));

    session.load(Path::new("synthetic://clip"))?;
    if let Some(device) = session.audio_device_name() {
        tracing::info!(device, "audio output open");
    }
    session.set_volume(opts.volume);
    session.play();

    let started = Instant::now();
    let mut pending_seek = opts.seek;
    while session.is_playing() {
        session.advance(Instant::now());

        if let Some(target) = pending_seek {
            if started.elapsed() >= Duration::from_secs(2) {
                tracing::info!(target, "seeking");
                session.seek(target);
                pending_seek = None;
            }
        }

        thread::sleep(Duration::from_millis(4));
    }

    let metrics = session.metrics();
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
