//! Container-facing stream and packet model, plus stream selection.
//!
//! Demuxing internals live behind the [`Demuxer`] trait; the engine
//! only consumes descriptors and compressed packets.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("Failed to open container: {0}")]
    Open(String),
    #[error("Unsupported container: {0}")]
    UnsupportedContainer(String),
    #[error("Corrupt container data: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum SeekError {
    #[error("Seek target {0:.3}s is out of range")]
    OutOfRange(f64),
    #[error("Seek failed: {0}")]
    Failed(String),
}

// ============================================================================
// Stream Descriptors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    Video,
    Audio,
}

/// Video parameters reported by the container at load time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    /// Source frame rate in frames per second.
    pub frame_rate: f64,
}

/// Audio parameters reported by the container at load time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
}

/// One elementary stream as described by the demuxer. Produced once at
/// load time and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub index: u32,
    pub kind: StreamKind,
    /// Codec identifier as the container names it (e.g. "h264", "aac").
    pub codec: String,
    pub video: Option<VideoParams>,
    pub audio: Option<AudioParams>,
}

impl StreamDescriptor {
    pub fn video(index: u32, codec: impl Into<String>, params: VideoParams) -> Self {
        Self {
            index,
            kind: StreamKind::Video,
            codec: codec.into(),
            video: Some(params),
            audio: None,
        }
    }

    pub fn audio(index: u32, codec: impl Into<String>, params: AudioParams) -> Self {
        Self {
            index,
            kind: StreamKind::Audio,
            codec: codec.into(),
            video: None,
            audio: Some(params),
        }
    }
}

// ============================================================================
// Compressed Packets
// ============================================================================

/// One demuxed compressed packet. Owned by the caller until it is fed
/// to a decode session; consumed exactly once.
#[derive(Debug, Clone)]
pub struct CompressedPacket {
    pub stream_index: u32,
    /// Presentation timestamp in microseconds.
    pub pts_us: i64,
    /// Decode timestamp in microseconds.
    pub dts_us: i64,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

// ============================================================================
// Demuxer Contract
// ============================================================================

/// The container collaborator. `read_packet` returning `None` signals
/// end of stream; `seek` lands on the nearest keyframe at or before
/// the target time.
pub trait Demuxer: Send {
    fn streams(&self) -> &[StreamDescriptor];

    fn read_packet(&mut self) -> Option<CompressedPacket>;

    fn seek(&mut self, target_secs: f64) -> Result<(), SeekError>;
}

/// Opens containers by path. Injected into the session so the engine
/// stays independent of any particular container library.
pub trait DemuxerFactory: Send {
    fn open(&self, path: &Path) -> Result<Box<dyn Demuxer>, DemuxError>;
}

// ============================================================================
// Stream Selection
// ============================================================================

/// Result of picking the streams to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSelection {
    /// `None` means the file is unplayable.
    pub video: Option<u32>,
    /// `None` means playback proceeds muted.
    pub audio: Option<u32>,
}

/// Picks the first video stream and the best audio stream. Stereo
/// audio is preferred over any other channel layout; if no stereo
/// stream exists, the first audio stream wins.
pub fn select_streams(streams: &[StreamDescriptor]) -> StreamSelection {
    let mut video = None;
    let mut audio = None;
    let mut audio_is_stereo = false;

    for stream in streams {
        match stream.kind {
            StreamKind::Video => {
                if video.is_none() {
                    video = Some(stream.index);
                }
            }
            StreamKind::Audio => {
                let channels = stream.audio.map(|a| a.channels).unwrap_or(0);
                if channels == 2 && !audio_is_stereo {
                    audio = Some(stream.index);
                    audio_is_stereo = true;
                } else if audio.is_none() {
                    audio = Some(stream.index);
                }
            }
        }
    }

    StreamSelection { video, audio }
}

// ============================================================================
// Tests
// ============================================================================
