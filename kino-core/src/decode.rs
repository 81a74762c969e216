//! Per-stream decode state machines.
//!
//! Codec implementations stay behind [`DecoderBackend`]; a
//! [`DecodeSession`] wraps one backend with feed/drain semantics and
//! absorbs per-packet failures so a single bad packet never tears the
//! stream down.

use thiserror::Error;
use tracing::warn;

use crate::convert::VideoFrame;
use crate::demux::{CompressedPacket, StreamDescriptor};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("Decoder initialization failed: {0}")]
    InitFailed(String),
    /// The decoder's input queue is full. Retry after draining.
    #[error("Decoder busy")]
    Busy,
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
}

// ============================================================================
// Decoded Audio
// ============================================================================

/// A burst of decoded, interleaved f32 samples. Transient: pushed into
/// the audio ring immediately, never retained.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub pts_us: i64,
}

impl AudioChunk {
    /// Samples per channel.
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

// ============================================================================
// Decoder Backend Contract
// ============================================================================

/// One codec's decode resource. `submit` may buffer internally and
/// return [`DecodeError::Busy`] when its input queue is full;
/// `poll_frame` returns `Ok(None)` as soon as no frame is ready - it
/// never blocks.
pub trait DecoderBackend: Send {
    type Frame;

    fn submit(&mut self, packet: &CompressedPacket) -> Result<(), DecodeError>;

    fn poll_frame(&mut self) -> Result<Option<Self::Frame>, DecodeError>;

    /// Signal end of input so remaining buffered frames drain out.
    fn begin_flush(&mut self);

    /// Discard all buffered state without producing frames.
    fn reset(&mut self);

    fn name(&self) -> &str;
}

pub type VideoBackend = Box<dyn DecoderBackend<Frame = VideoFrame>>;
pub type AudioBackend = Box<dyn DecoderBackend<Frame = AudioChunk>>;

/// Constructs decoder backends from stream descriptors. Fails with
/// `UnsupportedCodec` or `InitFailed`.
pub trait CodecProvider: Send {
    fn open_video(&self, descriptor: &StreamDescriptor) -> Result<VideoBackend, DecodeError>;

    fn open_audio(&self, descriptor: &StreamDescriptor) -> Result<AudioBackend, DecodeError>;
}

// ============================================================================
// Decode Session
// ============================================================================

/// `Idle → Ready → (Decoding ⇄ Draining) → Flushing → Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// No work accepted (end of stream reached and fully drained).
    Idle,
    /// Initialized, no packet seen yet.
    Ready,
    /// Packets in flight.
    Decoding,
    /// A drain pass is pulling ready frames.
    Draining,
    /// End of input signalled, buffered frames draining out.
    Flushing,
}

/// Decode state machine for one elementary stream. Video and audio
/// sessions share this shape and differ only in the frame type.
pub struct DecodeSession<F> {
    backend: Box<dyn DecoderBackend<Frame = F>>,
    descriptor: StreamDescriptor,
    state: DecodeState,
    frames_produced: u64,
    packets_submitted: u64,
    errors_skipped: u64,
}

impl<F> DecodeSession<F> {
    pub fn new(descriptor: StreamDescriptor, backend: Box<dyn DecoderBackend<Frame = F>>) -> Self {
        Self {
            backend,
            descriptor,
            state: DecodeState::Ready,
            frames_produced: 0,
            packets_submitted: 0,
            errors_skipped: 0,
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn stream_index(&self) -> u32 {
        self.descriptor.index
    }

    pub fn errors_skipped(&self) -> u64 {
        self.errors_skipped
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames_produced
    }

    /// Feed one compressed packet. A per-packet decode failure is
    /// logged, counted and skipped; `Busy` propagates so the caller
    /// can drain and retry.
    pub fn submit(&mut self, packet: &CompressedPacket) -> Result<(), DecodeError> {
        match self.backend.submit(packet) {
            Ok(()) => {
                self.packets_submitted += 1;
                self.state = DecodeState::Decoding;
                Ok(())
            }
            Err(DecodeError::Busy) => Err(DecodeError::Busy),
            Err(err) => {
                warn!(
                    stream = self.descriptor.index,
                    decoder = self.backend.name(),
                    pts_us = packet.pts_us,
                    "skipping undecodable packet: {err}"
                );
                self.errors_skipped += 1;
                self.state = DecodeState::Decoding;
                Ok(())
            }
        }
    }

    /// Pull every frame the decoder has ready. Lazy, finite and
    /// non-blocking: the iterator stops at the first "no frame
    /// available now".
    pub fn drain(&mut self) -> Drain<'_, F> {
        if self.state == DecodeState::Decoding {
            self.state = DecodeState::Draining;
        }
        Drain { session: self }
    }

    /// Signal end of input and drain whatever is still buffered. The
    /// session lands in `Idle` once the returned iterator is
    /// exhausted.
    pub fn flush(&mut self) -> Drain<'_, F> {
        if self.state != DecodeState::Flushing && self.state != DecodeState::Idle {
            self.backend.begin_flush();
            self.state = DecodeState::Flushing;
        }
        Drain { session: self }
    }

    /// Discard buffered state without producing frames. Used on seek
    /// so no stale pre-seek frame ever reaches the screen.
    pub fn reset(&mut self) {
        self.backend.reset();
        self.state = DecodeState::Ready;
    }

    fn poll_one(&mut self) -> Option<F> {
        loop {
            match self.backend.poll_frame() {
                Ok(Some(frame)) => {
                    self.frames_produced += 1;
                    return Some(frame);
                }
                Ok(None) => {
                    self.state = match self.state {
                        DecodeState::Flushing => DecodeState::Idle,
                        DecodeState::Draining => DecodeState::Decoding,
                        other => other,
                    };
                    return None;
                }
                Err(err) => {
                    warn!(
                        stream = self.descriptor.index,
                        decoder = self.backend.name(),
                        "skipping broken frame: {err}"
                    );
                    self.errors_skipped += 1;
                }
            }
        }
    }
}

/// Iterator over the frames a decoder has ready right now.
pub struct Drain<'a, F> {
    session: &'a mut DecodeSession<F>,
}

impl<F> Iterator for Drain<'_, F> {
    type Item = F;

    fn next(&mut self) -> Option<F> {
        self.session.poll_one()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{AudioParams, StreamDescriptor};
    use std::collections::VecDeque;

    /// Scripted backend: each submitted packet queues its first
    /// payload byte back as a one-sample "frame".
    struct ScriptedBackend {
        ready: VecDeque<AudioChunk>,
        queue_limit: usize,
        pending: usize,
        fail_payload: Option<u8>,
        reset_calls: u32,
    }

    impl ScriptedBackend {
        fn new(queue_limit: usize) -> Self {
            Self {
                ready: VecDeque::new(),
                queue_limit,
                pending: 0,
                fail_payload: None,
                reset_calls: 0,
            }
        }
    }

    impl DecoderBackend for ScriptedBackend {
        type Frame = AudioChunk;

        fn submit(&mut self, packet: &CompressedPacket) -> Result<(), DecodeError> {
            if self.pending >= self.queue_limit {
                return Err(DecodeError::Busy);
            }
            if Some(packet.data[0]) == self.fail_payload {
                return Err(DecodeError::DecodeFailed("bad packet".into()));
            }
            self.pending += 1;
            self.ready.push_back(AudioChunk {
                samples: vec![packet.data[0] as f32],
                channels: 1,
                pts_us: packet.pts_us,
            });
            Ok(())
        }

        fn poll_frame(&mut self) -> Result<Option<AudioChunk>, DecodeError> {
            match self.ready.pop_front() {
                Some(chunk) => {
                    self.pending = self.pending.saturating_sub(1);
                    Ok(Some(chunk))
                }
                None => Ok(None),
            }
        }

        fn begin_flush(&mut self) {}

        fn reset(&mut self) {
            self.ready.clear();
            self.pending = 0;
            self.reset_calls += 1;
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn descriptor() -> StreamDescriptor {
        StreamDescriptor::audio(
            1,
            "test",
            AudioParams {
                sample_rate: 48_000,
                channels: 1,
            },
        )
    }

    fn packet(byte: u8) -> CompressedPacket {
        CompressedPacket {
            stream_index: 1,
            pts_us: byte as i64 * 1000,
            dts_us: byte as i64 * 1000,
            keyframe: true,
            data: vec![byte],
        }
    }

    fn session(queue_limit: usize) -> DecodeSession<AudioChunk> {
        DecodeSession::new(descriptor(), Box::new(ScriptedBackend::new(queue_limit)))
    }

    #[test]
    fn test_submit_then_drain() {
        let mut s = session(4);
        assert_eq!(s.state(), DecodeState::Ready);

        s.submit(&packet(7)).unwrap();
        assert_eq!(s.state(), DecodeState::Decoding);

        let frames: Vec<_> = s.drain().collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples, vec![7.0]);
        assert_eq!(s.state(), DecodeState::Decoding);
    }

    #[test]
    fn test_busy_clears_after_drain() {
        let mut s = session(1);
        s.submit(&packet(1)).unwrap();
        assert!(matches!(s.submit(&packet(2)), Err(DecodeError::Busy)));

        assert_eq!(s.drain().count(), 1);
        s.submit(&packet(2)).unwrap();
        assert_eq!(s.drain().count(), 1);
    }

    #[test]
    fn test_bad_packet_is_skipped_not_fatal() {
        let mut s = DecodeSession::new(descriptor(), {
            let mut b = ScriptedBackend::new(4);
            b.fail_payload = Some(9);
            Box::new(b)
        });

        s.submit(&packet(1)).unwrap();
        s.submit(&packet(9)).unwrap(); // swallowed, counted
        s.submit(&packet(2)).unwrap();

        assert_eq!(s.errors_skipped(), 1);
        let frames: Vec<_> = s.drain().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(s.frames_produced(), 2);
    }

    #[test]
    fn test_flush_lands_in_idle() {
        let mut s = session(4);
        s.submit(&packet(3)).unwrap();

        let flushed: Vec<_> = s.flush().collect();
        assert_eq!(flushed.len(), 1);
        assert_eq!(s.state(), DecodeState::Idle);
    }

    #[test]
    fn test_reset_discards_without_producing() {
        let mut s = session(4);
        s.submit(&packet(5)).unwrap();
        s.reset();

        assert_eq!(s.state(), DecodeState::Ready);
        assert_eq!(s.drain().count(), 0);
    }

    #[test]
    fn test_empty_drain_is_noop() {
        let mut s = session(4);
        assert_eq!(s.drain().count(), 0);
        assert_eq!(s.state(), DecodeState::Ready);
    }
}
