//! Playback orchestration.
//!
//! [`MediaSession`] ties the collaborators together: one demuxer, a
//! video decode session, an optional audio lane feeding the ring, the
//! pacing clock and the converter. Load-time failures surface as
//! [`LoadError`]; once playing, per-packet trouble is logged, counted
//! and skipped so `advance` never returns an error.

use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::PlaybackClock;
use crate::convert::{ColorSpace, FrameConverter, PresentSink, VideoFrame};
use crate::decode::{AudioChunk, CodecProvider, DecodeError, DecodeSession, DecodeState};
use crate::demux::{select_streams, DemuxError, Demuxer, DemuxerFactory, StreamDescriptor};
use crate::output::{AudioOutput, AudioSpec, Gain, OutputBackend};
use crate::ring::{AudioRing, PushResult, RingConfig, RingProducer};

/// Fatal load-time failures. Anything that leaves the session usable
/// (a missing audio stream, a dead output device) is not here; those
/// degrade to muted playback instead.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Demux(#[from] DemuxError),
    #[error("Container has no video stream")]
    NoVideoStream,
    #[error("Video decoder unavailable: {0}")]
    VideoDecoder(DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

// ============================================================================
// Observer
// ============================================================================

/// Notable playback events, for hosts that want more than logs.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    StateChanged(PlaybackState),
    EndOfStream,
    /// The demuxer rejected a seek; playback continues where it was.
    SeekFailed { target_secs: f64 },
    /// Audio could not be set up; playback continues muted.
    AudioDisabled { reason: String },
    /// A decoded audio chunk was dropped because the ring was full.
    AudioChunkDropped,
}

pub trait PlaybackObserver {
    fn on_event(&self, _event: &PlaybackEvent) {}
}

/// Default observer: events land in the logs only.
pub struct NullObserver;

impl PlaybackObserver for NullObserver {}

// ============================================================================
// Metrics
// ============================================================================

/// Snapshot of playback counters, cheap to take at any time.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PlaybackMetrics {
    pub frames_presented: u64,
    pub video_packets: u64,
    pub audio_packets: u64,
    pub audio_chunks_pushed: u64,
    /// Chunks skipped at the backpressure watermark plus chunks the
    /// ring itself rejected.
    pub audio_chunks_dropped: u64,
    pub audio_underruns: u64,
    pub video_decode_errors: u64,
    pub audio_decode_errors: u64,
    pub convert_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_presented: u64,
    video_packets: u64,
    audio_packets: u64,
    audio_chunks_pushed: u64,
    audio_chunks_skipped: u64,
    convert_failures: u64,
}

// ============================================================================
// Session Config
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub color_space: ColorSpace,
    /// Ring capacity in seconds of decoded audio.
    pub ring_seconds: f64,
    /// Output device to request by name; `None` means the host
    /// default. An unknown name falls back to the default.
    pub audio_device: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            color_space: ColorSpace::Bt709,
            ring_seconds: 1.0,
            audio_device: None,
        }
    }
}

// ============================================================================
// Media Session
// ============================================================================

/// Everything that exists only while a file is loaded.
struct Loaded {
    demuxer: Box<dyn Demuxer>,
    video: DecodeSession<VideoFrame>,
    audio: Option<AudioLane>,
    /// Built lazily from the first decoded frame so the converter
    /// geometry always matches what the decoder actually emits.
    converter: Option<FrameConverter>,
    clock: PlaybackClock,
}

struct AudioLane {
    session: DecodeSession<AudioChunk>,
    producer: RingProducer,
    output: Box<dyn AudioOutput>,
}

/// The playback engine. Owns the demuxer, decode sessions, clock,
/// converter and audio lane for one loaded file; collaborators come
/// in through the factory traits so the engine never names a concrete
/// container, codec or device library.
///
/// Not `Send`: the audio output stream must stay on the thread that
/// opened it, so the whole session lives on the host's control
/// thread and is driven by calling [`advance`](Self::advance) once
/// per host tick.
pub struct MediaSession {
    demuxers: Box<dyn DemuxerFactory>,
    codecs: Box<dyn CodecProvider>,
    output_backend: Box<dyn OutputBackend>,
    sink: Box<dyn PresentSink>,
    observer: Box<dyn PlaybackObserver>,
    config: SessionConfig,
    gain: Gain,
    state: PlaybackState,
    loaded: Option<Loaded>,
    counters: Counters,
}

impl MediaSession {
    pub fn new(
        demuxers: Box<dyn DemuxerFactory>,
        codecs: Box<dyn CodecProvider>,
        output_backend: Box<dyn OutputBackend>,
        sink: Box<dyn PresentSink>,
    ) -> Self {
        Self::with_config(demuxers, codecs, output_backend, sink, SessionConfig::default())
    }

    pub fn with_config(
        demuxers: Box<dyn DemuxerFactory>,
        codecs: Box<dyn CodecProvider>,
        output_backend: Box<dyn OutputBackend>,
        sink: Box<dyn PresentSink>,
        config: SessionConfig,
    ) -> Self {
        Self {
            demuxers,
            codecs,
            output_backend,
            sink,
            observer: Box::new(NullObserver),
            config,
            gain: Gain::default(),
            state: PlaybackState::Stopped,
            loaded: None,
            counters: Counters::default(),
        }
    }

    pub fn set_observer(&mut self, observer: Box<dyn PlaybackObserver>) {
        self.observer = observer;
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Open a container and stand up the decode pipeline. Replaces any
    /// previously loaded file. The session comes out `Stopped`; call
    /// [`play`](Self::play) to start.
    pub fn load(&mut self, path: &Path) -> Result<(), LoadError> {
        self.unload();

        let demuxer = self.demuxers.open(path)?;
        let selection = select_streams(demuxer.streams());
        let video_index = selection.video.ok_or(LoadError::NoVideoStream)?;

        let video_desc = stream_by_index(demuxer.streams(), video_index)
            .ok_or(LoadError::NoVideoStream)?
            .clone();
        let backend = self
            .codecs
            .open_video(&video_desc)
            .map_err(LoadError::VideoDecoder)?;

        let frame_rate = video_desc.video.map(|v| v.frame_rate).unwrap_or(0.0);
        let clock = PlaybackClock::new(frame_rate);

        let audio = selection
            .audio
            .and_then(|index| stream_by_index(demuxer.streams(), index).cloned())
            .and_then(|desc| self.open_audio_lane(&desc));

        info!(
            path = %path.display(),
            video_codec = %video_desc.codec,
            frame_rate,
            audio = audio.is_some(),
            "loaded"
        );

        self.loaded = Some(Loaded {
            demuxer,
            video: DecodeSession::new(video_desc, backend),
            audio,
            converter: None,
            clock,
        });
        self.counters = Counters::default();
        self.state = PlaybackState::Stopped;
        Ok(())
    }

    /// Audio setup never fails the load. A missing decoder or a dead
    /// device both degrade to muted video playback.
    fn open_audio_lane(&mut self, desc: &StreamDescriptor) -> Option<AudioLane> {
        let params = desc.audio?;

        let session = match self.codecs.open_audio(desc) {
            Ok(backend) => DecodeSession::new(desc.clone(), backend),
            Err(err) => {
                warn!(codec = %desc.codec, "audio decoder unavailable, playing muted: {err}");
                self.observer.on_event(&PlaybackEvent::AudioDisabled {
                    reason: err.to_string(),
                });
                return None;
            }
        };

        let bytes_per_sec =
            params.sample_rate as usize * params.channels as usize * crate::ring::BYTES_PER_SAMPLE;
        let capacity = (bytes_per_sec as f64 * self.config.ring_seconds) as usize;
        let (producer, consumer) = AudioRing::new(RingConfig::new(capacity.max(1))).split();

        let spec = AudioSpec {
            sample_rate: params.sample_rate,
            channels: params.channels,
            device: self.config.audio_device.clone(),
        };
        let output = match self.output_backend.open(spec, consumer, self.gain.clone()) {
            Ok(output) => output,
            Err(err) => {
                warn!("audio device unavailable, playing muted: {err}");
                self.observer.on_event(&PlaybackEvent::AudioDisabled {
                    reason: err.to_string(),
                });
                return None;
            }
        };

        Some(AudioLane {
            session,
            producer,
            output,
        })
    }

    fn unload(&mut self) {
        if self.loaded.take().is_some() {
            debug!("unloaded previous file");
        }
        self.state = PlaybackState::Stopped;
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    pub fn play(&mut self) {
        let Some(loaded) = self.loaded.as_mut() else {
            return;
        };
        if self.state == PlaybackState::Playing {
            return;
        }
        loaded.clock.clear();
        set_audio_paused(&mut loaded.audio, false);
        self.set_state(PlaybackState::Playing);
    }

    pub fn pause(&mut self) {
        if self.state != PlaybackState::Playing {
            return;
        }
        if let Some(loaded) = self.loaded.as_mut() {
            set_audio_paused(&mut loaded.audio, true);
        }
        self.set_state(PlaybackState::Paused);
    }

    /// Stop and rewind. The next [`play`](Self::play) starts from the
    /// beginning of the file.
    pub fn stop(&mut self) {
        let Some(loaded) = self.loaded.as_mut() else {
            return;
        };
        set_audio_paused(&mut loaded.audio, true);
        loaded.video.reset();
        if let Some(lane) = loaded.audio.as_mut() {
            lane.session.reset();
            // Safe: the output stream was paused above, so the
            // consumer is quiescent.
            lane.producer.reset();
        }
        if let Err(err) = loaded.demuxer.seek(0.0) {
            warn!("rewind failed: {err}");
        }
        loaded.clock.clear();
        self.set_state(PlaybackState::Stopped);
    }

    /// Jump to `target_secs`. A rejected seek leaves playback exactly
    /// where it was.
    pub fn seek(&mut self, target_secs: f64) {
        let Some(loaded) = self.loaded.as_mut() else {
            return;
        };
        let was_playing = self.state == PlaybackState::Playing;
        set_audio_paused(&mut loaded.audio, true);

        match loaded.demuxer.seek(target_secs) {
            Ok(()) => {
                loaded.video.reset();
                if let Some(lane) = loaded.audio.as_mut() {
                    lane.session.reset();
                    lane.producer.reset();
                }
                loaded.clock.clear();
                debug!(target_secs, "seek");
            }
            Err(err) => {
                warn!(target_secs, "seek rejected: {err}");
                self.observer
                    .on_event(&PlaybackEvent::SeekFailed { target_secs });
            }
        }

        if was_playing {
            set_audio_paused(&mut loaded.audio, false);
        }
    }

    /// Linear volume in [0, 1]; out-of-range values are clamped. Takes
    /// effect at the next device callback without touching buffered
    /// samples.
    pub fn set_volume(&mut self, volume: f32) {
        self.gain.set(volume);
    }

    pub fn volume(&self) -> f32 {
        self.gain.get()
    }

    // ------------------------------------------------------------------
    // Steady state
    // ------------------------------------------------------------------

    /// Drive playback. Call once per host tick with the current time;
    /// decodes and presents every frame that has come due since the
    /// last call. After a stall this catches up through the backlog
    /// instead of slowing down.
    pub fn advance(&mut self, now: Instant) {
        if self.state != PlaybackState::Playing {
            return;
        }
        let Some(loaded) = self.loaded.as_mut() else {
            return;
        };

        let due = loaded.clock.tick(now);
        let mut reached_eos = false;
        for _ in 0..due {
            match pump_one_frame(
                loaded,
                self.sink.as_mut(),
                self.observer.as_ref(),
                &mut self.counters,
                self.config.color_space,
            ) {
                Pump::Presented => {}
                Pump::EndOfStream => {
                    reached_eos = true;
                    break;
                }
            }
        }

        if reached_eos {
            info!("end of stream");
            self.observer.on_event(&PlaybackEvent::EndOfStream);
            self.stop();
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn audio_device_name(&self) -> Option<&str> {
        self.loaded
            .as_ref()
            .and_then(|l| l.audio.as_ref())
            .and_then(|lane| lane.output.device_name())
    }

    pub fn metrics(&self) -> PlaybackMetrics {
        let mut metrics = PlaybackMetrics {
            frames_presented: self.counters.frames_presented,
            video_packets: self.counters.video_packets,
            audio_packets: self.counters.audio_packets,
            audio_chunks_pushed: self.counters.audio_chunks_pushed,
            audio_chunks_dropped: self.counters.audio_chunks_skipped,
            convert_failures: self.counters.convert_failures,
            ..PlaybackMetrics::default()
        };
        if let Some(loaded) = self.loaded.as_ref() {
            metrics.video_decode_errors = loaded.video.errors_skipped();
            if let Some(lane) = loaded.audio.as_ref() {
                metrics.audio_decode_errors = lane.session.errors_skipped();
                let ring = lane.producer.counters();
                metrics.audio_chunks_dropped += ring.dropped_chunks();
                metrics.audio_underruns = ring.underruns();
            }
        }
        metrics
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state != state {
            self.state = state;
            self.observer
                .on_event(&PlaybackEvent::StateChanged(state));
        }
    }
}

fn stream_by_index(streams: &[StreamDescriptor], index: u32) -> Option<&StreamDescriptor> {
    streams.iter().find(|s| s.index == index)
}

fn set_audio_paused(audio: &mut Option<AudioLane>, paused: bool) {
    if let Some(lane) = audio.as_mut() {
        if let Err(err) = lane.output.set_paused(paused) {
            warn!(paused, "audio output pause toggle failed: {err}");
        }
    }
}

// ============================================================================
// Frame Pump
// ============================================================================

enum Pump {
    Presented,
    EndOfStream,
}

/// Read and route packets until one video frame has been presented.
/// Audio packets encountered along the way are decoded and pushed to
/// the ring immediately.
fn pump_one_frame(
    loaded: &mut Loaded,
    sink: &mut dyn PresentSink,
    observer: &dyn PlaybackObserver,
    counters: &mut Counters,
    color_space: ColorSpace,
) -> Pump {
    loop {
        match loaded.video.state() {
            DecodeState::Idle => return Pump::EndOfStream,
            DecodeState::Flushing => {
                let frame = loaded.video.flush().next();
                match frame {
                    Some(frame) => {
                        if present(
                            &mut loaded.converter,
                            &frame,
                            sink,
                            counters,
                            color_space,
                        ) {
                            return Pump::Presented;
                        }
                        continue;
                    }
                    None => return Pump::EndOfStream,
                }
            }
            _ => {}
        }

        let Some(packet) = loaded.demuxer.read_packet() else {
            // Container exhausted: switch the video session to flush
            // mode and keep presenting what the decoder still holds.
            let frame = loaded.video.flush().next();
            match frame {
                Some(frame) => {
                    if present(&mut loaded.converter, &frame, sink, counters, color_space) {
                        return Pump::Presented;
                    }
                    continue;
                }
                None => return Pump::EndOfStream,
            }
        };

        if packet.stream_index == loaded.video.stream_index() {
            counters.video_packets += 1;
            if let Err(DecodeError::Busy) = loaded.video.submit(&packet) {
                // Pull a frame out to free queue space, then give the
                // packet one more chance.
                if let Some(frame) = loaded.video.drain().next() {
                    if let Err(DecodeError::Busy) = loaded.video.submit(&packet) {
                        warn!(pts_us = packet.pts_us, "video decoder saturated, dropping packet");
                    }
                    if present(&mut loaded.converter, &frame, sink, counters, color_space) {
                        return Pump::Presented;
                    }
                    continue;
                }
                warn!(pts_us = packet.pts_us, "video decoder busy with nothing ready, dropping packet");
                continue;
            }
            if let Some(frame) = loaded.video.drain().next() {
                if present(&mut loaded.converter, &frame, sink, counters, color_space) {
                    return Pump::Presented;
                }
            }
        } else if let Some(lane) = loaded.audio.as_mut() {
            if packet.stream_index == lane.session.stream_index() {
                counters.audio_packets += 1;
                pump_audio(lane, &packet, observer, counters);
            }
        }
        // Packets from unselected streams fall through and are dropped.
    }
}

/// Feed one audio packet and move every chunk it yields into the
/// ring. Backpressure is a skip, never a stall.
fn pump_audio(
    lane: &mut AudioLane,
    packet: &crate::demux::CompressedPacket,
    observer: &dyn PlaybackObserver,
    counters: &mut Counters,
) {
    let mut submit = lane.session.submit(packet);
    if matches!(submit, Err(DecodeError::Busy)) {
        // Drain first, then retry once; a second Busy drops the packet.
        drain_audio_into_ring(lane, observer, counters);
        submit = lane.session.submit(packet);
        if submit.is_err() {
            warn!(pts_us = packet.pts_us, "audio decoder saturated, dropping packet");
        }
    }
    drain_audio_into_ring(lane, observer, counters);
}

fn drain_audio_into_ring(
    lane: &mut AudioLane,
    observer: &dyn PlaybackObserver,
    counters: &mut Counters,
) {
    while let Some(chunk) = lane.session.drain().next() {
        if lane.producer.is_full() {
            counters.audio_chunks_skipped += 1;
            observer.on_event(&PlaybackEvent::AudioChunkDropped);
            continue;
        }
        let bytes: &[u8] = bytemuck::cast_slice(&chunk.samples);
        match lane.producer.push(bytes) {
            PushResult::Accepted => counters.audio_chunks_pushed += 1,
            PushResult::Dropped => {
                observer.on_event(&PlaybackEvent::AudioChunkDropped);
            }
        }
    }
}

/// Convert and hand off one frame. Rebuilds the converter if the
/// decoder changed geometry or format mid-stream.
fn present(
    converter: &mut Option<FrameConverter>,
    frame: &VideoFrame,
    sink: &mut dyn PresentSink,
    counters: &mut Counters,
    color_space: ColorSpace,
) -> bool {
    let up_to_date = converter.as_ref().is_some_and(|c| c.matches(frame));
    let converter = match converter {
        Some(c) if up_to_date => c,
        slot => {
            debug!(
                width = frame.width,
                height = frame.height,
                format = ?frame.format,
                "building frame converter"
            );
            slot.insert(FrameConverter::new(
                frame.width,
                frame.height,
                frame.format,
                color_space,
            ))
        }
    };
    match converter.convert(frame) {
        Ok(rgb) => {
            sink.present(rgb);
            counters.frames_presented += 1;
            true
        }
        Err(err) => {
            warn!(pts_us = frame.pts_us, "frame conversion failed: {err}");
            counters.convert_failures += 1;
            false
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{PixelFormat, RgbFrame};
    use crate::decode::{AudioBackend, DecoderBackend, VideoBackend};
    use crate::demux::{AudioParams, CompressedPacket, SeekError, VideoParams};
    use crate::output::{AudioError, NullBackend};
    use crate::ring::RingConsumer;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    const W: u32 = 8;
    const H: u32 = 8;
    const FPS: f64 = 30.0;

    // ------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------

    /// In-memory container: interleaved video and audio packets with
    /// monotonic timestamps. Video packets carry a one-byte payload
    /// that becomes the frame's luma value.
    struct FakeDemuxer {
        streams: Vec<StreamDescriptor>,
        packets: VecDeque<CompressedPacket>,
        reject_seeks: bool,
        seeks: Arc<Mutex<Vec<f64>>>,
    }

    impl FakeDemuxer {
        fn new(video_frames: u32, audio_packets: u32) -> Self {
            let mut streams = Vec::new();
            if video_frames > 0 {
                streams.push(StreamDescriptor::video(
                    0,
                    "rawvideo",
                    VideoParams {
                        width: W,
                        height: H,
                        frame_rate: FPS,
                    },
                ));
            }
            if audio_packets > 0 {
                streams.push(StreamDescriptor::audio(
                    1,
                    "pcm_f32le",
                    AudioParams {
                        sample_rate: 48_000,
                        channels: 2,
                    },
                ));
            }

            let mut packets = VecDeque::new();
            for i in 0..video_frames.max(audio_packets) {
                if i < video_frames {
                    packets.push_back(CompressedPacket {
                        stream_index: 0,
                        pts_us: i as i64 * 33_333,
                        dts_us: i as i64 * 33_333,
                        keyframe: i % 30 == 0,
                        data: vec![i as u8],
                    });
                }
                if i < audio_packets {
                    packets.push_back(CompressedPacket {
                        stream_index: 1,
                        pts_us: i as i64 * 33_333,
                        dts_us: i as i64 * 33_333,
                        keyframe: true,
                        data: vec![i as u8],
                    });
                }
            }

            Self {
                streams,
                packets,
                reject_seeks: false,
                seeks: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Demuxer for FakeDemuxer {
        fn streams(&self) -> &[StreamDescriptor] {
            &self.streams
        }

        fn read_packet(&mut self) -> Option<CompressedPacket> {
            self.packets.pop_front()
        }

        fn seek(&mut self, target_secs: f64) -> Result<(), SeekError> {
            if self.reject_seeks {
                return Err(SeekError::Failed("not seekable".into()));
            }
            self.seeks.lock().push(target_secs);
            Ok(())
        }
    }

    struct FakeFactory {
        video_frames: u32,
        audio_packets: u32,
        reject_seeks: bool,
        seeks: Arc<Mutex<Vec<f64>>>,
    }

    impl FakeFactory {
        fn new(video_frames: u32, audio_packets: u32) -> Self {
            Self {
                video_frames,
                audio_packets,
                reject_seeks: false,
                seeks: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl DemuxerFactory for FakeFactory {
        fn open(&self, _path: &Path) -> Result<Box<dyn Demuxer>, DemuxError> {
            let mut demuxer = FakeDemuxer::new(self.video_frames, self.audio_packets);
            demuxer.reject_seeks = self.reject_seeks;
            demuxer.seeks = self.seeks.clone();
            Ok(Box::new(demuxer))
        }
    }

    /// "Decodes" a video packet into a flat frame whose luma is the
    /// packet's payload byte.
    struct FakeVideoDecoder {
        ready: VecDeque<VideoFrame>,
    }

    impl DecoderBackend for FakeVideoDecoder {
        type Frame = VideoFrame;

        fn submit(&mut self, packet: &CompressedPacket) -> Result<(), DecodeError> {
            let mut frame = VideoFrame::new(W, H, PixelFormat::Yuv420p);
            let y_size = (W * H) as usize;
            frame.data[..y_size].fill(packet.data[0]);
            frame.data[y_size..].fill(128);
            frame.pts_us = packet.pts_us;
            self.ready.push_back(frame);
            Ok(())
        }

        fn poll_frame(&mut self) -> Result<Option<VideoFrame>, DecodeError> {
            Ok(self.ready.pop_front())
        }

        fn begin_flush(&mut self) {}

        fn reset(&mut self) {
            self.ready.clear();
        }

        fn name(&self) -> &str {
            "fake-video"
        }
    }

    /// Each audio packet becomes 64 stereo frames of a constant value.
    struct FakeAudioDecoder {
        ready: VecDeque<AudioChunk>,
    }

    impl DecoderBackend for FakeAudioDecoder {
        type Frame = AudioChunk;

        fn submit(&mut self, packet: &CompressedPacket) -> Result<(), DecodeError> {
            self.ready.push_back(AudioChunk {
                samples: vec![packet.data[0] as f32; 128],
                channels: 2,
                pts_us: packet.pts_us,
            });
            Ok(())
        }

        fn poll_frame(&mut self) -> Result<Option<AudioChunk>, DecodeError> {
            Ok(self.ready.pop_front())
        }

        fn begin_flush(&mut self) {}

        fn reset(&mut self) {
            self.ready.clear();
        }

        fn name(&self) -> &str {
            "fake-audio"
        }
    }

    struct FakeCodecs {
        fail_audio: bool,
    }

    impl CodecProvider for FakeCodecs {
        fn open_video(&self, _d: &StreamDescriptor) -> Result<VideoBackend, DecodeError> {
            Ok(Box::new(FakeVideoDecoder {
                ready: VecDeque::new(),
            }))
        }

        fn open_audio(&self, _d: &StreamDescriptor) -> Result<AudioBackend, DecodeError> {
            if self.fail_audio {
                return Err(DecodeError::UnsupportedCodec("pcm_f32le".into()));
            }
            Ok(Box::new(FakeAudioDecoder {
                ready: VecDeque::new(),
            }))
        }
    }

    /// Collects presented frame timestamps.
    #[derive(Clone, Default)]
    struct CollectingSink {
        pts: Arc<Mutex<Vec<i64>>>,
    }

    impl PresentSink for CollectingSink {
        fn present(&mut self, frame: &RgbFrame) {
            self.pts.lock().push(frame.pts_us);
        }
    }

    /// Output backend that hands the ring consumer to the test so it
    /// can drain where a device callback normally would, and records
    /// the spec it was opened with.
    #[derive(Default)]
    struct TestOutputBackend {
        consumer: Arc<Mutex<Option<RingConsumer>>>,
        opened_with: Arc<Mutex<Option<AudioSpec>>>,
    }

    struct TestOutput;

    impl AudioOutput for TestOutput {
        fn set_paused(&mut self, _paused: bool) -> Result<(), AudioError> {
            Ok(())
        }

        fn device_name(&self) -> Option<&str> {
            Some("test-device")
        }
    }

    impl OutputBackend for TestOutputBackend {
        fn open(
            &self,
            spec: AudioSpec,
            consumer: RingConsumer,
            _gain: Gain,
        ) -> Result<Box<dyn AudioOutput>, AudioError> {
            *self.opened_with.lock() = Some(spec);
            *self.consumer.lock() = Some(consumer);
            Ok(Box::new(TestOutput))
        }
    }

    /// Records every observer event.
    #[derive(Clone, Default)]
    struct RecordingObserver {
        events: Arc<Mutex<Vec<PlaybackEvent>>>,
    }

    impl PlaybackObserver for RecordingObserver {
        fn on_event(&self, event: &PlaybackEvent) {
            self.events.lock().push(event.clone());
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn session_with(
        factory: FakeFactory,
        fail_audio: bool,
    ) -> (MediaSession, CollectingSink) {
        let sink = CollectingSink::default();
        let session = MediaSession::new(
            Box::new(factory),
            Box::new(FakeCodecs { fail_audio }),
            Box::new(NullBackend),
            Box::new(sink.clone()),
        );
        (session, sink)
    }

    /// Slightly over one 30fps frame period, so float rounding in the
    /// clock never leaves a due frame behind.
    fn step() -> Duration {
        Duration::from_millis(34)
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[test]
    fn test_load_requires_video_stream() {
        // Audio-only container: one audio stream, no video.
        let (mut session, _sink) = session_with(FakeFactory::new(0, 4), false);
        let err = session.load(Path::new("audio-only")).unwrap_err();
        assert!(matches!(err, LoadError::NoVideoStream));
        assert!(!session.is_loaded());
    }

    #[test]
    fn test_load_lands_stopped() {
        let (mut session, _sink) = session_with(FakeFactory::new(10, 0), false);
        session.load(Path::new("clip")).unwrap();
        assert_eq!(session.state(), PlaybackState::Stopped);
        assert!(session.is_loaded());
    }

    #[test]
    fn test_audio_decoder_failure_degrades_to_muted() {
        let observer = RecordingObserver::default();
        let (mut session, _sink) = session_with(FakeFactory::new(10, 10), true);
        session.set_observer(Box::new(observer.clone()));

        session.load(Path::new("clip")).unwrap();
        assert!(session.is_loaded());
        assert!(observer
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, PlaybackEvent::AudioDisabled { .. })));
    }

    #[test]
    fn test_advance_presents_due_frames() {
        let (mut session, sink) = session_with(FakeFactory::new(10, 0), false);
        session.load(Path::new("clip")).unwrap();
        session.play();

        let base = Instant::now();
        session.advance(base); // anchors the clock, nothing due
        session.advance(base + step());
        session.advance(base + 2 * step());

        let pts = sink.pts.lock();
        assert_eq!(pts.len(), 2);
        assert_eq!(pts[0], 0);
        assert_eq!(pts[1], 33_333);
    }

    #[test]
    fn test_stall_catches_up_without_slowing_down() {
        let (mut session, sink) = session_with(FakeFactory::new(10, 0), false);
        session.load(Path::new("clip")).unwrap();
        session.play();

        let base = Instant::now();
        session.advance(base);
        // 0.1s stall at 30fps: exactly three frames come due at once.
        session.advance(base + Duration::from_millis(100));

        assert_eq!(sink.pts.lock().len(), 3);
        assert_eq!(session.metrics().frames_presented, 3);
    }

    #[test]
    fn test_advance_ignored_unless_playing() {
        let (mut session, sink) = session_with(FakeFactory::new(10, 0), false);
        session.load(Path::new("clip")).unwrap();

        let base = Instant::now();
        session.advance(base);
        session.advance(base + Duration::from_secs(1));
        assert!(sink.pts.lock().is_empty());

        session.play();
        session.pause();
        session.advance(base + Duration::from_secs(2));
        assert!(sink.pts.lock().is_empty());
    }

    #[test]
    fn test_pause_gap_not_replayed_on_resume() {
        let (mut session, sink) = session_with(FakeFactory::new(30, 0), false);
        session.load(Path::new("clip")).unwrap();
        session.play();

        let base = Instant::now();
        session.advance(base);
        session.advance(base + step());
        session.pause();

        // A long pause must not turn into a catch-up burst.
        session.play();
        session.advance(base + Duration::from_secs(10)); // re-anchor
        session.advance(base + Duration::from_secs(10) + step());

        assert_eq!(sink.pts.lock().len(), 2);
    }

    #[test]
    fn test_end_of_stream_stops_playback() {
        let observer = RecordingObserver::default();
        let (mut session, sink) = session_with(FakeFactory::new(3, 0), false);
        session.set_observer(Box::new(observer.clone()));
        session.load(Path::new("clip")).unwrap();
        session.play();

        let base = Instant::now();
        session.advance(base);
        session.advance(base + Duration::from_secs(1)); // far past the end

        assert_eq!(sink.pts.lock().len(), 3);
        assert_eq!(session.state(), PlaybackState::Stopped);
        assert!(observer
            .events
            .lock()
            .contains(&PlaybackEvent::EndOfStream));
    }

    #[test]
    fn test_replay_after_end_of_stream() {
        let seeks = Arc::new(Mutex::new(Vec::new()));
        let mut factory = FakeFactory::new(3, 0);
        factory.seeks = seeks.clone();
        let (mut session, _sink) = session_with(factory, false);
        session.load(Path::new("clip")).unwrap();
        session.play();

        let base = Instant::now();
        session.advance(base);
        session.advance(base + Duration::from_secs(1));
        assert_eq!(session.state(), PlaybackState::Stopped);

        // Stop rewound the container.
        assert_eq!(seeks.lock().as_slice(), &[0.0]);
    }

    #[test]
    fn test_audio_chunks_reach_the_ring() {
        let consumer = Arc::new(Mutex::new(None));
        let sink = CollectingSink::default();
        let mut session = MediaSession::new(
            Box::new(FakeFactory::new(4, 4)),
            Box::new(FakeCodecs { fail_audio: false }),
            Box::new(TestOutputBackend {
                consumer: consumer.clone(),
                ..TestOutputBackend::default()
            }),
            Box::new(sink.clone()),
        );
        session.load(Path::new("clip")).unwrap();
        session.play();

        // Three due frames: presents v0..v2 and routes a0 and a1 on
        // the way, staying short of end of stream.
        let base = Instant::now();
        session.advance(base);
        session.advance(base + 3 * step());

        let metrics = session.metrics();
        assert_eq!(metrics.frames_presented, 3);
        assert_eq!(metrics.audio_packets, 2);
        assert_eq!(metrics.audio_chunks_pushed, 2);

        // Drain as a device callback would: two 128-sample chunks.
        let mut consumer = consumer.lock();
        let consumer = consumer.as_mut().unwrap();
        let mut out = vec![0u8; 2 * 128 * 4];
        let result = consumer.drain(&mut out, 1.0);
        assert_eq!(result.bytes_written, out.len());
        let samples: &[f32] = bytemuck::cast_slice(&out);
        assert_eq!(samples[0], 0.0);
        assert_eq!(samples[128], 1.0);
    }

    #[test]
    fn test_configured_device_request_reaches_backend() {
        let backend = TestOutputBackend::default();
        let opened_with = backend.opened_with.clone();
        let mut session = MediaSession::with_config(
            Box::new(FakeFactory::new(4, 4)),
            Box::new(FakeCodecs { fail_audio: false }),
            Box::new(backend),
            Box::new(CollectingSink::default()),
            SessionConfig {
                audio_device: Some("hdmi-out".into()),
                ..SessionConfig::default()
            },
        );
        session.load(Path::new("clip")).unwrap();

        let spec = opened_with.lock().clone().unwrap();
        assert_eq!(spec.device.as_deref(), Some("hdmi-out"));
        assert_eq!(spec.sample_rate, 48_000);
        assert_eq!(spec.channels, 2);
    }

    #[test]
    fn test_seek_discards_buffered_audio() {
        let consumer = Arc::new(Mutex::new(None));
        let sink = CollectingSink::default();
        let mut session = MediaSession::new(
            Box::new(FakeFactory::new(8, 8)),
            Box::new(FakeCodecs { fail_audio: false }),
            Box::new(TestOutputBackend {
                consumer: consumer.clone(),
                ..TestOutputBackend::default()
            }),
            Box::new(sink.clone()),
        );
        session.load(Path::new("clip")).unwrap();
        session.play();

        let base = Instant::now();
        session.advance(base);
        session.advance(base + 2 * step());
        assert!(session.metrics().audio_chunks_pushed > 0);

        session.seek(0.1);
        assert_eq!(consumer.lock().as_ref().unwrap().len(), 0);
        assert!(session.is_playing());
    }

    #[test]
    fn test_rejected_seek_leaves_playback_running() {
        let observer = RecordingObserver::default();
        let mut factory = FakeFactory::new(10, 0);
        factory.reject_seeks = true;
        let (mut session, sink) = session_with(factory, false);
        session.set_observer(Box::new(observer.clone()));
        session.load(Path::new("clip")).unwrap();
        session.play();

        let base = Instant::now();
        session.advance(base);
        session.advance(base + step());

        session.seek(5.0);
        assert!(session.is_playing());
        assert!(observer
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, PlaybackEvent::SeekFailed { .. })));

        // Playback keeps going from where it was.
        session.advance(base + 2 * step());
        assert_eq!(sink.pts.lock().len(), 2);
    }

    #[test]
    fn test_stop_then_play_restarts_from_zero() {
        let seeks = Arc::new(Mutex::new(Vec::new()));
        let mut factory = FakeFactory::new(10, 0);
        factory.seeks = seeks.clone();
        let (mut session, _sink) = session_with(factory, false);
        session.load(Path::new("clip")).unwrap();
        session.play();

        let base = Instant::now();
        session.advance(base);
        session.advance(base + step());

        session.stop();
        assert_eq!(session.state(), PlaybackState::Stopped);
        assert_eq!(seeks.lock().as_slice(), &[0.0]);

        session.play();
        assert!(session.is_playing());
    }

    #[test]
    fn test_volume_is_clamped() {
        let (mut session, _sink) = session_with(FakeFactory::new(4, 0), false);
        session.set_volume(1.7);
        assert_eq!(session.volume(), 1.0);
        session.set_volume(-0.3);
        assert_eq!(session.volume(), 0.0);
        session.set_volume(0.5);
        assert_eq!(session.volume(), 0.5);
    }

    #[test]
    fn test_state_changes_reach_observer() {
        let observer = RecordingObserver::default();
        let (mut session, _sink) = session_with(FakeFactory::new(4, 0), false);
        session.set_observer(Box::new(observer.clone()));
        session.load(Path::new("clip")).unwrap();

        session.play();
        session.pause();
        session.play();
        session.stop();

        let events: Vec<_> = observer
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                PlaybackEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(
            events,
            vec![
                PlaybackState::Playing,
                PlaybackState::Paused,
                PlaybackState::Playing,
                PlaybackState::Stopped,
            ]
        );
    }
}
