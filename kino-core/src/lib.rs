//! # KINO Core
//!
//! Media playback engine: demuxed packets in, presented frames and
//! device-ready audio out. Containers, codecs, displays and audio
//! devices plug in through traits; the engine owns pacing, decode
//! state, frame conversion and the lock-free audio ring between the
//! decode side and the device callback.

// ============================================================================
// Container Side
// ============================================================================
pub mod demux;

// ============================================================================
// Decode
// ============================================================================
pub mod decode;

// ============================================================================
// Media Processing
// ============================================================================
pub mod convert;
pub mod ring;

// ============================================================================
// Playback
// ============================================================================
pub mod clock;
pub mod output;
pub mod session;

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
