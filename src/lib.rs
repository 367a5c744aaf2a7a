//! midiplay - a MIDI playback controller with on-demand patch loading.
//!
//! The controller sequences an opaque synthesis engine through a playback
//! lifecycle: load MIDI bytes from a buffer or URL, discover which General
//! MIDI instrument patches the song needs, fetch and install the missing
//! ones, render 16-bit PCM, and stream it to the host audio output while
//! reporting every state change as a tagged event.
//!
//! The engine, the audio output, and network retrieval all sit behind
//! traits ([`SynthEngine`], [`AudioOutput`], [`ByteFetcher`]) so the
//! controller logic is testable without a sound device or a network.

pub mod engine;
pub mod event;
pub mod fetch;
pub mod output;
pub mod pcm;
pub mod player;
pub mod source;

// Re-export commonly used types
pub use engine::{PlaybackOptions, RustySynthEngine, SynthEngine};
pub use event::{EventCallback, EventKind, EventPayload};
pub use fetch::{ByteFetcher, HttpFetcher};
pub use output::{AudioOutput, RodioOutput};
pub use player::{
    InstanceRegistry, PlayRequest, Player, PlayerConfig, PlayerState, DEFAULT_PATCH_BASE,
    DEFAULT_VOLUME,
};
pub use source::SourceDescriptor;
