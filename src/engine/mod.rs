//! The synthesis engine capability interface.
//!
//! The engine is the component that actually understands the MIDI container
//! format and renders audio; this crate only sequences its lifecycle. The
//! surface is deliberately low-level and handle-based: raw engine-managed
//! memory buffers, single-use input streams over those buffers, and opaque
//! song handles. The player depends only on [`SynthEngine`], so tests run
//! against a double that returns canned PCM and synthetic missing-instrument
//! lists.
//!
//! The production adapter is [`RustySynthEngine`].

mod rusty;

pub use rusty::RustySynthEngine;

use thiserror::Error;

/// Handle to an engine-managed memory buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle(pub(crate) u64);

/// Handle to a single-use input stream over engine-managed memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub(crate) u64);

/// Handle to a loaded song.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SongHandle(pub(crate) u64);

/// Output sample encodings the engine can render.
///
/// Only 16-bit little-endian PCM is used by this layer; the tag exists so
/// the options struct states the format explicitly rather than implying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16Le,
}

/// Playback options handed to the engine when loading a song.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackOptions {
    /// Host output sample rate in Hz.
    pub sample_rate: u32,
    pub format: SampleFormat,
    /// Output channel count; this layer always renders mono.
    pub channels: u16,
    /// Engine-side buffer size in bytes.
    pub buffer_size: usize,
}

impl PlaybackOptions {
    /// Builds the options used for every load: host sample rate, 16-bit
    /// little-endian PCM, mono, and a buffer of `chunk_samples * 2` bytes
    /// (two bytes per sample).
    pub fn for_output(sample_rate: u32, chunk_samples: usize) -> Self {
        Self {
            sample_rate,
            format: SampleFormat::S16Le,
            channels: 1,
            buffer_size: chunk_samples * 2,
        }
    }
}

/// Errors surfaced by engine adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine not initialized")]
    Uninitialized,
    #[error("unknown memory handle {0:?}")]
    UnknownMemory(MemHandle),
    #[error("unknown stream handle {0:?}")]
    UnknownStream(StreamHandle),
    #[error("unknown song handle {0:?}")]
    UnknownSong(SongHandle),
    #[error("memory access out of bounds at offset {offset} (buffer length {len})")]
    OutOfBounds { offset: usize, len: usize },
    #[error("unsupported playback options: {0}")]
    UnsupportedOptions(String),
    #[error("failed to load song: {0}")]
    Load(String),
    #[error("failed to start song: {0}")]
    Start(String),
    #[error("song has not been started")]
    NotStarted,
    #[error("missing-instrument index {index} out of range")]
    MissingIndex { index: usize },
    #[error("invalid instrument patch {name}: {reason}")]
    Patch { name: String, reason: String },
}

pub type EngineResult<T> = Result<T, EngineError>;

/// The opaque synthesis engine, as seen by the player controller.
///
/// Handle lifecycle: memory buffers live until [`free`](Self::free); streams
/// are single-use (opened over a buffer, consumed by one
/// [`song_load`](Self::song_load), then closed); songs live until
/// [`song_free`](Self::song_free). `free`, `istream_close` and `song_free`
/// ignore unknown handles so release paths stay idempotent.
pub trait SynthEngine: Send {
    /// Per-instance initialization. `first_instance` is true for the first
    /// engine instantiation in the process and selects the engine's global
    /// bootstrap path; the flag is computed by the caller and passed
    /// explicitly, never read from shared state.
    fn init(&mut self, first_instance: bool) -> EngineResult<()>;

    /// Releases everything the engine holds.
    fn exit(&mut self) -> EngineResult<()>;

    /// Allocates a zeroed engine-managed buffer of `len` bytes.
    fn allocate(&mut self, len: usize) -> EngineResult<MemHandle>;

    /// Releases an engine-managed buffer. Unknown handles are ignored.
    fn free(&mut self, mem: MemHandle);

    /// Copies `bytes` into a buffer starting at `offset`.
    fn write_memory(&mut self, mem: MemHandle, offset: usize, bytes: &[u8]) -> EngineResult<()>;

    /// Reads a little-endian signed 16-bit value at `byte_offset`.
    fn read_sample(&self, mem: MemHandle, byte_offset: usize) -> EngineResult<i16>;

    /// Opens a single-use input stream over a memory buffer.
    fn istream_open_mem(&mut self, mem: MemHandle) -> EngineResult<StreamHandle>;

    /// Closes an input stream. Unknown handles are ignored.
    fn istream_close(&mut self, stream: StreamHandle);

    /// Parses the MIDI bytes behind `stream` into a song. The stream is
    /// consumed; the caller closes it afterwards. Requires a prior
    /// [`init`](Self::init).
    fn song_load(
        &mut self,
        stream: StreamHandle,
        options: &PlaybackOptions,
    ) -> EngineResult<SongHandle>;

    /// Number of instruments the song needs that no installed patch covers.
    /// Computed at load time; installing patches and reloading refreshes it.
    fn num_missing_instruments(&self, song: SongHandle) -> EngineResult<usize>;

    /// Resolved patch identifier for the missing instrument at `index`
    /// (ascending index order is meaningful: some patch sets have
    /// load-order dependencies).
    fn missing_instrument_name(&self, song: SongHandle, index: usize) -> EngineResult<String>;

    /// Registers instrument patch bytes under the given identifier.
    fn install_patch(&mut self, name: &str, bytes: &[u8]) -> EngineResult<()>;

    /// Prepares a loaded song for rendering. Strictly later than load.
    fn song_start(&mut self, song: SongHandle) -> EngineResult<()>;

    /// Renders the next chunk of wave data into `mem`, up to `max_bytes`
    /// bytes, and returns the number of bytes produced. Zero means end of
    /// stream, not an error.
    fn song_read_wave(
        &mut self,
        song: SongHandle,
        mem: MemHandle,
        max_bytes: usize,
    ) -> EngineResult<usize>;

    /// Releases a song. Unknown handles are ignored.
    fn song_free(&mut self, song: SongHandle);
}
