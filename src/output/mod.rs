//! The host audio output capability interface.
//!
//! The output owns the audio context lifecycle: a pull-based processing
//! stage invoked at a fixed chunk cadence, a gain stage, suspend/resume of
//! the playback clock, and the clock itself. The player depends only on
//! [`AudioOutput`]; the production adapter is [`RodioOutput`].

mod rodio;

pub use self::rodio::RodioOutput;

use thiserror::Error;

/// What the stage callback tells the output after filling (or declining to
/// fill) a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageControl {
    /// Chunk filled; keep pulling.
    Continue,
    /// Nothing more to produce; the stage stops pulling and the buffer is
    /// left untouched.
    EndOfStream,
}

/// Pull callback installed on the processing stage.
///
/// Invoked with the chunk to fill and the current playback clock in
/// seconds. Must complete quickly and must not block: it runs on the audio
/// path.
pub type StageCallback = Box<dyn FnMut(&mut [f32], f64) -> StageControl + Send>;

/// Errors surfaced by output adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutputError {
    #[error("failed to open audio output: {0}")]
    Context(String),
    #[error("failed to create processing stage: {0}")]
    Stage(String),
    #[error("audio output is closed")]
    Closed,
}

/// An open host audio output context.
pub trait AudioOutput: Send {
    /// Output sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Samples per processing-stage chunk.
    fn chunk_samples(&self) -> usize;

    /// Installs the processing stage and gain node and starts pulling.
    fn start(&mut self, callback: StageCallback, gain: f32) -> Result<(), OutputError>;

    /// Writes through to the live gain node, if a stage is running.
    fn set_gain(&mut self, gain: f32);

    /// Current playback clock in seconds: monotonic while running, frozen
    /// while suspended.
    fn clock_seconds(&self) -> f64;

    /// Suspends the context clock and output.
    fn suspend(&mut self) -> Result<(), OutputError>;

    /// Resumes a suspended context.
    fn resume(&mut self) -> Result<(), OutputError>;

    /// Closes the context and disconnects the stage. Idempotent.
    fn close(&mut self) -> Result<(), OutputError>;

    /// Whether the context is still usable.
    fn is_open(&self) -> bool;
}
