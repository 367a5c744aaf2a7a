//! rodio-backed audio output adapter.
//!
//! The processing stage is a mono `rodio::Source` that refills a fixed-size
//! chunk from the installed callback; the sink provides the gain node and
//! suspend/resume. The playback clock is wall time with suspended intervals
//! excluded.

use super::{AudioOutput, OutputError, StageCallback, StageControl};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Output sample rate (44.1 kHz standard).
const SAMPLE_RATE: u32 = 44100;

/// Samples pulled from the callback per stage tick. At 44.1 kHz this is a
/// ~93 ms cadence.
const CHUNK_SAMPLES: usize = 4096;

/// Playback clock state.
struct ClockState {
    resumed_at: Instant,
    accumulated: Duration,
    running: bool,
}

/// Monotonic-while-running playback clock shared with the stage.
struct OutputClock {
    state: Mutex<ClockState>,
}

impl OutputClock {
    fn new() -> Self {
        Self {
            state: Mutex::new(ClockState {
                resumed_at: Instant::now(),
                accumulated: Duration::ZERO,
                running: true,
            }),
        }
    }

    fn seconds(&self) -> f64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut elapsed = state.accumulated;
        if state.running {
            elapsed += state.resumed_at.elapsed();
        }
        elapsed.as_secs_f64()
    }

    fn pause(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.running {
            let elapsed = state.resumed_at.elapsed();
            state.accumulated += elapsed;
            state.running = false;
        }
    }

    fn resume(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.running {
            state.resumed_at = Instant::now();
            state.running = true;
        }
    }
}

/// The processing stage: a continuous mono source that refills its chunk
/// from the callback whenever the cursor reaches the end.
struct StageSource {
    callback: StageCallback,
    clock: Arc<OutputClock>,
    chunk: Vec<f32>,
    pos: usize,
    done: bool,
}

impl StageSource {
    fn new(callback: StageCallback, clock: Arc<OutputClock>) -> Self {
        Self {
            callback,
            clock,
            chunk: vec![0.0; CHUNK_SAMPLES],
            // Start exhausted to trigger the first pull
            pos: CHUNK_SAMPLES,
            done: false,
        }
    }
}

impl Iterator for StageSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.done {
            return None;
        }
        if self.pos >= self.chunk.len() {
            let control = (self.callback)(&mut self.chunk, self.clock.seconds());
            if control == StageControl::EndOfStream {
                self.done = true;
                return None;
            }
            self.pos = 0;
        }
        let sample = self.chunk[self.pos];
        self.pos += 1;
        Some(sample)
    }
}

impl Source for StageSource {
    fn current_frame_len(&self) -> Option<usize> {
        None // Continuous stream
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// rodio-backed output context.
pub struct RodioOutput {
    /// Must be kept alive for the duration of playback.
    _stream: OutputStream,
    handle: OutputStreamHandle,
    sink: Option<Sink>,
    clock: Arc<OutputClock>,
    open: bool,
}

impl RodioOutput {
    /// Opens the default audio output device.
    pub fn new() -> Result<Self, OutputError> {
        let (stream, handle) =
            OutputStream::try_default().map_err(|e| OutputError::Context(e.to_string()))?;
        Ok(Self {
            _stream: stream,
            handle,
            sink: None,
            clock: Arc::new(OutputClock::new()),
            open: true,
        })
    }
}

// SAFETY: `AudioOutput` requires `Send`. cpal marks its `Stream` (and thus
// rodio's `OutputStream`) `!Send` via a conservative all-platforms marker;
// on the Linux/ALSA backend used here the underlying stream handle has no
// thread affinity, and every other field of `RodioOutput` is `Send`.
unsafe impl Send for RodioOutput {}

impl AudioOutput for RodioOutput {
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn chunk_samples(&self) -> usize {
        CHUNK_SAMPLES
    }

    fn start(&mut self, callback: StageCallback, gain: f32) -> Result<(), OutputError> {
        if !self.open {
            return Err(OutputError::Closed);
        }
        let sink = Sink::try_new(&self.handle).map_err(|e| OutputError::Stage(e.to_string()))?;
        sink.set_volume(gain);
        sink.append(StageSource::new(callback, Arc::clone(&self.clock)));
        tracing::debug!(chunk_samples = CHUNK_SAMPLES, "processing stage started");
        self.sink = Some(sink);
        Ok(())
    }

    fn set_gain(&mut self, gain: f32) {
        if let Some(sink) = self.sink.as_ref() {
            sink.set_volume(gain);
        }
    }

    fn clock_seconds(&self) -> f64 {
        self.clock.seconds()
    }

    fn suspend(&mut self) -> Result<(), OutputError> {
        if !self.open {
            return Err(OutputError::Closed);
        }
        if let Some(sink) = self.sink.as_ref() {
            sink.pause();
        }
        self.clock.pause();
        Ok(())
    }

    fn resume(&mut self) -> Result<(), OutputError> {
        if !self.open {
            return Err(OutputError::Closed);
        }
        if let Some(sink) = self.sink.as_ref() {
            sink.play();
        }
        self.clock.resume();
        Ok(())
    }

    fn close(&mut self) -> Result<(), OutputError> {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
        self.clock.pause();
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
