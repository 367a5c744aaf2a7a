//! Per-session state shared between the player and the audio callback.
//!
//! The callback runs on the host's audio path and cannot call back into the
//! `Player` that owns it, so everything it needs lives behind `Arc`s: the
//! engine, the event sink, and the engine-held resources of the session.

use crate::engine::{MemHandle, SongHandle, SynthEngine};
use crate::event::{EventKind, EventPayload, EventSink};
use crate::output::StageControl;
use crate::pcm;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) type SharedEngine = Arc<Mutex<Box<dyn SynthEngine + Send>>>;

/// Locks the engine, tolerating poisoning: the engine's state is handle
/// bookkeeping and stays coherent even if a panic interrupted a caller.
pub(crate) fn lock_engine(engine: &SharedEngine) -> MutexGuard<'_, Box<dyn SynthEngine + Send>> {
    engine.lock().unwrap_or_else(|e| e.into_inner())
}

/// Engine-held resources for one playback session.
pub(crate) struct SessionResources {
    /// The loaded song.
    pub song: SongHandle,
    /// Engine memory holding the raw MIDI bytes.
    pub midi_mem: MemHandle,
    /// Engine memory the wave chunks are rendered into.
    pub pcm_mem: MemHandle,
}

/// Releases everything the engine holds for a session.
pub(crate) fn release_resources(engine: &mut dyn SynthEngine, resources: SessionResources) {
    engine.song_free(resources.song);
    engine.free(resources.midi_mem);
    engine.free(resources.pcm_mem);
}

/// State shared between the player and its audio callback.
///
/// The resources slot is the single release point: both `Player::stop` and
/// the end-of-stream branch of [`produce`](Self::produce) `take()` it, so
/// release happens exactly once no matter which side gets there first.
pub(crate) struct SessionShared {
    pub engine: SharedEngine,
    pub sink: Arc<EventSink>,
    pub resources: Mutex<Option<SessionResources>>,
    /// Output clock value when the song was started.
    pub started_at: f64,
    pub chunk_samples: usize,
    /// Set when the engine signalled end of stream.
    pub ended: AtomicBool,
}

impl SessionShared {
    /// Produces the next chunk of float samples.
    ///
    /// Runs on the audio path: every failure is reported to the sink and the
    /// chunk silenced; nothing propagates into the host's callback mechanism.
    pub fn produce(&self, out: &mut [f32], clock_seconds: f64) -> StageControl {
        let elapsed = clock_seconds - self.started_at;
        self.sink
            .emit(EventPayload::new(EventKind::Play, "playing").with_time(elapsed));

        // Lock order: engine before resources (matches Player::stop)
        let mut engine = lock_engine(&self.engine);
        let mut resources = self.resources.lock().unwrap_or_else(|e| e.into_inner());
        let (song, pcm_mem) = match resources.as_ref() {
            Some(held) => (held.song, held.pcm_mem),
            // Session already torn down elsewhere
            None => return StageControl::EndOfStream,
        };

        let max_bytes = self.chunk_samples * 2;
        match engine.song_read_wave(song, pcm_mem, max_bytes) {
            Ok(0) => {
                // End of stream, not an error: release in place, the next
                // stop() finds nothing left to free.
                if let Some(held) = resources.take() {
                    release_resources(engine.as_mut(), held);
                }
                self.ended.store(true, Ordering::Relaxed);
                self.sink.emit(
                    EventPayload::new(EventKind::End, "playback finished").with_time(elapsed),
                );
                StageControl::EndOfStream
            }
            Ok(produced) => {
                for (i, slot) in out.iter_mut().enumerate() {
                    let offset = 2 * i;
                    *slot = if offset < produced {
                        match engine.read_sample(pcm_mem, offset) {
                            Ok(sample) => pcm::normalize(sample),
                            Err(_) => 0.0,
                        }
                    } else {
                        // Silent tail of a short final chunk
                        0.0
                    };
                }
                StageControl::Continue
            }
            Err(e) => {
                self.sink.emit(EventPayload::error(
                    "failed to read wave data",
                    Some(e.to_string()),
                ));
                out.fill(0.0);
                StageControl::Continue
            }
        }
    }
}
