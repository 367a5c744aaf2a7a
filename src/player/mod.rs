//! The player controller.
//!
//! Owns playback state, sequences the synthesis engine's lifecycle
//! (open stream → load song → fetch missing patches → reload → start → read
//! wave chunks → free), bridges engine PCM into the host audio callback, and
//! translates every state transition into an event payload.
//!
//! # Concurrency
//!
//! Control operations (`play`, `preload`, `pause`, `resume`, `stop`) run on
//! the caller's thread and are serialized by `&mut self`; the audio callback
//! runs on the output's thread and shares the engine through a mutex.
//! Invoking `play` from multiple threads against clones of underlying
//! adapters is not supported.

mod session;

use crate::engine::{MemHandle, PlaybackOptions, RustySynthEngine, SongHandle, SynthEngine};
use crate::event::{EventCallback, EventKind, EventPayload, EventSink};
use crate::fetch::{patch_url, ByteFetcher, HttpFetcher};
use crate::output::{AudioOutput, OutputError, RodioOutput, StageCallback};
use crate::source::{ResolvedSource, SourceDescriptor};
use anyhow::{Context, Result};
use session::{lock_engine, release_resources, SessionResources, SessionShared, SharedEngine};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Default patch base location: a versioned public CDN path holding General
/// MIDI instrument patches named the way the engine resolves them.
pub const DEFAULT_PATCH_BASE: &str = "https://cdn.jsdelivr.net/gh/midiplay/patches@v1/gm";

/// Default volume (nominal 0-100 scale).
pub const DEFAULT_VOLUME: f32 = 80.0;

/// Opaque player instance identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlayerId(Uuid);

impl PlayerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Counts player instantiations so the engine's distinguished
/// first-instantiation bootstrap can be selected explicitly.
///
/// Owned by whatever composes player instances and passed to
/// [`Player::new`]; the first-instance flag is never module-level mutable
/// state.
#[derive(Clone, Default)]
pub struct InstanceRegistry {
    registered: Arc<AtomicU64>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns an instance id and reports whether this is the first
    /// registration in this registry.
    pub fn register(&self) -> InstanceTicket {
        let previous = self.registered.fetch_add(1, Ordering::SeqCst);
        InstanceTicket {
            id: PlayerId::new(),
            first_instance: previous == 0,
        }
    }
}

/// Result of registering with an [`InstanceRegistry`].
pub struct InstanceTicket {
    pub id: PlayerId,
    pub first_instance: bool,
}

/// Construction parameters for a [`Player`].
pub struct PlayerConfig {
    /// Receives every emitted event payload.
    pub on_event: Option<EventCallback>,
    /// Mirror payloads to `tracing` as well.
    pub logging: bool,
    /// Base location missing instrument patches are fetched from.
    pub patch_base_url: String,
    /// Initial volume, nominal 0-100 but unclamped.
    pub volume: f32,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            on_event: None,
            logging: false,
            patch_base_url: DEFAULT_PATCH_BASE.to_string(),
            volume: DEFAULT_VOLUME,
        }
    }
}

/// Playback state machine.
///
/// `Idle` doubles as the stopped state. `Errored` is reachable from any
/// non-terminal state and is not sticky: a subsequent `play` proceeds
/// normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Loading,
    PatchResolving,
    Ready,
    Playing,
    Paused,
    Errored,
}

/// Input to [`Player::play`].
pub struct PlayRequest {
    pub source: SourceDescriptor,
    /// Reusable output context; when absent one is created.
    pub output: Option<Box<dyn AudioOutput>>,
}

impl PlayRequest {
    pub fn new(source: SourceDescriptor) -> Self {
        Self {
            source,
            output: None,
        }
    }
}

/// Creates output contexts when the caller does not supply one.
pub type OutputFactory = Box<dyn Fn() -> Result<Box<dyn AudioOutput>, OutputError> + Send>;

/// The playback controller.
///
/// One live playback session at a time: starting a new one tears down any
/// previous session first. All failures surface as one event payload plus a
/// `false` return; no public operation panics or propagates an error.
pub struct Player {
    id: PlayerId,
    engine: SharedEngine,
    sink: Arc<EventSink>,
    fetcher: Box<dyn ByteFetcher>,
    output_factory: OutputFactory,
    patch_base: String,
    volume: f32,
    state: PlayerState,
    output: Option<Box<dyn AudioOutput>>,
    session: Option<Arc<SessionShared>>,
}

impl Player {
    /// Creates a player with the production adapters: rustysynth engine,
    /// rodio output, blocking HTTP fetcher.
    pub fn new(config: PlayerConfig, registry: &InstanceRegistry) -> Self {
        Self::with_adapters(
            config,
            registry,
            Box::new(RustySynthEngine::new()),
            Box::new(HttpFetcher::new()),
            Box::new(|| RodioOutput::new().map(|o| Box::new(o) as Box<dyn AudioOutput>)),
        )
    }

    /// Creates a player over caller-supplied adapters. This is the seam the
    /// tests use to substitute engine, fetcher, and output doubles.
    ///
    /// Construction is fail-soft: an engine initialization failure is
    /// reported to the sink and the player remains usable.
    pub fn with_adapters(
        config: PlayerConfig,
        registry: &InstanceRegistry,
        engine: Box<dyn SynthEngine + Send>,
        fetcher: Box<dyn ByteFetcher>,
        output_factory: OutputFactory,
    ) -> Self {
        let PlayerConfig {
            on_event,
            logging,
            patch_base_url,
            volume,
        } = config;

        let ticket = registry.register();
        let sink = Arc::new(EventSink::new(on_event, logging));
        let engine: SharedEngine = Arc::new(Mutex::new(engine));

        match lock_engine(&engine).init(ticket.first_instance) {
            Ok(()) => sink.emit(EventPayload::new(
                EventKind::Init,
                format!("player {} initialized", ticket.id),
            )),
            Err(e) => sink.emit(EventPayload::error(
                "engine initialization failed",
                Some(e.to_string()),
            )),
        }

        Self {
            id: ticket.id,
            engine,
            sink,
            fetcher,
            output_factory,
            patch_base: patch_base_url,
            volume,
            state: PlayerState::Idle,
            output: None,
            session: None,
        }
    }

    pub fn id(&self) -> PlayerId {
        self.id
    }

    /// Current playback state. When the engine reached end of stream the
    /// session is already torn down, so `Playing` is reported as `Idle`
    /// without waiting for the next [`stop`](Self::stop).
    pub fn state(&self) -> PlayerState {
        if self.state == PlayerState::Playing {
            if let Some(session) = self.session.as_ref() {
                if session.ended.load(Ordering::Relaxed) {
                    return PlayerState::Idle;
                }
            }
        }
        self.state
    }

    /// Whether a session is live and the engine has not reached end of
    /// stream.
    pub fn is_playing(&self) -> bool {
        self.state == PlayerState::Playing
            && self
                .session
                .as_ref()
                .map(|s| !s.ended.load(Ordering::Relaxed))
                .unwrap_or(false)
    }

    /// Warms the instrument-patch caches for a list of sources without
    /// starting playback, so a later `play` avoids patch-fetch latency.
    ///
    /// Items are processed strictly sequentially (they share engine state).
    /// Returns `false` on the first validation or retrieval failure;
    /// previously preloaded items are not rolled back.
    pub fn preload(
        &mut self,
        items: Vec<SourceDescriptor>,
        output: Option<Box<dyn AudioOutput>>,
    ) -> bool {
        let output = match output {
            Some(output) => output,
            None => match (self.output_factory)() {
                Ok(output) => output,
                Err(e) => return self.fail("failed to open audio output", Some(e.to_string())),
            },
        };
        let options = PlaybackOptions::for_output(output.sample_rate(), output.chunk_samples());

        for item in &items {
            let resolved = match item.resolve() {
                Ok(resolved) => resolved,
                Err(e) => return self.fail(e.to_string(), None),
            };
            self.sink.emit(EventPayload::new(
                EventKind::LoadFile,
                format!("preloading {}", item.display_name()),
            ));

            let bytes: Vec<u8> = match resolved {
                ResolvedSource::Bytes(bytes) => bytes.to_vec(),
                ResolvedSource::Url(url) => match self.fetcher.fetch(url) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        return self.fail(
                            format!("failed to retrieve {}", item.display_name()),
                            Some(e.to_string()),
                        )
                    }
                },
            };

            let (midi_mem, song) = match self.submit_song(&bytes, &options) {
                Ok(loaded) => loaded,
                Err(e) => {
                    return self.fail(
                        format!("failed to load {}", item.display_name()),
                        Some(format!("{e:#}")),
                    )
                }
            };

            // Loading was only the vehicle for patch resolution: release the
            // warm-up song either way.
            let resolve = self.resolve_missing_patches(song);
            {
                let mut engine = lock_engine(&self.engine);
                engine.song_free(song);
                engine.free(midi_mem);
            }
            if let Err(e) = resolve {
                return self.fail(
                    "failed to resolve instrument patches",
                    Some(format!("{e:#}")),
                );
            }
        }
        true
    }

    /// Loads and plays a MIDI source.
    ///
    /// Any existing session is stopped first. Returns `false` at the first
    /// failed precondition.
    pub fn play(&mut self, request: PlayRequest) -> bool {
        let PlayRequest { source, output } = request;
        self.stop();

        let resolved = match source.resolve() {
            Ok(resolved) => resolved,
            Err(e) => return self.fail(e.to_string(), None),
        };

        self.state = PlayerState::Loading;
        self.sink.emit(EventPayload::new(
            EventKind::LoadFile,
            format!("loading {}", source.display_name()),
        ));

        let bytes: Vec<u8> = match resolved {
            ResolvedSource::Bytes(bytes) => bytes.to_vec(),
            ResolvedSource::Url(url) => match self.fetcher.fetch(url) {
                Ok(bytes) => bytes,
                Err(e) => {
                    return self.fail(
                        format!("failed to retrieve {}", source.display_name()),
                        Some(e.to_string()),
                    )
                }
            },
        };

        let mut output = match output {
            Some(output) => output,
            None => match (self.output_factory)() {
                Ok(output) => output,
                Err(e) => return self.fail("failed to open audio output", Some(e.to_string())),
            },
        };
        let options = PlaybackOptions::for_output(output.sample_rate(), output.chunk_samples());

        // First load: resolves which instrument patches the song needs.
        let (midi_mem, first_song) = match self.submit_song(&bytes, &options) {
            Ok(loaded) => loaded,
            Err(e) => {
                return self.fail(
                    format!("failed to load {}", source.display_name()),
                    Some(format!("{e:#}")),
                )
            }
        };

        self.state = PlayerState::PatchResolving;
        let resolve = self.resolve_missing_patches(first_song);
        {
            let mut engine = lock_engine(&self.engine);
            engine.song_free(first_song);
            if resolve.is_err() {
                engine.free(midi_mem);
            }
        }
        if let Err(e) = resolve {
            return self.fail(
                "failed to resolve instrument patches",
                Some(format!("{e:#}")),
            );
        }

        // Installed patches only bind on a fresh load, so always load a
        // second time over the same bytes, even when nothing was missing.
        let reloaded = {
            let mut engine = lock_engine(&self.engine);
            match load_from_mem(engine.as_mut(), midi_mem, &options) {
                Ok(song) => Ok(song),
                Err(e) => {
                    engine.free(midi_mem);
                    Err(e)
                }
            }
        };
        let song = match reloaded {
            Ok(song) => song,
            Err(e) => {
                return self.fail(
                    format!("failed to load {}", source.display_name()),
                    Some(format!("{e:#}")),
                )
            }
        };

        // Scratch buffer the engine renders wave chunks into.
        let allocated = {
            let mut engine = lock_engine(&self.engine);
            match engine.allocate(options.buffer_size) {
                Ok(mem) => Ok(mem),
                Err(e) => {
                    engine.song_free(song);
                    engine.free(midi_mem);
                    Err(e)
                }
            }
        };
        let pcm_mem = match allocated {
            Ok(mem) => mem,
            Err(e) => return self.fail("engine memory allocation failed", Some(e.to_string())),
        };

        self.state = PlayerState::Ready;

        let started = {
            let mut engine = lock_engine(&self.engine);
            match engine.song_start(song) {
                Ok(()) => Ok(()),
                Err(e) => {
                    release_resources(
                        engine.as_mut(),
                        SessionResources {
                            song,
                            midi_mem,
                            pcm_mem,
                        },
                    );
                    Err(e)
                }
            }
        };
        if let Err(e) = started {
            return self.fail("failed to start song", Some(e.to_string()));
        }

        let session = Arc::new(SessionShared {
            engine: Arc::clone(&self.engine),
            sink: Arc::clone(&self.sink),
            resources: Mutex::new(Some(SessionResources {
                song,
                midi_mem,
                pcm_mem,
            })),
            started_at: output.clock_seconds(),
            chunk_samples: output.chunk_samples(),
            ended: AtomicBool::new(false),
        });

        let stage_session = Arc::clone(&session);
        let callback: StageCallback =
            Box::new(move |chunk, clock| stage_session.produce(chunk, clock));
        if let Err(e) = output.start(callback, self.volume / 100.0) {
            {
                let mut engine = lock_engine(&self.engine);
                let mut resources = session.resources.lock().unwrap_or_else(|x| x.into_inner());
                if let Some(held) = resources.take() {
                    release_resources(engine.as_mut(), held);
                }
            }
            return self.fail("failed to start audio output", Some(e.to_string()));
        }

        self.session = Some(session);
        self.output = Some(output);
        self.state = PlayerState::Playing;
        true
    }

    /// Suspends the output clock and emits a pause event with the elapsed
    /// playback time. With no output context this still emits exactly one
    /// event and returns `false`.
    pub fn pause(&mut self) -> bool {
        let elapsed = self.elapsed_seconds();
        match self.output.as_mut() {
            Some(output) => match output.suspend() {
                Ok(()) => {
                    self.state = PlayerState::Paused;
                    let mut payload = EventPayload::new(EventKind::Pause, "playback paused");
                    if let Some(time) = elapsed {
                        payload = payload.with_time(time);
                    }
                    self.sink.emit(payload);
                    true
                }
                Err(e) => {
                    self.sink.emit(EventPayload::error(
                        "failed to suspend audio output",
                        Some(e.to_string()),
                    ));
                    false
                }
            },
            None => {
                self.sink.emit(EventPayload::new(
                    EventKind::Pause,
                    "pause requested before any playback",
                ));
                false
            }
        }
    }

    /// Resumes a suspended output clock. Mirror of [`pause`](Self::pause).
    pub fn resume(&mut self) -> bool {
        let elapsed = self.elapsed_seconds();
        match self.output.as_mut() {
            Some(output) => match output.resume() {
                Ok(()) => {
                    self.state = PlayerState::Playing;
                    let mut payload = EventPayload::new(EventKind::Resume, "playback resumed");
                    if let Some(time) = elapsed {
                        payload = payload.with_time(time);
                    }
                    self.sink.emit(payload);
                    true
                }
                Err(e) => {
                    self.sink.emit(EventPayload::error(
                        "failed to resume audio output",
                        Some(e.to_string()),
                    ));
                    false
                }
            },
            None => {
                self.sink.emit(EventPayload::new(
                    EventKind::Resume,
                    "resume requested before any playback",
                ));
                false
            }
        }
    }

    /// Tears down the live session: closes the output context, releases
    /// engine-held buffers and the song handle, and resets elapsed time.
    ///
    /// Idempotent, and always emits exactly one stop event, even when
    /// nothing was playing (that path performs no release calls).
    pub fn stop(&mut self) -> bool {
        if let Some(mut output) = self.output.take() {
            let _ = output.close();
        }
        if let Some(session) = self.session.take() {
            // Lock order: engine before resources (matches the callback)
            let mut engine = lock_engine(&self.engine);
            let mut resources = session.resources.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(held) = resources.take() {
                release_resources(engine.as_mut(), held);
            }
        }
        self.state = PlayerState::Idle;
        self.sink
            .emit(EventPayload::new(EventKind::Stop, "playback stopped"));
        true
    }

    /// Current volume (nominal 0-100).
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Sets the volume, writing through to the live gain node if one
    /// exists. Non-finite input is rejected with exactly one error event
    /// and leaves the previous volume in effect.
    pub fn set_volume(&mut self, volume: f32) -> bool {
        if !volume.is_finite() {
            self.sink.emit(EventPayload::error(
                format!("invalid volume {volume}: expected a finite number"),
                None,
            ));
            return false;
        }
        self.volume = volume;
        if let Some(output) = self.output.as_mut() {
            output.set_gain(volume / 100.0);
        }
        true
    }

    /// Passes a caller-defined payload through to the sink.
    pub fn emit_event(&self, payload: EventPayload) {
        self.sink.emit(payload);
    }

    /// Replaces the sink's callback and logging flag at runtime without
    /// affecting playback.
    pub fn set_logger(&self, callback: Option<EventCallback>, logging: bool) {
        self.sink.set_logger(callback, logging);
    }

    /// Elapsed playback time: current output clock minus the session start.
    fn elapsed_seconds(&self) -> Option<f64> {
        match (self.output.as_ref(), self.session.as_ref()) {
            (Some(output), Some(session)) => Some(output.clock_seconds() - session.started_at),
            _ => None,
        }
    }

    /// Copies the MIDI bytes into engine memory and performs the first
    /// open→load→close cycle. On failure nothing stays allocated.
    fn submit_song(
        &self,
        bytes: &[u8],
        options: &PlaybackOptions,
    ) -> Result<(MemHandle, SongHandle)> {
        let mut engine = lock_engine(&self.engine);
        let midi_mem = engine
            .allocate(bytes.len())
            .context("engine memory allocation failed")?;

        let loaded = engine
            .write_memory(midi_mem, 0, bytes)
            .map_err(anyhow::Error::new)
            .and_then(|()| load_from_mem(engine.as_mut(), midi_mem, options));
        match loaded {
            Ok(song) => Ok((midi_mem, song)),
            Err(e) => {
                engine.free(midi_mem);
                Err(e)
            }
        }
    }

    /// Fetches and installs every missing instrument patch, strictly
    /// sequentially in ascending index order (patch sets can have
    /// load-order dependencies). The first failure aborts the whole load.
    ///
    /// The engine lock is not held across network retrieval.
    fn resolve_missing_patches(&self, song: SongHandle) -> Result<()> {
        let count = lock_engine(&self.engine).num_missing_instruments(song)?;
        for index in 0..count {
            let name = lock_engine(&self.engine).missing_instrument_name(song, index)?;
            self.sink.emit(EventPayload::new(
                EventKind::LoadPatch,
                format!("loading instrument patch {name}"),
            ));
            let url = patch_url(&self.patch_base, &name);
            let bytes = self
                .fetcher
                .fetch(&url)
                .with_context(|| format!("failed to retrieve patch {name}"))?;
            lock_engine(&self.engine)
                .install_patch(&name, &bytes)
                .with_context(|| format!("failed to install patch {name}"))?;
        }
        Ok(())
    }

    /// Reports a failure: one error event, `Errored` state, `false` return.
    fn fail(&mut self, message: impl Into<String>, detail: Option<String>) -> bool {
        self.state = PlayerState::Errored;
        self.sink.emit(EventPayload::error(message, detail));
        false
    }
}

/// One open→load→close cycle over engine memory. Streams are single-use,
/// so every load opens a fresh one.
fn load_from_mem(
    engine: &mut dyn SynthEngine,
    mem: MemHandle,
    options: &PlaybackOptions,
) -> Result<SongHandle> {
    let stream = engine.istream_open_mem(mem)?;
    let result = engine.song_load(stream, options);
    engine.istream_close(stream);
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, EngineResult, StreamHandle};
    use crate::fetch::FetchError;
    use crate::output::StageControl;
    use crate::pcm;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::AtomicBool;

    const CHUNK: usize = 8;
    const PATCH_BASE: &str = "https://patches.test/base";

    /// Call log shared between a MockEngine and the test body.
    #[derive(Default)]
    struct EngineLog {
        calls: Mutex<Vec<String>>,
        init_flags: Mutex<Vec<bool>>,
    }

    impl EngineLog {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn count(&self, call: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.as_str() == call)
                .count()
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    /// Engine double: canned wave chunks, synthetic missing-instrument
    /// catalog, full call log for ordering assertions.
    struct MockEngine {
        log: Arc<EngineLog>,
        /// Patch names every loaded song requires.
        catalog: Vec<String>,
        installed: HashSet<String>,
        /// Successive read_wave payloads; exhausted means end of stream.
        reads: VecDeque<Vec<u8>>,
        mems: HashMap<u64, Vec<u8>>,
        streams: HashMap<u64, u64>,
        /// Missing patches per song, fixed at load time.
        songs: HashMap<u64, Vec<String>>,
        next: u64,
        fail_start: bool,
    }

    impl MockEngine {
        fn new(log: Arc<EngineLog>, catalog: &[&str], reads: Vec<Vec<u8>>) -> Self {
            Self {
                log,
                catalog: catalog.iter().map(|s| s.to_string()).collect(),
                installed: HashSet::new(),
                reads: reads.into(),
                mems: HashMap::new(),
                streams: HashMap::new(),
                songs: HashMap::new(),
                next: 1,
                fail_start: false,
            }
        }

        fn next(&mut self) -> u64 {
            let handle = self.next;
            self.next += 1;
            handle
        }
    }

    impl SynthEngine for MockEngine {
        fn init(&mut self, first_instance: bool) -> EngineResult<()> {
            self.log.record("init");
            self.log.init_flags.lock().unwrap().push(first_instance);
            Ok(())
        }

        fn exit(&mut self) -> EngineResult<()> {
            self.log.record("exit");
            Ok(())
        }

        fn allocate(&mut self, len: usize) -> EngineResult<MemHandle> {
            self.log.record("allocate");
            let handle = self.next();
            self.mems.insert(handle, vec![0; len]);
            Ok(MemHandle(handle))
        }

        fn free(&mut self, mem: MemHandle) {
            self.log.record("free");
            self.mems.remove(&mem.0);
        }

        fn write_memory(
            &mut self,
            mem: MemHandle,
            offset: usize,
            bytes: &[u8],
        ) -> EngineResult<()> {
            self.log.record("write_memory");
            let buf = self.mems.get_mut(&mem.0).ok_or(EngineError::UnknownMemory(mem))?;
            buf[offset..offset + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }

        fn read_sample(&self, mem: MemHandle, byte_offset: usize) -> EngineResult<i16> {
            let buf = self.mems.get(&mem.0).ok_or(EngineError::UnknownMemory(mem))?;
            pcm::read_i16_le(buf, byte_offset).ok_or(EngineError::OutOfBounds {
                offset: byte_offset,
                len: buf.len(),
            })
        }

        fn istream_open_mem(&mut self, mem: MemHandle) -> EngineResult<StreamHandle> {
            self.log.record("istream_open_mem");
            let handle = self.next();
            self.streams.insert(handle, mem.0);
            Ok(StreamHandle(handle))
        }

        fn istream_close(&mut self, stream: StreamHandle) {
            self.log.record("istream_close");
            self.streams.remove(&stream.0);
        }

        fn song_load(
            &mut self,
            _stream: StreamHandle,
            _options: &PlaybackOptions,
        ) -> EngineResult<SongHandle> {
            self.log.record("song_load");
            let missing: Vec<String> = self
                .catalog
                .iter()
                .filter(|name| !self.installed.contains(*name))
                .cloned()
                .collect();
            let handle = self.next();
            self.songs.insert(handle, missing);
            Ok(SongHandle(handle))
        }

        fn num_missing_instruments(&self, song: SongHandle) -> EngineResult<usize> {
            self.songs
                .get(&song.0)
                .map(|missing| missing.len())
                .ok_or(EngineError::UnknownSong(song))
        }

        fn missing_instrument_name(&self, song: SongHandle, index: usize) -> EngineResult<String> {
            let missing = self.songs.get(&song.0).ok_or(EngineError::UnknownSong(song))?;
            missing
                .get(index)
                .cloned()
                .ok_or(EngineError::MissingIndex { index })
        }

        fn install_patch(&mut self, name: &str, _bytes: &[u8]) -> EngineResult<()> {
            self.log.record(format!("install:{name}"));
            self.installed.insert(name.to_string());
            Ok(())
        }

        fn song_start(&mut self, song: SongHandle) -> EngineResult<()> {
            self.log.record("song_start");
            if self.fail_start {
                return Err(EngineError::Start("mock start failure".to_string()));
            }
            if !self.songs.contains_key(&song.0) {
                return Err(EngineError::UnknownSong(song));
            }
            Ok(())
        }

        fn song_read_wave(
            &mut self,
            _song: SongHandle,
            mem: MemHandle,
            max_bytes: usize,
        ) -> EngineResult<usize> {
            self.log.record("song_read_wave");
            match self.reads.pop_front() {
                Some(data) => {
                    let n = data.len().min(max_bytes);
                    let buf = self.mems.get_mut(&mem.0).ok_or(EngineError::UnknownMemory(mem))?;
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        fn song_free(&mut self, song: SongHandle) {
            self.log.record("song_free");
            self.songs.remove(&song.0);
        }
    }

    /// Fetcher double: canned bytes, optional per-URL failures, request log.
    struct StaticFetcher {
        requests: Arc<Mutex<Vec<String>>>,
        fail_urls: HashSet<String>,
    }

    impl ByteFetcher for StaticFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.requests.lock().unwrap().push(url.to_string());
            if self.fail_urls.contains(url) {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: 404,
                });
            }
            Ok(vec![0xAB; 16])
        }
    }

    /// Output double driven manually from the test body.
    #[derive(Default)]
    struct ManualOutputState {
        callback: Mutex<Option<StageCallback>>,
        clock: Mutex<f64>,
        gain: Mutex<f32>,
        suspended: AtomicBool,
        closed: AtomicBool,
    }

    impl ManualOutputState {
        fn set_clock(&self, seconds: f64) {
            *self.clock.lock().unwrap() = seconds;
        }

        /// Runs one stage tick against the installed callback.
        fn tick(&self) -> (Vec<f32>, StageControl) {
            let mut slot = self.callback.lock().unwrap();
            let callback = slot.as_mut().expect("stage not started");
            let mut chunk = vec![0.0f32; CHUNK];
            let control = callback(&mut chunk, *self.clock.lock().unwrap());
            (chunk, control)
        }
    }

    struct ManualOutput {
        state: Arc<ManualOutputState>,
    }

    impl AudioOutput for ManualOutput {
        fn sample_rate(&self) -> u32 {
            22050
        }

        fn chunk_samples(&self) -> usize {
            CHUNK
        }

        fn start(&mut self, callback: StageCallback, gain: f32) -> Result<(), OutputError> {
            *self.state.callback.lock().unwrap() = Some(callback);
            *self.state.gain.lock().unwrap() = gain;
            Ok(())
        }

        fn set_gain(&mut self, gain: f32) {
            *self.state.gain.lock().unwrap() = gain;
        }

        fn clock_seconds(&self) -> f64 {
            *self.state.clock.lock().unwrap()
        }

        fn suspend(&mut self) -> Result<(), OutputError> {
            self.state.suspended.store(true, Ordering::Relaxed);
            Ok(())
        }

        fn resume(&mut self) -> Result<(), OutputError> {
            self.state.suspended.store(false, Ordering::Relaxed);
            Ok(())
        }

        fn close(&mut self) -> Result<(), OutputError> {
            self.state.closed.store(true, Ordering::Relaxed);
            Ok(())
        }

        fn is_open(&self) -> bool {
            !self.state.closed.load(Ordering::Relaxed)
        }
    }

    struct Harness {
        player: Player,
        events: Arc<Mutex<Vec<EventPayload>>>,
        log: Arc<EngineLog>,
        requests: Arc<Mutex<Vec<String>>>,
        output_state: Arc<ManualOutputState>,
    }

    impl Harness {
        fn new(catalog: &[&str], reads: Vec<Vec<u8>>) -> Self {
            Self::with_failing_urls(catalog, reads, &[])
        }

        fn with_failing_urls(catalog: &[&str], reads: Vec<Vec<u8>>, fail_urls: &[&str]) -> Self {
            let events: Arc<Mutex<Vec<EventPayload>>> = Arc::new(Mutex::new(Vec::new()));
            let log = Arc::new(EngineLog::default());
            let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
            let output_state = Arc::new(ManualOutputState::default());

            let sink_events = Arc::clone(&events);
            let config = PlayerConfig {
                on_event: Some(Box::new(move |payload| {
                    sink_events.lock().unwrap().push(payload.clone());
                })),
                logging: false,
                patch_base_url: PATCH_BASE.to_string(),
                volume: DEFAULT_VOLUME,
            };

            let engine = MockEngine::new(Arc::clone(&log), catalog, reads);
            let fetcher = StaticFetcher {
                requests: Arc::clone(&requests),
                fail_urls: fail_urls.iter().map(|s| s.to_string()).collect(),
            };
            let factory_state = Arc::clone(&output_state);
            let registry = InstanceRegistry::new();
            let player = Player::with_adapters(
                config,
                &registry,
                Box::new(engine),
                Box::new(fetcher),
                Box::new(move || {
                    Ok(Box::new(ManualOutput {
                        state: Arc::clone(&factory_state),
                    }) as Box<dyn AudioOutput>)
                }),
            );

            Self {
                player,
                events,
                log,
                requests,
                output_state,
            }
        }

        fn events_of(&self, kind: &EventKind) -> Vec<EventPayload> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|p| &p.event == kind)
                .cloned()
                .collect()
        }

        fn clear_events(&self) {
            self.events.lock().unwrap().clear();
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    /// Eight bytes of little-endian PCM: full scale, full negative scale,
    /// zero, half scale.
    fn known_chunk() -> Vec<u8> {
        let mut bytes = Vec::new();
        for sample in [32767i16, -32768, 0, 16384] {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    fn buffer_source() -> SourceDescriptor {
        SourceDescriptor::from_bytes(vec![0x4D; 32]).with_name("test song")
    }

    #[test]
    fn test_construction_emits_init_event() {
        let h = Harness::new(&[], vec![]);
        assert_eq!(h.events_of(&EventKind::Init).len(), 1);
        assert_eq!(h.player.state(), PlayerState::Idle);
    }

    #[test]
    fn test_registry_first_instance_flag() {
        let registry = InstanceRegistry::new();
        let log = Arc::new(EngineLog::default());
        for _ in 0..2 {
            let engine = MockEngine::new(Arc::clone(&log), &[], vec![]);
            let _player = Player::with_adapters(
                PlayerConfig::default(),
                &registry,
                Box::new(engine),
                Box::new(StaticFetcher {
                    requests: Arc::new(Mutex::new(Vec::new())),
                    fail_urls: HashSet::new(),
                }),
                Box::new(|| {
                    Ok(Box::new(ManualOutput {
                        state: Arc::new(ManualOutputState::default()),
                    }) as Box<dyn AudioOutput>)
                }),
            );
        }
        assert_eq!(*log.init_flags.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_stop_without_session_is_event_only() {
        let mut h = Harness::new(&[], vec![]);
        h.clear_events();

        assert!(h.player.stop());

        assert_eq!(h.events_of(&EventKind::Stop).len(), 1);
        // No engine or memory release happened
        assert_eq!(h.log.count("song_free"), 0);
        assert_eq!(h.log.count("free"), 0);
    }

    #[test]
    fn test_play_with_ambiguous_source() {
        let mut h = Harness::new(&[], vec![]);
        h.clear_events();

        let mut source = SourceDescriptor::from_bytes(vec![1]);
        source.url = Some("https://example.com/song.mid".to_string());
        assert!(!h.player.play(PlayRequest::new(source)));

        let errors = h.events_of(&EventKind::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("ambiguous source"));
        // No network call, no engine call beyond construction
        assert!(h.requests().is_empty());
        assert_eq!(h.log.count("song_load"), 0);
        assert_eq!(h.player.state(), PlayerState::Errored);
    }

    #[test]
    fn test_play_with_unknown_source() {
        let mut h = Harness::new(&[], vec![]);
        h.clear_events();

        assert!(!h.player.play(PlayRequest::new(SourceDescriptor::default())));

        let errors = h.events_of(&EventKind::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("unknown source"));
        assert!(h.requests().is_empty());
        assert_eq!(h.log.count("song_load"), 0);
    }

    #[test]
    fn test_errored_state_is_not_sticky() {
        let mut h = Harness::new(&[], vec![known_chunk()]);
        assert!(!h.player.play(PlayRequest::new(SourceDescriptor::default())));
        assert_eq!(h.player.state(), PlayerState::Errored);

        // A later play over a valid source proceeds normally
        assert!(h.player.play(PlayRequest::new(buffer_source())));
        assert_eq!(h.player.state(), PlayerState::Playing);
    }

    #[test]
    fn test_play_performs_double_load_with_no_missing_patches() {
        let mut h = Harness::new(&[], vec![known_chunk()]);

        assert!(h.player.play(PlayRequest::new(buffer_source())));

        // Two full open->load->close cycles even with zero missing patches
        assert_eq!(h.log.count("istream_open_mem"), 2);
        assert_eq!(h.log.count("song_load"), 2);
        assert_eq!(h.log.count("istream_close"), 2);
        assert_eq!(h.log.count("song_start"), 1);

        // Start comes strictly after the second load
        let calls = h.log.calls();
        let last_load = calls.iter().rposition(|c| c == "song_load").unwrap();
        let start = calls.iter().position(|c| c == "song_start").unwrap();
        assert!(start > last_load);
        assert!(h.player.is_playing());
    }

    #[test]
    fn test_missing_patches_fetched_in_index_order() {
        let mut h = Harness::new(&["000.sf2", "025.sf2", "drum000.sf2"], vec![known_chunk()]);

        assert!(h.player.play(PlayRequest::new(buffer_source())));

        assert_eq!(
            h.requests(),
            vec![
                format!("{PATCH_BASE}/000.sf2"),
                format!("{PATCH_BASE}/025.sf2"),
                format!("{PATCH_BASE}/drum000.sf2"),
            ]
        );
        assert_eq!(h.events_of(&EventKind::LoadPatch).len(), 3);
        assert_eq!(h.log.count("install:000.sf2"), 1);
        assert_eq!(h.log.count("install:025.sf2"), 1);
        assert_eq!(h.log.count("install:drum000.sf2"), 1);
        assert_eq!(h.log.count("song_start"), 1);
    }

    #[test]
    fn test_patch_failure_aborts_before_next_patch() {
        let fail = format!("{PATCH_BASE}/025.sf2");
        let mut h = Harness::with_failing_urls(
            &["000.sf2", "025.sf2", "drum000.sf2"],
            vec![known_chunk()],
            &[fail.as_str()],
        );

        assert!(!h.player.play(PlayRequest::new(buffer_source())));

        // Attempt k failed: no attempt k+1, song never started
        assert_eq!(
            h.requests(),
            vec![
                format!("{PATCH_BASE}/000.sf2"),
                format!("{PATCH_BASE}/025.sf2"),
            ]
        );
        assert_eq!(h.log.count("install:000.sf2"), 1);
        assert_eq!(h.log.count("install:025.sf2"), 0);
        assert_eq!(h.log.count("song_start"), 0);
        assert_eq!(h.events_of(&EventKind::Error).len(), 1);
        assert_eq!(h.player.state(), PlayerState::Errored);
    }

    #[test]
    fn test_callback_converts_samples_and_pads_tail() {
        let mut h = Harness::new(&[], vec![known_chunk()]);
        assert!(h.player.play(PlayRequest::new(buffer_source())));

        h.output_state.set_clock(0.5);
        let (chunk, control) = h.output_state.tick();
        assert_eq!(control, StageControl::Continue);

        // Four produced samples, normalized by 32767
        assert_eq!(chunk[0], 1.0);
        assert_eq!(chunk[1], -32768.0 / 32767.0);
        assert_eq!(chunk[2], 0.0);
        assert_eq!(chunk[3], 16384.0 / 32767.0);
        // The tail beyond the produced bytes is silence
        assert_eq!(&chunk[4..], &[0.0, 0.0, 0.0, 0.0]);

        // Every tick emits a progress event carrying the elapsed time
        let plays = h.events_of(&EventKind::Play);
        assert_eq!(plays.len(), 1);
        assert_eq!(plays[0].time, Some(0.5));
    }

    #[test]
    fn test_end_of_stream_releases_once() {
        let mut h = Harness::new(&[], vec![known_chunk()]);
        assert!(h.player.play(PlayRequest::new(buffer_source())));
        // One song was freed during the double-load protocol
        assert_eq!(h.log.count("song_free"), 1);

        let (_, control) = h.output_state.tick();
        assert_eq!(control, StageControl::Continue);

        h.output_state.set_clock(2.5);
        let (_, control) = h.output_state.tick();
        assert_eq!(control, StageControl::EndOfStream);

        let ends = h.events_of(&EventKind::End);
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].time, Some(2.5));
        assert!(!h.player.is_playing());

        // The session's resources were released by the callback
        assert_eq!(h.log.count("song_free"), 2);
        let frees = h.log.count("free");

        // A subsequent stop still emits its event but releases nothing more
        h.clear_events();
        assert!(h.player.stop());
        assert_eq!(h.events_of(&EventKind::Stop).len(), 1);
        assert_eq!(h.log.count("song_free"), 2);
        assert_eq!(h.log.count("free"), frees);
    }

    #[test]
    fn test_state_reports_idle_after_end_of_stream() {
        let mut h = Harness::new(&[], vec![known_chunk()]);
        assert!(h.player.play(PlayRequest::new(buffer_source())));
        assert_eq!(h.player.state(), PlayerState::Playing);

        let (_, control) = h.output_state.tick();
        assert_eq!(control, StageControl::Continue);
        let (_, control) = h.output_state.tick();
        assert_eq!(control, StageControl::EndOfStream);

        // The session ended on its own: the reported state follows suit
        assert_eq!(h.player.state(), PlayerState::Idle);
        assert!(!h.player.is_playing());
    }

    #[test]
    fn test_play_stops_previous_session_first() {
        let mut h = Harness::new(&[], vec![known_chunk(), known_chunk()]);
        assert!(h.player.play(PlayRequest::new(buffer_source())));
        h.clear_events();

        assert!(h.player.play(PlayRequest::new(buffer_source())));

        // The implicit stop emitted its event and released the old session
        assert_eq!(h.events_of(&EventKind::Stop).len(), 1);
        assert!(h.player.is_playing());
    }

    #[test]
    fn test_pause_and_resume_without_context() {
        let mut h = Harness::new(&[], vec![]);
        h.clear_events();

        assert!(!h.player.pause());
        assert!(!h.player.resume());

        assert_eq!(h.events_of(&EventKind::Pause).len(), 1);
        assert_eq!(h.events_of(&EventKind::Resume).len(), 1);
        assert_eq!(h.events_of(&EventKind::Error).len(), 0);
    }

    #[test]
    fn test_pause_emits_elapsed_time() {
        let mut h = Harness::new(&[], vec![known_chunk()]);
        assert!(h.player.play(PlayRequest::new(buffer_source())));

        h.output_state.set_clock(2.0);
        assert!(h.player.pause());
        assert_eq!(h.player.state(), PlayerState::Paused);
        assert!(h.output_state.suspended.load(Ordering::Relaxed));

        let pauses = h.events_of(&EventKind::Pause);
        assert_eq!(pauses.len(), 1);
        assert_eq!(pauses[0].time, Some(2.0));

        assert!(h.player.resume());
        assert_eq!(h.player.state(), PlayerState::Playing);
        assert!(!h.output_state.suspended.load(Ordering::Relaxed));
        assert_eq!(h.events_of(&EventKind::Resume).len(), 1);
    }

    #[test]
    fn test_set_volume_rejects_non_finite() {
        let mut h = Harness::new(&[], vec![known_chunk()]);
        assert!(h.player.play(PlayRequest::new(buffer_source())));
        h.clear_events();

        assert!(!h.player.set_volume(f32::NAN));
        assert_eq!(h.player.volume(), DEFAULT_VOLUME);
        assert_eq!(h.events_of(&EventKind::Error).len(), 1);

        // A valid volume writes through to the live gain node
        assert!(h.player.set_volume(55.0));
        assert_eq!(h.player.volume(), 55.0);
        assert_eq!(*h.output_state.gain.lock().unwrap(), 0.55);
    }

    #[test]
    fn test_initial_gain_from_configured_volume() {
        let mut h = Harness::new(&[], vec![known_chunk()]);
        assert!(h.player.play(PlayRequest::new(buffer_source())));
        assert_eq!(*h.output_state.gain.lock().unwrap(), 0.8);
    }

    #[test]
    fn test_preload_warms_patches_without_starting() {
        let mut h = Harness::new(&["000.sf2"], vec![]);
        h.clear_events();

        let items = vec![
            SourceDescriptor::from_bytes(vec![1; 8]),
            SourceDescriptor::from_bytes(vec![2; 8]),
        ];
        assert!(h.player.preload(items, None));

        // One load per item, patch fetched only while still missing
        assert_eq!(h.log.count("song_load"), 2);
        assert_eq!(h.log.count("song_free"), 2);
        assert_eq!(h.log.count("song_start"), 0);
        assert_eq!(h.requests(), vec![format!("{PATCH_BASE}/000.sf2")]);
        assert_eq!(h.events_of(&EventKind::LoadFile).len(), 2);
    }

    #[test]
    fn test_preload_aborts_on_first_failure_without_rollback() {
        let mut h = Harness::new(&["000.sf2"], vec![]);
        let items = vec![
            SourceDescriptor::from_bytes(vec![1; 8]),
            SourceDescriptor::default(), // invalid
            SourceDescriptor::from_bytes(vec![3; 8]),
        ];

        assert!(!h.player.preload(items, None));

        // The first item's patch install persists; the third never loads
        assert_eq!(h.log.count("install:000.sf2"), 1);
        assert_eq!(h.log.count("song_load"), 1);
        assert_eq!(h.events_of(&EventKind::Error).len(), 1);
    }

    #[test]
    fn test_song_start_failure_releases_resources() {
        let events: Arc<Mutex<Vec<EventPayload>>> = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::new(EngineLog::default());
        let mut engine = MockEngine::new(Arc::clone(&log), &[], vec![]);
        engine.fail_start = true;

        let sink_events = Arc::clone(&events);
        let registry = InstanceRegistry::new();
        let mut player = Player::with_adapters(
            PlayerConfig {
                on_event: Some(Box::new(move |p| sink_events.lock().unwrap().push(p.clone()))),
                ..PlayerConfig::default()
            },
            &registry,
            Box::new(engine),
            Box::new(StaticFetcher {
                requests: Arc::new(Mutex::new(Vec::new())),
                fail_urls: HashSet::new(),
            }),
            Box::new(|| {
                Ok(Box::new(ManualOutput {
                    state: Arc::new(ManualOutputState::default()),
                }) as Box<dyn AudioOutput>)
            }),
        );

        assert!(!player.play(PlayRequest::new(buffer_source())));
        assert_eq!(player.state(), PlayerState::Errored);
        // Both songs and both memory buffers were released
        assert_eq!(log.count("song_free"), 2);
        assert_eq!(log.count("free"), 2);
    }

    #[test]
    fn test_emit_event_passthrough() {
        let h = Harness::new(&[], vec![]);
        h.clear_events();

        h.player.emit_event(EventPayload::new(
            EventKind::Custom("my-marker".to_string()),
            "caller event",
        ));

        let events = h.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, EventKind::Custom("my-marker".to_string()));
    }

    #[test]
    fn test_set_logger_redirects_events() {
        let mut h = Harness::new(&[], vec![]);
        let replacement: Arc<Mutex<Vec<EventPayload>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&replacement);
        h.player.set_logger(
            Some(Box::new(move |p| sink.lock().unwrap().push(p.clone()))),
            false,
        );
        h.clear_events();
        h.player.stop();

        assert!(h.events.lock().unwrap().is_empty());
        assert_eq!(replacement.lock().unwrap().len(), 1);
    }
}
