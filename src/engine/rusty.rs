//! rustysynth-backed synthesis engine adapter.
//!
//! Implements [`SynthEngine`] on top of rustysynth for synthesis and midly
//! for MIDI event extraction. Instrument patches are SoundFont files: a song
//! reports as "missing" every instrument it actually sounds that no
//! installed SoundFont covers (bank 0 presets for melodic programs, bank 128
//! for channel-10 drum kits).
//!
//! rustysynth binds exactly one SoundFont per synthesizer, so rendering uses
//! the most recently installed patch set; earlier installs still count
//! toward missing-instrument coverage.

use super::{
    EngineError, EngineResult, MemHandle, PlaybackOptions, SampleFormat, SongHandle, StreamHandle,
    SynthEngine,
};
use crate::pcm;
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use rustysynth::{SoundFont, Synthesizer, SynthesizerSettings};
use std::collections::{BTreeSet, HashMap};
use std::io::Cursor;
use std::sync::Arc;

/// Rendering happens in fixed blocks; channel events are dispatched at
/// block boundaries.
const RENDER_BLOCK: usize = 64;

/// Seconds of tail rendered after the last event so releases ring out.
const RELEASE_TAIL_SECONDS: f64 = 1.0;

/// MIDI channel reserved for percussion.
const DRUM_CHANNEL: u8 = 9;

/// Default tempo when a file carries no tempo meta event (120 BPM).
const DEFAULT_USEC_PER_BEAT: f64 = 500_000.0;

/// An instrument a song actually sounds. Ordering (melodic programs before
/// drum kits, ascending program number) defines the missing-instrument
/// index order reported to the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum InstrumentRef {
    Melodic(u8),
    Drum(u8),
}

impl InstrumentRef {
    /// Resolved patch identifier, joined onto the patch base URL by the
    /// player.
    fn patch_name(&self) -> String {
        match self {
            InstrumentRef::Melodic(program) => format!("{:03}.sf2", program),
            InstrumentRef::Drum(kit) => format!("drum{:03}.sf2", kit),
        }
    }
}

/// A channel message scheduled at an absolute time in seconds.
#[derive(Debug, Clone, Copy)]
struct ScheduledEvent {
    time: f64,
    channel: u8,
    command: u8,
    data1: u8,
    data2: u8,
}

/// Rendering state created by `song_start`.
struct RunState {
    synth: Synthesizer,
    next_event: usize,
    current_time: f64,
    left: Vec<f32>,
    right: Vec<f32>,
}

/// A loaded song.
struct SongState {
    events: Vec<ScheduledEvent>,
    missing: Vec<String>,
    end_time: f64,
    options: PlaybackOptions,
    run: Option<RunState>,
}

/// An installed instrument patch.
struct InstalledPatch {
    name: String,
    font: Arc<SoundFont>,
}

/// The production engine adapter.
pub struct RustySynthEngine {
    next_handle: u64,
    mems: HashMap<u64, Vec<u8>>,
    /// stream handle -> backing memory handle
    streams: HashMap<u64, u64>,
    songs: HashMap<u64, SongState>,
    patches: Vec<InstalledPatch>,
    initialized: bool,
}

impl RustySynthEngine {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            mems: HashMap::new(),
            streams: HashMap::new(),
            songs: HashMap::new(),
            patches: Vec::new(),
            initialized: false,
        }
    }

    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    /// Whether any installed SoundFont provides the given instrument.
    fn covers(&self, instrument: InstrumentRef) -> bool {
        self.patches
            .iter()
            .any(|patch| font_covers(&patch.font, instrument))
    }

    /// Extracts scheduled channel events and the set of sounded instruments
    /// from a parsed MIDI file.
    fn schedule(smf: &Smf) -> EngineResult<(Vec<ScheduledEvent>, BTreeSet<InstrumentRef>)> {
        let ticks_per_beat = match smf.header.timing {
            Timing::Metrical(tpb) => tpb.as_int() as f64,
            Timing::Timecode(_, _) => {
                return Err(EngineError::Load(
                    "SMPTE timecode timing not supported".to_string(),
                ))
            }
        };

        // Raw events with absolute ticks, merged across tracks.
        enum Raw {
            Tempo(u32),
            Channel { channel: u8, command: u8, data1: u8, data2: u8 },
        }
        let mut raw: Vec<(u32, Raw)> = Vec::new();

        for track in &smf.tracks {
            let mut tick: u32 = 0;
            for event in track {
                tick = tick.saturating_add(event.delta.as_int());
                match event.kind {
                    TrackEventKind::Meta(MetaMessage::Tempo(usec_per_beat)) => {
                        raw.push((tick, Raw::Tempo(usec_per_beat.as_int())));
                    }
                    TrackEventKind::Midi { channel, message } => {
                        let (command, data1, data2) = match message {
                            MidiMessage::NoteOff { key, vel } => (0x80, key.as_int(), vel.as_int()),
                            MidiMessage::NoteOn { key, vel } => (0x90, key.as_int(), vel.as_int()),
                            MidiMessage::Aftertouch { key, vel } => {
                                (0xA0, key.as_int(), vel.as_int())
                            }
                            MidiMessage::Controller { controller, value } => {
                                (0xB0, controller.as_int(), value.as_int())
                            }
                            MidiMessage::ProgramChange { program } => (0xC0, program.as_int(), 0),
                            MidiMessage::ChannelAftertouch { vel } => (0xD0, vel.as_int(), 0),
                            MidiMessage::PitchBend { bend } => {
                                let value = bend.0.as_int();
                                (0xE0, (value & 0x7F) as u8, (value >> 7) as u8)
                            }
                        };
                        raw.push((
                            tick,
                            Raw::Channel {
                                channel: channel.as_int(),
                                command,
                                data1,
                                data2,
                            },
                        ));
                    }
                    _ => {}
                }
            }
        }

        // Stable sort keeps same-tick ordering within a track intact.
        raw.sort_by_key(|(tick, _)| *tick);

        // Single pass: ticks to seconds under the tempo map, plus the set of
        // instruments that actually sound.
        let mut events = Vec::new();
        let mut instruments = BTreeSet::new();
        let mut programs = [0u8; 16];
        let mut seconds_per_tick = DEFAULT_USEC_PER_BEAT / (ticks_per_beat * 1_000_000.0);
        let mut last_tick: u32 = 0;
        let mut time: f64 = 0.0;

        for (tick, event) in raw {
            time += (tick - last_tick) as f64 * seconds_per_tick;
            last_tick = tick;
            match event {
                Raw::Tempo(usec_per_beat) => {
                    if usec_per_beat > 0 {
                        seconds_per_tick =
                            usec_per_beat as f64 / (ticks_per_beat * 1_000_000.0);
                    }
                }
                Raw::Channel {
                    channel,
                    command,
                    data1,
                    data2,
                } => {
                    match command {
                        0xC0 => programs[channel as usize] = data1,
                        // Note on with non-zero velocity sounds an instrument
                        0x90 if data2 > 0 => {
                            let program = programs[channel as usize];
                            if channel == DRUM_CHANNEL {
                                instruments.insert(InstrumentRef::Drum(program));
                            } else {
                                instruments.insert(InstrumentRef::Melodic(program));
                            }
                        }
                        _ => {}
                    }
                    events.push(ScheduledEvent {
                        time,
                        channel,
                        command,
                        data1,
                        data2,
                    });
                }
            }
        }

        Ok((events, instruments))
    }
}

impl Default for RustySynthEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a SoundFont has a preset for the instrument: bank 0 for melodic
/// programs, bank 128 for drum kits (the standard kit at patch 0 stands in
/// for any kit number).
fn font_covers(font: &SoundFont, instrument: InstrumentRef) -> bool {
    font.get_presets().iter().any(|preset| {
        let bank = preset.get_bank_number();
        let patch = preset.get_patch_number();
        match instrument {
            InstrumentRef::Melodic(program) => bank == 0 && patch == program as i32,
            InstrumentRef::Drum(kit) => bank == 128 && (patch == kit as i32 || patch == 0),
        }
    })
}

impl SynthEngine for RustySynthEngine {
    fn init(&mut self, first_instance: bool) -> EngineResult<()> {
        if first_instance {
            tracing::debug!("synthesis engine bootstrap (first instance in process)");
        }
        self.initialized = true;
        Ok(())
    }

    fn exit(&mut self) -> EngineResult<()> {
        self.mems.clear();
        self.streams.clear();
        self.songs.clear();
        self.patches.clear();
        self.initialized = false;
        Ok(())
    }

    fn allocate(&mut self, len: usize) -> EngineResult<MemHandle> {
        let handle = self.next_handle();
        self.mems.insert(handle, vec![0; len]);
        Ok(MemHandle(handle))
    }

    fn free(&mut self, mem: MemHandle) {
        self.mems.remove(&mem.0);
    }

    fn write_memory(&mut self, mem: MemHandle, offset: usize, bytes: &[u8]) -> EngineResult<()> {
        let buf = self
            .mems
            .get_mut(&mem.0)
            .ok_or(EngineError::UnknownMemory(mem))?;
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= buf.len())
            .ok_or(EngineError::OutOfBounds {
                offset,
                len: buf.len(),
            })?;
        buf[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    fn read_sample(&self, mem: MemHandle, byte_offset: usize) -> EngineResult<i16> {
        let buf = self
            .mems
            .get(&mem.0)
            .ok_or(EngineError::UnknownMemory(mem))?;
        pcm::read_i16_le(buf, byte_offset).ok_or(EngineError::OutOfBounds {
            offset: byte_offset,
            len: buf.len(),
        })
    }

    fn istream_open_mem(&mut self, mem: MemHandle) -> EngineResult<StreamHandle> {
        if !self.mems.contains_key(&mem.0) {
            return Err(EngineError::UnknownMemory(mem));
        }
        let handle = self.next_handle();
        self.streams.insert(handle, mem.0);
        Ok(StreamHandle(handle))
    }

    fn istream_close(&mut self, stream: StreamHandle) {
        self.streams.remove(&stream.0);
    }

    fn song_load(
        &mut self,
        stream: StreamHandle,
        options: &PlaybackOptions,
    ) -> EngineResult<SongHandle> {
        if !self.initialized {
            return Err(EngineError::Uninitialized);
        }
        if options.channels != 1 || options.format != SampleFormat::S16Le {
            return Err(EngineError::UnsupportedOptions(
                "engine renders 16-bit little-endian mono only".to_string(),
            ));
        }

        let mem = *self
            .streams
            .get(&stream.0)
            .ok_or(EngineError::UnknownStream(stream))?;
        let bytes = self
            .mems
            .get(&mem)
            .ok_or(EngineError::UnknownMemory(MemHandle(mem)))?;

        let smf = Smf::parse(bytes).map_err(|e| EngineError::Load(e.to_string()))?;
        let (events, instruments) = Self::schedule(&smf)?;

        let missing: Vec<String> = instruments
            .iter()
            .filter(|instrument| !self.covers(**instrument))
            .map(|instrument| instrument.patch_name())
            .collect();

        let end_time = events
            .last()
            .map(|event| event.time + RELEASE_TAIL_SECONDS)
            .unwrap_or(0.0);

        let handle = self.next_handle();
        tracing::debug!(
            song = handle,
            events = events.len(),
            missing = missing.len(),
            "song loaded"
        );
        self.songs.insert(
            handle,
            SongState {
                events,
                missing,
                end_time,
                options: options.clone(),
                run: None,
            },
        );
        Ok(SongHandle(handle))
    }

    fn num_missing_instruments(&self, song: SongHandle) -> EngineResult<usize> {
        self.songs
            .get(&song.0)
            .map(|state| state.missing.len())
            .ok_or(EngineError::UnknownSong(song))
    }

    fn missing_instrument_name(&self, song: SongHandle, index: usize) -> EngineResult<String> {
        let state = self.songs.get(&song.0).ok_or(EngineError::UnknownSong(song))?;
        state
            .missing
            .get(index)
            .cloned()
            .ok_or(EngineError::MissingIndex { index })
    }

    fn install_patch(&mut self, name: &str, bytes: &[u8]) -> EngineResult<()> {
        let mut cursor = Cursor::new(bytes);
        let font = SoundFont::new(&mut cursor).map_err(|e| EngineError::Patch {
            name: name.to_string(),
            reason: format!("{:?}", e),
        })?;
        tracing::debug!(patch = name, "instrument patch installed");
        self.patches.push(InstalledPatch {
            name: name.to_string(),
            font: Arc::new(font),
        });
        Ok(())
    }

    fn song_start(&mut self, song: SongHandle) -> EngineResult<()> {
        if !self.initialized {
            return Err(EngineError::Uninitialized);
        }
        let patch = self
            .patches
            .last()
            .ok_or_else(|| EngineError::Start("no instrument patches installed".to_string()))?;

        let state = self
            .songs
            .get_mut(&song.0)
            .ok_or(EngineError::UnknownSong(song))?;

        let settings = SynthesizerSettings::new(state.options.sample_rate as i32);
        let synth = Synthesizer::new(&patch.font, &settings)
            .map_err(|e| EngineError::Start(format!("{:?}", e)))?;

        tracing::debug!(song = song.0, patch = patch.name.as_str(), "song started");
        state.run = Some(RunState {
            synth,
            next_event: 0,
            current_time: 0.0,
            left: vec![0.0; RENDER_BLOCK],
            right: vec![0.0; RENDER_BLOCK],
        });
        Ok(())
    }

    fn song_read_wave(
        &mut self,
        song: SongHandle,
        mem: MemHandle,
        max_bytes: usize,
    ) -> EngineResult<usize> {
        let state = self
            .songs
            .get_mut(&song.0)
            .ok_or(EngineError::UnknownSong(song))?;
        let run = state.run.as_mut().ok_or(EngineError::NotStarted)?;
        let buf = self
            .mems
            .get_mut(&mem.0)
            .ok_or(EngineError::UnknownMemory(mem))?;

        let sample_rate = state.options.sample_rate as f64;
        let total = max_bytes.min(buf.len()) / 2;
        let mut wrote = 0;

        while wrote < total && run.current_time < state.end_time {
            // Dispatch everything due at or before the block boundary
            while run.next_event < state.events.len()
                && state.events[run.next_event].time <= run.current_time
            {
                let event = state.events[run.next_event];
                run.synth.process_midi_message(
                    event.channel as i32,
                    event.command as i32,
                    event.data1 as i32,
                    event.data2 as i32,
                );
                run.next_event += 1;
            }

            let n = RENDER_BLOCK.min(total - wrote);
            run.synth.render(&mut run.left[..n], &mut run.right[..n]);

            for i in 0..n {
                let mixed = ((run.left[i] + run.right[i]) * 0.5).clamp(-1.0, 1.0);
                let sample = (mixed * pcm::I16_SCALE) as i16;
                let offset = (wrote + i) * 2;
                buf[offset..offset + 2].copy_from_slice(&sample.to_le_bytes());
            }

            wrote += n;
            run.current_time += n as f64 / sample_rate;
        }

        // wrote == 0 past end_time signals end of stream
        Ok(wrote * 2)
    }

    fn song_free(&mut self, song: SongHandle) {
        self.songs.remove(&song.0);
    }
}
