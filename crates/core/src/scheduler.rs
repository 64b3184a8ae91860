use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use drumseq_engine::Engine;
use serde::Serialize;

use crate::compile::CombinedTimeline;
use crate::error::TransportError;

/// Slack when deriving beat indices from elapsed time, so a timer that fires
/// exactly on a boundary never lands in the previous beat.
const BEAT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

impl PlaybackState {
    pub fn is_playing(&self) -> bool {
        matches!(self, PlaybackState::Playing)
    }
}

/// Point-in-time view of a scheduler, for readers such as a UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    pub state: PlaybackState,
    pub is_playing: bool,
    pub current_time: f64,
    pub playback_start_time: f64,
    pub loop_enabled: bool,
    pub metronome_enabled: bool,
    /// `None` until the first step of a run has fired.
    pub last_step_index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not playing, or nothing loaded.
    Idle,
    /// Still inside the step that last fired.
    Held { step: usize, wrapped: bool },
    /// Entered a new step and dispatched its notes.
    Stepped {
        step: usize,
        fired: usize,
        failed: usize,
        wrapped: bool,
    },
    /// Reached the end with looping off; now stopped.
    Finished,
}

/// Playback state machine for one track.
///
/// Position is always derived from the clock as `now - playback_start_time`,
/// never accumulated, so late or early ticks cannot make it drift. Notes for
/// a step fire once, on the first tick that lands in it.
pub struct PlaybackScheduler {
    track_id: String,
    engine: Engine,
    timeline: Option<Arc<CombinedTimeline>>,
    state: PlaybackState,
    current_time: f64,
    playback_start_time: f64,
    last_seek: Option<f64>,
    last_step: Option<usize>,
    last_beat: Option<u64>,
    loop_enabled: bool,
    metronome_enabled: bool,
    needs_redraw: bool,
}

impl PlaybackScheduler {
    pub fn new(track_id: impl Into<String>, engine: Engine) -> Self {
        Self {
            track_id: track_id.into(),
            engine,
            timeline: None,
            state: PlaybackState::Stopped,
            current_time: 0.0,
            playback_start_time: 0.0,
            last_seek: None,
            last_step: None,
            last_beat: None,
            loop_enabled: true,
            metronome_enabled: false,
            needs_redraw: false,
        }
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn timeline(&self) -> Option<&Arc<CombinedTimeline>> {
        self.timeline.as_ref()
    }

    /// Install a timeline. While playing, the musical position is kept
    /// across tempo changes and the current step is not retriggered.
    pub fn load(&mut self, timeline: Arc<CombinedTimeline>) {
        if self.state.is_playing() {
            if let Some(old) = &self.timeline {
                if old.tempo != timeline.tempo && timeline.tempo > 0.0 {
                    let now = self.engine.now();
                    let elapsed = (now - self.playback_start_time) * old.tempo / timeline.tempo;
                    self.playback_start_time = now - elapsed;
                    self.last_beat = None;
                }
            }
        }
        self.timeline = Some(timeline);
        self.needs_redraw = true;
    }

    pub fn start(&mut self, seek: Option<f64>) -> Result<(), TransportError> {
        let timeline = self.timeline.clone().ok_or(TransportError::NoTimeline)?;
        let duration = timeline.pattern_duration();
        if timeline.total_steps() == 0 || duration <= 0.0 {
            return Err(TransportError::EmptyTimeline);
        }

        if self.state.is_playing() {
            self.stop();
        }

        if let Some(seek) = seek {
            self.last_seek = Some(seek.max(0.0));
        }
        let mut position = seek.unwrap_or(self.current_time).max(0.0);
        if position >= duration {
            position = if self.loop_enabled {
                position % duration
            } else {
                0.0
            };
        }

        self.playback_start_time = self.engine.now() - position;
        self.current_time = position;
        self.last_step = None;
        self.last_beat = None;
        self.state = PlaybackState::Playing;
        self.needs_redraw = true;

        log::debug!("{}: playback started at {position:.3}s", self.track_id);
        Ok(())
    }

    /// Freeze at the current position. Returns false if not playing.
    pub fn pause(&mut self) -> bool {
        if !self.state.is_playing() {
            return false;
        }
        self.current_time = self.position();
        self.state = PlaybackState::Paused;
        self.last_step = None;
        self.last_beat = None;
        self.needs_redraw = true;
        log::debug!("{}: paused at {:.3}s", self.track_id, self.current_time);
        true
    }

    /// Return to the last manual seek (or 0). Returns false if already stopped.
    pub fn stop(&mut self) -> bool {
        if self.state == PlaybackState::Stopped {
            return false;
        }
        self.state = PlaybackState::Stopped;
        self.last_step = None;
        self.last_beat = None;
        self.current_time = self.last_seek.unwrap_or(0.0);
        self.needs_redraw = true;
        log::debug!("{}: stopped", self.track_id);
        true
    }

    /// Manual seek. Remembered as the position later `stop`s return to.
    pub fn set_current_time(&mut self, seconds: f64) {
        let seconds = seconds.max(0.0);
        self.last_seek = Some(seconds);
        self.current_time = seconds;
        if self.state.is_playing() {
            self.playback_start_time = self.engine.now() - seconds;
            self.last_step = None;
            self.last_beat = None;
        }
        self.needs_redraw = true;
    }

    /// Change the tempo of the loaded timeline, keeping the musical position.
    pub fn set_tempo(&mut self, tempo: f64) -> bool {
        let Some(timeline) = &self.timeline else {
            return false;
        };
        if !tempo.is_finite() || tempo <= 0.0 || timeline.tempo == tempo {
            return false;
        }
        let mut next = CombinedTimeline::clone(timeline);
        next.tempo = tempo;
        next.total_duration = next.bars as f64 * next.time_signature.seconds_per_bar(tempo);
        self.load(Arc::new(next));
        true
    }

    pub fn set_loop_enabled(&mut self, enabled: bool) {
        self.loop_enabled = enabled;
    }

    pub fn set_metronome_enabled(&mut self, enabled: bool) {
        self.metronome_enabled = enabled;
        self.last_beat = None;
    }

    pub fn loop_enabled(&self) -> bool {
        self.loop_enabled
    }

    pub fn metronome_enabled(&self) -> bool {
        self.metronome_enabled
    }

    /// Playhead in seconds: live while playing, frozen otherwise.
    pub fn position(&self) -> f64 {
        if self.state.is_playing() {
            (self.engine.now() - self.playback_start_time).max(0.0)
        } else {
            self.current_time
        }
    }

    /// Seconds from now until the next metronome beat boundary.
    pub fn time_to_next_beat(&self) -> Option<f64> {
        let beat = self.timeline.as_ref()?.beat_duration();
        let into_beat = self.position() % beat;
        if into_beat < BEAT_EPSILON {
            Some(0.0)
        } else {
            Some(beat - into_beat)
        }
    }

    /// Advance playback to the clock's current time.
    pub fn tick(&mut self) -> TickOutcome {
        if !self.state.is_playing() {
            return TickOutcome::Idle;
        }
        let Some(timeline) = self.timeline.clone() else {
            return TickOutcome::Idle;
        };

        let duration = timeline.pattern_duration();
        let mut elapsed = (self.engine.now() - self.playback_start_time).max(0.0);
        let mut wrapped = false;

        if elapsed >= duration {
            if !self.loop_enabled {
                self.stop();
                return TickOutcome::Finished;
            }
            let loops = (elapsed / duration).floor();
            self.playback_start_time += loops * duration;
            elapsed -= loops * duration;
            self.last_step = None;
            self.last_beat = None;
            wrapped = true;
        }

        self.current_time = elapsed;
        self.needs_redraw = true;

        let step = (elapsed / timeline.step_duration()).floor() as usize % timeline.total_steps();
        if self.last_step == Some(step) {
            return TickOutcome::Held { step, wrapped };
        }
        self.last_step = Some(step);

        let (fired, failed) = self.fire_step(&timeline, step);
        TickOutcome::Stepped {
            step,
            fired,
            failed,
            wrapped,
        }
    }

    /// Click once per beat, accenting the first beat of each bar. Returns
    /// the accent flag of a click that fired.
    pub fn metronome_tick(&mut self) -> Option<bool> {
        if !self.state.is_playing() || !self.metronome_enabled {
            return None;
        }
        let timeline = self.timeline.clone()?;

        let position = self.position() % timeline.pattern_duration();
        let beat = (position / timeline.beat_duration() + BEAT_EPSILON).floor() as u64;
        if self.last_beat == Some(beat) {
            return None;
        }
        self.last_beat = Some(beat);

        let accent = beat % timeline.time_signature.beats_per_bar().max(1) as u64 == 0;
        let trigger = self.engine.trigger();
        match catch_unwind(AssertUnwindSafe(|| trigger.play_metronome(accent))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::warn!("{}: metronome click failed: {err:#}", self.track_id),
            Err(_) => log::error!("{}: metronome trigger panicked", self.track_id),
        }
        Some(accent)
    }

    /// True once after any change a reader should redraw for.
    pub fn take_redraw(&mut self) -> bool {
        std::mem::take(&mut self.needs_redraw)
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            state: self.state,
            is_playing: self.state.is_playing(),
            current_time: self.position(),
            playback_start_time: self.playback_start_time,
            loop_enabled: self.loop_enabled,
            metronome_enabled: self.metronome_enabled,
            last_step_index: self.last_step,
        }
    }

    /// Dispatch every active cell of `step`; a failing trigger is logged and
    /// skipped.
    fn fire_step(&self, timeline: &CombinedTimeline, step: usize) -> (usize, usize) {
        let trigger = self.engine.trigger();
        let mut fired = 0;
        let mut failed = 0;

        for lane in timeline.grid.active_rows(step) {
            let Some(inst) = timeline.instruments.get(lane) else {
                continue;
            };
            let result = catch_unwind(AssertUnwindSafe(|| {
                trigger.play_note(inst.pitch, inst.velocity, &self.track_id)
            }));
            match result {
                Ok(Ok(())) => fired += 1,
                Ok(Err(err)) => {
                    failed += 1;
                    log::warn!("{}: note {} failed: {err:#}", self.track_id, inst.id);
                }
                Err(_) => {
                    failed += 1;
                    log::error!("{}: trigger panicked on note {}", self.track_id, inst.id);
                }
            }
        }

        if fired > 0 {
            log::trace!("{}: step {step} fired {fired} notes", self.track_id);
        }
        (fired, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{CompileOptions, compile};
    use crate::sync_groups::SyncGroupRegistry;
    use drumseq_engine::{AudioTrigger, ManualClock, RecordingTrigger};
    use drumseq_transport::{Grid, SyncGroupId, TriggerCommand, default_instruments};

    const TICK: f64 = 0.008;

    struct Rig {
        scheduler: PlaybackScheduler,
        clock: Arc<ManualClock>,
        trigger: Arc<RecordingTrigger>,
    }

    fn timeline(bars: usize) -> Arc<CombinedTimeline> {
        let instruments = default_instruments();
        let registry = SyncGroupRegistry::new(&instruments);
        Arc::new(compile(&registry, &instruments, &CompileOptions::new(bars)).unwrap())
    }

    fn rig(bars: usize) -> Rig {
        let clock = Arc::new(ManualClock::new(10.0));
        let trigger = Arc::new(RecordingTrigger::new());
        let engine = Engine::new(clock.clone(), trigger.clone());
        let mut scheduler = PlaybackScheduler::new("drums", engine);
        scheduler.load(timeline(bars));
        Rig {
            scheduler,
            clock,
            trigger,
        }
    }

    /// Tick at 8ms spacing over `[from, to)` seconds after start.
    fn run(rig: &mut Rig, start: f64, from: f64, to: f64) -> Vec<TickOutcome> {
        let mut outcomes = Vec::new();
        let mut k = 0;
        loop {
            let t = from + k as f64 * TICK;
            if t >= to {
                break;
            }
            rig.clock.set(start + t);
            outcomes.push(rig.scheduler.tick());
            k += 1;
        }
        outcomes
    }

    fn stepped(outcomes: &[TickOutcome]) -> Vec<usize> {
        outcomes
            .iter()
            .filter_map(|o| match o {
                TickOutcome::Stepped { step, .. } => Some(*step),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_requires_timeline() {
        let engine = Engine::new(Arc::new(ManualClock::default()), Arc::new(RecordingTrigger::new()));
        let mut scheduler = PlaybackScheduler::new("t", engine);
        assert_eq!(scheduler.start(None), Err(TransportError::NoTimeline));
        assert_eq!(scheduler.state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_each_step_fires_exactly_once() {
        let mut rig = rig(1);
        rig.scheduler.start(None).unwrap();

        let outcomes = run(&mut rig, 10.0, 0.0, 2.0);

        assert_eq!(stepped(&outcomes), (0..16).collect::<Vec<_>>());
        // starter beat: 2 kicks + 2 snares + 8 hats
        assert_eq!(rig.trigger.notes().len(), 12);
    }

    #[test]
    fn test_position_is_derived_from_clock() {
        let mut rig = rig(1);
        rig.scheduler.start(None).unwrap();

        // one late tick jumps straight to the right step
        rig.clock.set(10.0 + 0.77);
        let outcome = rig.scheduler.tick();
        assert!(matches!(outcome, TickOutcome::Stepped { step: 6, .. }));
        assert!((rig.scheduler.snapshot().current_time - 0.77).abs() < 1e-9);
    }

    #[test]
    fn test_loop_wraps_without_duplicate_triggers() {
        let mut rig = rig(1);
        rig.scheduler.start(None).unwrap();
        run(&mut rig, 10.0, 0.0, 1.999);
        let before = rig.trigger.notes().len();

        // exactly one pattern duration after start
        rig.clock.set(12.0);
        let outcome = rig.scheduler.tick();
        assert!(matches!(
            outcome,
            TickOutcome::Stepped {
                step: 0,
                wrapped: true,
                ..
            }
        ));
        assert!(rig.scheduler.snapshot().current_time.abs() < 1e-9);
        assert_eq!(rig.scheduler.snapshot().last_step_index, Some(0));

        rig.clock.set(12.0 + TICK);
        assert!(matches!(
            rig.scheduler.tick(),
            TickOutcome::Held { step: 0, .. }
        ));

        // step 0 has kick + hat, fired once for the new loop
        assert_eq!(rig.trigger.notes().len(), before + 2);
    }

    #[test]
    fn test_no_loop_finishes() {
        let mut rig = rig(1);
        rig.scheduler.set_loop_enabled(false);
        rig.scheduler.start(None).unwrap();

        rig.clock.set(12.5);
        assert_eq!(rig.scheduler.tick(), TickOutcome::Finished);
        assert_eq!(rig.scheduler.state(), PlaybackState::Stopped);
        assert_eq!(rig.scheduler.tick(), TickOutcome::Idle);
    }

    #[test]
    fn test_stop_is_idempotent_and_keeps_seek() {
        let mut rig = rig(2);
        rig.scheduler.set_current_time(1.0);
        rig.scheduler.start(None).unwrap();
        rig.clock.advance(0.5);
        rig.scheduler.tick();

        assert!(rig.scheduler.stop());
        assert!(!rig.scheduler.stop());

        let snapshot = rig.scheduler.snapshot();
        assert_eq!(snapshot.state, PlaybackState::Stopped);
        assert_eq!(snapshot.current_time, 1.0);
        assert_eq!(snapshot.last_step_index, None);

        // next start resumes from the seek and retriggers its step
        rig.scheduler.start(None).unwrap();
        assert!(matches!(
            rig.scheduler.tick(),
            TickOutcome::Stepped { step: 8, .. }
        ));
    }

    #[test]
    fn test_pause_freezes_position() {
        let mut rig = rig(1);
        rig.scheduler.start(None).unwrap();
        rig.clock.advance(0.6);
        rig.scheduler.tick();

        assert!(rig.scheduler.pause());
        assert!(!rig.scheduler.pause());
        rig.clock.advance(5.0);
        assert!((rig.scheduler.position() - 0.6).abs() < 1e-9);
        assert_eq!(rig.scheduler.tick(), TickOutcome::Idle);

        rig.scheduler.start(None).unwrap();
        assert!((rig.scheduler.position() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_restart_while_playing_resets_cursor() {
        let mut rig = rig(1);
        rig.scheduler.start(None).unwrap();
        rig.scheduler.tick();

        rig.scheduler.start(Some(0.0)).unwrap();
        assert_eq!(rig.scheduler.state(), PlaybackState::Playing);
        assert_eq!(rig.scheduler.snapshot().last_step_index, None);
        assert!(matches!(
            rig.scheduler.tick(),
            TickOutcome::Stepped { step: 0, .. }
        ));
    }

    #[test]
    fn test_failing_trigger_does_not_halt_playback() {
        struct Flaky;
        impl AudioTrigger for Flaky {
            fn play_note(&self, pitch: u8, _: f32, _: &str) -> anyhow::Result<()> {
                if pitch == 36 {
                    panic!("kick sample missing");
                }
                anyhow::bail!("device busy")
            }
            fn play_metronome(&self, _: bool) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let clock = Arc::new(ManualClock::new(0.0));
        let engine = Engine::new(clock.clone(), Arc::new(Flaky));
        let mut scheduler = PlaybackScheduler::new("t", engine);
        scheduler.load(timeline(1));
        scheduler.start(None).unwrap();

        assert_eq!(
            scheduler.tick(),
            TickOutcome::Stepped {
                step: 0,
                fired: 0,
                failed: 2,
                wrapped: false
            }
        );
        clock.set(0.25);
        assert!(matches!(scheduler.tick(), TickOutcome::Stepped { step: 2, .. }));
        assert!(scheduler.state().is_playing());
    }

    #[test]
    fn test_metronome_accents_downbeats() {
        let mut rig = rig(1);
        rig.scheduler.set_metronome_enabled(true);
        rig.scheduler.start(None).unwrap();

        for beat in 0..5 {
            rig.clock.set(10.0 + beat as f64 * 0.5);
            rig.scheduler.metronome_tick();
            // a second call inside the same beat is silent
            assert_eq!(rig.scheduler.metronome_tick(), None);
        }

        assert_eq!(rig.trigger.clicks(), vec![true, false, false, false, true]);
    }

    #[test]
    fn test_metronome_disabled_is_silent() {
        let mut rig = rig(1);
        rig.scheduler.start(None).unwrap();
        assert_eq!(rig.scheduler.metronome_tick(), None);
        assert!(rig.trigger.clicks().is_empty());
    }

    #[test]
    fn test_tempo_change_keeps_musical_position() {
        let mut rig = rig(1);
        rig.scheduler.start(None).unwrap();
        rig.clock.set(11.0);
        rig.scheduler.tick();

        // halve the tempo: one second of 120 bpm is two seconds of 60 bpm
        let instruments = default_instruments();
        let mut registry = SyncGroupRegistry::new(&instruments);
        for id in SyncGroupId::ALL {
            registry.set_group_tempo(id, 60.0).unwrap();
        }
        let slow = compile(&registry, &instruments, &CompileOptions::new(1)).unwrap();
        rig.scheduler.load(Arc::new(slow));

        assert!((rig.scheduler.position() - 2.0).abs() < 1e-9);
        assert!(matches!(
            rig.scheduler.tick(),
            TickOutcome::Held { step: 8, .. }
        ));
    }

    #[test]
    fn test_reload_does_not_retrigger_current_step() {
        let mut rig = rig(1);
        rig.scheduler.start(None).unwrap();
        rig.scheduler.tick();
        let notes = rig.trigger.notes().len();

        let instruments = default_instruments();
        let mut registry = SyncGroupRegistry::new(&instruments);
        registry
            .set_group_grid(SyncGroupId::A, Grid::new(8, 16).toggled(3, 0).unwrap())
            .unwrap();
        let edited = compile(&registry, &instruments, &CompileOptions::new(1)).unwrap();
        rig.scheduler.load(Arc::new(edited));

        rig.clock.advance(TICK);
        rig.scheduler.tick();
        assert_eq!(rig.trigger.notes().len(), notes);
        assert!(rig.trigger.events().iter().all(|e| matches!(e, TriggerCommand::NoteOn { .. })));
    }

    #[test]
    fn test_set_tempo_rescales_position() {
        let mut rig = rig(1);
        rig.scheduler.start(None).unwrap();
        rig.clock.set(10.5);
        rig.scheduler.tick();

        assert!(rig.scheduler.set_tempo(240.0));
        assert!(!rig.scheduler.set_tempo(240.0), "unchanged tempo is a no-op");
        assert!(!rig.scheduler.set_tempo(0.0));

        let timeline = rig.scheduler.timeline().unwrap();
        assert_eq!(timeline.total_duration, 1.0);
        assert!((rig.scheduler.position() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_take_redraw() {
        let mut rig = rig(1);
        assert!(rig.scheduler.take_redraw(), "load marks redraw");
        assert!(!rig.scheduler.take_redraw());
        rig.scheduler.set_current_time(0.5);
        assert!(rig.scheduler.take_redraw());
    }
}
