//! Tokio timers that drive a [`PlaybackScheduler`] in real time.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use drumseq_engine::{Clock, Engine, EngineState};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::compile::CombinedTimeline;
use crate::error::TransportError;
use crate::scheduler::{PlaybackScheduler, PlaybackSnapshot, PlaybackState, TickOutcome};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(8);
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Clock on tokio's time source, so paused test time drives it too.
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct GuardState {
    held: bool,
    generation: u64,
}

/// Single-flight gate with a bounded wait.
///
/// A waiter that outlasts the timeout takes the gate by force. Each holder
/// carries a generation, so a stale holder dropping late cannot release
/// the gate out from under a newer one.
#[derive(Debug, Default)]
pub struct InitGuard {
    state: Mutex<GuardState>,
    released: Notify,
}

#[derive(Debug)]
pub struct InitPermit<'a> {
    guard: &'a InitGuard,
    generation: u64,
    forced: bool,
}

impl InitPermit<'_> {
    /// True if the previous holder was evicted after the timeout.
    pub fn forced(&self) -> bool {
        self.forced
    }
}

impl Drop for InitPermit<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.guard.state);
        if state.generation == self.generation {
            state.held = false;
            drop(state);
            self.guard.released.notify_waiters();
        }
    }
}

impl InitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        lock(&self.state).held
    }

    pub async fn acquire(&self, timeout: Duration) -> InitPermit<'_> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(permit) = self.try_take() {
                return permit;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                log::warn!("init guard still held after {timeout:?}, forcing reset");
                let mut state = lock(&self.state);
                state.held = true;
                state.generation += 1;
                return InitPermit {
                    guard: self,
                    generation: state.generation,
                    forced: true,
                };
            }
        }
    }

    fn try_take(&self) -> Option<InitPermit<'_>> {
        let mut state = lock(&self.state);
        if state.held {
            return None;
        }
        state.held = true;
        state.generation += 1;
        Some(InitPermit {
            guard: self,
            generation: state.generation,
            forced: false,
        })
    }
}

#[derive(Default)]
struct Timers {
    tick: Option<JoinHandle<()>>,
    metronome: Option<JoinHandle<()>>,
    handle: Option<Handle>,
}

impl Timers {
    fn abort(&mut self) {
        if let Some(task) = self.tick.take() {
            task.abort();
        }
        self.abort_metronome();
    }

    fn abort_metronome(&mut self) {
        if let Some(task) = self.metronome.take() {
            task.abort();
        }
    }
}

/// Real-time playback of one track.
pub struct Transport {
    scheduler: Arc<Mutex<PlaybackScheduler>>,
    engine: Engine,
    guard: InitGuard,
    timers: Mutex<Timers>,
    tick_interval: Duration,
    init_timeout: Duration,
}

impl Transport {
    pub fn new(track_id: impl Into<String>, engine: Engine) -> Self {
        Self {
            scheduler: Arc::new(Mutex::new(PlaybackScheduler::new(track_id, engine.clone()))),
            engine,
            guard: InitGuard::new(),
            timers: Mutex::new(Timers::default()),
            tick_interval: DEFAULT_TICK_INTERVAL,
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }

    pub fn with_timing(mut self, tick_interval: Duration, init_timeout: Duration) -> Self {
        self.tick_interval = tick_interval.max(Duration::from_millis(1));
        self.init_timeout = init_timeout;
        self
    }

    pub fn track_id(&self) -> String {
        lock(&self.scheduler).track_id().to_string()
    }

    /// Start, or restart, playback. `timeline` replaces the loaded one when
    /// given.
    pub async fn start(
        &self,
        timeline: Option<Arc<CombinedTimeline>>,
        seek: Option<f64>,
    ) -> Result<(), TransportError> {
        if self.engine.state() == EngineState::Disposed {
            return Err(TransportError::Disposed);
        }

        let permit = self.guard.acquire(self.init_timeout).await;
        if permit.forced() {
            log::warn!("{}: previous start did not finish", self.track_id());
        }

        lock(&self.timers).abort();
        {
            let mut scheduler = lock(&self.scheduler);
            if scheduler.state().is_playing() {
                scheduler.stop();
            }
            if let Some(timeline) = timeline {
                scheduler.load(timeline);
            }
        }

        if !self.engine.is_ready() {
            self.bring_up_engine().await;
        }

        lock(&self.scheduler).start(seek)?;
        self.spawn_timers();
        drop(permit);
        Ok(())
    }

    /// Replace the timeline. While playing, a tempo or meter change
    /// realigns the metronome.
    pub fn load(&self, timeline: Arc<CombinedTimeline>) {
        let realign = {
            let mut scheduler = lock(&self.scheduler);
            let realign = scheduler.state().is_playing()
                && scheduler.timeline().is_some_and(|old| {
                    old.tempo != timeline.tempo || old.time_signature != timeline.time_signature
                });
            scheduler.load(timeline);
            realign
        };
        if realign {
            self.restart_metronome();
        }
    }

    pub fn set_tempo(&self, tempo: f64) {
        let changed = {
            let mut scheduler = lock(&self.scheduler);
            scheduler.set_tempo(tempo) && scheduler.state().is_playing()
        };
        if changed {
            self.restart_metronome();
        }
    }

    pub fn pause(&self) -> bool {
        lock(&self.timers).abort();
        lock(&self.scheduler).pause()
    }

    pub fn stop(&self) -> bool {
        lock(&self.timers).abort();
        lock(&self.scheduler).stop()
    }

    pub fn set_current_time(&self, seconds: f64) {
        lock(&self.scheduler).set_current_time(seconds);
    }

    pub fn set_loop_enabled(&self, enabled: bool) {
        lock(&self.scheduler).set_loop_enabled(enabled);
    }

    pub fn set_metronome_enabled(&self, enabled: bool) {
        lock(&self.scheduler).set_metronome_enabled(enabled);
    }

    pub fn state(&self) -> PlaybackState {
        lock(&self.scheduler).state()
    }

    pub fn position(&self) -> f64 {
        lock(&self.scheduler).position()
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        lock(&self.scheduler).snapshot()
    }

    pub fn take_redraw(&self) -> bool {
        lock(&self.scheduler).take_redraw()
    }

    async fn bring_up_engine(&self) {
        let engine = self.engine.clone();
        let bring_up = tokio::task::spawn_blocking(move || engine.ensure_ready());

        match tokio::time::timeout(self.init_timeout, bring_up).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => {
                log::warn!("audio engine failed to start, playing without sound: {err:#}")
            }
            Ok(Err(err)) => log::error!("audio engine bring-up aborted: {err}"),
            Err(_) => log::warn!(
                "audio engine not ready after {:?}, playing without sound",
                self.init_timeout
            ),
        }
    }

    fn spawn_timers(&self) {
        let mut timers = lock(&self.timers);
        let handle = Handle::current();

        let scheduler = self.scheduler.clone();
        let period = self.tick_interval;
        timers.tick = Some(handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let outcome = {
                    let mut scheduler = lock(&scheduler);
                    catch_unwind(AssertUnwindSafe(|| scheduler.tick()))
                };
                match outcome {
                    Ok(TickOutcome::Finished | TickOutcome::Idle) => break,
                    Ok(_) => {}
                    Err(_) => log::error!("playback tick panicked"),
                }
            }
        }));

        timers.metronome = self.spawn_metronome(&handle);
        timers.handle = Some(handle);
    }

    fn restart_metronome(&self) {
        let mut timers = lock(&self.timers);
        timers.abort_metronome();
        let Some(handle) = timers.handle.clone().or_else(|| Handle::try_current().ok()) else {
            log::warn!("no runtime to restart the metronome on");
            return;
        };
        timers.metronome = self.spawn_metronome(&handle);
    }

    fn spawn_metronome(&self, handle: &Handle) -> Option<JoinHandle<()>> {
        let (first, period) = {
            let scheduler = lock(&self.scheduler);
            let wait = scheduler.time_to_next_beat()?;
            let beat = scheduler.timeline()?.beat_duration();
            (wait, beat)
        };
        if !period.is_finite() || period <= 0.0 {
            return None;
        }

        let scheduler = self.scheduler.clone();
        Some(handle.spawn(async move {
            let start = Instant::now() + Duration::from_secs_f64(first.max(0.0));
            let mut interval = tokio::time::interval_at(start, Duration::from_secs_f64(period));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let mut scheduler = lock(&scheduler);
                if !scheduler.state().is_playing() {
                    break;
                }
                if catch_unwind(AssertUnwindSafe(|| scheduler.metronome_tick())).is_err() {
                    log::error!("metronome tick panicked");
                }
            }
        }))
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        lock(&self.timers).abort();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("snapshot", &self.snapshot())
            .field("tick_interval", &self.tick_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{CompileOptions, compile};
    use crate::sync_groups::SyncGroupRegistry;
    use drumseq_engine::{AudioTrigger, RecordingTrigger};
    use drumseq_transport::default_instruments;
    use tokio::time::sleep;

    fn timeline(bars: usize) -> Arc<CombinedTimeline> {
        let instruments = default_instruments();
        let registry = SyncGroupRegistry::new(&instruments);
        Arc::new(compile(&registry, &instruments, &CompileOptions::new(bars)).unwrap())
    }

    fn transport() -> (Transport, Arc<RecordingTrigger>, Engine) {
        let trigger = Arc::new(RecordingTrigger::new());
        let engine = Engine::new(Arc::new(TokioClock::new()), trigger.clone());
        (Transport::new("drums", engine.clone()), trigger, engine)
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_is_single_flight() {
        let guard = InitGuard::new();
        let first = guard.acquire(Duration::from_secs(5)).await;
        assert!(!first.forced());
        assert!(guard.is_held());

        let waiter = async {
            let permit = guard.acquire(Duration::from_secs(5)).await;
            permit.forced()
        };
        let release = async {
            sleep(Duration::from_millis(100)).await;
            drop(first);
        };
        let (forced, ()) = tokio::join!(waiter, release);

        assert!(!forced, "released holder should hand over cleanly");
        assert!(!guard.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_forces_stale_holder() {
        let guard = InitGuard::new();
        let stale = guard.acquire(Duration::from_secs(5)).await;

        let fresh = guard.acquire(Duration::from_secs(5)).await;
        assert!(fresh.forced());

        // the evicted holder must not release the new one
        drop(stale);
        assert!(guard.is_held());
        drop(fresh);
        assert!(!guard.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_one_bar() {
        let (transport, trigger, engine) = transport();
        engine.init().unwrap();

        transport.start(Some(timeline(1)), None).await.unwrap();
        assert_eq!(transport.state(), PlaybackState::Playing);

        sleep(Duration::from_millis(1950)).await;
        assert_eq!(trigger.notes().len(), 12);
        assert_eq!(transport.snapshot().last_step_index, Some(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_wraps_in_real_time() {
        let (transport, trigger, engine) = transport();
        engine.init().unwrap();

        transport.start(Some(timeline(1)), None).await.unwrap();
        sleep(Duration::from_millis(2450)).await;

        // full bar, then steps 0..=3 of the next loop: kick+hat, hat
        assert_eq!(trigger.notes().len(), 15);
        assert!(transport.position() < 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_timeline_fails() {
        let (transport, _trigger, _engine) = transport();
        assert_eq!(
            transport.start(None, None).await,
            Err(TransportError::NoTimeline)
        );
        assert!(!transport.guard.is_held(), "failed start releases the guard");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disposed_engine_refuses_start() {
        let (transport, _trigger, engine) = transport();
        engine.dispose();
        assert_eq!(
            transport.start(Some(timeline(1)), None).await,
            Err(TransportError::Disposed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timers() {
        let (transport, trigger, engine) = transport();
        engine.init().unwrap();
        transport.start(Some(timeline(1)), None).await.unwrap();
        sleep(Duration::from_millis(500)).await;

        assert!(transport.stop());
        assert!(!transport.stop());
        let fired = trigger.notes().len();

        sleep(Duration::from_secs(2)).await;
        assert_eq!(trigger.notes().len(), fired);
        assert_eq!(transport.position(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_does_not_double_schedule() {
        let (transport, trigger, engine) = transport();
        engine.init().unwrap();
        transport.start(Some(timeline(1)), None).await.unwrap();
        transport.start(None, Some(0.0)).await.unwrap();
        transport.start(None, Some(0.0)).await.unwrap();

        sleep(Duration::from_millis(1950)).await;
        assert_eq!(trigger.notes().len(), 12, "only the last start keeps a tick task");
    }

    #[tokio::test(start_paused = true)]
    async fn test_metronome_clicks_each_beat() {
        let (transport, trigger, engine) = transport();
        engine.init().unwrap();
        transport.set_metronome_enabled(true);

        transport.start(Some(timeline(1)), None).await.unwrap();
        sleep(Duration::from_millis(2100)).await;

        assert_eq!(trigger.clicks(), vec![true, false, false, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_bring_up_plays_silently() {
        struct NoDevice;
        impl AudioTrigger for NoDevice {
            fn prepare(&self) -> anyhow::Result<()> {
                anyhow::bail!("no output device")
            }
            fn play_note(&self, _: u8, _: f32, _: &str) -> anyhow::Result<()> {
                Ok(())
            }
            fn play_metronome(&self, _: bool) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let engine = Engine::new(Arc::new(TokioClock::new()), Arc::new(NoDevice));
        let transport = Transport::new("drums", engine.clone());

        transport.start(Some(timeline(1)), None).await.unwrap();
        assert_eq!(transport.state(), PlaybackState::Playing);
        assert_eq!(engine.state(), EngineState::Created);
    }

    #[tokio::test]
    async fn test_hung_bring_up_is_not_repeated() {
        struct Hung {
            release: Mutex<std::sync::mpsc::Receiver<()>>,
            prepared: std::sync::atomic::AtomicU64,
        }
        impl AudioTrigger for Hung {
            fn prepare(&self) -> anyhow::Result<()> {
                self.prepared
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let _ = self.release.lock().unwrap().recv();
                Ok(())
            }
            fn play_note(&self, _: u8, _: f32, _: &str) -> anyhow::Result<()> {
                Ok(())
            }
            fn play_metronome(&self, _: bool) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let (release, release_rx) = std::sync::mpsc::sync_channel(1);
        let trigger = Arc::new(Hung {
            release: Mutex::new(release_rx),
            prepared: std::sync::atomic::AtomicU64::new(0),
        });
        let engine = Engine::new(Arc::new(TokioClock::new()), trigger.clone());
        let transport = Transport::new("drums", engine.clone())
            .with_timing(DEFAULT_TICK_INTERVAL, Duration::from_millis(50));

        transport.start(Some(timeline(1)), None).await.unwrap();
        assert_eq!(transport.state(), PlaybackState::Playing);
        assert_eq!(engine.state(), EngineState::Initializing);

        let restarted = std::time::Instant::now();
        transport.start(None, Some(0.0)).await.unwrap();
        assert!(restarted.elapsed() < Duration::from_secs(2));
        assert_eq!(transport.state(), PlaybackState::Playing);
        assert_eq!(
            trigger.prepared.load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        transport.stop();
        release.send(()).unwrap();
        for _ in 0..200 {
            if engine.is_ready() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(engine.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_loop_stops_at_end() {
        let (transport, _trigger, engine) = transport();
        engine.init().unwrap();
        transport.set_loop_enabled(false);

        transport.start(Some(timeline(1)), None).await.unwrap();
        sleep(Duration::from_millis(2100)).await;

        assert_eq!(transport.state(), PlaybackState::Stopped);
    }
}
