mod clock;
mod trigger;

use std::sync::{Arc, Mutex};

pub use clock::{Clock, ManualClock, SystemClock};
pub use trigger::{AudioTrigger, NullTrigger, RecordingTrigger, RingTrigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    /// `prepare` is running on some thread.
    Initializing,
    Ready,
    Disposed,
}

struct EngineInner {
    clock: Arc<dyn Clock>,
    trigger: Arc<dyn AudioTrigger>,
    state: Mutex<EngineState>,
}

/// Audio context shared by every transport: one clock, one trigger sink.
///
/// Cloning is cheap; clones refer to the same context.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(clock: Arc<dyn Clock>, trigger: Arc<dyn AudioTrigger>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                clock,
                trigger,
                state: Mutex::new(EngineState::Created),
            }),
        }
    }

    /// Engine on the system clock that discards all sound.
    pub fn silent() -> Self {
        Self::new(Arc::new(SystemClock::new()), Arc::new(NullTrigger))
    }

    /// Bring up the audio backend. Runs `prepare` even if already ready.
    ///
    /// The state lock is not held while `prepare` runs, so a slow backend
    /// never blocks [`Engine::state`] or [`Engine::dispose`]. A second
    /// caller arriving mid bring-up is refused instead of preparing twice.
    pub fn init(&self) -> anyhow::Result<()> {
        {
            let mut state = self.lock_state()?;
            match *state {
                EngineState::Disposed => anyhow::bail!("audio engine has been disposed"),
                EngineState::Initializing => {
                    anyhow::bail!("audio engine bring-up already in progress")
                }
                EngineState::Created | EngineState::Ready => {}
            }
            *state = EngineState::Initializing;
        }

        let prepared = self.inner.trigger.prepare();

        let mut state = self.lock_state()?;
        if *state == EngineState::Disposed {
            anyhow::bail!("audio engine disposed during bring-up");
        }
        match prepared {
            Ok(()) => {
                *state = EngineState::Ready;
                log::info!("audio engine ready");
                Ok(())
            }
            Err(err) => {
                *state = EngineState::Created;
                Err(err)
            }
        }
    }

    /// Bring up the audio backend unless it is already up. May block while
    /// the backend starts; fails fast while another bring-up is running.
    pub fn ensure_ready(&self) -> anyhow::Result<()> {
        match self.state() {
            EngineState::Ready => Ok(()),
            EngineState::Initializing => {
                anyhow::bail!("audio engine bring-up already in progress")
            }
            EngineState::Created | EngineState::Disposed => self.init(),
        }
    }

    pub fn dispose(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            if *state != EngineState::Disposed {
                log::info!("audio engine disposed");
            }
            *state = EngineState::Disposed;
        }
    }

    pub fn state(&self) -> EngineState {
        self.inner
            .state
            .lock()
            .map(|state| *state)
            .unwrap_or(EngineState::Disposed)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == EngineState::Ready
    }

    #[inline]
    pub fn now(&self) -> f64 {
        self.inner.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn trigger(&self) -> &Arc<dyn AudioTrigger> {
        &self.inner.trigger
    }

    fn lock_state(&self) -> anyhow::Result<std::sync::MutexGuard<'_, EngineState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("engine state lock poisoned"))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("now", &self.now())
            .finish()
    }
}
