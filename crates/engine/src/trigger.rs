use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use drumseq_transport::TriggerCommand;

/// Host-side sound output. Calls must not block the caller for long; slow
/// bring-up work belongs in [`AudioTrigger::prepare`].
pub trait AudioTrigger: Send + Sync {
    /// One-time bring-up of the audio backend.
    fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn play_note(&self, pitch: u8, velocity: f32, track_id: &str) -> anyhow::Result<()>;

    fn play_metronome(&self, accent: bool) -> anyhow::Result<()>;
}

/// Pushes triggers into a lock-free ring for a consumer thread to drain.
/// A full ring drops the trigger and reports an error.
pub struct RingTrigger {
    producer: Mutex<rtrb::Producer<TriggerCommand>>,
    dropped: AtomicU64,
}

impl RingTrigger {
    pub fn new(capacity: usize) -> (Self, rtrb::Consumer<TriggerCommand>) {
        let (producer, consumer) = rtrb::RingBuffer::<TriggerCommand>::new(capacity);
        (
            Self {
                producer: Mutex::new(producer),
                dropped: AtomicU64::new(0),
            },
            consumer,
        )
    }

    /// Triggers lost to a full ring.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn push(&self, command: TriggerCommand) -> anyhow::Result<()> {
        let mut producer = self
            .producer
            .lock()
            .map_err(|_| anyhow::anyhow!("trigger ring lock poisoned"))?;

        producer.push(command).map_err(|err| {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            anyhow::anyhow!("trigger dropped: {err}")
        })
    }
}

impl AudioTrigger for RingTrigger {
    fn play_note(&self, pitch: u8, velocity: f32, track_id: &str) -> anyhow::Result<()> {
        self.push(TriggerCommand::NoteOn {
            pitch,
            velocity,
            track_id: track_id.to_string(),
        })
    }

    fn play_metronome(&self, accent: bool) -> anyhow::Result<()> {
        self.push(TriggerCommand::Metronome { accent })
    }
}

/// Discards every trigger.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTrigger;

impl AudioTrigger for NullTrigger {
    fn play_note(&self, _pitch: u8, _velocity: f32, _track_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn play_metronome(&self, _accent: bool) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Keeps every trigger in memory, in order.
#[derive(Debug, Default)]
pub struct RecordingTrigger {
    events: Mutex<Vec<TriggerCommand>>,
    prepared: AtomicU64,
}

impl RecordingTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TriggerCommand> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn notes(&self) -> Vec<TriggerCommand> {
        self.events()
            .into_iter()
            .filter(|event| matches!(event, TriggerCommand::NoteOn { .. }))
            .collect()
    }

    pub fn clicks(&self) -> Vec<bool> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TriggerCommand::Metronome { accent } => Some(accent),
                _ => None,
            })
            .collect()
    }

    /// Times `prepare` has run.
    pub fn prepare_count(&self) -> u64 {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    fn record(&self, command: TriggerCommand) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("recording lock poisoned"))?
            .push(command);
        Ok(())
    }
}

impl AudioTrigger for RecordingTrigger {
    fn prepare(&self) -> anyhow::Result<()> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn play_note(&self, pitch: u8, velocity: f32, track_id: &str) -> anyhow::Result<()> {
        self.record(TriggerCommand::NoteOn {
            pitch,
            velocity,
            track_id: track_id.to_string(),
        })
    }

    fn play_metronome(&self, accent: bool) -> anyhow::Result<()> {
        self.record(TriggerCommand::Metronome { accent })
    }
}
