use std::collections::HashMap;
use std::sync::Arc;

use drumseq_engine::Engine;

use crate::compile::CombinedTimeline;
use crate::error::{SequencerError, TransportError};
use crate::manager::DrumTrackManager;
use crate::runtime::Transport;
use crate::scheduler::{PlaybackSnapshot, PlaybackState};
use crate::settings::Settings;

struct Playback {
    transport: Arc<Transport>,
    bars: Option<usize>,
    loaded: Option<Arc<CombinedTimeline>>,
}

/// A manager wired to one audio engine, with a transport per playing
/// track. Edits made through [`Session::edit`] reach tracks that are
/// playing.
pub struct Session {
    manager: DrumTrackManager,
    engine: Engine,
    playbacks: HashMap<String, Playback>,
    settings: Settings,
}

impl Session {
    pub fn new(engine: Engine, settings: Settings) -> Self {
        Self {
            manager: DrumTrackManager::new(settings.clone()),
            engine,
            playbacks: HashMap::new(),
            settings,
        }
    }

    pub fn manager(&self) -> &DrumTrackManager {
        &self.manager
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Run `edit` on the manager, then push fresh timelines to every
    /// playing transport whose track changed.
    ///
    /// An `Err` always means the edit itself was rejected. A playing track
    /// that fails to recompile keeps its current timeline and is logged.
    pub fn edit<R>(
        &mut self,
        edit: impl FnOnce(&mut DrumTrackManager) -> Result<R, SequencerError>,
    ) -> Result<R, SequencerError> {
        let result = edit(&mut self.manager)?;
        self.refresh_playing();
        Ok(result)
    }

    /// Compile `track_id` and start it from `seek` (or the paused position).
    pub async fn start_playback(
        &mut self,
        track_id: &str,
        bars: Option<usize>,
        seek: Option<f64>,
    ) -> Result<(), SequencerError> {
        let data = self.manager.get_playback_data(track_id, bars)?;

        let playback = self
            .playbacks
            .entry(track_id.to_string())
            .or_insert_with(|| {
                let transport = Transport::new(track_id, self.engine.clone())
                    .with_timing(self.settings.tick_interval(), self.settings.init_timeout());
                transport.set_loop_enabled(self.settings.loop_enabled);
                transport.set_metronome_enabled(self.settings.metronome_enabled);
                Playback {
                    transport: Arc::new(transport),
                    bars,
                    loaded: None,
                }
            });

        playback.bars = bars;
        playback.loaded = Some(Arc::clone(&data.timeline));
        let transport = Arc::clone(&playback.transport);

        transport.start(Some(Arc::clone(&data.timeline)), seek).await?;
        log::info!(
            "playing {track_id}: {} bars at {} bpm",
            data.total_bars(),
            data.tempo()
        );
        Ok(())
    }

    pub fn pause_playback(&self, track_id: &str) -> Result<bool, SequencerError> {
        self.manager.track(track_id)?;
        Ok(self
            .playbacks
            .get(track_id)
            .is_some_and(|p| p.transport.pause()))
    }

    pub fn stop_playback(&self, track_id: &str) -> Result<bool, SequencerError> {
        self.manager.track(track_id)?;
        Ok(self
            .playbacks
            .get(track_id)
            .is_some_and(|p| p.transport.stop()))
    }

    pub fn stop_all(&self) {
        for playback in self.playbacks.values() {
            playback.transport.stop();
        }
    }

    pub fn set_current_time(&self, track_id: &str, seconds: f64) -> Result<(), SequencerError> {
        self.transport_for(track_id)?.set_current_time(seconds);
        Ok(())
    }

    pub fn set_loop_enabled(&self, track_id: &str, enabled: bool) -> Result<(), SequencerError> {
        self.transport_for(track_id)?.set_loop_enabled(enabled);
        Ok(())
    }

    pub fn set_metronome_enabled(&self, track_id: &str, enabled: bool) -> Result<(), SequencerError> {
        self.transport_for(track_id)?.set_metronome_enabled(enabled);
        Ok(())
    }

    /// `Stopped` for tracks that never played.
    pub fn playback_state(&self, track_id: &str) -> PlaybackState {
        self.playbacks
            .get(track_id)
            .map_or(PlaybackState::Stopped, |p| p.transport.state())
    }

    pub fn playback_snapshot(&self, track_id: &str) -> Option<PlaybackSnapshot> {
        self.playbacks.get(track_id).map(|p| p.transport.snapshot())
    }

    pub fn transport(&self, track_id: &str) -> Option<Arc<Transport>> {
        self.playbacks.get(track_id).map(|p| Arc::clone(&p.transport))
    }

    /// Only a stopped track can be deleted.
    pub fn delete_track(&mut self, track_id: &str) -> Result<(), SequencerError> {
        if self.playback_state(track_id) != PlaybackState::Stopped {
            return Err(SequencerError::TrackPlaying(track_id.to_string()));
        }
        self.manager.delete_track(track_id)?;
        self.playbacks.remove(track_id);
        Ok(())
    }

    /// Stop everything and release the audio engine. Later starts fail.
    pub fn dispose(&mut self) {
        self.stop_all();
        self.playbacks.clear();
        self.engine.dispose();
    }

    fn transport_for(&self, track_id: &str) -> Result<&Transport, SequencerError> {
        self.manager.track(track_id)?;
        let playback = self
            .playbacks
            .get(track_id)
            .ok_or(SequencerError::Transport(TransportError::NoTimeline))?;
        Ok(&playback.transport)
    }

    fn refresh_playing(&mut self) {
        let mut gone = Vec::new();

        for (track_id, playback) in &mut self.playbacks {
            if self.manager.track(track_id).is_err() {
                playback.transport.stop();
                gone.push(track_id.clone());
                continue;
            }
            if playback.transport.state() != PlaybackState::Playing {
                continue;
            }

            let data = match self.manager.get_playback_data(track_id, playback.bars) {
                Ok(data) => data,
                Err(err) => {
                    log::warn!("{track_id}: recompile failed, keeping the playing timeline: {err}");
                    continue;
                }
            };
            let unchanged = playback
                .loaded
                .as_ref()
                .is_some_and(|loaded| Arc::ptr_eq(loaded, &data.timeline));
            if !unchanged {
                log::debug!("reloading timeline for {track_id}");
                playback.transport.load(Arc::clone(&data.timeline));
                playback.loaded = Some(Arc::clone(&data.timeline));
            }
        }

        for track_id in gone {
            self.playbacks.remove(&track_id);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tracks", &self.manager.stats().total_tracks)
            .field("transports", &self.playbacks.len())
            .finish()
    }
}
