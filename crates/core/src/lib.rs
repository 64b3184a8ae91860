pub mod compile;
pub mod error;
pub mod events;
pub mod history;
pub mod manager;
pub mod presets;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod sync_groups;
pub mod time;
pub mod validate;

pub use compile::{CombinedTimeline, CompileError, CompileOptions, TempoPolicy, compile, compile_range};
pub use error::{SequencerError, TransportError};
pub use events::{EventBus, EventKind, SubscriptionId, TrackChange, TrackEvent};
pub use history::{HistoryStack, HistoryStats, TrackSnapshot};
pub use manager::{CombinedStats, DrumTrack, DrumTrackManager, ManagerStats, Pattern, PlaybackData};
pub use runtime::{TokioClock, Transport};
pub use scheduler::{PlaybackScheduler, PlaybackSnapshot, PlaybackState, TickOutcome};
pub use session::Session;
pub use settings::Settings;
pub use sync_groups::{SyncGroup, SyncGroupRegistry};
pub use time::{MusicalPosition, TimeContext, TimeSignature};
pub use validate::{Violation, Violations};

pub use drumseq_engine::{AudioTrigger, Engine, NullTrigger, RingTrigger};
pub use drumseq_project::{ExportData, FileStore, MemoryStore, ProjectError, SnapshotStore, load_export, save_export, save_export_binary};
pub use drumseq_transport::{DrumNote, Grid, Instrument, SyncGroupId, TriggerCommand, default_instruments};
