use drumseq_project::ProjectError;

use crate::compile::CompileError;
use crate::history::HistoryError;
use crate::validate::Violations;

#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    #[error("validation failed: {0}")]
    Validation(#[from] Violations),

    #[error("drum track not found: {0}")]
    TrackNotFound(String),

    #[error("drum track already exists: {0}")]
    TrackExists(String),

    #[error("pattern not found: {0}")]
    PatternNotFound(String),

    #[error("preset pattern not found: {0}")]
    PresetNotFound(String),

    #[error("cell ({row}, {col}) is outside the grid")]
    CellOutOfRange { row: usize, col: usize },

    #[error("history entry {0} does not exist")]
    HistoryIndex(usize),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("drum track {0} is not stopped")]
    TrackPlaying(String),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Project(#[from] ProjectError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no timeline loaded")]
    NoTimeline,

    #[error("timeline has no steps")]
    EmptyTimeline,

    #[error("audio engine has been disposed")]
    Disposed,
}
