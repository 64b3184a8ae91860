use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of one of the six sync groups a bar can follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SyncGroupId {
    A,
    B,
    C,
    D,
    E,
    F,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown sync group '{0}', expected one of A-F")]
pub struct UnknownSyncGroup(pub String);

impl SyncGroupId {
    pub const ALL: [SyncGroupId; 6] = [Self::A, Self::B, Self::C, Self::D, Self::E, Self::F];

    /// Group an unassigned bar follows.
    pub const DEFAULT: SyncGroupId = SyncGroupId::A;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::E => "E",
            Self::F => "F",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Self::A => "#EF4444",
            Self::B => "#3B82F6",
            Self::C => "#10B981",
            Self::D => "#F59E0B",
            Self::E => "#8B5CF6",
            Self::F => "#EC4899",
        }
    }

    pub fn display_name(&self) -> String {
        format!("Group {}", self.as_str())
    }
}

impl Default for SyncGroupId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::fmt::Display for SyncGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncGroupId {
    type Err = UnknownSyncGroup;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == s.trim())
            .ok_or_else(|| UnknownSyncGroup(s.to_string()))
    }
}
