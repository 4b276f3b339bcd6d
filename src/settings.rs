//! Options that gate how updates and checkpoints are applied.

use serde::{Deserialize, Serialize};

/// Settings for applying knowledge updates.
///
/// The defaults match the common case: respect quality gates, mark global
/// changes for dissemination, advance the clock by one per local write and
/// wake waiters on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSettings {
    /// Overwrite regardless of quality and clock gates.
    pub always_overwrite: bool,
    /// Treat global keys as local: values update but nothing is marked for
    /// dissemination. Receive paths use this to avoid re-broadcast loops.
    pub treat_globals_as_locals: bool,
    /// How far a local write advances the global clock.
    pub clock_increment: u64,
    /// Wake [`wait_for_change`](crate::KnowledgeStore::wait_for_change)
    /// callers after an accepted update.
    pub signal: bool,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        UpdateSettings {
            always_overwrite: false,
            treat_globals_as_locals: false,
            clock_increment: 1,
            signal: true,
        }
    }
}

impl UpdateSettings {
    /// Settings for a receive path: accepted values are visible locally but
    /// are not queued for re-dissemination.
    pub fn treat_as_local() -> Self {
        UpdateSettings {
            treat_globals_as_locals: true,
            ..Default::default()
        }
    }

    /// Settings that bypass the quality and clock gates entirely.
    pub fn force() -> Self {
        UpdateSettings {
            always_overwrite: true,
            ..Default::default()
        }
    }
}

/// Settings for checkpoint save/load passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSettings {
    /// Identifier written into the file header and segment headers,
    /// conventionally `host:port`.
    pub originator: String,
    /// Domain name stamped on segment headers.
    pub domain: String,
    /// Size of the reusable streaming buffer. It grows only when a single
    /// record's encoding exceeds it.
    pub buffer_size: usize,
    /// Settings used when replaying a loaded checkpoint into the store.
    pub update: UpdateSettings,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        CheckpointSettings {
            originator: String::new(),
            domain: String::new(),
            buffer_size: 1024 * 1024,
            update: UpdateSettings::default(),
        }
    }
}

impl CheckpointSettings {
    /// Settings stamped with an originator identifier.
    pub fn with_originator(originator: impl Into<String>) -> Self {
        CheckpointSettings {
            originator: originator.into(),
            ..Default::default()
        }
    }
}
