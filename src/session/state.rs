use std::fmt;
use std::time::Duration;

use crate::config::{PrewarmMode, PrewarmSettings};

/// Per-attempt state, owned by the task running one prewarm session.
#[derive(Debug)]
pub struct SessionState {
    pub mode: PrewarmMode,
    pub delay: Duration,
    pub transient_text: String,
    /// A transient message was appended and has not been removed yet.
    /// Cleanup only touches the transcript while this is set.
    pub transcript_dirty: bool,
}

impl SessionState {
    pub fn from_settings(settings: &PrewarmSettings) -> Self {
        Self {
            mode: settings.mode,
            delay: settings.delay(),
            transient_text: settings.transient_text.clone(),
            transcript_dirty: false,
        }
    }
}

/// Why a scheduled session did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    /// Another session holds the slot.
    Busy,
}

/// How one prewarm attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Skipped(SkipReason),
    /// Cancelled after the delay elapsed. The intended end state.
    Warmed,
    /// The generation finished before the cancel timer fired.
    Completed,
    /// The host never signalled dispatch; the generation was cancelled at
    /// the safety ceiling.
    DispatchTimedOut,
    /// The generation failed for a reason other than cancellation.
    Failed(String),
}

impl SessionOutcome {
    pub fn ran(&self) -> bool {
        !matches!(self, Self::Skipped(_))
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped(SkipReason::Disabled) => f.write_str("skipped (disabled)"),
            Self::Skipped(SkipReason::Busy) => f.write_str("skipped (busy)"),
            Self::Warmed => f.write_str("warmed"),
            Self::Completed => f.write_str("completed"),
            Self::DispatchTimedOut => f.write_str("dispatch timed out"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Emitted once per scheduled session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub trigger: TriggerSource,
    pub outcome: SessionOutcome,
}

/// What caused a session to be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// A normal generation ended.
    TurnEnded,
    /// The companion integration asked for a warm-up.
    Companion,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TurnEnded => f.write_str("turn ended"),
            Self::Companion => f.write_str("companion"),
        }
    }
}
