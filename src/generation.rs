use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Classification of a generation request as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    /// An ordinary user-initiated turn.
    Normal,
    Swipe,
    Regenerate,
    Continue,
    /// Background generation with no chat-visible output.
    Quiet,
    /// A generation issued by a prewarm session.
    Prewarm,
}

impl GenerationKind {
    /// Kinds whose completion never schedules a prewarm.
    ///
    /// These do not end a normal turn whose context is stable and about to
    /// be followed by a new user turn.
    pub fn suppresses_prewarm(self) -> bool {
        matches!(
            self,
            Self::Swipe | Self::Regenerate | Self::Continue | Self::Quiet | Self::Prewarm
        )
    }

    /// Whether a generation of this kind counts as real user activity.
    pub fn is_user_activity(self) -> bool {
        !self.suppresses_prewarm()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Swipe => "swipe",
            Self::Regenerate => "regenerate",
            Self::Continue => "continue",
            Self::Quiet => "quiet",
            Self::Prewarm => "prewarm",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown generation kind '{0}'")]
pub struct KindParseError(pub String);

impl FromStr for GenerationKind {
    type Err = KindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "swipe" => Ok(Self::Swipe),
            "regenerate" => Ok(Self::Regenerate),
            "continue" => Ok(Self::Continue),
            "quiet" => Ok(Self::Quiet),
            "prewarm" => Ok(Self::Prewarm),
            _ => Err(KindParseError(s.to_string())),
        }
    }
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request handed to the host's generation pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub kind: GenerationKind,
    /// Produce no chat-visible entry.
    pub quiet: bool,
    /// Explicit prompt appended by the host. Empty means "use the transcript as is".
    pub prompt: String,
    /// Skip world-info and other injection preprocessing.
    pub skip_injections: bool,
}

impl GenerationRequest {
    pub fn new(kind: GenerationKind) -> Self {
        Self {
            kind,
            quiet: false,
            prompt: String::new(),
            skip_injections: false,
        }
    }

    /// The request a prewarm session issues: quiet, no explicit prompt,
    /// no injections, so only the raw context-encoding path runs.
    pub fn prewarm() -> Self {
        Self {
            kind: GenerationKind::Prewarm,
            quiet: true,
            prompt: String::new(),
            skip_injections: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// The generation was stopped through [`GenerationApi::cancel`].
    #[error("generation cancelled")]
    Cancelled,
    #[error("backend error: {0}")]
    Backend(String),
    #[error("generation pipeline unavailable")]
    Unavailable,
}

impl GenerationError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// The host's generation pipeline.
///
/// Lifecycle notifications (started, request dispatched, ended) are
/// published on the host's [`EventBus`](crate::event::EventBus), not
/// returned from here.
#[async_trait]
pub trait GenerationApi: Send + Sync {
    /// Run a generation to completion.
    async fn generate(&self, request: GenerationRequest) -> Result<(), GenerationError>;

    /// Stop the in-flight generation. Safe to call with nothing in flight.
    fn cancel(&self);

    /// Whether any generation is currently running.
    fn is_generating(&self) -> bool;
}
