//! Decides which generation lifecycle notifications schedule a prewarm.
//!
//! The tracker ignores every notification while a prewarm session is
//! active: the session's own quiet generation publishes started/ended
//! events too, and classifying those as a user turn would make a session
//! re-trigger itself.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::PrewarmSettings;
use crate::event::HostEvent;
use crate::generation::GenerationKind;
use crate::session::{PrewarmContext, Prewarmer, TriggerSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    Schedule,
    Ignore,
}

/// Classification state carried between notifications.
#[derive(Debug)]
pub struct TriggerTracker {
    context: PrewarmContext,
    /// Kind of the generation in flight; read-then-cleared when it ends.
    last_kind: Option<GenerationKind>,
    /// A normal generation is in flight.
    user_active: bool,
}

impl TriggerTracker {
    pub fn new(context: PrewarmContext) -> Self {
        Self {
            context,
            last_kind: None,
            user_active: false,
        }
    }

    pub fn last_kind(&self) -> Option<GenerationKind> {
        self.last_kind
    }

    pub fn user_active(&self) -> bool {
        self.user_active
    }

    pub fn on_generation_started(&mut self, kind: GenerationKind) {
        if self.context.is_active() {
            debug!(%kind, "generation started during prewarm, not tracking");
            return;
        }
        self.last_kind = Some(kind);
        if kind.is_user_activity() {
            self.user_active = true;
        }
        debug!(%kind, "generation started");
    }

    pub fn on_generation_ended(&mut self, message_id: Option<u64>) -> TriggerDecision {
        if self.context.is_active() {
            debug!(?message_id, "generation ended during prewarm, ignoring");
            return TriggerDecision::Ignore;
        }
        self.user_active = false;
        match self.last_kind.take() {
            Some(kind) if kind.suppresses_prewarm() => {
                debug!(%kind, ?message_id, "generation ended, kind does not trigger prewarm");
                TriggerDecision::Ignore
            }
            kind => {
                debug!(?kind, ?message_id, "turn ended, scheduling prewarm");
                TriggerDecision::Schedule
            }
        }
    }

    /// A companion process finished its post-turn work. Only honoured when
    /// nothing else is happening: no session, no generation, no user turn.
    pub fn on_companion_completed(
        &self,
        settings: &PrewarmSettings,
        generating: bool,
    ) -> TriggerDecision {
        if !settings.enabled || !settings.companion_integration {
            return TriggerDecision::Ignore;
        }
        if self.context.is_active() {
            debug!("companion completed during prewarm, ignoring");
            return TriggerDecision::Ignore;
        }
        if generating || self.user_active {
            debug!("companion completed while a generation is running, ignoring");
            return TriggerDecision::Ignore;
        }
        TriggerDecision::Schedule
    }
}

/// Consume host notifications until the bus closes, scheduling sessions on
/// `prewarmer` as the tracker decides.
pub async fn run(
    mut tracker: TriggerTracker,
    mut events: broadcast::Receiver<HostEvent>,
    prewarmer: Prewarmer,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("trigger tracker missed {n} host notifications");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        match event {
            HostEvent::GenerationStarted { kind } => {
                let kind = kind.parse().unwrap_or_else(|e| {
                    debug!("{e}, tracking as a normal turn");
                    GenerationKind::Normal
                });
                tracker.on_generation_started(kind);
            }
            HostEvent::GenerationEnded { message_id } => {
                if tracker.on_generation_ended(message_id) == TriggerDecision::Schedule {
                    prewarmer.schedule(TriggerSource::TurnEnded);
                }
            }
            HostEvent::CompanionCompleted => {
                let settings = prewarmer.settings().snapshot();
                let generating = prewarmer.host().generation.is_generating();
                if tracker.on_companion_completed(&settings, generating)
                    == TriggerDecision::Schedule
                {
                    prewarmer.schedule(TriggerSource::Companion);
                }
            }
            HostEvent::RequestDispatched => {}
        }
    }
}
