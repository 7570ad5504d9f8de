//! One prewarm attempt, end to end.
//!
//! A session injects the transient turn (in `user_message` mode), issues a
//! quiet generation, cancels it `delay` after the host reports the request
//! as dispatched, and then restores the transcript. Every exit path goes
//! through the same restore step, and no error escapes to the caller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{PrewarmMode, SettingsStore};
use crate::event::HostEvent;
use crate::generation::{GenerationError, GenerationKind, GenerationRequest};
use crate::host::Host;
use crate::transcript::{ChatMessage, remove_transient};

use super::context::{PrewarmContext, SessionPermit};
use super::state::{SessionOutcome, SessionReport, SessionState, SkipReason, TriggerSource};

/// Pause before injecting, so the host's own post-generation updates land first.
pub const INJECT_SETTLE: Duration = Duration::from_millis(100);
/// Pause before removing the transient turn, letting an in-flight autosave finish.
pub const AUTOSAVE_SETTLE: Duration = Duration::from_millis(200);
/// Pause before releasing the session slot.
pub const EXIT_SETTLE: Duration = Duration::from_millis(200);
/// The dispatch wait gives up after this many multiples of the delay.
pub const DISPATCH_CEILING_FACTOR: u32 = 5;

/// Why the cancel timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelCause {
    DelayElapsed,
    NoDispatch,
}

/// Schedules and runs prewarm sessions against a host.
#[derive(Clone)]
pub struct Prewarmer {
    host: Host,
    settings: SettingsStore,
    context: PrewarmContext,
    reports: Option<mpsc::UnboundedSender<SessionReport>>,
}

impl Prewarmer {
    pub fn new(host: Host, settings: SettingsStore, context: PrewarmContext) -> Self {
        Self {
            host,
            settings,
            context,
            reports: None,
        }
    }

    /// Send a [`SessionReport`] for every session this prewarmer runs.
    #[must_use]
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<SessionReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn context(&self) -> &PrewarmContext {
        &self.context
    }

    /// Run a session on its own task, decoupled from the caller.
    pub fn schedule(&self, trigger: TriggerSource) -> JoinHandle<SessionOutcome> {
        let this = self.clone();
        tokio::spawn(async move { this.run(trigger).await })
    }

    /// Run one session to completion. Returns immediately when prewarm is
    /// disabled or another session is active.
    pub async fn run(&self, trigger: TriggerSource) -> SessionOutcome {
        let settings = self.settings.snapshot();
        if !settings.enabled {
            debug!(%trigger, "prewarm disabled, skipping");
            return self.report(trigger, SessionOutcome::Skipped(SkipReason::Disabled));
        }
        let Some(permit) = self.context.try_acquire() else {
            debug!(%trigger, "prewarm already in progress, dropping trigger");
            return self.report(trigger, SessionOutcome::Skipped(SkipReason::Busy));
        };

        let mut guard = SessionGuard {
            host: self.host.clone(),
            state: SessionState::from_settings(&settings),
            permit: Some(permit),
        };
        debug!(%trigger, mode = %guard.state.mode, delay_ms = settings.delay_ms, "prewarm started");

        let outcome = self.attempt(&mut guard.state).await;
        self.restore(&mut guard.state).await;
        log_outcome(&outcome);

        tokio::time::sleep(EXIT_SETTLE).await;
        let outcome = self.report(trigger, outcome);
        guard.release();
        outcome
    }

    fn report(&self, trigger: TriggerSource, outcome: SessionOutcome) -> SessionOutcome {
        if let Some(tx) = &self.reports {
            let _ = tx.send(SessionReport {
                trigger,
                outcome: outcome.clone(),
            });
        }
        outcome
    }

    async fn attempt(&self, state: &mut SessionState) -> SessionOutcome {
        if state.mode == PrewarmMode::UserMessage {
            tokio::time::sleep(INJECT_SETTLE).await;
            self.host
                .transcript
                .append(ChatMessage::transient(state.transient_text.clone()));
            state.transcript_dirty = true;
            debug!("transient message appended");
        }

        // Subscribe before generating so the dispatch signal cannot be missed.
        let events = self.host.bus.subscribe();
        let mut generation = self.host.generation.generate(GenerationRequest::prewarm());
        let mut cause = None;

        let result = tokio::select! {
            biased;
            result = &mut generation => result,
            fired = cancel_after_dispatch(events, state.delay) => {
                cause = Some(fired);
                self.host.generation.cancel();
                generation.await
            }
        };

        match (result, cause) {
            (Err(GenerationError::Cancelled), Some(CancelCause::NoDispatch)) => {
                SessionOutcome::DispatchTimedOut
            }
            (Err(GenerationError::Cancelled), _) => SessionOutcome::Warmed,
            (Err(e), _) => SessionOutcome::Failed(e.to_string()),
            (Ok(()), _) => SessionOutcome::Completed,
        }
    }

    /// Remove the transient turn, persist and refresh the view. Does nothing
    /// unless this session's transient turn is still in the transcript, so
    /// it is safe to call more than once.
    async fn restore(&self, state: &mut SessionState) {
        if !state.transcript_dirty {
            return;
        }
        tokio::time::sleep(AUTOSAVE_SETTLE).await;

        discard_transient(&self.host, state);
        if let Err(e) = self.host.transcript.save().await {
            warn!("failed to persist transcript after prewarm: {e:#}");
        }
        self.host.view.refresh_trailing_controls();
    }
}

fn discard_transient(host: &Host, state: &mut SessionState) {
    if remove_transient(host.transcript.as_ref()).is_none() {
        warn!("transient prewarm message was already gone from the transcript");
    }
    state.transcript_dirty = false;
}

/// Owns the session slot and the per-attempt state for the lifetime of a
/// session.
///
/// A session that unwinds or is aborted before `release` still gets its
/// transcript restored here, before the slot is freed.
struct SessionGuard {
    host: Host,
    state: SessionState,
    permit: Option<SessionPermit>,
}

impl SessionGuard {
    fn release(mut self) {
        if let Some(permit) = self.permit.take() {
            permit.release();
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        if self.state.transcript_dirty {
            warn!("prewarm session ended abnormally, restoring transcript");
            discard_transient(&self.host, &mut self.state);
            self.host.view.refresh_trailing_controls();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let transcript = Arc::clone(&self.host.transcript);
                runtime.spawn(async move {
                    if let Err(e) = transcript.save().await {
                        warn!("failed to persist transcript after prewarm: {e:#}");
                    }
                });
            }
        }
        drop(permit);
    }
}

fn log_outcome(outcome: &SessionOutcome) {
    match outcome {
        SessionOutcome::Warmed => debug!("prewarm generation cancelled as intended"),
        SessionOutcome::Completed => {
            info!("prewarm generation completed before the cancel delay");
        }
        SessionOutcome::DispatchTimedOut => {
            warn!("host never signalled request dispatch; prewarm generation cancelled");
        }
        SessionOutcome::Failed(reason) => warn!("prewarm generation failed: {reason}"),
        SessionOutcome::Skipped(_) => {}
    }
}

/// Two-stage wait: the dispatch-ready signal (bounded by a safety
/// ceiling), then the configured delay.
async fn cancel_after_dispatch(
    mut events: broadcast::Receiver<HostEvent>,
    delay: Duration,
) -> CancelCause {
    let ceiling = delay * DISPATCH_CEILING_FACTOR;
    match tokio::time::timeout(ceiling, wait_for_dispatch(&mut events)).await {
        Ok(true) => {
            debug!(delay_ms = delay.as_millis(), "request dispatched, arming cancel");
            tokio::time::sleep(delay).await;
            CancelCause::DelayElapsed
        }
        Ok(false) | Err(_) => CancelCause::NoDispatch,
    }
}

/// Wait for the dispatch of this session's own generation: the first
/// `RequestDispatched` after a `prewarm` start. Dispatches belonging to any
/// other generation are skipped. Returns `false` if the bus closed first.
///
/// The bus carries no request id, so this relies on the host running one
/// generation at a time.
async fn wait_for_dispatch(events: &mut broadcast::Receiver<HostEvent>) -> bool {
    let mut own_started = false;
    loop {
        match events.recv().await {
            Ok(HostEvent::GenerationStarted { kind })
                if matches!(kind.parse::<GenerationKind>(), Ok(GenerationKind::Prewarm)) =>
            {
                own_started = true;
            }
            Ok(HostEvent::RequestDispatched) if own_started => return true,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("dispatch listener lagged by {n} events");
            }
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::PrewarmSettings;
    use crate::event::EventBus;
    use crate::generation::GenerationApi;
    use crate::host::HeadlessView;
    use crate::simulated::{ScriptedOutcome, SimulatedBackend};
    use crate::transcript::{MemoryTranscript, Transcript};

    struct Fixture {
        prewarmer: Prewarmer,
        backend: Arc<SimulatedBackend>,
        transcript: Arc<MemoryTranscript>,
        view: Arc<HeadlessView>,
    }

    fn fixture(settings: PrewarmSettings) -> Fixture {
        let bus = EventBus::new();
        let transcript = Arc::new(MemoryTranscript::with_messages(vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ]));
        let backend = Arc::new(SimulatedBackend::new(
            bus.clone(),
            transcript.clone(),
            Duration::from_millis(50),
            Duration::from_secs(10),
        ));
        let view = Arc::new(HeadlessView::default());
        let host = Host {
            generation: backend.clone(),
            transcript: transcript.clone(),
            view: view.clone(),
            bus,
        };
        let prewarmer = Prewarmer::new(
            host,
            SettingsStore::in_memory(settings),
            PrewarmContext::new(),
        );
        Fixture {
            prewarmer,
            backend,
            transcript,
            view,
        }
    }

    fn enabled(mode: PrewarmMode) -> PrewarmSettings {
        PrewarmSettings {
            enabled: true,
            mode,
            delay_ms: 500,
            ..PrewarmSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_is_a_noop() {
        let f = fixture(PrewarmSettings::default());
        let outcome = f.prewarmer.run(TriggerSource::TurnEnded).await;
        assert_eq!(outcome, SessionOutcome::Skipped(SkipReason::Disabled));
        assert!(f.backend.calls().is_empty());
        assert!(!f.prewarmer.context().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_slot_drops_the_trigger() {
        let f = fixture(enabled(PrewarmMode::UserMessage));
        let _held = f.prewarmer.context().try_acquire().unwrap();
        let outcome = f.prewarmer.run(TriggerSource::TurnEnded).await;
        assert_eq!(outcome, SessionOutcome::Skipped(SkipReason::Busy));
        assert!(f.backend.calls().is_empty());
        assert_eq!(f.transcript.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn user_message_mode_injects_then_restores() {
        let f = fixture(enabled(PrewarmMode::UserMessage));
        let before = f.transcript.messages();

        let outcome = f.prewarmer.run(TriggerSource::TurnEnded).await;
        assert_eq!(outcome, SessionOutcome::Warmed);

        let calls = f.backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].request, GenerationRequest::prewarm());
        let seen = calls[0].transcript.last().unwrap();
        assert!(seen.is_transient());
        assert_eq!(seen.body, ".");

        assert_eq!(f.transcript.messages(), before);
        assert_eq!(f.transcript.save_count(), 1);
        assert_eq!(f.view.refresh_count(), 1);
        assert!(!f.prewarmer.context().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_fires_delay_after_dispatch() {
        let f = fixture(enabled(PrewarmMode::UserMessage));
        f.prewarmer.run(TriggerSource::TurnEnded).await;

        let call = &f.backend.calls()[0];
        let dispatched = call.dispatched_at.unwrap();
        let cancelled = call.cancelled_at.unwrap();
        assert_eq!(cancelled - dispatched, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn backend_failure_still_restores() {
        let f = fixture(enabled(PrewarmMode::UserMessage));
        f.backend.script(
            GenerationKind::Prewarm,
            ScriptedOutcome::Fail("context overflow".into()),
        );
        let before = f.transcript.messages();

        let outcome = f.prewarmer.run(TriggerSource::TurnEnded).await;
        assert_eq!(
            outcome,
            SessionOutcome::Failed("backend error: context overflow".into())
        );
        assert_eq!(f.transcript.messages(), before);
        assert_eq!(f.view.refresh_count(), 1);
        assert_eq!(f.backend.cancel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_mode_leaves_transcript_alone() {
        let f = fixture(enabled(PrewarmMode::Quiet));
        let outcome = f.prewarmer.run(TriggerSource::TurnEnded).await;
        assert_eq!(outcome, SessionOutcome::Warmed);

        let calls = f.backend.calls();
        assert_eq!(calls[0].transcript.len(), 2);
        assert!(calls[0].transcript.iter().all(|m| !m.is_transient()));
        assert_eq!(f.transcript.save_count(), 0);
        assert_eq!(f.view.refresh_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_dispatch_signal_hits_the_ceiling() {
        let f = fixture(enabled(PrewarmMode::UserMessage));
        f.backend.script(GenerationKind::Prewarm, ScriptedOutcome::NoDispatch);
        let before = f.transcript.messages();

        let started = tokio::time::Instant::now();
        let outcome = f.prewarmer.run(TriggerSource::TurnEnded).await;
        assert_eq!(outcome, SessionOutcome::DispatchTimedOut);

        let call = &f.backend.calls()[0];
        assert!(call.dispatched_at.is_none());
        let waited = call.cancelled_at.unwrap() - started;
        let ceiling = Duration::from_millis(500) * DISPATCH_CEILING_FACTOR;
        assert_eq!(waited, INJECT_SETTLE + ceiling);
        assert_eq!(f.transcript.messages(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_completion_never_cancels() {
        let f = fixture(enabled(PrewarmMode::UserMessage));
        f.backend.script(
            GenerationKind::Prewarm,
            ScriptedOutcome::RespondAfter(Duration::from_millis(20)),
        );

        let outcome = f.prewarmer.run(TriggerSource::TurnEnded).await;
        assert_eq!(outcome, SessionOutcome::Completed);
        // Outlive the would-be timer: no stray cancel may follow.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.backend.cancel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slot_held_until_exit_settle() {
        let f = fixture(enabled(PrewarmMode::Quiet));
        let handle = f.prewarmer.schedule(TriggerSource::TurnEnded);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.prewarmer.context().is_active());
        assert_eq!(handle.await.unwrap(), SessionOutcome::Warmed);
        assert!(!f.prewarmer.context().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn reports_are_sent_for_every_session() {
        let f = fixture(PrewarmSettings::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let prewarmer = f.prewarmer.clone().with_reports(tx);
        prewarmer.run(TriggerSource::Companion).await;
        assert_eq!(
            rx.recv().await.unwrap(),
            SessionReport {
                trigger: TriggerSource::Companion,
                outcome: SessionOutcome::Skipped(SkipReason::Disabled),
            }
        );
    }

    /// A host pipeline that crashes as soon as a generation is issued.
    struct CrashingApi;

    #[async_trait::async_trait]
    #[allow(clippy::panic)]
    impl GenerationApi for CrashingApi {
        async fn generate(&self, _request: GenerationRequest) -> Result<(), GenerationError> {
            panic!("generation pipeline crashed");
        }

        fn cancel(&self) {}

        fn is_generating(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_generation_still_restores() {
        let transcript = Arc::new(MemoryTranscript::with_messages(vec![ChatMessage::user("hi")]));
        let view = Arc::new(HeadlessView::default());
        let host = Host {
            generation: Arc::new(CrashingApi),
            transcript: transcript.clone(),
            view: view.clone(),
            bus: EventBus::new(),
        };
        let prewarmer = Prewarmer::new(
            host,
            SettingsStore::in_memory(enabled(PrewarmMode::UserMessage)),
            PrewarmContext::new(),
        );

        let joined = prewarmer.schedule(TriggerSource::TurnEnded).await;
        assert!(joined.unwrap_err().is_panic());
        assert_eq!(transcript.messages(), vec![ChatMessage::user("hi")]);
        assert_eq!(view.refresh_count(), 1);
        assert!(!prewarmer.context().is_active());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transcript.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_session_still_restores() {
        let f = fixture(enabled(PrewarmMode::UserMessage));
        let before = f.transcript.messages();

        let handle = f.prewarmer.schedule(TriggerSource::TurnEnded);
        // Past the inject and dispatch, inside the cancel delay.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(f.transcript.messages().last().unwrap().is_transient());

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(f.transcript.messages(), before);
        assert_eq!(f.view.refresh_count(), 1);
        assert!(!f.prewarmer.context().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn only_own_dispatch_arms_the_cancel() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        bus.publish(HostEvent::RequestDispatched);
        bus.publish(HostEvent::GenerationStarted {
            kind: "normal".into(),
        });
        bus.publish(HostEvent::RequestDispatched);
        let early =
            tokio::time::timeout(Duration::from_millis(10), wait_for_dispatch(&mut events)).await;
        assert!(early.is_err());

        bus.publish(HostEvent::GenerationStarted {
            kind: "prewarm".into(),
        });
        bus.publish(HostEvent::RequestDispatched);
        assert!(wait_for_dispatch(&mut events).await);
    }
}
