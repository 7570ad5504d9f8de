//! An in-process generation backend.
//!
//! Behaves like a host pipeline: publishes the started, dispatched and
//! ended notifications on the bus, honours `cancel`, and appends replies for
//! chat-visible generations. Outcomes can be scripted per generation kind.
//! Every call is recorded for inspection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::event::{EventBus, HostEvent};
use crate::generation::{GenerationApi, GenerationError, GenerationKind, GenerationRequest};
use crate::transcript::{ChatMessage, Role, Transcript};

/// How a scripted generation behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Dispatch, then respond after the backend's response latency.
    Respond,
    /// Dispatch, then respond after the given time.
    RespondAfter(Duration),
    /// Dispatch, then fail immediately with a backend error.
    Fail(String),
    /// Never signal dispatch and never respond; only `cancel` ends it.
    NoDispatch,
}

/// One recorded `generate` call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub request: GenerationRequest,
    /// The transcript as the backend saw it when the call started.
    pub transcript: Vec<ChatMessage>,
    pub started_at: Instant,
    pub dispatched_at: Option<Instant>,
    pub cancelled_at: Option<Instant>,
    pub result: Option<Result<(), GenerationError>>,
}

pub struct SimulatedBackend {
    bus: EventBus,
    transcript: Arc<dyn Transcript>,
    dispatch_latency: Duration,
    response_latency: Duration,
    scripts: Mutex<HashMap<GenerationKind, VecDeque<ScriptedOutcome>>>,
    in_flight: Mutex<Option<oneshot::Sender<()>>>,
    generating: AtomicBool,
    cancels: AtomicUsize,
    calls: Mutex<Vec<CallRecord>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedBackend {
    pub fn new(
        bus: EventBus,
        transcript: Arc<dyn Transcript>,
        dispatch_latency: Duration,
        response_latency: Duration,
    ) -> Self {
        Self {
            bus,
            transcript,
            dispatch_latency,
            response_latency,
            scripts: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(None),
            generating: AtomicBool::new(false),
            cancels: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue an outcome for the next generation of `kind`. Unscripted
    /// generations use [`ScriptedOutcome::Respond`].
    pub fn script(&self, kind: GenerationKind, outcome: ScriptedOutcome) {
        lock(&self.scripts).entry(kind).or_default().push_back(outcome);
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        lock(&self.calls).clone()
    }

    /// Number of `cancel` calls that hit an in-flight generation.
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Play one chat turn of `kind` the way the host would: a normal turn
    /// first appends the user's message, then the generation runs.
    pub async fn user_turn(
        &self,
        kind: GenerationKind,
        text: &str,
    ) -> Result<(), GenerationError> {
        if kind == GenerationKind::Normal {
            self.transcript.append(ChatMessage::user(text));
        }
        self.generate(GenerationRequest::new(kind)).await
    }

    fn next_outcome(&self, kind: GenerationKind) -> ScriptedOutcome {
        lock(&self.scripts)
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedOutcome::Respond)
    }

    fn update_call(&self, idx: usize, f: impl FnOnce(&mut CallRecord)) {
        if let Some(call) = lock(&self.calls).get_mut(idx) {
            f(call);
        }
    }

    async fn drive(
        &self,
        idx: usize,
        outcome: ScriptedOutcome,
        cancelled: &mut oneshot::Receiver<()>,
    ) -> Result<(), GenerationError> {
        if outcome != ScriptedOutcome::NoDispatch {
            tokio::select! {
                () = tokio::time::sleep(self.dispatch_latency) => {}
                _ = &mut *cancelled => return Err(GenerationError::Cancelled),
            }
            self.update_call(idx, |c| c.dispatched_at = Some(Instant::now()));
            self.bus.publish(HostEvent::RequestDispatched);
        }

        let response = async move {
            match outcome {
                ScriptedOutcome::Respond => {
                    tokio::time::sleep(self.response_latency).await;
                    Ok(())
                }
                ScriptedOutcome::RespondAfter(latency) => {
                    tokio::time::sleep(latency).await;
                    Ok(())
                }
                ScriptedOutcome::Fail(reason) => Err(GenerationError::Backend(reason)),
                ScriptedOutcome::NoDispatch => std::future::pending().await,
            }
        };

        tokio::select! {
            result = response => result,
            _ = &mut *cancelled => Err(GenerationError::Cancelled),
        }
    }

    /// Append or replace the assistant reply for a chat-visible generation.
    fn apply_reply(&self, request: &GenerationRequest) {
        if request.quiet {
            return;
        }
        match request.kind {
            GenerationKind::Normal | GenerationKind::Continue => {
                self.transcript.append(ChatMessage::assistant("(reply)"));
            }
            GenerationKind::Swipe | GenerationKind::Regenerate => {
                self.transcript
                    .remove_last_where(&|m: &ChatMessage| m.role == Role::Assistant);
                self.transcript.append(ChatMessage::assistant("(alternate reply)"));
            }
            GenerationKind::Quiet | GenerationKind::Prewarm => {}
        }
    }
}

#[async_trait]
impl GenerationApi for SimulatedBackend {
    async fn generate(&self, request: GenerationRequest) -> Result<(), GenerationError> {
        let (cancel_tx, mut cancelled) = oneshot::channel();
        {
            let mut slot = lock(&self.in_flight);
            if slot.is_some() {
                return Err(GenerationError::Unavailable);
            }
            *slot = Some(cancel_tx);
        }
        self.generating.store(true, Ordering::SeqCst);

        let outcome = self.next_outcome(request.kind);
        let idx = {
            let mut calls = lock(&self.calls);
            calls.push(CallRecord {
                request: request.clone(),
                transcript: self.transcript.messages(),
                started_at: Instant::now(),
                dispatched_at: None,
                cancelled_at: None,
                result: None,
            });
            calls.len() - 1
        };
        debug!(kind = %request.kind, ?outcome, "simulated generation started");
        self.bus.publish(HostEvent::GenerationStarted {
            kind: request.kind.to_string(),
        });

        let result = self.drive(idx, outcome, &mut cancelled).await;

        lock(&self.in_flight).take();
        self.generating.store(false, Ordering::SeqCst);
        if result.is_ok() {
            self.apply_reply(&request);
        }
        self.update_call(idx, |c| c.result = Some(result.clone()));

        let message_id = self
            .transcript
            .len()
            .checked_sub(1)
            .and_then(|i| u64::try_from(i).ok());
        self.bus.publish(HostEvent::GenerationEnded { message_id });
        result
    }

    fn cancel(&self) {
        let Some(tx) = lock(&self.in_flight).take() else {
            return;
        };
        self.cancels.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        if let Some(call) = lock(&self.calls).last_mut() {
            call.cancelled_at = Some(now);
        }
        let _ = tx.send(());
    }

    fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transcript::MemoryTranscript;

    fn backend() -> (SimulatedBackend, Arc<MemoryTranscript>, EventBus) {
        let bus = EventBus::new();
        let transcript = Arc::new(MemoryTranscript::new());
        let backend = SimulatedBackend::new(
            bus.clone(),
            transcript.clone(),
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        (backend, transcript, bus)
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_lifecycle_in_order() {
        let (backend, _transcript, bus) = backend();
        let mut rx = bus.subscribe();
        backend.user_turn(GenerationKind::Normal, "hi").await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            HostEvent::GenerationStarted {
                kind: "normal".into()
            }
        );
        assert_eq!(rx.recv().await.unwrap(), HostEvent::RequestDispatched);
        assert_eq!(
            rx.recv().await.unwrap(),
            HostEvent::GenerationEnded {
                message_id: Some(1)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn normal_turn_appends_user_and_reply() {
        let (backend, transcript, _bus) = backend();
        backend.user_turn(GenerationKind::Normal, "hi").await.unwrap();
        backend.user_turn(GenerationKind::Swipe, "").await.unwrap();
        let bodies: Vec<_> = transcript.messages().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec!["hi", "(alternate reply)"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_ends_generation() {
        let (backend, _transcript, _bus) = backend();
        let backend = Arc::new(backend);
        backend.script(GenerationKind::Quiet, ScriptedOutcome::NoDispatch);

        let task = {
            let backend = backend.clone();
            tokio::spawn(async move {
                backend
                    .generate(GenerationRequest::new(GenerationKind::Quiet))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(backend.is_generating());
        backend.cancel();
        assert_eq!(task.await.unwrap(), Err(GenerationError::Cancelled));
        assert!(!backend.is_generating());
        assert_eq!(backend.cancel_count(), 1);
    }

    #[test]
    fn cancel_with_nothing_in_flight_is_harmless() {
        let (backend, _transcript, _bus) = backend();
        backend.cancel();
        backend.cancel();
        assert_eq!(backend.cancel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_failure_is_reported() {
        let (backend, transcript, _bus) = backend();
        backend.script(GenerationKind::Normal, ScriptedOutcome::Fail("500".into()));
        let result = backend.user_turn(GenerationKind::Normal, "hi").await;
        assert_eq!(result, Err(GenerationError::Backend("500".into())));
        assert_eq!(transcript.len(), 1);
        assert_eq!(
            backend.calls()[0].result,
            Some(Err(GenerationError::Backend("500".into())))
        );
    }
}
