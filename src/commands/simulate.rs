use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::{PrewarmSettings, SettingsStore};
use crate::coordinator::Coordinator;
use crate::event::{EventBus, HostEvent};
use crate::generation::GenerationKind;
use crate::host::{HeadlessView, Host};
use crate::simulated::{ScriptedOutcome, SimulatedBackend};
use crate::transcript::{MemoryTranscript, Transcript};

pub struct SimulateConfig {
    pub turns: Vec<GenerationKind>,
    pub fail_prewarm: bool,
    pub no_dispatch: bool,
    pub dispatch_latency: Duration,
    pub response_latency: Duration,
    pub companion_after_turn: bool,
    pub transcript_path: Option<PathBuf>,
}

/// Play `config.turns` against a simulated backend with prewarm running,
/// writing one line per turn and per prewarm session.
///
/// Settings changes made here are never persisted.
pub async fn simulate<W: Write>(
    config: SimulateConfig,
    settings: PrewarmSettings,
    writer: &mut W,
) -> Result<()> {
    let transcript = Arc::new(match &config.transcript_path {
        Some(path) => MemoryTranscript::open(path)?,
        None => MemoryTranscript::new(),
    });
    let bus = EventBus::new();
    let backend = Arc::new(SimulatedBackend::new(
        bus.clone(),
        transcript.clone(),
        config.dispatch_latency,
        config.response_latency,
    ));
    let host = Host {
        generation: backend.clone(),
        transcript: transcript.clone(),
        view: Arc::new(HeadlessView::default()),
        bus: bus.clone(),
    };
    let mut coordinator = Coordinator::spawn(host, SettingsStore::in_memory(settings));

    let initial_len = transcript.len();
    for (i, kind) in config.turns.iter().copied().enumerate() {
        if config.fail_prewarm {
            backend.script(
                GenerationKind::Prewarm,
                ScriptedOutcome::Fail("simulated backend failure".into()),
            );
        } else if config.no_dispatch {
            backend.script(GenerationKind::Prewarm, ScriptedOutcome::NoDispatch);
        }

        let turn = i + 1;
        match backend.user_turn(kind, &format!("message {turn}")).await {
            Ok(()) => writeln!(writer, "turn {turn}: {kind}")?,
            Err(e) => writeln!(writer, "turn {turn}: {kind} ({e})")?,
        }
        if config.companion_after_turn {
            bus.publish(HostEvent::CompanionCompleted);
        }

        let reports = coordinator.settle().await;
        if reports.is_empty() {
            writeln!(writer, "  no prewarm")?;
        }
        for report in reports {
            writeln!(writer, "  prewarm [{}]: {}", report.trigger, report.outcome)?;
        }
    }

    if config.transcript_path.is_some() {
        transcript.save().await?;
    }
    writeln!(
        writer,
        "transcript: {} messages ({} before), {} transient",
        transcript.len(),
        initial_len,
        transcript.messages().iter().filter(|m| m.is_transient()).count()
    )?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(turns: Vec<GenerationKind>) -> SimulateConfig {
        SimulateConfig {
            turns,
            fail_prewarm: false,
            no_dispatch: false,
            dispatch_latency: Duration::from_millis(150),
            response_latency: Duration::from_secs(3),
            companion_after_turn: false,
            transcript_path: None,
        }
    }

    fn enabled() -> PrewarmSettings {
        PrewarmSettings {
            enabled: true,
            delay_ms: 500,
            ..PrewarmSettings::default()
        }
    }

    async fn run(config: SimulateConfig, settings: PrewarmSettings) -> String {
        let mut out = Vec::new();
        simulate(config, settings, &mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_turns() {
        let out = run(
            config(vec![
                GenerationKind::Normal,
                GenerationKind::Swipe,
                GenerationKind::Normal,
            ]),
            enabled(),
        )
        .await;
        insta::assert_snapshot!(out, @r"
        turn 1: normal
          prewarm [turn ended]: warmed
        turn 2: swipe
          no prewarm
        turn 3: normal
          prewarm [turn ended]: warmed
        transcript: 4 messages (0 before), 0 transient
        ");
    }

    #[tokio::test(start_paused = true)]
    async fn failing_prewarm_is_absorbed() {
        let mut cfg = config(vec![GenerationKind::Normal]);
        cfg.fail_prewarm = true;
        let out = run(cfg, enabled()).await;
        insta::assert_snapshot!(out, @r"
        turn 1: normal
          prewarm [turn ended]: failed: backend error: simulated backend failure
        transcript: 2 messages (0 before), 0 transient
        ");
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_reports_skips() {
        let out = run(config(vec![GenerationKind::Normal]), PrewarmSettings::default()).await;
        insta::assert_snapshot!(out, @r"
        turn 1: normal
          prewarm [turn ended]: skipped (disabled)
        transcript: 2 messages (0 before), 0 transient
        ");
    }
}
