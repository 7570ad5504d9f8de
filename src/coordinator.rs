use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::SettingsStore;
use crate::host::Host;
use crate::session::{PrewarmContext, Prewarmer, SessionReport};
use crate::tracker::{self, TriggerTracker};

/// How long `settle` waits for a just-ended generation to schedule a session.
const SCHEDULE_GRACE: Duration = Duration::from_millis(50);

/// A running prewarm coordinator: the trigger tracker subscribed to the
/// host's bus, scheduling sessions on a shared prewarmer.
///
/// The tracker task is stopped when the coordinator is dropped.
pub struct Coordinator {
    context: PrewarmContext,
    reports: mpsc::UnboundedReceiver<SessionReport>,
    tracker: JoinHandle<()>,
}

impl Coordinator {
    /// Subscribe to `host.bus` and start tracking. Must be called from
    /// within a tokio runtime.
    pub fn spawn(host: Host, settings: SettingsStore) -> Self {
        let context = PrewarmContext::new();
        let (tx, reports) = mpsc::unbounded_channel();
        let events = host.bus.subscribe();
        let prewarmer = Prewarmer::new(host, settings, context.clone()).with_reports(tx);
        let tracker = tokio::spawn(tracker::run(
            TriggerTracker::new(context.clone()),
            events,
            prewarmer,
        ));
        Self {
            context,
            reports,
            tracker,
        }
    }

    pub fn is_active(&self) -> bool {
        self.context.is_active()
    }

    /// Wait for the next session report.
    pub async fn next_report(&mut self) -> Option<SessionReport> {
        self.reports.recv().await
    }

    /// Wait until no session is active, then return every report produced
    /// since the last call.
    pub async fn settle(&mut self) -> Vec<SessionReport> {
        tokio::time::sleep(SCHEDULE_GRACE).await;
        self.context.idle().await;
        let mut reports = Vec::new();
        while let Ok(report) = self.reports.try_recv() {
            reports.push(report);
        }
        reports
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.tracker.abort();
    }
}
