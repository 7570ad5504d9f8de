//! Collaborators provided by the host chat application.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::event::EventBus;
use crate::generation::GenerationApi;
use crate::transcript::Transcript;

/// The host's chat view.
pub trait ChatView: Send + Sync {
    /// Resynchronize the trailing interactive controls (swipe arrows, edit
    /// buttons) after the last message changed.
    fn refresh_trailing_controls(&self);
}

/// A view with nothing to redraw. Counts refresh requests.
#[derive(Debug, Default)]
pub struct HeadlessView {
    refreshes: AtomicUsize,
}

impl HeadlessView {
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl ChatView for HeadlessView {
    fn refresh_trailing_controls(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Everything the prewarm core calls into.
#[derive(Clone)]
pub struct Host {
    pub generation: Arc<dyn GenerationApi>,
    pub transcript: Arc<dyn Transcript>,
    pub view: Arc<dyn ChatView>,
    pub bus: EventBus,
}
