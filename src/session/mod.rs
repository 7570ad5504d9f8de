pub mod context;
pub mod runner;
pub mod state;

pub use context::{PrewarmContext, SessionPermit};
pub use runner::Prewarmer;
pub use state::{SessionOutcome, SessionReport, SkipReason, TriggerSource};
