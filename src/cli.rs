use std::path::PathBuf;

use clap::{Parser, Subcommand};
use prewarm::config::{DEFAULT_CONFIG_PATH, PrewarmMode};
use prewarm::generation::GenerationKind;

#[derive(Parser, Debug)]
#[command(
    name = "prewarm",
    about = "Opportunistic context-cache prewarming between chat turns",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Settings file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log debug diagnostics to stderr.
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show or change the persisted settings.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Play chat turns against a simulated backend and report each prewarm.
    Simulate {
        /// Comma-separated generation kinds, one per turn.
        #[arg(long, value_delimiter = ',', default_value = "normal")]
        turns: Vec<GenerationKind>,

        /// Make every prewarm generation fail with a backend error.
        #[arg(long)]
        fail_prewarm: bool,

        /// Never signal request dispatch for prewarm generations.
        #[arg(long)]
        no_dispatch: bool,

        /// Time from request to dispatch signal.
        #[arg(long, default_value = "150")]
        dispatch_latency_ms: u64,

        /// Time from dispatch to a complete response.
        #[arg(long, default_value = "3000")]
        response_latency_ms: u64,

        /// Publish a companion-completed notification after every turn.
        #[arg(long)]
        companion_after_turn: bool,

        /// Load and save the transcript as JSON at this path.
        #[arg(long)]
        transcript: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective settings.
    Show,

    /// Update one or more settings.
    Set {
        #[arg(long)]
        enabled: Option<bool>,

        /// `quiet` or `user_message`.
        #[arg(long)]
        mode: Option<PrewarmMode>,

        /// Clamped to 100..=5000.
        #[arg(long)]
        delay_ms: Option<u64>,

        #[arg(long)]
        transient_text: Option<String>,

        /// Accept prewarm requests from a companion process.
        #[arg(long)]
        companion: Option<bool>,
    },
}
