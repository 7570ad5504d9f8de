mod cli;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use prewarm::commands;
use prewarm::commands::config::ConfigUpdate;
use prewarm::commands::simulate::SimulateConfig;
use tracing::Level;

use cli::{Cli, Command, ConfigAction};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    install_tracing(cli.verbose);

    match cli.command {
        Command::Config {
            action: ConfigAction::Show,
        } => {
            commands::config::show(&cli.config, &mut std::io::stdout())?;
        }
        Command::Config {
            action:
                ConfigAction::Set {
                    enabled,
                    mode,
                    delay_ms,
                    transient_text,
                    companion,
                },
        } => {
            let update = ConfigUpdate {
                enabled,
                mode,
                delay_ms,
                transient_text,
                companion,
            };
            commands::config::set(&cli.config, update, &mut std::io::stdout()).await?;
        }
        Command::Simulate {
            turns,
            fail_prewarm,
            no_dispatch,
            dispatch_latency_ms,
            response_latency_ms,
            companion_after_turn,
            transcript,
        } => {
            let settings = prewarm::config::load(&cli.config)?;
            if !settings.enabled {
                tracing::info!("prewarm is disabled in {}", cli.config.display());
            }
            commands::simulate::simulate(
                SimulateConfig {
                    turns,
                    fail_prewarm,
                    no_dispatch,
                    dispatch_latency: Duration::from_millis(dispatch_latency_ms),
                    response_latency: Duration::from_millis(response_latency_ms),
                    companion_after_turn,
                    transcript_path: transcript,
                },
                settings,
                &mut std::io::stdout(),
            )
            .await?;
        }
    }

    Ok(())
}

/// Log to stderr so command output on stdout stays clean.
fn install_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
