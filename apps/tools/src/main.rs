use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

mod config;
mod scenario;
mod template;

use config::load_settings;
use scenario::{Replay, Scenario};

/// Replays a recorded page against in-memory collaborators and prints the
/// page events, the resulting document and the control-channel traffic.
#[derive(Parser, Debug)]
#[command(name = "pipe-replay")]
struct Cli {
    /// JSON scenario: expected fragment count, document, templates, steps.
    scenario: PathBuf,
    /// Settings file; `replay.toml` in the working directory when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Skip printing the final document.
    #[arg(long)]
    no_dom: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    let settings = load_settings(cli.config.as_deref())?;
    let raw = tokio::fs::read_to_string(&cli.scenario)
        .await
        .with_context(|| format!("failed to read {}", cli.scenario.display()))?;
    let scenario: Scenario = serde_json::from_str(&raw)
        .with_context(|| format!("invalid scenario {}", cli.scenario.display()))?;

    let options = settings.into_options(scenario.expected);
    info!(
        page = %options.page_id,
        steps = scenario.steps.len(),
        "replay: starting"
    );
    let report = Replay::new(&scenario, options)?.run(&scenario.steps)?;

    println!("events:");
    for event in &report.events {
        println!("  {event:?}");
    }
    if !cli.no_dom {
        println!("dom:");
        for (key, html) in &report.dom {
            println!("  {key}: {html}");
        }
    }
    for url in &report.navigations {
        println!("navigate: {url}");
    }
    println!("control channel:");
    for message in &report.page_messages {
        println!("  {message}");
    }

    Ok(())
}
