//! siemcor binary entry point

mod cli;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use siemcor::config::Config;
use siemcor::core::Event;
use siemcor::intel::Indicator;
use siemcor::rules::{defaults, RuleDraft};
use siemcor::SiemCore;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    // --debug beats RUST_LOG, which beats the configured level
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Cycle {
            events,
            intel,
            rules,
            seed_defaults,
        } => {
            let engine = SiemCore::new(&config);
            if seed_defaults {
                engine.load_default_rules()?;
            }
            if let Some(path) = intel {
                let indicators: Vec<Indicator> = read_json(&path)?;
                info!(count = indicators.len(), "loading indicators");
                engine.intel().extend(indicators);
            }
            if let Some(path) = rules {
                let drafts: Vec<RuleDraft> = read_json(&path)?;
                for draft in drafts {
                    engine.rules().create(draft)?;
                }
            }
            let batch: Vec<Event> = read_json(&events)?;
            let report = engine.run_cycle(&batch).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.correlation.offences_created > 0 {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&engine.offences().recent(50))?
                );
            }
        }
        Command::ShowDefaults => {
            println!("{}", serde_json::to_string_pretty(&defaults::default_rules())?);
        }
        Command::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
