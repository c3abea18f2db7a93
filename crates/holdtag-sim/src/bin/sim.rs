#![forbid(unsafe_code)]

use std::env;
use std::process::ExitCode;

use anyhow::{Context, Result};
use holdtag_sim::campaign::{CampaignConfig, run_campaign};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_tracing() {
    let filter = EnvFilter::try_from_env("HOLDTAG_LOG")
        .unwrap_or_else(|_| EnvFilter::new("holdtag_sim=info,holdtag_core=warn"));

    let format = env::var("HOLDTAG_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// `holdtag-sim [SEEDS]`: run a campaign over seeds `0..SEEDS` and print the
/// report as JSON.
fn main() -> Result<ExitCode> {
    init_tracing();

    let mut config = CampaignConfig::default();
    if let Some(arg) = env::args().nth(1) {
        let seeds: u64 = arg
            .parse()
            .with_context(|| format!("seed count '{arg}' is not a number"))?;
        config.seed_range = 0..seeds;
    }

    let report = run_campaign(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.all_passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
