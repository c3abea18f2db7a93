//! Campaign runner: many seeds, one report.
//!
//! The first failing seed is recorded so it can be replayed with
//! [`replay_seed`] and its full trace inspected.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::{ActionMix, SimulationConfig, SimulationResult, Simulator};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Seeds to execute, e.g. `0..50`.
    pub seed_range: Range<u64>,
    pub stations: usize,
    pub steps: usize,
    pub tag_slots: usize,
    pub label_slots: usize,
    pub stray_tag_percent: u8,
    pub mix: ActionMix,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let sim = SimulationConfig::default();
        Self {
            seed_range: 0..50,
            stations: sim.stations,
            steps: sim.steps,
            tag_slots: sim.tag_slots,
            label_slots: sim.label_slots,
            stray_tag_percent: sim.stray_tag_percent,
            mix: sim.mix,
        }
    }
}

impl CampaignConfig {
    #[must_use]
    pub fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            stations: self.stations,
            steps: self.steps,
            tag_slots: self.tag_slots,
            label_slots: self.label_slots,
            stray_tag_percent: self.stray_tag_percent,
            mix: self.mix,
        }
    }

    /// # Errors
    ///
    /// Returns an error if any parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        if self.steps == 0 {
            bail!("steps must be > 0");
        }
        self.sim_config_for_seed(self.seed_range.start).validate()
    }
}

/// Failure details for one seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub problems: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First seed that failed, for replay.
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Operations that succeeded, across all seeds.
    pub successful_operations: usize,
    pub total_operations: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run every seed in the config.
///
/// # Errors
///
/// Returns an error if the config is invalid or a simulation cannot run.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        successful_operations: 0,
        total_operations: 0,
    };

    for seed in config.seed_range.clone() {
        let result = run_single_seed(seed, config)?;
        report.seeds_run += 1;
        report.successful_operations += result.successes();
        report.total_operations += result.trace.len();

        if result.passed() {
            report.seeds_passed += 1;
        } else {
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                problems: describe_problems(&result),
            });
        }
    }

    if report.all_passed() {
        tracing::info!(seeds = report.seeds_run, "campaign passed");
    } else {
        tracing::warn!(
            seeds = report.seeds_run,
            failed = report.failures.len(),
            first_failure = report.first_failure,
            "campaign found failures"
        );
    }
    Ok(report)
}

/// # Errors
///
/// Returns an error if the simulation cannot run.
pub fn run_single_seed(seed: u64, config: &CampaignConfig) -> Result<SimulationResult> {
    Simulator::new(config.sim_config_for_seed(seed))?.run()
}

/// Re-run one seed for debugging; the result carries the full trace.
///
/// # Errors
///
/// Returns an error if the config is invalid or the simulation cannot run.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<SimulationResult> {
    config.validate()?;
    run_single_seed(seed, config)
}

fn describe_problems(result: &SimulationResult) -> Vec<String> {
    let ops = result.discrepancies.iter().map(|d| {
        format!(
            "step {} ({}): {:?} expected {:?}, got {:?}",
            d.step, d.station, d.action, d.expected, d.observed
        )
    });
    let finals = result.final_mismatches.iter().map(|m| format!("{m:?}"));
    ops.chain(finals).collect()
}
