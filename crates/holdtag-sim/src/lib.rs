//! holdtag-sim library.
//!
//! Drives several scanning stations, each with its own store connection,
//! against one SQLite file from a seeded schedule, and checks every result
//! against a shadow model.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types. Domain errors from
//!   the store are results to compare, not failures of the run.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`).

pub mod campaign;
pub mod oracle;
pub mod rng;
pub mod station;

use anyhow::{Context, Result, bail};
use holdtag_core::HoldConfig;
use holdtag_core::model::DispositionOutcome;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::oracle::{Discrepancy, FinalMismatch, ShadowModel, final_check};
use crate::rng::DeterministicRng;
use crate::station::{Action, Observed, Station, missing_tag_id};

/// Relative weights of each operation in a generated schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMix {
    pub create_tag: u32,
    pub register_label: u32,
    pub scan: u32,
    pub force_rebind: u32,
    pub unbind: u32,
    pub dispose: u32,
    pub close: u32,
}

impl Default for ActionMix {
    fn default() -> Self {
        Self {
            create_tag: 3,
            register_label: 3,
            scan: 8,
            force_rebind: 2,
            unbind: 2,
            dispose: 3,
            close: 2,
        }
    }
}

impl ActionMix {
    const fn weights(&self) -> [u32; 7] {
        [
            self.create_tag,
            self.register_label,
            self.scan,
            self.force_rebind,
            self.unbind,
            self.dispose,
            self.close,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    /// Stations sharing the database.
    pub stations: usize,
    /// Operations issued across all stations.
    pub steps: usize,
    /// Distinct tag numbers stations may create.
    pub tag_slots: usize,
    /// Distinct physical labels stations may register.
    pub label_slots: usize,
    /// Chance that an operation names a tag id the store never issued.
    pub stray_tag_percent: u8,
    pub mix: ActionMix,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            stations: 3,
            steps: 120,
            tag_slots: 8,
            label_slots: 6,
            stray_tag_percent: 5,
            mix: ActionMix::default(),
        }
    }
}

impl SimulationConfig {
    /// # Errors
    ///
    /// Returns an error if any parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.stations == 0 {
            bail!("stations must be > 0");
        }
        if self.tag_slots == 0 || self.label_slots == 0 {
            bail!("tag_slots and label_slots must be > 0");
        }
        if self.mix.weights().iter().all(|w| *w == 0) {
            bail!("action mix must have at least one non-zero weight");
        }
        Ok(())
    }
}

/// One executed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEntry {
    pub step: usize,
    pub station: String,
    pub action: Action,
    pub observed: Observed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEntry>,
    /// Operations whose result differed from the model's prediction.
    pub discrepancies: Vec<Discrepancy>,
    /// End-of-run differences and store invariant violations.
    pub final_mismatches: Vec<FinalMismatch>,
}

impl SimulationResult {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.discrepancies.is_empty() && self.final_mismatches.is_empty()
    }

    /// Operations that succeeded.
    #[must_use]
    pub fn successes(&self) -> usize {
        self.trace
            .iter()
            .filter(|t| matches!(t.observed, Observed::Success(_)))
            .count()
    }
}

/// Runs one seeded schedule.
#[derive(Debug)]
pub struct Simulator {
    config: SimulationConfig,
    rng: DeterministicRng,
    stations: Vec<Station>,
    model: ShadowModel,
    // Dropped last; removes the database file.
    _dir: TempDir,
}

impl Simulator {
    /// Create a fresh database and open every station on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the database cannot be
    /// created.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let dir = tempfile::tempdir().context("create simulation directory")?;
        let db_path = dir.path().join("holdtag.db");
        let store_config = HoldConfig::default();

        let stations = (0..config.stations)
            .map(|idx| Station::open(idx, &db_path, store_config.clone()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rng: DeterministicRng::new(config.seed),
            model: ShadowModel::new(&store_config),
            config,
            stations,
            _dir: dir,
        })
    }

    /// Execute the schedule and run the end-of-run checks.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read during the final check.
    pub fn run(&mut self) -> Result<SimulationResult> {
        let mut trace = Vec::with_capacity(self.config.steps);
        let mut discrepancies = Vec::new();

        for step in 0..self.config.steps {
            let station_idx = self.rng.below(self.stations.len());
            let action = self.next_action();
            let tag_id = self.resolve_tag(&action);

            let expected = self.model.predict(&action, &tag_id);
            let station = &mut self.stations[station_idx];
            let (observed, created) = station.perform(&action, &tag_id);

            if observed != expected {
                tracing::warn!(step, station = %station.name, ?action, ?expected, ?observed, "store disagrees with model");
                discrepancies.push(Discrepancy {
                    step,
                    station: station.name.clone(),
                    action,
                    expected,
                    observed,
                });
            }
            if let Observed::Success(effect) = observed {
                self.model.apply(&action, effect, created);
            }
            trace.push(TraceEntry {
                step,
                station: station.name.clone(),
                action,
                observed,
            });
        }

        let final_mismatches = match self.stations.first_mut() {
            Some(station) => final_check(station.store_mut(), &self.model)?,
            None => Vec::new(),
        };

        let result = SimulationResult {
            seed: self.config.seed,
            trace,
            discrepancies,
            final_mismatches,
        };
        tracing::info!(
            seed = result.seed,
            steps = result.trace.len(),
            successes = result.successes(),
            passed = result.passed(),
            "simulation complete"
        );
        Ok(result)
    }

    fn next_action(&mut self) -> Action {
        let kind = self.rng.weighted(&self.config.mix.weights()).unwrap_or(2);
        let slot = self.rng.below(self.config.tag_slots);
        let label = self.rng.below(self.config.label_slots);
        match kind {
            0 => Action::CreateTag { slot },
            1 => Action::RegisterLabel { label },
            3 => Action::ForceRebind { label, slot },
            4 => Action::Unbind { label },
            5 => {
                let outcomes = DispositionOutcome::ALL;
                let outcome = outcomes[self.rng.below(outcomes.len())];
                Action::Dispose { slot, outcome }
            }
            6 => Action::Close { slot },
            _ => Action::Scan { label, slot },
        }
    }

    /// Tag id an action addresses: the created tag for its slot, or a
    /// placeholder that the store will not find.
    fn resolve_tag(&mut self, action: &Action) -> String {
        let slot = match *action {
            Action::Scan { slot, .. }
            | Action::ForceRebind { slot, .. }
            | Action::Dispose { slot, .. }
            | Action::Close { slot } => slot,
            Action::CreateTag { .. } | Action::RegisterLabel { .. } | Action::Unbind { .. } => {
                return String::new();
            }
        };
        if self.rng.percent(self.config.stray_tag_percent) {
            return missing_tag_id(slot);
        }
        self.model
            .tag_id(slot)
            .map_or_else(|| missing_tag_id(slot), str::to_string)
    }
}
