//! Sweeps over sample-size configurations: a fixed grid or an incremental search.

use crate::error::{PowerError, Result};
use crate::power::estimate::{validate_power_model, validate_run, PowerEstimator, PowerResult};
use crate::simulate::GenerativeModel;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Number of participants and items for one simulated study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleSizeConfiguration {
    /// Number of participants.
    pub participants: usize,
    /// Number of items.
    pub items: usize,
}

impl SampleSizeConfiguration {
    /// Create a configuration.
    pub fn new(participants: usize, items: usize) -> Self {
        Self {
            participants,
            items,
        }
    }

    /// Participant × item cells (observations per factor level).
    pub fn cells(&self) -> usize {
        self.participants * self.items
    }
}

/// Full crossing of participant counts with item counts, participants outermost.
pub fn configuration_grid(participants: &[usize], items: &[usize]) -> Vec<SampleSizeConfiguration> {
    participants
        .iter()
        .flat_map(|&n| items.iter().map(move |&m| SampleSizeConfiguration::new(n, m)))
        .collect()
}

/// Row written to the TSV power table.
#[derive(Debug, Serialize)]
struct PowerTableRecord {
    participants: usize,
    items: usize,
    power: f64,
    replicates: usize,
    converged: usize,
    singular: usize,
    not_converged: usize,
    failed: usize,
    alpha: f64,
    seed: u64,
}

impl From<&PowerResult> for PowerTableRecord {
    fn from(r: &PowerResult) -> Self {
        Self {
            participants: r.participants,
            items: r.items,
            power: r.power,
            replicates: r.replicates,
            converged: r.converged,
            singular: r.singular,
            not_converged: r.not_converged,
            failed: r.failed,
            alpha: r.alpha,
            seed: r.seed,
        }
    }
}

/// Power results in evaluation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerTable {
    /// One result per evaluated configuration.
    pub results: Vec<PowerResult>,
}

impl PowerTable {
    /// Wrap a list of results.
    pub fn new(results: Vec<PowerResult>) -> Self {
        Self { results }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Iterate over results.
    pub fn iter(&self) -> impl Iterator<Item = &PowerResult> {
        self.results.iter()
    }

    /// Power values in row order.
    pub fn powers(&self) -> Vec<f64> {
        self.results.iter().map(|r| r.power).collect()
    }

    /// Result for a configuration, if it was evaluated.
    pub fn get(&self, configuration: SampleSizeConfiguration) -> Option<&PowerResult> {
        self.results
            .iter()
            .find(|r| r.configuration() == configuration)
    }

    /// Highest observed power.
    pub fn best_power(&self) -> Option<f64> {
        self.results.iter().map(|r| r.power).reduce(f64::max)
    }

    /// Smallest configuration (fewest participant × item cells, ties by row order)
    /// whose power meets `target`.
    pub fn smallest_meeting(&self, target: f64) -> Option<&PowerResult> {
        self.results
            .iter()
            .filter(|r| r.power >= target)
            .min_by_key(|r| r.configuration().cells())
    }

    /// Write the table as TSV.
    pub fn write_tsv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(writer);
        for result in &self.results {
            wtr.serialize(PowerTableRecord::from(result))?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Write the table to a TSV file.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        self.write_tsv(std::io::BufWriter::new(file))
    }
}

/// Which dimension an incremental search grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SearchAxis {
    /// Grow the participant count only.
    Participants,
    /// Grow the item count only.
    Items,
    /// Grow both counts together.
    #[default]
    Both,
}

/// Parameters of an incremental sample-size search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPlan {
    /// Dimension to grow.
    pub axis: SearchAxis,
    /// Starting configuration.
    pub start: SampleSizeConfiguration,
    /// Increment applied to the growing dimension(s) each iteration.
    pub step: usize,
    /// Search stops once power exceeds this value.
    pub desired_power: f64,
    /// Largest participant count to evaluate.
    pub max_participants: usize,
    /// Largest item count to evaluate.
    pub max_items: usize,
    /// Largest number of configurations to evaluate.
    pub max_iterations: usize,
}

impl Default for SearchPlan {
    fn default() -> Self {
        Self {
            axis: SearchAxis::Both,
            start: SampleSizeConfiguration::new(5, 5),
            step: 1,
            desired_power: 0.8,
            max_participants: 100,
            max_items: 100,
            max_iterations: 50,
        }
    }
}

impl SearchPlan {
    /// Create a plan growing `axis` from `start` by `step`.
    pub fn new(axis: SearchAxis, start: SampleSizeConfiguration, step: usize, desired_power: f64) -> Self {
        Self {
            axis,
            start,
            step,
            desired_power,
            ..Default::default()
        }
    }

    /// Set the size ceilings.
    pub fn with_max_size(mut self, max_participants: usize, max_items: usize) -> Self {
        self.max_participants = max_participants;
        self.max_items = max_items;
        self
    }

    /// Set the iteration ceiling.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Check the plan before running it.
    pub fn validate(&self) -> Result<()> {
        if self.start.participants == 0 || self.start.items == 0 {
            return Err(PowerError::InvalidArgument(
                "Search must start from at least one participant and one item".to_string(),
            ));
        }
        if self.step == 0 {
            return Err(PowerError::InvalidArgument(
                "Search step must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.desired_power) {
            return Err(PowerError::InvalidArgument(format!(
                "desired_power must be in [0, 1], got {}",
                self.desired_power
            )));
        }
        if self.max_iterations == 0 {
            return Err(PowerError::InvalidArgument(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.start.participants > self.max_participants || self.start.items > self.max_items {
            return Err(PowerError::InvalidArgument(format!(
                "Start {}x{} exceeds the size ceiling {}x{}",
                self.start.participants, self.start.items, self.max_participants, self.max_items
            )));
        }
        Ok(())
    }

    /// Configuration after `current`, or `None` past a size ceiling.
    fn next(&self, current: SampleSizeConfiguration) -> Option<SampleSizeConfiguration> {
        let (grow_p, grow_i) = match self.axis {
            SearchAxis::Participants => (true, false),
            SearchAxis::Items => (false, true),
            SearchAxis::Both => (true, true),
        };
        // An overflowing step is past any ceiling.
        let participants = if grow_p {
            current.participants.checked_add(self.step)?
        } else {
            current.participants
        };
        let items = if grow_i {
            current.items.checked_add(self.step)?
        } else {
            current.items
        };
        (participants <= self.max_participants && items <= self.max_items)
            .then(|| SampleSizeConfiguration::new(participants, items))
    }
}

/// Successful end of an incremental search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    /// First configuration whose power exceeded the desired power.
    pub result: PowerResult,
    /// Every configuration evaluated, in order.
    pub history: PowerTable,
}

impl SearchOutcome {
    /// Number of configurations evaluated.
    pub fn iterations(&self) -> usize {
        self.history.len()
    }
}

/// Runs a [`PowerEstimator`] over many configurations of one generative model.
#[derive(Debug, Clone)]
pub struct ConfigurationSweep {
    estimator: PowerEstimator,
    model: GenerativeModel,
    replicates: usize,
    alpha: f64,
}

impl ConfigurationSweep {
    /// Create a sweep. Arguments are validated immediately.
    pub fn new(
        estimator: PowerEstimator,
        model: GenerativeModel,
        replicates: usize,
        alpha: f64,
    ) -> Result<Self> {
        validate_run(replicates, alpha)?;
        validate_power_model(&model)?;
        Ok(Self {
            estimator,
            model,
            replicates,
            alpha,
        })
    }

    /// The generative model.
    pub fn model(&self) -> &GenerativeModel {
        &self.model
    }

    /// Estimate power at every configuration.
    ///
    /// Configurations run in parallel; each uses its index as random stream, so the
    /// table is reproducible and returned in input order.
    pub fn sweep_grid(&self, configurations: &[SampleSizeConfiguration]) -> Result<PowerTable> {
        tracing::info!(
            configurations = configurations.len(),
            replicates = self.replicates,
            alpha = self.alpha,
            "starting grid sweep"
        );

        let results = configurations
            .par_iter()
            .enumerate()
            .map(|(index, &configuration)| {
                self.estimator.estimate_stream(
                    configuration,
                    &self.model,
                    self.replicates,
                    self.alpha,
                    index as u64,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(configurations = results.len(), "grid sweep finished");
        Ok(PowerTable::new(results))
    }

    /// Grow the sample size until power exceeds `plan.desired_power`.
    ///
    /// # Errors
    /// `SearchExhausted` when the iteration or size ceiling is reached first.
    pub fn search_sample_size(&self, plan: &SearchPlan) -> Result<SearchOutcome> {
        plan.validate()?;
        tracing::info!(
            axis = ?plan.axis,
            participants = plan.start.participants,
            items = plan.start.items,
            desired_power = plan.desired_power,
            "starting sample size search"
        );

        let mut history = Vec::new();
        let mut current = plan.start;

        loop {
            let iteration = history.len();
            let result = self.estimator.estimate_stream(
                current,
                &self.model,
                self.replicates,
                self.alpha,
                iteration as u64,
            )?;
            tracing::debug!(
                iteration,
                participants = current.participants,
                items = current.items,
                power = result.power,
                "search step"
            );

            let crossed = result.power > plan.desired_power;
            history.push(result.clone());

            if crossed {
                tracing::info!(
                    participants = current.participants,
                    items = current.items,
                    power = result.power,
                    iterations = history.len(),
                    "desired power reached"
                );
                return Ok(SearchOutcome {
                    result,
                    history: PowerTable::new(history),
                });
            }

            let reason = if history.len() >= plan.max_iterations {
                Some(format!("iteration ceiling {} reached", plan.max_iterations))
            } else {
                match plan.next(current) {
                    Some(next) => {
                        current = next;
                        None
                    }
                    None => Some(format!(
                        "size ceiling {}x{} reached at {}x{}",
                        plan.max_participants, plan.max_items, current.participants, current.items
                    )),
                }
            };

            if let Some(reason) = reason {
                let table = PowerTable::new(history);
                let best_power = table.best_power().unwrap_or(0.0);
                tracing::warn!(
                    iterations = table.len(),
                    best_power,
                    desired_power = plan.desired_power,
                    "sample size search exhausted"
                );
                return Err(PowerError::SearchExhausted {
                    iterations: table.len(),
                    best_power,
                    reason,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn result(participants: usize, items: usize, power: f64) -> PowerResult {
        PowerResult {
            participants,
            items,
            power,
            replicates: 10,
            rejections: (power * 10.0) as usize,
            converged: 10,
            singular: 0,
            not_converged: 0,
            failed: 0,
            alpha: 0.05,
            seed: 42,
        }
    }

    #[test]
    fn test_configuration_grid() {
        let grid = configuration_grid(&[5, 10], &[4, 8, 12]);
        assert_eq!(grid.len(), 6);
        assert_eq!(grid[0], SampleSizeConfiguration::new(5, 4));
        assert_eq!(grid[3], SampleSizeConfiguration::new(10, 4));
        assert_eq!(grid[5].cells(), 120);
    }

    #[test]
    fn test_smallest_meeting() {
        let table = PowerTable::new(vec![
            result(20, 20, 0.95),
            result(10, 10, 0.6),
            result(10, 20, 0.85),
            result(20, 10, 0.82),
        ]);
        let best = table.smallest_meeting(0.8).unwrap();
        assert_eq!(best.configuration(), SampleSizeConfiguration::new(10, 20));
        assert!(table.smallest_meeting(0.99).is_none());
        assert_eq!(table.best_power(), Some(0.95));
    }

    #[test]
    fn test_table_tsv() {
        let table = PowerTable::new(vec![result(5, 5, 0.3), result(10, 10, 0.7)]);
        let file = NamedTempFile::new().unwrap();
        table.to_tsv(file.path()).unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next().unwrap(),
            "participants\titems\tpower\treplicates\tconverged\tsingular\tnot_converged\tfailed\talpha\tseed"
        );
        assert!(lines.next().unwrap().starts_with("5\t5\t0.3\t10"));
        assert_eq!(lines.count(), 1);
    }

    #[test]
    fn test_search_plan_next() {
        let start = SampleSizeConfiguration::new(5, 5);
        let both = SearchPlan::new(SearchAxis::Both, start, 5, 0.8).with_max_size(12, 20);
        assert_eq!(both.next(start), Some(SampleSizeConfiguration::new(10, 10)));
        assert_eq!(both.next(SampleSizeConfiguration::new(10, 10)), None);

        let items = SearchPlan::new(SearchAxis::Items, start, 2, 0.8);
        assert_eq!(items.next(start), Some(SampleSizeConfiguration::new(5, 7)));

        let participants = SearchPlan::new(SearchAxis::Participants, start, 3, 0.8);
        assert_eq!(participants.next(start), Some(SampleSizeConfiguration::new(8, 5)));
    }

    #[test]
    fn test_search_plan_huge_step_stops_at_ceiling() {
        let start = SampleSizeConfiguration::new(3, 3);
        let plan = SearchPlan::new(SearchAxis::Participants, start, usize::MAX, 0.9)
            .with_max_size(100, 100)
            .with_max_iterations(3);
        assert!(plan.validate().is_ok());
        assert_eq!(plan.next(start), None);

        let both = SearchPlan::new(SearchAxis::Both, start, usize::MAX - 1, 0.9);
        assert_eq!(both.next(start), None);
    }

    #[test]
    fn test_search_huge_step_is_exhausted_after_one_size() {
        let model = GenerativeModel::new(0.0, [("a", 0.0), ("b", 0.0)], 1.0, 1.0, 1.0).unwrap();
        let sweep = ConfigurationSweep::new(PowerEstimator::default(), model, 2, 0.05).unwrap();
        let plan = SearchPlan::new(
            SearchAxis::Participants,
            SampleSizeConfiguration::new(3, 3),
            usize::MAX,
            0.9,
        )
        .with_max_size(100, 100)
        .with_max_iterations(3);

        match sweep.search_sample_size(&plan) {
            Err(PowerError::SearchExhausted {
                iterations, reason, ..
            }) => {
                assert_eq!(iterations, 1);
                assert!(reason.contains("size ceiling"), "{}", reason);
            }
            other => panic!("expected SearchExhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_search_plan_validation() {
        let start = SampleSizeConfiguration::new(5, 5);
        assert!(SearchPlan::new(SearchAxis::Both, start, 0, 0.8).validate().is_err());
        assert!(SearchPlan::new(SearchAxis::Both, start, 1, 1.2).validate().is_err());
        assert!(SearchPlan::new(SearchAxis::Both, SampleSizeConfiguration::new(0, 5), 1, 0.8)
            .validate()
            .is_err());
        assert!(SearchPlan::new(SearchAxis::Both, start, 1, 0.8)
            .with_max_size(4, 100)
            .validate()
            .is_err());
        assert!(SearchPlan::default().validate().is_ok());
    }

    #[test]
    fn test_sweep_rejects_bad_arguments() {
        let model = GenerativeModel::new(0.0, [("a", 0.0), ("b", 1.0)], 1.0, 1.0, 1.0).unwrap();
        assert!(ConfigurationSweep::new(PowerEstimator::default(), model.clone(), 0, 0.05).is_err());
        assert!(ConfigurationSweep::new(PowerEstimator::default(), model, 10, 2.0).is_err());
    }
}
