// search logging: periodic snapshots of the root statistics
//
// The engine drives the logger through the SearchLogger trait under its
// own logging lock; TrialLogger is the standard implementation collecting
// one entry per trial delta, exportable as JSON or CSV.

use crate::algorithms::Algorithm;
use crate::env::Environment;
use crate::node::DecisionNode;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;

pub trait SearchLogger<E: Environment, A: Algorithm<E>>: Send {
    /// Snapshot the root every `delta` completed trials.
    fn set_trials_delta(&mut self, delta: u64);
    /// Called once per completed trial.
    fn trial_completed(&mut self);
    fn should_log(&self) -> bool;
    /// Append an entry; the root snapshot is taken under the root's lock.
    fn log(&mut self, root: &DecisionNode<E, A>);
    /// Called when a run concludes, folding the elapsed time into the
    /// runtime carried over to the next run.
    fn update_prior_runtime(&mut self);
    /// Zero entry marking the origin of a fresh run series.
    fn add_origin_entry(&mut self);
    fn reset_start_time(&mut self);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    pub runtime_secs: f64,
    pub wall_time: DateTime<Utc>,
    pub trials: u64,
    pub root_value: f64,
    pub root_visits: usize,
}

pub struct TrialLogger {
    entries: Vec<LogEntry>,
    trials_delta: u64,
    trials_since_last_log: u64,
    trials_completed: u64,
    prior_runtime: f64,
    start_time: Instant,
}

impl TrialLogger {
    pub fn new(trials_delta: u64) -> Self {
        TrialLogger {
            entries: Vec::new(),
            trials_delta,
            trials_since_last_log: 0,
            trials_completed: 0,
            prior_runtime: 0.0,
            start_time: Instant::now(),
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn trials_completed(&self) -> u64 {
        self.trials_completed
    }

    fn runtime(&self) -> f64 {
        self.prior_runtime + self.start_time.elapsed().as_secs_f64()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.entries)?)
    }

    pub fn to_csv(&self, precision: usize) -> String {
        let mut out = String::from("runtime_secs,trials,root_value,root_visits\n");
        for entry in &self.entries {
            out.push_str(&format!(
                "{:.prec$},{},{:.prec$},{}\n",
                entry.runtime_secs,
                entry.trials,
                entry.root_value,
                entry.root_visits,
                prec = precision,
            ));
        }
        out
    }
}

impl<E: Environment, A: Algorithm<E>> SearchLogger<E, A> for TrialLogger {
    fn set_trials_delta(&mut self, delta: u64) {
        self.trials_delta = delta;
    }

    fn trial_completed(&mut self) {
        self.trials_completed += 1;
        self.trials_since_last_log += 1;
    }

    fn should_log(&self) -> bool {
        self.trials_delta > 0 && self.trials_since_last_log >= self.trials_delta
    }

    fn log(&mut self, root: &DecisionNode<E, A>) {
        let snapshot = root.snapshot();
        self.entries.push(LogEntry {
            runtime_secs: self.runtime(),
            wall_time: Utc::now(),
            trials: self.trials_completed,
            root_value: snapshot.value,
            root_visits: snapshot.num_visits,
        });
        self.trials_since_last_log = 0;
    }

    fn update_prior_runtime(&mut self) {
        self.prior_runtime = self.runtime();
        self.start_time = Instant::now();
    }

    fn add_origin_entry(&mut self) {
        self.entries.push(LogEntry {
            runtime_secs: 0.0,
            wall_time: Utc::now(),
            trials: 0,
            root_value: 0.0,
            root_visits: 0,
        });
    }

    fn reset_start_time(&mut self) {
        self.start_time = Instant::now();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
