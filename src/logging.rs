// run telemetry: tracing bootstrap and end-of-run reporting
//
// The engine emits tracing events (pool lifecycle, teardown, evaluation)
// and the logger collects per-trial entries; this module wires both to
// the outside world for experiment runs. Console output honours RUST_LOG,
// an optional log directory adds a daily-rolled plain-text file, and the
// collected trial entries can be dropped next to it as CSV.

use crate::algorithms::Algorithm;
use crate::env::Environment;
use crate::logger::TrialLogger;
use crate::node::DecisionNode;
use anyhow::{Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{Registry, filter::EnvFilter, fmt, prelude::*};

pub struct RunLogConfig {
    /// Filter applied when RUST_LOG is not set.
    pub default_level: String,
    /// Emit console output as JSON lines instead of plain text.
    pub json_console: bool,
    /// Also tee events into a daily-rolled `thts.log` in this directory.
    /// The file stays plain text so it greps cleanly either way.
    pub log_directory: Option<PathBuf>,
}

impl Default for RunLogConfig {
    fn default() -> Self {
        RunLogConfig {
            default_level: "info".into(),
            json_console: false,
            log_directory: None,
        }
    }
}

impl RunLogConfig {
    /// Installs the global subscriber. The returned guard must outlive the
    /// run when file logging is on, or buffered lines are lost.
    pub fn init(self) -> Option<WorkerGuard> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.default_level));

        let (file_layer, guard) = match &self.log_directory {
            Some(directory) => {
                let (writer, guard) =
                    tracing_appender::non_blocking(rolling::daily(directory, "thts.log"));
                let layer = fmt::layer().with_ansi(false).with_writer(writer);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        let registry = Registry::default().with(filter).with(file_layer);
        if self.json_console {
            registry
                .with(fmt::layer().json().with_writer(io::stdout))
                .init();
        } else {
            registry.with(fmt::layer().with_writer(io::stdout)).init();
        }
        guard
    }
}

/// Emits one structured event summarising a finished run, from a root
/// snapshot taken under the root's lock.
pub fn log_run_summary<E: Environment, A: Algorithm<E>>(
    root: &DecisionNode<E, A>,
    trials_completed: u64,
) {
    let snapshot = root.snapshot();
    info!(
        trials = trials_completed,
        root_visits = snapshot.num_visits,
        root_value = snapshot.value,
        root_children = snapshot.num_children,
        "search run finished"
    );
}

/// Writes the logger's collected entries as CSV, e.g. next to the tracing
/// logs for offline analysis.
pub fn write_logger_csv(logger: &TrialLogger, path: &Path, precision: usize) -> Result<()> {
    std::fs::write(path, logger.to_csv(precision))
        .with_context(|| format!("writing trial log to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::uct::{Uct, UctParams};
    use crate::config::SearchConfig;
    use crate::envs::ChainEnv;
    use crate::logger::SearchLogger;
    use crate::manager::SearchManager;
    use std::sync::Arc;

    #[test]
    fn logger_csv_lands_on_disk() {
        let mut logger = TrialLogger::new(1);
        <TrialLogger as SearchLogger<ChainEnv, Uct>>::add_origin_entry(&mut logger);
        let path = std::env::temp_dir().join("thts_logging_csv_test.csv");
        write_logger_csv(&logger, &path, 3).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("runtime_secs,"));
        assert_eq!(contents.lines().count(), 2);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn run_summary_snapshots_without_a_subscriber() {
        let manager = Arc::new(
            SearchManager::<ChainEnv, Uct>::new(
                Arc::new(ChainEnv::new(5, 1.0)),
                SearchConfig::default(),
                UctParams::default(),
            )
            .unwrap(),
        );
        let root = DecisionNode::root(&manager, 0).unwrap();
        // events without an installed subscriber are simply dropped
        log_run_summary(&root, 0);
    }
}
