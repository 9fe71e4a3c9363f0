use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use tracing::{debug, info, warn};
use crate::config::SweepConfig;
use crate::error::{Result, SweepError};
use crate::extract::extract;
use crate::invoke::{CellRunner, ExitState, RunOutcome};
use crate::plan::{CellKey, SweepCell, SweepPlan};
use crate::store::{ExportFormat, ResultStore};

/// Where a cell ended up
///
/// Cells start pending and move to running unless their result is already stored (skipped) or a
/// stop was requested first (interrupted). A running cell succeeds only if the simulator exited
/// successfully and a result could be extracted from its output
#[derive(Debug, Clone, PartialEq)]
pub enum CellStatus {
    Succeeded,
    Failed(CellFailure),
    Skipped,
    Interrupted,
}

/// Why a cell failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The simulator couldn't be started, or its output couldn't be set up or read
    Launch(String),
    /// The simulator exited unsuccessfully
    Exit(Option<i32>),
    /// The simulator exited successfully but printed nothing usable
    NoResult,
    /// The result was extracted but couldn't be persisted
    Store(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Launch(e) => write!(f, "launch failed: {e}"),
            FailureReason::Exit(Some(code)) => write!(f, "exited with code {code}"),
            FailureReason::Exit(None) => write!(f, "killed by a signal"),
            FailureReason::NoResult => write!(f, "no result in the simulator output"),
            FailureReason::Store(e) => write!(f, "couldn't persist the result: {e}"),
        }
    }
}

/// Diagnostics for a failed cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellFailure {
    pub key: CellKey,
    pub command_line: String,
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub reason: FailureReason,
}

impl CellFailure {
    fn from_outcome(outcome: &RunOutcome, reason: FailureReason) -> Self {
        Self {
            key: outcome.cell.key(),
            command_line: outcome.command_line.clone(),
            exit_code: outcome.exit_code(),
            stderr: outcome.stderr.clone(),
            reason,
        }
    }
}

/// A policy's CSV summary, as written at the end of a sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySummary {
    pub policy: String,
    pub path: PathBuf,
    pub csv: String,
}

/// What a sweep did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub succeeded: usize,
    pub skipped: usize,
    pub interrupted: usize,
    pub failures: Vec<CellFailure>,
    pub summaries: Vec<PolicySummary>,
}

impl SweepReport {
    /// Number of cells the simulator was run for
    pub fn invoked(&self) -> usize {
        self.succeeded + self.failures.len()
    }

    fn record(&mut self, status: CellStatus) {
        match status {
            CellStatus::Succeeded => self.succeeded += 1,
            CellStatus::Skipped => self.skipped += 1,
            CellStatus::Interrupted => self.interrupted += 1,
            CellStatus::Failed(failure) => self.failures.push(failure),
        }
    }
}

/// A policy's store together with the cells currently being run for it
struct PolicySlot {
    store: ResultStore,
    in_flight: HashSet<CellKey>,
}

/// Runs every cell of a plan which has no stored result yet
///
/// Each policy has its own [ResultStore]. All access to a store, the check whether a cell still
/// needs running as well as recording and flushing a result, happens under that store's lock, so
/// several workers never run the same cell or write the same file at once
pub struct SweepDriver<R: CellRunner> {
    runner: R,
    slots: BTreeMap<String, Mutex<PolicySlot>>,
    workers: usize,
}

impl<R: CellRunner> SweepDriver<R> {
    /// Creates a driver over already loaded stores
    ///
    /// # Arguments
    ///
    /// * `runner`: Runs the simulator for a cell
    /// * `stores`: One store per policy of the plans which will be run
    /// * `workers`: The number of cells to run at once, at most the number of available cores
    ///
    /// returns: SweepDriver<R>
    pub fn new(runner: R, stores: Vec<ResultStore>, workers: usize) -> Self {
        let slots = stores
            .into_iter()
            .map(|store| {
                let policy = store.policy().to_string();
                (policy, Mutex::new(PolicySlot { store, in_flight: HashSet::new() }))
            })
            .collect();
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            runner,
            slots,
            workers: workers.clamp(1, cores),
        }
    }

    /// Loads the store of every configured policy
    ///
    /// Stores are all loaded before anything runs so a corrupt results file stops the sweep before
    /// the simulator is started even once
    pub fn from_config(config: &SweepConfig, runner: R) -> Result<Self> {
        let stores = config
            .policies
            .iter()
            .map(|policy| ResultStore::load(&config.store_path(policy), policy, config.size_unit))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(runner, stores, config.workers))
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// A copy of a policy's store in its current state
    pub fn store(&self, policy: &str) -> Option<ResultStore> {
        self.slots.get(policy).map(|slot| lock(slot).store.clone())
    }

    /// Runs the plan, then writes and returns every policy's CSV summary
    ///
    /// Failed cells are logged and reported but never stop the sweep. Once `stop` is raised no more
    /// cells are started; the summaries are still written for whatever completed
    ///
    /// # Arguments
    ///
    /// * `plan`: The cells to run
    /// * `stop`: Checked before each cell is started
    ///
    /// returns: Result<SweepReport, SweepError>
    pub fn run(&self, plan: &SweepPlan, stop: &AtomicBool) -> Result<SweepReport> {
        for policy in plan.policies() {
            if !self.slots.contains_key(policy) {
                return Err(SweepError::Config(format!("no results store for policy {policy}")));
            }
        }
        let total = plan.len();
        let finished = AtomicUsize::new(0);
        info!("Sweeping {total} cells with {} worker(s)", self.workers);

        let statuses: Vec<CellStatus> = if self.workers <= 1 {
            plan.cells().iter().map(|cell| self.run_cell(cell, stop, &finished, total)).collect()
        } else {
            let pool = ThreadPoolBuilder::new().num_threads(self.workers).build()?;
            pool.install(|| {
                plan.cells()
                    .par_iter()
                    .map(|cell| self.run_cell(cell, stop, &finished, total))
                    .collect()
            })
        };

        let mut report = SweepReport::default();
        for status in statuses {
            report.record(status);
        }
        if report.interrupted > 0 {
            warn!("Stop requested, {} cell(s) were not started", report.interrupted);
        }
        for policy in plan.policies() {
            report.summaries.push(self.write_summary(policy)?);
        }
        info!(
            "Sweep finished: {} succeeded, {} failed, {} skipped, {} not started",
            report.succeeded,
            report.failures.len(),
            report.skipped,
            report.interrupted
        );
        Ok(report)
    }

    fn run_cell(&self, cell: &SweepCell, stop: &AtomicBool, finished: &AtomicUsize, total: usize) -> CellStatus {
        let key = cell.key();
        if stop.load(Ordering::SeqCst) {
            return CellStatus::Interrupted;
        }
        // Presence was checked in run
        let Some(slot) = self.slots.get(&cell.policy) else {
            return CellStatus::Interrupted;
        };
        {
            let mut slot = lock(slot);
            if slot.store.has(&key) || !slot.in_flight.insert(key.clone()) {
                let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("[{done}/{total}] {key}: already recorded, skipping");
                return CellStatus::Skipped;
            }
        }

        info!("Running {key}");
        let outcome = self.runner.run(cell);
        let status = self.settle(slot, &key, &outcome);

        let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
        match &status {
            CellStatus::Succeeded => info!("[{done}/{total}] {key}: succeeded"),
            CellStatus::Failed(failure) => warn!(
                command = %failure.command_line,
                exit_code = ?failure.exit_code,
                stderr = %failure.stderr.trim_end(),
                "[{done}/{total}] {key}: {}",
                failure.reason
            ),
            _ => {}
        }
        status
    }

    /// Decides the cell's final state from its outcome, recording and flushing a result if there
    /// is one
    fn settle(&self, slot: &Mutex<PolicySlot>, key: &CellKey, outcome: &RunOutcome) -> CellStatus {
        let reason = match &outcome.exit {
            ExitState::LaunchError(e) => Some(FailureReason::Launch(e.clone())),
            ExitState::Failure(code) => Some(FailureReason::Exit(*code)),
            ExitState::Success => None,
        };
        let result = if reason.is_none() { extract(outcome) } else { None };

        let mut slot = lock(slot);
        slot.in_flight.remove(key);
        if let Some(reason) = reason {
            return CellStatus::Failed(CellFailure::from_outcome(outcome, reason));
        }
        let Some(result) = result else {
            return CellStatus::Failed(CellFailure::from_outcome(outcome, FailureReason::NoResult));
        };
        if let Err(e) = slot.store.put(key, result) {
            return CellStatus::Failed(CellFailure::from_outcome(outcome, FailureReason::Store(e.to_string())));
        }
        match slot.store.flush() {
            Ok(()) => CellStatus::Succeeded,
            Err(e) => {
                // Unpersisted results must not count as recorded, the cell is retried next run
                slot.store.remove(key);
                CellStatus::Failed(CellFailure::from_outcome(outcome, FailureReason::Store(e.to_string())))
            }
        }
    }

    fn write_summary(&self, policy: &str) -> Result<PolicySummary> {
        let slot = self
            .slots
            .get(policy)
            .ok_or_else(|| SweepError::Config(format!("no results store for policy {policy}")))?;
        let slot = lock(slot);
        let csv = slot.store.export(ExportFormat::Csv)?;
        let path = slot.store.path().with_file_name(format!("{policy}_summary.csv"));
        if let Err(e) = fs::write(&path, &csv) {
            warn!("Couldn't write summary {}: {e}", path.display());
        }
        Ok(PolicySummary {
            policy: policy.to_string(),
            path,
            csv,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking worker can't leave a slot half updated, flushes go through a temporary file
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
