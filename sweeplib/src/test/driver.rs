use std::collections::HashSet;
use std::error::Error;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use crate::config::{CacheSize, SizeUnit, SweepConfig, TraceType};
use crate::driver::{CellStatus, FailureReason, SweepDriver};
use crate::error::SweepError;
use crate::extract::{CellResult, MetricRecord};
use crate::invoke::{CellRunner, ExitState, RunOutcome};
use crate::plan::{plan, CellKey, SweepCell, SweepPlan};
use crate::store::ResultStore;
use crate::util::summary_line;
use super::{key, trace};

/// Pretends to be the simulator without starting any process
#[derive(Default)]
struct FakeRunner {
    calls: Mutex<Vec<CellKey>>,
    /// Cells of these sizes exit with code 2
    failing_sizes: HashSet<u64>,
    /// Cells of these sizes exit successfully but print no summary
    silent_sizes: HashSet<u64>,
}

impl FakeRunner {
    fn calls(&self) -> Vec<CellKey> {
        self.calls.lock().unwrap().clone()
    }
}

impl CellRunner for FakeRunner {
    fn run(&self, cell: &SweepCell) -> RunOutcome {
        self.calls.lock().unwrap().push(cell.key());
        let size = cell.cache_size.bytes();
        let mut outcome = RunOutcome {
            cell: cell.clone(),
            command_line: format!("cachesim {} {} {} {}", cell.trace.path.display(), cell.trace.trace_type, cell.policy, size),
            exit: ExitState::Success,
            stdout: String::new(),
            stderr: String::new(),
            structured: None,
        };
        if self.failing_sizes.contains(&size) {
            outcome.exit = ExitState::Failure(Some(2));
            outcome.stderr = "Segmentation fault\n".to_string();
        } else if self.silent_sizes.contains(&size) {
            outcome.stdout = "loading trace\n".to_string();
        } else {
            outcome.stdout = format!("loading trace\n{}\n", summary_line(&cell.policy, size, 1000, 0.5, 10.0));
        }
        outcome
    }
}

fn sweep_plan(policies: &[&str]) -> SweepPlan {
    let traces = vec![trace("a.csv", TraceType::Csv), trace("b.csv", TraceType::Csv)];
    let sizes: Vec<CacheSize> = [100, 200, 300].into_iter().map(|v| CacheSize::new(v, SizeUnit::Bytes)).collect();
    let policies: Vec<String> = policies.iter().map(|p| p.to_string()).collect();
    plan(&traces, &sizes, &policies)
}

fn stores(dir: &Path, policies: &[&str]) -> Result<Vec<ResultStore>, SweepError> {
    policies
        .iter()
        .map(|p| ResultStore::load(&dir.join(format!("{p}_results.json")), p, SizeUnit::Bytes))
        .collect()
}

#[test]
fn every_cell_runs_once_and_is_persisted() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let sweep = sweep_plan(&["ilru", "lhd"]);
    let driver = SweepDriver::new(FakeRunner::default(), stores(dir.path(), &["ilru", "lhd"])?, 1);
    let report = driver.run(&sweep, &AtomicBool::new(false))?;

    assert_eq!(report.succeeded, 12);
    assert_eq!(report.invoked(), 12);
    assert!(report.failures.is_empty());
    let calls = driver_calls(&driver);
    let expected: Vec<CellKey> = sweep.cells().iter().map(|c| c.key()).collect();
    assert_eq!(calls, expected);

    let on_disk = ResultStore::load(&dir.path().join("ilru_results.json"), "ilru", SizeUnit::Bytes)?;
    assert_eq!(on_disk.len(), 6);
    assert_eq!(
        on_disk.get(&key("a.csv", "ilru", 200)),
        Some(&CellResult::Metrics(MetricRecord::new(0.5, 10.0, Some(1000)).unwrap()))
    );
    Ok(())
}

fn driver_calls(driver: &SweepDriver<FakeRunner>) -> Vec<CellKey> {
    driver.runner().calls()
}

#[test]
fn second_run_invokes_nothing_and_changes_nothing() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let sweep = sweep_plan(&["ilru"]);
    let first = SweepDriver::new(FakeRunner::default(), stores(dir.path(), &["ilru"])?, 1);
    first.run(&sweep, &AtomicBool::new(false))?;
    let store_path = dir.path().join("ilru_results.json");
    let before = fs::read(&store_path)?;

    let second = SweepDriver::new(FakeRunner::default(), stores(dir.path(), &["ilru"])?, 1);
    let report = second.run(&sweep, &AtomicBool::new(false))?;
    assert_eq!(report.invoked(), 0);
    assert_eq!(report.skipped, sweep.len());
    assert!(driver_calls(&second).is_empty());
    assert_eq!(fs::read(&store_path)?, before);
    Ok(())
}

#[test]
fn only_missing_cells_are_run_on_resumption() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let sweep = sweep_plan(&["ilru"]);
    let mut partial = ResultStore::load(&dir.path().join("ilru_results.json"), "ilru", SizeUnit::Bytes)?;
    let recorded = CellResult::Raw("recorded earlier".to_string());
    for done in [key("a.csv", "ilru", 100), key("a.csv", "ilru", 300), key("b.csv", "ilru", 200)] {
        partial.put(&done, recorded.clone())?;
    }
    partial.flush()?;

    let driver = SweepDriver::new(FakeRunner::default(), stores(dir.path(), &["ilru"])?, 1);
    let report = driver.run(&sweep, &AtomicBool::new(false))?;
    assert_eq!(report.skipped, 3);
    assert_eq!(
        driver_calls(&driver),
        vec![key("a.csv", "ilru", 200), key("b.csv", "ilru", 100), key("b.csv", "ilru", 300)]
    );
    // Earlier results are left as they were
    let store = driver.store("ilru").unwrap();
    assert_eq!(store.get(&key("a.csv", "ilru", 100)), Some(&recorded));
    assert_eq!(store.len(), 6);
    Ok(())
}

#[test]
fn failing_cells_are_recorded_and_the_sweep_carries_on() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let sweep = sweep_plan(&["ilru"]);
    let runner = FakeRunner {
        failing_sizes: [200].into_iter().collect(),
        silent_sizes: [300].into_iter().collect(),
        ..FakeRunner::default()
    };
    let driver = SweepDriver::new(runner, stores(dir.path(), &["ilru"])?, 1);
    let report = driver.run(&sweep, &AtomicBool::new(false))?;

    assert_eq!(driver_calls(&driver).len(), 6);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failures.len(), 4);
    let crashed = report.failures.iter().find(|f| f.key == key("b.csv", "ilru", 200)).unwrap();
    assert_eq!(crashed.reason, FailureReason::Exit(Some(2)));
    assert_eq!(crashed.exit_code, Some(2));
    assert_eq!(crashed.stderr, "Segmentation fault\n");
    assert!(crashed.command_line.contains("ilru 200"));
    let silent = report.failures.iter().find(|f| f.key == key("a.csv", "ilru", 300)).unwrap();
    assert_eq!(silent.reason, FailureReason::NoResult);

    // Failed cells stay unrecorded so the next run retries them
    let store = driver.store("ilru").unwrap();
    assert!(!store.has(&key("b.csv", "ilru", 200)));
    assert!(!store.has(&key("a.csv", "ilru", 300)));
    assert!(store.has(&key("a.csv", "ilru", 100)));
    Ok(())
}

#[test]
fn summaries_are_written_for_what_succeeded() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let sweep = sweep_plan(&["ilru"]);
    let runner = FakeRunner { failing_sizes: [100, 300].into_iter().collect(), ..FakeRunner::default() };
    let driver = SweepDriver::new(runner, stores(dir.path(), &["ilru"])?, 1);
    let report = driver.run(&sweep, &AtomicBool::new(false))?;

    assert_eq!(report.summaries.len(), 1);
    let summary = &report.summaries[0];
    assert_eq!(summary.path, dir.path().join("ilru_summary.csv"));
    assert_eq!(fs::read_to_string(&summary.path)?, summary.csv);
    let lines: Vec<&str> = summary.csv.lines().collect();
    assert_eq!(lines, vec![
        "Trace,Cache Size (bytes),Miss Ratio,Throughput (MQPS)",
        "a.csv,200,0.5,10",
        "b.csv,200,0.5,10",
    ]);
    Ok(())
}

#[test]
fn a_stop_request_leaves_cells_unstarted() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let sweep = sweep_plan(&["ilru"]);
    let driver = SweepDriver::new(FakeRunner::default(), stores(dir.path(), &["ilru"])?, 1);
    let report = driver.run(&sweep, &AtomicBool::new(true))?;
    assert_eq!(report.interrupted, sweep.len());
    assert!(driver_calls(&driver).is_empty());
    assert_eq!(report.summaries.len(), 1);
    assert!(!dir.path().join("ilru_results.json").exists());
    Ok(())
}

/// Raises the stop flag once a number of cells have been run, like a SIGINT arriving mid-sweep
struct StoppingRunner {
    inner: FakeRunner,
    stop_after: usize,
    stop: Arc<AtomicBool>,
}

impl CellRunner for StoppingRunner {
    fn run(&self, cell: &SweepCell) -> RunOutcome {
        let outcome = self.inner.run(cell);
        if self.inner.calls().len() >= self.stop_after {
            self.stop.store(true, Ordering::SeqCst);
        }
        outcome
    }
}

#[test]
fn stopping_mid_sweep_keeps_what_finished() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let sweep = sweep_plan(&["ilru"]);
    let stop = Arc::new(AtomicBool::new(false));
    let runner = StoppingRunner { inner: FakeRunner::default(), stop_after: 2, stop: Arc::clone(&stop) };
    let driver = SweepDriver::new(runner, stores(dir.path(), &["ilru"])?, 1);
    let report = driver.run(&sweep, &stop)?;

    assert_eq!(report.succeeded, 2);
    assert_eq!(report.interrupted, 4);
    assert_eq!(driver.runner().inner.calls(), vec![key("a.csv", "ilru", 100), key("a.csv", "ilru", 200)]);
    let on_disk = ResultStore::load(&dir.path().join("ilru_results.json"), "ilru", SizeUnit::Bytes)?;
    assert_eq!(on_disk.len(), 2);
    assert!(on_disk.has(&key("a.csv", "ilru", 200)));
    assert!(!on_disk.has(&key("a.csv", "ilru", 300)));
    assert_eq!(report.summaries[0].csv.lines().count(), 3);

    // The next run only does what was left
    let resumed = SweepDriver::new(FakeRunner::default(), stores(dir.path(), &["ilru"])?, 1);
    let report = resumed.run(&sweep, &AtomicBool::new(false))?;
    assert_eq!(report.skipped, 2);
    assert_eq!(report.succeeded, 4);
    Ok(())
}

#[test]
fn results_which_cannot_be_written_are_not_kept() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    // A file where the results directory should be
    let blocker = dir.path().join("results");
    fs::write(&blocker, "")?;
    let store = ResultStore::new(blocker.join("ilru_results.json"), "ilru", SizeUnit::Bytes);
    let driver = SweepDriver::new(FakeRunner::default(), vec![store], 1);
    let report = driver.run(&sweep_plan(&["ilru"]), &AtomicBool::new(false))?;

    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failures.len(), 6);
    assert!(report.failures.iter().all(|f| matches!(f.reason, FailureReason::Store(_))));
    let store = driver.store("ilru").unwrap();
    assert!(store.is_empty());
    assert!(!store.has(&key("a.csv", "ilru", 100)));
    assert_eq!(report.summaries[0].csv.lines().count(), 1);
    Ok(())
}

#[test]
fn workers_share_the_store_without_repeating_cells() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let sweep = sweep_plan(&["ilru", "lhd", "arc"]);
    let driver = SweepDriver::new(FakeRunner::default(), stores(dir.path(), &["ilru", "lhd", "arc"])?, 4);
    let report = driver.run(&sweep, &AtomicBool::new(false))?;

    assert_eq!(report.succeeded, sweep.len());
    let calls = driver_calls(&driver);
    assert_eq!(calls.len(), sweep.len());
    assert_eq!(calls.iter().collect::<HashSet<_>>().len(), sweep.len());
    for policy in ["ilru", "lhd", "arc"] {
        let on_disk = ResultStore::load(&dir.path().join(format!("{policy}_results.json")), policy, SizeUnit::Bytes)?;
        assert_eq!(on_disk.len(), 6);
    }
    Ok(())
}

#[test]
fn empty_plans_are_a_no_op() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let driver = SweepDriver::new(FakeRunner::default(), stores(dir.path(), &["ilru"])?, 1);
    let report = driver.run(&SweepPlan::default(), &AtomicBool::new(false))?;
    assert_eq!(report.invoked(), 0);
    assert!(report.summaries.is_empty());
    Ok(())
}

#[test]
fn plans_need_a_store_for_every_policy() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let driver = SweepDriver::new(FakeRunner::default(), stores(dir.path(), &["ilru"])?, 1);
    let result = driver.run(&sweep_plan(&["ilru", "lhd"]), &AtomicBool::new(false));
    assert!(matches!(result, Err(SweepError::Config(_))));
    assert!(driver_calls(&driver).is_empty());
    Ok(())
}

#[test]
fn corrupt_results_stop_the_sweep_before_it_starts() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let config = SweepConfig {
        results_dir: dir.path().to_path_buf(),
        policies: vec!["ilru".to_string(), "lhd".to_string()],
        ..SweepConfig::default()
    };
    fs::write(config.store_path("lhd"), "{ not json")?;
    let result = SweepDriver::from_config(&config, FakeRunner::default());
    assert!(matches!(result, Err(SweepError::StoreCorrupt { .. })));
    Ok(())
}

#[test]
fn cell_statuses_compare_by_value() {
    assert_eq!(CellStatus::Skipped, CellStatus::Skipped);
    assert_ne!(CellStatus::Succeeded, CellStatus::Interrupted);
}

#[cfg(unix)]
mod process {
    use std::error::Error;
    use std::fs;
    use std::sync::atomic::AtomicBool;
    use crate::artifacts::collect;
    use crate::config::{CacheSize, OutputMode, SizeUnit, SweepConfig, TraceManifestEntry, TraceType};
    use crate::driver::{FailureReason, SweepDriver};
    use crate::extract::{extract, CellResult};
    use crate::invoke::{ExitState, RunInvoker};
    use crate::plan::{plan, SweepCell};
    use crate::store::ExportFormat;
    use crate::traces::{self, TraceDescriptor};
    use crate::util::{summary_line, synthetic_output, write_fake_simulator};

    const SUMMARISING: &str = r#"echo "$@" >> "$(dirname "$0")/calls.log"
echo "loading $1"
echo "$1 $3 cache size $4, 5000 req, miss ratio 0.375, throughput 12.5 MQPS""#;

    fn csv_cell(dir: &std::path::Path, bytes: u64) -> SweepCell {
        SweepCell {
            trace: TraceDescriptor::new(dir.join("trace.csv"), TraceType::Csv),
            policy: "ilru".to_string(),
            cache_size: CacheSize::new(bytes, SizeUnit::Bytes),
        }
    }

    #[test]
    fn stdout_is_captured_into_an_artifact() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let simulator = write_fake_simulator(dir.path(), "cachesim", SUMMARISING)?;
        let config = SweepConfig { results_dir: dir.path().to_path_buf(), ..SweepConfig::default() };
        let invoker = RunInvoker::new(simulator, &config);
        let cell = csv_cell(dir.path(), 1024);

        let outcome = invoker.invoke(&cell);
        assert_eq!(outcome.exit, ExitState::Success);
        assert!(outcome.stdout.contains("ilru cache size 1024"));
        let artifact = dir.path().join("trace.csv_ilru_1024.cachesim");
        assert_eq!(fs::read_to_string(artifact)?, outcome.stdout);
        let Some(CellResult::Metrics(record)) = extract(&outcome) else {
            panic!("no metrics in {:?}", outcome.stdout);
        };
        assert_eq!(record.miss_ratio, 0.375);
        assert_eq!(record.throughput_mqps, 12.5);
        assert!(fs::read_to_string(dir.path().join("calls.log"))?.contains("--num-thread=1 -t time-col=1"));
        Ok(())
    }

    #[test]
    fn failures_keep_their_diagnostics() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let simulator = write_fake_simulator(dir.path(), "cachesim", "echo \"boom: $1\" >&2\nexit 3")?;
        let config = SweepConfig { results_dir: dir.path().to_path_buf(), ..SweepConfig::default() };
        let outcome = RunInvoker::new(simulator, &config).invoke(&csv_cell(dir.path(), 1));
        assert_eq!(outcome.exit, ExitState::Failure(Some(3)));
        assert!(outcome.stderr.starts_with("boom: "));
        Ok(())
    }

    #[test]
    fn missing_executables_are_launch_errors() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let config = SweepConfig { results_dir: dir.path().to_path_buf(), ..SweepConfig::default() };
        let outcome = RunInvoker::new(dir.path().join("gone"), &config).invoke(&csv_cell(dir.path(), 1));
        assert!(matches!(outcome.exit, ExitState::LaunchError(_)));
        assert_eq!(extract(&outcome), None);
        assert!(!dir.path().join("trace.csv_ilru_1.cachesim").exists());
        Ok(())
    }

    #[test]
    fn structured_output_is_read_and_cleaned_up() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let body = r#"out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "-o" ]; then out="$arg"; fi
  prev="$arg"
done
printf '{"policy": "%s", "size": "%s"}\n' "$3" "$4" > "$out""#;
        let simulator = write_fake_simulator(dir.path(), "cachesim", body)?;
        let config = SweepConfig {
            results_dir: dir.path().to_path_buf(),
            output_mode: OutputMode::File,
            size_unit: SizeUnit::Megabytes,
            ..SweepConfig::default()
        };
        let invoker = RunInvoker::new(simulator, &config);
        let mut cell = csv_cell(dir.path(), 0);
        cell.policy = "LHD".to_string();
        cell.cache_size = CacheSize::new(10, SizeUnit::Megabytes);

        let outcome = invoker.invoke(&cell);
        assert_eq!(outcome.exit, ExitState::Success);
        assert_eq!(
            extract(&outcome),
            Some(CellResult::Raw(r#"{"policy": "LHD", "size": "10MB"}"#.to_string()))
        );
        assert!(!invoker.output_file(&cell).exists());
        Ok(())
    }

    #[test]
    fn configured_sweep_resumes_from_its_results_file() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        write_fake_simulator(dir.path(), "cachesim", SUMMARISING)?;
        fs::create_dir(dir.path().join("data"))?;
        fs::write(dir.path().join("data/a.csv"), "1,1,1\n")?;
        fs::write(dir.path().join("data/b.txt"), "1\n")?;
        fs::write(dir.path().join("data/readme.md"), "")?;
        let config_path = dir.path().join("sweep.json");
        fs::write(&config_path, r#"{"simulator": "./cachesim", "trace_dirs": ["data"], "cache_sizes": [1024, 2048]}"#)?;

        let run = || -> Result<_, Box<dyn Error>> {
            let config = SweepConfig::from_file(&config_path)?;
            let sweep = plan(&traces::from_config(&config)?, &config.sizes(), &config.policies);
            let driver = SweepDriver::from_config(&config, RunInvoker::from_config(&config)?)?;
            Ok(driver.run(&sweep, &AtomicBool::new(false))?)
        };
        let first = run()?;
        assert_eq!(first.succeeded, 4);
        let calls = fs::read_to_string(dir.path().join("calls.log"))?;
        assert_eq!(calls.lines().count(), 4);
        assert!(calls.lines().any(|l| l.ends_with("b.txt txt ilru 1024 --num-thread=1 --ignore-obj-size=true")));

        let second = run()?;
        assert_eq!(second.invoked(), 0);
        assert_eq!(fs::read_to_string(dir.path().join("calls.log"))?, calls);
        assert_eq!(second.summaries[0].csv.lines().count(), 5);
        Ok(())
    }

    #[test]
    fn failing_simulator_does_not_stop_the_sweep() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let body = r#"if [ "$4" = "2048" ]; then echo "out of memory" >&2; exit 1; fi
echo "$3 cache size $4, 10 req, miss ratio 0.5, throughput 1.0 MQPS""#;
        let simulator = write_fake_simulator(dir.path(), "cachesim", body)?;
        let config = SweepConfig {
            simulator,
            results_dir: dir.path().join("results"),
            traces: vec![TraceManifestEntry { path: dir.path().join("t.bin"), trace_type: TraceType::Bin, name: None }],
            cache_sizes: vec![1024, 2048, 4096],
            ..SweepConfig::default()
        };
        let sweep = plan(&traces::from_config(&config)?, &config.sizes(), &config.policies);
        let driver = SweepDriver::from_config(&config, RunInvoker::from_config(&config)?)?;
        let report = driver.run(&sweep, &AtomicBool::new(false))?;
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].reason, FailureReason::Exit(Some(1)));
        assert_eq!(report.failures[0].stderr, "out of memory\n");
        Ok(())
    }

    #[test]
    fn artifacts_can_be_collected_later() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("a.csv_ilru_10485760.cachesim"), synthetic_output("ilru", 10485760, 50))?;
        fs::write(dir.path().join("a.csv_ilru_5242880.cachesim"), format!("{}\n", summary_line("ilru", 5242880, 1, 0.75, 3.0)))?;
        fs::write(dir.path().join("b.csv_ilru_1024.cachesim"), "crashed before finishing\n")?;
        fs::write(dir.path().join("a.csv_lhd_1024.cachesim"), summary_line("lhd", 1024, 1, 0.5, 1.0))?;
        fs::write(dir.path().join("a.csv_ilru_10MB.cachesim"), summary_line("ilru", 10485760, 1, 0.5, 1.0))?;
        fs::write(dir.path().join("notes.txt"), "")?;

        let store = collect(dir.path(), "ilru", SizeUnit::Bytes)?;
        assert_eq!(store.len(), 2);
        let csv = store.export(ExportFormat::Csv)?;
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines, vec![
            "Trace,Cache Size (bytes),Miss Ratio,Throughput (MQPS)",
            "a.csv,5242880,0.75,3",
            "a.csv,10485760,0.1234,25.67",
        ]);
        assert_eq!(store.path(), dir.path().join("ilru_results.json"));
        assert!(!store.path().exists());
        Ok(())
    }
}
