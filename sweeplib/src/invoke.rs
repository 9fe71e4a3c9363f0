use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;
use crate::artifacts::{artifact_path, structured_output_path};
use crate::config::{OutputMode, SweepConfig, TraceOptions, TraceType};
use crate::error::{Result, SweepError};
use crate::io::read_lossy;
use crate::plan::SweepCell;

/// How a simulator run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitState {
    Success,
    /// Non-zero exit. The code is absent if the process was killed by a signal
    Failure(Option<i32>),
    /// The process couldn't be started, or its output couldn't be set up or read back
    LaunchError(String),
}

/// Everything captured from one simulator run
///
/// Produced by a [CellRunner], consumed by the extractor and then dropped
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub cell: SweepCell,
    /// The command as it would be typed into a shell, for diagnostics
    pub command_line: String,
    pub exit: ExitState,
    pub stdout: String,
    pub stderr: String,
    /// Contents of the `-o` file in file output mode
    pub structured: Option<String>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit == ExitState::Success
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.exit {
            ExitState::Success => Some(0),
            ExitState::Failure(code) => code,
            ExitState::LaunchError(_) => None,
        }
    }
}

/// Runs the simulator for a sweep cell
///
/// Implementations must not fail: anything that goes wrong is reported in the returned outcome so
/// the sweep can carry on with the next cell
pub trait CellRunner: Sync {
    fn run(&self, cell: &SweepCell) -> RunOutcome;
}

/// Builds and executes simulator commands
#[derive(Debug, Clone)]
pub struct RunInvoker {
    simulator: PathBuf,
    output_mode: OutputMode,
    num_threads: Option<u32>,
    results_dir: PathBuf,
    trace_options: BTreeMap<TraceType, TraceOptions>,
}

impl RunInvoker {
    /// Creates an invoker for an already located simulator
    pub fn new(simulator: PathBuf, config: &SweepConfig) -> Self {
        Self {
            simulator,
            output_mode: config.output_mode,
            num_threads: config.num_threads,
            results_dir: config.results_dir.clone(),
            trace_options: config.trace_options.clone(),
        }
    }

    /// Locates the configured simulator and makes sure the results directory exists
    pub fn from_config(config: &SweepConfig) -> Result<Self> {
        let simulator = locate_simulator(&config.simulator)?;
        fs::create_dir_all(&config.results_dir).map_err(|e| SweepError::io(&config.results_dir, e))?;
        Ok(Self::new(simulator, config))
    }

    /// The simulator arguments for a cell
    ///
    /// Positional arguments come first (trace path, trace type, policy, cache size), followed by
    /// `--num-thread`, `-o` in file output mode, and the trace type's size or column flags
    ///
    /// # Arguments
    ///
    /// * `cell`: The cell to build arguments for
    ///
    /// returns: Vec<OsString>
    pub fn arguments(&self, cell: &SweepCell) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            cell.trace.path.clone().into_os_string(),
            cell.trace.trace_type.as_str().into(),
            cell.policy.clone().into(),
            cell.cache_size.argument().into(),
        ];
        if let Some(threads) = self.num_threads {
            args.push(format!("--num-thread={threads}").into());
        }
        if self.output_mode == OutputMode::File {
            args.push("-o".into());
            args.push(self.output_file(cell).into_os_string());
        }
        if let Some(options) = self.trace_options.get(&cell.trace.trace_type) {
            if options.ignore_obj_size {
                args.push("--ignore-obj-size=true".into());
            }
            if let Some(spec) = &options.column_spec {
                args.push("-t".into());
                args.push(spec.to_string().into());
            }
        }
        args
    }

    pub fn command(&self, cell: &SweepCell) -> Command {
        let mut cmd = Command::new(&self.simulator);
        cmd.args(self.arguments(cell));
        cmd.stdin(Stdio::null());
        cmd
    }

    /// The artifact stdout is redirected to in stdout mode
    pub fn artifact(&self, cell: &SweepCell) -> PathBuf {
        artifact_path(&self.results_dir, cell)
    }

    /// The file named by `-o` in file output mode
    pub fn output_file(&self, cell: &SweepCell) -> PathBuf {
        structured_output_path(&self.results_dir, cell)
    }

    /// Runs the simulator for one cell and captures the result
    ///
    /// Never fails; launch errors and non-zero exits are recorded in the outcome
    pub fn invoke(&self, cell: &SweepCell) -> RunOutcome {
        let mut cmd = self.command(cell);
        let mut outcome = RunOutcome {
            cell: cell.clone(),
            command_line: command_line(&cmd),
            exit: ExitState::Success,
            stdout: String::new(),
            stderr: String::new(),
            structured: None,
        };
        match self.output_mode {
            OutputMode::Stdout => self.run_capturing_stdout(&mut cmd, &mut outcome),
            OutputMode::File => self.run_with_output_file(&mut cmd, &mut outcome),
        }
        outcome
    }

    fn run_capturing_stdout(&self, cmd: &mut Command, outcome: &mut RunOutcome) {
        let artifact = self.artifact(&outcome.cell);
        let file = match File::create(&artifact) {
            Ok(file) => file,
            Err(e) => {
                outcome.exit = ExitState::LaunchError(format!("couldn't create {}: {e}", artifact.display()));
                return;
            }
        };
        cmd.stdout(Stdio::from(file)).stderr(Stdio::piped());
        if !spawn_and_wait(cmd, outcome) {
            // Nothing ran, an empty artifact would only confuse later collection
            if let Err(e) = fs::remove_file(&artifact) {
                debug!("Couldn't remove {}: {e}", artifact.display());
            }
            return;
        }
        match read_lossy(&artifact) {
            Ok(text) => outcome.stdout = text,
            Err(e) => {
                if outcome.succeeded() {
                    outcome.exit = ExitState::LaunchError(e.to_string());
                }
            }
        }
    }

    fn run_with_output_file(&self, cmd: &mut Command, outcome: &mut RunOutcome) {
        let output_file = self.output_file(&outcome.cell);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        if !spawn_and_wait(cmd, outcome) {
            return;
        }
        if output_file.exists() {
            match read_lossy(&output_file) {
                Ok(text) => outcome.structured = Some(text),
                Err(e) => debug!("Couldn't read {}: {e}", output_file.display()),
            }
            if let Err(e) = fs::remove_file(&output_file) {
                debug!("Couldn't remove {}: {e}", output_file.display());
            }
        }
    }
}

impl CellRunner for RunInvoker {
    fn run(&self, cell: &SweepCell) -> RunOutcome {
        self.invoke(cell)
    }
}

/// Runs the command to completion, recording its exit state and captured streams. Returns false if
/// it couldn't be started
fn spawn_and_wait(cmd: &mut Command, outcome: &mut RunOutcome) -> bool {
    let output = match cmd.output() {
        Ok(output) => output,
        Err(e) => {
            outcome.exit = ExitState::LaunchError(format!("couldn't start {}: {e}", outcome.command_line));
            return false;
        }
    };
    outcome.stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    outcome.stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        outcome.exit = ExitState::Failure(output.status.code());
    }
    true
}

/// Renders a command as a shell command line, quoting arguments where needed
pub fn command_line(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|arg| {
            let arg = arg.to_string_lossy();
            let plain = !arg.is_empty()
                && arg.chars().all(|c| c.is_ascii_alphanumeric() || "-_=.,/:+@%".contains(c));
            if plain {
                arg.into_owned()
            } else {
                format!("'{}'", arg.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Finds the simulator executable
///
/// Paths with more than one component are used as they are, bare names are searched for on `PATH`.
/// Either way the file has to be executable
///
/// # Arguments
///
/// * `simulator`: The configured simulator path or name
///
/// returns: Result<PathBuf, SweepError>
pub fn locate_simulator(simulator: &Path) -> Result<PathBuf> {
    match which::which(simulator) {
        Ok(found) => {
            debug!("Using simulator {}", found.display());
            Ok(found)
        }
        Err(e) => {
            debug!("Couldn't locate {}: {e}", simulator.display());
            Err(SweepError::SimulatorNotFound(simulator.to_path_buf()))
        }
    }
}
