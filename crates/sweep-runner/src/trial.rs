use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Number, Value};
use std::fs;
use std::io::{BufRead, BufReader, Write};
#[cfg(unix)]
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use crate::error::{exit_code, SweepError};
use crate::flags::{encode_flag_val, Flags};
use crate::run::{timestamp, Run};
use crate::shutdown::Shutdown;

/// Builds the command that executes a trial run.
pub trait Launcher: Send + Sync {
    fn command(&self, run: &Run) -> Result<Command>;
}

/// Runs the argv stored in the run's `cmd` attribute with one `--NAME=VALUE`
/// argument per non-null flag, from the run directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

impl Launcher for CommandLauncher {
    fn command(&self, run: &Run) -> Result<Command> {
        let base: Vec<String> = run
            .get("cmd")?
            .ok_or_else(|| anyhow!("run {} has no cmd attribute", run.id()))?;
        let argv = trial_argv(&base, &run.flags()?);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("run {} has an empty cmd", run.id()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(run.path())
            .env("RUN_ID", run.id())
            .env("RUN_DIR", run.path());
        Ok(cmd)
    }
}

/// `cmd` followed by one `--NAME=VALUE` argument per non-null flag.
pub fn trial_argv(cmd: &[String], flags: &Flags) -> Vec<String> {
    let mut argv = cmd.to_vec();
    for (name, val) in flags {
        if !val.is_null() {
            argv.push(format!("--{}={}", name, encode_flag_val(val)));
        }
    }
    argv
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialOutcome {
    Completed,
    /// Stopped by SIGTERM or SIGKILL.
    Terminated,
    /// Stopped by a keyboard interrupt.
    Interrupted,
    Error(i32),
}

impl TrialOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => TrialOutcome::Completed,
            Some(exit_code::SIGTERM) => TrialOutcome::Terminated,
            Some(exit_code::KEYBOARD_INTERRUPT) => TrialOutcome::Interrupted,
            Some(code) => TrialOutcome::Error(code),
            None => match signal_of(status) {
                Some(libc::SIGTERM) | Some(libc::SIGKILL) => TrialOutcome::Terminated,
                Some(libc::SIGINT) => TrialOutcome::Interrupted,
                Some(sig) => TrialOutcome::Error(128 + sig),
                None => TrialOutcome::Error(exit_code::DEFAULT_ERROR),
            },
        }
    }
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> Option<i32> {
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: ExitStatus) -> Option<i32> {
    None
}

/// Value recorded as a run's `exit_status`: the exit code, or the negated
/// signal number for signal deaths.
pub fn exit_status_value(status: ExitStatus) -> i32 {
    match (status.code(), signal_of(status)) {
        (Some(code), _) => code,
        (None, Some(sig)) => -sig,
        (None, None) => exit_code::DEFAULT_ERROR,
    }
}

/// Parses an output scalar line of the form `name: number`.
pub fn parse_scalar(line: &str) -> Option<(String, f64)> {
    let (key, val) = line.trim().split_once(':')?;
    let key = key.trim();
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return None;
    }
    let val: f64 = val.trim().parse().ok()?;
    val.is_finite().then(|| (key.to_string(), val))
}

/// A started trial whose process is supervised by a wait thread.
#[derive(Debug)]
pub struct RunningTrial {
    run: Run,
    handle: JoinHandle<Result<TrialOutcome>>,
}

impl RunningTrial {
    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn wait(self) -> Result<TrialOutcome> {
        self.handle
            .join()
            .map_err(|_| anyhow!("wait thread for run {} panicked", self.run.id()))?
    }
}

/// Starts trial runs as child processes and records their results.
#[derive(Clone)]
pub struct TrialRunner {
    launcher: Arc<dyn Launcher>,
    shutdown: Arc<Shutdown>,
}

impl TrialRunner {
    pub fn new(launcher: Arc<dyn Launcher>, shutdown: Arc<Shutdown>) -> Self {
        Self { launcher, shutdown }
    }

    pub fn shutdown(&self) -> &Arc<Shutdown> {
        &self.shutdown
    }

    /// Starts `run`. Starts are serialized within the process; the child leads
    /// its own process group so shutdown can stop its descendants with it.
    pub fn start(&self, run: &Run) -> Result<RunningTrial> {
        let _start = self.shutdown.start_guard();
        let mut cmd = self.launcher.command(run)?;
        let output = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(run.output_path())
            .with_context(|| format!("opening output for run {}", run.id()))?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(output.try_clone()?));
        #[cfg(unix)]
        cmd.process_group(0);

        run.set_started()?;
        let child = cmd
            .spawn()
            .with_context(|| format!("starting run {}", run.id()))?;
        let pid = child.id();
        run.write_lock(pid)?;
        run.clear_pending()?;
        run.clear_staged()?;
        self.shutdown.register(pid);
        debug!("started run {} (proc {})", run.id(), pid);

        let waited = run.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let handle = thread::Builder::new()
            .name(format!("trial-{}", run.short_id()))
            .spawn(move || supervise(&waited, child, output, &shutdown))?;
        Ok(RunningTrial {
            run: run.clone(),
            handle,
        })
    }

    /// Starts `run` and waits for it to exit.
    pub fn run(&self, run: &Run) -> Result<TrialOutcome> {
        self.start(run)?.wait()
    }
}

fn supervise(run: &Run, mut child: Child, mut output: fs::File, shutdown: &Shutdown) -> Result<TrialOutcome> {
    let mut scalars = Map::new();
    if let Some(stdout) = child.stdout.take() {
        let mut tee = std::io::stdout();
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            let _ = writeln!(output, "{}", line);
            let _ = writeln!(tee, "{}", line);
            if let Some((key, val)) = parse_scalar(&line) {
                if let Some(num) = Number::from_f64(val) {
                    scalars.insert(key, Value::Number(num));
                }
            }
        }
    }
    let status = child.wait();
    shutdown.unregister(child.id());
    let status = status.with_context(|| format!("waiting for run {}", run.id()))?;

    run.write_attr("exit_status", &exit_status_value(status))?;
    run.write_attr("stopped", &timestamp())?;
    if !scalars.is_empty() {
        run.write_attr("scalars", &scalars)?;
    }
    run.remove_lock()?;
    Ok(TrialOutcome::from_status(status))
}

/// Applies the batch's partial-failure policy to a finished trial.
///
/// Terminated trials are logged and the batch continues. A keyboard interrupt
/// stops the batch. Other failures stop it only when the batch run parameter
/// `fail_on_trial_error` is set.
pub fn handle_trial_outcome(batch: &Run, trial: &Run, outcome: TrialOutcome) -> Result<()> {
    match outcome {
        TrialOutcome::Completed => Ok(()),
        TrialOutcome::Terminated => {
            info!("Trial {} was terminated", trial.id());
            Ok(())
        }
        TrialOutcome::Interrupted => {
            info!("Stopping batch");
            Err(SweepError::BatchStopped {
                code: exit_code::KEYBOARD_INTERRUPT,
            }
            .into())
        }
        TrialOutcome::Error(code) => {
            error!(
                "Trial {} exited with an error ({}) - see log for details",
                trial.id(),
                code
            );
            if fail_on_trial_error(batch)? {
                error!("Stopping batch because a trial failed (pending trials can be started as needed)");
                return Err(SweepError::BatchStopped { code }.into());
            }
            Ok(())
        }
    }
}

pub fn fail_on_trial_error(batch: &Run) -> Result<bool> {
    Ok(batch
        .run_param("fail_on_trial_error")?
        .and_then(|v| v.as_bool())
        .unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunStatus, RunStore};
    use serde_json::json;
    use std::time::Duration;

    fn runner() -> TrialRunner {
        TrialRunner::new(
            Arc::new(CommandLauncher),
            Shutdown::new("batch", Duration::from_secs(5)),
        )
    }

    fn shell_run(store: &RunStore, script: &str) -> Run {
        let run = store.init_run(None).expect("init run");
        run.write_attr("cmd", &vec!["sh", "-c", script]).expect("cmd");
        run.set_pending().expect("pending");
        run
    }

    #[test]
    fn parses_scalar_lines() {
        assert_eq!(parse_scalar("loss: 0.25"), Some(("loss".to_string(), 0.25)));
        assert_eq!(parse_scalar("  acc:1"), Some(("acc".to_string(), 1.0)));
        assert_eq!(parse_scalar("epoch 1: 0.5"), None);
        assert_eq!(parse_scalar("msg: hello"), None);
        assert_eq!(parse_scalar("no colon"), None);
    }

    #[test]
    fn argv_appends_encoded_flags() {
        let mut flags = Flags::new();
        flags.insert("lr".into(), json!(0.1));
        flags.insert("name".into(), json!("123"));
        flags.insert("skip".into(), Value::Null);
        flags.insert("aug".into(), json!(true));
        let argv = trial_argv(&["python".to_string(), "train.py".to_string()], &flags);
        assert_eq!(
            argv,
            vec!["python", "train.py", "--aug=yes", "--lr=0.1", "--name='123'"]
        );
    }

    #[test]
    fn completed_trial_records_output_and_scalars() {
        let root = crate::test_dir("trial_ok");
        let store = RunStore::new(&root);
        let run = shell_run(&store, "echo hello; echo loss: 0.5; echo loss: 0.25; echo oops >&2");
        let mut flags = Flags::new();
        flags.insert("lr".into(), json!(0.1));
        run.write_attr("flags", &flags).expect("flags");

        let runner = runner();
        let outcome = runner.run(&run).expect("run trial");
        assert_eq!(outcome, TrialOutcome::Completed);
        assert_eq!(run.status(), RunStatus::Completed);
        assert_eq!(run.get::<i32>("exit_status").expect("exit"), Some(0));
        assert!(run.has_attr("started") && run.has_attr("stopped"));
        assert_eq!(run.pid(), None);
        let scalars: Map<String, Value> = run.get("scalars").expect("scalars").expect("some");
        assert_eq!(scalars["loss"], json!(0.25));
        let output = fs::read_to_string(run.output_path()).expect("output");
        assert!(output.contains("hello"));
        assert!(output.contains("oops"));
        assert!(runner.shutdown().children().is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn classifies_failures_and_signals() {
        let root = crate::test_dir("trial_fail");
        let store = RunStore::new(&root);
        let runner = runner();

        let failed = shell_run(&store, "exit 3");
        assert_eq!(runner.run(&failed).expect("run"), TrialOutcome::Error(3));
        assert_eq!(failed.status(), RunStatus::Error);

        let terminated = shell_run(&store, "kill -TERM $$");
        assert_eq!(runner.run(&terminated).expect("run"), TrialOutcome::Terminated);
        assert_eq!(terminated.get::<i32>("exit_status").expect("exit"), Some(-libc::SIGTERM));
        assert_eq!(terminated.status(), RunStatus::Terminated);

        let interrupted = shell_run(&store, "exit 130");
        assert_eq!(runner.run(&interrupted).expect("run"), TrialOutcome::Interrupted);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_cmd_is_an_error() {
        let root = crate::test_dir("trial_nocmd");
        let run = RunStore::new(&root).init_run(None).expect("init");
        assert!(runner().start(&run).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failure_policy_follows_run_params() {
        let root = crate::test_dir("trial_policy");
        let store = RunStore::new(&root);
        let batch = store.init_run(None).expect("batch");
        let trial = store.init_run(None).expect("trial");

        handle_trial_outcome(&batch, &trial, TrialOutcome::Error(2)).expect("tolerated");
        handle_trial_outcome(&batch, &trial, TrialOutcome::Terminated).expect("terminated");

        batch
            .write_attr("run_params", &json!({"fail_on_trial_error": true}))
            .expect("params");
        let err = handle_trial_outcome(&batch, &trial, TrialOutcome::Error(2)).expect_err("fatal");
        assert!(matches!(
            err.downcast_ref::<SweepError>(),
            Some(SweepError::BatchStopped { code: 2 })
        ));

        let err = handle_trial_outcome(&batch, &trial, TrialOutcome::Interrupted).expect_err("interrupt");
        assert_eq!(crate::error::exit_code_for(&err), exit_code::KEYBOARD_INTERRUPT);
        let _ = fs::remove_dir_all(root);
    }
}
