use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sweep_runner::batch::{init_batch, BatchSpec};
use sweep_runner::batch_file::read_all_trials;
use sweep_runner::lock::RUN_STATUS_LOCK;
use sweep_runner::queue::QUEUE_OP;
use sweep_runner::seq::{run_seq_trials, suggester_for};
use sweep_runner::{
    decode_flag_val, exit_code, exit_code_for, BatchRunner, CommandLauncher, Config,
    DispatchMode, FileLock, Flags, Queue, QueueConfig, Run, RunStore, Shutdown, StatusLock,
    TrialRunner, TrialsMode,
};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sweep", version, about = "Parameter sweeps and run queues")]
struct Cli {
    /// Log at debug level unless RUST_LOG is set.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OptimizerArg {
    #[value(name = "grid")]
    Grid,
    #[value(name = "random")]
    Random,
    #[value(name = "seq-random")]
    SeqRandom,
    #[value(name = "seq-local")]
    SeqLocal,
}

impl OptimizerArg {
    fn as_str(self) -> &'static str {
        match self {
            OptimizerArg::Grid => "grid",
            OptimizerArg::Random => "random",
            OptimizerArg::SeqRandom => "seq-random",
            OptimizerArg::SeqLocal => "seq-local",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a batch and run, stage, preview or save its trials.
    Batch {
        #[arg(long)]
        op: String,
        #[arg(long, value_enum, default_value = "grid")]
        optimizer: OptimizerArg,
        #[arg(long)]
        max_trials: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Scalar to minimize; prefix with '-' to maximize.
        #[arg(long)]
        objective: Option<String>,
        /// CSV, JSON or YAML file of explicit trials.
        #[arg(long = "batch-file")]
        batch_files: Vec<PathBuf>,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        sourcecode: Option<PathBuf>,
        #[arg(long)]
        gpus: Option<String>,
        #[arg(long)]
        stage_trials: bool,
        #[arg(long)]
        fail_on_trial_error: bool,
        /// Optimizer flag as NAME=VALUE (e.g. random-starts=3).
        #[arg(long = "opt")]
        opt_flags: Vec<String>,
        /// Trial flag as NAME=VALUE. Repeat for each flag.
        #[arg(long = "flag", short = 'f')]
        flags: Vec<String>,
        #[arg(long)]
        json: bool,
        /// Program and arguments run for each trial.
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
    /// Start staged runs as they become available.
    Queue {
        #[arg(long)]
        name: Option<String>,
        /// Seconds between polls; defaults to the configured interval.
        #[arg(long)]
        poll_interval: Option<u64>,
        #[arg(long)]
        run_once: bool,
        #[arg(long)]
        wait_for_running: bool,
        #[arg(long)]
        gpus: Option<String>,
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
    },
    /// Show the status of a run.
    Status {
        run: String,
        #[arg(long)]
        json: bool,
    },
    /// List runs, oldest first.
    Runs {
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let code = match run_command(cli.command) {
        Ok(Some(payload)) => {
            println!("{}", payload);
            exit_code::OK
        }
        Ok(None) => exit_code::OK,
        Err(err) => {
            error!("{:#}", err);
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    let config = Config::load()?;
    let store = RunStore::new(config.runs_dir());
    match command {
        Commands::Batch {
            op,
            optimizer,
            max_trials,
            seed,
            objective,
            batch_files,
            label,
            sourcecode,
            gpus,
            stage_trials,
            fail_on_trial_error,
            opt_flags,
            flags,
            json,
            cmd,
        } => {
            let (flags, user_flags) =
                trial_flag_layers(parse_flags(&flags)?, !batch_files.is_empty());
            let spec = BatchSpec {
                op,
                cmd,
                flags,
                trials: read_all_trials(&batch_files)?,
                user_flags,
                label_template: label,
                sourcecode,
                gpus,
                optimizer: optimizer.as_str().to_string(),
                batch_flags: parse_flags(&opt_flags)?,
                max_trials,
                random_seed: seed,
                objective,
                stage_trials,
                fail_on_trial_error,
            };
            let batch = init_batch(&store, &spec)?;
            batch.write_lock(std::process::id())?;
            let batch_id = batch.id().to_string();
            let shutdown = Shutdown::new("batch", config.trial_stop_timeout);
            shutdown.install()?;
            let runner = TrialRunner::new(Arc::new(CommandLauncher), shutdown);
            let lock = status_lock(&config);
            let runner = BatchRunner::new(store, batch, runner, lock, config)?;
            let result = dispatch_batch(&runner, optimizer, &DispatchMode::from_env());
            runner
                .batch()
                .write_attr("exit_status", &exit_status_for(&result))?;
            runner.batch().remove_lock()?;
            result?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "batch",
                    "batch_id": batch_id,
                    "batch_dir": runner.batch().path().display().to_string(),
                })));
            }
            println!("batch_id: {}", batch_id);
            Ok(None)
        }
        Commands::Queue {
            name,
            poll_interval,
            run_once,
            wait_for_running,
            gpus,
            concurrency,
        } => {
            let queue_run = store.init_run(None)?;
            queue_run.write_attr("op", QUEUE_OP)?;
            queue_run.write_lock(std::process::id())?;
            let name = name.unwrap_or_else(|| format!("queue-{}", queue_run.short_id()));
            let poll = poll_interval
                .map(Duration::from_secs)
                .unwrap_or(config.poll_interval);
            let mut queue_config = QueueConfig::new(name, poll);
            queue_config.run_once = run_once;
            queue_config.wait_for_running = wait_for_running;
            queue_config.gpus = gpus;
            queue_config.concurrency = concurrency.max(1);
            queue_config.self_run_id = Some(queue_run.id().to_string());

            let shutdown = Shutdown::new("queue", config.trial_stop_timeout);
            shutdown.install()?;
            let runner = TrialRunner::new(Arc::new(CommandLauncher), shutdown);
            let mut queue = Queue::new(store, status_lock(&config), runner, queue_config);
            let result = queue.run();
            queue_run.write_attr("exit_status", &exit_status_for(&result))?;
            queue_run.remove_lock()?;
            result.map(|_| None)
        }
        Commands::Status { run, json } => {
            let run = store.get(&run)?;
            if json {
                return Ok(Some(run_json(&run)?));
            }
            println!("{}", run.status());
            Ok(None)
        }
        Commands::Runs { json } => {
            let runs = store.runs()?;
            if json {
                let items = runs.iter().map(run_json).collect::<Result<Vec<_>>>()?;
                return Ok(Some(json!({ "ok": true, "runs": items })));
            }
            for run in &runs {
                let op = run.op()?.unwrap_or_default();
                let label: String = run.get_or("label", String::new())?;
                println!("{}  {:<10}  {:<12}  {}", run.short_id(), run.status().as_str(), op, label);
            }
            Ok(None)
        }
    }
}

fn dispatch_batch(
    runner: &BatchRunner,
    optimizer: OptimizerArg,
    mode: &DispatchMode,
) -> Result<()> {
    match optimizer {
        OptimizerArg::Grid => runner.handle_trials(&runner.batch_trials(TrialsMode::Grid)?, mode),
        OptimizerArg::Random => runner.handle_trials(&runner.batch_trials(TrialsMode::Random)?, mode),
        OptimizerArg::SeqRandom | OptimizerArg::SeqLocal => {
            let mut suggest = suggester_for(optimizer.as_str())
                .ok_or_else(|| anyhow!("unknown optimizer {}", optimizer.as_str()))?;
            run_seq_trials(runner, suggest.as_mut(), mode)
        }
    }
}

fn status_lock(config: &Config) -> Arc<dyn StatusLock> {
    Arc::new(FileLock::named(
        &config.locks_dir(),
        RUN_STATUS_LOCK,
        config.run_status_lock_timeout,
    ))
}

fn parse_flags(assigns: &[String]) -> Result<Flags> {
    assigns
        .iter()
        .map(|assign| {
            let (name, raw) = assign
                .split_once('=')
                .ok_or_else(|| anyhow!("invalid flag '{}': expected NAME=VALUE", assign))?;
            Ok((name.trim().to_string(), decode_flag_val(raw)))
        })
        .collect()
}

/// Base flags and overrides for a batch. Command-line flags also override
/// batch file rows.
fn trial_flag_layers(flags: Flags, has_batch_files: bool) -> (Flags, Flags) {
    if has_batch_files {
        (flags.clone(), flags)
    } else {
        (flags, Flags::new())
    }
}

fn exit_status_for(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => exit_code::OK,
        Err(err) => exit_code_for(err),
    }
}

fn run_json(run: &Run) -> Result<Value> {
    Ok(json!({
        "id": run.id(),
        "op": run.op()?,
        "status": run.status().as_str(),
        "label": run.get::<String>("label")?,
        "dir": run.path().display().to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flag_assigns() {
        let flags = parse_flags(&["lr=[0.1, 0.2]".to_string(), "opt=sgd".to_string()])
            .expect("flags");
        assert_eq!(flags["lr"], json!([0.1, 0.2]));
        assert_eq!(flags["opt"], json!("sgd"));
        assert!(parse_flags(&["novalue".to_string()]).is_err());
    }

    #[test]
    fn exit_status_reflects_result() {
        assert_eq!(exit_status_for(&Ok(())), exit_code::OK);
        let stopped = anyhow::Error::new(sweep_runner::SweepError::BatchStopped { code: 130 });
        assert_eq!(exit_status_for(&Err(stopped)), 130);
    }

    #[test]
    fn command_line_flags_override_batch_file_rows() {
        let parsed = parse_flags(&["lr=0.5".to_string()]).expect("flags");
        let (base, user) = trial_flag_layers(parsed.clone(), true);
        assert_eq!(base, parsed);
        assert_eq!(user, parsed);

        let rows = vec![[("lr".to_string(), json!(0.1))].into_iter().collect::<Flags>()];
        let trials = sweep_runner::expand::expand_trial_flags(&rows, &base, &user, Some(1))
            .expect("expand");
        assert_eq!(trials[0]["lr"], json!(0.5));

        let (base, user) = trial_flag_layers(parsed.clone(), false);
        assert_eq!(base, parsed);
        assert!(user.is_empty());
    }

    #[test]
    fn batch_command_parses_trailing_cmd() {
        let cli = Cli::try_parse_from([
            "sweep",
            "batch",
            "--op",
            "train",
            "-f",
            "x=[1:3]",
            "--optimizer",
            "random",
            "--",
            "python",
            "train.py",
        ])
        .expect("parse");
        match cli.command {
            Commands::Batch {
                op,
                cmd,
                flags,
                optimizer,
                ..
            } => {
                assert_eq!(op, "train");
                assert_eq!(cmd, vec!["python", "train.py"]);
                assert_eq!(flags, vec!["x=[1:3]"]);
                assert_eq!(optimizer.as_str(), "random");
            }
            _ => panic!("expected batch command"),
        }
    }
}
