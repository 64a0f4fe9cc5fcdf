use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::config::{Config, DispatchMode};
use crate::error::SweepError;
use crate::expand::{expand_flags, expand_trial_flags, sample_trials};
use crate::flags::{encode_flag_val, flags_desc, format_flag, render_label, Flags};
use crate::lock::StatusLock;
use crate::run::{init_run_at, new_run_id, runs_in, Run, RunStatus, RunStore, META_DIR};
use crate::space::random_trials_for_flags;
use crate::trial::{handle_trial_outcome, trial_argv, TrialRunner};
use crate::{atomic_write_bytes, copy_dir_filtered, ensure_dir, files_digest};

pub const BATCH_OP: &str = "batch";

/// How a batch turns its proto flags into trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrialsMode {
    /// Cartesian expansion, sampled down to `max_trials`.
    #[default]
    Grid,
    /// `max_trials` independent draws from every search dimension.
    Random,
}

/// Which earlier runs feed a sequential optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrevTrialsMode {
    /// Completed trials of this batch.
    #[default]
    Batch,
    /// Completed runs sharing the proto's source code digest.
    Sourcecode,
    /// Completed runs of the proto's operation.
    Operation,
}

impl FromStr for PrevTrialsMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "batch" => Ok(PrevTrialsMode::Batch),
            "sourcecode" => Ok(PrevTrialsMode::Sourcecode),
            "operation" => Ok(PrevTrialsMode::Operation),
            other => Err(SweepError::InvalidPrevTrialsMode(other.to_string()).into()),
        }
    }
}

/// Settings for a new batch and its proto run.
#[derive(Debug, Clone, Default)]
pub struct BatchSpec {
    /// Operation name recorded on the proto and every trial.
    pub op: String,
    /// Program argv; trial flags are appended as `--NAME=VALUE`.
    pub cmd: Vec<String>,
    pub flags: Flags,
    /// Explicit trials, merged over `flags` before expansion.
    pub trials: Vec<Flags>,
    /// Overrides applied over explicit trials.
    pub user_flags: Flags,
    pub label_template: Option<String>,
    /// Directory copied into the proto and hence into every trial.
    pub sourcecode: Option<PathBuf>,
    pub gpus: Option<String>,
    pub optimizer: String,
    /// Optimizer flags such as `random-starts` and `prev-trials`.
    pub batch_flags: Flags,
    pub max_trials: Option<usize>,
    pub random_seed: Option<u64>,
    pub objective: Option<String>,
    pub stage_trials: bool,
    pub fail_on_trial_error: bool,
}

/// Creates a batch run and its proto.
pub fn init_batch(store: &RunStore, spec: &BatchSpec) -> Result<Run> {
    let batch = store.init_run(None)?;
    batch.write_attr("op", BATCH_OP)?;
    batch.write_attr("optimizer", &spec.optimizer)?;
    batch.write_attr("flags", &spec.batch_flags)?;
    if let Some(max_trials) = spec.max_trials {
        batch.write_attr("max_trials", &max_trials)?;
    }
    if let Some(seed) = spec.random_seed {
        batch.write_attr("random_seed", &seed)?;
    }
    if let Some(objective) = &spec.objective {
        batch.write_attr("objective", objective)?;
    }
    batch.write_attr("stage_trials", &spec.stage_trials)?;
    batch.write_attr(
        "run_params",
        &json!({"fail_on_trial_error": spec.fail_on_trial_error}),
    )?;

    let proto = init_run_at(&format!("{}-proto", batch.id()), &batch.proto_path())?;
    if let Some(src) = &spec.sourcecode {
        copy_dir_filtered(src, proto.path(), &[META_DIR])
            .with_context(|| format!("copying source code from {}", src.display()))?;
        proto.write_attr("sourcecode_digest", &files_digest(src)?)?;
    }
    proto.write_attr("op", &spec.op)?;
    proto.write_attr("cmd", &spec.cmd)?;
    proto.write_attr("flags", &spec.flags)?;
    if !spec.trials.is_empty() {
        proto.write_attr("trials", &spec.trials)?;
    }
    if !spec.user_flags.is_empty() {
        proto.write_attr("user_flags", &spec.user_flags)?;
    }
    if let Some(template) = &spec.label_template {
        proto.write_attr("label_template", template)?;
    }
    proto.write_attr("run_params", &json!({"gpus": spec.gpus}))?;
    info!("Initialized batch {} ({})", batch.id(), spec.op);
    Ok(batch)
}

/// Drives the trials of one batch run.
pub struct BatchRunner {
    store: RunStore,
    batch: Run,
    proto: Run,
    runner: TrialRunner,
    lock: Arc<dyn StatusLock>,
    config: Config,
}

impl BatchRunner {
    pub fn new(
        store: RunStore,
        batch: Run,
        runner: TrialRunner,
        lock: Arc<dyn StatusLock>,
        config: Config,
    ) -> Result<Self> {
        let proto = batch
            .batch_proto()
            .ok_or_else(|| SweepError::NotBatch(batch.id().to_string()))?;
        Ok(Self {
            store,
            batch,
            proto,
            runner,
            lock,
            config,
        })
    }

    pub fn batch(&self) -> &Run {
        &self.batch
    }

    pub fn proto(&self) -> &Run {
        &self.proto
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn runner(&self) -> &TrialRunner {
        &self.runner
    }

    /// Attribute from the batch run, falling back to the proto.
    fn batch_attr<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.batch.get(name)? {
            Some(val) => Ok(Some(val)),
            None => self.proto.get(name),
        }
    }

    pub fn max_trials(&self) -> Result<usize> {
        Ok(self
            .batch_attr("max_trials")?
            .unwrap_or(self.config.default_max_trials))
    }

    pub fn random_seed(&self) -> Result<Option<u64>> {
        self.batch_attr("random_seed")
    }

    pub fn stage_trials(&self) -> Result<bool> {
        Ok(self.batch_attr("stage_trials")?.unwrap_or(false))
    }

    pub fn batch_flags(&self) -> Result<Flags> {
        self.batch.flags()
    }

    pub fn proto_flags(&self) -> Result<Flags> {
        self.proto.flags()
    }

    /// Proto flags, or the proto's explicit trials merged over them, expanded.
    pub fn expanded_batch_trials(&self) -> Result<Vec<Flags>> {
        let flags = self.proto_flags()?;
        let seed = self.random_seed()?;
        let trials: Vec<Flags> = self.proto.get_or("trials", Vec::new())?;
        if trials.is_empty() {
            return expand_flags(&flags, seed);
        }
        let user_flags: Flags = self.proto.get_or("user_flags", Flags::new())?;
        expand_trial_flags(&trials, &flags, &user_flags, seed)
    }

    pub fn batch_trials(&self, mode: TrialsMode) -> Result<Vec<Flags>> {
        let max_trials = self.max_trials()?;
        let seed = self.random_seed()?;
        match mode {
            TrialsMode::Grid => Ok(sample_trials(self.expanded_batch_trials()?, max_trials, seed)),
            TrialsMode::Random => random_trials_for_flags(&self.proto_flags()?, max_trials, seed),
        }
    }

    /// Materializes a trial from the proto: copies the proto tree, writes the
    /// trial's flags and label, links it under the batch run and marks it
    /// pending. `dir` defaults to a new directory in the run store.
    pub fn init_trial_run(&self, flags: &Flags, dir: Option<&Path>) -> Result<Run> {
        let id = new_run_id();
        let path = match dir {
            Some(dir) => dir.to_path_buf(),
            None => self.store.runs_dir().join(&id),
        };
        ensure_dir(&path)?;
        copy_dir_filtered(self.proto.path(), &path, &[])?;
        let trial = init_run_at(&id, &path)?;
        trial.del_attr("trials")?;
        trial.del_attr("user_flags")?;
        trial.write_attr("flags", flags)?;
        let template: Option<String> = self.proto.get("label_template")?;
        trial.write_attr("label", &render_label(template.as_deref(), flags))?;
        trial.write_attr("batch", self.batch.id())?;
        self.link_trial(&trial)?;
        trial.set_pending()?;
        trial.set_started()?;
        Ok(trial)
    }

    fn link_trial(&self, trial: &Run) -> Result<()> {
        let link = self.batch.path().join(trial.id());
        let target = relative_path(self.batch.path(), trial.path());
        if link.symlink_metadata().is_ok() {
            fs::remove_file(&link)?;
        }
        #[cfg(unix)]
        symlink(&target, &link)
            .with_context(|| format!("linking trial {} in batch {}", trial.id(), self.batch.id()))?;
        Ok(())
    }

    /// Materializes and runs a trial synchronously, applying the failure
    /// policy to its outcome.
    pub fn run_trial(&self, flags: &Flags) -> Result<Run> {
        let trial = self.init_trial_run(flags, None)?;
        self.start_trial(&trial)?;
        Ok(trial)
    }

    pub fn handle_trials(&self, trials: &[Flags], mode: &DispatchMode) -> Result<()> {
        match mode {
            DispatchMode::PrintCommands => self.print_trial_cmds(trials),
            DispatchMode::PrintTrials => {
                if !trials.is_empty() {
                    print!("{}", format_trials_table(trials));
                }
                Ok(())
            }
            DispatchMode::Save(path) => {
                info!("Saving {} trial(s) to {}", trials.len(), path.display());
                save_trials(trials, path)
            }
            DispatchMode::Run => self.run_trials(trials),
        }
    }

    fn print_trial_cmds(&self, trials: &[Flags]) -> Result<()> {
        let cmd: Vec<String> = self.proto.get_or("cmd", Vec::new())?;
        for trial in trials {
            println!("{}", shell_join(&trial_argv(&cmd, trial)));
        }
        Ok(())
    }

    /// Materializes every trial, then runs (or stages) them in order. Stops
    /// starting trials once shutdown has begun; the rest stay pending.
    pub fn run_trials(&self, trials: &[Flags]) -> Result<()> {
        let runs = trials
            .iter()
            .map(|flags| self.init_trial_run(flags, None))
            .collect::<Result<Vec<_>>>()?;
        for trial in &runs {
            if self.runner.shutdown().is_exiting() {
                break;
            }
            self.try_run_pending_trial(trial)?;
        }
        Ok(())
    }

    fn try_run_pending_trial(&self, trial: &Run) -> Result<()> {
        let stage = self.stage_trials()?;
        {
            // Queues claim staged runs under the same lock.
            let _guard = self.lock.acquire()?;
            let status = trial.status();
            if status != RunStatus::Pending {
                info!("Skipping {} because its status is {}", trial.id(), status);
                return Ok(());
            }
            if stage {
                self.log_trial_start(trial, "Staging")?;
                return trial.set_staged();
            }
        }
        self.start_trial(trial)
    }

    fn start_trial(&self, trial: &Run) -> Result<()> {
        self.log_trial_start(trial, "Running")?;
        let outcome = self.runner.run(trial)?;
        handle_trial_outcome(&self.batch, trial, outcome)
    }

    fn log_trial_start(&self, trial: &Run, action: &str) -> Result<()> {
        let flags: Flags = trial
            .flags()?
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .collect();
        let op: String = trial.get_or("op", String::new())?;
        info!("{} trial {}: {} ({})", action, trial.id(), op, flags_desc(&flags));
        Ok(())
    }

    /// `(name, sign)` of the objective; `sign` is -1 for a `-name` objective
    /// so that minimizing `sign * value` maximizes `name`.
    pub fn objective_scalar(&self) -> Result<(String, f64)> {
        let objective: String = self
            .batch_attr("objective")?
            .unwrap_or_else(|| self.config.default_objective.clone());
        parse_objective(&objective)
    }

    /// Completed runs that count as previous trials.
    pub fn trial_runs(&self, mode: PrevTrialsMode) -> Result<Vec<Run>> {
        let completed = |run: &Run| run.status() == RunStatus::Completed;
        match mode {
            PrevTrialsMode::Batch => Ok(runs_in(self.batch.path())?
                .into_iter()
                .filter(completed)
                .collect()),
            PrevTrialsMode::Sourcecode => {
                let digest: String = self.proto.get("sourcecode_digest")?.ok_or_else(|| {
                    SweepError::MissingSourcecodeDigest {
                        dir: self.proto.path().to_path_buf(),
                    }
                })?;
                let mut runs = Vec::new();
                for run in self.store.runs()? {
                    let run_digest: Option<String> = run.get("sourcecode_digest")?;
                    if completed(&run) && run_digest.as_deref() == Some(digest.as_str()) {
                        runs.push(run);
                    }
                }
                Ok(runs)
            }
            PrevTrialsMode::Operation => {
                let op = self.proto.op()?;
                let mut runs = Vec::new();
                for run in self.store.runs()? {
                    if completed(&run) && run.op()? == op {
                        runs.push(run);
                    }
                }
                Ok(runs)
            }
        }
    }

    /// Flags and the named output scalars of each previous trial.
    pub fn trial_results(
        &self,
        mode: PrevTrialsMode,
        scalars: &[&str],
    ) -> Result<Vec<(Flags, Vec<Option<f64>>)>> {
        self.trial_runs(mode)?
            .iter()
            .map(|run| {
                let vals = scalars
                    .iter()
                    .map(|name| run_scalar(run, name))
                    .collect::<Result<Vec<_>>>()?;
                Ok((run.flags()?, vals))
            })
            .collect()
    }
}

pub fn parse_objective(objective: &str) -> Result<(String, f64)> {
    let (name, sign) = match objective.strip_prefix('-') {
        Some(name) => (name, -1.0),
        None => (objective, 1.0),
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(SweepError::InvalidObjective(objective.to_string()).into());
    }
    Ok((name.to_string(), sign))
}

/// Last recorded value of output scalar `name`.
pub fn run_scalar(run: &Run, name: &str) -> Result<Option<f64>> {
    let scalars: Option<serde_json::Map<String, Value>> = run.get("scalars")?;
    Ok(scalars.and_then(|s| s.get(name).and_then(Value::as_f64)))
}

/// Header (`#` then every flag name) and rows of encoded values. Missing
/// values are blank.
pub fn trials_table(trials: &[Flags]) -> (Vec<String>, Vec<Vec<String>>) {
    let names: std::collections::BTreeSet<&String> = trials.iter().flat_map(|t| t.keys()).collect();
    let mut header = vec!["#".to_string()];
    header.extend(names.iter().map(|n| n.to_string()));
    let rows = trials
        .iter()
        .enumerate()
        .map(|(i, trial)| {
            let mut row = vec![(i + 1).to_string()];
            row.extend(names.iter().map(|name| {
                trial
                    .get(*name)
                    .map(|v| format_flag(v, None))
                    .unwrap_or_default()
            }));
            row
        })
        .collect();
    (header, rows)
}

pub fn format_trials_table(trials: &[Flags]) -> String {
    let (header, rows) = trials_table(trials);
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }
    let mut out = String::new();
    for row in std::iter::once(&header).chain(rows.iter()) {
        let line = row
            .iter()
            .zip(&widths)
            .map(|(cell, w)| format!("{:<width$}", cell, width = *w))
            .collect::<Vec<_>>()
            .join("  ");
        let _ = writeln!(out, "{}", line.trim_end());
    }
    out
}

/// Writes trials as JSON (native values) when `path` ends in `.json`, and as
/// CSV (header of flag names, encoded values) otherwise.
pub fn save_trials(trials: &[Flags], path: &Path) -> Result<()> {
    let is_json = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        let bytes = serde_json::to_vec(trials)?;
        return atomic_write_bytes(path, &bytes);
    }
    let names: std::collections::BTreeSet<&String> = trials.iter().flat_map(|t| t.keys()).collect();
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(names.iter().map(|n| n.as_str()))?;
    for trial in trials {
        writer.write_record(
            names
                .iter()
                .map(|name| trial.get(*name).map(encode_flag_val).unwrap_or_default()),
        )?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow!("writing trials csv: {}", e))?;
    atomic_write_bytes(path, &bytes)
}

fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            let plain = !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_=./:,+@%".contains(c));
            if plain {
                arg.clone()
            } else {
                format!("'{}'", arg.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Path to `target` relative to directory `from`. Both must be absolute or
/// both relative to the same base.
fn relative_path(from: &Path, target: &Path) -> PathBuf {
    let from: Vec<Component> = from.components().collect();
    let target: Vec<Component> = target.components().collect();
    let common = from
        .iter()
        .zip(&target)
        .take_while(|(a, b)| a == b)
        .count();
    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for part in &target[common..] {
        rel.push(part.as_os_str());
    }
    rel
}
