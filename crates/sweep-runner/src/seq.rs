//! Sequential (feedback-driven) trials.
//!
//! Each iteration collects the objective of earlier completed trials and asks
//! a [`Suggest`] strategy for the next point. Until enough history exists the
//! point is drawn at random instead. Objectives are always minimized; a
//! `-name` objective is negated before it reaches the strategy.

use anyhow::Result;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde_json::Value;
use tracing::{debug, info};

use crate::batch::{BatchRunner, PrevTrialsMode};
use crate::config::DispatchMode;
use crate::error::SweepError;
use crate::flags::{flags_desc, Flags};
use crate::space::{flag_dims, Dimension, FlagDims, RandomState};

pub const RANDOM_STARTS_FLAG: &str = "random-starts";
pub const PREV_TRIALS_FLAG: &str = "prev-trials";

/// Strategy that proposes the next point from observed history.
///
/// `x0[i]` holds one value per dimension and `y0[i]` its objective, lower is
/// better. Both are non-empty. Implementations return the point with the
/// random state to use for the next call.
pub trait Suggest {
    fn name(&self) -> &str;

    fn suggest(
        &mut self,
        dims: &[Dimension],
        x0: &[Vec<Value>],
        y0: &[f64],
        state: RandomState,
    ) -> Result<(Vec<Value>, RandomState)>;
}

/// Ignores history.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSuggest;

impl Suggest for RandomSuggest {
    fn name(&self) -> &str {
        "random"
    }

    fn suggest(
        &mut self,
        dims: &[Dimension],
        _x0: &[Vec<Value>],
        _y0: &[f64],
        state: RandomState,
    ) -> Result<(Vec<Value>, RandomState)> {
        Ok(random_point(dims, state))
    }
}

/// Perturbs the best point seen so far. `scale` is the fraction of each
/// dimension's range used as the perturbation radius (log range for log
/// dimensions) and the chance of re-drawing a categorical value.
#[derive(Debug, Clone, Copy)]
pub struct LocalSearchSuggest {
    scale: f64,
}

impl Default for LocalSearchSuggest {
    fn default() -> Self {
        Self { scale: 0.1 }
    }
}

impl LocalSearchSuggest {
    pub fn new(scale: f64) -> Self {
        let scale = if scale.is_finite() && scale > 0.0 {
            scale.min(1.0)
        } else {
            Self::default().scale
        };
        Self { scale }
    }

    fn perturb(&self, dim: &Dimension, base: &Value, rng: &mut ChaCha8Rng) -> Value {
        let s = self.scale;
        match (dim, base.as_f64()) {
            (Dimension::Real { low, high, log: false }, Some(v)) => {
                dim.clamp(v + rng.gen_range(-s..s) * (high - low))
            }
            (Dimension::Real { low, high, log: true }, Some(v)) if v > 0.0 => {
                let noise = rng.gen_range(-s..s) * (high.ln() - low.ln());
                dim.clamp((v.ln() + noise).exp())
            }
            (Dimension::Integer { low, high }, Some(v)) => {
                let step = (((high - low) as f64) * s).ceil().max(1.0) as i64;
                dim.clamp(v + rng.gen_range(-step..=step) as f64)
            }
            (Dimension::Categorical(items), _) if items.contains(base) && !rng.gen_bool(s) => {
                base.clone()
            }
            _ => dim.sample(rng),
        }
    }
}

impl Suggest for LocalSearchSuggest {
    fn name(&self) -> &str {
        "local"
    }

    fn suggest(
        &mut self,
        dims: &[Dimension],
        x0: &[Vec<Value>],
        y0: &[f64],
        state: RandomState,
    ) -> Result<(Vec<Value>, RandomState)> {
        let best = y0
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .and_then(|(i, _)| x0.get(i));
        let Some(best) = best else {
            return Ok(random_point(dims, state));
        };
        let mut rng = state.rng();
        let x = dims
            .iter()
            .enumerate()
            .map(|(i, dim)| self.perturb(dim, best.get(i).unwrap_or(&Value::Null), &mut rng))
            .collect();
        Ok((x, RandomState::after(&mut rng)))
    }
}

/// Strategy for a sequential optimizer name, if `optimizer` names one.
pub fn suggester_for(optimizer: &str) -> Option<Box<dyn Suggest>> {
    match optimizer {
        "seq-random" => Some(Box::new(RandomSuggest)),
        "seq-local" => Some(Box::new(LocalSearchSuggest::default())),
        _ => None,
    }
}

/// One independent draw per dimension.
pub fn random_point(dims: &[Dimension], state: RandomState) -> (Vec<Value>, RandomState) {
    let mut rng = state.rng();
    let x = dims.iter().map(|dim| dim.sample(&mut rng)).collect();
    (x, RandomState::after(&mut rng))
}

/// Runs up to `max_trials` trials one at a time, each suggested from the
/// results of the trials before it.
pub fn run_seq_trials(
    batch: &BatchRunner,
    suggest: &mut dyn Suggest,
    mode: &DispatchMode,
) -> Result<()> {
    let unsupported = match mode {
        DispatchMode::PrintCommands => Some("printing trials command"),
        DispatchMode::PrintTrials => Some("printing trials"),
        DispatchMode::Save(_) => Some("saving trials"),
        DispatchMode::Run => None,
    };
    if let Some(what) = unsupported {
        return Err(SweepError::UnsupportedDispatch(what).into());
    }

    let proto_flags = batch.proto_flags()?;
    let batch_flags = batch.batch_flags()?;
    let max_trials = batch.max_trials()?;
    let random_starts = batch_flags
        .get(RANDOM_STARTS_FLAG)
        .and_then(Value::as_u64)
        .map(|n| (n as usize).min(max_trials))
        .unwrap_or(0);
    let prev_mode = match batch_flags.get(PREV_TRIALS_FLAG).and_then(Value::as_str) {
        Some(mode) => mode.parse()?,
        None => PrevTrialsMode::Batch,
    };
    let (objective, sign) = batch.objective_scalar()?;
    let dims = search_dims(&proto_flags)?;
    let mut state = RandomState::new(batch.random_seed()?);

    for runs_count in 0..max_trials {
        if batch.runner().shutdown().is_exiting() {
            break;
        }
        let prev = batch.trial_results(prev_mode, &[objective.as_str()])?;
        let history = trials_xy(&prev, &dims.names, sign);
        let random_start = history.is_none() || runs_count < random_starts;
        let (mut x, next_state) = match &history {
            Some((x0, y0)) if !random_start => {
                info!("Found {} previous trial(s) for use in optimization", prev.len());
                debug!("{} suggestion from {} point(s)", suggest.name(), x0.len());
                suggest.suggest(&dims.dims, x0, y0, state)?
            }
            _ => {
                let why = if runs_count < random_starts {
                    format!("{} of {}", runs_count + 1, random_starts)
                } else if prev.is_empty() {
                    "missing previous trials".to_string()
                } else {
                    format!("cannot find objective '{}'", objective)
                };
                info!("Random start for optimization ({})", why);
                random_point(&dims.dims, state)
            }
        };
        state = next_state;
        if runs_count == 0 {
            for (val, initial) in x.iter_mut().zip(&dims.initials) {
                if let Some(initial) = initial {
                    *val = initial.clone();
                }
            }
        }
        batch.run_trial(&trial_flags_for_x(&x, &dims.names, &proto_flags))?;
    }
    Ok(())
}

fn search_dims(flags: &Flags) -> Result<FlagDims> {
    let dims = flag_dims(flags)?;
    if dims.names.is_empty() {
        return Err(SweepError::MissingSearchDimension(flags_desc(flags)).into());
    }
    Ok(dims)
}

/// Points and signed objectives of trials that recorded the objective, or
/// `None` when no trial did.
fn trials_xy(
    prev: &[(Flags, Vec<Option<f64>>)],
    names: &[String],
    sign: f64,
) -> Option<(Vec<Vec<Value>>, Vec<f64>)> {
    let mut x0 = Vec::new();
    let mut y0 = Vec::new();
    for (flags, scalars) in prev {
        let Some(y) = scalars.first().copied().flatten() else {
            continue;
        };
        x0.push(
            names
                .iter()
                .map(|name| flags.get(name).cloned().unwrap_or(Value::Null))
                .collect(),
        );
        y0.push(sign * y);
    }
    if x0.is_empty() {
        None
    } else {
        Some((x0, y0))
    }
}

fn trial_flags_for_x(x: &[Value], names: &[String], proto_flags: &Flags) -> Flags {
    let mut flags = proto_flags.clone();
    for (name, val) in names.iter().zip(x) {
        flags.insert(name.clone(), val.clone());
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{init_batch, BatchSpec};
    use crate::config::Config;
    use crate::lock::MemoryLock;
    use crate::run::{runs_in, RunStore};
    use crate::shutdown::Shutdown;
    use crate::trial::{CommandLauncher, TrialRunner};
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    /// Echoes the `x` flag as the `loss` scalar unless `silent`.
    fn seq_batch(
        root: &Path,
        x: Value,
        objective: Option<&str>,
        random_starts: u64,
        silent: bool,
    ) -> BatchRunner {
        let script = if silent { "true" } else { r#"echo "loss: ${0#--x=}""# };
        let spec = BatchSpec {
            op: "train".to_string(),
            cmd: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            flags: [("x".to_string(), x)].into_iter().collect(),
            optimizer: "seq-local".to_string(),
            batch_flags: [(RANDOM_STARTS_FLAG.to_string(), json!(random_starts))]
                .into_iter()
                .collect(),
            max_trials: Some(4),
            random_seed: Some(7),
            objective: objective.map(str::to_string),
            ..BatchSpec::default()
        };
        let store = RunStore::new(root.join("runs"));
        let batch = init_batch(&store, &spec).expect("init batch");
        let runner = TrialRunner::new(
            Arc::new(CommandLauncher),
            Shutdown::new("batch", Duration::from_secs(5)),
        );
        let lock = Arc::new(MemoryLock::new("status", Duration::from_secs(5)));
        BatchRunner::new(store, batch, runner, lock, Config::with_home(root)).expect("batch runner")
    }

    /// Records the objectives it is shown and always proposes `next`.
    struct Recording {
        seen: Vec<Vec<f64>>,
        next: Value,
    }

    impl Suggest for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn suggest(
            &mut self,
            dims: &[Dimension],
            _x0: &[Vec<Value>],
            y0: &[f64],
            state: RandomState,
        ) -> Result<(Vec<Value>, RandomState)> {
            self.seen.push(y0.to_vec());
            Ok((vec![self.next.clone(); dims.len()], state))
        }
    }

    fn trial_xs(batch: &BatchRunner) -> Vec<Value> {
        runs_in(batch.batch().path())
            .expect("trials")
            .iter()
            .map(|run| run.flags().expect("flags")["x"].clone())
            .collect()
    }

    #[test]
    fn random_starts_then_suggestions_from_history() {
        let root = crate::test_dir("seq_history");
        let batch = seq_batch(&root, json!("[1:10:4]"), None, 2, false);
        let mut suggest = Recording { seen: Vec::new(), next: json!(5) };
        run_seq_trials(&batch, &mut suggest, &DispatchMode::Run).expect("seq trials");

        let xs = trial_xs(&batch);
        assert_eq!(xs.len(), 4);
        assert_eq!(xs[0], json!(4));
        assert_eq!(&xs[2..], &[json!(5), json!(5)]);
        assert_eq!(suggest.seen.len(), 2);
        assert_eq!(suggest.seen[0].len(), 2);
        assert_eq!(suggest.seen[0][0], 4.0);
        assert_eq!(suggest.seen[1].len(), 3);
        assert_eq!(suggest.seen[1][2], 5.0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn maximized_objective_is_negated() {
        let root = crate::test_dir("seq_negate");
        let batch = seq_batch(&root, json!("[1:10]"), Some("-loss"), 1, false);
        let mut suggest = Recording { seen: Vec::new(), next: json!(2) };
        run_seq_trials(&batch, &mut suggest, &DispatchMode::Run).expect("seq trials");
        assert_eq!(suggest.seen.len(), 3);
        assert!(suggest.seen[0][0] <= -1.0, "{:?}", suggest.seen);
        assert_eq!(suggest.seen[2][2], -2.0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_objective_falls_back_to_random() {
        let root = crate::test_dir("seq_noobjective");
        let batch = seq_batch(&root, json!("[0.1:0.9]"), None, 0, true);
        let mut suggest = Recording { seen: Vec::new(), next: json!(0.5) };
        run_seq_trials(&batch, &mut suggest, &DispatchMode::Run).expect("seq trials");
        assert!(suggest.seen.is_empty());
        for x in trial_xs(&batch) {
            let x = x.as_f64().expect("float");
            assert!((0.1..0.9).contains(&x), "{}", x);
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn rejects_preview_and_missing_dimensions() {
        let root = crate::test_dir("seq_errors");
        let batch = seq_batch(&root, json!([1, 2]), None, 0, false);
        let err = run_seq_trials(&batch, &mut RandomSuggest, &DispatchMode::PrintTrials)
            .expect_err("preview unsupported");
        assert_eq!(err.to_string(), "optimizer does not support printing trials");

        let root2 = crate::test_dir("seq_nodims");
        let batch = seq_batch(&root2, json!(3), None, 0, false);
        let err = run_seq_trials(&batch, &mut RandomSuggest, &DispatchMode::Run)
            .expect_err("no dims");
        assert!(matches!(
            err.downcast_ref::<SweepError>(),
            Some(SweepError::MissingSearchDimension(_))
        ));
        assert!(trial_xs(&batch).is_empty());
        let _ = fs::remove_dir_all(root);
        let _ = fs::remove_dir_all(root2);
    }

    #[test]
    fn local_search_perturbs_the_best_point() {
        let dims = vec![
            Dimension::Real { low: 0.0, high: 1.0, log: false },
            Dimension::Integer { low: 1, high: 100 },
            Dimension::Categorical(vec![json!("a"), json!("b")]),
        ];
        let x0 = vec![
            vec![json!(0.9), json!(90), json!("b")],
            vec![json!(0.2), json!(20), json!("a")],
        ];
        let y0 = [3.0, 1.0];
        let mut local = LocalSearchSuggest::new(0.05);
        let (x, next) = local.suggest(&dims, &x0, &y0, RandomState(11)).expect("suggest");
        let real = x[0].as_f64().expect("real");
        assert!((0.15..=0.25).contains(&real), "{}", real);
        let int = x[1].as_i64().expect("int");
        assert!((15..=25).contains(&int), "{}", int);
        assert_ne!(next, RandomState(11));

        let (again, _) = local.suggest(&dims, &x0, &y0, RandomState(11)).expect("again");
        assert_eq!(again, x);
    }

    #[test]
    fn random_points_follow_the_state_chain() {
        let dims = vec![Dimension::Integer { low: 0, high: 1_000_000 }];
        let (a, next) = random_point(&dims, RandomState(1));
        let (b, _) = random_point(&dims, RandomState(1));
        let (c, _) = random_point(&dims, next);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(suggester_for("seq-local").is_some());
        assert!(suggester_for("grid").is_none());
    }
}
