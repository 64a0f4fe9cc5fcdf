//! Search dimensions behind flag functions.
//!
//! A flag function such as `uniform[0.1:0.5]` or `loguniform[1e-5:1e-1:1e-3]`
//! names a [`Dimension`] and an optional initial value. Sampling is driven by
//! a [`RandomState`] that every draw consumes and returns, so a chain of draws
//! is reproducible from a single seed.

use anyhow::Result;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{Number, Value};

use crate::error::SweepError;
use crate::flags::{decode_flag_function, flag_function_text, flags_desc, Flags};

/// Seed for the next draw. Each draw returns the state to use after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomState(pub u64);

impl RandomState {
    /// Uses `seed` when given, otherwise a fresh seed from the thread rng.
    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => RandomState(seed),
            None => RandomState(rand::thread_rng().gen()),
        }
    }

    pub fn rng(self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.0)
    }

    /// State following the draws already taken from `rng`.
    pub fn after(rng: &mut ChaCha8Rng) -> Self {
        RandomState(rng.next_u64())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dimension {
    Integer { low: i64, high: i64 },
    Real { low: f64, high: f64, log: bool },
    Categorical(Vec<Value>),
}

impl Dimension {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Value {
        match self {
            Dimension::Integer { low, high } => Value::from(rng.gen_range(*low..=*high)),
            Dimension::Real { low, high, log: false } => float_value(rng.gen_range(*low..*high)),
            Dimension::Real { low, high, log: true } => {
                float_value(rng.gen_range(low.ln()..high.ln()).exp())
            }
            Dimension::Categorical(items) if items.is_empty() => Value::Null,
            Dimension::Categorical(items) => items[rng.gen_range(0..items.len())].clone(),
        }
    }

    /// Clamps a value into the dimension. Categorical values outside the
    /// category list are returned unchanged.
    pub fn clamp(&self, val: f64) -> Value {
        match self {
            Dimension::Integer { low, high } => {
                Value::from((val.round() as i64).clamp(*low, *high))
            }
            Dimension::Real { low, high, .. } => float_value(val.clamp(*low, *high)),
            Dimension::Categorical(_) => float_value(val),
        }
    }
}

fn float_value(x: f64) -> Value {
    Number::from_f64(x).map(Value::Number).unwrap_or(Value::Null)
}

/// A flag value resolved to a literal or a deferred draw.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagValue {
    Literal(Value),
    Function(FlagFunction),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlagFunction {
    pub flag: String,
    pub dim: Dimension,
    pub initial: Option<Value>,
}

impl FlagFunction {
    /// Draws a value, returning it with the state for the next draw.
    pub fn sample(&self, state: RandomState) -> (Value, RandomState) {
        let mut rng = state.rng();
        let val = self.dim.sample(&mut rng);
        (val, RandomState::after(&mut rng))
    }
}

impl FlagValue {
    /// Interprets `val` for flag `flag`. Strings in function syntax become
    /// functions; unsupported function names are configuration errors.
    pub fn from_value(flag: &str, val: &Value) -> Result<Self> {
        if let Value::String(s) = val {
            if let Ok((name, args)) = decode_flag_function(s) {
                let (dim, initial) = function_dim(name.as_deref(), &args, flag)?;
                return Ok(FlagValue::Function(FlagFunction {
                    flag: flag.to_string(),
                    dim,
                    initial,
                }));
            }
        }
        Ok(FlagValue::Literal(val.clone()))
    }
}

/// Maps a flag function to its dimension and initial value. An unnamed
/// function is `uniform`.
pub fn function_dim(
    name: Option<&str>,
    args: &[Value],
    flag: &str,
) -> Result<(Dimension, Option<Value>)> {
    let fn_name = name.unwrap_or("uniform");
    let log = match fn_name {
        "uniform" => false,
        "loguniform" => true,
        other => {
            return Err(SweepError::UnsupportedFunction {
                name: other.to_string(),
                flag: flag.to_string(),
            }
            .into())
        }
    };
    let invalid = |msg: String| SweepError::InvalidFunctionArgs {
        flag: flag.to_string(),
        value: flag_function_text(name, args),
        msg,
    };
    if args.len() != 2 && args.len() != 3 {
        return Err(invalid(format!("{} requires 2 or 3 args", fn_name)).into());
    }
    let initial = args.get(2).cloned();
    let dim = match (&args[0], &args[1]) {
        (Value::Number(lo), Value::Number(hi)) if !log && lo.is_i64() && hi.is_i64() => {
            let (low, high) = (lo.as_i64().unwrap_or_default(), hi.as_i64().unwrap_or_default());
            if low >= high {
                return Err(invalid(format!("lower bound {} must be less than {}", low, high)).into());
            }
            Dimension::Integer { low, high }
        }
        (Value::Number(lo), Value::Number(hi)) => {
            let (low, high) = (lo.as_f64().unwrap_or_default(), hi.as_f64().unwrap_or_default());
            if low >= high {
                return Err(invalid(format!("lower bound {} must be less than {}", low, high)).into());
            }
            if log && low <= 0.0 {
                return Err(invalid("loguniform bounds must be positive".to_string()).into());
            }
            Dimension::Real { low, high, log }
        }
        _ => return Err(invalid("bounds must be numbers".to_string()).into()),
    };
    Ok((dim, initial))
}

/// Search dimensions in `flags`, sorted by flag name. Lists become
/// categorical dimensions; literals are not dimensions.
pub struct FlagDims {
    pub names: Vec<String>,
    pub dims: Vec<Dimension>,
    pub initials: Vec<Option<Value>>,
}

pub fn flag_dims(flags: &Flags) -> Result<FlagDims> {
    let mut out = FlagDims {
        names: Vec::new(),
        dims: Vec::new(),
        initials: Vec::new(),
    };
    for (name, val) in flags {
        let (dim, initial) = match FlagValue::from_value(name, val)? {
            FlagValue::Function(f) => (f.dim, f.initial),
            FlagValue::Literal(Value::Array(items)) => (Dimension::Categorical(items), None),
            FlagValue::Literal(_) => continue,
        };
        out.names.push(name.clone());
        out.dims.push(dim);
        out.initials.push(initial);
    }
    Ok(out)
}

/// `count` trials drawn independently from every search dimension in `flags`.
/// The first trial uses any initial values.
pub fn random_trials_for_flags(
    flags: &Flags,
    count: usize,
    seed: Option<u64>,
) -> Result<Vec<Flags>> {
    let dims = flag_dims(flags)?;
    if dims.dims.is_empty() {
        return Err(SweepError::MissingSearchDimension(flags_desc(flags)).into());
    }
    let mut rng = RandomState::new(seed).rng();
    let mut trials = Vec::with_capacity(count);
    for i in 0..count {
        let mut trial = flags.clone();
        for ((name, dim), initial) in dims.names.iter().zip(&dims.dims).zip(&dims.initials) {
            let val = match initial {
                Some(initial) if i == 0 => initial.clone(),
                _ => dim.sample(&mut rng),
            };
            trial.insert(name.clone(), val);
        }
        trials.push(trial);
    }
    Ok(trials)
}
