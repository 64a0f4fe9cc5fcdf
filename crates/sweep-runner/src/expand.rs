use anyhow::Result;
use rand::seq::index;
use serde_json::Value;

use crate::config::DEFAULT_MAX_TRIALS;
use crate::flags::Flags;
use crate::space::{FlagFunction, FlagValue, RandomState};

/// A trial whose flag functions have not been drawn yet.
type UnresolvedTrial = Vec<(String, FlagValue)>;

/// Expands `flags` into trials.
///
/// Lists contribute one candidate per item and the trials are their cartesian
/// product over flag names in sorted order, the last name varying fastest.
/// Flag functions, at the top level or as list items, are resolved once per
/// trial after the product is formed, in trial order, threading one random
/// state through every draw. A function's initial value, if any, is used for
/// its first resolution only.
pub fn expand_flags(flags: &Flags, seed: Option<u64>) -> Result<Vec<Flags>> {
    Ok(resolve_functions(expand_unresolved(flags)?, seed))
}

fn expand_unresolved(flags: &Flags) -> Result<Vec<UnresolvedTrial>> {
    let mut candidates: Vec<(&String, Vec<FlagValue>)> = Vec::with_capacity(flags.len());
    for (name, val) in flags {
        let items = match FlagValue::from_value(name, val)? {
            FlagValue::Literal(Value::Array(items)) => items
                .iter()
                .map(|item| FlagValue::from_value(name, item))
                .collect::<Result<Vec<_>>>()?,
            other => vec![other],
        };
        candidates.push((name, items));
    }
    let lens: Vec<usize> = candidates.iter().map(|(_, items)| items.len()).collect();
    Ok(cartesian_indices(&lens)
        .into_iter()
        .map(|combo| {
            candidates
                .iter()
                .zip(combo)
                .map(|((name, items), i)| ((*name).clone(), items[i].clone()))
                .collect()
        })
        .collect())
}

/// Draws every function in `trials`, in order, from one random state chain.
fn resolve_functions(trials: Vec<UnresolvedTrial>, seed: Option<u64>) -> Vec<Flags> {
    let mut state = RandomState::new(seed);
    let mut initials_used: Vec<FlagFunction> = Vec::new();
    trials
        .into_iter()
        .map(|trial| {
            trial
                .into_iter()
                .map(|(name, val)| {
                    let val = match val {
                        FlagValue::Literal(val) => val,
                        FlagValue::Function(f) => {
                            let initial =
                                f.initial.clone().filter(|_| !initials_used.contains(&f));
                            match initial {
                                Some(initial) => {
                                    initials_used.push(f);
                                    initial
                                }
                                None => {
                                    let (val, next) = f.sample(state);
                                    state = next;
                                    val
                                }
                            }
                        }
                    };
                    (name, val)
                })
                .collect()
        })
        .collect()
}

/// Index tuples of the product of lists with lengths `lens`, in odometer
/// order.
fn cartesian_indices(lens: &[usize]) -> Vec<Vec<usize>> {
    if lens.iter().any(|len| *len == 0) {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut current = vec![0usize; lens.len()];
    loop {
        out.push(current.clone());
        let mut pos = lens.len();
        loop {
            if pos == 0 {
                return out;
            }
            pos -= 1;
            current[pos] += 1;
            if current[pos] < lens[pos] {
                break;
            }
            current[pos] = 0;
        }
    }
}

/// Expands each explicit trial merged over `base`, with `user` overrides
/// applied last. Rows are concatenated in input order before any function is
/// drawn, so one random state runs through the whole list.
pub fn expand_trial_flags(
    trials: &[Flags],
    base: &Flags,
    user: &Flags,
    seed: Option<u64>,
) -> Result<Vec<Flags>> {
    let mut expanded = Vec::new();
    for trial in trials {
        let mut merged = base.clone();
        merged.extend(trial.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
        expanded.extend(expand_unresolved(&merged)?);
    }
    Ok(resolve_functions(expanded, seed))
}

/// Reduces `trials` to `count` entries chosen with `seed`, preserving their
/// original order. Lists at or under `count` are returned unchanged. A zero
/// `count` means [`DEFAULT_MAX_TRIALS`].
pub fn sample_trials(trials: Vec<Flags>, count: usize, seed: Option<u64>) -> Vec<Flags> {
    let count = if count == 0 { DEFAULT_MAX_TRIALS } else { count };
    if trials.len() <= count {
        return trials;
    }
    let mut rng = RandomState::new(seed).rng();
    let mut picked = index::sample(&mut rng, trials.len(), count).into_vec();
    picked.sort_unstable();
    let mut slots: Vec<Option<Flags>> = trials.into_iter().map(Some).collect();
    picked
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}
