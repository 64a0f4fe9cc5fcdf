use std::path::PathBuf;

use thiserror::Error;

/// Process exit codes used by batch and queue processes.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const DEFAULT_ERROR: i32 = 1;
    /// 128 + SIGINT
    pub const KEYBOARD_INTERRUPT: i32 = 130;
    /// 128 + SIGTERM
    pub const SIGTERM: i32 = 143;
}

/// Classified failures. These are raised wrapped in `anyhow::Error` and
/// recovered with `downcast_ref` where the caller needs the kind.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("unknown function '{name}' used for flag {flag}")]
    UnsupportedFunction { name: String, flag: String },

    #[error("invalid function args in '{flag}={value}': {msg}")]
    InvalidFunctionArgs {
        flag: String,
        value: String,
        msg: String,
    },

    #[error("unsupported extension in batch file '{}'", path.display())]
    UnsupportedBatchFile { path: PathBuf },

    #[error("unsupported value for prev_trials_mode: {0:?}")]
    InvalidPrevTrialsMode(String),

    #[error(
        "flags for batch ({0}) do not contain any search dimensions\n\
         Try specifying a range for one or more flags as NAME=[MIN:MAX]."
    )]
    MissingSearchDimension(String),

    #[error("invalid objective {0:?}")]
    InvalidObjective(String),

    #[error("cannot find runs for batch proto in {}: missing sourcecode digest", dir.display())]
    MissingSourcecodeDigest { dir: PathBuf },

    #[error("run {0} is not a batch (missing proto)")]
    NotBatch(String),

    #[error("optimizer does not support {0}")]
    UnsupportedDispatch(&'static str),

    #[error("could not acquire lock {}", path.display())]
    LockTimeout { path: PathBuf },

    #[error("batch stopped with exit code {code}")]
    BatchStopped { code: i32 },
}

/// Maps an error returned by a batch or queue entry point to the process exit
/// code it should produce.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<SweepError>() {
        Some(SweepError::BatchStopped { code }) => *code,
        _ => exit_code::DEFAULT_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_stopped_propagates_trial_code() {
        let err = anyhow::Error::new(SweepError::BatchStopped { code: 3 });
        assert_eq!(exit_code_for(&err), 3);
    }

    #[test]
    fn other_errors_use_default_code() {
        let err = anyhow::Error::new(SweepError::InvalidPrevTrialsMode("x".into()));
        assert_eq!(exit_code_for(&err), exit_code::DEFAULT_ERROR);
        let err = anyhow::anyhow!("boom");
        assert_eq!(exit_code_for(&err), exit_code::DEFAULT_ERROR);
    }

    #[test]
    fn invalid_args_message_names_flag_and_value() {
        let err = SweepError::InvalidFunctionArgs {
            flag: "lr".into(),
            value: "uniform[1:a]".into(),
            msg: "expected a number".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid function args in 'lr=uniform[1:a]': expected a number"
        );
    }
}
