use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;

use crate::error::SweepError;
use crate::flags::{decode_flag_val, Flags};

/// Reads explicit trials from a CSV, JSON or YAML batch file.
///
/// CSV files have a header row of flag names and one row per trial, with
/// values decoded as flag text. JSON and YAML files hold a list of flag maps.
pub fn read_trials(path: &Path) -> Result<Vec<Flags>> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("csv") => read_csv_trials(path),
        Some("json") => read_data_trials(path, |raw| Ok(serde_json::from_str(raw)?)),
        Some("yml") | Some("yaml") => read_data_trials(path, |raw| Ok(serde_yaml::from_str(raw)?)),
        _ => Err(SweepError::UnsupportedBatchFile {
            path: path.to_path_buf(),
        }
        .into()),
    }
}

/// Reads trials from every path, concatenated in order.
pub fn read_all_trials(paths: &[impl AsRef<Path>]) -> Result<Vec<Flags>> {
    let mut trials = Vec::new();
    for path in paths {
        trials.extend(read_trials(path.as_ref())?);
    }
    Ok(trials)
}

fn read_csv_trials(path: &Path) -> Result<Vec<Flags>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("opening batch file {}", path.display()))?;
    let names: Vec<String> = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect();
    let mut trials = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("reading {}", path.display()))?;
        let trial: Flags = names
            .iter()
            .zip(record.iter())
            .map(|(name, raw)| (name.clone(), decode_flag_val(raw)))
            .collect();
        trials.push(trial);
    }
    Ok(trials)
}

fn read_data_trials<F>(path: &Path, parse: F) -> Result<Vec<Flags>>
where
    F: Fn(&str) -> Result<Value>,
{
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading batch file {}", path.display()))?;
    let data = parse(&raw).with_context(|| format!("parsing batch file {}", path.display()))?;
    let items = match data {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        _ => {
            return Err(anyhow!(
                "invalid batch file {}: expected a list of flag maps",
                path.display()
            ))
        }
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(anyhow!(
                "invalid trial in {}: expected a map, got {}",
                path.display(),
                other
            )),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_csv_with_decoded_values() {
        let dir = crate::test_dir("batch_csv");
        let path = dir.join("trials.csv");
        fs::write(&path, "lr,opt,layers\n0.1,sgd,\"[1, 2]\"\n0.01,'1',3\n").expect("write csv");
        let trials = read_trials(&path).expect("read csv");
        assert_eq!(trials.len(), 2);
        assert_eq!(trials[0]["lr"], json!(0.1));
        assert_eq!(trials[0]["opt"], json!("sgd"));
        assert_eq!(trials[0]["layers"], json!([1, 2]));
        assert_eq!(trials[1]["opt"], json!("1"));
        assert_eq!(trials[1]["layers"], json!(3));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn reads_json_and_yaml_lists() {
        let dir = crate::test_dir("batch_data");
        let json_path = dir.join("trials.json");
        fs::write(&json_path, r#"[{"lr": 0.1}, {"lr": 0.2, "opt": "adam"}]"#).expect("json");
        let yaml_path = dir.join("trials.yml");
        fs::write(&yaml_path, "- lr: 0.3\n- lr: 0.4\n  opt: sgd\n").expect("yaml");

        let trials = read_all_trials(&[&json_path, &yaml_path]).expect("read");
        let lrs: Vec<f64> = trials.iter().map(|t| t["lr"].as_f64().expect("lr")).collect();
        assert_eq!(lrs, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(trials[3]["opt"], json!("sgd"));

        fs::write(&json_path, r#"{"lr": 0.1}"#).expect("rewrite json");
        assert!(read_trials(&json_path).is_err());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unsupported_extension_names_path() {
        let err = read_trials(Path::new("/tmp/trials.txt")).expect_err("unsupported");
        assert_eq!(
            err.to_string(),
            "unsupported extension in batch file '/tmp/trials.txt'"
        );
    }
}
