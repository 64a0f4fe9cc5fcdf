use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use ulid::Ulid;

use crate::flags::Flags;
use crate::{atomic_write_bytes, copy_dir_filtered, ensure_dir};

/// Reserved subdirectory of every run.
pub const META_DIR: &str = ".sweep";
pub const ATTRS_DIR: &str = "attrs";
pub const PROTO_DIR: &str = "proto";
pub const OUTPUT_FILE: &str = "output";

pub const PENDING_MARKER: &str = "PENDING";
pub const STAGED_MARKER: &str = "STAGED";
pub const LOCK_MARKER: &str = "LOCK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Pending,
    Staged,
    Running,
    Completed,
    Terminated,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Staged => "staged",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Terminated => "terminated",
            RunStatus::Error => "error",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Microseconds since the epoch, strictly increasing within this process.
pub fn timestamp() -> i64 {
    let now = Utc::now().timestamp_micros();
    let prev = LAST_TIMESTAMP
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    now.max(prev + 1)
}

pub fn new_run_id() -> String {
    Ulid::new().to_string().to_lowercase()
}

pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // SAFETY: signal 0 performs error checking only.
        let result = unsafe { libc::kill(pid, 0) };
        if result == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// A run directory and its attributes.
///
/// Attributes are YAML documents stored one per file under
/// `.sweep/attrs/<name>`. Status is derived from marker files in `.sweep`
/// plus the `exit_status` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    id: String,
    path: PathBuf,
}

impl Run {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    /// Run at `path`, identified by its directory name.
    pub fn at(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let id = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("invalid run dir: {}", path.display()))?
            .to_string();
        Ok(Self { id, path })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn short_id(&self) -> &str {
        let end = self.id.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.id.len());
        &self.id[..end]
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta_path(&self, name: &str) -> PathBuf {
        self.path.join(META_DIR).join(name)
    }

    fn attr_path(&self, name: &str) -> PathBuf {
        self.meta_path(ATTRS_DIR).join(name)
    }

    pub fn output_path(&self) -> PathBuf {
        self.meta_path(OUTPUT_FILE)
    }

    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.attr_path(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let val = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing attr {} of run {}", name, self.id))?;
        Ok(Some(val))
    }

    pub fn get_or<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T> {
        Ok(self.get(name)?.unwrap_or(default))
    }

    pub fn write_attr<T: Serialize + ?Sized>(&self, name: &str, val: &T) -> Result<()> {
        let encoded = serde_yaml::to_string(val)?;
        atomic_write_bytes(&self.attr_path(name), encoded.as_bytes())
    }

    pub fn del_attr(&self, name: &str) -> Result<()> {
        remove_if_exists(&self.attr_path(name))
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr_path(name).exists()
    }

    pub fn flags(&self) -> Result<Flags> {
        self.get_or("flags", Flags::new())
    }

    pub fn op(&self) -> Result<Option<String>> {
        self.get("op")
    }

    /// Run parameter `name` from the `run_params` attribute.
    pub fn run_param(&self, name: &str) -> Result<Option<Value>> {
        let params: Option<serde_json::Map<String, Value>> = self.get("run_params")?;
        Ok(params.and_then(|mut p| p.remove(name)))
    }

    pub fn timestamp(&self) -> Result<Option<i64>> {
        self.get("initialized")
    }

    pub fn status(&self) -> RunStatus {
        if self.meta_path(PENDING_MARKER).exists() {
            return RunStatus::Pending;
        }
        if self.meta_path(STAGED_MARKER).exists() {
            return RunStatus::Staged;
        }
        match self.get::<i32>("exit_status") {
            Ok(Some(0)) => return RunStatus::Completed,
            Ok(Some(code)) if code < 0 => return RunStatus::Terminated,
            Ok(Some(_)) => return RunStatus::Error,
            Ok(None) | Err(_) => {}
        }
        match self.pid() {
            Some(pid) if pid_alive(pid) => RunStatus::Running,
            _ => RunStatus::Error,
        }
    }

    /// Pid recorded in the run's lock file.
    pub fn pid(&self) -> Option<u32> {
        fs::read_to_string(self.meta_path(LOCK_MARKER))
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
    }

    pub fn write_lock(&self, pid: u32) -> Result<()> {
        atomic_write_bytes(&self.meta_path(LOCK_MARKER), pid.to_string().as_bytes())
    }

    pub fn remove_lock(&self) -> Result<()> {
        remove_if_exists(&self.meta_path(LOCK_MARKER))
    }

    pub fn set_pending(&self) -> Result<()> {
        self.swap_marker(STAGED_MARKER, PENDING_MARKER)
    }

    pub fn set_staged(&self) -> Result<()> {
        self.write_attr("started", &timestamp())?;
        self.swap_marker(PENDING_MARKER, STAGED_MARKER)
    }

    /// Replaces marker `from` with `to` in one rename, so readers never see
    /// both.
    fn swap_marker(&self, from: &str, to: &str) -> Result<()> {
        let to = self.meta_path(to);
        match fs::rename(self.meta_path(from), &to) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => touch(&to),
            Err(e) => Err(e).with_context(|| format!("setting marker {}", to.display())),
        }
    }

    pub fn set_started(&self) -> Result<()> {
        self.write_attr("started", &timestamp())
    }

    pub fn clear_pending(&self) -> Result<()> {
        remove_if_exists(&self.meta_path(PENDING_MARKER))
    }

    pub fn clear_staged(&self) -> Result<()> {
        remove_if_exists(&self.meta_path(STAGED_MARKER))
    }

    pub fn proto_path(&self) -> PathBuf {
        self.meta_path(PROTO_DIR)
    }

    /// The prototype run held by a batch run, if any.
    pub fn batch_proto(&self) -> Option<Run> {
        let path = self.proto_path();
        if path.is_dir() {
            Some(Run::new(format!("{}-proto", self.id), path))
        } else {
            None
        }
    }
}

fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

/// Initializes a run at `path`: creates the reserved directories and writes
/// the `id` and `initialized` attributes.
pub fn init_run_at(id: &str, path: &Path) -> Result<Run> {
    let run = Run::new(id, path);
    ensure_dir(&run.meta_path(ATTRS_DIR))?;
    run.write_attr("id", id)?;
    run.write_attr("initialized", &timestamp())?;
    Ok(run)
}

/// Copies the contents of `src` into `dst`, including run metadata.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    copy_dir_filtered(src, dst, &[])
}

/// Runs whose directories are entries of `dir`. Symlinked entries are
/// followed so a batch run's trial links resolve to their runs.
pub fn runs_in(dir: &Path) -> Result<Vec<Run>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
    };
    let mut runs = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.join(META_DIR).is_dir() {
            continue;
        }
        let path = if entry.file_type()?.is_symlink() {
            fs::canonicalize(&path)?
        } else {
            path
        };
        let id = entry.file_name().to_string_lossy().to_string();
        runs.push(Run::new(id, path));
    }
    sort_by_timestamp(&mut runs);
    Ok(runs)
}

fn sort_by_timestamp(runs: &mut [Run]) {
    runs.sort_by_cached_key(|run| (run.timestamp().ok().flatten().unwrap_or(0), run.id.clone()));
}

/// Flat directory of runs keyed by id.
#[derive(Debug, Clone)]
pub struct RunStore {
    runs_dir: PathBuf,
}

impl RunStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Creates a run, allocating an id when `id` is `None`.
    pub fn init_run(&self, id: Option<&str>) -> Result<Run> {
        let id = id.map(str::to_string).unwrap_or_else(new_run_id);
        let path = self.runs_dir.join(&id);
        if path.exists() {
            return Err(anyhow!("run {} already exists", id));
        }
        init_run_at(&id, &path)
    }

    /// Run with id `id` or a unique id prefix.
    pub fn get(&self, id: &str) -> Result<Run> {
        let exact = self.runs_dir.join(id);
        if exact.join(META_DIR).is_dir() {
            return Ok(Run::new(id, exact));
        }
        let mut matches: Vec<Run> = self
            .runs()?
            .into_iter()
            .filter(|run| run.id.starts_with(id))
            .collect();
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(anyhow!("no run matching '{}'", id)),
            n => Err(anyhow!("'{}' matches {} runs", id, n)),
        }
    }

    /// All runs, oldest first.
    pub fn runs(&self) -> Result<Vec<Run>> {
        runs_in(&self.runs_dir)
    }

    pub fn runs_with_status(&self, statuses: &[RunStatus]) -> Result<Vec<Run>> {
        Ok(self
            .runs()?
            .into_iter()
            .filter(|run| statuses.contains(&run.status()))
            .collect())
    }
}
