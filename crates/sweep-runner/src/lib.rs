pub mod batch;
pub mod batch_file;
pub mod config;
pub mod error;
pub mod expand;
pub mod flags;
pub mod lock;
pub mod queue;
pub mod run;
pub mod seq;
pub mod shutdown;
pub mod space;
pub mod trial;

pub use batch::{BatchRunner, TrialsMode};
pub use config::{Config, DispatchMode};
pub use error::{exit_code, exit_code_for, SweepError};
pub use flags::{decode_flag_val, encode_flag_val, Flags};
pub use lock::{FileLock, MemoryLock, StatusLock};
pub use queue::{Queue, QueueConfig};
pub use run::{Run, RunStatus, RunStore};
pub use shutdown::Shutdown;
pub use trial::{CommandLauncher, Launcher, TrialOutcome, TrialRunner};

use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::Path;

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes `bytes` to a sibling temp file and renames it over `path`, so
/// readers see either the old or the new content.
pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Copies `src` into `dst`, skipping top-level entries named in `exclude`.
/// Symlinks are recreated as links rather than followed.
pub(crate) fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[&str]) -> Result<()> {
    let walker = walkdir::WalkDir::new(src).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(src).unwrap_or(e.path());
        if rel.as_os_str().is_empty() {
            return true;
        }
        !exclude.iter().any(|ex| rel.starts_with(ex))
    });
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        let rel = match path.strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_symlink() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            let link_target = fs::read_link(path)?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            #[cfg(unix)]
            symlink(&link_target, &target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(path, target)?;
        }
    }
    Ok(())
}

/// Hex sha256 over the relative paths and contents of every file under `dir`.
pub(crate) fn files_digest(dir: &Path) -> Result<String> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    let mut hasher = Sha256::new();
    for path in files {
        let rel = path.strip_prefix(dir).unwrap_or(&path);
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(fs::read(&path)?);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
pub(crate) fn test_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "sweep_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    ensure_dir(&dir).expect("temp test dir");
    dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_dir_filtered_skips_excluded_and_keeps_links() {
        let root = test_dir("copy");
        let src = root.join("src");
        ensure_dir(&src.join("sub")).expect("src dirs");
        ensure_dir(&src.join("skip")).expect("skip dir");
        fs::write(src.join("a.txt"), "a").expect("a");
        fs::write(src.join("sub").join("b.txt"), "b").expect("b");
        fs::write(src.join("skip").join("c.txt"), "c").expect("c");
        symlink("a.txt", src.join("link")).expect("link");

        let dst = root.join("dst");
        copy_dir_filtered(&src, &dst, &["skip"]).expect("copy");
        assert_eq!(fs::read_to_string(dst.join("sub").join("b.txt")).expect("b"), "b");
        assert!(!dst.join("skip").exists());
        assert_eq!(
            fs::read_link(dst.join("link")).expect("link copied"),
            Path::new("a.txt")
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn files_digest_tracks_content() {
        let root = test_dir("digest");
        fs::write(root.join("main.py"), "print(1)").expect("write");
        let first = files_digest(&root).expect("digest");
        assert_eq!(first, files_digest(&root).expect("digest again"));
        fs::write(root.join("main.py"), "print(2)").expect("rewrite");
        assert_ne!(first, files_digest(&root).expect("digest changed"));
        let _ = fs::remove_dir_all(root);
    }
}
