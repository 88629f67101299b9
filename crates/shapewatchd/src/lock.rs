use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs2::FileExt;

/// Exclusive hold on the workspace's registry files. Released on drop.
#[derive(Debug)]
pub struct DaemonLock {
    file: File,
    path: PathBuf,
}

impl DaemonLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock directory {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        if let Err(err) = file.try_lock_exclusive() {
            bail!(
                "registry at {} is in use by another shapewatchd process ({err})",
                path.display()
            );
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn second_acquire_fails_until_first_is_dropped() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join(".shapewatch/daemon.lock");

        let first = DaemonLock::acquire(&path).expect("first lock");
        assert_eq!(first.path(), path.as_path());
        assert!(DaemonLock::acquire(&path).is_err());

        drop(first);
        DaemonLock::acquire(&path).expect("lock after release");
    }
}
