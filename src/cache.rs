use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};

/// Per-TU fragment cache rooted at `<output-dir>/cache`.
///
/// `ipm/` and `icg/` mirror the source tree with one fragment file per TU;
/// `lmt/` holds the decimal last-modified time the fragments were extracted
/// at. The `lmt` file is written only after both fragments exist, so an
/// interrupted extraction never leaves a TU that looks fresh.
#[derive(Clone, Debug)]
pub(crate) struct FragmentCache {
    root: PathBuf,
}

impl FragmentCache {
    pub(crate) fn new(output_dir: &Path) -> Self {
        Self {
            root: output_dir.join("cache"),
        }
    }

    pub(crate) fn ensure_layout(&self) -> Result<()> {
        for kind in ["ipm", "icg", "lmt"] {
            let dir = self.root.join(kind);
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create cache directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub(crate) fn ipm_dir(&self) -> PathBuf {
        self.root.join("ipm")
    }

    pub(crate) fn icg_dir(&self) -> PathBuf {
        self.root.join("icg")
    }

    pub(crate) fn ipm_path(&self, source: &Path) -> PathBuf {
        self.mirrored("ipm", source, "json")
    }

    pub(crate) fn icg_path(&self, source: &Path) -> PathBuf {
        self.mirrored("icg", source, "json")
    }

    fn lmt_path(&self, source: &Path) -> PathBuf {
        self.mirrored("lmt", source, "lmt")
    }

    // cache/<kind>/<source path with root stripped>.<ext>
    fn mirrored(&self, kind: &str, source: &Path, extension: &str) -> PathBuf {
        let mut mirrored = self.root.join(kind);
        for component in source.components() {
            if let Component::Normal(part) = component {
                mirrored.push(part);
            }
        }
        let file_name = mirrored
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        mirrored.set_file_name(format!("{file_name}.{extension}"));
        mirrored
    }

    /// Both fragments exist and the recorded mtime matches the source.
    pub(crate) fn is_fresh(&self, source: &Path) -> Result<bool> {
        if !self.ipm_path(source).exists() || !self.icg_path(source).exists() {
            return Ok(false);
        }
        let recorded = match fs::read_to_string(self.lmt_path(source)) {
            Ok(recorded) => recorded,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read cache stamp for {}", source.display())
                });
            }
        };
        Ok(recorded.trim() == mtime_string(source)?)
    }

    /// Drop exactly this TU's fragments and stamp.
    pub(crate) fn invalidate(&self, source: &Path) -> Result<()> {
        for path in [
            self.lmt_path(source),
            self.ipm_path(source),
            self.icg_path(source),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to remove {}", path.display()));
                }
            }
        }
        Ok(())
    }

    /// Record the source mtime after both fragments have been written.
    pub(crate) fn commit(&self, source: &Path) -> Result<()> {
        let path = self.lmt_path(source);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&path, mtime_string(source)?)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Create parent directories for a TU's fragment outputs.
    pub(crate) fn prepare(&self, source: &Path) -> Result<()> {
        for path in [self.ipm_path(source), self.icg_path(source)] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        Ok(())
    }
}

fn mtime_string(source: &Path) -> Result<String> {
    let metadata = fs::metadata(source)
        .with_context(|| format!("failed to stat {}", source.display()))?;
    let modified = metadata
        .modified()
        .with_context(|| format!("no mtime for {}", source.display()))?;
    let since_epoch = modified
        .duration_since(UNIX_EPOCH)
        .context("mtime before epoch")?;
    Ok(since_epoch.as_secs().to_string())
}
