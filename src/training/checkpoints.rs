//! On-disk checkpoint store
//!
//! A checkpoint root holds one directory per checkpoint, named
//! `ckpt_step_<N>` after the number of steps completed when it was written.
//! Directories are assembled under a hidden temporary name and renamed into
//! place once complete; `manifest.json` is written last and lists every
//! payload file, so a directory without a readable manifest, or missing a
//! listed file, is incomplete and never selected for restore.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::utils::io;

/// Prefix of committed checkpoint directories
pub const CHECKPOINT_PREFIX: &str = "ckpt_step_";

/// Prefix of checkpoint directories still being written
pub const TEMP_PREFIX: &str = ".tmp_ckpt_step_";

/// Name of the commit marker inside a checkpoint directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Commit record of a checkpoint directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    /// Steps completed when the checkpoint was written
    pub step: usize,

    /// Epoch the checkpoint was written in
    pub epoch: usize,

    /// Payload files, relative to the checkpoint directory
    pub files: Vec<String>,

    /// Commit time
    pub created_at: DateTime<Utc>,

    /// Crate version that wrote the checkpoint
    pub version: String,
}

/// A committed checkpoint directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    /// Steps completed when the checkpoint was written
    pub step: usize,

    /// Checkpoint directory
    pub path: PathBuf,
}

impl CheckpointInfo {
    /// Path of a payload file inside the checkpoint
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

/// Filesystem side of checkpointing: naming, atomic commit, discovery and
/// retention. What goes into a checkpoint is decided by the caller.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Checkpoint root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a checkpoint at `step` is committed to
    pub fn checkpoint_dir(&self, step: usize) -> PathBuf {
        self.root.join(format!("{CHECKPOINT_PREFIX}{step}"))
    }

    fn temp_dir(&self, step: usize) -> PathBuf {
        self.root.join(format!("{TEMP_PREFIX}{step}"))
    }

    /// Step encoded in a committed checkpoint directory name
    pub fn parse_step(name: &str) -> Option<usize> {
        name.strip_prefix(CHECKPOINT_PREFIX)?.parse().ok()
    }

    /// Committed checkpoint directories, ascending by step.
    ///
    /// Only directory names are inspected; use [`CheckpointStore::validate`]
    /// before trusting the contents.
    pub fn list(&self) -> Result<Vec<CheckpointInfo>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(Self::parse_step) {
                Some(step) => checkpoints.push(CheckpointInfo {
                    step,
                    path: entry.path(),
                }),
                None => debug!("Ignoring non-checkpoint entry {:?}", name),
            }
        }
        checkpoints.sort_by_key(|info| info.step);
        Ok(checkpoints)
    }

    /// Check that a checkpoint was fully committed
    pub fn validate(&self, info: &CheckpointInfo) -> Result<CheckpointManifest> {
        let manifest_path = info.file(MANIFEST_FILE);
        let bytes = fs::read(&manifest_path)
            .map_err(|err| Error::checkpoint_corruption(&info.path, format!("unreadable manifest: {err}")))?;
        let manifest: CheckpointManifest = serde_json::from_slice(&bytes)
            .map_err(|err| Error::checkpoint_corruption(&info.path, format!("invalid manifest: {err}")))?;

        if manifest.step != info.step {
            return Err(Error::checkpoint_corruption(
                &info.path,
                format!("manifest step {} does not match directory name", manifest.step),
            ));
        }
        if let Some(missing) = manifest.files.iter().find(|file| !info.file(file).is_file()) {
            return Err(Error::checkpoint_corruption(
                &info.path,
                format!("missing payload file {missing}"),
            ));
        }
        Ok(manifest)
    }

    /// Committed checkpoints that pass validation, newest first
    pub fn valid_candidates(&self) -> Result<Vec<(CheckpointInfo, CheckpointManifest)>> {
        let mut candidates = Vec::new();
        for info in self.list()?.into_iter().rev() {
            match self.validate(&info) {
                Ok(manifest) => candidates.push((info, manifest)),
                Err(err) => warn!("Skipping checkpoint: {err}"),
            }
        }
        Ok(candidates)
    }

    /// Newest checkpoint that passes validation
    pub fn latest_valid(&self) -> Result<Option<(CheckpointInfo, CheckpointManifest)>> {
        Ok(self.valid_candidates()?.into_iter().next())
    }

    /// Write and commit the checkpoint for `step`.
    ///
    /// `write` fills a fresh temporary directory with payload files. The
    /// manifest is then written and the directory is renamed into place,
    /// replacing any previous checkpoint with the same step.
    pub fn save<F>(&self, step: usize, epoch: usize, write: F) -> Result<CheckpointInfo>
    where
        F: FnOnce(&Path) -> anyhow::Result<()>,
    {
        io::ensure_dir_exists(&self.root)?;

        let temp = self.temp_dir(step);
        if temp.exists() {
            fs::remove_dir_all(&temp)?;
        }
        fs::create_dir_all(&temp)?;

        write(&temp).with_context(|| format!("Failed to write checkpoint payload for step {step}"))?;

        let mut files = Vec::new();
        for entry in fs::read_dir(&temp)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        files.sort();

        let manifest = CheckpointManifest {
            step,
            epoch,
            files,
            created_at: Utc::now(),
            version: crate::VERSION.to_string(),
        };
        io::write_json(temp.join(MANIFEST_FILE), &manifest)?;

        let target = self.checkpoint_dir(step);
        if target.exists() {
            warn!("Replacing existing checkpoint {}", target.display());
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&temp, &target)?;
        info!("Saved checkpoint {}", target.display());

        Ok(CheckpointInfo { step, path: target })
    }

    /// Delete the oldest committed checkpoints beyond `max_to_keep`
    pub fn prune(&self, max_to_keep: usize) -> Result<Vec<PathBuf>> {
        let checkpoints = self.list()?;
        let excess = checkpoints.len().saturating_sub(max_to_keep);
        let mut removed = Vec::with_capacity(excess);
        for info in checkpoints.into_iter().take(excess) {
            fs::remove_dir_all(&info.path)?;
            debug!("Removed old checkpoint {}", info.path.display());
            removed.push(info.path);
        }
        Ok(removed)
    }

    /// Delete temporary directories left behind by interrupted writes
    pub fn clean_stale(&self) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let stale = entry.file_name().to_str().is_some_and(|name| name.starts_with(TEMP_PREFIX));
            if stale && entry.file_type()?.is_dir() {
                warn!("Removing incomplete checkpoint {}", entry.path().display());
                fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
