//! Two-phase replacement of install targets.
//!
//! Phase one stages a copy of every verified artifact next to its target
//! (`.<name>.updraft-new`). Only when every target staged cleanly does phase
//! two swap them in: the original is renamed aside (`.<name>.updraft-old`),
//! the staged copy renamed into place, and the originals deleted once every
//! swap committed. A failed swap restores its own original and rolls back the
//! swaps committed before it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use updraft_backend::{InstallTarget, InstallTargets, TargetError};

use crate::atomic::remove_path;
use crate::error::AssetError;
use crate::signature::sidecar_path;

pub(crate) const STAGING_SUFFIX: &str = ".updraft-new";
pub(crate) const BACKUP_SUFFIX: &str = ".updraft-old";

/// A fixed list of install targets.
#[derive(Debug, Clone, Default)]
pub struct StaticTargets(pub Vec<InstallTarget>);

impl InstallTargets for StaticTargets {
    fn targets(&self) -> Result<Vec<InstallTarget>, TargetError> {
        Ok(self.0.clone())
    }
}

/// One file system entry to replace.
#[derive(Debug)]
struct Swap {
    target: String,
    source: PathBuf,
    dest: PathBuf,
    staged: PathBuf,
    backup: PathBuf,
}

impl Swap {
    fn new(target: &str, source: PathBuf, dest: PathBuf) -> Self {
        Self {
            target: target.to_string(),
            staged: sibling(&dest, STAGING_SUFFIX),
            backup: sibling(&dest, BACKUP_SUFFIX),
            source,
            dest,
        }
    }
}

#[derive(Debug)]
struct Committed<'a> {
    swap: &'a Swap,
    had_original: bool,
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}{suffix}"))
}

/// Replace every target with its artifact, or none of them.
///
/// Each unit's signature sidecar travels with it so the next update can
/// check signer continuity.
pub(crate) fn install_units(
    units: &[(InstallTarget, PathBuf)],
) -> Result<BTreeMap<String, PathBuf>, BTreeMap<String, AssetError>> {
    let mut swaps = Vec::new();
    for (target, artifact) in units {
        swaps.push(Swap::new(&target.name, artifact.clone(), target.path.clone()));
        let signature = sidecar_path(artifact);
        if signature.exists() {
            swaps.push(Swap::new(&target.name, signature, sidecar_path(&target.path)));
        }
    }

    for swap in &swaps {
        recover(swap);
    }

    let failures = stage_all(&swaps);
    if !failures.is_empty() {
        discard_staged(&swaps);
        return Err(failures);
    }

    commit_all(&swaps)?;

    for swap in &swaps {
        if let Err(error) = remove_path(&swap.backup) {
            warn!(
                "Failed to remove backup {} (will retry next install): {error}",
                swap.backup.display()
            );
        }
    }

    info!("Installed {} target(s)", units.len());
    Ok(units
        .iter()
        .map(|(target, _)| (target.name.clone(), target.path.clone()))
        .collect())
}

/// Undo what an interrupted install left behind for `swap`.
fn recover(swap: &Swap) {
    if swap.backup.exists() {
        if swap.dest.exists() {
            debug!("Removing stale backup {}", swap.backup.display());
            if let Err(error) = remove_path(&swap.backup) {
                warn!("Failed to remove {}: {error}", swap.backup.display());
            }
        } else {
            warn!("Restoring {} from an interrupted install", swap.dest.display());
            if let Err(error) = std::fs::rename(&swap.backup, &swap.dest) {
                warn!("Failed to restore {}: {error}", swap.dest.display());
            }
        }
    }
    if let Err(error) = remove_path(&swap.staged) {
        warn!("Failed to remove {}: {error}", swap.staged.display());
    }
}

fn stage_all(swaps: &[Swap]) -> BTreeMap<String, AssetError> {
    let mut failures = BTreeMap::new();
    for swap in swaps {
        if failures.contains_key(&swap.target) {
            continue;
        }
        if let Err(error) = stage(swap) {
            warn!("Staging {} failed: {error}", swap.target);
            failures.insert(swap.target.clone(), error);
        }
    }
    failures
}

fn stage(swap: &Swap) -> Result<(), AssetError> {
    let source =
        std::fs::symlink_metadata(&swap.source).map_err(|_| AssetError::MissingArtifact {
            name: swap.target.clone(),
        })?;

    let parent = swap
        .dest
        .parent()
        .filter(|parent| parent.is_dir())
        .ok_or_else(|| {
            AssetError::install(
                "validate",
                &swap.target,
                format!("{} has no existing parent directory", swap.dest.display()),
            )
        })?;

    if let Ok(existing) = std::fs::symlink_metadata(&swap.dest)
        && existing.is_dir() != source.is_dir()
    {
        return Err(AssetError::install(
            "validate",
            &swap.target,
            format!(
                "{} cannot replace {}: one is a directory and the other is not",
                swap.source.display(),
                swap.dest.display()
            ),
        ));
    }

    debug!("Staging {} into {}", swap.source.display(), parent.display());
    copy_entry(&swap.source, &swap.staged)
        .map_err(|error| AssetError::install("stage", &swap.target, error))
}

fn commit_all(swaps: &[Swap]) -> Result<(), BTreeMap<String, AssetError>> {
    let mut committed: Vec<Committed<'_>> = Vec::with_capacity(swaps.len());

    for swap in swaps {
        match commit(swap) {
            Ok(had_original) => committed.push(Committed { swap, had_original }),
            Err(error) => {
                warn!("Swap of {} failed, rolling back: {error}", swap.target);
                for done in committed.iter().rev() {
                    rollback(done);
                }
                discard_staged(swaps);
                return Err(BTreeMap::from([(swap.target.clone(), error)]));
            }
        }
    }
    Ok(())
}

fn commit(swap: &Swap) -> Result<bool, AssetError> {
    let had_original = swap.dest.symlink_metadata().is_ok();
    if had_original {
        std::fs::rename(&swap.dest, &swap.backup)
            .map_err(|error| AssetError::install("commit", &swap.target, error))?;
    }

    if let Err(error) = std::fs::rename(&swap.staged, &swap.dest) {
        if had_original {
            if let Err(restore) = std::fs::rename(&swap.backup, &swap.dest) {
                warn!(
                    "Failed to restore {} (kept at {}): {restore}",
                    swap.dest.display(),
                    swap.backup.display()
                );
            }
        }
        return Err(AssetError::install("commit", &swap.target, error));
    }
    Ok(had_original)
}

fn rollback(done: &Committed<'_>) {
    let swap = done.swap;
    if let Err(error) = remove_path(&swap.dest) {
        warn!("Failed to remove {}: {error}", swap.dest.display());
        return;
    }
    if done.had_original {
        if let Err(error) = std::fs::rename(&swap.backup, &swap.dest) {
            warn!(
                "Failed to restore {} (kept at {}): {error}",
                swap.dest.display(),
                swap.backup.display()
            );
        }
    }
}

fn discard_staged(swaps: &[Swap]) {
    for swap in swaps {
        if let Err(error) = remove_path(&swap.staged) {
            warn!("Failed to remove {}: {error}", swap.staged.display());
        }
    }
}

fn copy_entry(src: &Path, dest: &Path) -> std::io::Result<()> {
    let metadata = std::fs::symlink_metadata(src)?;

    #[cfg(unix)]
    if metadata.file_type().is_symlink() {
        let link = std::fs::read_link(src)?;
        return std::os::unix::fs::symlink(link, dest);
    }

    if metadata.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_entry(&entry.path(), &dest.join(entry.file_name()))?;
        }
        std::fs::set_permissions(dest, metadata.permissions())
    } else {
        std::fs::copy(src, dest).map(|_| ())
    }
}
