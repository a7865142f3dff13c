use std::path::{Path, PathBuf};

use log::info;
use updraft_backend::{InstallTarget, InstallTargets, Relauncher, TargetError};

/// The installation the running process was started from.
///
/// On macOS this is the enclosing `.app` bundle; elsewhere it is the
/// executable itself.
#[derive(Debug, Clone, Default)]
pub struct CurrentInstall;

impl CurrentInstall {
    fn locate() -> Result<PathBuf, TargetError> {
        let exe = std::env::current_exe().map_err(|error| TargetError::Unavailable {
            details: format!("failed to get current executable: {error}"),
        })?;

        // After an in-place replacement, /proc/self/exe points at the old
        // unlinked inode and gains a " (deleted)" suffix.
        #[cfg(target_os = "linux")]
        let exe = strip_deleted_suffix(exe);

        #[cfg(target_os = "macos")]
        {
            enclosing_app_bundle(&exe)
        }

        #[cfg(not(target_os = "macos"))]
        {
            Ok(exe)
        }
    }
}

impl InstallTargets for CurrentInstall {
    fn targets(&self) -> Result<Vec<InstallTarget>, TargetError> {
        let path = Self::locate()?;
        let target = InstallTarget::from_path(&path).ok_or_else(|| TargetError::Unavailable {
            details: format!("{} has no file name", path.display()),
        })?;
        Ok(vec![target])
    }
}

impl Relauncher for CurrentInstall {
    fn relaunch(&self, target: &InstallTarget) -> Result<(), std::io::Error> {
        info!("Relaunching from: {}", target.path.display());
        spawn_fresh(&target.path)
    }
}

#[cfg(target_os = "macos")]
fn spawn_fresh(path: &Path) -> Result<(), std::io::Error> {
    if path.extension().and_then(|e| e.to_str()) == Some("app") {
        std::process::Command::new("open")
            .args(["-n", &path.to_string_lossy()])
            .spawn()?;
    } else {
        std::process::Command::new(path).spawn()?;
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn spawn_fresh(path: &Path) -> Result<(), std::io::Error> {
    std::process::Command::new(path).spawn()?;
    Ok(())
}

#[cfg(any(target_os = "macos", test))]
fn enclosing_app_bundle(exe: &Path) -> Result<PathBuf, TargetError> {
    let mut path = exe;
    loop {
        if path.extension().and_then(|e| e.to_str()) == Some("app") {
            return Ok(path.to_path_buf());
        }
        path = path.parent().ok_or_else(|| TargetError::Unavailable {
            details: "Current executable is not inside a .app bundle".to_string(),
        })?;
    }
}

#[cfg(any(target_os = "linux", test))]
fn strip_deleted_suffix(exe: PathBuf) -> PathBuf {
    let path_str = exe.to_string_lossy();
    if let Some(stripped) = path_str.strip_suffix(" (deleted)") {
        let fixed = PathBuf::from(stripped);
        info!("Adjusted exe path from deleted inode: {}", fixed.display());
        fixed
    } else {
        exe
    }
}
