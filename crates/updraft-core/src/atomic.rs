use std::io::Write;
use std::path::{Path, PathBuf};

/// Suffix of in-progress writes. [`crate::AssetStore::sweep`] deletes
/// anything ending in it, so a crash between write and rename leaves nothing
/// behind once the feed is next activated.
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

const TEMP_ATTEMPTS: u8 = 16;

/// Hidden sibling `.<name>.<pid>.<nanos>.<attempt>.tmp` of `path`. Process
/// id and timestamp keep concurrent writers from different processes apart;
/// `attempt` separates writers within one process.
fn temp_sibling(parent: &Path, file_name: &str, attempt: u8) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos());
    parent.join(format!(
        ".{file_name}.{}.{nanos}.{attempt}{TEMP_SUFFIX}",
        std::process::id()
    ))
}

/// Create a fresh temp sibling of `path` holding `data`, flushed to disk.
fn stage_temp(path: &Path, data: &[u8]) -> std::io::Result<PathBuf> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "marker path has no parent")
    })?;
    let file_name = path
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("marker");

    for attempt in 0..TEMP_ATTEMPTS {
        let temp = temp_sibling(parent, file_name, attempt);
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
        {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(error) => return Err(error),
        };
        if let Err(error) = file.write_all(data).and_then(|()| file.sync_all()) {
            let _ = std::fs::remove_file(&temp);
            return Err(error);
        }
        return Ok(temp);
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free temp name next to {}", path.display()),
    ))
}

/// Write `data` to `path` so readers only ever observe the old or the new
/// contents.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let temp = stage_temp(path, data)?;
    replace_file(&temp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&temp);
    })
}

pub(crate) fn replace_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::ffi::OsStrExt;
        use windows_sys::Win32::Storage::FileSystem::{
            MOVEFILE_REPLACE_EXISTING, MOVEFILE_WRITE_THROUGH, MoveFileExW,
        };

        let src_utf16: Vec<u16> = src
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let dst_utf16: Vec<u16> = dst
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: both paths are NUL-terminated UTF-16 buffers that live for
        // the duration of the FFI call.
        let moved = unsafe {
            MoveFileExW(
                src_utf16.as_ptr(),
                dst_utf16.as_ptr(),
                MOVEFILE_REPLACE_EXISTING | MOVEFILE_WRITE_THROUGH,
            )
        };
        if moved != 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::fs::rename(src, dst)
    }
}

/// Remove a file or directory tree, treating an already missing path as
/// success.
pub(crate) fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(error) => Err(error),
    };
    match result {
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
