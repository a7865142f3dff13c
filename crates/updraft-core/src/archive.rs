use std::path::Path;

use log::{debug, warn};
use updraft_backend::{ArchiveDecoder, ArchiveError};

/// Unpacks `.zip` release assets. Entries whose path would escape the
/// destination are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipDecoder;

impl ArchiveDecoder for ZipDecoder {
    fn is_archive(&self, path: &Path) -> bool {
        path.extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
    }

    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
        extract_zip(archive, dest)
    }
}

fn malformed(path: &Path, error: &zip::result::ZipError) -> ArchiveError {
    ArchiveError::Malformed {
        path: path.display().to_string(),
        details: error.to_string(),
    }
}

fn extract_zip(zip_path: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let file = std::fs::File::open(zip_path).map_err(|error| ArchiveError::io(zip_path, &error))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|error| malformed(zip_path, &error))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|error| malformed(zip_path, &error))?;
        let Some(name) = entry.enclosed_name() else {
            warn!("Skipping zip entry with unsafe path in {}", zip_path.display());
            continue;
        };
        let out_path = dest.join(name);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|error| ArchiveError::io(&out_path, &error))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| ArchiveError::io(parent, &error))?;
        }
        let mut outfile =
            std::fs::File::create(&out_path).map_err(|error| ArchiveError::io(&out_path, &error))?;
        std::io::copy(&mut entry, &mut outfile)
            .map_err(|error| ArchiveError::io(&out_path, &error))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                let _ = std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode));
            }
        }
    }

    debug!("Extraction complete to {}", dest.display());
    Ok(())
}
