use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// An on-disk location that a release replaces when it is installed.
///
/// `name` is the file name an extracted artifact must carry to be considered
/// the replacement for this target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstallTarget {
    pub name: String,
    pub path: PathBuf,
}

impl InstallTarget {
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let name = path.file_name()?.to_str()?.to_string();
        Some(Self { name, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for InstallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.path.display())
    }
}

/// Identity of the key that produced a valid signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureIdentity(pub String);

impl SignatureIdentity {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SignatureIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::InstallTarget;

    #[test]
    fn install_target_from_path_uses_file_name() {
        let target = InstallTarget::from_path("/Applications/Updraft.app")
            .expect("path with a file name should produce a target");
        assert_eq!(target.name, "Updraft.app");
        assert_eq!(
            target.to_string(),
            "Updraft.app (/Applications/Updraft.app)"
        );
    }

    #[test]
    fn install_target_from_root_path_is_none() {
        assert!(InstallTarget::from_path("/").is_none());
    }
}
