use async_trait::async_trait;
use std::path::Path;

use crate::error::{ArchiveError, NetworkError, TargetError, VerifyError};
use crate::types::{InstallTarget, SignatureIdentity};

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<Vec<u8>, NetworkError>;

    /// Stream `url` into `dest`, returning the number of bytes written.
    ///
    /// The default buffers the whole body through [`HttpClient::get`];
    /// implementations backed by a streaming client should override it.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64, NetworkError> {
        let bytes = self.get(url).await?;
        std::fs::write(dest, &bytes).map_err(|error| NetworkError::io(dest, &error))?;
        Ok(bytes.len() as u64)
    }
}

pub trait ArchiveDecoder: Send + Sync {
    fn is_archive(&self, path: &Path) -> bool;

    /// Unpack `archive` into the existing directory `dest`.
    ///
    /// # Errors
    /// Returns an error if the archive cannot be read or an entry cannot be
    /// written.
    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ArchiveError>;
}

pub trait SignatureVerifier: Send + Sync {
    /// Check that `artifact` carries a valid trusted signature.
    ///
    /// When `installed` is given, the signer must also be the identity that
    /// signed the currently installed unit at that path.
    ///
    /// # Errors
    /// Returns an error when the signature is missing, invalid, untrusted or
    /// signed by a different identity than the installed unit.
    fn verify(
        &self,
        artifact: &Path,
        installed: Option<&Path>,
    ) -> Result<SignatureIdentity, VerifyError>;
}

pub trait InstallTargets: Send + Sync {
    /// Enumerate the locations a release replaces.
    ///
    /// # Errors
    /// Returns an error when the current installation cannot be located.
    fn targets(&self) -> Result<Vec<InstallTarget>, TargetError>;
}

pub trait Relauncher: Send + Sync {
    /// Start a fresh process from `target`.
    ///
    /// # Errors
    /// Returns an error when the new process cannot be spawned.
    fn relaunch(&self, target: &InstallTarget) -> Result<(), std::io::Error>;
}
